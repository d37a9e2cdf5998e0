//! Route redistribution
//!
//! `RedistTable` sits on top of one origin table and maintains the
//! `RouteIndex` (the set of prefixes currently live below). Each
//! `Redistributor` binds the table to one `RedistOutput` consumer and
//! materializes the table's content as a stream of adds and deletes,
//! starting with a background dump of the existing index.
//!
//! # Dump state machine
//!
//! ```text
//! READY ─start_dump→ DUMPING ─index_exhausted→ RUNNING
//!   │                    │
//!   │                    └─output.high_water→ DUMP_BLOCKED ─output.low_water→ DUMPING
//!   │
//! RUNNING ─high_water→ RUN_BLOCKED ─low_water→ RUNNING
//! ```
//!
//! Concurrent mutations during a dump follow the cursor: updates behind
//! (or at) the cursor propagate immediately, updates ahead only touch
//! the index and are picked up when the cursor reaches them. Nothing is
//! emitted twice and nothing is dropped; backpressure only pauses the
//! dump.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::ops::Bound;
use std::rc::Rc;

use tracing::{debug, info, warn};

use routerd_event::callback::callback0;
use routerd_event::pool::RefPool;
use routerd_event::task::{TaskHandle, TaskList, DEFAULT_WEIGHT};
use routerd_event::timer::priority;

use crate::addr::RibAddr;
use crate::error::{RibError, RibResult};
use crate::origin::OriginTable;
use crate::route::RouteEntry;

/// Consumer of one redistribution stream.
///
/// `add_route`/`delete_route` must accept every update (queue
/// internally under pressure); `backlog` and the water marks drive the
/// redistributor's pause/resume decisions.
pub trait RedistOutput<A: RibAddr> {
    fn add_route(&mut self, route: &RouteEntry<A>);
    fn delete_route(&mut self, net: &A::Net);
    /// The redistributor finished synthesizing teardown deletes.
    fn shutdown_complete(&mut self);
    fn backlog(&self) -> usize;
    fn high_water_backlog(&self) -> usize;
    fn low_water_backlog(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedistState {
    Ready,
    Dumping,
    DumpBlocked,
    Running,
    RunBlocked,
    Dead,
}

/// Progress report from one dump step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpProgress {
    /// Emitted one route; call again.
    Emitted,
    /// Output is above high water; wait for `output_ready`.
    Blocked,
    /// Index exhausted; the redistributor is now RUNNING.
    Finished,
    /// Not dumping (READY, RUNNING, or dead).
    Idle,
}

pub struct Redistributor<A: RibAddr> {
    name: String,
    output: Box<dyn RedistOutput<A>>,
    state: RedistState,
    /// Last prefix emitted by the dump.
    cursor: Option<A::Net>,
    /// Prefixes the output currently believes are present.
    announced: BTreeSet<A::Net>,
    /// Tags that must never flow to this consumer (protocol-to-self).
    non_redist_tags: BTreeSet<u32>,
}

impl<A: RibAddr> Redistributor<A> {
    fn new(name: &str, output: Box<dyn RedistOutput<A>>) -> Redistributor<A> {
        Redistributor {
            name: name.to_string(),
            output,
            state: RedistState::Ready,
            cursor: None,
            announced: BTreeSet::new(),
            non_redist_tags: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> RedistState {
        self.state
    }

    /// Prefixes made visible to the output so far.
    pub fn announced(&self) -> &BTreeSet<A::Net> {
        &self.announced
    }

    fn blocked(&self) -> bool {
        self.output.backlog() >= self.output.high_water_backlog()
    }

    fn drained(&self) -> bool {
        self.output.backlog() <= self.output.low_water_backlog()
    }

    fn emit_add(&mut self, route: &RouteEntry<A>) {
        if route
            .policy_tags
            .intersection(&self.non_redist_tags)
            .next()
            .is_some()
        {
            // Protocol-to-self loop: this consumer is the route's own
            // origin protocol.
            debug!(redist = %self.name, net = %route.net, "suppressing non-redist tagged route");
            return;
        }
        self.announced.insert(route.net);
        self.output.add_route(route);
        if self.blocked() {
            self.state = match self.state {
                RedistState::Dumping => RedistState::DumpBlocked,
                RedistState::Running => RedistState::RunBlocked,
                s => s,
            };
        }
    }

    fn emit_delete(&mut self, net: &A::Net) {
        if self.announced.remove(net) {
            self.output.delete_route(net);
        }
    }
}

/// A redist table chained on top of the origin table it mirrors.
pub struct RedistTable<A: RibAddr> {
    origin: OriginTable<A>,
    index: BTreeSet<A::Net>,
    redistributors: Vec<Redistributor<A>>,
}

impl<A: RibAddr> RedistTable<A> {
    pub fn new(origin: OriginTable<A>) -> RedistTable<A> {
        let index = origin.routes().map(|r| r.net).collect();
        RedistTable {
            origin,
            index,
            redistributors: Vec::new(),
        }
    }

    pub fn origin(&self) -> &OriginTable<A> {
        &self.origin
    }

    /// The RouteIndex: prefixes currently live below.
    pub fn route_index(&self) -> &BTreeSet<A::Net> {
        &self.index
    }

    /// Insert (or replace) a route and broadcast to all live consumers.
    pub fn add_route(&mut self, route: RouteEntry<A>) {
        let net = route.net;
        self.origin.add_route(route.clone());
        self.index.insert(net);

        for r in &mut self.redistributors {
            match r.state {
                RedistState::Running | RedistState::RunBlocked => r.emit_add(&route),
                RedistState::Dumping | RedistState::DumpBlocked => match r.cursor {
                    // At the cursor the dump already emitted it.
                    Some(cursor) if net == cursor => {}
                    // Behind the cursor: the dump will not come back.
                    Some(cursor) if net < cursor => r.emit_add(&route),
                    // Ahead of the cursor: the dump will reach it.
                    _ => {}
                },
                RedistState::Ready | RedistState::Dead => {}
            }
        }
    }

    /// Remove a route and broadcast the delete.
    pub fn delete_route(&mut self, net: &A::Net) {
        self.origin.delete_route(net);
        self.index.remove(net);

        for r in &mut self.redistributors {
            match r.state {
                RedistState::Running | RedistState::RunBlocked => r.emit_delete(net),
                RedistState::Dumping | RedistState::DumpBlocked => match r.cursor {
                    // The cursor itself deletes as if behind.
                    Some(cursor) if *net <= cursor => r.emit_delete(net),
                    _ => {}
                },
                RedistState::Ready | RedistState::Dead => {}
            }
        }
    }

    /// Attach a consumer. It stays READY until `start_dump`.
    pub fn add_redist(&mut self, name: &str, output: Box<dyn RedistOutput<A>>) -> RibResult<()> {
        if self.find(name).is_some() {
            return Err(RibError::RedistributorExists(name.to_string()));
        }
        self.redistributors.push(Redistributor::new(name, output));
        info!(redist = name, "redistributor attached");
        Ok(())
    }

    /// Tags this consumer must never receive (its own protocol's
    /// non-redist tags).
    pub fn set_non_redist_tags(&mut self, name: &str, tags: BTreeSet<u32>) -> RibResult<()> {
        let r = self.find_mut(name)?;
        r.non_redist_tags = tags;
        Ok(())
    }

    pub fn redist_state(&self, name: &str) -> RibResult<RedistState> {
        Ok(self.find(name).ok_or_else(|| RibError::UnknownRedistributor(name.into()))?.state)
    }

    pub fn announced(&self, name: &str) -> RibResult<&BTreeSet<A::Net>> {
        self.find(name)
            .map(|r| &r.announced)
            .ok_or_else(|| RibError::UnknownRedistributor(name.into()))
    }

    /// Begin dumping the current index to the consumer.
    pub fn start_dump(&mut self, name: &str) -> RibResult<()> {
        let r = self.find_mut(name)?;
        match r.state {
            RedistState::Ready => {
                r.state = RedistState::Dumping;
                r.cursor = None;
                debug!(redist = %r.name, "dump started");
                Ok(())
            }
            RedistState::Dumping | RedistState::DumpBlocked => {
                Err(RibError::DumpInProgress(name.to_string()))
            }
            RedistState::Dead => Err(RibError::RedistributorDead(name.to_string())),
            _ => Ok(()),
        }
    }

    /// Emit the next route of an in-progress dump.
    pub fn dump_step(&mut self, name: &str) -> RibResult<DumpProgress> {
        let i = self
            .position(name)
            .ok_or_else(|| RibError::UnknownRedistributor(name.to_string()))?;

        match self.redistributors[i].state {
            RedistState::Dumping => {}
            RedistState::DumpBlocked => return Ok(DumpProgress::Blocked),
            _ => return Ok(DumpProgress::Idle),
        }

        let next = {
            let r = &self.redistributors[i];
            let bound = match &r.cursor {
                Some(c) => Bound::Excluded(*c),
                None => Bound::Unbounded,
            };
            self.index.range((bound, Bound::Unbounded)).next().copied()
        };

        let Some(net) = next else {
            let r = &mut self.redistributors[i];
            r.state = RedistState::Running;
            debug!(redist = %r.name, announced = r.announced.len(), "dump finished");
            return Ok(DumpProgress::Finished);
        };

        let route = self
            .origin
            .lookup_route(&net)
            .cloned()
            .expect("route index out of sync with origin table");
        let r = &mut self.redistributors[i];
        r.cursor = Some(net);
        r.emit_add(&route);
        if r.state == RedistState::DumpBlocked {
            Ok(DumpProgress::Blocked)
        } else {
            Ok(DumpProgress::Emitted)
        }
    }

    /// The output drained to low water; resume a blocked consumer.
    pub fn output_ready(&mut self, name: &str) -> RibResult<()> {
        let r = self.find_mut(name)?;
        if !r.drained() {
            return Ok(());
        }
        r.state = match r.state {
            RedistState::DumpBlocked => RedistState::Dumping,
            RedistState::RunBlocked => RedistState::Running,
            s => s,
        };
        Ok(())
    }

    /// Tear a consumer down: synthesize one delete per announced prefix
    /// and mark it dead. Used when the output's channel fails or the
    /// subscriber leaves.
    pub fn shutdown_redist(&mut self, name: &str) -> RibResult<()> {
        let r = self.find_mut(name)?;
        if r.state == RedistState::Dead {
            return Err(RibError::RedistributorDead(name.to_string()));
        }
        warn!(redist = %r.name, prefixes = r.announced.len(), "redistributor shutting down");
        let announced: Vec<A::Net> = r.announced.iter().copied().collect();
        for net in announced {
            r.emit_delete(&net);
        }
        r.output.shutdown_complete();
        r.state = RedistState::Dead;
        Ok(())
    }

    /// Detach a dead or unwanted consumer entirely.
    pub fn remove_redist(&mut self, name: &str) -> RibResult<()> {
        let i = self
            .position(name)
            .ok_or_else(|| RibError::UnknownRedistributor(name.to_string()))?;
        self.redistributors.remove(i);
        Ok(())
    }

    fn find(&self, name: &str) -> Option<&Redistributor<A>> {
        self.redistributors.iter().find(|r| r.name == name)
    }

    fn find_mut(&mut self, name: &str) -> RibResult<&mut Redistributor<A>> {
        self.redistributors
            .iter_mut()
            .find(|r| r.name == name)
            .ok_or_else(|| RibError::UnknownRedistributor(name.to_string()))
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.redistributors.iter().position(|r| r.name == name)
    }
}

/// Drive a dump from a background task: one route per task turn, so
/// control-plane work never waits on dump replay. The task retires
/// when the dump finishes; a blocked dump keeps the task alive and
/// resumes after `output_ready`.
pub fn spawn_dump_task<A: RibAddr>(
    table: &Rc<RefCell<RedistTable<A>>>,
    name: &str,
    tasks: &TaskList,
    pool: &RefPool,
) -> RibResult<TaskHandle> {
    table.borrow_mut().start_dump(name)?;
    let table = Rc::clone(table);
    let name = name.to_string();
    Ok(tasks.new_task(
        callback0(pool, move || {
            match table.borrow_mut().dump_step(&name) {
                Ok(DumpProgress::Emitted) | Ok(DumpProgress::Blocked) => true,
                Ok(DumpProgress::Finished) | Ok(DumpProgress::Idle) => false,
                Err(e) => {
                    warn!(redist = %name, error = %e, "dump task stopping");
                    false
                }
            }
        }),
        priority::BACKGROUND,
        DEFAULT_WEIGHT,
    ))
}
