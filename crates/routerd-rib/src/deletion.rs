//! Deletion tables
//!
//! When a protocol bumps its generation (session reset, reconfigure),
//! its old origin table is wrapped in a `DeletionTable` that feeds
//! synthesized `delete_route` events downstream at background priority
//! and then retires itself. The RIB converges on the new generation
//! without ever blocking control-plane work on a bulk teardown.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, info};

use routerd_event::callback::{callback0, Callback1};
use routerd_event::pool::RefPool;
use routerd_event::task::{TaskHandle, TaskList, DEFAULT_WEIGHT};
use routerd_event::timer::priority;

use crate::addr::RibAddr;
use crate::origin::OriginTable;
use crate::route::RouteEntry;

pub struct DeletionTable<A: RibAddr> {
    retired: OriginTable<A>,
    /// Generation that replaced the retired one.
    superseding_generation: u32,
}

impl<A: RibAddr> DeletionTable<A> {
    /// Wrap a retired origin table. `superseding_generation` is the
    /// generation of the table that replaced it.
    pub fn new(retired: OriginTable<A>, superseding_generation: u32) -> DeletionTable<A> {
        debug_assert!(superseding_generation > retired.generation());
        debug!(
            protocol = %retired.protocol(),
            old_generation = retired.generation(),
            superseding_generation,
            routes = retired.route_count(),
            "origin table retired for deletion"
        );
        DeletionTable {
            retired,
            superseding_generation,
        }
    }

    pub fn superseding_generation(&self) -> u32 {
        self.superseding_generation
    }

    pub fn remaining(&self) -> usize {
        self.retired.route_count()
    }

    pub fn is_drained(&self) -> bool {
        self.retired.is_empty()
    }

    /// Take the next route to synthesize a delete for, prefix order.
    pub fn drain_one(&mut self) -> Option<RouteEntry<A>> {
        self.retired.pop_first_route()
    }
}

/// Drain a deletion table from a background task, one synthesized
/// delete per turn through `sink`. The task retires itself when the
/// table is empty.
pub fn spawn_drain_task<A: RibAddr>(
    table: Rc<RefCell<DeletionTable<A>>>,
    sink: Callback1<(), RouteEntry<A>>,
    tasks: &TaskList,
    pool: &RefPool,
) -> TaskHandle {
    tasks.new_task(
        callback0(pool, move || {
            let route = table.borrow_mut().drain_one();
            match route {
                Some(route) => {
                    sink.dispatch(route);
                    !table.borrow().is_drained()
                }
                None => {
                    info!("deletion table drained");
                    false
                }
            }
        }),
        priority::BACKGROUND,
        DEFAULT_WEIGHT,
    )
}
