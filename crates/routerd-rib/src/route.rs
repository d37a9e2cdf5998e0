//! Route entries and protocol handles

use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;

use crate::addr::RibAddr;

/// Handle naming the protocol a route originated from. Cheap to clone;
/// every route from one protocol shares the one allocation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolHandle(Rc<str>);

impl ProtocolHandle {
    pub fn new(name: &str) -> ProtocolHandle {
        ProtocolHandle(Rc::from(name))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProtocolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Default administrative distances by protocol name. Unknown
/// protocols sort last.
pub fn default_admin_distance(protocol: &str) -> u8 {
    match protocol {
        "connected" => 0,
        "static" => 1,
        "ebgp" => 20,
        "ospf" => 110,
        "rip" => 120,
        "olsr" => 130,
        "ibgp" => 200,
        _ => 254,
    }
}

/// OSPF path classification carried on routes that have one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PathType {
    IntraArea,
    InterArea,
    External1,
    External2,
}

/// One route as a protocol contributed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry<A: RibAddr> {
    pub net: A::Net,
    pub nexthop: A,
    /// Outgoing vif, empty until resolved.
    pub vif: String,
    pub protocol: ProtocolHandle,
    pub admin_distance: u8,
    pub metric: u32,
    pub policy_tags: BTreeSet<u32>,
    /// Dropped by an import filter but retained for bookkeeping.
    pub filtered: bool,
    pub path_type: Option<PathType>,
    /// OSPF external type 2 cost.
    pub type2_cost: Option<u32>,
}

impl<A: RibAddr> RouteEntry<A> {
    pub fn new(net: A::Net, nexthop: A, protocol: ProtocolHandle, metric: u32) -> RouteEntry<A> {
        let admin_distance = default_admin_distance(protocol.name());
        RouteEntry {
            net,
            nexthop,
            vif: String::new(),
            protocol,
            admin_distance,
            metric,
            policy_tags: BTreeSet::new(),
            filtered: false,
            path_type: None,
            type2_cost: None,
        }
    }

    /// Best-route comparison: admin distance, then OSPF path class,
    /// then metric (type 2 external cost first where present), with
    /// the protocol name as the final deterministic tie-break.
    pub fn is_better_than(&self, other: &RouteEntry<A>) -> bool {
        let key = |r: &RouteEntry<A>| {
            (
                r.admin_distance,
                r.path_type,
                r.type2_cost.unwrap_or(0),
                r.metric,
            )
        };
        match key(self).cmp(&key(other)) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Greater => false,
            std::cmp::Ordering::Equal => self.protocol.name() < other.protocol.name(),
        }
    }
}
