//! Origin tables
//!
//! An `OriginTable` owns every route one protocol injected for one
//! generation. Best-route selection happens above; origin tables are
//! plain keyed storage with replace-on-add semantics. When a protocol's
//! session resets, its table is retired whole into a
//! [`DeletionTable`](crate::deletion::DeletionTable) and a fresh table
//! with a bumped generation takes its place.

use std::collections::BTreeMap;

use crate::addr::RibAddr;
use crate::route::{ProtocolHandle, RouteEntry};

#[derive(Debug)]
pub struct OriginTable<A: RibAddr> {
    protocol: ProtocolHandle,
    generation: u32,
    routes: BTreeMap<A::Net, RouteEntry<A>>,
}

impl<A: RibAddr> OriginTable<A> {
    pub fn new(protocol: ProtocolHandle, generation: u32) -> OriginTable<A> {
        OriginTable {
            protocol,
            generation,
            routes: BTreeMap::new(),
        }
    }

    pub fn protocol(&self) -> &ProtocolHandle {
        &self.protocol
    }

    /// Monotonic within a process lifetime, bumped per retire/rebuild.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Insert or replace. Returns the displaced route, if any.
    pub fn add_route(&mut self, route: RouteEntry<A>) -> Option<RouteEntry<A>> {
        self.routes.insert(route.net, route)
    }

    pub fn delete_route(&mut self, net: &A::Net) -> Option<RouteEntry<A>> {
        self.routes.remove(net)
    }

    pub fn lookup_route(&self, net: &A::Net) -> Option<&RouteEntry<A>> {
        self.routes.get(net)
    }

    pub fn routes(&self) -> impl Iterator<Item = &RouteEntry<A>> {
        self.routes.values()
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Remove and return the first route in prefix order. Drain order
    /// for deletion tables.
    pub(crate) fn pop_first_route(&mut self) -> Option<RouteEntry<A>> {
        let net = *self.routes.keys().next()?;
        self.routes.remove(&net)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn table() -> OriginTable<Ipv4Addr> {
        OriginTable::new(ProtocolHandle::new("ospf"), 1)
    }

    fn route(net: &str, metric: u32) -> RouteEntry<Ipv4Addr> {
        RouteEntry::new(
            net.parse().unwrap(),
            "192.0.2.1".parse().unwrap(),
            ProtocolHandle::new("ospf"),
            metric,
        )
    }

    #[test]
    fn test_add_replace_delete() {
        let mut t = table();
        assert!(t.add_route(route("10.0.0.0/8", 1)).is_none());
        assert_eq!(t.route_count(), 1);

        // Replace-on-add returns the displaced route.
        let old = t.add_route(route("10.0.0.0/8", 2)).unwrap();
        assert_eq!(old.metric, 1);
        assert_eq!(t.route_count(), 1);
        assert_eq!(t.lookup_route(&"10.0.0.0/8".parse().unwrap()).unwrap().metric, 2);

        assert!(t.delete_route(&"10.0.0.0/8".parse().unwrap()).is_some());
        assert!(t.delete_route(&"10.0.0.0/8".parse().unwrap()).is_none());
        assert!(t.is_empty());
    }

    #[test]
    fn test_pop_first_in_prefix_order() {
        let mut t = table();
        t.add_route(route("10.5.0.0/16", 1));
        t.add_route(route("10.0.0.0/8", 1));
        t.add_route(route("10.3.0.0/16", 1));

        let mut order = Vec::new();
        while let Some(r) = t.pop_first_route() {
            order.push(r.net.to_string());
        }
        assert_eq!(order, vec!["10.0.0.0/8", "10.3.0.0/16", "10.5.0.0/16"]);
    }
}
