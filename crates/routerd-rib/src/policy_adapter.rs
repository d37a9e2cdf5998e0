//! Route-to-policy adapter
//!
//! Wraps a [`RouteEntry`] as the variable map the policy VM evaluates,
//! mapping the well-known variable IDs onto route fields. The RIB
//! wraps routes in this adapter before presenting them to any filter
//! stage.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, Ipv6Addr};

use routerd_policy::{var, Element, PolicyError, PolicyResult, VarId, VarRW};

use crate::addr::RibAddr;
use crate::route::RouteEntry;

/// Per-family bridging between route fields and policy elements.
pub trait PolicyAddr: RibAddr {
    fn net_element(net: &Self::Net) -> Element;
    fn addr_element(addr: &Self) -> Element;
    fn addr_from_element(e: &Element) -> Option<Self>;
    /// The well-known variable IDs for this family's prefix and
    /// next hop.
    const NETWORK_VAR: VarId;
    const NEXTHOP_VAR: VarId;
}

impl PolicyAddr for Ipv4Addr {
    fn net_element(net: &Self::Net) -> Element {
        Element::Ipv4Net(*net)
    }
    fn addr_element(addr: &Self) -> Element {
        Element::Ipv4(*addr)
    }
    fn addr_from_element(e: &Element) -> Option<Ipv4Addr> {
        match e {
            Element::Ipv4(a) => Some(*a),
            _ => None,
        }
    }
    const NETWORK_VAR: VarId = var::NETWORK4;
    const NEXTHOP_VAR: VarId = var::NEXTHOP4;
}

impl PolicyAddr for Ipv6Addr {
    fn net_element(net: &Self::Net) -> Element {
        Element::Ipv6Net(*net)
    }
    fn addr_element(addr: &Self) -> Element {
        Element::Ipv6(*addr)
    }
    fn addr_from_element(e: &Element) -> Option<Ipv6Addr> {
        match e {
            Element::Ipv6(a) => Some(*a),
            _ => None,
        }
    }
    const NETWORK_VAR: VarId = var::NETWORK6;
    const NEXTHOP_VAR: VarId = var::NEXTHOP6;
}

/// A route presented as policy variables.
pub struct RouteVarRW<'a, A: PolicyAddr> {
    route: &'a mut RouteEntry<A>,
}

impl<'a, A: PolicyAddr> RouteVarRW<'a, A> {
    pub fn new(route: &'a mut RouteEntry<A>) -> RouteVarRW<'a, A> {
        RouteVarRW { route }
    }
}

impl<A: PolicyAddr> VarRW for RouteVarRW<'_, A> {
    fn read(&self, id: VarId) -> Option<Element> {
        match id {
            var::POLICYTAGS => Some(Element::U32Set(self.route.policy_tags.clone())),
            var::PROTOCOL => Some(Element::Str(self.route.protocol.name().to_string())),
            var::METRIC => Some(Element::U32(self.route.metric)),
            _ if id == A::NETWORK_VAR => Some(A::net_element(&self.route.net)),
            _ if id == A::NEXTHOP_VAR => Some(A::addr_element(&self.route.nexthop)),
            _ => None,
        }
    }

    fn write(&mut self, id: VarId, value: Element) -> PolicyResult<()> {
        let mismatch = |value: &Element| {
            PolicyError::Execution(format!(
                "route variable {id} cannot hold {}",
                value.elem_type()
            ))
        };
        match id {
            var::POLICYTAGS => match value {
                Element::U32Set(tags) => {
                    self.route.policy_tags = tags.into_iter().collect::<BTreeSet<u32>>();
                    Ok(())
                }
                other => Err(mismatch(&other)),
            },
            var::METRIC => match value {
                Element::U32(m) => {
                    self.route.metric = m;
                    Ok(())
                }
                other => Err(mismatch(&other)),
            },
            _ if id == A::NEXTHOP_VAR => match A::addr_from_element(&value) {
                Some(a) => {
                    self.route.nexthop = a;
                    Ok(())
                }
                None => Err(mismatch(&value)),
            },
            _ => Err(PolicyError::Execution(format!(
                "write to read-only or unknown route variable {id}"
            ))),
        }
    }
}
