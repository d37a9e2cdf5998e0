//! Peer handler
//!
//! Translates between wire UPDATEs and RIB operations for one peer,
//! across the four (AFI, SAFI) planes. Ingestion applies withdrawals
//! before announcements and shares one interned attribute list across
//! every prefix announced with the same attributes; emission batches
//! routes into packets until they are big enough to flush.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::rc::Rc;

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use tracing::{debug, warn};

use routerd_rib::addr::RibAddr;

use crate::attr_manager::AttributeManager;
use crate::error::{BgpError, BgpResult};
use crate::message::UpdatePacket;
use crate::path_attr::{
    attr_type, MpReachNlri, MpUnreachNlri, PathAttribute, PathAttributeList,
};
use crate::types::{Afi, AsNum, Safi, ALL_PLANES};

/// A prefix plus its shared, immutable attribute list.
#[derive(Debug, Clone)]
pub struct SubnetRoute<A: RibAddr> {
    pub net: A::Net,
    pub attrs: Rc<PathAttributeList>,
}

/// RIB-side consumer of one peer's routes for one address family.
pub trait PlumbingSink<A: RibAddr> {
    fn add_route(&mut self, route: SubnetRoute<A>, peer: &str);
    fn delete_route(&mut self, net: &A::Net, peer: &str);
    /// Drain buffered work downstream.
    fn push(&mut self, peer: &str);
    fn peering_went_down(&mut self, peer: &str);
    fn peering_came_up(&mut self, peer: &str);
}

pub type SharedSink<A> = Rc<std::cell::RefCell<dyn PlumbingSink<A>>>;

/// Session parameters for one peer.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub peername: String,
    pub local_as: AsNum,
    /// Internal session (same AS)?
    pub ibgp: bool,
    /// The peer is our route reflector client.
    pub route_reflector_client: bool,
    /// Negotiated 4-byte AS encoding.
    pub four_byte_as: bool,
}

impl PeerConfig {
    pub fn new(peername: &str, local_as: AsNum) -> PeerConfig {
        PeerConfig {
            peername: peername.to_string(),
            local_as,
            ibgp: false,
            route_reflector_client: false,
            four_byte_as: false,
        }
    }

    pub fn ibgp(mut self, yes: bool) -> Self {
        self.ibgp = yes;
        self
    }

    pub fn route_reflector_client(mut self, yes: bool) -> Self {
        self.route_reflector_client = yes;
        self
    }

    pub fn four_byte_as(mut self, yes: bool) -> Self {
        self.four_byte_as = yes;
        self
    }
}

/// Outbound batching state for one (AFI, SAFI) plane.
#[derive(Default)]
struct PlaneOut {
    /// Canonical key of the attributes installed in `packet`.
    attr_key: Option<Vec<u8>>,
    packet: UpdatePacket,
}

pub struct PeerHandler {
    config: PeerConfig,
    unicast4: SharedSink<Ipv4Addr>,
    multicast4: SharedSink<Ipv4Addr>,
    unicast6: SharedSink<Ipv6Addr>,
    multicast6: SharedSink<Ipv6Addr>,
    attr_manager: Rc<AttributeManager>,
    peering_is_up: bool,
    out: BTreeMap<(Afi, Safi), PlaneOut>,
    // stats for debugging only
    packets: u64,
    nlri_total: u64,
}

impl PeerHandler {
    pub fn new(
        config: PeerConfig,
        unicast4: SharedSink<Ipv4Addr>,
        multicast4: SharedSink<Ipv4Addr>,
        unicast6: SharedSink<Ipv6Addr>,
        multicast6: SharedSink<Ipv6Addr>,
        attr_manager: Rc<AttributeManager>,
    ) -> PeerHandler {
        let handler = PeerHandler {
            config,
            unicast4,
            multicast4,
            unicast6,
            multicast6,
            attr_manager,
            peering_is_up: true,
            out: BTreeMap::new(),
            packets: 0,
            nlri_total: 0,
        };
        let name = handler.peername().to_string();
        handler.unicast4.borrow_mut().peering_came_up(&name);
        handler.multicast4.borrow_mut().peering_came_up(&name);
        handler.unicast6.borrow_mut().peering_came_up(&name);
        handler.multicast6.borrow_mut().peering_came_up(&name);
        handler
    }

    pub fn peername(&self) -> &str {
        &self.config.peername
    }

    pub fn peering_is_up(&self) -> bool {
        self.peering_is_up
    }

    pub fn stats(&self) -> (u64, u64) {
        (self.packets, self.nlri_total)
    }

    /// The peering dropped: downstream sees it via the plumbing, which
    /// retires this peer's routes with synthetic deletions.
    pub fn peering_went_down(&mut self) {
        self.peering_is_up = false;
        let name = self.peername().to_string();
        self.unicast4.borrow_mut().peering_went_down(&name);
        self.multicast4.borrow_mut().peering_went_down(&name);
        self.unicast6.borrow_mut().peering_went_down(&name);
        self.multicast6.borrow_mut().peering_went_down(&name);
    }

    pub fn peering_came_up(&mut self) {
        self.peering_is_up = true;
        let name = self.peername().to_string();
        self.unicast4.borrow_mut().peering_came_up(&name);
        self.multicast4.borrow_mut().peering_came_up(&name);
        self.unicast6.borrow_mut().peering_came_up(&name);
        self.multicast6.borrow_mut().peering_came_up(&name);
    }

    /// Ingest one UPDATE: split the multiprotocol planes out,
    /// synthesize per-plane attribute lists, apply withdrawals first,
    /// then announcements, then push all four plumbings.
    pub fn process_update_packet(&mut self, p: &UpdatePacket) -> BgpResult<()> {
        self.packets += 1;
        let name = self.peername().to_string();

        // Attributes common to every plane: everything except the v4
        // next hop and the MP containers themselves.
        let mut base: Vec<PathAttribute> = p
            .attributes
            .attrs()
            .iter()
            .filter(|a| {
                !matches!(
                    a.type_code(),
                    attr_type::NEXT_HOP | attr_type::MP_REACH_NLRI | attr_type::MP_UNREACH_NLRI
                )
            })
            .cloned()
            .collect();
        base.sort_by_key(PathAttribute::type_code);

        // Withdrawals first: legacy v4 unicast, then MP_UNREACH.
        for net in &p.withdrawn {
            self.unicast4.borrow_mut().delete_route(net, &name);
        }
        if let Some(unreach) = p.mp_unreach() {
            for net in &unreach.withdrawn {
                match (unreach.afi, unreach.safi, net) {
                    (Afi::Ipv4, Safi::Multicast, IpNetwork::V4(n)) => {
                        self.multicast4.borrow_mut().delete_route(n, &name)
                    }
                    (Afi::Ipv6, Safi::Unicast, IpNetwork::V6(n)) => {
                        self.unicast6.borrow_mut().delete_route(n, &name)
                    }
                    (Afi::Ipv6, Safi::Multicast, IpNetwork::V6(n)) => {
                        self.multicast6.borrow_mut().delete_route(n, &name)
                    }
                    (afi, safi, net) => {
                        warn!(?afi, ?safi, %net, "MP_UNREACH plane/prefix mismatch ignored")
                    }
                }
            }
        }

        // v4 unicast announcements: base plus the legacy NEXT_HOP.
        if !p.nlri.is_empty() {
            let mut attrs = base.clone();
            if let Some(PathAttribute::NextHop(nh)) = p.attributes.get(attr_type::NEXT_HOP) {
                attrs.push(PathAttribute::NextHop(*nh));
            }
            let list = PathAttributeList::new(attrs)?;
            let (shared, _) = self.attr_manager.intern(list);
            self.nlri_total += p.nlri.len() as u64;
            let mut sink = self.unicast4.borrow_mut();
            for net in &p.nlri {
                sink.add_route(
                    SubnetRoute {
                        net: *net,
                        attrs: Rc::clone(&shared),
                    },
                    &name,
                );
            }
        }

        // MP announcements: base plus a next-hop-only MP_REACH for the
        // plane.
        if let Some(reach) = p.mp_reach() {
            let mut attrs = base.clone();
            attrs.push(PathAttribute::MpReach(MpReachNlri {
                afi: reach.afi,
                safi: reach.safi,
                nexthop: reach.nexthop,
                nlri: Vec::new(),
            }));
            let list = PathAttributeList::new(attrs)?;
            let (shared, _) = self.attr_manager.intern(list);
            self.nlri_total += reach.nlri.len() as u64;
            for net in &reach.nlri {
                match (reach.afi, reach.safi, net) {
                    (Afi::Ipv4, Safi::Multicast, IpNetwork::V4(n)) => {
                        self.multicast4.borrow_mut().add_route(
                            SubnetRoute {
                                net: *n,
                                attrs: Rc::clone(&shared),
                            },
                            &name,
                        )
                    }
                    (Afi::Ipv6, Safi::Unicast, IpNetwork::V6(n)) => {
                        self.unicast6.borrow_mut().add_route(
                            SubnetRoute {
                                net: *n,
                                attrs: Rc::clone(&shared),
                            },
                            &name,
                        )
                    }
                    (Afi::Ipv6, Safi::Multicast, IpNetwork::V6(n)) => {
                        self.multicast6.borrow_mut().add_route(
                            SubnetRoute {
                                net: *n,
                                attrs: Rc::clone(&shared),
                            },
                            &name,
                        )
                    }
                    (afi, safi, net) => {
                        warn!(?afi, ?safi, %net, "MP_REACH plane/prefix mismatch ignored")
                    }
                }
            }
        }

        // Let buffered work drain downstream on every plane.
        self.push_all();
        Ok(())
    }

    fn push_all(&mut self) {
        let name = self.peername().to_string();
        self.unicast4.borrow_mut().push(&name);
        self.multicast4.borrow_mut().push(&name);
        self.unicast6.borrow_mut().push(&name);
        self.multicast6.borrow_mut().push(&name);
    }

    /// A malformed message invalidates the peer: send the mapped
    /// NOTIFICATION, tear the connection down, and take the peering
    /// down so downstream consumers see synthetic deletions for every
    /// prefix this peer had advertised.
    pub fn invalidate(&mut self, client: &crate::socket::SocketClient, err: &crate::error::BgpError) {
        warn!(peer = %self.config.peername, error = %err, "peer invalidated");
        if let Some((code, subcode, data)) = err.notify() {
            let notification = crate::message::NotificationMessage {
                code,
                subcode,
                data: data.to_vec(),
            };
            // Best effort: the connection is going away either way.
            let _ = client.send_message(
                notification.encode(),
                routerd_event::callback::Callback0::empty(),
            );
        }
        client.disconnect();
        self.peering_went_down();
    }

    // ========================================================================
    // Outbound batching
    // ========================================================================

    /// Queue an IPv4 unicast announcement. Returns any packet that
    /// became full and must be transmitted.
    pub fn queue_add_v4(
        &mut self,
        net: Ipv4Network,
        attrs: &Rc<PathAttributeList>,
        from_ibgp: bool,
    ) -> BgpResult<Vec<UpdatePacket>> {
        self.assert_reflection(from_ibgp);
        self.queue_add(
            (Afi::Ipv4, Safi::Unicast),
            IpNetwork::V4(net),
            attrs,
        )
    }

    /// Queue an announcement for a multiprotocol plane.
    pub fn queue_add_mp(
        &mut self,
        afi: Afi,
        safi: Safi,
        net: IpNetwork,
        attrs: &Rc<PathAttributeList>,
        from_ibgp: bool,
    ) -> BgpResult<Vec<UpdatePacket>> {
        self.assert_reflection(from_ibgp);
        self.queue_add((afi, safi), net, attrs)
    }

    /// IBGP learned routes are only re-advertised to reflector
    /// clients.
    fn assert_reflection(&self, from_ibgp: bool) {
        assert!(
            !(self.config.ibgp && from_ibgp) || self.config.route_reflector_client,
            "IBGP route re-advertised to IBGP peer {}",
            self.peername()
        );
    }

    fn queue_add(
        &mut self,
        plane: (Afi, Safi),
        net: IpNetwork,
        attrs: &Rc<PathAttributeList>,
    ) -> BgpResult<Vec<UpdatePacket>> {
        let (afi, safi) = plane;
        let four_byte = self.config.four_byte_as;
        let mut flushed = Vec::new();
        let out = self.out.entry(plane).or_default();
        let key = attrs.canonical_bytes();

        // A different attribute list cannot share the packet.
        if out.attr_key.as_ref().is_some_and(|k| *k != key) {
            if !out.packet.is_empty() {
                flushed.push(std::mem::take(&mut out.packet));
            }
            out.attr_key = None;
        }

        if out.attr_key.is_none() {
            // First add: install the attributes once, keeping any
            // withdrawals already batched for this plane.
            let pending_unreach = out.packet.attributes.get(attr_type::MP_UNREACH_NLRI).cloned();
            out.packet.attributes = match plane {
                (Afi::Ipv4, Safi::Unicast) => (**attrs).clone(),
                _ => {
                    let nexthop = attrs.nexthop().ok_or(BgpError::Announce {
                        afi,
                        safi,
                        reason: "attribute list has no next hop",
                    })?;
                    let mut list = (**attrs).clone();
                    list.remove(attr_type::NEXT_HOP);
                    list.replace(PathAttribute::MpReach(MpReachNlri {
                        afi,
                        safi,
                        nexthop,
                        nlri: Vec::new(),
                    }));
                    list
                }
            };
            if let Some(unreach) = pending_unreach {
                out.packet.attributes.replace(unreach);
            }
            out.attr_key = Some(key);
        }

        match plane {
            (Afi::Ipv4, Safi::Unicast) => match net {
                IpNetwork::V4(n) => out.packet.nlri.push(n),
                IpNetwork::V6(_) => {
                    return Err(BgpError::Announce {
                        afi,
                        safi,
                        reason: "v6 prefix on the v4 unicast plane",
                    })
                }
            },
            _ => {
                // Append to the plane's MP_REACH.
                let mut mp = match out.packet.attributes.get(attr_type::MP_REACH_NLRI) {
                    Some(PathAttribute::MpReach(mp)) => mp.clone(),
                    _ => {
                        return Err(BgpError::Announce {
                            afi,
                            safi,
                            reason: "packet has no MP_REACH container",
                        })
                    }
                };
                mp.nlri.push(net);
                out.packet.attributes.replace(PathAttribute::MpReach(mp));
            }
        }
        self.nlri_total += 1;

        if out.packet.big_enough(four_byte) {
            flushed.push(std::mem::take(&mut out.packet));
            out.attr_key = None;
        }
        for p in &flushed {
            debug!(peer = %self.config.peername, nlri = p.nlri.len(), "update packet full");
        }
        self.packets += flushed.len() as u64;
        Ok(flushed)
    }

    /// Queue an IPv4 unicast withdrawal.
    pub fn queue_withdraw_v4(&mut self, net: Ipv4Network) -> Vec<UpdatePacket> {
        let four_byte = self.config.four_byte_as;
        let out = self.out.entry((Afi::Ipv4, Safi::Unicast)).or_default();
        out.packet.withdrawn.push(net);
        let mut flushed = Vec::new();
        if out.packet.big_enough(four_byte) {
            flushed.push(std::mem::take(&mut out.packet));
            out.attr_key = None;
        }
        self.packets += flushed.len() as u64;
        flushed
    }

    /// Queue a withdrawal on a multiprotocol plane. All withdrawals of
    /// one plane share one MP_UNREACH attribute.
    pub fn queue_withdraw_mp(&mut self, afi: Afi, safi: Safi, net: IpNetwork) -> Vec<UpdatePacket> {
        let four_byte = self.config.four_byte_as;
        let out = self.out.entry((afi, safi)).or_default();
        let mut mp = match out.packet.attributes.get(attr_type::MP_UNREACH_NLRI) {
            Some(PathAttribute::MpUnreach(mp)) => mp.clone(),
            _ => MpUnreachNlri {
                afi,
                safi,
                withdrawn: Vec::new(),
            },
        };
        mp.withdrawn.push(net);
        out.packet.attributes.replace(PathAttribute::MpUnreach(mp));

        let mut flushed = Vec::new();
        if out.packet.big_enough(four_byte) {
            flushed.push(std::mem::take(&mut out.packet));
            out.attr_key = None;
        }
        self.packets += flushed.len() as u64;
        flushed
    }

    /// Flush every partially built packet, plane order.
    pub fn flush(&mut self) -> Vec<UpdatePacket> {
        let mut flushed = Vec::new();
        for plane in ALL_PLANES {
            if let Some(out) = self.out.get_mut(&plane) {
                if !out.packet.is_empty() {
                    flushed.push(std::mem::take(&mut out.packet));
                    out.attr_key = None;
                }
            }
        }
        self.packets += flushed.len() as u64;
        flushed
    }
}
