//! Interface tree
//!
//! Read-mostly snapshot of the forwarding plane's interface state:
//! Interface -> Vif -> {IPv4 addrs, IPv6 addrs}. Mutated only through
//! the mirror's update path; everything else holds shared references
//! and re-queries after change notifications.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bitflags::bitflags;
use ipnetwork::{Ipv4Network, Ipv6Network};

use crate::mac::Mac;

bitflags! {
    /// Flags carried by interfaces, vifs, and addresses. Not every flag
    /// is meaningful at every level; unused bits stay clear.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IfFlags: u16 {
        const ENABLED        = 0x0001;
        const DISCARD        = 0x0002;
        const UNREACHABLE    = 0x0004;
        const MANAGEMENT     = 0x0008;
        const BROADCAST      = 0x0010;
        const MULTICAST      = 0x0020;
        const LOOPBACK       = 0x0040;
        const POINT_TO_POINT = 0x0080;
        const PIM_REGISTER   = 0x0100;
    }
}

/// An IPv4 address on a vif.
///
/// `endpoint` is the broadcast address on broadcast-capable vifs and
/// the peer address on point-to-point vifs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfTreeAddr4 {
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
    pub flags: IfFlags,
    pub endpoint: Option<Ipv4Addr>,
}

impl IfTreeAddr4 {
    pub fn enabled(&self) -> bool {
        self.flags.contains(IfFlags::ENABLED)
    }

    pub fn network(&self) -> Option<Ipv4Network> {
        Ipv4Network::new(self.addr, self.prefix_len).ok()
    }

    /// Point-to-point peer, if this is a p2p address.
    pub fn peer(&self) -> Option<Ipv4Addr> {
        if self.flags.contains(IfFlags::POINT_TO_POINT) {
            self.endpoint
        } else {
            None
        }
    }
}

/// An IPv6 address on a vif. IPv6 has no broadcast; `peer` is the
/// point-to-point endpoint when present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfTreeAddr6 {
    pub addr: Ipv6Addr,
    pub prefix_len: u8,
    pub flags: IfFlags,
    pub peer: Option<Ipv6Addr>,
}

impl IfTreeAddr6 {
    pub fn enabled(&self) -> bool {
        self.flags.contains(IfFlags::ENABLED)
    }

    pub fn network(&self) -> Option<Ipv6Network> {
        Ipv6Network::new(self.addr, self.prefix_len).ok()
    }
}

/// A virtual interface: the addressable unit protocols bind to.
#[derive(Debug, Clone, Default)]
pub struct IfTreeVif {
    pub name: String,
    pub pif_index: u32,
    pub flags: IfFlags,
    pub vlan_id: Option<u16>,
    pub addrs4: BTreeMap<Ipv4Addr, IfTreeAddr4>,
    pub addrs6: BTreeMap<Ipv6Addr, IfTreeAddr6>,
}

impl IfTreeVif {
    pub fn new(name: &str) -> IfTreeVif {
        IfTreeVif {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn enabled(&self) -> bool {
        self.flags.contains(IfFlags::ENABLED)
    }

    pub fn find_addr4(&self, addr: &Ipv4Addr) -> Option<&IfTreeAddr4> {
        self.addrs4.get(addr)
    }

    pub fn find_addr6(&self, addr: &Ipv6Addr) -> Option<&IfTreeAddr6> {
        self.addrs6.get(addr)
    }
}

/// A physical (or pseudo) interface.
#[derive(Debug, Clone, Default)]
pub struct IfTreeInterface {
    pub name: String,
    pub pif_index: u32,
    pub flags: IfFlags,
    pub mtu: u32,
    pub mac: Mac,
    pub baudrate: u64,
    pub vifs: BTreeMap<String, IfTreeVif>,
}

impl IfTreeInterface {
    pub fn new(name: &str) -> IfTreeInterface {
        IfTreeInterface {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn enabled(&self) -> bool {
        self.flags.contains(IfFlags::ENABLED)
    }

    pub fn find_vif(&self, vif: &str) -> Option<&IfTreeVif> {
        self.vifs.get(vif)
    }

    pub fn find_vif_mut(&mut self, vif: &str) -> Option<&mut IfTreeVif> {
        self.vifs.get_mut(vif)
    }
}

/// The full interface mirror.
#[derive(Debug, Clone, Default)]
pub struct IfTree {
    interfaces: BTreeMap<String, IfTreeInterface>,
}

impl IfTree {
    pub fn new() -> IfTree {
        IfTree::default()
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &IfTreeInterface> {
        self.interfaces.values()
    }

    pub fn find_interface(&self, name: &str) -> Option<&IfTreeInterface> {
        self.interfaces.get(name)
    }

    pub fn find_interface_mut(&mut self, name: &str) -> Option<&mut IfTreeInterface> {
        self.interfaces.get_mut(name)
    }

    pub fn find_vif(&self, ifname: &str, vifname: &str) -> Option<&IfTreeVif> {
        self.find_interface(ifname).and_then(|i| i.find_vif(vifname))
    }

    pub fn add_interface(&mut self, iface: IfTreeInterface) {
        self.interfaces.insert(iface.name.clone(), iface);
    }

    pub fn remove_interface(&mut self, name: &str) -> bool {
        self.interfaces.remove(name).is_some()
    }

    /// Is `addr` configured on any enabled vif?
    pub fn is_my_addr(&self, addr: &IpAddr) -> bool {
        self.enabled_vifs().any(|vif| match addr {
            IpAddr::V4(a) => vif.find_addr4(a).map(|x| x.enabled()).unwrap_or(false),
            IpAddr::V6(a) => vif.find_addr6(a).map(|x| x.enabled()).unwrap_or(false),
        })
    }

    /// Is `addr` reachable without a gateway: one of our own addresses,
    /// a point-to-point peer, or inside a configured subnet?
    pub fn is_directly_connected(&self, addr: &IpAddr) -> bool {
        if self.is_my_addr(addr) {
            return true;
        }
        self.enabled_vifs().any(|vif| match addr {
            IpAddr::V4(a) => vif.addrs4.values().filter(|x| x.enabled()).any(|x| {
                x.peer() == Some(*a) || x.network().map(|n| n.contains(*a)).unwrap_or(false)
            }),
            IpAddr::V6(a) => vif.addrs6.values().filter(|x| x.enabled()).any(|x| {
                x.peer == Some(*a) || x.network().map(|n| n.contains(*a)).unwrap_or(false)
            }),
        })
    }

    /// The (interface, vif) a directly connected address lives on.
    pub fn find_vif_for_addr(&self, addr: &IpAddr) -> Option<(&IfTreeInterface, &IfTreeVif)> {
        for iface in self.interfaces.values().filter(|i| i.enabled()) {
            for vif in iface.vifs.values().filter(|v| v.enabled()) {
                let hit = match addr {
                    IpAddr::V4(a) => vif.addrs4.values().filter(|x| x.enabled()).any(|x| {
                        x.addr == *a
                            || x.peer() == Some(*a)
                            || x.network().map(|n| n.contains(*a)).unwrap_or(false)
                    }),
                    IpAddr::V6(a) => vif.addrs6.values().filter(|x| x.enabled()).any(|x| {
                        x.addr == *a
                            || x.peer == Some(*a)
                            || x.network().map(|n| n.contains(*a)).unwrap_or(false)
                    }),
                };
                if hit {
                    return Some((iface, vif));
                }
            }
        }
        None
    }

    fn enabled_vifs(&self) -> impl Iterator<Item = &IfTreeVif> {
        self.interfaces
            .values()
            .filter(|i| i.enabled())
            .flat_map(|i| i.vifs.values())
            .filter(|v| v.enabled())
    }
}
