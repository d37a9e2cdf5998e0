//! Address-family abstraction
//!
//! Tables and routes are generic over the address family; this trait
//! binds each address type to its prefix type so one implementation
//! serves IPv4 and IPv6.

use std::fmt;
use std::hash::Hash;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::{Ipv4Network, Ipv6Network};

pub trait RibAddr:
    Copy + Eq + Ord + Hash + fmt::Debug + fmt::Display + Into<IpAddr> + 'static
{
    type Net: Copy + Eq + Ord + Hash + fmt::Debug + fmt::Display + 'static;

    const FAMILY: &'static str;

    fn unspecified() -> Self;

    /// Does `net` cover `addr`?
    fn net_contains(net: &Self::Net, addr: &Self) -> bool;

    /// Host prefix covering exactly `addr`.
    fn host_net(addr: Self) -> Self::Net;
}

impl RibAddr for Ipv4Addr {
    type Net = Ipv4Network;

    const FAMILY: &'static str = "ipv4";

    fn unspecified() -> Ipv4Addr {
        Ipv4Addr::UNSPECIFIED
    }

    fn net_contains(net: &Ipv4Network, addr: &Ipv4Addr) -> bool {
        net.contains(*addr)
    }

    fn host_net(addr: Ipv4Addr) -> Ipv4Network {
        Ipv4Network::new(addr, 32).expect("/32 is always valid")
    }
}

impl RibAddr for Ipv6Addr {
    type Net = Ipv6Network;

    const FAMILY: &'static str = "ipv6";

    fn unspecified() -> Ipv6Addr {
        Ipv6Addr::UNSPECIFIED
    }

    fn net_contains(net: &Ipv6Network, addr: &Ipv6Addr) -> bool {
        net.contains(*addr)
    }

    fn host_net(addr: Ipv6Addr) -> Ipv6Network {
        Ipv6Network::new(addr, 128).expect("/128 is always valid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v4_binding() {
        let net: Ipv4Network = "10.0.0.0/8".parse().unwrap();
        let inside: Ipv4Addr = "10.200.0.1".parse().unwrap();
        let outside: Ipv4Addr = "11.0.0.1".parse().unwrap();
        assert!(Ipv4Addr::net_contains(&net, &inside));
        assert!(!Ipv4Addr::net_contains(&net, &outside));
        assert_eq!(Ipv4Addr::host_net(inside).prefix(), 32);
    }

    #[test]
    fn test_v6_binding() {
        let net: Ipv6Network = "2001:db8::/32".parse().unwrap();
        let inside: Ipv6Addr = "2001:db8::1".parse().unwrap();
        assert!(Ipv6Addr::net_contains(&net, &inside));
        assert_eq!(Ipv6Addr::host_net(inside).prefix(), 128);
    }
}
