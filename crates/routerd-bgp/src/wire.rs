//! Wire-format primitives shared by the message and attribute codecs

use std::net::{Ipv4Addr, Ipv6Addr};

use ipnetwork::{Ipv4Network, Ipv6Network};

use crate::error::{BgpError, BgpResult};
use crate::types::notify;

/// Bounds-checked big-endian reader over a message body.
pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Cursor<'a> {
        Cursor { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(s)
    }

    pub fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|s| s[0])
    }

    pub fn u16(&mut self) -> Option<u16> {
        self.take(2)
            .map(|s| u16::from_be_bytes(s.try_into().expect("2-byte slice")))
    }

    pub fn u32(&mut self) -> Option<u32> {
        self.take(4)
            .map(|s| u32::from_be_bytes(s.try_into().expect("4-byte slice")))
    }

    pub fn ipv4(&mut self) -> Option<Ipv4Addr> {
        self.take(4)
            .map(|s| Ipv4Addr::from(<[u8; 4]>::try_from(s).expect("4-byte slice")))
    }

    pub fn ipv6(&mut self) -> Option<Ipv6Addr> {
        self.take(16)
            .map(|s| Ipv6Addr::from(<[u8; 16]>::try_from(s).expect("16-byte slice")))
    }
}

fn bad_prefix() -> BgpError {
    BgpError::corrupt(
        "invalid network field",
        notify::UPDATE_MESSAGE_ERROR,
        notify::INVALID_NETWORK_FIELD,
    )
}

/// NLRI prefix: one length octet then the minimum covering octets.
pub(crate) fn decode_prefix_v4(cur: &mut Cursor<'_>) -> BgpResult<Ipv4Network> {
    let len = cur.u8().ok_or_else(bad_prefix)?;
    if len > 32 {
        return Err(bad_prefix());
    }
    let nbytes = (len as usize + 7) / 8;
    let body = cur.take(nbytes).ok_or_else(bad_prefix)?;
    let mut octets = [0u8; 4];
    octets[..nbytes].copy_from_slice(body);
    Ipv4Network::new(Ipv4Addr::from(octets), len).map_err(|_| bad_prefix())
}

pub(crate) fn encode_prefix_v4(net: &Ipv4Network, out: &mut Vec<u8>) {
    let len = net.prefix();
    out.push(len);
    let nbytes = (len as usize + 7) / 8;
    out.extend_from_slice(&net.network().octets()[..nbytes]);
}

pub(crate) fn decode_prefix_v6(cur: &mut Cursor<'_>) -> BgpResult<Ipv6Network> {
    let len = cur.u8().ok_or_else(bad_prefix)?;
    if len > 128 {
        return Err(bad_prefix());
    }
    let nbytes = (len as usize + 7) / 8;
    let body = cur.take(nbytes).ok_or_else(bad_prefix)?;
    let mut octets = [0u8; 16];
    octets[..nbytes].copy_from_slice(body);
    Ipv6Network::new(Ipv6Addr::from(octets), len).map_err(|_| bad_prefix())
}

pub(crate) fn encode_prefix_v6(net: &Ipv6Network, out: &mut Vec<u8>) {
    let len = net.prefix();
    out.push(len);
    let nbytes = (len as usize + 7) / 8;
    out.extend_from_slice(&net.network().octets()[..nbytes]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_bounds() {
        let mut cur = Cursor::new(&[0, 1, 2]);
        assert_eq!(cur.u16(), Some(1));
        assert_eq!(cur.remaining(), 1);
        assert_eq!(cur.u16(), None);
        assert_eq!(cur.u8(), Some(2));
        assert!(cur.is_empty());
    }

    #[test]
    fn test_prefix_v4_roundtrip() {
        for text in ["0.0.0.0/0", "10.0.0.0/8", "10.3.128.0/17", "192.0.2.1/32"] {
            let net: Ipv4Network = text.parse().unwrap();
            let mut buf = Vec::new();
            encode_prefix_v4(&net, &mut buf);
            let mut cur = Cursor::new(&buf);
            assert_eq!(decode_prefix_v4(&mut cur).unwrap(), net);
            assert!(cur.is_empty());
        }
    }

    #[test]
    fn test_prefix_v4_minimal_octets() {
        let net: Ipv4Network = "10.0.0.0/8".parse().unwrap();
        let mut buf = Vec::new();
        encode_prefix_v4(&net, &mut buf);
        assert_eq!(buf, [8, 10]);
    }

    #[test]
    fn test_prefix_v6_roundtrip() {
        let net: Ipv6Network = "2001:db8::/32".parse().unwrap();
        let mut buf = Vec::new();
        encode_prefix_v6(&net, &mut buf);
        assert_eq!(buf, [32, 0x20, 0x01, 0x0d, 0xb8]);
        let mut cur = Cursor::new(&buf);
        assert_eq!(decode_prefix_v6(&mut cur).unwrap(), net);
    }

    #[test]
    fn test_bad_prefix_rejected() {
        // Length 33 is out of range for IPv4.
        let mut cur = Cursor::new(&[33, 1, 2, 3, 4, 5]);
        assert!(decode_prefix_v4(&mut cur).is_err());
        // Truncated body.
        let mut cur = Cursor::new(&[24, 10]);
        assert!(decode_prefix_v4(&mut cur).is_err());
    }
}
