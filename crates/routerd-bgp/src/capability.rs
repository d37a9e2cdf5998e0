//! OPEN optional parameters and capability negotiation
//!
//! Parameter type 2 carries capability TLVs. Recognized: Multiprotocol
//! (code 1), Route Refresh (code 2, legacy 128), 4-byte AS (code 65).
//! Unknown capabilities are preserved verbatim for potential proxying;
//! the deprecated Authentication parameter (type 1) is rejected.

use std::collections::BTreeSet;

use tracing::debug;

use crate::error::{BgpError, BgpResult};
use crate::types::{notify, Afi, AsNum, Safi};
use crate::wire::Cursor;

const PARAM_AUTHENTICATION: u8 = 1;
const PARAM_CAPABILITY: u8 = 2;

pub const CAP_MULTIPROTOCOL: u8 = 1;
pub const CAP_ROUTE_REFRESH: u8 = 2;
pub const CAP_AS4: u8 = 65;
pub const CAP_ROUTE_REFRESH_OLD: u8 = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    Multiprotocol(Afi, Safi),
    RouteRefresh { legacy: bool },
    As4(AsNum),
    /// Unrecognized capability, carried verbatim.
    Unknown { code: u8, data: Vec<u8> },
}

fn open_err(reason: &str) -> BgpError {
    BgpError::corrupt(
        reason.to_string(),
        notify::OPEN_MESSAGE_ERROR,
        notify::UNSUPPORTED_OPTIONAL_PARAMETER,
    )
}

impl Capability {
    fn code(&self) -> u8 {
        match self {
            Capability::Multiprotocol(..) => CAP_MULTIPROTOCOL,
            Capability::RouteRefresh { legacy: false } => CAP_ROUTE_REFRESH,
            Capability::RouteRefresh { legacy: true } => CAP_ROUTE_REFRESH_OLD,
            Capability::As4(_) => CAP_AS4,
            Capability::Unknown { code, .. } => *code,
        }
    }

    fn value(&self) -> Vec<u8> {
        match self {
            Capability::Multiprotocol(afi, safi) => {
                let mut v = Vec::with_capacity(4);
                v.extend_from_slice(&(*afi as u16).to_be_bytes());
                v.push(0); // reserved
                v.push(*safi as u8);
                v
            }
            Capability::RouteRefresh { .. } => Vec::new(),
            Capability::As4(asn) => asn.as_extended().to_be_bytes().to_vec(),
            Capability::Unknown { data, .. } => data.clone(),
        }
    }

    fn decode(code: u8, body: &[u8]) -> BgpResult<Capability> {
        Ok(match code {
            CAP_MULTIPROTOCOL => {
                if body.len() != 4 {
                    return Err(open_err("multiprotocol capability length"));
                }
                let afi = Afi::from_u16(u16::from_be_bytes([body[0], body[1]]))
                    .ok_or_else(|| open_err("unsupported AFI"))?;
                let safi =
                    Safi::from_u8(body[3]).ok_or_else(|| open_err("unsupported SAFI"))?;
                Capability::Multiprotocol(afi, safi)
            }
            CAP_ROUTE_REFRESH | CAP_ROUTE_REFRESH_OLD => {
                if !body.is_empty() {
                    return Err(open_err("route refresh capability length"));
                }
                Capability::RouteRefresh {
                    legacy: code == CAP_ROUTE_REFRESH_OLD,
                }
            }
            CAP_AS4 => {
                if body.len() != 4 {
                    return Err(open_err("AS4 capability length"));
                }
                Capability::As4(AsNum::new_extended(u32::from_be_bytes(
                    body.try_into().expect("4-byte slice"),
                )))
            }
            _ => {
                debug!(code, len = body.len(), "unknown capability preserved");
                Capability::Unknown {
                    code,
                    data: body.to_vec(),
                }
            }
        })
    }
}

/// Encode capabilities as the OPEN optional-parameter block.
pub fn encode_parameters(caps: &[Capability], out: &mut Vec<u8>) {
    let mut block = Vec::new();
    for cap in caps {
        let value = cap.value();
        block.push(PARAM_CAPABILITY);
        block.push((value.len() + 2) as u8);
        block.push(cap.code());
        block.push(value.len() as u8);
        block.extend_from_slice(&value);
    }
    out.push(block.len() as u8);
    out.extend_from_slice(&block);
}

/// Parse the OPEN optional-parameter block into capabilities.
pub fn decode_parameters(cur: &mut Cursor<'_>) -> BgpResult<Vec<Capability>> {
    let total = cur
        .u8()
        .ok_or_else(|| open_err("truncated parameter block"))? as usize;
    let block = cur
        .take(total)
        .ok_or_else(|| open_err("truncated parameter block"))?;
    let mut block = Cursor::new(block);

    let mut caps = Vec::new();
    while !block.is_empty() {
        let ptype = block
            .u8()
            .ok_or_else(|| open_err("truncated parameter"))?;
        let plen = block
            .u8()
            .ok_or_else(|| open_err("truncated parameter"))? as usize;
        let body = block
            .take(plen)
            .ok_or_else(|| open_err("parameter overruns block"))?;

        match ptype {
            PARAM_AUTHENTICATION => {
                return Err(open_err("deprecated authentication parameter"));
            }
            PARAM_CAPABILITY => {
                let mut body = Cursor::new(body);
                while !body.is_empty() {
                    let code = body
                        .u8()
                        .ok_or_else(|| open_err("truncated capability"))?;
                    let clen = body
                        .u8()
                        .ok_or_else(|| open_err("truncated capability"))?
                        as usize;
                    let cbody = body
                        .take(clen)
                        .ok_or_else(|| open_err("capability overruns parameter"))?;
                    caps.push(Capability::decode(code, cbody)?);
                }
            }
            _ => return Err(open_err("unsupported optional parameter")),
        }
    }
    Ok(caps)
}

/// The agreed session properties after both OPENs are seen.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Negotiated {
    /// Mutually enabled (AFI, SAFI) planes. IPv4 unicast is implicit
    /// when neither side sent any Multiprotocol capability.
    pub planes: BTreeSet<(Afi, Safi)>,
    pub route_refresh: bool,
    pub four_byte_as: bool,
    /// The peer's 4-byte AS, when it advertised one.
    pub peer_as4: Option<AsNum>,
}

/// Intersect our capabilities with the peer's.
pub fn negotiate(local: &[Capability], remote: &[Capability]) -> Negotiated {
    let planes = |caps: &[Capability]| -> BTreeSet<(Afi, Safi)> {
        let mut set: BTreeSet<(Afi, Safi)> = caps
            .iter()
            .filter_map(|c| match c {
                Capability::Multiprotocol(afi, safi) => Some((*afi, *safi)),
                _ => None,
            })
            .collect();
        if set.is_empty() {
            // A speaker with no MP capability is an IPv4 unicast one.
            set.insert((Afi::Ipv4, Safi::Unicast));
        }
        set
    };
    let refresh =
        |caps: &[Capability]| caps.iter().any(|c| matches!(c, Capability::RouteRefresh { .. }));
    let as4 = |caps: &[Capability]| {
        caps.iter().find_map(|c| match c {
            Capability::As4(asn) => Some(*asn),
            _ => None,
        })
    };

    Negotiated {
        planes: planes(local).intersection(&planes(remote)).copied().collect(),
        route_refresh: refresh(local) && refresh(remote),
        four_byte_as: as4(local).is_some() && as4(remote).is_some(),
        peer_as4: as4(remote),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(caps: &[Capability]) -> Vec<Capability> {
        let mut buf = Vec::new();
        encode_parameters(caps, &mut buf);
        let mut cur = Cursor::new(&buf);
        let back = decode_parameters(&mut cur).unwrap();
        assert!(cur.is_empty());
        back
    }

    #[test]
    fn test_parameter_roundtrip() {
        let caps = vec![
            Capability::Multiprotocol(Afi::Ipv4, Safi::Unicast),
            Capability::Multiprotocol(Afi::Ipv6, Safi::Multicast),
            Capability::RouteRefresh { legacy: false },
            Capability::As4(AsNum::new_extended(65537)),
            Capability::Unknown {
                code: 70,
                data: vec![0xDE, 0xAD],
            },
        ];
        assert_eq!(roundtrip(&caps), caps);
    }

    #[test]
    fn test_legacy_route_refresh_code() {
        let caps = vec![Capability::RouteRefresh { legacy: true }];
        let mut buf = Vec::new();
        encode_parameters(&caps, &mut buf);
        // param len, type 2, len 2, code 128, len 0
        assert_eq!(buf, [4, 2, 2, 128, 0]);
        assert_eq!(roundtrip(&caps), caps);
    }

    #[test]
    fn test_authentication_rejected() {
        // Parameter type 1 (deprecated authentication).
        let buf = [3u8, 1, 1, 0xAA];
        let mut cur = Cursor::new(&buf);
        let err = decode_parameters(&mut cur).unwrap_err();
        assert_eq!(
            err.notify().map(|(c, s, _)| (c, s)),
            Some((
                notify::OPEN_MESSAGE_ERROR,
                notify::UNSUPPORTED_OPTIONAL_PARAMETER
            ))
        );
    }

    #[test]
    fn test_unknown_afi_rejected() {
        // total=8, param type 2 len 6: cap 1 len 4, AFI 25, res 0, SAFI 1
        let buf = [8u8, 2, 6, 1, 4, 0, 25, 0, 1];
        let mut cur = Cursor::new(&buf);
        let err = decode_parameters(&mut cur).unwrap_err();
        assert_eq!(
            err.notify().map(|(c, s, _)| (c, s)),
            Some((
                notify::OPEN_MESSAGE_ERROR,
                notify::UNSUPPORTED_OPTIONAL_PARAMETER
            ))
        );
    }

    #[test]
    fn test_negotiation_intersection() {
        // Scenario: A offers MP(v4,u), MP(v6,u), AS4(65537);
        // B offers MP(v4,u) and route refresh.
        let a = vec![
            Capability::Multiprotocol(Afi::Ipv4, Safi::Unicast),
            Capability::Multiprotocol(Afi::Ipv6, Safi::Unicast),
            Capability::As4(AsNum::new_extended(65537)),
        ];
        let b = vec![
            Capability::Multiprotocol(Afi::Ipv4, Safi::Unicast),
            Capability::RouteRefresh { legacy: false },
        ];

        let n = negotiate(&a, &b);
        assert_eq!(
            n.planes,
            BTreeSet::from([(Afi::Ipv4, Safi::Unicast)])
        );
        // Only one side offered each of these.
        assert!(!n.route_refresh);
        assert!(!n.four_byte_as);
        // And A's extended AS squeezes to AS_TRANS on the wire.
        assert_eq!(AsNum::new_extended(65537).short_or_trans(), crate::types::AS_TRANS);
    }

    #[test]
    fn test_negotiation_implicit_v4_unicast() {
        let n = negotiate(&[], &[]);
        assert_eq!(n.planes, BTreeSet::from([(Afi::Ipv4, Safi::Unicast)]));
    }
}
