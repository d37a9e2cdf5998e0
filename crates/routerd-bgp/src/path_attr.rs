//! Path attributes
//!
//! Typed attributes with wire flag validation, plus the canonicalized
//! attribute list shared (refcounted) by every route announced with the
//! same attributes. Unknown optional attributes are preserved verbatim
//! so they can be proxied onward.

use std::net::IpAddr;

use ipnetwork::IpNetwork;

use crate::aspath::AsPath;
use crate::error::{BgpError, BgpResult};
use crate::types::{notify, Afi, AsNum, Safi};
use crate::wire::{
    decode_prefix_v4, decode_prefix_v6, encode_prefix_v4, encode_prefix_v6, Cursor,
};

/// Attribute flag octets.
pub mod flags {
    pub const OPTIONAL: u8 = 0x80;
    pub const TRANSITIVE: u8 = 0x40;
    pub const PARTIAL: u8 = 0x20;
    pub const EXTENDED_LENGTH: u8 = 0x10;
}

/// Attribute type codes.
pub mod attr_type {
    pub const ORIGIN: u8 = 1;
    pub const AS_PATH: u8 = 2;
    pub const NEXT_HOP: u8 = 3;
    pub const MED: u8 = 4;
    pub const LOCAL_PREF: u8 = 5;
    pub const ATOMIC_AGGREGATE: u8 = 6;
    pub const AGGREGATOR: u8 = 7;
    pub const COMMUNITY: u8 = 8;
    pub const MP_REACH_NLRI: u8 = 14;
    pub const MP_UNREACH_NLRI: u8 = 15;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    Igp = 0,
    Egp = 1,
    Incomplete = 2,
}

/// Multiprotocol reachability: announcements for one (AFI, SAFI) plane
/// with their own next hop.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MpReachNlri {
    pub afi: Afi,
    pub safi: Safi,
    pub nexthop: IpAddr,
    pub nlri: Vec<IpNetwork>,
}

/// Multiprotocol withdrawals for one (AFI, SAFI) plane.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MpUnreachNlri {
    pub afi: Afi,
    pub safi: Safi,
    pub withdrawn: Vec<IpNetwork>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathAttribute {
    Origin(Origin),
    AsPath(AsPath),
    NextHop(std::net::Ipv4Addr),
    MultiExitDisc(u32),
    LocalPref(u32),
    AtomicAggregate,
    Aggregator { as_num: AsNum, speaker: std::net::Ipv4Addr },
    Community(Vec<u32>),
    MpReach(MpReachNlri),
    MpUnreach(MpUnreachNlri),
    /// Unrecognized optional attribute, carried verbatim.
    Unknown { type_code: u8, flags: u8, data: Vec<u8> },
}

fn attr_err(reason: &str, subcode: u8) -> BgpError {
    BgpError::corrupt(reason.to_string(), notify::UPDATE_MESSAGE_ERROR, subcode)
}

impl PathAttribute {
    pub fn type_code(&self) -> u8 {
        match self {
            PathAttribute::Origin(_) => attr_type::ORIGIN,
            PathAttribute::AsPath(_) => attr_type::AS_PATH,
            PathAttribute::NextHop(_) => attr_type::NEXT_HOP,
            PathAttribute::MultiExitDisc(_) => attr_type::MED,
            PathAttribute::LocalPref(_) => attr_type::LOCAL_PREF,
            PathAttribute::AtomicAggregate => attr_type::ATOMIC_AGGREGATE,
            PathAttribute::Aggregator { .. } => attr_type::AGGREGATOR,
            PathAttribute::Community(_) => attr_type::COMMUNITY,
            PathAttribute::MpReach(_) => attr_type::MP_REACH_NLRI,
            PathAttribute::MpUnreach(_) => attr_type::MP_UNREACH_NLRI,
            PathAttribute::Unknown { type_code, .. } => *type_code,
        }
    }

    fn wire_flags(&self) -> u8 {
        match self {
            PathAttribute::Origin(_)
            | PathAttribute::AsPath(_)
            | PathAttribute::NextHop(_)
            | PathAttribute::LocalPref(_)
            | PathAttribute::AtomicAggregate => flags::TRANSITIVE,
            PathAttribute::MultiExitDisc(_) => flags::OPTIONAL,
            PathAttribute::Aggregator { .. } | PathAttribute::Community(_) => {
                flags::OPTIONAL | flags::TRANSITIVE
            }
            PathAttribute::MpReach(_) | PathAttribute::MpUnreach(_) => flags::OPTIONAL,
            PathAttribute::Unknown { flags, .. } => *flags,
        }
    }

    /// Encode as (flags, type, length, value).
    pub fn encode(&self, four_byte_as: bool, out: &mut Vec<u8>) {
        let mut body = Vec::new();
        match self {
            PathAttribute::Origin(o) => body.push(*o as u8),
            PathAttribute::AsPath(p) => p.encode(four_byte_as, &mut body),
            PathAttribute::NextHop(a) => body.extend_from_slice(&a.octets()),
            PathAttribute::MultiExitDisc(v) | PathAttribute::LocalPref(v) => {
                body.extend_from_slice(&v.to_be_bytes())
            }
            PathAttribute::AtomicAggregate => {}
            PathAttribute::Aggregator { as_num, speaker } => {
                if four_byte_as {
                    body.extend_from_slice(&as_num.as_extended().to_be_bytes());
                } else {
                    body.extend_from_slice(&as_num.short_or_trans().to_be_bytes());
                }
                body.extend_from_slice(&speaker.octets());
            }
            PathAttribute::Community(cs) => {
                for c in cs {
                    body.extend_from_slice(&c.to_be_bytes());
                }
            }
            PathAttribute::MpReach(mp) => {
                body.extend_from_slice(&(mp.afi as u16).to_be_bytes());
                body.push(mp.safi as u8);
                match (mp.afi, mp.nexthop) {
                    (Afi::Ipv4, IpAddr::V4(a)) => {
                        body.push(4);
                        body.extend_from_slice(&a.octets());
                    }
                    (Afi::Ipv6, IpAddr::V6(a)) => {
                        body.push(16);
                        body.extend_from_slice(&a.octets());
                    }
                    _ => debug_assert!(false, "MP_REACH next hop family mismatch"),
                }
                body.push(0); // reserved (SNPA count)
                for net in &mp.nlri {
                    match net {
                        IpNetwork::V4(n) => encode_prefix_v4(n, &mut body),
                        IpNetwork::V6(n) => encode_prefix_v6(n, &mut body),
                    }
                }
            }
            PathAttribute::MpUnreach(mp) => {
                body.extend_from_slice(&(mp.afi as u16).to_be_bytes());
                body.push(mp.safi as u8);
                for net in &mp.withdrawn {
                    match net {
                        IpNetwork::V4(n) => encode_prefix_v4(n, &mut body),
                        IpNetwork::V6(n) => encode_prefix_v6(n, &mut body),
                    }
                }
            }
            PathAttribute::Unknown { data, .. } => body.extend_from_slice(data),
        }

        let mut head_flags = self.wire_flags();
        if body.len() > u8::MAX as usize {
            head_flags |= flags::EXTENDED_LENGTH;
        }
        out.push(head_flags);
        out.push(self.type_code());
        if head_flags & flags::EXTENDED_LENGTH != 0 {
            out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        } else {
            out.push(body.len() as u8);
        }
        out.extend_from_slice(&body);
    }

    /// Decode one attribute. `four_byte_as` reflects the session's
    /// negotiated AS width.
    pub fn decode(cur: &mut Cursor<'_>, four_byte_as: bool) -> BgpResult<PathAttribute> {
        let flag_octet = cur
            .u8()
            .ok_or_else(|| attr_err("truncated attribute", notify::ATTRIBUTE_LENGTH_ERROR))?;
        let type_code = cur
            .u8()
            .ok_or_else(|| attr_err("truncated attribute", notify::ATTRIBUTE_LENGTH_ERROR))?;
        let len = if flag_octet & flags::EXTENDED_LENGTH != 0 {
            cur.u16()
                .ok_or_else(|| attr_err("truncated attribute", notify::ATTRIBUTE_LENGTH_ERROR))?
                as usize
        } else {
            cur.u8()
                .ok_or_else(|| attr_err("truncated attribute", notify::ATTRIBUTE_LENGTH_ERROR))?
                as usize
        };
        let body = cur
            .take(len)
            .ok_or_else(|| attr_err("attribute overruns message", notify::ATTRIBUTE_LENGTH_ERROR))?;

        let optional = flag_octet & flags::OPTIONAL != 0;
        let check_wellknown = |name: &str| -> BgpResult<()> {
            if optional {
                return Err(attr_err(
                    &format!("{name} flagged optional"),
                    notify::ATTRIBUTE_FLAGS_ERROR,
                ));
            }
            Ok(())
        };
        let fixed_len = |name: &str, want: usize| -> BgpResult<()> {
            if body.len() != want {
                return Err(attr_err(
                    &format!("{name} length {} != {want}", body.len()),
                    notify::ATTRIBUTE_LENGTH_ERROR,
                ));
            }
            Ok(())
        };

        let mut body_cur = Cursor::new(body);
        Ok(match type_code {
            attr_type::ORIGIN => {
                check_wellknown("ORIGIN")?;
                fixed_len("ORIGIN", 1)?;
                let o = match body[0] {
                    0 => Origin::Igp,
                    1 => Origin::Egp,
                    2 => Origin::Incomplete,
                    _ => {
                        return Err(attr_err(
                            "bad ORIGIN value",
                            notify::INVALID_ORIGIN_ATTRIBUTE,
                        ))
                    }
                };
                PathAttribute::Origin(o)
            }
            attr_type::AS_PATH => {
                check_wellknown("AS_PATH")?;
                PathAttribute::AsPath(AsPath::decode(body, four_byte_as)?)
            }
            attr_type::NEXT_HOP => {
                check_wellknown("NEXT_HOP")?;
                fixed_len("NEXT_HOP", 4)?;
                PathAttribute::NextHop(body_cur.ipv4().expect("4-byte body"))
            }
            attr_type::MED => {
                fixed_len("MED", 4)?;
                PathAttribute::MultiExitDisc(body_cur.u32().expect("4-byte body"))
            }
            attr_type::LOCAL_PREF => {
                check_wellknown("LOCAL_PREF")?;
                fixed_len("LOCAL_PREF", 4)?;
                PathAttribute::LocalPref(body_cur.u32().expect("4-byte body"))
            }
            attr_type::ATOMIC_AGGREGATE => {
                check_wellknown("ATOMIC_AGGREGATE")?;
                fixed_len("ATOMIC_AGGREGATE", 0)?;
                PathAttribute::AtomicAggregate
            }
            attr_type::AGGREGATOR => {
                let want = if four_byte_as { 8 } else { 6 };
                fixed_len("AGGREGATOR", want)?;
                let as_num = if four_byte_as {
                    AsNum::new_extended(body_cur.u32().expect("aggregator AS"))
                } else {
                    AsNum::new(body_cur.u16().expect("aggregator AS"))
                };
                PathAttribute::Aggregator {
                    as_num,
                    speaker: body_cur.ipv4().expect("aggregator id"),
                }
            }
            attr_type::COMMUNITY => {
                if body.len() % 4 != 0 {
                    return Err(attr_err("COMMUNITY length", notify::ATTRIBUTE_LENGTH_ERROR));
                }
                let mut cs = Vec::with_capacity(body.len() / 4);
                while let Some(c) = body_cur.u32() {
                    cs.push(c);
                }
                PathAttribute::Community(cs)
            }
            attr_type::MP_REACH_NLRI => PathAttribute::MpReach(decode_mp_reach(&mut body_cur)?),
            attr_type::MP_UNREACH_NLRI => {
                PathAttribute::MpUnreach(decode_mp_unreach(&mut body_cur)?)
            }
            _ => {
                if !optional {
                    return Err(attr_err(
                        &format!("unrecognized well-known attribute {type_code}"),
                        notify::UNRECOGNIZED_WELLKNOWN_ATTRIBUTE,
                    ));
                }
                PathAttribute::Unknown {
                    type_code,
                    flags: flag_octet & !flags::EXTENDED_LENGTH,
                    data: body.to_vec(),
                }
            }
        })
    }
}

fn mp_plane(cur: &mut Cursor<'_>) -> BgpResult<(Afi, Safi)> {
    let afi = cur
        .u16()
        .and_then(Afi::from_u16)
        .ok_or_else(|| attr_err("bad MP AFI", notify::OPTIONAL_ATTRIBUTE_ERROR))?;
    let safi = cur
        .u8()
        .and_then(Safi::from_u8)
        .ok_or_else(|| attr_err("bad MP SAFI", notify::OPTIONAL_ATTRIBUTE_ERROR))?;
    Ok((afi, safi))
}

fn decode_mp_reach(cur: &mut Cursor<'_>) -> BgpResult<MpReachNlri> {
    let (afi, safi) = mp_plane(cur)?;
    let nh_len = cur
        .u8()
        .ok_or_else(|| attr_err("truncated MP_REACH", notify::ATTRIBUTE_LENGTH_ERROR))?;
    let nexthop = match (afi, nh_len) {
        (Afi::Ipv4, 4) => IpAddr::V4(
            cur.ipv4()
                .ok_or_else(|| attr_err("truncated MP_REACH", notify::ATTRIBUTE_LENGTH_ERROR))?,
        ),
        // A 32-octet next hop carries global + link-local; the global
        // address leads.
        (Afi::Ipv6, 16) | (Afi::Ipv6, 32) => {
            let global = cur
                .ipv6()
                .ok_or_else(|| attr_err("truncated MP_REACH", notify::ATTRIBUTE_LENGTH_ERROR))?;
            if nh_len == 32 {
                cur.take(16)
                    .ok_or_else(|| attr_err("truncated MP_REACH", notify::ATTRIBUTE_LENGTH_ERROR))?;
            }
            IpAddr::V6(global)
        }
        _ => {
            return Err(attr_err(
                "bad MP_REACH next hop length",
                notify::INVALID_NEXTHOP_ATTRIBUTE,
            ))
        }
    };
    // Reserved SNPA octet.
    cur.u8()
        .ok_or_else(|| attr_err("truncated MP_REACH", notify::ATTRIBUTE_LENGTH_ERROR))?;

    let mut nlri = Vec::new();
    while !cur.is_empty() {
        nlri.push(match afi {
            Afi::Ipv4 => IpNetwork::V4(decode_prefix_v4(cur)?),
            Afi::Ipv6 => IpNetwork::V6(decode_prefix_v6(cur)?),
        });
    }
    Ok(MpReachNlri {
        afi,
        safi,
        nexthop,
        nlri,
    })
}

fn decode_mp_unreach(cur: &mut Cursor<'_>) -> BgpResult<MpUnreachNlri> {
    let (afi, safi) = mp_plane(cur)?;
    let mut withdrawn = Vec::new();
    while !cur.is_empty() {
        withdrawn.push(match afi {
            Afi::Ipv4 => IpNetwork::V4(decode_prefix_v4(cur)?),
            Afi::Ipv6 => IpNetwork::V6(decode_prefix_v6(cur)?),
        });
    }
    Ok(MpUnreachNlri {
        afi,
        safi,
        withdrawn,
    })
}

/// Ordered, canonicalized attribute collection. Construction sorts by
/// type code (the wire canonical order) and rejects duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct PathAttributeList {
    attrs: Vec<PathAttribute>,
}

impl PathAttributeList {
    pub fn new(mut attrs: Vec<PathAttribute>) -> BgpResult<PathAttributeList> {
        attrs.sort_by_key(PathAttribute::type_code);
        for pair in attrs.windows(2) {
            if pair[0].type_code() == pair[1].type_code() {
                return Err(attr_err(
                    &format!("duplicate attribute {}", pair[0].type_code()),
                    notify::MALFORMED_ATTRIBUTE_LIST,
                ));
            }
        }
        Ok(PathAttributeList { attrs })
    }

    pub fn attrs(&self) -> &[PathAttribute] {
        &self.attrs
    }

    pub fn get(&self, type_code: u8) -> Option<&PathAttribute> {
        self.attrs.iter().find(|a| a.type_code() == type_code)
    }

    /// Insert or replace, preserving canonical order.
    pub fn replace(&mut self, attr: PathAttribute) {
        self.attrs.retain(|a| a.type_code() != attr.type_code());
        self.attrs.push(attr);
        self.attrs.sort_by_key(PathAttribute::type_code);
    }

    pub fn remove(&mut self, type_code: u8) {
        self.attrs.retain(|a| a.type_code() != type_code);
    }

    pub fn origin(&self) -> Option<Origin> {
        match self.get(attr_type::ORIGIN) {
            Some(PathAttribute::Origin(o)) => Some(*o),
            _ => None,
        }
    }

    pub fn aspath(&self) -> Option<&AsPath> {
        match self.get(attr_type::AS_PATH) {
            Some(PathAttribute::AsPath(p)) => Some(p),
            _ => None,
        }
    }

    pub fn nexthop4(&self) -> Option<std::net::Ipv4Addr> {
        match self.get(attr_type::NEXT_HOP) {
            Some(PathAttribute::NextHop(a)) => Some(*a),
            _ => None,
        }
    }

    /// The effective next hop: legacy NEXT_HOP or the MP_REACH one.
    pub fn nexthop(&self) -> Option<IpAddr> {
        if let Some(a) = self.nexthop4() {
            return Some(IpAddr::V4(a));
        }
        match self.get(attr_type::MP_REACH_NLRI) {
            Some(PathAttribute::MpReach(mp)) => Some(mp.nexthop),
            _ => None,
        }
    }

    pub fn med(&self) -> Option<u32> {
        match self.get(attr_type::MED) {
            Some(PathAttribute::MultiExitDisc(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn local_pref(&self) -> Option<u32> {
        match self.get(attr_type::LOCAL_PREF) {
            Some(PathAttribute::LocalPref(v)) => Some(*v),
            _ => None,
        }
    }

    /// The mandatory attributes every announced v4-unicast route needs.
    pub fn complete(&self) -> bool {
        self.origin().is_some() && self.aspath().is_some() && self.nexthop().is_some()
    }

    pub fn encode(&self, four_byte_as: bool, out: &mut Vec<u8>) {
        for attr in &self.attrs {
            attr.encode(four_byte_as, out);
        }
    }

    /// Canonical wire form, used as the dedup key by the attribute
    /// manager.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(true, &mut out);
        out
    }

    pub fn decode(buf: &[u8], four_byte_as: bool) -> BgpResult<PathAttributeList> {
        let mut cur = Cursor::new(buf);
        let mut attrs = Vec::new();
        while !cur.is_empty() {
            attrs.push(PathAttribute::decode(&mut cur, four_byte_as)?);
        }
        PathAttributeList::new(attrs)
    }
}
