//! BGP message framing
//!
//! The RFC 4271 header plus typed decode/encode for OPEN, UPDATE,
//! NOTIFICATION, KEEPALIVE, and ROUTE_REFRESH. Decoding is strict:
//! anything malformed maps to the NOTIFICATION the peer must receive.

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;

use crate::capability::{decode_parameters, encode_parameters, Capability};
use crate::error::{BgpError, BgpResult};
use crate::path_attr::{attr_type, MpReachNlri, MpUnreachNlri, PathAttribute, PathAttributeList};
use crate::types::{
    notify, Afi, AsNum, MessageType, Safi, AS_TRANS, BGP_HEADER_LEN, BGP_MARKER,
    BGP_MAX_MESSAGE_LEN, BGP_VERSION,
};
use crate::wire::{decode_prefix_v4, encode_prefix_v4, Cursor};

/// Space kept free when batching routes into an UPDATE, so one more
/// attribute block or prefix never overruns the 4096-octet ceiling.
const UPDATE_SLACK: usize = 256;

fn header_err(reason: &str, subcode: u8) -> BgpError {
    BgpError::corrupt(reason.to_string(), notify::MESSAGE_HEADER_ERROR, subcode)
}

/// Parse the 19-octet header, returning (type, total message length).
pub fn parse_header(buf: &[u8; BGP_HEADER_LEN]) -> BgpResult<(MessageType, usize)> {
    if buf[..16] != BGP_MARKER {
        return Err(header_err(
            "marker not all ones",
            notify::CONNECTION_NOT_SYNCHRONIZED,
        ));
    }
    let len = u16::from_be_bytes([buf[16], buf[17]]) as usize;
    if !(BGP_HEADER_LEN..=BGP_MAX_MESSAGE_LEN).contains(&len) {
        return Err(BgpError::corrupt_with_data(
            format!("bad message length {len}"),
            notify::MESSAGE_HEADER_ERROR,
            notify::BAD_MESSAGE_LENGTH,
            buf[16..18].to_vec(),
        ));
    }
    let mtype = MessageType::from_u8(buf[18]).ok_or_else(|| {
        BgpError::corrupt_with_data(
            format!("bad message type {}", buf[18]),
            notify::MESSAGE_HEADER_ERROR,
            notify::BAD_MESSAGE_TYPE,
            vec![buf[18]],
        )
    })?;
    Ok((mtype, len))
}

fn encode_with_header(mtype: MessageType, body: &[u8]) -> Vec<u8> {
    let total = BGP_HEADER_LEN + body.len();
    debug_assert!(total <= BGP_MAX_MESSAGE_LEN);
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&BGP_MARKER);
    out.extend_from_slice(&(total as u16).to_be_bytes());
    out.push(mtype as u8);
    out.extend_from_slice(body);
    out
}

/// OPEN: version, AS, hold time, identifier, capabilities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenMessage {
    pub version: u8,
    /// The legacy 2-byte My-AS field as carried on the wire.
    pub legacy_as: u16,
    pub hold_time: u16,
    pub bgp_id: Ipv4Addr,
    pub capabilities: Vec<Capability>,
}

impl OpenMessage {
    /// Build an OPEN for our side. An AS above 65535 squeezes the
    /// legacy field to `AS_TRANS` and advertises the 4-byte capability.
    pub fn new(
        as_num: AsNum,
        hold_time: u16,
        bgp_id: Ipv4Addr,
        mut capabilities: Vec<Capability>,
    ) -> OpenMessage {
        if as_num.needs_extended()
            && !capabilities.iter().any(|c| matches!(c, Capability::As4(_)))
        {
            capabilities.push(Capability::As4(as_num));
        }
        OpenMessage {
            version: BGP_VERSION,
            legacy_as: as_num.short_or_trans(),
            hold_time,
            bgp_id,
            capabilities,
        }
    }

    /// The peer's effective AS: the 4-byte capability value when
    /// present (with the legacy field validated), else the legacy one.
    pub fn effective_as(&self) -> BgpResult<AsNum> {
        let as4 = self.capabilities.iter().find_map(|c| match c {
            Capability::As4(asn) => Some(*asn),
            _ => None,
        });
        match as4 {
            Some(asn) => {
                let want = asn.short_or_trans();
                if self.legacy_as != want && self.legacy_as != AS_TRANS {
                    return Err(BgpError::corrupt(
                        format!("legacy AS {} disagrees with AS4 {}", self.legacy_as, asn),
                        notify::OPEN_MESSAGE_ERROR,
                        notify::BAD_PEER_AS,
                    ));
                }
                Ok(asn)
            }
            None => Ok(AsNum::new(self.legacy_as)),
        }
    }

    pub fn decode(body: &[u8]) -> BgpResult<OpenMessage> {
        let mut cur = Cursor::new(body);
        let truncated =
            || BgpError::corrupt("truncated OPEN", notify::MESSAGE_HEADER_ERROR, notify::BAD_MESSAGE_LENGTH);

        let version = cur.u8().ok_or_else(truncated)?;
        if version != BGP_VERSION {
            return Err(BgpError::corrupt_with_data(
                format!("unsupported version {version}"),
                notify::OPEN_MESSAGE_ERROR,
                notify::UNSUPPORTED_VERSION_NUMBER,
                (BGP_VERSION as u16).to_be_bytes().to_vec(),
            ));
        }
        let legacy_as = cur.u16().ok_or_else(truncated)?;
        let hold_time = cur.u16().ok_or_else(truncated)?;
        if hold_time == 1 || hold_time == 2 {
            return Err(BgpError::corrupt(
                format!("unacceptable hold time {hold_time}"),
                notify::OPEN_MESSAGE_ERROR,
                notify::UNACCEPTABLE_HOLD_TIME,
            ));
        }
        let bgp_id = cur.ipv4().ok_or_else(truncated)?;
        if bgp_id == Ipv4Addr::UNSPECIFIED {
            return Err(BgpError::corrupt(
                "zero BGP identifier",
                notify::OPEN_MESSAGE_ERROR,
                notify::BAD_BGP_IDENTIFIER,
            ));
        }
        let capabilities = decode_parameters(&mut cur)?;
        Ok(OpenMessage {
            version,
            legacy_as,
            hold_time,
            bgp_id,
            capabilities,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.push(self.version);
        body.extend_from_slice(&self.legacy_as.to_be_bytes());
        body.extend_from_slice(&self.hold_time.to_be_bytes());
        body.extend_from_slice(&self.bgp_id.octets());
        encode_parameters(&self.capabilities, &mut body);
        encode_with_header(MessageType::Open, &body)
    }
}

/// UPDATE: withdrawn v4 routes, path attributes, v4 NLRI. Non-v4
/// planes ride in the MP_REACH/MP_UNREACH attributes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UpdatePacket {
    pub withdrawn: Vec<Ipv4Network>,
    pub attributes: PathAttributeList,
    pub nlri: Vec<Ipv4Network>,
}

impl UpdatePacket {
    pub fn new() -> UpdatePacket {
        UpdatePacket::default()
    }

    pub fn is_empty(&self) -> bool {
        self.withdrawn.is_empty() && self.attributes.attrs().is_empty() && self.nlri.is_empty()
    }

    pub fn mp_reach(&self) -> Option<&MpReachNlri> {
        match self.attributes.get(attr_type::MP_REACH_NLRI) {
            Some(PathAttribute::MpReach(mp)) => Some(mp),
            _ => None,
        }
    }

    pub fn mp_unreach(&self) -> Option<&MpUnreachNlri> {
        match self.attributes.get(attr_type::MP_UNREACH_NLRI) {
            Some(PathAttribute::MpUnreach(mp)) => Some(mp),
            _ => None,
        }
    }

    pub fn decode(body: &[u8], four_byte_as: bool) -> BgpResult<UpdatePacket> {
        let truncated = || {
            BgpError::corrupt(
                "truncated UPDATE",
                notify::UPDATE_MESSAGE_ERROR,
                notify::MALFORMED_ATTRIBUTE_LIST,
            )
        };
        let mut cur = Cursor::new(body);

        let wlen = cur.u16().ok_or_else(truncated)? as usize;
        let wblock = cur.take(wlen).ok_or_else(truncated)?;
        let mut wcur = Cursor::new(wblock);
        let mut withdrawn = Vec::new();
        while !wcur.is_empty() {
            withdrawn.push(decode_prefix_v4(&mut wcur)?);
        }

        let alen = cur.u16().ok_or_else(truncated)? as usize;
        let ablock = cur.take(alen).ok_or_else(truncated)?;
        let attributes = PathAttributeList::decode(ablock, four_byte_as)?;

        let mut nlri = Vec::new();
        while !cur.is_empty() {
            nlri.push(decode_prefix_v4(&mut cur)?);
        }

        if !nlri.is_empty() && !attributes.complete() {
            return Err(BgpError::corrupt(
                "NLRI without mandatory attributes",
                notify::UPDATE_MESSAGE_ERROR,
                notify::MISSING_WELLKNOWN_ATTRIBUTE,
            ));
        }

        Ok(UpdatePacket {
            withdrawn,
            attributes,
            nlri,
        })
    }

    fn body(&self, four_byte_as: bool) -> Vec<u8> {
        let mut wblock = Vec::new();
        for net in &self.withdrawn {
            encode_prefix_v4(net, &mut wblock);
        }
        let mut ablock = Vec::new();
        self.attributes.encode(four_byte_as, &mut ablock);

        let mut body = Vec::new();
        body.extend_from_slice(&(wblock.len() as u16).to_be_bytes());
        body.extend_from_slice(&wblock);
        body.extend_from_slice(&(ablock.len() as u16).to_be_bytes());
        body.extend_from_slice(&ablock);
        for net in &self.nlri {
            encode_prefix_v4(net, &mut body);
        }
        body
    }

    pub fn encode(&self, four_byte_as: bool) -> Vec<u8> {
        encode_with_header(MessageType::Update, &self.body(four_byte_as))
    }

    /// Total wire size if encoded now.
    pub fn wire_len(&self, four_byte_as: bool) -> usize {
        BGP_HEADER_LEN + self.body(four_byte_as).len()
    }

    /// Is the packet full enough that batching should flush it? Leaves
    /// slack for one more attribute block or prefix below the RFC 4271
    /// ceiling.
    pub fn big_enough(&self, four_byte_as: bool) -> bool {
        self.wire_len(four_byte_as) + UPDATE_SLACK >= BGP_MAX_MESSAGE_LEN
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationMessage {
    pub code: u8,
    pub subcode: u8,
    pub data: Vec<u8>,
}

impl NotificationMessage {
    pub fn decode(body: &[u8]) -> BgpResult<NotificationMessage> {
        if body.len() < 2 {
            return Err(header_err("truncated NOTIFICATION", notify::BAD_MESSAGE_LENGTH));
        }
        Ok(NotificationMessage {
            code: body[0],
            subcode: body[1],
            data: body[2..].to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = vec![self.code, self.subcode];
        body.extend_from_slice(&self.data);
        encode_with_header(MessageType::Notification, &body)
    }
}

impl From<&BgpError> for Option<NotificationMessage> {
    fn from(e: &BgpError) -> Option<NotificationMessage> {
        e.notify().map(|(code, subcode, data)| NotificationMessage {
            code,
            subcode,
            data: data.to_vec(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteRefreshMessage {
    pub afi: Afi,
    pub safi: Safi,
}

impl RouteRefreshMessage {
    pub fn decode(body: &[u8]) -> BgpResult<RouteRefreshMessage> {
        let mut cur = Cursor::new(body);
        let bad = || header_err("truncated ROUTE_REFRESH", notify::BAD_MESSAGE_LENGTH);
        let afi = cur
            .u16()
            .and_then(Afi::from_u16)
            .ok_or_else(bad)?;
        let _reserved = cur.u8().ok_or_else(bad)?;
        let safi = cur.u8().and_then(Safi::from_u8).ok_or_else(bad)?;
        Ok(RouteRefreshMessage { afi, safi })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(4);
        body.extend_from_slice(&(self.afi as u16).to_be_bytes());
        body.push(0);
        body.push(self.safi as u8);
        encode_with_header(MessageType::RouteRefresh, &body)
    }
}

/// A fully decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Open(OpenMessage),
    Update(UpdatePacket),
    Notification(NotificationMessage),
    KeepAlive,
    RouteRefresh(RouteRefreshMessage),
}

impl Message {
    /// Decode a complete wire message (header included).
    pub fn decode(wire: &[u8], four_byte_as: bool) -> BgpResult<Message> {
        if wire.len() < BGP_HEADER_LEN {
            return Err(header_err("short message", notify::BAD_MESSAGE_LENGTH));
        }
        let header: &[u8; BGP_HEADER_LEN] =
            wire[..BGP_HEADER_LEN].try_into().expect("length checked");
        let (mtype, total) = parse_header(header)?;
        if total != wire.len() {
            return Err(header_err(
                "length disagrees with framing",
                notify::BAD_MESSAGE_LENGTH,
            ));
        }
        let body = &wire[BGP_HEADER_LEN..];
        Ok(match mtype {
            MessageType::Open => Message::Open(OpenMessage::decode(body)?),
            MessageType::Update => Message::Update(UpdatePacket::decode(body, four_byte_as)?),
            MessageType::Notification => {
                Message::Notification(NotificationMessage::decode(body)?)
            }
            MessageType::KeepAlive => {
                if !body.is_empty() {
                    return Err(header_err(
                        "KEEPALIVE with body",
                        notify::BAD_MESSAGE_LENGTH,
                    ));
                }
                Message::KeepAlive
            }
            MessageType::RouteRefresh => {
                Message::RouteRefresh(RouteRefreshMessage::decode(body)?)
            }
        })
    }

    pub fn encode(&self, four_byte_as: bool) -> Vec<u8> {
        match self {
            Message::Open(m) => m.encode(),
            Message::Update(m) => m.encode(four_byte_as),
            Message::Notification(m) => m.encode(),
            Message::KeepAlive => encode_with_header(MessageType::KeepAlive, &[]),
            Message::RouteRefresh(m) => m.encode(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aspath::AsPath;
    use crate::path_attr::Origin;
    use ipnetwork::IpNetwork;

    #[test]
    fn test_keepalive_roundtrip() {
        let wire = Message::KeepAlive.encode(false);
        assert_eq!(wire.len(), 19);
        assert_eq!(Message::decode(&wire, false).unwrap(), Message::KeepAlive);
    }

    #[test]
    fn test_header_rejects_bad_marker() {
        let mut wire = Message::KeepAlive.encode(false);
        wire[3] = 0;
        let err = Message::decode(&wire, false).unwrap_err();
        assert_eq!(
            err.notify().map(|(c, s, _)| (c, s)),
            Some((
                notify::MESSAGE_HEADER_ERROR,
                notify::CONNECTION_NOT_SYNCHRONIZED
            ))
        );
    }

    #[test]
    fn test_header_rejects_bad_length_and_type() {
        let mut wire = Message::KeepAlive.encode(false);
        wire[17] = 5; // length 5 < 19
        assert!(Message::decode(&wire, false).is_err());

        let mut wire = Message::KeepAlive.encode(false);
        wire[18] = 9;
        let err = Message::decode(&wire, false).unwrap_err();
        assert_eq!(
            err.notify().map(|(c, s, _)| (c, s)),
            Some((notify::MESSAGE_HEADER_ERROR, notify::BAD_MESSAGE_TYPE))
        );
    }

    #[test]
    fn test_open_roundtrip_with_as4() {
        let open = OpenMessage::new(
            AsNum::new_extended(65537),
            90,
            "192.0.2.1".parse().unwrap(),
            vec![Capability::Multiprotocol(Afi::Ipv4, Safi::Unicast)],
        );
        // The legacy field carries AS_TRANS.
        assert_eq!(open.legacy_as, AS_TRANS);

        let wire = open.encode();
        match Message::decode(&wire, false).unwrap() {
            Message::Open(back) => {
                assert_eq!(back, open);
                assert_eq!(back.effective_as().unwrap(), AsNum::new_extended(65537));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_open_legacy_as_must_match_as4() {
        let mut open = OpenMessage::new(
            AsNum::new_extended(65537),
            90,
            "192.0.2.1".parse().unwrap(),
            vec![],
        );
        open.legacy_as = 4444;
        let err = open.effective_as().unwrap_err();
        assert_eq!(
            err.notify().map(|(c, s, _)| (c, s)),
            Some((notify::OPEN_MESSAGE_ERROR, notify::BAD_PEER_AS))
        );
    }

    #[test]
    fn test_open_rejects_wrong_version() {
        let open = OpenMessage::new(AsNum::new(65001), 90, "192.0.2.1".parse().unwrap(), vec![]);
        let mut wire = open.encode();
        wire[19] = 3; // version byte
        let err = Message::decode(&wire, false).unwrap_err();
        assert_eq!(
            err.notify().map(|(c, s, _)| (c, s)),
            Some((
                notify::OPEN_MESSAGE_ERROR,
                notify::UNSUPPORTED_VERSION_NUMBER
            ))
        );
    }

    fn sample_update() -> UpdatePacket {
        let mut p = UpdatePacket::new();
        p.withdrawn.push("198.51.100.0/24".parse().unwrap());
        p.attributes = PathAttributeList::new(vec![
            PathAttribute::Origin(Origin::Igp),
            PathAttribute::AsPath(AsPath::from_sequence([AsNum::new(65001), AsNum::new(65002)])),
            PathAttribute::NextHop("192.0.2.1".parse().unwrap()),
            PathAttribute::MpReach(MpReachNlri {
                afi: Afi::Ipv6,
                safi: Safi::Unicast,
                nexthop: "2001:db8::1".parse().unwrap(),
                nlri: vec![IpNetwork::V6("2001:db8:2::/48".parse().unwrap())],
            }),
        ])
        .unwrap();
        p.nlri.push("10.0.0.0/8".parse().unwrap());
        p.nlri.push("10.3.0.0/16".parse().unwrap());
        p
    }

    #[test]
    fn test_update_semantic_roundtrip() {
        let p = sample_update();
        let wire = p.encode(false);
        match Message::decode(&wire, false).unwrap() {
            Message::Update(back) => {
                assert_eq!(back.withdrawn, p.withdrawn);
                assert_eq!(back.nlri, p.nlri);
                assert_eq!(back.attributes, p.attributes);
                assert!(back.mp_reach().is_some());
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_update_missing_mandatory_rejected() {
        let mut p = UpdatePacket::new();
        p.nlri.push("10.0.0.0/8".parse().unwrap());
        let wire = p.encode(false);
        let err = Message::decode(&wire, false).unwrap_err();
        assert_eq!(
            err.notify().map(|(c, s, _)| (c, s)),
            Some((
                notify::UPDATE_MESSAGE_ERROR,
                notify::MISSING_WELLKNOWN_ATTRIBUTE
            ))
        );
    }

    #[test]
    fn test_big_enough_threshold() {
        let mut p = sample_update();
        assert!(!p.big_enough(false));
        for i in 0..1200u32 {
            let octets = i.to_be_bytes();
            p.nlri.push(
                Ipv4Network::new(
                    Ipv4Addr::new(10, octets[2], octets[3], 0),
                    24,
                )
                .unwrap(),
            );
            if p.big_enough(false) {
                break;
            }
        }
        assert!(p.big_enough(false));
        assert!(p.wire_len(false) <= BGP_MAX_MESSAGE_LEN);
    }

    #[test]
    fn test_notification_roundtrip() {
        let n = NotificationMessage {
            code: notify::OPEN_MESSAGE_ERROR,
            subcode: notify::UNSUPPORTED_OPTIONAL_PARAMETER,
            data: vec![1, 2],
        };
        let wire = n.encode();
        assert_eq!(
            Message::decode(&wire, false).unwrap(),
            Message::Notification(n)
        );
    }

    #[test]
    fn test_route_refresh_roundtrip() {
        let rr = RouteRefreshMessage {
            afi: Afi::Ipv6,
            safi: Safi::Multicast,
        };
        let wire = rr.encode();
        assert_eq!(
            Message::decode(&wire, false).unwrap(),
            Message::RouteRefresh(rr)
        );
    }
}
