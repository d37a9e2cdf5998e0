//! # routerd-bgp
//!
//! The BGP message core: RFC 4271 framing, OPEN capability
//! negotiation, UPDATE path-attribute parsing with multiprotocol
//! extensions, interned path-attribute lists, the event-loop socket
//! client, and the per-peer handler that translates between wire
//! messages and RIB operations across the four (AFI, SAFI) planes.
//!
//! ## Modules
//!
//! - `types` - constants, AS numbers, AFI/SAFI, notification codes
//! - `wire` - cursor and prefix codecs
//! - `aspath` - AS path segments
//! - `path_attr` - typed attributes and canonical lists
//! - `capability` - OPEN parameters and negotiation
//! - `message` - message encode/decode
//! - `attr_manager` - attribute list interning
//! - `socket` - per-peer TCP client on the event loop
//! - `peer` - the peer handler
//! - `error` - error types with NOTIFICATION mapping

pub mod aspath;
pub mod attr_manager;
pub mod capability;
pub mod error;
pub mod message;
pub mod path_attr;
pub mod peer;
pub mod socket;
pub mod types;

mod wire;

pub use aspath::{AsPath, AsSegment, SegmentType};
pub use attr_manager::{AttributeManager, CacheOutcome};
pub use capability::{negotiate, Capability, Negotiated};
pub use error::{BgpError, BgpResult};
pub use message::{
    parse_header, Message, NotificationMessage, OpenMessage, RouteRefreshMessage, UpdatePacket,
};
pub use path_attr::{
    attr_type, MpReachNlri, MpUnreachNlri, Origin, PathAttribute, PathAttributeList,
};
pub use peer::{PeerConfig, PeerHandler, PlumbingSink, SharedSink, SubnetRoute};
pub use socket::{SocketClient, SocketEvent};
pub use types::{
    notify, Afi, AsNum, MessageType, Safi, ALL_PLANES, AS_TRANS, BGP_HEADER_LEN,
    BGP_MAX_MESSAGE_LEN, BGP_VERSION,
};
