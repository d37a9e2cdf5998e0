//! Error types for the BGP crate
//!
//! Wire-level failures carry the NOTIFICATION (code, subcode, data)
//! the peer must be sent before teardown; everything else is local.

use thiserror::Error;

use crate::types::{Afi, Safi};

pub type BgpResult<T> = Result<T, BgpError>;

#[derive(Debug, Error)]
pub enum BgpError {
    /// A malformed message. Maps directly onto a NOTIFICATION.
    #[error("corrupt message: {reason} (notify {code}/{subcode})")]
    CorruptMessage {
        reason: String,
        code: u8,
        subcode: u8,
        data: Vec<u8>,
    },

    /// An announcement cannot be encoded for its plane.
    #[error("cannot announce on {afi:?}/{safi:?}: {reason}")]
    Announce {
        afi: Afi,
        safi: Safi,
        reason: &'static str,
    },

    #[error("peer not connected")]
    NotConnected,

    #[error("socket error: {0}")]
    Socket(#[from] nix::Error),

    #[error(transparent)]
    Event(#[from] routerd_event::EventError),
}

impl BgpError {
    pub fn corrupt(reason: impl Into<String>, code: u8, subcode: u8) -> BgpError {
        BgpError::CorruptMessage {
            reason: reason.into(),
            code,
            subcode,
            data: Vec::new(),
        }
    }

    pub fn corrupt_with_data(
        reason: impl Into<String>,
        code: u8,
        subcode: u8,
        data: Vec<u8>,
    ) -> BgpError {
        BgpError::CorruptMessage {
            reason: reason.into(),
            code,
            subcode,
            data,
        }
    }

    /// The NOTIFICATION this error maps to, if it is a wire error.
    pub fn notify(&self) -> Option<(u8, u8, &[u8])> {
        match self {
            BgpError::CorruptMessage {
                code,
                subcode,
                data,
                ..
            } => Some((*code, *subcode, data)),
            _ => None,
        }
    }
}
