//! Error types for the event crate

use std::os::fd::RawFd;

use thiserror::Error;

use crate::selector::IoEventType;

pub type EventResult<T> = Result<T, EventError>;

/// Errors from event loop operations.
#[derive(Debug, Error)]
pub enum EventError {
    /// `poll(2)` failed.
    #[error("poll failed: {0}")]
    Poll(#[from] nix::Error),

    /// A callback is already registered for this fd and interest.
    #[error("fd {0} already has a {1:?} callback")]
    AlreadyRegistered(RawFd, IoEventType),

    /// No callback is registered for this fd and interest.
    #[error("fd {0} has no {1:?} callback")]
    NotRegistered(RawFd, IoEventType),

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
