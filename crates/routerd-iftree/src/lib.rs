//! # routerd-iftree
//!
//! The interface mirror: a hierarchical, read-mostly snapshot of the
//! forwarding plane's interfaces (Interface -> Vif -> addresses),
//! shared by every daemon in the suite. The forwarding-plane client is
//! the only writer; daemons observe change notifications and re-query.
//!
//! ## Modules
//!
//! - `mac` - Ethernet address type
//! - `tree` - the interface tree and lookup helpers
//! - `observer` - mirror update path and observer surface

pub mod mac;
pub mod observer;
pub mod tree;

pub use mac::Mac;
pub use observer::{IfMirror, IfTreeObserver};
pub use tree::{IfFlags, IfTree, IfTreeAddr4, IfTreeAddr6, IfTreeInterface, IfTreeVif};
