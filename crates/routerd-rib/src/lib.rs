//! # routerd-rib
//!
//! The redistribution pipeline: per-protocol origin tables, redist
//! tables mirroring their prefix index, redistributors delivering
//! exactly the stream of adds and deletes that materializes a table at
//! each consumer, and deletion tables draining retired generations at
//! background priority.
//!
//! ## Modules
//!
//! - `addr` - address-family abstraction (IPv4/IPv6 over one impl)
//! - `route` - route entries, protocol handles, best-route ordering
//! - `origin` - per-(protocol, generation) route storage
//! - `redist` - redist tables, outputs, and the dump state machine
//! - `deletion` - retired-generation teardown
//! - `policy_adapter` - routes presented as policy variable maps
//! - `error` - error types

pub mod addr;
pub mod deletion;
pub mod error;
pub mod origin;
pub mod policy_adapter;
pub mod redist;
pub mod route;

pub use addr::RibAddr;
pub use policy_adapter::{PolicyAddr, RouteVarRW};
pub use deletion::{spawn_drain_task, DeletionTable};
pub use error::{RibError, RibResult};
pub use origin::OriginTable;
pub use redist::{spawn_dump_task, DumpProgress, RedistOutput, RedistState, RedistTable, Redistributor};
pub use route::{default_admin_distance, PathType, ProtocolHandle, RouteEntry};
