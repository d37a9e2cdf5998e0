//! Error types for the RIB crate

use thiserror::Error;

pub type RibResult<T> = Result<T, RibError>;

#[derive(Debug, Error)]
pub enum RibError {
    #[error("no redistributor named `{0}`")]
    UnknownRedistributor(String),

    #[error("redistributor `{0}` already exists")]
    RedistributorExists(String),

    #[error("redistributor `{0}` is shut down")]
    RedistributorDead(String),

    #[error("dump already in progress for `{0}`")]
    DumpInProgress(String),
}
