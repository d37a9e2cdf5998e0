//! Error types for the policy crate

use thiserror::Error;

pub type PolicyResult<T> = Result<T, PolicyError>;

/// Errors from policy compilation and evaluation.
///
/// Compile-time errors reject the offending statement; the previously
/// compiled program stays in force. The only runtime variant that can
/// reach a caller is `Execution`; a type mismatch inside a term is
/// absorbed by the VM as a term non-match and never escapes.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("parse error at `{near}`: {message}")]
    Parse { near: String, message: String },

    #[error("unknown variable `{0}` for protocol `{1}`")]
    UnknownVariable(String, String),

    #[error("unknown set `{0}`")]
    UnknownSet(String),

    #[error("variable `{0}` is read-only")]
    ReadOnlyVariable(String),

    #[error("term `{term}`: section `{section}` out of order")]
    SectionOrder { term: String, section: String },

    #[error("no protocol specified in source block of term `{0}`")]
    NoProtoSpec(String),

    #[error("protocol redefined in source block of term `{0}`")]
    ProtoRedefined(String),

    #[error("bad instruction `{0}`")]
    BadInstruction(String),

    #[error("unknown subroutine `{0}`")]
    UnknownSubroutine(String),

    #[error("type mismatch: {op} on {lhs} and {rhs}")]
    TypeMismatch {
        op: &'static str,
        lhs: &'static str,
        rhs: &'static str,
    },

    #[error("execution error: {0}")]
    Execution(String),
}
