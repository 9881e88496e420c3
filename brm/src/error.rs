//! Error taxonomy for the Border Routing Manager.
//!
//! BRM never panics on network input: malformed ND options are dropped
//! with a `debug!`/`warn!` log line, not surfaced as an `Err`. `BrmError`
//! is reserved for the consumer-facing API — configuration conflicts and
//! (in debug builds) invariant violations.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrmError {
    #[error("operation requires BRM to be enabled")]
    Disabled,

    #[error("configuration conflict: {0}")]
    ConfigConflict(&'static str),

    #[error("invalid prefix length {0} (must be 0..=128)")]
    InvalidPrefixLength(u8),

    #[error("dhcp6-pd report malformed: {0}")]
    MalformedPdReport(&'static str),

    #[error("persistence I/O error: {0}")]
    Persistence(#[from] std::io::Error),

    #[error("persistence record malformed: {0}")]
    MalformedRecord(&'static str),

    #[error("invariant violation in {component}: {detail}")]
    InvariantViolation {
        component: &'static str,
        detail: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, BrmError>;
