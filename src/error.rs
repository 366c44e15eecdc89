//! Crate-wide error type.
//!
//! Errors fall into three classes:
//!   - Resource errors (`Mem`, `MemLimit`) leave the session usable.  The
//!     caller may free memory or raise the limit and call again.
//!   - Format errors (`Options`, `Data`) mean the input or the filter
//!     description cannot be handled.  The session is dead.
//!   - Programming errors (`Prog`) mean the caller broke the contract.
//!
//! `Buf` is a progress report rather than a failure: two consecutive calls
//! made no progress at all.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Cannot allocate memory")]
    Mem,
    #[error("Memory usage limit reached ({needed} bytes needed, limit {limit})")]
    MemLimit { needed: u64, limit: u64 },
    #[error("Unsupported options: {0}")]
    Options(&'static str),
    #[error("Corrupt data: {0}")]
    Data(&'static str),
    #[error("No progress is possible")]
    Buf,
    #[error("Programming error: {0}")]
    Prog(&'static str),
    #[error("Operation not supported by this coder")]
    Unsupported,
}

impl Error {
    /// `true` for errors after which the same call may be retried.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Mem | Error::MemLimit { .. } | Error::Buf)
    }
}
