//! # Error Kinds
//!
//! martendb uses `eyre::Result` throughout. Structural validation failures
//! (short buffers, malformed headers) are reported as ad-hoc `eyre` reports
//! via `ensure!`/`bail!`. Conditions a caller is expected to branch on are
//! raised as a typed [`DbError`] wrapped in the report, and can be recovered
//! with `Report::downcast_ref::<DbError>()` or the predicates below:
//!
//! ```ignore
//! match db.erase(b"missing") {
//!     Err(e) if DbError::is_not_found(&e) => { /* key was absent */ }
//!     other => other?,
//! }
//! ```
//!
//! ## Propagation Policy
//!
//! Structural primitives abort the current operation on any error and bubble
//! the report up unchanged. Partial mutations may leave dirty pages in the
//! cache, but nothing reaches the device until a flush, so the on-disk tree
//! remains the pre-operation tree.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    /// The requested key does not exist (erase/find/cursor moves).
    #[error("key not found")]
    KeyNotFound,

    /// Insert collision while overwrite was not requested.
    #[error("key already exists")]
    KeyExists,

    /// Device read/write failure, propagated verbatim.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Checksum mismatch, malformed header, dangling blob reference.
    #[error("data corruption: {0}")]
    Corruption(String),

    /// Operation attempted in the wrong state (e.g. overwrite on a nil
    /// cursor) or with unsupported flags.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Scratch allocation failed.
    #[error("out of memory")]
    OutOfMemory,
}

impl DbError {
    pub fn is_not_found(report: &eyre::Report) -> bool {
        matches!(report.downcast_ref::<DbError>(), Some(DbError::KeyNotFound))
    }

    pub fn is_key_exists(report: &eyre::Report) -> bool {
        matches!(report.downcast_ref::<DbError>(), Some(DbError::KeyExists))
    }

    pub fn is_corruption(report: &eyre::Report) -> bool {
        matches!(report.downcast_ref::<DbError>(), Some(DbError::Corruption(_)))
    }

    pub fn is_invalid_argument(report: &eyre::Report) -> bool {
        matches!(
            report.downcast_ref::<DbError>(),
            Some(DbError::InvalidArgument(_))
        )
    }
}

/// Shorthand for building a corruption report with a formatted message.
pub(crate) fn corruption(msg: impl Into<String>) -> eyre::Report {
    DbError::Corruption(msg.into()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downcast_recovers_kind() {
        let report: eyre::Report = DbError::KeyNotFound.into();
        assert!(DbError::is_not_found(&report));
        assert!(!DbError::is_key_exists(&report));
    }

    #[test]
    fn corruption_carries_message() {
        let report = corruption(format!("bad page {}", 7));
        assert!(DbError::is_corruption(&report));
        assert!(report.to_string().contains("bad page 7"));
    }

    #[test]
    fn io_errors_wrap_transparently() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let report: eyre::Report = DbError::from(io).into();
        assert!(report.to_string().contains("eof"));
    }

    #[test]
    fn invalid_argument_predicate() {
        let report: eyre::Report = DbError::InvalidArgument("wrong cursor state").into();
        assert!(DbError::is_invalid_argument(&report));
        assert!(!DbError::is_corruption(&report));
    }
}
