//! # Error Handling
//!
//! This module defines the error types used throughout the crate. We use a
//! single error enum ([`Error`]) to represent all failure modes, which keeps
//! function signatures simple and lets callers at the ingestion and request
//! boundaries handle failures uniformly (retry the whole chunk / request).
//!
//! ## Error Categories
//!
//! | Category | Variant | Typical Response |
//! |----------|---------|------------------|
//! | Bad input | [`Error::BadEvent`] | Reject the chunk, do not persist |
//! | Missing row | [`Error::NotFound`] | Caller decides if fatal |
//! | Corruption | [`Error::Invariant`] | Abort transaction, report upstream |
//! | Infrastructure | [`Error::Database`] | Retry the whole chunk/request |
//!
//! Duplicate `event_id` inserts are deliberately *not* an error: the storage
//! layer swallows the conflict and reports a reduced insert count. Nothing is
//! retried inside the core — every write runs in a single transaction and is
//! idempotent on re-invocation, so retry is the caller's concern.

use thiserror::Error;

/// All errors that can occur in sashsync operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Input event JSON is unusable: missing `event_id` or not an object.
    ///
    /// Surfaced to the ingestion caller before anything is persisted.
    #[error("bad event: {0}")]
    BadEvent(String),

    /// A bulk query was constructed with impossible parameters, e.g. a row
    /// wide enough to exceed the statement parameter cap on its own.
    ///
    /// Unlike [`Error::BadEvent`] this signals a bug in the calling query,
    /// not bad input data.
    #[error("bad query: {0}")]
    BadQuery(String),

    /// A snapshot id or event NID referenced an unknown row.
    ///
    /// This is surfaced as an error rather than silently skipped; the caller
    /// decides whether it is fatal for the request in flight.
    #[error("{kind} {id} not found")]
    NotFound {
        /// The kind of row that was missing, e.g. `"snapshot"`.
        kind: &'static str,
        /// The identifier that failed to resolve.
        id: String,
    },

    /// Stored data violates a structural invariant, e.g. a `replaces_nid`
    /// pointing outside its before-state snapshot.
    ///
    /// These signal a bug in the writer. The surrounding transaction is
    /// aborted and the error should be reported to error tracking.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Postgres operation failed: connectivity, aborted transaction,
    /// deadlock, serialization failure.
    ///
    /// Propagated as-is. Callers at the ingestion boundary retry the whole
    /// chunk; readers retry the whole request.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    /// Error messages appear in logs and upstream error tracking; make sure
    /// they carry the relevant identifiers.
    #[test]
    fn test_error_display() {
        let bad = Error::BadEvent("event JSON missing event_id key".to_string());
        assert_eq!(bad.to_string(), "bad event: event JSON missing event_id key");

        let query = Error::BadQuery("params_per_row must be non-zero".to_string());
        assert_eq!(query.to_string(), "bad query: params_per_row must be non-zero");

        let missing = Error::NotFound {
            kind: "snapshot",
            id: "42".to_string(),
        };
        assert_eq!(missing.to_string(), "snapshot 42 not found");

        let broken = Error::Invariant("replaces_nid 7 not in snapshot 3".to_string());
        assert_eq!(
            broken.to_string(),
            "invariant violated: replaces_nid 7 not in snapshot 3"
        );
    }

    /// `?` must convert sqlx errors automatically via `#[from]`.
    #[test]
    fn test_sqlx_error_conversion() {
        let sqlx_err = sqlx::Error::RowNotFound;
        let our_err: Error = sqlx_err.into();
        assert!(matches!(our_err, Error::Database(_)));
        assert!(our_err.to_string().contains("database error"));
    }
}
