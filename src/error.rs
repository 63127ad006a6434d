//! Error types for catalog search and subset retrieval.

use std::io;
use thiserror::Error;

use crate::types::Granule;

/// Errors that abort a run or a catalog search.
#[derive(Error, Debug)]
pub enum SubsetError {
    /// Malformed or degenerate spatial filter. Raised before any network call.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Authentication rejected or credentials unavailable. Fatal for the run.
    #[error("credential error: {0}")]
    CredentialError(String),

    /// The catalog search failed before returning any page.
    #[error("catalog unavailable: {0}")]
    CatalogUnavailable(String),

    /// A later catalog page failed; the granules collected so far are kept.
    #[error("catalog search incomplete after {} granule(s): {reason}", granules.len())]
    PartialCatalogResult {
        /// Granules collected before the failing page.
        granules: Vec<Granule>,
        /// Description of the page failure.
        reason: String,
    },

    /// I/O error during file operations.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// HTTP request error.
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Terminal classification of a single granule download attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DownloadErrorKind {
    /// Network timeout, connection reset, or 5xx response. Retried with backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Rejected request or malformed subset response. Not retried.
    #[error("request rejected: {0}")]
    NonTransient(String),

    /// Authorization still rejected after a token refresh.
    #[error("authorization rejected after token refresh")]
    AuthExpired,

    /// Run-level cancellation reached this granule before it finished.
    #[error("cancelled")]
    Cancelled,
}
