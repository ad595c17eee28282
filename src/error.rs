//! Error taxonomy for the ingestion pipeline.
//!
//! Recoverable errors (extraction failures, catalog outages, destination
//! conflicts) are converted into page transitions at the orchestrator
//! boundary; only programming-error classes abort a document.

use std::path::PathBuf;
use thiserror::Error;

/// Extraction collaborator failures.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// No source produced a usable field set. Recoverable: the document
    /// routes into guided manual entry.
    #[error("no extraction source produced a usable field set")]
    NoUsableFields,

    #[error("extraction command `{command}` failed: {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("failed to read document {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Catalog service failures.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The catalog could not be reached or answered with a server error.
    /// Recoverable with an operator retry prompt.
    #[error("catalog unavailable: {0}")]
    Unavailable(String),

    #[error("catalog rejected the request: {0}")]
    Rejected(String),

    #[error("catalog returned a malformed response: {0}")]
    Malformed(String),
}

impl CatalogError {
    /// Whether the operator should be offered a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CatalogError::Unavailable(_))
    }
}

/// File lifecycle failures.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The destination exists with different content and the caller did
    /// not pass `replace_existing`. Never auto-resolved.
    #[error("destination already exists with different content: {dst}")]
    DestinationConflict { dst: PathBuf },

    /// Post-copy verification failed; the partial destination has been
    /// removed.
    #[error("verification failed copying {src} -> {dst}: {reason}")]
    VerificationFailed {
        src: PathBuf,
        dst: PathBuf,
        reason: String,
    },

    #[error("transition {from} -> {to} is not allowed")]
    IllegalTransition { from: String, to: String },

    #[error("bridge operation failed: {0}")]
    Bridge(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Navigation engine failures. These are programming-error class: they
/// abort the current document to `failed/` but never crash the daemon.
#[derive(Debug, Error)]
pub enum NavError {
    #[error("no page registered with id `{0}`")]
    UnknownPage(String),

    #[error("navigation exceeded {max_hops} hops (last page `{page}`)")]
    NavigationLoop { page: String, max_hops: usize },

    #[error("page handler failed on `{page}`: {source}")]
    Handler {
        page: String,
        #[source]
        source: anyhow::Error,
    },
}
