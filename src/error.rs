//! Error types for podcast-dl
//!
//! The taxonomy separates transient infrastructure failures (network, rate
//! limits) from content-level failures (missing episode, malformed manifest)
//! and from session failures (rejected credentials). Transient failures are
//! retried internally with bounded backoff and only surface once exhausted;
//! content-level failures are never retried automatically.

use std::time::Duration;
use thiserror::Error;

use crate::types::EpisodeId;

/// Result type alias for podcast-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for podcast-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Local token cache could not be read or written.
    ///
    /// Non-fatal: callers treat it as "no cached token" and fall back to a
    /// full login.
    #[error("token store unavailable: {0}")]
    StoreUnavailable(String),

    /// Credentials or refresh token rejected after exhausting recovery.
    ///
    /// Fatal to the session; surfaced to the caller.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Network-level error, surfaced after bounded retries
    #[error("network error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Remote service rate limit, surfaced after bounded backoff
    #[error("rate limited by remote service")]
    RateLimited {
        /// Server-indicated wait before the next attempt, if any
        retry_after: Option<Duration>,
    },

    /// Episode does not exist or access is denied (e.g. subscription required)
    #[error("manifest unavailable for episode {episode_id}: {reason}")]
    ManifestUnavailable {
        /// Episode whose manifest could not be obtained
        episode_id: EpisodeId,
        /// Why the manifest is unavailable
        reason: String,
    },

    /// Manifest violates the contiguous-segment contract (gap, duplicate, empty)
    #[error("malformed manifest: {0}")]
    MalformedManifest(String),

    /// One or more segments exhausted their retry budget.
    ///
    /// Staged segments are retained so a retry of the same episode resumes
    /// instead of re-fetching everything.
    #[error("{failed} of {total} segments failed ({completed} staged)")]
    SegmentsFailed {
        /// Segments successfully staged
        completed: usize,
        /// Segments that exhausted their retry budget
        failed: usize,
        /// Total segments in the manifest
        total: usize,
    },

    /// External media-merge tool missing or exited with an error.
    ///
    /// Staged segments are left intact; re-running the download resumes at
    /// assembly without re-fetching.
    #[error("assembly failed: {0}")]
    AssemblyFailed(String),

    /// Operation cancelled by the caller
    #[error("operation cancelled")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Remote resource not found
    #[error("not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Machine-readable error kind, stable across message changes.
    ///
    /// Used in events and job failure reports so callers can branch without
    /// parsing Display output.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::StoreUnavailable(_) => "store_unavailable",
            Error::AuthenticationFailed(_) => "authentication_failed",
            Error::Transport(_) => "transport_error",
            Error::RateLimited { .. } => "rate_limited",
            Error::ManifestUnavailable { .. } => "manifest_unavailable",
            Error::MalformedManifest(_) => "malformed_manifest",
            Error::SegmentsFailed { .. } => "segments_failed",
            Error::AssemblyFailed(_) => "assembly_failed",
            Error::Cancelled => "cancelled",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
            Error::NotFound(_) => "not_found",
        }
    }
}
