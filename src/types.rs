//! Core types for podcast-dl

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Unique identifier for an episode
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EpisodeId(pub u64);

impl std::fmt::Display for EpisodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for EpisodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::str::FromStr for EpisodeId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse::<u64>().map(Self)
    }
}

/// Account credentials used for full password logins
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    /// Account identifier (email address)
    pub username: String,
    /// Account secret
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    // the secret never appears in logs or panic messages
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// An access token with its refresh companion and absolute expiry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    /// Bearer token attached to outgoing requests
    pub access_token: String,
    /// Long-lived token used to renew the access token, when granted
    pub refresh_token: Option<String>,
    /// Absolute instant at which the access token stops being accepted
    pub expires_at: DateTime<Utc>,
}

impl TokenPair {
    /// Whether the token is still usable once `margin` is subtracted from
    /// its expiry.
    ///
    /// The margin absorbs clock skew and request latency so a token never
    /// expires mid-flight.
    pub fn is_fresh(&self, margin: Duration) -> bool {
        let margin = chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::zero());
        self.expires_at - margin > Utc::now()
    }
}

/// Byte range of a segment inside a shared media file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    /// Offset of the first byte
    pub offset: u64,
    /// Number of bytes in the range, always at least one
    pub length: u64,
}

impl ByteRange {
    /// Render as an HTTP `Range` header value
    pub fn to_header_value(self) -> String {
        format!("bytes={}-{}", self.offset, self.offset + self.length - 1)
    }
}

/// A single addressable piece of an episode's media
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    /// Zero-based position within the episode
    pub index: usize,
    /// Absolute URL the segment is fetched from
    pub url: String,
    /// Byte range within the URL, for manifests that pack segments into one file
    pub byte_range: Option<ByteRange>,
    /// Expected size in bytes, when the manifest declares one
    pub expected_size: Option<u64>,
}

/// Ordered, validated list of segments making up one episode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamManifest {
    /// Episode the manifest belongs to
    pub episode_id: EpisodeId,
    /// Segments in playback order
    pub segments: Vec<SegmentDescriptor>,
}

impl StreamManifest {
    /// Check the contiguous-index contract: indices run 0..n with no gaps
    /// or duplicates, and at least one segment is present.
    ///
    /// Runs before any segment fetch is attempted so a broken manifest
    /// never costs network traffic.
    pub fn validate(&self) -> Result<()> {
        if self.segments.is_empty() {
            return Err(Error::MalformedManifest(format!(
                "episode {} manifest contains no segments",
                self.episode_id
            )));
        }
        for (position, segment) in self.segments.iter().enumerate() {
            if segment.index != position {
                return Err(Error::MalformedManifest(format!(
                    "episode {} manifest has index {} at position {position}",
                    self.episode_id, segment.index
                )));
            }
        }
        Ok(())
    }

    /// Number of segments in the manifest
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether the manifest has no segments
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Lifecycle state of a download job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted, not yet started
    Queued,
    /// Resolving the episode's manifest
    ResolvingManifest,
    /// Fetching segments with bounded concurrency
    FetchingSegments,
    /// Merging staged segments into the final file
    Assembling,
    /// Final file published to the cache
    Complete,
    /// Terminal failure; staged segments retained
    Failed,
}

impl JobStatus {
    /// Whether the status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::ResolvingManifest => "resolving_manifest",
            JobStatus::FetchingSegments => "fetching_segments",
            JobStatus::Assembling => "assembling",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A published episode file recorded in the cache index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Episode the file belongs to
    pub episode_id: EpisodeId,
    /// Absolute path of the published file
    pub path: PathBuf,
    /// Size in bytes at publication time
    pub size_bytes: u64,
    /// SHA-256 of the published file, hex-encoded
    pub sha256: String,
    /// When the file was published
    pub created_at: DateTime<Utc>,
}

/// Per-request options for `download_episode`
#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadOptions {
    /// Re-download even if a valid cached file exists
    pub force: bool,
}

/// Summary of a terminal job failure, cloneable for events and handles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFailure {
    /// Machine-readable failure kind (see [`Error::kind`])
    pub kind: String,
    /// Human-readable description
    pub message: String,
    /// Segments staged before the failure
    pub segments_completed: u64,
    /// Total segments in the manifest, 0 if it was never resolved
    pub segments_total: u64,
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}/{} segments staged)",
            self.message, self.segments_completed, self.segments_total
        )
    }
}

impl std::error::Error for JobFailure {}

/// Events emitted over the broadcast channel as downloads progress
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A download job was accepted
    JobQueued {
        /// Episode being downloaded
        episode_id: EpisodeId,
    },
    /// Manifest resolved and validated
    ManifestResolved {
        /// Episode being downloaded
        episode_id: EpisodeId,
        /// Number of segments the episode consists of
        segments: usize,
    },
    /// A segment finished staging
    SegmentFinished {
        /// Episode being downloaded
        episode_id: EpisodeId,
        /// Segments staged so far
        completed: u64,
        /// Total segments in the manifest
        total: u64,
    },
    /// All segments staged, merge started
    Assembling {
        /// Episode being downloaded
        episode_id: EpisodeId,
    },
    /// Final file published to the cache
    Complete {
        /// Episode that finished
        episode_id: EpisodeId,
        /// Published file path
        path: PathBuf,
    },
    /// Job reached a terminal failure
    JobFailed {
        /// Episode that failed
        episode_id: EpisodeId,
        /// Failure summary
        failure: JobFailure,
    },
    /// Job was cancelled by the caller
    JobCancelled {
        /// Episode whose job was cancelled
        episode_id: EpisodeId,
    },
    /// Session obtained a new access token
    TokenRefreshed {
        /// Expiry of the new token
        expires_at: DateTime<Utc>,
    },
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn segment(index: usize) -> SegmentDescriptor {
        SegmentDescriptor {
            index,
            url: format!("https://cdn.example.com/seg/{index}.mp4"),
            byte_range: None,
            expected_size: None,
        }
    }

    #[test]
    fn token_freshness_respects_margin() {
        let pair = TokenPair {
            access_token: "tok".into(),
            refresh_token: None,
            expires_at: Utc::now() + chrono::Duration::seconds(90),
        };
        assert!(
            pair.is_fresh(Duration::from_secs(60)),
            "90s of validity with a 60s margin should be fresh"
        );
        assert!(
            !pair.is_fresh(Duration::from_secs(120)),
            "90s of validity with a 120s margin should not be fresh"
        );
    }

    #[test]
    fn expired_token_is_never_fresh() {
        let pair = TokenPair {
            access_token: "tok".into(),
            refresh_token: None,
            expires_at: Utc::now() - chrono::Duration::seconds(10),
        };
        assert!(!pair.is_fresh(Duration::ZERO));
    }

    #[test]
    fn manifest_with_contiguous_indices_validates() {
        let manifest = StreamManifest {
            episode_id: EpisodeId(1),
            segments: vec![segment(0), segment(1), segment(2)],
        };
        manifest.validate().unwrap();
    }

    #[test]
    fn empty_manifest_is_rejected() {
        let manifest = StreamManifest {
            episode_id: EpisodeId(1),
            segments: vec![],
        };
        let err = manifest.validate().unwrap_err();
        assert_eq!(err.kind(), "malformed_manifest");
    }

    #[test]
    fn manifest_with_gap_is_rejected() {
        let manifest = StreamManifest {
            episode_id: EpisodeId(1),
            segments: vec![segment(0), segment(2)],
        };
        let err = manifest.validate().unwrap_err();
        assert_eq!(err.kind(), "malformed_manifest");
    }

    #[test]
    fn manifest_with_duplicate_is_rejected() {
        let manifest = StreamManifest {
            episode_id: EpisodeId(1),
            segments: vec![segment(0), segment(0)],
        };
        let err = manifest.validate().unwrap_err();
        assert_eq!(err.kind(), "malformed_manifest");
    }

    #[test]
    fn byte_range_renders_inclusive_header() {
        let range = ByteRange {
            offset: 100,
            length: 50,
        };
        assert_eq!(range.to_header_value(), "bytes=100-149");
    }

    #[test]
    fn credentials_debug_redacts_the_password() {
        let creds = Credentials {
            username: "user@example.com".into(),
            password: "hunter2".into(),
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("hunter2"), "password leaked: {rendered}");
        assert!(rendered.contains("user@example.com"));
    }

    #[test]
    fn terminal_statuses_are_flagged() {
        assert!(JobStatus::Complete.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::FetchingSegments.is_terminal());
    }

    #[test]
    fn events_serialize_with_snake_case_tag() {
        let event = Event::SegmentFinished {
            episode_id: EpisodeId(5),
            completed: 3,
            total: 10,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "segment_finished");
        assert_eq!(json["episode_id"], 5);
        assert_eq!(json["completed"], 3);
    }
}
