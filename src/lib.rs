//! # podcast-dl
//!
//! Backend library for downloading podcast episodes from a subscription
//! service.
//!
//! ## Design Philosophy
//!
//! podcast-dl is designed to be:
//! - **Hands-off about sessions** - Tokens are cached, refreshed and
//!   re-acquired behind the scenes; callers never juggle credentials
//! - **Resumable** - Interrupted downloads pick up their already staged
//!   segments instead of starting over
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use podcast_dl::{Config, Credentials, DownloadOptions, DownloadOutcome, EpisodeId, PodcastDownloader};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let credentials = Credentials {
//!         username: "user@example.com".to_string(),
//!         password: "secret".to_string(),
//!     };
//!
//!     let downloader = PodcastDownloader::new(config, credentials).await?;
//!
//!     // Subscribe to events
//!     let mut events = downloader.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     match downloader.download_episode(EpisodeId(12345), DownloadOptions::default()).await? {
//!         DownloadOutcome::Cached(path) => println!("already at {}", path.display()),
//!         DownloadOutcome::Started(job) | DownloadOutcome::AlreadyRunning(job) => {
//!             let path = job.await_finished().await?;
//!             println!("downloaded to {}", path.display());
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Final assembly and publication
pub mod assembler;
/// Session and token lifecycle
pub mod auth;
/// Episode cache index
pub mod cache;
/// Catalog browsing
pub mod catalog;
/// Configuration types
pub mod config;
/// Episode download orchestration
pub mod downloader;
/// Error types
pub mod error;
/// Segment fetching and staging
pub mod fetcher;
/// Manifest resolution
pub mod manifest;
/// External media merge tool
pub mod merge;
/// Retry logic with exponential backoff
pub mod retry;
/// Persistent token storage
pub mod store;
/// Authenticated HTTP transport
pub mod transport;
/// Core types
pub mod types;

pub use auth::SessionState;
pub use catalog::{Catalog, Episode, Podcast, Subscription};
pub use config::{AuthConfig, Config, DownloadConfig, RetryConfig, ToolsConfig, TransportConfig};
pub use downloader::{DownloadOutcome, JobHandle, JobResult, PodcastDownloader};
pub use error::{Error, Result};
pub use types::{
    ByteRange, CacheEntry, Credentials, DownloadOptions, EpisodeId, Event, JobFailure, JobStatus,
    SegmentDescriptor, StreamManifest, TokenPair,
};
