//! Segment fetching and staging
//!
//! Fetches a manifest's segments with bounded concurrency and stages each
//! one as its own file. A segment only reaches its final staged name
//! through a rename, so staged files are complete by construction and a
//! later run can resume by size-checking what is already on disk.
//!
//! Per-segment failures never abort the batch: every segment consumes its
//! own retry budget and the report carries the full per-segment picture.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::retry::request_with_retry;
use crate::transport::Transport;
use crate::types::{SegmentDescriptor, StreamManifest};

/// Staged file name for a segment index, zero-padded to keep lexical and
/// numeric ordering identical
pub fn staged_path(staging_dir: &Path, index: usize) -> PathBuf {
    staging_dir.join(format!("{index:05}.seg"))
}

/// What happened to one segment during a fetch run
#[derive(Debug, Clone)]
pub enum SegmentOutcome {
    /// Fetched over the network and staged this run
    Staged {
        /// Segment index
        index: usize,
        /// Bytes written
        bytes: u64,
    },
    /// Valid staged file from an earlier run, no network spent
    Reused {
        /// Segment index
        index: usize,
        /// Bytes on disk
        bytes: u64,
    },
    /// Retry budget exhausted
    Failed {
        /// Segment index
        index: usize,
        /// Final error, rendered
        error: String,
    },
    /// Fetch stopped by cancellation
    Cancelled {
        /// Segment index
        index: usize,
    },
}

impl SegmentOutcome {
    fn is_success(&self) -> bool {
        matches!(
            self,
            SegmentOutcome::Staged { .. } | SegmentOutcome::Reused { .. }
        )
    }
}

/// Per-segment results of a fetch run, ordered by index
#[derive(Debug, Clone)]
pub struct FetchReport {
    /// One outcome per manifest segment
    pub outcomes: Vec<SegmentOutcome>,
}

impl FetchReport {
    /// Segments staged or reused
    pub fn completed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    /// Segments that exhausted their retry budget
    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, SegmentOutcome::Failed { .. }))
            .count()
    }

    /// Segments stopped by cancellation
    pub fn cancelled(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, SegmentOutcome::Cancelled { .. }))
            .count()
    }

    /// Whether every segment is staged
    pub fn is_complete(&self) -> bool {
        self.outcomes.iter().all(|o| o.is_success())
    }
}

/// Bounded-concurrency segment fetcher
#[derive(Debug, Clone)]
pub struct SegmentFetcher {
    transport: Transport,
    concurrency: usize,
    retry: RetryConfig,
}

impl SegmentFetcher {
    /// Create a fetcher; `concurrency` bounds parallel segment requests
    pub fn new(transport: Transport, concurrency: usize, retry: RetryConfig) -> Self {
        Self {
            transport,
            concurrency: concurrency.max(1),
            retry,
        }
    }

    /// Fetch every segment of a manifest into `staging_dir`.
    ///
    /// `on_progress` is called with `(completed, total)` each time a
    /// segment is staged or reused; the completed count only ever grows.
    pub async fn fetch_all<F>(
        &self,
        manifest: &StreamManifest,
        staging_dir: &Path,
        cancel: &CancellationToken,
        on_progress: F,
    ) -> Result<FetchReport>
    where
        F: Fn(u64, u64) + Send + Sync,
    {
        tokio::fs::create_dir_all(staging_dir).await?;

        let total = manifest.len() as u64;
        let completed = AtomicU64::new(0);

        let mut outcomes: Vec<SegmentOutcome> = stream::iter(manifest.segments.clone())
            .map(|segment| {
                let completed = &completed;
                let on_progress = &on_progress;
                async move {
                    let outcome = self.fetch_one(&segment, staging_dir, cancel).await;
                    if outcome.is_success() {
                        let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                        on_progress(done, total);
                    }
                    outcome
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        outcomes.sort_by_key(|o| match o {
            SegmentOutcome::Staged { index, .. }
            | SegmentOutcome::Reused { index, .. }
            | SegmentOutcome::Failed { index, .. }
            | SegmentOutcome::Cancelled { index } => *index,
        });

        let report = FetchReport { outcomes };
        tracing::info!(
            episode_id = %manifest.episode_id,
            completed = report.completed(),
            failed = report.failed(),
            cancelled = report.cancelled(),
            total = manifest.len(),
            "Segment fetch finished"
        );
        Ok(report)
    }

    async fn fetch_one(
        &self,
        segment: &SegmentDescriptor,
        staging_dir: &Path,
        cancel: &CancellationToken,
    ) -> SegmentOutcome {
        let path = staged_path(staging_dir, segment.index);

        match self.reusable_size(&path, segment.expected_size).await {
            Ok(Some(bytes)) => {
                tracing::debug!(index = segment.index, bytes, "Reusing staged segment");
                return SegmentOutcome::Reused {
                    index: segment.index,
                    bytes,
                };
            }
            Ok(None) => {}
            Err(e) => {
                return SegmentOutcome::Failed {
                    index: segment.index,
                    error: e.to_string(),
                };
            }
        }

        let result = request_with_retry(&self.retry, || async {
            self.download_segment(segment, &path, cancel).await
        })
        .await;

        match result {
            Ok(bytes) => SegmentOutcome::Staged {
                index: segment.index,
                bytes,
            },
            Err(Error::Cancelled) => SegmentOutcome::Cancelled {
                index: segment.index,
            },
            Err(e) => {
                tracing::warn!(index = segment.index, error = %e, "Segment failed for good");
                SegmentOutcome::Failed {
                    index: segment.index,
                    error: e.to_string(),
                }
            }
        }
    }

    /// One download attempt: fetch, verify size, write to a temp name,
    /// rename into place.
    async fn download_segment(
        &self,
        segment: &SegmentDescriptor,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            response = self.transport.get_ranged(&segment.url, segment.byte_range) => response?,
        };
        let response = response.error_for_status()?;

        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            body = response.bytes() => body?,
        };

        if let Some(expected) = segment.expected_size {
            if body.len() as u64 != expected {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "segment {} returned {} bytes, expected {expected}",
                        segment.index,
                        body.len()
                    ),
                )));
            }
        }

        let tmp = path.with_extension("seg.tmp");
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, path).await?;

        Ok(body.len() as u64)
    }

    /// Size of a valid staged file, or None when a fetch is needed.
    ///
    /// A staged file whose size contradicts the manifest is deleted and
    /// fetched again.
    async fn reusable_size(&self, path: &Path, expected_size: Option<u64>) -> Result<Option<u64>> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let on_disk = metadata.len();
        match expected_size {
            Some(expected) if on_disk != expected => {
                tracing::warn!(
                    path = %path.display(),
                    on_disk,
                    expected,
                    "Staged segment has wrong size, discarding it"
                );
                tokio::fs::remove_file(path).await?;
                Ok(None)
            }
            _ => Ok(Some(on_disk)),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenManager;
    use crate::config::{AuthConfig, TransportConfig};
    use crate::store::TokenStore;
    use crate::types::{ByteRange, Credentials, EpisodeId};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path as url_path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    async fn fetcher_for(servers: (&MockServer, &MockServer), concurrency: usize) -> SegmentFetcher {
        let (auth_server, api_server) = servers;
        Mock::given(method("POST"))
            .and(url_path("/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok",
                "refresh_token": "ref",
                "expires_in": 3600,
            })))
            .mount(auth_server)
            .await;

        let http = reqwest::Client::new();
        let auth = Arc::new(TokenManager::new(
            http.clone(),
            AuthConfig {
                auth_base_url: auth_server.uri(),
                token_cache_path: None,
                expiry_margin: Duration::from_secs(60),
                retry: fast_retry(),
            },
            TokenStore::new(
                Credentials {
                    username: "u@example.com".into(),
                    password: "pw".into(),
                },
                None,
            ),
            None,
        ));
        let transport = Transport::new(
            http,
            auth,
            TransportConfig {
                api_base_url: api_server.uri(),
                request_timeout: Duration::from_secs(5),
                rate_limit_max_retries: 1,
                rate_limit_default_backoff: Duration::from_millis(10),
                retry: fast_retry(),
            },
        );
        SegmentFetcher::new(transport, concurrency, fast_retry())
    }

    fn manifest(server: &MockServer, count: usize) -> StreamManifest {
        StreamManifest {
            episode_id: EpisodeId(1),
            segments: (0..count)
                .map(|index| SegmentDescriptor {
                    index,
                    url: format!("{}/seg/{index}", server.uri()),
                    byte_range: None,
                    expected_size: None,
                })
                .collect(),
        }
    }

    async fn mount_segment(server: &MockServer, index: usize, body: &str) {
        Mock::given(method("GET"))
            .and(url_path(format!("/seg/{index}")))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn all_segments_stage_and_progress_is_monotonic() {
        let auth_server = MockServer::start().await;
        let api_server = MockServer::start().await;
        for i in 0..3 {
            mount_segment(&api_server, i, &format!("segment-{i}-data")).await;
        }

        let fetcher = fetcher_for((&auth_server, &api_server), 2).await;
        let staging = TempDir::new().unwrap();
        let progress: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
        let progress_sink = progress.clone();

        let report = fetcher
            .fetch_all(
                &manifest(&api_server, 3),
                staging.path(),
                &CancellationToken::new(),
                move |done, total| progress_sink.lock().unwrap().push((done, total)),
            )
            .await
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(report.completed(), 3);
        for i in 0..3 {
            let content =
                std::fs::read_to_string(staged_path(staging.path(), i)).unwrap();
            assert_eq!(content, format!("segment-{i}-data"));
        }

        let calls = progress.lock().unwrap().clone();
        assert_eq!(calls.len(), 3);
        let counts: Vec<u64> = calls.iter().map(|(done, _)| *done).collect();
        let mut sorted = counts.clone();
        sorted.sort_unstable();
        assert_eq!(counts, sorted, "progress counts must never decrease");
        assert_eq!(calls.last().unwrap(), &(3, 3));
    }

    #[tokio::test]
    async fn transient_segment_failure_is_retried_within_budget() {
        let auth_server = MockServer::start().await;
        let api_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(url_path("/seg/0"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .expect(1)
            .mount(&api_server)
            .await;
        Mock::given(method("GET"))
            .and(url_path("/seg/0"))
            .respond_with(ResponseTemplate::new(200).set_body_string("recovered"))
            .expect(1)
            .mount(&api_server)
            .await;

        let fetcher = fetcher_for((&auth_server, &api_server), 1).await;
        let staging = TempDir::new().unwrap();
        let report = fetcher
            .fetch_all(
                &manifest(&api_server, 1),
                staging.path(),
                &CancellationToken::new(),
                |_, _| {},
            )
            .await
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(
            std::fs::read_to_string(staged_path(staging.path(), 0)).unwrap(),
            "recovered"
        );
    }

    #[tokio::test]
    async fn one_bad_segment_does_not_abort_the_others() {
        let auth_server = MockServer::start().await;
        let api_server = MockServer::start().await;

        mount_segment(&api_server, 0, "fine-0").await;
        Mock::given(method("GET"))
            .and(url_path("/seg/1"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&api_server)
            .await;
        mount_segment(&api_server, 2, "fine-2").await;

        let fetcher = fetcher_for((&auth_server, &api_server), 2).await;
        let staging = TempDir::new().unwrap();
        let report = fetcher
            .fetch_all(
                &manifest(&api_server, 3),
                staging.path(),
                &CancellationToken::new(),
                |_, _| {},
            )
            .await
            .unwrap();

        assert_eq!(report.completed(), 2);
        assert_eq!(report.failed(), 1);
        assert!(!report.is_complete());
        // the good segments stay staged for a later resume
        assert!(staged_path(staging.path(), 0).exists());
        assert!(staged_path(staging.path(), 2).exists());
        assert!(!staged_path(staging.path(), 1).exists());
    }

    #[tokio::test]
    async fn valid_staged_segment_is_reused_without_network() {
        let auth_server = MockServer::start().await;
        let api_server = MockServer::start().await;

        // segment 0 pre-staged with the exact expected size; any request
        // for it would violate the expect(0)
        Mock::given(method("GET"))
            .and(url_path("/seg/0"))
            .respond_with(ResponseTemplate::new(200).set_body_string("should not be hit"))
            .expect(0)
            .mount(&api_server)
            .await;
        mount_segment(&api_server, 1, "fresh").await;

        let staging = TempDir::new().unwrap();
        std::fs::write(staged_path(staging.path(), 0), "old-bytes").unwrap();

        let mut manifest = manifest(&api_server, 2);
        manifest.segments[0].expected_size = Some("old-bytes".len() as u64);

        let fetcher = fetcher_for((&auth_server, &api_server), 1).await;
        let report = fetcher
            .fetch_all(&manifest, staging.path(), &CancellationToken::new(), |_, _| {})
            .await
            .unwrap();

        assert!(report.is_complete());
        assert!(matches!(
            report.outcomes[0],
            SegmentOutcome::Reused { index: 0, .. }
        ));
        assert!(matches!(
            report.outcomes[1],
            SegmentOutcome::Staged { index: 1, .. }
        ));
    }

    #[tokio::test]
    async fn wrong_sized_staged_segment_is_refetched() {
        let auth_server = MockServer::start().await;
        let api_server = MockServer::start().await;
        mount_segment(&api_server, 0, "correct!").await;

        let staging = TempDir::new().unwrap();
        std::fs::write(staged_path(staging.path(), 0), "truncated").unwrap();

        let mut manifest = manifest(&api_server, 1);
        // expected size matches the fresh body, not the stale file
        manifest.segments[0].expected_size = Some("correct!".len() as u64);

        let fetcher = fetcher_for((&auth_server, &api_server), 1).await;
        let report = fetcher
            .fetch_all(&manifest, staging.path(), &CancellationToken::new(), |_, _| {})
            .await
            .unwrap();

        assert!(report.is_complete());
        assert!(matches!(
            report.outcomes[0],
            SegmentOutcome::Staged { index: 0, .. }
        ));
        assert_eq!(
            std::fs::read_to_string(staged_path(staging.path(), 0)).unwrap(),
            "correct!"
        );
    }

    #[tokio::test]
    async fn cancelled_token_stops_fetching() {
        let auth_server = MockServer::start().await;
        let api_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x"))
            .expect(0)
            .mount(&api_server)
            .await;

        let cancel = CancellationToken::new();
        cancel.cancel();

        let fetcher = fetcher_for((&auth_server, &api_server), 2).await;
        let staging = TempDir::new().unwrap();
        let report = fetcher
            .fetch_all(&manifest(&api_server, 3), staging.path(), &cancel, |_, _| {})
            .await
            .unwrap();

        assert_eq!(report.cancelled(), 3);
        assert_eq!(report.completed(), 0);
    }

    #[tokio::test]
    async fn ranged_segments_send_range_headers() {
        let auth_server = MockServer::start().await;
        let api_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(url_path("/media.mp4"))
            .and(header("range", "bytes=0-4"))
            .respond_with(ResponseTemplate::new(206).set_body_string("AAAAA"))
            .expect(1)
            .mount(&api_server)
            .await;
        Mock::given(method("GET"))
            .and(url_path("/media.mp4"))
            .and(header("range", "bytes=5-9"))
            .respond_with(ResponseTemplate::new(206).set_body_string("BBBBB"))
            .expect(1)
            .mount(&api_server)
            .await;

        let manifest = StreamManifest {
            episode_id: EpisodeId(2),
            segments: vec![
                SegmentDescriptor {
                    index: 0,
                    url: format!("{}/media.mp4", api_server.uri()),
                    byte_range: Some(ByteRange {
                        offset: 0,
                        length: 5,
                    }),
                    expected_size: Some(5),
                },
                SegmentDescriptor {
                    index: 1,
                    url: format!("{}/media.mp4", api_server.uri()),
                    byte_range: Some(ByteRange {
                        offset: 5,
                        length: 5,
                    }),
                    expected_size: Some(5),
                },
            ],
        };

        let fetcher = fetcher_for((&auth_server, &api_server), 2).await;
        let staging = TempDir::new().unwrap();
        let report = fetcher
            .fetch_all(&manifest, staging.path(), &CancellationToken::new(), |_, _| {})
            .await
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(
            std::fs::read_to_string(staged_path(staging.path(), 0)).unwrap(),
            "AAAAA"
        );
        assert_eq!(
            std::fs::read_to_string(staged_path(staging.path(), 1)).unwrap(),
            "BBBBB"
        );
    }
}
