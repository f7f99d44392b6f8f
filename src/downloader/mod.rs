//! Episode download orchestration
//!
//! [`PodcastDownloader`] is the crate's entry point: it wires the session,
//! transport, catalog and pipeline together and runs download jobs as
//! spawned tasks. At most one job per episode is active at a time; a
//! request for an episode already in flight returns the existing handle
//! instead of starting duplicate work.

mod job;

pub use job::{JobHandle, JobResult};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};

use crate::assembler::Assembler;
use crate::auth::{SessionState, TokenManager};
use crate::cache::CacheIndex;
use crate::catalog::Catalog;
use crate::config::{Config, ToolsConfig};
use crate::error::Result;
use crate::fetcher::SegmentFetcher;
use crate::manifest::ManifestResolver;
use crate::merge::{FfmpegMerger, MediaMerger, UnavailableMerger};
use crate::store::TokenStore;
use crate::transport::Transport;
use crate::types::{Credentials, DownloadOptions, Event, EpisodeId};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// What `download_episode` decided to do
#[derive(Debug)]
pub enum DownloadOutcome {
    /// A valid cached file already exists; no job was started
    Cached(PathBuf),
    /// A new job was started
    Started(JobHandle),
    /// A job for this episode was already running; this is its handle
    AlreadyRunning(JobHandle),
}

struct Inner {
    config: Config,
    events: broadcast::Sender<Event>,
    auth: Arc<TokenManager>,
    catalog: Catalog,
    resolver: ManifestResolver,
    fetcher: SegmentFetcher,
    assembler: Assembler,
    cache: CacheIndex,
    active_jobs: Mutex<HashMap<EpisodeId, JobHandle>>,
}

/// Podcast episode downloader
///
/// Cheap to clone; clones share the session, cache and active job set.
#[derive(Clone)]
pub struct PodcastDownloader {
    inner: Arc<Inner>,
}

impl PodcastDownloader {
    /// Create a downloader, selecting the merge tool from configuration
    pub async fn new(config: Config, credentials: Credentials) -> Result<Self> {
        let merger = select_merger(&config.tools);
        Self::with_merger(config, credentials, merger).await
    }

    /// Create a downloader with an explicit merge tool implementation
    pub async fn with_merger(
        config: Config,
        credentials: Credentials,
        merger: Arc<dyn MediaMerger>,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&config.download.cache_dir).await?;
        tokio::fs::create_dir_all(&config.download.staging_dir).await?;

        let http = reqwest::Client::builder()
            .timeout(config.transport.request_timeout)
            .build()?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let store = TokenStore::new(credentials, config.auth.token_cache_path.clone());
        let auth = Arc::new(TokenManager::new(
            http.clone(),
            config.auth.clone(),
            store,
            Some(events.clone()),
        ));

        let transport = Transport::new(http, auth.clone(), config.transport.clone());
        let catalog = Catalog::new(transport.clone(), config.download.page_size);
        let resolver = ManifestResolver::new(transport.clone());
        let fetcher = SegmentFetcher::new(
            transport,
            config.download.max_concurrent_segments,
            config.download.segment_retry.clone(),
        );
        let assembler = Assembler::new(merger, config.download.cache_dir.clone());
        let cache = CacheIndex::open(&config.download.cache_dir).await?;

        tracing::info!(
            cache_dir = %config.download.cache_dir.display(),
            merger = assembler.merger_name(),
            "Downloader ready"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                events,
                auth,
                catalog,
                resolver,
                fetcher,
                assembler,
                cache,
                active_jobs: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Subscribe to download and session events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// Perform a full login now instead of waiting for the first request
    pub async fn authenticate(&self) -> Result<()> {
        self.inner.auth.authenticate().await
    }

    /// Current session state
    pub fn session_state(&self) -> SessionState {
        self.inner.auth.session_state()
    }

    /// Catalog browsing API
    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    /// Download an episode, or return what already exists.
    ///
    /// With `force` set, a valid cache entry is dropped and the episode is
    /// downloaded again; a job already in flight is returned as-is either
    /// way.
    pub async fn download_episode(
        &self,
        episode_id: EpisodeId,
        options: DownloadOptions,
    ) -> Result<DownloadOutcome> {
        let mut jobs = self.inner.active_jobs.lock().await;

        if let Some(handle) = jobs.get(&episode_id) {
            if !handle.is_finished() {
                tracing::debug!(%episode_id, "Episode already downloading, returning existing job");
                return Ok(DownloadOutcome::AlreadyRunning(handle.clone()));
            }
        }

        if options.force {
            self.inner.cache.remove(episode_id).await?;
        } else if let Some(entry) = self.inner.cache.lookup(episode_id).await {
            tracing::debug!(%episode_id, path = %entry.path.display(), "Serving episode from cache");
            return Ok(DownloadOutcome::Cached(entry.path));
        }

        let shared = job::JobShared::new();
        let handle = JobHandle::new(episode_id, shared.clone());
        jobs.insert(episode_id, handle.clone());
        drop(jobs);

        self.emit(Event::JobQueued { episode_id });
        tracing::info!(%episode_id, force = options.force, "Starting download job");

        tokio::spawn(job::run_job(self.clone(), episode_id, shared));

        Ok(DownloadOutcome::Started(handle))
    }

    /// Cancel the active job for an episode, if any.
    ///
    /// Returns whether a running job was told to stop.
    pub async fn cancel_download(&self, episode_id: EpisodeId) -> bool {
        let jobs = self.inner.active_jobs.lock().await;
        match jobs.get(&episode_id) {
            Some(handle) if !handle.is_finished() => {
                handle.cancel();
                true
            }
            _ => false,
        }
    }

    /// Handles of all jobs currently in flight
    pub async fn active_downloads(&self) -> Vec<JobHandle> {
        self.inner.active_jobs.lock().await.values().cloned().collect()
    }

    /// Handle of the active job for an episode, if any
    pub async fn job_for(&self, episode_id: EpisodeId) -> Option<JobHandle> {
        self.inner.active_jobs.lock().await.get(&episode_id).cloned()
    }

    pub(crate) fn emit(&self, event: Event) {
        // nobody listening is fine
        let _ = self.inner.events.send(event);
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<Event> {
        self.inner.events.clone()
    }

    pub(crate) async fn forget_job(&self, episode_id: EpisodeId) {
        self.inner.active_jobs.lock().await.remove(&episode_id);
    }

    pub(crate) fn resolver(&self) -> &ManifestResolver {
        &self.inner.resolver
    }

    pub(crate) fn fetcher(&self) -> &SegmentFetcher {
        &self.inner.fetcher
    }

    pub(crate) fn assembler(&self) -> &Assembler {
        &self.inner.assembler
    }

    pub(crate) fn cache(&self) -> &CacheIndex {
        &self.inner.cache
    }

    pub(crate) fn staging_dir_for(&self, episode_id: EpisodeId) -> PathBuf {
        self.inner
            .config
            .download
            .staging_dir
            .join(format!("episode_{episode_id}"))
    }
}

impl std::fmt::Debug for PodcastDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PodcastDownloader")
            .field("cache_dir", &self.inner.config.download.cache_dir)
            .field("session", &self.inner.auth.session_state())
            .finish_non_exhaustive()
    }
}

/// Pick the merge tool: explicit path wins, then PATH discovery, then a
/// stand-in that fails assembly with a clear message
fn select_merger(tools: &ToolsConfig) -> Arc<dyn MediaMerger> {
    if let Some(path) = &tools.ffmpeg_path {
        return Arc::new(FfmpegMerger::new(path.clone(), tools.merge_timeout));
    }
    if tools.search_path {
        if let Some(merger) = FfmpegMerger::discover(tools.merge_timeout) {
            return Arc::new(merger);
        }
    }
    tracing::warn!("No merge tool found; downloads will fail at assembly until ffmpeg is installed");
    Arc::new(UnavailableMerger)
}
