//! Download jobs and their handles
//!
//! A job owns its episode's walk through the pipeline: resolve, fetch,
//! assemble, publish. The job task is the only writer of its status;
//! callers observe through the [`JobHandle`], which also carries the
//! cancellation token and a watch channel resolving when the job ends.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::fetcher::staged_path;
use crate::types::{Event, EpisodeId, JobFailure, JobStatus};

use super::PodcastDownloader;

/// How a finished job ended
pub type JobResult = std::result::Result<PathBuf, JobFailure>;

pub(crate) struct JobShared {
    status: Mutex<JobStatus>,
    completed: AtomicU64,
    total: AtomicU64,
    cancel: CancellationToken,
    done_tx: watch::Sender<Option<JobResult>>,
    done_rx: watch::Receiver<Option<JobResult>>,
}

impl JobShared {
    pub(crate) fn new() -> Arc<Self> {
        let (done_tx, done_rx) = watch::channel(None);
        Arc::new(Self {
            status: Mutex::new(JobStatus::Queued),
            completed: AtomicU64::new(0),
            total: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            done_tx,
            done_rx,
        })
    }

    fn set_status(&self, status: JobStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    fn status(&self) -> JobStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Caller-facing handle to a running (or finished) download job
#[derive(Clone)]
pub struct JobHandle {
    episode_id: EpisodeId,
    shared: Arc<JobShared>,
}

impl JobHandle {
    pub(crate) fn new(episode_id: EpisodeId, shared: Arc<JobShared>) -> Self {
        Self { episode_id, shared }
    }

    /// Episode this job downloads
    pub fn episode_id(&self) -> EpisodeId {
        self.episode_id
    }

    /// Current lifecycle status
    pub fn status(&self) -> JobStatus {
        self.shared.status()
    }

    /// Segments staged and total segments; total is 0 until the manifest
    /// is resolved
    pub fn progress(&self) -> (u64, u64) {
        (
            self.shared.completed.load(Ordering::SeqCst),
            self.shared.total.load(Ordering::SeqCst),
        )
    }

    /// Whether the job reached a terminal status
    pub fn is_finished(&self) -> bool {
        self.status().is_terminal()
    }

    /// Ask the job to stop. Staged segments are kept for a later resume.
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
    }

    /// Wait for the job to end and return its result
    pub async fn await_finished(&self) -> JobResult {
        let mut rx = self.shared.done_rx.clone();
        loop {
            if let Some(result) = rx.borrow().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                // sender gone without a result; treat as a failed job
                return Err(JobFailure {
                    kind: "cancelled".to_string(),
                    message: "job task ended without reporting a result".to_string(),
                    segments_completed: self.shared.completed.load(Ordering::SeqCst),
                    segments_total: self.shared.total.load(Ordering::SeqCst),
                });
            }
        }
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (completed, total) = self.progress();
        f.debug_struct("JobHandle")
            .field("episode_id", &self.episode_id)
            .field("status", &self.status())
            .field("progress", &format_args!("{completed}/{total}"))
            .finish()
    }
}

/// Drive one job to a terminal state and publish the result
pub(crate) async fn run_job(
    downloader: PodcastDownloader,
    episode_id: EpisodeId,
    shared: Arc<JobShared>,
) {
    let result = execute(&downloader, episode_id, &shared).await;

    match result {
        Ok(path) => {
            shared.set_status(JobStatus::Complete);
            downloader.emit(Event::Complete {
                episode_id,
                path: path.clone(),
            });
            let _ = shared.done_tx.send(Some(Ok(path)));
        }
        Err(error) => {
            let failure = JobFailure {
                kind: error.kind().to_string(),
                message: error.to_string(),
                segments_completed: shared.completed.load(Ordering::SeqCst),
                segments_total: shared.total.load(Ordering::SeqCst),
            };
            shared.set_status(JobStatus::Failed);
            if matches!(error, Error::Cancelled) {
                tracing::info!(%episode_id, "Download cancelled");
                downloader.emit(Event::JobCancelled { episode_id });
            } else {
                tracing::error!(%episode_id, error = %error, "Download failed");
                downloader.emit(Event::JobFailed {
                    episode_id,
                    failure: failure.clone(),
                });
            }
            let _ = shared.done_tx.send(Some(Err(failure)));
        }
    }

    downloader.forget_job(episode_id).await;
}

async fn execute(
    downloader: &PodcastDownloader,
    episode_id: EpisodeId,
    shared: &Arc<JobShared>,
) -> Result<PathBuf> {
    shared.set_status(JobStatus::ResolvingManifest);
    let manifest = tokio::select! {
        _ = shared.cancel.cancelled() => return Err(Error::Cancelled),
        manifest = downloader.resolver().resolve(episode_id) => manifest?,
    };

    let total = manifest.len() as u64;
    shared.total.store(total, Ordering::SeqCst);
    downloader.emit(Event::ManifestResolved {
        episode_id,
        segments: manifest.len(),
    });

    shared.set_status(JobStatus::FetchingSegments);
    let staging_dir = downloader.staging_dir_for(episode_id);
    let report = {
        let events = downloader.event_sender();
        let cancel = shared.cancel.clone();
        let shared = shared.clone();
        downloader
            .fetcher()
            .fetch_all(&manifest, &staging_dir, &cancel, move |done, total| {
                shared.completed.store(done, Ordering::SeqCst);
                let _ = events.send(Event::SegmentFinished {
                    episode_id,
                    completed: done,
                    total,
                });
            })
            .await?
    };

    if shared.cancel.is_cancelled() || report.cancelled() > 0 {
        return Err(Error::Cancelled);
    }
    if report.failed() > 0 {
        // staged segments stay on disk; a retry resumes instead of
        // starting over
        return Err(Error::SegmentsFailed {
            completed: report.completed(),
            failed: report.failed(),
            total: manifest.len(),
        });
    }

    shared.set_status(JobStatus::Assembling);
    downloader.emit(Event::Assembling { episode_id });

    let inputs: Vec<PathBuf> = (0..manifest.len())
        .map(|index| staged_path(&staging_dir, index))
        .collect();
    let entry = downloader.assembler().assemble(episode_id, &inputs).await?;
    let path = entry.path.clone();

    if let Err(e) = downloader.cache().insert(entry).await {
        tracing::warn!(%episode_id, error = %e, "Episode published but cache index update failed");
    }

    // staging is only needed again if something above fails
    if let Err(e) = tokio::fs::remove_dir_all(&staging_dir).await {
        tracing::debug!(%episode_id, error = %e, "Could not clean staging directory");
    }

    Ok(path)
}
