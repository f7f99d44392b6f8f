//! Final assembly and publication
//!
//! Merges staged segments into the final episode file. The merge writes
//! to a temp path inside the cache directory and the result is published
//! with a single atomic rename, so readers of the cache directory never
//! observe a half-written episode. Re-running assembly for the same
//! episode is idempotent: the rename simply replaces the previous file.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::merge::MediaMerger;
use crate::types::{CacheEntry, EpisodeId};

/// Published file name for an episode
pub fn episode_file_name(episode_id: EpisodeId) -> String {
    format!("episode_{episode_id}.mp3")
}

/// Merges staged segments and publishes the result
pub struct Assembler {
    merger: Arc<dyn MediaMerger>,
    cache_dir: PathBuf,
}

impl Assembler {
    /// Create an assembler publishing into `cache_dir`
    pub fn new(merger: Arc<dyn MediaMerger>, cache_dir: PathBuf) -> Self {
        Self { merger, cache_dir }
    }

    /// Name of the merge tool in use
    pub fn merger_name(&self) -> &str {
        self.merger.name()
    }

    /// Merge `inputs` in order and publish the episode file.
    ///
    /// Inputs are verified to exist before the tool runs so a missing
    /// staged segment fails with a precise message instead of a tool
    /// error. On failure nothing is published and staged inputs are left
    /// untouched.
    pub async fn assemble(&self, episode_id: EpisodeId, inputs: &[PathBuf]) -> Result<CacheEntry> {
        if inputs.is_empty() {
            return Err(Error::AssemblyFailed(format!(
                "episode {episode_id} has no staged segments to assemble"
            )));
        }
        for input in inputs {
            if !tokio::fs::try_exists(input).await? {
                return Err(Error::AssemblyFailed(format!(
                    "staged segment {} is missing",
                    input.display()
                )));
            }
        }

        let scratch_dir = self.cache_dir.join(".tmp");
        tokio::fs::create_dir_all(&scratch_dir).await?;

        let file_name = episode_file_name(episode_id);
        let scratch_path = scratch_dir.join(format!("{file_name}.tmp"));
        let final_path = self.cache_dir.join(&file_name);

        // stale scratch from an interrupted earlier run
        if tokio::fs::try_exists(&scratch_path).await? {
            tokio::fs::remove_file(&scratch_path).await?;
        }

        tracing::info!(
            %episode_id,
            segments = inputs.len(),
            tool = self.merger.name(),
            "Assembling episode"
        );
        self.merger.merge(inputs, &scratch_path).await?;

        let body = tokio::fs::read(&scratch_path).await?;
        let size_bytes = body.len() as u64;
        let sha256 = format!("{:x}", Sha256::digest(&body));

        // flush before publishing so the rename lands on durable bytes
        let file = tokio::fs::File::open(&scratch_path).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&scratch_path, &final_path).await?;

        tracing::info!(
            %episode_id,
            path = %final_path.display(),
            size_bytes,
            "Published episode file"
        );

        Ok(CacheEntry {
            episode_id,
            path: final_path,
            size_bytes,
            sha256,
            created_at: Utc::now(),
        })
    }
}

impl std::fmt::Debug for Assembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assembler")
            .field("cache_dir", &self.cache_dir)
            .field("merger", &self.merger.name())
            .finish()
    }
}
