//! Episode cache index
//!
//! A JSON index next to the published files records what has been
//! downloaded. Hits are verified against the filesystem: an entry whose
//! file was deleted or truncated behind our back is dropped rather than
//! served, so the index can always be trusted even if the directory was
//! pruned by hand.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::types::{CacheEntry, EpisodeId};

const INDEX_FILE: &str = "index.json";

/// Index over published episode files
pub struct CacheIndex {
    index_path: PathBuf,
    entries: RwLock<HashMap<EpisodeId, CacheEntry>>,
}

impl CacheIndex {
    /// Open the index inside `cache_dir`, creating the directory if needed.
    ///
    /// An unreadable index starts empty; published files are then simply
    /// re-downloaded on demand.
    pub async fn open(cache_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(cache_dir).await?;
        let index_path = cache_dir.join(INDEX_FILE);

        let entries = match tokio::fs::read_to_string(&index_path).await {
            Ok(raw) => match serde_json::from_str::<Vec<CacheEntry>>(&raw) {
                Ok(list) => list.into_iter().map(|e| (e.episode_id, e)).collect(),
                Err(e) => {
                    tracing::warn!(
                        path = %index_path.display(),
                        error = %e,
                        "Cache index is unreadable, starting empty"
                    );
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::debug!(entries = entries.len(), "Opened cache index");
        Ok(Self {
            index_path,
            entries: RwLock::new(entries),
        })
    }

    /// Look up an episode, verifying the file still backs the entry.
    ///
    /// A missing or wrong-sized file invalidates the entry.
    pub async fn lookup(&self, episode_id: EpisodeId) -> Option<CacheEntry> {
        let entry = self.entries.read().await.get(&episode_id).cloned()?;

        match tokio::fs::metadata(&entry.path).await {
            Ok(metadata) if metadata.len() == entry.size_bytes => Some(entry),
            Ok(metadata) => {
                tracing::warn!(
                    %episode_id,
                    on_disk = metadata.len(),
                    recorded = entry.size_bytes,
                    "Cached file has wrong size, dropping the entry"
                );
                self.invalidate(episode_id).await;
                None
            }
            Err(_) => {
                tracing::warn!(
                    %episode_id,
                    path = %entry.path.display(),
                    "Cached file is gone, dropping the entry"
                );
                self.invalidate(episode_id).await;
                None
            }
        }
    }

    /// Record a freshly published episode
    pub async fn insert(&self, entry: CacheEntry) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(entry.episode_id, entry);
        self.persist(&entries).await
    }

    /// Drop an episode from the index, returning its previous entry.
    ///
    /// Used for forced re-downloads; the file itself is left for the new
    /// publication to replace.
    pub async fn remove(&self, episode_id: EpisodeId) -> Result<Option<CacheEntry>> {
        let mut entries = self.entries.write().await;
        let removed = entries.remove(&episode_id);
        if removed.is_some() {
            self.persist(&entries).await?;
        }
        Ok(removed)
    }

    /// Number of indexed episodes
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the index is empty
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    async fn invalidate(&self, episode_id: EpisodeId) {
        let mut entries = self.entries.write().await;
        if entries.remove(&episode_id).is_some() {
            if let Err(e) = self.persist(&entries).await {
                tracing::warn!(error = %e, "Failed to persist cache index after invalidation");
            }
        }
    }

    /// Write the index through a temp file and rename
    async fn persist(&self, entries: &HashMap<EpisodeId, CacheEntry>) -> Result<()> {
        let mut list: Vec<&CacheEntry> = entries.values().collect();
        list.sort_by_key(|e| e.episode_id);

        let body = serde_json::to_vec_pretty(&list)?;
        let tmp_path = self.index_path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, body).await.map_err(|e| {
            Error::StoreUnavailable(format!(
                "failed to write {}: {e}",
                self.index_path.display()
            ))
        })?;
        tokio::fs::rename(&tmp_path, &self.index_path)
            .await
            .map_err(|e| {
                Error::StoreUnavailable(format!(
                    "failed to publish {}: {e}",
                    self.index_path.display()
                ))
            })?;
        Ok(())
    }
}

impl std::fmt::Debug for CacheIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheIndex")
            .field("index_path", &self.index_path)
            .finish_non_exhaustive()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn entry_for(dir: &Path, episode_id: u64, body: &str) -> CacheEntry {
        let path = dir.join(format!("episode_{episode_id}.mp3"));
        std::fs::write(&path, body).unwrap();
        CacheEntry {
            episode_id: EpisodeId(episode_id),
            path,
            size_bytes: body.len() as u64,
            sha256: "abc123".into(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_then_lookup_returns_the_entry() {
        let dir = TempDir::new().unwrap();
        let index = CacheIndex::open(dir.path()).await.unwrap();
        index.insert(entry_for(dir.path(), 1, "audio")).await.unwrap();

        let hit = index.lookup(EpisodeId(1)).await.expect("entry should be present");
        assert_eq!(hit.size_bytes, 5);
        assert_eq!(index.len().await, 1);
    }

    #[tokio::test]
    async fn lookup_of_unknown_episode_is_none() {
        let dir = TempDir::new().unwrap();
        let index = CacheIndex::open(dir.path()).await.unwrap();
        assert!(index.lookup(EpisodeId(404)).await.is_none());
    }

    #[tokio::test]
    async fn deleted_file_invalidates_the_entry() {
        let dir = TempDir::new().unwrap();
        let index = CacheIndex::open(dir.path()).await.unwrap();
        let entry = entry_for(dir.path(), 1, "audio");
        let path = entry.path.clone();
        index.insert(entry).await.unwrap();

        std::fs::remove_file(&path).unwrap();

        assert!(index.lookup(EpisodeId(1)).await.is_none());
        assert!(
            index.is_empty().await,
            "invalidated entry should leave the index"
        );
    }

    #[tokio::test]
    async fn truncated_file_invalidates_the_entry() {
        let dir = TempDir::new().unwrap();
        let index = CacheIndex::open(dir.path()).await.unwrap();
        let entry = entry_for(dir.path(), 1, "full audio body");
        let path = entry.path.clone();
        index.insert(entry).await.unwrap();

        std::fs::write(&path, "cut").unwrap();

        assert!(
            index.lookup(EpisodeId(1)).await.is_none(),
            "size mismatch should not be served as a hit"
        );
    }

    #[tokio::test]
    async fn index_survives_a_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let index = CacheIndex::open(dir.path()).await.unwrap();
            index.insert(entry_for(dir.path(), 1, "one")).await.unwrap();
            index.insert(entry_for(dir.path(), 2, "two!")).await.unwrap();
        }

        let reopened = CacheIndex::open(dir.path()).await.unwrap();
        assert_eq!(reopened.len().await, 2);
        assert!(reopened.lookup(EpisodeId(2)).await.is_some());
    }

    #[tokio::test]
    async fn corrupt_index_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(INDEX_FILE), "definitely { not json").unwrap();

        let index = CacheIndex::open(dir.path()).await.unwrap();
        assert!(index.is_empty().await);
    }

    #[tokio::test]
    async fn remove_returns_the_dropped_entry() {
        let dir = TempDir::new().unwrap();
        let index = CacheIndex::open(dir.path()).await.unwrap();
        index.insert(entry_for(dir.path(), 1, "audio")).await.unwrap();

        let removed = index.remove(EpisodeId(1)).await.unwrap();
        assert!(removed.is_some());
        assert!(index.lookup(EpisodeId(1)).await.is_none());

        let removed_again = index.remove(EpisodeId(1)).await.unwrap();
        assert!(removed_again.is_none());
    }
}
