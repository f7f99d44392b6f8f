//! Persistent token storage
//!
//! Holds the account credentials and optionally persists the token pair
//! between runs so a restart does not cost a fresh login. Writes go through
//! a temp file and rename so a crash never leaves a truncated cache behind.

use std::fs;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::types::{Credentials, TokenPair};

/// Credential source and token cache
#[derive(Debug, Clone)]
pub struct TokenStore {
    credentials: Credentials,
    cache_path: Option<PathBuf>,
}

impl TokenStore {
    /// Create a store with an optional on-disk token cache
    pub fn new(credentials: Credentials, cache_path: Option<PathBuf>) -> Self {
        Self {
            credentials,
            cache_path,
        }
    }

    /// Account credentials for full logins
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Load the cached token pair, if any.
    ///
    /// A missing file is not an error. A file that cannot be parsed is
    /// treated as absent so the session falls back to a fresh login.
    pub fn load(&self) -> Result<Option<TokenPair>> {
        let Some(path) = &self.cache_path else {
            return Ok(None);
        };

        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::StoreUnavailable(format!(
                    "failed to read {}: {e}",
                    path.display()
                )));
            }
        };

        match serde_json::from_str::<TokenPair>(&raw) {
            Ok(pair) => Ok(Some(pair)),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Token cache is unreadable, ignoring it"
                );
                Ok(None)
            }
        }
    }

    /// Persist a token pair.
    ///
    /// No-op when caching is disabled. Failures are reported but callers
    /// treat them as non-fatal: the in-memory session keeps working.
    pub fn save(&self, pair: &TokenPair) -> Result<()> {
        let Some(path) = &self.cache_path else {
            return Ok(());
        };

        let write = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let tmp_path = path.with_extension("json.tmp");
            let body = serde_json::to_vec_pretty(pair).map_err(std::io::Error::other)?;
            fs::write(&tmp_path, body)?;
            fs::rename(&tmp_path, path)?;
            Ok(())
        };

        write().map_err(|e| {
            Error::StoreUnavailable(format!("failed to write {}: {e}", path.display()))
        })?;

        tracing::debug!(path = %path.display(), "Persisted token pair");
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn credentials() -> Credentials {
        Credentials {
            username: "user@example.com".into(),
            password: "secret".into(),
        }
    }

    fn token_pair() -> TokenPair {
        TokenPair {
            access_token: "access-123".into(),
            refresh_token: Some("refresh-456".into()),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tokens.json");
        let store = TokenStore::new(credentials(), Some(path));

        store.save(&token_pair()).unwrap();
        let loaded = store.load().unwrap().expect("token pair should be present");

        assert_eq!(loaded.access_token, "access-123");
        assert_eq!(loaded.refresh_token.as_deref(), Some("refresh-456"));
    }

    #[test]
    fn missing_cache_file_loads_as_none() {
        let dir = TempDir::new().unwrap();
        let store = TokenStore::new(credentials(), Some(dir.path().join("absent.json")));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn disabled_cache_loads_as_none_and_save_is_noop() {
        let store = TokenStore::new(credentials(), None);
        assert!(store.load().unwrap().is_none());
        store.save(&token_pair()).unwrap();
    }

    #[test]
    fn corrupt_cache_file_is_treated_as_absent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tokens.json");
        std::fs::write(&path, "{ not json at all").unwrap();

        let store = TokenStore::new(credentials(), Some(path));
        assert!(
            store.load().unwrap().is_none(),
            "unparseable cache should fall back to a fresh login, not error"
        );
    }

    #[test]
    fn save_creates_missing_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("deeper").join("tokens.json");
        let store = TokenStore::new(credentials(), Some(path.clone()));

        store.save(&token_pair()).unwrap();
        assert!(path.exists(), "token cache should exist after save");
    }

    #[test]
    fn save_leaves_no_temp_file_behind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tokens.json");
        let store = TokenStore::new(credentials(), Some(path));

        store.save(&token_pair()).unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|name| name.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");
    }
}
