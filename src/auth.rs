//! Session and token lifecycle
//!
//! [`TokenManager`] owns the account's token pair and keeps it usable:
//! callers ask for a valid access token and the manager transparently
//! refreshes or re-authenticates behind a single-flight gate. Concurrent
//! callers never trigger duplicate token requests; they all wait for the
//! one renewal in flight and share its outcome.
//!
//! Renewal prefers the cheap path (refresh token) and falls back to a full
//! password login only when the refresh token is explicitly rejected.
//! Network failures during renewal are retried with backoff and surface
//! as transport errors, never as a silent logout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::PoisonError;

use chrono::Utc;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::config::AuthConfig;
use crate::error::{Error, Result};
use crate::retry::request_with_retry;
use crate::store::TokenStore;
use crate::types::{Event, TokenPair};

/// Observable state of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No usable token and no renewal in progress
    Unauthenticated,
    /// Full password login in flight
    Authenticating,
    /// A fresh token pair is installed
    Authenticated,
    /// Token renewal via refresh token in flight
    Refreshing,
    /// Renewal failed; the next request will try again from scratch
    Failed,
}

/// Token service wire response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: u64,
}

/// Manages the account session and its token pair
pub struct TokenManager {
    http: reqwest::Client,
    config: AuthConfig,
    store: TokenStore,
    current: RwLock<Option<TokenPair>>,
    state: std::sync::RwLock<SessionState>,
    // serializes renewals; waiting on it is how callers join a renewal
    // already in flight
    renew_gate: Mutex<()>,
    // bumped on every install so a forced refresh can tell whether a
    // renewal happened while it waited on the gate
    generation: AtomicU64,
    events: Option<broadcast::Sender<Event>>,
}

impl TokenManager {
    /// Create a manager, seeding the session from the token cache if one
    /// is present and readable.
    pub fn new(
        http: reqwest::Client,
        config: AuthConfig,
        store: TokenStore,
        events: Option<broadcast::Sender<Event>>,
    ) -> Self {
        let cached = match store.load() {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "Token cache unavailable, starting unauthenticated");
                None
            }
        };
        let state = if cached.is_some() {
            SessionState::Authenticated
        } else {
            SessionState::Unauthenticated
        };

        Self {
            http,
            config,
            store,
            current: RwLock::new(cached),
            state: std::sync::RwLock::new(state),
            renew_gate: Mutex::new(()),
            generation: AtomicU64::new(0),
            events,
        }
    }

    /// Current session state
    pub fn session_state(&self) -> SessionState {
        *self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Return an access token guaranteed to outlive the expiry margin.
    ///
    /// The fast path is a shared read of the installed pair and never
    /// blocks other callers. Renewal, when needed, is single-flight.
    pub async fn get_valid_token(&self) -> Result<String> {
        {
            let current = self.current.read().await;
            if let Some(pair) = current.as_ref() {
                if pair.is_fresh(self.config.expiry_margin) {
                    return Ok(pair.access_token.clone());
                }
            }
        }
        self.renew(None).await
    }

    /// Discard trust in the installed token and renew.
    ///
    /// Used after the API rejects a request with 401 despite a locally
    /// fresh token. If another caller already renewed while this one
    /// waited, the renewed token is returned without a second request.
    pub async fn force_refresh(&self) -> Result<String> {
        let observed = self.generation.load(Ordering::Acquire);
        self.renew(Some(observed)).await
    }

    /// Perform a full password login regardless of cached state
    pub async fn authenticate(&self) -> Result<()> {
        let _gate = self.renew_gate.lock().await;
        let pair = self.login_flow().await?;
        self.install(pair).await?;
        Ok(())
    }

    /// Renew the token pair behind the single-flight gate.
    ///
    /// `stale_generation` is Some for forced refreshes: the renewal is
    /// skipped only if another caller installed a pair after the caller
    /// observed the stale one.
    async fn renew(&self, stale_generation: Option<u64>) -> Result<String> {
        let _gate = self.renew_gate.lock().await;

        // double-check after acquiring the gate: a renewal may have
        // finished while this caller waited
        let generation_now = self.generation.load(Ordering::Acquire);
        {
            let current = self.current.read().await;
            if let Some(pair) = current.as_ref() {
                let renewed_since = stale_generation.map_or(true, |g| generation_now > g);
                if renewed_since && pair.is_fresh(self.config.expiry_margin) {
                    return Ok(pair.access_token.clone());
                }
            }
        }

        let refresh_token = self
            .current
            .read()
            .await
            .as_ref()
            .and_then(|p| p.refresh_token.clone());

        let pair = match refresh_token {
            Some(token) => {
                self.set_state(SessionState::Refreshing);
                match self.refresh(&token).await {
                    Ok(pair) => pair,
                    Err(Error::AuthenticationFailed(reason)) => {
                        tracing::warn!(
                            %reason,
                            "Refresh token rejected, falling back to full login"
                        );
                        self.login_flow().await?
                    }
                    Err(e) => {
                        self.set_state(SessionState::Failed);
                        return Err(e);
                    }
                }
            }
            None => self.login_flow().await?,
        };

        self.install(pair).await
    }

    async fn login_flow(&self) -> Result<TokenPair> {
        self.set_state(SessionState::Authenticating);
        match self.login().await {
            Ok(pair) => Ok(pair),
            Err(e) => {
                self.set_state(SessionState::Failed);
                Err(e)
            }
        }
    }

    /// Exchange the refresh token for a new pair
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let url = self.token_url();
        request_with_retry(&self.config.retry, || async {
            let response = self
                .http
                .post(&url)
                .form(&[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token),
                ])
                .send()
                .await?;
            Self::token_from_response(response, "token refresh").await
        })
        .await
    }

    /// Full password login
    async fn login(&self) -> Result<TokenPair> {
        let credentials = self.store.credentials().clone();
        tracing::info!(username = %credentials.username, "Performing full password login");

        let url = self.token_url();
        request_with_retry(&self.config.retry, || async {
            let response = self
                .http
                .post(&url)
                .form(&[
                    ("grant_type", "password"),
                    ("username", credentials.username.as_str()),
                    ("password", credentials.password.as_str()),
                ])
                .send()
                .await?;
            Self::token_from_response(response, "login").await
        })
        .await
    }

    /// Map a token service response to a pair or a session error.
    ///
    /// 4xx rejections are authentication failures and never retried; 5xx
    /// surfaces as a transport error, which the retry wrapper classifies
    /// as transient.
    async fn token_from_response(
        response: reqwest::Response,
        operation: &str,
    ) -> Result<TokenPair> {
        let status = response.status();
        if matches!(
            status,
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            let body = response.text().await.unwrap_or_default();
            let detail = body.chars().take(200).collect::<String>();
            return Err(Error::AuthenticationFailed(format!(
                "{operation} rejected ({status}): {detail}"
            )));
        }

        let wire: TokenResponse = response.error_for_status()?.json().await?;
        Ok(TokenPair {
            access_token: wire.access_token,
            refresh_token: wire.refresh_token,
            expires_at: Utc::now() + chrono::Duration::seconds(wire.expires_in as i64),
        })
    }

    /// Install a new pair: persist, publish, announce
    async fn install(&self, pair: TokenPair) -> Result<String> {
        if let Err(e) = self.store.save(&pair) {
            tracing::warn!(error = %e, "Failed to persist token pair, session continues in memory");
        }

        let access_token = pair.access_token.clone();
        let expires_at = pair.expires_at;
        *self.current.write().await = Some(pair);
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.set_state(SessionState::Authenticated);

        if let Some(tx) = &self.events {
            let _ = tx.send(Event::TokenRefreshed { expires_at });
        }
        tracing::info!(%expires_at, "Session token renewed");

        Ok(access_token)
    }

    fn set_state(&self, state: SessionState) {
        *self
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn token_url(&self) -> String {
        format!(
            "{}/oauth/token",
            self.config.auth_base_url.trim_end_matches('/')
        )
    }
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("state", &self.session_state())
            .finish_non_exhaustive()
    }
}
