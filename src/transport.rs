//! Authenticated HTTP transport
//!
//! Every API request flows through [`Transport`]: it obtains a valid
//! access token, attaches the bearer header, and owns the cross-cutting
//! retry concerns so callers never see a 401, a 429 or a transient
//! network blip unless recovery is exhausted.
//!
//! A 401 despite a locally fresh token means the token died server-side;
//! the transport forces one renewal and resends the request exactly once.
//! A second 401 surfaces as an authentication failure rather than looping.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::auth::TokenManager;
use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::retry::{add_jitter, IsRetryable};
use crate::types::ByteRange;

// rate-limit waits longer than this surface as an error instead of sleeping
const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

/// HTTP transport with token handling, rate-limit waits and transient retries
#[derive(Clone)]
pub struct Transport {
    http: reqwest::Client,
    auth: Arc<TokenManager>,
    config: TransportConfig,
}

impl Transport {
    /// Create a transport over an existing client and session
    pub fn new(http: reqwest::Client, auth: Arc<TokenManager>, config: TransportConfig) -> Self {
        Self { http, auth, config }
    }

    /// Base URL of the podcast API, without a trailing slash
    pub fn api_base_url(&self) -> &str {
        self.config.api_base_url.trim_end_matches('/')
    }

    /// GET a URL, returning the raw response.
    ///
    /// The response may still carry a non-success status other than the
    /// ones the transport absorbs (401, 429); callers that care map those
    /// themselves, everyone else goes through [`Transport::get_json`].
    pub async fn get(&self, url: &str) -> Result<Response> {
        self.request(Method::GET, url, None).await
    }

    /// HEAD a URL
    pub async fn head(&self, url: &str) -> Result<Response> {
        self.request(Method::HEAD, url, None).await
    }

    /// GET a byte range of a URL
    pub async fn get_ranged(&self, url: &str, range: Option<ByteRange>) -> Result<Response> {
        self.request(Method::GET, url, range).await
    }

    /// GET a URL and decode its JSON body.
    ///
    /// 404 maps to [`Error::NotFound`]; other non-success statuses map to
    /// transport errors.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self.get(url).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(url.to_string()));
        }
        let value = response.error_for_status()?.json().await?;
        Ok(value)
    }

    /// Send a request with bearer auth and all recovery loops applied
    async fn request(
        &self,
        method: Method,
        url: &str,
        range: Option<ByteRange>,
    ) -> Result<Response> {
        let mut auth_retried = false;
        let mut rate_limit_attempts = 0u32;
        let mut transient_attempts = 0u32;
        let mut transient_delay = self.config.retry.initial_delay;

        loop {
            let token = self.auth.get_valid_token().await?;

            let mut builder = self
                .http
                .request(method.clone(), url)
                .bearer_auth(&token);
            if let Some(range) = range {
                builder = builder.header(reqwest::header::RANGE, range.to_header_value());
            }

            match builder.send().await {
                Ok(response) if response.status() == StatusCode::UNAUTHORIZED => {
                    if auth_retried {
                        return Err(Error::AuthenticationFailed(
                            "request rejected again after forced token renewal".to_string(),
                        ));
                    }
                    auth_retried = true;
                    tracing::debug!(%url, "Request rejected with 401, forcing token renewal");
                    self.auth.force_refresh().await?;
                }
                Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => {
                    let retry_after = parse_retry_after(&response);
                    if rate_limit_attempts >= self.config.rate_limit_max_retries {
                        return Err(Error::RateLimited { retry_after });
                    }
                    let wait = retry_after.unwrap_or(self.config.rate_limit_default_backoff);
                    if wait > MAX_RATE_LIMIT_WAIT {
                        return Err(Error::RateLimited { retry_after });
                    }
                    rate_limit_attempts += 1;
                    tracing::warn!(
                        %url,
                        wait_ms = wait.as_millis(),
                        attempt = rate_limit_attempts,
                        "Rate limited, waiting before resending"
                    );
                    tokio::time::sleep(wait).await;
                }
                Ok(response) => return Ok(response),
                Err(e) => {
                    let error = Error::Transport(e);
                    if !error.is_retryable() || transient_attempts >= self.config.retry.max_attempts
                    {
                        return Err(error);
                    }
                    transient_attempts += 1;
                    tracing::warn!(
                        %url,
                        error = %error,
                        attempt = transient_attempts,
                        "Transient network failure, retrying request"
                    );
                    let wait = if self.config.retry.jitter {
                        add_jitter(transient_delay)
                    } else {
                        transient_delay
                    };
                    tokio::time::sleep(wait).await;
                    transient_delay = Duration::from_secs_f64(
                        transient_delay.as_secs_f64() * self.config.retry.backoff_multiplier,
                    )
                    .min(self.config.retry.max_delay);
                }
            }
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("api_base_url", &self.config.api_base_url)
            .finish_non_exhaustive()
    }
}

/// Parse a Retry-After header given in whole seconds
fn parse_retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
