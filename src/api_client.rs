//! Rate-limited, retrying HTTP executor shared by every outbound call.
//!
//! The catalogs enforce aggressive rate limits, so all requests funnel
//! through one client instance that bounds in-flight concurrency with a
//! semaphore and paces dispatches with a direct rate limiter. Transport
//! errors and 5xx responses are retried with linear backoff; a 429 honors
//! the server's `Retry-After` without consuming a retry slot.

use std::num::NonZeroU32;
use std::time::Duration;

use bytes::Bytes;
use governor::{
    Quota, RateLimiter, clock::DefaultClock, state::InMemoryState, state::direct::NotKeyed,
};
use reqwest::{RequestBuilder, StatusCode, header};
use tokio::sync::Semaphore;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    /// Maximum concurrent in-flight calls.
    pub max_concurrent: usize,
    /// Per-call timeout.
    pub timeout: Duration,
    /// Retries after the initial attempt.
    pub max_retries: u32,
    /// Linear backoff unit: sleep `base_backoff * attempt` before retrying.
    pub base_backoff: Duration,
    /// Minimum delay between dispatches, layered on top of the semaphore.
    pub pace: Duration,
}

impl Default for ApiClientConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            timeout: Duration::from_secs(10),
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
            pace: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("failed to send request: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("server error: {0}")]
    Upstream(StatusCode),
    #[error("rate limited by upstream")]
    RateLimited,
    #[error("request body cannot be re-materialized for a retry")]
    UncloneableRequest,
    #[error("concurrency slots closed")]
    SlotsClosed,
    #[error("all retries failed: {source}")]
    RetriesExhausted {
        #[source]
        source: Box<ApiError>,
    },
}

pub struct RateLimitedClient {
    http: reqwest::Client,
    slots: Semaphore,
    pacer: DirectRateLimiter,
    config: ApiClientConfig,
}

impl RateLimitedClient {
    pub fn new(config: ApiClientConfig) -> Self {
        let quota =
            Quota::with_period(config.pace).unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN));
        Self {
            http: reqwest::Client::new(),
            slots: Semaphore::new(config.max_concurrent.max(1)),
            pacer: RateLimiter::direct(quota),
            config,
        }
    }

    /// Handle for building requests that will be executed by this client.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Executes the request, retrying on transport errors and 5xx responses.
    /// Any other response is returned as-is for the caller to classify.
    pub async fn execute(&self, request: RequestBuilder) -> Result<(StatusCode, Bytes), ApiError> {
        let mut attempt: u32 = 0;
        let mut rate_limit_hits: u32 = 0;

        loop {
            if attempt > 0 {
                tokio::time::sleep(self.config.base_backoff * attempt).await;
            }
            let req = request.try_clone().ok_or(ApiError::UncloneableRequest)?;

            self.pacer.until_ready().await;
            let result = self.dispatch(req).await;

            let failure = match result {
                Ok((status, retry_after, body)) if status == StatusCode::TOO_MANY_REQUESTS => {
                    if rate_limit_hits >= self.config.max_retries {
                        return Err(ApiError::RetriesExhausted {
                            source: Box::new(ApiError::RateLimited),
                        });
                    }
                    rate_limit_hits += 1;
                    let wait = Duration::from_secs(retry_after.unwrap_or(1));
                    tracing::warn!(wait_secs = wait.as_secs(), "rate limited, honoring Retry-After");
                    tokio::time::sleep(wait).await;
                    // A server-directed wait does not consume a retry slot.
                    let _ = body;
                    continue;
                }
                Ok((status, _, _)) if status.is_server_error() => ApiError::Upstream(status),
                Ok((status, _, body)) => return Ok((status, body)),
                Err(e) => e,
            };

            attempt += 1;
            if attempt > self.config.max_retries {
                return Err(ApiError::RetriesExhausted {
                    source: Box::new(failure),
                });
            }
            tracing::debug!(attempt, error = %failure, "retrying request");
        }
    }

    /// One dispatch through a concurrency slot. The slot is held only for
    /// the call and body read, never across backoff sleeps.
    async fn dispatch(
        &self,
        request: RequestBuilder,
    ) -> Result<(StatusCode, Option<u64>, Bytes), ApiError> {
        let _slot = self
            .slots
            .acquire()
            .await
            .map_err(|_| ApiError::SlotsClosed)?;

        let response = request
            .timeout(self.config.timeout)
            .send()
            .await
            .map_err(ApiError::Transport)?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = response.bytes().await.map_err(ApiError::Transport)?;
        Ok((status, retry_after, body))
    }
}
