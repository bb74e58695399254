//! Outbound HTTP with retry, backoff, and rate-limit handling.
//!
//! Every enrichment worker and the registry ingest go through [`Fetcher`].
//! The retry policy:
//!
//! - HTTP 200 → return the response.
//! - HTTP 404 → return immediately (permanent, retrying is pointless).
//! - HTTP 429 / 5xx → sleep `base_delay · 2^attempt`, retry up to
//!   `max_retries`, then return the last response.
//! - Network errors → same backoff; give up with [`FetchOutcome::GaveUp`]
//!   after the budget is spent.
//! - GitHub code search → honour `x-ratelimit-reset` and sleep until
//!   reset + 5 s, capped at 120 s.
//!
//! All sleeps race the cancellation token, so Ctrl-C interrupts a backoff
//! instead of waiting it out.

use anyhow::Result;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Response, StatusCode};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Which upstream service a request targets. Only the GitHub code-search
/// service gets the reset-header treatment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Generic,
    GitHub,
    GitHubSearch,
}

/// Outcome of a fetch: a response of any status, or exhaustion/cancellation.
pub enum FetchOutcome {
    Response(Response),
    GaveUp,
}

#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub timeout: Duration,
}

impl Fetcher {
    pub fn new(timeout: Duration, max_retries: u32, base_delay: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("wisp/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            max_retries,
            base_delay,
            timeout,
        })
    }

    /// Fetch a URL with the retry policy above.
    pub async fn fetch(
        &self,
        url: &str,
        headers: &[(&str, String)],
        params: &[(&str, String)],
        service: Service,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome> {
        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())?;
            header_map.insert(name, HeaderValue::from_str(value)?);
        }

        for attempt in 0..=self.max_retries {
            if cancel.is_cancelled() {
                return Ok(FetchOutcome::GaveUp);
            }

            let result = self
                .client
                .get(url)
                .headers(header_map.clone())
                .query(params)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();

                    if status == StatusCode::NOT_FOUND {
                        return Ok(FetchOutcome::Response(response));
                    }

                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        if attempt == self.max_retries {
                            return Ok(FetchOutcome::Response(response));
                        }
                        let delay = if service == Service::GitHubSearch {
                            search_reset_delay(response.headers())
                                .unwrap_or_else(|| backoff_delay(self.base_delay, attempt))
                        } else {
                            backoff_delay(self.base_delay, attempt)
                        };
                        if !sleep_cancellable(delay, cancel).await {
                            return Ok(FetchOutcome::GaveUp);
                        }
                        continue;
                    }

                    return Ok(FetchOutcome::Response(response));
                }
                Err(e) => {
                    if attempt == self.max_retries {
                        eprintln!("Warning: giving up on {url}: {e}");
                        return Ok(FetchOutcome::GaveUp);
                    }
                    let delay = backoff_delay(self.base_delay, attempt);
                    if !sleep_cancellable(delay, cancel).await {
                        return Ok(FetchOutcome::GaveUp);
                    }
                }
            }
        }

        Ok(FetchOutcome::GaveUp)
    }
}

/// Exponential backoff: `base · 2^attempt`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base * 2u32.saturating_pow(attempt.min(16))
}

/// Delay until the code-search quota resets, plus 5 s of slack, capped at
/// 120 s. `None` when the header is absent or unparseable.
fn search_reset_delay(headers: &HeaderMap) -> Option<Duration> {
    let reset: i64 = headers.get("x-ratelimit-reset")?.to_str().ok()?.parse().ok()?;
    let now = chrono::Utc::now().timestamp();
    let wait = (reset - now).max(0) as u64 + 5;
    Some(Duration::from_secs(wait.min(120)))
}

/// Sleep unless cancelled first. Returns `false` on cancellation.
pub async fn sleep_cancellable(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let base = Duration::from_millis(250);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(250));
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(1000));
    }

    #[test]
    fn test_search_reset_delay_capped() {
        let mut headers = HeaderMap::new();
        let far_future = chrono::Utc::now().timestamp() + 3600;
        headers.insert(
            "x-ratelimit-reset",
            HeaderValue::from_str(&far_future.to_string()).unwrap(),
        );
        assert_eq!(search_reset_delay(&headers), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_search_reset_delay_past_reset() {
        let mut headers = HeaderMap::new();
        let past = chrono::Utc::now().timestamp() - 100;
        headers.insert(
            "x-ratelimit-reset",
            HeaderValue::from_str(&past.to_string()).unwrap(),
        );
        // Already reset: only the 5 s slack remains.
        assert_eq!(search_reset_delay(&headers), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_search_reset_delay_missing_header() {
        assert_eq!(search_reset_delay(&HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn test_sleep_cancellable_observes_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let done = sleep_cancellable(Duration::from_secs(60), &cancel).await;
        assert!(!done);
    }
}
