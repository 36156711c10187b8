// ABOUTME: Bounded exponential backoff for rate-limited upstream calls
// ABOUTME: Maps transport failures to the caller-facing error taxonomy, read vs write aware

use crate::error::{ApiError, ApiResult, DigestError, Result};
use crate::metrics;
use std::future::Future;
use std::time::Duration;

/// Whether a call mutates upstream state. Writes never retry on ambiguous failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): the exponential step or
    /// the server's advice, whichever is longer, never above `max_delay`.
    pub fn delay_for(&self, retry: u32, advised: Option<Duration>) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        let backoff = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        match advised {
            Some(advised) => backoff.max(advised).min(self.max_delay),
            None => backoff,
        }
    }

    /// Advice we will not wait out.
    fn exceeds_ceiling(&self, advised: Option<Duration>) -> bool {
        advised.is_some_and(|advised| advised > self.max_delay)
    }

    /// Run `call` until it succeeds, fails with a non-retryable error, or the
    /// rate-limit retry budget is spent.
    pub async fn run<T, F, Fut>(
        &self,
        method: &'static str,
        kind: CallKind,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ApiResult<T>>,
    {
        let mut retry = 0u32;
        loop {
            metrics::record_upstream_call(method);
            match call().await {
                Ok(value) => return Ok(value),
                Err(ApiError::RateLimited { retry_after }) => {
                    metrics::record_rate_limited(method);
                    if self.exceeds_ceiling(retry_after) {
                        tracing::warn!(
                            method,
                            attempts = retry + 1,
                            retry_after_secs = retry_after.map_or(0, |d| d.as_secs()),
                            max_delay_secs = self.max_delay.as_secs(),
                            "Upstream asked for a longer wait than the backoff ceiling"
                        );
                        return Err(DigestError::UpstreamUnavailable {
                            attempts: retry + 1,
                            retry_after,
                        });
                    }
                    if retry >= self.max_retries {
                        tracing::warn!(
                            method,
                            attempts = retry + 1,
                            "Rate limit retry budget exhausted"
                        );
                        return Err(DigestError::UpstreamUnavailable {
                            attempts: retry + 1,
                            retry_after,
                        });
                    }
                    let delay = self.delay_for(retry, retry_after);
                    tracing::warn!(
                        method,
                        attempt = retry + 1,
                        retry_after_ms = delay.as_millis() as u64,
                        "Rate limited by upstream, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(err) => return Err(map_error(method, kind, retry + 1, err)),
            }
        }
    }
}

fn map_error(method: &'static str, kind: CallKind, attempts: u32, err: ApiError) -> DigestError {
    match err {
        ApiError::Rejected { status, message } => {
            tracing::debug!(method, status = %status, "Upstream rejected request");
            DigestError::Upstream { status, message }
        }
        ApiError::Transport { message, sent } if sent && kind == CallKind::Write => {
            tracing::warn!(method, error = %message, "Write failed after transmission");
            DigestError::WriteAmbiguous {
                operation: method,
                message,
            }
        }
        ApiError::Transport { message, .. } => {
            tracing::warn!(method, error = %message, "Upstream transport failure");
            DigestError::UpstreamUnavailable {
                attempts,
                retry_after: None,
            }
        }
        ApiError::RateLimited { retry_after } => DigestError::UpstreamUnavailable {
            attempts,
            retry_after,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.delay_for(0, None), Duration::from_millis(100));
        assert_eq!(p.delay_for(1, None), Duration::from_millis(200));
        assert_eq!(p.delay_for(3, None), Duration::from_millis(800));
        assert_eq!(p.delay_for(4, None), Duration::from_secs(1));
        assert_eq!(p.delay_for(40, None), Duration::from_secs(1));
    }

    #[test]
    fn test_server_advice_extends_delay_up_to_ceiling() {
        let p = policy();
        assert_eq!(
            p.delay_for(0, Some(Duration::from_millis(700))),
            Duration::from_millis(700)
        );
        assert_eq!(
            p.delay_for(2, Some(Duration::from_millis(10))),
            Duration::from_millis(400)
        );
        assert_eq!(
            p.delay_for(0, Some(Duration::from_secs(86_400))),
            Duration::from_secs(1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_advice_beyond_ceiling_fails_without_waiting() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let result = policy()
            .run("test.read", CallKind::Read, || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ApiError::RateLimited {
                        retry_after: Some(Duration::from_secs(86_400)),
                    })
                } else {
                    Ok(1)
                }
            })
            .await;
        assert_eq!(
            result,
            Err(DigestError::UpstreamUnavailable {
                attempts: 1,
                retry_after: Some(Duration::from_secs(86_400)),
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_rate_limits() {
        let calls = AtomicU32::new(0);
        let result = policy()
            .run("test.read", CallKind::Read, || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(ApiError::RateLimited { retry_after: None })
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_is_unavailable() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = policy()
            .run("test.read", CallKind::Read, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ApiError::RateLimited {
                    retry_after: Some(Duration::from_millis(500)),
                })
            })
            .await;
        assert_eq!(
            result,
            Err(DigestError::UpstreamUnavailable {
                attempts: 4,
                retry_after: Some(Duration::from_millis(500)),
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = policy()
            .run("test.read", CallKind::Read, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ApiError::rejected("not_in_channel", "bot is not a member"))
            })
            .await;
        assert!(matches!(
            result,
            Err(DigestError::Upstream { ref status, .. }) if status == "not_in_channel"
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sent_write_failure_is_ambiguous() {
        let result: Result<()> = policy()
            .run("chat.postMessage", CallKind::Write, || async {
                Err(ApiError::timeout("operation timed out"))
            })
            .await;
        assert!(matches!(
            result,
            Err(DigestError::WriteAmbiguous {
                operation: "chat.postMessage",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_unsent_write_failure_is_unavailable() {
        let result: Result<()> = policy()
            .run("chat.postMessage", CallKind::Write, || async {
                Err(ApiError::connect("connection refused"))
            })
            .await;
        assert!(matches!(result, Err(DigestError::UpstreamUnavailable { attempts: 1, .. })));
    }

    #[tokio::test]
    async fn test_read_timeout_is_unavailable_not_ambiguous() {
        let result: Result<()> = policy()
            .run("conversations.history", CallKind::Read, || async {
                Err(ApiError::timeout("operation timed out"))
            })
            .await;
        assert!(matches!(result, Err(DigestError::UpstreamUnavailable { .. })));
    }
}
