//! Retry policy for establishing provider streams.
//!
//! Transient failures (5xx, 429, transport errors) are retried with
//! exponential backoff and jitter. Each attempt is reported to an observer
//! so the agent loop can journal retry telemetry into the transcript.

use std::time::Duration;

use wuhu_domain::error::Result;
use wuhu_domain::stream::{AssistantEvent, BoxStream};

use crate::traits::{ModelRequest, Provider};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub factor: f64,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
            factor: 2.0,
            cap: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff for the given retry index (0-based), with ±10% jitter.
    pub fn backoff(&self, retry_index: u32) -> Duration {
        let base = self.initial_backoff.as_secs_f64() * self.factor.powi(retry_index as i32);
        let capped = base.min(self.cap.as_secs_f64());
        // Clock-derived jitter in [-0.1, +0.1]; good enough to de-align
        // concurrent sessions without pulling in an RNG.
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        let jitter = ((nanos % 2001) as f64 / 1000.0 - 1.0) * 0.1;
        Duration::from_secs_f64(capped * (1.0 + jitter))
    }
}

/// What the retry loop is doing; forwarded to the transcript as
/// `llm.retry` / `llm.give_up` telemetry entries.
#[derive(Debug, Clone)]
pub enum RetryEvent {
    Attempt {
        retry_index: u32,
        max_retries: u32,
        backoff_seconds: f64,
        error: String,
    },
    GiveUp {
        retries: u32,
        error: String,
    },
}

/// Establish a provider stream, retrying transient failures.
///
/// Only stream *establishment* is retried; once events are flowing, a
/// mid-stream failure surfaces to the caller unretried (the transcript
/// may already contain observable effects of this inference).
pub async fn stream_with_retry(
    provider: &dyn Provider,
    req: &ModelRequest,
    policy: &RetryPolicy,
    mut observe: impl FnMut(RetryEvent),
) -> Result<BoxStream<'static, Result<AssistantEvent>>> {
    let mut retry_index = 0u32;
    loop {
        match provider.stream(req).await {
            Ok(stream) => return Ok(stream),
            Err(e) if e.is_retryable() && retry_index < policy.max_retries => {
                let backoff = policy.backoff(retry_index);
                tracing::warn!(
                    provider = provider.provider_id(),
                    retry_index,
                    backoff_secs = backoff.as_secs_f64(),
                    error = %e,
                    "provider request failed; retrying"
                );
                observe(RetryEvent::Attempt {
                    retry_index,
                    max_retries: policy.max_retries,
                    backoff_seconds: backoff.as_secs_f64(),
                    error: e.to_string(),
                });
                tokio::time::sleep(backoff).await;
                retry_index += 1;
            }
            Err(e) => {
                if e.is_retryable() {
                    observe(RetryEvent::GiveUp {
                        retries: retry_index,
                        error: e.to_string(),
                    });
                }
                return Err(e);
            }
        }
    }
}
