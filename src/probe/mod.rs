//! Probe module: ICMP echo latency measurement with timeout and retries.

mod ping;

pub use ping::*;

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::db::{round2, ProbeResult};

/// Probe error types.
///
/// Everything except `Fatal` is an expected network outcome and ends up
/// recorded as a failed [`ProbeResult`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    #[error("timeout: no reply within {0:?}")]
    Timeout(Duration),
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("name resolution failed: {0}")]
    Resolution(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("fatal probe error: {0}")]
    Fatal(String),
}

impl ProbeError {
    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProbeError::Timeout(_) | ProbeError::Unreachable(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ProbeError::Fatal(_))
    }
}

/// Longest hostname accepted, per DNS name limits.
pub const MAX_HOSTNAME_LEN: usize = 255;

/// Whether `hostname` is safe to hand to a resolver or the `ping` command:
/// non-empty, no leading `-`, no whitespace or control characters.
pub fn is_valid_hostname(hostname: &str) -> bool {
    !hostname.is_empty()
        && hostname.len() <= MAX_HOSTNAME_LEN
        && !hostname.starts_with('-')
        && !hostname.chars().any(|c| c.is_whitespace() || c.is_control())
}

/// A single echo exchange against one host.
#[async_trait]
pub trait Pinger: Send + Sync {
    /// Returns the round-trip time of one echo request.
    async fn ping(&self, hostname: &str, timeout: Duration) -> Result<Duration, ProbeError>;
}

/// Pinger backed by ICMP sockets or the system `ping` command.
#[derive(Debug, Default, Clone, Copy)]
pub struct IcmpPinger;

#[async_trait]
impl Pinger for IcmpPinger {
    async fn ping(&self, hostname: &str, timeout: Duration) -> Result<Duration, ProbeError> {
        run_ping_probe(hostname, timeout).await
    }
}

/// Applies the timeout/retry policy on top of a [`Pinger`].
#[derive(Clone)]
pub struct Prober {
    pinger: Arc<dyn Pinger>,
    timeout: Duration,
    retries: u32,
}

impl Prober {
    pub fn new(timeout: Duration, retries: u32) -> Self {
        Self::with_pinger(Arc::new(IcmpPinger), timeout, retries)
    }

    pub fn with_pinger(pinger: Arc<dyn Pinger>, timeout: Duration, retries: u32) -> Self {
        Self {
            pinger,
            timeout,
            retries,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Longest a single [`Prober::probe`] call can take.
    pub fn worst_case(&self) -> Duration {
        self.timeout * (self.retries + 1)
    }

    /// Measure latency to `hostname`.
    ///
    /// Timeouts and unreachable replies are retried up to `retries` more
    /// times with no delay; resolution and permission failures are final.
    /// Network failures come back as `Ok` with `success = false`; only
    /// [`ProbeError::Fatal`] is returned as an error.
    pub async fn probe(&self, hostname: &str) -> Result<ProbeResult, ProbeError> {
        let timestamp = Utc::now().timestamp_millis();
        let mut last_error = None;

        for attempt in 0..=self.retries {
            let outcome = tokio::time::timeout(self.timeout, self.pinger.ping(hostname, self.timeout))
                .await
                .unwrap_or(Err(ProbeError::Timeout(self.timeout)))
                .and_then(|rtt| {
                    if rtt >= self.timeout {
                        Err(ProbeError::Timeout(self.timeout))
                    } else {
                        Ok(rtt)
                    }
                });

            match outcome {
                Ok(rtt) => {
                    let latency_ms = round2(rtt.as_nanos() as f64 / 1_000_000.0);
                    tracing::debug!("Ping to {}: {:.2}ms (attempt {})", hostname, latency_ms, attempt + 1);
                    return Ok(ProbeResult::succeeded(hostname, timestamp, latency_ms));
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::debug!("Ping to {} failed (attempt {}): {}", hostname, attempt + 1, e);
                    let retry = e.is_retryable();
                    last_error = Some(e);
                    if !retry {
                        break;
                    }
                }
            }
        }

        let error = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempt made".to_string());
        Ok(ProbeResult::failed(hostname, timestamp, error))
    }
}
