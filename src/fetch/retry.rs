//! Retry policy and the fetch loop that applies it.

use rand::Rng;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use super::rate_limit::RateBudget;
use super::{ServiceClient, ServiceError, ServiceListing};
use crate::model::{DelayRecord, FetchKey};

/// Backoff parameters. Exponential from `base_delay_ms`, capped at
/// `max_delay_ms`, plus uniform jitter in `[0, jitter_ms]`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_ms: 400,
        }
    }
}

impl RetryPolicy {
    pub fn should_retry(&self, error: &ServiceError, attempt: u32) -> bool {
        error.is_retryable() && attempt < self.max_attempts
    }

    /// Delay before the attempt after `attempt` (1-based). A `retry_after`
    /// hint is a lower bound.
    pub fn backoff(&self, attempt: u32, error: &ServiceError) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64 << attempt.saturating_sub(1).min(20));
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        let delay = Duration::from_millis(exp.min(self.max_delay_ms) + jitter);

        match error {
            ServiceError::RateLimited {
                retry_after: Some(hint),
            } => delay.max(*hint),
            _ => delay,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FailureKind {
    Auth,
    Fatal,
    DataIntegrity,
    ExhaustedRetries,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Auth => "auth",
            FailureKind::Fatal => "fatal",
            FailureKind::DataIntegrity => "data_integrity",
            FailureKind::ExhaustedRetries => "exhausted_retries",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome for one key after the policy gave up.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind} after {attempts} attempt(s): {last_error}")]
pub struct FetchFailure {
    pub kind: FailureKind,
    pub last_error: ServiceError,
    pub attempts: u32,
}

impl FetchFailure {
    fn terminal(last_error: ServiceError, attempts: u32) -> Self {
        let kind = match last_error {
            ServiceError::Auth => FailureKind::Auth,
            ServiceError::DataIntegrity(_) => FailureKind::DataIntegrity,
            ServiceError::Fatal { .. } => FailureKind::Fatal,
            ServiceError::RateLimited { .. } | ServiceError::Transient { .. } => {
                FailureKind::ExhaustedRetries
            }
        };
        Self {
            kind,
            last_error,
            attempts,
        }
    }
}

/// Wraps a [`ServiceClient`] with the retry policy and the shared budget.
/// Listings and details lookups draw on the same budget.
pub struct RetryingFetcher<C> {
    client: C,
    policy: RetryPolicy,
    budget: Arc<RateBudget>,
    requests: AtomicU64,
}

impl<C: ServiceClient> RetryingFetcher<C> {
    pub fn new(client: C, policy: RetryPolicy, budget: Arc<RateBudget>) -> Self {
        Self {
            client,
            policy,
            budget,
            requests: AtomicU64::new(0),
        }
    }

    /// Upstream requests issued so far, retries included.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    #[tracing::instrument(skip(self), fields(key = %key))]
    pub async fn fetch_with_retry(&self, key: &FetchKey) -> Result<ServiceListing, FetchFailure> {
        let listing = self.retry(move || self.client.fetch(key)).await?;
        debug!(
            returned = listing.returned,
            rids = listing.rids.len(),
            "Listing fetched"
        );
        Ok(listing)
    }

    #[tracing::instrument(skip(self), fields(key = %key))]
    pub async fn details_with_retry(
        &self,
        key: &FetchKey,
        rid: &str,
    ) -> Result<Option<DelayRecord>, FetchFailure> {
        self.retry(move || self.client.details(key, rid)).await
    }

    async fn retry<T, F, Fut>(&self, mut call: F) -> Result<T, FetchFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let result = {
                let _permit = self.budget.acquire().await;
                self.requests.fetch_add(1, Ordering::Relaxed);
                call().await
            };

            let error = match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !self.policy.should_retry(&error, attempt) {
                let failure = FetchFailure::terminal(error, attempt);
                warn!(attempt, kind = %failure.kind, error = %failure.last_error, "Giving up");
                return Err(failure);
            }

            let delay = self.policy.backoff(attempt, &error);
            warn!(
                attempt,
                max_attempts = self.policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retryable upstream failure"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
