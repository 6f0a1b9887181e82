//! Upstream access: the service client (a metrics listing, then one details
//! lookup per service), its failure taxonomy, and the retry and rate-limit
//! layers wrapped around it.

mod basic;
mod client;
pub mod auth;
pub mod hsp;
pub mod rate_limit;
pub mod retry;

pub use basic::BasicClient;
pub use client::HttpClient;
pub use hsp::HspClient;
pub use rate_limit::RateBudget;
pub use retry::{FailureKind, FetchFailure, RetryPolicy, RetryingFetcher};

use async_trait::async_trait;
use std::time::Duration;

use crate::model::{DelayRecord, FetchKey};

/// Classified failure of a single upstream request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// Credentials were rejected. Wrong for every key, so the run stops.
    #[error("upstream rejected credentials")]
    Auth,
    #[error("rate limited by upstream (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    /// 5xx, timeout or a dropped connection. Client-side timeouts carry 408.
    #[error("transient upstream failure (status {status:?}): {message}")]
    Transient { status: Option<u16>, message: String },
    /// Any other 4xx, e.g. an unknown route.
    #[error("upstream refused request (status {status}): {message}")]
    Fatal { status: u16, message: String },
    /// The body is not shaped like the expected response.
    #[error("response does not match the expected schema: {0}")]
    DataIntegrity(String),
}

impl ServiceError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::RateLimited { .. } | ServiceError::Transient { .. }
        )
    }

    /// Coarse class used to break failures down in slice logs.
    pub fn class(&self) -> &'static str {
        match self {
            ServiceError::Auth => "auth",
            ServiceError::RateLimited { .. } => "rate_limited",
            ServiceError::Transient {
                status: Some(408), ..
            } => "timeout",
            ServiceError::Transient {
                status: Some(_), ..
            } => "server_error",
            ServiceError::Transient { status: None, .. } => "connection",
            ServiceError::Fatal { .. } => "client_error",
            ServiceError::DataIntegrity(_) => "data_integrity",
        }
    }
}

/// Services listed by one metrics request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceListing {
    /// Service ids (RIDs) in response order, duplicates removed.
    pub rids: Vec<String>,
    /// RIDs the upstream listed, duplicates included. This is the figure
    /// compared against the row cap.
    pub returned: usize,
}

/// The two upstream calls, one request each. No retries.
#[async_trait]
pub trait ServiceClient: Send + Sync {
    /// Lists the services running the key's route within its window.
    async fn fetch(&self, key: &FetchKey) -> Result<ServiceListing, ServiceError>;

    /// Looks up one service's arrival at the key's destination. `None` when
    /// the service has no usable arrival there.
    async fn details(&self, key: &FetchKey, rid: &str) -> Result<Option<DelayRecord>, ServiceError>;
}

#[async_trait]
impl<T: ServiceClient + ?Sized> ServiceClient for std::sync::Arc<T> {
    async fn fetch(&self, key: &FetchKey) -> Result<ServiceListing, ServiceError> {
        (**self).fetch(key).await
    }

    async fn details(&self, key: &FetchKey, rid: &str) -> Result<Option<DelayRecord>, ServiceError> {
        (**self).details(key, rid).await
    }
}
