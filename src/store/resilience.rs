//! Timeouts and transient-failure retries around repository calls

use crate::error::{DomainError, Result, StoreResult};
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// How repository calls are bounded and retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallPolicy {
    pub timeout: Duration,
    /// Extra attempts after the first one (reads only)
    pub retry_attempts: u32,
    /// Linear backoff step between attempts
    pub retry_backoff: Duration,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retry_attempts: 2,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

/// `store` section of the YAML configuration
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreSettings {
    pub timeout_ms: u64,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            retry_attempts: 2,
            retry_backoff_ms: 100,
        }
    }
}

impl From<&StoreSettings> for CallPolicy {
    fn from(settings: &StoreSettings) -> Self {
        Self {
            timeout: Duration::from_millis(settings.timeout_ms),
            retry_attempts: settings.retry_attempts,
            retry_backoff: Duration::from_millis(settings.retry_backoff_ms),
        }
    }
}

/// Run a single repository call under the policy timeout
pub async fn with_timeout<T, F>(policy: &CallPolicy, operation: &'static str, call: F) -> Result<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(policy.timeout, call).await {
        Ok(result) => result.map_err(DomainError::from),
        Err(_) => Err(DomainError::Timeout {
            operation,
            after: policy.timeout,
        }),
    }
}

/// Run a read, retrying transient failures and timeouts.
///
/// Only use for idempotent calls; writes go through `with_timeout`.
pub async fn read_with_retry<T, F, Fut>(
    policy: &CallPolicy,
    operation: &'static str,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        match with_timeout(policy, operation, call()).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.retry_attempts => {
                attempt += 1;
                warn!(operation, attempt, error = %e, "Transient store failure, retrying");
                tokio::time::sleep(policy.retry_backoff * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}
