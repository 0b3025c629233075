//! Bounded retry for transient RPC failures

use crate::config::OrchestratorConfig;
use crate::error::OrchestratorResult;

use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Timing knobs for RPC calls and confirmation polling
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Extra attempts after the first transient failure
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub confirmation_poll: Duration,
    pub confirmation_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            confirmation_poll: Duration::from_millis(1000),
            confirmation_timeout: Duration::from_secs(120),
        }
    }
}

impl From<&OrchestratorConfig> for RetryPolicy {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            max_retries: config.rpc_max_retries,
            retry_delay: Duration::from_millis(config.rpc_retry_delay_ms),
            confirmation_poll: Duration::from_millis(config.confirmation_poll_ms),
            confirmation_timeout: Duration::from_secs(config.confirmation_timeout_secs),
        }
    }
}

/// Run `f`, retrying while it fails with a retryable error
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut f: F,
) -> OrchestratorResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = OrchestratorResult<T>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempts <= policy.max_retries => {
                warn!(
                    "{} failed (attempt {}/{}): {}",
                    operation,
                    attempts,
                    policy.max_retries + 1,
                    e
                );
                crate::metrics::record_rpc_retry(operation);
                tokio::time::sleep(policy.retry_delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
