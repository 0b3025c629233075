//! Guardian attestation polling

use crate::catalog::EcosystemId;
use crate::chain::retry::{with_retry, RetryPolicy};
use crate::config::GuardianConfig;
use crate::error::{OrchestratorError, OrchestratorResult};

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

/// Polls allowed before an attestation is reported missing
pub const DEFAULT_BUDGET: u32 = 10;

/// Budget multiplier for chains with slow finality
pub const SLOW_FINALITY_MULTIPLIER: u32 = 15;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Guardian poll budget for transfers out of `ecosystem`
pub fn default_budget(ecosystem: EcosystemId) -> u32 {
    match ecosystem {
        EcosystemId::Polygon => DEFAULT_BUDGET * SLOW_FINALITY_MULTIPLIER,
        _ => DEFAULT_BUDGET,
    }
}

#[derive(Debug, Error)]
pub enum GuardianError {
    #[error("attestation not yet available")]
    NotFound,

    #[error("guardian transport error: {0}")]
    Transport(String),
}

/// One request to the guardian network
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GuardianClient: Send + Sync {
    /// Signed attestation for (chain, emitter, sequence), polled once
    async fn get_signed_attestation(
        &self,
        chain_id: u16,
        emitter: [u8; 32],
        sequence: u64,
    ) -> Result<Vec<u8>, GuardianError>;
}

/// Polls guardians until an attestation shows up or the budget runs out
pub struct AttestationPoller {
    guardian: Arc<dyn GuardianClient>,
    poll_interval: Duration,
}

impl AttestationPoller {
    pub fn new(guardian: Arc<dyn GuardianClient>, poll_interval: Duration) -> Self {
        Self {
            guardian,
            poll_interval,
        }
    }

    /// One guardian request; `None` while the attestation is not signed yet
    async fn poll_once(
        &self,
        chain_id: u16,
        emitter: [u8; 32],
        sequence: u64,
    ) -> OrchestratorResult<Option<Vec<u8>>> {
        match self
            .guardian
            .get_signed_attestation(chain_id, emitter, sequence)
            .await
        {
            Ok(attestation) => Ok(Some(attestation)),
            Err(GuardianError::NotFound) => Ok(None),
            Err(GuardianError::Transport(message)) => Err(OrchestratorError::rpc(
                format!("guardians of chain {}", chain_id),
                message,
            )),
        }
    }

    /// Poll at most `budget` times, calling `check` before each poll
    ///
    /// Only "not found" answers count against the budget. Transport failures
    /// are retried under `policy` and surface as transient RPC errors once
    /// its retries run out.
    pub async fn wait<F>(
        &self,
        chain_id: u16,
        emitter: [u8; 32],
        sequence: u64,
        budget: u32,
        policy: &RetryPolicy,
        check: F,
    ) -> OrchestratorResult<Vec<u8>>
    where
        F: Fn() -> OrchestratorResult<()>,
    {
        let started = Instant::now();

        for attempt in 1..=budget {
            check()?;
            crate::metrics::record_attestation_poll(chain_id);

            let polled = with_retry(policy, "guardian_poll", || {
                self.poll_once(chain_id, emitter, sequence)
            })
            .await?;

            match polled {
                Some(attestation) => {
                    info!(
                        "Attestation for chain {} sequence {} after {} polls",
                        chain_id, sequence, attempt
                    );
                    crate::metrics::record_attestation_wait(chain_id, started.elapsed());
                    return Ok(attestation);
                }
                None => {
                    debug!(
                        "Attestation for chain {} sequence {} not found ({}/{})",
                        chain_id, sequence, attempt, budget
                    );
                }
            }

            if attempt < budget {
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        Err(OrchestratorError::AttestationNotFound {
            chain_id,
            sequence,
            attempts: budget,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignedVaaResponse {
    vaa_bytes: String,
}

/// Guardian REST client rotating through the configured endpoints
pub struct HttpGuardianClient {
    client: reqwest::Client,
    rpc_urls: Vec<String>,
    current: AtomicUsize,
}

impl HttpGuardianClient {
    pub fn new(config: &GuardianConfig) -> OrchestratorResult<Self> {
        if config.rpc_urls.is_empty() {
            return Err(OrchestratorError::Config(
                "no guardian RPC URLs configured".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| OrchestratorError::Config(format!("guardian client: {}", e)))?;

        Ok(Self {
            client,
            rpc_urls: config.rpc_urls.clone(),
            current: AtomicUsize::new(0),
        })
    }

    fn base_url(&self) -> &str {
        let idx = self.current.load(Ordering::Relaxed);
        self.rpc_urls[idx % self.rpc_urls.len()].trim_end_matches('/')
    }

    fn failover(&self) {
        let next = (self.current.load(Ordering::Relaxed) + 1) % self.rpc_urls.len();
        self.current.store(next, Ordering::Relaxed);
    }
}

#[async_trait]
impl GuardianClient for HttpGuardianClient {
    async fn get_signed_attestation(
        &self,
        chain_id: u16,
        emitter: [u8; 32],
        sequence: u64,
    ) -> Result<Vec<u8>, GuardianError> {
        let url = format!(
            "{}/v1/signed_vaa/{}/{}/{}",
            self.base_url(),
            chain_id,
            hex::encode(emitter),
            sequence
        );

        let response = self.client.get(&url).send().await.map_err(|e| {
            self.failover();
            GuardianError::Transport(e.to_string())
        })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(GuardianError::NotFound);
        }
        if !response.status().is_success() {
            self.failover();
            return Err(GuardianError::Transport(format!(
                "guardian returned {}",
                response.status()
            )));
        }

        let body = response
            .json::<SignedVaaResponse>()
            .await
            .map_err(|e| GuardianError::Transport(e.to_string()))?;

        base64::engine::general_purpose::STANDARD
            .decode(body.vaa_bytes)
            .map_err(|e| GuardianError::Transport(format!("invalid attestation encoding: {}", e)))
    }
}
