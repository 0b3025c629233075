//! Bridge protocol adapter
//!
//! Moves one token amount between ecosystems through the guardian network
//! in three resumable sub-steps:
//! 1. Lock (or burn) on the source chain and read the published sequence
//! 2. Wait for the guardians to sign the attestation
//! 3. Redeem on the destination chain, staging signatures first on Solana
//!
//! Every confirmed transaction is reported through an `EventSink` as soon
//! as it lands so the caller can persist it before moving on.

pub mod attestation;
pub mod evm;
pub mod solana;

pub use attestation::{AttestationPoller, GuardianClient, GuardianError, HttpGuardianClient};

use crate::amount::Amount;
use crate::catalog::{EcosystemId, Protocol, TokenSpec};
use crate::chain::{Chain, Tx, TxRunner};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::idempotency::{self, ExpectedEffect};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Value moved from one ecosystem to another
#[derive(Debug, Clone, PartialEq)]
pub struct Transfer {
    pub amount: Amount,
    pub source: EcosystemId,
    pub destination: EcosystemId,
}

/// A token as it exists on one side of a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgedToken {
    pub address: String,
    /// Minted by the bridge rather than native to this ecosystem
    pub wrapped: bool,
}

/// Bridge metadata derived from the token catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRoute {
    pub source: BridgedToken,
    pub destination: BridgedToken,
    pub origin: EcosystemId,
    pub origin_address: String,
}

impl Transfer {
    pub fn token(&self) -> &Arc<TokenSpec> {
        self.amount.token()
    }

    pub fn route(&self) -> OrchestratorResult<TransferRoute> {
        let token = self.token();
        let side = |ecosystem: EcosystemId| -> OrchestratorResult<BridgedToken> {
            let details = token.details_on(ecosystem).ok_or_else(|| {
                OrchestratorError::InvalidRoute(format!(
                    "token {} is not available on {}",
                    token.id, ecosystem
                ))
            })?;
            Ok(BridgedToken {
                address: details.address.clone(),
                wrapped: !token.is_native_on(ecosystem),
            })
        };

        let origin = side(token.native_ecosystem)?;
        Ok(TransferRoute {
            source: side(self.source)?,
            destination: side(self.destination)?,
            origin: token.native_ecosystem,
            origin_address: origin.address,
        })
    }
}

/// Confirmed sub-steps of one transfer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeProgress {
    pub lock_tx: Option<String>,
    pub sequence: Option<u64>,
    #[serde(default)]
    pub staging_txs: Vec<String>,
    pub redeem_tx: Option<String>,
}

impl BridgeProgress {
    pub fn is_complete(&self) -> bool {
        self.redeem_tx.is_some()
    }

    pub fn tx_ids(&self) -> Vec<String> {
        self.lock_tx
            .iter()
            .chain(self.staging_txs.iter())
            .chain(self.redeem_tx.iter())
            .cloned()
            .collect()
    }

    pub fn apply(&mut self, event: &BridgeEvent) {
        match event {
            BridgeEvent::Locked { tx_id, sequence } => {
                self.lock_tx = Some(tx_id.clone());
                self.sequence = Some(*sequence);
            }
            BridgeEvent::Staged { tx_id } => {
                if !self.staging_txs.contains(tx_id) {
                    self.staging_txs.push(tx_id.clone());
                }
            }
            BridgeEvent::Redeemed { tx_id } => self.redeem_tx = Some(tx_id.clone()),
        }
    }
}

/// A sub-step confirmed on chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    Locked { tx_id: String, sequence: u64 },
    Staged { tx_id: String },
    Redeemed { tx_id: String },
}

/// Reports bridge events for one transfer step
#[derive(Clone)]
pub struct EventSink {
    step: usize,
    tx: mpsc::Sender<(usize, BridgeEvent)>,
}

impl EventSink {
    pub fn new(step: usize, tx: mpsc::Sender<(usize, BridgeEvent)>) -> Self {
        Self { step, tx }
    }

    async fn send(&self, event: BridgeEvent) {
        if self.tx.send((self.step, event)).await.is_err() {
            warn!("Bridge event for step {} dropped, receiver closed", self.step);
        }
    }
}

/// Completed transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeRecord {
    pub lock_tx: String,
    pub sequence: u64,
    pub staging_txs: Vec<String>,
    pub redeem_tx: String,
}

pub struct BridgeAdapter {
    poller: AttestationPoller,
}

impl BridgeAdapter {
    pub fn new(guardian: Arc<dyn GuardianClient>, poll_interval: Duration) -> Self {
        Self {
            poller: AttestationPoller::new(guardian, poll_interval),
        }
    }

    /// Drive a transfer to completion, skipping sub-steps already done
    pub async fn bridge(
        &self,
        runner: &TxRunner,
        transfer: &Transfer,
        progress: &BridgeProgress,
        events: &EventSink,
    ) -> OrchestratorResult<BridgeRecord> {
        if let (Some(lock_tx), Some(sequence), Some(redeem_tx)) =
            (&progress.lock_tx, progress.sequence, &progress.redeem_tx)
        {
            return Ok(BridgeRecord {
                lock_tx: lock_tx.clone(),
                sequence,
                staging_txs: progress.staging_txs.clone(),
                redeem_tx: redeem_tx.clone(),
            });
        }

        let route = transfer.route()?;
        let source = runner.registry().chain(transfer.source)?;
        let destination = runner.registry().chain(transfer.destination)?;

        info!(
            "Bridging {} from {} to {} for interaction {}",
            transfer.amount,
            transfer.source,
            transfer.destination,
            runner.interaction_id()
        );

        let (lock_tx, sequence) = self
            .lock(runner, &source, &destination, transfer, &route, progress)
            .await?;
        if progress.lock_tx.as_ref() != Some(&lock_tx) || progress.sequence != Some(sequence) {
            events
                .send(BridgeEvent::Locked {
                    tx_id: lock_tx.clone(),
                    sequence,
                })
                .await;
        }

        let receiver = runner.owner(transfer.destination)?;
        let candidates = runner.candidates(transfer.destination).await?;
        let redeemed = ExpectedEffect::Redeem {
            token_bridge: destination.config.token_bridge.clone(),
            token: route.destination.clone(),
            owner: receiver,
        };
        if let Some(tx) = idempotency::already_done(&redeemed, &candidates) {
            info!("Redeem {} already on {}, skipping", tx.id, transfer.destination);
            crate::metrics::record_tx_skipped(transfer.destination);
            events.send(BridgeEvent::Redeemed { tx_id: tx.id.clone() }).await;
            return Ok(BridgeRecord {
                lock_tx,
                sequence,
                staging_txs: progress.staging_txs.clone(),
                redeem_tx: tx.id,
            });
        }

        let attestation = self
            .poller
            .wait(
                transfer.source.wormhole_chain_id(),
                source.config.emitter_address()?,
                sequence,
                source.config.attestation_budget(),
                runner.policy(),
                || runner.check_cancelled(),
            )
            .await?;

        let staging_txs = match transfer.destination.protocol() {
            Protocol::Solana => {
                self.stage(runner, &destination, transfer, sequence, &attestation, progress, &candidates, events)
                    .await?
            }
            Protocol::Evm => Vec::new(),
        };

        let redeem = runner
            .execute(
                transfer.destination,
                vec![crate::chain::Instruction::BridgeRedeem {
                    token_bridge: destination.config.token_bridge.clone(),
                    attestation,
                }],
            )
            .await?;
        events
            .send(BridgeEvent::Redeemed {
                tx_id: redeem.id.clone(),
            })
            .await;

        info!(
            "Transfer {} -> {} complete: lock {} redeem {}",
            transfer.source, transfer.destination, lock_tx, redeem.id
        );
        crate::metrics::record_transfer_completed(transfer.source, transfer.destination);

        Ok(BridgeRecord {
            lock_tx,
            sequence,
            staging_txs,
            redeem_tx: redeem.id,
        })
    }

    /// Lock tx id and sequence, from progress, from chain, or by locking
    async fn lock(
        &self,
        runner: &TxRunner,
        source: &Chain,
        destination: &Chain,
        transfer: &Transfer,
        route: &TransferRoute,
        progress: &BridgeProgress,
    ) -> OrchestratorResult<(String, u64)> {
        if let Some(lock_tx) = &progress.lock_tx {
            let sequence = match progress.sequence {
                Some(sequence) => sequence,
                None => {
                    let tx = runner.fetch_tx(transfer.source, lock_tx).await?;
                    parse_sequence(source, &tx)?
                }
            };
            return Ok((lock_tx.clone(), sequence));
        }

        let owner = runner.owner(transfer.source)?;
        let candidates = runner.candidates(transfer.source).await?;
        let locked = ExpectedEffect::Lock {
            token_bridge: source.config.token_bridge.clone(),
            token: route.source.clone(),
            owner: owner.clone(),
        };
        if let Some(tx) = idempotency::already_done(&locked, &candidates) {
            info!("Lock {} already on {}, skipping", tx.id, transfer.source);
            crate::metrics::record_tx_skipped(transfer.source);
            let sequence = parse_sequence(source, &tx)?;
            return Ok((tx.id, sequence));
        }

        let amount = transfer.amount.to_atomic(transfer.source)?;
        let recipient = self.recipient(runner, destination, &route.destination).await?;
        let target_chain = transfer.destination.wormhole_chain_id();
        let nonce = bridge_nonce(runner.interaction_id());

        let tx = match transfer.source.protocol() {
            Protocol::Evm => {
                let approvals = evm::approval_instructions(
                    runner,
                    transfer.source,
                    &route.source.address,
                    &source.config.token_bridge,
                    amount,
                )
                .await?;
                for approval in approvals {
                    runner.execute(transfer.source, vec![approval]).await?;
                }
                runner
                    .execute(
                        transfer.source,
                        vec![crate::chain::Instruction::BridgeLock {
                            token_bridge: source.config.token_bridge.clone(),
                            token: route.source.address.clone(),
                            amount,
                            target_chain,
                            recipient,
                            nonce,
                        }],
                    )
                    .await?
            }
            Protocol::Solana => {
                let token_account = runner
                    .token_account(transfer.source, &owner, &route.source.address)
                    .await?
                    .ok_or_else(|| {
                        OrchestratorError::InvalidState(format!(
                            "no {} token account for {}",
                            transfer.token().id,
                            owner
                        ))
                    })?;
                runner
                    .execute(
                        transfer.source,
                        solana::lock_instructions(
                            &source.config.token_bridge,
                            &token_account,
                            &route.source.address,
                            amount,
                            target_chain,
                            recipient,
                            nonce,
                        ),
                    )
                    .await?
            }
        };

        let sequence = parse_sequence(source, &tx)?;
        Ok((tx.id, sequence))
    }

    /// Recipient of the redeemed tokens, as the bridge encodes it
    async fn recipient(
        &self,
        runner: &TxRunner,
        destination: &Chain,
        token: &BridgedToken,
    ) -> OrchestratorResult<[u8; 32]> {
        let owner = runner.owner(destination.ecosystem())?;
        match destination.ecosystem().protocol() {
            Protocol::Evm => evm::recipient(&owner),
            Protocol::Solana => {
                let account = runner
                    .token_account(destination.ecosystem(), &owner, &token.address)
                    .await?
                    .unwrap_or(owner);
                solana::recipient(&account)
            }
        }
    }

    /// Stage guardian signatures on Solana, resuming after the last
    /// confirmed staging transaction
    #[allow(clippy::too_many_arguments)]
    async fn stage(
        &self,
        runner: &TxRunner,
        destination: &Chain,
        transfer: &Transfer,
        sequence: u64,
        attestation: &[u8],
        progress: &BridgeProgress,
        candidates: &[Tx],
        events: &EventSink,
    ) -> OrchestratorResult<Vec<String>> {
        let signature_set = solana::signature_set_address(
            runner.interaction_id(),
            transfer.source.wormhole_chain_id(),
            sequence,
        );
        let core_bridge = &destination.config.core_bridge;
        let steps = solana::staging_steps(core_bridge, &signature_set, attestation)?;

        let mut staged = progress.staging_txs.clone();
        let on_chain = idempotency::all_done(
            &ExpectedEffect::AttestationStaged {
                core_bridge: core_bridge.clone(),
                signature_set: signature_set.clone(),
            },
            candidates,
        );
        for tx in on_chain {
            if !staged.contains(&tx.id) {
                crate::metrics::record_tx_skipped(transfer.destination);
                events.send(BridgeEvent::Staged { tx_id: tx.id.clone() }).await;
                staged.push(tx.id);
            }
        }

        for instructions in steps.into_iter().skip(staged.len()) {
            let tx = runner.execute(transfer.destination, instructions).await?;
            events.send(BridgeEvent::Staged { tx_id: tx.id.clone() }).await;
            staged.push(tx.id);
        }

        Ok(staged)
    }
}

fn parse_sequence(chain: &Chain, tx: &Tx) -> OrchestratorResult<u64> {
    match chain.ecosystem().protocol() {
        Protocol::Evm => evm::parse_sequence(tx, &chain.config.core_bridge),
        Protocol::Solana => solana::parse_sequence(tx),
    }
}

/// Bridge message nonce derived from the interaction id
fn bridge_nonce(interaction_id: &str) -> u32 {
    hex::decode(interaction_id)
        .ok()
        .and_then(|bytes| bytes.get(..4).map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]])))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, TestEnv};

    fn transfer(env: &TestEnv, token: &str, value: &str, source: EcosystemId, destination: EcosystemId) -> Transfer {
        Transfer {
            amount: testing::amount(&env.catalog, token, value),
            source,
            destination,
        }
    }

    async fn run(
        env: &TestEnv,
        transfer: &Transfer,
        progress: &BridgeProgress,
    ) -> (OrchestratorResult<BridgeRecord>, Vec<BridgeEvent>) {
        let (tx, mut rx) = mpsc::channel(16);
        let result = env
            .bridge
            .bridge(&env.runner(), transfer, progress, &EventSink::new(0, tx))
            .await;
        let mut events = Vec::new();
        while let Ok((_, event)) = rx.try_recv() {
            events.push(event);
        }
        (result, events)
    }

    #[test]
    fn route_marks_wrapped_sides() {
        let env = TestEnv::new();
        let route = transfer(&env, "usdc", "1", EcosystemId::Ethereum, EcosystemId::Solana)
            .route()
            .unwrap();
        assert!(!route.source.wrapped);
        assert!(route.destination.wrapped);
        assert_eq!(route.origin, EcosystemId::Ethereum);
    }

    #[tokio::test]
    async fn evm_to_solana_locks_stages_and_redeems() {
        let env = TestEnv::new();
        let t = transfer(&env, "usdc", "50", EcosystemId::Ethereum, EcosystemId::Solana);

        let (result, events) = run(&env, &t, &BridgeProgress::default()).await;
        let record = result.unwrap();

        // approval + lock on ethereum
        assert_eq!(env.ethereum.submitted().len(), 2);
        // two signature batches, the post, and the redeem on solana
        assert_eq!(record.staging_txs.len(), 3);
        assert_eq!(env.solana.submitted().len(), 4);
        assert!(matches!(events.first(), Some(BridgeEvent::Locked { .. })));
        assert!(matches!(events.last(), Some(BridgeEvent::Redeemed { .. })));
        assert_eq!(env.solana.balance_of(&env.solana.wallet_address(), testing::SOL_USDC), 50_000_000);
    }

    #[tokio::test]
    async fn existing_allowance_skips_approval() {
        let env = TestEnv::new();
        env.ethereum.set_allowance(testing::ETH_USDC, u128::MAX);
        let t = transfer(&env, "usdc", "50", EcosystemId::Ethereum, EcosystemId::Bsc);

        run(&env, &t, &BridgeProgress::default()).await.0.unwrap();
        assert_eq!(env.ethereum.submitted().len(), 1);
        assert_eq!(env.bsc.submitted().len(), 1);
    }

    #[tokio::test]
    async fn insufficient_nonzero_allowance_is_reset_first() {
        let env = TestEnv::new();
        env.ethereum.set_allowance(testing::ETH_USDC, 1);
        let t = transfer(&env, "usdc", "50", EcosystemId::Ethereum, EcosystemId::Bsc);

        run(&env, &t, &BridgeProgress::default()).await.0.unwrap();
        let approvals: Vec<u128> = env
            .ethereum
            .submitted()
            .iter()
            .flat_map(|tx| tx.instructions.clone())
            .filter_map(|ix| match ix {
                crate::chain::Instruction::Approve { amount, .. } => Some(amount),
                _ => None,
            })
            .collect();
        assert_eq!(approvals, vec![0, 50_000_000]);
    }

    #[tokio::test]
    async fn lock_already_on_chain_is_not_repeated() {
        let env = TestEnv::new();
        let t = transfer(&env, "usdc", "50", EcosystemId::Ethereum, EcosystemId::Bsc);

        // first attempt locks, then the guardians never answer
        env.guardian.set_missing(true);
        let (first, events) = run(&env, &t, &BridgeProgress::default()).await;
        assert!(matches!(first, Err(OrchestratorError::AttestationNotFound { .. })));
        let locks_before = env.ethereum.submitted().len();

        // retry without the recorded progress: the classifier finds the lock
        env.guardian.set_missing(false);
        let (second, _) = run(&env, &t, &BridgeProgress::default()).await;
        let record = second.unwrap();
        assert_eq!(env.ethereum.submitted().len(), locks_before);
        assert!(matches!(
            &events[0],
            BridgeEvent::Locked { tx_id, .. } if *tx_id == record.lock_tx
        ));
    }

    #[tokio::test]
    async fn staging_resumes_after_recorded_batches() {
        let env = TestEnv::new();
        let t = transfer(&env, "usdc", "50", EcosystemId::Ethereum, EcosystemId::Solana);

        env.solana.fail_after(2, "blockhash expired");
        let (first, _) = run(&env, &t, &BridgeProgress::default()).await;
        assert!(matches!(first, Err(OrchestratorError::OnChainRejected { .. })));
        assert_eq!(env.solana.submitted().len(), 3);

        let (second, _) = run(&env, &t, &BridgeProgress::default()).await;
        let record = second.unwrap();
        assert_eq!(record.staging_txs.len(), 3);
        // only the post and the redeem are new
        assert_eq!(env.solana.submitted().len(), 5);
    }
}
