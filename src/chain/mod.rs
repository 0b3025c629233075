//! Chain module - ledger clients, wallets and transaction execution
//!
//! This module provides:
//! - The `ChainClient` and `WalletSigner` seams every ecosystem plugs into
//! - A registry of configured chains and connected wallets
//! - Sign, submit and confirm with bounded retry of transient RPC failures
//! - An ethers-backed client and wallet for EVM chains

pub mod evm;
pub mod retry;
pub mod tx;

pub use evm::{EvmRpcClient, EvmWallet};
pub use retry::RetryPolicy;
pub use tx::{Instruction, SignedTx, Tx, TxStatus, UnsignedTx};

use crate::catalog::{EcosystemId, Protocol};
use crate::config::{ChainConfig, Settings};
use crate::error::{OrchestratorError, OrchestratorResult};

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Read and submit access to one ledger
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn ecosystem(&self) -> EcosystemId;

    /// Submit a signed transaction, returning its id
    async fn submit(&self, tx: SignedTx) -> OrchestratorResult<String>;

    async fn get_tx(&self, tx_id: &str) -> OrchestratorResult<TxStatus>;

    /// Atomic balance of `token` held by `owner`
    async fn get_balance(&self, owner: &str, token: &str) -> OrchestratorResult<u128>;

    /// Atomic allowance granted by `owner` to `spender` (EVM only)
    async fn get_allowance(
        &self,
        owner: &str,
        token: &str,
        spender: &str,
    ) -> OrchestratorResult<u128>;

    /// Token account holding `mint` for `owner` (Solana only)
    async fn find_token_account(&self, owner: &str, mint: &str)
        -> OrchestratorResult<Option<String>>;

    /// Most recent confirmed transactions signed by `address`, newest first
    async fn recent_txs(&self, address: &str, limit: usize) -> OrchestratorResult<Vec<Tx>>;

    async fn health_check(&self) -> bool {
        true
    }
}

/// A connected wallet able to sign for one ecosystem
#[async_trait]
pub trait WalletSigner: Send + Sync {
    fn ecosystem(&self) -> EcosystemId;

    fn address(&self) -> String;

    async fn sign(&self, tx: UnsignedTx) -> OrchestratorResult<SignedTx>;
}

/// A configured chain and its client
pub struct Chain {
    pub config: ChainConfig,
    pub client: Arc<dyn ChainClient>,
}

impl Chain {
    pub fn ecosystem(&self) -> EcosystemId {
        self.config.ecosystem
    }
}

/// Manages chains and wallets for every ecosystem in use
#[derive(Default)]
pub struct ChainRegistry {
    /// Chains indexed by ecosystem
    chains: DashMap<EcosystemId, Arc<Chain>>,
    /// Connected wallets indexed by ecosystem
    wallets: DashMap<EcosystemId, Arc<dyn WalletSigner>>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with an RPC client for every enabled EVM chain
    ///
    /// Solana chains need a caller-provided client and are left for
    /// `register`.
    pub async fn from_settings(settings: &Settings) -> OrchestratorResult<Self> {
        let registry = Self::new();

        for (name, chain_config) in settings.enabled_chains() {
            if chain_config.ecosystem.protocol() != Protocol::Evm {
                warn!(
                    "Chain {} ({}) needs an externally provided client",
                    name, chain_config.ecosystem
                );
                continue;
            }

            info!("Initializing chain {} ({})", name, chain_config.ecosystem);
            let client = EvmRpcClient::new(chain_config.clone()).await?;
            registry.register(chain_config.clone(), Arc::new(client));
        }

        Ok(registry)
    }

    pub fn register(&self, config: ChainConfig, client: Arc<dyn ChainClient>) {
        debug!("Registered chain {}", config.ecosystem);
        self.chains
            .insert(config.ecosystem, Arc::new(Chain { config, client }));
    }

    pub fn connect_wallet(&self, wallet: Arc<dyn WalletSigner>) {
        info!(
            "Wallet {} connected on {}",
            wallet.address(),
            wallet.ecosystem()
        );
        self.wallets.insert(wallet.ecosystem(), wallet);
    }

    pub fn disconnect_wallet(&self, ecosystem: EcosystemId) {
        if self.wallets.remove(&ecosystem).is_some() {
            info!("Wallet disconnected on {}", ecosystem);
        }
    }

    pub fn chain(&self, ecosystem: EcosystemId) -> OrchestratorResult<Arc<Chain>> {
        self.chains
            .get(&ecosystem)
            .map(|c| c.clone())
            .ok_or_else(|| {
                OrchestratorError::InvalidRoute(format!("no chain configured for {}", ecosystem))
            })
    }

    pub fn wallet(&self, ecosystem: EcosystemId) -> OrchestratorResult<Arc<dyn WalletSigner>> {
        self.wallets
            .get(&ecosystem)
            .map(|w| w.clone())
            .ok_or_else(|| OrchestratorError::wallet(ecosystem, "no wallet connected"))
    }

    /// Wallet addresses by ecosystem
    pub fn connected_wallets(&self) -> BTreeMap<EcosystemId, String> {
        self.wallets
            .iter()
            .map(|e| (*e.key(), e.value().address()))
            .collect()
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(EcosystemId, bool)> {
        let chains: Vec<Arc<Chain>> = self.chains.iter().map(|e| e.value().clone()).collect();
        let mut results = Vec::new();

        for chain in chains {
            let healthy = chain.client.health_check().await;
            crate::metrics::record_chain_health(chain.ecosystem(), healthy);
            results.push((chain.ecosystem(), healthy));
        }

        results
    }
}

/// Executes transactions on behalf of one interaction
#[derive(Clone)]
pub struct TxRunner {
    registry: Arc<ChainRegistry>,
    policy: RetryPolicy,
    interaction_id: String,
    recent_tx_window: usize,
    cancelled: Arc<AtomicBool>,
}

impl TxRunner {
    pub fn new(
        registry: Arc<ChainRegistry>,
        policy: RetryPolicy,
        interaction_id: &str,
        recent_tx_window: usize,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            registry,
            policy,
            interaction_id: interaction_id.to_string(),
            recent_tx_window,
            cancelled,
        }
    }

    pub fn registry(&self) -> &ChainRegistry {
        &self.registry
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn interaction_id(&self) -> &str {
        &self.interaction_id
    }

    /// Fails once the interaction has been abandoned
    pub fn check_cancelled(&self) -> OrchestratorResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Abandoned(self.interaction_id.clone()));
        }
        Ok(())
    }

    /// Address of the connected wallet on `ecosystem`
    pub fn owner(&self, ecosystem: EcosystemId) -> OrchestratorResult<String> {
        Ok(self.registry.wallet(ecosystem)?.address())
    }

    /// Sign, submit and wait for confirmation
    pub async fn execute(
        &self,
        ecosystem: EcosystemId,
        instructions: Vec<tx::Instruction>,
    ) -> OrchestratorResult<Tx> {
        self.check_cancelled()?;

        let chain = self.registry.chain(ecosystem)?;
        let wallet = self.registry.wallet(ecosystem)?;

        // Solana transactions carry the interaction id as a memo
        let mut instructions = instructions;
        if ecosystem.protocol() == Protocol::Solana
            && !instructions
                .iter()
                .any(|ix| matches!(ix, Instruction::Memo { .. }))
        {
            instructions.push(Instruction::Memo {
                text: self.interaction_id.clone(),
            });
        }

        let unsigned = UnsignedTx {
            ecosystem,
            interaction_id: self.interaction_id.clone(),
            instructions,
        };
        let signed = wallet.sign(unsigned).await?;

        let tx_id = retry::with_retry(&self.policy, "submit", || {
            chain.client.submit(signed.clone())
        })
        .await?;

        info!(
            "Submitted tx {} on {} for interaction {}",
            tx_id, ecosystem, self.interaction_id
        );
        crate::metrics::record_tx_submitted(ecosystem);

        self.wait_for_confirmation(&chain, &tx_id).await
    }

    async fn wait_for_confirmation(&self, chain: &Chain, tx_id: &str) -> OrchestratorResult<Tx> {
        let started = Instant::now();

        loop {
            let status =
                retry::with_retry(&self.policy, "get_tx", || chain.client.get_tx(tx_id)).await?;

            match status {
                TxStatus::Confirmed(tx) if tx.succeeded() => {
                    debug!("Tx {} confirmed on {}", tx_id, chain.ecosystem());
                    return Ok(tx);
                }
                TxStatus::Confirmed(tx) => {
                    return Err(OrchestratorError::OnChainRejected {
                        ecosystem: chain.ecosystem().to_string(),
                        tx_id: tx_id.to_string(),
                        reason: tx.failure_reason(),
                    });
                }
                TxStatus::Pending => {
                    if started.elapsed() >= self.policy.confirmation_timeout {
                        return Err(OrchestratorError::rpc(
                            chain.ecosystem(),
                            format!("tx {} not confirmed in time", tx_id),
                        ));
                    }
                    tokio::time::sleep(self.policy.confirmation_poll).await;
                }
            }
        }
    }

    /// Fetch a confirmed transaction recorded earlier
    pub async fn fetch_tx(&self, ecosystem: EcosystemId, tx_id: &str) -> OrchestratorResult<Tx> {
        let chain = self.registry.chain(ecosystem)?;
        match retry::with_retry(&self.policy, "get_tx", || chain.client.get_tx(tx_id)).await? {
            TxStatus::Confirmed(tx) => Ok(tx),
            TxStatus::Pending => Err(OrchestratorError::InvalidState(format!(
                "recorded tx {} on {} is not confirmed",
                tx_id, ecosystem
            ))),
        }
    }

    /// Recent transactions of the wallet on `ecosystem` that carry this
    /// interaction's id
    pub async fn candidates(&self, ecosystem: EcosystemId) -> OrchestratorResult<Vec<Tx>> {
        let chain = self.registry.chain(ecosystem)?;
        let owner = self.owner(ecosystem)?;
        let window = self.recent_tx_window;

        let txs = retry::with_retry(&self.policy, "recent_txs", || {
            chain.client.recent_txs(&owner, window)
        })
        .await?;

        Ok(txs
            .into_iter()
            .filter(|tx| tx.interaction_id().as_deref() == Some(self.interaction_id.as_str()))
            .collect())
    }

    pub async fn allowance(
        &self,
        ecosystem: EcosystemId,
        token: &str,
        spender: &str,
    ) -> OrchestratorResult<u128> {
        let chain = self.registry.chain(ecosystem)?;
        let owner = self.owner(ecosystem)?;
        retry::with_retry(&self.policy, "get_allowance", || {
            chain.client.get_allowance(&owner, token, spender)
        })
        .await
    }

    pub async fn token_account(
        &self,
        ecosystem: EcosystemId,
        owner: &str,
        mint: &str,
    ) -> OrchestratorResult<Option<String>> {
        let chain = self.registry.chain(ecosystem)?;
        retry::with_retry(&self.policy, "find_token_account", || {
            chain.client.find_token_account(owner, mint)
        })
        .await
    }
}
