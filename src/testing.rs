//! Test fixtures
//!
//! A small devnet catalog, a scripted in-memory ledger that acts as both
//! chain client and wallet, and a guardian network that signs whatever the
//! ledgers published.

use crate::amount::Amount;
use crate::bridge::{BridgeAdapter, GuardianClient, GuardianError};
use crate::catalog::{Catalog, EcosystemId, Env, PoolSpec, Protocol, TokenDetails, TokenSpec};
use crate::chain::tx::{
    event_topic, parse_evm_address, EvmTx, SolanaTx, TokenBalanceChange, TxPayload, TRANSFER_TOPIC,
};
use crate::chain::{
    ChainClient, ChainRegistry, Instruction, RetryPolicy, SignedTx, Tx, TxRunner, TxStatus,
    UnsignedTx, WalletSigner,
};
use crate::config::{ChainConfig, OrchestratorConfig};
use crate::coordination::Orchestrator;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::idempotency::MAX_RECENT_TXS;
use crate::interaction::{
    AddParams, Interaction, InteractionParams, InteractionState, SwapParams, TokenTransferDetail,
};
use crate::pool::{PoolCall, PoolInstruction};
use crate::state::{History, InMemoryStore, MAX_STORED_INTERACTIONS};

use async_trait::async_trait;
use chrono::Utc;
use ethers::types::{Log, H256, U256};
use sha3::{Digest, Keccak256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Semaphore;

pub const INTERACTION_ID: &str = "0123456789abcdef0123456789abcdef";

pub const ETH_USDC: &str = "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48";
pub const SOL_USDC: &str = "7si1kd5LaS4Nxk4fLyka5mHZaiUgCzSiWGCsdVKzDNCc";
const BSC_USDC: &str = "0x70b4e323597a200512183304de30a32dade42e72";
const ETH_USDT: &str = "0xdadc8203c28269a4b442fc42489052ad8cc2dbe9";
const BSC_USDT: &str = "0x8ce992f11e85c2ca5cd245cc32664b161f4b3445";
const SOL_USDT: &str = "AHR8BkjkVpLPzRz7VMBJ7UD2Tsyw4UzVm1RxoQ46XbmY";
const ETH_DAI: &str = "0x13d3d076ad3bbe8ff6377b0b1afc8b1acb0d7f52";
const BSC_BUSD: &str = "0x3cba63b551f15b18e45115ac31e9389cb56b999a";
const SOL_BUSD: &str = "FNdtoLEGDUJPbMGH871H7rh9ofDJPvKdR5yqx1uMErk9";
const ETH_LP: &str = "0x6b912fc8e4bf3f0da2f1bccab3ec8f81803e5734";
const BSC_ETH_LP: &str = "0x3b0a15c2ff6714386f17ff12944143c7a138c69e";
const SOL_LP: &str = "6cJ7FGhWUCPisnAQtDnArd5mZZrbb5P6k9C7ezu6rnXo";
const ETH_SOL_LP: &str = "0x06f3f93872b9dc78039a1a0481eab6b35d65a996";
const SOL_META_LP: &str = "FdddaGFPaszuspvF1AccVHFazjsXMJK2MjUTdh4pQAcN";
const ETH_DAI_LP: &str = "0xc1b2dc948623ecf3809f886c8e052cd01a92bd0b";

const SOL_POOL: &str = "Hid8NzkJNMcGmqGmv9ioJVxebj4AkCmfRKu9P2EQsNzM";
const SOL_META_POOL: &str = "BcJqA4AVG7vU3GhzE7tzAkCB7ewCgx7hhKaV7iD6T1F1";
const ETH_POOL: &str = "0x66c18ccb3fa0fcb84e83eb4bd23e02935f7c99dd";
const ETH_DAI_POOL: &str = "0x368815d22c595758ffc78b7615d2163f7a7b43ca";

const ETH_CORE_BRIDGE: &str = "0x98f3c9e6e3face36baad05fe09d375ef1464288b";
const ETH_TOKEN_BRIDGE: &str = "0x3ee18b2214aff97000d974cf647e7c347e8fa585";
const BSC_CORE_BRIDGE: &str = "0x755efb611ddc9eeed20ee4f5f4aa567bfba4c060";
const BSC_TOKEN_BRIDGE: &str = "0xca2a0a468529617c366fcca64c93e04a6c13921d";
const SOL_CORE_BRIDGE: &str = "worm2ZoG2kUd4vFXhvjh93UUH596ayRfgQ2MgjNMTth";
const SOL_TOKEN_BRIDGE: &str = "wormDTUJ6AWPNvk59vGQbDvGJmqbDTdgWgAqcLBCgUb";
const SOL_EMITTER: &str = "ec7372995d5cc8732397fb0ad35c0121e0eaa90d26f828a534cab54391b3a4f5";

const TOKEN_PROGRAM: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";
const ASSOCIATED_TOKEN_PROGRAM: &str = "ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL";
const MEMO_PROGRAM: &str = "MemoSq4gqABAXKb96qnH8TysNcWxMyWCqXgDLGmfcHr";
const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// Guardian signatures carried by every mock attestation
const GUARDIAN_SIGNATURES: usize = 13;

const TOKEN_IDS: [&str; 8] = [
    "usdc", "usdt", "dai", "busd", "eth-lp", "sol-lp", "meta-lp", "eth-dai-lp",
];

pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        retry_delay: Duration::from_millis(1),
        confirmation_poll: Duration::from_millis(1),
        confirmation_timeout: Duration::from_secs(1),
    }
}

pub fn orchestrator_config() -> OrchestratorConfig {
    OrchestratorConfig {
        env: Env::Devnet,
        rpc_max_retries: 3,
        rpc_retry_delay_ms: 1,
        confirmation_poll_ms: 1,
        confirmation_timeout_secs: 1,
        retention_cap: MAX_STORED_INTERACTIONS,
        recent_tx_window: MAX_RECENT_TXS,
    }
}

fn token(id: &str, native: EcosystemId, details: &[(EcosystemId, &str, u32)]) -> TokenSpec {
    TokenSpec {
        id: id.to_string(),
        symbol: id.to_uppercase(),
        native_ecosystem: native,
        details: details
            .iter()
            .map(|(eco, address, decimals)| {
                (
                    *eco,
                    TokenDetails {
                        address: address.to_string(),
                        decimals: *decimals,
                    },
                )
            })
            .collect(),
    }
}

fn usdc_spec() -> TokenSpec {
    token(
        "usdc",
        EcosystemId::Ethereum,
        &[
            (EcosystemId::Ethereum, ETH_USDC, 6),
            (EcosystemId::Bsc, BSC_USDC, 18),
            (EcosystemId::Solana, SOL_USDC, 6),
        ],
    )
}

/// USDC: 6 decimals on Ethereum and Solana, 18 on BSC, absent on Karura
pub fn usdc() -> Arc<TokenSpec> {
    Arc::new(usdc_spec())
}

fn pool(id: &str, ecosystem: EcosystemId, address: &str, tokens: [&str; 2], lp: &str) -> PoolSpec {
    PoolSpec {
        id: id.to_string(),
        ecosystem,
        address: address.to_string(),
        token_ids: tokens.iter().map(|t| t.to_string()).collect(),
        lp_token_id: lp.to_string(),
    }
}

pub fn catalog() -> Catalog {
    use EcosystemId::{Bsc, Ethereum, Solana};

    let tokens = vec![
        usdc_spec(),
        token(
            "usdt",
            Ethereum,
            &[(Ethereum, ETH_USDT, 6), (Solana, SOL_USDT, 6), (Bsc, BSC_USDT, 18)],
        ),
        token("dai", Ethereum, &[(Ethereum, ETH_DAI, 18)]),
        token("busd", Bsc, &[(Bsc, BSC_BUSD, 18), (Solana, SOL_BUSD, 8)]),
        token("eth-lp", Ethereum, &[(Ethereum, ETH_LP, 6), (Bsc, BSC_ETH_LP, 6)]),
        token("sol-lp", Solana, &[(Solana, SOL_LP, 6), (Ethereum, ETH_SOL_LP, 6)]),
        token("meta-lp", Solana, &[(Solana, SOL_META_LP, 6)]),
        token("eth-dai-lp", Ethereum, &[(Ethereum, ETH_DAI_LP, 18)]),
    ];

    // Solana pools come first so ties between ecosystems resolve to Solana
    let pools = vec![
        pool("sol-pool", Solana, SOL_POOL, ["usdc", "usdt"], "sol-lp"),
        pool("sol-meta", Solana, SOL_META_POOL, ["sol-lp", "busd"], "meta-lp"),
        pool("eth-pool", Ethereum, ETH_POOL, ["usdc", "usdt"], "eth-lp"),
        pool("eth-dai-pool", Ethereum, ETH_DAI_POOL, ["usdt", "dai"], "eth-dai-lp"),
    ];

    Catalog::new(Env::Devnet, tokens, pools)
}

pub fn amount(catalog: &Catalog, token_id: &str, value: &str) -> Amount {
    let token = catalog.token_by_id(token_id).unwrap();
    Amount::from_human_str(token, value).unwrap()
}

pub fn interaction(params: InteractionParams) -> Interaction {
    Interaction {
        id: INTERACTION_ID.to_string(),
        env: Env::Devnet,
        pool_ids: Vec::new(),
        connected_wallets: BTreeMap::new(),
        submitted_at: Utc::now(),
        params,
    }
}

/// Add 100 USDC and 10 USDT to the Ethereum pool, LP stays on Ethereum
pub fn add_state(catalog: &Catalog) -> InteractionState {
    let params = InteractionParams::Add(AddParams {
        pool_id: "eth-pool".into(),
        input_amounts: vec![amount(catalog, "usdc", "100"), amount(catalog, "usdt", "10")],
        minimum_mint_amount: amount(catalog, "eth-lp", "110"),
        lp_target_ecosystem: EcosystemId::Ethereum,
    });
    InteractionState::plan(catalog, interaction(params)).unwrap()
}

/// Swap 50 USDC on Ethereum for at least 49 BUSD on BSC
pub fn swap_state(catalog: &Catalog) -> InteractionState {
    let params = InteractionParams::Swap(SwapParams {
        from: TokenTransferDetail {
            amount: amount(catalog, "usdc", "50"),
            ecosystem: EcosystemId::Ethereum,
        },
        to: TokenTransferDetail {
            amount: amount(catalog, "busd", "49"),
            ecosystem: EcosystemId::Bsc,
        },
        first_minimum_output: None,
    });
    InteractionState::plan(catalog, interaction(params)).unwrap()
}

pub fn chain_config(ecosystem: EcosystemId) -> ChainConfig {
    let mut config = match ecosystem {
        EcosystemId::Ethereum => {
            let mut config = ChainConfig::new(ecosystem, ETH_CORE_BRIDGE, ETH_TOKEN_BRIDGE);
            config.chain_id = Some(1);
            config
        }
        EcosystemId::Bsc => {
            let mut config = ChainConfig::new(ecosystem, BSC_CORE_BRIDGE, BSC_TOKEN_BRIDGE);
            config.chain_id = Some(56);
            config
        }
        EcosystemId::Solana => {
            let mut config = ChainConfig::new(ecosystem, SOL_CORE_BRIDGE, SOL_TOKEN_BRIDGE);
            config.emitter_address = Some(SOL_EMITTER.to_string());
            config
        }
        other => panic!("no test chain for {}", other),
    };
    config.attestation_retries = Some(3);
    config
}

pub fn register_ledger(registry: &ChainRegistry, ledger: Arc<MockLedger>) {
    registry.register(ledger.config().clone(), ledger.clone());
    registry.connect_wallet(ledger);
}

/// Signed attestation as the mock guardians produce it: a header, the
/// signatures, then the message key
pub fn attestation(chain_id: u16, emitter: [u8; 32], sequence: u64) -> Vec<u8> {
    let mut vaa = vec![1, 0, 0, 0, 0, GUARDIAN_SIGNATURES as u8];
    vaa.extend(std::iter::repeat(0u8).take(GUARDIAN_SIGNATURES * 66));
    vaa.extend_from_slice(&chain_id.to_be_bytes());
    vaa.extend_from_slice(&emitter);
    vaa.extend_from_slice(&sequence.to_be_bytes());
    vaa
}

fn message_key(attestation: &[u8]) -> Option<(u16, [u8; 32], u64)> {
    let tail = attestation.get(attestation.len().checked_sub(42)?..)?;
    let chain_id = u16::from_be_bytes([tail[0], tail[1]]);
    let emitter = <[u8; 32]>::try_from(&tail[2..34]).ok()?;
    let sequence = u64::from_be_bytes(<[u8; 8]>::try_from(&tail[34..]).ok()?);
    Some((chain_id, emitter, sequence))
}

#[derive(Debug, Clone)]
struct PublishedMessage {
    token_id: String,
    source: EcosystemId,
    amount: u128,
}

/// Guardian network over the messages published by mock ledgers
#[derive(Default)]
pub struct MockWormhole {
    messages: Mutex<HashMap<(u16, [u8; 32], u64), PublishedMessage>>,
    missing: AtomicBool,
    polls: AtomicUsize,
    /// While set, each poll waits for a permit before answering
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MockWormhole {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every poll with "not found" while set
    pub fn set_missing(&self, missing: bool) {
        self.missing.store(missing, Ordering::SeqCst);
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    /// Keep polls in flight until `allow_polls` or `open_polls`
    pub fn hold_polls(&self) {
        *self.gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let `count` held polls answer
    pub fn allow_polls(&self, count: usize) {
        if let Some(gate) = self.gate.lock().unwrap().as_ref() {
            gate.add_permits(count);
        }
    }

    /// Answer every held and future poll
    pub fn open_polls(&self) {
        if let Some(gate) = self.gate.lock().unwrap().take() {
            gate.close();
        }
    }

    /// Wait until at least `count` polls were made
    pub async fn wait_for_polls(&self, count: usize) {
        let waiting = async {
            while self.polls() < count {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .expect("guardian was never polled");
    }

    fn publish(&self, chain_id: u16, emitter: [u8; 32], sequence: u64, message: PublishedMessage) {
        self.messages
            .lock()
            .unwrap()
            .insert((chain_id, emitter, sequence), message);
    }

    fn message(&self, chain_id: u16, emitter: [u8; 32], sequence: u64) -> Option<PublishedMessage> {
        self.messages
            .lock()
            .unwrap()
            .get(&(chain_id, emitter, sequence))
            .cloned()
    }
}

#[async_trait]
impl GuardianClient for MockWormhole {
    async fn get_signed_attestation(
        &self,
        chain_id: u16,
        emitter: [u8; 32],
        sequence: u64,
    ) -> Result<Vec<u8>, GuardianError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            // A closed gate lets everything through
            if let Ok(permit) = gate.acquire_owned().await {
                permit.forget();
            }
        }
        if self.missing.load(Ordering::SeqCst) {
            return Err(GuardianError::NotFound);
        }
        self.message(chain_id, emitter, sequence)
            .map(|_| attestation(chain_id, emitter, sequence))
            .ok_or(GuardianError::NotFound)
    }
}

#[derive(Default)]
struct LedgerState {
    /// Transactions signed by the wallet, by serialized form
    signed: HashMap<Vec<u8>, UnsignedTx>,
    /// Confirmed transactions, oldest first
    txs: Vec<Tx>,
    submitted: Vec<UnsignedTx>,
    /// (owner, token) -> atomic balance
    balances: HashMap<(String, String), u128>,
    /// (token, spender) -> atomic allowance of the wallet
    allowances: HashMap<(String, String), u128>,
    /// (owner, mint) -> token account
    token_accounts: HashMap<(String, String), String>,
    fail_after: Option<(usize, String)>,
    fail_pool_tx: bool,
    failing_submits: u32,
    pool_surplus: u128,
    sequence: u64,
}

/// Effects of one transaction under construction
#[derive(Default)]
struct Effects {
    logs: Vec<Log>,
    log_messages: Vec<String>,
    program_ids: Vec<String>,
    account_keys: Vec<String>,
    /// Wallet balance of each touched token before the transaction
    touched: BTreeMap<String, u128>,
}

impl Effects {
    fn invoke(&mut self, program: &str, accounts: &[&str]) {
        if !self.program_ids.iter().any(|p| p == program) {
            self.program_ids.push(program.to_string());
        }
        self.account_keys
            .extend(accounts.iter().map(|a| a.to_string()));
    }

    fn memo(&mut self, text: &str) {
        self.invoke(MEMO_PROGRAM, &[]);
        self.log_messages
            .push(format!("Program log: Memo (len {}): \"{}\"", text.len(), text));
    }
}

fn word(value: u128) -> Vec<u8> {
    let mut word = [0u8; 32];
    U256::from(value).to_big_endian(&mut word);
    word.to_vec()
}

/// In-memory ledger for one ecosystem with a single connected wallet
///
/// Transactions confirm as soon as they are submitted. The wallet is assumed
/// to hold whatever it spends.
pub struct MockLedger {
    ecosystem: EcosystemId,
    config: ChainConfig,
    catalog: Arc<Catalog>,
    wormhole: Option<Arc<MockWormhole>>,
    wallet: String,
    state: Mutex<LedgerState>,
}

impl MockLedger {
    /// A standalone ledger that publishes to no guardian network
    pub fn new(ecosystem: EcosystemId) -> Self {
        Self::build(chain_config(ecosystem), Arc::new(catalog()), None)
    }

    pub fn with_network(
        config: ChainConfig,
        catalog: Arc<Catalog>,
        wormhole: Arc<MockWormhole>,
    ) -> Self {
        Self::build(config, catalog, Some(wormhole))
    }

    fn build(config: ChainConfig, catalog: Arc<Catalog>, wormhole: Option<Arc<MockWormhole>>) -> Self {
        let ecosystem = config.ecosystem;
        let seed = Keccak256::digest(format!("wallet:{}", ecosystem).as_bytes());
        let wallet = match ecosystem.protocol() {
            Protocol::Evm => format!("0x{}", hex::encode(&seed[12..])),
            Protocol::Solana => bs58::encode(seed).into_string(),
        };
        Self {
            ecosystem,
            config,
            catalog,
            wormhole,
            wallet,
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn wallet_address(&self) -> String {
        self.wallet.clone()
    }

    /// Every transaction that reached the chain, failed ones included
    pub fn submitted(&self) -> Vec<UnsignedTx> {
        self.state().submitted.clone()
    }

    pub fn balance_of(&self, owner: &str, token: &str) -> u128 {
        self.state()
            .balances
            .get(&(self.norm(owner), self.norm(token)))
            .copied()
            .unwrap_or(0)
    }

    /// Allowance of the wallet towards this chain's token bridge
    pub fn set_allowance(&self, token: &str, amount: u128) {
        let key = (self.norm(token), self.norm(&self.config.token_bridge));
        self.state().allowances.insert(key, amount);
    }

    /// Let `successes` transactions through, then reject the next one
    pub fn fail_after(&self, successes: usize, reason: &str) {
        self.state().fail_after = Some((successes, reason.to_string()));
    }

    pub fn fail_next_tx(&self, reason: &str) {
        self.fail_after(0, reason);
    }

    /// Reject the next transaction that calls a pool
    pub fn fail_next_pool_tx(&self) {
        self.state().fail_pool_tx = true;
    }

    /// Refuse the next `count` submissions with a transient error
    pub fn fail_submits(&self, count: u32) {
        self.state().failing_submits = count;
    }

    /// Atomic amount paid out on top of every pool minimum
    pub fn set_pool_surplus(&self, surplus: u128) {
        self.state().pool_surplus = surplus;
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap()
    }

    fn is_evm(&self) -> bool {
        self.ecosystem.protocol() == Protocol::Evm
    }

    fn norm(&self, address: &str) -> String {
        if self.is_evm() {
            address.to_lowercase()
        } else {
            address.to_string()
        }
    }

    fn tx_id(&self, index: usize) -> String {
        let hash = Keccak256::digest(format!("{}:{}", self.ecosystem, index).as_bytes());
        match self.ecosystem.protocol() {
            Protocol::Evm => format!("0x{}", hex::encode(hash)),
            Protocol::Solana => bs58::encode(hash).into_string(),
        }
    }

    fn token_address(&self, token_id: &str) -> OrchestratorResult<String> {
        self.catalog
            .token_by_id(token_id)
            .and_then(|t| t.details_on(self.ecosystem).map(|d| d.address.clone()))
            .ok_or_else(|| {
                OrchestratorError::Internal(format!("{} not on {}", token_id, self.ecosystem))
            })
    }

    fn token_at(&self, address: &str) -> OrchestratorResult<Arc<TokenSpec>> {
        TOKEN_IDS
            .iter()
            .filter_map(|id| self.catalog.token_by_id(id))
            .find(|t| {
                t.details_on(self.ecosystem)
                    .is_some_and(|d| self.norm(&d.address) == self.norm(address))
            })
            .ok_or_else(|| OrchestratorError::Internal(format!("unknown token {}", address)))
    }

    fn take_failure(state: &mut LedgerState, unsigned: &UnsignedTx) -> Option<String> {
        if state.fail_pool_tx
            && unsigned
                .instructions
                .iter()
                .any(|ix| matches!(ix, Instruction::Pool(_)))
        {
            state.fail_pool_tx = false;
            return Some("slippage limit exceeded".to_string());
        }
        match state.fail_after.take() {
            Some((0, reason)) => Some(reason),
            Some((remaining, reason)) => {
                state.fail_after = Some((remaining - 1, reason));
                None
            }
            None => None,
        }
    }

    fn log_transfer(&self, effects: &mut Effects, token: &str, from: &str, to: &str, amount: u128) {
        if !self.is_evm() {
            return;
        }
        let (Some(token), Some(from), Some(to)) =
            (parse_evm_address(token), parse_evm_address(from), parse_evm_address(to))
        else {
            return;
        };
        effects.logs.push(Log {
            address: token,
            topics: vec![*TRANSFER_TOPIC, H256::from(from), H256::from(to)],
            data: word(amount).into(),
            ..Default::default()
        });
    }

    fn debit(&self, state: &mut LedgerState, effects: &mut Effects, token: &str, to: &str, amount: u128) {
        let token_key = self.norm(token);
        let balance = state
            .balances
            .entry((self.norm(&self.wallet), token_key.clone()))
            .or_insert(0);
        let pre = effects.touched.entry(token_key).or_insert(*balance);
        if *balance < amount {
            let shortfall = amount - *balance;
            *pre += shortfall;
            *balance = amount;
        }
        *balance -= amount;
        self.log_transfer(effects, token, &self.wallet, to, amount);
    }

    fn credit(&self, state: &mut LedgerState, effects: &mut Effects, token: &str, from: &str, amount: u128) {
        let token_key = self.norm(token);
        let balance = state
            .balances
            .entry((self.norm(&self.wallet), token_key.clone()))
            .or_insert(0);
        effects.touched.entry(token_key).or_insert(*balance);
        *balance += amount;
        self.log_transfer(effects, token, from, &self.wallet, amount);
    }

    fn publish(
        &self,
        effects: &mut Effects,
        sequence: u64,
        token: &TokenSpec,
        amount: u128,
    ) -> OrchestratorResult<()> {
        match self.ecosystem.protocol() {
            Protocol::Evm => {
                let core = parse_evm_address(&self.config.core_bridge).ok_or_else(|| {
                    OrchestratorError::Config(format!("bad core bridge {}", self.config.core_bridge))
                })?;
                effects.logs.push(Log {
                    address: core,
                    topics: vec![event_topic(
                        "LogMessagePublished(address,uint64,uint32,bytes,uint8)",
                    )],
                    data: word(sequence as u128).into(),
                    ..Default::default()
                });
            }
            Protocol::Solana => effects
                .log_messages
                .push(format!("Program log: Sequence: {}", sequence)),
        }

        if let Some(wormhole) = &self.wormhole {
            wormhole.publish(
                self.ecosystem.wormhole_chain_id(),
                self.config.emitter_address()?,
                sequence,
                PublishedMessage {
                    token_id: token.id.clone(),
                    source: self.ecosystem,
                    amount,
                },
            );
        }
        Ok(())
    }

    /// Token and local atomic amount released by an attestation
    fn redeemed(&self, attestation: &[u8]) -> OrchestratorResult<(Arc<TokenSpec>, u128)> {
        let (chain_id, emitter, sequence) = message_key(attestation)
            .ok_or_else(|| OrchestratorError::Internal("malformed attestation".to_string()))?;
        let message = self
            .wormhole
            .as_ref()
            .and_then(|w| w.message(chain_id, emitter, sequence))
            .ok_or_else(|| {
                OrchestratorError::Internal(format!("no message {}/{}", chain_id, sequence))
            })?;
        let token = self
            .catalog
            .token_by_id(&message.token_id)
            .ok_or_else(|| OrchestratorError::Internal(format!("unknown token {}", message.token_id)))?;
        let amount = Amount::from_atomic(token.clone(), message.amount, message.source)?
            .bridgeable(message.source, self.ecosystem)?
            .to_atomic(self.ecosystem)?;
        Ok((token, amount))
    }

    fn pool_effects(
        &self,
        state: &mut LedgerState,
        effects: &mut Effects,
        instruction: &PoolInstruction,
    ) -> OrchestratorResult<()> {
        let spec = self
            .catalog
            .pools()
            .iter()
            .find(|p| p.ecosystem == self.ecosystem && self.norm(&p.address) == self.norm(&instruction.pool))
            .cloned()
            .ok_or_else(|| OrchestratorError::Internal(format!("unknown pool {}", instruction.pool)))?;
        let surplus = state.pool_surplus;
        let tokens = &spec.token_ids;
        let lp = spec.lp_token_id.clone();
        let per_token = |amounts: &[u128], extra: u128| -> Vec<(String, u128)> {
            tokens
                .iter()
                .cloned()
                .zip(amounts.iter().map(|a| if *a > 0 { a + extra } else { 0 }))
                .collect()
        };
        let indexed = |index: u8| tokens.get(index as usize).cloned().unwrap_or_default();

        let (debits, credits) = match &instruction.call {
            PoolCall::Add {
                input_amounts,
                minimum_mint_amount,
            } => (
                per_token(input_amounts, 0),
                vec![(lp, minimum_mint_amount + surplus)],
            ),
            PoolCall::SwapExactInput {
                exact_input_amounts,
                output_token_index,
                minimum_output_amount,
            } => (
                per_token(exact_input_amounts, 0),
                vec![(indexed(*output_token_index), minimum_output_amount + surplus)],
            ),
            PoolCall::RemoveUniform {
                exact_burn_amount,
                minimum_output_amounts,
            } => (
                vec![(lp, *exact_burn_amount)],
                per_token(minimum_output_amounts, surplus),
            ),
            PoolCall::RemoveExactBurn {
                exact_burn_amount,
                output_token_index,
                minimum_output_amount,
            } => (
                vec![(lp, *exact_burn_amount)],
                vec![(indexed(*output_token_index), minimum_output_amount + surplus)],
            ),
            PoolCall::RemoveExactOutput {
                maximum_burn_amount,
                exact_output_amounts,
            } => (
                vec![(lp, *maximum_burn_amount)],
                per_token(exact_output_amounts, 0),
            ),
        };

        for (token_id, amount) in debits.into_iter().filter(|(_, a)| *a > 0) {
            let address = self.token_address(&token_id)?;
            self.debit(state, effects, &address, &instruction.pool, amount);
        }
        for (token_id, amount) in credits.into_iter().filter(|(_, a)| *a > 0) {
            let address = self.token_address(&token_id)?;
            self.credit(state, effects, &address, &instruction.pool, amount);
        }
        Ok(())
    }

    fn apply(&self, state: &mut LedgerState, unsigned: &UnsignedTx) -> OrchestratorResult<Effects> {
        let mut effects = Effects::default();

        for ix in &unsigned.instructions {
            match ix {
                Instruction::CreateTokenAccount { mint } => {
                    let seed = Keccak256::digest(format!("{}:{}", self.wallet, mint).as_bytes());
                    let account = bs58::encode(seed).into_string();
                    effects.invoke(ASSOCIATED_TOKEN_PROGRAM, &[account.as_str()]);
                    state
                        .token_accounts
                        .insert((self.wallet.clone(), mint.clone()), account);
                }
                Instruction::Approve {
                    token,
                    spender,
                    amount,
                } => {
                    effects.invoke(TOKEN_PROGRAM, &[token.as_str()]);
                    state
                        .allowances
                        .insert((self.norm(token), self.norm(spender)), *amount);
                }
                Instruction::BridgeLock {
                    token_bridge,
                    token,
                    amount,
                    ..
                } => {
                    effects.invoke(token_bridge, &[]);
                    effects.invoke(&self.config.core_bridge, &[]);
                    let spec = self.token_at(token)?;
                    let receiver = if spec.is_native_on(self.ecosystem) {
                        token_bridge.as_str()
                    } else {
                        ZERO_ADDRESS
                    };
                    self.debit(state, &mut effects, token, receiver, *amount);
                    state.sequence += 1;
                    self.publish(&mut effects, state.sequence, &spec, *amount)?;
                }
                Instruction::VerifySignatures {
                    core_bridge,
                    signature_set,
                    ..
                }
                | Instruction::PostAttestation {
                    core_bridge,
                    signature_set,
                    ..
                } => effects.invoke(core_bridge, &[signature_set.as_str()]),
                Instruction::BridgeRedeem {
                    token_bridge,
                    attestation,
                } => {
                    effects.invoke(token_bridge, &[]);
                    let (spec, amount) = self.redeemed(attestation)?;
                    let address = self.token_address(&spec.id)?;
                    let sender = if spec.is_native_on(self.ecosystem) {
                        token_bridge.as_str()
                    } else {
                        ZERO_ADDRESS
                    };
                    self.credit(state, &mut effects, &address, sender, amount);
                }
                Instruction::Pool(pool) => {
                    effects.invoke(&pool.pool, &[]);
                    self.pool_effects(state, &mut effects, pool)?;
                }
                Instruction::Memo { text } => effects.memo(text),
            }
        }

        Ok(effects)
    }

    /// What a rejected transaction leaves on chain: its calls, no effects
    fn rejected(&self, unsigned: &UnsignedTx) -> Effects {
        let mut effects = Effects::default();
        for ix in &unsigned.instructions {
            match ix {
                Instruction::Memo { text } => effects.memo(text),
                other => {
                    if let Some(target) = target(other) {
                        effects.invoke(target, &[]);
                    }
                }
            }
        }
        effects
    }

    fn confirmed(
        &self,
        id: String,
        unsigned: &UnsignedTx,
        effects: Effects,
        state: &LedgerState,
        error: Option<String>,
    ) -> Tx {
        let payload = match self.ecosystem.protocol() {
            Protocol::Evm => {
                let mut input = Keccak256::digest(
                    serde_json::to_vec(&unsigned.instructions).unwrap_or_default(),
                )[..4]
                    .to_vec();
                input.extend(hex::decode(&unsigned.interaction_id).unwrap_or_default());
                TxPayload::Evm(EvmTx {
                    from: parse_evm_address(&self.wallet).unwrap_or_default(),
                    to: unsigned
                        .instructions
                        .iter()
                        .find_map(target)
                        .and_then(parse_evm_address),
                    input: input.into(),
                    succeeded: error.is_none(),
                    logs: effects.logs,
                })
            }
            Protocol::Solana => TxPayload::Solana(SolanaTx {
                signer: self.wallet.clone(),
                program_ids: effects.program_ids,
                account_keys: effects.account_keys,
                log_messages: effects.log_messages,
                token_balances: effects
                    .touched
                    .into_iter()
                    .map(|(mint, pre)| TokenBalanceChange {
                        owner: self.wallet.clone(),
                        post: state
                            .balances
                            .get(&(self.wallet.clone(), mint.clone()))
                            .copied()
                            .unwrap_or(0),
                        mint,
                        pre,
                    })
                    .collect(),
                error,
            }),
        };

        Tx {
            id,
            ecosystem: self.ecosystem,
            timestamp: Some(Utc::now()),
            payload,
        }
    }
}

/// Contract or program an instruction calls
fn target(ix: &Instruction) -> Option<&str> {
    match ix {
        Instruction::Approve { token, .. } => Some(token.as_str()),
        Instruction::BridgeLock { token_bridge, .. }
        | Instruction::BridgeRedeem { token_bridge, .. } => Some(token_bridge.as_str()),
        Instruction::VerifySignatures { core_bridge, .. }
        | Instruction::PostAttestation { core_bridge, .. } => Some(core_bridge.as_str()),
        Instruction::Pool(pool) => Some(pool.pool.as_str()),
        Instruction::CreateTokenAccount { .. } => Some(ASSOCIATED_TOKEN_PROGRAM),
        Instruction::Memo { .. } => None,
    }
}

#[async_trait]
impl ChainClient for MockLedger {
    fn ecosystem(&self) -> EcosystemId {
        self.ecosystem
    }

    async fn submit(&self, tx: SignedTx) -> OrchestratorResult<String> {
        let mut state = self.state();
        if state.failing_submits > 0 {
            state.failing_submits -= 1;
            return Err(OrchestratorError::rpc(self.ecosystem, "connection reset"));
        }

        let unsigned = state
            .signed
            .get(&tx.bytes)
            .cloned()
            .ok_or_else(|| OrchestratorError::Internal("tx was not signed by this wallet".into()))?;
        let id = self.tx_id(state.txs.len());

        let confirmed = match Self::take_failure(&mut state, &unsigned) {
            Some(reason) => {
                let effects = self.rejected(&unsigned);
                self.confirmed(id.clone(), &unsigned, effects, &state, Some(reason))
            }
            None => {
                let effects = self.apply(&mut state, &unsigned)?;
                self.confirmed(id.clone(), &unsigned, effects, &state, None)
            }
        };

        state.submitted.push(unsigned);
        state.txs.push(confirmed);
        Ok(id)
    }

    async fn get_tx(&self, tx_id: &str) -> OrchestratorResult<TxStatus> {
        self.state()
            .txs
            .iter()
            .find(|tx| tx.id == tx_id)
            .cloned()
            .map(TxStatus::Confirmed)
            .ok_or_else(|| OrchestratorError::Internal(format!("unknown tx {}", tx_id)))
    }

    async fn get_balance(&self, owner: &str, token: &str) -> OrchestratorResult<u128> {
        Ok(self.balance_of(owner, token))
    }

    async fn get_allowance(
        &self,
        _owner: &str,
        token: &str,
        spender: &str,
    ) -> OrchestratorResult<u128> {
        Ok(self
            .state()
            .allowances
            .get(&(self.norm(token), self.norm(spender)))
            .copied()
            .unwrap_or(0))
    }

    async fn find_token_account(
        &self,
        owner: &str,
        mint: &str,
    ) -> OrchestratorResult<Option<String>> {
        Ok(self
            .state()
            .token_accounts
            .get(&(owner.to_string(), mint.to_string()))
            .cloned())
    }

    async fn recent_txs(&self, address: &str, limit: usize) -> OrchestratorResult<Vec<Tx>> {
        if self.norm(address) != self.norm(&self.wallet) {
            return Ok(Vec::new());
        }
        Ok(self.state().txs.iter().rev().take(limit).cloned().collect())
    }
}

#[async_trait]
impl WalletSigner for MockLedger {
    fn ecosystem(&self) -> EcosystemId {
        self.ecosystem
    }

    fn address(&self) -> String {
        self.wallet.clone()
    }

    async fn sign(&self, tx: UnsignedTx) -> OrchestratorResult<SignedTx> {
        let bytes = serde_json::to_vec(&tx)?;
        self.state().signed.insert(bytes.clone(), tx);
        Ok(SignedTx {
            ecosystem: self.ecosystem,
            bytes,
        })
    }
}

/// Ethereum, BSC and Solana ledgers sharing one guardian network
pub struct TestEnv {
    pub catalog: Arc<Catalog>,
    pub registry: Arc<ChainRegistry>,
    pub guardian: Arc<MockWormhole>,
    pub ethereum: Arc<MockLedger>,
    pub bsc: Arc<MockLedger>,
    pub solana: Arc<MockLedger>,
    pub bridge: Arc<BridgeAdapter>,
    pub store: Arc<InMemoryStore>,
}

impl TestEnv {
    pub fn new() -> Self {
        let catalog = Arc::new(catalog());
        let guardian = Arc::new(MockWormhole::new());
        let registry = Arc::new(ChainRegistry::new());

        let ledger = |ecosystem: EcosystemId| {
            let ledger = Arc::new(MockLedger::with_network(
                chain_config(ecosystem),
                catalog.clone(),
                guardian.clone(),
            ));
            register_ledger(&registry, ledger.clone());
            ledger
        };
        let ethereum = ledger(EcosystemId::Ethereum);
        let bsc = ledger(EcosystemId::Bsc);
        let solana = ledger(EcosystemId::Solana);

        let bridge = Arc::new(BridgeAdapter::new(guardian.clone(), Duration::from_millis(1)));

        Self {
            catalog,
            registry,
            guardian,
            ethereum,
            bsc,
            solana,
            bridge,
            store: Arc::new(InMemoryStore::new()),
        }
    }

    /// Runner for `INTERACTION_ID` over every ledger
    pub fn runner(&self) -> TxRunner {
        TxRunner::new(
            self.registry.clone(),
            fast_policy(),
            INTERACTION_ID,
            MAX_RECENT_TXS,
            Arc::new(AtomicBool::new(false)),
        )
    }

    /// A fresh orchestrator over the shared store, as after a restart
    pub fn orchestrator(&self) -> Orchestrator {
        let history = History::new(self.store.clone(), MAX_STORED_INTERACTIONS);
        Orchestrator::new(
            self.catalog.clone(),
            self.registry.clone(),
            self.bridge.clone(),
            Arc::new(history),
            &orchestrator_config(),
        )
    }
}
