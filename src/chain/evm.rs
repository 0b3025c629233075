//! EVM ledger access with multi-RPC failover, and a local-key wallet

use super::tx::{parse_evm_address, EvmTx, Instruction, SignedTx, Tx, TxPayload, TxStatus, UnsignedTx};
use super::{ChainClient, WalletSigner};
use crate::catalog::EcosystemId;
use crate::config::ChainConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::pool::PoolCall;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use ethers::abi::{encode, Token};
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use sha3::{Digest, Keccak256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Blocks scanned backwards when listing a wallet's recent transactions
const RECENT_BLOCK_LOOKBACK: u64 = 512;

/// Buffer added to estimated gas limits, in percent
const GAS_LIMIT_BUFFER_PERCENT: u64 = 20;

/// Multi-provider EVM client with automatic failover
pub struct EvmRpcClient {
    /// Chain configuration
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl EvmRpcClient {
    pub async fn new(config: ChainConfig) -> OrchestratorResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for {}: {}", config.ecosystem, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(OrchestratorError::Config(format!(
                "no valid RPC providers for {}",
                config.ecosystem
            )));
        }

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("{} failover to provider {}", self.config.ecosystem, next);
    }

    pub fn chain_id(&self) -> Option<u64> {
        self.config.chain_id
    }

    fn rpc_error(&self, e: impl std::fmt::Display) -> OrchestratorError {
        self.failover();
        OrchestratorError::rpc(self.config.ecosystem, e)
    }

    async fn call_u256(&self, to: Address, data: Vec<u8>) -> OrchestratorResult<U256> {
        let request: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        let output = self
            .http()
            .call(&request, None)
            .await
            .map_err(|e| self.rpc_error(e))?;
        if output.len() < 32 {
            return Err(OrchestratorError::rpc(
                self.config.ecosystem,
                format!("short eth_call result from {:?}", to),
            ));
        }
        Ok(U256::from_big_endian(&output[..32]))
    }

    async fn confirmed_tx(&self, hash: H256) -> OrchestratorResult<Option<Tx>> {
        let Some(receipt) = self
            .http()
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| self.rpc_error(e))?
        else {
            return Ok(None);
        };

        let transaction = self
            .http()
            .get_transaction(hash)
            .await
            .map_err(|e| self.rpc_error(e))?
            .ok_or_else(|| {
                OrchestratorError::rpc(self.config.ecosystem, format!("tx {:?} vanished", hash))
            })?;

        let timestamp = match receipt.block_number {
            Some(number) => self
                .http()
                .get_block(number)
                .await
                .map_err(|e| self.rpc_error(e))?
                .and_then(|block| Utc.timestamp_opt(block.timestamp.as_u64() as i64, 0).single()),
            None => None,
        };

        Ok(Some(Tx {
            id: format!("{:?}", hash),
            ecosystem: self.config.ecosystem,
            timestamp,
            payload: TxPayload::Evm(EvmTx {
                from: transaction.from,
                to: transaction.to,
                input: transaction.input,
                succeeded: receipt.status == Some(U64::from(1)),
                logs: receipt.logs,
            }),
        }))
    }
}

fn parse_address(address: &str) -> OrchestratorResult<Address> {
    parse_evm_address(address)
        .ok_or_else(|| OrchestratorError::Internal(format!("invalid EVM address {}", address)))
}

fn parse_hash(tx_id: &str) -> OrchestratorResult<H256> {
    tx_id
        .parse::<H256>()
        .map_err(|e| OrchestratorError::Internal(format!("invalid tx hash {}: {}", tx_id, e)))
}

fn saturating_u128(value: U256) -> u128 {
    if value > U256::from(u128::MAX) {
        u128::MAX
    } else {
        value.low_u128()
    }
}

#[async_trait]
impl ChainClient for EvmRpcClient {
    fn ecosystem(&self) -> EcosystemId {
        self.config.ecosystem
    }

    async fn submit(&self, tx: SignedTx) -> OrchestratorResult<String> {
        let pending = self
            .http()
            .send_raw_transaction(Bytes::from(tx.bytes))
            .await
            .map_err(|e| {
                let message = e.to_string();
                if message.contains("insufficient funds") || message.contains("nonce too low") {
                    OrchestratorError::OnChainRejected {
                        ecosystem: self.config.ecosystem.to_string(),
                        tx_id: String::new(),
                        reason: message,
                    }
                } else {
                    self.rpc_error(message)
                }
            })?;
        Ok(format!("{:?}", pending.tx_hash()))
    }

    async fn get_tx(&self, tx_id: &str) -> OrchestratorResult<TxStatus> {
        let hash = parse_hash(tx_id)?;
        Ok(match self.confirmed_tx(hash).await? {
            Some(tx) => TxStatus::Confirmed(tx),
            None => TxStatus::Pending,
        })
    }

    async fn get_balance(&self, owner: &str, token: &str) -> OrchestratorResult<u128> {
        let data = encode_call(
            "balanceOf(address)",
            &[Token::Address(parse_address(owner)?)],
        );
        Ok(saturating_u128(self.call_u256(parse_address(token)?, data).await?))
    }

    async fn get_allowance(
        &self,
        owner: &str,
        token: &str,
        spender: &str,
    ) -> OrchestratorResult<u128> {
        let data = encode_call(
            "allowance(address,address)",
            &[
                Token::Address(parse_address(owner)?),
                Token::Address(parse_address(spender)?),
            ],
        );
        Ok(saturating_u128(self.call_u256(parse_address(token)?, data).await?))
    }

    async fn find_token_account(
        &self,
        _owner: &str,
        _mint: &str,
    ) -> OrchestratorResult<Option<String>> {
        Ok(None)
    }

    async fn recent_txs(&self, address: &str, limit: usize) -> OrchestratorResult<Vec<Tx>> {
        let address = parse_address(address)?;
        let latest = self
            .http()
            .get_block_number()
            .await
            .map_err(|e| self.rpc_error(e))?
            .as_u64();

        let mut txs = Vec::new();
        let earliest = latest.saturating_sub(RECENT_BLOCK_LOOKBACK);
        let mut number = latest;

        while number > earliest && txs.len() < limit {
            let block = self
                .http()
                .get_block_with_txs(number)
                .await
                .map_err(|e| self.rpc_error(e))?;

            if let Some(block) = block {
                for transaction in block.transactions.iter().rev() {
                    if transaction.from != address || txs.len() >= limit {
                        continue;
                    }
                    if let Some(tx) = self.confirmed_tx(transaction.hash).await? {
                        txs.push(tx);
                    }
                }
            }
            number -= 1;
        }

        Ok(txs)
    }

    async fn health_check(&self) -> bool {
        match self.http().get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for {}: {}", self.config.ecosystem, e);
                self.failover();
                false
            }
        }
    }
}

/// Four-byte function selector
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = Keccak256::digest(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

fn encode_call(signature: &str, args: &[Token]) -> Vec<u8> {
    let mut data = selector(signature).to_vec();
    data.extend(encode(args));
    data
}

fn amounts(values: &[u128]) -> Token {
    Token::Array(values.iter().map(|v| Token::Uint(U256::from(*v))).collect())
}

/// Target contract and calldata for one instruction
pub fn encode_instruction(instruction: &Instruction) -> OrchestratorResult<(Address, Vec<u8>)> {
    match instruction {
        Instruction::Approve {
            token,
            spender,
            amount,
        } => Ok((
            parse_address(token)?,
            encode_call(
                "approve(address,uint256)",
                &[Token::Address(parse_address(spender)?), Token::Uint(U256::from(*amount))],
            ),
        )),
        Instruction::BridgeLock {
            token_bridge,
            token,
            amount,
            target_chain,
            recipient,
            nonce,
        } => Ok((
            parse_address(token_bridge)?,
            encode_call(
                "transferTokens(address,uint256,uint16,bytes32,uint256,uint32)",
                &[
                    Token::Address(parse_address(token)?),
                    Token::Uint(U256::from(*amount)),
                    Token::Uint(U256::from(*target_chain)),
                    Token::FixedBytes(recipient.to_vec()),
                    Token::Uint(U256::zero()),
                    Token::Uint(U256::from(*nonce)),
                ],
            ),
        )),
        Instruction::BridgeRedeem {
            token_bridge,
            attestation,
        } => Ok((
            parse_address(token_bridge)?,
            encode_call("completeTransfer(bytes)", &[Token::Bytes(attestation.clone())]),
        )),
        Instruction::Pool(pool) => {
            let data = match &pool.call {
                PoolCall::Add {
                    input_amounts,
                    minimum_mint_amount,
                } => encode_call(
                    "add(uint256[],uint256)",
                    &[amounts(input_amounts), Token::Uint(U256::from(*minimum_mint_amount))],
                ),
                PoolCall::SwapExactInput {
                    exact_input_amounts,
                    output_token_index,
                    minimum_output_amount,
                } => encode_call(
                    "swapExactInput(uint256[],uint8,uint256)",
                    &[
                        amounts(exact_input_amounts),
                        Token::Uint(U256::from(*output_token_index)),
                        Token::Uint(U256::from(*minimum_output_amount)),
                    ],
                ),
                PoolCall::RemoveUniform {
                    exact_burn_amount,
                    minimum_output_amounts,
                } => encode_call(
                    "removeUniform(uint256,uint256[])",
                    &[Token::Uint(U256::from(*exact_burn_amount)), amounts(minimum_output_amounts)],
                ),
                PoolCall::RemoveExactBurn {
                    exact_burn_amount,
                    output_token_index,
                    minimum_output_amount,
                } => encode_call(
                    "removeExactBurn(uint256,uint8,uint256)",
                    &[
                        Token::Uint(U256::from(*exact_burn_amount)),
                        Token::Uint(U256::from(*output_token_index)),
                        Token::Uint(U256::from(*minimum_output_amount)),
                    ],
                ),
                PoolCall::RemoveExactOutput {
                    maximum_burn_amount,
                    exact_output_amounts,
                } => encode_call(
                    "removeExactOutput(uint256,uint256[])",
                    &[Token::Uint(U256::from(*maximum_burn_amount)), amounts(exact_output_amounts)],
                ),
            };
            Ok((parse_address(&pool.pool)?, data))
        }
        other => Err(OrchestratorError::Internal(format!(
            "instruction {:?} is not supported on EVM chains",
            other
        ))),
    }
}

/// Local private-key signer for one EVM chain
pub struct EvmWallet {
    wallet: LocalWallet,
    client: Arc<EvmRpcClient>,
}

impl EvmWallet {
    pub fn new(private_key: &str, client: Arc<EvmRpcClient>) -> OrchestratorResult<Self> {
        let ecosystem = client.ecosystem();
        let chain_id = client
            .chain_id()
            .ok_or_else(|| OrchestratorError::wallet(ecosystem, "no chain id configured"))?;
        let wallet = private_key
            .parse::<LocalWallet>()
            .map_err(|e| OrchestratorError::wallet(ecosystem, format!("invalid private key: {}", e)))?
            .with_chain_id(chain_id);
        Ok(Self { wallet, client })
    }

    /// Load the key from an environment variable
    pub fn from_env(var: &str, client: Arc<EvmRpcClient>) -> OrchestratorResult<Self> {
        let key = std::env::var(var)
            .map_err(|_| OrchestratorError::wallet(client.ecosystem(), format!("{} is not set", var)))?;
        Self::new(&key, client)
    }
}

#[async_trait]
impl WalletSigner for EvmWallet {
    fn ecosystem(&self) -> EcosystemId {
        self.client.ecosystem()
    }

    fn address(&self) -> String {
        format!("{:?}", self.wallet.address())
    }

    async fn sign(&self, tx: UnsignedTx) -> OrchestratorResult<SignedTx> {
        let mut calls = tx
            .instructions
            .iter()
            .filter(|ix| !matches!(ix, Instruction::Memo { .. }));
        let (Some(instruction), None) = (calls.next(), calls.next()) else {
            return Err(OrchestratorError::Internal(
                "EVM transactions carry exactly one call".to_string(),
            ));
        };

        let (to, mut data) = encode_instruction(instruction)?;
        let id = hex::decode(&tx.interaction_id).map_err(|e| {
            OrchestratorError::Internal(format!("invalid interaction id {}: {}", tx.interaction_id, e))
        })?;
        data.extend_from_slice(&id);

        let from = self.wallet.address();
        let provider = self.client.http();
        let nonce = provider
            .get_transaction_count(from, Some(BlockNumber::Pending.into()))
            .await
            .map_err(|e| self.client.rpc_error(e))?;
        let gas_price = provider
            .get_gas_price()
            .await
            .map_err(|e| self.client.rpc_error(e))?;

        let mut request: TypedTransaction = TransactionRequest::new()
            .from(from)
            .to(to)
            .data(data)
            .nonce(nonce)
            .gas_price(gas_price)
            .chain_id(self.wallet.chain_id())
            .into();

        let estimated = provider
            .estimate_gas(&request, None)
            .await
            .map_err(|e| self.client.rpc_error(e))?;
        request.set_gas(estimated + estimated * GAS_LIMIT_BUFFER_PERCENT / 100);

        let signature = self
            .wallet
            .sign_transaction(&request)
            .await
            .map_err(|e| OrchestratorError::wallet(self.ecosystem(), e))?;

        Ok(SignedTx {
            ecosystem: self.ecosystem(),
            bytes: request.rlp_signed(&signature).to_vec(),
        })
    }
}
