//! Transaction model shared by every ecosystem
//!
//! `UnsignedTx` is what the orchestrator asks a wallet to sign: an ordered
//! instruction list tagged with the interaction id. `Tx` is what a chain
//! client reports back once a transaction is confirmed.

use crate::catalog::EcosystemId;
use crate::pool::PoolInstruction;

use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, Log, H256, U256};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::str::FromStr;

/// Length of a rendered interaction id
pub const INTERACTION_ID_HEX_LEN: usize = 32;

lazy_static! {
    static ref MEMO_LOG: Regex =
        Regex::new(r#"^Program log: Memo \(len 32\): "([0-9a-f]{32})"$"#).unwrap();
    /// Topic of the ERC20 `Transfer` event
    pub static ref TRANSFER_TOPIC: H256 = event_topic("Transfer(address,address,uint256)");
}

/// Keccak hash of an event signature
pub fn event_topic(signature: &str) -> H256 {
    H256::from_slice(&Keccak256::digest(signature.as_bytes()))
}

/// Confirmed transaction
#[derive(Debug, Clone, PartialEq)]
pub struct Tx {
    pub id: String,
    pub ecosystem: EcosystemId,
    pub timestamp: Option<DateTime<Utc>>,
    pub payload: TxPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TxPayload {
    Evm(EvmTx),
    Solana(SolanaTx),
}

/// EVM transaction with its receipt
#[derive(Debug, Clone, PartialEq)]
pub struct EvmTx {
    pub from: Address,
    pub to: Option<Address>,
    pub input: Bytes,
    pub succeeded: bool,
    pub logs: Vec<Log>,
}

/// Parsed Solana transaction
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SolanaTx {
    pub signer: String,
    pub program_ids: Vec<String>,
    pub account_keys: Vec<String>,
    pub log_messages: Vec<String>,
    pub token_balances: Vec<TokenBalanceChange>,
    pub error: Option<String>,
}

/// Token balance of one account before and after a Solana transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBalanceChange {
    pub owner: String,
    pub mint: String,
    pub pre: u128,
    pub post: u128,
}

/// ERC20 transfer decoded from a receipt log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Erc20Transfer {
    pub token: Address,
    pub from: Address,
    pub to: Address,
    pub value: U256,
}

impl Tx {
    pub fn succeeded(&self) -> bool {
        match &self.payload {
            TxPayload::Evm(tx) => tx.succeeded,
            TxPayload::Solana(tx) => tx.error.is_none(),
        }
    }

    /// Reason reported for a failed transaction
    pub fn failure_reason(&self) -> String {
        match &self.payload {
            TxPayload::Evm(_) => "execution reverted".to_string(),
            TxPayload::Solana(tx) => tx
                .error
                .clone()
                .unwrap_or_else(|| "transaction failed".to_string()),
        }
    }

    /// Interaction id carried by the transaction, if any
    ///
    /// EVM calldata ends with the 16 id bytes; Solana transactions carry a
    /// memo instruction whose log line holds the hex id.
    pub fn interaction_id(&self) -> Option<String> {
        match &self.payload {
            TxPayload::Evm(tx) => {
                let input = hex::encode(&tx.input);
                if input.len() < INTERACTION_ID_HEX_LEN {
                    return None;
                }
                Some(input[input.len() - INTERACTION_ID_HEX_LEN..].to_string())
            }
            TxPayload::Solana(tx) => tx
                .log_messages
                .iter()
                .find_map(|line| MEMO_LOG.captures(line).map(|c| c[1].to_string())),
        }
    }

    /// Whether the transaction calls the given contract or program
    pub fn invokes(&self, address: &str) -> bool {
        match &self.payload {
            TxPayload::Evm(tx) => match (tx.to, parse_evm_address(address)) {
                (Some(to), Some(address)) => to == address,
                _ => false,
            },
            TxPayload::Solana(tx) => tx.program_ids.iter().any(|p| p == address),
        }
    }

    /// Whether the transaction references an account (Solana only)
    pub fn references_account(&self, account: &str) -> bool {
        match &self.payload {
            TxPayload::Evm(_) => false,
            TxPayload::Solana(tx) => tx.account_keys.iter().any(|k| k == account),
        }
    }

    pub fn logs(&self) -> &[Log] {
        match &self.payload {
            TxPayload::Evm(tx) => &tx.logs,
            TxPayload::Solana(_) => &[],
        }
    }

    pub fn log_messages(&self) -> &[String] {
        match &self.payload {
            TxPayload::Evm(_) => &[],
            TxPayload::Solana(tx) => &tx.log_messages,
        }
    }

    /// ERC20 transfers emitted by the transaction
    pub fn erc20_transfers(&self) -> Vec<Erc20Transfer> {
        self.logs()
            .iter()
            .filter(|log| log.topics.len() == 3 && log.topics[0] == *TRANSFER_TOPIC)
            .map(|log| Erc20Transfer {
                token: log.address,
                from: Address::from(log.topics[1]),
                to: Address::from(log.topics[2]),
                value: U256::from_big_endian(&log.data),
            })
            .collect()
    }

    /// Net change of `owner`'s balance of `token` caused by this transaction
    pub fn token_delta(&self, owner: &str, token: &str) -> i128 {
        match &self.payload {
            TxPayload::Evm(_) => {
                let (Some(owner), Some(token)) = (parse_evm_address(owner), parse_evm_address(token))
                else {
                    return 0;
                };
                self.erc20_transfers()
                    .into_iter()
                    .filter(|t| t.token == token)
                    .fold(0i128, |delta, t| {
                        let value = if t.value > U256::from(i128::MAX as u128) {
                            i128::MAX
                        } else {
                            t.value.low_u128() as i128
                        };
                        let mut delta = delta;
                        if t.to == owner {
                            delta = delta.saturating_add(value);
                        }
                        if t.from == owner {
                            delta = delta.saturating_sub(value);
                        }
                        delta
                    })
            }
            TxPayload::Solana(tx) => tx
                .token_balances
                .iter()
                .filter(|b| b.owner == owner && b.mint == token)
                .map(|b| b.post as i128 - b.pre as i128)
                .sum(),
        }
    }
}

/// Parse a hex EVM address, case-insensitively
pub fn parse_evm_address(address: &str) -> Option<Address> {
    Address::from_str(address).ok()
}

/// Status of a submitted transaction
#[derive(Debug, Clone, PartialEq)]
pub enum TxStatus {
    Pending,
    Confirmed(Tx),
}

/// Instructions handed to a wallet for signing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsignedTx {
    pub ecosystem: EcosystemId,
    pub interaction_id: String,
    pub instructions: Vec<Instruction>,
}

/// Signed, serialized transaction ready for submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTx {
    pub ecosystem: EcosystemId,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Instruction {
    /// Create the owner's associated token account for `mint`
    CreateTokenAccount { mint: String },
    Approve {
        token: String,
        spender: String,
        amount: u128,
    },
    /// Lock or burn tokens at the token bridge for the guardian network
    BridgeLock {
        token_bridge: String,
        token: String,
        amount: u128,
        target_chain: u16,
        #[serde(with = "hex_bytes32")]
        recipient: [u8; 32],
        nonce: u32,
    },
    /// Verify a batch of guardian signatures into the signature set account
    VerifySignatures {
        core_bridge: String,
        signature_set: String,
        #[serde(with = "hex_vec")]
        attestation: Vec<u8>,
        signature_indices: Vec<u8>,
    },
    /// Post a verified attestation to the core bridge
    PostAttestation {
        core_bridge: String,
        signature_set: String,
        #[serde(with = "hex_vec")]
        attestation: Vec<u8>,
    },
    /// Redeem a transfer with its signed attestation
    BridgeRedeem {
        token_bridge: String,
        #[serde(with = "hex_vec")]
        attestation: Vec<u8>,
    },
    Pool(PoolInstruction),
    Memo { text: String },
}

mod hex_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

mod hex_bytes32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        <[u8; 32]>::try_from(bytes.as_slice()).map_err(serde::de::Error::custom)
    }
}
