//! Token and pool catalog
//!
//! The catalog is static configuration loaded by the caller at startup. The
//! orchestrator only reads it: token lookups re-hydrate persisted amounts and
//! pool lookups drive routing and instruction building.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Supported ecosystems
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EcosystemId {
    Solana,
    Ethereum,
    Bsc,
    Avalanche,
    Polygon,
    Aurora,
    Fantom,
    Karura,
    Acala,
}

/// Ledger model of an ecosystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Account model with ERC20 allowances; redeems take the attestation directly
    Evm,
    /// Token accounts; redeems need the attestation signatures staged first
    Solana,
}

impl EcosystemId {
    pub fn protocol(&self) -> Protocol {
        match self {
            EcosystemId::Solana => Protocol::Solana,
            _ => Protocol::Evm,
        }
    }

    /// Wormhole chain id of the ecosystem
    pub fn wormhole_chain_id(&self) -> u16 {
        match self {
            EcosystemId::Solana => 1,
            EcosystemId::Ethereum => 2,
            EcosystemId::Bsc => 4,
            EcosystemId::Polygon => 5,
            EcosystemId::Avalanche => 6,
            EcosystemId::Aurora => 9,
            EcosystemId::Fantom => 10,
            EcosystemId::Karura => 11,
            EcosystemId::Acala => 12,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EcosystemId::Solana => "solana",
            EcosystemId::Ethereum => "ethereum",
            EcosystemId::Bsc => "bsc",
            EcosystemId::Avalanche => "avalanche",
            EcosystemId::Polygon => "polygon",
            EcosystemId::Aurora => "aurora",
            EcosystemId::Fantom => "fantom",
            EcosystemId::Karura => "karura",
            EcosystemId::Acala => "acala",
        }
    }
}

impl fmt::Display for EcosystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EcosystemId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_ECOSYSTEMS
            .iter()
            .find(|e| e.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown ecosystem {:?}", s))
    }
}

pub const ALL_ECOSYSTEMS: [EcosystemId; 9] = [
    EcosystemId::Solana,
    EcosystemId::Ethereum,
    EcosystemId::Bsc,
    EcosystemId::Avalanche,
    EcosystemId::Polygon,
    EcosystemId::Aurora,
    EcosystemId::Fantom,
    EcosystemId::Karura,
    EcosystemId::Acala,
];

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Env {
    Mainnet,
    Devnet,
    Local,
    Custom,
}

impl Env {
    pub fn as_str(&self) -> &'static str {
        match self {
            Env::Mainnet => "mainnet",
            Env::Devnet => "devnet",
            Env::Local => "local",
            Env::Custom => "custom",
        }
    }
}

impl FromStr for Env {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" => Ok(Env::Mainnet),
            "devnet" => Ok(Env::Devnet),
            "local" => Ok(Env::Local),
            "custom" => Ok(Env::Custom),
            _ => Err(format!("unknown environment {:?}", s)),
        }
    }
}

/// Per-ecosystem representation of a token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenDetails {
    /// Contract address (EVM) or mint address (Solana)
    pub address: String,
    pub decimals: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSpec {
    pub id: String,
    pub symbol: String,
    /// Ecosystem where the token is native; everywhere else it is wrapped
    pub native_ecosystem: EcosystemId,
    pub details: BTreeMap<EcosystemId, TokenDetails>,
}

impl TokenSpec {
    pub fn details_on(&self, ecosystem: EcosystemId) -> Option<&TokenDetails> {
        self.details.get(&ecosystem)
    }

    pub fn native_details(&self) -> Option<&TokenDetails> {
        self.details_on(self.native_ecosystem)
    }

    pub fn is_native_on(&self, ecosystem: EcosystemId) -> bool {
        self.native_ecosystem == ecosystem
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSpec {
    pub id: String,
    pub ecosystem: EcosystemId,
    /// Pool program id (Solana) or contract address (EVM)
    pub address: String,
    /// Member tokens, in on-chain index order
    pub token_ids: Vec<String>,
    pub lp_token_id: String,
}

impl PoolSpec {
    pub fn contains_token(&self, token_id: &str) -> bool {
        self.token_ids.iter().any(|t| t == token_id)
    }

    pub fn token_index(&self, token_id: &str) -> Option<usize> {
        self.token_ids.iter().position(|t| t == token_id)
    }
}

/// Tokens and pools of one environment
#[derive(Debug, Clone)]
pub struct Catalog {
    env: Env,
    tokens: Vec<Arc<TokenSpec>>,
    pools: Vec<PoolSpec>,
}

impl Catalog {
    pub fn new(env: Env, tokens: Vec<TokenSpec>, pools: Vec<PoolSpec>) -> Self {
        Self {
            env,
            tokens: tokens.into_iter().map(Arc::new).collect(),
            pools,
        }
    }

    pub fn env(&self) -> Env {
        self.env
    }

    pub fn token_by_id(&self, id: &str) -> Option<Arc<TokenSpec>> {
        self.tokens.iter().find(|t| t.id == id).cloned()
    }

    pub fn pool_by_id(&self, id: &str) -> Option<&PoolSpec> {
        self.pools.iter().find(|p| p.id == id)
    }

    pub fn pools(&self) -> &[PoolSpec] {
        &self.pools
    }
}
