//! Interaction definitions
//!
//! An interaction is one logical user action (add liquidity, remove
//! liquidity or swap) that may span several ecosystems. It is immutable once
//! created; progress lives in `InteractionState`.

pub mod state;

pub use state::{InteractionState, Phase, PoolStep, Steps, TokenAccountStep, TransferStep, TxRef};

use crate::amount::Amount;
use crate::catalog::{EcosystemId, Env};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// 16 random bytes as 32 lowercase hex characters
pub fn new_interaction_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Interaction {
    pub id: String,
    pub env: Env,
    pub pool_ids: Vec<String>,
    /// Wallet addresses by ecosystem at submission time
    pub connected_wallets: BTreeMap<EcosystemId, String>,
    pub submitted_at: DateTime<Utc>,
    pub params: InteractionParams,
}

impl Interaction {
    pub fn interaction_type(&self) -> InteractionType {
        self.params.interaction_type()
    }

    pub fn family(&self) -> InteractionFamily {
        self.interaction_type().family()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InteractionParams {
    Add(AddParams),
    RemoveUniform(RemoveUniformParams),
    RemoveExactBurn(RemoveExactBurnParams),
    RemoveExactOutput(RemoveExactOutputParams),
    Swap(SwapParams),
}

impl InteractionParams {
    pub fn interaction_type(&self) -> InteractionType {
        match self {
            InteractionParams::Add(_) => InteractionType::Add,
            InteractionParams::RemoveUniform(_) => InteractionType::RemoveUniform,
            InteractionParams::RemoveExactBurn(_) => InteractionType::RemoveExactBurn,
            InteractionParams::RemoveExactOutput(_) => InteractionType::RemoveExactOutput,
            InteractionParams::Swap(_) => InteractionType::Swap,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AddParams {
    pub pool_id: String,
    pub input_amounts: Vec<Amount>,
    pub minimum_mint_amount: Amount,
    /// Where the minted LP tokens end up
    pub lp_target_ecosystem: EcosystemId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoveUniformParams {
    pub pool_id: String,
    pub exact_burn_amount: Amount,
    pub minimum_output_amounts: Vec<Amount>,
    /// Where the burned LP tokens are held
    pub lp_source_ecosystem: EcosystemId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoveExactBurnParams {
    pub pool_id: String,
    pub exact_burn_amount: Amount,
    pub minimum_output_amount: Amount,
    pub lp_source_ecosystem: EcosystemId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoveExactOutputParams {
    pub pool_id: String,
    pub maximum_burn_amount: Amount,
    pub exact_output_amounts: Vec<Amount>,
    pub lp_source_ecosystem: EcosystemId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwapParams {
    pub from: TokenTransferDetail,
    /// `to.amount` is the minimum accepted output
    pub to: TokenTransferDetail,
    /// Caller-estimated minimum of the intermediate token on two-pool routes
    pub first_minimum_output: Option<Amount>,
}

/// An amount held on a specific ecosystem
#[derive(Debug, Clone, PartialEq)]
pub struct TokenTransferDetail {
    pub amount: Amount,
    pub ecosystem: EcosystemId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InteractionType {
    Add,
    RemoveUniform,
    RemoveExactBurn,
    RemoveExactOutput,
    Swap,
}

impl InteractionType {
    pub fn family(&self) -> InteractionFamily {
        match self {
            InteractionType::Swap => InteractionFamily::Swap,
            _ => InteractionFamily::Liquidity,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionType::Add => "add",
            InteractionType::RemoveUniform => "removeUniform",
            InteractionType::RemoveExactBurn => "removeExactBurn",
            InteractionType::RemoveExactOutput => "removeExactOutput",
            InteractionType::Swap => "swap",
        }
    }
}

/// Interaction types sharing one retention quota
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InteractionFamily {
    Liquidity,
    Swap,
}

impl InteractionFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionFamily::Liquidity => "liquidity",
            InteractionFamily::Swap => "swap",
        }
    }
}

impl std::str::FromStr for InteractionFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "liquidity" => Ok(InteractionFamily::Liquidity),
            "swap" => Ok(InteractionFamily::Swap),
            _ => Err(format!("unknown interaction family {:?}", s)),
        }
    }
}
