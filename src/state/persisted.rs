//! Serialized form of an interaction
//!
//! Amounts are stored as token id plus decimal string. Loading plans the
//! interaction again from its parameters and overlays the recorded progress;
//! a record whose steps no longer match the plan is rejected.

use crate::amount::Amount;
use crate::bridge::{BridgeProgress, Transfer};
use crate::catalog::{Catalog, EcosystemId, Env};
use crate::error::{InteractionError, OrchestratorError, OrchestratorResult};
use crate::interaction::{
    AddParams, Interaction, InteractionParams, InteractionState, InteractionType, Phase, PoolStep,
    RemoveExactBurnParams, RemoveExactOutputParams, RemoveUniformParams, Steps, SwapParams,
    TokenAccountStep, TokenTransferDetail, TransferStep, TxRef,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedAmount {
    pub token_id: String,
    pub value: String,
}

impl From<&Amount> for PersistedAmount {
    fn from(amount: &Amount) -> Self {
        Self {
            token_id: amount.token_id().to_string(),
            value: amount.to_human_string(),
        }
    }
}

impl PersistedAmount {
    fn decode(&self, catalog: &Catalog) -> OrchestratorResult<Amount> {
        let token = catalog.token_by_id(&self.token_id).ok_or_else(|| {
            OrchestratorError::Serialization(format!("unknown token {}", self.token_id))
        })?;
        Amount::from_human_str(token, &self.value)
    }
}

fn encode_all(amounts: &[Amount]) -> Vec<PersistedAmount> {
    amounts.iter().map(PersistedAmount::from).collect()
}

fn decode_all(amounts: &[PersistedAmount], catalog: &Catalog) -> OrchestratorResult<Vec<Amount>> {
    amounts.iter().map(|a| a.decode(catalog)).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedTransferDetail {
    pub amount: PersistedAmount,
    pub ecosystem: EcosystemId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PersistedParams {
    Add {
        pool_id: String,
        input_amounts: Vec<PersistedAmount>,
        minimum_mint_amount: PersistedAmount,
        lp_target_ecosystem: EcosystemId,
    },
    RemoveUniform {
        pool_id: String,
        exact_burn_amount: PersistedAmount,
        minimum_output_amounts: Vec<PersistedAmount>,
        lp_source_ecosystem: EcosystemId,
    },
    RemoveExactBurn {
        pool_id: String,
        exact_burn_amount: PersistedAmount,
        minimum_output_amount: PersistedAmount,
        lp_source_ecosystem: EcosystemId,
    },
    RemoveExactOutput {
        pool_id: String,
        maximum_burn_amount: PersistedAmount,
        exact_output_amounts: Vec<PersistedAmount>,
        lp_source_ecosystem: EcosystemId,
    },
    Swap {
        from: PersistedTransferDetail,
        to: PersistedTransferDetail,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        first_minimum_output: Option<PersistedAmount>,
    },
}

impl From<&InteractionParams> for PersistedParams {
    fn from(params: &InteractionParams) -> Self {
        let detail = |d: &TokenTransferDetail| PersistedTransferDetail {
            amount: (&d.amount).into(),
            ecosystem: d.ecosystem,
        };
        match params {
            InteractionParams::Add(p) => PersistedParams::Add {
                pool_id: p.pool_id.clone(),
                input_amounts: encode_all(&p.input_amounts),
                minimum_mint_amount: (&p.minimum_mint_amount).into(),
                lp_target_ecosystem: p.lp_target_ecosystem,
            },
            InteractionParams::RemoveUniform(p) => PersistedParams::RemoveUniform {
                pool_id: p.pool_id.clone(),
                exact_burn_amount: (&p.exact_burn_amount).into(),
                minimum_output_amounts: encode_all(&p.minimum_output_amounts),
                lp_source_ecosystem: p.lp_source_ecosystem,
            },
            InteractionParams::RemoveExactBurn(p) => PersistedParams::RemoveExactBurn {
                pool_id: p.pool_id.clone(),
                exact_burn_amount: (&p.exact_burn_amount).into(),
                minimum_output_amount: (&p.minimum_output_amount).into(),
                lp_source_ecosystem: p.lp_source_ecosystem,
            },
            InteractionParams::RemoveExactOutput(p) => PersistedParams::RemoveExactOutput {
                pool_id: p.pool_id.clone(),
                maximum_burn_amount: (&p.maximum_burn_amount).into(),
                exact_output_amounts: encode_all(&p.exact_output_amounts),
                lp_source_ecosystem: p.lp_source_ecosystem,
            },
            InteractionParams::Swap(p) => PersistedParams::Swap {
                from: detail(&p.from),
                to: detail(&p.to),
                first_minimum_output: p.first_minimum_output.as_ref().map(Into::into),
            },
        }
    }
}

impl PersistedParams {
    pub fn decode(&self, catalog: &Catalog) -> OrchestratorResult<InteractionParams> {
        let detail = |d: &PersistedTransferDetail| -> OrchestratorResult<TokenTransferDetail> {
            Ok(TokenTransferDetail {
                amount: d.amount.decode(catalog)?,
                ecosystem: d.ecosystem,
            })
        };
        Ok(match self {
            PersistedParams::Add {
                pool_id,
                input_amounts,
                minimum_mint_amount,
                lp_target_ecosystem,
            } => InteractionParams::Add(AddParams {
                pool_id: pool_id.clone(),
                input_amounts: decode_all(input_amounts, catalog)?,
                minimum_mint_amount: minimum_mint_amount.decode(catalog)?,
                lp_target_ecosystem: *lp_target_ecosystem,
            }),
            PersistedParams::RemoveUniform {
                pool_id,
                exact_burn_amount,
                minimum_output_amounts,
                lp_source_ecosystem,
            } => InteractionParams::RemoveUniform(RemoveUniformParams {
                pool_id: pool_id.clone(),
                exact_burn_amount: exact_burn_amount.decode(catalog)?,
                minimum_output_amounts: decode_all(minimum_output_amounts, catalog)?,
                lp_source_ecosystem: *lp_source_ecosystem,
            }),
            PersistedParams::RemoveExactBurn {
                pool_id,
                exact_burn_amount,
                minimum_output_amount,
                lp_source_ecosystem,
            } => InteractionParams::RemoveExactBurn(RemoveExactBurnParams {
                pool_id: pool_id.clone(),
                exact_burn_amount: exact_burn_amount.decode(catalog)?,
                minimum_output_amount: minimum_output_amount.decode(catalog)?,
                lp_source_ecosystem: *lp_source_ecosystem,
            }),
            PersistedParams::RemoveExactOutput {
                pool_id,
                maximum_burn_amount,
                exact_output_amounts,
                lp_source_ecosystem,
            } => InteractionParams::RemoveExactOutput(RemoveExactOutputParams {
                pool_id: pool_id.clone(),
                maximum_burn_amount: maximum_burn_amount.decode(catalog)?,
                exact_output_amounts: decode_all(exact_output_amounts, catalog)?,
                lp_source_ecosystem: *lp_source_ecosystem,
            }),
            PersistedParams::Swap {
                from,
                to,
                first_minimum_output,
            } => InteractionParams::Swap(SwapParams {
                from: detail(from)?,
                to: detail(to)?,
                first_minimum_output: first_minimum_output
                    .as_ref()
                    .map(|a| a.decode(catalog))
                    .transpose()?,
            }),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedAccount {
    pub ecosystem: EcosystemId,
    pub token_id: String,
    pub account: Option<String>,
    pub tx_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedTransfer {
    pub amount: PersistedAmount,
    pub source: EcosystemId,
    pub destination: EcosystemId,
    pub amount_resolved: bool,
    pub progress: BridgeProgress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedPoolStep {
    pub legs: Vec<usize>,
    pub tx_id: Option<String>,
    #[serde(default)]
    pub outputs: Vec<PersistedAmount>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSteps {
    #[serde(default)]
    pub accounts: Vec<PersistedAccount>,
    #[serde(default)]
    pub inbound: Vec<PersistedTransfer>,
    #[serde(default)]
    pub pool: Vec<PersistedPoolStep>,
    #[serde(default)]
    pub outbound: Vec<PersistedTransfer>,
}

impl From<&TransferStep> for PersistedTransfer {
    fn from(step: &TransferStep) -> Self {
        Self {
            amount: (&step.transfer.amount).into(),
            source: step.transfer.source,
            destination: step.transfer.destination,
            amount_resolved: step.amount_resolved,
            progress: step.progress.clone(),
        }
    }
}

impl From<&Steps> for PersistedSteps {
    fn from(steps: &Steps) -> Self {
        Self {
            accounts: steps
                .accounts
                .iter()
                .map(|a| PersistedAccount {
                    ecosystem: a.ecosystem,
                    token_id: a.token_id.clone(),
                    account: a.account.clone(),
                    tx_id: a.tx_id.clone(),
                })
                .collect(),
            inbound: steps.inbound.iter().map(Into::into).collect(),
            pool: steps
                .pool
                .iter()
                .map(|p| PersistedPoolStep {
                    legs: p.legs.clone(),
                    tx_id: p.tx_id.clone(),
                    outputs: encode_all(&p.outputs),
                })
                .collect(),
            outbound: steps.outbound.iter().map(Into::into).collect(),
        }
    }
}

impl PersistedTransfer {
    /// Overlay recorded progress onto a planned transfer
    fn overlay(&self, planned: &mut TransferStep, catalog: &Catalog) -> OrchestratorResult<()> {
        let transfer = &planned.transfer;
        if transfer.source != self.source
            || transfer.destination != self.destination
            || transfer.amount.token_id() != self.amount.token_id
        {
            return Err(mismatch("transfer"));
        }
        planned.transfer = Transfer {
            amount: self.amount.decode(catalog)?,
            source: self.source,
            destination: self.destination,
        };
        planned.amount_resolved = self.amount_resolved;
        planned.progress = self.progress.clone();
        Ok(())
    }
}

impl PersistedSteps {
    fn overlay(&self, steps: &mut Steps, catalog: &Catalog) -> OrchestratorResult<()> {
        if steps.accounts.len() != self.accounts.len()
            || steps.inbound.len() != self.inbound.len()
            || steps.pool.len() != self.pool.len()
            || steps.outbound.len() != self.outbound.len()
        {
            return Err(mismatch("step count"));
        }

        for (planned, stored) in steps.accounts.iter_mut().zip(&self.accounts) {
            if planned.ecosystem != stored.ecosystem || planned.token_id != stored.token_id {
                return Err(mismatch("token account"));
            }
            *planned = TokenAccountStep {
                ecosystem: stored.ecosystem,
                token_id: stored.token_id.clone(),
                account: stored.account.clone(),
                tx_id: stored.tx_id.clone(),
            };
        }
        for (planned, stored) in steps.inbound.iter_mut().zip(&self.inbound) {
            stored.overlay(planned, catalog)?;
        }
        for (planned, stored) in steps.pool.iter_mut().zip(&self.pool) {
            if planned.legs != stored.legs {
                return Err(mismatch("pool step"));
            }
            *planned = PoolStep {
                legs: stored.legs.clone(),
                tx_id: stored.tx_id.clone(),
                outputs: decode_all(&stored.outputs, catalog)?,
            };
        }
        for (planned, stored) in steps.outbound.iter_mut().zip(&self.outbound) {
            stored.overlay(planned, catalog)?;
        }
        Ok(())
    }
}

fn mismatch(what: &str) -> OrchestratorError {
    OrchestratorError::Serialization(format!("stored {} does not match the planned steps", what))
}

/// Stored interaction record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedInteractionState {
    pub id: String,
    pub env: Env,
    pub interaction_type: InteractionType,
    pub phase: Phase,
    pub params: PersistedParams,
    /// Keyed by phase name
    pub tx_ids_by_phase: BTreeMap<String, Vec<TxRef>>,
    pub steps: PersistedSteps,
    pub pool_ids: Vec<String>,
    /// Keyed by ecosystem name
    pub connected_wallets: BTreeMap<String, String>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<InteractionError>,
}

impl From<&InteractionState> for PersistedInteractionState {
    fn from(state: &InteractionState) -> Self {
        let interaction = &state.interaction;
        Self {
            id: interaction.id.clone(),
            env: interaction.env,
            interaction_type: interaction.interaction_type(),
            phase: state.phase,
            params: (&interaction.params).into(),
            tx_ids_by_phase: state
                .tx_ids_by_phase()
                .into_iter()
                .map(|(phase, refs)| (phase.as_str().to_string(), refs))
                .collect(),
            steps: (&state.steps).into(),
            pool_ids: interaction.pool_ids.clone(),
            connected_wallets: interaction
                .connected_wallets
                .iter()
                .map(|(eco, address)| (eco.as_str().to_string(), address.clone()))
                .collect(),
            submitted_at: interaction.submitted_at,
            error: state.error.clone(),
        }
    }
}

impl PersistedInteractionState {
    /// Rebuild the in-memory state against `catalog`
    pub fn into_state(self, catalog: &Catalog) -> OrchestratorResult<InteractionState> {
        let params = self.params.decode(catalog)?;
        if params.interaction_type() != self.interaction_type {
            return Err(OrchestratorError::Serialization(format!(
                "interaction {} is stored as {} with {} parameters",
                self.id,
                self.interaction_type.as_str(),
                params.interaction_type().as_str()
            )));
        }

        let connected_wallets = self
            .connected_wallets
            .iter()
            .map(|(eco, address)| {
                eco.parse::<EcosystemId>()
                    .map(|eco| (eco, address.clone()))
                    .map_err(OrchestratorError::Serialization)
            })
            .collect::<OrchestratorResult<BTreeMap<_, _>>>()?;

        let interaction = Interaction {
            id: self.id,
            env: self.env,
            pool_ids: self.pool_ids,
            connected_wallets,
            submitted_at: self.submitted_at,
            params,
        };

        let mut state = InteractionState::plan(catalog, interaction)?;
        self.steps.overlay(&mut state.steps, catalog)?;
        state.phase = self.phase;
        state.error = self.error;
        Ok(state)
    }
}
