//! Interaction state and sub-step planning
//!
//! Every sub-step an interaction needs is planned once, when it is created.
//! Execution only fills in results: token accounts, bridge progress and pool
//! transaction ids.

use super::{Interaction, InteractionParams};
use crate::amount::Amount;
use crate::bridge::{BridgeProgress, Transfer};
use crate::catalog::{Catalog, EcosystemId, Protocol};
use crate::error::{InteractionError, OrchestratorError, OrchestratorResult};
use crate::pool::{self, route, Operation, OperationSpec};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Initiated,
    AccountsReady,
    InboundTransferDone,
    PoolOperationsDone,
    OutboundTransferDone,
    Done,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::Initiated,
        Phase::AccountsReady,
        Phase::InboundTransferDone,
        Phase::PoolOperationsDone,
        Phase::OutboundTransferDone,
        Phase::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Initiated => "initiated",
            Phase::AccountsReady => "accountsReady",
            Phase::InboundTransferDone => "inboundTransferDone",
            Phase::PoolOperationsDone => "poolOperationsDone",
            Phase::OutboundTransferDone => "outboundTransferDone",
            Phase::Done => "done",
        }
    }

    pub fn next(&self) -> Option<Phase> {
        Phase::ALL.iter().copied().find(|p| p > self)
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown phase {:?}", s))
    }
}

/// A Solana token account the user needs before value can land in it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenAccountStep {
    pub ecosystem: EcosystemId,
    pub token_id: String,
    pub account: Option<String>,
    /// Set when the account had to be created
    pub tx_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferStep {
    pub transfer: Transfer,
    /// Outbound amounts are replaced by the observed pool output once known
    pub amount_resolved: bool,
    pub progress: BridgeProgress,
}

impl TransferStep {
    /// Bridged already, or resolved to nothing worth bridging
    pub fn is_complete(&self) -> bool {
        self.progress.is_complete() || (self.amount_resolved && self.transfer.amount.is_zero())
    }
}

/// One pool transaction and the legs it executes
#[derive(Debug, Clone, PartialEq)]
pub struct PoolStep {
    pub legs: Vec<usize>,
    pub tx_id: Option<String>,
    /// Balance increases observed in the confirmed transaction
    pub outputs: Vec<Amount>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Steps {
    pub accounts: Vec<TokenAccountStep>,
    pub inbound: Vec<TransferStep>,
    pub pool: Vec<PoolStep>,
    pub outbound: Vec<TransferStep>,
}

/// Direction of a transfer phase relative to the pool ecosystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn phase(&self) -> Phase {
        match self {
            Direction::Inbound => Phase::InboundTransferDone,
            Direction::Outbound => Phase::OutboundTransferDone,
        }
    }
}

impl Steps {
    pub fn transfers(&self, direction: Direction) -> &[TransferStep] {
        match direction {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
        }
    }

    pub fn transfers_mut(&mut self, direction: Direction) -> &mut Vec<TransferStep> {
        match direction {
            Direction::Inbound => &mut self.inbound,
            Direction::Outbound => &mut self.outbound,
        }
    }
}

/// Transaction recorded by a sub-step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxRef {
    pub ecosystem: EcosystemId,
    pub tx_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InteractionState {
    pub interaction: Interaction,
    /// Ecosystem of the pools the interaction goes through
    pub pool_ecosystem: EcosystemId,
    pub operations: Vec<OperationSpec>,
    /// Last completed phase
    pub phase: Phase,
    pub steps: Steps,
    pub error: Option<InteractionError>,
}

impl InteractionState {
    /// Plan every sub-step of a new interaction
    pub fn plan(catalog: &Catalog, mut interaction: Interaction) -> OrchestratorResult<Self> {
        let mut planner = Planner::default();

        let pool_ecosystem = match &interaction.params {
            InteractionParams::Add(p) => {
                let pool_eco = pool_ecosystem(catalog, &p.pool_id)?;
                let inputs = p
                    .input_amounts
                    .iter()
                    .map(|a| planner.inbound(a, a.token().native_ecosystem, pool_eco))
                    .collect::<OrchestratorResult<Vec<_>>>()?;
                planner.outbound(&p.minimum_mint_amount, pool_eco, p.lp_target_ecosystem)?;
                planner.operations.push(OperationSpec {
                    pool_id: p.pool_id.clone(),
                    operation: Operation::Add {
                        input_amounts: inputs,
                        minimum_mint_amount: p.minimum_mint_amount.clone(),
                    },
                });
                pool_eco
            }
            InteractionParams::RemoveUniform(p) => {
                let pool_eco = pool_ecosystem(catalog, &p.pool_id)?;
                let burn = planner.inbound(&p.exact_burn_amount, p.lp_source_ecosystem, pool_eco)?;
                for output in &p.minimum_output_amounts {
                    planner.outbound(output, pool_eco, output.token().native_ecosystem)?;
                }
                planner.operations.push(OperationSpec {
                    pool_id: p.pool_id.clone(),
                    operation: Operation::RemoveUniform {
                        exact_burn_amount: burn,
                        minimum_output_amounts: p.minimum_output_amounts.clone(),
                    },
                });
                pool_eco
            }
            InteractionParams::RemoveExactBurn(p) => {
                let pool_eco = pool_ecosystem(catalog, &p.pool_id)?;
                let burn = planner.inbound(&p.exact_burn_amount, p.lp_source_ecosystem, pool_eco)?;
                let output = &p.minimum_output_amount;
                planner.outbound(output, pool_eco, output.token().native_ecosystem)?;
                planner.operations.push(OperationSpec {
                    pool_id: p.pool_id.clone(),
                    operation: Operation::RemoveExactBurn {
                        exact_burn_amount: burn,
                        output_token_id: output.token_id().to_string(),
                        minimum_output_amount: output.clone(),
                    },
                });
                pool_eco
            }
            InteractionParams::RemoveExactOutput(p) => {
                let pool_eco = pool_ecosystem(catalog, &p.pool_id)?;
                let burn =
                    planner.inbound(&p.maximum_burn_amount, p.lp_source_ecosystem, pool_eco)?;
                // An exact output of nothing has nothing to bridge
                for output in p.exact_output_amounts.iter().filter(|a| !a.is_zero()) {
                    planner.outbound(output, pool_eco, output.token().native_ecosystem)?;
                }
                planner.operations.push(OperationSpec {
                    pool_id: p.pool_id.clone(),
                    operation: Operation::RemoveExactOutput {
                        maximum_burn_amount: burn,
                        exact_output_amounts: p.exact_output_amounts.clone(),
                    },
                });
                pool_eco
            }
            InteractionParams::Swap(p) => {
                let (pool_eco, _) = route::select_route(
                    catalog,
                    p.from.amount.token_id(),
                    p.from.ecosystem,
                    p.to.amount.token_id(),
                    p.to.ecosystem,
                )?;
                let input = planner.inbound(&p.from.amount, p.from.ecosystem, pool_eco)?;
                let minimum_output = if p.to.ecosystem == pool_eco {
                    p.to.amount.clone()
                } else {
                    p.to.amount.bridgeable(pool_eco, p.to.ecosystem)?
                };
                planner.outbound(&minimum_output, pool_eco, p.to.ecosystem)?;
                planner.operations = route::plan_swap(
                    catalog,
                    &input,
                    &minimum_output,
                    pool_eco,
                    p.first_minimum_output.as_ref(),
                )?;
                pool_eco
            }
        };

        // Validate every leg before anything is submitted
        for op in &planner.operations {
            pool::build(catalog, op)?;
        }

        let steps = planner.finish(catalog, pool_ecosystem)?;
        interaction.pool_ids.clear();
        for op in &planner.operations {
            if !interaction.pool_ids.contains(&op.pool_id) {
                interaction.pool_ids.push(op.pool_id.clone());
            }
        }
        Ok(Self {
            interaction,
            pool_ecosystem,
            operations: planner.operations,
            phase: Phase::Initiated,
            steps,
            error: None,
        })
    }

    pub fn id(&self) -> &str {
        &self.interaction.id
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Whether the phase has sub-steps to execute
    pub fn requires(&self, phase: Phase) -> bool {
        match phase {
            Phase::Initiated => false,
            Phase::AccountsReady => !self.steps.accounts.is_empty(),
            Phase::InboundTransferDone => !self.steps.inbound.is_empty(),
            Phase::PoolOperationsDone => !self.steps.pool.is_empty(),
            Phase::OutboundTransferDone => !self.steps.outbound.is_empty(),
            Phase::Done => true,
        }
    }

    /// Next phase to execute, skipping those without sub-steps
    pub fn next_phase(&self) -> Option<Phase> {
        let mut phase = self.phase.next()?;
        while !self.requires(phase) {
            phase = phase.next()?;
        }
        Some(phase)
    }

    /// Ecosystems the interaction needs a wallet on
    pub fn ecosystems(&self) -> Vec<EcosystemId> {
        let mut ecosystems = vec![self.pool_ecosystem];
        let transfers = self.steps.inbound.iter().chain(self.steps.outbound.iter());
        for step in transfers {
            ecosystems.push(step.transfer.source);
            ecosystems.push(step.transfer.destination);
        }
        ecosystems.extend(self.steps.accounts.iter().map(|a| a.ecosystem));
        ecosystems.sort();
        ecosystems.dedup();
        ecosystems
    }

    /// Operations of one pool step, with the input of a later leg replaced
    /// by what the previous leg actually produced
    pub fn step_operations(&self, index: usize) -> OrchestratorResult<Vec<OperationSpec>> {
        let step = self.steps.pool.get(index).ok_or_else(|| {
            OrchestratorError::Internal(format!("no pool step {} in {}", index, self.id()))
        })?;

        let mut ops = step
            .legs
            .iter()
            .map(|&leg| {
                self.operations.get(leg).cloned().ok_or_else(|| {
                    OrchestratorError::Internal(format!("no leg {} in {}", leg, self.id()))
                })
            })
            .collect::<OrchestratorResult<Vec<_>>>()?;

        let previous = index
            .checked_sub(1)
            .and_then(|i| self.steps.pool.get(i))
            .map(|s| s.outputs.as_slice())
            .unwrap_or_default();

        if let (Some(first), false) = (ops.first_mut(), previous.is_empty()) {
            let observed = first
                .input_token_id()
                .and_then(|token| previous.iter().find(|a| a.token_id() == token));
            if let Some(amount) = observed.filter(|a| !a.is_zero()) {
                *first = first.with_input(amount.clone())?;
            }
        }

        Ok(ops)
    }

    /// Every recorded transaction id
    pub fn tx_ids(&self) -> Vec<String> {
        self.tx_ids_by_phase()
            .into_values()
            .flatten()
            .map(|r| r.tx_id)
            .collect()
    }

    pub fn tx_ids_by_phase(&self) -> BTreeMap<Phase, Vec<TxRef>> {
        let mut by_phase: BTreeMap<Phase, Vec<TxRef>> = BTreeMap::new();

        for account in &self.steps.accounts {
            if let Some(tx_id) = &account.tx_id {
                by_phase.entry(Phase::AccountsReady).or_default().push(TxRef {
                    ecosystem: account.ecosystem,
                    tx_id: tx_id.clone(),
                });
            }
        }

        for direction in [Direction::Inbound, Direction::Outbound] {
            for step in self.steps.transfers(direction) {
                let refs = by_phase.entry(direction.phase()).or_default();
                let progress = &step.progress;
                if let Some(lock) = &progress.lock_tx {
                    refs.push(TxRef {
                        ecosystem: step.transfer.source,
                        tx_id: lock.clone(),
                    });
                }
                for tx_id in progress.staging_txs.iter().chain(progress.redeem_tx.iter()) {
                    refs.push(TxRef {
                        ecosystem: step.transfer.destination,
                        tx_id: tx_id.clone(),
                    });
                }
            }
        }

        for step in &self.steps.pool {
            if let Some(tx_id) = &step.tx_id {
                by_phase
                    .entry(Phase::PoolOperationsDone)
                    .or_default()
                    .push(TxRef {
                        ecosystem: self.pool_ecosystem,
                        tx_id: tx_id.clone(),
                    });
            }
        }

        by_phase.retain(|_, refs| !refs.is_empty());
        by_phase
    }
}

fn pool_ecosystem(catalog: &Catalog, pool_id: &str) -> OrchestratorResult<EcosystemId> {
    catalog
        .pool_by_id(pool_id)
        .map(|p| p.ecosystem)
        .ok_or_else(|| OrchestratorError::InvalidRoute(format!("unknown pool {}", pool_id)))
}

#[derive(Default)]
struct Planner {
    inbound: Vec<TransferStep>,
    outbound: Vec<TransferStep>,
    operations: Vec<OperationSpec>,
}

impl Planner {
    /// Plan bringing `amount` from `source` to the pool; returns the amount
    /// that arrives
    fn inbound(
        &mut self,
        amount: &Amount,
        source: EcosystemId,
        pool_eco: EcosystemId,
    ) -> OrchestratorResult<Amount> {
        if source == pool_eco || amount.is_zero() {
            return Ok(amount.clone());
        }
        let arriving = amount.bridgeable(source, pool_eco)?;
        self.inbound.push(TransferStep {
            transfer: Transfer {
                amount: arriving.clone(),
                source,
                destination: pool_eco,
            },
            amount_resolved: true,
            progress: BridgeProgress::default(),
        });
        Ok(arriving)
    }

    /// Plan sending a pool output to `destination`; the amount is the
    /// declared minimum until the pool transaction confirms
    fn outbound(
        &mut self,
        minimum: &Amount,
        pool_eco: EcosystemId,
        destination: EcosystemId,
    ) -> OrchestratorResult<()> {
        if destination == pool_eco {
            return Ok(());
        }
        self.outbound.push(TransferStep {
            transfer: Transfer {
                amount: minimum.bridgeable(pool_eco, destination)?,
                source: pool_eco,
                destination,
            },
            amount_resolved: false,
            progress: BridgeProgress::default(),
        });
        Ok(())
    }

    fn finish(&self, catalog: &Catalog, pool_eco: EcosystemId) -> OrchestratorResult<Steps> {
        // Tokens the user holds on each ecosystem at some point
        let mut held: Vec<(EcosystemId, String)> = Vec::new();
        let mut hold = |eco: EcosystemId, token_id: &str| {
            let entry = (eco, token_id.to_string());
            if !held.contains(&entry) {
                held.push(entry);
            }
        };

        for step in self.inbound.iter().chain(self.outbound.iter()) {
            hold(step.transfer.source, step.transfer.amount.token_id());
            hold(step.transfer.destination, step.transfer.amount.token_id());
        }
        for op in &self.operations {
            for amount in op.spent_amounts() {
                hold(pool_eco, amount.token_id());
            }
            for token_id in op.output_token_ids(catalog)? {
                hold(pool_eco, &token_id);
            }
        }

        let accounts = held
            .into_iter()
            .filter(|(eco, _)| eco.protocol() == Protocol::Solana)
            .map(|(ecosystem, token_id)| TokenAccountStep {
                ecosystem,
                token_id,
                account: None,
                tx_id: None,
            })
            .collect();

        let pool = pool::tx_layout(self.operations.len(), pool_eco)
            .into_iter()
            .map(|legs| PoolStep {
                legs,
                tx_id: None,
                outputs: Vec::new(),
            })
            .collect();

        Ok(Steps {
            accounts,
            inbound: self.inbound.clone(),
            pool,
            outbound: self.outbound.clone(),
        })
    }
}
