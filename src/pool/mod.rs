//! Pool operation builder
//!
//! Turns operation requests into pool instructions and groups them into
//! transactions. Solana composes every leg plus a memo tag into one atomic
//! transaction; EVM chains get one transaction per leg, each resumable on
//! its own.

pub mod route;

pub use route::{required_pools, Route};

use crate::amount::Amount;
use crate::catalog::{Catalog, EcosystemId, PoolSpec, Protocol};
use crate::chain::Instruction;
use crate::error::{OrchestratorError, OrchestratorResult};

use serde::{Deserialize, Serialize};

/// Pool call with atomic amounts, ordered by pool token index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "instruction", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PoolCall {
    Add {
        input_amounts: Vec<u128>,
        minimum_mint_amount: u128,
    },
    SwapExactInput {
        exact_input_amounts: Vec<u128>,
        output_token_index: u8,
        minimum_output_amount: u128,
    },
    RemoveUniform {
        exact_burn_amount: u128,
        minimum_output_amounts: Vec<u128>,
    },
    RemoveExactBurn {
        exact_burn_amount: u128,
        output_token_index: u8,
        minimum_output_amount: u128,
    },
    RemoveExactOutput {
        maximum_burn_amount: u128,
        exact_output_amounts: Vec<u128>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolInstruction {
    /// Pool program id or contract address
    pub pool: String,
    pub call: PoolCall,
}

/// One pool instruction request
#[derive(Debug, Clone, PartialEq)]
pub struct OperationSpec {
    pub pool_id: String,
    pub operation: Operation,
}

/// Instruction kind with human amounts
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Add {
        input_amounts: Vec<Amount>,
        minimum_mint_amount: Amount,
    },
    SwapExactInput {
        exact_input_amounts: Vec<Amount>,
        output_token_id: String,
        minimum_output_amount: Amount,
    },
    RemoveUniform {
        exact_burn_amount: Amount,
        minimum_output_amounts: Vec<Amount>,
    },
    RemoveExactBurn {
        exact_burn_amount: Amount,
        output_token_id: String,
        minimum_output_amount: Amount,
    },
    RemoveExactOutput {
        maximum_burn_amount: Amount,
        exact_output_amounts: Vec<Amount>,
    },
}

impl OperationSpec {
    /// Token this operation spends on behalf of the user
    ///
    /// Operations with several inputs report `None`.
    pub fn input_token_id(&self) -> Option<&str> {
        match &self.operation {
            Operation::SwapExactInput {
                exact_input_amounts,
                ..
            } if exact_input_amounts.len() == 1 => Some(exact_input_amounts[0].token_id()),
            Operation::Add { input_amounts, .. } if input_amounts.len() == 1 => {
                Some(input_amounts[0].token_id())
            }
            Operation::RemoveUniform {
                exact_burn_amount, ..
            }
            | Operation::RemoveExactBurn {
                exact_burn_amount, ..
            } => Some(exact_burn_amount.token_id()),
            Operation::RemoveExactOutput {
                maximum_burn_amount,
                ..
            } => Some(maximum_burn_amount.token_id()),
            _ => None,
        }
    }

    /// Amounts the user's wallet pays into the pool
    pub fn spent_amounts(&self) -> Vec<&Amount> {
        match &self.operation {
            Operation::Add { input_amounts, .. } => input_amounts.iter().collect(),
            Operation::SwapExactInput {
                exact_input_amounts,
                ..
            } => exact_input_amounts.iter().collect(),
            Operation::RemoveUniform {
                exact_burn_amount, ..
            }
            | Operation::RemoveExactBurn {
                exact_burn_amount, ..
            } => vec![exact_burn_amount],
            Operation::RemoveExactOutput {
                maximum_burn_amount,
                ..
            } => vec![maximum_burn_amount],
        }
    }

    /// Tokens the pool pays out to the user
    pub fn output_token_ids(&self, catalog: &Catalog) -> OrchestratorResult<Vec<String>> {
        let pool = catalog.pool_by_id(&self.pool_id).ok_or_else(|| {
            OrchestratorError::InvalidRoute(format!("unknown pool {}", self.pool_id))
        })?;
        Ok(match &self.operation {
            Operation::Add { .. } => vec![pool.lp_token_id.clone()],
            Operation::SwapExactInput {
                output_token_id, ..
            }
            | Operation::RemoveExactBurn {
                output_token_id, ..
            } => vec![output_token_id.clone()],
            Operation::RemoveUniform { .. } => pool.token_ids.clone(),
            Operation::RemoveExactOutput {
                exact_output_amounts,
                ..
            } => exact_output_amounts
                .iter()
                .map(|a| a.token_id().to_string())
                .collect(),
        })
    }

    /// Replace the single input amount of this operation
    ///
    /// Used when the input of a second leg is only known once the first
    /// leg has confirmed.
    pub fn with_input(&self, amount: Amount) -> OrchestratorResult<Self> {
        let mut spec = self.clone();
        match &mut spec.operation {
            Operation::SwapExactInput {
                exact_input_amounts,
                ..
            } if exact_input_amounts.len() == 1 => exact_input_amounts[0] = amount,
            Operation::Add { input_amounts, .. } if input_amounts.len() == 1 => {
                input_amounts[0] = amount
            }
            Operation::RemoveExactBurn {
                exact_burn_amount, ..
            }
            | Operation::RemoveUniform {
                exact_burn_amount, ..
            } => *exact_burn_amount = amount,
            _ => {
                return Err(OrchestratorError::Internal(format!(
                    "operation on pool {} has no single input",
                    self.pool_id
                )))
            }
        }
        Ok(spec)
    }
}

/// A transaction of the route and the legs it covers
#[derive(Debug, Clone, PartialEq)]
pub struct PoolTx {
    pub legs: Vec<usize>,
    pub instructions: Vec<Instruction>,
}

/// Build the pool instruction for one operation
pub fn build(catalog: &Catalog, op: &OperationSpec) -> OrchestratorResult<PoolInstruction> {
    let pool = catalog.pool_by_id(&op.pool_id).ok_or_else(|| {
        OrchestratorError::InvalidRoute(format!("unknown pool {}", op.pool_id))
    })?;
    let eco = pool.ecosystem;

    let call = match &op.operation {
        Operation::Add {
            input_amounts,
            minimum_mint_amount,
        } => PoolCall::Add {
            input_amounts: per_token(pool, input_amounts)?,
            minimum_mint_amount: lp_amount(pool, minimum_mint_amount)?,
        },
        Operation::SwapExactInput {
            exact_input_amounts,
            output_token_id,
            minimum_output_amount,
        } => PoolCall::SwapExactInput {
            exact_input_amounts: per_token(pool, exact_input_amounts)?,
            output_token_index: token_index(pool, output_token_id)?,
            minimum_output_amount: minimum_output_amount.to_atomic(eco)?,
        },
        Operation::RemoveUniform {
            exact_burn_amount,
            minimum_output_amounts,
        } => PoolCall::RemoveUniform {
            exact_burn_amount: lp_amount(pool, exact_burn_amount)?,
            minimum_output_amounts: per_token(pool, minimum_output_amounts)?,
        },
        Operation::RemoveExactBurn {
            exact_burn_amount,
            output_token_id,
            minimum_output_amount,
        } => PoolCall::RemoveExactBurn {
            exact_burn_amount: lp_amount(pool, exact_burn_amount)?,
            output_token_index: token_index(pool, output_token_id)?,
            minimum_output_amount: minimum_output_amount.to_atomic(eco)?,
        },
        Operation::RemoveExactOutput {
            maximum_burn_amount,
            exact_output_amounts,
        } => PoolCall::RemoveExactOutput {
            maximum_burn_amount: lp_amount(pool, maximum_burn_amount)?,
            exact_output_amounts: per_token(pool, exact_output_amounts)?,
        },
    };

    Ok(PoolInstruction {
        pool: pool.address.clone(),
        call,
    })
}

/// Build the transactions executing `ops` in order on `ecosystem`
pub fn build_route(
    catalog: &Catalog,
    ops: &[OperationSpec],
    ecosystem: EcosystemId,
    interaction_id: &str,
) -> OrchestratorResult<Vec<PoolTx>> {
    let instructions = ops
        .iter()
        .map(|op| build(catalog, op).map(Instruction::Pool))
        .collect::<OrchestratorResult<Vec<_>>>()?;

    Ok(match ecosystem.protocol() {
        Protocol::Solana => {
            let mut instructions = instructions;
            instructions.push(Instruction::Memo {
                text: interaction_id.to_string(),
            });
            vec![PoolTx {
                legs: (0..ops.len()).collect(),
                instructions,
            }]
        }
        Protocol::Evm => instructions
            .into_iter()
            .enumerate()
            .map(|(leg, instruction)| PoolTx {
                legs: vec![leg],
                instructions: vec![instruction],
            })
            .collect(),
    })
}

/// Leg indices grouped by transaction, as `build_route` groups them
pub fn tx_layout(leg_count: usize, ecosystem: EcosystemId) -> Vec<Vec<usize>> {
    match ecosystem.protocol() {
        Protocol::Solana => vec![(0..leg_count).collect()],
        Protocol::Evm => (0..leg_count).map(|leg| vec![leg]).collect(),
    }
}

fn token_index(pool: &PoolSpec, token_id: &str) -> OrchestratorResult<u8> {
    pool.token_index(token_id)
        .map(|i| i as u8)
        .ok_or_else(|| {
            OrchestratorError::InvalidRoute(format!("token {} is not in pool {}", token_id, pool.id))
        })
}

fn lp_amount(pool: &PoolSpec, amount: &Amount) -> OrchestratorResult<u128> {
    if amount.token_id() != pool.lp_token_id {
        return Err(OrchestratorError::InvalidRoute(format!(
            "{} is not the LP token of pool {}",
            amount.token_id(),
            pool.id
        )));
    }
    amount.to_atomic(pool.ecosystem)
}

/// Spread amounts over the pool's token slots, zero where absent
fn per_token(pool: &PoolSpec, amounts: &[Amount]) -> OrchestratorResult<Vec<u128>> {
    let mut slots = vec![0u128; pool.token_ids.len()];
    for amount in amounts {
        let index = token_index(pool, amount.token_id())? as usize;
        slots[index] = amount.to_atomic(pool.ecosystem)?;
    }
    Ok(slots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn add_op(catalog: &Catalog) -> OperationSpec {
        OperationSpec {
            pool_id: "eth-pool".into(),
            operation: Operation::Add {
                input_amounts: vec![
                    testing::amount(catalog, "usdc", "100"),
                    testing::amount(catalog, "usdt", "10"),
                ],
                minimum_mint_amount: testing::amount(catalog, "eth-lp", "110"),
            },
        }
    }

    #[test]
    fn add_orders_amounts_by_pool_index() {
        let catalog = testing::catalog();
        let ix = build(&catalog, &add_op(&catalog)).unwrap();
        assert_eq!(ix.pool, catalog.pool_by_id("eth-pool").unwrap().address);
        assert_eq!(
            ix.call,
            PoolCall::Add {
                input_amounts: vec![100_000_000, 10_000_000],
                minimum_mint_amount: 110_000_000,
            }
        );
    }

    #[test]
    fn foreign_token_is_an_invalid_route() {
        let catalog = testing::catalog();
        let op = OperationSpec {
            pool_id: "eth-pool".into(),
            operation: Operation::SwapExactInput {
                exact_input_amounts: vec![testing::amount(&catalog, "usdc", "1")],
                output_token_id: "sol-lp".into(),
                minimum_output_amount: testing::amount(&catalog, "usdt", "1"),
            },
        };
        assert!(matches!(
            build(&catalog, &op),
            Err(OrchestratorError::InvalidRoute(_))
        ));
    }

    #[test]
    fn solana_composes_one_tagged_tx() {
        let catalog = testing::catalog();
        let legs = route::plan_swap(
            &catalog,
            &testing::amount(&catalog, "usdc", "5"),
            &testing::amount(&catalog, "usdt", "4.9"),
            EcosystemId::Solana,
            None,
        )
        .unwrap();
        let txs = build_route(&catalog, &legs, EcosystemId::Solana, testing::INTERACTION_ID).unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].legs, vec![0]);
        assert!(matches!(
            txs[0].instructions.last(),
            Some(Instruction::Memo { text }) if text == testing::INTERACTION_ID
        ));
    }

    #[test]
    fn evm_splits_legs_into_separate_txs() {
        let catalog = testing::catalog();
        let txs = build_route(
            &catalog,
            &[add_op(&catalog), add_op(&catalog)],
            EcosystemId::Ethereum,
            testing::INTERACTION_ID,
        )
        .unwrap();
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[1].legs, vec![1]);
        assert_eq!(tx_layout(2, EcosystemId::Ethereum), vec![vec![0], vec![1]]);
        assert_eq!(tx_layout(2, EcosystemId::Solana), vec![vec![0, 1]]);
    }

    #[test]
    fn add_spends_inputs_and_pays_lp() {
        let catalog = testing::catalog();
        let op = add_op(&catalog);
        assert_eq!(op.spent_amounts().len(), 2);
        assert_eq!(op.output_token_ids(&catalog).unwrap(), vec!["eth-lp".to_string()]);
        assert_eq!(op.input_token_id(), None);
    }
}
