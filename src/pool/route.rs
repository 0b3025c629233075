//! Swap routing over the catalog's pools

use super::{Operation, OperationSpec};
use crate::amount::Amount;
use crate::catalog::{Catalog, EcosystemId, PoolSpec};
use crate::error::{OrchestratorError, OrchestratorResult};

use tracing::warn;

/// Pools a swap goes through, and how
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Both tokens are members of one pool
    Single { pool_id: String },
    /// Add into the input pool, then swap its LP token in the output pool
    AddThenSwap {
        input_pool: String,
        output_pool: String,
    },
    /// Swap into the output pool's LP token, then burn it for the output
    SwapThenRemove {
        input_pool: String,
        output_pool: String,
    },
    /// Swap into a token both pools hold, then swap it for the output
    SwapThenSwap {
        input_pool: String,
        output_pool: String,
        shared_token_id: String,
    },
}

impl Route {
    pub fn pool_ids(&self) -> Vec<String> {
        match self {
            Route::Single { pool_id } => vec![pool_id.clone()],
            Route::AddThenSwap {
                input_pool,
                output_pool,
            }
            | Route::SwapThenRemove {
                input_pool,
                output_pool,
            }
            | Route::SwapThenSwap {
                input_pool,
                output_pool,
                ..
            } => vec![input_pool.clone(), output_pool.clone()],
        }
    }

    pub fn hops(&self) -> usize {
        self.pool_ids().len()
    }
}

fn no_route(from: &str, to: &str) -> OrchestratorError {
    OrchestratorError::InvalidRoute(format!("no route from {} to {}", from, to))
}

/// Route between two tokens using only pools on `ecosystem`
pub fn required_pools(
    catalog: &Catalog,
    from_token_id: &str,
    to_token_id: &str,
    ecosystem: EcosystemId,
) -> OrchestratorResult<Route> {
    if from_token_id == to_token_id {
        return Err(no_route(from_token_id, to_token_id));
    }

    let pools: Vec<&PoolSpec> = catalog
        .pools()
        .iter()
        .filter(|p| p.ecosystem == ecosystem)
        .collect();

    if let Some(pool) = pools
        .iter()
        .find(|p| p.contains_token(from_token_id) && p.contains_token(to_token_id))
    {
        return Ok(Route::Single {
            pool_id: pool.id.clone(),
        });
    }

    for input in pools.iter().filter(|p| p.contains_token(from_token_id)) {
        for output in pools.iter().filter(|p| p.contains_token(to_token_id)) {
            if input.id == output.id {
                continue;
            }
            if output.contains_token(&input.lp_token_id) {
                return Ok(Route::AddThenSwap {
                    input_pool: input.id.clone(),
                    output_pool: output.id.clone(),
                });
            }
            if input.contains_token(&output.lp_token_id) {
                return Ok(Route::SwapThenRemove {
                    input_pool: input.id.clone(),
                    output_pool: output.id.clone(),
                });
            }
            if let Some(shared) = input.token_ids.iter().find(|t| output.contains_token(t)) {
                return Ok(Route::SwapThenSwap {
                    input_pool: input.id.clone(),
                    output_pool: output.id.clone(),
                    shared_token_id: shared.clone(),
                });
            }
        }
    }

    Err(no_route(from_token_id, to_token_id))
}

/// Pick the ecosystem and route for a swap
///
/// Fewer pools win; among equals, routes that keep more legs on the user's
/// own ecosystems need fewer bridge transfers; remaining ties go to catalog
/// order.
pub fn select_route(
    catalog: &Catalog,
    from_token_id: &str,
    from_ecosystem: EcosystemId,
    to_token_id: &str,
    to_ecosystem: EcosystemId,
) -> OrchestratorResult<(EcosystemId, Route)> {
    let mut ecosystems: Vec<EcosystemId> = Vec::new();
    for pool in catalog.pools() {
        if !ecosystems.contains(&pool.ecosystem) {
            ecosystems.push(pool.ecosystem);
        }
    }

    ecosystems
        .into_iter()
        .filter_map(|eco| {
            required_pools(catalog, from_token_id, to_token_id, eco)
                .ok()
                .map(|route| (eco, route))
        })
        .enumerate()
        .min_by_key(|(order, (eco, route))| {
            let bridges = usize::from(*eco != from_ecosystem) + usize::from(*eco != to_ecosystem);
            (route.hops(), bridges, *order)
        })
        .map(|(_, selected)| selected)
        .ok_or_else(|| no_route(from_token_id, to_token_id))
}

/// Operations executing a swap on `ecosystem`
///
/// `from` is the amount available on the pool's ecosystem and `to` the
/// minimum accepted output. Two-pool routes use `first_minimum_output` as
/// the minimum of the intermediate token.
pub fn plan_swap(
    catalog: &Catalog,
    from: &Amount,
    to: &Amount,
    ecosystem: EcosystemId,
    first_minimum_output: Option<&Amount>,
) -> OrchestratorResult<Vec<OperationSpec>> {
    let route = required_pools(catalog, from.token_id(), to.token_id(), ecosystem)?;

    let intermediate = |token_id: &str| -> OrchestratorResult<Amount> {
        let token = catalog.token_by_id(token_id).ok_or_else(|| {
            OrchestratorError::InvalidRoute(format!("unknown token {}", token_id))
        })?;
        match first_minimum_output {
            Some(amount) if amount.token_id() == token_id => Ok(amount.clone()),
            Some(amount) => Err(OrchestratorError::InvalidRoute(format!(
                "first minimum output is in {}, route goes through {}",
                amount.token_id(),
                token_id
            ))),
            None => {
                warn!(
                    "No first minimum output for swap through {}, accepting any amount",
                    token_id
                );
                Ok(Amount::zero(token))
            }
        }
    };

    let swap = |pool_id: &str, input: Amount, output: &Amount| OperationSpec {
        pool_id: pool_id.to_string(),
        operation: Operation::SwapExactInput {
            exact_input_amounts: vec![input],
            output_token_id: output.token_id().to_string(),
            minimum_output_amount: output.clone(),
        },
    };

    let pool = |id: &str| {
        catalog
            .pool_by_id(id)
            .ok_or_else(|| OrchestratorError::InvalidRoute(format!("unknown pool {}", id)))
    };

    Ok(match route {
        Route::Single { pool_id } => vec![swap(&pool_id, from.clone(), to)],
        Route::AddThenSwap {
            input_pool,
            output_pool,
        } => {
            let lp = intermediate(&pool(&input_pool)?.lp_token_id)?;
            vec![
                OperationSpec {
                    pool_id: input_pool,
                    operation: Operation::Add {
                        input_amounts: vec![from.clone()],
                        minimum_mint_amount: lp.clone(),
                    },
                },
                swap(&output_pool, lp, to),
            ]
        }
        Route::SwapThenRemove {
            input_pool,
            output_pool,
        } => {
            let lp = intermediate(&pool(&output_pool)?.lp_token_id)?;
            vec![
                swap(&input_pool, from.clone(), &lp),
                OperationSpec {
                    pool_id: output_pool,
                    operation: Operation::RemoveExactBurn {
                        exact_burn_amount: lp,
                        output_token_id: to.token_id().to_string(),
                        minimum_output_amount: to.clone(),
                    },
                },
            ]
        }
        Route::SwapThenSwap {
            input_pool,
            output_pool,
            shared_token_id,
        } => {
            let shared = intermediate(&shared_token_id)?;
            vec![
                swap(&input_pool, from.clone(), &shared),
                swap(&output_pool, shared, to),
            ]
        }
    })
}
