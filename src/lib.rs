//! Interaction Orchestrator - resumable cross-chain liquidity pool interactions
//!
//! Executes add, remove and swap interactions against liquidity pools that
//! live on one ecosystem while the user's tokens may sit on others. Tokens
//! are bridged in through the guardian network, the pool operations run, and
//! outputs are bridged back out. Every confirmed sub-step is persisted, and
//! a restarted interaction first looks on chain for work it already did.

pub mod amount;
pub mod bridge;
pub mod catalog;
pub mod chain;
pub mod config;
pub mod coordination;
pub mod error;
pub mod events;
pub mod idempotency;
pub mod interaction;
pub mod metrics;
pub mod pool;
pub mod state;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use amount::Amount;
pub use bridge::{BridgeAdapter, GuardianClient, HttpGuardianClient};
pub use catalog::{Catalog, EcosystemId, Env, PoolSpec, Protocol, TokenSpec};
pub use chain::{ChainClient, ChainRegistry, WalletSigner};
pub use config::Settings;
pub use coordination::Orchestrator;
pub use error::{OrchestratorError, OrchestratorResult};
pub use events::InteractionEvent;
pub use interaction::{Interaction, InteractionParams, InteractionState, Phase};
pub use state::{History, HistoryStore};
