//! Idempotency classifier
//!
//! Before a sub-step submits anything, the wallet's recent transactions
//! carrying the interaction id are matched against the effect the sub-step
//! is about to produce. A match is recorded as the sub-step's result
//! instead of submitting again.

use crate::bridge::BridgedToken;
use crate::catalog::Protocol;
use crate::chain::tx::{parse_evm_address, Tx};

use ethers::types::Address;

/// Recent transactions scanned per wallet and chain
pub const MAX_RECENT_TXS: usize = 1000;

/// On-chain effect a sub-step is expected to have
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectedEffect {
    /// Tokens locked (native) or burned (wrapped) at the token bridge
    Lock {
        token_bridge: String,
        token: BridgedToken,
        owner: String,
    },
    /// Guardian signatures staged against a signature set account
    AttestationStaged {
        core_bridge: String,
        signature_set: String,
    },
    /// Tokens released (native) or minted (wrapped) to the owner
    Redeem {
        token_bridge: String,
        token: BridgedToken,
        owner: String,
    },
    PoolOperation { pool: String },
}

impl ExpectedEffect {
    pub fn matches(&self, tx: &Tx) -> bool {
        if !tx.succeeded() {
            return false;
        }
        match self {
            ExpectedEffect::Lock {
                token_bridge,
                token,
                owner,
            } => is_lock_tx(token_bridge, token, owner, tx),
            ExpectedEffect::AttestationStaged {
                core_bridge,
                signature_set,
            } => is_attestation_staged_tx(core_bridge, signature_set, tx),
            ExpectedEffect::Redeem {
                token_bridge,
                token,
                owner,
            } => is_redeem_tx(token_bridge, token, owner, tx),
            ExpectedEffect::PoolOperation { pool } => tx.invokes(pool),
        }
    }
}

/// First candidate that already produced the expected effect
pub fn already_done(expected: &ExpectedEffect, candidates: &[Tx]) -> Option<Tx> {
    candidates.iter().find(|tx| expected.matches(tx)).cloned()
}

/// Every candidate that produced the expected effect, oldest first
pub fn all_done(expected: &ExpectedEffect, candidates: &[Tx]) -> Vec<Tx> {
    let mut matched: Vec<Tx> = candidates
        .iter()
        .filter(|tx| expected.matches(tx))
        .cloned()
        .collect();
    matched.reverse();
    matched
}

pub fn is_lock_tx(token_bridge: &str, token: &BridgedToken, owner: &str, tx: &Tx) -> bool {
    if !tx.invokes(token_bridge) {
        return false;
    }
    match tx.ecosystem.protocol() {
        Protocol::Evm => {
            let recipient = if token.wrapped {
                Some(Address::zero())
            } else {
                parse_evm_address(token_bridge)
            };
            has_erc20_transfer(tx, &token.address, parse_evm_address(owner), recipient)
        }
        Protocol::Solana => tx.token_delta(owner, &token.address) < 0,
    }
}

pub fn is_redeem_tx(token_bridge: &str, token: &BridgedToken, owner: &str, tx: &Tx) -> bool {
    if !tx.invokes(token_bridge) {
        return false;
    }
    match tx.ecosystem.protocol() {
        Protocol::Evm => {
            let sender = if token.wrapped {
                Some(Address::zero())
            } else {
                parse_evm_address(token_bridge)
            };
            has_erc20_transfer(tx, &token.address, sender, parse_evm_address(owner))
        }
        Protocol::Solana => tx.token_delta(owner, &token.address) > 0,
    }
}

/// Staging only exists where signatures are verified in separate
/// transactions
pub fn is_attestation_staged_tx(core_bridge: &str, signature_set: &str, tx: &Tx) -> bool {
    tx.ecosystem.protocol() == Protocol::Solana
        && tx.invokes(core_bridge)
        && tx.references_account(signature_set)
}

fn has_erc20_transfer(tx: &Tx, token: &str, from: Option<Address>, to: Option<Address>) -> bool {
    let (Some(token), Some(from), Some(to)) = (parse_evm_address(token), from, to) else {
        return false;
    };
    tx.erc20_transfers()
        .iter()
        .any(|t| t.token == token && t.from == from && t.to == to)
}
