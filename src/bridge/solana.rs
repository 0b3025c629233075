//! Solana side of the token bridge
//!
//! Redeeming on Solana takes several transactions: guardian signatures are
//! verified in batches into a signature set account, the attestation is
//! posted, and only then can the transfer be completed.

use crate::chain::tx::{Instruction, Tx};
use crate::error::{OrchestratorError, OrchestratorResult};

use lazy_static::lazy_static;
use regex::Regex;
use sha3::{Digest, Keccak256};

/// Guardian signatures verified per staging transaction
pub const MAX_SIGNATURES_PER_TX: usize = 7;

/// Attestation header: version, guardian set index, signature count
const HEADER_LEN: usize = 6;
/// Guardian index plus a 65-byte signature
const SIGNATURE_LEN: usize = 66;

lazy_static! {
    static ref SEQUENCE_LOG: Regex = Regex::new(r"^Program log: Sequence: (\d+)$").unwrap();
}

/// Sequence logged by the core bridge in a lock transaction
pub fn parse_sequence(tx: &Tx) -> OrchestratorResult<u64> {
    tx.log_messages()
        .iter()
        .find_map(|line| SEQUENCE_LOG.captures(line))
        .and_then(|c| c[1].parse().ok())
        .ok_or_else(|| OrchestratorError::Internal(format!("no sequence logged in tx {}", tx.id)))
}

/// Signature set account used to stage one transfer's attestation
///
/// Derived from the transfer identity so a restarted interaction stages
/// into the same account.
pub fn signature_set_address(interaction_id: &str, chain_id: u16, sequence: u64) -> String {
    let mut hasher = Keccak256::new();
    hasher.update(b"signature_set");
    hasher.update(interaction_id.as_bytes());
    hasher.update(chain_id.to_be_bytes());
    hasher.update(sequence.to_be_bytes());
    bs58::encode(hasher.finalize()).into_string()
}

/// Number of guardian signatures carried by an attestation
pub fn signature_count(attestation: &[u8]) -> OrchestratorResult<usize> {
    if attestation.len() < HEADER_LEN {
        return Err(OrchestratorError::Internal("attestation too short".to_string()));
    }
    let count = attestation[5] as usize;
    if attestation.len() < HEADER_LEN + count * SIGNATURE_LEN {
        return Err(OrchestratorError::Internal(format!(
            "attestation truncated: {} signatures in {} bytes",
            count,
            attestation.len()
        )));
    }
    Ok(count)
}

/// Staging transactions, in order: signature batches then the post
pub fn staging_steps(
    core_bridge: &str,
    signature_set: &str,
    attestation: &[u8],
) -> OrchestratorResult<Vec<Vec<Instruction>>> {
    let indices: Vec<u8> = (0..signature_count(attestation)?).map(|i| i as u8).collect();

    let mut steps: Vec<Vec<Instruction>> = indices
        .chunks(MAX_SIGNATURES_PER_TX)
        .map(|batch| {
            vec![Instruction::VerifySignatures {
                core_bridge: core_bridge.to_string(),
                signature_set: signature_set.to_string(),
                attestation: attestation.to_vec(),
                signature_indices: batch.to_vec(),
            }]
        })
        .collect();

    steps.push(vec![Instruction::PostAttestation {
        core_bridge: core_bridge.to_string(),
        signature_set: signature_set.to_string(),
        attestation: attestation.to_vec(),
    }]);

    Ok(steps)
}

/// Approve the bridge to move tokens out of `token_account`, then lock
pub fn lock_instructions(
    token_bridge: &str,
    token_account: &str,
    mint: &str,
    amount: u128,
    target_chain: u16,
    recipient: [u8; 32],
    nonce: u32,
) -> Vec<Instruction> {
    vec![
        Instruction::Approve {
            token: token_account.to_string(),
            spender: token_bridge.to_string(),
            amount,
        },
        Instruction::BridgeLock {
            token_bridge: token_bridge.to_string(),
            token: mint.to_string(),
            amount,
            target_chain,
            recipient,
            nonce,
        },
    ]
}

/// 32-byte bridge recipient for a base58 Solana account
pub fn recipient(account: &str) -> OrchestratorResult<[u8; 32]> {
    let bytes = bs58::decode(account)
        .into_vec()
        .map_err(|e| OrchestratorError::Internal(format!("invalid Solana account {}: {}", account, e)))?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| OrchestratorError::Internal(format!("Solana account {} is not 32 bytes", account)))
}
