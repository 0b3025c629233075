//! EVM side of the token bridge

use crate::chain::tx::{event_topic, parse_evm_address, Instruction, Tx};
use crate::catalog::EcosystemId;
use crate::chain::TxRunner;
use crate::error::{OrchestratorError, OrchestratorResult};

use ethers::types::{H256, U256};
use lazy_static::lazy_static;
use tracing::debug;

lazy_static! {
    static ref LOG_MESSAGE_PUBLISHED: H256 =
        event_topic("LogMessagePublished(address,uint64,uint32,bytes,uint8)");
}

/// Approvals needed before `spender` can pull `amount` of `token`
///
/// Tokens that refuse to change a non-zero allowance get it reset to zero
/// first.
pub async fn approval_instructions(
    runner: &TxRunner,
    ecosystem: EcosystemId,
    token: &str,
    spender: &str,
    amount: u128,
) -> OrchestratorResult<Vec<Instruction>> {
    let allowance = runner.allowance(ecosystem, token, spender).await?;
    debug!(
        "Allowance of {} for {} on {}: {}",
        token, spender, ecosystem, allowance
    );

    if allowance >= amount {
        return Ok(Vec::new());
    }

    let approve = |amount| Instruction::Approve {
        token: token.to_string(),
        spender: spender.to_string(),
        amount,
    };

    Ok(if allowance > 0 {
        vec![approve(0), approve(amount)]
    } else {
        vec![approve(amount)]
    })
}

/// Sequence published by the core bridge in a lock transaction
pub fn parse_sequence(tx: &Tx, core_bridge: &str) -> OrchestratorResult<u64> {
    let core_bridge = parse_evm_address(core_bridge).ok_or_else(|| {
        OrchestratorError::Config(format!("invalid core bridge address {}", core_bridge))
    })?;

    tx.logs()
        .iter()
        .find(|log| {
            log.address == core_bridge
                && log.topics.first() == Some(&*LOG_MESSAGE_PUBLISHED)
                && log.data.len() >= 32
        })
        .map(|log| U256::from_big_endian(&log.data[..32]).low_u64())
        .ok_or_else(|| {
            OrchestratorError::Internal(format!("no message published in tx {}", tx.id))
        })
}

/// 32-byte bridge recipient for an EVM address
pub fn recipient(address: &str) -> OrchestratorResult<[u8; 32]> {
    let address = parse_evm_address(address)
        .ok_or_else(|| OrchestratorError::Internal(format!("invalid EVM address {}", address)))?;
    let mut recipient = [0u8; 32];
    recipient[12..].copy_from_slice(address.as_bytes());
    Ok(recipient)
}
