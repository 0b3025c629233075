//! Error types for the interaction orchestrator

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Invalid route: {0}")]
    InvalidRoute(String),

    #[error("Wallet unavailable for {ecosystem}: {message}")]
    WalletUnavailable { ecosystem: String, message: String },

    #[error("Interaction {active} is already active")]
    Busy { active: String },

    #[error("Transient RPC error on {ecosystem}: {message}")]
    RpcTransient { ecosystem: String, message: String },

    #[error("Attestation not found for chain {chain_id} sequence {sequence} after {attempts} attempts")]
    AttestationNotFound {
        chain_id: u16,
        sequence: u64,
        attempts: u32,
    },

    #[error("Transaction {tx_id} rejected on {ecosystem}: {reason}")]
    OnChainRejected {
        ecosystem: String,
        tx_id: String,
        reason: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Interaction {0} was abandoned")]
    Abandoned(String),

    #[error("Interaction {0} not found")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Check if error is retried automatically
    pub fn is_retryable(&self) -> bool {
        matches!(self, OrchestratorError::RpcTransient { .. })
    }

    /// Stable kind label used for persistence and metrics
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::InvalidRoute(_) => ErrorKind::InvalidRoute,
            OrchestratorError::WalletUnavailable { .. } => ErrorKind::WalletUnavailable,
            OrchestratorError::Busy { .. } => ErrorKind::Busy,
            OrchestratorError::RpcTransient { .. } => ErrorKind::RpcTransient,
            OrchestratorError::AttestationNotFound { .. } => ErrorKind::AttestationNotFound,
            OrchestratorError::OnChainRejected { .. } => ErrorKind::OnChainRejected,
            OrchestratorError::Serialization(_) => ErrorKind::Serialization,
            OrchestratorError::Abandoned(_) => ErrorKind::Abandoned,
            OrchestratorError::NotFound(_)
            | OrchestratorError::InvalidState(_)
            | OrchestratorError::Database(_)
            | OrchestratorError::Config(_)
            | OrchestratorError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn rpc(ecosystem: impl ToString, message: impl ToString) -> Self {
        OrchestratorError::RpcTransient {
            ecosystem: ecosystem.to_string(),
            message: message.to_string(),
        }
    }

    pub(crate) fn wallet(ecosystem: impl ToString, message: impl ToString) -> Self {
        OrchestratorError::WalletUnavailable {
            ecosystem: ecosystem.to_string(),
            message: message.to_string(),
        }
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        OrchestratorError::Serialization(e.to_string())
    }
}

/// Error kinds as recorded on an interaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    InvalidRoute,
    WalletUnavailable,
    Busy,
    RpcTransient,
    AttestationNotFound,
    OnChainRejected,
    Serialization,
    Abandoned,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRoute => "invalid_route",
            ErrorKind::WalletUnavailable => "wallet_unavailable",
            ErrorKind::Busy => "busy",
            ErrorKind::RpcTransient => "rpc_transient",
            ErrorKind::AttestationNotFound => "attestation_not_found",
            ErrorKind::OnChainRejected => "on_chain_rejected",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Abandoned => "abandoned",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Error attached to an interaction stuck in the error state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&OrchestratorError> for InteractionError {
    fn from(e: &OrchestratorError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Result type for orchestrator operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
