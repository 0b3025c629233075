//! Interaction progress events
//!
//! Broadcast by the orchestrator so callers can follow interactions without
//! polling stored state.

use crate::catalog::EcosystemId;
use crate::error::InteractionError;
use crate::interaction::{InteractionType, Phase};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum InteractionEvent {
    /// Interaction planned and stored
    Created {
        id: String,
        interaction_type: InteractionType,
    },

    /// A transaction of a sub-step confirmed
    SubStepConfirmed {
        id: String,
        phase: Phase,
        ecosystem: EcosystemId,
        tx_id: String,
    },

    /// Every sub-step of a phase is done
    PhaseAdvanced { id: String, phase: Phase },

    /// Execution halted; `retry` resumes from the same phase
    Failed { id: String, error: InteractionError },

    Completed { id: String },
}

impl InteractionEvent {
    pub fn id(&self) -> &str {
        match self {
            InteractionEvent::Created { id, .. }
            | InteractionEvent::SubStepConfirmed { id, .. }
            | InteractionEvent::PhaseAdvanced { id, .. }
            | InteractionEvent::Failed { id, .. }
            | InteractionEvent::Completed { id } => id,
        }
    }

    /// Get event name for logs
    pub fn name(&self) -> &'static str {
        match self {
            InteractionEvent::Created { .. } => "created",
            InteractionEvent::SubStepConfirmed { .. } => "sub_step_confirmed",
            InteractionEvent::PhaseAdvanced { .. } => "phase_advanced",
            InteractionEvent::Failed { .. } => "failed",
            InteractionEvent::Completed { .. } => "completed",
        }
    }

    /// Whether no further events follow for this interaction until it is
    /// retried
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            InteractionEvent::Failed { .. } | InteractionEvent::Completed { .. }
        )
    }
}
