//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Interaction lifecycle and errors
//! - Transaction submission and idempotent skips
//! - Attestation polling
//! - History retention
//!
//! Collectors live in the default registry; `render` produces the text
//! exposition for whatever endpoint the host application serves.

use crate::catalog::{EcosystemId, Env};
use crate::error::{ErrorKind, OrchestratorError, OrchestratorResult};
use crate::interaction::{InteractionFamily, InteractionType, Phase};

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::time::Duration;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_HEALTHY: GaugeVec = register_gauge_vec!(
        "orchestrator_chain_healthy",
        "Chain RPC health (1=healthy, 0=unreachable)",
        &["ecosystem"]
    ).unwrap();

    pub static ref RPC_RETRIES: CounterVec = register_counter_vec!(
        "orchestrator_rpc_retries_total",
        "Total transient RPC errors retried",
        &["operation"]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "orchestrator_transactions_submitted_total",
        "Total transactions submitted",
        &["ecosystem"]
    ).unwrap();

    pub static ref TX_SKIPPED: CounterVec = register_counter_vec!(
        "orchestrator_transactions_skipped_total",
        "Total sub-steps found already done on chain",
        &["ecosystem"]
    ).unwrap();

    // Bridge metrics
    pub static ref ATTESTATION_POLLS: CounterVec = register_counter_vec!(
        "orchestrator_attestation_polls_total",
        "Total guardian attestation polls",
        &["chain_id"]
    ).unwrap();

    pub static ref ATTESTATION_WAIT: HistogramVec = register_histogram_vec!(
        "orchestrator_attestation_wait_seconds",
        "Time from first poll to signed attestation",
        &["chain_id"],
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 900.0]
    ).unwrap();

    pub static ref TRANSFERS_COMPLETED: CounterVec = register_counter_vec!(
        "orchestrator_transfers_completed_total",
        "Total bridge transfers redeemed",
        &["source", "destination"]
    ).unwrap();

    // Interaction metrics
    pub static ref INTERACTIONS_CREATED: CounterVec = register_counter_vec!(
        "orchestrator_interactions_created_total",
        "Total interactions created",
        &["interaction_type"]
    ).unwrap();

    pub static ref PHASE_TRANSITIONS: CounterVec = register_counter_vec!(
        "orchestrator_phase_transitions_total",
        "Total phases completed",
        &["interaction_type", "phase"]
    ).unwrap();

    pub static ref INTERACTION_ERRORS: CounterVec = register_counter_vec!(
        "orchestrator_interaction_errors_total",
        "Total interactions halted in error",
        &["kind"]
    ).unwrap();

    // History metrics
    pub static ref RECORDS_SKIPPED: CounterVec = register_counter_vec!(
        "orchestrator_history_records_skipped_total",
        "Total stored interactions that failed to load",
        &["env"]
    ).unwrap();

    pub static ref RETENTION_EVICTIONS: CounterVec = register_counter_vec!(
        "orchestrator_history_evictions_total",
        "Total interactions evicted by retention",
        &["env", "family"]
    ).unwrap();
}

/// Text exposition of every registered metric
pub fn render() -> OrchestratorResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| OrchestratorError::Internal(e.to_string()))
}

// Helper functions to record metrics

pub fn record_chain_health(ecosystem: EcosystemId, healthy: bool) {
    CHAIN_HEALTHY
        .with_label_values(&[ecosystem.as_str()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_rpc_retry(operation: &str) {
    RPC_RETRIES.with_label_values(&[operation]).inc();
}

pub fn record_tx_submitted(ecosystem: EcosystemId) {
    TX_SUBMITTED.with_label_values(&[ecosystem.as_str()]).inc();
}

pub fn record_tx_skipped(ecosystem: EcosystemId) {
    TX_SKIPPED.with_label_values(&[ecosystem.as_str()]).inc();
}

pub fn record_attestation_poll(chain_id: u16) {
    ATTESTATION_POLLS
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_attestation_wait(chain_id: u16, waited: Duration) {
    ATTESTATION_WAIT
        .with_label_values(&[&chain_id.to_string()])
        .observe(waited.as_secs_f64());
}

pub fn record_transfer_completed(source: EcosystemId, destination: EcosystemId) {
    TRANSFERS_COMPLETED
        .with_label_values(&[source.as_str(), destination.as_str()])
        .inc();
}

pub fn record_interaction_created(interaction_type: InteractionType) {
    INTERACTIONS_CREATED
        .with_label_values(&[interaction_type.as_str()])
        .inc();
}

pub fn record_phase(interaction_type: InteractionType, phase: Phase) {
    PHASE_TRANSITIONS
        .with_label_values(&[interaction_type.as_str(), phase.as_str()])
        .inc();
}

pub fn record_interaction_error(kind: ErrorKind) {
    INTERACTION_ERRORS.with_label_values(&[kind.as_str()]).inc();
}

pub fn record_record_skipped(env: Env) {
    RECORDS_SKIPPED.with_label_values(&[env.as_str()]).inc();
}

pub fn record_retention_eviction(env: Env, family: InteractionFamily) {
    RETENTION_EVICTIONS
        .with_label_values(&[env.as_str(), family.as_str()])
        .inc();
}
