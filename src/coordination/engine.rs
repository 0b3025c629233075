//! Phase state machine driving interactions to completion

use super::guard::{ConcurrencyGuard, Lease};
use crate::amount::Amount;
use crate::bridge::{self, BridgeAdapter, BridgeEvent, EventSink, HttpGuardianClient};
use crate::catalog::{Catalog, EcosystemId, Protocol};
use crate::chain::{ChainRegistry, Instruction, RetryPolicy, Tx, TxRunner};
use crate::config::{OrchestratorConfig, Settings};
use crate::error::{InteractionError, OrchestratorError, OrchestratorResult};
use crate::events::InteractionEvent;
use crate::idempotency::{self, ExpectedEffect};
use crate::interaction::state::Direction;
use crate::interaction::{
    new_interaction_id, Interaction, InteractionParams, InteractionState, Phase,
};
use crate::metrics;
use crate::pool::{self, OperationSpec};
use crate::state::{History, HistoryStore};

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Confirmed bridge sub-steps buffered between transfers and the writer
const EVENT_CHANNEL_CAPACITY: usize = 64;

const BROADCAST_CAPACITY: usize = 256;

/// Cross-chain interaction orchestrator
pub struct Orchestrator {
    catalog: Arc<Catalog>,
    /// Chains and connected wallets
    registry: Arc<ChainRegistry>,
    bridge: Arc<BridgeAdapter>,
    /// Persistence with per-id write serialization
    history: Arc<History>,
    guard: Arc<ConcurrencyGuard>,
    policy: RetryPolicy,
    recent_tx_window: usize,
    /// Known interactions of the catalog's environment
    interactions: DashMap<String, InteractionState>,
    /// Abandon flags of the current run of each interaction
    cancellations: DashMap<String, Arc<AtomicBool>>,
    /// Held by the run of an interaction from start to finish
    runs: DashMap<String, Arc<Mutex<()>>>,
    events: broadcast::Sender<InteractionEvent>,
}

impl Orchestrator {
    pub fn new(
        catalog: Arc<Catalog>,
        registry: Arc<ChainRegistry>,
        bridge: Arc<BridgeAdapter>,
        history: Arc<History>,
        config: &OrchestratorConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            catalog,
            registry,
            bridge,
            history,
            guard: Arc::new(ConcurrencyGuard::new()),
            policy: RetryPolicy::from(config),
            recent_tx_window: config.recent_tx_window,
            interactions: DashMap::new(),
            cancellations: DashMap::new(),
            runs: DashMap::new(),
            events,
        }
    }

    /// Create an orchestrator talking to the configured guardian network
    pub async fn from_settings(
        settings: &Settings,
        catalog: Arc<Catalog>,
        registry: Arc<ChainRegistry>,
        store: Arc<dyn HistoryStore>,
    ) -> OrchestratorResult<Self> {
        if settings.orchestrator.env != catalog.env() {
            return Err(OrchestratorError::Config(format!(
                "configured for {} but the catalog is for {}",
                settings.orchestrator.env.as_str(),
                catalog.env().as_str()
            )));
        }

        let guardian = HttpGuardianClient::new(&settings.guardian)?;
        let bridge = BridgeAdapter::new(
            Arc::new(guardian),
            Duration::from_millis(settings.guardian.poll_interval_ms),
        );
        let history = History::new(store, settings.orchestrator.retention_cap);

        let orchestrator = Self::new(
            catalog,
            registry,
            Arc::new(bridge),
            Arc::new(history),
            &settings.orchestrator,
        );
        orchestrator.load().await?;
        Ok(orchestrator)
    }

    pub fn get(&self, id: &str) -> Option<InteractionState> {
        self.interactions.get(id).map(|s| s.clone())
    }

    /// Known interactions, oldest first
    pub fn list(&self) -> Vec<InteractionState> {
        let mut states: Vec<InteractionState> =
            self.interactions.iter().map(|s| s.value().clone()).collect();
        states.sort_by_key(|s| s.interaction.submitted_at);
        states
    }

    pub fn guard(&self) -> &Arc<ConcurrencyGuard> {
        &self.guard
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InteractionEvent> {
        self.events.subscribe()
    }

    /// Plan and store a new interaction; nothing is submitted yet
    pub async fn create(&self, params: InteractionParams) -> OrchestratorResult<String> {
        let interaction = Interaction {
            id: new_interaction_id(),
            env: self.catalog.env(),
            pool_ids: Vec::new(),
            connected_wallets: Default::default(),
            submitted_at: Utc::now(),
            params,
        };
        let mut state = InteractionState::plan(&self.catalog, interaction)?;

        let ecosystems = state.ecosystems();
        for ecosystem in &ecosystems {
            self.registry.chain(*ecosystem)?;
            self.registry.wallet(*ecosystem)?;
        }
        state.interaction.connected_wallets = self
            .registry
            .connected_wallets()
            .into_iter()
            .filter(|(eco, _)| ecosystems.contains(eco))
            .collect();

        let id = state.id().to_string();
        let interaction_type = state.interaction.interaction_type();

        for evicted in self.history.insert(&state).await? {
            self.interactions.remove(&evicted);
            self.cancellations.remove(&evicted);
            self.runs.remove(&evicted);
        }
        self.interactions.insert(id.clone(), state);

        info!(
            "Created {} interaction {}",
            interaction_type.as_str(),
            id
        );
        metrics::record_interaction_created(interaction_type);
        self.emit(InteractionEvent::Created {
            id: id.clone(),
            interaction_type,
        });
        Ok(id)
    }

    /// Execute an interaction until it is done or halts in error
    ///
    /// Returns the last completed phase.
    pub async fn run(&self, id: &str) -> OrchestratorResult<Phase> {
        let (_running, _lease) = self.begin(id).await?;
        let state = self.state(id)?;
        if state.is_done() {
            return Ok(Phase::Done);
        }
        if let Some(error) = &state.error {
            return Err(OrchestratorError::InvalidState(format!(
                "interaction {} halted with {}: retry it to resume",
                id,
                error.kind.as_str()
            )));
        }
        self.execute(id).await
    }

    /// Clear the recorded error and resume from the phase that failed
    ///
    /// A run of the same interaction that was abandoned but has not stopped
    /// yet is waited for first.
    pub async fn retry(&self, id: &str) -> OrchestratorResult<Phase> {
        let (_running, _lease) = self.begin(id).await?;
        let state = self.state(id)?;
        if state.is_done() {
            return Ok(Phase::Done);
        }
        if state.error.is_some() {
            info!("Retrying interaction {} after {}", id, state.phase.as_str());
            self.update(id, |s| s.error = None).await?;
        }
        self.execute(id).await
    }

    /// Run an interaction on its own task
    pub fn spawn(self: &Arc<Self>, id: &str) -> JoinHandle<OrchestratorResult<Phase>> {
        let orchestrator = self.clone();
        let id = id.to_string();
        tokio::spawn(async move { orchestrator.run(&id).await })
    }

    /// Stop an interaction before its next submission or attestation poll
    ///
    /// The guard is released immediately and the interaction is left in
    /// error, resumable with `retry`.
    pub async fn abandon(&self, id: &str) -> OrchestratorResult<()> {
        let state = self.state(id)?;
        if state.is_done() {
            return Err(OrchestratorError::InvalidState(format!(
                "interaction {} is already done",
                id
            )));
        }

        if let Some((_, cancelled)) = self.cancellations.remove(id) {
            cancelled.store(true, Ordering::SeqCst);
        }
        self.guard.release(id);

        warn!("Interaction {} abandoned at {}", id, state.phase.as_str());
        self.fail(id, &OrchestratorError::Abandoned(id.to_string()))
            .await;
        Ok(())
    }

    /// Forget an interaction and delete its record
    pub async fn reset(&self, id: &str) -> OrchestratorResult<()> {
        let running = self
            .runs
            .get(id)
            .is_some_and(|run| run.try_lock().is_err());
        if running || self.guard.active().as_deref() == Some(id) {
            return Err(OrchestratorError::InvalidState(format!(
                "interaction {} is running",
                id
            )));
        }
        self.history.delete(id).await?;
        self.interactions.remove(id);
        self.cancellations.remove(id);
        self.runs.remove(id);
        info!("Interaction {} reset", id);
        Ok(())
    }

    /// Re-hydrate stored interactions of the catalog's environment
    ///
    /// Interactions already in memory are kept as they are. Returns the
    /// number loaded.
    pub async fn load(&self) -> OrchestratorResult<usize> {
        let stored = self.history.get(self.catalog.env(), &self.catalog).await?;
        let mut loaded = 0;
        for state in stored {
            if self.interactions.contains_key(state.id()) {
                continue;
            }
            debug!("Loaded interaction {} at {}", state.id(), state.phase.as_str());
            self.interactions.insert(state.id().to_string(), state);
            loaded += 1;
        }
        info!("Loaded {} stored interactions", loaded);
        Ok(loaded)
    }

    /// Wait for any earlier run of `id` to finish, then take the guard
    ///
    /// The run lock is taken first so a lease is never granted to two runs
    /// of the same interaction.
    async fn begin(&self, id: &str) -> OrchestratorResult<(OwnedMutexGuard<()>, Lease)> {
        self.state(id)?;
        let run = self.runs.entry(id.to_string()).or_default().clone();
        let running = run.lock_owned().await;
        let lease = self.guard.acquire(id)?;
        Ok((running, lease))
    }

    fn state(&self, id: &str) -> OrchestratorResult<InteractionState> {
        self.get(id)
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))
    }

    fn emit(&self, event: InteractionEvent) {
        if self.events.send(event).is_err() {
            debug!("No event subscribers");
        }
    }

    /// Mutate the in-memory state and persist it under the id's lock
    async fn update<F>(&self, id: &str, f: F) -> OrchestratorResult<InteractionState>
    where
        F: FnOnce(&mut InteractionState),
    {
        let _lock = self.history.lock(id).await;
        let snapshot = {
            let mut state = self
                .interactions
                .get_mut(id)
                .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;
            f(state.value_mut());
            state.clone()
        };
        self.history.put_unlocked(&snapshot).await?;
        Ok(snapshot)
    }

    async fn execute(&self, id: &str) -> OrchestratorResult<Phase> {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.cancellations.insert(id.to_string(), cancelled.clone());
        let runner = TxRunner::new(
            self.registry.clone(),
            self.policy.clone(),
            id,
            self.recent_tx_window,
            cancelled.clone(),
        );

        let result = self.drive(&runner).await;
        self.cancellations
            .remove_if(id, |_, flag| Arc::ptr_eq(flag, &cancelled));

        match result {
            Ok(phase) => Ok(phase),
            // Recorded by `abandon` already
            Err(e @ OrchestratorError::Abandoned(_)) => {
                info!("Abandoned run of {} stopped", id);
                Err(e)
            }
            Err(e) => {
                self.fail(id, &e).await;
                Err(e)
            }
        }
    }

    async fn drive(&self, runner: &TxRunner) -> OrchestratorResult<Phase> {
        let id = runner.interaction_id();
        loop {
            runner.check_cancelled()?;
            let state = self.state(id)?;
            let Some(phase) = state.next_phase() else {
                return Ok(state.phase);
            };

            debug!("Interaction {} entering {}", id, phase.as_str());
            match phase {
                Phase::AccountsReady => self.prepare_accounts(runner).await?,
                Phase::InboundTransferDone => {
                    self.transfer_phase(runner, Direction::Inbound).await?
                }
                Phase::PoolOperationsDone => self.pool_phase(runner).await?,
                Phase::OutboundTransferDone => {
                    self.resolve_outbound(id).await?;
                    self.transfer_phase(runner, Direction::Outbound).await?
                }
                Phase::Initiated | Phase::Done => {}
            }
            self.advance(id, phase).await?;
        }
    }

    async fn advance(&self, id: &str, phase: Phase) -> OrchestratorResult<()> {
        let state = self.update(id, |s| s.phase = phase).await?;
        let interaction_type = state.interaction.interaction_type();

        info!("Interaction {} reached {}", id, phase.as_str());
        metrics::record_phase(interaction_type, phase);
        self.emit(InteractionEvent::PhaseAdvanced {
            id: id.to_string(),
            phase,
        });
        if phase == Phase::Done {
            self.emit(InteractionEvent::Completed { id: id.to_string() });
        }
        Ok(())
    }

    async fn fail(&self, id: &str, e: &OrchestratorError) {
        let recorded = InteractionError::from(e);
        error!("Interaction {} failed: {}", id, e);
        metrics::record_interaction_error(recorded.kind);

        if let Err(persist) = self.update(id, |s| s.error = Some(recorded.clone())).await {
            error!("Failed to record error of interaction {}: {}", id, persist);
        }
        self.emit(InteractionEvent::Failed {
            id: id.to_string(),
            error: recorded,
        });
    }

    async fn prepare_accounts(&self, runner: &TxRunner) -> OrchestratorResult<()> {
        let id = runner.interaction_id();
        let state = self.state(id)?;

        for (index, step) in state.steps.accounts.iter().enumerate() {
            if step.account.is_some() {
                continue;
            }
            let ecosystem = step.ecosystem;
            let mint = self.token_address(&step.token_id, ecosystem)?;
            let owner = runner.owner(ecosystem)?;

            let (account, tx_id) = match runner.token_account(ecosystem, &owner, &mint).await? {
                Some(account) => {
                    debug!("Token account {} for {} exists", account, step.token_id);
                    (account, None)
                }
                None => {
                    let tx = runner
                        .execute(ecosystem, vec![Instruction::CreateTokenAccount { mint: mint.clone() }])
                        .await?;
                    let account = runner
                        .token_account(ecosystem, &owner, &mint)
                        .await?
                        .ok_or_else(|| {
                            OrchestratorError::Internal(format!(
                                "token account for {} missing after tx {}",
                                step.token_id, tx.id
                            ))
                        })?;
                    info!("Created {} token account {} on {}", step.token_id, account, ecosystem);
                    (account, Some(tx.id))
                }
            };

            self.update(id, |s| {
                let step = &mut s.steps.accounts[index];
                step.account = Some(account);
                step.tx_id = tx_id.clone();
            })
            .await?;
            if let Some(tx_id) = tx_id {
                self.emit(InteractionEvent::SubStepConfirmed {
                    id: id.to_string(),
                    phase: Phase::AccountsReady,
                    ecosystem,
                    tx_id,
                });
            }
        }
        Ok(())
    }

    /// Bridge every pending transfer of one direction concurrently
    ///
    /// Confirmed sub-steps stream through one channel to a single writer so
    /// each is persisted as soon as it lands.
    async fn transfer_phase(&self, runner: &TxRunner, direction: Direction) -> OrchestratorResult<()> {
        let id = runner.interaction_id();
        let state = self.state(id)?;
        let pending: Vec<(usize, bridge::Transfer, bridge::BridgeProgress)> = state
            .steps
            .transfers(direction)
            .iter()
            .enumerate()
            .filter(|(_, step)| !step.is_complete())
            .map(|(index, step)| (index, step.transfer.clone(), step.progress.clone()))
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let bridging = async move {
            let transfers = pending.iter().map(|(index, transfer, progress)| {
                let sink = EventSink::new(*index, tx.clone());
                async move { self.bridge.bridge(runner, transfer, progress, &sink).await }
            });
            let results = join_all(transfers).await;
            drop(tx);
            results
        };

        let writer = async {
            let mut written = Ok(());
            while let Some((index, event)) = rx.recv().await {
                if let Err(e) = self.record_bridge_event(id, direction, index, &event).await {
                    error!("Failed to persist bridge progress of {}: {}", id, e);
                    if written.is_ok() {
                        written = Err(e);
                    }
                }
            }
            written
        };

        let (results, written) = tokio::join!(bridging, writer);
        written?;
        for result in results {
            result?;
        }
        Ok(())
    }

    async fn record_bridge_event(
        &self,
        id: &str,
        direction: Direction,
        index: usize,
        event: &BridgeEvent,
    ) -> OrchestratorResult<()> {
        let state = self
            .update(id, |s| {
                if let Some(step) = s.steps.transfers_mut(direction).get_mut(index) {
                    step.progress.apply(event);
                }
            })
            .await?;

        let transfer = &state.steps.transfers(direction)[index].transfer;
        let (ecosystem, tx_id) = match event {
            BridgeEvent::Locked { tx_id, .. } => (transfer.source, tx_id),
            BridgeEvent::Staged { tx_id } | BridgeEvent::Redeemed { tx_id } => {
                (transfer.destination, tx_id)
            }
        };
        self.emit(InteractionEvent::SubStepConfirmed {
            id: id.to_string(),
            phase: direction.phase(),
            ecosystem,
            tx_id: tx_id.clone(),
        });
        Ok(())
    }

    async fn pool_phase(&self, runner: &TxRunner) -> OrchestratorResult<()> {
        let id = runner.interaction_id();
        let step_count = self.state(id)?.steps.pool.len();

        for index in 0..step_count {
            // Reload so later legs see what earlier legs produced
            let state = self.state(id)?;
            if state.steps.pool[index].tx_id.is_some() {
                continue;
            }
            let ecosystem = state.pool_ecosystem;
            let owner = runner.owner(ecosystem)?;
            let ops = state.step_operations(index)?;

            let tx = match self.find_pool_tx(runner, &ops, ecosystem, &state.tx_ids()).await? {
                Some(tx) => {
                    info!("Pool tx {} already on {}, skipping", tx.id, ecosystem);
                    metrics::record_tx_skipped(ecosystem);
                    tx
                }
                None => {
                    if ecosystem.protocol() == Protocol::Evm {
                        self.approve_pool_inputs(runner, &ops, ecosystem).await?;
                    }
                    let mut confirmed = None;
                    for pool_tx in pool::build_route(&self.catalog, &ops, ecosystem, id)? {
                        confirmed = Some(runner.execute(ecosystem, pool_tx.instructions).await?);
                    }
                    confirmed.ok_or_else(|| {
                        OrchestratorError::Internal(format!("pool step {} of {} is empty", index, id))
                    })?
                }
            };

            let outputs = self.observed_outputs(&ops, ecosystem, &owner, &tx)?;
            self.update(id, |s| {
                let step = &mut s.steps.pool[index];
                step.tx_id = Some(tx.id.clone());
                step.outputs = outputs;
            })
            .await?;
            self.emit(InteractionEvent::SubStepConfirmed {
                id: id.to_string(),
                phase: Phase::PoolOperationsDone,
                ecosystem,
                tx_id: tx.id,
            });
        }
        Ok(())
    }

    /// Confirmed pool transaction of this step not yet recorded elsewhere
    async fn find_pool_tx(
        &self,
        runner: &TxRunner,
        ops: &[OperationSpec],
        ecosystem: EcosystemId,
        recorded: &[String],
    ) -> OrchestratorResult<Option<Tx>> {
        let Some(last) = ops.last() else {
            return Ok(None);
        };
        let pool = self.catalog.pool_by_id(&last.pool_id).ok_or_else(|| {
            OrchestratorError::InvalidRoute(format!("unknown pool {}", last.pool_id))
        })?;

        let candidates: Vec<Tx> = runner
            .candidates(ecosystem)
            .await?
            .into_iter()
            .filter(|tx| !recorded.contains(&tx.id))
            .collect();
        Ok(idempotency::already_done(
            &ExpectedEffect::PoolOperation {
                pool: pool.address.clone(),
            },
            &candidates,
        ))
    }

    async fn approve_pool_inputs(
        &self,
        runner: &TxRunner,
        ops: &[OperationSpec],
        ecosystem: EcosystemId,
    ) -> OrchestratorResult<()> {
        for op in ops {
            let pool = self.catalog.pool_by_id(&op.pool_id).ok_or_else(|| {
                OrchestratorError::InvalidRoute(format!("unknown pool {}", op.pool_id))
            })?;
            for amount in op.spent_amounts() {
                if amount.is_zero() {
                    continue;
                }
                let token = self.token_address(amount.token_id(), ecosystem)?;
                let approvals = bridge::evm::approval_instructions(
                    runner,
                    ecosystem,
                    &token,
                    &pool.address,
                    amount.to_atomic(ecosystem)?,
                )
                .await?;
                for approval in approvals {
                    runner.execute(ecosystem, vec![approval]).await?;
                }
            }
        }
        Ok(())
    }

    /// Balance increases of the operations' output tokens in `tx`
    fn observed_outputs(
        &self,
        ops: &[OperationSpec],
        ecosystem: EcosystemId,
        owner: &str,
        tx: &Tx,
    ) -> OrchestratorResult<Vec<Amount>> {
        let mut token_ids: Vec<String> = Vec::new();
        for op in ops {
            for token_id in op.output_token_ids(&self.catalog)? {
                if !token_ids.contains(&token_id) {
                    token_ids.push(token_id);
                }
            }
        }

        let mut outputs = Vec::new();
        for token_id in token_ids {
            let token = self.token(&token_id)?;
            let address = self.token_address(&token_id, ecosystem)?;
            let delta = tx.token_delta(owner, &address);
            if delta > 0 {
                outputs.push(Amount::from_atomic(token, delta as u128, ecosystem)?);
            }
        }
        Ok(outputs)
    }

    /// Replace declared outbound minimums with what the pool paid out
    async fn resolve_outbound(&self, id: &str) -> OrchestratorResult<()> {
        let state = self.state(id)?;
        if state.steps.outbound.iter().all(|s| s.amount_resolved) {
            return Ok(());
        }

        let observed: Vec<&Amount> = state
            .steps
            .pool
            .iter()
            .rev()
            .flat_map(|s| s.outputs.iter())
            .collect();

        let mut resolved = Vec::new();
        for (index, step) in state.steps.outbound.iter().enumerate() {
            if step.amount_resolved {
                continue;
            }
            let transfer = &step.transfer;
            let amount = match observed
                .iter()
                .find(|a| a.token_id() == transfer.amount.token_id())
            {
                Some(output) => output.bridgeable(transfer.source, transfer.destination)?,
                None => {
                    warn!(
                        "No observed {} output for {}, bridging the declared minimum {}",
                        transfer.amount.token_id(),
                        id,
                        transfer.amount
                    );
                    transfer.amount.clone()
                }
            };
            if amount.is_zero() {
                info!("Outbound transfer {} of {} resolved to nothing, skipping", index, id);
            } else {
                debug!("Outbound transfer {} of {} resolved to {}", index, id, amount);
            }
            resolved.push((index, amount));
        }

        self.update(id, |s| {
            for (index, amount) in resolved {
                let step = &mut s.steps.outbound[index];
                step.transfer.amount = amount;
                step.amount_resolved = true;
            }
        })
        .await?;
        Ok(())
    }

    fn token(&self, token_id: &str) -> OrchestratorResult<Arc<crate::catalog::TokenSpec>> {
        self.catalog
            .token_by_id(token_id)
            .ok_or_else(|| OrchestratorError::InvalidRoute(format!("unknown token {}", token_id)))
    }

    fn token_address(&self, token_id: &str, ecosystem: EcosystemId) -> OrchestratorResult<String> {
        self.token(token_id)?
            .details_on(ecosystem)
            .map(|d| d.address.clone())
            .ok_or_else(|| {
                OrchestratorError::InvalidRoute(format!("{} is not available on {}", token_id, ecosystem))
            })
    }
}
