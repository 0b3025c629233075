//! Process-wide single active interaction

use crate::error::{OrchestratorError, OrchestratorResult};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// The interaction holding the guard and the activation it holds it under
#[derive(Debug)]
struct Activation {
    id: String,
    generation: u64,
}

/// Allows at most one interaction to execute at a time
#[derive(Debug, Default)]
pub struct ConcurrencyGuard {
    active: Mutex<Option<Activation>>,
    generations: AtomicU64,
}

impl ConcurrencyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<Activation>> {
        // The slot is replaced whole; a panic elsewhere cannot leave it torn
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Generation `id` is active under, activating it if the slot is free
    fn activate(&self, id: &str) -> Option<u64> {
        let mut active = self.slot();
        match active.as_ref() {
            Some(current) if current.id == id => Some(current.generation),
            Some(_) => None,
            None => {
                let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
                *active = Some(Activation {
                    id: id.to_string(),
                    generation,
                });
                debug!("Interaction {} is now active ({})", id, generation);
                Some(generation)
            }
        }
    }

    /// Mark `id` active unless another interaction is
    ///
    /// Activating the id that is already active succeeds.
    pub fn try_activate(&self, id: &str) -> bool {
        self.activate(id).is_some()
    }

    /// Clear the slot if `id` holds it
    pub fn release(&self, id: &str) {
        let mut active = self.slot();
        if active.as_ref().is_some_and(|current| current.id == id) {
            *active = None;
            debug!("Interaction {} released", id);
        }
    }

    /// Clear the slot only if it still holds this activation
    fn release_generation(&self, generation: u64) {
        let mut active = self.slot();
        if let Some(current) = active.as_ref().filter(|c| c.generation == generation) {
            debug!("Interaction {} released ({})", current.id, generation);
            *active = None;
        }
    }

    pub fn active(&self) -> Option<String> {
        self.slot().as_ref().map(|current| current.id.clone())
    }

    /// Activate `id` for the lifetime of the returned lease
    ///
    /// Dropping the lease releases only the activation it was granted. If
    /// the slot was released explicitly and taken again meanwhile, the new
    /// holder keeps it.
    pub fn acquire(self: &Arc<Self>, id: &str) -> OrchestratorResult<Lease> {
        if let Some(generation) = self.activate(id) {
            Ok(Lease {
                guard: self.clone(),
                id: id.to_string(),
                generation,
            })
        } else {
            Err(OrchestratorError::Busy {
                active: self.active().unwrap_or_default(),
            })
        }
    }
}

/// Releases the guard when dropped
#[derive(Debug)]
pub struct Lease {
    guard: Arc<ConcurrencyGuard>,
    id: String,
    generation: u64,
}

impl Lease {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.guard.release_generation(self.generation);
    }
}
