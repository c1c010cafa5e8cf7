use stackgate_schema::EnvironmentId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

/// Serializes pipeline runs for one environment.
///
/// Not reentrant: locking a gate twice from the same thread deadlocks.
#[derive(Debug)]
pub struct Gate {
    id: EnvironmentId,
    lock: Mutex<()>,
}

/// Held for the duration of one pipeline run. Dropping it opens the gate.
#[must_use = "the gate is released as soon as the guard is dropped"]
pub struct GateGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl Gate {
    fn new(id: EnvironmentId) -> Self {
        Self {
            id,
            lock: Mutex::new(()),
        }
    }

    #[inline]
    pub fn id(&self) -> EnvironmentId {
        self.id
    }

    /// Block until no other run holds this gate.
    ///
    /// The mutex guards no data, so a run that panicked while holding it
    /// leaves nothing inconsistent behind and poisoning is ignored.
    pub fn lock(&self) -> GateGuard<'_> {
        GateGuard {
            _guard: self.lock.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    pub fn try_lock(&self) -> Option<GateGuard<'_>> {
        match self.lock.try_lock() {
            Ok(guard) => Some(GateGuard { _guard: guard }),
            Err(std::sync::TryLockError::Poisoned(e)) => Some(GateGuard {
                _guard: e.into_inner(),
            }),
            Err(std::sync::TryLockError::WouldBlock) => None,
        }
    }
}

/// Hands out one `Gate` per environment id.
///
/// Gates are never evicted, so the same id always maps to the same gate for
/// the lifetime of the registry. The registry mutex only covers the map
/// lookup; waiting on a gate never holds it.
#[derive(Debug, Default)]
pub struct GateRegistry {
    gates: Mutex<HashMap<EnvironmentId, Arc<Gate>>>,
}

impl GateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry shared by every pipeline that does not bring its own.
    pub fn global() -> Arc<GateRegistry> {
        static GLOBAL: OnceLock<Arc<GateRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(GateRegistry::new())))
    }

    pub fn gate(&self, id: EnvironmentId) -> Arc<Gate> {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(gates.entry(id).or_insert_with(|| {
            tracing::trace!(env_id = %id, "creating gate");
            Arc::new(Gate::new(id))
        }))
    }

    pub fn len(&self) -> usize {
        self.gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
