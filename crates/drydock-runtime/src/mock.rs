//! Recording mock backend.
//!
//! `MockBackend` serves every type it is registered for with an in-memory
//! provider that records each call, tracks which resources "exist", and can
//! be told to fail, panic, stall, or report drift for a given resource id.

use crate::builtin::{prototype_for, WELL_KNOWN_TYPES};
use crate::provider::{factory, Provider, ProviderFactory};
use crate::registry::Registry;
use crate::{ProviderError, RegistryError};
use async_trait::async_trait;
use drydock_schema::Resource;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Create,
    Destroy,
    Refresh,
    Changed,
    Lookup,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Create => write!(f, "create"),
            Op::Destroy => write!(f, "destroy"),
            Op::Refresh => write!(f, "refresh"),
            Op::Changed => write!(f, "changed"),
            Op::Lookup => write!(f, "lookup"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub op: Op,
    pub id: String,
}

struct Failure {
    error: ProviderError,
    remaining: Option<usize>,
}

#[derive(Default)]
struct MockState {
    calls: Vec<MockCall>,
    existing: HashSet<String>,
    failures: HashMap<(String, Op), Failure>,
    panics: HashSet<(String, Op)>,
    delays: HashMap<(String, Op), Duration>,
    drifted: HashSet<String>,
}

/// Shared state behind every [`MockProvider`] it hands out.
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockBackend")
            .field("calls", &state.calls.len())
            .field("existing", &state.existing.len())
            .finish()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> ProviderFactory {
        let backend = self.clone();
        factory(move |resource| {
            Ok(Box::new(MockProvider {
                backend: backend.clone(),
                id: resource.id().to_string(),
            }))
        })
    }

    /// Register the mock for each of `kinds`.
    pub fn register(&self, registry: &mut Registry, kinds: &[&str]) -> Result<(), RegistryError> {
        for kind in kinds {
            registry.register(kind, prototype_for(kind), self.factory())?;
        }
        Ok(())
    }

    /// Register the mock for every well-known type.
    pub fn register_well_known(&self, registry: &mut Registry) -> Result<(), RegistryError> {
        let kinds: Vec<&str> = WELL_KNOWN_TYPES.iter().map(|(k, _)| *k).collect();
        self.register(registry, &kinds)
    }

    /// Fail `op` on `id` every time.
    pub fn fail(&self, id: &str, op: Op, error: ProviderError) {
        self.state.lock().failures.insert(
            (id.to_owned(), op),
            Failure {
                error,
                remaining: None,
            },
        );
    }

    /// Fail `op` on `id` for the next `times` calls, then succeed.
    pub fn fail_times(&self, id: &str, op: Op, error: ProviderError, times: usize) {
        self.state.lock().failures.insert(
            (id.to_owned(), op),
            Failure {
                error,
                remaining: Some(times),
            },
        );
    }

    pub fn panic_on(&self, id: &str, op: Op) {
        self.state.lock().panics.insert((id.to_owned(), op));
    }

    /// Stall `op` on `id` for `delay`, or until cancelled.
    pub fn delay(&self, id: &str, op: Op, delay: Duration) {
        self.state.lock().delays.insert((id.to_owned(), op), delay);
    }

    /// Make `changed()` report drift for `id`.
    pub fn set_drifted(&self, id: &str, drifted: bool) {
        let mut state = self.state.lock();
        if drifted {
            state.drifted.insert(id.to_owned());
        } else {
            state.drifted.remove(id);
        }
    }

    /// Clear injected failures, panics, delays and drift. The call log and
    /// the set of existing resources are kept.
    pub fn reset_faults(&self) {
        let mut state = self.state.lock();
        state.failures.clear();
        state.panics.clear();
        state.delays.clear();
        state.drifted.clear();
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().calls.clone()
    }

    /// Calls with `op`, in invocation order.
    pub fn calls_of(&self, op: Op) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .map(|c| c.id.clone())
            .collect()
    }

    /// Ops invoked on `id`, in order.
    pub fn ops_for(&self, id: &str) -> Vec<Op> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.id == id)
            .map(|c| c.op)
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn exists(&self, id: &str) -> bool {
        self.state.lock().existing.contains(id)
    }

    pub fn existing(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().existing.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Record the call and decide its fate. The lock is released before
    /// any await.
    fn begin(&self, id: &str, op: Op) -> Result<Option<Duration>, ProviderError> {
        let mut state = self.state.lock();
        state.calls.push(MockCall {
            op,
            id: id.to_owned(),
        });
        let key = (id.to_owned(), op);
        if state.panics.contains(&key) {
            drop(state);
            panic!("mock provider panic injected for {op} on {id}");
        }
        if let Some(failure) = state.failures.get_mut(&key) {
            match &mut failure.remaining {
                None => return Err(failure.error.clone()),
                Some(0) => {}
                Some(n) => {
                    *n -= 1;
                    return Err(failure.error.clone());
                }
            }
        }
        Ok(state.delays.get(&key).copied())
    }

    fn mark(&self, id: &str, exists: bool) {
        let mut state = self.state.lock();
        if exists {
            state.existing.insert(id.to_owned());
        } else {
            state.existing.remove(id);
        }
    }
}

/// Provider handed out by [`MockBackend::factory`].
pub struct MockProvider {
    backend: MockBackend,
    id: String,
}

impl MockProvider {
    async fn run(&self, op: Op, cancel: &CancellationToken) -> Result<(), ProviderError> {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        if let Some(delay) = self.backend.begin(&self.id, op)? {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => return Err(ProviderError::Cancelled),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn create(
        &self,
        resource: &mut Resource,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        self.run(Op::Create, cancel).await?;
        let backend_id = blake3::hash(self.id.as_bytes()).to_hex()[..12].to_owned();
        resource.set_property("backend_id", backend_id);
        self.backend.mark(&self.id, true);
        Ok(())
    }

    async fn destroy(
        &self,
        _resource: &mut Resource,
        _force: bool,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        self.run(Op::Destroy, cancel).await?;
        self.backend.mark(&self.id, false);
        Ok(())
    }

    async fn refresh(
        &self,
        _resource: &mut Resource,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        self.run(Op::Refresh, cancel).await
    }

    async fn changed(&self, _resource: &Resource) -> Result<bool, ProviderError> {
        self.backend.begin(&self.id, Op::Changed)?;
        Ok(self.backend.state.lock().drifted.contains(&self.id))
    }

    async fn lookup(&self, _resource: &Resource) -> Result<Vec<String>, ProviderError> {
        self.backend.begin(&self.id, Op::Lookup)?;
        if self.backend.exists(&self.id) {
            Ok(vec![self.id.clone()])
        } else {
            Ok(Vec::new())
        }
    }
}
