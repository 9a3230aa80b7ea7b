use crate::concurrency::StoreLock;
use crate::config::EngineConfig;
use crate::diff::{self, Plan};
use crate::events::{EventBus, EventKind, Subscription};
use crate::executor::{ExecOptions, Executor};
use crate::CoreError;
use drydock_runtime::{host_networks, load_plugins, Registry};
use drydock_schema::{
    parse_blueprint, validate_subnets, Config, ParseOptions, ParseOutcome, Resource, Status,
    VariableSet, TYPE_NETWORK,
};
use drydock_store::{HomeLayout, StateStore};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Counts of committed resources by lifecycle status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub total: usize,
    pub created: usize,
    pub tainted: usize,
    pub failed: usize,
    pub disabled: usize,
    /// Entries without a recognised status.
    pub unknown: usize,
}

impl StatusSummary {
    fn from_config(config: &Config) -> Self {
        let mut summary = Self {
            total: config.len(),
            ..Self::default()
        };
        for r in config {
            match r.status() {
                Some(Status::Created) => summary.created += 1,
                Some(Status::Tainted) => summary.tainted += 1,
                Some(Status::Failed) => summary.failed += 1,
                Some(Status::Disabled) => summary.disabled += 1,
                None => summary.unknown += 1,
            }
        }
        summary
    }

    pub fn is_healthy(&self) -> bool {
        self.failed == 0
    }
}

/// The orchestration engine: parse, diff, apply, destroy.
///
/// One top-level operation runs at a time, enforced in-process by an async
/// mutex and across processes by the state lock file.
pub struct Engine {
    settings: EngineConfig,
    layout: HomeLayout,
    store: StateStore,
    registry: Registry,
    events: EventBus,
    plugins: Vec<String>,
    state: Mutex<Config>,
    op_lock: tokio::sync::Mutex<()>,
}

impl Engine {
    /// Prepare the home directory, load plugins into `registry`, and read the
    /// committed state. A plugin that fails to load is fatal.
    pub fn new(settings: EngineConfig, mut registry: Registry) -> Result<Self, CoreError> {
        let layout = settings.layout();
        layout.initialize()?;
        let store = StateStore::new(&layout);
        let plugins = load_plugins(&layout.plugins_dir(), &mut registry, store.path())?;
        if !plugins.is_empty() {
            info!("loaded {} plugin(s): {}", plugins.len(), plugins.join(", "));
        }
        let state = store.load_or_empty();
        debug!(
            "engine ready at {} with {} committed resource(s), types: {}",
            layout.root().display(),
            state.len(),
            registry.types().join(", ")
        );
        Ok(Self {
            events: EventBus::new(settings.event_buffer),
            settings,
            layout,
            store,
            registry,
            plugins,
            state: Mutex::new(state),
            op_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn settings(&self) -> &EngineConfig {
        &self.settings
    }

    pub fn layout(&self) -> &HomeLayout {
        &self.layout
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Names of the plugins loaded at startup.
    pub fn plugins(&self) -> &[String] {
        &self.plugins
    }

    pub async fn apply(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<Config, CoreError> {
        self.apply_with_variables(path, &VariableSet::new(), None, cancel)
            .await
    }

    /// Parse `path`, diff against committed state, and reconcile.
    ///
    /// Returns the new committed state. Provider failures do not stop
    /// independent resources; they are collected into
    /// [`CoreError::Failed`]. State is saved in every case except an
    /// invalid blueprint, which touches nothing.
    pub async fn apply_with_variables(
        &self,
        path: &Path,
        variables: &VariableSet,
        variables_file: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<Config, CoreError> {
        let _guard = self.op_lock.lock().await;
        let _lock = StoreLock::acquire_or_fail(&self.layout.lock_file())?;

        let committed = self.store.load_or_empty();
        let desired = self
            .parse(path, variables, variables_file, &committed, true)
            .into_result()?;
        self.validate_networks(&desired, &committed)?;
        let plan = diff::compute(desired, &committed, &self.registry).await?;
        info!(
            "plan: {} new, {} changed, {} unchanged, {} removed",
            plan.new_resources().len(),
            plan.changed().len(),
            plan.unchanged().len(),
            plan.removed().len()
        );

        let options = self.exec_options(self.settings.apply_deadline(), false);
        let executor = Executor::new(
            &self.registry,
            &self.store,
            self.events.clone(),
            cancel.clone(),
            &options,
            committed,
        );
        let report = executor.apply(plan).await;
        self.state.lock().clone_from(&report.state);
        report.into_result()
    }

    pub fn parse_config(&self, path: &Path) -> Result<Config, CoreError> {
        self.parse_config_with_variables(path, &VariableSet::new(), None)
    }

    /// Parse without touching providers or state. Emits `parsed` events.
    pub fn parse_config_with_variables(
        &self,
        path: &Path,
        variables: &VariableSet,
        variables_file: Option<&Path>,
    ) -> Result<Config, CoreError> {
        let committed = self.state.lock().clone();
        self.parse(path, variables, variables_file, &committed, true)
            .into_result()
            .map_err(CoreError::from)
    }

    /// Like [`Engine::parse_config_with_variables`], but keeps whatever
    /// resolved alongside the error.
    pub fn parse_outcome(
        &self,
        path: &Path,
        variables: &VariableSet,
        variables_file: Option<&Path>,
    ) -> ParseOutcome {
        let committed = self.state.lock().clone();
        self.parse(path, variables, variables_file, &committed, false)
    }

    /// Classify `path` against committed state without applying anything.
    pub async fn diff(
        &self,
        path: &Path,
        variables: &VariableSet,
        variables_file: Option<&Path>,
    ) -> Result<Plan, CoreError> {
        let committed = self.store.load_or_empty();
        let desired = self
            .parse(path, variables, variables_file, &committed, false)
            .into_result()?;
        self.validate_networks(&desired, &committed)?;
        diff::compute(desired, &committed, &self.registry).await
    }

    /// Destroy every committed resource. The state file is removed only if
    /// all of them were destroyed cleanly.
    pub async fn destroy(&self, force: bool, cancel: &CancellationToken) -> Result<(), CoreError> {
        let _guard = self.op_lock.lock().await;
        let _lock = StoreLock::acquire_or_fail(&self.layout.lock_file())?;

        let committed = self.store.load_or_empty();
        let options = self.exec_options(self.settings.destroy_deadline(), force);
        let executor = Executor::new(
            &self.registry,
            &self.store,
            self.events.clone(),
            cancel.clone(),
            &options,
            committed,
        );
        let report = executor.destroy_all().await;
        self.state.lock().clone_from(&report.state);
        report.into_result().map(|_| ())
    }

    /// Mark a committed resource so the next apply recreates it.
    pub async fn taint(&self, id: &str) -> Result<Resource, CoreError> {
        let _guard = self.op_lock.lock().await;
        let _lock = StoreLock::acquire_or_fail(&self.layout.lock_file())?;

        let mut state = self.store.load_or_empty();
        let resource = state
            .get_mut(id)
            .ok_or_else(|| CoreError::NotFound(id.to_owned()))?;
        resource.set_status(Status::Tainted);
        let tainted = resource.clone();
        self.store.save(&state)?;
        info!("tainted {id}");
        *self.state.lock() = state;
        Ok(tainted)
    }

    /// Ask the provider which backend objects exist for a committed resource.
    pub async fn lookup(&self, id: &str) -> Result<Vec<String>, CoreError> {
        let resource = self
            .state
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(id.to_owned()))?;
        let provider = self.registry.provider(&resource)?;
        provider
            .lookup(&resource)
            .await
            .map_err(|source| CoreError::ProviderLookup {
                id: id.to_owned(),
                source,
            })
    }

    /// Snapshot of the committed state as of the last operation.
    pub fn config(&self) -> Config {
        self.state.lock().clone()
    }

    pub fn status(&self) -> StatusSummary {
        StatusSummary::from_config(&self.state.lock())
    }

    /// Subscribe to lifecycle events from now on.
    pub fn events(&self) -> Subscription {
        self.events.subscribe()
    }

    pub fn resource_count_for_type(&self, kind: &str) -> usize {
        self.state.lock().count_type(kind)
    }

    fn parse(
        &self,
        path: &Path,
        variables: &VariableSet,
        variables_file: Option<&Path>,
        committed: &Config,
        emit: bool,
    ) -> ParseOutcome {
        let options = ParseOptions::from_env()
            .with_variables(variables.clone())
            .with_variables_file(variables_file.map(Path::to_path_buf));
        let events = self.events.clone();
        let mut on_processed = |r: &Resource| {
            if emit {
                events.emit(r, EventKind::Parsed, None);
            }
        };
        let outcome = parse_blueprint(path, &options, &self.registry, committed, &mut on_processed);
        if let Some(e) = &outcome.error {
            warn!("blueprint {} is invalid: {e}", path.display());
        }
        outcome
    }

    /// Networks must not overlap each other. Networks not yet created must
    /// also stay clear of host interfaces; a created network's own bridge
    /// is one of them.
    fn validate_networks(&self, desired: &Config, committed: &Config) -> Result<(), CoreError> {
        validate_subnets(desired, &[])?;
        if !self.settings.check_host_interfaces {
            return Ok(());
        }
        let host = match host_networks() {
            Ok(h) => h,
            Err(e) => {
                warn!("cannot enumerate host interfaces, skipping overlap check: {e}");
                return Ok(());
            }
        };
        let mut fresh = Config::new();
        for r in desired.find_by_type(TYPE_NETWORK) {
            let created = committed
                .get(r.id())
                .is_some_and(|c| c.status() == Some(Status::Created));
            if !created {
                fresh.upsert(r.clone());
            }
        }
        validate_subnets(&fresh, &host)?;
        Ok(())
    }

    fn exec_options(&self, deadline: Duration, force: bool) -> ExecOptions {
        ExecOptions {
            max_parallelism: self.settings.max_parallelism,
            retry_limit: self.settings.retry_limit,
            retry_backoff: self.settings.retry_backoff(),
            deadline,
            force,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_counts_statuses() {
        let mut a = Resource::new("", "container", "a");
        a.set_status(Status::Created);
        let mut b = Resource::new("", "container", "b");
        b.set_status(Status::Failed);
        let c = Resource::new("", "container", "c");
        let config = Config::try_from(vec![a, b, c]).unwrap();
        let s = StatusSummary::from_config(&config);
        assert_eq!(s.total, 3);
        assert_eq!(s.created, 1);
        assert_eq!(s.failed, 1);
        assert_eq!(s.unknown, 1);
        assert!(!s.is_healthy());
    }

    #[test]
    fn new_engine_initializes_home() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(EngineConfig::with_home(dir.path()), Registry::with_builtins())
            .unwrap();
        assert!(dir.path().join("state").is_dir());
        assert!(dir.path().join("plugins").is_dir());
        assert!(engine.config().is_empty());
        assert!(engine.plugins().is_empty());
        assert_eq!(engine.status(), StatusSummary::default());
    }

    #[tokio::test]
    async fn taint_unknown_resource_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(EngineConfig::with_home(dir.path()), Registry::with_builtins())
            .unwrap();
        let err = engine.taint("resource.container.ghost").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
