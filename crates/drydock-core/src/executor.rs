//! Lifecycle executor.
//!
//! The executor walks a dependency graph and runs one job per ready resource
//! on a bounded worker pool. Workers only talk to providers; every result
//! comes back to the walk loop, which is the only code that touches the
//! state `Config` and the only caller of the state store.

use crate::diff::{Change, Plan};
use crate::events::{EventBus, EventKind};
use crate::image_cache::CacheBinder;
use crate::CoreError;
use drydock_runtime::{Provider, ProviderError, Registry, RegistryError};
use drydock_schema::{
    Config, DependencyGraph, Resource, ResourceId, Status, TYPE_IMAGE_CACHE, TYPE_NETWORK,
};
use drydock_store::{StateStore, StoreError};
use std::any::Any;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// One provider operation within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Create,
    /// A non-strict destroy logs its failure and lets the job continue.
    Destroy {
        strict: bool,
    },
    Refresh,
}

impl Step {
    pub fn name(self) -> &'static str {
        match self {
            Step::Create => "create",
            Step::Destroy { .. } => "destroy",
            Step::Refresh => "refresh",
        }
    }

    fn started(self) -> EventKind {
        match self {
            Step::Create => EventKind::Creating,
            Step::Destroy { .. } => EventKind::Destroying,
            Step::Refresh => EventKind::Refreshing,
        }
    }

    fn succeeded(self) -> EventKind {
        match self {
            Step::Create => EventKind::Created,
            Step::Destroy { .. } => EventKind::Destroyed,
            Step::Refresh => EventKind::Refreshed,
        }
    }

    fn failed(self) -> EventKind {
        match self {
            Step::Create => EventKind::CreateFailed,
            Step::Destroy { .. } => EventKind::DestroyFailed,
            Step::Refresh => EventKind::RefreshFailed,
        }
    }

    fn wrap(self, id: &ResourceId, source: ProviderError) -> CoreError {
        let id = id.to_string();
        match self {
            Step::Create => CoreError::ProviderCreate { id, source },
            Step::Destroy { .. } => CoreError::ProviderDestroy { id, source },
            Step::Refresh => CoreError::ProviderRefresh { id, source },
        }
    }
}

/// Where a resource ends up in state after its job succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Landing {
    Status(Status),
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Planned,
    /// Destroy half of a recreate or disable, run dependents first.
    Teardown,
    Cache,
}

/// The provider calls planned for one resource.
#[derive(Debug, Clone)]
pub struct Job {
    pub resource: Resource,
    /// Committed form, handed to `destroy` when recreating.
    pub prior: Option<Resource>,
    pub steps: Vec<Step>,
    pub landing: Landing,
    pub force: bool,
    pub(crate) role: Role,
}

impl Job {
    pub fn new(resource: Resource, steps: Vec<Step>, landing: Landing) -> Self {
        Self {
            resource,
            prior: None,
            steps,
            landing,
            force: false,
            role: Role::Planned,
        }
    }

    #[must_use]
    pub fn with_prior(mut self, prior: Option<Resource>) -> Self {
        self.prior = prior;
        self
    }

    #[must_use]
    pub fn forced(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    #[must_use]
    pub(crate) fn for_cache(mut self) -> Self {
        self.role = Role::Cache;
        self
    }

    pub fn id(&self) -> &ResourceId {
        self.resource.id()
    }
}

pub(crate) enum Action {
    Run(Job),
    /// Store the resource as given; no provider call.
    Mark(Resource),
    /// Drop the state entry; no provider call.
    Forget(ResourceId),
}

/// What the apply pass does with one desired resource.
pub(crate) fn plan_action(desired: &Resource, prior: Option<&Resource>, change: Change) -> Action {
    let prior_status = prior.and_then(Resource::status);
    let job = |steps: Vec<Step>, status: Status| {
        Job::new(desired.clone(), steps, Landing::Status(status)).with_prior(prior.cloned())
    };

    if desired.is_disabled() {
        return match prior_status {
            Some(Status::Created | Status::Tainted) => Action::Run(job(
                vec![Step::Destroy { strict: true }],
                Status::Disabled,
            )),
            Some(Status::Failed) => Action::Run(job(
                vec![Step::Destroy { strict: false }],
                Status::Disabled,
            )),
            _ => {
                let mut r = desired.clone();
                r.set_status(Status::Disabled);
                Action::Mark(r)
            }
        };
    }

    let steps = match (prior_status, change) {
        (None | Some(Status::Disabled), _) => vec![Step::Create],
        (Some(Status::Created), Change::Unchanged) => vec![Step::Refresh],
        (Some(Status::Created | Status::Tainted), _) => {
            vec![Step::Destroy { strict: true }, Step::Create]
        }
        (Some(Status::Failed), _) => vec![Step::Destroy { strict: false }, Step::Create],
    };
    Action::Run(job(steps, Status::Created))
}

/// Split the destroy half off a planned job. The destroy runs in the
/// teardown pass; whatever follows it stays in the forward pass.
pub(crate) fn split_teardown(action: Action) -> (Option<Job>, Option<Action>) {
    let mut job = match action {
        Action::Run(job) => job,
        other => return (None, Some(other)),
    };
    let Some(&Step::Destroy { strict }) = job.steps.first() else {
        return (None, Some(Action::Run(job)));
    };
    job.role = Role::Teardown;
    if job.steps.len() == 1 {
        return (Some(job), None);
    }

    let rest = job.steps.split_off(1);
    let prior = job.prior.take().unwrap_or_else(|| job.resource.clone());
    // A best-effort destroy may leave the object behind.
    let landing = if strict {
        Landing::Remove
    } else {
        Landing::Status(Status::Failed)
    };
    let create = Job::new(job.resource, rest, job.landing).forced(job.force);
    let destroy = Job {
        resource: prior,
        prior: None,
        steps: job.steps,
        landing,
        force: job.force,
        role: Role::Teardown,
    };
    (Some(destroy), Some(Action::Run(create)))
}

/// Destroy of a committed resource that is leaving state.
pub(crate) fn removal_action(resource: &Resource, force: bool) -> Action {
    let status = resource.status();
    let never_created = status.is_none() && resource.is_disabled();
    if status == Some(Status::Disabled) || never_created {
        return Action::Forget(resource.id().clone());
    }
    Action::Run(
        Job::new(
            resource.clone(),
            vec![Step::Destroy { strict: true }],
            Landing::Remove,
        )
        .forced(force),
    )
}

pub(crate) struct JobResult {
    pub resource: Resource,
    pub steps: Vec<Step>,
    pub landing: Landing,
    pub role: Role,
    /// False when the job never reached a provider call.
    pub started: bool,
    pub error: Option<CoreError>,
}

impl JobResult {
    fn not_started(job: Job) -> Self {
        Self::finish(job, false, None)
    }

    fn finish(job: Job, started: bool, error: Option<CoreError>) -> Self {
        Self {
            resource: job.resource,
            steps: job.steps,
            landing: job.landing,
            role: job.role,
            started,
            error,
        }
    }

    fn created(&self) -> bool {
        self.steps.contains(&Step::Create)
    }

    fn refresh_only(&self) -> bool {
        self.steps == [Step::Refresh]
    }
}

/// Runs jobs against providers. Cheap to clone into tasks.
#[derive(Clone)]
struct Worker {
    events: EventBus,
    cancel: CancellationToken,
    retry_limit: u32,
    backoff: Duration,
}

impl Worker {
    async fn call(
        &self,
        provider: &dyn Provider,
        step: Step,
        resource: &mut Resource,
        force: bool,
    ) -> Result<(), ProviderError> {
        let mut attempt: u32 = 0;
        loop {
            let span = tracing::debug_span!("provider", id = %resource.id(), op = step.name(), attempt);
            let result = match step {
                Step::Create => provider.create(resource, &self.cancel).instrument(span).await,
                Step::Destroy { .. } => {
                    provider
                        .destroy(resource, force, &self.cancel)
                        .instrument(span)
                        .await
                }
                Step::Refresh => provider.refresh(resource, &self.cancel).instrument(span).await,
            };
            match result {
                Err(e) if e.is_retryable() && attempt < self.retry_limit => {
                    attempt += 1;
                    let wait = self.backoff * attempt;
                    warn!(
                        "{} {} failed: {e}; retry {attempt}/{} in {wait:?}",
                        step.name(),
                        resource.id(),
                        self.retry_limit
                    );
                    tokio::select! {
                        () = tokio::time::sleep(wait) => {}
                        () = self.cancel.cancelled() => return Err(ProviderError::Cancelled),
                    }
                }
                other => return other,
            }
        }
    }

    async fn run(&self, provider: Box<dyn Provider>, mut job: Job, progress: Arc<AtomicUsize>) -> JobResult {
        if self.cancel.is_cancelled() {
            return JobResult::not_started(job);
        }
        let id = job.id().clone();
        let steps = job.steps.clone();
        for (i, step) in steps.into_iter().enumerate() {
            progress.store(i, Ordering::SeqCst);
            self.events.emit(&job.resource, step.started(), None);
            let force = job.force;
            let target = match (step, job.prior.as_mut()) {
                (Step::Destroy { .. }, Some(prior)) => prior,
                _ => &mut job.resource,
            };
            match self.call(provider.as_ref(), step, target, force).await {
                Ok(()) => {
                    debug!("{} {id} succeeded", step.name());
                    self.events.emit(&job.resource, step.succeeded(), None);
                }
                Err(e) => {
                    self.events
                        .emit(&job.resource, step.failed(), Some(e.to_string()));
                    if step == (Step::Destroy { strict: false }) && !e.is_cancelled() {
                        warn!("ignoring failed destroy of {id}: {e}");
                        continue;
                    }
                    return JobResult::finish(job, true, Some(step.wrap(&id, e)));
                }
            }
        }
        JobResult::finish(job, true, None)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ExecOptions {
    pub max_parallelism: usize,
    pub retry_limit: u32,
    pub retry_backoff: Duration,
    pub deadline: Duration,
    pub force: bool,
}

/// Outcome of an executor run.
#[derive(Debug)]
pub(crate) struct Report {
    pub state: Config,
    pub errors: Vec<CoreError>,
    pub cancelled: bool,
    pub save_error: Option<StoreError>,
}

impl Report {
    pub(crate) fn into_result(self) -> Result<Config, CoreError> {
        if self.cancelled {
            return Err(CoreError::Cancelled);
        }
        if let Some(e) = self.save_error {
            return Err(CoreError::StateIo(e));
        }
        if self.errors.is_empty() {
            Ok(self.state)
        } else {
            Err(CoreError::Failed(crate::FailureReport::new(self.errors)))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// Dependencies before dependents; a failure skips its dependents.
    Forward,
    /// Dependents before dependencies; a failure still unblocks the walk.
    Reverse,
}

/// Readiness bookkeeping over one graph.
struct Walk {
    graph: DependencyGraph,
    direction: Direction,
    waiting: HashMap<ResourceId, usize>,
    actions: HashMap<ResourceId, Action>,
    ready: BinaryHeap<Reverse<usize>>,
    skipped: HashSet<ResourceId>,
}

impl Walk {
    fn new(graph: DependencyGraph, direction: Direction, actions: HashMap<ResourceId, Action>) -> Self {
        let mut walk = Self {
            graph,
            direction,
            waiting: HashMap::new(),
            actions,
            ready: BinaryHeap::new(),
            skipped: HashSet::new(),
        };
        let ids: Vec<ResourceId> = walk.graph.topological_order().to_vec();
        for id in ids {
            let blockers = walk.blockers(&id);
            if blockers == 0 {
                walk.push_ready(&id);
            }
            walk.waiting.insert(id, blockers);
        }
        walk
    }

    fn blockers(&self, id: &str) -> usize {
        match self.direction {
            Direction::Forward => self.graph.dependencies(id).len(),
            Direction::Reverse => self.graph.dependents(id).len(),
        }
    }

    fn unblocks(&self, id: &str) -> Vec<ResourceId> {
        match self.direction {
            Direction::Forward => self.graph.dependents(id).to_vec(),
            Direction::Reverse => self.graph.dependencies(id).into_iter().cloned().collect(),
        }
    }

    fn rank(&self, id: &str) -> usize {
        let pos = self.graph.position(id).unwrap_or(0);
        match self.direction {
            Direction::Forward => pos,
            Direction::Reverse => self.graph.len() - 1 - pos,
        }
    }

    fn push_ready(&mut self, id: &str) {
        let rank = self.rank(id);
        self.ready.push(Reverse(rank));
    }

    fn pop_ready(&mut self) -> Option<(ResourceId, Option<Action>)> {
        while let Some(Reverse(rank)) = self.ready.pop() {
            let pos = match self.direction {
                Direction::Forward => rank,
                Direction::Reverse => self.graph.len() - 1 - rank,
            };
            let Some(id) = self.graph.topological_order().get(pos).cloned() else {
                continue;
            };
            if self.skipped.contains(&id) {
                continue;
            }
            let action = self.actions.remove(&id);
            return Some((id, action));
        }
        None
    }

    /// `id` reached its terminal state; release whatever it was blocking.
    fn complete(&mut self, id: &str) {
        for next in self.unblocks(id) {
            if let Some(count) = self.waiting.get_mut(&next) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.push_ready(&next);
                }
            }
        }
    }

    /// `id` failed. Forward walks skip every transitive dependent and return
    /// the ones newly skipped, in walk order.
    fn fail(&mut self, id: &str) -> Vec<ResourceId> {
        if self.direction == Direction::Reverse {
            self.complete(id);
            return Vec::new();
        }
        let dependents = self.graph.transitive_dependents(id);
        let mut newly: Vec<ResourceId> = dependents
            .into_iter()
            .filter(|d| self.actions.contains_key(d) && !self.skipped.contains(d))
            .collect();
        newly.sort_by_key(|d| self.graph.position(d));
        for d in &newly {
            self.skipped.insert(d.clone());
            self.actions.remove(d);
        }
        newly
    }
}

/// Fallback order for state whose dependencies form a cycle: each entry
/// depends on the one before it.
fn chain_graph(ids: &[ResourceId]) -> DependencyGraph {
    let nodes = ids.iter().enumerate().map(|(i, id)| {
        let deps = if i == 0 { Vec::new() } else { vec![ids[i - 1].clone()] };
        (id.clone(), deps)
    });
    DependencyGraph::from_nodes(nodes).unwrap_or_default()
}

fn committed_graph(state: &Config) -> DependencyGraph {
    DependencyGraph::build_lenient(state).unwrap_or_else(|e| {
        warn!("committed state has inconsistent dependencies ({e}), destroying sequentially");
        let order: Vec<ResourceId> = state.ids().cloned().collect();
        chain_graph(&order)
    })
}

/// The part of `committed` covering `members`. An edge joins two members
/// whenever one depends on the other, even through resources outside the set.
fn subgraph<V>(committed: &DependencyGraph, members: &HashMap<ResourceId, V>) -> DependencyGraph {
    let order: Vec<ResourceId> = committed
        .topological_order()
        .iter()
        .filter(|id| members.contains_key(*id))
        .cloned()
        .collect();
    let nodes = order.iter().map(|id| {
        let mut deps: Vec<ResourceId> = committed
            .transitive_dependencies(id)
            .into_iter()
            .filter(|d| members.contains_key(d))
            .collect();
        deps.sort_by_key(|d| committed.position(d));
        (id.clone(), deps)
    });
    DependencyGraph::from_nodes(nodes).unwrap_or_else(|_| chain_graph(&order))
}

/// Rebuild `state` as: image cache, then desired order, then anything else in
/// its existing order.
fn reorder(state: Config, desired: &Config) -> Config {
    let blueprint = state.blueprint().cloned();
    let extra = state.extra().clone();
    let position: HashMap<&ResourceId, usize> =
        desired.ids().enumerate().map(|(i, id)| (id, i)).collect();
    let mut resources = state.into_resources();
    resources.sort_by_key(|r| {
        if r.kind() == TYPE_IMAGE_CACHE {
            (0, 0)
        } else {
            position.get(r.id()).map_or((2, 0), |&i| (1, i))
        }
    });

    let mut out = Config::new();
    out.set_blueprint(blueprint);
    for (k, v) in extra {
        out.set_extra(&k, v);
    }
    for r in resources {
        out.upsert(r);
    }
    out
}

pub(crate) struct Executor<'a> {
    registry: &'a Registry,
    store: &'a StateStore,
    worker: Worker,
    semaphore: Arc<Semaphore>,
    deadline: Duration,
    force: bool,
    state: Config,
    cache: CacheBinder,
    errors: Vec<CoreError>,
    save_error: Option<StoreError>,
    cancelled: bool,
    teardown_failed: HashSet<ResourceId>,
}

impl<'a> Executor<'a> {
    pub(crate) fn new(
        registry: &'a Registry,
        store: &'a StateStore,
        events: EventBus,
        cancel: CancellationToken,
        options: &ExecOptions,
        state: Config,
    ) -> Self {
        Self {
            registry,
            store,
            worker: Worker {
                events,
                cancel,
                retry_limit: options.retry_limit,
                backoff: options.retry_backoff,
            },
            semaphore: Arc::new(Semaphore::new(options.max_parallelism.max(1))),
            deadline: options.deadline,
            force: options.force,
            cache: CacheBinder::new(registry.contains(TYPE_IMAGE_CACHE)),
            state,
            errors: Vec::new(),
            save_error: None,
            cancelled: false,
            teardown_failed: HashSet::new(),
        }
    }

    /// Reconcile state with `plan`: image cache, teardown of recreated and
    /// disabled resources, desired resources, removed resources, final cache
    /// refresh, final save.
    pub(crate) async fn apply(mut self, plan: Plan) -> Report {
        info!(
            "applying {} resource(s), {} to remove",
            plan.desired.len(),
            plan.removed.len()
        );
        self.cache.prepare(&mut self.state);

        let mut actions = HashMap::with_capacity(plan.desired.len());
        let mut teardown = HashMap::new();
        for r in &plan.desired {
            let change = plan.change(r.id()).unwrap_or(Change::New);
            let (destroy, rest) = split_teardown(plan_action(r, self.state.get(r.id()), change));
            if let Some(job) = destroy {
                teardown.insert(r.id().clone(), Action::Run(job));
            }
            if let Some(action) = rest {
                actions.insert(r.id().clone(), action);
            }
        }

        let mut removed: Vec<ResourceId> = plan.removed.iter().map(|r| r.id().clone()).collect();
        if !teardown.is_empty() {
            let committed = committed_graph(&self.state);
            // Removed resources stacked on a teardown must go before it.
            let (stacked, rest): (Vec<ResourceId>, Vec<ResourceId>) =
                removed.into_iter().partition(|id| {
                    committed
                        .transitive_dependencies(id)
                        .iter()
                        .any(|d| teardown.contains_key(d))
                });
            for id in stacked {
                if let Some(r) = self.state.get(&id) {
                    let action = removal_action(r, self.force);
                    teardown.insert(id, action);
                }
            }
            removed = rest;
            debug!("tearing down {} resource(s) before recreating", teardown.len());
            let graph = subgraph(&committed, &teardown);
            self.walk(Walk::new(graph, Direction::Reverse, teardown)).await;
        }

        let mut walk = Walk::new(plan.graph.clone(), Direction::Forward, actions);
        self.skip_failed_teardowns(&mut walk);
        self.walk(walk).await;

        if self.cancelled {
            info!("cancelled, skipping removal of {} resource(s)", removed.len());
        } else {
            let removed: Vec<Resource> = removed
                .iter()
                .filter_map(|id| self.state.get(id).cloned())
                .collect();
            self.remove(&removed).await;
        }

        if !self.cancelled {
            self.cache.request_final_refresh(&self.state);
            self.walk(Walk::new(
                DependencyGraph::default(),
                Direction::Forward,
                HashMap::new(),
            ))
            .await;
        }

        let mut state = reorder(std::mem::take(&mut self.state), &plan.desired);
        state.set_blueprint(plan.desired.blueprint().cloned());
        self.state = state;
        self.save();
        self.report()
    }

    async fn remove(&mut self, removed: &[Resource]) {
        if removed.is_empty() {
            return;
        }
        let actions: HashMap<ResourceId, Action> = removed
            .iter()
            .map(|r| (r.id().clone(), removal_action(r, self.force)))
            .collect();
        let graph = subgraph(&committed_graph(&self.state), &actions);
        self.walk(Walk::new(graph, Direction::Reverse, actions)).await;
    }

    /// A resource whose teardown failed is not recreated, and neither is
    /// anything that depends on it.
    fn skip_failed_teardowns(&mut self, walk: &mut Walk) {
        let failed: Vec<ResourceId> = walk
            .graph
            .topological_order()
            .iter()
            .filter(|id| self.teardown_failed.contains(*id))
            .cloned()
            .collect();
        for id in &failed {
            walk.actions.remove(id);
        }
        for id in &failed {
            for skipped in walk.fail(id) {
                debug!("skipping {skipped}: teardown of {id} failed");
                self.errors.push(CoreError::DependencySkipped {
                    id: skipped.to_string(),
                    dependency: id.to_string(),
                });
            }
        }
    }

    /// Destroy everything in state, image cache last. The state file is
    /// removed only when every destroy succeeded.
    pub(crate) async fn destroy_all(mut self) -> Report {
        let resources: Vec<Resource> = self
            .state
            .iter()
            .filter(|r| r.kind() != TYPE_IMAGE_CACHE)
            .cloned()
            .collect();
        info!("destroying {} resource(s)", resources.len());
        self.remove(&resources).await;

        if !self.cancelled {
            let caches: Vec<Resource> = self.state.find_by_type(TYPE_IMAGE_CACHE).cloned().collect();
            self.remove(&caches).await;
        }

        if self.errors.is_empty() && !self.cancelled && self.state.is_empty() {
            if let Err(e) = self.store.clear() {
                warn!("failed to remove state file: {e}");
                self.save_error.get_or_insert(e);
            }
        } else {
            self.save();
        }
        self.report()
    }

    fn report(self) -> Report {
        Report {
            state: self.state,
            errors: self.errors,
            cancelled: self.cancelled,
            save_error: self.save_error,
        }
    }

    fn save(&mut self) {
        if let Err(e) = self.store.save(&self.state) {
            warn!("failed to save state: {e}");
            self.save_error.get_or_insert(e);
        }
    }

    fn cancel(&self) -> &CancellationToken {
        &self.worker.cancel
    }

    fn spawn(&self, tasks: &mut JoinSet<JobResult>, provider: Box<dyn Provider>, job: Job) {
        let worker = self.worker.clone();
        let semaphore = Arc::clone(&self.semaphore);
        tasks.spawn(async move {
            let permit = tokio::select! {
                permit = semaphore.acquire_owned() => permit.ok(),
                () = worker.cancel.cancelled() => None,
            };
            let Some(permit) = permit else {
                return JobResult::not_started(job);
            };

            let snapshot = job.clone();
            let progress = Arc::new(AtomicUsize::new(0));
            let inner = {
                let worker = worker.clone();
                let progress = Arc::clone(&progress);
                tokio::spawn(async move { worker.run(provider, job, progress).await })
            };
            let result = match inner.await {
                Ok(result) => result,
                Err(e) => {
                    let step = snapshot
                        .steps
                        .get(progress.load(Ordering::SeqCst))
                        .copied()
                        .unwrap_or(Step::Create);
                    let reason = if e.is_panic() {
                        format!("provider panicked: {}", panic_message(&*e.into_panic()))
                    } else {
                        "provider task was aborted".to_owned()
                    };
                    error!("{} {}: {reason}", step.name(), snapshot.id());
                    worker
                        .events
                        .emit(&snapshot.resource, step.failed(), Some(reason.clone()));
                    let id = snapshot.id().clone();
                    JobResult::finish(snapshot, true, Some(step.wrap(&id, ProviderError::Fatal(reason))))
                }
            };
            drop(permit);
            result
        });
    }

    /// Provider construction failed; the job fails without a provider call.
    fn init_failure(&self, job: Job, error: RegistryError) -> JobResult {
        let step = job.steps.first().copied().unwrap_or(Step::Create);
        let error = CoreError::from(error);
        warn!("{error}");
        self.worker
            .events
            .emit(&job.resource, step.failed(), Some(error.to_string()));
        JobResult::finish(job, true, Some(error))
    }

    async fn walk(&mut self, mut walk: Walk) {
        let mut tasks: JoinSet<JobResult> = JoinSet::new();
        let mut drain_deadline: Option<Instant> = None;

        loop {
            if !self.cancel().is_cancelled() {
                self.dispatch(&mut walk, &mut tasks);
            }
            if tasks.is_empty() {
                break;
            }

            let joined = if let Some(deadline) = drain_deadline {
                if let Ok(joined) = tokio::time::timeout_at(deadline, tasks.join_next()).await {
                    joined
                } else {
                    warn!(
                        "{} provider operation(s) still running after {:?}, abandoning them",
                        tasks.len(),
                        self.deadline
                    );
                    tasks.detach_all();
                    break;
                }
            } else {
                tokio::select! {
                    joined = tasks.join_next() => joined,
                    () = self.worker.cancel.cancelled() => {
                        info!("cancellation requested, waiting for in-flight operations");
                        drain_deadline = Some(Instant::now() + self.deadline);
                        continue;
                    }
                }
            };

            match joined {
                Some(Ok(result)) => self.settle(result, &mut walk),
                Some(Err(e)) => error!("executor task failed: {e}"),
                None => break,
            }
        }

        if self.cancel().is_cancelled() {
            self.cancelled = true;
        }
    }

    fn dispatch(&mut self, walk: &mut Walk, tasks: &mut JoinSet<JobResult>) {
        loop {
            if let Some(job) = self.cache.next_job(&self.state) {
                self.launch(job, walk, tasks);
                continue;
            }
            if self.cache.blocks() {
                return;
            }
            let Some((id, action)) = walk.pop_ready() else {
                return;
            };
            match action {
                Some(Action::Run(job)) => self.launch(job, walk, tasks),
                Some(Action::Mark(resource)) => {
                    debug!("{id} is disabled, recording without provider call");
                    if resource.kind() == TYPE_NETWORK {
                        self.cache.unbind(&mut self.state, &id);
                    }
                    self.state.upsert(resource);
                    self.checkpoint();
                    walk.complete(&id);
                }
                Some(Action::Forget(forget)) => {
                    debug!("forgetting {forget} without provider call");
                    if let Some(r) = self.state.remove(&forget) {
                        if r.kind() == TYPE_NETWORK {
                            self.cache.unbind(&mut self.state, &forget);
                        }
                    }
                    self.checkpoint();
                    walk.complete(&id);
                }
                None => walk.complete(&id),
            }
        }
    }

    fn launch(&mut self, job: Job, walk: &mut Walk, tasks: &mut JoinSet<JobResult>) {
        match self.registry.provider(&job.resource) {
            Ok(provider) => self.spawn(tasks, provider, job),
            Err(e) => {
                let result = self.init_failure(job, e);
                self.settle(result, walk);
            }
        }
    }

    fn settle(&mut self, result: JobResult, walk: &mut Walk) {
        let id = result.resource.id().clone();
        if result.role == Role::Cache {
            self.cache.finished();
        }
        if !result.started {
            debug!("{id} was not started");
            return;
        }

        let is_network = result.resource.kind() == TYPE_NETWORK;
        let planned = result.role != Role::Cache;
        let teardown = result.role == Role::Teardown;
        let created_step = result.created();
        let refresh_only = result.refresh_only();
        match result.error {
            None => {
                match result.landing {
                    Landing::Status(status) => {
                        let created = status == Status::Created && created_step;
                        let mut resource = result.resource;
                        resource.set_status(status);
                        if !planned {
                            if let Some(existing) = self.state.get(&id) {
                                resource.meta.depends_on.clone_from(&existing.meta.depends_on);
                            }
                        }
                        self.state.upsert(resource);
                        if is_network && created {
                            self.cache.bind(&mut self.state, &id);
                        } else if is_network && status == Status::Disabled {
                            self.cache.unbind(&mut self.state, &id);
                        }
                    }
                    Landing::Remove => {
                        self.state.remove(&id);
                        if is_network {
                            self.cache.unbind(&mut self.state, &id);
                        }
                    }
                }
                if planned {
                    walk.complete(&id);
                }
            }
            Some(err) => {
                let cancelled = err.is_cancelled();
                let keep_prior = cancelled && refresh_only;
                if !keep_prior {
                    match result.landing {
                        Landing::Status(_) => {
                            let mut resource = result.resource;
                            resource.set_status(Status::Failed);
                            if !planned {
                                if let Some(existing) = self.state.get(&id) {
                                    resource.meta.depends_on.clone_from(&existing.meta.depends_on);
                                }
                            }
                            self.state.upsert(resource);
                        }
                        Landing::Remove => {
                            if let Some(entry) = self.state.get_mut(&id) {
                                entry.set_status(Status::Failed);
                            }
                        }
                    }
                }
                if cancelled {
                    debug!("{id} interrupted by cancellation");
                } else {
                    self.errors.push(err);
                    if teardown {
                        self.teardown_failed.insert(id.clone());
                    }
                    if planned {
                        for skipped in walk.fail(&id) {
                            debug!("skipping {skipped}: dependency {id} failed");
                            self.errors.push(CoreError::DependencySkipped {
                                id: skipped.to_string(),
                                dependency: id.to_string(),
                            });
                        }
                    }
                }
            }
        }
        self.checkpoint();
    }

    /// Best-effort save after a terminal result; the first failure is kept.
    fn checkpoint(&mut self) {
        if let Err(e) = self.store.save(&self.state) {
            warn!("checkpoint save failed: {e}");
            self.save_error.get_or_insert(e);
        }
    }
}
