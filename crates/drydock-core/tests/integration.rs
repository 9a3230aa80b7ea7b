use drydock_core::{
    CoreError, Engine, EngineConfig, Event, EventKind, StoreLock, EXIT_CANCELLED,
    EXIT_INVALID_CONFIG,
};
use drydock_runtime::{MockBackend, Op, ProviderError, Registry};
use drydock_schema::{Status, VariableSet, IMAGE_CACHE_ID};
use drydock_store::{HomeLayout, StateStore};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const NET: &str = "resource.network.onprem";
const CONSUL: &str = "resource.container.consul";

fn engine(home: &Path) -> (Engine, MockBackend) {
    let mock = MockBackend::new();
    let mut registry = Registry::with_builtins();
    mock.register_well_known(&mut registry).unwrap();
    let mut settings = EngineConfig::with_home(home);
    settings.check_host_interfaces = false;
    settings.retry_backoff_ms = 1;
    (Engine::new(settings, registry).unwrap(), mock)
}

fn write_blueprint(dir: &Path, content: &str) -> PathBuf {
    let path = dir.join("main.toml");
    fs::write(&path, content).unwrap();
    path
}

fn stack(image: &str, consul_extra: &str) -> String {
    format!(
        r#"
[[resource]]
type = "network"
name = "onprem"
subnet = "10.15.0.0/16"

[[resource]]
type = "container"
name = "consul"
image = "{image}"
depends_on = ["network.onprem"]
{consul_extra}
"#
    )
}

fn s1() -> String {
    stack("consul:1.8.1", "")
}

fn event_index(events: &[Event], id: &str, kind: EventKind) -> usize {
    events
        .iter()
        .position(|e| e.id == id && e.event == kind)
        .unwrap_or_else(|| panic!("no {kind} event for {id}"))
}

fn position(calls: &[String], id: &str) -> usize {
    calls
        .iter()
        .position(|c| c == id)
        .unwrap_or_else(|| panic!("{id} not called: {calls:?}"))
}

#[tokio::test]
async fn first_apply_creates_cache_network_then_container() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let (engine, mock) = engine(home.path());
    let bp = write_blueprint(project.path(), &s1());

    let state = engine.apply(&bp, &CancellationToken::new()).await.unwrap();

    assert_eq!(mock.calls_of(Op::Create), vec![IMAGE_CACHE_ID, NET, CONSUL]);
    assert_eq!(state.len(), 3);
    let ids: Vec<String> = state.ids().map(ToString::to_string).collect();
    assert_eq!(ids, vec![IMAGE_CACHE_ID, NET, CONSUL]);
    let cache = state.get(IMAGE_CACHE_ID).unwrap();
    assert_eq!(cache.meta.depends_on, vec![NET]);
    for r in &state {
        assert_eq!(r.status(), Some(Status::Created), "{}", r.id());
    }
    assert!(state.get(CONSUL).unwrap().property("backend_id").is_some());

    let on_disk = StateStore::new(&HomeLayout::new(home.path())).load().unwrap();
    assert_eq!(on_disk.len(), 3);
    assert_eq!(engine.config().len(), 3);
    assert_eq!(engine.resource_count_for_type("container"), 1);
    assert_eq!(engine.resource_count_for_type("image_cache"), 1);
}

#[tokio::test]
async fn reapply_without_changes_only_refreshes() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let (engine, mock) = engine(home.path());
    let bp = write_blueprint(project.path(), &s1());
    let cancel = CancellationToken::new();

    engine.apply(&bp, &cancel).await.unwrap();
    mock.clear_calls();
    let state = engine.apply(&bp, &cancel).await.unwrap();

    assert!(mock.calls_of(Op::Create).is_empty());
    assert!(mock.calls_of(Op::Destroy).is_empty());
    assert_eq!(mock.calls_of(Op::Refresh).len(), state.len());
}

#[tokio::test]
async fn runtime_outputs_do_not_trigger_rebuild() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let (engine, mock) = engine(home.path());
    let bp = write_blueprint(project.path(), &s1());
    let cancel = CancellationToken::new();
    engine.apply(&bp, &cancel).await.unwrap();

    let store = StateStore::new(&HomeLayout::new(home.path()));
    let mut state = store.load().unwrap();
    state
        .get_mut(CONSUL)
        .unwrap()
        .set_property("ip_address", "10.15.0.200");
    store.save(&state).unwrap();

    mock.clear_calls();
    engine.apply(&bp, &cancel).await.unwrap();
    assert!(mock.calls_of(Op::Destroy).is_empty());
    assert_eq!(mock.ops_for(CONSUL), vec![Op::Changed, Op::Refresh]);
}

#[tokio::test]
async fn changed_declaration_is_destroyed_and_recreated() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let (engine, mock) = engine(home.path());
    let cancel = CancellationToken::new();
    engine
        .apply(&write_blueprint(project.path(), &s1()), &cancel)
        .await
        .unwrap();

    mock.clear_calls();
    let bp = write_blueprint(project.path(), &stack("consul:1.9.0", ""));
    let state = engine.apply(&bp, &cancel).await.unwrap();

    assert_eq!(mock.ops_for(CONSUL), vec![Op::Destroy, Op::Create]);
    assert_eq!(mock.ops_for(NET), vec![Op::Changed, Op::Refresh]);
    let consul = state.get(CONSUL).unwrap();
    assert_eq!(consul.field_str("image"), Some("consul:1.9.0"));
    assert_eq!(consul.status(), Some(Status::Created));
}

#[tokio::test]
async fn recreated_dependency_outlives_its_dependent() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let (engine, mock) = engine(home.path());
    let cancel = CancellationToken::new();
    engine
        .apply(&write_blueprint(project.path(), &s1()), &cancel)
        .await
        .unwrap();

    mock.clear_calls();
    mock.delay(CONSUL, Op::Destroy, Duration::from_millis(150));
    let mut events = engine.events();
    let bp = write_blueprint(
        project.path(),
        &stack("consul:1.9.0", "").replace("10.15.0.0/16", "10.16.0.0/16"),
    );
    let state = engine.apply(&bp, &cancel).await.unwrap();

    assert_eq!(mock.calls_of(Op::Destroy), vec![CONSUL, NET]);
    assert_eq!(mock.ops_for(NET), vec![Op::Destroy, Op::Create]);
    assert_eq!(mock.ops_for(CONSUL), vec![Op::Destroy, Op::Create]);
    let events = events.drain();
    assert!(
        event_index(&events, CONSUL, EventKind::Destroyed)
            < event_index(&events, NET, EventKind::Destroying)
    );
    assert!(
        event_index(&events, NET, EventKind::Created)
            < event_index(&events, CONSUL, EventKind::Creating)
    );

    assert!(state.iter().all(|r| r.status() == Some(Status::Created)));
    assert_eq!(state.get(IMAGE_CACHE_ID).unwrap().meta.depends_on, vec![NET]);
}

#[tokio::test]
async fn removed_dependent_goes_before_recreated_dependency() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let (engine, mock) = engine(home.path());
    let cancel = CancellationToken::new();
    engine
        .apply(&write_blueprint(project.path(), &s1()), &cancel)
        .await
        .unwrap();

    mock.clear_calls();
    let mut events = engine.events();
    let bp = write_blueprint(
        project.path(),
        "[[resource]]\ntype = \"network\"\nname = \"onprem\"\nsubnet = \"10.16.0.0/16\"\n",
    );
    let state = engine.apply(&bp, &cancel).await.unwrap();

    assert_eq!(mock.calls_of(Op::Destroy), vec![CONSUL, NET]);
    assert_eq!(mock.ops_for(CONSUL), vec![Op::Destroy]);
    let events = events.drain();
    assert!(
        event_index(&events, CONSUL, EventKind::Destroyed)
            < event_index(&events, NET, EventKind::Destroying)
    );
    assert!(!state.contains(CONSUL));
    assert_eq!(state.get(NET).unwrap().status(), Some(Status::Created));
}

#[tokio::test]
async fn failed_teardown_is_not_recreated() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let (engine, mock) = engine(home.path());
    let cancel = CancellationToken::new();
    engine
        .apply(&write_blueprint(project.path(), CHAIN), &cancel)
        .await
        .unwrap();

    mock.clear_calls();
    mock.fail(
        "resource.container.a",
        Op::Destroy,
        ProviderError::Fatal("in use".to_owned()),
    );
    let bp = write_blueprint(
        project.path(),
        &CHAIN.replacen("image = \"alpine\"", "image = \"alpine:3.19\"", 1),
    );
    let err = engine.apply(&bp, &cancel).await.unwrap_err();
    let CoreError::Failed(report) = &err else {
        panic!("expected composite failure, got {err}");
    };
    assert_eq!(report.failures().count(), 1);
    assert_eq!(report.skipped(), 2);

    assert_eq!(mock.ops_for("resource.container.a"), vec![Op::Destroy]);
    for id in ["resource.container.b", "resource.container.c"] {
        let ops = mock.ops_for(id);
        assert!(!ops.contains(&Op::Refresh) && !ops.contains(&Op::Create), "{id}: {ops:?}");
    }
    assert_eq!(mock.ops_for("resource.container.solo"), vec![Op::Changed, Op::Refresh]);
    assert_eq!(
        engine.config().get("resource.container.a").unwrap().status(),
        Some(Status::Failed)
    );
}

#[tokio::test]
async fn disabling_created_resource_destroys_it() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let (engine, mock) = engine(home.path());
    let cancel = CancellationToken::new();
    engine
        .apply(&write_blueprint(project.path(), &s1()), &cancel)
        .await
        .unwrap();

    mock.clear_calls();
    let bp = write_blueprint(project.path(), &stack("consul:1.8.1", "disabled = true"));
    let state = engine.apply(&bp, &cancel).await.unwrap();

    assert_eq!(mock.ops_for(CONSUL), vec![Op::Destroy]);
    assert!(!mock.exists(CONSUL));
    assert_eq!(state.get(CONSUL).unwrap().status(), Some(Status::Disabled));
    assert_eq!(state.len(), 3);
}

#[tokio::test]
async fn removed_resource_is_destroyed_once_and_dropped() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let (engine, mock) = engine(home.path());
    let cancel = CancellationToken::new();
    engine
        .apply(&write_blueprint(project.path(), &s1()), &cancel)
        .await
        .unwrap();

    mock.clear_calls();
    let bp = write_blueprint(
        project.path(),
        "[[resource]]\ntype = \"network\"\nname = \"onprem\"\nsubnet = \"10.15.0.0/16\"\n",
    );
    let state = engine.apply(&bp, &cancel).await.unwrap();
    assert_eq!(mock.calls_of(Op::Destroy), vec![CONSUL]);
    assert!(!state.contains(CONSUL));
    assert!(state.contains(NET));
    assert!(state.contains(IMAGE_CACHE_ID));

    mock.clear_calls();
    engine.apply(&bp, &cancel).await.unwrap();
    assert!(mock.calls_of(Op::Destroy).is_empty());
}

#[tokio::test]
async fn overlapping_networks_are_rejected_before_any_provider_call() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let (engine, mock) = engine(home.path());
    let bp = write_blueprint(
        project.path(),
        r#"
[[resource]]
type = "network"
name = "net_a"
subnet = "10.1.0.0/16"

[[resource]]
type = "network"
name = "net_b"
subnet = "10.1.0.0/16"
"#,
    );

    let err = engine
        .apply(&bp, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidConfig(_)), "{err}");
    assert_eq!(err.exit_code(), EXIT_INVALID_CONFIG);
    assert!(mock.calls().is_empty());
    assert!(!StateStore::new(&HomeLayout::new(home.path())).exists());
}

#[tokio::test]
async fn invalid_blueprint_calls_no_provider() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let (engine, mock) = engine(home.path());
    let bp = write_blueprint(
        project.path(),
        "[[resource]]\ntype = \"container\"\nname = \"a\"\ndepends_on = [\"container.missing\"]\n",
    );
    let err = engine
        .apply(&bp, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidConfig(_)));
    assert!(mock.calls().is_empty());
}

const SHARED_NETWORK: &str = r#"
[[resource]]
type = "network"
name = "n1"
subnet = "10.20.0.0/16"

[[resource]]
type = "container"
name = "c1"
image = "alpine"
depends_on = ["network.n1"]

[[resource]]
type = "container"
name = "c2"
image = "alpine"
depends_on = ["network.n1"]
"#;

#[tokio::test]
async fn sibling_failure_does_not_stop_independent_sibling() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let (engine, mock) = engine(home.path());
    mock.fail(
        "resource.container.c1",
        Op::Create,
        ProviderError::Fatal("image pull failed".to_owned()),
    );
    let bp = write_blueprint(project.path(), SHARED_NETWORK);

    let err = engine
        .apply(&bp, &CancellationToken::new())
        .await
        .unwrap_err();
    let CoreError::Failed(report) = &err else {
        panic!("expected composite failure, got {err}");
    };
    assert_eq!(report.failures().count(), 1);
    assert_eq!(report.skipped(), 0);

    let creates = mock.calls_of(Op::Create);
    let n1 = position(&creates, "resource.network.n1");
    assert!(n1 < position(&creates, "resource.container.c1"));
    assert!(n1 < position(&creates, "resource.container.c2"));

    let state = engine.config();
    assert_eq!(
        state.get("resource.container.c1").unwrap().status(),
        Some(Status::Failed)
    );
    assert_eq!(
        state.get("resource.container.c2").unwrap().status(),
        Some(Status::Created)
    );
}

#[tokio::test]
async fn peers_run_concurrently() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let (engine, mock) = engine(home.path());
    mock.delay("resource.container.c1", Op::Create, Duration::from_millis(200));
    mock.delay("resource.container.c2", Op::Create, Duration::from_millis(200));
    let mut events = engine.events();
    let bp = write_blueprint(project.path(), SHARED_NETWORK);

    engine.apply(&bp, &CancellationToken::new()).await.unwrap();

    let seq: Vec<(String, EventKind)> = events
        .drain()
        .into_iter()
        .filter(|e| e.id.starts_with("resource.container."))
        .filter(|e| matches!(e.event, EventKind::Creating | EventKind::Created))
        .map(|e| (e.id, e.event))
        .collect();
    let first_created = seq
        .iter()
        .position(|(_, k)| *k == EventKind::Created)
        .unwrap();
    let creating_before = seq[..first_created]
        .iter()
        .filter(|(_, k)| *k == EventKind::Creating)
        .count();
    assert_eq!(creating_before, 2, "{seq:?}");
}

#[tokio::test]
async fn disabled_lifecycle() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let (engine, mock) = engine(home.path());
    let cancel = CancellationToken::new();
    let declared = |disabled: bool| {
        format!("[[resource]]\ntype = \"container\"\nname = \"app\"\nimage = \"nginx\"\ndisabled = {disabled}\n")
    };
    let app = "resource.container.app";

    let state = engine
        .apply(&write_blueprint(project.path(), &declared(true)), &cancel)
        .await
        .unwrap();
    assert!(mock.ops_for(app).is_empty());
    assert_eq!(state.get(app).unwrap().status(), Some(Status::Disabled));

    engine
        .apply(&write_blueprint(project.path(), &declared(false)), &cancel)
        .await
        .unwrap();
    assert_eq!(mock.ops_for(app), vec![Op::Create]);

    mock.clear_calls();
    let state = engine
        .apply(&write_blueprint(project.path(), &declared(true)), &cancel)
        .await
        .unwrap();
    assert_eq!(mock.ops_for(app), vec![Op::Destroy]);
    assert_eq!(state.get(app).unwrap().status(), Some(Status::Disabled));
}

const CHAIN: &str = r#"
[[resource]]
type = "container"
name = "a"
image = "alpine"

[[resource]]
type = "container"
name = "b"
image = "alpine"
depends_on = ["container.a"]

[[resource]]
type = "container"
name = "c"
image = "alpine"
depends_on = ["container.b"]

[[resource]]
type = "container"
name = "solo"
image = "alpine"
"#;

#[tokio::test]
async fn failure_skips_every_dependent() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let (engine, mock) = engine(home.path());
    mock.fail(
        "resource.container.a",
        Op::Create,
        ProviderError::Fatal("boom".to_owned()),
    );

    let err = engine
        .apply(&write_blueprint(project.path(), CHAIN), &CancellationToken::new())
        .await
        .unwrap_err();
    let CoreError::Failed(report) = &err else {
        panic!("expected composite failure, got {err}");
    };
    assert_eq!(report.failures().count(), 1);
    assert_eq!(report.skipped(), 2);
    assert_eq!(err.exit_code(), 1);

    assert!(mock.ops_for("resource.container.b").is_empty());
    assert!(mock.ops_for("resource.container.c").is_empty());
    assert!(mock.exists("resource.container.solo"));

    let state = engine.config();
    assert_eq!(
        state.get("resource.container.a").unwrap().status(),
        Some(Status::Failed)
    );
    assert!(!state.contains("resource.container.b"));
    assert!(!state.contains("resource.container.c"));
}

#[tokio::test]
async fn failed_resource_is_retried_next_apply() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let (engine, mock) = engine(home.path());
    let cancel = CancellationToken::new();
    let bp = write_blueprint(project.path(), CHAIN);
    mock.fail(
        "resource.container.a",
        Op::Create,
        ProviderError::Fatal("boom".to_owned()),
    );
    assert!(engine.apply(&bp, &cancel).await.is_err());

    mock.reset_faults();
    mock.clear_calls();
    let state = engine.apply(&bp, &cancel).await.unwrap();
    assert_eq!(
        mock.ops_for("resource.container.a"),
        vec![Op::Destroy, Op::Create]
    );
    assert_eq!(mock.ops_for("resource.container.b"), vec![Op::Create]);
    assert!(state.iter().all(|r| r.status() == Some(Status::Created)));
}

#[tokio::test]
async fn destroy_runs_in_reverse_order_and_clears_state() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let (engine, mock) = engine(home.path());
    let cancel = CancellationToken::new();
    engine
        .apply(&write_blueprint(project.path(), &s1()), &cancel)
        .await
        .unwrap();

    mock.clear_calls();
    engine.destroy(false, &cancel).await.unwrap();

    assert_eq!(mock.calls_of(Op::Destroy), vec![CONSUL, NET, IMAGE_CACHE_ID]);
    assert!(mock.existing().is_empty());
    assert!(!StateStore::new(&HomeLayout::new(home.path())).exists());
    assert!(engine.config().is_empty());
}

#[tokio::test]
async fn dependencies_complete_before_dependents_start() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let (engine, mock) = engine(home.path());
    let cancel = CancellationToken::new();
    mock.delay(IMAGE_CACHE_ID, Op::Create, Duration::from_millis(100));
    mock.delay(NET, Op::Create, Duration::from_millis(150));
    let mut events = engine.events();
    engine
        .apply(&write_blueprint(project.path(), &s1()), &cancel)
        .await
        .unwrap();
    let created = events.drain();
    assert!(
        event_index(&created, IMAGE_CACHE_ID, EventKind::Created)
            < event_index(&created, NET, EventKind::Creating)
    );
    assert!(
        event_index(&created, NET, EventKind::Created)
            < event_index(&created, CONSUL, EventKind::Creating)
    );

    mock.delay(CONSUL, Op::Destroy, Duration::from_millis(150));
    mock.delay(NET, Op::Destroy, Duration::from_millis(100));
    engine.destroy(false, &cancel).await.unwrap();
    let destroyed = events.drain();
    assert!(
        event_index(&destroyed, CONSUL, EventKind::Destroyed)
            < event_index(&destroyed, NET, EventKind::Destroying)
    );
    assert!(
        event_index(&destroyed, NET, EventKind::Destroyed)
            < event_index(&destroyed, IMAGE_CACHE_ID, EventKind::Destroying)
    );
}

#[tokio::test]
async fn destroy_failure_keeps_partial_state() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let (engine, mock) = engine(home.path());
    let cancel = CancellationToken::new();
    engine
        .apply(&write_blueprint(project.path(), &s1()), &cancel)
        .await
        .unwrap();

    mock.fail(NET, Op::Destroy, ProviderError::Fatal("in use".to_owned()));
    let err = engine.destroy(false, &cancel).await.unwrap_err();
    assert!(matches!(err, CoreError::Failed(_)));

    let state = StateStore::new(&HomeLayout::new(home.path())).load().unwrap();
    let ids: Vec<String> = state.ids().map(ToString::to_string).collect();
    assert_eq!(ids, vec![NET]);
    assert_eq!(state.get(NET).unwrap().status(), Some(Status::Failed));
}

#[tokio::test]
async fn destroy_skips_disabled_entries() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let (engine, mock) = engine(home.path());
    let cancel = CancellationToken::new();
    engine
        .apply(
            &write_blueprint(project.path(), &stack("consul:1.8.1", "disabled = true")),
            &cancel,
        )
        .await
        .unwrap();

    mock.clear_calls();
    engine.destroy(false, &cancel).await.unwrap();
    assert!(mock.ops_for(CONSUL).is_empty());
    assert_eq!(mock.calls_of(Op::Destroy), vec![NET, IMAGE_CACHE_ID]);
}

#[tokio::test]
async fn every_new_network_binds_and_refreshes_cache_once() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let (engine, mock) = engine(home.path());
    let bp = write_blueprint(
        project.path(),
        r#"
[[resource]]
type = "network"
name = "a"
subnet = "10.30.0.0/16"

[[resource]]
type = "network"
name = "b"
subnet = "10.31.0.0/16"
"#,
    );
    let state = engine.apply(&bp, &CancellationToken::new()).await.unwrap();

    let cache = state.get(IMAGE_CACHE_ID).unwrap();
    assert!(cache.meta.depends_on.contains(&"resource.network.a".into()));
    assert!(cache.meta.depends_on.contains(&"resource.network.b".into()));
    assert_eq!(mock.ops_for(IMAGE_CACHE_ID), vec![Op::Create, Op::Refresh, Op::Refresh]);
}

#[tokio::test]
async fn removed_network_is_unbound_from_cache() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let (engine, mock) = engine(home.path());
    let cancel = CancellationToken::new();
    engine
        .apply(&write_blueprint(project.path(), &s1()), &cancel)
        .await
        .unwrap();

    mock.clear_calls();
    let bp = write_blueprint(
        project.path(),
        "[[resource]]\ntype = \"container\"\nname = \"solo\"\nimage = \"alpine\"\n",
    );
    let state = engine.apply(&bp, &cancel).await.unwrap();
    let destroys = mock.calls_of(Op::Destroy);
    assert!(position(&destroys, CONSUL) < position(&destroys, NET));
    assert!(state.get(IMAGE_CACHE_ID).unwrap().meta.depends_on.is_empty());
    assert_eq!(mock.ops_for(IMAGE_CACHE_ID), vec![Op::Refresh]);
}

#[tokio::test]
async fn checkpointed_state_survives_provider_panic() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let bp = write_blueprint(project.path(), CHAIN);
    {
        let (engine, mock) = engine(home.path());
        mock.panic_on("resource.container.c", Op::Create);
        let err = engine
            .apply(&bp, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("provider panicked"));
    }

    let (restarted, _mock) = engine(home.path());
    let state = restarted.config();
    for id in ["resource.container.a", "resource.container.b", "resource.container.solo"] {
        assert_eq!(state.get(id).unwrap().status(), Some(Status::Created), "{id}");
    }
    assert_eq!(
        state.get("resource.container.c").unwrap().status(),
        Some(Status::Failed)
    );
}

#[tokio::test]
async fn cancellation_stops_dispatch_and_skips_removal() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let (engine, mock) = engine(home.path());
    engine
        .apply(
            &write_blueprint(
                project.path(),
                "[[resource]]\ntype = \"container\"\nname = \"old\"\nimage = \"alpine\"\n",
            ),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    mock.clear_calls();
    mock.delay("resource.container.slow", Op::Create, Duration::from_secs(30));
    let bp = write_blueprint(
        project.path(),
        r#"
[[resource]]
type = "container"
name = "slow"
image = "alpine"

[[resource]]
type = "container"
name = "after"
image = "alpine"
depends_on = ["container.slow"]
"#,
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = engine.apply(&bp, &cancel).await.unwrap_err();
    assert!(matches!(err, CoreError::Cancelled));
    assert_eq!(err.exit_code(), EXIT_CANCELLED);

    assert!(mock.ops_for("resource.container.after").is_empty());
    assert!(mock.calls_of(Op::Destroy).is_empty());
    let state = engine.config();
    assert_eq!(
        state.get("resource.container.slow").unwrap().status(),
        Some(Status::Failed)
    );
    assert!(!state.contains("resource.container.after"));
    assert_eq!(
        state.get("resource.container.old").unwrap().status(),
        Some(Status::Created)
    );
}

#[tokio::test]
async fn tainted_resource_is_recreated() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let (engine, mock) = engine(home.path());
    let cancel = CancellationToken::new();
    let bp = write_blueprint(project.path(), &s1());
    engine.apply(&bp, &cancel).await.unwrap();

    let tainted = engine.taint(CONSUL).await.unwrap();
    assert_eq!(tainted.status(), Some(Status::Tainted));
    assert_eq!(engine.status().tainted, 1);

    mock.clear_calls();
    let state = engine.apply(&bp, &cancel).await.unwrap();
    assert_eq!(mock.ops_for(CONSUL), vec![Op::Changed, Op::Destroy, Op::Create]);
    assert_eq!(state.get(CONSUL).unwrap().status(), Some(Status::Created));
}

#[tokio::test]
async fn retryable_failures_are_retried() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let (engine, mock) = engine(home.path());
    mock.fail_times(
        CONSUL,
        Op::Create,
        ProviderError::Retryable("daemon busy".to_owned()),
        2,
    );
    engine
        .apply(&write_blueprint(project.path(), &s1()), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(mock.ops_for(CONSUL), vec![Op::Create, Op::Create, Op::Create]);
}

#[tokio::test]
async fn events_for_a_resource_are_ordered() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let (engine, _mock) = engine(home.path());
    let mut events = engine.events();
    engine
        .apply(&write_blueprint(project.path(), &s1()), &CancellationToken::new())
        .await
        .unwrap();

    let consul: Vec<EventKind> = events
        .drain()
        .into_iter()
        .filter(|e| e.id == CONSUL)
        .map(|e| e.event)
        .collect();
    assert_eq!(
        consul,
        vec![EventKind::Parsed, EventKind::Creating, EventKind::Created]
    );
}

#[tokio::test]
async fn explicit_variables_override_defaults() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let (engine, _mock) = engine(home.path());
    let bp = write_blueprint(
        project.path(),
        r#"
[variable.version]
default = "1.8.1"

[[resource]]
type = "container"
name = "consul"
image = "consul:${var.version}"
"#,
    );
    let vars_file = project.path().join("vars.toml");
    fs::write(&vars_file, "version = \"1.9.0\"\n").unwrap();

    let state = engine
        .apply_with_variables(&bp, &VariableSet::new(), Some(&vars_file), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(state.get(CONSUL).unwrap().field_str("image"), Some("consul:1.9.0"));

    let mut explicit = VariableSet::new();
    explicit.set("version", "1.10.0".into());
    let parsed = engine
        .parse_config_with_variables(&bp, &explicit, Some(&vars_file))
        .unwrap();
    assert_eq!(parsed.get(CONSUL).unwrap().field_str("image"), Some("consul:1.10.0"));
}

#[tokio::test]
async fn diff_reports_without_applying() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let (engine, mock) = engine(home.path());
    let cancel = CancellationToken::new();
    engine
        .apply(&write_blueprint(project.path(), &s1()), &cancel)
        .await
        .unwrap();

    mock.clear_calls();
    let bp = write_blueprint(
        project.path(),
        &stack("consul:1.9.0", "").replace("onprem", "lab"),
    );
    let plan = engine.diff(&bp, &VariableSet::new(), None).await.unwrap();
    let ids = |rs: Vec<&drydock_schema::Resource>| -> Vec<String> {
        rs.into_iter().map(|r| r.id().to_string()).collect()
    };
    assert_eq!(ids(plan.new_resources()), vec!["resource.network.lab"]);
    assert_eq!(ids(plan.changed()), vec![CONSUL]);
    let removed: Vec<String> = plan.removed().iter().map(|r| r.id().to_string()).collect();
    assert_eq!(removed, vec![NET]);
    assert!(mock.calls_of(Op::Create).is_empty());
    assert!(mock.calls_of(Op::Destroy).is_empty());
}

#[tokio::test]
async fn lookup_asks_the_provider() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let (engine, _mock) = engine(home.path());
    engine
        .apply(&write_blueprint(project.path(), &s1()), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(engine.lookup(CONSUL).await.unwrap(), vec![CONSUL]);
    assert!(matches!(
        engine.lookup("resource.container.ghost").await,
        Err(CoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn held_lock_rejects_apply() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let (engine, mock) = engine(home.path());
    let _held = StoreLock::acquire_or_fail(&HomeLayout::new(home.path()).lock_file()).unwrap();

    let err = engine
        .apply(&write_blueprint(project.path(), &s1()), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Locked(_)));
    assert!(mock.calls().is_empty());
}

#[test]
fn broken_plugin_is_fatal() {
    use std::os::unix::fs::PermissionsExt;

    let home = tempfile::tempdir().unwrap();
    let plugins = HomeLayout::new(home.path()).plugins_dir();
    fs::create_dir_all(&plugins).unwrap();
    let script = plugins.join("broken");
    fs::write(&script, "#!/bin/sh\necho 'not json'\n").unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

    let result = Engine::new(EngineConfig::with_home(home.path()), Registry::with_builtins());
    assert!(matches!(result, Err(CoreError::Plugin(_))));
}
