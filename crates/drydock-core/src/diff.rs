//! Classification of desired resources against committed state.

use crate::CoreError;
use drydock_runtime::Registry;
use drydock_schema::{Config, DependencyGraph, Resource, ResourceId, TYPE_IMAGE_CACHE};
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Change {
    /// Not in committed state.
    New,
    /// Declaration differs from committed state, or the provider reported drift.
    Changed,
    Unchanged,
}

/// A classified diff, ready for the executor.
#[derive(Debug, Clone)]
pub struct Plan {
    pub desired: Config,
    pub graph: DependencyGraph,
    changes: HashMap<ResourceId, Change>,
    /// Committed resources absent from the desired set, in state order.
    pub removed: Vec<Resource>,
}

impl Plan {
    pub fn change(&self, id: &str) -> Option<Change> {
        self.changes.get(id).copied()
    }

    fn with_change(&self, change: Change) -> Vec<&Resource> {
        self.desired
            .iter()
            .filter(|r| self.change(r.id()) == Some(change))
            .collect()
    }

    pub fn new_resources(&self) -> Vec<&Resource> {
        self.with_change(Change::New)
    }

    pub fn changed(&self) -> Vec<&Resource> {
        self.with_change(Change::Changed)
    }

    pub fn unchanged(&self) -> Vec<&Resource> {
        self.with_change(Change::Unchanged)
    }

    pub fn removed(&self) -> &[Resource] {
        &self.removed
    }

    /// True when nothing would be created, recreated or removed.
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.changes.values().all(|c| *c == Change::Unchanged)
    }
}

/// Pair desired with committed by id and classify on `checksum.parsed`.
///
/// Iteration follows the desired `Config`, so the same inputs always
/// classify identically.
pub fn classify(desired: Config, committed: &Config) -> Result<Plan, CoreError> {
    let graph = DependencyGraph::build(&desired)?;
    let mut changes = HashMap::with_capacity(desired.len());

    for r in &desired {
        let change = match committed.get(r.id()) {
            None => Change::New,
            Some(prior) => {
                let parsed = &r.meta.checksum.parsed;
                if parsed.is_empty() || *parsed != prior.meta.checksum.parsed {
                    Change::Changed
                } else {
                    Change::Unchanged
                }
            }
        };
        changes.insert(r.id().clone(), change);
    }

    let removed = committed
        .iter()
        .filter(|c| c.kind() != TYPE_IMAGE_CACHE && !desired.contains(c.id()))
        .cloned()
        .collect();

    Ok(Plan {
        desired,
        graph,
        changes,
        removed,
    })
}

/// [`classify`], then ask the provider of every unchanged enabled resource
/// whether its backend drifted. Drift demotes the resource to
/// [`Change::Changed`]. A provider that cannot answer leaves it unchanged.
pub async fn compute(
    desired: Config,
    committed: &Config,
    registry: &Registry,
) -> Result<Plan, CoreError> {
    let mut plan = classify(desired, committed)?;

    let candidates: Vec<ResourceId> = plan
        .desired
        .iter()
        .filter(|r| !r.is_disabled() && plan.change(r.id()) == Some(Change::Unchanged))
        .map(|r| r.id().clone())
        .collect();

    for id in candidates {
        let Some(resource) = plan.desired.get(&id) else {
            continue;
        };
        let provider = match registry.provider(resource) {
            Ok(p) => p,
            Err(e) => {
                warn!("cannot check {id} for drift: {e}");
                continue;
            }
        };
        match provider.changed(resource).await {
            Ok(true) => {
                debug!("{id} drifted, scheduling recreate");
                plan.changes.insert(id, Change::Changed);
            }
            Ok(false) => {}
            Err(e) => warn!("drift check for {id} failed: {e}"),
        }
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use drydock_runtime::{MockBackend, Op};
    use drydock_schema::{compute_checksum, IMAGE_CACHE_ID};

    fn declared(kind: &str, name: &str) -> Resource {
        let mut r = Resource::new("", kind, name);
        r.meta.checksum.parsed = compute_checksum(&r);
        r
    }

    fn config(resources: Vec<Resource>) -> Config {
        Config::try_from(resources).unwrap()
    }

    fn rehash(mut r: Resource) -> Resource {
        r.meta.checksum.parsed = compute_checksum(&r);
        r
    }

    #[test]
    fn classifies_new_changed_unchanged_removed() {
        let committed = config(vec![
            Resource::new("", TYPE_IMAGE_CACHE, "default"),
            declared("network", "onprem"),
            declared("container", "consul"),
            declared("container", "old"),
        ]);
        let desired = config(vec![
            declared("network", "onprem"),
            rehash(declared("container", "consul").with_field("image", "consul:1.9.0")),
            declared("container", "web"),
        ]);

        let plan = classify(desired, &committed).unwrap();
        assert_eq!(plan.change("resource.network.onprem"), Some(Change::Unchanged));
        assert_eq!(plan.change("resource.container.consul"), Some(Change::Changed));
        assert_eq!(plan.change("resource.container.web"), Some(Change::New));
        let removed: Vec<&str> = plan.removed().iter().map(|r| r.id().as_str()).collect();
        assert_eq!(removed, vec!["resource.container.old"]);
        assert!(!removed.contains(&IMAGE_CACHE_ID));
        assert!(!plan.is_empty());
    }

    #[test]
    fn missing_checksum_counts_as_changed() {
        let committed = config(vec![Resource::new("", "container", "a")]);
        let desired = config(vec![Resource::new("", "container", "a")]);
        let plan = classify(desired, &committed).unwrap();
        assert_eq!(plan.changed().len(), 1);
    }

    #[test]
    fn toggling_disabled_is_not_a_change() {
        let committed = config(vec![declared("container", "a")]);
        let desired = config(vec![rehash(declared("container", "a").disabled(true))]);
        let plan = classify(desired, &committed).unwrap();
        assert_eq!(plan.change("resource.container.a"), Some(Change::Unchanged));
        assert!(plan.is_empty());
    }

    #[test]
    fn lists_follow_desired_order() {
        let desired = config(vec![
            declared("container", "z"),
            declared("container", "a"),
            declared("container", "m"),
        ]);
        let plan = classify(desired, &Config::new()).unwrap();
        let ids: Vec<&str> = plan.new_resources().iter().map(|r| r.id().as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "resource.container.z",
                "resource.container.a",
                "resource.container.m"
            ]
        );
    }

    #[tokio::test]
    async fn drift_demotes_unchanged() {
        let mock = MockBackend::new();
        let mut registry = Registry::with_builtins();
        mock.register(&mut registry, &["container"]).unwrap();
        mock.set_drifted("resource.container.a", true);

        let committed = config(vec![
            declared("container", "a"),
            declared("container", "b"),
            declared("container", "off"),
        ]);
        let desired = config(vec![
            declared("container", "a"),
            declared("container", "b"),
            rehash(declared("container", "off").disabled(true)),
        ]);
        let plan = compute(desired, &committed, &registry).await.unwrap();
        assert_eq!(plan.change("resource.container.a"), Some(Change::Changed));
        assert_eq!(plan.change("resource.container.b"), Some(Change::Unchanged));
        assert_eq!(
            mock.calls_of(Op::Changed),
            vec!["resource.container.a", "resource.container.b"]
        );
    }

    #[tokio::test]
    async fn failing_drift_check_keeps_unchanged() {
        let mock = MockBackend::new();
        let mut registry = Registry::with_builtins();
        mock.register(&mut registry, &["container"]).unwrap();
        mock.fail(
            "resource.container.a",
            Op::Changed,
            drydock_runtime::ProviderError::Transient("daemon unreachable".to_owned()),
        );
        let committed = config(vec![declared("container", "a")]);
        let desired = config(vec![declared("container", "a")]);
        let plan = compute(desired, &committed, &registry).await.unwrap();
        assert_eq!(plan.change("resource.container.a"), Some(Change::Unchanged));
    }
}
