use crate::config::Config;
use crate::types::ResourceId;
use crate::SchemaError;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// Dependency DAG over resource ids with a stable topological order.
///
/// Ties between resources that become ready at the same time are broken by
/// their position in the source `Config`, so the same input always yields the
/// same order.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    order: Vec<ResourceId>,
    position: HashMap<ResourceId, usize>,
    dependencies: HashMap<ResourceId, Vec<ResourceId>>,
    dependents: HashMap<ResourceId, Vec<ResourceId>>,
}

impl DependencyGraph {
    /// Build a graph where every `depends_on` entry must name a resource in
    /// `config`.
    pub fn build(config: &Config) -> Result<Self, SchemaError> {
        for r in config {
            for dep in &r.meta.depends_on {
                if !config.contains(dep) {
                    return Err(SchemaError::UnresolvedReference {
                        id: r.id().clone(),
                        reference: dep.to_string(),
                    });
                }
            }
        }
        Self::from_nodes(
            config
                .iter()
                .map(|r| (r.id().clone(), r.meta.depends_on.clone())),
        )
    }

    /// Build a graph that ignores edges to ids outside `config`. Used for
    /// committed state, where a dependency may already be gone.
    pub fn build_lenient(config: &Config) -> Result<Self, SchemaError> {
        Self::from_nodes(config.iter().map(|r| {
            let deps = r
                .meta
                .depends_on
                .iter()
                .filter(|d| config.contains(d))
                .cloned()
                .collect();
            (r.id().clone(), deps)
        }))
    }

    pub fn from_nodes(
        nodes: impl IntoIterator<Item = (ResourceId, Vec<ResourceId>)>,
    ) -> Result<Self, SchemaError> {
        let mut ids: Vec<ResourceId> = Vec::new();
        let mut dependencies: HashMap<ResourceId, Vec<ResourceId>> = HashMap::new();
        for (id, mut deps) in nodes {
            deps.dedup();
            ids.push(id.clone());
            dependencies.insert(id, deps);
        }

        let index: HashMap<&ResourceId, usize> =
            ids.iter().enumerate().map(|(i, id)| (id, i)).collect();
        let mut dependents: HashMap<ResourceId, Vec<ResourceId>> = HashMap::new();
        let mut in_degree = vec![0usize; ids.len()];
        for (i, id) in ids.iter().enumerate() {
            for dep in &dependencies[id] {
                if index.contains_key(dep) {
                    in_degree[i] += 1;
                    dependents.entry(dep.clone()).or_default().push(id.clone());
                }
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();
        let mut order = Vec::with_capacity(ids.len());
        while let Some(Reverse(i)) = ready.pop() {
            let id = &ids[i];
            order.push(id.clone());
            for child in dependents.get(id).into_iter().flatten() {
                let c = index[child];
                in_degree[c] -= 1;
                if in_degree[c] == 0 {
                    ready.push(Reverse(c));
                }
            }
        }

        if order.len() != ids.len() {
            let mut stuck: Vec<String> = ids
                .iter()
                .enumerate()
                .filter(|(i, _)| in_degree[*i] > 0)
                .map(|(_, id)| id.to_string())
                .collect();
            stuck.sort();
            return Err(SchemaError::Cycle(stuck));
        }

        let position = order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();

        Ok(Self {
            order,
            position,
            dependencies,
            dependents,
        })
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position.contains_key(id)
    }

    /// Roots first.
    pub fn topological_order(&self) -> &[ResourceId] {
        &self.order
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.position.get(id).copied()
    }

    /// Direct dependencies of `id` that are part of this graph.
    pub fn dependencies(&self, id: &str) -> Vec<&ResourceId> {
        self.dependencies
            .get(id)
            .into_iter()
            .flatten()
            .filter(|d| self.contains(d))
            .collect()
    }

    /// Direct dependents of `id`.
    pub fn dependents(&self, id: &str) -> &[ResourceId] {
        self.dependents.get(id).map_or(&[], Vec::as_slice)
    }

    /// Every resource that depends on `id`, directly or transitively.
    pub fn transitive_dependents(&self, id: &str) -> HashSet<ResourceId> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&ResourceId> = self.dependents(id).iter().collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next.clone()) {
                stack.extend(self.dependents(next));
            }
        }
        seen
    }

    /// Every resource `id` depends on, directly or transitively.
    pub fn transitive_dependencies(&self, id: &str) -> HashSet<ResourceId> {
        let mut seen = HashSet::new();
        let mut stack = self.dependencies(id);
        while let Some(next) = stack.pop() {
            if seen.insert(next.clone()) {
                stack.extend(self.dependencies(next));
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Resource;

    fn node(name: &str, deps: &[&str]) -> (ResourceId, Vec<ResourceId>) {
        (
            ResourceId::new(name),
            deps.iter().map(|d| ResourceId::new(*d)).collect(),
        )
    }

    fn order(g: &DependencyGraph) -> Vec<&str> {
        g.topological_order().iter().map(ResourceId::as_str).collect()
    }

    #[test]
    fn roots_first_with_stable_ties() {
        let g = DependencyGraph::from_nodes(vec![
            node("c1", &["net"]),
            node("c2", &["net"]),
            node("net", &[]),
            node("other", &[]),
        ])
        .unwrap();
        assert_eq!(order(&g), vec!["net", "other", "c1", "c2"]);
    }

    #[test]
    fn chain_orders_by_dependency() {
        let g = DependencyGraph::from_nodes(vec![
            node("app", &["db"]),
            node("db", &["net"]),
            node("net", &[]),
        ])
        .unwrap();
        assert_eq!(order(&g), vec!["net", "db", "app"]);
        assert_eq!(g.dependencies("app"), vec![&ResourceId::new("db")]);
    }

    #[test]
    fn cycle_is_reported() {
        let err = DependencyGraph::from_nodes(vec![
            node("a", &["b"]),
            node("b", &["a"]),
            node("c", &[]),
        ])
        .unwrap_err();
        match err {
            SchemaError::Cycle(ids) => assert_eq!(ids, vec!["a", "b"]),
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[test]
    fn transitive_sets() {
        let g = DependencyGraph::from_nodes(vec![
            node("net", &[]),
            node("db", &["net"]),
            node("app", &["db"]),
            node("side", &[]),
        ])
        .unwrap();
        let dependents = g.transitive_dependents("net");
        assert!(dependents.contains("db"));
        assert!(dependents.contains("app"));
        assert!(!dependents.contains("side"));
        let deps = g.transitive_dependencies("app");
        assert_eq!(deps.len(), 2);
    }

    #[test]
    fn strict_build_rejects_unknown_reference() {
        let config = Config::try_from(vec![Resource::new("", "container", "a")
            .with_dependency("resource.network.missing")])
        .unwrap();
        assert!(matches!(
            DependencyGraph::build(&config),
            Err(SchemaError::UnresolvedReference { .. })
        ));
        let lenient = DependencyGraph::build_lenient(&config).unwrap();
        assert_eq!(lenient.len(), 1);
        assert!(lenient.dependencies("resource.container.a").is_empty());
    }
}
