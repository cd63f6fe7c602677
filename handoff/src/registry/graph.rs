//! The validated stage dependency graph.

use super::StageSpec;
use crate::core::StageStatus;
use crate::errors::RegistryError;
use std::collections::{HashMap, HashSet, VecDeque};

/// A validated, acyclic set of stages.
///
/// Constructed once; every query is answered against the same immutable
/// graph. Stage lists returned by queries follow the topological order, which
/// breaks ties by declaration order.
#[derive(Debug, Clone)]
pub struct StageRegistry {
    /// Stage specifications by id.
    stages: HashMap<String, StageSpec>,
    /// Topologically sorted stage ids.
    order: Vec<String>,
    /// Position of each stage in `order`.
    rank: HashMap<String, usize>,
    /// Direct dependents of each stage, in topological order.
    dependents: HashMap<String, Vec<String>>,
}

impl StageRegistry {
    /// Builds a registry from a static stage list.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateStage`] on a repeated id,
    /// [`RegistryError::CyclicDependency`] if the graph is not a DAG, and the
    /// other [`RegistryError`] variants for malformed stages.
    pub fn new(specs: Vec<StageSpec>) -> Result<Self, RegistryError> {
        if specs.is_empty() {
            return Err(RegistryError::Empty);
        }

        let mut declared = Vec::with_capacity(specs.len());
        let mut stages = HashMap::with_capacity(specs.len());
        for spec in specs {
            spec.validate()?;
            if stages.contains_key(&spec.id) {
                return Err(RegistryError::DuplicateStage { stage: spec.id });
            }
            declared.push(spec.id.clone());
            stages.insert(spec.id.clone(), spec);
        }

        for id in &declared {
            for dep in &stages[id].dependencies {
                if !stages.contains_key(dep) {
                    return Err(RegistryError::UnknownDependency {
                        stage: id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        check_path_collisions(&declared, &stages)?;

        if let Some(cycle) = find_cycle(&declared, &stages) {
            return Err(RegistryError::CyclicDependency { cycle });
        }

        let order = topological_sort(&declared, &stages);
        let rank: HashMap<String, usize> = order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();

        let mut dependents: HashMap<String, Vec<String>> =
            order.iter().map(|id| (id.clone(), Vec::new())).collect();
        for id in &order {
            for dep in &stages[id].dependencies {
                if let Some(children) = dependents.get_mut(dep) {
                    children.push(id.clone());
                }
            }
        }

        Ok(Self {
            stages,
            order,
            rank,
            dependents,
        })
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true if the registry has no stages (never true once built).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Returns the stage ids in topological order.
    #[must_use]
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    /// Iterates over stage specifications in topological order.
    pub fn stages(&self) -> impl Iterator<Item = &StageSpec> {
        self.order.iter().filter_map(|id| self.stages.get(id))
    }

    /// Looks up a stage.
    #[must_use]
    pub fn get(&self, stage: &str) -> Option<&StageSpec> {
        self.stages.get(stage)
    }

    /// Returns true if the stage is declared.
    #[must_use]
    pub fn contains(&self, stage: &str) -> bool {
        self.stages.contains_key(stage)
    }

    /// Direct dependencies of a stage, in declaration order.
    #[must_use]
    pub fn dependencies(&self, stage: &str) -> &[String] {
        self.stages
            .get(stage)
            .map(|spec| spec.dependencies.as_slice())
            .unwrap_or_default()
    }

    /// Direct dependents of a stage.
    #[must_use]
    pub fn dependents(&self, stage: &str) -> &[String] {
        self.dependents
            .get(stage)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Every stage reachable downstream of `stage`, excluding itself.
    #[must_use]
    pub fn transitive_dependents(&self, stage: &str) -> Vec<String> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([stage]);

        while let Some(current) = queue.pop_front() {
            for child in self.dependents(current) {
                if seen.insert(child.as_str()) {
                    queue.push_back(child.as_str());
                }
            }
        }

        let mut result: Vec<String> = seen.into_iter().map(str::to_string).collect();
        self.sort_topologically(&mut result);
        result
    }

    /// Stages that are `Pending` and whose every dependency is `Completed`.
    ///
    /// Stages absent from `statuses` count as `Pending`.
    #[must_use]
    pub fn runnable_stages(&self, statuses: &HashMap<String, StageStatus>) -> Vec<String> {
        let status_of = |id: &str| statuses.get(id).copied().unwrap_or_default();

        self.order
            .iter()
            .filter(|id| status_of(id) == StageStatus::Pending)
            .filter(|id| {
                self.dependencies(id)
                    .iter()
                    .all(|dep| status_of(dep) == StageStatus::Completed)
            })
            .cloned()
            .collect()
    }

    /// The terminal synthesis stage: the stage whose dependencies are every
    /// other stage. `None` for single-stage registries or when no stage fits.
    #[must_use]
    pub fn synthesis_stage(&self) -> Option<&StageSpec> {
        if self.len() < 2 {
            return None;
        }
        self.stages().find(|spec| {
            self.order
                .iter()
                .filter(|id| **id != spec.id)
                .all(|id| spec.depends_on(id))
        })
    }

    /// Sorts stage ids by topological rank; unknown ids go last.
    pub fn sort_topologically(&self, ids: &mut [String]) {
        ids.sort_by_key(|id| self.rank.get(id).copied().unwrap_or(usize::MAX));
    }
}

fn check_path_collisions(
    declared: &[String],
    stages: &HashMap<String, StageSpec>,
) -> Result<(), RegistryError> {
    let mut seen: HashMap<String, String> = HashMap::new();
    for id in declared {
        for output in &stages[id].outputs {
            let stem = format!("{id}_{output}");
            let pair = format!("{id}/{output}");
            if let Some(first) = seen.insert(stem.clone(), pair.clone()) {
                return Err(RegistryError::ArtifactPathCollision {
                    file_stem: stem,
                    first,
                    second: pair,
                });
            }
        }
    }
    Ok(())
}

/// Depth-first search for a dependency cycle, visiting in declaration order.
fn find_cycle(declared: &[String], stages: &HashMap<String, StageSpec>) -> Option<Vec<String>> {
    fn dfs(
        node: &str,
        stages: &HashMap<String, StageSpec>,
        visited: &mut HashSet<String>,
        on_path: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        visited.insert(node.to_string());
        on_path.insert(node.to_string());
        path.push(node.to_string());

        if let Some(spec) = stages.get(node) {
            for dep in &spec.dependencies {
                if on_path.contains(dep) {
                    let start = path.iter().position(|n| n == dep).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(dep.clone());
                    return Some(cycle);
                }
                if !visited.contains(dep) {
                    if let Some(cycle) = dfs(dep, stages, visited, on_path, path) {
                        return Some(cycle);
                    }
                }
            }
        }

        path.pop();
        on_path.remove(node);
        None
    }

    let mut visited = HashSet::new();
    let mut on_path = HashSet::new();
    let mut path = Vec::new();

    for id in declared {
        if !visited.contains(id) {
            if let Some(cycle) = dfs(id, stages, &mut visited, &mut on_path, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

/// Kahn's algorithm; ready stages are taken in declaration order.
fn topological_sort(declared: &[String], stages: &HashMap<String, StageSpec>) -> Vec<String> {
    let mut remaining: HashMap<&str, usize> = declared
        .iter()
        .map(|id| {
            let distinct: HashSet<&str> =
                stages[id].dependencies.iter().map(String::as_str).collect();
            (id.as_str(), distinct.len())
        })
        .collect();
    let mut result = Vec::with_capacity(declared.len());

    while result.len() < declared.len() {
        let ready: Vec<&String> = declared
            .iter()
            .filter(|id| remaining.get(id.as_str()) == Some(&0))
            .collect();
        if ready.is_empty() {
            // Unreachable after find_cycle.
            break;
        }
        for id in ready {
            remaining.remove(id.as_str());
            result.push(id.clone());
            for other in declared {
                if stages[other].depends_on(id) {
                    if let Some(count) = remaining.get_mut(other.as_str()) {
                        *count = count.saturating_sub(1);
                    }
                }
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn stage(id: &str, deps: &[&str]) -> StageSpec {
        StageSpec::new(id)
            .with_dependencies(deps.iter().copied())
            .with_output("doc")
    }

    fn diamond() -> StageRegistry {
        StageRegistry::new(vec![
            stage("a", &[]),
            stage("b", &[]),
            stage("c", &["a", "b"]),
        ])
        .unwrap()
    }

    fn statuses(pairs: &[(&str, StageStatus)]) -> HashMap<String, StageStatus> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), *v)).collect()
    }

    #[test]
    fn test_registry_creation() {
        let registry = diamond();
        assert_eq!(registry.len(), 3);
        assert!(registry.contains("c"));
        assert_eq!(registry.dependencies("c"), ["a", "b"]);
    }

    #[test]
    fn test_topological_order_respects_dependencies() {
        let registry = StageRegistry::new(vec![
            stage("report", &["summary"]),
            stage("summary", &["load"]),
            stage("load", &[]),
        ])
        .unwrap();

        assert_eq!(registry.topological_order(), ["load", "summary", "report"]);
    }

    #[test]
    fn test_forward_references_are_allowed() {
        let registry = StageRegistry::new(vec![stage("b", &["a"]), stage("a", &[])]);
        assert!(registry.is_ok());
    }

    #[test]
    fn test_empty_registry() {
        assert_eq!(StageRegistry::new(vec![]).unwrap_err(), RegistryError::Empty);
    }

    #[test]
    fn test_duplicate_stage() {
        let err = StageRegistry::new(vec![stage("a", &[]), stage("a", &[])]).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateStage { stage: "a".into() });
    }

    #[test]
    fn test_repeated_dependency_rejected() {
        let repeated: StageSpec = serde_json::from_str(
            r#"{"id": "c", "dependencies": ["a", "a"], "outputs": ["doc"], "role": "worker"}"#,
        )
        .unwrap();
        let err = StageRegistry::new(vec![stage("a", &[]), repeated]).unwrap_err();
        assert_eq!(err.code(), "REGISTRY-DUPLICATE_DEP");
    }

    #[test]
    fn test_sort_counts_distinct_dependencies() {
        let mut c = stage("c", &[]);
        c.dependencies = vec!["a".into(), "a".into()];
        let declared = vec!["a".to_string(), "c".to_string()];
        let stages: HashMap<String, StageSpec> = [("a".to_string(), stage("a", &[])), ("c".to_string(), c)]
            .into_iter()
            .collect();
        assert_eq!(topological_sort(&declared, &stages), ["a", "c"]);
    }

    #[test]
    fn test_unknown_dependency() {
        let err = StageRegistry::new(vec![stage("a", &["missing"])]).unwrap_err();
        assert_eq!(err.code(), "REGISTRY-MISSING_DEP");
    }

    #[test]
    fn test_transitive_cycle_detected() {
        let err = StageRegistry::new(vec![
            stage("a", &["c"]),
            stage("b", &["a"]),
            stage("c", &["b"]),
        ])
        .unwrap_err();

        match err {
            RegistryError::CyclicDependency { cycle } => {
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 4);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_path_collision_detected() {
        let err = StageRegistry::new(vec![
            StageSpec::new("a_b").with_output("c"),
            StageSpec::new("a").with_output("b_c"),
        ])
        .unwrap_err();

        assert!(matches!(err, RegistryError::ArtifactPathCollision { .. }));
    }

    #[test]
    fn test_runnable_stages() {
        let registry = diamond();

        let all_pending = statuses(&[]);
        assert_eq!(registry.runnable_stages(&all_pending), ["a", "b"]);

        let a_done = statuses(&[("a", StageStatus::Completed), ("b", StageStatus::Running)]);
        assert!(registry.runnable_stages(&a_done).is_empty());

        let both_done = statuses(&[("a", StageStatus::Completed), ("b", StageStatus::Completed)]);
        assert_eq!(registry.runnable_stages(&both_done), ["c"]);

        let b_failed = statuses(&[("a", StageStatus::Completed), ("b", StageStatus::Failed)]);
        assert!(registry.runnable_stages(&b_failed).is_empty());
    }

    #[test]
    fn test_dependents() {
        let registry = StageRegistry::new(vec![
            stage("a", &[]),
            stage("b", &["a"]),
            stage("c", &["b"]),
            stage("d", &[]),
        ])
        .unwrap();

        assert_eq!(registry.dependents("a"), ["b"]);
        assert_eq!(registry.transitive_dependents("a"), ["b", "c"]);
        assert!(registry.transitive_dependents("d").is_empty());
        assert!(registry.dependents("unknown").is_empty());
    }

    #[test]
    fn test_synthesis_stage() {
        let registry = diamond();
        assert_eq!(registry.synthesis_stage().map(|s| s.id.as_str()), Some("c"));

        let chain = StageRegistry::new(vec![stage("a", &[]), stage("b", &[]), stage("c", &["a"])])
            .unwrap();
        assert!(chain.synthesis_stage().is_none());
    }
}
