//! Dependency levels of a diff set.
//!
//! Diff `b` depends on diff `a` when the node of `a` has an edge to the node
//! of `b`, in either graph, carrying the behavior
//! `(a.field, a.action) -> (b.field, b.action)`. A diff's level is one more
//! than the highest level among its predecessors.

use std::collections::VecDeque;
use tracing::debug;

use crate::error::{BehaviorError, Result};
use crate::graph::Graph;

use super::types::Diff;

/// Sort key placing current nodes first, then deleted nodes.
type Rank = (u8, u64, usize);

/// Groups diffs into dependency levels.
///
/// Within a level, diffs are ordered by node creation order (current graph
/// first, deleted nodes by previous order) and then by emission order.
///
/// # Errors
///
/// Returns `CircularDependency` if the behaviors form a cycle.
pub fn level_diffs(diffs: Vec<Diff>, previous: &Graph, current: &Graph) -> Result<Vec<Vec<Diff>>> {
    let count = diffs.len();
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); count];
    let mut indegree = vec![0_usize; count];

    for (a, first) in diffs.iter().enumerate() {
        for (b, second) in diffs.iter().enumerate() {
            if a != b && precedes(first, second, previous, current) {
                successors[a].push(b);
                indegree[b] += 1;
            }
        }
    }

    let mut level = vec![0_usize; count];
    let mut queue: VecDeque<usize> = (0..count).filter(|&i| indegree[i] == 0).collect();
    let mut visited = 0;

    while let Some(index) = queue.pop_front() {
        visited += 1;
        for &next in &successors[index] {
            level[next] = level[next].max(level[index] + 1);
            indegree[next] -= 1;
            if indegree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if visited < count {
        let cycle = diffs
            .iter()
            .enumerate()
            .filter(|(i, _)| indegree[*i] > 0)
            .map(|(_, diff)| diff.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        return Err(BehaviorError::CircularDependency { cycle }.into());
    }

    let depth = level.iter().max().map_or(0, |deepest| deepest + 1);
    let mut ranked: Vec<Vec<(Rank, Diff)>> = (0..depth).map(|_| Vec::new()).collect();
    for (emission, diff) in diffs.into_iter().enumerate() {
        let rank = rank(&diff, emission, previous, current);
        ranked[level[emission]].push((rank, diff));
    }

    let levels: Vec<Vec<Diff>> = ranked
        .into_iter()
        .map(|mut entries| {
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            entries.into_iter().map(|(_, diff)| diff).collect()
        })
        .collect();

    debug!("Leveled {count} diffs into {} levels", levels.len());
    Ok(levels)
}

/// Returns true when `first` must be applied before `second`.
fn precedes(first: &Diff, second: &Diff, previous: &Graph, current: &Graph) -> bool {
    if first.context() == second.context() {
        return false;
    }
    [current, previous].into_iter().any(|graph| {
        graph.has_matching_behavior(
            first.context(),
            second.context(),
            (first.field(), first.action()),
            (second.field(), second.action()),
        )
    })
}

fn rank(diff: &Diff, emission: usize, previous: &Graph, current: &Graph) -> Rank {
    if let Some(id) = current.id_of(diff.context()) {
        (0, id.sequence(), emission)
    } else if let Some(id) = previous.id_of(diff.context()) {
        (1, id.sequence(), emission)
    } else {
        (2, 0, emission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Behavior, NodeSpec, StaticClass};
    use crate::planner::{DiffAction, DiffEngine};
    use crate::serialization::ClassRegistry;
    use std::sync::Arc;

    fn classes() -> Arc<ClassRegistry> {
        let mut registry = ClassRegistry::new();
        registry
            .register(StaticClass::model("@example", "app", "name"))
            .unwrap();
        registry
            .register(StaticClass::model("@example", "region", "regionId"))
            .unwrap();
        registry
            .register(StaticClass::model("@example", "environment", "environmentName"))
            .unwrap();
        Arc::new(registry)
    }

    #[test]
    fn test_parent_before_child() {
        let classes = classes();
        let previous = Graph::new(Arc::clone(&classes));
        let mut current = Graph::new(classes);
        let app = current.add_node(NodeSpec::new("@example/app", "t")).unwrap();
        let region = current
            .add_child(app, NodeSpec::new("@example/region", "r1"))
            .unwrap();
        current
            .add_child(region, NodeSpec::new("@example/environment", "qa"))
            .unwrap();

        let diffs = DiffEngine::new().compute(&previous, &current).unwrap();
        let levels = level_diffs(diffs, &previous, &current).unwrap();

        let contexts: Vec<Vec<&str>> = levels
            .iter()
            .map(|level| level.iter().map(Diff::context).collect())
            .collect();
        assert_eq!(
            contexts,
            vec![
                vec!["app=t"],
                vec!["region=r1,app=t"],
                vec!["environment=qa,region=r1,app=t"],
            ]
        );
    }

    #[test]
    fn test_deletes_follow_reverse_edges() {
        let classes = classes();
        let mut previous = Graph::new(Arc::clone(&classes));
        let app = previous.add_node(NodeSpec::new("@example/app", "t")).unwrap();
        previous
            .add_child(app, NodeSpec::new("@example/region", "r1"))
            .unwrap();
        let current = Graph::new(classes);

        let diffs = DiffEngine::new().compute(&previous, &current).unwrap();
        let levels = level_diffs(diffs, &previous, &current).unwrap();

        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0][0].context(), "region=r1,app=t");
        assert_eq!(levels[1][0].context(), "app=t");
        assert!(levels.iter().flatten().all(|d| d.action() == DiffAction::Delete));
    }

    #[test]
    fn test_ties_follow_creation_order() {
        let classes = classes();
        let previous = Graph::new(Arc::clone(&classes));
        let mut current = Graph::new(classes);
        for name in ["c", "a", "b"] {
            current.add_node(NodeSpec::new("@example/app", name)).unwrap();
        }

        let diffs = DiffEngine::new().compute(&previous, &current).unwrap();
        let levels = level_diffs(diffs, &previous, &current).unwrap();
        let order: Vec<&str> = levels[0].iter().map(Diff::context).collect();
        assert_eq!(order, vec!["app=c", "app=a", "app=b"]);
    }

    #[test]
    fn test_cycles_are_rejected() {
        let classes = classes();
        let previous = Graph::new(Arc::clone(&classes));
        let mut current = Graph::new(classes);
        let a = current.add_node(NodeSpec::new("@example/app", "a")).unwrap();
        let b = current.add_node(NodeSpec::new("@example/app", "b")).unwrap();
        let rule = Behavior::new("name", DiffAction::Add, "name", DiffAction::Add);
        current.add_behavior(a, b, rule.clone()).unwrap();
        current.add_behavior(b, a, rule).unwrap();

        let diffs = DiffEngine::new().compute(&previous, &current).unwrap();
        let err = level_diffs(diffs, &previous, &current).unwrap_err();
        assert!(err.to_string().contains("Circular dependency"));
    }
}
