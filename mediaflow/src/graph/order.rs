//! Deterministic stage ordering.

use super::StageId;
use std::collections::HashSet;
use tracing::warn;

/// Orders stages so that every producer comes before its consumers.
///
/// Ties are broken by insertion order, so the result is deterministic.
/// A cycle is reported and broken at the edge that closes it.
pub(crate) fn topological_sort(count: usize, edges: &[(StageId, StageId)]) -> Vec<StageId> {
    let mut upstream: Vec<Vec<StageId>> = vec![Vec::new(); count];
    for &(producer, consumer) in edges {
        if consumer.0 < count && !upstream[consumer.0].contains(&producer) {
            upstream[consumer.0].push(producer);
        }
    }

    let mut result = Vec::with_capacity(count);
    let mut visited = HashSet::new();
    let mut in_progress = HashSet::new();

    fn visit(
        node: StageId,
        upstream: &[Vec<StageId>],
        visited: &mut HashSet<StageId>,
        in_progress: &mut HashSet<StageId>,
        result: &mut Vec<StageId>,
    ) {
        if visited.contains(&node) {
            return;
        }
        if in_progress.contains(&node) {
            warn!(stage = %node, "cycle in stage graph, ordering is partial");
            return;
        }

        in_progress.insert(node);
        for &producer in &upstream[node.0] {
            visit(producer, upstream, visited, in_progress, result);
        }
        in_progress.remove(&node);
        visited.insert(node);
        result.push(node);
    }

    for index in 0..count {
        visit(
            StageId(index),
            &upstream,
            &mut visited,
            &mut in_progress,
            &mut result,
        );
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(order: &[StageId]) -> Vec<usize> {
        order.iter().map(|s| s.0).collect()
    }

    #[test]
    fn test_producers_first() {
        // sink added first, source last
        let edges = [(StageId(2), StageId(1)), (StageId(1), StageId(0))];
        assert_eq!(ids(&topological_sort(3, &edges)), vec![2, 1, 0]);
    }

    #[test]
    fn test_insertion_order_breaks_ties() {
        assert_eq!(ids(&topological_sort(3, &[])), vec![0, 1, 2]);
    }

    #[test]
    fn test_cycle_does_not_loop() {
        let edges = [(StageId(0), StageId(1)), (StageId(1), StageId(0))];
        assert_eq!(topological_sort(2, &edges).len(), 2);
    }
}
