use std::collections::{HashMap, VecDeque};

use crate::topology::{CapacityGraph, EdgeCapacity};
use crate::{NodeId, Path};

/// The result of a max flow computation: the augmenting paths found, in discovery order, alongside the amount
/// pushed along each of them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaxFlow {
    pub total: f64,
    pub paths: Vec<Path>,
    pub flows: Vec<f64>,
}

/// Breadth first search from source to destination over the edges that `usable` accepts. Neighbors are explored in
/// ascending order, so among paths with the fewest hops the first one discovered is returned.
fn bfs<F>(graph: &CapacityGraph, source: NodeId, destination: NodeId, usable: F) -> Option<Path>
where
    F: Fn(EdgeCapacity) -> bool,
{
    if source == destination {
        return None;
    }

    let mut parents: HashMap<NodeId, NodeId> = HashMap::new();
    let mut queue = VecDeque::from([source]);

    while let Some(node) = queue.pop_front() {
        for (next, capacity) in graph.neighbors(node) {
            if next == source || parents.contains_key(&next) || !usable(capacity) {
                continue;
            }

            parents.insert(next, node);
            if next == destination {
                return Some(trace_back(&parents, source, destination));
            }
            queue.push_back(next);
        }
    }

    None
}

fn trace_back(parents: &HashMap<NodeId, NodeId>, source: NodeId, destination: NodeId) -> Path {
    let mut path = vec![destination];
    let mut current = destination;
    while current != source {
        match parents.get(&current) {
            Some(parent) => {
                current = *parent;
                path.push(current);
            },
            None => break,
        }
    }

    path.reverse();
    path
}

/// Finds the path with the fewest hops, treating unprobed edges and edges with positive known capacity as usable.
pub fn shortest_path(graph: &CapacityGraph, source: NodeId, destination: NodeId) -> Option<Path> {
    bfs(graph, source, destination, |c| c.is_traversable())
}

/// Returns the smallest known capacity along the path, or `None` if any hop is missing or unprobed.
pub fn path_bottleneck(graph: &CapacityGraph, path: &[NodeId]) -> Option<f64> {
    path.windows(2)
        .map(|hop| graph.get(hop[0], hop[1]).and_then(|c| c.known()))
        .try_fold(f64::INFINITY, |min, c| c.map(|c| min.min(c)))
        .filter(|min| min.is_finite())
}

/// Moves `amount` of residual capacity along the path: every forward edge is decreased and every reverse edge is
/// credited (and created, if absent).
pub fn push_flow(graph: &mut CapacityGraph, path: &[NodeId], amount: f64) {
    for hop in path.windows(2) {
        graph.add_residual(hop[0], hop[1], -amount);
        graph.add_residual(hop[1], hop[0], amount);
    }
}

/// Computes the maximum flow between source and destination by repeatedly searching for augmenting paths over
/// edges with positive known capacity. The graph is left holding the final residual capacities.
pub fn max_flow(graph: &mut CapacityGraph, source: NodeId, destination: NodeId) -> MaxFlow {
    let mut flow = MaxFlow::default();

    while let Some(path) = bfs(graph, source, destination, |c| {
        matches!(c, EdgeCapacity::Known(c) if c > 0.0)
    }) {
        let Some(amount) = path_bottleneck(graph, &path) else {
            break;
        };

        push_flow(graph, &path, amount);
        log::trace!("Augmenting path {path:?} carries {amount}.");

        flow.total += amount;
        flow.paths.push(path);
        flow.flows.push(amount);
    }

    flow
}
