use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};
use thiserror::Error;

use crate::{NodeId, Path, SubnetId, SimulationError};

#[derive(Debug, Error, PartialEq)]
pub enum TopologyError {
    #[error("UnknownSubnet: subnet {0} was not loaded")]
    UnknownSubnet(SubnetId),
    #[error("InvalidPath: {0:?} must contain at least a source and destination")]
    InvalidPath(Path),
    #[error("SelfLoop: edge from {0} to itself")]
    SelfLoop(NodeId),
}

impl From<TopologyError> for SimulationError {
    fn from(e: TopologyError) -> Self {
        SimulationError::TopologyError(e.to_string())
    }
}

/// The local node's knowledge of how much can be sent across a directed channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EdgeCapacity {
    /// The edge exists but has not been probed, so its capacity is not known.
    Unprobed,
    Known(f64),
}

impl EdgeCapacity {
    /// Whether a shortest path search may use this edge: unprobed edges are optimistically assumed to be usable.
    pub fn is_traversable(&self) -> bool {
        match self {
            EdgeCapacity::Unprobed => true,
            EdgeCapacity::Known(c) => *c > 0.0,
        }
    }

    pub fn known(&self) -> Option<f64> {
        match self {
            EdgeCapacity::Unprobed => None,
            EdgeCapacity::Known(c) => Some(*c),
        }
    }
}

impl Display for EdgeCapacity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            EdgeCapacity::Unprobed => write!(f, "unprobed"),
            EdgeCapacity::Known(c) => write!(f, "{c}"),
        }
    }
}

/// A directed graph of channel capacities, keyed by source and then destination node. Ordered maps keep neighbor
/// iteration stable so that searches are deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapacityGraph {
    edges: BTreeMap<NodeId, BTreeMap<NodeId, EdgeCapacity>>,
}

impl CapacityGraph {
    pub fn new() -> Self {
        CapacityGraph::default()
    }

    /// Sets the capacity of the directed edge `from -> to`, creating it if it does not exist.
    pub fn set(&mut self, from: NodeId, to: NodeId, capacity: EdgeCapacity) {
        self.edges.entry(from).or_default().insert(to, capacity);
    }

    /// Creates the directed edge with the capacity provided, leaving it untouched if it already exists.
    pub fn set_if_absent(&mut self, from: NodeId, to: NodeId, capacity: EdgeCapacity) {
        self.edges
            .entry(from)
            .or_default()
            .entry(to)
            .or_insert(capacity);
    }

    pub fn get(&self, from: NodeId, to: NodeId) -> Option<EdgeCapacity> {
        self.edges.get(&from).and_then(|n| n.get(&to)).copied()
    }

    /// Adds `delta` to a known edge's capacity, creating the edge as known if it is missing. Unprobed edges are left
    /// unprobed, because a residual credit says nothing about the channel's actual balance.
    pub fn add_residual(&mut self, from: NodeId, to: NodeId, delta: f64) {
        let edge = self
            .edges
            .entry(from)
            .or_default()
            .entry(to)
            .or_insert(EdgeCapacity::Known(0.0));

        if let EdgeCapacity::Known(c) = edge {
            *c += delta;
        }
    }

    /// Iterates over the outgoing edges of a node in ascending neighbor order.
    pub fn neighbors(&self, node: NodeId) -> impl Iterator<Item = (NodeId, EdgeCapacity)> + '_ {
        self.edges
            .get(&node)
            .into_iter()
            .flat_map(|n| n.iter().map(|(to, cap)| (*to, *cap)))
    }

    /// Reports whether the node appears at either end of any edge.
    pub fn contains_node(&self, node: NodeId) -> bool {
        self.edges.contains_key(&node) || self.edges.values().any(|n| n.contains_key(&node))
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(|n| n.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.edge_count() == 0
    }

    /// Copies every edge of `other` into this graph, overwriting any edges that both graphs hold.
    pub fn merge(&mut self, other: &CapacityGraph) {
        for (from, neighbors) in other.edges.iter() {
            for (to, cap) in neighbors.iter() {
                self.set(*from, *to, *cap);
            }
        }
    }
}

impl FromIterator<(NodeId, NodeId)> for CapacityGraph {
    /// Builds a graph where every edge listed is present but unprobed.
    fn from_iter<T: IntoIterator<Item = (NodeId, NodeId)>>(iter: T) -> Self {
        let mut graph = CapacityGraph::new();
        for (from, to) in iter {
            graph.set(from, to, EdgeCapacity::Unprobed);
        }
        graph
    }
}

/// Holds the graphs that the local node routes over: the global network and each of the subnets the node is part
/// of. Strategies mutate the live graphs as they learn capacities, and the driver restores them from the backups
/// taken at load time after every transaction.
#[derive(Debug, Clone)]
pub struct Topology {
    global: CapacityGraph,
    global_backup: CapacityGraph,
    subnets: BTreeMap<SubnetId, CapacityGraph>,
    subnet_backups: BTreeMap<SubnetId, CapacityGraph>,
}

impl Topology {
    pub fn new(global: CapacityGraph, subnets: BTreeMap<SubnetId, CapacityGraph>) -> Self {
        Topology {
            global_backup: global.clone(),
            global,
            subnet_backups: subnets.clone(),
            subnets,
        }
    }

    pub fn global(&self) -> &CapacityGraph {
        &self.global
    }

    pub fn global_mut(&mut self) -> &mut CapacityGraph {
        &mut self.global
    }

    pub fn subnet_mut(&mut self, id: SubnetId) -> Result<&mut CapacityGraph, TopologyError> {
        self.subnets
            .get_mut(&id)
            .ok_or(TopologyError::UnknownSubnet(id))
    }

    pub fn subnet_ids(&self) -> impl Iterator<Item = SubnetId> + '_ {
        self.subnets.keys().copied()
    }

    /// Returns the IDs of the loaded subnets that the node is a member of, in ascending order.
    pub fn subnets_containing(&self, node: NodeId) -> Vec<SubnetId> {
        self.subnets
            .iter()
            .filter(|(_, graph)| graph.contains_node(node))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Produces a single graph that is the union of the live subnet graphs listed.
    pub fn merged_subnets(&self, ids: &[SubnetId]) -> Result<CapacityGraph, TopologyError> {
        let mut merged = CapacityGraph::new();
        for id in ids {
            let subnet = self.subnets.get(id).ok_or(TopologyError::UnknownSubnet(*id))?;
            merged.merge(subnet);
        }

        Ok(merged)
    }

    /// Resets every live graph to the state it was loaded in.
    pub fn restore(&mut self) {
        self.global.clone_from(&self.global_backup);
        self.subnets.clone_from(&self.subnet_backups);
    }

    /// Reports whether every live graph is equal to its backup.
    pub fn is_pristine(&self) -> bool {
        self.global == self.global_backup && self.subnets == self.subnet_backups
    }
}

/// Precomputed candidate paths from the local node, keyed by destination.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutingTable {
    paths: HashMap<NodeId, Vec<Path>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        RoutingTable::default()
    }

    /// Appends a path towards its final node, keeping file order among paths to the same destination.
    pub fn insert(&mut self, path: Path) -> Result<(), TopologyError> {
        let destination = match path.last() {
            Some(dst) if path.len() >= 2 => *dst,
            _ => return Err(TopologyError::InvalidPath(path)),
        };

        self.paths.entry(destination).or_default().push(path);
        Ok(())
    }

    pub fn paths_to(&self, destination: NodeId) -> &[Path] {
        self.paths
            .get(&destination)
            .map(|p| p.as_slice())
            .unwrap_or(&[])
    }

    /// Keeps at most `limit` paths per destination, dropping those that appear last.
    pub fn truncate(&mut self, limit: usize) {
        for paths in self.paths.values_mut() {
            paths.truncate(limit);
        }
    }

    pub fn destination_count(&self) -> usize {
        self.paths.len()
    }
}
