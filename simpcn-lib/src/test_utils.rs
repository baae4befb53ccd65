use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::dispatcher::{route_message, Action, DispatchError};
use crate::message::{Message, MessageType};
use crate::routing::{Payment, PaymentNetwork, RoutingContext, RoutingOutcome, RoutingStrategy};
use crate::session::{ChannelState, MessageCounts};
use crate::topology::{CapacityGraph, RoutingTable, Topology};
use crate::{NodeId, Path, SimulationError, SubnetId, Transaction};

pub fn tx(source: NodeId, destination: NodeId, volume: f64) -> Transaction {
    Transaction {
        source,
        destination,
        volume,
    }
}

/// An in-process payment network that passes each message hop by hop through the same channel accounting and
/// routing decisions that a node applies, without any I/O.
#[derive(Debug, Default)]
pub struct LocalNetwork {
    channels: BTreeMap<(NodeId, NodeId), ChannelState>,
    sent: Vec<Message>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        LocalNetwork::default()
    }

    /// Adds a channel between two nodes, with the balance that each side can send to the other.
    pub fn with_channel(mut self, a: NodeId, b: NodeId, a_to_b: f64, b_to_a: f64) -> Self {
        self.channels.insert((a, b), ChannelState::new(a, b, a_to_b));
        self.channels.insert((b, a), ChannelState::new(b, a, b_to_a));
        self
    }

    pub fn capacity(&self, from: NodeId, to: NodeId) -> f64 {
        self.channels
            .get(&(from, to))
            .map(|c| c.capacity())
            .unwrap_or_default()
    }

    pub fn balances(&self) -> BTreeMap<(NodeId, NodeId), f64> {
        self.channels
            .iter()
            .map(|(k, c)| (*k, c.capacity()))
            .collect()
    }

    pub fn counts(&self) -> MessageCounts {
        let mut counts = MessageCounts::default();
        for channel in self.channels.values() {
            counts += channel.counts();
        }
        counts
    }

    /// Every request that the source sent, in order.
    pub fn sent(&self) -> &[Message] {
        &self.sent
    }

    pub fn sent_of(&self, kind: MessageType) -> Vec<Message> {
        self.sent.iter().filter(|m| m.kind == kind).cloned().collect()
    }

    /// A graph with every channel present but unprobed.
    pub fn graph(&self) -> CapacityGraph {
        CapacityGraph::from_iter(self.channels.keys().copied())
    }

    fn deliver(&mut self, mut msg: Message) -> Result<Message, SimulationError> {
        let mut from = msg.src;
        let mut to = *msg.path.get(1).ok_or_else(|| {
            SimulationError::ValidationError(format!("{msg} has no first hop"))
        })?;

        // Each hop is crossed at most twice, once in each direction.
        for _ in 0..2 * msg.path.len() {
            let channel = self
                .channels
                .get_mut(&(from, to))
                .ok_or(DispatchError::UnknownNextHop(to, msg.kind))?;

            msg = channel.apply(msg);
            match route_message(to, msg)? {
                Action::Deliver(reply) => return Ok(reply),
                Action::Forward { next_hop, msg: next } => {
                    from = to;
                    to = next_hop;
                    msg = next;
                },
            }
        }

        Err(SimulationError::SimulatedNetworkError(format!(
            "{msg} did not return to its source"
        )))
    }
}

#[async_trait]
impl PaymentNetwork for LocalNetwork {
    async fn round_trip(&mut self, msg: Message) -> Result<Message, SimulationError> {
        self.sent.push(msg.clone());
        self.deliver(msg)
    }
}

/// Bundles a local network with the topology and routing table that a strategy routes over.
pub struct TestHarness {
    pub network: LocalNetwork,
    pub topology: Topology,
    pub routing_table: RoutingTable,
    subnets: BTreeMap<SubnetId, CapacityGraph>,
    next_request_id: u64,
}

impl TestHarness {
    /// The global topology holds every channel of the network, unprobed.
    pub fn new(network: LocalNetwork) -> Self {
        TestHarness {
            topology: Topology::new(network.graph(), BTreeMap::new()),
            network,
            routing_table: RoutingTable::new(),
            subnets: BTreeMap::new(),
            next_request_id: 0,
        }
    }

    pub fn with_paths(mut self, paths: Vec<Path>) -> Self {
        for path in paths {
            self.routing_table.insert(path).unwrap();
        }
        self
    }

    pub fn with_subnet(mut self, id: SubnetId, edges: &[(NodeId, NodeId)]) -> Self {
        self.subnets
            .insert(id, CapacityGraph::from_iter(edges.iter().copied()));
        self.topology = Topology::new(self.topology.global().clone(), self.subnets.clone());
        self
    }

    pub fn context(&mut self) -> RoutingContext<'_> {
        RoutingContext {
            topology: &mut self.topology,
            routing_table: &self.routing_table,
            payment: Payment::new(&mut self.network, &mut self.next_request_id),
        }
    }

    pub async fn route(
        &mut self,
        strategy: &mut dyn RoutingStrategy,
        tx: Transaction,
    ) -> RoutingOutcome {
        strategy.route(&tx, self.context()).await.unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_network_round_trip() {
        let mut network = LocalNetwork::new()
            .with_channel(1, 2, 10.0, 0.0)
            .with_channel(2, 3, 4.0, 0.0);

        let reply = network
            .round_trip(Message::probe(1, vec![1, 2, 3]))
            .await
            .unwrap();
        assert_eq!(reply.kind, MessageType::ProbeRet);
        assert_eq!(reply.cap, vec![10.0, 4.0]);

        let reply = network
            .round_trip(Message::commit(2, vec![1, 2, 3], 5.0))
            .await
            .unwrap();
        assert!(!reply.commit_success);
        assert_eq!(reply.p1c, vec![5.0, 0.0]);
        assert_eq!(network.capacity(1, 2), 5.0);

        assert!(network
            .round_trip(Message::probe(3, vec![1, 4]))
            .await
            .is_err());
    }
}
