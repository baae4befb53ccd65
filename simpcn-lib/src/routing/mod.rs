use async_trait::async_trait;
use std::fmt::{Display, Formatter};

use crate::message::{Message, MessageType};
use crate::topology::{RoutingTable, Topology};
use crate::{NodeId, Path, SimulationError, Transaction};

pub mod flash;
pub mod lnd;
pub mod segflow;
pub mod shortest_path;
pub mod spider;
pub mod waterfilling;

/// The number of paths that LND-style routing tries before giving up on a payment.
pub const LND_ATTEMPT_CNT: usize = 3;
/// Payments with a volume below this threshold are routed by Flash as mice, the rest as elephants.
pub const FS_THRESH: f64 = 1789.99425;
pub const FLASH_PATH_CNT: usize = 4;
/// The maximum number of paths that Flash probes for an elephant payment.
pub const FLASH_PROBE_CNT: usize = 20;
pub const SPIDER_PATH_CNT: usize = 4;
/// Spider gives up on a payment after this many unit commits fail in a row.
pub const SPIDER_MAX_FAILURES: usize = 10;
/// The largest amount that Spider commits in a single message.
pub const SPIDER_UNIT: f64 = 1.0;
pub const WATERFILLING_PATH_CNT: usize = 4;
pub const SEGFLOW_PATH_CNT: usize = 4;

/// Sends protocol messages into the payment network on behalf of the local node.
#[async_trait]
pub trait PaymentNetwork: Send {
    /// Sends a forward message along its path and waits for the reply that comes back to the source.
    async fn round_trip(&mut self, msg: Message) -> Result<Message, SimulationError>;
}

/// Issues the protocol messages for a single transaction, assigning every request a fresh ID.
pub struct Payment<'a> {
    network: &'a mut dyn PaymentNetwork,
    next_request_id: &'a mut u64,
}

impl<'a> Payment<'a> {
    pub fn new(network: &'a mut dyn PaymentNetwork, next_request_id: &'a mut u64) -> Self {
        Payment {
            network,
            next_request_id,
        }
    }

    fn request_id(&mut self) -> u64 {
        let id = *self.next_request_id;
        *self.next_request_id += 1;
        id
    }

    async fn send(&mut self, msg: Message, expected: MessageType) -> Result<Message, SimulationError> {
        log::debug!("Sending {msg}.");
        let request_id = msg.request_id;

        let reply = self.network.round_trip(msg).await?;
        if reply.kind != expected || reply.request_id != request_id {
            log::warn!("Expected {expected} for request {request_id}, got {reply}.");
        }

        Ok(reply)
    }

    /// Probes the path, returning the reply that carries each hop's capacity.
    pub async fn probe(&mut self, path: &Path) -> Result<Message, SimulationError> {
        let msg = Message::probe(self.request_id(), path.clone());
        self.send(msg, MessageType::ProbeRet).await
    }

    /// Asks every hop on the path to lock `amount`. The reply's `commit_success` reports whether all hops did.
    pub async fn commit(&mut self, path: &Path, amount: f64) -> Result<Message, SimulationError> {
        let msg = Message::commit(self.request_id(), path.clone(), amount);
        self.send(msg, MessageType::CommitRet).await
    }

    /// Releases whatever each hop locked for a commit.
    pub async fn reverse(&mut self, committed: &Message) -> Result<(), SimulationError> {
        let msg = committed.follow_up(MessageType::Reverse);
        self.send(msg, MessageType::ReverseRet).await.map(|_| ())
    }

    /// Settles a successful commit, crediting its amount to the channels in the reverse direction.
    pub async fn confirm(&mut self, committed: &Message) -> Result<(), SimulationError> {
        let msg = committed.follow_up(MessageType::Confirm);
        self.send(msg, MessageType::ConfirmRet).await.map(|_| ())
    }

    /// Releases `amount` on every hop of the path, for amounts that were locked by several commits.
    pub async fn reverse_amount(&mut self, path: &Path, amount: f64) -> Result<(), SimulationError> {
        let msg = Message::reverse_amount(self.request_id(), path.clone(), amount);
        self.send(msg, MessageType::ReverseRet).await.map(|_| ())
    }

    /// Settles `amount` on every hop of the path, for amounts that were locked by several commits.
    pub async fn confirm_amount(&mut self, path: &Path, amount: f64) -> Result<(), SimulationError> {
        let msg = Message::confirm_amount(self.request_id(), path.clone(), amount);
        self.send(msg, MessageType::ConfirmRet).await.map(|_| ())
    }

    /// Confirms every commit if the payment succeeded, otherwise reverses them all.
    pub async fn settle(&mut self, committed: &[Message], success: bool) -> Result<(), SimulationError> {
        for msg in committed {
            if success {
                self.confirm(msg).await?;
            } else {
                self.reverse(msg).await?;
            }
        }

        Ok(())
    }
}

/// Everything a strategy may use while routing one transaction. The topology may be freely modified, the driver
/// restores it once the strategy returns.
pub struct RoutingContext<'a> {
    pub topology: &'a mut Topology,
    pub routing_table: &'a RoutingTable,
    pub payment: Payment<'a>,
}

/// The outcome of routing a single transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingOutcome {
    pub success: bool,
    /// Set by strategies that distinguish payments within the local node's subnets from those that leave them:
    /// `Some(true)` if the payment was completed within a subnet.
    pub subnet_local: Option<bool>,
}

impl RoutingOutcome {
    pub fn new(success: bool) -> Self {
        RoutingOutcome {
            success,
            subnet_local: None,
        }
    }

    pub fn failed() -> Self {
        RoutingOutcome::new(false)
    }
}

/// A routing algorithm that moves a transaction's volume from the local node to its destination.
#[async_trait]
pub trait RoutingStrategy: Send {
    fn name(&self) -> &'static str;

    async fn route(
        &mut self,
        tx: &Transaction,
        ctx: RoutingContext<'_>,
    ) -> Result<RoutingOutcome, SimulationError>;
}

/// Selects the routing strategy that a node runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Flash,
    ShortestPath,
    Waterfilling,
    Spider,
    Lnd,
    SegFlow,
}

impl Algorithm {
    /// The number of routing table entries per destination that the strategy considers, or `None` if it does not
    /// use the routing table.
    pub fn path_limit(&self) -> Option<usize> {
        match self {
            Algorithm::Flash => Some(FLASH_PATH_CNT),
            Algorithm::Waterfilling => Some(WATERFILLING_PATH_CNT),
            Algorithm::Spider => Some(SPIDER_PATH_CNT),
            Algorithm::SegFlow => Some(SEGFLOW_PATH_CNT),
            Algorithm::ShortestPath | Algorithm::Lnd => None,
        }
    }

    /// Creates the strategy, seeding any randomness it uses when a seed is provided.
    pub fn strategy(&self, seed: Option<u64>) -> Box<dyn RoutingStrategy> {
        match self {
            Algorithm::Flash => Box::new(flash::Flash::new(seed)),
            Algorithm::ShortestPath => Box::new(shortest_path::ShortestPath {}),
            Algorithm::Waterfilling => Box::new(waterfilling::Waterfilling {}),
            Algorithm::Spider => Box::new(spider::Spider {}),
            Algorithm::Lnd => Box::new(lnd::Lnd {}),
            Algorithm::SegFlow => Box::new(segflow::SegFlow {}),
        }
    }
}

impl TryFrom<u8> for Algorithm {
    type Error = SimulationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Algorithm::Flash),
            2 => Ok(Algorithm::ShortestPath),
            3 => Ok(Algorithm::Waterfilling),
            4 => Ok(Algorithm::Spider),
            5 => Ok(Algorithm::Lnd),
            6 => Ok(Algorithm::SegFlow),
            _ => Err(SimulationError::ValidationError(format!(
                "unknown algorithm {value}, expected 1 (Flash), 2 (SP), 3 (Waterfilling), 4 (Spider), 5 (LND) or \
                 6 (SegFlow)"
            ))),
        }
    }
}

impl Display for Algorithm {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Algorithm::Flash => "Flash",
            Algorithm::ShortestPath => "SP",
            Algorithm::Waterfilling => "Waterfilling",
            Algorithm::Spider => "Spider",
            Algorithm::Lnd => "LND",
            Algorithm::SegFlow => "SegFlow",
        };
        write!(f, "{name}")
    }
}

/// A candidate path and the strategy's running view of how much of the payment it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct PotentialPath {
    pub path: Path,
    /// Capacity not yet allocated to the payment.
    pub capacity: f64,
    pub pre_commit: f64,
}

impl PotentialPath {
    pub fn new(path: Path, capacity: f64) -> Self {
        PotentialPath {
            path,
            capacity,
            pre_commit: 0.0,
        }
    }
}

/// Rejects transactions that cannot be routed by any strategy.
pub(crate) fn validate_endpoints(local: NodeId, tx: &Transaction) -> Result<(), SimulationError> {
    if tx.source != local {
        return Err(SimulationError::ValidationError(format!(
            "{tx} does not originate at local node {local}"
        )));
    }

    if !tx.volume.is_finite() || tx.volume < 0.0 {
        return Err(SimulationError::ValidationError(format!(
            "{tx} has invalid volume"
        )));
    }

    Ok(())
}
