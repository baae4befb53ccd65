#![deny(rustdoc::broken_intra_doc_links)]

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use self::dispatcher::DispatchError;
use self::routing::Algorithm;

pub mod batched_writer;
pub mod clock;
pub mod dispatcher;
pub mod driver;
pub mod latency;
pub mod message;
pub mod node;
pub mod pathfinding;
pub mod routing;
pub mod session;
pub mod topology;
#[cfg(test)]
mod test_utils;

/// Identifies a node in the payment channel network. Node IDs are 1-indexed once loaded.
pub type NodeId = u64;

/// Identifies a subnet that a set of nodes belong to.
pub type SubnetId = u64;

/// An ordered sequence of node IDs from the sender to the receiver, both inclusive.
pub type Path = Vec<NodeId>;

/// Tolerance used when deciding whether a volume has been fully routed, absorbing floating point error
/// accumulated when splitting a payment across paths.
pub const FLOW_TOLERANCE: f64 = 1e-6;

/// Describes a node in the network and, when it appears in a neighbor list, the capacity of the channel
/// that the local node holds towards it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    #[serde(rename = "nid")]
    pub id: NodeId,
    pub ip: String,
    pub port: u16,
    /// Outgoing channel balance towards this node. Zero for the local node's own record.
    #[serde(rename = "cap", default)]
    pub capacity: f64,
    #[serde(default)]
    pub subnet_ids: Vec<SubnetId>,
}

impl Display for NodeInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "node {} ({}:{})", self.id, self.ip, self.port)
    }
}

/// A payment that the local node must route to a destination.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub source: NodeId,
    pub destination: NodeId,
    pub volume: f64,
}

impl Display for Transaction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "payment of {} from {} -> {}",
            self.volume, self.source, self.destination
        )
    }
}

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("Topology Error: {0}")]
    TopologyError(String),
    #[error("Validation Error: {0}")]
    ValidationError(String),
    #[error("Dispatch Error: {0}")]
    DispatchError(#[from] DispatchError),
    #[error("Connection Error: {0}")]
    ConnectionError(String),
    #[error("Mpsc Channel Error: {0}")]
    MpscChannelError(String),
    #[error("Reply Timeout: no reply received within {0:?}")]
    ReplyTimeout(Duration),
    #[error("Shutdown: {0}")]
    Shutdown(String),
    #[error("Simulated Network Error: {0}")]
    SimulatedNetworkError(String),
    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("CSV Error: {0:?}")]
    CsvError(#[from] csv::Error),
}

/// Configuration for writing per-transaction results to CSV.
#[derive(Clone, Debug)]
pub struct WriteResults {
    /// Directory where result files are written.
    pub results_dir: PathBuf,
    /// The number of transaction results to batch before flushing to disk.
    pub batch_size: u32,
}

/// Runtime options for processing a node's transaction list.
#[derive(Clone, Debug)]
pub struct SimulationCfg {
    /// The routing strategy that every transaction is processed with.
    pub algorithm: Algorithm,
    /// How long to wait for the reply to a protocol message. `None` waits until shutdown.
    pub reply_timeout: Option<Duration>,
    /// Seed for strategies that make random choices.
    pub seed: Option<u64>,
    /// Per-transaction results are not written if this is `None`.
    pub write_results: Option<WriteResults>,
}

impl SimulationCfg {
    pub fn new(algorithm: Algorithm) -> Self {
        SimulationCfg {
            algorithm,
            reply_timeout: None,
            seed: None,
            write_results: None,
        }
    }
}
