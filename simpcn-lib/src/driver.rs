use serde::Serialize;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use triggered::Listener;

use crate::batched_writer::BatchedWriter;
use crate::clock::Clock;
use crate::routing::{
    validate_endpoints, Payment, PaymentNetwork, RoutingContext, RoutingOutcome, RoutingStrategy,
};
use crate::session::MessageCounts;
use crate::topology::{RoutingTable, Topology};
use crate::{NodeId, SimulationCfg, SimulationError, Transaction};

/// Totals for the transactions that a strategy classified as staying within the local node's subnets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubnetSummary {
    pub total: u64,
    pub succeeded: u64,
    pub total_volume: f64,
    pub succeeded_volume: f64,
    pub elapsed: Duration,
}

/// Tracks the outcome of every transaction that a node has routed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub total: u64,
    pub succeeded: u64,
    pub total_volume: f64,
    pub succeeded_volume: f64,
    /// Time spent routing, summed across transactions.
    pub elapsed: Duration,
    pub subnet: SubnetSummary,
}

impl RunSummary {
    fn record(&mut self, tx: &Transaction, outcome: &RoutingOutcome, elapsed: Duration) {
        self.total += 1;
        self.total_volume += tx.volume;
        self.elapsed += elapsed;
        if outcome.success {
            self.succeeded += 1;
            self.succeeded_volume += tx.volume;
        }

        if let Some(local) = outcome.subnet_local {
            self.subnet.total += 1;
            self.subnet.total_volume += tx.volume;
            self.subnet.elapsed += elapsed;
            if local && outcome.success {
                self.subnet.succeeded += 1;
                self.subnet.succeeded_volume += tx.volume;
            }
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }

        self.succeeded as f64 / self.total as f64
    }

    /// Renders the machine readable line that a node prints once its run is complete. Message counts are summed over
    /// the node's channels and passed in separately because they are only final once the network has settled.
    pub fn finished_line(&self, counts: &MessageCounts) -> String {
        format!(
            "finished {:.6} {} {} {:.6} {:.6} {} {:.6} {} {} {:.6} {:.6}",
            as_millis(self.elapsed),
            self.succeeded,
            self.total,
            self.succeeded_volume,
            self.total_volume,
            counts,
            as_millis(self.subnet.elapsed),
            self.subnet.succeeded,
            self.subnet.total,
            self.subnet.succeeded_volume,
            self.subnet.total_volume,
        )
    }
}

fn as_millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

impl Display for RunSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Routed {} transactions with {:.2}% success rate ({} of {} volume) in {:?}.",
            self.total,
            self.success_rate() * 100.0,
            self.succeeded_volume,
            self.total_volume,
            self.elapsed,
        )
    }
}

/// The result of a single transaction, as written to the results file.
#[derive(Debug, Serialize)]
struct TransactionRecord {
    index: usize,
    source: NodeId,
    destination: NodeId,
    volume: f64,
    success: bool,
    subnet_local: Option<bool>,
    latency_ms: f64,
}

/// Routes a node's transactions one after another with a single strategy, restoring the topology after each one.
pub struct TransactionDriver<N: PaymentNetwork> {
    local: NodeId,
    network: N,
    topology: Topology,
    routing_table: RoutingTable,
    strategy: Box<dyn RoutingStrategy>,
    clock: Arc<dyn Clock>,
    shutdown: Listener,
    writer: Option<BatchedWriter>,
    next_request_id: u64,
}

impl<N: PaymentNetwork> TransactionDriver<N> {
    /// Creates a driver for the local node. The routing table is truncated to the number of paths that the
    /// configured strategy considers.
    pub fn new(
        local: NodeId,
        cfg: &SimulationCfg,
        network: N,
        topology: Topology,
        mut routing_table: RoutingTable,
        clock: Arc<dyn Clock>,
        shutdown: Listener,
    ) -> Result<Self, SimulationError> {
        if let Some(limit) = cfg.algorithm.path_limit() {
            routing_table.truncate(limit);
        }

        let writer = match &cfg.write_results {
            Some(results) => {
                let writer = BatchedWriter::new(
                    &results.results_dir,
                    &format!("node_{local}_transactions.csv"),
                    results.batch_size,
                )?;
                log::info!("Writing transaction results to {}.", writer.path().display());
                Some(writer)
            },
            None => None,
        };

        Ok(TransactionDriver {
            local,
            network,
            topology,
            routing_table,
            strategy: cfg.algorithm.strategy(cfg.seed),
            clock,
            shutdown,
            writer,
            next_request_id: 0,
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    /// Routes every transaction in order. All transactions must originate at the local node. The run stops early,
    /// returning what has been routed so far, if shutdown is triggered between transactions.
    pub async fn run(&mut self, transactions: &[Transaction]) -> Result<RunSummary, SimulationError> {
        for tx in transactions {
            validate_endpoints(self.local, tx)?;
        }

        log::info!(
            "Node {} routing {} transaction(s) with {}.",
            self.local,
            transactions.len(),
            self.strategy.name()
        );

        let mut summary = RunSummary::default();
        for (index, tx) in transactions.iter().enumerate() {
            if self.shutdown.is_triggered() {
                log::info!(
                    "Shutdown requested, stopping after {index} of {} transaction(s).",
                    transactions.len()
                );
                break;
            }

            log::info!("[Trans {}/{}] Routing {tx}.", index + 1, transactions.len());

            let start = Instant::now();
            let routed = self.route(tx).await;
            self.topology.restore();

            let outcome = routed?;
            let elapsed = self.clock.elapsed_simulated(start.elapsed());
            summary.record(tx, &outcome, elapsed);

            log::info!(
                "[Trans {}/{}] {} in {elapsed:?}.",
                index + 1,
                transactions.len(),
                if outcome.success { "Succeeded" } else { "Failed" }
            );

            if let Some(writer) = self.writer.as_mut() {
                writer.queue(TransactionRecord {
                    index,
                    source: tx.source,
                    destination: tx.destination,
                    volume: tx.volume,
                    success: outcome.success,
                    subnet_local: outcome.subnet_local,
                    latency_ms: as_millis(elapsed),
                })?;
            }
        }

        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }

        log::info!("{summary}");
        Ok(summary)
    }

    async fn route(&mut self, tx: &Transaction) -> Result<RoutingOutcome, SimulationError> {
        if tx.source == tx.destination {
            log::warn!("Not routing {tx} to itself.");
            return Ok(RoutingOutcome::failed());
        }

        let ctx = RoutingContext {
            topology: &mut self.topology,
            routing_table: &self.routing_table,
            payment: Payment::new(&mut self.network, &mut self.next_request_id),
        };

        self.strategy.route(tx, ctx).await
    }
}
