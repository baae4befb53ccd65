use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::{
    Payment, PotentialPath, RoutingContext, RoutingOutcome, RoutingStrategy, FLASH_PROBE_CNT,
    FS_THRESH,
};
use crate::pathfinding::{path_bottleneck, push_flow, shortest_path};
use crate::topology::{CapacityGraph, EdgeCapacity, RoutingTable};
use crate::{Path, SimulationError, Transaction, FLOW_TOLERANCE};

/// Treats large payments (elephants) and small payments (mice) differently: elephants are split across paths
/// discovered by probing, mice are sent over a random precomputed path.
pub struct Flash {
    rng: ChaCha8Rng,
}

impl Flash {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };

        Flash { rng }
    }

    /// Probes up to [`FLASH_PROBE_CNT`] shortest paths, learning capacities into the live graph and reserving each
    /// path's available capacity in it, then commits greedily in probe order once enough has been found.
    async fn route_elephant(
        &mut self,
        tx: &Transaction,
        graph: &mut CapacityGraph,
        payment: &mut Payment<'_>,
    ) -> Result<bool, SimulationError> {
        let mut probed = Vec::new();
        let mut found = 0.0;

        for _ in 0..FLASH_PROBE_CNT {
            let Some(path) = shortest_path(graph, tx.source, tx.destination) else {
                break;
            };

            let reply = payment.probe(&path).await?;
            for (hop, capacity) in path.windows(2).zip(reply.hop_capacities()) {
                if graph.get(hop[0], hop[1]) == Some(EdgeCapacity::Unprobed) {
                    graph.set(hop[0], hop[1], EdgeCapacity::Known(capacity));
                }
            }

            let Some(available) = path_bottleneck(graph, &path) else {
                log::warn!("Probe of {path:?} for {tx} did not report every hop.");
                // Keep the search from finding the same path again.
                graph.set(path[0], path[1], EdgeCapacity::Known(0.0));
                continue;
            };

            push_flow(graph, &path, available);
            if available > 0.0 {
                found += available;
                probed.push(PotentialPath::new(path, available));
            }
        }

        if found < tx.volume {
            log::debug!("Probing found {found} of {} for {tx}.", tx.volume);
            return Ok(false);
        }

        let mut remaining = tx.volume;
        let mut committed = Vec::new();
        let mut locked = true;

        for path in probed {
            if remaining <= FLOW_TOLERANCE {
                break;
            }

            let amount = remaining.min(path.capacity);
            let reply = payment.commit(&path.path, amount).await?;
            locked = reply.commit_success;
            committed.push(reply);

            if !locked {
                break;
            }
            remaining -= amount;
        }

        let success = locked && remaining <= FLOW_TOLERANCE;
        payment.settle(&committed, success).await?;
        Ok(success)
    }

    /// Sends as much as possible over randomly chosen routing table paths, visiting each path at most once. When a
    /// path cannot take everything that is left it is probed, and whatever it can carry is committed.
    async fn route_mouse(
        &mut self,
        tx: &Transaction,
        routing_table: &RoutingTable,
        payment: &mut Payment<'_>,
    ) -> Result<bool, SimulationError> {
        let paths = routing_table.paths_to(tx.destination);
        let mut visited = vec![false; paths.len()];
        let mut remaining = tx.volume;
        let mut committed = Vec::new();

        let success = loop {
            if remaining <= FLOW_TOLERANCE {
                break true;
            }

            let Some(path) = self.pick_unvisited(paths, &mut visited) else {
                log::debug!("Exhausted routing table for {tx} with {remaining} left.");
                break false;
            };

            let reply = payment.commit(path, remaining).await?;
            if reply.commit_success {
                remaining = 0.0;
                committed.push(reply);
                continue;
            }
            payment.reverse(&reply).await?;

            // Fall back to sending whatever the path can currently carry.
            loop {
                let probe = payment.probe(path).await?;
                let amount = remaining.min(probe.path_capacity());
                if amount <= 0.0 {
                    break;
                }

                let reply = payment.commit(path, amount).await?;
                if reply.commit_success {
                    remaining -= amount;
                    committed.push(reply);
                    break;
                }
                payment.reverse(&reply).await?;
            }
        };

        payment.settle(&committed, success).await?;
        Ok(success)
    }

    fn pick_unvisited<'p>(&mut self, paths: &'p [Path], visited: &mut [bool]) -> Option<&'p Path> {
        if visited.iter().all(|v| *v) {
            return None;
        }

        let mut index = self.rng.gen_range(0..paths.len());
        while visited[index] {
            index = (index + 1) % paths.len();
        }

        visited[index] = true;
        paths.get(index)
    }
}

#[async_trait]
impl RoutingStrategy for Flash {
    fn name(&self) -> &'static str {
        "Flash"
    }

    async fn route(
        &mut self,
        tx: &Transaction,
        ctx: RoutingContext<'_>,
    ) -> Result<RoutingOutcome, SimulationError> {
        let RoutingContext {
            topology,
            routing_table,
            mut payment,
        } = ctx;

        let success = if tx.volume < FS_THRESH {
            self.route_mouse(tx, routing_table, &mut payment).await?
        } else {
            self.route_elephant(tx, topology.global_mut(), &mut payment)
                .await?
        };

        Ok(RoutingOutcome::new(success))
    }
}
