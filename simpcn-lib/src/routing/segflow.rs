use async_trait::async_trait;

use super::lnd::route_with_retries;
use super::{Payment, RoutingContext, RoutingOutcome, RoutingStrategy, LND_ATTEMPT_CNT};
use crate::pathfinding::max_flow;
use crate::topology::{CapacityGraph, EdgeCapacity, RoutingTable, Topology};
use crate::{SimulationError, Transaction, FLOW_TOLERANCE};

/// Routes payments whose destination shares a subnet with the local node within that subnet, and all other payments
/// along the max flow found over the probed routing table paths.
pub struct SegFlow {}

impl SegFlow {
    /// Tries the subnet graphs that contain the destination, merging them when there is more than one. Returns
    /// `None` if the destination is in none of the local node's subnets.
    async fn route_local(
        &mut self,
        tx: &Transaction,
        topology: &mut Topology,
        payment: &mut Payment<'_>,
    ) -> Result<Option<bool>, SimulationError> {
        let subnet_ids = topology.subnets_containing(tx.destination);
        let mut merged;
        let graph: &mut CapacityGraph = match subnet_ids.as_slice() {
            [] => return Ok(None),
            [id] => topology.subnet_mut(*id)?,
            ids => {
                merged = topology.merged_subnets(ids)?;
                &mut merged
            },
        };

        log::debug!("Routing {tx} within subnet(s) {subnet_ids:?}.");
        route_with_retries(graph, tx, payment, LND_ATTEMPT_CNT)
            .await
            .map(Some)
    }

    /// Probes every routing table path to the destination, computes the max flow over what the probes reported and
    /// commits each augmenting path's share in discovery order.
    async fn route_inter_subnet(
        &mut self,
        tx: &Transaction,
        routing_table: &RoutingTable,
        payment: &mut Payment<'_>,
    ) -> Result<bool, SimulationError> {
        let mut scratch = CapacityGraph::new();
        for path in routing_table.paths_to(tx.destination) {
            let reply = payment.probe(path).await?;
            for (hop, capacity) in path.windows(2).zip(reply.hop_capacities()) {
                scratch.set(hop[0], hop[1], EdgeCapacity::Known(capacity));
                scratch.set_if_absent(hop[1], hop[0], EdgeCapacity::Known(0.0));
            }
        }

        let flow = max_flow(&mut scratch, tx.source, tx.destination);
        if flow.total < tx.volume || flow.paths.is_empty() {
            log::debug!("Max flow of {} cannot carry {tx}.", flow.total);
            return Ok(false);
        }

        let mut remaining = tx.volume;
        let mut committed = Vec::new();
        let mut success = false;

        for (path, carried) in flow.paths.iter().zip(flow.flows) {
            let amount = carried.min(remaining);
            let reply = payment.commit(path, amount).await?;
            let locked = reply.commit_success;
            committed.push(reply);

            if !locked {
                break;
            }

            remaining -= amount;
            if remaining <= FLOW_TOLERANCE {
                success = true;
                break;
            }
        }

        payment.settle(&committed, success).await?;
        Ok(success)
    }
}

#[async_trait]
impl RoutingStrategy for SegFlow {
    fn name(&self) -> &'static str {
        "SegFlow"
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

        let subnet_local = self.route_local(tx, topology, &mut payment).await?;
        if subnet_local == Some(true) {
            return Ok(RoutingOutcome {
                success: true,
                subnet_local,
            });
        }

        if subnet_local == Some(false) {
            log::debug!("Subnet routing failed for {tx}, falling back to inter-subnet routing.");
        }

        let success = self
            .route_inter_subnet(tx, routing_table, &mut payment)
            .await?;

        Ok(RoutingOutcome {
            success,
            subnet_local,
        })
    }
}
