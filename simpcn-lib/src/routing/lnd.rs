use async_trait::async_trait;

use super::{Payment, RoutingContext, RoutingOutcome, RoutingStrategy, LND_ATTEMPT_CNT};
use crate::pathfinding::shortest_path;
use crate::topology::{CapacityGraph, EdgeCapacity};
use crate::{SimulationError, Transaction};

/// Routes the full volume over the shortest path with usable edges, retrying on a new path after each failure.
pub struct Lnd {}

#[async_trait]
impl RoutingStrategy for Lnd {
    fn name(&self) -> &'static str {
        "LND"
    }

    async fn route(
        &mut self,
        tx: &Transaction,
        ctx: RoutingContext<'_>,
    ) -> Result<RoutingOutcome, SimulationError> {
        let RoutingContext {
            topology,
            mut payment,
            ..
        } = ctx;

        let success =
            route_with_retries(topology.global_mut(), tx, &mut payment, LND_ATTEMPT_CNT).await?;

        Ok(RoutingOutcome::new(success))
    }
}

/// Makes up to `attempts` single path payments, each over the shortest path currently usable in `graph`. When a
/// commit fails the payment is reversed and the channel that refused it is marked as exhausted in `graph`, so that
/// the next search avoids it.
pub(crate) async fn route_with_retries(
    graph: &mut CapacityGraph,
    tx: &Transaction,
    payment: &mut Payment<'_>,
    attempts: usize,
) -> Result<bool, SimulationError> {
    for attempt in 1..=attempts {
        let Some(path) = shortest_path(graph, tx.source, tx.destination) else {
            log::debug!("No path left for {tx} after {} attempt(s).", attempt - 1);
            return Ok(false);
        };

        let reply = payment.commit(&path, tx.volume).await?;
        if reply.commit_success {
            payment.confirm(&reply).await?;
            return Ok(true);
        }

        payment.reverse(&reply).await?;

        match reply.first_failed_hop() {
            Some(hop) if hop + 1 < path.len() => {
                log::debug!(
                    "Attempt {attempt} for {tx} failed at {} -> {}.",
                    path[hop],
                    path[hop + 1]
                );
                graph.set(path[hop], path[hop + 1], EdgeCapacity::Known(0.0));
            },
            _ => log::warn!("Attempt {attempt} for {tx} failed without reporting a hop."),
        }
    }

    Ok(false)
}
