use async_trait::async_trait;

use super::{RoutingContext, RoutingOutcome, RoutingStrategy};
use crate::pathfinding::shortest_path;
use crate::{SimulationError, Transaction};

/// Routes the full volume over a single shortest path, without retrying.
pub struct ShortestPath {}

#[async_trait]
impl RoutingStrategy for ShortestPath {
    fn name(&self) -> &'static str {
        "SP"
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

        let Some(path) = shortest_path(topology.global(), tx.source, tx.destination) else {
            log::warn!("No path found for {tx}.");
            return Ok(RoutingOutcome::failed());
        };

        let reply = payment.commit(&path, tx.volume).await?;
        if reply.commit_success {
            payment.confirm(&reply).await?;
        } else {
            payment.reverse(&reply).await?;
        }

        Ok(RoutingOutcome::new(reply.commit_success))
    }
}
