use async_trait::async_trait;

use super::{PotentialPath, RoutingContext, RoutingOutcome, RoutingStrategy};
use crate::{SimulationError, Transaction, FLOW_TOLERANCE};

/// Splits a payment across the routing table's paths so that the capacity left on each path is as even as possible.
pub struct Waterfilling {}

/// Allocates `demand` across the paths by repeatedly topping up the paths with the most spare capacity until they
/// reach the next highest, splitting evenly once the remainder no longer covers a whole gap. Each path's allocation
/// is recorded in `pre_commit` and deducted from its `capacity`; paths are left sorted by their original capacity.
///
/// Returns false without allocating anything if the paths cannot carry the demand between them.
pub fn waterfill(paths: &mut [PotentialPath], demand: f64) -> bool {
    let total: f64 = paths.iter().map(|p| p.capacity).sum();
    if total < demand {
        return false;
    }

    paths.sort_by(|a, b| b.capacity.total_cmp(&a.capacity));

    let mut remaining = demand;
    while remaining > FLOW_TOLERANCE {
        let Some(highest) = paths.first().map(|p| p.capacity) else {
            return false;
        };

        let tied = paths.iter().take_while(|p| p.capacity == highest).count();
        let next = paths.get(tied).map_or(0.0, |p| p.capacity);
        let gap = highest - next;
        if gap <= 0.0 {
            // Every path is drained, anything left over is rounding.
            break;
        }

        let covers_gap = tied as f64 * gap <= remaining;
        let fill = if covers_gap { gap } else { remaining / tied as f64 };

        for path in paths.iter_mut().take(tied) {
            path.pre_commit += fill;
            // Land exactly on the next level so that the paths tie on the next pass.
            path.capacity = if covers_gap { next } else { path.capacity - fill };
        }

        remaining = if covers_gap {
            remaining - gap * tied as f64
        } else {
            0.0
        };
    }

    true
}

#[async_trait]
impl RoutingStrategy for Waterfilling {
    fn name(&self) -> &'static str {
        "Waterfilling"
    }

    async fn route(
        &mut self,
        tx: &Transaction,
        ctx: RoutingContext<'_>,
    ) -> Result<RoutingOutcome, SimulationError> {
        let RoutingContext {
            routing_table,
            mut payment,
            ..
        } = ctx;

        let candidates = routing_table.paths_to(tx.destination);
        if candidates.is_empty() {
            log::warn!("No routing table entries for {tx}.");
            return Ok(RoutingOutcome::failed());
        }

        let mut paths = Vec::with_capacity(candidates.len());
        for path in candidates {
            let reply = payment.probe(path).await?;
            paths.push(PotentialPath::new(path.clone(), reply.path_capacity()));
        }

        if !waterfill(&mut paths, tx.volume) {
            log::debug!("Probed paths cannot carry {tx}.");
            return Ok(RoutingOutcome::failed());
        }

        let mut committed = Vec::new();
        let mut success = true;
        for path in paths.iter().filter(|p| p.pre_commit > 0.0) {
            let reply = payment.commit(&path.path, path.pre_commit).await?;
            let locked = reply.commit_success;
            committed.push(reply);

            if !locked {
                success = false;
                break;
            }
        }

        payment.settle(&committed, success).await?;
        Ok(RoutingOutcome::new(success))
    }
}
