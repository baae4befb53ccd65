use async_trait::async_trait;

use super::{RoutingContext, RoutingOutcome, RoutingStrategy, SPIDER_MAX_FAILURES, SPIDER_UNIT};
use crate::{SimulationError, Transaction};

/// Sends a payment in small units, cycling over the routing table's paths, and gives up once too many units in a
/// row could not be locked.
pub struct Spider {}

#[async_trait]
impl RoutingStrategy for Spider {
    fn name(&self) -> &'static str {
        "Spider"
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

        let paths = routing_table.paths_to(tx.destination);
        if paths.is_empty() {
            log::warn!("No routing table entries for {tx}.");
            return Ok(RoutingOutcome::failed());
        }

        let mut pre_commits = vec![0.0; paths.len()];
        let mut remaining = tx.volume;
        let mut failures = 0;
        let mut next = 0;

        let success = loop {
            if remaining <= 0.0 {
                break true;
            }

            let unit = remaining.min(SPIDER_UNIT);
            let reply = payment.commit(&paths[next], unit).await?;

            if reply.commit_success {
                pre_commits[next] += unit;
                remaining -= unit;
                failures = 0;
            } else {
                payment.reverse(&reply).await?;
                failures += 1;
                if failures >= SPIDER_MAX_FAILURES {
                    log::debug!("Giving up on {tx} after {failures} failed units in a row.");
                    break false;
                }
            }

            next = (next + 1) % paths.len();
        };

        // Each path's units are settled, or released, with a single message covering all of them.
        for (path, amount) in paths.iter().zip(pre_commits) {
            if amount <= 0.0 {
                continue;
            }

            if success {
                payment.confirm_amount(path, amount).await?;
            } else {
                payment.reverse_amount(path, amount).await?;
            }
        }

        Ok(RoutingOutcome::new(success))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use crate::test_utils::{tx, LocalNetwork, TestHarness};

    #[tokio::test]
    async fn test_units_are_spread_round_robin() {
        let network = LocalNetwork::new()
            .with_channel(1, 2, 10.0, 0.0)
            .with_channel(2, 9, 10.0, 0.0)
            .with_channel(1, 3, 10.0, 0.0)
            .with_channel(3, 9, 10.0, 0.0);
        let mut harness =
            TestHarness::new(network).with_paths(vec![vec![1, 2, 9], vec![1, 3, 9]]);

        let outcome = harness.route(&mut Spider {}, tx(1, 9, 3.5)).await;
        assert!(outcome.success);

        let commits = harness.network.sent_of(MessageType::Commit);
        let units: Vec<f64> = commits.iter().map(|m| m.commit).collect();
        assert_eq!(units, vec![1.0, 1.0, 1.0, 0.5]);

        let network = &harness.network;
        assert_eq!(network.capacity(2, 9), 8.0);
        assert_eq!(network.capacity(3, 9), 8.5);
        assert_eq!(network.capacity(9, 2), 2.0);
        assert_eq!(network.capacity(9, 3), 1.5);
        assert_eq!(network.sent_of(MessageType::Confirm).len(), 2);
    }

    /// The first path can carry three units and the second none. Successful units reset the failure count, so the
    /// payment is only abandoned after ten failures in a row.
    #[tokio::test]
    async fn test_consecutive_failures_abort_and_release() {
        let network = LocalNetwork::new()
            .with_channel(1, 2, 3.0, 0.0)
            .with_channel(2, 9, 100.0, 0.0)
            .with_channel(1, 3, 0.0, 0.0)
            .with_channel(3, 9, 100.0, 0.0);
        let mut harness =
            TestHarness::new(network).with_paths(vec![vec![1, 2, 9], vec![1, 3, 9]]);
        let balances = harness.network.balances();

        let outcome = harness.route(&mut Spider {}, tx(1, 9, 100.0)).await;
        assert!(!outcome.success);

        let commits = harness.network.sent_of(MessageType::Commit);
        assert_eq!(commits.len(), 15);

        // Every failed unit is reversed inline, and the three locked units are released with one message.
        let reverses = harness.network.sent_of(MessageType::Reverse);
        assert_eq!(reverses.len(), 12 + 1);
        let release = reverses.last().unwrap();
        assert_eq!(release.path, vec![1, 2, 9]);
        assert_eq!(release.p1c, vec![3.0, 3.0]);

        assert_eq!(harness.network.balances(), balances);
        assert!(harness.network.sent_of(MessageType::Confirm).is_empty());
    }

    #[tokio::test]
    async fn test_zero_volume() {
        let network = LocalNetwork::new().with_channel(1, 9, 1.0, 0.0);
        let mut harness = TestHarness::new(network).with_paths(vec![vec![1, 9]]);

        let outcome = harness.route(&mut Spider {}, tx(1, 9, 0.0)).await;
        assert!(outcome.success);
        assert!(harness.network.sent().is_empty());
    }
}
