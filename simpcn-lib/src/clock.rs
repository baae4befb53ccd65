use async_trait::async_trait;
use std::ops::{Div, Mul};
use std::time::Duration;
use tokio::time;

use crate::SimulationError;

/// The fastest that a simulation clock may run, bounded because hop latencies are expressed in milliseconds.
pub const MAX_SPEEDUP: u32 = 1000;

/// Provides the notion of time that the testbed runs on. Every wait in the testbed (forwarding latency, startup and
/// settle delays, dial retries) goes through the clock so that a run can be fast-forwarded.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Sleeps for the duration provided, expressed in simulated time.
    async fn sleep(&self, wait: Duration);

    /// Converts a duration measured on the wall clock into simulated time.
    fn elapsed_simulated(&self, wall_clock: Duration) -> Duration;
}

/// Provides a wall clock implementation of the Clock trait.
#[derive(Clone, Default)]
pub struct SystemClock {}

#[async_trait]
impl Clock for SystemClock {
    async fn sleep(&self, wait: Duration) {
        if !wait.is_zero() {
            time::sleep(wait).await;
        }
    }

    fn elapsed_simulated(&self, wall_clock: Duration) -> Duration {
        wall_clock
    }
}

/// Provides an implementation of the Clock trait that speeds up wall clock time by some factor.
#[derive(Clone, Debug)]
pub struct SimulationClock {
    speedup_multiplier: u32,
}

impl SimulationClock {
    /// Creates a clock that runs `speedup_multiplier` times faster than the wall clock. The multiplier must be in
    /// [1;1000].
    pub fn new(speedup_multiplier: u32) -> Result<Self, SimulationError> {
        if !(1..=MAX_SPEEDUP).contains(&speedup_multiplier) {
            return Err(SimulationError::ValidationError(format!(
                "clock speedup must be in [1;{MAX_SPEEDUP}], got {speedup_multiplier}"
            )));
        }

        Ok(SimulationClock { speedup_multiplier })
    }

    pub fn speedup(&self) -> u32 {
        self.speedup_multiplier
    }
}

#[async_trait]
impl Clock for SimulationClock {
    /// A simulated wait of `wait` only takes `wait / speedup` on the wall clock.
    async fn sleep(&self, wait: Duration) {
        let wall_clock = wait.div(self.speedup_multiplier);
        if !wall_clock.is_zero() {
            time::sleep(wall_clock).await;
        }
    }

    fn elapsed_simulated(&self, wall_clock: Duration) -> Duration {
        wall_clock.mul(self.speedup_multiplier)
    }
}
