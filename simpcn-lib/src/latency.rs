use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Poisson};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use crate::SimulationError;

/// The forwarding delay that every hop adds before it handles a message, unless configured otherwise.
pub const DEFAULT_HOP_LATENCY: Duration = Duration::from_millis(10);

/// Decides how long a node holds on to a message before applying it to a channel and passing it on.
pub trait LatencyModel: Send + Sync {
    fn hop_delay(&self) -> Duration;

    fn name(&self) -> String;
}

/// Delays every hop by the same amount.
#[derive(Clone, Debug)]
pub struct FixedLatency {
    delay: Duration,
}

impl FixedLatency {
    pub fn new(delay: Duration) -> Self {
        FixedLatency { delay }
    }

    /// A model without any forwarding delay, useful when the network itself is in-memory.
    pub fn none() -> Self {
        FixedLatency {
            delay: Duration::ZERO,
        }
    }
}

impl Default for FixedLatency {
    fn default() -> Self {
        FixedLatency::new(DEFAULT_HOP_LATENCY)
    }
}

impl LatencyModel for FixedLatency {
    fn hop_delay(&self) -> Duration {
        self.delay
    }

    fn name(&self) -> String {
        format!("Fixed Latency ({:?})", self.delay)
    }
}

/// Delays every hop by a value in milliseconds drawn from a distribution.
pub struct SampledLatency<D>
where
    D: Distribution<f32> + Send + Sync,
{
    latency_dist: D,
    rng: Arc<StdMutex<ChaCha8Rng>>,
}

impl SampledLatency<Poisson<f32>> {
    /// Samples hop latency from a poisson distribution with mean `lambda_ms`. When a seed is provided the sequence
    /// of delays is reproducible across runs.
    pub fn new_poisson(lambda_ms: f32, seed: Option<u64>) -> Result<Self, SimulationError> {
        let poisson_dist = Poisson::new(lambda_ms).map_err(|e| {
            SimulationError::ValidationError(format!("Could not create poisson latency: {e}"))
        })?;

        Ok(SampledLatency::new(poisson_dist, seed))
    }
}

impl<D> SampledLatency<D>
where
    D: Distribution<f32> + Send + Sync,
{
    pub fn new(latency_dist: D, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };

        SampledLatency {
            latency_dist,
            rng: Arc::new(StdMutex::new(rng)),
        }
    }
}

impl<D> LatencyModel for SampledLatency<D>
where
    D: Distribution<f32> + Send + Sync,
{
    fn hop_delay(&self) -> Duration {
        let sample = match self.rng.lock() {
            Ok(mut rng) => self.latency_dist.sample(&mut *rng),
            Err(e) => {
                log::error!("Latency rng poisoned, forwarding without delay: {e}");
                return Duration::ZERO;
            },
        };

        if sample.is_finite() && sample > 0.0 {
            Duration::from_millis(sample as u64)
        } else {
            Duration::ZERO
        }
    }

    fn name(&self) -> String {
        "Sampled Latency".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    /// Always returns the same value, useful for testing.
    struct ConstantDistribution {
        value: f32,
    }

    impl Distribution<f32> for ConstantDistribution {
        fn sample<R: Rng + ?Sized>(&self, _rng: &mut R) -> f32 {
            self.value
        }
    }

    #[test]
    fn test_fixed_latency() {
        assert_eq!(FixedLatency::default().hop_delay(), DEFAULT_HOP_LATENCY);
        assert_eq!(FixedLatency::none().hop_delay(), Duration::ZERO);
    }

    #[test]
    fn test_sampled_latency() {
        let latency = SampledLatency::new(ConstantDistribution { value: 25.0 }, None);
        assert_eq!(latency.hop_delay(), Duration::from_millis(25));

        // Nonsensical samples must never turn into a delay.
        let latency = SampledLatency::new(ConstantDistribution { value: -3.0 }, None);
        assert_eq!(latency.hop_delay(), Duration::ZERO);

        let latency = SampledLatency::new(ConstantDistribution { value: f32::NAN }, None);
        assert_eq!(latency.hop_delay(), Duration::ZERO);
    }

    #[test]
    fn test_seeded_poisson_is_reproducible() {
        let first = SampledLatency::new_poisson(10.0, Some(42)).unwrap();
        let second = SampledLatency::new_poisson(10.0, Some(42)).unwrap();

        let first_delays: Vec<Duration> = (0..20).map(|_| first.hop_delay()).collect();
        let second_delays: Vec<Duration> = (0..20).map(|_| second.hop_delay()).collect();
        assert_eq!(first_delays, second_delays);
    }

    #[test]
    fn test_invalid_poisson() {
        assert!(SampledLatency::new_poisson(-1.0, None).is_err());
    }
}
