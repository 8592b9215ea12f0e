use anyhow::Result;
use rand::thread_rng;
use rand_distr::{Distribution, Exp};
use std::time::Duration;

use crate::config::ArrivalDistribution;

/// Paces dispatch for a rate-limited load phase.
pub struct RequestDistribution {
    dist_type: DistributionType,
}

enum DistributionType {
    Uniform { interval: Duration },
    Exponential { exp_dist: Exp<f64> },
}

impl RequestDistribution {
    /// Create a pacing source for `qps` dispatches per second.
    ///
    /// # Arguments
    /// * `arrival_dist` - Type of distribution (uniform or poisson)
    /// * `qps` - Target dispatches per second, must be positive
    pub fn new(arrival_dist: &ArrivalDistribution, qps: f64) -> Result<Self> {
        if !(qps.is_finite() && qps > 0.0) {
            anyhow::bail!("qps must be a positive number, got {}", qps);
        }

        let dist_type = match arrival_dist {
            ArrivalDistribution::Uniform => DistributionType::Uniform {
                interval: Duration::from_nanos((1e9 / qps) as u64),
            },
            ArrivalDistribution::Poisson => {
                // Poisson arrivals have exponentially distributed gaps with rate = qps
                let exp_dist = Exp::new(qps)
                    .map_err(|e| anyhow::anyhow!("invalid poisson rate {}: {}", qps, e))?;
                DistributionType::Exponential { exp_dist }
            }
        };

        Ok(Self { dist_type })
    }

    /// Delay to wait before the next dispatch.
    pub fn next_delay(&self) -> Duration {
        match &self.dist_type {
            DistributionType::Uniform { interval } => *interval,
            DistributionType::Exponential { exp_dist } => {
                let mut rng = thread_rng();
                // Sample is in seconds
                Duration::from_secs_f64(exp_dist.sample(&mut rng))
            }
        }
    }

    pub fn distribution_name(&self) -> &str {
        match &self.dist_type {
            DistributionType::Uniform { .. } => "Uniform",
            DistributionType::Exponential { .. } => "Poisson",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_distribution() {
        let dist = RequestDistribution::new(&ArrivalDistribution::Uniform, 10.0).unwrap();

        // For 10 QPS, expect 100ms intervals
        let delay = dist.next_delay();
        assert_eq!(delay, Duration::from_millis(100));
        assert_eq!(dist.next_delay(), delay);

        let dist = RequestDistribution::new(&ArrivalDistribution::Uniform, 3.0).unwrap();
        assert_eq!(dist.next_delay(), Duration::from_nanos(333_333_333));
    }

    #[test]
    fn test_poisson_distribution_variability() {
        let dist = RequestDistribution::new(&ArrivalDistribution::Poisson, 10.0).unwrap();

        let delays: Vec<Duration> = (0..200).map(|_| dist.next_delay()).collect();

        let all_same = delays.iter().all(|d| *d == delays[0]);
        assert!(!all_same, "Poisson distribution should produce variable delays");

        // Mean gap should be roughly 1/rate = 0.1s
        let avg_secs: f64 =
            delays.iter().map(|d| d.as_secs_f64()).sum::<f64>() / delays.len() as f64;
        assert!(
            (avg_secs - 0.1).abs() < 0.05,
            "Average delay should be close to 0.1s, got {}",
            avg_secs
        );
    }

    #[test]
    fn test_rejects_non_positive_rate() {
        assert!(RequestDistribution::new(&ArrivalDistribution::Uniform, 0.0).is_err());
        assert!(RequestDistribution::new(&ArrivalDistribution::Poisson, -1.0).is_err());
        assert!(RequestDistribution::new(&ArrivalDistribution::Poisson, f64::NAN).is_err());
    }

    #[test]
    fn test_distribution_name() {
        let uniform = RequestDistribution::new(&ArrivalDistribution::Uniform, 10.0).unwrap();
        assert_eq!(uniform.distribution_name(), "Uniform");

        let poisson = RequestDistribution::new(&ArrivalDistribution::Poisson, 10.0).unwrap();
        assert_eq!(poisson.distribution_name(), "Poisson");
    }
}
