use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::Serialize;
use sia_core::config::StatsConfig;

/// Advisory statistics attached to a comparison matrix. Logged and reported,
/// never decision-affecting.
#[derive(Debug, Clone, Serialize)]
pub struct RobustnessStats {
    /// Bootstrap 95% CI on the mean in-sample window score.
    pub mean_ci_95: (f64, f64),
    /// Sign-flip permutation p-value for mean score > 0.
    pub p_value: f64,
}

/// Bootstrap/permutation estimator over per-window scores.
///
/// Both estimates are fully deterministic for a given seed: each iteration
/// derives an independent RNG from the base seed, so the parallel schedule
/// cannot change the result.
pub struct RobustnessEstimator {
    n_bootstrap: usize,
    n_permutations: usize,
    seed: u64,
}

impl RobustnessEstimator {
    pub fn new(cfg: &StatsConfig) -> Self {
        Self {
            n_bootstrap: cfg.n_bootstrap as usize,
            n_permutations: cfg.n_permutations as usize,
            seed: cfg.seed,
        }
    }

    /// Estimate over the valid in-sample window scores. Fewer than two
    /// scores yields the degenerate (0, 0) interval and p = 1.0.
    pub fn estimate(&self, scores: &[f64]) -> RobustnessStats {
        RobustnessStats {
            mean_ci_95: self.bootstrap_mean_ci(scores),
            p_value: self.permutation_test(scores),
        }
    }

    /// Bootstrap 95% CI on the mean score using Rayon parallelism.
    fn bootstrap_mean_ci(&self, scores: &[f64]) -> (f64, f64) {
        if scores.len() < 2 {
            return (0.0, 0.0);
        }

        let n = scores.len();
        let seed = self.seed;
        let n_bootstrap = self.n_bootstrap;

        let mut means: Vec<f64> = (0..n_bootstrap)
            .into_par_iter()
            .map(|i| {
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64));
                let sum: f64 = (0..n).map(|_| scores[rng.gen_range(0..n)]).sum();
                sum / n as f64
            })
            .collect();

        means.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap());

        let lower_idx = (n_bootstrap as f64 * 0.025) as usize;
        let upper_idx = (n_bootstrap as f64 * 0.975) as usize;

        (means[lower_idx], means[upper_idx.min(means.len() - 1)])
    }

    /// Monte Carlo permutation test: randomly flip score signs and count how
    /// often the permuted total reaches the observed total.
    fn permutation_test(&self, scores: &[f64]) -> f64 {
        if scores.len() < 2 {
            return 1.0;
        }

        let observed_total: f64 = scores.iter().sum();
        let seed = self.seed;
        let n_permutations = self.n_permutations;

        let count_gte: usize = (0..n_permutations)
            .into_par_iter()
            .filter(|&i| {
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(10000 + i as u64));
                let flipped_total: f64 = scores
                    .iter()
                    .map(|&s| if rng.gen_bool(0.5) { s } else { -s })
                    .sum();
                flipped_total >= observed_total
            })
            .count();

        count_gte as f64 / n_permutations as f64
    }
}
