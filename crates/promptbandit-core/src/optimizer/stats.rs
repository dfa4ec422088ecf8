//! Confidence intervals over a template's mean reward
//!
//! Thompson Sampling uses a Beta credible interval on the reward posterior
//! Beta(alpha_prior + Σreward, beta_prior + n - Σreward). UCB1 and
//! epsilon-greedy use a two-sided Hoeffding bound. Either way the interval
//! stays [0, 1] until the template has `min_uses` observations, and it is
//! widened if needed so that it always contains the empirical mean.

use statrs::distribution::{Beta, ContinuousCDF};

use super::types::{Algorithm, MabConfig, TemplateStats};

/// Interval model derived from the engine configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceModel {
    pub algorithm: Algorithm,
    pub confidence_level: f64,
    pub alpha_prior: f64,
    pub beta_prior: f64,
    pub min_uses: u64,
}

impl ConfidenceModel {
    /// Build the model from engine configuration
    pub fn from_config(config: &MabConfig) -> Self {
        Self {
            algorithm: config.algorithm,
            confidence_level: config.confidence_level,
            alpha_prior: config.alpha_prior,
            beta_prior: config.beta_prior,
            min_uses: config.min_uses_for_confidence,
        }
    }

    /// Confidence interval for the given statistics
    pub fn interval(&self, stats: &TemplateStats) -> (f64, f64) {
        if stats.total_uses < self.min_uses || stats.total_uses == 0 {
            return (0.0, 1.0);
        }

        let n = stats.total_uses as f64;
        let mean = stats.average_reward;

        let (lower, upper) = match self.algorithm {
            Algorithm::ThompsonSampling => {
                let alpha = self.alpha_prior + stats.total_reward;
                let beta = self.beta_prior + (n - stats.total_reward).max(0.0);
                credible_interval(alpha, beta, self.confidence_level)
            }
            Algorithm::Ucb1 | Algorithm::EpsilonGreedy => {
                hoeffding_interval(mean, stats.total_uses, self.confidence_level)
            }
        };

        (lower.min(mean).max(0.0), upper.max(mean).min(1.0))
    }
}

/// Equal-tailed credible interval of a Beta distribution
///
/// Returns (0, 1) for invalid parameters.
pub fn credible_interval(alpha: f64, beta: f64, level: f64) -> (f64, f64) {
    if alpha <= 0.0 || beta <= 0.0 || !alpha.is_finite() || !beta.is_finite() {
        return (0.0, 1.0);
    }

    // inverse_cdf loses precision for very concentrated posteriors
    if alpha > 1e6 || beta > 1e6 {
        let mean = alpha / (alpha + beta);
        let epsilon = 1e-6;
        return ((mean - epsilon).max(0.0), (mean + epsilon).min(1.0));
    }

    let tail = (1.0 - level) / 2.0;

    match Beta::new(alpha, beta) {
        Ok(dist) => {
            let low = dist.inverse_cdf(tail);
            let high = dist.inverse_cdf(1.0 - tail);

            let low = if low.is_finite() { low.clamp(0.0, 1.0) } else { 0.0 };
            let high = if high.is_finite() { high.clamp(0.0, 1.0) } else { 1.0 };

            (low, high)
        }
        Err(_) => (0.0, 1.0),
    }
}

/// Two-sided Hoeffding interval for a mean of n observations in [0, 1]
///
/// Half-width is sqrt(ln(2 / delta) / 2n) with delta = 1 - level.
pub fn hoeffding_interval(mean: f64, n: u64, level: f64) -> (f64, f64) {
    if n == 0 {
        return (0.0, 1.0);
    }
    let delta = (1.0 - level).clamp(f64::MIN_POSITIVE, 1.0);
    let half_width = ((2.0 / delta).ln() / (2.0 * n as f64)).sqrt();
    ((mean - half_width).max(0.0), (mean + half_width).min(1.0))
}

/// Whether two closed intervals share any point
pub fn intervals_overlap(a: (f64, f64), b: (f64, f64)) -> bool {
    a.0 <= b.1 && b.0 <= a.1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::types::StatsDelta;
    use proptest::prelude::*;

    fn model(algorithm: Algorithm, min_uses: u64) -> ConfidenceModel {
        ConfidenceModel {
            algorithm,
            confidence_level: 0.95,
            alpha_prior: 1.0,
            beta_prior: 1.0,
            min_uses,
        }
    }

    fn stats_with(rewards: &[f64], model: &ConfidenceModel) -> TemplateStats {
        let mut stats = TemplateStats::default();
        for &reward in rewards {
            stats.record(&StatsDelta::from_reward(reward, 0.8), model);
        }
        stats
    }

    #[test]
    fn test_uninformative_until_min_uses() {
        let model = model(Algorithm::ThompsonSampling, 5);
        let stats = stats_with(&[0.9, 0.9, 0.9, 0.9], &model);
        assert_eq!((stats.confidence_lower, stats.confidence_upper), (0.0, 1.0));

        let stats = stats_with(&[0.9; 5], &model);
        assert!(stats.confidence_lower > 0.0);
    }

    #[test]
    fn test_credible_interval_narrows_with_evidence() {
        let (low1, high1) = credible_interval(2.0, 2.0, 0.95);
        let (low2, high2) = credible_interval(20.0, 20.0, 0.95);
        assert!(high2 - low2 < high1 - low1);
    }

    #[test]
    fn test_credible_interval_invalid_params() {
        assert_eq!(credible_interval(0.0, 1.0, 0.95), (0.0, 1.0));
        assert_eq!(credible_interval(f64::NAN, 1.0, 0.95), (0.0, 1.0));
    }

    #[test]
    fn test_hoeffding_width() {
        let (low, high) = hoeffding_interval(0.5, 50, 0.95);
        let expected = ((2.0f64 / 0.05).ln() / 100.0).sqrt();
        assert!((high - 0.5 - expected).abs() < 1e-12);
        assert!((0.5 - low - expected).abs() < 1e-12);
        assert_eq!(hoeffding_interval(0.5, 0, 0.95), (0.0, 1.0));
    }

    #[test]
    fn test_separated_arms_do_not_overlap() {
        for algorithm in [Algorithm::ThompsonSampling, Algorithm::Ucb1] {
            let model = model(algorithm, 5);
            let a = stats_with(&[0.9; 50], &model);
            let b = stats_with(&[0.5; 50], &model);
            assert!(!intervals_overlap(
                (a.confidence_lower, a.confidence_upper),
                (b.confidence_lower, b.confidence_upper)
            ));
        }
    }

    #[test]
    fn test_interval_brackets_saturated_mean() {
        let model = model(Algorithm::ThompsonSampling, 1);
        let stats = stats_with(&[1.0; 200], &model);
        assert!(stats.confidence_upper >= stats.average_reward);
        assert_eq!(stats.average_reward, 1.0);
    }

    proptest! {
        #[test]
        fn prop_stats_invariants_hold(
            rewards in proptest::collection::vec(0.0f64..=1.0, 0..80),
            min_uses in 0u64..10,
            thompson in any::<bool>(),
        ) {
            let algorithm = if thompson { Algorithm::ThompsonSampling } else { Algorithm::EpsilonGreedy };
            let model = model(algorithm, min_uses);
            let stats = stats_with(&rewards, &model);

            prop_assert!(stats.success_count <= stats.total_uses);
            prop_assert!((0.0..=1.0).contains(&stats.average_reward));
            if stats.total_uses < min_uses.max(1) {
                prop_assert_eq!((stats.confidence_lower, stats.confidence_upper), (0.0, 1.0));
            } else {
                prop_assert!(stats.confidence_lower <= stats.average_reward);
                prop_assert!(stats.average_reward <= stats.confidence_upper);
            }
        }
    }
}
