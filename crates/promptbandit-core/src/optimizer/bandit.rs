//! Multi-armed bandit selection over prompt templates
//!
//! Each template is an arm. Three algorithms are supported:
//!
//! - **Thompson Sampling** (default): sample θ ~ Beta(α₀ + successes,
//!   β₀ + failures) for every candidate and take the largest sample.
//!   Uncertain arms produce high-variance samples and get explored
//!   naturally; proven arms win most draws.
//! - **UCB1**: mean + sqrt(2 ln N / n). Unused arms are visited first, in
//!   ascending id order.
//! - **Epsilon-Greedy**: a uniform random arm with probability ε, the best
//!   mean otherwise.
//!
//! Selection never mutates statistics. It works on a single snapshot of the
//! registry so a concurrent registration cannot be observed half-applied.

use std::sync::{Mutex, PoisonError};

use rand::prelude::*;
use rand_distr::{Beta, Distribution};
use tracing::debug;

use super::registry::TemplateRegistry;
use super::types::{
    ADAPTIVE_CATEGORY, Algorithm, CandidateSource, MabConfig, PromptTemplate, SelectionReason,
    SynthesisContext,
};
use crate::error::{Error, Result};

/// Posterior standard deviation above which a Thompson pick counts as exploration
const EXPLORATION_UNCERTAINTY: f64 = 0.15;

/// Outcome of a bandit selection
#[derive(Debug, Clone)]
pub struct BanditChoice {
    /// Snapshot of the chosen template at selection time
    pub template: PromptTemplate,
    /// Algorithm that made the choice
    pub algorithm: Algorithm,
    /// Why it was chosen
    pub reason: SelectionReason,
    /// Where the candidate set came from
    pub candidate_source: CandidateSource,
    /// Number of candidates that competed
    pub candidates_considered: usize,
    /// Whether this was an exploration (vs exploitation) choice
    pub is_exploration: bool,
}

/// Bandit selector for prompt templates
#[derive(Debug)]
pub struct BanditSelector {
    algorithm: Algorithm,
    exploration_rate: f64,
    alpha_prior: f64,
    beta_prior: f64,
    /// Uses below which a pick is treated as exploration
    min_samples_for_trust: u64,
    rng: Mutex<StdRng>,
}

impl BanditSelector {
    /// Create a selector from engine configuration
    pub fn new(config: &MabConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Create a selector with a fixed seed (for reproducibility in tests)
    pub fn with_seed(config: &MabConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &MabConfig, rng: StdRng) -> Self {
        Self {
            algorithm: config.algorithm,
            exploration_rate: config.exploration_rate,
            alpha_prior: config.alpha_prior,
            beta_prior: config.beta_prior,
            min_samples_for_trust: config.min_uses_for_confidence,
            rng: Mutex::new(rng),
        }
    }

    /// Configured algorithm
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Select a template for the given context
    pub fn select(
        &self,
        registry: &TemplateRegistry,
        context: &SynthesisContext,
    ) -> Result<BanditChoice> {
        let snapshot = registry.list_active(None);
        let requested = context.category();
        let (candidates, source) = candidate_set(&snapshot, requested).ok_or_else(|| {
            Error::NoActiveTemplates(requested.unwrap_or("any").to_string())
        })?;

        let total_pulls: u64 = snapshot.iter().map(|t| t.stats.total_uses).sum();
        let (index, reason, is_exploration) = self.choose(&candidates, total_pulls);
        let template = candidates[index].clone();

        debug!(
            template_id = %template.id,
            algorithm = %self.algorithm,
            candidates = candidates.len(),
            is_exploration = is_exploration,
            ?source,
            "Selected prompt template"
        );

        Ok(BanditChoice {
            template,
            algorithm: self.algorithm,
            reason,
            candidate_source: source,
            candidates_considered: candidates.len(),
            is_exploration,
        })
    }

    /// Pick an index into `candidates` (sorted by id, non-empty)
    pub fn choose(
        &self,
        candidates: &[&PromptTemplate],
        total_pulls: u64,
    ) -> (usize, SelectionReason, bool) {
        if candidates.len() == 1 {
            return (0, SelectionReason::SingleCandidate, false);
        }

        match self.algorithm {
            Algorithm::ThompsonSampling => self.thompson(candidates),
            Algorithm::Ucb1 => ucb1(candidates, total_pulls),
            Algorithm::EpsilonGreedy => self.epsilon_greedy(candidates),
        }
    }

    fn thompson(&self, candidates: &[&PromptTemplate]) -> (usize, SelectionReason, bool) {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);

        let mut best_index = 0;
        let mut best_sample = f64::NEG_INFINITY;
        let mut is_exploration = false;

        for (index, candidate) in candidates.iter().enumerate() {
            let stats = &candidate.stats;
            let (alpha, beta) = stats.posterior_params(self.alpha_prior, self.beta_prior);
            let sample = sample_beta(&mut rng, alpha, beta);

            // Strict comparison keeps the lowest id on ties
            if sample > best_sample {
                best_sample = sample;
                best_index = index;
                is_exploration = stats.uncertainty(self.alpha_prior, self.beta_prior)
                    > EXPLORATION_UNCERTAINTY
                    || stats.total_uses < self.min_samples_for_trust;
            }
        }

        (
            best_index,
            SelectionReason::Sampled {
                sample: best_sample,
            },
            is_exploration,
        )
    }

    fn epsilon_greedy(&self, candidates: &[&PromptTemplate]) -> (usize, SelectionReason, bool) {
        let explore = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            if rng.r#gen::<f64>() < self.exploration_rate {
                Some(rng.gen_range(0..candidates.len()))
            } else {
                None
            }
        };

        if let Some(index) = explore {
            return (
                index,
                SelectionReason::RandomExploration {
                    exploration_rate: self.exploration_rate,
                },
                true,
            );
        }

        let index = greedy_index(candidates);
        (
            index,
            SelectionReason::Greedy {
                average_reward: candidates[index].stats.average_reward,
            },
            false,
        )
    }
}

/// Filter the snapshot: requested category, then adaptive, then everything
fn candidate_set<'a>(
    snapshot: &'a [PromptTemplate],
    category: Option<&str>,
) -> Option<(Vec<&'a PromptTemplate>, CandidateSource)> {
    if let Some(category) = category {
        let matching: Vec<&PromptTemplate> =
            snapshot.iter().filter(|t| t.category == category).collect();
        if !matching.is_empty() {
            return Some((matching, CandidateSource::Category));
        }

        let adaptive: Vec<&PromptTemplate> = snapshot
            .iter()
            .filter(|t| t.category == ADAPTIVE_CATEGORY)
            .collect();
        if !adaptive.is_empty() {
            return Some((adaptive, CandidateSource::AdaptiveFallback));
        }
    }

    if snapshot.is_empty() {
        return None;
    }
    Some((snapshot.iter().collect(), CandidateSource::AllActive))
}

fn sample_beta(rng: &mut StdRng, alpha: f64, beta: f64) -> f64 {
    if alpha <= 0.0 || beta <= 0.0 {
        return 0.5;
    }
    match Beta::new(alpha, beta) {
        Ok(dist) => dist.sample(rng),
        Err(_) => 0.5,
    }
}

fn ucb1(candidates: &[&PromptTemplate], total_pulls: u64) -> (usize, SelectionReason, bool) {
    // Candidates are sorted by id, so the first unused one has the lowest id
    if let Some(index) = candidates.iter().position(|t| t.stats.total_uses == 0) {
        return (index, SelectionReason::Unexplored, true);
    }

    let ln_total = (total_pulls.max(1) as f64).ln();
    let mut best_index = 0;
    let mut best_score = f64::NEG_INFINITY;
    let mut best_bonus = 0.0;

    for (index, candidate) in candidates.iter().enumerate() {
        let stats = &candidate.stats;
        let bonus = (2.0 * ln_total / stats.total_uses as f64).sqrt();
        let score = stats.average_reward + bonus;
        if score > best_score {
            best_score = score;
            best_index = index;
            best_bonus = bonus;
        }
    }

    // Exploration when the bonus, not the mean, carried the pick
    let is_exploration = best_index != greedy_index(candidates) && best_bonus > 0.0;
    (
        best_index,
        SelectionReason::UpperConfidence { ucb: best_score },
        is_exploration,
    )
}

/// Best mean; ties go to fewer uses, then the lower id
fn greedy_index(candidates: &[&PromptTemplate]) -> usize {
    let mut best = 0;
    for (index, candidate) in candidates.iter().enumerate().skip(1) {
        let current = &candidates[best].stats;
        let stats = &candidate.stats;
        if stats.average_reward > current.average_reward
            || (stats.average_reward == current.average_reward
                && stats.total_uses < current.total_uses)
        {
            best = index;
        }
    }
    best
}
