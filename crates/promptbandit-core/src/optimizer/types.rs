//! Types for bandit-driven prompt template optimization
//!
//! This module defines the data model shared by the registry, the bandit
//! selector, the reward evaluator and the performance tracker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::stats::ConfidenceModel;
use crate::error::{Error, Result};

/// Category used as the second-tier fallback when a requested category has
/// no active templates.
pub const ADAPTIVE_CATEGORY: &str = "adaptive";

/// Tolerance used when comparing a composite score against the success
/// threshold, so that a weighted sum of equal signals still counts.
pub const REWARD_EPSILON: f64 = 1e-9;

/// Free-form synthesis context supplied by the upstream pipeline
///
/// Recognised keys:
/// - `category`: preferred template category
/// - `session_id`: optimization session to attribute the selection to
/// - `principles`: constitutional principles (strings or objects)
/// - `reference_policy` / `expected_output`: reference text for similarity
/// - `requirements`: free-text synthesis requirements
/// - `protected_attributes`: attributes that must be guarded in policies
/// - `observed_scores`: externally measured reward signals
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SynthesisContext(Map<String, Value>);

impl SynthesisContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build a context from a JSON value, which must be an object
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::new()),
            other => Err(Error::InvalidInput(format!(
                "synthesis context must be a JSON object, got {}",
                other
            ))),
        }
    }

    /// Set a key
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Set the preferred template category
    pub fn with_category(self, category: impl Into<String>) -> Self {
        self.with("category", category.into())
    }

    /// Attribute selections to a session
    pub fn with_session(self, session_id: impl Into<String>) -> Self {
        self.with("session_id", session_id.into())
    }

    /// Raw value for a key
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// String value for a key, if it is a string
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Preferred category, ignoring blank values
    pub fn category(&self) -> Option<&str> {
        self.get_str("category").map(str::trim).filter(|c| !c.is_empty())
    }

    /// Session the caller wants to attribute the selection to
    pub fn session_id(&self) -> Option<&str> {
        self.get_str("session_id").map(str::trim).filter(|s| !s.is_empty())
    }

    /// Text for a key: strings verbatim, arrays flattened line by line
    pub fn text(&self, key: &str) -> Option<String> {
        let value = self.0.get(key)?;
        let text = render_value(value);
        if text.trim().is_empty() { None } else { Some(text) }
    }

    /// List of strings for a key; a single string is treated as one entry
    pub fn string_list(&self, key: &str) -> Vec<String> {
        match self.0.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.trim().to_string()))
                .filter(|s| !s.is_empty())
                .collect(),
            Some(Value::String(s)) => s
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Underlying JSON object
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Context as a JSON value (used for history snapshots)
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

impl From<Map<String, Value>> for SynthesisContext {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => format!("- {}", s),
                other => format!("- {}", other),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Bandit algorithm used for template selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Sample each arm's Beta posterior and take the argmax
    #[default]
    ThompsonSampling,
    /// Upper confidence bound (UCB1)
    Ucb1,
    /// Random arm with probability epsilon, otherwise the best mean
    EpsilonGreedy,
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ThompsonSampling => write!(f, "thompson_sampling"),
            Self::Ucb1 => write!(f, "ucb1"),
            Self::EpsilonGreedy => write!(f, "epsilon_greedy"),
        }
    }
}

impl std::str::FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "thompson_sampling" | "thompson" => Ok(Self::ThompsonSampling),
            "ucb1" | "ucb" => Ok(Self::Ucb1),
            "epsilon_greedy" | "epsilon" => Ok(Self::EpsilonGreedy),
            _ => Err(Error::ConfigurationError(format!(
                "Unknown algorithm: {}. Valid options: thompson_sampling, ucb1, epsilon_greedy",
                s
            ))),
        }
    }
}

/// Weights of the four reward signals in the composite score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RewardWeights {
    pub semantic_similarity: f64,
    pub policy_quality: f64,
    pub constitutional_compliance: f64,
    pub bias_mitigation: f64,
}

impl Default for RewardWeights {
    fn default() -> Self {
        Self {
            semantic_similarity: 0.25,
            policy_quality: 0.30,
            constitutional_compliance: 0.30,
            bias_mitigation: 0.15,
        }
    }
}

impl RewardWeights {
    /// Create weights in signal order: similarity, quality, compliance, bias
    pub fn new(similarity: f64, quality: f64, compliance: f64, bias: f64) -> Self {
        Self {
            semantic_similarity: similarity,
            policy_quality: quality,
            constitutional_compliance: compliance,
            bias_mitigation: bias,
        }
    }

    fn as_array(&self) -> [f64; 4] {
        [
            self.semantic_similarity,
            self.policy_quality,
            self.constitutional_compliance,
            self.bias_mitigation,
        ]
    }

    /// Sum of the raw weights
    pub fn sum(&self) -> f64 {
        self.as_array().iter().sum()
    }

    /// Weights rescaled to sum to 1
    ///
    /// Fails when any weight is negative or non-finite, or when all are zero.
    pub fn normalized(&self) -> Result<Self> {
        let weights = self.as_array();
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(Error::ConfigurationError(format!(
                "Reward weights must be finite and non-negative: {:?}",
                weights
            )));
        }
        let sum = self.sum();
        if sum <= 0.0 {
            return Err(Error::ConfigurationError(
                "Reward weights must not all be zero".to_string(),
            ));
        }
        Ok(Self::new(
            weights[0] / sum,
            weights[1] / sum,
            weights[2] / sum,
            weights[3] / sum,
        ))
    }
}

/// Configuration of the bandit engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MabConfig {
    /// Selection algorithm
    pub algorithm: Algorithm,
    /// Probability of a random pick under epsilon-greedy
    pub exploration_rate: f64,
    /// Coverage of the confidence interval (e.g. 0.95)
    pub confidence_level: f64,
    /// Beta prior pseudo-successes
    pub alpha_prior: f64,
    /// Beta prior pseudo-failures
    pub beta_prior: f64,
    /// Weights of the four reward signals
    pub reward_weights: RewardWeights,
    /// Uses required before confidence bounds leave [0, 1]
    pub min_uses_for_confidence: u64,
    /// Composite score at or above which an observation is a success
    pub reward_threshold: f64,
    /// Persist a template's stats every N of its uses
    pub update_frequency: u64,
    /// Consecutive stable observations required for convergence
    pub convergence_window: usize,
    /// Lifetime of an unreported selection token
    pub token_ttl_secs: u64,
}

impl Default for MabConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::ThompsonSampling,
            exploration_rate: 0.1,
            confidence_level: 0.95,
            alpha_prior: 1.0,
            beta_prior: 1.0,
            reward_weights: RewardWeights::default(),
            min_uses_for_confidence: 5,
            reward_threshold: 0.8,
            update_frequency: 10,
            convergence_window: 10,
            token_ttl_secs: 3600,
        }
    }
}

impl MabConfig {
    /// Config for a given algorithm, other fields default
    pub fn with_algorithm(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            ..Default::default()
        }
    }

    /// Validate ranges; any failure is a configuration error
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.exploration_rate) {
            return Err(Error::ConfigurationError(format!(
                "exploration_rate must be between 0.0 and 1.0, got {}",
                self.exploration_rate
            )));
        }
        if !(self.confidence_level > 0.0 && self.confidence_level < 1.0) {
            return Err(Error::ConfigurationError(format!(
                "confidence_level must be in (0.0, 1.0), got {}",
                self.confidence_level
            )));
        }
        if !(self.alpha_prior > 0.0 && self.alpha_prior.is_finite())
            || !(self.beta_prior > 0.0 && self.beta_prior.is_finite())
        {
            return Err(Error::ConfigurationError(format!(
                "alpha_prior and beta_prior must be positive, got {} and {}",
                self.alpha_prior, self.beta_prior
            )));
        }
        if !(0.0..=1.0).contains(&self.reward_threshold) {
            return Err(Error::ConfigurationError(format!(
                "reward_threshold must be between 0.0 and 1.0, got {}",
                self.reward_threshold
            )));
        }
        if self.update_frequency == 0 {
            return Err(Error::ConfigurationError(
                "update_frequency must be at least 1".to_string(),
            ));
        }
        if self.convergence_window == 0 {
            return Err(Error::ConfigurationError(
                "convergence_window must be at least 1".to_string(),
            ));
        }
        self.reward_weights.normalized()?;
        Ok(())
    }
}

/// Running statistics for one template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateStats {
    /// Number of reported observations
    pub total_uses: u64,
    /// Sum of composite rewards
    pub total_reward: f64,
    /// Observations at or above the reward threshold
    pub success_count: u64,
    /// total_reward / total_uses (0 when unused)
    pub average_reward: f64,
    /// Lower confidence bound on the mean reward
    pub confidence_lower: f64,
    /// Upper confidence bound on the mean reward
    pub confidence_upper: f64,
    /// Time of the last observation
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Default for TemplateStats {
    fn default() -> Self {
        Self {
            total_uses: 0,
            total_reward: 0.0,
            success_count: 0,
            average_reward: 0.0,
            confidence_lower: 0.0,
            confidence_upper: 1.0,
            last_used_at: None,
        }
    }
}

impl TemplateStats {
    /// Observations below the reward threshold
    pub fn failures(&self) -> u64 {
        self.total_uses.saturating_sub(self.success_count)
    }

    /// Fraction of successful observations
    pub fn success_rate(&self) -> f64 {
        if self.total_uses == 0 {
            return 0.0;
        }
        self.success_count as f64 / self.total_uses as f64
    }

    /// Beta posterior parameters over the success rate
    pub fn posterior_params(&self, alpha_prior: f64, beta_prior: f64) -> (f64, f64) {
        (
            alpha_prior + self.success_count as f64,
            beta_prior + self.failures() as f64,
        )
    }

    /// Standard deviation of the success-rate posterior
    pub fn uncertainty(&self, alpha_prior: f64, beta_prior: f64) -> f64 {
        let (alpha, beta) = self.posterior_params(alpha_prior, beta_prior);
        let ab = alpha + beta;
        ((alpha * beta) / (ab * ab * (ab + 1.0))).sqrt()
    }

    /// Fold one observation into the statistics
    pub fn record(&mut self, delta: &StatsDelta, model: &ConfidenceModel) {
        let reward = delta.reward.clamp(0.0, 1.0);
        self.total_uses += 1;
        self.total_reward += reward;
        if delta.success {
            self.success_count += 1;
        }
        self.average_reward = (self.total_reward / self.total_uses as f64).clamp(0.0, 1.0);
        let (lower, upper) = model.interval(self);
        self.confidence_lower = lower;
        self.confidence_upper = upper;
        self.last_used_at = Some(delta.observed_at);
    }

    /// Rebuild statistics by folding persisted outcomes in sequence order
    pub fn replay(records: &[PerformanceRecord], threshold: f64, model: &ConfidenceModel) -> Self {
        let mut stats = Self::default();
        for record in records {
            let mut delta = StatsDelta::from_reward(record.reward.composite_score, threshold);
            delta.observed_at = record.recorded_at;
            stats.record(&delta, model);
        }
        stats
    }
}

/// The effect of a single observation on a template's statistics
#[derive(Debug, Clone, PartialEq)]
pub struct StatsDelta {
    /// Composite reward in [0, 1]
    pub reward: f64,
    /// Whether the reward met the success threshold
    pub success: bool,
    /// When the observation was made
    pub observed_at: DateTime<Utc>,
}

impl StatsDelta {
    /// Build a delta from a composite score and the success threshold
    pub fn from_reward(reward: f64, threshold: f64) -> Self {
        let reward = reward.clamp(0.0, 1.0);
        Self {
            reward,
            success: reward + REWARD_EPSILON >= threshold,
            observed_at: Utc::now(),
        }
    }
}

/// A candidate prompt template (an arm of the bandit)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    /// Unique, immutable identifier (e.g. "constitutional_v1_0")
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Template text with `{placeholder}` slots
    pub content: String,
    /// Category (constitutional, safety_critical, fairness_aware, adaptive, ...)
    pub category: String,
    /// Template version
    pub version: String,
    /// Inactive templates are never selected but keep their history
    pub is_active: bool,
    /// Optional description
    pub description: Option<String>,
    /// Expected performance from seed metadata (0.0 to 1.0)
    pub expected_performance: f64,
    /// When the template was created
    pub created_at: DateTime<Utc>,
    /// Running statistics
    pub stats: TemplateStats,
}

impl PromptTemplate {
    /// Create a new active template with empty statistics
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            content: content.into(),
            category: category.into(),
            version: "1.0".to_string(),
            is_active: true,
            description: None,
            expected_performance: 0.5,
            created_at: Utc::now(),
            stats: TemplateStats::default(),
        }
    }

    /// Set version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Set description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set expected performance metadata
    pub fn with_expected_performance(mut self, expected: f64) -> Self {
        self.expected_performance = expected.clamp(0.0, 1.0);
        self
    }

    /// Mark inactive
    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// Placeholder names in order of first appearance
    pub fn placeholders(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for (_, _, name) in scan_placeholders(&self.content) {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
        names
    }

    /// Fill placeholders from the context; unknown placeholders are kept
    pub fn fill(&self, context: &SynthesisContext) -> String {
        fill_placeholders(&self.content, context)
    }

    /// Hex SHA-256 of the template content
    pub fn content_hash(&self) -> String {
        hex::encode(Sha256::digest(self.content.as_bytes()))
    }
}

/// Locate `{identifier}` slots as (start, end, name) byte ranges
fn scan_placeholders(content: &str) -> Vec<(usize, usize, &str)> {
    let bytes = content.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'{' {
            let mut j = i + 1;
            while j < bytes.len() && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_') {
                j += 1;
            }
            if j < bytes.len() && j > i + 1 && bytes[j] == b'}' {
                found.push((i, j + 1, &content[i + 1..j]));
                i = j + 1;
                continue;
            }
        }
        i += 1;
    }

    found
}

fn fill_placeholders(content: &str, context: &SynthesisContext) -> String {
    let mut filled = String::with_capacity(content.len());
    let mut cursor = 0;

    for (start, end, name) in scan_placeholders(content) {
        filled.push_str(&content[cursor..start]);
        match context.get(name) {
            Some(value) => filled.push_str(&render_value(value)),
            None => filled.push_str(&content[start..end]),
        }
        cursor = end;
    }
    filled.push_str(&content[cursor..]);

    filled
}

/// Caller-facing view of a selected template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateHandle {
    pub id: String,
    pub name: String,
    pub category: String,
    pub version: String,
    pub content: String,
    pub content_hash: String,
}

impl TemplateHandle {
    /// Fill the template's placeholders from the context
    pub fn fill(&self, context: &SynthesisContext) -> String {
        fill_placeholders(&self.content, context)
    }
}

impl From<&PromptTemplate> for TemplateHandle {
    fn from(template: &PromptTemplate) -> Self {
        Self {
            id: template.id.clone(),
            name: template.name.clone(),
            category: template.category.clone(),
            version: template.version.clone(),
            content: template.content.clone(),
            content_hash: template.content_hash(),
        }
    }
}

/// Multi-signal reward for one observation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RewardComponents {
    pub semantic_similarity: f64,
    pub policy_quality: f64,
    pub constitutional_compliance: f64,
    pub bias_mitigation: f64,
    /// Weighted sum of the four signals
    pub composite_score: f64,
    /// Confidence in the measurement itself
    pub confidence: f64,
}

impl RewardComponents {
    /// Combine four signals with (normalized) weights
    pub fn combine(
        semantic_similarity: f64,
        policy_quality: f64,
        constitutional_compliance: f64,
        bias_mitigation: f64,
        confidence: f64,
        weights: &RewardWeights,
    ) -> Self {
        let semantic_similarity = semantic_similarity.clamp(0.0, 1.0);
        let policy_quality = policy_quality.clamp(0.0, 1.0);
        let constitutional_compliance = constitutional_compliance.clamp(0.0, 1.0);
        let bias_mitigation = bias_mitigation.clamp(0.0, 1.0);

        let composite = weights.semantic_similarity * semantic_similarity
            + weights.policy_quality * policy_quality
            + weights.constitutional_compliance * constitutional_compliance
            + weights.bias_mitigation * bias_mitigation;

        Self {
            semantic_similarity,
            policy_quality,
            constitutional_compliance,
            bias_mitigation,
            composite_score: composite.clamp(0.0, 1.0),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    /// All-zero reward
    pub fn zero() -> Self {
        Self {
            semantic_similarity: 0.0,
            policy_quality: 0.0,
            constitutional_compliance: 0.0,
            bias_mitigation: 0.0,
            composite_score: 0.0,
            confidence: 0.0,
        }
    }
}

/// Where the candidate set came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    /// Active templates in the requested category
    Category,
    /// Fell back to the adaptive category
    AdaptiveFallback,
    /// Fell back to every active template
    AllActive,
}

/// Why a template was selected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SelectionReason {
    /// Highest Thompson sample
    Sampled { sample: f64 },
    /// Highest UCB1 score
    UpperConfidence { ucb: f64 },
    /// Never-used arm visited first under UCB1
    Unexplored,
    /// Best mean under epsilon-greedy
    Greedy { average_reward: f64 },
    /// Random pick under epsilon-greedy
    RandomExploration { exploration_rate: f64 },
    /// Only one candidate survived filtering
    SingleCandidate,
}

/// Token issued by a selection and redeemed by `report_outcome`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SelectionToken {
    pub token_id: Uuid,
    pub template_id: String,
    pub session_id: String,
    pub issued_at: DateTime<Utc>,
}

impl SelectionToken {
    /// Issue a fresh token for a template
    pub fn issue(template_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            token_id: Uuid::new_v4(),
            template_id: template_id.into(),
            session_id: session_id.into(),
            issued_at: Utc::now(),
        }
    }
}

/// Append-only fact: one reward observation for one template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub id: Uuid,
    /// Position in the global history order
    pub sequence: u64,
    pub template_id: String,
    pub session_id: String,
    pub reward: RewardComponents,
    pub context: Value,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only fact: a selection merged with its observed outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionRecord {
    pub id: Uuid,
    /// Position in the global history order
    pub sequence: u64,
    pub token_id: Uuid,
    pub template_id: String,
    /// Hash of the template content that was served
    pub template_hash: String,
    pub session_id: String,
    pub algorithm: Algorithm,
    pub reason: SelectionReason,
    pub candidate_source: CandidateSource,
    pub candidates_considered: usize,
    pub is_exploration: bool,
    /// Template statistics when the selection was made
    pub stats_at_selection: TemplateStats,
    pub context: Value,
    pub selected_at: DateTime<Utc>,
    pub outcome: RewardComponents,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_algorithm_parse() {
        assert_eq!(
            "thompson_sampling".parse::<Algorithm>().unwrap(),
            Algorithm::ThompsonSampling
        );
        assert_eq!("UCB1".parse::<Algorithm>().unwrap(), Algorithm::Ucb1);
        assert_eq!(
            "epsilon-greedy".parse::<Algorithm>().unwrap(),
            Algorithm::EpsilonGreedy
        );
        let err = "softmax".parse::<Algorithm>().unwrap_err();
        assert!(matches!(err, Error::ConfigurationError(_)));
    }

    #[test]
    fn test_algorithm_display_round_trips_through_parse() {
        for algorithm in [
            Algorithm::ThompsonSampling,
            Algorithm::Ucb1,
            Algorithm::EpsilonGreedy,
        ] {
            assert_eq!(algorithm.to_string().parse::<Algorithm>().unwrap(), algorithm);
        }
    }

    #[test]
    fn test_weights_normalize() {
        let weights = RewardWeights::new(2.0, 1.0, 1.0, 0.0).normalized().unwrap();
        assert!((weights.sum() - 1.0).abs() < 1e-12);
        assert!((weights.semantic_similarity - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_weights_reject_invalid() {
        assert!(RewardWeights::new(0.0, 0.0, 0.0, 0.0).normalized().is_err());
        assert!(RewardWeights::new(-1.0, 1.0, 1.0, 1.0).normalized().is_err());
        assert!(RewardWeights::new(f64::NAN, 1.0, 1.0, 1.0).normalized().is_err());
    }

    #[test]
    fn test_config_validation() {
        assert!(MabConfig::default().validate().is_ok());

        let config = MabConfig {
            exploration_rate: 1.5,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::ConfigurationError(_))));

        let config = MabConfig {
            reward_weights: RewardWeights::new(0.0, 0.0, 0.0, 0.0),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = MabConfig {
            confidence_level: 1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_placeholders_ignore_policy_braces() {
        let template = PromptTemplate::new(
            "t",
            "T",
            "Principles:\n{principles}\nExample: allow { input.user == \"x\" }\n{requirements} {principles}",
            "constitutional",
        );
        assert_eq!(template.placeholders(), vec!["principles", "requirements"]);
    }

    #[test]
    fn test_fill_keeps_unknown_placeholders() {
        let template = PromptTemplate::new("t", "T", "Goal: {goal}. Extra: {missing}.", "adaptive");
        let context = SynthesisContext::new().with("goal", "restrict access");
        assert_eq!(
            template.fill(&context),
            "Goal: restrict access. Extra: {missing}."
        );
    }

    #[test]
    fn test_fill_renders_lists_line_by_line() {
        let template = PromptTemplate::new("t", "T", "{principles}", "adaptive");
        let context = SynthesisContext::new().with("principles", json!(["fairness", "privacy"]));
        assert_eq!(template.fill(&context), "- fairness\n- privacy");
    }

    #[test]
    fn test_content_hash_is_stable() {
        let a = PromptTemplate::new("a", "A", "same text", "x");
        let b = PromptTemplate::new("b", "B", "same text", "y");
        assert_eq!(a.content_hash(), b.content_hash());
        assert_eq!(a.content_hash().len(), 64);
    }

    #[test]
    fn test_context_accessors() {
        let context = SynthesisContext::from_value(json!({
            "category": "  ",
            "session_id": "s-1",
            "protected_attributes": "race, gender"
        }))
        .unwrap();
        assert_eq!(context.category(), None);
        assert_eq!(context.session_id(), Some("s-1"));
        assert_eq!(context.string_list("protected_attributes"), vec!["race", "gender"]);
        assert!(SynthesisContext::from_value(json!([1, 2])).is_err());
    }

    #[test]
    fn test_stats_delta_threshold_tolerance() {
        let delta = StatsDelta::from_reward(0.85 - 1e-12, 0.85);
        assert!(delta.success);
        let delta = StatsDelta::from_reward(0.84, 0.85);
        assert!(!delta.success);
    }

    #[test]
    fn test_reward_combine_weighted_sum() {
        let weights = RewardWeights::new(1.0, 1.0, 1.0, 1.0).normalized().unwrap();
        let reward = RewardComponents::combine(1.0, 0.5, 0.5, 0.0, 0.8, &weights);
        assert!((reward.composite_score - 0.5).abs() < 1e-12);

        let clamped = RewardComponents::combine(2.0, -1.0, 0.5, 0.5, 3.0, &weights);
        assert_eq!(clamped.semantic_similarity, 1.0);
        assert_eq!(clamped.policy_quality, 0.0);
        assert_eq!(clamped.confidence, 1.0);
    }

    #[test]
    fn test_stats_replay_matches_live_updates() {
        let model = ConfidenceModel::from_config(&MabConfig::default());
        let mut live = TemplateStats::default();
        let mut records = Vec::new();
        for (i, reward) in [0.9, 0.4, 0.85, 0.7, 0.95, 0.6].into_iter().enumerate() {
            let delta = StatsDelta::from_reward(reward, 0.8);
            live.record(&delta, &model);
            let mut record_reward = RewardComponents::zero();
            record_reward.composite_score = reward;
            records.push(PerformanceRecord {
                id: Uuid::new_v4(),
                sequence: i as u64 + 1,
                template_id: "a".to_string(),
                session_id: "default".to_string(),
                reward: record_reward,
                context: Value::Null,
                recorded_at: delta.observed_at,
            });
        }

        let replayed = TemplateStats::replay(&records, 0.8, &model);
        assert_eq!(replayed, live);
        assert_eq!(TemplateStats::replay(&[], 0.8, &model), TemplateStats::default());
    }
}
