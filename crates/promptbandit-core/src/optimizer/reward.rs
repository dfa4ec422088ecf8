//! Multi-signal reward evaluation of generated policies
//!
//! The evaluator never parses the policy language. Each signal is a cheap
//! lexical heuristic in [0, 1]; `observed_scores` in the context lets a
//! downstream validator replace any of them with a measured value.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use tracing::debug;

use super::types::{PromptTemplate, RewardComponents, RewardWeights, SynthesisContext};
use crate::error::Result;

/// Score given to a signal that has nothing to compare against
const NEUTRAL_SCORE: f64 = 0.5;

/// Output length (chars) at which the length factor of confidence saturates
const CONFIDENT_LENGTH: f64 = 200.0;

const MIN_POLICY_LENGTH: usize = 40;
const MAX_POLICY_LENGTH: usize = 20_000;

/// Significant tokens taken from a principle without explicit keywords
const MAX_PRINCIPLE_TERMS: usize = 5;

const DEFAULT_PROTECTED_ATTRIBUTES: &[&str] = &[
    "race",
    "gender",
    "age",
    "religion",
    "ethnicity",
    "disability",
    "nationality",
    "sexual_orientation",
];

const FAIRNESS_MARKERS: &[&str] = &[
    "fair",
    "bias",
    "discriminat",
    "equal",
    "equit",
    "protected",
    "neutral",
    "mitigat",
];

const STOPWORDS: &[&str] = &[
    "about", "also", "been", "does", "each", "from", "have", "into", "must", "only", "other",
    "over", "shall", "should", "some", "such", "than", "that", "their", "them", "then", "there",
    "these", "they", "this", "under", "upon", "were", "what", "when", "where", "which", "while",
    "will", "with", "would", "your",
];

/// A signal value and whether it rests on actual evidence
#[derive(Debug, Clone, Copy)]
struct Signal {
    value: f64,
    evidence: bool,
}

impl Signal {
    fn measured(value: f64) -> Self {
        Self {
            value: value.clamp(0.0, 1.0),
            evidence: true,
        }
    }

    fn neutral() -> Self {
        Self {
            value: NEUTRAL_SCORE,
            evidence: false,
        }
    }
}

/// Principle reduced to the terms that must show up in a compliant policy
#[derive(Debug, Clone)]
struct Principle {
    text: String,
    keywords: Vec<String>,
}

impl Principle {
    fn key_terms(&self) -> Vec<String> {
        if !self.keywords.is_empty() {
            return self.keywords.clone();
        }
        let mut terms: Vec<String> = Vec::new();
        for token in tokenize(&self.text) {
            if token.chars().count() >= 4
                && !STOPWORDS.contains(&token.as_str())
                && !terms.contains(&token)
            {
                terms.push(token);
                if terms.len() == MAX_PRINCIPLE_TERMS {
                    break;
                }
            }
        }
        terms
    }
}

/// Scores generated output against the synthesis context
#[derive(Debug, Clone)]
pub struct RewardEvaluator {
    weights: RewardWeights,
}

impl RewardEvaluator {
    /// Create an evaluator; weights are normalised to sum to 1
    pub fn new(weights: RewardWeights) -> Result<Self> {
        Ok(Self {
            weights: weights.normalized()?,
        })
    }

    /// Normalised weights in use
    pub fn weights(&self) -> &RewardWeights {
        &self.weights
    }

    /// Score one output. Never fails: malformed output just scores low.
    pub fn score(
        &self,
        template: &PromptTemplate,
        output: &str,
        context: &SynthesisContext,
    ) -> RewardComponents {
        let trimmed = output.trim();
        let empty = trimmed.is_empty();
        let lowered = trimmed.to_lowercase();
        let principles = principles(context);

        let (mut similarity, mut quality, mut compliance, mut bias) = if empty {
            let zero = Signal::measured(0.0);
            (zero, zero, zero, zero)
        } else {
            (
                semantic_similarity(&lowered, context, &principles),
                Signal::measured(policy_quality(trimmed)),
                constitutional_compliance(&lowered, &principles),
                Signal::measured(bias_mitigation(&lowered, context)),
            )
        };

        apply_observed_scores(
            context,
            &mut [
                (&["semantic_similarity", "similarity"][..], &mut similarity),
                (&["policy_quality", "quality"][..], &mut quality),
                (&["constitutional_compliance", "compliance"][..], &mut compliance),
                (&["bias_mitigation", "bias"][..], &mut bias),
            ],
        );

        let confidence = if empty {
            0.0
        } else {
            let evidence = [similarity, quality, compliance, bias]
                .iter()
                .filter(|s| s.evidence)
                .count() as f64;
            let length_factor = (trimmed.chars().count() as f64 / CONFIDENT_LENGTH).min(1.0);
            evidence / 4.0 * (0.5 + 0.5 * length_factor)
        };

        let reward = RewardComponents::combine(
            similarity.value,
            quality.value,
            compliance.value,
            bias.value,
            confidence,
            &self.weights,
        );

        debug!(
            template_id = %template.id,
            composite = reward.composite_score,
            similarity = reward.semantic_similarity,
            quality = reward.policy_quality,
            compliance = reward.constitutional_compliance,
            bias = reward.bias_mitigation,
            confidence = reward.confidence,
            "Scored output"
        );

        reward
    }
}

fn apply_observed_scores(context: &SynthesisContext, signals: &mut [(&[&str], &mut Signal)]) {
    let Some(Value::Object(observed)) = context.get("observed_scores") else {
        return;
    };
    for (keys, signal) in signals.iter_mut() {
        if let Some(value) = keys
            .iter()
            .find_map(|key| observed.get(*key).and_then(Value::as_f64))
            .filter(|v| v.is_finite())
        {
            **signal = Signal::measured(value);
        }
    }
}

/// Lowercased tokens of alphanumerics and underscores, at least two chars
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| t.chars().count() >= 2)
        .map(str::to_string)
        .collect()
}

fn term_frequencies(text: &str) -> HashMap<String, f64> {
    let mut tf = HashMap::new();
    for token in tokenize(text) {
        *tf.entry(token).or_insert(0.0) += 1.0;
    }
    tf
}

fn cosine_similarity(a: &HashMap<String, f64>, b: &HashMap<String, f64>) -> f64 {
    let dot: f64 = a
        .iter()
        .filter_map(|(term, x)| b.get(term).map(|y| x * y))
        .sum();
    let norm_a = a.values().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b = b.values().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(0.0, 1.0)
}

fn reference_text(context: &SynthesisContext, principles: &[Principle]) -> Option<String> {
    if let Some(reference) = context.text("reference_policy") {
        return Some(reference);
    }
    if let Some(expected) = context.text("expected_output") {
        return Some(expected);
    }

    let mut parts: Vec<String> = principles.iter().map(|p| p.text.clone()).collect();
    if let Some(requirements) = context.text("requirements") {
        parts.push(requirements);
    }
    let joined = parts.join("\n");
    if joined.trim().is_empty() { None } else { Some(joined) }
}

fn semantic_similarity(
    output: &str,
    context: &SynthesisContext,
    principles: &[Principle],
) -> Signal {
    match reference_text(context, principles) {
        Some(reference) => Signal::measured(cosine_similarity(
            &term_frequencies(output),
            &term_frequencies(&reference),
        )),
        None => Signal::neutral(),
    }
}

fn policy_quality(output: &str) -> f64 {
    let tokens: HashSet<String> = tokenize(output).into_iter().collect();
    let has_line = |prefix: &str| output.lines().any(|l| l.trim_start().starts_with(prefix));

    let checks = [
        has_line("package "),
        ["allow", "deny", "violation"]
            .iter()
            .any(|rule| tokens.contains(*rule)),
        has_line("default "),
        braces_balanced(output),
        output.contains("input.")
            || output.contains(":=")
            || output.contains("==")
            || output.contains(" if "),
        (MIN_POLICY_LENGTH..=MAX_POLICY_LENGTH).contains(&output.chars().count()),
    ];

    checks.iter().filter(|passed| **passed).count() as f64 / checks.len() as f64
}

/// At least one brace pair, never closing more than was opened
fn braces_balanced(output: &str) -> bool {
    let mut depth: i64 = 0;
    let mut opened = false;
    for c in output.chars() {
        match c {
            '{' => {
                depth += 1;
                opened = true;
            }
            '}' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    opened && depth == 0
}

fn principles(context: &SynthesisContext) -> Vec<Principle> {
    let Some(value) = context.get("principles") else {
        return Vec::new();
    };
    let items: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        Value::Null => Vec::new(),
        other => vec![other],
    };

    items.into_iter().filter_map(principle_from_value).collect()
}

fn principle_from_value(value: &Value) -> Option<Principle> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(Principle {
            text: text.clone(),
            keywords: Vec::new(),
        }),
        Value::Object(fields) => {
            let text = ["title", "content", "description"]
                .iter()
                .filter_map(|key| fields.get(*key).and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(" ");
            let text = if text.trim().is_empty() {
                fields.get("id").and_then(Value::as_str).unwrap_or_default().replace('_', " ")
            } else {
                text
            };
            let keywords: Vec<String> = fields
                .get("keywords")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(|k| k.trim().to_lowercase())
                        .filter(|k| !k.is_empty())
                        .collect()
                })
                .unwrap_or_default();
            if text.trim().is_empty() && keywords.is_empty() {
                None
            } else {
                Some(Principle { text, keywords })
            }
        }
        _ => None,
    }
}

fn constitutional_compliance(output: &str, principles: &[Principle]) -> Signal {
    let tokens: HashSet<String> = tokenize(output).into_iter().collect();
    let mut applicable = 0usize;
    let mut satisfied = 0usize;

    for principle in principles {
        let terms = principle.key_terms();
        if terms.is_empty() {
            continue;
        }
        applicable += 1;
        let present = terms
            .iter()
            .filter(|term| tokens.contains(term.as_str()) || output.contains(term.as_str()))
            .count();
        if present * 2 >= terms.len() {
            satisfied += 1;
        }
    }

    if applicable == 0 {
        return Signal::neutral();
    }
    Signal::measured(satisfied as f64 / applicable as f64)
}

fn bias_mitigation(output: &str, context: &SynthesisContext) -> f64 {
    let configured = context.string_list("protected_attributes");
    let attributes: Vec<String> = if configured.is_empty() {
        DEFAULT_PROTECTED_ATTRIBUTES.iter().map(|a| a.to_string()).collect()
    } else {
        configured.iter().map(|a| a.to_lowercase()).collect()
    };

    let tokens: HashSet<String> = tokenize(output).into_iter().collect();
    let mentions = attributes
        .iter()
        .filter(|attr| {
            tokens.contains(attr.as_str())
                || (attr.contains(['_', ' ']) && output.contains(&attr.replace('_', " ")))
        })
        .count();
    let guards = FAIRNESS_MARKERS
        .iter()
        .filter(|marker| output.contains(*marker))
        .count();

    if mentions == 0 {
        0.7 + 0.3 * guards.min(2) as f64 / 2.0
    } else {
        0.3 + 0.7 * (guards as f64 / mentions as f64).min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use serde_json::json;

    const GOOD_POLICY: &str = r#"package constitutional.access

default allow := false

allow if {
    input.user.role == "admin"
    input.action == "read"
}
"#;

    fn evaluator() -> RewardEvaluator {
        RewardEvaluator::new(RewardWeights::default()).unwrap()
    }

    fn template() -> PromptTemplate {
        PromptTemplate::new("t", "T", "{requirements}", "constitutional")
    }

    #[test]
    fn test_rejects_unnormalisable_weights() {
        let err = RewardEvaluator::new(RewardWeights::new(0.0, 0.0, 0.0, 0.0)).unwrap_err();
        assert!(matches!(err, Error::ConfigurationError(_)));
    }

    #[test]
    fn test_empty_output_scores_zero() {
        let context = SynthesisContext::new().with("requirements", "restrict admin access");
        let reward = evaluator().score(&template(), "   \n", &context);
        assert_eq!(reward.composite_score, 0.0);
        assert_eq!(reward.confidence, 0.0);
    }

    #[test]
    fn test_observed_scores_override_signals() {
        let context = SynthesisContext::new().with(
            "observed_scores",
            json!({
                "semantic_similarity": 0.85,
                "policy_quality": 0.85,
                "constitutional_compliance": 0.85,
                "bias_mitigation": 0.85
            }),
        );
        let reward = evaluator().score(&template(), GOOD_POLICY, &context);
        assert!((reward.composite_score - 0.85).abs() < 1e-9);
        assert!(reward.confidence > 0.5);
    }

    #[test]
    fn test_observed_scores_are_clamped() {
        let context = SynthesisContext::new().with("observed_scores", json!({"quality": 3.0}));
        let reward = evaluator().score(&template(), GOOD_POLICY, &context);
        assert_eq!(reward.policy_quality, 1.0);
    }

    #[test]
    fn test_structured_policy_beats_prose() {
        let context = SynthesisContext::new();
        let policy = evaluator().score(&template(), GOOD_POLICY, &context);
        let prose = evaluator().score(&template(), "I cannot write that policy today.", &context);
        assert_eq!(policy.policy_quality, 1.0);
        assert!(prose.policy_quality < 0.5);
        assert!(policy.composite_score > prose.composite_score);
    }

    #[test]
    fn test_unbalanced_braces_fail_check() {
        assert!(braces_balanced("a { b { c } }"));
        assert!(!braces_balanced("} {"));
        assert!(!braces_balanced("{ open"));
        assert!(!braces_balanced("no braces"));
    }

    #[test]
    fn test_missing_context_is_neutral() {
        let reward = evaluator().score(&template(), GOOD_POLICY, &SynthesisContext::new());
        assert_eq!(reward.semantic_similarity, NEUTRAL_SCORE);
        assert_eq!(reward.constitutional_compliance, NEUTRAL_SCORE);
        // quality and bias carry evidence; similarity and compliance do not
        assert!(reward.confidence <= 0.5 + 1e-12);
    }

    #[test]
    fn test_identical_reference_is_fully_similar() {
        let context = SynthesisContext::new().with("reference_policy", GOOD_POLICY);
        let reward = evaluator().score(&template(), GOOD_POLICY, &context);
        assert!((reward.semantic_similarity - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_compliance_counts_principle_terms() {
        let context = SynthesisContext::new().with(
            "principles",
            json!([
                {"id": "least_privilege", "keywords": ["admin", "role"]},
                {"id": "audit", "keywords": ["audit", "logging", "retention"]}
            ]),
        );
        let reward = evaluator().score(&template(), GOOD_POLICY, &context);
        assert!((reward.constitutional_compliance - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_string_principles_use_significant_terms() {
        let principles = vec![Principle {
            text: "Users must consent before their data is shared".to_string(),
            keywords: Vec::new(),
        }];
        assert_eq!(
            principles[0].key_terms(),
            vec!["users", "consent", "before", "data", "shared"]
        );
        let signal = constitutional_compliance("allow if input.consent and data not shared", &principles);
        assert!(signal.evidence);
        assert_eq!(signal.value, 1.0);
    }

    #[test]
    fn test_unguarded_protected_attribute_is_penalised() {
        let context = SynthesisContext::new();
        let unguarded = bias_mitigation("deny if input.user.race == \"x\"", &context);
        let guarded = bias_mitigation(
            "deny if input.user.race == \"x\" # fairness: protected attribute excluded",
            &context,
        );
        let silent = bias_mitigation("allow if input.user.role == \"admin\"", &context);
        assert!((unguarded - 0.3).abs() < 1e-12);
        assert!(guarded > unguarded);
        assert!(silent >= 0.7);
    }

    #[test]
    fn test_custom_protected_attributes() {
        let context = SynthesisContext::new().with("protected_attributes", json!(["zip_code"]));
        let score = bias_mitigation("deny if input.zip_code == \"90210\"", &context);
        assert!((score - 0.3).abs() < 1e-12);
    }
}
