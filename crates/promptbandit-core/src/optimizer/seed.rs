//! Built-in prompt templates loaded when the store is empty

use super::types::{ADAPTIVE_CATEGORY, PromptTemplate};

const CONSTITUTIONAL_PROMPT: &str = r#"You are a policy engineer writing Rego policies for a constitutional AI governance system.

Constitutional principles:
{principles}

Synthesis requirements:
{requirements}

Additional context:
{context}

Write a single Rego policy that:
1. Declares a package under `constitutional.`
2. Sets `default allow := false`
3. Grants access only when every principle above is satisfied
4. References request fields through `input.`

Return only the policy source."#;

const SAFETY_CRITICAL_PROMPT: &str = r#"You are writing a Rego policy for a safety-critical control point. False positives are acceptable; false negatives are not.

Principles that must never be violated:
{principles}

Requirements:
{requirements}

Context:
{context}

Rules:
- Start with a package declaration and `default allow := false`
- Emit a `deny` rule with a reason message for every unsafe condition
- `allow` may only hold when no `deny` rule fires
- Prefer explicit equality checks on `input.` fields over pattern matching

Return only the policy source."#;

const FAIRNESS_AWARE_PROMPT: &str = r#"You are writing a Rego policy that must be fair across protected groups.

Principles:
{principles}

Requirements:
{requirements}

Context:
{context}

Guidelines:
- Never base a decision on a protected attribute such as race, gender, age, religion or disability
- When a protected attribute appears in the input, add a comment explaining how bias is mitigated
- Include a `violation` rule that flags decisions which treat groups unequally
- Declare a package and a `default allow := false` statement

Return only the policy source."#;

const ADAPTIVE_GENERAL_PROMPT: &str = r#"Generate a Rego policy for the following governance task.

Principles:
{principles}

Requirements:
{requirements}

Context:
{context}

The policy should declare a package, set a safe default, and express each requirement as a rule over `input.` fields. Return only the policy source."#;

/// The four built-in templates, all at version 1.0
pub fn default_templates() -> Vec<PromptTemplate> {
    vec![
        PromptTemplate::new(
            "constitutional_v1_0",
            "Constitutional Policy Synthesis",
            CONSTITUTIONAL_PROMPT,
            "constitutional",
        )
        .with_description("Principle-by-principle policy synthesis with a deny-by-default stance")
        .with_expected_performance(0.85),
        PromptTemplate::new(
            "safety_critical_v1_0",
            "Safety-Critical Policy Synthesis",
            SAFETY_CRITICAL_PROMPT,
            "safety_critical",
        )
        .with_description("Conservative synthesis with explicit deny reasons")
        .with_expected_performance(0.9),
        PromptTemplate::new(
            "fairness_aware_v1_0",
            "Fairness-Aware Policy Synthesis",
            FAIRNESS_AWARE_PROMPT,
            "fairness_aware",
        )
        .with_description("Synthesis that guards protected attributes and flags unequal treatment")
        .with_expected_performance(0.8),
        PromptTemplate::new(
            "adaptive_general_v1_0",
            "Adaptive General Policy Synthesis",
            ADAPTIVE_GENERAL_PROMPT,
            ADAPTIVE_CATEGORY,
        )
        .with_description("General-purpose fallback for categories without a dedicated template")
        .with_expected_performance(0.75),
    ]
}
