//! Deterministic offline generator
//!
//! Builds a Rego policy from cues in the prompt itself. The same prompt always
//! yields the same policy, which makes it useful for demos and tests where no
//! model endpoint is available.

use async_trait::async_trait;

use crate::error::Result;

use super::{GenerationParams, TextGenerator};

/// Section headers whose bullet lines are echoed into the policy
const PRINCIPLE_HEADERS: &[&str] = &["principles", "principles that must never be violated"];
const REQUIREMENT_HEADERS: &[&str] = &["requirements", "synthesis requirements"];

#[derive(Debug, Clone, Default)]
pub struct OfflineGenerator;

impl OfflineGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Synthesize a policy for the prompt
    pub fn synthesize(&self, prompt: &str) -> String {
        let lower = prompt.to_lowercase();
        let principles = section_lines(prompt, PRINCIPLE_HEADERS);
        let requirements = section_lines(prompt, REQUIREMENT_HEADERS);

        let wants_deny = lower.contains("deny");
        let wants_fairness = lower.contains("protected") || lower.contains("fair");

        let package = if lower.contains("safety") {
            "safety.generated"
        } else if lower.contains("constitutional") {
            "constitutional.generated"
        } else {
            "governance.generated"
        };

        let mut out = format!("package {}\n\n", package);

        for principle in &principles {
            out.push_str(&format!("# principle: {}\n", principle));
        }
        if !principles.is_empty() {
            out.push('\n');
        }

        out.push_str("default allow := false\n\n");

        out.push_str("allow if {\n    input.request.authenticated == true\n");
        for (i, _) in requirements.iter().enumerate() {
            out.push_str(&format!("    requirement_{}\n", i + 1));
        }
        if wants_deny {
            out.push_str("    count(deny) == 0\n");
        }
        if wants_fairness {
            out.push_str("    count(violation) == 0\n");
        }
        out.push_str("}\n");

        for (i, requirement) in requirements.iter().enumerate() {
            out.push_str(&format!(
                "\n# requirement: {}\nrequirement_{} if {{\n    input.context.{} == true\n}}\n",
                requirement,
                i + 1,
                slug(requirement)
            ));
        }

        if wants_deny {
            out.push_str(
                "\ndeny contains msg if {\n    not input.request.authenticated\n    msg := \"request is not authenticated\"\n}\n",
            );
        }

        if wants_fairness {
            out.push_str(
                "\n# bias mitigation: decisions never read protected attributes\nviolation contains msg if {\n    input.decision.outcome_by_group[_] != input.decision.outcome\n    msg := \"decision treats groups unequally\"\n}\n",
            );
        }

        out
    }
}

#[async_trait]
impl TextGenerator for OfflineGenerator {
    async fn generate(&self, prompt: &str, _params: &GenerationParams) -> Result<String> {
        Ok(self.synthesize(prompt))
    }

    fn name(&self) -> &str {
        "offline"
    }
}

/// Non-empty lines following one of the given headers, up to the next blank line
fn section_lines(prompt: &str, headers: &[&str]) -> Vec<String> {
    let mut lines = Vec::new();
    let mut inside = false;

    for line in prompt.lines() {
        let trimmed = line.trim();
        if let Some(header) = trimmed.strip_suffix(':') {
            inside = headers.contains(&header.to_lowercase().as_str());
            continue;
        }
        if trimmed.is_empty() {
            inside = false;
            continue;
        }
        // unfilled placeholders carry no content
        if inside && !(trimmed.starts_with('{') && trimmed.ends_with('}')) {
            lines.push(trimmed.trim_start_matches(['-', '*', ' ']).to_string());
        }
    }

    lines
}

fn slug(text: &str) -> String {
    let words: Vec<String> = text
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .take(4)
        .map(str::to_lowercase)
        .collect();
    if words.is_empty() {
        "satisfied".to_string()
    } else {
        words.join("_")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROMPT: &str = "Principles:\n- Users must consent to data processing\n\nRequirements:\n- Require MFA for admin actions\n- Log every access\n\nContext:\nnone";

    #[test]
    fn test_synthesis_is_deterministic() {
        let generator = OfflineGenerator::new();
        assert_eq!(generator.synthesize(PROMPT), generator.synthesize(PROMPT));
    }

    #[test]
    fn test_synthesis_echoes_sections() {
        let policy = OfflineGenerator::new().synthesize(PROMPT);
        assert!(policy.starts_with("package governance.generated"));
        assert!(policy.contains("default allow := false"));
        assert!(policy.contains("# principle: Users must consent to data processing"));
        assert!(policy.contains("requirement_2 if {"));
        assert!(policy.contains("input.context.require_mfa_for_admin == true"));
        assert!(!policy.contains("deny contains"));
    }

    #[test]
    fn test_cues_add_rules() {
        let policy = OfflineGenerator::new()
            .synthesize("Safety first. Emit a deny rule. Guard protected attributes.");
        assert!(policy.starts_with("package safety.generated"));
        assert!(policy.contains("deny contains msg"));
        assert!(policy.contains("violation contains msg"));
        assert!(policy.contains("count(deny) == 0"));
    }

    #[test]
    fn test_unfilled_placeholders_ignored() {
        let lines = section_lines("Principles:\n{principles}\n", PRINCIPLE_HEADERS);
        assert!(lines.is_empty());
    }

    #[tokio::test]
    async fn test_generate_via_trait() {
        let generator: &dyn TextGenerator = &OfflineGenerator::new();
        let out = generator
            .generate(PROMPT, &GenerationParams::default())
            .await
            .unwrap();
        assert!(out.contains("allow if"));
        assert_eq!(generator.name(), "offline");
    }
}
