//! Stage prompts and model parameters.
//!
//! Each stage role pairs a system instruction and a user-message template
//! with the model and sampling parameters it runs with. Templates are opaque
//! to the orchestrator: it only fills their placeholders.
//!
//! # Usage
//!
//! ```
//! use discovery_forge::prompts::{default_stage_config, AgentRole};
//!
//! let config = default_stage_config(AgentRole::PhysicsOracle);
//! let request = config.request(&[("question", "At what pressure does graphite convert to diamond?")]);
//! assert!(request.user_text().contains("graphite"));
//! assert_eq!(request.params.temperature, 0.2);
//! ```

pub mod discovery;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::llm::{CompletionRequest, SamplingParams};

/// Default model for reasoning-heavy roles.
pub const REASONING_MODEL: &str = "gpt-oss-20b";

/// Default model for structuring and formatting roles.
pub const STRUCTURING_MODEL: &str = "meta-llama-3.1-8b-instruct";

/// The personas that back the pipeline stages.
///
/// The physics oracle is shared by step validation and challenge checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Orchestrator,
    HypothesisGenerator,
    StepDecomposer,
    PhysicsOracle,
    ChainAssembler,
    EngineeringProposer,
    RequirementChallenger,
    Overseer,
    FinalEvaluator,
}

impl AgentRole {
    /// All roles in pipeline order.
    pub const ALL: [AgentRole; 9] = [
        AgentRole::Orchestrator,
        AgentRole::HypothesisGenerator,
        AgentRole::StepDecomposer,
        AgentRole::PhysicsOracle,
        AgentRole::ChainAssembler,
        AgentRole::EngineeringProposer,
        AgentRole::RequirementChallenger,
        AgentRole::Overseer,
        AgentRole::FinalEvaluator,
    ];

    /// Configuration key of this role.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Orchestrator => "orchestrator",
            AgentRole::HypothesisGenerator => "hypothesis_generator",
            AgentRole::StepDecomposer => "step_decomposer",
            AgentRole::PhysicsOracle => "physics_oracle",
            AgentRole::ChainAssembler => "chain_assembler",
            AgentRole::EngineeringProposer => "engineering_proposer",
            AgentRole::RequirementChallenger => "requirement_challenger",
            AgentRole::Overseer => "overseer",
            AgentRole::FinalEvaluator => "final_evaluator",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentRole::ALL
            .iter()
            .copied()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownStage(s.to_string()))
    }
}

/// Prompt templates and model parameters for one stage role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Human-readable persona name, used in logs.
    pub name: String,
    /// System instruction template.
    pub system_template: String,
    /// User message template.
    pub user_template: String,
    /// Model identifier.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f64,
    /// Maximum output tokens.
    pub max_tokens: u32,
    /// Nucleus sampling parameter.
    pub top_p: f64,
}

impl StageConfig {
    /// Sampling parameters of this stage.
    pub fn params(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            top_p: self.top_p,
        }
    }

    /// Builds a completion request, filling both templates with `vars`.
    pub fn request(&self, vars: &[(&str, &str)]) -> CompletionRequest {
        CompletionRequest::new(
            self.model.clone(),
            render(&self.system_template, vars),
            render(&self.user_template, vars),
        )
        .with_params(self.params())
    }
}

/// Fills `{name}` placeholders in a single pass.
///
/// Unknown placeholders and braces that do not enclose an identifier are
/// copied verbatim, and substituted values are never re-scanned.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];

        let key_len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after.len());
        let key = &after[..key_len];

        if key_len > 0 && after[key_len..].starts_with('}') {
            if let Some((_, value)) = vars.iter().find(|(name, _)| *name == key) {
                out.push_str(value);
                rest = &after[key_len + 1..];
                continue;
            }
        }

        out.push('{');
        rest = after;
    }

    out.push_str(rest);
    out
}

/// Built-in configuration for a role.
pub fn default_stage_config(role: AgentRole) -> StageConfig {
    use discovery::*;

    let (name, system, user, model, temperature, max_tokens, top_p) = match role {
        AgentRole::Orchestrator => (
            "Orchestrator",
            ORCHESTRATOR_SYSTEM,
            ORCHESTRATOR_USER,
            REASONING_MODEL,
            0.3,
            2000,
            0.9,
        ),
        AgentRole::HypothesisGenerator => (
            "Hypothesis Generator",
            HYPOTHESIS_GENERATOR_SYSTEM,
            HYPOTHESIS_GENERATOR_USER,
            REASONING_MODEL,
            0.8,
            4000,
            0.95,
        ),
        AgentRole::StepDecomposer => (
            "Step Decomposer",
            STEP_DECOMPOSER_SYSTEM,
            STEP_DECOMPOSER_USER,
            STRUCTURING_MODEL,
            0.2,
            3000,
            0.9,
        ),
        AgentRole::PhysicsOracle => (
            "Physics Oracle",
            PHYSICS_ORACLE_SYSTEM,
            PHYSICS_ORACLE_USER,
            REASONING_MODEL,
            0.2,
            2000,
            0.85,
        ),
        AgentRole::ChainAssembler => (
            "Chain Assembler",
            CHAIN_ASSEMBLER_SYSTEM,
            CHAIN_ASSEMBLER_USER,
            STRUCTURING_MODEL,
            0.3,
            3000,
            0.9,
        ),
        AgentRole::EngineeringProposer => (
            "Engineering Proposer",
            ENGINEERING_PROPOSER_SYSTEM,
            ENGINEERING_PROPOSER_USER,
            REASONING_MODEL,
            0.7,
            4000,
            0.95,
        ),
        AgentRole::RequirementChallenger => (
            "Requirement Challenger",
            REQUIREMENT_CHALLENGER_SYSTEM,
            REQUIREMENT_CHALLENGER_USER,
            REASONING_MODEL,
            0.9,
            3000,
            0.95,
        ),
        AgentRole::Overseer => (
            "Overseer",
            OVERSEER_SYSTEM,
            OVERSEER_USER,
            REASONING_MODEL,
            0.4,
            4000,
            0.9,
        ),
        AgentRole::FinalEvaluator => (
            "Final Evaluator",
            FINAL_EVALUATOR_SYSTEM,
            FINAL_EVALUATOR_USER,
            REASONING_MODEL,
            0.3,
            6000,
            0.9,
        ),
    };

    StageConfig {
        name: name.to_string(),
        system_template: system.to_string(),
        user_template: user.to_string(),
        model: model.to_string(),
        temperature,
        max_tokens,
        top_p,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_substitutes_known_keys() {
        let out = render("Q: {question} ({unit})", &[("question", "How hot?"), ("unit", "K")]);
        assert_eq!(out, "Q: How hot? (K)");
    }

    #[test]
    fn test_render_keeps_json_braces_and_unknown_keys() {
        let template = "{\n  \"a\": 1\n} {missing} {}";
        assert_eq!(render(template, &[("x", "y")]), template);
    }

    #[test]
    fn test_render_does_not_rescan_values() {
        let out = render("{a} {b}", &[("a", "{b}"), ("b", "B")]);
        assert_eq!(out, "{b} B");
    }

    #[test]
    fn test_render_unterminated_placeholder() {
        assert_eq!(render("tail {open", &[("open", "x")]), "tail {open");
    }

    #[test]
    fn test_role_round_trip() {
        for role in AgentRole::ALL {
            assert_eq!(role.as_str().parse::<AgentRole>().unwrap(), role);
        }
        assert!("physicist".parse::<AgentRole>().is_err());
    }

    #[test]
    fn test_default_parameters() {
        let oracle = default_stage_config(AgentRole::PhysicsOracle);
        assert_eq!(oracle.model, REASONING_MODEL);
        assert_eq!(oracle.top_p, 0.85);

        let decomposer = default_stage_config(AgentRole::StepDecomposer);
        assert_eq!(decomposer.model, STRUCTURING_MODEL);
        assert_eq!(decomposer.max_tokens, 3000);

        let writer = default_stage_config(AgentRole::FinalEvaluator);
        assert_eq!(writer.max_tokens, 6000);
    }

    #[test]
    fn test_challenger_system_prompt_carries_iteration() {
        let config = default_stage_config(AgentRole::RequirementChallenger);
        let request = config.request(&[
            ("iteration", "2"),
            ("max_iterations", "3"),
            ("engineering_proposal", "p"),
            ("assembled_pathway", "a"),
            ("previous_challenges", "none"),
        ]);
        assert!(request.system_text().contains("ITERATION 2 of 3"));
        assert!(request.system_text().contains("\"challenges\""));
    }
}
