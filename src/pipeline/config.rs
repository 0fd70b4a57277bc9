//! Pipeline configuration for the discovery orchestrator.
//!
//! This module provides configuration for the completion service endpoint,
//! fan-out sizes, retry policy, output paths and the per-role stage
//! configurations.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::llm::{RetryConfig, DEFAULT_API_BASE, DEFAULT_API_KEY};
use crate::prompts::{default_stage_config, AgentRole, StageConfig};

/// Upper bound for the number of generated hypotheses.
pub const MAX_HYPOTHESES: usize = 50;

/// Upper bound for challenge iterations per proposal.
pub const MAX_CHALLENGE_ITERATIONS: usize = 20;

/// Configuration for one discovery run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    // Completion service
    /// Base URL of the OpenAI-compatible API.
    pub api_base: String,
    /// Bearer token for the API.
    pub api_key: String,
    /// Retry and timeout policy for completion calls.
    pub retry: RetryConfig,

    // Fan-out sizes
    /// How many hypotheses the generator is asked for.
    pub num_hypotheses: usize,
    /// Challenge iterations per engineering proposal.
    pub challenge_iterations: usize,
    /// How many synthesized solutions go into the final write-up.
    pub num_final_proposals: usize,

    // Policy
    /// Feasibility assumed for a validation whose answer could not be parsed.
    pub assume_feasible_when_unparsed: bool,

    // Storage
    /// Directory for checkpoints and run artifacts.
    pub results_dir: PathBuf,

    /// Prompt templates and model parameters per role.
    pub stages: StageConfigs,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: DEFAULT_API_KEY.to_string(),
            retry: RetryConfig::default(),

            num_hypotheses: 5,
            challenge_iterations: 3,
            num_final_proposals: 3,

            assume_feasible_when_unparsed: true,

            results_dir: PathBuf::from("results"),

            stages: StageConfigs::default(),
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DISCOVERY_API_BASE`: Completion API base URL (default: http://127.0.0.1:1234/v1)
    /// - `DISCOVERY_API_KEY`: API key (default: lm-studio)
    /// - `DISCOVERY_RESULTS_DIR`: Output directory (default: results)
    /// - `DISCOVERY_NUM_HYPOTHESES`: Hypotheses to generate (default: 5)
    /// - `DISCOVERY_CHALLENGE_ITERATIONS`: Challenge iterations (default: 3)
    /// - `DISCOVERY_NUM_FINAL_PROPOSALS`: Solutions in the write-up (default: 3)
    /// - `DISCOVERY_MAX_ATTEMPTS`: Attempts per completion call (default: 10)
    /// - `DISCOVERY_REQUEST_TIMEOUT_SECS`: Streaming request ceiling (default: 7200)
    /// - `DISCOVERY_ASSUME_FEASIBLE`: Feasibility of unparseable answers (default: true)
    /// - `DISCOVERY_STAGES_FILE`: YAML file with per-role overrides
    /// - `DISCOVERY_MODEL`: Model used by every role, applied last
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the result
    /// fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("DISCOVERY_API_BASE") {
            config.api_base = val;
        }

        if let Some(val) = lookup("DISCOVERY_API_KEY") {
            config.api_key = val;
        }

        if let Some(val) = lookup("DISCOVERY_RESULTS_DIR") {
            config.results_dir = PathBuf::from(val);
        }

        if let Some(val) = lookup("DISCOVERY_NUM_HYPOTHESES") {
            config.num_hypotheses = parse_env_value(&val, "DISCOVERY_NUM_HYPOTHESES")?;
        }

        if let Some(val) = lookup("DISCOVERY_CHALLENGE_ITERATIONS") {
            config.challenge_iterations = parse_env_value(&val, "DISCOVERY_CHALLENGE_ITERATIONS")?;
        }

        if let Some(val) = lookup("DISCOVERY_NUM_FINAL_PROPOSALS") {
            config.num_final_proposals = parse_env_value(&val, "DISCOVERY_NUM_FINAL_PROPOSALS")?;
        }

        if let Some(val) = lookup("DISCOVERY_MAX_ATTEMPTS") {
            config.retry.max_attempts = parse_env_value(&val, "DISCOVERY_MAX_ATTEMPTS")?;
        }

        if let Some(val) = lookup("DISCOVERY_REQUEST_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "DISCOVERY_REQUEST_TIMEOUT_SECS")?;
            config.retry.request_timeout = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("DISCOVERY_ASSUME_FEASIBLE") {
            config.assume_feasible_when_unparsed = parse_env_bool(&val, "DISCOVERY_ASSUME_FEASIBLE")?;
        }

        if let Some(path) = lookup("DISCOVERY_STAGES_FILE") {
            config.stages.load_overrides(Path::new(&path))?;
        }

        if let Some(model) = lookup("DISCOVERY_MODEL") {
            config.stages.set_model_for_all(&model);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_base.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "api_base cannot be empty".to_string(),
            ));
        }

        if self.num_hypotheses == 0 || self.num_hypotheses > MAX_HYPOTHESES {
            return Err(ConfigError::ValidationFailed(format!(
                "num_hypotheses must be between 1 and {MAX_HYPOTHESES}"
            )));
        }

        if self.challenge_iterations > MAX_CHALLENGE_ITERATIONS {
            return Err(ConfigError::ValidationFailed(format!(
                "challenge_iterations cannot exceed {MAX_CHALLENGE_ITERATIONS}"
            )));
        }

        if self.num_final_proposals == 0 {
            return Err(ConfigError::ValidationFailed(
                "num_final_proposals must be greater than 0".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.retry.request_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "request_timeout must be greater than 0".to_string(),
            ));
        }

        self.stages.validate()
    }

    /// Builder method to set the API base URL.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    /// Builder method to set the API key.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    /// Builder method to set the results directory.
    pub fn with_results_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.results_dir = path.into();
        self
    }

    /// Builder method to set the number of hypotheses.
    pub fn with_num_hypotheses(mut self, n: usize) -> Self {
        self.num_hypotheses = n;
        self
    }

    /// Builder method to set the number of challenge iterations.
    pub fn with_challenge_iterations(mut self, n: usize) -> Self {
        self.challenge_iterations = n;
        self
    }

    /// Builder method to set the number of solutions in the write-up.
    pub fn with_num_final_proposals(mut self, n: usize) -> Self {
        self.num_final_proposals = n;
        self
    }

    /// Builder method to set the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Builder method to set the unparseable-feasibility policy.
    pub fn with_assume_feasible_when_unparsed(mut self, assume: bool) -> Self {
        self.assume_feasible_when_unparsed = assume;
        self
    }

    /// Builder method to replace the stage configurations.
    pub fn with_stages(mut self, stages: StageConfigs) -> Self {
        self.stages = stages;
        self
    }

    /// Builder method to run every role on one model.
    pub fn with_model_for_all(mut self, model: &str) -> Self {
        self.stages.set_model_for_all(model);
        self
    }
}

/// One [`StageConfig`] per [`AgentRole`].
#[derive(Debug, Clone, PartialEq)]
pub struct StageConfigs {
    configs: [StageConfig; 9],
}

impl Default for StageConfigs {
    fn default() -> Self {
        Self {
            configs: AgentRole::ALL.map(default_stage_config),
        }
    }
}

/// Partial stage settings read from a YAML override file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StageOverride {
    pub name: Option<String>,
    pub system_template: Option<String>,
    pub user_template: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
}

impl StageConfigs {
    /// Configuration of a role.
    pub fn get(&self, role: AgentRole) -> &StageConfig {
        &self.configs[role as usize]
    }

    /// Mutable configuration of a role.
    pub fn get_mut(&mut self, role: AgentRole) -> &mut StageConfig {
        &mut self.configs[role as usize]
    }

    /// Points every role at the same model.
    ///
    /// Useful when the local server keeps a single model loaded.
    pub fn set_model_for_all(&mut self, model: &str) {
        for config in &mut self.configs {
            config.model = model.to_string();
        }
    }

    /// Applies overrides keyed by role name.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownStage` for a key that names no role.
    /// Nothing is applied in that case.
    pub fn apply_overrides(
        &mut self,
        overrides: HashMap<String, StageOverride>,
    ) -> Result<(), ConfigError> {
        let mut resolved = Vec::with_capacity(overrides.len());
        for (key, value) in overrides {
            resolved.push((key.parse::<AgentRole>()?, value));
        }

        for (role, o) in resolved {
            let config = self.get_mut(role);
            if let Some(v) = o.name {
                config.name = v;
            }
            if let Some(v) = o.system_template {
                config.system_template = v;
            }
            if let Some(v) = o.user_template {
                config.user_template = v;
            }
            if let Some(v) = o.model {
                config.model = v;
            }
            if let Some(v) = o.temperature {
                config.temperature = v;
            }
            if let Some(v) = o.max_tokens {
                config.max_tokens = v;
            }
            if let Some(v) = o.top_p {
                config.top_p = v;
            }
        }
        Ok(())
    }

    /// Parses a YAML override document and applies it.
    pub fn apply_yaml(&mut self, yaml: &str) -> Result<(), ConfigError> {
        let overrides: HashMap<String, StageOverride> = serde_yaml::from_str(yaml)?;
        self.apply_overrides(overrides)
    }

    /// Reads a YAML override file and applies it.
    pub fn load_overrides(&mut self, path: &Path) -> Result<(), ConfigError> {
        let yaml = std::fs::read_to_string(path)?;
        self.apply_yaml(&yaml)?;
        tracing::info!(path = %path.display(), "Applied stage overrides");
        Ok(())
    }

    /// Validates every stage configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for role in AgentRole::ALL {
            let config = self.get(role);

            if config.model.trim().is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{role}: model cannot be empty"
                )));
            }

            if !(0.0..=2.0).contains(&config.temperature) {
                return Err(ConfigError::ValidationFailed(format!(
                    "{role}: temperature must be between 0.0 and 2.0"
                )));
            }

            if !(0.0..=1.0).contains(&config.top_p) {
                return Err(ConfigError::ValidationFailed(format!(
                    "{role}: top_p must be between 0.0 and 1.0"
                )));
            }

            if config.max_tokens == 0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "{role}: max_tokens must be greater than 0"
                )));
            }
        }
        Ok(())
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.api_base, "http://127.0.0.1:1234/v1");
        assert_eq!(config.api_key, "lm-studio");
        assert_eq!(config.num_hypotheses, 5);
        assert_eq!(config.challenge_iterations, 3);
        assert_eq!(config.num_final_proposals, 3);
        assert_eq!(config.retry.max_attempts, 10);
        assert_eq!(config.results_dir, PathBuf::from("results"));
        assert!(config.assume_feasible_when_unparsed);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = PipelineConfig::new()
            .with_api_base("http://gpu-box:1234/v1")
            .with_num_hypotheses(2)
            .with_challenge_iterations(1)
            .with_num_final_proposals(1)
            .with_assume_feasible_when_unparsed(false)
            .with_model_for_all("qwen2.5-32b");

        assert_eq!(config.api_base, "http://gpu-box:1234/v1");
        assert_eq!(config.num_hypotheses, 2);
        assert_eq!(config.challenge_iterations, 1);
        assert!(!config.assume_feasible_when_unparsed);
        for role in AgentRole::ALL {
            assert_eq!(config.stages.get(role).model, "qwen2.5-32b");
        }
    }

    #[test]
    fn test_from_lookup() {
        let config = PipelineConfig::from_lookup(lookup_from(&[
            ("DISCOVERY_NUM_HYPOTHESES", "3"),
            ("DISCOVERY_MAX_ATTEMPTS", "4"),
            ("DISCOVERY_REQUEST_TIMEOUT_SECS", "60"),
            ("DISCOVERY_ASSUME_FEASIBLE", "off"),
            ("DISCOVERY_MODEL", "local-model"),
        ]))
        .unwrap();

        assert_eq!(config.num_hypotheses, 3);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.request_timeout, Duration::from_secs(60));
        assert!(!config.assume_feasible_when_unparsed);
        assert_eq!(config.stages.get(AgentRole::Overseer).model, "local-model");
    }

    #[test]
    fn test_from_lookup_invalid_number() {
        let err = PipelineConfig::from_lookup(lookup_from(&[("DISCOVERY_NUM_HYPOTHESES", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("DISCOVERY_NUM_HYPOTHESES"));
    }

    #[test]
    fn test_validation_rejects_zero_hypotheses() {
        let err = PipelineConfig::default()
            .with_num_hypotheses(0)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("num_hypotheses"));
    }

    #[test]
    fn test_validation_rejects_zero_attempts() {
        let config = PipelineConfig::default().with_retry(RetryConfig::default().with_max_attempts(0));
        assert!(config.validate().unwrap_err().to_string().contains("max_attempts"));
    }

    #[test]
    fn test_validation_rejects_bad_stage_parameters() {
        let mut config = PipelineConfig::default();
        config.stages.get_mut(AgentRole::PhysicsOracle).temperature = 3.0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("physics_oracle"));
        assert!(err.to_string().contains("temperature"));

        let mut config = PipelineConfig::default();
        config.stages.get_mut(AgentRole::Overseer).top_p = 1.5;
        assert!(config.validate().unwrap_err().to_string().contains("top_p"));

        let mut config = PipelineConfig::default();
        config.stages.get_mut(AgentRole::FinalEvaluator).max_tokens = 0;
        assert!(config.validate().unwrap_err().to_string().contains("max_tokens"));
    }

    #[test]
    fn test_yaml_overrides_keep_unlisted_roles() {
        let mut stages = StageConfigs::default();
        stages
            .apply_yaml(
                "physics_oracle:\n  model: physics-14b\n  temperature: 0.1\noverseer:\n  max_tokens: 8000\n",
            )
            .unwrap();

        let oracle = stages.get(AgentRole::PhysicsOracle);
        assert_eq!(oracle.model, "physics-14b");
        assert_eq!(oracle.temperature, 0.1);
        assert_eq!(oracle.top_p, 0.85);
        assert_eq!(stages.get(AgentRole::Overseer).max_tokens, 8000);
        assert_eq!(
            stages.get(AgentRole::Orchestrator),
            &default_stage_config(AgentRole::Orchestrator)
        );
    }

    #[test]
    fn test_yaml_unknown_role_rejected() {
        let mut stages = StageConfigs::default();
        let err = stages.apply_yaml("alchemist:\n  model: x\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownStage(ref s) if s == "alchemist"));
        assert_eq!(stages, StageConfigs::default());
    }

    #[test]
    fn test_load_overrides_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("stages.yaml");
        std::fs::write(&path, "chain_assembler:\n  model: llama-70b\n").unwrap();

        let mut stages = StageConfigs::default();
        stages.load_overrides(&path).unwrap();
        assert_eq!(stages.get(AgentRole::ChainAssembler).model, "llama-70b");
    }
}
