//! Engine configuration with file, environment variable and runtime-patch support.

use crate::error::{EngineError, EngineResult};
use crate::types::{ComplexityLevel, SubsystemKind};
use anyhow::{Context as _, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::time::Duration;

/// Logging configuration, applied once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub enable_target: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            enable_target: false,
        }
    }
}

/// Cycle scheduling, timeouts and adaptive scaling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    pub call_timeout_ms: u64,
    pub cycle_timeout_ms: u64,
    pub max_concurrent_cycles: usize,
    pub max_query_chars: usize,
    pub auto_scaling: bool,
    pub default_level: ComplexityLevel,
    pub performance_threshold: f64,
    pub min_samples: usize,
    pub recent_window: usize,
    pub enabled_subsystems: Vec<SubsystemKind>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 5_000,
            cycle_timeout_ms: 30_000,
            max_concurrent_cycles: 4,
            max_query_chars: 20_000,
            auto_scaling: true,
            default_level: ComplexityLevel::Cell,
            performance_threshold: 0.85,
            min_samples: 5,
            recent_window: 20,
            enabled_subsystems: SubsystemKind::ALL.to_vec(),
        }
    }
}

impl OrchestratorConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_millis(self.cycle_timeout_ms)
    }
}

/// How many structured-tool stages run per level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolSelection {
    /// Stage count follows the complexity level.
    Auto,
    /// Always run every stage.
    Full,
    /// Only understand and extract.
    Minimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolsConfig {
    pub selection: ToolSelection,
    pub verification_enabled: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            selection: ToolSelection::Auto,
            verification_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SymbolicConfig {
    pub abstraction_depth: usize,
}

impl Default for SymbolicConfig {
    fn default() -> Self {
        Self { abstraction_depth: 3 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FieldConfig {
    pub decay_rate: f64,
    pub boundary_permeability: f64,
    pub attractor_threshold: f64,
    pub max_attractors: usize,
    /// Token similarity at or above which an injection reinforces an existing pattern.
    pub merge_similarity: f64,
    /// Patterns weaker than this are pruned after decay.
    pub prune_floor: f64,
}

impl Default for FieldConfig {
    fn default() -> Self {
        Self {
            decay_rate: 0.05,
            boundary_permeability: 0.8,
            attractor_threshold: 0.7,
            max_attractors: 10,
            merge_similarity: 0.6,
            prune_floor: 0.01,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryConfig {
    /// Total estimated tokens the store may hold after consolidation.
    pub budget_tokens: usize,
    /// Reasoning value above which a record is never evicted.
    pub high_water_mark: f64,
    /// Consolidate automatically after this many stores.
    pub consolidation_frequency: usize,
    pub max_results: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            budget_tokens: 1_000,
            high_water_mark: 0.8,
            consolidation_frequency: 5,
            max_results: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InterpretationConfig {
    /// Normalized entropy above which the ambiguity penalty applies.
    pub high_entropy_threshold: f64,
    /// Strength of the ambiguity penalty in `[0, 1]`.
    pub ambiguity_weight: f64,
    /// Candidates below this likelihood are dropped before collapse.
    pub min_likelihood: f64,
}

impl Default for InterpretationConfig {
    fn default() -> Self {
        Self {
            high_entropy_threshold: 0.7,
            ambiguity_weight: 0.5,
            min_likelihood: 0.05,
        }
    }
}

/// Main settings structure with all configuration sections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub logging: LoggingConfig,
    pub orchestrator: OrchestratorConfig,
    pub tools: ToolsConfig,
    pub symbolic: SymbolicConfig,
    pub field: FieldConfig,
    pub memory: MemoryConfig,
    pub interpretation: InterpretationConfig,
}

impl Settings {
    /// Load settings from `contextual.{toml,yaml,json}` and `CTX__` environment variables.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Like [`Settings::load`], reading an explicit file instead of the default name.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let defaults =
            Config::try_from(&Settings::default()).context("Failed to serialize defaults")?;

        let mut builder = Config::builder().add_source(defaults);
        builder = match path {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name("contextual").required(false)),
        };

        let config = builder
            // e.g. CTX__FIELD__DECAY_RATE=0.1
            .add_source(
                Environment::with_prefix("CTX")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("orchestrator.enabled_subsystems")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let settings: Settings = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings for consistency.
    pub fn validate(&self) -> EngineResult<()> {
        fn unit(name: &str, value: f64) -> EngineResult<()> {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(EngineError::Configuration(format!(
                    "{name} must be within [0, 1], got {value}"
                )))
            }
        }
        fn positive(name: &str, value: u64) -> EngineResult<()> {
            if value == 0 {
                Err(EngineError::Configuration(format!("{name} cannot be 0")))
            } else {
                Ok(())
            }
        }

        let orch = &self.orchestrator;
        positive("orchestrator.call_timeout_ms", orch.call_timeout_ms)?;
        positive("orchestrator.cycle_timeout_ms", orch.cycle_timeout_ms)?;
        positive("orchestrator.max_concurrent_cycles", orch.max_concurrent_cycles as u64)?;
        positive("orchestrator.max_query_chars", orch.max_query_chars as u64)?;
        positive("orchestrator.recent_window", orch.recent_window as u64)?;
        unit("orchestrator.performance_threshold", orch.performance_threshold)?;

        positive("symbolic.abstraction_depth", self.symbolic.abstraction_depth as u64)?;

        let field = &self.field;
        unit("field.decay_rate", field.decay_rate)?;
        unit("field.boundary_permeability", field.boundary_permeability)?;
        unit("field.attractor_threshold", field.attractor_threshold)?;
        unit("field.merge_similarity", field.merge_similarity)?;
        unit("field.prune_floor", field.prune_floor)?;
        positive("field.max_attractors", field.max_attractors as u64)?;
        if field.prune_floor >= field.attractor_threshold {
            return Err(EngineError::Configuration(
                "field.prune_floor must be below field.attractor_threshold".to_string(),
            ));
        }

        positive("memory.budget_tokens", self.memory.budget_tokens as u64)?;
        positive("memory.max_results", self.memory.max_results as u64)?;
        unit("memory.high_water_mark", self.memory.high_water_mark)?;

        let interp = &self.interpretation;
        unit("interpretation.high_entropy_threshold", interp.high_entropy_threshold)?;
        unit("interpretation.ambiguity_weight", interp.ambiguity_weight)?;
        unit("interpretation.min_likelihood", interp.min_likelihood)?;

        Ok(())
    }

    pub fn is_subsystem_enabled(&self, kind: SubsystemKind) -> bool {
        self.orchestrator.enabled_subsystems.contains(&kind)
    }

    /// Returns a copy of these settings with `patch` deep-merged in and validated.
    ///
    /// Logging is fixed at startup, so a patch touching it is rejected.
    pub fn patched(&self, patch: &Map<String, Value>) -> EngineResult<Settings> {
        if patch.contains_key("logging") {
            return Err(EngineError::Configuration(
                "logging settings only apply at startup".to_string(),
            ));
        }

        let mut current = serde_json::to_value(self)
            .map_err(|e| EngineError::Configuration(e.to_string()))?;
        merge(&mut current, &Value::Object(patch.clone()));

        let updated: Settings = serde_json::from_value(current)
            .map_err(|e| EngineError::Configuration(e.to_string()))?;
        updated.validate()?;
        Ok(updated)
    }
}

fn merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge(existing, value)
                    }
                    _ => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn patch(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert!(SubsystemKind::ALL.iter().all(|k| settings.is_subsystem_enabled(*k)));
    }

    #[test]
    fn patch_merges_nested_sections() {
        let settings = Settings::default();
        let updated = settings
            .patched(&patch(json!({"field": {"decay_rate": 0.2}, "tools": {"selection": "full"}})))
            .unwrap();
        assert_eq!(updated.field.decay_rate, 0.2);
        assert_eq!(updated.field.attractor_threshold, settings.field.attractor_threshold);
        assert_eq!(updated.tools.selection, ToolSelection::Full);
    }

    #[test]
    fn patch_rejects_unknown_and_invalid_values() {
        let settings = Settings::default();
        for bad in [
            json!({"field": {"decay_rate": 1.5}}),
            json!({"field": {"warp_factor": 9}}),
            json!({"memory": {"budget_tokens": 0}}),
            json!({"tools": {"selection": "random"}}),
            json!({"logging": {"level": "debug"}}),
            json!({"nonsense": true}),
        ] {
            let err = settings.patched(&patch(bad.clone())).unwrap_err();
            assert!(matches!(err, EngineError::Configuration(_)), "{bad} -> {err:?}");
        }
    }

    #[test]
    fn load_from_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[memory]\nbudget_tokens = 250\n\n[orchestrator]\ndefault_level = \"organ\"\n"
        )
        .unwrap();

        let settings = Settings::load_from(Some(file.path())).unwrap();
        assert_eq!(settings.memory.budget_tokens, 250);
        assert_eq!(settings.orchestrator.default_level, ComplexityLevel::Organ);
        assert_eq!(settings.field.decay_rate, FieldConfig::default().decay_rate);
    }
}
