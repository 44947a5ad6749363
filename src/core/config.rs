//! Engine configuration, loaded from `<root>/keelson.toml`.
//!
//! A missing file means defaults. Every value here is a tunable default rather
//! than a hard requirement: the drift threshold and iteration cap were chosen
//! empirically.

use crate::core::error::KeelsonError;
use crate::core::schemas;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub drift: DriftConfig,
    pub remediation: RemediationConfig,
    pub versioning: VersioningConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    /// String leaves at or below this similarity are classified `shifted`.
    pub threshold: f64,
    /// Top-level sections whose changes count as drift.
    pub monitored_sections: Vec<String>,
    /// Field whose change is always reported, monitored or not.
    pub context_phase_field: String,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            threshold: 0.3,
            monitored_sections: vec![
                "interaction_preferences".to_string(),
                "formatting_rules".to_string(),
                "meta_enforcement".to_string(),
            ],
            context_phase_field: "session_context.phase".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemediationConfig {
    pub max_iterations: u32,
    /// Apply proposals without a caller decision unless the document says otherwise.
    pub auto_confirm: bool,
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            auto_confirm: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VersioningConfig {
    pub minor_step: u32,
}

impl Default for VersioningConfig {
    fn default() -> Self {
        Self { minor_step: 1 }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), KeelsonError> {
        if !(0.0..=1.0).contains(&self.drift.threshold) {
            return Err(KeelsonError::ConfigError(format!(
                "drift.threshold must be within [0, 1], got {}",
                self.drift.threshold
            )));
        }
        if self.versioning.minor_step == 0 {
            return Err(KeelsonError::ConfigError(
                "versioning.minor_step must be at least 1".to_string(),
            ));
        }
        if self.drift.monitored_sections.iter().any(|s| s.contains('.')) {
            return Err(KeelsonError::ConfigError(
                "drift.monitored_sections must name top-level sections".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn parse_config(content: &str) -> Result<EngineConfig, KeelsonError> {
    let config: EngineConfig =
        toml::from_str(content).map_err(|e| KeelsonError::ConfigError(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// Load `keelson.toml` from the store root. No config is not an error.
pub fn load_config(root: &Path) -> Result<EngineConfig, KeelsonError> {
    let config_path = root.join(schemas::KEELSON_CONFIG_NAME);
    if !config_path.exists() {
        return Ok(EngineConfig::default());
    }
    let content = fs::read_to_string(&config_path).map_err(KeelsonError::IoError)?;
    parse_config(&content)
}
