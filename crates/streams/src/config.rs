//! Pipeline configuration types and serialization

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::error::{PipelineError, PipelineResult};
use crate::split::SplitMode;

/// In-flight buffer between two connected stages.
pub const DEFAULT_BUFFER_CAPACITY: usize = 16;

/// Stage parameters as a flexible key-value map
pub type StageParams = HashMap<String, serde_json::Value>;

/// Runtime settings shared by every stage of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of items that may wait between two stages
    pub buffer_capacity: usize,
    /// Backpressure coupling used by `split` when no mode is given
    pub split_mode: SplitMode,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            split_mode: SplitMode::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> PipelineResult<()> {
        if self.buffer_capacity == 0 {
            return Err(PipelineError::InvalidConfiguration {
                message: "buffer_capacity must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Individual stage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Stage name within the chain; defaults to the stage type
    #[serde(default)]
    pub name: String,
    /// Registered stage type identifier
    #[serde(rename = "type")]
    pub stage_type: String,
    /// Stage parameters
    #[serde(default)]
    pub params: StageParams,
}

impl StageConfig {
    pub fn new(stage_type: &str) -> Self {
        Self {
            name: String::new(),
            stage_type: stage_type.to_string(),
            params: StageParams::new(),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_param(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// The name used for logging and error reporting.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.stage_type
        } else {
            &self.name
        }
    }
}

/// A linear chain of registered stages, applied in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainConfig {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    pub stages: Vec<StageConfig>,
}

impl ChainConfig {
    pub fn from_json_str(s: &str) -> PipelineResult<Self> {
        let config: ChainConfig = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(s: &str) -> PipelineResult<Self> {
        let config: ChainConfig = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a chain from a `.json`, `.yaml` or `.yml` file.
    pub fn load(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&contents),
            _ => Self::from_json_str(&contents),
        }
    }

    pub fn validate(&self) -> PipelineResult<()> {
        self.pipeline.validate()?;

        let mut names = HashSet::new();
        for stage in &self.stages {
            if stage.stage_type.is_empty() {
                return Err(PipelineError::InvalidConfiguration {
                    message: format!("Stage '{}' has no type", stage.name),
                });
            }
            if !stage.name.is_empty() && !names.insert(stage.name.as_str()) {
                return Err(PipelineError::InvalidConfiguration {
                    message: format!("Stage name '{}' already exists", stage.name),
                });
            }
        }
        Ok(())
    }
}
