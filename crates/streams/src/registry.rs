//! Stage registry for creating pipeline stages by name.
//!
//! A registry is an ordinary value: build one per application (or per test),
//! register factories under names, then apply configured stages to a chain
//! with [`Pipeline::apply`] or [`StageRegistry::build_chain`].

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::config::{ChainConfig, StageConfig};
use crate::error::{PipelineResult, StageError};
use crate::pipeline::Pipeline;
use crate::stage::Stage;

/// A factory for creating instances of a specific stage type.
pub trait StageFactory<I: Send + 'static, O: Send + 'static>: Send + Sync {
    /// Creates a new stage instance from a config. Missing or invalid
    /// parameters fail with [`StageError::InvalidArgument`].
    fn create(&self, config: &StageConfig) -> Result<Box<dyn Stage<I, O>>, StageError>;

    /// JSON schema of the accepted parameters.
    fn parameter_schema(&self) -> serde_json::Value {
        serde_json::json!({})
    }
}

impl<I, O, F> StageFactory<I, O> for F
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(&StageConfig) -> Result<Box<dyn Stage<I, O>>, StageError> + Send + Sync,
{
    fn create(&self, config: &StageConfig) -> Result<Box<dyn Stage<I, O>>, StageError> {
        self(config)
    }
}

/// A registry for stage factories.
pub struct StageRegistry<I: Send + 'static, O: Send + 'static> {
    factories: HashMap<String, Arc<dyn StageFactory<I, O>>>,
}

impl<I: Send + 'static, O: Send + 'static> Default for StageRegistry<I, O> {
    fn default() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }
}

impl<I: Send + 'static, O: Send + 'static> StageRegistry<I, O> {
    /// Creates a new, empty stage registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a stage factory. An existing entry of the same name is replaced.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: StageFactory<I, O> + 'static,
    {
        if self
            .factories
            .insert(name.to_string(), Arc::new(factory))
            .is_some()
        {
            debug!(stage_type = name, "Replaced registered stage factory");
        }
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.factories.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Get all registered stage types, sorted.
    pub fn stage_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn parameter_schema(&self, stage_type: &str) -> Option<serde_json::Value> {
        self.factories.get(stage_type).map(|f| f.parameter_schema())
    }

    /// Creates a new stage instance from a config.
    pub fn create_stage(&self, config: &StageConfig) -> Result<Box<dyn Stage<I, O>>, StageError> {
        self.factories
            .get(&config.stage_type)
            .ok_or_else(|| StageError::NotFound(config.stage_type.clone()))?
            .create(config)
    }
}

impl<T: Send + 'static> StageRegistry<T, T> {
    /// Apply every stage of `chain` to `pipeline`, in order, under the
    /// chain's [`PipelineConfig`].
    ///
    /// All stages are created before any is connected, so a bad config fails
    /// before items start flowing through the new stages.
    pub fn build_chain(&self, pipeline: Pipeline<T>, chain: &ChainConfig) -> PipelineResult<Pipeline<T>> {
        chain.validate()?;
        let stages = chain
            .stages
            .iter()
            .map(|config| self.create_stage(config))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(stages
            .into_iter()
            .fold(pipeline.with_config(chain.pipeline), |pipeline, stage| {
                pipeline.connect(stage)
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iteration::IterFn;
    use crate::stage::Passthrough;
    use crate::stages;

    fn doubler(config: &StageConfig) -> Result<Box<dyn Stage<i64, i64>>, StageError> {
        let factor = config
            .params
            .get("factor")
            .map(|v| {
                v.as_i64()
                    .ok_or_else(|| StageError::InvalidArgument("factor must be an integer".into()))
            })
            .transpose()?
            .unwrap_or(2);
        Ok(Box::new(stages::map(IterFn::infallible(move |x: &i64| x * factor))))
    }

    #[test]
    fn test_stage_registry() {
        let registry = StageRegistry::<i64, i64>::new();
        assert_eq!(registry.stage_types().len(), 0);
    }

    #[test]
    fn test_register_and_unregister() {
        let mut registry = StageRegistry::<i64, i64>::new();
        registry.register("scale", doubler);
        registry.register(
            "identity",
            |_: &StageConfig| -> Result<Box<dyn Stage<i64, i64>>, StageError> {
                Ok(Box::new(Passthrough::new("identity")))
            },
        );
        assert_eq!(registry.stage_types(), vec!["identity", "scale"]);

        assert!(registry.unregister("scale"));
        assert!(!registry.contains("scale"));
        assert!(!registry.unregister("scale"));
    }

    #[test]
    fn test_unknown_stage_type() {
        let registry = StageRegistry::<i64, i64>::new();
        let result = registry.create_stage(&StageConfig::new("missing"));
        assert!(matches!(result, Err(StageError::NotFound(name)) if name == "missing"));
    }

    #[test]
    fn test_bad_params_fail_at_construction() {
        let mut registry = StageRegistry::<i64, i64>::new();
        registry.register("scale", doubler);
        let config = StageConfig::new("scale").with_param("factor", "three");
        assert!(matches!(
            registry.create_stage(&config),
            Err(StageError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let mut registry = StageRegistry::<i64, i64>::new();
        registry.register("op", doubler);
        registry.register(
            "op",
            |_: &StageConfig| -> Result<Box<dyn Stage<i64, i64>>, StageError> {
                Ok(Box::new(stages::map(IterFn::infallible(|x: &i64| -x))))
            },
        );

        let out = Pipeline::from_iter(vec![1, 2])
            .apply(&registry, &StageConfig::new("op"))
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(out, vec![-1, -2]);
    }

    #[tokio::test]
    async fn test_build_chain_applies_in_order() {
        let mut registry = StageRegistry::<i64, i64>::new();
        registry.register("scale", doubler);

        let chain = ChainConfig::from_json_str(
            r#"{ "stages": [ { "type": "scale", "params": { "factor": 3 } }, { "type": "scale" } ] }"#,
        )
        .unwrap();
        let out = registry
            .build_chain(Pipeline::from_iter(vec![1, 5]), &chain)
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(out, vec![6, 30]);
    }

    #[tokio::test]
    async fn test_build_chain_uses_configured_pipeline_settings() {
        let mut registry = StageRegistry::<i64, i64>::new();
        registry.register("scale", doubler);

        let chain = ChainConfig::from_yaml_str(
            "pipeline:\n  buffer_capacity: 1\n  split_mode: buffer_all\nstages:\n  - type: scale\n",
        )
        .unwrap();
        let pipeline = registry
            .build_chain(Pipeline::from_iter(vec![1, 2, 3]), &chain)
            .unwrap();

        assert_eq!(pipeline.config().buffer_capacity, 1);
        assert_eq!(pipeline.config().split_mode, crate::split::SplitMode::BufferAll);
        assert_eq!(pipeline.collect().await.unwrap(), vec![2, 4, 6]);
    }
}
