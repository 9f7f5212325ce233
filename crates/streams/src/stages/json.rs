//! Built-in registry stages for dynamic `serde_json::Value` items.
//!
//! These are the stages a [`ChainConfig`](crate::config::ChainConfig) can
//! name without any application code:
//!
//! | type      | params            | behaviour                                   |
//! |-----------|-------------------|---------------------------------------------|
//! | `identity`| none              | pass items through                          |
//! | `pluck`   | `pointer`         | map each item to the value at `pointer`     |
//! | `explode` | `pointer`         | emit each element of the array at `pointer` |
//! | `where`   | `pointer`         | keep items whose value at `pointer` is truthy |
//! | `log`     | `level` (opt.)    | log each item, pass it on                   |
//! | `count`   | none              | emit the number of items                    |
//! | `sum`     | none              | emit the sum of numeric items               |
//! | `stats`   | none              | emit running statistics of numeric items    |

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::marker::PhantomData;
use tracing::{debug, info, trace};

use crate::config::StageConfig;
use crate::error::StageError;
use crate::iteration::IterFn;
use crate::reduction::{ReduceFn, ReductionStage, Terminal};
use crate::registry::{StageFactory, StageRegistry};
use crate::stage::{Emitter, Passthrough, Stage};
use crate::stages::{aggregate, transform, Stats, Truthy};

/// Parameters of the pointer-based stages.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct PointerParams {
    /// RFC 6901 JSON pointer into each item, e.g. `/user/name`
    pub pointer: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    #[default]
    Debug,
    Info,
}

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct LogParams {
    #[serde(default)]
    pub level: LogLevel,
}

/// Register all built-in JSON stages with the registry
pub fn register_builtin_stages(registry: &mut StageRegistry<Value, Value>) {
    registry.register("identity", IdentityFactory);
    registry.register("pluck", PointerFactory::Pluck);
    registry.register("explode", PointerFactory::Explode);
    registry.register("where", PointerFactory::Where);
    registry.register("log", LogFactory);
    registry.register("count", AggregateFactory::Count);
    registry.register("sum", AggregateFactory::Sum);
    registry.register("stats", AggregateFactory::Stats);
}

fn parse_params<P: DeserializeOwned>(config: &StageConfig) -> Result<P, StageError> {
    let params = Value::Object(config.params.clone().into_iter().collect());
    serde_json::from_value(params).map_err(|e| {
        StageError::InvalidArgument(format!(
            "stage '{}' ({}): {}",
            config.display_name(),
            config.stage_type,
            e
        ))
    })
}

fn parse_pointer(config: &StageConfig) -> Result<String, StageError> {
    let PointerParams { pointer } = parse_params(config)?;
    if !pointer.is_empty() && !pointer.starts_with('/') {
        return Err(StageError::InvalidArgument(format!(
            "stage '{}': pointer must be empty or start with '/', got '{}'",
            config.display_name(),
            pointer
        )));
    }
    Ok(pointer)
}

fn schema_of<P: JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(P)).unwrap_or(Value::Null)
}

struct IdentityFactory;

impl StageFactory<Value, Value> for IdentityFactory {
    fn create(&self, config: &StageConfig) -> Result<Box<dyn Stage<Value, Value>>, StageError> {
        Ok(Box::new(Passthrough::new(config.display_name())))
    }
}

enum PointerFactory {
    Pluck,
    Explode,
    Where,
}

impl StageFactory<Value, Value> for PointerFactory {
    fn create(&self, config: &StageConfig) -> Result<Box<dyn Stage<Value, Value>>, StageError> {
        let pointer = parse_pointer(config)?;
        let lookup = move |item: &Value| item.pointer(&pointer).cloned().unwrap_or(Value::Null);

        let stage: Box<dyn Stage<Value, Value>> = match self {
            PointerFactory::Pluck => Box::new(transform::map(IterFn::infallible(lookup))),
            PointerFactory::Explode => Box::new(transform::multimap(IterFn::infallible(lookup))),
            PointerFactory::Where => Box::new(transform::filter(IterFn::infallible(
                move |item: &Value| lookup(item).is_truthy(),
            ))),
        };
        Ok(Named::wrap(config, stage))
    }

    fn parameter_schema(&self) -> Value {
        schema_of::<PointerParams>()
    }
}

struct LogFactory;

impl StageFactory<Value, Value> for LogFactory {
    fn create(&self, config: &StageConfig) -> Result<Box<dyn Stage<Value, Value>>, StageError> {
        let LogParams { level } = parse_params(config)?;
        let name = config.display_name().to_string();
        let stage = transform::each(IterFn::infallible(move |item: &Value| match level {
            LogLevel::Trace => trace!(stage = %name, %item, "item"),
            LogLevel::Debug => debug!(stage = %name, %item, "item"),
            LogLevel::Info => info!(stage = %name, %item, "item"),
        }));
        Ok(Named::wrap(config, Box::new(stage)))
    }

    fn parameter_schema(&self) -> Value {
        schema_of::<LogParams>()
    }
}

enum AggregateFactory {
    Count,
    Sum,
    Stats,
}

impl StageFactory<Value, Value> for AggregateFactory {
    fn create(&self, config: &StageConfig) -> Result<Box<dyn Stage<Value, Value>>, StageError> {
        if !config.params.is_empty() {
            return Err(StageError::InvalidArgument(format!(
                "stage '{}' ({}) takes no parameters",
                config.display_name(),
                config.stage_type
            )));
        }

        let stage: Box<dyn Stage<Value, Value>> = match self {
            AggregateFactory::Count => Box::new(JsonOutput::new(aggregate::count::<Value>())),
            AggregateFactory::Sum => Box::new(json_sum()),
            AggregateFactory::Stats => Box::new(JsonOutput::new(json_stats())),
        };
        Ok(Named::wrap(config, stage))
    }
}

/// Sums numeric items, keeping integer precision until a float shows up.
fn json_sum() -> ReductionStage<Value, Value, Terminal> {
    let reducer = ReduceFn::sync(|total: Option<Value>, item: &Value| {
        let total = total.unwrap_or_else(|| Value::from(0));
        match (&total, item) {
            (Value::Number(a), Value::Number(b)) => add_numbers(a, b)
                .map(Value::Number)
                .ok_or_else(|| anyhow::anyhow!("sum of {a} and {b} is not a finite number")),
            (_, other) => Err(anyhow::anyhow!("sum expects numeric items, got {other}")),
        }
    });
    ReductionStage::from_parts("sum", reducer, Some(Value::from(0)), Terminal)
}

fn add_numbers(a: &Number, b: &Number) -> Option<Number> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Some(sum.into());
        }
    }
    Number::from_f64(a.as_f64()? + b.as_f64()?)
}

fn json_stats() -> ReductionStage<Value, Stats, Terminal> {
    let reducer = ReduceFn::sync(|stats: Option<Stats>, item: &Value| {
        let value = item
            .as_f64()
            .ok_or_else(|| anyhow::anyhow!("stats expects numeric items, got {item}"))?;
        let mut stats = stats.unwrap_or_default();
        stats.push(value);
        Ok(stats)
    });
    ReductionStage::from_parts("stats", reducer, Some(Stats::default()), Terminal)
}

/// Adapts a stage with a typed output into one emitting JSON values.
struct JsonOutput<S, A> {
    inner: S,
    buffer: Emitter<A>,
    _marker: PhantomData<fn() -> A>,
}

impl<S, A> JsonOutput<S, A> {
    fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: Emitter::new(),
            _marker: PhantomData,
        }
    }

    fn convert(&mut self, out: &mut Emitter<Value>, id: &str) -> Result<(), StageError>
    where
        A: Serialize,
    {
        for item in self.buffer.drain() {
            let value = serde_json::to_value(item)
                .map_err(|e| StageError::processing(id, anyhow::Error::new(e)))?;
            out.push(value);
        }
        Ok(())
    }
}

#[async_trait]
impl<S, A> Stage<Value, Value> for JsonOutput<S, A>
where
    S: Stage<Value, A>,
    A: Serialize + Send + 'static,
{
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn process(&mut self, item: Value, out: &mut Emitter<Value>) -> Result<(), StageError> {
        self.inner.process(item, &mut self.buffer).await?;
        let id = self.inner.id().to_string();
        self.convert(out, &id)
    }

    async fn flush(&mut self, out: &mut Emitter<Value>) -> Result<(), StageError> {
        self.inner.flush(&mut self.buffer).await?;
        let id = self.inner.id().to_string();
        self.convert(out, &id)
    }
}

/// Reports a configured stage under its configured name.
struct Named {
    name: String,
    inner: Box<dyn Stage<Value, Value>>,
}

impl Named {
    fn wrap(config: &StageConfig, inner: Box<dyn Stage<Value, Value>>) -> Box<dyn Stage<Value, Value>> {
        if config.name.is_empty() {
            inner
        } else {
            Box::new(Named {
                name: config.name.clone(),
                inner,
            })
        }
    }
}

#[async_trait]
impl Stage<Value, Value> for Named {
    fn id(&self) -> &str {
        &self.name
    }

    async fn process(&mut self, item: Value, out: &mut Emitter<Value>) -> Result<(), StageError> {
        self.inner
            .process(item, out)
            .await
            .map_err(|e| e.with_stage(&self.name))
    }

    async fn flush(&mut self, out: &mut Emitter<Value>) -> Result<(), StageError> {
        self.inner.flush(out).await.map_err(|e| e.with_stage(&self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> StageRegistry<Value, Value> {
        let mut registry = StageRegistry::new();
        register_builtin_stages(&mut registry);
        registry
    }

    async fn run(config: StageConfig, items: Vec<Value>) -> Vec<Value> {
        let mut stage = registry().create_stage(&config).unwrap();
        let mut out = Emitter::new();
        for item in items {
            stage.process(item, &mut out).await.unwrap();
        }
        stage.flush(&mut out).await.unwrap();
        out.drain().collect()
    }

    #[test]
    fn test_builtin_stage_types() {
        assert_eq!(
            registry().stage_types(),
            vec!["count", "explode", "identity", "log", "pluck", "stats", "sum", "where"]
        );
    }

    #[test]
    fn test_pointer_is_required() {
        let err = registry().create_stage(&StageConfig::new("pluck")).err().unwrap();
        assert!(matches!(err, StageError::InvalidArgument(_)));

        let config = StageConfig::new("where").with_param("pointer", "active");
        let err = registry().create_stage(&config).err().unwrap();
        assert!(err.to_string().contains("must be empty or start with '/'"));
    }

    #[test]
    fn test_aggregates_reject_params() {
        let config = StageConfig::new("count").with_param("initial", 5);
        assert!(registry().create_stage(&config).is_err());
    }

    #[test]
    fn test_parameter_schema() {
        let schema = registry().parameter_schema("pluck").unwrap();
        assert!(schema["properties"]["pointer"].is_object());
        assert_eq!(registry().parameter_schema("identity"), Some(json!({})));
    }

    #[tokio::test]
    async fn test_pluck_and_where() {
        let items = vec![
            json!({"name": "ada", "active": true}),
            json!({"name": "bob", "active": false}),
            json!({"name": "cy"}),
        ];
        let names = run(StageConfig::new("pluck").with_param("pointer", "/name"), items.clone()).await;
        assert_eq!(names, vec![json!("ada"), json!("bob"), json!("cy")]);

        let active = run(StageConfig::new("where").with_param("pointer", "/active"), items).await;
        assert_eq!(active, vec![json!({"name": "ada", "active": true})]);
    }

    #[tokio::test]
    async fn test_explode() {
        let items = vec![json!({"tags": ["a", "b"]}), json!({"tags": "c"}), json!({})];
        let tags = run(StageConfig::new("explode").with_param("pointer", "/tags"), items).await;
        assert_eq!(tags, vec![json!("a"), json!("b")]);
    }

    #[tokio::test]
    async fn test_numeric_aggregates() {
        let items = vec![json!(3), json!(1), json!(2)];
        assert_eq!(run(StageConfig::new("count"), items.clone()).await, vec![json!(3)]);
        assert_eq!(run(StageConfig::new("sum"), items.clone()).await, vec![json!(6)]);

        let stats = run(StageConfig::new("stats"), items).await;
        assert_eq!(stats[0]["count"], json!(3));
        assert_eq!(stats[0]["min"], json!(1.0));
        assert_eq!(stats[0]["max"], json!(3.0));
    }

    #[tokio::test]
    async fn test_sum_mixes_integers_and_floats() {
        let items = vec![json!(1), json!(0.5), json!(2)];
        assert_eq!(run(StageConfig::new("sum"), items).await, vec![json!(3.5)]);
    }

    #[tokio::test]
    async fn test_sum_rejects_non_numbers() {
        let mut stage = registry().create_stage(&StageConfig::new("sum").with_name("total")).unwrap();
        let mut out = Emitter::new();
        let err = stage.process(json!("x"), &mut out).await.unwrap_err();
        assert!(matches!(err, StageError::Processing { ref stage, .. } if stage == "total"));
        assert_eq!(stage.id(), "total");
    }
}
