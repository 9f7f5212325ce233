//! Chains assembled from serialized configuration over JSON items.

use item_streams::{
    register_builtin_stages, ChainConfig, Pipeline, PipelineError, StageConfig, StageError,
    StageRegistry,
};
use serde_json::{json, Value};

fn registry() -> StageRegistry<Value, Value> {
    let mut registry = StageRegistry::new();
    register_builtin_stages(&mut registry);
    registry
}

fn orders() -> Vec<Value> {
    vec![
        json!({"id": 1, "paid": true, "lines": [{"qty": 2}, {"qty": 1}]}),
        json!({"id": 2, "paid": false, "lines": [{"qty": 5}]}),
        json!({"id": 3, "paid": true, "lines": [{"qty": 4}]}),
    ]
}

async fn run_chain(chain: &ChainConfig, items: Vec<Value>) -> Result<Vec<Value>, PipelineError> {
    registry().build_chain(Pipeline::from_iter(items), chain)?.collect().await
}

#[tokio::test]
async fn yaml_chain_filters_explodes_and_sums() {
    let chain = ChainConfig::from_yaml_str(
        r#"
pipeline:
  buffer_capacity: 4
stages:
  - type: where
    params:
      pointer: /paid
  - type: explode
    params:
      pointer: /lines
  - type: pluck
    params:
      pointer: /qty
  - name: total
    type: sum
"#,
    )
    .unwrap();
    assert_eq!(chain.pipeline.buffer_capacity, 4);

    let built = registry().build_chain(Pipeline::from_iter(orders()), &chain).unwrap();
    assert_eq!(built.config().buffer_capacity, 4);

    let out = run_chain(&chain, orders()).await.unwrap();
    assert_eq!(out, vec![json!(7)]);
}

#[tokio::test]
async fn json_chain_reports_stats() {
    let chain = ChainConfig::from_json_str(
        r#"{
            "stages": [
                {"type": "pluck", "params": {"pointer": "/id"}},
                {"type": "log", "params": {"level": "trace"}},
                {"type": "stats"}
            ]
        }"#,
    )
    .unwrap();

    let out = run_chain(&chain, orders()).await.unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0]["count"], json!(3));
    assert_eq!(out[0]["sum"], json!(6.0));
    assert_eq!(out[0]["min"], json!(1.0));
    assert_eq!(out[0]["max"], json!(3.0));
}

#[tokio::test]
async fn unknown_stage_type_fails_before_anything_runs() {
    let chain = ChainConfig::from_json_str(
        r#"{"stages": [{"type": "identity"}, {"type": "shuffle"}]}"#,
    )
    .unwrap();

    let source = Pipeline::from_iter(orders());
    match registry().build_chain(source, &chain) {
        Err(PipelineError::Stage(StageError::NotFound(name))) => assert_eq!(name, "shuffle"),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("chain with an unknown stage type was built"),
    }
}

#[test]
fn invalid_configurations_are_rejected() {
    let duplicate = r#"{"stages": [
        {"name": "a", "type": "identity"},
        {"name": "a", "type": "count"}
    ]}"#;
    assert!(matches!(
        ChainConfig::from_json_str(duplicate),
        Err(PipelineError::InvalidConfiguration { .. })
    ));

    let zero_buffer = "pipeline:\n  buffer_capacity: 0\nstages: []\n";
    assert!(matches!(
        ChainConfig::from_yaml_str(zero_buffer),
        Err(PipelineError::InvalidConfiguration { .. })
    ));

    assert!(matches!(
        ChainConfig::from_json_str("{\"stages\": 3}"),
        Err(PipelineError::SerializationError(_))
    ));
}

#[tokio::test]
async fn runtime_failure_surfaces_through_collect() {
    let chain = ChainConfig {
        pipeline: Default::default(),
        stages: vec![
            StageConfig::new("pluck").with_param("pointer", "/paid"),
            StageConfig::new("sum").with_name("paid_total"),
        ],
    };

    let err = run_chain(&chain, orders()).await.unwrap_err();
    match err {
        PipelineError::Stage(StageError::Processing { stage, .. }) => assert_eq!(stage, "paid_total"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn chain_loads_from_file() {
    let path = std::env::temp_dir().join(format!("item-streams-{}.yml", std::process::id()));
    std::fs::write(&path, "stages:\n  - type: count\n").unwrap();
    let chain = ChainConfig::load(&path);
    std::fs::remove_file(&path).unwrap();

    let out = run_chain(&chain.unwrap(), orders()).await.unwrap();
    assert_eq!(out, vec![json!(3)]);
}
