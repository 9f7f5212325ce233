//! Feeds readings into a chain by hand and reports running statistics while it runs.
//!
//! Run with `RUST_LOG=item_streams=debug` to see per-stage lifecycle logs.

use item_streams::{Pipeline, PipelineConfig, PipelineResult, ReduceFn, ReductionStage, Stats};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> PipelineResult<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "item_streams=info,progress_report=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let (source, pipeline) = Pipeline::<f64>::source(PipelineConfig::default());

    let running = ReductionStage::builder()
        .id("running-stats")
        .initial(Stats::default())
        .reducer(ReduceFn::fold(|mut stats: Stats, reading: &f64| {
            stats.push(*reading);
            stats
        }))
        .callback(|stats: Option<Stats>| {
            if let Some(stats) = stats {
                info!(count = stats.count, mean = ?stats.mean(), "Final statistics");
            }
        })
        .build()?;

    let reporter = running
        .progress()
        .report_every(Duration::from_millis(250), |snapshot: Option<Stats>| {
            if let Some(stats) = snapshot {
                info!(count = stats.count, min = ?stats.min, max = ?stats.max, "Progress");
            }
        });

    let chain = pipeline
        .filter(|reading: &f64| reading.is_finite())
        .tap(running)
        .count_with(|n| info!(readings = n, "Readings passed through"));

    let producer = tokio::spawn(async move {
        for i in 0..40u32 {
            let reading = (f64::from(i) * 0.3).sin().abs() * 100.0;
            if source.send(reading).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    });

    chain.run().await?;
    let _ = producer.await;
    let _ = reporter.await;
    Ok(())
}
