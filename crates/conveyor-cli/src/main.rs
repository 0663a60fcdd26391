use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use conveyor_core::queue::{Operation, OperationFuture};
use conveyor_core::telemetry::{EventBatch, Props, TelemetryClient, TelemetrySettings, Transport};
use conveyor_core::{
    BatchItem, BoxError, ConfigUpdate, QueueError, TaskInput, TaskOutcome, TaskOverrides,
    TaskQueue,
};

#[derive(Debug, Clone, Deserialize)]
struct SpecRow {
    sku: String,
    size: String,
    #[serde(default)]
    priority: i32,
}

/// Simulated "save specification" write: random latency, a few forced failures.
struct SpecWriter {
    remaining_failures: Arc<AtomicU32>,
}

impl SpecWriter {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: Arc::new(AtomicU32::new(n)),
        }
    }
}

impl Operation<SpecRow, String> for SpecWriter {
    fn run(&self, input: TaskInput<SpecRow>, cancel: CancellationToken) -> OperationFuture<String> {
        let remaining = Arc::clone(&self.remaining_failures);
        let latency = Duration::from_millis(rand::thread_rng().gen_range(20..120));
        Box::pin(async move {
            tokio::select! {
                _ = cancel.cancelled() => return Err(BoxError::from("write abandoned")),
                _ = sleep(latency) => {}
            }

            let left = remaining.load(Ordering::Relaxed);
            if left > 0 {
                remaining.fetch_sub(1, Ordering::Relaxed);
                return Err(BoxError::from(format!("database busy (left={left})")));
            }
            Ok(format!("{}:{} saved as {}", input.data.sku, input.data.size, input.task_id))
        })
    }
}

/// Writes batches to the log instead of a collector.
struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    async fn send(
        &self,
        endpoint: &str,
        batch: &EventBatch,
        _cancel: CancellationToken,
    ) -> Result<(), BoxError> {
        let body = serde_json::to_string(batch)?;
        tracing::info!(endpoint, events = batch.len(), bytes = body.len(), "telemetry batch sent");
        Ok(())
    }
}

fn load_update() -> Result<ConfigUpdate, BoxError> {
    match std::env::args().nth(1) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&raw)?)
        }
        None => Ok(ConfigUpdate::new()),
    }
}

fn rows() -> Vec<SpecRow> {
    let raw = serde_json::json!([
        { "sku": "tee-01", "size": "S" },
        { "sku": "tee-01", "size": "M" },
        { "sku": "tee-01", "size": "L", "priority": 2 },
        { "sku": "hoodie-07", "size": "M", "priority": 5 },
        { "sku": "hoodie-07", "size": "XL" },
        { "sku": "cap-02", "size": "OS", "priority": 1 },
    ]);
    serde_json::from_value(raw).unwrap_or_default()
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // (A) Specification queue with an optional JSON config override
    let telemetry = TelemetryClient::new(TelemetrySettings::new("conveyor-cli"), LogTransport)?;
    let queue: TaskQueue<String, SpecRow> = TaskQueue::builder()
        .preset(conveyor_core::Preset::Specification)
        .update(load_update()?)
        .on_task_complete(|task, outcome| {
            let label = match outcome {
                TaskOutcome::Success => "ok",
                TaskOutcome::Failed => "failed",
            };
            println!("{} {label} after {} retries", task.id, task.attempts);
        })
        .build()?;

    let _progress = queue.subscribe(|p| {
        println!("progress: {}/{} done, {} running", p.completed + p.failed, p.total, p.running);
    });

    // (B) Ctrl-C stops the run and cancels in-flight writes
    tokio::spawn({
        let queue = queue.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received; stopping queue");
                queue.stop();
            }
        }
    });

    // (C) Submit every row
    let writer: Arc<dyn Operation<SpecRow, String>> = Arc::new(SpecWriter::new(2));
    let items = rows().into_iter().map(|row| {
        let overrides = TaskOverrides::new().with_priority(row.priority);
        BatchItem {
            id: None,
            operation: Arc::clone(&writer),
            payload: row,
            overrides,
        }
    });
    let ids = queue.submit_batch(items);
    println!("submitted {} rows", ids.len());

    // (D) Wait for the run
    let started = tokio::time::Instant::now();
    match queue.start().await {
        Ok(results) => {
            println!(
                "finished: {} ok, {} failed, success rate {}%",
                results.stats.completed, results.stats.failed, results.success_rate
            );
            for task in &results.failed {
                println!("  {} -> {:?}", task.id, task.error);
            }
            telemetry.track_perf(
                "SpecificationSave",
                Props::from_iter([
                    ("total".to_owned(), results.stats.total.into()),
                    ("failed".to_owned(), results.stats.failed.into()),
                ]),
            );
        }
        Err(QueueError::Interrupted) => {
            println!("interrupted: {:?}", queue.stats());
            telemetry.track_error("SpecificationSave", "interrupted", None, false);
        }
        Err(err) => return Err(err.into()),
    }
    telemetry.track_api(
        "/api/specification/save",
        200,
        started.elapsed().as_millis() as u64,
        Props::new(),
    );

    // (E) Ship telemetry and wait for it
    if telemetry.flush()?.is_some() {
        telemetry.queue().start().await?;
    }
    Ok(())
}
