//! Workflow walkthrough
//!
//! This example demonstrates how to:
//! 1. Register tasks and build signatures
//! 2. Compose them into chains, groups and chords
//! 3. Fan work out with map, starmap and chunks
//! 4. Wait on the results
//!
//! Everything runs in-process on the memory broker and backend, with a worker
//! on a background task. Each step is logged and written, with its result, to
//! a Markdown document. To run this example:
//!     cargo run --example synopsis -- [output.md]
//!
//! The document goes to `synopsis.md` when no path is given.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use task_canvas::{
    args, AppConfig, Dispatcher, Group, MemoryBackend, MemoryBroker, ResultHandle, TaskError,
    TaskRegistry, TaskResult, Worker, WorkerConfig,
};
use tracing::{info, Level};

const TIMEOUT: Option<Duration> = Some(Duration::from_secs(10));
const DEFAULT_OUTPUT: &str = "synopsis.md";

/// Narrated walkthrough rendered as Markdown
struct Synopsis {
    doc: String,
}

impl Synopsis {
    fn new(title: &str) -> Self {
        Self {
            doc: format!("# {}\n", title),
        }
    }

    /// Log a step and append it as a section with its code and outcome
    fn step(&mut self, title: &str, text: &str, code: &str, outcome: impl Serialize) -> TaskResult<()> {
        let outcome = serde_json::to_string(&outcome)?;
        info!("{} -> {}", title, outcome);
        let _ = write!(
            self.doc,
            "\n## {}\n\n{}\n\n```rust\n{}\n```\n\nResult: `{}`\n",
            title, text, code, outcome
        );
        Ok(())
    }

    async fn save(&self, path: &str) -> std::io::Result<()> {
        tokio::fs::write(path, &self.doc).await
    }
}

#[tokio::main]
async fn main() -> Result<(), TaskError> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    let output = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_OUTPUT.to_string());

    let mut registry = TaskRegistry::new();
    let add = registry.register_fn("add", |(a, b): (i64, i64)| async move { Ok(a + b) })?;
    let mul = registry.register_fn("mul", |(a, b): (i64, i64)| async move { Ok(a * b) })?;
    let xsum = registry.register_fn("xsum", |(numbers,): (Vec<i64>,)| async move {
        Ok(numbers.iter().sum::<i64>())
    })?;
    let registry = Arc::new(registry);

    let dispatcher = Dispatcher::new(
        AppConfig::default(),
        Arc::new(MemoryBroker::new()),
        Arc::new(MemoryBackend::new()),
    )
    .with_registry(registry.clone());

    let worker = Arc::new(Worker::new(
        WorkerConfig {
            max_concurrent_tasks: 8,
            polling_interval_ms: 50,
            scheduler_interval_ms: 50,
            shutdown_grace_period: 1,
            ..Default::default()
        },
        registry.clone(),
        dispatcher.clone(),
    ));
    let worker_task = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.start().await })
    };

    let mut synopsis = Synopsis::new("Task canvas synopsis");

    synopsis.step(
        "Direct call",
        "Calling a task directly runs it in this process, without a worker.",
        "add.call(args![1, 1])",
        add.call(args![1, 1]).await?,
    )?;

    let result = add.s(args![2, 2]).delay(&dispatcher, vec![]).await?;
    synopsis.step(
        "Single invocation",
        "`delay` publishes one message; the returned handle waits on the backend.",
        "add.s(args![2, 2]).delay(&dispatcher, vec![])",
        result.get(TIMEOUT).await?,
    )?;

    let partial = add.s(args![2]);
    let result = partial.delay(&dispatcher, args![8]).await?;
    synopsis.step(
        "Partial signature",
        "Arguments given at call time go before the bound ones.",
        "add.s(args![2]).delay(&dispatcher, args![8])",
        result.get(TIMEOUT).await?,
    )?;

    let chain = add.s(args![4, 4]).then(mul.s(args![8])).then(mul.s(args![10]));
    synopsis.step(
        "Chain",
        "Each result is prepended to the arguments of the next step.",
        "add.s(args![4, 4]).then(mul.s(args![8])).then(mul.s(args![10]))",
        dispatcher.apply_and_wait(&chain, TIMEOUT).await?,
    )?;

    let group: Group = (0..10).map(|i| add.s(args![i, i])).collect();
    synopsis.step(
        "Group",
        "Members run in parallel; results come back in member order.",
        "(0..10).map(|i| add.s(args![i, i])).collect::<Group>()",
        dispatcher.apply_and_wait(&group, TIMEOUT).await?,
    )?;

    let chord = group.chord(xsum.s(vec![]));
    synopsis.step(
        "Chord",
        "The body runs once, with the list of every header result.",
        "group.chord(xsum.s(vec![]))",
        dispatcher.apply_and_wait(&chord, TIMEOUT).await?,
    )?;

    let map = xsum.map([json!([1, 2, 3]), json!([10, 20])]);
    synopsis.step(
        "Map",
        "One invocation per item, each item passed as the single argument.",
        "xsum.map([json!([1, 2, 3]), json!([10, 20])])",
        dispatcher.apply_and_wait(&map, TIMEOUT).await?,
    )?;

    let starmap = add.starmap((0..5).map(|i| args![i, i]));
    synopsis.step(
        "Starmap",
        "One invocation per item, each item spread over the arguments.",
        "add.starmap((0..5).map(|i| args![i, i]))",
        dispatcher.apply_and_wait(&starmap, TIMEOUT).await?,
    )?;

    let chunks = add.chunks((0..100).map(|i| args![i, i]), 10);
    let values = dispatcher.apply_and_wait(&chunks, TIMEOUT).await?;
    synopsis.step(
        "Chunks",
        "100 additions sent as 10 messages; results are flattened in order.",
        "add.chunks((0..100).map(|i| args![i, i]), 10)",
        (values.len(), values.last().cloned()),
    )?;

    worker.signal_shutdown().await;
    if let Ok(Err(e)) = worker_task.await {
        eprintln!("Worker error: {}", e);
    }
    info!("Worker stats: {:?}", worker.get_stats().await);

    synopsis.save(&output).await?;
    info!("Synopsis written to {}", output);
    Ok(())
}
