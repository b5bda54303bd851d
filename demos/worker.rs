//! Redis worker example
//!
//! This example demonstrates how to:
//! 1. Load connection settings from the environment
//! 2. Register task handlers, including one with a retry policy
//! 3. Run a worker against Redis until interrupted
//!
//! To run this example:
//! 1. Make sure Redis is running (TC_REDIS_URL, default redis://127.0.0.1:6379)
//! 2. Run: cargo run --example worker
//! 3. Submit work from another process with the same registry

use std::sync::Arc;
use std::time::Duration;

use task_canvas::{
    AppConfig, Dispatcher, RetryPolicy, TaskDescriptor, TaskError, TaskRegistry, Worker,
    WorkerConfig,
};
use task_canvas::task::FnHandler;
use tracing::{info, Level};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    let config = AppConfig::from_env()?;
    info!("Connecting to {}", config.redis_url);

    let mut registry = TaskRegistry::new();
    registry.register_fn("add", |(a, b): (i64, i64)| async move {
        info!("Adding {} + {}", a, b);
        Ok(a + b)
    })?;
    registry.register(
        TaskDescriptor::new(
            "sum_task",
            FnHandler::new("sum_task", |(numbers,): (Vec<i64>,)| async move {
                if numbers.is_empty() {
                    return Err(TaskError::handler("nothing to sum"));
                }
                Ok(numbers.iter().sum::<i64>())
            }),
        )
        .with_arity(1)
        .with_retry_policy(RetryPolicy::fixed(3, Duration::from_secs(1)))
        .with_time_limit(Duration::from_secs(30)),
    )?;
    let registry = Arc::new(registry);

    let queues = vec![config.default_queue.clone()];
    let dispatcher = Dispatcher::connect(config).await?.with_registry(registry.clone());

    let worker = Arc::new(Worker::new(
        WorkerConfig {
            queues,
            max_concurrent_tasks: 4,
            polling_interval_ms: 500,
            ..Default::default()
        },
        registry,
        dispatcher,
    ));

    let signal_worker = worker.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, draining");
            signal_worker.signal_shutdown().await;
        }
    });

    worker.start().await?;
    Ok(())
}
