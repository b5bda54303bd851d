//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use task_canvas::{
    AppConfig, Dispatcher, MemoryBackend, MemoryBroker, TaskError, TaskRegistry, TaskResult,
    Worker, WorkerConfig,
};
use tokio::task::JoinHandle;

pub const TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

/// Invocation counters for the side-effecting fixture tasks
#[derive(Default, Clone)]
pub struct Counters {
    pub record: Arc<AtomicU32>,
    pub collect: Arc<AtomicU32>,
    pub flaky: Arc<AtomicU32>,
}

impl Counters {
    pub fn record(&self) -> u32 {
        self.record.load(Ordering::SeqCst)
    }

    pub fn collect(&self) -> u32 {
        self.collect.load(Ordering::SeqCst)
    }

    pub fn flaky(&self) -> u32 {
        self.flaky.load(Ordering::SeqCst)
    }
}

/// add, mul, xsum, echo_after, boom, record, collect
pub fn registry(counters: &Counters) -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry
        .register_fn("add", |(a, b): (i64, i64)| async move { Ok(a + b) })
        .unwrap();
    registry
        .register_fn("mul", |(a, b): (i64, i64)| async move { Ok(a * b) })
        .unwrap();
    registry
        .register_fn("xsum", |(numbers,): (Vec<i64>,)| async move {
            Ok(numbers.iter().sum::<i64>())
        })
        .unwrap();
    registry
        .register_fn("echo_after", |(delay_ms, value): (u64, Value)| async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            Ok(value)
        })
        .unwrap();
    registry
        .register_fn("boom", |(_input,): (Value,)| async move {
            Err::<Value, _>(TaskError::handler("boom"))
        })
        .unwrap();

    let record = counters.record.clone();
    registry
        .register_fn("record", move |(value,): (Value,)| {
            let record = record.clone();
            async move {
                record.fetch_add(1, Ordering::SeqCst);
                Ok(value)
            }
        })
        .unwrap();

    let collect = counters.collect.clone();
    registry
        .register_fn("collect", move |(values,): (Vec<i64>,)| {
            let collect = collect.clone();
            async move {
                collect.fetch_add(1, Ordering::SeqCst);
                Ok(values.iter().sum::<i64>())
            }
        })
        .unwrap();

    registry
}

pub struct Harness {
    pub registry: Arc<TaskRegistry>,
    pub dispatcher: Dispatcher,
    pub broker: Arc<MemoryBroker>,
    pub backend: Arc<MemoryBackend>,
}

impl Harness {
    pub fn new(registry: TaskRegistry) -> Self {
        Self::with_config(registry, AppConfig::default())
    }

    pub fn with_config(registry: TaskRegistry, mut config: AppConfig) -> Self {
        config.result_poll_interval_ms = 5;
        let registry = Arc::new(registry);
        let broker = Arc::new(MemoryBroker::new());
        let backend = Arc::new(MemoryBackend::new());
        let dispatcher = Dispatcher::new(config, broker.clone(), backend.clone())
            .with_registry(registry.clone());

        Self {
            registry,
            dispatcher,
            broker,
            backend,
        }
    }

    pub fn worker(&self) -> Worker {
        Worker::new(worker_config(), self.registry.clone(), self.dispatcher.clone())
    }

    /// Start `count` workers on background tasks
    pub fn spawn_workers(&self, count: usize) -> Workers {
        let workers = (0..count)
            .map(|_| {
                let worker = Arc::new(self.worker());
                let running = worker.clone();
                let handle = tokio::spawn(async move { running.start().await });
                (worker, handle)
            })
            .collect();
        Workers { workers }
    }

    /// Process messages inline until the default queue stays empty
    pub async fn drain(&self, worker: &Worker) -> usize {
        let mut processed = 0;
        while worker.process_next("default").await.unwrap() {
            processed += 1;
        }
        processed
    }
}

pub fn worker_config() -> WorkerConfig {
    WorkerConfig {
        max_concurrent_tasks: 8,
        polling_interval_ms: 20,
        scheduler_interval_ms: 10,
        heartbeat_interval: 1,
        shutdown_grace_period: 2,
        ..Default::default()
    }
}

pub struct Workers {
    workers: Vec<(Arc<Worker>, JoinHandle<TaskResult<()>>)>,
}

impl Workers {
    pub fn get(&self, index: usize) -> &Arc<Worker> {
        &self.workers[index].0
    }

    pub async fn stop(self) {
        for (worker, _) in &self.workers {
            worker.signal_shutdown().await;
        }
        for (_, handle) in self.workers {
            handle.await.unwrap().unwrap();
        }
    }
}
