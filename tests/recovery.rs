//! Recovery from backend outages and abandoned deliveries

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use task_canvas::{
    args, AppConfig, Broker, ChordBarrier, Dispatcher, Group, MemoryBackend, MemoryBroker,
    ResultBackend, ResultHandle, Signature, TaskError, TaskId, TaskMeta, TaskResult, Worker,
    WorkerConfig,
};

use common::{registry, worker_config, Counters, Harness, TIMEOUT};

/// Memory backend whose next barrier lookup fails, like a dropped connection
#[derive(Default)]
struct OutageBackend {
    inner: MemoryBackend,
    fail_next_load: AtomicBool,
}

#[async_trait]
impl ResultBackend for OutageBackend {
    async fn put_result(&self, meta: TaskMeta) -> TaskResult<()> {
        self.inner.put_result(meta).await
    }

    async fn get_result(&self, id: TaskId) -> TaskResult<TaskMeta> {
        self.inner.get_result(id).await
    }

    async fn init_barrier(&self, barrier: &ChordBarrier) -> TaskResult<()> {
        self.inner.init_barrier(barrier).await
    }

    async fn decrement_barrier(&self, barrier_id: TaskId, member_id: TaskId) -> TaskResult<Option<u64>> {
        self.inner.decrement_barrier(barrier_id, member_id).await
    }

    async fn load_barrier(&self, barrier_id: TaskId) -> TaskResult<Option<ChordBarrier>> {
        if self.fail_next_load.swap(false, Ordering::SeqCst) {
            return Err(TaskError::backend("load_barrier", "connection reset"));
        }
        self.inner.load_barrier(barrier_id).await
    }

    async fn barrier_unsettled(&self, barrier_id: TaskId) -> TaskResult<bool> {
        self.inner.barrier_unsettled(barrier_id).await
    }

    async fn settle_barrier(&self, barrier_id: TaskId) -> TaskResult<()> {
        self.inner.settle_barrier(barrier_id).await
    }
}

#[tokio::test]
async fn chord_body_fires_after_a_failed_settle_is_redelivered() {
    let counters = Counters::default();
    let registry = Arc::new(registry(&counters));
    let broker = Arc::new(MemoryBroker::new());
    let backend = Arc::new(OutageBackend::default());
    let config = AppConfig {
        result_poll_interval_ms: 5,
        ..Default::default()
    };
    let dispatcher = Dispatcher::new(config, broker.clone(), backend.clone())
        .with_registry(registry.clone());
    let worker = Worker::new(worker_config(), registry, dispatcher.clone());

    let header = Group::new([
        Signature::new("add", args![1, 2]),
        Signature::new("add", args![3, 4]),
    ]);
    let result = dispatcher
        .apply(&header.chord(Signature::new("collect", vec![])))
        .await
        .unwrap();
    backend.fail_next_load.store(true, Ordering::SeqCst);

    // two members, the redelivered last member, then the body
    let mut processed = 0;
    while worker.process_next("default").await.unwrap() {
        processed += 1;
    }
    assert_eq!(processed, 4);
    assert!(!backend.fail_next_load.load(Ordering::SeqCst));

    assert_eq!(result.get(TIMEOUT).await.unwrap(), json!(10));
    assert_eq!(counters.collect(), 1);
    assert_eq!(broker.unacked_count(), 0);
}

#[tokio::test]
async fn abandoned_delivery_is_picked_up_by_another_worker() {
    let harness = Harness::new(registry(&Counters::default()));
    let result = harness
        .dispatcher
        .apply(&Signature::new("add", args![20, 22]))
        .await
        .unwrap();

    // A consumer that takes the message and dies before acknowledging it.
    let abandoned = harness
        .broker
        .consume("default", Duration::from_millis(50))
        .await
        .unwrap();
    assert!(abandoned.is_some());
    assert_eq!(harness.broker.unacked_count(), 1);

    let worker = Arc::new(Worker::new(
        WorkerConfig {
            visibility_timeout_ms: 50,
            ..worker_config()
        },
        harness.registry.clone(),
        harness.dispatcher.clone(),
    ));
    let running = worker.clone();
    let handle = tokio::spawn(async move { running.start().await });

    assert_eq!(result.get(TIMEOUT).await.unwrap(), json!(42));
    worker.signal_shutdown().await;
    handle.await.unwrap().unwrap();
    assert_eq!(harness.broker.unacked_count(), 0);
}
