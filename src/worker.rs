//! Worker implementation for executing invocations

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{interval, sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::ResultBackend;
use crate::broker::{Broker, Delivery};
use crate::config::ChordFailurePolicy;
use crate::dispatcher::Dispatcher;
use crate::error::{ErrorInfo, TaskError, TaskResult};
use crate::message::{ChordRef, ExecutionMode, InvocationMessage};
use crate::registry::TaskRegistry;
use crate::task::{RetryPolicy, TaskDescriptor, TaskId, TaskMeta, TaskState};

/// Unique identifier for workers
pub type WorkerId = Uuid;

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique worker identifier
    pub worker_id: WorkerId,
    /// Queues this worker will consume
    pub queues: Vec<String>,
    /// Maximum number of concurrent executions
    pub max_concurrent_tasks: usize,
    /// How long a single consume call waits for a message, in milliseconds
    pub polling_interval_ms: u64,
    /// Default task time limit in seconds
    pub task_timeout: u64,
    /// Whether failed tasks are retried according to their retry policy
    pub auto_retry: bool,
    /// Heartbeat interval in seconds
    pub heartbeat_interval: u64,
    /// How often delayed messages are promoted, in milliseconds
    pub scheduler_interval_ms: u64,
    /// Unacknowledged deliveries older than this, in milliseconds, are put
    /// back on their queue; keep it above the longest task time limit
    pub visibility_timeout_ms: u64,
    /// Worker shutdown grace period in seconds
    pub shutdown_grace_period: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: WorkerId::new_v4(),
            queues: vec!["default".to_string()],
            max_concurrent_tasks: 4,
            polling_interval_ms: 1000,
            task_timeout: 300, // 5 minutes
            auto_retry: true,
            heartbeat_interval: 30,
            scheduler_interval_ms: 1000,
            visibility_timeout_ms: 600_000, // 10 minutes
            shutdown_grace_period: 30,
        }
    }
}

/// Worker statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerStats {
    pub tasks_processed: u64,
    pub tasks_successful: u64,
    pub tasks_failed: u64,
    pub tasks_retried: u64,
    pub messages_rejected: u64,
    pub average_execution_time_ms: f64,
    pub last_heartbeat: Option<chrono::DateTime<chrono::Utc>>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// Everything a spawned execution needs
#[derive(Clone)]
struct Executor {
    worker_id: String,
    config: WorkerConfig,
    registry: Arc<TaskRegistry>,
    dispatcher: Dispatcher,
    stats: Arc<Mutex<WorkerStats>>,
}

impl Executor {
    fn broker(&self) -> &Arc<dyn Broker> {
        self.dispatcher.broker()
    }

    fn backend(&self) -> &Arc<dyn ResultBackend> {
        self.dispatcher.backend()
    }

    /// Decode, execute and settle one delivery
    async fn handle_delivery(&self, delivery: Delivery) {
        let message = match InvocationMessage::decode(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                error!("Rejecting malformed message on queue {}: {}", delivery.queue, e);
                self.stats.lock().await.messages_rejected += 1;
                if let Err(e) = self.broker().reject(&delivery).await {
                    error!("Failed to reject delivery {}: {}", delivery.tag, e);
                }
                return;
            }
        };

        debug!("Received {}[{}] from queue {}", message.task, message.id, delivery.queue);

        // The delivery is only acknowledged once the outcome is recorded.
        match self.execute(&message).await {
            Ok(()) => {
                if let Err(e) = self.broker().ack(&delivery).await {
                    error!("Failed to ack delivery of {}: {}", message.id, e);
                }
            }
            Err(e) => {
                error!("Failed to record outcome of {}: {}; requeueing", message.id, e);
                if let Err(e) = self.broker().nack(&delivery).await {
                    error!("Failed to requeue delivery of {}: {}", message.id, e);
                }
            }
        }
    }

    async fn execute(&self, message: &InvocationMessage) -> TaskResult<()> {
        let descriptor = match self.registry.resolve(&message.task) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                error!("No handler found for task: {}", message.task);
                return self.fail(message, &e).await;
            }
        };

        self.backend()
            .put_result(TaskMeta::started(
                message.id,
                &message.task,
                &self.worker_id,
                message.retries,
            ))
            .await?;

        let limit = message
            .options
            .time_limit_ms
            .map(Duration::from_millis)
            .or_else(|| descriptor.time_limit())
            .unwrap_or_else(|| Duration::from_secs(self.config.task_timeout));

        let start_time = std::time::Instant::now();
        let outcome = match tokio::time::timeout(limit, Self::run(&descriptor, message)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TaskError::TimeLimitExceeded {
                task_id: message.id.to_string(),
                limit_ms: limit.as_millis() as u64,
            }),
        };
        let execution_duration = start_time.elapsed();
        self.record_execution(execution_duration).await;

        match outcome {
            Ok(value) => {
                info!(
                    "Task {}[{}] succeeded in {:?}",
                    message.task, message.id, execution_duration
                );
                self.succeed(message, value).await
            }
            Err(e) => {
                if let Some(policy) = self.retry_policy(&descriptor, message, &e) {
                    return self.retry(message, &policy, &e).await;
                }
                self.fail(message, &e).await
            }
        }
    }

    async fn run(descriptor: &TaskDescriptor, message: &InvocationMessage) -> TaskResult<Value> {
        match &message.mode {
            ExecutionMode::Call => {
                descriptor
                    .invoke(message.args.clone(), message.kwargs.clone())
                    .await
            }
            ExecutionMode::Chunk { items } => {
                let mut values = Vec::with_capacity(items.len());
                for args in items {
                    values.push(descriptor.invoke(args.clone(), message.kwargs.clone()).await?);
                }
                Ok(Value::Array(values))
            }
        }
    }

    /// Policy to retry with, if this failure may be retried at all
    fn retry_policy(
        &self,
        descriptor: &TaskDescriptor,
        message: &InvocationMessage,
        error: &TaskError,
    ) -> Option<RetryPolicy> {
        if !self.config.auto_retry || !error.is_recoverable() {
            return None;
        }
        let policy = message
            .options
            .retry
            .clone()
            .or_else(|| descriptor.retry_policy().cloned())?;

        if policy.can_retry(message.retries) {
            Some(policy)
        } else {
            let exceeded = TaskError::RetryLimitExceeded {
                task_id: message.id.to_string(),
                max_retries: policy.max_retries,
            };
            warn!("{}", exceeded);
            None
        }
    }

    async fn record_execution(&self, duration: Duration) {
        let mut stats = self.stats.lock().await;
        stats.tasks_processed += 1;

        let new_avg = if stats.tasks_processed == 1 {
            duration.as_millis() as f64
        } else {
            (stats.average_execution_time_ms * (stats.tasks_processed - 1) as f64
                + duration.as_millis() as f64)
                / stats.tasks_processed as f64
        };
        stats.average_execution_time_ms = new_avg;
    }

    async fn succeed(&self, message: &InvocationMessage, value: Value) -> TaskResult<()> {
        self.backend()
            .put_result(
                TaskMeta::success(message.id, &message.task, value.clone())
                    .by_worker(&self.worker_id)
                    .with_retries(message.retries),
            )
            .await?;
        self.stats.lock().await.tasks_successful += 1;

        if let Some((next, rest)) = message.continuation.split_first() {
            let next = next.bind(vec![value]);
            self.dispatcher.send(&next, rest.to_vec(), None).await?;
            debug!("Chain continues from {} with {}", message.id, next.task());
        }

        if let Some(chord) = message.chord {
            self.on_chord_member_done(chord, message.id).await?;
        }
        Ok(())
    }

    async fn fail(&self, message: &InvocationMessage, error: &TaskError) -> TaskResult<()> {
        let info = ErrorInfo::from(error);
        self.backend()
            .put_result(
                TaskMeta::failure(message.id, Some(&message.task), info.clone())
                    .by_worker(&self.worker_id)
                    .with_retries(message.retries),
            )
            .await?;
        self.stats.lock().await.tasks_failed += 1;
        error!("Task {}[{}] failed: {}", message.task, message.id, error);

        // Steps after a failed one never run; their ids resolve to the same error.
        let skipped = message.pending_step_ids();
        for step_id in &skipped {
            self.backend()
                .put_result(TaskMeta::failure(*step_id, None, info.clone()).by_worker(&self.worker_id))
                .await?;
        }
        if !skipped.is_empty() {
            warn!("Chain aborted at {}; {} steps skipped", message.id, skipped.len());
        }

        if let Some(chord) = message.chord {
            self.on_chord_member_done(chord, message.id).await?;
        }
        Ok(())
    }

    async fn retry(
        &self,
        message: &InvocationMessage,
        policy: &RetryPolicy,
        error: &TaskError,
    ) -> TaskResult<()> {
        let attempt = message.retries + 1;
        let delay = policy.backoff(attempt);
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| TaskError::worker(format!("invalid retry delay: {e}")))?;

        let mut next = message.clone();
        next.retries = attempt;
        next.eta = Some(Utc::now() + delay);

        self.backend()
            .put_result(
                TaskMeta::retry(message.id, &message.task, ErrorInfo::from(error), attempt)
                    .by_worker(&self.worker_id),
            )
            .await?;
        self.dispatcher.send_message(&next).await?;
        self.stats.lock().await.tasks_retried += 1;

        info!(
            "Task {}[{}] queued for retry (attempt {}) after error: {}",
            message.task, message.id, attempt, error
        );
        Ok(())
    }

    /// Count a finished header member; the member that empties the barrier settles the body
    ///
    /// A redelivered member whose barrier was emptied but never settled (the
    /// settling attempt failed and was requeued) settles it again.
    async fn on_chord_member_done(&self, chord: ChordRef, member: TaskId) -> TaskResult<()> {
        match self
            .backend()
            .decrement_barrier(chord.barrier_id, member)
            .await?
        {
            Some(0) => {}
            Some(remaining) => {
                debug!("Chord {}: {} members remaining", chord.barrier_id, remaining);
                return Ok(());
            }
            None => {
                if !self.backend().barrier_unsettled(chord.barrier_id).await? {
                    debug!("Chord member {} was already counted", member);
                    return Ok(());
                }
                warn!(
                    "Chord {} was emptied but never settled; settling from {}",
                    chord.barrier_id, member
                );
            }
        }

        self.settle_chord(chord.barrier_id).await?;
        self.backend().settle_barrier(chord.barrier_id).await
    }

    /// Fire the chord body, or abort it under the barrier's failure policy
    async fn settle_chord(&self, barrier_id: TaskId) -> TaskResult<()> {
        let barrier = self
            .backend()
            .load_barrier(barrier_id)
            .await?
            .ok_or_else(|| {
                TaskError::backend(
                    "chord".to_string(),
                    format!("barrier {} is missing", barrier_id),
                )
            })?;
        let metas = self.backend().get_results(&barrier.header_ids).await?;
        let first_failure = metas
            .iter()
            .find(|m| m.state == TaskState::Failure)
            .map(|m| {
                let cause = m
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "unknown error".to_string());
                (m.id, cause)
            });

        match (first_failure, barrier.policy) {
            (Some((failed_id, cause)), ChordFailurePolicy::Abort) => {
                let aborted = TaskError::ChordAborted {
                    chord_id: barrier.id.to_string(),
                    message: format!("header member {} failed: {}", failed_id, cause),
                };
                self.backend()
                    .put_result(
                        TaskMeta::failure(barrier.id, Some(barrier.body.task()), ErrorInfo::from(&aborted))
                            .by_worker(&self.worker_id),
                    )
                    .await?;
                warn!("{}", aborted);
            }
            _ => {
                let results: Vec<Value> = metas
                    .into_iter()
                    .filter(|m| m.state == TaskState::Success)
                    .map(|m| m.result.unwrap_or(Value::Null))
                    .collect();
                let body = barrier.body.bind(vec![Value::Array(results)]);
                self.dispatcher.send(&body, Vec::new(), None).await?;
                info!("Chord {} complete, dispatched {}", barrier.id, body.task());
            }
        }
        Ok(())
    }
}

/// Worker consuming invocations from the broker
pub struct Worker {
    executor: Executor,
    shutdown_signal: Arc<RwLock<bool>>,
    active_tasks: Arc<RwLock<HashMap<u64, tokio::task::JoinHandle<()>>>>,
}

impl Worker {
    /// Create a worker; every task it should run must already be in `registry`
    pub fn new(config: WorkerConfig, registry: Arc<TaskRegistry>, dispatcher: Dispatcher) -> Self {
        let stats = WorkerStats {
            started_at: chrono::Utc::now(),
            ..Default::default()
        };

        Self {
            executor: Executor {
                worker_id: config.worker_id.to_string(),
                config,
                registry,
                dispatcher,
                stats: Arc::new(Mutex::new(stats)),
            },
            shutdown_signal: Arc::new(RwLock::new(false)),
            active_tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.executor.config
    }

    fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.executor.config.polling_interval_ms.max(1))
    }

    /// Start the worker; returns after [`Worker::signal_shutdown`] and a graceful drain
    pub async fn start(&self) -> TaskResult<()> {
        if self.executor.config.queues.is_empty() {
            return Err(TaskError::config("worker needs at least one queue"));
        }
        info!(
            "Starting worker {} for queues: {:?} (tasks: {:?})",
            self.executor.worker_id,
            self.executor.config.queues,
            self.executor.registry.names()
        );

        let heartbeat_task = self.start_heartbeat_task();
        let scheduler_task = self.start_scheduler_task();
        let worker_task = self.start_worker_loop();

        tokio::select! {
            _ = heartbeat_task => {
                warn!("Heartbeat task completed unexpectedly");
            }
            _ = scheduler_task => {
                warn!("Scheduler task completed unexpectedly");
            }
            _ = worker_task => {
                info!("Worker loop completed");
            }
        }

        self.shutdown().await
    }

    /// Consume and execute a single message from `queue` inline
    ///
    /// Returns `false` when no message arrived within the polling interval.
    pub async fn process_next(&self, queue: &str) -> TaskResult<bool> {
        match self
            .executor
            .broker()
            .consume(queue, self.polling_interval())
            .await?
        {
            Some(delivery) => {
                self.executor.handle_delivery(delivery).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Main consume loop
    fn start_worker_loop(&self) -> tokio::task::JoinHandle<()> {
        let executor = self.executor.clone();
        let shutdown_signal = self.shutdown_signal.clone();
        let active_tasks = self.active_tasks.clone();
        let polling_interval = self.polling_interval();

        tokio::spawn(async move {
            loop {
                if *shutdown_signal.read().await {
                    break;
                }

                Self::cleanup_completed_tasks(&active_tasks).await;
                if active_tasks.read().await.len() >= executor.config.max_concurrent_tasks {
                    sleep(polling_interval.min(Duration::from_millis(50))).await;
                    continue;
                }

                for queue_name in &executor.config.queues {
                    let delivery = match executor.broker().consume(queue_name, polling_interval).await {
                        Ok(Some(delivery)) => delivery,
                        Ok(None) => continue,
                        Err(e) => {
                            error!("Failed to consume from queue {}: {}", queue_name, e);
                            sleep(polling_interval).await;
                            continue;
                        }
                    };

                    let tag = delivery.tag;
                    let task_executor = executor.clone();
                    let handle = tokio::spawn(async move {
                        task_executor.handle_delivery(delivery).await;
                    });
                    active_tasks.write().await.insert(tag, handle);
                    break;
                }
            }

            info!("Worker loop shutting down");
        })
    }

    /// Drop handles of finished executions
    async fn cleanup_completed_tasks(
        active_tasks: &Arc<RwLock<HashMap<u64, tokio::task::JoinHandle<()>>>>,
    ) {
        active_tasks.write().await.retain(|_, handle| !handle.is_finished());
    }

    fn start_heartbeat_task(&self) -> tokio::task::JoinHandle<()> {
        let worker_id = self.executor.worker_id.clone();
        let period = Duration::from_secs(self.executor.config.heartbeat_interval.max(1));
        let stats = self.executor.stats.clone();
        let shutdown_signal = self.shutdown_signal.clone();

        tokio::spawn(async move {
            let mut interval = interval(period);

            loop {
                interval.tick().await;

                if *shutdown_signal.read().await {
                    break;
                }

                stats.lock().await.last_heartbeat = Some(chrono::Utc::now());
                debug!("Worker {} heartbeat", worker_id);
            }
        })
    }

    /// Promotes delayed messages (countdowns and retries) whose eta has passed
    /// and requeues deliveries abandoned by dead consumers
    fn start_scheduler_task(&self) -> tokio::task::JoinHandle<()> {
        let broker = self.executor.broker().clone();
        let queues = self.executor.config.queues.clone();
        let period = Duration::from_millis(self.executor.config.scheduler_interval_ms.max(1));
        let visibility_timeout = Duration::from_millis(self.executor.config.visibility_timeout_ms);
        let shutdown_signal = self.shutdown_signal.clone();

        tokio::spawn(async move {
            let mut interval = interval(period);

            loop {
                interval.tick().await;

                if *shutdown_signal.read().await {
                    break;
                }

                for queue in &queues {
                    if let Err(e) = broker.promote_due(queue).await {
                        error!("Failed to promote scheduled messages on {}: {}", queue, e);
                    }
                    if let Err(e) = broker.requeue_stale(queue, visibility_timeout).await {
                        error!("Failed to requeue stale deliveries on {}: {}", queue, e);
                    }
                }
            }
        })
    }

    /// Get worker statistics
    pub async fn get_stats(&self) -> WorkerStats {
        self.executor.stats.lock().await.clone()
    }

    /// Signal worker to shutdown
    pub async fn signal_shutdown(&self) {
        let mut shutdown = self.shutdown_signal.write().await;
        *shutdown = true;
    }

    /// Graceful shutdown: stop consuming, let in-flight executions finish
    async fn shutdown(&self) -> TaskResult<()> {
        info!("Shutting down worker {}", self.executor.worker_id);

        self.signal_shutdown().await;

        let start = std::time::Instant::now();
        let grace_period = Duration::from_secs(self.executor.config.shutdown_grace_period);

        while start.elapsed() < grace_period {
            Self::cleanup_completed_tasks(&self.active_tasks).await;
            let active_count = self.active_tasks.read().await.len();
            if active_count == 0 {
                break;
            }

            debug!("Waiting for {} active tasks to complete", active_count);
            sleep(Duration::from_millis(50)).await;
        }

        // Unacknowledged deliveries of aborted executions come back through requeue_stale.
        let mut active_tasks = self.active_tasks.write().await;
        for (tag, handle) in active_tasks.drain() {
            if !handle.is_finished() {
                warn!("Force stopping execution of delivery {}", tag);
                handle.abort();
            }
        }

        info!("Worker {} shut down complete", self.executor.worker_id);
        Ok(())
    }
}
