//! Task handlers, descriptors and invocation state

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::canvas::{Chunks, Map as MapCanvas, Starmap};
use crate::error::{ErrorInfo, TaskError, TaskResult};
use crate::signature::{Signature, SignatureOptions};

/// Unique identifier for a task invocation
pub type TaskId = Uuid;

/// Keyword arguments of an invocation
pub type Kwargs = Map<String, Value>;

/// Invocation state as recorded in the result backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    /// Unknown to the backend or not yet picked up by a worker
    #[default]
    Pending,
    /// A worker is executing the handler
    Started,
    /// Completed successfully
    Success,
    /// Failed for good
    Failure,
    /// Failed and was requeued for another attempt
    Retry,
}

impl TaskState {
    /// SUCCESS and FAILURE are terminal; nothing moves an invocation out of them
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Success | TaskState::Failure)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Started => "STARTED",
            TaskState::Success => "SUCCESS",
            TaskState::Failure => "FAILURE",
            TaskState::Retry => "RETRY",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for task retry behavior
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Base delay between retries in milliseconds
    pub retry_delay_ms: u64,
    /// Whether to use exponential backoff
    pub exponential_backoff: bool,
    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 5_000,
            exponential_backoff: true,
            max_delay_ms: 300_000, // 5 minutes
        }
    }
}

impl RetryPolicy {
    /// Policy with a fixed delay between attempts
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        let delay_ms = delay.as_millis() as u64;
        Self {
            max_retries,
            retry_delay_ms: delay_ms,
            exponential_backoff: false,
            max_delay_ms: delay_ms,
        }
    }

    pub fn can_retry(&self, retries: u32) -> bool {
        retries < self.max_retries
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay_ms = if self.exponential_backoff {
            let factor = 2_u64.saturating_pow(attempt.saturating_sub(1));
            self.retry_delay_ms
                .saturating_mul(factor)
                .min(self.max_delay_ms)
        } else {
            self.retry_delay_ms
        };
        Duration::from_millis(delay_ms)
    }
}

/// Executable body of a registered task
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn call(&self, args: Vec<Value>, kwargs: Kwargs) -> TaskResult<Value>;
}

/// Adapts a typed async closure into a [`TaskHandler`]
///
/// The positional arguments are deserialized as a JSON array into `A`, so a
/// two-argument task takes a tuple `(i64, i64)` and a one-argument task a
/// one-element tuple such as `(Vec<i64>,)`.
pub struct FnHandler<F, A, R> {
    name: String,
    f: F,
    _marker: PhantomData<fn(A) -> R>,
}

impl<F, A, R> FnHandler<F, A, R> {
    pub fn new<S: Into<String>>(name: S, f: F) -> Self {
        Self {
            name: name.into(),
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut, A, R> TaskHandler for FnHandler<F, A, R>
where
    F: Fn(A) -> Fut + Send + Sync,
    Fut: Future<Output = TaskResult<R>> + Send,
    A: DeserializeOwned + Send,
    R: Serialize + Send,
{
    async fn call(&self, args: Vec<Value>, kwargs: Kwargs) -> TaskResult<Value> {
        if !kwargs.is_empty() {
            return Err(TaskError::invalid_arguments(
                self.name.clone(),
                "typed handlers take positional arguments only".to_string(),
            ));
        }
        let typed: A = serde_json::from_value(Value::Array(args))
            .map_err(|e| TaskError::invalid_arguments(self.name.clone(), e.to_string()))?;
        let output = (self.f)(typed).await?;
        Ok(serde_json::to_value(output)?)
    }
}

/// A named handler plus the metadata the worker needs to run it
pub struct TaskDescriptor {
    name: String,
    handler: Arc<dyn TaskHandler>,
    arity: Option<usize>,
    retry_policy: Option<RetryPolicy>,
    time_limit: Option<Duration>,
}

impl TaskDescriptor {
    pub fn new<S, H>(name: S, handler: H) -> Self
    where
        S: Into<String>,
        H: TaskHandler + 'static,
    {
        Self {
            name: name.into(),
            handler: Arc::new(handler),
            arity: None,
            retry_policy: None,
            time_limit: None,
        }
    }

    /// Require exactly `arity` positional arguments
    pub fn with_arity(mut self, arity: usize) -> Self {
        self.arity = Some(arity);
        self
    }

    /// Retry policy used when a signature does not carry its own
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> Option<usize> {
        self.arity
    }

    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry_policy.as_ref()
    }

    pub fn time_limit(&self) -> Option<Duration> {
        self.time_limit
    }

    /// Run the handler after checking the declared arity
    pub async fn invoke(&self, args: Vec<Value>, kwargs: Kwargs) -> TaskResult<Value> {
        if let Some(arity) = self.arity {
            if args.len() != arity {
                return Err(TaskError::invalid_arguments(
                    self.name.clone(),
                    format!("expected {} positional arguments, got {}", arity, args.len()),
                ));
            }
        }
        self.handler.call(args, kwargs).await
    }
}

impl fmt::Debug for TaskDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDescriptor")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("retry_policy", &self.retry_policy)
            .field("time_limit", &self.time_limit)
            .finish_non_exhaustive()
    }
}

/// Handle returned by registration; the entry point for building signatures
#[derive(Debug, Clone)]
pub struct Task {
    descriptor: Arc<TaskDescriptor>,
}

impl Task {
    pub(crate) fn new(descriptor: Arc<TaskDescriptor>) -> Self {
        Self { descriptor }
    }

    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    pub fn descriptor(&self) -> &Arc<TaskDescriptor> {
        &self.descriptor
    }

    /// Signature with positional arguments
    pub fn s(&self, args: Vec<Value>) -> Signature {
        Signature::new(self.name(), args)
    }

    /// Signature with keyword arguments and options
    pub fn signature(&self, args: Vec<Value>, kwargs: Kwargs, options: SignatureOptions) -> Signature {
        Signature::new(self.name(), args)
            .with_kwargs(kwargs)
            .with_options(options)
    }

    /// Call the handler directly in the current task
    pub async fn call(&self, args: Vec<Value>) -> TaskResult<Value> {
        self.descriptor.invoke(args, Kwargs::new()).await
    }

    /// One invocation per item, each item passed as the single argument
    pub fn map<I>(&self, items: I) -> MapCanvas
    where
        I: IntoIterator<Item = Value>,
    {
        MapCanvas::new(self.name(), items)
    }

    /// One invocation per item, each item unpacked into positional arguments
    pub fn starmap<I>(&self, items: I) -> Starmap
    where
        I: IntoIterator<Item = Vec<Value>>,
    {
        Starmap::new(self.name(), items)
    }

    /// Starmap split into messages of at most `size` items
    pub fn chunks<I>(&self, items: I, size: usize) -> Chunks
    where
        I: IntoIterator<Item = Vec<Value>>,
    {
        Chunks::new(self.name(), items, size)
    }
}

/// Invocation record stored in the result backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskMeta {
    /// Invocation identifier
    pub id: TaskId,
    /// Task name, when known
    #[serde(default)]
    pub task: Option<String>,
    /// Current state
    pub state: TaskState,
    /// Return value (SUCCESS)
    #[serde(default)]
    pub result: Option<Value>,
    /// Failure (FAILURE, or the last failure for RETRY)
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    /// Number of retries performed so far
    #[serde(default)]
    pub retries: u32,
    /// Worker that last touched the invocation
    #[serde(default)]
    pub worker_id: Option<String>,
    /// When the record was last written
    pub updated_at: DateTime<Utc>,
    /// When the invocation reached a terminal state
    #[serde(default)]
    pub date_done: Option<DateTime<Utc>>,
}

impl TaskMeta {
    /// A record the backend has never seen
    pub fn pending(id: TaskId) -> Self {
        Self {
            id,
            task: None,
            state: TaskState::Pending,
            result: None,
            error: None,
            retries: 0,
            worker_id: None,
            updated_at: Utc::now(),
            date_done: None,
        }
    }

    pub fn started(id: TaskId, task: &str, worker_id: &str, retries: u32) -> Self {
        Self {
            task: Some(task.to_string()),
            state: TaskState::Started,
            worker_id: Some(worker_id.to_string()),
            retries,
            ..Self::pending(id)
        }
    }

    pub fn success(id: TaskId, task: &str, result: Value) -> Self {
        let now = Utc::now();
        Self {
            task: Some(task.to_string()),
            state: TaskState::Success,
            result: Some(result),
            updated_at: now,
            date_done: Some(now),
            ..Self::pending(id)
        }
    }

    pub fn failure(id: TaskId, task: Option<&str>, error: ErrorInfo) -> Self {
        let now = Utc::now();
        Self {
            task: task.map(str::to_string),
            state: TaskState::Failure,
            error: Some(error),
            updated_at: now,
            date_done: Some(now),
            ..Self::pending(id)
        }
    }

    pub fn retry(id: TaskId, task: &str, error: ErrorInfo, retries: u32) -> Self {
        Self {
            task: Some(task.to_string()),
            state: TaskState::Retry,
            error: Some(error),
            retries,
            ..Self::pending(id)
        }
    }

    /// Attach the worker that produced this record
    pub fn by_worker(mut self, worker_id: &str) -> Self {
        self.worker_id = Some(worker_id.to_string());
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Turn a terminal record into what a waiting client receives
    pub fn into_outcome(self) -> TaskResult<Value> {
        match self.state {
            TaskState::Success => Ok(self.result.unwrap_or(Value::Null)),
            TaskState::Failure => Err(self
                .error
                .map(ErrorInfo::into_error)
                .unwrap_or_else(|| TaskError::handler("task failed without error details"))),
            state => Err(TaskError::backend(
                "outcome".to_string(),
                format!("invocation {} is not terminal ({})", self.id, state),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            retry_delay_ms: 100,
            exponential_backoff: true,
            max_delay_ms: 350,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert!(policy.can_retry(4));
        assert!(!policy.can_retry(5));
    }

    #[tokio::test]
    async fn typed_handler_unpacks_tuples() {
        let handler = FnHandler::new("add", |(a, b): (i64, i64)| async move { Ok(a + b) });
        let value = handler.call(vec![json!(2), json!(3)], Kwargs::new()).await.unwrap();
        assert_eq!(value, json!(5));
    }

    #[tokio::test]
    async fn typed_handler_rejects_wrong_arguments() {
        let handler = FnHandler::new("add", |(a, b): (i64, i64)| async move { Ok(a + b) });
        let err = handler.call(vec![json!("x")], Kwargs::new()).await.unwrap_err();
        assert!(matches!(err, TaskError::InvalidArguments { task, .. } if task == "add"));
    }

    #[tokio::test]
    async fn arity_is_checked_before_the_handler_runs() {
        let descriptor = TaskDescriptor::new(
            "sum_task",
            FnHandler::new("sum_task", |(numbers,): (Vec<i64>,)| async move {
                Ok(numbers.iter().sum::<i64>())
            }),
        )
        .with_arity(1);

        assert_eq!(
            descriptor.invoke(vec![json!([1, 2, 3])], Kwargs::new()).await.unwrap(),
            json!(6)
        );
        let err = descriptor
            .invoke(vec![json!([1]), json!([2])], Kwargs::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidArguments { .. }));
    }

    #[test]
    fn failure_outcome_reraises_stored_error() {
        let id = TaskId::new_v4();
        let meta = TaskMeta::failure(id, Some("div"), ErrorInfo::from(&TaskError::handler("boom")));
        assert!(meta.state.is_terminal());
        assert!(matches!(meta.into_outcome(), Err(TaskError::Handler { message }) if message == "boom"));
    }
}
