//! Client-side handles for pending and completed invocations

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::backend::ResultBackend;
use crate::error::{TaskError, TaskResult};
use crate::task::{TaskId, TaskMeta, TaskState};

/// Something that eventually resolves to an outcome
#[async_trait]
pub trait ResultHandle: Send + Sync {
    type Output: Send;

    /// Wait for the outcome; `None` waits indefinitely
    async fn get(&self, timeout: Option<Duration>) -> TaskResult<Self::Output>;

    /// Whether every underlying invocation is terminal
    async fn ready(&self) -> TaskResult<bool>;
}

/// Handle to a single invocation
#[derive(Clone)]
pub struct AsyncResult {
    id: TaskId,
    backend: Arc<dyn ResultBackend>,
    poll_interval: Duration,
    parents: Vec<TaskId>,
}

impl AsyncResult {
    pub fn new(id: TaskId, backend: Arc<dyn ResultBackend>, poll_interval: Duration) -> Self {
        Self {
            id,
            backend,
            poll_interval,
            parents: Vec::new(),
        }
    }

    /// Record the invocations that ran before this one in a chain
    pub fn with_parents(mut self, parents: Vec<TaskId>) -> Self {
        self.parents = parents;
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn parents(&self) -> &[TaskId] {
        &self.parents
    }

    /// Full stored record
    pub async fn info(&self) -> TaskResult<TaskMeta> {
        self.backend.get_result(self.id).await
    }

    pub async fn state(&self) -> TaskResult<TaskState> {
        Ok(self.info().await?.state)
    }

    pub async fn successful(&self) -> TaskResult<bool> {
        Ok(self.state().await? == TaskState::Success)
    }

    pub async fn failed(&self) -> TaskResult<bool> {
        Ok(self.state().await? == TaskState::Failure)
    }

    /// Wait for the outcome and deserialize it into `T`
    pub async fn get_as<T>(&self, timeout: Option<Duration>) -> TaskResult<T>
    where
        T: DeserializeOwned,
    {
        let value = self.get(timeout).await?;
        Ok(serde_json::from_value(value)?)
    }
}

#[async_trait]
impl ResultHandle for AsyncResult {
    type Output = Value;

    async fn get(&self, timeout: Option<Duration>) -> TaskResult<Value> {
        self.backend
            .wait_for_result(self.id, timeout, self.poll_interval)
            .await?
            .into_outcome()
    }

    async fn ready(&self) -> TaskResult<bool> {
        Ok(self.state().await?.is_terminal())
    }
}

impl fmt::Debug for AsyncResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncResult")
            .field("id", &self.id)
            .field("parents", &self.parents)
            .finish()
    }
}

impl fmt::Display for AsyncResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<AsyncResult: {}>", self.id)
    }
}

/// Ordered handles of a dispatched group
#[derive(Clone)]
pub struct GroupResult {
    results: Vec<AsyncResult>,
    backend: Arc<dyn ResultBackend>,
    poll_interval: Duration,
}

impl GroupResult {
    pub fn new(results: Vec<AsyncResult>, backend: Arc<dyn ResultBackend>, poll_interval: Duration) -> Self {
        Self {
            results,
            backend,
            poll_interval,
        }
    }

    pub fn results(&self) -> &[AsyncResult] {
        &self.results
    }

    /// Member ids in dispatch order
    pub fn ids(&self) -> Vec<TaskId> {
        self.results.iter().map(AsyncResult::id).collect()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Number of members that finished, successfully or not
    pub async fn completed_count(&self) -> TaskResult<usize> {
        let metas = self.backend.get_results(&self.ids()).await?;
        Ok(metas.iter().filter(|m| m.state.is_terminal()).count())
    }

    /// Whether every member succeeded
    pub async fn successful(&self) -> TaskResult<bool> {
        let metas = self.backend.get_results(&self.ids()).await?;
        Ok(metas.iter().all(|m| m.state == TaskState::Success))
    }
}

#[async_trait]
impl ResultHandle for GroupResult {
    type Output = Vec<Value>;

    /// Values in member order; the first failure seen is returned immediately
    async fn get(&self, timeout: Option<Duration>) -> TaskResult<Vec<Value>> {
        let ids = self.ids();
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let metas = self.backend.get_results(&ids).await?;
            if let Some(failed) = metas.iter().find(|m| m.state == TaskState::Failure) {
                return failed.clone().into_outcome().map(|_| Vec::new());
            }
            if metas.iter().all(|m| m.state == TaskState::Success) {
                return metas.into_iter().map(TaskMeta::into_outcome).collect();
            }

            let mut pause = self.poll_interval;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Err(TaskError::timeout(format!(
                        "waiting for group of {} results",
                        ids.len()
                    )));
                }
                pause = pause.min(deadline - now);
            }
            tokio::time::sleep(pause).await;
        }
    }

    async fn ready(&self) -> TaskResult<bool> {
        Ok(self.completed_count().await? == self.len())
    }
}

impl fmt::Debug for GroupResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupResult")
            .field("results", &self.results)
            .finish()
    }
}

/// Handles of a chunked starmap; `get` flattens chunk results
#[derive(Debug, Clone)]
pub struct ChunksResult {
    chunks: GroupResult,
}

impl ChunksResult {
    pub fn new(chunks: GroupResult) -> Self {
        Self { chunks }
    }

    /// One handle per chunk message
    pub fn chunks(&self) -> &GroupResult {
        &self.chunks
    }
}

#[async_trait]
impl ResultHandle for ChunksResult {
    type Output = Vec<Value>;

    async fn get(&self, timeout: Option<Duration>) -> TaskResult<Vec<Value>> {
        let mut flattened = Vec::new();
        for chunk in self.chunks.get(timeout).await? {
            match chunk {
                Value::Array(values) => flattened.extend(values),
                other => {
                    return Err(TaskError::backend(
                        "chunks".to_string(),
                        format!("expected a list of chunk results, got {}", other),
                    ))
                }
            }
        }
        Ok(flattened)
    }

    async fn ready(&self) -> TaskResult<bool> {
        self.chunks.ready().await
    }
}

/// Handles of a dispatched chord
#[derive(Debug, Clone)]
pub struct ChordResult {
    header: GroupResult,
    body: AsyncResult,
}

impl ChordResult {
    pub fn new(header: GroupResult, body: AsyncResult) -> Self {
        Self { header, body }
    }

    pub fn header(&self) -> &GroupResult {
        &self.header
    }

    pub fn body(&self) -> &AsyncResult {
        &self.body
    }

    pub fn id(&self) -> TaskId {
        self.body.id()
    }
}

#[async_trait]
impl ResultHandle for ChordResult {
    type Output = Value;

    async fn get(&self, timeout: Option<Duration>) -> TaskResult<Value> {
        self.body.get(timeout).await
    }

    async fn ready(&self) -> TaskResult<bool> {
        self.body.ready().await
    }
}
