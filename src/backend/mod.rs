//! Result storage and chord barriers

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::ChordFailurePolicy;
use crate::error::{TaskError, TaskResult};
use crate::signature::Signature;
use crate::task::{TaskId, TaskMeta};

pub mod memory;
pub mod redis;

pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;

/// Durable fan-in record of a chord
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChordBarrier {
    /// Barrier id; the body is dispatched under the same id
    pub id: TaskId,
    /// Header invocation ids in header order
    pub header_ids: Vec<TaskId>,
    /// Body signature, frozen with `id`
    pub body: Signature,
    pub policy: ChordFailurePolicy,
    pub created_at: DateTime<Utc>,
}

impl ChordBarrier {
    pub fn new(body: Signature, header_ids: Vec<TaskId>, policy: ChordFailurePolicy) -> Self {
        let body = body.frozen();
        let id = body.id().unwrap_or_else(TaskId::new_v4);
        Self {
            id,
            header_ids,
            body,
            policy,
            created_at: Utc::now(),
        }
    }

    pub fn size(&self) -> usize {
        self.header_ids.len()
    }
}

/// Key-value store of invocation outcomes
///
/// Unknown ids read as PENDING. A terminal record (SUCCESS or FAILURE) is never
/// replaced by a non-terminal one.
#[async_trait]
pub trait ResultBackend: Send + Sync {
    async fn put_result(&self, meta: TaskMeta) -> TaskResult<()>;

    async fn get_result(&self, id: TaskId) -> TaskResult<TaskMeta>;

    async fn get_results(&self, ids: &[TaskId]) -> TaskResult<Vec<TaskMeta>> {
        let mut metas = Vec::with_capacity(ids.len());
        for id in ids {
            metas.push(self.get_result(*id).await?);
        }
        Ok(metas)
    }

    /// Wait until `id` is terminal, polling every `poll_interval`
    async fn wait_for_result(
        &self,
        id: TaskId,
        timeout: Option<Duration>,
        poll_interval: Duration,
    ) -> TaskResult<TaskMeta> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let meta = self.get_result(id).await?;
            if meta.state.is_terminal() {
                return Ok(meta);
            }

            let mut pause = poll_interval;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Err(TaskError::timeout(format!("waiting for result of {}", id)));
                }
                pause = pause.min(deadline - now);
            }
            tokio::time::sleep(pause).await;
        }
    }

    /// Store the barrier with its counter set to the header size
    async fn init_barrier(&self, barrier: &ChordBarrier) -> TaskResult<()>;

    /// Count `member_id` as finished and return how many members remain
    ///
    /// Returns `None` when `member_id` was already counted, so a redelivered
    /// header member cannot push the counter past zero a second time.
    async fn decrement_barrier(&self, barrier_id: TaskId, member_id: TaskId) -> TaskResult<Option<u64>>;

    async fn load_barrier(&self, barrier_id: TaskId) -> TaskResult<Option<ChordBarrier>>;

    /// True when every member is counted but the body was never fired or aborted
    async fn barrier_unsettled(&self, barrier_id: TaskId) -> TaskResult<bool>;

    /// Record that the body was fired or aborted
    async fn settle_barrier(&self, barrier_id: TaskId) -> TaskResult<()>;
}
