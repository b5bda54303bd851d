//! In-process result backend

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::{ChordBarrier, ResultBackend};
use crate::error::{TaskError, TaskResult};
use crate::task::{TaskId, TaskMeta};

#[derive(Debug)]
struct BarrierState {
    barrier: ChordBarrier,
    remaining: u64,
    counted: HashSet<TaskId>,
    settled: bool,
}

/// Result backend on a mutex-guarded map
#[derive(Debug, Default)]
pub struct MemoryBackend {
    results: Mutex<HashMap<TaskId, TaskMeta>>,
    barriers: Mutex<HashMap<TaskId, BarrierState>>,
    changed: Notify,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn results(&self) -> TaskResult<MutexGuard<'_, HashMap<TaskId, TaskMeta>>> {
        self.results
            .lock()
            .map_err(|_| TaskError::backend("lock", "result map poisoned"))
    }

    fn barriers(&self) -> TaskResult<MutexGuard<'_, HashMap<TaskId, BarrierState>>> {
        self.barriers
            .lock()
            .map_err(|_| TaskError::backend("lock", "barrier map poisoned"))
    }

    /// Number of invocations with a stored record
    pub fn len(&self) -> usize {
        self.results().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultBackend for MemoryBackend {
    async fn put_result(&self, meta: TaskMeta) -> TaskResult<()> {
        {
            let mut results = self.results()?;
            let keep_existing = results
                .get(&meta.id)
                .map(|existing| existing.state.is_terminal() && !meta.state.is_terminal())
                .unwrap_or(false);
            if keep_existing {
                debug!("Ignoring {} for terminal invocation {}", meta.state, meta.id);
                return Ok(());
            }
            results.insert(meta.id, meta);
        }
        self.changed.notify_waiters();
        Ok(())
    }

    async fn get_result(&self, id: TaskId) -> TaskResult<TaskMeta> {
        Ok(self
            .results()?
            .get(&id)
            .cloned()
            .unwrap_or_else(|| TaskMeta::pending(id)))
    }

    async fn wait_for_result(
        &self,
        id: TaskId,
        timeout: Option<Duration>,
        poll_interval: Duration,
    ) -> TaskResult<TaskMeta> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let changed = self.changed.notified();
            let meta = self.get_result(id).await?;
            if meta.state.is_terminal() {
                return Ok(meta);
            }

            // The poll interval bounds the wait in case a wakeup is missed.
            let mut pause = poll_interval;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Err(TaskError::timeout(format!("waiting for result of {}", id)));
                }
                pause = pause.min(deadline - now);
            }
            let _ = tokio::time::timeout(pause, changed).await;
        }
    }

    async fn init_barrier(&self, barrier: &ChordBarrier) -> TaskResult<()> {
        let mut barriers = self.barriers()?;
        if barriers.contains_key(&barrier.id) {
            return Err(TaskError::backend(
                "init_barrier".to_string(),
                format!("barrier {} already exists", barrier.id),
            ));
        }
        barriers.insert(
            barrier.id,
            BarrierState {
                barrier: barrier.clone(),
                remaining: barrier.size() as u64,
                counted: HashSet::new(),
                settled: false,
            },
        );
        Ok(())
    }

    async fn decrement_barrier(&self, barrier_id: TaskId, member_id: TaskId) -> TaskResult<Option<u64>> {
        let mut barriers = self.barriers()?;
        let state = barriers.get_mut(&barrier_id).ok_or_else(|| {
            TaskError::backend(
                "decrement_barrier".to_string(),
                format!("unknown barrier {}", barrier_id),
            )
        })?;

        if !state.counted.insert(member_id) {
            return Ok(None);
        }
        state.remaining = state.remaining.saturating_sub(1);
        Ok(Some(state.remaining))
    }

    async fn load_barrier(&self, barrier_id: TaskId) -> TaskResult<Option<ChordBarrier>> {
        Ok(self
            .barriers()?
            .get(&barrier_id)
            .map(|state| state.barrier.clone()))
    }

    async fn barrier_unsettled(&self, barrier_id: TaskId) -> TaskResult<bool> {
        Ok(self
            .barriers()?
            .get(&barrier_id)
            .map(|state| state.remaining == 0 && !state.settled)
            .unwrap_or(false))
    }

    async fn settle_barrier(&self, barrier_id: TaskId) -> TaskResult<()> {
        match self.barriers()?.get_mut(&barrier_id) {
            Some(state) => {
                state.settled = true;
                Ok(())
            }
            None => Err(TaskError::backend(
                "settle_barrier".to_string(),
                format!("unknown barrier {}", barrier_id),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;
    use crate::config::ChordFailurePolicy;
    use crate::error::ErrorInfo;
    use crate::signature::Signature;
    use crate::task::TaskState;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn unknown_ids_are_pending() {
        let backend = MemoryBackend::new();
        let meta = backend.get_result(TaskId::new_v4()).await.unwrap();
        assert_eq!(meta.state, TaskState::Pending);
    }

    #[tokio::test]
    async fn terminal_records_are_not_downgraded() {
        let backend = MemoryBackend::new();
        let id = TaskId::new_v4();

        backend
            .put_result(TaskMeta::success(id, "add", json!(4)))
            .await
            .unwrap();
        backend
            .put_result(TaskMeta::started(id, "add", "w1", 0))
            .await
            .unwrap();

        let meta = backend.get_result(id).await.unwrap();
        assert_eq!(meta.state, TaskState::Success);
        assert_eq!(meta.result, Some(json!(4)));
    }

    #[tokio::test]
    async fn wait_wakes_on_completion() {
        let backend = Arc::new(MemoryBackend::new());
        let id = TaskId::new_v4();

        let writer = tokio::spawn({
            let backend = backend.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                backend
                    .put_result(TaskMeta::failure(id, Some("div"), ErrorInfo::from(&TaskError::handler("boom"))))
                    .await
                    .unwrap();
            }
        });

        let meta = backend
            .wait_for_result(id, Some(Duration::from_secs(2)), Duration::from_secs(1))
            .await
            .unwrap();
        writer.await.unwrap();
        assert_eq!(meta.state, TaskState::Failure);
    }

    #[tokio::test]
    async fn wait_times_out() {
        let backend = MemoryBackend::new();
        let start = Instant::now();
        let result = backend
            .wait_for_result(TaskId::new_v4(), Some(Duration::from_millis(10)), Duration::from_millis(5))
            .await;

        assert!(matches!(result, Err(TaskError::Timeout { .. })));
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn redelivered_members_are_counted_once() {
        let backend = MemoryBackend::new();
        let members = vec![TaskId::new_v4(), TaskId::new_v4()];
        let barrier = ChordBarrier::new(
            Signature::new("sum_task", vec![]),
            members.clone(),
            ChordFailurePolicy::Abort,
        );
        backend.init_barrier(&barrier).await.unwrap();

        assert_eq!(backend.decrement_barrier(barrier.id, members[0]).await.unwrap(), Some(1));
        assert_eq!(backend.decrement_barrier(barrier.id, members[0]).await.unwrap(), None);
        assert_eq!(backend.decrement_barrier(barrier.id, members[1]).await.unwrap(), Some(0));
        assert_eq!(backend.load_barrier(barrier.id).await.unwrap(), Some(barrier));
    }

    #[tokio::test]
    async fn emptied_barrier_stays_unsettled_until_marked() {
        let backend = MemoryBackend::new();
        let member = TaskId::new_v4();
        let barrier = ChordBarrier::new(
            Signature::new("sum_task", vec![]),
            vec![member],
            ChordFailurePolicy::Abort,
        );
        backend.init_barrier(&barrier).await.unwrap();
        assert!(!backend.barrier_unsettled(barrier.id).await.unwrap());

        backend.decrement_barrier(barrier.id, member).await.unwrap();
        assert!(backend.barrier_unsettled(barrier.id).await.unwrap());

        backend.settle_barrier(barrier.id).await.unwrap();
        assert!(!backend.barrier_unsettled(barrier.id).await.unwrap());
        assert!(!backend.barrier_unsettled(TaskId::new_v4()).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_decrements_reach_zero_exactly_once() {
        let backend = Arc::new(MemoryBackend::new());
        let members: Vec<TaskId> = (0..64).map(|_| TaskId::new_v4()).collect();
        let barrier = ChordBarrier::new(
            Signature::new("sum_task", args![]),
            members.clone(),
            ChordFailurePolicy::Abort,
        );
        backend.init_barrier(&barrier).await.unwrap();

        let mut handles = Vec::new();
        // every member reports twice, as under redelivery
        for member in members.iter().chain(members.iter()).copied() {
            let backend = backend.clone();
            let barrier_id = barrier.id;
            handles.push(tokio::spawn(async move {
                backend.decrement_barrier(barrier_id, member).await.unwrap()
            }));
        }

        let mut zero_crossings = 0;
        for handle in handles {
            if handle.await.unwrap() == Some(0) {
                zero_crossings += 1;
            }
        }
        assert_eq!(zero_crossings, 1);
    }
}
