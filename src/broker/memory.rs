//! In-process broker for tests and single-process deployments

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Broker, Delivery};
use crate::error::{TaskError, TaskResult};

#[derive(Debug)]
struct Claim {
    delivery: Delivery,
    claimed_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, VecDeque<Vec<u8>>>,
    unacked: HashMap<u64, Claim>,
    scheduled: Vec<(DateTime<Utc>, String, Vec<u8>)>,
    dead_letters: HashMap<String, Vec<Vec<u8>>>,
}

/// Broker backed by in-memory queues
#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
    notify: Notify,
    next_tag: AtomicU64,
    published: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> TaskResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| TaskError::broker("lock", "memory broker state poisoned"))
    }

    /// Number of messages published or scheduled since creation
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    /// Copies of the messages waiting on `queue`, oldest first
    pub fn pending(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .map(|state| {
                state
                    .queues
                    .get(queue)
                    .map(|q| q.iter().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    pub fn scheduled_count(&self) -> usize {
        self.lock().map(|state| state.scheduled.len()).unwrap_or(0)
    }

    pub fn unacked_count(&self) -> usize {
        self.lock().map(|state| state.unacked.len()).unwrap_or(0)
    }

    pub fn dead_letters(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .map(|state| state.dead_letters.get(queue).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    fn try_pop(&self, queue: &str) -> TaskResult<Option<Delivery>> {
        let mut state = self.lock()?;
        let payload = match state.queues.get_mut(queue).and_then(VecDeque::pop_front) {
            Some(payload) => payload,
            None => return Ok(None),
        };
        let delivery = Delivery {
            tag: self.next_tag.fetch_add(1, Ordering::SeqCst) + 1,
            queue: queue.to_string(),
            payload,
        };
        state.unacked.insert(
            delivery.tag,
            Claim {
                delivery: delivery.clone(),
                claimed_at: Instant::now(),
            },
        );
        Ok(Some(delivery))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> TaskResult<()> {
        self.lock()?
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(payload);
        self.published.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
        debug!("Published message to queue {}", queue);
        Ok(())
    }

    async fn schedule(&self, queue: &str, payload: Vec<u8>, eta: DateTime<Utc>) -> TaskResult<()> {
        self.lock()?
            .scheduled
            .push((eta, queue.to_string(), payload));
        self.published.fetch_add(1, Ordering::SeqCst);
        debug!("Scheduled message on queue {} for {}", queue, eta);
        Ok(())
    }

    async fn consume(&self, queue: &str, timeout: Duration) -> TaskResult<Option<Delivery>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Registered before the check so a publish in between still wakes us.
            let notified = self.notify.notified();
            if let Some(delivery) = self.try_pop(queue)? {
                return Ok(Some(delivery));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> TaskResult<()> {
        self.lock()?.unacked.remove(&delivery.tag);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> TaskResult<()> {
        {
            let mut state = self.lock()?;
            if state.unacked.remove(&delivery.tag).is_none() {
                return Ok(());
            }
            state
                .queues
                .entry(delivery.queue.clone())
                .or_default()
                .push_back(delivery.payload.clone());
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery) -> TaskResult<()> {
        let mut state = self.lock()?;
        if state.unacked.remove(&delivery.tag).is_some() {
            state
                .dead_letters
                .entry(delivery.queue.clone())
                .or_default()
                .push(delivery.payload.clone());
        }
        Ok(())
    }

    async fn promote_due(&self, queue: &str) -> TaskResult<u64> {
        let now = Utc::now();
        let promoted = {
            let mut state = self.lock()?;
            let (due, waiting): (Vec<_>, Vec<_>) = state
                .scheduled
                .drain(..)
                .partition(|(eta, q, _)| q == queue && *eta <= now);
            state.scheduled = waiting;

            let count = due.len() as u64;
            let target = state.queues.entry(queue.to_string()).or_default();
            for (_, _, payload) in due {
                target.push_back(payload);
            }
            count
        };

        if promoted > 0 {
            debug!("Promoted {} scheduled messages on queue {}", promoted, queue);
            self.notify.notify_waiters();
        }
        Ok(promoted)
    }

    async fn requeue_stale(&self, queue: &str, older_than: Duration) -> TaskResult<u64> {
        let requeued = {
            let mut state = self.lock()?;
            let stale: Vec<u64> = state
                .unacked
                .iter()
                .filter(|(_, claim)| {
                    claim.delivery.queue == queue && claim.claimed_at.elapsed() >= older_than
                })
                .map(|(tag, _)| *tag)
                .collect();

            for tag in &stale {
                if let Some(claim) = state.unacked.remove(tag) {
                    state
                        .queues
                        .entry(claim.delivery.queue)
                        .or_default()
                        .push_front(claim.delivery.payload);
                }
            }
            stale.len() as u64
        };

        if requeued > 0 {
            warn!("Requeued {} unacknowledged deliveries on queue {}", requeued, queue);
            self.notify.notify_waiters();
        }
        Ok(requeued)
    }
}
