//! Dispatcher: publishes signatures and canvas values, hands out result handles

use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::backend::{RedisBackend, ResultBackend};
use crate::broker::{Broker, RedisBroker};
use crate::canvas::Dispatch;
use crate::config::AppConfig;
use crate::error::TaskResult;
use crate::message::{ChordRef, InvocationMessage};
use crate::registry::TaskRegistry;
use crate::result::{AsyncResult, GroupResult, ResultHandle};
use crate::signature::Signature;
use crate::task::TaskId;

/// Entry point for submitting work
#[derive(Clone)]
pub struct Dispatcher {
    config: Arc<AppConfig>,
    broker: Arc<dyn Broker>,
    backend: Arc<dyn ResultBackend>,
    registry: Option<Arc<TaskRegistry>>,
}

impl Dispatcher {
    /// Create a dispatcher over the given transport and result store
    pub fn new(config: AppConfig, broker: Arc<dyn Broker>, backend: Arc<dyn ResultBackend>) -> Self {
        Self {
            config: Arc::new(config),
            broker,
            backend,
            registry: None,
        }
    }

    /// Create a dispatcher using Redis for both transport and results
    pub async fn connect(config: AppConfig) -> TaskResult<Self> {
        let broker = Arc::new(RedisBroker::new(&config).await?);
        let backend = Arc::new(RedisBackend::new(&config).await?);
        Ok(Self::new(config, broker, backend))
    }

    /// Validate task names against `registry` before publishing
    pub fn with_registry(mut self, registry: Arc<TaskRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn backend(&self) -> &Arc<dyn ResultBackend> {
        &self.backend
    }

    /// Fail with `UnknownTask` if a registry is attached and lacks `task`
    pub fn validate(&self, task: &str) -> TaskResult<()> {
        match &self.registry {
            Some(registry) => registry.resolve(task).map(|_| ()),
            None => Ok(()),
        }
    }

    /// Handle for an invocation id
    pub fn result(&self, id: TaskId) -> AsyncResult {
        AsyncResult::new(id, self.backend.clone(), self.config.poll_interval())
    }

    pub fn group_result(&self, results: Vec<AsyncResult>) -> GroupResult {
        GroupResult::new(results, self.backend.clone(), self.config.poll_interval())
    }

    /// Publish one signature, optionally as the head of a chain or a chord member
    pub async fn send(
        &self,
        signature: &Signature,
        continuation: Vec<Signature>,
        chord: Option<ChordRef>,
    ) -> TaskResult<AsyncResult> {
        let id = signature.id().unwrap_or_else(TaskId::new_v4);
        let message = InvocationMessage::from_signature(signature, id)
            .with_continuation(continuation)
            .with_chord(chord);
        self.send_message(&message).await?;
        Ok(self.result(id))
    }

    /// Encode and publish a prepared message, honoring its eta
    pub async fn send_message(&self, message: &InvocationMessage) -> TaskResult<()> {
        self.validate(&message.task)?;

        let queue = message
            .queue()
            .unwrap_or(self.config.default_queue.as_str())
            .to_string();
        let payload = message.encode()?;

        match message.eta {
            Some(eta) if eta > Utc::now() => {
                self.broker.schedule(&queue, payload, eta).await?;
                debug!("Scheduled {} [{}] on {} for {}", message.task, message.id, queue, eta);
            }
            _ => {
                self.broker.publish(&queue, payload).await?;
                debug!("Sent {} [{}] to {}", message.task, message.id, queue);
            }
        }
        Ok(())
    }

    /// Dispatch any canvas value
    pub async fn apply<D>(&self, item: &D) -> TaskResult<D::Handle>
    where
        D: Dispatch,
    {
        item.apply_async(self).await
    }

    /// Dispatch and wait for the outcome in one call
    pub async fn apply_and_wait<D>(
        &self,
        item: &D,
        timeout: Option<Duration>,
    ) -> TaskResult<<D::Handle as ResultHandle>::Output>
    where
        D: Dispatch,
    {
        item.apply_async(self).await?.get(timeout).await
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("validates_tasks", &self.registry.is_some())
            .finish_non_exhaustive()
    }
}
