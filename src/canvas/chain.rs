//! Sequential composition

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::Dispatch;
use crate::dispatcher::Dispatcher;
use crate::error::{TaskError, TaskResult};
use crate::registry::TaskRegistry;
use crate::result::AsyncResult;
use crate::signature::Signature;

/// Steps run one after another, each receiving the previous result as its
/// first argument
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Chain {
    steps: Vec<Signature>,
}

impl Chain {
    pub fn new(steps: Vec<Signature>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[Signature] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// New chain with `next` appended
    pub fn then(&self, next: Signature) -> Chain {
        let mut steps = self.steps.clone();
        steps.push(next);
        Chain { steps }
    }

    /// New chain whose first step has `args` prepended
    pub fn bind(&self, args: Vec<Value>) -> Chain {
        let mut steps = self.steps.clone();
        if let Some(first) = steps.first_mut() {
            *first = first.bind(args);
        }
        Chain { steps }
    }

    /// Run every step in the caller's task
    pub async fn call(&self, registry: &TaskRegistry) -> TaskResult<Value> {
        let mut previous: Option<Value> = None;
        for step in &self.steps {
            let step = match previous.take() {
                Some(value) => step.bind(vec![value]),
                None => step.clone(),
            };
            previous = Some(step.invoke_locally(registry).await?);
        }
        previous.ok_or_else(|| TaskError::config("cannot run an empty chain"))
    }
}

#[async_trait]
impl Dispatch for Chain {
    type Handle = AsyncResult;

    /// Publish the first step; workers publish the rest as results arrive
    async fn apply_async(&self, dispatcher: &Dispatcher) -> TaskResult<AsyncResult> {
        let mut frozen: Vec<Signature> = self.steps.iter().map(Signature::frozen).collect();
        if frozen.is_empty() {
            return Err(TaskError::config("cannot dispatch an empty chain"));
        }
        for step in &frozen[1..] {
            dispatcher.validate(step.task())?;
        }

        let ids: Vec<_> = frozen.iter().filter_map(Signature::id).collect();
        let first = frozen.remove(0);
        let first_result = dispatcher.send(&first, frozen, None).await?;

        let (last, parents) = ids
            .split_last()
            .map(|(last, parents)| (*last, parents.to_vec()))
            .unwrap_or((first_result.id(), Vec::new()));
        debug!("Dispatched chain of {} steps ending in {}", ids.len(), last);

        Ok(dispatcher.result(last).with_parents(parents))
    }
}
