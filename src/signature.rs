//! Signatures: serializable "call task T with these arguments" descriptors

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::canvas::{Chain, Dispatch};
use crate::dispatcher::Dispatcher;
use crate::error::TaskResult;
use crate::registry::TaskRegistry;
use crate::result::AsyncResult;
use crate::task::{Kwargs, RetryPolicy, TaskId};

/// Execution options carried by a signature
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignatureOptions {
    /// Invocation id fixed ahead of dispatch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    /// Queue to publish to; the dispatcher default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    /// Delay before the invocation becomes visible to workers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub countdown_ms: Option<u64>,
    /// Overrides the task's default retry policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Overrides the task's time limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit_ms: Option<u64>,
}

/// Immutable invocation descriptor
///
/// Every method that changes a field returns a new signature.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Signature {
    task: String,
    #[serde(default)]
    args: Vec<Value>,
    #[serde(default)]
    kwargs: Kwargs,
    #[serde(default)]
    options: SignatureOptions,
}

impl Signature {
    pub fn new<S: Into<String>>(task: S, args: Vec<Value>) -> Self {
        Self {
            task: task.into(),
            args,
            kwargs: Kwargs::new(),
            options: SignatureOptions::default(),
        }
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn kwargs(&self) -> &Kwargs {
        &self.kwargs
    }

    pub fn options(&self) -> &SignatureOptions {
        &self.options
    }

    /// Frozen invocation id, if any
    pub fn id(&self) -> Option<TaskId> {
        self.options.task_id
    }

    /// New signature with `args` placed before the existing arguments
    pub fn bind(&self, args: Vec<Value>) -> Self {
        let mut bound = self.clone();
        bound.args = args.into_iter().chain(self.args.iter().cloned()).collect();
        bound
    }

    /// New signature whose keyword arguments are overridden by `kwargs`
    pub fn bind_kwargs(&self, kwargs: Kwargs) -> Self {
        let mut bound = self.clone();
        bound.kwargs.extend(kwargs);
        bound
    }

    pub fn with_kwargs(mut self, kwargs: Kwargs) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_options(mut self, options: SignatureOptions) -> Self {
        self.options = options;
        self
    }

    pub fn set_queue<S: Into<String>>(mut self, queue: S) -> Self {
        self.options.queue = Some(queue.into());
        self
    }

    pub fn countdown(mut self, delay: Duration) -> Self {
        self.options.countdown_ms = Some(delay.as_millis() as u64);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.options.retry = Some(policy);
        self
    }

    pub fn time_limit(mut self, limit: Duration) -> Self {
        self.options.time_limit_ms = Some(limit.as_millis() as u64);
        self
    }

    /// Fix the invocation id this signature will be dispatched under
    pub fn freeze(mut self, id: TaskId) -> Self {
        self.options.task_id = Some(id);
        self
    }

    /// Copy with an invocation id, generating one if none is frozen yet
    pub fn frozen(&self) -> Self {
        match self.options.task_id {
            Some(_) => self.clone(),
            None => self.clone().freeze(TaskId::new_v4()),
        }
    }

    /// Chain this signature with `next`
    pub fn then(&self, next: Signature) -> Chain {
        Chain::new(vec![self.clone(), next])
    }

    /// Execute the handler in the caller's task, bypassing broker and backend
    ///
    /// Handler errors are returned exactly as the handler produced them.
    pub async fn invoke_locally(&self, registry: &TaskRegistry) -> TaskResult<Value> {
        let descriptor = registry.resolve(&self.task)?;
        descriptor
            .invoke(self.args.clone(), self.kwargs.clone())
            .await
    }

    /// Bind `args` and dispatch
    pub async fn delay(&self, dispatcher: &Dispatcher, args: Vec<Value>) -> TaskResult<AsyncResult> {
        self.bind(args).apply_async(dispatcher).await
    }
}

#[async_trait]
impl Dispatch for Signature {
    type Handle = AsyncResult;

    async fn apply_async(&self, dispatcher: &Dispatcher) -> TaskResult<AsyncResult> {
        dispatcher.send(&self.frozen(), Vec::new(), None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;
    use serde_json::json;

    #[test]
    fn bind_prepends_arguments() {
        let add = Signature::new("add", vec![]);
        let bound = add.bind(args![2]).bind(args![1]);

        assert_eq!(bound.args(), &[json!(1), json!(2)]);
        assert!(add.args().is_empty());
    }

    #[test]
    fn bind_keeps_existing_arguments_last() {
        let partial = Signature::new("add", args![1]);
        assert_eq!(partial.bind(args![2]).args(), &[json!(2), json!(1)]);
    }

    #[test]
    fn kwargs_are_overridden_not_replaced() {
        let mut base = Kwargs::new();
        base.insert("scale".into(), json!(1));
        base.insert("offset".into(), json!(0));
        let mut extra = Kwargs::new();
        extra.insert("scale".into(), json!(10));

        let sig = Signature::new("affine", args![3]).with_kwargs(base);
        let bound = sig.bind_kwargs(extra);

        assert_eq!(bound.kwargs()["scale"], json!(10));
        assert_eq!(bound.kwargs()["offset"], json!(0));
        assert_eq!(sig.kwargs()["scale"], json!(1));
    }

    #[test]
    fn frozen_keeps_an_existing_id() {
        let id = TaskId::new_v4();
        let sig = Signature::new("add", args![1, 2]).freeze(id);
        assert_eq!(sig.frozen().id(), Some(id));

        let fresh = Signature::new("add", args![1, 2]);
        assert!(fresh.id().is_none());
        assert!(fresh.frozen().id().is_some());
        assert_ne!(fresh.frozen().id(), fresh.frozen().id());
    }

    #[test]
    fn signatures_serialize_with_options() {
        let sig = Signature::new("add", args![1, 2])
            .set_queue("math")
            .countdown(Duration::from_millis(1500));
        let json = serde_json::to_value(&sig).unwrap();

        assert_eq!(json["task"], "add");
        assert_eq!(json["options"]["queue"], "math");
        assert_eq!(json["options"]["countdown_ms"], 1500);
        assert!(json["options"].get("task_id").is_none());

        let back: Signature = serde_json::from_value(json).unwrap();
        assert_eq!(back, sig);
    }
}
