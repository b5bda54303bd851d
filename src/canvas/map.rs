//! Map, starmap and chunks: one task applied over many argument sets
//!
//! None of these have a `bind`: a partial argument cannot be spread over
//! many invocations in a meaningful way, so they are never bindable.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{Dispatch, Group};
use crate::dispatcher::Dispatcher;
use crate::error::{TaskError, TaskResult};
use crate::message::{ExecutionMode, InvocationMessage};
use crate::registry::TaskRegistry;
use crate::result::{ChunksResult, GroupResult};
use crate::signature::{Signature, SignatureOptions};
use crate::task::{Kwargs, TaskId};

/// One invocation per item, the item being the only argument
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Map {
    task: String,
    items: Vec<Value>,
    #[serde(default)]
    options: SignatureOptions,
}

impl Map {
    pub fn new<S, I>(task: S, items: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = Value>,
    {
        Self {
            task: task.into(),
            items: items.into_iter().collect(),
            options: SignatureOptions::default(),
        }
    }

    pub fn set_queue<S: Into<String>>(mut self, queue: S) -> Self {
        self.options.queue = Some(queue.into());
        self
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    fn group(&self) -> Group {
        self.items
            .iter()
            .map(|item| Signature::new(self.task.clone(), vec![item.clone()]).with_options(self.options.clone()))
            .collect()
    }

    pub async fn call(&self, registry: &TaskRegistry) -> TaskResult<Vec<Value>> {
        self.group().call(registry).await
    }
}

#[async_trait]
impl Dispatch for Map {
    type Handle = GroupResult;

    async fn apply_async(&self, dispatcher: &Dispatcher) -> TaskResult<GroupResult> {
        self.group().apply_async(dispatcher).await
    }
}

/// One invocation per item, the item unpacked into positional arguments
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Starmap {
    task: String,
    items: Vec<Vec<Value>>,
    #[serde(default)]
    options: SignatureOptions,
}

impl Starmap {
    pub fn new<S, I>(task: S, items: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = Vec<Value>>,
    {
        Self {
            task: task.into(),
            items: items.into_iter().collect(),
            options: SignatureOptions::default(),
        }
    }

    pub fn set_queue<S: Into<String>>(mut self, queue: S) -> Self {
        self.options.queue = Some(queue.into());
        self
    }

    pub fn items(&self) -> &[Vec<Value>] {
        &self.items
    }

    fn group(&self) -> Group {
        self.items
            .iter()
            .map(|args| Signature::new(self.task.clone(), args.clone()).with_options(self.options.clone()))
            .collect()
    }

    pub async fn call(&self, registry: &TaskRegistry) -> TaskResult<Vec<Value>> {
        self.group().call(registry).await
    }
}

#[async_trait]
impl Dispatch for Starmap {
    type Handle = GroupResult;

    async fn apply_async(&self, dispatcher: &Dispatcher) -> TaskResult<GroupResult> {
        self.group().apply_async(dispatcher).await
    }
}

/// A starmap split into messages of at most `size` argument lists
///
/// Each message is executed by a single worker, which calls the handler once
/// per argument list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunks {
    task: String,
    items: Vec<Vec<Value>>,
    size: usize,
    #[serde(default)]
    options: SignatureOptions,
}

impl Chunks {
    pub fn new<S, I>(task: S, items: I, size: usize) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = Vec<Value>>,
    {
        Self {
            task: task.into(),
            items: items.into_iter().collect(),
            size,
            options: SignatureOptions::default(),
        }
    }

    pub fn set_queue<S: Into<String>>(mut self, queue: S) -> Self {
        self.options.queue = Some(queue.into());
        self
    }

    /// Argument lists grouped per message
    pub fn partition(&self) -> TaskResult<Vec<Vec<Vec<Value>>>> {
        if self.size == 0 {
            return Err(TaskError::config("chunk size must be at least 1"));
        }
        Ok(self.items.chunks(self.size).map(<[Vec<Value>]>::to_vec).collect())
    }

    /// Run every item in the caller's task; the result is flat, like `get`
    pub async fn call(&self, registry: &TaskRegistry) -> TaskResult<Vec<Value>> {
        let descriptor = registry.resolve(&self.task)?;
        let mut values = Vec::with_capacity(self.items.len());
        for chunk in self.partition()? {
            for args in chunk {
                values.push(descriptor.invoke(args, Kwargs::new()).await?);
            }
        }
        Ok(values)
    }
}

#[async_trait]
impl Dispatch for Chunks {
    type Handle = ChunksResult;

    async fn apply_async(&self, dispatcher: &Dispatcher) -> TaskResult<ChunksResult> {
        let partitions = self.partition()?;
        let template = Signature::new(self.task.clone(), Vec::new()).with_options(self.options.clone());

        let mut results = Vec::with_capacity(partitions.len());
        for items in partitions {
            let id = TaskId::new_v4();
            let message = InvocationMessage::from_signature(&template, id)
                .with_mode(ExecutionMode::Chunk { items });
            dispatcher.send_message(&message).await?;
            results.push(dispatcher.result(id));
        }

        debug!("Dispatched {} chunks of {} for {}", results.len(), self.size, self.task);
        Ok(ChunksResult::new(dispatcher.group_result(results)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;
    use serde_json::json;

    fn registry() -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry
            .register_fn("add", |(a, b): (i64, i64)| async move { Ok(a + b) })
            .unwrap();
        registry
            .register_fn("sum_task", |(numbers,): (Vec<i64>,)| async move {
                Ok(numbers.iter().sum::<i64>())
            })
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn map_passes_each_item_as_the_only_argument() {
        let registry = registry();
        let map = registry.task("sum_task").unwrap().map([json!([1, 2]), json!([3, 4])]);
        assert_eq!(map.call(&registry).await.unwrap(), vec![json!(3), json!(7)]);
    }

    #[tokio::test]
    async fn starmap_unpacks_each_item() {
        let registry = registry();
        let starmap = registry.task("add").unwrap().starmap([args![1, 2], args![3, 4]]);
        assert_eq!(starmap.call(&registry).await.unwrap(), vec![json!(3), json!(7)]);
    }

    #[test]
    fn chunks_partition_with_a_short_tail() {
        let items = (0..10).map(|i| args![i, i]);
        let chunks = Chunks::new("add", items, 3);
        let sizes: Vec<usize> = chunks.partition().unwrap().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![3, 3, 3, 1]);
    }

    #[test]
    fn zero_sized_chunks_are_rejected() {
        let chunks = Chunks::new("add", [args![1, 2]], 0);
        assert!(matches!(chunks.partition(), Err(TaskError::Config { .. })));
    }

    #[tokio::test]
    async fn local_chunks_match_the_elementwise_map() {
        let registry = registry();
        let add = registry.task("add").unwrap();
        let items: Vec<_> = (0..10).map(|i| args![i, i]).collect();

        let chunked = add.chunks(items.clone(), 3).call(&registry).await.unwrap();
        let elementwise = add.starmap(items).call(&registry).await.unwrap();
        assert_eq!(chunked, elementwise);
    }
}
