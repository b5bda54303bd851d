//! Registry mapping task names to handlers

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use crate::error::{TaskError, TaskResult};
use crate::task::{FnHandler, Task, TaskDescriptor};

/// Name to handler mapping
///
/// Registration takes `&mut self`, so all tasks are registered before the
/// registry is wrapped in an `Arc` and handed to dispatchers and workers.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<TaskDescriptor>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task descriptor
    pub fn register(&mut self, descriptor: TaskDescriptor) -> TaskResult<Task> {
        let name = descriptor.name().to_string();
        if name.trim().is_empty() {
            return Err(TaskError::config("task name must not be empty"));
        }
        if self.tasks.contains_key(&name) {
            return Err(TaskError::DuplicateTask { name });
        }

        let descriptor = Arc::new(descriptor);
        self.tasks.insert(name.clone(), descriptor.clone());
        debug!("Registered task {}", name);
        Ok(Task::new(descriptor))
    }

    /// Register a typed async closure under `name`
    pub fn register_fn<F, Fut, A, R>(&mut self, name: &str, f: F) -> TaskResult<Task>
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult<R>> + Send + 'static,
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
    {
        self.register(TaskDescriptor::new(name, FnHandler::new(name, f)))
    }

    /// Look up the descriptor registered under `name`
    pub fn resolve(&self, name: &str) -> TaskResult<Arc<TaskDescriptor>> {
        self.tasks
            .get(name)
            .cloned()
            .ok_or_else(|| TaskError::UnknownTask {
                name: name.to_string(),
            })
    }

    /// Handle for an already registered task
    pub fn task(&self, name: &str) -> TaskResult<Task> {
        self.resolve(name).map(Task::new)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn register_then_resolve() {
        let mut registry = TaskRegistry::new();
        let add = registry
            .register_fn("add", |(a, b): (i64, i64)| async move { Ok(a + b) })
            .unwrap();

        assert_eq!(add.name(), "add");
        assert!(registry.contains("add"));
        let descriptor = registry.resolve("add").unwrap();
        assert_eq!(
            descriptor.invoke(vec![json!(1), json!(2)], Default::default()).await.unwrap(),
            json!(3)
        );
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = TaskRegistry::new();
        registry
            .register_fn("add", |(a, b): (i64, i64)| async move { Ok(a + b) })
            .unwrap();
        let result = registry.register_fn("add", |(a,): (i64,)| async move { Ok(a) });

        assert!(matches!(result, Err(TaskError::DuplicateTask { name }) if name == "add"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unknown_names_fail_to_resolve() {
        let registry = TaskRegistry::new();
        assert!(matches!(
            registry.resolve("nope"),
            Err(TaskError::UnknownTask { name }) if name == "nope"
        ));
    }

    #[test]
    fn empty_names_are_rejected() {
        let mut registry = TaskRegistry::new();
        let result = registry.register_fn("  ", |(a,): (i64,)| async move { Ok(a) });
        assert!(matches!(result, Err(TaskError::Config { .. })));
        assert!(registry.is_empty());
    }
}
