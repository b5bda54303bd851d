//! # Task Canvas
//!
//! A distributed task queue with composable workflows, using Rust and Redis.
//!
//! ## Features
//!
//! - Named task registry with typed handlers
//! - Signatures: serializable, bindable descriptions of a single invocation
//! - Workflow primitives: chain, group, chord, map, starmap and chunks
//! - Redis-backed reliable queues with delayed delivery
//! - Retries with backoff and per-task time limits
//! - Result storage and awaitable result handles
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use task_canvas::{args, AppConfig, Dispatcher, TaskRegistry};
//!
//! # async fn run() -> task_canvas::TaskResult<()> {
//! let mut registry = TaskRegistry::new();
//! let add = registry.register_fn("add", |(a, b): (i64, i64)| async move { Ok(a + b) })?;
//!
//! let dispatcher = Dispatcher::connect(AppConfig::from_env()?)
//!     .await?
//!     .with_registry(Arc::new(registry));
//!
//! let workflow = add.s(args![2, 2]).then(add.s(args![4]));
//! let total = dispatcher
//!     .apply_and_wait(&workflow, Some(Duration::from_secs(10)))
//!     .await?;
//! assert_eq!(total, 8);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod broker;
pub mod canvas;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod registry;
pub mod result;
pub mod signature;
pub mod task;
pub mod worker;

// Re-export commonly used types
pub use backend::{ChordBarrier, MemoryBackend, RedisBackend, ResultBackend};
pub use broker::{Broker, Delivery, MemoryBroker, RedisBroker};
pub use canvas::{Chain, Chord, Chunks, Dispatch, Group, Map, Starmap};
pub use config::{AppConfig, ChordFailurePolicy};
pub use dispatcher::Dispatcher;
pub use error::{ErrorInfo, ErrorKind, TaskError, TaskResult};
pub use registry::TaskRegistry;
pub use result::{AsyncResult, ChordResult, ChunksResult, GroupResult, ResultHandle};
pub use signature::{Signature, SignatureOptions};
pub use task::{Kwargs, RetryPolicy, Task, TaskDescriptor, TaskHandler, TaskId, TaskMeta, TaskState};
pub use worker::{Worker, WorkerConfig, WorkerStats};

/// Version of the task canvas library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build a positional argument list, converting each expression to JSON
///
/// ```
/// use task_canvas::args;
///
/// assert_eq!(args![1, "two"], vec![serde_json::json!(1), serde_json::json!("two")]);
/// ```
#[macro_export]
macro_rules! args {
    ($($arg:expr),* $(,)?) => {
        vec![$($crate::__private::json!($arg)),*]
    };
}

#[doc(hidden)]
pub mod __private {
    pub use serde_json::json;
}
