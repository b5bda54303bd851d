//! Composition of signatures: chains, groups, chords and the map family

use async_trait::async_trait;

use crate::dispatcher::Dispatcher;
use crate::error::TaskResult;
use crate::result::ResultHandle;

pub mod chain;
pub mod chord;
pub mod group;
pub mod map;

pub use self::chain::Chain;
pub use self::chord::Chord;
pub use self::group::Group;
pub use self::map::{Chunks, Map, Starmap};

/// Anything that can be turned into messages and awaited
#[async_trait]
pub trait Dispatch: Send + Sync {
    type Handle: ResultHandle;

    /// Publish the work and return a handle to its outcome
    async fn apply_async(&self, dispatcher: &Dispatcher) -> TaskResult<Self::Handle>;
}
