//! Wire format of the messages workers consume

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TaskResult;
use crate::signature::{Signature, SignatureOptions};
use crate::task::{Kwargs, TaskId};

/// How a worker invokes the handler for a message
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One call with the message's args and kwargs
    #[default]
    Call,
    /// One call per argument list; the result is the list of call results
    Chunk { items: Vec<Vec<Value>> },
}

/// Position of a message inside a chord header
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChordRef {
    pub barrier_id: TaskId,
    pub index: usize,
}

/// A single unit of work on the transport
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvocationMessage {
    pub id: TaskId,
    pub task: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Kwargs,
    #[serde(default)]
    pub options: SignatureOptions,
    /// Retries performed before this delivery
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Remaining chain steps, each with a frozen id
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub continuation: Vec<Signature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chord: Option<ChordRef>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<DateTime<Utc>>,
}

impl InvocationMessage {
    /// Build the message for a signature dispatched under `id`
    pub fn from_signature(signature: &Signature, id: TaskId) -> Self {
        let now = Utc::now();
        let eta = signature
            .options()
            .countdown_ms
            .map(|ms| now + chrono::Duration::milliseconds(ms as i64));

        Self {
            id,
            task: signature.task().to_string(),
            args: signature.args().to_vec(),
            kwargs: signature.kwargs().clone(),
            options: signature.options().clone(),
            retries: 0,
            mode: ExecutionMode::Call,
            continuation: Vec::new(),
            chord: None,
            created_at: now,
            eta,
        }
    }

    pub fn with_continuation(mut self, continuation: Vec<Signature>) -> Self {
        self.continuation = continuation;
        self
    }

    pub fn with_chord(mut self, chord: Option<ChordRef>) -> Self {
        self.chord = chord;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn queue(&self) -> Option<&str> {
        self.options.queue.as_deref()
    }

    /// Ids of every chain step that has not run yet
    pub fn pending_step_ids(&self) -> Vec<TaskId> {
        self.continuation.iter().filter_map(Signature::id).collect()
    }

    pub fn encode(&self) -> TaskResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> TaskResult<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}
