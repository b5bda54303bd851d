//! Fan-out with a fan-in callback

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::{Dispatch, Group};
use crate::backend::ChordBarrier;
use crate::config::ChordFailurePolicy;
use crate::dispatcher::Dispatcher;
use crate::error::TaskResult;
use crate::message::ChordRef;
use crate::result::ChordResult;
use crate::signature::Signature;

/// A header group plus a body that runs once with every header result
///
/// Chords only run through a dispatcher: the fan-in needs the result backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chord {
    header: Group,
    body: Signature,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    policy: Option<ChordFailurePolicy>,
}

impl Chord {
    pub fn new(header: Group, body: Signature) -> Self {
        Self {
            header,
            body,
            policy: None,
        }
    }

    /// Override the dispatcher's default failure policy for this chord
    pub fn with_failure_policy(mut self, policy: ChordFailurePolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn header(&self) -> &Group {
        &self.header
    }

    pub fn body(&self) -> &Signature {
        &self.body
    }
}

#[async_trait]
impl Dispatch for Chord {
    type Handle = ChordResult;

    async fn apply_async(&self, dispatcher: &Dispatcher) -> TaskResult<ChordResult> {
        let body = self.body.frozen();
        dispatcher.validate(body.task())?;

        let members: Vec<Signature> = self.header.members().iter().map(Signature::frozen).collect();
        if members.is_empty() {
            let body_result = dispatcher
                .send(&body.bind(vec![Value::Array(Vec::new())]), Vec::new(), None)
                .await?;
            return Ok(ChordResult::new(dispatcher.group_result(Vec::new()), body_result));
        }

        let policy = self
            .policy
            .unwrap_or(dispatcher.config().chord_failure_policy);
        let header_ids = members.iter().filter_map(Signature::id).collect();
        let barrier = ChordBarrier::new(body, header_ids, policy);

        // The barrier must exist before any member can finish and decrement it.
        dispatcher.backend().init_barrier(&barrier).await?;
        debug!("Chord barrier {} initialized with {} members", barrier.id, barrier.size());

        let mut header_results = Vec::with_capacity(members.len());
        for (index, member) in members.iter().enumerate() {
            let chord = ChordRef {
                barrier_id: barrier.id,
                index,
            };
            header_results.push(dispatcher.send(member, Vec::new(), Some(chord)).await?);
        }

        info!("Dispatched chord {} ({} header members, {:?})", barrier.id, members.len(), policy);
        Ok(ChordResult::new(
            dispatcher.group_result(header_results),
            dispatcher.result(barrier.id),
        ))
    }
}
