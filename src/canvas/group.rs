//! Parallel fan-out with ordered results

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{Chord, Dispatch};
use crate::dispatcher::Dispatcher;
use crate::error::TaskResult;
use crate::registry::TaskRegistry;
use crate::result::GroupResult;
use crate::signature::Signature;

/// Independent signatures whose results are collected in member order
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Group {
    members: Vec<Signature>,
}

impl Group {
    pub fn new<I>(members: I) -> Self
    where
        I: IntoIterator<Item = Signature>,
    {
        Self {
            members: members.into_iter().collect(),
        }
    }

    pub fn members(&self) -> &[Signature] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// New group where every member has `args` prepended
    pub fn bind(&self, args: Vec<Value>) -> Group {
        Group {
            members: self.members.iter().map(|m| m.bind(args.clone())).collect(),
        }
    }

    /// Chord with this group as header
    pub fn chord(&self, body: Signature) -> Chord {
        Chord::new(self.clone(), body)
    }

    /// Run every member in the caller's task, in order
    pub async fn call(&self, registry: &TaskRegistry) -> TaskResult<Vec<Value>> {
        let mut values = Vec::with_capacity(self.members.len());
        for member in &self.members {
            values.push(member.invoke_locally(registry).await?);
        }
        Ok(values)
    }
}

impl FromIterator<Signature> for Group {
    fn from_iter<I: IntoIterator<Item = Signature>>(iter: I) -> Self {
        Group::new(iter)
    }
}

#[async_trait]
impl Dispatch for Group {
    type Handle = GroupResult;

    async fn apply_async(&self, dispatcher: &Dispatcher) -> TaskResult<GroupResult> {
        let mut results = Vec::with_capacity(self.members.len());
        for member in &self.members {
            results.push(dispatcher.send(&member.frozen(), Vec::new(), None).await?);
        }
        debug!("Dispatched group of {} members", results.len());
        Ok(dispatcher.group_result(results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;
    use serde_json::json;

    #[tokio::test]
    async fn local_group_returns_every_result() {
        let mut registry = TaskRegistry::new();
        let add = registry
            .register_fn("add", |(a, b): (i64, i64)| async move { Ok(a + b) })
            .unwrap();

        let group = Group::new([add.s(args![1, 2]), add.s(args![3, 4])]);
        assert_eq!(group.call(&registry).await.unwrap(), vec![json!(3), json!(7)]);
    }

    #[tokio::test]
    async fn bound_group_prepends_to_every_member() {
        let mut registry = TaskRegistry::new();
        let add = registry
            .register_fn("add", |(a, b): (i64, i64)| async move { Ok(a + b) })
            .unwrap();

        let group: Group = [add.s(args![1]), add.s(args![2])].into_iter().collect();
        let bound = group.bind(args![10]);

        assert_eq!(bound.members()[0].args(), &[json!(10), json!(1)]);
        assert_eq!(bound.call(&registry).await.unwrap(), vec![json!(11), json!(12)]);
    }
}
