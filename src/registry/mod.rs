//! Live instance registry: idents, records, parent/child links.

use crate::cancellation::CancelChannel;
use crate::core::{Deferred, Value};
use crate::interpreter::Resumable;
use crate::pipeline::PipelineConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Runtime-wide unique identity of one pipeline instance: the pipeline id
/// paired with a fresh token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct InstanceId {
    /// The pipeline the instance executes.
    pub pipeline: Uuid,
    /// Fresh per-invocation token.
    pub token: u64,
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.pipeline, self.token)
    }
}

/// Lifecycle state of a live instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    /// Admitted but waiting for queue capacity.
    Pending,
    /// Executing or suspended on a future.
    Running,
    /// Finished, holding its queue slot until live children drain.
    WaitingChildren,
    /// Cancelled; transient, the record is removed in the same operation.
    Cancelled,
}

/// Everything the runtime tracks for one live instance.
pub(crate) struct InstanceRecord {
    pub ident: InstanceId,
    pub queue: String,
    pub args: Value,
    pub config: PipelineConfig,
    pub state: InstanceState,
    pub parent: Option<InstanceId>,
    pub children: HashSet<InstanceId>,
    pub canceller: CancelChannel,
    pub deferred: Deferred,
    /// The suspension / inline-invocation snapshot; the interpreter state
    /// exposed to interpreter-aware steps and rewritable by them.
    pub resumable: Option<Resumable>,
    pub spawned_at: DateTime<Utc>,
}

/// Index of live instances.
#[derive(Default)]
pub(crate) struct Registry {
    instances: HashMap<InstanceId, InstanceRecord>,
}

impl Registry {
    pub fn insert(&mut self, record: InstanceRecord) {
        self.instances.insert(record.ident, record);
    }

    pub fn get(&self, ident: InstanceId) -> Option<&InstanceRecord> {
        self.instances.get(&ident)
    }

    pub fn get_mut(&mut self, ident: InstanceId) -> Option<&mut InstanceRecord> {
        self.instances.get_mut(&ident)
    }

    pub fn remove(&mut self, ident: InstanceId) -> Option<InstanceRecord> {
        self.instances.remove(&ident)
    }

    pub fn contains(&self, ident: InstanceId) -> bool {
        self.instances.contains_key(&ident)
    }

    pub fn iter(&self) -> impl Iterator<Item = &InstanceRecord> {
        self.instances.values()
    }

    /// Walks up parent links to the cancel root: the first ancestor that is
    /// detached or has no live parent.
    pub fn cancel_root(&self, ident: InstanceId) -> InstanceId {
        let mut current = ident;
        while let Some(record) = self.instances.get(&current) {
            if record.config.detached {
                break;
            }
            match record.parent {
                Some(parent) if self.instances.contains_key(&parent) => current = parent,
                _ => break,
            }
        }
        current
    }

    /// Collects a subtree depth-first, leaves first (the root comes last).
    /// Detached instances are never linked as children, so they are never
    /// traversed.
    pub fn collect_subtree(&self, root: InstanceId) -> Vec<InstanceId> {
        let mut out = Vec::new();
        self.collect_into(root, &mut out);
        out
    }

    fn collect_into(&self, ident: InstanceId, out: &mut Vec<InstanceId>) {
        if let Some(record) = self.instances.get(&ident) {
            let children: Vec<InstanceId> = record.children.iter().copied().collect();
            for child in children {
                self.collect_into(child, out);
            }
            out.push(ident);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::steps;
    use crate::pipeline::Pipeline;

    fn record(token: u64, parent: Option<InstanceId>, detached: bool) -> InstanceRecord {
        let pipeline = Pipeline::builder()
            .step(steps::effect(|_input| {}))
            .build()
            .detached(detached);
        InstanceRecord {
            ident: InstanceId {
                pipeline: pipeline.id(),
                token,
            },
            queue: "q".to_string(),
            args: Value::Null,
            config: pipeline.config().clone(),
            state: InstanceState::Running,
            parent,
            children: HashSet::new(),
            canceller: CancelChannel::new(),
            deferred: Deferred::new(),
            resumable: None,
            spawned_at: Utc::now(),
        }
    }

    fn link(registry: &mut Registry, parent: InstanceId, child: InstanceId) {
        registry.get_mut(parent).unwrap().children.insert(child);
    }

    #[test]
    fn test_cancel_root_walks_to_top() {
        let mut registry = Registry::default();
        let root = record(1, None, false);
        let root_id = root.ident;
        let mid = record(2, Some(root_id), false);
        let mid_id = mid.ident;
        let leaf = record(3, Some(mid_id), false);
        let leaf_id = leaf.ident;
        registry.insert(root);
        registry.insert(mid);
        registry.insert(leaf);
        link(&mut registry, root_id, mid_id);
        link(&mut registry, mid_id, leaf_id);

        assert_eq!(registry.cancel_root(leaf_id), root_id);
    }

    #[test]
    fn test_cancel_root_stops_at_detached() {
        let mut registry = Registry::default();
        let root = record(1, None, false);
        let root_id = root.ident;
        let detached = record(2, None, true);
        let detached_id = detached.ident;
        registry.insert(root);
        registry.insert(detached);

        assert_eq!(registry.cancel_root(detached_id), detached_id);
        assert_eq!(registry.cancel_root(root_id), root_id);
    }

    #[test]
    fn test_collect_subtree_leaves_first() {
        let mut registry = Registry::default();
        let root = record(1, None, false);
        let root_id = root.ident;
        let child = record(2, Some(root_id), false);
        let child_id = child.ident;
        let grandchild = record(3, Some(child_id), false);
        let grandchild_id = grandchild.ident;
        registry.insert(root);
        registry.insert(child);
        registry.insert(grandchild);
        link(&mut registry, root_id, child_id);
        link(&mut registry, child_id, grandchild_id);

        let order = registry.collect_subtree(root_id);
        assert_eq!(order, vec![grandchild_id, child_id, root_id]);
    }
}
