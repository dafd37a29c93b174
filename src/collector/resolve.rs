use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::graph::DependencyGraph;
use crate::record::RecordKey;
use crate::schema::DeletionPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionMethod {
    HardDelete,
    SoftDelete,
    Skip,
}

impl DeletionMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            DeletionMethod::HardDelete => "hard_delete",
            DeletionMethod::SoftDelete => "soft_delete",
            DeletionMethod::Skip => "skip",
        }
    }
}

/// Outcome per visited record. Records the traversal never reached have none.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    outcomes: HashMap<RecordKey, DeletionMethod>,
    order: Vec<RecordKey>,
}

impl Resolution {
    fn record(&mut self, key: RecordKey, method: DeletionMethod) {
        if self.outcomes.insert(key.clone(), method).is_none() {
            self.order.push(key);
        }
    }

    /// Every discovered record is physically removed.
    pub fn purge(graph: &DependencyGraph) -> Self {
        let mut resolution = Self::default();
        for (model, pks) in graph.records() {
            for pk in pks {
                resolution.record(RecordKey::new(model.clone(), *pk), DeletionMethod::HardDelete);
            }
        }
        resolution
    }

    pub fn get(&self, key: &RecordKey) -> Option<DeletionMethod> {
        self.outcomes.get(key).copied()
    }

    /// Resolved records in the order their outcome was decided.
    pub fn iter(&self) -> impl Iterator<Item = (&RecordKey, DeletionMethod)> {
        self.order.iter().map(|key| (key, self.outcomes[key]))
    }

    pub fn count(&self, method: DeletionMethod) -> usize {
        self.outcomes.values().filter(|m| **m == method).count()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

struct Frame<'g> {
    key: &'g RecordKey,
    inherited_safe: bool,
    tainted: bool,
    soft_deletable: bool,
    children: &'g [RecordKey],
    next: usize,
    child_safe: bool,
    child_delete_related: bool,
}

impl Frame<'_> {
    fn outcome(&self) -> DeletionMethod {
        if self.soft_deletable && !self.tainted {
            DeletionMethod::SoftDelete
        } else if self.inherited_safe {
            DeletionMethod::Skip
        } else {
            DeletionMethod::HardDelete
        }
    }

    fn child_tainted(&self) -> bool {
        self.tainted || !self.soft_deletable
    }
}

fn enter<'g, F>(
    graph: &'g DependencyGraph,
    key: &'g RecordKey,
    safe_deletion: bool,
    delete_related: bool,
    tainted: bool,
    policy_of: &F,
) -> Frame<'g>
where
    F: Fn(&str) -> Option<DeletionPolicy>,
{
    let policy = policy_of(&key.model);
    let (child_safe, child_delete_related) = match policy {
        Some(policy) => (policy.safe_deletion, policy.delete_related),
        None => (safe_deletion, delete_related),
    };
    let children = if child_delete_related {
        graph.children(key)
    } else {
        &[]
    };
    Frame {
        key,
        inherited_safe: safe_deletion,
        tainted,
        soft_deletable: policy.is_some(),
        children,
        next: 0,
        child_safe,
        child_delete_related,
    }
}

/// Assigns a deletion method to every record reachable from the roots.
///
/// Depth-first from each root, carrying the active `safe_deletion` and
/// `delete_related` values plus a taint flag set once the path crosses a
/// record without a policy. `policy_of` returns `None` for plain models.
/// A record reached twice keeps the outcome of the first path.
///
/// A dependent that a previous run already soft-deleted, reached on a path
/// where it would be soft-deleted again, gets no outcome and is not
/// descended into: its timestamp stays as it is.
pub fn resolve<F>(graph: &DependencyGraph, defaults: DeletionPolicy, policy_of: F) -> Resolution
where
    F: Fn(&str) -> Option<DeletionPolicy>,
{
    let mut seen: HashSet<&RecordKey> = HashSet::new();
    let mut resolution = Resolution::default();

    for root in graph.roots() {
        if !seen.insert(root) {
            continue;
        }
        let mut stack = vec![enter(
            graph,
            root,
            defaults.safe_deletion,
            defaults.delete_related,
            false,
            &policy_of,
        )];

        while let Some(frame) = stack.last_mut() {
            match frame.children.get(frame.next) {
                Some(child) => {
                    frame.next += 1;
                    if seen.insert(child) {
                        if graph.already_deleted(child)
                            && !frame.child_tainted()
                            && policy_of(&child.model).is_some()
                        {
                            continue;
                        }
                        let next = enter(
                            graph,
                            child,
                            frame.child_safe,
                            frame.child_delete_related,
                            frame.child_tainted(),
                            &policy_of,
                        );
                        stack.push(next);
                    }
                }
                None => {
                    let key = frame.key.clone();
                    let outcome = frame.outcome();
                    stack.pop();
                    resolution.record(key, outcome);
                }
            }
        }
    }

    resolution
}
