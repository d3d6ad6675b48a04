//! A naive, simple oracle implementation for differential testing.
use collab_crdt::chat::ChatEntry;
use collab_crdt::core::{OpId, StateVector};
use collab_crdt::replica::Operation;
use collab_crdt::text::TextOp;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Element {
    id: OpId,
    value: char,
    after: Option<OpId>,
}

/// Text sequence that rebuilds the whole RGA tree on every query.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Sequence {
    elements: BTreeMap<OpId, Element>,
    deleted: BTreeSet<OpId>,
}

impl Sequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, op: TextOp) {
        match op {
            TextOp::Insert {
                id,
                value,
                origin_left,
                ..
            } => {
                self.elements.entry(id).or_insert(Element {
                    id,
                    value,
                    after: origin_left,
                });
            }
            TextOp::Delete { target, .. } => {
                self.deleted.insert(target);
            }
        }
    }

    pub fn text(&self) -> String {
        let mut children: BTreeMap<Option<OpId>, Vec<OpId>> = BTreeMap::new();
        for elem in self.elements.values() {
            // Elements whose origin never arrived stay invisible.
            if elem.after.is_some_and(|after| !self.elements.contains_key(&after)) {
                continue;
            }
            children.entry(elem.after).or_default().push(elem.id);
        }
        for ids in children.values_mut() {
            ids.sort_by(|a, b| b.cmp(a));
        }

        let mut ordered = Vec::with_capacity(self.elements.len());
        Self::walk_children(None, &children, &mut ordered);
        ordered
            .into_iter()
            .filter(|id| !self.deleted.contains(id))
            .filter_map(|id| self.elements.get(&id).map(|elem| elem.value))
            .collect()
    }

    fn walk_children(
        parent: Option<OpId>,
        children: &BTreeMap<Option<OpId>, Vec<OpId>>,
        out: &mut Vec<OpId>,
    ) {
        if let Some(kids) = children.get(&parent) {
            for id in kids {
                out.push(*id);
                Self::walk_children(Some(*id), children, out);
            }
        }
    }
}

/// Chat log that re-sorts everything on every read.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChatOracle {
    entries: BTreeMap<OpId, ChatEntry>,
}

impl ChatOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, entry: ChatEntry) {
        self.entries.entry(entry.stamp).or_insert(entry);
    }

    pub fn texts(&self) -> Vec<String> {
        let mut entries: Vec<&ChatEntry> = self.entries.values().collect();
        entries.sort_by_key(|entry| (entry.stamp.counter, entry.wall_clock, entry.stamp.replica));
        entries.into_iter().map(|entry| entry.text.clone()).collect()
    }
}

/// Operation set keyed by id, with no ordering constraints.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncOracle {
    ops: BTreeMap<OpId, Operation>,
}

impl SyncOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, op: Operation) {
        self.ops.entry(op.id()).or_insert(op);
    }

    pub fn state_vector(&self) -> StateVector {
        let mut sv = StateVector::new();
        for id in self.ops.keys() {
            let current = sv.get(id.replica).unwrap_or(0);
            if id.counter > current {
                sv.set(id.replica, id.counter);
            }
        }
        sv
    }

    pub fn changes_since(&self, since: &StateVector) -> Vec<Operation> {
        self.ops
            .iter()
            .filter(|(id, _)| id.counter > since.get(id.replica).unwrap_or(0))
            .map(|(_, op)| op.clone())
            .collect()
    }

    pub fn same_state(&self, other: &Self) -> bool {
        self.ops == other.ops
    }
}
