//! Replicated plain-text sequence.
//!
//! Every character ever inserted lives in an arena keyed by its [`OpId`],
//! together with the ids of the neighbours it was typed between. Deleting
//! only sets a tombstone flag, so a remote operation that points at a
//! deleted character still resolves.
//!
//! Ordering follows RGA: the characters that share a left origin are laid
//! out by descending id, each followed by its own descendants. Because ids
//! come from a [`CausalClock`], a character always compares greater than
//! its left origin, which lets integration run as a single left-to-right
//! scan instead of a tree rebuild.

use crate::core::{CausalClock, OpId, StateVector};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

pub mod snapshot;

pub use snapshot::{EncodedItem, EncodedState, SnapshotError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharItem {
    pub id: OpId,
    pub value: char,
    pub origin_left: Option<OpId>,
    pub origin_right: Option<OpId>,
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextOp {
    Insert {
        id: OpId,
        value: char,
        origin_left: Option<OpId>,
        origin_right: Option<OpId>,
    },
    Delete {
        id: OpId,
        target: OpId,
    },
}

impl TextOp {
    pub fn id(&self) -> OpId {
        match self {
            TextOp::Insert { id, .. } | TextOp::Delete { id, .. } => *id,
        }
    }
}

/// A visible change produced by integrating an operation.
///
/// Indices are positions in the visible character sequence at the moment the
/// change happened, so a list of changes can be replayed in order against a
/// plain string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextChange {
    Inserted { index: usize, value: char },
    Deleted { index: usize, value: char },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedEffect {
    pub changes: Vec<TextChange>,
    /// The operation was retained until a dependency arrives.
    pub deferred: bool,
}

impl AppliedEffect {
    pub fn is_noop(&self) -> bool {
        self.changes.is_empty() && !self.deferred
    }

    fn deferred() -> Self {
        Self {
            changes: Vec::new(),
            deferred: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TextError {
    #[error("position {position} is out of bounds for length {len}")]
    PositionOutOfBounds { position: usize, len: usize },
    #[error("operation {op} references unknown origin {missing}")]
    UnresolvedDependency { op: OpId, missing: OpId },
    #[error("operation {op} does not follow its origin {origin}")]
    CausalityViolation { op: OpId, origin: OpId },
}

#[derive(Debug, Default, Clone)]
pub struct TextDocument {
    items: HashMap<OpId, CharItem>,
    order: Vec<OpId>,
    deletes: BTreeMap<OpId, OpId>,
    pending_inserts: BTreeMap<OpId, Vec<TextOp>>,
    pending_deletes: BTreeMap<OpId, Vec<OpId>>,
    parked: BTreeSet<OpId>,
    visible: usize,
}

impl TextDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of visible characters.
    pub fn len(&self) -> usize {
        self.visible
    }

    pub fn is_empty(&self) -> bool {
        self.visible == 0
    }

    pub fn visible_text(&self) -> String {
        self.visible_items().map(|item| item.value).collect()
    }

    pub fn visible_items(&self) -> impl Iterator<Item = &CharItem> {
        self.order
            .iter()
            .filter_map(|id| self.items.get(id))
            .filter(|item| !item.deleted)
    }

    pub fn get(&self, id: &OpId) -> Option<&CharItem> {
        self.items.get(id)
    }

    /// All items in document order, tombstones included.
    pub fn iter_all(&self) -> impl Iterator<Item = &CharItem> {
        self.order.iter().filter_map(|id| self.items.get(id))
    }

    /// Number of operations waiting on a dependency.
    pub fn pending_count(&self) -> usize {
        self.parked.len() + self.pending_deletes.values().map(Vec::len).sum::<usize>()
    }

    pub fn contains(&self, id: &OpId) -> bool {
        self.items.contains_key(id) || self.deletes.contains_key(id) || self.parked.contains(id)
    }

    pub fn local_insert(
        &mut self,
        clock: &mut CausalClock,
        position: usize,
        value: char,
    ) -> Result<TextOp, TextError> {
        if position > self.visible {
            return Err(TextError::PositionOutOfBounds {
                position,
                len: self.visible,
            });
        }
        let origin_left = match position {
            0 => None,
            _ => self.visible_id_at(position - 1),
        };
        let origin_right = self.visible_id_at(position);
        let id = self.fresh_id(clock);
        let op = TextOp::Insert {
            id,
            value,
            origin_left,
            origin_right,
        };
        self.integrate(CharItem {
            id,
            value,
            origin_left,
            origin_right,
            deleted: false,
        });
        Ok(op)
    }

    pub fn insert_str(
        &mut self,
        clock: &mut CausalClock,
        position: usize,
        text: &str,
    ) -> Result<Vec<TextOp>, TextError> {
        let mut ops = Vec::with_capacity(text.len());
        for (offset, value) in text.chars().enumerate() {
            ops.push(self.local_insert(clock, position + offset, value)?);
        }
        Ok(ops)
    }

    /// Tombstones the visible character at `position`.
    pub fn local_delete(
        &mut self,
        clock: &mut CausalClock,
        position: usize,
    ) -> Result<Option<TextOp>, TextError> {
        let target = self
            .visible_id_at(position)
            .ok_or(TextError::PositionOutOfBounds {
                position,
                len: self.visible,
            })?;
        Ok(self.delete_item(clock, target))
    }

    pub fn delete_range(
        &mut self,
        clock: &mut CausalClock,
        position: usize,
        len: usize,
    ) -> Result<Vec<TextOp>, TextError> {
        let end = position
            .checked_add(len)
            .filter(|end| *end <= self.visible)
            .ok_or(TextError::PositionOutOfBounds {
                position: position.saturating_add(len),
                len: self.visible,
            })?;
        let targets: Vec<OpId> = self
            .visible_items()
            .skip(position)
            .take(end - position)
            .map(|item| item.id)
            .collect();
        Ok(targets
            .into_iter()
            .filter_map(|target| self.delete_item(clock, target))
            .collect())
    }

    /// Tombstones `target`. Returns `None` when it is unknown or already deleted.
    pub fn delete_item(&mut self, clock: &mut CausalClock, target: OpId) -> Option<TextOp> {
        match self.items.get(&target) {
            Some(item) if !item.deleted => {}
            _ => return None,
        }
        let id = self.fresh_id(clock);
        self.deletes.insert(id, target);
        self.tombstone(target);
        Some(TextOp::Delete { id, target })
    }

    pub fn apply_remote(&mut self, op: TextOp) -> Result<AppliedEffect, TextError> {
        match op {
            TextOp::Insert {
                id,
                value,
                origin_left,
                origin_right,
            } => {
                if self.items.contains_key(&id) || self.parked.contains(&id) {
                    return match self.missing_origin(origin_left, origin_right) {
                        Some(missing) if self.parked.contains(&id) => {
                            Err(TextError::UnresolvedDependency { op: id, missing })
                        }
                        _ => Ok(AppliedEffect::default()),
                    };
                }
                for origin in [origin_left, origin_right].into_iter().flatten() {
                    if origin.counter >= id.counter {
                        return Err(TextError::CausalityViolation { op: id, origin });
                    }
                }
                let item = CharItem {
                    id,
                    value,
                    origin_left,
                    origin_right,
                    deleted: false,
                };
                if let Some(missing) = self.missing_origin(origin_left, origin_right) {
                    self.park(missing, item);
                    return Err(TextError::UnresolvedDependency { op: id, missing });
                }
                let mut effect = AppliedEffect::default();
                effect.changes.extend(self.integrate(item));
                self.process_pending(id, &mut effect);
                Ok(effect)
            }
            TextOp::Delete { id, target } => {
                if self.deletes.contains_key(&id) {
                    return Ok(AppliedEffect::default());
                }
                self.deletes.insert(id, target);
                if !self.items.contains_key(&target) {
                    self.pending_deletes.entry(target).or_default().push(id);
                    return Ok(AppliedEffect::deferred());
                }
                let mut effect = AppliedEffect::default();
                effect.changes.extend(self.tombstone(target));
                Ok(effect)
            }
        }
    }

    /// Every operation this document holds, integrated or parked.
    pub fn ops(&self) -> Vec<TextOp> {
        let mut ops: Vec<TextOp> = self
            .items
            .values()
            .map(|item| TextOp::Insert {
                id: item.id,
                value: item.value,
                origin_left: item.origin_left,
                origin_right: item.origin_right,
            })
            .chain(self.pending_inserts.values().flatten().cloned())
            .chain(
                self.deletes
                    .iter()
                    .map(|(id, target)| TextOp::Delete {
                        id: *id,
                        target: *target,
                    }),
            )
            .collect();
        ops.sort_by_key(TextOp::id);
        ops
    }

    pub fn state_vector(&self) -> StateVector {
        let mut sv = StateVector::new();
        for id in self
            .items
            .keys()
            .chain(self.deletes.keys())
            .chain(self.parked.iter())
        {
            sv.observe(*id);
        }
        sv
    }

    fn fresh_id(&self, clock: &mut CausalClock) -> OpId {
        loop {
            let id = clock.next_id();
            if !self.contains(&id) {
                return id;
            }
            tracing::error!(%id, "operation id collision, reissuing");
        }
    }

    fn visible_id_at(&self, position: usize) -> Option<OpId> {
        self.visible_items().nth(position).map(|item| item.id)
    }

    fn position_of(&self, id: &OpId) -> Option<usize> {
        self.order.iter().position(|candidate| candidate == id)
    }

    fn visible_before(&self, position: usize) -> usize {
        self.order[..position]
            .iter()
            .filter(|id| self.items.get(*id).is_some_and(|item| !item.deleted))
            .count()
    }

    fn missing_origin(&self, left: Option<OpId>, right: Option<OpId>) -> Option<OpId> {
        [left, right]
            .into_iter()
            .flatten()
            .find(|origin| !self.items.contains_key(origin))
    }

    fn park(&mut self, missing: OpId, item: CharItem) {
        self.parked.insert(item.id);
        self.pending_inserts
            .entry(missing)
            .or_default()
            .push(TextOp::Insert {
                id: item.id,
                value: item.value,
                origin_left: item.origin_left,
                origin_right: item.origin_right,
            });
    }

    /// Places `item` after its left origin, skipping every item with a
    /// greater id: those are newer siblings or their descendants.
    fn integrate(&mut self, item: CharItem) -> Option<TextChange> {
        let mut position = match item.origin_left {
            None => 0,
            Some(left) => self.position_of(&left).map_or(0, |p| p + 1),
        };
        while position < self.order.len() && self.order[position] > item.id {
            position += 1;
        }

        let change = (!item.deleted).then(|| TextChange::Inserted {
            index: self.visible_before(position),
            value: item.value,
        });
        if !item.deleted {
            self.visible += 1;
        }
        self.order.insert(position, item.id);
        self.items.insert(item.id, item);
        change
    }

    fn tombstone(&mut self, target: OpId) -> Option<TextChange> {
        let position = self.position_of(&target)?;
        let index = self.visible_before(position);
        let item = self.items.get_mut(&target)?;
        if item.deleted {
            return None;
        }
        item.deleted = true;
        self.visible -= 1;
        Some(TextChange::Deleted {
            index,
            value: item.value,
        })
    }

    fn process_pending(&mut self, inserted: OpId, effect: &mut AppliedEffect) {
        let mut queue = VecDeque::from([inserted]);
        while let Some(id) = queue.pop_front() {
            if let Some(deletes) = self.pending_deletes.remove(&id)
                && !deletes.is_empty()
            {
                effect.changes.extend(self.tombstone(id));
            }
            let Some(waiting) = self.pending_inserts.remove(&id) else {
                continue;
            };
            for op in waiting {
                let TextOp::Insert {
                    id,
                    value,
                    origin_left,
                    origin_right,
                } = op
                else {
                    continue;
                };
                let item = CharItem {
                    id,
                    value,
                    origin_left,
                    origin_right,
                    deleted: false,
                };
                if let Some(missing) = self.missing_origin(origin_left, origin_right) {
                    self.pending_inserts
                        .entry(missing)
                        .or_default()
                        .push(TextOp::Insert {
                            id,
                            value,
                            origin_left,
                            origin_right,
                        });
                    continue;
                }
                self.parked.remove(&id);
                effect.changes.extend(self.integrate(item));
                queue.push_back(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn typed(replica: u64, text: &str) -> (TextDocument, CausalClock, Vec<TextOp>) {
        let mut doc = TextDocument::new();
        let mut clock = CausalClock::new(replica);
        let ops = doc.insert_str(&mut clock, 0, text).unwrap();
        (doc, clock, ops)
    }

    #[test]
    fn test_local_insert_is_visible_at_position() {
        let (mut doc, mut clock, _) = typed(1, "hllo");
        doc.local_insert(&mut clock, 1, 'e').unwrap();
        assert_eq!(doc.visible_text(), "hello");
        assert_eq!(doc.len(), 5);
    }

    #[test]
    fn test_local_insert_records_origins() {
        let (mut doc, mut clock, ops) = typed(1, "ac");
        let op = doc.local_insert(&mut clock, 1, 'b').unwrap();
        let TextOp::Insert {
            origin_left,
            origin_right,
            ..
        } = op
        else {
            panic!("expected insert");
        };
        assert_eq!(origin_left, Some(ops[0].id()));
        assert_eq!(origin_right, Some(ops[1].id()));
    }

    #[test]
    fn test_local_insert_out_of_bounds() {
        let (mut doc, mut clock, _) = typed(1, "ab");
        let err = doc.local_insert(&mut clock, 3, 'x').unwrap_err();
        assert_eq!(err, TextError::PositionOutOfBounds { position: 3, len: 2 });
    }

    #[test]
    fn test_delete_range_rejects_overflowing_length() {
        let (mut doc, mut clock, _) = typed(1, "hello");
        let err = doc.delete_range(&mut clock, 1, usize::MAX).unwrap_err();
        assert_eq!(
            err,
            TextError::PositionOutOfBounds {
                position: usize::MAX,
                len: 5
            }
        );
        assert_eq!(doc.visible_text(), "hello");
        assert!(doc.delete_range(&mut clock, 5, 1).is_err());
        assert_eq!(doc.delete_range(&mut clock, 3, 2).unwrap().len(), 2);
        assert_eq!(doc.visible_text(), "hel");
    }

    #[test]
    fn test_colliding_id_is_reissued() {
        let (_, _, ops) = typed(1, "abc");
        let mut doc = TextDocument::new();
        for op in ops {
            doc.apply_remote(op).unwrap();
        }

        // A clock that restarted without observing its own earlier ids.
        let mut clock = CausalClock::new(1);
        let op = doc.local_insert(&mut clock, 3, 'd').unwrap();
        assert_eq!(op.id(), OpId::new(4, 1));
        assert_eq!(doc.visible_text(), "abcd");
        assert_eq!(doc.ops().len(), 4);
        assert_eq!(doc.get(&OpId::new(1, 1)).map(|item| item.value), Some('a'));
    }

    #[test]
    fn test_insert_between_tombstones_lands_at_visible_position() {
        let (mut doc, mut clock, _) = typed(1, "abc");
        doc.local_delete(&mut clock, 1).unwrap();
        doc.local_insert(&mut clock, 1, 'X').unwrap();
        assert_eq!(doc.visible_text(), "aXc");
    }

    #[test]
    fn test_delete_item_is_idempotent() {
        let (mut doc, mut clock, ops) = typed(1, "ab");
        assert!(doc.delete_item(&mut clock, ops[0].id()).is_some());
        assert!(doc.delete_item(&mut clock, ops[0].id()).is_none());
        assert_eq!(doc.visible_text(), "b");
    }

    #[test]
    fn test_remote_delete_twice_is_noop() {
        let (mut a, mut clock, _) = typed(1, "ab");
        let delete = a.local_delete(&mut clock, 0).unwrap().unwrap();

        let (mut b, _, _) = typed(1, "ab");
        let first = b.apply_remote(delete.clone()).unwrap();
        let second = b.apply_remote(delete).unwrap();
        assert_eq!(first.changes, vec![TextChange::Deleted { index: 0, value: 'a' }]);
        assert!(second.is_noop());
        assert_eq!(b.visible_text(), "b");
    }

    #[test]
    fn test_concurrent_insert_higher_id_goes_first() {
        let (mut a, _, a_ops) = typed(1, "hi");
        let (mut b, _, b_ops) = typed(2, "yo");

        for op in &b_ops {
            a.apply_remote(op.clone()).unwrap();
        }
        for op in &a_ops {
            b.apply_remote(op.clone()).unwrap();
        }

        assert_eq!(a.visible_text(), "yohi");
        assert_eq!(b.visible_text(), "yohi");
    }

    #[test]
    fn test_unknown_origin_is_parked_then_integrated() {
        let (_, _, ops) = typed(1, "ab");
        let mut doc = TextDocument::new();

        let err = doc.apply_remote(ops[1].clone()).unwrap_err();
        assert_eq!(
            err,
            TextError::UnresolvedDependency {
                op: ops[1].id(),
                missing: ops[0].id()
            }
        );
        assert_eq!(doc.pending_count(), 1);

        let effect = doc.apply_remote(ops[0].clone()).unwrap();
        assert_eq!(effect.changes.len(), 2);
        assert_eq!(doc.visible_text(), "ab");
        assert_eq!(doc.pending_count(), 0);
    }

    #[test]
    fn test_delete_before_insert_is_deferred() {
        let (mut origin, mut clock, ops) = typed(1, "a");
        let delete = origin.local_delete(&mut clock, 0).unwrap().unwrap();

        let mut doc = TextDocument::new();
        let effect = doc.apply_remote(delete).unwrap();
        assert!(effect.deferred);

        let effect = doc.apply_remote(ops[0].clone()).unwrap();
        assert_eq!(
            effect.changes,
            vec![
                TextChange::Inserted { index: 0, value: 'a' },
                TextChange::Deleted { index: 0, value: 'a' }
            ]
        );
        assert_eq!(doc.visible_text(), "");
    }

    #[test]
    fn test_causality_violation_rejected() {
        let mut doc = TextDocument::new();
        doc.apply_remote(TextOp::Insert {
            id: OpId::new(5, 1),
            value: 'a',
            origin_left: None,
            origin_right: None,
        })
        .unwrap();

        let err = doc
            .apply_remote(TextOp::Insert {
                id: OpId::new(3, 2),
                value: 'b',
                origin_left: Some(OpId::new(5, 1)),
                origin_right: None,
            })
            .unwrap_err();
        assert!(matches!(err, TextError::CausalityViolation { .. }));
        assert_eq!(doc.visible_text(), "a");
    }

    #[test]
    fn test_ops_and_state_vector_cover_parked() {
        let (_, _, ops) = typed(1, "abc");
        let mut doc = TextDocument::new();
        let _ = doc.apply_remote(ops[2].clone());
        doc.apply_remote(ops[0].clone()).unwrap();

        assert_eq!(doc.ops().len(), 2);
        assert_eq!(doc.state_vector().get(1), Some(3));
    }
}
