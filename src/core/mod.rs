//! Identifiers and causality tracking shared by every replicated structure.
//!
//! - [`OpId`] - Unique operation identifiers using Lamport-style counters
//! - [`StateVector`] - Version vector summarising which operations a replica has
//! - [`CausalClock`] - Per-replica issuer of fresh [`OpId`]s

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub mod clock;

pub use clock::{CausalClock, unix_millis};

pub type ReplicaId = u64;

/// Draws a fresh replica id for a new session instance.
pub fn random_replica_id() -> ReplicaId {
    let (high, low) = uuid::Uuid::new_v4().as_u64_pair();
    // Zero is reserved so a default state vector entry never matches a live replica.
    (high ^ low).max(1)
}

/// Globally unique operation identifier.
///
/// Field order matters: the derived ordering compares `counter` first and
/// breaks ties with `replica`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub counter: u64,
    pub replica: ReplicaId,
}

impl OpId {
    pub const fn new(counter: u64, replica: ReplicaId) -> Self {
        Self { counter, replica }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:x}", self.counter, self.replica)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector {
    replicas: BTreeMap<ReplicaId, u64>,
}

impl StateVector {
    pub fn new() -> Self {
        Self {
            replicas: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    pub fn get(&self, replica: ReplicaId) -> Option<u64> {
        self.replicas.get(&replica).copied()
    }

    /// Highest counter seen for `replica`, zero when nothing was seen.
    pub fn counter(&self, replica: ReplicaId) -> u64 {
        self.get(replica).unwrap_or(0)
    }

    pub fn set(&mut self, replica: ReplicaId, counter: u64) {
        self.replicas.insert(replica, counter);
    }

    /// Raises the entry for `id.replica` to `id.counter` if it is higher.
    pub fn observe(&mut self, id: OpId) {
        let entry = self.replicas.entry(id.replica).or_insert(0);
        if id.counter > *entry {
            *entry = id.counter;
        }
    }

    pub fn contains(&self, id: OpId) -> bool {
        id.counter <= self.counter(id.replica)
    }

    /// Pointwise maximum of both vectors.
    pub fn merge(&mut self, other: &StateVector) {
        for (replica, counter) in other.iter() {
            self.observe(OpId::new(counter, replica));
        }
    }

    /// True when `other` has seen an operation this vector has not.
    pub fn is_behind(&self, other: &StateVector) -> bool {
        other
            .iter()
            .any(|(replica, counter)| counter > self.counter(replica))
    }

    /// Largest counter across all replicas.
    pub fn max_counter(&self) -> u64 {
        self.replicas.values().copied().max().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ReplicaId, u64)> + '_ {
        self.replicas.iter().map(|(replica, counter)| (*replica, *counter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_id_orders_by_counter_then_replica() {
        let a = OpId::new(1, 9);
        let b = OpId::new(2, 1);
        let c = OpId::new(2, 3);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_state_vector_observe_keeps_max() {
        let mut sv = StateVector::new();
        sv.observe(OpId::new(3, 1));
        sv.observe(OpId::new(2, 1));
        sv.observe(OpId::new(5, 2));

        assert_eq!(sv.get(1), Some(3));
        assert_eq!(sv.get(2), Some(5));
        assert!(sv.contains(OpId::new(3, 1)));
        assert!(!sv.contains(OpId::new(4, 1)));
    }

    #[test]
    fn test_state_vector_is_behind() {
        let mut local = StateVector::new();
        local.set(1, 4);
        let mut remote = StateVector::new();
        remote.set(1, 2);
        assert!(!local.is_behind(&remote));

        remote.set(2, 1);
        assert!(local.is_behind(&remote));

        local.merge(&remote);
        assert!(!local.is_behind(&remote));
        assert_eq!(local.max_counter(), 4);
    }

    #[test]
    fn test_random_replica_id_is_never_zero() {
        for _ in 0..32 {
            assert_ne!(random_replica_id(), 0);
        }
    }
}
