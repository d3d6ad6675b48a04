use super::{OpId, ReplicaId, StateVector};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall clock in milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}

/// Issues operation ids for one replica.
///
/// Counters are Lamport-style: every id handed out is greater than any id
/// this replica issued or observed, so an item inserted next to another
/// always compares greater than its neighbour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CausalClock {
    replica: ReplicaId,
    counter: u64,
    last_issued: u64,
    seen: StateVector,
}

impl CausalClock {
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            replica,
            counter: 0,
            last_issued: 0,
            seen: StateVector::new(),
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    pub fn next_id(&mut self) -> OpId {
        self.counter += 1;
        self.last_issued = self.counter;
        let id = OpId::new(self.counter, self.replica);
        self.seen.observe(id);
        id
    }

    /// Counter of the most recent id issued by this replica, zero if none.
    pub fn last_issued(&self) -> u64 {
        self.last_issued
    }

    pub fn observe(&mut self, remote: OpId) {
        self.seen.observe(remote);
        self.counter = self.counter.max(remote.counter);
    }

    /// Highest counter seen per replica, including this one.
    pub fn seen(&self) -> &StateVector {
        &self.seen
    }

    /// Fast-forwards after a snapshot load so numbering resumes past every
    /// restored id.
    pub fn advance_to(&mut self, state: &StateVector) {
        self.seen.merge(state);
        self.counter = self.counter.max(state.max_counter());
        self.last_issued = self.last_issued.max(state.counter(self.replica));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_id_is_strictly_increasing() {
        let mut clock = CausalClock::new(7);
        let a = clock.next_id();
        let b = clock.next_id();
        assert!(b > a);
        assert_eq!(b.replica, 7);
        assert_eq!(clock.last_issued(), 2);
    }

    #[test]
    fn test_observe_lifts_local_counter() {
        let mut clock = CausalClock::new(1);
        clock.next_id();
        clock.observe(OpId::new(10, 2));

        let next = clock.next_id();
        assert_eq!(next.counter, 11);
        assert_eq!(clock.seen().get(2), Some(10));
    }

    #[test]
    fn test_observe_never_moves_backwards() {
        let mut clock = CausalClock::new(1);
        clock.observe(OpId::new(10, 2));
        clock.observe(OpId::new(3, 2));
        assert_eq!(clock.seen().get(2), Some(10));
        assert_eq!(clock.next_id().counter, 11);
    }

    #[test]
    fn test_advance_to_resumes_numbering() {
        let mut state = StateVector::new();
        state.set(1, 40);
        state.set(2, 55);

        let mut clock = CausalClock::new(1);
        clock.advance_to(&state);

        assert_eq!(clock.last_issued(), 40);
        assert_eq!(clock.next_id(), OpId::new(56, 1));
    }
}
