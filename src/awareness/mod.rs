//! Ephemeral per-participant presence: name, color, cursor.
//!
//! Records here are advisory UI state. They live in their own expiring
//! table keyed by participant and never touch document content.
//!
//! ```text
//! set_local() ──► dirty ──► heartbeat / immediate broadcast
//!                                 │
//!                                 ▼
//!                  remote apply_remote()  (last-write-wins per participant)
//!                                 │
//!                                 ▼
//!                  sweep_expired(now)  (no heartbeat within timeout)
//! ```

use crate::core::{ReplicaId, unix_millis};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

pub const NAME: &str = "name";
pub const COLOR: &str = "color";
pub const CURSOR: &str = "cursor";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    Text(String),
    Int(i64),
    Bool(bool),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

pub type Fields = BTreeMap<String, FieldValue>;

/// One participant's state as broadcast on the wire. `fields: None` means
/// the participant left.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub participant: ReplicaId,
    pub fields: Option<Fields>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessRecord {
    pub participant: ReplicaId,
    pub fields: Fields,
    /// Sender-side timestamp used for last-write-wins.
    pub clock: u64,
    /// Local receipt time used for expiry.
    pub last_seen: Instant,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ReplicaId>,
    pub updated: Vec<ReplicaId>,
    pub removed: Vec<ReplicaId>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct AwarenessTracker {
    local: ReplicaId,
    local_fields: Fields,
    local_clock: u64,
    dirty: bool,
    remote: HashMap<ReplicaId, AwarenessRecord>,
    /// Timestamp and receipt time of each participant's last disconnect,
    /// kept until it expires so late updates cannot resurrect the record.
    departed: HashMap<ReplicaId, (u64, Instant)>,
    timeout: Duration,
}

impl AwarenessTracker {
    pub fn new(local: ReplicaId, timeout: Duration) -> Self {
        Self {
            local,
            local_fields: Fields::new(),
            local_clock: 0,
            dirty: false,
            remote: HashMap::new(),
            departed: HashMap::new(),
            timeout,
        }
    }

    pub fn local_id(&self) -> ReplicaId {
        self.local
    }

    pub fn local_fields(&self) -> &Fields {
        &self.local_fields
    }

    pub fn set_local(&mut self, fields: Fields) {
        self.local_fields = fields;
        self.touch_local();
    }

    pub fn set_local_field(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        self.local_fields.insert(key.into(), value.into());
        self.touch_local();
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Returns the local update if it changed since the last call.
    pub fn take_dirty(&mut self) -> Option<AwarenessUpdate> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        Some(self.local_update())
    }

    /// Renews the local record for a heartbeat.
    pub fn heartbeat(&mut self) -> AwarenessUpdate {
        self.touch_local();
        self.dirty = false;
        self.local_update()
    }

    /// Announces that the local participant is leaving.
    pub fn local_disconnect(&mut self) -> AwarenessUpdate {
        self.local_clock = self.next_clock();
        self.dirty = false;
        AwarenessUpdate {
            participant: self.local,
            fields: None,
            timestamp: self.local_clock,
        }
    }

    pub fn apply_remote(
        &mut self,
        participant: ReplicaId,
        fields: Option<Fields>,
        timestamp: u64,
        now: Instant,
    ) -> AwarenessChange {
        let mut change = AwarenessChange::default();
        if participant == self.local {
            return change;
        }
        if let Some((left_at, _)) = self.departed.get(&participant) {
            if timestamp <= *left_at {
                return change;
            }
            if fields.is_some() {
                self.departed.remove(&participant);
            }
        }
        match (fields, self.remote.get_mut(&participant)) {
            (None, Some(record)) => {
                if timestamp >= record.clock {
                    self.remote.remove(&participant);
                    self.departed.insert(participant, (timestamp, now));
                    change.removed.push(participant);
                }
            }
            (None, None) => {
                self.departed.insert(participant, (timestamp, now));
            }
            (Some(fields), Some(record)) => {
                if timestamp > record.clock {
                    record.clock = timestamp;
                    record.last_seen = now;
                    if record.fields != fields {
                        record.fields = fields;
                        change.updated.push(participant);
                    }
                }
            }
            (Some(fields), None) => {
                self.remote.insert(
                    participant,
                    AwarenessRecord {
                        participant,
                        fields,
                        clock: timestamp,
                        last_seen: now,
                    },
                );
                change.added.push(participant);
            }
        }
        change
    }

    /// Drops remote records not heard from within the timeout.
    pub fn sweep_expired(&mut self, now: Instant) -> AwarenessChange {
        let timeout = self.timeout;
        let mut expired: Vec<ReplicaId> = self
            .remote
            .values()
            .filter(|record| now.saturating_duration_since(record.last_seen) > timeout)
            .map(|record| record.participant)
            .collect();
        expired.sort_unstable();
        for participant in &expired {
            self.remote.remove(participant);
        }
        self.departed
            .retain(|_, (_, received)| now.saturating_duration_since(*received) <= timeout);
        AwarenessChange {
            removed: expired,
            ..AwarenessChange::default()
        }
    }

    /// Forgets every remote participant.
    pub fn clear_remote(&mut self) -> AwarenessChange {
        let mut removed: Vec<ReplicaId> = self.remote.keys().copied().collect();
        removed.sort_unstable();
        self.remote.clear();
        AwarenessChange {
            removed,
            ..AwarenessChange::default()
        }
    }

    pub fn remote(&self, participant: ReplicaId) -> Option<&AwarenessRecord> {
        self.remote.get(&participant)
    }

    pub fn remote_count(&self) -> usize {
        self.remote.len()
    }

    /// Every known participant's fields, local first, then remote by id.
    pub fn states(&self) -> Vec<(ReplicaId, Fields)> {
        let mut remote: Vec<(ReplicaId, Fields)> = self
            .remote
            .values()
            .map(|record| (record.participant, record.fields.clone()))
            .collect();
        remote.sort_by_key(|(participant, _)| *participant);
        let mut states = Vec::with_capacity(remote.len() + 1);
        states.push((self.local, self.local_fields.clone()));
        states.extend(remote);
        states
    }

    fn local_update(&self) -> AwarenessUpdate {
        AwarenessUpdate {
            participant: self.local,
            fields: Some(self.local_fields.clone()),
            timestamp: self.local_clock,
        }
    }

    fn touch_local(&mut self) {
        self.local_clock = self.next_clock();
        self.dirty = true;
    }

    fn next_clock(&self) -> u64 {
        (self.local_clock + 1).max(unix_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(name: &str) -> Fields {
        Fields::from([(NAME.to_string(), FieldValue::from(name))])
    }

    #[test]
    fn test_set_local_marks_dirty() {
        let mut tracker = AwarenessTracker::new(1, Duration::from_secs(30));
        assert!(tracker.take_dirty().is_none());

        tracker.set_local_field(NAME, "calm-otter");
        let update = tracker.take_dirty().unwrap();
        assert_eq!(update.participant, 1);
        assert_eq!(update.fields.unwrap()[NAME].as_text(), Some("calm-otter"));
        assert!(!tracker.is_dirty());
    }

    #[test]
    fn test_newer_timestamp_wins() {
        let mut tracker = AwarenessTracker::new(1, Duration::from_secs(30));
        let now = Instant::now();

        let change = tracker.apply_remote(2, Some(fields("a")), 10, now);
        assert_eq!(change.added, vec![2]);

        let change = tracker.apply_remote(2, Some(fields("stale")), 5, now);
        assert!(change.is_empty());
        assert_eq!(tracker.remote(2).unwrap().fields, fields("a"));

        let change = tracker.apply_remote(2, Some(fields("b")), 11, now);
        assert_eq!(change.updated, vec![2]);
        assert_eq!(tracker.remote(2).unwrap().fields, fields("b"));
    }

    #[test]
    fn test_own_updates_ignored() {
        let mut tracker = AwarenessTracker::new(1, Duration::from_secs(30));
        let change = tracker.apply_remote(1, Some(fields("echo")), 99, Instant::now());
        assert!(change.is_empty());
        assert_eq!(tracker.remote_count(), 0);
    }

    #[test]
    fn test_disconnect_removes_record() {
        let mut tracker = AwarenessTracker::new(1, Duration::from_secs(30));
        let now = Instant::now();
        tracker.apply_remote(2, Some(fields("a")), 10, now);

        let change = tracker.apply_remote(2, None, 11, now);
        assert_eq!(change.removed, vec![2]);
        assert!(tracker.remote(2).is_none());
    }

    #[test]
    fn test_late_update_after_disconnect_is_ignored() {
        let mut tracker = AwarenessTracker::new(1, Duration::from_secs(30));
        let start = Instant::now();
        tracker.apply_remote(2, Some(fields("a")), 10, start);
        tracker.apply_remote(2, None, 12, start);

        // Sent before the disconnect, delivered after it.
        let change = tracker.apply_remote(2, Some(fields("a")), 11, start);
        assert!(change.is_empty());
        assert!(tracker.remote(2).is_none());

        // Rejoining with a newer timestamp is accepted.
        let change = tracker.apply_remote(2, Some(fields("back")), 13, start);
        assert_eq!(change.added, vec![2]);
        assert_eq!(tracker.remote(2).unwrap().fields, fields("back"));
    }

    #[test]
    fn test_disconnect_is_forgotten_after_timeout() {
        let mut tracker = AwarenessTracker::new(1, Duration::from_secs(30));
        let start = Instant::now();
        tracker.apply_remote(2, None, 50, start);
        assert!(tracker.apply_remote(2, Some(fields("a")), 40, start).is_empty());

        tracker.sweep_expired(start + Duration::from_secs(31));
        let change = tracker.apply_remote(2, Some(fields("a")), 40, start + Duration::from_secs(31));
        assert_eq!(change.added, vec![2]);
    }

    #[test]
    fn test_sweep_expired() {
        let mut tracker = AwarenessTracker::new(1, Duration::from_secs(30));
        let start = Instant::now();
        tracker.apply_remote(2, Some(fields("old")), 1, start);
        tracker.apply_remote(3, Some(fields("fresh")), 1, start + Duration::from_secs(20));

        let change = tracker.sweep_expired(start + Duration::from_secs(31));
        assert_eq!(change.removed, vec![2]);
        assert!(tracker.remote(3).is_some());
        assert_eq!(tracker.states().len(), 2);
    }

    #[test]
    fn test_heartbeat_advances_clock() {
        let mut tracker = AwarenessTracker::new(1, Duration::from_secs(30));
        let first = tracker.heartbeat();
        let second = tracker.heartbeat();
        assert!(second.timestamp > first.timestamp);

        let leave = tracker.local_disconnect();
        assert!(leave.fields.is_none());
        assert!(leave.timestamp > second.timestamp);
    }
}
