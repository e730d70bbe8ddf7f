//! Durable, totally-ordered outbound queue.
//!
//! Mirrors the bookkeeping shape of the polling layer this broker replaces
//! (`last_poll`/`last_heartbeat` timestamps gating when to act) but keyed on
//! sequence numbers instead of wall-clock ticks, since every record here
//! must survive a restart.

use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::Message;
use crate::persist::Persist;

/// Default cap on how many un-acked records one exchange round will package.
pub const DEFAULT_MAX_PENDING: usize = 100;

/// Default cap on the serialized size of one packaged batch.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 8 * 1024 * 1024;

/// A queued outbound record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// Dense, never-reused, persistent sequence number.
    pub seq: u64,
    /// The message body.
    pub payload: Message,
    /// True while this message's type has never been in `accepted_types`.
    pub hold_until_type_accepted: bool,
}

/// The persisted shape of a `MessageStore`, round-tripped through `Persist`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    next_seq: u64,
    records: Vec<QueuedMessage>,
    accepted_types: BTreeSet<String>,
    has_received_accepted_types: bool,
    server_sequence: u64,
    client_sequence: u64,
    server_uuid: Option<String>,
}

/// Event fired locally when `set_accepted_types` changes a type's acceptance.
#[derive(Debug, Clone)]
pub struct AcceptanceChanged {
    /// The message type whose acceptance changed.
    pub message_type: String,
    /// The new acceptance state.
    pub accepted: bool,
}

/// Durable outbound message queue, rebuilt from `Persist` at startup.
#[derive(Debug)]
pub struct MessageStore {
    records: VecDeque<QueuedMessage>,
    next_seq: u64,
    pending_offset: usize,
    accepted_types: BTreeSet<String>,
    has_received_accepted_types: bool,
    server_sequence: u64,
    client_sequence: u64,
    server_uuid: Option<String>,
    max_pending: usize,
    max_payload_bytes: usize,
}

impl MessageStore {
    /// Rebuilds the store from the shared `Persist` tree.
    pub fn load(persist: &Persist) -> Self {
        let state: StoreState = persist.get("message-store").unwrap_or_default();
        Self {
            records: state.records.into(),
            next_seq: state.next_seq,
            pending_offset: 0,
            accepted_types: state.accepted_types,
            has_received_accepted_types: state.has_received_accepted_types,
            server_sequence: state.server_sequence,
            client_sequence: state.client_sequence,
            server_uuid: state.server_uuid,
            max_pending: DEFAULT_MAX_PENDING,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }

    fn flush(&self, persist: &mut Persist) -> Result<()> {
        let state = StoreState {
            next_seq: self.next_seq,
            records: self.records.iter().cloned().collect(),
            accepted_types: self.accepted_types.clone(),
            has_received_accepted_types: self.has_received_accepted_types,
            server_sequence: self.server_sequence,
            client_sequence: self.client_sequence,
            server_uuid: self.server_uuid.clone(),
        };
        persist.set("message-store", &state)?;
        persist.save()
    }

    /// Assigns the next seq, appends the record, and persists it.
    pub fn add(&mut self, payload: Message, persist: &mut Persist) -> Result<u64> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let hold = self.has_received_accepted_types
            && !self.accepted_types.contains(payload.message_type());
        self.records.push_back(QueuedMessage {
            seq,
            payload,
            hold_until_type_accepted: hold,
        });
        self.flush(persist)?;
        Ok(seq)
    }

    /// True if `seq` has been assigned but not yet durably deleted.
    #[must_use]
    pub fn is_message_pending(&self, seq: u64) -> bool {
        seq > self.client_sequence && seq < self.next_seq
    }

    /// Oldest-first, up to `max`, skipping records whose type is not
    /// currently accepted (unless no acceptance set has ever been received:
    /// the bootstrap exemption that lets pre-acceptance messages teach the
    /// server what we are), and skipping the oldest `pending_offset` eligible
    /// records already handed to an in-flight transport call.
    #[must_use]
    pub fn get_pending_messages(&self, max: usize) -> Vec<QueuedMessage> {
        let cap = max.min(self.max_pending);
        let mut out = Vec::new();
        let mut size = 0usize;
        let mut skipped = 0usize;
        for record in &self.records {
            if out.len() >= cap {
                break;
            }
            if self.has_received_accepted_types
                && !self.accepted_types.contains(record.payload.message_type())
            {
                continue;
            }
            if skipped < self.pending_offset {
                skipped += 1;
                continue;
            }
            let approx_size = serde_json::to_vec(&record.payload).map(|v| v.len()).unwrap_or(0);
            if size + approx_size > self.max_payload_bytes && !out.is_empty() {
                break;
            }
            size += approx_size;
            out.push(record.clone());
        }
        out
    }

    /// Marks `n` records (by count, oldest-first) as handed to the
    /// transport without deleting them, so a failed round can rewind the
    /// cursor.
    pub fn set_pending_offset(&mut self, n: usize) {
        self.pending_offset = n;
    }

    /// Rewinds the in-flight cursor back to zero, so the next round re-sends
    /// from `client_sequence` again.
    pub fn rewind_pending_offset(&mut self) {
        self.pending_offset = 0;
    }

    /// The number of records currently marked in-flight.
    #[must_use]
    pub fn pending_offset(&self) -> usize {
        self.pending_offset
    }

    /// Drops every record with `seq <= client_sequence`.
    pub fn delete_old_messages(&mut self, persist: &mut Persist) -> Result<()> {
        while let Some(front) = self.records.front() {
            if front.seq <= self.client_sequence {
                self.records.pop_front();
            } else {
                break;
            }
        }
        self.pending_offset = 0;
        self.flush(persist)
    }

    /// Advances `client_sequence` and drops acknowledged records. The server
    /// is never supposed to un-acknowledge messages; a regression here means
    /// either a protocol decode bug or corrupted state, so it's reported as
    /// an invariant breach rather than silently accepted.
    pub fn acknowledge_through(&mut self, client_sequence: u64, persist: &mut Persist) -> Result<()> {
        if client_sequence < self.client_sequence {
            return Err(crate::error::BrokerError::Fatal(format!(
                "client_sequence moved backward: {client_sequence} < {}",
                self.client_sequence
            )));
        }
        self.client_sequence = client_sequence;
        self.delete_old_messages(persist)
    }

    /// Current `client_sequence`.
    #[must_use]
    pub fn client_sequence(&self) -> u64 {
        self.client_sequence
    }

    /// The next `seq` that will be assigned.
    #[must_use]
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Diffs `types` against the current accepted set, returning the
    /// per-type changes to fire as `message-type-acceptance-changed` events.
    pub fn set_accepted_types(
        &mut self,
        types: BTreeSet<String>,
        persist: &mut Persist,
    ) -> Result<Vec<AcceptanceChanged>> {
        let mut changes = Vec::new();
        for added in types.difference(&self.accepted_types) {
            changes.push(AcceptanceChanged {
                message_type: added.clone(),
                accepted: true,
            });
        }
        for removed in self.accepted_types.difference(&types) {
            changes.push(AcceptanceChanged {
                message_type: removed.clone(),
                accepted: false,
            });
        }
        self.accepted_types = types;
        self.has_received_accepted_types = true;
        for record in &mut self.records {
            record.hold_until_type_accepted =
                !self.accepted_types.contains(record.payload.message_type());
        }
        self.flush(persist)?;
        Ok(changes)
    }

    /// The union of accepted types, sorted (accepted-types are already a `BTreeSet`).
    #[must_use]
    pub fn get_accepted_message_types(&self) -> Vec<String> {
        self.accepted_types.iter().cloned().collect()
    }

    /// Sets the server UUID, returning the previous value if it changed.
    pub fn set_server_uuid(&mut self, uuid: String, persist: &mut Persist) -> Result<Option<String>> {
        if self.server_uuid.as_deref() == Some(uuid.as_str()) {
            return Ok(None);
        }
        let old = self.server_uuid.replace(uuid);
        self.flush(persist)?;
        Ok(old)
    }

    /// The currently stored server UUID.
    #[must_use]
    pub fn get_server_uuid(&self) -> Option<&str> {
        self.server_uuid.as_deref()
    }

    /// Highest inbound message number acknowledged to the server.
    #[must_use]
    pub fn server_sequence(&self) -> u64 {
        self.server_sequence
    }

    /// Advances `server_sequence`, persisting the new value.
    pub fn set_server_sequence(&mut self, n: u64, persist: &mut Persist) -> Result<()> {
        self.server_sequence = n;
        self.flush(persist)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dir: &tempfile::TempDir) -> (MessageStore, Persist) {
        let persist = Persist::load(dir.path().join("broker.json"));
        let store = MessageStore::load(&persist);
        (store, persist)
    }

    #[test]
    fn add_assigns_dense_monotonic_seq() {
        let dir = tempdir().unwrap();
        let (mut store, mut persist) = store(&dir);
        let a = store.add(Message::new("test"), &mut persist).unwrap();
        let b = store.add(Message::new("test"), &mut persist).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(store.next_seq(), 2);
    }

    #[test]
    fn basic_send_scenario() {
        let dir = tempdir().unwrap();
        let (mut store, mut persist) = store(&dir);
        store
            .set_accepted_types(["test".to_string()].into(), &mut persist)
            .unwrap();
        store.add(Message::new("test"), &mut persist).unwrap();
        let pending = store.get_pending_messages(100);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload.message_type(), "test");
    }

    #[test]
    fn bootstrap_exemption_lets_unaccepted_types_through_before_first_acceptance() {
        let dir = tempdir().unwrap();
        let (mut store, mut persist) = store(&dir);
        store.add(Message::new("register"), &mut persist).unwrap();
        assert_eq!(store.get_pending_messages(100).len(), 1);
    }

    #[test]
    fn unaccepted_type_is_skipped_after_first_acceptance_set() {
        let dir = tempdir().unwrap();
        let (mut store, mut persist) = store(&dir);
        store
            .set_accepted_types(["known".to_string()].into(), &mut persist)
            .unwrap();
        store.add(Message::new("unknown"), &mut persist).unwrap();
        assert_eq!(store.get_pending_messages(100).len(), 0);
    }

    #[test]
    fn get_pending_messages_respects_max_and_ordering() {
        let dir = tempdir().unwrap();
        let (mut store, mut persist) = store(&dir);
        store
            .set_accepted_types(["test".to_string()].into(), &mut persist)
            .unwrap();
        for _ in 0..5 {
            store.add(Message::new("test"), &mut persist).unwrap();
        }
        let pending = store.get_pending_messages(2);
        assert_eq!(pending.len(), 2);
        assert!(pending[0].seq < pending[1].seq);
        assert!(pending.iter().all(|r| r.seq > store.client_sequence()));
    }

    #[test]
    fn delete_old_messages_drops_up_to_client_sequence() {
        let dir = tempdir().unwrap();
        let (mut store, mut persist) = store(&dir);
        for _ in 0..3 {
            store.add(Message::new("test"), &mut persist).unwrap();
        }
        store.acknowledge_through(1, &mut persist).unwrap();
        assert_eq!(store.records.len(), 1);
        assert_eq!(store.records.front().unwrap().seq, 2);
    }

    #[test]
    fn acknowledge_through_rejects_moving_backward() {
        let dir = tempdir().unwrap();
        let (mut store, mut persist) = store(&dir);
        for _ in 0..3 {
            store.add(Message::new("test"), &mut persist).unwrap();
        }
        store.acknowledge_through(2, &mut persist).unwrap();
        let err = store.acknowledge_through(1, &mut persist).unwrap_err();
        assert!(matches!(err, crate::error::BrokerError::Fatal(_)));
        assert_eq!(store.client_sequence(), 2);
    }

    #[test]
    fn set_accepted_types_reports_diff_and_is_idempotent_round_trip() {
        let dir = tempdir().unwrap();
        let (mut store, mut persist) = store(&dir);
        let changes = store
            .set_accepted_types(["a".to_string(), "b".to_string()].into(), &mut persist)
            .unwrap();
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.accepted));

        let changes2 = store
            .set_accepted_types(["a".to_string()].into(), &mut persist)
            .unwrap();
        assert_eq!(changes2.len(), 1);
        assert!(!changes2[0].accepted);
        assert_eq!(changes2[0].message_type, "b");

        assert_eq!(store.get_accepted_message_types(), vec!["a".to_string()]);
    }

    #[test]
    fn server_uuid_change_is_detected() {
        let dir = tempdir().unwrap();
        let (mut store, mut persist) = store(&dir);
        assert_eq!(store.set_server_uuid("u1".into(), &mut persist).unwrap(), None);
        let old = store.set_server_uuid("u2".into(), &mut persist).unwrap();
        assert_eq!(old, Some("u1".to_string()));
        assert_eq!(store.get_server_uuid(), Some("u2"));
    }

    #[test]
    fn client_sequence_never_exceeds_next_seq() {
        let dir = tempdir().unwrap();
        let (mut store, mut persist) = store(&dir);
        store.add(Message::new("test"), &mut persist).unwrap();
        store.acknowledge_through(0, &mut persist).unwrap();
        assert!(store.client_sequence() <= store.next_seq());
    }

    #[test]
    fn pending_offset_hides_in_flight_records_from_further_polling() {
        let dir = tempdir().unwrap();
        let (mut store, mut persist) = store(&dir);
        store
            .set_accepted_types(["test".to_string()].into(), &mut persist)
            .unwrap();
        for _ in 0..3 {
            store.add(Message::new("test"), &mut persist).unwrap();
        }
        store.set_pending_offset(2);
        let pending = store.get_pending_messages(100);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].seq, 2);
    }

    #[test]
    fn rewind_pending_offset_restores_full_visibility_after_a_failed_round() {
        let dir = tempdir().unwrap();
        let (mut store, mut persist) = store(&dir);
        store
            .set_accepted_types(["test".to_string()].into(), &mut persist)
            .unwrap();
        for _ in 0..3 {
            store.add(Message::new("test"), &mut persist).unwrap();
        }
        store.set_pending_offset(3);
        assert_eq!(store.get_pending_messages(100).len(), 0);
        store.rewind_pending_offset();
        assert_eq!(store.get_pending_messages(100).len(), 3);
    }

    #[test]
    fn survives_restart_via_persist() {
        let dir = tempdir().unwrap();
        {
            let (mut store, mut persist) = store(&dir);
            store.add(Message::new("test"), &mut persist).unwrap();
        }
        let persist2 = Persist::load(dir.path().join("broker.json"));
        let store2 = MessageStore::load(&persist2);
        assert_eq!(store2.next_seq(), 1);
        assert_eq!(store2.get_pending_messages(100).len(), 1);
    }
}
