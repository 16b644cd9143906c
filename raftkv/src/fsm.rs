//! The replicated state machine: committed commands applied to the local store.

use std::fmt;
use std::io::{Read, Write};

use raft::prelude::{Entry, EntryType};
use serde::de::{self, SeqAccess, Visitor};
use serde_derive::Deserialize;

use crate::command::{CommandPayload, Operation, Value};
use crate::error::{Error, Result};
use crate::metrics;
use crate::raft::{FsmSnapshot, StateMachine};
use crate::store::Store;

/// Result of applying one command, handed back to the node that submitted it.
#[derive(Debug)]
pub struct ApplyResult {
    pub error: Option<Error>,
    pub data: Value,
}

impl ApplyResult {
    fn ok(data: Value) -> Self {
        ApplyResult { error: None, data }
    }

    fn from_outcome(outcome: Result<()>, data: Value) -> Self {
        ApplyResult {
            error: outcome.err(),
            data,
        }
    }

    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.data),
        }
    }
}

/// What `snapshot()` captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotMode {
    /// Nothing: the storage engine already holds the state, so the raft log is kept whole.
    #[default]
    Noop,
    /// Every stored record, written as a JSON array of SET commands.
    Full,
}

pub struct KvStateMachine {
    store: Store,
    snapshot_mode: SnapshotMode,
}

impl KvStateMachine {
    pub fn new(store: Store, snapshot_mode: SnapshotMode) -> Self {
        KvStateMachine {
            store,
            snapshot_mode,
        }
    }

    /// Executes a decoded command against the store.
    pub fn execute(&self, payload: CommandPayload) -> ApplyResult {
        let key = payload.key.as_str();
        match payload.operation {
            Operation::Set => {
                let outcome = self.store.set(key, &payload.value);
                ApplyResult::from_outcome(outcome, payload.value)
            }
            Operation::Get => match self.store.get(key) {
                Ok(value) => ApplyResult::ok(value),
                Err(e) => ApplyResult::from_outcome(Err(e), Value::null()),
            },
            Operation::Delete => ApplyResult::from_outcome(self.store.delete(key), Value::null()),
        }
    }

    fn unrecognized(&self, entry: &Entry, reason: &dyn fmt::Display) {
        log::warn!(
            "Unrecognized entry at index {} term {}: {}",
            entry.index,
            entry.term,
            reason
        );
        metrics::record_applied(metrics::UNRECOGNIZED_OPERATION);
    }
}

impl StateMachine for KvStateMachine {
    type Response = ApplyResult;

    fn apply(&mut self, entry: &Entry) -> Option<ApplyResult> {
        if entry.get_entry_type() != EntryType::EntryNormal {
            self.unrecognized(entry, &"not a command entry");
            return None;
        }
        let payload = match CommandPayload::decode(&entry.data) {
            Ok(payload) => payload,
            Err(e) => {
                self.unrecognized(entry, &e);
                return None;
            }
        };
        metrics::record_applied(payload.operation.as_str());
        Some(self.execute(payload))
    }

    fn snapshot(&self) -> Result<Box<dyn FsmSnapshot>> {
        match self.snapshot_mode {
            SnapshotMode::Noop => Ok(Box::new(NoopSnapshot)),
            SnapshotMode::Full => {
                let records = self
                    .store
                    .records()
                    .map(|record| record.map(|(key, value)| CommandPayload::set(key, value)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Box::new(FullSnapshot { records }))
            }
        }
    }

    fn restore(&mut self, snapshot: &mut dyn Read) -> Result<()> {
        log::info!("Restoring state machine from snapshot");
        let mut replay = Replay {
            store: &self.store,
            restored: 0,
            failure: None,
        };
        let mut de = serde_json::Deserializer::from_reader(snapshot);
        let outcome =
            serde::Deserializer::deserialize_seq(&mut de, &mut replay).and_then(|_| de.end());
        match outcome {
            Ok(()) => {
                log::info!("Restored {} records from snapshot", replay.restored);
                Ok(())
            }
            Err(e) => {
                let err = match replay.failure.take() {
                    Some(failure) => failure,
                    None => Error::RestoreDecode(e),
                };
                log::error!(
                    "Restore failed after {} records: {}",
                    replay.restored,
                    err
                );
                Err(err)
            }
        }
    }
}

/// One record of a restore stream. Only the key and value matter, any operation field is
/// ignored and every record is an upsert.
#[derive(Deserialize)]
struct RestoreRecord {
    key: String,
    #[serde(default)]
    value: Value,
}

/// Upserts each record of the restore stream as soon as it is decoded.
struct Replay<'a> {
    store: &'a Store,
    restored: usize,
    failure: Option<Error>,
}

impl<'de, 'a, 'b> Visitor<'de> for &'b mut Replay<'a> {
    type Value = ();

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("an array of key-value records")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<(), A::Error> {
        while let Some(record) = seq.next_element::<RestoreRecord>()? {
            if let Err(e) = self.store.set(&record.key, &record.value) {
                self.failure = Some(e);
                return Err(de::Error::custom("storage failure during restore"));
            }
            self.restored += 1;
        }
        Ok(())
    }
}

struct NoopSnapshot;

impl FsmSnapshot for NoopSnapshot {
    fn persist(&mut self, _sink: &mut dyn Write) -> Result<()> {
        Ok(())
    }

    fn release(&mut self) {}
}

struct FullSnapshot {
    records: Vec<CommandPayload>,
}

impl FsmSnapshot for FullSnapshot {
    fn persist(&mut self, sink: &mut dyn Write) -> Result<()> {
        serde_json::to_writer(sink, &self.records)?;
        Ok(())
    }

    fn release(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::{LogStore, Node, NodeOptions, RaftHandle, Transport};
    use raft::prelude::{ConfChange, Message, MessageType, Snapshot};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::task::JoinHandle;

    fn value(json: &str) -> Value {
        Value::from_json(json).unwrap()
    }

    fn entry(index: u64, payload: &CommandPayload) -> Entry {
        let mut e = Entry::default();
        e.set_entry_type(EntryType::EntryNormal);
        e.index = index;
        e.term = 1;
        e.data = payload.encode().unwrap().into();
        e
    }

    fn state_machine(dir: &TempDir, mode: SnapshotMode) -> (KvStateMachine, Store) {
        let store = Store::open(dir.path()).unwrap();
        (KvStateMachine::new(store.clone(), mode), store)
    }

    fn contents(store: &Store) -> Vec<(String, Value)> {
        store.records().map(|r| r.unwrap()).collect()
    }

    #[test]
    fn test_apply_is_deterministic() {
        let commands = vec![
            CommandPayload::set("a", value("1")),
            CommandPayload::set("b", value(r#"{"x":[1,2]}"#)),
            CommandPayload::delete("a"),
            CommandPayload::set("c", value(r#""three""#)),
            CommandPayload::delete("missing"),
            CommandPayload::set("b", value("null")),
        ];
        let (dir1, dir2) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let (mut fsm1, store1) = state_machine(&dir1, SnapshotMode::Noop);
        let (mut fsm2, store2) = state_machine(&dir2, SnapshotMode::Noop);

        for (i, command) in commands.iter().enumerate() {
            let e = entry(i as u64 + 2, command);
            fsm1.apply(&e).unwrap();
            fsm2.apply(&e).unwrap();
        }
        assert_eq!(contents(&store1), contents(&store2));
        assert_eq!(
            contents(&store1),
            vec![
                ("b".to_string(), value("null")),
                ("c".to_string(), value(r#""three""#)),
            ]
        );
    }

    #[test]
    fn test_set_get_delete() {
        let dir = TempDir::new().unwrap();
        let (mut fsm, store) = state_machine(&dir, SnapshotMode::Noop);

        let result = fsm
            .apply(&entry(2, &CommandPayload::set("foo", value(r#""bar""#))))
            .unwrap();
        assert_eq!(result.into_result().unwrap(), value(r#""bar""#));

        let result = fsm.apply(&entry(3, &CommandPayload::get("foo"))).unwrap();
        assert_eq!(result.into_result().unwrap(), value(r#""bar""#));

        let result = fsm.apply(&entry(4, &CommandPayload::delete("foo"))).unwrap();
        assert!(result.error.is_none());
        assert!(result.data.is_null());
        assert!(matches!(store.get("foo"), Err(Error::NotFound(_))));

        let result = fsm.apply(&entry(5, &CommandPayload::get("foo"))).unwrap();
        assert!(matches!(result.error, Some(Error::NotFound(_))));
        assert!(result.data.is_null());
    }

    #[test]
    fn test_unrecognized_entries() {
        let dir = TempDir::new().unwrap();
        let (mut fsm, store) = state_machine(&dir, SnapshotMode::Noop);
        let counter = metrics::APPLIED_COMMANDS.with_label_values(&[metrics::UNRECOGNIZED_OPERATION]);
        let before = counter.get();

        let mut garbage = Entry::default();
        garbage.data = b"not a command".to_vec().into();
        assert!(fsm.apply(&garbage).is_none());

        let mut unknown = Entry::default();
        unknown.data = br#"{"operation":"INCR","key":"n","value":1}"#.to_vec().into();
        assert!(fsm.apply(&unknown).is_none());

        let mut conf_change = Entry::default();
        conf_change.set_entry_type(EntryType::EntryConfChange);
        conf_change.data = protobuf::Message::write_to_bytes(&ConfChange::default())
            .unwrap()
            .into();
        assert!(fsm.apply(&conf_change).is_none());

        assert_eq!(counter.get() - before, 3.0);
        assert!(contents(&store).is_empty());
    }

    #[test]
    fn test_restore_upserts_in_order() {
        let dir = TempDir::new().unwrap();
        let (mut fsm, store) = state_machine(&dir, SnapshotMode::Noop);
        let stream = br#"[
            {"operation":"SET","key":"a","value":1},
            {"operation":"SET","key":"b","value":2},
            {"operation":"SET","key":"a","value":3}
        ]"#;

        fsm.restore(&mut &stream[..]).unwrap();
        assert_eq!(store.get("a").unwrap(), value("3"));
        assert_eq!(store.get("b").unwrap(), value("2"));
        assert_eq!(contents(&store).len(), 2);
    }

    #[test]
    fn test_restore_rejects_malformed_stream() {
        let dir = TempDir::new().unwrap();
        let (mut fsm, _store) = state_machine(&dir, SnapshotMode::Noop);

        let truncated = br#"[{"operation":"SET","key":"a","value":1},{"operation":"#;
        assert!(matches!(
            fsm.restore(&mut &truncated[..]),
            Err(Error::RestoreDecode(_))
        ));

        let not_an_array = br#"{"operation":"SET","key":"a","value":1}"#;
        assert!(matches!(
            fsm.restore(&mut &not_an_array[..]),
            Err(Error::RestoreDecode(_))
        ));

        let keyless = br#"[{"operation":"SET","value":1}]"#;
        assert!(matches!(
            fsm.restore(&mut &keyless[..]),
            Err(Error::RestoreDecode(_))
        ));
    }

    #[test]
    fn test_restore_ignores_the_operation_field() {
        let dir = TempDir::new().unwrap();
        let (mut fsm, store) = state_machine(&dir, SnapshotMode::Noop);
        let stream = br#"[
            {"operation":"NOPE","key":"a","value":1},
            {"operation":"DELETE","key":"b","value":"kept"},
            {"key":"c","value":{"x":true}},
            {"key":"d"}
        ]"#;

        fsm.restore(&mut &stream[..]).unwrap();
        assert_eq!(
            contents(&store),
            vec![
                ("a".to_string(), value("1")),
                ("b".to_string(), value(r#""kept""#)),
                ("c".to_string(), value(r#"{"x":true}"#)),
                ("d".to_string(), value("null")),
            ]
        );
    }

    #[test]
    fn test_restore_fails_on_a_key_the_store_refuses() {
        let dir = TempDir::new().unwrap();
        let (mut fsm, store) = state_machine(&dir, SnapshotMode::Noop);

        let empty_key = br#"[
            {"operation":"SET","key":"a","value":1},
            {"operation":"SET","key":"","value":1}
        ]"#;
        assert!(matches!(
            fsm.restore(&mut &empty_key[..]),
            Err(Error::Validation(_))
        ));
        assert_eq!(contents(&store), vec![("a".to_string(), value("1"))]);

        let oversized = format!(r#"[{{"key":"{}","value":1}}]"#, "k".repeat(70_000));
        assert!(matches!(
            fsm.restore(&mut oversized.as_bytes()),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_storage_errors_are_returned_to_the_caller() {
        let dir = TempDir::new().unwrap();
        let (mut fsm, store) = state_machine(&dir, SnapshotMode::Noop);
        let key = "k".repeat(70_000);

        let result = fsm
            .apply(&entry(2, &CommandPayload::set(key.clone(), value("1"))))
            .unwrap();
        assert!(matches!(result.error, Some(Error::Validation(_))));

        let result = fsm.apply(&entry(3, &CommandPayload::delete(key))).unwrap();
        assert!(matches!(result.error, Some(Error::Validation(_))));

        let result = fsm
            .apply(&entry(4, &CommandPayload::set("after", value("2"))))
            .unwrap();
        assert_eq!(result.into_result().unwrap(), value("2"));
        assert_eq!(contents(&store), vec![("after".to_string(), value("2"))]);
    }

    fn start_node(
        dir: &TempDir,
        id: u64,
        bootstrap: bool,
    ) -> (RaftHandle<ApplyResult>, JoinHandle<Result<()>>) {
        let store = Store::open(dir.path().join("data")).unwrap();
        let log_store = LogStore::open(dir.path().join("raft"), bootstrap.then_some(id)).unwrap();
        let fsm = KvStateMachine::new(store, SnapshotMode::Full);
        let transport = Transport::new(id, format!("127.0.0.1:{}", 7000 + id), Vec::new());
        let options = NodeOptions {
            id,
            snapshot_interval: Duration::from_secs(3600),
        };
        Node::start(options, log_store, fsm, transport).unwrap()
    }

    #[tokio::test]
    async fn test_node_survives_a_failed_apply() {
        let dir = TempDir::new().unwrap();
        let (raft, task) = start_node(&dir, 1, true);
        assert!(raft.wait_for_leader(Duration::from_secs(5)).await);

        let oversized = CommandPayload::set("k".repeat(70_000), value("1"))
            .encode()
            .unwrap();
        let result = raft
            .submit(oversized, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result.error, Some(Error::Validation(_))));

        let normal = CommandPayload::set("after", value("2")).encode().unwrap();
        let result = raft
            .submit(normal, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.into_result().unwrap(), value("2"));
        assert!(!task.is_finished());
    }

    #[tokio::test]
    async fn test_malformed_snapshot_stops_the_node() {
        let dir = TempDir::new().unwrap();
        let (raft, task) = start_node(&dir, 1, false);

        let mut snapshot = Snapshot::default();
        snapshot.data = b"{not an array".to_vec().into();
        let metadata = snapshot.mut_metadata();
        metadata.index = 5;
        metadata.term = 2;
        metadata.mut_conf_state().voters = vec![1, 2];

        let mut msg = Message::default();
        msg.set_msg_type(MessageType::MsgSnapshot);
        msg.from = 2;
        msg.to = 1;
        msg.term = 2;
        msg.set_snapshot(snapshot);
        raft.step(msg).await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("node task should stop")
            .unwrap();
        assert!(matches!(outcome, Err(Error::RestoreDecode(_))));
    }

    #[test]
    fn test_noop_snapshot_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let (mut fsm, _store) = state_machine(&dir, SnapshotMode::Noop);
        fsm.apply(&entry(2, &CommandPayload::set("a", value("1"))))
            .unwrap();

        let mut snapshot = fsm.snapshot().unwrap();
        let mut sink = Vec::new();
        snapshot.persist(&mut sink).unwrap();
        snapshot.release();
        assert!(sink.is_empty());
    }

    #[test]
    fn test_full_snapshot_restores_elsewhere() {
        let (dir1, dir2) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let (mut source, source_store) = state_machine(&dir1, SnapshotMode::Full);
        let (mut target, target_store) = state_machine(&dir2, SnapshotMode::Full);
        source
            .apply(&entry(2, &CommandPayload::set("a", value("1"))))
            .unwrap();
        source
            .apply(&entry(3, &CommandPayload::set("b", value(r#"{"deep":[true]}"#))))
            .unwrap();

        let mut snapshot = source.snapshot().unwrap();
        let mut sink = Vec::new();
        snapshot.persist(&mut sink).unwrap();
        snapshot.release();

        target.restore(&mut &sink[..]).unwrap();
        assert_eq!(contents(&source_store), contents(&target_store));
    }

    #[test]
    fn test_snapshot_mode_from_config() {
        #[derive(Deserialize)]
        struct Holder {
            mode: SnapshotMode,
        }
        let holder: Holder = toml::from_str(r#"mode = "full""#).unwrap();
        assert_eq!(holder.mode, SnapshotMode::Full);
        assert!(toml::from_str::<Holder>(r#"mode = "partial""#).is_err());
    }
}
