use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use phantom_core::error::StorageError;
use phantom_core::mock::{Mock, Session};
use phantom_core::storage::{MockReader, MockWriter};

/// `FjallMockStore` is a concrete backend for the narrow [`MockWriter`] /
/// [`MockReader`] traits — the session/mock data model imposes no storage
/// format of its own, this is simply the one this crate ships.
///
/// Two partitions: `mocks` holds the serialized `Mock` keyed by
/// `{session}\0{name}`, and `by_session_order` holds `{session}\0{seq_be}`
/// → `name`, so `load` can return mocks in the exact order `write` produced
/// them (the one contract `MockReader` promises, see §6).
pub struct FjallMockStore {
    keyspace: Keyspace,
    mocks: PartitionHandle,
    by_session_order: PartitionHandle,
    next_seq: Mutex<HashMap<String, u64>>,
}

impl FjallMockStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let keyspace = Config::new(path)
            .open()
            .map_err(|e| StorageError::Open(e.to_string()))?;

        let kv_sep_opts =
            PartitionCreateOptions::default().with_kv_separation(fjall::KvSeparationOptions::default());

        let mocks = keyspace
            .open_partition("mocks", kv_sep_opts)
            .map_err(|e| StorageError::Open(e.to_string()))?;

        let by_session_order = keyspace
            .open_partition("by_session_order", PartitionCreateOptions::default())
            .map_err(|e| StorageError::Open(e.to_string()))?;

        Ok(Self {
            keyspace,
            mocks,
            by_session_order,
            next_seq: Mutex::new(HashMap::new()),
        })
    }

    /// Picks the next sequence number for `session`, seeding the in-memory
    /// counter from the highest sequence already on disk the first time a
    /// session is touched in this process — otherwise a reopened store would
    /// restart numbering at 0 and silently overwrite (or misorder) mocks
    /// written before the restart.
    fn next_seq_for(&self, session: &Session) -> u64 {
        let mut counters = self.next_seq.lock().expect("sequence counter mutex poisoned");
        if !counters.contains_key(&session.name) {
            let next = self.highest_existing_seq(session).map_or(0, |s| s + 1);
            counters.insert(session.name.clone(), next);
        }
        let seq = counters.get_mut(&session.name).unwrap();
        let assigned = *seq;
        *seq += 1;
        assigned
    }

    fn highest_existing_seq(&self, session: &Session) -> Option<u64> {
        let prefix = order_prefix(session);
        self.by_session_order
            .prefix(&prefix)
            .filter_map(|entry| entry.ok())
            .filter_map(|(key, _)| {
                key.get(prefix.len()..)
                    .and_then(|tail| tail.try_into().ok())
                    .map(u64::from_be_bytes)
            })
            .max()
    }
}

fn mock_key(session: &Session, name: &str) -> Vec<u8> {
    let mut key = session.name.as_bytes().to_vec();
    key.push(0);
    key.extend_from_slice(name.as_bytes());
    key
}

fn order_prefix(session: &Session) -> Vec<u8> {
    let mut prefix = session.name.as_bytes().to_vec();
    prefix.push(0);
    prefix
}

fn order_key(session: &Session, seq: u64) -> Vec<u8> {
    let mut key = order_prefix(session);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

impl MockWriter for FjallMockStore {
    fn write(&self, session: &Session, mock: &Mock) -> Result<(), StorageError> {
        let serialized = serde_json::to_vec(mock).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let seq = self.next_seq_for(session);

        let mut batch = self.keyspace.batch();
        batch.insert(&self.mocks, mock_key(session, &mock.name), serialized);
        batch.insert(&self.by_session_order, order_key(session, seq), mock.name.as_bytes());
        batch.commit().map_err(|e| StorageError::Write(e.to_string()))?;

        Ok(())
    }
}

impl MockReader for FjallMockStore {
    fn load(&self, session: &Session) -> Result<Vec<Mock>, StorageError> {
        let prefix = order_prefix(session);
        let mut out = Vec::new();
        for entry in self.by_session_order.prefix(&prefix) {
            let (_key, name_bytes) = entry.map_err(|e| StorageError::Read(e.to_string()))?;
            let name = String::from_utf8_lossy(&name_bytes).into_owned();
            let Some(value) = self
                .mocks
                .get(mock_key(session, &name))
                .map_err(|e| StorageError::Read(e.to_string()))?
            else {
                continue;
            };
            let mock: Mock =
                serde_json::from_slice(&value).map_err(|e| StorageError::Serialization(e.to_string()))?;
            out.push(mock);
        }
        Ok(out)
    }
}
