//! Durable key-value storage backed by a fjall keyspace.
//!
//! Every call is a single atomic operation against the engine and writes are persisted
//! before they return. There is no cache in front of the engine.

use std::path::Path;

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use crate::command::Value;
use crate::error::{Error, Result};

const PARTITION_NAME: &str = "kv";

/// Longest key the engine accepts, in bytes.
pub const MAX_KEY_LEN: usize = u16::MAX as usize;

/// Rejects keys the engine cannot hold before they reach it.
pub(crate) fn check_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::Validation("key is empty".to_string()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(Error::Validation(format!(
            "key is {} bytes, the limit is {}",
            key.len(),
            MAX_KEY_LEN
        )));
    }
    Ok(())
}

/// Handle to the node's local storage. Cloning is cheap and clones share the same engine.
#[derive(Clone)]
pub struct Store {
    keyspace: Keyspace,
    partition: PartitionHandle,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let keyspace = Config::new(path).open()?;
        let partition = keyspace.open_partition(PARTITION_NAME, PartitionCreateOptions::default())?;
        Ok(Store {
            keyspace,
            partition,
        })
    }

    /// Reads the value stored under `key`.
    pub fn get(&self, key: &str) -> Result<Value> {
        check_key(key)?;
        match self.partition.get(key.as_bytes())? {
            Some(bytes) => Value::from_slice(&bytes),
            None => Err(Error::NotFound(key.to_string())),
        }
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn set(&self, key: &str, value: &Value) -> Result<()> {
        check_key(key)?;
        self.partition.insert(key.as_bytes(), value.as_bytes())?;
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    /// Removes `key`. Removing a key that does not exist is not an error.
    pub fn delete(&self, key: &str) -> Result<()> {
        check_key(key)?;
        self.partition.remove(key.as_bytes())?;
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    /// Every stored record, in key order.
    pub fn records(&self) -> impl Iterator<Item = Result<(String, Value)>> + '_ {
        self.partition.iter().map(|item| -> Result<(String, Value)> {
            let (key, value) = item?;
            let key = String::from_utf8_lossy(&key).into_owned();
            Ok((key, Value::from_slice(&value)?))
        })
    }
}
