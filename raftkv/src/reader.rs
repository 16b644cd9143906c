//! Local reads. Served by any node from its own store, so a follower may answer with a value
//! the leader has already replaced.

use crate::command::Value;
use crate::error::Result;
use crate::gatekeeper::validate_key;
use crate::store::Store;

#[derive(Clone)]
pub struct Reader {
    store: Store,
}

impl Reader {
    pub fn new(store: Store) -> Self {
        Reader { store }
    }

    pub fn read(&self, key: &str) -> Result<Value> {
        let key = validate_key(key)?;
        self.store.get(key)
    }
}
