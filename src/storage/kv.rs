//! The persistent key-value store that segments and trees are written back to.

use std::collections::BTreeMap;
use std::io;
use std::ops::Bound;

use parking_lot::RwLock;

/// An ordered byte-keyed store.
///
/// Implementations must be safe to share between the threads that write back cache entries and
/// the threads serving reads.
pub trait KvStore: Send + Sync {
    /// The value stored under `key`, if any.
    fn get(&self, key: &[u8]) -> io::Result<Option<Vec<u8>>>;

    /// Stores `value` under `key`, replacing any previous value.
    fn set(&self, key: &[u8], value: &[u8]) -> io::Result<()>;

    /// Removes `key`. Removing a missing key is not an error.
    fn delete(&self, key: &[u8]) -> io::Result<()>;

    /// Every key that starts with `prefix`, in lexicographic order.
    fn scan_prefix(&self, prefix: &[u8]) -> io::Result<Vec<Vec<u8>>>;

    /// Removes every key that starts with `prefix` and returns how many there were.
    fn delete_prefix(&self, prefix: &[u8]) -> io::Result<usize> {
        let keys = self.scan_prefix(prefix)?;
        for key in &keys {
            self.delete(key)?;
        }
        Ok(keys.len())
    }
}

/// A [`KvStore`] that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> io::Result<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn set(&self, key: &[u8], value: &[u8]) -> io::Result<()> {
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> io::Result<()> {
        self.data.write().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> io::Result<Vec<Vec<u8>>> {
        let data = self.data.read();
        Ok(data
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn delete_prefix(&self, prefix: &[u8]) -> io::Result<usize> {
        let mut data = self.data.write();
        let before = data.len();
        data.retain(|k, _| !k.starts_with(prefix));
        Ok(before - data.len())
    }
}
