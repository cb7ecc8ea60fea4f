//! Caches that keep decoded values in memory in front of a [`KvStore`].
//!
//! [`lfu::Cache`] does the bookkeeping. [`Cache`] wires it to a store: misses are loaded and
//! decoded from the store, and dirty values are encoded and persisted by two background
//! consumers, one for evicted entries and one for written-back entries.
//!
//! Until a consumer has persisted a value it is kept in a pending map, and lookups read it from
//! there. A key whose value is still queued when it is evicted, written back again or deleted
//! is persisted at most once more, with its latest value, or not at all after a delete.

pub mod lfu;

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use ahash::RandomState;
use chrono::Duration;
use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;

use crate::encoding::DecodeError;
use crate::error::{Error, Result};
use crate::storage::KvStore;

use self::lfu::Eviction;

/// Converts cached values to and from their stored form.
pub trait Codec<V>: Send + Sync {
    /// The stored form of `value`.
    fn encode(&self, value: &V) -> Vec<u8>;

    /// Decodes a value produced by [`encode`](Self::encode).
    fn decode(&self, data: &[u8]) -> Result<V, DecodeError>;

    /// A fresh value for a key that is in neither the cache nor the store.
    fn new_value(&self) -> V;
}

/// Tuning for a [`Cache`].
#[derive(Clone, Debug)]
pub struct Options {
    /// Once a write leaves more than this many entries, the cache evicts down to
    /// [`lower_bound`](Self::lower_bound). Zero disables bounds.
    pub upper_bound: usize,

    /// See [`upper_bound`](Self::upper_bound).
    pub lower_bound: usize,

    /// Entries not accessed for this long are dropped on write-back. Zero keeps them.
    pub ttl: Duration,

    /// Capacity of the eviction and write-back channels.
    pub channel_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            upper_bound: 0,
            lower_bound: 0,
            ttl: Duration::zero(),
            channel_size: 1,
        }
    }
}

// Values handed to a consumer but not persisted yet, by cache key.
type Pending<V> = Arc<Mutex<HashMap<String, V, RandomState>>>;

/// An LFU cache backed by a [`KvStore`], with values stored under `prefix + key`.
pub struct Cache<V> {
    lfu: lfu::Cache<String, V>,
    store: Arc<dyn KvStore>,
    prefix: String,
    codec: Arc<dyn Codec<V>>,
    pending: Pending<V>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

impl<V> Cache<V>
where
    V: Clone + Send + 'static,
{
    /// Creates the cache and starts its consumers.
    pub fn new<C>(
        store: Arc<dyn KvStore>,
        prefix: &str,
        codec: C,
        opt: &Options,
    ) -> std::io::Result<Self>
    where
        C: Codec<V> + 'static,
    {
        let codec: Arc<dyn Codec<V>> = Arc::new(codec);
        let pending: Pending<V> = Arc::default();
        let (eviction_tx, eviction_rx) = bounded(opt.channel_size);
        let (write_back_tx, write_back_rx) = bounded(opt.channel_size);

        let mut consumers = Vec::with_capacity(2);
        for (name, rx) in [("evict", eviction_rx), ("write-back", write_back_rx)] {
            let consumer = Consumer {
                store: Arc::clone(&store),
                prefix: prefix.to_string(),
                codec: Arc::clone(&codec),
                pending: Arc::clone(&pending),
            };
            let handle = thread::Builder::new()
                .name(format!("{}{}", prefix, name))
                .spawn(move || consumer.run(rx))?;
            consumers.push(handle);
        }

        let queued = Arc::clone(&pending);
        let lfu = lfu::Cache::new()
            .with_bounds(opt.upper_bound, opt.lower_bound)
            .with_ttl(opt.ttl)
            .with_eviction_channel(eviction_tx)
            .with_write_back_channel(write_back_tx)
            .with_send_hook(move |key: &String, value: &V| {
                queued.lock().insert(key.clone(), value.clone());
            });

        Ok(Cache {
            lfu,
            store,
            prefix: prefix.to_string(),
            codec,
            pending,
            consumers: Mutex::new(consumers),
        })
    }

    /// Caches `value` under `key`. It reaches the store on eviction or write-back.
    pub fn put(&self, key: &str, value: V) {
        self.lfu.set(key.to_string(), value);
    }

    /// The value for `key`, from memory or else from the store.
    pub fn lookup(&self, key: &str) -> Result<Option<V>> {
        self.lfu.get_or_set(key.to_string(), || self.load(key))
    }

    /// Like [`lookup`](Self::lookup), but creates a value when the key is unknown.
    pub fn get_or_create(&self, key: &str) -> Result<V> {
        let v = self.lfu.get_or_set(key.to_string(), || {
            Ok::<_, Error>(Some(match self.load(key)? {
                Some(v) => v,
                None => self.codec.new_value(),
            }))
        })?;
        Ok(v.unwrap_or_else(|| self.codec.new_value()))
    }

    /// Removes `key` from memory and from the store. A value still queued for persisting is
    /// dropped.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.lfu.delete(key);
        let mut pending = self.pending.lock();
        pending.remove(key);
        self.store.delete(self.store_key(key).as_bytes())?;
        Ok(())
    }

    /// Removes every key starting with `prefix` from memory and from the store, queued values
    /// included.
    pub fn discard_prefix(&self, prefix: &str) -> Result<usize> {
        self.lfu.delete_prefix(prefix);
        let mut pending = self.pending.lock();
        pending.retain(|k, _| !k.starts_with(prefix));
        Ok(self.store.delete_prefix(self.store_key(prefix).as_bytes())?)
    }

    /// Evicts the given fraction of the entries, rounding up.
    pub fn evict(&self, percent: f64) -> usize {
        let count = (self.lfu.len() as f64 * percent.clamp(0.0, 1.0)).ceil() as usize;
        self.lfu.evict(count)
    }

    /// Hands all dirty entries to the write-back consumer and drops expired ones.
    pub fn write_back(&self) -> (usize, usize) {
        self.lfu.write_back()
    }

    /// Persists and drops every entry, then stops the consumers.
    ///
    /// The cache keeps working in memory afterwards, but nothing it holds reaches the store.
    pub fn flush(&self) {
        let evicted = self.lfu.evict(self.lfu.len());
        self.lfu.close_channels();
        for handle in self.consumers.lock().drain(..) {
            if handle.join().is_err() {
                error!("{}: cache consumer panicked", self.prefix);
            }
        }
        debug!("{}: flushed {} entries", self.prefix, evicted);
    }

    /// Number of entries in memory.
    pub fn len(&self) -> usize {
        self.lfu.len()
    }

    /// Whether no entries are in memory.
    pub fn is_empty(&self) -> bool {
        self.lfu.is_empty()
    }

    fn store_key(&self, key: &str) -> String {
        let mut k = String::with_capacity(self.prefix.len() + key.len());
        k.push_str(&self.prefix);
        k.push_str(key);
        k
    }

    fn load(&self, key: &str) -> Result<Option<V>> {
        if let Some(v) = self.pending.lock().get(key) {
            return Ok(Some(v.clone()));
        }
        let sk = self.store_key(key);
        let data = match self.store.get(sk.as_bytes())? {
            Some(data) => data,
            None => return Ok(None),
        };
        self.codec
            .decode(&data)
            .map(Some)
            .map_err(|source| Error::Decode { key: sk, source })
    }
}

struct Consumer<V> {
    store: Arc<dyn KvStore>,
    prefix: String,
    codec: Arc<dyn Codec<V>>,
    pending: Pending<V>,
}

impl<V> Consumer<V> {
    // Persists the latest pending value of every received key. The pending lock is held until
    // the store has it, so a lookup finds the value in one place or the other.
    fn run(self, rx: Receiver<Eviction<String, V>>) {
        for Eviction { key, .. } in rx.iter() {
            let mut pending = self.pending.lock();
            let value = match pending.remove(&key) {
                Some(v) => v,
                // persisted with a later send, or deleted
                None => continue,
            };
            let data = self.codec.encode(&value);
            let sk = format!("{}{}", self.prefix, key);
            if let Err(e) = self.store.set(sk.as_bytes(), &data) {
                error!("failed to persist {}: {}", sk, e);
                pending.insert(key, value);
            }
        }
    }
}
