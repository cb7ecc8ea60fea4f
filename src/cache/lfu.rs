//! A least-frequently-used cache with write-back.
//!
//! Entries live in frequency buckets kept in ascending order, so the coldest entries are always
//! at the head of the list. Entries written with [`Cache::set`] are dirty until either
//! [`Cache::write_back`] hands them to the write-back channel or they are evicted, in which case
//! they go to the eviction channel. Channel sends block while the cache lock is held; the
//! receiving ends are expected to be drained by dedicated consumers.

use std::borrow::Borrow;
use std::hash::Hash;

use ahash::RandomState;
use chrono::{Duration, Utc};
use crossbeam_channel::Sender;
use indexmap::IndexSet;
use parking_lot::Mutex;

type HashMap<K, V> = std::collections::HashMap<K, V, RandomState>;

type SendHook<K, V> = Box<dyn Fn(&K, &V) + Send + Sync>;

/// An entry leaving the cache, either evicted or written back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Eviction<K, V> {
    /// The entry's key.
    pub key: K,
    /// The entry's value at the time it left.
    pub value: V,
}

struct Entry<V> {
    value: V,
    bucket: usize,
    persisted: bool,
    last_access: i64,
}

struct Bucket<K> {
    freq: u64,
    keys: IndexSet<K, RandomState>,
    prev: Option<usize>,
    next: Option<usize>,
}

struct State<K, V> {
    values: HashMap<K, Entry<V>>,
    buckets: Vec<Bucket<K>>,
    free: Vec<usize>,
    head: Option<usize>,
    eviction_tx: Option<Sender<Eviction<K, V>>>,
    write_back_tx: Option<Sender<Eviction<K, V>>>,
    on_send: Option<SendHook<K, V>>,
}

/// A thread-safe LFU cache.
///
/// All operations take a single lock. Evicted entries that were never persisted are sent on the
/// eviction channel, if one is configured, and otherwise dropped.
pub struct Cache<K, V> {
    state: Mutex<State<K, V>>,
    upper_bound: usize,
    lower_bound: usize,
    ttl: i64,
    clock: fn() -> i64,
}

fn unix_now() -> i64 {
    Utc::now().timestamp()
}

impl<K, V> Default for Cache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Cache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// An unbounded cache without channels or TTL.
    pub fn new() -> Self {
        Cache {
            state: Mutex::new(State {
                values: HashMap::default(),
                buckets: Vec::new(),
                free: Vec::new(),
                head: None,
                eviction_tx: None,
                write_back_tx: None,
                on_send: None,
            }),
            upper_bound: 0,
            lower_bound: 0,
            ttl: 0,
            clock: unix_now,
        }
    }

    /// Evict down to `lower` entries whenever a [`set`](Self::set) leaves more than `upper`.
    ///
    /// Either bound being zero disables this. A lower bound above the upper one means nothing
    /// is ever evicted this way.
    pub fn with_bounds(mut self, upper: usize, lower: usize) -> Self {
        self.upper_bound = upper;
        self.lower_bound = lower;
        self
    }

    /// Drop entries that have not been accessed for longer than `ttl` on
    /// [`write_back`](Self::write_back). A zero TTL keeps entries forever.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl.num_seconds();
        self
    }

    /// Replaces the source of the current time, in unix seconds.
    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    /// Where evicted dirty entries are sent.
    pub fn with_eviction_channel(mut self, tx: Sender<Eviction<K, V>>) -> Self {
        self.state.get_mut().eviction_tx = Some(tx);
        self
    }

    /// Where dirty entries are sent by [`write_back`](Self::write_back).
    pub fn with_write_back_channel(mut self, tx: Sender<Eviction<K, V>>) -> Self {
        self.state.get_mut().write_back_tx = Some(tx);
        self
    }

    /// Calls `hook` with every entry right before it is sent on either channel.
    ///
    /// The hook runs with the cache locked and must not call back into the cache.
    pub fn with_send_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&K, &V) + Send + Sync + 'static,
    {
        self.state.get_mut().on_send = Some(Box::new(hook));
        self
    }

    /// Drops both senders so that consumers see the channels disconnect.
    ///
    /// Evictions and write-backs after this point are not delivered anywhere.
    pub fn close_channels(&self) {
        let mut state = self.state.lock();
        state.eviction_tx = None;
        state.write_back_tx = None;
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.state.lock().values.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up `key`, counting the access.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let now = (self.clock)();
        let mut state = self.state.lock();
        state.touch(key, now).map(|e| e.value.clone())
    }

    /// Looks up `key`, and on a miss caches whatever `supplier` produces.
    ///
    /// A supplied value is considered persisted, since it presumably came from the backing
    /// store. Errors and `None` from the supplier are returned as-is and nothing is cached. The
    /// supplier runs with the cache locked and must not call back into the cache.
    pub fn get_or_set<F, E>(&self, key: K, supplier: F) -> Result<Option<V>, E>
    where
        F: FnOnce() -> Result<Option<V>, E>,
    {
        let now = (self.clock)();
        let mut state = self.state.lock();
        if let Some(e) = state.touch(&key, now) {
            return Ok(Some(e.value.clone()));
        }
        let value = match supplier()? {
            Some(v) => v,
            None => return Ok(None),
        };
        state.insert(key, value.clone(), true, now);
        Ok(Some(value))
    }

    /// Stores `value` under `key` and marks it dirty.
    pub fn set(&self, key: K, value: V) {
        let now = (self.clock)();
        let mut state = self.state.lock();
        match state.touch(&key, now) {
            Some(e) => {
                e.value = value;
                e.persisted = false;
            }
            None => state.insert(key, value, false, now),
        }

        let len = state.values.len();
        if self.upper_bound > 0 && self.lower_bound > 0 && len > self.upper_bound {
            let evicted = state.evict(len.saturating_sub(self.lower_bound));
            debug!("cache over its upper bound, evicted {} entries", evicted);
        }
    }

    /// Removes `key` without writing it back.
    pub fn delete<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.state.lock().remove(key).map(|(_, e)| e.value)
    }

    /// Evicts up to `count` of the least frequently used entries and returns how many went.
    pub fn evict(&self, count: usize) -> usize {
        self.state.lock().evict(count)
    }

    /// Sends every dirty entry to the write-back channel and drops expired entries.
    ///
    /// Entries are only marked persisted when a write-back channel is configured. Returns the
    /// number of entries written back and the number dropped.
    pub fn write_back(&self) -> (usize, usize) {
        let now = (self.clock)();
        let mut state = self.state.lock();
        let State {
            values,
            write_back_tx,
            on_send,
            ..
        } = &mut *state;

        let mut persisted = 0;
        let mut expired = Vec::new();
        for (key, entry) in values.iter_mut() {
            if !entry.persisted {
                if let Some(tx) = write_back_tx.as_ref() {
                    send(
                        tx,
                        on_send.as_ref(),
                        Eviction {
                            key: key.clone(),
                            value: entry.value.clone(),
                        },
                        "write-back",
                    );
                    entry.persisted = true;
                    persisted += 1;
                }
            }
            if self.ttl > 0 && now - entry.last_access > self.ttl {
                expired.push(key.clone());
            }
        }

        for key in &expired {
            state.remove(key);
        }
        (persisted, expired.len())
    }
}

impl<K, V> Cache<K, V>
where
    K: Hash + Eq + Clone + AsRef<str>,
    V: Clone,
{
    /// Removes every entry whose key starts with `prefix`, without writing any of them back.
    pub fn delete_prefix(&self, prefix: &str) -> usize {
        let mut state = self.state.lock();
        let doomed: Vec<K> = state
            .values
            .keys()
            .filter(|k| k.as_ref().starts_with(prefix))
            .cloned()
            .collect();
        for key in &doomed {
            state.remove(key);
        }
        doomed.len()
    }
}

fn send<K, V>(
    tx: &Sender<Eviction<K, V>>,
    hook: Option<&SendHook<K, V>>,
    e: Eviction<K, V>,
    channel: &str,
) {
    if let Some(hook) = hook {
        hook(&e.key, &e.value);
    }
    if tx.send(e).is_err() {
        warn!("{} channel is disconnected, dropping entry", channel);
    }
}

impl<K, V> State<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Allocates a bucket for `freq` right after `prev`, or at the head.
    fn new_bucket(&mut self, freq: u64, prev: Option<usize>) -> usize {
        let next = match prev {
            Some(p) => self.buckets[p].next,
            None => self.head,
        };
        let bucket = Bucket {
            freq,
            keys: IndexSet::default(),
            prev,
            next,
        };
        let i = match self.free.pop() {
            Some(i) => {
                self.buckets[i] = bucket;
                i
            }
            None => {
                self.buckets.push(bucket);
                self.buckets.len() - 1
            }
        };
        match prev {
            Some(p) => self.buckets[p].next = Some(i),
            None => self.head = Some(i),
        }
        if let Some(n) = next {
            self.buckets[n].prev = Some(i);
        }
        i
    }

    fn unlink(&mut self, i: usize) {
        let (prev, next) = (self.buckets[i].prev, self.buckets[i].next);
        match prev {
            Some(p) => self.buckets[p].next = next,
            None => self.head = next,
        }
        if let Some(n) = next {
            self.buckets[n].prev = prev;
        }
        self.free.push(i);
    }

    /// Moves `key`, already taken out of `from`, into the bucket with the next frequency.
    fn promote(&mut self, key: K, from: Option<usize>) -> usize {
        let (freq, next) = match from {
            Some(b) => (self.buckets[b].freq + 1, self.buckets[b].next),
            None => (1, self.head),
        };
        let to = match next {
            Some(n) if self.buckets[n].freq == freq => n,
            _ => self.new_bucket(freq, from),
        };
        self.buckets[to].keys.insert(key);
        if let Some(b) = from {
            if self.buckets[b].keys.is_empty() {
                self.unlink(b);
            }
        }
        to
    }

    fn touch<Q>(&mut self, key: &Q, now: i64) -> Option<&mut Entry<V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let from = self.values.get(key)?.bucket;
        let (_, owned) = self.buckets[from].keys.swap_remove_full(key)?;
        let to = self.promote(owned, Some(from));
        let entry = self.values.get_mut(key)?;
        entry.bucket = to;
        entry.last_access = now;
        Some(entry)
    }

    fn insert(&mut self, key: K, value: V, persisted: bool, now: i64) {
        let bucket = self.promote(key.clone(), None);
        self.values.insert(
            key,
            Entry {
                value,
                bucket,
                persisted,
                last_access: now,
            },
        );
    }

    fn remove<Q>(&mut self, key: &Q) -> Option<(K, Entry<V>)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let (k, entry) = self.values.remove_entry(key)?;
        let bucket = &mut self.buckets[entry.bucket];
        bucket.keys.swap_remove(key);
        if bucket.keys.is_empty() {
            self.unlink(entry.bucket);
        }
        Some((k, entry))
    }

    fn evict(&mut self, count: usize) -> usize {
        let mut evicted = 0;
        while evicted < count {
            let head = match self.head {
                Some(h) => h,
                None => break,
            };
            let key = match self.buckets[head].keys.swap_remove_index(0) {
                Some(k) => k,
                None => {
                    self.unlink(head);
                    continue;
                }
            };
            if self.buckets[head].keys.is_empty() {
                self.unlink(head);
            }
            if let Some(entry) = self.values.remove(&key) {
                if !entry.persisted {
                    if let Some(tx) = &self.eviction_tx {
                        send(
                            tx,
                            self.on_send.as_ref(),
                            Eviction {
                                key,
                                value: entry.value,
                            },
                            "eviction",
                        );
                    }
                }
            }
            evicted += 1;
        }
        evicted
    }
}
