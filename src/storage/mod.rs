//! Segments and their profile trees, cached in memory and persisted to a [`KvStore`].
//!
//! Every application (a [`Key`]) has one [`Segment`] stored under `s:<segment key>`. Each
//! present node of the segment has a [`CallTree`] stored under `t:<segment key>:<depth>:<time>`
//! holding everything written to that node's time range. A write merges the written tree, scaled
//! by the share of the write that lands in the node, into every node the segment reports; a read
//! merges the trees of the nodes that cover the query range.

mod kv;

pub use self::kv::{KvStore, MemoryStore};

use std::collections::BTreeSet;
use std::convert::Infallible;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

use crate::cache::{self, Cache, Codec};
use crate::call_tree::{CallTree, Scratch};
use crate::encoding::DecodeError;
use crate::error::{Error, Result};
use crate::segment::{
    segment_key_to_tree_key, AggregationType, Key, Metadata, Ratio, RetentionPolicy, Segment,
    Timeline, Units,
};

const SEGMENT_PREFIX: &str = "s:";
const TREE_PREFIX: &str = "t:";

const DEFAULT_MAX_NODES_SERIALIZATION: usize = 2048;

/// The default number of threads used for retention sweeps: one per available core.
#[doc(hidden)]
pub static DEFAULT_NTHREADS: Lazy<usize> =
    Lazy::new(|| thread::available_parallelism().map_or(1, NonZeroUsize::get));

type Shared<T> = Arc<Mutex<T>>;

/// Storage configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Once a cache holds more entries than this, it evicts down to
    /// [`cache_lower_bound`](Self::cache_lower_bound). Zero disables bounds.
    pub cache_upper_bound: usize,

    /// See [`cache_upper_bound`](Self::cache_upper_bound).
    pub cache_lower_bound: usize,

    /// Cached entries not accessed for this long are dropped on write-back. Zero keeps them.
    pub cache_ttl: Duration,

    /// Trees are trimmed to about this many nodes before they are persisted. Zero keeps every
    /// node.
    pub max_nodes_serialization: usize,

    /// The number of threads a retention sweep spreads segments over.
    ///
    /// [Default value](Self::default): the number of available cores.
    pub nthreads: usize,

    /// Data older than this is deleted, and writes older than this are refused. Zero keeps
    /// data forever.
    pub retention: Duration,

    /// `retention_levels[i]` is how long nodes of depth `i` are kept. Zero entries keep the
    /// level forever.
    pub retention_levels: Vec<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_upper_bound: 0,
            cache_lower_bound: 0,
            cache_ttl: Duration::zero(),
            max_nodes_serialization: DEFAULT_MAX_NODES_SERIALIZATION,
            nthreads: *DEFAULT_NTHREADS,
            retention: Duration::zero(),
            retention_levels: Vec::new(),
        }
    }
}

impl Config {
    /// The retention policy these settings describe, measured back from `now`.
    pub fn retention_policy(&self, now: DateTime<Utc>) -> RetentionPolicy {
        RetentionPolicy::at(now)
            .set_absolute_period(self.retention)
            .set_levels(&self.retention_levels)
    }
}

/// A profile to store.
#[derive(Clone, Debug)]
pub struct PutInput {
    /// The application and labels the profile belongs to.
    pub key: Key,
    /// Start of the profiled period.
    pub start_time: DateTime<Utc>,
    /// End of the profiled period.
    pub end_time: DateTime<Utc>,
    /// The profile.
    pub tree: CallTree,
    /// Name of the profiler that produced it.
    pub spy_name: String,
    /// Samples per second.
    pub sample_rate: u32,
    /// What a sample counts.
    pub units: Units,
    /// How overlapping profiles combine.
    pub aggregation_type: AggregationType,
}

/// A query.
#[derive(Clone, Debug)]
pub struct GetInput {
    /// The application and labels to read.
    pub key: Key,
    /// Start of the queried range.
    pub start_time: DateTime<Utc>,
    /// End of the queried range.
    pub end_time: DateTime<Utc>,
}

/// The answer to a [`GetInput`].
#[derive(Clone, Debug)]
pub struct GetOutput {
    /// Everything written to the queried range, merged.
    pub tree: CallTree,
    /// Samples over the queried range.
    pub timeline: Timeline,
    /// What the segment knows about its profiles.
    pub metadata: Metadata,
}

/// The storage engine.
pub struct Storage {
    config: Config,
    segments: Cache<Shared<Segment>>,
    trees: Cache<Shared<CallTree>>,
    keys: RwLock<BTreeSet<String>>,
    put_lock: Mutex<()>,
}

impl Storage {
    /// Opens storage on top of `store`, picking up the segments already in it.
    pub fn new(config: Config, store: Arc<dyn KvStore>) -> Result<Self> {
        let opt = cache::Options {
            upper_bound: config.cache_upper_bound,
            lower_bound: config.cache_lower_bound,
            ttl: config.cache_ttl,
            ..Default::default()
        };
        let segments = Cache::new(Arc::clone(&store), SEGMENT_PREFIX, SegmentCodec, &opt)?;
        let trees = Cache::new(
            Arc::clone(&store),
            TREE_PREFIX,
            TreeCodec {
                max_nodes: config.max_nodes_serialization,
            },
            &opt,
        )?;

        let mut keys = BTreeSet::new();
        for raw in store.scan_prefix(SEGMENT_PREFIX.as_bytes())? {
            match String::from_utf8(raw) {
                Ok(k) => {
                    keys.insert(k[SEGMENT_PREFIX.len()..].to_string());
                }
                Err(e) => warn!("ignoring segment key that is not valid UTF-8: {:?}", e.as_bytes()),
            }
        }
        info!("loaded {} segment keys", keys.len());

        Ok(Storage {
            config,
            segments,
            trees,
            keys: RwLock::new(keys),
            put_lock: Mutex::new(()),
        })
    }

    /// The configuration the storage was opened with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stores a profile.
    pub fn put(&self, pi: &PutInput) -> Result<()> {
        if let Some(threshold) = self.retention_threshold() {
            if pi.start_time < threshold {
                return Err(Error::Retention(pi.start_time));
            }
        }

        let sk = pi.key.segment_key();
        let samples = pi.tree.total();
        debug!(
            "put {} [{}, {}) with {} samples",
            sk, pi.start_time, pi.end_time, samples
        );

        let _guard = self.put_lock.lock();
        let segment = self.segments.get_or_create(&sk)?;
        let mut writes = Vec::new();
        {
            let mut s = segment.lock();
            s.set_metadata(Metadata {
                spy_name: pi.spy_name.clone(),
                sample_rate: pi.sample_rate,
                units: pi.units,
                aggregation_type: pi.aggregation_type,
            });
            s.put(pi.start_time, pi.end_time, samples, |depth, t, r, addons| {
                writes.push((depth, t, r, addons.to_vec()));
            })?;
        }
        self.segments.put(&sk, segment);
        self.keys.write().insert(sk.clone());

        let mut scratch = Scratch::new();
        for (depth, t, r, addons) in writes {
            let mut delta = pi.tree.scaled(r);
            for addon in addons {
                let ak = segment_key_to_tree_key(&sk, addon.depth, addon.time);
                if let Some(tree) = self.trees.lookup(&ak)? {
                    delta.merge_with(&tree.lock(), &mut scratch);
                }
            }

            let tk = segment_key_to_tree_key(&sk, depth, t);
            let tree = self.trees.get_or_create(&tk)?;
            tree.lock().merge_with(&delta, &mut scratch);
            self.trees.put(&tk, tree);
        }
        Ok(())
    }

    /// Reads the merged profile of the key over the queried range.
    ///
    /// Returns `None` if the key is unknown or nothing was written in the range.
    pub fn get(&self, gi: &GetInput) -> Result<Option<GetOutput>> {
        let sk = gi.key.segment_key();
        debug!("get {} [{}, {})", sk, gi.start_time, gi.end_time);
        let segment = match self.segments.lookup(&sk)? {
            Some(s) => s,
            None => return Ok(None),
        };

        let mut timeline = Timeline::generate(gi.start_time, gi.end_time);
        let mut nodes = Vec::new();
        let metadata = {
            let s = segment.lock();
            timeline.populate(&s);
            s.get(gi.start_time, gi.end_time, |info, r| {
                nodes.push((info.depth, info.time, info.writes, r));
            });
            s.metadata().clone()
        };

        let mut scratch = Scratch::new();
        let mut result: Option<CallTree> = None;
        let mut writes_total = 0;
        for (depth, t, writes, r) in nodes {
            let tree = match self.trees.lookup(&segment_key_to_tree_key(&sk, depth, t))? {
                Some(tree) => tree,
                None => continue,
            };
            let x = tree.lock().scaled(r);
            writes_total += writes;
            result = Some(match result.take() {
                Some(mut acc) => {
                    acc.merge_with(&x, &mut scratch);
                    acc
                }
                None => x,
            });
        }

        let mut tree = match result {
            Some(tree) => tree,
            None => return Ok(None),
        };
        if writes_total > 0 && metadata.aggregation_type == AggregationType::Average {
            tree = tree.scaled(Ratio::new(1, writes_total));
        }
        Ok(Some(GetOutput {
            tree,
            timeline,
            metadata,
        }))
    }

    /// Removes the key's segment and all of its trees.
    pub fn delete(&self, key: &Key) -> Result<()> {
        let sk = key.segment_key();
        let _guard = self.put_lock.lock();
        self.delete_segment(&sk)
    }

    /// The keys of every stored segment.
    pub fn segment_keys(&self) -> Vec<Key> {
        self.keys
            .read()
            .iter()
            .filter_map(|sk| match Key::parse(sk) {
                Ok(k) => Some(k),
                Err(e) => {
                    warn!("skipping unparsable segment key {}: {}", sk, e);
                    None
                }
            })
            .collect()
    }

    /// Deletes all data `rp` marks as deletable, dropping segments that end up empty.
    pub fn enforce_retention_policy(&self, rp: &RetentionPolicy) -> Result<()> {
        let keys: Vec<String> = self.keys.read().iter().cloned().collect();
        info!("enforcing retention policy on {} segments", keys.len());

        #[cfg(feature = "multithreaded")]
        {
            let nthreads = self.config.nthreads.min(keys.len());
            if nthreads > 1 {
                let chunk = (keys.len() + nthreads - 1) / nthreads;
                let swept = crossbeam_utils::thread::scope(|scope| {
                    let handles: Vec<_> = keys
                        .chunks(chunk)
                        .map(|chunk| {
                            scope.spawn(move |_| {
                                chunk
                                    .iter()
                                    .try_for_each(|sk| self.enforce_retention_on(sk, rp))
                            })
                        })
                        .collect();
                    handles.into_iter().try_for_each(|h| match h.join() {
                        Ok(res) => res,
                        Err(panic) => std::panic::resume_unwind(panic),
                    })
                });
                return match swept {
                    Ok(res) => res,
                    Err(panic) => std::panic::resume_unwind(panic),
                };
            }
        }

        keys.iter()
            .try_for_each(|sk| self.enforce_retention_on(sk, rp))
    }

    fn enforce_retention_on(&self, sk: &str, rp: &RetentionPolicy) -> Result<()> {
        // a put landing between the walk and the prune would lose its trees
        let _guard = self.put_lock.lock();
        let segment = match self.segments.lookup(sk)? {
            Some(s) => s,
            None => {
                self.keys.write().remove(sk);
                return Ok(());
            }
        };

        let mut doomed = Vec::new();
        let emptied = segment
            .lock()
            .walk_nodes_to_delete(rp, |depth, t| {
                doomed.push(segment_key_to_tree_key(sk, depth, t));
                Ok::<_, Infallible>(())
            })
            .unwrap_or_else(|never| match never {});
        if emptied {
            debug!("{} has no data left, deleting it", sk);
            return self.delete_segment(sk);
        }

        for tk in &doomed {
            self.trees.delete(tk)?;
        }
        segment.lock().delete_nodes_before(rp);
        self.segments.put(sk, segment);
        debug!("{}: deleted {} trees", sk, doomed.len());
        Ok(())
    }

    fn delete_segment(&self, sk: &str) -> Result<()> {
        self.segments.delete(sk)?;
        let mut prefix = String::with_capacity(sk.len() + 1);
        prefix.push_str(sk);
        prefix.push(':');
        self.trees.discard_prefix(&prefix)?;
        self.keys.write().remove(sk);
        Ok(())
    }

    /// Hands every dirty segment and tree to the store and drops expired cache entries.
    ///
    /// Returns the number of entries written back and the number dropped.
    pub fn write_back(&self) -> (usize, usize) {
        let (s_persisted, s_expired) = self.segments.write_back();
        let (t_persisted, t_expired) = self.trees.write_back();
        debug!(
            "write-back: {} segments, {} trees persisted; {} entries expired",
            s_persisted,
            t_persisted,
            s_expired + t_expired
        );
        (s_persisted + t_persisted, s_expired + t_expired)
    }

    /// Evicts the given fraction of both caches and returns the number of evicted entries.
    pub fn evict_caches(&self, percent: f64) -> usize {
        self.segments.evict(percent) + self.trees.evict(percent)
    }

    /// Persists everything and stops the background consumers.
    pub fn flush(&self) {
        self.segments.flush();
        self.trees.flush();
        info!("storage flushed");
    }

    fn retention_threshold(&self) -> Option<DateTime<Utc>> {
        if self.config.retention == Duration::zero() {
            return None;
        }
        Some(Utc::now() - self.config.retention)
    }
}

struct SegmentCodec;

impl Codec<Shared<Segment>> for SegmentCodec {
    fn encode(&self, value: &Shared<Segment>) -> Vec<u8> {
        value.lock().to_bytes()
    }

    fn decode(&self, data: &[u8]) -> Result<Shared<Segment>, DecodeError> {
        Ok(Arc::new(Mutex::new(Segment::from_bytes(data)?)))
    }

    fn new_value(&self) -> Shared<Segment> {
        Arc::new(Mutex::new(Segment::new()))
    }
}

struct TreeCodec {
    max_nodes: usize,
}

impl Codec<Shared<CallTree>> for TreeCodec {
    fn encode(&self, value: &Shared<CallTree>) -> Vec<u8> {
        let tree = value.lock();
        if self.max_nodes == 0 || tree.len() <= self.max_nodes {
            return tree.to_bytes();
        }
        let mut trimmed = tree.clone();
        drop(tree);
        trimmed.trim(self.max_nodes);
        trimmed.to_bytes()
    }

    fn decode(&self, data: &[u8]) -> Result<Shared<CallTree>, DecodeError> {
        Ok(Arc::new(Mutex::new(CallTree::from_bytes(data)?)))
    }

    fn new_value(&self) -> Shared<CallTree> {
        Arc::new(Mutex::new(CallTree::default()))
    }
}
