//! The segment tree: samples of one application, bucketed by time.
//!
//! A [`Segment`] is a 10-ary tree of time buckets. Leaves cover ten seconds, and every level
//! above covers ten times more (see [`durations`]). Nodes only keep counters; the profile data
//! that belongs to a node lives elsewhere and is addressed by the node's `(depth, time)` pair
//! (see [`Key::tree_key`]). Writes spread a sample count over the nodes they touch and tell the
//! caller which nodes must absorb the write. Reads do the reverse and report the nodes that
//! together cover a time range, each with the share of it that the range reads.
//!
//! Segments are not synchronized. Callers that share one across threads must wrap it in a
//! lock.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

mod durations;
mod key;
mod metadata;
mod node;
mod overlap;
mod retention;
mod serialization;
mod timeline;

pub use self::durations::{durations, truncate};
pub use self::key::{Key, ParseKeyError};
pub use self::metadata::{AggregationType, Metadata, Units, UnknownVariant};
pub use self::overlap::{overlap_read, overlap_write, Ratio};
pub use self::retention::RetentionPolicy;
pub use self::timeline::Timeline;

pub(crate) use self::key::segment_key_to_tree_key;

use self::durations::{duration, normalize, normalize_time};
use self::node::StreeNode;
use self::overlap::Rel;

/// Errors returned by [`Segment::put`] and [`Segment::insert`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The write ends before it starts.
    #[error("start time cannot be after end time")]
    StartAfterEnd,

    /// Covering the write would need a bucket wider than the coarsest ladder duration.
    #[error("segment tree reached max size, check start / end time parameters")]
    TreeMaxSize,
}

/// A present node below a node that is about to become present.
///
/// The data of an addon has to be folded into the new node's aggregate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Addon {
    /// Depth of the node.
    pub depth: usize,
    /// Start of the node's bucket.
    pub time: DateTime<Utc>,
}

/// The counters of a node reported by [`Segment::get`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    /// Depth of the node.
    pub depth: usize,
    /// Start of the node's bucket.
    pub time: DateTime<Utc>,
    /// Samples written at or under the node.
    pub samples: u64,
    /// Number of writes that touched the node.
    pub writes: u64,
}

/// Cutoffs of the retention policies already applied to a segment. Reads never descend
/// below them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Watermarks {
    pub(crate) absolute_time: Option<DateTime<Utc>>,
    pub(crate) levels: BTreeMap<usize, DateTime<Utc>>,
}

impl Watermarks {
    fn update(&mut self, rp: &RetentionPolicy) {
        if let Some(t) = rp.absolute_time {
            if self.absolute_time.map_or(true, |cur| t > cur) {
                self.absolute_time = Some(t);
            }
        }
        for (&depth, &t) in &rp.levels {
            let cur = self.levels.entry(depth).or_insert(t);
            if t > *cur {
                *cur = t;
            }
        }
    }
}

/// The time tree of one application, plus what is known about its profiles.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Segment {
    root: Option<Box<StreeNode>>,
    metadata: Metadata,
    watermarks: Watermarks,
}

impl Segment {
    /// An empty segment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether nothing has been written to the segment, or retention removed all of it.
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Number of nodes in the tree.
    pub fn node_count(&self) -> usize {
        self.root.as_ref().map_or(0, |root| root.node_count())
    }

    /// Depth of the root, if there is one.
    pub fn depth(&self) -> Option<usize> {
        self.root.as_ref().map(|root| root.depth)
    }

    /// Metadata of the profiles stored in the segment.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Replaces the segment's metadata.
    pub fn set_metadata(&mut self, metadata: Metadata) {
        self.metadata = metadata;
    }

    /// Start of the earliest bucket holding data.
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.root.as_ref().map(|root| root.start_time())
    }

    pub(crate) fn root(&self) -> Option<&StreeNode> {
        self.root.as_deref()
    }

    pub(crate) fn watermarks(&self) -> &Watermarks {
        &self.watermarks
    }

    /// Adds levels on top of the root until it covers `[st, et)`.
    fn grow_tree(&mut self, st: DateTime<Utc>, et: DateTime<Utc>) -> Result<(), Error> {
        let mut root = match self.root.take() {
            Some(root) => root,
            None => Box::new(StreeNode::new(normalize_time(st), 0)),
        };
        let st = st.min(root.time);
        let et = et.max(root.end_time());

        while !matches!(root.relationship(st, et), Rel::Inside | Rel::Match) {
            let depth = root.depth + 1;
            if depth >= durations().len() {
                self.root = Some(root);
                return Err(Error::TreeMaxSize);
            }
            let mut parent = Box::new(StreeNode::new(truncate(root.time, duration(depth)), depth));
            parent.samples = root.samples;
            parent.writes = root.writes;
            parent.replace(root);
            root = parent;
        }

        self.root = Some(root);
        Ok(())
    }

    /// Records a single sample at `t`, creating the nodes down to the leaf that covers it.
    ///
    /// Returns the leaf. Inserting the same instant again only bumps counters.
    pub fn insert(&mut self, t: DateTime<Utc>) -> Result<Addon, Error> {
        let st = normalize_time(t);
        self.grow_tree(st, st + duration(0))?;
        match self.root.as_mut() {
            Some(root) => Ok(root.insert(st)),
            None => unreachable!("grow_tree always leaves a root"),
        }
    }

    /// Writes `samples` spread evenly over `[st, et)`.
    ///
    /// `cb` receives `(depth, time, ratio, addons)` for every node whose aggregate has to
    /// absorb the write: `ratio` is the share of the write that lands in the node, and
    /// `addons` lists the previously present nodes below it when the node holds data for the
    /// first time.
    pub fn put<F>(&mut self, st: DateTime<Utc>, et: DateTime<Utc>, samples: u64, mut cb: F) -> Result<(), Error>
    where
        F: FnMut(usize, DateTime<Utc>, Ratio, &[Addon]),
    {
        let (st, et) = normalize(st, et);
        if st > et {
            return Err(Error::StartAfterEnd);
        }
        self.grow_tree(st, et)?;
        if let Some(root) = self.root.as_mut() {
            root.put(st, et, samples, &mut cb);
        }
        Ok(())
    }

    /// Reports the nodes that together cover `[st, et)`, each with the share of it the range
    /// reads.
    pub fn get<F>(&self, st: DateTime<Utc>, et: DateTime<Utc>, mut cb: F)
    where
        F: FnMut(&NodeInfo, Ratio),
    {
        let st = match self.watermarks.absolute_time {
            Some(abs) if st < abs => abs,
            _ => st,
        };
        let (st, et) = normalize(st, et);
        if st >= et {
            return;
        }
        if let Some(root) = &self.root {
            root.get(&self.watermarks, st, et, &mut cb);
        }
    }

    /// Removes every node `rp` marks as deletable, subtrees included. Later reads respect the
    /// policy's cutoffs.
    ///
    /// Returns `true` if the segment is empty afterwards.
    pub fn delete_nodes_before(&mut self, rp: &RetentionPolicy) -> bool {
        let rp = rp.normalized();
        let root = match self.root.as_mut() {
            Some(root) => root,
            None => return true,
        };
        let removed = root.delete_nodes_before(&rp);
        if removed {
            self.root = None;
        }
        self.watermarks.update(&rp);
        debug!("pruned segment tree, emptied: {}", removed);
        removed
    }

    /// Calls `cb(depth, time)` for every node [`delete_nodes_before`](Self::delete_nodes_before)
    /// would remove, without removing anything. Stops at the first error.
    ///
    /// Returns `true` if the whole segment would be removed.
    pub fn walk_nodes_to_delete<E, F>(&self, rp: &RetentionPolicy, mut cb: F) -> Result<bool, E>
    where
        F: FnMut(usize, DateTime<Utc>) -> Result<(), E>,
    {
        let rp = rp.normalized();
        match &self.root {
            Some(root) => root.walk_nodes_to_delete(&rp, &mut cb),
            None => Ok(true),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{simple_time, simple_utime};
    use super::*;
    use chrono::{Duration, TimeZone};
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn noop(_: usize, _: DateTime<Utc>, _: Ratio, _: &[Addon]) {}

    fn put(s: &mut Segment, st: i64, et: i64, samples: u64) {
        s.put(simple_time(st), simple_time(et), samples, noop).unwrap();
    }

    fn uput(s: &mut Segment, st: i64, et: i64) {
        s.put(simple_utime(st), simple_utime(et), 1, noop).unwrap();
    }

    fn do_get(s: &Segment, st: i64, et: i64) -> Vec<DateTime<Utc>> {
        let mut res = Vec::new();
        s.get(simple_time(st), simple_time(et), |n, _| res.push(n.time));
        res
    }

    fn nodes_to_delete(s: &Segment, rp: &RetentionPolicy) -> (bool, Vec<String>) {
        let mut keys = Vec::new();
        let r = s
            .walk_nodes_to_delete(rp, |depth, t| -> Result<(), ()> {
                keys.push(format!("{}:{}", depth, t.timestamp()));
                Ok(())
            })
            .unwrap();
        keys.sort();
        (r, keys)
    }

    fn assert_children_add_up(node: &StreeNode) {
        if node.children.is_empty() {
            return;
        }
        let mut sum = 0;
        for child in node.children.iter().flatten() {
            assert_children_add_up(child);
            sum += child.samples;
        }
        assert_eq!(sum, node.samples, "children of {}:{}", node.depth, node.time);
    }

    fn root(s: &Segment) -> &StreeNode {
        s.root().expect("segment has a root")
    }

    #[test]
    fn get_without_root() {
        let s = Segment::new();
        assert!(do_get(&s, 0, 39).is_empty());
        assert_eq!(s.start_time(), None);
        assert!(s.is_empty());
    }

    #[test]
    fn root_depth_follows_the_written_range() {
        let mut s = Segment::new();
        put(&mut s, 0, 9, 1);
        assert_eq!(s.depth(), Some(0));

        let mut s = Segment::new();
        put(&mut s, 0, 49, 1);
        assert_eq!(s.depth(), Some(1));

        let mut s = Segment::new();
        put(&mut s, 10, 109, 1);
        assert_eq!(s.depth(), Some(2));

        let mut s = Segment::new();
        put(&mut s, 10, 70, 1);
        assert_eq!(s.depth(), Some(1));
    }

    #[test]
    fn far_apart_writes_keep_sample_sums() {
        let mut s = Segment::new();
        put(&mut s, 1330, 1339, 1);
        assert_eq!(s.depth(), Some(0));
        put(&mut s, 1110, 1119, 1);
        assert_children_add_up(root(&s));

        let mut s = Segment::new();
        put(&mut s, 2030, 2039, 1);
        put(&mut s, 0, 9, 1);
        assert_children_add_up(root(&s));
    }

    #[test]
    fn adjacent_writes_grow_the_root_once() {
        let mut s = Segment::new();
        put(&mut s, 10, 19, 1);
        put(&mut s, 10, 19, 1);
        assert_children_add_up(root(&s));

        let mut s = Segment::new();
        put(&mut s, 10, 19, 10);
        put(&mut s, 20, 39, 10);
        assert_eq!(s.depth(), Some(1));
        assert_children_add_up(root(&s));

        let mut s = Segment::new();
        put(&mut s, 30, 39, 1);
        put(&mut s, 20, 29, 1);
        assert_eq!(s.depth(), Some(1));
        put(&mut s, 10, 19, 1);
        assert_eq!(s.depth(), Some(1));
        assert_children_add_up(root(&s));
        assert_eq!(do_get(&s, 0, 39).len(), 3);
    }

    #[test]
    fn present_flags_and_gets() {
        let mut s = Segment::new();
        put(&mut s, 0, 9, 1);
        put(&mut s, 100, 109, 1);
        assert_children_add_up(root(&s));

        let r = root(&s);
        assert_eq!(r.depth, 2);
        assert!(r.present);
        let (c0, c1) = (
            r.children[0].as_ref().unwrap(),
            r.children[1].as_ref().unwrap(),
        );
        assert!(!c0.present);
        assert!(!c1.present);
        assert!(c0.children[0].as_ref().unwrap().present);
        assert!(c1.children[0].as_ref().unwrap().present);

        assert_eq!(do_get(&s, 0, 9).len(), 1);
        assert_eq!(do_get(&s, 10, 19).len(), 0);
        assert_eq!(do_get(&s, 100, 109).len(), 1);
        assert_eq!(do_get(&s, 0, 109).len(), 2);
        assert_eq!(do_get(&s, 0, 999).len(), 1);
        assert_eq!(do_get(&s, 0, 1000).len(), 1);
        assert_eq!(do_get(&s, 0, 1001).len(), 1);
        assert_eq!(do_get(&s, 0, 989).len(), 2);
    }

    #[test]
    fn new_aggregates_receive_addons() {
        let mut s = Segment::new();
        put(&mut s, 0, 9, 1);

        let mut calls = Vec::new();
        s.put(simple_time(100), simple_time(109), 1, |depth, t, r, addons| {
            calls.push((depth, t, r, addons.to_vec()));
        })
        .unwrap();

        assert_eq!(
            calls,
            vec![
                (
                    2,
                    simple_time(0),
                    Ratio::ONE,
                    vec![Addon {
                        depth: 0,
                        time: simple_time(0)
                    }]
                ),
                (0, simple_time(100), Ratio::ONE, vec![]),
            ]
        );
    }

    #[test]
    fn start_after_end_is_rejected() {
        let mut s = Segment::new();
        assert_eq!(
            s.put(simple_time(100), simple_time(50), 1, noop),
            Err(Error::StartAfterEnd)
        );
        assert!(s.is_empty());
    }

    #[test]
    fn tree_cannot_outgrow_the_ladder() {
        let mut s = Segment::new();
        put(&mut s, 0, 9, 1);
        let far = simple_time(0) + Duration::days(365 * 10_000);
        assert_eq!(s.put(far, far, 1, noop), Err(Error::TreeMaxSize));
    }

    #[test]
    fn insert_twice_only_changes_counts() {
        let mut s = Segment::new();
        let t = simple_utime(1_600_000_005);
        let leaf = s.insert(t).unwrap();
        assert_eq!(leaf.depth, 0);
        assert_eq!(leaf.time, simple_utime(1_600_000_000));
        let count = s.node_count();

        assert_eq!(s.insert(t).unwrap(), leaf);
        assert_eq!(s.node_count(), count);
        let mut node = root(&s);
        while let Some(child) = node.children.iter().flatten().next() {
            node = child;
        }
        assert_eq!(node.samples, 2);
        assert!(node.present);
    }

    #[test]
    fn insert_descends_through_grown_levels() {
        let mut s = Segment::new();
        s.insert(simple_time(5)).unwrap();
        s.insert(simple_time(1234)).unwrap();
        assert_eq!(s.depth(), Some(3));
        assert_eq!(s.start_time(), Some(simple_time(0)));
        assert_eq!(do_get(&s, 1230, 1239), vec![simple_time(1230)]);
    }

    #[test]
    fn start_time_is_the_earliest_write() {
        let mut rng = SmallRng::seed_from_u64(6_231_912);
        let (min_time, max_time) = (1_023_886_146, 1_623_886_146);
        for _ in 0..100 {
            let mut s = Segment::new();
            let mut min_st = max_time;
            for _ in 0..rng.gen_range(1..=100) {
                let st = rng.gen_range(min_time..max_time) / 10 * 10;
                min_st = min_st.min(st);
                let et = st + 10 + rng.gen_range(0..1000);
                put(&mut s, st, et, 1);
            }
            assert_eq!(s.start_time(), Some(simple_time(min_st)));
        }
    }

    #[test]
    fn walk_on_empty_segment() {
        let s = Segment::new();
        let rp = RetentionPolicy::new().set_absolute_period(Duration::hours(1));
        assert_eq!(nodes_to_delete(&s, &rp), (true, vec![]));
    }

    #[test]
    fn walk_nodes_before_absolute_cutoff() {
        let mut s = Segment::new();
        uput(&mut s, 10, 19);
        uput(&mut s, 20, 29);

        let mut rp = RetentionPolicy::new();
        rp.absolute_time = Some(simple_utime(21));
        assert_eq!(nodes_to_delete(&s, &rp), (false, vec!["0:10".to_string()]));

        rp.absolute_time = Some(simple_utime(200));
        assert_eq!(
            nodes_to_delete(&s, &rp),
            (
                true,
                vec!["0:10".to_string(), "0:20".to_string(), "1:0".to_string()]
            )
        );
    }

    #[test]
    fn walk_nodes_across_grown_levels() {
        let mut s = Segment::new();
        uput(&mut s, 10, 19);
        uput(&mut s, 1020, 1029);

        let mut rp = RetentionPolicy::new();
        rp.absolute_time = Some(simple_utime(21));
        assert_eq!(nodes_to_delete(&s, &rp), (false, vec!["0:10".to_string()]));
    }

    #[test]
    fn walk_stops_at_first_error() {
        let mut s = Segment::new();
        uput(&mut s, 10, 19);
        uput(&mut s, 20, 29);

        let mut rp = RetentionPolicy::new();
        rp.absolute_time = Some(simple_utime(200));
        let mut seen = 0;
        let r = s.walk_nodes_to_delete(&rp, |_, _| {
            seen += 1;
            Err("store unavailable")
        });
        assert_eq!(r, Err("store unavailable"));
        assert_eq!(seen, 1);
    }

    #[test]
    fn level_retention_partially() {
        let mut s = Segment::new();
        uput(&mut s, 10, 19);
        uput(&mut s, 20, 29);

        let mut rp = RetentionPolicy::new();
        rp.levels.insert(0, Utc::now());
        assert_eq!(
            nodes_to_delete(&s, &rp),
            (false, vec!["0:10".to_string(), "0:20".to_string()])
        );
        assert!(!s.delete_nodes_before(&rp));
        assert!(!s.is_empty());
        assert_eq!(s.node_count(), 1);
    }

    #[test]
    fn level_retention_completely() {
        let mut s = Segment::new();
        uput(&mut s, 10, 19);
        uput(&mut s, 20, 29);

        let mut rp = RetentionPolicy::new();
        rp.levels.insert(0, Utc::now());
        rp.levels.insert(1, Utc::now());
        assert_eq!(
            nodes_to_delete(&s, &rp),
            (
                true,
                vec!["0:10".to_string(), "0:20".to_string(), "1:0".to_string()]
            )
        );
        assert!(s.delete_nodes_before(&rp));
        assert!(s.is_empty());
        assert!(s.delete_nodes_before(&rp));
    }

    fn fill(s: &mut Segment, st: DateTime<Utc>, et: DateTime<Utc>) {
        let mut c = st;
        while c < et {
            let e = c + Duration::seconds(10);
            s.put(c, e, 100, noop).unwrap();
            c = e;
        }
    }

    #[test]
    fn reads_after_absolute_retention_are_empty() {
        let mut s = Segment::new();
        let st = Utc.with_ymd_and_hms(2021, 12, 1, 0, 0, 0).unwrap();
        let et = Utc.with_ymd_and_hms(2021, 12, 3, 0, 0, 0).unwrap();
        fill(&mut s, st, et);

        let mut rp = RetentionPolicy::new();
        rp.absolute_time = Some(et);
        assert!(!s.delete_nodes_before(&rp));

        let mut keys = Vec::new();
        s.get(st - Duration::hours(1), et + Duration::hours(1), |n, r| {
            keys.push(format!("{}:{}:{}", n.depth, n.time.timestamp(), r));
        });
        assert!(keys.is_empty(), "{:?}", keys);
    }

    #[test]
    fn reads_after_level_retention_are_sampled() {
        let mut s = Segment::new();
        let st = Utc.with_ymd_and_hms(2021, 12, 1, 0, 0, 0).unwrap();
        let et = Utc.with_ymd_and_hms(2021, 12, 2, 0, 0, 0).unwrap();
        fill(&mut s, st, et);

        let mut rp = RetentionPolicy::new();
        rp.levels.insert(0, et);
        assert!(!s.delete_nodes_before(&rp));

        let g_st = Utc.with_ymd_and_hms(2021, 12, 1, 10, 0, 0).unwrap();
        let mut keys = Vec::new();
        s.get(g_st, g_st + Duration::seconds(30), |n, r| {
            keys.push(format!("{}:{}:{}", n.depth, n.time.timestamp(), r));
        });
        assert_eq!(keys, vec!["1:1638352800:3/10".to_string()]);
    }

    #[test]
    fn watermarks_only_move_forward() {
        let mut s = Segment::new();
        uput(&mut s, 10, 19);
        uput(&mut s, 5000, 5009);

        let mut rp = RetentionPolicy::new();
        rp.absolute_time = Some(simple_utime(100));
        rp.levels.insert(0, simple_utime(300));
        s.delete_nodes_before(&rp);

        rp.absolute_time = Some(simple_utime(50));
        rp.levels.insert(0, simple_utime(200));
        rp.levels.insert(1, simple_utime(100));
        s.delete_nodes_before(&rp);

        let wm = s.watermarks();
        assert_eq!(wm.absolute_time, Some(simple_utime(100)));
        assert_eq!(wm.levels[&0], simple_utime(300));
        assert_eq!(wm.levels[&1], simple_utime(100));
    }
}
