use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use super::durations::{duration, durations, normalize, truncate};
use super::node::StreeNode;
use super::overlap::Rel;
use super::{Segment, Watermarks};

// Upper bound on the number of buckets a timeline aims for.
const RESOLUTION: i32 = 480;

/// A histogram of samples over a query range, one bucket per [`duration_delta`].
///
/// A bucket that received data is offset by one, so `0` always means "no data" and `1` means
/// "data, but no samples".
///
/// [`duration_delta`]: Timeline::duration_delta
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Timeline {
    st: DateTime<Utc>,
    et: DateTime<Utc>,

    /// Start of the first bucket.
    pub start_time: DateTime<Utc>,

    /// Samples per bucket.
    pub samples: Vec<u64>,

    /// Width of a bucket.
    pub duration_delta: Duration,

    /// For every depth whose data was synthesized from a coarser level, the end (unix seconds)
    /// of the last synthesized bucket.
    pub watermarks: BTreeMap<usize, i64>,
}

impl Timeline {
    /// An empty timeline for `[st, et)`.
    ///
    /// The bucket width is the coarsest ladder duration that still yields more than
    /// 480 buckets, and never finer than ten seconds.
    pub fn generate(st: DateTime<Utc>, et: DateTime<Utc>) -> Self {
        let (st, et) = normalize(st, et);
        let total = et - st;
        let min_delta = total / RESOLUTION;
        let delta = durations()
            .iter()
            .copied()
            .filter(|&d| d < min_delta)
            .last()
            .unwrap_or_else(|| duration(0));
        let len = (total.num_seconds() / delta.num_seconds()).max(0) as usize;
        Timeline {
            st,
            et,
            start_time: st,
            samples: vec![0; len],
            duration_delta: delta,
            watermarks: BTreeMap::new(),
        }
    }

    /// Adds the samples of `segment` that fall in the timeline's range.
    pub fn populate(&mut self, segment: &Segment) {
        if let Some(root) = segment.root() {
            self.populate_node(root, segment.watermarks());
        }
    }

    fn populate_node(&mut self, sn: &StreeNode, wm: &Watermarks) {
        if sn.relationship(self.st, self.et) == Rel::Outside {
            return;
        }

        let mut current = duration(sn.depth);
        if !sn.children.is_empty() && current >= self.duration_delta {
            let level_watermark = wm.levels.get(&(sn.depth - 1)).copied();
            let mut has_data_before = false;
            for (i, child) in sn.children.iter().enumerate() {
                if let Some(child) = child {
                    self.populate_node(child, wm);
                    has_data_before = true;
                    continue;
                }
                // the child may have been pruned by retention; stand in for it with a
                // tenth of this node
                let level_watermark = match level_watermark {
                    Some(t) if !has_data_before => t,
                    _ => continue,
                };
                if wm.absolute_time.map_or(false, |t| sn.is_before(t)) {
                    continue;
                }
                let c = sn.sampled_child(i);
                if c.is_before(level_watermark) && wm.absolute_time.map_or(true, |t| c.is_after(t)) {
                    self.populate_node(&c, wm);
                    let end = c.end_time().timestamp();
                    let w = self.watermarks.entry(c.depth + 1).or_insert(end);
                    if end > *w {
                        *w = end;
                    }
                }
            }
            return;
        }

        let mut node_time = sn.time;
        if current < self.duration_delta {
            current = self.duration_delta;
            node_time = truncate(node_time, current);
        }

        let delta = self.duration_delta.num_seconds();
        let mut i = (node_time - self.st).num_seconds() / delta;
        let right = i + current.num_seconds() / delta;
        let len = self.samples.len() as i64;
        while i < right {
            if (0..len).contains(&i) {
                let bucket = &mut self.samples[i as usize];
                if *bucket == 0 {
                    *bucket = 1;
                }
                *bucket += sn.samples;
            }
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::testing::simple_time;
    use crate::segment::{Addon, Ratio, RetentionPolicy};

    fn noop(_: usize, _: DateTime<Utc>, _: Ratio, _: &[Addon]) {}

    #[test]
    fn picks_bucket_width_from_the_ladder() {
        let tl = Timeline::generate(simple_time(0), simple_time(3600));
        assert_eq!(tl.duration_delta, Duration::seconds(10));
        assert_eq!(tl.samples.len(), 360);

        let tl = Timeline::generate(simple_time(0), simple_time(86_400));
        assert_eq!(tl.duration_delta, Duration::seconds(100));
        assert_eq!(tl.samples.len(), 864);
    }

    #[test]
    fn empty_segment_leaves_zeros() {
        let mut tl = Timeline::generate(simple_time(0), simple_time(100));
        tl.populate(&Segment::new());
        assert_eq!(tl.samples, vec![0; 10]);
    }

    #[test]
    fn leaves_fill_their_buckets() {
        let mut s = Segment::new();
        s.put(simple_time(0), simple_time(10), 5, noop).unwrap();
        s.put(simple_time(30), simple_time(40), 7, noop).unwrap();

        let mut tl = Timeline::generate(simple_time(0), simple_time(100));
        tl.populate(&s);
        assert_eq!(tl.start_time, simple_time(0));
        assert_eq!(tl.samples, vec![6, 0, 0, 8, 0, 0, 0, 0, 0, 0]);
        assert!(tl.watermarks.is_empty());
    }

    #[test]
    fn pruned_levels_are_sampled_from_parents() {
        let mut s = Segment::new();
        let mut t = simple_time(0);
        while t < simple_time(100) {
            s.put(t, t + Duration::seconds(10), 10, noop).unwrap();
            t = t + Duration::seconds(10);
        }
        s.put(simple_time(200), simple_time(210), 10, noop).unwrap();

        let mut rp = RetentionPolicy::new();
        rp.levels.insert(0, simple_time(150));
        s.delete_nodes_before(&rp);

        let mut tl = Timeline::generate(simple_time(0), simple_time(100));
        tl.populate(&s);
        assert_eq!(tl.samples, vec![11; 10]);
        assert_eq!(tl.watermarks.get(&1), Some(&simple_time(100).timestamp()));
    }
}
