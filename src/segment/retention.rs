use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use super::durations::normalize_time;
use super::node::StreeNode;

/// Time boundaries that decide which segment tree nodes may be deleted.
///
/// A node is deletable if it ends at or before [`absolute_time`](Self::absolute_time), or at
/// or before the cutoff configured for its own depth in [`levels`](Self::levels). A node that
/// straddles a cutoff is kept: retention removes whole buckets only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetentionPolicy {
    now: DateTime<Utc>,

    /// Everything that ends before this instant is deletable, regardless of depth.
    pub absolute_time: Option<DateTime<Utc>>,

    /// Per-depth cutoffs.
    pub levels: BTreeMap<usize, DateTime<Utc>>,

    /// Cutoff for exemplars (individual profiles kept verbatim). The segment tree does not
    /// look at it; it is carried for the layer that stores exemplars.
    pub exemplars_retention_time: Option<DateTime<Utc>>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RetentionPolicy {
    /// An empty policy with periods measured back from the current time.
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    /// An empty policy with periods measured back from `now`.
    pub fn at(now: DateTime<Utc>) -> Self {
        RetentionPolicy {
            now,
            absolute_time: None,
            levels: BTreeMap::new(),
            exemplars_retention_time: None,
        }
    }

    /// Keep everything younger than `period`. A zero period clears the cutoff.
    pub fn set_absolute_period(mut self, period: Duration) -> Self {
        self.absolute_time = self.period_to_time(period);
        self
    }

    /// Keep exemplars younger than `period`.
    pub fn set_exemplars_retention_period(mut self, period: Duration) -> Self {
        self.exemplars_retention_time = self.period_to_time(period);
        self
    }

    /// Keep nodes at `level` younger than `period`.
    pub fn set_level_period(mut self, level: usize, period: Duration) -> Self {
        match self.period_to_time(period) {
            Some(t) => {
                self.levels.insert(level, t);
            }
            None => {
                self.levels.remove(&level);
            }
        }
        self
    }

    /// Sets the period of every level at once; `periods[i]` applies to depth `i`. Zero
    /// periods are skipped.
    pub fn set_levels(mut self, periods: &[Duration]) -> Self {
        for (level, &period) in periods.iter().enumerate() {
            if period != Duration::zero() {
                self = self.set_level_period(level, period);
            }
        }
        self
    }

    /// The oldest instant for which full-resolution data is still kept.
    pub fn lower_time_boundary(&self) -> Option<DateTime<Utc>> {
        if self.levels.is_empty() {
            return self.absolute_time;
        }
        self.levels.get(&0).copied()
    }

    /// The cutoff that applies at `depth`, if any.
    pub fn level_max_time(&self, depth: usize) -> Option<DateTime<Utc>> {
        self.levels.get(&depth).copied()
    }

    fn period_to_time(&self, period: Duration) -> Option<DateTime<Utc>> {
        if period == Duration::zero() {
            return None;
        }
        Some(self.now - period)
    }

    pub(crate) fn is_to_be_deleted(&self, node: &StreeNode) -> bool {
        self.absolute_time.map_or(false, |t| node.is_before(t))
            || self
                .level_max_time(node.depth)
                .map_or(false, |t| node.is_before(t))
    }

    /// Whether nothing below `node` can be deleted because the policy has no level cutoffs and
    /// the node starts after the absolute cutoff.
    pub(crate) fn spares(&self, node: &StreeNode) -> bool {
        self.levels.is_empty() && self.absolute_time.map_or(true, |t| node.is_after(t))
    }

    pub(crate) fn normalized(&self) -> Self {
        let mut rp = self.clone();
        rp.absolute_time = rp.absolute_time.map(normalize_time);
        for t in rp.levels.values_mut() {
            *t = normalize_time(*t);
        }
        rp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::testing::simple_utime;

    #[test]
    fn nodes_before_the_absolute_cutoff_are_deletable() {
        let now = simple_utime(1_700_000_000);
        let rp = RetentionPolicy::at(now).set_absolute_period(Duration::hours(24));
        let cutoff = now - Duration::hours(24);
        assert_eq!(rp.absolute_time, Some(cutoff));

        let old = StreeNode::new(cutoff - Duration::seconds(10), 0);
        assert!(rp.is_to_be_deleted(&old));

        // [cutoff - 50s, cutoff + 50s) straddles the cutoff
        let straddling = StreeNode::new(cutoff - Duration::seconds(50), 1);
        assert!(!rp.is_to_be_deleted(&straddling));
    }

    #[test]
    fn level_cutoffs_only_apply_to_their_depth() {
        let now = simple_utime(1_700_000_000);
        let rp = RetentionPolicy::at(now).set_levels(&[Duration::hours(1), Duration::zero()]);
        assert_eq!(rp.levels.len(), 1);
        assert_eq!(rp.lower_time_boundary(), Some(now - Duration::hours(1)));

        let t = now - Duration::hours(2);
        assert!(rp.is_to_be_deleted(&StreeNode::new(t, 0)));
        assert!(!rp.is_to_be_deleted(&StreeNode::new(t, 1)));
    }

    #[test]
    fn zero_period_clears_the_cutoff() {
        let rp = RetentionPolicy::new()
            .set_absolute_period(Duration::hours(1))
            .set_absolute_period(Duration::zero())
            .set_exemplars_retention_period(Duration::minutes(5));
        assert_eq!(rp.absolute_time, None);
        assert_eq!(rp.lower_time_boundary(), None);
        assert!(rp.exemplars_retention_time.is_some());
    }
}
