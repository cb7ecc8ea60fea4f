use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use super::durations::{duration, truncate, MULTIPLIER};
use super::overlap::{overlap_read, overlap_write, relationship, Ratio, Rel};
use super::retention::RetentionPolicy;
use super::{Addon, NodeInfo, Watermarks};

/// A node of the segment tree. It covers `[time, time + durations()[depth])`.
///
/// Children sit one level finer: slot `i` covers the `i`-th tenth of this node's range.
/// Leaves (depth 0) have no child slots at all.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct StreeNode {
    pub(crate) depth: usize,
    pub(crate) time: DateTime<Utc>,
    pub(crate) present: bool,
    pub(crate) samples: u64,
    pub(crate) writes: u64,
    pub(crate) children: Vec<Option<Box<StreeNode>>>,
}

impl StreeNode {
    pub(crate) fn new(time: DateTime<Utc>, depth: usize) -> Self {
        let children = if depth > 0 {
            (0..MULTIPLIER).map(|_| None).collect()
        } else {
            Vec::new()
        };
        StreeNode {
            depth,
            time,
            present: false,
            samples: 0,
            writes: 0,
            children,
        }
    }

    pub(crate) fn end_time(&self) -> DateTime<Utc> {
        self.time + duration(self.depth)
    }

    pub(crate) fn info(&self) -> NodeInfo {
        NodeInfo {
            depth: self.depth,
            time: self.time,
            samples: self.samples,
            writes: self.writes,
        }
    }

    pub(crate) fn relationship(&self, st: DateTime<Utc>, et: DateTime<Utc>) -> Rel {
        relationship(self.time, self.end_time(), st, et)
    }

    /// Whether the node ends at or before `rt`.
    pub(crate) fn is_before(&self, rt: DateTime<Utc>) -> bool {
        self.end_time() <= rt
    }

    pub(crate) fn is_after(&self, rt: DateTime<Utc>) -> bool {
        self.time > rt
    }

    pub(crate) fn overlap_read(&self, st: DateTime<Utc>, et: DateTime<Utc>) -> Ratio {
        overlap_read(self.time, self.end_time(), st, et, duration(0))
    }

    pub(crate) fn overlap_write(&self, st: DateTime<Utc>, et: DateTime<Utc>) -> Ratio {
        overlap_write(self.time, self.end_time(), st, et, duration(0))
    }

    /// The child slot covering `t`. `t` must fall inside this node.
    fn child_index(&self, t: DateTime<Utc>) -> usize {
        let offset = (t - self.time).num_seconds();
        debug_assert!(offset >= 0, "{} is before node start {}", t, self.time);
        (offset / duration(self.depth - 1).num_seconds()) as usize % MULTIPLIER
    }

    fn child_time(&self, i: usize) -> DateTime<Utc> {
        truncate(self.time, duration(self.depth)) + duration(self.depth - 1) * i as i32
    }

    /// Hangs `child` into the slot its time maps to.
    pub(crate) fn replace(&mut self, child: Box<StreeNode>) {
        let i = self.child_index(child.time);
        self.children[i] = Some(child);
    }

    /// A stand-in for a child whose level has been pruned by retention: it carries a tenth
    /// of this node's counters.
    pub(crate) fn sampled_child(&self, i: usize) -> StreeNode {
        let mut child = StreeNode::new(self.child_time(i), self.depth - 1);
        child.present = self.present;
        child.samples = self.samples / MULTIPLIER as u64;
        child.writes = self.writes / MULTIPLIER as u64;
        child
    }

    /// Collects the topmost present nodes of this subtree.
    pub(crate) fn find_addons(&self, out: &mut Vec<Addon>) {
        if self.present {
            out.push(Addon {
                depth: self.depth,
                time: self.time,
            });
            return;
        }
        for child in self.children.iter().flatten() {
            child.find_addons(out);
        }
    }

    /// Descends to the leaf covering `t`, creating the nodes on the way. Every node on the
    /// path is marked present and counts one more sample.
    pub(crate) fn insert(&mut self, t: DateTime<Utc>) -> Addon {
        let mut node = self;
        loop {
            node.present = true;
            node.samples += 1;
            node.writes += 1;
            if node.depth == 0 {
                return Addon {
                    depth: node.depth,
                    time: node.time,
                };
            }
            let i = node.child_index(t);
            let (child_time, child_depth) = (node.child_time(i), node.depth - 1);
            node = node.children[i]
                .get_or_insert_with(|| Box::new(StreeNode::new(child_time, child_depth)));
        }
    }

    /// Writes `samples` spread over `[st, et)`, breadth first.
    ///
    /// `cb` is called for every node that has to hold an aggregate for this write: nodes
    /// fully covered by the range, nodes with more than one child in play, and nodes that
    /// already held data. The ratio is the share of the write that lands in the node. When a
    /// node becomes present for the first time, its present descendants are passed along as
    /// addons so the caller can fold their existing data into the new aggregate.
    pub(crate) fn put<F>(&mut self, st: DateTime<Utc>, et: DateTime<Utc>, samples: u64, cb: &mut F)
    where
        F: FnMut(usize, DateTime<Utc>, Ratio, &[Addon]),
    {
        let mut queue: VecDeque<&mut StreeNode> = VecDeque::new();
        queue.push_back(self);

        while let Some(sn) = queue.pop_front() {
            let rel = sn.relationship(st, et);
            if rel == Rel::Outside {
                continue;
            }

            let mut children_count = 0;
            if sn.depth > 0 {
                let create = matches!(rel, Rel::Inside | Rel::Overlap);
                let child_duration = duration(sn.depth - 1);
                for i in 0..sn.children.len() {
                    if create && sn.children[i].is_none() {
                        let child_time = sn.child_time(i);
                        let rel = relationship(child_time, child_time + child_duration, st, et);
                        if rel != Rel::Outside {
                            sn.children[i] = Some(Box::new(StreeNode::new(child_time, sn.depth - 1)));
                        }
                    }
                    if sn.children[i].is_some() {
                        children_count += 1;
                    }
                }
            }

            let r = sn.overlap_write(st, et);
            sn.samples += r.apply(samples);
            sn.writes += 1;

            if matches!(rel, Rel::Match | Rel::Contain) || children_count > 1 || sn.present {
                let mut addons = Vec::new();
                if !sn.present {
                    sn.find_addons(&mut addons);
                }
                cb(sn.depth, sn.time, r, &addons);
                sn.present = true;
            }

            for child in sn.children.iter_mut().flatten() {
                queue.push_back(child);
            }
        }
    }

    /// Reports the nodes that together cover `[st, et)`.
    ///
    /// Present nodes fully inside the range are taken whole. If the level below a present
    /// node has been pruned by retention, the node itself is reported with the fraction of
    /// it the query reads.
    pub(crate) fn get<F>(&self, wm: &Watermarks, st: DateTime<Utc>, et: DateTime<Utc>, cb: &mut F)
    where
        F: FnMut(&NodeInfo, Ratio),
    {
        match self.relationship(st, et) {
            Rel::Outside => return,
            Rel::Inside | Rel::Overlap => {}
            Rel::Contain | Rel::Match => {
                if self.present {
                    cb(&self.info(), Ratio::ONE);
                    return;
                }
            }
        }

        if self.present && self.depth > 0 {
            if let Some(&watermark) = wm.levels.get(&(self.depth - 1)) {
                if self.time < watermark {
                    cb(&self.info(), self.overlap_read(st, et));
                    return;
                }
            }
        }

        for child in self.children.iter().flatten() {
            child.get(wm, st, et, cb);
        }
    }

    /// Detaches every deletable child (and with it, its subtree). Returns whether this node
    /// itself should be removed by its parent.
    pub(crate) fn delete_nodes_before(&mut self, rp: &RetentionPolicy) -> bool {
        if rp.spares(self) {
            return false;
        }
        let remove = rp.is_to_be_deleted(self);
        for slot in self.children.iter_mut() {
            let detach = match slot {
                Some(child) => child.delete_nodes_before(rp),
                None => false,
            };
            if detach {
                *slot = None;
            }
        }
        remove
    }

    pub(crate) fn walk_nodes_to_delete<E, F>(&self, rp: &RetentionPolicy, cb: &mut F) -> Result<bool, E>
    where
        F: FnMut(usize, DateTime<Utc>) -> Result<(), E>,
    {
        if rp.spares(self) {
            return Ok(false);
        }
        let remove = rp.is_to_be_deleted(self);
        if remove {
            cb(self.depth, self.time)?;
        }
        for child in self.children.iter().flatten() {
            child.walk_nodes_to_delete(rp, cb)?;
        }
        Ok(remove)
    }

    /// The start of the earliest leaf.
    pub(crate) fn start_time(&self) -> DateTime<Utc> {
        let mut node = self;
        while let Some(child) = node.children.iter().flatten().next() {
            node = child;
        }
        node.time
    }

    pub(crate) fn node_count(&self) -> usize {
        1 + self
            .children
            .iter()
            .flatten()
            .map(|child| child.node_count())
            .sum::<usize>()
    }
}
