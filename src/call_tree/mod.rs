//! An arena-backed tree of call stacks.
//!
//! Every node knows its parent, its first child and its next sibling, so the tree can be walked
//! in any direction without recursion. Nodes live in one `Vec` and refer to each other by index;
//! the root is always at index 0 and carries no frame of its own.
//!
//! Operations that build a tree from another one ([`CallTree::merge`],
//! [`CallTree::transform_dfs`]) use an explicit stack, since call stacks can be thousands of
//! frames deep. Their scratch space can be reused across calls through [`Scratch`].

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};

use crate::segment::Ratio;

mod codec;

const SENTINEL: i32 = -1;

// Trimming is skipped when it would keep more than 1/TRIM_FACTOR of the nodes.
const TRIM_FACTOR: usize = 2;

/// A frame identifier. What it points at (a function name, a location id) is up to the caller.
pub type FrameId = i32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Node {
    // value
    v: FrameId,
    // parent
    p: i32,
    // first child
    f: i32,
    // next sibling
    n: i32,
    // subtree weight, self included
    w: u64,
    // self weight
    s: u64,
}

impl Node {
    fn new(v: FrameId, p: i32) -> Self {
        Node {
            v,
            p,
            f: SENTINEL,
            n: SENTINEL,
            w: 0,
            s: 0,
        }
    }
}

#[inline]
fn idx(i: i32) -> usize {
    i as usize
}

/// Reusable buffers for [`CallTree`] operations that need temporary space.
///
/// Buffers grow on demand and are never shrunk, so a `Scratch` kept around settles on the
/// size of the largest tree it has seen.
#[derive(Debug, Default)]
pub struct Scratch {
    stack: Vec<(i32, i32)>,
    ints: Vec<i32>,
    heap: BinaryHeap<Reverse<u64>>,
}

impl Scratch {
    /// Empty buffers.
    pub fn new() -> Self {
        Self::default()
    }

    fn zeroed_ints(&mut self, len: usize) -> &mut [i32] {
        self.ints.clear();
        self.ints.resize(len, 0);
        &mut self.ints
    }
}

/// A tree of call stacks with weights.
///
/// `w` of a node is the weight of its whole subtree and `s` the weight of the node alone.
/// [`insert`](Self::insert) only sets self weights; call [`propagate`](Self::propagate) to bring
/// subtree weights up to date.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallTree {
    nodes: Vec<Node>,
}

impl Default for CallTree {
    fn default() -> Self {
        Self::new(0)
    }
}

impl CallTree {
    /// An empty tree with room for `size_hint` nodes.
    pub fn new(size_hint: usize) -> Self {
        let mut nodes = Vec::with_capacity(size_hint + 1);
        nodes.push(Node::new(0, SENTINEL));
        CallTree { nodes }
    }

    /// Number of nodes, the root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree holds nothing but the root.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// The frame of node `i`.
    ///
    /// # Panics
    ///
    /// This and the other node accessors panic if `i` is out of range.
    pub fn value(&self, i: usize) -> FrameId {
        self.nodes[i].v
    }

    /// The subtree weight of node `i`.
    pub fn weight(&self, i: usize) -> u64 {
        self.nodes[i].w
    }

    /// The self weight of node `i`.
    pub fn self_weight(&self, i: usize) -> u64 {
        self.nodes[i].s
    }

    /// The parent of node `i`, `None` for the root.
    pub fn parent(&self, i: usize) -> Option<usize> {
        let p = self.nodes[i].p;
        if p == SENTINEL {
            None
        } else {
            Some(idx(p))
        }
    }

    /// The children of node `i`, in sibling order.
    pub fn children(&self, i: usize) -> Children<'_> {
        Children {
            tree: self,
            next: self.nodes[i].f,
        }
    }

    /// Sum of all self weights.
    pub fn total(&self) -> u64 {
        self.nodes.iter().map(|n| n.s).sum()
    }

    /// Adds `stack` to the tree and `self_weight` to the self weight of its last node.
    ///
    /// `stack` is ordered deepest frame first: `stack[0]` is the leaf and the last element hangs
    /// off the root. Returns the index of the leaf.
    pub fn insert(&mut self, stack: &[FrameId], self_weight: u64) -> usize {
        let mut x = 0;
        for &v in stack.iter().rev() {
            x = self.child_or_insert(x, v);
        }
        self.nodes[idx(x)].s += self_weight;
        idx(x)
    }

    /// Adds `stack` to the tree without any weight.
    pub fn insert_stack(&mut self, stack: &[FrameId]) -> usize {
        self.insert(stack, 0)
    }

    /// Finds the child of `parent` holding `v`, appending one if there is none.
    fn child_or_insert(&mut self, parent: i32, v: FrameId) -> i32 {
        let mut j = self.nodes[idx(parent)].f;
        let mut last = SENTINEL;
        while j != SENTINEL {
            if self.nodes[idx(j)].v == v {
                return j;
            }
            last = j;
            j = self.nodes[idx(j)].n;
        }

        let x = self.nodes.len() as i32;
        self.nodes.push(Node::new(v, parent));
        if last == SENTINEL {
            self.nodes[idx(parent)].f = x;
        } else {
            self.nodes[idx(last)].n = x;
        }
        x
    }

    fn merge_node(&mut self, parent: i32, src: &Node) -> i32 {
        let x = self.child_or_insert(parent, src.v);
        let node = &mut self.nodes[idx(x)];
        node.w += src.w;
        node.s += src.s;
        x
    }

    /// Recomputes every subtree weight from the self weights.
    pub fn propagate(&mut self) {
        for node in self.nodes.iter_mut() {
            node.w = 0;
        }
        // parents always precede their children
        for i in (1..self.nodes.len()).rev() {
            let node = &mut self.nodes[i];
            node.w += node.s;
            let (w, p) = (node.w, idx(node.p));
            self.nodes[p].w += w;
        }
        self.nodes[0].w += self.nodes[0].s;
    }

    /// A copy of the tree with every self weight scaled by `ratio` and subtree weights
    /// recomputed.
    pub fn scaled(&self, ratio: Ratio) -> CallTree {
        let mut t = self.clone();
        if ratio != Ratio::ONE {
            for node in t.nodes.iter_mut() {
                node.s = ratio.apply(node.s);
            }
        }
        t.propagate();
        t
    }

    /// Adds the stacks and weights of `src` to this tree.
    pub fn merge(&mut self, src: &CallTree) {
        self.merge_with(src, &mut Scratch::new());
    }

    /// [`merge`](Self::merge) with caller-provided scratch space.
    ///
    /// Matching nodes are found by frame among the children of the already merged parent; a
    /// missing node is appended after its last sibling. Children are processed in reverse, so
    /// the result has the right weights but not necessarily the layout of a fresh build.
    pub fn merge_with(&mut self, src: &CallTree, scratch: &mut Scratch) {
        self.nodes[0].w += src.nodes[0].w;
        self.nodes[0].s += src.nodes[0].s;
        if src.nodes.len() < 2 {
            return;
        }

        let stack = &mut scratch.stack;
        stack.clear();
        stack.extend(src.children(0).map(|c| (0, c as i32)));
        while let Some((left, right)) = stack.pop() {
            let node = &src.nodes[idx(right)];
            let parent = self.merge_node(left, node);
            let mut n = node.f;
            while n != SENTINEL {
                stack.push((parent, n));
                n = src.nodes[idx(n)].n;
            }
        }
    }

    /// Shrinks the tree to roughly the `n` heaviest nodes.
    ///
    /// Nodes whose subtree weight is at most the `n`-th largest weight among non-root nodes are
    /// dropped, so ties at the threshold all go and fewer than `n` nodes may remain. Nothing
    /// happens if `n` is at least half the node count. Node indices change.
    pub fn trim(&mut self, n: usize) {
        self.trim_with(n, &mut Scratch::new());
    }

    /// [`trim`](Self::trim) with caller-provided scratch space.
    pub fn trim_with(&mut self, n: usize, scratch: &mut Scratch) {
        if n >= self.nodes.len() / TRIM_FACTOR {
            return;
        }
        let m = if n == 0 {
            u64::MAX
        } else {
            self.nth(n, &mut scratch.heap)
        };
        let before = self.nodes.len();
        self.do_trim(m, scratch.zeroed_ints(before));
        let c = scratch.zeroed_ints(self.nodes.len());
        self.restore_into(c);
        debug!("trimmed call tree from {} to {} nodes", before, self.nodes.len());
    }

    /// The `n`-th largest subtree weight among non-root nodes, found with a min-heap holding
    /// the `n` largest weights seen so far. `n` must be below the non-root node count.
    fn nth(&self, n: usize, heap: &mut BinaryHeap<Reverse<u64>>) -> u64 {
        heap.clear();
        heap.extend(self.nodes[1..=n].iter().map(|node| Reverse(node.w)));
        for node in &self.nodes[n + 1..] {
            if let Some(mut min) = heap.peek_mut() {
                if node.w > min.0 {
                    *min = Reverse(node.w);
                }
            }
        }
        heap.peek().map_or(0, |min| min.0)
    }

    /// Drops every non-root node with a weight of at most `m` and compacts the arena. Only
    /// parent links survive; the rest must be restored.
    fn do_trim(&mut self, m: u64, c: &mut [i32]) {
        let mut p = 0;
        for i in 1..self.nodes.len() {
            if self.nodes[i].w > m {
                p += 1;
                c[i] = p;
            }
        }
        self.compact(c);
    }

    /// Moves every kept node `i` to `c[i]` (`0` means dropped) and remaps parent links. A node
    /// whose parent was dropped is attached to the root.
    fn compact(&mut self, c: &[i32]) {
        let mut j = 1;
        for i in 1..self.nodes.len() {
            if c[i] == 0 {
                continue;
            }
            let mut node = self.nodes[i];
            node.p = c[idx(node.p)];
            // c[i] <= i, so this never overwrites a node that is yet to move
            self.nodes[idx(c[i])] = node;
            j += 1;
        }
        self.nodes.truncate(j);
    }

    /// Rebuilds first child and next sibling links from the parent links. Siblings end up in
    /// index order.
    pub fn restore(&mut self) {
        let mut c = vec![0; self.nodes.len()];
        self.restore_into(&mut c);
    }

    // c must be zeroed and as long as the tree; it tracks the last child seen per parent.
    fn restore_into(&mut self, c: &mut [i32]) {
        for node in self.nodes.iter_mut() {
            node.f = SENTINEL;
            node.n = SENTINEL;
        }
        for i in 1..self.nodes.len() {
            let p = idx(self.nodes[i].p);
            let last = c[p];
            c[p] = i as i32;
            if last == 0 {
                self.nodes[p].f = i as i32;
            } else {
                self.nodes[idx(last)].n = i as i32;
            }
        }
    }

    /// The level of every node; the root is at level 0.
    pub fn levels(&self) -> Vec<u32> {
        let mut c = vec![0; self.nodes.len()];
        self.levels_into(&mut c);
        c.into_iter().map(|l| l as u32).collect()
    }

    fn levels_into(&self, c: &mut [i32]) {
        for i in 1..self.nodes.len() {
            c[i] = c[idx(self.nodes[i].p)] + 1;
        }
    }

    /// The number of descendants of every node.
    pub fn descendants(&self) -> Vec<u32> {
        let mut c = vec![0u32; self.nodes.len()];
        for i in (1..self.nodes.len()).rev() {
            c[idx(self.nodes[i].p)] += c[i] + 1;
        }
        c
    }

    /// The deepest level reached within the subtree of every node.
    pub fn depth(&self) -> Vec<u32> {
        let mut c = vec![0; self.nodes.len()];
        self.depth_into(&mut c);
        c.into_iter().map(|d| d as u32).collect()
    }

    fn depth_into(&self, c: &mut [i32]) {
        self.levels_into(c);
        for i in (1..self.nodes.len()).rev() {
            let p = idx(self.nodes[i].p);
            c[p] = c[p].max(c[i]);
        }
    }

    /// Merges this tree into `dst`, laying out every new subtree contiguously in depth-first
    /// order. Among siblings, the one with the deepest subtree comes first.
    pub fn transform_dfs(&self, dst: &mut CallTree) {
        self.transform_dfs_with(dst, &mut Scratch::new());
    }

    /// [`transform_dfs`](Self::transform_dfs) with caller-provided scratch space.
    pub fn transform_dfs_with(&self, dst: &mut CallTree, scratch: &mut Scratch) {
        dst.nodes[0].w += self.nodes[0].w;
        dst.nodes[0].s += self.nodes[0].s;
        if self.nodes.len() < 2 {
            return;
        }

        let Scratch { stack, ints, .. } = scratch;
        ints.clear();
        ints.resize(self.nodes.len(), 0);
        self.depth_into(ints);
        let order = &*ints;

        // the stack is popped from the end, so children are sorted shallowest first
        stack.clear();
        stack.extend(self.children(0).map(|c| (0, c as i32)));
        stack.sort_by_key(|&(_, r)| order[idx(r)]);
        while let Some((left, right)) = stack.pop() {
            let node = &self.nodes[idx(right)];
            let parent = dst.merge_node(left, node);
            let off = stack.len();
            let mut n = node.f;
            while n != SENTINEL {
                stack.push((parent, n));
                n = self.nodes[idx(n)].n;
            }
            stack[off..].sort_by_key(|&(_, r)| order[idx(r)]);
        }
    }

    /// Visits every node breadth first, starting at the root.
    pub fn traverse_bfs<F>(&self, mut f: F)
    where
        F: FnMut(usize),
    {
        let mut queue = VecDeque::with_capacity(self.nodes.len());
        queue.push_back(0);
        while let Some(i) = queue.pop_front() {
            f(i);
            queue.extend(self.children(i));
        }
    }

    /// Visits every node depth first, starting at the root. Siblings are visited last to
    /// first.
    pub fn traverse_dfs<F>(&self, mut f: F)
    where
        F: FnMut(usize),
    {
        let mut stack = Vec::with_capacity(64);
        stack.push(0);
        while let Some(i) = stack.pop() {
            f(i);
            stack.extend(self.children(i));
        }
    }

    /// Calls `f(frames, self_weight)` for every node with a self weight. `frames` runs from the
    /// root down to the node, which is the reverse of what [`insert`](Self::insert) takes.
    pub fn for_each_stack<F>(&self, mut f: F)
    where
        F: FnMut(&[FrameId], u64),
    {
        let mut path = Vec::new();
        let mut stack = vec![(0usize, 0usize)];
        while let Some((i, level)) = stack.pop() {
            path.truncate(level);
            if i != 0 {
                path.push(self.nodes[i].v);
            }
            if self.nodes[i].s > 0 && i != 0 {
                f(&path, self.nodes[i].s);
            }
            let next = if i == 0 { 0 } else { level + 1 };
            stack.extend(self.children(i).map(|c| (c, next)));
        }
    }
}

/// Iterator over the children of a node, see [`CallTree::children`].
#[derive(Clone, Debug)]
pub struct Children<'a> {
    tree: &'a CallTree,
    next: i32,
}

impl<'a> Iterator for Children<'a> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.next == SENTINEL {
            return None;
        }
        let i = idx(self.next);
        self.next = self.tree.nodes[i].n;
        Some(i)
    }
}
