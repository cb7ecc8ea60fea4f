//! Binary form of a [`CallTree`]: a version byte, the node count, the root's weights, then
//! `(frame, parent, self, weight)` for every other node in arena order. Child and sibling links
//! are not stored; they are rebuilt on decode.

use super::{CallTree, Node};
use crate::encoding::{put_uvarint, put_varint, DecodeError, Reader};

const FORMAT_VERSION: u8 = 1;

impl CallTree {
    /// Encodes the tree.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.nodes.len() * 6);
        buf.push(FORMAT_VERSION);
        put_uvarint(&mut buf, self.nodes.len() as u64);
        put_uvarint(&mut buf, self.nodes[0].s);
        put_uvarint(&mut buf, self.nodes[0].w);
        for node in &self.nodes[1..] {
            put_varint(&mut buf, i64::from(node.v));
            put_uvarint(&mut buf, node.p as u64);
            put_uvarint(&mut buf, node.s);
            put_uvarint(&mut buf, node.w);
        }
        buf
    }

    /// Decodes a tree produced by [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(data);
        let version = r.u8()?;
        if version != FORMAT_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }

        let count = r.uvarint()?;
        if count == 0 || count > i32::MAX as u64 {
            return Err(DecodeError::Malformed("invalid node count"));
        }
        // every node takes at least 4 bytes, which bounds what a short input can claim
        let count = count as usize;
        let mut t = CallTree::new(count.min(data.len() / 4));
        t.nodes[0].s = r.uvarint()?;
        t.nodes[0].w = r.uvarint()?;

        for i in 1..count {
            let v = i32::try_from(r.varint()?).map_err(|_| DecodeError::Malformed("frame out of range"))?;
            let p = r.uvarint()?;
            if p >= i as u64 {
                return Err(DecodeError::Malformed("parent does not precede child"));
            }
            let mut node = Node::new(v, p as i32);
            node.s = r.uvarint()?;
            node.w = r.uvarint()?;
            t.nodes.push(node);
        }

        if !r.is_empty() {
            return Err(DecodeError::Malformed("trailing bytes"));
        }
        t.restore();
        Ok(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CallTree {
        let mut t = CallTree::new(8);
        t.insert(&[3, 2, 1], 1);
        t.insert(&[4, 2, 1], 1);
        t.insert(&[5, 1], 1);
        t.insert(&[-7], 9);
        t.propagate();
        t
    }

    #[test]
    fn tree_survives_encoding() {
        let t = sample();
        assert_eq!(CallTree::from_bytes(&t.to_bytes()).unwrap(), t);

        let empty = CallTree::new(0);
        assert_eq!(CallTree::from_bytes(&empty.to_bytes()).unwrap(), empty);
    }

    #[test]
    fn merged_trees_survive_encoding() {
        let mut t = CallTree::new(0);
        t.merge(&sample());
        t.merge(&sample());
        assert_eq!(CallTree::from_bytes(&t.to_bytes()).unwrap(), t);
    }

    #[test]
    fn rejects_malformed_input() {
        let data = sample().to_bytes();
        for end in 0..data.len() {
            assert!(CallTree::from_bytes(&data[..end]).is_err(), "prefix {}", end);
        }

        // node 1 claiming to be its own parent
        let mut t = CallTree::new(0);
        t.insert(&[1], 1);
        let mut data = t.to_bytes();
        let parent_at = data.len() - 3;
        data[parent_at] = 1;
        assert_eq!(
            CallTree::from_bytes(&data),
            Err(DecodeError::Malformed("parent does not precede child"))
        );

        assert_eq!(
            CallTree::from_bytes(&[FORMAT_VERSION, 0]),
            Err(DecodeError::Malformed("invalid node count"))
        );
    }
}
