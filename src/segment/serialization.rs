//! Binary form of a [`Segment`].
//!
//! ```text
//! segment   := version:u8 metadata watermarks has_root:u8 node?
//! metadata  := spy_name:bytes sample_rate:uvarint units:u8 aggregation:u8
//! watermarks:= has_abs:u8 abs:varint? count:uvarint (depth:uvarint time:varint)*
//! node      := depth:uvarint time:varint present:u8 samples:uvarint writes:uvarint
//!              [children:uvarint bitmap, one node per set bit]   (depth > 0 only)
//! ```
//!
//! Times are unix seconds.

use chrono::{DateTime, Utc};

use super::durations::{duration, durations, MULTIPLIER};
use super::node::StreeNode;
use super::{AggregationType, Metadata, Segment, Units, Watermarks};
use crate::encoding::{put_bytes, put_uvarint, put_varint, DecodeError, Reader};

const FORMAT_VERSION: u8 = 1;

impl Segment {
    /// Encodes the segment.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64 + 16 * self.node_count());
        buf.push(FORMAT_VERSION);

        put_bytes(&mut buf, self.metadata.spy_name.as_bytes());
        put_uvarint(&mut buf, u64::from(self.metadata.sample_rate));
        buf.push(self.metadata.units.code());
        buf.push(self.metadata.aggregation_type.code());

        match self.watermarks.absolute_time {
            Some(t) => {
                buf.push(1);
                put_varint(&mut buf, t.timestamp());
            }
            None => buf.push(0),
        }
        put_uvarint(&mut buf, self.watermarks.levels.len() as u64);
        for (&depth, t) in &self.watermarks.levels {
            put_uvarint(&mut buf, depth as u64);
            put_varint(&mut buf, t.timestamp());
        }

        match &self.root {
            Some(root) => {
                buf.push(1);
                write_node(&mut buf, root);
            }
            None => buf.push(0),
        }
        buf
    }

    /// Decodes a segment produced by [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(data);
        let version = r.u8()?;
        if version != FORMAT_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }

        let spy_name = r.string()?;
        let sample_rate = u32::try_from(r.uvarint()?)
            .map_err(|_| DecodeError::Malformed("sample rate out of range"))?;
        let units = Units::from_code(r.u8()?).ok_or(DecodeError::Malformed("unknown units"))?;
        let aggregation_type = AggregationType::from_code(r.u8()?)
            .ok_or(DecodeError::Malformed("unknown aggregation type"))?;
        let metadata = Metadata {
            spy_name,
            sample_rate,
            units,
            aggregation_type,
        };

        let mut watermarks = Watermarks::default();
        if read_flag(&mut r)? {
            watermarks.absolute_time = Some(read_time(&mut r)?);
        }
        let count = r.uvarint()?;
        for _ in 0..count {
            let depth = read_depth(&mut r)?;
            let t = read_time(&mut r)?;
            watermarks.levels.insert(depth, t);
        }

        let root = if read_flag(&mut r)? {
            let depth = read_depth(&mut r)?;
            let time = read_time(&mut r)?;
            Some(Box::new(read_node(&mut r, depth, time)?))
        } else {
            None
        };

        if !r.is_empty() {
            return Err(DecodeError::Malformed("trailing bytes"));
        }
        Ok(Segment {
            root,
            metadata,
            watermarks,
        })
    }
}

fn write_node(buf: &mut Vec<u8>, node: &StreeNode) {
    put_uvarint(buf, node.depth as u64);
    put_varint(buf, node.time.timestamp());
    buf.push(node.present as u8);
    put_uvarint(buf, node.samples);
    put_uvarint(buf, node.writes);
    if node.depth == 0 {
        return;
    }
    let bitmap = node
        .children
        .iter()
        .enumerate()
        .filter(|(_, c)| c.is_some())
        .fold(0u64, |acc, (i, _)| acc | 1 << i);
    put_uvarint(buf, bitmap);
    for child in node.children.iter().flatten() {
        write_node(buf, child);
    }
}

fn read_flag(r: &mut Reader<'_>) -> Result<bool, DecodeError> {
    match r.u8()? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(DecodeError::Malformed("invalid flag")),
    }
}

fn read_time(r: &mut Reader<'_>) -> Result<DateTime<Utc>, DecodeError> {
    DateTime::from_timestamp(r.varint()?, 0).ok_or(DecodeError::Malformed("time out of range"))
}

fn read_depth(r: &mut Reader<'_>) -> Result<usize, DecodeError> {
    let depth = r.uvarint()?;
    if depth >= durations().len() as u64 {
        return Err(DecodeError::Malformed("depth out of range"));
    }
    Ok(depth as usize)
}

fn read_node(r: &mut Reader<'_>, depth: usize, time: DateTime<Utc>) -> Result<StreeNode, DecodeError> {
    if time.checked_add_signed(duration(depth)).is_none() {
        return Err(DecodeError::Malformed("time out of range"));
    }
    let mut node = StreeNode::new(time, depth);
    node.present = read_flag(r)?;
    node.samples = r.uvarint()?;
    node.writes = r.uvarint()?;
    if depth == 0 {
        return Ok(node);
    }

    let bitmap = r.uvarint()?;
    if bitmap >> MULTIPLIER != 0 {
        return Err(DecodeError::Malformed("invalid child bitmap"));
    }
    let child_duration = duration(depth - 1);
    for i in (0..MULTIPLIER).filter(|i| bitmap & (1 << i) != 0) {
        let child_depth = read_depth(r)?;
        let child_time = read_time(r)?;
        let slot_time = time.checked_add_signed(child_duration * i as i32);
        if child_depth != depth - 1 || slot_time != Some(child_time) {
            return Err(DecodeError::Malformed("child does not fit its slot"));
        }
        node.children[i] = Some(Box::new(read_node(r, child_depth, child_time)?));
    }
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::testing::simple_utime;
    use crate::segment::{Addon, Ratio, RetentionPolicy};

    fn noop(_: usize, _: DateTime<Utc>, _: Ratio, _: &[Addon]) {}

    fn sample_segment() -> Segment {
        let mut s = Segment::new();
        s.set_metadata(Metadata {
            spy_name: "rbspy".into(),
            sample_rate: 100,
            units: Units::Objects,
            aggregation_type: AggregationType::Average,
        });
        s.put(simple_utime(1_600_000_000), simple_utime(1_600_000_030), 30, noop)
            .unwrap();
        s.put(simple_utime(1_600_004_000), simple_utime(1_600_004_010), 7, noop)
            .unwrap();
        let mut rp = RetentionPolicy::new();
        rp.levels.insert(0, simple_utime(1_600_000_020));
        s.delete_nodes_before(&rp);
        s
    }

    #[test]
    fn segment_survives_encoding() {
        let s = sample_segment();
        let decoded = Segment::from_bytes(&s.to_bytes()).unwrap();
        assert_eq!(decoded, s);
        assert_eq!(Segment::from_bytes(&Segment::new().to_bytes()).unwrap(), Segment::new());
    }

    #[test]
    fn rejects_other_versions() {
        let mut data = sample_segment().to_bytes();
        data[0] = 7;
        assert_eq!(
            Segment::from_bytes(&data),
            Err(DecodeError::UnsupportedVersion(7))
        );
    }

    #[test]
    fn truncated_input_never_panics() {
        let data = sample_segment().to_bytes();
        for end in 0..data.len() {
            assert!(Segment::from_bytes(&data[..end]).is_err(), "prefix {}", end);
        }
        let mut longer = data.clone();
        longer.push(0);
        assert_eq!(
            Segment::from_bytes(&longer),
            Err(DecodeError::Malformed("trailing bytes"))
        );
    }
}
