use thiserror::Error;

/// Errors produced while decoding a persisted segment or call tree.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The input ended in the middle of a value.
    #[error("unexpected end of input at byte {0}")]
    UnexpectedEof(usize),

    /// A varint ran past the 10 bytes a `u64` can occupy.
    #[error("varint overflow at byte {0}")]
    VarintOverflow(usize),

    /// The format version is not one this crate writes.
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u8),

    /// The input decoded, but describes an impossible structure.
    #[error("malformed input: {0}")]
    Malformed(&'static str),
}

/// Appends `value` as a LEB128 varint.
pub(crate) fn put_uvarint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Appends `value` zig-zag encoded, so small negative numbers stay short.
pub(crate) fn put_varint(buf: &mut Vec<u8>, value: i64) {
    put_uvarint(buf, ((value << 1) ^ (value >> 63)) as u64);
}

pub(crate) fn put_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    put_uvarint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

/// Cursor over an encoded buffer. Every read is bounds checked.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub(crate) fn u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or(DecodeError::UnexpectedEof(self.pos))?;
        self.pos += 1;
        Ok(b)
    }

    pub(crate) fn uvarint(&mut self) -> Result<u64, DecodeError> {
        let start = self.pos;
        let mut value = 0u64;
        let mut shift = 0;
        loop {
            if shift > 63 {
                return Err(DecodeError::VarintOverflow(start));
            }
            let byte = self.u8()?;
            value |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    pub(crate) fn varint(&mut self) -> Result<i64, DecodeError> {
        let u = self.uvarint()?;
        Ok(((u >> 1) as i64) ^ -((u & 1) as i64))
    }

    pub(crate) fn bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.uvarint()?;
        let end = usize::try_from(len)
            .ok()
            .and_then(|len| self.pos.checked_add(len))
            .filter(|&end| end <= self.buf.len())
            .ok_or(DecodeError::UnexpectedEof(self.pos))?;
        let data = &self.buf[self.pos..end];
        self.pos = end;
        Ok(data)
    }

    pub(crate) fn string(&mut self) -> Result<String, DecodeError> {
        let data = self.bytes()?;
        String::from_utf8(data.to_vec()).map_err(|_| DecodeError::Malformed("invalid utf-8"))
    }
}
