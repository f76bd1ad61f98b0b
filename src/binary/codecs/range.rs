//! Range and multirange codecs.
//!
//! ```text
//! range:       u8 flags, [i32 length, lower], [i32 length, upper]
//! multirange:  i32 count, count * (i32 length, range)
//! ```
//! A bound is present on the wire only when it is finite.

use bytes::{BufMut, BytesMut};
use uuid::Uuid;

use super::{encode_element, put_count, read_count, CodecMetadata, CodecRef};
use crate::binary::buffer::BufferContract;
use crate::binary::types::{Range, Value};
use crate::error::{EdgeError, Result};

const EMPTY: u8 = 0x01;
const INC_LOWER: u8 = 0x02;
const INC_UPPER: u8 = 0x04;
const INF_LOWER: u8 = 0x08;
const INF_UPPER: u8 = 0x10;

fn decode_bound(buf: &mut BufferContract<'_>, inner: &CodecRef) -> Result<Box<Value>> {
    let mut element = buf
        .read_element()?
        .ok_or_else(|| EdgeError::protocol("finite range bound has no value"))?;
    let value = inner.decode(&mut element)?;
    element.ensure_exhausted("range bound")?;
    Ok(Box::new(value))
}

pub(super) fn decode_range(buf: &mut BufferContract<'_>, inner: &CodecRef) -> Result<Range> {
    let flags = buf.read_u8()?;
    if flags & EMPTY != 0 {
        return Ok(Range::empty());
    }
    let lower = if flags & INF_LOWER == 0 {
        Some(decode_bound(buf, inner)?)
    } else {
        None
    };
    let upper = if flags & INF_UPPER == 0 {
        Some(decode_bound(buf, inner)?)
    } else {
        None
    };
    Ok(Range {
        lower,
        upper,
        inc_lower: flags & INC_LOWER != 0,
        inc_upper: flags & INC_UPPER != 0,
        empty: false,
    })
}

pub(super) fn encode_range(buf: &mut BytesMut, inner: &CodecRef, range: &Range) -> Result<()> {
    if range.empty {
        buf.put_u8(EMPTY);
        return Ok(());
    }
    let mut flags = 0;
    if range.inc_lower {
        flags |= INC_LOWER;
    }
    if range.inc_upper {
        flags |= INC_UPPER;
    }
    if range.lower.is_none() {
        flags |= INF_LOWER;
    }
    if range.upper.is_none() {
        flags |= INF_UPPER;
    }
    buf.put_u8(flags);
    for bound in [&range.lower, &range.upper].into_iter().flatten() {
        if bound.is_nothing() {
            return Err(EdgeError::invalid_value("range bound cannot be empty"));
        }
        encode_element(buf, inner, bound)?;
    }
    Ok(())
}

#[derive(Debug)]
pub struct RangeCodec {
    pub id: Uuid,
    pub inner: CodecRef,
    pub metadata: Option<CodecMetadata>,
}

impl RangeCodec {
    pub(super) fn decode(&self, buf: &mut BufferContract<'_>) -> Result<Value> {
        decode_range(buf, &self.inner).map(Value::Range)
    }

    pub(super) fn encode(&self, buf: &mut BytesMut, value: &Value) -> Result<()> {
        match value {
            Value::Range(range) => encode_range(buf, &self.inner, range),
            other => Err(other.mismatch("range")),
        }
    }
}

#[derive(Debug)]
pub struct MultiRangeCodec {
    pub id: Uuid,
    /// Codec of the range bounds.
    pub inner: CodecRef,
    pub metadata: Option<CodecMetadata>,
}

impl MultiRangeCodec {
    pub(super) fn decode(&self, buf: &mut BufferContract<'_>) -> Result<Value> {
        let count = read_count(buf, "multirange")?;
        let mut ranges = Vec::with_capacity(count.min(buf.remaining()));
        for _ in 0..count {
            let mut element = buf
                .read_element()?
                .ok_or_else(|| EdgeError::protocol("absent range in multirange"))?;
            ranges.push(decode_range(&mut element, &self.inner)?);
            element.ensure_exhausted("multirange element")?;
        }
        Ok(Value::MultiRange(ranges))
    }

    pub(super) fn encode(&self, buf: &mut BytesMut, value: &Value) -> Result<()> {
        let ranges = match value {
            Value::MultiRange(ranges) => ranges,
            other => return Err(other.mismatch("multirange")),
        };
        put_count(buf, ranges.len())?;
        for range in ranges {
            let len_at = buf.len();
            buf.put_i32(0);
            encode_range(buf, &self.inner, range)?;
            let len = (buf.len() - len_at - 4) as i32;
            buf[len_at..len_at + 4].copy_from_slice(&len.to_be_bytes());
        }
        Ok(())
    }
}
