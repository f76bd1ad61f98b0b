//! Array and set codecs.
//!
//! ```text
//! i32 ndims            0 = empty, otherwise 1
//! i32 flags            reserved
//! i32 reserved
//! ndims * (i32 upper, i32 lower)     n = upper - lower + 1
//! n * (i32 length | -1, payload)
//! ```
//!
//! A set whose elements are arrays wraps every element in an envelope:
//! `i32 length, i32 count (= 1), i32 reserved, i32 length, array payload`.

use bytes::{BufMut, BytesMut};
use uuid::Uuid;

use super::{decode_element, encode_element, put_count, Codec, CodecMetadata, CodecRef};
use crate::binary::buffer::BufferContract;
use crate::binary::types::Value;
use crate::error::{EdgeError, Result};

/// Read the array header and return the element count.
fn read_header(buf: &mut BufferContract<'_>, what: &str) -> Result<usize> {
    let ndims = buf.read_i32()?;
    buf.skip(8)?;
    match ndims {
        0 => Ok(0),
        1 => {
            let upper = buf.read_i32()?;
            let lower = buf.read_i32()?;
            let n = (upper as i64) - (lower as i64) + 1;
            usize::try_from(n)
                .map_err(|_| EdgeError::protocol(format!("invalid {} bounds {}..{}", what, lower, upper)))
        }
        other => Err(EdgeError::protocol(format!(
            "{} with {} dimensions is not supported",
            what, other
        ))),
    }
}

fn write_header(buf: &mut BytesMut, len: usize) -> Result<()> {
    if len == 0 {
        buf.put_i32(0);
        buf.put_i32(0);
        buf.put_i32(0);
        return Ok(());
    }
    buf.put_i32(1);
    buf.put_i32(0);
    buf.put_i32(0);
    put_count(buf, len)?;
    buf.put_i32(1);
    Ok(())
}

fn elements<'v>(value: &'v Value, what: &str) -> Result<&'v [Value]> {
    match value {
        Value::Array(items) | Value::Set(items) => Ok(items),
        other => Err(other.mismatch(what)),
    }
}

#[derive(Debug)]
pub struct ArrayCodec {
    pub id: Uuid,
    pub inner: CodecRef,
    pub metadata: Option<CodecMetadata>,
    pub dimensions: Vec<i32>,
}

impl ArrayCodec {
    pub(super) fn decode(&self, buf: &mut BufferContract<'_>) -> Result<Value> {
        let n = read_header(buf, "array")?;
        let mut items = Vec::with_capacity(n.min(buf.remaining() / 4));
        for _ in 0..n {
            items.push(decode_element(buf, &self.inner)?);
        }
        Ok(Value::Array(items))
    }

    pub(super) fn encode(&self, buf: &mut BytesMut, value: &Value) -> Result<()> {
        let items = elements(value, "array")?;
        write_header(buf, items.len())?;
        for item in items {
            if item.is_nothing() {
                return Err(EdgeError::invalid_value("arrays cannot contain empty elements"));
            }
            encode_element(buf, &self.inner, item)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct SetCodec {
    pub id: Uuid,
    pub inner: CodecRef,
    pub metadata: Option<CodecMetadata>,
}

impl SetCodec {
    fn enveloped(&self) -> bool {
        match &*self.inner {
            Codec::Array(_) => true,
            Codec::Compilable(c) => matches!(&**c.compiled(), Codec::Array(_)),
            _ => false,
        }
    }

    pub(super) fn decode(&self, buf: &mut BufferContract<'_>) -> Result<Value> {
        let n = read_header(buf, "set")?;
        let enveloped = self.enveloped();
        let mut items = Vec::with_capacity(n.min(buf.remaining() / 4));
        for _ in 0..n {
            if !enveloped {
                items.push(decode_element(buf, &self.inner)?);
                continue;
            }
            let mut envelope = buf
                .read_element()?
                .ok_or_else(|| EdgeError::protocol("absent array envelope in set"))?;
            let count = envelope.read_i32()?;
            if count != 1 {
                return Err(EdgeError::protocol(format!(
                    "array envelope holds {} elements, expected 1",
                    count
                )));
            }
            envelope.skip(4)?;
            items.push(decode_element(&mut envelope, &self.inner)?);
            envelope.ensure_exhausted("array envelope")?;
        }
        Ok(Value::Set(items))
    }

    pub(super) fn encode(&self, buf: &mut BytesMut, value: &Value) -> Result<()> {
        let items = elements(value, "set")?;
        write_header(buf, items.len())?;
        let enveloped = self.enveloped();
        for item in items {
            if !enveloped {
                encode_element(buf, &self.inner, item)?;
                continue;
            }
            let len_at = buf.len();
            buf.put_i32(0);
            buf.put_i32(1);
            buf.put_i32(0);
            encode_element(buf, &self.inner, item)?;
            let len = (buf.len() - len_at - 4) as i32;
            buf[len_at..len_at + 4].copy_from_slice(&len.to_be_bytes());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::binary::codecs::{ScalarCodec, ScalarKind};

    fn int32() -> CodecRef {
        Arc::new(Codec::Scalar(ScalarCodec::new(ScalarKind::Int32)))
    }

    fn array_of(inner: CodecRef) -> ArrayCodec {
        ArrayCodec {
            id: Uuid::nil(),
            inner,
            metadata: None,
            dimensions: vec![-1],
        }
    }

    #[test]
    fn test_array_wire_layout() {
        let codec = array_of(int32());
        let value = Value::Array(vec![Value::Int32(5)]);
        let mut buf = BytesMut::new();
        codec.encode(&mut buf, &value).unwrap();
        assert_eq!(
            &buf[..],
            &[
                0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, // ndims, flags, reserved
                0, 0, 0, 1, 0, 0, 0, 1, // upper=1, lower=1
                0, 0, 0, 4, 0, 0, 0, 5,
            ]
        );
        assert_eq!(codec.decode(&mut BufferContract::new(&buf)).unwrap(), value);
    }

    #[test]
    fn test_empty_array() {
        let codec = array_of(int32());
        let mut buf = BytesMut::new();
        codec.encode(&mut buf, &Value::Array(Vec::new())).unwrap();
        assert_eq!(buf.len(), 12);
        assert_eq!(
            codec.decode(&mut BufferContract::new(&buf)).unwrap(),
            Value::Array(Vec::new())
        );
    }

    #[test]
    fn test_multi_dimensional_array_rejected() {
        let mut data = Vec::new();
        data.extend_from_slice(&2i32.to_be_bytes());
        data.extend_from_slice(&[0; 8]);
        let codec = array_of(int32());
        assert!(matches!(
            codec.decode(&mut BufferContract::new(&data)),
            Err(EdgeError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_set_of_arrays_uses_envelopes() {
        let set = SetCodec {
            id: Uuid::nil(),
            inner: Arc::new(Codec::Array(array_of(int32()))),
            metadata: None,
        };
        let value = Value::Set(vec![
            Value::Array(vec![Value::Int32(1), Value::Int32(2)]),
            Value::Array(Vec::new()),
        ]);
        let mut buf = BytesMut::new();
        set.encode(&mut buf, &value).unwrap();
        assert_eq!(set.decode(&mut BufferContract::new(&buf)).unwrap(), value);

        // First envelope: after the 20-byte set header, length then count 1
        assert_eq!(&buf[24..28], &1i32.to_be_bytes());
    }

    #[test]
    fn test_plain_set() {
        let set = SetCodec {
            id: Uuid::nil(),
            inner: int32(),
            metadata: None,
        };
        let value = Value::Set(vec![Value::Int32(1), Value::Int32(-1)]);
        let mut buf = BytesMut::new();
        set.encode(&mut buf, &value).unwrap();
        assert_eq!(buf.len(), 20 + 2 * 8);
        assert_eq!(set.decode(&mut BufferContract::new(&buf)).unwrap(), value);
    }
}
