use bytes::{BufMut, BytesMut};
use uuid::Uuid;

use super::{decode_element, encode_element, put_count, read_count, CodecMetadata, CodecRef};
use crate::binary::buffer::BufferContract;
use crate::binary::types::Value;
use crate::error::{EdgeError, Result};

/// Unnamed tuple: same element framing as objects.
#[derive(Debug)]
pub struct TupleCodec {
    pub id: Uuid,
    pub codecs: Vec<CodecRef>,
    pub metadata: Option<CodecMetadata>,
}

impl TupleCodec {
    pub fn new(id: Uuid, codecs: Vec<CodecRef>, metadata: Option<CodecMetadata>) -> Self {
        Self { id, codecs, metadata }
    }

    pub(super) fn decode(&self, buf: &mut BufferContract<'_>) -> Result<Value> {
        let count = read_count(buf, "tuple")?;
        if count != self.codecs.len() {
            return Err(EdgeError::protocol(format!(
                "tuple has {} elements, codec declares {}",
                count,
                self.codecs.len()
            )));
        }
        let mut items = Vec::with_capacity(count);
        for codec in &self.codecs {
            buf.skip(4)?;
            items.push(decode_element(buf, codec)?);
        }
        Ok(Value::Tuple(items))
    }

    pub(super) fn encode(&self, buf: &mut BytesMut, value: &Value) -> Result<()> {
        let items = match value {
            Value::Tuple(items) => items,
            other => return Err(other.mismatch("tuple")),
        };
        if items.len() != self.codecs.len() {
            return Err(EdgeError::invalid_value(format!(
                "tuple of {} elements given for {} slots",
                items.len(),
                self.codecs.len()
            )));
        }
        put_count(buf, items.len())?;
        for (item, codec) in items.iter().zip(&self.codecs) {
            buf.put_i32(0);
            encode_element(buf, codec, item)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::binary::codecs::{Codec, ScalarCodec, ScalarKind};

    #[test]
    fn test_empty_tuple() {
        let codec = TupleCodec::new(Uuid::nil(), Vec::new(), None);
        let mut buf = BytesMut::new();
        codec.encode(&mut buf, &Value::Tuple(Vec::new())).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
        assert_eq!(
            codec.decode(&mut BufferContract::new(&buf)).unwrap(),
            Value::Tuple(Vec::new())
        );
    }

    #[test]
    fn test_tuple_framing() {
        let codec = TupleCodec::new(
            Uuid::nil(),
            vec![
                Arc::new(Codec::Scalar(ScalarCodec::new(ScalarKind::Int16))),
                Arc::new(Codec::Scalar(ScalarCodec::new(ScalarKind::Bool))),
            ],
            None,
        );
        let value = Value::Tuple(vec![Value::Int16(2), Value::Nothing]);
        let mut buf = BytesMut::new();
        codec.encode(&mut buf, &value).unwrap();
        assert_eq!(
            &buf[..],
            &[
                0, 0, 0, 2, // count
                0, 0, 0, 0, 0, 0, 0, 2, 0, 2, // reserved, len 2, int16 2
                0, 0, 0, 0, 0xff, 0xff, 0xff, 0xff, // reserved, absent
            ]
        );
        assert_eq!(codec.decode(&mut BufferContract::new(&buf)).unwrap(), value);
    }

    #[test]
    fn test_tuple_arity_mismatch_on_encode() {
        let codec = TupleCodec::new(Uuid::nil(), Vec::new(), None);
        assert!(matches!(
            codec.encode(&mut BytesMut::new(), &Value::Tuple(vec![Value::Int16(1)])),
            Err(EdgeError::InvalidValue(_))
        ));
    }
}
