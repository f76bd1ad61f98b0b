//! Object, named tuple and input-shape codecs.
//!
//! ```text
//! object:  i32 count, count * (i32 reserved, i32 length | -1, payload)
//! sparse:  i32 count, count * (i32 field index, i32 length | -1, payload)
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use parking_lot::RwLock;
use uuid::Uuid;

use super::{decode_element, encode_element, put_count, read_count, CodecMetadata, CodecRef};
use crate::binary::buffer::BufferContract;
use crate::binary::host::HostShape;
use crate::binary::types::{Object, SharedNames, SparseObject, Value};
use crate::error::{EdgeError, Result};

/// Positional object codec. Names and child codecs are parallel, in
/// declaration order.
#[derive(Debug)]
pub struct ObjectCodec {
    pub id: Uuid,
    pub names: SharedNames,
    pub codecs: Vec<CodecRef>,
    pub metadata: Option<CodecMetadata>,
    /// Host shape this instance was specialized for.
    pub target: Option<Arc<HostShape>>,
    typed: RwLock<HashMap<Arc<HostShape>, CodecRef>>,
}

impl ObjectCodec {
    pub fn new(
        id: Uuid,
        names: Vec<String>,
        codecs: Vec<CodecRef>,
        metadata: Option<CodecMetadata>,
    ) -> Result<Self> {
        if names.len() != codecs.len() {
            return Err(EdgeError::Internal(format!(
                "object {} has {} names but {} codecs",
                id,
                names.len(),
                codecs.len()
            )));
        }
        Ok(Self {
            id,
            names: Arc::new(names),
            codecs,
            metadata,
            target: None,
            typed: RwLock::new(HashMap::new()),
        })
    }

    /// A sibling with specialized children, bound to `shape`.
    pub(crate) fn specialized(&self, shape: Arc<HostShape>, codecs: Vec<CodecRef>) -> Self {
        Self {
            id: self.id,
            names: Arc::clone(&self.names),
            codecs,
            metadata: self.metadata.clone(),
            target: Some(shape),
            typed: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn typed_for(&self, shape: &Arc<HostShape>) -> Option<CodecRef> {
        self.typed.read().get(shape).cloned()
    }

    /// Store a typed sibling; an earlier entry for the same shape wins.
    pub(crate) fn store_typed(&self, shape: Arc<HostShape>, codec: CodecRef) -> CodecRef {
        Arc::clone(self.typed.write().entry(shape).or_insert(codec))
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }

    pub(super) fn decode(&self, buf: &mut BufferContract<'_>) -> Result<Value> {
        let count = read_count(buf, "object")?;
        if count != self.codecs.len() {
            return Err(EdgeError::protocol(format!(
                "object has {} elements, codec declares {}",
                count,
                self.codecs.len()
            )));
        }
        let mut values = Vec::with_capacity(count);
        for codec in &self.codecs {
            buf.skip(4)?;
            values.push(decode_element(buf, codec)?);
        }
        Ok(Value::Object(Object::new(Arc::clone(&self.names), values)?))
    }

    /// Encode as positional arguments: fields are looked up by name, a
    /// tuple value is taken positionally.
    pub(super) fn encode(&self, buf: &mut BytesMut, value: &Value) -> Result<()> {
        put_count(buf, self.codecs.len())?;
        match value {
            Value::Object(obj) => {
                for (name, codec) in self.names.iter().zip(&self.codecs) {
                    let field = obj.get(name).ok_or_else(|| {
                        EdgeError::invalid_value(format!("missing argument `{}`", name))
                    })?;
                    buf.put_i32(0);
                    encode_element(buf, codec, field)?;
                }
            }
            Value::Tuple(items) if items.len() == self.codecs.len() => {
                for (item, codec) in items.iter().zip(&self.codecs) {
                    buf.put_i32(0);
                    encode_element(buf, codec, item)?;
                }
            }
            other => return Err(other.mismatch("object")),
        }
        Ok(())
    }
}

/// Input shape: only present fields travel, each tagged with its index.
#[derive(Debug)]
pub struct SparseObjectCodec {
    pub id: Uuid,
    pub names: SharedNames,
    pub codecs: Vec<CodecRef>,
}

impl SparseObjectCodec {
    pub fn new(id: Uuid, names: Vec<String>, codecs: Vec<CodecRef>) -> Self {
        Self {
            id,
            names: Arc::new(names),
            codecs,
        }
    }

    fn index_of(&self, name: &str) -> Result<usize> {
        self.names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| EdgeError::invalid_value(format!("unknown field `{}`", name)))
    }

    pub(super) fn decode(&self, buf: &mut BufferContract<'_>) -> Result<Value> {
        let count = read_count(buf, "input shape")?;
        let mut out = SparseObject::new();
        for _ in 0..count {
            let index = buf.read_i32()?;
            let (name, codec) = usize::try_from(index)
                .ok()
                .and_then(|i| Some((self.names.get(i)?, self.codecs.get(i)?)))
                .ok_or_else(|| EdgeError::protocol(format!("input shape field index {} out of range", index)))?;
            out.set(name.clone(), decode_element(buf, codec)?);
        }
        Ok(Value::SparseObject(out))
    }

    pub(super) fn encode(&self, buf: &mut BytesMut, value: &Value) -> Result<()> {
        let fields: Vec<(&str, &Value)> = match value {
            Value::SparseObject(obj) => obj.fields().iter().map(|(n, v)| (n.as_str(), v)).collect(),
            Value::Object(obj) => obj.iter().collect(),
            other => return Err(other.mismatch("input shape")),
        };
        put_count(buf, fields.len())?;
        for (name, field) in fields {
            let index = self.index_of(name)?;
            buf.put_i32(index as i32);
            encode_element(buf, &self.codecs[index], field)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::codecs::{Codec, ScalarCodec, ScalarKind};

    fn int64() -> CodecRef {
        Arc::new(Codec::Scalar(ScalarCodec::new(ScalarKind::Int64)))
    }

    fn str_codec() -> CodecRef {
        Arc::new(Codec::Scalar(ScalarCodec::new(ScalarKind::Str)))
    }

    #[test]
    fn test_object_count_mismatch() {
        let codec = ObjectCodec::new(Uuid::nil(), vec!["a".into()], vec![int64()], None).unwrap();
        let data = 2i32.to_be_bytes();
        assert!(matches!(
            codec.decode(&mut BufferContract::new(&data)),
            Err(EdgeError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_object_encodes_arguments_by_name() {
        let codec = ObjectCodec::new(
            Uuid::nil(),
            vec!["id".into(), "name".into()],
            vec![int64(), str_codec()],
            None,
        )
        .unwrap();
        let value = Value::Object(Object::from_pairs([
            ("name", Value::from("x")),
            ("id", Value::Int64(3)),
        ]));
        let mut buf = BytesMut::new();
        codec.encode(&mut buf, &value).unwrap();

        let decoded = codec.decode(&mut BufferContract::new(&buf)).unwrap();
        let obj = decoded.as_object().unwrap();
        assert_eq!(obj.names(), &["id".to_string(), "name".to_string()]);
        assert_eq!(obj.get("id"), Some(&Value::Int64(3)));
        assert_eq!(obj.get("name"), Some(&Value::from("x")));
    }

    #[test]
    fn test_sparse_object_writes_only_present_fields() {
        let codec = SparseObjectCodec::new(
            Uuid::nil(),
            vec!["a".into(), "b".into()],
            vec![int64(), str_codec()],
        );
        let value = Value::SparseObject(SparseObject::new().with("b", "hi"));
        let mut buf = BytesMut::new();
        codec.encode(&mut buf, &value).unwrap();
        // count=1, index=1, len=2, "hi"
        assert_eq!(&buf[..], &[0, 0, 0, 1, 0, 0, 0, 1, 0, 0, 0, 2, b'h', b'i']);

        let decoded = codec.decode(&mut BufferContract::new(&buf)).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_sparse_object_unknown_field() {
        let codec = SparseObjectCodec::new(Uuid::nil(), vec!["a".into()], vec![int64()]);
        let value = Value::SparseObject(SparseObject::new().with("zzz", 1i64));
        assert!(matches!(
            codec.encode(&mut BytesMut::new(), &value),
            Err(EdgeError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_sparse_object_null_field() {
        let codec = SparseObjectCodec::new(Uuid::nil(), vec!["a".into()], vec![int64()]);
        let value = Value::SparseObject(SparseObject::new().with("a", Value::Nothing));
        let mut buf = BytesMut::new();
        codec.encode(&mut buf, &value).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 1, 0, 0, 0, 0, 0xff, 0xff, 0xff, 0xff]);
    }
}
