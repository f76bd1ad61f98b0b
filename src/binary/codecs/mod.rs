//! Codec tree nodes.
//!
//! A [`Codec`] reads and writes one wire shape. Trees are built from type
//! descriptors by [`crate::binary::builder::CodecCache`] and shared through
//! [`CodecRef`]; a node is never mutated after it is cached, except for the
//! lazily filled specialization tables some nodes carry.
//!
//! Layout:
//! - `scalar`, `temporal`, `numeric`: built-in scalars
//! - `complex`: scalars with several host representations (brokers)
//! - `object`, `tuple`: positional element framing
//! - `collection`, `range`: single-child wrappers
//! - `compilable`: wrappers compiled once the element codec is known
//! - `compound`: unions / intersections of component shapes

pub mod collection;
pub mod compilable;
pub mod complex;
pub mod compound;
pub mod numeric;
pub mod object;
pub mod range;
pub mod scalar;
pub mod temporal;
pub mod tuple;

use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use super::buffer::BufferContract;
use super::host::HostType;
use super::types::Value;
use crate::error::{EdgeError, Result};

pub use collection::{ArrayCodec, SetCodec};
pub use compilable::{CompilableCodec, CompilableKind};
pub use complex::{ComplexCodec, Converter, RuntimeCodec};
pub use compound::CompoundCodec;
pub use object::{ObjectCodec, SparseObjectCodec};
pub use range::{MultiRangeCodec, RangeCodec};
pub use scalar::{well_known, ScalarCodec, ScalarKind};
pub use tuple::TupleCodec;

/// Shared handle to a codec node.
pub type CodecRef = Arc<Codec>;

/// Id of the codec used when a query has no input or no output.
pub const NULL_CODEC_ID: Uuid = Uuid::nil();

/// Id that never names a real type.
pub const INVALID_CODEC_ID: Uuid = Uuid::from_bytes([0xff; 16]);

/// Schema information carried by current-dialect descriptors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodecMetadata {
    pub name: Option<String>,
    pub schema_defined: bool,
    pub ancestors: Vec<Uuid>,
}

impl CodecMetadata {
    pub fn named(name: impl Into<String>, schema_defined: bool) -> Self {
        Self {
            name: Some(name.into()),
            schema_defined,
            ancestors: Vec::new(),
        }
    }
}

/// Enumeration codec: UTF-8 member label.
#[derive(Debug, Clone)]
pub struct EnumCodec {
    pub id: Uuid,
    pub members: Vec<String>,
    pub metadata: Option<CodecMetadata>,
}

impl EnumCodec {
    fn decode(&self, buf: &mut BufferContract<'_>) -> Result<Value> {
        let raw = buf.read_rest()?;
        let label = std::str::from_utf8(raw)
            .map_err(|e| EdgeError::protocol(format!("invalid UTF-8 in enum: {}", e)))?;
        Ok(Value::Enum(label.to_owned()))
    }

    fn encode(&self, buf: &mut BytesMut, value: &Value) -> Result<()> {
        let label = match value {
            Value::Enum(s) | Value::Str(s) => s,
            other => return Err(other.mismatch("enum")),
        };
        if !self.members.iter().any(|m| m == label) {
            return Err(EdgeError::invalid_value(format!(
                "{:?} is not a member of {}",
                label,
                self.metadata
                    .as_ref()
                    .and_then(|m| m.name.as_deref())
                    .unwrap_or("enum")
            )));
        }
        buf.put_slice(label.as_bytes());
        Ok(())
    }
}

#[derive(Debug)]
pub enum Codec {
    /// Absent input or output shape.
    Null,
    Scalar(ScalarCodec),
    Complex(ComplexCodec),
    Runtime(RuntimeCodec),
    Enum(EnumCodec),
    Object(ObjectCodec),
    SparseObject(SparseObjectCodec),
    Tuple(TupleCodec),
    Compilable(CompilableCodec),
    Array(ArrayCodec),
    Set(SetCodec),
    Range(RangeCodec),
    MultiRange(MultiRangeCodec),
    Compound(CompoundCodec),
}

impl Codec {
    pub fn null() -> CodecRef {
        Arc::new(Codec::Null)
    }

    pub fn id(&self) -> Uuid {
        match self {
            Codec::Null => NULL_CODEC_ID,
            Codec::Scalar(c) => c.id(),
            Codec::Complex(c) => c.id(),
            Codec::Runtime(c) => c.id(),
            Codec::Enum(c) => c.id,
            Codec::Object(c) => c.id,
            Codec::SparseObject(c) => c.id,
            Codec::Tuple(c) => c.id,
            Codec::Compilable(c) => c.id,
            Codec::Array(c) => c.id,
            Codec::Set(c) => c.id,
            Codec::Range(c) => c.id,
            Codec::MultiRange(c) => c.id,
            Codec::Compound(c) => c.id,
        }
    }

    pub fn metadata(&self) -> Option<&CodecMetadata> {
        match self {
            Codec::Null | Codec::Runtime(_) => None,
            Codec::Scalar(c) => c.metadata.as_ref(),
            Codec::Complex(c) => c.scalar.metadata.as_ref(),
            Codec::Enum(c) => c.metadata.as_ref(),
            Codec::Object(c) => c.metadata.as_ref(),
            Codec::SparseObject(_) => None,
            Codec::Tuple(c) => c.metadata.as_ref(),
            Codec::Compilable(c) => c.metadata.as_ref(),
            Codec::Array(c) => c.metadata.as_ref(),
            Codec::Set(c) => c.metadata.as_ref(),
            Codec::Range(c) => c.metadata.as_ref(),
            Codec::MultiRange(c) => c.metadata.as_ref(),
            Codec::Compound(c) => c.metadata.as_ref(),
        }
    }

    /// Human-readable wire type, used in error messages.
    pub fn type_name(&self) -> String {
        if let Some(name) = self.metadata().and_then(|m| m.name.as_deref()) {
            return name.to_string();
        }
        match self {
            Codec::Null => "null".to_string(),
            Codec::Scalar(c) => c.kind.name().to_string(),
            Codec::Complex(c) => c.scalar.kind.name().to_string(),
            Codec::Runtime(c) => format!("{} as {}", c.kind.name(), c.converter.host),
            Codec::Enum(_) => "enum".to_string(),
            Codec::Object(_) => "object".to_string(),
            Codec::SparseObject(_) => "input shape".to_string(),
            Codec::Tuple(c) => {
                let items: Vec<String> = c.codecs.iter().map(|c| c.type_name()).collect();
                format!("tuple<{}>", items.join(", "))
            }
            Codec::Compilable(c) => format!("{}<{}>", c.kind.name(), c.inner.type_name()),
            Codec::Array(c) => format!("array<{}>", c.inner.type_name()),
            Codec::Set(c) => format!("set<{}>", c.inner.type_name()),
            Codec::Range(c) => format!("range<{}>", c.inner.type_name()),
            Codec::MultiRange(c) => format!("multirange<{}>", c.inner.type_name()),
            Codec::Compound(c) => format!("{:?} of {} components", c.operation, c.components.len()),
        }
    }

    /// Decode one value from a buffer holding exactly its payload.
    pub fn decode(&self, buf: &mut BufferContract<'_>) -> Result<Value> {
        match self {
            Codec::Null => Ok(Value::Nothing),
            Codec::Scalar(c) => c.kind.decode(buf),
            Codec::Complex(c) => c.scalar.kind.decode(buf),
            Codec::Runtime(c) => c.decode(buf),
            Codec::Enum(c) => c.decode(buf),
            Codec::Object(c) => c.decode(buf),
            Codec::SparseObject(c) => c.decode(buf),
            Codec::Tuple(c) => c.decode(buf),
            Codec::Compilable(c) => c.compiled().decode(buf),
            Codec::Array(c) => c.decode(buf),
            Codec::Set(c) => c.decode(buf),
            Codec::Range(c) => c.decode(buf),
            Codec::MultiRange(c) => c.decode(buf),
            Codec::Compound(c) => Err(c.unresolved()),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut, value: &Value) -> Result<()> {
        match self {
            Codec::Null => match value {
                Value::Nothing => Ok(()),
                Value::Tuple(v) if v.is_empty() => Ok(()),
                other => Err(other.mismatch("no value")),
            },
            Codec::Scalar(c) => c.kind.encode(buf, value),
            Codec::Complex(c) => c.encode(buf, value),
            Codec::Runtime(c) => c.encode(buf, value),
            Codec::Enum(c) => c.encode(buf, value),
            Codec::Object(c) => c.encode(buf, value),
            Codec::SparseObject(c) => c.encode(buf, value),
            Codec::Tuple(c) => c.encode(buf, value),
            Codec::Compilable(c) => c.compiled().encode(buf, value),
            Codec::Array(c) => c.encode(buf, value),
            Codec::Set(c) => c.encode(buf, value),
            Codec::Range(c) => c.encode(buf, value),
            Codec::MultiRange(c) => c.encode(buf, value),
            Codec::Compound(c) => Err(c.unresolved()),
        }
    }

    /// Encode into a fresh buffer, e.g. for Execute arguments.
    pub fn encode_to_bytes(&self, value: &Value) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf, value)?;
        Ok(buf.freeze())
    }

    /// Host representation this codec produces as-is.
    pub fn converter_type(&self) -> HostType {
        match self {
            Codec::Null => HostType::Ignore,
            Codec::Scalar(c) => c.kind.native_host(),
            Codec::Complex(c) => c.scalar.kind.native_host(),
            Codec::Runtime(c) => c.converter.host.clone(),
            Codec::Enum(_) => HostType::Enum,
            Codec::Object(c) => match &c.target {
                Some(shape) => HostType::Object(Arc::clone(shape)),
                None => HostType::Dynamic,
            },
            Codec::SparseObject(_) | Codec::Compound(_) => HostType::Dynamic,
            Codec::Tuple(c) => HostType::Tuple(c.codecs.iter().map(|c| c.converter_type()).collect()),
            Codec::Compilable(c) => c.compiled().converter_type(),
            Codec::Array(c) => HostType::Array(Box::new(c.inner.converter_type())),
            Codec::Set(c) => HostType::Set(Box::new(c.inner.converter_type())),
            Codec::Range(c) => HostType::Range(Box::new(c.inner.converter_type())),
            Codec::MultiRange(c) => HostType::MultiRange(Box::new(c.inner.converter_type())),
        }
    }

    /// Whether values of this codec can be represented as `host`.
    pub fn accepts(&self, host: &HostType) -> bool {
        let host = host.unwrap_optional();
        if matches!(host, HostType::Ignore | HostType::Dynamic) {
            return true;
        }
        match self {
            Codec::Null => false,
            Codec::Scalar(c) => c.kind.native_host() == *host,
            Codec::Complex(c) => c.accepts(host),
            Codec::Runtime(c) => c.converter.host == *host,
            Codec::Enum(_) => matches!(host, HostType::Enum | HostType::Str),
            Codec::Object(_) | Codec::SparseObject(_) => matches!(host, HostType::Object(_)),
            Codec::Tuple(c) => match host {
                HostType::Tuple(items) => {
                    items.len() == c.codecs.len()
                        && c.codecs.iter().zip(items).all(|(codec, ty)| codec.accepts(ty))
                }
                _ => false,
            },
            Codec::Compilable(c) => c.kind.matches_host(host) && c.inner.accepts(&host.element_type()),
            Codec::Array(c) => {
                matches!(host, HostType::Array(_)) && c.inner.accepts(&host.element_type())
            }
            Codec::Set(c) => {
                matches!(host, HostType::Set(_) | HostType::Array(_))
                    && c.inner.accepts(&host.element_type())
            }
            Codec::Range(c) => {
                matches!(host, HostType::Range(_)) && c.inner.accepts(&host.element_type())
            }
            Codec::MultiRange(c) => {
                matches!(host, HostType::MultiRange(_)) && c.inner.accepts(&host.element_type())
            }
            Codec::Compound(c) => c.components.iter().any(|codec| codec.accepts(host)),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Codec::Null)
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.type_name(), self.id())
    }
}

// ============================================================================
// Element framing
// ============================================================================

/// Decode an i32-length-framed element; `-1` yields `Nothing`.
pub(crate) fn decode_element(buf: &mut BufferContract<'_>, codec: &Codec) -> Result<Value> {
    match buf.read_element()? {
        None => Ok(Value::Nothing),
        Some(mut element) => {
            let value = codec.decode(&mut element)?;
            element.ensure_exhausted(&codec.type_name())?;
            Ok(value)
        }
    }
}

/// Encode a value with an i32 length prefix; `Nothing` is written as `-1`.
pub(crate) fn encode_element(buf: &mut BytesMut, codec: &Codec, value: &Value) -> Result<()> {
    if value.is_nothing() {
        buf.put_i32(-1);
        return Ok(());
    }
    let len_at = buf.len();
    buf.put_i32(0);
    codec.encode(buf, value)?;
    let len = buf.len() - len_at - 4;
    let len = i32::try_from(len)
        .map_err(|_| EdgeError::invalid_value(format!("element of {} bytes is too large", len)))?;
    buf[len_at..len_at + 4].copy_from_slice(&len.to_be_bytes());
    Ok(())
}

/// Read an element count, rejecting negative values.
pub(crate) fn read_count(buf: &mut BufferContract<'_>, what: &str) -> Result<usize> {
    let count = buf.read_i32()?;
    usize::try_from(count)
        .map_err(|_| EdgeError::protocol(format!("negative {} element count {}", what, count)))
}

pub(crate) fn put_count(buf: &mut BytesMut, count: usize) -> Result<()> {
    let count = i32::try_from(count)
        .map_err(|_| EdgeError::invalid_value(format!("{} elements do not fit the wire count", count)))?;
    buf.put_i32(count);
    Ok(())
}
