//! Wrapping codecs whose concrete form depends on the element codec.
//!
//! Arrays, sets, ranges and multiranges are built as [`CompilableCodec`]s.
//! Once the element codec has been specialized for a host type, the wrapper
//! is compiled into the matching concrete codec around it.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use uuid::Uuid;

use super::{ArrayCodec, Codec, CodecMetadata, CodecRef, MultiRangeCodec, RangeCodec, SetCodec};
use crate::binary::host::HostType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompilableKind {
    Array { dimensions: Vec<i32> },
    Set,
    Range,
    MultiRange,
}

impl CompilableKind {
    pub fn name(&self) -> &'static str {
        match self {
            CompilableKind::Array { .. } => "array",
            CompilableKind::Set => "set",
            CompilableKind::Range => "range",
            CompilableKind::MultiRange => "multirange",
        }
    }

    /// Whether `host` is a collection this wrapper can produce.
    pub fn matches_host(&self, host: &HostType) -> bool {
        match (self, host.unwrap_optional()) {
            (CompilableKind::Array { .. }, HostType::Array(_)) => true,
            (CompilableKind::Set, HostType::Set(_) | HostType::Array(_)) => true,
            (CompilableKind::Range, HostType::Range(_)) => true,
            (CompilableKind::MultiRange, HostType::MultiRange(_)) => true,
            (_, HostType::Dynamic | HostType::Ignore) => true,
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct CompilableCodec {
    pub id: Uuid,
    pub inner: CodecRef,
    pub kind: CompilableKind,
    pub metadata: Option<CodecMetadata>,
    default: OnceCell<CodecRef>,
}

impl CompilableCodec {
    pub fn new(id: Uuid, inner: CodecRef, kind: CompilableKind, metadata: Option<CodecMetadata>) -> Self {
        Self {
            id,
            inner,
            kind,
            metadata,
            default: OnceCell::new(),
        }
    }

    /// Build the concrete wrapper around `inner`.
    pub fn compile(&self, inner: CodecRef) -> CodecRef {
        let id = self.id;
        let metadata = self.metadata.clone();
        Arc::new(match &self.kind {
            CompilableKind::Array { dimensions } => Codec::Array(ArrayCodec {
                id,
                inner,
                metadata,
                dimensions: dimensions.clone(),
            }),
            CompilableKind::Set => Codec::Set(SetCodec { id, inner, metadata }),
            CompilableKind::Range => Codec::Range(RangeCodec { id, inner, metadata }),
            CompilableKind::MultiRange => Codec::MultiRange(MultiRangeCodec { id, inner, metadata }),
        })
    }

    /// The wrapper compiled around the unspecialized element codec.
    pub fn compiled(&self) -> &CodecRef {
        self.default.get_or_init(|| self.compile(Arc::clone(&self.inner)))
    }
}
