//! Codec tree construction and the codec cache.
//!
//! The server describes every type as a flat descriptor sequence in which a
//! descriptor only references positions listed before it. [`CodecCache`]
//! walks the sequence once, reusing cached codecs by id, and returns the last
//! codec built as the root of the tree.
//!
//! The cache is injectable: a connection owns one, empty at start, growing
//! monotonically. Reads happen under a shared lock; codecs are built outside
//! any lock and inserted first-writer-wins, so two racing builds of the same
//! id converge on one instance.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use super::codecs::{
    complex, Codec, CodecMetadata, CodecRef, CompilableCodec, CompilableKind, CompoundCodec,
    EnumCodec, ObjectCodec, ScalarCodec, ScalarKind, SparseObjectCodec, TupleCodec,
    NULL_CODEC_ID,
};
use super::descriptors::{decode_descriptor_bytes, DescriptorMetadata, TypeDescriptor, TypePos};
use super::host::HostType;
use super::protocol::ProtocolVersion;
use crate::error::{EdgeError, Result};

/// Cache key for anything derived from a codec for one host type.
pub type HostKey = (Uuid, HostType);

/// One resolved position of a descriptor sequence.
struct Slot {
    id: Uuid,
    codec: Option<CodecRef>,
    metadata: Option<CodecMetadata>,
}

#[derive(Debug)]
pub struct CodecCache {
    codecs: RwLock<HashMap<Uuid, CodecRef>>,
    compiled: RwLock<HashMap<HostKey, CodecRef>>,
    specializations: RwLock<HashMap<HostKey, CodecRef>>,
    null: CodecRef,
}

impl Default for CodecCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CodecCache {
    pub fn new() -> Self {
        Self {
            codecs: RwLock::new(HashMap::new()),
            compiled: RwLock::new(HashMap::new()),
            specializations: RwLock::new(HashMap::new()),
            null: Codec::null(),
        }
    }

    /// The singleton codec for absent input/output.
    pub fn null_codec(&self) -> CodecRef {
        Arc::clone(&self.null)
    }

    pub fn get(&self, id: &Uuid) -> Option<CodecRef> {
        if *id == NULL_CODEC_ID {
            return Some(self.null_codec());
        }
        self.codecs.read().get(id).cloned()
    }

    /// Like [`get`](Self::get), but a miss is a `MissingCodec` error.
    pub fn require(&self, id: &Uuid) -> Result<CodecRef> {
        self.get(id)
            .ok_or_else(|| EdgeError::missing_codec(*id, "type was never described to this client"))
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        *id == NULL_CODEC_ID || self.codecs.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.codecs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.read().is_empty()
    }

    pub fn clear(&self) {
        self.codecs.write().clear();
        self.compiled.write().clear();
        self.specializations.write().clear();
    }

    /// Compiled wrapper for `key`, building it with `build` on a miss.
    pub(crate) fn compiled_or_insert(&self, key: HostKey, build: impl FnOnce() -> CodecRef) -> CodecRef {
        if let Some(hit) = self.compiled.read().get(&key) {
            return Arc::clone(hit);
        }
        let built = build();
        Arc::clone(self.compiled.write().entry(key).or_insert(built))
    }

    pub(crate) fn specialization(&self, key: &HostKey) -> Option<CodecRef> {
        self.specializations.read().get(key).cloned()
    }

    /// Memoize a specialization; an entry that is already present wins.
    pub(crate) fn store_specialization(&self, key: HostKey, codec: CodecRef) -> CodecRef {
        Arc::clone(self.specializations.write().entry(key).or_insert(codec))
    }

    /// Decode `bytes` as a descriptor sequence and build its tree.
    pub fn build_codec_from_bytes(
        &self,
        version: ProtocolVersion,
        root_id: Uuid,
        bytes: &[u8],
    ) -> Result<CodecRef> {
        if root_id == NULL_CODEC_ID {
            return Ok(self.null_codec());
        }
        if let Some(hit) = self.get(&root_id) {
            return Ok(hit);
        }
        let descriptors = decode_descriptor_bytes(version, bytes)?;
        self.build_codec(root_id, &descriptors)
    }

    /// Build (or fetch) the codec tree rooted at `root_id`.
    ///
    /// Nothing is added to the cache unless every descriptor builds.
    pub fn build_codec(&self, root_id: Uuid, descriptors: &[TypeDescriptor]) -> Result<CodecRef> {
        if root_id == NULL_CODEC_ID {
            return Ok(self.null_codec());
        }
        if let Some(hit) = self.get(&root_id) {
            tracing::debug!(id = %root_id, "reusing cached codec tree");
            return Ok(hit);
        }

        let mut slots: Vec<Slot> = Vec::with_capacity(descriptors.len());
        let mut staged: HashMap<Uuid, CodecRef> = HashMap::new();
        let mut root = None;

        for descriptor in descriptors {
            if !descriptor.occupies_position() {
                continue;
            }
            let id = descriptor.id().unwrap_or(NULL_CODEC_ID);
            let metadata = slot_metadata(descriptor, &slots);

            let existing = staged.get(&id).cloned().or_else(|| self.get(&id));
            let codec = match existing {
                Some(codec) => Some(codec),
                None => {
                    let built = build_one(descriptor, &slots, metadata.clone())?;
                    if let Some(codec) = &built {
                        tracing::debug!(id = %id, kind = descriptor.kind(), "built codec");
                        staged.insert(id, Arc::clone(codec));
                    }
                    built
                }
            };
            if codec.is_some() {
                root = codec.clone();
            }
            slots.push(Slot { id, codec, metadata });
        }

        let root = staged
            .get(&root_id)
            .cloned()
            .or(root)
            .ok_or_else(|| EdgeError::missing_codec(root_id, "descriptor sequence built no codec"))?;

        let mut codecs = self.codecs.write();
        for (id, codec) in staged {
            codecs.entry(id).or_insert(codec);
        }
        Ok(Arc::clone(codecs.entry(root_id).or_insert(root)))
    }

    /// Specialize `codec` for `host`; see [`crate::binary::visitor`].
    pub fn specialize(&self, codec: &CodecRef, host: &HostType) -> Result<CodecRef> {
        super::visitor::specialize(self, codec, host)
    }
}

/// Codec built for a well-known scalar: a broker when the registry knows
/// other host forms for it.
pub fn scalar_codec(kind: ScalarKind, metadata: Option<CodecMetadata>) -> CodecRef {
    let scalar = ScalarCodec { kind, metadata };
    Arc::new(if complex::has_converters(kind) {
        Codec::Complex(complex::ComplexCodec::new(scalar))
    } else {
        Codec::Scalar(scalar)
    })
}

fn child(slots: &[Slot], pos: TypePos) -> Result<CodecRef> {
    match slots.get(pos as usize) {
        Some(Slot {
            codec: Some(codec), ..
        }) => Ok(Arc::clone(codec)),
        Some(Slot { id, .. }) => Err(EdgeError::Internal(format!(
            "descriptor position {} ({}) has no codec",
            pos, id
        ))),
        None => Err(EdgeError::Internal(format!(
            "descriptor position {} referenced before it was built ({} built)",
            pos,
            slots.len()
        ))),
    }
}

fn children(slots: &[Slot], positions: impl IntoIterator<Item = TypePos>) -> Result<Vec<CodecRef>> {
    positions.into_iter().map(|pos| child(slots, pos)).collect()
}

fn convert_metadata(meta: &DescriptorMetadata, slots: &[Slot]) -> CodecMetadata {
    CodecMetadata {
        name: Some(meta.name.clone()),
        schema_defined: meta.schema_defined,
        ancestors: meta
            .ancestors
            .iter()
            .filter_map(|pos| slots.get(*pos as usize).map(|s| s.id))
            .collect(),
    }
}

fn slot_metadata(descriptor: &TypeDescriptor, slots: &[Slot]) -> Option<CodecMetadata> {
    match descriptor {
        TypeDescriptor::Scalar { metadata, .. }
        | TypeDescriptor::Tuple { metadata, .. }
        | TypeDescriptor::NamedTuple { metadata, .. }
        | TypeDescriptor::Array { metadata, .. }
        | TypeDescriptor::Enumeration { metadata, .. }
        | TypeDescriptor::Range { metadata, .. }
        | TypeDescriptor::MultiRange { metadata, .. } => {
            metadata.as_ref().map(|m| convert_metadata(m, slots))
        }
        TypeDescriptor::Object {
            name,
            schema_defined,
            ..
        }
        | TypeDescriptor::Compound {
            name,
            schema_defined,
            ..
        } => Some(CodecMetadata::named(name.clone(), *schema_defined)),
        _ => None,
    }
}

/// Build the codec for one descriptor. `Ok(None)` for descriptors that only
/// carry metadata.
fn build_one(
    descriptor: &TypeDescriptor,
    slots: &[Slot],
    metadata: Option<CodecMetadata>,
) -> Result<Option<CodecRef>> {
    let codec = match descriptor {
        TypeDescriptor::BaseScalar { id } => {
            let kind = ScalarKind::from_id(id)
                .ok_or_else(|| EdgeError::missing_codec(*id, "unknown base scalar"))?;
            scalar_codec(kind, None)
        }
        TypeDescriptor::Scalar {
            id,
            base_type_pos,
            metadata: descriptor_meta,
        } => {
            if let Some(kind) = ScalarKind::from_id(id) {
                scalar_codec(kind, metadata)
            } else if let Some(pos) = base_type_pos {
                child(slots, *pos)?
            } else if let Some(base) = descriptor_meta.as_ref().and_then(|m| m.ancestors.last()) {
                child(slots, *base)?
            } else {
                return Err(EdgeError::missing_codec(*id, "scalar has no known base type"));
            }
        }
        TypeDescriptor::ObjectShape {
            id,
            ephemeral_free,
            type_pos,
            elements,
        } => {
            let object_meta = match type_pos {
                Some(pos) if !ephemeral_free => slots.get(*pos as usize).and_then(|s| s.metadata.clone()),
                _ => None,
            };
            let names = elements.iter().map(|e| e.name.clone()).collect();
            let codecs = children(slots, elements.iter().map(|e| e.type_pos))?;
            Arc::new(Codec::Object(ObjectCodec::new(*id, names, codecs, object_meta)?))
        }
        TypeDescriptor::NamedTuple { id, elements, .. } => {
            let names = elements.iter().map(|e| e.name.clone()).collect();
            let codecs = children(slots, elements.iter().map(|e| e.type_pos))?;
            Arc::new(Codec::Object(ObjectCodec::new(*id, names, codecs, metadata)?))
        }
        TypeDescriptor::InputShape { id, elements } => {
            let names = elements.iter().map(|e| e.name.clone()).collect();
            let codecs = children(slots, elements.iter().map(|e| e.type_pos))?;
            Arc::new(Codec::SparseObject(SparseObjectCodec::new(*id, names, codecs)))
        }
        TypeDescriptor::Tuple { id, elements, .. } => {
            let codecs = children(slots, elements.iter().copied())?;
            Arc::new(Codec::Tuple(TupleCodec::new(*id, codecs, metadata)))
        }
        TypeDescriptor::Set { id, type_pos } => wrapping(*id, slots, *type_pos, CompilableKind::Set, metadata)?,
        TypeDescriptor::Array {
            id,
            type_pos,
            dimensions,
            ..
        } => wrapping(
            *id,
            slots,
            *type_pos,
            CompilableKind::Array {
                dimensions: dimensions.to_vec(),
            },
            metadata,
        )?,
        TypeDescriptor::Range { id, type_pos, .. } => {
            wrapping(*id, slots, *type_pos, CompilableKind::Range, metadata)?
        }
        TypeDescriptor::MultiRange { id, type_pos, .. } => {
            wrapping(*id, slots, *type_pos, CompilableKind::MultiRange, metadata)?
        }
        TypeDescriptor::Enumeration { id, members, .. } => Arc::new(Codec::Enum(EnumCodec {
            id: *id,
            members: members.clone(),
            metadata,
        })),
        TypeDescriptor::Compound {
            id,
            operation,
            components,
            ..
        } => {
            // Components naming plain object types carry no codec of their own
            let mut codecs = Vec::with_capacity(components.len());
            for pos in components {
                match slots.get(*pos as usize) {
                    Some(slot) => codecs.extend(slot.codec.clone()),
                    None => {
                        return Err(EdgeError::Internal(format!(
                            "compound component position {} out of range",
                            pos
                        )))
                    }
                }
            }
            Arc::new(Codec::Compound(CompoundCodec::new(*id, *operation, codecs, metadata)))
        }
        TypeDescriptor::Object { .. }
        | TypeDescriptor::TypeAnnotation { .. }
        | TypeDescriptor::TypeAnnotationText { .. } => return Ok(None),
    };
    Ok(Some(codec))
}

fn wrapping(
    id: Uuid,
    slots: &[Slot],
    type_pos: TypePos,
    kind: CompilableKind,
    metadata: Option<CodecMetadata>,
) -> Result<CodecRef> {
    let inner = child(slots, type_pos)?;
    Ok(Arc::new(Codec::Compilable(CompilableCodec::new(id, inner, kind, metadata))))
}
