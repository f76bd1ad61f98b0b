//! Type descriptor decoding.
//!
//! A CommandDataDescription carries a flat list of descriptors. Each one
//! declares a single type and refers to earlier descriptors by position.
//! Two layouts exist:
//! - legacy (protocol 1.x): descriptors follow each other with no framing
//! - current (protocol 2.x): each descriptor is prefixed with its u32 length
//!   and carries schema name / ancestor metadata
//!
//! Both decoders stop only at the end of the buffer. An unknown tag or a
//! descriptor running past its bounds is a protocol violation.

use smallvec::SmallVec;
use uuid::Uuid;

use super::buffer::BufferContract;
use super::protocol::ProtocolVersion;
use crate::error::{EdgeError, Result};

/// Position of a descriptor within its sequence.
pub type TypePos = u16;

/// Positions of child descriptors, usually a handful.
pub type TypePositions = SmallVec<[TypePos; 4]>;

/// Schema metadata carried by current-dialect descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorMetadata {
    pub name: String,
    pub schema_defined: bool,
    pub ancestors: TypePositions,
}

/// Element of an object output shape or input shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeElement {
    pub flags: u32,
    pub cardinality: u8,
    pub name: String,
    pub type_pos: TypePos,
    /// Object type the pointer is defined on (current dialect only).
    pub source_type: Option<TypePos>,
}

impl ShapeElement {
    pub const FLAG_IMPLICIT: u32 = 1 << 0;
    pub const FLAG_LINK_PROPERTY: u32 = 1 << 1;
    pub const FLAG_LINK: u32 = 1 << 2;

    pub fn is_implicit(&self) -> bool {
        self.flags & Self::FLAG_IMPLICIT != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleElement {
    pub name: String,
    pub type_pos: TypePos,
}

/// Union or intersection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompoundOperation {
    Union,
    Intersection,
}

impl TryFrom<u8> for CompoundOperation {
    type Error = EdgeError;

    fn try_from(b: u8) -> Result<Self> {
        match b {
            1 => Ok(CompoundOperation::Union),
            2 => Ok(CompoundOperation::Intersection),
            other => Err(EdgeError::protocol(format!("unknown compound operation {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeDescriptor {
    Set {
        id: Uuid,
        type_pos: TypePos,
    },
    ObjectShape {
        id: Uuid,
        ephemeral_free: bool,
        type_pos: Option<TypePos>,
        elements: Vec<ShapeElement>,
    },
    BaseScalar {
        id: Uuid,
    },
    Scalar {
        id: Uuid,
        /// Legacy dialect: position of the base scalar.
        base_type_pos: Option<TypePos>,
        metadata: Option<DescriptorMetadata>,
    },
    Tuple {
        id: Uuid,
        metadata: Option<DescriptorMetadata>,
        elements: TypePositions,
    },
    NamedTuple {
        id: Uuid,
        metadata: Option<DescriptorMetadata>,
        elements: Vec<TupleElement>,
    },
    Array {
        id: Uuid,
        metadata: Option<DescriptorMetadata>,
        type_pos: TypePos,
        dimensions: SmallVec<[i32; 1]>,
    },
    Enumeration {
        id: Uuid,
        metadata: Option<DescriptorMetadata>,
        members: Vec<String>,
    },
    InputShape {
        id: Uuid,
        elements: Vec<ShapeElement>,
    },
    Range {
        id: Uuid,
        metadata: Option<DescriptorMetadata>,
        type_pos: TypePos,
    },
    MultiRange {
        id: Uuid,
        metadata: Option<DescriptorMetadata>,
        type_pos: TypePos,
    },
    /// Named object type; provides metadata for shapes, builds no codec.
    Object {
        id: Uuid,
        name: String,
        schema_defined: bool,
    },
    Compound {
        id: Uuid,
        name: String,
        schema_defined: bool,
        operation: CompoundOperation,
        components: TypePositions,
    },
    /// Legacy annotation (tags 0x80..=0xff) attached to an already-described id.
    TypeAnnotation {
        tag: u8,
        id: Uuid,
        annotation: String,
    },
    /// Current-dialect annotation of the descriptor at `descriptor`.
    TypeAnnotationText {
        descriptor: TypePos,
        key: String,
        value: String,
    },
}

impl TypeDescriptor {
    /// Type id, absent only for annotation text.
    pub fn id(&self) -> Option<Uuid> {
        match self {
            TypeDescriptor::Set { id, .. }
            | TypeDescriptor::ObjectShape { id, .. }
            | TypeDescriptor::BaseScalar { id }
            | TypeDescriptor::Scalar { id, .. }
            | TypeDescriptor::Tuple { id, .. }
            | TypeDescriptor::NamedTuple { id, .. }
            | TypeDescriptor::Array { id, .. }
            | TypeDescriptor::Enumeration { id, .. }
            | TypeDescriptor::InputShape { id, .. }
            | TypeDescriptor::Range { id, .. }
            | TypeDescriptor::MultiRange { id, .. }
            | TypeDescriptor::Object { id, .. }
            | TypeDescriptor::Compound { id, .. }
            | TypeDescriptor::TypeAnnotation { id, .. } => Some(*id),
            TypeDescriptor::TypeAnnotationText { .. } => None,
        }
    }

    /// Whether this descriptor is counted when resolving positions.
    pub fn occupies_position(&self) -> bool {
        !matches!(self, TypeDescriptor::TypeAnnotationText { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TypeDescriptor::Set { .. } => "set",
            TypeDescriptor::ObjectShape { .. } => "object shape",
            TypeDescriptor::BaseScalar { .. } => "base scalar",
            TypeDescriptor::Scalar { .. } => "scalar",
            TypeDescriptor::Tuple { .. } => "tuple",
            TypeDescriptor::NamedTuple { .. } => "named tuple",
            TypeDescriptor::Array { .. } => "array",
            TypeDescriptor::Enumeration { .. } => "enumeration",
            TypeDescriptor::InputShape { .. } => "input shape",
            TypeDescriptor::Range { .. } => "range",
            TypeDescriptor::MultiRange { .. } => "multirange",
            TypeDescriptor::Object { .. } => "object",
            TypeDescriptor::Compound { .. } => "compound",
            TypeDescriptor::TypeAnnotation { .. } => "type annotation",
            TypeDescriptor::TypeAnnotationText { .. } => "type annotation text",
        }
    }
}

/// Decode a whole descriptor sequence with the layout of `version`.
pub fn decode_descriptors(
    version: ProtocolVersion,
    buf: &mut BufferContract<'_>,
) -> Result<Vec<TypeDescriptor>> {
    let mut descriptors = Vec::new();
    while !buf.is_exhausted() {
        let descriptor = if version.is_legacy() {
            decode_legacy(buf)
        } else {
            decode_current(buf)
        };
        match descriptor {
            Ok(d) => descriptors.push(d),
            Err(e) => {
                tracing::warn!(
                    %version,
                    index = descriptors.len(),
                    position = buf.position(),
                    error = %e,
                    "failed to decode type descriptor"
                );
                return Err(e);
            }
        }
    }
    Ok(descriptors)
}

/// Decode descriptors from raw bytes.
pub fn decode_descriptor_bytes(version: ProtocolVersion, data: &[u8]) -> Result<Vec<TypeDescriptor>> {
    let mut buf = BufferContract::new(data);
    decode_descriptors(version, &mut buf)
}

// ============================================================================
// Legacy dialect
// ============================================================================

fn decode_legacy(buf: &mut BufferContract<'_>) -> Result<TypeDescriptor> {
    let tag = buf.read_u8()?;
    let id = buf.read_uuid()?;

    Ok(match tag {
        0 => TypeDescriptor::Set {
            id,
            type_pos: buf.read_u16()?,
        },
        1 => TypeDescriptor::ObjectShape {
            id,
            ephemeral_free: false,
            type_pos: None,
            elements: read_shape_elements(buf, false)?,
        },
        2 => TypeDescriptor::BaseScalar { id },
        3 => TypeDescriptor::Scalar {
            id,
            base_type_pos: Some(buf.read_u16()?),
            metadata: None,
        },
        4 => TypeDescriptor::Tuple {
            id,
            metadata: None,
            elements: read_positions(buf)?,
        },
        5 => TypeDescriptor::NamedTuple {
            id,
            metadata: None,
            elements: read_tuple_elements(buf)?,
        },
        6 => {
            let type_pos = buf.read_u16()?;
            TypeDescriptor::Array {
                id,
                metadata: None,
                type_pos,
                dimensions: read_dimensions(buf)?,
            }
        }
        7 => TypeDescriptor::Enumeration {
            id,
            metadata: None,
            members: read_strings(buf)?,
        },
        8 => TypeDescriptor::InputShape {
            id,
            elements: read_shape_elements(buf, false)?,
        },
        9 => TypeDescriptor::Range {
            id,
            metadata: None,
            type_pos: buf.read_u16()?,
        },
        0x80..=0xff => TypeDescriptor::TypeAnnotation {
            tag,
            id,
            annotation: buf.read_string()?,
        },
        other => {
            return Err(EdgeError::protocol(format!(
                "No descriptor found for type 0x{:02x}",
                other
            )))
        }
    })
}

// ============================================================================
// Current dialect
// ============================================================================

fn decode_current(buf: &mut BufferContract<'_>) -> Result<TypeDescriptor> {
    let len = buf.read_u32()? as usize;
    let mut body = buf.reserve(len)?;
    let descriptor = decode_current_body(&mut body)?;
    body.ensure_exhausted(descriptor.kind())?;
    Ok(descriptor)
}

fn decode_current_body(buf: &mut BufferContract<'_>) -> Result<TypeDescriptor> {
    let tag = buf.read_u8()?;

    if tag == 0x7f {
        return Ok(TypeDescriptor::TypeAnnotationText {
            descriptor: buf.read_u16()?,
            key: buf.read_string()?,
            value: buf.read_string()?,
        });
    }

    let id = buf.read_uuid()?;

    Ok(match tag {
        0 => TypeDescriptor::Set {
            id,
            type_pos: buf.read_u16()?,
        },
        1 => {
            let ephemeral_free = buf.read_bool()?;
            let type_pos = buf.read_u16()?;
            TypeDescriptor::ObjectShape {
                id,
                ephemeral_free,
                type_pos: Some(type_pos),
                elements: read_shape_elements(buf, true)?,
            }
        }
        3 => TypeDescriptor::Scalar {
            id,
            base_type_pos: None,
            metadata: Some(read_metadata(buf)?),
        },
        4 => {
            let metadata = read_metadata(buf)?;
            TypeDescriptor::Tuple {
                id,
                metadata: Some(metadata),
                elements: read_positions(buf)?,
            }
        }
        5 => {
            let metadata = read_metadata(buf)?;
            TypeDescriptor::NamedTuple {
                id,
                metadata: Some(metadata),
                elements: read_tuple_elements(buf)?,
            }
        }
        6 => {
            let metadata = read_metadata(buf)?;
            let type_pos = buf.read_u16()?;
            TypeDescriptor::Array {
                id,
                metadata: Some(metadata),
                type_pos,
                dimensions: read_dimensions(buf)?,
            }
        }
        7 => {
            let metadata = read_metadata(buf)?;
            TypeDescriptor::Enumeration {
                id,
                metadata: Some(metadata),
                members: read_strings(buf)?,
            }
        }
        8 => TypeDescriptor::InputShape {
            id,
            elements: read_shape_elements(buf, false)?,
        },
        9 => {
            let metadata = read_metadata(buf)?;
            TypeDescriptor::Range {
                id,
                metadata: Some(metadata),
                type_pos: buf.read_u16()?,
            }
        }
        10 => TypeDescriptor::Object {
            id,
            name: buf.read_string()?,
            schema_defined: buf.read_bool()?,
        },
        11 => {
            let name = buf.read_string()?;
            let schema_defined = buf.read_bool()?;
            let operation = CompoundOperation::try_from(buf.read_u8()?)?;
            TypeDescriptor::Compound {
                id,
                name,
                schema_defined,
                operation,
                components: read_positions(buf)?,
            }
        }
        12 => {
            let metadata = read_metadata(buf)?;
            TypeDescriptor::MultiRange {
                id,
                metadata: Some(metadata),
                type_pos: buf.read_u16()?,
            }
        }
        other => {
            return Err(EdgeError::protocol(format!(
                "No descriptor found for type 0x{:02x}",
                other
            )))
        }
    })
}

// ============================================================================
// Helper Functions
// ============================================================================

fn read_metadata(buf: &mut BufferContract<'_>) -> Result<DescriptorMetadata> {
    Ok(DescriptorMetadata {
        name: buf.read_string()?,
        schema_defined: buf.read_bool()?,
        ancestors: read_positions(buf)?,
    })
}

fn read_positions(buf: &mut BufferContract<'_>) -> Result<TypePositions> {
    let count = buf.read_u16()?;
    let mut positions = TypePositions::with_capacity(count as usize);
    for _ in 0..count {
        positions.push(buf.read_u16()?);
    }
    Ok(positions)
}

fn read_dimensions(buf: &mut BufferContract<'_>) -> Result<SmallVec<[i32; 1]>> {
    let count = buf.read_u16()?;
    let mut dims = SmallVec::with_capacity(count as usize);
    for _ in 0..count {
        dims.push(buf.read_i32()?);
    }
    Ok(dims)
}

fn read_strings(buf: &mut BufferContract<'_>) -> Result<Vec<String>> {
    let count = buf.read_u16()?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push(buf.read_string()?);
    }
    Ok(out)
}

fn read_tuple_elements(buf: &mut BufferContract<'_>) -> Result<Vec<TupleElement>> {
    let count = buf.read_u16()?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push(TupleElement {
            name: buf.read_string()?,
            type_pos: buf.read_u16()?,
        });
    }
    Ok(out)
}

fn read_shape_elements(buf: &mut BufferContract<'_>, with_source: bool) -> Result<Vec<ShapeElement>> {
    let count = buf.read_u16()?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let flags = buf.read_u32()?;
        let cardinality = buf.read_u8()?;
        let name = buf.read_string()?;
        let type_pos = buf.read_u16()?;
        let source_type = if with_source {
            Some(buf.read_u16()?)
        } else {
            None
        };
        out.push(ShapeElement {
            flags,
            cardinality,
            name,
            type_pos,
            source_type,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::codecs::scalar::well_known;

    fn legacy_base_scalar(buf: &mut Vec<u8>, id: Uuid) {
        buf.push(2);
        buf.extend_from_slice(id.as_bytes());
    }

    #[test]
    fn test_legacy_tuple_sequence() {
        let mut data = Vec::new();
        legacy_base_scalar(&mut data, well_known::INT64);
        legacy_base_scalar(&mut data, well_known::STR);
        data.push(4);
        data.extend_from_slice(&[0x11; 16]);
        data.extend_from_slice(&2u16.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());
        data.extend_from_slice(&1u16.to_be_bytes());

        let descriptors = decode_descriptor_bytes(ProtocolVersion::V1_0, &data).unwrap();
        assert_eq!(descriptors.len(), 3);
        assert_eq!(
            descriptors[2],
            TypeDescriptor::Tuple {
                id: Uuid::from_bytes([0x11; 16]),
                metadata: None,
                elements: TypePositions::from_slice(&[0, 1]),
            }
        );
    }

    #[test]
    fn test_unknown_tag_is_protocol_violation() {
        let mut data = vec![0x42];
        data.extend_from_slice(&[0; 16]);
        let err = decode_descriptor_bytes(ProtocolVersion::V1_0, &data).unwrap_err();
        assert!(matches!(err, EdgeError::ProtocolViolation(_)));
    }

    #[test]
    fn test_truncated_descriptor_is_protocol_violation() {
        // Set descriptor missing its type position
        let mut data = vec![0];
        data.extend_from_slice(&[0; 16]);
        data.push(0);
        let err = decode_descriptor_bytes(ProtocolVersion::V1_0, &data).unwrap_err();
        assert!(matches!(err, EdgeError::ProtocolViolation(_)));
    }

    #[test]
    fn test_current_scalar_with_metadata() {
        let mut body = vec![3];
        body.extend_from_slice(well_known::STR.as_bytes());
        body.extend_from_slice(&7u32.to_be_bytes());
        body.extend_from_slice(b"std::str");
        body.push(1);
        body.extend_from_slice(&0u16.to_be_bytes());

        let mut data = (body.len() as u32).to_be_bytes().to_vec();
        data.extend_from_slice(&body);

        let err = decode_descriptor_bytes(ProtocolVersion::V2_0, &data).unwrap_err();
        // Name length says 7 but "std::str" is 8 bytes, so the flag byte is misread
        assert!(matches!(err, EdgeError::ProtocolViolation(_)));

        body[17..21].copy_from_slice(&8u32.to_be_bytes());
        let mut data = (body.len() as u32).to_be_bytes().to_vec();
        data.extend_from_slice(&body);
        let descriptors = decode_descriptor_bytes(ProtocolVersion::V2_0, &data).unwrap();
        match &descriptors[0] {
            TypeDescriptor::Scalar { metadata: Some(meta), .. } => {
                assert_eq!(meta.name, "std::str");
                assert!(meta.schema_defined);
                assert!(meta.ancestors.is_empty());
            }
            other => panic!("unexpected descriptor {:?}", other),
        }
    }

    #[test]
    fn test_current_length_prefix_bounds_descriptor() {
        // Length prefix claims more bytes than the buffer holds
        let mut data = 40u32.to_be_bytes().to_vec();
        data.push(0);
        data.extend_from_slice(&[0; 16]);
        let err = decode_descriptor_bytes(ProtocolVersion::V2_0, &data).unwrap_err();
        assert!(matches!(err, EdgeError::ProtocolViolation(_)));
    }
}
