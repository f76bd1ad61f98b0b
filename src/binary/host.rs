//! Host type descriptions used to specialize codecs.
//!
//! A [`HostType`] names the representation a caller wants a value decoded
//! into. Object shapes carry a precomputed name -> slot table so field
//! resolution during specialization is a hash lookup.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use uuid::Uuid;

use super::types::{ConfigMemory, DateDuration, Decimal, Duration, Json, RelativeDuration};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HostType {
    /// Skip the value entirely.
    Ignore,
    /// Whatever the codec produces natively.
    Dynamic,

    Bool,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Str,
    Bytes,
    Uuid,
    Json,
    Decimal,
    BigInt,
    Datetime,
    LocalDatetime,
    LocalDate,
    LocalTime,
    Duration,
    RelativeDuration,
    DateDuration,
    ConfigMemory,
    Enum,
    SystemTime,
    StdDuration,
    JsonValue,

    Optional(Box<HostType>),
    Array(Box<HostType>),
    Set(Box<HostType>),
    Range(Box<HostType>),
    MultiRange(Box<HostType>),
    Tuple(Vec<HostType>),
    Object(Arc<HostShape>),
}

impl HostType {
    /// Strip any `Optional` wrappers.
    pub fn unwrap_optional(&self) -> &HostType {
        let mut ty = self;
        while let HostType::Optional(inner) = ty {
            ty = inner;
        }
        ty
    }

    /// Element type of a collection host type; `Dynamic` for anything else.
    pub fn element_type(&self) -> HostType {
        match self.unwrap_optional() {
            HostType::Array(inner)
            | HostType::Set(inner)
            | HostType::Range(inner)
            | HostType::MultiRange(inner) => (**inner).clone(),
            _ => HostType::Dynamic,
        }
    }

    pub fn is_ignore(&self) -> bool {
        matches!(self.unwrap_optional(), HostType::Ignore)
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self.unwrap_optional(), HostType::Dynamic)
    }

    pub fn object(shape: HostShape) -> Self {
        HostType::Object(Arc::new(shape))
    }
}

impl fmt::Display for HostType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostType::Optional(inner) => write!(f, "Option<{}>", inner),
            HostType::Array(inner) => write!(f, "Vec<{}>", inner),
            HostType::Set(inner) => write!(f, "Set<{}>", inner),
            HostType::Range(inner) => write!(f, "Range<{}>", inner),
            HostType::MultiRange(inner) => write!(f, "MultiRange<{}>", inner),
            HostType::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            HostType::Object(shape) => write!(f, "{}", shape.name),
            other => write!(f, "{:?}", other),
        }
    }
}

/// One declared field of a host object shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostField {
    pub name: String,
    pub ty: HostType,
}

/// Named object shape with a name -> slot table built once.
#[derive(Debug, Clone)]
pub struct HostShape {
    pub name: String,
    fields: Vec<HostField>,
    slots: HashMap<String, usize>,
}

impl HostShape {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            slots: HashMap::new(),
        }
    }

    /// Add a field. Redeclaring a name replaces its type.
    pub fn field(mut self, name: impl Into<String>, ty: HostType) -> Self {
        let name = name.into();
        match self.slots.get(&name) {
            Some(&slot) => self.fields[slot].ty = ty,
            None => {
                self.slots.insert(name.clone(), self.fields.len());
                self.fields.push(HostField { name, ty });
            }
        }
        self
    }

    pub fn fields(&self) -> &[HostField] {
        &self.fields
    }

    /// Slot and declared type of a field.
    pub fn lookup(&self, name: &str) -> Option<(usize, &HostType)> {
        self.slots
            .get(name)
            .map(|&slot| (slot, &self.fields[slot].ty))
    }
}

impl PartialEq for HostShape {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.fields == other.fields
    }
}

impl Eq for HostShape {}

impl Hash for HostShape {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.fields.hash(state);
    }
}

// ============================================================================
// Rust type -> HostType
// ============================================================================

/// Rust types with a known host representation.
pub trait HostTyped {
    fn host_type() -> HostType;
}

macro_rules! host_typed {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl HostTyped for $ty {
                fn host_type() -> HostType {
                    HostType::$variant
                }
            }
        )*
    };
}

host_typed! {
    () => Ignore,
    bool => Bool,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    f32 => Float32,
    f64 => Float64,
    String => Str,
    bytes::Bytes => Bytes,
    Uuid => Uuid,
    Json => Json,
    Decimal => Decimal,
    DateTime<Utc> => Datetime,
    NaiveDateTime => LocalDatetime,
    NaiveDate => LocalDate,
    NaiveTime => LocalTime,
    Duration => Duration,
    RelativeDuration => RelativeDuration,
    DateDuration => DateDuration,
    ConfigMemory => ConfigMemory,
    SystemTime => SystemTime,
    std::time::Duration => StdDuration,
    serde_json::Value => JsonValue,
}

impl<T: HostTyped> HostTyped for Option<T> {
    fn host_type() -> HostType {
        HostType::Optional(Box::new(T::host_type()))
    }
}

impl<T: HostTyped> HostTyped for Vec<T> {
    fn host_type() -> HostType {
        HostType::Array(Box::new(T::host_type()))
    }
}

macro_rules! host_typed_tuple {
    ($($name:ident),+) => {
        impl<$($name: HostTyped),+> HostTyped for ($($name,)+) {
            fn host_type() -> HostType {
                HostType::Tuple(vec![$($name::host_type()),+])
            }
        }
    };
}

host_typed_tuple!(A);
host_typed_tuple!(A, B);
host_typed_tuple!(A, B, C);
host_typed_tuple!(A, B, C, D);
