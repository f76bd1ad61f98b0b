//! Scalar codecs for the server's built-in types.
//!
//! Each built-in scalar has a fixed, well-known type id. The codec for a
//! scalar is stateless, so one instance per kind is shared by every tree.

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use super::{numeric, temporal, CodecMetadata};
use crate::binary::buffer::BufferContract;
use crate::binary::host::HostType;
use crate::binary::types::{ConfigMemory, Json, Value};
use crate::error::{EdgeError, Result};

/// Type ids of the built-in scalars.
pub mod well_known {
    use uuid::Uuid;

    const fn std_id(low: u16) -> Uuid {
        let b = low.to_be_bytes();
        Uuid::from_bytes([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, b[0], b[1]])
    }

    pub const UUID: Uuid = std_id(0x100);
    pub const STR: Uuid = std_id(0x101);
    pub const BYTES: Uuid = std_id(0x102);
    pub const INT16: Uuid = std_id(0x103);
    pub const INT32: Uuid = std_id(0x104);
    pub const INT64: Uuid = std_id(0x105);
    pub const FLOAT32: Uuid = std_id(0x106);
    pub const FLOAT64: Uuid = std_id(0x107);
    pub const DECIMAL: Uuid = std_id(0x108);
    pub const BOOL: Uuid = std_id(0x109);
    pub const DATETIME: Uuid = std_id(0x10a);
    pub const LOCAL_DATETIME: Uuid = std_id(0x10b);
    pub const LOCAL_DATE: Uuid = std_id(0x10c);
    pub const LOCAL_TIME: Uuid = std_id(0x10d);
    pub const DURATION: Uuid = std_id(0x10e);
    pub const JSON: Uuid = std_id(0x10f);
    pub const BIGINT: Uuid = std_id(0x110);
    pub const RELATIVE_DURATION: Uuid = std_id(0x111);
    pub const DATE_DURATION: Uuid = std_id(0x112);
    pub const CONFIG_MEMORY: Uuid = std_id(0x130);
}

/// JSON payload format marker.
const JSON_FORMAT: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Uuid,
    Str,
    Bytes,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Decimal,
    Bool,
    Datetime,
    LocalDatetime,
    LocalDate,
    LocalTime,
    Duration,
    Json,
    BigInt,
    RelativeDuration,
    DateDuration,
    ConfigMemory,
}

impl ScalarKind {
    pub const ALL: [ScalarKind; 20] = [
        ScalarKind::Uuid,
        ScalarKind::Str,
        ScalarKind::Bytes,
        ScalarKind::Int16,
        ScalarKind::Int32,
        ScalarKind::Int64,
        ScalarKind::Float32,
        ScalarKind::Float64,
        ScalarKind::Decimal,
        ScalarKind::Bool,
        ScalarKind::Datetime,
        ScalarKind::LocalDatetime,
        ScalarKind::LocalDate,
        ScalarKind::LocalTime,
        ScalarKind::Duration,
        ScalarKind::Json,
        ScalarKind::BigInt,
        ScalarKind::RelativeDuration,
        ScalarKind::DateDuration,
        ScalarKind::ConfigMemory,
    ];

    pub fn id(self) -> Uuid {
        match self {
            ScalarKind::Uuid => well_known::UUID,
            ScalarKind::Str => well_known::STR,
            ScalarKind::Bytes => well_known::BYTES,
            ScalarKind::Int16 => well_known::INT16,
            ScalarKind::Int32 => well_known::INT32,
            ScalarKind::Int64 => well_known::INT64,
            ScalarKind::Float32 => well_known::FLOAT32,
            ScalarKind::Float64 => well_known::FLOAT64,
            ScalarKind::Decimal => well_known::DECIMAL,
            ScalarKind::Bool => well_known::BOOL,
            ScalarKind::Datetime => well_known::DATETIME,
            ScalarKind::LocalDatetime => well_known::LOCAL_DATETIME,
            ScalarKind::LocalDate => well_known::LOCAL_DATE,
            ScalarKind::LocalTime => well_known::LOCAL_TIME,
            ScalarKind::Duration => well_known::DURATION,
            ScalarKind::Json => well_known::JSON,
            ScalarKind::BigInt => well_known::BIGINT,
            ScalarKind::RelativeDuration => well_known::RELATIVE_DURATION,
            ScalarKind::DateDuration => well_known::DATE_DURATION,
            ScalarKind::ConfigMemory => well_known::CONFIG_MEMORY,
        }
    }

    pub fn from_id(id: &Uuid) -> Option<Self> {
        ScalarKind::ALL.iter().copied().find(|k| k.id() == *id)
    }

    /// Schema name of the scalar.
    pub fn name(self) -> &'static str {
        match self {
            ScalarKind::Uuid => "std::uuid",
            ScalarKind::Str => "std::str",
            ScalarKind::Bytes => "std::bytes",
            ScalarKind::Int16 => "std::int16",
            ScalarKind::Int32 => "std::int32",
            ScalarKind::Int64 => "std::int64",
            ScalarKind::Float32 => "std::float32",
            ScalarKind::Float64 => "std::float64",
            ScalarKind::Decimal => "std::decimal",
            ScalarKind::Bool => "std::bool",
            ScalarKind::Datetime => "std::datetime",
            ScalarKind::LocalDatetime => "cal::local_datetime",
            ScalarKind::LocalDate => "cal::local_date",
            ScalarKind::LocalTime => "cal::local_time",
            ScalarKind::Duration => "std::duration",
            ScalarKind::Json => "std::json",
            ScalarKind::BigInt => "std::bigint",
            ScalarKind::RelativeDuration => "cal::relative_duration",
            ScalarKind::DateDuration => "cal::date_duration",
            ScalarKind::ConfigMemory => "cfg::memory",
        }
    }

    /// Host type produced when no specialization is requested.
    pub fn native_host(self) -> HostType {
        match self {
            ScalarKind::Uuid => HostType::Uuid,
            ScalarKind::Str => HostType::Str,
            ScalarKind::Bytes => HostType::Bytes,
            ScalarKind::Int16 => HostType::Int16,
            ScalarKind::Int32 => HostType::Int32,
            ScalarKind::Int64 => HostType::Int64,
            ScalarKind::Float32 => HostType::Float32,
            ScalarKind::Float64 => HostType::Float64,
            ScalarKind::Decimal => HostType::Decimal,
            ScalarKind::Bool => HostType::Bool,
            ScalarKind::Datetime => HostType::Datetime,
            ScalarKind::LocalDatetime => HostType::LocalDatetime,
            ScalarKind::LocalDate => HostType::LocalDate,
            ScalarKind::LocalTime => HostType::LocalTime,
            ScalarKind::Duration => HostType::Duration,
            ScalarKind::Json => HostType::Json,
            ScalarKind::BigInt => HostType::BigInt,
            ScalarKind::RelativeDuration => HostType::RelativeDuration,
            ScalarKind::DateDuration => HostType::DateDuration,
            ScalarKind::ConfigMemory => HostType::ConfigMemory,
        }
    }

    /// Decode one value; the buffer holds exactly the scalar's payload.
    pub fn decode(self, buf: &mut BufferContract<'_>) -> Result<Value> {
        Ok(match self {
            ScalarKind::Uuid => Value::Uuid(buf.read_uuid()?),
            ScalarKind::Str => {
                let raw = buf.read_rest()?;
                Value::Str(
                    std::str::from_utf8(raw)
                        .map_err(|e| EdgeError::protocol(format!("invalid UTF-8 in str: {}", e)))?
                        .to_owned(),
                )
            }
            ScalarKind::Bytes => Value::Bytes(Bytes::copy_from_slice(buf.read_rest()?)),
            ScalarKind::Int16 => Value::Int16(buf.read_i16()?),
            ScalarKind::Int32 => Value::Int32(buf.read_i32()?),
            ScalarKind::Int64 => Value::Int64(buf.read_i64()?),
            ScalarKind::Float32 => Value::Float32(buf.read_f32()?),
            ScalarKind::Float64 => Value::Float64(buf.read_f64()?),
            ScalarKind::Decimal => Value::Decimal(numeric::decode(buf, false)?),
            ScalarKind::BigInt => Value::BigInt(numeric::decode(buf, true)?),
            ScalarKind::Bool => Value::Bool(buf.read_bool()?),
            ScalarKind::Datetime => Value::Datetime(temporal::datetime_from_micros(buf.read_i64()?)?),
            ScalarKind::LocalDatetime => {
                Value::LocalDatetime(temporal::local_datetime_from_micros(buf.read_i64()?)?)
            }
            ScalarKind::LocalDate => Value::LocalDate(temporal::local_date_from_days(buf.read_i32()?)?),
            ScalarKind::LocalTime => Value::LocalTime(temporal::local_time_from_micros(buf.read_i64()?)?),
            ScalarKind::Duration => Value::Duration(temporal::decode_duration(buf)?),
            ScalarKind::RelativeDuration => {
                Value::RelativeDuration(temporal::decode_relative_duration(buf)?)
            }
            ScalarKind::DateDuration => Value::DateDuration(temporal::decode_date_duration(buf)?),
            ScalarKind::Json => {
                let format = buf.read_u8()?;
                if format != JSON_FORMAT {
                    return Err(EdgeError::protocol(format!(
                        "unsupported json format {}",
                        format
                    )));
                }
                let raw = buf.read_rest()?;
                Value::Json(Json(
                    std::str::from_utf8(raw)
                        .map_err(|e| EdgeError::protocol(format!("invalid UTF-8 in json: {}", e)))?
                        .to_owned(),
                ))
            }
            ScalarKind::ConfigMemory => Value::ConfigMemory(ConfigMemory(buf.read_i64()?)),
        })
    }

    pub fn encode(self, buf: &mut BytesMut, value: &Value) -> Result<()> {
        match (self, value) {
            (ScalarKind::Uuid, Value::Uuid(v)) => buf.put_slice(v.as_bytes()),
            (ScalarKind::Str, Value::Str(s) | Value::Enum(s)) => buf.put_slice(s.as_bytes()),
            (ScalarKind::Bytes, Value::Bytes(b)) => buf.put_slice(b),
            (ScalarKind::Int16, v) => buf.put_i16(narrow(v, "int16")?),
            (ScalarKind::Int32, v) => buf.put_i32(narrow(v, "int32")?),
            (ScalarKind::Int64, v) => buf.put_i64(narrow(v, "int64")?),
            (ScalarKind::Float32, Value::Float32(v)) => buf.put_f32(*v),
            (ScalarKind::Float64, Value::Float64(v)) => buf.put_f64(*v),
            (ScalarKind::Float64, Value::Float32(v)) => buf.put_f64(*v as f64),
            (ScalarKind::Decimal, Value::Decimal(d)) => numeric::encode(buf, d, false)?,
            (ScalarKind::BigInt, Value::BigInt(d)) => numeric::encode(buf, d, true)?,
            (ScalarKind::Bool, Value::Bool(b)) => buf.put_u8(*b as u8),
            (ScalarKind::Datetime, Value::Datetime(dt)) => {
                buf.put_i64(temporal::datetime_to_micros(dt)?)
            }
            (ScalarKind::LocalDatetime, Value::LocalDatetime(dt)) => {
                buf.put_i64(temporal::local_datetime_to_micros(dt)?)
            }
            (ScalarKind::LocalDate, Value::LocalDate(d)) => buf.put_i32(temporal::local_date_to_days(d)?),
            (ScalarKind::LocalTime, Value::LocalTime(t)) => buf.put_i64(temporal::local_time_to_micros(t)),
            (ScalarKind::Duration, Value::Duration(d)) => temporal::encode_duration(buf, d),
            (ScalarKind::RelativeDuration, Value::RelativeDuration(d)) => {
                temporal::encode_relative_duration(buf, d)
            }
            (ScalarKind::DateDuration, Value::DateDuration(d)) => temporal::encode_date_duration(buf, d),
            (ScalarKind::Json, Value::Json(Json(text))) => {
                buf.put_u8(JSON_FORMAT);
                buf.put_slice(text.as_bytes());
            }
            (ScalarKind::ConfigMemory, Value::ConfigMemory(m)) => buf.put_i64(m.0),
            (kind, other) => return Err(other.mismatch(kind.name())),
        }
        Ok(())
    }
}

/// Integer encode accepting any integer variant that fits.
fn narrow<T: TryFrom<i64>>(value: &Value, target: &str) -> Result<T> {
    let wide = value.as_i64().ok_or_else(|| value.mismatch(target))?;
    T::try_from(wide)
        .map_err(|_| EdgeError::invalid_value(format!("{} is out of range for {}", wide, target)))
}

/// Codec for one built-in scalar.
#[derive(Debug, Clone)]
pub struct ScalarCodec {
    pub kind: ScalarKind,
    pub metadata: Option<CodecMetadata>,
}

impl ScalarCodec {
    pub fn new(kind: ScalarKind) -> Self {
        Self {
            kind,
            metadata: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.kind.id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(kind: ScalarKind, value: Value) {
        let mut buf = BytesMut::new();
        kind.encode(&mut buf, &value).unwrap();
        let mut contract = BufferContract::new(&buf);
        let decoded = kind.decode(&mut contract).unwrap();
        assert!(contract.is_exhausted(), "{:?} left bytes", kind);
        assert_eq!(decoded, value, "roundtrip of {:?}", kind);
    }

    #[test]
    fn test_integer_boundaries() {
        for v in [0i16, -1, i16::MIN, i16::MAX] {
            roundtrip(ScalarKind::Int16, Value::Int16(v));
        }
        for v in [0i32, -1, i32::MIN, i32::MAX] {
            roundtrip(ScalarKind::Int32, Value::Int32(v));
        }
        for v in [0i64, -1, i64::MIN, i64::MAX] {
            roundtrip(ScalarKind::Int64, Value::Int64(v));
        }
    }

    #[test]
    fn test_negative_one_is_big_endian_twos_complement() {
        let mut buf = BytesMut::new();
        ScalarKind::Int32.encode(&mut buf, &Value::Int32(-1)).unwrap();
        assert_eq!(&buf[..], &[0xff, 0xff, 0xff, 0xff]);

        let mut buf = BytesMut::new();
        ScalarKind::Int64.encode(&mut buf, &Value::Int32(-1)).unwrap();
        assert_eq!(&buf[..], &[0xff; 8]);
        let decoded = ScalarKind::Int64.decode(&mut BufferContract::new(&buf)).unwrap();
        assert_eq!(decoded, Value::Int64(-1));
    }

    #[test]
    fn test_text_and_bytes_boundaries() {
        roundtrip(ScalarKind::Str, Value::Str(String::new()));
        roundtrip(ScalarKind::Str, Value::Str("héllo ✓".to_string()));
        roundtrip(ScalarKind::Bytes, Value::Bytes(Bytes::new()));
        roundtrip(ScalarKind::Bytes, Value::Bytes(Bytes::from_static(&[0, 255, 7])));
        roundtrip(ScalarKind::Uuid, Value::Uuid(Uuid::nil()));
        roundtrip(ScalarKind::Uuid, Value::Uuid(Uuid::from_bytes([0xff; 16])));
        roundtrip(ScalarKind::Bool, Value::Bool(true));
        roundtrip(ScalarKind::Bool, Value::Bool(false));
    }

    #[test]
    fn test_floats_json_and_memory() {
        roundtrip(ScalarKind::Float32, Value::Float32(-0.5));
        roundtrip(ScalarKind::Float64, Value::Float64(f64::MAX));
        roundtrip(ScalarKind::Float64, Value::Float64(0.0));
        roundtrip(ScalarKind::Json, Value::Json(Json("{\"a\": [1, 2]}".to_string())));
        roundtrip(ScalarKind::ConfigMemory, Value::ConfigMemory(ConfigMemory(i64::MIN)));

        let mut buf = BytesMut::new();
        ScalarKind::Json
            .encode(&mut buf, &Value::Json(Json("null".to_string())))
            .unwrap();
        assert_eq!(buf[0], 1);
    }

    #[test]
    fn test_out_of_range_and_mismatch() {
        let mut buf = BytesMut::new();
        assert!(matches!(
            ScalarKind::Int16.encode(&mut buf, &Value::Int64(70_000)),
            Err(EdgeError::InvalidValue(_))
        ));
        assert!(matches!(
            ScalarKind::Str.encode(&mut buf, &Value::Int64(1)),
            Err(EdgeError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_well_known_ids() {
        assert_eq!(
            well_known::INT64.to_string(),
            "00000000-0000-0000-0000-000000000105"
        );
        assert_eq!(ScalarKind::from_id(&well_known::CONFIG_MEMORY), Some(ScalarKind::ConfigMemory));
        assert_eq!(ScalarKind::from_id(&Uuid::nil()), None);
    }
}
