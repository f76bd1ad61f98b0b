//! Broker codecs and their runtime specializations.
//!
//! A scalar with more than one host representation is built as a
//! [`ComplexCodec`]. Asking it for a host type yields a [`RuntimeCodec`]
//! that decodes the wire value natively and then converts it. Runtime codecs
//! are created at most once per (broker, host type) and kept by the broker.
//!
//! Conversions come from a static registry of plain function pairs.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration as StdDuration, SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use uuid::Uuid;

use super::{Codec, CodecRef, ScalarCodec, ScalarKind};
use crate::binary::buffer::BufferContract;
use crate::binary::host::HostType;
use crate::binary::types::{ConfigMemory, Decimal, Duration, Json, Value};
use crate::error::{EdgeError, Result};

/// A pair of conversions between a scalar's native value and a host value.
pub struct Converter {
    pub kind: ScalarKind,
    pub host: HostType,
    pub to_host: fn(Value) -> Result<Value>,
    pub from_host: fn(&Value) -> Result<Value>,
}

impl std::fmt::Debug for Converter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Converter")
            .field("kind", &self.kind)
            .field("host", &self.host)
            .finish()
    }
}

static CONVERTERS: Lazy<Vec<Converter>> = Lazy::new(|| {
    vec![
        conv(ScalarKind::Int16, HostType::Int32, int16_to_int32, int_to_int16),
        conv(ScalarKind::Int16, HostType::Int64, int16_to_int64, int_to_int16),
        conv(ScalarKind::Int32, HostType::Int64, int32_to_int64, int_to_int32),
        conv(ScalarKind::Float32, HostType::Float64, float32_to_float64, float64_to_float32),
        conv(ScalarKind::Datetime, HostType::SystemTime, datetime_to_system, system_to_datetime),
        conv(
            ScalarKind::LocalDatetime,
            HostType::SystemTime,
            local_datetime_to_system,
            system_to_local_datetime,
        ),
        conv(ScalarKind::Duration, HostType::StdDuration, duration_to_std, std_to_duration),
        conv(ScalarKind::Json, HostType::JsonValue, json_to_value, value_to_json),
        conv(ScalarKind::ConfigMemory, HostType::Int64, memory_to_int64, int64_to_memory),
        conv(ScalarKind::BigInt, HostType::Int64, bigint_to_int64, int64_to_bigint),
        conv(ScalarKind::BigInt, HostType::Str, numeric_to_str, str_to_bigint),
        conv(ScalarKind::Decimal, HostType::Str, numeric_to_str, str_to_decimal),
        conv(ScalarKind::Decimal, HostType::Float64, decimal_to_float64, float64_to_decimal),
        conv(ScalarKind::Uuid, HostType::Str, uuid_to_str, str_to_uuid),
    ]
});

fn conv(
    kind: ScalarKind,
    host: HostType,
    to_host: fn(Value) -> Result<Value>,
    from_host: fn(&Value) -> Result<Value>,
) -> Converter {
    Converter {
        kind,
        host,
        to_host,
        from_host,
    }
}

/// Registered converter from `kind` to `host`.
pub fn converter(kind: ScalarKind, host: &HostType) -> Option<&'static Converter> {
    CONVERTERS.iter().find(|c| c.kind == kind && c.host == *host)
}

/// Whether `kind` has any alternate host representation.
pub fn has_converters(kind: ScalarKind) -> bool {
    CONVERTERS.iter().any(|c| c.kind == kind)
}

/// Host types `kind` can be converted to, besides its native one.
pub fn hosts_for(kind: ScalarKind) -> Vec<HostType> {
    CONVERTERS
        .iter()
        .filter(|c| c.kind == kind)
        .map(|c| c.host.clone())
        .collect()
}

// ============================================================================
// Conversions
// ============================================================================

fn unexpected(value: &Value, expected: &str) -> EdgeError {
    EdgeError::Internal(format!("converter expected {}, got {}", expected, value.kind()))
}

fn int16_to_int32(v: Value) -> Result<Value> {
    match v {
        Value::Int16(i) => Ok(Value::Int32(i as i32)),
        other => Err(unexpected(&other, "int16")),
    }
}

fn int16_to_int64(v: Value) -> Result<Value> {
    match v {
        Value::Int16(i) => Ok(Value::Int64(i as i64)),
        other => Err(unexpected(&other, "int16")),
    }
}

fn int32_to_int64(v: Value) -> Result<Value> {
    match v {
        Value::Int32(i) => Ok(Value::Int64(i as i64)),
        other => Err(unexpected(&other, "int32")),
    }
}

fn narrow_int<T: TryFrom<i64>>(v: &Value, target: &str) -> Result<T> {
    let wide = v.as_i64().ok_or_else(|| v.mismatch(target))?;
    T::try_from(wide).map_err(|_| EdgeError::invalid_value(format!("{} is out of range for {}", wide, target)))
}

fn int_to_int16(v: &Value) -> Result<Value> {
    narrow_int(v, "int16").map(Value::Int16)
}

fn int_to_int32(v: &Value) -> Result<Value> {
    narrow_int(v, "int32").map(Value::Int32)
}

fn float32_to_float64(v: Value) -> Result<Value> {
    match v {
        Value::Float32(f) => Ok(Value::Float64(f as f64)),
        other => Err(unexpected(&other, "float32")),
    }
}

fn float64_to_float32(v: &Value) -> Result<Value> {
    match v {
        Value::Float64(f) => Ok(Value::Float32(*f as f32)),
        other => Ok(other.clone()),
    }
}

fn to_system_time(dt: DateTime<Utc>) -> Result<Value> {
    let micros = dt.timestamp_micros();
    let magnitude = StdDuration::from_micros(micros.unsigned_abs());
    let time = if micros >= 0 {
        UNIX_EPOCH.checked_add(magnitude)
    } else {
        UNIX_EPOCH.checked_sub(magnitude)
    };
    time.map(Value::SystemTime)
        .ok_or_else(|| EdgeError::invalid_value(format!("{} does not fit SystemTime", dt)))
}

fn from_system_time(t: &SystemTime) -> Result<DateTime<Utc>> {
    let micros = match t.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_micros()),
        Err(before) => i64::try_from(before.duration().as_micros()).map(|m| -m),
    }
    .map_err(|_| EdgeError::invalid_value("SystemTime is out of range"))?;
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| EdgeError::invalid_value("SystemTime is out of range"))
}

fn datetime_to_system(v: Value) -> Result<Value> {
    match v {
        Value::Datetime(dt) => to_system_time(dt),
        other => Err(unexpected(&other, "datetime")),
    }
}

fn system_to_datetime(v: &Value) -> Result<Value> {
    match v {
        Value::SystemTime(t) => from_system_time(t).map(Value::Datetime),
        other => Ok(other.clone()),
    }
}

/// Local datetimes are read as UTC wall-clock time.
fn local_datetime_to_system(v: Value) -> Result<Value> {
    match v {
        Value::LocalDatetime(naive) => to_system_time(naive.and_utc()),
        other => Err(unexpected(&other, "local_datetime")),
    }
}

fn system_to_local_datetime(v: &Value) -> Result<Value> {
    match v {
        Value::SystemTime(t) => from_system_time(t).map(|dt| Value::LocalDatetime(dt.naive_utc())),
        other => Ok(other.clone()),
    }
}

fn duration_to_std(v: Value) -> Result<Value> {
    match v {
        Value::Duration(d) => u64::try_from(d.micros)
            .map(|micros| Value::StdDuration(StdDuration::from_micros(micros)))
            .map_err(|_| {
                EdgeError::invalid_value(format!(
                    "negative duration of {}us has no std::time::Duration form",
                    d.micros
                ))
            }),
        other => Err(unexpected(&other, "duration")),
    }
}

fn std_to_duration(v: &Value) -> Result<Value> {
    match v {
        Value::StdDuration(d) => i64::try_from(d.as_micros())
            .map(|micros| Value::Duration(Duration::from_micros(micros)))
            .map_err(|_| EdgeError::invalid_value("std::time::Duration is out of range")),
        other => Ok(other.clone()),
    }
}

fn json_to_value(v: Value) -> Result<Value> {
    match v {
        Value::Json(Json(text)) => serde_json::from_str(&text)
            .map(Value::JsonValue)
            .map_err(|e| EdgeError::protocol(format!("server sent invalid json: {}", e))),
        other => Err(unexpected(&other, "json")),
    }
}

fn value_to_json(v: &Value) -> Result<Value> {
    match v {
        Value::JsonValue(value) => serde_json::to_string(value)
            .map(|text| Value::Json(Json(text)))
            .map_err(|e| EdgeError::invalid_value(format!("unserializable json: {}", e))),
        other => Ok(other.clone()),
    }
}

fn memory_to_int64(v: Value) -> Result<Value> {
    match v {
        Value::ConfigMemory(m) => Ok(Value::Int64(m.0)),
        other => Err(unexpected(&other, "cfg::memory")),
    }
}

fn int64_to_memory(v: &Value) -> Result<Value> {
    match v.as_i64() {
        Some(bytes) => Ok(Value::ConfigMemory(ConfigMemory(bytes))),
        None => Ok(v.clone()),
    }
}

fn bigint_to_int64(v: Value) -> Result<Value> {
    match v {
        Value::BigInt(d) => d
            .to_i64()
            .map(Value::Int64)
            .ok_or_else(|| EdgeError::invalid_value(format!("bigint {} does not fit int64", d))),
        other => Err(unexpected(&other, "bigint")),
    }
}

fn int64_to_bigint(v: &Value) -> Result<Value> {
    match v.as_i64() {
        Some(i) => Ok(Value::BigInt(Decimal::from_i64(i))),
        None => Ok(v.clone()),
    }
}

fn numeric_to_str(v: Value) -> Result<Value> {
    match v {
        Value::Decimal(d) | Value::BigInt(d) => Ok(Value::Str(d.to_string())),
        other => Err(unexpected(&other, "numeric")),
    }
}

fn str_to_bigint(v: &Value) -> Result<Value> {
    match v {
        Value::Str(s) => s.parse::<Decimal>().map(Value::BigInt),
        other => Ok(other.clone()),
    }
}

fn str_to_decimal(v: &Value) -> Result<Value> {
    match v {
        Value::Str(s) => s.parse::<Decimal>().map(Value::Decimal),
        other => Ok(other.clone()),
    }
}

fn decimal_to_float64(v: Value) -> Result<Value> {
    match v {
        Value::Decimal(d) => d
            .to_string()
            .parse::<f64>()
            .map(Value::Float64)
            .map_err(|e| EdgeError::invalid_value(format!("decimal {} as float64: {}", d, e))),
        other => Err(unexpected(&other, "decimal")),
    }
}

fn float64_to_decimal(v: &Value) -> Result<Value> {
    match v {
        Value::Float64(f) if f.is_finite() => f.to_string().parse::<Decimal>().map(Value::Decimal),
        Value::Float64(f) => Err(EdgeError::invalid_value(format!("{} has no decimal form", f))),
        other => Ok(other.clone()),
    }
}

fn uuid_to_str(v: Value) -> Result<Value> {
    match v {
        Value::Uuid(id) => Ok(Value::Str(id.to_string())),
        other => Err(unexpected(&other, "uuid")),
    }
}

fn str_to_uuid(v: &Value) -> Result<Value> {
    match v {
        Value::Str(s) => Uuid::parse_str(s)
            .map(Value::Uuid)
            .map_err(|e| EdgeError::invalid_value(format!("invalid uuid {:?}: {}", s, e))),
        other => Ok(other.clone()),
    }
}

// ============================================================================
// Broker
// ============================================================================

#[derive(Debug)]
pub struct ComplexCodec {
    pub scalar: ScalarCodec,
    runtime: RwLock<HashMap<HostType, CodecRef>>,
}

impl ComplexCodec {
    pub fn new(scalar: ScalarCodec) -> Self {
        Self {
            scalar,
            runtime: RwLock::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.scalar.id()
    }

    pub(super) fn accepts(&self, host: &HostType) -> bool {
        self.scalar.kind.native_host() == *host || converter(self.scalar.kind, host).is_some()
    }

    /// Encode either a native value or any registered host representation.
    ///
    /// Every converter is tried in turn; when none accepts the value the
    /// last converter error is reported, or the native one if none failed.
    pub(super) fn encode(&self, buf: &mut BytesMut, value: &Value) -> Result<()> {
        let kind = self.scalar.kind;
        let mut last_err = match kind.encode(&mut BytesMut::new(), value) {
            Ok(()) => return kind.encode(buf, value),
            Err(e) => e,
        };
        for conv in CONVERTERS.iter().filter(|c| c.kind == kind) {
            match (conv.from_host)(value) {
                Ok(native) if native != *value => return kind.encode(buf, &native),
                Ok(_) => {}
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    /// Number of runtime codecs built so far.
    pub fn runtime_count(&self) -> usize {
        self.runtime.read().len()
    }
}

/// Runtime codec for `host`, built and cached by the broker on first request.
///
/// The native host type and `Dynamic` resolve to the broker itself.
pub fn codec_for(broker: &CodecRef, host: &HostType) -> Result<CodecRef> {
    let complex = match &**broker {
        Codec::Complex(c) => c,
        other => {
            return Err(EdgeError::Internal(format!(
                "{} is not a broker codec",
                other.type_name()
            )))
        }
    };
    let host = host.unwrap_optional();
    let kind = complex.scalar.kind;
    if matches!(host, HostType::Dynamic | HostType::Ignore) || kind.native_host() == *host {
        return Ok(Arc::clone(broker));
    }
    if let Some(hit) = complex.runtime.read().get(host) {
        return Ok(Arc::clone(hit));
    }

    let conv = converter(kind, host).ok_or_else(|| EdgeError::NoTypeConverter {
        host: host.to_string(),
        codec: kind.name().to_string(),
        path: String::new(),
        reason: "no registered conversion".to_string(),
    })?;
    let built = Arc::new(Codec::Runtime(RuntimeCodec {
        kind,
        converter: conv,
        broker: Arc::downgrade(broker),
    }));

    let mut runtime = complex.runtime.write();
    let codec = Arc::clone(runtime.entry(host.clone()).or_insert(built));
    tracing::debug!(codec = %kind.name(), host = %host, "built runtime codec");
    Ok(codec)
}

/// A broker's specialization for one host type.
#[derive(Debug)]
pub struct RuntimeCodec {
    pub kind: ScalarKind,
    pub converter: &'static Converter,
    pub broker: Weak<Codec>,
}

impl RuntimeCodec {
    pub fn id(&self) -> Uuid {
        self.kind.id()
    }

    pub fn broker(&self) -> Option<CodecRef> {
        self.broker.upgrade()
    }

    pub(super) fn decode(&self, buf: &mut BufferContract<'_>) -> Result<Value> {
        let native = self.kind.decode(buf)?;
        (self.converter.to_host)(native)
    }

    pub(super) fn encode(&self, buf: &mut BytesMut, value: &Value) -> Result<()> {
        let native = (self.converter.from_host)(value)?;
        self.kind.encode(buf, &native)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker(kind: ScalarKind) -> CodecRef {
        Arc::new(Codec::Complex(ComplexCodec::new(ScalarCodec::new(kind))))
    }

    #[test]
    fn test_runtime_codec_is_memoized() {
        let b = broker(ScalarKind::Int16);
        let first = codec_for(&b, &HostType::Int64).unwrap();
        let second = codec_for(&b, &HostType::Int64).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&codec_for(&b, &HostType::Int16).unwrap(), &b));

        match &*b {
            Codec::Complex(c) => assert_eq!(c.runtime_count(), 1),
            _ => unreachable!(),
        }
        match &*first {
            Codec::Runtime(r) => assert!(Arc::ptr_eq(&r.broker().unwrap(), &b)),
            _ => panic!("expected runtime codec"),
        }
    }

    #[test]
    fn test_broker_encodes_host_forms() {
        let b = broker(ScalarKind::Decimal);

        let mut from_str = BytesMut::new();
        b.encode(&mut from_str, &Value::Str("12.5".into())).unwrap();
        let mut from_float = BytesMut::new();
        b.encode(&mut from_float, &Value::Float64(12.5)).unwrap();
        assert_eq!(from_str, from_float);

        // Rejected by the str converter, passed over by the float one
        assert!(matches!(
            b.encode(&mut BytesMut::new(), &Value::Str("twelve".into())),
            Err(EdgeError::InvalidValue(_))
        ));
        // A NaN float reaches the float converter after the str converter
        assert!(matches!(
            b.encode(&mut BytesMut::new(), &Value::Float64(f64::NAN)),
            Err(EdgeError::InvalidValue(_))
        ));
        assert!(b.encode(&mut BytesMut::new(), &Value::Bool(true)).is_err());
    }

    #[test]
    fn test_runtime_codec_converts() {
        let b = broker(ScalarKind::Int16);
        let codec = codec_for(&b, &HostType::Int64).unwrap();
        let data = 7i16.to_be_bytes();
        assert_eq!(
            codec.decode(&mut BufferContract::new(&data)).unwrap(),
            Value::Int64(7)
        );
        let mut buf = BytesMut::new();
        codec.encode(&mut buf, &Value::Int64(7)).unwrap();
        assert_eq!(&buf[..], &data);
    }

    #[test]
    fn test_unregistered_host_is_no_type_converter() {
        let b = broker(ScalarKind::Int16);
        assert!(matches!(
            codec_for(&b, &HostType::Bytes),
            Err(EdgeError::NoTypeConverter { .. })
        ));
    }

    #[test]
    fn test_negative_duration_rejected() {
        let b = broker(ScalarKind::Duration);
        let codec = codec_for(&b, &HostType::StdDuration).unwrap();
        let mut data = (-5i64).to_be_bytes().to_vec();
        data.extend_from_slice(&[0; 8]);
        assert!(matches!(
            codec.decode(&mut BufferContract::new(&data)),
            Err(EdgeError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_json_to_serde_value() {
        let b = broker(ScalarKind::Json);
        let codec = codec_for(&b, &HostType::JsonValue).unwrap();
        let mut data = vec![1u8];
        data.extend_from_slice(b"{\"a\":1}");
        assert_eq!(
            codec.decode(&mut BufferContract::new(&data)).unwrap(),
            Value::JsonValue(serde_json::json!({"a": 1}))
        );
    }

    #[test]
    fn test_datetime_to_system_time() {
        let b = broker(ScalarKind::Datetime);
        let codec = codec_for(&b, &HostType::SystemTime).unwrap();
        let data = 0i64.to_be_bytes();
        let expected = UNIX_EPOCH + StdDuration::from_secs(946_684_800);
        assert_eq!(
            codec.decode(&mut BufferContract::new(&data)).unwrap(),
            Value::SystemTime(expected)
        );
    }

    #[test]
    fn test_broker_encodes_host_values() {
        let b = broker(ScalarKind::Uuid);
        let id = Uuid::from_bytes([7; 16]);
        let mut buf = BytesMut::new();
        b.encode(&mut buf, &Value::Str(id.to_string())).unwrap();
        assert_eq!(&buf[..], id.as_bytes());
    }
}
