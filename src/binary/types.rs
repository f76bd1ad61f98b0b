//! Values produced and consumed by codecs.
//!
//! [`Value`] is the dynamic representation of anything that can travel over
//! the wire. Codecs specialized for a host type still produce a `Value`, but
//! one whose variant matches that host type (e.g. `SystemTime` instead of
//! `Datetime`).

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EdgeError, Result};

/// Field names shared between an object codec and every value it decodes.
pub type SharedNames = Arc<Vec<String>>;

// ============================================================================
// Value
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absent element (length `-1` on the wire).
    Nothing,

    Uuid(Uuid),
    Str(String),
    Bytes(Bytes),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Decimal(Decimal),
    BigInt(Decimal),
    Bool(bool),
    Datetime(DateTime<Utc>),
    LocalDatetime(NaiveDateTime),
    LocalDate(NaiveDate),
    LocalTime(NaiveTime),
    Duration(Duration),
    RelativeDuration(RelativeDuration),
    DateDuration(DateDuration),
    Json(Json),
    ConfigMemory(ConfigMemory),
    Enum(String),

    // Alternate host representations produced by runtime codecs
    SystemTime(SystemTime),
    StdDuration(std::time::Duration),
    JsonValue(serde_json::Value),

    Object(Object),
    SparseObject(SparseObject),
    Tuple(Vec<Value>),
    Array(Vec<Value>),
    Set(Vec<Value>),
    Range(Range),
    MultiRange(Vec<Range>),
}

impl Value {
    pub fn is_nothing(&self) -> bool {
        matches!(self, Value::Nothing)
    }

    /// Short name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Nothing => "nothing",
            Value::Uuid(_) => "uuid",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Int16(_) => "int16",
            Value::Int32(_) => "int32",
            Value::Int64(_) => "int64",
            Value::Float32(_) => "float32",
            Value::Float64(_) => "float64",
            Value::Decimal(_) => "decimal",
            Value::BigInt(_) => "bigint",
            Value::Bool(_) => "bool",
            Value::Datetime(_) => "datetime",
            Value::LocalDatetime(_) => "local_datetime",
            Value::LocalDate(_) => "local_date",
            Value::LocalTime(_) => "local_time",
            Value::Duration(_) => "duration",
            Value::RelativeDuration(_) => "relative_duration",
            Value::DateDuration(_) => "date_duration",
            Value::Json(_) => "json",
            Value::ConfigMemory(_) => "cfg::memory",
            Value::Enum(_) => "enum",
            Value::SystemTime(_) => "SystemTime",
            Value::StdDuration(_) => "std::time::Duration",
            Value::JsonValue(_) => "serde_json::Value",
            Value::Object(_) => "object",
            Value::SparseObject(_) => "sparse object",
            Value::Tuple(_) => "tuple",
            Value::Array(_) => "array",
            Value::Set(_) => "set",
            Value::Range(_) => "range",
            Value::MultiRange(_) => "multirange",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int16(v) => Some(*v as i64),
            Value::Int32(v) => Some(*v as i64),
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::Enum(s) => Some(s),
            Value::Json(j) => Some(&j.0),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Elements of a tuple, array or set.
    pub fn elements(&self) -> Option<&[Value]> {
        match self {
            Value::Tuple(v) | Value::Array(v) | Value::Set(v) => Some(v),
            _ => None,
        }
    }

    pub(crate) fn mismatch(&self, expected: &str) -> EdgeError {
        EdgeError::invalid_value(format!("expected {}, got {}", expected, self.kind()))
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::Int16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Uuid(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Nothing)
    }
}

// ============================================================================
// Object shapes
// ============================================================================

/// An object or named tuple: ordered names with their values.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    names: SharedNames,
    values: Vec<Value>,
}

impl Object {
    pub fn new(names: SharedNames, values: Vec<Value>) -> Result<Self> {
        if names.len() != values.len() {
            return Err(EdgeError::invalid_value(format!(
                "object has {} names but {} values",
                names.len(),
                values.len()
            )));
        }
        Ok(Self { names, values })
    }

    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        let (names, values): (Vec<String>, Vec<Value>) =
            pairs.into_iter().map(|(n, v)| (n.into(), v)).unzip();
        Self {
            names: Arc::new(names),
            values,
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| &self.values[i])
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.names.iter().map(String::as_str).zip(self.values.iter())
    }
}

/// Input-shape value: only the fields that are set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseObject {
    fields: Vec<(String, Value)>,
}

impl SparseObject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn fields(&self) -> &[(String, Value)] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A range with optional bounds. A missing bound is infinite.
#[derive(Debug, Clone, PartialEq)]
pub struct Range {
    pub lower: Option<Box<Value>>,
    pub upper: Option<Box<Value>>,
    pub inc_lower: bool,
    pub inc_upper: bool,
    pub empty: bool,
}

impl Range {
    pub fn new(lower: Option<Value>, upper: Option<Value>, inc_lower: bool, inc_upper: bool) -> Self {
        Self {
            lower: lower.map(Box::new),
            upper: upper.map(Box::new),
            inc_lower,
            inc_upper,
            empty: false,
        }
    }

    pub fn empty() -> Self {
        Self {
            lower: None,
            upper: None,
            inc_lower: false,
            inc_upper: false,
            empty: true,
        }
    }
}

// ============================================================================
// Scalar datatypes
// ============================================================================

/// Exact-time duration in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Duration {
    pub micros: i64,
}

impl Duration {
    pub fn from_micros(micros: i64) -> Self {
        Self { micros }
    }
}

/// Calendar-aware duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RelativeDuration {
    pub micros: i64,
    pub days: i32,
    pub months: i32,
}

/// Calendar duration with day granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DateDuration {
    pub days: i32,
    pub months: i32,
}

/// `cfg::memory` value in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigMemory(pub i64);

/// Raw JSON text as sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Json(pub String);

/// Arbitrary-precision number in the server's base-10000 layout.
///
/// Used for both `decimal` and `bigint` (the latter always has `scale == 0`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Decimal {
    pub negative: bool,
    /// Power of 10000 of the first digit group.
    pub weight: i16,
    /// Number of decimal digits after the point.
    pub scale: u16,
    pub digits: Vec<u16>,
}

impl Decimal {
    pub fn zero() -> Self {
        Self {
            negative: false,
            weight: 0,
            scale: 0,
            digits: Vec::new(),
        }
    }

    pub fn from_i64(v: i64) -> Self {
        let mut groups = Vec::new();
        let mut n = v.unsigned_abs();
        while n > 0 {
            groups.push((n % 10_000) as u16);
            n /= 10_000;
        }
        groups.reverse();
        let weight = groups.len() as i16 - 1;
        while groups.last() == Some(&0) {
            groups.pop();
        }
        if groups.is_empty() {
            return Self::zero();
        }
        Self {
            negative: v < 0,
            weight,
            scale: 0,
            digits: groups,
        }
    }

    /// Integer value, if this number has no fractional part and fits in i64.
    pub fn to_i64(&self) -> Option<i64> {
        let mut acc: i64 = 0;
        for (k, digit) in self.digits.iter().enumerate() {
            let power = self.weight as i32 - k as i32;
            if power < 0 {
                if *digit != 0 {
                    return None;
                }
                continue;
            }
            let mut term = *digit as i64;
            for _ in 0..power {
                term = term.checked_mul(10_000)?;
            }
            acc = if self.negative {
                acc.checked_sub(term)?
            } else {
                acc.checked_add(term)?
            };
        }
        Some(acc)
    }

    fn group(&self, k: i32) -> u16 {
        if k < 0 {
            0
        } else {
            self.digits.get(k as usize).copied().unwrap_or(0)
        }
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negative && !self.digits.is_empty() {
            write!(f, "-")?;
        }
        if self.weight < 0 || self.digits.is_empty() {
            write!(f, "0")?;
        } else {
            write!(f, "{}", self.group(0))?;
            for k in 1..=self.weight as i32 {
                write!(f, "{:04}", self.group(k))?;
            }
        }
        if self.scale > 0 {
            let groups = (self.scale as i32 + 3) / 4;
            let first = if self.digits.is_empty() {
                0
            } else {
                self.weight as i32 + 1
            };
            let mut frac = String::with_capacity(groups as usize * 4);
            for k in first..first + groups {
                frac.push_str(&format!("{:04}", self.group(k)));
            }
            if self.digits.is_empty() {
                frac = "0".repeat(groups as usize * 4);
            }
            write!(f, ".{}", &frac[..self.scale as usize])?;
        }
        Ok(())
    }
}

impl FromStr for Decimal {
    type Err = EdgeError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || EdgeError::invalid_value(format!("invalid decimal literal {:?}", s));
        let (negative, body) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        let (int_part, frac_part) = match body.split_once('.') {
            Some((i, f)) => (i, f),
            None => (body, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }
        if !int_part.bytes().all(|b| b.is_ascii_digit()) || !frac_part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let scale = u16::try_from(frac_part.len()).map_err(|_| invalid())?;

        let int_part = int_part.trim_start_matches('0');
        let int_pad = (4 - int_part.len() % 4) % 4;
        let frac_pad = (4 - frac_part.len() % 4) % 4;
        let mut padded = String::with_capacity(int_part.len() + frac_part.len() + 8);
        padded.push_str(&"0".repeat(int_pad));
        padded.push_str(int_part);
        padded.push_str(frac_part);
        padded.push_str(&"0".repeat(frac_pad));

        let mut digits: Vec<u16> = padded
            .as_bytes()
            .chunks(4)
            .map(|chunk| {
                chunk
                    .iter()
                    .fold(0u16, |acc, b| acc * 10 + (b - b'0') as u16)
            })
            .collect();
        let mut weight = ((int_part.len() + int_pad) / 4) as i32 - 1;

        // Leading zero groups shift the weight, trailing ones are dropped
        let leading = digits.iter().take_while(|d| **d == 0).count();
        digits.drain(..leading);
        weight -= leading as i32;
        while digits.last() == Some(&0) {
            digits.pop();
        }
        if digits.is_empty() {
            return Ok(Self {
                negative: false,
                weight: 0,
                scale,
                digits,
            });
        }
        Ok(Self {
            negative,
            weight: i16::try_from(weight).map_err(|_| invalid())?,
            scale,
            digits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decimal_string_roundtrip() {
        for s in ["0", "1", "-1", "10000", "123456789", "0.5", "-12.3400", "0.0001", "100000000.01"] {
            let d: Decimal = s.parse().unwrap();
            assert_eq!(d.to_string(), s, "roundtrip of {}", s);
        }
    }

    #[test]
    fn test_decimal_layout() {
        let d: Decimal = "123456789".parse().unwrap();
        assert_eq!(d.weight, 2);
        assert_eq!(d.digits, vec![1, 2345, 6789]);

        let d: Decimal = "0.0001".parse().unwrap();
        assert_eq!(d.weight, -1);
        assert_eq!(d.digits, vec![1]);
        assert_eq!(d.scale, 4);
    }

    #[test]
    fn test_decimal_integer_conversion() {
        assert_eq!(Decimal::from_i64(-20000).to_i64(), Some(-20000));
        assert_eq!(Decimal::from_i64(i64::MAX).to_i64(), Some(i64::MAX));
        assert_eq!(Decimal::from_i64(i64::MIN).to_i64(), Some(i64::MIN));
        assert_eq!("1.5".parse::<Decimal>().unwrap().to_i64(), None);
        assert_eq!(Decimal::from_i64(0), Decimal::zero());
    }

    #[test]
    fn test_object_lookup() {
        let obj = Object::from_pairs([("id", Value::Int64(1)), ("name", Value::Nothing)]);
        assert_eq!(obj.get("id"), Some(&Value::Int64(1)));
        assert_eq!(obj.get("name"), Some(&Value::Nothing));
        assert!(obj.get("missing").is_none());
    }
}
