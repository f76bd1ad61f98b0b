//! Date and time wire formats. All instants count from 2000-01-01T00:00:00.

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveDateTime, NaiveTime, Utc};

use crate::binary::buffer::BufferContract;
use crate::binary::types::{DateDuration, Duration, RelativeDuration};
use crate::error::{EdgeError, Result};

const MICROS_PER_DAY: i64 = 86_400_000_000;

fn epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2000, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or(NaiveDateTime::MIN)
}

fn epoch_date() -> NaiveDate {
    epoch().date()
}

fn out_of_range(what: &str, raw: i64) -> EdgeError {
    EdgeError::protocol(format!("{} value {} is out of range", what, raw))
}

pub fn local_datetime_from_micros(micros: i64) -> Result<NaiveDateTime> {
    epoch()
        .checked_add_signed(ChronoDuration::microseconds(micros))
        .ok_or_else(|| out_of_range("local_datetime", micros))
}

/// Sub-microsecond precision is floored, so instants before the epoch round
/// towards the past like those after it.
pub fn local_datetime_to_micros(dt: &NaiveDateTime) -> Result<i64> {
    let delta = *dt - epoch();
    // `num_seconds` and `subsec_nanos` share a sign, so the floor is exact
    let sub_micros = i64::from(delta.subsec_nanos()).div_euclid(1_000);
    delta
        .num_seconds()
        .checked_mul(1_000_000)
        .and_then(|micros| micros.checked_add(sub_micros))
        .ok_or_else(|| EdgeError::invalid_value(format!("local_datetime {} is out of range", dt)))
}

pub fn datetime_from_micros(micros: i64) -> Result<DateTime<Utc>> {
    local_datetime_from_micros(micros)
        .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
        .map_err(|_| out_of_range("datetime", micros))
}

pub fn datetime_to_micros(dt: &DateTime<Utc>) -> Result<i64> {
    local_datetime_to_micros(&dt.naive_utc())
}

pub fn local_date_from_days(days: i32) -> Result<NaiveDate> {
    epoch_date()
        .checked_add_signed(ChronoDuration::days(days as i64))
        .ok_or_else(|| out_of_range("local_date", days as i64))
}

pub fn local_date_to_days(date: &NaiveDate) -> Result<i32> {
    let days = (*date - epoch_date()).num_days();
    i32::try_from(days)
        .map_err(|_| EdgeError::invalid_value(format!("local_date {} is out of range", date)))
}

pub fn local_time_from_micros(micros: i64) -> Result<NaiveTime> {
    if !(0..MICROS_PER_DAY).contains(&micros) {
        return Err(out_of_range("local_time", micros));
    }
    let secs = (micros / 1_000_000) as u32;
    let nanos = ((micros % 1_000_000) * 1_000) as u32;
    NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
        .ok_or_else(|| out_of_range("local_time", micros))
}

pub fn local_time_to_micros(time: &NaiveTime) -> i64 {
    (*time - NaiveTime::MIN).num_microseconds().unwrap_or(0)
}

/// `duration`: i64 micros, i32 days, i32 months. Days and months must be zero.
pub fn decode_duration(buf: &mut BufferContract<'_>) -> Result<Duration> {
    let micros = buf.read_i64()?;
    let days = buf.read_i32()?;
    let months = buf.read_i32()?;
    if days != 0 || months != 0 {
        return Err(EdgeError::protocol(format!(
            "duration carries non-zero days ({}) or months ({})",
            days, months
        )));
    }
    Ok(Duration::from_micros(micros))
}

pub fn encode_duration(buf: &mut BytesMut, d: &Duration) {
    buf.put_i64(d.micros);
    buf.put_i32(0);
    buf.put_i32(0);
}

pub fn decode_relative_duration(buf: &mut BufferContract<'_>) -> Result<RelativeDuration> {
    Ok(RelativeDuration {
        micros: buf.read_i64()?,
        days: buf.read_i32()?,
        months: buf.read_i32()?,
    })
}

pub fn encode_relative_duration(buf: &mut BytesMut, d: &RelativeDuration) {
    buf.put_i64(d.micros);
    buf.put_i32(d.days);
    buf.put_i32(d.months);
}

/// `date_duration`: i64 reserved, i32 days, i32 months.
pub fn decode_date_duration(buf: &mut BufferContract<'_>) -> Result<DateDuration> {
    buf.skip(8)?;
    Ok(DateDuration {
        days: buf.read_i32()?,
        months: buf.read_i32()?,
    })
}

pub fn encode_date_duration(buf: &mut BytesMut, d: &DateDuration) {
    buf.put_i64(0);
    buf.put_i32(d.days);
    buf.put_i32(d.months);
}
