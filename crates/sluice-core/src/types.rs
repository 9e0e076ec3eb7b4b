//! Field type tags and the tagged value union.
//!
//! Every field in a record is one of a closed set of primitive types. Each
//! type has a fixed serialized width, so a schema maps to a fixed buffer
//! layout and a row never needs per-field length bookkeeping.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Inline capacity, in bytes, of a `String` field unless the schema says
/// otherwise.
pub const DEFAULT_STRING_CAPACITY: usize = 256;

/// Ticks (100 ns units) between 0001-01-01T00:00:00 and the Unix epoch in
/// the proleptic Gregorian calendar.
pub const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

/// The closed set of primitive field types.
///
/// Configuration refers to these by their lowercase names (`int32`,
/// `datetime`, ...); anything outside the set is a configuration error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Null,
    Int16,
    Int32,
    Int64,
    Byte,
    Float32,
    Float64,
    Boolean,
    DateTime,
    Decimal,
    Guid,
    String,
}

impl FieldType {
    /// Serialized width in bytes. `None` for `String`, whose inline capacity
    /// is fixed per field descriptor (default [`DEFAULT_STRING_CAPACITY`]).
    pub fn fixed_len(self) -> Option<usize> {
        Some(match self {
            FieldType::Null => 0,
            FieldType::Byte | FieldType::Boolean => 1,
            FieldType::Int16 => 2,
            FieldType::Int32 | FieldType::Float32 => 4,
            FieldType::Int64 | FieldType::Float64 | FieldType::DateTime => 8,
            FieldType::Decimal | FieldType::Guid => 16,
            FieldType::String => return None,
        })
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Null => "null",
            FieldType::Int16 => "int16",
            FieldType::Int32 => "int32",
            FieldType::Int64 => "int64",
            FieldType::Byte => "byte",
            FieldType::Float32 => "float32",
            FieldType::Float64 => "float64",
            FieldType::Boolean => "boolean",
            FieldType::DateTime => "datetime",
            FieldType::Decimal => "decimal",
            FieldType::Guid => "guid",
            FieldType::String => "string",
        };
        f.write_str(name)
    }
}

/// One primitive value plus its type tag.
///
/// Fixed-width variants carry their payload in place; `Str` borrows from
/// external storage (normally the record buffer), so reading or writing a
/// value never allocates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue<'a> {
    Null,
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Byte(u8),
    Float32(f32),
    Float64(f64),
    Boolean(bool),
    /// 100 ns ticks since 0001-01-01T00:00:00 UTC, proleptic Gregorian.
    DateTime(i64),
    Decimal(Decimal),
    Guid(Uuid),
    Str(&'a str),
}

impl FieldValue<'_> {
    pub fn tag(&self) -> FieldType {
        match self {
            FieldValue::Null => FieldType::Null,
            FieldValue::Int16(_) => FieldType::Int16,
            FieldValue::Int32(_) => FieldType::Int32,
            FieldValue::Int64(_) => FieldType::Int64,
            FieldValue::Byte(_) => FieldType::Byte,
            FieldValue::Float32(_) => FieldType::Float32,
            FieldValue::Float64(_) => FieldType::Float64,
            FieldValue::Boolean(_) => FieldType::Boolean,
            FieldValue::DateTime(_) => FieldType::DateTime,
            FieldValue::Decimal(_) => FieldType::Decimal,
            FieldValue::Guid(_) => FieldType::Guid,
            FieldValue::Str(_) => FieldType::String,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

impl fmt::Display for FieldValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => Ok(()),
            FieldValue::Int16(v) => write!(f, "{v}"),
            FieldValue::Int32(v) => write!(f, "{v}"),
            FieldValue::Int64(v) => write!(f, "{v}"),
            FieldValue::Byte(v) => write!(f, "{v}"),
            FieldValue::Float32(v) => write!(f, "{v}"),
            FieldValue::Float64(v) => write!(f, "{v}"),
            FieldValue::Boolean(v) => write!(f, "{v}"),
            FieldValue::DateTime(ticks) => match ticks_to_datetime(*ticks) {
                Some(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S%.7fZ")),
                None => write!(f, "{ticks}t"),
            },
            FieldValue::Decimal(v) => write!(f, "{v}"),
            FieldValue::Guid(v) => write!(f, "{v}"),
            FieldValue::Str(v) => f.write_str(v),
        }
    }
}

/// Convert a tick count into a calendar timestamp. `None` when the tick
/// count is outside chrono's representable range.
pub fn ticks_to_datetime(ticks: i64) -> Option<DateTime<Utc>> {
    let since_epoch = ticks - UNIX_EPOCH_TICKS;
    let secs = since_epoch.div_euclid(10_000_000);
    let nanos = (since_epoch.rem_euclid(10_000_000) * 100) as u32;
    DateTime::<Utc>::from_timestamp(secs, nanos)
}

/// Convert a calendar timestamp into ticks. Sub-100ns precision truncates.
pub fn datetime_to_ticks(dt: &DateTime<Utc>) -> i64 {
    let secs = dt.timestamp();
    let nanos = dt.timestamp_subsec_nanos() as i64;
    UNIX_EPOCH_TICKS + secs * 10_000_000 + nanos / 100
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn fixed_widths_match_the_wire_format() {
        assert_eq!(FieldType::Null.fixed_len(), Some(0));
        assert_eq!(FieldType::Byte.fixed_len(), Some(1));
        assert_eq!(FieldType::Boolean.fixed_len(), Some(1));
        assert_eq!(FieldType::Int16.fixed_len(), Some(2));
        assert_eq!(FieldType::Int32.fixed_len(), Some(4));
        assert_eq!(FieldType::Float32.fixed_len(), Some(4));
        assert_eq!(FieldType::Int64.fixed_len(), Some(8));
        assert_eq!(FieldType::Float64.fixed_len(), Some(8));
        assert_eq!(FieldType::DateTime.fixed_len(), Some(8));
        assert_eq!(FieldType::Decimal.fixed_len(), Some(16));
        assert_eq!(FieldType::Guid.fixed_len(), Some(16));
        assert_eq!(FieldType::String.fixed_len(), None);
    }

    #[test]
    fn epoch_tick_origin_is_year_one() {
        let unix_epoch = Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(datetime_to_ticks(&unix_epoch), UNIX_EPOCH_TICKS);
        assert_eq!(ticks_to_datetime(UNIX_EPOCH_TICKS), Some(unix_epoch));
    }

    #[test]
    fn ticks_round_trip_preserves_100ns_precision() {
        let dt = Utc.with_ymd_and_hms(2024, 2, 29, 12, 34, 56).unwrap()
            + chrono::Duration::nanoseconds(123_456_700);
        let ticks = datetime_to_ticks(&dt);
        assert_eq!(ticks_to_datetime(ticks), Some(dt));
    }

    #[test]
    fn config_names_map_to_the_closed_set() {
        let ty: FieldType = serde_yaml::from_str("int32").unwrap();
        assert_eq!(ty, FieldType::Int32);
        let ty: FieldType = serde_yaml::from_str("datetime").unwrap();
        assert_eq!(ty, FieldType::DateTime);
        assert!(serde_yaml::from_str::<FieldType>("varchar").is_err());
    }
}
