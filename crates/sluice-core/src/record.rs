//! Records: scope-bound views over a byte buffer interpreted through a
//! schema.
//!
//! A record owns neither its buffer nor its schema; both are lent to it for
//! the duration of one processing step. Crossing a task boundary therefore
//! always means copying the bytes into a freshly rented buffer first.

use crate::error::FieldError;
use crate::schema::{FieldDescriptor, Schema};
use crate::types::{FieldType, FieldValue};
use rust_decimal::Decimal;
use uuid::Uuid;

/// A mutable, typed view over one row.
///
/// All integers and floats are little-endian; `DateTime` is a little-endian
/// tick count; `Decimal` uses `rust_decimal`'s 16-byte binary layout; `Guid`
/// is the RFC 4122 16-byte form. Strings live inline, UTF-8,
/// NUL-terminated when shorter than their capacity.
pub struct Record<'a> {
    buf: &'a mut [u8],
    schema: &'a Schema,
    line: u64,
}

impl<'a> Record<'a> {
    /// Bind a buffer and a schema. The buffer must be at least
    /// `schema.row_size()` bytes; handing a shorter one is a caller bug.
    pub fn new(buf: &'a mut [u8], schema: &'a Schema) -> Self {
        assert!(
            buf.len() >= schema.row_size(),
            "record buffer of {} bytes is smaller than the {}-byte row",
            buf.len(),
            schema.row_size()
        );
        Self {
            buf,
            schema,
            line: 0,
        }
    }

    /// Tag the record with the 1-based source line it came from.
    pub fn with_line(mut self, line: u64) -> Self {
        self.line = line;
        self
    }

    pub fn schema(&self) -> &Schema {
        self.schema
    }

    pub fn line(&self) -> u64 {
        self.line
    }

    /// The serialized row: the first `row_size` bytes of the buffer.
    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.schema.row_size()]
    }

    /// Zero the whole row.
    pub fn clear(&mut self) {
        self.buf[..self.schema.row_size()].fill(0);
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.schema.index_of(name)
    }

    /// Read the `index`-th field. The returned value's tag is always the
    /// descriptor's type; zeroed storage reads as zero / empty, never as
    /// `Null`.
    pub fn get(&self, index: usize) -> Result<FieldValue<'_>, FieldError> {
        let d = self.descriptor(index)?;
        let region = &self.buf[d.offset..d.offset + d.len];
        Ok(match d.ftype {
            FieldType::Null => FieldValue::Null,
            FieldType::Byte => FieldValue::Byte(region[0]),
            FieldType::Boolean => FieldValue::Boolean(region[0] != 0),
            FieldType::Int16 => FieldValue::Int16(i16::from_le_bytes(array(region))),
            FieldType::Int32 => FieldValue::Int32(i32::from_le_bytes(array(region))),
            FieldType::Int64 => FieldValue::Int64(i64::from_le_bytes(array(region))),
            FieldType::Float32 => FieldValue::Float32(f32::from_le_bytes(array(region))),
            FieldType::Float64 => FieldValue::Float64(f64::from_le_bytes(array(region))),
            FieldType::DateTime => FieldValue::DateTime(i64::from_le_bytes(array(region))),
            FieldType::Decimal => FieldValue::Decimal(Decimal::deserialize(array(region))),
            FieldType::Guid => FieldValue::Guid(Uuid::from_bytes(array(region))),
            FieldType::String => {
                let end = region.iter().position(|&b| b == 0).unwrap_or(region.len());
                let s = std::str::from_utf8(&region[..end]).map_err(|e| FieldError::Corrupt {
                    field: d.name.clone(),
                    ty: FieldType::String,
                    detail: e.to_string(),
                })?;
                FieldValue::Str(s)
            }
        })
    }

    pub fn get_by_name(&self, name: &str) -> Result<FieldValue<'_>, FieldError> {
        let index = self
            .index_of(name)
            .ok_or_else(|| FieldError::UnknownField(name.to_string()))?;
        self.get(index)
    }

    /// Write a value into the `index`-th field. The value's tag must equal
    /// the descriptor's type; `Null` zeroes the field region instead.
    pub fn set(&mut self, index: usize, value: FieldValue<'_>) -> Result<(), FieldError> {
        let d = self.descriptor(index)?.clone();
        let region = &mut self.buf[d.offset..d.offset + d.len];

        match (&value, d.ftype) {
            (FieldValue::Null, _) => region.fill(0),
            (FieldValue::Byte(v), FieldType::Byte) => region[0] = *v,
            (FieldValue::Boolean(v), FieldType::Boolean) => region[0] = *v as u8,
            (FieldValue::Int16(v), FieldType::Int16) => region.copy_from_slice(&v.to_le_bytes()),
            (FieldValue::Int32(v), FieldType::Int32) => region.copy_from_slice(&v.to_le_bytes()),
            (FieldValue::Int64(v), FieldType::Int64) => region.copy_from_slice(&v.to_le_bytes()),
            (FieldValue::Float32(v), FieldType::Float32) => {
                region.copy_from_slice(&v.to_le_bytes())
            }
            (FieldValue::Float64(v), FieldType::Float64) => {
                region.copy_from_slice(&v.to_le_bytes())
            }
            (FieldValue::DateTime(v), FieldType::DateTime) => {
                region.copy_from_slice(&v.to_le_bytes())
            }
            (FieldValue::Decimal(v), FieldType::Decimal) => {
                region.copy_from_slice(&v.serialize())
            }
            (FieldValue::Guid(v), FieldType::Guid) => region.copy_from_slice(v.as_bytes()),
            (FieldValue::Str(s), FieldType::String) => {
                if s.len() > d.len {
                    return Err(FieldError::FieldTooLong {
                        field: d.name,
                        len: s.len(),
                        capacity: d.len,
                    });
                }
                region.fill(0);
                region[..s.len()].copy_from_slice(s.as_bytes());
            }
            _ => {
                return Err(FieldError::TypeMismatch {
                    field: d.name,
                    expected: d.ftype,
                    actual: value.tag(),
                })
            }
        }
        Ok(())
    }

    pub fn set_by_name(&mut self, name: &str, value: FieldValue<'_>) -> Result<(), FieldError> {
        let index = self
            .index_of(name)
            .ok_or_else(|| FieldError::UnknownField(name.to_string()))?;
        self.set(index, value)
    }

    /// Render the row as delimited text, for error snapshots and debug
    /// sinks.
    pub fn render(&self, delimiter: char) -> String {
        let mut out = String::new();
        for i in 0..self.schema.len() {
            if i > 0 {
                out.push(delimiter);
            }
            match self.get(i) {
                Ok(v) => out.push_str(&v.to_string()),
                Err(_) => out.push('?'),
            }
        }
        out
    }

    fn descriptor(&self, index: usize) -> Result<&FieldDescriptor, FieldError> {
        self.schema
            .descriptor(index)
            .ok_or(FieldError::IndexOutOfRange {
                index,
                count: self.schema.len(),
            })
    }
}

fn array<const N: usize>(region: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&region[..N]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;
    use crate::types::datetime_to_ticks;
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use uuid::Uuid;

    fn every_type_schema() -> crate::schema::SchemaRef {
        Schema::builder()
            .field("i16", FieldType::Int16)
            .field("i32", FieldType::Int32)
            .field("i64", FieldType::Int64)
            .field("byte", FieldType::Byte)
            .field("f32", FieldType::Float32)
            .field("f64", FieldType::Float64)
            .field("flag", FieldType::Boolean)
            .field("when", FieldType::DateTime)
            .field("amount", FieldType::Decimal)
            .field("id", FieldType::Guid)
            .string_field("name", 32)
            .build()
            .unwrap()
    }

    #[test]
    fn round_trip_every_field_type() {
        let schema = every_type_schema();
        let mut buf = vec![0u8; schema.row_size()];
        let mut rec = Record::new(&mut buf, &schema);

        let when = datetime_to_ticks(&Utc.with_ymd_and_hms(1999, 12, 31, 23, 59, 59).unwrap());
        let amount = Decimal::from_str("-1234.5678").unwrap();
        let id = Uuid::from_u128(0x0123_4567_89ab_cdef_0123_4567_89ab_cdef);

        rec.set_by_name("i16", FieldValue::Int16(-7)).unwrap();
        rec.set_by_name("i32", FieldValue::Int32(i32::MIN)).unwrap();
        rec.set_by_name("i64", FieldValue::Int64(i64::MAX)).unwrap();
        rec.set_by_name("byte", FieldValue::Byte(0xAB)).unwrap();
        rec.set_by_name("f32", FieldValue::Float32(1.5)).unwrap();
        rec.set_by_name("f64", FieldValue::Float64(-2.25)).unwrap();
        rec.set_by_name("flag", FieldValue::Boolean(true)).unwrap();
        rec.set_by_name("when", FieldValue::DateTime(when)).unwrap();
        rec.set_by_name("amount", FieldValue::Decimal(amount)).unwrap();
        rec.set_by_name("id", FieldValue::Guid(id)).unwrap();
        rec.set_by_name("name", FieldValue::Str("snø ❄")).unwrap();

        assert_eq!(rec.get_by_name("i16").unwrap(), FieldValue::Int16(-7));
        assert_eq!(rec.get_by_name("i32").unwrap(), FieldValue::Int32(i32::MIN));
        assert_eq!(rec.get_by_name("i64").unwrap(), FieldValue::Int64(i64::MAX));
        assert_eq!(rec.get_by_name("byte").unwrap(), FieldValue::Byte(0xAB));
        assert_eq!(rec.get_by_name("f32").unwrap(), FieldValue::Float32(1.5));
        assert_eq!(rec.get_by_name("f64").unwrap(), FieldValue::Float64(-2.25));
        assert_eq!(rec.get_by_name("flag").unwrap(), FieldValue::Boolean(true));
        assert_eq!(rec.get_by_name("when").unwrap(), FieldValue::DateTime(when));
        assert_eq!(rec.get_by_name("amount").unwrap(), FieldValue::Decimal(amount));
        assert_eq!(rec.get_by_name("id").unwrap(), FieldValue::Guid(id));
        assert_eq!(rec.get_by_name("name").unwrap(), FieldValue::Str("snø ❄"));
    }

    #[test]
    fn integers_are_little_endian() {
        let schema = Schema::builder().field("n", FieldType::Int32).build().unwrap();
        let mut buf = vec![0u8; schema.row_size()];
        let mut rec = Record::new(&mut buf, &schema);
        rec.set(0, FieldValue::Int32(0x0102_0304)).unwrap();
        assert_eq!(rec.bytes(), &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn string_writes_are_nul_terminated_and_bounded() {
        let schema = Schema::builder().string_field("s", 8).build().unwrap();
        let mut buf = vec![0xFFu8; schema.row_size()];
        let mut rec = Record::new(&mut buf, &schema);

        rec.set(0, FieldValue::Str("hi")).unwrap();
        assert_eq!(rec.get(0).unwrap(), FieldValue::Str("hi"));
        assert_eq!(&rec.bytes()[..3], b"hi\0");

        // Exactly at capacity: no terminator, reads to the region end.
        rec.set(0, FieldValue::Str("12345678")).unwrap();
        assert_eq!(rec.get(0).unwrap(), FieldValue::Str("12345678"));

        let err = rec.set(0, FieldValue::Str("123456789")).unwrap_err();
        assert!(matches!(err, FieldError::FieldTooLong { capacity: 8, len: 9, .. }));
    }

    #[test]
    fn set_rejects_mismatched_tags_and_null_clears() {
        let schema = Schema::builder().field("n", FieldType::Int32).build().unwrap();
        let mut buf = vec![0u8; schema.row_size()];
        let mut rec = Record::new(&mut buf, &schema);

        rec.set(0, FieldValue::Int32(41)).unwrap();
        let err = rec.set(0, FieldValue::Int64(41)).unwrap_err();
        assert!(matches!(err, FieldError::TypeMismatch { .. }));
        // The failed write must not have touched the field.
        assert_eq!(rec.get(0).unwrap(), FieldValue::Int32(41));

        rec.set(0, FieldValue::Null).unwrap();
        assert_eq!(rec.get(0).unwrap(), FieldValue::Int32(0));
    }

    #[test]
    fn get_tag_always_matches_descriptor() {
        let schema = every_type_schema();
        let mut buf = vec![0u8; schema.row_size()];
        let rec = Record::new(&mut buf, &schema);
        for d in schema.fields() {
            assert_eq!(rec.get(d.index).unwrap().tag(), d.ftype);
        }
    }

    #[test]
    fn unknown_name_and_bad_index_fail_loudly() {
        let schema = Schema::builder().field("n", FieldType::Int32).build().unwrap();
        let mut buf = vec![0u8; schema.row_size()];
        let rec = Record::new(&mut buf, &schema);
        assert!(matches!(
            rec.get_by_name("missing").unwrap_err(),
            FieldError::UnknownField(_)
        ));
        assert!(matches!(
            rec.get(5).unwrap_err(),
            FieldError::IndexOutOfRange { index: 5, count: 1 }
        ));
    }
}
