//! Culture-aware text parsing at the adapter boundary.
//!
//! Text sources carry numbers and dates formatted for a locale; the
//! `culture` option selects how they are read. The recognized cultures are
//! a closed table; an unknown tag is a configuration error, not a silent
//! fallback.

use anyhow::{anyhow, Context};
use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
use sluice_core::error::PipelineError;
use sluice_core::record::Record;
use sluice_core::types::{datetime_to_ticks, FieldType, FieldValue};
use std::fmt::Write;

/// Numeric and date conventions for parsing text input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Culture {
    pub decimal_separator: char,
    pub group_separator: char,
    /// Day-first date order (`31/12/2024`) instead of month-first.
    pub day_first: bool,
}

impl Culture {
    pub const INVARIANT: Culture = Culture {
        decimal_separator: '.',
        group_separator: ',',
        day_first: false,
    };

    /// Resolve a configured culture tag. `None` is the invariant culture.
    pub fn resolve(tag: Option<&str>) -> Result<Culture, PipelineError> {
        let Some(tag) = tag else {
            return Ok(Culture::INVARIANT);
        };
        match tag {
            "" | "invariant" => Ok(Culture::INVARIANT),
            "en-US" | "en-CA" | "ja-JP" | "zh-CN" | "ko-KR" => Ok(Culture::INVARIANT),
            "en-GB" | "en-AU" | "en-NZ" | "en-IE" => Ok(Culture {
                decimal_separator: '.',
                group_separator: ',',
                day_first: true,
            }),
            "de-DE" | "es-ES" | "it-IT" | "nl-NL" | "pt-BR" | "da-DK" | "tr-TR" => Ok(Culture {
                decimal_separator: ',',
                group_separator: '.',
                day_first: true,
            }),
            "fr-FR" | "sv-SE" | "nb-NO" | "fi-FI" => Ok(Culture {
                decimal_separator: ',',
                group_separator: '\u{a0}',
                day_first: true,
            }),
            other => Err(PipelineError::Config(format!(
                "unrecognized culture `{other}`"
            ))),
        }
    }

    /// Strip group separators and normalize the decimal separator into
    /// `scratch`, returning the slice to hand to Rust's parsers.
    fn normalize<'s>(&self, text: &str, scratch: &'s mut String) -> &'s str {
        scratch.clear();
        for c in text.chars() {
            if c == self.group_separator {
                continue;
            }
            scratch.push(if c == self.decimal_separator { '.' } else { c });
        }
        scratch
    }
}

/// Parse `text` into the `index`-th field of `record` according to the
/// field's type. Empty text clears the field. `scratch` backs numeric
/// normalization and is reused across rows.
pub fn write_field(
    record: &mut Record<'_>,
    index: usize,
    text: &str,
    culture: &Culture,
    scratch: &mut String,
) -> anyhow::Result<()> {
    let descriptor = record
        .schema()
        .descriptor(index)
        .ok_or_else(|| anyhow!("no field at index {index}"))?;
    let ftype = descriptor.ftype;
    let name = descriptor.name.clone();

    if text.is_empty() && ftype != FieldType::String {
        record.set(index, FieldValue::Null)?;
        return Ok(());
    }

    let value = match ftype {
        FieldType::Null => FieldValue::Null,
        FieldType::String => FieldValue::Str(text),
        FieldType::Boolean => FieldValue::Boolean(parse_bool(text).with_context(|| {
            format!("field `{name}`: `{text}` is not a boolean")
        })?),
        FieldType::Byte => FieldValue::Byte(
            parse_int(text, culture, scratch)
                .and_then(|n| u8::try_from(n).ok())
                .with_context(|| format!("field `{name}`: `{text}` is not a byte"))?,
        ),
        FieldType::Int16 => FieldValue::Int16(
            parse_int(text, culture, scratch)
                .and_then(|n| i16::try_from(n).ok())
                .with_context(|| format!("field `{name}`: `{text}` is not an int16"))?,
        ),
        FieldType::Int32 => FieldValue::Int32(
            parse_int(text, culture, scratch)
                .and_then(|n| i32::try_from(n).ok())
                .with_context(|| format!("field `{name}`: `{text}` is not an int32"))?,
        ),
        FieldType::Int64 => FieldValue::Int64(
            parse_int(text, culture, scratch)
                .with_context(|| format!("field `{name}`: `{text}` is not an int64"))?,
        ),
        FieldType::Float32 => FieldValue::Float32(
            parse_float(text, culture, scratch)
                .with_context(|| format!("field `{name}`: `{text}` is not a float32"))?
                as f32,
        ),
        FieldType::Float64 => FieldValue::Float64(
            parse_float(text, culture, scratch)
                .with_context(|| format!("field `{name}`: `{text}` is not a float64"))?,
        ),
        FieldType::Decimal => FieldValue::Decimal(
            culture
                .normalize(text, scratch)
                .parse()
                .ok()
                .with_context(|| format!("field `{name}`: `{text}` is not a decimal"))?,
        ),
        FieldType::DateTime => FieldValue::DateTime(
            parse_datetime(text, culture)
                .with_context(|| format!("field `{name}`: `{text}` is not a datetime"))?,
        ),
        FieldType::Guid => FieldValue::Guid(
            text.parse()
                .ok()
                .with_context(|| format!("field `{name}`: `{text}` is not a guid"))?,
        ),
    };
    record.set(index, value)?;
    Ok(())
}

fn parse_bool(text: &str) -> Option<bool> {
    match text {
        "1" => Some(true),
        "0" => Some(false),
        _ if text.eq_ignore_ascii_case("true") => Some(true),
        _ if text.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

fn parse_int(text: &str, culture: &Culture, scratch: &mut String) -> Option<i64> {
    culture.normalize(text, scratch).parse().ok()
}

fn parse_float(text: &str, culture: &Culture, scratch: &mut String) -> Option<f64> {
    culture.normalize(text, scratch).parse().ok()
}

/// ISO forms always parse; slash-separated dates follow the culture's day
/// order.
pub fn parse_datetime(text: &str, culture: &Culture) -> Option<i64> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(text) {
        return Some(datetime_to_ticks(&dt.with_timezone(&Utc)));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(datetime_to_ticks(&Utc.from_utc_datetime(&naive)));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return ticks_at_midnight(date);
    }
    let slashed = if culture.day_first {
        ["%d/%m/%Y %H:%M:%S", "%d/%m/%Y"]
    } else {
        ["%m/%d/%Y %H:%M:%S", "%m/%d/%Y"]
    };
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, slashed[0]) {
        return Some(datetime_to_ticks(&Utc.from_utc_datetime(&naive)));
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, slashed[1]) {
        return ticks_at_midnight(date);
    }
    None
}

fn ticks_at_midnight(date: NaiveDate) -> Option<i64> {
    let naive = date.and_hms_opt(0, 0, 0)?;
    Some(datetime_to_ticks(&Utc.from_utc_datetime(&naive)))
}

/// Render one field into `scratch` for text sinks.
pub fn render_field(value: &FieldValue<'_>, scratch: &mut String) {
    scratch.clear();
    let _ = write!(scratch, "{value}");
}
