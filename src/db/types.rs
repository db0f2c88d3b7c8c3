//! Result value decoding.
//!
//! Values arrive from the backend in text form and are turned into JSON by a
//! decoder registered for the column's type identifier. Registration is
//! explicit: [`Decoders::standard`] builds the table once and clients share it
//! through [`Decoders::shared`]. Columns without a registered decoder come back
//! as strings.
//!
//! 64-bit integers, floating-point and numeric values (and arrays of them) are
//! returned as JSON numbers rather than text. Integral values are emitted as
//! integers; fractional values accept the loss of precision beyond an `f64`.
//!
//! A backend may hand over values it already decoded itself (`bytea` as
//! binary, one-dimensional arrays as JSON); those bypass the table. The array
//! literal parser here covers what is left, such as multi-dimensional arrays.

use crate::db::backend::{RawRow, RawValue};
use serde_json::{Map, Number, Value as JsonValue};
use std::collections::HashMap;
use std::iter::Peekable;
use std::str::Chars;
use std::sync::{Arc, OnceLock};

/// A decoded row, keyed by column name.
pub type JsonRow = Map<String, JsonValue>;

/// Decodes the text form of one value.
pub type DecodeFn = fn(&str) -> JsonValue;

/// Well-known type identifiers used by the standard decoders.
pub mod oid {
    pub const BOOL: u32 = 16;
    pub const BYTEA: u32 = 17;
    pub const INT8: u32 = 20;
    pub const INT2: u32 = 21;
    pub const INT4: u32 = 23;
    pub const OID: u32 = 26;
    pub const JSON: u32 = 114;
    pub const FLOAT4: u32 = 700;
    pub const FLOAT8: u32 = 701;
    pub const BOOL_ARRAY: u32 = 1000;
    pub const INT2_ARRAY: u32 = 1005;
    pub const INT4_ARRAY: u32 = 1007;
    pub const TEXT_ARRAY: u32 = 1009;
    pub const VARCHAR_ARRAY: u32 = 1015;
    pub const INT8_ARRAY: u32 = 1016;
    pub const FLOAT4_ARRAY: u32 = 1021;
    pub const FLOAT8_ARRAY: u32 = 1022;
    pub const NUMERIC_ARRAY: u32 = 1231;
    pub const NUMERIC: u32 = 1700;
    pub const JSONB: u32 = 3802;
}

/// Type identifier to decoder table.
#[derive(Debug, Clone, Default)]
pub struct Decoders {
    by_type: HashMap<u32, DecodeFn>,
}

impl Decoders {
    /// An empty table: every value decodes to a string.
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard table.
    pub fn standard() -> Self {
        let mut decoders = Self::new();

        for type_id in [oid::INT8, oid::FLOAT4, oid::FLOAT8, oid::NUMERIC] {
            decoders.register(type_id, decode_float);
        }
        for type_id in [
            oid::INT8_ARRAY,
            oid::FLOAT4_ARRAY,
            oid::FLOAT8_ARRAY,
            oid::NUMERIC_ARRAY,
        ] {
            decoders.register(type_id, decode_float_array);
        }

        for type_id in [oid::INT2, oid::INT4, oid::OID] {
            decoders.register(type_id, decode_int);
        }
        decoders.register(oid::INT2_ARRAY, decode_int_array);
        decoders.register(oid::INT4_ARRAY, decode_int_array);
        decoders.register(oid::BOOL, decode_bool);
        decoders.register(oid::BOOL_ARRAY, decode_bool_array);
        decoders.register(oid::JSON, decode_json);
        decoders.register(oid::JSONB, decode_json);
        decoders.register(oid::TEXT_ARRAY, decode_text_array);
        decoders.register(oid::VARCHAR_ARRAY, decode_text_array);

        decoders
    }

    /// The standard table, built once per process.
    pub fn shared() -> Arc<Decoders> {
        static SHARED: OnceLock<Arc<Decoders>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(Decoders::standard())).clone()
    }

    /// Register (or replace) the decoder for a type identifier.
    pub fn register(&mut self, type_id: u32, decoder: DecodeFn) -> &mut Self {
        self.by_type.insert(type_id, decoder);
        self
    }

    pub fn is_registered(&self, type_id: u32) -> bool {
        self.by_type.contains_key(&type_id)
    }

    /// Decode one non-null value.
    pub fn decode(&self, type_id: u32, value: &RawValue) -> JsonValue {
        match value {
            RawValue::Text(text) => match self.by_type.get(&type_id) {
                Some(decoder) => decoder(text),
                None => JsonValue::String(text.clone()),
            },
            RawValue::Binary(bytes) => encode_binary(bytes),
            RawValue::Decoded { value, .. } => value.clone(),
        }
    }

    /// Decode a whole row into a JSON object.
    pub fn decode_row(&self, row: &RawRow) -> JsonRow {
        row.columns
            .iter()
            .zip(&row.values)
            .map(|(column, value)| {
                let decoded = match value {
                    Some(value) => self.decode(column.type_id, value),
                    None => JsonValue::Null,
                };
                (column.name.clone(), decoded)
            })
            .collect()
    }
}

/// Binary values are returned base64 encoded.
fn encode_binary(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    JsonValue::String(STANDARD.encode(bytes))
}

/// Largest integer an `f64` holds exactly.
const MAX_EXACT_F64_INT: f64 = 9_007_199_254_740_992.0;

/// JSON number for a float: integral values as integers, so `3.0` is written
/// as `3`. NaN and infinities have no JSON number form.
pub fn number_from_f64(value: f64) -> Option<Number> {
    if value.fract() == 0.0 && value.abs() <= MAX_EXACT_F64_INT {
        Some(Number::from(value as i64))
    } else {
        Number::from_f64(value)
    }
}

/// Float as JSON, falling back to its text for NaN and infinities.
pub fn float_value(value: f64) -> JsonValue {
    match number_from_f64(value) {
        Some(number) => JsonValue::Number(number),
        None => JsonValue::String(value.to_string()),
    }
}

fn decode_float(text: &str) -> JsonValue {
    let trimmed = text.trim();
    if let Ok(n) = trimmed.parse::<i64>() {
        return JsonValue::Number(n.into());
    }
    trimmed
        .parse::<f64>()
        .ok()
        .and_then(number_from_f64)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(text.to_string()))
}

fn decode_int(text: &str) -> JsonValue {
    match text.trim().parse::<i64>() {
        Ok(n) => JsonValue::Number(n.into()),
        Err(_) => JsonValue::String(text.to_string()),
    }
}

fn decode_bool(text: &str) -> JsonValue {
    match text {
        "t" | "true" => JsonValue::Bool(true),
        "f" | "false" => JsonValue::Bool(false),
        other => JsonValue::String(other.to_string()),
    }
}

fn decode_json(text: &str) -> JsonValue {
    serde_json::from_str(text).unwrap_or_else(|_| JsonValue::String(text.to_string()))
}

fn decode_text(text: &str) -> JsonValue {
    JsonValue::String(text.to_string())
}

fn decode_float_array(text: &str) -> JsonValue {
    parse_array(text, decode_float)
}

fn decode_int_array(text: &str) -> JsonValue {
    parse_array(text, decode_int)
}

fn decode_bool_array(text: &str) -> JsonValue {
    parse_array(text, decode_bool)
}

fn decode_text_array(text: &str) -> JsonValue {
    parse_array(text, decode_text)
}

/// Parse an array literal such as `{1,2,NULL}` or `{{"a b","c"},{d,e}}`.
///
/// Unparseable input is returned unchanged as a string.
pub fn parse_array(text: &str, element: DecodeFn) -> JsonValue {
    // Skip an explicit dimension decoration: [1:3]={1,2,3}
    let body = match text.find('=') {
        Some(idx) if text.starts_with('[') => &text[idx + 1..],
        _ => text,
    };

    let mut chars = body.trim().chars().peekable();
    match parse_array_level(&mut chars, element) {
        Some(value) if chars.next().is_none() => value,
        _ => JsonValue::String(text.to_string()),
    }
}

fn parse_array_level(chars: &mut Peekable<Chars<'_>>, element: DecodeFn) -> Option<JsonValue> {
    if chars.next()? != '{' {
        return None;
    }

    let mut items = Vec::new();
    if chars.peek() == Some(&'}') {
        chars.next();
        return Some(JsonValue::Array(items));
    }

    loop {
        let item = match *chars.peek()? {
            '{' => parse_array_level(chars, element)?,
            '"' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next()? {
                        '\\' => text.push(chars.next()?),
                        '"' => break,
                        c => text.push(c),
                    }
                }
                element(&text)
            }
            _ => {
                let mut text = String::new();
                while let Some(&c) = chars.peek() {
                    if c == ',' || c == '}' {
                        break;
                    }
                    text.push(c);
                    chars.next();
                }
                let text = text.trim();
                if text.eq_ignore_ascii_case("NULL") {
                    JsonValue::Null
                } else {
                    element(text)
                }
            }
        };
        items.push(item);

        match chars.next()? {
            ',' => continue,
            '}' => return Some(JsonValue::Array(items)),
            _ => return None,
        }
    }
}
