//! Binding JSON request arguments to statement parameters.
//!
//! A JSON value carries no PostgreSQL type, so each argument is encoded
//! against the parameter type the server inferred when the statement was
//! prepared. Pairs with an unambiguous binary form are sent in binary;
//! everything else goes over in text format and is parsed by the server.

use std::error::Error;

use bytes::{BufMut, BytesMut};
use serde_json::Value;
use tokio_postgres::types::{to_sql_checked, Format, IsNull, Kind, ToSql, Type};

type BoxError = Box<dyn Error + Sync + Send>;

#[derive(Debug)]
pub struct JsonParam<'a>(pub &'a Value);

/// How a (value, type) pair goes over the wire.
#[derive(Debug, PartialEq)]
enum Encoding {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Json,
    Jsonb,
    Bytea(Vec<u8>),
    Text(String),
}

impl Encoding {
    fn classify(value: &Value, ty: &Type) -> Self {
        match (value, ty) {
            (Value::Null, _) => Encoding::Null,
            (Value::Bool(b), &Type::BOOL) => Encoding::Bool(*b),
            (Value::Number(n), &Type::INT2) => match n.as_i64().map(i16::try_from) {
                Some(Ok(v)) => Encoding::Int2(v),
                _ => Encoding::Text(n.to_string()),
            },
            (Value::Number(n), &Type::INT4) => match n.as_i64().map(i32::try_from) {
                Some(Ok(v)) => Encoding::Int4(v),
                _ => Encoding::Text(n.to_string()),
            },
            (Value::Number(n), &Type::INT8) => match n.as_i64() {
                Some(v) => Encoding::Int8(v),
                None => Encoding::Text(n.to_string()),
            },
            (Value::Number(n), &Type::FLOAT4) => match n.as_f64() {
                Some(v) => Encoding::Float4(v as f32),
                None => Encoding::Text(n.to_string()),
            },
            (Value::Number(n), &Type::FLOAT8) => match n.as_f64() {
                Some(v) => Encoding::Float8(v),
                None => Encoding::Text(n.to_string()),
            },
            // A string bound to json is the document text, not a JSON string literal.
            (Value::String(s), &Type::JSON) | (Value::String(s), &Type::JSONB) => {
                Encoding::Text(s.clone())
            }
            (_, &Type::JSON) => Encoding::Json,
            (_, &Type::JSONB) => Encoding::Jsonb,
            (Value::String(s), &Type::BYTEA) => match decode_hex_bytea(s) {
                Some(bytes) => Encoding::Bytea(bytes),
                None => Encoding::Text(s.clone()),
            },
            (Value::Array(items), ty) if matches!(ty.kind(), Kind::Array(_)) => {
                let mut literal = String::new();
                write_array_literal(items, &mut literal);
                Encoding::Text(literal)
            }
            (value, _) => Encoding::Text(text_form(value)),
        }
    }

    fn format(&self) -> Format {
        match self {
            Encoding::Text(_) => Format::Text,
            _ => Format::Binary,
        }
    }
}

impl ToSql for JsonParam<'_> {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match Encoding::classify(self.0, ty) {
            Encoding::Null => return Ok(IsNull::Yes),
            Encoding::Bool(v) => out.put_u8(u8::from(v)),
            Encoding::Int2(v) => out.put_i16(v),
            Encoding::Int4(v) => out.put_i32(v),
            Encoding::Int8(v) => out.put_i64(v),
            Encoding::Float4(v) => out.put_f32(v),
            Encoding::Float8(v) => out.put_f64(v),
            Encoding::Json => serde_json::to_writer(out.writer(), self.0)?,
            Encoding::Jsonb => {
                out.put_u8(1);
                serde_json::to_writer(out.writer(), self.0)?;
            }
            Encoding::Bytea(bytes) => out.put_slice(&bytes),
            Encoding::Text(text) => out.put_slice(text.as_bytes()),
        }
        Ok(IsNull::No)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    fn encode_format(&self, ty: &Type) -> Format {
        Encoding::classify(self.0, ty).format()
    }

    to_sql_checked!();
}

/// Wrap request arguments for `query_raw`/`execute_raw`.
pub fn bind(args: &[Value]) -> Vec<JsonParam<'_>> {
    args.iter().map(JsonParam).collect()
}

fn text_form(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(true) => "true".to_string(),
        Value::Bool(false) => "false".to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn write_array_literal(items: &[Value], out: &mut String) {
    out.push('{');
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        match item {
            Value::Null => out.push_str("NULL"),
            Value::Array(inner) => write_array_literal(inner, out),
            Value::Bool(_) | Value::Number(_) => out.push_str(&text_form(item)),
            other => {
                out.push('"');
                for c in text_form(other).chars() {
                    if c == '"' || c == '\\' {
                        out.push('\\');
                    }
                    out.push(c);
                }
                out.push('"');
            }
        }
    }
    out.push('}');
}

/// `\x`-prefixed hex text, the default bytea output format.
fn decode_hex_bytea(text: &str) -> Option<Vec<u8>> {
    let hex = text.strip_prefix("\\x")?.as_bytes();
    if hex.len() % 2 != 0 {
        return None;
    }
    hex.chunks_exact(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            Some((hi * 16 + lo) as u8)
        })
        .collect()
}
