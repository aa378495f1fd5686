use crate::native::Variant;

use serde::ser::{Serialize, Serializer};
use std::fmt;

/// Placeholder rendered for values of a native type without a typed representation.
pub const UNKNOWN_VALUE: &str = "?";

/// A typed user-data value of a rendered record.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    Boolean(bool),
    /// Raw bytes as uppercase hex, two digits per byte.
    Binary(String),
    /// The native type tag of a value that has no typed representation.
    Unknown(u32),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::Int8(_) => "int8",
            Value::UInt8(_) => "uint8",
            Value::Int16(_) => "int16",
            Value::UInt16(_) => "uint16",
            Value::Int32(_) => "int32",
            Value::UInt32(_) => "uint32",
            Value::Int64(_) => "int64",
            Value::UInt64(_) => "uint64",
            Value::Float32(_) => "float32",
            Value::Float64(_) => "float64",
            Value::Boolean(_) => "boolean",
            Value::Binary(_) => "binary",
            Value::Unknown(_) => "unknown",
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Value::Unknown(_))
    }
}

pub(crate) fn to_hex_upper(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out += &format!("{:02X}", byte);
    }
    out
}

impl From<Variant> for Value {
    fn from(variant: Variant) -> Self {
        match variant {
            Variant::String(s) | Variant::AnsiString(s) => Value::String(s),
            Variant::SByte(v) => Value::Int8(v),
            Variant::Byte(v) => Value::UInt8(v),
            Variant::Int16(v) => Value::Int16(v),
            Variant::UInt16(v) => Value::UInt16(v),
            Variant::Int32(v) => Value::Int32(v),
            Variant::UInt32(v) | Variant::HexInt32(v) => Value::UInt32(v),
            Variant::Int64(v) => Value::Int64(v),
            Variant::UInt64(v) | Variant::SizeT(v) | Variant::HexInt64(v) => Value::UInt64(v),
            Variant::Single(v) => Value::Float32(v),
            Variant::Double(v) => Value::Float64(v),
            Variant::Boolean(v) => Value::Boolean(v),
            Variant::Binary(bytes) => Value::Binary(to_hex_upper(&bytes)),
            other => Value::Unknown(other.type_tag()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) | Value::Binary(s) => f.write_str(s),
            Value::Int8(v) => write!(f, "{}", v),
            Value::UInt8(v) => write!(f, "{}", v),
            Value::Int16(v) => write!(f, "{}", v),
            Value::UInt16(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::UInt32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::UInt64(v) => write!(f, "{}", v),
            Value::Float32(v) => write!(f, "{}", v),
            Value::Float64(v) => write!(f, "{}", v),
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Unknown(_) => f.write_str(UNKNOWN_VALUE),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::String(s) | Value::Binary(s) => serializer.serialize_str(s),
            Value::Int8(v) => serializer.serialize_i8(*v),
            Value::UInt8(v) => serializer.serialize_u8(*v),
            Value::Int16(v) => serializer.serialize_i16(*v),
            Value::UInt16(v) => serializer.serialize_u16(*v),
            Value::Int32(v) => serializer.serialize_i32(*v),
            Value::UInt32(v) => serializer.serialize_u32(*v),
            Value::Int64(v) => serializer.serialize_i64(*v),
            Value::UInt64(v) => serializer.serialize_u64(*v),
            Value::Float32(v) => serializer.serialize_f32(*v),
            Value::Float64(v) => serializer.serialize_f64(*v),
            Value::Boolean(v) => serializer.serialize_bool(*v),
            Value::Unknown(_) => serializer.serialize_str(UNKNOWN_VALUE),
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(value: &Value) -> Self {
        match value {
            Value::String(s) | Value::Binary(s) => serde_json::Value::String(s.clone()),
            Value::Int8(v) => serde_json::Value::from(*v),
            Value::UInt8(v) => serde_json::Value::from(*v),
            Value::Int16(v) => serde_json::Value::from(*v),
            Value::UInt16(v) => serde_json::Value::from(*v),
            Value::Int32(v) => serde_json::Value::from(*v),
            Value::UInt32(v) => serde_json::Value::from(*v),
            Value::Int64(v) => serde_json::Value::from(*v),
            Value::UInt64(v) => serde_json::Value::from(*v),
            // Non-finite floats have no JSON representation and become `null`.
            Value::Float32(v) => serde_json::Value::from(*v),
            Value::Float64(v) => serde_json::Value::from(*v),
            Value::Boolean(v) => serde_json::Value::Bool(*v),
            Value::Unknown(_) => serde_json::Value::String(UNKNOWN_VALUE.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_integers_widen_losslessly() {
        assert_eq!(Value::from(Variant::SByte(-128)), Value::Int8(-128));
        assert_eq!(Value::from(Variant::UInt64(u64::MAX)), Value::UInt64(u64::MAX));
        assert_eq!(Value::from(Variant::HexInt32(0xdead)), Value::UInt32(0xdead));
        assert_eq!(Value::from(Variant::SizeT(4096)), Value::UInt64(4096));
    }

    #[test]
    fn test_binary_renders_actual_bytes() {
        let value = Value::from(Variant::Binary(vec![0x00, 0x0a, 0xff]));
        assert_eq!(value, Value::Binary("000AFF".to_string()));
        assert_eq!(value.to_string(), "000AFF");
    }

    #[test]
    fn test_untyped_values_render_placeholder() {
        for variant in [
            Variant::Null,
            Variant::Guid([0; 16]),
            Variant::FileTime(0),
            Variant::Sid(vec![1, 0, 0, 0, 0, 0, 0, 5]),
            Variant::Unsupported(35),
        ] {
            let value = Value::from(variant);
            assert!(value.is_unknown());
            assert_eq!(value.to_string(), "?");
            assert_eq!(serde_json::Value::from(&value), json!("?"));
        }
    }

    #[test]
    fn test_json_conversion_keeps_types() {
        let values = vec![
            Value::String("svc".to_string()),
            Value::Int32(-5),
            Value::Float64(1.5),
            Value::Boolean(true),
        ];
        let converted: Vec<serde_json::Value> = values.iter().map(serde_json::Value::from).collect();

        assert_eq!(converted, vec![json!("svc"), json!(-5), json!(1.5), json!(true)]);
        assert_eq!(
            serde_json::to_value(&values).unwrap(),
            json!(["svc", -5, 1.5, true])
        );
    }
}
