//! Dynamic message codec.
//!
//! Converts between host values (`serde_json::Value`) and protobuf wire
//! bytes using only run-time descriptors. Messages are built as
//! [`DynamicMessage`]s field by field, checked against the descriptor on
//! every access.
//!
//! Framing is split in two phases: the frame decoder captures each payload
//! into a [`DeferredFrame`] (an owned copy), and the caller decodes it later
//! with the descriptor of the method it called.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use bytes::Bytes;
use prost::Message;
use prost_reflect::{
    DynamicMessage, FieldDescriptor, Kind, MessageDescriptor, ReflectMessage, Value as ProtoValue,
};
use serde_json::{Map, Number, Value};

use crate::ClientError;

/// Encode a host value as a message of type `desc`.
///
/// Unknown keys are ignored; missing keys and `null` leave the field at its
/// zero value.
pub fn encode(desc: &MessageDescriptor, value: &Value) -> Result<Bytes, ClientError> {
    let message = to_dynamic(desc, value)?;
    Ok(Bytes::from(marshal(&message)))
}

/// Decode wire bytes of type `desc` into a host value.
pub fn decode(desc: &MessageDescriptor, bytes: &[u8]) -> Result<Value, ClientError> {
    let mut message = DynamicMessage::new(desc.clone());
    message.unmarshal(bytes)?;
    from_dynamic(&message)
}

/// Serialize a message. Fields are written in field-number order, so equal
/// messages always produce equal bytes.
pub fn marshal(message: &DynamicMessage) -> Vec<u8> {
    message.encode_to_vec()
}

/// Transport-facing unmarshal target.
pub trait Unmarshal {
    /// Consume one frame payload. `src` is only valid for the duration of
    /// the call.
    fn unmarshal(&mut self, src: &[u8]) -> Result<(), ClientError>;
}

/// Verbatim copy of one frame payload, decoded once the schema is known.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeferredFrame {
    bytes: Bytes,
}

impl DeferredFrame {
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Decode the captured bytes as a message of type `desc`.
    pub fn decode(&self, desc: &MessageDescriptor) -> Result<Value, ClientError> {
        decode(desc, &self.bytes)
    }
}

impl Unmarshal for DeferredFrame {
    fn unmarshal(&mut self, src: &[u8]) -> Result<(), ClientError> {
        self.bytes = Bytes::copy_from_slice(src);
        Ok(())
    }
}

impl Unmarshal for DynamicMessage {
    fn unmarshal(&mut self, src: &[u8]) -> Result<(), ClientError> {
        self.merge(src).map_err(|e| {
            ClientError::Decode(format!("{}: {}", self.descriptor().full_name(), e))
        })
    }
}

/// Build a [`DynamicMessage`] from a host value.
pub fn to_dynamic(desc: &MessageDescriptor, value: &Value) -> Result<DynamicMessage, ClientError> {
    let empty = Map::new();
    let object = match value {
        Value::Object(object) => object,
        Value::Null => &empty,
        other => {
            return Err(ClientError::Encode(format!(
                "{}: expected an object, got {}",
                desc.full_name(),
                type_name(other)
            )));
        }
    };

    let mut message = DynamicMessage::new(desc.clone());
    for field in desc.fields() {
        let Some(value) = object
            .get(field.name())
            .or_else(|| object.get(field.json_name()))
        else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        check_supported(&field)?;

        let proto = if field.is_list() {
            let Value::Array(items) = value else {
                return Err(ClientError::Encode(format!(
                    "{}: expected an array, got {}",
                    field.full_name(),
                    type_name(value)
                )));
            };
            let items = items
                .iter()
                .map(|item| to_proto_value(&field, &field.kind(), item))
                .collect::<Result<Vec<_>, _>>()?;
            ProtoValue::List(items)
        } else {
            to_proto_value(&field, &field.kind(), value)?
        };

        message
            .try_set_field(&field, proto)
            .map_err(|e| ClientError::Encode(format!("{}: {}", field.full_name(), e)))?;
    }
    Ok(message)
}

/// Convert a [`DynamicMessage`] into a host value.
///
/// Every non-oneof field is emitted, unpopulated ones with their zero value;
/// keys are JSON field names.
pub fn from_dynamic(message: &DynamicMessage) -> Result<Value, ClientError> {
    let desc = message.descriptor();
    let mut object = Map::new();

    for field in desc.fields() {
        let populated = message.has_field(&field);
        if !populated && field.containing_oneof().is_some() {
            continue;
        }
        if check_supported(&field).is_err() {
            if populated {
                check_supported(&field)?;
            }
            continue;
        }

        let value = if !populated && !field.is_list() && matches!(field.kind(), Kind::Message(_)) {
            Value::Null
        } else {
            let proto = message.get_field(&field);
            match proto.as_ref() {
                ProtoValue::List(items) => Value::Array(
                    items
                        .iter()
                        .map(|item| from_proto_value(&field, item))
                        .collect::<Result<Vec<_>, _>>()?,
                ),
                single => from_proto_value(&field, single)?,
            }
        };
        object.insert(field.json_name().to_string(), value);
    }

    Ok(Value::Object(object))
}

fn check_supported(field: &FieldDescriptor) -> Result<(), ClientError> {
    let kind = if field.is_map() {
        "map"
    } else if field.is_group() {
        "group"
    } else {
        return Ok(());
    };
    Err(ClientError::UnsupportedKind {
        field: field.full_name().to_string(),
        kind: kind.to_string(),
    })
}

fn to_proto_value(field: &FieldDescriptor, kind: &Kind, value: &Value) -> Result<ProtoValue, ClientError> {
    let mismatch = || {
        ClientError::Encode(format!(
            "{}: cannot use {} as {}",
            field.full_name(),
            type_name(value),
            kind_name(kind)
        ))
    };
    let out_of_range = || ClientError::Encode(format!("{}: value out of range", field.full_name()));

    let converted = match kind {
        Kind::Bool => ProtoValue::Bool(value.as_bool().ok_or_else(mismatch)?),
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => {
            let n = as_integer(value).ok_or_else(mismatch)?;
            ProtoValue::I32(i32::try_from(n).map_err(|_| out_of_range())?)
        }
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => {
            let n = as_integer(value).ok_or_else(mismatch)?;
            ProtoValue::I64(i64::try_from(n).map_err(|_| out_of_range())?)
        }
        Kind::Uint32 | Kind::Fixed32 => {
            let n = as_integer(value).ok_or_else(mismatch)?;
            ProtoValue::U32(u32::try_from(n).map_err(|_| out_of_range())?)
        }
        Kind::Uint64 | Kind::Fixed64 => {
            let n = as_integer(value).ok_or_else(mismatch)?;
            ProtoValue::U64(u64::try_from(n).map_err(|_| out_of_range())?)
        }
        Kind::Float => {
            let n = as_float(value).ok_or_else(mismatch)?;
            if n.is_finite() && n.abs() > f32::MAX as f64 {
                return Err(out_of_range());
            }
            ProtoValue::F32(n as f32)
        }
        Kind::Double => ProtoValue::F64(as_float(value).ok_or_else(mismatch)?),
        Kind::String => ProtoValue::String(value.as_str().ok_or_else(mismatch)?.to_string()),
        Kind::Bytes => {
            let encoded = value.as_str().ok_or_else(mismatch)?;
            ProtoValue::Bytes(Bytes::from(decode_base64(encoded).ok_or_else(|| {
                ClientError::Encode(format!("{}: invalid base64", field.full_name()))
            })?))
        }
        Kind::Enum(enum_desc) => match value {
            Value::String(name) => {
                let number = enum_desc
                    .get_value_by_name(name)
                    .map(|v| v.number())
                    .ok_or_else(|| {
                        ClientError::Encode(format!(
                            "{}: unknown value {:?} for enum {}",
                            field.full_name(),
                            name,
                            enum_desc.full_name()
                        ))
                    })?;
                ProtoValue::EnumNumber(number)
            }
            _ => {
                let n = as_integer(value).ok_or_else(mismatch)?;
                ProtoValue::EnumNumber(i32::try_from(n).map_err(|_| out_of_range())?)
            }
        },
        Kind::Message(nested) => ProtoValue::Message(to_dynamic(nested, value)?),
    };
    Ok(converted)
}

fn from_proto_value(field: &FieldDescriptor, value: &ProtoValue) -> Result<Value, ClientError> {
    let converted = match value {
        ProtoValue::Bool(b) => Value::Bool(*b),
        ProtoValue::I32(n) => Value::from(*n),
        ProtoValue::I64(n) => Value::from(*n),
        ProtoValue::U32(n) => Value::from(*n),
        ProtoValue::U64(n) => Value::from(*n),
        ProtoValue::F32(n) => float_value(widen_f32(*n)),
        ProtoValue::F64(n) => float_value(*n),
        ProtoValue::String(s) => Value::String(s.clone()),
        ProtoValue::Bytes(b) => Value::String(STANDARD.encode(b)),
        ProtoValue::EnumNumber(n) => Value::from(*n),
        ProtoValue::Message(nested) => from_dynamic(nested)?,
        ProtoValue::List(_) | ProtoValue::Map(_) => {
            return Err(ClientError::UnsupportedKind {
                field: field.full_name().to_string(),
                kind: "nested collection".to_string(),
            });
        }
    };
    Ok(converted)
}

/// Widen through the shortest decimal form so `0.1f32` reads back as `0.1`.
fn widen_f32(n: f32) -> f64 {
    if n.is_finite() {
        n.to_string().parse().unwrap_or(n as f64)
    } else {
        n as f64
    }
}

fn float_value(n: f64) -> Value {
    if n.is_nan() {
        Value::String("NaN".into())
    } else if n == f64::INFINITY {
        Value::String("Infinity".into())
    } else if n == f64::NEG_INFINITY {
        Value::String("-Infinity".into())
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn as_integer(value: &Value) -> Option<i128> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .map(i128::from)
            .or_else(|| n.as_u64().map(i128::from))
            .or_else(|| {
                n.as_f64()
                    .filter(|f| f.is_finite() && f.fract() == 0.0 && f.abs() < 1e38)
                    .map(|f| f as i128)
            }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => match s.as_str() {
            "NaN" => Some(f64::NAN),
            "Infinity" => Some(f64::INFINITY),
            "-Infinity" => Some(f64::NEG_INFINITY),
            other => other.trim().parse().ok(),
        },
        _ => None,
    }
}

fn decode_base64(input: &str) -> Option<Vec<u8>> {
    let input = input.trim();
    STANDARD
        .decode(input)
        .or_else(|_| STANDARD_NO_PAD.decode(input))
        .or_else(|_| URL_SAFE.decode(input))
        .or_else(|_| URL_SAFE_NO_PAD.decode(input))
        .ok()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn kind_name(kind: &Kind) -> &'static str {
    match kind {
        Kind::Double => "double",
        Kind::Float => "float",
        Kind::Int32 => "int32",
        Kind::Int64 => "int64",
        Kind::Uint32 => "uint32",
        Kind::Uint64 => "uint64",
        Kind::Sint32 => "sint32",
        Kind::Sint64 => "sint64",
        Kind::Fixed32 => "fixed32",
        Kind::Fixed64 => "fixed64",
        Kind::Sfixed32 => "sfixed32",
        Kind::Sfixed64 => "sfixed64",
        Kind::Bool => "bool",
        Kind::String => "string",
        Kind::Bytes => "bytes",
        Kind::Message(_) => "message",
        Kind::Enum(_) => "enum",
    }
}
