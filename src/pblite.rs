//! The "JSON-array protobuf" (pblite) codec.
//!
//! A protobuf message is encoded as a sparse JSON array where index `i`
//! holds the value of field number `i+1`; omitted fields are `null` and
//! trailing nulls are trimmed. Nested messages become nested arrays unless
//! the binary-override table says otherwise, in which case the field is
//! opaque binary (base64) regardless of its declared type.
//!
//! This core does not carry generated protobuf stubs — those are an
//! external concern — so `PbMessage`/`PbValue` is a small dynamic tree
//! that stands in for a generated message: wire structs in [`crate::wire`]
//! build and read one of these per RPC.

use std::collections::HashSet;
use std::sync::OnceLock;

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use serde_json::Value;

use crate::error::{Result, TachyonError};

// ─── Dynamic message tree ────────────────────────────────────────────────────

/// A decoded or to-be-encoded protobuf value, independent of wire format.
#[derive(Debug, Clone, PartialEq)]
pub enum PbValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Message(PbMessage),
    Repeated(Vec<PbValue>),
}

/// A protobuf message: a fully-qualified name (for binary-override lookup)
/// and a sparse set of (field_number, value) pairs. Field numbers are
/// 1-based, matching the wire protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct PbMessage {
    pub name: &'static str,
    pub fields: Vec<(u32, PbValue)>,
}

impl PbMessage {
    pub fn new(name: &'static str) -> Self {
        Self { name, fields: Vec::new() }
    }

    pub fn set(mut self, field: u32, value: PbValue) -> Self {
        self.fields.push((field, value));
        self
    }

    pub fn set_opt(self, field: u32, value: Option<PbValue>) -> Self {
        match value {
            Some(v) => self.set(field, v),
            None => self,
        }
    }

    pub fn get(&self, field: u32) -> Option<&PbValue> {
        self.fields.iter().find(|(n, _)| *n == field).map(|(_, v)| v)
    }
}

/// A non-recursive field-shape descriptor used to decode a pblite array
/// back into a [`PbMessage`], since this core has no compiled protobuf
/// schema to consult at decode time.
#[derive(Debug, Clone)]
pub enum FieldKind {
    Bool,
    Int,
    UInt,
    Float,
    Str,
    Bytes,
    Message(&'static str, Vec<(u32, FieldKind)>),
    Repeated(Box<FieldKind>),
}

// ─── Binary override table ───────────────────────────────────────────────────

/// Fields whose wire value is always opaque binary, regardless of the
/// declared protobuf type. Data, not per-type polymorphism.
fn binary_overrides() -> &'static HashSet<(&'static str, u32)> {
    static TABLE: OnceLock<HashSet<(&'static str, u32)>> = OnceLock::new();
    TABLE.get_or_init(|| {
        HashSet::from([
            ("authentication.SignInGaiaRequest.Inner", 36),
            ("authentication.SignInGaiaResponse", 2),
            ("authentication.RPCGaiaData.UnknownContainer.Item2.Item1", 1),
            ("authentication.RPCGaiaData.UnknownContainer.Item4", 1),
            ("authentication.RPCGaiaData.UnknownContainer.Item4", 8),
            ("rpc.OutgoingRPCMessage", 9),
        ])
    })
}

fn is_binary_override(message_name: &str, field: u32) -> bool {
    binary_overrides().contains(&(message_name, field))
}

// ─── Encode ───────────────────────────────────────────────────────────────────

/// Encode a [`PbMessage`] to its pblite JSON-array representation.
pub fn encode(msg: &PbMessage) -> Value {
    let max_field = msg.fields.iter().map(|(n, _)| *n).max().unwrap_or(0);
    let mut arr = vec![Value::Null; max_field as usize];
    for (field, value) in &msg.fields {
        arr[(*field - 1) as usize] = encode_value(msg.name, *field, value);
    }
    while matches!(arr.last(), Some(Value::Null)) {
        arr.pop();
    }
    Value::Array(arr)
}

fn encode_value(message_name: &str, field: u32, value: &PbValue) -> Value {
    match value {
        PbValue::Bool(b) => Value::Bool(*b),
        PbValue::Int(i) => Value::from(*i),
        PbValue::UInt(u) => Value::from(*u),
        PbValue::Float(f) => Value::from(*f),
        PbValue::Str(s) => {
            if is_binary_override(message_name, field) {
                Value::String(B64.encode(s.as_bytes()))
            } else {
                Value::String(s.clone())
            }
        }
        PbValue::Bytes(b) => Value::String(B64.encode(b)),
        PbValue::Message(inner) => {
            if is_binary_override(message_name, field) {
                Value::String(B64.encode(wire::encode_message(inner)))
            } else {
                encode(inner)
            }
        }
        PbValue::Repeated(items) => {
            Value::Array(items.iter().map(|v| encode_value(message_name, field, v)).collect())
        }
    }
}

// ─── Decode ───────────────────────────────────────────────────────────────────

/// Decode a pblite JSON-array `value` into a [`PbMessage`] following
/// `schema`. Missing trailing entries decode as field-absent, matching
/// encode's null-trimming.
pub fn decode(name: &'static str, value: &Value, schema: &[(u32, FieldKind)]) -> Result<PbMessage> {
    let arr = value
        .as_array()
        .ok_or_else(|| TachyonError::Codec(format!("{name}: expected a JSON array")))?;

    let mut msg = PbMessage::new(name);
    for (field, kind) in schema {
        let idx = (*field - 1) as usize;
        let Some(raw) = arr.get(idx) else { continue };
        if raw.is_null() {
            continue;
        }
        let decoded = decode_value(name, *field, raw, kind)?;
        msg.fields.push((*field, decoded));
    }
    Ok(msg)
}

fn decode_value(message_name: &str, field: u32, raw: &Value, kind: &FieldKind) -> Result<PbValue> {
    match kind {
        FieldKind::Bool => raw
            .as_bool()
            .map(PbValue::Bool)
            .ok_or_else(|| TachyonError::Codec(format!("field {field}: expected bool"))),
        FieldKind::Int => raw
            .as_i64()
            .map(PbValue::Int)
            .ok_or_else(|| TachyonError::Codec(format!("field {field}: expected int"))),
        FieldKind::UInt => raw
            .as_u64()
            .map(PbValue::UInt)
            .ok_or_else(|| TachyonError::Codec(format!("field {field}: expected uint"))),
        FieldKind::Float => raw
            .as_f64()
            .map(PbValue::Float)
            .ok_or_else(|| TachyonError::Codec(format!("field {field}: expected float"))),
        FieldKind::Str => {
            let s = raw
                .as_str()
                .ok_or_else(|| TachyonError::Codec(format!("field {field}: expected string")))?;
            if is_binary_override(message_name, field) {
                let bytes = B64.decode(s)?;
                Ok(PbValue::Str(String::from_utf8(bytes).map_err(|e| {
                    TachyonError::Codec(format!("field {field}: binary override was not UTF-8: {e}"))
                })?))
            } else {
                Ok(PbValue::Str(s.to_owned()))
            }
        }
        FieldKind::Bytes => {
            let s = raw
                .as_str()
                .ok_or_else(|| TachyonError::Codec(format!("field {field}: expected base64 string")))?;
            Ok(PbValue::Bytes(B64.decode(s)?))
        }
        FieldKind::Message(inner_name, inner_schema) => {
            if is_binary_override(message_name, field) {
                let s = raw
                    .as_str()
                    .ok_or_else(|| TachyonError::Codec(format!("field {field}: expected base64 string")))?;
                let bytes = B64.decode(s)?;
                let inner = wire::decode_message(inner_name, &bytes, inner_schema)?;
                Ok(PbValue::Message(inner))
            } else {
                let inner = decode(inner_name, raw, inner_schema)?;
                Ok(PbValue::Message(inner))
            }
        }
        FieldKind::Repeated(item_kind) => {
            let items = raw
                .as_array()
                .ok_or_else(|| TachyonError::Codec(format!("field {field}: expected array")))?;
            let decoded = items
                .iter()
                .map(|item| decode_value(message_name, field, item, item_kind))
                .collect::<Result<Vec<_>>>()?;
            Ok(PbValue::Repeated(decoded))
        }
    }
}

/// Which wire codec applies, by content-type selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireCodec {
    Protobuf,
    Pblite,
}

/// Servers may reply with `application/x-protobuf`, `application/json+protobuf`,
/// or `text/plain` (pblite); unknown content types fall back "protobuf
/// first, then pblite".
pub fn codec_for_content_type(content_type: Option<&str>) -> WireCodec {
    match content_type.map(|s| s.split(';').next().unwrap_or(s).trim()) {
        Some("application/x-protobuf") => WireCodec::Protobuf,
        Some("application/json+protobuf") => WireCodec::Pblite,
        Some("text/plain") => WireCodec::Pblite,
        _ => WireCodec::Protobuf,
    }
}

/// A minimal standard-protobuf wire codec, used only for the binary-override
/// "nested message becomes its standard protobuf serialization" case.
/// Supports the field shapes the override table actually needs: varint
/// (bool/int/uint), length-delimited (bytes/string/nested message).
pub mod wire {
    use super::*;

    pub fn encode_message(msg: &PbMessage) -> Vec<u8> {
        let mut out = Vec::new();
        for (field, value) in &msg.fields {
            encode_field(*field, value, &mut out);
        }
        out
    }

    fn encode_field(field: u32, value: &PbValue, out: &mut Vec<u8>) {
        match value {
            PbValue::Bool(b) => {
                write_tag(field, 0, out);
                write_varint(*b as u64, out);
            }
            PbValue::Int(i) => {
                write_tag(field, 0, out);
                write_varint(*i as u64, out);
            }
            PbValue::UInt(u) => {
                write_tag(field, 0, out);
                write_varint(*u, out);
            }
            PbValue::Float(f) => {
                write_tag(field, 1, out);
                out.extend_from_slice(&f.to_le_bytes());
            }
            PbValue::Str(s) => {
                write_tag(field, 2, out);
                write_varint(s.len() as u64, out);
                out.extend_from_slice(s.as_bytes());
            }
            PbValue::Bytes(b) => {
                write_tag(field, 2, out);
                write_varint(b.len() as u64, out);
                out.extend_from_slice(b);
            }
            PbValue::Message(inner) => {
                let encoded = encode_message(inner);
                write_tag(field, 2, out);
                write_varint(encoded.len() as u64, out);
                out.extend_from_slice(&encoded);
            }
            PbValue::Repeated(items) => {
                for item in items {
                    encode_field(field, item, out);
                }
            }
        }
    }

    fn write_tag(field: u32, wire_type: u8, out: &mut Vec<u8>) {
        write_varint(((field as u64) << 3) | wire_type as u64, out);
    }

    fn write_varint(mut value: u64, out: &mut Vec<u8>) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
    }

    fn read_varint(bytes: &[u8], pos: &mut usize) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = *bytes
                .get(*pos)
                .ok_or_else(|| TachyonError::Codec("truncated varint".into()))?;
            *pos += 1;
            value |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    pub fn decode_message(
        name: &'static str,
        bytes: &[u8],
        schema: &[(u32, FieldKind)],
    ) -> Result<PbMessage> {
        let mut msg = PbMessage::new(name);
        let mut pos = 0;
        while pos < bytes.len() {
            let tag = read_varint(bytes, &mut pos)?;
            let field = (tag >> 3) as u32;
            let wire_type = (tag & 0x7) as u8;
            let kind = schema.iter().find(|(n, _)| *n == field).map(|(_, k)| k.clone());

            match wire_type {
                0 => {
                    let v = read_varint(bytes, &mut pos)?;
                    if let Some(kind) = kind {
                        msg.fields.push((field, varint_to_value(v, &kind)?));
                    }
                }
                1 => {
                    let slice = bytes
                        .get(pos..pos + 8)
                        .ok_or_else(|| TachyonError::Codec("truncated fixed64".into()))?;
                    pos += 8;
                    if matches!(kind, Some(FieldKind::Float)) {
                        let arr: [u8; 8] = slice.try_into().unwrap();
                        msg.fields.push((field, PbValue::Float(f64::from_le_bytes(arr))));
                    }
                }
                2 => {
                    let len = read_varint(bytes, &mut pos)? as usize;
                    let slice = bytes
                        .get(pos..pos + len)
                        .ok_or_else(|| TachyonError::Codec("truncated length-delimited field".into()))?;
                    pos += len;
                    if let Some(kind) = kind {
                        msg.fields.push((field, length_delimited_to_value(slice, &kind)?));
                    }
                }
                _ => return Err(TachyonError::Codec(format!("unsupported wire type {wire_type}"))),
            }
        }
        Ok(msg)
    }

    fn varint_to_value(v: u64, kind: &FieldKind) -> Result<PbValue> {
        match kind {
            FieldKind::Bool => Ok(PbValue::Bool(v != 0)),
            FieldKind::Int => Ok(PbValue::Int(v as i64)),
            FieldKind::UInt => Ok(PbValue::UInt(v)),
            other => Err(TachyonError::Codec(format!("varint field does not match schema kind {other:?}"))),
        }
    }

    fn length_delimited_to_value(slice: &[u8], kind: &FieldKind) -> Result<PbValue> {
        match kind {
            FieldKind::Str => Ok(PbValue::Str(
                String::from_utf8(slice.to_vec())
                    .map_err(|e| TachyonError::Codec(format!("not valid UTF-8: {e}")))?,
            )),
            FieldKind::Bytes => Ok(PbValue::Bytes(slice.to_vec())),
            FieldKind::Message(name, inner_schema) => {
                Ok(PbValue::Message(decode_message(name, slice, inner_schema)?))
            }
            other => Err(TachyonError::Codec(format!("length-delimited field does not match schema kind {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schema() -> Vec<(u32, FieldKind)> {
        vec![
            (1, FieldKind::Str),
            (2, FieldKind::Int),
            (3, FieldKind::Bool),
            (5, FieldKind::Bytes),
        ]
    }

    #[test]
    fn round_trips_sparse_fields_with_gaps() {
        let msg = PbMessage::new("test.Sample")
            .set(1, PbValue::Str("hello".into()))
            .set(3, PbValue::Bool(true))
            .set(5, PbValue::Bytes(vec![1, 2, 3]));
        let encoded = encode(&msg);
        assert_eq!(encoded.as_array().unwrap().len(), 5);
        assert!(encoded[1].is_null());
        assert!(encoded[3].is_null());

        let decoded = decode("test.Sample", &encoded, &sample_schema()).unwrap();
        assert_eq!(decoded.get(1), Some(&PbValue::Str("hello".into())));
        assert_eq!(decoded.get(2), None);
        assert_eq!(decoded.get(3), Some(&PbValue::Bool(true)));
        assert_eq!(decoded.get(5), Some(&PbValue::Bytes(vec![1, 2, 3])));
    }

    #[test]
    fn trailing_nulls_are_trimmed() {
        let msg = PbMessage::new("test.Sample").set(1, PbValue::Str("only".into()));
        let encoded = encode(&msg);
        assert_eq!(encoded.as_array().unwrap().len(), 1);
    }

    #[test]
    fn missing_trailing_entries_decode_as_absent() {
        let value = serde_json::json!(["only-first"]);
        let decoded = decode("test.Sample", &value, &sample_schema()).unwrap();
        assert_eq!(decoded.get(1), Some(&PbValue::Str("only-first".into())));
        assert_eq!(decoded.get(5), None);
    }

    #[test]
    fn binary_override_round_trips_string_as_utf8_bytes() {
        let msg = PbMessage::new("rpc.OutgoingRPCMessage").set(9, PbValue::Str("payload".into()));
        let encoded = encode(&msg);
        // field 9 -> index 8, must be base64, not the raw string
        assert_ne!(encoded[8].as_str().unwrap(), "payload");

        let schema = vec![(9, FieldKind::Str)];
        let decoded = decode("rpc.OutgoingRPCMessage", &encoded, &schema).unwrap();
        assert_eq!(decoded.get(9), Some(&PbValue::Str("payload".into())));
    }

    #[test]
    fn binary_override_round_trips_nested_message_as_protobuf_bytes() {
        let inner = PbMessage::new("authentication.RPCGaiaData.UnknownContainer.Item2.Item1")
            .set(1, PbValue::Bytes(vec![9, 9, 9]));
        let outer = PbMessage::new("authentication.RPCGaiaData.UnknownContainer.Item2.Item1")
            .set(1, PbValue::Message(inner));
        // field 1 on this message name is itself the override target in the
        // table, so nest one level deeper to exercise message-as-bytes.
        let container = PbMessage::new("container.Outer").set(1, PbValue::Message(outer));
        let encoded = encode(&container);
        let schema = vec![(
            1,
            FieldKind::Message(
                "authentication.RPCGaiaData.UnknownContainer.Item2.Item1",
                vec![(1, FieldKind::Bytes)],
            ),
        )];
        let decoded = decode("container.Outer", &encoded, &schema).unwrap();
        match decoded.get(1) {
            Some(PbValue::Message(m)) => assert_eq!(m.get(1), Some(&PbValue::Bytes(vec![9, 9, 9]))),
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[test]
    fn codec_selection_follows_content_type() {
        assert_eq!(codec_for_content_type(Some("application/x-protobuf")), WireCodec::Protobuf);
        assert_eq!(codec_for_content_type(Some("application/json+protobuf; charset=utf-8")), WireCodec::Pblite);
        assert_eq!(codec_for_content_type(Some("text/plain")), WireCodec::Pblite);
        assert_eq!(codec_for_content_type(None), WireCodec::Protobuf);
    }
}
