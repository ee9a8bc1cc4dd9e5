//! Plaintext framing and the handful of protobuf messages the client needs.
//!
//! A frame is `0x00`, the payload length and the message type (both varints),
//! then the protobuf-encoded payload.

use std::io::{Read, Write};

use crate::notify::error::NotifyError;

pub const HELLO_REQUEST: u32 = 1;
pub const HELLO_RESPONSE: u32 = 2;
pub const CONNECT_REQUEST: u32 = 3;
pub const CONNECT_RESPONSE: u32 = 4;
pub const DISCONNECT_REQUEST: u32 = 5;
pub const DISCONNECT_RESPONSE: u32 = 6;
pub const PING_REQUEST: u32 = 7;
pub const PING_RESPONSE: u32 = 8;
pub const LIST_ENTITIES_REQUEST: u32 = 11;
pub const LIST_ENTITIES_DONE_RESPONSE: u32 = 19;
pub const LIST_ENTITIES_SERVICES_RESPONSE: u32 = 41;
pub const EXECUTE_SERVICE_REQUEST: u32 = 42;

const PLAINTEXT_PREAMBLE: u8 = 0x00;
const NOISE_PREAMBLE: u8 = 0x01;
const MAX_FRAME_LEN: u64 = 1024 * 1024;

const API_VERSION_MAJOR: u64 = 1;
const API_VERSION_MINOR: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u32,
    pub payload: Vec<u8>,
}

pub fn encode_frame(msg_type: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 6);
    frame.push(PLAINTEXT_PREAMBLE);
    write_varint(&mut frame, payload.len() as u64);
    write_varint(&mut frame, u64::from(msg_type));
    frame.extend_from_slice(payload);
    frame
}

pub fn write_frame<W: Write>(writer: &mut W, msg_type: u32, payload: &[u8]) -> Result<(), NotifyError> {
    writer.write_all(&encode_frame(msg_type, payload))?;
    writer.flush()?;
    Ok(())
}

pub fn read_frame<R: Read>(reader: &mut R) -> Result<Frame, NotifyError> {
    let mut preamble = [0u8; 1];
    reader.read_exact(&mut preamble)?;
    match preamble[0] {
        PLAINTEXT_PREAMBLE => {}
        NOISE_PREAMBLE => {
            return Err(NotifyError::Protocol(
                "device requires an encrypted API connection".into(),
            ));
        }
        other => {
            return Err(NotifyError::Protocol(format!(
                "unexpected frame preamble {other:#04x}"
            )));
        }
    }

    let len = read_varint_from(reader)?;
    if len > MAX_FRAME_LEN {
        return Err(NotifyError::Protocol(format!("frame of {len} bytes is too large")));
    }
    let msg_type = u32::try_from(read_varint_from(reader)?)
        .map_err(|_| NotifyError::Protocol("message type out of range".into()))?;

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(Frame { msg_type, payload })
}

fn read_varint_from<R: Read>(reader: &mut R) -> Result<u64, NotifyError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte)?;
        value |= u64::from(byte[0] & 0x7f) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err(NotifyError::Protocol("varint too long".into()));
        }
    }
}

pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn read_varint(bytes: &[u8], cursor: &mut usize) -> Option<u64> {
    let mut shift = 0u32;
    let mut value = 0u64;
    while *cursor < bytes.len() && shift <= 63 {
        let byte = bytes[*cursor];
        *cursor += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
    }
    None
}

fn write_key(out: &mut Vec<u8>, field_number: u32, wire_type: u8) {
    write_varint(out, (u64::from(field_number) << 3) | u64::from(wire_type));
}

pub fn write_varint_field(out: &mut Vec<u8>, field_number: u32, value: u64) {
    write_key(out, field_number, 0);
    write_varint(out, value);
}

pub fn write_bytes_field(out: &mut Vec<u8>, field_number: u32, value: &[u8]) {
    write_key(out, field_number, 2);
    write_varint(out, value.len() as u64);
    out.extend_from_slice(value);
}

pub fn write_fixed32_field(out: &mut Vec<u8>, field_number: u32, value: u32) {
    write_key(out, field_number, 5);
    out.extend_from_slice(&value.to_le_bytes());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue<'a> {
    Varint(u64),
    Fixed64(u64),
    Bytes(&'a [u8]),
    Fixed32(u32),
}

/// Splits a protobuf message into `(field number, value)` pairs.
pub fn parse_fields(bytes: &[u8]) -> Result<Vec<(u32, FieldValue<'_>)>, NotifyError> {
    let invalid = |what: &str| NotifyError::Protocol(format!("invalid protobuf {what}"));
    let mut fields = Vec::new();
    let mut cursor = 0usize;

    while cursor < bytes.len() {
        let key = read_varint(bytes, &mut cursor).ok_or_else(|| invalid("key"))?;
        let field_number = (key >> 3) as u32;
        let value = match key & 0x07 {
            0 => FieldValue::Varint(read_varint(bytes, &mut cursor).ok_or_else(|| invalid("varint"))?),
            1 => {
                let end = cursor + 8;
                let raw = bytes.get(cursor..end).ok_or_else(|| invalid("fixed64"))?;
                cursor = end;
                FieldValue::Fixed64(u64::from_le_bytes(raw.try_into().map_err(|_| invalid("fixed64"))?))
            }
            2 => {
                let len = read_varint(bytes, &mut cursor).ok_or_else(|| invalid("length"))? as usize;
                let end = cursor.checked_add(len).ok_or_else(|| invalid("length"))?;
                let raw = bytes.get(cursor..end).ok_or_else(|| invalid("length"))?;
                cursor = end;
                FieldValue::Bytes(raw)
            }
            5 => {
                let end = cursor + 4;
                let raw = bytes.get(cursor..end).ok_or_else(|| invalid("fixed32"))?;
                cursor = end;
                FieldValue::Fixed32(u32::from_le_bytes(raw.try_into().map_err(|_| invalid("fixed32"))?))
            }
            _ => return Err(invalid("wire type")),
        };
        fields.push((field_number, value));
    }

    Ok(fields)
}

pub fn hello_request(client_info: &str) -> Vec<u8> {
    let mut out = Vec::new();
    write_bytes_field(&mut out, 1, client_info.as_bytes());
    write_varint_field(&mut out, 2, API_VERSION_MAJOR);
    write_varint_field(&mut out, 3, API_VERSION_MINOR);
    out
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HelloResponse {
    pub api_version_major: u64,
    pub api_version_minor: u64,
    pub server_info: String,
    pub name: String,
}

impl HelloResponse {
    pub fn parse(bytes: &[u8]) -> Result<Self, NotifyError> {
        let mut hello = Self::default();
        for (number, value) in parse_fields(bytes)? {
            match (number, value) {
                (1, FieldValue::Varint(v)) => hello.api_version_major = v,
                (2, FieldValue::Varint(v)) => hello.api_version_minor = v,
                (3, FieldValue::Bytes(v)) => hello.server_info = String::from_utf8_lossy(v).into(),
                (4, FieldValue::Bytes(v)) => hello.name = String::from_utf8_lossy(v).into(),
                _ => {}
            }
        }
        Ok(hello)
    }
}

pub fn connect_request(password: Option<&str>) -> Vec<u8> {
    let mut out = Vec::new();
    if let Some(password) = password.filter(|p| !p.is_empty()) {
        write_bytes_field(&mut out, 1, password.as_bytes());
    }
    out
}

/// Reads `invalid_password` out of a ConnectResponse.
pub fn connect_rejected(bytes: &[u8]) -> Result<bool, NotifyError> {
    Ok(parse_fields(bytes)?
        .into_iter()
        .any(|field| field == (1, FieldValue::Varint(1))))
}

/// A user-defined action the device exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: String,
    pub key: u32,
    pub arg_count: usize,
}

impl ServiceInfo {
    pub fn parse(bytes: &[u8]) -> Result<Self, NotifyError> {
        let mut name = None;
        let mut key = None;
        let mut arg_count = 0;
        for (number, value) in parse_fields(bytes)? {
            match (number, value) {
                (1, FieldValue::Bytes(v)) => name = Some(String::from_utf8_lossy(v).into_owned()),
                (2, FieldValue::Fixed32(v)) => key = Some(v),
                (3, FieldValue::Bytes(_)) => arg_count += 1,
                _ => {}
            }
        }
        match (name, key) {
            (Some(name), Some(key)) => Ok(Self {
                name,
                key,
                arg_count,
            }),
            _ => Err(NotifyError::Protocol(
                "service entry without name or key".into(),
            )),
        }
    }
}

/// ExecuteServiceRequest with no argument or a single string argument.
pub fn execute_service_request(key: u32, argument: Option<&str>) -> Vec<u8> {
    let mut out = Vec::new();
    write_fixed32_field(&mut out, 1, key);
    if let Some(argument) = argument {
        let mut arg = Vec::new();
        write_bytes_field(&mut arg, 4, argument.as_bytes());
        write_bytes_field(&mut out, 2, &arg);
    }
    out
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn empty_ping_frame_layout() {
        assert_eq!(encode_frame(PING_REQUEST, &[]), vec![0x00, 0x00, 0x07]);
    }

    #[test]
    fn varints_use_continuation_bits() {
        let mut out = Vec::new();
        write_varint(&mut out, 300);
        assert_eq!(out, vec![0xac, 0x02]);
    }

    #[test]
    fn frame_reads_back_from_a_stream() -> anyhow::Result<()> {
        let payload = vec![0x55u8; 200];
        let mut stream = Cursor::new(encode_frame(LIST_ENTITIES_SERVICES_RESPONSE, &payload));

        let frame = read_frame(&mut stream)?;

        assert_eq!(frame.msg_type, LIST_ENTITIES_SERVICES_RESPONSE);
        assert_eq!(frame.payload, payload);
        Ok(())
    }

    #[test]
    fn encrypted_preamble_is_rejected() {
        let mut stream = Cursor::new(vec![0x01, 0x00, 0x07]);

        assert!(matches!(
            read_frame(&mut stream),
            Err(NotifyError::Protocol(_))
        ));
    }

    #[test]
    fn hello_request_bytes() {
        assert_eq!(
            hello_request("cb"),
            vec![0x0a, 0x02, b'c', b'b', 0x10, 0x01, 0x18, 0x0a]
        );
    }

    #[test]
    fn connect_request_omits_empty_password() {
        assert!(connect_request(None).is_empty());
        assert!(connect_request(Some("")).is_empty());
        assert_eq!(connect_request(Some("pw")), vec![0x0a, 0x02, b'p', b'w']);
    }

    #[test]
    fn connect_response_flags_invalid_password() -> anyhow::Result<()> {
        assert!(connect_rejected(&[0x08, 0x01])?);
        assert!(!connect_rejected(&[])?);
        Ok(())
    }

    #[test]
    fn parses_service_entry() -> anyhow::Result<()> {
        let mut arg = Vec::new();
        write_bytes_field(&mut arg, 1, b"text");
        write_varint_field(&mut arg, 2, 3);

        let mut entry = Vec::new();
        write_bytes_field(&mut entry, 1, b"set_title");
        write_fixed32_field(&mut entry, 2, 0xdead_beef);
        write_bytes_field(&mut entry, 3, &arg);

        let service = ServiceInfo::parse(&entry)?;

        assert_eq!(
            service,
            ServiceInfo {
                name: "set_title".into(),
                key: 0xdead_beef,
                arg_count: 1
            }
        );
        Ok(())
    }

    #[test]
    fn execute_request_with_string_argument() {
        let bytes = execute_service_request(0x0102_0304, Some("Hi"));

        assert_eq!(
            bytes,
            vec![
                0x0d, 0x04, 0x03, 0x02, 0x01, // key, fixed32 little endian
                0x12, 0x04, 0x22, 0x02, b'H', b'i', // args { string_: "Hi" }
            ]
        );
    }

    #[test]
    fn execute_request_without_argument_is_just_the_key() {
        assert_eq!(
            execute_service_request(7, None),
            vec![0x0d, 0x07, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn truncated_message_is_a_protocol_error() {
        assert!(parse_fields(&[0x0a, 0x05, b'a']).is_err());
    }
}
