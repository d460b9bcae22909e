//! Wire codec: binary-exact framing per the PostgreSQL message format.
//!
//! Regular messages are `[1-byte type][4-byte big-endian length
//! including itself][payload]`; the startup message alone is typeless.
//! The codec is stateless: reading loops on partial reads, encoding
//! returns complete frames.

use std::collections::HashMap;
use std::io;

use duckdb::types::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use tern_core::engine::Column;

use crate::protocol::{self, oid};

/// What the first frame of a connection turned out to be.
#[derive(Debug)]
pub enum Startup {
    /// SSL negotiation probe; answer `'N'` and read the real startup.
    SslProbe,
    /// Cancel-request connection; nothing to do but close.
    Cancel,
    /// A real startup message with its key/value parameters.
    Params(HashMap<String, String>),
    /// Peer went away (or sent garbage, which we treat the same).
    Eof,
}

/// Read one framed message. `None` means the connection is done:
/// clean close, short read, or a malformed length all end the same way.
pub async fn read_message<S>(stream: &mut S) -> io::Result<Option<(u8, Vec<u8>)>>
where
    S: AsyncRead + Unpin,
{
    let msg_type = match stream.read_u8().await {
        Ok(b) => b,
        Err(_) => return Ok(None),
    };
    let len = match stream.read_i32().await {
        Ok(l) => l as usize,
        Err(_) => return Ok(None),
    };
    if len < 4 || len - 4 > protocol::MAX_MESSAGE_LEN {
        return Ok(None);
    }
    let mut payload = vec![0u8; len - 4];
    if !payload.is_empty() && stream.read_exact(&mut payload).await.is_err() {
        return Ok(None);
    }
    Ok(Some((msg_type, payload)))
}

/// Read the typeless startup frame, distinguishing the SSL-request
/// magic from a normal startup payload.
pub async fn read_startup<S>(stream: &mut S) -> io::Result<Startup>
where
    S: AsyncRead + Unpin,
{
    let len = match stream.read_i32().await {
        Ok(l) => l as usize,
        Err(_) => return Ok(Startup::Eof),
    };
    if len < 8 || len > protocol::MAX_STARTUP_LEN {
        return Ok(Startup::Eof);
    }
    let mut payload = vec![0u8; len - 4];
    if stream.read_exact(&mut payload).await.is_err() {
        return Ok(Startup::Eof);
    }
    let code = i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    if code == protocol::SSL_REQUEST_CODE {
        return Ok(Startup::SslProbe);
    }
    if code == protocol::CANCEL_REQUEST_CODE {
        return Ok(Startup::Cancel);
    }

    let mut params = HashMap::new();
    let mut rest = &payload[4..];
    loop {
        let Some((key, after_key)) = take_cstr(rest) else {
            break;
        };
        if key.is_empty() {
            break;
        }
        let Some((value, after_value)) = take_cstr(after_key) else {
            break;
        };
        params.insert(key, value);
        rest = after_value;
    }
    Ok(Startup::Params(params))
}

fn take_cstr(bytes: &[u8]) -> Option<(String, &[u8])> {
    let end = bytes.iter().position(|&b| b == 0)?;
    let s = String::from_utf8_lossy(&bytes[..end]).into_owned();
    Some((s, &bytes[end + 1..]))
}

/// Prefix a type byte and inclusive length onto a payload.
pub fn build_message(msg_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5 + payload.len());
    buf.push(msg_type);
    buf.extend_from_slice(&((payload.len() + 4) as i32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Split a built frame back into (type, payload).
pub fn split_message(frame: &[u8]) -> Option<(u8, Vec<u8>)> {
    if frame.len() < 5 {
        return None;
    }
    let len = i32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]) as usize;
    if len < 4 || frame.len() != 1 + len {
        return None;
    }
    Some((frame[0], frame[5..].to_vec()))
}

// ---- backend message encoders ----

pub fn authentication_ok() -> Vec<u8> {
    build_message(protocol::MSG_AUTH_REQUEST, &0i32.to_be_bytes())
}

pub fn parameter_status(name: &str, value: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(name.as_bytes());
    payload.push(0);
    payload.extend_from_slice(value.as_bytes());
    payload.push(0);
    build_message(protocol::MSG_PARAMETER_STATUS, &payload)
}

pub fn backend_key_data(pid: i32, secret: i32) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&pid.to_be_bytes());
    payload.extend_from_slice(&secret.to_be_bytes());
    build_message(protocol::MSG_BACKEND_KEY_DATA, &payload)
}

pub fn ready_for_query(status: u8) -> Vec<u8> {
    build_message(protocol::MSG_READY_FOR_QUERY, &[status])
}

pub fn row_description(columns: &[Column]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&(columns.len() as i16).to_be_bytes());
    for column in columns {
        payload.extend_from_slice(column.name.as_bytes());
        payload.push(0);
        payload.extend_from_slice(&0i32.to_be_bytes()); // table OID
        payload.extend_from_slice(&0i16.to_be_bytes()); // attribute number
        payload.extend_from_slice(&column.pg_type.oid().to_be_bytes());
        payload.extend_from_slice(&column.pg_type.len().to_be_bytes());
        payload.extend_from_slice(&(-1i32).to_be_bytes()); // type modifier
        payload.extend_from_slice(&0i16.to_be_bytes()); // format: text
    }
    build_message(protocol::MSG_ROW_DESCRIPTION, &payload)
}

pub fn data_row(cells: &[Option<String>]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&(cells.len() as i16).to_be_bytes());
    for cell in cells {
        match cell {
            None => payload.extend_from_slice(&(-1i32).to_be_bytes()),
            Some(value) => {
                // Text cells must not carry NUL bytes.
                if value.contains('\0') {
                    let sanitized: String = value.chars().filter(|&c| c != '\0').collect();
                    payload.extend_from_slice(&(sanitized.len() as i32).to_be_bytes());
                    payload.extend_from_slice(sanitized.as_bytes());
                } else {
                    payload.extend_from_slice(&(value.len() as i32).to_be_bytes());
                    payload.extend_from_slice(value.as_bytes());
                }
            }
        }
    }
    build_message(protocol::MSG_DATA_ROW, &payload)
}

pub fn command_complete(tag: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(tag.as_bytes());
    payload.push(0);
    build_message(protocol::MSG_COMMAND_COMPLETE, &payload)
}

pub fn empty_query_response() -> Vec<u8> {
    build_message(protocol::MSG_EMPTY_QUERY, &[])
}

pub fn error_response(code: &str, message: &str, detail: Option<&str>) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.push(b'S');
    payload.extend_from_slice(b"ERROR\0");
    payload.push(b'V');
    payload.extend_from_slice(b"ERROR\0");
    payload.push(b'C');
    payload.extend_from_slice(code.as_bytes());
    payload.push(0);
    payload.push(b'M');
    payload.extend_from_slice(message.as_bytes());
    payload.push(0);
    if let Some(detail) = detail {
        if !detail.is_empty() {
            payload.push(b'D');
            payload.extend_from_slice(detail.as_bytes());
            payload.push(0);
        }
    }
    payload.push(0);
    build_message(protocol::MSG_ERROR_RESPONSE, &payload)
}

pub fn notice_response(message: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.push(b'S');
    payload.extend_from_slice(b"NOTICE\0");
    payload.push(b'C');
    payload.extend_from_slice(b"00000\0");
    payload.push(b'M');
    payload.extend_from_slice(message.as_bytes());
    payload.push(0);
    payload.push(0);
    build_message(protocol::MSG_NOTICE_RESPONSE, &payload)
}

pub fn parse_complete() -> Vec<u8> {
    build_message(protocol::MSG_PARSE_COMPLETE, &[])
}

pub fn bind_complete() -> Vec<u8> {
    build_message(protocol::MSG_BIND_COMPLETE, &[])
}

pub fn close_complete() -> Vec<u8> {
    build_message(protocol::MSG_CLOSE_COMPLETE, &[])
}

pub fn parameter_description(oids: &[i32]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&(oids.len() as i16).to_be_bytes());
    for oid in oids {
        payload.extend_from_slice(&oid.to_be_bytes());
    }
    build_message(protocol::MSG_PARAMETER_DESCRIPTION, &payload)
}

pub fn no_data() -> Vec<u8> {
    build_message(protocol::MSG_NO_DATA, &[])
}

/// Write a batch of frames and flush.
pub async fn send<S>(stream: &mut S, frames: &[Vec<u8>]) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    for frame in frames {
        stream.write_all(frame).await?;
    }
    stream.flush().await
}

// ---- frontend payload parsers ----

/// Parse message: statement name, query text, declared parameter OIDs.
pub fn parse_parse(payload: &[u8]) -> Option<(String, String, Vec<i32>)> {
    let (name, rest) = take_cstr(payload)?;
    let (query, rest) = take_cstr(rest)?;
    if rest.len() < 2 {
        return Some((name, query, Vec::new()));
    }
    let count = i16::from_be_bytes([rest[0], rest[1]]) as usize;
    let mut oids = Vec::with_capacity(count);
    let mut offset = 2;
    for _ in 0..count {
        if offset + 4 > rest.len() {
            break;
        }
        oids.push(i32::from_be_bytes([
            rest[offset],
            rest[offset + 1],
            rest[offset + 2],
            rest[offset + 3],
        ]));
        offset += 4;
    }
    Some((name, query, oids))
}

#[derive(Debug)]
pub struct BindMessage {
    pub portal: String,
    pub statement: String,
    pub param_formats: Vec<i16>,
    pub params: Vec<Option<Vec<u8>>>,
    pub result_formats: Vec<i16>,
}

pub fn parse_bind(payload: &[u8]) -> Option<BindMessage> {
    let (portal, rest) = take_cstr(payload)?;
    let (statement, rest) = take_cstr(rest)?;

    let mut offset = 0;
    let read_i16 = |bytes: &[u8], at: usize| -> Option<i16> {
        Some(i16::from_be_bytes([*bytes.get(at)?, *bytes.get(at + 1)?]))
    };
    let format_count = read_i16(rest, offset)? as usize;
    offset += 2;
    let mut param_formats = Vec::with_capacity(format_count);
    for _ in 0..format_count {
        param_formats.push(read_i16(rest, offset)?);
        offset += 2;
    }

    let param_count = read_i16(rest, offset)? as usize;
    offset += 2;
    let mut params = Vec::with_capacity(param_count);
    for _ in 0..param_count {
        let len = i32::from_be_bytes([
            *rest.get(offset)?,
            *rest.get(offset + 1)?,
            *rest.get(offset + 2)?,
            *rest.get(offset + 3)?,
        ]);
        offset += 4;
        if len < 0 {
            params.push(None);
        } else {
            let len = len as usize;
            if offset + len > rest.len() {
                return None;
            }
            params.push(Some(rest[offset..offset + len].to_vec()));
            offset += len;
        }
    }

    let result_count = read_i16(rest, offset).unwrap_or(0) as usize;
    offset += 2;
    let mut result_formats = Vec::with_capacity(result_count);
    for _ in 0..result_count {
        match read_i16(rest, offset) {
            Some(f) => result_formats.push(f),
            None => break,
        }
        offset += 2;
    }

    Some(BindMessage {
        portal,
        statement,
        param_formats,
        params,
        result_formats,
    })
}

/// Describe/Close payload: a target kind byte (`'S'`/`'P'`) and a name.
pub fn parse_target(payload: &[u8]) -> (u8, String) {
    if payload.is_empty() {
        return (b'S', String::new());
    }
    let kind = payload[0];
    let name = take_cstr(&payload[1..])
        .map(|(n, _)| n)
        .unwrap_or_default();
    (kind, name)
}

/// Execute payload: portal name and row cap (0 = unlimited).
pub fn parse_execute(payload: &[u8]) -> (String, i32) {
    let Some((portal, rest)) = take_cstr(payload) else {
        return (String::new(), 0);
    };
    let max_rows = if rest.len() >= 4 {
        i32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]])
    } else {
        0
    };
    (portal, max_rows)
}

/// Decode one Bind parameter per its declared OID (0 = infer) and
/// format code. Binary decodings follow PostgreSQL's network-byte-order
/// fixed-width encodings; ambiguity defaults to text.
pub fn decode_parameter(
    raw: Option<&[u8]>,
    type_oid: i32,
    format: i16,
) -> Result<Value, String> {
    let Some(bytes) = raw else {
        return Ok(Value::Null);
    };
    if format == 1 {
        return decode_binary(bytes, type_oid);
    }
    let text = String::from_utf8_lossy(bytes).into_owned();
    let value = match type_oid {
        oid::BOOL => match text.to_ascii_lowercase().as_str() {
            "t" | "true" | "1" | "on" | "yes" => Value::Boolean(true),
            "f" | "false" | "0" | "off" | "no" => Value::Boolean(false),
            _ => Value::Text(text),
        },
        oid::INT2 => text
            .trim()
            .parse::<i16>()
            .map(Value::SmallInt)
            .unwrap_or(Value::Text(text)),
        oid::INT4 => text
            .trim()
            .parse::<i32>()
            .map(Value::Int)
            .unwrap_or(Value::Text(text)),
        oid::INT8 => text
            .trim()
            .parse::<i64>()
            .map(Value::BigInt)
            .unwrap_or(Value::Text(text)),
        oid::FLOAT4 => text
            .trim()
            .parse::<f32>()
            .map(Value::Float)
            .unwrap_or(Value::Text(text)),
        oid::FLOAT8 => text
            .trim()
            .parse::<f64>()
            .map(Value::Double)
            .unwrap_or(Value::Text(text)),
        _ => Value::Text(text),
    };
    Ok(value)
}

fn decode_binary(bytes: &[u8], type_oid: i32) -> Result<Value, String> {
    let wrong_width =
        |expected: usize| format!("binary parameter: expected {expected} bytes, got {}", bytes.len());
    match type_oid {
        oid::BOOL => match bytes {
            [0] => Ok(Value::Boolean(false)),
            [_] => Ok(Value::Boolean(true)),
            _ => Err(wrong_width(1)),
        },
        oid::INT2 => bytes
            .try_into()
            .map(|b| Value::SmallInt(i16::from_be_bytes(b)))
            .map_err(|_| wrong_width(2)),
        oid::INT4 => bytes
            .try_into()
            .map(|b| Value::Int(i32::from_be_bytes(b)))
            .map_err(|_| wrong_width(4)),
        oid::INT8 => bytes
            .try_into()
            .map(|b| Value::BigInt(i64::from_be_bytes(b)))
            .map_err(|_| wrong_width(8)),
        oid::FLOAT4 => bytes
            .try_into()
            .map(|b| Value::Float(f32::from_be_bytes(b)))
            .map_err(|_| wrong_width(4)),
        oid::FLOAT8 => bytes
            .try_into()
            .map(|b| Value::Double(f64::from_be_bytes(b)))
            .map_err(|_| wrong_width(8)),
        // Unknown binary types: pass through as UTF-8 text when valid.
        _ => Ok(Value::Text(String::from_utf8_lossy(bytes).into_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_core::engine::PgType;

    #[test]
    fn test_build_split_roundtrip() {
        for (msg_type, payload) in [
            (b'Q', b"SELECT 1\0".to_vec()),
            (b'Z', vec![b'I']),
            (b'X', Vec::new()),
        ] {
            let frame = build_message(msg_type, &payload);
            // Length field counts itself.
            let len = i32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]) as usize;
            assert_eq!(len, payload.len() + 4);
            assert_eq!(split_message(&frame), Some((msg_type, payload)));
        }
    }

    #[tokio::test]
    async fn test_read_message_roundtrip() {
        let frame = build_message(b'Q', b"SELECT 1\0");
        let mut cursor = std::io::Cursor::new(frame);
        let (msg_type, payload) = read_message(&mut cursor).await.unwrap().unwrap();
        assert_eq!(msg_type, b'Q');
        assert_eq!(payload, b"SELECT 1\0");
    }

    #[tokio::test]
    async fn test_read_message_eof() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(read_message(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_message_malformed_length() {
        let mut frame = build_message(b'Q', b"x");
        frame[1..5].copy_from_slice(&2i32.to_be_bytes()); // < 4
        let mut cursor = std::io::Cursor::new(frame);
        assert!(read_message(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_startup_ssl_probe() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&8i32.to_be_bytes());
        frame.extend_from_slice(&crate::protocol::SSL_REQUEST_CODE.to_be_bytes());
        let mut cursor = std::io::Cursor::new(frame);
        assert!(matches!(
            read_startup(&mut cursor).await.unwrap(),
            Startup::SslProbe
        ));
    }

    #[tokio::test]
    async fn test_read_startup_params() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&crate::protocol::PROTOCOL_VERSION_3_0.to_be_bytes());
        payload.extend_from_slice(b"user\0alice\0database\0analytics\0\0");
        let mut frame = Vec::new();
        frame.extend_from_slice(&((payload.len() + 4) as i32).to_be_bytes());
        frame.extend_from_slice(&payload);
        let mut cursor = std::io::Cursor::new(frame);
        match read_startup(&mut cursor).await.unwrap() {
            Startup::Params(params) => {
                assert_eq!(params.get("user").map(String::as_str), Some("alice"));
                assert_eq!(params.get("database").map(String::as_str), Some("analytics"));
            }
            other => panic!("expected params, got {other:?}"),
        }
    }

    #[test]
    fn test_row_description_layout() {
        let frame = row_description(&[Column::new("x", PgType::Int4)]);
        let (msg_type, payload) = split_message(&frame).unwrap();
        assert_eq!(msg_type, b'T');
        assert_eq!(i16::from_be_bytes([payload[0], payload[1]]), 1);
        // name + NUL
        assert_eq!(&payload[2..4], b"x\0");
        // type OID at name + table oid(4) + attnum(2)
        let oid_at = 4 + 4 + 2;
        assert_eq!(
            i32::from_be_bytes([
                payload[oid_at],
                payload[oid_at + 1],
                payload[oid_at + 2],
                payload[oid_at + 3]
            ]),
            23
        );
    }

    #[test]
    fn test_data_row_null_and_text() {
        let frame = data_row(&[Some("42".to_string()), None]);
        let (_, payload) = split_message(&frame).unwrap();
        assert_eq!(i16::from_be_bytes([payload[0], payload[1]]), 2);
        assert_eq!(
            i32::from_be_bytes([payload[2], payload[3], payload[4], payload[5]]),
            2
        );
        assert_eq!(&payload[6..8], b"42");
        assert_eq!(
            i32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]),
            -1
        );
    }

    #[test]
    fn test_data_row_strips_nul_bytes() {
        let frame = data_row(&[Some("a\0b".to_string())]);
        let (_, payload) = split_message(&frame).unwrap();
        assert_eq!(
            i32::from_be_bytes([payload[2], payload[3], payload[4], payload[5]]),
            2
        );
        assert_eq!(&payload[6..8], b"ab");
    }

    #[test]
    fn test_parse_parse_with_oids() {
        let mut payload = Vec::new();
        payload.extend_from_slice(b"s1\0SELECT $1\0");
        payload.extend_from_slice(&1i16.to_be_bytes());
        payload.extend_from_slice(&23i32.to_be_bytes());
        let (name, query, oids) = parse_parse(&payload).unwrap();
        assert_eq!(name, "s1");
        assert_eq!(query, "SELECT $1");
        assert_eq!(oids, vec![23]);
    }

    #[test]
    fn test_parse_bind_full() {
        let mut payload = Vec::new();
        payload.extend_from_slice(b"p1\0s1\0");
        payload.extend_from_slice(&1i16.to_be_bytes()); // one format code
        payload.extend_from_slice(&0i16.to_be_bytes()); // text
        payload.extend_from_slice(&2i16.to_be_bytes()); // two params
        payload.extend_from_slice(&2i32.to_be_bytes());
        payload.extend_from_slice(b"42");
        payload.extend_from_slice(&(-1i32).to_be_bytes()); // NULL
        payload.extend_from_slice(&0i16.to_be_bytes()); // no result formats
        let bind = parse_bind(&payload).unwrap();
        assert_eq!(bind.portal, "p1");
        assert_eq!(bind.statement, "s1");
        assert_eq!(bind.param_formats, vec![0]);
        assert_eq!(bind.params.len(), 2);
        assert_eq!(bind.params[0].as_deref(), Some(b"42".as_slice()));
        assert!(bind.params[1].is_none());
    }

    #[test]
    fn test_parse_execute() {
        let mut payload = b"p1\0".to_vec();
        payload.extend_from_slice(&50i32.to_be_bytes());
        assert_eq!(parse_execute(&payload), ("p1".to_string(), 50));
    }

    #[test]
    fn test_decode_text_parameters() {
        assert_eq!(
            decode_parameter(Some(b"42"), oid::INT4, 0).unwrap(),
            Value::Int(42)
        );
        assert_eq!(
            decode_parameter(Some(b"true"), oid::BOOL, 0).unwrap(),
            Value::Boolean(true)
        );
        assert_eq!(
            decode_parameter(Some(b"1.5"), oid::FLOAT8, 0).unwrap(),
            Value::Double(1.5)
        );
        // OID 0: infer, default to text.
        assert_eq!(
            decode_parameter(Some(b"hello"), 0, 0).unwrap(),
            Value::Text("hello".to_string())
        );
        assert_eq!(decode_parameter(None, oid::INT4, 0).unwrap(), Value::Null);
    }

    #[test]
    fn test_decode_binary_parameters() {
        assert_eq!(
            decode_parameter(Some(&42i32.to_be_bytes()), oid::INT4, 1).unwrap(),
            Value::Int(42)
        );
        assert_eq!(
            decode_parameter(Some(&7i64.to_be_bytes()), oid::INT8, 1).unwrap(),
            Value::BigInt(7)
        );
        assert_eq!(
            decode_parameter(Some(&2.5f64.to_be_bytes()), oid::FLOAT8, 1).unwrap(),
            Value::Double(2.5)
        );
        assert_eq!(
            decode_parameter(Some(&[1]), oid::BOOL, 1).unwrap(),
            Value::Boolean(true)
        );
        assert!(decode_parameter(Some(&[0, 0]), oid::BOOL, 1).is_err());
        assert!(decode_parameter(Some(&[0, 0, 1]), oid::INT4, 1).is_err());
    }

    #[test]
    fn test_error_response_fields() {
        let frame = error_response("XX000", "boom", Some("trace"));
        let (msg_type, payload) = split_message(&frame).unwrap();
        assert_eq!(msg_type, b'E');
        let text = String::from_utf8_lossy(&payload);
        assert!(text.contains("ERROR"));
        assert!(text.contains("XX000"));
        assert!(text.contains("boom"));
        assert!(text.contains("trace"));
    }
}
