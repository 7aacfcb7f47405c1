//! Binary wire protocol for the SQLit server.
//!
//! Every frame starts with a fixed 12-byte header (all integers
//! little-endian):
//!
//! ```text
//! magic:u32      0x544C5153 ("SQLT")
//! version:u8     1
//! type:u8
//! flags:u16
//! requestId:u32
//! ```
//!
//! Request bodies are `bodyLen:u32` followed by a length-prefixed
//! database id, a length-prefixed SQL slot, a `u16` binding count, and
//! the encoded bindings. PING is header-only. Response bodies are
//! type-specific and are consumed field by field by the connection's
//! readers; there is deliberately no "read whole response" primitive.
//!
//! Values are encoded as a one-byte type tag, and for every tag except
//! NULL a `u32` length plus payload. Any length field above
//! [`MAX_MESSAGE_SIZE`] is rejected before the payload is read.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{DatabaseError, DatabaseValue};

pub const MAGIC: u32 = 0x544C_5153;
pub const PROTOCOL_VERSION: u8 = 1;
pub const HEADER_SIZE: usize = 12;
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Reserved for a future streaming row mode; never set by this client.
pub const FLAG_STREAMING: u16 = 1 << 0;
/// Set on QUERY requests to ask for column-named rows.
pub const FLAG_ASSOC: u16 = 1 << 2;

const VALUE_NULL: u8 = 0;
const VALUE_INT64: u8 = 1;
const VALUE_FLOAT64: u8 = 2;
const VALUE_STRING: u8 = 3;
const VALUE_BLOB: u8 = 4;
const VALUE_BOOL: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Query = 1,
    Exec = 2,
    TxBegin = 3,
    TxCommit = 4,
    TxRollback = 5,
    Ping = 6,
    Result = 128,
    Error = 129,
    Rows = 130,
    RowsEnd = 131,
    Pong = 134,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(Self::Query),
            2 => Ok(Self::Exec),
            3 => Ok(Self::TxBegin),
            4 => Ok(Self::TxCommit),
            5 => Ok(Self::TxRollback),
            6 => Ok(Self::Ping),
            128 => Ok(Self::Result),
            129 => Ok(Self::Error),
            130 => Ok(Self::Rows),
            131 => Ok(Self::RowsEnd),
            134 => Ok(Self::Pong),
            other => Err(ProtocolError::UnexpectedMessageType(other)),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid magic number: {0:#010x}")]
    InvalidMagic(u32),
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),
    #[error("Unexpected message type: {0}")]
    UnexpectedMessageType(u8),
    #[error("Unknown value type: {0}")]
    UnknownValueType(u8),
    #[error("Invalid length {actual} for {kind} value")]
    InvalidValueLength { kind: &'static str, actual: u32 },
    #[error("Length {0} exceeds maximum message size")]
    MessageTooLarge(u64),
    #[error("Too many bindings: {0}")]
    TooManyBindings(usize),
    #[error("Response request id {actual} does not match request id {expected}")]
    RequestIdMismatch { expected: u32, actual: u32 },
    #[error("Result frame reported failure")]
    FailureResult,
    #[error("Truncated frame: {0}")]
    Truncated(&'static str),
    #[error("Unexpected trailing bytes: {0}")]
    TrailingBytes(usize),
}

/// The fixed frame header, minus the already-validated magic and
/// version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub message_type: u8,
    pub flags: u16,
    pub request_id: u32,
}

/// Body of a client request frame, as a server (or test harness) sees
/// it after the header and `bodyLen` fields. For TX_COMMIT and
/// TX_ROLLBACK the `sql` slot carries the transaction id; for TX_BEGIN
/// it is empty.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestBody {
    pub database_id: String,
    pub sql: String,
    pub bindings: Vec<DatabaseValue>,
}

#[must_use]
pub fn encode_header(message_type: u8, flags: u16, request_id: u32) -> [u8; HEADER_SIZE] {
    let mut header = [0_u8; HEADER_SIZE];
    header[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    header[4] = PROTOCOL_VERSION;
    header[5] = message_type;
    header[6..8].copy_from_slice(&flags.to_le_bytes());
    header[8..12].copy_from_slice(&request_id.to_le_bytes());
    header
}

/// # Errors
///
/// * If the magic number is wrong or the version is newer than this
///   client speaks
pub fn parse_header(buf: &[u8; HEADER_SIZE]) -> Result<FrameHeader, ProtocolError> {
    let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != MAGIC {
        return Err(ProtocolError::InvalidMagic(magic));
    }

    let version = buf[4];
    if version > PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    Ok(FrameHeader {
        message_type: buf[5],
        flags: u16::from_le_bytes([buf[6], buf[7]]),
        request_id: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
    })
}

/// Read and validate a frame header from the stream.
///
/// # Errors
///
/// * If the read fails
/// * If the header fails validation
pub async fn read_header<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<FrameHeader, DatabaseError> {
    let mut buf = [0_u8; HEADER_SIZE];
    reader.read_exact(&mut buf).await?;
    Ok(parse_header(&buf)?)
}

fn check_len(len: usize) -> Result<u32, ProtocolError> {
    u32::try_from(len)
        .ok()
        .filter(|len| *len <= MAX_MESSAGE_SIZE)
        .ok_or(ProtocolError::MessageTooLarge(len as u64))
}

/// Append the wire encoding of a value.
///
/// # Errors
///
/// * If a string or blob payload exceeds [`MAX_MESSAGE_SIZE`]
pub fn encode_value(buf: &mut BytesMut, value: &DatabaseValue) -> Result<(), ProtocolError> {
    match value {
        DatabaseValue::Null => buf.put_u8(VALUE_NULL),
        DatabaseValue::Int64(value) => {
            buf.put_u8(VALUE_INT64);
            buf.put_u32_le(8);
            buf.put_i64_le(*value);
        }
        DatabaseValue::Real64(value) => {
            buf.put_u8(VALUE_FLOAT64);
            buf.put_u32_le(8);
            buf.put_u64_le(value.to_bits());
        }
        DatabaseValue::String(value) => {
            let len = check_len(value.len())?;
            buf.put_u8(VALUE_STRING);
            buf.put_u32_le(len);
            buf.put_slice(value.as_bytes());
        }
        DatabaseValue::Blob(value) => {
            let len = check_len(value.len())?;
            buf.put_u8(VALUE_BLOB);
            buf.put_u32_le(len);
            buf.put_slice(value);
        }
        DatabaseValue::Bool(value) => {
            buf.put_u8(VALUE_BOOL);
            buf.put_u32_le(1);
            buf.put_u8(u8::from(*value));
        }
    }

    Ok(())
}

fn take<'a>(
    buf: &mut &'a [u8],
    count: usize,
    what: &'static str,
) -> Result<&'a [u8], ProtocolError> {
    if buf.len() < count {
        return Err(ProtocolError::Truncated(what));
    }
    let (head, tail) = buf.split_at(count);
    *buf = tail;
    Ok(head)
}

fn take_u32(buf: &mut &[u8], what: &'static str) -> Result<u32, ProtocolError> {
    let bytes = take(buf, 4, what)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Decode one value from the front of `buf`, advancing it.
///
/// String payloads are not required to be valid UTF-8; invalid bytes
/// are replaced rather than rejected.
///
/// # Errors
///
/// * If the buffer is truncated, the type tag is unknown, a length
///   field exceeds [`MAX_MESSAGE_SIZE`], or a fixed-size payload has
///   the wrong length
pub fn decode_value(buf: &mut &[u8]) -> Result<DatabaseValue, ProtocolError> {
    let tag = take(buf, 1, "value tag")?[0];
    if tag == VALUE_NULL {
        return Ok(DatabaseValue::Null);
    }

    let len = take_u32(buf, "value length")?;
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(u64::from(len)));
    }

    let payload = take(buf, len as usize, "value payload")?;

    match tag {
        VALUE_INT64 => {
            expect_len(len, 8, "int64")?;
            Ok(DatabaseValue::Int64(i64::from_le_bytes(
                payload.try_into().expect("length checked"),
            )))
        }
        VALUE_FLOAT64 => {
            expect_len(len, 8, "float64")?;
            Ok(DatabaseValue::Real64(f64::from_bits(u64::from_le_bytes(
                payload.try_into().expect("length checked"),
            ))))
        }
        VALUE_STRING => Ok(DatabaseValue::String(
            String::from_utf8_lossy(payload).into_owned(),
        )),
        VALUE_BLOB => Ok(DatabaseValue::Blob(payload.to_vec())),
        VALUE_BOOL => {
            expect_len(len, 1, "bool")?;
            Ok(DatabaseValue::Bool(payload[0] != 0))
        }
        other => Err(ProtocolError::UnknownValueType(other)),
    }
}

const fn expect_len(actual: u32, expected: u32, kind: &'static str) -> Result<(), ProtocolError> {
    if actual == expected {
        Ok(())
    } else {
        Err(ProtocolError::InvalidValueLength { kind, actual })
    }
}

/// Read one value from the stream.
///
/// # Errors
///
/// * If the read fails or the encoding is invalid (see
///   [`decode_value`])
pub async fn read_value<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<DatabaseValue, DatabaseError> {
    let tag = reader.read_u8().await?;
    if tag == VALUE_NULL {
        return Ok(DatabaseValue::Null);
    }

    let len = reader.read_u32_le().await?;
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(u64::from(len)).into());
    }

    match tag {
        VALUE_INT64 => {
            expect_len(len, 8, "int64")?;
            Ok(DatabaseValue::Int64(reader.read_i64_le().await?))
        }
        VALUE_FLOAT64 => {
            expect_len(len, 8, "float64")?;
            Ok(DatabaseValue::Real64(f64::from_bits(
                reader.read_u64_le().await?,
            )))
        }
        VALUE_STRING => {
            let payload = read_payload(reader, len).await?;
            Ok(DatabaseValue::String(
                String::from_utf8_lossy(&payload).into_owned(),
            ))
        }
        VALUE_BLOB => Ok(DatabaseValue::Blob(read_payload(reader, len).await?)),
        VALUE_BOOL => {
            expect_len(len, 1, "bool")?;
            Ok(DatabaseValue::Bool(reader.read_u8().await? != 0))
        }
        other => Err(ProtocolError::UnknownValueType(other).into()),
    }
}

async fn read_payload<R: AsyncRead + Unpin>(
    reader: &mut R,
    len: u32,
) -> Result<Vec<u8>, io::Error> {
    let mut payload = vec![0_u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Read a `u32` length prefix and that many bytes, enforcing the size
/// cap.
///
/// # Errors
///
/// * If the read fails or the length exceeds [`MAX_MESSAGE_SIZE`]
pub async fn read_len_prefixed<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Vec<u8>, DatabaseError> {
    let len = reader.read_u32_le().await?;
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(u64::from(len)).into());
    }
    Ok(read_payload(reader, len).await?)
}

/// Read a length-prefixed string. Invalid UTF-8 is replaced, not
/// rejected.
///
/// # Errors
///
/// * See [`read_len_prefixed`]
pub async fn read_string<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, DatabaseError> {
    let bytes = read_len_prefixed(reader).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Build a complete request frame: header, `bodyLen`, database id, sql
/// slot, and bindings.
///
/// # Errors
///
/// * If any length field would exceed [`MAX_MESSAGE_SIZE`], or there
///   are more than `u16::MAX` bindings
pub fn build_request(
    message_type: MessageType,
    request_id: u32,
    flags: u16,
    database_id: &str,
    sql: &str,
    bindings: &[DatabaseValue],
) -> Result<Bytes, ProtocolError> {
    let binding_count = u16::try_from(bindings.len())
        .map_err(|_| ProtocolError::TooManyBindings(bindings.len()))?;

    let mut body = BytesMut::new();
    body.put_u32_le(check_len(database_id.len())?);
    body.put_slice(database_id.as_bytes());
    body.put_u32_le(check_len(sql.len())?);
    body.put_slice(sql.as_bytes());
    body.put_u16_le(binding_count);
    for binding in bindings {
        encode_value(&mut body, binding)?;
    }

    let body_len = check_len(body.len())?;

    let mut frame = BytesMut::with_capacity(HEADER_SIZE + 4 + body.len());
    frame.put_slice(&encode_header(message_type as u8, flags, request_id));
    frame.put_u32_le(body_len);
    frame.put_slice(&body);
    Ok(frame.freeze())
}

/// Build a header-only PING frame.
#[must_use]
pub fn build_ping(request_id: u32) -> Bytes {
    Bytes::copy_from_slice(&encode_header(MessageType::Ping as u8, 0, request_id))
}

/// Parse a request body (everything after the `bodyLen` field). Used
/// by server-side harnesses and the codec tests.
///
/// # Errors
///
/// * If the body is truncated, carries trailing bytes, or contains an
///   invalid value encoding
pub fn parse_request_body(mut buf: &[u8]) -> Result<RequestBody, ProtocolError> {
    let buf = &mut buf;

    let database_id = parse_string_field(buf, "database id")?;
    let sql = parse_string_field(buf, "sql")?;

    let binding_count_bytes = take(buf, 2, "binding count")?;
    let binding_count = u16::from_le_bytes([binding_count_bytes[0], binding_count_bytes[1]]);

    let mut bindings = Vec::with_capacity(usize::from(binding_count));
    for _ in 0..binding_count {
        bindings.push(decode_value(buf)?);
    }

    if !buf.is_empty() {
        return Err(ProtocolError::TrailingBytes(buf.len()));
    }

    Ok(RequestBody {
        database_id,
        sql,
        bindings,
    })
}

fn parse_string_field(buf: &mut &[u8], what: &'static str) -> Result<String, ProtocolError> {
    let len = take_u32(buf, what)?;
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(u64::from(len)));
    }
    let bytes = take(buf, len as usize, what)?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn encode(value: &DatabaseValue) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_value(&mut buf, value).unwrap();
        buf.to_vec()
    }

    #[test]
    fn value_round_trips_every_variant() {
        let values = [
            DatabaseValue::Null,
            DatabaseValue::Int64(0),
            DatabaseValue::Int64(i64::MIN),
            DatabaseValue::Int64(i64::MAX),
            DatabaseValue::Real64(0.0),
            DatabaseValue::Real64(-0.0),
            DatabaseValue::Real64(1.5),
            DatabaseValue::String(String::new()),
            DatabaseValue::String("hello, wörld".to_string()),
            DatabaseValue::Blob(Vec::new()),
            DatabaseValue::Blob(vec![0, 1, 2, 254, 255]),
            DatabaseValue::Bool(false),
            DatabaseValue::Bool(true),
        ];

        for value in values {
            let encoded = encode(&value);
            let mut buf = encoded.as_slice();
            let decoded = decode_value(&mut buf).unwrap();
            assert_eq!(decoded, value);
            assert!(buf.is_empty(), "decoder left {} trailing bytes", buf.len());
        }
    }

    #[test]
    fn float_round_trip_preserves_bits() {
        for bits in [
            f64::NAN.to_bits(),
            0x7FF8_0000_DEAD_BEEF,
            (-0.0_f64).to_bits(),
            f64::INFINITY.to_bits(),
        ] {
            let encoded = encode(&DatabaseValue::Real64(f64::from_bits(bits)));
            let decoded = decode_value(&mut encoded.as_slice()).unwrap();
            let DatabaseValue::Real64(value) = decoded else {
                panic!("expected a float, got {decoded:?}");
            };
            assert_eq!(value.to_bits(), bits);
        }
    }

    #[test]
    fn null_is_a_single_byte() {
        assert_eq!(encode(&DatabaseValue::Null), vec![0]);
    }

    #[test]
    fn bool_decodes_any_nonzero_payload_as_true() {
        let decoded = decode_value(&mut [5, 1, 0, 0, 0, 0x2A].as_slice()).unwrap();
        assert_eq!(decoded, DatabaseValue::Bool(true));
    }

    #[test]
    fn unknown_value_tag_fails() {
        let result = decode_value(&mut [9, 1, 0, 0, 0, 0].as_slice());
        assert!(matches!(result, Err(ProtocolError::UnknownValueType(9))));
    }

    #[test]
    fn int64_with_wrong_length_fails() {
        let result = decode_value(&mut [1, 4, 0, 0, 0, 1, 2, 3, 4].as_slice());
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidValueLength {
                kind: "int64",
                actual: 4
            })
        ));
    }

    #[test]
    fn oversized_length_field_fails_before_reading_payload() {
        let result = decode_value(&mut [3, 0xFF, 0xFF, 0xFF, 0xFF].as_slice());
        assert!(matches!(result, Err(ProtocolError::MessageTooLarge(_))));
    }

    #[test]
    fn truncated_value_fails() {
        let result = decode_value(&mut [3, 10, 0, 0, 0, b'a'].as_slice());
        assert!(matches!(
            result,
            Err(ProtocolError::Truncated("value payload"))
        ));
    }

    #[test_log::test(tokio::test)]
    async fn invalid_utf8_string_payloads_are_replaced_not_rejected() {
        // STRING payloads are accepted whatever their bytes, but the
        // decoded cell is a Rust `String`, so invalid sequences come
        // out as U+FFFD instead of failing the decode. Byte-exact
        // payloads belong in BLOB values.
        let mut encoded = vec![3, 4, 0, 0, 0];
        encoded.extend_from_slice(&[b'a', 0xFF, 0xFE, b'b']);
        let expected = DatabaseValue::String("a\u{FFFD}\u{FFFD}b".to_string());

        assert_eq!(decode_value(&mut encoded.as_slice()).unwrap(), expected);
        assert_eq!(read_value(&mut encoded.as_slice()).await.unwrap(), expected);
    }

    #[test]
    fn largest_permitted_blob_round_trips() {
        let value = DatabaseValue::Blob(vec![0xAB; MAX_MESSAGE_SIZE as usize - 1]);
        let encoded = encode(&value);
        assert_eq!(decode_value(&mut encoded.as_slice()).unwrap(), value);
    }

    #[test]
    fn header_round_trips() {
        let header = encode_header(MessageType::Query as u8, FLAG_ASSOC, 0xDEAD_BEEF);
        assert_eq!(
            parse_header(&header).unwrap(),
            FrameHeader {
                message_type: 1,
                flags: FLAG_ASSOC,
                request_id: 0xDEAD_BEEF,
            }
        );
    }

    #[test]
    fn bad_magic_fails() {
        let mut header = encode_header(MessageType::Result as u8, 0, 1);
        header[0] = 0;
        assert!(matches!(
            parse_header(&header),
            Err(ProtocolError::InvalidMagic(_))
        ));
    }

    #[test]
    fn newer_version_fails() {
        let mut header = encode_header(MessageType::Result as u8, 0, 1);
        header[4] = 2;
        assert!(matches!(
            parse_header(&header),
            Err(ProtocolError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn request_round_trips_for_every_body_carrying_type() {
        let bindings = vec![
            DatabaseValue::Int64(-1),
            DatabaseValue::String("x".to_string()),
            DatabaseValue::Null,
        ];

        for (message_type, sql) in [
            (MessageType::Query, "SELECT 1"),
            (MessageType::Exec, "DELETE FROM t"),
            (MessageType::TxBegin, ""),
            (MessageType::TxCommit, "tx-17"),
            (MessageType::TxRollback, "tx-17"),
        ] {
            let frame =
                build_request(message_type, 7, FLAG_ASSOC, "db-1", sql, &bindings).unwrap();

            let header = parse_header(frame[..HEADER_SIZE].try_into().unwrap()).unwrap();
            assert_eq!(header.message_type, message_type as u8);
            assert_eq!(header.request_id, 7);

            let body_len = u32::from_le_bytes(
                frame[HEADER_SIZE..HEADER_SIZE + 4].try_into().unwrap(),
            );
            let body = &frame[HEADER_SIZE + 4..];
            assert_eq!(body.len(), body_len as usize);

            let parsed = parse_request_body(body).unwrap();
            assert_eq!(
                parsed,
                RequestBody {
                    database_id: "db-1".to_string(),
                    sql: sql.to_string(),
                    bindings: bindings.clone(),
                }
            );
        }
    }

    #[test]
    fn request_with_no_bindings_round_trips() {
        let frame = build_request(MessageType::Query, 0, FLAG_ASSOC, "db", "SELECT 1", &[])
            .unwrap();
        let parsed = parse_request_body(&frame[HEADER_SIZE + 4..]).unwrap();
        assert!(parsed.bindings.is_empty());
    }

    #[test]
    fn ping_is_header_only() {
        let frame = build_ping(42);
        assert_eq!(frame.len(), HEADER_SIZE);
        let header = parse_header(frame[..].try_into().unwrap()).unwrap();
        assert_eq!(header.message_type, MessageType::Ping as u8);
        assert_eq!(header.request_id, 42);
    }

    #[test]
    fn empty_request_body_is_truncated() {
        assert!(matches!(
            parse_request_body(&[]),
            Err(ProtocolError::Truncated(_))
        ));
    }

    #[test]
    fn trailing_bytes_in_request_body_fail() {
        let frame = build_request(MessageType::Query, 0, 0, "db", "SELECT 1", &[]).unwrap();
        let mut body = frame[HEADER_SIZE + 4..].to_vec();
        body.push(0);
        assert!(matches!(
            parse_request_body(&body),
            Err(ProtocolError::TrailingBytes(1))
        ));
    }

    #[test_log::test(tokio::test)]
    async fn async_reader_matches_sync_decoder() {
        let values = [
            DatabaseValue::Null,
            DatabaseValue::Int64(i64::MIN),
            DatabaseValue::Real64(-0.0),
            DatabaseValue::String("abc".to_string()),
            DatabaseValue::Blob(vec![1, 2, 3]),
            DatabaseValue::Bool(true),
        ];

        for value in values {
            let encoded = encode(&value);
            let mut reader = encoded.as_slice();
            assert_eq!(read_value(&mut reader).await.unwrap(), value);
            assert!(reader.is_empty());
        }
    }

    #[test_log::test(tokio::test)]
    async fn async_reader_enforces_size_cap() {
        let result = read_value(&mut [4, 0xFF, 0xFF, 0xFF, 0xFF].as_slice()).await;
        assert!(matches!(
            result,
            Err(DatabaseError::Protocol(ProtocolError::MessageTooLarge(_)))
        ));
    }
}
