// FastCGI/1.0 record codec
//
// Record layout: version, type, request id (u16), content length (u16),
// padding length, reserved, then content and padding.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const FCGI_VERSION_1: u8 = 1;
pub const HEADER_LEN: usize = 8;
pub const MAX_CONTENT_LEN: usize = 65535;

/// Request id used for the single request of a connection
pub const REQUEST_ID: u16 = 1;

const ROLE_RESPONDER: u16 = 1;
const FLAG_KEEP_CONN: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
    Data = 8,
    GetValues = 9,
    GetValuesResult = 10,
    UnknownType = 11,
}

impl RecordType {
    pub fn from_u8(value: u8) -> Option<Self> {
        let kind = match value {
            1 => RecordType::BeginRequest,
            2 => RecordType::AbortRequest,
            3 => RecordType::EndRequest,
            4 => RecordType::Params,
            5 => RecordType::Stdin,
            6 => RecordType::Stdout,
            7 => RecordType::Stderr,
            8 => RecordType::Data,
            9 => RecordType::GetValues,
            10 => RecordType::GetValuesResult,
            11 => RecordType::UnknownType,
            _ => return None,
        };
        Some(kind)
    }
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Unsupported FastCGI version {0}")]
    Version(u8),

    #[error("Unknown record type {0}")]
    UnknownType(u8),

    #[error("Malformed record: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub kind: RecordType,
    pub request_id: u16,
    pub content: Bytes,
}

/// Append one record; `content` must fit a single record
pub fn write_record(buf: &mut BytesMut, kind: RecordType, request_id: u16, content: &[u8]) {
    debug_assert!(content.len() <= MAX_CONTENT_LEN);
    let padding = (8 - content.len() % 8) % 8;

    buf.reserve(HEADER_LEN + content.len() + padding);
    buf.put_u8(FCGI_VERSION_1);
    buf.put_u8(kind as u8);
    buf.put_u16(request_id);
    buf.put_u16(content.len() as u16);
    buf.put_u8(padding as u8);
    buf.put_u8(0);
    buf.put_slice(content);
    buf.put_bytes(0, padding);
}

/// Append a stream (PARAMS, STDIN, STDOUT, ...) in chunks, closed by an empty record
pub fn write_stream(buf: &mut BytesMut, kind: RecordType, request_id: u16, data: &[u8]) {
    for chunk in data.chunks(MAX_CONTENT_LEN) {
        write_record(buf, kind, request_id, chunk);
    }
    write_record(buf, kind, request_id, &[]);
}

pub fn write_begin_request(buf: &mut BytesMut, request_id: u16, keep_conn: bool) {
    let mut body = [0u8; 8];
    body[..2].copy_from_slice(&ROLE_RESPONDER.to_be_bytes());
    body[2] = if keep_conn { FLAG_KEEP_CONN } else { 0 };
    write_record(buf, RecordType::BeginRequest, request_id, &body);
}

pub fn write_end_request(buf: &mut BytesMut, request_id: u16, app_status: u32, protocol_status: u8) {
    let mut body = [0u8; 8];
    body[..4].copy_from_slice(&app_status.to_be_bytes());
    body[4] = protocol_status;
    write_record(buf, RecordType::EndRequest, request_id, &body);
}

/// Encode name-value pairs for a PARAMS stream
pub fn encode_params<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> BytesMut {
    let mut buf = BytesMut::new();
    for (name, value) in pairs {
        put_length(&mut buf, name.len());
        put_length(&mut buf, value.len());
        buf.put_slice(name.as_bytes());
        buf.put_slice(value.as_bytes());
    }
    buf
}

// lengths below 128 take one byte, longer ones four with the high bit set
fn put_length(buf: &mut BytesMut, len: usize) {
    if len < 0x80 {
        buf.put_u8(len as u8);
    } else {
        buf.put_u32(len as u32 | 0x8000_0000);
    }
}

/// Decode the content of a PARAMS stream
pub fn decode_params(mut data: &[u8]) -> Result<Vec<(String, String)>, ProtocolError> {
    let mut pairs = Vec::new();
    while !data.is_empty() {
        let name_len = take_length(&mut data)?;
        let value_len = take_length(&mut data)?;
        if data.len() < name_len + value_len {
            return Err(ProtocolError::Malformed(
                "name-value pair exceeds params content".to_string(),
            ));
        }
        let name = String::from_utf8_lossy(&data[..name_len]).into_owned();
        let value = String::from_utf8_lossy(&data[name_len..name_len + value_len]).into_owned();
        data = &data[name_len + value_len..];
        pairs.push((name, value));
    }
    Ok(pairs)
}

fn take_length(data: &mut &[u8]) -> Result<usize, ProtocolError> {
    let first = *data
        .first()
        .ok_or_else(|| ProtocolError::Malformed("truncated length".to_string()))?;
    if first & 0x80 == 0 {
        *data = &data[1..];
        return Ok(first as usize);
    }
    if data.len() < 4 {
        return Err(ProtocolError::Malformed("truncated length".to_string()));
    }
    let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) & 0x7fff_ffff;
    *data = &data[4..];
    Ok(len as usize)
}

/// Read the next record; `None` on a clean end of stream
pub async fn read_record<R>(reader: &mut R) -> Result<Option<Record>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    if reader.read(&mut header[..1]).await? == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut header[1..]).await?;

    if header[0] != FCGI_VERSION_1 {
        return Err(ProtocolError::Version(header[0]));
    }
    let kind = RecordType::from_u8(header[1]).ok_or(ProtocolError::UnknownType(header[1]))?;
    let request_id = u16::from_be_bytes([header[2], header[3]]);
    let content_len = u16::from_be_bytes([header[4], header[5]]) as usize;
    let padding_len = header[6] as usize;

    let mut content = vec![0u8; content_len + padding_len];
    reader.read_exact(&mut content).await?;
    content.truncate(content_len);

    Ok(Some(Record {
        kind,
        request_id,
        content: Bytes::from(content),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_is_padded_to_eight_bytes() {
        let mut buf = BytesMut::new();
        write_record(&mut buf, RecordType::Stdin, REQUEST_ID, b"hello");

        assert_eq!(buf.len(), HEADER_LEN + 8);
        assert_eq!(&buf[..HEADER_LEN], &[1, 5, 0, 1, 0, 5, 3, 0]);
        assert_eq!(&buf[HEADER_LEN..HEADER_LEN + 5], b"hello");
    }

    #[test]
    fn test_stream_is_chunked_and_terminated() {
        let data = vec![b'x'; MAX_CONTENT_LEN + 10];
        let mut buf = BytesMut::new();
        write_stream(&mut buf, RecordType::Stdin, REQUEST_ID, &data);

        // full chunk (65535 + 1 padding), short chunk (10 + 6 padding), empty terminator
        assert_eq!(
            buf.len(),
            (HEADER_LEN + MAX_CONTENT_LEN + 1) + (HEADER_LEN + 16) + HEADER_LEN
        );
    }

    #[test]
    fn test_params_short_and_long_lengths() {
        let long = "v".repeat(300);
        let encoded = encode_params([("SHORT", "1"), ("LONG", long.as_str())]);

        assert_eq!(&encoded[..2], &[5, 1]);
        let second = &encoded[2 + 5 + 1..];
        assert_eq!(second[0], 4);
        assert_eq!(&second[1..5], &(300u32 | 0x8000_0000).to_be_bytes());

        let decoded = decode_params(&encoded).unwrap();
        assert_eq!(decoded[0], ("SHORT".to_string(), "1".to_string()));
        assert_eq!(decoded[1].1.len(), 300);
    }

    #[test]
    fn test_decode_params_rejects_truncated_content() {
        let encoded = encode_params([("NAME", "value")]);
        let result = decode_params(&encoded[..encoded.len() - 2]);
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_read_record_skips_padding() {
        let mut buf = BytesMut::new();
        write_record(&mut buf, RecordType::Stdout, REQUEST_ID, b"abc");
        write_end_request(&mut buf, REQUEST_ID, 0, 0);
        let mut reader = &buf[..];

        let first = read_record(&mut reader).await.unwrap().unwrap();
        assert_eq!(first.kind, RecordType::Stdout);
        assert_eq!(&first.content[..], b"abc");

        let second = read_record(&mut reader).await.unwrap().unwrap();
        assert_eq!(second.kind, RecordType::EndRequest);
        assert!(read_record(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_record_rejects_bad_version() {
        let bytes = [2u8, 6, 0, 1, 0, 0, 0, 0];
        let mut reader = &bytes[..];
        assert!(matches!(
            read_record(&mut reader).await,
            Err(ProtocolError::Version(2))
        ));
    }
}
