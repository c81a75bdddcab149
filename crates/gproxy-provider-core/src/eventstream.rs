//! AWS Event Stream binary framing (spec §4.I), used by the Kiro/AWS
//! CodeWhisperer executor for `generateAssistantResponse` streaming.
//!
//! Frame layout: `[total_len:4][headers_len:4][prelude_crc:4]` followed by
//! `headers_len` bytes of headers, then `total_len - headers_len - 16` bytes
//! of payload, then a 4-byte message CRC. Per spec §9's open question, the
//! message CRC is computed but validated only when explicitly requested —
//! the reference implementation skips it.

use bytes::Bytes;

const PRELUDE_LEN: usize = 8;
const PRELUDE_AND_CRC_LEN: usize = 12;
const MIN_MESSAGE_LEN: u32 = 16;
const MAX_MESSAGE_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct EventStreamMessage {
    pub event_type: Option<String>,
    pub headers: Vec<(String, HeaderValue)>,
    pub payload: Bytes,
}

#[derive(Debug, Clone)]
pub enum HeaderValue {
    Bool(bool),
    Byte(i8),
    Short(i16),
    Integer(i32),
    Long(i64),
    ByteArray(Bytes),
    String(String),
    Timestamp(i64),
    Uuid([u8; 16]),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum EventStreamError {
    #[error("message too short: {0} bytes")]
    TooShort(usize),
    #[error("invalid total_length {0}")]
    InvalidTotalLength(u32),
    #[error("prelude CRC mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    PreludeCrcMismatch { expected: u32, computed: u32 },
    #[error("headers_length {headers_len} exceeds total_length {total_len} - 16")]
    HeadersLengthOverflow { headers_len: u32, total_len: u32 },
    #[error("message CRC mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    MessageCrcMismatch { expected: u32, computed: u32 },
    #[error("truncated headers section")]
    TruncatedHeaders,
    #[error("truncated message: need {needed} more bytes")]
    Truncated { needed: usize },
}

/// Decodes a single length-prefixed AWS Event Stream message from the front
/// of `buf`, returning the message and the number of bytes consumed. Returns
/// `Ok(None)` (via `Truncated`) when `buf` doesn't yet hold a whole message —
/// callers should keep buffering and retry.
pub fn decode_message(
    buf: &[u8],
    validate_message_crc: bool,
) -> Result<(EventStreamMessage, usize), EventStreamError> {
    if buf.len() < PRELUDE_AND_CRC_LEN {
        return Err(EventStreamError::Truncated {
            needed: PRELUDE_AND_CRC_LEN - buf.len(),
        });
    }

    let total_len = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let headers_len = u32::from_be_bytes(buf[4..8].try_into().unwrap());
    let prelude_crc = u32::from_be_bytes(buf[8..12].try_into().unwrap());

    if !(MIN_MESSAGE_LEN..=MAX_MESSAGE_LEN).contains(&total_len) {
        return Err(EventStreamError::InvalidTotalLength(total_len));
    }
    if headers_len > total_len.saturating_sub(MIN_MESSAGE_LEN) {
        return Err(EventStreamError::HeadersLengthOverflow {
            headers_len,
            total_len,
        });
    }

    let computed_prelude_crc = crc32fast::hash(&buf[0..PRELUDE_LEN]);
    if computed_prelude_crc != prelude_crc {
        return Err(EventStreamError::PreludeCrcMismatch {
            expected: prelude_crc,
            computed: computed_prelude_crc,
        });
    }

    let total_len_usize = total_len as usize;
    if buf.len() < total_len_usize {
        return Err(EventStreamError::Truncated {
            needed: total_len_usize - buf.len(),
        });
    }

    let remaining = &buf[PRELUDE_AND_CRC_LEN..total_len_usize];
    let headers_len_usize = headers_len as usize;
    if remaining.len() < headers_len_usize + 4 {
        return Err(EventStreamError::TruncatedHeaders);
    }
    let headers_bytes = &remaining[..headers_len_usize];
    let payload_end = remaining.len() - 4;
    let payload = Bytes::copy_from_slice(&remaining[headers_len_usize..payload_end]);
    let message_crc = u32::from_be_bytes(remaining[payload_end..].try_into().unwrap());

    if validate_message_crc {
        let computed = crc32fast::hash(&buf[0..total_len_usize - 4]);
        if computed != message_crc {
            return Err(EventStreamError::MessageCrcMismatch {
                expected: message_crc,
                computed,
            });
        }
    }

    let headers = decode_headers(headers_bytes)?;
    let event_type = headers.iter().find_map(|(name, value)| {
        if name == ":event-type" {
            match value {
                HeaderValue::String(s) => Some(s.clone()),
                _ => None,
            }
        } else {
            None
        }
    });

    Ok((
        EventStreamMessage {
            event_type,
            headers,
            payload,
        },
        total_len_usize,
    ))
}

fn decode_headers(mut buf: &[u8]) -> Result<Vec<(String, HeaderValue)>, EventStreamError> {
    let mut out = Vec::new();
    while !buf.is_empty() {
        if buf.len() < 2 {
            return Err(EventStreamError::TruncatedHeaders);
        }
        let name_len = buf[0] as usize;
        buf = &buf[1..];
        if buf.len() < name_len + 1 {
            return Err(EventStreamError::TruncatedHeaders);
        }
        let name = String::from_utf8_lossy(&buf[..name_len]).into_owned();
        buf = &buf[name_len..];
        let value_type = buf[0];
        buf = &buf[1..];
        let (value, consumed) = decode_header_value(value_type, buf)?;
        buf = &buf[consumed..];
        out.push((name, value));
    }
    Ok(out)
}

/// Decodes one header value. Every branch advances by the value's exact
/// on-wire size even when the type isn't one we care about, so unknown types
/// never desync the remaining header offsets (spec §4.I).
fn decode_header_value(
    value_type: u8,
    buf: &[u8],
) -> Result<(HeaderValue, usize), EventStreamError> {
    match value_type {
        0 => Ok((HeaderValue::Bool(true), 0)),
        1 => Ok((HeaderValue::Bool(false), 0)),
        2 => {
            require(buf, 1)?;
            Ok((HeaderValue::Byte(buf[0] as i8), 1))
        }
        3 => {
            require(buf, 2)?;
            Ok((
                HeaderValue::Short(i16::from_be_bytes(buf[0..2].try_into().unwrap())),
                2,
            ))
        }
        4 => {
            require(buf, 4)?;
            Ok((
                HeaderValue::Integer(i32::from_be_bytes(buf[0..4].try_into().unwrap())),
                4,
            ))
        }
        5 => {
            require(buf, 8)?;
            Ok((
                HeaderValue::Long(i64::from_be_bytes(buf[0..8].try_into().unwrap())),
                8,
            ))
        }
        6 => {
            require(buf, 2)?;
            let len = u16::from_be_bytes(buf[0..2].try_into().unwrap()) as usize;
            require(&buf[2..], len)?;
            Ok((
                HeaderValue::ByteArray(Bytes::copy_from_slice(&buf[2..2 + len])),
                2 + len,
            ))
        }
        7 => {
            require(buf, 2)?;
            let len = u16::from_be_bytes(buf[0..2].try_into().unwrap()) as usize;
            require(&buf[2..], len)?;
            let s = String::from_utf8_lossy(&buf[2..2 + len]).into_owned();
            Ok((HeaderValue::String(s), 2 + len))
        }
        8 => {
            require(buf, 8)?;
            Ok((
                HeaderValue::Timestamp(i64::from_be_bytes(buf[0..8].try_into().unwrap())),
                8,
            ))
        }
        9 => {
            require(buf, 16)?;
            let mut uuid = [0u8; 16];
            uuid.copy_from_slice(&buf[0..16]);
            Ok((HeaderValue::Uuid(uuid), 16))
        }
        _ => Err(EventStreamError::TruncatedHeaders),
    }
}

fn require(buf: &[u8], len: usize) -> Result<(), EventStreamError> {
    if buf.len() < len {
        Err(EventStreamError::TruncatedHeaders)
    } else {
        Ok(())
    }
}

/// Incremental decoder over a byte stream that may deliver partial frames.
#[derive(Default)]
pub struct EventStreamDecoder {
    buf: Vec<u8>,
    validate_message_crc: bool,
}

impl EventStreamDecoder {
    pub fn new(validate_message_crc: bool) -> Self {
        Self {
            buf: Vec::new(),
            validate_message_crc,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pops the next fully-buffered message, if any.
    pub fn next_message(&mut self) -> Result<Option<EventStreamMessage>, EventStreamError> {
        match decode_message(&self.buf, self.validate_message_crc) {
            Ok((message, consumed)) => {
                self.buf.drain(..consumed);
                Ok(Some(message))
            }
            Err(EventStreamError::Truncated { .. }) => Ok(None),
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_string_header(name: &str, value: &str) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(name.len() as u8);
        out.extend_from_slice(name.as_bytes());
        out.push(7); // string type
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(value.as_bytes());
        out
    }

    fn encode_message(event_type: &str, payload: &[u8]) -> Vec<u8> {
        let headers = encode_string_header(":event-type", event_type);
        let headers_len = headers.len() as u32;
        let total_len = 12 + headers.len() as u32 + payload.len() as u32 + 4;

        let mut prelude = Vec::new();
        prelude.extend_from_slice(&total_len.to_be_bytes());
        prelude.extend_from_slice(&headers_len.to_be_bytes());
        let prelude_crc = crc32fast::hash(&prelude);

        let mut out = prelude;
        out.extend_from_slice(&prelude_crc.to_be_bytes());
        out.extend_from_slice(&headers);
        out.extend_from_slice(payload);
        let message_crc = crc32fast::hash(&out);
        out.extend_from_slice(&message_crc.to_be_bytes());
        out
    }

    #[test]
    fn decodes_two_sequential_messages() {
        let mut bytes = encode_message("assistantResponseEvent", br#"{"content":"Hi"}"#);
        bytes.extend(encode_message(
            "messageMetadataEvent",
            br#"{"tokenUsage":{"outputTokens":3}}"#,
        ));

        let mut decoder = EventStreamDecoder::new(false);
        decoder.feed(&bytes);

        let first = decoder.next_message().unwrap().unwrap();
        assert_eq!(first.event_type.as_deref(), Some("assistantResponseEvent"));
        assert_eq!(&first.payload[..], br#"{"content":"Hi"}"#);

        let second = decoder.next_message().unwrap().unwrap();
        assert_eq!(second.event_type.as_deref(), Some("messageMetadataEvent"));
        let value: serde_json::Value = serde_json::from_slice(&second.payload).unwrap();
        assert_eq!(value["tokenUsage"]["outputTokens"], 3);

        assert!(decoder.next_message().unwrap().is_none());
    }

    #[test]
    fn rejects_message_shorter_than_16_bytes() {
        let err = decode_message(&[0u8; 10], false).unwrap_err();
        assert!(matches!(err, EventStreamError::Truncated { .. }));
    }

    #[test]
    fn rejects_headers_length_overflowing_total_length() {
        let mut buf = vec![0u8; 20];
        buf[0..4].copy_from_slice(&20u32.to_be_bytes());
        buf[4..8].copy_from_slice(&10u32.to_be_bytes());
        let prelude_crc = crc32fast::hash(&buf[0..8]);
        buf[8..12].copy_from_slice(&prelude_crc.to_be_bytes());
        let err = decode_message(&buf, false).unwrap_err();
        assert!(matches!(err, EventStreamError::HeadersLengthOverflow { .. }));
    }

    #[test]
    fn feeding_partial_frame_returns_none_until_complete() {
        let bytes = encode_message("assistantResponseEvent", b"partial");
        let mut decoder = EventStreamDecoder::new(false);
        decoder.feed(&bytes[..bytes.len() - 3]);
        assert!(decoder.next_message().unwrap().is_none());
        decoder.feed(&bytes[bytes.len() - 3..]);
        assert!(decoder.next_message().unwrap().is_some());
    }
}
