//! Decoder for the `application/vnd.amazon.eventstream` framing used by
//! Bedrock response streaming.
//!
//! Frame layout (all integers big-endian):
//! `total_len:u32 | headers_len:u32 | prelude_crc:u32 | headers | payload | message_crc:u32`

const PRELUDE_LEN: usize = 12;
const MIN_FRAME_LEN: usize = PRELUDE_LEN + 4;
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EventStreamError {
    #[error("frame length {0} out of bounds")]
    InvalidLength(usize),
    #[error("prelude checksum mismatch")]
    PreludeChecksum,
    #[error("message checksum mismatch")]
    MessageChecksum,
    #[error("malformed header block: {0}")]
    Header(String),
    #[error("stream ended with {0} undecoded bytes")]
    Truncated(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Bytes(Vec<u8>),
    String(String),
    Timestamp(i64),
    Uuid([u8; 16]),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub headers: Vec<(String, HeaderValue)>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.iter().find_map(|(k, v)| match v {
            HeaderValue::String(s) if k == name => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn message_type(&self) -> &str {
        self.header_str(":message-type").unwrap_or("event")
    }

    pub fn event_type(&self) -> Option<&str> {
        self.header_str(":event-type")
    }

    pub fn exception_type(&self) -> Option<&str> {
        self.header_str(":exception-type")
            .or_else(|| self.header_str(":error-code"))
    }
}

/// Incremental decoder: feed arbitrary byte chunks, pull whole frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>, EventStreamError> {
        if self.buf.len() < PRELUDE_LEN {
            return Ok(None);
        }
        let total_len = read_u32(&self.buf[0..4]) as usize;
        let headers_len = read_u32(&self.buf[4..8]) as usize;
        if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&total_len)
            || headers_len > total_len - MIN_FRAME_LEN
        {
            return Err(EventStreamError::InvalidLength(total_len));
        }
        if crc32(&self.buf[0..8]) != read_u32(&self.buf[8..12]) {
            return Err(EventStreamError::PreludeChecksum);
        }
        if self.buf.len() < total_len {
            return Ok(None);
        }

        let frame_bytes: Vec<u8> = self.buf.drain(..total_len).collect();
        let crc_offset = total_len - 4;
        if crc32(&frame_bytes[..crc_offset]) != read_u32(&frame_bytes[crc_offset..]) {
            return Err(EventStreamError::MessageChecksum);
        }

        let headers_end = PRELUDE_LEN + headers_len;
        let headers = parse_headers(&frame_bytes[PRELUDE_LEN..headers_end])?;
        let payload = frame_bytes[headers_end..crc_offset].to_vec();
        Ok(Some(Frame { headers, payload }))
    }
}

fn parse_headers(mut block: &[u8]) -> Result<Vec<(String, HeaderValue)>, EventStreamError> {
    let mut headers = Vec::new();
    while !block.is_empty() {
        let name_len = usize::from(take(&mut block, 1)?[0]);
        let name = String::from_utf8(take(&mut block, name_len)?.to_vec())
            .map_err(|_| EventStreamError::Header("header name is not utf-8".into()))?;
        let kind = take(&mut block, 1)?[0];
        let value = match kind {
            0 => HeaderValue::Bool(true),
            1 => HeaderValue::Bool(false),
            2 => HeaderValue::Byte(take(&mut block, 1)?[0] as i8),
            3 => HeaderValue::Short(i16::from_be_bytes(fixed(take(&mut block, 2)?))),
            4 => HeaderValue::Int(i32::from_be_bytes(fixed(take(&mut block, 4)?))),
            5 => HeaderValue::Long(i64::from_be_bytes(fixed(take(&mut block, 8)?))),
            6 | 7 => {
                let len = usize::from(u16::from_be_bytes(fixed(take(&mut block, 2)?)));
                let raw = take(&mut block, len)?.to_vec();
                if kind == 6 {
                    HeaderValue::Bytes(raw)
                } else {
                    HeaderValue::String(String::from_utf8(raw).map_err(|_| {
                        EventStreamError::Header(format!("header {name} is not utf-8"))
                    })?)
                }
            }
            8 => HeaderValue::Timestamp(i64::from_be_bytes(fixed(take(&mut block, 8)?))),
            9 => HeaderValue::Uuid(fixed(take(&mut block, 16)?)),
            other => {
                return Err(EventStreamError::Header(format!(
                    "unknown header value type {other}"
                )))
            }
        };
        headers.push((name, value));
    }
    Ok(headers)
}

fn take<'a>(block: &mut &'a [u8], n: usize) -> Result<&'a [u8], EventStreamError> {
    if block.len() < n {
        return Err(EventStreamError::Header("header block truncated".into()));
    }
    let (head, tail) = block.split_at(n);
    *block = tail;
    Ok(head)
}

fn fixed<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes(fixed(bytes))
}

/// CRC-32 (IEEE 802.3, reflected, polynomial 0xEDB88320).
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

/// Encode a frame with string headers. Used by tests and local fakes of the
/// streaming endpoint.
pub fn encode_frame(headers: &[(&str, &str)], payload: &[u8]) -> Vec<u8> {
    let mut header_block = Vec::new();
    for (name, value) in headers {
        header_block.push(name.len() as u8);
        header_block.extend_from_slice(name.as_bytes());
        header_block.push(7);
        header_block.extend_from_slice(&(value.len() as u16).to_be_bytes());
        header_block.extend_from_slice(value.as_bytes());
    }
    let total_len = (MIN_FRAME_LEN + header_block.len() + payload.len()) as u32;

    let mut out = Vec::with_capacity(total_len as usize);
    out.extend_from_slice(&total_len.to_be_bytes());
    out.extend_from_slice(&(header_block.len() as u32).to_be_bytes());
    let prelude_crc = crc32(&out);
    out.extend_from_slice(&prelude_crc.to_be_bytes());
    out.extend_from_slice(&header_block);
    out.extend_from_slice(payload);
    let message_crc = crc32(&out);
    out.extend_from_slice(&message_crc.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_matches_check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn decodes_frames_split_across_chunks() {
        let first = encode_frame(
            &[(":message-type", "event"), (":event-type", "chunk")],
            br#"{"bytes":"e30="}"#,
        );
        let second = encode_frame(&[(":message-type", "event")], b"");
        let mut all = first.clone();
        all.extend_from_slice(&second);

        let mut decoder = FrameDecoder::new();
        decoder.push(&all[..5]);
        assert_eq!(decoder.next_frame().unwrap(), None);
        decoder.push(&all[5..first.len() - 1]);
        assert_eq!(decoder.next_frame().unwrap(), None);
        decoder.push(&all[first.len() - 1..]);

        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.event_type(), Some("chunk"));
        assert_eq!(frame.message_type(), "event");
        assert_eq!(frame.payload, br#"{"bytes":"e30="}"#);

        let frame = decoder.next_frame().unwrap().unwrap();
        assert!(frame.payload.is_empty());
        assert_eq!(decoder.next_frame().unwrap(), None);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn corrupted_payload_fails_message_checksum() {
        let mut bytes = encode_frame(&[(":event-type", "chunk")], b"payload");
        let idx = bytes.len() - 6;
        bytes[idx] ^= 0xFF;
        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        assert_eq!(
            decoder.next_frame(),
            Err(EventStreamError::MessageChecksum)
        );
    }

    #[test]
    fn corrupted_prelude_is_rejected_before_buffering_payload() {
        let mut bytes = encode_frame(&[], b"x");
        bytes[9] ^= 0x01;
        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes[..12]);
        assert_eq!(decoder.next_frame(), Err(EventStreamError::PreludeChecksum));
    }

    #[test]
    fn exception_headers_are_exposed() {
        let bytes = encode_frame(
            &[
                (":message-type", "exception"),
                (":exception-type", "throttlingException"),
            ],
            br#"{"message":"slow down"}"#,
        );
        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.message_type(), "exception");
        assert_eq!(frame.exception_type(), Some("throttlingException"));
    }
}
