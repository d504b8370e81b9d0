//! `Content-Length` framing for JSON-RPC messages.

use bytes::{Buf, BufMut, BytesMut};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

use super::error::ServerError;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const MAX_HEADER_LEN: usize = 8 * 1024;
const DEFAULT_MAX_MESSAGE_LEN: usize = 256 * 1024 * 1024;

/// Frames JSON values as `Content-Length: N\r\n\r\n<body>`.
#[derive(Debug, Clone)]
pub struct JsonRpcCodec {
    max_message_len: usize,
}

impl JsonRpcCodec {
    pub fn new(max_message_len: usize) -> Self {
        Self { max_message_len }
    }
}

impl Default for JsonRpcCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_LEN)
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
}

fn parse_content_length(header: &str) -> Result<usize, ServerError> {
    let mut length = None;
    for line in header.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            let parsed = value
                .trim()
                .parse::<usize>()
                .map_err(|_| ServerError::protocol(format!("invalid Content-Length '{}'", value.trim())))?;
            length = Some(parsed);
        }
    }
    length.ok_or_else(|| ServerError::protocol("missing Content-Length header"))
}

impl Decoder for JsonRpcCodec {
    type Item = Value;
    type Error = ServerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, ServerError> {
        let Some(header_end) = find_terminator(src) else {
            if src.len() > MAX_HEADER_LEN {
                return Err(ServerError::protocol("message header too long"));
            }
            return Ok(None);
        };

        let header = std::str::from_utf8(&src[..header_end])
            .map_err(|_| ServerError::protocol("message header is not UTF-8"))?;
        let body_len = parse_content_length(header)?;
        if body_len > self.max_message_len {
            return Err(ServerError::protocol(format!(
                "message of {body_len} bytes exceeds limit of {}",
                self.max_message_len
            )));
        }

        let body_start = header_end + HEADER_TERMINATOR.len();
        let frame_len = body_start + body_len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(body_start);
        let body = src.split_to(body_len);
        let value = serde_json::from_slice(&body)
            .map_err(|e| ServerError::protocol(format!("invalid message body: {e}")))?;
        Ok(Some(value))
    }
}

impl Encoder<Value> for JsonRpcCodec {
    type Error = ServerError;

    fn encode(&mut self, item: Value, dst: &mut BytesMut) -> Result<(), ServerError> {
        let body = serde_json::to_vec(&item)?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        dst.reserve(header.len() + body.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(value: &Value) -> BytesMut {
        let mut buf = BytesMut::new();
        JsonRpcCodec::default().encode(value.clone(), &mut buf).unwrap();
        buf
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let mut buf = frame(&json!({"id": 1}));
        buf.extend_from_slice(&frame(&json!({"id": 2})));

        let mut codec = JsonRpcCodec::default();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(json!({"id": 1})));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(json!({"id": 2})));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn waits_for_a_partial_body() {
        let full = frame(&json!({"method": "x"}));
        let mut codec = JsonRpcCodec::default();
        let mut buf = BytesMut::from(&full[..full.len() - 3]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&full[full.len() - 3..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(json!({"method": "x"})));
    }

    #[test]
    fn header_names_are_case_insensitive_and_extra_headers_ignored() {
        let mut buf = BytesMut::from(
            "content-type: application/vscode-jsonrpc\r\ncontent-length: 2\r\n\r\n{}".as_bytes(),
        );
        assert_eq!(JsonRpcCodec::default().decode(&mut buf).unwrap(), Some(json!({})));
    }

    #[test]
    fn missing_length_is_a_protocol_error() {
        let mut buf = BytesMut::from("X-Other: 1\r\n\r\n{}".as_bytes());
        let err = JsonRpcCodec::default().decode(&mut buf).unwrap_err();
        assert!(matches!(err, ServerError::Protocol(_)));
    }

    #[test]
    fn oversized_messages_are_rejected() {
        let mut buf = frame(&json!({"payload": "0123456789"}));
        let err = JsonRpcCodec::new(4).decode(&mut buf).unwrap_err();
        assert!(matches!(err, ServerError::Protocol(_)));
    }
}
