use serde::Serialize;
use thiserror::Error;

use super::{MAX_DAP_HEADER_BYTES, MAX_DAP_MESSAGE_BYTES};
use crate::transport::Transport;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("DAP header section exceeds maximum size ({MAX_DAP_HEADER_BYTES} bytes)")]
    HeaderTooLarge,
    #[error("DAP message missing Content-Length header")]
    MissingContentLength,
    #[error("invalid Content-Length {0:?}")]
    InvalidContentLength(String),
    #[error("DAP message Content-Length {0} exceeds maximum allowed size {MAX_DAP_MESSAGE_BYTES}")]
    MessageTooLarge(usize),
    #[error("DAP header is not UTF-8")]
    HeaderNotUtf8,
    #[error("malformed JSON body: {0}")]
    Json(#[from] serde_json::Error),
}

/// Incremental decoder for DAP framing over a polled transport.
///
/// Messages are framed with an HTTP-like header section:
///
/// ```text
/// Content-Length: 123\r\n
/// \r\n
/// { ...json... }
/// ```
///
/// The transport is non-blocking, so bytes arrive in arbitrary slices; the
/// decoder accumulates until a complete frame is available and hands back
/// one body at a time.
#[derive(Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain whatever the transport has buffered, then try to extract one
    /// complete message body. `None` means no full frame is available yet.
    pub fn poll(&mut self, transport: &mut dyn Transport) -> Option<Result<Vec<u8>, CodecError>> {
        let pending = transport.peek();
        if pending > 0 {
            let start = self.buf.len();
            self.buf.resize(start + pending, 0);
            if !transport.recv(&mut self.buf[start..]) {
                self.buf.truncate(start);
            }
        }
        self.try_frame()
    }

    /// Discard buffered bytes, e.g. after the peer went away.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    fn try_frame(&mut self) -> Option<Result<Vec<u8>, CodecError>> {
        let header_end = match find_header_end(&self.buf) {
            Some(end) => end,
            None => {
                if self.buf.len() > MAX_DAP_HEADER_BYTES {
                    self.buf.clear();
                    return Some(Err(CodecError::HeaderTooLarge));
                }
                return None;
            }
        };

        let content_length = match parse_content_length(&self.buf[..header_end]) {
            Ok(len) => len,
            Err(err) => {
                // Drop the malformed frame; resynchronization is left to the
                // peer reconnecting.
                self.buf.clear();
                return Some(Err(err));
            }
        };

        if content_length > MAX_DAP_MESSAGE_BYTES {
            self.buf.clear();
            return Some(Err(CodecError::MessageTooLarge(content_length)));
        }

        let body_start = header_end;
        if self.buf.len() < body_start + content_length {
            return None;
        }

        let body = self.buf[body_start..body_start + content_length].to_vec();
        self.buf.drain(..body_start + content_length);
        Some(Ok(body))
    }
}

/// Returns the index just past the blank line terminating the header
/// section.
fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

fn parse_content_length(header: &[u8]) -> Result<usize, CodecError> {
    let text = std::str::from_utf8(header).map_err(|_| CodecError::HeaderNotUtf8)?;
    for line in text.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("Content-Length") {
                let value = value.trim();
                return value
                    .parse::<usize>()
                    .map_err(|_| CodecError::InvalidContentLength(value.to_string()));
            }
        }
    }
    Err(CodecError::MissingContentLength)
}

/// Serialize `message` with DAP framing, ready for `Transport::send`.
pub fn encode_message<T: Serialize>(message: &T) -> Result<Vec<u8>, CodecError> {
    let body = serde_json::to_vec(message)?;
    let mut out = Vec::with_capacity(body.len() + 32);
    out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::pipe;
    use serde_json::json;

    #[test]
    fn roundtrips_a_framed_message() {
        let msg = json!({
            "seq": 1,
            "type": "request",
            "command": "initialize",
            "arguments": {"adapterID": "tarn"}
        });

        let (mut a, mut b) = pipe();
        let bytes = encode_message(&msg).unwrap();
        assert!(a.send(&bytes));

        let mut decoder = FrameDecoder::new();
        let body = decoder.poll(&mut b).unwrap().unwrap();
        let decoded: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn reassembles_messages_split_across_polls() {
        let msg = json!({"seq": 2, "type": "request", "command": "threads"});
        let bytes = encode_message(&msg).unwrap();
        let (mut a, mut b) = pipe();
        let mut decoder = FrameDecoder::new();

        let mut found = None;
        for chunk in bytes.chunks(7) {
            assert!(a.send(chunk));
            if let Some(result) = decoder.poll(&mut b) {
                assert!(found.is_none(), "frame produced twice");
                found = Some(result.unwrap());
            }
        }
        let decoded: serde_json::Value = serde_json::from_slice(&found.unwrap()).unwrap();
        assert_eq!(decoded["command"], "threads");
    }

    #[test]
    fn accepts_additional_headers() {
        let payload = br#"{"seq":1,"type":"request","command":"threads"}"#;
        let framed = format!(
            "Content-Length: {}\r\nContent-Type: application/vscode-jsonrpc; charset=utf-8\r\n\r\n{}",
            payload.len(),
            std::str::from_utf8(payload).unwrap()
        );

        let (mut a, mut b) = pipe();
        assert!(a.send(framed.as_bytes()));
        let mut decoder = FrameDecoder::new();
        let body = decoder.poll(&mut b).unwrap().unwrap();
        assert_eq!(body, payload);
    }

    #[test]
    fn two_back_to_back_frames_come_out_one_at_a_time() {
        let first = encode_message(&json!({"seq": 1, "type": "request", "command": "a"})).unwrap();
        let second = encode_message(&json!({"seq": 2, "type": "request", "command": "b"})).unwrap();

        let (mut a, mut b) = pipe();
        let mut joined = first.clone();
        joined.extend_from_slice(&second);
        assert!(a.send(&joined));

        let mut decoder = FrameDecoder::new();
        let one: serde_json::Value =
            serde_json::from_slice(&decoder.poll(&mut b).unwrap().unwrap()).unwrap();
        let two: serde_json::Value =
            serde_json::from_slice(&decoder.poll(&mut b).unwrap().unwrap()).unwrap();
        assert_eq!(one["command"], "a");
        assert_eq!(two["command"], "b");
    }

    #[test]
    fn rejects_oversized_content_length_without_buffering_a_body() {
        let framed = format!("Content-Length: {}\r\n\r\n", MAX_DAP_MESSAGE_BYTES + 1);
        let (mut a, mut b) = pipe();
        assert!(a.send(framed.as_bytes()));

        let mut decoder = FrameDecoder::new();
        let err = decoder.poll(&mut b).unwrap().unwrap_err();
        assert!(matches!(err, CodecError::MessageTooLarge(_)));
    }

    #[test]
    fn rejects_missing_content_length() {
        let (mut a, mut b) = pipe();
        assert!(a.send(b"X-Other: 1\r\n\r\n"));
        let mut decoder = FrameDecoder::new();
        let err = decoder.poll(&mut b).unwrap().unwrap_err();
        assert!(matches!(err, CodecError::MissingContentLength));
    }

    #[test]
    fn rejects_unterminated_oversized_header() {
        let (mut a, mut b) = pipe();
        let long = vec![b'A'; MAX_DAP_HEADER_BYTES + 1];
        assert!(a.send(&long));
        let mut decoder = FrameDecoder::new();
        let err = decoder.poll(&mut b).unwrap().unwrap_err();
        assert!(matches!(err, CodecError::HeaderTooLarge));
    }
}
