use bytes::{Buf, Bytes, BytesMut};
use serde_json::Value;

use crate::{Command, CorrelationId, KvError, Result};

/// Largest frame accepted before the partial buffer is discarded.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Serialize a command into one outbound frame (no trailing newline).
///
/// ```
/// # use kvmux::{protocol::encode_request, Command, CorrelationId};
/// let frame = encode_request(&Command::Get { key: "cfg/foo".into() }, &"r1".into()).unwrap();
/// assert_eq!(
///     &frame[..],
///     br#"{"command":"kget","data":{"key":"cfg/foo"},"request_id":"r1"}"#
/// );
/// ```
pub fn encode_request(command: &Command, request_id: &CorrelationId) -> Result<Bytes> {
    let mut frame = serde_json::to_value(command)?;

    match &mut frame {
        Value::Object(map) => {
            map.insert("request_id".into(), Value::from(request_id.as_str()));
        }
        _ => {
            return Err(KvError::Protocol(format!(
                "{} did not serialize to an object",
                command.name()
            )))
        }
    }

    Ok(Bytes::from(serde_json::to_vec(&frame)?))
}

/// Reassembles newline-delimited frames from raw deliveries.
///
/// A single delivery may hold several frames, or only part of one; the
/// remainder is kept until the newline that completes it arrives. Blank
/// lines are skipped and a trailing `\r` is stripped.
#[derive(Debug)]
pub struct FrameBuffer {
    partial: BytesMut,
    /// Leading bytes of `partial` already known to hold no newline.
    scanned: usize,
    max_frame_len: usize,
}

impl FrameBuffer {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            partial: BytesMut::new(),
            scanned: 0,
            max_frame_len,
        }
    }

    /// Append a delivery and return every frame it completed, in order.
    ///
    /// # Errors
    ///
    /// Returns [`KvError::Protocol`] when an unterminated frame grows past
    /// the size limit. The oversized data is discarded; frames completed
    /// before it are lost too, so callers should treat this as a broken
    /// stream.
    pub fn push(&mut self, delivery: &[u8]) -> Result<Vec<Bytes>> {
        self.partial.extend_from_slice(delivery);

        let mut frames = Vec::new();

        while let Some(offset) = self.partial[self.scanned..].iter().position(|b| *b == b'\n') {
            let pos = self.scanned + offset;
            self.scanned = 0;

            let mut line = self.partial.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            frames.push(line.freeze());
        }
        self.scanned = self.partial.len();

        if self.partial.len() > self.max_frame_len {
            let len = self.partial.len();
            self.partial.advance(len);
            self.scanned = 0;
            return Err(KvError::Protocol(format!(
                "frame exceeds {} bytes without a terminator",
                self.max_frame_len
            )));
        }

        Ok(frames)
    }

    /// Bytes buffered while waiting for a terminator.
    pub fn buffered(&self) -> usize {
        self.partial.len()
    }

    /// Drop any partial frame, e.g. when the link it came from closes.
    pub fn clear(&mut self) {
        self.partial.clear();
        self.scanned = 0;
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_splits_several_frames_in_one_delivery() {
        // ---
        let mut buf = FrameBuffer::default();
        let frames = buf.push(b"{\"a\":1}\n{\"b\":2}\n\n{\"c\":3}\n").unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[0][..], b"{\"a\":1}");
        assert_eq!(&frames[2][..], b"{\"c\":3}");
        assert_eq!(buf.buffered(), 0);
    }

    #[test]
    fn test_keeps_partial_frame_until_terminated() {
        // ---
        let mut buf = FrameBuffer::default();
        assert!(buf.push(b"{\"type\":\"pu").unwrap().is_empty());
        assert_eq!(buf.buffered(), 11);

        let frames = buf.push(b"sh\"}\r\n{\"x\"").unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"{\"type\":\"push\"}");
        assert_eq!(buf.buffered(), 4);
    }

    #[test]
    fn test_large_frame_in_small_chunks() {
        // ---
        const LEN: usize = 8 * 1024 * 1024;

        let mut frame = Vec::with_capacity(LEN + 16);
        frame.extend_from_slice(b"{\"v\":\"");
        frame.resize(LEN, b'a');
        frame.extend_from_slice(b"\"}");

        let mut buf = FrameBuffer::default();
        for chunk in frame.chunks(8 * 1024) {
            assert!(buf.push(chunk).unwrap().is_empty());
            // bytes already searched are not searched again
            assert_eq!(buf.scanned, buf.buffered());
        }

        let frames = buf.push(b"\n{\"next\"").unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), frame.len());
        assert_eq!(&frames[0][..], &frame[..]);
        assert_eq!(buf.buffered(), 7);
        assert_eq!(buf.scanned, 7);

        buf.clear();
        assert_eq!(buf.scanned, 0);
    }

    #[test]
    fn test_oversized_partial_is_discarded() {
        // ---
        let mut buf = FrameBuffer::new(8);
        assert!(matches!(buf.push(b"0123456789"), Err(KvError::Protocol(_))));
        assert_eq!(buf.buffered(), 0);

        let frames = buf.push(b"{}\n").unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_encode_request_carries_token() {
        // ---
        let id = CorrelationId::generate();
        let frame = encode_request(&Command::List { prefix: Some("a/".into()) }, &id).unwrap();
        let value: Value = serde_json::from_slice(&frame).unwrap();

        assert_eq!(value["command"], "klist");
        assert_eq!(value["data"]["prefix"], "a/");
        assert_eq!(value["request_id"], id.as_str());
        assert!(!frame.contains(&b'\n'));
    }
}
