// ABOUTME: Binary frame codec: one tag byte, a u32 big-endian length, then the payload
// Buffers partial input so frames can arrive split across any number of reads

use crate::terminal::protocol::{Frame, FrameKind, GridSize};
use thiserror::Error;

/// Size of the tag byte plus the length header.
pub const HEADER_LEN: usize = 5;

/// Default upper bound on a single payload.
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Unknown frame tag 0x{0:02x}")]
    UnknownTag(u8),

    #[error("Frame payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Malformed {kind:?} payload: {reason}")]
    MalformedPayload { kind: FrameKind, reason: String },
}

/// Tag byte assignment for each frame kind on one backend's wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagMap {
    pub input: u8,
    pub output: u8,
    pub resize: u8,
    pub pause: u8,
    pub resume: u8,
    pub error: u8,
}

impl TagMap {
    /// Container exec backend.
    pub const EXEC: TagMap = TagMap {
        input: 0x01,
        output: 0x02,
        resize: 0x03,
        pause: 0x04,
        resume: 0x05,
        error: 0x06,
    };

    /// ttyd-style PTY forwarding backend, ASCII command digits.
    pub const TTYD: TagMap = TagMap {
        input: b'0',
        output: b'1',
        resize: b'2',
        pause: b'3',
        resume: b'4',
        error: b'5',
    };

    pub fn tag(&self, kind: FrameKind) -> u8 {
        match kind {
            FrameKind::Input => self.input,
            FrameKind::Output => self.output,
            FrameKind::Resize => self.resize,
            FrameKind::Pause => self.pause,
            FrameKind::Resume => self.resume,
            FrameKind::Error => self.error,
        }
    }

    pub fn kind(&self, tag: u8) -> Option<FrameKind> {
        FrameKind::ALL.into_iter().find(|kind| self.tag(*kind) == tag)
    }
}

impl Default for TagMap {
    fn default() -> Self {
        TagMap::EXEC
    }
}

/// Result of one decode attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Frame(Frame),
    /// Not enough buffered bytes for a whole frame yet
    Incomplete,
}

#[derive(Debug, Clone)]
pub struct FrameCodec {
    tags: TagMap,
    max_payload: usize,
    buffer: Vec<u8>,
}

impl FrameCodec {
    pub fn new(tags: TagMap) -> Self {
        Self::with_max_payload(tags, DEFAULT_MAX_PAYLOAD)
    }

    pub fn with_max_payload(tags: TagMap, max_payload: usize) -> Self {
        Self {
            tags,
            max_payload,
            buffer: Vec::new(),
        }
    }

    pub fn tags(&self) -> TagMap {
        self.tags
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Encode one frame. Payloads over `max_payload` are rejected, since `decode` would refuse them.
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
        let payload: std::borrow::Cow<'_, [u8]> = match frame {
            Frame::Input(data) | Frame::Output(data) => data.as_slice().into(),
            Frame::Resize(size) => {
                let mut buf = Vec::with_capacity(4);
                buf.extend_from_slice(&size.columns.to_be_bytes());
                buf.extend_from_slice(&size.rows.to_be_bytes());
                buf.into()
            }
            Frame::Pause | Frame::Resume => (&[][..]).into(),
            Frame::Error(message) => message.as_bytes().into(),
        };

        if payload.len() > self.max_payload {
            return Err(ProtocolError::PayloadTooLarge {
                len: payload.len(),
                max: self.max_payload,
            });
        }

        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.push(self.tags.tag(frame.kind()));
        // max_payload is well below u32::MAX
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Append bytes received from the transport.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Append `bytes` and try to take one frame off the buffer.
    pub fn decode(&mut self, bytes: &[u8]) -> Result<Decoded, ProtocolError> {
        self.push(bytes);
        self.next_frame()
    }

    pub fn next_frame(&mut self) -> Result<Decoded, ProtocolError> {
        let Some(&tag) = self.buffer.first() else {
            return Ok(Decoded::Incomplete);
        };
        // Reject garbage as soon as the tag byte is visible
        let kind = self.tags.kind(tag).ok_or(ProtocolError::UnknownTag(tag))?;

        if self.buffer.len() < HEADER_LEN {
            return Ok(Decoded::Incomplete);
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&self.buffer[1..HEADER_LEN]);
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > self.max_payload {
            return Err(ProtocolError::PayloadTooLarge {
                len,
                max: self.max_payload,
            });
        }
        if self.buffer.len() < HEADER_LEN + len {
            return Ok(Decoded::Incomplete);
        }

        let payload: Vec<u8> = self.buffer.drain(..HEADER_LEN + len).skip(HEADER_LEN).collect();
        Self::build_frame(kind, payload).map(Decoded::Frame)
    }

    /// Push `bytes` and drain every complete frame now available.
    pub fn decode_all(&mut self, bytes: &[u8]) -> Result<Vec<Frame>, ProtocolError> {
        self.push(bytes);
        let mut frames = Vec::new();
        while let Decoded::Frame(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial frame.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    fn build_frame(kind: FrameKind, payload: Vec<u8>) -> Result<Frame, ProtocolError> {
        match kind {
            FrameKind::Input => Ok(Frame::Input(payload)),
            FrameKind::Output => Ok(Frame::Output(payload)),
            FrameKind::Resize => {
                if payload.len() != 4 {
                    return Err(ProtocolError::MalformedPayload {
                        kind,
                        reason: format!("expected 4 bytes, got {}", payload.len()),
                    });
                }
                Ok(Frame::Resize(GridSize {
                    columns: u16::from_be_bytes([payload[0], payload[1]]),
                    rows: u16::from_be_bytes([payload[2], payload[3]]),
                }))
            }
            FrameKind::Pause | FrameKind::Resume => {
                if !payload.is_empty() {
                    return Err(ProtocolError::MalformedPayload {
                        kind,
                        reason: format!("expected no payload, got {} bytes", payload.len()),
                    });
                }
                Ok(if kind == FrameKind::Pause {
                    Frame::Pause
                } else {
                    Frame::Resume
                })
            }
            FrameKind::Error => Ok(Frame::Error(String::from_utf8_lossy(&payload).into_owned())),
        }
    }
}
