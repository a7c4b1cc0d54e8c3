// ABOUTME: Frame and event definitions shared by the codec, transport channel and terminal session
// Frames are the typed units exchanged with the remote PTY backend

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================
// Frames
// ============================================

/// Terminal grid size in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridSize {
    pub columns: u16,
    pub rows: u16,
}

impl GridSize {
    pub fn new(columns: u16, rows: u16) -> Self {
        Self { columns, rows }
    }
}

impl fmt::Display for GridSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.columns, self.rows)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Input,
    Output,
    Resize,
    Pause,
    Resume,
    Error,
}

impl FrameKind {
    pub const ALL: [FrameKind; 6] = [
        FrameKind::Input,
        FrameKind::Output,
        FrameKind::Resize,
        FrameKind::Pause,
        FrameKind::Resume,
        FrameKind::Error,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    // Client → backend
    Input(Vec<u8>),
    Resize(GridSize),

    // Backend → client
    Output(Vec<u8>),
    Error(String),

    // Flow control, either direction
    Pause,
    Resume,
}

impl Frame {
    /// Create an input frame
    pub fn input(data: impl Into<Vec<u8>>) -> Self {
        Frame::Input(data.into())
    }

    /// Create an output frame
    pub fn output(data: impl Into<Vec<u8>>) -> Self {
        Frame::Output(data.into())
    }

    /// Create a resize frame
    pub fn resize(columns: u16, rows: u16) -> Self {
        Frame::Resize(GridSize::new(columns, rows))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Frame::Error(message.into())
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Input(_) => FrameKind::Input,
            Frame::Output(_) => FrameKind::Output,
            Frame::Resize(_) => FrameKind::Resize,
            Frame::Pause => FrameKind::Pause,
            Frame::Resume => FrameKind::Resume,
            Frame::Error(_) => FrameKind::Error,
        }
    }
}

// ============================================
// Channel state and events
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Error,
}

impl ChannelState {
    /// `Closed` and `Error` can never be left again.
    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelState::Closed | ChannelState::Error)
    }
}

/// What a channel subscriber sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Frame(Frame),
    /// The channel entered `Error`; no further events follow
    Failed(String),
    /// The channel was closed locally; no further events follow
    Closed,
}

/// Lifecycle notifications for the UI collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected { session_id: String },
    Resized(GridSize),
    /// The connection failed; reconnecting, if enabled, starts from resolution
    SessionLost { reason: String },
    Reconnecting { attempt: u32 },
    /// Every reconnect attempt failed; the session stays lost
    ReconnectFailed { attempts: u32 },
    /// An input send gave up waiting for flow-control credit
    Stalled,
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_kinds() {
        assert_eq!(Frame::input("ls\n").kind(), FrameKind::Input);
        assert_eq!(Frame::resize(80, 24).kind(), FrameKind::Resize);
        assert_eq!(Frame::Pause.kind(), FrameKind::Pause);
        assert_eq!(Frame::error("x").kind(), FrameKind::Error);
    }

    #[test]
    fn test_terminal_states() {
        assert!(ChannelState::Closed.is_terminal());
        assert!(ChannelState::Error.is_terminal());
        assert!(!ChannelState::Closing.is_terminal());
        assert!(!ChannelState::Open.is_terminal());
    }
}
