// ABOUTME: Terminal bridge module connecting an emulator to a remote PTY over a framed connection
// Codec, transport channel, fit addon, resolvers and the session orchestrating them

pub mod addons;
pub mod binding;
pub mod channel;
pub mod codec;
pub mod fit;
pub mod protocol;
pub mod renderer;
pub mod resolver;
pub mod session;
pub mod transport;

pub use addons::{Addon, AddonRegistry};
pub use binding::{ExecBinding, TransportBinding, TtydBinding};
pub use channel::{ChannelConfig, ChannelError, Subscription, TransportChannel};
pub use codec::{Decoded, FrameCodec, ProtocolError, TagMap};
pub use fit::{FitAddon, Geometry, FIT_ADDON};
pub use protocol::{ChannelEvent, ChannelState, Frame, FrameKind, GridSize, SessionEvent};
pub use renderer::{CellMetrics, PixelSize, Renderer};
pub use resolver::{ResolutionError, SessionResolver};
pub use session::{SessionConfig, SessionError, TerminalSession};
pub use transport::{Connector, MemoryConnector, WebSocketConnector};
