// ABOUTME: Backend bindings mapping targets, endpoints, handshakes and tag bytes onto one wire format each
// The orchestration in TerminalSession is shared; only the binding differs between backends

use crate::config::AppConfig;
use crate::models::SessionId;
use crate::terminal::codec::{FrameCodec, TagMap};
use crate::terminal::protocol::GridSize;
use crate::terminal::resolver::{
    ControlPlaneClient, ExecSessionResolver, ResolutionError, SessionResolver, TtydSessionResolver,
};
use serde_json::json;
use std::sync::Arc;

pub trait TransportBinding: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    fn resolver(&self) -> Arc<dyn SessionResolver>;

    fn tags(&self) -> TagMap;

    fn codec(&self) -> FrameCodec {
        FrameCodec::with_max_payload(self.tags(), self.max_payload())
    }

    fn max_payload(&self) -> usize;

    /// Connection URL for an already resolved session.
    fn endpoint(&self, session_id: &SessionId) -> String;

    /// Text message sent once before any frame.
    fn handshake(&self, session_id: &SessionId, size: Option<GridSize>) -> Option<String>;
}

/// Container exec backend: the control plane hands out a session id that the socket binds to.
pub struct ExecBinding {
    resolver: Arc<dyn SessionResolver>,
    ws_base: String,
    max_payload: usize,
}

impl ExecBinding {
    pub fn new(resolver: Arc<dyn SessionResolver>, ws_base: impl Into<String>, max_payload: usize) -> Self {
        Self {
            resolver,
            ws_base: ws_base.into(),
            max_payload,
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, ResolutionError> {
        let client = ControlPlaneClient::new(&config.control_plane)?;
        Ok(Self::new(
            Arc::new(ExecSessionResolver::new(client)),
            config.ws_base_url(),
            config.protocol.max_payload_bytes,
        ))
    }
}

impl TransportBinding for ExecBinding {
    fn name(&self) -> &'static str {
        "exec"
    }

    fn resolver(&self) -> Arc<dyn SessionResolver> {
        self.resolver.clone()
    }

    fn tags(&self) -> TagMap {
        TagMap::EXEC
    }

    fn max_payload(&self) -> usize {
        self.max_payload
    }

    fn endpoint(&self, session_id: &SessionId) -> String {
        format!("{}/api/v1/misc/exec/{}", self.ws_base, session_id)
    }

    fn handshake(&self, session_id: &SessionId, _size: Option<GridSize>) -> Option<String> {
        Some(json!({ "op": "bind", "sessionId": session_id.as_str() }).to_string())
    }
}

/// ttyd-style PTY forwarding backend addressed by host terminal.
pub struct TtydBinding {
    resolver: Arc<dyn SessionResolver>,
    ws_base: String,
    auth_token: Option<String>,
    max_payload: usize,
}

impl TtydBinding {
    pub fn new(
        resolver: Arc<dyn SessionResolver>,
        ws_base: impl Into<String>,
        auth_token: Option<String>,
        max_payload: usize,
    ) -> Self {
        Self {
            resolver,
            ws_base: ws_base.into(),
            auth_token,
            max_payload,
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, ResolutionError> {
        let client = ControlPlaneClient::new(&config.control_plane)?;
        Ok(Self::new(
            Arc::new(TtydSessionResolver::new(client)),
            config.ws_base_url(),
            config.control_plane.token.clone(),
            config.protocol.max_payload_bytes,
        ))
    }
}

impl TransportBinding for TtydBinding {
    fn name(&self) -> &'static str {
        "ttyd"
    }

    fn resolver(&self) -> Arc<dyn SessionResolver> {
        self.resolver.clone()
    }

    fn tags(&self) -> TagMap {
        TagMap::TTYD
    }

    fn max_payload(&self) -> usize {
        self.max_payload
    }

    fn endpoint(&self, session_id: &SessionId) -> String {
        format!("{}/api/v1/terminal/{}/ws", self.ws_base, session_id)
    }

    fn handshake(&self, _session_id: &SessionId, size: Option<GridSize>) -> Option<String> {
        let size = size.unwrap_or(GridSize::new(80, 24));
        Some(
            json!({
                "AuthToken": self.auth_token.as_deref().unwrap_or_default(),
                "columns": size.columns,
                "rows": size.rows,
            })
            .to_string(),
        )
    }
}
