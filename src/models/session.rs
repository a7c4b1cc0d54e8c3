// ABOUTME: Session data model representing one remote interactive process reached through the bridge

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque session token assigned by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which remote process a session talks to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Target {
    /// A shell exec'd inside a running container
    Container {
        namespace: String,
        pod: String,
        container: String,
    },
    /// A PTY forwarded by a ttyd-style host process
    Host { host: String },
}

impl Target {
    pub fn container(
        namespace: impl Into<String>,
        pod: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Target::Container {
            namespace: namespace.into(),
            pod: pod.into(),
            container: container.into(),
        }
    }

    pub fn host(host: impl Into<String>) -> Self {
        Target::Host { host: host.into() }
    }

    pub fn label(&self) -> String {
        match self {
            Target::Container {
                namespace,
                pod,
                container,
            } => format!("{}/{}/{}", namespace, pod, container),
            Target::Host { host } => host.clone(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Resolving,
    Connecting,
    Connected,
    Disconnected,
    Lost(String),
    Error(String),
}

impl SessionStatus {
    pub fn indicator(&self) -> &'static str {
        match self {
            SessionStatus::Resolving | SessionStatus::Connecting => "…",
            SessionStatus::Connected => "●",
            SessionStatus::Disconnected => "⏸",
            SessionStatus::Lost(_) | SessionStatus::Error(_) => "✗",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, SessionStatus::Connected)
    }
}

/// Bookkeeping record for one activation of a terminal session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub target: Target,
    /// Set once by the resolver and never replaced for this record
    pub session_id: Option<SessionId>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub reconnect_attempts: u32,
}

impl Session {
    pub fn new(target: Target) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            target,
            session_id: None,
            status: SessionStatus::Resolving,
            created_at: now,
            last_activity: now,
            reconnect_attempts: 0,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
        self.touch();
    }

    /// Returns false when an id was already assigned.
    pub fn assign_session_id(&mut self, session_id: SessionId) -> bool {
        if self.session_id.is_some() {
            return false;
        }
        self.session_id = Some(session_id);
        self.touch();
        true
    }
}
