// ABOUTME: Session resolvers obtaining a session id from the control-plane API before connecting
// One resolver per backend: container exec sessions and ttyd host terminals

use crate::config::ControlPlaneConfig;
use crate::models::{SessionId, Target};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("Target not found: {0}")]
    NotFound(String),

    #[error("Not authorized to open a terminal on {0}")]
    Unauthorized(String),

    #[error("Control plane unreachable: {0}")]
    Unreachable(String),

    #[error("Control plane rejected the request: {0}")]
    Rejected(String),

    #[error("Unexpected control plane response: {0}")]
    InvalidResponse(String),

    #[error("Target {0} is not supported by this backend")]
    UnsupportedTarget(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionResolver: Send + Sync {
    async fn resolve(&self, target: &Target) -> Result<SessionId, ResolutionError>;
}

/// Response envelope used by every dashboard API endpoint.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TerminalResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TtydResponse {
    Session(TerminalResponse),
    Ack(String),
}

/// Decode an API response body, mapping HTTP and envelope failures.
fn parse_envelope<T: DeserializeOwned>(status: u16, body: &str, target: &Target) -> Result<T, ResolutionError> {
    match status {
        401 | 403 => return Err(ResolutionError::Unauthorized(target.label())),
        404 => return Err(ResolutionError::NotFound(target.label())),
        200..=299 => {}
        _ => {
            let message = serde_json::from_str::<Envelope<serde_json::Value>>(body)
                .map(|envelope| envelope.message)
                .unwrap_or_else(|_| body.trim().to_string());
            return Err(ResolutionError::Rejected(format!("HTTP {}: {}", status, message)));
        }
    }

    let envelope: Envelope<T> =
        serde_json::from_str(body).map_err(|e| ResolutionError::InvalidResponse(e.to_string()))?;
    if envelope.code != 200 {
        return Err(ResolutionError::Rejected(envelope.message));
    }
    envelope
        .data
        .ok_or_else(|| ResolutionError::InvalidResponse("response has no data".to_string()))
}

/// Thin HTTP client for the dashboard control plane.
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ControlPlaneClient {
    pub fn new(config: &ControlPlaneConfig) -> Result<Self, ResolutionError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| ResolutionError::Unreachable(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        target: &Target,
    ) -> Result<T, ResolutionError> {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request.send().await.map_err(|e| {
            warn!("Control plane request failed: {}", e);
            ResolutionError::Unreachable(e.to_string())
        })?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| ResolutionError::Unreachable(e.to_string()))?;
        debug!("Control plane answered HTTP {} for {}", status, target);
        parse_envelope(status, &body, target)
    }
}

/// Resolves container targets to exec shell sessions.
pub struct ExecSessionResolver {
    client: ControlPlaneClient,
}

impl ExecSessionResolver {
    pub fn new(client: ControlPlaneClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SessionResolver for ExecSessionResolver {
    async fn resolve(&self, target: &Target) -> Result<SessionId, ResolutionError> {
        let Target::Container {
            namespace,
            pod,
            container,
        } = target
        else {
            return Err(ResolutionError::UnsupportedTarget(target.label()));
        };

        let url = self.client.url(&format!(
            "/api/v1/misc/pod/{}/{}/shell/{}",
            namespace, pod, container
        ));
        info!("Requesting exec session for {}", target);
        let response: TerminalResponse = self.client.call(self.client.http.get(url), target).await?;
        if response.id.is_empty() {
            return Err(ResolutionError::InvalidResponse("empty session id".to_string()));
        }
        Ok(SessionId::new(response.id))
    }
}

/// Asks the control plane to provision a ttyd terminal for a host target.
pub struct TtydSessionResolver {
    client: ControlPlaneClient,
}

impl TtydSessionResolver {
    pub fn new(client: ControlPlaneClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SessionResolver for TtydSessionResolver {
    async fn resolve(&self, target: &Target) -> Result<SessionId, ResolutionError> {
        let Target::Host { host } = target else {
            return Err(ResolutionError::UnsupportedTarget(target.label()));
        };

        info!("Provisioning ttyd terminal for {}", host);
        let request = self
            .client
            .http
            .post(self.client.url("/api/v1/misc/terminal"))
            .json(&serde_json::json!({ "host": host }));
        let response: TtydResponse = self.client.call(request, target).await?;
        // Older control planes only acknowledge; the terminal is then addressed by host
        Ok(match response {
            TtydResponse::Session(session) if !session.id.is_empty() => SessionId::new(session.id),
            _ => SessionId::new(host.clone()),
        })
    }
}

/// Hands back a session id known in advance.
pub struct FixedResolver {
    session_id: SessionId,
}

impl FixedResolver {
    pub fn new(session_id: SessionId) -> Self {
        Self { session_id }
    }
}

#[async_trait]
impl SessionResolver for FixedResolver {
    async fn resolve(&self, _target: &Target) -> Result<SessionId, ResolutionError> {
        Ok(self.session_id.clone())
    }
}
