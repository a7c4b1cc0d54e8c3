// ABOUTME: Terminal session orchestrating resolver, transport channel, renderer and fit addon
// Shared by every backend; the TransportBinding supplies the backend-specific pieces

use crate::config::{AppConfig, FitConfig, ReconnectConfig};
use crate::models::{Session, SessionId, SessionStatus, Target};
use crate::terminal::addons::AddonRegistry;
use crate::terminal::binding::TransportBinding;
use crate::terminal::channel::{ChannelConfig, ChannelError, Subscription, TransportChannel};
use crate::terminal::fit::{FitAddon, FIT_ADDON};
use crate::terminal::protocol::{ChannelEvent, ChannelState, Frame, GridSize, SessionEvent};
use crate::terminal::renderer::Renderer;
use crate::terminal::resolver::ResolutionError;
use crate::terminal::transport::Connector;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Could not resolve session: {0}")]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("Session is already active")]
    AlreadyActive,

    #[error("Session was torn down")]
    TornDown,
}

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub channel: ChannelConfig,
    pub fit: FitConfig,
    pub reconnect: ReconnectConfig,
}

impl SessionConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            channel: ChannelConfig::from_app(config),
            fit: config.fit.clone(),
            reconnect: config.reconnect.clone(),
        }
    }
}

struct Inner {
    binding: Arc<dyn TransportBinding>,
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    renderer: Mutex<Option<Arc<dyn Renderer>>>,
    addons: AddonRegistry,
    events: broadcast::Sender<SessionEvent>,
    record: Mutex<Option<Session>>,
    channel: Mutex<Option<Arc<TransportChannel>>>,
    resize_tx: Mutex<Option<mpsc::UnboundedSender<GridSize>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    last_size: Mutex<Option<GridSize>>,
    /// Held by the one activation or reconnect attempt in flight
    activating: AtomicBool,
    torn_down: AtomicBool,
}

/// Releases the activation claim when the attempt ends, however it ends.
struct ActivationClaim<'a>(&'a AtomicBool);

impl Drop for ActivationClaim<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Handle to one terminal session. Clones share the same session.
#[derive(Clone)]
pub struct TerminalSession {
    inner: Arc<Inner>,
}

impl TerminalSession {
    pub fn new(
        binding: Arc<dyn TransportBinding>,
        connector: Arc<dyn Connector>,
        renderer: Arc<dyn Renderer>,
        config: SessionConfig,
    ) -> Self {
        let addons = AddonRegistry::new();
        addons.register(FIT_ADDON, Arc::new(FitAddon::new(config.fit.clone())));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                binding,
                connector,
                config,
                renderer: Mutex::new(Some(renderer)),
                addons,
                events,
                record: Mutex::new(None),
                channel: Mutex::new(None),
                resize_tx: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                reconnect_task: Mutex::new(None),
                last_size: Mutex::new(None),
                activating: AtomicBool::new(false),
                torn_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn addons(&self) -> &AddonRegistry {
        &self.inner.addons
    }

    pub fn record(&self) -> Option<Session> {
        self.inner.record.lock().clone()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.inner
            .record
            .lock()
            .as_ref()
            .and_then(|record| record.session_id.clone())
    }

    pub fn status(&self) -> Option<SessionStatus> {
        self.inner.record.lock().as_ref().map(|record| record.status.clone())
    }

    pub fn channel_state(&self) -> Option<ChannelState> {
        self.inner.channel.lock().as_ref().map(|channel| channel.state())
    }

    pub fn last_size(&self) -> Option<GridSize> {
        *self.inner.last_size.lock()
    }

    pub fn is_torn_down(&self) -> bool {
        self.inner.torn_down.load(Ordering::SeqCst)
    }

    /// Show or hide the renderer without touching the connection.
    pub fn set_visible(&self, visible: bool) {
        if let Some(renderer) = self.renderer() {
            renderer.set_visible(visible);
        }
    }

    /// Resolve, connect and wire the renderer to `target`.
    ///
    /// Only one activation runs at a time; a concurrent call gets `AlreadyActive`.
    pub async fn activate(&self, target: Target) -> Result<SessionId, SessionError> {
        if self.is_torn_down() {
            return Err(SessionError::TornDown);
        }
        let Some(_claim) = self.claim_activation() else {
            debug!("Activation already in progress");
            return Err(SessionError::AlreadyActive);
        };
        let stale = match self.inner.channel.lock().as_ref() {
            Some(channel) if !channel.state().is_terminal() => {
                return Err(SessionError::AlreadyActive);
            }
            Some(_) => true,
            None => false,
        };
        if let Some(task) = self.inner.reconnect_task.lock().take() {
            // An explicit activation supersedes a pending reconnect
            task.abort();
        }
        if stale {
            // A lost connection is replaced from scratch, never resumed
            self.release_connection().await;
        }
        self.connect(target).await
    }

    fn claim_activation(&self) -> Option<ActivationClaim<'_>> {
        if self.inner.activating.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(ActivationClaim(&self.inner.activating))
    }

    /// Caller must hold the activation claim.
    async fn connect(&self, target: Target) -> Result<SessionId, SessionError> {
        let inner = &self.inner;
        let binding = inner.binding.clone();
        {
            let mut record = inner.record.lock();
            if self.is_torn_down() {
                return Err(SessionError::TornDown);
            }
            *record = Some(Session::new(target.clone()));
        }
        info!("Activating {} terminal for {}", binding.name(), target);

        let session_id = match binding.resolver().resolve(&target).await {
            Ok(session_id) => session_id,
            Err(e) => {
                error!("Failed to resolve session for {}: {}", target, e);
                if self.is_torn_down() {
                    return Err(SessionError::TornDown);
                }
                self.set_status(SessionStatus::Error(e.to_string()));
                return Err(e.into());
            }
        };
        debug!("Resolved session {} for {}", session_id, target);
        let live = self.update_live_record(|record| {
            record.assign_session_id(session_id.clone());
            record.set_status(SessionStatus::Connecting);
        });
        if !live {
            return Err(SessionError::TornDown);
        }

        let channel = Arc::new(TransportChannel::new(
            inner.config.channel.clone(),
            binding.codec(),
            inner.connector.clone(),
        ));
        let subscription = channel.subscribe();
        {
            let mut slot = inner.channel.lock();
            if self.is_torn_down() {
                return Err(SessionError::TornDown);
            }
            *slot = Some(channel.clone());
        }

        let renderer = self.renderer().ok_or(SessionError::TornDown)?;
        let fit = self.fit().ok_or(SessionError::TornDown)?;
        let initial = fit.propose_for(renderer.as_ref());
        let endpoint = binding.endpoint(&session_id);

        if let Err(e) = channel
            .open(&endpoint, binding.handshake(&session_id, initial))
            .await
        {
            if self.is_torn_down() {
                return Err(SessionError::TornDown);
            }
            error!("Failed to open channel to {}: {}", endpoint, e);
            self.set_status(SessionStatus::Error(e.to_string()));
            self.release_connection().await;
            return Err(e.into());
        }

        let (resize_tx, resize_rx) = mpsc::unbounded_channel();
        let output = tokio::spawn(output_pump(
            Arc::downgrade(&self.inner),
            subscription,
            renderer.clone(),
            target,
        ));
        let outbound = tokio::spawn(outbound_pump(
            channel.clone(),
            renderer.subscribe_input(),
            resize_rx,
            inner.events.clone(),
        ));

        let adopted = {
            let mut tasks = inner.tasks.lock();
            if self.is_torn_down() {
                output.abort();
                outbound.abort();
                false
            } else {
                tasks.push(output);
                tasks.push(outbound);
                *inner.resize_tx.lock() = Some(resize_tx);
                true
            }
        };
        if !adopted {
            // Teardown won the race; never leave the new channel live
            channel.close().await;
            return Err(SessionError::TornDown);
        }

        *inner.last_size.lock() = None;
        self.set_status(SessionStatus::Connected);
        info!("Terminal session {} connected", session_id);
        let _ = inner.events.send(SessionEvent::Connected {
            session_id: session_id.to_string(),
        });

        // Bring the remote PTY to the current viewport
        self.resize();
        Ok(session_id)
    }

    /// Refit the grid and, when it changed, apply it locally and tell the remote.
    ///
    /// Returns `None` when nothing was sent, including while the container has
    /// no measurable area; the next layout event retries.
    pub fn resize(&self) -> Option<GridSize> {
        let renderer = self.renderer()?;
        let fit = self.fit()?;
        let Some(size) = fit.propose_for(renderer.as_ref()) else {
            debug!("Container has no area yet, skipping resize");
            return None;
        };

        {
            let mut last = self.inner.last_size.lock();
            if *last == Some(size) {
                return None;
            }
            *last = Some(size);
        }

        debug!("Resizing terminal to {}", size);
        renderer.resize(size);
        if let Some(tx) = self.inner.resize_tx.lock().as_ref() {
            let _ = tx.send(size);
        }
        let _ = self.inner.events.send(SessionEvent::Resized(size));
        Some(size)
    }

    /// The renderer's font or zoom changed; re-measure before the next fit.
    pub fn font_changed(&self) -> Option<GridSize> {
        self.fit()?.invalidate();
        self.resize()
    }

    /// Unsubscribe everything, close the channel and release the renderer.
    ///
    /// Idempotent, and safe while `activate` is still connecting.
    pub async fn teardown(&self) {
        if self.inner.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Tearing down terminal session");

        if let Some(task) = self.inner.reconnect_task.lock().take() {
            task.abort();
        }
        self.release_connection().await;
        self.inner.renderer.lock().take();
        self.inner.addons.clear();
        self.update_record(|record| record.set_status(SessionStatus::Disconnected));
        let _ = self.inner.events.send(SessionEvent::Disconnected);
    }

    async fn release_connection(&self) {
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            task.abort();
        }
        self.inner.resize_tx.lock().take();
        let channel = self.inner.channel.lock().take();
        if let Some(channel) = channel {
            channel.close().await;
        }
    }

    fn renderer(&self) -> Option<Arc<dyn Renderer>> {
        self.inner.renderer.lock().clone()
    }

    /// The fit addon registered at construction; gone only after teardown.
    fn fit(&self) -> Option<Arc<FitAddon>> {
        self.inner.addons.get::<FitAddon>(FIT_ADDON)
    }

    fn update_record(&self, update: impl FnOnce(&mut Session)) {
        if let Some(record) = self.inner.record.lock().as_mut() {
            update(record);
        }
    }

    /// Update the record unless teardown already happened; teardown's status wins.
    fn update_live_record(&self, update: impl FnOnce(&mut Session)) -> bool {
        let mut record = self.inner.record.lock();
        if self.is_torn_down() {
            return false;
        }
        if let Some(record) = record.as_mut() {
            update(record);
        }
        true
    }

    fn set_status(&self, status: SessionStatus) {
        self.update_live_record(|record| record.set_status(status));
    }

    fn on_lost(&self, reason: String, target: Target) {
        self.set_status(SessionStatus::Lost(reason.clone()));
        let _ = self.inner.events.send(SessionEvent::SessionLost { reason });
        if !self.inner.config.reconnect.enabled || self.is_torn_down() {
            return;
        }
        let task = tokio::spawn(self.clone().reconnect(target));
        if let Some(previous) = self.inner.reconnect_task.lock().replace(task) {
            previous.abort();
        }
    }

    fn reconnect(self, target: Target) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let config = self.inner.config.reconnect.clone();
            let interval = Duration::from_millis(config.interval_ms);

            for attempt in 1..=config.max_attempts {
                sleep(interval).await;
                if self.is_torn_down() {
                    return;
                }
                let Some(_claim) = self.claim_activation() else {
                    debug!("Activation in progress, abandoning reconnect");
                    return;
                };
                if self.channel_state().is_some_and(|state| !state.is_terminal()) {
                    debug!("Session already reconnected");
                    return;
                }
                info!("Reconnecting terminal session (attempt {})", attempt);
                let _ = self.inner.events.send(SessionEvent::Reconnecting { attempt });
                self.release_connection().await;

                match self.connect(target.clone()).await {
                    Ok(session_id) => {
                        self.update_record(|record| record.reconnect_attempts = attempt);
                        info!("Reconnected as session {}", session_id);
                        return;
                    }
                    Err(SessionError::TornDown) => return,
                    Err(e) => warn!("Reconnect attempt {} failed: {}", attempt, e),
                }
            }
            warn!("Max reconnection attempts reached");
            let _ = self.inner.events.send(SessionEvent::ReconnectFailed {
                attempts: config.max_attempts,
            });
        })
    }
}

async fn output_pump(
    session: Weak<Inner>,
    mut subscription: Subscription,
    renderer: Arc<dyn Renderer>,
    target: Target,
) {
    while let Some(event) = subscription.recv().await {
        match event {
            ChannelEvent::Frame(Frame::Output(data)) => renderer.write(&data),
            ChannelEvent::Frame(frame) => debug!("Ignoring {:?} frame on output path", frame.kind()),
            ChannelEvent::Failed(reason) => {
                warn!("Terminal session lost: {}", reason);
                let Some(inner) = session.upgrade() else {
                    return;
                };
                TerminalSession { inner }.on_lost(reason, target);
                return;
            }
            ChannelEvent::Closed => return,
        }
    }
}

/// Single ordered path for input and resize frames.
async fn outbound_pump(
    channel: Arc<TransportChannel>,
    mut input_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    mut resize_rx: mpsc::UnboundedReceiver<GridSize>,
    events: broadcast::Sender<SessionEvent>,
) {
    let mut input_open = true;
    loop {
        let frame = tokio::select! {
            // Input already emitted goes out before a resize requested after it
            biased;
            data = input_rx.recv(), if input_open => match data {
                Some(data) => Frame::Input(data),
                None => {
                    debug!("Renderer input stream ended");
                    input_open = false;
                    continue;
                }
            },
            size = resize_rx.recv() => match size {
                Some(size) => Frame::Resize(size),
                None => break,
            },
        };

        match channel.send(frame).await {
            Ok(()) => {}
            Err(ChannelError::BackpressureTimeout(limit)) => {
                warn!("Dropped input after waiting {:?} for flow control", limit);
                let _ = events.send(SessionEvent::Stalled);
            }
            Err(e) => {
                debug!("Outbound pump stopping: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::binding::ExecBinding;
    use crate::terminal::renderer::{CellMetrics, PixelSize};
    use crate::terminal::resolver::MockSessionResolver;
    use crate::terminal::transport::MemoryConnector;

    struct NullRenderer;

    impl Renderer for NullRenderer {
        fn write(&self, _data: &[u8]) {}
        fn resize(&self, _size: GridSize) {}
        fn container_size(&self) -> PixelSize {
            PixelSize::new(800.0, 600.0)
        }
        fn measure_cell(&self) -> CellMetrics {
            CellMetrics::new(8.0, 16.0)
        }
        fn subscribe_input(&self) -> mpsc::UnboundedReceiver<Vec<u8>> {
            mpsc::unbounded_channel().1
        }
    }

    fn session_with(resolver: MockSessionResolver) -> (TerminalSession, Arc<MemoryConnector>) {
        let (connector, _remotes) = MemoryConnector::new();
        let connector = Arc::new(connector);
        let binding = Arc::new(ExecBinding::new(Arc::new(resolver), "ws://dash", 1024));
        let session = TerminalSession::new(
            binding,
            connector.clone(),
            Arc::new(NullRenderer),
            SessionConfig::default(),
        );
        (session, connector)
    }

    #[tokio::test]
    async fn test_resolution_failure_is_surfaced() {
        let mut resolver = MockSessionResolver::new();
        resolver
            .expect_resolve()
            .times(1)
            .returning(|target| Err(ResolutionError::Unauthorized(target.label())));
        let (session, _connector) = session_with(resolver);

        let result = session.activate(Target::container("ns", "pod", "c")).await;
        assert_eq!(
            result,
            Err(SessionError::Resolution(ResolutionError::Unauthorized(
                "ns/pod/c".to_string()
            )))
        );
        assert!(matches!(session.status(), Some(SessionStatus::Error(_))));
        assert_eq!(session.channel_state(), None);
    }

    #[tokio::test]
    async fn test_open_failure_releases_channel() {
        let mut resolver = MockSessionResolver::new();
        resolver
            .expect_resolve()
            .returning(|_| Ok(SessionId::new("sess-abc")));
        let binding = Arc::new(ExecBinding::new(Arc::new(resolver), "ws://dash", 1024));
        let session = TerminalSession::new(
            binding,
            Arc::new(MemoryConnector::refusing()),
            Arc::new(NullRenderer),
            SessionConfig::default(),
        );

        let result = session.activate(Target::container("ns", "pod", "c")).await;
        assert!(matches!(result, Err(SessionError::Channel(_))));
        assert_eq!(session.channel_state(), None);
        // The caller may retry from scratch
        assert!(matches!(
            session.activate(Target::container("ns", "pod", "c")).await,
            Err(SessionError::Channel(_))
        ));
    }

    #[tokio::test]
    async fn test_fit_addon_registered_and_cleared() {
        let (session, _connector) = session_with(MockSessionResolver::new());
        assert!(session.addons().get::<FitAddon>(FIT_ADDON).is_some());

        session.teardown().await;
        assert!(session.addons().get::<FitAddon>(FIT_ADDON).is_none());
        assert_eq!(session.resize(), None);
        assert_eq!(
            session.activate(Target::host("h")).await,
            Err(SessionError::TornDown)
        );
    }

    #[tokio::test]
    async fn test_resize_before_activation_applies_locally_only() {
        let (session, _connector) = session_with(MockSessionResolver::new());
        assert_eq!(session.resize(), Some(GridSize::new(100, 37)));
        assert_eq!(session.resize(), None);
    }
}
