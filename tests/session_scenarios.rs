// ABOUTME: End-to-end terminal session scenarios over the in-memory connector
// Covers keystrokes, output ordering, resize, protocol failure, teardown races and reconnect

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use term_bridge::config::ReconnectConfig;
use term_bridge::models::{SessionId, SessionStatus, Target};
use term_bridge::terminal::resolver::FixedResolver;
use term_bridge::terminal::transport::{Link, LinkError, LinkMessage, RemoteEnd};
use term_bridge::terminal::{
    CellMetrics, ChannelState, Connector, Decoded, ExecBinding, Frame, FrameCodec, GridSize,
    MemoryConnector, PixelSize, Renderer, ResolutionError, SessionConfig, SessionError,
    SessionEvent, SessionResolver, TagMap, TerminalSession, TtydBinding,
};
use tokio::sync::{broadcast, mpsc, Notify};

const WAIT: Duration = Duration::from_secs(2);

/// Records everything the session does to the renderer.
struct FakeRenderer {
    writes: Mutex<Vec<Vec<u8>>>,
    resizes: Mutex<Vec<GridSize>>,
    container: Mutex<PixelSize>,
    cell: Mutex<CellMetrics>,
    font_epoch: AtomicU64,
    input: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl FakeRenderer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            writes: Mutex::new(Vec::new()),
            resizes: Mutex::new(Vec::new()),
            container: Mutex::new(PixelSize::new(800.0, 600.0)),
            cell: Mutex::new(CellMetrics::new(8.0, 16.0)),
            font_epoch: AtomicU64::new(0),
            input: Mutex::new(None),
        })
    }

    fn type_keys(&self, keys: &str) {
        let input = self.input.lock();
        let tx = input.as_ref().expect("session has not subscribed to input");
        tx.send(keys.as_bytes().to_vec()).expect("input stream closed");
    }

    fn set_container(&self, width: f64, height: f64) {
        *self.container.lock() = PixelSize::new(width, height);
    }

    /// Change the cell size without announcing a new font epoch.
    fn set_cell(&self, width: f64, height: f64) {
        *self.cell.lock() = CellMetrics::new(width, height);
    }

    fn bump_font_epoch(&self) {
        self.font_epoch.fetch_add(1, Ordering::SeqCst);
    }

    fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().clone()
    }
}

impl Renderer for FakeRenderer {
    fn write(&self, data: &[u8]) {
        self.writes.lock().push(data.to_vec());
    }

    fn resize(&self, size: GridSize) {
        self.resizes.lock().push(size);
    }

    fn container_size(&self) -> PixelSize {
        *self.container.lock()
    }

    fn measure_cell(&self) -> CellMetrics {
        *self.cell.lock()
    }

    fn font_epoch(&self) -> u64 {
        self.font_epoch.load(Ordering::SeqCst)
    }

    fn subscribe_input(&self) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.input.lock() = Some(tx);
        rx
    }
}

/// Counts resolutions so reconnects can be observed.
struct CountingResolver {
    calls: AtomicUsize,
}

#[async_trait]
impl SessionResolver for CountingResolver {
    async fn resolve(&self, _target: &Target) -> Result<SessionId, ResolutionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SessionId::new(format!("sess-{}", call)))
    }
}

/// Takes a while to answer, like a real control plane.
struct SlowResolver {
    delay: Duration,
    calls: AtomicUsize,
}

#[async_trait]
impl SessionResolver for SlowResolver {
    async fn resolve(&self, _target: &Target) -> Result<SessionId, ResolutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(SessionId::new("sess-abc"))
    }
}

/// Answers once, then the control plane is gone.
struct FailsAfterFirst {
    calls: AtomicUsize,
}

#[async_trait]
impl SessionResolver for FailsAfterFirst {
    async fn resolve(&self, _target: &Target) -> Result<SessionId, ResolutionError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(SessionId::new("sess-1"))
        } else {
            Err(ResolutionError::Unreachable("connection refused".to_string()))
        }
    }
}

/// Blocks resolution until the gate opens.
struct GatedResolver {
    gate: Arc<Notify>,
}

#[async_trait]
impl SessionResolver for GatedResolver {
    async fn resolve(&self, _target: &Target) -> Result<SessionId, ResolutionError> {
        self.gate.notified().await;
        Ok(SessionId::new("sess-abc"))
    }
}

/// Holds every handshake until the gate opens.
struct GatedConnector {
    gate: Arc<Notify>,
    inner: MemoryConnector,
}

#[async_trait]
impl Connector for GatedConnector {
    async fn connect(&self, endpoint: &str) -> Result<Link, LinkError> {
        self.gate.notified().await;
        self.inner.connect(endpoint).await
    }
}

struct Harness {
    session: TerminalSession,
    renderer: Arc<FakeRenderer>,
    remotes: mpsc::UnboundedReceiver<(String, RemoteEnd)>,
    events: broadcast::Receiver<SessionEvent>,
}

fn exec_harness(resolver: Arc<dyn SessionResolver>, config: SessionConfig) -> Harness {
    let (connector, remotes) = MemoryConnector::new();
    let renderer = FakeRenderer::new();
    let binding = Arc::new(ExecBinding::new(resolver, "ws://dash", 1024));
    let session = TerminalSession::new(binding, Arc::new(connector), renderer.clone(), config);
    let events = session.subscribe_events();
    Harness {
        session,
        renderer,
        remotes,
        events,
    }
}

fn fixed(id: &str) -> Arc<dyn SessionResolver> {
    Arc::new(FixedResolver::new(SessionId::new(id)))
}

fn container() -> Target {
    Target::container("default", "container-7", "exec")
}

async fn next_remote(remotes: &mut mpsc::UnboundedReceiver<(String, RemoteEnd)>) -> (String, RemoteEnd) {
    tokio::time::timeout(WAIT, remotes.recv())
        .await
        .expect("no connection was made")
        .expect("connector dropped")
}

async fn next_binary(remote: &mut RemoteEnd) -> Vec<u8> {
    loop {
        let message = tokio::time::timeout(WAIT, remote.received.recv())
            .await
            .expect("no frame arrived")
            .expect("link closed");
        if let LinkMessage::Binary(bytes) = message {
            return bytes;
        }
    }
}

/// Next frame the session wrote to the remote, skipping handshake and heartbeat.
async fn next_frame(remote: &mut RemoteEnd, codec: &mut FrameCodec) -> Frame {
    loop {
        let bytes = next_binary(remote).await;
        if let Decoded::Frame(frame) = codec.decode(&bytes).expect("session wrote an invalid frame") {
            return frame;
        }
    }
}

async fn next_event(events: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("no session event")
        .expect("event stream closed")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}

/// Nothing more arrives within a short grace period.
async fn assert_quiet(remote: &mut RemoteEnd) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    while let Ok(message) = remote.received.try_recv() {
        assert!(
            matches!(message, LinkMessage::Ping),
            "unexpected message {:?}",
            message
        );
    }
}

#[tokio::test]
async fn test_keystrokes_become_one_input_frame() {
    let mut h = exec_harness(fixed("sess-abc"), SessionConfig::default());
    let session_id = h.session.activate(container()).await.unwrap();
    assert_eq!(session_id, SessionId::new("sess-abc"));

    let (endpoint, mut remote) = next_remote(&mut h.remotes).await;
    assert_eq!(endpoint, "ws://dash/api/v1/misc/exec/sess-abc");

    let mut codec = FrameCodec::new(TagMap::EXEC);
    // Handshake first, then the initial fit
    match remote.received.recv().await {
        Some(LinkMessage::Text(handshake)) => assert!(handshake.contains("sess-abc")),
        other => panic!("expected handshake, got {:?}", other),
    }
    assert_eq!(next_frame(&mut remote, &mut codec).await, Frame::resize(100, 37));

    h.renderer.type_keys("ls\n");
    assert_eq!(next_frame(&mut remote, &mut codec).await, Frame::input("ls\n"));
    assert_quiet(&mut remote).await;

    assert_eq!(h.session.status(), Some(SessionStatus::Connected));
    assert_eq!(
        next_event(&mut h.events).await,
        SessionEvent::Connected {
            session_id: "sess-abc".to_string()
        }
    );
}

#[tokio::test]
async fn test_output_is_written_in_order() {
    let mut h = exec_harness(fixed("sess-abc"), SessionConfig::default());
    h.session.activate(container()).await.unwrap();
    let (_, remote) = next_remote(&mut h.remotes).await;

    let codec = FrameCodec::new(TagMap::EXEC);
    remote.send_bytes(codec.encode(&Frame::output("f")).unwrap());
    remote.send_bytes(codec.encode(&Frame::output("oo\n")).unwrap());

    let renderer = h.renderer.clone();
    wait_until(move || renderer.writes().len() == 2).await;
    assert_eq!(h.renderer.writes(), vec![b"f".to_vec(), b"oo\n".to_vec()]);
}

#[tokio::test]
async fn test_one_geometry_change_sends_one_resize() {
    let mut h = exec_harness(fixed("sess-abc"), SessionConfig::default());
    h.session.activate(container()).await.unwrap();
    let (_, mut remote) = next_remote(&mut h.remotes).await;
    let mut codec = FrameCodec::new(TagMap::EXEC);
    assert_eq!(next_frame(&mut remote, &mut codec).await, Frame::resize(100, 37));

    h.renderer.set_container(400.0, 300.0);
    assert_eq!(h.session.resize(), Some(GridSize::new(50, 18)));
    // Same geometry again is not a change
    assert_eq!(h.session.resize(), None);

    assert_eq!(next_frame(&mut remote, &mut codec).await, Frame::resize(50, 18));
    assert_quiet(&mut remote).await;
    assert_eq!(
        *h.renderer.resizes.lock(),
        vec![GridSize::new(100, 37), GridSize::new(50, 18)]
    );
    assert_eq!(h.session.last_size(), Some(GridSize::new(50, 18)));
}

#[tokio::test]
async fn test_zero_area_container_skips_resize() {
    let mut h = exec_harness(fixed("sess-abc"), SessionConfig::default());
    h.renderer.set_container(0.0, 0.0);
    h.session.activate(container()).await.unwrap();
    let (_, mut remote) = next_remote(&mut h.remotes).await;
    let mut codec = FrameCodec::new(TagMap::EXEC);

    assert_eq!(h.session.resize(), None);
    assert!(h.renderer.resizes.lock().is_empty());

    // The next layout event with a real area goes through
    h.renderer.set_container(800.0, 600.0);
    assert_eq!(h.session.resize(), Some(GridSize::new(100, 37)));
    assert_eq!(next_frame(&mut remote, &mut codec).await, Frame::resize(100, 37));
}

#[tokio::test]
async fn test_unknown_tag_loses_session() {
    let mut h = exec_harness(fixed("sess-abc"), SessionConfig::default());
    h.session.activate(container()).await.unwrap();
    let (_, remote) = next_remote(&mut h.remotes).await;
    assert!(matches!(next_event(&mut h.events).await, SessionEvent::Connected { .. }));

    remote.send_bytes(vec![0xff, 0x00, 0x00, 0x00, 0x01, b'x']);

    loop {
        match next_event(&mut h.events).await {
            SessionEvent::SessionLost { reason } => {
                assert!(reason.contains("protocol error"), "reason was {}", reason);
                break;
            }
            SessionEvent::Resized(_) => continue,
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(h.session.channel_state(), Some(ChannelState::Error));
    assert!(h.renderer.writes().is_empty());
    assert!(matches!(h.session.status(), Some(SessionStatus::Lost(_))));

    // A lost session can be activated again from scratch
    h.session.activate(container()).await.unwrap();
    assert_eq!(h.session.channel_state(), Some(ChannelState::Open));
}

#[tokio::test]
async fn test_second_activation_is_rejected() {
    let h = exec_harness(fixed("sess-abc"), SessionConfig::default());
    h.session.activate(container()).await.unwrap();
    assert_eq!(
        h.session.activate(container()).await,
        Err(SessionError::AlreadyActive)
    );
}

#[tokio::test]
async fn test_teardown_during_connect_closes_new_link() {
    let gate = Arc::new(Notify::new());
    let (inner, mut remotes) = MemoryConnector::new();
    let renderer = FakeRenderer::new();
    let session = TerminalSession::new(
        Arc::new(ExecBinding::new(fixed("sess-abc"), "ws://dash", 1024)),
        Arc::new(GatedConnector {
            gate: gate.clone(),
            inner,
        }),
        renderer.clone(),
        SessionConfig::default(),
    );

    let activation = {
        let session = session.clone();
        tokio::spawn(async move { session.activate(container()).await })
    };
    {
        let session = session.clone();
        wait_until(move || session.channel_state() == Some(ChannelState::Connecting)).await;
    }

    session.teardown().await;
    gate.notify_one();

    assert_eq!(activation.await.unwrap(), Err(SessionError::TornDown));
    let (_, mut remote) = next_remote(&mut remotes).await;
    let closed = tokio::time::timeout(WAIT, async {
        while let Some(message) = remote.received.recv().await {
            if message == LinkMessage::Close {
                return true;
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(closed, "late connection was never closed");

    assert!(renderer.input.lock().is_none(), "renderer wired after teardown");
    assert_eq!(session.channel_state(), None);
}

#[tokio::test]
async fn test_teardown_is_idempotent() {
    let mut h = exec_harness(fixed("sess-abc"), SessionConfig::default());
    h.session.activate(container()).await.unwrap();
    let (_, mut remote) = next_remote(&mut h.remotes).await;

    h.session.teardown().await;
    h.session.teardown().await;
    assert!(h.session.is_torn_down());
    assert_eq!(h.session.status(), Some(SessionStatus::Disconnected));

    let mut disconnected = 0;
    while let Ok(event) = h.events.try_recv() {
        if event == SessionEvent::Disconnected {
            disconnected += 1;
        }
    }
    assert_eq!(disconnected, 1);

    // The remote saw the connection close
    let mut saw_close = false;
    while let Ok(message) = remote.received.try_recv() {
        saw_close |= message == LinkMessage::Close;
    }
    assert!(saw_close);
}

#[tokio::test]
async fn test_reconnect_resolves_again() {
    let resolver = Arc::new(CountingResolver {
        calls: AtomicUsize::new(0),
    });
    let config = SessionConfig {
        reconnect: ReconnectConfig {
            enabled: true,
            interval_ms: 10,
            max_attempts: 3,
        },
        ..SessionConfig::default()
    };
    let mut h = exec_harness(resolver.clone(), config);

    assert_eq!(
        h.session.activate(container()).await,
        Ok(SessionId::new("sess-1"))
    );
    let (_, first) = next_remote(&mut h.remotes).await;
    first.hang_up();

    let (endpoint, _second) = next_remote(&mut h.remotes).await;
    assert_eq!(endpoint, "ws://dash/api/v1/misc/exec/sess-2");
    assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);

    let mut seen = Vec::new();
    loop {
        let event = next_event(&mut h.events).await;
        let done = matches!(&event, SessionEvent::Connected { session_id } if session_id == "sess-2");
        seen.push(event);
        if done {
            break;
        }
    }
    assert!(seen.iter().any(|e| matches!(e, SessionEvent::SessionLost { .. })));
    assert!(seen.contains(&SessionEvent::Reconnecting { attempt: 1 }));

    let session = h.session.clone();
    wait_until(move || session.record().map(|r| r.reconnect_attempts) == Some(1)).await;
    assert_eq!(h.session.session_id(), Some(SessionId::new("sess-2")));
}

#[tokio::test]
async fn test_ttyd_binding_uses_ascii_tags() {
    let (connector, mut remotes) = MemoryConnector::new();
    let renderer = FakeRenderer::new();
    let binding = Arc::new(TtydBinding::new(
        fixed("ttyd-h1"),
        "wss://dash",
        Some("t0k".to_string()),
        1024,
    ));
    let session = TerminalSession::new(
        binding,
        Arc::new(connector),
        renderer.clone(),
        SessionConfig::default(),
    );
    session.activate(Target::host("h1")).await.unwrap();

    let (endpoint, mut remote) = next_remote(&mut remotes).await;
    assert_eq!(endpoint, "wss://dash/api/v1/terminal/ttyd-h1/ws");

    let handshake = match remote.received.recv().await {
        Some(LinkMessage::Text(text)) => serde_json::from_str::<serde_json::Value>(&text).unwrap(),
        other => panic!("expected handshake, got {:?}", other),
    };
    assert_eq!(handshake["AuthToken"], "t0k");
    assert_eq!(handshake["columns"], 100);
    assert_eq!(handshake["rows"], 37);

    let resize = next_binary(&mut remote).await;
    assert_eq!(resize, vec![b'2', 0, 0, 0, 4, 0, 100, 0, 37]);

    renderer.type_keys("ls\n");
    assert_eq!(
        next_binary(&mut remote).await,
        vec![b'0', 0, 0, 0, 3, b'l', b's', b'\n']
    );

    // Output tagged '1' reaches the renderer
    remote.send_bytes(vec![b'1', 0, 0, 0, 2, b'h', b'i']);
    let r = renderer.clone();
    wait_until(move || !r.writes().is_empty()).await;
    assert_eq!(renderer.writes(), vec![b"hi".to_vec()]);
}

#[tokio::test]
async fn test_concurrent_activations_open_one_channel() {
    let resolver = Arc::new(SlowResolver {
        delay: Duration::from_millis(20),
        calls: AtomicUsize::new(0),
    });
    let mut h = exec_harness(resolver.clone(), SessionConfig::default());

    let first = {
        let session = h.session.clone();
        tokio::spawn(async move { session.activate(container()).await })
    };
    let second = {
        let session = h.session.clone();
        tokio::spawn(async move { session.activate(container()).await })
    };
    let mut results = vec![first.await.unwrap(), second.await.unwrap()];
    results.sort_by_key(|result| result.is_err());

    assert_eq!(results[0], Ok(SessionId::new("sess-abc")));
    assert_eq!(results[1], Err(SessionError::AlreadyActive));
    assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);

    let (_, remote) = next_remote(&mut h.remotes).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.remotes.try_recv().is_err(), "a second channel was opened");

    let codec = FrameCodec::new(TagMap::EXEC);
    remote.send_bytes(codec.encode(&Frame::output("ONE")).unwrap());
    let renderer = h.renderer.clone();
    wait_until(move || !renderer.writes().is_empty()).await;
    assert_eq!(h.renderer.writes(), vec![b"ONE".to_vec()]);
}

#[tokio::test]
async fn test_resize_follows_input_from_same_action() {
    let mut h = exec_harness(fixed("sess-abc"), SessionConfig::default());
    h.session.activate(container()).await.unwrap();
    let (_, mut remote) = next_remote(&mut h.remotes).await;
    let mut codec = FrameCodec::new(TagMap::EXEC);
    assert_eq!(next_frame(&mut remote, &mut codec).await, Frame::resize(100, 37));

    // A paste that reflows the layout, with no yield in between
    h.renderer.type_keys("paste");
    h.renderer.set_container(400.0, 300.0);
    assert_eq!(h.session.resize(), Some(GridSize::new(50, 18)));

    assert_eq!(next_frame(&mut remote, &mut codec).await, Frame::input("paste"));
    assert_eq!(next_frame(&mut remote, &mut codec).await, Frame::resize(50, 18));
}

#[tokio::test]
async fn test_font_change_remeasures_cell() {
    let mut h = exec_harness(fixed("sess-abc"), SessionConfig::default());
    h.session.activate(container()).await.unwrap();
    let (_, mut remote) = next_remote(&mut h.remotes).await;
    let mut codec = FrameCodec::new(TagMap::EXEC);
    assert_eq!(next_frame(&mut remote, &mut codec).await, Frame::resize(100, 37));

    // Cell size is cached until the font changes
    h.renderer.set_cell(10.0, 20.0);
    assert_eq!(h.session.resize(), None);

    assert_eq!(h.session.font_changed(), Some(GridSize::new(80, 30)));
    assert_eq!(next_frame(&mut remote, &mut codec).await, Frame::resize(80, 30));
    assert_quiet(&mut remote).await;

    // A new font epoch from the renderer also forces a re-measure
    h.renderer.set_cell(8.0, 16.0);
    h.renderer.bump_font_epoch();
    assert_eq!(h.session.resize(), Some(GridSize::new(100, 37)));
    assert_eq!(next_frame(&mut remote, &mut codec).await, Frame::resize(100, 37));
}

#[tokio::test]
async fn test_reconnect_gives_up_after_max_attempts() {
    let resolver = Arc::new(FailsAfterFirst {
        calls: AtomicUsize::new(0),
    });
    let config = SessionConfig {
        reconnect: ReconnectConfig {
            enabled: true,
            interval_ms: 10,
            max_attempts: 2,
        },
        ..SessionConfig::default()
    };
    let mut h = exec_harness(resolver.clone(), config);
    h.session.activate(container()).await.unwrap();
    let (_, remote) = next_remote(&mut h.remotes).await;
    remote.hang_up();

    let mut attempts_seen = Vec::new();
    loop {
        match next_event(&mut h.events).await {
            SessionEvent::Reconnecting { attempt } => attempts_seen.push(attempt),
            SessionEvent::ReconnectFailed { attempts } => {
                assert_eq!(attempts, 2);
                break;
            }
            SessionEvent::Connected { session_id } if session_id != "sess-1" => {
                panic!("reconnected as {}", session_id);
            }
            _ => {}
        }
    }
    assert_eq!(attempts_seen, vec![1, 2]);
    assert_eq!(resolver.calls.load(Ordering::SeqCst), 3);
    assert!(matches!(h.session.status(), Some(SessionStatus::Error(_))));
    assert_eq!(h.session.channel_state(), None);
}

#[tokio::test]
async fn test_input_stalled_by_flow_control() {
    let mut config = SessionConfig::default();
    config.channel.flow.backpressure_timeout_ms = Some(20);
    let mut h = exec_harness(fixed("sess-abc"), config);
    h.session.activate(container()).await.unwrap();
    let (_, mut remote) = next_remote(&mut h.remotes).await;
    let mut codec = FrameCodec::new(TagMap::EXEC);
    assert_eq!(next_frame(&mut remote, &mut codec).await, Frame::resize(100, 37));

    // The output after the pause proves the pause was applied
    let encoder = FrameCodec::new(TagMap::EXEC);
    let mut bytes = encoder.encode(&Frame::Pause).unwrap();
    bytes.extend(encoder.encode(&Frame::output("$ ")).unwrap());
    remote.send_bytes(bytes);
    let renderer = h.renderer.clone();
    wait_until(move || !renderer.writes().is_empty()).await;

    h.renderer.type_keys("stuck");
    loop {
        match next_event(&mut h.events).await {
            SessionEvent::Stalled => break,
            SessionEvent::Connected { .. } | SessionEvent::Resized(_) => continue,
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_quiet(&mut remote).await;
    assert_eq!(h.session.channel_state(), Some(ChannelState::Open));
}

#[tokio::test]
async fn test_teardown_during_resolution_keeps_disconnected() {
    let gate = Arc::new(Notify::new());
    let mut h = exec_harness(
        Arc::new(GatedResolver { gate: gate.clone() }),
        SessionConfig::default(),
    );

    let activation = {
        let session = h.session.clone();
        tokio::spawn(async move { session.activate(container()).await })
    };
    {
        let session = h.session.clone();
        wait_until(move || session.record().is_some()).await;
    }

    h.session.teardown().await;
    gate.notify_one();

    assert_eq!(activation.await.unwrap(), Err(SessionError::TornDown));
    assert_eq!(h.session.status(), Some(SessionStatus::Disconnected));
    assert_eq!(h.session.channel_state(), None);
    assert!(h.remotes.try_recv().is_err(), "connected after teardown");
}
