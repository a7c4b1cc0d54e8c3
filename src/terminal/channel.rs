// ABOUTME: Transport channel owning one persistent connection to a terminal backend
// Drives the Idle → Connecting → Open → Closing/Closed/Error lifecycle, flow-control credit and frame delivery

use crate::config::{AppConfig, DeliveryConfig, FlowControlConfig, OverflowPolicy, SendPolicy};
use crate::terminal::codec::{Decoded, FrameCodec, ProtocolError};
use crate::terminal::protocol::{ChannelEvent, ChannelState, Frame};
use crate::terminal::transport::{Connector, Link, LinkError, LinkMessage, LinkSink, LinkStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// How long `close` waits for queued frames to be flushed.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("Channel is not connected")]
    NotConnected,

    #[error("Send blocked on flow control for more than {0:?}")]
    BackpressureTimeout(Duration),

    #[error("Connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Channel cannot be opened from state {0:?}")]
    InvalidState(ChannelState),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transport error: {0}")]
    Link(#[from] LinkError),
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub connect_timeout: Duration,
    pub heartbeat_interval: Option<Duration>,
    pub send_policy: SendPolicy,
    pub flow: FlowControlConfig,
    pub delivery: DeliveryConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::from_app(&AppConfig::default())
    }
}

impl ChannelConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        let heartbeat_ms = config.transport.heartbeat_interval_ms;
        Self {
            connect_timeout: config.connect_timeout(),
            heartbeat_interval: (heartbeat_ms > 0).then(|| Duration::from_millis(heartbeat_ms)),
            send_policy: config.transport.send_policy,
            flow: config.flow_control.clone(),
            delivery: config.delivery.clone(),
        }
    }
}

// ============================================
// Subscriptions
// ============================================

struct SubscriberQueue {
    events: Mutex<VecDeque<ChannelEvent>>,
    notify: Notify,
    closed: AtomicBool,
}

impl SubscriberQueue {
    fn new() -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Queue a final event and refuse anything after it.
    fn finish(&self, event: ChannelEvent) {
        {
            let mut events = self.events.lock();
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            events.push_back(event);
            self.closed.store(true, Ordering::SeqCst);
        }
        self.notify.notify_one();
    }
}

/// A listener's view of the channel. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    queue: Arc<SubscriberQueue>,
    shared: Weak<Shared>,
}

impl Subscription {
    /// Next event, or `None` once the channel has finished and the queue is drained.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        loop {
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.queue.closed.load(Ordering::SeqCst) {
                // Events may have been queued between the check and the flag
                return self.try_recv();
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<ChannelEvent> {
        let event = self.queue.events.lock().pop_front();
        if event.is_some() {
            if let Some(shared) = self.shared.upgrade() {
                shared.on_drained();
            }
        }
        event
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.subscribers.lock().retain(|(id, _)| *id != self.id);
            shared.on_drained();
        }
    }
}

// ============================================
// Shared channel state
// ============================================

struct Shared {
    config: ChannelConfig,
    encoder: FrameCodec,
    state: watch::Sender<ChannelState>,
    credit: watch::Sender<u64>,
    subscribers: Mutex<Vec<(u64, Arc<SubscriberQueue>)>>,
    next_subscriber: AtomicU64,
    /// Frames sent before the channel opened
    pending: Mutex<VecDeque<Frame>>,
    /// Also guards state checks on the send path
    writer: Mutex<Option<mpsc::UnboundedSender<LinkMessage>>>,
    upstream_paused: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    fn current_state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Move to `to` unless the channel already reached a terminal state.
    fn transition(&self, to: ChannelState) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == to {
                return false;
            }
            debug!("Channel state {:?} -> {:?}", state, to);
            *state = to;
            true
        })
    }

    fn write_frame(&self, frame: &Frame) -> Result<(), ChannelError> {
        let writer = self.writer.lock();
        if self.current_state() != ChannelState::Open {
            return Err(ChannelError::NotConnected);
        }
        let tx = writer.as_ref().ok_or(ChannelError::NotConnected)?;
        let bytes = self.encoder.encode(frame)?;
        tx.send(LinkMessage::Binary(bytes))
            .map_err(|_| ChannelError::NotConnected)
    }

    fn deliver(&self, event: ChannelEvent) {
        let delivery = &self.config.delivery;
        let mut crossed_high_water = false;

        for (id, queue) in self.subscribers.lock().iter() {
            {
                let mut events = queue.events.lock();
                if events.len() >= delivery.queue_capacity {
                    events.pop_front();
                    warn!("Subscriber {} queue full, dropped oldest event", id);
                }
                events.push_back(event.clone());
                if events.len() >= delivery.high_water {
                    crossed_high_water = true;
                }
            }
            queue.notify.notify_one();
        }

        if crossed_high_water
            && delivery.overflow == OverflowPolicy::Backpressure
            && !self.upstream_paused.swap(true, Ordering::SeqCst)
        {
            debug!("Delivery queue above high water, pausing remote");
            if let Err(e) = self.write_frame(&Frame::Pause) {
                debug!("Could not send pause upstream: {}", e);
            }
        }
    }

    fn on_drained(&self) {
        if self.config.delivery.overflow != OverflowPolicy::Backpressure
            || !self.upstream_paused.load(Ordering::SeqCst)
        {
            return;
        }
        let low_water = self.config.delivery.low_water;
        let drained = self
            .subscribers
            .lock()
            .iter()
            .all(|(_, queue)| queue.len() <= low_water);
        if drained && self.upstream_paused.swap(false, Ordering::SeqCst) {
            debug!("Delivery queues drained, resuming remote");
            if let Err(e) = self.write_frame(&Frame::Resume) {
                debug!("Could not send resume upstream: {}", e);
            }
        }
    }

    fn finish_subscribers(&self, event: ChannelEvent) {
        let subscribers = std::mem::take(&mut *self.subscribers.lock());
        for (_, queue) in subscribers {
            queue.finish(event.clone());
        }
    }

    /// Force the channel into `Error` and tell every listener.
    fn fail(&self, reason: String) {
        {
            let mut writer = self.writer.lock();
            if self.current_state() == ChannelState::Closing {
                // A failure while closing is just the close completing
                return;
            }
            if !self.transition(ChannelState::Error) {
                return;
            }
            writer.take();
        }
        error!("Transport channel failed: {}", reason);
        *self.last_error.lock() = Some(reason.clone());
        self.pending.lock().clear();
        self.finish_subscribers(ChannelEvent::Failed(reason));
    }

    fn handle_inbound(&self, frame: Frame) -> bool {
        match frame {
            Frame::Output(_) => self.deliver(ChannelEvent::Frame(frame)),
            Frame::Pause => {
                debug!("Remote paused input");
                self.credit.send_replace(0);
            }
            Frame::Resume => {
                debug!("Remote resumed input");
                self.credit.send_replace(self.config.flow.credit_limit);
            }
            Frame::Error(message) => {
                self.fail(format!("remote error: {}", message));
                return false;
            }
            Frame::Input(_) | Frame::Resize(_) => {
                warn!("Ignoring unexpected {:?} frame from remote", frame.kind());
            }
        }
        true
    }
}

// ============================================
// Channel
// ============================================

pub struct TransportChannel {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

impl TransportChannel {
    pub fn new(config: ChannelConfig, codec: FrameCodec, connector: Arc<dyn Connector>) -> Self {
        let (state, _) = watch::channel(ChannelState::Idle);
        let (credit, _) = watch::channel(config.flow.credit_limit);
        Self {
            shared: Arc::new(Shared {
                config,
                encoder: codec,
                state,
                credit,
                subscribers: Mutex::new(Vec::new()),
                next_subscriber: AtomicU64::new(0),
                pending: Mutex::new(VecDeque::new()),
                writer: Mutex::new(None),
                upstream_paused: AtomicBool::new(false),
                last_error: Mutex::new(None),
            }),
            connector,
            reader: Mutex::new(None),
            writer_task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.shared.current_state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    pub fn credit(&self) -> u64 {
        *self.shared.credit.borrow()
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.shared.next_subscriber.fetch_add(1, Ordering::SeqCst);
        let queue = Arc::new(SubscriberQueue::new());
        match self.state() {
            ChannelState::Error => queue.finish(ChannelEvent::Failed(
                self.last_error().unwrap_or_else(|| "channel failed".to_string()),
            )),
            ChannelState::Closing | ChannelState::Closed => queue.finish(ChannelEvent::Closed),
            _ => self.shared.subscribers.lock().push((id, queue.clone())),
        }
        Subscription {
            id,
            queue,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Establish the connection. `handshake` is written once before any frame.
    pub async fn open(&self, endpoint: &str, handshake: Option<String>) -> Result<(), ChannelError> {
        let started = self.shared.state.send_if_modified(|state| {
            if *state == ChannelState::Idle {
                *state = ChannelState::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(ChannelError::InvalidState(self.state()));
        }

        info!("Opening transport channel to {}", endpoint);
        let timeout = self.shared.config.connect_timeout;
        let result = tokio::time::timeout(timeout, self.connector.connect(endpoint)).await;

        if self.state() == ChannelState::Closing {
            info!("Channel closed while connecting, dropping new connection");
            if let Ok(Ok(mut link)) = result {
                let _ = link.sink.send(LinkMessage::Close).await;
                let _ = link.sink.close().await;
            }
            self.finish_close();
            return Err(ChannelError::NotConnected);
        }

        let link = match result {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                self.shared.fail(format!("handshake failed: {}", e));
                return Err(e.into());
            }
            Err(_) => {
                self.shared.fail(format!("connect timed out after {:?}", timeout));
                return Err(ChannelError::ConnectTimeout(timeout));
            }
        };

        let Link { sink, stream } = link;
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        if let Some(handshake) = handshake {
            let _ = writer_tx.send(LinkMessage::Text(handshake));
        }

        let writer_task = tokio::spawn(write_loop(
            Arc::downgrade(&self.shared),
            sink,
            writer_rx,
            self.shared.config.heartbeat_interval,
        ));
        let reader = tokio::spawn(read_loop(
            self.shared.clone(),
            stream,
            self.shared.encoder.clone(),
        ));
        *self.writer_task.lock() = Some(writer_task);
        *self.reader.lock() = Some(reader);

        {
            let mut pending = self.shared.pending.lock();
            let mut writer = self.shared.writer.lock();
            if self.state() != ChannelState::Connecting {
                drop(writer);
                drop(pending);
                // Closed between the check above and now
                self.finish_close();
                return Err(ChannelError::NotConnected);
            }
            if !pending.is_empty() {
                debug!("Flushing {} frames buffered while connecting", pending.len());
            }
            for frame in pending.drain(..) {
                match self.shared.encoder.encode(&frame) {
                    Ok(bytes) => {
                        let _ = writer_tx.send(LinkMessage::Binary(bytes));
                    }
                    Err(e) => warn!("Dropping buffered {:?} frame: {}", frame.kind(), e),
                }
            }
            *writer = Some(writer_tx);
            self.shared.transition(ChannelState::Open);
        }

        info!("Transport channel open to {}", endpoint);
        Ok(())
    }

    /// Send one frame. Input frames wait for flow-control credit.
    pub async fn send(&self, frame: Frame) -> Result<(), ChannelError> {
        match self.state() {
            ChannelState::Open => {}
            ChannelState::Idle | ChannelState::Connecting => return self.buffer(frame),
            _ => return Err(ChannelError::NotConnected),
        }

        match frame {
            Frame::Input(data) => {
                let max = self.shared.encoder.max_payload();
                if data.len() <= max {
                    self.acquire_credit(data.len()).await?;
                    return self.shared.write_frame(&Frame::Input(data));
                }
                for chunk in data.chunks(max) {
                    self.acquire_credit(chunk.len()).await?;
                    self.shared.write_frame(&Frame::Input(chunk.to_vec()))?;
                }
                Ok(())
            }
            other => self.shared.write_frame(&other),
        }
    }

    fn buffer(&self, frame: Frame) -> Result<(), ChannelError> {
        let SendPolicy::Buffer { capacity } = self.shared.config.send_policy else {
            return Err(ChannelError::NotConnected);
        };
        let mut pending = self.shared.pending.lock();
        match self.state() {
            ChannelState::Idle | ChannelState::Connecting => {}
            ChannelState::Open => {
                drop(pending);
                return self.shared.write_frame(&frame);
            }
            _ => return Err(ChannelError::NotConnected),
        }
        let frames = match frame {
            Frame::Input(data) if data.len() > self.shared.encoder.max_payload() => data
                .chunks(self.shared.encoder.max_payload())
                .map(|chunk| Frame::Input(chunk.to_vec()))
                .collect(),
            other => vec![other],
        };
        if pending.len() + frames.len() > capacity {
            warn!("Send buffer full ({} frames), rejecting frame", capacity);
            return Err(ChannelError::NotConnected);
        }
        pending.extend(frames);
        Ok(())
    }

    async fn acquire_credit(&self, cost: usize) -> Result<(), ChannelError> {
        let metered = self.shared.config.flow.metered;
        let mut credit_rx = self.shared.credit.subscribe();
        let mut state_rx = self.shared.state.subscribe();

        let wait = async {
            loop {
                if *state_rx.borrow_and_update() != ChannelState::Open {
                    return Err(ChannelError::NotConnected);
                }
                let mut acquired = false;
                self.shared.credit.send_if_modified(|credit| {
                    if *credit == 0 {
                        return false;
                    }
                    acquired = true;
                    if metered && cost > 0 {
                        *credit = credit.saturating_sub(cost as u64);
                        return true;
                    }
                    false
                });
                if acquired {
                    return Ok(());
                }

                debug!("Input send waiting for flow-control credit");
                let changed = tokio::select! {
                    changed = credit_rx.changed() => changed,
                    changed = state_rx.changed() => changed,
                };
                if changed.is_err() {
                    return Err(ChannelError::NotConnected);
                }
            }
        };

        match self.shared.config.flow.backpressure_timeout() {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| {
                    warn!("Input send stalled on flow control for {:?}", limit);
                    ChannelError::BackpressureTimeout(limit)
                })?,
            None => wait.await,
        }
    }

    /// Close the connection. Safe to call repeatedly and while `open` is in flight.
    pub async fn close(&self) {
        let previous = {
            let mut writer = self.shared.writer.lock();
            let previous = self.state();
            match previous {
                ChannelState::Idle => {
                    self.shared.transition(ChannelState::Closed);
                }
                ChannelState::Connecting | ChannelState::Open => {
                    self.shared.transition(ChannelState::Closing);
                    writer.take();
                }
                _ => {}
            }
            previous
        };

        match previous {
            ChannelState::Idle => {
                self.shared.finish_subscribers(ChannelEvent::Closed);
            }
            ChannelState::Open => {
                info!("Closing transport channel");
                if let Some(reader) = self.reader.lock().take() {
                    reader.abort();
                }
                let writer_task = self.writer_task.lock().take();
                if let Some(mut writer_task) = writer_task {
                    if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut writer_task)
                        .await
                        .is_err()
                    {
                        warn!("Writer did not flush within {:?}", CLOSE_FLUSH_TIMEOUT);
                        writer_task.abort();
                    }
                }
                self.finish_close();
            }
            // open() completes the close once the connect attempt returns
            ChannelState::Connecting => {
                self.shared.finish_subscribers(ChannelEvent::Closed);
            }
            ChannelState::Error => self.abort_tasks(),
            ChannelState::Closing | ChannelState::Closed => {}
        }
    }

    fn finish_close(&self) {
        self.abort_tasks();
        self.shared.pending.lock().clear();
        self.shared.state.send_if_modified(|state| {
            if *state == ChannelState::Closing {
                *state = ChannelState::Closed;
                true
            } else {
                false
            }
        });
        self.shared.finish_subscribers(ChannelEvent::Closed);
    }

    fn abort_tasks(&self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        if let Some(writer_task) = self.writer_task.lock().take() {
            writer_task.abort();
        }
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        // Dropping the sender lets the writer flush and send Close on its own
        let was_open = self.shared.writer.lock().take().is_some();
        let writer_task = self.writer_task.lock().take();
        if let Some(writer_task) = writer_task {
            if !was_open {
                writer_task.abort();
            }
        }
        if was_open {
            debug!("Transport channel dropped while open, closing");
        }
        self.shared.pending.lock().clear();
        self.shared.transition(ChannelState::Closed);
        self.shared.finish_subscribers(ChannelEvent::Closed);
    }
}

async fn write_loop(
    shared: Weak<Shared>,
    mut sink: LinkSink,
    mut rx: mpsc::UnboundedReceiver<LinkMessage>,
    heartbeat: Option<Duration>,
) {
    let mut ticker = heartbeat.map(|period| {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        let message = tokio::select! {
            message = rx.recv() => message,
            _ = async {
                match ticker.as_mut() {
                    Some(ticker) => { ticker.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => Some(LinkMessage::Ping),
        };

        let Some(message) = message else {
            // Every sender is gone: the channel is closing or failed
            let _ = sink.send(LinkMessage::Close).await;
            let _ = sink.close().await;
            return;
        };
        let is_ping = message == LinkMessage::Ping;
        if let Err(e) = sink.send(message).await {
            error!("Failed to write to transport: {}", e);
            if let Some(shared) = shared.upgrade() {
                shared.fail(format!("write failed: {}", e));
            }
            return;
        }
        if is_ping {
            debug!("Heartbeat sent");
        }
    }
}

async fn read_loop(shared: Arc<Shared>, mut stream: LinkStream, mut codec: FrameCodec) {
    while let Some(item) = stream.next().await {
        let bytes = match item {
            Ok(bytes) => bytes,
            Err(LinkError::Closed) => break,
            Err(e) => {
                shared.fail(format!("connection lost: {}", e));
                return;
            }
        };

        codec.push(&bytes);
        loop {
            match codec.next_frame() {
                Ok(Decoded::Frame(frame)) => {
                    if !shared.handle_inbound(frame) {
                        return;
                    }
                }
                Ok(Decoded::Incomplete) => break,
                Err(e) => {
                    codec.reset();
                    shared.fail(format!("protocol error: {}", e));
                    return;
                }
            }
        }
    }

    shared.fail("connection closed by remote".to_string());
}
