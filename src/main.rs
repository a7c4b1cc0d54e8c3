// ABOUTME: Command-line entry point bridging the local terminal to a remote container or ttyd shell

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use term_bridge::config::{AppConfig, FitConfig};
use term_bridge::models::Target;
use term_bridge::terminal::{
    CellMetrics, ExecBinding, GridSize, PixelSize, Renderer, SessionConfig, SessionEvent,
    TerminalSession, TransportBinding, TtydBinding, WebSocketConnector,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Ctrl-] detaches, as in telnet.
const DETACH_BYTE: u8 = 0x1d;

#[derive(Parser)]
#[command(name = "term-bridge", version, about = "Attach to a remote container or host shell")]
struct Cli {
    /// Path to a config file (defaults to the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Dashboard API URL
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Bearer token for the control plane
    #[arg(long, global = true)]
    token: Option<String>,

    /// Reconnect automatically when the connection drops
    #[arg(long, global = true)]
    reconnect: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Exec a shell in a container
    Exec {
        namespace: String,
        pod: String,
        container: String,
    },
    /// Attach to a ttyd terminal for a host
    Ttyd { host: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging();
    setup_panic_handler();

    let config = load_config(&cli)?;
    let (binding, target) = match cli.command {
        Command::Exec {
            namespace,
            pod,
            container,
        } => (
            Arc::new(ExecBinding::from_config(&config)?) as Arc<dyn TransportBinding>,
            Target::container(namespace, pod, container),
        ),
        Command::Ttyd { host } => (
            Arc::new(TtydBinding::from_config(&config)?) as Arc<dyn TransportBinding>,
            Target::host(host),
        ),
    };

    let (detach_tx, detach_rx) = mpsc::unbounded_channel();
    let renderer = Arc::new(StdoutRenderer::new(detach_tx));
    let session = TerminalSession::new(
        binding,
        Arc::new(WebSocketConnector),
        renderer,
        SessionConfig::from_app(&config),
    );
    let events = session.subscribe_events();

    enable_raw_mode()?;
    let result = run(&session, target, config.reconnect.enabled, events, detach_rx).await;
    session.teardown().await;
    disable_raw_mode()?;

    if let Err(e) = &result {
        error!("Session ended with error: {}", e);
    }
    result
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let mut config = AppConfig::load_from(path)?;
            config.apply_env_overrides();
            config
        }
        None => AppConfig::load()?,
    };
    if let Some(url) = &cli.api_url {
        config.control_plane.api_url = url.clone();
    }
    if let Some(token) = &cli.token {
        config.control_plane.token = Some(token.clone());
    }
    if cli.reconnect {
        config.reconnect.enabled = true;
    }
    // The local terminal reports whole cells, never pixels
    config.fit = FitConfig::default();
    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn run(
    session: &TerminalSession,
    target: Target,
    reconnect: bool,
    mut events: broadcast::Receiver<SessionEvent>,
    mut detach_rx: mpsc::UnboundedReceiver<()>,
) -> Result<()> {
    let session_id = session.activate(target).await?;
    info!("Attached to session {}", session_id);

    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // No-op unless the local window changed
                if session.status().is_some_and(|status| status.is_connected()) {
                    session.resize();
                }
            }
            _ = detach_rx.recv() => {
                info!("Detach requested");
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(SessionEvent::SessionLost { reason }) => {
                    warn!("Session lost: {}", reason);
                    if !reconnect {
                        return Err(anyhow!("session lost: {}", reason));
                    }
                }
                Ok(SessionEvent::ReconnectFailed { attempts }) => {
                    return Err(anyhow!("gave up after {} reconnect attempts", attempts));
                }
                Ok(SessionEvent::Disconnected) => return Ok(()),
                Ok(SessionEvent::Stalled) => warn!("Remote is not accepting input"),
                Ok(event) => {
                    let indicator = session.status().map_or("", |status| status.indicator());
                    debug!("{} Session event: {:?}", indicator, event);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Missed {} session events", missed);
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
        }
    }
}

/// Renders straight to the local terminal, which is its own viewport.
struct StdoutRenderer {
    input: Arc<Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>>,
}

impl StdoutRenderer {
    fn new(detach_tx: mpsc::UnboundedSender<()>) -> Self {
        let input: Arc<Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>> = Arc::new(Mutex::new(None));
        let forward = input.clone();

        // One reader for the lifetime of the process; reconnects only swap the sender
        std::thread::spawn(move || {
            let mut stdin = std::io::stdin();
            let mut buf = [0u8; 1024];
            loop {
                let n = match stdin.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let chunk = &buf[..n];
                if let Some(pos) = chunk.iter().position(|b| *b == DETACH_BYTE) {
                    if let Some(tx) = forward.lock().as_ref() {
                        let _ = tx.send(chunk[..pos].to_vec());
                    }
                    let _ = detach_tx.send(());
                    break;
                }
                if let Some(tx) = forward.lock().as_ref() {
                    let _ = tx.send(chunk.to_vec());
                }
            }
        });

        Self { input }
    }
}

impl Renderer for StdoutRenderer {
    fn write(&self, data: &[u8]) {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(data);
        let _ = stdout.flush();
    }

    fn resize(&self, size: GridSize) {
        // The local terminal already has this size
        debug!("Remote grid now {}", size);
    }

    fn container_size(&self) -> PixelSize {
        // Measured in cells; see measure_cell
        let (columns, rows) = crossterm::terminal::size().unwrap_or((80, 24));
        PixelSize::new(f64::from(columns), f64::from(rows))
    }

    fn measure_cell(&self) -> CellMetrics {
        CellMetrics::new(1.0, 1.0)
    }

    fn subscribe_input(&self) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.input.lock() = Some(tx);
        rx
    }
}

fn setup_logging() {
    use std::fs::OpenOptions;
    use tracing_subscriber::prelude::*;

    let log_dir = dirs::home_dir()
        .map(|home| home.join(".term-bridge").join("logs"))
        .unwrap_or_else(|| PathBuf::from(".term-bridge/logs"));

    let _ = std::fs::create_dir_all(&log_dir);

    let log_file = log_dir.join(format!(
        "term-bridge-{}.log",
        chrono::Local::now().format("%Y%m%d-%H%M%S")
    ));

    // Logging must never take over the raw terminal
    let Ok(file) = OpenOptions::new().create(true).append(true).open(&log_file) else {
        return;
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "term_bridge=info".into()),
        )
        .init();
}

fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        // Restore the terminal before reporting
        let _ = disable_raw_mode();

        error!("Application panicked: {}", panic_info);
        eprintln!("Application panicked: {}", panic_info);
        eprintln!("Please check the logs for more details.");
    }));
}
