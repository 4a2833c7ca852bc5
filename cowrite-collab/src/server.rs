//! WebSocket server for one shared document.
//!
//! Architecture:
//! ```text
//! Client A ──┐                                   ┌──► Client A
//!            ├── Session ──► Command queue ──►  Processor ──┤
//! Client B ──┘   (per peer)   (bounded FIFO)     │          └──► Client B
//!                                                ├── Document ── <name>.txt
//!                                                └── ClientRegistry
//! ```
//!
//! The accept loop only upgrades connections and spawns sessions. All state
//! changes happen on the processor task, which the server spawns on
//! [`EditorServer::run`] and awaits on shutdown.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cowrite_core::{Document, DocumentBacking, DocumentError, FileStore, MemoryStore};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;

use crate::command::Command;
use crate::connection::{run_session, CommandPolicy, ConnectionCounters, SessionSettings};
use crate::processor::{CommandProcessor, JoinPolicy, PresenceSnapshot, ProcessorConfig, ProcessorMonitor};
use crate::session::SessionHandle;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Path accepted for the WebSocket upgrade
    pub ws_path: String,
    /// Directory holding the document file (None = in-memory only)
    pub document_dir: Option<PathBuf>,
    /// Document name; `.txt` is appended when missing
    pub document_name: String,
    /// Commands buffered between sessions and the processor
    pub command_queue_capacity: usize,
    /// Frames buffered per client before it is shed
    pub outbound_capacity: usize,
    /// Silence allowed before a connection is dropped
    pub pong_timeout: Duration,
    /// Interval between liveness pings
    pub ping_interval: Duration,
    /// Longest a single frame write or the upgrade handshake may take
    pub write_timeout: Duration,
    /// Largest inbound frame or message, in bytes
    pub max_frame_size: usize,
    pub join_policy: JoinPolicy,
    pub command_policy: CommandPolicy,
    pub announce_departures: bool,
    pub report_errors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let pong_timeout = Duration::from_secs(60);
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            ws_path: "/ws".to_string(),
            document_dir: Some(PathBuf::from(".")),
            document_name: "test".to_string(),
            command_queue_capacity: 100,
            outbound_capacity: 512,
            pong_timeout,
            ping_interval: pong_timeout * 9 / 10,
            write_timeout: Duration::from_secs(60),
            max_frame_size: 64 * 1024,
            join_policy: JoinPolicy::Replace,
            command_policy: CommandPolicy::Strict,
            announce_departures: true,
            report_errors: false,
        }
    }
}

impl ServerConfig {
    fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            join_policy: self.join_policy,
            announce_departures: self.announce_departures,
            report_errors: self.report_errors,
        }
    }

    fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            ping_interval: self.ping_interval,
            pong_timeout: self.pong_timeout,
            write_timeout: self.write_timeout,
            command_policy: self.command_policy,
            report_errors: self.report_errors,
        }
    }

    fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig::default()
            .max_message_size(Some(self.max_frame_size))
            .max_frame_size(Some(self.max_frame_size))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to open document: {0}")]
    Document(#[from] DocumentError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("server is already running")]
    AlreadyRunning,
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_received: u64,
    pub decode_errors: u64,
    pub commands_applied: u64,
    pub commands_rejected: u64,
    pub commands_ignored: u64,
    pub broadcasts: u64,
    pub deliveries: u64,
    pub sessions_shed: u64,
}

#[derive(Debug, Default)]
struct ConnectionGauge {
    total: AtomicU64,
    active: AtomicU64,
}

/// Pieces consumed when the server starts.
struct Startup {
    processor: CommandProcessor,
    commands_rx: mpsc::Receiver<Command>,
    commands_tx: mpsc::Sender<Command>,
}

/// Collaborative editing server.
pub struct EditorServer {
    config: ServerConfig,
    startup: Mutex<Option<Startup>>,
    monitor: ProcessorMonitor,
    counters: Arc<ConnectionCounters>,
    gauge: Arc<ConnectionGauge>,
    shutdown: CancellationToken,
    local_addr: watch::Sender<Option<SocketAddr>>,
}

impl EditorServer {
    /// Open the document and prepare the processor. Nothing is bound yet.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        if config.command_queue_capacity == 0 || config.outbound_capacity == 0 {
            return Err(ServerError::Config("queue capacities must be non-zero".into()));
        }
        if !config.ws_path.starts_with('/') {
            return Err(ServerError::Config(format!("ws_path {:?} must start with '/'", config.ws_path)));
        }

        let backing: Box<dyn DocumentBacking> = match &config.document_dir {
            Some(dir) => Box::new(FileStore::new(dir, &config.document_name)),
            None => Box::new(MemoryStore::new()),
        };
        let document = Document::load(config.document_name.clone(), backing)?;

        let processor = CommandProcessor::new(document, config.processor_config());
        let monitor = processor.monitor();
        let (commands_tx, commands_rx) = mpsc::channel(config.command_queue_capacity);

        Ok(Self {
            config,
            startup: Mutex::new(Some(Startup {
                processor,
                commands_rx,
                commands_tx,
            })),
            monitor,
            counters: Arc::new(ConnectionCounters::default()),
            gauge: Arc::new(ConnectionGauge::default()),
            shutdown: CancellationToken::new(),
            local_addr: watch::channel(None).0,
        })
    }

    /// Default configuration.
    pub fn with_defaults() -> Result<Self, ServerError> {
        Self::new(ServerConfig::default())
    }

    /// Accept connections until [`EditorServer::shutdown`] is called.
    ///
    /// Returns once every session has ended and the processor has stopped.
    pub async fn run(&self) -> Result<(), ServerError> {
        let startup = self
            .startup
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or(ServerError::AlreadyRunning)?;
        let Startup {
            processor,
            commands_rx,
            commands_tx,
        } = startup;

        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.config.bind_addr.clone(),
                source,
            })?;
        let local = listener.local_addr().ok();
        self.local_addr.send_replace(local);
        log::info!(
            "Editor server listening on ws://{}{}",
            local.map_or_else(|| self.config.bind_addr.clone(), |a| a.to_string()),
            self.config.ws_path
        );

        let processor_task = tokio::spawn(processor.run(commands_rx));
        let mut sessions = tokio::task::JoinSet::new();

        loop {
            let (stream, addr) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::error!("Accept failed: {e}");
                        continue;
                    }
                },
            };
            log::debug!("New TCP connection from {addr}");

            let connection = Connection {
                commands: commands_tx.clone(),
                config: self.config.clone(),
                counters: self.counters.clone(),
                gauge: self.gauge.clone(),
                shutdown: self.shutdown.child_token(),
            };
            sessions.spawn(async move {
                if let Err(e) = connection.serve(stream, addr).await {
                    log::warn!("Connection from {addr} ended: {e}");
                }
            });

            // Reap finished sessions so the set does not grow without bound.
            while sessions.try_join_next().is_some() {}
        }

        drop(listener);
        drop(commands_tx);
        log::info!("Shutting down; waiting for {} sessions", sessions.len());
        while sessions.join_next().await.is_some() {}

        match processor_task.await {
            Ok(processor) => log::info!("Document {} closed", processor.document().name()),
            Err(e) => log::error!("Command processor task failed: {e}"),
        }
        Ok(())
    }

    /// Stop accepting, close every session and stop the processor.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Address actually bound, once [`EditorServer::run`] has bound it.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let mut rx = self.local_addr.subscribe();
        if self.shutdown.is_cancelled() {
            return *rx.borrow();
        }
        tokio::select! {
            bound = rx.wait_for(Option::is_some) => bound.ok().and_then(|addr| *addr),
            _ = self.shutdown.cancelled() => None,
        }
    }

    pub fn stats(&self) -> ServerStats {
        let processor = self.monitor.stats();
        let broadcast = self.monitor.broadcast_stats();
        ServerStats {
            total_connections: self.gauge.total.load(Ordering::Relaxed),
            active_connections: self.gauge.active.load(Ordering::Relaxed),
            frames_received: self.counters.frames_received.load(Ordering::Relaxed),
            decode_errors: self.counters.decode_errors.load(Ordering::Relaxed),
            commands_applied: processor.commands_applied,
            commands_rejected: processor.commands_rejected,
            commands_ignored: processor.commands_ignored,
            broadcasts: broadcast.messages_sent,
            deliveries: broadcast.deliveries,
            sessions_shed: broadcast.sessions_shed,
        }
    }

    /// Latest document length and client presence.
    pub fn presence(&self) -> PresenceSnapshot {
        self.monitor.presence()
    }

    pub fn subscribe_presence(&self) -> watch::Receiver<PresenceSnapshot> {
        self.monitor.subscribe()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

/// Everything one accepted connection needs.
struct Connection {
    commands: mpsc::Sender<Command>,
    config: ServerConfig,
    counters: Arc<ConnectionCounters>,
    gauge: Arc<ConnectionGauge>,
    shutdown: CancellationToken,
}

impl Connection {
    async fn serve(self, stream: TcpStream, addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_path = self.config.ws_path.clone();
        let check_path = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            if request.uri().path() == ws_path {
                Ok(response)
            } else {
                let mut rejection = ErrorResponse::new(Some(format!("no WebSocket endpoint at {}", request.uri().path())));
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                Err(rejection)
            }
        };

        let handshake = tokio_tungstenite::accept_hdr_async_with_config(
            stream,
            check_path,
            Some(self.config.websocket_config()),
        );
        let ws = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(()),
            ws = timeout(self.config.write_timeout, handshake) => ws??,
        };
        log::info!("WebSocket connection established from {addr}");

        self.gauge.total.fetch_add(1, Ordering::Relaxed);
        self.gauge.active.fetch_add(1, Ordering::Relaxed);

        let (handle, queue) = SessionHandle::channel_with_shutdown(self.config.outbound_capacity, self.shutdown);
        let result = run_session(
            ws,
            addr,
            handle,
            queue,
            self.commands,
            self.config.session_settings(),
            self.counters,
        )
        .await;

        self.gauge.active.fetch_sub(1, Ordering::Relaxed);
        log::info!("Connection closed from {addr}");
        result.map_err(Into::into)
    }
}
