//! One WebSocket peer: inbound decode loop plus outbound writer.
//!
//! ```text
//!            ┌──────────── inbound (this task) ────────────┐
//!  socket ──►│ timeout(pong_timeout, next) → decode → queue │──► commands
//!            └──────────────────────────────────────────────┘
//!            ┌──────────── outbound (spawned) ─────────────┐
//!  socket ◄──│ OutboundQueue frames │ Ping every interval  │◄── processor
//!            └──────────────────────────────────────────────┘
//! ```
//!
//! Either loop ending closes the session handle, which stops the other. When
//! the inbound side ends for any reason a LEAVE is queued for the identity
//! the peer joined as.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::command::{Command, CommandTranslator};
use crate::protocol::{decode_frame, Message, ProtocolError};
use crate::session::{OutboundQueue, SessionHandle};

/// How unknown and wrong-direction commands are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CommandPolicy {
    /// Logged as decode errors (and reported if enabled).
    #[default]
    Strict,
    /// Skipped quietly.
    Lenient,
}

/// Per-connection settings, derived from the server configuration.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub write_timeout: Duration,
    pub command_policy: CommandPolicy,
    pub report_errors: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(54),
            pong_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(60),
            command_policy: CommandPolicy::Strict,
            report_errors: false,
        }
    }
}

/// Counters shared by every connection of a server.
#[derive(Debug, Default)]
pub struct ConnectionCounters {
    pub frames_received: AtomicU64,
    pub decode_errors: AtomicU64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("no traffic for {0:?}")]
    LivenessTimeout(Duration),

    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("command processor has stopped")]
    ProcessorStopped,
}

/// Drive one upgraded connection until it ends.
pub async fn run_session<S>(
    ws: WebSocketStream<S>,
    addr: SocketAddr,
    handle: SessionHandle,
    queue: OutboundQueue,
    commands: mpsc::Sender<Command>,
    settings: SessionSettings,
    counters: Arc<ConnectionCounters>,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, mut stream) = ws.split();
    let writer = tokio::spawn(outbound_loop(sink, queue, handle.clone(), settings.clone(), addr));

    let mut inbound = InboundState {
        translator: CommandTranslator::new(handle.clone()),
        handle: handle.clone(),
        commands: commands.clone(),
        settings: settings.clone(),
        counters,
        addr,
    };

    let result = loop {
        let next = tokio::select! {
            _ = handle.closed() => break Ok(()),
            next = timeout(settings.pong_timeout, stream.next()) => next,
        };

        let msg = match next {
            Err(_) => break Err(ConnectionError::LivenessTimeout(settings.pong_timeout)),
            Ok(None) => break Ok(()),
            Ok(Some(Err(e))) => break Err(e.into()),
            Ok(Some(Ok(msg))) => msg,
        };

        let dispatched = match msg {
            WsMessage::Text(text) => inbound.dispatch(text.as_str()).await,
            WsMessage::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => inbound.dispatch(text).await,
                Err(_) => {
                    inbound.decode_error(ProtocolError::NotUtf8);
                    Ok(())
                }
            },
            WsMessage::Close(_) => {
                log::debug!("Close frame from {addr}");
                break Ok(());
            }
            // Ping replies are queued by the transport; Pong only counts as traffic.
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => Ok(()),
        };
        if let Err(e) = dispatched {
            break Err(e);
        }
    };

    handle.close();
    if let Some(leave) = inbound.translator.departure() {
        // Fails only when the processor is already gone.
        let _ = commands.send(leave).await;
    }
    if let Err(e) = writer.await {
        log::error!("Outbound task for {addr} panicked: {e}");
    }
    result
}

struct InboundState {
    translator: CommandTranslator,
    handle: SessionHandle,
    commands: mpsc::Sender<Command>,
    settings: SessionSettings,
    counters: Arc<ConnectionCounters>,
    addr: SocketAddr,
}

impl InboundState {
    /// Decode one text frame and queue its commands in order.
    async fn dispatch(&mut self, text: &str) -> Result<(), ConnectionError> {
        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);

        let items = match decode_frame(text) {
            Ok(items) => items,
            Err(e) => {
                self.decode_error(e);
                return Ok(());
            }
        };

        for item in items {
            match item.and_then(|inbound| self.translator.translate(inbound)) {
                Ok(Some(command)) => {
                    log::trace!("{} queued {}", self.addr, command.kind());
                    self.commands
                        .send(command)
                        .await
                        .map_err(|_| ConnectionError::ProcessorStopped)?;
                }
                Ok(None) => {}
                Err(e) => self.decode_error(e),
            }
        }
        Ok(())
    }

    fn decode_error(&self, e: ProtocolError) {
        self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
        if e.is_unrecognized() && self.settings.command_policy == CommandPolicy::Lenient {
            log::debug!("Skipping message from {}: {e}", self.addr);
            return;
        }

        log::warn!("Failed to decode message from {}: {e}", self.addr);
        if self.settings.report_errors {
            if let Ok(frame) = Message::error(e.to_string()).encode() {
                if let Err(e) = self.handle.try_deliver(Arc::from(frame)) {
                    log::trace!("Error notice to {} not delivered: {e}", self.addr);
                }
            }
        }
    }
}

async fn outbound_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, WsMessage>,
    mut queue: OutboundQueue,
    handle: SessionHandle,
    settings: SessionSettings,
    addr: SocketAddr,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ping = tokio::time::interval_at(Instant::now() + settings.ping_interval, settings.ping_interval);

    loop {
        let outgoing = tokio::select! {
            frame = queue.next() => match frame {
                Some(frame) => WsMessage::text(frame.to_string()),
                None => break,
            },
            _ = ping.tick() => WsMessage::Ping(Default::default()),
        };

        match timeout(settings.write_timeout, sink.send(outgoing)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::debug!("Write to {addr} failed: {e}");
                break;
            }
            Err(_) => {
                log::warn!("Write to {addr} timed out after {:?}", settings.write_timeout);
                break;
            }
        }
    }

    handle.close();
    let _ = timeout(settings.write_timeout, sink.close()).await;
}
