//! WebSocket editor client for connecting to the server.
//!
//! Provides:
//! - Connection lifecycle (connect, join, disconnect)
//! - Typed events for everything the server sends
//! - Edit, cursor and document requests, individually or batched
//!
//! The client keeps no copy of the document; applying remote edits to a
//! local buffer is left to the application.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::protocol::{CommandKind, Message, ProtocolError};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the editor client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditorEvent {
    /// Full document content (on join or on request)
    Document(String),
    /// Other connected clients, sent right after joining
    ClientsList(Vec<String>),
    ClientJoined(String),
    ClientLeft(String),
    RemoteInsert {
        client: Option<String>,
        start: i64,
        text: String,
    },
    RemoteDelete {
        client: Option<String>,
        start: i64,
        end: i64,
    },
    RemoteCursor {
        client: String,
        position: i64,
    },
    /// The server dropped one of our commands
    Error(String),
    Disconnected,
}

impl EditorEvent {
    fn from_message(msg: Message) -> Option<Self> {
        Some(match msg.command {
            CommandKind::Document => EditorEvent::Document(msg.content.unwrap_or_default()),
            CommandKind::ClientsList => EditorEvent::ClientsList(msg.client_list.unwrap_or_default()),
            CommandKind::NewClient => EditorEvent::ClientJoined(msg.client_name?),
            CommandKind::RemoveClient => EditorEvent::ClientLeft(msg.client_name?),
            CommandKind::Add => EditorEvent::RemoteInsert {
                client: msg.client_name,
                start: msg.start_index.unwrap_or(0),
                text: msg.content.unwrap_or_default(),
            },
            CommandKind::Remove => EditorEvent::RemoteDelete {
                client: msg.client_name,
                start: msg.start_index.unwrap_or(0),
                end: msg.end_index.unwrap_or(0),
            },
            CommandKind::CursorMove => EditorEvent::RemoteCursor {
                client: msg.client_name?,
                position: msg.cursor_location.unwrap_or(0),
            },
            CommandKind::Error => EditorEvent::Error(msg.message.unwrap_or_default()),
            CommandKind::RequestDocument | CommandKind::Ping | CommandKind::Pong => return None,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("not connected")]
    NotConnected,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// The editor client.
pub struct EditorClient {
    /// Identity announced on join
    name: String,

    /// WebSocket URL, including the endpoint path
    server_url: String,

    state: Arc<RwLock<ConnectionState>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<EditorEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<EditorEvent>,
}

impl EditorClient {
    pub fn new(name: impl Into<String>, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            name: name.into(),
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<EditorEvent>> {
        self.event_rx.take()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Connect and join under this client's name.
    ///
    /// Spawns background tasks for reading and writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel to the socket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(WsMessage::text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });
        self.outgoing_tx = Some(out_tx);

        // Reader task: turn server frames into events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let text = match msg {
                    Ok(WsMessage::Text(text)) => text,
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match Message::decode_all(text.as_str()) {
                    Ok(messages) => {
                        for event in messages.into_iter().filter_map(EditorEvent::from_message) {
                            let _ = event_tx.send(event).await;
                        }
                    }
                    Err(e) => log::warn!("Ignoring undecodable server frame: {e}"),
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(EditorEvent::Disconnected).await;
        });

        self.send(&Message::new_client(self.name.as_str())).await?;
        *self.state.write().await = ConnectionState::Connected;
        Ok(())
    }

    pub async fn insert(&self, start: i64, text: impl Into<String>) -> Result<(), ClientError> {
        self.send(&Message::add(Some(self.name.clone()), start, text)).await
    }

    pub async fn delete(&self, start: i64, end: i64) -> Result<(), ClientError> {
        self.send(&Message::remove(Some(self.name.clone()), start, end)).await
    }

    pub async fn move_cursor(&self, position: i64) -> Result<(), ClientError> {
        self.send(&Message::cursor_move(self.name.as_str(), position)).await
    }

    pub async fn request_document(&self) -> Result<(), ClientError> {
        self.send(&Message::request_document(self.name.as_str())).await
    }

    /// Announce departure. The server closes the connection in response.
    pub async fn leave(&self) -> Result<(), ClientError> {
        self.send(&Message::remove_client(self.name.as_str())).await
    }

    /// Send several messages in one frame.
    pub async fn send_batch(&self, messages: &[Message]) -> Result<(), ClientError> {
        self.send_raw(Message::encode_batch(messages)?).await
    }

    pub async fn send(&self, msg: &Message) -> Result<(), ClientError> {
        self.send_raw(msg.encode()?).await
    }

    /// Send a text frame as-is.
    pub async fn send_raw(&self, text: impl Into<String>) -> Result<(), ClientError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(text.into()).await.map_err(|_| ClientError::NotConnected)
    }

    /// Close the connection without announcing departure.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let mut client = EditorClient::new("ana", "ws://127.0.0.1:8080/ws");
        assert_eq!(client.name(), "ana");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_initial_state() {
        let client = EditorClient::new("ana", "ws://127.0.0.1:8080/ws");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_while_disconnected() {
        let client = EditorClient::new("ana", "ws://127.0.0.1:8080/ws");
        assert!(matches!(client.insert(0, "x").await, Err(ClientError::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_failure_resets_state() {
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut client = EditorClient::new("ana", format!("ws://127.0.0.1:{port}/ws"));
        assert!(matches!(client.connect().await, Err(ClientError::Connect(_))));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[test]
    fn test_events_from_messages() {
        assert_eq!(
            EditorEvent::from_message(Message::document("abc")),
            Some(EditorEvent::Document("abc".into()))
        );
        assert_eq!(
            EditorEvent::from_message(Message::add(Some("bo".into()), 2, "x")),
            Some(EditorEvent::RemoteInsert {
                client: Some("bo".into()),
                start: 2,
                text: "x".into()
            })
        );
        assert_eq!(
            EditorEvent::from_message(Message::remove_client("bo")),
            Some(EditorEvent::ClientLeft("bo".into()))
        );
        assert_eq!(
            EditorEvent::from_message(Message::error("range")),
            Some(EditorEvent::Error("range".into()))
        );
        assert_eq!(EditorEvent::from_message(Message::pong()), None);
        assert_eq!(EditorEvent::from_message(Message::new(CommandKind::NewClient)), None);
    }
}
