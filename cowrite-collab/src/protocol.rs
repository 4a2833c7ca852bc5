//! JSON wire protocol.
//!
//! Every text frame carries either one message object or an array of them:
//! ```text
//! { "command": "ADD", "clientName": "ana", "startIndex": 7, "content": "world!" }
//! [ { "command": "ADD", ... }, { "command": "CURSOR_MOVE", ... } ]
//! ```
//!
//! Missing integer fields read as 0, matching peers that omit zero values.
//! Inbound frames are decoded element by element, so one malformed entry in a
//! batch does not discard its neighbours.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Command tags as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    #[serde(rename = "ADD")]
    Add,
    #[serde(rename = "REMOVE")]
    Remove,
    #[serde(rename = "NEWCLIENT")]
    NewClient,
    #[serde(rename = "REMOVECLIENT")]
    RemoveClient,
    #[serde(rename = "CURSOR_MOVE")]
    CursorMove,
    #[serde(rename = "REQUEST_DOCUMENT")]
    RequestDocument,
    #[serde(rename = "DOCUMENT")]
    Document,
    #[serde(rename = "CLIENTS_LIST")]
    ClientsList,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "PING")]
    Ping,
    #[serde(rename = "PONG")]
    Pong,
}

impl CommandKind {
    const ALL: [CommandKind; 11] = [
        CommandKind::Add,
        CommandKind::Remove,
        CommandKind::NewClient,
        CommandKind::RemoveClient,
        CommandKind::CursorMove,
        CommandKind::RequestDocument,
        CommandKind::Document,
        CommandKind::ClientsList,
        CommandKind::Error,
        CommandKind::Ping,
        CommandKind::Pong,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Add => "ADD",
            CommandKind::Remove => "REMOVE",
            CommandKind::NewClient => "NEWCLIENT",
            CommandKind::RemoveClient => "REMOVECLIENT",
            CommandKind::CursorMove => "CURSOR_MOVE",
            CommandKind::RequestDocument => "REQUEST_DOCUMENT",
            CommandKind::Document => "DOCUMENT",
            CommandKind::ClientsList => "CLIENTS_LIST",
            CommandKind::Error => "ERROR",
            CommandKind::Ping => "PING",
            CommandKind::Pong => "PONG",
        }
    }

    /// Look up a wire tag. Tags are case-sensitive.
    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == tag)
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol message, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub command: CommandKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_index: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_index: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_location: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_list: Option<Vec<String>>,
    /// Human-readable reason on `ERROR` events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Message {
    /// Bare message of the given kind.
    pub fn new(command: CommandKind) -> Self {
        Self {
            command,
            client_name: None,
            start_index: None,
            end_index: None,
            content: None,
            cursor_location: None,
            client_list: None,
            message: None,
        }
    }

    pub fn add(client: Option<String>, start: i64, text: impl Into<String>) -> Self {
        Self {
            client_name: client,
            start_index: Some(start),
            content: Some(text.into()),
            ..Self::new(CommandKind::Add)
        }
    }

    pub fn remove(client: Option<String>, start: i64, end: i64) -> Self {
        Self {
            client_name: client,
            start_index: Some(start),
            end_index: Some(end),
            ..Self::new(CommandKind::Remove)
        }
    }

    pub fn new_client(name: impl Into<String>) -> Self {
        Self {
            client_name: Some(name.into()),
            ..Self::new(CommandKind::NewClient)
        }
    }

    pub fn remove_client(name: impl Into<String>) -> Self {
        Self {
            client_name: Some(name.into()),
            ..Self::new(CommandKind::RemoveClient)
        }
    }

    pub fn cursor_move(name: impl Into<String>, position: i64) -> Self {
        Self {
            client_name: Some(name.into()),
            cursor_location: Some(position),
            ..Self::new(CommandKind::CursorMove)
        }
    }

    pub fn request_document(name: impl Into<String>) -> Self {
        Self {
            client_name: Some(name.into()),
            ..Self::new(CommandKind::RequestDocument)
        }
    }

    pub fn document(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::new(CommandKind::Document)
        }
    }

    pub fn clients_list(names: Vec<String>) -> Self {
        Self {
            client_list: Some(names),
            ..Self::new(CommandKind::ClientsList)
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            message: Some(reason.into()),
            ..Self::new(CommandKind::Error)
        }
    }

    pub fn pong() -> Self {
        Self::new(CommandKind::Pong)
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Serialize several messages as one batched frame.
    pub fn encode_batch(messages: &[Message]) -> Result<String, ProtocolError> {
        serde_json::to_string(messages).map_err(ProtocolError::Encode)
    }

    /// Decode a frame holding one message or an array of them.
    ///
    /// Strict: any unknown tag or malformed entry fails the whole frame. The
    /// server uses [`decode_frame`] instead; this is for clients reading
    /// server output.
    pub fn decode_all(text: &str) -> Result<Vec<Message>, ProtocolError> {
        match serde_json::from_str(text).map_err(ProtocolError::Decode)? {
            OneOrMany::One(msg) => Ok(vec![msg]),
            OneOrMany::Many(msgs) => Ok(msgs),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

/// Top level of an inbound frame: an object or an array, nothing else.
#[derive(Deserialize)]
#[serde(untagged)]
enum InboundFrame {
    One(serde_json::Map<String, Value>),
    Many(Vec<Value>),
}

/// Inbound message before its tag is checked.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    command: String,
    #[serde(default)]
    client_name: Option<String>,
    #[serde(default)]
    start_index: Option<i64>,
    #[serde(default)]
    end_index: Option<i64>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    cursor_location: Option<i64>,
}

/// A validated client-to-server message.
///
/// `client` is the name the frame claims; the session decides whether to
/// trust it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Add { client: Option<String>, start: i64, text: String },
    Remove { client: Option<String>, start: i64, end: i64 },
    Join { client: String },
    Leave { client: Option<String> },
    CursorMove { client: Option<String>, position: i64 },
    RequestDocument { client: Option<String> },
    /// Liveness reply; never reaches the command queue.
    Pong,
}

impl Inbound {
    fn from_raw(raw: RawMessage) -> Result<Self, ProtocolError> {
        let kind = CommandKind::parse(&raw.command)
            .ok_or_else(|| ProtocolError::UnknownCommand(raw.command.clone()))?;
        let client = raw.client_name.filter(|name| !name.is_empty());

        Ok(match kind {
            CommandKind::Add => Inbound::Add {
                client,
                start: raw.start_index.unwrap_or(0),
                text: raw.content.unwrap_or_default(),
            },
            CommandKind::Remove => Inbound::Remove {
                client,
                start: raw.start_index.unwrap_or(0),
                end: raw.end_index.unwrap_or(0),
            },
            CommandKind::NewClient => Inbound::Join {
                client: client.ok_or(ProtocolError::MissingField {
                    command: kind,
                    field: "clientName",
                })?,
            },
            CommandKind::RemoveClient => Inbound::Leave { client },
            CommandKind::CursorMove => Inbound::CursorMove {
                client,
                position: raw.cursor_location.unwrap_or(0),
            },
            CommandKind::RequestDocument => Inbound::RequestDocument { client },
            CommandKind::Pong => Inbound::Pong,
            CommandKind::Document
            | CommandKind::ClientsList
            | CommandKind::Error
            | CommandKind::Ping => return Err(ProtocolError::WrongDirection(kind)),
        })
    }
}

/// Decode one inbound text frame.
///
/// The outer error covers frames that are not JSON objects or arrays at all;
/// the per-element results cover each message of a batch.
pub fn decode_frame(text: &str) -> Result<Vec<Result<Inbound, ProtocolError>>, ProtocolError> {
    let values = match serde_json::from_str(text).map_err(ProtocolError::Decode)? {
        InboundFrame::One(object) => vec![Value::Object(object)],
        InboundFrame::Many(values) => values,
    };

    Ok(values.into_iter().map(decode_value).collect())
}

fn decode_value(value: Value) -> Result<Inbound, ProtocolError> {
    let raw: RawMessage = serde_json::from_value(value).map_err(ProtocolError::Decode)?;
    Inbound::from_raw(raw)
}

/// Protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("binary frame is not valid UTF-8")]
    NotUtf8,

    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    #[error("{0} is a server-to-client command")]
    WrongDirection(CommandKind),

    #[error("{command} requires {field}")]
    MissingField {
        command: CommandKind,
        field: &'static str,
    },

    #[error("{0} requires a joined client")]
    NotJoined(CommandKind),
}

impl ProtocolError {
    /// Well-formed message whose tag this server does not accept.
    pub fn is_unrecognized(&self) -> bool {
        matches!(
            self,
            ProtocolError::UnknownCommand(_) | ProtocolError::WrongDirection(_)
        )
    }
}
