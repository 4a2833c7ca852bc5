//! Commands queued for the processor.
//!
//! A [`Command`] is what a session hands to the single serialization point.
//! It differs from an [`Inbound`] message in two ways: JOIN carries the
//! session's delivery handle, and identities are resolved against what the
//! session has actually joined as.

use crate::protocol::{CommandKind, Inbound, ProtocolError};
use crate::session::{SessionHandle, SessionId};

/// One unit of work for the processor. Immutable once queued.
#[derive(Debug, Clone)]
pub enum Command {
    Add {
        origin: Option<String>,
        start: i64,
        text: String,
    },
    Remove {
        origin: Option<String>,
        start: i64,
        end: i64,
    },
    Join {
        identity: String,
        session: SessionHandle,
    },
    /// `session: None` removes the identity whoever holds it.
    Leave {
        identity: String,
        session: Option<SessionId>,
    },
    CursorMove {
        identity: String,
        position: i64,
    },
    RequestDocument {
        identity: String,
    },
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Add { .. } => CommandKind::Add,
            Command::Remove { .. } => CommandKind::Remove,
            Command::Join { .. } => CommandKind::NewClient,
            Command::Leave { .. } => CommandKind::RemoveClient,
            Command::CursorMove { .. } => CommandKind::CursorMove,
            Command::RequestDocument { .. } => CommandKind::RequestDocument,
        }
    }
}

/// Per-connection translation from decoded frames to commands.
///
/// Tracks the identity the connection joined as. Later frames are attributed
/// to it and never to the name they claim; a connection that has not joined
/// edits anonymously and cannot move or request on anyone's behalf.
#[derive(Debug)]
pub struct CommandTranslator {
    session: SessionHandle,
    joined: Option<String>,
}

impl CommandTranslator {
    pub fn new(session: SessionHandle) -> Self {
        Self {
            session,
            joined: None,
        }
    }

    pub fn joined(&self) -> Option<&str> {
        self.joined.as_deref()
    }

    /// Turn one inbound message into a command.
    ///
    /// `Ok(None)` means the message is consumed by the session itself (PONG).
    pub fn translate(&mut self, inbound: Inbound) -> Result<Option<Command>, ProtocolError> {
        let command = match inbound {
            Inbound::Add { start, text, .. } => Command::Add {
                origin: self.joined.clone(),
                start,
                text,
            },
            Inbound::Remove { start, end, .. } => Command::Remove {
                origin: self.joined.clone(),
                start,
                end,
            },
            Inbound::Join { client } => {
                self.joined = Some(client.clone());
                Command::Join {
                    identity: client,
                    session: self.session.clone(),
                }
            }
            Inbound::Leave { client } => {
                let identity = self
                    .joined
                    .take()
                    .or(client)
                    .ok_or(ProtocolError::MissingField {
                        command: CommandKind::RemoveClient,
                        field: "clientName",
                    })?;
                Command::Leave {
                    identity,
                    session: Some(self.session.id()),
                }
            }
            Inbound::CursorMove { position, .. } => Command::CursorMove {
                identity: self.require_joined(CommandKind::CursorMove)?,
                position,
            },
            Inbound::RequestDocument { .. } => Command::RequestDocument {
                identity: self.require_joined(CommandKind::RequestDocument)?,
            },
            Inbound::Pong => return Ok(None),
        };
        Ok(Some(command))
    }

    /// The LEAVE to queue when the connection ends, if it is still joined.
    pub fn departure(&mut self) -> Option<Command> {
        self.joined.take().map(|identity| Command::Leave {
            identity,
            session: Some(self.session.id()),
        })
    }

    fn require_joined(&self, command: CommandKind) -> Result<String, ProtocolError> {
        self.joined.clone().ok_or(ProtocolError::NotJoined(command))
    }
}
