//! # cowrite-collab - real-time shared editing over WebSocket
//!
//! Many editors, one plain-text document. Edits are positional byte-range
//! operations applied in strict arrival order at a single serialization
//! point; there is no operational transform or CRDT merge.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    JSON frames     ┌──────────────┐
//! │ EditorClient │ ◄────────────────► │ EditorServer │
//! │ (per user)   │     over /ws       │ (central)    │
//! └──────────────┘                    └──────┬───────┘
//!                                            │ Command (mpsc, FIFO)
//!                                            ▼
//!                                   ┌──────────────────┐
//!                                   │ CommandProcessor │── Document (cowrite-core)
//!                                   │ (single task)    │── ClientRegistry
//!                                   └────────┬─────────┘
//!                                            │
//!                                   ┌────────┴────────┐
//!                                   │ BroadcastRouter │ shed on overflow
//!                                   └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire format (single or batched messages)
//! - [`session`]: bounded per-client outbound queue
//! - [`command`]: processor commands and per-connection translation
//! - [`registry`]: identity → session, with cursor presence
//! - [`broadcast`]: non-blocking fan-out with slow-consumer shedding
//! - [`processor`]: the serialization point
//! - [`connection`]: inbound/outbound loops and liveness
//! - [`server`]: listener, upgrade and lifecycle
//! - [`client`]: reference editor client

pub mod broadcast;
pub mod client;
pub mod command;
pub mod connection;
pub mod processor;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

// Re-exports for convenience
pub use broadcast::{BroadcastRouter, BroadcastStats, Delivery};
pub use client::{ClientError, ConnectionState, EditorClient, EditorEvent};
pub use command::{Command, CommandTranslator};
pub use connection::{CommandPolicy, ConnectionError, SessionSettings};
pub use processor::{
    CommandProcessor, JoinPolicy, Outcome, PresenceSnapshot, ProcessorConfig, ProcessorMonitor, Rejection,
};
pub use protocol::{decode_frame, CommandKind, Inbound, Message, ProtocolError};
pub use registry::{ClientEntry, ClientRegistry, ClientSummary, RegistryError};
pub use server::{EditorServer, ServerConfig, ServerError, ServerStats};
pub use session::{DeliveryError, Frame, OutboundQueue, SessionHandle, SessionId};
