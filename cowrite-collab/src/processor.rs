//! The single serialization point.
//!
//! ```text
//!  session ─┐
//!  session ─┼─► mpsc<Command> ─► CommandProcessor ─┬─► Document (insert/delete + persist)
//!  session ─┘     (FIFO)             (one task)    ├─► ClientRegistry
//!                                                  └─► BroadcastRouter ─► session queues
//! ```
//!
//! Commands are applied one at a time in queue order. Everything a command
//! triggers (document write, registry change, broadcast, departure notices)
//! completes before the next command is dequeued. The document and registry
//! are owned by this task; other tasks observe them only through the
//! [`PresenceSnapshot`] watch channel and the atomic counters.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cowrite_core::{Document, DocumentError};
use tokio::sync::{mpsc, watch};

use crate::broadcast::{BroadcastRouter, BroadcastStats};
use crate::command::Command;
use crate::protocol::{CommandKind, Message};
use crate::registry::{ClientRegistry, ClientSummary, RegistryError};
use crate::session::SessionHandle;

/// What to do when a JOIN names an identity another session holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JoinPolicy {
    /// The newcomer takes over; the previous session is closed.
    #[default]
    Replace,
    /// The newcomer is refused and its session closed.
    Reject,
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub join_policy: JoinPolicy,
    /// Broadcast REMOVECLIENT when a client goes away.
    pub announce_departures: bool,
    /// Send ERROR to the originator of a dropped command.
    pub report_errors: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            join_policy: JoinPolicy::Replace,
            announce_departures: true,
            report_errors: false,
        }
    }
}

/// Why a command was dropped.
#[derive(Debug, thiserror::Error)]
pub enum Rejection {
    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("identity {0:?} is already connected")]
    IdentityTaken(String),
}

/// Result of applying one command.
#[derive(Debug)]
pub enum Outcome {
    Applied,
    Rejected(Rejection),
    /// Valid but with nothing to do (empty ADD, stale LEAVE, closed joiner).
    Ignored,
}

/// Immutable view of presence, republished after every command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceSnapshot {
    pub document_len: usize,
    pub clients: Vec<ClientSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    pub commands_applied: u64,
    pub commands_rejected: u64,
    pub commands_ignored: u64,
}

#[derive(Debug, Default)]
struct AtomicProcessorStats {
    applied: AtomicU64,
    rejected: AtomicU64,
    ignored: AtomicU64,
}

/// Read-only handle on a processor that may be running on another task.
#[derive(Debug, Clone)]
pub struct ProcessorMonitor {
    stats: Arc<AtomicProcessorStats>,
    router: BroadcastRouter,
    presence: watch::Receiver<PresenceSnapshot>,
}

impl ProcessorMonitor {
    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            commands_applied: self.stats.applied.load(Ordering::Relaxed),
            commands_rejected: self.stats.rejected.load(Ordering::Relaxed),
            commands_ignored: self.stats.ignored.load(Ordering::Relaxed),
        }
    }

    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.router.stats()
    }

    /// Latest published presence.
    pub fn presence(&self) -> PresenceSnapshot {
        self.presence.borrow().clone()
    }

    /// Receiver that is notified on every republish.
    pub fn subscribe(&self) -> watch::Receiver<PresenceSnapshot> {
        self.presence.clone()
    }
}

pub struct CommandProcessor {
    document: Document,
    registry: ClientRegistry,
    router: BroadcastRouter,
    config: ProcessorConfig,
    stats: Arc<AtomicProcessorStats>,
    presence: watch::Sender<PresenceSnapshot>,
}

impl CommandProcessor {
    pub fn new(document: Document, config: ProcessorConfig) -> Self {
        let (presence, _) = watch::channel(PresenceSnapshot {
            document_len: document.len(),
            clients: Vec::new(),
        });
        Self {
            document,
            registry: ClientRegistry::new(),
            router: BroadcastRouter::new(),
            config,
            stats: Arc::new(AtomicProcessorStats::default()),
            presence,
        }
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn monitor(&self) -> ProcessorMonitor {
        ProcessorMonitor {
            stats: self.stats.clone(),
            router: self.router.clone(),
            presence: self.presence.subscribe(),
        }
    }

    /// Drain `commands` until every sender is gone, then close all sessions.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) -> Self {
        log::info!("Command processor started for {}", self.document.name());
        while let Some(command) = commands.recv().await {
            self.apply(command);
        }

        let closed = self.registry.close_all();
        self.publish();
        log::info!(
            "Command processor stopped ({} bytes, {} sessions closed)",
            self.document.len(),
            closed.len()
        );
        self
    }

    /// Apply one command and everything it triggers.
    pub fn apply(&mut self, command: Command) -> Outcome {
        let kind = command.kind();
        log::debug!("Applying {kind}");

        let mut departed = Vec::new();
        let outcome = match command {
            Command::Add { origin, start, text } => self.apply_add(origin, start, text, &mut departed),
            Command::Remove { origin, start, end } => self.apply_remove(origin, start, end, &mut departed),
            Command::Join { identity, session } => self.apply_join(identity, session, &mut departed),
            Command::Leave { identity, session } => {
                let removed = match session {
                    Some(id) => self.registry.unregister_session(&identity, id),
                    None => self.registry.unregister(&identity),
                };
                match removed {
                    Some(entry) => {
                        entry.session.close();
                        log::info!("Client {identity} left ({} connected)", self.registry.len());
                        departed.push(identity);
                        Outcome::Applied
                    }
                    None => {
                        log::debug!("Ignoring leave for {identity}: not held by that session");
                        Outcome::Ignored
                    }
                }
            }
            Command::CursorMove { identity, position } => {
                match self.registry.update_cursor(&identity, position, &self.document) {
                    Ok(()) => {
                        let msg = Message::cursor_move(identity.as_str(), position);
                        self.fan_out(&msg, Some(identity.as_str()), &mut departed);
                        Outcome::Applied
                    }
                    Err(e) => self.reject(kind, None, e.into(), &mut departed),
                }
            }
            Command::RequestDocument { identity } => {
                if self.registry.contains(&identity) {
                    let msg = Message::document(self.document.snapshot_text());
                    self.reply(&msg, &identity, &mut departed);
                    Outcome::Applied
                } else {
                    self.reject(kind, None, RegistryError::UnknownClient(identity).into(), &mut departed)
                }
            }
        };

        self.announce(departed);
        self.record(&outcome);
        self.publish();
        outcome
    }

    fn apply_add(&mut self, origin: Option<String>, start: i64, text: String, departed: &mut Vec<String>) -> Outcome {
        if text.is_empty() {
            log::debug!("Ignoring empty ADD at {start}");
            return Outcome::Ignored;
        }
        match self.document.insert(start, text.as_bytes()) {
            Ok(()) => {
                let exclude = origin.clone();
                let msg = Message::add(origin, start, text);
                self.fan_out(&msg, exclude.as_deref(), departed);
                Outcome::Applied
            }
            Err(e) => self.reject(CommandKind::Add, origin.as_deref(), e.into(), departed),
        }
    }

    fn apply_remove(&mut self, origin: Option<String>, start: i64, end: i64, departed: &mut Vec<String>) -> Outcome {
        match self.document.delete(start, end) {
            Ok(()) => {
                let exclude = origin.clone();
                let msg = Message::remove(origin, start, end);
                self.fan_out(&msg, exclude.as_deref(), departed);
                Outcome::Applied
            }
            Err(e) => self.reject(CommandKind::Remove, origin.as_deref(), e.into(), departed),
        }
    }

    fn apply_join(&mut self, identity: String, session: SessionHandle, departed: &mut Vec<String>) -> Outcome {
        if session.is_closed() {
            log::debug!("Ignoring join for {identity}: session already closed");
            return Outcome::Ignored;
        }

        let taken = self
            .registry
            .get(&identity)
            .filter(|holder| holder.session.id() != session.id())
            .map(|holder| holder.session.clone());
        if let Some(holder) = taken {
            match self.config.join_policy {
                JoinPolicy::Replace => {
                    log::info!("Client {identity} reconnected; closing previous session");
                    holder.close();
                }
                JoinPolicy::Reject => {
                    let rejection = Rejection::IdentityTaken(identity);
                    log::warn!("Refusing join: {rejection}");
                    if self.config.report_errors {
                        if let Ok(frame) = Message::error(rejection.to_string()).encode() {
                            if let Err(e) = session.try_deliver(Arc::from(frame)) {
                                log::trace!("Join refusal not delivered: {e}");
                            }
                        }
                    }
                    // The closed session gives up every name it already held.
                    for previous in self.registry.identities_of(session.id()) {
                        self.registry.unregister(&previous);
                        log::info!("Client {previous} left after refused rename");
                        departed.push(previous);
                    }
                    session.close();
                    return Outcome::Rejected(rejection);
                }
            }
        }

        // A session that re-joins under a new name gives up its old one.
        for previous in self.registry.identities_of(session.id()) {
            if previous != identity {
                self.registry.unregister(&previous);
                log::info!("Client {previous} renamed to {identity}");
                departed.push(previous);
            }
        }

        self.registry.register(identity.clone(), session);
        log::info!("Client {identity} joined ({} connected)", self.registry.len());

        let document = Message::document(self.document.snapshot_text());
        self.reply(&document, &identity, departed);
        let others = Message::clients_list(self.registry.list_identities(Some(identity.as_str())));
        self.reply(&others, &identity, departed);

        self.fan_out(&Message::new_client(identity.as_str()), Some(identity.as_str()), departed);
        Outcome::Applied
    }

    fn reject(
        &mut self,
        kind: CommandKind,
        origin: Option<&str>,
        rejection: Rejection,
        departed: &mut Vec<String>,
    ) -> Outcome {
        log::warn!("Dropping {kind}: {rejection}");
        if self.config.report_errors {
            if let Some(origin) = origin {
                self.reply(&Message::error(rejection.to_string()), origin, departed);
            }
        }
        Outcome::Rejected(rejection)
    }

    fn fan_out(&mut self, msg: &Message, exclude: Option<&str>, departed: &mut Vec<String>) {
        match self.router.broadcast(msg, &mut self.registry, exclude) {
            Ok(delivery) => departed.extend(delivery.shed.into_iter().map(|entry| entry.identity)),
            Err(e) => log::error!("Failed to broadcast {}: {e}", msg.command),
        }
    }

    fn reply(&mut self, msg: &Message, identity: &str, departed: &mut Vec<String>) {
        match self.router.send_to(msg, &mut self.registry, identity) {
            Ok(delivery) => departed.extend(delivery.shed.into_iter().map(|entry| entry.identity)),
            Err(e) => log::error!("Failed to send {} to {identity}: {e}", msg.command),
        }
    }

    /// Announce departures, including any sessions shed while announcing.
    fn announce(&mut self, departed: Vec<String>) {
        let mut pending: VecDeque<String> = departed.into();
        while let Some(identity) = pending.pop_front() {
            if !self.config.announce_departures || self.registry.contains(&identity) {
                continue;
            }
            let mut shed = Vec::new();
            self.fan_out(&Message::remove_client(identity.as_str()), None, &mut shed);
            pending.extend(shed);
        }
    }

    fn record(&self, outcome: &Outcome) {
        let counter = match outcome {
            Outcome::Applied => &self.stats.applied,
            Outcome::Rejected(_) => &self.stats.rejected,
            Outcome::Ignored => &self.stats.ignored,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn publish(&self) {
        self.presence.send_replace(PresenceSnapshot {
            document_len: self.document.len(),
            clients: self.registry.summaries(),
        });
    }
}

impl std::fmt::Debug for CommandProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandProcessor")
            .field("document", &self.document)
            .field("clients", &self.registry.len())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandTranslator;
    use crate::protocol::Inbound;
    use crate::session::OutboundQueue;
    use cowrite_core::MemoryStore;

    fn processor() -> CommandProcessor {
        CommandProcessor::new(Document::in_memory("test"), ProcessorConfig::default())
    }

    fn processor_with(config: ProcessorConfig) -> CommandProcessor {
        CommandProcessor::new(Document::in_memory("test"), config)
    }

    /// Join `name` on a fresh session and discard the join handshake frames.
    fn join(p: &mut CommandProcessor, name: &str) -> (SessionHandle, OutboundQueue) {
        join_with_capacity(p, name, 64)
    }

    fn join_with_capacity(p: &mut CommandProcessor, name: &str, capacity: usize) -> (SessionHandle, OutboundQueue) {
        let (session, mut queue) = SessionHandle::channel(capacity);
        let outcome = p.apply(Command::Join {
            identity: name.into(),
            session: session.clone(),
        });
        assert!(matches!(outcome, Outcome::Applied));
        drain(&mut queue);
        (session, queue)
    }

    fn drain(queue: &mut OutboundQueue) -> Vec<Message> {
        let mut out = Vec::new();
        while let Some(frame) = queue.try_next() {
            out.extend(Message::decode_all(&frame).unwrap());
        }
        out
    }

    fn add(origin: &str, start: i64, text: &str) -> Command {
        Command::Add {
            origin: Some(origin.into()),
            start,
            text: text.into(),
        }
    }

    #[test]
    fn test_hello_world_through_processor() {
        let mut p = processor();
        let (_a, mut qa) = join(&mut p, "ana");
        let (_b, mut qb) = join(&mut p, "bo");
        drain(&mut qa);

        p.apply(add("ana", 0, "Hello, "));
        p.apply(add("bo", 7, "world!"));
        assert_eq!(p.document().content(), b"Hello, world!");

        p.apply(Command::Remove {
            origin: Some("ana".into()),
            start: 5,
            end: 7,
        });
        assert_eq!(p.document().content(), b"Helloworld!");

        // Each side sees only the other's edits.
        let to_ana = drain(&mut qa);
        assert_eq!(to_ana, vec![Message::add(Some("bo".into()), 7, "world!")]);
        let to_bo = drain(&mut qb);
        assert_eq!(
            to_bo,
            vec![
                Message::add(Some("ana".into()), 0, "Hello, "),
                Message::remove(Some("ana".into()), 5, 7),
            ]
        );
    }

    #[test]
    fn test_join_handshake() {
        let mut p = processor();
        let (_a, mut qa) = join(&mut p, "ana");
        let (_b, mut qb) = join(&mut p, "bo");
        drain(&mut qa);
        drain(&mut qb);
        p.apply(add("ana", 0, "abc"));
        drain(&mut qb);

        let (carol, mut qc) = SessionHandle::channel(8);
        p.apply(Command::Join {
            identity: "carol".into(),
            session: carol,
        });

        assert_eq!(
            drain(&mut qc),
            vec![
                Message::document("abc"),
                Message::clients_list(vec!["ana".into(), "bo".into()]),
            ]
        );
        assert_eq!(drain(&mut qa), vec![Message::new_client("carol")]);
        assert_eq!(drain(&mut qb), vec![Message::new_client("carol")]);
        assert_eq!(p.registry().len(), 3);
    }

    #[test]
    fn test_range_error_is_dropped_and_queue_continues() {
        let mut p = processor();
        let (_a, mut qa) = join(&mut p, "ana");
        let (_b, mut qb) = join(&mut p, "bo");
        drain(&mut qa);

        let outcome = p.apply(add("ana", 5, "x"));
        assert!(matches!(outcome, Outcome::Rejected(Rejection::Document(ref e)) if e.is_range()));
        assert!(drain(&mut qb).is_empty());
        assert!(drain(&mut qa).is_empty());

        p.apply(add("ana", 0, "ok"));
        assert_eq!(p.document().content(), b"ok");
        assert_eq!(drain(&mut qb).len(), 1);
        assert_eq!(p.monitor().stats().commands_rejected, 1);
    }

    #[test]
    fn test_report_errors_notifies_originator_only() {
        let mut p = processor_with(ProcessorConfig {
            report_errors: true,
            ..ProcessorConfig::default()
        });
        let (_a, mut qa) = join(&mut p, "ana");
        let (_b, mut qb) = join(&mut p, "bo");
        drain(&mut qa);

        p.apply(Command::Remove {
            origin: Some("ana".into()),
            start: 3,
            end: 1,
        });

        let to_ana = drain(&mut qa);
        assert_eq!(to_ana.len(), 1);
        assert_eq!(to_ana[0].command, CommandKind::Error);
        assert!(to_ana[0].message.is_some());
        assert!(drain(&mut qb).is_empty());
    }

    #[test]
    fn test_empty_add_is_ignored() {
        let mut p = processor();
        let (_a, _qa) = join(&mut p, "ana");
        let (_b, mut qb) = join(&mut p, "bo");

        assert!(matches!(p.apply(add("ana", 0, "")), Outcome::Ignored));
        assert!(drain(&mut qb).is_empty());
    }

    #[test]
    fn test_anonymous_edit_reaches_everyone() {
        let mut p = processor();
        let (_a, mut qa) = join(&mut p, "ana");
        let (_b, mut qb) = join(&mut p, "bo");
        drain(&mut qa);

        p.apply(Command::Add {
            origin: None,
            start: 0,
            text: "x".into(),
        });
        assert_eq!(drain(&mut qa).len(), 1);
        assert_eq!(drain(&mut qb).len(), 1);
    }

    #[test]
    fn test_leave_closes_and_announces() {
        let mut p = processor();
        let (a, _qa) = join(&mut p, "ana");
        let (_b, mut qb) = join(&mut p, "bo");

        let outcome = p.apply(Command::Leave {
            identity: "ana".into(),
            session: Some(a.id()),
        });
        assert!(matches!(outcome, Outcome::Applied));
        assert!(a.is_closed());
        assert!(!p.registry().contains("ana"));
        assert_eq!(drain(&mut qb), vec![Message::remove_client("ana")]);
    }

    #[test]
    fn test_departures_not_announced_when_disabled() {
        let mut p = processor_with(ProcessorConfig {
            announce_departures: false,
            ..ProcessorConfig::default()
        });
        let (a, _qa) = join(&mut p, "ana");
        let (_b, mut qb) = join(&mut p, "bo");

        p.apply(Command::Leave {
            identity: "ana".into(),
            session: Some(a.id()),
        });
        assert!(drain(&mut qb).is_empty());
    }

    #[test]
    fn test_join_replace_closes_previous_session() {
        let mut p = processor();
        let (old, _old_q) = join(&mut p, "ana");
        let (_b, mut qb) = join(&mut p, "bo");
        let (new, _new_q) = join(&mut p, "ana");

        assert!(old.is_closed());
        assert!(!new.is_closed());
        assert_eq!(p.registry().lookup("ana").map(|s| s.id()), Some(new.id()));

        // The old connection's late LEAVE must not evict the new holder.
        let outcome = p.apply(Command::Leave {
            identity: "ana".into(),
            session: Some(old.id()),
        });
        assert!(matches!(outcome, Outcome::Ignored));
        assert!(p.registry().contains("ana"));
        assert_eq!(drain(&mut qb), vec![Message::new_client("ana")]);
    }

    #[test]
    fn test_join_reject_refuses_newcomer() {
        let mut p = processor_with(ProcessorConfig {
            join_policy: JoinPolicy::Reject,
            report_errors: true,
            ..ProcessorConfig::default()
        });
        let (first, _qa) = join(&mut p, "ana");

        let (second, mut queue) = SessionHandle::channel(8);
        let outcome = p.apply(Command::Join {
            identity: "ana".into(),
            session: second.clone(),
        });

        assert!(matches!(outcome, Outcome::Rejected(Rejection::IdentityTaken(_))));
        assert!(second.is_closed());
        assert!(!first.is_closed());
        let notice = drain(&mut queue);
        assert_eq!(notice.len(), 1);
        assert_eq!(notice[0].command, CommandKind::Error);
    }

    #[test]
    fn test_unjoined_edit_claiming_peer_name_reaches_that_peer() {
        let mut p = processor();
        let (_b, mut qb) = join(&mut p, "bo");

        let (stranger, _queue) = SessionHandle::channel(8);
        let mut translator = CommandTranslator::new(stranger);
        let cmd = translator
            .translate(Inbound::Add {
                client: Some("bo".into()),
                start: 0,
                text: "X".into(),
            })
            .unwrap()
            .unwrap();

        assert!(matches!(p.apply(cmd), Outcome::Applied));
        assert_eq!(p.document().content(), b"X");
        assert_eq!(drain(&mut qb), vec![Message::add(None, 0, "X")]);
    }

    #[test]
    fn test_refused_rename_releases_previous_name() {
        let mut p = processor_with(ProcessorConfig {
            join_policy: JoinPolicy::Reject,
            ..ProcessorConfig::default()
        });
        let (session, _queue) = SessionHandle::channel(16);
        let mut translator = CommandTranslator::new(session.clone());
        let join_ana = translator.translate(Inbound::Join { client: "ana".into() }).unwrap().unwrap();
        assert!(matches!(p.apply(join_ana), Outcome::Applied));
        let (_b, mut qb) = join(&mut p, "bo");

        let join_bo = translator.translate(Inbound::Join { client: "bo".into() }).unwrap().unwrap();
        let outcome = p.apply(join_bo);

        assert!(matches!(outcome, Outcome::Rejected(Rejection::IdentityTaken(_))));
        assert!(session.is_closed());
        assert_eq!(p.registry().list_identities(None), vec!["bo"]);
        assert_eq!(drain(&mut qb), vec![Message::remove_client("ana")]);
        assert_eq!(p.monitor().presence().clients.len(), 1);

        // The connection's own departure names the refused identity and is ignored.
        let departure = translator.departure().unwrap();
        assert!(matches!(p.apply(departure), Outcome::Ignored));
        assert!(p.registry().contains("bo"));
    }

    #[test]
    fn test_rejoin_under_new_name_drops_old_name() {
        let mut p = processor();
        let (session, mut queue) = SessionHandle::channel(16);
        p.apply(Command::Join {
            identity: "ana".into(),
            session: session.clone(),
        });
        let (_b, mut qb) = join(&mut p, "bo");
        drain(&mut queue);

        p.apply(Command::Join {
            identity: "anna".into(),
            session: session.clone(),
        });

        assert_eq!(p.registry().list_identities(None), vec!["anna", "bo"]);
        assert_eq!(
            drain(&mut qb),
            vec![Message::new_client("anna"), Message::remove_client("ana")]
        );
    }

    #[test]
    fn test_saturated_session_is_shed_and_announced() {
        let mut p = processor();
        let (_a, mut qa) = join(&mut p, "ana");
        let (slow, _slow_q) = join_with_capacity(&mut p, "slow", 3);
        drain(&mut qa);

        // Three queued frames fill the slow session; the fourth sheds it.
        for i in 0..4 {
            p.apply(add("ana", i, "x"));
        }

        assert!(slow.is_closed());
        assert!(!p.registry().contains("slow"));
        assert_eq!(drain(&mut qa), vec![Message::remove_client("slow")]);

        // Others carry on unaffected.
        let (_c, mut qc) = join(&mut p, "carol");
        p.apply(add("ana", 0, "y"));
        assert_eq!(drain(&mut qc).len(), 1);
        assert_eq!(p.document().content(), b"yxxxx");
        assert_eq!(p.monitor().broadcast_stats().sessions_shed, 1);
    }

    #[test]
    fn test_request_document_replies_with_snapshot() {
        let mut p = processor();
        let (_a, mut qa) = join(&mut p, "ana");
        let (_b, mut qb) = join(&mut p, "bo");
        p.apply(add("bo", 0, "shared text"));
        drain(&mut qa);
        drain(&mut qb);

        p.apply(Command::RequestDocument { identity: "ana".into() });
        assert_eq!(drain(&mut qa), vec![Message::document("shared text")]);
        assert!(drain(&mut qb).is_empty());

        let outcome = p.apply(Command::RequestDocument { identity: "ghost".into() });
        assert!(matches!(outcome, Outcome::Rejected(Rejection::Registry(_))));
    }

    #[test]
    fn test_cursor_move_updates_presence() {
        let mut p = processor();
        let (_a, mut qa) = join(&mut p, "ana");
        let (_b, mut qb) = join(&mut p, "bo");
        p.apply(add("ana", 0, "ab\ncd"));
        drain(&mut qa);
        drain(&mut qb);

        let monitor = p.monitor();
        p.apply(Command::CursorMove {
            identity: "ana".into(),
            position: 4,
        });

        assert_eq!(drain(&mut qb), vec![Message::cursor_move("ana", 4)]);
        assert!(drain(&mut qa).is_empty());

        let presence = monitor.presence();
        assert_eq!(presence.document_len, 5);
        let ana = presence.clients.iter().find(|c| c.identity == "ana").unwrap();
        assert_eq!((ana.cursor, ana.line), (Some(4), Some(1)));
    }

    #[test]
    fn test_edits_are_persisted() {
        let store = MemoryStore::new();
        let doc = Document::load("test", Box::new(store.clone())).unwrap();
        let mut p = CommandProcessor::new(doc, ProcessorConfig::default());

        p.apply(add("ana", 0, "saved"));
        assert_eq!(store.contents(), b"saved");
    }

    #[tokio::test]
    async fn test_run_applies_in_queue_order_and_closes_sessions() {
        let mut p = processor();
        let (a, _qa) = join(&mut p, "ana");
        let (tx, rx) = mpsc::channel(16);

        tx.send(add("ana", 0, "AB")).await.unwrap();
        tx.send(add("ana", 1, "x")).await.unwrap();
        tx.send(Command::Remove {
            origin: None,
            start: 0,
            end: 1,
        })
        .await
        .unwrap();
        drop(tx);

        let p = p.run(rx).await;
        assert_eq!(p.document().content(), b"xB");
        assert!(p.registry().is_empty());
        assert!(a.is_closed());
    }
}
