//! Fan-out of processed commands to registered sessions.
//!
//! An event is serialized once and the same [`Frame`] is pushed into every
//! recipient's bounded queue without waiting. A recipient whose queue is full
//! (or already closed) is shed: removed from the registry and its session
//! closed. One stuck consumer never delays the others.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::protocol::{Message, ProtocolError};
use crate::registry::{ClientEntry, ClientRegistry};
use crate::session::{DeliveryError, Frame};

/// Snapshot of router counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Events fanned out (one per broadcast call).
    pub messages_sent: u64,
    /// Frames successfully queued, across all recipients.
    pub deliveries: u64,
    pub sessions_shed: u64,
}

/// Lock-free counters, read through [`BroadcastRouter::stats`].
#[derive(Debug, Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    deliveries: AtomicU64,
    sessions_shed: AtomicU64,
}

/// Result of one fan-out.
#[derive(Debug, Default)]
pub struct Delivery {
    pub delivered: usize,
    /// Clients removed because their queue could not take the frame.
    pub shed: Vec<ClientEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct BroadcastRouter {
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send `msg` to every registered client except `exclude`.
    pub fn broadcast(
        &self,
        msg: &Message,
        registry: &mut ClientRegistry,
        exclude: Option<&str>,
    ) -> Result<Delivery, ProtocolError> {
        let frame: Frame = Arc::from(msg.encode()?);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0;
        let mut dead = Vec::new();
        for entry in registry.iter() {
            if Some(entry.identity.as_str()) == exclude {
                continue;
            }
            match entry.session.try_deliver(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => dead.push((entry.identity.clone(), e)),
            }
        }

        let shed = self.shed(registry, dead);
        self.stats.deliveries.fetch_add(delivered as u64, Ordering::Relaxed);
        log::trace!("{} delivered to {delivered} clients", msg.command);
        Ok(Delivery { delivered, shed })
    }

    /// Send `msg` to one client. An unregistered identity receives nothing.
    pub fn send_to(
        &self,
        msg: &Message,
        registry: &mut ClientRegistry,
        identity: &str,
    ) -> Result<Delivery, ProtocolError> {
        let Some(session) = registry.lookup(identity) else {
            return Ok(Delivery::default());
        };
        let frame: Frame = Arc::from(msg.encode()?);

        match session.try_deliver(frame) {
            Ok(()) => {
                self.stats.deliveries.fetch_add(1, Ordering::Relaxed);
                Ok(Delivery {
                    delivered: 1,
                    shed: Vec::new(),
                })
            }
            Err(e) => Ok(Delivery {
                delivered: 0,
                shed: self.shed(registry, vec![(identity.to_string(), e)]),
            }),
        }
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            deliveries: self.stats.deliveries.load(Ordering::Relaxed),
            sessions_shed: self.stats.sessions_shed.load(Ordering::Relaxed),
        }
    }

    fn shed(&self, registry: &mut ClientRegistry, dead: Vec<(String, DeliveryError)>) -> Vec<ClientEntry> {
        let mut shed = Vec::with_capacity(dead.len());
        for (identity, reason) in dead {
            if let Some(entry) = registry.unregister(&identity) {
                entry.session.close();
                match reason {
                    DeliveryError::Full => log::warn!("Shedding slow client {identity}: {reason}"),
                    DeliveryError::Closed => log::debug!("Dropping closed client {identity}"),
                }
                shed.push(entry);
            }
        }
        self.stats.sessions_shed.fetch_add(shed.len() as u64, Ordering::Relaxed);
        shed
    }
}
