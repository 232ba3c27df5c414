//! In-memory event store and query engine.
//!
//! Replaceable events (kinds `30000..40000` and `10002`) live in a map keyed by
//! their address `(pubkey, kind, d)`; everything else goes to an append-only
//! log. Ingest and query both take the single store lock, so the
//! remove-then-append of a replacement is one atomic step.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use tracing::{debug, info};

use crate::{
    event::{verify_event, Event},
    message::{Ack, Filter},
};

/// `(pubkey, kind, discriminator)` of a replaceable event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Address {
    pubkey: String,
    kind: u32,
    d: String,
}

impl Address {
    fn of(ev: &Event) -> Self {
        Self {
            pubkey: ev.pubkey.clone(),
            kind: ev.kind,
            d: ev.discriminator().to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct Stored {
    seq: u64,
    event: Event,
}

#[derive(Default)]
struct Inner {
    next_seq: u64,
    replaceable: HashMap<Address, Stored>,
    log: Vec<Stored>,
    ids: HashSet<String>,
}

/// Shared handle to the relay's events. Cloning shares the same store.
#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<RwLock<Inner>>,
    verify_sig: bool,
}

impl Store {
    pub fn new(verify_sig: bool) -> Self {
        Self {
            inner: Arc::default(),
            verify_sig,
        }
    }

    /// Validate and store `ev`, displacing any earlier event at the same
    /// replaceable address. The latest ingest wins regardless of `created_at`.
    pub fn ingest(&self, ev: Event) -> Ack {
        if ev.id.is_empty() || ev.pubkey.is_empty() {
            return Ack::rejected(ev.id, "invalid: missing id or pubkey");
        }
        // Optionally verify the event's Schnorr signature before storing.
        if self.verify_sig {
            if let Err(e) = verify_event(&ev) {
                debug!(id = %ev.id, "rejecting event: {e}");
                return Ack::rejected(ev.id, format!("invalid: {e}"));
            }
        }

        let mut inner = self.write();
        if inner.ids.contains(&ev.id) {
            return Ack::accepted(ev.id, "duplicate: already have this event");
        }
        let id = ev.id.clone();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.ids.insert(id.clone());
        if ev.is_replaceable() {
            let addr = Address::of(&ev);
            info!(id = %id, kind = ev.kind, d = %addr.d, "storing replaceable event");
            if let Some(old) = inner.replaceable.insert(addr, Stored { seq, event: ev }) {
                debug!(old = %old.event.id, new = %id, "replaced event");
                inner.ids.remove(&old.event.id);
            }
        } else {
            info!(id = %id, kind = ev.kind, "storing event");
            inner.log.push(Stored { seq, event: ev });
        }
        Ack::accepted(id, "")
    }

    /// Snapshot of events matching `filter`, newest first, truncated to its
    /// `limit`.
    pub fn query(&self, filter: &Filter) -> Vec<Event> {
        let inner = self.read();
        let mut hits: Vec<&Stored> = inner
            .replaceable
            .values()
            .chain(inner.log.iter())
            .filter(|s| filter.matches(&s.event))
            .collect();
        // Newest first; among equal timestamps the later ingest comes first.
        hits.sort_by(|a, b| {
            b.event
                .created_at
                .cmp(&a.event.created_at)
                .then(b.seq.cmp(&a.seq))
        });
        if let Some(limit) = filter.limit {
            hits.truncate(limit);
        }
        hits.into_iter().map(|s| s.event.clone()).collect()
    }

    /// Number of live events.
    pub fn len(&self) -> usize {
        let inner = self.read();
        inner.replaceable.len() + inner.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}
