//! Engine event log
//!
//! Bounded audit trail of what the engine did:
//! - Event: envelope with id + timestamp + kind
//! - EventKind: load lifecycle and element binding
//! - EventLog: thread-safe, shared by clones; keeps the newest events

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Single event in the engine log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence ID
    pub id: u64,
    /// Time since engine start (ms)
    pub timestamp_ms: u64,
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    // ═══════════════════════════════════════════
    // LOAD LIFECYCLE
    // ═══════════════════════════════════════════
    /// First request for a mold; a fetch is issued
    LoadStarted { mold_id: Arc<str> },
    /// Request joined a load already in flight
    LoadJoined { mold_id: Arc<str> },
    SourceFetched {
        mold_id: Arc<str>,
        path: String,
        len: usize,
        /// Served from the resident set rather than the fetcher
        resident: bool,
    },
    TemplateCompiled { mold_id: Arc<str> },
    LoadFailed { mold_id: Arc<str>, error: String },

    // ═══════════════════════════════════════════
    // BINDING
    // ═══════════════════════════════════════════
    ElementBound { mold_id: Arc<str>, tag: String },
    /// Element was already bound by an earlier call
    BindSkipped { mold_id: Arc<str>, tag: String },
}

impl EventKind {
    pub fn mold_id(&self) -> &str {
        match self {
            Self::LoadStarted { mold_id }
            | Self::LoadJoined { mold_id }
            | Self::SourceFetched { mold_id, .. }
            | Self::TemplateCompiled { mold_id }
            | Self::LoadFailed { mold_id, .. }
            | Self::ElementBound { mold_id, .. }
            | Self::BindSkipped { mold_id, .. } => mold_id,
        }
    }

    pub fn is_binding_event(&self) -> bool {
        matches!(self, Self::ElementBound { .. } | Self::BindSkipped { .. })
    }
}

/// Events kept by [`EventLog::new`]
pub const DEFAULT_EVENT_CAPACITY: usize = 10_000;

/// Thread-safe event log holding at most `capacity` events
///
/// Once full, each emit drops the oldest event. Ids keep counting, so a
/// gap before the first retained id shows how much was dropped.
#[derive(Clone)]
pub struct EventLog {
    events: Arc<RwLock<VecDeque<Event>>>,
    capacity: usize,
    start_time: Instant,
    next_id: Arc<AtomicU64>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Log keeping the newest `capacity` events (at least one)
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Arc::new(RwLock::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity,
            start_time: Instant::now(),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Emit an event (returns event ID)
    pub fn emit(&self, kind: EventKind) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let event = Event {
            id,
            timestamp_ms: self.start_time.elapsed().as_millis() as u64,
            kind,
        };

        let mut events = self.events.write();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
        id
    }

    /// Retained events, oldest first
    pub fn events(&self) -> Vec<Event> {
        self.events.read().iter().cloned().collect()
    }

    /// Events concerning one mold
    pub fn filter_mold(&self, mold_id: &str) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.kind.mold_id() == mold_id)
            .collect()
    }

    /// Count events matching a predicate
    pub fn count(&self, pred: impl Fn(&EventKind) -> bool) -> usize {
        self.events.read().iter().filter(|e| pred(&e.kind)).count()
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self.events()).unwrap_or(Value::Null)
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
