use std::{collections::VecDeque, fmt, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// What an event asks the scheduler to show.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VisemeRequest {
    Viseme(String),
    /// Return to the rest position.
    Rest,
}

impl fmt::Display for VisemeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VisemeRequest::Viseme(id) => f.write_str(id),
            VisemeRequest::Rest => f.write_str("rest"),
        }
    }
}

/// Producer of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventOrigin {
    Timeline,
    LiveAudio,
    Manual,
    /// Synthetic revert issued when an active clip finishes.
    ClipEnded,
}

/// A viseme-change request stamped with the session time it was due.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisemeEvent {
    pub request: VisemeRequest,
    pub origin: EventOrigin,
    pub at: Duration,
}

impl VisemeEvent {
    pub fn viseme(id: impl Into<String>, origin: EventOrigin, at: Duration) -> Self {
        Self {
            request: VisemeRequest::Viseme(id.into()),
            origin,
            at,
        }
    }

    pub fn rest(origin: EventOrigin, at: Duration) -> Self {
        Self {
            request: VisemeRequest::Rest,
            origin,
            at,
        }
    }

    pub fn is_rest(&self) -> bool {
        self.request == VisemeRequest::Rest
    }
}

/// Common contract of every event producer: strictly ordered events that
/// never go back in time, and no events at all once stopped.
pub trait VisemeEventSource {
    /// Returns the events that became due at or before `now`, oldest first.
    fn poll(&mut self, now: Duration) -> Vec<VisemeEvent>;

    fn stop(&mut self);

    fn is_active(&self) -> bool;
}

/// Direct one-shot viseme requests, delivered in request order.
#[derive(Debug, Default)]
pub struct ManualTrigger {
    pending: VecDeque<VisemeEvent>,
    last_at: Duration,
}

impl ManualTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of requests waiting for the next poll.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Queues an immediate event. Ignored while a timeline run is in
    /// progress so the two never interleave.
    pub fn request(&mut self, viseme: impl Into<String>, now: Duration, timeline_busy: bool) -> bool {
        let viseme = viseme.into();
        if timeline_busy {
            debug!(%viseme, "manual trigger ignored while timeline is playing");
            return false;
        }
        let at = now.max(self.last_at);
        self.last_at = at;
        self.pending
            .push_back(VisemeEvent::viseme(viseme, EventOrigin::Manual, at));
        true
    }
}

impl VisemeEventSource for ManualTrigger {
    fn poll(&mut self, _now: Duration) -> Vec<VisemeEvent> {
        self.pending.drain(..).collect()
    }

    fn stop(&mut self) {
        self.pending.clear();
    }

    fn is_active(&self) -> bool {
        !self.pending.is_empty()
    }
}
