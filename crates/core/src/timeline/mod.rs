use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    events::{EventOrigin, VisemeEvent, VisemeEventSource},
    AvatarError, Result,
};

/// Monotonic session clock fed by the render loop.
#[derive(Debug, Default, Clone)]
pub struct PlaybackClock {
    now: Duration,
}

impl PlaybackClock {
    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn reset(&mut self) {
        self.now = Duration::ZERO;
    }

    /// Moves the clock to `now` and returns the elapsed delta. Earlier
    /// timestamps leave the clock where it is.
    pub fn advance_to(&mut self, now: Duration) -> Duration {
        let delta = now.saturating_sub(self.now);
        self.now = self.now.max(now);
        delta
    }
}

/// One aligned phoneme interval, as produced by the alignment service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub phoneme: String,
    /// Seconds from the start of the utterance.
    pub start: f32,
    pub end: f32,
    #[serde(alias = "visemeId")]
    pub viseme: String,
}

impl TimelineEvent {
    pub fn new(phoneme: impl Into<String>, start: f32, end: f32, viseme: impl Into<String>) -> Self {
        Self {
            phoneme: phoneme.into(),
            start,
            end,
            viseme: viseme.into(),
        }
    }
}

/// Reads a JSON array of timeline entries.
pub fn load_timeline(path: impl AsRef<Path>) -> Result<Vec<TimelineEvent>> {
    let raw = std::fs::read_to_string(path.as_ref())?;
    Ok(serde_json::from_str(&raw)?)
}

/// Identifier of a single timeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunId(u64);

#[derive(Debug)]
struct TimelineRun {
    id: RunId,
    events: Vec<TimelineEvent>,
    speed: f32,
    started_at: Duration,
    next: usize,
    last_at: Duration,
}

/// Session time at which `seconds` of timeline elapse, or `None` when it
/// does not fit in a `Duration`.
fn scaled_offset(started_at: Duration, seconds: f32, speed: f32) -> Option<Duration> {
    let scaled = Duration::try_from_secs_f32((seconds / speed).max(0.0)).ok()?;
    started_at.checked_add(scaled)
}

impl TimelineRun {
    fn offset(&self, seconds: f32) -> Duration {
        scaled_offset(self.started_at, seconds, self.speed).unwrap_or(Duration::MAX)
    }

    fn rest_due(&self) -> Duration {
        let end = self
            .events
            .iter()
            .map(|e| e.end.max(e.start))
            .fold(0.0_f32, f32::max);
        self.offset(end)
    }
}

/// Replays a phoneme timeline as viseme events, finishing with one rest event.
#[derive(Debug, Default)]
pub struct TimelinePlayer {
    run: Option<TimelineRun>,
    next_run: u64,
}

impl TimelinePlayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new run at session time `now`, superseding any run in progress.
    pub fn start(&mut self, mut events: Vec<TimelineEvent>, speed: f32, now: Duration) -> Result<RunId> {
        if !(speed > 0.0) || !speed.is_finite() {
            return Err(AvatarError::invalid_input(format!(
                "timeline speed must be positive, got {speed}"
            )));
        }
        for entry in &events {
            let representable = entry.start.is_finite()
                && entry.end.is_finite()
                && scaled_offset(now, entry.start.max(entry.end), speed).is_some();
            if !representable {
                return Err(AvatarError::invalid_input(format!(
                    "timeline entry `{}` at {}..{}s cannot be scheduled at speed {speed}",
                    entry.viseme, entry.start, entry.end
                )));
            }
        }
        if let Some(previous) = self.run.take() {
            debug!(run = previous.id.0, "timeline run superseded");
        }

        events.sort_by(|a, b| a.start.total_cmp(&b.start));
        let id = RunId(self.next_run);
        self.next_run += 1;
        info!(run = id.0, entries = events.len(), speed, "timeline run started");
        self.run = Some(TimelineRun {
            id,
            events,
            speed,
            started_at: now,
            next: 0,
            last_at: now,
        });
        Ok(id)
    }

    /// Cancels the run in progress; nothing more is emitted from it.
    pub fn cancel(&mut self) {
        if let Some(run) = self.run.take() {
            info!(run = run.id.0, emitted = run.next, "timeline run cancelled");
        }
    }

    /// Whether a run still has entries or its terminal rest to deliver.
    pub fn is_running(&self) -> bool {
        self.run.is_some()
    }

    pub fn current_run(&self) -> Option<RunId> {
        self.run.as_ref().map(|run| run.id)
    }
}

impl VisemeEventSource for TimelinePlayer {
    fn poll(&mut self, now: Duration) -> Vec<VisemeEvent> {
        let Some(run) = self.run.as_mut() else {
            return Vec::new();
        };

        let mut emitted = Vec::new();
        while let Some(entry) = run.events.get(run.next) {
            let due = run.offset(entry.start).max(run.last_at);
            if due > now {
                return emitted;
            }
            emitted.push(VisemeEvent::viseme(entry.viseme.clone(), EventOrigin::Timeline, due));
            run.last_at = due;
            run.next += 1;
        }

        let rest_at = run.rest_due().max(run.last_at);
        if rest_at <= now {
            emitted.push(VisemeEvent::rest(EventOrigin::Timeline, rest_at));
            info!(run = run.id.0, "timeline run finished");
            self.run = None;
        }
        emitted
    }

    fn stop(&mut self) {
        self.cancel();
    }

    fn is_active(&self) -> bool {
        self.is_running()
    }
}
