//! Clip scheduling state machine.
//!
//! Events switch the active clip immediately. Starting playback and reacting
//! to a clip's end are deferred as continuations tagged with the request
//! token current at the time they were queued; [`ClipScheduler::drain`]
//! discards any continuation whose token has since been superseded.

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{
    assets::{ClipLibrary, HandleId},
    config::CrossfadeConfig,
    events::{EventOrigin, VisemeEvent, VisemeRequest},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerPhase {
    /// The rest clip is looping.
    Idle,
    /// A viseme clip is playing once and reverts to rest when it ends.
    Active,
    /// Two clips are blending.
    Transitioning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClipKind {
    Rest,
    Viseme,
}

#[derive(Debug, Clone, Copy)]
struct Crossfade {
    outgoing: HandleId,
    started_at: Duration,
}

#[derive(Debug, Clone, Copy)]
enum Continuation {
    Start {
        handle: HandleId,
        token: u64,
        looping: bool,
    },
    Ended {
        handle: HandleId,
        token: u64,
    },
}

/// A clip to draw this frame and its opacity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderLayer {
    pub handle: HandleId,
    pub opacity: f32,
}

/// Decides which clip plays in response to viseme events.
#[derive(Debug)]
pub struct ClipScheduler {
    current_viseme: Option<String>,
    active: Option<HandleId>,
    active_kind: ClipKind,
    crossfade: Option<Crossfade>,
    variant_counters: HashMap<String, usize>,
    token: u64,
    continuations: VecDeque<Continuation>,
    /// Clip end suppressed while busy, replayed once busy clears.
    held_end: Option<(HandleId, u64)>,
    busy: bool,
    fade: CrossfadeConfig,
}

impl ClipScheduler {
    /// A scheduler with nothing on screen; call [`ClipScheduler::start`] to
    /// enter the rest position.
    pub fn new(fade: CrossfadeConfig) -> Self {
        Self {
            current_viseme: None,
            active: None,
            active_kind: ClipKind::Rest,
            crossfade: None,
            variant_counters: HashMap::new(),
            token: 0,
            continuations: VecDeque::new(),
            held_end: None,
            busy: false,
            fade,
        }
    }

    /// Current state, derived from the active clip kind and any running fade.
    pub fn phase(&self) -> SchedulerPhase {
        match (self.crossfade, self.active_kind) {
            (Some(_), _) => SchedulerPhase::Transitioning,
            (None, ClipKind::Rest) => SchedulerPhase::Idle,
            (None, ClipKind::Viseme) => SchedulerPhase::Active,
        }
    }

    /// The incoming (or only) clip.
    pub fn active(&self) -> Option<HandleId> {
        self.active
    }

    /// The clip fading out, only during a crossfade.
    pub fn outgoing(&self) -> Option<HandleId> {
        self.crossfade.map(|fade| fade.outgoing)
    }

    /// Viseme id of the active clip.
    pub fn current_viseme(&self) -> Option<&str> {
        self.current_viseme.as_deref()
    }

    /// While busy, clip ends do not revert to rest. An end suppressed this
    /// way is resolved on the first drain after busy clears.
    pub fn set_busy(&mut self, busy: bool) {
        self.busy = busy;
    }

    /// Whether clip-end reverts are currently suppressed.
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Enters the rest position; used at session start.
    pub fn start(&mut self, library: &mut ClipLibrary, now: Duration) {
        self.enter_rest(library, now);
        self.drain(library, now);
    }

    /// Stops everything and forgets rotation state. Tokens keep counting so
    /// continuations queued before the reset stay stale.
    pub fn reset(&mut self, library: &mut ClipLibrary) {
        for handle in [self.active.take(), self.crossfade.take().map(|f| f.outgoing)]
            .into_iter()
            .flatten()
        {
            library.stop(handle);
        }
        self.token += 1;
        self.current_viseme = None;
        self.active_kind = ClipKind::Rest;
        self.variant_counters.clear();
        self.continuations.clear();
        self.held_end = None;
    }

    /// Applies one viseme-change event.
    pub fn handle_event(&mut self, event: &VisemeEvent, library: &mut ClipLibrary, now: Duration) {
        match &event.request {
            VisemeRequest::Rest => self.enter_rest(library, now),
            VisemeRequest::Viseme(id) => {
                let Some(handle) = self.next_variant(id, library) else {
                    debug!(viseme = %id, origin = ?event.origin, "no clip for viseme, resting");
                    self.enter_rest(library, now);
                    return;
                };
                self.current_viseme = Some(id.clone());
                self.switch_to(handle, ClipKind::Viseme, library, now);
            }
        }
    }

    /// Queues end-of-playback continuations for clips that just finished.
    pub fn clips_ended(&mut self, ended: &[HandleId]) {
        for handle in ended {
            if self.active == Some(*handle) {
                self.continuations.push_back(Continuation::Ended {
                    handle: *handle,
                    token: self.token,
                });
            }
        }
    }

    /// Resolves queued continuations, discarding superseded ones.
    pub fn drain(&mut self, library: &mut ClipLibrary, now: Duration) {
        if !self.busy {
            if let Some((handle, token)) = self.held_end.take() {
                self.continuations.push_back(Continuation::Ended { handle, token });
            }
        }

        while let Some(continuation) = self.continuations.pop_front() {
            match continuation {
                Continuation::Start {
                    handle,
                    token,
                    looping,
                } => {
                    if self.is_current(handle, token) {
                        library.play(handle, looping);
                    } else {
                        trace!(%handle, token, current = self.token, "discarding stale start");
                    }
                }
                Continuation::Ended { handle, token } => {
                    if !self.is_current(handle, token) || self.active_kind != ClipKind::Viseme {
                        trace!(%handle, token, "discarding stale clip end");
                    } else if self.busy {
                        trace!(%handle, "clip ended while busy, holding last frame");
                        self.held_end = Some((handle, token));
                    } else {
                        let revert = VisemeEvent::rest(EventOrigin::ClipEnded, now);
                        self.handle_event(&revert, library, now);
                    }
                }
            }
        }
    }

    /// Finishes a crossfade whose blend has completed.
    pub fn update(&mut self, library: &mut ClipLibrary, now: Duration) {
        if let Some(fade) = self.crossfade {
            if self.blend_weight(now) >= 1.0 {
                library.stop(fade.outgoing);
                self.crossfade = None;
                debug!(outgoing = %fade.outgoing, phase = ?self.phase(), "crossfade complete");
            }
        }
    }

    /// Incoming clip weight during a crossfade, 1.0 otherwise.
    pub fn blend_weight(&self, now: Duration) -> f32 {
        let Some(fade) = self.crossfade else {
            return 1.0;
        };
        let duration = self.fade.duration();
        if duration.is_zero() {
            return 1.0;
        }
        let elapsed = now.saturating_sub(fade.started_at);
        (elapsed.as_secs_f32() / duration.as_secs_f32()).clamp(0.0, 1.0)
    }

    /// Clips to composite this frame, outgoing first.
    pub fn layers(&self, now: Duration) -> impl Iterator<Item = RenderLayer> {
        let weight = self.blend_weight(now);
        let outgoing = self.crossfade.map(|fade| RenderLayer {
            handle: fade.outgoing,
            opacity: 1.0 - weight,
        });
        let incoming = self.active.map(|handle| RenderLayer {
            handle,
            opacity: weight,
        });
        [outgoing, incoming].into_iter().flatten()
    }

    fn is_current(&self, handle: HandleId, token: u64) -> bool {
        token == self.token && self.active == Some(handle)
    }

    fn next_variant(&mut self, id: &str, library: &ClipLibrary) -> Option<HandleId> {
        if !library.taxonomy().contains(id) {
            return None;
        }
        let handles = library.lookup(id);
        if handles.is_empty() {
            return None;
        }
        let counter = self.variant_counters.entry(id.to_string()).or_insert(0);
        let handle = handles[*counter % handles.len()];
        *counter = (*counter + 1) % handles.len();
        Some(handle)
    }

    fn enter_rest(&mut self, library: &mut ClipLibrary, now: Duration) {
        let Some(rest) = library.resolve_rest() else {
            return;
        };
        self.current_viseme = library.asset(rest).map(|asset| asset.viseme_id.clone());

        if self.active == Some(rest) {
            if self.active_kind == ClipKind::Rest {
                return;
            }
            // Already on screen: keep it going, just loop it from here on.
            self.token += 1;
            self.active_kind = ClipKind::Rest;
            library.set_looping(rest, true);
            if !library.is_playing(rest) {
                library.rewind(rest);
            }
            self.continuations.push_back(Continuation::Start {
                handle: rest,
                token: self.token,
                looping: true,
            });
            return;
        }

        self.switch_to(rest, ClipKind::Rest, library, now);
    }

    fn switch_to(&mut self, handle: HandleId, kind: ClipKind, library: &mut ClipLibrary, now: Duration) {
        self.token += 1;
        let looping = kind == ClipKind::Rest;
        let previous = self.active.replace(handle);
        self.active_kind = kind;

        if let Some(fade) = self.crossfade.take() {
            if fade.outgoing != handle {
                library.stop(fade.outgoing);
            }
        }

        match previous {
            Some(previous) if previous != handle && self.fade.enabled => {
                self.crossfade = Some(Crossfade {
                    outgoing: previous,
                    started_at: now,
                });
            }
            Some(previous) => library.stop(previous),
            None => {}
        }

        library.rewind(handle);
        library.set_looping(handle, looping);
        debug!(%handle, ?kind, token = self.token, "clip scheduled");
        self.continuations.push_back(Continuation::Start {
            handle,
            token: self.token,
            looping,
        });
    }
}
