//! Session orchestration: one render tick drives every subsystem in a fixed
//! order on a single thread.

use std::time::Duration;

use image::RgbaImage;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    assets::ClipLibrary,
    audio::{AudioInput, LiveAudioSource},
    config::AppConfig,
    events::{ManualTrigger, VisemeEvent, VisemeEventSource},
    record::{CaptureBackend, FrameStream, OutputSink},
    render::Compositor,
    scheduler::{ClipScheduler, SchedulerPhase},
    timeline::{PlaybackClock, RunId, TimelineEvent, TimelinePlayer},
    Result,
};

/// Smoothing factor of the latency moving average.
const LATENCY_SMOOTHING: f32 = 0.2;

/// Coarse rating of the event-to-frame latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LatencyStatus {
    Idle,
    Excellent,
    Good,
    High,
}

impl LatencyStatus {
    pub fn from_ms(latency_ms: f32) -> Self {
        if latency_ms <= 0.0 {
            Self::Idle
        } else if latency_ms < 300.0 {
            Self::Excellent
        } else if latency_ms < 500.0 {
            Self::Good
        } else {
            Self::High
        }
    }
}

/// Snapshot of what the session exposes to a status display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSignals {
    pub current_viseme: Option<String>,
    pub phase: SchedulerPhase,
    pub latency_ms: f32,
    pub latency: LatencyStatus,
    pub microphone_active: bool,
    pub capture_active: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct LatencyTracker {
    average_ms: Option<f32>,
}

impl LatencyTracker {
    fn record(&mut self, sample: Duration) {
        let sample_ms = sample.as_secs_f32() * 1_000.0;
        self.average_ms = Some(match self.average_ms {
            Some(avg) => avg + (sample_ms - avg) * LATENCY_SMOOTHING,
            None => sample_ms,
        });
    }

    fn value(&self) -> f32 {
        self.average_ms.unwrap_or(0.0)
    }
}

/// A running avatar: clip library, scheduler, compositor, capture sink and
/// the three event sources.
#[derive(Debug)]
pub struct AvatarSession {
    config: AppConfig,
    library: ClipLibrary,
    scheduler: ClipScheduler,
    compositor: Compositor,
    sink: OutputSink,
    timeline: TimelinePlayer,
    live: LiveAudioSource,
    manual: ManualTrigger,
    clock: PlaybackClock,
    latency: LatencyTracker,
}

impl AvatarSession {
    /// Builds a session and puts the rest clip on screen at time zero.
    pub fn new(
        config: AppConfig,
        mut library: ClipLibrary,
        capture: Box<dyn CaptureBackend>,
    ) -> Result<Self> {
        config.validate()?;

        let mut scheduler = ClipScheduler::new(config.crossfade.clone());
        scheduler.start(&mut library, Duration::ZERO);

        info!(
            clips = library.handle_count(),
            taxonomy = ?library.taxonomy().complexity(),
            width = config.output.width,
            height = config.output.height,
            "session created"
        );
        Ok(Self {
            compositor: Compositor::new(&config.output, config.chroma.clone()),
            sink: OutputSink::new(capture, &config.output),
            live: LiveAudioSource::new(library.taxonomy(), &config.live),
            timeline: TimelinePlayer::new(),
            manual: ManualTrigger::new(),
            clock: PlaybackClock::default(),
            latency: LatencyTracker::default(),
            scheduler,
            library,
            config,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// The clip library currently in use.
    pub fn library(&self) -> &ClipLibrary {
        &self.library
    }

    pub fn scheduler(&self) -> &ClipScheduler {
        &self.scheduler
    }

    pub fn compositor(&self) -> &Compositor {
        &self.compositor
    }

    /// Session time of the last tick.
    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// The last composited frame; `None` before the first tick.
    pub fn surface(&self) -> Option<&RgbaImage> {
        self.compositor.surface()
    }

    /// Runs one frame at session time `now`.
    ///
    /// Order: advance playback, gather due events from every source and apply
    /// them oldest first, resolve continuations, finish crossfades, composite,
    /// then hand the frame to the capture sink. A device failure is returned
    /// after the frame has been drawn, so the loop can keep going.
    pub fn tick(&mut self, now: Duration) -> Result<()> {
        let delta = self.clock.advance_to(now);
        let now = self.clock.now();

        let ended = self.library.advance(delta);
        self.scheduler.clips_ended(&ended);

        let mut events: Vec<VisemeEvent> = self.timeline.poll(now);
        events.extend(self.live.poll(now));
        events.extend(self.manual.poll(now));
        events.sort_by_key(|event| event.at);
        self.scheduler.set_busy(self.timeline.is_running());

        for event in &events {
            self.scheduler.handle_event(event, &mut self.library, now);
            self.latency.record(now.saturating_sub(event.at));
        }

        self.scheduler.drain(&mut self.library, now);
        self.scheduler.update(&mut self.library, now);
        self.compositor.render(self.scheduler.layers(now), &self.library);

        let pushed = match self.compositor.surface() {
            Some(surface) => self.sink.push_frame(now, surface).map(|_| ()),
            None => Ok(()),
        };
        if let Some(err) = self.live.take_error() {
            return Err(err);
        }
        pushed
    }

    /// Replaces the clip library wholesale. Scheduler state starts over on
    /// the new library's rest clip.
    pub fn reload(&mut self, library: ClipLibrary) {
        self.scheduler.reset(&mut self.library);
        self.library.unload();
        self.library = library;
        self.live.set_taxonomy(self.library.taxonomy());
        self.scheduler.start(&mut self.library, self.clock.now());
        info!(clips = self.library.handle_count(), "clip library reloaded");
    }

    /// Starts a timeline run at the current session time, superseding any run
    /// in progress.
    pub fn play_timeline(&mut self, events: Vec<TimelineEvent>, speed: f32) -> Result<RunId> {
        self.manual.stop();
        self.timeline.start(events, speed, self.clock.now())
    }

    /// Cancels the running timeline. A clip held past its end reverts to rest
    /// on the next tick.
    pub fn stop_timeline(&mut self) {
        self.timeline.stop();
        self.scheduler.set_busy(false);
    }

    pub fn is_timeline_running(&self) -> bool {
        self.timeline.is_running()
    }

    /// Requests `viseme` on the next tick. Returns `false` while a timeline is
    /// playing.
    pub fn trigger(&mut self, viseme: impl Into<String>) -> bool {
        self.manual
            .request(viseme, self.clock.now(), self.timeline.is_running())
    }

    /// Opens `input` as the live microphone. Already listening is a no-op;
    /// the second input is dropped unopened.
    pub fn start_microphone(&mut self, input: Box<dyn AudioInput>) -> Result<()> {
        if self.live.is_active() {
            info!("microphone already active");
            return Ok(());
        }
        self.live.start(input)
    }

    /// Releases the microphone; idle sessions ignore this.
    pub fn stop_microphone(&mut self) {
        self.live.stop();
    }

    /// Starts publishing frames. Fails with `RenderSurfaceUnavailable` before
    /// the first tick.
    pub fn start_capture(&mut self) -> Result<FrameStream> {
        self.sink.start(self.compositor.surface())
    }

    /// Stops publishing frames. Safe to call repeatedly.
    pub fn stop_capture(&mut self) {
        self.sink.stop();
    }

    /// Snapshot of what the UI shows.
    pub fn status(&self) -> StatusSignals {
        let latency_ms = self.latency.value();
        StatusSignals {
            current_viseme: self.scheduler.current_viseme().map(str::to_owned),
            phase: self.scheduler.phase(),
            latency_ms,
            latency: LatencyStatus::from_ms(latency_ms),
            microphone_active: self.live.is_active(),
            capture_active: self.sink.is_active(),
        }
    }

    /// Cancels every source and releases both devices.
    pub fn shutdown(&mut self) {
        self.timeline.stop();
        self.manual.stop();
        self.live.stop();
        self.sink.stop();
        self.scheduler.reset(&mut self.library);
        if self.library.playing_count() > 0 {
            warn!(playing = self.library.playing_count(), "clips still playing after shutdown");
        }
        info!("session shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assets::tests::{manifest, memory_loader},
        audio::tests::ScriptedInput,
        record::tests::{CaptureLog, RecordingBackend},
        AvatarError, VisemeTaxonomy,
    };
    use std::{cell::RefCell, rc::Rc};

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.output.width = 8;
        config.output.height = 4;
        config.live.fft_size = 256;
        config.live.seed = Some(3);
        config
    }

    fn library() -> ClipLibrary {
        ClipLibrary::preload(
            VisemeTaxonomy::default(),
            &manifest(&[
                ("Baa", 0, "baa-0"),
                ("Ohh", 0, "ohh-0"),
                ("Mee", 0, "mee-0"),
                ("Mee", 1, "mee-1"),
            ]),
            &mut memory_loader(),
        )
    }

    fn session() -> (AvatarSession, Rc<RefCell<CaptureLog>>) {
        let (backend, log) = RecordingBackend::new();
        let session = AvatarSession::new(config(), library(), Box::new(backend)).unwrap();
        (session, log)
    }

    #[test]
    fn starts_on_rest() {
        let (session, _) = session();
        assert_eq!(session.scheduler().phase(), SchedulerPhase::Idle);
        assert_eq!(session.status().current_viseme.as_deref(), Some("Baa"));
        assert_eq!(session.status().latency, LatencyStatus::Idle);
    }

    #[test]
    fn capture_before_first_frame_is_rejected() {
        let (mut session, log) = session();
        let err = session.start_capture().unwrap_err();
        assert!(matches!(err, AvatarError::RenderSurfaceUnavailable));
        assert_eq!(log.borrow().opens, 0);

        session.tick(ms(0)).unwrap();
        session.start_capture().unwrap();
        session.start_capture().unwrap();
        assert_eq!(log.borrow().opens, 1);
        assert!(session.status().capture_active);
    }

    #[test]
    fn manual_trigger_applies_on_next_tick() {
        let (mut session, _) = session();
        session.tick(ms(0)).unwrap();
        assert!(session.trigger("Ohh"));
        session.tick(ms(16)).unwrap();
        assert_eq!(session.status().current_viseme.as_deref(), Some("Ohh"));
        assert_eq!(session.scheduler().phase(), SchedulerPhase::Active);
    }

    #[test]
    fn clip_end_reverts_to_rest() {
        let (mut session, _) = session();
        session.tick(ms(0)).unwrap();
        session.trigger("Ohh");
        session.tick(ms(10)).unwrap();
        for t in (20..=400).step_by(16) {
            session.tick(ms(t)).unwrap();
        }
        assert_eq!(session.scheduler().phase(), SchedulerPhase::Idle);
        assert_eq!(session.status().current_viseme.as_deref(), Some("Baa"));
    }

    #[test]
    fn manual_trigger_is_ignored_during_timeline() {
        let (mut session, _) = session();
        session
            .play_timeline(vec![TimelineEvent::new("ow", 0.0, 1.0, "Ohh")], 1.0)
            .unwrap();
        assert!(!session.trigger("Mee"));
        session.tick(ms(16)).unwrap();
        assert_eq!(session.status().current_viseme.as_deref(), Some("Ohh"));
    }

    #[test]
    fn timeline_holds_clip_past_its_end_until_next_entry() {
        let (mut session, _) = session();
        // Ohh lasts 200 ms but the entry spans 400 ms.
        session
            .play_timeline(
                vec![
                    TimelineEvent::new("ow", 0.0, 0.4, "Ohh"),
                    TimelineEvent::new("iy", 0.4, 0.5, "Mee"),
                ],
                1.0,
            )
            .unwrap();
        for t in (0..=350).step_by(16) {
            session.tick(ms(t)).unwrap();
        }
        assert_eq!(session.status().current_viseme.as_deref(), Some("Ohh"));

        for t in (352..=1_000).step_by(16) {
            session.tick(ms(t)).unwrap();
        }
        assert!(!session.is_timeline_running());
        assert_eq!(session.status().current_viseme.as_deref(), Some("Baa"));
    }

    #[test]
    fn stop_timeline_cancels_remaining_entries() {
        let (mut session, _) = session();
        session
            .play_timeline(
                vec![
                    TimelineEvent::new("ow", 0.0, 0.1, "Ohh"),
                    TimelineEvent::new("iy", 0.2, 0.3, "Mee"),
                ],
                1.0,
            )
            .unwrap();
        session.tick(ms(0)).unwrap();
        session.stop_timeline();
        for t in (16..=600).step_by(16) {
            session.tick(ms(t)).unwrap();
        }
        assert_ne!(session.status().current_viseme.as_deref(), Some("Mee"));
        assert_eq!(session.scheduler().phase(), SchedulerPhase::Idle);
        assert_eq!(session.status().current_viseme.as_deref(), Some("Baa"));
        assert_eq!(session.library().playing_count(), 1);
    }

    #[test]
    fn stopping_after_a_held_clip_ended_returns_to_rest() {
        let (mut session, _) = session();
        // Ohh ends at 200 ms and is held on its last frame for the entry.
        session
            .play_timeline(vec![TimelineEvent::new("ow", 0.0, 1.0, "Ohh")], 1.0)
            .unwrap();
        for t in (0..=500).step_by(16) {
            session.tick(ms(t)).unwrap();
        }
        assert_eq!(session.status().current_viseme.as_deref(), Some("Ohh"));
        assert_eq!(session.scheduler().phase(), SchedulerPhase::Active);

        session.stop_timeline();
        for t in (512..=700).step_by(16) {
            session.tick(ms(t)).unwrap();
        }
        assert_eq!(session.scheduler().phase(), SchedulerPhase::Idle);
        assert_eq!(session.status().current_viseme.as_deref(), Some("Baa"));
        assert_eq!(session.library().playing_count(), 1);
    }

    #[test]
    fn queued_triggers_all_reach_the_scheduler() {
        let (mut session, _) = session();
        session.tick(ms(0)).unwrap();
        for _ in 0..3 {
            assert!(session.trigger("Mee"));
        }
        session.tick(ms(16)).unwrap();
        assert!(session.trigger("Mee"));
        session.tick(ms(32)).unwrap();

        // Three Mee requests walk variants 0, 1, 0; the fourth lands on 1.
        let active = session.scheduler().active().unwrap();
        assert_eq!(session.library().asset(active).unwrap().variant_index, 1);
    }

    #[test]
    fn out_of_range_timeline_is_rejected_without_panicking() {
        let (mut session, _) = session();
        let err = session
            .play_timeline(vec![TimelineEvent::new("ow", 0.0, 1.0, "Ohh")], 1e-30)
            .unwrap_err();
        assert!(matches!(err, AvatarError::InvalidInput(_)));
        assert!(!session.is_timeline_running());
        session.tick(ms(16)).unwrap();
        assert_eq!(session.scheduler().phase(), SchedulerPhase::Idle);
    }

    #[test]
    fn microphone_start_is_idempotent_and_released_on_shutdown() {
        let (mut session, _) = session();
        let (first, opens) = ScriptedInput::new(Vec::new());
        let (second, second_opens) = ScriptedInput::new(Vec::new());
        session.start_microphone(Box::new(first)).unwrap();
        session.start_microphone(Box::new(second)).unwrap();
        assert!(session.status().microphone_active);
        assert_eq!(second_opens.borrow().0, 0);

        session.shutdown();
        assert_eq!(*opens.borrow(), (1, 1));
        assert!(!session.status().microphone_active);
    }

    #[test]
    fn denied_microphone_is_reported() {
        let (mut session, _) = session();
        let (mut input, _) = ScriptedInput::new(Vec::new());
        input.deny = true;
        let err = session.start_microphone(Box::new(input)).unwrap_err();
        assert!(err.is_user_visible());
        assert!(!session.status().microphone_active);
    }

    #[test]
    fn reload_restarts_on_new_rest_clip() {
        let (mut session, _) = session();
        session.tick(ms(0)).unwrap();
        session.trigger("Ohh");
        session.tick(ms(16)).unwrap();

        let replacement = ClipLibrary::preload(
            VisemeTaxonomy::default(),
            &manifest(&[("Mee", 0, "mee-0")]),
            &mut memory_loader(),
        );
        session.reload(replacement);
        assert_eq!(session.scheduler().phase(), SchedulerPhase::Idle);
        assert_eq!(session.status().current_viseme.as_deref(), Some("Mee"));
        assert_eq!(session.library().playing_count(), 1);
    }

    #[test]
    fn latency_status_bands() {
        assert_eq!(LatencyStatus::from_ms(0.0), LatencyStatus::Idle);
        assert_eq!(LatencyStatus::from_ms(120.0), LatencyStatus::Excellent);
        assert_eq!(LatencyStatus::from_ms(450.0), LatencyStatus::Good);
        assert_eq!(LatencyStatus::from_ms(900.0), LatencyStatus::High);
    }

    #[test]
    fn latency_is_a_moving_average() {
        let mut tracker = LatencyTracker::default();
        tracker.record(ms(100));
        assert!((tracker.value() - 100.0).abs() < 0.01);
        tracker.record(ms(0));
        assert!((tracker.value() - 80.0).abs() < 0.01);
    }
}
