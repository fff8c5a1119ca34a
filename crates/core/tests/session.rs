use std::{cell::RefCell, rc::Rc, time::Duration};

use image::{Rgba, RgbaImage};
use viseme_avatar_core::{
    AppConfig, AvatarSession, BackgroundImage, CaptureBackend, ClipAsset, ClipLibrary,
    ClipManifest, ClipSource, Complexity, ImageSequence, Result, SchedulerPhase, StreamFormat,
    TimelineEvent, VisemeTaxonomy,
};

const KEY_GREEN: Rgba<u8> = Rgba([10, 200, 10, 255]);
const SKY: Rgba<u8> = Rgba([40, 90, 220, 255]);

#[derive(Debug, Default)]
struct Calls {
    opens: usize,
    closes: usize,
    frames: usize,
}

struct CountingCapture(Rc<RefCell<Calls>>);

impl CaptureBackend for CountingCapture {
    fn open(&mut self, _format: &StreamFormat) -> Result<()> {
        self.0.borrow_mut().opens += 1;
        Ok(())
    }

    fn write_frame(&mut self, _rgba: &[u8]) -> Result<()> {
        self.0.borrow_mut().frames += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.0.borrow_mut().closes += 1;
        Ok(())
    }
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.output.width = 8;
    config.output.height = 4;
    config
}

fn library(clips: &[(&str, usize, &str)], rest: Option<&str>, fill: Rgba<u8>) -> ClipLibrary {
    let manifest = ClipManifest {
        taxonomy: Complexity::Simple,
        clips: clips
            .iter()
            .map(|(viseme, variant, locator)| ClipAsset::new(*viseme, *variant, *locator, 100))
            .collect(),
        rest_position: rest.map(str::to_owned),
        background_image: None,
    };
    let mut loader = move |asset: &ClipAsset| -> Result<Box<dyn ClipSource>> {
        let frame = RgbaImage::from_pixel(8, 4, fill);
        Ok(Box::new(ImageSequence::still(frame, asset.duration())))
    };
    ClipLibrary::preload(VisemeTaxonomy::new(Complexity::Simple), &manifest, &mut loader)
}

fn speaking_library() -> ClipLibrary {
    library(
        &[
            ("Wuh", 0, "idle.png"),
            ("Baa", 0, "baa-0"),
            ("Ohh", 0, "ohh-0"),
            ("Ohh", 1, "ohh-1"),
            ("Mee", 0, "mee-0"),
            ("Mee", 1, "mee-1"),
            ("Mee", 2, "mee-2"),
        ],
        Some("idle.png"),
        Rgba([200, 50, 50, 255]),
    )
}

fn session(config: AppConfig, library: ClipLibrary) -> (AvatarSession, Rc<RefCell<Calls>>) {
    let calls = Rc::new(RefCell::new(Calls::default()));
    let session =
        AvatarSession::new(config, library, Box::new(CountingCapture(calls.clone()))).unwrap();
    (session, calls)
}

#[test]
fn timeline_plays_each_viseme_on_schedule_then_rests() {
    let (mut session, _) = session(config(), speaking_library());
    session
        .play_timeline(
            vec![
                TimelineEvent::new("b", 0.0, 0.15, "Baa"),
                TimelineEvent::new("ow", 0.15, 0.30, "Ohh"),
                TimelineEvent::new("iy", 0.30, 0.45, "Mee"),
            ],
            1.0,
        )
        .unwrap();

    let mut changes: Vec<(u64, String)> = Vec::new();
    let mut shown = session.status().current_viseme;
    for t in (0..=800).step_by(5) {
        session.tick(ms(t)).unwrap();
        let now = session.status().current_viseme;
        if now != shown {
            changes.push((t, now.clone().unwrap_or_default()));
            shown = now;
        }
    }

    let visemes: Vec<&str> = changes.iter().map(|(_, v)| v.as_str()).collect();
    assert_eq!(visemes, ["Baa", "Ohh", "Mee", "Wuh"]);
    for ((at, _), expected) in changes.iter().zip([0, 150, 300, 450]) {
        assert!(at.abs_diff(expected) <= 5, "change at {at} ms, expected {expected} ms");
    }
    assert_eq!(session.scheduler().phase(), SchedulerPhase::Idle);
}

#[test]
fn never_more_than_two_clips_play_at_once() {
    let mut config = config();
    config.crossfade.enabled = true;
    let (mut session, _) = session(config, speaking_library());

    let mut rng = fastrand::Rng::with_seed(42);
    let requests = ["Baa", "Ohh", "Mee", "Zzz", "Foe"];
    for t in (0..3_000).step_by(8) {
        if rng.u8(..4) == 0 {
            session.trigger(requests[rng.usize(..requests.len())]);
        }
        session.tick(ms(t)).unwrap();

        let playing = session.library().playing_count();
        assert!(playing <= 2, "{playing} clips playing at {t} ms");
        if session.scheduler().outgoing().is_none() {
            assert_eq!(playing, 1, "expected a single clip at {t} ms");
        }
    }
}

#[test]
fn round_robin_visits_every_variant() {
    let (mut session, _) = session(config(), speaking_library());
    let mut seen = Vec::new();
    for round in 0..3u64 {
        session.trigger("Mee");
        session.tick(ms(round * 20)).unwrap();
        let active = session.scheduler().active().unwrap();
        seen.push(session.library().asset(active).unwrap().variant_index);
    }
    seen.sort_unstable();
    assert_eq!(seen, [0, 1, 2]);
}

#[test]
fn triggers_between_ticks_keep_the_rotation_in_step() {
    let (mut session, _) = session(config(), speaking_library());
    session.tick(ms(0)).unwrap();
    for _ in 0..3 {
        assert!(session.trigger("Mee"));
    }
    session.tick(ms(10)).unwrap();
    assert!(session.trigger("Mee"));
    session.tick(ms(20)).unwrap();

    let active = session.scheduler().active().unwrap();
    assert_eq!(session.library().asset(active).unwrap().variant_index, 0);
}

#[test]
fn capture_is_acquired_once_and_paced() {
    let (mut session, calls) = session(config(), speaking_library());
    assert!(session.start_capture().is_err());

    session.tick(ms(0)).unwrap();
    let stream = session.start_capture().unwrap();
    assert_eq!(session.start_capture().unwrap(), stream);
    assert_eq!(stream.format.width, 8);

    for frame in 1..=60u64 {
        session.tick(Duration::from_secs_f64(frame as f64 / 60.0)).unwrap();
    }
    session.stop_capture();
    session.stop_capture();

    let calls = calls.borrow();
    assert_eq!(calls.opens, 1);
    assert_eq!(calls.closes, 1);
    assert!((28..=31).contains(&calls.frames), "{} frames", calls.frames);
}

#[test]
fn chroma_key_reveals_background() {
    let mut keyed = library(&[("Baa", 0, "baa-0")], None, KEY_GREEN);
    keyed.set_background(Some(BackgroundImage::new(RgbaImage::from_pixel(1, 1, SKY))));
    let (mut session, _) = session(config(), keyed);
    session.tick(ms(0)).unwrap();
    assert_eq!(*session.surface().unwrap().get_pixel(4, 2), SKY);

    let mut plain = config();
    plain.chroma.enabled = false;
    let mut unkeyed = library(&[("Baa", 0, "baa-0")], None, KEY_GREEN);
    unkeyed.set_background(Some(BackgroundImage::new(RgbaImage::from_pixel(1, 1, SKY))));
    let (mut session, _) = self::session(plain, unkeyed);
    session.tick(ms(0)).unwrap();
    assert_eq!(*session.surface().unwrap().get_pixel(4, 2), KEY_GREEN);
}

#[test]
fn shutdown_releases_capture() {
    let (mut session, calls) = session(config(), speaking_library());
    session.tick(ms(0)).unwrap();
    session.start_capture().unwrap();
    session.shutdown();
    assert!(!session.status().capture_active);
    assert_eq!(calls.borrow().closes, 1);
    drop(session);
    assert_eq!(calls.borrow().closes, 1);
}
