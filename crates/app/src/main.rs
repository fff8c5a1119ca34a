use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use viseme_avatar_core::{
    load_timeline, parse_resolution, AppConfig, AvatarSession, BackgroundImage, ClipLibrary,
    ClipManifest, FfmpegCapture, ImageSequenceLoader, VisemeTaxonomy, WavFileInput,
};

/// Extra frames rendered after the last event so the rest clip is on screen.
const SETTLE: Duration = Duration::from_millis(250);

fn main() -> viseme_avatar_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Timeline {
            common,
            timeline,
            speed,
            snapshot,
        } => run_timeline(&common, &timeline, speed, snapshot.as_deref()),
        Commands::Live { common, wav } => run_live(&common, &wav),
    }
}

fn run_timeline(
    common: &SessionArgs,
    timeline: &Path,
    speed: Option<f32>,
    snapshot: Option<&Path>,
) -> viseme_avatar_core::Result<()> {
    let mut session = build_session(common)?;
    let events = load_timeline(timeline)?;
    let speed = speed.unwrap_or(session.config().timeline.speed);
    info!(?timeline, entries = events.len(), speed, "playing timeline");

    session.play_timeline(events, speed)?;
    let mut finished_at = None;
    drive(&mut session, common, |session, now| {
        if session.is_timeline_running() {
            return true;
        }
        let done = *finished_at.get_or_insert(now);
        now < done + SETTLE
    })?;

    if let Some(path) = snapshot {
        match session.surface() {
            Some(surface) => {
                surface.save(path)?;
                info!(?path, "snapshot written");
            }
            None => warn!("no frame rendered, snapshot skipped"),
        }
    }
    session.shutdown();
    Ok(())
}

fn run_live(common: &SessionArgs, wav: &Path) -> viseme_avatar_core::Result<()> {
    let mut session = build_session(common)?;
    let length = WavFileInput::probe(wav)?;
    let until = length + session.config().live.silence() + SETTLE;
    info!(?wav, seconds = length.as_secs_f32(), "listening to recording");

    session.start_microphone(Box::new(WavFileInput::new(wav)))?;
    let mut last_report = Duration::ZERO;
    drive(&mut session, common, |session, now| {
        if now >= last_report + Duration::from_secs(1) {
            let status = session.status();
            info!(
                viseme = status.current_viseme.as_deref().unwrap_or("-"),
                latency_ms = status.latency_ms,
                latency = ?status.latency,
                microphone = status.microphone_active,
                capture = status.capture_active,
                "status"
            );
            last_report = now;
        }
        now < until && session.status().microphone_active
    })?;

    session.shutdown();
    Ok(())
}

fn build_session(common: &SessionArgs) -> viseme_avatar_core::Result<AvatarSession> {
    let mut config = match &common.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    if let Some(resolution) = &common.resolution {
        let (width, height) = parse_resolution(resolution)?;
        config.output.width = width;
        config.output.height = height;
    }

    let library = load_library(&common.manifest)?;
    let capture_args: Vec<String> = common
        .capture
        .as_deref()
        .map(|args| args.split_whitespace().map(str::to_owned).collect())
        .unwrap_or_default();
    AvatarSession::new(config, library, Box::new(FfmpegCapture::new(capture_args)))
}

fn load_library(path: &Path) -> viseme_avatar_core::Result<ClipLibrary> {
    let manifest = ClipManifest::load(path)?;
    let root = path.parent().unwrap_or_else(|| Path::new("."));
    let mut loader = ImageSequenceLoader::with_root(root);
    let mut library =
        ClipLibrary::preload(VisemeTaxonomy::new(manifest.taxonomy), &manifest, &mut loader);

    if let Some(background) = &manifest.background_image {
        match BackgroundImage::open(root.join(background)) {
            Ok(image) => library.set_background(Some(image)),
            Err(err) => warn!(%background, error = %err, "background image unavailable"),
        }
    }
    Ok(library)
}

/// Ticks `session` at the output frame rate until `keep_going` says stop.
/// Device failures are reported and the loop carries on without the device.
fn drive<F>(
    session: &mut AvatarSession,
    common: &SessionArgs,
    mut keep_going: F,
) -> viseme_avatar_core::Result<()>
where
    F: FnMut(&AvatarSession, Duration) -> bool,
{
    let interval = session.config().output.frame_interval();
    let started = Instant::now();
    let mut capture_pending = common.capture.is_some();

    loop {
        let now = started.elapsed();
        if let Err(err) = session.tick(now) {
            if !err.is_user_visible() {
                return Err(err);
            }
            error!(error = %err, "device failure");
        }

        if capture_pending {
            capture_pending = false;
            match session.start_capture() {
                Ok(stream) => info!(
                    width = stream.format.width,
                    height = stream.format.height,
                    fps = stream.format.fps,
                    "publishing frames"
                ),
                Err(err) => error!(error = %err, "capture unavailable"),
            }
        }

        if !keep_going(session, now) {
            return Ok(());
        }
        std::thread::sleep(interval.saturating_sub(started.elapsed().saturating_sub(now)));
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Viseme-driven talking avatar", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug)]
struct SessionArgs {
    /// Clip manifest (JSON). Relative clip locators resolve against its directory.
    #[arg(short, long)]
    manifest: PathBuf,
    /// Optional engine configuration file (JSON).
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Output resolution override, e.g. `1280x720`.
    #[arg(long)]
    resolution: Option<String>,
    /// Publish frames through ffmpeg with these output arguments,
    /// e.g. "-f v4l2 /dev/video10".
    #[arg(long, allow_hyphen_values = true)]
    capture: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Play a phoneme timeline through the avatar.
    Timeline {
        #[command(flatten)]
        common: SessionArgs,
        /// Timeline JSON produced by the alignment service.
        #[arg(short, long)]
        timeline: PathBuf,
        /// Playback speed multiplier; defaults to the configured speed.
        #[arg(long)]
        speed: Option<f32>,
        /// Write the final composited frame to this PNG file.
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
    /// Drive the avatar from a recording played back as a live microphone.
    Live {
        #[command(flatten)]
        common: SessionArgs,
        /// WAV file standing in for the microphone.
        #[arg(short, long)]
        wav: PathBuf,
    },
}
