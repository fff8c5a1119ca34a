//! Core library for the viseme avatar engine.
//!
//! A session turns viseme-change events (a phoneme timeline, live microphone
//! analysis or manual triggers) into a composited video stream of recorded
//! mouth clips. Each module owns one subsystem: the clip library and its
//! sources, the event sources, the clip scheduler state machine, the
//! chroma-keying compositor and the capture sink. Everything runs on the
//! caller's thread; time is passed in explicitly on every tick.

pub mod analysis;
pub mod assets;
pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod mapping;
pub mod record;
pub mod render;
pub mod scheduler;
pub mod session;
pub mod taxonomy;
pub mod timeline;

pub use analysis::{AnalysisEngine, AnalysisFrame, Band};
pub use assets::{
    AssetState, BackgroundImage, ClipAsset, ClipLibrary, ClipLoader, ClipManifest, ClipSource,
    HandleId, ImageSequence, ImageSequenceLoader, PlaybackStatus,
};
pub use audio::{AudioEngine, AudioInput, LiveAudioSource, WavFileInput};
pub use config::{
    parse_resolution, AppConfig, ChromaKeyConfig, CrossfadeConfig, LiveAudioConfig, OutputConfig,
    TimelineConfig,
};
pub use error::{AvatarError, Device, Result};
pub use events::{EventOrigin, ManualTrigger, VisemeEvent, VisemeEventSource, VisemeRequest};
pub use mapping::{BandCandidates, LiveVisemeDetector};
pub use record::{CaptureBackend, FfmpegCapture, FrameStream, OutputSink, StreamFormat};
pub use render::{aspect_fit, is_key_color, Compositor, FitRect, ScratchBuffer};
pub use scheduler::{ClipScheduler, RenderLayer, SchedulerPhase};
pub use session::{AvatarSession, LatencyStatus, StatusSignals};
pub use taxonomy::{Complexity, VisemeDefinition, VisemeTaxonomy};
pub use timeline::{load_timeline, PlaybackClock, RunId, TimelineEvent, TimelinePlayer};
