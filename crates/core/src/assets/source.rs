use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use image::RgbaImage;

use crate::{assets::ClipAsset, AvatarError, Result};

/// Outcome of advancing a clip's playhead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    Paused,
    Playing,
    /// The clip reached its end during this advance and has stopped.
    Ended,
}

/// A loaded, seekable clip that yields RGBA frames.
///
/// Implementations may sit on top of hardware decoders or frame queues. The
/// engine only relies on the operations below and drives time explicitly
/// through [`ClipSource::advance`].
pub trait ClipSource {
    /// The frame at the current playhead.
    fn frame(&self) -> &RgbaImage;

    fn dimensions(&self) -> (u32, u32) {
        self.frame().dimensions()
    }

    fn play(&mut self);

    fn pause(&mut self);

    /// Moves the playhead back to time zero.
    fn rewind(&mut self);

    fn set_looping(&mut self, looping: bool);

    fn is_looping(&self) -> bool;

    fn is_playing(&self) -> bool;

    fn advance(&mut self, delta: Duration) -> PlaybackStatus;
}

/// Acquires a [`ClipSource`] for a declared asset, blocking until the source
/// is ready to play or failed to decode.
pub trait ClipLoader {
    fn load(&mut self, asset: &ClipAsset) -> Result<Box<dyn ClipSource>>;
}

impl<F> ClipLoader for F
where
    F: FnMut(&ClipAsset) -> Result<Box<dyn ClipSource>>,
{
    fn load(&mut self, asset: &ClipAsset) -> Result<Box<dyn ClipSource>> {
        self(asset)
    }
}

/// Clip backed by decoded still frames spread evenly over its duration.
pub struct ImageSequence {
    frames: Vec<RgbaImage>,
    duration: Duration,
    position: Duration,
    playing: bool,
    looping: bool,
}

impl ImageSequence {
    pub fn new(frames: Vec<RgbaImage>, duration: Duration) -> Result<Self> {
        if frames.is_empty() {
            return Err(AvatarError::invalid_input("image sequence needs at least one frame"));
        }
        Ok(Self {
            frames,
            duration: duration.max(Duration::from_millis(1)),
            position: Duration::ZERO,
            playing: false,
            looping: false,
        })
    }

    /// A clip consisting of a single held frame.
    pub fn still(frame: RgbaImage, duration: Duration) -> Self {
        Self {
            frames: vec![frame],
            duration: duration.max(Duration::from_millis(1)),
            position: Duration::ZERO,
            playing: false,
            looping: false,
        }
    }

    pub fn position(&self) -> Duration {
        self.position
    }

    fn frame_index(&self) -> usize {
        let progress = self.position.as_secs_f64() / self.duration.as_secs_f64();
        let index = (progress * self.frames.len() as f64) as usize;
        index.min(self.frames.len() - 1)
    }
}

impl ClipSource for ImageSequence {
    fn frame(&self) -> &RgbaImage {
        &self.frames[self.frame_index()]
    }

    fn play(&mut self) {
        self.playing = true;
    }

    fn pause(&mut self) {
        self.playing = false;
    }

    fn rewind(&mut self) {
        self.position = Duration::ZERO;
    }

    fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    fn is_looping(&self) -> bool {
        self.looping
    }

    fn is_playing(&self) -> bool {
        self.playing
    }

    fn advance(&mut self, delta: Duration) -> PlaybackStatus {
        if !self.playing {
            return PlaybackStatus::Paused;
        }

        let next = self.position + delta;
        if next < self.duration {
            self.position = next;
            return PlaybackStatus::Playing;
        }

        if self.looping {
            let wrapped = next.as_nanos() % self.duration.as_nanos();
            self.position = Duration::from_nanos(wrapped as u64);
            PlaybackStatus::Playing
        } else {
            // Hold the last frame, as a paused video element would.
            self.position = self.duration - Duration::from_nanos(1);
            self.playing = false;
            PlaybackStatus::Ended
        }
    }
}

impl fmt::Debug for ImageSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageSequence")
            .field("frames", &self.frames.len())
            .field("duration", &self.duration)
            .field("position", &self.position)
            .field("playing", &self.playing)
            .field("looping", &self.looping)
            .finish()
    }
}

const FRAME_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// Loads clips from the filesystem. A locator naming a directory is read as a
/// frame sequence sorted by file name; a locator naming a file is a still.
#[derive(Debug, Default, Clone)]
pub struct ImageSequenceLoader {
    root: Option<PathBuf>,
}

impl ImageSequenceLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves relative locators against `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, locator: &str) -> PathBuf {
        match &self.root {
            Some(root) => root.join(locator),
            None => PathBuf::from(locator),
        }
    }

    fn read_frames(path: &Path) -> Result<Vec<RgbaImage>> {
        if path.is_file() {
            return Ok(vec![image::open(path)?.to_rgba8()]);
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(path)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| FRAME_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();

        files
            .iter()
            .map(|file| Ok(image::open(file)?.to_rgba8()))
            .collect()
    }
}

impl ClipLoader for ImageSequenceLoader {
    fn load(&mut self, asset: &ClipAsset) -> Result<Box<dyn ClipSource>> {
        let path = self.resolve(&asset.source_locator);
        let frames = Self::read_frames(&path)
            .map_err(|err| AvatarError::asset_load(&asset.source_locator, err))?;
        let sequence = ImageSequence::new(frames, asset.duration())
            .map_err(|err| AvatarError::asset_load(&asset.source_locator, err))?;
        Ok(Box::new(sequence))
    }
}
