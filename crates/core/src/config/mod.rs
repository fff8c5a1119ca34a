use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{AvatarError, Result};

/// Top-level configuration structure for the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub output: OutputConfig,
    pub chroma: ChromaKeyConfig,
    pub crossfade: CrossfadeConfig,
    pub live: LiveAudioConfig,
    pub timeline: TimelineConfig,
}

impl AppConfig {
    /// Reads a JSON configuration file. Missing sections fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.output.width == 0 || self.output.height == 0 {
            return Err(AvatarError::config("output dimensions must be non-zero"));
        }
        if self.output.fps == 0 {
            return Err(AvatarError::config("output fps must be non-zero"));
        }
        if self.chroma.dominance < 1.0 {
            return Err(AvatarError::config("chroma dominance factor must be >= 1"));
        }
        if !(self.timeline.speed > 0.0) {
            return Err(AvatarError::config("timeline speed must be positive"));
        }
        if self.live.fft_size < 2 {
            return Err(AvatarError::config("fft size must be at least 2"));
        }
        Ok(())
    }
}

/// Output surface and capture stream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 30,
        }
    }
}

impl OutputConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.fps.max(1)))
    }
}

/// Parses a `WIDTHxHEIGHT` resolution string such as `1920x1080`.
pub fn parse_resolution(value: &str) -> Result<(u32, u32)> {
    let (w, h) = value
        .trim()
        .split_once(['x', 'X'])
        .ok_or_else(|| AvatarError::config(format!("malformed resolution `{value}`")))?;
    let parse = |part: &str| {
        part.trim()
            .parse::<u32>()
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| AvatarError::config(format!("malformed resolution `{value}`")))
    };
    Ok((parse(w)?, parse(h)?))
}

/// Green-screen removal settings. The classifier treats a pixel as key colour
/// when `g > green_floor` and `g` exceeds both `r` and `b` by `dominance`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChromaKeyConfig {
    pub enabled: bool,
    pub green_floor: u8,
    pub dominance: f32,
    /// Draw the background image behind keyed clips when one is set.
    pub composite_background: bool,
}

impl Default for ChromaKeyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            green_floor: 100,
            dominance: 1.5,
            composite_background: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossfadeConfig {
    pub enabled: bool,
    pub duration_ms: u64,
}

impl Default for CrossfadeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            duration_ms: 120,
        }
    }
}

impl CrossfadeConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Configuration for the live microphone analyser.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveAudioConfig {
    /// RMS level above which the input counts as speech.
    pub sensitivity: f32,
    pub debounce_ms: u64,
    pub silence_ms: u64,
    pub fft_size: usize,
    /// Fixed seed for the viseme picker. Random when absent.
    pub seed: Option<u64>,
}

impl Default for LiveAudioConfig {
    fn default() -> Self {
        Self {
            sensitivity: 0.02,
            debounce_ms: 100,
            silence_ms: 500,
            fft_size: 1024,
            seed: None,
        }
    }
}

impl LiveAudioConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn silence(&self) -> Duration {
        Duration::from_millis(self.silence_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelineConfig {
    pub speed: f32,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self { speed: 1.0 }
    }
}
