//! Output sink: publishes the composited surface as a paced frame stream.
//!
//! The sink owns exactly one [`CaptureBackend`]. Starting an active sink hands
//! back the stream it already has, and stopping an inactive one does nothing,
//! so the underlying device is acquired and released exactly once per run.

use std::{
    fmt,
    io::Write as _,
    process::{Child, ChildStdin, Command, Stdio},
    time::Duration,
};

use image::RgbaImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{config::OutputConfig, error::Device, AvatarError, Result};

/// Geometry and rate of a frame stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFormat {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl StreamFormat {
    /// Time between frames; a zero rate is treated as 1 fps.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.fps.max(1)))
    }
}

/// Handle describing an active capture stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameStream {
    pub id: u64,
    pub format: StreamFormat,
}

/// Exclusive capture device fed with raw RGBA8 frames.
pub trait CaptureBackend {
    /// Acquires the device for frames of `format`.
    fn open(&mut self, format: &StreamFormat) -> Result<()>;

    /// Writes one tightly packed RGBA8 frame.
    fn write_frame(&mut self, rgba: &[u8]) -> Result<()>;

    /// Releases the device. Called exactly once per successful `open`.
    fn close(&mut self) -> Result<()>;
}

/// Whether an `ffmpeg` binary answers `-version` on `PATH`.
pub fn is_ffmpeg_on_path() -> bool {
    Command::new("ffmpeg")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Pipes raw RGBA frames into a system `ffmpeg` process.
///
/// The input side is fixed (`rawvideo`, `rgba`, stdin); `output_args` decide
/// where the stream goes, for example `-f v4l2 /dev/video10` for a loopback
/// camera or `-c:v libx264 out.mp4` for a file.
#[derive(Debug)]
pub struct FfmpegCapture {
    output_args: Vec<String>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
}

impl FfmpegCapture {
    pub fn new<I, S>(output_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            output_args: output_args.into_iter().map(Into::into).collect(),
            child: None,
            stdin: None,
        }
    }
}

/// Takes the piped stdin of a freshly spawned process. Without one the child
/// is killed and reaped before the error is returned.
fn take_stdin(child: &mut Child) -> Result<ChildStdin> {
    match child.stdin.take() {
        Some(stdin) => Ok(stdin),
        None => {
            let _ = child.kill();
            let _ = child.wait();
            Err(AvatarError::device(Device::Capture, "failed to open ffmpeg stdin"))
        }
    }
}

impl CaptureBackend for FfmpegCapture {
    fn open(&mut self, format: &StreamFormat) -> Result<()> {
        if self.output_args.is_empty() {
            return Err(AvatarError::device(Device::Capture, "no ffmpeg output arguments given"));
        }
        if !is_ffmpeg_on_path() {
            return Err(AvatarError::device(
                Device::Capture,
                "ffmpeg is required for capture, but was not found on PATH",
            ));
        }

        let mut cmd = Command::new("ffmpeg");
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .args([
                "-loglevel",
                "error",
                "-y",
                "-f",
                "rawvideo",
                "-pix_fmt",
                "rgba",
                "-s",
                &format!("{}x{}", format.width, format.height),
                "-r",
                &format.fps.to_string(),
                "-i",
                "pipe:0",
                "-an",
            ])
            .args(&self.output_args);

        let mut child = cmd
            .spawn()
            .map_err(|e| AvatarError::device(Device::Capture, format!("failed to spawn ffmpeg: {e}")))?;
        let stdin = take_stdin(&mut child)?;

        debug!(args = ?self.output_args, "ffmpeg capture spawned");
        self.child = Some(child);
        self.stdin = Some(stdin);
        Ok(())
    }

    fn write_frame(&mut self, rgba: &[u8]) -> Result<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(AvatarError::device(Device::Capture, "ffmpeg capture is not open"));
        };
        stdin
            .write_all(rgba)
            .map_err(|e| AvatarError::device(Device::Capture, format!("failed to write frame to ffmpeg: {e}")))
    }

    fn close(&mut self) -> Result<()> {
        drop(self.stdin.take());
        let Some(child) = self.child.take() else {
            return Ok(());
        };
        let output = child
            .wait_with_output()
            .map_err(|e| AvatarError::device(Device::Capture, format!("failed to wait for ffmpeg: {e}")))?;
        if !output.status.success() {
            return Err(AvatarError::device(
                Device::Capture,
                format!("ffmpeg exited with status {}", output.status),
            ));
        }
        Ok(())
    }
}

/// Publishes composited frames to a capture backend at a fixed rate.
pub struct OutputSink {
    backend: Box<dyn CaptureBackend>,
    fps: u32,
    stream: Option<FrameStream>,
    next_stream: u64,
    next_frame_at: Option<Duration>,
    frames_written: u64,
}

impl OutputSink {
    /// Creates an inactive sink; the backend is opened on [`OutputSink::start`].
    pub fn new(backend: Box<dyn CaptureBackend>, output: &OutputConfig) -> Self {
        Self {
            backend,
            fps: output.fps,
            stream: None,
            next_stream: 0,
            next_frame_at: None,
            frames_written: 0,
        }
    }

    /// Whether a stream is currently bound.
    pub fn is_active(&self) -> bool {
        self.stream.is_some()
    }

    pub fn stream(&self) -> Option<&FrameStream> {
        self.stream.as_ref()
    }

    /// Frames handed to the backend since the current stream started.
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Binds `surface` as the stream source. Returns the existing stream when
    /// already active; the backend is not opened twice.
    pub fn start(&mut self, surface: Option<&RgbaImage>) -> Result<FrameStream> {
        if let Some(stream) = &self.stream {
            debug!(stream = stream.id, "capture already active");
            return Ok(stream.clone());
        }
        let surface = surface.ok_or(AvatarError::RenderSurfaceUnavailable)?;

        let (width, height) = surface.dimensions();
        let format = StreamFormat {
            width,
            height,
            fps: self.fps,
        };
        self.backend.open(&format).map_err(|err| match err {
            err @ AvatarError::DeviceAccess { .. } => err,
            other => AvatarError::device(Device::Capture, other),
        })?;

        let stream = FrameStream {
            id: self.next_stream,
            format,
        };
        self.next_stream += 1;
        self.next_frame_at = None;
        self.frames_written = 0;
        info!(stream = stream.id, width, height, fps = self.fps, "capture started");
        self.stream = Some(stream.clone());
        Ok(stream)
    }

    /// Releases the backend. A no-op while inactive.
    pub fn stop(&mut self) {
        let Some(stream) = self.stream.take() else {
            return;
        };
        if let Err(err) = self.backend.close() {
            warn!(stream = stream.id, error = %err, "capture did not close cleanly");
        }
        self.next_frame_at = None;
        info!(stream = stream.id, frames = self.frames_written, "capture stopped");
    }

    /// Writes `surface` if a frame is due at `now`. Returns whether a frame
    /// was written. A backend failure stops the sink.
    pub fn push_frame(&mut self, now: Duration, surface: &RgbaImage) -> Result<bool> {
        let Some(stream) = &self.stream else {
            return Ok(false);
        };
        let format = stream.format;
        if let Some(due) = self.next_frame_at {
            if now < due {
                return Ok(false);
            }
        }
        if surface.dimensions() != (format.width, format.height) {
            return Err(AvatarError::invalid_input(format!(
                "surface is {}x{}, stream expects {}x{}",
                surface.width(),
                surface.height(),
                format.width,
                format.height
            )));
        }

        if let Err(err) = self.backend.write_frame(surface.as_raw()) {
            warn!(error = %err, "capture write failed");
            self.stop();
            return Err(match err {
                err @ AvatarError::DeviceAccess { .. } => err,
                other => AvatarError::device(Device::Capture, other),
            });
        }
        self.frames_written += 1;

        // Keep a steady cadence; after a stall, resume from now instead of bursting.
        let interval = format.frame_interval();
        let next = self.next_frame_at.unwrap_or(now) + interval;
        self.next_frame_at = Some(if next <= now { now + interval } else { next });
        Ok(true)
    }
}

impl Drop for OutputSink {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputSink")
            .field("fps", &self.fps)
            .field("stream", &self.stream)
            .field("frames_written", &self.frames_written)
            .finish()
    }
}
