use std::{
    collections::VecDeque,
    fmt,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use tracing::{info, warn};

use crate::{
    analysis::AnalysisEngine,
    config::LiveAudioConfig,
    error::Device,
    events::{VisemeEvent, VisemeEventSource},
    mapping::LiveVisemeDetector,
    AvatarError, Result, VisemeTaxonomy,
};

/// Exclusive microphone-like sample producer.
pub trait AudioInput {
    /// Acquires the device and returns its sample rate.
    fn open(&mut self) -> Result<u32>;

    /// Appends every mono sample captured since the previous call.
    fn read(&mut self, out: &mut Vec<f32>) -> Result<()>;

    /// Releases the device. Must be safe to call more than once.
    fn close(&mut self);
}

/// Owns at most one open [`AudioInput`] and keeps a rolling window of its
/// most recent samples.
pub struct AudioEngine {
    input: Option<Box<dyn AudioInput>>,
    sample_rate: u32,
    window: VecDeque<f32>,
    window_len: usize,
    incoming: Vec<f32>,
}

impl AudioEngine {
    pub fn new(window_len: usize) -> Self {
        Self {
            input: None,
            sample_rate: 0,
            window: VecDeque::with_capacity(window_len),
            window_len: window_len.max(2),
            incoming: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.input.is_some()
    }

    /// Sample rate of the open input, zero when inactive.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn start(&mut self, mut input: Box<dyn AudioInput>) -> Result<()> {
        if self.is_active() {
            return Err(AvatarError::device(Device::Microphone, "input already in use"));
        }

        let sample_rate = input.open().map_err(|err| match err {
            err @ AvatarError::DeviceAccess { .. } => err,
            other => AvatarError::device(Device::Microphone, other),
        })?;
        info!(sample_rate, "microphone acquired");
        self.sample_rate = sample_rate;
        self.window.clear();
        self.input = Some(input);
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(mut input) = self.input.take() {
            input.close();
            info!("microphone released");
        }
        self.sample_rate = 0;
        self.window.clear();
    }

    /// Drains the input and returns the latest full window, if one is available.
    pub fn latest_window(&mut self) -> Result<Option<&[f32]>> {
        let Some(input) = self.input.as_mut() else {
            return Ok(None);
        };

        self.incoming.clear();
        input.read(&mut self.incoming)?;
        self.window.extend(self.incoming.iter().copied());
        let overflow = self.window.len().saturating_sub(self.window_len);
        self.window.drain(..overflow);

        if self.window.len() < self.window_len {
            return Ok(None);
        }
        Ok(Some(self.window.make_contiguous()))
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for AudioEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioEngine")
            .field("active", &self.is_active())
            .field("sample_rate", &self.sample_rate)
            .field("window", &self.window.len())
            .finish()
    }
}

/// Plays a WAV file back in real time as if it were a microphone.
pub struct WavFileInput {
    path: PathBuf,
    samples: Vec<f32>,
    sample_rate: u32,
    cursor: usize,
    opened_at: Option<Instant>,
}

impl WavFileInput {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            samples: Vec::new(),
            sample_rate: 0,
            cursor: 0,
            opened_at: None,
        }
    }

    /// Playback length of the WAV file at `path`, read from its header.
    pub fn probe(path: impl AsRef<Path>) -> Result<Duration> {
        let reader = hound::WavReader::open(path.as_ref())
            .map_err(|err| AvatarError::device(Device::Microphone, err))?;
        let rate = reader.spec().sample_rate.max(1);
        Ok(Duration::from_secs_f64(f64::from(reader.duration()) / f64::from(rate)))
    }

    fn decode(&mut self) -> Result<()> {
        let mut reader = hound::WavReader::open(&self.path)
            .map_err(|err| AvatarError::device(Device::Microphone, err))?;
        let spec = reader.spec();
        let channels = usize::from(spec.channels.max(1));

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<std::result::Result<_, _>>()
                .map_err(|err| AvatarError::device(Device::Microphone, err))?,
            hound::SampleFormat::Int => {
                let scale = 2f32.powi(i32::from(spec.bits_per_sample) - 1);
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<std::result::Result<_, _>>()
                    .map_err(|err| AvatarError::device(Device::Microphone, err))?
            }
        };

        self.samples = interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect();
        self.sample_rate = spec.sample_rate;
        Ok(())
    }

    fn samples_due(&self, elapsed: Duration) -> usize {
        let due = (elapsed.as_secs_f64() * f64::from(self.sample_rate)) as usize;
        due.min(self.samples.len())
    }
}

impl AudioInput for WavFileInput {
    fn open(&mut self) -> Result<u32> {
        self.decode()?;
        self.cursor = 0;
        self.opened_at = Some(Instant::now());
        Ok(self.sample_rate)
    }

    fn read(&mut self, out: &mut Vec<f32>) -> Result<()> {
        let Some(opened_at) = self.opened_at else {
            return Err(AvatarError::device(Device::Microphone, "input is not open"));
        };
        let due = self.samples_due(opened_at.elapsed());
        if due > self.cursor {
            out.extend_from_slice(&self.samples[self.cursor..due]);
            self.cursor = due;
        }
        Ok(())
    }

    fn close(&mut self) {
        self.opened_at = None;
        self.samples = Vec::new();
    }
}

/// Live microphone event source: rolling window, spectrum analysis and
/// band-to-viseme detection, sampled once per render frame.
#[derive(Debug)]
pub struct LiveAudioSource {
    engine: AudioEngine,
    analysis: AnalysisEngine,
    detector: LiveVisemeDetector,
    last_error: Option<AvatarError>,
}

impl LiveAudioSource {
    pub fn new(taxonomy: &VisemeTaxonomy, config: &LiveAudioConfig) -> Self {
        Self {
            engine: AudioEngine::new(config.fft_size),
            analysis: AnalysisEngine::new(),
            detector: LiveVisemeDetector::new(taxonomy, config),
            last_error: None,
        }
    }

    pub fn start(&mut self, input: Box<dyn AudioInput>) -> Result<()> {
        self.engine.start(input)?;
        self.detector.reset();
        self.last_error = None;
        Ok(())
    }

    /// Rebuilds the band candidates for a reloaded library.
    pub fn set_taxonomy(&mut self, taxonomy: &VisemeTaxonomy) {
        self.detector.set_taxonomy(taxonomy);
    }

    /// The device error that disabled the source, if any.
    pub fn take_error(&mut self) -> Option<AvatarError> {
        self.last_error.take()
    }

    fn sample(&mut self, now: Duration) -> Result<Option<VisemeEvent>> {
        let Some(window) = self.engine.latest_window()? else {
            return Ok(None);
        };
        let frame = self.analysis.process_block(window)?;
        Ok(self.detector.observe(&frame, now))
    }
}

impl VisemeEventSource for LiveAudioSource {
    fn poll(&mut self, now: Duration) -> Vec<VisemeEvent> {
        if !self.engine.is_active() {
            return Vec::new();
        }
        match self.sample(now) {
            Ok(event) => event.into_iter().collect(),
            Err(err) => {
                warn!(error = %err, "live audio disabled");
                self.engine.stop();
                self.last_error = Some(match err {
                    err @ AvatarError::DeviceAccess { .. } => err,
                    other => AvatarError::device(Device::Microphone, other),
                });
                Vec::new()
            }
        }
    }

    fn stop(&mut self) {
        self.engine.stop();
        self.detector.reset();
    }

    fn is_active(&self) -> bool {
        self.engine.is_active()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;
    use crate::{analysis::tests::sine, Complexity};

    /// Scripted input that records how often it was opened and closed.
    pub(crate) struct ScriptedInput {
        pub(crate) blocks: VecDeque<Vec<f32>>,
        pub(crate) opens: Rc<RefCell<(usize, usize)>>,
        pub(crate) deny: bool,
    }

    impl ScriptedInput {
        pub(crate) fn new(blocks: Vec<Vec<f32>>) -> (Self, Rc<RefCell<(usize, usize)>>) {
            let opens = Rc::new(RefCell::new((0, 0)));
            (
                Self {
                    blocks: blocks.into(),
                    opens: opens.clone(),
                    deny: false,
                },
                opens,
            )
        }
    }

    impl AudioInput for ScriptedInput {
        fn open(&mut self) -> Result<u32> {
            if self.deny {
                return Err(AvatarError::device(Device::Microphone, "permission denied"));
            }
            self.opens.borrow_mut().0 += 1;
            Ok(48_000)
        }

        fn read(&mut self, out: &mut Vec<f32>) -> Result<()> {
            if let Some(block) = self.blocks.pop_front() {
                out.extend(block);
            }
            Ok(())
        }

        fn close(&mut self) {
            self.opens.borrow_mut().1 += 1;
        }
    }

    fn config() -> LiveAudioConfig {
        LiveAudioConfig {
            fft_size: 256,
            seed: Some(1),
            ..LiveAudioConfig::default()
        }
    }

    #[test]
    fn window_keeps_latest_samples() {
        let (input, _) = ScriptedInput::new(vec![vec![1.0; 3], vec![2.0; 3]]);
        let mut engine = AudioEngine::new(4);
        engine.start(Box::new(input)).unwrap();
        assert!(engine.latest_window().unwrap().is_none());
        assert_eq!(engine.latest_window().unwrap().unwrap(), &[1.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn device_is_released_on_stop_and_drop() {
        let (input, opens) = ScriptedInput::new(Vec::new());
        let mut engine = AudioEngine::new(16);
        engine.start(Box::new(input)).unwrap();
        engine.stop();
        engine.stop();
        assert_eq!(*opens.borrow(), (1, 1));

        let (input, opens) = ScriptedInput::new(Vec::new());
        {
            let mut engine = AudioEngine::new(16);
            engine.start(Box::new(input)).unwrap();
        }
        assert_eq!(*opens.borrow(), (1, 1));
    }

    #[test]
    fn denied_device_is_user_visible() {
        let (mut input, _) = ScriptedInput::new(Vec::new());
        input.deny = true;
        let mut engine = AudioEngine::new(16);
        let err = engine.start(Box::new(input)).unwrap_err();
        assert!(err.is_user_visible());
        assert!(!engine.is_active());
    }

    #[test]
    fn second_start_is_rejected_without_reacquiring() {
        let (first, opens) = ScriptedInput::new(Vec::new());
        let (second, _) = ScriptedInput::new(Vec::new());
        let mut engine = AudioEngine::new(16);
        engine.start(Box::new(first)).unwrap();
        assert!(engine.start(Box::new(second)).is_err());
        assert_eq!(opens.borrow().0, 1);
    }

    #[test]
    fn live_source_emits_for_loud_low_band_audio() {
        let taxonomy = VisemeTaxonomy::new(Complexity::Simple);
        let mut source = LiveAudioSource::new(&taxonomy, &config());
        let (input, _) = ScriptedInput::new(vec![sine(500.0, 48_000.0, 256, 0.8)]);
        source.start(Box::new(input)).unwrap();

        let events = source.poll(Duration::from_millis(16));
        assert_eq!(events.len(), 1);
        let id = events[0].request.to_string();
        assert!(id == "Ohh" || id == "Loo", "unexpected viseme {id}");
    }

    #[test]
    fn wav_input_streams_in_real_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("speech.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 8_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for _ in 0..8_000 {
            writer.write_sample(i16::MAX / 2).unwrap();
            writer.write_sample(i16::MAX / 2).unwrap();
        }
        writer.finalize().unwrap();
        assert_eq!(WavFileInput::probe(&path).unwrap(), Duration::from_secs(1));

        let mut input = WavFileInput::new(&path);
        assert_eq!(input.open().unwrap(), 8_000);
        assert_eq!(input.samples_due(Duration::from_millis(250)), 2_000);
        assert_eq!(input.samples_due(Duration::from_secs(5)), 8_000);

        let mut out = Vec::new();
        std::thread::sleep(Duration::from_millis(20));
        input.read(&mut out).unwrap();
        assert!(!out.is_empty());
        assert!((out[0] - 0.5).abs() < 0.01);
        input.close();
        assert!(input.read(&mut out).is_err());
    }

    #[test]
    fn missing_wav_is_a_device_error() {
        let mut input = WavFileInput::new("/definitely/not/here.wav");
        let err = input.open().unwrap_err();
        assert!(matches!(err, AvatarError::DeviceAccess { .. }));
    }
}
