use std::time::Duration;

use tracing::trace;

use crate::{
    analysis::{AnalysisFrame, Band},
    config::LiveAudioConfig,
    events::{EventOrigin, VisemeEvent},
    VisemeTaxonomy,
};

/// Front/sibilant articulations, dominant in the upper spectrum.
const HIGH_BAND_PHONEMES: &[&str] = &["s", "z", "sh", "zh", "ch", "jh", "f", "v", "iy", "ih"];
/// Consonants with most energy in the middle of the spectrum.
const MID_BAND_PHONEMES: &[&str] = &["t", "d", "n", "k", "g", "th", "dh", "l", "r", "eh", "ey"];
/// Open vowels.
const LOW_BAND_PHONEMES: &[&str] = &["aa", "ah", "ao", "aw", "ow", "uw", "uh"];

/// Viseme ids available to each band, restricted to the active taxonomy.
#[derive(Debug, Clone, Default)]
pub struct BandCandidates {
    low: Vec<String>,
    mid: Vec<String>,
    high: Vec<String>,
}

impl BandCandidates {
    pub fn for_taxonomy(taxonomy: &VisemeTaxonomy) -> Self {
        let resolve = |phonemes: &[&str]| {
            let mut ids: Vec<String> = Vec::new();
            for phoneme in phonemes {
                if let Some(id) = taxonomy.viseme_for_phoneme(phoneme) {
                    if !ids.iter().any(|existing| existing == id) {
                        ids.push(id.to_string());
                    }
                }
            }
            ids
        };

        Self {
            low: resolve(LOW_BAND_PHONEMES),
            mid: resolve(MID_BAND_PHONEMES),
            high: resolve(HIGH_BAND_PHONEMES),
        }
    }

    pub fn candidates(&self, band: Band) -> &[String] {
        match band {
            Band::Low => &self.low,
            Band::Mid => &self.mid,
            Band::High => &self.high,
        }
    }
}

/// Turns a stream of analysis frames into debounced viseme changes and a
/// single rest event per silence.
#[derive(Debug)]
pub struct LiveVisemeDetector {
    candidates: BandCandidates,
    sensitivity: f32,
    debounce: Duration,
    silence: Duration,
    rng: fastrand::Rng,
    last_change: Option<Duration>,
    last_loud: Option<Duration>,
    resting: bool,
}

impl LiveVisemeDetector {
    pub fn new(taxonomy: &VisemeTaxonomy, config: &LiveAudioConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        };
        Self {
            candidates: BandCandidates::for_taxonomy(taxonomy),
            sensitivity: config.sensitivity,
            debounce: config.debounce(),
            silence: config.silence(),
            rng,
            last_change: None,
            last_loud: None,
            resting: true,
        }
    }

    /// Rebuilds the band candidates after the taxonomy changed.
    pub fn set_taxonomy(&mut self, taxonomy: &VisemeTaxonomy) {
        self.candidates = BandCandidates::for_taxonomy(taxonomy);
    }

    pub fn reset(&mut self) {
        self.last_change = None;
        self.last_loud = None;
        self.resting = true;
    }

    pub fn observe(&mut self, frame: &AnalysisFrame, now: Duration) -> Option<VisemeEvent> {
        if frame.rms > self.sensitivity {
            self.last_loud = Some(now);
            return self.on_speech(frame, now);
        }

        let quiet_for = now.saturating_sub(self.last_loud?);
        if !self.resting && quiet_for >= self.silence {
            self.resting = true;
            return Some(VisemeEvent::rest(EventOrigin::LiveAudio, now));
        }
        None
    }

    fn on_speech(&mut self, frame: &AnalysisFrame, now: Duration) -> Option<VisemeEvent> {
        let debounced = self
            .last_change
            .map(|last| now.saturating_sub(last) < self.debounce)
            .unwrap_or(false);
        if debounced {
            return None;
        }

        let band = frame.dominant_band();
        let candidates = self.candidates.candidates(band);
        if candidates.is_empty() {
            trace!(?band, "no viseme candidates for band");
            return None;
        }

        let viseme = candidates[self.rng.usize(..candidates.len())].clone();
        self.last_change = Some(now);
        self.resting = false;
        Some(VisemeEvent::viseme(viseme, EventOrigin::LiveAudio, now))
    }
}
