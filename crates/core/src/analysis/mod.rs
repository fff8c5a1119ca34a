use std::{f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};

use crate::{AvatarError, Result};

/// Third of the analysed spectrum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Band {
    Low,
    Mid,
    High,
}

/// Features extracted from one block of microphone samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisFrame {
    /// Short-time energy of the block.
    pub rms: f32,
    /// Mean spectral magnitude of the lowest third of the bins.
    pub low: f32,
    pub mid: f32,
    pub high: f32,
}

impl AnalysisFrame {
    /// The band with the highest mean energy. Ties favour the lower band.
    pub fn dominant_band(&self) -> Band {
        if self.high > self.mid && self.high > self.low {
            Band::High
        } else if self.mid > self.low {
            Band::Mid
        } else {
            Band::Low
        }
    }
}

/// Short-time energy and three-band spectrum analysis of audio blocks.
pub struct AnalysisEngine {
    fft_planner: RealFftPlanner<f32>,
    fft: Option<FftResources>,
}

impl AnalysisEngine {
    pub fn new() -> Self {
        Self {
            fft_planner: RealFftPlanner::new(),
            fft: None,
        }
    }

    /// Analyses one block. FFT plans are rebuilt only when the block size changes.
    pub fn process_block(&mut self, samples: &[f32]) -> Result<AnalysisFrame> {
        if samples.len() < 2 {
            return Err(AvatarError::invalid_input(
                "analysis requires blocks with at least two samples",
            ));
        }

        let rms = compute_rms(samples);
        let (low, mid, high) = self.compute_band_energies(samples)?;
        Ok(AnalysisFrame {
            rms,
            low,
            mid,
            high,
        })
    }

    fn compute_band_energies(&mut self, samples: &[f32]) -> Result<(f32, f32, f32)> {
        let len = samples.len();
        let fft = self.prepare_fft(len);

        for (index, value) in samples.iter().enumerate() {
            fft.input[index] = *value * hann_value(index, len);
        }

        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)
            .map_err(|err| AvatarError::msg(format!("fft failed: {err}")))?;

        // Skip the DC bin.
        let bins = &fft.spectrum[1..];
        let third = (bins.len() / 3).max(1);
        let mean = |range: &[Complex32]| {
            if range.is_empty() {
                0.0
            } else {
                range.iter().map(|bin| bin.norm()).sum::<f32>() / range.len() as f32
            }
        };

        let low_end = third.min(bins.len());
        let mid_end = (2 * third).min(bins.len());
        Ok((
            mean(&bins[..low_end]),
            mean(&bins[low_end..mid_end]),
            mean(&bins[mid_end..]),
        ))
    }

    fn prepare_fft(&mut self, size: usize) -> &mut FftResources {
        let resources = match self.fft.take() {
            Some(fft) if fft.size == size => fft,
            _ => {
                let plan = self.fft_planner.plan_fft_forward(size);
                let scratch = plan.make_scratch_vec();
                let spectrum = plan.make_output_vec();
                let input = plan.make_input_vec();
                FftResources {
                    size,
                    plan,
                    scratch,
                    spectrum,
                    input,
                }
            }
        };

        self.fft.insert(resources)
    }
}

impl Default for AnalysisEngine {
    fn default() -> Self {
        Self::new()
    }
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl fmt::Debug for AnalysisEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisEngine")
            .field("fft_size", &self.fft.as_ref().map(|fft| fft.size))
            .finish()
    }
}

pub(crate) fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|sample| sample * sample).sum();
    (sum / samples.len() as f32).sqrt()
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}
