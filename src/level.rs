use crate::config::full_scale;
use crate::error::{Error, Result};

/// One capture or render frame of signed integer samples at a fixed bit depth.
///
/// Samples are stored as `i32` regardless of depth; every value lies within
/// `[-full_scale, full_scale]` for `bits_per_sample`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleBuffer {
    samples: Vec<i32>,
    bits_per_sample: u8,
}

impl SampleBuffer {
    /// Build a buffer, clamping every sample into the representable range.
    pub fn new(samples: Vec<i32>, bits_per_sample: u8) -> Self {
        let max = full_scale(bits_per_sample);
        let samples = samples.into_iter().map(|s| s.clamp(-max, max)).collect();
        Self { samples, bits_per_sample }
    }

    pub fn silence(len: usize, bits_per_sample: u8) -> Self {
        Self { samples: vec![0; len], bits_per_sample }
    }

    /// Convert normalized `[-1.0, 1.0]` samples to integers at the given depth.
    pub fn from_normalized(samples: &[f32], bits_per_sample: u8) -> Self {
        let max = full_scale(bits_per_sample) as f64;
        let samples = samples
            .iter()
            .map(|&s| {
                let v = (s as f64).clamp(-1.0, 1.0) * max;
                v.round() as i32
            })
            .collect();
        Self { samples, bits_per_sample }
    }

    pub fn samples(&self) -> &[i32] {
        &self.samples
    }

    pub fn bits_per_sample(&self) -> u8 {
        self.bits_per_sample
    }

    pub fn full_scale(&self) -> i32 {
        full_scale(self.bits_per_sample)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples scaled to `[-1.0, 1.0]`, for devices that take float audio.
    pub fn to_normalized(&self) -> Vec<f32> {
        let max = self.full_scale() as f32;
        self.samples.iter().map(|&s| s as f32 / max).collect()
    }

    pub fn into_samples(self) -> Vec<i32> {
        self.samples
    }
}

/// Non-negative RMS of one capture frame, in raw sample units.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct LevelMeasurement(pub f32);

impl LevelMeasurement {
    pub fn value(self) -> f32 {
        self.0
    }

    /// Level relative to full scale, floored at -120 dBFS.
    pub fn to_dbfs(self, bits_per_sample: u8) -> f32 {
        let ratio = self.0 / full_scale(bits_per_sample) as f32;
        lin_to_db(ratio).max(-120.0)
    }

    /// Approximate SPL using a microphone calibration offset.
    pub fn to_spl(self, bits_per_sample: u8, calibration_offset_db: f32) -> f32 {
        // 0 dBFS on a typical MEMS mic sits around 120 dB SPL
        self.to_dbfs(bits_per_sample) + 120.0 + calibration_offset_db
    }

    /// SPL at the listener for a rendered level, given the SPL a full-scale
    /// signal produces there.
    pub fn to_output_spl(self, bits_per_sample: u8, full_scale_spl_db: f32) -> f32 {
        self.to_dbfs(bits_per_sample) + full_scale_spl_db
    }
}

/// Root-mean-square estimator. Stateless and free of side effects, so the
/// offline tools can call it without any hardware.
#[derive(Debug, Default, Clone, Copy)]
pub struct LevelEstimator;

impl LevelEstimator {
    pub fn estimate(buffer: &SampleBuffer) -> Result<LevelMeasurement> {
        rms(buffer.samples()).map(LevelMeasurement)
    }
}

/// `sqrt(mean(x^2))`, accumulated in f64 so full-scale 32-bit frames don't overflow.
pub fn rms(samples: &[i32]) -> Result<f32> {
    if samples.is_empty() {
        return Err(Error::InvalidInput("cannot estimate level of an empty buffer".into()));
    }
    let mut sum_sq: f64 = 0.0;
    for &s in samples {
        let v = s as f64;
        sum_sq += v * v;
    }
    let mean_sq = sum_sq / samples.len() as f64;
    Ok(mean_sq.sqrt() as f32)
}

pub fn db_to_lin(db: f32) -> f32 {
    10.0f32.powf(db / 20.0)
}

pub fn lin_to_db(lin: f32) -> f32 {
    20.0 * lin.abs().max(1e-12).log10()
}
