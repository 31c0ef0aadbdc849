use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const SAMPLE_RATE: u32 = 16_000;
pub const BITS_PER_SAMPLE: u8 = 16;
pub const TARGET_LEVEL: f32 = 300.0; // target ambient RMS
pub const KP: f32 = 0.0006;
pub const GAIN_MIN: f32 = 0.05;
pub const GAIN_MAX: f32 = 0.8;
pub const INITIAL_GAIN: f32 = 0.3;
pub const UPDATE_INTERVAL_MS: u64 = 20;
pub const NOISE_BUFFER_SIZE: usize = 512;
pub const MAX_SPL_DB: f32 = 48.0; // ceiling for the masking output, dBA
pub const OUTPUT_FULL_SCALE_SPL_DB: f32 = 70.0;

/// Which masking waveform the synthesizer produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseShape {
    /// -3 dB/octave across the whole band
    Pink,
    /// Pink slope band-limited to 500-4000 Hz
    SpeechBand,
}

/// Controller parameters. Loaded once at startup and passed by reference
/// to every component that needs it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sample_rate: u32,
    pub bits_per_sample: u8,
    pub target_level: f32,
    /// Proportional gain of the control law
    pub kp: f32,
    pub gain_min: f32,
    pub gain_max: f32,
    pub initial_gain: f32,
    pub update_interval_ms: u64,
    pub noise_buffer_size: usize,
    /// Samples per capture frame
    pub capture_buffer_size: usize,
    /// dB added to dBFS readings to approximate SPL at the microphone
    pub spl_calibration_offset_db: f32,
    /// SPL the speaker produces at the listening position for a full-scale signal
    pub output_full_scale_spl_db: f32,
    /// Masking output above this SPL is logged as a warning
    pub max_spl_db: f32,
    pub noise_shape: NoiseShape,
    /// Fixed seed for the noise source; `None` seeds from the OS
    pub noise_seed: Option<u64>,
    /// How long a capture/render transfer may block before it counts as failed
    pub io_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            bits_per_sample: BITS_PER_SAMPLE,
            target_level: TARGET_LEVEL,
            kp: KP,
            gain_min: GAIN_MIN,
            gain_max: GAIN_MAX,
            initial_gain: INITIAL_GAIN,
            update_interval_ms: UPDATE_INTERVAL_MS,
            noise_buffer_size: NOISE_BUFFER_SIZE,
            capture_buffer_size: NOISE_BUFFER_SIZE,
            spl_calibration_offset_db: 0.0,
            output_full_scale_spl_db: OUTPUT_FULL_SCALE_SPL_DB,
            max_spl_db: MAX_SPL_DB,
            noise_shape: NoiseShape::SpeechBand,
            noise_seed: None,
            io_timeout_ms: 500,
        }
    }
}

impl Config {
    /// Read a JSON config file. Missing keys fall back to the defaults.
    /// The result is validated before it is returned.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let config: Config = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let finite = [
            ("target_level", self.target_level),
            ("kp", self.kp),
            ("gain_min", self.gain_min),
            ("gain_max", self.gain_max),
            ("initial_gain", self.initial_gain),
            ("spl_calibration_offset_db", self.spl_calibration_offset_db),
            ("output_full_scale_spl_db", self.output_full_scale_spl_db),
            ("max_spl_db", self.max_spl_db),
        ];
        for (name, value) in finite {
            if !value.is_finite() {
                return Err(Error::Config(format!("{name} must be finite, got {value}")));
            }
        }

        if self.gain_min < 0.0 {
            return Err(Error::Config(format!(
                "gain_min must be >= 0, got {}",
                self.gain_min
            )));
        }
        if self.gain_min > self.gain_max {
            return Err(Error::Config(format!(
                "gain_min ({}) exceeds gain_max ({})",
                self.gain_min, self.gain_max
            )));
        }
        if !(self.gain_min..=self.gain_max).contains(&self.initial_gain) {
            return Err(Error::Config(format!(
                "initial_gain {} outside [{}, {}]",
                self.initial_gain, self.gain_min, self.gain_max
            )));
        }
        if self.kp < 0.0 {
            return Err(Error::Config(format!("kp must be >= 0, got {}", self.kp)));
        }
        if self.target_level < 0.0 {
            return Err(Error::Config(format!(
                "target_level must be >= 0, got {}",
                self.target_level
            )));
        }
        if !(8..=32).contains(&self.bits_per_sample) {
            return Err(Error::Config(format!(
                "bits_per_sample must be within 8..=32, got {}",
                self.bits_per_sample
            )));
        }
        if self.sample_rate == 0 {
            return Err(Error::Config("sample_rate must be non-zero".into()));
        }
        if self.noise_buffer_size == 0 || self.capture_buffer_size == 0 {
            return Err(Error::Config("buffer sizes must be non-zero".into()));
        }
        if self.update_interval_ms == 0 {
            return Err(Error::Config("update_interval_ms must be non-zero".into()));
        }
        if self.io_timeout_ms == 0 {
            return Err(Error::Config("io_timeout_ms must be non-zero".into()));
        }
        Ok(())
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    /// Largest representable sample magnitude for the configured bit depth.
    pub fn full_scale(&self) -> i32 {
        full_scale(self.bits_per_sample)
    }
}

/// `2^(bits-1) - 1`, e.g. 32767 for 16-bit audio.
pub fn full_scale(bits_per_sample: u8) -> i32 {
    let bits = bits_per_sample.clamp(2, 32) as u32;
    ((1i64 << (bits - 1)) - 1) as i32
}
