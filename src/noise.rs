//! Masking noise synthesis.
//!
//! Two strategies share the [`NoiseGenerator`] interface:
//!
//! - [`PinkNoise`]: uniform white noise through Paul Kellet's refined pink
//!   filter, giving a -3 dB/octave slope across the band.
//! - [`SpeechBandNoise`]: the same pink source band-limited by a 2nd-order
//!   high-pass at 500 Hz and a 2nd-order low-pass at 4000 Hz. Inside the
//!   speech band the slope stays pink; outside it falls off at 12 dB/octave.
//!
//! Filter state is carried from one call to the next so consecutive buffers
//! join without clicks. The caller's time cursor is the running sample
//! index; a jump in the cursor restarts the filters.

use std::f32::consts::PI;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::config::{full_scale, Config, NoiseShape};
use crate::level::SampleBuffer;

const SPEECH_BAND_LOW_HZ: f32 = 500.0;
const SPEECH_BAND_HIGH_HZ: f32 = 4000.0;

// scales Kellet's filter output to roughly unit peak
const PINK_NORMALIZE: f32 = 0.11;
// recovers the level removed by the band limits
const SPEECH_BAND_MAKEUP: f32 = 2.0;

const LIMIT_THRESHOLD: f32 = 0.98;

/// Produces `length` samples of masking noise scaled by `gain`, starting at
/// sample index `cursor`. Every output sample is within full scale.
pub trait NoiseGenerator {
    fn generate(&mut self, length: usize, gain: f32, cursor: u64) -> SampleBuffer;
}

impl<G: NoiseGenerator + ?Sized> NoiseGenerator for Box<G> {
    fn generate(&mut self, length: usize, gain: f32, cursor: u64) -> SampleBuffer {
        (**self).generate(length, gain, cursor)
    }
}

/// Pick the generator named by `config.noise_shape`.
pub fn build_generator(config: &Config) -> Box<dyn NoiseGenerator> {
    match config.noise_shape {
        NoiseShape::Pink => Box::new(PinkNoise::new(config)),
        NoiseShape::SpeechBand => Box::new(SpeechBandNoise::new(config)),
    }
}

fn make_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

/// Paul Kellet's refined 7-pole approximation of a 1/f filter.
#[derive(Debug, Default, Clone)]
struct PinkFilter {
    b: [f32; 7],
}

impl PinkFilter {
    fn process(&mut self, white: f32) -> f32 {
        let b = &mut self.b;
        b[0] = 0.99886 * b[0] + white * 0.0555179;
        b[1] = 0.99332 * b[1] + white * 0.0750759;
        b[2] = 0.96900 * b[2] + white * 0.1538520;
        b[3] = 0.86650 * b[3] + white * 0.3104856;
        b[4] = 0.55000 * b[4] + white * 0.5329522;
        b[5] = -0.7616 * b[5] - white * 0.0168980;
        let pink = b[0] + b[1] + b[2] + b[3] + b[4] + b[5] + b[6] + white * 0.5362;
        b[6] = white * 0.115926;
        pink * PINK_NORMALIZE
    }

    fn reset(&mut self) {
        self.b = [0.0; 7];
    }
}

/// Running-cursor bookkeeping shared by both generators.
#[derive(Debug, Default, Clone)]
struct Continuity {
    next_cursor: Option<u64>,
}

impl Continuity {
    /// Returns true when `cursor` does not follow on from the previous buffer.
    fn is_jump(&mut self, cursor: u64, length: usize) -> bool {
        let jump = matches!(self.next_cursor, Some(expected) if expected != cursor);
        self.next_cursor = Some(cursor.wrapping_add(length as u64));
        jump
    }
}

pub struct PinkNoise {
    rng: StdRng,
    filter: PinkFilter,
    continuity: Continuity,
    bits_per_sample: u8,
}

impl PinkNoise {
    pub fn new(config: &Config) -> Self {
        Self {
            rng: make_rng(config.noise_seed),
            filter: PinkFilter::default(),
            continuity: Continuity::default(),
            bits_per_sample: config.bits_per_sample,
        }
    }

    fn next_sample(&mut self) -> f32 {
        let white: f32 = self.rng.random_range(-1.0..1.0);
        self.filter.process(white)
    }

    fn reset(&mut self) {
        self.filter.reset();
    }
}

impl NoiseGenerator for PinkNoise {
    fn generate(&mut self, length: usize, gain: f32, cursor: u64) -> SampleBuffer {
        if self.continuity.is_jump(cursor, length) {
            debug!(cursor, "noise cursor jumped, restarting pink filter");
            self.reset();
        }
        let raw: Vec<f32> = (0..length).map(|_| self.next_sample()).collect();
        scale_and_limit(&raw, gain, self.bits_per_sample)
    }
}

/// RBJ cookbook biquad, transposed direct form II.
#[derive(Debug, Clone)]
struct Biquad {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    z1: f32,
    z2: f32,
}

impl Biquad {
    fn new(b0: f32, b1: f32, b2: f32, a0: f32, a1: f32, a2: f32) -> Self {
        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
            z1: 0.0,
            z2: 0.0,
        }
    }

    fn highpass(cutoff_hz: f32, sample_rate: f32, q: f32) -> Self {
        let (cos_w0, alpha) = Self::prewarp(cutoff_hz, sample_rate, q);
        let b0 = (1.0 + cos_w0) / 2.0;
        let b1 = -(1.0 + cos_w0);
        Self::new(b0, b1, b0, 1.0 + alpha, -2.0 * cos_w0, 1.0 - alpha)
    }

    fn lowpass(cutoff_hz: f32, sample_rate: f32, q: f32) -> Self {
        let (cos_w0, alpha) = Self::prewarp(cutoff_hz, sample_rate, q);
        let b0 = (1.0 - cos_w0) / 2.0;
        let b1 = 1.0 - cos_w0;
        Self::new(b0, b1, b0, 1.0 + alpha, -2.0 * cos_w0, 1.0 - alpha)
    }

    fn prewarp(cutoff_hz: f32, sample_rate: f32, q: f32) -> (f32, f32) {
        // keep the corner below Nyquist for low sample rates
        let cutoff = cutoff_hz.min(0.45 * sample_rate);
        let w0 = 2.0 * PI * cutoff / sample_rate;
        (w0.cos(), w0.sin() / (2.0 * q))
    }

    fn process(&mut self, x: f32) -> f32 {
        let y = self.b0 * x + self.z1;
        self.z1 = self.b1 * x - self.a1 * y + self.z2;
        self.z2 = self.b2 * x - self.a2 * y;
        y
    }

    fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }
}

pub struct SpeechBandNoise {
    pink: PinkNoise,
    highpass: Biquad,
    lowpass: Biquad,
}

impl SpeechBandNoise {
    pub fn new(config: &Config) -> Self {
        let sr = config.sample_rate as f32;
        let q = std::f32::consts::FRAC_1_SQRT_2;
        Self {
            pink: PinkNoise::new(config),
            highpass: Biquad::highpass(SPEECH_BAND_LOW_HZ, sr, q),
            lowpass: Biquad::lowpass(SPEECH_BAND_HIGH_HZ, sr, q),
        }
    }
}

impl NoiseGenerator for SpeechBandNoise {
    fn generate(&mut self, length: usize, gain: f32, cursor: u64) -> SampleBuffer {
        if self.pink.continuity.is_jump(cursor, length) {
            debug!(cursor, "noise cursor jumped, restarting speech-band filters");
            self.pink.reset();
            self.highpass.reset();
            self.lowpass.reset();
        }
        let raw: Vec<f32> = (0..length)
            .map(|_| {
                let pink = self.pink.next_sample();
                self.lowpass.process(self.highpass.process(pink)) * SPEECH_BAND_MAKEUP
            })
            .collect();
        scale_and_limit(&raw, gain, self.pink.bits_per_sample)
    }
}

/// Soft knee above `threshold`, asymptotic to 1.0 so the result never
/// leaves `[-1.0, 1.0]`.
pub fn soft_limit(sample: f32, threshold: f32) -> f32 {
    let abs = sample.abs();
    if abs <= threshold {
        return sample;
    }
    let headroom = 1.0 - threshold;
    let over = (abs - threshold) / headroom;
    sample.signum() * (threshold + headroom * over / (1.0 + over))
}

/// Apply gain, limit, and convert to integer samples at the given depth.
/// Holds the full-scale bound for any gain, including gains above 1.
pub fn scale_and_limit(raw: &[f32], gain: f32, bits_per_sample: u8) -> SampleBuffer {
    let max = full_scale(bits_per_sample);
    let gain = if gain.is_finite() { gain.max(0.0) } else { 0.0 };
    let samples = raw
        .iter()
        .map(|&x| {
            let limited = soft_limit(x * gain, LIMIT_THRESHOLD);
            let v = (limited as f64 * max as f64).round();
            v.clamp(-(max as f64), max as f64) as i32
        })
        .collect();
    SampleBuffer::new(samples, bits_per_sample)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::rms;

    fn seeded(shape: NoiseShape, bits: u8) -> Config {
        Config {
            noise_shape: shape,
            noise_seed: Some(42),
            bits_per_sample: bits,
            ..Config::default()
        }
    }

    /// RMS of the first difference over RMS of the signal; near sqrt(2) for
    /// white noise, small when low frequencies dominate.
    fn brightness(buf: &SampleBuffer) -> f32 {
        let s = buf.samples();
        let diff: Vec<i32> = s.windows(2).map(|w| w[1] - w[0]).collect();
        rms(&diff).unwrap() / rms(s).unwrap()
    }

    /// RMS after a 32-tap moving average (first null at 500 Hz for 16 kHz)
    /// relative to the input RMS.
    fn low_band_fraction(buf: &SampleBuffer) -> f32 {
        let s = buf.samples();
        let smoothed: Vec<i32> = s
            .windows(32)
            .map(|w| (w.iter().map(|&v| v as i64).sum::<i64>() / 32) as i32)
            .collect();
        rms(&smoothed).unwrap() / rms(s).unwrap()
    }

    #[test]
    fn test_amplitude_bound_at_any_gain() {
        for shape in [NoiseShape::Pink, NoiseShape::SpeechBand] {
            for bits in [8u8, 16, 24] {
                let cfg = seeded(shape, bits);
                let max = full_scale(bits);
                let mut generator = build_generator(&cfg);
                let mut cursor = 0u64;
                for gain in [cfg.gain_min, 0.3, cfg.gain_max, 1.0, 50.0] {
                    let buf = generator.generate(4096, gain, cursor);
                    cursor += 4096;
                    assert_eq!(buf.len(), 4096);
                    for &s in buf.samples() {
                        assert!(
                            (-max..=max).contains(&s),
                            "{:?} sample {} exceeds {}-bit full scale at gain {}",
                            shape,
                            s,
                            bits,
                            gain
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_zero_gain_is_silent() {
        let mut generator = PinkNoise::new(&seeded(NoiseShape::Pink, 16));
        let buf = generator.generate(512, 0.0, 0);
        assert!(buf.samples().iter().all(|&s| s == 0));

        let buf = generator.generate(512, f32::NAN, 512);
        assert!(buf.samples().iter().all(|&s| s == 0), "NaN gain must not produce audio");
    }

    #[test]
    fn test_output_scales_with_gain() {
        let quiet = PinkNoise::new(&seeded(NoiseShape::Pink, 16)).generate(8192, 0.1, 0);
        let loud = PinkNoise::new(&seeded(NoiseShape::Pink, 16)).generate(8192, 0.4, 0);
        let ratio = rms(loud.samples()).unwrap() / rms(quiet.samples()).unwrap();
        assert!((ratio - 4.0).abs() < 0.2, "4x gain should give ~4x RMS, got {}", ratio);
    }

    #[test]
    fn test_consecutive_buffers_are_continuous() {
        for shape in [NoiseShape::Pink, NoiseShape::SpeechBand] {
            let cfg = seeded(shape, 16);
            let whole = build_generator(&cfg).generate(1024, 0.5, 0);

            let mut generator = build_generator(&cfg);
            let mut joined = generator.generate(512, 0.5, 0).into_samples();
            joined.extend(generator.generate(512, 0.5, 512).into_samples());

            assert_eq!(
                whole.samples(),
                joined.as_slice(),
                "{:?}: split generation should match a single buffer",
                shape
            );
        }
    }

    #[test]
    fn test_spectral_tilt() {
        let pink = PinkNoise::new(&seeded(NoiseShape::Pink, 16)).generate(32_000, 0.5, 0);
        let speech = SpeechBandNoise::new(&seeded(NoiseShape::SpeechBand, 16)).generate(32_000, 0.5, 0);

        assert!(
            brightness(&pink) < 1.0,
            "pink noise should be darker than white: {}",
            brightness(&pink)
        );
        assert!(
            brightness(&speech) > brightness(&pink),
            "removing sub-500 Hz content should brighten the signal"
        );

        let pink_low = low_band_fraction(&pink);
        let speech_low = low_band_fraction(&speech);
        assert!(pink_low > 0.5, "pink noise is dominated by low bands: {}", pink_low);
        assert!(
            speech_low < 0.5 * pink_low,
            "speech-band noise should carry little below 500 Hz: {} vs pink {}",
            speech_low,
            pink_low
        );
    }

    #[test]
    fn test_soft_limiter() {
        assert_eq!(soft_limit(0.5, 0.8), 0.5, "below threshold is untouched");

        let limited = soft_limit(3.0, 0.8);
        assert!(limited > 0.8 && limited < 1.0, "positive overshoot: {}", limited);

        let limited = soft_limit(-100.0, 0.8);
        assert!(limited < -0.8 && limited > -1.0, "negative overshoot: {}", limited);
    }
}
