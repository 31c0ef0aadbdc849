//! Offline analysis of the gain law against synthetic ambient traces.
//!
//! Everything here runs without audio hardware: it only calls
//! [`next_gain`] and [`LevelEstimator::estimate`] plus a noise generator.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::Serialize;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::gain::next_gain;
use crate::level::LevelEstimator;
use crate::noise::build_generator;

const NOISE_FLOOR: f32 = 50.0;
const SPEECH_BOOST: f32 = 200.0;
const SPEECH_EVENTS: [(f32, f32); 2] = [(10.0, 12.0), (20.0, 22.0)];
// about 5.5 hours at the default 20 ms tick
const MAX_SIMULATION_TICKS: f64 = 1_000_000.0;

/// Synthetic ambient RMS: a slow swell, random fluctuation and two bursts
/// of nearby speech, never below a fixed floor.
pub struct AmbientTrace {
    base_level: f32,
    rng: StdRng,
}

impl AmbientTrace {
    pub fn new(base_level: f32, seed: u64) -> Self {
        Self { base_level, rng: StdRng::seed_from_u64(seed) }
    }

    pub fn level_at(&mut self, t: f32) -> f32 {
        let jitter: f32 = self.rng.sample(StandardNormal);
        let mut level = self.base_level + 100.0 * (0.1 * t).sin() + 50.0 * jitter;
        if SPEECH_EVENTS.iter().any(|&(start, end)| t > start && t < end) {
            level += SPEECH_BOOST;
        }
        level.max(NOISE_FLOOR)
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SimulationSample {
    pub t: f32,
    pub ambient: f32,
    pub gain: f32,
    /// RMS of the synthesized masking frame, in sample units
    pub masking_rms: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub ticks: usize,
    pub min_gain: f32,
    pub max_gain: f32,
    pub mean_gain: f32,
    pub samples: Vec<SimulationSample>,
}

/// Run the gain law for `seconds` at the configured update interval.
pub fn simulate(config: &Config, seconds: f32, trace: &mut AmbientTrace) -> Result<SimulationReport> {
    config.validate()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(Error::InvalidInput(format!("simulation length must be finite and >= 0, got {seconds} s")));
    }
    let dt = config.update_interval().as_secs_f32();
    let ticks = (seconds as f64 / dt as f64).floor();
    if ticks > MAX_SIMULATION_TICKS {
        return Err(Error::InvalidInput(format!(
            "simulation of {seconds} s needs {ticks} ticks, limit is {MAX_SIMULATION_TICKS}"
        )));
    }
    let ticks = ticks as usize;

    let mut generator = build_generator(config);
    let mut gain = config.initial_gain;
    let mut cursor = 0u64;
    let mut samples = Vec::with_capacity(ticks);

    for i in 0..ticks {
        let t = i as f32 * dt;
        let ambient = trace.level_at(t);
        gain = next_gain(ambient, gain, config);

        let masking = generator.generate(config.noise_buffer_size, gain, cursor);
        cursor += masking.len() as u64;
        let masking_rms = LevelEstimator::estimate(&masking)?.value();

        samples.push(SimulationSample { t, ambient, gain, masking_rms });
    }

    let (min_gain, max_gain, sum) = samples.iter().fold(
        (f32::INFINITY, f32::NEG_INFINITY, 0.0f64),
        |(lo, hi, sum), s| (lo.min(s.gain), hi.max(s.gain), sum + s.gain as f64),
    );
    let mean_gain = if samples.is_empty() { config.initial_gain } else { (sum / samples.len() as f64) as f32 };

    Ok(SimulationReport {
        ticks: samples.len(),
        min_gain: if samples.is_empty() { config.initial_gain } else { min_gain },
        max_gain: if samples.is_empty() { config.initial_gain } else { max_gain },
        mean_gain,
        samples,
    })
}

/// Gain after each of a sequence of ambient levels, starting from `initial_gain`.
pub fn gain_trace(config: &Config, levels: &[f32]) -> Vec<f32> {
    let mut gain = config.initial_gain;
    levels
        .iter()
        .map(|&level| {
            gain = next_gain(level, gain, config);
            gain
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct StepResponse {
    pub step_tick: usize,
    pub initial_gain: f32,
    pub final_gain: f32,
    /// First tick after the step within 5% of the total change
    pub settling_tick: Option<usize>,
    pub settling_time_s: Option<f32>,
    /// Any gain left `[gain_min, gain_max]`
    pub overshoot: bool,
    pub gains: Vec<f32>,
}

/// Feed `low` for `step_tick` ticks, then `high`, for `ticks` ticks total.
pub fn step_response(config: &Config, low: f32, high: f32, step_tick: usize, ticks: usize) -> StepResponse {
    let levels: Vec<f32> = (0..ticks).map(|i| if i < step_tick { low } else { high }).collect();
    let gains = gain_trace(config, &levels);

    let initial_gain = match step_tick {
        0 => config.initial_gain,
        n => gains.get(n - 1).copied().unwrap_or(config.initial_gain),
    };
    let final_gain = gains.last().copied().unwrap_or(initial_gain);
    let band = 0.05 * (final_gain - initial_gain).abs();

    let settling_tick = gains
        .iter()
        .enumerate()
        .skip(step_tick)
        .find(|&(_, &g)| (g - final_gain).abs() <= band)
        .map(|(i, _)| i);
    let dt = config.update_interval().as_secs_f32();
    let overshoot = gains.iter().any(|&g| g < config.gain_min || g > config.gain_max);

    StepResponse {
        step_tick,
        initial_gain,
        final_gain,
        settling_tick,
        settling_time_s: settling_tick.map(|i| i as f32 * dt),
        overshoot,
        gains,
    }
}
