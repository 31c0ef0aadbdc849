//! The closed masking loop: capture -> estimate -> adapt -> synthesize -> render.
//!
//! One actor runs each tick to completion before waiting for the next, so
//! the gain state needs no locking. Capture and render are the only calls
//! that block.

use tracing::{debug, error, info, warn};

use crate::audio::{AudioCapture, AudioRender};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::gain::GainState;
use crate::level::{LevelEstimator, LevelMeasurement};
use crate::noise::NoiseGenerator;
use crate::scheduler::{ShutdownSignal, TickOutcome, Ticker};

// how often a status line is logged at info level
const STATUS_EVERY: u64 = 50;

#[derive(Debug, Clone, PartialEq)]
pub enum LoopState {
    Idle,
    Running,
    Stopped,
    /// Capture or render failed; terminal for this run
    Faulted(String),
}

/// What one tick measured and decided.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickReport {
    pub tick: u64,
    pub level: f32,
    pub gain: f32,
    /// Sample index following the rendered frame
    pub cursor: u64,
    /// The level was unusable and the previous gain was kept
    pub held: bool,
    /// Estimated SPL of the rendered masking frame at the listener
    pub output_spl: f32,
    /// `output_spl` is above the configured ceiling
    pub over_spl_limit: bool,
}

pub struct ControlLoop<C, R, N, T> {
    config: Config,
    capture: C,
    render: R,
    generator: N,
    ticker: T,
    gain: GainState,
    state: LoopState,
    cursor: u64,
    ticks: u64,
    over_spl_limit: bool,
}

impl<C, R, N, T> ControlLoop<C, R, N, T>
where
    C: AudioCapture,
    R: AudioRender,
    N: NoiseGenerator,
    T: Ticker,
{
    /// Build an idle loop. Fails with [`Error::Config`] on invalid bounds,
    /// in which case the loop never exists and so never runs.
    pub fn new(config: Config, capture: C, render: R, generator: N, ticker: T) -> Result<Self> {
        config.validate()?;
        let gain = GainState::new(&config);
        Ok(Self {
            config,
            capture,
            render,
            generator,
            ticker,
            gain,
            state: LoopState::Idle,
            cursor: 0,
            ticks: 0,
            over_spl_limit: false,
        })
    }

    pub fn state(&self) -> &LoopState {
        &self.state
    }

    pub fn gain(&self) -> f32 {
        self.gain.value()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn start(&mut self) -> Result<()> {
        match self.state {
            LoopState::Idle => {
                info!(gain = self.gain.value(), "control loop running");
                self.state = LoopState::Running;
                Ok(())
            }
            LoopState::Running => Ok(()),
            _ => Err(Error::InvalidState("start", self.state.clone())),
        }
    }

    /// Explicit shutdown. A faulted loop stays faulted.
    pub fn stop(&mut self) {
        if matches!(self.state, LoopState::Idle | LoopState::Running) {
            info!(ticks = self.ticks, gain = self.gain.value(), "control loop stopped");
            self.state = LoopState::Stopped;
            self.render.halt();
        }
    }

    fn fault(&mut self, reason: String) {
        error!(%reason, ticks = self.ticks, "control loop faulted");
        self.state = LoopState::Faulted(reason);
        self.render.halt();
    }

    /// Run a single iteration. Capture/render failures are not retried: the
    /// loop moves to [`LoopState::Faulted`] and the error is returned.
    pub fn tick(&mut self) -> Result<TickReport> {
        if self.state != LoopState::Running {
            return Err(Error::InvalidState("tick", self.state.clone()));
        }

        let frame = match self.capture.capture() {
            Ok(frame) => frame,
            Err(e) => {
                self.fault(e.to_string());
                return Err(e.into());
            }
        };

        let level = match LevelEstimator::estimate(&frame) {
            Ok(level) => level,
            Err(e) => {
                warn!("level estimate failed: {e}");
                LevelMeasurement(f32::NAN)
            }
        };

        let update = self.gain.update(level);

        let length = self.config.noise_buffer_size;
        let masking = self.generator.generate(length, update.gain, self.cursor);
        self.cursor += masking.len() as u64;
        let output_spl = LevelEstimator::estimate(&masking)
            .unwrap_or(LevelMeasurement(0.0))
            .to_output_spl(self.config.bits_per_sample, self.config.output_full_scale_spl_db);
        self.check_spl_limit(output_spl);

        if let Err(e) = self.render.render(masking) {
            self.fault(e.to_string());
            return Err(e.into());
        }

        self.ticks += 1;
        let bits = self.config.bits_per_sample;
        if self.ticks % STATUS_EVERY == 0 {
            info!(
                tick = self.ticks,
                level = level.value(),
                spl_db = level.to_spl(bits, self.config.spl_calibration_offset_db),
                gain = update.gain,
                "masking status"
            );
        } else {
            debug!(tick = self.ticks, level = level.value(), gain = update.gain, "tick");
        }

        Ok(TickReport {
            tick: self.ticks,
            level: level.value(),
            gain: update.gain,
            cursor: self.cursor,
            held: update.held,
            output_spl,
            over_spl_limit: self.over_spl_limit,
        })
    }

    /// Warn once each time the masking output crosses the SPL ceiling.
    fn check_spl_limit(&mut self, output_spl: f32) {
        let over = output_spl > self.config.max_spl_db;
        if over && !self.over_spl_limit {
            warn!(
                output_spl,
                limit = self.config.max_spl_db,
                gain = self.gain.value(),
                "masking output above SPL limit"
            );
        } else if !over && self.over_spl_limit {
            info!(output_spl, limit = self.config.max_spl_db, "masking output back under SPL limit");
        }
        self.over_spl_limit = over;
    }

    /// Tick at the ticker's cadence until shutdown is requested or a device
    /// fails. Returns the final state on a clean stop.
    pub fn run(&mut self, shutdown: &ShutdownSignal) -> Result<LoopState> {
        self.start()?;
        loop {
            if shutdown.is_requested() {
                break;
            }
            self.tick()?;
            if self.ticker.wait(shutdown) == TickOutcome::Shutdown {
                break;
            }
        }
        self.stop();
        Ok(self.state.clone())
    }

    /// Hand back the devices, e.g. to finalize a recording.
    pub fn into_parts(self) -> (C, R) {
        (self.capture, self.render)
    }
}
