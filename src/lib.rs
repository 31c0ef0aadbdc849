//! Closed-loop acoustic masking controller.
//!
//! Listens to ambient noise, estimates its RMS level, adapts a masking gain
//! toward a target level within hard bounds, and renders speech-band noise
//! scaled by that gain.

pub mod audio;
pub mod config;
pub mod control_loop;
pub mod error;
pub mod gain;
pub mod level;
pub mod noise;
pub mod scheduler;
pub mod simulation;

pub use audio::{AudioCapture, AudioRender};
pub use config::{Config, NoiseShape};
pub use control_loop::{ControlLoop, LoopState, TickReport};
pub use error::{CaptureError, Error, RenderError, Result};
pub use gain::{next_gain, GainController, GainState};
pub use level::{LevelEstimator, LevelMeasurement, SampleBuffer};
pub use noise::{build_generator, NoiseGenerator, PinkNoise, SpeechBandNoise};
pub use scheduler::{IntervalTicker, ManualTicker, ShutdownSignal, TickOutcome, Ticker};
