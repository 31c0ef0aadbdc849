use std::io::{BufRead, IsTerminal};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use masking_panel::audio::{self, CpalCapture, CpalRender, WavCapture, WavRender};
use masking_panel::simulation::{self, AmbientTrace};
use masking_panel::{
    build_generator, CaptureError, Config, ControlLoop, Error, IntervalTicker, ManualTicker,
    ShutdownSignal,
};

#[derive(Parser, Debug)]
#[command(name = "masking-panel")]
#[command(about = "Adaptive sound masking controller")]
#[command(version)]
struct Args {
    /// JSON config file; defaults are used when omitted
    #[arg(short, long, global = true, env = "MASKING_PANEL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the closed loop on live audio devices
    Run {
        /// Stop after this many seconds
        #[arg(short, long, value_parser = parse_duration)]
        duration: Option<Duration>,
        #[arg(long)]
        input_device: Option<String>,
        #[arg(long)]
        output_device: Option<String>,
    },
    /// Run the loop offline against an ambient recording, writing the masking output to a WAV file
    Replay {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Restart the recording when it ends
        #[arg(long, requires = "ticks")]
        loop_input: bool,
        /// Stop after this many ticks
        #[arg(long)]
        ticks: Option<u64>,
    },
    /// Simulate the gain law against a synthetic ambient trace and print a JSON report
    Simulate {
        #[arg(long, default_value_t = 30.0)]
        seconds: f32,
        #[arg(long, default_value_t = 1)]
        seed: u64,
        /// Include every tick in the report
        #[arg(long)]
        full: bool,
    },
    /// Validate the configuration and print the effective values
    CheckConfig,
    /// List audio devices
    Devices,
}

fn parse_duration(arg: &str) -> std::result::Result<Duration, String> {
    let secs: f64 = arg.parse().map_err(|e| format!("{e}"))?;
    Duration::try_from_secs_f64(secs).map_err(|e| format!("invalid duration {arg}: {e}"))
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "masking_panel=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    match args.command {
        Command::Run { duration, input_device, output_device } => {
            run_live(config, duration, input_device.as_deref(), output_device.as_deref())
        }
        Command::Replay { input, output, loop_input, ticks } => {
            replay(config, &input, &output, loop_input, ticks)
        }
        Command::Simulate { seconds, seed, full } => simulate(&config, seconds, seed, full),
        Command::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Devices => {
            let (inputs, outputs) = audio::list_devices();
            println!("Input devices:");
            for name in inputs {
                println!("  {name}");
            }
            println!("Output devices:");
            for name in outputs {
                println!("  {name}");
            }
            Ok(())
        }
    }
}

fn run_live(
    config: Config,
    duration: Option<Duration>,
    input_device: Option<&str>,
    output_device: Option<&str>,
) -> Result<()> {
    let capture = CpalCapture::open(&config, input_device).context("Failed to open capture device")?;
    let render = CpalRender::open(&config, output_device).context("Failed to open render device")?;
    let generator = build_generator(&config);
    let ticker = IntervalTicker::new(config.update_interval());

    let shutdown = ShutdownSignal::new();
    if let Some(limit) = duration {
        let signal = shutdown.clone();
        thread::spawn(move || {
            thread::sleep(limit);
            signal.request();
        });
    }
    if std::io::stdin().is_terminal() {
        println!("Masking running. Press Enter to stop.");
        let signal = shutdown.clone();
        thread::spawn(move || {
            let mut line = String::new();
            let _ = std::io::stdin().lock().read_line(&mut line);
            signal.request();
        });
    } else if duration.is_none() {
        warn!("stdin is not a terminal and no --duration given; running until killed");
    }

    let mut control = ControlLoop::new(config, capture, render, generator, ticker)?;
    let state = control.run(&shutdown).context("Masking loop faulted")?;
    info!(?state, ticks = control.ticks(), gain = control.gain(), "masking finished");
    Ok(())
}

fn replay(config: Config, input: &Path, output: &Path, loop_input: bool, ticks: Option<u64>) -> Result<()> {
    let capture = WavCapture::open(input, &config, loop_input).context("Failed to open ambient recording")?;
    let render = WavRender::create(output, &config).context("Failed to create output WAV")?;
    let generator = build_generator(&config);
    let ticker = match ticks {
        Some(limit) => ManualTicker::with_limit(limit),
        None => ManualTicker::new(),
    };

    let mut control = ControlLoop::new(config, capture, render, generator, ticker)?;
    let result = control.run(&ShutdownSignal::new());
    let (ticks, gain) = (control.ticks(), control.gain());
    let (_, render) = control.into_parts();
    let written = render.samples_written();
    render.finalize().context("Failed to finalize output WAV")?;

    match result {
        Ok(_) | Err(Error::Capture(CaptureError::Exhausted)) => {
            println!(
                "Replayed {} ticks, final gain {:.3}, wrote {} samples to '{}'",
                ticks,
                gain,
                written,
                output.display()
            );
            Ok(())
        }
        Err(e) => bail!("Replay failed after {ticks} ticks: {e}"),
    }
}

fn simulate(config: &Config, seconds: f32, seed: u64, full: bool) -> Result<()> {
    let mut trace = AmbientTrace::new(250.0, seed);
    let mut report = simulation::simulate(config, seconds, &mut trace)?;
    // 2 s step: 10 quiet ticks, then loud ambient
    let step = simulation::step_response(config, 200.0, 500.0, 10, 100);

    if !full {
        report.samples.clear();
    }
    let summary = serde_json::json!({
        "simulation": report,
        "step_response": {
            "initial_gain": step.initial_gain,
            "final_gain": step.final_gain,
            "settling_time_s": step.settling_time_s,
            "overshoot": step.overshoot,
        },
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("2.5"), Ok(Duration::from_millis(2500)));
        assert_eq!(parse_duration("0"), Ok(Duration::ZERO));
        for bad in ["inf", "NaN", "-1", "1e30", "ten"] {
            assert!(parse_duration(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_run_rejects_infinite_duration() {
        let result = Args::try_parse_from(["masking-panel", "run", "--duration", "inf"]);
        assert!(result.is_err());

        let args = Args::try_parse_from(["masking-panel", "run", "--duration", "1.5"]).unwrap();
        match args.command {
            Command::Run { duration, .. } => assert_eq!(duration, Some(Duration::from_millis(1500))),
            other => panic!("unexpected command {:?}", other),
        }
    }
}
