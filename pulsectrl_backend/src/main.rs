//! Pulser control command line
//!
//! ```bash
//! # Dry run of the demo sequence with the default configuration
//! pulsectrl_backend_bin sweep
//!
//! # Drive a pulser behind a device node
//! pulsectrl_backend_bin --config pulser.yaml --device /dev/usbtmc0 --live sweep --steps 20
//!
//! # Show the effective configuration
//! pulsectrl_backend_bin --config pulser.yaml config
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pulsecompiler_backend::{BaseProgram, FunctionKind, ProgramConfig, RunMode};
use pulsectrl_backend::{BusConfig, CtrlResult, FileTransport, Pulser, RecordingTransport, Transport};

/// Pulse program compiler and pulser controller
#[derive(Parser)]
#[command(name = "pulsectrl")]
#[command(about = "Compiles pulse programs and writes them to a pulser")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Device node or file the bus commands are written to
    #[arg(short, long, global = true)]
    device: Option<PathBuf>,

    /// Drive the hardware instead of a dry run
    #[arg(long, global = true)]
    live: bool,

    /// Log level (trace, debug, info, warn, error), defaults to the configured one
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sweep the microwave pulse length of a demo sequence
    Sweep {
        /// Number of sweep steps
        #[arg(long, default_value_t = 10)]
        steps: usize,
    },

    /// Show effective configuration
    Config,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}

fn sweep(pulser: &mut Pulser, steps: usize) -> CtrlResult<()> {
    pulser.set_timebase(1e-8)?;
    pulser.assign_channel(FunctionKind::Mw, 0)?;
    pulser.assign_channel(FunctionKind::PulseShape, 1)?;
    pulser.assign_channel(FunctionKind::Detection, 2)?;
    pulser.auto_shape_pulses(FunctionKind::Mw, None, None)?;

    pulser.new_pulse(1)?;
    pulser.set_pulse_function(1, FunctionKind::Mw)?;
    pulser.set_pulse_position(1, 1e-6)?;
    pulser.set_pulse_length(1, 1e-8)?;
    pulser.set_pulse_length_change(1, 1e-8)?;

    pulser.new_pulse(2)?;
    pulser.set_pulse_function(2, FunctionKind::Detection)?;
    pulser.set_pulse_position(2, 3e-6)?;
    pulser.set_pulse_length(2, 3e-7)?;

    pulser.start()?;
    pulser.open()?;
    for step in 0..steps {
        let ops = pulser.update()?;
        pulser.run()?;
        info!(step, ops = ops.len(), "step written");
        pulser.stop()?;
        pulser.increment_pulses(Some(&[1][..]))?;
    }
    println!("{}", pulser.end_of_test()?);
    pulser.close()
}

fn main() {
    let cli = Cli::parse();

    let config = match ProgramConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(2);
        }
    };
    init_logging(cli.log_level.as_deref().unwrap_or(&config.log_level));

    let result = match cli.command {
        Commands::Config => match serde_yaml::to_string(&config) {
            Ok(text) => {
                println!("{}", text);
                Ok(())
            }
            Err(e) => Err(e.into()),
        },
        Commands::Sweep { steps } => BusConfig::load(cli.config.as_deref()).and_then(|bus| {
            let transport: Box<dyn Transport> = match &cli.device {
                Some(device) => Box::new(FileTransport::new(device)),
                None => Box::new(RecordingTransport::new()),
            };
            let mode = if cli.live {
                RunMode::Experiment
            } else {
                RunMode::Test
            };
            info!(transport = %transport.name(), ?mode, "starting sweep");
            let mut pulser = Pulser::new(config, mode, bus, transport)?;
            sweep(&mut pulser, steps)
        }),
    };

    if let Err(e) = result {
        error!(error = %e, "pulser control failed");
        std::process::exit(1);
    }
}
