use std::path::PathBuf;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pulsecompiler_backend::*;

// Compiles a small Rabi-style program and prints the hardware writes of each step
fn run(config: ProgramConfig) -> Result<()> {
    let mut prog = PulseProgram::new(config, RunMode::Test)?;
    prog.set_timebase(1e-8)?;
    prog.assign_channel(FunctionKind::Mw, 0)?;
    prog.assign_channel(FunctionKind::PulseShape, 1)?;
    prog.assign_channel(FunctionKind::Detection, 2)?;
    prog.set_function_delay(FunctionKind::Detection, -5e-8)?;
    prog.auto_shape_pulses(FunctionKind::Mw, None, None)?;

    prog.new_pulse(1)?;
    prog.set_pulse_function(1, FunctionKind::Mw)?;
    prog.set_pulse_position(1, 1e-6)?;
    prog.set_pulse_length(1, 2e-8)?;
    prog.set_pulse_length_change(1, 2e-8)?;

    prog.new_pulse(2)?;
    prog.set_pulse_function(2, FunctionKind::Detection)?;
    prog.set_pulse_position(2, 2e-6)?;
    prog.set_pulse_length(2, 3e-7)?;

    prog.start()?;
    for step in 0..5 {
        let ops = prog.update()?;
        info!(step, ops = ops.len(), length = prog.sequence_length()?, "step compiled");
        for op in ops {
            println!("{}", op);
        }
        prog.increment_pulses(Some(&[1][..]))?;
    }
    println!("{}", prog.end_of_test()?);
    Ok(())
}

fn main() {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = match ProgramConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {}", e);
            std::process::exit(2);
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    if let Err(e) = run(config) {
        error!(error = %e, "compilation failed");
        std::process::exit(1);
    }
}
