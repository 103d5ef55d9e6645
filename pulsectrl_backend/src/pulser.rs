//! # Pulser control with the `pulser` module
//!
//! This module connects the compiler of [`pulsecompiler_backend`] to a physical pulser. The
//! [`Pulser`] struct holds the same [`ProgramState`] as
//! [`pulsecompiler_backend::PulseProgram`] and implements
//! [`pulsecompiler_backend::BaseProgram`] through
//! [`impl_program_boilerplate!`](pulsecompiler_backend::impl_program_boilerplate), so every
//! configuration, pulse and update operation of the compiler is available unchanged. What it adds
//! is the bus:
//!
//! - **Updates reach the hardware.** [`BaseProgram::update`] hands the operations of each update
//!   to [`Pulser::write_ops`], which encodes them as ASCII commands and writes them through the
//!   [`Transport`]. The update is committed only when every write succeeded, so after a bus
//!   failure the compiler still describes what the hardware actually holds, and the next update
//!   retries the same changes.
//! - **Dry runs stay off the bus.** In [`RunMode::Test`] nothing is written, not even `RUN` and
//!   `STOP`: the program is compiled and validated exactly as it would be live.
//! - **Connection lifecycle.** [`Pulser::open`] and [`Pulser::close`] manage the transport,
//!   [`Pulser::run`] and [`Pulser::stop`] start and stop the pulse sequence.
//!
//! ## How to use
//!
//! 1. Create the pulser with [`Pulser::new`], giving it the compiler configuration, the run mode,
//!    the bus configuration and a transport.
//! 2. Configure functions and define pulses with the [`BaseProgram`] methods, then
//!    [`BaseProgram::start`].
//! 3. [`Pulser::open`], then [`BaseProgram::update`] and [`Pulser::run`]. Change pulses and
//!    update again as the experiment proceeds.

use tracing::{debug, info};

use pulsecompiler_backend::*;

use crate::bus::{BusConfig, CommandBus, CommandEncoder};
use crate::error::CtrlResult;
use crate::transport::Transport;

/// A pulse program bound to a pulser on the other end of a [`Transport`].
#[cfg_attr(feature = "python", pyo3::pyclass)]
pub struct Pulser {
    state: ProgramState,
    transport: Box<dyn Transport>,
    bus: CommandBus,
}

impl_program_boilerplate!(Pulser, apply_ops = Pulser::write_ops);

impl Pulser {
    pub fn new(
        config: ProgramConfig,
        mode: RunMode,
        bus: BusConfig,
        transport: Box<dyn Transport>,
    ) -> CtrlResult<Self> {
        bus.validate()?;
        Ok(Self {
            state: ProgramState::new(config, mode)?,
            transport,
            bus: CommandBus::new(bus),
        })
    }

    fn is_live(&self) -> bool {
        self.state.mode() == RunMode::Experiment
    }

    /// Writes the operations of an update to the bus. Called by [`BaseProgram::update`] before
    /// the update is committed.
    fn write_ops(&mut self, ops: &[HardwareOp]) -> Result<()> {
        if !self.is_live() {
            debug!(ops = ops.len(), "dry run, nothing written");
            return Ok(());
        }
        if ops.is_empty() {
            return Ok(());
        }
        let lines = CommandEncoder::encode_all(ops);
        self.bus.send(self.transport.as_mut(), &lines)?;
        Ok(())
    }

    pub fn transport_name(&self) -> String {
        self.transport.name()
    }

    pub fn open(&mut self) -> CtrlResult<()> {
        self.transport.open()?;
        info!(transport = %self.transport.name(), "pulser connected");
        Ok(())
    }

    pub fn close(&mut self) -> CtrlResult<()> {
        self.transport.close()?;
        info!(transport = %self.transport.name(), "pulser disconnected");
        Ok(())
    }

    /// Starts the pulse sequence. Nothing is sent in [`RunMode::Test`].
    pub fn run(&mut self) -> CtrlResult<()> {
        if !self.is_live() {
            debug!("dry run, RUN not sent");
            return Ok(());
        }
        self.bus.command(self.transport.as_mut(), "RUN")
    }

    pub fn stop(&mut self) -> CtrlResult<()> {
        if !self.is_live() {
            debug!("dry run, STOP not sent");
            return Ok(());
        }
        self.bus.command(self.transport.as_mut(), "STOP")
    }
}

#[cfg(feature = "python")]
#[pyo3::pymethods]
impl Pulser {
    /// Opens the pulser on `device` (a device node or file path). Without a device, writes are
    /// only recorded in memory.
    #[new]
    #[pyo3(signature = (config_path=None, device=None, live=false))]
    fn py_new(config_path: Option<&str>, device: Option<&str>, live: bool) -> pyo3::PyResult<Self> {
        let path = config_path.map(std::path::Path::new);
        let config = ProgramConfig::load(path)?;
        let bus = BusConfig::load(path)?;
        let mode = if live {
            RunMode::Experiment
        } else {
            RunMode::Test
        };
        let transport: Box<dyn Transport> = match device {
            Some(device) => Box::new(crate::transport::FileTransport::new(device)),
            None => Box::new(crate::transport::RecordingTransport::new()),
        };
        Ok(Pulser::new(config, mode, bus, transport)?)
    }

    #[pyo3(name = "open")]
    fn py_open(&mut self) -> pyo3::PyResult<()> {
        Ok(self.open()?)
    }

    #[pyo3(name = "close")]
    fn py_close(&mut self) -> pyo3::PyResult<()> {
        Ok(self.close()?)
    }

    #[pyo3(name = "run")]
    fn py_run(&mut self) -> pyo3::PyResult<()> {
        Ok(self.run()?)
    }

    #[pyo3(name = "stop")]
    fn py_stop(&mut self) -> pyo3::PyResult<()> {
        Ok(self.stop()?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::CtrlError;
    use crate::transport::RecordingTransport;

    fn pulser(mode: RunMode, check_errors: bool) -> (Pulser, RecordingTransport) {
        let handle = RecordingTransport::new();
        let bus = BusConfig {
            max_write: 1024,
            check_errors,
        };
        let mut pulser =
            Pulser::new(ProgramConfig::default(), mode, bus, Box::new(handle.clone())).unwrap();
        pulser.set_timebase(1e-8).unwrap();
        pulser.assign_channel(FunctionKind::Mw, 0).unwrap();
        pulser.new_pulse(1).unwrap();
        pulser.set_pulse_function(1, FunctionKind::Mw).unwrap();
        pulser.set_pulse_position(1, 1e-6).unwrap();
        pulser.set_pulse_length(1, 2e-7).unwrap();
        pulser.start().unwrap();
        pulser.open().unwrap();
        (pulser, handle)
    }

    #[test]
    fn dry_run_writes_nothing() {
        let (mut pulser, handle) = pulser(RunMode::Test, true);
        assert_eq!(pulser.update().unwrap().len(), 1);
        pulser.run().unwrap();
        pulser.stop().unwrap();
        assert!(handle.writes().is_empty());
    }

    #[test]
    fn live_update_writes_commands() {
        let (mut pulser, handle) = pulser(RunMode::Experiment, false);
        pulser.update().unwrap();
        pulser.run().unwrap();
        assert_eq!(handle.text(), "DATA 0,0,100,20,1\nRUN\n");

        handle.clear();
        pulser.change_pulse_position(1, 1.1e-6).unwrap();
        pulser.update().unwrap();
        assert_eq!(handle.text(), "DATA 0,0,100,10,0\nDATA 0,0,120,10,1\n");
    }

    #[test]
    fn failed_write_is_not_committed() {
        let (mut pulser, handle) = pulser(RunMode::Experiment, false);
        pulser.update().unwrap();
        pulser.change_pulse_position(1, 2e-6).unwrap();

        handle.set_fail_writes(true);
        assert!(matches!(pulser.update(), Err(PulseError::Transport(_))));
        assert!(pulser.is_dirty());
        let image = pulser.channel_image(0).unwrap();
        assert_eq!((image[[0, 100]], image[[0, 200]]), (1, 0));

        // The retry carries the whole change
        handle.set_fail_writes(false);
        handle.clear();
        assert_eq!(pulser.update().unwrap().len(), 2);
        assert_eq!(handle.text(), "DATA 0,0,100,20,0\nDATA 0,0,200,20,1\n");
        assert!(!pulser.is_dirty());
    }

    #[test]
    fn device_error_aborts_update() {
        let (mut pulser, handle) = pulser(RunMode::Experiment, true);
        handle.push_answer("-222,\"Data out of range\"");
        match pulser.update() {
            Err(PulseError::Transport(msg)) => assert!(msg.contains("Data out of range")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(pulser.sequence_length().unwrap(), 0.);
        pulser.update().unwrap();
        assert_eq!(handle.text(), "DATA 0,0,100,20,1\nERR?\nDATA 0,0,100,20,1\nERR?\n");
    }

    #[test]
    fn closed_transport_fails_live_commands() {
        let (mut pulser, _handle) = pulser(RunMode::Experiment, false);
        pulser.close().unwrap();
        assert!(matches!(pulser.run(), Err(CtrlError::NotOpen(_))));
        assert!(matches!(pulser.update(), Err(PulseError::Transport(_))));
    }
}
