//! # Pulse compiler backend
//!
//! Compiles abstract pulse programs into timing programs for pulse generators ("pulsers").
//! Pulses are defined in seconds, assigned to functions (MW, DETECTION, PULSE_SHAPE, ...) and
//! changed while an experiment runs. Every [`update`](program::BaseProgram::update) validates
//! the whole program, synthesizes companion pulses, lays the result out for the configured
//! hardware family and produces the minimal set of hardware writes reaching it.
//!
//! Module map:
//!
//! - [`utils`]: timebase and tick conversions, [`TickTimer`](utils::TickTimer)
//! - [`config`]: pulser configuration loaded from YAML
//! - [`function`], [`phase`]: functions, their channels and phase cycling
//! - [`pulse`], [`store`]: pulses and the store owning them
//! - [`auto_pulse`]: shape and TWT companion synthesis
//! - [`image`], [`channel`], [`layout`]: hardware images, channels and the two layouts
//! - [`dump`], [`report`]: dump file and end-of-run diagnostics
//! - [`program`]: the host surface, [`PulseProgram`](program::PulseProgram)

#[cfg(feature = "python")]
use pyo3::prelude::*;

pub mod auto_pulse;
pub mod channel;
pub mod config;
pub mod dump;
pub mod error;
pub mod function;
pub mod image;
pub mod layout;
pub mod phase;
pub mod program;
pub mod pulse;
pub mod report;
pub mod store;
pub mod utils;

pub use channel::*;
pub use config::*;
pub use error::*;
pub use function::*;
pub use image::*;
pub use layout::*;
pub use phase::*;
pub use program::*;
pub use pulse::*;
pub use report::*;
pub use store::*;
pub use utils::*;

#[cfg(feature = "python")]
#[pymodule]
fn pulsecompiler_backend(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<PulseProgram>()?;
    Ok(())
}
