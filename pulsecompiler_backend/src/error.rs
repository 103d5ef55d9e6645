//! Error kinds surfaced by the pulse compiler.
//!
//! Every fallible operation returns [`Result`]. Errors are split in two groups:
//! structural errors (configuration, overlaps, exhausted resources, ...) which always abort the
//! operation, and the recoverable ones reported by [`PulseError::is_recoverable`]. When a program
//! runs in [`RunMode::Experiment`](crate::program::RunMode), a recoverable error raised by a
//! live change is downgraded to a logged warning and a `false` return value.

use thiserror::Error;

use crate::pulse::PulseNum;
use crate::utils::Tick;

#[derive(Debug, Error)]
pub enum PulseError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{what} has already been set")]
    AlreadySet { what: String },

    #[error("Pulse #{0} does not exist")]
    NotFound(PulseNum),

    #[error("Pulse #{num}: {property} has not been set")]
    PropertyUnset {
        num: PulseNum,
        property: &'static str,
    },

    #[error(
        "Time {time:e} s is not an integer multiple of the timebase {timebase:e} s (tolerance {precision})"
    )]
    Precision {
        time: f64,
        timebase: f64,
        precision: f64,
    },

    #[error("Value out of range: {0}")]
    Range(String),

    #[error("Shape pulses of pulse #{first} ({first_function}) and pulse #{second} ({second_function}) overlap")]
    ShapeOverlap {
        first_function: String,
        first: PulseNum,
        second_function: String,
        second: PulseNum,
    },

    #[error("Pulses #{first} and #{second} of function {function} overlap")]
    Overlap {
        function: String,
        first: PulseNum,
        second: PulseNum,
    },

    #[error("Pulse #{num} of function {function} starts {short_by} tick(s) too early")]
    TooEarly {
        function: String,
        num: PulseNum,
        short_by: Tick,
    },

    #[error("Pulse sequence of function {function} is too long: {length} ticks, maximum {max}")]
    SequenceTooLong {
        function: String,
        length: Tick,
        max: Tick,
    },

    #[error("Pulse sequence of function {function} lasts {length:e} s, exceeding the repetition period of {period:e} s")]
    PeriodExceeded {
        function: String,
        length: f64,
        period: f64,
    },

    #[error("Function {function} needs {required} {resource}, only {available} available")]
    ResourceExhausted {
        function: String,
        resource: String,
        required: usize,
        available: usize,
    },

    #[error("Pulse #{num} of function {function} uses phase {phase}, which has no channel")]
    UndeclaredPhase {
        function: String,
        num: PulseNum,
        phase: String,
    },

    #[error("Illegal in current state: {0}")]
    IllegalInState(String),

    #[error(
        "Violations during test run: {shape_to_defense} shape->defense, {defense_to_shape} defense->shape, {duty_cycle} duty cycle"
    )]
    AccumulatedViolations {
        shape_to_defense: usize,
        defense_to_shape: usize,
        duty_cycle: usize,
    },

    #[error("Hardware transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl PulseError {
    /// Errors a running experiment survives: the offending change is dropped and the previous
    /// pulse state stays in effect.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PulseError::Range(_) | PulseError::Precision { .. } | PulseError::PropertyUnset { .. }
        )
    }
}

impl From<serde_yaml::Error> for PulseError {
    fn from(err: serde_yaml::Error) -> Self {
        PulseError::Serialization(err.to_string())
    }
}

#[cfg(feature = "python")]
impl From<PulseError> for pyo3::PyErr {
    fn from(err: PulseError) -> Self {
        use pyo3::exceptions::{PyIOError, PyRuntimeError, PyValueError};
        match err {
            PulseError::Io(_) | PulseError::Transport(_) => PyIOError::new_err(err.to_string()),
            PulseError::Overlap { .. }
            | PulseError::ShapeOverlap { .. }
            | PulseError::TooEarly { .. }
            | PulseError::SequenceTooLong { .. }
            | PulseError::PeriodExceeded { .. }
            | PulseError::ResourceExhausted { .. }
            | PulseError::UndeclaredPhase { .. }
            | PulseError::IllegalInState(_)
            | PulseError::AccumulatedViolations { .. } => PyRuntimeError::new_err(err.to_string()),
            _ => PyValueError::new_err(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, PulseError>;
