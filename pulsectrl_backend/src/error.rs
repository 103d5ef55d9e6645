//! Errors of the control crate.
//!
//! Compiler errors pass through unchanged. Everything the bus adds (I/O failures, a closed
//! connection, malformed or non-zero device answers) becomes [`PulseError::Transport`] when it
//! has to travel back through the compiler's update pipeline.

use std::io;

use thiserror::Error;

use pulsecompiler_backend::PulseError;

#[derive(Debug, Error)]
pub enum CtrlError {
    #[error(transparent)]
    Program(#[from] PulseError),

    #[error("Transport I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport to {0} is not open")]
    NotOpen(String),

    #[error("Device reported error {code}: {message}")]
    Device { code: i64, message: String },

    #[error("Unexpected device answer {0:?}")]
    Protocol(String),

    #[error("Bus configuration error: {0}")]
    Config(String),
}

pub type CtrlResult<T> = std::result::Result<T, CtrlError>;

impl From<CtrlError> for PulseError {
    fn from(err: CtrlError) -> Self {
        match err {
            CtrlError::Program(e) => e,
            other => PulseError::Transport(other.to_string()),
        }
    }
}

#[cfg(feature = "python")]
impl From<CtrlError> for pyo3::PyErr {
    fn from(err: CtrlError) -> Self {
        PulseError::from(err).into()
    }
}

impl From<serde_yaml::Error> for CtrlError {
    fn from(err: serde_yaml::Error) -> Self {
        CtrlError::Config(err.to_string())
    }
}
