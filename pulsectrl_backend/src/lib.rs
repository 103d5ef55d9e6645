#[cfg(feature = "python")]
use pyo3::prelude::*;

pub mod bus;
pub mod error;
pub mod pulser;
pub mod transport;

pub use bus::*;
pub use error::*;
pub use pulser::*;
pub use transport::*;

#[cfg(feature = "python")]
#[pymodule]
fn pulsectrl_backend(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<Pulser>()?;
    Ok(())
}
