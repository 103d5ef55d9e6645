// The "utils" module holds the time model (ticks, timebase conversions) and small helpers
use std::fmt;
use std::time::Instant;

use tracing::debug;

use crate::error::{PulseError, Result};

/// Integer multiple of the pulser timebase. Signed so that function delays may be negative.
pub type Tick = i64;

// Fractional part (in ticks) above which a padding is rounded up instead of down
const PADDING_ROUND_UP: f64 = 0.01;

/// The pulser's tick duration in seconds.
///
/// A timebase can be set exactly once and must lie inside the hardware's supported range.
/// All conversions between host times (seconds, `f64`) and [`Tick`]s go through it.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Timebase {
    value: Option<f64>,
}

impl Timebase {
    pub fn new() -> Self {
        Self { value: None }
    }

    pub fn is_set(&self) -> bool {
        self.value.is_some()
    }

    pub fn get(&self) -> Result<f64> {
        self.value
            .ok_or_else(|| PulseError::Config("timebase has not been set".to_string()))
    }

    pub fn set(&mut self, timebase: f64, min: f64, max: f64) -> Result<()> {
        if self.is_set() {
            return Err(PulseError::AlreadySet {
                what: "Timebase".to_string(),
            });
        }
        if !timebase.is_finite() || timebase < min || timebase > max {
            return Err(PulseError::Config(format!(
                "timebase {:e} s outside of supported range [{:e}, {:e}] s",
                timebase, min, max
            )));
        }
        self.value = Some(timebase);
        Ok(())
    }

    /// Converts a time in seconds to ticks.
    ///
    /// Fails with [`PulseError::Precision`] when `time` is not within `precision` ticks of an
    /// integer multiple of the timebase, and with [`PulseError::Range`] when the magnitude of the
    /// result exceeds `max_ticks`.
    ///
    /// ```
    /// use pulsecompiler_backend::utils::Timebase;
    ///
    /// let mut tb = Timebase::new();
    /// tb.set(1e-8, 1e-10, 1e-3).unwrap();
    /// assert_eq!(tb.to_ticks(1e-6, 0.01, 65536).unwrap(), 100);
    /// assert!(tb.to_ticks(1.5e-8, 0.01, 65536).is_err());
    /// ```
    pub fn to_ticks(&self, time: f64, precision: f64, max_ticks: Tick) -> Result<Tick> {
        let timebase = self.get()?;
        if !time.is_finite() {
            return Err(PulseError::Range(format!("time {} is not finite", time)));
        }
        let exact = time / timebase;
        let rounded = exact.round();
        if (exact - rounded).abs() > precision {
            return Err(PulseError::Precision {
                time,
                timebase,
                precision,
            });
        }
        if rounded.abs() > max_ticks as f64 {
            return Err(PulseError::Range(format!(
                "time {:e} s is {} ticks, beyond the hardware limit of {} ticks",
                time, rounded, max_ticks
            )));
        }
        Ok(rounded as Tick)
    }

    pub fn to_time(&self, ticks: Tick) -> Result<f64> {
        Ok(ticks as f64 * self.get()?)
    }

    /// Converts a default padding time to ticks. Paddings never fail on precision: a fractional
    /// part above one percent of a tick rounds up, anything smaller rounds down.
    pub fn padding_ticks(&self, time: f64) -> Result<Tick> {
        let timebase = self.get()?;
        if !time.is_finite() || time < 0. {
            return Err(PulseError::Config(format!(
                "padding {} s must be a non-negative time",
                time
            )));
        }
        let exact = time / timebase;
        let floor = exact.floor();
        let ticks = if exact - floor > PADDING_ROUND_UP {
            floor + 1.
        } else {
            floor
        };
        Ok(ticks as Tick)
    }
}

impl fmt::Display for Timebase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value {
            Some(tb) => write!(f, "{:e} s", tb),
            None => write!(f, "unset"),
        }
    }
}

/// Rounds an exact (fractional) tick count to the nearest tick, returning the rounded value and
/// the correction that was applied.
pub fn round_ticks(exact: f64) -> (Tick, f64) {
    let rounded = exact.round();
    (rounded as Tick, rounded - exact)
}

// Utility class for time-tracking of the update stages
pub struct TickTimer {
    last: Instant,
}

impl TickTimer {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
        }
    }

    // Milliseconds since the previous tick
    pub fn tick(&mut self) -> f64 {
        let now = Instant::now();
        let diff = now.duration_since(self.last).as_secs_f64() * 1e3;
        self.last = now;
        diff
    }

    pub fn tick_debug(&mut self, msg: &str) -> f64 {
        let diff = self.tick();
        debug!(stage = msg, millis = diff, "update stage finished");
        diff
    }
}

impl Default for TickTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn tb_10ns() -> Timebase {
        let mut tb = Timebase::new();
        tb.set(1e-8, 1e-10, 1e-3).unwrap();
        tb
    }

    #[test]
    fn timebase_is_set_once() {
        let mut tb = tb_10ns();
        assert!(matches!(
            tb.set(2e-8, 1e-10, 1e-3),
            Err(PulseError::AlreadySet { .. })
        ));
        assert_eq!(tb.get().unwrap(), 1e-8);
    }

    #[test]
    fn timebase_range() {
        let mut tb = Timebase::new();
        let err = tb.set(1e-12, 1e-10, 1e-3).unwrap_err();
        assert!(matches!(err, PulseError::Config(_)));
        assert!(!err.is_recoverable());
        assert!(!tb.is_set());
        assert!(matches!(tb.to_ticks(1e-6, 0.01, 100), Err(PulseError::Config(_))));
    }

    #[test]
    fn conversions() {
        let tb = tb_10ns();
        assert_eq!(tb.to_ticks(1e-6, 0.01, 65536).unwrap(), 100);
        assert_eq!(tb.to_ticks(-2e-7, 0.01, 65536).unwrap(), -20);
        // 0.5 % off an integer multiple is tolerated
        assert_eq!(tb.to_ticks(1.0005e-7, 0.01, 65536).unwrap(), 10);
        assert!(matches!(
            tb.to_ticks(1.05e-7, 0.01, 65536),
            Err(PulseError::Precision { .. })
        ));
        assert!(matches!(tb.to_ticks(1e-3, 0.01, 65536), Err(PulseError::Range(_))));
        assert!((tb.to_time(100).unwrap() - 1e-6).abs() < 1e-18);
    }

    #[test]
    fn padding_rounding() {
        let tb = tb_10ns();
        assert_eq!(tb.padding_ticks(5e-8).unwrap(), 5);
        assert_eq!(tb.padding_ticks(5.5e-8).unwrap(), 6);
        assert_eq!(tb.padding_ticks(5.0005e-8).unwrap(), 5);
        assert!(tb.padding_ticks(-1e-8).is_err());
    }

    #[test]
    fn rounding_correction() {
        let (ticks, corr) = round_ticks(9.7);
        assert_eq!(ticks, 10);
        assert!((corr - 0.3).abs() < 1e-12);
    }
}
