//! Pulser configuration.
//!
//! Configuration is assembled from the following sources, later ones overriding earlier ones:
//!
//! 1. Built-in defaults
//! 2. A YAML file
//! 3. Environment variables (`PULSER_*`)
//!
//! [`ProgramConfig::validate`] is run by [`ProgramConfig::load`] and again when a program is
//! created, so a config built in code goes through the same checks.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use maplit::hashmap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{PulseError, Result};
use crate::function::FunctionKind;
use crate::utils::Tick;

/// Hardware family the program compiles for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareFamily {
    /// Fields of bit-lines, one bit per tick
    #[default]
    Bitmap,
    /// Per-function chains of programmable delay elements
    DelayChain,
}

/// What `end_of_test` does with accumulated timing violations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationPolicy {
    #[default]
    Warn,
    Fail,
}

/// Default paddings (seconds) of synthesized companion pulses.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Padding {
    pub left: f64,
    pub right: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayChainConfig {
    /// Delay elements available per function, overriding `default_elements`
    pub elements: HashMap<FunctionKind, usize>,
    pub default_elements: usize,
    /// Whether each pulse also programs an explicit length element
    pub has_length_element: bool,
    /// Fixed delay (seconds) every element adds on top of its programmed value
    pub intrinsic_delay: f64,
    /// Number of chained outputs, one per used function
    pub chains: usize,
}

impl Default for DelayChainConfig {
    fn default() -> Self {
        Self {
            elements: hashmap! {
                FunctionKind::Mw => 3,
                FunctionKind::Rf => 1,
            },
            default_elements: 1,
            has_length_element: true,
            intrinsic_delay: 0.,
            chains: 8,
        }
    }
}

impl DelayChainConfig {
    pub fn elements_for(&self, kind: FunctionKind) -> usize {
        self.elements
            .get(&kind)
            .copied()
            .unwrap_or(self.default_elements)
    }
}

/// Sliding-window TWT duty-cycle limit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DutyCycleConfig {
    /// Window length in seconds
    pub window: f64,
    /// Maximum fraction of the window the TWT may be on
    pub max_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramConfig {
    pub family: HardwareFamily,
    /// Largest representable pulse position or length, in ticks
    pub max_ticks: Tick,
    /// Tolerance (fraction of a tick) when converting times to ticks
    pub precision: f64,
    pub min_timebase: f64,
    pub max_timebase: f64,
    /// Bitmap address space: fields of `bits_per_field` lines each
    pub fields: usize,
    pub bits_per_field: usize,
    pub delay_chain: DelayChainConfig,
    pub default_shape_padding: Padding,
    pub default_twt_padding: Padding,
    pub min_shape_to_defense: Option<f64>,
    pub min_defense_to_shape: Option<f64>,
    /// TWT companions closer than this are merged
    pub min_twt_gap: Option<f64>,
    pub repetition_period: Option<f64>,
    pub duty_cycle: Option<DutyCycleConfig>,
    pub violation_policy: ViolationPolicy,
    pub dump_file: Option<PathBuf>,
    pub log_level: String,
}

impl Default for ProgramConfig {
    fn default() -> Self {
        Self {
            family: HardwareFamily::Bitmap,
            max_ticks: 65536,
            precision: 0.01,
            min_timebase: 1e-10,
            max_timebase: 1e-3,
            fields: 4,
            bits_per_field: 8,
            delay_chain: DelayChainConfig::default(),
            default_shape_padding: Padding {
                left: 2e-8,
                right: 2e-8,
            },
            default_twt_padding: Padding {
                left: 2e-7,
                right: 5e-8,
            },
            min_shape_to_defense: None,
            min_defense_to_shape: None,
            min_twt_gap: None,
            repetition_period: None,
            duty_cycle: None,
            violation_policy: ViolationPolicy::Warn,
            dump_file: None,
            log_level: "info".to_string(),
        }
    }
}

impl ProgramConfig {
    /// Loads configuration from an optional YAML file and the environment, then validates it.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = match config_path {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                serde_yaml::from_str(&content)?
            }
            None => ProgramConfig::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: ProgramConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("PULSER_DUMP_FILE") {
            self.dump_file = if val.is_empty() {
                None
            } else {
                Some(PathBuf::from(val))
            };
        }
        if let Ok(val) = env::var("PULSER_VIOLATION_POLICY") {
            match val.to_lowercase().as_str() {
                "warn" => self.violation_policy = ViolationPolicy::Warn,
                "fail" => self.violation_policy = ViolationPolicy::Fail,
                other => warn!("ignoring PULSER_VIOLATION_POLICY={}", other),
            }
        }
        if let Ok(val) = env::var("PULSER_PRECISION") {
            match val.parse() {
                Ok(precision) => self.precision = precision,
                Err(_) => warn!("ignoring PULSER_PRECISION={}", val),
            }
        }
        if let Ok(val) = env::var("PULSER_LOG_LEVEL") {
            self.log_level = val;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let non_negative = |name: &str, v: f64| {
            if v.is_finite() && v >= 0. {
                Ok(())
            } else {
                Err(PulseError::Config(format!("{} must be a non-negative time", name)))
            }
        };
        let positive = |name: &str, v: Option<f64>| match v {
            Some(v) if !(v.is_finite() && v > 0.) => {
                Err(PulseError::Config(format!("{} must be positive", name)))
            }
            _ => Ok(()),
        };

        if self.max_ticks <= 0 {
            return Err(PulseError::Config("max_ticks must be positive".into()));
        }
        if !(self.precision > 0. && self.precision < 0.5) {
            return Err(PulseError::Config("precision must lie in (0, 0.5)".into()));
        }
        if !(self.min_timebase > 0. && self.min_timebase <= self.max_timebase) {
            return Err(PulseError::Config(
                "timebase range must satisfy 0 < min_timebase <= max_timebase".into(),
            ));
        }
        if self.family == HardwareFamily::Bitmap && self.fields * self.bits_per_field == 0 {
            return Err(PulseError::Config("bitmap pulser without any bit-lines".into()));
        }
        if self.family == HardwareFamily::DelayChain {
            let chain = &self.delay_chain;
            if chain.default_elements == 0 || chain.elements.values().any(|&n| n == 0) {
                return Err(PulseError::Config(
                    "every function needs at least one delay element".into(),
                ));
            }
            if chain.chains == 0 {
                return Err(PulseError::Config("delay-chain pulser without chains".into()));
            }
            non_negative("delay_chain.intrinsic_delay", chain.intrinsic_delay)?;
        }
        for (name, padding) in [
            ("default_shape_padding", self.default_shape_padding),
            ("default_twt_padding", self.default_twt_padding),
        ] {
            non_negative(name, padding.left)?;
            non_negative(name, padding.right)?;
        }
        for (name, v) in [
            ("min_shape_to_defense", self.min_shape_to_defense),
            ("min_defense_to_shape", self.min_defense_to_shape),
            ("min_twt_gap", self.min_twt_gap),
        ] {
            if let Some(v) = v {
                non_negative(name, v)?;
            }
        }
        positive("repetition_period", self.repetition_period)?;
        if let Some(duty) = self.duty_cycle {
            positive("duty_cycle.window", Some(duty.window))?;
            if !(duty.max_ratio > 0. && duty.max_ratio <= 1.) {
                return Err(PulseError::Config(
                    "duty_cycle.max_ratio must lie in (0, 1]".into(),
                ));
            }
        }
        Ok(())
    }

    // Number of individually addressable bitmap lines
    pub fn bit_lines(&self) -> usize {
        self.fields * self.bits_per_field
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ProgramConfig::default();
        config.validate().unwrap();
        assert_eq!(config.bit_lines(), 32);
        assert_eq!(config.delay_chain.elements_for(FunctionKind::Mw), 3);
        assert_eq!(config.delay_chain.elements_for(FunctionKind::Detection), 1);
    }

    #[test]
    fn yaml_with_partial_fields() {
        let config = ProgramConfig::from_yaml(
            r#"
family: delay_chain
max_ticks: 1000000
delay_chain:
  elements:
    MW: 4
    DET: 2
  has_length_element: false
violation_policy: fail
duty_cycle:
  window: 1.0e-5
  max_ratio: 0.5
"#,
        )
        .unwrap();
        assert_eq!(config.family, HardwareFamily::DelayChain);
        assert_eq!(config.max_ticks, 1_000_000);
        assert_eq!(config.delay_chain.elements_for(FunctionKind::Mw), 4);
        assert_eq!(config.delay_chain.elements_for(FunctionKind::Detection), 2);
        assert!(!config.delay_chain.has_length_element);
        assert_eq!(config.violation_policy, ViolationPolicy::Fail);
        // untouched fields keep their defaults
        assert_eq!(config.precision, 0.01);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = ProgramConfig::default();
        config.precision = 0.7;
        assert!(matches!(config.validate(), Err(PulseError::Config(_))));

        let mut config = ProgramConfig::default();
        config.duty_cycle = Some(DutyCycleConfig {
            window: 1e-5,
            max_ratio: 1.5,
        });
        assert!(config.validate().is_err());

        let mut config = ProgramConfig::default();
        config.default_twt_padding.left = -1e-9;
        assert!(config.validate().is_err());

        assert!(ProgramConfig::from_yaml("family: quantum").is_err());
    }
}
