//! Pulser functions: the logical roles (microwave, detection, defense, ...) a pulse plays.
//!
//! A [`Function`] owns the list of pulses assigned to it, the hardware channels driving it, a
//! signed delay in ticks, an inversion flag, an optional phase setup and the auto-pulse settings
//! for shape and TWT companions.

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{PulseError, Result};
use crate::phase::Phase;
use crate::pulse::PulseNum;
use crate::utils::Tick;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FunctionKind {
    #[serde(rename = "MW")]
    Mw,
    #[serde(rename = "TWT")]
    Twt,
    #[serde(rename = "TWT_GATE")]
    TwtGate,
    #[serde(rename = "DETECTION", alias = "DET")]
    Detection,
    #[serde(rename = "DETECTION_GATE", alias = "DET_GATE")]
    DetectionGate,
    #[serde(rename = "DEFENSE")]
    Defense,
    #[serde(rename = "RF")]
    Rf,
    #[serde(rename = "RF_GATE")]
    RfGate,
    #[serde(rename = "PULSE_SHAPE", alias = "SHAPE")]
    PulseShape,
    #[serde(rename = "PHASE_1")]
    Phase1,
    #[serde(rename = "PHASE_2")]
    Phase2,
    #[serde(rename = "OTHER_1")]
    Other1,
    #[serde(rename = "OTHER_2")]
    Other2,
    #[serde(rename = "OTHER_3")]
    Other3,
    #[serde(rename = "OTHER_4")]
    Other4,
}

impl FunctionKind {
    pub const ALL: [FunctionKind; 15] = [
        FunctionKind::Mw,
        FunctionKind::Twt,
        FunctionKind::TwtGate,
        FunctionKind::Detection,
        FunctionKind::DetectionGate,
        FunctionKind::Defense,
        FunctionKind::Rf,
        FunctionKind::RfGate,
        FunctionKind::PulseShape,
        FunctionKind::Phase1,
        FunctionKind::Phase2,
        FunctionKind::Other1,
        FunctionKind::Other2,
        FunctionKind::Other3,
        FunctionKind::Other4,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FunctionKind::Mw => "MW",
            FunctionKind::Twt => "TWT",
            FunctionKind::TwtGate => "TWT_GATE",
            FunctionKind::Detection => "DETECTION",
            FunctionKind::DetectionGate => "DETECTION_GATE",
            FunctionKind::Defense => "DEFENSE",
            FunctionKind::Rf => "RF",
            FunctionKind::RfGate => "RF_GATE",
            FunctionKind::PulseShape => "PULSE_SHAPE",
            FunctionKind::Phase1 => "PHASE_1",
            FunctionKind::Phase2 => "PHASE_2",
            FunctionKind::Other1 => "OTHER_1",
            FunctionKind::Other2 => "OTHER_2",
            FunctionKind::Other3 => "OTHER_3",
            FunctionKind::Other4 => "OTHER_4",
        }
    }

    // Phase functions only switch phase channels and never carry auto companions
    pub fn is_phase_function(&self) -> bool {
        matches!(self, FunctionKind::Phase1 | FunctionKind::Phase2)
    }

    // Targets of synthesized companions cannot themselves request companions
    pub fn is_companion_target(&self) -> bool {
        matches!(self, FunctionKind::PulseShape | FunctionKind::Twt)
    }
}

impl fmt::Display for FunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for FunctionKind {
    type Err = PulseError;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase().replace([' ', '-'], "_");
        let kind = match upper.as_str() {
            "DET" => FunctionKind::Detection,
            "DET_GATE" => FunctionKind::DetectionGate,
            "SHAPE" => FunctionKind::PulseShape,
            other => *FunctionKind::ALL
                .iter()
                .find(|k| k.name() == other)
                .ok_or_else(|| PulseError::Config(format!("unknown function \"{}\"", s)))?,
        };
        Ok(kind)
    }
}

/// Explicit companion paddings in ticks. `None` falls back to the configured default.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AutoPulseSetup {
    pub left: Option<Tick>,
    pub right: Option<Tick>,
}

/// Maps phases to the function's channels. Pulses without a phase cycle play in the reference
/// phase column.
#[derive(Clone, Debug, PartialEq)]
pub struct PhaseSetup {
    pub reference: Phase,
    pub channels: IndexMap<Phase, usize>,
}

impl Default for PhaseSetup {
    fn default() -> Self {
        Self {
            reference: Phase::PlusX,
            channels: IndexMap::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Function {
    kind: FunctionKind,
    pulses: Vec<PulseNum>,
    channels: Vec<usize>,
    delay: Tick,
    is_inverted: bool,
    phase_setup: Option<PhaseSetup>,
    auto_shape: Option<AutoPulseSetup>,
    auto_twt: Option<AutoPulseSetup>,
}

impl Function {
    pub fn new(kind: FunctionKind) -> Self {
        Self {
            kind,
            pulses: Vec::new(),
            channels: Vec::new(),
            delay: 0,
            is_inverted: false,
            phase_setup: None,
            auto_shape: None,
            auto_twt: None,
        }
    }

    pub fn kind(&self) -> FunctionKind {
        self.kind
    }
    pub fn pulses(&self) -> &[PulseNum] {
        &self.pulses
    }
    pub fn channels(&self) -> &[usize] {
        &self.channels
    }
    pub fn delay(&self) -> Tick {
        self.delay
    }
    pub fn is_inverted(&self) -> bool {
        self.is_inverted
    }
    pub fn phase_setup(&self) -> Option<&PhaseSetup> {
        self.phase_setup.as_ref()
    }
    pub fn auto_shape(&self) -> Option<AutoPulseSetup> {
        self.auto_shape
    }
    pub fn auto_twt(&self) -> Option<AutoPulseSetup> {
        self.auto_twt
    }

    pub fn is_used(&self) -> bool {
        !self.pulses.is_empty()
    }

    pub(crate) fn add_pulse(&mut self, num: PulseNum) {
        if !self.pulses.contains(&num) {
            self.pulses.push(num);
        }
    }

    pub(crate) fn add_channel(&mut self, channel: usize) -> Result<()> {
        if self.channels.contains(&channel) {
            return Err(PulseError::AlreadySet {
                what: format!("Channel {} of function {}", channel, self.kind),
            });
        }
        self.channels.push(channel);
        Ok(())
    }

    pub(crate) fn set_delay(&mut self, delay: Tick) {
        self.delay = delay;
    }

    pub(crate) fn set_inverted(&mut self, inverted: bool) {
        self.is_inverted = inverted;
    }

    pub(crate) fn set_phase_channel(&mut self, phase: Phase, channel: usize) -> Result<()> {
        if !self.channels.contains(&channel) {
            return Err(PulseError::Config(format!(
                "channel {} is not assigned to function {}",
                channel, self.kind
            )));
        }
        let setup = self.phase_setup.get_or_insert_with(PhaseSetup::default);
        if let Some(previous) = setup.channels.get(&phase) {
            return Err(PulseError::AlreadySet {
                what: format!(
                    "Phase {} of function {} (channel {})",
                    phase, self.kind, previous
                ),
            });
        }
        setup.channels.insert(phase, channel);
        Ok(())
    }

    pub(crate) fn set_reference_phase(&mut self, phase: Phase) {
        self.phase_setup
            .get_or_insert_with(PhaseSetup::default)
            .reference = phase;
    }

    pub(crate) fn set_auto_shape(&mut self, setup: AutoPulseSetup) -> Result<()> {
        if self.auto_shape.is_some() {
            return Err(PulseError::AlreadySet {
                what: format!("Automatic shape pulses of function {}", self.kind),
            });
        }
        self.auto_shape = Some(setup);
        Ok(())
    }

    pub(crate) fn set_auto_twt(&mut self, setup: AutoPulseSetup) -> Result<()> {
        if self.auto_twt.is_some() {
            return Err(PulseError::AlreadySet {
                what: format!("Automatic TWT pulses of function {}", self.kind),
            });
        }
        self.auto_twt = Some(setup);
        Ok(())
    }

    // Column of a phase in the function's phase matrix
    pub fn column_of(&self, phase: Phase) -> Option<usize> {
        let channel = self.phase_setup.as_ref()?.channels.get(&phase)?;
        self.channels.iter().position(|c| c == channel)
    }
}
