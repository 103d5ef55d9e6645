//! Phases, phase sequences and the per-function phase-cycle matrix.
//!
//! For a function with a phase setup the matrix has one column per channel and one row per
//! position in the longest phase sequence used by its pulses. Cell `(r, c)` lists the active
//! pulses that must be emitted on channel `c` during repetition `r`. A pulse without a phase
//! sequence lands in the reference-phase column of every row.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use indexmap::IndexMap;
use regex::Regex;

use crate::error::{PulseError, Result};
use crate::function::Function;
use crate::pulse::PulseNum;
use crate::store::PulseStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    PlusX,
    MinusX,
    PlusY,
    MinusY,
    Cw,
}

fn phase_regex() -> &'static Regex {
    static PHASE_RE: OnceLock<Regex> = OnceLock::new();
    PHASE_RE.get_or_init(|| {
        Regex::new(r"^(?i)\s*(?:(?P<sign>[+-])?\s*(?P<axis>[xy])|(?P<cw>cw))\s*$")
            .unwrap_or_else(|e| panic!("phase pattern is a literal: {}", e))
    })
}

impl FromStr for Phase {
    type Err = PulseError;

    fn from_str(s: &str) -> Result<Self> {
        let caps = phase_regex()
            .captures(s)
            .ok_or_else(|| PulseError::Config(format!("invalid phase \"{}\"", s)))?;
        if caps.name("cw").is_some() {
            return Ok(Phase::Cw);
        }
        let negative = caps.name("sign").map_or(false, |m| m.as_str() == "-");
        let is_x = caps
            .name("axis")
            .map_or(false, |m| m.as_str().eq_ignore_ascii_case("x"));
        Ok(match (is_x, negative) {
            (true, false) => Phase::PlusX,
            (true, true) => Phase::MinusX,
            (false, false) => Phase::PlusY,
            (false, true) => Phase::MinusY,
        })
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::PlusX => "+X",
            Phase::MinusX => "-X",
            Phase::PlusY => "+Y",
            Phase::MinusY => "-Y",
            Phase::Cw => "CW",
        };
        write!(f, "{}", s)
    }
}

pub fn parse_phase_sequence<S: AsRef<str>>(phases: &[S]) -> Result<Vec<Phase>> {
    if phases.is_empty() {
        return Err(PulseError::Config("phase sequence is empty".to_string()));
    }
    phases.iter().map(|p| p.as_ref().parse()).collect()
}

#[derive(Clone, Debug, PartialEq)]
pub struct PhaseMatrix {
    rows: usize,
    cols: usize,
    cells: Vec<Vec<PulseNum>>,
}

impl PhaseMatrix {
    pub fn rows(&self) -> usize {
        self.rows
    }
    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn cell(&self, row: usize, col: usize) -> &[PulseNum] {
        &self.cells[row * self.cols + col]
    }

    /// Builds the matrix of `function` from the current pulse state.
    ///
    /// Fails with [`PulseError::UndeclaredPhase`] when a pulse needs a phase that was never
    /// mapped to a channel, and with [`PulseError::Config`] when a pulse references an unknown
    /// phase sequence. Pulses appear in cells in declaration order.
    pub fn build(
        function: &Function,
        store: &PulseStore,
        sequences: &IndexMap<usize, Vec<Phase>>,
    ) -> Result<Self> {
        let kind = function.kind();
        let Some(setup) = function.phase_setup() else {
            // Without phase setup everything goes on the first channel
            let mut cell = Vec::new();
            for &num in function.pulses() {
                let pulse = store.get(num)?;
                if let Some(id) = pulse.phase_sequence() {
                    let first = sequences.get(&id).and_then(|seq| seq.first());
                    return Err(PulseError::UndeclaredPhase {
                        function: kind.to_string(),
                        num,
                        phase: first.map_or_else(|| format!("sequence {}", id), |p| p.to_string()),
                    });
                }
                if pulse.is_active() {
                    cell.push(num);
                }
            }
            return Ok(Self {
                rows: 1,
                cols: function.channels().len().max(1),
                cells: {
                    let mut cells = vec![Vec::new(); function.channels().len().max(1)];
                    cells[0] = cell;
                    cells
                },
            });
        };

        let mut rows = 1;
        for &num in function.pulses() {
            if let Some(id) = store.get(num)?.phase_sequence() {
                let seq = sequences.get(&id).ok_or_else(|| {
                    PulseError::Config(format!(
                        "pulse #{} uses phase sequence {}, which was never defined",
                        num, id
                    ))
                })?;
                rows = rows.max(seq.len());
            }
        }

        let cols = function.channels().len();
        let mut cells = vec![Vec::new(); rows * cols];
        let column = |num: PulseNum, phase: Phase| {
            function
                .column_of(phase)
                .ok_or_else(|| PulseError::UndeclaredPhase {
                    function: kind.to_string(),
                    num,
                    phase: phase.to_string(),
                })
        };
        for &num in function.pulses() {
            let pulse = store.get(num)?;
            match pulse.phase_sequence() {
                None => {
                    let col = column(num, setup.reference)?;
                    if pulse.is_active() {
                        for row in 0..rows {
                            cells[row * cols + col].push(num);
                        }
                    }
                }
                Some(id) => {
                    // Presence checked while sizing the rows
                    let seq = &sequences[&id];
                    for row in 0..rows {
                        let col = column(num, seq[row % seq.len()])?;
                        if pulse.is_active() {
                            cells[row * cols + col].push(num);
                        }
                    }
                }
            }
        }
        Ok(Self { rows, cols, cells })
    }
}
