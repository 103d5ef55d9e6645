// Counters accumulated over a test run and the end-of-run report built from them
use std::fmt;
use std::ops::AddAssign;

use crate::pulse::PulseNum;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Diagnostics {
    pub shape_to_defense: usize,
    pub defense_to_shape: usize,
    pub duty_cycle: usize,
    pub left_padding_reduced: usize,
    pub timing_shifts: usize,
}

impl Diagnostics {
    // Counters that count as violations under the fail policy
    pub fn violations(&self) -> usize {
        self.shape_to_defense + self.defense_to_shape + self.duty_cycle
    }

    pub fn is_clean(&self) -> bool {
        *self == Diagnostics::default()
    }
}

impl AddAssign for Diagnostics {
    fn add_assign(&mut self, other: Self) {
        self.shape_to_defense += other.shape_to_defense;
        self.defense_to_shape += other.defense_to_shape;
        self.duty_cycle += other.duty_cycle;
        self.left_padding_reduced += other.left_padding_reduced;
        self.timing_shifts += other.timing_shifts;
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EndOfRunReport {
    pub counters: Diagnostics,
    pub never_active: Vec<PulseNum>,
}

impl fmt::Display for EndOfRunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.counters;
        write!(
            f,
            "shape->defense {}, defense->shape {}, duty cycle {}, reduced left paddings {}, timing shifts {}",
            c.shape_to_defense,
            c.defense_to_shape,
            c.duty_cycle,
            c.left_padding_reduced,
            c.timing_shifts
        )?;
        if !self.never_active.is_empty() {
            let nums: Vec<String> = self.never_active.iter().map(|n| format!("#{}", n)).collect();
            write!(f, "; never active: {}", nums.join(", "))?;
        }
        Ok(())
    }
}
