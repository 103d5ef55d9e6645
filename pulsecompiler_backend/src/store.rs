//! The pulse store: every pulse, user-defined or synthesized, keyed by its number.
//!
//! Pulse properties follow a set-once discipline during preparation (`set_*`) and may be
//! overwritten while running (`change_*`, [`PulseStore::shift`], [`PulseStore::increment`],
//! [`PulseStore::reset`]). Every mutation re-evaluates the pulse's activity and raises the
//! store's dirty flag when the hardware view of the pulse no longer matches the last commit.
//! Mutations validate before writing, so a failed call leaves the pulse untouched.

use indexmap::IndexMap;

use crate::error::{PulseError, Result};
use crate::function::FunctionKind;
use crate::pulse::{Pulse, PulseNum};
use crate::utils::Tick;

#[derive(Clone, Debug)]
pub struct PulseStore {
    pulses: IndexMap<PulseNum, Pulse>,
    next_synthetic: PulseNum,
    dirty: bool,
}

impl Default for PulseStore {
    fn default() -> Self {
        Self::new()
    }
}

// Which property a set/change call targets
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Property {
    Position,
    Length,
    PositionChange,
    LengthChange,
}

impl Property {
    pub fn name(&self) -> &'static str {
        match self {
            Property::Position => "position",
            Property::Length => "length",
            Property::PositionChange => "position change",
            Property::LengthChange => "length change",
        }
    }

    fn slot(self, pulse: &mut Pulse) -> &mut Option<Tick> {
        match self {
            Property::Position => &mut pulse.pos,
            Property::Length => &mut pulse.len,
            Property::PositionChange => &mut pulse.dpos,
            Property::LengthChange => &mut pulse.dlen,
        }
    }

    fn check(self, num: PulseNum, value: Tick) -> Result<()> {
        match self {
            Property::Position | Property::Length if value < 0 => Err(PulseError::Range(format!(
                "pulse #{}: negative {} ({} ticks)",
                num,
                self.name(),
                value
            ))),
            _ => Ok(()),
        }
    }
}

impl PulseStore {
    pub fn new() -> Self {
        Self {
            pulses: IndexMap::new(),
            next_synthetic: -1,
            dirty: true,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn contains(&self, num: PulseNum) -> bool {
        self.pulses.contains_key(&num)
    }

    pub fn get(&self, num: PulseNum) -> Result<&Pulse> {
        self.pulses.get(&num).ok_or(PulseError::NotFound(num))
    }

    fn get_mut(&mut self, num: PulseNum) -> Result<&mut Pulse> {
        self.pulses.get_mut(&num).ok_or(PulseError::NotFound(num))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pulse> {
        self.pulses.values()
    }

    // User pulses in declaration order
    pub fn user_pulses(&self) -> impl Iterator<Item = &Pulse> {
        self.pulses.values().filter(|p| !p.is_companion())
    }

    pub fn new_pulse(&mut self, num: PulseNum) -> Result<()> {
        if num < 0 {
            return Err(PulseError::Config(format!(
                "pulse numbers must be non-negative, got {}",
                num
            )));
        }
        if self.contains(num) {
            return Err(PulseError::AlreadySet {
                what: format!("Pulse #{}", num),
            });
        }
        self.pulses.insert(num, Pulse::new(num));
        Ok(())
    }

    pub fn set_function(&mut self, num: PulseNum, kind: FunctionKind) -> Result<()> {
        let pulse = self.get_mut(num)?;
        if let Some(previous) = pulse.function {
            return Err(PulseError::AlreadySet {
                what: format!("Function of pulse #{} ({})", num, previous),
            });
        }
        pulse.function = Some(kind);
        Ok(())
    }

    pub fn set_phase_sequence(&mut self, num: PulseNum, id: usize) -> Result<()> {
        let pulse = self.get_mut(num)?;
        if pulse.phase_sequence.is_some() {
            return Err(PulseError::AlreadySet {
                what: format!("Phase cycle of pulse #{}", num),
            });
        }
        pulse.phase_sequence = Some(id);
        self.dirty = true;
        Ok(())
    }

    /// Sets a property that must not have been set before.
    pub fn set(&mut self, num: PulseNum, property: Property, value: Tick) -> Result<()> {
        property.check(num, value)?;
        let pulse = self.get_mut(num)?;
        let slot = property.slot(pulse);
        if slot.is_some() {
            return Err(PulseError::AlreadySet {
                what: format!("The {} of pulse #{}", property.name(), num),
            });
        }
        *slot = Some(value);
        self.refresh(num)
    }

    /// Overwrites a property of a running program.
    pub fn change(&mut self, num: PulseNum, property: Property, value: Tick) -> Result<()> {
        property.check(num, value)?;
        let pulse = self.get_mut(num)?;
        *property.slot(pulse) = Some(value);
        self.refresh(num)
    }

    pub fn set_position(&mut self, num: PulseNum, pos: Tick) -> Result<()> {
        self.set(num, Property::Position, pos)
    }

    pub fn set_length(&mut self, num: PulseNum, len: Tick) -> Result<()> {
        self.set(num, Property::Length, len)
    }

    // Re-evaluates activity and the dirty flag after a mutation
    pub(crate) fn refresh(&mut self, num: PulseNum) -> Result<()> {
        let pulse = self.get_mut(num)?;
        pulse.refresh_activity();
        if pulse.differs_from_committed() {
            self.dirty = true;
        }
        Ok(())
    }

    /// Snapshots the current properties of every user pulse as the values [`PulseStore::reset`]
    /// returns to.
    pub fn capture_initial(&mut self) {
        for pulse in self.pulses.values_mut().filter(|p| !p.is_companion()) {
            pulse.initial = pulse.snapshot();
        }
    }

    /// Restores the initial snapshot of the listed pulses, or of all user pulses.
    pub fn reset(&mut self, nums: Option<&[PulseNum]>) -> Result<()> {
        let nums = self.targets(nums)?;
        for num in nums {
            let pulse = self.get_mut(num)?;
            let initial = pulse.initial;
            pulse.restore(initial);
            self.refresh(num)?;
        }
        Ok(())
    }

    /// Moves the listed pulses (or all user pulses having a position change) by their position
    /// change. A pulse listed twice moves twice. Fails with [`PulseError::Range`] when a new
    /// position would leave `0..=max_ticks`.
    pub fn shift(&mut self, nums: Option<&[PulseNum]>, max_ticks: Tick) -> Result<()> {
        self.apply_delta(nums, Property::Position, Property::PositionChange, max_ticks)
    }

    /// Lengthens the listed pulses (or all user pulses having a length change) by their length
    /// change, with the same rules as [`PulseStore::shift`].
    pub fn increment(&mut self, nums: Option<&[PulseNum]>, max_ticks: Tick) -> Result<()> {
        self.apply_delta(nums, Property::Length, Property::LengthChange, max_ticks)
    }

    fn apply_delta(
        &mut self,
        nums: Option<&[PulseNum]>,
        target: Property,
        delta: Property,
        max_ticks: Tick,
    ) -> Result<()> {
        let explicit = nums.is_some();
        let mut updates: IndexMap<PulseNum, Tick> = IndexMap::new();
        for num in self.targets(nums)? {
            let pulse = self.get_mut(num)?;
            let Some(d) = *delta.slot(pulse) else {
                if explicit {
                    return Err(PulseError::PropertyUnset {
                        num,
                        property: delta.name(),
                    });
                }
                continue;
            };
            let current = match updates.get(&num) {
                Some(&staged) => staged,
                None => (*target.slot(pulse)).ok_or(PulseError::PropertyUnset {
                    num,
                    property: target.name(),
                })?,
            };
            let value = current + d;
            target.check(num, value)?;
            if value > max_ticks {
                return Err(PulseError::Range(format!(
                    "pulse #{}: {} of {} ticks exceeds the maximum of {} ticks",
                    num,
                    target.name(),
                    value,
                    max_ticks
                )));
            }
            updates.insert(num, value);
        }
        // All targets validated, now apply
        for (num, value) in updates {
            *target.slot(self.get_mut(num)?) = Some(value);
            self.refresh(num)?;
        }
        Ok(())
    }

    fn targets(&self, nums: Option<&[PulseNum]>) -> Result<Vec<PulseNum>> {
        match nums {
            Some(nums) => {
                for &num in nums {
                    if !self.get(num)?.is_companion() {
                        continue;
                    }
                    return Err(PulseError::Config(format!(
                        "pulse #{} is synthesized and cannot be changed directly",
                        num
                    )));
                }
                Ok(nums.to_vec())
            }
            None => Ok(self.user_pulses().map(|p| p.num()).collect()),
        }
    }

    /// Creates a synthesized companion of `primary` on function `kind`, returning its number.
    pub(crate) fn create_companion(&mut self, primary: PulseNum, kind: FunctionKind) -> PulseNum {
        let num = self.next_synthetic;
        self.next_synthetic -= 1;
        let mut pulse = Pulse::new(num);
        pulse.function = Some(kind);
        pulse.companion_of = Some(primary);
        self.pulses.insert(num, pulse);
        num
    }

    pub(crate) fn pulse_mut(&mut self, num: PulseNum) -> Result<&mut Pulse> {
        self.get_mut(num)
    }

    /// Records the current state of every pulse as the committed hardware state.
    pub fn mark_committed(&mut self) {
        for pulse in self.pulses.values_mut() {
            pulse.mark_committed();
        }
        self.dirty = false;
    }

    // User pulses never active so far, reported at the end of a test run
    pub fn never_active(&self) -> Vec<PulseNum> {
        self.user_pulses()
            .filter(|p| !p.has_been_active())
            .map(|p| p.num())
            .collect()
    }
}
