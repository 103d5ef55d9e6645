//! The program module is the highest level of abstraction of the pulse compiler, and the single
//! place by which methods are exposed to python.
//!
//! ## Overview
//!
//! At the heart of this module lies the [`PulseProgram`] struct, which owns a [`ProgramState`]:
//! the pulse store, the functions and channels of the pulser, phase sequences, the hardware
//! layout and the diagnostics accumulated over a run. The behavior of `PulseProgram` is defined
//! by the [`BaseProgram`] trait, which prescribes every operation of the host surface through
//! default implementations written against two field accessors.
//!
//! The module is organized into the following primary components:
//!
//! 1. **ProgramState**: the complete compiler context. There is no global state: every
//!    operation reaches the state through the program it is called on.
//! 2. **Traits**: the [`BaseProgram`] trait, defining configuration, pulse definition, live
//!    changes, the update pipeline and queries.
//! 3. **Macro**: [`impl_program_boilerplate`] implements `BaseProgram` for a struct holding a
//!    `state: ProgramState` field and generates the python wrappers, so that a hardware
//!    controller crate can reuse the whole surface and hook its bus writes into updates.
//!
//! ## Lifecycle
//!
//! A program starts in the preparation phase, during which the `set_*` family is legal and each
//! property can be set once. [`BaseProgram::start`] validates the setup and snapshots the pulses.
//! From then on only the `change_*` family, [`BaseProgram::shift_pulses`],
//! [`BaseProgram::increment_pulses`] and [`BaseProgram::reset_pulses`] may touch pulses.
//!
//! ## Updates
//!
//! [`BaseProgram::update`] runs the pipeline strictly in order: companion synthesis, phase
//! matrices, layout and validation, diff. Hardware operations are handed to
//! [`BaseProgram::apply_ops`] and only committed when that succeeds, so a failure at any stage
//! leaves the committed hardware state untouched.

use std::fs::File;
use std::io::BufWriter;

use indexmap::IndexMap;
use ndarray::Array2;
use tracing::{debug, error, info, warn};

use crate::auto_pulse;
use crate::channel::{BaseChannel, Channel, ChannelAddr};
use crate::config::{HardwareFamily, ProgramConfig, ViolationPolicy};
use crate::dump::DumpFile;
use crate::error::{PulseError, Result};
use crate::function::{AutoPulseSetup, Function, FunctionKind};
use crate::layout::{layout_for, HardwareOp, Layout, LayoutInput, LayoutSummary};
use crate::phase::{Phase, PhaseMatrix};
use crate::pulse::PulseNum;
use crate::report::{Diagnostics, EndOfRunReport};
use crate::store::{Property, PulseStore};
use crate::utils::{Tick, TickTimer, Timebase};

/// Whether the host is doing a dry run or driving a live experiment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RunMode {
    /// Dry run: every error is reported as such
    #[default]
    Test,
    /// Live experiment: recoverable errors of live changes only fail the call
    Experiment,
}

pub struct ProgramState {
    pub(crate) config: ProgramConfig,
    pub(crate) mode: RunMode,
    pub(crate) is_running: bool,
    pub(crate) timebase: Timebase,
    pub(crate) store: PulseStore,
    pub(crate) functions: IndexMap<FunctionKind, Function>,
    pub(crate) channels: IndexMap<usize, Channel>,
    pub(crate) sequences: IndexMap<usize, Vec<Phase>>,
    pub(crate) layout: Box<dyn Layout>,
    pub(crate) diagnostics: Diagnostics,
    pub(crate) committed: Option<LayoutSummary>,
    // Staged layout and the counters its pipeline run produced
    pub(crate) pending: Option<(LayoutSummary, Diagnostics)>,
    pub(crate) global_delay: Tick,
    pub(crate) dump: Option<DumpFile<BufWriter<File>>>,
}

impl ProgramState {
    pub fn new(config: ProgramConfig, mode: RunMode) -> Result<Self> {
        config.validate()?;
        let dump = config.dump_file.as_ref().map(DumpFile::create).transpose()?;
        let layout = layout_for(config.family);
        Ok(Self {
            config,
            mode,
            is_running: false,
            timebase: Timebase::new(),
            store: PulseStore::new(),
            functions: FunctionKind::ALL
                .iter()
                .map(|&kind| (kind, Function::new(kind)))
                .collect(),
            channels: IndexMap::new(),
            sequences: IndexMap::new(),
            layout,
            diagnostics: Diagnostics::default(),
            committed: None,
            pending: None,
            global_delay: 0,
            dump,
        })
    }

    pub fn config(&self) -> &ProgramConfig {
        &self.config
    }
    pub fn mode(&self) -> RunMode {
        self.mode
    }
    pub fn store(&self) -> &PulseStore {
        &self.store
    }
    pub fn function(&self, kind: FunctionKind) -> &Function {
        &self.functions[&kind]
    }
    pub fn channels(&self) -> &IndexMap<usize, Channel> {
        &self.channels
    }

    fn function_mut(&mut self, kind: FunctionKind) -> &mut Function {
        &mut self.functions[&kind]
    }
}

// Runs synthesis, phase matrices and layout, stages the result and returns the diff
fn stage_update(state: &mut ProgramState, timer: &mut TickTimer) -> Result<Vec<HardwareOp>> {
    let timebase = state.timebase.get()?;
    let ProgramState {
        config,
        timebase: tb,
        store,
        functions,
        channels,
        sequences,
        layout,
        pending,
        global_delay,
        ..
    } = state;

    let mut counted = Diagnostics::default();
    auto_pulse::synthesize(store, functions, config, tb, &mut counted)?;
    timer.tick_debug("auto pulses");

    let mut matrices = IndexMap::new();
    for (&kind, function) in functions.iter().filter(|(_, f)| f.is_used()) {
        let matrix = PhaseMatrix::build(function, store, sequences)?;
        if function.channels().is_empty() {
            if let Some(&num) = (0..matrix.rows())
                .flat_map(|r| (0..matrix.cols()).map(move |c| (r, c)))
                .find_map(|(r, c)| matrix.cell(r, c).first())
            {
                return Err(PulseError::Config(format!(
                    "function {} has active pulse #{} but no channel",
                    kind, num
                )));
            }
            continue;
        }
        matrices.insert(kind, matrix);
    }
    timer.tick_debug("phase matrices");

    let min_delay = functions
        .values()
        .filter(|f| !f.channels().is_empty())
        .map(|f| f.delay())
        .min()
        .unwrap_or(0);
    *global_delay = (-min_delay).max(0);

    let input = LayoutInput {
        functions,
        matrices: &matrices,
        store,
        config,
        timebase,
        global_delay: *global_delay,
    };
    let summary = layout.lay_out(&input, channels, &mut counted)?;
    timer.tick_debug("layout");

    let ops = layout.pending_ops(channels);
    timer.tick_debug("diff");
    *pending = Some((summary, counted));
    Ok(ops)
}

/// This trait defines the behavior of the [`PulseProgram`] struct through default trait
/// implementations.
///
/// Trait methods are classified into the following categories:
/// 1. Pulser configuration, legal before [`start`] only:
///     - [`set_timebase`], [`assign_channel`], [`set_function_delay`], [`set_function_inverted`]
///     - [`set_phase_setup`], [`set_reference_phase`], [`set_phase_sequence`]
///     - [`auto_shape_pulses`], [`auto_twt_pulses`]
/// 2. Pulse definition, legal before [`start`] only:
///     - [`new_pulse`], [`set_pulse_function`], [`set_pulse_property`] and its shorthands,
///       [`set_pulse_phase_cycle`]
/// 3. Live changes, legal after [`start`] only:
///     - [`change_pulse_property`] and its shorthands, [`shift_pulses`], [`increment_pulses`],
///       [`reset_pulses`]
/// 4. The update pipeline:
///     - [`start`], [`prepare_update`], [`apply_ops`], [`commit_update`], [`update`],
///       [`end_of_test`]
/// 5. Queries:
///     - [`get_pulse_function`], [`get_pulse_property`] and its shorthands
///     - [`sequence_length`], [`channel_image`], [`channel_address`], [`diagnostics`]
///
/// [`start`]: BaseProgram::start
/// [`set_timebase`]: BaseProgram::set_timebase
/// [`assign_channel`]: BaseProgram::assign_channel
/// [`set_function_delay`]: BaseProgram::set_function_delay
/// [`set_function_inverted`]: BaseProgram::set_function_inverted
/// [`set_phase_setup`]: BaseProgram::set_phase_setup
/// [`set_reference_phase`]: BaseProgram::set_reference_phase
/// [`set_phase_sequence`]: BaseProgram::set_phase_sequence
/// [`auto_shape_pulses`]: BaseProgram::auto_shape_pulses
/// [`auto_twt_pulses`]: BaseProgram::auto_twt_pulses
/// [`new_pulse`]: BaseProgram::new_pulse
/// [`set_pulse_function`]: BaseProgram::set_pulse_function
/// [`set_pulse_property`]: BaseProgram::set_pulse_property
/// [`set_pulse_phase_cycle`]: BaseProgram::set_pulse_phase_cycle
/// [`change_pulse_property`]: BaseProgram::change_pulse_property
/// [`shift_pulses`]: BaseProgram::shift_pulses
/// [`increment_pulses`]: BaseProgram::increment_pulses
/// [`reset_pulses`]: BaseProgram::reset_pulses
/// [`prepare_update`]: BaseProgram::prepare_update
/// [`apply_ops`]: BaseProgram::apply_ops
/// [`commit_update`]: BaseProgram::commit_update
/// [`update`]: BaseProgram::update
/// [`end_of_test`]: BaseProgram::end_of_test
/// [`get_pulse_function`]: BaseProgram::get_pulse_function
/// [`get_pulse_property`]: BaseProgram::get_pulse_property
/// [`sequence_length`]: BaseProgram::sequence_length
/// [`channel_image`]: BaseProgram::channel_image
/// [`channel_address`]: BaseProgram::channel_address
/// [`diagnostics`]: BaseProgram::diagnostics
pub trait BaseProgram {
    // FIELD methods
    fn state(&self) -> &ProgramState;
    fn state_(&mut self) -> &mut ProgramState;

    /// Receives the hardware operations of an update before they are committed. An error
    /// aborts the update and nothing is committed.
    ///
    /// The default does nothing: a bare compiler has no bus to write to.
    fn apply_ops(&mut self, _ops: &[HardwareOp]) -> Result<()> {
        Ok(())
    }

    fn assert_preparing(&self, what: &str) -> Result<()> {
        if self.state().is_running {
            return Err(PulseError::IllegalInState(format!(
                "{} is only possible before the experiment starts",
                what
            )));
        }
        Ok(())
    }

    fn assert_running(&self, what: &str) -> Result<()> {
        if !self.state().is_running {
            return Err(PulseError::IllegalInState(format!(
                "{} is only possible once the experiment has started",
                what
            )));
        }
        Ok(())
    }

    /// Converts a time in seconds to ticks using the configured precision and tick limit.
    fn ticks(&self, time: f64) -> Result<Tick> {
        let state = self.state();
        state
            .timebase
            .to_ticks(time, state.config.precision, state.config.max_ticks)
    }

    fn seconds(&self, ticks: Tick) -> Result<f64> {
        self.state().timebase.to_time(ticks)
    }

    /// Turns the outcome of a live change into the value returned to the host. In
    /// [`RunMode::Experiment`], recoverable errors are logged and reported as `Ok(false)`.
    fn live_result(&self, what: &str, result: Result<()>) -> Result<bool> {
        match result {
            Ok(()) => Ok(true),
            Err(e) if self.state().mode == RunMode::Experiment && e.is_recoverable() => {
                warn!(error = %e, "{} ignored, keeping previous pulse state", what);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Sets the pulser timebase in seconds. Can only be done once.
    fn set_timebase(&mut self, timebase: f64) -> Result<()> {
        self.assert_preparing("Setting the timebase")?;
        let state = self.state_();
        let (min, max) = (state.config.min_timebase, state.config.max_timebase);
        state.timebase.set(timebase, min, max)?;
        info!(timebase = %state.timebase, "timebase set");
        Ok(())
    }

    fn timebase(&self) -> Result<f64> {
        self.state().timebase.get()
    }

    /// Assigns pulser output `channel` to function `kind`. A channel belongs to exactly one
    /// function.
    fn assign_channel(&mut self, kind: FunctionKind, channel: usize) -> Result<()> {
        self.assert_preparing("Assigning channels")?;
        let state = self.state_();
        if let Some(owner) = state.channels.get(&channel) {
            return Err(if owner.function() == kind {
                PulseError::AlreadySet {
                    what: format!("Channel {} of function {}", channel, kind),
                }
            } else {
                PulseError::Config(format!(
                    "channel {} is already assigned to function {}",
                    channel,
                    owner.function()
                ))
            });
        }
        state.function_mut(kind).add_channel(channel)?;
        state.channels.insert(channel, Channel::new(channel, kind));
        state.store.mark_dirty();
        debug!(function = %kind, channel, "channel assigned");
        Ok(())
    }

    /// Sets the delay of a function in seconds. Negative delays are allowed: the most negative
    /// one becomes the global delay every function is shifted by.
    fn set_function_delay(&mut self, kind: FunctionKind, delay: f64) -> Result<()> {
        self.assert_preparing("Setting function delays")?;
        let ticks = self.ticks(delay)?;
        let state = self.state_();
        state.function_mut(kind).set_delay(ticks);
        state.store.mark_dirty();
        Ok(())
    }

    fn set_function_inverted(&mut self, kind: FunctionKind, inverted: bool) -> Result<()> {
        self.assert_preparing("Inverting functions")?;
        let state = self.state_();
        state.function_mut(kind).set_inverted(inverted);
        state.store.mark_dirty();
        Ok(())
    }

    /// Routes `phase` of function `kind` to one of its channels.
    fn set_phase_setup(&mut self, kind: FunctionKind, phase: Phase, channel: usize) -> Result<()> {
        self.assert_preparing("Setting up phases")?;
        if self.state().config.family == HardwareFamily::DelayChain {
            return Err(PulseError::Config(
                "phase setups are not available on delay-chain pulsers".to_string(),
            ));
        }
        let state = self.state_();
        state.function_mut(kind).set_phase_channel(phase, channel)?;
        state.store.mark_dirty();
        Ok(())
    }

    /// Phase used by pulses of `kind` that have no phase cycle. Defaults to +X.
    fn set_reference_phase(&mut self, kind: FunctionKind, phase: Phase) -> Result<()> {
        self.assert_preparing("Setting the reference phase")?;
        self.state_().function_mut(kind).set_reference_phase(phase);
        Ok(())
    }

    fn set_phase_sequence(&mut self, id: usize, phases: Vec<Phase>) -> Result<()> {
        self.assert_preparing("Defining phase sequences")?;
        if phases.is_empty() {
            return Err(PulseError::Config(format!("phase sequence {} is empty", id)));
        }
        let state = self.state_();
        if state.sequences.contains_key(&id) {
            return Err(PulseError::AlreadySet {
                what: format!("Phase sequence {}", id),
            });
        }
        state.sequences.insert(id, phases);
        Ok(())
    }

    // Explicit paddings are converted like any other time and must be non-negative
    fn padding_setup(&self, left: Option<f64>, right: Option<f64>) -> Result<AutoPulseSetup> {
        let convert = |t: Option<f64>| -> Result<Option<Tick>> {
            match t {
                Some(t) if t < 0. => Err(PulseError::Config(format!(
                    "padding {:e} s must not be negative",
                    t
                ))),
                Some(t) => self.ticks(t).map(Some),
                None => Ok(None),
            }
        };
        Ok(AutoPulseSetup {
            left: convert(left)?,
            right: convert(right)?,
        })
    }

    fn check_auto_source(&self, kind: FunctionKind) -> Result<()> {
        if kind.is_companion_target() || kind.is_phase_function() {
            return Err(PulseError::Config(format!(
                "function {} cannot have automatic companion pulses",
                kind
            )));
        }
        Ok(())
    }

    /// Requests a PULSE_SHAPE companion for every pulse of `kind`. Paddings in seconds, `None`
    /// for the configured default.
    fn auto_shape_pulses(
        &mut self,
        kind: FunctionKind,
        left: Option<f64>,
        right: Option<f64>,
    ) -> Result<()> {
        self.assert_preparing("Requesting shape pulses")?;
        self.check_auto_source(kind)?;
        let setup = self.padding_setup(left, right)?;
        let state = self.state_();
        state.function_mut(kind).set_auto_shape(setup)?;
        state.store.mark_dirty();
        Ok(())
    }

    /// Requests a TWT companion for every pulse of `kind`.
    fn auto_twt_pulses(
        &mut self,
        kind: FunctionKind,
        left: Option<f64>,
        right: Option<f64>,
    ) -> Result<()> {
        self.assert_preparing("Requesting TWT pulses")?;
        self.check_auto_source(kind)?;
        let setup = self.padding_setup(left, right)?;
        let state = self.state_();
        state.function_mut(kind).set_auto_twt(setup)?;
        state.store.mark_dirty();
        Ok(())
    }

    fn new_pulse(&mut self, num: PulseNum) -> Result<()> {
        self.assert_preparing("Creating pulses")?;
        self.state_().store.new_pulse(num)
    }

    fn set_pulse_function(&mut self, num: PulseNum, kind: FunctionKind) -> Result<()> {
        self.assert_preparing("Setting pulse functions")?;
        let state = self.state_();
        state.store.set_function(num, kind)?;
        state.function_mut(kind).add_pulse(num);
        Ok(())
    }

    /// Sets a time property of a pulse, in seconds. Each property can be set once.
    fn set_pulse_property(&mut self, num: PulseNum, property: Property, time: f64) -> Result<()> {
        self.assert_preparing("Setting pulse properties")?;
        let ticks = self.ticks(time)?;
        self.state_().store.set(num, property, ticks)
    }

    fn set_pulse_position(&mut self, num: PulseNum, time: f64) -> Result<()> {
        self.set_pulse_property(num, Property::Position, time)
    }

    fn set_pulse_length(&mut self, num: PulseNum, time: f64) -> Result<()> {
        self.set_pulse_property(num, Property::Length, time)
    }

    fn set_pulse_position_change(&mut self, num: PulseNum, time: f64) -> Result<()> {
        self.set_pulse_property(num, Property::PositionChange, time)
    }

    fn set_pulse_length_change(&mut self, num: PulseNum, time: f64) -> Result<()> {
        self.set_pulse_property(num, Property::LengthChange, time)
    }

    fn set_pulse_phase_cycle(&mut self, num: PulseNum, sequence: usize) -> Result<()> {
        self.assert_preparing("Setting phase cycles")?;
        let state = self.state_();
        if !state.sequences.contains_key(&sequence) {
            return Err(PulseError::Config(format!(
                "phase sequence {} has not been defined",
                sequence
            )));
        }
        state.store.set_phase_sequence(num, sequence)
    }

    /// Overwrites a time property of a pulse while the experiment runs. Returns `Ok(false)`
    /// when a recoverable error was swallowed in [`RunMode::Experiment`].
    fn change_pulse_property(
        &mut self,
        num: PulseNum,
        property: Property,
        time: f64,
    ) -> Result<bool> {
        self.assert_running("Changing pulses")?;
        let result = self
            .ticks(time)
            .and_then(|ticks| self.state_().store.change(num, property, ticks));
        self.live_result(&format!("Changing the {} of pulse #{}", property.name(), num), result)
    }

    fn change_pulse_position(&mut self, num: PulseNum, time: f64) -> Result<bool> {
        self.change_pulse_property(num, Property::Position, time)
    }

    fn change_pulse_length(&mut self, num: PulseNum, time: f64) -> Result<bool> {
        self.change_pulse_property(num, Property::Length, time)
    }

    fn change_pulse_position_change(&mut self, num: PulseNum, time: f64) -> Result<bool> {
        self.change_pulse_property(num, Property::PositionChange, time)
    }

    fn change_pulse_length_change(&mut self, num: PulseNum, time: f64) -> Result<bool> {
        self.change_pulse_property(num, Property::LengthChange, time)
    }

    /// Moves the listed pulses (all when `None`) by their position change.
    fn shift_pulses(&mut self, nums: Option<&[PulseNum]>) -> Result<bool> {
        self.assert_running("Shifting pulses")?;
        let state = self.state_();
        let result = state.store.shift(nums, state.config.max_ticks);
        self.live_result("Shifting pulses", result)
    }

    /// Lengthens the listed pulses (all when `None`) by their length change.
    fn increment_pulses(&mut self, nums: Option<&[PulseNum]>) -> Result<bool> {
        self.assert_running("Incrementing pulses")?;
        let state = self.state_();
        let result = state.store.increment(nums, state.config.max_ticks);
        self.live_result("Incrementing pulses", result)
    }

    /// Restores the listed pulses (all when `None`) to their state at [`BaseProgram::start`].
    fn reset_pulses(&mut self, nums: Option<&[PulseNum]>) -> Result<()> {
        self.assert_running("Resetting pulses")?;
        self.state_().store.reset(nums)
    }

    fn get_pulse_function(&self, num: PulseNum) -> Result<FunctionKind> {
        self.state()
            .store
            .get(num)?
            .function()
            .ok_or(PulseError::PropertyUnset {
                num,
                property: "function",
            })
    }

    /// Reads a time property of a pulse, in seconds.
    fn get_pulse_property(&self, num: PulseNum, property: Property) -> Result<f64> {
        let pulse = self.state().store.get(num)?;
        let value = match property {
            Property::Position => pulse.pos(),
            Property::Length => pulse.len(),
            Property::PositionChange => pulse.dpos(),
            Property::LengthChange => pulse.dlen(),
        };
        let ticks = value.ok_or(PulseError::PropertyUnset {
            num,
            property: property.name(),
        })?;
        self.seconds(ticks)
    }

    fn get_pulse_position(&self, num: PulseNum) -> Result<f64> {
        self.get_pulse_property(num, Property::Position)
    }

    fn get_pulse_length(&self, num: PulseNum) -> Result<f64> {
        self.get_pulse_property(num, Property::Length)
    }

    fn get_pulse_position_change(&self, num: PulseNum) -> Result<f64> {
        self.get_pulse_property(num, Property::PositionChange)
    }

    fn get_pulse_length_change(&self, num: PulseNum) -> Result<f64> {
        self.get_pulse_property(num, Property::LengthChange)
    }

    /// Static checks run by [`BaseProgram::start`].
    fn validate_setup(&self) -> Result<()> {
        let state = self.state();
        state.timebase.get()?;
        for pulse in state.store.user_pulses() {
            if pulse.function().is_none() {
                return Err(PulseError::Config(format!(
                    "pulse #{} has no function",
                    pulse.num()
                )));
            }
        }
        for function in state.functions.values() {
            let kind = function.kind();
            if function.is_used() && function.channels().is_empty() {
                return Err(PulseError::Config(format!(
                    "function {} is used by pulse #{} but has no channel",
                    kind,
                    function.pulses()[0]
                )));
            }
            if function.channels().len() > 1 && function.phase_setup().is_none() {
                return Err(PulseError::Config(format!(
                    "function {} has {} channels but no phase setup",
                    kind,
                    function.channels().len()
                )));
            }
            if function.auto_shape().is_some()
                && state.function(FunctionKind::PulseShape).channels().is_empty()
            {
                return Err(PulseError::Config(format!(
                    "function {} requests shape pulses but PULSE_SHAPE has no channel",
                    kind
                )));
            }
            if function.auto_twt().is_some()
                && state.function(FunctionKind::Twt).channels().is_empty()
            {
                return Err(PulseError::Config(format!(
                    "function {} requests TWT pulses but TWT has no channel",
                    kind
                )));
            }
        }
        Ok(())
    }

    /// Ends the preparation phase: validates the setup and records every pulse's current state
    /// as the one [`BaseProgram::reset_pulses`] returns to. Does not touch the hardware, call
    /// [`BaseProgram::update`] afterwards.
    fn start(&mut self) -> Result<()> {
        self.assert_preparing("Starting")?;
        self.validate_setup()?;
        let state = self.state_();
        state.store.capture_initial();
        state.is_running = true;
        info!(
            mode = ?state.mode,
            family = ?state.layout.family(),
            pulses = state.store.user_pulses().count(),
            "experiment started"
        );
        Ok(())
    }

    /// Runs the pipeline and stages the result, returning the hardware operations needed to
    /// reach it. Nothing is committed.
    fn prepare_update(&mut self) -> Result<Vec<HardwareOp>> {
        let mut timer = TickTimer::new();
        let state = self.state_();
        state.pending = None;
        stage_update(state, &mut timer).map_err(|e| {
            error!(error = %e, "update rejected, hardware state unchanged");
            e
        })
    }

    /// Commits the staged update and appends it to the dump file.
    fn commit_update(&mut self) -> Result<()> {
        let state = self.state_();
        let (summary, counted) = state.pending.take().ok_or_else(|| {
            PulseError::IllegalInState("there is no prepared update to commit".to_string())
        })?;
        state.layout.commit(&mut state.channels);
        state.store.mark_committed();
        state.committed = Some(summary);
        state.diagnostics += counted;
        if let Some(dump) = state.dump.as_mut() {
            if !dump.header_written() {
                let timebase = state.timebase.get()?;
                dump.write_header(timebase, state.global_delay, &state.functions)?;
            }
            dump.write_update(&state.functions, &state.store)?;
        }
        Ok(())
    }

    /// Brings the hardware in line with the pulses: prepare, apply, commit. Returns the
    /// operations that were applied, none when nothing changed since the last commit.
    fn update(&mut self) -> Result<Vec<HardwareOp>> {
        if !self.state().store.is_dirty() && self.state().committed.is_some() {
            debug!("pulses unchanged, nothing to update");
            return Ok(Vec::new());
        }
        let ops = self.prepare_update()?;
        if let Err(e) = self.apply_ops(&ops) {
            error!(error = %e, "writing the update failed, nothing committed");
            self.state_().pending = None;
            return Err(e);
        }
        self.commit_update()?;
        info!(ops = ops.len(), "pulser updated");
        Ok(ops)
    }

    /// Reports the counters accumulated since the last call and resets them. Under the fail
    /// policy any violation turns into [`PulseError::AccumulatedViolations`].
    fn end_of_test(&mut self) -> Result<EndOfRunReport> {
        let state = self.state_();
        let report = EndOfRunReport {
            counters: state.diagnostics,
            never_active: state.store.never_active(),
        };
        state.diagnostics = Diagnostics::default();

        for num in &report.never_active {
            warn!(pulse = num, "pulse was never active");
        }
        if report.counters.is_clean() {
            info!("end of test run: no violations");
        } else {
            warn!(%report, "end of test run");
        }
        let c = report.counters;
        if state.config.violation_policy == ViolationPolicy::Fail && c.violations() > 0 {
            return Err(PulseError::AccumulatedViolations {
                shape_to_defense: c.shape_to_defense,
                defense_to_shape: c.defense_to_shape,
                duty_cycle: c.duty_cycle,
            });
        }
        Ok(report)
    }

    fn is_running(&self) -> bool {
        self.state().is_running
    }

    fn run_mode(&self) -> RunMode {
        self.state().mode
    }

    fn is_dirty(&self) -> bool {
        self.state().store.is_dirty()
    }

    fn diagnostics(&self) -> Diagnostics {
        self.state().diagnostics
    }

    /// Duration of the committed sequence in seconds, 0 before the first update.
    fn sequence_length(&self) -> Result<f64> {
        let ticks = self
            .state()
            .committed
            .as_ref()
            .map_or(0, |s| s.sequence_length());
        self.seconds(ticks)
    }

    /// Committed image of a bitmap channel, phase-cycle rows by ticks.
    fn channel_image(&self, channel: usize) -> Result<Array2<u8>> {
        self.state()
            .channels
            .get(&channel)
            .ok_or_else(|| PulseError::Config(format!("channel {} is not assigned", channel)))?
            .committed_image()
    }

    fn channel_address(&self, channel: usize) -> Option<ChannelAddr> {
        self.state().channels.get(&channel)?.address()
    }
}

/// A macro to generate boilerplate implementations for structs representing pulse programs.
///
/// The target struct must hold a `state: ProgramState` field. The macro implements
/// [`BaseProgram`] for it and, with the `python` feature, the python-exposed wrappers of the
/// whole trait surface (multiple `#[pymethods]` blocks let the caller add its own).
///
/// An optional `apply_ops = path` argument names a function
/// `fn(&mut Self, &[HardwareOp]) -> Result<()>` that receives each update's operations before
/// they are committed, which is how a controller writes to its bus.
///
/// # Example
///
/// ```
/// use pulsecompiler_backend::*;
///
/// pub struct Recorder {
///     state: ProgramState,
///     seen: usize,
/// }
///
/// impl Recorder {
///     fn record(&mut self, ops: &[HardwareOp]) -> Result<()> {
///         self.seen += ops.len();
///         Ok(())
///     }
/// }
///
/// impl_program_boilerplate!(Recorder, apply_ops = Recorder::record);
///
/// let mut rec = Recorder {
///     state: ProgramState::new(ProgramConfig::default(), RunMode::Test).unwrap(),
///     seen: 0,
/// };
/// rec.set_timebase(1e-8).unwrap();
/// rec.assign_channel(FunctionKind::Mw, 0).unwrap();
/// rec.new_pulse(1).unwrap();
/// rec.set_pulse_function(1, FunctionKind::Mw).unwrap();
/// rec.set_pulse_position(1, 1e-6).unwrap();
/// rec.set_pulse_length(1, 2e-7).unwrap();
/// rec.start().unwrap();
/// rec.update().unwrap();
/// assert_eq!(rec.seen, 1);
/// ```
#[macro_export]
macro_rules! impl_program_boilerplate {
    (@python $prog_type: ty) => {
        #[cfg(feature = "python")]
        #[::pyo3::pymethods]
        impl $prog_type {
            #[pyo3(name = "set_timebase")]
            fn py_set_timebase(&mut self, timebase: f64) -> ::pyo3::PyResult<()> {
                Ok($crate::program::BaseProgram::set_timebase(self, timebase)?)
            }

            #[pyo3(name = "assign_channel")]
            fn py_assign_channel(&mut self, function: &str, channel: usize) -> ::pyo3::PyResult<()> {
                let kind: $crate::function::FunctionKind = function.parse()?;
                Ok($crate::program::BaseProgram::assign_channel(self, kind, channel)?)
            }

            #[pyo3(name = "set_function_delay")]
            fn py_set_function_delay(&mut self, function: &str, delay: f64) -> ::pyo3::PyResult<()> {
                let kind: $crate::function::FunctionKind = function.parse()?;
                Ok($crate::program::BaseProgram::set_function_delay(self, kind, delay)?)
            }

            #[pyo3(name = "set_function_inverted")]
            fn py_set_function_inverted(&mut self, function: &str, inverted: bool) -> ::pyo3::PyResult<()> {
                let kind: $crate::function::FunctionKind = function.parse()?;
                Ok($crate::program::BaseProgram::set_function_inverted(self, kind, inverted)?)
            }

            #[pyo3(name = "set_phase_setup")]
            fn py_set_phase_setup(&mut self, function: &str, phase: &str, channel: usize) -> ::pyo3::PyResult<()> {
                let kind: $crate::function::FunctionKind = function.parse()?;
                let phase: $crate::phase::Phase = phase.parse()?;
                Ok($crate::program::BaseProgram::set_phase_setup(self, kind, phase, channel)?)
            }

            #[pyo3(name = "set_reference_phase")]
            fn py_set_reference_phase(&mut self, function: &str, phase: &str) -> ::pyo3::PyResult<()> {
                let kind: $crate::function::FunctionKind = function.parse()?;
                let phase: $crate::phase::Phase = phase.parse()?;
                Ok($crate::program::BaseProgram::set_reference_phase(self, kind, phase)?)
            }

            #[pyo3(name = "set_phase_sequence")]
            fn py_set_phase_sequence(&mut self, id: usize, phases: Vec<String>) -> ::pyo3::PyResult<()> {
                let phases = $crate::phase::parse_phase_sequence(&phases)?;
                Ok($crate::program::BaseProgram::set_phase_sequence(self, id, phases)?)
            }

            #[pyo3(name = "auto_shape_pulses", signature = (function, left=None, right=None))]
            fn py_auto_shape_pulses(&mut self, function: &str, left: Option<f64>, right: Option<f64>) -> ::pyo3::PyResult<()> {
                let kind: $crate::function::FunctionKind = function.parse()?;
                Ok($crate::program::BaseProgram::auto_shape_pulses(self, kind, left, right)?)
            }

            #[pyo3(name = "auto_twt_pulses", signature = (function, left=None, right=None))]
            fn py_auto_twt_pulses(&mut self, function: &str, left: Option<f64>, right: Option<f64>) -> ::pyo3::PyResult<()> {
                let kind: $crate::function::FunctionKind = function.parse()?;
                Ok($crate::program::BaseProgram::auto_twt_pulses(self, kind, left, right)?)
            }

            #[pyo3(name = "new_pulse")]
            fn py_new_pulse(&mut self, num: i64) -> ::pyo3::PyResult<()> {
                Ok($crate::program::BaseProgram::new_pulse(self, num)?)
            }

            #[pyo3(name = "set_pulse_function")]
            fn py_set_pulse_function(&mut self, num: i64, function: &str) -> ::pyo3::PyResult<()> {
                let kind: $crate::function::FunctionKind = function.parse()?;
                Ok($crate::program::BaseProgram::set_pulse_function(self, num, kind)?)
            }

            #[pyo3(name = "set_pulse_position")]
            fn py_set_pulse_position(&mut self, num: i64, time: f64) -> ::pyo3::PyResult<()> {
                Ok($crate::program::BaseProgram::set_pulse_position(self, num, time)?)
            }

            #[pyo3(name = "set_pulse_length")]
            fn py_set_pulse_length(&mut self, num: i64, time: f64) -> ::pyo3::PyResult<()> {
                Ok($crate::program::BaseProgram::set_pulse_length(self, num, time)?)
            }

            #[pyo3(name = "set_pulse_position_change")]
            fn py_set_pulse_position_change(&mut self, num: i64, time: f64) -> ::pyo3::PyResult<()> {
                Ok($crate::program::BaseProgram::set_pulse_position_change(self, num, time)?)
            }

            #[pyo3(name = "set_pulse_length_change")]
            fn py_set_pulse_length_change(&mut self, num: i64, time: f64) -> ::pyo3::PyResult<()> {
                Ok($crate::program::BaseProgram::set_pulse_length_change(self, num, time)?)
            }

            #[pyo3(name = "set_pulse_phase_cycle")]
            fn py_set_pulse_phase_cycle(&mut self, num: i64, sequence: usize) -> ::pyo3::PyResult<()> {
                Ok($crate::program::BaseProgram::set_pulse_phase_cycle(self, num, sequence)?)
            }

            #[pyo3(name = "change_pulse_position")]
            fn py_change_pulse_position(&mut self, num: i64, time: f64) -> ::pyo3::PyResult<bool> {
                Ok($crate::program::BaseProgram::change_pulse_position(self, num, time)?)
            }

            #[pyo3(name = "change_pulse_length")]
            fn py_change_pulse_length(&mut self, num: i64, time: f64) -> ::pyo3::PyResult<bool> {
                Ok($crate::program::BaseProgram::change_pulse_length(self, num, time)?)
            }

            #[pyo3(name = "change_pulse_position_change")]
            fn py_change_pulse_position_change(&mut self, num: i64, time: f64) -> ::pyo3::PyResult<bool> {
                Ok($crate::program::BaseProgram::change_pulse_position_change(self, num, time)?)
            }

            #[pyo3(name = "change_pulse_length_change")]
            fn py_change_pulse_length_change(&mut self, num: i64, time: f64) -> ::pyo3::PyResult<bool> {
                Ok($crate::program::BaseProgram::change_pulse_length_change(self, num, time)?)
            }

            #[pyo3(name = "shift", signature = (pulses=None))]
            fn py_shift(&mut self, pulses: Option<Vec<i64>>) -> ::pyo3::PyResult<bool> {
                Ok($crate::program::BaseProgram::shift_pulses(self, pulses.as_deref())?)
            }

            #[pyo3(name = "increment", signature = (pulses=None))]
            fn py_increment(&mut self, pulses: Option<Vec<i64>>) -> ::pyo3::PyResult<bool> {
                Ok($crate::program::BaseProgram::increment_pulses(self, pulses.as_deref())?)
            }

            #[pyo3(name = "reset", signature = (pulses=None))]
            fn py_reset(&mut self, pulses: Option<Vec<i64>>) -> ::pyo3::PyResult<()> {
                Ok($crate::program::BaseProgram::reset_pulses(self, pulses.as_deref())?)
            }

            #[pyo3(name = "get_pulse_function")]
            fn py_get_pulse_function(&self, num: i64) -> ::pyo3::PyResult<String> {
                Ok($crate::program::BaseProgram::get_pulse_function(self, num)?.to_string())
            }

            #[pyo3(name = "get_pulse_position")]
            fn py_get_pulse_position(&self, num: i64) -> ::pyo3::PyResult<f64> {
                Ok($crate::program::BaseProgram::get_pulse_position(self, num)?)
            }

            #[pyo3(name = "get_pulse_length")]
            fn py_get_pulse_length(&self, num: i64) -> ::pyo3::PyResult<f64> {
                Ok($crate::program::BaseProgram::get_pulse_length(self, num)?)
            }

            #[pyo3(name = "get_pulse_position_change")]
            fn py_get_pulse_position_change(&self, num: i64) -> ::pyo3::PyResult<f64> {
                Ok($crate::program::BaseProgram::get_pulse_position_change(self, num)?)
            }

            #[pyo3(name = "get_pulse_length_change")]
            fn py_get_pulse_length_change(&self, num: i64) -> ::pyo3::PyResult<f64> {
                Ok($crate::program::BaseProgram::get_pulse_length_change(self, num)?)
            }

            #[pyo3(name = "start")]
            fn py_start(&mut self) -> ::pyo3::PyResult<()> {
                Ok($crate::program::BaseProgram::start(self)?)
            }

            #[pyo3(name = "update")]
            fn py_update(&mut self) -> ::pyo3::PyResult<Vec<String>> {
                let ops = $crate::program::BaseProgram::update(self)?;
                Ok(ops.iter().map(|op| op.to_string()).collect())
            }

            #[pyo3(name = "end_of_test")]
            fn py_end_of_test(&mut self) -> ::pyo3::PyResult<String> {
                Ok($crate::program::BaseProgram::end_of_test(self)?.to_string())
            }

            #[pyo3(name = "is_running")]
            fn py_is_running(&self) -> bool {
                $crate::program::BaseProgram::is_running(self)
            }

            #[pyo3(name = "is_dirty")]
            fn py_is_dirty(&self) -> bool {
                $crate::program::BaseProgram::is_dirty(self)
            }

            #[pyo3(name = "sequence_length")]
            fn py_sequence_length(&self) -> ::pyo3::PyResult<f64> {
                Ok($crate::program::BaseProgram::sequence_length(self)?)
            }

            #[pyo3(name = "channel_image")]
            fn py_channel_image<'py>(&self, py: ::pyo3::Python<'py>, channel: usize) -> ::pyo3::PyResult<&'py ::numpy::PyArray2<u8>> {
                let image = $crate::program::BaseProgram::channel_image(self, channel)?;
                Ok(::numpy::PyArray::from_owned_array(py, image))
            }
        }
    };
    ($prog_type: ty, apply_ops = $apply: path) => {
        impl $crate::program::BaseProgram for $prog_type {
            fn state(&self) -> &$crate::program::ProgramState {
                &self.state
            }
            fn state_(&mut self) -> &mut $crate::program::ProgramState {
                &mut self.state
            }
            fn apply_ops(&mut self, ops: &[$crate::layout::HardwareOp]) -> $crate::error::Result<()> {
                $apply(self, ops)
            }
        }

        $crate::impl_program_boilerplate!(@python $prog_type);
    };
    ($prog_type: ty) => {
        impl $crate::program::BaseProgram for $prog_type {
            fn state(&self) -> &$crate::program::ProgramState {
                &self.state
            }
            fn state_(&mut self) -> &mut $crate::program::ProgramState {
                &mut self.state
            }
        }

        $crate::impl_program_boilerplate!(@python $prog_type);
    };
}

/// A pulse program compiled for a pulser without any bus attached: updates only produce the
/// hardware operations. See [`BaseProgram`] for the full surface.
#[cfg_attr(feature = "python", pyo3::pyclass)]
pub struct PulseProgram {
    state: ProgramState,
}

impl_program_boilerplate!(PulseProgram);

impl PulseProgram {
    pub fn new(config: ProgramConfig, mode: RunMode) -> Result<Self> {
        Ok(Self {
            state: ProgramState::new(config, mode)?,
        })
    }
}

#[cfg(feature = "python")]
#[pyo3::pymethods]
impl PulseProgram {
    #[new]
    #[pyo3(signature = (config_path=None, live=false))]
    fn py_new(config_path: Option<&str>, live: bool) -> pyo3::PyResult<Self> {
        let config = ProgramConfig::load(config_path.map(std::path::Path::new))?;
        let mode = if live {
            RunMode::Experiment
        } else {
            RunMode::Test
        };
        Ok(PulseProgram::new(config, mode)?)
    }
}
