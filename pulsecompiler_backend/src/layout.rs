//! Layout and timing validation for the two hardware families.
//!
//! A [`Layout`] takes the phase matrices of all used functions and stages the next hardware
//! state without committing it:
//!
//! - [`BitmapLayout`] paints every channel's pending [`HardwareImage`](crate::image::HardwareImage)
//!   row by row and reports the differing runs as [`HardwareOp::SetRun`]s.
//! - [`DelayChainLayout`] turns the gaps between consecutive pulses of a function into delay
//!   element values and reports changed elements as [`HardwareOp::SetElement`] or
//!   [`HardwareOp::DisableElement`]. Pulsers without length elements share one length per
//!   function, carried over from its last pulse and written as [`HardwareOp::SetLength`].
//!
//! Both validate overlaps, the hardware's maximum sequence length and the repetition period
//! before touching any pending state.

use std::fmt;

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::channel::{BaseChannel, Channel, ChannelAddr};
use crate::config::{HardwareFamily, ProgramConfig};
use crate::error::{PulseError, Result};
use crate::function::{Function, FunctionKind};
use crate::image::Level;
use crate::phase::PhaseMatrix;
use crate::pulse::{PulseNum, PulseSpan};
use crate::report::Diagnostics;
use crate::store::PulseStore;
use crate::utils::{round_ticks, Tick};

/// One hardware write produced by an update.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HardwareOp {
    SetRun {
        channel: usize,
        field: usize,
        bit: usize,
        level: Level,
        start: Tick,
        len: Tick,
    },
    SetElement {
        function: FunctionKind,
        index: usize,
        ticks: Tick,
    },
    DisableElement {
        function: FunctionKind,
        index: usize,
    },
    SetLength {
        function: FunctionKind,
        ticks: Tick,
    },
}

impl fmt::Display for HardwareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HardwareOp::SetRun {
                channel,
                field,
                bit,
                level,
                start,
                len,
            } => write!(
                f,
                "SetRun(ch {}, field {}, bit {}, {:?}, {}+{})",
                channel, field, bit, level, start, len
            ),
            HardwareOp::SetElement {
                function,
                index,
                ticks,
            } => write!(f, "SetElement({}[{}] = {})", function, index, ticks),
            HardwareOp::DisableElement { function, index } => {
                write!(f, "DisableElement({}[{}])", function, index)
            }
            HardwareOp::SetLength { function, ticks } => {
                write!(f, "SetLength({} = {})", function, ticks)
            }
        }
    }
}

pub struct LayoutInput<'a> {
    pub functions: &'a IndexMap<FunctionKind, Function>,
    pub matrices: &'a IndexMap<FunctionKind, PhaseMatrix>,
    pub store: &'a PulseStore,
    pub config: &'a ProgramConfig,
    /// Timebase in seconds
    pub timebase: f64,
    /// Shift applied to every function so the most negative delay lands at tick 0
    pub global_delay: Tick,
}

impl<'a> LayoutInput<'a> {
    fn offset(&self, kind: FunctionKind) -> Tick {
        self.functions.get(&kind).map_or(0, |f| f.delay()) + self.global_delay
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LayoutSummary {
    /// End of the last pulse of each function, delays included
    pub lengths: IndexMap<FunctionKind, Tick>,
    pub rows: usize,
}

impl LayoutSummary {
    pub fn sequence_length(&self) -> Tick {
        self.lengths.values().copied().max().unwrap_or(0)
    }
}

pub trait Layout: Send {
    fn family(&self) -> HardwareFamily;

    /// Validates the pulse state and stages it as pending hardware state.
    fn lay_out(
        &mut self,
        input: &LayoutInput<'_>,
        channels: &mut IndexMap<usize, Channel>,
        diagnostics: &mut Diagnostics,
    ) -> Result<LayoutSummary>;

    /// Operations turning the committed hardware state into the pending one.
    fn pending_ops(&self, channels: &IndexMap<usize, Channel>) -> Vec<HardwareOp>;

    /// Makes the pending state the committed one.
    fn commit(&mut self, channels: &mut IndexMap<usize, Channel>);
}

pub fn layout_for(family: HardwareFamily) -> Box<dyn Layout> {
    match family {
        HardwareFamily::Bitmap => Box::new(BitmapLayout::default()),
        HardwareFamily::DelayChain => Box::new(DelayChainLayout::default()),
    }
}

// Active pulses among `nums`, moved to hardware time and sorted by start
fn spans_of(store: &PulseStore, nums: &[PulseNum], offset: Tick) -> Result<Vec<PulseSpan>> {
    let mut spans = Vec::with_capacity(nums.len());
    for &num in nums {
        if let Some(span) = store.get(num)?.span() {
            spans.push(span.shifted(offset));
        }
    }
    spans.sort();
    Ok(spans)
}

/// Fails on the first pair of overlapping spans. `spans` must be sorted. Overlaps between two
/// synthesized companions are allowed, they paint the same line.
pub fn check_overlaps(kind: FunctionKind, store: &PulseStore, spans: &[PulseSpan]) -> Result<()> {
    let mut reach: Option<PulseSpan> = None;
    for span in spans {
        let Some(prev) = reach else {
            reach = Some(*span);
            continue;
        };
        if prev.overlaps(span)
            && !(store.get(prev.num)?.is_companion() && store.get(span.num)?.is_companion())
        {
            return Err(PulseError::Overlap {
                function: kind.to_string(),
                first: prev.num,
                second: span.num,
            });
        }
        if span.end() > prev.end() {
            reach = Some(*span);
        }
    }
    Ok(())
}

/// Checks every function's sequence against the hardware limit and the repetition period.
pub fn check_global(summary: &LayoutSummary, config: &ProgramConfig, timebase: f64) -> Result<()> {
    for (kind, &length) in &summary.lengths {
        if length > config.max_ticks {
            return Err(PulseError::SequenceTooLong {
                function: kind.to_string(),
                length,
                max: config.max_ticks,
            });
        }
        if let Some(period) = config.repetition_period {
            let duration = length as f64 * timebase;
            // Half a tick of slack for float noise
            if duration > period + 0.5 * timebase {
                return Err(PulseError::PeriodExceeded {
                    function: kind.to_string(),
                    length: duration,
                    period,
                });
            }
        }
    }
    Ok(())
}

/// Number of window starts (one per TWT pulse start) where the TWT is on for more than
/// `max_on` ticks within the following `window` ticks.
pub fn count_duty_violations(spans: &[PulseSpan], window: Tick, max_on: f64) -> usize {
    let mut violations = 0;
    for start in spans.iter().map(|s| s.pos) {
        let end = start + window;
        let on: Tick = spans
            .iter()
            .filter(|t| t.pos < end && t.end() > start)
            .map(|t| t.end().min(end) - t.pos.max(start))
            .sum();
        if on as f64 > max_on {
            violations += 1;
        }
    }
    violations
}

#[derive(Debug, Default)]
pub struct BitmapLayout {
    next_line: usize,
}

impl BitmapLayout {
    fn allocate(&mut self, config: &ProgramConfig, kind: FunctionKind) -> Result<ChannelAddr> {
        let lines = config.bit_lines();
        if self.next_line >= lines {
            return Err(PulseError::ResourceExhausted {
                function: kind.to_string(),
                resource: "bit-lines".to_string(),
                required: self.next_line + 1,
                available: lines,
            });
        }
        let line = self.next_line;
        self.next_line += 1;
        Ok(ChannelAddr::Bitmap {
            field: line / config.bits_per_field,
            bit: line % config.bits_per_field,
        })
    }
}

// Spans of one channel, one entry per row of its function's matrix
struct ChannelPlan {
    channel: usize,
    rows: Vec<Vec<PulseSpan>>,
}

impl Layout for BitmapLayout {
    fn family(&self) -> HardwareFamily {
        HardwareFamily::Bitmap
    }

    fn lay_out(
        &mut self,
        input: &LayoutInput<'_>,
        channels: &mut IndexMap<usize, Channel>,
        diagnostics: &mut Diagnostics,
    ) -> Result<LayoutSummary> {
        let config = input.config;
        let rows = input.matrices.values().map(|m| m.rows()).max().unwrap_or(1).max(1);
        let mut summary = LayoutSummary {
            rows,
            ..Default::default()
        };
        let mut plans = Vec::new();
        let mut duty_violations = 0;

        for (&kind, matrix) in input.matrices {
            let function = &input.functions[&kind];
            let offset = input.offset(kind);
            let mut length = 0;
            for col in 0..matrix.cols() {
                let Some(&channel) = function.channels().get(col) else {
                    continue;
                };
                let mut per_row = Vec::with_capacity(matrix.rows());
                for row in 0..matrix.rows() {
                    let spans = spans_of(input.store, matrix.cell(row, col), offset)?;
                    check_overlaps(kind, input.store, &spans)?;
                    length = spans.iter().map(|s| s.end()).fold(length, Tick::max);
                    per_row.push(spans);
                }
                plans.push(ChannelPlan {
                    channel,
                    rows: per_row,
                });
            }
            if let (FunctionKind::Twt, Some(duty)) = (kind, config.duty_cycle) {
                let window = (duty.window / input.timebase).round() as Tick;
                let max_on = duty.max_ratio * window as f64;
                let mut all: Vec<PulseSpan> = Vec::new();
                for &num in function.pulses() {
                    all.extend(input.store.get(num)?.span().map(|s| s.shifted(offset)));
                }
                all.sort();
                duty_violations += count_duty_violations(&all, window, max_on);
            }
            summary.lengths.insert(kind, length);
        }
        check_global(&summary, config, input.timebase)?;

        for plan in plans.iter().filter(|p| p.rows.iter().any(|r| !r.is_empty())) {
            let chan = channels.get_mut(&plan.channel).ok_or_else(|| {
                PulseError::Config(format!("channel {} does not exist", plan.channel))
            })?;
            let kind = chan.function();
            chan.ensure_address(|| self.allocate(config, kind))?;
        }
        // Inverted outputs idle high, they are driven even without active pulses
        for function in input.functions.values().filter(|f| f.is_inverted()) {
            for id in function.channels() {
                let chan = channels.get_mut(id).ok_or_else(|| {
                    PulseError::Config(format!("channel {} does not exist", id))
                })?;
                chan.ensure_address(|| self.allocate(config, function.kind()))?;
            }
        }

        if duty_violations > 0 {
            warn!(count = duty_violations, "TWT duty cycle exceeded");
            diagnostics.duty_cycle += duty_violations;
        }

        // Every addressed channel is repainted, idle ones stay at their idle level
        let window = config.max_ticks as usize;
        for chan in channels.values_mut().filter(|c| c.is_addressed()) {
            let idle = u8::from(
                input
                    .functions
                    .get(&chan.function())
                    .map_or(false, |f| f.is_inverted()),
            );
            chan.image_for(rows, window).clear_pending(idle);
        }
        for plan in plans {
            let Some(chan) = channels.get_mut(&plan.channel) else {
                continue;
            };
            if !chan.is_addressed() {
                continue;
            }
            let inverted = input
                .functions
                .get(&chan.function())
                .map_or(false, |f| f.is_inverted());
            let on = u8::from(!inverted);
            let image = chan.image_for(rows, window);
            for row in 0..rows {
                for span in &plan.rows[row % plan.rows.len()] {
                    image.paint(row, span.pos as usize, span.len as usize, on);
                }
            }
        }
        debug!(rows, length = summary.sequence_length(), "bitmap layout staged");
        Ok(summary)
    }

    fn pending_ops(&self, channels: &IndexMap<usize, Channel>) -> Vec<HardwareOp> {
        let mut ops = Vec::new();
        for chan in channels.values() {
            let (Some(ChannelAddr::Bitmap { field, bit }), Some(image)) =
                (chan.address(), chan.image())
            else {
                continue;
            };
            ops.extend(image.diff().map(|run| HardwareOp::SetRun {
                channel: chan.id(),
                field,
                bit,
                level: run.level,
                start: run.start,
                len: run.len,
            }));
        }
        ops
    }

    fn commit(&mut self, channels: &mut IndexMap<usize, Channel>) {
        for chan in channels.values_mut() {
            if let Some(image) = chan.image_() {
                image.commit();
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct DelayChainLayout {
    next_chain: usize,
    committed: IndexMap<FunctionKind, Vec<Tick>>,
    pending: IndexMap<FunctionKind, Vec<Tick>>,
    committed_len: IndexMap<FunctionKind, Tick>,
    remembered_len: IndexMap<FunctionKind, Tick>,
}

impl DelayChainLayout {
    fn allocate(&mut self, config: &ProgramConfig, kind: FunctionKind) -> Result<ChannelAddr> {
        let chains = config.delay_chain.chains;
        if self.next_chain >= chains {
            return Err(PulseError::ResourceExhausted {
                function: kind.to_string(),
                resource: "delay chains".to_string(),
                required: self.next_chain + 1,
                available: chains,
            });
        }
        let position = self.next_chain;
        self.next_chain += 1;
        Ok(ChannelAddr::Chain { position })
    }

    /// Pulse length carried over from the last pulse of a function when the pulser has no
    /// length elements.
    pub fn remembered_len(&self, kind: FunctionKind) -> Option<Tick> {
        self.remembered_len.get(&kind).copied()
    }

    pub fn committed_elements(&self, kind: FunctionKind) -> &[Tick] {
        self.committed.get(&kind).map_or(&[][..], |v| v.as_slice())
    }
}

impl Layout for DelayChainLayout {
    fn family(&self) -> HardwareFamily {
        HardwareFamily::DelayChain
    }

    fn lay_out(
        &mut self,
        input: &LayoutInput<'_>,
        channels: &mut IndexMap<usize, Channel>,
        diagnostics: &mut Diagnostics,
    ) -> Result<LayoutSummary> {
        let config = input.config;
        let chain = &config.delay_chain;
        let intrinsic = chain.intrinsic_delay / input.timebase;
        let mut summary = LayoutSummary {
            rows: 1,
            ..Default::default()
        };
        let mut pending = IndexMap::new();
        let mut remembered = IndexMap::new();
        let mut shifts = 0;

        for (&kind, matrix) in input.matrices {
            if matrix.rows() > 1 {
                return Err(PulseError::Config(format!(
                    "function {}: phase cycling is not available on delay-chain pulsers",
                    kind
                )));
            }
            let spans = spans_of(input.store, matrix.cell(0, 0), input.offset(kind))?;
            check_overlaps(kind, input.store, &spans)?;
            let Some(last) = spans.last() else {
                continue;
            };

            let per_pulse = if chain.has_length_element { 2 } else { 1 };
            let required = spans.len() * per_pulse;
            let available = chain.elements_for(kind);
            if required > available {
                return Err(PulseError::ResourceExhausted {
                    function: kind.to_string(),
                    resource: "delay elements".to_string(),
                    required,
                    available,
                });
            }

            let mut values = Vec::with_capacity(required);
            let mut edge = 0;
            for span in &spans {
                let exact = (span.pos - edge) as f64 - intrinsic;
                let (ticks, correction) = round_ticks(exact);
                if ticks < 0 {
                    return Err(PulseError::TooEarly {
                        function: kind.to_string(),
                        num: span.num,
                        short_by: -ticks,
                    });
                }
                if correction.abs() > config.precision {
                    warn!(function = %kind, pulse = span.num, correction, "pulse timing shifted by rounding");
                    shifts += 1;
                }
                values.push(ticks);
                if chain.has_length_element {
                    values.push(span.len);
                    edge = span.end();
                } else {
                    edge = span.pos;
                }
            }
            if !chain.has_length_element {
                for span in spans.iter().filter(|s| s.len != last.len) {
                    warn!(function = %kind, pulse = span.num, len = span.len, shared = last.len, "pulse takes the length of the last pulse");
                    shifts += 1;
                }
                remembered.insert(kind, last.len);
            }
            summary
                .lengths
                .insert(kind, spans.iter().map(|s| s.end()).max().unwrap_or(0));
            pending.insert(kind, values);
        }
        check_global(&summary, config, input.timebase)?;

        for &kind in pending.keys() {
            let Some(chan) = input
                .functions
                .get(&kind)
                .and_then(|f| f.channels().first())
                .and_then(|id| channels.get_mut(id))
            else {
                continue;
            };
            chan.ensure_address(|| self.allocate(config, kind))?;
        }

        diagnostics.timing_shifts += shifts;
        self.pending = pending;
        self.remembered_len = remembered;
        debug!(functions = self.pending.len(), "delay-chain layout staged");
        Ok(summary)
    }

    fn pending_ops(&self, _channels: &IndexMap<usize, Channel>) -> Vec<HardwareOp> {
        let mut ops = Vec::new();
        for kind in FunctionKind::ALL {
            let old = self.committed.get(&kind).map_or(&[][..], |v| v.as_slice());
            let new = self.pending.get(&kind).map_or(&[][..], |v| v.as_slice());
            for index in 0..old.len().max(new.len()) {
                match (old.get(index), new.get(index)) {
                    (Some(a), Some(b)) if a == b => {}
                    (_, Some(&ticks)) => ops.push(HardwareOp::SetElement {
                        function: kind,
                        index,
                        ticks,
                    }),
                    (Some(_), None) => ops.push(HardwareOp::DisableElement {
                        function: kind,
                        index,
                    }),
                    (None, None) => {}
                }
            }
            if let Some(&ticks) = self.remembered_len.get(&kind) {
                if self.committed_len.get(&kind) != Some(&ticks) {
                    ops.push(HardwareOp::SetLength {
                        function: kind,
                        ticks,
                    });
                }
            }
        }
        ops
    }

    fn commit(&mut self, _channels: &mut IndexMap<usize, Channel>) {
        self.committed = self.pending.clone();
        self.committed_len = self.remembered_len.clone();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::Property;

    fn span(num: PulseNum, pos: Tick, len: Tick) -> PulseSpan {
        PulseSpan { num, pos, len }
    }

    struct Fixture {
        store: PulseStore,
        functions: IndexMap<FunctionKind, Function>,
        channels: IndexMap<usize, Channel>,
        config: ProgramConfig,
        diagnostics: Diagnostics,
    }

    impl Fixture {
        fn new(config: ProgramConfig) -> Self {
            Self {
                store: PulseStore::new(),
                functions: FunctionKind::ALL
                    .iter()
                    .map(|&k| (k, Function::new(k)))
                    .collect(),
                channels: IndexMap::new(),
                config,
                diagnostics: Diagnostics::default(),
            }
        }

        fn channel(&mut self, kind: FunctionKind, id: usize) {
            self.functions[&kind].add_channel(id).unwrap();
            self.channels.insert(id, Channel::new(id, kind));
        }

        fn pulse(&mut self, num: PulseNum, kind: FunctionKind, pos: Tick, len: Tick) {
            self.store.new_pulse(num).unwrap();
            self.store.set_function(num, kind).unwrap();
            self.store.set_position(num, pos).unwrap();
            self.store.set_length(num, len).unwrap();
            self.functions[&kind].add_pulse(num);
        }

        fn lay_out(&mut self, layout: &mut dyn Layout) -> Result<LayoutSummary> {
            let mut matrices = IndexMap::new();
            for (kind, f) in &self.functions {
                if f.is_used() {
                    matrices.insert(*kind, PhaseMatrix::build(f, &self.store, &IndexMap::new())?);
                }
            }
            let input = LayoutInput {
                functions: &self.functions,
                matrices: &matrices,
                store: &self.store,
                config: &self.config,
                timebase: 1e-8,
                global_delay: 0,
            };
            layout.lay_out(&input, &mut self.channels, &mut self.diagnostics)
        }
    }

    #[test]
    fn overlap_detection() {
        let mut store = PulseStore::new();
        for num in 1..=3 {
            store.new_pulse(num).unwrap();
        }
        let spans = vec![span(1, 0, 10), span(2, 10, 5), span(3, 12, 1)];
        match check_overlaps(FunctionKind::Mw, &store, &spans) {
            Err(PulseError::Overlap { first, second, .. }) => assert_eq!((first, second), (2, 3)),
            other => panic!("unexpected {:?}", other),
        }
        let touching = vec![span(1, 0, 10), span(2, 10, 5)];
        check_overlaps(FunctionKind::Mw, &store, &touching).unwrap();
    }

    #[test]
    fn duty_cycle_windows() {
        // 100 tick window, at most 50 on
        let spans = vec![span(1, 0, 30), span(2, 40, 30), span(3, 500, 10)];
        assert_eq!(count_duty_violations(&spans, 100, 50.), 1);
        assert_eq!(count_duty_violations(&spans, 100, 60.), 0);
    }

    #[test]
    fn global_limits() {
        let mut config = ProgramConfig::default();
        config.max_ticks = 100;
        config.repetition_period = Some(5e-7);
        let mut summary = LayoutSummary::default();
        summary.lengths.insert(FunctionKind::Mw, 40);
        check_global(&summary, &config, 1e-8).unwrap();
        summary.lengths.insert(FunctionKind::Detection, 60);
        assert!(matches!(
            check_global(&summary, &config, 1e-8),
            Err(PulseError::PeriodExceeded { .. })
        ));
        summary.lengths.insert(FunctionKind::Detection, 101);
        assert!(matches!(
            check_global(&summary, &config, 1e-8),
            Err(PulseError::SequenceTooLong { length: 101, .. })
        ));
    }

    #[test]
    fn bitmap_moves_produce_minimal_runs() {
        let mut fx = Fixture::new(ProgramConfig::default());
        fx.channel(FunctionKind::Mw, 3);
        fx.pulse(1, FunctionKind::Mw, 100, 20);
        let mut layout = BitmapLayout::default();
        fx.lay_out(&mut layout).unwrap();
        let ops = layout.pending_ops(&fx.channels);
        assert_eq!(
            ops,
            vec![HardwareOp::SetRun {
                channel: 3,
                field: 0,
                bit: 0,
                level: Level::High,
                start: 100,
                len: 20
            }]
        );
        layout.commit(&mut fx.channels);
        fx.lay_out(&mut layout).unwrap();
        assert!(layout.pending_ops(&fx.channels).is_empty());

        fx.store.change(1, Property::Position, 150).unwrap();
        fx.lay_out(&mut layout).unwrap();
        let ops = layout.pending_ops(&fx.channels);
        assert_eq!(ops.len(), 2);
        assert!(matches!(ops[0], HardwareOp::SetRun { level: Level::Low, start: 100, len: 20, .. }));
        assert!(matches!(ops[1], HardwareOp::SetRun { level: Level::High, start: 150, len: 20, .. }));
    }

    #[test]
    fn bitmap_lines_run_out() {
        let mut config = ProgramConfig::default();
        config.fields = 1;
        config.bits_per_field = 1;
        let mut fx = Fixture::new(config);
        fx.channel(FunctionKind::Mw, 0);
        fx.channel(FunctionKind::Detection, 1);
        fx.pulse(1, FunctionKind::Mw, 0, 10);
        fx.pulse(2, FunctionKind::Detection, 0, 10);
        let mut layout = BitmapLayout::default();
        assert!(matches!(
            fx.lay_out(&mut layout),
            Err(PulseError::ResourceExhausted { .. })
        ));
    }

    #[test]
    fn inverted_function_idles_high() {
        let mut fx = Fixture::new(ProgramConfig::default());
        fx.channel(FunctionKind::Detection, 5);
        fx.functions[&FunctionKind::Detection].set_inverted(true);
        fx.pulse(1, FunctionKind::Detection, 10, 5);
        let mut layout = BitmapLayout::default();
        fx.lay_out(&mut layout).unwrap();
        let image = fx.channels[&5].image().unwrap().pending();
        assert_eq!(image[[0, 0]], 1);
        assert_eq!(image[[0, 12]], 0);
        assert_eq!(image[[0, 15]], 1);
    }

    #[test]
    fn inverted_function_without_pulses_is_driven_high() {
        let mut fx = Fixture::new(ProgramConfig::default());
        fx.channel(FunctionKind::Mw, 3);
        fx.channel(FunctionKind::Detection, 5);
        fx.functions[&FunctionKind::Detection].set_inverted(true);
        fx.pulse(1, FunctionKind::Mw, 100, 20);
        let mut layout = BitmapLayout::default();
        fx.lay_out(&mut layout).unwrap();

        assert_eq!(fx.channels[&5].address(), Some(ChannelAddr::Bitmap { field: 0, bit: 1 }));
        let ops = layout.pending_ops(&fx.channels);
        assert!(ops.contains(&HardwareOp::SetRun {
            channel: 5,
            field: 0,
            bit: 1,
            level: Level::High,
            start: 0,
            len: 65536
        }));
        layout.commit(&mut fx.channels);
        fx.lay_out(&mut layout).unwrap();
        assert!(layout.pending_ops(&fx.channels).is_empty());
    }

    #[test]
    fn delay_chain_elements() {
        let mut config = ProgramConfig::default();
        config.family = HardwareFamily::DelayChain;
        let mut fx = Fixture::new(config);
        fx.channel(FunctionKind::Mw, 0);
        fx.pulse(1, FunctionKind::Mw, 100, 20);
        fx.pulse(2, FunctionKind::Mw, 200, 20);
        // MW has 3 elements by default, two pulses with length elements need 4
        let mut layout = DelayChainLayout::default();
        assert!(matches!(
            fx.lay_out(&mut layout),
            Err(PulseError::ResourceExhausted { required: 4, available: 3, .. })
        ));

        fx.config.delay_chain.has_length_element = false;
        let summary = fx.lay_out(&mut layout).unwrap();
        assert_eq!(summary.lengths[&FunctionKind::Mw], 220);
        assert_eq!(layout.remembered_len(FunctionKind::Mw), Some(20));
        let ops = layout.pending_ops(&fx.channels);
        assert_eq!(
            ops,
            vec![
                HardwareOp::SetElement { function: FunctionKind::Mw, index: 0, ticks: 100 },
                HardwareOp::SetElement { function: FunctionKind::Mw, index: 1, ticks: 100 },
                HardwareOp::SetLength { function: FunctionKind::Mw, ticks: 20 },
            ]
        );
        layout.commit(&mut fx.channels);
        assert_eq!(layout.committed_elements(FunctionKind::Mw), &[100, 100]);

        // Second pulse switched off: its element gets disabled
        fx.store.change(2, Property::Length, 0).unwrap();
        fx.lay_out(&mut layout).unwrap();
        assert_eq!(
            layout.pending_ops(&fx.channels),
            vec![HardwareOp::DisableElement { function: FunctionKind::Mw, index: 1 }]
        );
    }

    #[test]
    fn delay_chain_shared_length() {
        let mut config = ProgramConfig::default();
        config.family = HardwareFamily::DelayChain;
        config.delay_chain.has_length_element = false;
        let mut fx = Fixture::new(config);
        fx.channel(FunctionKind::Mw, 0);
        fx.pulse(1, FunctionKind::Mw, 100, 20);
        fx.pulse(2, FunctionKind::Mw, 200, 20);
        let mut layout = DelayChainLayout::default();
        fx.lay_out(&mut layout).unwrap();
        layout.commit(&mut fx.channels);

        fx.store.change(2, Property::Length, 50).unwrap();
        fx.lay_out(&mut layout).unwrap();
        assert_eq!(
            layout.pending_ops(&fx.channels),
            vec![HardwareOp::SetLength { function: FunctionKind::Mw, ticks: 50 }]
        );
        // Pulse #1 cannot keep its own length
        assert_eq!(fx.diagnostics.timing_shifts, 1);
        layout.commit(&mut fx.channels);
        fx.lay_out(&mut layout).unwrap();
        assert!(layout.pending_ops(&fx.channels).is_empty());
    }

    #[test]
    fn delay_chain_rounding_and_too_early() {
        let mut config = ProgramConfig::default();
        config.family = HardwareFamily::DelayChain;
        config.delay_chain.has_length_element = false;
        config.delay_chain.intrinsic_delay = 3e-9;
        let mut fx = Fixture::new(config);
        fx.channel(FunctionKind::Detection, 0);
        fx.pulse(1, FunctionKind::Detection, 10, 5);
        let mut layout = DelayChainLayout::default();
        fx.lay_out(&mut layout).unwrap();
        // 10 - 0.3 rounds to 10, a 0.3 tick shift
        assert_eq!(fx.diagnostics.timing_shifts, 1);
        assert_eq!(
            layout.pending_ops(&fx.channels),
            vec![
                HardwareOp::SetElement { function: FunctionKind::Detection, index: 0, ticks: 10 },
                HardwareOp::SetLength { function: FunctionKind::Detection, ticks: 5 },
            ]
        );

        let mut config = ProgramConfig::default();
        config.family = HardwareFamily::DelayChain;
        config.delay_chain.has_length_element = false;
        config.delay_chain.intrinsic_delay = 1e-7;
        let mut fx = Fixture::new(config);
        fx.channel(FunctionKind::Detection, 0);
        fx.pulse(1, FunctionKind::Detection, 4, 5);
        let mut layout = DelayChainLayout::default();
        assert!(matches!(
            fx.lay_out(&mut layout),
            Err(PulseError::TooEarly { num: 1, short_by: 6, .. })
        ));
    }
}
