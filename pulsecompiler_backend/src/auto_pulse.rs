//! Synthesis of automatic companion pulses.
//!
//! Functions may request a PULSE_SHAPE and/or a TWT companion for each of their pulses. A
//! companion covers its primary widened by a left and a right padding, expressed in the
//! companion function's own time frame (function delays are compensated). Companions are
//! recomputed from their primaries on every update, then checked and post-processed:
//!
//! - shape companions of different functions, or a shape companion and a manually defined
//!   PULSE_SHAPE pulse, must not overlap
//! - overlapping TWT companions (or ones closer than the minimum TWT gap) are merged by
//!   lengthening the earlier one and deactivating the later one
//! - shape/defense distances below their configured minimum are counted, not rejected

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::config::{Padding, ProgramConfig};
use crate::error::{PulseError, Result};
use crate::function::{AutoPulseSetup, Function, FunctionKind};
use crate::pulse::{Pulse, PulseNum, PulseSpan};
use crate::report::Diagnostics;
use crate::store::PulseStore;
use crate::utils::{Tick, Timebase};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Companion {
    Shape,
    Twt,
}

impl Companion {
    fn target(self) -> FunctionKind {
        match self {
            Companion::Shape => FunctionKind::PulseShape,
            Companion::Twt => FunctionKind::Twt,
        }
    }

    fn setup(self, function: &Function) -> Option<AutoPulseSetup> {
        match self {
            Companion::Shape => function.auto_shape(),
            Companion::Twt => function.auto_twt(),
        }
    }

    fn default_padding(self, config: &ProgramConfig) -> Padding {
        match self {
            Companion::Shape => config.default_shape_padding,
            Companion::Twt => config.default_twt_padding,
        }
    }

    fn link(self, pulse: &mut Pulse) -> &mut Option<PulseNum> {
        match self {
            Companion::Shape => &mut pulse.shape_companion,
            Companion::Twt => &mut pulse.twt_companion,
        }
    }
}

/// Recomputes all companion pulses and runs the checks depending on them.
pub fn synthesize(
    store: &mut PulseStore,
    functions: &mut IndexMap<FunctionKind, Function>,
    config: &ProgramConfig,
    timebase: &Timebase,
    diagnostics: &mut Diagnostics,
) -> Result<()> {
    place_companions(Companion::Shape, store, functions, config, timebase, diagnostics)?;
    place_companions(Companion::Twt, store, functions, config, timebase, diagnostics)?;
    check_shape_overlaps(store, functions)?;
    merge_twt_companions(store, functions, config, timebase)?;
    check_defense_distances(store, functions, config, timebase, diagnostics)
}

fn place_companions(
    companion: Companion,
    store: &mut PulseStore,
    functions: &mut IndexMap<FunctionKind, Function>,
    config: &ProgramConfig,
    timebase: &Timebase,
    diagnostics: &mut Diagnostics,
) -> Result<()> {
    let target = companion.target();
    let target_delay = functions.get(&target).map_or(0, |f| f.delay());
    let padding = companion.default_padding(config);
    let default_left = timebase.padding_ticks(padding.left)?;
    let default_right = timebase.padding_ticks(padding.right)?;

    let requests: Vec<(Tick, AutoPulseSetup, Vec<PulseNum>)> = functions
        .values()
        .filter_map(|f| {
            companion
                .setup(f)
                .map(|setup| (f.delay(), setup, f.pulses().to_vec()))
        })
        .collect();

    for (delay, setup, pulses) in requests {
        let offset = delay - target_delay;
        for num in pulses {
            let primary = store.get(num)?;
            let (pos, len, active) = (primary.pos(), primary.len(), primary.is_active());

            let existing = *companion.link(store.pulse_mut(num)?);
            let cnum = match existing {
                Some(cnum) => cnum,
                None => {
                    let cnum = store.create_companion(num, target);
                    *companion.link(store.pulse_mut(num)?) = Some(cnum);
                    if let Some(f) = functions.get_mut(&target) {
                        f.add_pulse(cnum);
                    }
                    debug!(primary = num, companion = cnum, function = %target, "created companion pulse");
                    cnum
                }
            };

            let (cpos, clen) = match (active, pos, len) {
                (true, Some(pos), Some(len)) => {
                    let start = pos + offset;
                    if start < 0 {
                        return Err(PulseError::TooEarly {
                            function: target.to_string(),
                            num,
                            short_by: -start,
                        });
                    }
                    let mut left = setup.left.unwrap_or(default_left);
                    let right = setup.right.unwrap_or(default_right);
                    if start < left {
                        debug!(primary = num, left, available = start, "reducing left padding");
                        left = start;
                        diagnostics.left_padding_reduced += 1;
                    }
                    (Some(start - left), Some(len + left + right))
                }
                // Follows its primary into inactivity
                _ => (pos.map(|p| (p + offset).max(0)), Some(0)),
            };
            let c = store.pulse_mut(cnum)?;
            c.pos = cpos;
            c.len = clen;
            c.merged_into = None;
            store.refresh(cnum)?;
        }
    }
    Ok(())
}

// Owning function and reported pulse number of a pulse on the PULSE_SHAPE function
fn shape_owner(store: &PulseStore, pulse: &Pulse) -> Result<(FunctionKind, PulseNum)> {
    match pulse.companion_of() {
        Some(primary) => {
            let kind = store.get(primary)?.function().unwrap_or(FunctionKind::PulseShape);
            Ok((kind, primary))
        }
        None => Ok((FunctionKind::PulseShape, pulse.num())),
    }
}

fn check_shape_overlaps(
    store: &PulseStore,
    functions: &IndexMap<FunctionKind, Function>,
) -> Result<()> {
    let Some(shape) = functions.get(&FunctionKind::PulseShape) else {
        return Ok(());
    };
    let mut entries = Vec::new();
    for &num in shape.pulses() {
        let pulse = store.get(num)?;
        if let Some(span) = pulse.span() {
            let (owner, reported) = shape_owner(store, pulse)?;
            entries.push((span, owner, reported, pulse.is_companion()));
        }
    }
    entries.sort_by_key(|e| e.0);

    for (i, (a, a_owner, a_num, a_companion)) in entries.iter().enumerate() {
        for (b, b_owner, b_num, b_companion) in &entries[i + 1..] {
            if b.pos >= a.end() {
                break;
            }
            // Two manual shape pulses are the layout's business, same-function paddings may touch
            let conflict = match (a_companion, b_companion) {
                (true, true) => a_owner != b_owner,
                (false, false) => false,
                _ => true,
            };
            if conflict {
                return Err(PulseError::ShapeOverlap {
                    first_function: a_owner.to_string(),
                    first: *a_num,
                    second_function: b_owner.to_string(),
                    second: *b_num,
                });
            }
        }
    }
    Ok(())
}

fn merge_twt_companions(
    store: &mut PulseStore,
    functions: &IndexMap<FunctionKind, Function>,
    config: &ProgramConfig,
    timebase: &Timebase,
) -> Result<()> {
    let Some(twt) = functions.get(&FunctionKind::Twt) else {
        return Ok(());
    };
    let min_gap = match config.min_twt_gap {
        Some(gap) => timebase.padding_ticks(gap)?,
        None => 0,
    };
    let mut spans = Vec::new();
    for &num in twt.pulses() {
        let pulse = store.get(num)?;
        if pulse.is_companion() {
            spans.extend(pulse.span());
        }
    }
    spans.sort();

    let mut spans = spans.into_iter();
    let Some(mut current) = spans.next() else {
        return Ok(());
    };
    for next in spans {
        if next.pos >= current.end() + min_gap {
            current = next;
            continue;
        }
        current.len = current.end().max(next.end()) - current.pos;
        store.pulse_mut(current.num)?.len = Some(current.len);
        store.refresh(current.num)?;
        let merged = store.pulse_mut(next.num)?;
        merged.len = Some(0);
        merged.merged_into = Some(current.num);
        store.refresh(next.num)?;
        debug!(into = current.num, merged = next.num, "merged TWT pulses");
    }
    Ok(())
}

fn delayed_spans(
    store: &PulseStore,
    functions: &IndexMap<FunctionKind, Function>,
    kind: FunctionKind,
) -> Result<Vec<PulseSpan>> {
    let Some(function) = functions.get(&kind) else {
        return Ok(Vec::new());
    };
    let mut spans = Vec::new();
    for &num in function.pulses() {
        if let Some(span) = store.get(num)?.span() {
            spans.push(span.shifted(function.delay()));
        }
    }
    Ok(spans)
}

fn check_defense_distances(
    store: &PulseStore,
    functions: &IndexMap<FunctionKind, Function>,
    config: &ProgramConfig,
    timebase: &Timebase,
    diagnostics: &mut Diagnostics,
) -> Result<()> {
    if config.min_shape_to_defense.is_none() && config.min_defense_to_shape.is_none() {
        return Ok(());
    }
    let min_s2d = config
        .min_shape_to_defense
        .map(|t| timebase.padding_ticks(t))
        .transpose()?;
    let min_d2s = config
        .min_defense_to_shape
        .map(|t| timebase.padding_ticks(t))
        .transpose()?;
    let shapes = delayed_spans(store, functions, FunctionKind::PulseShape)?;
    let defenses = delayed_spans(store, functions, FunctionKind::Defense)?;

    // The gap runs from the end of the earlier pulse to the start of the later one and is
    // negative when they overlap
    for s in &shapes {
        for d in &defenses {
            if s.pos <= d.pos {
                let gap = d.pos - s.end();
                if min_s2d.map_or(false, |min| gap < min) {
                    warn!(shape = s.num, defense = d.num, gap, "defense pulse too close after shape pulse");
                    diagnostics.shape_to_defense += 1;
                }
            } else {
                let gap = s.pos - d.end();
                if min_d2s.map_or(false, |min| gap < min) {
                    warn!(defense = d.num, shape = s.num, gap, "shape pulse too close after defense pulse");
                    diagnostics.defense_to_shape += 1;
                }
            }
        }
    }
    Ok(())
}
