// Pulse records and the sortable span snapshots used by layout and overlap checks
use std::cmp::Ordering;
use std::fmt;

use crate::function::FunctionKind;
use crate::utils::Tick;

/// Pulse identifier. User pulses are non-negative, synthesized companions count down from -1.
pub type PulseNum = i64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PulseSnapshot {
    pub pos: Option<Tick>,
    pub len: Option<Tick>,
    pub dpos: Option<Tick>,
    pub dlen: Option<Tick>,
}

#[derive(Clone, Debug)]
pub struct Pulse {
    num: PulseNum,
    pub(crate) function: Option<FunctionKind>,
    pub(crate) pos: Option<Tick>,
    pub(crate) len: Option<Tick>,
    pub(crate) dpos: Option<Tick>,
    pub(crate) dlen: Option<Tick>,
    pub(crate) phase_sequence: Option<usize>,
    is_active: bool,
    has_been_active: bool,
    // Hardware view as of the last commit
    was_active: bool,
    committed: Option<(Tick, Tick)>,
    pub(crate) initial: PulseSnapshot,
    pub(crate) shape_companion: Option<PulseNum>,
    pub(crate) twt_companion: Option<PulseNum>,
    pub(crate) companion_of: Option<PulseNum>,
    pub(crate) merged_into: Option<PulseNum>,
}

impl Pulse {
    pub fn new(num: PulseNum) -> Self {
        Self {
            num,
            function: None,
            pos: None,
            len: None,
            dpos: None,
            dlen: None,
            phase_sequence: None,
            is_active: false,
            has_been_active: false,
            was_active: false,
            committed: None,
            initial: PulseSnapshot::default(),
            shape_companion: None,
            twt_companion: None,
            companion_of: None,
            merged_into: None,
        }
    }

    pub fn num(&self) -> PulseNum {
        self.num
    }
    pub fn function(&self) -> Option<FunctionKind> {
        self.function
    }
    pub fn pos(&self) -> Option<Tick> {
        self.pos
    }
    pub fn len(&self) -> Option<Tick> {
        self.len
    }
    pub fn dpos(&self) -> Option<Tick> {
        self.dpos
    }
    pub fn dlen(&self) -> Option<Tick> {
        self.dlen
    }
    pub fn phase_sequence(&self) -> Option<usize> {
        self.phase_sequence
    }
    pub fn is_active(&self) -> bool {
        self.is_active
    }
    pub fn was_active(&self) -> bool {
        self.was_active
    }
    pub fn has_been_active(&self) -> bool {
        self.has_been_active
    }
    pub fn is_companion(&self) -> bool {
        self.companion_of.is_some()
    }
    pub fn companion_of(&self) -> Option<PulseNum> {
        self.companion_of
    }
    pub fn shape_companion(&self) -> Option<PulseNum> {
        self.shape_companion
    }
    pub fn twt_companion(&self) -> Option<PulseNum> {
        self.twt_companion
    }
    pub fn merged_into(&self) -> Option<PulseNum> {
        self.merged_into
    }

    pub fn snapshot(&self) -> PulseSnapshot {
        PulseSnapshot {
            pos: self.pos,
            len: self.len,
            dpos: self.dpos,
            dlen: self.dlen,
        }
    }

    pub(crate) fn restore(&mut self, snapshot: PulseSnapshot) {
        self.pos = snapshot.pos;
        self.len = snapshot.len;
        self.dpos = snapshot.dpos;
        self.dlen = snapshot.dlen;
    }

    // Active exactly when both position and a positive length are known
    pub(crate) fn refresh_activity(&mut self) {
        self.is_active = self.pos.is_some() && self.len.map_or(false, |len| len > 0);
        self.has_been_active |= self.is_active;
    }

    /// Whether the hardware view differs from what was committed last.
    pub fn differs_from_committed(&self) -> bool {
        if self.is_active != self.was_active {
            return true;
        }
        self.is_active && self.committed != self.pos.zip(self.len)
    }

    pub(crate) fn mark_committed(&mut self) {
        self.was_active = self.is_active;
        self.committed = if self.is_active {
            self.pos.zip(self.len)
        } else {
            None
        };
    }

    pub fn span(&self) -> Option<PulseSpan> {
        if !self.is_active {
            return None;
        }
        Some(PulseSpan {
            num: self.num,
            pos: self.pos?,
            len: self.len?,
        })
    }
}

impl fmt::Display for Pulse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: Option<Tick>| v.map_or_else(|| "-".to_string(), |v| v.to_string());
        write!(
            f,
            "Pulse(#{}, {}, pos {}, len {}, {})",
            self.num,
            self.function.map_or("unassigned", |k| k.name()),
            show(self.pos),
            show(self.len),
            if self.is_active { "active" } else { "inactive" }
        )
    }
}

/// A value snapshot of an active pulse, taken before sorting. Ordering is by start position,
/// ties broken by pulse number, and never reads the pulse store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PulseSpan {
    pub num: PulseNum,
    pub pos: Tick,
    pub len: Tick,
}

impl PulseSpan {
    pub fn end(&self) -> Tick {
        self.pos + self.len
    }

    pub fn shifted(&self, offset: Tick) -> Self {
        Self {
            pos: self.pos + offset,
            ..*self
        }
    }

    /// Two spans overlap when they start together or one starts strictly inside the other.
    /// Touching spans (`a.end() == b.pos`) do not overlap.
    pub fn overlaps(&self, other: &PulseSpan) -> bool {
        self.pos == other.pos
            || (self.pos < other.pos && self.end() > other.pos)
            || (other.pos < self.pos && other.end() > self.pos)
    }
}

impl Ord for PulseSpan {
    fn cmp(&self, other: &Self) -> Ordering {
        self.pos
            .cmp(&other.pos)
            .then(self.num.cmp(&other.num))
            .then(self.len.cmp(&other.len))
    }
}

impl PartialOrd for PulseSpan {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn span(num: PulseNum, pos: Tick, len: Tick) -> PulseSpan {
        PulseSpan { num, pos, len }
    }

    #[test]
    fn overlap_rule() {
        assert!(span(1, 0, 10).overlaps(&span(2, 0, 5)));
        assert!(span(1, 0, 10).overlaps(&span(2, 9, 5)));
        assert!(span(2, 9, 5).overlaps(&span(1, 0, 10)));
        assert!(!span(1, 0, 10).overlaps(&span(2, 10, 5)));
        assert!(!span(2, 10, 5).overlaps(&span(1, 0, 10)));
    }

    #[test]
    fn ordering_is_by_position_then_number() {
        let mut spans = vec![span(3, 20, 1), span(1, 50, 1), span(2, 20, 4)];
        spans.sort();
        let order: Vec<PulseNum> = spans.iter().map(|s| s.num).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn activity_follows_position_and_length() {
        let mut p = Pulse::new(0);
        p.refresh_activity();
        assert!(!p.is_active());
        p.pos = Some(5);
        p.len = Some(0);
        p.refresh_activity();
        assert!(!p.is_active());
        p.len = Some(3);
        p.refresh_activity();
        assert!(p.is_active() && p.has_been_active());
        assert_eq!(p.span(), Some(span(0, 5, 3)));
        p.len = Some(0);
        p.refresh_activity();
        assert!(!p.is_active() && p.has_been_active());
    }

    #[test]
    fn commit_tracking() {
        let mut p = Pulse::new(0);
        p.pos = Some(5);
        p.len = Some(3);
        p.refresh_activity();
        assert!(p.differs_from_committed());
        p.mark_committed();
        assert!(!p.differs_from_committed());
        p.pos = Some(6);
        assert!(p.differs_from_committed());
    }
}
