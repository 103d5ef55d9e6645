//! Hardware images of bitmap channels and the diff between them.
//!
//! Every programmed channel keeps two images of shape `(rows, window)`: the state last written
//! to the hardware (`committed`) and the state the next update wants (`pending`). Row `r` holds
//! the bit pattern of repetition `r` of the phase cycle. Images are compared in row-major order,
//! and [`HardwareImage::diff`] yields the maximal runs of consecutive positions whose pending
//! value differs from the committed one and which share the same pending value. Applying those
//! runs to the committed image reproduces the pending image exactly.

use std::iter::{Enumerate, Peekable, Zip};

use ndarray::{s, Array2, Ix2};

use crate::utils::Tick;

/// Raw line level of a run, after inversion has been applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Level {
    High,
    Low,
}

impl Level {
    pub fn from_bit(bit: u8) -> Self {
        if bit != 0 {
            Level::High
        } else {
            Level::Low
        }
    }

    pub fn bit(&self) -> u8 {
        match self {
            Level::High => 1,
            Level::Low => 0,
        }
    }
}

/// A run of `len` positions starting at the row-major offset `start` that must be set to `level`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DiffRun {
    pub level: Level,
    pub start: Tick,
    pub len: Tick,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HardwareImage {
    committed: Array2<u8>,
    pending: Array2<u8>,
}

impl HardwareImage {
    pub fn new(rows: usize, window: usize) -> Self {
        Self {
            committed: Array2::zeros((rows, window)),
            pending: Array2::zeros((rows, window)),
        }
    }

    pub fn rows(&self) -> usize {
        self.pending.nrows()
    }
    pub fn window(&self) -> usize {
        self.pending.ncols()
    }
    pub fn committed(&self) -> &Array2<u8> {
        &self.committed
    }
    pub fn pending(&self) -> &Array2<u8> {
        &self.pending
    }

    /// Changes the number of rows. Rows kept from the committed image retain their content,
    /// new rows start out low.
    pub fn resize(&mut self, rows: usize) {
        if rows == self.rows() {
            return;
        }
        let window = self.window();
        let keep = rows.min(self.rows());
        let mut committed: Array2<u8> = Array2::zeros((rows, window));
        committed
            .slice_mut(s![..keep, ..])
            .assign(&self.committed.slice(s![..keep, ..]));
        self.committed = committed;
        self.pending = Array2::zeros((rows, window));
    }

    // Fills the pending image with the idle level
    pub fn clear_pending(&mut self, idle: u8) {
        self.pending.fill(idle);
    }

    pub fn paint(&mut self, row: usize, start: usize, len: usize, value: u8) {
        let end = (start + len).min(self.window());
        if start < end {
            self.pending.slice_mut(s![row, start..end]).fill(value);
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.committed != self.pending
    }

    pub fn diff(&self) -> DiffRuns<'_> {
        DiffRuns {
            cells: self
                .committed
                .iter()
                .zip(self.pending.iter())
                .enumerate()
                .peekable(),
        }
    }

    pub fn commit(&mut self) {
        self.committed.assign(&self.pending);
    }
}

type CellIter<'a> = ndarray::iter::Iter<'a, u8, Ix2>;

/// Lazy iterator over the maximal differing runs of a [`HardwareImage`].
pub struct DiffRuns<'a> {
    cells: Peekable<Enumerate<Zip<CellIter<'a>, CellIter<'a>>>>,
}

impl<'a> Iterator for DiffRuns<'a> {
    type Item = DiffRun;

    fn next(&mut self) -> Option<DiffRun> {
        loop {
            let (start, (committed, pending)) = self.cells.next()?;
            if committed == pending {
                continue;
            }
            let value = *pending;
            let mut len = 1;
            while self
                .cells
                .next_if(|(_, (c, p))| c != p && **p == value)
                .is_some()
            {
                len += 1;
            }
            return Some(DiffRun {
                level: Level::from_bit(value),
                start: start as Tick,
                len,
            });
        }
    }
}

/// Writes a run into an image addressed in row-major order, as the hardware would.
pub fn apply_run(image: &mut Array2<u8>, run: &DiffRun) {
    let window = image.ncols();
    if window == 0 {
        return;
    }
    let bit = run.level.bit();
    for offset in run.start..run.start + run.len {
        let offset = offset as usize;
        image[[offset / window, offset % window]] = bit;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fresh_image_has_no_diff() {
        let image = HardwareImage::new(2, 16);
        assert_eq!(image.diff().count(), 0);
        assert!(!image.is_dirty());
    }

    #[test]
    fn runs_are_maximal() {
        let mut image = HardwareImage::new(1, 32);
        image.paint(0, 4, 6, 1);
        image.commit();
        // Move the pulse by two ticks: two short runs instead of a full rewrite
        image.clear_pending(0);
        image.paint(0, 6, 6, 1);
        let runs: Vec<DiffRun> = image.diff().collect();
        assert_eq!(
            runs,
            vec![
                DiffRun { level: Level::Low, start: 4, len: 2 },
                DiffRun { level: Level::High, start: 10, len: 2 },
            ]
        );
        image.commit();
        assert_eq!(image.diff().count(), 0);
    }

    #[test]
    fn runs_cross_rows_in_row_major_order() {
        let mut image = HardwareImage::new(2, 4);
        image.paint(0, 2, 2, 1);
        image.paint(1, 0, 3, 1);
        let runs: Vec<DiffRun> = image.diff().collect();
        assert_eq!(runs, vec![DiffRun { level: Level::High, start: 2, len: 5 }]);
    }

    #[test]
    fn inverted_idle_level() {
        let mut image = HardwareImage::new(1, 8);
        image.clear_pending(1);
        image.paint(0, 2, 3, 0);
        let runs: Vec<DiffRun> = image.diff().collect();
        assert_eq!(
            runs,
            vec![
                DiffRun { level: Level::High, start: 0, len: 2 },
                DiffRun { level: Level::High, start: 5, len: 3 },
            ]
        );
    }

    #[test]
    fn resize_keeps_committed_rows() {
        let mut image = HardwareImage::new(1, 4);
        image.paint(0, 0, 2, 1);
        image.commit();
        image.resize(2);
        assert_eq!(image.rows(), 2);
        assert_eq!(image.committed()[[0, 1]], 1);
        assert_eq!(image.committed()[[1, 1]], 0);
        // Pending starts empty: row 0 must be cleared
        assert_eq!(image.diff().count(), 1);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn painting() -> impl Strategy<Value = Vec<(usize, usize, usize)>> {
            proptest::collection::vec((0usize..3, 0usize..40, 0usize..12), 0..8)
        }

        fn paint_all(image: &mut HardwareImage, idle: u8, spans: &[(usize, usize, usize)]) {
            image.clear_pending(idle);
            for &(row, start, len) in spans {
                image.paint(row, start, len, 1 - idle);
            }
        }

        proptest! {
            #[test]
            fn applying_diff_reproduces_pending(
                before in painting(),
                after in painting(),
                inverted in any::<bool>(),
            ) {
                let idle = u8::from(inverted);
                let mut image = HardwareImage::new(3, 40);
                paint_all(&mut image, idle, &before);
                image.commit();
                paint_all(&mut image, idle, &after);

                let mut hardware = image.committed().clone();
                let runs: Vec<DiffRun> = image.diff().collect();
                for run in &runs {
                    apply_run(&mut hardware, run);
                }
                prop_assert_eq!(&hardware, image.pending());

                for pair in runs.windows(2) {
                    // Adjacent runs either leave a gap or switch level
                    prop_assert!(
                        pair[0].start + pair[0].len < pair[1].start || pair[0].level != pair[1].level
                    );
                }
            }
        }
    }
}
