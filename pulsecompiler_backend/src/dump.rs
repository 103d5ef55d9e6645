//! Pulse dump file for external visualization.
//!
//! Layout of the file:
//!
//! ```text
//! TB: 0.00000001
//! D: 20
//! ===
//! MW:3 20
//! DETECTION:7 0 I
//! MW:3 1 100 20 2 300 20
//! DETECTION:7 3 500 40
//!
//! MW:3 1 110 20 2 300 20
//! ...
//! ```
//!
//! The header gives the timebase in seconds as a plain decimal, the global delay and, per
//! function channel, the total delay in ticks (`I` marks inverted functions). Each update appends one block with a line per used
//! function listing `num pos len` of its active pulses sorted by position, followed by an empty
//! line. Every block is flushed as it is written.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use indexmap::IndexMap;

use crate::error::Result;
use crate::function::{Function, FunctionKind};
use crate::store::PulseStore;
use crate::utils::Tick;

pub struct DumpFile<W: Write> {
    out: W,
    header_written: bool,
}

impl DumpFile<BufWriter<File>> {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> DumpFile<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            header_written: false,
        }
    }

    pub fn header_written(&self) -> bool {
        self.header_written
    }

    pub fn write_header(
        &mut self,
        timebase: f64,
        global_delay: Tick,
        functions: &IndexMap<FunctionKind, Function>,
    ) -> Result<()> {
        writeln!(self.out, "TB: {}", timebase)?;
        writeln!(self.out, "D: {}", global_delay)?;
        writeln!(self.out, "===")?;
        for function in functions.values() {
            for channel in function.channels() {
                write!(
                    self.out,
                    "{}:{} {}",
                    function.kind(),
                    channel,
                    function.delay() + global_delay
                )?;
                if function.is_inverted() {
                    write!(self.out, " I")?;
                }
                writeln!(self.out)?;
            }
        }
        self.out.flush()?;
        self.header_written = true;
        Ok(())
    }

    pub fn write_update(
        &mut self,
        functions: &IndexMap<FunctionKind, Function>,
        store: &PulseStore,
    ) -> Result<()> {
        for function in functions.values() {
            let Some(channel) = function.channels().first() else {
                continue;
            };
            if !function.is_used() {
                continue;
            }
            let mut spans = Vec::new();
            for &num in function.pulses() {
                spans.extend(store.get(num)?.span());
            }
            spans.sort();
            write!(self.out, "{}:{}", function.kind(), channel)?;
            for span in spans {
                write!(self.out, " {} {} {}", span.num, span.pos, span.len)?;
            }
            writeln!(self.out)?;
        }
        writeln!(self.out)?;
        self.out.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
