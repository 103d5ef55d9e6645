//! ASCII command bus.
//!
//! Hardware operations are encoded one command per line:
//!
//! | operation | command |
//! |---|---|
//! | [`HardwareOp::SetRun`] | `DATA <field>,<bit>,<start>,<len>,<0\|1>` |
//! | [`HardwareOp::SetElement`] | `DEL <function>,<index>,<ticks>` |
//! | [`HardwareOp::DisableElement`] | `DIS <function>,<index>` |
//! | [`HardwareOp::SetLength`] | `LEN <function>,<ticks>` |
//!
//! plus `RUN` and `STOP`. Lines are batched into writes of at most `max_write` bytes. When
//! error checking is on, every batch is followed by an `ERR?` query whose answer must be `0`
//! (optionally followed by `,"message"`).

use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use pulsecompiler_backend::HardwareOp;

use crate::error::{CtrlError, CtrlResult};
use crate::transport::Transport;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Largest single write in bytes
    pub max_write: usize,
    /// Query `ERR?` after every write
    pub check_errors: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_write: 1024,
            check_errors: true,
        }
    }
}

#[derive(Deserialize)]
struct BusSection {
    #[serde(default)]
    bus: BusConfig,
}

impl BusConfig {
    /// Reads the `bus:` section of a pulser configuration file, defaults when absent.
    pub fn load(config_path: Option<&Path>) -> CtrlResult<Self> {
        let config = match config_path {
            Some(path) => {
                let content = fs::read_to_string(path)?;
                Self::from_yaml(&content)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> CtrlResult<Self> {
        let section: BusSection = serde_yaml::from_str(content)?;
        Ok(section.bus)
    }

    pub fn validate(&self) -> CtrlResult<()> {
        if self.max_write == 0 {
            return Err(CtrlError::Config("max_write must be positive".to_string()));
        }
        Ok(())
    }
}

pub struct CommandEncoder;

impl CommandEncoder {
    pub fn encode(op: &HardwareOp) -> String {
        match op {
            HardwareOp::SetRun {
                field,
                bit,
                level,
                start,
                len,
                ..
            } => format!("DATA {},{},{},{},{}\n", field, bit, start, len, level.bit()),
            HardwareOp::SetElement {
                function,
                index,
                ticks,
            } => format!("DEL {},{},{}\n", function, index, ticks),
            HardwareOp::DisableElement { function, index } => {
                format!("DIS {},{}\n", function, index)
            }
            HardwareOp::SetLength { function, ticks } => format!("LEN {},{}\n", function, ticks),
        }
    }

    pub fn encode_all(ops: &[HardwareOp]) -> Vec<String> {
        ops.iter().map(Self::encode).collect()
    }
}

fn error_answer_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^\s*(?P<code>[+-]?\d+)\s*(?:,\s*"?(?P<msg>[^"]*?)"?)?\s*$"#)
            .unwrap_or_else(|e| panic!("error answer pattern is a literal: {}", e))
    })
}

pub struct CommandBus {
    config: BusConfig,
}

impl CommandBus {
    pub fn new(config: BusConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Writes `lines` in as few batches as `max_write` allows, returning the number of writes.
    /// A line longer than `max_write` is written on its own.
    pub fn send(&self, transport: &mut dyn Transport, lines: &[String]) -> CtrlResult<usize> {
        let mut batch: Vec<u8> = Vec::with_capacity(self.config.max_write);
        let mut writes = 0;
        for line in lines {
            if !batch.is_empty() && batch.len() + line.len() > self.config.max_write {
                self.flush(transport, &batch)?;
                batch.clear();
                writes += 1;
            }
            batch.extend_from_slice(line.as_bytes());
        }
        if !batch.is_empty() {
            self.flush(transport, &batch)?;
            writes += 1;
        }
        debug!(lines = lines.len(), writes, "commands sent");
        Ok(writes)
    }

    pub fn command(&self, transport: &mut dyn Transport, command: &str) -> CtrlResult<()> {
        self.send(transport, &[format!("{}\n", command)]).map(|_| ())
    }

    fn flush(&self, transport: &mut dyn Transport, batch: &[u8]) -> CtrlResult<()> {
        trace!(bytes = batch.len(), "bus write");
        transport.write(batch)?;
        if self.config.check_errors {
            self.check_device(transport)?;
        }
        Ok(())
    }

    fn check_device(&self, transport: &mut dyn Transport) -> CtrlResult<()> {
        transport.write(b"ERR?\n")?;
        let answer = transport.read()?;
        let answer = String::from_utf8_lossy(&answer);
        let caps = error_answer_re()
            .captures(&answer)
            .ok_or_else(|| CtrlError::Protocol(answer.to_string()))?;
        let code: i64 = caps["code"]
            .parse()
            .map_err(|_| CtrlError::Protocol(answer.to_string()))?;
        if code != 0 {
            return Err(CtrlError::Device {
                code,
                message: caps
                    .name("msg")
                    .map_or_else(String::new, |m| m.as_str().to_string()),
            });
        }
        Ok(())
    }
}
