//! Byte transports to the pulser.
//!
//! The [`Transport`] trait is the connection lifecycle plus raw writes and reads. Two
//! implementations are provided:
//!
//! - [`FileTransport`] talks to a device node (serial adapter, USB-TMC character device) or a
//!   plain file through [`OpenOptions`]. The file is closed when the transport is dropped.
//!   Plain files never answer reads, pair them with `check_errors: false`.
//! - [`RecordingTransport`] keeps every write in memory and answers reads from a scripted queue.
//!   Clones share the same log, so a test can keep one clone and hand the other to a
//!   [`Pulser`](crate::pulser::Pulser).

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{CtrlError, CtrlResult};

pub trait Transport: Send {
    fn name(&self) -> String;
    fn is_open(&self) -> bool;
    fn open(&mut self) -> CtrlResult<()>;
    fn close(&mut self) -> CtrlResult<()>;
    fn write(&mut self, bytes: &[u8]) -> CtrlResult<()>;
    fn read(&mut self) -> CtrlResult<Vec<u8>>;
}

pub struct FileTransport {
    path: PathBuf,
    file: Option<File>,
}

impl FileTransport {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: None,
        }
    }

    fn file(&mut self) -> CtrlResult<&mut File> {
        let name = self.name();
        self.file.as_mut().ok_or(CtrlError::NotOpen(name))
    }
}

impl Transport for FileTransport {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn open(&mut self) -> CtrlResult<()> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&self.path)?;
            self.file = Some(file);
            debug!(path = %self.path.display(), "transport opened");
        }
        Ok(())
    }

    fn close(&mut self) -> CtrlResult<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            debug!(path = %self.path.display(), "transport closed");
        }
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> CtrlResult<()> {
        let file = self.file()?;
        file.write_all(bytes)?;
        file.flush()?;
        trace!(bytes = bytes.len(), "written");
        Ok(())
    }

    fn read(&mut self) -> CtrlResult<Vec<u8>> {
        let mut buf = [0u8; 256];
        let n = self.file()?.read(&mut buf)?;
        Ok(buf[..n].to_vec())
    }
}

impl Drop for FileTransport {
    fn drop(&mut self) {
        // Nothing left to report errors to
        let _ = self.close();
    }
}

#[derive(Debug, Default)]
struct Recording {
    open: bool,
    writes: Vec<Vec<u8>>,
    answers: VecDeque<Vec<u8>>,
    fail_writes: bool,
}

#[derive(Clone, Debug, Default)]
pub struct RecordingTransport {
    inner: Arc<Mutex<Recording>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write so far, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.inner.lock().writes.clone()
    }

    /// All writes joined as text.
    pub fn text(&self) -> String {
        let inner = self.inner.lock();
        inner
            .writes
            .iter()
            .map(|w| String::from_utf8_lossy(w))
            .collect()
    }

    pub fn clear(&self) {
        self.inner.lock().writes.clear();
    }

    /// Queues the answer of a future read. Reads with an empty queue answer `0`.
    pub fn push_answer(&self, answer: &str) {
        self.inner.lock().answers.push_back(answer.as_bytes().to_vec());
    }

    /// Makes every following write fail like a broken connection.
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }
}

impl Transport for RecordingTransport {
    fn name(&self) -> String {
        "recording".to_string()
    }

    fn is_open(&self) -> bool {
        self.inner.lock().open
    }

    fn open(&mut self) -> CtrlResult<()> {
        self.inner.lock().open = true;
        Ok(())
    }

    fn close(&mut self) -> CtrlResult<()> {
        self.inner.lock().open = false;
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> CtrlResult<()> {
        let mut inner = self.inner.lock();
        if !inner.open {
            return Err(CtrlError::NotOpen(self.name()));
        }
        if inner.fail_writes {
            return Err(CtrlError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "connection lost",
            )));
        }
        inner.writes.push(bytes.to_vec());
        Ok(())
    }

    fn read(&mut self) -> CtrlResult<Vec<u8>> {
        let mut inner = self.inner.lock();
        if !inner.open {
            return Err(CtrlError::NotOpen(self.name()));
        }
        Ok(inner.answers.pop_front().unwrap_or_else(|| b"0\n".to_vec()))
    }
}
