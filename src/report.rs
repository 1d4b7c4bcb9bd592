//! Fault reports and the sinks they are written to.

use crate::error::MemtwinError;
use crate::traits::FaultSink;
use crate::word::Word;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
#[cfg(unix)]
use std::os::fd::AsFd;
use std::path::Path;
#[cfg(test)]
use std::sync::{Arc, Mutex};

/// Classification of a detected fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Reproduced identically on every confirmation pass.
    Write,
    /// Moved or vanished during confirmation.
    Read,
    /// A word did not hold its own address in the stuck-address test.
    AddressLine,
}

impl FaultKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Write => "WRITE",
            Self::Read => "READ",
            Self::AddressLine => "ADDRESS LINE",
        }
    }
}

/// Where a fault was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultLocation {
    /// Byte offset from the start of the buffer.
    Offset(u64),
    /// Physical address, when the buffer's physical base is known.
    PhysicalAddress(u64),
}

impl fmt::Display for FaultLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offset(offset) => write!(f, "offset 0x{:08x}", offset),
            Self::PhysicalAddress(addr) => write!(f, "physical address 0x{:08x}", addr),
        }
    }
}

/// A confirmed fault.
///
/// For comparison faults `value_a`/`value_b` are the words read from the two
/// buffers. For address-line faults they are the expected and actual word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultReport {
    pub test_name: &'static str,
    pub kind: FaultKind,
    pub location: FaultLocation,
    pub value_a: Word,
    pub value_b: Word,
}

impl fmt::Display for FaultReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FaultKind::AddressLine => {
                write!(f, "FAILURE: possible bad address line at {}.", self.location)
            }
            FaultKind::Write | FaultKind::Read => write!(
                f,
                "{} FAILURE: 0x{:08x} != 0x{:08x} at {} ({}).",
                self.kind.label(),
                self.value_a,
                self.value_b,
                self.location,
                self.test_name
            ),
        }
    }
}

/// Writes reports to standard error.
#[derive(Debug, Default)]
pub struct StderrSink;

impl FaultSink for StderrSink {
    fn emit(&mut self, report: &FaultReport) -> io::Result<()> {
        let mut stderr = io::stderr().lock();
        writeln!(stderr, "{}", report)?;
        stderr.flush()?;
        sync_stream(&stderr)
    }
}

/// Syncs the file behind `stream` to stable storage.
///
/// Terminals and pipes cannot be synced and report `EINVAL` or `ENOTSUP`;
/// those are treated as success.
#[cfg(unix)]
fn sync_stream<S: AsFd>(stream: &S) -> io::Result<()> {
    let file = File::from(stream.as_fd().try_clone_to_owned()?);
    match file.sync_all() {
        Err(e) if matches!(e.kind(), io::ErrorKind::InvalidInput | io::ErrorKind::Unsupported) => {
            Ok(())
        }
        other => other,
    }
}

#[cfg(not(unix))]
fn sync_stream<S>(_stream: &S) -> io::Result<()> {
    Ok(())
}

/// Appends reports to a file and syncs it to disk after each one.
#[derive(Debug)]
pub struct FileSink {
    file: File,
}

impl FileSink {
    pub fn open(path: &Path) -> Result<Self, MemtwinError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }
}

impl FaultSink for FileSink {
    fn emit(&mut self, report: &FaultReport) -> io::Result<()> {
        writeln!(self.file, "{}", report)?;
        self.file.flush()?;
        self.file.sync_all()
    }
}

/// Collects rendered reports in memory.
///
/// Clones share the same line buffer, so a clone kept by the caller sees
/// everything emitted through the one handed to a classifier.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
}

#[cfg(test)]
impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
impl FaultSink for MemorySink {
    fn emit(&mut self, report: &FaultReport) -> io::Result<()> {
        let mut lines = self
            .lines
            .lock()
            .map_err(|_| io::Error::other("report buffer poisoned"))?;
        lines.push(format!("{}\n", report));
        Ok(())
    }
}

/// Fans a report out to several sinks.
///
/// Every sink is written even if an earlier one fails; the first error is
/// returned.
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<Box<dyn FaultSink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sink: Box<dyn FaultSink>) {
        self.sinks.push(sink);
    }

    /// Number of sinks reports are fanned out to.
    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }
}

impl FaultSink for MultiSink {
    fn emit(&mut self, report: &FaultReport) -> io::Result<()> {
        let mut first_error = None;
        for sink in &mut self.sinks {
            if let Err(e) = sink.emit(report) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
