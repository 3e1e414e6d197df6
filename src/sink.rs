use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::change_event::ChangeEvent;

/// Destination of the side effect.
///
/// `deliver` may be retried: a failed or crashed consumer abandons its
/// entry and the store redelivers it, so the sink sees at-least-once
/// calls. End-to-end exactly-once therefore requires the sink to be
/// idempotent; with a non-idempotent sink (like [`FileSink`]) duplicate
/// side effects are possible after a crash between deliver and ack.
pub trait Sink {
    type Error: fmt::Display;

    fn deliver(&mut self, record: &ChangeEvent) -> Result<(), Self::Error>;
}

/// Appends customer details to a text file.
///
/// Output format:
///
/// ```text
/// New Customer arrived:
/// =====================
/// CustomerNumber: C1
/// CustomerName: Alice
/// CustomerAddress: 1 Main St
/// EmailAddress: a@example.com
/// ```
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        FileSink {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Sink for FileSink {
    type Error = io::Error;

    fn deliver(&mut self, record: &ChangeEvent) -> Result<(), Self::Error> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "New Customer arrived:")?;
        writeln!(file, "=====================")?;
        writeln!(file, "CustomerNumber: {}", record.customer_number)?;
        writeln!(file, "CustomerName: {}", record.customer_name)?;
        writeln!(file, "CustomerAddress: {}", record.customer_address)?;
        writeln!(file, "EmailAddress: {}", record.email_address)?;
        file.sync_data()
    }
}

/// A sink that captures delivered records in a shared buffer, for tests
/// and single-process wiring.
#[derive(Clone, Default)]
pub struct BufferSink {
    buffer: Arc<Mutex<Vec<ChangeEvent>>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferSinkError {
    BufferPoisoned,
}

impl fmt::Display for BufferSinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferSinkError::BufferPoisoned => write!(f, "buffer sink poisoned"),
        }
    }
}

impl std::error::Error for BufferSinkError {}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything delivered so far.
    pub fn delivered(&self) -> Vec<ChangeEvent> {
        self.buffer.lock().map(|b| b.clone()).unwrap_or_default()
    }

    pub fn delivered_count(&self) -> usize {
        self.buffer.lock().map(|b| b.len()).unwrap_or(0)
    }
}

impl Sink for BufferSink {
    type Error = BufferSinkError;

    fn deliver(&mut self, record: &ChangeEvent) -> Result<(), Self::Error> {
        let mut buffer = self
            .buffer
            .lock()
            .map_err(|_| BufferSinkError::BufferPoisoned)?;
        buffer.push(record.clone());
        Ok(())
    }
}
