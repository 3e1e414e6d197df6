use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::memory::MemoryQueueStore;
use super::{DeadLetter, Delivery, LeaseToken, QueueDepth, QueueStore};
use crate::conversation::{Conversation, ConversationHandle, ConversationState};
use crate::error::StoreError;
use crate::message::{Message, QueueEntry};

/// One line of the journal.
///
/// Leases are deliberately absent: after a crash every in-flight entry
/// reverts to Available and is redelivered. Attempts are journaled so the
/// poison bound stays accurate across restarts.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalRecord {
    Enqueued {
        conversation: Conversation,
        entry: QueueEntry,
    },
    Attempt {
        sequence: u64,
    },
    Closed {
        conversation: ConversationHandle,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence: Option<u64>,
    },
    DeadLettered {
        sequence: u64,
        reason: String,
    },
}

/// Crash-surviving queue store backed by an append-only JSON-lines
/// journal.
///
/// Wraps a [`MemoryQueueStore`] for the live state and appends a record
/// for every durable state change, fsyncing before the change becomes
/// visible to the caller. On open the journal is replayed and compacted.
///
/// ## Example
///
/// ```no_run
/// use dialog_rust::{JournalQueueStore, QueueStore};
///
/// let store = JournalQueueStore::open("/var/lib/myapp/queue.journal")?;
/// println!("{:?}", store.depth()?);
/// # Ok::<(), dialog_rust::StoreError>(())
/// ```
#[derive(Clone)]
pub struct JournalQueueStore {
    mem: MemoryQueueStore,
    writer: Arc<Mutex<JournalWriter>>,
}

struct JournalWriter {
    file: File,
    path: PathBuf,
}

impl JournalWriter {
    /// Append records and fsync before the caller applies them.
    fn append(&mut self, records: &[JournalRecord]) -> Result<(), StoreError> {
        let mut buf = Vec::with_capacity(records.len() * 128);
        for record in records {
            serde_json::to_writer(&mut buf, record)
                .map_err(|e| StoreError::Corrupt { line: 0, message: e.to_string() })?;
            buf.push(b'\n');
        }
        self.file.write_all(&buf)?;
        self.file.sync_data()?;
        Ok(())
    }
}

impl JournalQueueStore {
    /// Open (or create) a journal at `path`, replaying and compacting any
    /// existing records.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mem = MemoryQueueStore::new();

        let mut replayed = 0usize;
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (idx, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: JournalRecord =
                    serde_json::from_str(&line).map_err(|e| StoreError::Corrupt {
                        line: idx + 1,
                        message: e.to_string(),
                    })?;
                apply(&mem, record)?;
                replayed += 1;
            }
        }

        compact_to(&mem, &path)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        if replayed > 0 {
            info!(path = %path.display(), replayed, "journal replayed");
        }
        Ok(JournalQueueStore {
            mem,
            writer: Arc::new(Mutex::new(JournalWriter { file, path })),
        })
    }

    /// Set the visibility timeout for leased entries.
    pub fn with_lease(self, lease: Duration) -> Self {
        JournalQueueStore {
            mem: self.mem.with_lease(lease),
            writer: self.writer,
        }
    }

    /// Rewrite the journal to contain only live state.
    pub fn compact(&self) -> Result<(), StoreError> {
        let mut writer = self.writer()?;
        let path = writer.path.clone();
        compact_to(&self.mem, &path)?;
        writer.file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(())
    }

    fn writer(&self) -> Result<MutexGuard<'_, JournalWriter>, StoreError> {
        self.writer
            .lock()
            .map_err(|_| StoreError::LockPoisoned("journal"))
    }
}

fn apply(mem: &MemoryQueueStore, record: JournalRecord) -> Result<(), StoreError> {
    match record {
        JournalRecord::Enqueued { conversation, mut entry } => {
            // Leases are volatile: an entry journaled mid-flight comes
            // back available.
            if entry.is_leased() {
                entry.release(None);
            }
            mem.install_entry(conversation, entry)
        }
        JournalRecord::Attempt { sequence } => mem.note_attempt(sequence),
        JournalRecord::Closed { conversation, sequence } => {
            mem.close_recorded(conversation, sequence)
        }
        JournalRecord::DeadLettered { sequence, reason } => {
            mem.quarantine_recorded(sequence, &reason)
        }
    }
}

/// Write the current state to `path` atomically (temp file + rename).
///
/// Entries are written whole, so attempts, dead-letter state, and
/// enqueue times survive compaction without replaying history.
fn compact_to(mem: &MemoryQueueStore, path: &Path) -> Result<(), StoreError> {
    let (entries, conversations) = mem.snapshot()?;
    let tmp = path.with_extension("journal.tmp");
    {
        let mut out = BufWriter::new(File::create(&tmp)?);
        for entry in &entries {
            let Some(conversation) = conversations.get(&entry.conversation) else {
                continue;
            };
            let line = serde_json::to_string(&JournalRecord::Enqueued {
                conversation: conversation.clone(),
                entry: entry.clone(),
            })
            .map_err(|e| StoreError::Corrupt { line: 0, message: e.to_string() })?;
            out.write_all(line.as_bytes())?;
            out.write_all(b"\n")?;
        }
        let mut out = out
            .into_inner()
            .map_err(|e| StoreError::Io(e.into_error()))?;
        out.flush()?;
        out.sync_data()?;
    }
    fs::rename(&tmp, path)?;
    debug!(path = %path.display(), entries = entries.len(), "journal compacted");
    Ok(())
}

impl QueueStore for JournalQueueStore {
    fn put_all(&self, staged: Vec<(Conversation, Message)>) -> Result<(), StoreError> {
        if staged.is_empty() {
            return Ok(());
        }
        self.mem.check_open(&staged)?;

        let mut writer = self.writer()?;
        let start = self.mem.reserve_sequences(staged.len() as u64)?;

        let mut records = Vec::with_capacity(staged.len());
        let mut installs = Vec::with_capacity(staged.len());
        for (offset, (conversation, message)) in staged.into_iter().enumerate() {
            let sequence = start + offset as u64;
            let entry = QueueEntry::new(sequence, conversation.handle(), message);
            records.push(JournalRecord::Enqueued {
                conversation: conversation.clone(),
                entry: entry.clone(),
            });
            installs.push((conversation, entry));
        }

        // Journal first: the entries must not become consumable unless
        // they are durable.
        writer.append(&records)?;
        for (conversation, entry) in installs {
            self.mem.install_entry(conversation, entry)?;
        }
        Ok(())
    }

    fn try_receive(
        &self,
        consumer_id: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, StoreError> {
        let delivery = self.mem.try_receive(consumer_id, timeout)?;
        if let Some(delivery) = &delivery {
            self.writer()?.append(&[JournalRecord::Attempt {
                sequence: delivery.lease.sequence,
            }])?;
        }
        Ok(delivery)
    }

    fn ack(&self, handle: ConversationHandle) -> Result<(), StoreError> {
        let target = self.mem.ack_target(handle)?;
        if target.is_some() || self.mem.conversation_state(handle)?.is_some() {
            self.writer()?.append(&[JournalRecord::Closed {
                conversation: handle,
                sequence: target,
            }])?;
        }
        self.mem.close_recorded(handle, target)
    }

    fn abandon(&self, lease: &LeaseToken, reason: Option<&str>) -> Result<(), StoreError> {
        // Leases are volatile; nothing to journal.
        self.mem.abandon(lease, reason)
    }

    fn dead_letter(&self, lease: &LeaseToken, reason: &str) -> Result<(), StoreError> {
        let sequence = lease.sequence;
        self.mem.quarantine_leased(lease, reason)?;
        self.writer()?.append(&[JournalRecord::DeadLettered {
            sequence,
            reason: reason.to_string(),
        }])
    }

    fn depth(&self) -> Result<QueueDepth, StoreError> {
        self.mem.depth()
    }

    fn dead_letters(&self) -> Result<Vec<DeadLetter>, StoreError> {
        self.mem.dead_letters()
    }

    fn conversation_state(
        &self,
        handle: ConversationHandle,
    ) -> Result<Option<ConversationState>, StoreError> {
        self.mem.conversation_state(handle)
    }
}
