//! Durable queue store: the coupling mechanism between the transactional
//! producer and the asynchronous consumer.
//!
//! The store is the only shared mutable resource in the system; every
//! cross-component interaction goes through its atomic
//! put/receive/ack/abandon primitives.
//!
//! Two implementations:
//! - [`MemoryQueueStore`]: in-process, `Arc`-shared, blocking receive.
//! - [`JournalQueueStore`]: file-backed journal that survives crashes.

mod journal;
mod memory;

pub use journal::JournalQueueStore;
pub use memory::MemoryQueueStore;

use std::time::Duration;

use crate::conversation::{Conversation, ConversationHandle, ConversationState};
use crate::error::StoreError;
use crate::message::Message;

/// A temporary exclusive claim on a received entry.
///
/// The claim expires if the entry is not acked within the store's lease
/// duration, after which the entry is redelivered (at-least-once under
/// crash).
#[derive(Clone, Debug)]
pub struct LeaseToken {
    pub(crate) sequence: u64,
    pub(crate) token: u64,
}

impl LeaseToken {
    /// Store-assigned sequence of the leased entry (diagnostics only).
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// A received entry: the message, its conversation, and the lease that
/// must be resolved by `ack`, `abandon`, or `dead_letter`.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub conversation: ConversationHandle,
    pub message: Message,
    /// Delivery attempts including this one.
    pub attempts: u32,
    pub lease: LeaseToken,
}

/// Queue population counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub available: usize,
    pub in_flight: usize,
    pub dead_lettered: usize,
}

/// A quarantined message, kept for operator inspection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadLetter {
    pub sequence: u64,
    pub conversation: ConversationHandle,
    pub message: Message,
    pub attempts: u32,
    pub reason: String,
}

/// Persistent storage of enqueued messages and their conversation state.
///
/// Guarantees:
/// - `put_all` is all-or-nothing: either every staged entry becomes
///   durably visible or none does.
/// - a received entry is leased: no second consumer sees it until the
///   lease expires or it is abandoned.
/// - `ack` is idempotent: acking a closed or unknown conversation
///   succeeds without redelivering anything.
/// - messages within one conversation are received in put order; a
///   dead-lettered entry stops blocking its successors.
pub trait QueueStore {
    /// Enqueue a single message on a conversation.
    fn put(&self, conversation: Conversation, message: Message) -> Result<(), StoreError> {
        self.put_all(vec![(conversation, message)])
    }

    /// Atomically enqueue a batch of messages, each on its own
    /// conversation. This is the commit point of a producer transaction.
    fn put_all(&self, staged: Vec<(Conversation, Message)>) -> Result<(), StoreError>;

    /// Block up to `timeout` for an available entry and lease it to
    /// `consumer_id`. An empty poll returns `Ok(None)`; it is a normal
    /// outcome, not a failure.
    fn try_receive(
        &self,
        consumer_id: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, StoreError>;

    /// Close the conversation and delete its in-delivery entry.
    /// Idempotent: acking twice, or acking an unknown handle, succeeds.
    fn ack(&self, handle: ConversationHandle) -> Result<(), StoreError>;

    /// Return a leased entry to Available for redelivery.
    fn abandon(&self, lease: &LeaseToken, reason: Option<&str>) -> Result<(), StoreError>;

    /// Quarantine a leased entry so it stops blocking delivery of
    /// subsequent messages.
    fn dead_letter(&self, lease: &LeaseToken, reason: &str) -> Result<(), StoreError>;

    fn depth(&self) -> Result<QueueDepth, StoreError>;

    fn dead_letters(&self) -> Result<Vec<DeadLetter>, StoreError>;

    fn conversation_state(
        &self,
        handle: ConversationHandle,
    ) -> Result<Option<ConversationState>, StoreError>;
}
