use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use tracing::warn;

use super::{DeadLetter, Delivery, LeaseToken, QueueDepth, QueueStore};
use crate::conversation::{Conversation, ConversationHandle, ConversationState};
use crate::error::StoreError;
use crate::message::{Message, QueueEntry};

pub(crate) const DEFAULT_LEASE: Duration = Duration::from_secs(30);

/// In-process queue store.
///
/// Thread-safe and cheap to `Clone`: cloning creates another handle to the
/// same storage, so the producer, dispatcher, and consumers can each hold
/// one. `try_receive` blocks on a condvar rather than busy-waiting.
///
/// ## Example
///
/// ```
/// use std::time::Duration;
/// use dialog_rust::{Conversation, MemoryQueueStore, Message, QueueStore};
///
/// let store = MemoryQueueStore::new();
/// let conversation = Conversation::open("client", "service", "contract");
/// let handle = conversation.handle();
///
/// store.put(conversation, Message::from_text("Ping", "<p/>")).unwrap();
///
/// let delivery = store.try_receive("c-1", Duration::from_millis(10)).unwrap().unwrap();
/// assert_eq!(delivery.message.payload_str(), Some("<p/>"));
/// store.ack(delivery.conversation).unwrap();
///
/// assert!(store.conversation_state(handle).unwrap().unwrap() == dialog_rust::ConversationState::Closed);
/// ```
#[derive(Clone)]
pub struct MemoryQueueStore {
    inner: Arc<Inner>,
    lease: Duration,
}

struct Inner {
    state: Mutex<State>,
    arrived: Condvar,
}

struct State {
    next_sequence: u64,
    next_token: u64,
    entries: Vec<QueueEntry>,
    conversations: HashMap<ConversationHandle, Conversation>,
}

impl Default for MemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        MemoryQueueStore {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    next_sequence: 1,
                    next_token: 1,
                    entries: Vec::new(),
                    conversations: HashMap::new(),
                }),
                arrived: Condvar::new(),
            }),
            lease: DEFAULT_LEASE,
        }
    }

    /// Set the visibility timeout for leased entries.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    fn lock(&self, operation: &'static str) -> Result<MutexGuard<'_, State>, StoreError> {
        self.inner
            .state
            .lock()
            .map_err(|_| StoreError::LockPoisoned(operation))
    }

    // -- crate-internal surface used by the journal store ----------------

    pub(crate) fn reserve_sequences(&self, count: u64) -> Result<u64, StoreError> {
        let mut state = self.lock("reserve_sequences")?;
        let start = state.next_sequence;
        state.next_sequence += count;
        Ok(start)
    }

    pub(crate) fn check_open(
        &self,
        staged: &[(Conversation, Message)],
    ) -> Result<(), StoreError> {
        let state = self.lock("check_open")?;
        for (conversation, _) in staged {
            check_conversation_open(&state, conversation)?;
        }
        Ok(())
    }

    /// Insert an already-built entry, registering its conversation. Keeps
    /// entries sorted by sequence so FIFO holds even when callers install
    /// out of reservation order.
    pub(crate) fn install_entry(
        &self,
        conversation: Conversation,
        entry: QueueEntry,
    ) -> Result<(), StoreError> {
        let mut state = self.lock("install_entry")?;
        if state.next_sequence <= entry.sequence {
            state.next_sequence = entry.sequence + 1;
        }
        state
            .conversations
            .entry(conversation.handle())
            .or_insert(conversation);
        let at = state
            .entries
            .partition_point(|e| e.sequence < entry.sequence);
        state.entries.insert(at, entry);
        drop(state);
        self.inner.arrived.notify_all();
        Ok(())
    }

    /// Replay a journaled delivery attempt.
    pub(crate) fn note_attempt(&self, sequence: u64) -> Result<(), StoreError> {
        let mut state = self.lock("note_attempt")?;
        if let Some(entry) = state.entries.iter_mut().find(|e| e.sequence == sequence) {
            entry.attempts += 1;
        }
        Ok(())
    }

    /// Sequence of the entry an `ack` on this handle would delete.
    pub(crate) fn ack_target(
        &self,
        handle: ConversationHandle,
    ) -> Result<Option<u64>, StoreError> {
        let state = self.lock("ack_target")?;
        Ok(earliest_live(&state, handle))
    }

    /// Apply a conversation close: delete `target` (when given) and mark
    /// the conversation closed once no live entries remain.
    pub(crate) fn close_recorded(
        &self,
        handle: ConversationHandle,
        target: Option<u64>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock("close_recorded")?;
        if let Some(sequence) = target {
            if let Some(pos) = state.entries.iter().position(|e| e.sequence == sequence) {
                state.entries.remove(pos);
            }
        }
        let live_remaining = state
            .entries
            .iter()
            .any(|e| e.conversation == handle && e.is_live());
        if !live_remaining {
            if let Some(conversation) = state.conversations.get_mut(&handle) {
                conversation.close();
            }
        }
        drop(state);
        self.inner.arrived.notify_all();
        Ok(())
    }

    /// Replay a journaled quarantine.
    pub(crate) fn quarantine_recorded(
        &self,
        sequence: u64,
        reason: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.lock("quarantine_recorded")?;
        if let Some(entry) = state.entries.iter_mut().find(|e| e.sequence == sequence) {
            entry.quarantine(reason);
        }
        drop(state);
        self.inner.arrived.notify_all();
        Ok(())
    }

    /// Verify a lease and quarantine its entry.
    pub(crate) fn quarantine_leased(
        &self,
        lease: &LeaseToken,
        reason: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.lock("dead_letter")?;
        let entry = find_leased(&mut state, lease)?;
        warn!(
            sequence = entry.sequence,
            conversation = %entry.conversation,
            attempts = entry.attempts,
            reason,
            "entry moved to dead letters"
        );
        entry.quarantine(reason);
        drop(state);
        self.inner.arrived.notify_all();
        Ok(())
    }

    /// Clone out every entry and its conversation (journal compaction).
    pub(crate) fn snapshot(
        &self,
    ) -> Result<(Vec<QueueEntry>, HashMap<ConversationHandle, Conversation>), StoreError> {
        let state = self.lock("snapshot")?;
        Ok((state.entries.clone(), state.conversations.clone()))
    }
}

impl QueueStore for MemoryQueueStore {
    fn put_all(&self, staged: Vec<(Conversation, Message)>) -> Result<(), StoreError> {
        if staged.is_empty() {
            return Ok(());
        }
        let mut state = self.lock("put_all")?;
        for (conversation, _) in &staged {
            check_conversation_open(&state, conversation)?;
        }
        for (conversation, message) in staged {
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            let handle = conversation.handle();
            state.conversations.entry(handle).or_insert(conversation);
            state.entries.push(QueueEntry::new(sequence, handle, message));
        }
        drop(state);
        self.inner.arrived.notify_all();
        Ok(())
    }

    fn try_receive(
        &self,
        consumer_id: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, StoreError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock("try_receive")?;
        loop {
            let now = SystemTime::now();
            sweep_expired(&mut state, now);

            if let Some(idx) = eligible_index(&state) {
                let token = state.next_token;
                state.next_token += 1;
                let entry = &mut state.entries[idx];
                entry.claim_for(consumer_id, token, self.lease);
                return Ok(Some(Delivery {
                    conversation: entry.conversation,
                    message: entry.message.clone(),
                    attempts: entry.attempts,
                    lease: LeaseToken {
                        sequence: entry.sequence,
                        token,
                    },
                }));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            // Wake early if a lease will expire before the deadline.
            let wait = match next_lease_expiry(&state) {
                Some(expiry) => {
                    let until = expiry
                        .duration_since(now)
                        .unwrap_or(Duration::from_millis(1))
                        .max(Duration::from_millis(1));
                    remaining.min(until)
                }
                None => remaining,
            };
            state = self
                .inner
                .arrived
                .wait_timeout(state, wait)
                .map_err(|_| StoreError::LockPoisoned("try_receive"))?
                .0;
        }
    }

    fn ack(&self, handle: ConversationHandle) -> Result<(), StoreError> {
        let target = self.ack_target(handle)?;
        self.close_recorded(handle, target)
    }

    fn abandon(&self, lease: &LeaseToken, reason: Option<&str>) -> Result<(), StoreError> {
        let mut state = self.lock("abandon")?;
        let entry = find_leased(&mut state, lease)?;
        entry.release(reason);
        drop(state);
        self.inner.arrived.notify_all();
        Ok(())
    }

    fn dead_letter(&self, lease: &LeaseToken, reason: &str) -> Result<(), StoreError> {
        self.quarantine_leased(lease, reason)
    }

    fn depth(&self) -> Result<QueueDepth, StoreError> {
        let mut state = self.lock("depth")?;
        sweep_expired(&mut state, SystemTime::now());
        let mut depth = QueueDepth::default();
        for entry in &state.entries {
            if entry.is_available() {
                depth.available += 1;
            } else if entry.is_leased() {
                depth.in_flight += 1;
            } else {
                depth.dead_lettered += 1;
            }
        }
        Ok(depth)
    }

    fn dead_letters(&self) -> Result<Vec<DeadLetter>, StoreError> {
        let state = self.lock("dead_letters")?;
        Ok(state
            .entries
            .iter()
            .filter(|e| e.is_dead_lettered())
            .map(|e| DeadLetter {
                sequence: e.sequence,
                conversation: e.conversation,
                message: e.message.clone(),
                attempts: e.attempts,
                reason: e.last_error.clone().unwrap_or_default(),
            })
            .collect())
    }

    fn conversation_state(
        &self,
        handle: ConversationHandle,
    ) -> Result<Option<ConversationState>, StoreError> {
        let state = self.lock("conversation_state")?;
        Ok(state.conversations.get(&handle).map(|c| c.state()))
    }
}

fn check_conversation_open(state: &State, conversation: &Conversation) -> Result<(), StoreError> {
    let handle = conversation.handle();
    let closed = conversation.is_closed()
        || state
            .conversations
            .get(&handle)
            .map(|c| c.is_closed())
            .unwrap_or(false);
    if closed {
        return Err(StoreError::ConversationClosed { handle });
    }
    Ok(())
}

/// Release leases that have passed their visibility timeout.
fn sweep_expired(state: &mut State, now: SystemTime) {
    for entry in &mut state.entries {
        if entry.is_leased() && entry.lease_expired(now) {
            warn!(
                sequence = entry.sequence,
                conversation = %entry.conversation,
                attempts = entry.attempts,
                "lease expired, entry returned for redelivery"
            );
            entry.release(Some("lease expired"));
        }
    }
}

fn next_lease_expiry(state: &State) -> Option<SystemTime> {
    state
        .entries
        .iter()
        .filter(|e| e.is_leased())
        .filter_map(|e| e.leased_until)
        .min()
}

/// First entry eligible for delivery: available, and not behind a live
/// earlier entry of the same conversation (FIFO per conversation).
fn eligible_index(state: &State) -> Option<usize> {
    let mut blocked: HashSet<ConversationHandle> = HashSet::new();
    for (idx, entry) in state.entries.iter().enumerate() {
        if !entry.is_live() || blocked.contains(&entry.conversation) {
            continue;
        }
        if entry.is_available() {
            return Some(idx);
        }
        blocked.insert(entry.conversation);
    }
    None
}

fn earliest_live(state: &State, handle: ConversationHandle) -> Option<u64> {
    state
        .entries
        .iter()
        .find(|e| e.conversation == handle && e.is_live())
        .map(|e| e.sequence)
}

fn find_leased<'a>(
    state: &'a mut MutexGuard<'_, State>,
    lease: &LeaseToken,
) -> Result<&'a mut QueueEntry, StoreError> {
    state
        .entries
        .iter_mut()
        .find(|e| e.sequence == lease.sequence && e.lease_token == Some(lease.token))
        .ok_or(StoreError::UnknownLease {
            sequence: lease.sequence,
        })
}
