use std::time::Duration;

use tracing::{info, warn};

use crate::conversation::ConversationHandle;
use crate::error::StoreError;
use crate::payload;
use crate::sink::Sink;
use crate::store::QueueStore;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_millis(100);

/// What happened to one received entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The poll came back empty; a normal outcome, not a failure.
    Empty,
    /// The sink accepted the record and the conversation was closed.
    Delivered(ConversationHandle),
    /// The entry was returned for redelivery (sink failure, or a poison
    /// payload still under its attempt bound).
    Abandoned(ConversationHandle),
    /// The payload could not be processed after the configured number of
    /// attempts and was quarantined.
    DeadLettered(ConversationHandle),
}

/// Counters from a [`Consumer::drain`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub polls: usize,
    pub delivered: usize,
    pub abandoned: usize,
    pub dead_lettered: usize,
}

/// Reads messages from the store, performs the side effect, and closes
/// the conversation.
///
/// Sink failures are not retried in a loop here: the entry is abandoned
/// and comes back through the store's own redelivery mechanism, the same
/// path crash recovery takes. Payloads that cannot be decoded are poison
/// and are quarantined once the per-entry attempt counter reaches
/// `max_attempts`.
pub struct Consumer<S> {
    sink: S,
    consumer_id: String,
    max_attempts: u32,
    receive_timeout: Duration,
}

impl<S> Consumer<S> {
    pub fn new(sink: S) -> Self {
        Consumer {
            sink,
            consumer_id: format!("consumer-{}", std::process::id()),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
        }
    }

    /// Set the consumer ID (used for lease tracking).
    pub fn with_consumer_id(mut self, id: impl Into<String>) -> Self {
        self.consumer_id = id.into();
        self
    }

    /// Set the redelivery bound after which a poison message is
    /// quarantined.
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    /// Set how long an empty poll blocks before returning.
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }
}

impl<S: Sink> Consumer<S> {
    /// Receive and process at most one entry.
    pub fn process_one<Q: QueueStore>(&mut self, store: &Q) -> Result<ProcessOutcome, StoreError> {
        let delivery = match store.try_receive(&self.consumer_id, self.receive_timeout)? {
            Some(delivery) => delivery,
            None => return Ok(ProcessOutcome::Empty),
        };
        let conversation = delivery.conversation;

        // Decode and validate; an undecodable payload is poison: the
        // bytes are immutable, so retrying cannot help past the bound.
        let record = delivery
            .message
            .payload_str()
            .ok_or_else(|| payload::PayloadError {
                message: "payload is not UTF-8".into(),
            })
            .and_then(payload::decode)
            .and_then(|record| {
                record
                    .validate()
                    .map_err(|e| payload::PayloadError { message: e.to_string() })?;
                Ok(record)
            });

        let record = match record {
            Ok(record) => record,
            Err(e) => {
                if delivery.attempts >= self.max_attempts {
                    store.dead_letter(&delivery.lease, &e.to_string())?;
                    return Ok(ProcessOutcome::DeadLettered(conversation));
                }
                warn!(
                    conversation = %conversation,
                    attempts = delivery.attempts,
                    max_attempts = self.max_attempts,
                    error = %e,
                    "poison payload, abandoning for redelivery"
                );
                store.abandon(&delivery.lease, Some(&e.to_string()))?;
                return Ok(ProcessOutcome::Abandoned(conversation));
            }
        };

        match self.sink.deliver(&record) {
            Ok(()) => {
                store.ack(conversation)?;
                info!(conversation = %conversation, record = %record, "delivered");
                Ok(ProcessOutcome::Delivered(conversation))
            }
            Err(e) => {
                warn!(
                    conversation = %conversation,
                    attempts = delivery.attempts,
                    error = %e,
                    "sink failed, abandoning for redelivery"
                );
                store.abandon(&delivery.lease, Some(&e.to_string()))?;
                Ok(ProcessOutcome::Abandoned(conversation))
            }
        }
    }

    /// Process entries until a poll comes back empty.
    pub fn drain<Q: QueueStore>(&mut self, store: &Q) -> Result<DrainStats, StoreError> {
        let mut stats = DrainStats::default();
        loop {
            stats.polls += 1;
            match self.process_one(store)? {
                ProcessOutcome::Empty => return Ok(stats),
                ProcessOutcome::Delivered(_) => stats.delivered += 1,
                ProcessOutcome::Abandoned(_) => stats.abandoned += 1,
                ProcessOutcome::DeadLettered(_) => stats.dead_lettered += 1,
            }
        }
    }
}
