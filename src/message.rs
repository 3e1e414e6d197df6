use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::conversation::ConversationHandle;

/// Delivery state of a queue entry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryState {
    /// Visible to consumers.
    #[default]
    Available,
    /// Leased to one consumer; invisible until acked, abandoned, or the
    /// lease expires.
    Leased,
    /// Quarantined after exhausting its redelivery attempts.
    DeadLettered,
}

/// An immutable message: a type tag plus a payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message_type: String,
    #[serde(with = "payload_serde")]
    pub payload: Vec<u8>,
}

mod payload_serde {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(payload: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(payload).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

impl Message {
    pub fn new(message_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Message {
            message_type: message_type.into(),
            payload,
        }
    }

    /// Create a message from payload text.
    pub fn from_text(message_type: impl Into<String>, payload: impl Into<String>) -> Self {
        Message::new(message_type, payload.into().into_bytes())
    }

    /// Get the payload as UTF-8 text, if it is valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// The durable-store representation binding a message to its conversation
/// and a delivery state.
///
/// Created atomically with the producing transaction's commit; removed
/// when the conversation's acknowledgment deletes it. The state machine
/// mirrors lease-based delivery: `claim_for` on receive, `release` on
/// abandonment or lease expiry, `quarantine` when the attempt counter
/// reaches the poison bound.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub sequence: u64,
    pub conversation: ConversationHandle,
    pub message: Message,
    pub state: DeliveryState,
    pub enqueued_at: SystemTime,
    /// Delivery attempts so far (incremented on each claim).
    pub attempts: u32,
    pub consumer_id: Option<String>,
    pub leased_until: Option<SystemTime>,
    pub lease_token: Option<u64>,
    pub last_error: Option<String>,
}

impl QueueEntry {
    pub fn new(sequence: u64, conversation: ConversationHandle, message: Message) -> Self {
        QueueEntry {
            sequence,
            conversation,
            message,
            state: DeliveryState::Available,
            enqueued_at: SystemTime::now(),
            attempts: 0,
            consumer_id: None,
            leased_until: None,
            lease_token: None,
            last_error: None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.state == DeliveryState::Available
    }

    pub fn is_leased(&self) -> bool {
        self.state == DeliveryState::Leased
    }

    pub fn is_dead_lettered(&self) -> bool {
        self.state == DeliveryState::DeadLettered
    }

    /// Whether the entry still blocks later entries of its conversation.
    pub fn is_live(&self) -> bool {
        !self.is_dead_lettered()
    }

    /// Whether the lease has expired as of `now`.
    pub fn lease_expired(&self, now: SystemTime) -> bool {
        matches!(self.leased_until, Some(until) if until <= now)
    }

    /// Lease the entry to a consumer. Counts a delivery attempt.
    pub fn claim_for(&mut self, consumer_id: impl Into<String>, token: u64, lease: Duration) {
        debug_assert!(self.is_available());
        self.state = DeliveryState::Leased;
        self.attempts += 1;
        self.consumer_id = Some(consumer_id.into());
        self.leased_until = Some(SystemTime::now() + lease);
        self.lease_token = Some(token);
    }

    /// Return a leased entry to Available for redelivery.
    pub fn release(&mut self, error: Option<&str>) {
        self.state = DeliveryState::Available;
        self.last_error = error.map(str::to_string);
        self.consumer_id = None;
        self.leased_until = None;
        self.lease_token = None;
    }

    /// Quarantine the entry so it stops blocking its conversation.
    pub fn quarantine(&mut self, reason: &str) {
        self.state = DeliveryState::DeadLettered;
        self.last_error = Some(reason.to_string());
        self.consumer_id = None;
        self.leased_until = None;
        self.lease_token = None;
    }
}
