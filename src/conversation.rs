use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique handle identifying one conversation.
///
/// 128-bit random; collision probability is negligible for the lifetime of
/// a store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationHandle(Uuid);

impl ConversationHandle {
    pub fn new() -> Self {
        ConversationHandle(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConversationHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConversationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle state of a conversation. Open → Closed, no reopen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationState {
    #[default]
    Open,
    Closed,
}

/// A durable, ordered logical channel between one producer and one
/// consumer.
///
/// A conversation is created by the enqueuer ("client → processing
/// service") and closed by the consumer's acknowledgment. Messages within
/// one conversation are delivered in the order they were put; there is no
/// ordering guarantee across conversations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    handle: ConversationHandle,
    initiator: String,
    target: String,
    contract: String,
    state: ConversationState,
}

impl Conversation {
    /// Open a new conversation from `initiator` to `target` under the
    /// given contract.
    pub fn open(
        initiator: impl Into<String>,
        target: impl Into<String>,
        contract: impl Into<String>,
    ) -> Self {
        Conversation {
            handle: ConversationHandle::new(),
            initiator: initiator.into(),
            target: target.into(),
            contract: contract.into(),
            state: ConversationState::Open,
        }
    }

    pub fn handle(&self) -> ConversationHandle {
        self.handle
    }

    pub fn initiator(&self) -> &str {
        &self.initiator
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn contract(&self) -> &str {
        &self.contract
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConversationState::Closed
    }

    /// End the conversation. Closing twice is a no-op: repeated
    /// acknowledgment is a valid recovery path and must never error.
    pub fn close(&mut self) {
        self.state = ConversationState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_unique() {
        assert_ne!(ConversationHandle::new(), ConversationHandle::new());
    }

    #[test]
    fn open_conversation_starts_open() {
        let conversation = Conversation::open("client", "service", "contract-1");
        assert_eq!(conversation.state(), ConversationState::Open);
        assert_eq!(conversation.initiator(), "client");
        assert_eq!(conversation.target(), "service");
        assert_eq!(conversation.contract(), "contract-1");
    }

    #[test]
    fn close_is_terminal_and_idempotent() {
        let mut conversation = Conversation::open("client", "service", "contract-1");
        conversation.close();
        assert!(conversation.is_closed());

        conversation.close();
        assert!(conversation.is_closed());
    }

    #[test]
    fn handle_serializes_as_uuid() {
        let handle = ConversationHandle::new();
        let json = serde_json::to_string(&handle).unwrap();
        let back: ConversationHandle = serde_json::from_str(&json).unwrap();
        assert_eq!(handle, back);
    }
}
