//! Transactional enqueuer: builds the notification message inside the
//! producer's transaction so the enqueue commits or rolls back with it.
//!
//! The originating store must call [`Transaction::enqueue`] while its own
//! write is pending and must fail the write if the enqueue (or the final
//! [`Transaction::commit`]) fails: an insert must not silently proceed
//! without its notification.

use std::mem;

use tracing::debug;

use crate::change_event::ChangeEvent;
use crate::conversation::{Conversation, ConversationHandle};
use crate::error::EnqueueError;
use crate::message::Message;
use crate::payload::{self, CUSTOMER_INSERTED_MESSAGE_TYPE};
use crate::store::QueueStore;

/// Service naming defaults, from the original customer-insert channel.
pub const DEFAULT_INITIATOR_SERVICE: &str = "CustomerInsertedClient";
pub const DEFAULT_TARGET_SERVICE: &str = "CustomerInsertedService";
pub const DEFAULT_CONTRACT: &str = "http://ssb.csharp.at/SSB_Book/c10/CustomerInsertContract";

/// Builds messages for inserted-customer change events.
///
/// ## Example
///
/// ```
/// use dialog_rust::{ChangeEvent, Enqueuer, MemoryQueueStore, QueueStore};
///
/// let store = MemoryQueueStore::new();
/// let enqueuer = Enqueuer::new();
///
/// let mut txn = enqueuer.begin(&store);
/// let handle = txn.enqueue(&ChangeEvent::new("C1", "Alice", "1 Main St", "a@example.com"))?;
/// txn.commit()?;
///
/// assert_eq!(store.depth()?.available, 1);
/// # let _ = handle;
/// # Ok::<(), dialog_rust::EnqueueError>(())
/// ```
pub struct Enqueuer {
    initiator: String,
    target: String,
    contract: String,
}

impl Default for Enqueuer {
    fn default() -> Self {
        Self::new()
    }
}

impl Enqueuer {
    pub fn new() -> Self {
        Enqueuer {
            initiator: DEFAULT_INITIATOR_SERVICE.to_string(),
            target: DEFAULT_TARGET_SERVICE.to_string(),
            contract: DEFAULT_CONTRACT.to_string(),
        }
    }

    pub fn with_initiator(mut self, initiator: impl Into<String>) -> Self {
        self.initiator = initiator.into();
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn with_contract(mut self, contract: impl Into<String>) -> Self {
        self.contract = contract.into();
        self
    }

    /// Start a transaction scope against `store`.
    pub fn begin<'a, S: QueueStore>(&'a self, store: &'a S) -> Transaction<'a, S> {
        Transaction {
            enqueuer: self,
            store,
            staged: Vec::new(),
            aborted: None,
        }
    }
}

/// An open producer transaction.
///
/// Enqueued messages are staged in memory; nothing reaches the store
/// until [`commit`](Transaction::commit), which writes all staged entries
/// atomically. Dropping the transaction (or calling
/// [`rollback`](Transaction::rollback)) discards them, undoing the
/// enqueue exactly as a rolled-back insert would.
#[must_use = "staged messages are discarded unless the transaction is committed"]
pub struct Transaction<'a, S: QueueStore> {
    enqueuer: &'a Enqueuer,
    store: &'a S,
    staged: Vec<(Conversation, Message)>,
    aborted: Option<&'static str>,
}

impl<S: QueueStore> Transaction<'_, S> {
    /// Open a conversation and stage one message carrying the event.
    ///
    /// A malformed event aborts the whole transaction: the error is
    /// sticky and a later `commit` fails with it too.
    pub fn enqueue(&mut self, event: &ChangeEvent) -> Result<ConversationHandle, EnqueueError> {
        if let Err(e) = event.validate() {
            if let EnqueueError::Validation { field } = e {
                self.aborted = Some(field);
            }
            return Err(e);
        }

        let conversation = Conversation::open(
            &self.enqueuer.initiator,
            &self.enqueuer.target,
            &self.enqueuer.contract,
        );
        let handle = conversation.handle();
        let message = Message::from_text(CUSTOMER_INSERTED_MESSAGE_TYPE, payload::encode(event));
        self.staged.push((conversation, message));
        debug!(conversation = %handle, event = %event, "change event staged");
        Ok(handle)
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// Commit every staged message atomically. Fails if any enqueue
    /// failed validation, or with `StoreUnavailable` if the store
    /// rejects the batch; either way the caller must fail its write.
    pub fn commit(mut self) -> Result<(), EnqueueError> {
        if let Some(field) = self.aborted {
            return Err(EnqueueError::Validation { field });
        }
        let staged = mem::take(&mut self.staged);
        let count = staged.len();
        self.store.put_all(staged)?;
        debug!(count, "transaction committed");
        Ok(())
    }

    /// Discard the staged messages. Equivalent to dropping the
    /// transaction; provided for explicitness at call sites.
    pub fn rollback(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryQueueStore, QueueStore};
    use std::time::Duration;

    fn alice() -> ChangeEvent {
        ChangeEvent::new("C1", "Alice", "1 Main St", "a@example.com")
    }

    #[test]
    fn commit_makes_message_visible() {
        let store = MemoryQueueStore::new();
        let enqueuer = Enqueuer::new();

        let mut txn = enqueuer.begin(&store);
        let handle = txn.enqueue(&alice()).unwrap();
        txn.commit().unwrap();

        let delivery = store
            .try_receive("c-1", Duration::from_millis(10))
            .unwrap()
            .unwrap();
        assert_eq!(delivery.conversation, handle);
        assert_eq!(
            delivery.message.message_type,
            CUSTOMER_INSERTED_MESSAGE_TYPE
        );
        assert!(delivery
            .message
            .payload_str()
            .unwrap()
            .contains("<CustomerName>Alice</CustomerName>"));
    }

    #[test]
    fn dropped_transaction_enqueues_nothing() {
        let store = MemoryQueueStore::new();
        let enqueuer = Enqueuer::new();

        {
            let mut txn = enqueuer.begin(&store);
            txn.enqueue(&alice()).unwrap();
            // Rolled back by drop.
        }

        assert_eq!(store.depth().unwrap().available, 0);
    }

    #[test]
    fn rollback_discards_staged_messages() {
        let store = MemoryQueueStore::new();
        let enqueuer = Enqueuer::new();

        let mut txn = enqueuer.begin(&store);
        txn.enqueue(&alice()).unwrap();
        assert_eq!(txn.staged_len(), 1);
        txn.rollback();

        assert_eq!(store.depth().unwrap().available, 0);
    }

    #[test]
    fn validation_failure_aborts_the_transaction() {
        let store = MemoryQueueStore::new();
        let enqueuer = Enqueuer::new();

        let mut txn = enqueuer.begin(&store);
        txn.enqueue(&alice()).unwrap();

        let mut bad = alice();
        bad.customer_name = String::new();
        assert!(matches!(
            txn.enqueue(&bad),
            Err(EnqueueError::Validation { field: "customer_name" })
        ));

        // The earlier valid enqueue must not survive the abort.
        assert!(matches!(
            txn.commit(),
            Err(EnqueueError::Validation { field: "customer_name" })
        ));
        assert_eq!(store.depth().unwrap().available, 0);
    }

    #[test]
    fn conversation_uses_configured_services() {
        let store = MemoryQueueStore::new();
        let enqueuer = Enqueuer::new()
            .with_initiator("billing-client")
            .with_target("billing-service")
            .with_contract("urn:billing/v1");

        let mut txn = enqueuer.begin(&store);
        txn.enqueue(&alice()).unwrap();
        let (conversation, _) = &txn.staged[0];
        assert_eq!(conversation.initiator(), "billing-client");
        assert_eq!(conversation.target(), "billing-service");
        assert_eq!(conversation.contract(), "urn:billing/v1");
    }
}
