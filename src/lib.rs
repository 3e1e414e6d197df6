//! Reliable asynchronous side effects via the transactional outbox
//! pattern: a producer enqueues a change event atomically with its own
//! write, a durable conversation queue carries it across crashes, and an
//! activation dispatcher drives a consumer that performs the side effect
//! and closes the conversation exactly once.

mod change_event;
mod consumer;
mod conversation;
mod dispatch;
mod enqueue;
mod error;
mod message;
mod payload;
mod sink;
mod store;

#[cfg(feature = "http")]
pub mod http;

pub use change_event::ChangeEvent;
pub use consumer::{Consumer, DrainStats, ProcessOutcome};
pub use conversation::{Conversation, ConversationHandle, ConversationState};
pub use dispatch::{Dispatcher, DispatcherConfig, DispatcherHandle, DispatcherStats};
pub use enqueue::{
    Enqueuer, Transaction, DEFAULT_CONTRACT, DEFAULT_INITIATOR_SERVICE, DEFAULT_TARGET_SERVICE,
};
pub use error::{EnqueueError, StoreError};
pub use message::{DeliveryState, Message, QueueEntry};
pub use payload::{PayloadError, CUSTOMER_INSERTED_MESSAGE_TYPE};
pub use sink::{BufferSink, BufferSinkError, FileSink, Sink};
pub use store::{
    DeadLetter, Delivery, JournalQueueStore, LeaseToken, MemoryQueueStore, QueueDepth, QueueStore,
};
