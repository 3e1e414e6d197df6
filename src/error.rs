use std::fmt;
use std::io;

use crate::conversation::ConversationHandle;

/// Error raised while enqueueing inside a producer transaction.
///
/// Either way the surrounding transaction must not commit: a validation
/// failure means no message was ever staged, and a store failure means the
/// write must not proceed without its notification.
#[derive(Debug)]
pub enum EnqueueError {
    /// The change event is malformed; `field` names the offending field.
    Validation { field: &'static str },
    /// The durable queue store rejected the commit.
    StoreUnavailable(StoreError),
}

impl fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnqueueError::Validation { field } => {
                write!(f, "change event validation failed: {} is empty", field)
            }
            EnqueueError::StoreUnavailable(e) => {
                write!(f, "queue store unavailable: {}", e)
            }
        }
    }
}

impl std::error::Error for EnqueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EnqueueError::StoreUnavailable(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for EnqueueError {
    fn from(e: StoreError) -> Self {
        EnqueueError::StoreUnavailable(e)
    }
}

/// Error raised by a queue store operation.
#[derive(Debug)]
pub enum StoreError {
    LockPoisoned(&'static str),
    /// Journal file could not be read or written.
    Io(io::Error),
    /// Journal contained an unreadable record.
    Corrupt { line: usize, message: String },
    /// The lease token does not match a live lease (already acked,
    /// abandoned, or expired and redelivered elsewhere).
    UnknownLease { sequence: u64 },
    /// Attempted to put a message on a conversation that has ended.
    ConversationClosed { handle: ConversationHandle },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::LockPoisoned(operation) => {
                write!(f, "store lock poisoned during {}", operation)
            }
            StoreError::Io(e) => write!(f, "journal i/o error: {}", e),
            StoreError::Corrupt { line, message } => {
                write!(f, "journal corrupt at line {}: {}", line, message)
            }
            StoreError::UnknownLease { sequence } => {
                write!(f, "no live lease for entry {}", sequence)
            }
            StoreError::ConversationClosed { handle } => {
                write!(f, "conversation {} has ended", handle)
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        StoreError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_display_names_field() {
        let err = EnqueueError::Validation { field: "customer_name" };
        assert_eq!(
            err.to_string(),
            "change event validation failed: customer_name is empty"
        );
    }

    #[test]
    fn store_unavailable_carries_source() {
        let err: EnqueueError = StoreError::LockPoisoned("put").into();
        assert!(err.to_string().contains("queue store unavailable"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn unknown_lease_display() {
        let err = StoreError::UnknownLease { sequence: 7 };
        assert_eq!(err.to_string(), "no live lease for entry 7");
    }
}
