use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::EnqueueError;

/// Snapshot of the fields of an inserted customer row.
///
/// This is the producer-side notification the core consumes: "a row was
/// committed, with these fields". It is never persisted as-is; the
/// enqueuer serializes it into the message payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub customer_number: String,
    pub customer_name: String,
    pub customer_address: String,
    pub email_address: String,
}

impl ChangeEvent {
    pub fn new(
        customer_number: impl Into<String>,
        customer_name: impl Into<String>,
        customer_address: impl Into<String>,
        email_address: impl Into<String>,
    ) -> Self {
        ChangeEvent {
            customer_number: customer_number.into(),
            customer_name: customer_name.into(),
            customer_address: customer_address.into(),
            email_address: email_address.into(),
        }
    }

    /// All four fields are required and must be non-empty.
    pub fn validate(&self) -> Result<(), EnqueueError> {
        for (field, value) in self.fields() {
            if value.trim().is_empty() {
                return Err(EnqueueError::Validation { field });
            }
        }
        Ok(())
    }

    pub(crate) fn fields(&self) -> [(&'static str, &str); 4] {
        [
            ("customer_number", &self.customer_number),
            ("customer_name", &self.customer_name),
            ("customer_address", &self.customer_address),
            ("email_address", &self.email_address),
        ]
    }
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "customer {} <{}>", self.customer_number, self.email_address)
    }
}
