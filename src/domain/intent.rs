use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresAction,
    Processing,
    RequiresCapture,
    Succeeded,
    Canceled,
}

/// Server-tracked record of an in-progress charge.
///
/// The engine treats this as an opaque handle: it only ever forwards the most
/// recent copy it received from an adapter.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct PaymentIntent {
    /// The server-side identifier used for capture.
    pub id: String,
    pub client_secret: String,
    pub status: IntentStatus,
}

impl PaymentIntent {
    pub fn new(id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            client_secret: client_secret.into(),
            status: IntentStatus::RequiresPaymentMethod,
        }
    }

    /// Returns a copy of this intent as the server would report it in `status`.
    pub fn with_status(&self, status: IntentStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }
}
