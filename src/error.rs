use crate::domain::intent::{IntentStatus, PaymentIntent};
use crate::domain::reader::ReaderIdentity;
use miette::Diagnostic;
use thiserror::Error;

/// Crate-level error for everything that is not a payment-flow outcome.
///
/// Payment-flow failures never surface as a `TerminalError`; the engine
/// reports them as lifecycle events carrying a [`FailureCause`].
#[derive(Error, Debug, Diagnostic)]
pub enum TerminalError {
    #[error("CSV error: {0}")]
    #[diagnostic(code(paydesk::csv))]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    #[diagnostic(
        code(paydesk::config),
        help("PAYDESK_* durations are whole milliseconds")
    )]
    ConfigError(#[from] ConfigError),
    #[error("Connectivity error: {0}")]
    #[diagnostic(code(paydesk::reader))]
    ConnectivityError(#[from] ConnectivityError),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("payment engine is no longer running")]
    EngineStopped,
    #[error("checkout was replaced by a newer one before it began")]
    Superseded,
}

pub type Result<T> = std::result::Result<T, TerminalError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} has an invalid value: {value:?}")]
    InvalidValue { key: String, value: String },
    #[error("{key} must be greater than zero")]
    MustBePositive { key: String },
}

/// Failures reported by the remote payment server.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    #[error("server unreachable: {0}")]
    Unreachable(String),
    #[error("server rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

/// Error codes reported by the card-reader driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorCode {
    /// The operation was cancelled on the device.
    Canceled,
    NotConnected,
    Declined,
    Timeout,
    /// A cancel was issued for an operation that is not in progress.
    NothingToCancel,
    Other(u32),
}

/// A card-reader driver failure.
///
/// Processing failures may carry the intent as the server last observed it,
/// which decides where the flow can resume.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("device error ({code:?}): {message}")]
pub struct DeviceError {
    pub code: DeviceErrorCode,
    pub message: String,
    pub intent: Option<PaymentIntent>,
}

impl DeviceError {
    pub fn new(code: DeviceErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            intent: None,
        }
    }

    pub fn with_intent(mut self, intent: PaymentIntent) -> Self {
        self.intent = Some(intent);
        self
    }

    pub fn is_cancellation(&self) -> bool {
        self.code == DeviceErrorCode::Canceled
    }

    /// Status of the updated intent attached to the error, if any.
    pub fn intent_status(&self) -> Option<IntentStatus> {
        self.intent.as_ref().map(|intent| intent.status)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectivityError {
    #[error("reader discovery failed: {0}")]
    DiscoveryFailed(String),
    #[error("failed to connect to reader {}: {reason}", reader.serial)]
    ConnectFailed {
        reader: ReaderIdentity,
        reason: String,
    },
    #[error("reader selection index {index} is out of range for {candidates} candidates")]
    InvalidSelection { index: usize, candidates: usize },
}

/// Why a payment attempt ended in `Failed`.
///
/// The `Display` text is the message shown to the person at the counter and is
/// distinct for every cause.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FailureCause {
    #[error("Payment details are incomplete. Please exit and try again.")]
    InvalidRequest(String),
    #[error("Failed to connect to server. Please exit and try again.")]
    ServerUnreachable(ServerError),
    #[error("The payment could not be loaded. Please exit and try again.")]
    IntentUnavailable(DeviceError),
    #[error("No card reader is connected. Please connect a reader and try again.")]
    ReaderNotConnected,
    #[error("The card reader has disconnected. Please exit and try again.")]
    ReaderDisconnected(DeviceError),
    #[error("The payment has failed, please exit and try again.")]
    CollectionFailed(DeviceError),
    #[error("We were unable to process your payment. Please exit and try again.")]
    ProcessingFailed {
        status: IntentStatus,
        error: DeviceError,
    },
    #[error("Uh oh, something went wrong. Please exit and try again.")]
    ProcessingFailedUnknown(DeviceError),
    #[error("Transaction incomplete. Please check the network, exit and try again.")]
    CaptureExhausted { attempts: u32, last_error: ServerError },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_failure_messages_are_distinct_per_cause() {
        let device = DeviceError::new(DeviceErrorCode::Other(1), "boom");
        let server = ServerError::Unreachable("timeout".to_string());
        let causes = vec![
            FailureCause::InvalidRequest("missing event".to_string()),
            FailureCause::ServerUnreachable(server.clone()),
            FailureCause::IntentUnavailable(device.clone()),
            FailureCause::ReaderNotConnected,
            FailureCause::ReaderDisconnected(device.clone()),
            FailureCause::CollectionFailed(device.clone()),
            FailureCause::ProcessingFailed {
                status: IntentStatus::Canceled,
                error: device.clone(),
            },
            FailureCause::ProcessingFailedUnknown(device),
            FailureCause::CaptureExhausted {
                attempts: 5,
                last_error: server,
            },
        ];

        let messages: HashSet<String> = causes.iter().map(ToString::to_string).collect();
        assert_eq!(messages.len(), causes.len());
    }

    #[test]
    fn test_device_error_cancellation_code() {
        assert!(DeviceError::new(DeviceErrorCode::Canceled, "cancelled").is_cancellation());
        assert!(!DeviceError::new(DeviceErrorCode::Declined, "declined").is_cancellation());
    }
}
