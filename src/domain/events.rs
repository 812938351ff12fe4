use super::intent::{IntentStatus, PaymentIntent};
use super::reader::{ConnectionStatus, ReaderIdentity, ReaderPrompt};
use crate::error::{ConnectivityError, DeviceError, FailureCause, ServerError};
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Serialize, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationState {
    #[default]
    Idle,
    CreatingIntent,
    AwaitingConnection,
    CollectingMethod,
    Processing,
    Capturing,
    Cancelled,
    Failed,
    Succeeded,
}

impl OrchestrationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Failed | Self::Succeeded)
    }
}

/// Where a failed processing attempt can pick up again.
#[derive(Debug, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum Recovery {
    /// The intent still needs confirming; process it again.
    ResumeAtProcessing,
    /// The card was declined; collect a new payment method.
    ResumeAtCollection,
    /// Nothing to resume in this flow.
    Fatal,
}

/// Everything the engine reports to its caller, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    StateChanged(OrchestrationState),
    IntentLoadingStarted,
    IntentLoaded(PaymentIntent),
    IntentLoadingFailed(FailureCause),
    /// Display message from the reader while a card is being collected.
    ReaderPrompt(ReaderPrompt),
    MethodCollected(PaymentIntent),
    CollectionFailed(DeviceError),
    CollectionCancelled,
    /// The device refused to cancel; the collection result still decides.
    CancelFailed(DeviceError),
    Processed(PaymentIntent),
    ProcessingFailed {
        error: DeviceError,
        status: Option<IntentStatus>,
        intent: PaymentIntent,
        recovery: Recovery,
        message: String,
    },
    CaptureFailed {
        attempt: u32,
        error: ServerError,
    },
    Succeeded(PaymentIntent),
    Failed {
        cause: FailureCause,
        intent: Option<PaymentIntent>,
    },
    Cancelled {
        intent: Option<PaymentIntent>,
    },
}

impl LifecycleEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded(_) | Self::Failed { .. } | Self::Cancelled { .. }
        )
    }
}

/// What the connectivity controller reports while bringing up a reader.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StatusChanged(ConnectionStatus),
    ReadersDiscovered(Vec<ReaderIdentity>),
    SelectionRequested(Vec<ReaderIdentity>),
    Connected(ReaderIdentity),
    ConnectionFailed(ConnectivityError),
    /// No reader connected within the stall timeout. Discovery keeps running.
    DiscoveryStalled { after: Duration },
    DiscoveryEnded,
    /// The connected reader dropped without being asked to.
    Disconnected(ReaderIdentity),
}
