use super::intent::PaymentIntent;
use super::reader::{ConnectionStatus, ReaderConnection, ReaderIdentity, ReaderPrompt};
use super::request::PaymentKind;
use crate::error::{ConnectivityError, DeviceError, DeviceErrorCode, ServerError};
use crate::error::Result as TerminalResult;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Remote calls to the payment server.
///
/// Implementations perform a single attempt per call; retries and delays are
/// the engine's job.
#[async_trait]
pub trait ServerClient: Send + Sync {
    /// Creates an intent for the order or event and returns its client secret.
    async fn create_intent(
        &self,
        kind: PaymentKind,
        correlation_id: &str,
    ) -> Result<String, ServerError>;

    async fn capture_intent(&self, intent_id: &str) -> Result<(), ServerError>;
}

/// Opaque handle to an in-flight cancellable device operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CollectHandle(pub u64);

/// A started payment-method collection.
///
/// `completion` resolves exactly once. A dropped sender means the driver lost
/// the operation. `prompts` carries what the reader displays until then.
#[derive(Debug)]
pub struct Collection {
    pub handle: CollectHandle,
    pub completion: oneshot::Receiver<Result<PaymentIntent, DeviceError>>,
    pub prompts: mpsc::UnboundedReceiver<ReaderPrompt>,
}

impl Collection {
    pub async fn outcome(self) -> Result<PaymentIntent, DeviceError> {
        settle(self.completion).await
    }
}

/// Waits for a collection's completion.
pub async fn settle(
    completion: oneshot::Receiver<Result<PaymentIntent, DeviceError>>,
) -> Result<PaymentIntent, DeviceError> {
    completion.await.unwrap_or_else(|_| {
        Err(DeviceError::new(
            DeviceErrorCode::NotConnected,
            "collection dropped by the reader",
        ))
    })
}

/// Batches of nearby readers reported by an ongoing discovery.
///
/// Dropping the stream stops discovery.
#[derive(Debug)]
pub struct DiscoveryStream {
    batches: mpsc::Receiver<Vec<ReaderIdentity>>,
}

impl DiscoveryStream {
    pub fn new(batches: mpsc::Receiver<Vec<ReaderIdentity>>) -> Self {
        Self { batches }
    }

    /// Next batch, or `None` once the driver ends discovery.
    pub async fn next_batch(&mut self) -> Option<Vec<ReaderIdentity>> {
        self.batches.recv().await
    }
}

/// The card-reader driver.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    async fn resolve_intent(&self, client_secret: &str) -> Result<PaymentIntent, DeviceError>;

    async fn collect_payment_method(
        &self,
        intent: &PaymentIntent,
    ) -> Result<Collection, DeviceError>;

    /// Processes a collected intent. On failure the error may carry the intent
    /// as updated by the server.
    async fn process_payment(&self, intent: &PaymentIntent) -> Result<PaymentIntent, DeviceError>;

    async fn cancel(&self, handle: CollectHandle) -> Result<(), DeviceError>;

    async fn connection_status(&self) -> ConnectionStatus;

    async fn connected_reader(&self) -> Option<ReaderIdentity>;

    async fn discover(&self) -> Result<DiscoveryStream, ConnectivityError>;

    async fn connect(&self, reader: &ReaderIdentity) -> Result<ReaderConnection, ConnectivityError>;

    /// Resolves when the connected reader drops without being asked to.
    async fn unexpected_disconnect(&self) -> ReaderIdentity;
}

/// Key-value persistence for the last connected reader.
#[async_trait]
pub trait ReaderIdentityStore: Send + Sync {
    async fn remember(&self, reader: &ReaderIdentity) -> TerminalResult<()>;
    async fn recall(&self) -> TerminalResult<Option<ReaderIdentity>>;
}

/// Capability used when discovery reports more than one reader.
#[async_trait]
pub trait ReaderSelector: Send + Sync {
    /// Picks an index into `candidates`, or `None` to keep discovering.
    async fn select(&self, candidates: &[ReaderIdentity]) -> Option<usize>;
}

pub type ServerClientRef = Arc<dyn ServerClient>;
pub type DeviceDriverRef = Arc<dyn DeviceDriver>;
pub type ReaderIdentityStoreRef = Arc<dyn ReaderIdentityStore>;
pub type ReaderSelectorBox = Box<dyn ReaderSelector>;
