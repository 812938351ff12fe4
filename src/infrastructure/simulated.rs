//! Scriptable stand-ins for the payment server and the card-reader driver.
//!
//! Both adapters record every call they receive and replay queued outcomes,
//! falling back to a successful result when nothing is queued. They back the
//! CLI's demo mode and the test suite.

use crate::domain::intent::{IntentStatus, PaymentIntent};
use crate::domain::ports::{
    CollectHandle, Collection, DeviceDriver, DiscoveryStream, ServerClient,
};
use crate::domain::reader::{ConnectionStatus, ReaderConnection, ReaderIdentity, ReaderPrompt};
use crate::domain::request::PaymentKind;
use crate::error::{ConnectivityError, DeviceError, DeviceErrorCode, ServerError};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, oneshot};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerCall {
    CreateIntent {
        kind: PaymentKind,
        correlation_id: String,
    },
    Capture {
        intent_id: String,
    },
}

#[derive(Debug, Default)]
struct ServerScript {
    create_failures: VecDeque<ServerError>,
    capture_failures: VecDeque<ServerError>,
    create_delay: Duration,
    issued: u64,
    calls: Vec<ServerCall>,
}

/// In-process payment server. Intents are numbered `pi_1`, `pi_2`, ...
#[derive(Debug, Clone, Default)]
pub struct SimulatedServer {
    script: Arc<Mutex<ServerScript>>,
}

impl SimulatedServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every intent creation, as a slow network would.
    pub fn with_create_delay(self, delay: Duration) -> Self {
        self.script().create_delay = delay;
        self
    }

    pub fn fail_next_create(&self, error: ServerError) {
        self.script().create_failures.push_back(error);
    }

    pub fn fail_next_captures(&self, count: usize, error: ServerError) {
        let mut script = self.script();
        for _ in 0..count {
            script.capture_failures.push_back(error.clone());
        }
    }

    pub fn clear_capture_failures(&self) {
        self.script().capture_failures.clear();
    }

    pub fn calls(&self) -> Vec<ServerCall> {
        self.script().calls.clone()
    }

    pub fn capture_calls(&self) -> usize {
        self.script()
            .calls
            .iter()
            .filter(|call| matches!(call, ServerCall::Capture { .. }))
            .count()
    }

    fn script(&self) -> MutexGuard<'_, ServerScript> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ServerClient for SimulatedServer {
    async fn create_intent(
        &self,
        kind: PaymentKind,
        correlation_id: &str,
    ) -> Result<String, ServerError> {
        let delay = {
            let mut script = self.script();
            script.calls.push(ServerCall::CreateIntent {
                kind,
                correlation_id: correlation_id.to_string(),
            });
            script.create_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut script = self.script();
        if let Some(error) = script.create_failures.pop_front() {
            debug!(%correlation_id, %error, "simulated intent creation failure");
            return Err(error);
        }
        script.issued += 1;
        let id = format!("pi_{}", script.issued);
        debug!(%correlation_id, intent = %id, "simulated intent created");
        Ok(format!("{id}_secret_sim"))
    }

    async fn capture_intent(&self, intent_id: &str) -> Result<(), ServerError> {
        let mut script = self.script();
        script.calls.push(ServerCall::Capture {
            intent_id: intent_id.to_string(),
        });
        match script.capture_failures.pop_front() {
            Some(error) => {
                debug!(intent = %intent_id, %error, "simulated capture failure");
                Err(error)
            }
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    ResolveIntent(String),
    Collect {
        intent_id: String,
        status: IntentStatus,
    },
    Process {
        intent_id: String,
        status: IntentStatus,
    },
    Cancel(CollectHandle),
    Discover,
    Connect(String),
}

/// How the next payment-method collection behaves.
#[derive(Debug, Clone)]
pub enum CollectScript {
    /// A card is presented after `after`, unless cancelled first.
    Approve { after: Duration },
    Fail(DeviceError),
    /// No card is ever presented; completes only when cancelled.
    AwaitCancel,
    /// The card is read after `after` even if a cancel arrived in between.
    IgnoreCancel { after: Duration },
    /// The customer cancels on the reader itself.
    CancelledOnDevice,
}

impl Default for CollectScript {
    fn default() -> Self {
        Self::Approve {
            after: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub enum ProcessScript {
    #[default]
    Approve,
    /// Fails with `code`; `status` is the server's view of the intent, if it
    /// reported one.
    Fail {
        code: DeviceErrorCode,
        status: Option<IntentStatus>,
    },
}

#[derive(Debug)]
struct DeviceScript {
    status: ConnectionStatus,
    connected: Option<ReaderIdentity>,
    lost: Option<ReaderIdentity>,
    batches: Vec<Vec<ReaderIdentity>>,
    batch_interval: Duration,
    keep_discovering: bool,
    discovery_failure: Option<String>,
    connect_delay: Duration,
    connect_failures: VecDeque<String>,
    resolve_failures: VecDeque<DeviceError>,
    cancel_failures: VecDeque<DeviceError>,
    collects: VecDeque<CollectScript>,
    processes: VecDeque<ProcessScript>,
    pending_cancels: HashMap<CollectHandle, oneshot::Sender<()>>,
    next_handle: u64,
    calls: Vec<DeviceCall>,
}

impl Default for DeviceScript {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::NotConnected,
            connected: None,
            lost: None,
            batches: Vec::new(),
            batch_interval: Duration::from_secs(1),
            keep_discovering: true,
            discovery_failure: None,
            connect_delay: Duration::from_millis(200),
            connect_failures: VecDeque::new(),
            resolve_failures: VecDeque::new(),
            cancel_failures: VecDeque::new(),
            collects: VecDeque::new(),
            processes: VecDeque::new(),
            pending_cancels: HashMap::new(),
            next_handle: 0,
            calls: Vec::new(),
        }
    }
}

/// In-process card reader.
#[derive(Debug, Clone, Default)]
pub struct SimulatedDevice {
    script: Arc<Mutex<DeviceScript>>,
    disconnects: Arc<Notify>,
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts with `reader` already connected.
    pub fn already_connected(self, reader: ReaderIdentity) -> Self {
        {
            let mut script = self.script();
            script.status = ConnectionStatus::Connected;
            script.connected = Some(reader);
        }
        self
    }

    /// Batches reported by each discovery, one every batch interval.
    pub fn with_batches(self, batches: Vec<Vec<ReaderIdentity>>) -> Self {
        self.script().batches = batches;
        self
    }

    pub fn with_batch_interval(self, interval: Duration) -> Self {
        self.script().batch_interval = interval;
        self
    }

    /// Whether discovery stays open after the scripted batches run out.
    pub fn keep_discovering(self, keep: bool) -> Self {
        self.script().keep_discovering = keep;
        self
    }

    pub fn fail_discovery(&self, reason: impl Into<String>) {
        self.script().discovery_failure = Some(reason.into());
    }

    pub fn fail_next_connect(&self, reason: impl Into<String>) {
        self.script().connect_failures.push_back(reason.into());
    }

    pub fn fail_next_resolve(&self, error: DeviceError) {
        self.script().resolve_failures.push_back(error);
    }

    /// The next cancel is refused and leaves the collection running.
    pub fn fail_next_cancel(&self, error: DeviceError) {
        self.script().cancel_failures.push_back(error);
    }

    pub fn script_collect(&self, collect: CollectScript) {
        self.script().collects.push_back(collect);
    }

    pub fn script_process(&self, process: ProcessScript) {
        self.script().processes.push_back(process);
    }

    /// Drops the link as an unexpected disconnect would.
    pub fn disconnect(&self) {
        {
            let mut script = self.script();
            script.status = ConnectionStatus::NotConnected;
            script.lost = script.connected.take();
        }
        self.disconnects.notify_one();
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.script().calls.clone()
    }

    pub fn collect_calls(&self) -> usize {
        self.count_calls(|call| matches!(call, DeviceCall::Collect { .. }))
    }

    pub fn process_calls(&self) -> usize {
        self.count_calls(|call| matches!(call, DeviceCall::Process { .. }))
    }

    pub fn connect_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                DeviceCall::Connect(serial) => Some(serial),
                _ => None,
            })
            .collect()
    }

    fn count_calls(&self, pred: impl Fn(&DeviceCall) -> bool) -> usize {
        self.script().calls.iter().filter(|call| pred(call)).count()
    }

    fn script(&self) -> MutexGuard<'_, DeviceScript> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn not_connected() -> DeviceError {
        DeviceError::new(DeviceErrorCode::NotConnected, "no reader is connected")
    }

    fn canceled() -> DeviceError {
        DeviceError::new(DeviceErrorCode::Canceled, "the command was canceled")
    }
}

#[async_trait]
impl DeviceDriver for SimulatedDevice {
    async fn resolve_intent(&self, client_secret: &str) -> Result<PaymentIntent, DeviceError> {
        let mut script = self.script();
        script
            .calls
            .push(DeviceCall::ResolveIntent(client_secret.to_string()));
        if script.status != ConnectionStatus::Connected {
            return Err(Self::not_connected());
        }
        if let Some(error) = script.resolve_failures.pop_front() {
            return Err(error);
        }
        let id = client_secret
            .split("_secret")
            .next()
            .unwrap_or(client_secret);
        Ok(PaymentIntent::new(id, client_secret))
    }

    async fn collect_payment_method(
        &self,
        intent: &PaymentIntent,
    ) -> Result<Collection, DeviceError> {
        let (handle, behaviour, cancel_rx) = {
            let mut script = self.script();
            script.calls.push(DeviceCall::Collect {
                intent_id: intent.id.clone(),
                status: intent.status,
            });
            if script.status != ConnectionStatus::Connected {
                return Err(Self::not_connected());
            }
            script.next_handle += 1;
            let handle = CollectHandle(script.next_handle);
            let behaviour = script.collects.pop_front().unwrap_or_default();
            let (cancel_tx, cancel_rx) = oneshot::channel();
            script.pending_cancels.insert(handle, cancel_tx);
            (handle, behaviour, cancel_rx)
        };

        let (done_tx, done_rx) = oneshot::channel();
        let (prompt_tx, prompts) = mpsc::unbounded_channel();
        let _ = prompt_tx.send(ReaderPrompt::InsertOrSwipeCard);
        let collected = intent.with_status(IntentStatus::RequiresConfirmation);
        let script = Arc::clone(&self.script);
        tokio::spawn(async move {
            let result = match behaviour {
                CollectScript::Approve { after } => {
                    tokio::select! {
                        _ = tokio::time::sleep(after) => {
                            let _ = prompt_tx.send(ReaderPrompt::RemoveCard);
                            Ok(collected)
                        }
                        _ = cancel_rx => Err(SimulatedDevice::canceled()),
                    }
                }
                CollectScript::Fail(error) => Err(error),
                CollectScript::AwaitCancel => {
                    let _ = cancel_rx.await;
                    Err(SimulatedDevice::canceled())
                }
                CollectScript::IgnoreCancel { after } => {
                    let _cancel = cancel_rx;
                    tokio::time::sleep(after).await;
                    Ok(collected)
                }
                CollectScript::CancelledOnDevice => Err(SimulatedDevice::canceled()),
            };
            script
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pending_cancels
                .remove(&handle);
            debug!(?handle, ok = result.is_ok(), "simulated collection finished");
            let _ = done_tx.send(result);
        });

        Ok(Collection {
            handle,
            completion: done_rx,
            prompts,
        })
    }

    async fn process_payment(&self, intent: &PaymentIntent) -> Result<PaymentIntent, DeviceError> {
        let behaviour = {
            let mut script = self.script();
            script.calls.push(DeviceCall::Process {
                intent_id: intent.id.clone(),
                status: intent.status,
            });
            if script.status != ConnectionStatus::Connected {
                return Err(Self::not_connected());
            }
            script.processes.pop_front().unwrap_or_default()
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        match behaviour {
            ProcessScript::Approve => Ok(intent.with_status(IntentStatus::RequiresCapture)),
            ProcessScript::Fail { code, status } => {
                let error = DeviceError::new(code, "the payment could not be processed");
                Err(match status {
                    Some(status) => error.with_intent(intent.with_status(status)),
                    None => error,
                })
            }
        }
    }

    async fn cancel(&self, handle: CollectHandle) -> Result<(), DeviceError> {
        let mut script = self.script();
        script.calls.push(DeviceCall::Cancel(handle));
        if let Some(error) = script.cancel_failures.pop_front() {
            return Err(error);
        }
        let pending = script.pending_cancels.remove(&handle);
        match pending.map(|cancel| cancel.send(())) {
            Some(Ok(())) => Ok(()),
            _ => Err(DeviceError::new(
                DeviceErrorCode::NothingToCancel,
                "no collection is in progress",
            )),
        }
    }

    async fn connection_status(&self) -> ConnectionStatus {
        self.script().status
    }

    async fn connected_reader(&self) -> Option<ReaderIdentity> {
        self.script().connected.clone()
    }

    async fn discover(&self) -> Result<DiscoveryStream, ConnectivityError> {
        let (batches, interval, keep_open) = {
            let mut script = self.script();
            script.calls.push(DeviceCall::Discover);
            if let Some(reason) = script.discovery_failure.take() {
                return Err(ConnectivityError::DiscoveryFailed(reason));
            }
            if script.status != ConnectionStatus::Connected {
                script.status = ConnectionStatus::Discovering;
            }
            (
                script.batches.clone(),
                script.batch_interval,
                script.keep_discovering,
            )
        };

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            for batch in batches {
                tokio::time::sleep(interval).await;
                if tx.send(batch).await.is_err() {
                    return;
                }
            }
            if keep_open {
                tx.closed().await;
            }
        });
        Ok(DiscoveryStream::new(rx))
    }

    async fn connect(&self, reader: &ReaderIdentity) -> Result<ReaderConnection, ConnectivityError> {
        let delay = {
            let mut script = self.script();
            script.calls.push(DeviceCall::Connect(reader.serial.clone()));
            script.status = ConnectionStatus::Connecting;
            script.connect_delay
        };
        tokio::time::sleep(delay).await;

        let mut script = self.script();
        if let Some(reason) = script.connect_failures.pop_front() {
            script.status = ConnectionStatus::NotConnected;
            return Err(ConnectivityError::ConnectFailed {
                reader: reader.clone(),
                reason,
            });
        }
        script.status = ConnectionStatus::Connected;
        script.connected = Some(reader.clone());
        debug!(serial = %reader.serial, "simulated reader connected");
        Ok(ReaderConnection::connected(reader.clone()))
    }

    async fn unexpected_disconnect(&self) -> ReaderIdentity {
        loop {
            self.disconnects.notified().await;
            let lost = self.script().lost.take();
            if let Some(reader) = lost {
                return reader;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_numbers_intents_and_replays_failures() {
        let server = SimulatedServer::new();
        server.fail_next_captures(1, ServerError::Unreachable("blip".to_string()));

        let secret = server
            .create_intent(PaymentKind::Regular, "ord-1")
            .await
            .unwrap();
        assert_eq!(secret, "pi_1_secret_sim");
        assert!(server.capture_intent("pi_1").await.is_err());
        assert!(server.capture_intent("pi_1").await.is_ok());
        assert_eq!(server.capture_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_cancel_completes_collection() {
        let device = SimulatedDevice::new().already_connected(ReaderIdentity::new("SIM-1"));
        device.script_collect(CollectScript::AwaitCancel);
        let intent = device.resolve_intent("pi_7_secret_sim").await.unwrap();
        assert_eq!(intent.id, "pi_7");

        let mut collection = device.collect_payment_method(&intent).await.unwrap();
        assert_eq!(
            collection.prompts.recv().await,
            Some(ReaderPrompt::InsertOrSwipeCard)
        );
        device.cancel(collection.handle).await.unwrap();
        let outcome = collection.outcome().await;
        assert!(outcome.unwrap_err().is_cancellation());

        // The operation is gone; a second cancel has nothing to act on.
        let again = device.cancel(CollectHandle(1)).await.unwrap_err();
        assert_eq!(again.code, DeviceErrorCode::NothingToCancel);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_cancel_leaves_collection_running() {
        let device = SimulatedDevice::new().already_connected(ReaderIdentity::new("SIM-1"));
        device.fail_next_cancel(DeviceError::new(DeviceErrorCode::Other(3), "reader busy"));
        let intent = device.resolve_intent("pi_2_secret_sim").await.unwrap();

        let collection = device.collect_payment_method(&intent).await.unwrap();
        let refused = device.cancel(collection.handle).await.unwrap_err();
        assert_eq!(refused.code, DeviceErrorCode::Other(3));
        let collected = collection.outcome().await.unwrap();
        assert_eq!(collected.status, IntentStatus::RequiresConfirmation);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_reports_the_lost_reader() {
        let device = SimulatedDevice::new().already_connected(ReaderIdentity::new("SIM-9"));
        let watcher = device.clone();
        let lost = tokio::spawn(async move { watcher.unexpected_disconnect().await });
        tokio::task::yield_now().await;

        device.disconnect();
        assert_eq!(lost.await.unwrap(), ReaderIdentity::new("SIM-9"));
        assert_eq!(device.connection_status().await, ConnectionStatus::NotConnected);
        assert_eq!(device.connected_reader().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_requires_connection() {
        let device = SimulatedDevice::new();
        let intent = PaymentIntent::new("pi_1", "pi_1_secret_sim");
        let error = device.process_payment(&intent).await.unwrap_err();
        assert_eq!(error.code, DeviceErrorCode::NotConnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_stops_when_stream_dropped() {
        let device = SimulatedDevice::new()
            .with_batches(vec![vec![ReaderIdentity::new("SIM-1")]])
            .with_batch_interval(Duration::from_millis(10));
        let mut stream = device.discover().await.unwrap();
        assert_eq!(
            stream.next_batch().await,
            Some(vec![ReaderIdentity::new("SIM-1")])
        );
        drop(stream);

        let finite = SimulatedDevice::new().keep_discovering(false);
        let mut stream = finite.discover().await.unwrap();
        assert_eq!(stream.next_batch().await, None);
    }
}
