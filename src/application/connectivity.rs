use crate::config::ConnectivityConfig;
use crate::domain::events::ConnectionEvent;
use crate::domain::ports::{DeviceDriverRef, ReaderIdentityStoreRef, ReaderSelector, ReaderSelectorBox};
use crate::domain::reader::{ConnectionStatus, ReaderConnection, ReaderIdentity};
use crate::error::ConnectivityError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Always answers a multi-reader choice with the same index.
#[derive(Debug, Clone, Copy)]
pub struct FixedSelector(pub Option<usize>);

#[async_trait]
impl ReaderSelector for FixedSelector {
    async fn select(&self, _candidates: &[ReaderIdentity]) -> Option<usize> {
        self.0
    }
}

/// Owns the shared [`ReaderConnection`] and is the only thing that changes it.
pub struct ReaderConnectivity {
    link: Link,
    config: ConnectivityConfig,
}

impl ReaderConnectivity {
    pub fn new(
        device: DeviceDriverRef,
        identities: ReaderIdentityStoreRef,
        config: ConnectivityConfig,
    ) -> Self {
        let (sender, _) = watch::channel(ReaderConnection::default());
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            link: Link {
                device,
                identities,
                sender: Arc::new(sender),
                notices,
            },
            config,
        }
    }

    /// Read-only view of the connection for the payment engine.
    pub fn subscribe(&self) -> watch::Receiver<ReaderConnection> {
        self.link.sender.subscribe()
    }

    pub fn connection(&self) -> ReaderConnection {
        self.link.sender.borrow().clone()
    }

    /// Status changes, connections, failures and disconnects from every
    /// session and from the disconnect monitor.
    pub fn status_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.link.notices.subscribe()
    }

    /// Brings up a reader, preferring `preferred` and then the remembered
    /// reader. Each call starts a fresh discovery session.
    pub fn ensure_connected(
        &self,
        preferred: Option<ReaderIdentity>,
        selector: ReaderSelectorBox,
    ) -> DiscoverySession {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let run = DiscoveryRun {
            link: self.link.clone(),
            config: self.config.clone(),
            events: events_tx,
            selector,
            preferred,
        };
        tokio::spawn(run.run(stop_rx));
        DiscoverySession {
            events: events_rx,
            stop: Some(stop_tx),
        }
    }

    /// Connects straight to a known reader, as the manual reconnection flow
    /// does.
    pub async fn reconnect(
        &self,
        reader: &ReaderIdentity,
    ) -> Result<ReaderConnection, ConnectivityError> {
        self.link.connect(reader, None).await
    }

    pub fn handle_unexpected_disconnect(&self) {
        self.link.lose_reader(None);
    }

    /// Watches the driver for readers that drop on their own and reports
    /// each one as a disconnect.
    pub fn monitor_disconnects(&self) -> JoinHandle<()> {
        let link = self.link.clone();
        tokio::spawn(async move {
            loop {
                let reader = link.device.unexpected_disconnect().await;
                link.lose_reader(Some(reader));
            }
        })
    }
}

const NOTICE_CAPACITY: usize = 32;

/// Event stream of one discovery session.
pub struct DiscoverySession {
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    stop: Option<oneshot::Sender<()>>,
}

impl DiscoverySession {
    pub async fn next_event(&mut self) -> Option<ConnectionEvent> {
        self.events.recv().await
    }

    /// Ends discovery. The session reports `DiscoveryEnded` if it was still
    /// looking.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }

    /// Consumes events until a reader is connected or the session gives up.
    pub async fn wait_connected(&mut self) -> Result<ReaderIdentity, ConnectivityError> {
        while let Some(event) = self.next_event().await {
            match event {
                ConnectionEvent::Connected(reader) => return Ok(reader),
                ConnectionEvent::ConnectionFailed(error) => return Err(error),
                ConnectionEvent::DiscoveryStalled { after } => {
                    warn!(?after, "reader discovery is taking longer than expected");
                }
                other => debug!(?other, "connection event"),
            }
        }
        Err(ConnectivityError::DiscoveryFailed(
            "discovery ended without a reader".to_string(),
        ))
    }
}

#[derive(Clone)]
struct Link {
    device: DeviceDriverRef,
    identities: ReaderIdentityStoreRef,
    sender: Arc<watch::Sender<ReaderConnection>>,
    notices: broadcast::Sender<ConnectionEvent>,
}

impl Link {
    fn notify(&self, events: Option<&mpsc::UnboundedSender<ConnectionEvent>>, event: ConnectionEvent) {
        if let Some(events) = events {
            let _ = events.send(event.clone());
        }
        let _ = self.notices.send(event);
    }

    fn set_status(&self, status: ConnectionStatus, events: Option<&mpsc::UnboundedSender<ConnectionEvent>>) {
        self.sender.send_modify(|connection| connection.status = status);
        self.notify(events, ConnectionEvent::StatusChanged(status));
    }

    /// `reported` names the reader when the driver knows which one dropped.
    fn lose_reader(&self, reported: Option<ReaderIdentity>) {
        let mut lost = None;
        self.sender.send_modify(|connection| {
            lost = connection.reader.take().or(reported);
            connection.status = ConnectionStatus::NotConnected;
        });
        warn!(serial = ?lost.as_ref().map(|r| &r.serial), "card reader disconnected unexpectedly");
        self.notify(None, ConnectionEvent::StatusChanged(ConnectionStatus::NotConnected));
        if let Some(reader) = lost {
            self.notify(None, ConnectionEvent::Disconnected(reader));
        }
    }

    async fn connect(
        &self,
        reader: &ReaderIdentity,
        events: Option<&mpsc::UnboundedSender<ConnectionEvent>>,
    ) -> Result<ReaderConnection, ConnectivityError> {
        self.set_status(ConnectionStatus::Connecting, events);
        match self.device.connect(reader).await {
            Ok(connection) => {
                info!(serial = %reader.serial, "card reader connected");
                if let Err(error) = self.identities.remember(reader).await {
                    warn!(%error, serial = %reader.serial, "failed to remember reader");
                }
                self.sender.send_replace(ReaderConnection::connected(reader.clone()));
                self.notify(events, ConnectionEvent::StatusChanged(ConnectionStatus::Connected));
                self.notify(events, ConnectionEvent::Connected(reader.clone()));
                Ok(connection)
            }
            Err(error) => {
                warn!(%error, "card reader connection failed");
                self.set_status(ConnectionStatus::NotConnected, events);
                self.notify(events, ConnectionEvent::ConnectionFailed(error.clone()));
                Err(error)
            }
        }
    }
}

struct DiscoveryRun {
    link: Link,
    config: ConnectivityConfig,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    selector: ReaderSelectorBox,
    preferred: Option<ReaderIdentity>,
}

impl DiscoveryRun {
    async fn run(self, mut stop: oneshot::Receiver<()>) {
        if self.link.device.connection_status().await == ConnectionStatus::Connected
            && let Some(reader) = self.link.device.connected_reader().await
        {
            self.link
                .sender
                .send_replace(ReaderConnection::connected(reader.clone()));
            self.emit(ConnectionEvent::Connected(reader));
            return;
        }

        let remembered = match self.preferred.clone() {
            Some(reader) => Some(reader),
            None => self.recall().await,
        };
        self.link.sender.send_modify(|connection| {
            connection.reader = None;
            connection.remembered = remembered.clone();
        });
        self.link
            .set_status(ConnectionStatus::Discovering, Some(&self.events));

        let mut stream = match self.link.device.discover().await {
            Ok(stream) => stream,
            Err(error) => {
                warn!(%error, "reader discovery failed to start");
                self.link
                    .set_status(ConnectionStatus::NotConnected, Some(&self.events));
                self.emit(ConnectionEvent::ConnectionFailed(error));
                return;
            }
        };
        info!(remembered = ?remembered.as_ref().map(|r| &r.serial), "reader discovery started");

        let started = Instant::now();
        let stall = tokio::time::sleep(self.config.stall_timeout);
        tokio::pin!(stall);
        let mut stalled = false;

        loop {
            let batch = tokio::select! {
                _ = &mut stop => {
                    self.end_discovery();
                    return;
                }
                _ = &mut stall, if !stalled => {
                    stalled = true;
                    self.emit(ConnectionEvent::DiscoveryStalled { after: started.elapsed() });
                    continue;
                }
                batch = stream.next_batch() => batch,
            };
            let Some(batch) = batch else {
                self.end_discovery();
                return;
            };
            self.emit(ConnectionEvent::ReadersDiscovered(batch.clone()));

            // The selector may take as long as the operator does; stop and the
            // stall timer stay live meanwhile.
            let pick = self.pick(&batch, remembered.as_ref());
            tokio::pin!(pick);
            let target = loop {
                tokio::select! {
                    _ = &mut stop => {
                        self.end_discovery();
                        return;
                    }
                    _ = &mut stall, if !stalled => {
                        stalled = true;
                        self.emit(ConnectionEvent::DiscoveryStalled { after: started.elapsed() });
                    }
                    target = &mut pick => break target,
                }
            };
            let Some(target) = target else {
                continue;
            };
            // A successful or failed connection ends the session; the
            // caller decides whether to discover again.
            let _ = self.link.connect(&target, Some(&self.events)).await;
            return;
        }
    }

    /// Chooses which reader of a batch to connect to, if any.
    async fn pick(
        &self,
        batch: &[ReaderIdentity],
        remembered: Option<&ReaderIdentity>,
    ) -> Option<ReaderIdentity> {
        if let Some(known) = remembered
            && let Some(found) = batch.iter().find(|reader| reader.same_reader(known))
        {
            debug!(serial = %found.serial, "remembered reader found");
            return Some(found.clone());
        }

        match batch {
            [] => None,
            [only] => Some(only.clone()),
            candidates => {
                self.emit(ConnectionEvent::SelectionRequested(candidates.to_vec()));
                let index = self.selector.select(candidates).await?;
                match candidates.get(index) {
                    Some(reader) => Some(reader.clone()),
                    None => {
                        self.emit(ConnectionEvent::ConnectionFailed(
                            ConnectivityError::InvalidSelection {
                                index,
                                candidates: candidates.len(),
                            },
                        ));
                        None
                    }
                }
            }
        }
    }

    async fn recall(&self) -> Option<ReaderIdentity> {
        match self.link.identities.recall().await {
            Ok(reader) => reader,
            Err(error) => {
                warn!(%error, "failed to load remembered reader");
                None
            }
        }
    }

    fn end_discovery(&self) {
        self.link
            .set_status(ConnectionStatus::NotConnected, Some(&self.events));
        self.emit(ConnectionEvent::DiscoveryEnded);
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }
}
