use crate::application::policy::{CaptureAttempts, classify_processing_failure, collection_failure};
use crate::config::EngineConfig;
use crate::domain::events::{LifecycleEvent, OrchestrationState, Recovery};
use crate::domain::intent::PaymentIntent;
use crate::domain::ports::{CollectHandle, Collection, DeviceDriverRef, ServerClientRef, settle};
use crate::domain::reader::ReaderConnection;
use crate::domain::request::PaymentRequest;
use crate::error::{DeviceErrorCode, FailureCause, Result, TerminalError};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// A checkout waiting to begin. `started` is acknowledged once the engine
/// has entered `CreatingIntent` for it.
#[derive(Debug)]
struct Pending {
    request: PaymentRequest,
    started: oneshot::Sender<()>,
}

#[derive(Debug)]
enum Command {
    Start(Pending),
    Cancel,
}

/// Point-in-time view of the engine, published after every change.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Snapshot {
    pub state: OrchestrationState,
    pub capture_attempts: u32,
    pub cancel_requested: bool,
}

/// Caller-side handle to a running [`PaymentEngine`].
#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<Snapshot>,
}

impl EngineHandle {
    /// Begins a checkout. An active checkout is cancelled first; one that is
    /// capturing is allowed to finish.
    ///
    /// Returns once the engine is in `CreatingIntent` for this request with a
    /// zeroed capture counter, so [`EngineHandle::snapshot`] reflects it
    /// straight away.
    pub async fn start(&self, request: PaymentRequest) -> Result<()> {
        let (started, ack) = oneshot::channel();
        self.commands
            .send(Command::Start(Pending { request, started }))
            .map_err(|_| TerminalError::EngineStopped)?;
        ack.await.map_err(|_| TerminalError::Superseded)
    }

    /// Requests cancellation of the active checkout. Has no effect once
    /// capture has started.
    pub fn cancel(&self) -> Result<()> {
        self.commands
            .send(Command::Cancel)
            .map_err(|_| TerminalError::EngineStopped)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.clone()
    }
}

#[derive(Debug, Default)]
struct CancellationToken {
    requested: bool,
    collection: Option<CollectHandle>,
}

/// State owned by the engine for the request in flight.
#[derive(Debug, Default)]
struct Session {
    state: OrchestrationState,
    cancel: CancellationToken,
    capture: CaptureAttempts,
    intent: Option<PaymentIntent>,
    /// A request that arrived while this one was active.
    queued: Option<Pending>,
}

impl Session {
    /// Returns true when this call is what set the token.
    fn request_cancel(&mut self) -> bool {
        if self.state == OrchestrationState::Capturing || self.cancel.requested {
            return false;
        }
        self.cancel.requested = true;
        true
    }
}

enum Phase {
    Load(PaymentRequest),
    Collect(PaymentIntent),
    Process(PaymentIntent),
    Capture(PaymentIntent),
    Wait { delay: Duration, then: Box<Phase> },
}

enum Step {
    Continue(Phase),
    Finished,
}

/// Drives one checkout at a time through
/// intent → collect → process → capture.
///
/// The engine runs as a single task. Adapter completions and caller commands
/// are serialized through `tokio::select!`, so the per-request [`Session`]
/// needs no locking. Every outcome, including failures, is reported as a
/// [`LifecycleEvent`]; nothing is logged here.
pub struct PaymentEngine {
    server: ServerClientRef,
    device: DeviceDriverRef,
    reader: watch::Receiver<ReaderConnection>,
    config: EngineConfig,
    events: mpsc::UnboundedSender<LifecycleEvent>,
    snapshot: watch::Sender<Snapshot>,
}

impl PaymentEngine {
    /// Spawns the engine task and returns its handle and event stream.
    ///
    /// `reader` is the connection published by the connectivity controller;
    /// the engine only reads it. The task stops once every handle is dropped
    /// and the active checkout has finished.
    pub fn spawn(
        server: ServerClientRef,
        device: DeviceDriverRef,
        reader: watch::Receiver<ReaderConnection>,
        config: EngineConfig,
    ) -> (EngineHandle, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::default());

        let engine = Self {
            server,
            device,
            reader,
            config,
            events: events_tx,
            snapshot: snapshot_tx,
        };
        tokio::spawn(engine.run(commands_rx));

        let handle = EngineHandle {
            commands: commands_tx,
            snapshot: snapshot_rx,
        };
        (handle, events_rx)
    }

    async fn run(self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut next = None;
        loop {
            let pending = match next.take() {
                Some(pending) => pending,
                None => match commands.recv().await {
                    Some(Command::Start(pending)) => pending,
                    // Nothing active to cancel.
                    Some(Command::Cancel) => continue,
                    None => break,
                },
            };
            next = self.drive(pending, &mut commands).await;
        }
    }

    /// Runs one request to a terminal state and returns the request queued
    /// behind it, if any.
    async fn drive(
        &self,
        pending: Pending,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Option<Pending> {
        let mut session = Session::default();
        self.transition(&mut session, OrchestrationState::CreatingIntent);
        self.emit(LifecycleEvent::IntentLoadingStarted);
        // The caller may have given up waiting; the checkout still runs.
        let _ = pending.started.send(());

        let mut phase = Phase::Load(pending.request);
        loop {
            let step = match phase {
                Phase::Load(request) => self.load_intent(&mut session, commands, request).await,
                Phase::Collect(intent) => self.collect(&mut session, commands, intent).await,
                Phase::Process(intent) => self.process(&mut session, commands, intent).await,
                Phase::Capture(intent) => self.capture(&mut session, commands, intent).await,
                Phase::Wait { delay, then } => self.wait(&mut session, commands, delay, *then).await,
            };
            match step {
                Step::Continue(next) => phase = next,
                Step::Finished => break,
            }
        }
        session.queued.take()
    }

    async fn load_intent(
        &self,
        session: &mut Session,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        request: PaymentRequest,
    ) -> Step {
        if let Err(reason) = request.validate() {
            return self.fail_loading(session, FailureCause::InvalidRequest(reason));
        }

        let created = self
            .until_done(
                session,
                commands,
                self.server
                    .create_intent(request.kind, &request.correlation_id),
            )
            .await;
        if self.cancelled(session, commands) {
            return self.finish_cancelled(session, None);
        }
        let secret = match created {
            Ok(secret) => secret,
            Err(error) => {
                return self.fail_loading(session, FailureCause::ServerUnreachable(error));
            }
        };

        let reader_connected = self.reader.borrow().is_connected();
        if !reader_connected {
            self.transition(session, OrchestrationState::AwaitingConnection);
            return self.fail_loading(session, FailureCause::ReaderNotConnected);
        }

        let resolved = self
            .until_done(session, commands, self.device.resolve_intent(&secret))
            .await;
        if self.cancelled(session, commands) {
            return self.finish_cancelled(session, resolved.ok());
        }
        match resolved {
            Ok(intent) => {
                session.intent = Some(intent.clone());
                self.emit(LifecycleEvent::IntentLoaded(intent.clone()));
                Step::Continue(Phase::Collect(intent))
            }
            Err(error) if error.code == DeviceErrorCode::NotConnected => {
                self.fail_loading(session, FailureCause::ReaderDisconnected(error))
            }
            Err(error) => self.fail_loading(session, FailureCause::IntentUnavailable(error)),
        }
    }

    async fn collect(
        &self,
        session: &mut Session,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        intent: PaymentIntent,
    ) -> Step {
        if self.cancelled(session, commands) {
            return self.finish_cancelled(session, Some(intent));
        }
        self.transition(session, OrchestrationState::CollectingMethod);

        let started = self
            .until_done(session, commands, self.device.collect_payment_method(&intent))
            .await;
        let collection = match started {
            Ok(collection) => collection,
            Err(error) => return self.collection_ended(session, commands, intent, Err(error)),
        };

        let Collection {
            handle,
            completion,
            mut prompts,
        } = collection;
        session.cancel.collection = Some(handle);
        if session.cancel.requested {
            self.cancel_collection(handle).await;
        }

        let outcome = settle(completion);
        tokio::pin!(outcome);
        let result = loop {
            tokio::select! {
                biased;
                result = &mut outcome => break result,
                Some(prompt) = prompts.recv() => self.emit(LifecycleEvent::ReaderPrompt(prompt)),
                Some(command) = commands.recv() => {
                    if self.absorb(session, command) {
                        self.cancel_collection(handle).await;
                    }
                }
            }
        };
        while let Ok(prompt) = prompts.try_recv() {
            self.emit(LifecycleEvent::ReaderPrompt(prompt));
        }
        session.cancel.collection = None;
        self.collection_ended(session, commands, intent, result)
    }

    fn collection_ended(
        &self,
        session: &mut Session,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        intent: PaymentIntent,
        result: std::result::Result<PaymentIntent, crate::error::DeviceError>,
    ) -> Step {
        // A requested cancel or the device's cancellation code beats any
        // other result.
        let device_cancelled = matches!(&result, Err(error) if error.is_cancellation());
        if self.cancelled(session, commands) || device_cancelled {
            self.emit(LifecycleEvent::CollectionCancelled);
            let latest = result.ok().unwrap_or(intent);
            return self.finish_cancelled(session, Some(latest));
        }

        match result {
            Ok(collected) => {
                session.intent = Some(collected.clone());
                self.emit(LifecycleEvent::MethodCollected(collected.clone()));
                Step::Continue(Phase::Process(collected))
            }
            Err(error) => {
                self.emit(LifecycleEvent::CollectionFailed(error.clone()));
                self.finish_failed(session, collection_failure(error), Some(intent))
            }
        }
    }

    async fn cancel_collection(&self, handle: CollectHandle) {
        if let Err(error) = self.device.cancel(handle).await {
            self.emit(LifecycleEvent::CancelFailed(error));
        }
    }

    async fn process(
        &self,
        session: &mut Session,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        intent: PaymentIntent,
    ) -> Step {
        if self.cancelled(session, commands) {
            return self.finish_cancelled(session, Some(intent));
        }
        self.transition(session, OrchestrationState::Processing);

        let result = self
            .until_done(session, commands, self.device.process_payment(&intent))
            .await;
        if self.cancelled(session, commands) {
            let latest = match result {
                Ok(processed) => processed,
                Err(error) => error.intent.unwrap_or(intent),
            };
            return self.finish_cancelled(session, Some(latest));
        }

        let error = match result {
            Ok(processed) => {
                session.intent = Some(processed.clone());
                self.emit(LifecycleEvent::Processed(processed.clone()));
                return Step::Continue(Phase::Capture(processed));
            }
            Err(error) => error,
        };

        let verdict = classify_processing_failure(&error, &intent);
        session.intent = Some(verdict.intent.clone());
        self.emit(LifecycleEvent::ProcessingFailed {
            error: error.clone(),
            status: verdict.status,
            intent: verdict.intent.clone(),
            recovery: verdict.recovery,
            message: verdict.message.to_string(),
        });

        let resume_at = match verdict.recovery {
            Recovery::ResumeAtProcessing => Phase::Process(verdict.intent),
            Recovery::ResumeAtCollection => Phase::Collect(verdict.intent),
            Recovery::Fatal => {
                let cause = verdict.failure_cause(error);
                return self.finish_failed(session, cause, Some(verdict.intent));
            }
        };
        Step::Continue(Phase::Wait {
            delay: self.config.resume_delay,
            then: Box::new(resume_at),
        })
    }

    /// A cancellable pause before `then`.
    async fn wait(
        &self,
        session: &mut Session,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        delay: Duration,
        then: Phase,
    ) -> Step {
        let timer = tokio::time::sleep(delay);
        tokio::pin!(timer);
        loop {
            tokio::select! {
                biased;
                Some(command) = commands.recv() => {
                    self.absorb(session, command);
                    if session.cancel.requested {
                        let intent = session.intent.clone();
                        return self.finish_cancelled(session, intent);
                    }
                }
                _ = &mut timer => return Step::Continue(then),
            }
        }
    }

    /// Captures until success or until the retry budget runs out. Cancellation
    /// is not honored here: a processed payment must be recorded.
    async fn capture(
        &self,
        session: &mut Session,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        intent: PaymentIntent,
    ) -> Step {
        session.capture.enter(&intent.id);
        self.transition(session, OrchestrationState::Capturing);

        loop {
            let attempt = session.capture.record_attempt();
            self.publish(session);

            let result = self
                .until_done(session, commands, self.server.capture_intent(&intent.id))
                .await;
            let error = match result {
                Ok(()) => {
                    self.transition(session, OrchestrationState::Succeeded);
                    self.emit(LifecycleEvent::Succeeded(intent));
                    return Step::Finished;
                }
                Err(error) => error,
            };

            self.emit(LifecycleEvent::CaptureFailed {
                attempt,
                error: error.clone(),
            });
            match self.config.capture.next_delay(attempt) {
                Some(delay) => {
                    self.until_done(session, commands, tokio::time::sleep(delay))
                        .await;
                }
                None => {
                    let cause = FailureCause::CaptureExhausted {
                        attempts: attempt,
                        last_error: error,
                    };
                    return self.finish_failed(session, cause, Some(intent));
                }
            }
        }
    }

    /// Awaits `op` while still accepting commands.
    async fn until_done<F: Future>(
        &self,
        session: &mut Session,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        op: F,
    ) -> F::Output {
        tokio::pin!(op);
        loop {
            tokio::select! {
                biased;
                output = &mut op => return output,
                Some(command) = commands.recv() => {
                    self.absorb(session, command);
                }
            }
        }
    }

    /// Applies a command received mid-flight. Returns true when it newly set
    /// the cancellation token.
    fn absorb(&self, session: &mut Session, command: Command) -> bool {
        let newly_cancelled = match command {
            Command::Cancel => session.request_cancel(),
            Command::Start(pending) => {
                // Replacing an earlier queued start fails that caller with
                // `Superseded`.
                session.queued = Some(pending);
                session.request_cancel()
            }
        };
        if newly_cancelled {
            self.publish(session);
        }
        newly_cancelled
    }

    /// Drains pending commands and reports whether cancellation is requested.
    fn cancelled(
        &self,
        session: &mut Session,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> bool {
        while let Ok(command) = commands.try_recv() {
            self.absorb(session, command);
        }
        session.cancel.requested
    }

    fn fail_loading(&self, session: &mut Session, cause: FailureCause) -> Step {
        self.emit(LifecycleEvent::IntentLoadingFailed(cause.clone()));
        self.finish_failed(session, cause, None)
    }

    fn finish_failed(
        &self,
        session: &mut Session,
        cause: FailureCause,
        intent: Option<PaymentIntent>,
    ) -> Step {
        self.transition(session, OrchestrationState::Failed);
        self.emit(LifecycleEvent::Failed { cause, intent });
        Step::Finished
    }

    fn finish_cancelled(&self, session: &mut Session, intent: Option<PaymentIntent>) -> Step {
        self.transition(session, OrchestrationState::Cancelled);
        self.emit(LifecycleEvent::Cancelled { intent });
        Step::Finished
    }

    fn transition(&self, session: &mut Session, to: OrchestrationState) {
        session.state = to;
        self.publish(session);
        self.emit(LifecycleEvent::StateChanged(to));
    }

    fn publish(&self, session: &Session) {
        self.snapshot.send_replace(Snapshot {
            state: session.state,
            capture_attempts: session.capture.count(),
            cancel_requested: session.cancel.requested,
        });
    }

    fn emit(&self, event: LifecycleEvent) {
        // The listener may be gone; the checkout still runs to completion.
        let _ = self.events.send(event);
    }
}
