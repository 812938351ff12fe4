use clap::{Parser, ValueEnum};
use miette::{IntoDiagnostic, Result};
use paydesk::application::connectivity::{FixedSelector, ReaderConnectivity};
use paydesk::application::engine::PaymentEngine;
use paydesk::config::TerminalConfig;
use paydesk::domain::events::LifecycleEvent;
use paydesk::domain::intent::IntentStatus;
use paydesk::domain::ports::ReaderIdentityStoreRef;
use paydesk::domain::reader::ReaderIdentity;
use paydesk::error::{DeviceErrorCode, ServerError, TerminalError};
use paydesk::infrastructure::in_memory::InMemoryReaderStore;
use paydesk::infrastructure::json_file::JsonFileReaderStore;
use paydesk::infrastructure::simulated::{ProcessScript, SimulatedDevice, SimulatedServer};
use paydesk::interfaces::csv::outcome_writer::{CheckoutOutcome, OutcomeWriter};
use paydesk::interfaces::csv::request_reader::RequestReader;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Intent status reported by the first, failing, processing attempt.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProcessingFailure {
    RequiresPaymentMethod,
    RequiresConfirmation,
    Canceled,
    Unreported,
}

impl ProcessingFailure {
    fn script(self) -> ProcessScript {
        let (code, status) = match self {
            Self::RequiresPaymentMethod => {
                (DeviceErrorCode::Declined, Some(IntentStatus::RequiresPaymentMethod))
            }
            Self::RequiresConfirmation => {
                (DeviceErrorCode::Timeout, Some(IntentStatus::RequiresConfirmation))
            }
            Self::Canceled => (DeviceErrorCode::Other(0), Some(IntentStatus::Canceled)),
            Self::Unreported => (DeviceErrorCode::Other(0), None),
        };
        ProcessScript::Fail { code, status }
    }
}

/// Runs checkouts from a CSV file against a simulated card reader and
/// payment server, printing one outcome row per checkout.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input checkouts CSV file (kind,reference,amount,currency)
    input: PathBuf,

    /// Number of simulated readers found by discovery
    #[arg(long, default_value_t = 1)]
    readers: usize,

    /// Reader index to pick when discovery finds several
    #[arg(long)]
    select: Option<usize>,

    /// Serial number of the reader to prefer
    #[arg(long)]
    reader: Option<String>,

    /// Number of capture calls the simulated server rejects
    #[arg(long, default_value_t = 0)]
    capture_failures: usize,

    /// Make the first processing attempt fail this way
    #[arg(long, value_enum)]
    processing_failure: Option<ProcessingFailure>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = TerminalConfig::from_env().map_err(TerminalError::from)?;

    let server = SimulatedServer::new();
    if cli.capture_failures > 0 {
        server.fail_next_captures(
            cli.capture_failures,
            ServerError::Unreachable("simulated outage".to_string()),
        );
    }

    let nearby: Vec<ReaderIdentity> = (1..=cli.readers)
        .map(|i| ReaderIdentity::labelled(format!("SIM-{i:04}"), format!("Simulated reader {i}")))
        .collect();
    let device = SimulatedDevice::new()
        .with_batches(vec![nearby])
        .with_batch_interval(Duration::from_millis(100))
        .keep_discovering(false);
    if let Some(failure) = cli.processing_failure {
        device.script_process(failure.script());
    }

    let identities: ReaderIdentityStoreRef = match &config.reader_store {
        Some(path) => Arc::new(JsonFileReaderStore::new(path)),
        None => Arc::new(InMemoryReaderStore::new()),
    };

    let connectivity =
        ReaderConnectivity::new(Arc::new(device.clone()), identities, config.connectivity.clone());
    let mut session = connectivity.ensure_connected(
        cli.reader.map(ReaderIdentity::new),
        Box::new(FixedSelector(cli.select)),
    );
    match session.wait_connected().await {
        Ok(reader) => info!(serial = %reader.serial, "ready to take payments"),
        Err(error) => warn!(%error, "continuing without a card reader"),
    }
    connectivity.monitor_disconnects();

    let (engine, mut events) = PaymentEngine::spawn(
        Arc::new(server),
        Arc::new(device),
        connectivity.subscribe(),
        config.engine.clone(),
    );

    let file = File::open(&cli.input).into_diagnostic()?;
    let mut writer = OutcomeWriter::new(io::stdout());
    for (index, request) in RequestReader::new(file).requests().enumerate() {
        let outcome = match request {
            Ok(request) => {
                let reference = request.correlation_id.clone();
                engine.start(request).await?;
                loop {
                    let event = events.recv().await.ok_or(TerminalError::EngineStopped)?;
                    debug!(?event, %reference, "lifecycle event");
                    match &event {
                        LifecycleEvent::CaptureFailed { attempt, error } => {
                            warn!(attempt, %error, %reference, "capture failed");
                        }
                        LifecycleEvent::ReaderPrompt(prompt) => info!(%prompt, %reference, "reader says"),
                        _ => {}
                    }
                    let attempts = engine.snapshot().capture_attempts;
                    if let Some(outcome) = CheckoutOutcome::from_event(&reference, &event, attempts) {
                        break outcome;
                    }
                }
            }
            Err(error) => {
                // Header is line 1.
                warn!(%error, line = index + 2, "skipping unreadable checkout");
                CheckoutOutcome::rejected(format!("line {}", index + 2), error)
            }
        };
        writer.write_outcome(&outcome)?;
    }

    Ok(())
}
