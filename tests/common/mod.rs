#![allow(dead_code)]

use assert_cmd::cargo_bin;
use paydesk::application::connectivity::{FixedSelector, ReaderConnectivity};
use paydesk::application::engine::{EngineHandle, PaymentEngine};
use paydesk::config::TerminalConfig;
use paydesk::domain::events::LifecycleEvent;
use paydesk::domain::reader::ReaderIdentity;
use paydesk::infrastructure::in_memory::InMemoryReaderStore;
use paydesk::infrastructure::simulated::{SimulatedDevice, SimulatedServer};
use rand::Rng;
use std::fs::File;
use std::io::Error;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use tokio::sync::mpsc;

/// The CLI with every delay shortened.
pub fn paydesk() -> Command {
    let mut cmd = Command::new(cargo_bin!("paydesk"));
    cmd.env("PAYDESK_CAPTURE_RETRY_DELAY_MS", "5")
        .env("PAYDESK_RESUME_DELAY_MS", "5")
        .env("PAYDESK_DISCOVERY_STALL_MS", "1000")
        .env_remove("PAYDESK_CAPTURE_MAX_ATTEMPTS")
        .env_remove("PAYDESK_READER_STORE");
    cmd
}

pub fn generate_checkouts(path: &Path, rows: usize) -> Result<(), Error> {
    let file = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().from_writer(file);
    wtr.write_record(["kind", "reference", "amount", "currency"])?;

    let mut rng = rand::thread_rng();
    for i in 1..=rows {
        let kind = if rng.gen_bool(0.5) { "regular" } else { "event" };
        let cents: u32 = rng.gen_range(50..=50_000);
        let reference = format!("ref-{i}");
        let amount = format!("{}.{:02}", cents / 100, cents % 100);
        wtr.write_record([kind, reference.as_str(), amount.as_str(), "usd"])?;
    }

    wtr.flush()?;
    Ok(())
}

pub fn nearby(count: usize) -> Vec<ReaderIdentity> {
    (1..=count)
        .map(|i| ReaderIdentity::labelled(format!("SIM-{i:04}"), format!("Counter {i}")))
        .collect()
}

/// A terminal wired to simulated adapters, with the reader already
/// brought up through the connectivity controller.
pub struct Terminal {
    pub server: SimulatedServer,
    pub device: SimulatedDevice,
    pub connectivity: ReaderConnectivity,
    pub engine: EngineHandle,
    pub events: mpsc::UnboundedReceiver<LifecycleEvent>,
}

impl Terminal {
    pub async fn connect(device: SimulatedDevice, select: Option<usize>) -> Self {
        let server = SimulatedServer::new();
        let config = TerminalConfig::default();
        let connectivity = ReaderConnectivity::new(
            Arc::new(device.clone()),
            Arc::new(InMemoryReaderStore::new()),
            config.connectivity.clone(),
        );
        let mut session = connectivity.ensure_connected(None, Box::new(FixedSelector(select)));
        session.wait_connected().await.unwrap();

        let (engine, events) = PaymentEngine::spawn(
            Arc::new(server.clone()),
            Arc::new(device.clone()),
            connectivity.subscribe(),
            config.engine,
        );
        Self {
            server,
            device,
            connectivity,
            engine,
            events,
        }
    }

    /// Collects events up to and including the next terminal one.
    pub async fn until_terminal(&mut self) -> Vec<LifecycleEvent> {
        let mut seen = Vec::new();
        while let Some(event) = self.events.recv().await {
            let done = event.is_terminal();
            seen.push(event);
            if done {
                break;
            }
        }
        seen
    }
}
