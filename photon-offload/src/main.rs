//! photon-offload: talk to a photon-transport backend or replay its output.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{error, info, warn};
use serde_json::json;

use photon_offload::logging::init_logging;
use photon_offload::{
    HitSink, IdealResponse, OffloadConfig, OffloadContext, PmtHit, PmtInfoTable, ProtocolClient,
    ReplayTable, RunController, RunMode,
};

/// photon-offload - Optical photon offload client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory where log files are stored (overrides config)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Handshake with a live backend and print its PMT geometry summary
    Probe {
        /// Backend endpoint (overrides config)
        #[arg(short, long)]
        endpoint: Option<String>,

        /// Resolve the endpoint as a broker name
        #[arg(long)]
        broker: bool,
    },

    /// Replay recorded photoelectrons against a detector catalog
    Replay {
        /// Replay file (overrides config)
        #[arg(short, long)]
        table: Option<PathBuf>,

        /// Detector PMT catalog (JSON)
        #[arg(short, long)]
        catalog: PathBuf,

        /// Stop after this many events
        #[arg(long)]
        max_events: Option<u32>,
    },

    /// Print event and PMT counts of a replay file
    Inspect {
        /// Replay file (overrides config)
        table: Option<PathBuf>,
    },
}

/// Counts hits per detector PMT and creator process.
#[derive(Default)]
struct HitTally {
    per_pmt: BTreeMap<u32, u64>,
    per_process: BTreeMap<&'static str, u64>,
    total_charge: f64,
}

impl HitSink for HitTally {
    fn record_hit(&mut self, hit: PmtHit) {
        *self.per_pmt.entry(hit.pmt_id).or_default() += 1;
        *self.per_process.entry(hit.creator_process_name()).or_default() += 1;
        self.total_charge += hit.charge;
    }
}

fn main() {
    let args = Args::parse();

    let mut config = match OffloadConfig::resolve(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };
    if let Some(dir) = &args.log_dir {
        config.logging.log_dir = Some(dir.clone());
    }

    if let Err(e) = init_logging(
        config.logging.log_dir.as_deref(),
        config.logging.retention_days,
        config.logging.level.as_deref(),
        args.verbose,
    ) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(args.command, config) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run(command: Command, mut config: OffloadConfig) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Probe { endpoint, broker } => {
            if let Some(endpoint) = endpoint {
                config.backend.endpoint = endpoint;
            }
            config.backend.use_broker |= broker;
            probe(&config)
        }
        Command::Replay {
            table,
            catalog,
            max_events,
        } => {
            if let Some(table) = table {
                config.replay.table = table;
            }
            replay(config, &catalog, max_events)
        }
        Command::Inspect { table } => {
            let path = table.unwrap_or(config.replay.table);
            let replay = ReplayTable::open(&path)?;
            let summary = json!({
                "table": path.display().to_string(),
                "events": replay.event_count()?,
                "pmts": replay.pmt_count()?,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
    }
}

fn probe(config: &OffloadConfig) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = OffloadContext::new()?;
    let mut client = ProtocolClient::connect(&ctx, &config.client_settings())?;
    let info = client.start()?.clone();

    let mut types: BTreeMap<u32, usize> = BTreeMap::new();
    for t in &info.types {
        *types.entry(*t).or_default() += 1;
    }
    client.stop();

    let summary = json!({
        "endpoint": config.backend.endpoint,
        "pmts": info.len(),
        "types": types,
        "reconnects": client.reconnects(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn replay(
    config: OffloadConfig,
    catalog_path: &Path,
    max_events: Option<u32>,
) -> Result<(), Box<dyn std::error::Error>> {
    let recorded = ReplayTable::open(&config.replay.table)?.event_count()?;
    let events = match max_events {
        Some(max) => recorded.min(max as u64),
        None => recorded,
    };

    let catalog = PmtInfoTable::load_json(catalog_path)?;
    info!("Loaded {} PMTs from {}", catalog.pmts.len(), catalog_path.display());

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        ctrlc::set_handler(move || interrupted.store(true, Ordering::SeqCst))?;
    }

    let mut controller = RunController::new(config, catalog, IdealResponse)?;
    controller.begin_run(RunMode::Replay)?;

    let mut tally = HitTally::default();
    for event in 0..events as u32 {
        if interrupted.load(Ordering::SeqCst) {
            warn!("Interrupted after {} events", event);
            break;
        }
        controller.process_event(event, &mut tally)?;
    }

    let metrics = controller.end_run().unwrap_or_default();
    let summary = json!({
        "metrics": metrics,
        "hits_per_process": tally.per_process,
        "pmts_hit": tally.per_pmt.len(),
        "total_charge": tally.total_charge,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
