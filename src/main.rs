//! CLI entry point for cpl_daq
//!
//! Runs a CPL scan against the simulated instrument set, using the same configuration,
//! logging and controllers a real setup would use.
//!
//! ```bash
//! cpl_daq scan --start 500 --end 480 --step 5 --dwell 0.2 --reps 2 --name demo
//! ```

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use cpl_daq::config::{CplConfig, DEFAULT_CONFIG_PATH};
use cpl_daq::hardware::mock::MockRig;
use cpl_daq::logging::{self, OutputFormat, TracingConfig};
use cpl_daq::scan::{ScanEvent, ScanParameters};
use cpl_daq::store::MemoryStore;
use cpl_daq::CplApp;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

#[derive(Parser)]
#[command(name = "cpl_daq")]
#[command(about = "CPL spectral acquisition on simulated instruments", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log output format: pretty, compact or json
    #[arg(long, global = true, default_value = "compact")]
    log_format: OutputFormat,

    /// Log span enter and exit events
    #[arg(long, global = true)]
    log_spans: bool,

    /// Disable colored log output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one scan and print the resulting spectrum
    Scan {
        #[arg(long, default_value_t = 500.0)]
        start: f64,
        #[arg(long, default_value_t = 490.0)]
        end: f64,
        #[arg(long, default_value_t = 2.0)]
        step: f64,
        /// Dwell time per point in seconds
        #[arg(long, default_value_t = 0.2)]
        dwell: f64,
        #[arg(long, default_value_t = 1)]
        reps: u32,
        #[arg(long, default_value = "demo")]
        name: String,
        /// Measure the AC background without modulation
        #[arg(long)]
        modulation_off: bool,
        /// Phase jitter of the simulated demodulators in degrees
        #[arg(long, default_value_t = 2.0)]
        jitter: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Arc::new(CplConfig::load_from(&cli.config)?);

    let (alerts, mut alert_rx) = logging::alert_channel();
    let tracing_config = TracingConfig::from_config(&config)
        .map_err(|e| anyhow!(e))?
        .with_format(cli.log_format)
        .with_span_events(cli.log_spans)
        .with_ansi(!cli.no_color);
    logging::init(tracing_config, Some(alerts)).map_err(|e| anyhow!(e))?;
    tokio::spawn(async move {
        while let Some(alert) = alert_rx.recv().await {
            eprintln!("!! [{}] {}", alert.timestamp.format("%H:%M:%S"), alert.message);
        }
    });

    match cli.command {
        Commands::Scan {
            start,
            end,
            step,
            dwell,
            reps,
            name,
            modulation_off,
            jitter,
        } => {
            let mut params = ScanParameters::new(start, end, step, dwell, &name).with_repetitions(reps);
            params.modulation_off = modulation_off;
            run_scan(config, params, jitter).await
        }
    }
}

async fn run_scan(config: Arc<CplConfig>, params: ScanParameters, jitter: f64) -> Result<()> {
    let mut rig = MockRig::new();
    rig.lockin = rig.lockin.with_noise(jitter).await;

    let store = Arc::new(MemoryStore::new());
    let app = CplApp::new(rig.instruments(config), store.clone());
    app.initialize().await?;

    let mut events = app.scan().subscribe();
    let mut progress = app.scan().progress_watch();
    tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let current = *progress.borrow_and_update();
            info!("Progress: {}", current);
        }
    });

    app.start_scan(params).await?;
    loop {
        match events.recv().await {
            Ok(ScanEvent::Point { run, point }) => println!(
                "run {} {:>8.2} nm  dc {:.5}  ac {:+.3e}  glum {:+.3e}",
                run, point.wavelength, point.dc, point.ac, point.glum
            ),
            Ok(ScanEvent::Finished { .. }) | Err(RecvError::Closed) => break,
            Ok(_) | Err(RecvError::Lagged(_)) => {}
        }
    }
    let outcome = app.scan().wait().await;

    let shutdown = app.shutdown().await;
    let outcome = outcome?;
    println!();
    println!("Saved: {}", store.saved_names().await.join(", "));
    if let Some(reason) = &outcome.abort_reason {
        println!("Aborted: {}", reason);
    }
    if let Some(avg) = &outcome.average {
        println!("Average over {} repetitions: {} points", outcome.spectra.len(), avg.len());
    }
    shutdown?;
    Ok(())
}
