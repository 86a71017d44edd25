use ble_battery_batch::config::Options;
use ble_battery_batch::discovery::discover;
use ble_battery_batch::orchestrator::{Orchestrator, PhaseGate, Proceed, RunError, StdinGate};
use ble_battery_batch::source::RadioSource;
use ble_battery_batch::target::load_entries;
use ble_battery_batch::telemetry::{EventReporter, HttpTelemetry, IdentifierResolver, Offline};
use clap::Parser;
use std::panic::{self, PanicHookInfo};
use std::sync::Arc;
use tokio::sync::watch;

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

fn init_logging(verbose: bool) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if verbose {
        builder.filter_module("ble_battery_batch", log::LevelFilter::Debug);
    }
    builder.init();
}

/// Flip the shutdown flag on the first Ctrl-C.
fn watch_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, finishing with the results collected so far");
            let _ = tx.send(true);
        }
        // Keep the sender alive so receivers never see a closed channel.
        std::future::pending::<()>().await;
    });
    rx
}

async fn collect_entries(options: &Options, source: &RadioSource) -> Result<Vec<String>, RunError> {
    let mut entries = options.entries.clone();

    if let Some(path) = &options.input {
        entries.extend(load_entries(path, options.max_batch)?);
    }

    if let Some(duration) = options.discover {
        match discover(source, &options.port, duration, options.min_rssi).await {
            Ok(devices) => {
                for device in &devices {
                    log::info!("  {} RSSI {}", device.address, device.rssi);
                }
                entries.extend(devices.iter().map(|d| d.address.compact()));
            }
            Err(e) => log::error!("Discovery failed: {e}"),
        }
    }

    Ok(entries)
}

async fn run(options: Options) -> Result<(), RunError> {
    let source = RadioSource::new(options.backend);
    let shutdown = watch_ctrl_c();

    let entries = collect_entries(&options, &source).await?;
    if entries.is_empty() {
        log::warn!("Nothing to test: pass entries, --input or --discover");
        return Ok(());
    }
    log::info!("Testing {} entries", entries.len());

    let http = if options.offline {
        None
    } else {
        match HttpTelemetry::new(options.telemetry_config()) {
            Ok(http) => Some(http),
            Err(e) => {
                log::error!("HTTP client unavailable, running offline: {e}");
                None
            }
        }
    };
    let (resolver, reporter): (&dyn IdentifierResolver, &dyn EventReporter) = match &http {
        Some(http) => (http, http),
        None => (&Offline, &Offline),
    };

    let gate: &dyn PhaseGate = if options.confirm_post {
        &StdinGate
    } else {
        &Proceed
    };

    let orchestrator = Orchestrator::new(
        &source,
        resolver,
        reporter,
        Arc::new(options.report_sink()),
        options.batch_config(),
        shutdown,
    )
    .with_gate(gate);

    let mut stdout = std::io::stdout();
    orchestrator.run(&entries, &mut stdout).await?;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Clean exit codes for whatever supervises the station
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    dotenv::dotenv().ok();
    let options = Options::parse();
    init_logging(options.verbose);

    match run(options).await {
        Ok(()) => std::process::exit(EXIT_SUCCESS),
        Err(why) => {
            log::error!("{why}");
            eprintln!("error: {}", why);
            std::process::exit(EXIT_ERROR);
        }
    }
}
