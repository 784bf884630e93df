// src/main.rs - CLI entry point
//
// Exit codes: 0 clean shutdown, 2 configuration error, 3 encoder
// executable not found, 4 crash breaker tripped, 1 anything unexpected.

use clap::Parser;
use flvcast::coordinator::{Coordinator, CoordinatorConfig, Event, Outcome};
use flvcast::encoder::{probe_executable, FfmpegEncoder};
use flvcast::health::HealthMonitor;
use flvcast::server::WsServer;
use flvcast::{logging, sources, Config};
use log::{error, info};
use std::path::PathBuf;
use std::time::Duration;

/// The whole process must be gone this long after a shutdown signal.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

const EXIT_UNEXPECTED: i32 = 1;
const EXIT_CONFIG: i32 = 2;
const EXIT_ENCODER_MISSING: i32 = 3;
const EXIT_FAULTED: i32 = 4;

/// Serve a live screen capture as FLV over WebSocket.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(long, default_value = "config/config.json")]
    config: PathBuf,

    /// List capturable windows as "<title>\t<class>" and exit.
    #[arg(long)]
    list_windows: bool,
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return EXIT_CONFIG;
        }
    };
    if let Err(e) = logging::init(&config.logging) {
        eprintln!("{e}");
        return EXIT_CONFIG;
    }

    if args.list_windows {
        return list_windows();
    }

    if let Err(e) = probe_executable(&config.ffmpeg.path) {
        error!("{e}");
        return EXIT_ENCODER_MISSING;
    }

    let (events_tx, events_rx) = crossbeam_channel::unbounded();

    // SIGINT/SIGTERM turn into an orderly shutdown; a watchdog makes sure
    // a wedged teardown cannot keep the process alive.
    let signal_tx = events_tx.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = signal_tx.send(Event::Shutdown);
        std::thread::spawn(|| {
            std::thread::sleep(SHUTDOWN_DEADLINE);
            eprintln!("shutdown deadline exceeded, exiting");
            std::process::exit(EXIT_UNEXPECTED);
        });
    }) {
        error!("could not install signal handler: {e}");
        return EXIT_UNEXPECTED;
    }

    let mut server = match WsServer::start(
        &config.server.host,
        config.server.port,
        events_tx.clone(),
        config.send_queue_capacity(),
    ) {
        Ok(server) => server,
        Err(e) => {
            error!("{e}");
            return EXIT_UNEXPECTED;
        }
    };

    let health = HealthMonitor::new(config.process.crash_threshold, config.crash_window());
    let encoder = Box::new(FfmpegEncoder::new(&config));
    let coordinator = Coordinator::new(
        CoordinatorConfig::from_config(&config),
        encoder,
        health,
        events_tx,
    );

    info!(
        "ready on ws://{}/ (encoder starts with the first viewer)",
        server.local_addr()
    );
    let outcome = coordinator.run(events_rx);
    server.stop();

    match outcome {
        Outcome::Clean => {
            info!("shutdown complete");
            0
        }
        Outcome::Faulted => {
            error!("exiting with the crash breaker tripped");
            EXIT_FAULTED
        }
    }
}

fn list_windows() -> i32 {
    match sources::enumerate() {
        Ok(windows) => {
            for window in windows {
                println!("{}\t{}", window.title, window.class);
            }
            0
        }
        Err(e) => {
            error!("{e}");
            EXIT_UNEXPECTED
        }
    }
}
