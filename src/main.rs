//! Daemon entry point.
//!
//! Wires the coordinator to the real world: command-line arguments,
//! process diagnostics via `tracing`, Unix signals, and exit codes.
//!
//! - `SIGINT` / `SIGTERM`: graceful shutdown (flush, join, exit 0).
//! - `SIGHUP`: reload `config.json`; honored only while Idle.
//!
//! Exit codes: 0 normal shutdown, 2 configuration invalid at boot, 3 a
//! required device is unavailable at boot, 4 persistent storage is
//! unavailable at boot.
//!
//! `--loopback` runs the full stack against simulated peripherals that
//! acknowledge every command, for bring-up on a bench without hardware.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use instrumentd::config::{reference_settings, Settings};
use instrumentd::coordinator::{Deps, SystemCoordinator};
use instrumentd::error::ControlError;
use instrumentd::rpc::channel::LoopbackOpener;
use instrumentd::rpc::{PortOpener, TtyOpener};
use instrumentd::ui::TextPanel;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "instrumentd", about = "Instrument control-plane daemon")]
struct Cli {
    /// Storage root holding config.json and logs/.
    #[arg(long, default_value = "/data/instrument")]
    root: PathBuf,

    /// Configuration file (defaults to <root>/config.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Logging verbosity (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Run against simulated peripherals instead of real serial ports.
    #[arg(long)]
    loopback: bool,
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to build runtime: {}", err);
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(run(cli));
    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        root = %cli.root.display(),
        loopback = cli.loopback,
        "starting instrumentd"
    );

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| cli.root.join("config.json"));

    let settings = if cli.loopback && !config_path.exists() {
        tracing::info!("no config file; loopback mode uses the reference protocol");
        reference_settings()
    } else {
        match Settings::load(&config_path) {
            Ok(settings) => settings,
            Err(err) => {
                tracing::error!(path = %config_path.display(), error = %err, "configuration rejected");
                return 2;
            }
        }
    };

    let opener: Arc<dyn PortOpener> = if cli.loopback {
        Arc::new(LoopbackOpener)
    } else {
        Arc::new(TtyOpener::new(settings.port_map()))
    };

    let shutdown = CancellationToken::new();
    let mut coordinator = SystemCoordinator::new(
        settings,
        cli.root.clone(),
        Deps {
            opener,
            // The gpio-backed RawInput is bound by the platform layer; the
            // daemon itself only exposes the seam.
            raw_input: None,
            panel: Box::new(TextPanel::new()),
            config_path: Some(config_path),
        },
        shutdown.clone(),
    );

    spawn_signal_handler(shutdown, coordinator.reload_flag());

    match coordinator.run().await {
        Ok(()) => 0,
        Err(err) => {
            tracing::error!(error = %err, "daemon exited with error");
            match err {
                ControlError::Config(_) | ControlError::Configuration(_) => 2,
                ControlError::DeviceUnavailable { .. } => 3,
                ControlError::StorageUnavailable(_) => 4,
                _ => 1,
            }
        }
    }
}

fn spawn_signal_handler(
    shutdown: CancellationToken,
    reload: Arc<std::sync::atomic::AtomicBool>,
) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup()).expect("SIGHUP handler");

        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if result.is_ok() {
                        tracing::info!("received SIGINT, shutting down");
                    }
                    shutdown.cancel();
                    return;
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                    shutdown.cancel();
                    return;
                }
                _ = sighup.recv() => {
                    tracing::info!("received SIGHUP, requesting config reload");
                    reload.store(true, Ordering::SeqCst);
                }
            }
        }
    });
}
