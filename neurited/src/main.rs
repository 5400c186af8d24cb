//! Neurite Daemon - long-running learning substrate service
//!
//! This daemon runs continuously in the background, managing:
//! - The substrate and its timed tick loop
//! - Periodic and on-exit checkpoints
//! - JSON-lines learning telemetry
//! - IPC server for sensory producers and readers
//!
//! Storage locations (override with `NEURITE_DATA_DIR`):
//! - Linux: ~/.local/share/neurite/
//! - Windows: %APPDATA%\neurite\
//! - MacOS: ~/Library/Application Support/neurite/

use std::fs::OpenOptions;
use std::io::BufWriter;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use neurite::prelude::*;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{error, info, warn};

mod config;
mod error;
mod ipc;
mod paths;

use config::DaemonConfig;
use error::DaemonError;
use ipc::{Daemon, Request, Response, MAX_LINE_BYTES};
use paths::AppPaths;

// ═══════════════════════════════════════════════════════════════════════════
// Startup
// ═══════════════════════════════════════════════════════════════════════════

/// Resume from the checkpoint if one exists, otherwise build the configured
/// topology. A checkpoint that fails to load stops startup rather than being
/// overwritten by a fresh substrate.
fn open_substrate(paths: &AppPaths, cfg: &DaemonConfig) -> Result<Substrate, DaemonError> {
    let checkpoint = paths.checkpoint_file();
    if checkpoint.exists() {
        let substrate = Substrate::load(&checkpoint)?;
        info!(
            tick = substrate.tick(),
            regions = substrate.regions().len(),
            synapses = substrate.synapse_count(),
            "resumed from checkpoint"
        );
        if *substrate.config() != cfg.substrate {
            warn!("checkpoint carries its own substrate config; config file values ignored");
        }
        return Ok(substrate);
    }
    info!("no checkpoint found, building topology");
    cfg.topology.build(cfg.substrate)
}

fn open_telemetry(paths: &AppPaths) -> Result<JsonLinesSink<BufWriter<std::fs::File>>, DaemonError> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.telemetry_file())?;
    Ok(JsonLinesSink::new(BufWriter::new(file)))
}

// ═══════════════════════════════════════════════════════════════════════════
// Clients
// ═══════════════════════════════════════════════════════════════════════════

async fn handle_client(
    stream: TcpStream,
    daemon: Daemon,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut lines = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

    while let Some(line) = lines.next().await {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                let d = daemon.clone();
                tokio::task::spawn_blocking(move || d.handle(request)).await?
            }
            Err(e) => Response::Error {
                message: format!("Invalid request: {}", e),
            },
        };
        lines.send(serde_json::to_string(&response)?).await?;
        if daemon.is_stopping() {
            break;
        }
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Main
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Setup application paths
    let paths = AppPaths::new()?;
    info!("Data directory: {:?}", paths.data_dir());
    info!("Checkpoint file: {:?}", paths.checkpoint_file());

    let cfg = DaemonConfig::load_or_default(&paths.config_file())?;
    let substrate = match open_substrate(&paths, &cfg) {
        Ok(s) => s,
        Err(e) => {
            error!("Could not open substrate: {}", e);
            return Err(e.into());
        }
    };

    let scheduler = Scheduler::new(substrate)?
        .with_telemetry(open_telemetry(&paths)?)
        .with_checkpoint(paths.checkpoint_file(), cfg.checkpoint_every);
    let daemon = Daemon::new(scheduler, paths.checkpoint_file());

    // Tick loop on a dedicated blocking thread
    let mut ticker = {
        let scheduler = daemon.scheduler().clone();
        let stop = daemon.stop_flag();
        let period = Duration::from_millis(cfg.tick_period_ms);
        tokio::task::spawn_blocking(move || scheduler.run(&stop, period))
    };

    // Start IPC server
    let listener = TcpListener::bind(&cfg.listen).await?;
    info!("Neurite daemon listening on {}", cfg.listen);

    // Accept client connections until Ctrl-C, a shutdown request, or the
    // tick loop exiting on its own.
    let mut ticker_done = None;
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        continue;
                    }
                };
                info!("Client connected: {}", addr);
                let daemon = daemon.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, daemon).await {
                        error!("Client handler error: {}", e);
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received");
                break;
            }
            _ = daemon.shutdown_requested() => break,
            joined = &mut ticker => {
                ticker_done = Some(joined);
                break;
            }
        }
    }

    daemon.stop_flag().store(true, Ordering::Release);
    let joined = match ticker_done {
        Some(joined) => joined,
        None => ticker.await,
    };
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Tick loop failed: {}", e),
        Err(e) => error!("Tick loop panicked: {}", e),
    }

    // Persist on exit to keep online-learned state
    let saver = daemon.clone();
    match tokio::task::spawn_blocking(move || saver.scheduler().checkpoint(saver.checkpoint_path()))
        .await?
    {
        Ok(()) => info!("Checkpoint saved on exit"),
        Err(e) => error!("Exit checkpoint failed: {}", e),
    }
    Ok(())
}
