use std::path::PathBuf;

use camdrop_capture::session::{CaptureEvent, CaptureMode, CaptureSession};
use camdrop_capture::storage::FrameStore;
use camdrop_common::config::{CaptureModeKind, Config};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    let mode = match config.capture.mode {
        CaptureModeKind::Manual => CaptureMode::Manual {
            shots: config.capture.shots,
        },
        CaptureModeKind::Continuous => CaptureMode::Continuous {
            sensitivity: config.capture.sensitivity,
        },
    };

    info!(
        bind_addr = config.receiver.bind_addr,
        port = config.receiver.port,
        chunk_size = config.receiver.chunk_size,
        dir = config.storage.dir,
        balance = config.balance.enabled,
        ?mode,
        "starting camdrop capture"
    );

    let store = match FrameStore::open(&config.storage).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to open frame store");
            std::process::exit(1);
        }
    };

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let mut session = CaptureSession::from_config(&config, store, event_tx);
    tokio::spawn(log_events(event_rx));

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping after the current frame");
            ctrl_c.cancel();
        }
    });

    match session.run(mode, &cancel).await {
        Ok(summary) => {
            info!(
                saved = summary.saved,
                kept = summary.kept,
                discarded = summary.discarded,
                "done"
            );
        }
        Err(e) if e.is_bind_conflict() => {
            error!(
                error = %e,
                "listen port is in use; stop the other program holding it and run again"
            );
            std::process::exit(1);
        }
        Err(e) => {
            error!(error = %e, "capture failed");
            std::process::exit(1);
        }
    }
}

/// The session logs its own progress; events are echoed at debug level as
/// the JSON a collaborator would receive.
async fn log_events(mut events: mpsc::UnboundedReceiver<CaptureEvent>) {
    while let Some(event) = events.recv().await {
        match serde_json::to_string(&event) {
            Ok(json) => debug!(event = json, "capture event"),
            Err(e) => warn!(error = %e, "unserializable capture event"),
        }
    }
}
