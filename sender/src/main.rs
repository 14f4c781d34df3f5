mod push;

use std::path::{Path, PathBuf};

use camdrop_common::config::Config;
use tracing::{error, info};

#[derive(Debug, thiserror::Error)]
pub enum SenderError {
    #[error("cannot read {path}: {source}")]
    Source { path: String, source: std::io::Error },
    #[error("no image files in {0}")]
    NoImages(String),
    #[error("failed to connect to {target}: {source}")]
    Connect { target: String, source: std::io::Error },
    #[error("connection failed mid-frame: {0}")]
    Transport(std::io::Error),
}

impl SenderError {
    fn read_failed(path: &Path, source: std::io::Error) -> Self {
        Self::Source {
            path: path.display().to_string(),
            source,
        }
    }
}

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

    info!(
        addr = config.sender.target,
        source = config.sender.source,
        chunk_size = config.sender.chunk_size,
        "starting camdrop camera emulator"
    );

    tokio::select! {
        result = push::run(&config.sender) => match result {
            Ok(sent) => info!(sent, "all frames sent"),
            Err(e) => {
                error!(error = %e, "sender failed");
                std::process::exit(1);
            }
        },
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }
}
