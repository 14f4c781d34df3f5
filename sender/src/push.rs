use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use camdrop_common::config::SenderConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info};

use crate::SenderError;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];
const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Image files to send: `source` itself if it is a file, otherwise the
/// images directly inside it, sorted by name.
pub async fn collect_sources(source: &Path) -> Result<Vec<PathBuf>, SenderError> {
    let meta = tokio::fs::metadata(source)
        .await
        .map_err(|e| SenderError::read_failed(source, e))?;
    if meta.is_file() {
        return Ok(vec![source.to_path_buf()]);
    }

    let mut dir = tokio::fs::read_dir(source)
        .await
        .map_err(|e| SenderError::read_failed(source, e))?;
    let mut files = Vec::new();
    while let Some(entry) = dir
        .next_entry()
        .await
        .map_err(|e| SenderError::read_failed(source, e))?
    {
        let path = entry.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        let is_file = entry.file_type().await.is_ok_and(|t| t.is_file());
        if is_image && is_file {
            files.push(path);
        }
    }
    files.sort();

    if files.is_empty() {
        return Err(SenderError::NoImages(source.display().to_string()));
    }
    Ok(files)
}

/// Deliver one frame the way the camera does: connect, write the bytes in
/// `chunk_size` pieces, half-close, then wait for the receiver to hang up.
pub async fn push_frame(target: &str, data: &[u8], chunk_size: usize) -> Result<(), SenderError> {
    let mut stream = TcpStream::connect(target)
        .await
        .map_err(|e| SenderError::Connect {
            target: target.to_string(),
            source: e,
        })?;
    stream.set_nodelay(true).map_err(SenderError::Transport)?;

    for chunk in data.chunks(chunk_size.max(1)) {
        stream.write_all(chunk).await.map_err(SenderError::Transport)?;
    }
    stream.shutdown().await.map_err(SenderError::Transport)?;

    // The receiver closes its side once it has the whole frame.
    let mut rest = Vec::new();
    match stream.read_to_end(&mut rest).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::ConnectionReset => Ok(()),
        Err(e) => Err(SenderError::Transport(e)),
    }
}

/// Send every configured image once, pausing `interval_secs` between frames.
/// A failed delivery is retried with exponential backoff until it succeeds.
pub async fn run(config: &SenderConfig) -> Result<usize, SenderError> {
    let files = collect_sources(Path::new(&config.source)).await?;
    let interval = Duration::from_secs_f64(config.interval_secs);
    info!(
        count = files.len(),
        addr = config.target,
        interval_secs = config.interval_secs,
        "sending frames"
    );

    for (i, path) in files.iter().enumerate() {
        if i > 0 && !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| SenderError::read_failed(path, e))?;

        let mut backoff = INITIAL_BACKOFF;
        loop {
            debug!(path = %path.display(), bytes = data.len(), "pushing frame");
            match push_frame(&config.target, &data, config.chunk_size).await {
                Ok(()) => {
                    info!(path = %path.display(), bytes = data.len(), "frame sent");
                    break;
                }
                Err(e) => {
                    error!(error = %e, path = %path.display(), "send failed, retrying in {:?}", backoff);
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    Ok(files.len())
}
