use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use camdrop_common::config::ReceiverConfig;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, info, trace};

/// No pending connections are queued: the camera sends one frame at a time.
const LISTEN_BACKLOG: u32 = 0;

/// Listening endpoint for the camera link.
///
/// Wire protocol: the sender connects, writes one encoded image and
/// half-closes. There is no header, length prefix or delimiter; a
/// zero-length read is the only end-of-frame signal.
pub struct ListenHandle {
    listener: TcpListener,
    local_addr: SocketAddr,
    chunk_size: usize,
    idle_timeout: Option<Duration>,
}

/// One accepted sender connection. Carries exactly one frame.
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    chunk_size: usize,
    idle_timeout: Option<Duration>,
}

/// Bind the listening socket described by `config`.
///
/// An address that is already held (most often a previous session's socket
/// that has not been released yet) is reported as
/// [`ReceiveError::BindConflict`] so callers can offer a retry.
pub async fn bind(config: &ReceiverConfig) -> Result<ListenHandle, ReceiveError> {
    let target = format!("{}:{}", config.bind_addr, config.port);
    let addr = tokio::net::lookup_host(&target)
        .await
        .map_err(|e| ReceiveError::Resolve(target.clone(), e))?
        .next()
        .ok_or_else(|| {
            ReceiveError::Resolve(
                target.clone(),
                io::Error::new(io::ErrorKind::NotFound, "no addresses"),
            )
        })?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|source| ReceiveError::Bind { addr, source })?;
    // Lets a restarted session reclaim a port whose old connections are in
    // TIME_WAIT. A socket still listening on the port keeps it busy. Not set
    // on Windows, where the flag allows stealing a live listener's port.
    #[cfg(unix)]
    socket
        .set_reuseaddr(true)
        .map_err(|source| ReceiveError::Bind { addr, source })?;
    socket.bind(addr).map_err(|e| bind_error(addr, e))?;
    let listener = socket.listen(LISTEN_BACKLOG).map_err(|e| bind_error(addr, e))?;
    let local_addr = listener
        .local_addr()
        .map_err(|source| ReceiveError::Bind { addr, source })?;

    info!(addr = %local_addr, chunk_size = config.chunk_size, "listening for camera");

    Ok(ListenHandle {
        listener,
        local_addr,
        chunk_size: config.chunk_size.max(1),
        idle_timeout: match config.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        },
    })
}

fn bind_error(addr: SocketAddr, source: io::Error) -> ReceiveError {
    if source.kind() == io::ErrorKind::AddrInUse {
        ReceiveError::BindConflict { addr }
    } else {
        ReceiveError::Bind { addr, source }
    }
}

impl ListenHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next sender. Blocks indefinitely.
    pub async fn accept_one(&self) -> Result<Connection, ReceiveError> {
        let (stream, peer) = self.listener.accept().await.map_err(ReceiveError::Accept)?;
        debug!(%peer, "camera connected");
        Ok(Connection {
            stream,
            peer,
            chunk_size: self.chunk_size,
            idle_timeout: self.idle_timeout,
        })
    }
}

impl Connection {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Drain the connection until the sender closes it.
    ///
    /// The connection is consumed; a frame never spans two connections. An
    /// empty buffer means the sender closed without sending anything.
    pub async fn receive_frame(mut self) -> Result<Vec<u8>, ReceiveError> {
        let data = read_to_close(&mut self.stream, self.chunk_size, self.idle_timeout).await?;
        debug!(peer = %self.peer, bytes = data.len(), "frame received");
        Ok(data)
    }
}

/// Read `chunk_size` pieces from `reader` until a zero-length read, returning
/// every byte in arrival order.
///
/// With `idle_timeout` set, a single read that produces nothing for that long
/// aborts the receive; whatever arrived so far is dropped.
pub async fn read_to_close<R>(
    reader: &mut R,
    chunk_size: usize,
    idle_timeout: Option<Duration>,
) -> Result<Vec<u8>, ReceiveError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; chunk_size.max(1)];
    let mut buf = Vec::new();

    loop {
        let read = match idle_timeout {
            Some(limit) => tokio::time::timeout(limit, reader.read(&mut chunk))
                .await
                .map_err(|_| ReceiveError::IdleTimeout {
                    after: limit,
                    received: buf.len(),
                })?,
            None => reader.read(&mut chunk).await,
        };
        let n = read.map_err(|source| ReceiveError::Transport {
            received: buf.len(),
            source,
        })?;
        if n == 0 {
            return Ok(buf);
        }
        buf.extend_from_slice(&chunk[..n]);
        trace!(chunk = n, total = buf.len(), "received chunk");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error("address {addr} is already in use; release the stale listener and retry")]
    BindConflict { addr: SocketAddr },
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: io::Error,
    },
    #[error("failed to resolve listen address {0}: {1}")]
    Resolve(String, io::Error),
    #[error("failed to accept connection: {0}")]
    Accept(io::Error),
    #[error("connection failed after {received} bytes: {source}")]
    Transport { received: usize, source: io::Error },
    #[error("no data for {after:?} after {received} bytes")]
    IdleTimeout { after: Duration, received: usize },
}
