use std::sync::Arc;

use camdrop_common::config::{validate_shots, ConfigError};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{CaptureEvent, CaptureMode, SessionState};
use super::state::CaptureSession;

const EVENT_BUFFER: usize = 256;

enum SessionCommand {
    Start(CaptureMode, CancellationToken),
    Retry(CancellationToken),
    AcknowledgeError,
}

/// Cloneable handle to a [`CaptureSession`] running on its own task.
///
/// Commands are queued to the worker that owns the session; state is read
/// through a watch channel and events are fanned out to any number of
/// subscribers.
#[derive(Clone)]
pub struct SessionController {
    commands: mpsc::Sender<SessionCommand>,
    events: broadcast::Sender<CaptureEvent>,
    state: watch::Receiver<SessionState>,
    /// Cancels the run in flight. `Some` from the moment a run is requested
    /// until the worker finishes it.
    running: Arc<Mutex<Option<CancellationToken>>>,
}

impl SessionController {
    /// Move `session` onto a worker task. `session_events` is the receiving
    /// end of the channel the session was built with.
    pub fn spawn(
        session: CaptureSession,
        session_events: mpsc::UnboundedReceiver<CaptureEvent>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(8);
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER);
        let state = session.subscribe_state();
        let running = Arc::new(Mutex::new(None));

        tokio::spawn(Self::forward_events(session_events, event_tx.clone()));
        tokio::spawn(Self::worker(session, command_rx, Arc::clone(&running)));

        Self {
            commands: command_tx,
            events: event_tx,
            state,
            running,
        }
    }

    async fn forward_events(
        mut session_events: mpsc::UnboundedReceiver<CaptureEvent>,
        events: broadcast::Sender<CaptureEvent>,
    ) {
        while let Some(event) = session_events.recv().await {
            // No subscribers is fine.
            let _ = events.send(event);
        }
        debug!("session event stream closed");
    }

    async fn worker(
        mut session: CaptureSession,
        mut commands: mpsc::Receiver<SessionCommand>,
        running: Arc<Mutex<Option<CancellationToken>>>,
    ) {
        info!("capture worker started");
        while let Some(command) = commands.recv().await {
            let result = match command {
                SessionCommand::Start(mode, cancel) => Some(session.run(mode, &cancel).await),
                SessionCommand::Retry(cancel) => Some(session.retry(&cancel).await),
                SessionCommand::AcknowledgeError => {
                    session.acknowledge_error();
                    None
                }
            };
            if let Some(result) = result {
                running.lock().await.take();
                if let Err(e) = result {
                    warn!(error = %e, "capture run ended with an error");
                }
            }
        }
        info!("capture worker stopped");
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.events.subscribe()
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Request a new run. Fails if one is already running or the last run
    /// ended in an error that has not been acknowledged.
    pub async fn start(&self, mode: CaptureMode) -> Result<(), ControlError> {
        if let CaptureMode::Manual { shots } = mode {
            validate_shots(shots)?;
        }
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ControlError::Busy);
        }
        let state = self.state();
        if state.is_error() {
            return Err(ControlError::NeedsAcknowledge(state));
        }

        let cancel = CancellationToken::new();
        self.send(SessionCommand::Start(mode, cancel.clone())).await?;
        *running = Some(cancel);
        info!(?mode, "capture requested");
        Ok(())
    }

    /// Re-run the last mode from an error state.
    pub async fn retry(&self) -> Result<(), ControlError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ControlError::Busy);
        }
        let state = self.state();
        if !state.is_error() {
            return Err(ControlError::NothingToRetry(state));
        }

        let cancel = CancellationToken::new();
        self.send(SessionCommand::Retry(cancel.clone())).await?;
        *running = Some(cancel);
        info!("retry requested");
        Ok(())
    }

    /// Cancel the current run. Returns `false` if nothing was running.
    pub async fn stop(&self) -> bool {
        match self.running.lock().await.as_ref() {
            Some(cancel) => {
                info!("stop requested");
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn acknowledge_error(&self) -> Result<(), ControlError> {
        let running = self.running.lock().await;
        if running.is_some() {
            return Err(ControlError::Busy);
        }
        self.send(SessionCommand::AcknowledgeError).await
    }

    async fn send(&self, command: SessionCommand) -> Result<(), ControlError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ControlError::Closed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("a capture is already running")]
    Busy,
    #[error("session is in {0}; acknowledge or retry first")]
    NeedsAcknowledge(SessionState),
    #[error("session is {0}, nothing to retry")]
    NothingToRetry(SessionState),
    #[error(transparent)]
    InvalidRequest(#[from] ConfigError),
    #[error("capture worker has stopped")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::events::{ErrorKind, RunSummary};
    use crate::storage::FrameStore;
    use crate::test_support::{scratch_dir, solid_jpeg};
    use camdrop_common::config::{ReceiverConfig, Sensitivity};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn controller(name: &str, port: u16) -> (TempDir, SessionController, FrameStore) {
        let dir = scratch_dir(name);
        let store = FrameStore::new(dir.path(), "jpg", 90);
        store.ensure_dir().await.unwrap();
        let receiver = ReceiverConfig {
            bind_addr: "127.0.0.1".into(),
            port,
            chunk_size: 64,
            idle_timeout_secs: 5,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let session = CaptureSession::new(receiver, store.clone(), tx);
        (dir, SessionController::spawn(session, rx), store)
    }

    async fn wait_for(
        events: &mut broadcast::Receiver<CaptureEvent>,
        mut wanted: impl FnMut(&CaptureEvent) -> bool,
    ) -> CaptureEvent {
        let wait = async {
            loop {
                let event = events.recv().await.expect("event stream closed");
                if wanted(&event) {
                    return event;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(10), wait)
            .await
            .expect("timed out waiting for event")
    }

    async fn listening(events: &mut broadcast::Receiver<CaptureEvent>) -> SocketAddr {
        match wait_for(events, |e| matches!(e, CaptureEvent::Listening { .. })).await {
            CaptureEvent::Listening { addr } => addr,
            _ => unreachable!(),
        }
    }

    fn finished(event: &CaptureEvent) -> bool {
        matches!(event, CaptureEvent::Finished { .. })
    }

    #[tokio::test]
    async fn manual_run_through_controller() {
        let (_dir, control, store) = controller("control-manual", 0).await;
        let mut events = control.subscribe();
        control.start(CaptureMode::Manual { shots: 1 }).await.unwrap();

        let addr = listening(&mut events).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&solid_jpeg(16, 16, [10, 20, 30])).await.unwrap();
        stream.shutdown().await.unwrap();
        let _ = stream.read_to_end(&mut Vec::new()).await;

        let event = wait_for(&mut events, finished).await;
        assert!(matches!(
            event,
            CaptureEvent::Finished {
                summary: RunSummary { saved: 1, .. }
            }
        ));
        assert_eq!(store.list().await.unwrap().len(), 1);

        let mut state = control.watch_state();
        state.wait_for(|s| s.is_idle()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while control.is_running().await {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn second_start_is_refused_until_stopped() {
        let (_dir, control, _store) = controller("control-busy", 0).await;
        let mut events = control.subscribe();
        let mode = CaptureMode::Continuous {
            sensitivity: Sensitivity::Medium,
        };
        control.start(mode).await.unwrap();
        assert!(matches!(control.start(mode).await, Err(ControlError::Busy)));

        listening(&mut events).await;
        assert!(control.stop().await);
        let event = wait_for(&mut events, finished).await;
        assert!(matches!(
            event,
            CaptureEvent::Finished {
                summary: RunSummary {
                    cancelled: true,
                    ..
                }
            }
        ));
    }

    #[tokio::test]
    async fn invalid_shot_counts_are_rejected() {
        let (_dir, control, _store) = controller("control-shots", 0).await;
        for shots in [0, 11] {
            assert!(matches!(
                control.start(CaptureMode::Manual { shots }).await,
                Err(ControlError::InvalidRequest(_))
            ));
        }
        assert!(!control.is_running().await);
        assert!(!control.stop().await);
    }

    #[tokio::test]
    async fn error_state_requires_acknowledge() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = blocker.local_addr().unwrap().port();
        let (_dir, control, _store) = controller("control-error", port).await;
        let mut state = control.watch_state();

        control.start(CaptureMode::Manual { shots: 1 }).await.unwrap();
        state.wait_for(|s| s.is_error()).await.unwrap();
        assert_eq!(control.state(), SessionState::Error(ErrorKind::BindConflict));

        // The worker clears the running flag right after the run returns.
        tokio::time::timeout(Duration::from_secs(5), async {
            while control.is_running().await {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert!(matches!(
            control.start(CaptureMode::Manual { shots: 1 }).await,
            Err(ControlError::NeedsAcknowledge(_))
        ));
        control.acknowledge_error().await.unwrap();
        state.wait_for(|s| s.is_idle()).await.unwrap();
        assert!(matches!(
            control.retry().await,
            Err(ControlError::NothingToRetry(SessionState::Idle))
        ));
    }
}
