use std::time::Duration;

use camdrop_common::config::{Config, ReceiverConfig};
use camdrop_common::frame::FrameId;
use chrono::Utc;
use image::GrayImage;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::balance::ColorBalancer;
use crate::filter::{to_gray, ScoreError, SimilarityGate, SimilarityScorer, Ssim};
use crate::frame::{encode_jpeg, Frame, FrameError};
use crate::receiver::{self, ListenHandle, ReceiveError};
use crate::storage::{FrameStore, StorageError};

use super::events::{CaptureEvent, CaptureMode, ErrorKind, RunSummary, SessionState};

/// Pause after a failed accept so a persistent error does not spin.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// The frame the next continuous-mode candidate is compared against.
struct KeptFrame {
    id: FrameId,
    gray: GrayImage,
}

/// Output of the CPU-bound part of a cycle.
struct ProcessedFrame {
    encoded: Vec<u8>,
    gray: GrayImage,
}

/// Drives the camera link through one capture run at a time.
///
/// `Idle -> Binding -> Listening -> Receiving -> Deciding -> (Listening | Idle)`
///
/// Every per-frame failure becomes a [`CaptureEvent::Error`] and the session
/// goes back to listening. Only a bind failure or a failed save ends a run,
/// leaving the session in [`SessionState::Error`] until
/// [`acknowledge_error`](Self::acknowledge_error) or [`retry`](Self::retry).
///
/// The listening socket lives exactly as long as one run: it is dropped on
/// completion, cancellation and error alike.
pub struct CaptureSession {
    receiver: ReceiverConfig,
    store: FrameStore,
    balancer: Option<ColorBalancer>,
    scorer: Box<dyn SimilarityScorer>,
    events: mpsc::UnboundedSender<CaptureEvent>,
    state: watch::Sender<SessionState>,
    last_mode: Option<CaptureMode>,
    last_timestamp: i64,
}

impl CaptureSession {
    pub fn new(
        receiver: ReceiverConfig,
        store: FrameStore,
        events: mpsc::UnboundedSender<CaptureEvent>,
    ) -> Self {
        Self {
            receiver,
            store,
            balancer: Some(ColorBalancer::default()),
            scorer: Box::new(Ssim::default()),
            events,
            state: watch::Sender::new(SessionState::Idle),
            last_mode: None,
            last_timestamp: i64::MIN,
        }
    }

    pub fn from_config(
        config: &Config,
        store: FrameStore,
        events: mpsc::UnboundedSender<CaptureEvent>,
    ) -> Self {
        Self::new(config.receiver.clone(), store, events)
            .with_balancer(ColorBalancer::from_config(&config.balance))
    }

    pub fn with_balancer(mut self, balancer: Option<ColorBalancer>) -> Self {
        self.balancer = balancer;
        self
    }

    pub fn with_scorer(mut self, scorer: Box<dyn SimilarityScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn store(&self) -> &FrameStore {
        &self.store
    }

    /// Run one capture from `Idle` until it completes, is cancelled or fails.
    ///
    /// Cancellation is observed between frames and while waiting for a
    /// connection; a frame that is already being received is finished first.
    pub async fn run(
        &mut self,
        mode: CaptureMode,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, SessionError> {
        let state = self.state();
        if !state.is_idle() {
            return Err(SessionError::NotIdle(state));
        }
        self.last_mode = Some(mode);
        self.execute(mode, cancel).await
    }

    /// Re-run the last mode after a run ended in an error, typically a bind
    /// conflict that the operator has since cleared.
    pub async fn retry(&mut self, cancel: &CancellationToken) -> Result<RunSummary, SessionError> {
        let state = self.state();
        if !state.is_error() {
            return Err(SessionError::NotIdle(state));
        }
        let mode = self.last_mode.ok_or(SessionError::NothingToRetry)?;
        info!(?mode, "retrying capture");
        self.set_state(SessionState::Idle);
        self.execute(mode, cancel).await
    }

    /// Clear an error state without retrying.
    pub fn acknowledge_error(&mut self) {
        if self.state().is_error() {
            debug!("error acknowledged");
            self.set_state(SessionState::Idle);
        }
    }

    async fn execute(
        &mut self,
        mode: CaptureMode,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, SessionError> {
        info!(?mode, "capture session starting");
        self.set_state(SessionState::Binding);

        let handle = match receiver::bind(&self.receiver).await {
            Ok(handle) => handle,
            Err(e) => {
                let kind = match e {
                    ReceiveError::BindConflict { .. } => ErrorKind::BindConflict,
                    _ => ErrorKind::Bind,
                };
                error!(error = %e, "could not open camera listener");
                self.fail(kind, &e);
                return Err(SessionError::Receive(e));
            }
        };
        self.emit(CaptureEvent::Listening {
            addr: handle.local_addr(),
        });

        let result = self.capture_loop(&handle, mode, cancel).await;
        drop(handle);

        match result {
            Ok(summary) => {
                info!(
                    saved = summary.saved,
                    kept = summary.kept,
                    discarded = summary.discarded,
                    cancelled = summary.cancelled,
                    "capture session finished"
                );
                self.set_state(SessionState::Idle);
                self.emit(CaptureEvent::Finished { summary });
                Ok(summary)
            }
            Err(e) => {
                error!(error = %e, "capture session halted");
                self.fail(ErrorKind::Storage, &e);
                Err(e)
            }
        }
    }

    async fn capture_loop(
        &mut self,
        handle: &ListenHandle,
        mode: CaptureMode,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, SessionError> {
        let mut summary = RunSummary::default();
        let (mut remaining, gate) = match mode {
            CaptureMode::Manual { shots } => (Some(shots), None),
            CaptureMode::Continuous { sensitivity } => {
                (None, Some(SimilarityGate::for_sensitivity(sensitivity)))
            }
        };
        let mut prior = match gate {
            Some(_) => self.load_prior().await,
            None => None,
        };

        loop {
            if remaining == Some(0) {
                break;
            }
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            self.set_state(SessionState::Listening);
            if let Some(remaining) = remaining {
                info!(remaining, "waiting for shot");
                self.emit(CaptureEvent::Pending { remaining });
            }

            let accepted = tokio::select! {
                _ = cancel.cancelled() => {
                    summary.cancelled = true;
                    break;
                }
                accepted = handle.accept_one() => accepted,
            };
            let conn = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    self.report(ErrorKind::Transport, &e);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            };

            self.set_state(SessionState::Receiving);
            let peer = conn.peer_addr();
            let data = match conn.receive_frame().await {
                Ok(data) => data,
                Err(e) => {
                    let kind = match e {
                        ReceiveError::IdleTimeout { .. } => ErrorKind::Timeout,
                        _ => ErrorKind::Transport,
                    };
                    warn!(%peer, error = %e, "receive failed, partial frame dropped");
                    self.report(kind, &e);
                    continue;
                }
            };
            if data.is_empty() {
                debug!(%peer, "sender closed without data, not counting a shot");
                continue;
            }
            info!(%peer, bytes = data.len(), "frame received");
            self.emit(CaptureEvent::Received {
                bytes: data.len(),
                peer,
            });

            self.set_state(SessionState::Deciding);
            let captured_at = self.next_timestamp();
            let processed = match self.process(data, captured_at).await {
                Ok(processed) => processed,
                Err(e) => {
                    let kind = match e {
                        FrameError::Encode(_) => ErrorKind::Storage,
                        _ => ErrorKind::Decode,
                    };
                    warn!(%peer, error = %e, "frame dropped");
                    self.report(kind, &e);
                    continue;
                }
            };

            let id = self
                .store
                .save(captured_at, &processed.encoded)
                .await
                .map_err(SessionError::Storage)?;
            summary.saved += 1;
            info!(%id, "frame saved");
            self.emit(CaptureEvent::Saved { id });

            match gate {
                None => {
                    summary.kept += 1;
                    remaining = remaining.map(|n| n.saturating_sub(1));
                }
                Some(gate) => {
                    self.decide(gate, id, processed.gray, &mut prior, &mut summary)
                        .await;
                }
            }
        }

        Ok(summary)
    }

    /// Continuous mode: keep the new frame or roll it back as a duplicate.
    async fn decide(
        &mut self,
        gate: SimilarityGate,
        id: FrameId,
        gray: GrayImage,
        prior: &mut Option<KeptFrame>,
        summary: &mut RunSummary,
    ) {
        let Some(previous) = prior.as_ref() else {
            debug!(%id, "no earlier frame to compare against");
            summary.kept += 1;
            self.emit(CaptureEvent::Kept { id, score: None });
            *prior = Some(KeptFrame { id, gray });
            return;
        };

        match self.scorer.score(&previous.gray, &gray) {
            Ok(score) if gate.is_duplicate(score) => {
                info!(
                    %id,
                    prior = %previous.id,
                    score,
                    threshold = gate.threshold(),
                    "near-duplicate, removing"
                );
                match self.store.delete(&id).await {
                    Ok(()) => {
                        summary.discarded += 1;
                        self.emit(CaptureEvent::Discarded { id, score });
                    }
                    Err(e) => {
                        // The file stays on disk but is not promoted to prior.
                        warn!(%id, error = %e, "failed to remove duplicate frame");
                        self.report(ErrorKind::Storage, &e);
                    }
                }
            }
            Ok(score) => {
                info!(
                    %id,
                    prior = %previous.id,
                    score,
                    threshold = gate.threshold(),
                    scorer = self.scorer.name(),
                    "new scene, keeping"
                );
                summary.kept += 1;
                self.emit(CaptureEvent::Kept {
                    id,
                    score: Some(score),
                });
                *prior = Some(KeptFrame { id, gray });
            }
            Err(e) => {
                warn!(%id, prior = %previous.id, error = %e, "comparison skipped, keeping frame");
                self.emit(CaptureEvent::ComparisonSkipped {
                    id,
                    reason: e.to_string(),
                });
                let kind = match e {
                    ScoreError::DimensionMismatch { .. } => ErrorKind::DimensionMismatch,
                    ScoreError::TooSmall { .. } => ErrorKind::FrameTooSmall,
                };
                self.report(kind, &e);
                summary.kept += 1;
                self.emit(CaptureEvent::Kept { id, score: None });
                *prior = Some(KeptFrame { id, gray });
            }
        }
    }

    /// Decode, balance, encode and reduce to grayscale off the async runtime.
    async fn process(&self, data: Vec<u8>, captured_at: i64) -> Result<ProcessedFrame, FrameError> {
        let balancer = self.balancer;
        let quality = self.store.jpeg_quality();
        tokio::task::spawn_blocking(move || -> Result<ProcessedFrame, FrameError> {
            let frame = Frame::decode(&data, captured_at)?;
            let image = match balancer {
                Some(balancer) => balancer.correct(&frame.image),
                None => frame.image,
            };
            let encoded = encode_jpeg(&image, quality)?;
            Ok(ProcessedFrame {
                encoded,
                gray: to_gray(&image),
            })
        })
        .await
        .map_err(|e| FrameError::Decode(format!("frame processing panicked: {e}")))?
    }

    /// The newest stored frame, so the first frame of a continuous run is
    /// compared against whatever was captured last.
    async fn load_prior(&self) -> Option<KeptFrame> {
        let id = match self.store.latest().await {
            Ok(Some(id)) => id,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "could not list stored frames, starting without a prior");
                return None;
            }
        };
        let data = match self.store.read(&id).await {
            Ok(data) => data,
            Err(e) => {
                warn!(%id, error = %e, "could not read latest frame, starting without a prior");
                return None;
            }
        };
        let decoded = tokio::task::spawn_blocking(move || {
            Frame::decode(&data, id.captured_at).map(|frame| to_gray(&frame.image))
        })
        .await;
        match decoded {
            Ok(Ok(gray)) => {
                debug!(%id, "comparing against latest stored frame");
                Some(KeptFrame { id, gray })
            }
            Ok(Err(e)) => {
                warn!(%id, error = %e, "latest stored frame unreadable, starting without a prior");
                None
            }
            Err(e) => {
                warn!(%id, error = %e, "decoding latest stored frame panicked");
                None
            }
        }
    }

    /// Wall-clock seconds, never earlier than a timestamp already handed out.
    fn next_timestamp(&mut self) -> i64 {
        let now = Utc::now().timestamp();
        if now < self.last_timestamp {
            warn!(now, last = self.last_timestamp, "clock went backwards, reusing last timestamp");
        }
        self.last_timestamp = now.max(self.last_timestamp);
        self.last_timestamp
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "session state");
            self.emit(CaptureEvent::StateChanged { state });
        }
    }

    /// A per-frame failure: reported, the run continues.
    fn report(&self, kind: ErrorKind, error: &dyn std::error::Error) {
        self.emit(CaptureEvent::Error {
            kind,
            message: error.to_string(),
            halted: false,
        });
    }

    /// A run-ending failure.
    fn fail(&self, kind: ErrorKind, error: &dyn std::error::Error) {
        self.emit(CaptureEvent::Error {
            kind,
            message: error.to_string(),
            halted: true,
        });
        self.set_state(SessionState::Error(kind));
    }

    fn emit(&self, event: CaptureEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Receive(#[from] ReceiveError),
    #[error("failed to save frame: {0}")]
    Storage(#[from] StorageError),
    #[error("session is {0}, not idle")]
    NotIdle(SessionState),
    #[error("no earlier run to retry")]
    NothingToRetry,
}

impl SessionError {
    pub fn is_bind_conflict(&self) -> bool {
        matches!(self, SessionError::Receive(ReceiveError::BindConflict { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{scratch_dir, solid_jpeg};
    use camdrop_common::config::Sensitivity;
    use std::collections::VecDeque;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;

    /// Returns pre-set scores and records the mean of each prior it saw.
    struct ScriptedScorer {
        scores: Mutex<VecDeque<f64>>,
        priors: Arc<Mutex<Vec<f64>>>,
    }

    impl ScriptedScorer {
        fn new(scores: &[f64]) -> (Self, Arc<Mutex<Vec<f64>>>) {
            let priors = Arc::new(Mutex::new(Vec::new()));
            let scorer = Self {
                scores: Mutex::new(scores.iter().copied().collect()),
                priors: Arc::clone(&priors),
            };
            (scorer, priors)
        }
    }

    impl SimilarityScorer for ScriptedScorer {
        fn score(&mut self, prior: &GrayImage, _candidate: &GrayImage) -> Result<f64, ScoreError> {
            let mean = prior.pixels().map(|p| p.0[0] as f64).sum::<f64>()
                / f64::from(prior.width() * prior.height());
            self.priors.lock().unwrap().push(mean);
            Ok(self.scores.lock().unwrap().pop_front().expect("unexpected comparison"))
        }
    }

    fn loopback(port: u16) -> ReceiverConfig {
        ReceiverConfig {
            bind_addr: "127.0.0.1".into(),
            port,
            chunk_size: 64,
            idle_timeout_secs: 5,
        }
    }

    async fn open_store(name: &str) -> (TempDir, FrameStore) {
        let dir = scratch_dir(name);
        let store = FrameStore::new(dir.path(), "jpg", 90);
        store.ensure_dir().await.unwrap();
        (dir, store)
    }

    type Running = JoinHandle<(CaptureSession, Result<RunSummary, SessionError>)>;

    fn spawn_run(mut session: CaptureSession, mode: CaptureMode, cancel: CancellationToken) -> Running {
        tokio::spawn(async move {
            let result = session.run(mode, &cancel).await;
            (session, result)
        })
    }

    async fn next_event(
        events: &mut mpsc::UnboundedReceiver<CaptureEvent>,
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

    async fn listening_addr(events: &mut mpsc::UnboundedReceiver<CaptureEvent>) -> SocketAddr {
        match next_event(events, |e| matches!(e, CaptureEvent::Listening { .. })).await {
            CaptureEvent::Listening { addr } => addr,
            _ => unreachable!(),
        }
    }

    /// Behave like the camera: connect, write, half-close, wait for the
    /// receiver to hang up.
    async fn send(addr: SocketAddr, payload: &[u8]) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(payload).await.unwrap();
        stream.shutdown().await.unwrap();
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest).await;
    }

    fn is_outcome(event: &CaptureEvent) -> bool {
        matches!(
            event,
            CaptureEvent::Kept { .. } | CaptureEvent::Discarded { .. }
        )
    }

    #[tokio::test]
    async fn manual_session_saves_exactly_n_frames() {
        let (_dir, store) = open_store("session-manual").await;
        let (tx, mut events) = mpsc::unbounded_channel();
        let session = CaptureSession::new(loopback(0), store.clone(), tx);
        let run = spawn_run(session, CaptureMode::Manual { shots: 3 }, CancellationToken::new());

        let addr = listening_addr(&mut events).await;
        for (i, color) in [[200, 30, 30], [30, 200, 30], [30, 30, 200]].into_iter().enumerate() {
            send(addr, &solid_jpeg(32, 24, color)).await;
            let event = next_event(&mut events, |e| matches!(e, CaptureEvent::Saved { .. })).await;
            assert!(matches!(event, CaptureEvent::Saved { .. }), "shot {i}: {event:?}");
        }

        let (session, result) = run.await.unwrap();
        let summary = result.unwrap();
        assert_eq!(summary.saved, 3);
        assert!(!summary.cancelled);
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(store.list().await.unwrap().len(), 3);

        let finished = next_event(&mut events, |e| matches!(e, CaptureEvent::Finished { .. })).await;
        assert_eq!(finished, CaptureEvent::Finished { summary });
    }

    #[tokio::test]
    async fn empty_and_corrupt_frames_do_not_count() {
        let (_dir, store) = open_store("session-bad-frames").await;
        let (tx, mut events) = mpsc::unbounded_channel();
        let session = CaptureSession::new(loopback(0), store.clone(), tx);
        let run = spawn_run(session, CaptureMode::Manual { shots: 1 }, CancellationToken::new());

        let addr = listening_addr(&mut events).await;
        send(addr, b"").await;
        send(addr, b"this is not a jpeg").await;
        let error = next_event(&mut events, |e| matches!(e, CaptureEvent::Error { .. })).await;
        assert!(matches!(
            error,
            CaptureEvent::Error {
                kind: ErrorKind::Decode,
                halted: false,
                ..
            }
        ));

        send(addr, &solid_jpeg(16, 16, [120, 120, 120])).await;
        let (_, result) = run.await.unwrap();
        assert_eq!(result.unwrap().saved, 1);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reset_mid_frame_is_reported_and_session_continues() {
        let (_dir, store) = open_store("session-reset").await;
        let (tx, mut events) = mpsc::unbounded_channel();
        let session = CaptureSession::new(loopback(0), store.clone(), tx);
        let run = spawn_run(session, CaptureMode::Manual { shots: 1 }, CancellationToken::new());

        let addr = listening_addr(&mut events).await;
        let frame = solid_jpeg(32, 32, [10, 200, 10]);
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&frame[..frame.len() / 2]).await.unwrap();
        next_event(&mut events, |e| {
            matches!(
                e,
                CaptureEvent::StateChanged {
                    state: SessionState::Receiving
                }
            )
        })
        .await;
        // Zero linger turns the close into a RST.
        stream.set_linger(Some(Duration::ZERO)).unwrap();
        drop(stream);

        let error = next_event(&mut events, |e| matches!(e, CaptureEvent::Error { .. })).await;
        assert!(
            matches!(
                error,
                CaptureEvent::Error {
                    kind: ErrorKind::Transport,
                    halted: false,
                    ..
                }
            ),
            "{error:?}"
        );

        send(addr, &frame).await;
        let (session, result) = run.await.unwrap();
        assert_eq!(result.unwrap().saved, 1);
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stalled_sender_times_out_and_session_continues() {
        let (_dir, store) = open_store("session-stall").await;
        let (tx, mut events) = mpsc::unbounded_channel();
        let receiver = ReceiverConfig {
            idle_timeout_secs: 1,
            ..loopback(0)
        };
        let session = CaptureSession::new(receiver, store.clone(), tx);
        let run = spawn_run(session, CaptureMode::Manual { shots: 1 }, CancellationToken::new());

        let addr = listening_addr(&mut events).await;
        let frame = solid_jpeg(32, 32, [200, 10, 10]);
        let mut stalled = TcpStream::connect(addr).await.unwrap();
        stalled.write_all(&frame[..100]).await.unwrap();

        let error = next_event(&mut events, |e| matches!(e, CaptureEvent::Error { .. })).await;
        assert!(
            matches!(
                error,
                CaptureEvent::Error {
                    kind: ErrorKind::Timeout,
                    halted: false,
                    ..
                }
            ),
            "{error:?}"
        );
        drop(stalled);

        send(addr, &frame).await;
        let (_, result) = run.await.unwrap();
        assert_eq!(result.unwrap().saved, 1);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn continuous_session_discards_near_duplicates() {
        let (_dir, store) = open_store("session-continuous").await;
        let (tx, mut events) = mpsc::unbounded_channel();
        let (scorer, priors) = ScriptedScorer::new(&[0.96, 0.5]);
        let session = CaptureSession::new(loopback(0), store.clone(), tx)
            .with_scorer(Box::new(scorer));
        let cancel = CancellationToken::new();
        let run = spawn_run(
            session,
            CaptureMode::Continuous {
                sensitivity: Sensitivity::Medium,
            },
            cancel.clone(),
        );

        let addr = listening_addr(&mut events).await;

        send(addr, &solid_jpeg(32, 32, [50, 50, 50])).await;
        let a = match next_event(&mut events, is_outcome).await {
            CaptureEvent::Kept { id, score: None } => id,
            other => panic!("first frame should be kept unscored, got {other:?}"),
        };

        send(addr, &solid_jpeg(32, 32, [150, 150, 150])).await;
        match next_event(&mut events, is_outcome).await {
            CaptureEvent::Discarded { score, .. } => assert_eq!(score, 0.96),
            other => panic!("second frame should be discarded, got {other:?}"),
        }
        assert_eq!(store.list().await.unwrap(), vec![a]);

        send(addr, &solid_jpeg(32, 32, [250, 250, 250])).await;
        let c = match next_event(&mut events, is_outcome).await {
            CaptureEvent::Kept { id, score } => {
                assert_eq!(score, Some(0.5));
                id
            }
            other => panic!("third frame should be kept, got {other:?}"),
        };

        cancel.cancel();
        let (session, result) = run.await.unwrap();
        let summary = result.unwrap();
        assert!(summary.cancelled);
        assert_eq!((summary.saved, summary.kept, summary.discarded), (3, 2, 1));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(store.list().await.unwrap(), vec![a, c]);

        // Both comparisons were made against the first frame.
        let priors = priors.lock().unwrap().clone();
        assert_eq!(priors.len(), 2);
        for mean in priors {
            assert!((mean - 50.0).abs() <= 2.0, "prior mean {mean}");
        }
    }

    #[tokio::test]
    async fn continuous_session_compares_first_frame_with_stored_latest() {
        let (_dir, store) = open_store("session-seeded").await;
        store
            .save(1_000, &solid_jpeg(32, 32, [90, 90, 90]))
            .await
            .unwrap();

        let (tx, mut events) = mpsc::unbounded_channel();
        let (scorer, priors) = ScriptedScorer::new(&[0.99]);
        let session = CaptureSession::new(loopback(0), store.clone(), tx)
            .with_scorer(Box::new(scorer));
        let cancel = CancellationToken::new();
        let run = spawn_run(
            session,
            CaptureMode::Continuous {
                sensitivity: Sensitivity::High,
            },
            cancel.clone(),
        );

        let addr = listening_addr(&mut events).await;
        send(addr, &solid_jpeg(32, 32, [90, 90, 90])).await;
        assert!(matches!(
            next_event(&mut events, is_outcome).await,
            CaptureEvent::Discarded { .. }
        ));

        cancel.cancel();
        let (_, result) = run.await.unwrap();
        assert_eq!(result.unwrap().discarded, 1);
        assert_eq!(store.list().await.unwrap(), vec![FrameId::new(1_000, 0)]);
        assert_eq!(priors.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn size_change_skips_comparison_but_keeps_frame() {
        let (_dir, store) = open_store("session-resize").await;
        let (tx, mut events) = mpsc::unbounded_channel();
        let session = CaptureSession::new(loopback(0), store.clone(), tx);
        let cancel = CancellationToken::new();
        let run = spawn_run(
            session,
            CaptureMode::Continuous {
                sensitivity: Sensitivity::Low,
            },
            cancel.clone(),
        );

        let addr = listening_addr(&mut events).await;
        send(addr, &solid_jpeg(32, 32, [80, 80, 80])).await;
        next_event(&mut events, is_outcome).await;

        send(addr, &solid_jpeg(48, 32, [80, 80, 80])).await;
        let skipped = next_event(&mut events, |e| {
            matches!(e, CaptureEvent::ComparisonSkipped { .. })
        })
        .await;
        assert!(matches!(skipped, CaptureEvent::ComparisonSkipped { .. }));
        assert!(matches!(
            next_event(&mut events, is_outcome).await,
            CaptureEvent::Kept { score: None, .. }
        ));

        cancel.cancel();
        let (_, result) = run.await.unwrap();
        assert_eq!(result.unwrap().kept, 2);
        assert_eq!(store.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn frames_below_window_size_are_kept_unscored() {
        let (_dir, store) = open_store("session-tiny").await;
        let (tx, mut events) = mpsc::unbounded_channel();
        let session = CaptureSession::new(loopback(0), store.clone(), tx);
        let cancel = CancellationToken::new();
        let run = spawn_run(
            session,
            CaptureMode::Continuous {
                sensitivity: Sensitivity::Low,
            },
            cancel.clone(),
        );

        let addr = listening_addr(&mut events).await;
        send(addr, &solid_jpeg(4, 4, [60, 60, 60])).await;
        next_event(&mut events, is_outcome).await;

        send(addr, &solid_jpeg(4, 4, [60, 60, 60])).await;
        let error = next_event(&mut events, |e| matches!(e, CaptureEvent::Error { .. })).await;
        assert!(
            matches!(
                error,
                CaptureEvent::Error {
                    kind: ErrorKind::FrameTooSmall,
                    halted: false,
                    ..
                }
            ),
            "{error:?}"
        );
        assert!(matches!(
            next_event(&mut events, is_outcome).await,
            CaptureEvent::Kept { score: None, .. }
        ));

        cancel.cancel();
        let (_, result) = run.await.unwrap();
        assert_eq!(result.unwrap().kept, 2);
        assert_eq!(store.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn bind_conflict_is_recoverable() {
        let (_dir, store) = open_store("session-bind").await;
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = blocker.local_addr().unwrap().port();

        let (tx, mut events) = mpsc::unbounded_channel();
        let mut session = CaptureSession::new(loopback(port), store, tx);
        let cancel = CancellationToken::new();

        let err = session
            .run(CaptureMode::Manual { shots: 1 }, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_bind_conflict(), "got {err:?}");
        assert_eq!(session.state(), SessionState::Error(ErrorKind::BindConflict));
        let event = next_event(&mut events, |e| matches!(e, CaptureEvent::Error { .. })).await;
        assert!(matches!(
            event,
            CaptureEvent::Error {
                kind: ErrorKind::BindConflict,
                halted: true,
                ..
            }
        ));

        // A new run is refused until the error is dealt with.
        assert!(matches!(
            session.run(CaptureMode::Manual { shots: 1 }, &cancel).await,
            Err(SessionError::NotIdle(_))
        ));

        drop(blocker);
        cancel.cancel();
        let summary = session.retry(&cancel).await.unwrap();
        assert!(summary.cancelled);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn acknowledge_returns_to_idle() {
        let (_dir, store) = open_store("session-ack").await;
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = blocker.local_addr().unwrap().port();
        let (tx, _events) = mpsc::unbounded_channel();
        let mut session = CaptureSession::new(loopback(port), store, tx);

        let cancel = CancellationToken::new();
        assert!(session
            .run(CaptureMode::Manual { shots: 1 }, &cancel)
            .await
            .is_err());
        session.acknowledge_error();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(matches!(
            session.retry(&cancel).await,
            Err(SessionError::NotIdle(SessionState::Idle))
        ));
    }

    #[tokio::test]
    async fn timestamps_never_go_backwards() {
        let (_dir, store) = open_store("session-clock").await;
        let (tx, _events) = mpsc::unbounded_channel();
        let mut session = CaptureSession::new(loopback(0), store, tx);
        session.last_timestamp = i64::MAX - 1;
        assert_eq!(session.next_timestamp(), i64::MAX - 1);
    }
}
