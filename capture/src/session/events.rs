use std::fmt;
use std::net::SocketAddr;

use camdrop_common::config::Sensitivity;
use camdrop_common::frame::FrameId;
use serde::{Deserialize, Serialize};

/// What a session run should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CaptureMode {
    /// Receive exactly `shots` frames, then stop.
    Manual { shots: u32 },
    /// Receive until cancelled, discarding near-duplicates of the last kept frame.
    Continuous { sensitivity: Sensitivity },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No socket held.
    Idle,
    Binding,
    /// Waiting for the camera to connect.
    Listening,
    Receiving,
    /// Decoding, balancing, saving and (continuous mode) comparing.
    Deciding,
    /// The run stopped on this error; acknowledge or retry.
    Error(ErrorKind),
}

impl SessionState {
    pub fn is_idle(&self) -> bool {
        matches!(self, SessionState::Idle)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, SessionState::Error(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => f.write_str("idle"),
            SessionState::Binding => f.write_str("binding"),
            SessionState::Listening => f.write_str("listening"),
            SessionState::Receiving => f.write_str("receiving"),
            SessionState::Deciding => f.write_str("deciding"),
            SessionState::Error(kind) => write!(f, "error ({kind:?})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The listen port is held by someone else. Release it and retry.
    BindConflict,
    Bind,
    Transport,
    Timeout,
    Decode,
    DimensionMismatch,
    /// Frame is smaller than the comparison window.
    FrameTooSmall,
    Storage,
}

/// Totals for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub saved: u32,
    pub kept: u32,
    pub discarded: u32,
    pub cancelled: bool,
}

/// Status stream emitted while a session runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CaptureEvent {
    StateChanged {
        state: SessionState,
    },
    Listening {
        addr: SocketAddr,
    },
    /// Manual mode: waiting for the next of `remaining` shots.
    Pending {
        remaining: u32,
    },
    Received {
        bytes: usize,
        peer: SocketAddr,
    },
    Saved {
        id: FrameId,
    },
    /// Continuous mode: the frame stays. `score` is absent when there was
    /// nothing to compare against or the comparison was skipped.
    Kept {
        id: FrameId,
        score: Option<f64>,
    },
    /// Continuous mode: the frame was a near-duplicate and has been removed.
    Discarded {
        id: FrameId,
        score: f64,
    },
    ComparisonSkipped {
        id: FrameId,
        reason: String,
    },
    Error {
        kind: ErrorKind,
        message: String,
        /// The run stopped because of this error.
        halted: bool,
    },
    Finished {
        summary: RunSummary,
    },
}
