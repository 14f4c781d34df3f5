//! Capture session: the state machine that turns camera connections into
//! stored frames, and the controller that runs it on a background task.

pub mod controller;
pub mod events;
pub mod state;

pub use controller::{ControlError, SessionController};
pub use events::{CaptureEvent, CaptureMode, ErrorKind, RunSummary, SessionState};
pub use state::{CaptureSession, SessionError};
