//! Capture-to-encoder pipeline
//!
//! [`CaptureOrchestrator`] owns the two sources and the encoder, serializes
//! both routing paths through one lock and drives the session lifecycle.

mod orchestrator;
mod session;

pub use orchestrator::CaptureOrchestrator;
pub use session::{SessionCounters, StreamSession};

use std::fmt;
use thiserror::Error;

use crate::capture::DeviceError;

/// Lifecycle of the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Closed,
    Opening,
    /// Sources running; `encoding` is false when the encoder failed to start
    Streaming { encoding: bool },
    Closing,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamState::Closed => write!(f, "closed"),
            StreamState::Opening => write!(f, "opening"),
            StreamState::Streaming { encoding: true } => write!(f, "streaming"),
            StreamState::Streaming { encoding: false } => write!(f, "streaming (not encoding)"),
            StreamState::Closing => write!(f, "closing"),
        }
    }
}

/// Result of a successful `open`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// Encoder initialized; frames are being encoded
    Encoding,
    /// Sources are running but the encoder failed to initialize, so every
    /// frame is discarded until the session is closed
    StartedNotEncoding,
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("a stream is already open")]
    AlreadyOpen,

    #[error("another open or close is in progress")]
    Busy,

    #[error("capture device failed: {0}")]
    Device(#[from] DeviceError),
}
