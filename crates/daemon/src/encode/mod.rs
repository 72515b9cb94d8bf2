//! Encoder subprocess integration for Loopcast
//!
//! The encoder is an opaque external process (ffmpeg) invoked with a fixed
//! argument contract; this module owns launching it, watching its lifecycle,
//! and classifying its failures.

pub mod ffmpeg;

pub use ffmpeg::{build_ffmpeg_command, FfmpegEncoder};

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

/// Error type for encoder launch operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The encoder process could not be spawned
    #[error("Failed to spawn encoder process: {0}")]
    Spawn(std::io::Error),

    /// The encoder exited before ever producing output
    #[error("Encoder exited before producing output: {0}")]
    ExitedBeforeStart(String),

    /// IO error talking to the encoder process
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Keywords that mark a failure as transient/network-related
const TRANSIENT_KEYWORDS: &[&str] = &["kill", "connection refused", "connection timed out"];

/// Coarse failure classification, used for logging only.
///
/// Retry behavior is uniform across classes; this stays as the hook for a
/// future policy that treats non-network failures differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Looks like a forced kill or a network drop
    TransientNetwork,
    /// Anything else the encoder reported
    Other,
}

/// What the encoder reported when a session failed
#[derive(Debug, Clone)]
pub struct FailureInfo {
    pub message: String,
    pub class: FailureClass,
}

impl FailureInfo {
    /// Classify a failure message by keyword match
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        let class = if TRANSIENT_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
            FailureClass::TransientNetwork
        } else {
            FailureClass::Other
        };
        Self { message, class }
    }
}

/// Lifecycle events delivered after a session has started
#[derive(Debug)]
pub enum SessionEvent {
    /// The process reported a runtime error
    Failed(FailureInfo),
    /// The process terminated without an explicit failure report
    Ended,
}

/// One live encode-and-publish session.
///
/// Owned exclusively by the supervisor; at most one exists at a time.
pub struct EncoderSession {
    id: Uuid,
    events: mpsc::Receiver<SessionEvent>,
    stop: Option<oneshot::Sender<()>>,
}

impl EncoderSession {
    pub fn new(id: Uuid, events: mpsc::Receiver<SessionEvent>, stop: oneshot::Sender<()>) -> Self {
        Self {
            id,
            events,
            stop: Some(stop),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the next lifecycle event. Returns None once the watcher
    /// behind the session is gone.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Request termination of the underlying process.
    ///
    /// Fire-and-forget: the watcher stops the process graceful-then-forceful
    /// and logs any error; this call never blocks.
    pub fn terminate(&mut self) {
        if let Some(stop) = self.stop.take() {
            if stop.send(()).is_err() {
                debug!(session = %self.id, "encoder already gone at terminate");
            }
        }
    }
}

/// Seam between the supervisor and the encoder process.
///
/// `launch` resolves only once the process is actively producing output,
/// not merely after it was spawned.
#[async_trait]
pub trait Encoder: Send + Sync {
    async fn launch(&self, content: &Path, destination: &str)
        -> Result<EncoderSession, EncodeError>;
}
