//! Error types for the turn pipeline and the widget side.

use palaver_core::types::{RunId, RunStatus};
use palaver_core::validate::ValidationError;

/// A capability call that did not succeed.
///
/// `status` is the provider's HTTP status, or `None` when no response arrived
/// (connect failure, timeout, unreadable body).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "remote service error{}: {message}",
    .status.map(|s| format!(" ({s})")).unwrap_or_default()
)]
pub struct RemoteServiceError {
    pub status: Option<u16>,
    pub message: String,
}

impl RemoteServiceError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Worth another attempt: transport failure, rate limiting, or a 5xx.
    pub fn is_transient(&self) -> bool {
        match self.status {
            None => true,
            Some(s) => s == 429 || s >= 500,
        }
    }
}

impl From<reqwest::Error> for RemoteServiceError {
    fn from(err: reqwest::Error) -> Self {
        Self::new(err.status().map(|s| s.as_u16()), err.to_string())
    }
}

/// Why a text or voice turn failed.
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("invalid input: {0}")]
    Validation(#[from] ValidationError),

    #[error("{step} failed: {source}")]
    Remote {
        step: &'static str,
        #[source]
        source: RemoteServiceError,
    },

    #[error("run {run_id} did not finish within {attempts} status checks")]
    RunTimeout { run_id: RunId, attempts: u32 },

    #[error("assistant run ended with status {status}")]
    RunFailed { status: RunStatus },

    #[error("assistant run completed without a reply")]
    ResponseMissing,

    #[error("transcription failed: {0}")]
    Transcription(String),

    #[error("speech synthesis failed: {0}")]
    Synthesis(String),

    #[error("ephemeral audio storage failed: {0}")]
    Storage(#[from] std::io::Error),

    #[error("turn cancelled")]
    Cancelled,
}

impl TurnError {
    /// Adapter for `map_err` that tags a capability failure with the step
    /// that issued it.
    pub fn remote(step: &'static str) -> impl FnOnce(RemoteServiceError) -> TurnError {
        move |source| TurnError::Remote { step, source }
    }
}

/// Widget-side speech output failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpeechError {
    #[error("speech synthesis failed: {0}")]
    Synthesis(String),

    #[error("audio playback failed: {0}")]
    Playback(String),

    #[error("playback interrupted")]
    Interrupted,

    #[error("no speech route available")]
    Unavailable,
}

/// Failure talking to the relay's HTTP API.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("relay returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error("invalid audio in response: {0}")]
    Decode(String),
}

/// Microphone capture failure.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("no microphone found; connect an audio input device")]
    NoDevice,

    #[error("audio device configuration failed: {0}")]
    Config(String),

    #[error("audio stream failed: {0}")]
    Stream(String),

    #[error("audio capture stream ended")]
    Ended,

    #[error("audio capture read timeout")]
    Timeout,

    #[error("recording cancelled")]
    Cancelled,
}
