//! Shared types for the palaver turn relay.
//!
//! These types are used by palaver-lib, palaver-cli, and any widget that talks
//! to the relay over HTTP. Keeping them here means consumers can depend on the
//! wire format without pulling in tokio, reqwest, or rodio.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Maximum number of characters the remote synthesis service accepts.
pub const MAX_SYNTHESIS_INPUT: usize = 4096;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_POLL_ATTEMPTS: u32 = 30;

/// Replies at or below this many characters are spoken by a local voice when
/// one is available.
pub const DEFAULT_SHORT_FORM_THRESHOLD: usize = 200;

// ─── Identifiers ───────────────────────────────────────────────────────────

/// Remote conversation identifier. Opaque; never parsed or mutated locally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(String);

impl ThreadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one assistant invocation on a thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ─── Runs and messages ─────────────────────────────────────────────────────

/// Status of a run as reported by the assistant provider.
///
/// Statuses this crate does not know about deserialize to [`RunStatus::Unknown`]
/// and are treated as still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
    Expired,
    Incomplete,
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    /// No further state change occurs once a run reaches one of these.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Expired | Self::Incomplete
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::RequiresAction => "requires_action",
            Self::Cancelling => "cancelling",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
            Self::Incomplete => "incomplete",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A run handle returned by the provider when an assistant starts working on
/// a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Run {
    pub id: RunId,
    pub thread_id: ThreadId,
    pub status: RunStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    #[serde(other)]
    Other,
}

/// One entry of a thread's remote history, flattened to its text content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub text: String,
    /// The run that authored this message, when the provider reports it.
    pub run_id: Option<RunId>,
}

// ─── Turn results ──────────────────────────────────────────────────────────

/// Result of a text turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextTurn {
    pub reply: String,
    pub thread_id: ThreadId,
}

/// Result of a voice turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceTurn {
    pub transcript: String,
    pub reply: String,
    pub thread_id: ThreadId,
    /// Synthesized reply, absent when remote synthesis failed.
    pub reply_audio: Option<Vec<u8>>,
}

// ─── Configuration ─────────────────────────────────────────────────────────

/// Voice settings passed to the remote synthesis service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceParams {
    pub model: String,
    pub voice: String,
    pub format: String,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            model: "tts-1".into(),
            voice: "alloy".into(),
            format: "mp3".into(),
        }
    }
}

/// Turn pipeline configuration.
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// Spoken-language hint handed to transcription (ISO-639-1).
    pub language: String,
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
    pub voice: VoiceParams,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            language: "ru".into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_poll_attempts: DEFAULT_MAX_POLL_ATTEMPTS,
            voice: VoiceParams::default(),
        }
    }
}

/// Presentation settings served to widgets at `GET /config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetConfig {
    pub title: String,
    pub welcome_message: String,
    pub primary_color: String,
    pub position: String,
    pub language: String,
    pub short_form_threshold: usize,
}

impl Default for WidgetConfig {
    fn default() -> Self {
        Self {
            title: "Голосовой помощник".into(),
            welcome_message: "Привет! Чем могу помочь?".into(),
            primary_color: "#007bff".into(),
            position: "bottom-right".into(),
            language: "ru".into(),
            short_form_threshold: DEFAULT_SHORT_FORM_THRESHOLD,
        }
    }
}

// ─── Wire types (local HTTP boundary) ──────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextTurnRequest {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextTurnResponse {
    pub message: String,
    pub thread_id: ThreadId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceTurnRequest {
    #[serde(alias = "audioData")]
    pub audio_base64: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceTurnResponse {
    pub transcription: String,
    pub message: String,
    pub thread_id: ThreadId,
    /// Base64-encoded synthesized reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_response: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechRequest {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechResponse {
    /// Base64-encoded audio.
    pub audio: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadResponse {
    pub thread_id: ThreadId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(RunStatus::Expired.is_terminal());
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::InProgress.is_terminal());
        assert!(!RunStatus::Cancelling.is_terminal());
        assert!(!RunStatus::Unknown.is_terminal());
    }

    #[test]
    fn run_status_wire_names() {
        let s: RunStatus = serde_json::from_str("\"in_progress\"").unwrap();
        assert_eq!(s, RunStatus::InProgress);
        assert_eq!(s.to_string(), "in_progress");
    }

    #[test]
    fn unknown_run_status_is_tolerated() {
        let s: RunStatus = serde_json::from_str("\"paused_for_tea\"").unwrap();
        assert_eq!(s, RunStatus::Unknown);
    }

    #[test]
    fn voice_request_accepts_legacy_field_name() {
        let req: VoiceTurnRequest =
            serde_json::from_str(r#"{"audioData":"AAAA","threadId":"thread_1"}"#).unwrap();
        assert_eq!(req.audio_base64, "AAAA");
        assert_eq!(req.thread_id.as_deref(), Some("thread_1"));
    }

    #[test]
    fn text_response_is_camel_case() {
        let resp = TextTurnResponse {
            message: "hi".into(),
            thread_id: ThreadId::new("thread_1"),
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["threadId"], "thread_1");
        assert_eq!(json["message"], "hi");
    }

    #[test]
    fn voice_response_omits_missing_audio() {
        let resp = VoiceTurnResponse {
            transcription: "hello".into(),
            message: "hi".into(),
            thread_id: ThreadId::new("t"),
            audio_response: None,
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json.get("audioResponse").is_none());
    }

    #[test]
    fn widget_config_defaults() {
        let cfg = WidgetConfig::default();
        assert_eq!(cfg.short_form_threshold, 200);
        assert_eq!(cfg.position, "bottom-right");
    }
}
