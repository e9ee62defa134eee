//! Input bounds for the local HTTP boundary.
//!
//! Every check here runs before any remote call is made.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::text_prep::char_len;
use crate::types::ThreadId;

pub const MAX_MESSAGE_CHARS: usize = 1000;
pub const MAX_SPEECH_CHARS: usize = 4000;
pub const MAX_THREAD_ID_CHARS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("message is required")]
    EmptyMessage,

    #[error("message must be between 1 and {max} characters (got {len})")]
    MessageTooLong { len: usize, max: usize },

    #[error("thread id must be between 1 and {MAX_THREAD_ID_CHARS} characters")]
    InvalidThreadId,

    #[error("audio data is required")]
    EmptyAudio,

    #[error("audio data must be base64 encoded: {0}")]
    InvalidAudioEncoding(String),

    #[error("text is required")]
    EmptySpeechText,

    #[error("text too long (max {max} characters, got {len})")]
    SpeechTooLong { len: usize, max: usize },
}

/// Trim a chat message and check its length.
pub fn message(raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyMessage);
    }
    let len = char_len(trimmed);
    if len > MAX_MESSAGE_CHARS {
        return Err(ValidationError::MessageTooLong {
            len,
            max: MAX_MESSAGE_CHARS,
        });
    }
    Ok(trimmed.to_string())
}

/// An absent thread id is fine; a present one must be 1–100 characters.
pub fn thread_id(raw: Option<&str>) -> Result<Option<ThreadId>, ValidationError> {
    match raw {
        None => Ok(None),
        Some(id) => {
            let len = char_len(id);
            if len == 0 || len > MAX_THREAD_ID_CHARS {
                Err(ValidationError::InvalidThreadId)
            } else {
                Ok(Some(ThreadId::new(id)))
            }
        }
    }
}

/// Decode a base64 audio payload. A `data:...;base64,` prefix is tolerated.
pub fn audio_base64(raw: &str) -> Result<Vec<u8>, ValidationError> {
    let payload = match raw.find("base64,") {
        Some(pos) if raw.starts_with("data:") => &raw[pos + "base64,".len()..],
        _ => raw,
    };
    let payload = payload.trim();
    if payload.is_empty() {
        return Err(ValidationError::EmptyAudio);
    }
    let bytes = STANDARD
        .decode(payload)
        .map_err(|e| ValidationError::InvalidAudioEncoding(e.to_string()))?;
    if bytes.is_empty() {
        return Err(ValidationError::EmptyAudio);
    }
    Ok(bytes)
}

/// Check text submitted for speech-only synthesis.
pub fn speech_text(raw: &str) -> Result<&str, ValidationError> {
    if raw.trim().is_empty() {
        return Err(ValidationError::EmptySpeechText);
    }
    let len = char_len(raw);
    if len > MAX_SPEECH_CHARS {
        return Err(ValidationError::SpeechTooLong {
            len,
            max: MAX_SPEECH_CHARS,
        });
    }
    Ok(raw)
}
