//! Local synthesis through a Kokoro server on this machine.
//!
//! Kokoro speaks the OpenAI `/v1/audio/speech` dialect. Replies are requested
//! as WAV, whose header sizes Kokoro leaves as streaming sentinels; they are
//! patched before the bytes reach a decoder.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use palaver_core::text_prep::clean_for_speech;
use palaver_core::wav::fix_wav_sizes;

use crate::error::SpeechError;
use crate::speech::LocalVoice;

pub const DEFAULT_KOKORO_URL: &str = "http://localhost:8880";

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct KokoroConfig {
    pub url: String,
    pub voice: String,
    pub speed: f32,
}

impl Default for KokoroConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_KOKORO_URL.into(),
            voice: "af_jadzia".into(),
            speed: 1.0,
        }
    }
}

pub struct KokoroVoice {
    http: reqwest::Client,
    config: KokoroConfig,
}

impl KokoroVoice {
    pub fn new(config: KokoroConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config: KokoroConfig {
                url: config.url.trim_end_matches('/').to_string(),
                ..config
            },
        }
    }
}

#[async_trait]
impl LocalVoice for KokoroVoice {
    async fn available(&self) -> bool {
        self.http
            .get(format!("{}/", self.config.url))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .is_ok()
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, SpeechError> {
        let input = clean_for_speech(text);
        if !input.chars().any(|c| c.is_alphanumeric()) {
            return Err(SpeechError::Synthesis("nothing speakable in reply".into()));
        }

        let body = serde_json::json!({
            "input": input,
            "voice": self.config.voice,
            "model": "kokoro",
            "response_format": "wav",
            "stream": false,
            "speed": self.config.speed,
        });

        debug!("kokoro: POST {} chars", input.len());
        let resp = self
            .http
            .post(format!("{}/v1/audio/speech", self.config.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| SpeechError::Synthesis(format!("kokoro request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!("kokoro error {status}: {text}");
            return Err(SpeechError::Synthesis(format!("kokoro returned {status}")));
        }

        let wav = resp
            .bytes()
            .await
            .map_err(|e| SpeechError::Synthesis(format!("kokoro body: {e}")))?;
        Ok(fix_wav_sizes(wav.to_vec()))
    }
}
