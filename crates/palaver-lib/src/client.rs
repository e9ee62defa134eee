//! HTTP client for a running palaver relay, used by the widget side of the
//! conversation.
//!
//! [`WidgetClient`] owns a [`Session`]: the first turn response binds it to a
//! thread, and every later turn sends that thread id back.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use palaver_core::text_prep::truncate_chars;
use palaver_core::types::{
    ErrorResponse, HealthResponse, SpeechRequest, SpeechResponse, TextTurnRequest,
    TextTurnResponse, ThreadId, ThreadResponse, VoiceTurnRequest, VoiceTurnResponse,
    WidgetConfig,
};
use palaver_core::validate::MAX_SPEECH_CHARS;

use crate::error::{ClientError, SpeechError};
use crate::session::Session;
use crate::speech::RemoteSpeech;

pub const DEFAULT_SERVER_URL: &str = "http://localhost:3000";

/// A voice turn as seen by the widget, with reply audio already decoded.
#[derive(Debug, Clone)]
pub struct VoiceReply {
    pub transcription: String,
    pub message: String,
    pub thread_id: ThreadId,
    pub audio: Option<Vec<u8>>,
}

#[derive(Clone)]
pub struct WidgetClient {
    http: reqwest::Client,
    base_url: String,
    session: Arc<Session>,
}

impl WidgetClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_session(base_url, Arc::new(Session::new()))
    }

    pub fn with_session(base_url: impl Into<String>, session: Arc<Session>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn send_text(&self, message: &str) -> Result<TextTurnResponse, ClientError> {
        let (thread, epoch) = self.session.snapshot();
        let req = TextTurnRequest {
            message: message.to_string(),
            thread_id: thread.map(|t| t.as_str().to_string()),
        };
        let resp: TextTurnResponse = self.post("/turn/text", &req).await?;
        self.session.adopt_if(epoch, &resp.thread_id);
        Ok(resp)
    }

    pub async fn send_voice(&self, audio: &[u8]) -> Result<VoiceReply, ClientError> {
        let (thread, epoch) = self.session.snapshot();
        let req = VoiceTurnRequest {
            audio_base64: BASE64.encode(audio),
            thread_id: thread.map(|t| t.as_str().to_string()),
        };
        let resp: VoiceTurnResponse = self.post("/turn/voice", &req).await?;
        self.session.adopt_if(epoch, &resp.thread_id);

        let audio = resp.audio_response.as_deref().map(decode_audio).transpose()?;
        Ok(VoiceReply {
            transcription: resp.transcription,
            message: resp.message,
            thread_id: resp.thread_id,
            audio,
        })
    }

    /// Synthesize `text` on the relay. Text past the relay's speech bound is
    /// cut rather than rejected.
    pub async fn speech(&self, text: &str) -> Result<Vec<u8>, ClientError> {
        let req = SpeechRequest {
            text: truncate_chars(text, MAX_SPEECH_CHARS).to_string(),
        };
        let resp: SpeechResponse = self.post("/speech", &req).await?;
        decode_audio(&resp.audio)
    }

    /// Start a fresh conversation on the relay and bind the session to it,
    /// unless the session was reset while the thread was being created.
    pub async fn new_thread(&self) -> Result<ThreadId, ClientError> {
        let (_, epoch) = self.session.snapshot();
        let resp: ThreadResponse = self.post("/thread", &serde_json::json!({})).await?;
        self.session.rebind_if(epoch, &resp.thread_id);
        Ok(resp.thread_id)
    }

    /// Forget the current thread; the next turn starts a new one.
    pub fn reset_thread(&self) {
        self.session.reset();
    }

    pub async fn config(&self) -> Result<WidgetConfig, ClientError> {
        self.get("/config").await
    }

    pub async fn health(&self) -> Result<HealthResponse, ClientError> {
        self.get("/health").await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        debug!("POST {path}");
        let resp = self
            .http
            .post(format!("{}{path}", self.base_url))
            .json(body)
            .send()
            .await?;
        read_json(resp).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let resp = self
            .http
            .get(format!("{}{path}", self.base_url))
            .send()
            .await?;
        read_json(resp).await
    }
}

async fn read_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json::<T>().await?);
    }

    let body = resp.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(err) if err.details.is_empty() => err.error,
        Ok(err) => format!("{}: {}", err.error, err.details.join("; ")),
        Err(_) => body,
    };
    Err(ClientError::Server {
        status: status.as_u16(),
        message,
    })
}

fn decode_audio(encoded: &str) -> Result<Vec<u8>, ClientError> {
    BASE64
        .decode(encoded)
        .map_err(|e| ClientError::Decode(e.to_string()))
}

/// Remote synthesis through the relay's `/speech` endpoint.
pub struct ServerSpeech {
    client: WidgetClient,
}

impl ServerSpeech {
    pub fn new(client: WidgetClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RemoteSpeech for ServerSpeech {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, SpeechError> {
        self.client
            .speech(text)
            .await
            .map_err(|e| SpeechError::Synthesis(e.to_string()))
    }
}
