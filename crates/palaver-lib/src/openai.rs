//! [`AssistantBackend`] over the OpenAI Assistants, transcription and speech
//! HTTP APIs.
//!
//! Messages are always listed with `order=desc`, so the newest message comes
//! first regardless of the provider's default ordering.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use palaver_core::text_prep::truncate_chars;
use palaver_core::types::{
    MAX_SYNTHESIS_INPUT, Message, Role, Run, RunId, RunStatus, ThreadId, VoiceParams,
};
use palaver_core::wav::AudioFormat;

use crate::backend::{AssistantBackend, RemoteResult};
use crate::error::RemoteServiceError;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const TRANSCRIPTION_MODEL: &str = "whisper-1";
/// How many messages to fetch when looking for the reply. The reply is the
/// newest assistant message, so a short page is enough.
const MESSAGE_PAGE: &str = "20";

/// Connection details for the provider.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub assistant_id: String,
    pub base_url: String,
    pub request_timeout: Duration,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>, assistant_id: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            assistant_id: assistant_id.into(),
            base_url: DEFAULT_BASE_URL.into(),
            request_timeout: Duration::from_secs(60),
        }
    }

    /// Override the API root (including `/v1`). Trailing slashes are ignored.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

pub struct OpenAiClient {
    http: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> Result<Self, RemoteServiceError> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .map_err(|e| RemoteServiceError::new(None, format!("invalid API key: {e}")))?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert("OpenAI-Beta", HeaderValue::from_static("assistants=v2"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> RemoteResult<T> {
        let resp = ensure_success(request.send().await?).await?;
        resp.json::<T>()
            .await
            .map_err(|e| RemoteServiceError::new(None, format!("invalid response body: {e}")))
    }
}

/// Turn a non-2xx response into a [`RemoteServiceError`], preferring the
/// provider's `error.message` over the raw body.
async fn ensure_success(resp: reqwest::Response) -> RemoteResult<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|b| b.error.message)
        .unwrap_or(body);
    Err(RemoteServiceError::new(Some(status.as_u16()), message))
}

// ─── Provider wire format ─────────────────────────────────────────────────

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

#[derive(Deserialize)]
struct ThreadObject {
    id: String,
}

#[derive(Deserialize)]
struct RunObject {
    id: String,
    thread_id: String,
    status: RunStatus,
}

#[derive(Deserialize)]
struct MessageList {
    data: Vec<MessageObject>,
}

#[derive(Deserialize)]
struct MessageObject {
    id: String,
    role: Role,
    #[serde(default)]
    content: Vec<ContentPart>,
    #[serde(default)]
    run_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: TextContent },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct TextContent {
    value: String,
}

#[derive(Deserialize)]
struct Transcription {
    text: String,
}

impl From<MessageObject> for Message {
    fn from(m: MessageObject) -> Self {
        let text = m
            .content
            .into_iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.value),
                ContentPart::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        Message {
            id: m.id,
            role: m.role,
            text,
            run_id: m.run_id.map(RunId::new),
        }
    }
}

// ─── Capability implementation ────────────────────────────────────────────

#[async_trait]
impl AssistantBackend for OpenAiClient {
    fn name(&self) -> &str {
        "openai"
    }

    async fn create_thread(&self) -> RemoteResult<ThreadId> {
        let thread: ThreadObject = self
            .send_json(self.http.post(self.url("/threads")).json(&serde_json::json!({})))
            .await?;
        info!("thread created: {}", thread.id);
        Ok(ThreadId::new(thread.id))
    }

    async fn post_message(&self, thread: &ThreadId, text: &str) -> RemoteResult<()> {
        let body = serde_json::json!({ "role": "user", "content": text });
        let _: serde_json::Value = self
            .send_json(
                self.http
                    .post(self.url(&format!("/threads/{thread}/messages")))
                    .json(&body),
            )
            .await?;
        Ok(())
    }

    async fn start_run(&self, thread: &ThreadId) -> RemoteResult<Run> {
        let body = serde_json::json!({ "assistant_id": self.config.assistant_id });
        let run: RunObject = self
            .send_json(
                self.http
                    .post(self.url(&format!("/threads/{thread}/runs")))
                    .json(&body),
            )
            .await?;
        debug!("run {} started on {thread} ({})", run.id, run.status);
        Ok(Run {
            id: RunId::new(run.id),
            thread_id: ThreadId::new(run.thread_id),
            status: run.status,
        })
    }

    async fn run_status(&self, thread: &ThreadId, run: &RunId) -> RemoteResult<RunStatus> {
        let run: RunObject = self
            .send_json(self.http.get(self.url(&format!("/threads/{thread}/runs/{run}"))))
            .await?;
        Ok(run.status)
    }

    async fn cancel_run(&self, thread: &ThreadId, run: &RunId) -> RemoteResult<()> {
        let _: serde_json::Value = self
            .send_json(
                self.http
                    .post(self.url(&format!("/threads/{thread}/runs/{run}/cancel"))),
            )
            .await?;
        Ok(())
    }

    async fn list_messages(&self, thread: &ThreadId) -> RemoteResult<Vec<Message>> {
        let list: MessageList = self
            .send_json(
                self.http
                    .get(self.url(&format!("/threads/{thread}/messages")))
                    .query(&[("order", "desc"), ("limit", MESSAGE_PAGE)]),
            )
            .await?;
        Ok(list.data.into_iter().map(Message::from).collect())
    }

    async fn transcribe(
        &self,
        audio: Vec<u8>,
        file_name: &str,
        language: &str,
    ) -> RemoteResult<String> {
        let mime = AudioFormat::sniff(&audio).mime();
        let part = reqwest::multipart::Part::bytes(audio)
            .file_name(file_name.to_string())
            .mime_str(mime)
            .map_err(|e| RemoteServiceError::new(None, format!("mime error: {e}")))?;

        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", TRANSCRIPTION_MODEL)
            .text("language", language.to_string())
            .text("response_format", "json");

        let transcription: Transcription = self
            .send_json(
                self.http
                    .post(self.url("/audio/transcriptions"))
                    .multipart(form),
            )
            .await?;
        Ok(transcription.text.trim().to_string())
    }

    async fn synthesize(&self, text: &str, voice: &VoiceParams) -> RemoteResult<Vec<u8>> {
        let body = serde_json::json!({
            "model": voice.model,
            "voice": voice.voice,
            "input": truncate_chars(text, MAX_SYNTHESIS_INPUT),
            "response_format": voice.format,
        });

        let resp = self
            .http
            .post(self.url("/audio/speech"))
            .json(&body)
            .send()
            .await?;
        let resp = ensure_success(resp).await?;

        let mut audio = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            audio.extend_from_slice(&chunk?);
        }
        debug!("synthesized {} bytes of {}", audio.len(), voice.format);
        Ok(audio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let cfg = OpenAiConfig::new("k", "asst").with_base_url("http://localhost:9000/v1/");
        assert_eq!(cfg.base_url, "http://localhost:9000/v1");
    }

    #[test]
    fn message_text_joins_text_parts() {
        let raw = serde_json::json!({
            "id": "msg_1",
            "role": "assistant",
            "run_id": "run_1",
            "content": [
                {"type": "text", "text": {"value": "Hello", "annotations": []}},
                {"type": "image_file", "image_file": {"file_id": "f"}},
                {"type": "text", "text": {"value": "there", "annotations": []}}
            ]
        });
        let msg: Message = serde_json::from_value::<MessageObject>(raw).unwrap().into();
        assert_eq!(msg.text, "Hello\nthere");
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.run_id, Some(RunId::new("run_1")));
    }

    #[test]
    fn user_message_without_run() {
        let raw = serde_json::json!({
            "id": "msg_0",
            "role": "user",
            "run_id": null,
            "content": [{"type": "text", "text": {"value": "Hi"}}]
        });
        let msg: Message = serde_json::from_value::<MessageObject>(raw).unwrap().into();
        assert_eq!(msg.role, Role::User);
        assert!(msg.run_id.is_none());
    }
}
