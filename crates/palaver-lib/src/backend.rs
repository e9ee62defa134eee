//! Capability interface to the hosted assistant provider.
//!
//! Every method is exactly one remote call. The orchestrator and the run
//! watcher only ever see this trait, so tests drive the whole pipeline with
//! an in-memory implementation.

use async_trait::async_trait;

use palaver_core::types::{Message, Run, RunId, RunStatus, ThreadId, VoiceParams};

use crate::error::RemoteServiceError;

pub type RemoteResult<T> = Result<T, RemoteServiceError>;

#[async_trait]
pub trait AssistantBackend: Send + Sync {
    /// Short name for log lines.
    fn name(&self) -> &str;

    async fn create_thread(&self) -> RemoteResult<ThreadId>;

    /// Append a user message. Fails if the thread is unknown.
    async fn post_message(&self, thread: &ThreadId, text: &str) -> RemoteResult<()>;

    /// Ask the assistant to process the thread. The provider rejects this
    /// while another run on the same thread is still active.
    async fn start_run(&self, thread: &ThreadId) -> RemoteResult<Run>;

    async fn run_status(&self, thread: &ThreadId, run: &RunId) -> RemoteResult<RunStatus>;

    /// Best-effort cancellation of an abandoned run.
    async fn cancel_run(&self, thread: &ThreadId, run: &RunId) -> RemoteResult<()>;

    /// Thread history, newest message first.
    async fn list_messages(&self, thread: &ThreadId) -> RemoteResult<Vec<Message>>;

    /// Transcribe an audio file. `file_name` carries the container extension
    /// the provider uses to pick a decoder.
    async fn transcribe(&self, audio: Vec<u8>, file_name: &str, language: &str)
    -> RemoteResult<String>;

    /// Synthesize speech. Implementations truncate `text` to
    /// [`MAX_SYNTHESIS_INPUT`](palaver_core::types::MAX_SYNTHESIS_INPUT)
    /// characters.
    async fn synthesize(&self, text: &str, voice: &VoiceParams) -> RemoteResult<Vec<u8>>;
}
