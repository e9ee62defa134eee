//! In-memory assistant backend for orchestrator and HTTP tests.
//!
//! Behaves like the hosted provider where it matters: one active run per
//! thread, messages listed newest first, assistant replies attributed to the
//! run that wrote them.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use palaver_lib::backend::{AssistantBackend, RemoteResult};
use palaver_lib::error::RemoteServiceError;
use palaver_lib::palaver_core::types::{
    Message, Role, Run, RunId, RunStatus, ThreadId, VoiceParams,
};

#[derive(Default)]
pub struct MockBackend {
    next_id: AtomicU32,
    pub create_thread_calls: AtomicU32,
    pub status_polls: AtomicU32,
    threads: Mutex<HashMap<ThreadId, Vec<Message>>>,
    active_runs: Mutex<HashSet<ThreadId>>,
    /// Statuses handed out by successive polls; `completed` once exhausted.
    statuses: Mutex<VecDeque<RunStatus>>,
    poll_delay: Duration,
    silent_runs: bool,
    transcript: Option<Result<String, RemoteServiceError>>,
    synthesis_fails: bool,
    audio_dir: Option<PathBuf>,
    /// For each transcription, whether the named file existed in `audio_dir`.
    pub audio_seen: Mutex<Vec<bool>>,
    pub posted: Mutex<Vec<(ThreadId, String)>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_statuses(mut self, statuses: &[RunStatus]) -> Self {
        self.statuses = Mutex::new(statuses.iter().copied().collect());
        self
    }

    /// Slow each status poll down so concurrent turns overlap.
    pub fn with_poll_delay(mut self, delay: Duration) -> Self {
        self.poll_delay = delay;
        self
    }

    /// Runs complete without writing an assistant message.
    pub fn with_silent_runs(mut self) -> Self {
        self.silent_runs = true;
        self
    }

    pub fn with_transcript(mut self, transcript: Result<&str, RemoteServiceError>) -> Self {
        self.transcript = Some(transcript.map(str::to_string));
        self
    }

    pub fn with_failing_synthesis(mut self) -> Self {
        self.synthesis_fails = true;
        self
    }

    pub fn watching_audio_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.audio_dir = Some(dir.into());
        self
    }

    pub fn create_thread_calls(&self) -> u32 {
        self.create_thread_calls.load(Ordering::SeqCst)
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().unwrap().len()
    }

    /// Messages on `thread`, oldest first.
    pub fn history(&self, thread: &ThreadId) -> Vec<Message> {
        self.threads
            .lock()
            .unwrap()
            .get(thread)
            .cloned()
            .unwrap_or_default()
    }

    fn id(&self, prefix: &str) -> String {
        format!("{prefix}_{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn not_found(thread: &ThreadId) -> RemoteServiceError {
        RemoteServiceError::new(Some(404), format!("No thread found with id '{thread}'."))
    }

    /// Write the assistant's reply to the newest user message.
    fn answer(&self, thread: &ThreadId, run: &RunId) {
        let mut threads = self.threads.lock().unwrap();
        let Some(history) = threads.get_mut(thread) else {
            return;
        };
        let question = history
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.text.clone())
            .unwrap_or_default();
        let id = self.id("msg");
        history.push(Message {
            id,
            role: Role::Assistant,
            text: format!("Reply to: {question}"),
            run_id: Some(run.clone()),
        });
    }
}

#[async_trait]
impl AssistantBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn create_thread(&self) -> RemoteResult<ThreadId> {
        self.create_thread_calls.fetch_add(1, Ordering::SeqCst);
        let thread = ThreadId::new(self.id("thread"));
        self.threads.lock().unwrap().insert(thread.clone(), Vec::new());
        Ok(thread)
    }

    async fn post_message(&self, thread: &ThreadId, text: &str) -> RemoteResult<()> {
        if self.active_runs.lock().unwrap().contains(thread) {
            return Err(RemoteServiceError::new(
                Some(400),
                format!("Can't add messages to {thread} while a run is active."),
            ));
        }
        let id = self.id("msg");
        let mut threads = self.threads.lock().unwrap();
        let history = threads.get_mut(thread).ok_or_else(|| Self::not_found(thread))?;
        history.push(Message {
            id,
            role: Role::User,
            text: text.to_string(),
            run_id: None,
        });
        self.posted
            .lock()
            .unwrap()
            .push((thread.clone(), text.to_string()));
        Ok(())
    }

    async fn start_run(&self, thread: &ThreadId) -> RemoteResult<Run> {
        if !self.threads.lock().unwrap().contains_key(thread) {
            return Err(Self::not_found(thread));
        }
        if !self.active_runs.lock().unwrap().insert(thread.clone()) {
            return Err(RemoteServiceError::new(
                Some(400),
                format!("Thread {thread} already has an active run."),
            ));
        }
        Ok(Run {
            id: RunId::new(self.id("run")),
            thread_id: thread.clone(),
            status: RunStatus::Queued,
        })
    }

    async fn run_status(&self, thread: &ThreadId, run: &RunId) -> RemoteResult<RunStatus> {
        self.status_polls.fetch_add(1, Ordering::SeqCst);
        if !self.poll_delay.is_zero() {
            tokio::time::sleep(self.poll_delay).await;
        }
        let status = self
            .statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(RunStatus::Completed);

        if status.is_terminal() {
            self.active_runs.lock().unwrap().remove(thread);
            if status == RunStatus::Completed && !self.silent_runs {
                self.answer(thread, run);
            }
        }
        Ok(status)
    }

    async fn cancel_run(&self, thread: &ThreadId, _: &RunId) -> RemoteResult<()> {
        self.active_runs.lock().unwrap().remove(thread);
        Ok(())
    }

    async fn list_messages(&self, thread: &ThreadId) -> RemoteResult<Vec<Message>> {
        let threads = self.threads.lock().unwrap();
        let history = threads.get(thread).ok_or_else(|| Self::not_found(thread))?;
        Ok(history.iter().rev().cloned().collect())
    }

    async fn transcribe(
        &self,
        audio: Vec<u8>,
        file_name: &str,
        _language: &str,
    ) -> RemoteResult<String> {
        if let Some(dir) = &self.audio_dir {
            self.audio_seen
                .lock()
                .unwrap()
                .push(dir.join(file_name).exists());
        }
        match &self.transcript {
            Some(result) => result.clone(),
            None => Ok(format!("heard {} bytes", audio.len())),
        }
    }

    async fn synthesize(&self, text: &str, _: &VoiceParams) -> RemoteResult<Vec<u8>> {
        if self.synthesis_fails {
            return Err(RemoteServiceError::new(Some(503), "speech unavailable"));
        }
        Ok(format!("AUDIO:{text}").into_bytes())
    }
}
