//! Turn orchestrator. Sequences one conversational turn end to end.
//!
//! ```text
//! text:  [ensure thread] → post_message → start_run → RunWatcher → list_messages → reply
//! voice: persist → transcribe → release → text turn → synthesize (optional)
//! ```
//!
//! Turns on the same thread are serialized: each turn holds that thread's
//! lock from `post_message` until the reply is read, so a second turn queues
//! instead of starting a second run. Turns on different threads run freely.
//!
//! A failed step aborts the turn. Remote state is never rolled back, so a
//! failed turn can leave an unanswered user message on the thread.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use palaver_core::text_prep::{clean_for_speech, preview};
use palaver_core::types::{
    Message, Role, RunId, RunStatus, TextTurn, ThreadId, TurnConfig, VoiceTurn,
};
use palaver_core::validate::ValidationError;

use crate::audio_store::{EphemeralAudio, EphemeralAudioStore};
use crate::backend::{AssistantBackend, RemoteResult};
use crate::error::TurnError;
use crate::watcher::RunWatcher;

pub struct TurnOrchestrator {
    backend: Arc<dyn AssistantBackend>,
    watcher: RunWatcher,
    store: EphemeralAudioStore,
    config: TurnConfig,
    locks: ThreadLocks,
    shutdown: CancellationToken,
}

impl TurnOrchestrator {
    pub fn new(
        backend: Arc<dyn AssistantBackend>,
        store: EphemeralAudioStore,
        config: TurnConfig,
    ) -> Self {
        Self {
            backend,
            watcher: RunWatcher::from_config(&config),
            store,
            config,
            locks: ThreadLocks::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &TurnConfig {
        &self.config
    }

    /// Stop every in-flight turn at its next suspension point.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn create_thread(&self) -> Result<ThreadId, TurnError> {
        let cancel = self.shutdown.child_token();
        guarded(&cancel, "create thread", self.backend.create_thread()).await
    }

    /// Send `text` to the assistant and wait for its reply, creating a thread
    /// when none is given.
    pub async fn process_text_turn(
        &self,
        text: &str,
        thread: Option<ThreadId>,
    ) -> Result<TextTurn, TurnError> {
        let cancel = self.shutdown.child_token();
        self.text_turn(text, thread, &cancel).await
    }

    /// Transcribe `audio`, run the transcript as a text turn, and synthesize
    /// the reply. The stored audio is deleted as soon as transcription ends,
    /// whatever its outcome.
    pub async fn process_voice_turn(
        &self,
        audio: Vec<u8>,
        thread: Option<ThreadId>,
    ) -> Result<VoiceTurn, TurnError> {
        if audio.is_empty() {
            return Err(ValidationError::EmptyAudio.into());
        }
        let cancel = self.shutdown.child_token();

        let stored = self.store.persist(&audio).await?;
        drop(audio);
        let transcript = self.transcribe_stored(&stored, &cancel).await;
        stored.release().await;
        let transcript = transcript?;

        let turn = self.text_turn(&transcript, thread, &cancel).await?;

        let reply_audio = match self.speak(&turn.reply, &cancel).await {
            Ok(audio) => Some(audio),
            Err(TurnError::Cancelled) => return Err(TurnError::Cancelled),
            Err(e) => {
                warn!("reply synthesis failed, widget will fall back: {e}");
                None
            }
        };

        Ok(VoiceTurn {
            transcript,
            reply: turn.reply,
            thread_id: turn.thread_id,
            reply_audio,
        })
    }

    /// Speech-only synthesis.
    pub async fn synthesize_speech(&self, text: &str) -> Result<Vec<u8>, TurnError> {
        let cancel = self.shutdown.child_token();
        self.speak(text, &cancel).await
    }

    async fn text_turn(
        &self,
        text: &str,
        thread: Option<ThreadId>,
        cancel: &CancellationToken,
    ) -> Result<TextTurn, TurnError> {
        let thread_id = match thread {
            Some(id) => id,
            None => guarded(cancel, "create thread", self.backend.create_thread()).await?,
        };

        let _turn = self.locks.acquire(&thread_id).await;
        debug!("turn on {thread_id}: {}", preview(text));

        guarded(
            cancel,
            "post message",
            self.backend.post_message(&thread_id, text),
        )
        .await?;
        let run = guarded(cancel, "start run", self.backend.start_run(&thread_id)).await?;

        let status = self.watcher.wait(self.backend.as_ref(), &run, cancel).await?;
        if status != RunStatus::Completed {
            return Err(TurnError::RunFailed { status });
        }

        let messages = guarded(
            cancel,
            "list messages",
            self.backend.list_messages(&thread_id),
        )
        .await?;
        let reply = select_reply(&messages, &run.id)
            .ok_or(TurnError::ResponseMissing)?
            .to_string();

        info!(
            "{} replied on {thread_id}: {}",
            self.backend.name(),
            preview(&reply)
        );
        Ok(TextTurn { reply, thread_id })
    }

    async fn transcribe_stored(
        &self,
        stored: &EphemeralAudio,
        cancel: &CancellationToken,
    ) -> Result<String, TurnError> {
        let bytes = stored.read().await?;
        let file_name = stored.file_name();
        let transcript = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TurnError::Cancelled),
            r = self.backend.transcribe(bytes, &file_name, &self.config.language) => {
                r.map_err(|e| TurnError::Transcription(e.to_string()))?
            }
        };

        if transcript.trim().is_empty() {
            return Err(TurnError::Transcription("no speech recognized".into()));
        }
        info!("{} transcribed audio: {}", self.backend.name(), preview(&transcript));
        Ok(transcript)
    }

    /// Synthesize `text` with markdown and citation markers stripped.
    async fn speak(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<u8>, TurnError> {
        let spoken = clean_for_speech(text);
        if !spoken.chars().any(char::is_alphanumeric) {
            return Err(TurnError::Synthesis("nothing speakable in text".into()));
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TurnError::Cancelled),
            r = self.backend.synthesize(&spoken, &self.config.voice) => {
                r.map_err(|e| TurnError::Synthesis(e.to_string()))
            }
        }
    }
}

/// Await one capability call unless the turn is cancelled first.
async fn guarded<T>(
    cancel: &CancellationToken,
    step: &'static str,
    call: impl Future<Output = RemoteResult<T>>,
) -> Result<T, TurnError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TurnError::Cancelled),
        r = call => r.map_err(TurnError::remote(step)),
    }
}

/// Newest non-empty assistant message, skipping any the provider attributes
/// to a different run. `messages` must be newest-first.
fn select_reply<'a>(messages: &'a [Message], run: &RunId) -> Option<&'a str> {
    messages
        .iter()
        .filter(|m| m.role == Role::Assistant && !m.text.trim().is_empty())
        .find(|m| m.run_id.as_ref().is_none_or(|id| id == run))
        .map(|m| m.text.as_str())
}

/// One async lock per thread id. Entries are weak and pruned as turns end,
/// so the map only holds threads with a turn in flight.
#[derive(Default)]
struct ThreadLocks {
    inner: Mutex<HashMap<ThreadId, Weak<tokio::sync::Mutex<()>>>>,
}

impl ThreadLocks {
    async fn acquire(&self, thread: &ThreadId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.retain(|_, weak| weak.strong_count() > 0);
            match map.get(thread).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(tokio::sync::Mutex::new(()));
                    map.insert(thread.clone(), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }
}
