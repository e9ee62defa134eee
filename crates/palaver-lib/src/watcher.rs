//! Run completion watcher. Polls a started run until it reaches a terminal
//! status, within a fixed attempt budget.
//!
//! ```text
//! Pending(queued) ──poll──► Pending(in_progress) ──sleep──► … ──poll──► Resolved(completed)
//!        │                                                       │
//!        └── budget spent ──► cancel_run (best effort) ──► RunTimeout
//! ```
//!
//! A transient poll failure keeps the previous status and spends one attempt;
//! only a failure on the last attempt is surfaced. A permanent failure (a 4xx
//! other than 429) ends the watch at once. The cancellation token is checked
//! before every poll and raced against every remote call and sleep.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use palaver_core::types::{Run, RunStatus, TurnConfig};

use crate::backend::AssistantBackend;
use crate::error::TurnError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchState {
    /// Not terminal yet; holds the last status seen.
    Pending { last: RunStatus },
    Resolved(RunStatus),
}

#[derive(Debug, Clone)]
pub struct RunWatcher {
    interval: Duration,
    max_attempts: u32,
}

impl RunWatcher {
    /// A zero budget is bumped to one poll.
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn from_config(config: &TurnConfig) -> Self {
        Self::new(config.poll_interval, config.max_poll_attempts)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Poll `run` until terminal and return the terminal status. A terminal
    /// status other than `completed` is still `Ok`; judging it is the
    /// caller's business.
    pub async fn wait(
        &self,
        backend: &dyn AssistantBackend,
        run: &Run,
        cancel: &CancellationToken,
    ) -> Result<RunStatus, TurnError> {
        let mut state = WatchState::Pending { last: run.status };
        let mut attempt: u32 = 0;

        loop {
            let last = match state {
                WatchState::Resolved(status) => return Ok(status),
                WatchState::Pending { last } => last,
            };

            if attempt >= self.max_attempts {
                return Err(self.abandon(backend, run, last).await);
            }
            if cancel.is_cancelled() {
                return Err(TurnError::Cancelled);
            }

            attempt += 1;
            let polled = tokio::select! {
                _ = cancel.cancelled() => return Err(TurnError::Cancelled),
                polled = backend.run_status(&run.thread_id, &run.id) => polled,
            };

            state = match polled {
                Ok(status) if status.is_terminal() => WatchState::Resolved(status),
                Ok(status) => {
                    debug!("run {} is {status} (attempt {attempt})", run.id);
                    WatchState::Pending { last: status }
                }
                Err(e) if attempt >= self.max_attempts || !e.is_transient() => {
                    return Err(TurnError::remote("check run status")(e));
                }
                Err(e) => {
                    warn!("run {} status check failed (attempt {attempt}): {e}", run.id);
                    WatchState::Pending { last }
                }
            };

            if matches!(state, WatchState::Pending { .. }) && attempt < self.max_attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(TurnError::Cancelled),
                    _ = tokio::time::sleep(self.interval) => {}
                }
            }
        }
    }

    async fn abandon(&self, backend: &dyn AssistantBackend, run: &Run, last: RunStatus) -> TurnError {
        warn!(
            "run {} on {} still {last} after {} checks, abandoning",
            run.id, run.thread_id, self.max_attempts
        );
        if let Err(e) = backend.cancel_run(&run.thread_id, &run.id).await {
            debug!("cancel of abandoned run {} failed: {e}", run.id);
        }
        TurnError::RunTimeout {
            run_id: run.id.clone(),
            attempts: self.max_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use palaver_core::types::{Message, RunId, ThreadId, VoiceParams};

    use super::*;
    use crate::backend::RemoteResult;
    use crate::error::RemoteServiceError;

    /// Answers status polls from a script; every other capability fails.
    struct ScriptedRun {
        script: Mutex<VecDeque<RemoteResult<RunStatus>>>,
        polls: AtomicU32,
        cancels: AtomicU32,
    }

    impl ScriptedRun {
        fn new(script: Vec<RemoteResult<RunStatus>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                polls: AtomicU32::new(0),
                cancels: AtomicU32::new(0),
            }
        }

        fn statuses(statuses: &[RunStatus]) -> Self {
            Self::new(statuses.iter().map(|s| Ok(*s)).collect())
        }
    }

    fn unsupported<T>() -> RemoteResult<T> {
        Err(RemoteServiceError::new(None, "unsupported"))
    }

    #[async_trait]
    impl AssistantBackend for ScriptedRun {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn create_thread(&self) -> RemoteResult<ThreadId> {
            unsupported()
        }
        async fn post_message(&self, _: &ThreadId, _: &str) -> RemoteResult<()> {
            unsupported()
        }
        async fn start_run(&self, _: &ThreadId) -> RemoteResult<Run> {
            unsupported()
        }
        async fn run_status(&self, _: &ThreadId, _: &RunId) -> RemoteResult<RunStatus> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(RunStatus::InProgress))
        }
        async fn cancel_run(&self, _: &ThreadId, _: &RunId) -> RemoteResult<()> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            unsupported()
        }
        async fn list_messages(&self, _: &ThreadId) -> RemoteResult<Vec<Message>> {
            unsupported()
        }
        async fn transcribe(&self, _: Vec<u8>, _: &str, _: &str) -> RemoteResult<String> {
            unsupported()
        }
        async fn synthesize(&self, _: &str, _: &VoiceParams) -> RemoteResult<Vec<u8>> {
            unsupported()
        }
    }

    fn run() -> Run {
        Run {
            id: RunId::new("run_1"),
            thread_id: ThreadId::new("thread_1"),
            status: RunStatus::Queued,
        }
    }

    fn fast(max_attempts: u32) -> RunWatcher {
        RunWatcher::new(Duration::from_millis(1), max_attempts)
    }

    #[tokio::test]
    async fn resolves_after_exact_poll_count() {
        let backend = ScriptedRun::statuses(&[
            RunStatus::Queued,
            RunStatus::InProgress,
            RunStatus::InProgress,
            RunStatus::Completed,
        ]);
        let status = fast(30)
            .wait(&backend, &run(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(status, RunStatus::Completed);
        assert_eq!(backend.polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn times_out_after_budget() {
        let backend = ScriptedRun::statuses(&[RunStatus::InProgress; 6]);
        let err = fast(5)
            .wait(&backend, &run(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TurnError::RunTimeout { attempts: 5, .. }), "{err}");
        assert_eq!(backend.polls.load(Ordering::SeqCst), 5);
        assert_eq!(backend.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn terminal_failure_is_returned_not_raised() {
        let backend = ScriptedRun::statuses(&[RunStatus::InProgress, RunStatus::Failed]);
        let status = fast(30)
            .wait(&backend, &run(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn transient_poll_failures_are_retried() {
        let backend = ScriptedRun::new(vec![
            Err(RemoteServiceError::new(None, "connection reset")),
            Err(RemoteServiceError::new(Some(502), "bad gateway")),
            Ok(RunStatus::Completed),
        ]);
        let status = fast(5)
            .wait(&backend, &run(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(status, RunStatus::Completed);
        assert_eq!(backend.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_poll_failure_stops_watching() {
        let backend = ScriptedRun::new(vec![
            Ok(RunStatus::InProgress),
            Err(RemoteServiceError::new(Some(404), "No run found")),
            Ok(RunStatus::Completed),
        ]);
        let err = fast(5)
            .wait(&backend, &run(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TurnError::Remote { .. }), "{err}");
        assert_eq!(backend.polls.load(Ordering::SeqCst), 2);
        assert_eq!(backend.cancels.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failure_on_last_attempt_is_surfaced() {
        let backend = ScriptedRun::new(vec![
            Ok(RunStatus::InProgress),
            Ok(RunStatus::InProgress),
            Err(RemoteServiceError::new(Some(500), "server error")),
        ]);
        let err = fast(3)
            .wait(&backend, &run(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            TurnError::Remote { step, source } => {
                assert_eq!(step, "check run status");
                assert_eq!(source.status, Some(500));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(backend.cancels.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_before_first_poll() {
        let backend = ScriptedRun::statuses(&[RunStatus::Completed]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = fast(5).wait(&backend, &run(), &cancel).await.unwrap_err();
        assert!(matches!(err, TurnError::Cancelled));
        assert_eq!(backend.polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_interrupts_sleep() {
        let backend = ScriptedRun::statuses(&[RunStatus::InProgress]);
        let cancel = CancellationToken::new();
        let watcher = RunWatcher::new(Duration::from_secs(60), 30);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            watcher.wait(&backend, &run(), &cancel),
        )
        .await
        .expect("watcher should stop promptly");
        assert!(matches!(result, Err(TurnError::Cancelled)));
        assert_eq!(backend.polls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_budget_bumped_to_one() {
        assert_eq!(RunWatcher::new(Duration::ZERO, 0).max_attempts(), 1);
    }
}
