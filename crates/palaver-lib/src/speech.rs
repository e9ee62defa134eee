//! Speech output. Decides how a reply gets spoken and plays it.
//!
//! The route chain is planned up front as a list and tried in order until one
//! plays through:
//!
//! ```text
//! audio in response?  → Prerendered
//! short + local voice → Local → Remote
//! otherwise           → Remote → Local (if available)
//! ```
//!
//! Only one playback is active at a time. Starting a new one cancels the
//! previous token, and the superseded call reports [`SpeechError::Interrupted`].

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use palaver_core::text_prep::char_len;
use palaver_core::types::DEFAULT_SHORT_FORM_THRESHOLD;

use crate::error::SpeechError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechRoute {
    /// Audio that arrived with the turn response.
    Prerendered,
    /// Synthesis on this machine.
    Local,
    /// Synthesis through the relay.
    Remote,
}

/// Plays encoded audio (wav or mp3) to completion.
#[async_trait]
pub trait AudioPlayer: Send + Sync {
    /// Resolves when playback ends. Returns [`SpeechError::Interrupted`] if
    /// `cancel` fires first.
    async fn play(&self, audio: Vec<u8>, cancel: &CancellationToken) -> Result<(), SpeechError>;
}

#[async_trait]
pub trait LocalVoice: Send + Sync {
    /// Cheap reachability probe, checked once per utterance.
    async fn available(&self) -> bool;

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, SpeechError>;
}

#[async_trait]
pub trait RemoteSpeech: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, SpeechError>;
}

/// Order in which routes are attempted for one utterance.
pub fn plan_routes(
    text_chars: usize,
    prerendered: bool,
    local_available: bool,
    short_form_threshold: usize,
) -> Vec<SpeechRoute> {
    let mut routes = Vec::with_capacity(3);
    if prerendered {
        routes.push(SpeechRoute::Prerendered);
    }
    if local_available && text_chars <= short_form_threshold {
        routes.extend([SpeechRoute::Local, SpeechRoute::Remote]);
    } else {
        routes.push(SpeechRoute::Remote);
        if local_available {
            routes.push(SpeechRoute::Local);
        }
    }
    routes
}

pub struct SpeechOutput {
    player: Arc<dyn AudioPlayer>,
    remote: Arc<dyn RemoteSpeech>,
    local: Option<Arc<dyn LocalVoice>>,
    short_form_threshold: usize,
    current: Mutex<Option<CancellationToken>>,
}

impl SpeechOutput {
    pub fn new(player: Arc<dyn AudioPlayer>, remote: Arc<dyn RemoteSpeech>) -> Self {
        Self {
            player,
            remote,
            local: None,
            short_form_threshold: DEFAULT_SHORT_FORM_THRESHOLD,
            current: Mutex::new(None),
        }
    }

    pub fn with_local(mut self, local: Arc<dyn LocalVoice>) -> Self {
        self.local = Some(local);
        self
    }

    pub fn with_short_form_threshold(mut self, chars: usize) -> Self {
        self.short_form_threshold = chars;
        self
    }

    /// Speak `text`, playing `prerendered` directly when given. Returns the
    /// route that played.
    pub async fn speak(
        &self,
        text: &str,
        prerendered: Option<Vec<u8>>,
    ) -> Result<SpeechRoute, SpeechError> {
        let cancel = self.begin();

        let local_available = match &self.local {
            Some(local) => local.available().await,
            None => false,
        };
        let routes = plan_routes(
            char_len(text),
            prerendered.is_some(),
            local_available,
            self.short_form_threshold,
        );
        debug!("speech routes: {routes:?}");

        let mut prerendered = prerendered;
        let mut last_failure: Option<SpeechError> = None;

        for route in routes {
            if cancel.is_cancelled() {
                return Err(SpeechError::Interrupted);
            }

            let audio = match self.render(route, text, &mut prerendered, &cancel).await {
                Ok(audio) => audio,
                Err(SpeechError::Interrupted) => return Err(SpeechError::Interrupted),
                Err(e) => {
                    warn!("{route:?} speech unavailable, trying next: {e}");
                    last_failure = Some(e);
                    continue;
                }
            };

            match self.player.play(audio, &cancel).await {
                Ok(()) => return Ok(route),
                Err(SpeechError::Interrupted) => return Err(SpeechError::Interrupted),
                Err(e) => {
                    warn!("{route:?} playback failed, trying next: {e}");
                    last_failure = Some(e);
                }
            }
        }

        Err(SpeechError::Synthesis(match last_failure {
            Some(e) => e.to_string(),
            None => SpeechError::Unavailable.to_string(),
        }))
    }

    /// Like [`speak`](Self::speak), reporting through hooks. Exactly one of
    /// them runs.
    pub async fn speak_with(
        &self,
        text: &str,
        prerendered: Option<Vec<u8>>,
        on_complete: impl FnOnce(SpeechRoute) + Send,
        on_error: impl FnOnce(SpeechError) + Send,
    ) {
        match self.speak(text, prerendered).await {
            Ok(route) => on_complete(route),
            Err(e) => on_error(e),
        }
    }

    /// Interrupt whatever is playing.
    pub fn stop(&self) {
        if let Some(token) = self.slot().take() {
            token.cancel();
        }
    }

    /// Cancel the previous utterance and register a fresh token.
    fn begin(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self.slot().replace(token.clone()) {
            previous.cancel();
        }
        token
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn render(
        &self,
        route: SpeechRoute,
        text: &str,
        prerendered: &mut Option<Vec<u8>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, SpeechError> {
        let synthesis = async {
            match route {
                SpeechRoute::Prerendered => prerendered.take().ok_or(SpeechError::Unavailable),
                SpeechRoute::Local => match &self.local {
                    Some(local) => local.synthesize(text).await,
                    None => Err(SpeechError::Unavailable),
                },
                SpeechRoute::Remote => self.remote.synthesize(text).await,
            }
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SpeechError::Interrupted),
            r = synthesis => r,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    /// Records what it played. `b"slow"` blocks until cancelled, `b"bad"`
    /// fails to decode.
    #[derive(Default)]
    struct RecordingPlayer {
        played: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl AudioPlayer for RecordingPlayer {
        async fn play(&self, audio: Vec<u8>, cancel: &CancellationToken) -> Result<(), SpeechError> {
            match audio.as_slice() {
                b"slow" => {
                    cancel.cancelled().await;
                    Err(SpeechError::Interrupted)
                }
                b"bad" => Err(SpeechError::Playback("undecodable".into())),
                _ => {
                    self.played.lock().unwrap().push(audio);
                    Ok(())
                }
            }
        }
    }

    struct FixedVoice {
        result: Result<Vec<u8>, SpeechError>,
        calls: AtomicUsize,
    }

    impl FixedVoice {
        fn ok(audio: &[u8]) -> Arc<Self> {
            Arc::new(Self {
                result: Ok(audio.to_vec()),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                result: Err(SpeechError::Synthesis("service down".into())),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RemoteSpeech for FixedVoice {
        async fn synthesize(&self, _: &str) -> Result<Vec<u8>, SpeechError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    #[async_trait]
    impl LocalVoice for FixedVoice {
        async fn available(&self) -> bool {
            self.result.is_ok()
        }

        async fn synthesize(&self, _: &str) -> Result<Vec<u8>, SpeechError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    #[test]
    fn plan_long_text_prefers_remote() {
        assert_eq!(
            plan_routes(500, false, true, 200),
            vec![SpeechRoute::Remote, SpeechRoute::Local]
        );
    }

    #[test]
    fn plan_short_text_prefers_local() {
        assert_eq!(
            plan_routes(200, false, true, 200),
            vec![SpeechRoute::Local, SpeechRoute::Remote]
        );
    }

    #[test]
    fn plan_without_local() {
        assert_eq!(plan_routes(10, false, false, 200), vec![SpeechRoute::Remote]);
    }

    #[test]
    fn plan_prerendered_first() {
        assert_eq!(
            plan_routes(10, true, false, 200),
            vec![SpeechRoute::Prerendered, SpeechRoute::Remote]
        );
    }

    #[tokio::test]
    async fn prerendered_audio_played_without_synthesis() {
        let player = Arc::new(RecordingPlayer::default());
        let remote = FixedVoice::ok(b"remote");
        let output = SpeechOutput::new(player.clone(), remote.clone());

        let route = output.speak("hi", Some(b"attached".to_vec())).await.unwrap();
        assert_eq!(route, SpeechRoute::Prerendered);
        assert_eq!(remote.calls(), 0);
        assert_eq!(player.played.lock().unwrap()[0], b"attached");
    }

    #[tokio::test]
    async fn remote_failure_falls_back_to_local() {
        let player = Arc::new(RecordingPlayer::default());
        let remote = FixedVoice::failing();
        let local = FixedVoice::ok(b"local");
        let output = SpeechOutput::new(player.clone(), remote.clone()).with_local(local.clone());

        let long = "word ".repeat(100);
        let route = output.speak(&long, None).await.unwrap();
        assert_eq!(route, SpeechRoute::Local);
        assert_eq!(remote.calls(), 1);
        assert_eq!(player.played.lock().unwrap()[0], b"local");
    }

    #[tokio::test]
    async fn short_text_uses_local_first() {
        let player = Arc::new(RecordingPlayer::default());
        let remote = FixedVoice::ok(b"remote");
        let local = FixedVoice::ok(b"local");
        let output = SpeechOutput::new(player, remote.clone()).with_local(local);

        assert_eq!(output.speak("Hello!", None).await.unwrap(), SpeechRoute::Local);
        assert_eq!(remote.calls(), 0);
    }

    #[tokio::test]
    async fn every_route_failing_is_synthesis_error() {
        let player = Arc::new(RecordingPlayer::default());
        let output = SpeechOutput::new(player, FixedVoice::failing()).with_local(FixedVoice::failing());

        let err = output.speak("Hello", None).await.unwrap_err();
        assert!(matches!(err, SpeechError::Synthesis(_)), "{err}");
    }

    #[tokio::test]
    async fn undecodable_prerendered_audio_falls_through() {
        let player = Arc::new(RecordingPlayer::default());
        let output = SpeechOutput::new(player.clone(), FixedVoice::ok(b"remote"));

        let route = output.speak("hi", Some(b"bad".to_vec())).await.unwrap();
        assert_eq!(route, SpeechRoute::Remote);
    }

    #[tokio::test]
    async fn new_utterance_interrupts_previous() {
        let player = Arc::new(RecordingPlayer::default());
        let output = Arc::new(SpeechOutput::new(player.clone(), FixedVoice::ok(b"next")));

        let first = {
            let output = output.clone();
            tokio::spawn(async move { output.speak("one", Some(b"slow".to_vec())).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(output.speak("two", None).await.unwrap(), SpeechRoute::Remote);
        assert_eq!(first.await.unwrap(), Err(SpeechError::Interrupted));
    }

    #[tokio::test]
    async fn hooks_run_exactly_once() {
        let player = Arc::new(RecordingPlayer::default());
        let output = SpeechOutput::new(player, FixedVoice::failing());
        let completed = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);

        output
            .speak_with(
                "Hello",
                None,
                |_| {
                    completed.fetch_add(1, Ordering::SeqCst);
                },
                |_| {
                    failed.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await;

        assert_eq!(completed.load(Ordering::SeqCst), 0);
        assert_eq!(failed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_interrupts_playback() {
        let player = Arc::new(RecordingPlayer::default());
        let output = Arc::new(SpeechOutput::new(player, FixedVoice::ok(b"x")));

        let speaking = {
            let output = output.clone();
            tokio::spawn(async move { output.speak("one", Some(b"slow".to_vec())).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        output.stop();

        assert_eq!(speaking.await.unwrap(), Err(SpeechError::Interrupted));
    }
}
