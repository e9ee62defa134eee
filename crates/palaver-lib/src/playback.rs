//! Rodio-backed [`AudioPlayer`].
//!
//! rodio's `OutputStream` is `!Send`, so the output device lives on a
//! dedicated OS thread. Async callers send it commands and await a oneshot
//! that fires when their clip drains, fails, or is superseded.

use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use async_trait::async_trait;
use rodio::{Decoder, OutputStream, Sink};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::SpeechError;
use crate::speech::AudioPlayer;

/// How often the playback thread checks whether the sink has drained.
const DRAIN_POLL: Duration = Duration::from_millis(50);

enum PlayCmd {
    Play {
        id: u64,
        audio: Vec<u8>,
        done: oneshot::Sender<Result<(), SpeechError>>,
    },
    Stop {
        id: u64,
    },
}

struct Active {
    id: u64,
    sink: Sink,
    done: oneshot::Sender<Result<(), SpeechError>>,
}

pub struct RodioPlayer {
    cmd_tx: mpsc::Sender<PlayCmd>,
    next_id: AtomicU64,
}

impl RodioPlayer {
    /// Spawn the playback thread on the default output device.
    pub fn new() -> Result<Self, SpeechError> {
        let (cmd_tx, cmd_rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("palaver-playback".into())
            .spawn(move || playback_thread(cmd_rx))
            .map_err(|e| SpeechError::Playback(format!("failed to spawn playback thread: {e}")))?;

        Ok(Self {
            cmd_tx,
            next_id: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl AudioPlayer for RodioPlayer {
    async fn play(&self, audio: Vec<u8>, cancel: &CancellationToken) -> Result<(), SpeechError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = oneshot::channel();
        self.cmd_tx
            .send(PlayCmd::Play {
                id,
                audio,
                done: done_tx,
            })
            .map_err(|_| SpeechError::Playback("audio output unavailable".into()))?;

        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = self.cmd_tx.send(PlayCmd::Stop { id });
                Err(SpeechError::Interrupted)
            }
            result = done_rx => result.unwrap_or_else(|_| {
                Err(SpeechError::Playback("playback thread exited".into()))
            }),
        }
    }
}

fn playback_thread(cmd_rx: mpsc::Receiver<PlayCmd>) {
    let (_stream, stream_handle) = match OutputStream::try_default() {
        Ok(pair) => pair,
        Err(e) => {
            error!("playback: failed to open audio output: {e}");
            return;
        }
    };

    let mut current: Option<Active> = None;

    loop {
        match cmd_rx.recv_timeout(DRAIN_POLL) {
            Ok(PlayCmd::Play { id, audio, done }) => {
                if let Some(prev) = current.take() {
                    prev.sink.stop();
                    let _ = prev.done.send(Err(SpeechError::Interrupted));
                }

                let source = match Decoder::new(Cursor::new(audio)) {
                    Ok(source) => source,
                    Err(e) => {
                        let _ = done.send(Err(SpeechError::Playback(format!("undecodable audio: {e}"))));
                        continue;
                    }
                };
                let sink = match Sink::try_new(&stream_handle) {
                    Ok(sink) => sink,
                    Err(e) => {
                        let _ = done.send(Err(SpeechError::Playback(e.to_string())));
                        continue;
                    }
                };

                debug!("playback: clip {id} started");
                sink.append(source);
                current = Some(Active { id, sink, done });
            }
            Ok(PlayCmd::Stop { id }) => {
                if let Some(active) = current.take_if(|a| a.id == id) {
                    debug!("playback: clip {id} stopped");
                    active.sink.stop();
                    let _ = active.done.send(Err(SpeechError::Interrupted));
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                if let Some(active) = current.take() {
                    active.sink.stop();
                }
                break;
            }
        }

        if let Some(active) = current.take_if(|a| a.sink.empty()) {
            debug!("playback: clip {} finished", active.id);
            let _ = active.done.send(Ok(()));
        }
    }
}
