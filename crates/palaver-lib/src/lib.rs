//! palaver-lib: turn relay engine.
//!
//! Server side: the assistant capability client, run watcher, turn
//! orchestrator, ephemeral audio store, and HTTP API. Widget side: session
//! state, relay client, speech output strategy, capture and playback.
//! Depends on palaver-core for pure types and text processing.

pub mod audio_store;
pub mod backend;
pub mod capture;
pub mod client;
pub mod error;
pub mod local_voice;
pub mod openai;
pub mod orchestrator;
pub mod playback;
pub mod server;
pub mod session;
pub mod speech;
pub mod watcher;

// Re-export palaver-core for convenience
pub use palaver_core;
