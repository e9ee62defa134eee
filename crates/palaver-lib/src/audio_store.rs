//! Ephemeral audio store. Inbound voice payloads live on disk only for the
//! duration of one transcription.
//!
//! [`EphemeralAudioStore::persist`] hands back an [`EphemeralAudio`] guard.
//! The file is removed by [`EphemeralAudio::release`] on the normal path and
//! by `Drop` on every other one (early return, `?`, panic, or the turn future
//! being dropped mid-flight).

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use palaver_core::wav::AudioFormat;

#[derive(Debug, Clone)]
pub struct EphemeralAudioStore {
    dir: PathBuf,
}

impl EphemeralAudioStore {
    /// Use `dir` for ephemeral files, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `bytes` to a fresh file named after their container format.
    pub async fn persist(&self, bytes: &[u8]) -> io::Result<EphemeralAudio> {
        let format = AudioFormat::sniff(bytes);
        let path = self.dir.join(format!(
            "audio_{}.{}",
            Uuid::new_v4().simple(),
            format.extension()
        ));

        // Guard first, so a partial write is cleaned up too.
        let audio = EphemeralAudio {
            path,
            format,
            released: false,
        };
        tokio::fs::write(&audio.path, bytes).await?;
        debug!("stored {} bytes at {}", bytes.len(), audio.path.display());
        Ok(audio)
    }
}

/// One stored payload. Deleted when released or dropped.
#[derive(Debug)]
pub struct EphemeralAudio {
    path: PathBuf,
    format: AudioFormat,
    released: bool,
}

impl EphemeralAudio {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("audio.{}", self.format.extension()))
    }

    pub async fn read(&self) -> io::Result<Vec<u8>> {
        tokio::fs::read(&self.path).await
    }

    /// Delete the file now. If removal fails, `Drop` tries once more.
    pub async fn release(mut self) {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => self.released = true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => self.released = true,
            Err(e) => warn!("failed to remove {}: {e}", self.path.display()),
        }
    }
}

impl Drop for EphemeralAudio {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("removed {} on drop", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove {}: {e}", self.path.display()),
        }
    }
}
