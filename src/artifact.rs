//! Artifact Relay
//!
//! Side channel that persists the most recent puzzle image for a session so
//! a human solver can view it out-of-band. Independent of the state
//! machine's control flow: publishing never advances a stage.

use crate::error::{FlowError, Result};
use std::path::{Path, PathBuf};

/// Writes puzzle images under a fixed relay directory, one file per session,
/// newest image wins.
pub struct ArtifactRelay {
    dir: PathBuf,
}

impl ArtifactRelay {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist `bytes` as the session's current puzzle image, overwriting
    /// any prior one. No content validation: a zero-length or corrupt blob
    /// is stored as-is, and detecting that is the viewer's problem.
    pub async fn publish(&self, session_id: &str, bytes: &[u8]) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| FlowError::Internal(format!("failed to create relay dir: {}", e)))?;

        let path = self.path_for(session_id);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| FlowError::Internal(format!("failed to write artifact: {}", e)))?;

        log::info!(
            "published artifact for session {}: {} bytes, sha256 {}",
            session_id,
            bytes.len(),
            digest(bytes)
        );
        Ok(path)
    }

    /// Whether a puzzle image is currently staged for the session.
    pub async fn exists(&self, session_id: &str) -> bool {
        tokio::fs::metadata(self.path_for(session_id)).await.is_ok()
    }

    /// Where the session's image lives (whether or not it exists yet).
    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("puzzle_{}.png", sanitize(session_id)))
    }
}

/// Session ids come from callers; strip anything that could escape the
/// relay directory.
fn sanitize(session_id: &str) -> String {
    session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// SHA-256 hex digest, logged so overwrites are visible in the relay's
/// history.
fn digest(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
