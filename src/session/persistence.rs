//! Transcript persistence at session teardown.

use crate::session::model::FinalizedSession;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("failed to write transcript: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize transcript: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Receives every finalized session exactly once.
#[async_trait]
pub trait TranscriptSink: Send + Sync {
    async fn persist(&self, session: &FinalizedSession) -> Result<(), PersistenceError>;
}

/// Writes a summary of each finished session to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingTranscriptSink;

#[async_trait]
impl TranscriptSink for LoggingTranscriptSink {
    async fn persist(&self, finalized: &FinalizedSession) -> Result<(), PersistenceError> {
        let duration_secs = (finalized.ended_at - finalized.session.created_at).num_seconds();
        info!(
            session_id = %finalized.session.id,
            owner_id = %finalized.session.owner_id,
            status = %finalized.session.status,
            entries = finalized.transcript.len(),
            duration_secs,
            "Session finalized"
        );
        Ok(())
    }
}

/// Appends one JSON line per finished session to a file.
pub struct JsonlTranscriptSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlTranscriptSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl TranscriptSink for JsonlTranscriptSink {
    async fn persist(&self, finalized: &FinalizedSession) -> Result<(), PersistenceError> {
        let mut line = serde_json::to_vec(finalized)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}
