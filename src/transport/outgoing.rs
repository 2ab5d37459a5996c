//! Sender that drops delivered messages into an outgoing directory.
//!
//! Each message lands in `<dir>/<message_id>.json`. A retried message
//! finds its earlier file and reuses the conversation id recorded there.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{OutboundEmail, SendReceipt, Sender, TransportError};

/// Outgoing file contents.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct OutgoingFile {
    pub conversation_id: String,
    pub email: OutboundEmail,
    pub written_at: DateTime<Utc>,
}

pub struct OutgoingDirSender {
    dir: PathBuf,
}

impl OutgoingDirSender {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, message_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", message_id))
    }

    fn existing(&self, path: &Path) -> Option<OutgoingFile> {
        let content = fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Delivered files, oldest first.
    pub fn list(&self) -> Result<Vec<OutgoingFile>, TransportError> {
        if !self.dir.exists() {
            return Ok(vec![]);
        }

        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == "json") {
                if let Some(file) = self.existing(&path) {
                    files.push(file);
                }
            }
        }
        files.sort_by_key(|f| f.written_at);
        Ok(files)
    }
}

#[async_trait]
impl Sender for OutgoingDirSender {
    fn name(&self) -> &str {
        "outgoing-dir"
    }

    async fn send(&self, email: &OutboundEmail) -> Result<SendReceipt, TransportError> {
        if email.message_id.is_empty() || email.message_id.contains(['/', '\\']) {
            return Err(TransportError::Rejected(format!(
                "unusable message id '{}'",
                email.message_id
            )));
        }
        fs::create_dir_all(&self.dir)?;

        let path = self.path_for(&email.message_id);
        if let Some(previous) = self.existing(&path) {
            tracing::debug!("Message {} already written, reusing receipt", email.message_id);
            return Ok(SendReceipt {
                conversation_id: previous.conversation_id,
            });
        }

        let conversation_id = email
            .parent_conversation_id
            .clone()
            .unwrap_or_else(|| ulid::Ulid::new().to_string());
        let file = OutgoingFile {
            conversation_id: conversation_id.clone(),
            email: email.clone(),
            written_at: Utc::now(),
        };

        // Readers of the directory only ever see complete files.
        let tmp = self.dir.join(format!(".{}.tmp", email.message_id));
        fs::write(&tmp, serde_json::to_string_pretty(&file)?)?;
        fs::rename(&tmp, &path)?;

        tracing::debug!("Wrote outgoing message {} to {}", email.message_id, path.display());
        Ok(SendReceipt { conversation_id })
    }
}
