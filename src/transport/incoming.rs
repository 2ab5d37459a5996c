//! Inbound replies dropped as JSON files into an incoming directory.
//!
//! Directory layout:
//! - `<dir>/*.json`   : replies waiting to be recorded
//! - `<dir>/rejected/`: files that could not be parsed

use std::fs;
use std::path::{Path, PathBuf};

use crate::core::message::InboundItem;
use crate::error::Error;
use crate::store::Store;

const REJECTED_DIR: &str = "rejected";

/// Result of one ingestion pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    pub recorded: usize,
    pub duplicates: usize,
    pub rejected: usize,
}

impl std::fmt::Display for IngestReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} recorded, {} duplicates, {} rejected",
            self.recorded, self.duplicates, self.rejected
        )
    }
}

pub struct IncomingDir {
    dir: PathBuf,
}

impl IncomingDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Record every waiting file in the store, then remove it.
    pub fn ingest(&self, store: &Store) -> Result<IngestReport, Error> {
        let mut report = IngestReport::default();
        if !self.dir.exists() {
            return Ok(report);
        }

        for path in self.waiting_files()? {
            let parsed = fs::read_to_string(&path)
                .map_err(Error::from)
                .and_then(|content| Ok(serde_json::from_str::<InboundItem>(&content)?));

            let mut item = match parsed {
                Ok(item) => item,
                Err(e) => {
                    tracing::warn!("Rejecting inbound file {}: {}", path.display(), e);
                    self.reject(&path)?;
                    report.rejected += 1;
                    continue;
                }
            };
            item.processed = false;

            if store.record_inbound(&item)? {
                tracing::debug!(id = %item.id, conversation_id = %item.conversation_id, "Recorded inbound item");
                report.recorded += 1;
            } else {
                tracing::debug!(id = %item.id, "Inbound item already recorded");
                report.duplicates += 1;
            }
            fs::remove_file(&path)?;
        }

        Ok(report)
    }

    /// Record a single file without touching the directory.
    pub fn ingest_file(path: &Path, store: &Store) -> Result<bool, Error> {
        if !path.is_file() {
            return Err(Error::NotFound(path.display().to_string()));
        }
        let content = fs::read_to_string(path)?;
        let mut item: InboundItem = serde_json::from_str(&content)?;
        item.processed = false;
        store.record_inbound(&item)
    }

    fn waiting_files(&self) -> Result<Vec<PathBuf>, Error> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().map_or(false, |ext| ext == "json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn reject(&self, path: &Path) -> Result<(), Error> {
        let rejected = self.dir.join(REJECTED_DIR);
        fs::create_dir_all(&rejected)?;
        if let Some(name) = path.file_name() {
            fs::rename(path, rejected.join(name))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn write_item(dir: &Path, file: &str, item: &InboundItem) {
        fs::write(dir.join(file), serde_json::to_string(item).unwrap()).unwrap();
    }

    #[test]
    fn test_ingest_records_and_removes_files() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let at = Utc.with_ymd_and_hms(2024, 5, 14, 12, 0, 0).unwrap();

        let item = InboundItem::new("g1", "t1", "alice@example.com", "sounds good", at);
        write_item(temp_dir.path(), "a.json", &item);
        write_item(temp_dir.path(), "b.json", &item);
        fs::write(temp_dir.path().join("c.json"), "not json").unwrap();
        fs::write(temp_dir.path().join("notes.txt"), "ignored").unwrap();

        let incoming = IncomingDir::new(temp_dir.path());
        let report = incoming.ingest(&store).unwrap();

        assert_eq!(
            report,
            IngestReport {
                recorded: 1,
                duplicates: 1,
                rejected: 1
            }
        );
        assert!(!temp_dir.path().join("a.json").exists());
        assert!(temp_dir.path().join(REJECTED_DIR).join("c.json").exists());
        assert!(temp_dir.path().join("notes.txt").exists());
        assert_eq!(store.unprocessed_inbound().unwrap().len(), 1);
    }

    #[test]
    fn test_ingest_missing_dir_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();

        let incoming = IncomingDir::new(temp_dir.path().join("missing"));
        assert_eq!(incoming.ingest(&store).unwrap(), IngestReport::default());
    }

    #[test]
    fn test_processed_flag_in_file_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let at = Utc.with_ymd_and_hms(2024, 5, 14, 12, 0, 0).unwrap();

        let mut item = InboundItem::new("g1", "t1", "alice@example.com", "hi", at);
        item.processed = true;
        let path = temp_dir.path().join("one.json");
        write_item(temp_dir.path(), "one.json", &item);

        assert!(IncomingDir::ingest_file(&path, &store).unwrap());
        assert!(!store.inbound("g1").unwrap().unwrap().processed);
    }

    #[test]
    fn test_ingest_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();

        let result = IncomingDir::ingest_file(&temp_dir.path().join("nope.json"), &store);
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
