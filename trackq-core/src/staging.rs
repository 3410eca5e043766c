//! Staging store for requests composed while attribution is unresolved.
//!
//! One JSON object per line, appended in arrival order. The store is empty
//! exactly when its file does not exist.

use crate::error::Result;
use crate::request::TrackingRequest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// A composed request waiting for the attribution decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedRequest {
    pub request: TrackingRequest,
    /// Version of the configuration snapshot active when it was composed
    pub config_version: u32,
    pub staged_at: DateTime<Utc>,
}

impl StagedRequest {
    pub fn new(request: TrackingRequest, config_version: u32) -> Self {
        Self {
            request,
            config_version,
            staged_at: Utc::now(),
        }
    }
}

pub struct StagingStore {
    path: PathBuf,
}

impl StagingStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_empty(&self) -> bool {
        !self.path.exists()
    }

    /// Append one request; failures are logged and the request is lost.
    pub fn save(&self, staged: &StagedRequest) {
        if let Err(e) = self.append(staged) {
            tracing::error!(error = %e, path = %self.path.display(), "Failed to stage request");
        }
    }

    fn append(&self, staged: &StagedRequest) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(staged)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Read every parseable entry in file order; bad lines are skipped.
    pub fn read_all(&self) -> Vec<StagedRequest> {
        let file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                tracing::error!(error = %e, path = %self.path.display(), "Failed to open staging file");
                return Vec::new();
            }
        };

        let mut staged = Vec::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(line = line_no + 1, error = %e, "Staging file unreadable, stopping");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StagedRequest>(&line) {
                Ok(request) => staged.push(request),
                Err(e) => {
                    tracing::warn!(line = line_no + 1, error = %e, "Skipping malformed staged request")
                }
            }
        }
        staged
    }

    /// Hand every staged request to `sink` in order, then delete the file.
    ///
    /// Returns the number of requests handed over.
    pub fn drain<F>(&self, mut sink: F) -> usize
    where
        F: FnMut(StagedRequest),
    {
        if self.is_empty() {
            return 0;
        }

        let staged = self.read_all();
        let count = staged.len();
        for request in staged {
            sink(request);
        }
        self.delete();

        tracing::info!(count, "Drained staged requests");
        count
    }

    pub fn delete(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(error = %e, "Failed to delete staging file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Param, ParameterSet, RequestKind};
    use tempfile::TempDir;

    fn request(screen: &str) -> StagedRequest {
        StagedRequest::new(
            TrackingRequest::new(
                RequestKind::General,
                ParameterSet::new().with(Param::ScreenName, screen),
            ),
            1,
        )
    }

    #[test]
    fn test_is_empty_follows_file_existence() {
        let tmp = TempDir::new().unwrap();
        let store = StagingStore::new(tmp.path().join("pending.jsonl"));
        assert!(store.is_empty());

        store.save(&request("Home"));
        assert!(!store.is_empty());

        store.delete();
        assert!(store.is_empty());
    }

    #[test]
    fn test_drain_preserves_order_and_deletes_file() {
        let tmp = TempDir::new().unwrap();
        let store = StagingStore::new(tmp.path().join("pending.jsonl"));
        for screen in ["one", "two", "three"] {
            store.save(&request(screen));
        }

        let mut screens = Vec::new();
        let count = store.drain(|staged| {
            screens.push(
                staged
                    .request
                    .parameters
                    .get(Param::ScreenName)
                    .unwrap()
                    .to_string(),
            )
        });

        assert_eq!(count, 3);
        assert_eq!(screens, vec!["one", "two", "three"]);
        assert!(store.is_empty());
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("pending.jsonl");
        let store = StagingStore::new(&path);
        store.save(&request("first"));
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(file, "{{not json").unwrap();
        }
        store.save(&request("last"));

        let staged = store.read_all();
        assert_eq!(staged.len(), 2);
        assert_eq!(
            staged[1].request.parameters.get(Param::ScreenName),
            Some("last")
        );
    }

    #[test]
    fn test_fully_unreadable_file_drains_nothing() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("pending.jsonl");
        std::fs::write(&path, "garbage\nmore garbage\n").unwrap();
        let store = StagingStore::new(&path);

        let count = store.drain(|_| panic!("nothing should be drained"));
        assert_eq!(count, 0);
        assert!(store.is_empty());
    }
}
