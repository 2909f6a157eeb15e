//! Read-only access to session transcripts
//!
//! Transcripts are written by the hosting runtime, one directory per session:
//!
//! ```text
//! <transcripts_dir>/<session_id>/history.jsonl
//! ```
//!
//! Each line is a JSON object with a `role`, a `content` that is either a
//! string or an array of content blocks, and an optional `timestamp`.
//! This module never writes them.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::MeshResult;

/// File name of a session's transcript inside its directory
const HISTORY_FILE: &str = "history.jsonl";

/// Default number of entries returned by `get_history`
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

/// One entry of a session transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: String,

    /// Plain string or array of content blocks
    pub content: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl TranscriptEntry {
    pub fn new(role: impl Into<String>, content: impl Into<Value>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            timestamp: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Concatenated text of the entry, ignoring non-text blocks
    pub fn text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            Value::Array(blocks) => blocks
                .iter()
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        }
    }
}

/// Source of transcripts, keyed by session id
pub trait TranscriptSource: Send + Sync {
    /// Ids of every available transcript
    fn transcript_ids(&self) -> MeshResult<Vec<String>>;

    /// Entries of one transcript, `None` if there is no such transcript
    fn read(&self, transcript_id: &str) -> MeshResult<Option<Vec<TranscriptEntry>>>;
}

/// Transcripts stored as `history.jsonl` files under a directory
#[derive(Debug, Clone)]
pub struct FileTranscripts {
    base_dir: PathBuf,
}

impl FileTranscripts {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Get the base directory
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Get the transcript path for a session
    pub fn history_path(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(session_id).join(HISTORY_FILE)
    }
}

impl TranscriptSource for FileTranscripts {
    fn transcript_ids(&self) -> MeshResult<Vec<String>> {
        let entries = match fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if !path.join(HISTORY_FILE).is_file() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                ids.push(name.to_string());
            }
        }

        Ok(ids)
    }

    fn read(&self, transcript_id: &str) -> MeshResult<Option<Vec<TranscriptEntry>>> {
        // Ids come from callers; don't let one reach outside base_dir
        if transcript_id.is_empty() || transcript_id.contains(['/', '\\']) || transcript_id.starts_with('.') {
            return Ok(None);
        }

        let path = self.history_path(transcript_id);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TranscriptEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(
                    transcript = transcript_id,
                    line = line_no + 1,
                    error = %e,
                    "Skipping malformed transcript line"
                ),
            }
        }

        Ok(Some(entries))
    }
}

/// Resolve `session_id` to a transcript and return its tail
///
/// An exact id wins. Otherwise the lexicographically smallest id containing
/// `session_id` is used. With `since`, only entries stamped strictly after it
/// are kept; undated entries are dropped. Errors from the source are logged
/// and produce an empty history.
pub fn lookup_history(
    source: &dyn TranscriptSource,
    session_id: &str,
    limit: usize,
    since: Option<DateTime<Utc>>,
) -> Vec<TranscriptEntry> {
    let entries = match resolve(source, session_id) {
        Ok(Some(entries)) => entries,
        Ok(None) => return Vec::new(),
        Err(e) => {
            tracing::warn!(session_id, error = %e, "Failed to read transcript");
            return Vec::new();
        }
    };

    let mut entries: Vec<TranscriptEntry> = match since {
        Some(since) => entries
            .into_iter()
            .filter(|entry| entry.timestamp.is_some_and(|ts| ts > since))
            .collect(),
        None => entries,
    };

    if entries.len() > limit {
        entries.drain(..entries.len() - limit);
    }
    entries
}

fn resolve(source: &dyn TranscriptSource, session_id: &str) -> MeshResult<Option<Vec<TranscriptEntry>>> {
    if let Some(entries) = source.read(session_id)? {
        return Ok(Some(entries));
    }

    let mut ids = source.transcript_ids()?;
    ids.sort();
    match ids.iter().find(|id| id.contains(session_id)) {
        Some(id) => {
            tracing::debug!(session_id, transcript = %id, "Resolved transcript by partial id");
            source.read(id)
        }
        None => Ok(None),
    }
}
