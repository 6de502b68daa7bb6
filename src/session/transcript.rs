//! JSONL transcript persistence.
//!
//! One file per session under `<dir>/transcripts/<session_id>.jsonl`, one
//! [`TranscriptEntry`] per line. Appends flush immediately; reads skip
//! corrupt lines so a torn write never poisons a whole session.

use super::types::TranscriptEntry;

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub struct TranscriptStore {
    dir: PathBuf,
    // Serialises appends so interleaved writers never tear a line.
    write_lock: Mutex<()>,
}

impl TranscriptStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.join("transcripts"),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.jsonl"))
    }

    /// Append a single entry as one JSONL line.
    pub fn append(&self, session_id: &str, entry: &TranscriptEntry) -> Result<()> {
        let line = serde_json::to_string(entry).context("serializing transcript entry")?;
        let path = self.path_for(session_id);

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating transcript directory {}", self.dir.display()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening transcript {}", path.display()))?;

        writeln!(file, "{line}")
            .with_context(|| format!("appending to transcript {}", path.display()))?;
        file.flush().context("flushing transcript")?;

        Ok(())
    }

    /// Read all entries for a session.
    ///
    /// A missing file is an empty transcript. Lines that fail to parse are
    /// skipped.
    pub fn load(&self, session_id: &str) -> Result<Vec<TranscriptEntry>> {
        let path = self.path_for(session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = fs::File::open(&path)
            .with_context(|| format!("opening transcript {}", path.display()))?;
        let reader = BufReader::new(file);

        let mut entries = Vec::new();
        for (i, line) in reader.lines().enumerate() {
            let line = line.context("reading transcript line")?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TranscriptEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::debug!(
                        session_id,
                        line = i + 1,
                        error = %e,
                        "skipping corrupt transcript line"
                    );
                }
            }
        }

        Ok(entries)
    }

    /// Number of parseable entries in the transcript.
    pub fn count(&self, session_id: &str) -> Result<usize> {
        Ok(self.load(session_id)?.len())
    }

    /// Delete the transcript file. Deleting a transcript that never existed
    /// is not an error.
    pub fn delete(&self, session_id: &str) -> Result<()> {
        let path = self.path_for(session_id);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("deleting transcript {}", path.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::{Role, ToolCall};
    use tempfile::TempDir;

    fn entry(i: usize) -> TranscriptEntry {
        if i % 2 == 0 {
            TranscriptEntry::user(format!("message {i}"))
        } else {
            TranscriptEntry::assistant(format!("reply {i}"))
        }
    }

    #[test]
    fn append_then_load_roundtrips() {
        let tmp = TempDir::new().unwrap();
        let store = TranscriptStore::new(tmp.path());

        let entries: Vec<TranscriptEntry> = (0..5).map(entry).collect();
        for e in &entries {
            store.append("sess-1", e).unwrap();
        }

        let loaded = store.load("sess-1").unwrap();
        assert_eq!(loaded, entries);
        assert_eq!(store.count("sess-1").unwrap(), 5);
    }

    #[test]
    fn missing_transcript_is_empty() {
        let tmp = TempDir::new().unwrap();
        let store = TranscriptStore::new(tmp.path());
        assert!(store.load("nope").unwrap().is_empty());
        assert_eq!(store.count("nope").unwrap(), 0);
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let store = TranscriptStore::new(tmp.path());

        store.append("sess-1", &entry(0)).unwrap();
        store.append("sess-1", &entry(1)).unwrap();

        // Simulate a torn write between two good lines.
        let path = store.path_for("sess-1");
        let mut raw = fs::read_to_string(&path).unwrap();
        raw.push_str("{\"role\":\"user\",\"conte\n");
        fs::write(&path, raw).unwrap();
        store.append("sess-1", &entry(2)).unwrap();

        let loaded = store.load("sess-1").unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[2].content, "message 2");
    }

    #[test]
    fn tool_call_entries_survive_persistence() {
        let tmp = TempDir::new().unwrap();
        let store = TranscriptStore::new(tmp.path());

        let assistant = TranscriptEntry::assistant_with_tool_calls(
            "",
            vec![ToolCall {
                id: "c1".into(),
                name: "shell".into(),
                arguments: r#"{"command":"ls"}"#.into(),
            }],
        );
        let result = TranscriptEntry::tool_result("c1", "a.txt");

        store.append("s", &assistant).unwrap();
        store.append("s", &result).unwrap();

        let loaded = store.load("s").unwrap();
        assert_eq!(loaded[0].role, Role::Assistant);
        assert_eq!(loaded[0].tool_calls.as_ref().unwrap().len(), 1);
        assert_eq!(loaded[1].tool_call_id.as_deref(), Some("c1"));
    }

    #[test]
    fn delete_removes_the_file() {
        let tmp = TempDir::new().unwrap();
        let store = TranscriptStore::new(tmp.path());

        store.append("sess-1", &entry(0)).unwrap();
        assert!(store.path_for("sess-1").exists());

        store.delete("sess-1").unwrap();
        assert!(!store.path_for("sess-1").exists());
        // Idempotent.
        store.delete("sess-1").unwrap();
    }
}
