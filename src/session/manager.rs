//! The session manager — lookup-or-create by key, transcript binding, and
//! the `sessions.json` index.

use super::transcript::TranscriptStore;
use super::types::{Role, SessionEntry, TranscriptEntry};
use crate::util::truncate_with_ellipsis;

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

const TITLE_MAX_CHARS: usize = 60;

pub struct SessionManager {
    dir: PathBuf,
    transcripts: TranscriptStore,
    // session_id → entry; loaded once, persisted on every mutation.
    index: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionManager {
    pub fn open(dir: &Path) -> Result<Self> {
        let manager = Self {
            dir: dir.to_path_buf(),
            transcripts: TranscriptStore::new(dir),
            index: Mutex::new(HashMap::new()),
        };
        manager.load_index()?;
        Ok(manager)
    }

    /// The unique session for `session_key`, or `None`.
    pub fn find_by_key(&self, session_key: &str) -> Option<SessionEntry> {
        let index = self.lock_index();
        index
            .values()
            .find(|e| e.session_key == session_key)
            .cloned()
    }

    pub fn get(&self, session_id: &str) -> Option<SessionEntry> {
        self.lock_index().get(session_id).cloned()
    }

    /// Find the session for `session_key`, creating it when absent.
    ///
    /// Creation and lookup happen under one lock, so concurrent callers for
    /// the same key always converge on a single session.
    pub fn get_or_create(
        &self,
        session_key: &str,
        agent_id: &str,
        channel: Option<&str>,
    ) -> Result<SessionEntry> {
        let entry = {
            let mut index = self.lock_index();
            if let Some(existing) = index.values().find(|e| e.session_key == session_key) {
                return Ok(existing.clone());
            }

            let now = Utc::now();
            let entry = SessionEntry {
                session_id: Uuid::new_v4().to_string(),
                session_key: session_key.to_string(),
                agent_id: agent_id.to_string(),
                channel: channel.map(ToString::to_string),
                display_name: None,
                subject: None,
                created_at: now,
                updated_at: now,
                message_count: 0,
            };
            index.insert(entry.session_id.clone(), entry.clone());
            entry
        };
        self.persist_index()?;
        Ok(entry)
    }

    /// Append one entry to the session transcript and bump index metadata.
    pub fn append(&self, session_id: &str, entry: &TranscriptEntry) -> Result<()> {
        {
            let index = self.lock_index();
            if !index.contains_key(session_id) {
                anyhow::bail!("session not found: {session_id}");
            }
        }

        self.transcripts.append(session_id, entry)?;

        {
            let mut index = self.lock_index();
            if let Some(e) = index.get_mut(session_id) {
                e.message_count += 1;
                e.updated_at = Utc::now();
            }
        }
        self.persist_index()
    }

    pub fn load_transcript(&self, session_id: &str) -> Result<Vec<TranscriptEntry>> {
        self.transcripts.load(session_id)
    }

    /// Remove a session: index entry and transcript file both go.
    pub fn delete(&self, session_id: &str) -> Result<bool> {
        let existed = self.lock_index().remove(session_id).is_some();
        if existed {
            self.persist_index()?;
            self.transcripts.delete(session_id)?;
        }
        Ok(existed)
    }

    /// All sessions, most recently updated first.
    pub fn list(&self) -> Vec<SessionEntry> {
        let mut sessions: Vec<SessionEntry> = self.lock_index().values().cloned().collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sessions
    }

    pub fn set_display_name(&self, session_id: &str, name: &str) -> Result<()> {
        {
            let mut index = self.lock_index();
            let entry = index
                .get_mut(session_id)
                .ok_or_else(|| anyhow::anyhow!("session not found: {session_id}"))?;
            entry.display_name = Some(name.to_string());
        }
        self.persist_index()
    }

    pub fn set_subject(&self, session_id: &str, subject: &str) -> Result<()> {
        {
            let mut index = self.lock_index();
            let entry = index
                .get_mut(session_id)
                .ok_or_else(|| anyhow::anyhow!("session not found: {session_id}"))?;
            entry.subject = Some(subject.to_string());
        }
        self.persist_index()
    }

    /// Human-readable title for a session.
    ///
    /// Precedence: explicit display name, then subject, then the first user
    /// entry truncated on a word boundary, then the short id plus date.
    pub fn title(&self, entry: &SessionEntry) -> String {
        if let Some(name) = entry.display_name.as_deref().filter(|n| !n.is_empty()) {
            return name.to_string();
        }
        if let Some(subject) = entry.subject.as_deref().filter(|s| !s.is_empty()) {
            return subject.to_string();
        }
        if let Ok(transcript) = self.load_transcript(&entry.session_id) {
            if let Some(first_user) = transcript.iter().find(|e| e.role == Role::User) {
                let text = first_user.content.trim();
                if !text.is_empty() {
                    return truncate_with_ellipsis(text, TITLE_MAX_CHARS);
                }
            }
        }
        let short_id: String = entry.session_id.chars().take(8).collect();
        format!("{short_id} · {}", entry.created_at.format("%Y-%m-%d"))
    }

    // ── Internal helpers ─────────────────────────────────────────

    fn lock_index(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionEntry>> {
        self.index
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join("sessions.json")
    }

    fn load_index(&self) -> Result<()> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(());
        }
        let raw =
            fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let entries: Vec<SessionEntry> =
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        let mut index = self.lock_index();
        for entry in entries {
            index.insert(entry.session_id.clone(), entry);
        }
        Ok(())
    }

    /// Atomic write: temp file then rename.
    fn persist_index(&self) -> Result<()> {
        let path = self.index_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }

        let data = {
            let index = self.lock_index();
            let mut entries: Vec<&SessionEntry> = index.values().collect();
            entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            serde_json::to_string_pretty(&entries).context("serializing session index")?
        };

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &data).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("renaming {} into place", tmp.display()))?;
        Ok(())
    }
}
