//! Session management — conversation identity, JSONL transcripts, and the
//! on-disk session index.
//!
//! A session is one stable conversation thread addressed by a `session_key`
//! (e.g. `telegram:12345`, `subagent:<uuid>`, `cron:<job-id>`). Metadata
//! lives in a single `sessions.json` index; the message log is a per-session
//! append-only JSONL file.

pub mod manager;
pub mod transcript;
pub mod types;

pub use manager::SessionManager;
pub use transcript::TranscriptStore;
pub use types::*;
