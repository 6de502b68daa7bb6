//! The announce pipeline — debounced, optionally collected delivery of
//! background-run results into the requesting conversation.
//!
//! Completions enqueue per requester; each enqueue resets a debounce timer.
//! When the timer fires, the queue drains into a single agent trigger:
//! parallel spawns finishing inside the window arrive as one collected
//! message, a lone completion is reported on its own.

use super::registry::{SubagentOutcome, SubagentRun};
use crate::gateway::{GatewayRef, TriggerOutcome};
use crate::session::{Role, SessionManager};

use std::collections::HashMap;
use std::fmt::Write;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Window in which sibling completions coalesce. Long enough that parallel
/// spawns from one model turn land together, short enough that a lone
/// completion is reported promptly.
pub const ANNOUNCE_DEBOUNCE: Duration = Duration::from_millis(2000);

/// Runs once the drain has resolved the trigger for this item's run. The
/// flag says whether the announcement actually reached an agent; cleanup
/// policy hangs off it.
pub type AnnounceDone = Box<dyn FnOnce(bool) + Send>;

struct AnnounceItem {
    label: String,
    status: String,
    findings: String,
    duration_ms: Option<i64>,
    done: Option<AnnounceDone>,
}

#[derive(Default)]
struct QueueState {
    items: Vec<AnnounceItem>,
    channel: String,
    timer: Option<JoinHandle<()>>,
    draining: bool,
}

pub struct AnnouncePipeline {
    sessions: Arc<SessionManager>,
    gateway: OnceLock<Arc<dyn GatewayRef>>,
    debounce: Duration,
    queues: Mutex<HashMap<String, QueueState>>,
}

impl AnnouncePipeline {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self::with_debounce(sessions, ANNOUNCE_DEBOUNCE)
    }

    pub fn with_debounce(sessions: Arc<SessionManager>, debounce: Duration) -> Self {
        Self {
            sessions,
            gateway: OnceLock::new(),
            debounce,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Wire the gateway. Must happen before the first completion.
    pub fn set_gateway(&self, gateway: Arc<dyn GatewayRef>) {
        let _ = self.gateway.set(gateway);
    }

    /// Announce one finished run: load its findings, enqueue, and reset the
    /// requester's debounce timer. `done` fires after the drain's trigger
    /// resolves, with whether the announcement was delivered.
    pub fn run_announce_flow(
        self: &Arc<Self>,
        run: &SubagentRun,
        error: Option<&str>,
        done: Option<AnnounceDone>,
    ) {
        let findings = self.load_findings(&run.child_session_key);
        let item = AnnounceItem {
            label: run.display_label(),
            status: status_phrase(run.outcome, error),
            findings,
            duration_ms: run.duration_ms(),
            done,
        };

        let key = run.requester_session_key.clone();
        {
            let mut queues = self.lock_queues();
            let state = queues.entry(key.clone()).or_default();
            state.items.push(item);
            state.channel = run.requester_channel.clone();

            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            let pipeline = Arc::clone(self);
            let timer_key = key.clone();
            let debounce = self.debounce;
            state.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(debounce).await;
                pipeline.drain(&timer_key).await;
            }));
        }
        tracing::debug!(requester = %key, "queued background-run announcement");
    }

    /// Deliver everything queued for one requester as a single trigger.
    async fn drain(self: &Arc<Self>, session_key: &str) {
        let (items, channel) = {
            let mut queues = self.lock_queues();
            let Some(state) = queues.get_mut(session_key) else {
                return;
            };
            if state.draining || state.items.is_empty() {
                return;
            }
            state.draining = true;
            state.timer = None;
            (std::mem::take(&mut state.items), state.channel.clone())
        };

        let message = compose_message(&items);

        let Some(gateway) = self.gateway.get().cloned() else {
            tracing::error!("announce pipeline has no gateway wired; dropping announcement");
            Self::report_done(items, false);
            self.finish_drain(session_key);
            return;
        };

        let result = gateway.trigger_agent(session_key, &channel, &message).await;
        let delivered = matches!(
            result,
            Ok(TriggerOutcome::Steered | TriggerOutcome::Invoked)
        );
        match &result {
            Ok(outcome) => {
                tracing::debug!(requester = %session_key, ?outcome, "announced background results");
            }
            Err(e) => {
                tracing::warn!(requester = %session_key, error = %e, "announce trigger failed");
            }
        }

        Self::report_done(items, delivered);
        self.finish_drain(session_key);
    }

    fn report_done(items: Vec<AnnounceItem>, delivered: bool) {
        for item in items {
            if let Some(done) = item.done {
                done(delivered);
            }
        }
    }

    /// Clear the reentrancy guard; re-arm the timer if completions landed
    /// while the trigger was in flight, otherwise drop the queue.
    fn finish_drain(self: &Arc<Self>, session_key: &str) {
        let mut queues = self.lock_queues();
        let Some(state) = queues.get_mut(session_key) else {
            return;
        };
        state.draining = false;

        if state.items.is_empty() {
            queues.remove(session_key);
        } else {
            let pipeline = Arc::clone(self);
            let key = session_key.to_string();
            let debounce = self.debounce;
            state.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(debounce).await;
                pipeline.drain(&key).await;
            }));
        }
    }

    /// The child's last assistant entry; empty when the run never produced
    /// one.
    fn load_findings(&self, child_session_key: &str) -> String {
        let Some(session) = self.sessions.find_by_key(child_session_key) else {
            return String::new();
        };
        match self.sessions.load_transcript(&session.session_id) {
            Ok(transcript) => transcript
                .iter()
                .rev()
                .find(|e| e.role == Role::Assistant)
                .map(|e| e.content.clone())
                .unwrap_or_default(),
            Err(e) => {
                tracing::warn!(child = %child_session_key, error = %e, "could not load findings");
                String::new()
            }
        }
    }

    fn lock_queues(&self) -> std::sync::MutexGuard<'_, HashMap<String, QueueState>> {
        self.queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn status_phrase(outcome: Option<SubagentOutcome>, error: Option<&str>) -> String {
    match outcome {
        Some(SubagentOutcome::Ok) => "completed successfully".to_string(),
        Some(SubagentOutcome::Error) => {
            format!("failed: {}", error.unwrap_or("unknown error"))
        }
        _ => "finished with unknown status".to_string(),
    }
}

fn format_duration(duration_ms: Option<i64>) -> String {
    match duration_ms {
        Some(ms) if ms >= 1000 => format!("{:.1}s", ms as f64 / 1000.0),
        Some(ms) => format!("{ms}ms"),
        None => "unknown duration".to_string(),
    }
}

/// Compose the trigger message: a single-task report, or the collected form
/// when several completions landed inside one debounce window. Per-task
/// blocks keep completion order.
fn compose_message(items: &[AnnounceItem]) -> String {
    if items.len() == 1 {
        let item = &items[0];
        let findings = if item.findings.trim().is_empty() {
            "(no findings reported)"
        } else {
            item.findings.as_str()
        };
        return format!(
            "Background task \"{}\" {}.\n\n{}\n\nTook {}.\n\n\
             Summarize this naturally for the user. Keep it brief (1-2 \
             sentences). You can respond with NO_REPLY if no announcement is \
             needed.",
            item.label,
            item.status,
            findings,
            format_duration(item.duration_ms)
        );
    }

    let mut message = format!("[{} background tasks completed]\n", items.len());
    for (i, item) in items.iter().enumerate() {
        let _ = write!(
            message,
            "\n--- Task {}: \"{}\" ({}) ---\n{}\n",
            i + 1,
            item.label,
            item.status,
            if item.findings.trim().is_empty() {
                "(no findings reported)"
            } else {
                item.findings.as_str()
            }
        );
    }
    message.push_str(
        "\nSummarize these results together for the user. Keep it brief. You \
         can respond with NO_REPLY if no announcement is needed.",
    );
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::TriggerOutcome;
    use crate::session::TranscriptEntry;
    use crate::subagents::registry::CleanupMode;
    use async_trait::async_trait;
    use chrono::Utc;
    use tempfile::TempDir;

    struct RecordingGateway {
        triggers: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl GatewayRef for RecordingGateway {
        async fn send_to_session(
            &self,
            _session_key: &str,
            _channel: &str,
            _text: &str,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn trigger_agent(
            &self,
            session_key: &str,
            channel: &str,
            message: &str,
        ) -> anyhow::Result<TriggerOutcome> {
            self.triggers.lock().unwrap().push((
                session_key.to_string(),
                channel.to_string(),
                message.to_string(),
            ));
            Ok(TriggerOutcome::Invoked)
        }
    }

    fn run(requester: &str, label: &str, outcome: SubagentOutcome) -> SubagentRun {
        let now = Utc::now();
        SubagentRun {
            run_id: uuid::Uuid::new_v4().to_string(),
            child_session_key: format!("subagent:{label}"),
            requester_session_key: requester.into(),
            requester_channel: "terminal".into(),
            task: format!("task for {label}"),
            label: Some(label.into()),
            cleanup: CleanupMode::Delete,
            created_at: now,
            started_at: Some(now - chrono::Duration::seconds(3)),
            ended_at: Some(now),
            outcome: Some(outcome),
            archive_at_ms: None,
        }
    }

    fn pipeline(tmp: &TempDir, debounce_ms: u64) -> (Arc<AnnouncePipeline>, Arc<RecordingGateway>, Arc<SessionManager>) {
        let sessions = Arc::new(SessionManager::open(tmp.path()).unwrap());
        let pipeline = Arc::new(AnnouncePipeline::with_debounce(
            sessions.clone(),
            Duration::from_millis(debounce_ms),
        ));
        let gateway = Arc::new(RecordingGateway {
            triggers: Mutex::new(Vec::new()),
        });
        pipeline.set_gateway(gateway.clone());
        (pipeline, gateway, sessions)
    }

    fn seed_findings(sessions: &SessionManager, child_key: &str, text: &str) {
        let session = sessions.get_or_create(child_key, "default", None).unwrap();
        sessions
            .append(&session.session_id, &TranscriptEntry::assistant(text))
            .unwrap();
    }

    #[tokio::test]
    async fn lone_completion_triggers_single_form() {
        let tmp = TempDir::new().unwrap();
        let (pipeline, gateway, sessions) = pipeline(&tmp, 50);

        let r = run("terminal:alice", "log scan", SubagentOutcome::Ok);
        seed_findings(&sessions, &r.child_session_key, "no anomalies found");

        pipeline.run_announce_flow(&r, None, None);
        tokio::time::sleep(Duration::from_millis(250)).await;

        let triggers = gateway.triggers.lock().unwrap();
        assert_eq!(triggers.len(), 1);
        let (key, channel, message) = &triggers[0];
        assert_eq!(key, "terminal:alice");
        assert_eq!(channel, "terminal");
        assert!(message.contains("\"log scan\" completed successfully"));
        assert!(message.contains("no anomalies found"));
        assert!(message.contains("NO_REPLY"));
        assert!(!message.contains("background tasks completed"));
    }

    #[tokio::test]
    async fn completions_in_one_window_collect_in_completion_order() {
        let tmp = TempDir::new().unwrap();
        let (pipeline, gateway, sessions) = pipeline(&tmp, 150);

        for (label, findings) in [("A", "a-done"), ("B", "b-done"), ("C", "c-done")] {
            let r = run("terminal:alice", label, SubagentOutcome::Ok);
            seed_findings(&sessions, &r.child_session_key, findings);
            pipeline.run_announce_flow(&r, None, None);
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        tokio::time::sleep(Duration::from_millis(400)).await;

        let triggers = gateway.triggers.lock().unwrap();
        assert_eq!(triggers.len(), 1);
        let message = &triggers[0].2;
        assert!(message.contains("[3 background tasks completed]"));

        let pos_a = message.find("Task 1: \"A\"").unwrap();
        let pos_b = message.find("Task 2: \"B\"").unwrap();
        let pos_c = message.find("Task 3: \"C\"").unwrap();
        assert!(pos_a < pos_b && pos_b < pos_c);
        assert!(message.contains("a-done"));
        assert!(message.contains("c-done"));
    }

    #[tokio::test]
    async fn completions_in_separate_windows_trigger_separately() {
        let tmp = TempDir::new().unwrap();
        let (pipeline, gateway, sessions) = pipeline(&tmp, 50);

        let r1 = run("terminal:alice", "first", SubagentOutcome::Ok);
        seed_findings(&sessions, &r1.child_session_key, "one");
        pipeline.run_announce_flow(&r1, None, None);
        tokio::time::sleep(Duration::from_millis(250)).await;

        let r2 = run("terminal:alice", "second", SubagentOutcome::Ok);
        seed_findings(&sessions, &r2.child_session_key, "two");
        pipeline.run_announce_flow(&r2, None, None);
        tokio::time::sleep(Duration::from_millis(250)).await;

        let triggers = gateway.triggers.lock().unwrap();
        assert_eq!(triggers.len(), 2);
        assert!(triggers[0].2.contains("\"first\""));
        assert!(triggers[1].2.contains("\"second\""));
    }

    #[tokio::test]
    async fn failed_runs_announce_with_the_error_embedded() {
        let tmp = TempDir::new().unwrap();
        let (pipeline, gateway, _) = pipeline(&tmp, 50);

        let r = run("terminal:alice", "doomed", SubagentOutcome::Error);
        pipeline.run_announce_flow(&r, Some("model unreachable"), None);
        tokio::time::sleep(Duration::from_millis(250)).await;

        let triggers = gateway.triggers.lock().unwrap();
        assert_eq!(triggers.len(), 1);
        assert!(triggers[0].2.contains("failed: model unreachable"));
        assert!(triggers[0].2.contains("(no findings reported)"));
    }

    #[tokio::test]
    async fn different_requesters_do_not_share_queues() {
        let tmp = TempDir::new().unwrap();
        let (pipeline, gateway, sessions) = pipeline(&tmp, 80);

        let ra = run("terminal:alice", "for-alice", SubagentOutcome::Ok);
        let rb = run("terminal:bob", "for-bob", SubagentOutcome::Ok);
        seed_findings(&sessions, &ra.child_session_key, "alice data");
        seed_findings(&sessions, &rb.child_session_key, "bob data");

        pipeline.run_announce_flow(&ra, None, None);
        pipeline.run_announce_flow(&rb, None, None);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let triggers = gateway.triggers.lock().unwrap();
        assert_eq!(triggers.len(), 2);
        let keys: Vec<&str> = triggers.iter().map(|t| t.0.as_str()).collect();
        assert!(keys.contains(&"terminal:alice"));
        assert!(keys.contains(&"terminal:bob"));
    }

    #[tokio::test]
    async fn done_callback_fires_after_the_trigger_resolves() {
        let tmp = TempDir::new().unwrap();
        let (pipeline, gateway, sessions) = pipeline(&tmp, 50);

        let r = run("terminal:alice", "hooked", SubagentOutcome::Ok);
        seed_findings(&sessions, &r.child_session_key, "data");

        let delivered = Arc::new(Mutex::new(None::<bool>));
        let hook: AnnounceDone = {
            let delivered = delivered.clone();
            Box::new(move |d: bool| *delivered.lock().unwrap() = Some(d))
        };
        pipeline.run_announce_flow(&r, None, Some(hook));

        // Nothing fires before the debounce window closes.
        assert!(delivered.lock().unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(*delivered.lock().unwrap(), Some(true));
        assert_eq!(gateway.triggers.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn done_callback_reports_failure_when_nothing_delivers() {
        let tmp = TempDir::new().unwrap();
        let sessions = Arc::new(SessionManager::open(tmp.path()).unwrap());
        // No gateway wired: the drain can only drop the announcement.
        let pipeline = Arc::new(AnnouncePipeline::with_debounce(
            sessions,
            Duration::from_millis(50),
        ));

        let r = run("terminal:alice", "orphaned", SubagentOutcome::Ok);
        let delivered = Arc::new(Mutex::new(None::<bool>));
        let hook: AnnounceDone = {
            let delivered = delivered.clone();
            Box::new(move |d: bool| *delivered.lock().unwrap() = Some(d))
        };
        pipeline.run_announce_flow(&r, None, Some(hook));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(*delivered.lock().unwrap(), Some(false));
    }

    #[test]
    fn status_phrases() {
        assert_eq!(
            status_phrase(Some(SubagentOutcome::Ok), None),
            "completed successfully"
        );
        assert_eq!(
            status_phrase(Some(SubagentOutcome::Error), Some("boom")),
            "failed: boom"
        );
        assert_eq!(
            status_phrase(Some(SubagentOutcome::Interrupted), None),
            "finished with unknown status"
        );
        assert_eq!(status_phrase(None, None), "finished with unknown status");
    }
}
