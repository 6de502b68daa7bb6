//! The agent runner — one bounded tool-calling loop per session, with
//! mid-flight injection.

use super::TurnObserver;
use crate::providers::{Cancelled, ChatObserver, ModelClient};
use crate::session::{SessionManager, TranscriptEntry};
use crate::tools::{Tool, ToolContext, ToolRegistry};

use anyhow::Result;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Hard bound on loop iterations per run, shared between the main phase and
/// the injected-message drain.
const MAX_ITERATIONS: usize = 10;
/// How many consecutive empty model responses to retry before giving up.
const EMPTY_RETRY_LIMIT: usize = 2;

/// A whole-reply sentinel: the agent delivered through a send tool and wants
/// no final message pushed.
pub const NO_REPLY: &str = "NO_REPLY";
/// Fallback reply when the loop ended with nothing to say.
pub const DONE_SENTINEL: &str = "(done)";
/// Reply produced by an aborted run.
pub const ABORTED_SENTINEL: &str = "(aborted)";

const INTERRUPT_PREFIX: &str = "[INTERRUPT] New message from user: ";

/// Where a run's input came from. Each source frames the text differently so
/// the model can tell spontaneous firings from user turns; all three land as
/// user-role entries to keep the alternation constraint intact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunSource {
    User,
    Cron,
    SubagentAnnounce,
}

pub fn frame_input(source: RunSource, text: &str) -> String {
    match source {
        RunSource::User => text.to_string(),
        RunSource::Cron => format!(
            "[SCHEDULED TASK] Execute the following scheduled task and send the \
             result to the user: {text}"
        ),
        RunSource::SubagentAnnounce => format!("[SUBAGENT RESULT] {text}"),
    }
}

/// True when a final reply must not be pushed to the channel.
pub fn suppresses_delivery(reply: &str) -> bool {
    reply == NO_REPLY || reply == DONE_SENTINEL || reply == ABORTED_SENTINEL
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Adapts the model-stream callbacks onto the turn observer.
struct StreamBridge<'a>(&'a dyn TurnObserver);

impl ChatObserver for StreamBridge<'_> {
    fn on_chunk(&self, text: &str) {
        self.0.on_chunk(text);
    }

    fn on_tool_call(&self, name: &str, input: &serde_json::Value) {
        self.0.on_tool_call(name, input);
    }
}

pub struct AgentRunner {
    session_key: String,
    is_subagent: bool,
    system_prompt: String,
    sessions: Arc<SessionManager>,
    client: Arc<dyn ModelClient>,
    tools: ToolRegistry,
    session_id: Mutex<Option<String>>,
    tool_context: Mutex<ToolContext>,
    conversation: tokio::sync::Mutex<Vec<TranscriptEntry>>,
    injected: Mutex<VecDeque<String>>,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

impl AgentRunner {
    pub fn new(
        session_key: &str,
        system_prompt: String,
        sessions: Arc<SessionManager>,
        client: Arc<dyn ModelClient>,
        tools: ToolRegistry,
        is_subagent: bool,
    ) -> Self {
        Self {
            session_key: session_key.to_string(),
            is_subagent,
            system_prompt,
            sessions,
            client,
            tools,
            session_id: Mutex::new(None),
            tool_context: Mutex::new(ToolContext::default()),
            conversation: tokio::sync::Mutex::new(Vec::new()),
            injected: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    pub fn bind_session(&self, session_id: &str) {
        *self.lock(&self.session_id) = Some(session_id.to_string());
    }

    pub fn bound_session(&self) -> Option<String> {
        self.lock(&self.session_id).clone()
    }

    pub fn set_tool_context(&self, ctx: ToolContext) {
        *self.lock(&self.tool_context) = ctx;
    }

    /// Queue a message for the running loop; the next model call sees it as
    /// the final user entry.
    pub fn inject(&self, text: &str) {
        tracing::debug!(session_key = %self.session_key, "injecting mid-run message");
        self.lock(&self.injected).push_back(text.to_string());
    }

    pub fn is_active(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the in-flight model call and all later iterations.
    pub fn abort(&self) {
        self.lock(&self.cancel).cancel();
    }

    /// Execute one turn. Returns the final reply text, which may be a
    /// sentinel (`NO_REPLY`, `(done)`, `(aborted)`).
    pub async fn run(
        &self,
        input: &str,
        source: RunSource,
        observer: &dyn TurnObserver,
    ) -> Result<String> {
        if self.running.swap(true, Ordering::SeqCst) {
            anyhow::bail!("runner already active for {}", self.session_key);
        }
        let _guard = RunningGuard(&self.running);

        let cancel = CancellationToken::new();
        *self.lock(&self.cancel) = cancel.clone();

        let session_id = self
            .bound_session()
            .ok_or_else(|| anyhow::anyhow!("runner has no bound session"))?;

        let mut conversation = self.conversation.lock().await;
        self.sync_from_transcript(&session_id, &mut conversation);

        if conversation.is_empty() {
            self.record(
                &session_id,
                &mut conversation,
                TranscriptEntry::system(self.system_prompt.clone()),
            );
        }

        self.record(
            &session_id,
            &mut conversation,
            TranscriptEntry::user(frame_input(source, input)),
        );

        let specs = self.tools.specs_for(self.is_subagent);
        let bridge = StreamBridge(observer);

        let mut final_response = String::new();
        let mut empty_retries = 0usize;

        for _iteration in 0..MAX_ITERATIONS {
            if cancel.is_cancelled() {
                return Ok(ABORTED_SENTINEL.to_string());
            }

            // Tools that push on side channels may have appended entries the
            // in-memory view has not seen yet.
            self.sync_from_transcript(&session_id, &mut conversation);

            if let Some(text) = self.lock(&self.injected).pop_front() {
                self.record(
                    &session_id,
                    &mut conversation,
                    TranscriptEntry::user(format!("{INTERRUPT_PREFIX}{text}")),
                );
            }

            let outcome = match self.client.chat(&conversation, &specs, &bridge, &cancel).await {
                Ok(outcome) => outcome,
                Err(e) if e.is::<Cancelled>() => {
                    return Ok(ABORTED_SENTINEL.to_string());
                }
                Err(e) => {
                    tracing::warn!(session_key = %self.session_key, error = %e, "model call failed");
                    let message = format!("Error: {e}");
                    self.record(
                        &session_id,
                        &mut conversation,
                        TranscriptEntry::assistant(message.clone()),
                    );
                    return Ok(message);
                }
            };

            if !outcome.tool_calls.is_empty() {
                empty_retries = 0;
                self.record(
                    &session_id,
                    &mut conversation,
                    TranscriptEntry::assistant_with_tool_calls(
                        outcome.content.clone(),
                        outcome.tool_calls.clone(),
                    ),
                );

                for call in &outcome.tool_calls {
                    let result = self.execute_tool(&call.name, &call.arguments).await;
                    observer.on_tool_result(&call.name, &result);
                    self.record(
                        &session_id,
                        &mut conversation,
                        TranscriptEntry::tool_result(call.id.clone(), result),
                    );
                }
                continue;
            }

            if !outcome.content.trim().is_empty() {
                empty_retries = 0;
                self.record(
                    &session_id,
                    &mut conversation,
                    TranscriptEntry::assistant(outcome.content.clone()),
                );
                final_response = outcome.content;

                if self.lock(&self.injected).is_empty() {
                    break;
                }
                continue;
            }

            // Empty response: keep going while injected input is pending,
            // otherwise retry a bounded number of times.
            if !self.lock(&self.injected).is_empty() {
                continue;
            }
            empty_retries += 1;
            if empty_retries > EMPTY_RETRY_LIMIT {
                break;
            }
        }

        if final_response.is_empty() {
            final_response = DONE_SENTINEL.to_string();
        }
        Ok(final_response)
    }

    // ── Internal helpers ─────────────────────────────────────────

    async fn execute_tool(&self, name: &str, raw_arguments: &str) -> String {
        let Some(tool) = self.tools_for_role().get(name) else {
            return format!("Error: Unknown tool {name}");
        };
        let args: serde_json::Value = serde_json::from_str(raw_arguments)
            .unwrap_or(serde_json::Value::Object(Default::default()));
        let ctx = self.lock(&self.tool_context).clone();

        match tool.execute(args, &ctx).await {
            Ok(result) => result,
            Err(e) => format!("Error: {e}"),
        }
    }

    fn tools_for_role(&self) -> ToolRegistry {
        if self.is_subagent {
            self.tools.without_spawn()
        } else {
            self.tools.clone()
        }
    }

    /// Re-read the transcript when it grew behind our back. Tools that push
    /// on side channels append their own entries, and those may interleave
    /// ahead of the runner's; the on-disk order is the truth the next model
    /// call must see. A transcript that shrank (session deleted externally)
    /// leaves the in-memory view untouched; the turn finishes against what
    /// it has.
    fn sync_from_transcript(&self, session_id: &str, conversation: &mut Vec<TranscriptEntry>) {
        match self.sessions.load_transcript(session_id) {
            Ok(on_disk) => {
                if on_disk.len() > conversation.len() {
                    *conversation = on_disk;
                }
            }
            Err(e) => {
                tracing::warn!(session_id, error = %e, "transcript sync failed");
            }
        }
    }

    /// Append to the transcript and mirror into the in-memory view. Failed
    /// appends (e.g. the session was deleted mid-turn) are logged and the
    /// run continues against memory.
    fn record(
        &self,
        session_id: &str,
        conversation: &mut Vec<TranscriptEntry>,
        entry: TranscriptEntry,
    ) {
        if let Err(e) = self.sessions.append(session_id, &entry) {
            tracing::warn!(session_id, error = %e, "transcript append failed");
        }
        conversation.push(entry);
    }

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::NullTurnObserver;
    use crate::providers::{ChatOutcome, FinishReason};
    use crate::session::{Role, ToolCall};
    use crate::tools::{Tool, ToolSpec};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    /// Model double that pops scripted outcomes.
    struct ScriptedClient {
        script: Mutex<VecDeque<ChatOutcome>>,
        seen: Mutex<Vec<Vec<TranscriptEntry>>>,
    }

    impl ScriptedClient {
        fn new(outcomes: Vec<ChatOutcome>) -> Self {
            Self {
                script: Mutex::new(outcomes.into()),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn text(content: &str) -> ChatOutcome {
            ChatOutcome {
                content: content.into(),
                tool_calls: vec![],
                finish_reason: FinishReason::Stop,
            }
        }

        fn tool(name: &str, args: &str) -> ChatOutcome {
            ChatOutcome {
                content: String::new(),
                tool_calls: vec![ToolCall {
                    id: format!("call-{name}"),
                    name: name.into(),
                    arguments: args.into(),
                }],
                finish_reason: FinishReason::ToolUse,
            }
        }

        fn empty() -> ChatOutcome {
            ChatOutcome {
                content: String::new(),
                tool_calls: vec![],
                finish_reason: FinishReason::Stop,
            }
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedClient {
        async fn chat(
            &self,
            messages: &[TranscriptEntry],
            _tools: &[ToolSpec],
            _observer: &dyn ChatObserver,
            _cancel: &CancellationToken,
        ) -> Result<ChatOutcome> {
            self.seen.lock().unwrap().push(messages.to_vec());
            Ok(self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(ScriptedClient::empty))
        }
    }

    struct ListFilesTool;

    #[async_trait]
    impl Tool for ListFilesTool {
        fn name(&self) -> &str {
            "bash"
        }
        fn description(&self) -> &str {
            "run a command"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type":"object"})
        }
        async fn execute(
            &self,
            _args: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<String> {
            Ok("a.txt\nb.txt\n".into())
        }
    }

    struct SlowTool {
        entered: Arc<tokio::sync::Notify>,
        release: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "takes a while"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type":"object"})
        }
        async fn execute(
            &self,
            _args: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<String> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok("slow done".into())
        }
    }

    fn runner_with(
        tmp: &TempDir,
        client: Arc<dyn ModelClient>,
        tools: ToolRegistry,
        is_subagent: bool,
    ) -> (Arc<AgentRunner>, Arc<SessionManager>, String) {
        let sessions = Arc::new(SessionManager::open(tmp.path()).unwrap());
        let session = sessions.get_or_create("test:peer", "default", None).unwrap();
        let runner = Arc::new(AgentRunner::new(
            "test:peer",
            "system prompt".into(),
            sessions.clone(),
            client,
            tools,
            is_subagent,
        ));
        runner.bind_session(&session.session_id);
        (runner, sessions, session.session_id)
    }

    #[tokio::test]
    async fn echo_turn_writes_system_user_assistant() {
        let tmp = TempDir::new().unwrap();
        let client = Arc::new(ScriptedClient::new(vec![ScriptedClient::text("pong")]));
        let (runner, sessions, session_id) =
            runner_with(&tmp, client, ToolRegistry::new(vec![]), false);

        let reply = runner
            .run("ping", RunSource::User, &NullTurnObserver)
            .await
            .unwrap();
        assert_eq!(reply, "pong");

        let transcript = sessions.load_transcript(&session_id).unwrap();
        let roles: Vec<Role> = transcript.iter().map(|e| e.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
        assert_eq!(transcript[1].content, "ping");
        assert_eq!(transcript[2].content, "pong");
    }

    #[tokio::test]
    async fn tool_then_text_produces_five_entries() {
        let tmp = TempDir::new().unwrap();
        let client = Arc::new(ScriptedClient::new(vec![
            ScriptedClient::tool("bash", r#"{"command":"ls"}"#),
            ScriptedClient::text("There are two files: a.txt and b.txt."),
        ]));
        let tools = ToolRegistry::new(vec![Arc::new(ListFilesTool)]);
        let (runner, sessions, session_id) = runner_with(&tmp, client, tools, false);

        let reply = runner
            .run("list files", RunSource::User, &NullTurnObserver)
            .await
            .unwrap();
        assert_eq!(reply, "There are two files: a.txt and b.txt.");

        let transcript = sessions.load_transcript(&session_id).unwrap();
        let roles: Vec<Role> = transcript.iter().map(|e| e.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::Tool, Role::Assistant]
        );
        assert_eq!(transcript[2].tool_calls.as_ref().unwrap()[0].name, "bash");
        assert_eq!(transcript[3].content, "a.txt\nb.txt\n");
        assert_eq!(transcript[3].tool_call_id.as_deref(), Some("call-bash"));
    }

    #[tokio::test]
    async fn unknown_tool_yields_error_result_and_continues() {
        let tmp = TempDir::new().unwrap();
        let client = Arc::new(ScriptedClient::new(vec![
            ScriptedClient::tool("missing", "{}"),
            ScriptedClient::text("recovered"),
        ]));
        let (runner, sessions, session_id) =
            runner_with(&tmp, client, ToolRegistry::new(vec![]), false);

        let reply = runner
            .run("go", RunSource::User, &NullTurnObserver)
            .await
            .unwrap();
        assert_eq!(reply, "recovered");

        let transcript = sessions.load_transcript(&session_id).unwrap();
        let tool_entry = transcript.iter().find(|e| e.role == Role::Tool).unwrap();
        assert_eq!(tool_entry.content, "Error: Unknown tool missing");
    }

    #[tokio::test]
    async fn loop_is_bounded_at_ten_iterations() {
        let tmp = TempDir::new().unwrap();
        // A model that always wants another tool call.
        let outcomes: Vec<ChatOutcome> = (0..50)
            .map(|_| ScriptedClient::tool("bash", "{}"))
            .collect();
        let client = Arc::new(ScriptedClient::new(outcomes));
        let tools = ToolRegistry::new(vec![Arc::new(ListFilesTool)]);
        let (runner, _, _) = runner_with(&tmp, client.clone(), tools, false);

        let reply = runner
            .run("loop forever", RunSource::User, &NullTurnObserver)
            .await
            .unwrap();
        assert_eq!(reply, DONE_SENTINEL);
        assert!(client.seen.lock().unwrap().len() <= 10);
    }

    #[tokio::test]
    async fn empty_responses_retry_then_accept() {
        let tmp = TempDir::new().unwrap();
        let client = Arc::new(ScriptedClient::new(vec![
            ScriptedClient::empty(),
            ScriptedClient::empty(),
            ScriptedClient::empty(),
            // Would be used if the runner kept retrying.
            ScriptedClient::text("too late"),
        ]));
        let (runner, _, _) = runner_with(&tmp, client.clone(), ToolRegistry::new(vec![]), false);

        let reply = runner
            .run("anything", RunSource::User, &NullTurnObserver)
            .await
            .unwrap();
        assert_eq!(reply, DONE_SENTINEL);
        assert_eq!(client.seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn cron_and_announce_inputs_are_framed_as_user_entries() {
        let tmp = TempDir::new().unwrap();
        let client = Arc::new(ScriptedClient::new(vec![
            ScriptedClient::text("done"),
            ScriptedClient::text("summarised"),
        ]));
        let (runner, sessions, session_id) =
            runner_with(&tmp, client, ToolRegistry::new(vec![]), false);

        runner
            .run("water the plants", RunSource::Cron, &NullTurnObserver)
            .await
            .unwrap();
        runner
            .run("task finished", RunSource::SubagentAnnounce, &NullTurnObserver)
            .await
            .unwrap();

        let transcript = sessions.load_transcript(&session_id).unwrap();
        let users: Vec<&TranscriptEntry> =
            transcript.iter().filter(|e| e.role == Role::User).collect();
        assert!(users[0].content.starts_with("[SCHEDULED TASK] Execute the following"));
        assert!(users[0].content.ends_with("water the plants"));
        assert!(users[1].content.starts_with("[SUBAGENT RESULT] "));
    }

    #[tokio::test]
    async fn injected_message_reaches_the_next_model_call() {
        let tmp = TempDir::new().unwrap();

        let entered = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());
        let tools = ToolRegistry::new(vec![Arc::new(SlowTool {
            entered: entered.clone(),
            release: release.clone(),
        })]);

        let client = Arc::new(ScriptedClient::new(vec![
            ScriptedClient::tool("slow", "{}"),
            ScriptedClient::text("summary"),
        ]));
        let (runner, _, _) = runner_with(&tmp, client.clone(), tools, false);

        let run_handle = {
            let runner = runner.clone();
            tokio::spawn(async move {
                runner
                    .run("do a long task", RunSource::User, &NullTurnObserver)
                    .await
            })
        };

        // Inject while the tool call is in flight, then let it finish.
        entered.notified().await;
        assert!(runner.is_active());
        runner.inject("actually, cancel and just summarise");
        release.notify_one();

        let reply = run_handle.await.unwrap().unwrap();
        assert_eq!(reply, "summary");

        // The second model call must end with the interrupt entry.
        let seen = client.seen.lock().unwrap();
        let second_call = &seen[1];
        let last = second_call.last().unwrap();
        assert_eq!(last.role, Role::User);
        assert_eq!(
            last.content,
            format!("{INTERRUPT_PREFIX}actually, cancel and just summarise")
        );
        // The tool result from the in-flight call completed normally.
        assert!(second_call.iter().any(|e| e.role == Role::Tool && e.content == "slow done"));
    }

    #[tokio::test]
    async fn abort_returns_sentinel_without_new_entries() {
        let tmp = TempDir::new().unwrap();

        struct BlockingClient {
            started: Arc<tokio::sync::Notify>,
        }

        #[async_trait]
        impl ModelClient for BlockingClient {
            async fn chat(
                &self,
                _messages: &[TranscriptEntry],
                _tools: &[ToolSpec],
                _observer: &dyn ChatObserver,
                cancel: &CancellationToken,
            ) -> Result<ChatOutcome> {
                self.started.notify_one();
                cancel.cancelled().await;
                Err(anyhow::Error::new(Cancelled))
            }
        }

        let started = Arc::new(tokio::sync::Notify::new());
        let client = Arc::new(BlockingClient {
            started: started.clone(),
        });
        let (runner, sessions, session_id) =
            runner_with(&tmp, client, ToolRegistry::new(vec![]), false);

        let run_handle = {
            let runner = runner.clone();
            tokio::spawn(async move {
                runner.run("hang", RunSource::User, &NullTurnObserver).await
            })
        };

        started.notified().await;
        runner.abort();

        let reply = run_handle.await.unwrap().unwrap();
        assert_eq!(reply, ABORTED_SENTINEL);
        assert!(!runner.is_active());

        // Only the system prompt and user input made it to disk.
        let transcript = sessions.load_transcript(&session_id).unwrap();
        assert_eq!(transcript.len(), 2);
    }

    #[tokio::test]
    async fn model_error_surfaces_as_error_reply() {
        let tmp = TempDir::new().unwrap();

        struct FailingClient;

        #[async_trait]
        impl ModelClient for FailingClient {
            async fn chat(
                &self,
                _messages: &[TranscriptEntry],
                _tools: &[ToolSpec],
                _observer: &dyn ChatObserver,
                _cancel: &CancellationToken,
            ) -> Result<ChatOutcome> {
                anyhow::bail!("connection refused")
            }
        }

        let (runner, sessions, session_id) =
            runner_with(&tmp, Arc::new(FailingClient), ToolRegistry::new(vec![]), false);

        let reply = runner
            .run("hello", RunSource::User, &NullTurnObserver)
            .await
            .unwrap();
        assert!(reply.starts_with("Error: "));

        let transcript = sessions.load_transcript(&session_id).unwrap();
        assert_eq!(transcript.last().unwrap().content, reply);
    }

    #[tokio::test]
    async fn tool_failures_are_folded_into_results() {
        struct FailingTool;

        #[async_trait]
        impl Tool for FailingTool {
            fn name(&self) -> &str {
                "flaky"
            }
            fn description(&self) -> &str {
                "fails"
            }
            fn input_schema(&self) -> serde_json::Value {
                serde_json::json!({"type":"object"})
            }
            async fn execute(
                &self,
                _args: serde_json::Value,
                _ctx: &ToolContext,
            ) -> Result<String> {
                anyhow::bail!("disk full")
            }
        }

        let tmp = TempDir::new().unwrap();
        let client = Arc::new(ScriptedClient::new(vec![
            ScriptedClient::tool("flaky", "{}"),
            ScriptedClient::text("noted"),
        ]));
        let tools = ToolRegistry::new(vec![Arc::new(FailingTool)]);
        let (runner, sessions, session_id) = runner_with(&tmp, client, tools, false);

        let reply = runner
            .run("try it", RunSource::User, &NullTurnObserver)
            .await
            .unwrap();
        assert_eq!(reply, "noted");

        let transcript = sessions.load_transcript(&session_id).unwrap();
        let tool_entry = transcript.iter().find(|e| e.role == Role::Tool).unwrap();
        assert_eq!(tool_entry.content, "Error: disk full");
    }

    #[tokio::test]
    async fn subagent_runner_rejects_the_spawn_tool() {
        struct SpawnStandIn;

        #[async_trait]
        impl Tool for SpawnStandIn {
            fn name(&self) -> &str {
                crate::tools::SPAWN_TOOL_NAME
            }
            fn description(&self) -> &str {
                "spawn"
            }
            fn input_schema(&self) -> serde_json::Value {
                serde_json::json!({"type":"object"})
            }
            async fn execute(
                &self,
                _args: serde_json::Value,
                _ctx: &ToolContext,
            ) -> Result<String> {
                Ok("spawned".into())
            }
        }

        let tmp = TempDir::new().unwrap();
        let client = Arc::new(ScriptedClient::new(vec![
            ScriptedClient::tool(crate::tools::SPAWN_TOOL_NAME, "{}"),
            ScriptedClient::text("understood"),
        ]));
        let tools = ToolRegistry::new(vec![Arc::new(SpawnStandIn)]);
        let (runner, sessions, session_id) = runner_with(&tmp, client, tools, true);

        let reply = runner
            .run("fan out", RunSource::User, &NullTurnObserver)
            .await
            .unwrap();
        assert_eq!(reply, "understood");

        let transcript = sessions.load_transcript(&session_id).unwrap();
        let tool_entry = transcript.iter().find(|e| e.role == Role::Tool).unwrap();
        assert_eq!(
            tool_entry.content,
            format!("Error: Unknown tool {}", crate::tools::SPAWN_TOOL_NAME)
        );
    }

    #[tokio::test]
    async fn concurrent_run_attempts_are_rejected() {
        let tmp = TempDir::new().unwrap();

        struct StallClient(Arc<AtomicUsize>);

        #[async_trait]
        impl ModelClient for StallClient {
            async fn chat(
                &self,
                _messages: &[TranscriptEntry],
                _tools: &[ToolSpec],
                _observer: &dyn ChatObserver,
                _cancel: &CancellationToken,
            ) -> Result<ChatOutcome> {
                self.0.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                Ok(ChatOutcome {
                    content: "ok".into(),
                    tool_calls: vec![],
                    finish_reason: FinishReason::Stop,
                })
            }
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let (runner, _, _) = runner_with(
            &tmp,
            Arc::new(StallClient(calls.clone())),
            ToolRegistry::new(vec![]),
            false,
        );

        let first = {
            let runner = runner.clone();
            tokio::spawn(async move {
                runner.run("one", RunSource::User, &NullTurnObserver).await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let second = runner.run("two", RunSource::User, &NullTurnObserver).await;
        assert!(second.is_err());
        assert!(first.await.unwrap().is_ok());
    }

    #[test]
    fn sentinels_suppress_delivery() {
        assert!(suppresses_delivery(NO_REPLY));
        assert!(suppresses_delivery(DONE_SENTINEL));
        assert!(suppresses_delivery(ABORTED_SENTINEL));
        assert!(!suppresses_delivery("NO_REPLY extra"));
        assert!(!suppresses_delivery("hello"));
    }
}
