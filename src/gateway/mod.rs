//! The gateway — ingress → route → runner → egress, plus the re-entry
//! surface tools use to push messages and wake agents.
//!
//! One gateway owns all in-memory state: the runner cache, the followup
//! queue, the announce pipeline, and the wiring between channels, cron, and
//! background runs.

pub mod traits;

pub use traits::{GatewayRef, SpawnRequest, SubagentSpawner, TriggerOutcome};

use crate::agent::{
    compose_system_prompt, suppresses_delivery, AgentRunner, FollowupQueue, FollowupSink,
    PromptParams, RunSource, TurnObserver,
};
use crate::agents::{AgentConfig, AgentStore};
use crate::channels::{
    reply_to_from_session_key, Channel, ChannelRegistry, IncomingMessage, OutgoingMessage,
};
use crate::config::Config;
use crate::cron::{delivery_instructions, CronExecutor, CronJob, CronService};
use crate::providers::{ClientFactory, ModelClient, ProviderRegistry};
use crate::routing::{BindingStore, PeerMatch, RouteInput};
use crate::session::{SessionEntry, SessionManager, TranscriptEntry};
use crate::subagents::{
    AnnounceDone, AnnouncePipeline, CleanupMode, RegisterParams, SubagentOutcome,
    SubagentRegistry, SubagentRun, SUBAGENT_KEY_PREFIX,
};
use crate::tools::{control_plane_tools, ToolContext, ToolRegistry};

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tokio::sync::mpsc;

/// Sender name used when a trigger re-enters the processing path.
const ANNOUNCE_SENDER: &str = "subagent-announce";
const CRON_CHANNEL: &str = "cron";

pub struct Gateway {
    config: Config,
    sessions: Arc<SessionManager>,
    agents: Arc<AgentStore>,
    providers: Arc<ProviderRegistry>,
    clients: Arc<dyn ClientFactory>,
    bindings: Arc<BindingStore>,
    channels: Arc<ChannelRegistry>,
    cron: Arc<CronService>,
    subagents: Arc<SubagentRegistry>,
    announce: Arc<AnnouncePipeline>,
    followups: Arc<FollowupQueue>,
    runners: Mutex<HashMap<String, Arc<AgentRunner>>>,
    tools: OnceLock<ToolRegistry>,
    self_ref: OnceLock<Weak<Gateway>>,
}

impl Gateway {
    /// Build the gateway and wire every capability that needs a handle back
    /// into it (tools, announce pipeline, followup sink, cron executor).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        sessions: Arc<SessionManager>,
        agents: Arc<AgentStore>,
        providers: Arc<ProviderRegistry>,
        clients: Arc<dyn ClientFactory>,
        bindings: Arc<BindingStore>,
        channels: Arc<ChannelRegistry>,
        cron: Arc<CronService>,
        subagents: Arc<SubagentRegistry>,
        announce: Arc<AnnouncePipeline>,
        followups: Arc<FollowupQueue>,
    ) -> Arc<Self> {
        let gateway = Arc::new(Self {
            config,
            sessions,
            agents,
            providers,
            clients,
            bindings,
            channels,
            cron: cron.clone(),
            subagents,
            announce: announce.clone(),
            followups: followups.clone(),
            runners: Mutex::new(HashMap::new()),
            tools: OnceLock::new(),
            self_ref: OnceLock::new(),
        });

        let _ = gateway.self_ref.set(Arc::downgrade(&gateway));
        let _ = gateway.tools.set(control_plane_tools(
            gateway.clone(),
            gateway.clone(),
            cron.clone(),
        ));
        announce.set_gateway(gateway.clone());
        followups.set_sink(gateway.clone());
        cron.set_executor(gateway.clone());

        gateway
    }

    /// Run the daemon: start channels, cron timers, the sweeper, announce
    /// any runs interrupted by the last shutdown, then pump ingress until
    /// every channel closes.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let (ingress_tx, mut ingress_rx) = mpsc::channel::<IncomingMessage>(64);

        self.channels.start_all(ingress_tx);
        self.cron.start();
        let _sweeper = self.subagents.start_sweeper();

        for run in self.subagents.take_interrupted() {
            tracing::info!(run_id = %run.run_id, "announcing run interrupted by restart");
            let hook = self.cleanup_hook(&run.run_id);
            self.announce
                .run_announce_flow(&run, Some("interrupted by restart"), Some(hook));
        }

        tracing::info!(channels = ?self.channels.names(), "gateway ready");

        while let Some(message) = ingress_rx.recv().await {
            let gateway = Arc::clone(self);
            tokio::spawn(async move {
                gateway.handle_incoming(message).await;
            });
        }
        Ok(())
    }

    /// Ingress entry point: steer into a live runner, or process fresh.
    pub async fn handle_incoming(self: &Arc<Self>, message: IncomingMessage) {
        let active = self
            .cached_runner(&message.session_key)
            .is_some_and(|r| r.is_active());

        if active {
            if let Err(e) = self
                .followups
                .enqueue(&message.session_key, &message.text)
                .await
            {
                tracing::warn!(session_key = %message.session_key, error = %e, "followup enqueue failed");
            }
            return;
        }

        if let Err(e) = self.process_message(message.clone()).await {
            tracing::error!(session_key = %message.session_key, error = %e, "message processing failed");
            if let Some(channel) = self.channels.get(&message.channel) {
                let _ = channel
                    .send(&message.reply_to, &OutgoingMessage::text(format!("Error: {e}")))
                    .await;
            }
        }
    }

    /// The full pipeline for one inbound message.
    pub async fn process_message(self: &Arc<Self>, message: IncomingMessage) -> Result<()> {
        let source = if message.from == ANNOUNCE_SENDER {
            RunSource::SubagentAnnounce
        } else {
            RunSource::User
        };

        let agent = self.resolve_agent(&message);
        let session = self.sessions.get_or_create(
            &message.session_key,
            &agent.agent_id,
            Some(&message.channel),
        )?;

        let runner = self.runner_for(&session, &agent)?;
        runner.set_tool_context(ToolContext {
            session_key: message.session_key.clone(),
            channel: message.channel.clone(),
            to: message.reply_to.clone(),
            agent_id: agent.agent_id.clone(),
        });

        let channel = self.channels.get(&message.channel);
        if let Some(channel) = &channel {
            let _ = channel.send_typing(&message.reply_to).await;
        }

        let observer = ChannelStreamObserver {
            channel: channel.clone(),
            reply_to: message.reply_to.clone(),
        };
        let reply = runner.run(&message.text, source, &observer).await?;

        if suppresses_delivery(&reply) {
            tracing::debug!(session_key = %message.session_key, %reply, "final delivery suppressed");
            return Ok(());
        }
        if let Some(channel) = &channel {
            channel
                .send(&message.reply_to, &OutgoingMessage::text(reply))
                .await
                .context("channel send failed")?;
        }
        Ok(())
    }

    // ── Routing and runner cache ─────────────────────────────────

    fn resolve_agent(&self, message: &IncomingMessage) -> AgentConfig {
        let default_agent = self.agents.default_agent();
        let input = RouteInput {
            channel: message.channel.clone(),
            account_id: None,
            peer: Some(PeerMatch {
                kind: "dm".into(),
                id: message.from.clone(),
            }),
            guild_id: None,
            team_id: None,
        };
        let resolution = self.bindings.resolve(&input, &default_agent.agent_id);
        tracing::debug!(
            session_key = %message.session_key,
            agent_id = %resolution.agent_id,
            matched_by = ?resolution.matched_by,
            "route resolved"
        );
        // A binding may point at a deleted agent; fall back to the default.
        self.agents
            .get(&resolution.agent_id)
            .unwrap_or(default_agent)
    }

    fn cached_runner(&self, session_key: &str) -> Option<Arc<AgentRunner>> {
        self.lock_runners().get(session_key).cloned()
    }

    /// The runner bound to this session, building one when the cache has
    /// none. A cached runner whose session was deleted externally is
    /// dropped and replaced.
    fn runner_for(&self, session: &SessionEntry, agent: &AgentConfig) -> Result<Arc<AgentRunner>> {
        {
            let mut runners = self.lock_runners();
            if let Some(runner) = runners.get(&session.session_key) {
                let stale = runner.bound_session().as_deref() != Some(session.session_id.as_str())
                    || self.sessions.get(&session.session_id).is_none();
                if stale {
                    tracing::debug!(session_key = %session.session_key, "evicting stale runner");
                    runners.remove(&session.session_key);
                } else {
                    return Ok(runner.clone());
                }
            }
        }

        let runner = self.build_runner(&session.session_key, &session.session_id, agent, None)?;
        self.lock_runners()
            .insert(session.session_key.clone(), runner.clone());
        Ok(runner)
    }

    fn build_runner(
        &self,
        session_key: &str,
        session_id: &str,
        agent: &AgentConfig,
        extra_prompt: Option<&str>,
    ) -> Result<Arc<AgentRunner>> {
        let client = self.client_for(agent)?;
        let skills = crate::skills::discover(&self.config.workspace_dir);
        let prompt = compose_system_prompt(&PromptParams {
            agent_prompt: agent.system_prompt.as_deref(),
            skills: &skills,
            extra: extra_prompt,
        });

        let tools = self
            .tools
            .get()
            .ok_or_else(|| anyhow::anyhow!("gateway tools not wired"))?
            .clone();

        let runner = Arc::new(AgentRunner::new(
            session_key,
            prompt,
            self.sessions.clone(),
            client,
            tools,
            session_key.starts_with(SUBAGENT_KEY_PREFIX),
        ));
        runner.bind_session(session_id);
        Ok(runner)
    }

    fn client_for(&self, agent: &AgentConfig) -> Result<Arc<dyn ModelClient>> {
        let provider = self.providers.resolve_model(&agent.model).ok_or_else(|| {
            anyhow::anyhow!(
                "no provider configured for model '{}' and no default provider set",
                agent.model
            )
        })?;
        Ok(self
            .clients
            .client_for(&provider, &agent.model, agent.base_url.as_deref()))
    }

    fn lock_runners(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AgentRunner>>> {
        self.runners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn upgrade(&self) -> Result<Arc<Gateway>> {
        self.self_ref
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| anyhow::anyhow!("gateway is shutting down"))
    }

    // ── Background-run execution ─────────────────────────────────

    async fn execute_subagent(self: Arc<Self>, run: SubagentRun, agent_id: String) {
        if let Err(e) = self.subagents.mark_started(&run.run_id) {
            tracing::warn!(run_id = %run.run_id, error = %e, "mark_started failed");
        }

        let result = self.run_subagent_turn(&run, &agent_id).await;
        let (outcome, error) = match &result {
            Ok(_) => (SubagentOutcome::Ok, None),
            Err(e) => (SubagentOutcome::Error, Some(e.to_string())),
        };

        let completed = match self.subagents.mark_completed(&run.run_id, outcome) {
            Ok(completed) => completed,
            Err(e) => {
                tracing::error!(run_id = %run.run_id, error = %e, "mark_completed failed");
                return;
            }
        };

        // Cleanup waits for the announce drain; the hook reports whether the
        // trigger actually delivered.
        let hook = self.cleanup_hook(&run.run_id);
        self.announce
            .run_announce_flow(&completed, error.as_deref(), Some(hook));
    }

    /// A completion hook for the announce pipeline that applies this run's
    /// cleanup policy once delivery is resolved.
    fn cleanup_hook(self: &Arc<Self>, run_id: &str) -> AnnounceDone {
        let gateway = Arc::clone(self);
        let run_id = run_id.to_string();
        Box::new(move |did_announce| {
            gateway.finish_subagent_cleanup(&run_id, did_announce);
        })
    }

    /// Archive the registry record and, when the policy says delete and the
    /// announce went through, remove the child session.
    fn finish_subagent_cleanup(&self, run_id: &str, did_announce: bool) {
        match self.subagents.finalize_cleanup(run_id, did_announce) {
            Ok(Some(child_key)) => {
                self.lock_runners().remove(&child_key);
                if let Some(child) = self.sessions.find_by_key(&child_key) {
                    if let Err(e) = self.sessions.delete(&child.session_id) {
                        tracing::warn!(child = %child_key, error = %e, "child session delete failed");
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(run_id, error = %e, "cleanup failed");
            }
        }
    }

    async fn run_subagent_turn(&self, run: &SubagentRun, agent_id: &str) -> Result<String> {
        let agent = self.resolve_agent_by_id(Some(agent_id));
        let session = self.sessions.get_or_create(
            &run.child_session_key,
            &agent.agent_id,
            Some("subagent"),
        )?;
        self.sessions
            .set_subject(&session.session_id, &run.display_label())?;

        let briefing = format!(
            "You are completing a background task spawned from another \
             conversation. Work autonomously; nobody will answer questions. \
             Your final message is reported back to the requester, so end with \
             a clear statement of your findings.\nRequester: {}",
            run.requester_session_key
        );
        let runner =
            self.build_runner(&run.child_session_key, &session.session_id, &agent, Some(&briefing))?;
        runner.set_tool_context(ToolContext {
            session_key: run.child_session_key.clone(),
            channel: run.requester_channel.clone(),
            to: reply_to_from_session_key(&run.requester_channel, &run.requester_session_key)
                .to_string(),
            agent_id: agent.agent_id.clone(),
        });

        self.lock_runners()
            .insert(run.child_session_key.clone(), runner.clone());
        let result = runner
            .run(&run.task, RunSource::User, &crate::agent::NullTurnObserver)
            .await;
        self.lock_runners().remove(&run.child_session_key);
        result
    }

    fn resolve_agent_by_id(&self, agent_id: Option<&str>) -> AgentConfig {
        agent_id
            .and_then(|id| self.agents.get(id))
            .unwrap_or_else(|| self.agents.default_agent())
    }
}

// ── Capability implementations ───────────────────────────────────

#[async_trait]
impl GatewayRef for Gateway {
    async fn send_to_session(
        &self,
        session_key: &str,
        channel: &str,
        text: &str,
    ) -> Result<()> {
        // Deliveries may target a conversation that has not spoken yet
        // (e.g. a cron result to a configured recipient).
        let default_agent = self.agents.default_agent().agent_id;
        let session = self
            .sessions
            .get_or_create(session_key, &default_agent, Some(channel))?;

        self.sessions
            .append(&session.session_id, &TranscriptEntry::assistant(text))?;

        if let Some(adapter) = self.channels.get(channel) {
            adapter
                .send(
                    reply_to_from_session_key(channel, session_key),
                    &OutgoingMessage::text(text),
                )
                .await?;
        } else {
            tracing::debug!(channel, "no adapter for channel; transcript-only delivery");
        }
        Ok(())
    }

    async fn trigger_agent(
        &self,
        session_key: &str,
        channel: &str,
        message: &str,
    ) -> Result<TriggerOutcome> {
        if let Some(runner) = self.cached_runner(session_key) {
            if runner.is_active() {
                runner.inject(message);
                return Ok(TriggerOutcome::Steered);
            }
        }

        let gateway = self.upgrade()?;
        let incoming = IncomingMessage {
            channel: channel.to_string(),
            from: ANNOUNCE_SENDER.to_string(),
            text: message.to_string(),
            session_key: session_key.to_string(),
            reply_to: reply_to_from_session_key(channel, session_key).to_string(),
            timestamp: chrono::Utc::now(),
        };
        match gateway.process_message(incoming).await {
            Ok(()) => Ok(TriggerOutcome::Invoked),
            Err(e) => {
                tracing::warn!(session_key, error = %e, "trigger invocation failed");
                Ok(TriggerOutcome::Failed)
            }
        }
    }
}

#[async_trait]
impl FollowupSink for Gateway {
    async fn steer(&self, session_key: &str, text: &str) -> Result<()> {
        if let Some(runner) = self.cached_runner(session_key) {
            if runner.is_active() {
                runner.inject(text);
                return Ok(());
            }
        }

        // Runner went idle between enqueue and steer: route as a fresh
        // message on the session's own channel.
        let session = self
            .sessions
            .find_by_key(session_key)
            .ok_or_else(|| anyhow::anyhow!("no session for key {session_key}"))?;
        let channel = session.channel.clone().unwrap_or_default();
        let reply_to = reply_to_from_session_key(&channel, session_key).to_string();

        let gateway = self.upgrade()?;
        gateway
            .process_message(IncomingMessage {
                channel,
                from: reply_to.clone(),
                text: text.to_string(),
                session_key: session_key.to_string(),
                reply_to,
                timestamp: chrono::Utc::now(),
            })
            .await
    }
}

#[async_trait]
impl SubagentSpawner for Gateway {
    async fn spawn(&self, request: SpawnRequest) -> Result<String> {
        let run = self.subagents.register(RegisterParams {
            requester_session_key: request.requester_session_key.clone(),
            requester_channel: request.requester_channel.clone(),
            task: request.task.clone(),
            label: request.label.clone(),
            cleanup: if request.keep_transcript {
                CleanupMode::Keep
            } else {
                CleanupMode::Delete
            },
        })?;

        let gateway = self.upgrade()?;
        let run_id = run.run_id.clone();
        let agent_id = request.agent_id;
        tokio::spawn(async move {
            gateway.execute_subagent(run, agent_id).await;
        });
        Ok(run_id)
    }
}

#[async_trait]
impl CronExecutor for Gateway {
    async fn execute(&self, job: &CronJob) -> Result<String> {
        let session_key = format!("{CRON_CHANNEL}:{}", job.job_id);

        // Every fire gets a fresh ephemeral session and a fresh runner.
        self.lock_runners().remove(&session_key);
        if let Some(existing) = self.sessions.find_by_key(&session_key) {
            self.sessions.delete(&existing.session_id)?;
        }

        let agent = self.resolve_agent_by_id(job.agent_id.as_deref());
        let session =
            self.sessions
                .get_or_create(&session_key, &agent.agent_id, Some(CRON_CHANNEL))?;
        self.sessions
            .set_subject(&session.session_id, &job.session_title())?;

        let contract = delivery_instructions(&job.delivery);
        let runner =
            self.build_runner(&session_key, &session.session_id, &agent, Some(&contract))?;
        runner.set_tool_context(ToolContext {
            session_key: session_key.clone(),
            channel: job
                .delivery
                .channel
                .clone()
                .unwrap_or_else(|| CRON_CHANNEL.to_string()),
            to: job.delivery.to.clone().unwrap_or_default(),
            agent_id: agent.agent_id.clone(),
        });

        runner
            .run(&job.message, RunSource::Cron, &crate::agent::NullTurnObserver)
            .await
    }
}

/// Forwards runner stream events to the originating channel.
struct ChannelStreamObserver {
    channel: Option<Arc<dyn Channel>>,
    reply_to: String,
}

impl TurnObserver for ChannelStreamObserver {
    fn on_chunk(&self, text: &str) {
        if let Some(channel) = &self.channel {
            let channel = channel.clone();
            let reply_to = self.reply_to.clone();
            let text = text.to_string();
            tokio::spawn(async move {
                let _ = channel.send_chunk(&reply_to, &text).await;
            });
        }
    }

    fn on_tool_call(&self, name: &str, input: &serde_json::Value) {
        if let Some(channel) = &self.channel {
            let channel = channel.clone();
            let reply_to = self.reply_to.clone();
            let name = name.to_string();
            let input = input.clone();
            tokio::spawn(async move {
                let _ = channel.send_tool_call(&reply_to, &name, &input).await;
            });
        }
    }

    fn on_tool_result(&self, name: &str, result: &str) {
        if let Some(channel) = &self.channel {
            let channel = channel.clone();
            let reply_to = self.reply_to.clone();
            let name = name.to_string();
            let summary = crate::util::truncate_with_ellipsis(result, 200);
            tokio::spawn(async move {
                let _ = channel.send_tool_result(&reply_to, &name, &summary).await;
            });
        }
    }
}
