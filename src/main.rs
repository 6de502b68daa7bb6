use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

use crossbar::agent::{FollowupMode, FollowupQueue};
use crossbar::agents::AgentStore;
use crossbar::channels::ChannelRegistry;
use crossbar::config::Config;
use crossbar::cron::{CronJobOptions, CronService, CronStore, DeliveryConfig, Schedule};
use crossbar::gateway::Gateway;
use crossbar::providers::{HttpClientFactory, ProviderRegistry};
use crossbar::routing::BindingStore;
use crossbar::session::SessionManager;
use crossbar::subagents::{AnnouncePipeline, SubagentRegistry};

/// Multi-channel AI assistant control plane.
#[derive(Parser, Debug)]
#[command(name = "crossbar")]
#[command(version)]
#[command(about = "One process, many transports, bounded agent loops.", long_about = None)]
struct Cli {
    /// Path to config.toml (defaults to ~/.crossbar/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon: channels, cron, and the gateway
    Start,
    /// Inspect and manage conversations
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Manage scheduled jobs
    Cron {
        #[command(subcommand)]
        command: CronCommands,
    },
}

#[derive(Subcommand, Debug)]
enum SessionCommands {
    /// List sessions, most recent first
    List,
    /// Print one session's transcript
    Show { session_id: String },
    /// Delete a session and its transcript
    Delete { session_id: String },
}

#[derive(Subcommand, Debug)]
enum CronCommands {
    /// List scheduled jobs
    List,
    /// Add a job from a cron expression
    Add {
        /// Cron expression, e.g. "0 9 * * *"
        expression: String,
        /// Task text executed on each fire
        message: String,
        /// Optional job name
        #[arg(long)]
        name: Option<String>,
        /// Delivery channel (e.g. telegram)
        #[arg(long)]
        channel: Option<String>,
        /// Delivery recipient on that channel
        #[arg(long)]
        to: Option<String>,
    },
    /// Remove a job
    Remove { job_id: String },
    /// Enable a job
    Enable { job_id: String },
    /// Disable a job without deleting it
    Disable { job_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;

    match cli.command {
        Commands::Start => start(config).await,
        Commands::Session { command } => session_command(&config, command),
        Commands::Cron { command } => cron_command(&config, command).await,
    }
}

async fn start(config: Config) -> Result<()> {
    let sessions = Arc::new(SessionManager::open(&config.sessions_dir())?);
    let agents = Arc::new(AgentStore::open(&config.agents_path())?);
    let providers = Arc::new(ProviderRegistry::open(&config.providers_path())?);
    let bindings = Arc::new(BindingStore::open(&config.bindings_path())?);
    let channels = Arc::new(ChannelRegistry::from_config(&config.channels));
    let cron = Arc::new(CronService::new(CronStore::open(&config.cron_jobs_path())?));
    let subagents = Arc::new(SubagentRegistry::open(
        &config.subagent_runs_path(),
        config.subagents.archive_after_minutes,
    )?);
    let announce = Arc::new(AnnouncePipeline::new(sessions.clone()));
    let followups = Arc::new(FollowupQueue::new(FollowupMode::Steer));

    if providers.default_provider().is_none() {
        tracing::warn!(
            "no providers configured; add one to {} before sending messages",
            config.providers_path().display()
        );
    }

    let gateway = Gateway::new(
        config,
        sessions,
        agents,
        providers,
        Arc::new(HttpClientFactory),
        bindings,
        channels,
        cron,
        subagents,
        announce,
        followups,
    );
    gateway.run().await
}

fn session_command(config: &Config, command: SessionCommands) -> Result<()> {
    let sessions = SessionManager::open(&config.sessions_dir())?;
    match command {
        SessionCommands::List => {
            for entry in sessions.list() {
                println!(
                    "{}  {:24}  {:10}  {:4} msgs  {}",
                    entry.session_id,
                    entry.session_key,
                    entry.agent_id,
                    entry.message_count,
                    sessions.title(&entry)
                );
            }
            Ok(())
        }
        SessionCommands::Show { session_id } => {
            let transcript = sessions.load_transcript(&session_id)?;
            for entry in transcript {
                let role = serde_json::to_string(&entry.role)?;
                println!("[{}] {}", role.trim_matches('"'), entry.content);
            }
            Ok(())
        }
        SessionCommands::Delete { session_id } => {
            if sessions.delete(&session_id)? {
                println!("Deleted {session_id}");
            } else {
                println!("No such session: {session_id}");
            }
            Ok(())
        }
    }
}

async fn cron_command(config: &Config, command: CronCommands) -> Result<()> {
    let cron = Arc::new(CronService::new(CronStore::open(&config.cron_jobs_path())?));
    match command {
        CronCommands::List => {
            for job in cron.list() {
                let state = if job.enabled { "enabled" } else { "disabled" };
                println!(
                    "{}  [{}]  {}  last: {}",
                    job.job_id,
                    state,
                    job.session_title(),
                    job.last_status.as_deref().unwrap_or("never"),
                );
            }
            Ok(())
        }
        CronCommands::Add {
            expression,
            message,
            name,
            channel,
            to,
        } => {
            let job = cron
                .add(
                    Schedule::Cron { expr: expression },
                    &message,
                    CronJobOptions {
                        name,
                        agent_id: None,
                        delivery: DeliveryConfig { channel, to },
                        delete_after_run: false,
                    },
                )
                .context("adding cron job")?;
            println!("Added job {}", job.job_id);
            Ok(())
        }
        CronCommands::Remove { job_id } => {
            if cron.remove(&job_id)? {
                println!("Removed {job_id}");
            } else {
                println!("No such job: {job_id}");
            }
            Ok(())
        }
        CronCommands::Enable { job_id } => {
            cron.set_enabled(&job_id, true)?;
            println!("Enabled {job_id}");
            Ok(())
        }
        CronCommands::Disable { job_id } => {
            cron.set_enabled(&job_id, false)?;
            println!("Disabled {job_id}");
            Ok(())
        }
    }
}
