//! CLI command definitions for episode-forge.
//!
//! The CLI talks to the Redis job store: it enqueues episode creation jobs,
//! inspects their status and progress, and checks connectivity to the model
//! endpoint used by the planning agent.

use crate::agent::{AgentLoop, FnTool, ProviderModelCaller, ToolRegistry};
use crate::llm::{LiteLlmClient, Message};
use crate::orchestrator::{EpisodeJobPayload, OrchestratorConfig};
use crate::scheduler::{JobControl, JobKind, RedisJobStore, DEFAULT_KEY_PREFIX};
use crate::store::EpisodeRef;
use clap::Parser;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

/// Default Redis connection URL.
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Episode creation job orchestrator.
#[derive(Parser)]
#[command(name = "episode-forge")]
#[command(about = "Queue and inspect staged episode creation runs")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Enqueue an episode creation job.
    Enqueue(EnqueueArgs),

    /// Show a job's status, progress and result.
    Status(StatusArgs),

    /// Show the running episode creation job for an episode, if any.
    Running(RunningArgs),

    /// Print the orchestrator configuration resolved from the environment.
    Config,

    /// Run a one-tool agent loop against the model endpoint.
    Probe(ProbeArgs),
}

/// Redis connection options shared by queue commands.
#[derive(Parser, Debug, Clone)]
pub struct QueueArgs {
    /// Redis URL of the job store.
    #[arg(long, env = "REDIS_URL", default_value = DEFAULT_REDIS_URL)]
    pub redis_url: String,

    /// Key prefix of the job store.
    #[arg(long, env = "EPISODE_FORGE_KEY_PREFIX", default_value = DEFAULT_KEY_PREFIX)]
    pub key_prefix: String,
}

/// Arguments for `episode-forge enqueue`.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    #[command(flatten)]
    pub queue: QueueArgs,

    #[arg(long)]
    pub team: String,

    #[arg(long)]
    pub project: String,

    #[arg(long)]
    pub episode: String,

    /// Scenes processed per chunk (defaults to the configured value).
    #[arg(long)]
    pub scene_chunk_size: Option<usize>,

    /// Concurrent scene lanes (defaults to the configured value).
    #[arg(long)]
    pub scene_concurrency: Option<usize>,

    /// Refine scenes through per-scene child jobs.
    #[arg(long)]
    pub child_jobs: bool,
}

/// Arguments for `episode-forge status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub queue: QueueArgs,

    /// Job id.
    pub job_id: String,

    /// Output the full job record as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `episode-forge running`.
#[derive(Parser, Debug)]
pub struct RunningArgs {
    #[command(flatten)]
    pub queue: QueueArgs,

    #[arg(long)]
    pub episode: String,
}

/// Arguments for `episode-forge probe`.
#[derive(Parser, Debug)]
pub struct ProbeArgs {
    /// Model to call (defaults to LITELLM_MODEL).
    #[arg(short = 'm', long)]
    pub model: Option<String>,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Enqueue(args) => run_enqueue_command(args).await,
        Commands::Status(args) => run_status_command(args).await,
        Commands::Running(args) => run_running_command(args).await,
        Commands::Config => run_config_command(),
        Commands::Probe(args) => run_probe_command(args).await,
    }
}

async fn connect(args: &QueueArgs) -> anyhow::Result<RedisJobStore> {
    RedisJobStore::connect(&args.redis_url, &args.key_prefix)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to job store at {}: {}", args.redis_url, e))
}

fn build_payload(args: &EnqueueArgs) -> EpisodeJobPayload {
    let mut payload =
        EpisodeJobPayload::new(&EpisodeRef::new(&args.team, &args.project, &args.episode));
    payload.scene_chunk_size = args.scene_chunk_size;
    payload.scene_concurrency = args.scene_concurrency;
    payload.use_scene_child_jobs = args.child_jobs;
    payload
}

async fn run_enqueue_command(args: EnqueueArgs) -> anyhow::Result<()> {
    let store = connect(&args.queue).await?;

    if let Some(running) = store
        .find_running(JobKind::RunEpisodeCreationAgent, &args.episode, None)
        .await?
    {
        anyhow::bail!(
            "Episode creation agent is already running for this episode ({})",
            running
        );
    }

    let payload = build_payload(&args);
    let job_id = store
        .enqueue(
            JobKind::RunEpisodeCreationAgent,
            serde_json::to_value(&payload)?,
        )
        .await?;
    info!(job_id = %job_id, episode_id = %args.episode, "Enqueued episode creation job");
    println!("{}", job_id);
    Ok(())
}

async fn run_status_command(args: StatusArgs) -> anyhow::Result<()> {
    let store = connect(&args.queue).await?;
    let job = store
        .get_job(&args.job_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Job {} not found", args.job_id))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&job)?);
        return Ok(());
    }

    println!("Job:      {}", job.id);
    println!("Kind:     {}", job.kind);
    println!("Status:   {}", job.status);
    println!("Attempts: {}", job.attempts);
    if let Some(progress) = &job.progress {
        println!("Progress: {}% {}", progress.pct, progress.message);
    }
    if let Some(error) = &job.error {
        println!("Error:    {}", error);
    }
    if let Some(result) = &job.result {
        print_result_summary(result);
    }
    Ok(())
}

fn print_result_summary(result: &Value) {
    if let Some(steps) = result.get("stepSummaries").and_then(Value::as_array) {
        println!("Steps:");
        for step in steps {
            println!(
                "  {:<20} {:<10} {}",
                step["step"].as_str().unwrap_or("?"),
                step["status"].as_str().unwrap_or("?"),
                step["message"].as_str().unwrap_or("")
            );
        }
    }
    if let Some(next) = result.get("nextJobId").and_then(Value::as_str) {
        println!("Next job: {}", next);
    }
}

async fn run_running_command(args: RunningArgs) -> anyhow::Result<()> {
    let store = connect(&args.queue).await?;
    match store
        .find_running(JobKind::RunEpisodeCreationAgent, &args.episode, None)
        .await?
    {
        Some(job_id) => println!("{}", job_id),
        None => println!("No running episode creation job for {}", args.episode),
    }
    Ok(())
}

fn run_config_command() -> anyhow::Result<()> {
    let config = OrchestratorConfig::from_env()?;
    println!("agent_enabled:            {}", config.agent_enabled);
    println!("agent.max_steps:          {}", config.agent.max_steps);
    println!("agent.step_timeout:       {:?}", config.agent.step_timeout);
    println!("agent.total_timeout:      {:?}", config.agent.total_timeout);
    println!("agent.fallback_enabled:   {}", config.agent.fallback_enabled);
    println!("scene_chunk_size:         {}", config.scene_chunk_size);
    println!("scene_concurrency:        {}", config.scene_concurrency);
    println!("child_wait_timeout:       {:?}", config.child_wait_timeout);
    println!("child_poll_interval:      {:?}", config.child_poll_interval);
    println!("child_unknown_poll_limit: {}", config.child_unknown_poll_limit);
    Ok(())
}

async fn run_probe_command(args: ProbeArgs) -> anyhow::Result<()> {
    let client = LiteLlmClient::from_env().map_err(|e| {
        anyhow::anyhow!(
            "Failed to initialize LLM client: {}. Set LITELLM_API_BASE (and LITELLM_API_KEY).",
            e
        )
    })?;
    let model = args
        .model
        .unwrap_or_else(|| client.default_model().to_string());
    let caller = Arc::new(ProviderModelCaller::new(Arc::new(client), model.clone()));

    let tools = ToolRegistry::new().with_tool(Arc::new(FnTool::new(
        "echo",
        "Return the input unchanged.",
        |input, _ctx| Box::pin(async move { Ok(input) }),
    )));
    let config = OrchestratorConfig::from_env()?.agent;
    let agent = AgentLoop::new(caller, tools, config);

    let messages = vec![
        Message::system(
            "Reply with one JSON object per turn. Call the echo tool once with \
             {\"kind\":\"tool_call\",\"toolName\":\"echo\",\"toolInput\":{\"ping\":true}}, \
             then answer {\"kind\":\"final\",\"final\":{\"ok\":true}}.",
        ),
        Message::user("Run the probe."),
    ];

    info!(model = %model, "Probing agent loop");
    let outcome = agent
        .run(
            messages,
            |value| match value.get("ok").and_then(Value::as_bool) {
                Some(true) => Ok(()),
                _ => Err("final must be {\"ok\": true}".to_string()),
            },
            None,
        )
        .await
        .map_err(|failure| {
            anyhow::anyhow!(
                "Probe failed after {} steps: {}",
                failure.trace.steps.len(),
                failure.error
            )
        })?;

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "model": model,
            "executionMode": outcome.execution_mode,
            "steps": outcome.trace.step_summaries(),
            "tokenUsage": outcome.trace.token_usage,
        }))?
    );
    Ok(())
}
