//! `dagrun` CLI entry-point.
//!
//! Available sub-commands:
//! - `migrate`: run pending database migrations.
//! - `worker`: process queued step jobs.
//! - `publish`: validate and store a new workflow version.
//! - `start`: start a run of a workflow's latest version.
//! - `pause` / `resume` / `cancel`: control a run.
//! - `retry-step`: reset a failed step and pick its run back up.
//! - `show`: print a run with its steps and logs.
//! - `logs`: export a run's logs as NDJSON.
//! - `validate`: validate a workflow JSON file.
//! - `run`: execute a workflow file in memory, without Postgres.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use db::{MemoryStore, PgStore, Store};
use engine::{EngineConfig, PluginSet, WorkflowEngine, dag, worker};
use nodes::{KvCache, MemoryCache};
use queue::{JobQueue, MemoryQueue, PgQueue};

#[derive(Parser)]
#[command(name = "dagrun", about = "DAG workflow execution engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct Database {
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,
    #[arg(long, default_value_t = 10)]
    max_connections: u32,
}

#[derive(Subcommand)]
enum Command {
    /// Run pending database migrations.
    Migrate {
        #[command(flatten)]
        db: Database,
    },
    /// Start a worker that processes queued step jobs until Ctrl-C.
    Worker {
        #[command(flatten)]
        db: Database,
    },
    /// Validate a workflow definition and store it as a new version.
    Publish {
        #[command(flatten)]
        db: Database,
        /// Path to the workflow JSON file.
        path: PathBuf,
        /// Existing workflow to add a version to; a new id is generated otherwise.
        #[arg(long)]
        workflow_id: Option<Uuid>,
        #[arg(long, default_value = "workflow")]
        name: String,
    },
    /// Start a run of the latest version of a workflow.
    Start {
        #[command(flatten)]
        db: Database,
        workflow_id: Uuid,
        /// Trigger input as inline JSON, or `@path` to read it from a file.
        #[arg(long, default_value = "{}")]
        input: String,
        #[arg(long, env = "USER", default_value = "cli")]
        user: String,
    },
    Pause {
        #[command(flatten)]
        db: Database,
        run_id: Uuid,
    },
    Resume {
        #[command(flatten)]
        db: Database,
        run_id: Uuid,
    },
    Cancel {
        #[command(flatten)]
        db: Database,
        run_id: Uuid,
    },
    /// Reset a FAILED step to PENDING and continue the run.
    RetryStep {
        #[command(flatten)]
        db: Database,
        run_id: Uuid,
        node_id: String,
    },
    /// Print a run with its step executions and logs as JSON.
    Show {
        #[command(flatten)]
        db: Database,
        run_id: Uuid,
    },
    /// Export a run's execution logs as NDJSON.
    Logs {
        #[command(flatten)]
        db: Database,
        run_id: Uuid,
    },
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow JSON file.
        path: PathBuf,
    },
    /// Execute a workflow file end-to-end in memory.
    Run {
        path: PathBuf,
        #[arg(long, default_value = "{}")]
        input: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env()?;

    match cli.command {
        Command::Migrate { db } => {
            info!("Running migrations");
            let pool = db::pool::create_pool(&db.database_url, 2).await?;
            db::pool::run_migrations(&pool).await?;
            info!("Migrations applied successfully");
        }
        Command::Worker { db } => {
            let (engine, queue) = postgres_engine(&db, config).await?;
            let (stop, shutdown) = watch::channel(false);
            let handle = tokio::spawn(worker::run(engine, queue, shutdown));
            tokio::signal::ctrl_c().await?;
            info!("Shutdown requested");
            stop.send(true)?;
            handle.await??;
        }
        Command::Publish { db, path, workflow_id, name } => {
            let (engine, _) = postgres_engine(&db, config).await?;
            let definition = read_json(&path)?;
            let workflow_id = workflow_id.unwrap_or_else(Uuid::new_v4);
            let version = engine.publish_version(workflow_id, &name, definition).await?;
            println!("{}", serde_json::to_string_pretty(&version)?);
        }
        Command::Start { db, workflow_id, input, user } => {
            let (engine, _) = postgres_engine(&db, config).await?;
            let input = parse_input(&input)?;
            let run_id = engine
                .start_execution(workflow_id, input, serde_json::json!({ "triggeredBy": user }))
                .await?;
            println!("{run_id}");
        }
        Command::Pause { db, run_id } => {
            let (engine, _) = postgres_engine(&db, config).await?;
            println!("{}", engine.pause_execution(run_id).await?.status);
        }
        Command::Resume { db, run_id } => {
            let (engine, _) = postgres_engine(&db, config).await?;
            println!("{}", engine.resume_execution(run_id).await?.status);
        }
        Command::Cancel { db, run_id } => {
            let (engine, _) = postgres_engine(&db, config).await?;
            println!("{}", engine.cancel_execution(run_id).await?.status);
        }
        Command::RetryStep { db, run_id, node_id } => {
            let (engine, _) = postgres_engine(&db, config).await?;
            let step = engine.retry_step(run_id, &node_id).await?;
            println!("{} {} (retry {})", step.node_id, step.status, step.retry_count);
        }
        Command::Show { db, run_id } => {
            let (engine, _) = postgres_engine(&db, config).await?;
            print_run(&engine, run_id).await?;
        }
        Command::Logs { db, run_id } => {
            let (engine, _) = postgres_engine(&db, config).await?;
            print!("{}", engine.export_logs_ndjson(run_id).await?);
        }
        Command::Validate { path } => {
            let definition = dag::parse_definition(&read_json(&path)?)?;
            match dag::compile(&definition) {
                Ok(compiled) => {
                    println!("Workflow is valid. Topological order: {:?}", compiled.topological_order());
                }
                Err(e) => {
                    eprintln!("Validation failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        Command::Run { path, input } => run_in_memory(&path, &input, config).await?,
    }

    Ok(())
}

async fn postgres_engine(db: &Database, config: EngineConfig) -> Result<(Arc<WorkflowEngine>, Arc<dyn JobQueue>)> {
    let pool = db::pool::create_pool(&db.database_url, db.max_connections)
        .await
        .context("failed to connect to database")?;
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool.clone()));
    let queue: Arc<dyn JobQueue> = Arc::new(PgQueue::new(pool));
    let cache: Arc<dyn KvCache> = Arc::new(MemoryCache::new());
    let plugins = PluginSet::builtin(&config, cache)?;
    Ok((Arc::new(WorkflowEngine::new(store, queue.clone(), plugins, config)), queue))
}

async fn run_in_memory(path: &Path, input: &str, config: EngineConfig) -> Result<()> {
    let definition = read_json(path)?;
    let input = parse_input(input)?;

    let store = Arc::new(MemoryStore::new());
    let queue: Arc<dyn JobQueue> = Arc::new(MemoryQueue::new());
    let cache: Arc<dyn KvCache> = Arc::new(MemoryCache::new());
    let plugins = PluginSet::builtin(&config, cache)?;
    let poll = config.poll_interval;
    let engine = Arc::new(WorkflowEngine::new(store, queue.clone(), plugins, config));

    let workflow_id = Uuid::new_v4();
    engine.publish_version(workflow_id, "local", definition).await?;

    let (stop, shutdown) = watch::channel(false);
    let handle = tokio::spawn(worker::run(engine.clone(), queue, shutdown));

    let run_id = engine
        .start_execution(workflow_id, input, serde_json::json!({ "triggeredBy": "cli" }))
        .await?;
    info!(%run_id, "run started");

    loop {
        if engine.get_run(run_id).await?.status.is_terminal() {
            break;
        }
        tokio::time::sleep(poll.max(Duration::from_millis(10))).await;
    }

    stop.send(true)?;
    handle.await??;
    print_run(&engine, run_id).await
}

async fn print_run(engine: &WorkflowEngine, run_id: Uuid) -> Result<()> {
    let run = engine.get_run(run_id).await?;
    let steps = engine.get_step_executions(run_id).await?;
    let report = serde_json::json!({ "run": run, "steps": steps });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn read_json(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).with_context(|| format!("cannot read file {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid JSON in {}", path.display()))
}

fn parse_input(raw: &str) -> Result<Value> {
    match raw.strip_prefix('@') {
        Some(path) => read_json(Path::new(path)),
        None => serde_json::from_str(raw).context("--input is not valid JSON"),
    }
}

