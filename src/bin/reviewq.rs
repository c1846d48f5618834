//! reviewq CLI: run the service and operate on its queue.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use reviewq::api::{AppState, create_routes};
use reviewq::config::Config;
use reviewq::db::Db;
use reviewq::engine::{ChannelFeed, ClientInfo, Engine, EngineSettings, Feed, FeedItem, PgmqFeed};
use reviewq::model::{Status, TaskId, UserId};
use reviewq::store::{MemoryStore, Store, TaskStore};
use reviewq::telemetry::{TelemetryConfig, init_telemetry};
use secrecy::ExposeSecret;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "reviewq", about = "Human verification queue")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API, reclaim sweep and queue processor
    Serve {
        /// JSON-lines file of `{item_id, ...fields}` records to ingest on start
        #[arg(long)]
        seed: Option<PathBuf>,
    },
    /// Enqueue an upstream item on the pgmq feed
    Ingest {
        item_id: String,
        /// JSON object of field values
        #[arg(long, default_value = "{}")]
        fields: String,
    },
    /// Task inspection
    Tasks {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// User accounts
    User {
        #[command(subcommand)]
        action: UserAction,
    },
    /// Verifier sessions
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// List tasks, newest first
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show a task and its edits
    Show { id: String },
}

#[derive(Subcommand)]
enum UserAction {
    /// Create a user account
    Add { email: String, name: String },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Open a session and print its bearer token
    Open { user_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve { seed } => cmd_serve(config, seed).await,
        Command::Ingest { item_id, fields } => {
            let db = connect(&config).await?;
            cmd_ingest(&db, &config, item_id, &fields).await
        }
        Command::Tasks { action } => {
            let db = connect(&config).await?;
            match action {
                TaskAction::List { status, limit } => cmd_tasks_list(&db, status, limit).await,
                TaskAction::Show { id } => cmd_tasks_show(&db, &id).await,
            }
        }
        Command::User { action } => {
            let engine = Engine::new(Arc::new(connect(&config).await?), EngineSettings::from(&config));
            match action {
                UserAction::Add { email, name } => {
                    let user = engine.sessions.register_user(&email, &name).await?;
                    println!("Created user {} ({})", user.id, user.email);
                    Ok(())
                }
            }
        }
        Command::Session { action } => {
            let engine = Engine::new(Arc::new(connect(&config).await?), EngineSettings::from(&config));
            match action {
                SessionAction::Open { user_id } => {
                    let user = UserId(uuid::Uuid::parse_str(&user_id)?);
                    let session = engine
                        .sessions
                        .open_session(user, ClientInfo::default())
                        .await?;
                    println!("Session: {}", session.id);
                    println!("Expires: {}", session.expires_at);
                    println!("Token:   {}", session.token);
                    Ok(())
                }
            }
        }
    }
}

async fn connect(config: &Config) -> anyhow::Result<Db> {
    let url = config
        .database_url
        .as_ref()
        .context("DATABASE_URL is required for this command")?;
    let db = Db::connect(url.expose_secret()).await?;
    db.migrate().await?;
    Ok(db)
}

async fn cmd_serve(config: Config, seed: Option<PathBuf>) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig::from(&config))?;

    match &config.database_url {
        Some(url) => {
            let db = Arc::new(Db::connect(url.expose_secret()).await?);
            db.migrate().await?;
            db.health_check().await?;
            let feed = PgmqFeed::new(Arc::clone(&db), &config.ingest);
            feed.ensure_queue().await?;
            if seed.is_some() {
                warn!("--seed is ignored with a database; use `reviewq ingest`");
            }
            run_service(&config, db, Arc::new(feed)).await
        }
        None => {
            warn!("DATABASE_URL not set, state is kept in memory and lost on exit");
            let (tx, feed) = ChannelFeed::channel(config.ingest.batch_size.max(1024));
            if let Some(path) = seed {
                let records = read_seed(&path).await?;
                info!(count = records.len(), path = %path.display(), "seeding feed");
                tokio::spawn(async move {
                    for item in records {
                        if tx.send(item).await.is_err() {
                            break;
                        }
                    }
                });
            }
            run_service(&config, Arc::new(MemoryStore::new()), Arc::new(feed)).await
        }
    }
}

async fn read_seed(path: &Path) -> anyhow::Result<Vec<FeedItem>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| -> anyhow::Result<FeedItem> {
            Ok(FeedItem::from_record(serde_json::from_str(line)?))
        })
        .collect()
}

async fn run_service<S: Store, F: Feed>(
    config: &Config,
    store: Arc<S>,
    feed: Arc<F>,
) -> anyhow::Result<()> {
    let engine = Engine::new(store, EngineSettings::from(config));
    let processor = engine.queue_processor(feed, config.ingest.clone());

    let reclaim = engine.reclaim.clone();
    let reclaim_task = tokio::spawn(async move { reclaim.run().await });
    let ingest = processor.clone();
    let ingest_task = tokio::spawn(async move { ingest.run().await });
    processor.wake();

    let app = create_routes(AppState::new(engine.clone()));
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, "reviewq listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown requested");
        })
        .await?;

    engine.reclaim.shutdown();
    processor.shutdown();
    for (name, handle) in [("reclaim", reclaim_task), ("ingest", ingest_task)] {
        match tokio::time::timeout(config.shutdown_grace, handle).await {
            Ok(Ok(Ok(()))) => info!(service = name, "stopped"),
            Ok(Ok(Err(e))) => warn!(service = name, "stopped with error: {e}"),
            Ok(Err(e)) => warn!(service = name, "task failed: {e}"),
            Err(_) => warn!(
                service = name,
                grace_secs = config.shutdown_grace.as_secs(),
                "did not stop within grace period"
            ),
        }
    }
    Ok(())
}

async fn cmd_ingest(db: &Db, config: &Config, item_id: String, fields: &str) -> anyhow::Result<()> {
    let fields: serde_json::Value = serde_json::from_str(fields).context("--fields must be JSON")?;
    if !fields.is_object() {
        anyhow::bail!("--fields must be a JSON object");
    }
    let record = FeedItem::new(item_id, fields).into_record();
    db.create_queue(&config.ingest.queue_name).await?;
    let msg_id = db.send_to_queue(&config.ingest.queue_name, &record).await?;
    println!("Enqueued message {msg_id} on {}", config.ingest.queue_name);
    Ok(())
}

async fn cmd_tasks_list(db: &Db, status: Option<String>, limit: usize) -> anyhow::Result<()> {
    let status: Option<Status> = status.map(|s| s.parse()).transpose()?;
    let tasks = db.list_tasks(status, limit).await?;
    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<12}  {:<24}  {:<5}  {:<5}  CREATED",
        "ID", "STATUS", "SOURCE", "EDITS", "RETRY"
    );
    println!("{}", "-".repeat(80));
    for task in &tasks {
        let id = task.id.to_string();
        let source: String = task.source_ref.chars().take(24).collect();
        println!(
            "{:<8}  {:<12}  {:<24}  {:<5}  {:<5}  {}",
            &id[..8],
            task.status,
            source,
            task.edit_count,
            task.retry_count,
            task.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!("\n{} task(s)", tasks.len());
    Ok(())
}

async fn cmd_tasks_show(db: &Db, id: &str) -> anyhow::Result<()> {
    let id = TaskId(uuid::Uuid::parse_str(id)?);
    let task = db
        .get_task(id)
        .await?
        .with_context(|| format!("no task {id}"))?;
    let edits = db.task_edits(id).await?;

    println!("ID:        {}", task.id);
    println!("Source:    {}", task.source_ref);
    println!("Status:    {}", task.status);
    if let (Some(user), Some(at)) = (task.assigned_user, task.assigned_at) {
        println!("Claimed:   by {user} at {at}");
    }
    println!("Retries:   {} ({} timeouts)", task.retry_count, task.timeout_count);
    if let (Some(by), Some(at)) = (task.verified_by, task.verified_at) {
        println!("Finalized: by {by} at {at}");
    }
    if let Some(notes) = &task.verification_notes {
        println!("Notes:     {notes}");
    }
    println!("Data:      {}", serde_json::to_string_pretty(&task.current_data)?);
    for edit in &edits {
        println!(
            "  {}: {} -> {} ({})",
            edit.field_name,
            edit.original_value,
            edit.current_value,
            edit.edit_reason.as_deref().unwrap_or("-")
        );
    }
    println!("Created:   {}", task.created_at);
    println!("Updated:   {}", task.updated_at);
    Ok(())
}
