use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use muster_core::clock::{Clock, SystemClock};
use muster_core::notifications::spawn_delivery;
use muster_core::tasks::render_report;
use muster_core::{
    AgentDefinition, CommandNotifier, ConversationEngine, Hub, HubSettings, LogNotifier,
    MemoryStore, NotificationService, Notifier, OllamaEngine, Registry, TaskStatus, TaskTracker,
    TaskUpdate,
};
use muster_knowledge::{DocumentStore, InMemoryStore, JsonDirStore, SqliteStore};
use muster_scheduler::{MonitorConfig, ReminderService, TaskMonitor};

mod config;

use config::{MusterConfig, NotifierKind, StorageBackend};

/// Queue depth between the notification producers and the delivery task
const NOTIFY_QUEUE: usize = 256;

#[derive(Parser)]
#[command(name = "muster")]
#[command(version)]
#[command(about = "Muster - route messages to a team of named agents")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize config directory and default config
    Init,

    /// Show current configuration
    Config,

    /// Send one message and print the reply
    Ask {
        /// The message, e.g. "小助手，帮我写一句问候"
        message: String,
    },

    /// Read messages from stdin, one per line
    Chat,

    /// Run the task monitor and reminder loops until Ctrl+C
    Start,

    /// List, add or remove agents
    Agents {
        #[command(subcommand)]
        action: Option<AgentsAction>,
    },

    /// List or update tasks
    Tasks {
        #[command(subcommand)]
        action: Option<TasksAction>,
    },

    /// Print the progress report for active tasks
    Report,
}

#[derive(Subcommand)]
enum AgentsAction {
    /// List registered agents
    List,
    /// Register an agent
    Add {
        id: String,
        role: String,
        /// Trigger names, comma separated (defaults to the id)
        #[arg(long, value_delimiter = ',')]
        names: Vec<String>,
        #[arg(long, default_value = "")]
        description: String,
        /// Model override for this agent
        #[arg(long)]
        model: Option<String>,
    },
    /// Remove an agent (its memory is kept)
    Remove { id: String },
}

#[derive(Subcommand)]
enum TasksAction {
    /// List tasks, newest first
    List {
        /// Only tasks of this agent
        #[arg(long)]
        agent: Option<String>,
    },
    /// Update progress or status of a task
    Update {
        id: String,
        /// 0-100
        #[arg(long)]
        progress: Option<String>,
        /// in_progress, completed or cancelled
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        note: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging; RUST_LOG wins over --debug
    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Config => cmd_config(&cli.config).await,
        Commands::Ask { message } => cmd_ask(&cli.config, &message).await,
        Commands::Chat => cmd_chat(&cli.config).await,
        Commands::Start => cmd_start(&cli.config).await,
        Commands::Agents { action } => cmd_agents(&cli.config, action.unwrap_or(AgentsAction::List)).await,
        Commands::Tasks { action } => {
            cmd_tasks(&cli.config, action.unwrap_or(TasksAction::List { agent: None })).await
        }
        Commands::Report => cmd_report(&cli.config).await,
    }
}

/// Everything a command needs, wired from the config
struct Runtime {
    cfg: MusterConfig,
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    notifications: NotificationService,
    delivery: JoinHandle<()>,
    hub: Hub,
}

impl Runtime {
    async fn build(cfg: MusterConfig) -> Result<Self> {
        let store = open_store(&cfg).await?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let (tx, rx) = mpsc::channel(NOTIFY_QUEUE);
        let notifications =
            NotificationService::new(cfg.notifications.to_notify_config()?, clock.clone(), tx);
        let notifier = build_notifier(&cfg);
        let delivery = spawn_delivery(
            rx,
            notifier,
            Duration::from_secs(cfg.notifier.timeout_secs),
        );

        let registry = Arc::new(Registry::open(store.clone()).await?);
        registry.reconcile_capacity(cfg.registry.max_agents).await?;
        let memory = Arc::new(MemoryStore::new(store.clone(), clock.clone()));
        let tasks = Arc::new(
            TaskTracker::open(store.clone(), clock.clone())
                .await?
                .with_notifications(notifications.clone())
                .with_stuck_threshold(cfg.scheduler.stuck_after_mins),
        );

        let engine: Arc<dyn ConversationEngine> = Arc::new(
            OllamaEngine::new(&cfg.engine.base_url, &cfg.engine.default_model)?
                .with_api_key(cfg.engine.api_key.clone()),
        );
        let hub = Hub::new(
            registry,
            memory,
            tasks,
            engine,
            HubSettings {
                default_model: Some(cfg.engine.default_model.clone()),
                engine_timeout: Duration::from_secs(cfg.engine.timeout_secs),
            },
        );

        Ok(Self {
            cfg,
            store,
            clock,
            notifications,
            delivery,
            hub,
        })
    }

    /// Drop every notification sender and let queued messages go out
    async fn finish(self) {
        let Runtime {
            cfg,
            notifications,
            delivery,
            hub,
            ..
        } = self;
        drop(hub);
        drop(notifications);
        let grace = Duration::from_secs(cfg.notifier.timeout_secs + 5);
        if tokio::time::timeout(grace, delivery).await.is_err() {
            warn!("Pending notifications were not delivered within {:?}", grace);
        }
    }
}

async fn open_store(cfg: &MusterConfig) -> Result<Arc<dyn DocumentStore>> {
    let path = config::expand_home(&cfg.storage.path);
    let store: Arc<dyn DocumentStore> = match cfg.storage.backend {
        StorageBackend::Sqlite => {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            Arc::new(SqliteStore::new(&path)?)
        }
        StorageBackend::Json => Arc::new(JsonDirStore::new(&path)?),
        StorageBackend::Memory => {
            warn!("Using in-memory storage; nothing will survive a restart");
            Arc::new(InMemoryStore::new())
        }
    };
    info!("Storage backend: {}", store.backend_name());
    Ok(store)
}

fn build_notifier(cfg: &MusterConfig) -> Arc<dyn Notifier> {
    match cfg.notifier.kind {
        NotifierKind::Log => Arc::new(LogNotifier),
        NotifierKind::Command => {
            let args = cfg
                .notifier
                .args
                .iter()
                .map(|a| config::expand_home(a).to_string_lossy().into_owned())
                .collect();
            Arc::new(
                CommandNotifier::new(cfg.notifier.command.clone(), args)
                    .with_timeout(Duration::from_secs(cfg.notifier.timeout_secs)),
            )
        }
    }
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        let default_config = include_str!("../../../config/default.toml");
        tokio::fs::write(&config_path, default_config).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600))
                .await?;
        }
        info!("Created default config at {}", config_path.display());
    }

    println!("Muster initialized at {}", config_dir.display());
    println!("Edit {} to configure storage, the engine and notifications.", config_path.display());
    Ok(())
}

async fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = MusterConfig::load(config_path)?;
    println!("{}", toml::to_string_pretty(&cfg.redacted())?);
    Ok(())
}

async fn cmd_ask(config_path: &Option<PathBuf>, message: &str) -> Result<()> {
    let runtime = Runtime::build(MusterConfig::load(config_path)?).await?;
    let reply = runtime.hub.handle_message(message).await;
    println!("{}", reply.text);
    runtime.finish().await;
    Ok(())
}

async fn cmd_chat(config_path: &Option<PathBuf>) -> Result<()> {
    let runtime = Runtime::build(MusterConfig::load(config_path)?).await?;
    println!("Type a message (\"exit\" to quit).");
    serve_stdin(&runtime.hub).await?;
    runtime.finish().await;
    Ok(())
}

/// Answer stdin lines until EOF or "exit"
async fn serve_stdin(hub: &Hub) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "exit" | "quit") {
            break;
        }
        let reply = hub.handle_message(line).await;
        stdout.write_all(format!("{}\n", reply.text).as_bytes()).await?;
    }
    Ok(())
}

async fn cmd_start(config_path: &Option<PathBuf>) -> Result<()> {
    let runtime = Runtime::build(MusterConfig::load(config_path)?).await?;
    let sched = runtime.cfg.scheduler.clone();
    let cancel = CancellationToken::new();

    let monitor = TaskMonitor::new(
        runtime.hub.tasks().clone(),
        runtime.notifications.clone(),
        MonitorConfig {
            poll_interval: Duration::from_secs(sched.poll_interval_secs),
            report_interval: Duration::from_secs(sched.report_interval_mins * 60),
        },
    );
    let monitor_handle = monitor.spawn(cancel.clone());

    let reminders = Arc::new(
        ReminderService::open(
            runtime.hub.registry().clone(),
            runtime.hub.memory().clone(),
            runtime.store.clone(),
            runtime.notifications.clone(),
            runtime.clock.clone(),
        )
        .await?,
    );
    for (keyword, minutes) in &sched.lead_overrides {
        reminders.set_lead_override(keyword, *minutes).await?;
    }
    let reminder_handle = reminders.clone().spawn(
        &sched.digest_cron,
        Duration::from_secs(sched.reminder_poll_secs),
        cancel.clone(),
    )?;

    info!(
        "Muster started with {} agents",
        runtime.hub.registry().len().await
    );

    // Wait for shutdown signal
    signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    cancel.cancel();

    let _ = monitor_handle.await;
    let _ = reminder_handle.await;
    drop(reminders);
    runtime.finish().await;

    println!("Muster stopped.");
    Ok(())
}

async fn cmd_agents(config_path: &Option<PathBuf>, action: AgentsAction) -> Result<()> {
    let runtime = Runtime::build(MusterConfig::load(config_path)?).await?;
    let registry = runtime.hub.registry().clone();

    match action {
        AgentsAction::List => {
            let agents = registry.list().await;
            println!("{} / {} agents", agents.len(), registry.capacity().await);
            for agent in agents {
                let model = agent.model.as_deref().unwrap_or("default");
                println!(
                    "  {:<16} {:<12} names: {:<24} model: {}",
                    agent.id,
                    agent.role,
                    agent.names.join(","),
                    model
                );
            }
        }
        AgentsAction::Add {
            id,
            role,
            names,
            description,
            model,
        } => {
            let names = if names.is_empty() { vec![id.clone()] } else { names };
            let mut agent = AgentDefinition::new(&id, role, names).with_description(description);
            if let Some(model) = model {
                agent = agent.with_model(model);
            }
            registry.add_agent(agent).await?;
            runtime.hub.memory().init_record(&id).await?;
            println!("Added agent {}", id);
        }
        AgentsAction::Remove { id } => {
            let removed = registry.remove_agent(&id).await?;
            println!("Removed agent {} (memory kept)", removed.id);
        }
    }

    runtime.finish().await;
    Ok(())
}

async fn cmd_tasks(config_path: &Option<PathBuf>, action: TasksAction) -> Result<()> {
    let runtime = Runtime::build(MusterConfig::load(config_path)?).await?;
    let tasks = runtime.hub.tasks().clone();

    match action {
        TasksAction::List { agent } => {
            let list = tasks.list_tasks(agent.as_deref()).await;
            if list.is_empty() {
                println!("No tasks.");
            }
            for task in list {
                println!(
                    "  {}  {:<4} {:<5} {}  {}",
                    task.id,
                    task.status.label(),
                    task.progress,
                    task.updated_at.format("%Y-%m-%d %H:%M"),
                    muster_core::types::preview(&task.content, 60)
                );
            }
        }
        TasksAction::Update {
            id,
            progress,
            status,
            note,
        } => {
            let status = status
                .map(|s| TaskStatus::parse(&s).ok_or_else(|| anyhow!("Unknown status '{}'", s)))
                .transpose()?;
            let update = TaskUpdate {
                progress,
                status,
                note,
            };
            let task = tasks.update_task(&id, update).await?;
            println!("{} -> {} {}", task.id, task.status, task.progress);
        }
    }

    drop(tasks);
    runtime.finish().await;
    Ok(())
}

async fn cmd_report(config_path: &Option<PathBuf>) -> Result<()> {
    let runtime = Runtime::build(MusterConfig::load(config_path)?).await?;
    let now = runtime.clock.now();
    let partition = runtime.hub.tasks().partition_active_history(now).await;
    println!("{}", render_report(&partition.active));
    runtime.finish().await;
    Ok(())
}
