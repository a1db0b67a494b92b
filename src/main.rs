//! # RelayHost — blob and queue trigger host
//!
//! Runs shell-command functions for new blobs and queue messages, with
//! cross-process receipts so several hosts can share one store.
//!
//! Usage:
//!   relayhost init                         # Write a default config
//!   relayhost run                          # Start the host
//!   relayhost run --config ./relay.toml    # Custom config
//!   relayhost enqueue orders '{"id":1}'    # Put a message on a queue

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use relayhost_core::config::{FunctionConfig, RelayHostConfig, StorageBackend};
use relayhost_core::traits::{
    BlobGateway, FunctionExecutor, QueueGateway, ReceiptStore, TracingExceptionSink,
};
use relayhost_core::types::{FunctionResult, TriggerData, TriggerValue};
use relayhost_listeners::{
    CausalQueueWriter, Listener, RelayHost, RelayHostOptions, RelayHostServices,
};
use relayhost_storage::{
    LocalBlobStore, MemoryQueueService, MemoryReceiptStore, SqliteQueueService, SqliteReceiptStore,
};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "relayhost",
    version,
    about = "📡 RelayHost — blob & queue trigger host"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: $RELAYHOST_CONFIG, then ~/.relayhost/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the host and run until Ctrl-C
    Run,
    /// Enqueue a message on a queue
    Enqueue {
        queue: String,
        payload: String,
    },
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

impl Cli {
    fn config_path(&self) -> PathBuf {
        RelayHostConfig::resolve_path(self.config.as_deref())
    }

    fn load_config(&self) -> Result<RelayHostConfig> {
        let path = self.config_path();
        match RelayHostConfig::load_optional(&path)? {
            Some(config) => Ok(config),
            None => {
                tracing::warn!("⚠️ No config at {}, using defaults", path.display());
                Ok(RelayHostConfig::default())
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "relayhost=debug,relayhost_listeners=debug,relayhost_storage=debug"
    } else {
        "relayhost=info,relayhost_listeners=info,relayhost_storage=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    match &cli.command {
        Commands::Init { force } => init(&cli, *force),
        Commands::Enqueue { queue, payload } => enqueue(&cli, queue, payload).await,
        Commands::Run => run(&cli).await,
    }
}

fn init(cli: &Cli, force: bool) -> Result<()> {
    let path = cli.config_path();
    if path.exists() && !force {
        println!("⚠️  Config already exists at {} (use --force to overwrite)", path.display());
        return Ok(());
    }
    RelayHostConfig::default().save_to(&path)?;
    println!("✅ Config written to {}", path.display());
    Ok(())
}

async fn enqueue(cli: &Cli, queue: &str, payload: &str) -> Result<()> {
    let config = cli.load_config()?;
    if config.storage.backend == StorageBackend::Memory {
        anyhow::bail!("the memory backend is process-local; enqueue needs storage.backend = \"sqlite\"");
    }
    let (queues, _) = open_queue_storage(&config)?;
    let writer = CausalQueueWriter::new(queues, None);
    let id = writer.enqueue(queue, payload.as_bytes(), None).await?;
    println!("📨 Enqueued message {id} on '{queue}'");
    Ok(())
}

async fn run(cli: &Cli) -> Result<()> {
    let config = cli.load_config()?;
    config.validate()?;
    if config.functions.is_empty() {
        tracing::warn!("⚠️ No [[functions]] configured; the host will idle");
    }

    let (queues, receipts) = open_queue_storage(&config)?;
    let blob_root = config.storage.blob_root();
    std::fs::create_dir_all(&blob_root)
        .with_context(|| format!("creating blob root {}", blob_root.display()))?;
    let blobs: Arc<dyn BlobGateway> =
        Arc::new(LocalBlobStore::new(blob_root, config.storage.list_page_size));

    let executor = Arc::new(CommandExecutor::new(&config.functions));
    let host = RelayHost::new(
        RelayHostOptions::from_config(&config),
        RelayHostServices {
            blobs,
            queues,
            receipts,
            executor,
            exception_sink: Arc::new(TracingExceptionSink),
        },
    );

    for f in &config.functions {
        match (&f.blob_path, &f.queue) {
            (Some(pattern), _) => host.register_blob_trigger(&f.id, pattern).await?,
            (None, Some(queue)) => host.register_queue_trigger(&f.id, queue).await?,
            (None, None) => anyhow::bail!("function '{}' has no trigger", f.id),
        }
    }

    let cancel = CancellationToken::new();
    host.start(cancel.clone()).await?;
    println!(
        "📡 RelayHost '{}' running {} function(s), Ctrl-C to stop",
        host.host_id(),
        config.functions.len()
    );

    tokio::signal::ctrl_c().await?;
    println!("\n👋 Shutting down...");
    cancel.cancel();
    host.stop().await?;
    host.dispose().await?;
    Ok(())
}

fn open_queue_storage(
    config: &RelayHostConfig,
) -> Result<(Arc<dyn QueueGateway>, Arc<dyn ReceiptStore>)> {
    match config.storage.backend {
        StorageBackend::Memory => Ok((
            Arc::new(MemoryQueueService::new()),
            Arc::new(MemoryReceiptStore::new()),
        )),
        StorageBackend::Sqlite => {
            let db_path = config.storage.database_path();
            if let Some(parent) = db_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Ok((
                Arc::new(SqliteQueueService::open(&db_path)?),
                Arc::new(SqliteReceiptStore::open(&db_path)?),
            ))
        }
    }
}

/// Runs each function as `sh -c <command>`.
///
/// Trigger details arrive as `RELAY_*` environment variables; queue payloads
/// are also piped to stdin. Exit status 0 is success.
struct CommandExecutor {
    commands: HashMap<String, String>,
}

impl CommandExecutor {
    fn new(functions: &[FunctionConfig]) -> Self {
        Self {
            commands: functions
                .iter()
                .map(|f| (f.id.clone(), f.command.clone()))
                .collect(),
        }
    }

    fn environment(
        function_id: &str,
        invocation_id: &str,
        trigger: &TriggerData,
    ) -> Vec<(String, String)> {
        let mut env = vec![
            ("RELAY_FUNCTION_ID".to_string(), function_id.to_string()),
            ("RELAY_INVOCATION_ID".to_string(), invocation_id.to_string()),
        ];
        if let Some(parent) = trigger.parent_id {
            env.push(("RELAY_PARENT_ID".into(), parent.to_string()));
        }
        match &trigger.value {
            TriggerValue::Blob { path, change_marker } => {
                env.push(("RELAY_TRIGGER".into(), "blob".into()));
                env.push(("RELAY_BLOB_CONTAINER".into(), path.container.clone()));
                env.push(("RELAY_BLOB_NAME".into(), path.name.clone()));
                env.push(("RELAY_CHANGE_MARKER".into(), change_marker.to_string()));
            }
            TriggerValue::Queue { queue, message } => {
                env.push(("RELAY_TRIGGER".into(), "queue".into()));
                env.push(("RELAY_QUEUE".into(), queue.clone()));
                env.push(("RELAY_MESSAGE_ID".into(), message.id.clone()));
                env.push(("RELAY_DEQUEUE_COUNT".into(), message.dequeue_count.to_string()));
            }
        }
        env
    }
}

#[async_trait]
impl FunctionExecutor for CommandExecutor {
    async fn invoke(
        &self,
        function_id: &str,
        trigger: TriggerData,
        cancel: CancellationToken,
    ) -> FunctionResult {
        let Some(command) = self.commands.get(function_id) else {
            return FunctionResult::Failed(format!("no command for function '{function_id}'"));
        };
        let invocation_id = Uuid::new_v4().to_string();

        let spawned = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .envs(Self::environment(function_id, &invocation_id, &trigger))
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => return FunctionResult::Failed(format!("spawn failed: {e}")),
        };

        if let Some(mut stdin) = child.stdin.take() {
            if let TriggerValue::Queue { message, .. } = &trigger.value {
                if let Err(e) = stdin.write_all(&message.payload).await {
                    tracing::warn!(
                        "⚠️ '{}' ({}) did not take its payload on stdin: {e}",
                        function_id,
                        invocation_id
                    );
                }
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => None,
            status = child.wait() => Some(status),
        };
        match status {
            None => {
                let _ = child.kill().await;
                tracing::warn!("🛑 '{}' ({}) killed on shutdown", function_id, invocation_id);
                FunctionResult::Cancelled
            }
            Some(Ok(s)) if s.success() => {
                tracing::info!("✅ '{}' ({}) succeeded", function_id, invocation_id);
                FunctionResult::Succeeded
            }
            Some(Ok(s)) => FunctionResult::Failed(format!("exited with {s}")),
            Some(Err(e)) => FunctionResult::Failed(format!("wait failed: {e}")),
        }
    }
}
