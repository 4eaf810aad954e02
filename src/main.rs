use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pointer_lib::config::{
    default_engine_config_path, default_ui_cache_path, load_from_environment, load_ui_cache, save_engine_config,
};
use pointer_lib::conversation::ConversationHistory;
use pointer_lib::events::EngineEvent;
use pointer_lib::file_store::LocalFileStore;
use pointer_lib::models::{HttpEndpoint, ModelGateway, Purpose};
use pointer_lib::protocol::Attachment;
use pointer_lib::tool_service::WorkspaceToolService;
use pointer_lib::{EngineError, Orchestrator, Result};

#[derive(Parser)]
#[command(name = "pointer", version, about = "Stream AI replies into reviewable file changes")]
struct Cli {
    /// Path to config.json (defaults to the platform config directory)
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Send one message and review the proposed changes
    Chat {
        /// Message text
        message: Vec<String>,
        /// Project root the reply may change
        #[arg(long, default_value = ".")]
        workspace: PathBuf,
        /// Write every pending diff once the reply is done
        #[arg(long, default_value_t = false)]
        accept_all: bool,
        /// chat or agent
        #[arg(long, default_value = "chat")]
        purpose: Purpose,
        /// Conversation file to continue and update
        #[arg(long)]
        conversation: Option<PathBuf>,
        /// Attach a file to the message (repeatable)
        #[arg(long = "attach")]
        attachments: Vec<PathBuf>,
    },
    /// List models offered by the configured endpoint
    Models,
    /// Show the resolved configuration
    Config {
        /// Write the resolved configuration to the config path
        #[arg(long, default_value_t = false)]
        init: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pointer=info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.unwrap_or_else(default_engine_config_path);
    let config = load_from_environment(&config_path);
    let ui_cache = load_ui_cache(&default_ui_cache_path());
    let gateway = Arc::new(ModelGateway::new(config.clone(), Arc::new(HttpEndpoint::new())).with_ui_cache(ui_cache));

    match cli.command {
        CliCommand::Chat {
            message,
            workspace,
            accept_all,
            purpose,
            conversation,
            attachments,
        } => {
            let message = message.join(" ");
            if message.trim().is_empty() {
                return Err(EngineError::Config("empty message".to_string()));
            }
            if !purpose.is_user_facing() {
                return Err(EngineError::Config(format!("{purpose} is not a chat purpose")));
            }

            let history = match conversation.as_deref().filter(|p| p.exists()) {
                Some(path) => ConversationHistory::load(path)?,
                None => ConversationHistory::new(),
            };
            let store = Arc::new(LocalFileStore::new(workspace.clone()));
            let tools = Arc::new(WorkspaceToolService::new(workspace));
            let mut orchestrator = Orchestrator::new(config, gateway, store, tools)
                .with_purpose(purpose)
                .with_conversation(history);

            let mut attached = Vec::with_capacity(attachments.len());
            for path in &attachments {
                attached.push(Attachment {
                    name: path.display().to_string(),
                    content: tokio::fs::read_to_string(path).await?,
                });
            }

            subscribe_printer(&orchestrator);
            let result = orchestrator.send_with_attachments(&message, attached).await;
            println!();

            if let Some(path) = conversation.as_deref() {
                if orchestrator.conversation().metadata.message_count <= 4 {
                    orchestrator.summarize().await;
                }
                orchestrator.conversation().save(path)?;
            }
            result?;

            for diff in orchestrator.diff_bus().list() {
                let stats = diff.stats();
                println!(
                    "pending: {} (+{} -{}){}",
                    diff.path,
                    stats.added_lines,
                    stats.removed_lines,
                    if diff.is_new_file() { " new file" } else { "" }
                );
                if !accept_all {
                    print!("{}", diff.unified_diff());
                }
            }

            if accept_all {
                for (path, outcome) in orchestrator.diff_bus().accept_all().await {
                    match outcome {
                        Ok(()) => println!("wrote {path}"),
                        Err(e) => eprintln!("failed {path}: {e}"),
                    }
                }
            }
        }
        CliCommand::Models => {
            let models = gateway.list_models().await;
            if models.is_empty() {
                println!("no models reported by {}", config.endpoint);
            }
            for model in models {
                match model.owned_by {
                    Some(owner) => println!("{} ({owner})", model.id),
                    None => println!("{}", model.id),
                }
            }
        }
        CliCommand::Config { init } => {
            if init {
                save_engine_config(&config_path, &config)?;
                println!("wrote {}", config_path.display());
            }
            let mut shown = config.clone();
            if !shown.api_key.is_empty() {
                shown.api_key = "********".to_string();
            }
            println!("config: {}", config_path.display());
            println!("{}", serde_json::to_string_pretty(&shown)?);
        }
    }
    Ok(())
}

/// Print streamed text as it arrives.
fn subscribe_printer(orchestrator: &Orchestrator) {
    let printed: Mutex<(u64, usize)> = Mutex::new((0, 0));
    orchestrator.subscribe(move |event| match event {
        EngineEvent::SnapshotUpdated { exchange_id, text } => {
            let mut printed = printed.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if printed.0 != *exchange_id {
                *printed = (*exchange_id, 0);
                if *exchange_id > 1 {
                    println!();
                }
            }
            if let Some(delta) = text.get(printed.1..) {
                print!("{delta}");
                let _ = std::io::stdout().flush();
            }
            printed.1 = text.len();
        }
        EngineEvent::ToolCallStarted { name, .. } => eprintln!("\n[tool] {name}"),
        EngineEvent::CommandProposed { command, auto_run: false } => eprintln!("\n[suggested] {command}"),
        EngineEvent::Error { message } => eprintln!("\n[error] {message}"),
        _ => {}
    });
}
