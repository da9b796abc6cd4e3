mod noninteractive;
mod output;
mod repl;

use anyhow::Result;
use clap::{Parser, Subcommand};
use parley_core::chat::ChatSession;
use parley_core::config::AppConfig;
use parley_core::message::Conversation;
use parley_core::model::ModelId;
use parley_core::store::StateStore;
use parley_core::usage::{SessionStats, UsageAccountant};
use parley_storage::JsonStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "parley",
    version,
    about = "Chat with a hosted AI model from the terminal",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// One-shot prompt (same as `parley ask`). Starts a chat when omitted.
    prompt: Vec<String>,

    /// Model to use (overrides config)
    #[arg(short, long, global = true)]
    model: Option<String>,

    /// Config file to load instead of ./parley.json
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Working directory
    #[arg(short = 'c', long = "cwd", global = true)]
    working_dir: Option<PathBuf>,

    /// Send only the latest message as context
    #[arg(long, global = true)]
    no_history: bool,

    /// Maximum number of prior messages sent as context
    #[arg(long, global = true)]
    max_messages: Option<usize>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a single prompt and print the reply
    Ask {
        #[arg(required = true)]
        prompt: Vec<String>,

        /// Output format
        #[arg(short = 'f', long, default_value = "text")]
        output_format: OutputFormat,

        /// Suppress the usage footer
        #[arg(short, long)]
        quiet: bool,

        /// Also save the exchange as a resumable conversation
        #[arg(long)]
        save: bool,
    },
    /// Interactive multi-turn chat
    Chat {
        /// Resume a saved conversation by ID
        #[arg(long)]
        session: Option<String>,
    },
    /// Show cumulative token usage and cost
    Stats {
        /// Zero all counters
        #[arg(long)]
        reset: bool,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// List saved conversations
    Sessions,
}

#[derive(Debug, Clone, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

pub struct App {
    pub config: AppConfig,
    pub store: Arc<JsonStore>,
}

impl App {
    /// Wire provider, persisted stats and policies into a chat session.
    pub async fn session(
        &self,
        conversation: Option<Conversation>,
        persist_conversation: bool,
        cancel: CancellationToken,
    ) -> Result<ChatSession> {
        let provider = parley_providers::create_provider(&self.config, None)?;
        let stats = self.store.load_stats().await?.unwrap_or_default();
        let accountant = UsageAccountant::new(
            self.config.model.clone(),
            self.config.pricing_table(),
            stats,
        );

        let mut builder = ChatSession::builder(provider, self.store.clone(), accountant)
            .retry(self.config.retry)
            .history(self.config.history)
            .system_prompt(self.config.system_prompt.clone())
            .persist_conversation(persist_conversation)
            .cancel_token(cancel);
        if let Some(conversation) = conversation {
            builder = builder.conversation(conversation);
        }
        Ok(builder.build()?)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        output::print_error(&err);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = parley_core::config::load_config(cli.working_dir.clone(), cli.config.as_deref())?;
    if let Some(model) = &cli.model {
        config.model = ModelId(model.clone());
    }
    if cli.no_history {
        config.history.enabled = false;
    }
    if let Some(n) = cli.max_messages {
        config.history.max_messages = n;
    }
    if cli.debug {
        config.debug = true;
    }

    init_tracing(config.debug);
    tracing::debug!(model = %config.model, data_dir = %config.data_path().display(), "config loaded");

    let store = Arc::new(JsonStore::open(config.data_path()).await?);
    let app = App { config, store };

    match cli.command {
        Some(Command::Ask {
            prompt,
            output_format,
            quiet,
            save,
        }) => noninteractive::run(app, prompt.join(" "), output_format, quiet, save).await,
        Some(Command::Chat { session }) => repl::run(app, session).await,
        Some(Command::Stats { reset, json }) => stats(app, reset, json).await,
        Some(Command::Sessions) => sessions(app).await,
        None if !cli.prompt.is_empty() => {
            noninteractive::run(app, cli.prompt.join(" "), OutputFormat::Text, false, false).await
        }
        None => repl::run(app, None).await,
    }
}

fn init_tracing(debug: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if debug {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn stats(app: App, reset: bool, json: bool) -> Result<()> {
    let stats = if reset {
        let zero = SessionStats::default();
        app.store.save_stats(&zero).await?;
        if !json {
            println!("Usage statistics reset.");
        }
        zero
    } else {
        app.store.load_stats().await?.unwrap_or_default()
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        for line in output::stats_lines(&stats) {
            println!("{line}");
        }
    }
    Ok(())
}

async fn sessions(app: App) -> Result<()> {
    let list = app.store.list_conversations().await?;
    if list.is_empty() {
        println!("No saved conversations.");
        return Ok(());
    }
    for summary in list {
        println!("{}", output::session_line(&summary));
    }
    Ok(())
}
