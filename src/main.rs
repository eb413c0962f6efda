use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use opsbridge::approval::Orchestrator;
use opsbridge::chat::{ChatClient, HttpChat};
use opsbridge::config::Config;
use opsbridge::jobs::JobStore;
use opsbridge::{events, patch, queue};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    name = "opsbridge",
    about = "Approval-gated bridge between chat and your repositories",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bridge: chat events on stdin, queue poller in the background
    Serve,
    /// Apply the diff in a job directory and commit the result
    Apply {
        /// Job directory containing change.diff
        #[arg(long)]
        job: PathBuf,
        /// Repository root (defaults to the configured root)
        #[arg(long)]
        repo: Option<PathBuf>,
    },
    /// Inspect or edit the durable approval queue
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
    /// Print every item in the queue
    List,
    /// Append a new pending task
    Add {
        /// Task text
        task: Vec<String>,
        /// Channel to propose the task in
        #[arg(long)]
        channel: Option<String>,
    },
    /// Set an item's status (pending|queued|approved|rejected|done)
    Mark { id: String, status: String },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("opsbridge=info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::load();

    match args.command {
        Command::Serve => serve(config),
        Command::Apply { job, repo } => {
            let root = repo.unwrap_or_else(|| config.repo_root.clone());
            let report = patch::apply_job(&job, &root, config.code_mode_enabled)?;
            println!("{}", report.detail);
            if let Some(warning) = report.push_warning {
                println!("warning: {}", warning);
            }
            Ok(())
        }
        Command::Queue { command } => run_queue_command(&config, command),
    }
}

fn serve(config: Config) -> Result<()> {
    let token = Config::chat_token()
        .context("OPSBRIDGE_CHAT_TOKEN is not set; serve needs a chat token")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let chat: Arc<dyn ChatClient> = Arc::new(HttpChat::new(config.chat_api_base.clone(), token));
        let store = Arc::new(JobStore::new());
        let orchestrator = Arc::new(Orchestrator::new(store, chat, config));

        tracing::info!("opsbridge serving; reading events from stdin");
        tokio::spawn(Arc::clone(&orchestrator).run_queue_poller());
        events::run_stdin_loop(orchestrator).await
    })
}

fn run_queue_command(config: &Config, command: QueueCommand) -> Result<()> {
    match command {
        QueueCommand::List => {
            let items = queue::load(&config.queue_path)?;
            println!("{}", queue::summarize(&items));
        }
        QueueCommand::Add { task, channel } => {
            let task = task.join(" ");
            if task.trim().is_empty() {
                anyhow::bail!("missing task text");
            }
            let item = queue::add(&config.queue_path, &task, channel)?;
            println!("added {}", item.id);
        }
        QueueCommand::Mark { id, status } => {
            let status = status.parse()?;
            if queue::mark(&config.queue_path, &id, status)? {
                println!("marked {} {}", id, status.label());
            } else {
                anyhow::bail!("no queue item with id '{}'", id);
            }
        }
    }
    Ok(())
}
