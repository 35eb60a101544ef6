mod commands;

use clap::{Parser, Subcommand};
use fleet_core::{FleetConfig, FleetResult, MessageId, MessagePriority};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "fleet=info,warn";

#[derive(Parser)]
#[command(name = "fleet")]
#[command(about = "Coordinate an agent fleet: contracts, messages and health")]
#[command(version)]
struct Cli {
    /// TOML configuration file (defaults plus FLEET_* env vars otherwise)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print records as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Claim an available contract for an agent
    #[command(display_order = 1)]
    Claim { contract_id: String, agent_id: String },

    /// Complete a contract the agent holds
    #[command(display_order = 2)]
    Complete {
        contract_id: String,
        agent_id: String,
        /// Deliverables produced for the contract
        deliverables: Vec<String>,
    },

    /// List contracts nobody has claimed
    #[command(display_order = 3)]
    ListAvailable,

    /// Contract counts, points and completion rate
    #[command(display_order = 4)]
    Stats,

    /// Queue a message and deliver it
    #[command(display_order = 10)]
    Send {
        recipient: String,
        content: String,

        /// Sender recorded on the message
        #[arg(long, default_value = "Captain")]
        from: String,

        #[arg(long, default_value = "direct")]
        category: String,

        #[arg(long, default_value = "normal")]
        priority: MessagePriority,

        /// Overrides the configured default
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Message that must finish first (repeatable)
        #[arg(long = "after")]
        dependencies: Vec<MessageId>,

        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Only enqueue; leave delivery to `fleet process`
        #[arg(long)]
        queue_only: bool,
    },

    /// Drain the outbound queue
    #[command(display_order = 11)]
    Process {
        /// Run a single pass instead of waiting out backoffs
        #[arg(long)]
        once: bool,
    },

    /// Messages that exhausted their attempts
    #[command(display_order = 12)]
    DeadLetters,

    /// List an agent's inbox
    #[command(display_order = 13)]
    Inbox {
        agent_id: String,
        /// Include processed envelopes
        #[arg(long)]
        all: bool,
    },

    /// Mark an inbox envelope processed
    #[command(display_order = 14)]
    Ack { agent_id: String, message_id: MessageId },

    /// Scan the contract store for corruption (read-only)
    #[command(display_order = 20)]
    Scan {
        /// Write the full JSON report here
        #[arg(long)]
        output: Option<PathBuf>,

        /// Exit 1 if any error-level finding is present
        #[arg(long)]
        strict: bool,
    },

    /// Classify agents by status freshness
    #[command(display_order = 21)]
    Health,

    /// Record an agent's status snapshot
    #[command(display_order = 22)]
    StatusSet {
        agent_id: String,
        status: String,
        #[arg(long)]
        mission: Option<String>,
        /// Current task (repeatable)
        #[arg(long = "task")]
        tasks: Vec<String>,
    },
}

fn init_tracing(json: bool) {
    let filter = std::env::var("FLEET_LOG")
        .ok()
        .and_then(|v| EnvFilter::try_new(v).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    if let Err(e) = result {
        eprintln!("warning: logging not initialized: {e}");
    }
}

fn load_config(path: Option<&Path>) -> FleetResult<FleetConfig> {
    match path {
        Some(path) => FleetConfig::load(path),
        None => {
            let config = FleetConfig::from_env();
            config.validate()?;
            Ok(config)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let services = commands::Services::new(config, cli.json);
    match runtime.block_on(services.run(cli.command)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::debug!(error = ?e, "command failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
