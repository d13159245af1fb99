//! termrec: record terminal sessions to compact event logs, optionally
//! encrypted, and replay them with pause/seek/speed controls.

mod commands;
mod terminal;

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use termrec_session::{Config, Service};
use tokio::sync::mpsc;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// termrec: terminal session recorder
#[derive(Parser)]
#[command(name = "termrec", version, about = "Record and replay terminal sessions")]
struct Cli {
    /// Config file path
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,

    /// Data directory (overrides the config file)
    #[arg(long = "data-dir", global = true)]
    data_dir: Option<PathBuf>,

    /// Log level or filter directive; RUST_LOG takes precedence
    #[arg(long = "log-level", global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record a shell (or the given command) in a new PTY
    Record {
        /// Display name for the recording
        #[arg(long)]
        name: Option<String>,
        /// Encrypt the recording (prompts for a passphrase)
        #[arg(long)]
        encrypt: bool,
        /// Also record keystrokes
        #[arg(long = "capture-input")]
        capture_input: bool,
        /// Command to run instead of $SHELL
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// List recordings
    List,

    /// Show header, event counts and duration of a recording
    Info {
        /// Recording id or unique prefix
        id: String,
        /// Open through a share addressed to the local identity
        #[arg(long)]
        identity: bool,
    },

    /// Replay a recording to this terminal
    Play {
        /// Recording id or unique prefix
        id: String,
        /// Playback speed multiplier
        #[arg(long)]
        speed: Option<f64>,
        /// Open through a share addressed to the local identity
        #[arg(long)]
        identity: bool,
    },

    /// Delete a recording and its keys
    Delete {
        /// Recording id or unique prefix
        id: String,
    },

    /// List the local identity and imported recipients
    Keys,

    /// Generate the local RSA identity
    Keygen {
        /// Identity name
        name: String,
    },

    /// Import a recipient's public key
    Import {
        /// Recipient name
        name: String,
        /// PEM file holding the public key
        pem_file: PathBuf,
    },

    /// Print a public key (the local identity by default)
    Export {
        /// Identity name
        name: Option<String>,
    },

    /// Remove a key from the keyring
    Forget {
        /// Identity or recipient name
        name: String,
    },

    /// Grant a recipient access to an encrypted recording
    Share {
        /// Recording id or unique prefix
        id: String,
        /// Recipient name
        recipient: String,
    },

    /// Remove a recipient's access to a recording
    Revoke {
        /// Recording id or unique prefix
        id: String,
        /// Recipient name
        recipient: String,
    },

    /// List who a recording is shared with
    Recipients {
        /// Recording id or unique prefix
        id: String,
    },
}

impl Command {
    /// Commands that take over the terminal log to a file instead of stderr.
    fn is_interactive(&self) -> bool {
        matches!(self, Command::Record { .. } | Command::Play { .. })
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        eprintln!("termrec: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref(), cli.data_dir.as_deref())
        .context("failed to load configuration")?;

    let log_file = cli.command.is_interactive().then(|| config.log_path());
    init_tracing(&cli.log_level, log_file.as_deref())?;

    // Nothing in the CLI consumes UI events; commands talk to the service directly.
    let (events, _) = mpsc::channel(1);
    let service = Service::open(&config, events).context("failed to open recording store")?;

    let result = match cli.command {
        Command::Record {
            name,
            encrypt,
            capture_input,
            command,
        } => {
            let opts = commands::record::RecordArgs {
                name,
                encrypt: encrypt || config.encrypt,
                capture_input: capture_input || config.capture_input,
                command,
            };
            commands::record::run(&service, opts).await
        }
        Command::List => commands::recordings::run_list(&service),
        Command::Info { id, identity } => commands::recordings::run_info(&service, &id, identity),
        Command::Play {
            id,
            speed,
            identity,
        } => commands::play::run(&service, &id, speed, config.replay.default_speed, identity).await,
        Command::Delete { id } => commands::recordings::run_delete(&service, &id),
        Command::Keys => commands::keys::run_list(&service),
        Command::Keygen { name } => commands::keys::run_keygen(&service, &name),
        Command::Import { name, pem_file } => {
            commands::keys::run_import(&service, &name, &pem_file)
        }
        Command::Export { name } => commands::keys::run_export(&service, name.as_deref()),
        Command::Forget { name } => commands::keys::run_forget(&service, &name),
        Command::Share { id, recipient } => commands::share::run_share(&service, &id, &recipient),
        Command::Revoke { id, recipient } => commands::share::run_revoke(&service, &id, &recipient),
        Command::Recipients { id } => commands::share::run_recipients(&service, &id),
    };

    service.shutdown();
    result
}

fn init_tracing(level: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level '{level}'"))?;

    match log_file {
        Some(path) => {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
        }
    }
    Ok(())
}
