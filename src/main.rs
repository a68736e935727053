//! dingbot CLI: run the bot, inspect conversation history, or render the
//! deployment template.
//!
//! Logging: set `RUST_LOG=dingbot=debug` for verbose output on stderr.

use anyhow::Context;
use clap::{Parser, Subcommand};
use dingbot::aws::CredentialsProvider;
use dingbot::provision::{self, DeploymentParams};
use dingbot::{runtime, Config};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const CONFIG_ENV: &str = "DINGBOT_CONFIG";

#[derive(Parser)]
#[command(name = "dingbot", version)]
#[command(about = "DingTalk chatbot that streams Amazon Bedrock replies into interactive cards.")]
struct Cli {
    /// TOML config file. Falls back to $DINGBOT_CONFIG, then built-in defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to the DingTalk stream gateway and serve messages until Ctrl+C.
    Run,
    /// Inspect or clear a conversation's stored history.
    History {
        #[command(subcommand)]
        action: HistoryCommand,
    },
    /// Deployment helpers.
    Provision {
        #[command(subcommand)]
        action: ProvisionCommand,
    },
}

#[derive(Subcommand)]
enum HistoryCommand {
    /// Print every stored message of a conversation, oldest first.
    Show { session_id: String },
    /// Archive and clear a conversation, same as sending "重置".
    Reset { session_id: String },
}

#[derive(Subcommand)]
enum ProvisionCommand {
    /// Render the CloudFormation template for a deployment.
    Render {
        #[arg(long, default_value = provision::DEFAULT_PARAMS_FILE)]
        params: PathBuf,

        /// Write to this file instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn config_path(cli: &Cli) -> Option<PathBuf> {
    cli.config.clone().or_else(|| {
        std::env::var(CONFIG_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let config_path = config_path(&cli);
    match cli.command {
        Command::Run => {
            let config = Config::load(config_path.as_deref())?;
            runtime::run(config).await
        }
        Command::History { action } => {
            let config = Config::load(config_path.as_deref())?;
            let credentials = Arc::new(CredentialsProvider::from_environment());
            let store = runtime::build_history(&config, credentials)?;
            match action {
                HistoryCommand::Show { session_id } => {
                    let messages = store.read_all(&session_id).await;
                    if messages.is_empty() {
                        println!("No history stored for {session_id}");
                    }
                    for message in messages {
                        println!("{}: {}", message.role.as_str(), message.content);
                    }
                }
                HistoryCommand::Reset { session_id } => {
                    store.reset(&session_id).await;
                    println!("Reset {session_id}");
                }
            }
            Ok(())
        }
        Command::Provision {
            action: ProvisionCommand::Render { params, out },
        } => render_template(&params, out.as_deref()),
    }
}

fn render_template(params: &Path, out: Option<&Path>) -> anyhow::Result<()> {
    let params = DeploymentParams::load(params)?;
    let json = provision::render(&params)?.to_json_pretty()?;
    match out {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("failed to write {}", path.display()))?;
            tracing::info!(path = %path.display(), "Template written");
        }
        None => println!("{json}"),
    }
    Ok(())
}
