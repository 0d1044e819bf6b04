use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use switchboard::config::Config;
use switchboard::orchestration::{Orchestrator, Response};
use switchboard::worker::WorkerRegistry;
use switchboard::{RequesterContext, Result};

/// Switchboard - routes conversational requests to specialised workers
#[derive(Parser, Debug)]
#[command(name = "switchboard")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    SWITCHBOARD_DEBUG=1     Enable debug logging (alternative to --debug)\n    RUST_LOG                Override the log filter"
)]
pub struct Cli {
    /// Enable debug logging on stderr
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (default: ~/.switchboard/switchboard.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Handle a single request and print the response
    Run {
        /// The request in natural language, a `capability: text` prefix or a JSON plan
        prompt: String,

        /// Who is asking
        #[arg(long)]
        user: Option<String>,

        /// Where the answer goes
        #[arg(long)]
        channel: Option<String>,

        /// Print the full response as JSON
        #[arg(long)]
        json: bool,
    },

    /// Read requests from stdin, one per line
    Chat {
        /// Who is asking
        #[arg(long)]
        user: Option<String>,
    },

    /// List registered capabilities
    Capabilities,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    switchboard::log::init_with_debug(cli.debug);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Run {
            prompt,
            user,
            channel,
            json,
        } => {
            let requester = RequesterContext::new(user.as_deref(), channel.as_deref());
            run_once(config, prompt, requester, json)
        }
        Command::Chat { user } => run_chat(config, user),
        Command::Capabilities => {
            run_capabilities();
            Ok(())
        }
    }
}

fn run_once(config: Config, prompt: String, requester: RequesterContext, json: bool) -> Result<()> {
    tracing::debug!("Run command: prompt={:?}, json={}", prompt, json);

    let rt = tokio::runtime::Runtime::new()?;
    let response = rt.block_on(async {
        let orchestrator = Orchestrator::with_builtins(config)?;
        let response = orchestrator.run(&prompt, requester).await;
        orchestrator.shutdown().await;
        response
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        print_response(&response);
    }
    Ok(())
}

fn run_chat(config: Config, user: Option<String>) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let orchestrator = Orchestrator::with_builtins(config)?;
        let requester = RequesterContext::new(user.as_deref(), Some("stdin"));

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

            match orchestrator.run(line, requester.clone()).await {
                Ok(response) => {
                    print_response(&response);
                    if let Err(err) = orchestrator.forget(&response.request_id).await {
                        tracing::debug!("Could not drop finished request: {}", err);
                    }
                }
                // a rejected request does not end the session
                Err(switchboard::Error::Decomposition(err)) => println!("Sorry, {}.", err),
                Err(err) => {
                    orchestrator.shutdown().await;
                    return Err(err);
                }
            }
        }

        orchestrator.shutdown().await;
        Ok(())
    })
}

fn run_capabilities() {
    let registry = WorkerRegistry::with_builtins();
    println!("Capabilities:");
    for (capability, description) in registry.describe() {
        println!("  {:<12} {}", capability, description);
    }
}

fn print_response(response: &Response) {
    println!("{}", response.text());
    if !response.is_success() && response.status.is_terminal() {
        tracing::info!(
            request = %response.request_id.short(),
            status = %response.status,
            "{}",
            response.summary
        );
    }
}
