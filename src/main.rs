use clap::{Parser, Subcommand};
use concierge::config::HostConfig;
use concierge::elicitation::AutoDecline;
use concierge::error::HostError;
use concierge::logging;
use concierge::reasoning::{ChosenAction, PlanContext, ReasoningAdapter, SamplingPrompt};
use concierge::registry::CapabilityKind;
use concierge::router::Host;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "concierge")]
#[command(about = "Host-side session and routing core for tool/resource/prompt servers")]
struct Cli {
    /// Path to the server configuration file.
    #[arg(short, long, default_value = "concierge.toml")]
    config: PathBuf,

    /// Log this crate at debug level.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect the configured servers and stream their notifications until
    /// interrupted.
    Run,
    /// Connect, print the aggregated capability catalog, and exit.
    List,
}

/// Stands in where no model is wired up. Sampling requests from servers get
/// an error reply instead of silence.
struct NoAdapter;

#[async_trait::async_trait]
impl ReasoningAdapter for NoAdapter {
    async fn plan(&self, _context: PlanContext) -> Result<ChosenAction, HostError> {
        Err(unavailable())
    }

    async fn complete(&self, _prompt: SamplingPrompt) -> Result<String, HostError> {
        Err(unavailable())
    }
}

fn unavailable() -> HostError {
    HostError::Transport {
        server: "<host>".to_string(),
        details: "no reasoning adapter configured".to_string(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), HostError> {
    let config = HostConfig::load(&cli.config)?;
    let (host, mut alerts) = Host::new(Arc::new(NoAdapter), Arc::new(AutoDecline));

    let mut connected = 0_usize;
    for (server, outcome) in host.connect_all(&config).await {
        match outcome {
            Ok(id) => {
                info!(server = %server, %id, "connected");
                connected += 1;
            }
            Err(err) => eprintln!("warning: {server}: {err}"),
        }
    }
    if connected == 0 {
        return Err(HostError::Transport {
            server: "<config>".to_string(),
            details: "no server could be connected".to_string(),
        });
    }

    match cli.command {
        Command::List => {
            print_catalog(&host);
            Ok(())
        }
        Command::Run => {
            loop {
                tokio::select! {
                    alert = alerts.recv() => match alert {
                        Some(alert) => {
                            let name = host
                                .server_name(alert.server)
                                .unwrap_or_else(|| alert.server.to_string());
                            info!(server = %name, method = %alert.method, "notification");
                        }
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => {
                        info!("interrupted, draining sessions");
                        break;
                    }
                }
            }
            Ok(())
        }
    }
}

fn print_catalog(host: &Host) {
    for (heading, kind) in [
        ("tools", CapabilityKind::Tool),
        ("resources", CapabilityKind::Resource),
        ("prompts", CapabilityKind::Prompt),
    ] {
        let entries = host.capabilities(kind);
        if entries.is_empty() {
            continue;
        }
        println!("{heading}:");
        for (_, server, capability) in entries {
            let detail = match kind {
                CapabilityKind::Resource => capability.uri.clone(),
                _ => capability.description.clone(),
            };
            match detail {
                Some(detail) => println!("  {server} / {}  ({detail})", capability.name),
                None => println!("  {server} / {}", capability.name),
            }
        }
    }
}
