// conclave-shim entry point. stdout carries the local protocol; logs go to
// stderr.

use anyhow::Context;
use clap::{Parser, Subcommand};
use conclave_shim::transport::WsTransport;
use conclave_shim::{connection, connection_settings, local, probe, ShimConfig};
use tokio::io::BufReader;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conclave-shim", about = "Reconnecting bridge to the conclave daemon")]
struct Cli {
    #[command(flatten)]
    config: ShimConfig,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Bridge JSON-RPC on stdin/stdout to the daemon (default).
    Run,
    /// Perform one full handshake and exit 0 if the daemon is healthy.
    Probe,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.config;

    let filter = std::env::var("CONCLAVE_LOG")
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(&config.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    config.validate().context("shim configuration rejected")?;
    let timeouts = config.timeouts()?;
    let settings = connection_settings(&config, config.resolve_session_id())?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Probe => match probe::probe(&settings).await {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = %err, url = %settings.url, "daemon probe failed");
                std::process::exit(1);
            }
        },
        Command::Run => {
            let (tool, daemon, shim, client) = timeouts.hierarchy_secs();
            info!(
                url = %settings.url,
                session_id = %settings.session_id,
                tool_timeout_secs = tool,
                daemon_timeout_secs = daemon,
                shim_timeout_secs = shim,
                client_timeout_secs = client,
                "starting conclave shim"
            );
            let shim_client =
                connection::spawn(WsTransport::new(), settings, timeouts.shim_timeout());
            local::serve_stdio(BufReader::new(tokio::io::stdin()), tokio::io::stdout(), shim_client)
                .await
                .context("local bridge failed")?;
            info!("caller went away; exiting");
            Ok(())
        }
    }
}
