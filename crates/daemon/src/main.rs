// conclaved: standalone daemon entry point.

use anyhow::Context;
use conclave_daemon::config::DaemonConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = DaemonConfig::load().context("CONFIG_INVALID: daemon configuration rejected")?;

    let filter = std::env::var("CONCLAVE_LOG")
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(&config.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let timeouts = config.timeouts().context("CONFIG_INVALID: timeout hierarchy rejected")?;
    let (tool, daemon, shim, client) = timeouts.hierarchy_secs();
    info!(
        listen_addr = %config.listen_addr,
        auth_required = config.auth_required(),
        tool_timeout_secs = tool,
        daemon_timeout_secs = daemon,
        shim_timeout_secs = shim,
        client_timeout_secs = client,
        "starting conclave daemon"
    );

    conclave_daemon::runtime::run_standalone(config)
        .await
        .context("daemon terminated unexpectedly")
}
