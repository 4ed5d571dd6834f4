use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use conclave_common::TimeoutConfig;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::expert::{ExpertSettings, ExpertSupervisor};
use crate::provider::{BlockingPool, CommandProvider, HttpProvider, ProviderClient, ProviderRouter};
use crate::server::{self, AppState};
use crate::startup::DaemonPaths;
use crate::tools::StaticToolRegistry;
use crate::workflow::{ConversationStore, MemoryConversationStore, WorkflowOrchestrator};

const STORE_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Run the daemon until Ctrl-C / SIGTERM.
pub async fn run_standalone(config: DaemonConfig) -> Result<()> {
    let timeouts = config.timeouts().context("invalid timeout configuration")?;
    let paths = DaemonPaths::resolve()?;
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind daemon listener on {}", config.listen_addr))?;
    let _pid_file = paths.claim_pid_file()?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let provider = build_provider(&config)?;
    if provider.is_empty() {
        warn!("no provider configured; expert analysis will fail with PROVIDER_ERROR");
    } else {
        info!(providers = ?provider.names(), "providers configured");
    }

    let store = Arc::new(MemoryConversationStore::new());
    spawn_store_purge(Arc::clone(&store), shutdown.clone());

    let state = build_state(config, timeouts, Arc::new(provider), store, shutdown);
    serve(listener, state).await
}

/// Providers from configuration: the HTTP endpoint first (it becomes the
/// default), then the local command.
pub fn build_provider(config: &DaemonConfig) -> Result<ProviderRouter> {
    let mut router = ProviderRouter::new();
    if let Some(url) = &config.provider_url {
        let http = HttpProvider::new("http", url.as_str())
            .with_api_key(config.provider_api_key.clone());
        router = router.with_provider(Arc::new(http));
    }
    if let Some(command_line) = &config.provider_command {
        let pool = BlockingPool::new(config.blocking_workers);
        let command = CommandProvider::parse("command", command_line, pool)
            .context("invalid provider_command")?;
        router = router.with_provider(Arc::new(command));
    }
    Ok(router)
}

/// Wire the supervisor, orchestrator and tool registry into shared state.
pub fn build_state(
    config: DaemonConfig,
    timeouts: TimeoutConfig,
    provider: Arc<dyn ProviderClient>,
    store: Arc<dyn ConversationStore>,
    shutdown: CancellationToken,
) -> Arc<AppState> {
    let settings = ExpertSettings {
        poll_interval: config.expert_poll_interval(),
        heartbeat_interval: config.expert_heartbeat_interval(),
        task_timeout: timeouts.expert_timeout(),
    };
    let supervisor = Arc::new(ExpertSupervisor::new(provider, settings));
    let orchestrator =
        Arc::new(WorkflowOrchestrator::new(store, supervisor, config.workflow_state_ttl()));
    let tools = Arc::new(StaticToolRegistry::builtin(orchestrator, timeouts));
    Arc::new(AppState::new(config, timeouts, tools, shutdown))
}

/// Serve until `state.shutdown` is cancelled.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let local_addr = listener.local_addr().context("listener has no local address")?;
    info!(listen_addr = %local_addr, "daemon listening");

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("daemon server exited unexpectedly")
}

/// Bind `addr` and serve in the background. Used by tests and embedders.
pub async fn spawn_server(
    addr: SocketAddr,
    state: Arc<AppState>,
) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind daemon listener on {addr}"))?;
    let local_addr = listener.local_addr().context("listener has no local address")?;
    Ok((local_addr, tokio::spawn(serve(listener, state))))
}

fn spawn_store_purge(store: Arc<MemoryConversationStore>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STORE_PURGE_INTERVAL);
        interval.reset();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let purged = store.purge_expired();
                    if purged > 0 {
                        debug!(purged, remaining = store.len(), "purged expired workflow state");
                    }
                }
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(%error, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
