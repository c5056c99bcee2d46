use crate::metrics::Metrics;
use crate::{config, server};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: String,
    pub admin_listen: String,
}

/// Gateway lifecycle: init → load → register circuits → serve → shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    // Phase 1: configuration, metrics recorder, one circuit per upstream.
    let gateway = config::GatewayConfig::load(&args.config_path)?;
    let metrics = Metrics::install()?;
    let state = server::GatewayState::new(gateway, metrics)?;

    // Phase 2: admin and proxy servers.
    start_admin_server(&state, &args);

    tracing::info!(
        "server: starting gateway, listen={}, version={}",
        args.listen,
        state.config.app_version
    );

    let shutdown = Arc::new(Notify::new());
    let mut proxy_handle = tokio::spawn({
        let listen = args.listen.clone();
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(&listen, state, shutdown).await }
    });

    // Phase 3: block until signal, or until the proxy exits on its own
    // (e.g. the listen address is taken).
    tokio::select! {
        result = wait_for_shutdown() => result?,
        joined = &mut proxy_handle => {
            return match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(anyhow::anyhow!("server: proxy task failed: {}", e)),
            };
        }
    }
    shutdown.notify_waiters();

    // Wait for proxy to finish draining.
    match proxy_handle.await {
        Ok(Err(e)) => tracing::error!("server: proxy error: {}", e),
        Err(e) => tracing::error!("server: proxy task error: {}", e),
        Ok(Ok(())) => {}
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    // The writer thread must outlive every log call.
    std::mem::forget(guard);
}

fn start_admin_server(state: &server::GatewayState, args: &BootstrapArgs) {
    let s = state.clone();
    let admin_addr = args.admin_listen.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&admin_addr, s).await {
            tracing::error!("server: admin failed, error={}", e);
        }
    });
}

async fn wait_for_shutdown() -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let terminate = terminate.recv();

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            tracing::info!("server: received SIGINT, shutting down");
        }
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }
    Ok(())
}
