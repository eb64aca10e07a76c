use anyhow::Result;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{self, ProxyConfig};
use crate::server::{self, AppState};

/// CLI arguments forwarded from `main()`. Listen addresses fall back to
/// the `[server]` section of the config document when not given.
pub struct BootstrapArgs {
    pub config_path: PathBuf,
    pub listen: Option<String>,
    pub admin_listen: Option<String>,
}

/// Proxy lifecycle: init → load/validate → serve → reload on SIGHUP →
/// graceful shutdown on SIGINT/SIGTERM.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let raw = ProxyConfig::load(&args.config_path)?;
    let compiled = config::compile::compile(&raw)?;
    let listen = args
        .listen
        .unwrap_or_else(|| format!("{}:{}", raw.server.host, raw.server.port));
    let admin_listen = args
        .admin_listen
        .unwrap_or_else(|| format!("{}:{}", raw.server.host, raw.server.admin_port));

    let state = AppState::new(compiled)?;
    tracing::info!(
        "server: starting, listen={}, admin={}, upstreams={}",
        listen,
        admin_listen,
        state.snapshot.load().upstreams.len()
    );

    start_admin_server(&state, admin_listen);
    start_reload_watcher(&state, args.config_path.clone());

    let shutdown = CancellationToken::new();
    let proxy_handle = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(&listen, state, shutdown).await }
    });

    wait_for_shutdown().await;
    tracing::info!("server: shutdown signal received");

    // Stop accepting, cancel queued entries, drain in-flight requests.
    shutdown.cancel();
    state.shutdown().await;
    match proxy_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e),
        Err(e) => tracing::error!("server: proxy task error: {}", e),
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
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

    std::mem::forget(_guard);
}

fn start_admin_server(state: &AppState, admin_listen: String) {
    let state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&admin_listen, state).await {
            tracing::error!("server: admin server failed: {}", e);
        }
    });
}

/// SIGHUP reloads the config file. An invalid document is logged and
/// dropped; the previous generation continues to serve.
#[cfg(unix)]
fn start_reload_watcher(state: &AppState, config_path: PathBuf) {
    let state = state.clone();
    tokio::spawn(async move {
        let mut hup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!("server: cannot install SIGHUP handler: {}", e);
                return;
            }
        };
        while hup.recv().await.is_some() {
            tracing::info!("config: SIGHUP received, reloading {}", config_path.display());
            let reloaded = ProxyConfig::load(&config_path)
                .and_then(|raw| config::compile::compile(&raw));
            match reloaded {
                Ok(compiled) => {
                    if let Err(e) = state.reload(compiled).await {
                        tracing::error!("config: reload failed, keeping old generation: {}", e);
                    }
                }
                Err(e) => {
                    tracing::error!("config: invalid snapshot rejected: {}", e);
                }
            }
        }
    });
}

#[cfg(not(unix))]
fn start_reload_watcher(_state: &AppState, _config_path: PathBuf) {}

#[cfg(unix)]
async fn wait_for_shutdown() {
    let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(sig) => sig,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
