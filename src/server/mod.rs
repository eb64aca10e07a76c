mod admin;
pub mod bootstrap;
pub mod state;

pub use state::AppState;

use anyhow::Result;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::proxy;
use crate::proxy::context::BoxBody;

/// How long shutdown waits for open connections before abandoning them.
const DRAIN_PERIOD: Duration = Duration::from_secs(30);

/// Bind the proxy listener and serve until `shutdown` is cancelled.
pub async fn run_proxy_server(
    listen: &str,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: proxy listening, addr={}", addr);
    serve_proxy(listener, state, shutdown).await
}

/// Accept loop on an already-bound listener (tests bind port 0 first).
///
/// Connections run on a `TaskTracker`: cancellation stops the accept loop,
/// closes the tracker, and waits up to `DRAIN_PERIOD` for the tail of
/// in-flight requests instead of tearing them down.
pub async fn serve_proxy(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<()> {
    let conns = TaskTracker::new();

    loop {
        let (stream, peer_addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!("server: proxy: accept failed, error={}", e);
                    metrics::counter!(
                        "proxy_connections_total",
                        "status" => "error",
                    )
                    .increment(1);
                    continue;
                }
            },
            _ = shutdown.cancelled() => break,
        };
        metrics::counter!(
            "proxy_connections_total",
            "status" => "accepted",
        )
        .increment(1);

        let state = state.clone();
        conns.spawn(async move {
            drive_connection("proxy", stream, move |req| {
                let state = state.clone();
                async move { proxy::handle_request(req, state, peer_addr).await }
            })
            .await;
        });
    }

    info!(
        "server: proxy: stopped accepting, open_connections={}",
        conns.len()
    );
    conns.close();
    if tokio::time::timeout(DRAIN_PERIOD, conns.wait()).await.is_err() {
        info!(
            "server: proxy: drain period elapsed, abandoned_connections={}",
            conns.len()
        );
    }
    Ok(())
}

/// Run the admin server: health/readiness, Prometheus metrics, JSON stats,
/// traffic history, and the queue clear hook. Lives for the whole process;
/// it has no drain phase of its own.
pub async fn run_admin_server(listen: &str, state: AppState) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: admin listening, addr={}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            drive_connection("admin", stream, move |req| {
                let state = state.clone();
                async move { admin::handle_admin(req, state) }
            })
            .await;
        });
    }
}

/// Serve one accepted TCP connection, auto-detecting HTTP/1.1 vs HTTP/2.
/// Connection-level errors (resets, aborted keep-alives) are routine and
/// only logged at debug.
async fn drive_connection<F, Fut>(listener_name: &'static str, stream: TcpStream, handler: F)
where
    F: Fn(Request<Incoming>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<hyper::Response<BoxBody>, std::convert::Infallible>>
        + Send
        + 'static,
{
    let svc = service_fn(handler);

    metrics::gauge!(
        "proxy_connections_active",
        "listener" => listener_name,
    )
    .increment(1.0);

    if let Err(e) = auto::Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(TokioIo::new(stream), svc)
        .await
    {
        debug!(
            "server: {}: connection ended with error: {}",
            listener_name, e
        );
    }

    metrics::gauge!(
        "proxy_connections_active",
        "listener" => listener_name,
    )
    .decrement(1.0);
}
