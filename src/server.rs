//! HTTP server glue shared by the scheduler and proxy binaries.

use std::future::Future;
use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::ServerError;

/// Install the global tracing subscriber. `RUST_LOG` wins over the configured
/// level.
pub fn init_tracing(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Serve `router` on `addr` until `shutdown` resolves.
///
/// Request tracing and a permissive CORS policy are layered on here so both
/// services behave the same; TLS is terminated in front of them.
pub async fn serve(
    name: &str,
    addr: SocketAddr,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    let router = router
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = TcpListener::bind(addr).await.map_err(|e| ServerError::Bind {
        addr,
        reason: e.to_string(),
    })?;

    tracing::info!("{name} listening on {addr}");

    let name = name.to_string();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown.await;
            tracing::info!("{name} shutting down");
        })
        .await
        .map_err(|e| ServerError::Serve(e.to_string()))
}

/// Resolve when the process receives SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("cannot install ctrl-c handler: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!("cannot install SIGTERM handler: {e}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use axum::routing::get;

    use super::*;

    #[tokio::test]
    async fn serve_stops_when_the_shutdown_future_resolves() {
        let router = Router::new().route("/healthz", get(|| async { "ok" }));
        let (stop, signal) = tokio::sync::oneshot::channel::<()>();

        let handle = tokio::spawn(serve(
            "test",
            "127.0.0.1:0".parse().unwrap(),
            router,
            async move {
                let _ = signal.await;
            },
        ));

        stop.send(()).unwrap();
        let result = tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("server ignored shutdown")
            .unwrap();
        assert!(result.is_ok());
    }
}
