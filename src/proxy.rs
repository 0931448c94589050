//! Websocket proxy relaying client traffic to allocated backends.
//!
//! A client connects to `/{job_id}/{service}`; the job id is resolved through
//! the registry before the upgrade completes, then frames are forwarded
//! verbatim in both directions until either side closes. Payloads are never
//! inspected or reordered.

use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async_with_config};

use crate::registry::Registry;

/// Frame ceiling on both legs of the relay. Renderer snapshots are huge.
const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024 * 1024;

/// Shared state for the proxy.
#[derive(Clone)]
pub struct ProxyState {
    pub registry: Arc<dyn Registry>,
    /// Backend port for the `renderer` service.
    pub renderer_port: u16,
    /// Backend port for the `backend` service.
    pub backend_port: u16,
}

/// The proxy's HTTP surface: a health check and the relay endpoint.
pub struct ProxyApi;

impl ProxyApi {
    pub fn router(state: ProxyState) -> Router {
        Router::new()
            .route("/healthz", get(healthcheck))
            .route("/{job_id}/{service}", get(relay))
            .with_state(state)
    }
}

async fn healthcheck() -> StatusCode {
    StatusCode::OK
}

async fn relay(
    State(state): State<ProxyState>,
    Path((job_id, service)): Path<(String, String)>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let port = match service.as_str() {
        "renderer" => state.renderer_port,
        "backend" => state.backend_port,
        other => {
            return (StatusCode::BAD_REQUEST, format!("unknown service {other}")).into_response();
        }
    };

    let job = match state.registry.get(&job_id).await {
        Ok(job) => job,
        Err(e) => {
            tracing::warn!("proxy lookup for job {job_id} failed: {e}");
            return (
                StatusCode::NOT_FOUND,
                format!("no job found with id {job_id}"),
            )
                .into_response();
        }
    };

    if job.host.is_empty() {
        tracing::warn!("no host recorded for job {job_id}");
        return (
            StatusCode::NOT_FOUND,
            format!("no host found for job {job_id}"),
        )
            .into_response();
    }

    let backend_url = format!("ws://{}:{}", job.host, port);

    upgrade
        .max_message_size(MAX_MESSAGE_SIZE)
        .max_frame_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |client| async move {
            match run_session(client, &backend_url).await {
                Ok(()) => tracing::info!("relay for job {job_id} finished"),
                Err(e) => tracing::error!("relay for job {job_id} ended: {e}"),
            }
        })
        .into_response()
}

#[derive(Debug, thiserror::Error)]
enum RelayError {
    #[error("backend websocket error: {0}")]
    Backend(#[from] tungstenite::Error),

    #[error("client websocket error: {0}")]
    Client(#[from] axum::Error),
}

type BackendSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open the backend leg and pump frames both ways until one side finishes,
/// then explicitly close whatever is still open.
async fn run_session(client: WebSocket, backend_url: &str) -> Result<(), RelayError> {
    let config = WebSocketConfig::default()
        .max_message_size(Some(MAX_MESSAGE_SIZE))
        .max_frame_size(Some(MAX_MESSAGE_SIZE));

    let (backend, _response) = connect_async_with_config(backend_url, Some(config), false).await?;
    tracing::info!("relaying session to {backend_url}");

    let (mut backend_tx, mut backend_rx) = backend.split();
    let (mut client_tx, mut client_rx) = client.split();

    let result = tokio::select! {
        result = forward_client(&mut client_rx, &mut backend_tx) => result,
        result = forward_backend(&mut backend_rx, &mut client_tx) => result,
    };

    let _ = client_tx.close().await;
    let _ = backend_tx.close().await;

    result
}

/// Client → backend direction.
async fn forward_client(
    client: &mut SplitStream<WebSocket>,
    backend: &mut SplitSink<BackendSocket, tungstenite::Message>,
) -> Result<(), RelayError> {
    while let Some(message) = client.next().await {
        let Some(outbound) = client_to_backend(message?) else {
            break;
        };
        backend.send(outbound).await?;
    }
    Ok(())
}

/// Backend → client direction.
async fn forward_backend(
    backend: &mut SplitStream<BackendSocket>,
    client: &mut SplitSink<WebSocket, Message>,
) -> Result<(), RelayError> {
    while let Some(message) = backend.next().await {
        let Some(outbound) = backend_to_client(message?) else {
            break;
        };
        client.send(outbound).await?;
    }
    Ok(())
}

/// Map an inbound client frame to its backend counterpart; `None` ends the
/// session.
fn client_to_backend(message: Message) -> Option<tungstenite::Message> {
    match message {
        Message::Text(text) => Some(tungstenite::Message::Text(text.as_str().into())),
        Message::Binary(data) => Some(tungstenite::Message::Binary(data)),
        Message::Ping(data) => Some(tungstenite::Message::Ping(data)),
        Message::Pong(data) => Some(tungstenite::Message::Pong(data)),
        Message::Close(_) => None,
    }
}

/// Map a backend frame to its client counterpart; `None` ends the session.
fn backend_to_client(message: tungstenite::Message) -> Option<Message> {
    match message {
        tungstenite::Message::Text(text) => Some(Message::Text(text.as_str().into())),
        tungstenite::Message::Binary(data) => Some(Message::Binary(data)),
        tungstenite::Message::Ping(data) => Some(Message::Ping(data)),
        tungstenite::Message::Pong(data) => Some(Message::Pong(data)),
        tungstenite::Message::Close(_) => None,
        // Raw frames never surface from a configured stream.
        tungstenite::Message::Frame(_) => {
            tracing::error!("unexpected raw frame from backend");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::{accept_async, connect_async};

    use crate::registry::JobRecord;
    use crate::registry::memory::MemoryRegistry;

    use super::*;

    #[test]
    fn frame_types_survive_both_directions() {
        let text = client_to_backend(Message::Text("hello".into())).unwrap();
        assert_eq!(text, tungstenite::Message::Text("hello".into()));

        let binary = client_to_backend(Message::Binary(vec![0, 159, 146, 150].into())).unwrap();
        assert_eq!(
            binary,
            tungstenite::Message::Binary(vec![0, 159, 146, 150].into())
        );

        let ping = backend_to_client(tungstenite::Message::Ping(vec![1].into())).unwrap();
        assert_eq!(ping, Message::Ping(vec![1].into()));

        assert_eq!(client_to_backend(Message::Close(None)), None);
        assert_eq!(backend_to_client(tungstenite::Message::Close(None)), None);
    }

    /// Echo server standing in for a renderer backend.
    async fn spawn_backend() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut socket = accept_async(stream).await.unwrap();
                    while let Some(Ok(message)) = socket.next().await {
                        if message.is_text() || message.is_binary() {
                            if socket.send(message).await.is_err() {
                                break;
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    async fn spawn_proxy(state: ProxyState) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, ProxyApi::router(state)).await.unwrap();
        });
        addr
    }

    async fn ready_job_state(job_id: &str) -> (ProxyState, SocketAddr) {
        let backend_addr = spawn_backend().await;
        let registry = Arc::new(MemoryRegistry::new());
        let mut record = JobRecord::new(job_id, "alice@example.com", chrono::Duration::hours(4));
        record.host = "127.0.0.1".to_string();
        registry.insert(&record).await.unwrap();
        (
            ProxyState {
                registry,
                renderer_port: backend_addr.port(),
                backend_port: backend_addr.port(),
            },
            backend_addr,
        )
    }

    #[tokio::test]
    async fn frames_round_trip_through_the_relay() {
        let (state, _backend) = ready_job_state("job1").await;
        let proxy_addr = spawn_proxy(state).await;

        let (mut socket, _) = connect_async(format!("ws://{proxy_addr}/job1/renderer"))
            .await
            .unwrap();

        socket
            .send(tungstenite::Message::Text("ping payload".into()))
            .await
            .unwrap();
        let echoed = socket.next().await.unwrap().unwrap();
        assert_eq!(echoed, tungstenite::Message::Text("ping payload".into()));

        let payload = vec![0u8, 1, 2, 250, 251, 252];
        socket
            .send(tungstenite::Message::Binary(payload.clone().into()))
            .await
            .unwrap();
        let echoed = socket.next().await.unwrap().unwrap();
        assert_eq!(echoed, tungstenite::Message::Binary(payload.into()));

        socket.close(None).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_jobs_are_rejected_before_the_upgrade() {
        let registry = Arc::new(MemoryRegistry::new());
        let proxy_addr = spawn_proxy(ProxyState {
            registry,
            renderer_port: 5000,
            backend_port: 8000,
        })
        .await;

        let error = connect_async(format!("ws://{proxy_addr}/ghost/renderer"))
            .await
            .unwrap_err();
        match error {
            tungstenite::Error::Http(response) => {
                assert_eq!(response.status(), StatusCode::NOT_FOUND);
            }
            other => panic!("expected an HTTP 404, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn jobs_without_a_host_are_rejected() {
        let registry = Arc::new(MemoryRegistry::new());
        let record = JobRecord::new("job1", "alice@example.com", chrono::Duration::hours(4));
        registry.insert(&record).await.unwrap();
        let proxy_addr = spawn_proxy(ProxyState {
            registry,
            renderer_port: 5000,
            backend_port: 8000,
        })
        .await;

        let error = connect_async(format!("ws://{proxy_addr}/job1/renderer"))
            .await
            .unwrap_err();
        match error {
            tungstenite::Error::Http(response) => {
                assert_eq!(response.status(), StatusCode::NOT_FOUND);
            }
            other => panic!("expected an HTTP 404, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_services_are_rejected() {
        let (state, _backend) = ready_job_state("job1").await;
        let proxy_addr = spawn_proxy(state).await;

        let error = connect_async(format!("ws://{proxy_addr}/job1/shell"))
            .await
            .unwrap_err();
        match error {
            tungstenite::Error::Http(response) => {
                assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            }
            other => panic!("expected an HTTP 400, got {other:?}"),
        }
    }
}
