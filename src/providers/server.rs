//! HTTP event-stream endpoint for a self-hosted provider.
//!
//! `GET /sse` opens a session: the first event (`endpoint`) tells the client
//! where to post, and every JSON-RPC response for that session is pushed back
//! as a `message` event. `POST /messages?session_id=…` accepts one request
//! and answers `202 Accepted`.

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::registry::{handle_message, ProviderRegistry};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

type Sessions = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<String>>>>;

#[derive(Clone)]
struct AppState {
    registry: Arc<ProviderRegistry>,
    sessions: Sessions,
    shutdown: watch::Receiver<bool>,
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    session_id: String,
}

/// Routes for one provider. Open streams end when `shutdown` turns true.
pub fn router(registry: Arc<ProviderRegistry>, shutdown: watch::Receiver<bool>) -> Router {
    let state = AppState {
        registry,
        sessions: Arc::new(Mutex::new(HashMap::new())),
        shutdown,
    };
    Router::new()
        .route("/sse", get(open_stream))
        .route("/messages", post(post_message))
        .with_state(state)
}

async fn open_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let session_id = uuid::Uuid::new_v4().simple().to_string();
    let (tx, rx) = mpsc::unbounded_channel();

    if let Ok(mut sessions) = state.sessions.lock() {
        sessions.retain(|_, sender| !sender.is_closed());
        sessions.insert(session_id.clone(), tx);
    }
    tracing::debug!(provider = %state.registry.name(), session = %session_id, "stream opened");

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/messages?session_id={session_id}"));

    let messages = UnboundedReceiverStream::new(rx)
        .map(|json| Event::default().event("message").data(json));

    let stream = futures::stream::once(async move { endpoint })
        .chain(messages)
        .map(Ok)
        .take_until(stopped(state.shutdown.clone()));

    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
}

async fn post_message(
    State(state): State<AppState>,
    Query(query): Query<MessageQuery>,
    body: String,
) -> impl IntoResponse {
    let sender = state
        .sessions
        .lock()
        .ok()
        .and_then(|sessions| sessions.get(&query.session_id).cloned());

    let Some(sender) = sender else {
        return (StatusCode::NOT_FOUND, "Could not find session");
    };

    if let Some(response) = handle_message(&state.registry, &body) {
        if sender.send(response).is_err() {
            if let Ok(mut sessions) = state.sessions.lock() {
                sessions.remove(&query.session_id);
            }
            return (StatusCode::GONE, "Session stream closed");
        }
    }

    (StatusCode::ACCEPTED, "Accepted")
}

/// Resolves once the flag turns true or its sender is gone.
async fn stopped(mut flag: watch::Receiver<bool>) {
    while !*flag.borrow_and_update() {
        if flag.changed().await.is_err() {
            return;
        }
    }
}

// ─── Server Handle ───────────────────────────────────────────────────────────

/// A running provider endpoint.
pub struct SseServer {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SseServer {
    /// Bind `addr` and start serving `registry` in the background.
    pub async fn bind(registry: ProviderRegistry, addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let name = registry.name().to_string();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let app = router(Arc::new(registry), shutdown_rx.clone());

        tracing::info!(provider = %name, addr = %local_addr, "provider listening");

        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(stopped(shutdown_rx))
                .await;
            match result {
                Ok(()) => tracing::info!(provider = %name, "provider stopped"),
                Err(e) => tracing::error!(provider = %name, error = %e, "provider server error"),
            }
        });

        Ok(Self {
            local_addr,
            shutdown_tx,
            handle,
        })
    }

    /// Bind an ephemeral loopback port.
    pub async fn spawn_local(registry: ProviderRegistry) -> std::io::Result<Self> {
        Self::bind(registry, SocketAddr::from(([127, 0, 0, 1], 0))).await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// URL clients open the event stream on.
    pub fn url(&self) -> String {
        format!("http://{}/sse", self.local_addr)
    }

    /// End open streams, stop accepting, and wait for the server task.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "provider server task failed");
        }
    }
}

/// Serve `registry` on `addr` until `shutdown` resolves.
pub async fn serve_sse<F>(
    registry: ProviderRegistry,
    addr: SocketAddr,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()>,
{
    let server = SseServer::bind(registry, addr).await?;
    shutdown.await;
    server.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::sse::SseTransport;
    use crate::mcp_client::transport::Transport;
    use crate::mcp_client::types::ProviderSpec;
    use crate::providers::math;

    #[tokio::test]
    async fn test_client_round_trip_over_event_stream() {
        let server = SseServer::spawn_local(math::registry()).await.unwrap();
        let spec = ProviderSpec::sse("math", &server.url());

        let transport = SseTransport::connect(&spec).await.unwrap();
        assert_eq!(transport.endpoint().path(), "/messages");

        let response = transport.request("tools/list", None).await.unwrap();
        let tools = response.result.unwrap()["tools"].as_array().unwrap().len();
        assert_eq!(tools, 4);

        transport.close(Duration::ZERO).await.unwrap();
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_post_to_unknown_session_is_not_found() {
        let server = SseServer::spawn_local(math::registry()).await.unwrap();
        let url = format!("http://{}/messages?session_id=nope", server.local_addr());

        let status = reqwest::Client::new()
            .post(url)
            .body(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#)
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status, reqwest::StatusCode::NOT_FOUND);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_ends_open_streams() {
        let server = SseServer::spawn_local(math::registry()).await.unwrap();
        let spec = ProviderSpec::sse("math", &server.url());
        let transport = SseTransport::connect(&spec).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), server.shutdown())
            .await
            .expect("shutdown should not wait on open streams");

        let err = transport.request("ping", None).await.unwrap_err();
        assert!(err.to_string().contains("math"), "{err}");
    }
}
