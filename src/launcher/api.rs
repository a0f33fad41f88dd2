//! HTTP surface for the process table.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use tokio::net::TcpListener;

use super::errors::LauncherError;
use super::table::{LaunchRequest, ProcessDetail, ProcessInfo, ProcessTable};

/// Routes under `/api/processes`.
pub fn router(table: Arc<ProcessTable>) -> Router {
    Router::new()
        .route("/api/processes", get(list_processes).post(create_process))
        .route(
            "/api/processes/{id}",
            get(get_process).delete(terminate_process),
        )
        .route("/api/processes/{id}/stream", get(stream_process))
        .with_state(table)
}

async fn create_process(
    State(table): State<Arc<ProcessTable>>,
    Json(request): Json<LaunchRequest>,
) -> Result<(StatusCode, Json<ProcessInfo>), LauncherError> {
    let info = table.spawn(request)?;
    Ok((StatusCode::CREATED, Json(info)))
}

async fn list_processes(State(table): State<Arc<ProcessTable>>) -> Json<Vec<ProcessInfo>> {
    Json(table.list())
}

async fn get_process(
    State(table): State<Arc<ProcessTable>>,
    Path(id): Path<String>,
) -> Result<Json<ProcessDetail>, LauncherError> {
    table.get(&id).map(Json)
}

async fn terminate_process(
    State(table): State<Arc<ProcessTable>>,
    Path(id): Path<String>,
) -> Result<StatusCode, LauncherError> {
    table.terminate(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stream_process(
    State(table): State<Arc<ProcessTable>>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, LauncherError> {
    let events = table.events(&id)?.map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(Event::default().event(event.kind()).data(data))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

/// Serve the launcher API on `listener` until `shutdown` resolves, then
/// terminate every launched process.
pub async fn serve<F>(
    table: Arc<ProcessTable>,
    listener: TcpListener,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(Arc::clone(&table));
    tracing::info!(addr = %listener.local_addr()?, "launcher listening");

    let cleanup = Arc::clone(&table);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            tracing::info!("launcher shutting down");
            // Exiting processes end their open streams.
            cleanup.shutdown_all().await;
        })
        .await?;

    table.shutdown_all().await;
    Ok(())
}
