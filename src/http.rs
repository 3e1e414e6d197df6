//! HTTP liveness surface for a dispatcher process.
//!
//! Requires the `http` feature. Uses axum for routing.
//!
//! ## Routes
//!
//! - `GET /health`: liveness plus queue depth,
//!   `{ "ok": true, "draining": false, "active_consumers": 1, ... }`.
//!
//! ## Example
//!
//! ```ignore
//! use dialog_rust::{http, Consumer, Dispatcher, FileSink, MemoryQueueStore};
//!
//! let store = MemoryQueueStore::new();
//! let dispatcher = Dispatcher::spawn(store.clone(), || {
//!     Consumer::new(FileSink::new("InsertedCustomers.txt"))
//! });
//!
//! // Serve the probe endpoint next to the dispatcher.
//! http::serve(dispatcher.handle(), store, "0.0.0.0:3000").await?;
//! ```

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::dispatch::DispatcherHandle;
use crate::store::QueueStore;

/// Build an axum `Router` exposing the dispatcher's liveness signal.
pub fn router<Q>(handle: DispatcherHandle, store: Q) -> Router
where
    Q: QueueStore + Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/health", get(health_handler))
        .with_state((handle, store))
}

/// Serve the liveness surface at the given address (e.g. `"0.0.0.0:3000"`).
pub async fn serve<Q>(
    handle: DispatcherHandle,
    store: Q,
    addr: &str,
) -> Result<(), std::io::Error>
where
    Q: QueueStore + Clone + Send + Sync + 'static,
{
    let app = router(handle, store);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

/// `GET /health` returns 200 while the dispatcher is alive, 503 once it has
/// stopped.
async fn health_handler<Q>(
    State((handle, store)): State<(DispatcherHandle, Q)>,
) -> impl IntoResponse
where
    Q: QueueStore + Clone + Send + Sync + 'static,
{
    let depth = store.depth().unwrap_or_default();
    let stats = handle.stats();
    let ok = handle.is_alive();
    let status = if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "ok": ok,
        "draining": handle.is_draining(),
        "active_consumers": handle.active_consumers(),
        "available": depth.available,
        "in_flight": depth.in_flight,
        "dead_letters": depth.dead_lettered,
        "delivered": stats.delivered,
    });
    (status, Json(body))
}
