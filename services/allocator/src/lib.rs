//! The per-run index allocator service.
//!
//! A minimal loopback HTTP service that hands out a strictly increasing
//! integer per `GET /next` call. One instance runs per load-test run; it is
//! the single source of truth for account indices across all workers and
//! VUs, which is what makes cross-process identity assignment collision-free.
//!
//! The counter is an atomic owned by the router state: every `/next` request
//! performs one atomic read-increment, so allocations behave as if totally
//! ordered no matter how many connections are open concurrently.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tokio::sync::oneshot;
use tower_http::catch_panic::CatchPanicLayer;

mod layers;

pub use layers::internal_error_response;

/// Allocator configuration.
#[derive(Clone, Debug)]
pub struct AllocatorConfig {
    /// First index to hand out.
    pub start_index: u64,
    /// Address to bind; defaults to loopback with an OS-chosen port.
    pub listen_addr: SocketAddr,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            start_index: 0,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        }
    }
}

impl AllocatorConfig {
    /// A config starting the counter at `start_index`, binding loopback.
    pub fn with_start_index(start_index: u64) -> Self {
        Self {
            start_index,
            ..Self::default()
        }
    }
}

/// Handle for a running allocator.
pub struct AllocatorHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<eyre::Result<()>>,
    /// The address the service actually bound.
    pub listen_addr: SocketAddr,
}

impl AllocatorHandle {
    /// The base URL workers reach the allocator at.
    pub fn url(&self) -> String {
        format!("http://{}", self.listen_addr)
    }

    /// Stops the service and waits for it to finish. Best-effort: the only
    /// time spent is closing the listener.
    pub async fn shutdown(mut self) -> eyre::Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.await??;
        Ok(())
    }

    /// Waits for the server to finish (blocks until shutdown or error).
    pub async fn join(self) -> eyre::Result<()> {
        self.task.await??;
        Ok(())
    }
}

struct AppState {
    counter: AtomicU64,
}

#[derive(Debug, Serialize)]
struct NextIndexResponse {
    index: u64,
}

/// Starts the allocator and returns a handle carrying the bound address.
///
/// # Errors
/// Fails if the listen address cannot be bound.
pub async fn spawn(config: AllocatorConfig) -> eyre::Result<AllocatorHandle> {
    let state = Arc::new(AppState {
        counter: AtomicU64::new(config.start_index),
    });

    // Anything but the two GET operations is not part of the protocol, so
    // unmatched methods fall back to the same not_found body as unknown paths.
    let app = Router::new()
        .route("/health", get(health).fallback(not_found))
        .route("/next", get(next_index).fallback(not_found))
        .fallback(not_found)
        .layer(CatchPanicLayer::custom(internal_error_response))
        .layer(layers::trace_layer())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    let listen_addr = listener.local_addr()?;

    let (tx, rx) = oneshot::channel::<()>();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = rx.await;
    });
    let task = tokio::spawn(async move { server.await.map_err(Into::into) });

    tracing::info!(%listen_addr, start_index = config.start_index, "index allocator listening");

    Ok(AllocatorHandle {
        shutdown: Some(tx),
        task,
        listen_addr,
    })
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

// The crux invariant lives here: fetch_add is one atomic read-increment, so
// no two calls can observe the same value however requests interleave.
async fn next_index(State(state): State<Arc<AppState>>) -> Json<NextIndexResponse> {
    let index = state.counter.fetch_add(1, Ordering::SeqCst);
    Json(NextIndexResponse { index })
}

async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "not_found" })))
}
