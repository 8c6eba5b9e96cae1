//! HTTP server for the API process.

use std::io;
use std::sync::Arc;

use axum::{
    http::{HeaderValue, Method},
    routing::{get, post},
    Router,
};
use jobgate::config::ApiSettings;
use jobgate::{RevisionId, RevisionSet, SqliteWorkStore};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::routes;

/// Shared state for the API server.
pub struct ApiState {
    pub store: SqliteWorkStore,
    /// Head revision compiled into this binary, reported by `/health`.
    pub expected_revision: Option<RevisionId>,
}

impl ApiState {
    pub fn new(store: SqliteWorkStore) -> Self {
        Self {
            store,
            expected_revision: RevisionSet::embedded().head().cloned(),
        }
    }
}

/// Create the router for the API.
pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(routes::index))
        .route("/health", get(routes::health))
        .route("/v1/stats", get(routes::stats))
        .route("/v1/units", post(routes::create_unit).get(routes::list_units))
        .route("/v1/units/{id}", get(routes::get_unit))
        .route("/v1/units/{id}/attempts", get(routes::unit_attempts))
        .route("/v1/units/{id}/requeue", post(routes::requeue_unit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// CORS for the configured origins. Unparseable origins are skipped.
pub(crate) fn cors(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}

/// Serve the API until `shutdown` is cancelled.
pub async fn run_server(
    settings: &ApiSettings,
    state: ApiState,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let app = create_router(Arc::new(state)).layer(cors(&settings.allowed_origins));
    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!(addr = %addr, "api listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    tracing::info!("api stopped");
    Ok(())
}
