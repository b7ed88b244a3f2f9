//! HTTP host for the command-processing pipeline.
//!
//! Wires the stores, the [`CommandService`] and a sample [`note::Note`]
//! aggregate behind an axum router with structured logging (tracing) and
//! Prometheus metrics.

pub mod config;
pub mod error;
pub mod note;
pub mod publisher;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post, put};
use event_store::{
    CommandStore, EventStore, InMemoryCommandStore, InMemoryEventStore,
    InMemoryPublishProgressStore, InMemorySnapshotStore, PostgresStore, PublishProgressStore,
    SnapshotStore,
};
use metrics_exporter_prometheus::PrometheusHandle;
use processing::{CommandService, ProcessingConfig};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use publisher::TracingEventPublisher;

/// The durable collaborators of one node.
#[derive(Clone)]
pub struct Stores {
    pub events: Arc<dyn EventStore>,
    pub commands: Arc<dyn CommandStore>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub progress: Arc<dyn PublishProgressStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            events: Arc::new(InMemoryEventStore::new()),
            commands: Arc::new(InMemoryCommandStore::new()),
            snapshots: Arc::new(InMemorySnapshotStore::new()),
            progress: Arc::new(InMemoryPublishProgressStore::new()),
        }
    }

    /// All four stores backed by one PostgreSQL pool.
    pub fn postgres(store: PostgresStore) -> Self {
        let store = Arc::new(store);
        Self {
            events: store.clone(),
            commands: store.clone(),
            snapshots: store.clone(),
            progress: store,
        }
    }
}

/// Builds the command service with every aggregate the node hosts.
pub fn create_service(stores: Stores, config: ProcessingConfig) -> CommandService {
    CommandService::builder(stores.events, stores.commands)
        .config(config)
        .snapshot_store(stores.snapshots)
        .progress_store(stores.progress)
        .publisher(Arc::new(TracingEventPublisher))
        .aggregate::<note::Note>(note::note_handlers())
        .build()
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(service: CommandService, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::system::metrics))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::system::health))
        .route("/stats", get(routes::system::stats))
        .route(
            "/aggregates/{aggregate_type}/{id}/rebuild",
            post(routes::aggregates::rebuild),
        )
        .route("/notes", post(routes::notes::create))
        .route("/notes/{id}", get(routes::notes::get))
        .route("/notes/{id}/title", put(routes::notes::change_title))
        .with_state(service)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
