//! REST API Server
//!
//! JSON configuration surface over the ConfigStore. Mutations record the
//! caller's socket address as the audit actor; there is no authentication
//! (documented limitation).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::domain::entities::{
    AvailabilityLog, Backend, BackendSet, ConfigChange, NewAddress, NewBackend, NewBackendSet,
    NewRule, NewSourceDefinition, Rule, SourceDefinition,
};
use crate::domain::ports::ConfigStore;
use crate::error::Error;
use crate::infrastructure::shutdown::ShutdownController;

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = if self.is_client_error() {
            StatusCode::BAD_REQUEST
        } else if matches!(self, Error::NotFound(_)) {
            StatusCode::NOT_FOUND
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("request failed: {}", self);
        }
        (
            status,
            Json(serde_json::json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    store: Arc<dyn ConfigStore>,
}

/// Pagination for the audit log endpoints.
#[derive(Debug, Deserialize)]
pub struct LogQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    100
}

/// Build the API router.
pub fn router(store: Arc<dyn ConfigStore>) -> Router {
    let state = ApiState { store };
    Router::new()
        .route("/api/backends", get(list_backends).post(create_backend))
        .route(
            "/api/backends/:id",
            get(get_backend).put(update_backend).delete(delete_backend),
        )
        .route("/api/backends/:id/addresses", post(create_address))
        .route(
            "/api/addresses/:id",
            put(update_address).delete(delete_address),
        )
        .route(
            "/api/backend-sets",
            get(list_backend_sets).post(create_backend_set),
        )
        .route(
            "/api/backend-sets/:id",
            get(get_backend_set)
                .put(update_backend_set)
                .delete(delete_backend_set),
        )
        .route(
            "/api/source-definitions",
            get(list_source_definitions).post(create_source_definition),
        )
        .route(
            "/api/source-definitions/:id",
            get(get_source_definition)
                .put(update_source_definition)
                .delete(delete_source_definition),
        )
        .route("/api/rules", get(list_rules).post(create_rule))
        .route(
            "/api/rules/:id",
            get(get_rule).put(update_rule).delete(delete_rule),
        )
        .route("/api/logs/config", get(config_logs))
        .route("/api/logs/availability", get(availability_logs))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// REST server over the configuration store.
pub struct ApiServer {
    listen_addr: String,
    store: Arc<dyn ConfigStore>,
}

impl ApiServer {
    pub fn new(listen_addr: String, store: Arc<dyn ConfigStore>) -> Self {
        Self { listen_addr, store }
    }

    /// Serve until the shutdown controller fires, then stop accepting and
    /// drain in-flight requests.
    pub async fn run(&self, shutdown: ShutdownController) -> anyhow::Result<()> {
        let app = router(Arc::clone(&self.store));
        let listener = TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("API server listening on {}", self.listen_addr);

        let mut rx = shutdown.subscribe();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = rx.recv().await;
        })
        .await?;
        Ok(())
    }
}

// ===== backends =====

async fn list_backends(State(state): State<ApiState>) -> Result<Json<Vec<Backend>>, Error> {
    Ok(Json(state.store.list_backends().await?))
}

async fn get_backend(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<Json<Backend>, Error> {
    Ok(Json(state.store.get_backend(id).await?))
}

async fn create_backend(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(draft): Json<NewBackend>,
) -> Result<(StatusCode, Json<Backend>), Error> {
    let backend = state.store.create_backend(draft, &addr.to_string()).await?;
    Ok((StatusCode::CREATED, Json(backend)))
}

async fn update_backend(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<i64>,
    Json(draft): Json<NewBackend>,
) -> Result<Json<Backend>, Error> {
    let backend = state
        .store
        .update_backend(id, draft, &addr.to_string())
        .await?;
    Ok(Json(backend))
}

async fn delete_backend(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<i64>,
) -> Result<StatusCode, Error> {
    state.store.delete_backend(id, &addr.to_string()).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ===== addresses =====

async fn create_address(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(backend_id): Path<i64>,
    Json(draft): Json<NewAddress>,
) -> Result<(StatusCode, Json<crate::domain::entities::Address>), Error> {
    let address = state
        .store
        .create_address(backend_id, draft, &addr.to_string())
        .await?;
    Ok((StatusCode::CREATED, Json(address)))
}

async fn update_address(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<i64>,
    Json(draft): Json<NewAddress>,
) -> Result<Json<crate::domain::entities::Address>, Error> {
    let address = state
        .store
        .update_address(id, draft, &addr.to_string())
        .await?;
    Ok(Json(address))
}

async fn delete_address(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<i64>,
) -> Result<StatusCode, Error> {
    state.store.delete_address(id, &addr.to_string()).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ===== backend sets =====

async fn list_backend_sets(State(state): State<ApiState>) -> Result<Json<Vec<BackendSet>>, Error> {
    Ok(Json(state.store.list_backend_sets().await?))
}

async fn get_backend_set(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<Json<BackendSet>, Error> {
    Ok(Json(state.store.get_backend_set(id).await?))
}

async fn create_backend_set(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(draft): Json<NewBackendSet>,
) -> Result<(StatusCode, Json<BackendSet>), Error> {
    let set = state
        .store
        .create_backend_set(draft, &addr.to_string())
        .await?;
    Ok((StatusCode::CREATED, Json(set)))
}

async fn update_backend_set(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<i64>,
    Json(draft): Json<NewBackendSet>,
) -> Result<Json<BackendSet>, Error> {
    let set = state
        .store
        .update_backend_set(id, draft, &addr.to_string())
        .await?;
    Ok(Json(set))
}

async fn delete_backend_set(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<i64>,
) -> Result<StatusCode, Error> {
    state.store.delete_backend_set(id, &addr.to_string()).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ===== source definitions =====

async fn list_source_definitions(
    State(state): State<ApiState>,
) -> Result<Json<Vec<SourceDefinition>>, Error> {
    Ok(Json(state.store.list_source_definitions().await?))
}

async fn get_source_definition(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<Json<SourceDefinition>, Error> {
    Ok(Json(state.store.get_source_definition(id).await?))
}

async fn create_source_definition(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(draft): Json<NewSourceDefinition>,
) -> Result<(StatusCode, Json<SourceDefinition>), Error> {
    let def = state
        .store
        .create_source_definition(draft, &addr.to_string())
        .await?;
    Ok((StatusCode::CREATED, Json(def)))
}

async fn update_source_definition(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<i64>,
    Json(draft): Json<NewSourceDefinition>,
) -> Result<Json<SourceDefinition>, Error> {
    let def = state
        .store
        .update_source_definition(id, draft, &addr.to_string())
        .await?;
    Ok(Json(def))
}

async fn delete_source_definition(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<i64>,
) -> Result<StatusCode, Error> {
    state
        .store
        .delete_source_definition(id, &addr.to_string())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ===== rules =====

async fn list_rules(State(state): State<ApiState>) -> Result<Json<Vec<Rule>>, Error> {
    Ok(Json(state.store.list_rules().await?))
}

async fn get_rule(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<Json<Rule>, Error> {
    Ok(Json(state.store.get_rule(id).await?))
}

async fn create_rule(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(draft): Json<NewRule>,
) -> Result<(StatusCode, Json<Rule>), Error> {
    let rule = state.store.create_rule(draft, &addr.to_string()).await?;
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn update_rule(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<i64>,
    Json(draft): Json<NewRule>,
) -> Result<Json<Rule>, Error> {
    let rule = state
        .store
        .update_rule(id, draft, &addr.to_string())
        .await?;
    Ok(Json(rule))
}

async fn delete_rule(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<i64>,
) -> Result<StatusCode, Error> {
    state.store.delete_rule(id, &addr.to_string()).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ===== audit logs =====

async fn config_logs(
    State(state): State<ApiState>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Vec<ConfigChange>>, Error> {
    Ok(Json(
        state.store.config_changes(query.limit, query.offset).await?,
    ))
}

async fn availability_logs(
    State(state): State<ApiState>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Vec<AvailabilityLog>>, Error> {
    Ok(Json(
        state
            .store
            .availability_logs(query.limit, query.offset)
            .await?,
    ))
}
