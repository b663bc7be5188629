use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use anyhow::Context;
use chrono::Utc;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod controller;
mod error;
mod models;
mod pager;
mod projections;
mod store;


use config::Config;
use controller::{RefreshOutcome, SelectionController};
use error::{EngineError, StoreError};
use models::{ApiResponse, CategoryInput, NewRecord, PageInput, RecordInput, SelectionInput};
use store::{RecordStore, SqliteStore};

/// HTTP surface over the record store and the selection controller.
/// Writes go straight to the store; the controller is told afterwards so
/// the snapshot follows.
#[derive(Clone)]
struct AppState {
    store: Arc<SqliteStore>,
    controller: Arc<SelectionController<SqliteStore>>,
}

type ApiError = (StatusCode, Json<ApiResponse>);
type ApiResult = Result<Json<ApiResponse>, ApiError>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = Config::from_args()?;

    let store = Arc::new(
        SqliteStore::open(&config.db_path)
            .with_context(|| format!("failed to open store at {}", config.db_path.display()))?,
    );
    let controller = Arc::new(SelectionController::new(
        Arc::clone(&store),
        config.page_size,
    ));
    if let Err(err) = controller.select_category(None).await {
        warn!(error = %err, "initial selection failed");
    }

    let app = router(AppState {
        store: Arc::clone(&store),
        controller: Arc::clone(&controller),
    });

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!(
        addr = %config.listen,
        db = %config.db_path.display(),
        page_size = config.page_size,
        "server running"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    drop(controller);
    match Arc::try_unwrap(store) {
        Ok(store) => store.close().context("failed to close store")?,
        Err(_) => warn!("store still in use at shutdown, leaving it to drop"),
    }
    info!("server stopped");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("EVENTLOG_LOG")
        .unwrap_or_else(|_| EnvFilter::new("eventlog_api=info,tower_http=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for ctrl-c");
        return;
    }
    info!("shutdown requested");
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/categories", get(list_categories).post(create_category))
        .route("/categories/:id", delete(delete_category))
        .route("/records", post(create_record).delete(clear_records))
        .route("/records/:id", delete(delete_record))
        .route("/selection", post(select_category))
        .route("/selection/page", post(go_to_page))
        .route("/snapshot", get(get_snapshot))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn root() -> &'static str {
    "Event Log API v0.1.0"
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn list_categories(State(state): State<AppState>) -> ApiResult {
    let categories = blocking(&state.store, |store| store.categories()).await?;
    Ok(Json(ApiResponse::success(
        format!("{} categories", categories.len()),
        Some(serde_json::json!(categories)),
    )))
}

async fn create_category(
    State(state): State<AppState>,
    Json(input): Json<CategoryInput>,
) -> ApiResult {
    let name = input.name.trim().to_string();
    if name.is_empty() {
        return Err(failure(StatusCode::BAD_REQUEST, "category name cannot be empty"));
    }

    let category = blocking(&state.store, move |store| store.create_category(&name)).await?;
    info!(category_id = category.id, name = %category.name, "category created");

    // First category after an empty state becomes the selection
    if state.controller.active_filter().await.is_none() {
        if let Err(err) = state.controller.select_category(None).await {
            warn!(error = %err, "selection after category create failed");
        }
    }

    Ok(Json(ApiResponse::success(
        format!("Category created: {}", category.name),
        Some(serde_json::json!(category)),
    )))
}

/// Deleting the active category moves the selection to the default one.
async fn delete_category(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let deleted = blocking(&state.store, move |store| store.delete_category(id)).await?;
    if !deleted {
        return Err(failure(StatusCode::NOT_FOUND, format!("no category with id {id}")));
    }
    info!(category_id = id, "category deleted");

    if state.controller.active_filter().await == Some(id) {
        if let Err(err) = state.controller.select_category(None).await {
            warn!(error = %err, "reselect after category delete failed");
        }
    }

    Ok(Json(ApiResponse::success(
        format!("Category {id} deleted"),
        None,
    )))
}

/// Records a new event. Without a category id or name the record goes to
/// the active category.
async fn create_record(
    State(state): State<AppState>,
    Json(input): Json<RecordInput>,
) -> ApiResult {
    let label = input.label.trim().to_string();
    if label.is_empty() {
        return Err(failure(StatusCode::BAD_REQUEST, "label cannot be empty"));
    }

    let active = state.controller.active_filter().await;
    let record = blocking(&state.store, move |store| {
        let category_id = match (input.category_id, input.category.as_deref()) {
            (Some(id), _) => Some(id),
            (None, Some(name)) => Some(store.category_by_name(name)?.id),
            (None, None) => active,
        };
        store.insert(&NewRecord {
            timestamp: input.timestamp.unwrap_or_else(|| Utc::now().timestamp_millis()),
            label,
            notes: input
                .notes
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty()),
            category_id,
        })
    })
    .await?;
    info!(record_id = record.id, category_id = ?record.category_id, "record created");

    let refreshed = refresh_after_write(&state, record.category_id).await;
    Ok(Json(ApiResponse::success(
        format!("Event logged: {}", record.label),
        Some(serde_json::json!({
            "record": record,
            "refreshed": refreshed,
        })),
    )))
}

async fn delete_record(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let Some(record) = blocking(&state.store, move |store| store.delete(id)).await? else {
        return Err(failure(StatusCode::NOT_FOUND, format!("no record with id {id}")));
    };
    info!(record_id = id, category_id = ?record.category_id, "record deleted");

    let refreshed = refresh_after_write(&state, record.category_id).await;
    Ok(Json(ApiResponse::success(
        format!("Event deleted: {}", record.label),
        Some(serde_json::json!({
            "record": record,
            "refreshed": refreshed,
        })),
    )))
}

/// Drops every record. Only the active selection can be affected by a
/// write, so that is the one refreshed.
async fn clear_records(State(state): State<AppState>) -> ApiResult {
    let removed = blocking(&state.store, |store| store.delete_all_records()).await?;
    info!(removed, "records cleared");

    let active = state.controller.active_filter().await;
    let refreshed = refresh_after_write(&state, active).await;
    Ok(Json(ApiResponse::success(
        format!("{removed} events deleted"),
        Some(serde_json::json!({
            "removed": removed,
            "refreshed": refreshed,
        })),
    )))
}

async fn select_category(
    State(state): State<AppState>,
    Json(input): Json<SelectionInput>,
) -> ApiResult {
    let outcome = state
        .controller
        .select_category(input.category_id)
        .await
        .map_err(engine_failure)?;
    Ok(outcome_response(outcome))
}

async fn go_to_page(State(state): State<AppState>, Json(input): Json<PageInput>) -> ApiResult {
    let outcome = state
        .controller
        .go_to_page(input.direction)
        .await
        .map_err(engine_failure)?;
    Ok(outcome_response(outcome))
}

async fn get_snapshot(State(state): State<AppState>) -> Json<ApiResponse> {
    let view = state.controller.view().await;
    Json(ApiResponse::success(
        format!("{:?}", view.phase).to_lowercase(),
        Some(serde_json::json!(view)),
    ))
}

// Helper functions

/// Tells the controller about a write. A failed refresh does not fail the
/// write; the snapshot is left marked stale instead.
async fn refresh_after_write(state: &AppState, category_id: Option<i64>) -> bool {
    match state.controller.record_mutated(category_id).await {
        Ok(RefreshOutcome::Applied(_)) => true,
        Ok(RefreshOutcome::Superseded | RefreshOutcome::Skipped) => false,
        Err(err) => {
            warn!(error = %err, ?category_id, "refresh after write failed");
            false
        }
    }
}

fn outcome_response(outcome: RefreshOutcome) -> Json<ApiResponse> {
    Json(match outcome {
        RefreshOutcome::Applied(snapshot) => {
            ApiResponse::success("refreshed", Some(serde_json::json!(snapshot)))
        }
        RefreshOutcome::Superseded => ApiResponse::success("superseded by a newer refresh", None),
        RefreshOutcome::Skipped => ApiResponse::success("no refresh needed", None),
    })
}

async fn blocking<T, F>(store: &Arc<SqliteStore>, query: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&SqliteStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = Arc::clone(store);
    match tokio::task::spawn_blocking(move || query(store.as_ref())).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(store_failure(err)),
        Err(err) => {
            error!(error = %err, "store task failed");
            Err(failure(StatusCode::INTERNAL_SERVER_ERROR, "store task failed"))
        }
    }
}

fn failure(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(ApiResponse::error(message)))
}

fn store_failure(err: StoreError) -> ApiError {
    let status = match &err {
        StoreError::UnknownCategory { .. } => StatusCode::NOT_FOUND,
        StoreError::DuplicateCategory(_) => StatusCode::CONFLICT,
        _ => {
            error!(error = %err, "store error");
            StatusCode::SERVICE_UNAVAILABLE
        }
    };
    failure(status, err.to_string())
}

fn engine_failure(err: EngineError) -> ApiError {
    match err {
        EngineError::StoreUnavailable(err) => store_failure(err),
        EngineError::NotReady => failure(StatusCode::CONFLICT, err.to_string()),
        EngineError::UnknownCategory(_) => failure(StatusCode::NOT_FOUND, err.to_string()),
        EngineError::Task(_) => {
            error!(error = %err, "refresh task failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}
