use std::sync::Arc;

use serde::{Deserialize, Serialize};
use shuttle_axum::axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use tower_http::cors::CorsLayer;

use crate::engine::{ColumnView, SubscriptionHealth, SyncEngine};
use crate::sync::error::EngineError;
use crate::sync::merger::ColumnFilters;
use crate::sync::scheduler::CycleReport;
use crate::sync::types::{ColumnId, Item, RequestModel, SubscriptionId};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/columns", get(list_columns).post(create_column))
        .route("/columns/{id}", get(get_column).delete(delete_column))
        .route("/columns/{id}/filters", put(set_filters))
        .route("/columns/{id}/subscriptions", post(add_subscription))
        .route(
            "/columns/{id}/subscriptions/{sub}",
            delete(delete_subscription),
        )
        .route("/columns/{id}/refresh", post(refresh_column))
        .route("/columns/{id}/load-more", post(load_more))
        .route("/columns/{id}/visible", post(column_visible))
        .route("/columns/{id}/read-all", post(mark_all_read))
        .route("/columns/{id}/clear", post(clear_column))
        .route("/columns/{id}/items/{item}/{action}", post(item_action))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

/* ----------------------------
Errors
---------------------------- */

pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::UnknownColumn(_)
            | EngineError::UnknownSubscription { .. }
            | EngineError::UnknownItem { .. } => StatusCode::NOT_FOUND,
            EngineError::EmptyColumn | EngineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        };
        let body = ErrorBody {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/* ----------------------------
Payloads
---------------------------- */

#[derive(Deserialize)]
struct CreateColumnReq {
    requests: Vec<RequestModel>,
    #[serde(default)]
    filters: ColumnFilters,
}

#[derive(Serialize)]
struct IdOut<T> {
    id: T,
}

#[derive(Serialize)]
struct ItemOut<'a> {
    #[serde(flatten)]
    item: &'a Item,
    is_read: bool,
    is_saved: bool,
}

#[derive(Serialize)]
struct ColumnOut<'a> {
    column: &'a ColumnId,
    filters: &'a ColumnFilters,
    can_fetch_more: bool,
    items: Vec<ItemOut<'a>>,
    subscriptions: &'a [SubscriptionHealth],
}

impl<'a> From<&'a ColumnView> for ColumnOut<'a> {
    fn from(v: &'a ColumnView) -> Self {
        Self {
            column: &v.column,
            filters: &v.filters,
            can_fetch_more: v.can_fetch_more,
            items: v
                .items
                .iter()
                .map(|item| ItemOut {
                    item,
                    is_read: item.is_read(),
                    is_saved: item.is_saved(),
                })
                .collect(),
            subscriptions: &v.subscriptions,
        }
    }
}

#[derive(Deserialize)]
struct ViewQuery {
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct RefreshQuery {
    #[serde(default)]
    force: bool,
}

#[derive(Serialize)]
struct ChangedOut {
    changed: bool,
}

/* ----------------------------
Handlers
---------------------------- */

async fn list_columns(State(state): State<AppState>) -> Json<Vec<ColumnId>> {
    Json(state.engine.column_ids())
}

async fn create_column(
    State(state): State<AppState>,
    Json(body): Json<CreateColumnReq>,
) -> ApiResult<(StatusCode, Json<IdOut<ColumnId>>)> {
    let id = state.engine.create_column(body.requests, body.filters)?;
    Ok((StatusCode::CREATED, Json(IdOut { id })))
}

async fn get_column(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<ViewQuery>,
) -> ApiResult<Response> {
    let view = state
        .engine
        .get_column_view(&ColumnId::from(id), q.limit)?;
    Ok(Json(ColumnOut::from(&view)).into_response())
}

async fn delete_column(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.engine.delete_column(&ColumnId::from(id))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_filters(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(filters): Json<ColumnFilters>,
) -> ApiResult<Json<ColumnFilters>> {
    let filters = state
        .engine
        .set_column_filters(&ColumnId::from(id), filters)?;
    Ok(Json(filters))
}

async fn add_subscription(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RequestModel>,
) -> ApiResult<(StatusCode, Json<IdOut<SubscriptionId>>)> {
    let sub = state
        .engine
        .add_column_subscription(&ColumnId::from(id), request)?;
    Ok((StatusCode::CREATED, Json(IdOut { id: sub })))
}

async fn delete_subscription(
    State(state): State<AppState>,
    Path((id, sub)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state
        .engine
        .delete_column_subscription(&ColumnId::from(id), &SubscriptionId::from(sub))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn refresh_column(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<RefreshQuery>,
) -> ApiResult<Json<Vec<CycleReport>>> {
    let reports = state
        .engine
        .refresh_column(&ColumnId::from(id), q.force)
        .await?;
    Ok(Json(reports))
}

async fn load_more(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<CycleReport>>> {
    let reports = state.engine.load_more(&ColumnId::from(id)).await?;
    Ok(Json(reports))
}

#[derive(Serialize)]
struct VisibleOut {
    started: usize,
}

async fn column_visible(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<VisibleOut>> {
    let started = state.engine.column_visible(&ColumnId::from(id))?;
    Ok(Json(VisibleOut { started }))
}

#[derive(Serialize)]
struct MarkedOut {
    marked: usize,
}

async fn mark_all_read(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<MarkedOut>> {
    let marked = state.engine.mark_all_read(&ColumnId::from(id))?;
    Ok(Json(MarkedOut { marked }))
}

#[derive(Serialize)]
struct ClearedOut {
    cleared_at: chrono::DateTime<chrono::Utc>,
}

async fn clear_column(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ClearedOut>> {
    let cleared_at = state.engine.clear_column(&ColumnId::from(id))?;
    Ok(Json(ClearedOut { cleared_at }))
}

async fn item_action(
    State(state): State<AppState>,
    Path((id, item, action)): Path<(String, String, String)>,
) -> Result<Json<ChangedOut>, Response> {
    let column = ColumnId::from(id);
    let result = match action.as_str() {
        "read" => state.engine.mark_read(&column, &item),
        "unread" => state.engine.mark_unread(&column, &item),
        "save" => state.engine.save_item(&column, &item, true),
        "unsave" => state.engine.save_item(&column, &item, false),
        other => {
            let body = ErrorBody {
                error: format!("unknown item action `{other}`"),
            };
            return Err((StatusCode::NOT_FOUND, Json(body)).into_response());
        }
    };
    match result {
        Ok(changed) => Ok(Json(ChangedOut { changed })),
        Err(e) => Err(ApiError(e).into_response()),
    }
}
