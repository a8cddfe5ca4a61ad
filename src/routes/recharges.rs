use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Map, Value};

use crate::{
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::list_rows,
    schemas::{clamp_limit_in_range, RechargesQuery},
    services::status::RechargeStatus,
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new().route("/recharges", axum::routing::get(list_recharges))
}

async fn list_recharges(
    State(state): State<AppState>,
    Query(query): Query<RechargesQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let _user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    if let Some(status) = non_empty_opt(query.status.as_deref()) {
        let status = RechargeStatus::parse(&status)?;
        filters.insert(
            "status".to_string(),
            Value::String(status.as_str().to_string()),
        );
    }
    if let Some(connection_id) = non_empty_opt(query.connection_id.as_deref()) {
        filters.insert("connection_id".to_string(), Value::String(connection_id));
    }
    if let Some(batch_id) = non_empty_opt(query.batch_id.as_deref()) {
        filters.insert("batch_id".to_string(), Value::String(batch_id));
    }

    let rows = list_rows(
        pool,
        "recharges",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 1000),
        0,
        "recharge_date",
        false,
    )
    .await?;

    Ok(Json(json!({ "data": rows })))
}

fn db_pool(state: &AppState) -> AppResult<&sqlx::PgPool> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })
}

fn non_empty_opt(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToOwned::to_owned)
}
