use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use chrono::NaiveDate;
use serde_json::{json, Map, Value};

use crate::{
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::list_rows,
    schemas::{clamp_limit_in_range, validate_input, BulkReadingsInput, ReadingsQuery},
    services::{
        audit::write_audit_log,
        readings::{upsert_bulk, UpsertOutcome},
    },
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/readings/bulk-upsert",
            axum::routing::post(bulk_upsert_readings),
        )
        .route("/readings", axum::routing::get(list_readings))
}

async fn bulk_upsert_readings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<BulkReadingsInput>,
) -> AppResult<Response> {
    let user_id = require_user_id(&state, &headers).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let reading_date = NaiveDate::parse_from_str(payload.reading_date.trim(), "%Y-%m-%d")
        .map_err(|_| AppError::BadRequest("reading_date must be a YYYY-MM-DD date.".to_string()))?;

    for reading in &payload.readings {
        if reading.end_reading < reading.start_reading && reading.per_day_unit.is_none() {
            return Err(AppError::UnprocessableEntity(format!(
                "Connection {}: end reading is below start reading; supply per_day_unit for a meter rollover.",
                reading.connection_id
            )));
        }
        if let Some(urls) = &reading.snapshot_urls {
            for raw in urls {
                url::Url::parse(raw).map_err(|_| {
                    AppError::UnprocessableEntity(format!(
                        "Connection {}: '{raw}' is not a valid snapshot URL.",
                        reading.connection_id
                    ))
                })?;
            }
        }
    }

    let outcome = upsert_bulk(
        pool,
        reading_date,
        &payload.readings,
        payload.allow_update,
        &user_id,
    )
    .await?;

    match outcome {
        UpsertOutcome::Applied { inserted, updated } => {
            write_audit_log(
                state.db_pool.as_ref(),
                Some(&user_id),
                "bulk_upsert",
                "submeter_readings",
                None,
                None,
                Some(json!({
                    "reading_date": payload.reading_date,
                    "inserted": inserted,
                    "updated": updated,
                })),
            )
            .await;

            Ok(Json(json!({
                "reading_date": payload.reading_date,
                "inserted": inserted,
                "updated": updated,
            }))
            .into_response())
        }
        UpsertOutcome::Conflict {
            inserted,
            existing_count,
        } => Ok((
            axum::http::StatusCode::CONFLICT,
            Json(json!({
                "error": format!(
                    "{existing_count} readings already exist for {}. Re-submit with allow_update to overwrite.",
                    payload.reading_date
                ),
                "details": { "existing_count": existing_count, "inserted": inserted },
            })),
        )
            .into_response()),
    }
}

async fn list_readings(
    State(state): State<AppState>,
    Query(query): Query<ReadingsQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let _user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    if let Some(connection_id) = non_empty_opt(query.connection_id.as_deref()) {
        filters.insert("connection_id".to_string(), Value::String(connection_id));
    }
    if let Some(from) = non_empty_opt(query.from.as_deref()) {
        filters.insert("reading_date__gte".to_string(), Value::String(from));
    }
    if let Some(to) = non_empty_opt(query.to.as_deref()) {
        filters.insert("reading_date__lte".to_string(), Value::String(to));
    }

    let rows = list_rows(
        pool,
        "submeter_readings",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 1000),
        0,
        "reading_date",
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
