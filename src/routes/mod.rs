use axum::routing::get;
use axum::Router;

use crate::state::AppState;

pub mod batches;
pub mod bills;
pub mod health;
pub mod payments;
pub mod readings;
pub mod recharges;

pub fn v1_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        .merge(batches::router())
        .merge(bills::router())
        .merge(payments::router())
        .merge(readings::router())
        .merge(recharges::router())
}
