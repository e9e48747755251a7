pub mod billing;
pub mod reconcile;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let reconcile_routes = Router::new()
        .route("/groups/{group_id}", post(reconcile::audit_group))
        .route("/accounts/{account_id}", post(reconcile::audit_account));

    Router::new()
        .route("/health", get(reconcile::health))
        .route("/api/billing/webhook", post(billing::webhook))
        .nest("/api/reconcile", reconcile_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
