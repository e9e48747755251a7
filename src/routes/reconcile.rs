use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
    Json,
};
use tracing::info;
use uuid::Uuid;

use crate::responses::JsonResponse;
use crate::state::AppState;

// POST /api/reconcile/groups/{group_id}
pub async fn audit_group(
    State(app_state): State<AppState>,
    Path(group_id): Path<Uuid>,
) -> Response {
    match app_state.engine.auditor.audit_resource(group_id).await {
        Ok(report) => {
            info!(%group_id, findings = report.findings.len(), "group audit finished");
            Json(report).into_response()
        }
        Err(err) => JsonResponse::from_engine_error(&err),
    }
}

// POST /api/reconcile/accounts/{account_id}
pub async fn audit_account(
    State(app_state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> Response {
    match app_state.engine.auditor.audit_account(account_id).await {
        Ok(report) => {
            info!(
                %account_id,
                groups = report.groups_checked,
                findings = report.findings.len(),
                "account audit finished"
            );
            Json(report).into_response()
        }
        Err(err) => JsonResponse::from_engine_error(&err),
    }
}

// GET /health
pub async fn health() -> Response {
    JsonResponse::success("ok")
}
