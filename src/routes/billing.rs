use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use tracing::warn;

use crate::responses::JsonResponse;
use crate::state::AppState;

pub const SIGNATURE_HEADER: &str = "billing-signature";

// POST /api/billing/webhook
pub async fn webhook(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(signature) = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
    else {
        warn!("billing webhook without signature header");
        return JsonResponse::bad_request("Missing Billing-Signature header");
    };

    match app_state.engine.ingestor.ingest(&body, signature).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => JsonResponse::from_engine_error(&err),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        routing::post,
        Router,
    };
    use serde_json::{json, Value};
    use time::OffsetDateTime;
    use tower::ServiceExt;

    use super::*;
    use crate::config::EngineConfig;
    use crate::db::account_repository::AccountRepository;
    use crate::db::mock_db::InMemoryDb;
    use crate::engine::cascade::ChannelCascadeScheduler;
    use crate::engine::{Engine, Repositories};
    use crate::models::account::Tier;
    use crate::services::signature::HmacWebhookVerifier;

    const SECRET: &str = "whsec_route_test";

    fn test_app(db: &InMemoryDb) -> Router {
        let (scheduler, _jobs) = ChannelCascadeScheduler::channel();
        let engine = Engine::new(
            Repositories::in_memory(db),
            Arc::new(HmacWebhookVerifier::new(SECRET, Duration::from_secs(300))),
            Arc::new(scheduler),
            &EngineConfig::default(),
        );
        Router::new()
            .route("/", post(webhook))
            .with_state(AppState::new(engine))
    }

    fn signed_request(body: Vec<u8>) -> Request<Body> {
        let signer = HmacWebhookVerifier::new(SECRET, Duration::from_secs(300));
        let signature = signer.sign(&body, OffsetDateTime::now_utc().unix_timestamp());
        Request::builder()
            .method("POST")
            .uri("/")
            .header("Content-Type", "application/json")
            .header("Billing-Signature", signature)
            .body(Body::from(body))
            .unwrap()
    }

    fn event_body(account_id: uuid::Uuid, kind: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "external_id": "evt_route",
            "account_id": account_id,
            "type": kind,
            "payload": {},
            "observed_at": "2026-10-19T08:00:00Z",
        }))
        .unwrap()
    }

    async fn json_body(res: Response) -> Value {
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn applies_then_reports_duplicate() {
        let db = InMemoryDb::new();
        let account = db.create_account(Tier::Free).await.unwrap();
        let app = test_app(&db);

        let res = app
            .clone()
            .oneshot(signed_request(event_body(account.id, "checkout_completed")))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["status"], "applied");

        let res = app
            .oneshot(signed_request(event_body(account.id, "checkout_completed")))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["status"], "already_processed");
    }

    #[tokio::test]
    async fn bad_signature_is_bad_request() {
        let db = InMemoryDb::new();
        let account = db.create_account(Tier::Free).await.unwrap();
        let req = Request::builder()
            .method("POST")
            .uri("/")
            .header("Billing-Signature", "t=1,v1=abc")
            .body(Body::from(event_body(account.id, "checkout_completed")))
            .unwrap();

        let res = test_app(&db).oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let stored = db.find_account(account.id).await.unwrap().unwrap();
        assert_eq!(stored.tier, Tier::Free);
    }

    #[tokio::test]
    async fn missing_header_is_bad_request() {
        let db = InMemoryDb::new();
        let req = Request::builder()
            .method("POST")
            .uri("/")
            .body(Body::from("{}"))
            .unwrap();
        let res = test_app(&db).oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn store_outage_asks_for_redelivery() {
        let db = InMemoryDb::new();
        let account = db.create_account(Tier::Free).await.unwrap();
        db.set_billing_store_down(true);

        let res = test_app(&db)
            .oneshot(signed_request(event_body(account.id, "subscription_deleted")))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
