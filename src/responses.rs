use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::engine::error::EngineError;

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonResponse {
    pub status: String,
    pub success: bool,
    pub message: String,
    pub code: Option<String>,
}

impl JsonResponse {
    fn error(status: StatusCode, msg: &str, code: Option<&str>) -> Response {
        (
            status,
            Json(JsonResponse {
                status: "error".to_string(),
                success: false,
                message: msg.to_string(),
                code: code.map(str::to_string),
            }),
        )
            .into_response()
    }

    pub fn success(msg: &str) -> Response {
        (
            StatusCode::OK,
            Json(JsonResponse {
                status: "success".to_string(),
                success: true,
                message: msg.to_string(),
                code: None,
            }),
        )
            .into_response()
    }

    pub fn bad_request(msg: &str) -> Response {
        Self::error(StatusCode::BAD_REQUEST, msg, None)
    }

    pub fn not_found(msg: &str) -> Response {
        Self::error(StatusCode::NOT_FOUND, msg, None)
    }

    pub fn conflict(msg: &str) -> Response {
        Self::error(StatusCode::CONFLICT, msg, None)
    }

    /// The caller should retry later.
    pub fn service_unavailable(msg: &str, code: &str) -> Response {
        Self::error(StatusCode::SERVICE_UNAVAILABLE, msg, Some(code))
    }

    /// Maps the engine's error taxonomy onto HTTP: permanent rejections are
    /// 400 so the processor stops redelivering, transient failures are 503.
    pub fn from_engine_error(err: &EngineError) -> Response {
        match err {
            EngineError::PermanentRejection(reason) => {
                Self::error(StatusCode::BAD_REQUEST, &reason.to_string(), Some("rejected"))
            }
            EngineError::NotFound { .. } => Self::not_found(&err.to_string()),
            EngineError::InvalidTransition { .. } => Self::conflict(&err.to_string()),
            EngineError::Store(_) => Self::service_unavailable("store unavailable", "store_unavailable"),
            EngineError::CasExhausted(_) => {
                Self::service_unavailable("too much contention, retry later", "cas_exhausted")
            }
            EngineError::QueueClosed => Self::service_unavailable("engine is shutting down", "queue_closed"),
        }
    }
}
