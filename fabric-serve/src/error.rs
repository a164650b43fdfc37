//! Maps fabric-core collaborator errors onto HTTP status codes and the
//! `{ok:false, error}`/`{success:false, error:{code,message}}` JSON shapes the
//! wire contract promises.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServeError {
    #[error("agent runtime: {0}")]
    Agent(#[from] fabric_core::AgentError),
    #[error("lpt callback: {0}")]
    Lpt(#[from] fabric_core::LptError),
    #[error("session store: {0}")]
    Session(#[from] fabric_core::SessionStoreError),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unauthorized")]
    Unauthorized,
}

impl IntoResponse for ServeError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ServeError::BadRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_ARGS"),
            ServeError::Unauthorized => (StatusCode::UNAUTHORIZED, "AUTH_FAILED"),
            ServeError::Agent(_) | ServeError::Lpt(_) | ServeError::Session(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL")
            }
        };
        tracing::warn!(error = %self, code, "request failed");
        let body = Json(json!({
            "ok": false,
            "success": false,
            "error": {"code": code, "message": self.to_string()},
        }));
        (status, body).into_response()
    }
}
