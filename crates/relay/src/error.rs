// HTTP error envelope and per-request correlation ids for the relay.

use std::future::Future;

use axum::{
    http::{header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationFailed,
    UpgradeRequired,
    NotFound,
    InternalError,
}

impl ErrorCode {
    pub const fn status(self) -> StatusCode {
        match self {
            Self::ValidationFailed => StatusCode::BAD_REQUEST,
            Self::UpgradeRequired => StatusCode::UPGRADE_REQUIRED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Only server faults are worth retrying as-is.
    pub const fn retryable(self) -> bool {
        matches!(self, Self::InternalError)
    }
}

/// Error returned by relay HTTP routes, rendered as
/// `{"error": {code, message, retryable, request_id, details}}`.
#[derive(Debug, Clone)]
pub struct RelayError {
    code: ErrorCode,
    message: String,
    details: Map<String, Value>,
}

#[derive(Serialize)]
struct Envelope<'a> {
    error: EnvelopeBody<'a>,
}

#[derive(Serialize)]
struct EnvelopeBody<'a> {
    code: ErrorCode,
    message: &'a str,
    retryable: bool,
    request_id: Option<&'a str>,
    details: &'a Map<String, Value>,
}

impl RelayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: Map::new() }
    }

    pub fn invalid_shard_id(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, reason).with_detail("field", "shard_id")
    }

    pub fn not_found() -> Self {
        Self::new(ErrorCode::NotFound, "no such route")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_owned(), value.into());
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let request_id = current_request_id();
        let envelope = Envelope {
            error: EnvelopeBody {
                code: self.code,
                message: &self.message,
                retryable: self.code.retryable(),
                request_id: request_id.as_deref(),
                details: &self.details,
            },
        };
        let mut response = (self.code.status(), Json(envelope)).into_response();
        if let Some(request_id) = &request_id {
            attach_request_id_header(&mut response, request_id);
        }
        response
    }
}

/// Run `future` with `request_id` visible to `current_request_id`.
pub async fn with_request_id_scope<F>(request_id: String, future: F) -> F::Output
where
    F: Future,
{
    REQUEST_ID.scope(request_id, future).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

/// Reuse the caller's `x-request-id` when it is non-blank, else mint one.
pub fn request_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    if let Ok(header) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header);
    }
}

#[cfg(test)]
mod tests {
    use axum::{body::to_bytes, response::IntoResponse};

    use super::*;

    async fn envelope(response: Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn internal_error_picks_up_scoped_request_id() {
        let response = with_request_id_scope("req-7".to_owned(), async {
            RelayError::internal("room task crashed").into_response()
        })
        .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers()[REQUEST_ID_HEADER], "req-7");
        let body = envelope(response).await;
        assert_eq!(body["error"]["code"], "INTERNAL_ERROR");
        assert_eq!(body["error"]["message"], "room task crashed");
        assert_eq!(body["error"]["retryable"], true);
        assert_eq!(body["error"]["request_id"], "req-7");
        assert_eq!(body["error"]["details"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn invalid_shard_id_names_the_field() {
        let response = RelayError::invalid_shard_id("shard id must not be empty").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response.headers().get(REQUEST_ID_HEADER).is_none());

        let body = envelope(response).await;
        assert_eq!(body["error"]["code"], "VALIDATION_FAILED");
        assert_eq!(body["error"]["retryable"], false);
        assert_eq!(body["error"]["details"]["field"], "shard_id");
        assert!(body["error"]["request_id"].is_null());
    }

    #[test]
    fn codes_map_to_statuses() {
        assert_eq!(ErrorCode::UpgradeRequired.status(), StatusCode::UPGRADE_REQUIRED);
        assert!(!ErrorCode::NotFound.retryable());
    }

    #[test]
    fn blank_request_id_header_is_replaced() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("   "));
        let minted = request_id_from_headers_or_generate(&headers);
        assert!(Uuid::parse_str(&minted).is_ok());

        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static(" client-42 "));
        assert_eq!(request_id_from_headers_or_generate(&headers), "client-42");
    }
}
