//! Uniform HTTP failure envelope:
//! `{success:false, error:{code,message,details?}, timestamp}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};

use vox_domain::Error;

pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn validation(message: impl Into<String>, fields: Vec<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "validation",
            message: message.into(),
            details: Some(json!({ "fields": fields })),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", what)
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::Validation { message, fields } => ApiError::validation(message, fields),
            Error::Auth(m) => ApiError::new(StatusCode::UNAUTHORIZED, "auth_failure", m),
            Error::NotFound(m) => ApiError::new(StatusCode::NOT_FOUND, "not_found", m),
            Error::Conflict(m) => ApiError::new(StatusCode::CONFLICT, "conflict", m),
            Error::RateLimited => ApiError::new(
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "rate limit exceeded",
            ),
            // Transient failures surface only after the retry budget.
            Error::Transient(m) | Error::Unavailable(m) => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "transient", m)
            }
            Error::Provider { provider, reason } => ApiError::new(
                StatusCode::BAD_GATEWAY,
                "provider_failure",
                format!("{provider}: {reason}"),
            ),
            other => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                other.to_string(),
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut error = json!({
            "code": self.code,
            "message": self.message,
        });
        if let Some(details) = self.details {
            error["details"] = details;
        }
        (
            self.status,
            Json(json!({
                "success": false,
                "error": error,
                "timestamp": chrono::Utc::now(),
            })),
        )
            .into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_errors_map_to_statuses() {
        let cases = [
            (Error::validation("bad phone"), StatusCode::BAD_REQUEST),
            (Error::Auth("nope".into()), StatusCode::UNAUTHORIZED),
            (Error::NotFound("call".into()), StatusCode::NOT_FOUND),
            (Error::Conflict("active".into()), StatusCode::CONFLICT),
            (Error::RateLimited, StatusCode::TOO_MANY_REQUESTS),
            (Error::Transient("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (
                Error::Provider {
                    provider: "telephony".into(),
                    reason: "insufficient_funds".into(),
                },
                StatusCode::BAD_GATEWAY,
            ),
        ];
        for (err, status) in cases {
            let resp = ApiError::from(err).into_response();
            assert_eq!(resp.status(), status);
        }
    }
}
