//! The analyst-facing web application.

use crate::auth::AuthError;
use crate::error::PredictError;
use crate::manager::ServeError;
use crate::util::truncate_message;
use actix_web::error::JsonPayloadError;
use actix_web::http::header::ContentType;
use actix_web::http::StatusCode;
use actix_web::{HttpRequest, HttpResponse};
use std::collections::HashMap;
use tracing::{error, warn};

pub mod protocol;
pub mod routes;

/// Returned for every pipeline failure; details stay in the logs
pub const PREDICTION_FAILED: &str = "An error occurred during prediction. Please try again.";

pub const FILE_TOO_LARGE: &str = "File too large. Maximum size is 16MB.";

/// Any failure a route can report, rendered as `{"error": "..."}`
#[derive(Debug)]
pub struct WebError {
    status: StatusCode,
    message: String,
}

impl WebError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        WebError {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "Not found")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for WebError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl actix_web::error::ResponseError for WebError {
    fn error_response(&self) -> HttpResponse {
        let err = HashMap::from([("error", self.message.as_str())]);

        HttpResponse::build(self.status_code())
            .insert_header(ContentType::json())
            .json(err)
    }

    fn status_code(&self) -> StatusCode {
        self.status
    }
}

impl From<PredictError> for WebError {
    fn from(err: PredictError) -> WebError {
        match err {
            PredictError::Validation(err) => {
                WebError::bad_request(format!("Validation error: {err}"))
            }
            PredictError::Pipeline(_) => WebError::internal(PREDICTION_FAILED),
        }
    }
}

impl From<ServeError> for WebError {
    fn from(err: ServeError) -> WebError {
        match err {
            ServeError::Busy => WebError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
            ServeError::Worker(msg) => {
                error!("worker failure: {}", truncate_message(&msg));
                WebError::internal(PREDICTION_FAILED)
            }
            ServeError::Predict(err) => err.into(),
        }
    }
}

impl From<AuthError> for WebError {
    fn from(err: AuthError) -> WebError {
        match err {
            AuthError::MissingToken => WebError::bad_request("ID token missing"),
            AuthError::InvalidToken(_) => {
                WebError::new(StatusCode::UNAUTHORIZED, err.to_string())
            }
            AuthError::Unauthenticated => WebError::new(StatusCode::UNAUTHORIZED, "Unauthorized"),
            AuthError::Upstream(_) | AuthError::NotConfigured => {
                error!("identity verification unavailable: {err}");
                WebError::new(StatusCode::BAD_GATEWAY, "Identity provider unavailable")
            }
        }
    }
}

impl From<serde_json::Error> for WebError {
    fn from(err: serde_json::Error) -> WebError {
        error!("serialization failed: {err}");
        WebError::internal("Internal server error")
    }
}

/// Turn JSON extractor failures into the JSON error shape
pub fn json_error(err: JsonPayloadError, req: &HttpRequest) -> actix_web::Error {
    let web_err = match &err {
        JsonPayloadError::Overflow { .. } | JsonPayloadError::OverflowKnownLength { .. } => {
            WebError::new(StatusCode::PAYLOAD_TOO_LARGE, FILE_TOO_LARGE)
        }
        JsonPayloadError::ContentType => {
            WebError::bad_request("Content-Type must be application/json")
        }
        _ => WebError::bad_request(format!("Invalid JSON: {err}")),
    };
    warn!("rejected body on {}: {err}", req.path());
    web_err.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ModelError, PipelineError, ValidationError};
    use actix_web::ResponseError;

    #[test]
    fn test_status_mapping() {
        let validation: WebError = PredictError::from(ValidationError::MissingPrefix).into();
        assert_eq!(validation.status_code(), StatusCode::BAD_REQUEST);
        assert!(validation.message().starts_with("Validation error: "));

        let pipeline: WebError =
            PredictError::from(PipelineError::Segmentation(ModelError::NoOutput)).into();
        assert_eq!(pipeline.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(pipeline.message(), PREDICTION_FAILED);

        let busy: WebError = ServeError::Busy.into();
        assert_eq!(busy.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let invalid: WebError = AuthError::InvalidToken("expired".into()).into();
        assert_eq!(invalid.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(invalid.message(), "Invalid ID token: expired");

        let missing: WebError = AuthError::MissingToken.into();
        assert_eq!(missing.status_code(), StatusCode::BAD_REQUEST);
    }
}
