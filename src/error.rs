//! Error codes and JSON error responses for the HTTP surfaces

use crate::control::ControlError;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

pub const ERROR_HEADER: &str = "X-Plugrest-Error";

/// Error codes for API errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorCode {
    /// Missing or wrong bearer token
    Unauthorized,
    /// No route for the request
    NotFound,
    /// Unknown or failed isolated app
    AppNotFound,
    /// Action name not recognised
    UnknownAction,
    /// Stop requested for an app with no live process
    AppNotRunning,
    /// A lifecycle workflow aborted part way
    ActionFailed,
    /// Malformed request
    BadRequest,
    InternalError,
}

impl ApiErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiErrorCode::NotFound => StatusCode::NOT_FOUND,
            ApiErrorCode::AppNotFound => StatusCode::NOT_FOUND,
            ApiErrorCode::UnknownAction => StatusCode::BAD_REQUEST,
            ApiErrorCode::AppNotRunning => StatusCode::CONFLICT,
            ApiErrorCode::ActionFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ApiErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ApiErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The error code as sent in the X-Plugrest-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ApiErrorCode::Unauthorized => "UNAUTHORIZED",
            ApiErrorCode::NotFound => "NOT_FOUND",
            ApiErrorCode::AppNotFound => "APP_NOT_FOUND",
            ApiErrorCode::UnknownAction => "UNKNOWN_ACTION",
            ApiErrorCode::AppNotRunning => "APP_NOT_RUNNING",
            ApiErrorCode::ActionFailed => "ACTION_FAILED",
            ApiErrorCode::BadRequest => "BAD_REQUEST",
            ApiErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl From<&ControlError> for ApiErrorCode {
    fn from(err: &ControlError) -> Self {
        match err {
            ControlError::NotFound(_) => ApiErrorCode::AppNotFound,
            ControlError::UnknownAction(_) => ApiErrorCode::UnknownAction,
            ControlError::NotRunning(_) => ApiErrorCode::AppNotRunning,
            ControlError::Failed { .. } => ApiErrorCode::ActionFailed,
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub code: ApiErrorCode,
    /// Human-readable error message
    pub error: String,
    pub status: u16,
    /// Extra context, e.g. the steps a failed workflow completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(code: ApiErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            status: code.status_code().as_u16(),
            code,
            error: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"success":false,"code":"{}","error":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.error.replace('\"', "\\\""),
                self.status
            )
        })
    }

    pub fn into_response(self) -> Response<Full<Bytes>> {
        let status = self.code.status_code();
        let header = self.code.as_header_value();
        let body = self.to_json();

        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = status;
        let headers = response.headers_mut();
        headers.insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("application/json"),
        );
        headers.insert(ERROR_HEADER, hyper::header::HeaderValue::from_static(header));
        response
    }
}

impl From<&ControlError> for ErrorResponse {
    fn from(err: &ControlError) -> Self {
        let response = ErrorResponse::new(ApiErrorCode::from(err), err.to_string());
        match err {
            ControlError::Failed {
                app,
                action,
                steps,
                reason,
            } => response.with_details(serde_json::json!({
                "app": app,
                "action": action,
                "steps_completed": steps,
                "reason": reason,
            })),
            _ => response,
        }
    }
}

/// Create a JSON error response with X-Plugrest-Error header
pub fn json_error_response(
    code: ApiErrorCode,
    message: impl Into<String>,
) -> Response<Full<Bytes>> {
    ErrorResponse::new(code, message).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{Action, Step};

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(ApiErrorCode::AppNotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ApiErrorCode::UnknownAction.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiErrorCode::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiErrorCode::AppNotRunning.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            ApiErrorCode::ActionFailed.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ApiErrorCode::AppNotFound, "isolated app 'ghost' not found");
        let json = error.to_json();

        assert!(json.contains("\"success\":false"));
        assert!(json.contains("\"code\":\"APP_NOT_FOUND\""));
        assert!(json.contains("\"error\":\"isolated app 'ghost' not found\""));
        assert!(json.contains("\"status\":404"));
        assert!(!json.contains("details"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ApiErrorCode::Unauthorized, "Unauthorized");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(response.headers().get(ERROR_HEADER).unwrap(), "UNAUTHORIZED");
    }

    #[test]
    fn test_control_error_mapping() {
        let err = ControlError::UnknownAction("explode".into());
        assert_eq!(ApiErrorCode::from(&err), ApiErrorCode::UnknownAction);

        let err = ControlError::Failed {
            app: "worker".into(),
            action: Action::RebuildEnvironment,
            steps: vec![Step::VenvCleared, Step::VenvCreated],
            reason: "No matching distribution".into(),
        };
        let body: serde_json::Value =
            serde_json::from_str(&ErrorResponse::from(&err).to_json()).unwrap();
        assert_eq!(body["code"], "ACTION_FAILED");
        assert_eq!(body["status"], 500);
        assert_eq!(body["details"]["action"], "rebuild-environment");
        assert_eq!(
            body["details"]["steps_completed"],
            serde_json::json!(["venv_cleared", "venv_created"])
        );
    }
}
