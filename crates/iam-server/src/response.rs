//! JSON response envelope and API errors.
//!
//! Every response body is `{code, message, data}`. `code` is 0 on success.

use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use iam_core::CoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::membership::MembershipError;

pub const CODE_OK: i64 = 0;
pub const CODE_BAD_REQUEST: i64 = 1901400;
pub const CODE_SYSTEM_ERROR: i64 = 1901500;

/// Message returned for every server-side failure.
pub const SYSTEM_ERROR_MESSAGE: &str = "system error";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub code: i64,
    pub message: String,
    pub data: T,
}

/// `{code: 0, message: "ok", data}`.
pub fn success<T: Serialize>(data: T) -> Response {
    Json(Envelope {
        code: CODE_OK,
        message: "ok".to_string(),
        data,
    })
    .into_response()
}

/// `{code: 0, message: "ok", data: {}}`.
pub fn ok() -> Response {
    success(Value::Object(serde_json::Map::new()))
}

/// API errors.
#[derive(Debug)]
pub enum ApiError {
    /// Bad request (400).
    BadRequest(String),

    /// Server-side failure (500). The detail is logged, never returned.
    System {
        function: &'static str,
        message: String,
    },
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn system(function: &'static str, err: impl fmt::Display) -> Self {
        Self::System {
            function,
            message: err.to_string(),
        }
    }

    /// Maps a membership failure raised inside handler `function`.
    pub fn from_membership(function: &'static str, err: MembershipError) -> Self {
        match err {
            MembershipError::Validation(e) => e.into(),
            MembershipError::Mutation(e) => Self::system(function, e),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            Self::System { function, message } => write!(f, "{}: {}", function, message),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidInput { field, message } => {
                Self::BadRequest(format!("{field} {message}"))
            }
            CoreError::EmptyBatch => Self::BadRequest("the array should contain at least 1 item".into()),
            CoreError::MissingTenant => Self::BadRequest("tenant id is required".into()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(Envelope {
                    code: CODE_BAD_REQUEST,
                    message,
                    data: Value::Null,
                }),
            )
                .into_response(),
            Self::System { function, message } => {
                tracing::error!(layer = "Handler", function, error = %message, "system error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(Envelope {
                        code: CODE_SYSTEM_ERROR,
                        message: SYSTEM_ERROR_MESSAGE.to_string(),
                        data: Value::Null,
                    }),
                )
                    .into_response()
            }
        }
    }
}
