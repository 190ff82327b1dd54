use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::device::Device;

/// Failures talking to the sensor source or the actuator gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("gateway returned HTTP {0}")]
    Status(u16),

    #[error("gateway rejected command: {0}")]
    Rejected(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),
}

/// Failures surfaced to whoever asked for an action (tick, operator, timer).
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("{device} command failed: {cause}")]
    Gateway {
        device: Device,
        #[source]
        cause: GatewayError,
    },

    #[error("unknown conflict '{0}'")]
    UnknownConflict(String),

    #[error("{0} does not accept that command")]
    InvalidCommand(Device),
}

impl ActionError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ActionError::Gateway {
                cause: GatewayError::Timeout(_),
                ..
            } => StatusCode::GATEWAY_TIMEOUT,
            ActionError::Gateway { .. } => StatusCode::BAD_GATEWAY,
            ActionError::UnknownConflict(_) => StatusCode::NOT_FOUND,
            ActionError::InvalidCommand(_) => StatusCode::BAD_REQUEST,
        }
    }
}

/// Errors returned by the operator API.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("invalid preset")]
    Invalid(Vec<String>),

    #[error(transparent)]
    Action(#[from] ActionError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, json!({ "error": m })),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, json!({ "error": m })),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, json!({ "error": m })),
            ApiError::Invalid(problems) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                json!({ "error": self.to_string(), "problems": problems }),
            ),
            ApiError::Action(e) => (e.status_code(), json!({ "error": e.to_string() })),
            ApiError::Internal(e) => {
                tracing::error!("internal error: {e:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "internal server error" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway(cause: GatewayError) -> ActionError {
        ActionError::Gateway {
            device: Device::Fan,
            cause,
        }
    }

    #[test]
    fn action_errors_map_to_http_status() {
        assert_eq!(
            gateway(GatewayError::Timeout(Duration::from_secs(5))).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            gateway(GatewayError::Status(503)).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ActionError::UnknownConflict("c-9".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ActionError::InvalidCommand(Device::Cover).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn gateway_error_message_names_device_and_cause() {
        let msg = gateway(GatewayError::Rejected("relay stuck".into())).to_string();
        assert_eq!(msg, "fan command failed: gateway rejected command: relay stuck");
    }

    #[test]
    fn internal_errors_hide_details() {
        let resp = ApiError::from(anyhow::anyhow!("disk full")).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let resp = ApiError::Invalid(vec!["bad".into()]).into_response();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
