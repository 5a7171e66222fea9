//! Uniform `{code, message, data}` REST envelope.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// REST response envelope.
#[derive(Clone, Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    /// HTTP-style status code.
    pub code: u16,
    /// `"success"` or a short failure description.
    pub message: String,
    /// Payload; `null` on failure.
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    /// `200 success` wrapping `data`.
    pub fn success(data: T) -> Self {
        Self {
            code: StatusCode::OK.as_u16(),
            message: "success".into(),
            data: Some(data),
        }
    }

    /// Failure with no payload.
    pub fn failure(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code: status.as_u16(),
            message: message.into(),
            data: None,
        }
    }
}

impl ApiResponse<()> {
    /// Envelope for rejected agent handshakes.
    pub fn unauthorized() -> Self {
        Self::failure(StatusCode::UNAUTHORIZED, "unauthorized connection")
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_shape() {
        let json = serde_json::to_value(ApiResponse::success(vec![1, 2])).unwrap();
        assert_eq!(json, serde_json::json!({"code": 200, "message": "success", "data": [1, 2]}));
    }

    #[test]
    fn unauthorized_shape() {
        let json = serde_json::to_value(ApiResponse::unauthorized()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"code": 401, "message": "unauthorized connection", "data": null})
        );
    }

    #[test]
    fn status_follows_code() {
        let resp = ApiResponse::unauthorized().into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
