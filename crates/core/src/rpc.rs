use axum::{http::StatusCode, response::IntoResponse, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::SchedulerError;

/// RPC统一响应包
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub code: Option<String>,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T> RpcResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            code: None,
            message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(code: &str, message: String) -> Self {
        Self {
            success: false,
            data: None,
            code: Some(code.to_string()),
            message: Some(message),
            timestamp: Utc::now(),
        }
    }

    /// 客户端拆包, 失败响应还原为对应的错误
    pub fn into_result(self) -> Result<T, SchedulerError> {
        match (self.success, self.data) {
            (true, Some(data)) => Ok(data),
            (true, None) => Err(SchedulerError::Serialization(
                "响应缺少data字段".to_string(),
            )),
            (false, _) => {
                let message = self.message.unwrap_or_default();
                Err(match self.code.as_deref() {
                    Some("SERVER_NOT_READY") => SchedulerError::ServerNotReady { state: message },
                    Some("REGISTER_FAILURE") => SchedulerError::RegisterFailure(message),
                    Some("NOT_FOUND") => SchedulerError::NotFound {
                        kind: "Resource",
                        id: message,
                    },
                    _ => SchedulerError::Network(message),
                })
            }
        }
    }
}

impl<T: Serialize> IntoResponse for RpcResponse<T> {
    fn into_response(self) -> axum::response::Response {
        Json(self).into_response()
    }
}

impl SchedulerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ServerNotReady { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::RegisterFailure(_) => StatusCode::FORBIDDEN,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::InvalidFlow(_) | Self::InvalidCron { .. } | Self::Serialization(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::VersionConflict { .. } => StatusCode::CONFLICT,
            Self::TaskTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for SchedulerError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let message = match &self {
            Self::ServerNotReady { state } => state.clone(),
            other => other.to_string(),
        };
        let body = RpcResponse::<()>::failure(self.code(), message);
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_envelope_maps_back_to_error() {
        let response = RpcResponse::<String>::failure("SERVER_NOT_READY", "TERMINATING".into());
        let json = serde_json::to_string(&response).unwrap();
        let decoded: RpcResponse<String> = serde_json::from_str(&json).unwrap();
        match decoded.into_result() {
            Err(SchedulerError::ServerNotReady { state }) => assert_eq!(state, "TERMINATING"),
            other => panic!("unexpected result: {other:?}"),
        }

        let ok = RpcResponse::success(7u32).into_result().unwrap();
        assert_eq!(ok, 7);
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            SchedulerError::ServerNotReady {
                state: "IDLE".into()
            }
            .status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            SchedulerError::not_found("Task", "t1").status_code(),
            StatusCode::NOT_FOUND
        );
    }
}
