use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("请求参数错误: {0}")]
    Validation(String),

    #[error("上游请求失败 ({status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("上游连接失败: {0}")]
    Network(String),

    #[error("没有可用的 token，请稍后重试")]
    RateLimited,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.trim().is_empty() {
            format!("upstream returned {status}")
        } else {
            message
        };
        Self::Upstream { status, message }
    }

    /// 提取上游 HTTP 状态码（纯函数，供重试与失败记录分类使用）。
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Upstream { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// 上游类错误（含连接失败）允许换 token 重试；其余错误立即终止。
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Upstream { .. } | Self::Network(_))
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorBodyInner,
}

#[derive(Debug, Serialize)]
struct ErrorBodyInner {
    message: String,
    r#type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, ty, code) = match &self {
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "invalid_request_error", None),
            AppError::Upstream { status, .. } => {
                // 客户端/服务端错误码原样透传，其余视为网关故障。
                let s = StatusCode::from_u16(*status)
                    .ok()
                    .filter(|s| s.is_client_error() || s.is_server_error())
                    .unwrap_or(StatusCode::BAD_GATEWAY);
                (s, "upstream_error", None)
            }
            AppError::Network(_) => (StatusCode::BAD_GATEWAY, "upstream_error", None),
            AppError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limit_error",
                Some("rate_limit_exceeded".to_string()),
            ),
            AppError::Io(_) | AppError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "server_error", None)
            }
        };

        let body = ErrorBody {
            error: ErrorBodyInner {
                message: self.to_string(),
                r#type: ty.to_string(),
                code,
            },
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_only_extracted_from_upstream_errors() {
        assert_eq!(AppError::upstream(500, "boom").status(), Some(500));
        assert_eq!(AppError::Network("refused".into()).status(), None);
        assert_eq!(AppError::RateLimited.status(), None);
    }

    #[test]
    fn upstream_and_network_errors_are_retryable() {
        assert!(AppError::upstream(429, "").is_retryable());
        assert!(AppError::Network("reset".into()).is_retryable());
        assert!(!AppError::validation("bad").is_retryable());
        assert!(!AppError::RateLimited.is_retryable());
    }
}
