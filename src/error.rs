//! Public error taxonomy for module loading and rendering.
//!
//! Every failure surfaced to a client carries one of these variants, with a
//! machine-readable code for programmatic handling and an HTTP status for
//! the IPC layer.

use axum::http::StatusCode;

/// Errors reported through the load/render callback channel or raised
/// synchronously by the manager.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ModuleError {
    #[error("module '{0}' not found for loading")]
    NotFound(String),

    #[error("{0} is being loaded or has been loaded already")]
    AlreadyLoaded(String),

    /// The module provider's init hook returned an error.
    #[error("module provider failed to initialize: {0}")]
    ProviderInit(String),

    /// The provider factory could not produce an instance at all.
    #[error("failed to instantiate module provider: {0}")]
    Instantiation(String),

    /// Bind or RPC plumbing failure.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("render failed: {0}")]
    RenderInternal(String),

    /// Protocol violation — the caller used a token that is not live.
    #[error("module token is not live")]
    InvalidToken,

    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

impl ModuleError {
    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "MODULE_NOT_FOUND",
            Self::AlreadyLoaded(_) => "ALREADY_LOADED",
            Self::ProviderInit(_) => "PROVIDER_INIT_ERROR",
            Self::Instantiation(_) => "INSTANTIATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::RenderInternal(_) => "RENDER_INTERNAL_ERROR",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
        }
    }

    /// HTTP 상태 코드 매핑
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::AlreadyLoaded(_) => StatusCode::CONFLICT,
            Self::InvalidToken => StatusCode::BAD_REQUEST,
            Self::PermissionDenied(_) => StatusCode::UNAUTHORIZED,
            Self::ProviderInit(_)
            | Self::Instantiation(_)
            | Self::Internal(_)
            | Self::RenderInternal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON 에러 응답 생성
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        })
    }
}

/// axum 핸들러에서 ModuleError를 직접 반환할 수 있도록 IntoResponse 구현
impl axum::response::IntoResponse for ModuleError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = axum::Json(self.to_json());
        (status, body).into_response()
    }
}
