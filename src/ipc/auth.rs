//! IPC 토큰 기반 인증 미들웨어
//!
//! 데몬 시작 시 랜덤 토큰을 생성하여 파일에 저장하고 메모리에 캐시합니다.
//! 관리 도구는 이 파일을 읽어서 `X-Hako-Token` 헤더에 포함시킵니다.
//! 토큰이 일치하지 않는 요청은 401 Unauthorized로 거부됩니다.
//!
//! 클라이언트용 엔드포인트는 이 미들웨어를 거치지 않습니다 — 세션 등록으로
//! 받은 client id가 그 쪽의 자격 증명입니다. 이 미들웨어는 dump, 모듈 갱신
//! 같은 관리 엔드포인트만 보호합니다.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

/// 데몬이 생성한 토큰을 메모리에 캐시 (파일 I/O 제거)
static CACHED_TOKEN: std::sync::RwLock<Option<String>> = std::sync::RwLock::new(None);

/// 토큰 파일의 기본 경로
fn token_file_path() -> String {
    std::env::var("HAKO_TOKEN_PATH").unwrap_or_else(|_| {
        std::env::var("HOME")
            .map(|home| format!("{}/.config/hako-core/.ipc_token", home))
            .unwrap_or_else(|_| "config/.ipc_token".to_string())
    })
}

/// 데몬 시작 시 호출: 랜덤 토큰을 생성하고 파일에 저장 + 메모리 캐시
pub fn generate_and_save_token() -> anyhow::Result<Arc<String>> {
    let token = uuid::Uuid::new_v4().to_string();
    let path = token_file_path();

    if let Some(parent) = std::path::Path::new(&path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(&path, &token)?;

    // 파일 퍼미션 제한 (Unix only)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }

    {
        let mut cached = CACHED_TOKEN.write().unwrap_or_else(|e| e.into_inner());
        *cached = Some(token.clone());
    }

    tracing::info!("IPC auth token generated and saved to {} (token: {}…)", path, &token[..8]);
    Ok(Arc::new(token))
}

/// 토큰 파일에서 읽기 (클라이언트 측에서 사용)
pub fn read_token_from_file() -> Option<String> {
    let path = token_file_path();
    std::fs::read_to_string(&path).ok().map(|s| s.trim().to_string())
}

/// axum 미들웨어: `X-Hako-Token` 헤더 검증
///
/// 인증 비활성화 시 (HAKO_AUTH_DISABLED=1), 모든 요청을 허용합니다.
pub async fn auth_middleware(req: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    // 환경 변수로 인증 비활성화 가능 (개발/테스트용)
    if std::env::var("HAKO_AUTH_DISABLED").unwrap_or_default() == "1" {
        return Ok(next.run(req).await);
    }

    // 메모리 캐시 우선, 없으면 파일에서 읽기
    let expected = {
        let cached = CACHED_TOKEN.read().unwrap_or_else(|e| e.into_inner());
        cached.clone()
    };
    // 토큰이 전혀 없으면 특권 엔드포인트는 차단 (fail closed)
    let expected = match expected {
        Some(t) => t,
        None => match read_token_from_file() {
            Some(t) => t,
            None => {
                tracing::warn!(
                    "No IPC auth token available (looked at {}) — rejecting privileged request",
                    token_file_path()
                );
                return Err(StatusCode::SERVICE_UNAVAILABLE);
            }
        },
    };

    let provided = req
        .headers()
        .get("X-Hako-Token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if provided == expected {
        Ok(next.run(req).await)
    } else {
        tracing::warn!("IPC auth failed for {}", req.uri());
        Err(StatusCode::UNAUTHORIZED)
    }
}
