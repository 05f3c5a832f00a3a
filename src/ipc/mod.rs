//! HTTP IPC surface of the daemon.
//!
//! Clients register a session, then drive module loads/renders through
//! their client id; asynchronous results are queued per session and polled
//! via the events endpoint. Administrative endpoints (dump, module update
//! notification) sit behind token auth.

pub mod auth;
pub mod session;

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::manager::ModuleManager;
use crate::resolver::DirResolver;
use crate::token::{ClientId, ModuleToken};
use self::session::{ClientRegistry, SessionCallback};

/// 클라이언트 하트비트 주기/만료 (등록 응답으로 전달)
pub const HEARTBEAT_INTERVAL_MS: u64 = 30_000;
pub const HEARTBEAT_TIMEOUT_MS: u64 = 90_000;

#[derive(Debug, Clone, Deserialize)]
pub struct LoadModuleRequest {
    pub module: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenderRequest {
    pub token: ModuleToken,
    pub host_handle: String,
    #[serde(default)]
    pub display_id: i32,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataRequest {
    pub token: ModuleToken,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnloadRequest {
    pub token: ModuleToken,
}

/// IPC Server State
#[derive(Clone)]
pub struct IpcServer {
    pub manager: Arc<ModuleManager>,
    pub clients: Arc<ClientRegistry>,
    pub resolver: Arc<DirResolver>,
    pub listen_addr: String,
}

impl IpcServer {
    pub fn new(
        manager: Arc<ModuleManager>,
        clients: Arc<ClientRegistry>,
        resolver: Arc<DirResolver>,
        listen_addr: &str,
    ) -> Self {
        Self {
            manager,
            clients,
            resolver,
            listen_addr: listen_addr.to_string(),
        }
    }

    pub fn router(&self) -> Router {
        // 관리 엔드포인트는 토큰 인증 뒤에 둠
        let admin = Router::new()
            .route("/api/dump", get(dump_state))
            .route("/api/module/:name/updated", post(module_updated))
            .route_layer(middleware::from_fn(auth::auth_middleware));

        Router::new()
            .route("/api/client/register", post(client_register))
            .route("/api/client/:id/heartbeat", post(client_heartbeat))
            .route("/api/client/:id/unregister", delete(client_unregister))
            .route("/api/client/:id/events", get(client_events))
            .route("/api/client/:id/load", post(load_module))
            .route("/api/client/:id/render", post(request_render))
            .route("/api/client/:id/data", post(send_data))
            .route("/api/client/:id/unload", post(unload_module))
            .route("/api/modules", get(list_modules))
            .merge(admin)
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    pub async fn start(self) -> Result<()> {
        tracing::info!("IPC HTTP server starting on {}", self.listen_addr);

        let router = self.router();
        let listener = tokio::net::TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("IPC listening on http://{}", self.listen_addr);

        axum::serve(listener, router).await?;
        Ok(())
    }
}

fn client_not_registered() -> axum::response::Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "Client not registered"})),
    )
        .into_response()
}

/// POST /api/client/register — 클라이언트 세션 등록
async fn client_register(State(state): State<IpcServer>) -> impl IntoResponse {
    let (client, _) = state.clients.register();
    (
        StatusCode::OK,
        Json(json!({
            "client_id": client.0,
            "heartbeat_interval_ms": HEARTBEAT_INTERVAL_MS,
            "timeout_ms": HEARTBEAT_TIMEOUT_MS
        })),
    )
}

/// POST /api/client/:id/heartbeat — TTL 갱신
async fn client_heartbeat(
    Path(client_id): Path<u32>,
    State(state): State<IpcServer>,
) -> impl IntoResponse {
    if state.clients.heartbeat(ClientId(client_id)) {
        (StatusCode::OK, Json(json!({"ok": true}))).into_response()
    } else {
        client_not_registered()
    }
}

/// DELETE /api/client/:id/unregister — 세션 해제, 로드된 모듈 전부 정리
async fn client_unregister(
    Path(client_id): Path<u32>,
    State(state): State<IpcServer>,
) -> impl IntoResponse {
    if state.clients.kill(ClientId(client_id), "client unregistered") {
        (StatusCode::OK, Json(json!({"ok": true}))).into_response()
    } else {
        client_not_registered()
    }
}

/// GET /api/client/:id/events — 대기 중인 비동기 결과 폴링
async fn client_events(
    Path(client_id): Path<u32>,
    State(state): State<IpcServer>,
) -> impl IntoResponse {
    match state.clients.session(ClientId(client_id)) {
        Some(shared) => {
            (StatusCode::OK, Json(json!({"events": shared.take_events()}))).into_response()
        }
        None => client_not_registered(),
    }
}

/// POST /api/client/:id/load — 모듈 로드 시작 (결과는 events로 도착)
async fn load_module(
    Path(client_id): Path<u32>,
    State(state): State<IpcServer>,
    Json(req): Json<LoadModuleRequest>,
) -> impl IntoResponse {
    let client = ClientId(client_id);
    let Some(shared) = state.clients.session(client) else {
        return client_not_registered();
    };
    let callback = SessionCallback::new(shared);
    state.manager.load_module(client, &req.module, req.params, callback).await;
    (StatusCode::ACCEPTED, Json(json!({"ok": true}))).into_response()
}

/// POST /api/client/:id/render — 렌더 요청 중계
async fn request_render(
    Path(client_id): Path<u32>,
    State(state): State<IpcServer>,
    Json(req): Json<RenderRequest>,
) -> impl IntoResponse {
    let client = ClientId(client_id);
    if state.clients.session(client).is_none() {
        return client_not_registered();
    }
    match state
        .manager
        .request_render(client, &req.token, &req.host_handle, req.display_id, req.params)
    {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({"ok": true}))).into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /api/client/:id/data — 모듈로 데이터 전달 (응답 없음)
async fn send_data(
    Path(client_id): Path<u32>,
    State(state): State<IpcServer>,
    Json(req): Json<DataRequest>,
) -> impl IntoResponse {
    let client = ClientId(client_id);
    if state.clients.session(client).is_none() {
        return client_not_registered();
    }
    match state.manager.send_extra_data(client, &req.token, req.params) {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({"ok": true}))).into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /api/client/:id/unload — 모듈 명시적 언로드
async fn unload_module(
    Path(client_id): Path<u32>,
    State(state): State<IpcServer>,
    Json(req): Json<UnloadRequest>,
) -> impl IntoResponse {
    let client = ClientId(client_id);
    if state.clients.session(client).is_none() {
        return client_not_registered();
    }
    match state.manager.unload_module(client, &req.token) {
        Ok(()) => (StatusCode::OK, Json(json!({"ok": true}))).into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /api/modules — 설치된 모듈 목록
async fn list_modules(State(state): State<IpcServer>) -> impl IntoResponse {
    let modules = state.resolver.discover_modules();
    (StatusCode::OK, Json(json!({ "modules": modules })))
}

/// GET /api/dump — 오케스트레이터 상태 덤프 (인증 필요)
async fn dump_state(State(state): State<IpcServer>) -> impl IntoResponse {
    (StatusCode::OK, state.manager.dump())
}

/// POST /api/module/:name/updated — 모듈 교체 알림 (인증 필요)
///
/// 캐시를 무효화하고, 구버전을 실행 중인 클라이언트를 전부 종료합니다.
async fn module_updated(
    Path(name): Path<String>,
    State(state): State<IpcServer>,
) -> impl IntoResponse {
    state.resolver.invalidate_cache();
    state.manager.on_module_updated(&name);
    (StatusCode::OK, Json(json!({"ok": true})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionProvider;
    use crate::worker::{InProcessBackend, PanelProvider, ProviderRegistry};
    use axum::body::Body;
    use axum::http::Request;
    use crate::ipc::session::RegistryClientController;
    use tower::ServiceExt;

    struct Fixture {
        router: Router,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let module_dir = dir.path().join("maps");
        std::fs::create_dir_all(&module_dir).unwrap();
        std::fs::write(
            module_dir.join("module.toml"),
            "[module]\nname = \"maps\"\nversion = \"1.0.0\"\nprovider = \"panel\"\n",
        )
        .unwrap();

        let providers = Arc::new(ProviderRegistry::new());
        providers.register("panel", || Box::new(PanelProvider::new("maps")));
        let backend = Arc::new(InProcessBackend::new(providers));
        let provider = ConnectionProvider::new(backend);
        let resolver = Arc::new(DirResolver::new(dir.path().to_str().unwrap()));
        let clients = ClientRegistry::new();
        let controller = RegistryClientController::new(clients.clone());
        let manager = ModuleManager::new(provider, resolver.clone(), controller);

        let server = IpcServer::new(manager, clients, resolver, "127.0.0.1:0");
        Fixture { router: server.router(), _dir: dir }
    }

    async fn send_json(router: &Router, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    async fn register(router: &Router) -> u32 {
        let (status, body) =
            send_json(router, "POST", "/api/client/register", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        body["client_id"].as_u64().unwrap() as u32
    }

    async fn poll_events(router: &Router, client: u32) -> Vec<Value> {
        for _ in 0..50 {
            let (status, body) =
                send_json(router, "GET", &format!("/api/client/{client}/events"), Value::Null)
                    .await;
            assert_eq!(status, StatusCode::OK);
            let events = body["events"].as_array().unwrap().clone();
            if !events.is_empty() {
                return events;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        Vec::new()
    }

    #[tokio::test]
    async fn register_then_heartbeat() {
        let f = fixture();
        let client = register(&f.router).await;

        let (status, body) =
            send_json(&f.router, "POST", &format!("/api/client/{client}/heartbeat"), json!({}))
                .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], json!(true));
    }

    #[tokio::test]
    async fn unknown_client_is_404() {
        let f = fixture();
        let (status, _) =
            send_json(&f.router, "POST", "/api/client/999/heartbeat", json!({})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn load_success_arrives_through_events() {
        let f = fixture();
        let client = register(&f.router).await;

        let (status, _) = send_json(
            &f.router,
            "POST",
            &format!("/api/client/{client}/load"),
            json!({"module": "maps"}),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let events = poll_events(&f.router, client).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["event"], json!("load_success"));
        assert!(events[0]["token"].is_string());
    }

    #[tokio::test]
    async fn load_of_unknown_module_reports_not_found_event() {
        let f = fixture();
        let client = register(&f.router).await;

        send_json(
            &f.router,
            "POST",
            &format!("/api/client/{client}/load"),
            json!({"module": "missing"}),
        )
        .await;

        let events = poll_events(&f.router, client).await;
        assert_eq!(events[0]["event"], json!("load_failure"));
        assert_eq!(events[0]["code"], json!("MODULE_NOT_FOUND"));
    }

    #[tokio::test]
    async fn render_round_trip() {
        let f = fixture();
        let client = register(&f.router).await;

        send_json(
            &f.router,
            "POST",
            &format!("/api/client/{client}/load"),
            json!({"module": "maps"}),
        )
        .await;
        let events = poll_events(&f.router, client).await;
        let token = events[0]["token"].clone();

        let (status, _) = send_json(
            &f.router,
            "POST",
            &format!("/api/client/{client}/render"),
            json!({"token": token, "host_handle": "host-1", "display_id": 0,
                   "params": {"width": 640, "height": 480}}),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let events = poll_events(&f.router, client).await;
        assert_eq!(events[0]["event"], json!("render_ready"));
        assert_eq!(events[0]["surface"]["width"], json!(640));
    }

    #[tokio::test]
    async fn render_with_fabricated_token_is_rejected() {
        let f = fixture();
        let client = register(&f.router).await;

        let (status, body) = send_json(
            &f.router,
            "POST",
            &format!("/api/client/{client}/render"),
            json!({"token": uuid::Uuid::new_v4().to_string(), "host_handle": "host-1"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_code"], json!("INVALID_TOKEN"));
    }

    #[tokio::test]
    async fn unregister_invalidates_loaded_tokens() {
        let f = fixture();
        let client = register(&f.router).await;

        send_json(
            &f.router,
            "POST",
            &format!("/api/client/{client}/load"),
            json!({"module": "maps"}),
        )
        .await;
        let events = poll_events(&f.router, client).await;
        let token = events[0]["token"].clone();

        let (status, _) = send_json(
            &f.router,
            "DELETE",
            &format!("/api/client/{client}/unregister"),
            Value::Null,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // 세션이 사라졌으니 렌더는 404
        let (status, _) = send_json(
            &f.router,
            "POST",
            &format!("/api/client/{client}/render"),
            json!({"token": token, "host_handle": "host-1"}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_modules_reports_manifest() {
        let f = fixture();
        let (status, body) = send_json(&f.router, "GET", "/api/modules", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["modules"][0]["name"], json!("maps"));
    }
}
