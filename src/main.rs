use std::sync::Arc;
use std::time::Duration;

use hako_core::config::GlobalConfig;
use hako_core::connection::ConnectionProvider;
use hako_core::ipc::session::{ClientRegistry, RegistryClientController};
use hako_core::ipc::{auth, IpcServer};
use hako_core::manager::ModuleManager;
use hako_core::resolver::DirResolver;
use hako_core::worker::{InProcessBackend, PanelProvider, ProviderRegistry};

const DEFAULT_IPC_ADDR: &str = "127.0.0.1:57474";
const DEFAULT_CLIENT_TTL_SECS: u64 = 90;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    tracing::info!("Module orchestration daemon starting");

    let cfg = GlobalConfig::load().unwrap_or(GlobalConfig {
        ipc_addr: None,
        modules_dir: None,
        client_ttl_secs: None,
    });

    // 환경 변수가 config 파일보다 우선
    let modules_dir = std::env::var("HAKO_MODULES_PATH")
        .ok()
        .or(cfg.modules_dir)
        .unwrap_or_else(|| "./modules".to_string());
    let listen_addr = std::env::var("HAKO_IPC_ADDR")
        .ok()
        .or(cfg.ipc_addr)
        .unwrap_or_else(|| DEFAULT_IPC_ADDR.to_string());
    let client_ttl = Duration::from_secs(cfg.client_ttl_secs.unwrap_or(DEFAULT_CLIENT_TTL_SECS));

    // 워커에서 사용할 모듈 provider 팩토리
    let providers = Arc::new(ProviderRegistry::new());
    providers.register("panel", || Box::new(PanelProvider::new("panel")));

    let resolver = Arc::new(DirResolver::new(&modules_dir));
    tracing::info!("Discovered {} module(s) in {}", resolver.discover_modules().len(), modules_dir);

    let backend = Arc::new(InProcessBackend::new(providers));
    let provider = ConnectionProvider::new(backend);
    let clients = ClientRegistry::new();
    let controller = RegistryClientController::new(clients.clone());
    let manager = ModuleManager::new(provider, resolver.clone(), controller);

    // IPC 인증 토큰 생성 (관리 엔드포인트용) — 실패하면 관리 엔드포인트는
    // 토큰이 생길 때까지 요청을 거부함
    if let Err(e) = auth::generate_and_save_token() {
        tracing::error!("Failed to generate IPC auth token: {}", e);
    }

    // Heartbeat reaper 태스크 — 30초마다 만료 클라이언트 확인
    let registry_reaper = clients.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(30)).await;
            let reaped = registry_reaper.reap_expired(client_ttl);
            if !reaped.is_empty() {
                tracing::info!(
                    "Reaped {} expired client(s), {} remaining",
                    reaped.len(),
                    registry_reaper.count()
                );
            }
        }
    });

    // Graceful shutdown: Ctrl+C 시 모든 세션 정리 (워커 해제는 죽음 알림이 처리)
    let registry_shutdown = clients.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutdown signal received, cleaning up...");
        registry_shutdown.kill_all("daemon shutting down");
        tracing::info!("Cleanup complete, exiting");
        std::process::exit(0);
    });

    let ipc_server = IpcServer::new(manager, clients, resolver, &listen_addr);
    if let Err(e) = ipc_server.start().await {
        tracing::error!("IPC server error: {}", e);
    }

    tracing::info!("Daemon shutting down");
    Ok(())
}
