//! Worker-side module host.
//!
//! The host receives load RPCs from the orchestrator, instantiates the
//! requested module through a provider factory, and calls back through the
//! token's [`ModuleLink`]. In production this code runs in the isolated
//! worker process; [`InProcessBackend`] runs each worker as a tokio task
//! fed by a channel, which keeps the same fire-and-forget RPC shape.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connection::{BindError, ConnectionEvents, RelayError, WorkerBackend, WorkerEndpoint};
use crate::error::ModuleError;
use crate::link::{ModuleCallback, ModuleLink, RenderSurface, SurfaceId};
use crate::resolver::ModuleMetadata;
use crate::token::{ClientId, ModuleToken};

/// Default edge length for a rendered surface when the render params carry
/// no explicit width/height.
const DEFAULT_SURFACE_SIZE: u32 = 500;

/// The capability set a loaded module implements.
pub trait ModuleProvider: Send {
    /// Initialize the module. Returns extra params forwarded to the client
    /// on load success.
    fn init(&mut self, params: &Value) -> Result<Value, String>;

    /// Produce a drawable surface for the given display.
    fn render(&mut self, display_id: i32, params: &Value) -> Result<RenderSurface, String>;

    /// Best-effort data from the client; no response.
    fn on_extra_data(&mut self, _params: &Value) {}
}

pub type ProviderCtor = Box<dyn Fn() -> Box<dyn ModuleProvider> + Send + Sync>;

/// Factory registry: provider key -> constructor. Stands in for dynamic
/// code loading; the host only needs "given metadata, obtain an instance".
#[derive(Default)]
pub struct ProviderRegistry {
    ctors: RwLock<HashMap<String, ProviderCtor>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, key: &str, ctor: F)
    where
        F: Fn() -> Box<dyn ModuleProvider> + Send + Sync + 'static,
    {
        self.ctors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), Box::new(ctor));
        tracing::info!("Registered module provider '{}'", key);
    }

    pub fn create(&self, key: &str) -> Option<Box<dyn ModuleProvider>> {
        self.ctors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|ctor| ctor())
    }
}

/// Basic built-in provider: renders a fixed-size panel surface.
pub struct PanelProvider {
    module: String,
}

impl PanelProvider {
    pub fn new(module: &str) -> Self {
        Self { module: module.to_string() }
    }
}

impl ModuleProvider for PanelProvider {
    fn init(&mut self, _params: &Value) -> Result<Value, String> {
        Ok(serde_json::json!({ "provider": "panel" }))
    }

    fn render(&mut self, _display_id: i32, params: &Value) -> Result<RenderSurface, String> {
        let width = params.get("width").and_then(|v| v.as_u64()).unwrap_or(DEFAULT_SURFACE_SIZE as u64);
        let height = params.get("height").and_then(|v| v.as_u64()).unwrap_or(DEFAULT_SURFACE_SIZE as u64);
        Ok(RenderSurface {
            module: self.module.clone(),
            width: width as u32,
            height: height as u32,
        })
    }
}

struct HeldModule {
    module: String,
    instance: Mutex<Box<dyn ModuleProvider>>,
    /// Surfaces produced so far, retained until the module is dropped.
    surfaces: Mutex<HashMap<SurfaceId, RenderSurface>>,
}

/// Holds the modules loaded in one worker, keyed by token.
pub(crate) struct ModuleHost {
    client: ClientId,
    providers: Arc<ProviderRegistry>,
    held: Mutex<HashMap<ModuleToken, Arc<HeldModule>>>,
    next_surface_id: Arc<AtomicU32>,
}

impl ModuleHost {
    pub(crate) fn new(client: ClientId, providers: Arc<ProviderRegistry>) -> Self {
        Self {
            client,
            providers,
            held: Mutex::new(HashMap::new()),
            next_surface_id: Arc::new(AtomicU32::new(1)),
        }
    }

    fn lock_held(&self) -> MutexGuard<'_, HashMap<ModuleToken, Arc<HeldModule>>> {
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn load_module(
        &self,
        token: ModuleToken,
        metadata: ModuleMetadata,
        params: Value,
        link: Arc<ModuleLink>,
    ) {
        if self.lock_held().contains_key(&token) {
            // 이미 보유 중인 토큰 — 승자의 등록을 건드리지 않고 거절만 전달
            link.on_load_rejected(ModuleError::AlreadyLoaded(metadata.name));
            return;
        }

        let Some(mut instance) = self.providers.create(&metadata.provider) else {
            link.on_load_failure(ModuleError::Instantiation(format!(
                "no provider registered for '{}'",
                metadata.provider
            )));
            return;
        };

        match instance.init(&params) {
            Err(e) => link.on_load_failure(ModuleError::ProviderInit(e)),
            Ok(extra) => {
                let held = Arc::new(HeldModule {
                    module: metadata.name.clone(),
                    instance: Mutex::new(instance),
                    surfaces: Mutex::new(HashMap::new()),
                });
                self.lock_held().insert(token, held.clone());
                tracing::info!(
                    "Worker for client {} holding module '{}' (token {})",
                    self.client,
                    metadata.name,
                    token
                );
                let callback = Arc::new(HostModuleCallback {
                    held,
                    link: Arc::downgrade(&link),
                    ids: self.next_surface_id.clone(),
                });
                link.on_load_success(extra, callback);
            }
        }
    }
}

/// Manager → module callback for one held module.
struct HostModuleCallback {
    held: Arc<HeldModule>,
    link: Weak<ModuleLink>,
    ids: Arc<AtomicU32>,
}

impl ModuleCallback for HostModuleCallback {
    fn on_render_requested(&self, _host_handle: String, display_id: i32, params: Value) {
        let Some(link) = self.link.upgrade() else {
            return;
        };
        let rendered = {
            let mut instance = self.held.instance.lock().unwrap_or_else(|e| e.into_inner());
            instance.render(display_id, &params)
        };
        match rendered {
            Ok(surface) => {
                let id = SurfaceId(self.ids.fetch_add(1, Ordering::Relaxed));
                self.held
                    .surfaces
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(id, surface.clone());
                link.on_render_ready(surface, id, params);
            }
            Err(e) => {
                tracing::warn!("Module '{}' render failed: {}", self.held.module, e);
                link.on_render_error(ModuleError::RenderInternal(e));
            }
        }
    }

    fn on_extra_data(&self, params: Value) {
        let mut instance = self.held.instance.lock().unwrap_or_else(|e| e.into_inner());
        instance.on_extra_data(&params);
    }
}

// ─── In-process backend ──────────────────────────────────────

enum WorkerRequest {
    LoadModule {
        token: ModuleToken,
        metadata: ModuleMetadata,
        params: Value,
        link: Arc<ModuleLink>,
    },
}

struct WorkerProcess {
    tx: mpsc::UnboundedSender<WorkerRequest>,
    task: JoinHandle<()>,
    on_disconnected: Box<dyn Fn() + Send + Sync>,
}

/// Runs each client's worker as a tokio task fed by an unbounded channel.
/// `start_and_bind` must be called from within a tokio runtime.
#[derive(Default)]
pub struct InProcessBackend {
    providers: Arc<ProviderRegistry>,
    workers: Mutex<HashMap<ClientId, WorkerProcess>>,
}

impl InProcessBackend {
    pub fn new(providers: Arc<ProviderRegistry>) -> Self {
        Self {
            providers,
            workers: Mutex::new(HashMap::new()),
        }
    }

    fn lock_workers(&self) -> MutexGuard<'_, HashMap<ClientId, WorkerProcess>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct WorkerHandle {
    tx: mpsc::UnboundedSender<WorkerRequest>,
}

impl WorkerEndpoint for WorkerHandle {
    fn load_module(
        &self,
        token: ModuleToken,
        metadata: ModuleMetadata,
        params: Value,
        link: Arc<ModuleLink>,
    ) -> Result<(), RelayError> {
        self.tx
            .send(WorkerRequest::LoadModule { token, metadata, params, link })
            .map_err(|_| RelayError("worker channel closed".into()))
    }
}

impl WorkerBackend for InProcessBackend {
    fn start_and_bind(
        &self,
        client: ClientId,
        events: ConnectionEvents,
    ) -> Result<Arc<dyn WorkerEndpoint>, BindError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let host = ModuleHost::new(client, self.providers.clone());
        let task = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                match request {
                    WorkerRequest::LoadModule { token, metadata, params, link } => {
                        host.load_module(token, metadata, params, link);
                    }
                }
            }
            tracing::debug!("Worker task for client {} finished", client);
        });
        self.lock_workers().insert(
            client,
            WorkerProcess { tx: tx.clone(), task, on_disconnected: events.on_disconnected },
        );
        tracing::info!("Started in-process worker for client {}", client);
        Ok(Arc::new(WorkerHandle { tx }))
    }

    fn unbind(&self, client: ClientId) {
        let worker = self.lock_workers().remove(&client);
        if let Some(worker) = worker {
            // 송신자 핸들이 모두 드랍되면 태스크 루프가 종료됨
            drop(worker.tx);
            tracing::info!("Unbound in-process worker for client {}", client);
        }
    }

    fn terminate(&self, client: ClientId, reason: &str) {
        // 항목을 먼저 꺼내서 락을 놓은 뒤에 콜백 호출 (콜백이 백엔드로
        // 재진입할 수 있음)
        let worker = self.lock_workers().remove(&client);
        if let Some(worker) = worker {
            tracing::info!("Terminating worker for client {}: {}", client, reason);
            worker.task.abort();
            (worker.on_disconnected)();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{CallbackDead, ClientCallback, DeathRecipient};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingClient {
        events: StdMutex<Vec<String>>,
    }

    impl ClientCallback for RecordingClient {
        fn on_load_success(&self, _token: ModuleToken, _extra: Value) {
            self.events.lock().unwrap().push("load_success".into());
        }
        fn on_load_failure(&self, error: ModuleError) {
            self.events.lock().unwrap().push(format!("load_failure:{}", error.error_code()));
        }
        fn on_render_ready(&self, surface: RenderSurface, id: SurfaceId, _params: Value) {
            self.events
                .lock()
                .unwrap()
                .push(format!("render_ready:{}:{}x{}", id.0, surface.width, surface.height));
        }
        fn on_render_error(&self, error: ModuleError) {
            self.events.lock().unwrap().push(format!("render_error:{}", error.error_code()));
        }
        fn link_to_death(&self, _recipient: DeathRecipient) -> Result<(), CallbackDead> {
            Ok(())
        }
    }

    fn panel_registry() -> Arc<ProviderRegistry> {
        let registry = Arc::new(ProviderRegistry::new());
        registry.register("panel", || Box::new(PanelProvider::new("maps")));
        registry
    }

    fn metadata(provider: &str) -> ModuleMetadata {
        ModuleMetadata {
            name: "maps".into(),
            version: "1.0.0".into(),
            description: None,
            provider: provider.into(),
        }
    }

    fn link_for(client: &Arc<RecordingClient>) -> Arc<ModuleLink> {
        Arc::new(ModuleLink::new(
            ModuleToken::mint(),
            ClientId(1),
            "maps",
            client.clone(),
            Weak::new(),
        ))
    }

    #[test]
    fn load_success_goes_through_link() {
        let client = Arc::new(RecordingClient::default());
        let host = ModuleHost::new(ClientId(1), panel_registry());
        let link = link_for(&client);

        host.load_module(link.token(), metadata("panel"), Value::Null, link.clone());
        assert!(link.is_loaded());
        assert_eq!(client.events.lock().unwrap().as_slice(), ["load_success".to_string()]);
    }

    #[test]
    fn duplicate_token_rejected_by_worker() {
        let client = Arc::new(RecordingClient::default());
        let host = ModuleHost::new(ClientId(1), panel_registry());
        let link = link_for(&client);

        host.load_module(link.token(), metadata("panel"), Value::Null, link.clone());
        host.load_module(link.token(), metadata("panel"), Value::Null, link.clone());

        let events = client.events.lock().unwrap();
        assert_eq!(events[0], "load_success");
        assert_eq!(events[1], "load_failure:ALREADY_LOADED");
    }

    #[test]
    fn unknown_provider_is_instantiation_error() {
        let client = Arc::new(RecordingClient::default());
        let host = ModuleHost::new(ClientId(1), panel_registry());
        let link = link_for(&client);

        host.load_module(link.token(), metadata("missing"), Value::Null, link);
        assert_eq!(
            client.events.lock().unwrap().as_slice(),
            ["load_failure:INSTANTIATION_ERROR".to_string()]
        );
    }

    #[test]
    fn failing_init_is_provider_init_error() {
        struct FailingInit;
        impl ModuleProvider for FailingInit {
            fn init(&mut self, _params: &Value) -> Result<Value, String> {
                Err("init blew up".into())
            }
            fn render(&mut self, _display_id: i32, _params: &Value) -> Result<RenderSurface, String> {
                unreachable!()
            }
        }

        let registry = Arc::new(ProviderRegistry::new());
        registry.register("failing", || Box::new(FailingInit));
        let client = Arc::new(RecordingClient::default());
        let host = ModuleHost::new(ClientId(1), registry);
        let link = link_for(&client);

        host.load_module(link.token(), metadata("failing"), Value::Null, link);
        assert_eq!(
            client.events.lock().unwrap().as_slice(),
            ["load_failure:PROVIDER_INIT_ERROR".to_string()]
        );
    }

    #[test]
    fn render_allocates_distinct_surface_ids() {
        let client = Arc::new(RecordingClient::default());
        let host = ModuleHost::new(ClientId(1), panel_registry());
        let link = link_for(&client);
        host.load_module(link.token(), metadata("panel"), Value::Null, link.clone());

        link.request_render("host-1", 0, serde_json::json!({ "width": 320, "height": 240 }));
        link.request_render("host-1", 0, Value::Null);

        let events = client.events.lock().unwrap();
        assert_eq!(events[1], "render_ready:1:320x240");
        // 두 번째 렌더는 기본 크기 500x500, 새 surface id
        assert_eq!(events[2], "render_ready:2:500x500");
    }

    #[tokio::test]
    async fn in_process_backend_load_round_trip() {
        let backend = InProcessBackend::new(panel_registry());
        let client = Arc::new(RecordingClient::default());
        let link = link_for(&client);

        let endpoint = backend
            .start_and_bind(ClientId(1), ConnectionEvents { on_disconnected: Box::new(|| {}) })
            .unwrap();
        endpoint
            .load_module(link.token(), metadata("panel"), Value::Null, link.clone())
            .unwrap();

        // 결과는 워커 태스크에서 비동기로 도착
        for _ in 0..50 {
            if link.is_loaded() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(link.is_loaded());
    }

    #[tokio::test]
    async fn terminate_fires_disconnect_and_closes_channel() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let backend = InProcessBackend::new(panel_registry());
        let disconnected = Arc::new(AtomicBool::new(false));
        let flag = disconnected.clone();
        let endpoint = backend
            .start_and_bind(
                ClientId(1),
                ConnectionEvents { on_disconnected: Box::new(move || flag.store(true, Ordering::SeqCst)) },
            )
            .unwrap();

        backend.terminate(ClientId(1), "client died");
        assert!(disconnected.load(Ordering::SeqCst));

        // 종료된 워커로의 RPC는 막히지 않고 실패해야 함
        let client = Arc::new(RecordingClient::default());
        let link = link_for(&client);
        for _ in 0..50 {
            if endpoint
                .load_module(link.token(), metadata("panel"), Value::Null, link.clone())
                .is_err()
            {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("endpoint should reject RPCs after terminate");
    }

    #[tokio::test]
    async fn terminate_callback_can_reenter_backend() {
        let backend = Arc::new(InProcessBackend::new(panel_registry()));
        let reentrant = backend.clone();
        backend
            .start_and_bind(
                ClientId(1),
                ConnectionEvents {
                    on_disconnected: Box::new(move || reentrant.unbind(ClientId(1))),
                },
            )
            .unwrap();

        // 콜백이 워커 테이블로 재진입해도 데드락 없이 반환해야 함
        backend.terminate(ClientId(1), "client died");
        assert!(backend.lock_workers().is_empty());
    }
}
