//! Per-token relay between a client and the module loaded for it.
//!
//! Overview of communication:
//! 1. Client to manager: the client calls into [`crate::manager::ModuleManager`].
//! 2. Manager to client: the [`ModuleLink`] holds the [`ClientCallback`]
//!    reference and forwards load/render results back to the client.
//! 3. Module to manager: the `ModuleLink` is handed to the worker process as
//!    the callback object for load results, so the module side can call back
//!    into the manager.
//! 4. Manager to module: when the module loads successfully it hands back a
//!    [`ModuleCallback`] reference; the manager uses it to forward render
//!    requests and extra data.
//!
//! One link exists per live token. It is destroyed with the token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ModuleError;
use crate::manager::{CleanupReason, ModuleManager};
use crate::token::{ClientId, ModuleToken};

/// Identifier for a rendered surface, allocated by the worker when a render
/// request completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SurfaceId(pub u32);

/// A drawable surface produced by a module in the worker process. The
/// orchestrator relays it without interpreting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderSurface {
    pub module: String,
    pub width: u32,
    pub height: u32,
}

/// One-shot callback fired when a watched client endpoint becomes unreachable.
pub type DeathRecipient = Box<dyn FnOnce() + Send>;

/// The client endpoint was already gone when a death watch was requested.
#[derive(Debug, thiserror::Error)]
#[error("client callback endpoint is already dead")]
pub struct CallbackDead;

/// Manager → client contract: how asynchronous results reach the caller.
pub trait ClientCallback: Send + Sync {
    fn on_load_success(&self, token: ModuleToken, extra: Value);
    fn on_load_failure(&self, error: ModuleError);
    fn on_render_ready(&self, surface: RenderSurface, surface_id: SurfaceId, params: Value);
    fn on_render_error(&self, error: ModuleError);

    /// Register a one-shot death recipient for this client endpoint. The
    /// recipient fires exactly once when the endpoint becomes unreachable.
    fn link_to_death(&self, recipient: DeathRecipient) -> Result<(), CallbackDead>;
}

/// Manager → module contract, available once the module acknowledged load.
pub trait ModuleCallback: Send + Sync {
    fn on_render_requested(&self, host_handle: String, display_id: i32, params: Value);
    fn on_extra_data(&self, params: Value);
}

/// Bidirectional callback relay for one token.
pub struct ModuleLink {
    token: ModuleToken,
    client: ClientId,
    module: String,
    to_client: Arc<dyn ClientCallback>,
    /// Set exactly once, on the first successful load acknowledgement.
    to_module: Mutex<Option<Arc<dyn ModuleCallback>>>,
    manager: Weak<ModuleManager>,
    /// Whether this token holds a reference on the client's worker
    /// connection (set after a successful bind; cleanup unbinds only then).
    counted: AtomicBool,
}

impl ModuleLink {
    pub(crate) fn new(
        token: ModuleToken,
        client: ClientId,
        module: &str,
        to_client: Arc<dyn ClientCallback>,
        manager: Weak<ModuleManager>,
    ) -> Self {
        Self {
            token,
            client,
            module: module.to_string(),
            to_client,
            to_module: Mutex::new(None),
            manager,
            counted: AtomicBool::new(false),
        }
    }

    pub fn token(&self) -> ModuleToken {
        self.token
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn module_name(&self) -> &str {
        &self.module
    }

    /// Token reached `LOADED` (the module callback has been set).
    pub fn is_loaded(&self) -> bool {
        self.lock_module().is_some()
    }

    pub(crate) fn mark_counted(&self) {
        self.counted.store(true, Ordering::Release);
    }

    pub(crate) fn is_counted(&self) -> bool {
        self.counted.load(Ordering::Acquire)
    }

    fn lock_module(&self) -> std::sync::MutexGuard<'_, Option<Arc<dyn ModuleCallback>>> {
        self.to_module.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ─── Worker → orchestrator contract ─────────────────────────

    /// Module acknowledged load. Stores the module callback (first writer
    /// wins) and forwards success to the client.
    pub fn on_load_success(&self, extra: Value, to_module: Arc<dyn ModuleCallback>) {
        {
            let mut slot = self.lock_module();
            if slot.is_some() {
                tracing::warn!(
                    "Duplicate load acknowledgement for token {}, ignoring",
                    self.token
                );
                return;
            }
            *slot = Some(to_module);
        }
        tracing::info!("Module '{}' loaded for client {}", self.module, self.client);
        self.to_client.on_load_success(self.token, extra);
    }

    /// Module failed to load. The token is cleaned up first so a later
    /// retry is possible — a failed load must not leave a half-registered
    /// token behind.
    pub fn on_load_failure(&self, error: ModuleError) {
        tracing::warn!(
            "Load of module '{}' failed for client {}: {}",
            self.module,
            self.client,
            error
        );
        if let Some(manager) = self.manager.upgrade() {
            manager.cleanup(&self.token, CleanupReason::LoadFailure);
        }
        self.to_client.on_load_failure(error);
    }

    /// Worker rejected a load for a token it already holds. The existing
    /// registration belongs to the winner and stays intact; only the error
    /// is forwarded.
    pub fn on_load_rejected(&self, error: ModuleError) {
        tracing::warn!(
            "Worker rejected load of module '{}' for client {}: {}",
            self.module,
            self.client,
            error
        );
        self.to_client.on_load_failure(error);
    }

    pub fn on_render_ready(&self, surface: RenderSurface, surface_id: SurfaceId, params: Value) {
        self.to_client.on_render_ready(surface, surface_id, params);
    }

    pub fn on_render_error(&self, error: ModuleError) {
        self.to_client.on_render_error(error);
    }

    // ─── Orchestrator → worker contract ─────────────────────────

    /// Forward a render request to the module. If the module has not
    /// acknowledged load yet there is nothing to forward to; the client
    /// gets an asynchronous render error rather than a queued request.
    pub(crate) fn request_render(&self, host_handle: &str, display_id: i32, params: Value) {
        let to_module = self.lock_module().clone();
        match to_module {
            Some(cb) => cb.on_render_requested(host_handle.to_string(), display_id, params),
            None => {
                tracing::warn!(
                    "Render requested for token {} before module '{}' finished loading",
                    self.token,
                    self.module
                );
                self.to_client.on_render_error(ModuleError::RenderInternal(format!(
                    "module '{}' is not loaded yet",
                    self.module
                )));
            }
        }
    }

    /// Best-effort, no response.
    pub(crate) fn send_extra_data(&self, params: Value) {
        let to_module = self.lock_module().clone();
        match to_module {
            Some(cb) => cb.on_extra_data(params),
            None => {
                tracing::debug!("Dropping extra data for not-yet-loaded token {}", self.token);
            }
        }
    }
}
