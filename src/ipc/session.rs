//! Client sessions over the IPC boundary.
//!
//! HTTP cannot push callbacks to the client, so each registered client gets
//! a [`SessionShared`] the daemon writes events into; the client polls them.
//! The session is also where death watching lives: killing a session fires
//! the death recipients registered against it, which is how the orchestrator
//! learns a client is gone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;

use crate::error::ModuleError;
use crate::link::{CallbackDead, ClientCallback, DeathRecipient, RenderSurface, SurfaceId};
use crate::manager::ClientController;
use crate::token::{ClientId, ModuleToken};

/// One asynchronous result waiting for the client to poll it.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    LoadSuccess { token: ModuleToken, extra: Value },
    LoadFailure { code: String, message: String },
    RenderReady { surface: RenderSurface, surface_id: SurfaceId, params: Value },
    RenderError { code: String, message: String },
}

enum DeathSlot {
    Alive(Vec<DeathRecipient>),
    Dead,
}

/// Event queue and death watch for one client session.
pub struct SessionShared {
    events: Mutex<Vec<ClientEvent>>,
    death: Mutex<DeathSlot>,
}

impl SessionShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            death: Mutex::new(DeathSlot::Alive(Vec::new())),
        })
    }

    fn push(&self, event: ClientEvent) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }

    /// Drain pending events in arrival order.
    pub fn take_events(&self) -> Vec<ClientEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn watch(&self, recipient: DeathRecipient) -> Result<(), CallbackDead> {
        let mut slot = self.death.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *slot {
            DeathSlot::Alive(recipients) => {
                recipients.push(recipient);
                Ok(())
            }
            DeathSlot::Dead => Err(CallbackDead),
        }
    }

    /// Mark the session dead and fire every death recipient exactly once.
    pub fn kill(&self) {
        let recipients = {
            let mut slot = self.death.lock().unwrap_or_else(|e| e.into_inner());
            match std::mem::replace(&mut *slot, DeathSlot::Dead) {
                DeathSlot::Alive(recipients) => recipients,
                DeathSlot::Dead => Vec::new(),
            }
        };
        for recipient in recipients {
            recipient();
        }
    }
}

/// [`ClientCallback`] that records results into the session's event queue.
pub struct SessionCallback {
    shared: Arc<SessionShared>,
}

impl SessionCallback {
    pub fn new(shared: Arc<SessionShared>) -> Arc<Self> {
        Arc::new(Self { shared })
    }
}

impl ClientCallback for SessionCallback {
    fn on_load_success(&self, token: ModuleToken, extra: Value) {
        self.shared.push(ClientEvent::LoadSuccess { token, extra });
    }

    fn on_load_failure(&self, error: ModuleError) {
        self.shared.push(ClientEvent::LoadFailure {
            code: error.error_code().to_string(),
            message: error.to_string(),
        });
    }

    fn on_render_ready(&self, surface: RenderSurface, surface_id: SurfaceId, params: Value) {
        self.shared.push(ClientEvent::RenderReady { surface, surface_id, params });
    }

    fn on_render_error(&self, error: ModuleError) {
        self.shared.push(ClientEvent::RenderError {
            code: error.error_code().to_string(),
            message: error.to_string(),
        });
    }

    fn link_to_death(&self, recipient: DeathRecipient) -> Result<(), CallbackDead> {
        self.shared.watch(recipient)
    }
}

struct ClientSession {
    shared: Arc<SessionShared>,
    last_seen: Instant,
}

/// Registry of live client sessions, keyed by the id handed out at
/// registration. Heartbeats keep a session alive; silence past the TTL
/// is treated as client death.
#[derive(Default)]
pub struct ClientRegistry {
    sessions: Mutex<HashMap<ClientId, ClientSession>>,
    next_id: AtomicU32,
}

impl ClientRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ClientId, ClientSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self) -> (ClientId, Arc<SessionShared>) {
        let client = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let shared = SessionShared::new();
        self.lock().insert(client, ClientSession { shared: shared.clone(), last_seen: Instant::now() });
        tracing::info!("Client {} registered ({} active)", client, self.count());
        (client, shared)
    }

    /// TTL 갱신. Returns `false` for unknown sessions.
    pub fn heartbeat(&self, client: ClientId) -> bool {
        match self.lock().get_mut(&client) {
            Some(session) => {
                session.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn session(&self, client: ClientId) -> Option<Arc<SessionShared>> {
        self.lock().get(&client).map(|s| s.shared.clone())
    }

    /// Remove the session and fire its death recipients.
    pub fn kill(&self, client: ClientId, reason: &str) -> bool {
        let Some(session) = self.lock().remove(&client) else {
            return false;
        };
        tracing::info!("Killing client session {}: {}", client, reason);
        session.shared.kill();
        true
    }

    /// Remove every session whose heartbeat lapsed. Returns the reaped ids.
    pub fn reap_expired(&self, ttl: Duration) -> Vec<ClientId> {
        let expired: Vec<ClientId> = {
            let sessions = self.lock();
            sessions
                .iter()
                .filter(|(_, s)| s.last_seen.elapsed() > ttl)
                .map(|(id, _)| *id)
                .collect()
        };
        for client in &expired {
            self.kill(*client, "heartbeat expired");
        }
        expired
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// Kill every live session (daemon shutdown).
    pub fn kill_all(&self, reason: &str) {
        let clients: Vec<ClientId> = self.lock().keys().copied().collect();
        for client in clients {
            self.kill(client, reason);
        }
    }
}

/// Lets the orchestrator kill client sessions (module update path).
pub struct RegistryClientController {
    registry: Arc<ClientRegistry>,
}

impl RegistryClientController {
    pub fn new(registry: Arc<ClientRegistry>) -> Arc<Self> {
        Arc::new(Self { registry })
    }
}

impl ClientController for RegistryClientController {
    fn kill(&self, client: ClientId, reason: &str) {
        self.registry.kill(client, reason);
    }
}
