//! Orchestrator core.
//!
//! The [`ModuleManager`] ties the token registry, module resolver, link
//! table and connection provider together: it owns the control flow for
//! loading a module into a client's worker, relaying render/data calls to
//! it, and cleaning up after failures, unloads and client deaths.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

use crate::connection::ConnectionProvider;
use crate::error::ModuleError;
use crate::link::{ClientCallback, ModuleLink};
use crate::resolver::ModuleResolver;
use crate::token::{ClientId, ModuleToken, TokenRegistry};

/// Why a token is being torn down. Logged, and used to decide whether the
/// worker process itself must also go away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupReason {
    LoadFailure,
    ClientDeath,
    Unload,
}

/// Kills client sessions. The IPC layer implements this over its session
/// registry; tests substitute a recording fake.
pub trait ClientController: Send + Sync {
    fn kill(&self, client: ClientId, reason: &str);
}

pub struct ModuleManager {
    registry: TokenRegistry,
    provider: Arc<ConnectionProvider>,
    resolver: Arc<dyn ModuleResolver>,
    clients: Arc<dyn ClientController>,
    /// Live links, one per token in PENDING or LOADED state.
    links: Mutex<HashMap<ModuleToken, Arc<ModuleLink>>>,
    /// Which module names each client currently has live. Drives the
    /// module-update kill path.
    loaded: Mutex<HashMap<ClientId, HashSet<String>>>,
}

impl ModuleManager {
    pub fn new(
        provider: Arc<ConnectionProvider>,
        resolver: Arc<dyn ModuleResolver>,
        clients: Arc<dyn ClientController>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: TokenRegistry::new(),
            provider,
            resolver,
            clients,
            links: Mutex::new(HashMap::new()),
            loaded: Mutex::new(HashMap::new()),
        })
    }

    fn lock_links(&self) -> MutexGuard<'_, HashMap<ModuleToken, Arc<ModuleLink>>> {
        self.links.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_loaded(&self) -> MutexGuard<'_, HashMap<ClientId, HashSet<String>>> {
        self.loaded.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Load `module` into the worker process for `client`.
    ///
    /// The call returns once the load request is on its way (or has failed
    /// synchronously); the outcome arrives through `callback`. Duplicate
    /// loads are rejected without touching the winner's state, and any
    /// failure after the token was registered cleans the token up so the
    /// client can retry with a fresh load.
    pub async fn load_module(
        self: &Arc<Self>,
        client: ClientId,
        module: &str,
        params: Value,
        callback: Arc<dyn ClientCallback>,
    ) {
        // Register the token, the link and the update-kill bookkeeping in
        // one critical section, or detect a duplicate racing/finished load.
        // The loser must not disturb the winner's token, so the duplicate
        // path reports straight to the caller without going through a link.
        //
        // A cleanup racing between the registry lookup and the links lock
        // can destroy the token; a link registered for a destroyed token
        // could never be cleaned up again, so the registration re-checks
        // the registry under the links lock and starts over if it lost.
        let (token, link) = loop {
            let token = self.registry.create_or_get(client, module);
            let mut links = self.lock_links();
            if links.contains_key(&token) {
                tracing::warn!(
                    "Client {} tried to load module '{}' twice (token {})",
                    client,
                    module,
                    token
                );
                drop(links);
                callback.on_load_failure(ModuleError::AlreadyLoaded(module.to_string()));
                return;
            }
            if self.registry.owner(&token).is_none() {
                continue;
            }
            let link = Arc::new(ModuleLink::new(
                token,
                client,
                module,
                callback.clone(),
                Arc::downgrade(self),
            ));
            links.insert(token, link.clone());
            // Recorded before any RPC is issued: every cleanup trigger,
            // including a worker failing the load before this function
            // resumes, must observe the entry it has to remove.
            self.lock_loaded().entry(client).or_default().insert(module.to_string());
            break (token, link);
        };

        tracing::info!("Loading module '{}' for client {} (token {})", module, client, token);

        // From here on every failure goes through the link so the token is
        // cleaned up before the client hears about it.
        let Some(metadata) = self.resolver.resolve(client, module) else {
            link.on_load_failure(ModuleError::NotFound(module.to_string()));
            return;
        };

        let endpoint = match self.provider.bind(client).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                link.on_load_failure(ModuleError::Internal(format!(
                    "failed to reach worker process: {e}"
                )));
                return;
            }
        };
        // This token now holds one reference on the worker connection.
        link.mark_counted();

        if let Err(e) = endpoint.load_module(token, metadata, params, link.clone()) {
            link.on_load_failure(ModuleError::Internal(format!(
                "failed to relay load request: {e}"
            )));
            return;
        }

        // Watch the client; a dead client must not keep a worker alive.
        let manager = Arc::downgrade(self);
        let watched = callback.link_to_death(Box::new(move || {
            if let Some(manager) = manager.upgrade() {
                manager.on_client_death(client);
            }
        }));
        if watched.is_err() {
            tracing::warn!("Client {} died during load of '{}'", client, module);
            self.on_client_death(client);
        }
    }

    /// Tear down one token. Idempotent under racing triggers (load failure,
    /// client death, unload): the registry removal picks exactly one winner
    /// and everyone else returns `false`.
    pub fn cleanup(&self, token: &ModuleToken, reason: CleanupReason) -> bool {
        if !self.registry.destroy(token) {
            return false;
        }
        let Some(link) = self.lock_links().remove(token) else {
            return false;
        };
        tracing::info!(
            "Cleaning up token {} (module '{}', client {}): {:?}",
            token,
            link.module_name(),
            link.client(),
            reason
        );

        {
            let mut loaded = self.lock_loaded();
            if let Some(modules) = loaded.get_mut(&link.client()) {
                modules.remove(link.module_name());
                if modules.is_empty() {
                    loaded.remove(&link.client());
                }
            }
        }

        // Only tokens that got as far as a successful bind hold a reference
        // on the connection.
        if link.is_counted() {
            self.provider.unbind(link.client());
        }
        true
    }

    /// The client endpoint became unreachable. Invalidate all of its tokens
    /// and kill its worker process.
    pub fn on_client_death(&self, client: ClientId) {
        let tokens: Vec<ModuleToken> = self
            .lock_links()
            .values()
            .filter(|link| link.client() == client)
            .map(|link| link.token())
            .collect();
        if tokens.is_empty() {
            return;
        }
        tracing::info!("Client {} died with {} module(s) loaded", client, tokens.len());
        for token in tokens {
            self.cleanup(&token, CleanupReason::ClientDeath);
        }
        // The refcounted unbinds above normally release the worker already;
        // terminate is the backstop for a worker stuck mid-load.
        self.provider.terminate(client, "client died");
    }

    /// Relay a render request to the module behind `token`. Ownership is
    /// checked so one client cannot render through another client's token.
    pub fn request_render(
        &self,
        client: ClientId,
        token: &ModuleToken,
        host_handle: &str,
        display_id: i32,
        params: Value,
    ) -> Result<(), ModuleError> {
        let link = self.live_link(client, token)?;
        link.request_render(host_handle, display_id, params);
        Ok(())
    }

    /// Relay opaque data to the module behind `token`. Best-effort.
    pub fn send_extra_data(
        &self,
        client: ClientId,
        token: &ModuleToken,
        params: Value,
    ) -> Result<(), ModuleError> {
        let link = self.live_link(client, token)?;
        link.send_extra_data(params);
        Ok(())
    }

    /// Explicit unload of one module.
    pub fn unload_module(&self, client: ClientId, token: &ModuleToken) -> Result<(), ModuleError> {
        let link = self.live_link(client, token)?;
        self.cleanup(&link.token(), CleanupReason::Unload);
        Ok(())
    }

    fn live_link(&self, client: ClientId, token: &ModuleToken) -> Result<Arc<ModuleLink>, ModuleError> {
        let link = self
            .lock_links()
            .get(token)
            .cloned()
            .ok_or(ModuleError::InvalidToken)?;
        if link.client() != client {
            // 다른 클라이언트의 토큰 — 존재 여부를 노출하지 않음
            return Err(ModuleError::InvalidToken);
        }
        Ok(link)
    }

    /// The installed module `name` was replaced on disk. Running instances
    /// would keep executing the stale version, so every client that has it
    /// loaded is killed; its death handling then releases the tokens.
    pub fn on_module_updated(&self, name: &str) {
        let clients: Vec<ClientId> = {
            let loaded = self.lock_loaded();
            loaded
                .iter()
                .filter(|(_, modules)| modules.contains(name))
                .map(|(client, _)| *client)
                .collect()
        };
        tracing::info!(
            "Module '{}' updated; killing {} client(s) running the old version",
            name,
            clients.len()
        );
        for client in clients {
            self.clients.kill(client, &format!("module '{name}' updated"));
        }
    }

    /// Human-readable diagnostic snapshot.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "module manager state:");
        let _ = writeln!(out, "links: {}", self.lock_links().len());
        self.registry.dump(&mut out);
        self.provider.dump(&mut out);
        out
    }
}
