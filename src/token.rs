//! Token registry — stable identity for each (client, module) pair.
//!
//! A [`ModuleToken`] is the opaque handle a client receives when a load
//! attempt begins and uses for all later calls. Tokens are only minted by
//! the [`TokenRegistry`]; everything else just carries them around.

use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The calling principal. Keys both the token registry's client axis and
/// the connection provider's worker axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u32);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identity for one loaded module instance for one client.
///
/// Created only by [`TokenRegistry::create_or_get`]; callers treat it as an
/// opaque handle. The registry validates it on every use, so a fabricated
/// token is rejected as `INVALID_TOKEN` rather than acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleToken(Uuid);

impl ModuleToken {
    pub(crate) fn mint() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ModuleToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Default)]
struct TokenMaps {
    // (client, module name) -> token, plus the reverse for destroy/owner
    forward: HashMap<(ClientId, String), ModuleToken>,
    reverse: HashMap<ModuleToken, (ClientId, String)>,
}

/// Bidirectional map between module keys and tokens. Pure in-memory
/// bookkeeping; both directions are mutated under one lock.
#[derive(Default)]
pub struct TokenRegistry {
    maps: Mutex<TokenMaps>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutex 락 획득 헬퍼 — poisoned여도 복구하여 계속 진행
    fn lock(&self) -> MutexGuard<'_, TokenMaps> {
        self.maps.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the existing token for the `(client, module)` pair, or mint
    /// and record a new one. Atomic with respect to racing callers: the
    /// first insert wins and every other caller observes the winner's token.
    pub fn create_or_get(&self, client: ClientId, module: &str) -> ModuleToken {
        let mut maps = self.lock();
        let key = (client, module.to_string());
        if let Some(token) = maps.forward.get(&key) {
            return *token;
        }
        let token = ModuleToken::mint();
        maps.forward.insert(key.clone(), token);
        maps.reverse.insert(token, key);
        tracing::debug!("Minted token {} for client {} module '{}'", token, client, module);
        token
    }

    /// Remove both directions of the mapping. Idempotent: returns `true`
    /// if the token was present, `false` if it was already gone.
    pub fn destroy(&self, token: &ModuleToken) -> bool {
        let mut maps = self.lock();
        match maps.reverse.remove(token) {
            Some(key) => {
                maps.forward.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Owning `(client, module)` pair for a live token.
    pub fn owner(&self, token: &ModuleToken) -> Option<(ClientId, String)> {
        self.lock().reverse.get(token).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append diagnostic lines for `dump()`.
    pub fn dump(&self, out: &mut String) {
        let maps = self.lock();
        if maps.forward.is_empty() {
            let _ = writeln!(out, "tokens: none");
            return;
        }
        let _ = writeln!(out, "tokens: {}", maps.forward.len());
        for ((client, module), token) in maps.forward.iter() {
            let _ = writeln!(out, "  client: {}, module: {}, token: {}", client, module, token);
        }
    }
}
