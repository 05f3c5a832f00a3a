//! Per-client worker connections.
//!
//! The [`ConnectionProvider`] owns at most one worker connection per client
//! identity — the containment boundary: a worker process is shared by all
//! modules loaded by one client and never shared across clients. Binding is
//! lazy (no worker exists until the first load) and reference-counted (the
//! connection is torn down when its last hosted module goes away).
//!
//! A dropped connection is marked `Dead` and is not reconnected inline; the
//! next operation against it fails instead of hanging.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::Value;
use tokio::sync::watch;

use crate::link::ModuleLink;
use crate::resolver::ModuleMetadata;
use crate::token::{ClientId, ModuleToken};

/// Lifecycle of one client's worker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection entry exists for the client.
    Unbound,
    /// A bind is in flight; callers wait for its outcome.
    Binding,
    Bound,
    /// The connection dropped; operations fail until the entry is released.
    Dead,
}

/// Failure to establish a worker connection.
#[derive(thiserror::Error, Debug)]
pub enum BindError {
    /// Never going to succeed — e.g. no worker service installed.
    #[error("worker service unavailable: {0}")]
    WorkerUnavailable(String),

    #[error("failed to bind worker process: {0}")]
    Failed(String),
}

#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
    #[error("worker connection for client {0} is dead")]
    Dead(ClientId),

    #[error(transparent)]
    Bind(#[from] BindError),
}

/// The worker endpoint rejected or lost the request.
#[derive(thiserror::Error, Debug)]
#[error("worker endpoint disconnected: {0}")]
pub struct RelayError(pub String);

/// Callbacks the backend fires for connection lifecycle events.
pub struct ConnectionEvents {
    pub on_disconnected: Box<dyn Fn() + Send + Sync>,
}

/// Remote endpoint of a bound worker process. `load_module` is
/// fire-and-forget: the result arrives later through the [`ModuleLink`].
pub trait WorkerEndpoint: Send + Sync {
    fn load_module(
        &self,
        token: ModuleToken,
        metadata: ModuleMetadata,
        params: Value,
        link: Arc<ModuleLink>,
    ) -> Result<(), RelayError>;
}

impl std::fmt::Debug for dyn WorkerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WorkerEndpoint")
    }
}

/// Process/connection backend: starts, stops and kills worker processes.
pub trait WorkerBackend: Send + Sync {
    /// Start the worker process for `client` (if needed) and bind to it.
    /// Returns synchronously with the endpoint or a bind error; later
    /// connection loss is reported through `events`.
    fn start_and_bind(
        &self,
        client: ClientId,
        events: ConnectionEvents,
    ) -> Result<Arc<dyn WorkerEndpoint>, BindError>;

    /// Release the worker process resources for `client`.
    fn unbind(&self, client: ClientId);

    /// Kill the worker process for `client`. Best-effort, not retried.
    fn terminate(&self, client: ClientId, reason: &str);
}

struct ClientConnection {
    state: ConnectionState,
    endpoint: Option<Arc<dyn WorkerEndpoint>>,
    /// Number of tokens hosted on this connection.
    hosted: usize,
    /// Wakes callers waiting for an in-flight bind to settle.
    settled: watch::Sender<ConnectionState>,
}

/// Owns the per-client connection table. Locks guard only the bookkeeping;
/// backend calls are made outside the critical section.
pub struct ConnectionProvider {
    backend: Arc<dyn WorkerBackend>,
    connections: Mutex<HashMap<ClientId, ClientConnection>>,
}

impl ConnectionProvider {
    pub fn new(backend: Arc<dyn WorkerBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            connections: Mutex::new(HashMap::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ClientId, ClientConnection>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get the client's worker endpoint, binding lazily on first use.
    ///
    /// A live connection has its hosted-module count incremented and is
    /// returned directly. A dead connection fails. If another caller's bind
    /// is in flight, this waits for that bind to settle and then re-checks
    /// rather than starting a second worker for the same client.
    pub async fn bind(
        self: &Arc<Self>,
        client: ClientId,
    ) -> Result<Arc<dyn WorkerEndpoint>, ConnectionError> {
        loop {
            let mut settled_rx = {
                let mut conns = self.lock();
                match conns.get_mut(&client) {
                    None => {
                        let (tx, _rx) = watch::channel(ConnectionState::Binding);
                        conns.insert(
                            client,
                            ClientConnection {
                                state: ConnectionState::Binding,
                                endpoint: None,
                                hosted: 0,
                                settled: tx,
                            },
                        );
                        break;
                    }
                    Some(conn) => match conn.state {
                        ConnectionState::Bound => match conn.endpoint.clone() {
                            Some(endpoint) => {
                                conn.hosted += 1;
                                tracing::debug!(
                                    "Reusing worker connection for client {} ({} modules hosted)",
                                    client,
                                    conn.hosted
                                );
                                return Ok(endpoint);
                            }
                            None => return Err(ConnectionError::Dead(client)),
                        },
                        ConnectionState::Binding => conn.settled.subscribe(),
                        ConnectionState::Dead | ConnectionState::Unbound => {
                            return Err(ConnectionError::Dead(client))
                        }
                    },
                }
            };
            // Wait for the in-flight bind to settle, then re-check. A
            // dropped sender (entry removed) also wakes us.
            let _ = settled_rx.changed().await;
        }

        // This caller owns the bind. The backend call happens outside the
        // lock so a slow bind does not block unrelated clients.
        tracing::info!("Binding worker process for client {}", client);
        let events = self.events_for(client);
        match self.backend.start_and_bind(client, events) {
            Ok(endpoint) => {
                let mut conns = self.lock();
                let Some(conn) = conns.get_mut(&client) else {
                    // Entry vanished while binding; release the worker.
                    drop(conns);
                    self.backend.unbind(client);
                    return Err(ConnectionError::Dead(client));
                };
                if conn.state == ConnectionState::Dead {
                    drop(conns);
                    self.backend.unbind(client);
                    return Err(ConnectionError::Dead(client));
                }
                conn.state = ConnectionState::Bound;
                conn.endpoint = Some(endpoint.clone());
                conn.hosted = 1;
                let _ = conn.settled.send(ConnectionState::Bound);
                tracing::info!("Worker process bound for client {}", client);
                Ok(endpoint)
            }
            Err(e) => {
                tracing::error!("Failed to bind worker for client {}: {}", client, e);
                // No connection state is recorded for a failed bind; waiters
                // wake on the dropped sender and retry or fail on their own.
                self.lock().remove(&client);
                Err(e.into())
            }
        }
    }

    /// Drop one hosted-module reference. When the count reaches zero the
    /// connection is torn down and the worker process released.
    pub fn unbind(&self, client: ClientId) {
        let teardown = {
            let mut conns = self.lock();
            match conns.get_mut(&client) {
                None => {
                    tracing::warn!("unbind for client {} with no connection", client);
                    false
                }
                Some(conn) => {
                    conn.hosted = conn.hosted.saturating_sub(1);
                    if conn.hosted == 0 && conn.state != ConnectionState::Binding {
                        conns.remove(&client);
                        true
                    } else {
                        false
                    }
                }
            }
        };
        if teardown {
            tracing::info!("Last module unloaded for client {}, releasing worker process", client);
            self.backend.unbind(client);
        }
    }

    /// The underlying connection dropped (worker crash). Clears the cached
    /// endpoint; subsequent operations fail rather than hang.
    pub fn mark_dead(&self, client: ClientId) {
        let mut conns = self.lock();
        if let Some(conn) = conns.get_mut(&client) {
            tracing::warn!("Worker connection for client {} dropped", client);
            conn.state = ConnectionState::Dead;
            conn.endpoint = None;
            let _ = conn.settled.send(ConnectionState::Dead);
        }
    }

    /// Kill the worker process for `client`. Best-effort.
    pub fn terminate(&self, client: ClientId, reason: &str) {
        self.backend.terminate(client, reason);
    }

    pub fn state(&self, client: ClientId) -> ConnectionState {
        self.lock()
            .get(&client)
            .map(|c| c.state)
            .unwrap_or(ConnectionState::Unbound)
    }

    pub fn hosted_count(&self, client: ClientId) -> usize {
        self.lock().get(&client).map(|c| c.hosted).unwrap_or(0)
    }

    /// Append diagnostic lines for `dump()`.
    pub fn dump(&self, out: &mut String) {
        let conns = self.lock();
        if conns.is_empty() {
            let _ = writeln!(out, "connections: none");
            return;
        }
        let _ = writeln!(out, "connections: {}", conns.len());
        for (client, conn) in conns.iter() {
            let _ = writeln!(
                out,
                "  client: {}, state: {:?}, hosted modules: {}",
                client, conn.state, conn.hosted
            );
        }
    }

    fn events_for(self: &Arc<Self>, client: ClientId) -> ConnectionEvents {
        let provider: Weak<Self> = Arc::downgrade(self);
        ConnectionEvents {
            on_disconnected: Box::new(move || {
                if let Some(provider) = provider.upgrade() {
                    provider.mark_dead(client);
                }
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 바인드/언바인드/종료 호출을 기록하는 백엔드
    #[derive(Default)]
    struct FakeBackend {
        binds: AtomicUsize,
        unbinds: AtomicUsize,
        terminates: AtomicUsize,
        fail_permanently: bool,
    }

    struct NullEndpoint;

    impl WorkerEndpoint for NullEndpoint {
        fn load_module(
            &self,
            _token: ModuleToken,
            _metadata: ModuleMetadata,
            _params: Value,
            _link: Arc<ModuleLink>,
        ) -> Result<(), RelayError> {
            Ok(())
        }
    }

    impl WorkerBackend for FakeBackend {
        fn start_and_bind(
            &self,
            _client: ClientId,
            _events: ConnectionEvents,
        ) -> Result<Arc<dyn WorkerEndpoint>, BindError> {
            if self.fail_permanently {
                return Err(BindError::WorkerUnavailable("no worker installed".into()));
            }
            self.binds.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NullEndpoint))
        }
        fn unbind(&self, _client: ClientId) {
            self.unbinds.fetch_add(1, Ordering::SeqCst);
        }
        fn terminate(&self, _client: ClientId, _reason: &str) {
            self.terminates.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn bind_reuses_connection_for_same_client() {
        let backend = Arc::new(FakeBackend::default());
        let provider = ConnectionProvider::new(backend.clone());

        provider.bind(ClientId(1)).await.unwrap();
        provider.bind(ClientId(1)).await.unwrap();

        assert_eq!(backend.binds.load(Ordering::SeqCst), 1);
        assert_eq!(provider.hosted_count(ClientId(1)), 2);
        assert_eq!(provider.state(ClientId(1)), ConnectionState::Bound);
    }

    #[tokio::test]
    async fn one_worker_per_client_even_under_binding_race() {
        let backend = Arc::new(FakeBackend::default());
        let provider = ConnectionProvider::new(backend.clone());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let provider = provider.clone();
            handles.push(tokio::spawn(async move { provider.bind(ClientId(1)).await }));
        }
        for h in handles {
            assert!(h.await.unwrap().is_ok());
        }
        assert_eq!(backend.binds.load(Ordering::SeqCst), 1);
        assert_eq!(provider.hosted_count(ClientId(1)), 8);
    }

    #[tokio::test]
    async fn different_clients_get_different_workers() {
        let backend = Arc::new(FakeBackend::default());
        let provider = ConnectionProvider::new(backend.clone());

        provider.bind(ClientId(1)).await.unwrap();
        provider.bind(ClientId(2)).await.unwrap();

        assert_eq!(backend.binds.load(Ordering::SeqCst), 2);
        assert_eq!(provider.hosted_count(ClientId(1)), 1);
        assert_eq!(provider.hosted_count(ClientId(2)), 1);
    }

    #[tokio::test]
    async fn unbind_tears_down_only_at_zero() {
        let backend = Arc::new(FakeBackend::default());
        let provider = ConnectionProvider::new(backend.clone());

        provider.bind(ClientId(1)).await.unwrap();
        provider.bind(ClientId(1)).await.unwrap();

        provider.unbind(ClientId(1));
        assert_eq!(backend.unbinds.load(Ordering::SeqCst), 0);
        assert_eq!(provider.hosted_count(ClientId(1)), 1);

        provider.unbind(ClientId(1));
        assert_eq!(backend.unbinds.load(Ordering::SeqCst), 1);
        assert_eq!(provider.state(ClientId(1)), ConnectionState::Unbound);
    }

    #[tokio::test]
    async fn unbind_without_connection_is_a_noop() {
        let backend = Arc::new(FakeBackend::default());
        let provider = ConnectionProvider::new(backend.clone());
        provider.unbind(ClientId(9));
        assert_eq!(backend.unbinds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn bind_failure_records_no_state() {
        let backend = Arc::new(FakeBackend { fail_permanently: true, ..Default::default() });
        let provider = ConnectionProvider::new(backend);

        let err = provider.bind(ClientId(1)).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Bind(BindError::WorkerUnavailable(_))));
        assert_eq!(provider.state(ClientId(1)), ConnectionState::Unbound);
        assert_eq!(provider.hosted_count(ClientId(1)), 0);
    }

    #[tokio::test]
    async fn dead_connection_fails_next_bind() {
        let backend = Arc::new(FakeBackend::default());
        let provider = ConnectionProvider::new(backend.clone());

        provider.bind(ClientId(1)).await.unwrap();
        provider.mark_dead(ClientId(1));
        assert_eq!(provider.state(ClientId(1)), ConnectionState::Dead);

        let err = provider.bind(ClientId(1)).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Dead(_)));
        // 자동 재연결 없음
        assert_eq!(backend.binds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dump_reports_connection_state() {
        let backend = Arc::new(FakeBackend::default());
        let provider = ConnectionProvider::new(backend);
        provider.bind(ClientId(5)).await.unwrap();

        let mut out = String::new();
        provider.dump(&mut out);
        assert!(out.contains("connections: 1"));
        assert!(out.contains("hosted modules: 1"));
    }
}
