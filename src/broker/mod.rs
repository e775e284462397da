//! Broker core
//!
//! The server surface: configuration, listener setup, the connection
//! registry and graceful shutdown. Per-connection protocol handling
//! lives in [`connection`]; routing in [`router`].

mod connection;
mod retained;
mod router;

pub use connection::{Connection, ConnectionError};
pub use retained::{RetainedMessage, RetainedStore};
pub use router::Router;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::hooks::{contain_panic, DefaultHooks, Hooks};
use crate::persistence::{MemoryBackend, SessionBackend};
use crate::protocol::{Publish, QoS};
use crate::session::{Session, SessionLimits};
use crate::topic::Subscription;
use crate::transport::WsStream;

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TCP bind address
    pub bind_addr: SocketAddr,
    /// WebSocket bind address (optional)
    pub ws_bind_addr: Option<SocketAddr>,
    /// WebSocket upgrade path
    pub ws_path: String,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Maximum accepted packet size in bytes
    pub max_packet_size: usize,
    /// How long a connection may sit idle before its CONNECT arrives
    pub connect_timeout: Duration,
    /// Upper bound applied to the client-requested keep alive
    pub max_keep_alive: u16,
    /// Highest QoS granted on subscriptions
    pub max_qos: QoS,
    /// Whether retained messages are stored
    pub retain_available: bool,
    /// Per-session pending queue bound
    pub max_pending: usize,
    /// Per-session in-flight window
    pub max_inflight: usize,
    /// Outbound channel capacity per connection
    pub outbound_capacity: usize,
    /// Writer drain allowance during close and shutdown
    pub shutdown_grace: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 1883)),
            ws_bind_addr: None,
            ws_path: "/mqtt".to_string(),
            max_connections: 100_000,
            max_packet_size: 1024 * 1024,
            connect_timeout: Duration::from_secs(10),
            max_keep_alive: u16::MAX,
            max_qos: QoS::ExactlyOnce,
            retain_available: true,
            max_pending: 1000,
            max_inflight: 32,
            outbound_capacity: 1024,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl BrokerConfig {
    pub(crate) fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            max_pending: self.max_pending,
            max_inflight: self.max_inflight,
        }
    }
}

/// The MQTT broker
pub struct Broker {
    router: Arc<Router>,
    hooks: Arc<dyn Hooks>,
    persistence: Arc<dyn SessionBackend>,
    shutdown: broadcast::Sender<()>,
}

impl Broker {
    /// Create a broker with default hooks (allow everything) and the
    /// in-memory persistence backend
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_hooks(config, Arc::new(DefaultHooks))
    }

    /// Create a broker with custom hooks
    pub fn with_hooks(config: BrokerConfig, hooks: Arc<dyn Hooks>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            router: Arc::new(Router::new(config)),
            hooks,
            persistence: Arc::new(MemoryBackend::new()),
            shutdown,
        }
    }

    /// Replace the persistence backend
    pub fn with_persistence(mut self, persistence: Arc<dyn SessionBackend>) -> Self {
        self.persistence = persistence;
        self
    }

    /// Run the broker until [`Broker::stop`] is called.
    ///
    /// Binds the TCP listener (and the WebSocket listener when
    /// configured), restores persisted sessions, then accepts
    /// connections.
    pub async fn run(&self) -> Result<(), std::io::Error> {
        self.restore_sessions().await;

        let listener = TcpListener::bind(self.router.config.bind_addr).await?;
        info!("MQTT/TCP listening on {}", self.router.config.bind_addr);

        if let Some(ws_addr) = self.router.config.ws_bind_addr {
            let ws_listener = TcpListener::bind(ws_addr).await?;
            info!(
                "MQTT/WebSocket listening on {} (path: {})",
                ws_addr, self.router.config.ws_path
            );

            let router = self.router.clone();
            let hooks = self.hooks.clone();
            let persistence = self.persistence.clone();
            let shutdown = self.shutdown.clone();
            let ws_path = self.router.config.ws_path.clone();

            tokio::spawn(async move {
                let mut shutdown_rx = shutdown.subscribe();
                loop {
                    tokio::select! {
                        result = ws_listener.accept() => {
                            match result {
                                Ok((stream, addr)) => {
                                    let router = router.clone();
                                    let hooks = hooks.clone();
                                    let persistence = persistence.clone();
                                    let shutdown = shutdown.clone();
                                    let ws_path = ws_path.clone();

                                    tokio::spawn(async move {
                                        match WsStream::accept_with_path(stream, &ws_path).await {
                                            Ok(ws_stream) => {
                                                serve_connection(
                                                    ws_stream,
                                                    addr,
                                                    router,
                                                    hooks,
                                                    persistence,
                                                    shutdown,
                                                )
                                                .await;
                                            }
                                            Err(e) => {
                                                debug!("WebSocket handshake failed for {}: {}", addr, e);
                                            }
                                        }
                                    });
                                }
                                Err(e) => {
                                    error!("failed to accept WebSocket connection: {}", e);
                                }
                            }
                        }
                        _ = shutdown_rx.recv() => break,
                    }
                }
            });
        }

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("new TCP connection from {}", addr);
                            let _ = stream.set_nodelay(true);
                            let router = self.router.clone();
                            let hooks = self.hooks.clone();
                            let persistence = self.persistence.clone();
                            let shutdown = self.shutdown.clone();
                            tokio::spawn(async move {
                                serve_connection(stream, addr, router, hooks, persistence, shutdown)
                                    .await;
                            });
                        }
                        Err(e) => {
                            error!("failed to accept TCP connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        Ok(())
    }

    /// Signal shutdown and wait up to `grace` for connections to drain,
    /// then fire the stop hook.
    pub async fn stop(&self, grace: Duration) {
        let _ = self.shutdown.send(());

        let deadline = tokio::time::Instant::now() + grace;
        while !self.router.connections.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        contain_panic("on_stop", (), self.hooks.on_stop()).await;
    }

    /// Publish a message on the server's behalf
    pub fn publish(&self, topic: Arc<str>, payload: Bytes, qos: QoS, retain: bool) {
        let publish = Publish {
            dup: false,
            qos,
            retain,
            topic,
            packet_id: None,
            payload,
        };
        self.router.publish(&publish);
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.router.connections.len()
    }

    /// Number of stored sessions
    pub fn session_count(&self) -> usize {
        self.router.sessions.len()
    }

    /// Number of retained messages
    pub fn retained_count(&self) -> usize {
        self.router.retained.len()
    }

    /// Rebuild sessions saved by the persistence port
    async fn restore_sessions(&self) {
        let snapshots = match self.persistence.load_sessions().await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                error!("failed to load persisted sessions: {}", e);
                return;
            }
        };

        for snapshot in snapshots {
            let client_id: Arc<str> = snapshot.client_id.as_str().into();
            let mut session = Session::new(
                client_id.clone(),
                false,
                self.router.config.session_limits(),
            );
            snapshot.restore_into(&mut session);

            for (filter, qos) in &session.subscriptions {
                self.router.subscriptions.subscribe(
                    filter,
                    Subscription {
                        client_id: client_id.clone(),
                        qos: *qos,
                    },
                );
            }

            self.router
                .sessions
                .insert(Arc::new(parking_lot::RwLock::new(session)));
        }

        if self.router.sessions.len() > 0 {
            info!("restored {} persisted sessions", self.router.sessions.len());
        }
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

/// Drive one accepted transport connection to completion
async fn serve_connection<S>(
    stream: S,
    addr: SocketAddr,
    router: Arc<Router>,
    hooks: Arc<dyn Hooks>,
    persistence: Arc<dyn SessionBackend>,
    shutdown: broadcast::Sender<()>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    if !contain_panic("on_accept", false, hooks.on_accept(addr)).await {
        debug!("connection from {} refused by accept hook", addr);
        return;
    }

    if router.connections.len() >= router.config.max_connections {
        debug!("connection limit reached, dropping {}", addr);
        return;
    }

    let mut conn = Connection::new(stream, addr, router, hooks, persistence, shutdown.subscribe());
    if let Err(e) = conn.run().await {
        debug!("connection {} closed: {}", addr, e);
    }
}

static ASSIGNED_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a client identifier for an empty-client-id CONNECT:
/// 16 bytes hex encoded, 8 random and 8 from a process-wide counter so
/// identifiers never repeat within a process lifetime.
pub(crate) fn generate_client_id() -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let random = RandomState::new().build_hasher().finish();
    let counter = ASSIGNED_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:016x}{:016x}", random, counter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generated_client_ids_are_unique() {
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let id = generate_client_id();
            assert_eq!(id.len(), 32);
            assert!(seen.insert(id));
        }
    }
}
