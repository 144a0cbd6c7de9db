use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::network::{Connection, ConnectionEvent, ConnectionId, EventBus, EventHook, ServerEvent};
use crate::AppError::IllegalStateError;
use crate::AppResult;

use super::{NetworkConfig, Shutdown};

type Registry = DashMap<ConnectionId, Arc<Connection>>;

/// TCP server accepting [`Connection`]s and tracking the live ones by id.
///
/// Every accepted connection gets a cancellation scope derived from the server's, so
/// stopping the server reaches every client. Lifecycle changes are published as
/// [`ServerEvent`]s to subscribers.
#[derive(Debug)]
pub struct Server {
    config: NetworkConfig,
    shutdown: parking_lot::Mutex<Shutdown>,
    registry: Arc<Registry>,
    events: Arc<EventBus<ServerEvent>>,
    running: AtomicBool,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,
}

impl Server {
    pub fn new(config: NetworkConfig) -> Arc<Server> {
        Arc::new(Server {
            config,
            shutdown: parking_lot::Mutex::new(Shutdown::new()),
            registry: Arc::new(DashMap::new()),
            events: Arc::new(EventBus::new()),
            running: AtomicBool::new(false),
            local_addr: parking_lot::Mutex::new(None),
        })
    }

    pub fn subscribe(&self) -> async_channel::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_stop_requested(&self) -> bool {
        self.shutdown.lock().is_shutdown()
    }

    /// Address the listener is bound to, available once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn connection(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.registry.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.registry
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Bind the listener, emit `Started` and run the accept loop in the background.
    ///
    /// A stopped server can be started again; it gets a fresh cancellation scope. The scope
    /// is installed before binding, so a `stop` issued while the bind is pending still ends
    /// the accept loop and produces `Stopped`.
    pub async fn start(self: &Arc<Self>) -> AppResult<SocketAddr> {
        let shutdown = {
            let mut current = self.shutdown.lock();
            if self.running.swap(true, Ordering::SeqCst) {
                return Err(IllegalStateError(Cow::Borrowed("server already running")));
            }
            *current = Shutdown::new();
            current.clone()
        };

        let listen_address = self.config.listen_address();
        let bound = match TcpListener::bind(&listen_address).await {
            Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
            Err(err) => Err(err),
        };
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                let error_msg = format!(
                    "Failed to bind server to address: {} - Error: {}",
                    listen_address, err
                );
                error!("{}", error_msg);
                return Err(IllegalStateError(Cow::Owned(error_msg)));
            }
        };

        *self.local_addr.lock() = Some(local_addr);
        info!("tcp server binding to {} for listening", local_addr);
        self.events.emit(ServerEvent::Started(local_addr));
        if shutdown.is_shutdown() {
            debug!("stop requested while binding");
        }

        let server = Arc::clone(self);
        tokio::spawn(async move {
            server.run(listener, shutdown).await;
        });
        Ok(local_addr)
    }

    /// Request the accept loop to end. Returns at once; `Stopped` marks completion.
    pub fn stop(&self) {
        info!("tcp server stop requested");
        self.shutdown.lock().trigger();
    }

    /// Accept connections until the scope is cancelled or accepting fails for good.
    ///
    /// Shutdown sequence:
    /// 1. The accept loop exits and the listener is dropped.
    /// 2. Every registered connection is disconnected. Connections whose scope was already
    ///    cancelled through the parent have usually ended on their own by then.
    /// 3. Each receive loop holds a clone of `shutdown_complete_tx`; once every loop has
    ///    run its disconnect hook and exited, the receiver yields `None`.
    /// 4. The registry is cleared, the server is marked not running and `Stopped` fires,
    ///    strictly after every `ClientDisconnected`.
    async fn run(self: Arc<Self>, listener: TcpListener, shutdown: Shutdown) {
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);

        loop {
            let (socket, peer_addr) = tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    debug!("accept loop received shutdown signal");
                    break;
                }
                res = self.accept(&listener) => match res {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        error!(cause = %err, "failed to accept");
                        break;
                    }
                },
            };
            self.register(socket, peer_addr, &shutdown, shutdown_complete_tx.clone());
        }
        drop(listener);

        for connection in self.connections() {
            connection.disconnect().await;
        }
        drop(shutdown_complete_tx);
        debug!("waiting for receive loops to finish...");
        let _ = shutdown_complete_rx.recv().await;

        self.registry.clear();
        self.running.store(false, Ordering::SeqCst);
        info!("tcp server stopped");
        self.events.emit(ServerEvent::Stopped);
    }

    async fn accept(&self, listener: &TcpListener) -> AppResult<(TcpStream, SocketAddr)> {
        let mut backoff = 1;

        loop {
            match listener.accept().await {
                Ok(accepted) => return Ok(accepted),
                Err(err) => {
                    if backoff > self.config.max_accept_backoff_secs {
                        return Err(IllegalStateError(Cow::Owned(format!(
                            "accept tcp server error: {}",
                            err
                        ))));
                    }
                    warn!(backoff, "accept failed, retrying: {}", err);
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff = next_backoff(backoff);
        }
    }

    fn register(
        &self,
        socket: TcpStream,
        peer_addr: SocketAddr,
        shutdown: &Shutdown,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) {
        let connection_id = Uuid::new_v4();
        let connection = Connection::accepted(
            socket,
            connection_id,
            peer_addr,
            shutdown.child(),
            self.config.send_timeout(),
            self.lifecycle_hook(connection_id),
        );
        self.registry.insert(connection_id, Arc::clone(&connection));
        debug!(%connection_id, %peer_addr, "accept new connection");

        connection.start_receive_loop(Some(shutdown_complete_tx));
    }

    /// Forward a connection's events as server events and drop it from the registry when
    /// it disconnects.
    fn lifecycle_hook(&self, connection_id: ConnectionId) -> EventHook {
        let registry = Arc::clone(&self.registry);
        let events = Arc::clone(&self.events);
        Arc::new(move |event: &ConnectionEvent| match event {
            ConnectionEvent::Connected(connection) => {
                events.emit(ServerEvent::ClientConnected(Arc::clone(connection)));
            }
            ConnectionEvent::Disconnected(connection) => {
                if registry.remove(&connection_id).is_none() {
                    warn!(%connection_id, "disconnected connection was not registered");
                }
                events.emit(ServerEvent::ClientDisconnected(Arc::clone(connection)));
            }
        })
    }
}

/// Doubles the accept retry delay, pinned at `u64::MAX` for huge ceilings.
fn next_backoff(backoff: u64) -> u64 {
    backoff.saturating_mul(2)
}

impl Drop for Server {
    fn drop(&mut self) {
        debug!("tcp server dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ephemeral() -> NetworkConfig {
        NetworkConfig {
            port: 0,
            ..NetworkConfig::default()
        }
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let server = Server::new(ephemeral());
        let events = server.subscribe();

        let addr = server.start().await.unwrap();
        assert!(server.is_running());
        assert!(!server.is_stop_requested());
        assert_eq!(server.local_addr(), Some(addr));
        assert!(matches!(events.recv().await.unwrap(), ServerEvent::Started(a) if a == addr));

        server.stop();
        assert!(server.is_stop_requested());
        let stopped = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(stopped, ServerEvent::Stopped));
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_double_start_is_illegal() {
        let server = Server::new(ephemeral());
        server.start().await.unwrap();
        assert!(matches!(server.start().await, Err(IllegalStateError(_))));
        server.stop();
    }

    #[tokio::test]
    async fn test_bind_failure_leaves_server_stopped() {
        let first = Server::new(ephemeral());
        let addr = first.start().await.unwrap();

        let second = Server::new(NetworkConfig {
            port: addr.port(),
            ..NetworkConfig::default()
        });
        assert!(second.start().await.is_err());
        assert!(!second.is_running());
        first.stop();
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let server = Server::new(ephemeral());
        let events = server.subscribe();
        server.start().await.unwrap();
        server.stop();
        loop {
            if let ServerEvent::Stopped = events.recv().await.unwrap() {
                break;
            }
        }

        server.start().await.unwrap();
        assert!(server.is_running());
        assert!(!server.is_stop_requested());
        server.stop();
    }

    #[tokio::test]
    async fn test_stop_while_binding_is_not_lost() {
        let server = Server::new(NetworkConfig {
            ip: "localhost".to_string(),
            port: 0,
            ..NetworkConfig::default()
        });
        let events = server.subscribe();

        let starting = Arc::clone(&server);
        let start = tokio::spawn(async move { starting.start().await });
        while !server.is_running() {
            tokio::task::yield_now().await;
        }
        server.stop();
        assert!(server.is_stop_requested());

        start.await.unwrap().unwrap();
        assert!(server.is_stop_requested());
        let stopped = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let ServerEvent::Stopped = events.recv().await.unwrap() {
                    break;
                }
            }
        })
        .await;
        assert!(stopped.is_ok(), "Stopped not emitted after stop during bind");
        assert!(!server.is_running());
    }

    #[test]
    fn test_backoff_doubles_and_saturates() {
        assert_eq!(next_backoff(1), 2);
        assert_eq!(next_backoff(32), 64);
        assert_eq!(next_backoff(u64::MAX / 2 + 1), u64::MAX);
        assert_eq!(next_backoff(u64::MAX), u64::MAX);
    }

    #[tokio::test]
    async fn test_registry_tracks_clients() {
        let server = Server::new(ephemeral());
        let events = server.subscribe();
        let addr = server.start().await.unwrap();

        let client = Connection::new();
        client.connect("127.0.0.1", addr.port()).await.unwrap();

        let accepted = loop {
            if let ServerEvent::ClientConnected(connection) = events.recv().await.unwrap() {
                break connection;
            }
        };
        let id = accepted.id().expect("accepted connections carry an id");
        assert!(server.connection(&id).is_some());
        assert_eq!(server.connection_count(), 1);

        client.disconnect().await;
        loop {
            if let ServerEvent::ClientDisconnected(connection) = events.recv().await.unwrap() {
                assert_eq!(connection.id(), Some(id));
                break;
            }
        }
        assert!(server.connection(&id).is_none());
        assert_eq!(server.connection_count(), 0);
        server.stop();
    }
}
