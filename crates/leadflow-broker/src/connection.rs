//! Supervised broker connections.
//!
//! One `ConnectionManager` is shared by every queue and worker in the
//! process. Connections are multiplexed and safe for concurrent use;
//! callers clone a handle per operation.

use std::sync::atomic::{AtomicBool, Ordering};

use redis::aio::{ConnectionLike, MultiplexedConnection};
use redis::cluster::ClusterClientBuilder;
use redis::cluster_async::ClusterConnection;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::error::{BrokerError, BrokerErrorKind, BrokerResult};
use crate::retry::retry_async;

/// Lifecycle events emitted by the connection manager.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// A connection was established
    Connect,
    /// The connection answered a ping and is usable
    Ready,
    /// A connection attempt or operation failed
    Error {
        kind: BrokerErrorKind,
        message: String,
    },
    /// The manager was closed
    Close,
    /// A reconnect attempt is about to start
    Reconnecting { attempt: u32 },
}

/// A live connection handle, standalone or clustered.
///
/// Cloning is cheap; both variants multiplex over one underlying
/// transport.
#[derive(Clone)]
pub enum BrokerConnection {
    Standalone(MultiplexedConnection),
    Cluster(ClusterConnection),
}

impl ConnectionLike for BrokerConnection {
    fn req_packed_command<'a>(
        &'a mut self,
        cmd: &'a redis::Cmd,
    ) -> redis::RedisFuture<'a, redis::Value> {
        match self {
            BrokerConnection::Standalone(conn) => conn.req_packed_command(cmd),
            BrokerConnection::Cluster(conn) => conn.req_packed_command(cmd),
        }
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a redis::Pipeline,
        offset: usize,
        count: usize,
    ) -> redis::RedisFuture<'a, Vec<redis::Value>> {
        match self {
            BrokerConnection::Standalone(conn) => conn.req_packed_commands(cmd, offset, count),
            BrokerConnection::Cluster(conn) => conn.req_packed_commands(cmd, offset, count),
        }
    }

    fn get_db(&self) -> i64 {
        match self {
            BrokerConnection::Standalone(conn) => conn.get_db(),
            BrokerConnection::Cluster(conn) => conn.get_db(),
        }
    }
}

/// Establishes and supervises the connection to the shared broker.
pub struct ConnectionManager {
    config: BrokerConfig,
    state: Mutex<Option<BrokerConnection>>,
    events: broadcast::Sender<BrokerEvent>,
    closed: AtomicBool,
}

impl ConnectionManager {
    /// Create a manager; no connection is made until `connect`.
    pub fn new(config: BrokerConfig) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            config,
            state: Mutex::new(None),
            events,
            closed: AtomicBool::new(false),
        }
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    /// True while a connection is held.
    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.is_some()
    }

    /// Establish the connection, retrying with capped backoff.
    ///
    /// Idempotent: calling connect on an already-connected manager logs
    /// and returns immediately.
    pub async fn connect(&self) -> BrokerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }

        let mut state = self.state.lock().await;
        if state.is_some() {
            info!("broker already connected, connect is a no-op");
            return Ok(());
        }

        let events = self.events.clone();
        let config = self.config.clone();

        let conn = retry_async(
            &self.config.retry,
            || {
                let events = events.clone();
                let config = config.clone();
                async move {
                    match Self::establish(&config).await {
                        Ok(conn) => Ok(conn),
                        Err(e) => {
                            Self::log_classified(&e);
                            let _ = events.send(BrokerEvent::Error {
                                kind: e.kind(),
                                message: e.to_string(),
                            });
                            Err(e)
                        }
                    }
                }
            },
            |attempt| {
                let _ = events.send(BrokerEvent::Reconnecting { attempt });
            },
        )
        .await?;

        *state = Some(conn);
        let _ = self.events.send(BrokerEvent::Connect);
        let _ = self.events.send(BrokerEvent::Ready);
        info!(
            mode = if self.config.is_cluster() { "cluster" } else { "standalone" },
            "broker connected"
        );
        Ok(())
    }

    /// Get a connection handle, connecting first if necessary.
    pub async fn connection(&self) -> BrokerResult<BrokerConnection> {
        {
            let state = self.state.lock().await;
            if let Some(conn) = state.as_ref() {
                return Ok(conn.clone());
            }
        }
        self.connect().await?;
        let state = self.state.lock().await;
        state.clone().ok_or(BrokerError::Closed)
    }

    /// Drop the cached connection after a transport-classified failure.
    ///
    /// Multiplexed connections do not recover from a dropped transport on
    /// their own; clearing the cache here makes the next `connection()`
    /// call re-run `connect` with backoff. Non-transport errors (bad
    /// command, timeout on a live link) leave the connection in place.
    pub async fn note_failure(&self, error: &BrokerError) {
        if error.kind() != BrokerErrorKind::Connection || self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock().await;
        if state.take().is_some() {
            warn!(error = %error, "dropping broker connection after transport error");
            let _ = self.events.send(BrokerEvent::Error {
                kind: error.kind(),
                message: error.to_string(),
            });
        }
    }

    /// Open a fresh connection outside the shared cached one.
    ///
    /// Blocking stream reads stall every command multiplexed on the same
    /// transport, so each consumer loop reads over its own connection.
    pub async fn dedicated_connection(&self) -> BrokerResult<BrokerConnection> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        Self::establish(&self.config).await
    }

    /// Drop the connection and refuse further use. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("broker connection manager already closed");
            return;
        }
        let mut state = self.state.lock().await;
        *state = None;
        let _ = self.events.send(BrokerEvent::Close);
        info!("broker connection closed");
    }

    async fn establish(config: &BrokerConfig) -> BrokerResult<BrokerConnection> {
        let mut conn = if config.is_cluster() {
            let mut builder = ClusterClientBuilder::new(config.cluster_nodes.clone())
                .retries(config.max_redirections);
            if config.read_from_replicas {
                builder = builder.read_from_replicas();
            }
            let client = builder.build()?;
            BrokerConnection::Cluster(client.get_async_connection().await?)
        } else {
            let client = redis::Client::open(config.url())?;
            BrokerConnection::Standalone(client.get_multiplexed_async_connection().await?)
        };

        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong != "PONG" {
            return Err(BrokerError::connection_failed(format!(
                "unexpected ping reply: {pong}"
            )));
        }
        Ok(conn)
    }

    /// One log line per error class; same escalation path for all.
    fn log_classified(e: &BrokerError) {
        match e.kind() {
            BrokerErrorKind::Connection => {
                warn!(classification = "connection", error = %e, "broker transport error")
            }
            BrokerErrorKind::Timeout => {
                warn!(classification = "timeout", error = %e, "broker operation timed out")
            }
            BrokerErrorKind::Operation => {
                error!(classification = "operation", error = %e, "broker operation error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::{JoinHandle, JoinSet};

    use crate::retry::RetryConfig;

    /// Minimal broker stand-in: answers every RESP command with +PONG.
    struct PongServer {
        addr: SocketAddr,
        accepted: std::sync::Arc<AtomicUsize>,
        task: JoinHandle<()>,
    }

    impl PongServer {
        async fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            Self::from_listener(listener)
        }

        async fn start_at(addr: SocketAddr) -> Self {
            let listener = TcpListener::bind(addr).await.unwrap();
            Self::from_listener(listener)
        }

        fn from_listener(listener: TcpListener) -> Self {
            let addr = listener.local_addr().unwrap();
            let accepted = std::sync::Arc::new(AtomicUsize::new(0));
            let counter = std::sync::Arc::clone(&accepted);
            // Sockets live in a JoinSet owned by the accept task, so
            // aborting it tears down every open connection as well.
            let task = tokio::spawn(async move {
                let mut conns = JoinSet::new();
                loop {
                    match listener.accept().await {
                        Ok((sock, _)) => {
                            counter.fetch_add(1, Ordering::SeqCst);
                            conns.spawn(Self::serve(sock));
                        }
                        Err(_) => return,
                    }
                }
            });
            Self {
                addr,
                accepted,
                task,
            }
        }

        async fn serve(mut sock: TcpStream) {
            let mut buf = [0u8; 1024];
            // One reply per top-level RESP array header ('*' at the start
            // of a line), so pipelined setup commands stay in sync.
            let mut at_line_start = true;
            loop {
                match sock.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => {
                        let mut replies = 0usize;
                        for &b in &buf[..n] {
                            if at_line_start && b == b'*' {
                                replies += 1;
                            }
                            at_line_start = b == b'\n';
                        }
                        for _ in 0..replies {
                            if sock.write_all(b"+PONG\r\n").await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }

        fn accepted(&self) -> usize {
            self.accepted.load(Ordering::SeqCst)
        }

        fn stop(&self) {
            self.task.abort();
        }
    }

    fn config_for(addr: SocketAddr) -> BrokerConfig {
        BrokerConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            retry: RetryConfig::new("test_connect")
                .with_max_retries(1)
                .with_base_delay(Duration::from_millis(5)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn reestablishes_after_transport_drop() {
        let server = PongServer::start().await;
        let addr = server.addr;

        let manager = ConnectionManager::new(config_for(addr));
        manager.connect().await.unwrap();
        assert!(manager.is_connected().await);

        server.stop();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The cached connection is dead; an operation on it fails
        let mut conn = manager.connection().await.unwrap();
        let err = redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .unwrap_err();
        let err = BrokerError::Redis(err);
        assert_eq!(err.kind(), BrokerErrorKind::Connection);

        manager.note_failure(&err).await;
        assert!(!manager.is_connected().await);

        // While the broker is down, reconnect attempts back off and
        // announce themselves
        let mut events = manager.subscribe();
        assert!(manager.connection().await.is_err());
        let mut saw_reconnecting = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, BrokerEvent::Reconnecting { .. }) {
                saw_reconnecting = true;
            }
        }
        assert!(saw_reconnecting);

        // Broker comes back on the same address; the next call recovers
        let server = PongServer::start_at(addr).await;
        let mut conn = manager.connection().await.unwrap();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await.unwrap();
        assert_eq!(pong, "PONG");
        server.stop();
    }

    #[tokio::test]
    async fn operation_errors_keep_the_connection() {
        let server = PongServer::start().await;
        let manager = ConnectionManager::new(config_for(server.addr));
        manager.connect().await.unwrap();

        let err = BrokerError::enqueue_failed("bad payload");
        manager.note_failure(&err).await;
        assert!(manager.is_connected().await);
        server.stop();
    }

    #[tokio::test]
    async fn dedicated_connection_uses_its_own_transport() {
        let server = PongServer::start().await;
        let manager = ConnectionManager::new(config_for(server.addr));
        manager.connect().await.unwrap();
        assert_eq!(server.accepted(), 1);

        let mut conn = manager.dedicated_connection().await.unwrap();
        assert_eq!(server.accepted(), 2);
        let pong: String = redis::cmd("PING").query_async(&mut conn).await.unwrap();
        assert_eq!(pong, "PONG");

        // The shared cached connection is untouched
        assert!(manager.is_connected().await);
        server.stop();
    }
}
