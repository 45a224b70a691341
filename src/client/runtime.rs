//! Registry of client connections, keyed by server endpoint.
//!
//! Unregistered sessions to the same endpoint share one [`Connection`]. The
//! runtime counts references and closes the socket when the last session
//! lets go. The server keeps registration per socket, so a session that
//! registers takes its connection out of the registry with
//! [`NetRuntime::claim`], or opens a private one when others still use it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::config::NetConfig;
use crate::connection::{Connection, ConnectionId, ConnectionOptions};
use crate::error::{FramewireError, Result};
use crate::protocol::{ErrorCode, Role};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a server lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

struct Entry {
    conn: Connection,
    refs: usize,
}

/// Owns every client connection of one application.
///
/// Cheaply cloneable; clones share the registry.
#[derive(Clone)]
pub struct NetRuntime {
    connections: Arc<Mutex<HashMap<Endpoint, Entry>>>,
    options: ConnectionOptions,
    connect_timeout: Duration,
}

impl NetRuntime {
    pub fn new() -> Self {
        Self::with_options(ConnectionOptions::default(), DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_options(options: ConnectionOptions, connect_timeout: Duration) -> Self {
        Self {
            connections: Arc::new(Mutex::new(HashMap::new())),
            options,
            connect_timeout,
        }
    }

    pub fn from_config(config: &NetConfig) -> Self {
        Self::with_options(config.connection_options(), config.connect_timeout())
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<Endpoint, Entry>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take a reference to a live connection, forgetting a dead one.
    fn reuse(&self, endpoint: &Endpoint) -> Option<Connection> {
        let mut registry = self.registry();
        match registry.get_mut(endpoint) {
            Some(entry) if entry.conn.is_alive() => {
                entry.refs += 1;
                Some(entry.conn.clone())
            }
            Some(_) => {
                registry.remove(endpoint);
                None
            }
            None => None,
        }
    }

    /// Connect to `endpoint`, or share the existing connection to it.
    ///
    /// Any failure to reach the server is reported as `NoSuchServer`.
    pub async fn connect(&self, endpoint: &Endpoint) -> Result<Connection> {
        if let Some(conn) = self.reuse(endpoint) {
            tracing::debug!(%endpoint, "Reusing connection");
            return Ok(conn);
        }
        let stream = self.open_stream(endpoint).await?;

        // Another task may have connected while we were waiting.
        if let Some(conn) = self.reuse(endpoint) {
            return Ok(conn);
        }
        Ok(self.insert(endpoint.clone(), stream))
    }

    /// Open a connection to `endpoint` that is never shared.
    ///
    /// The caller owns it and closes it; the registry does not track it.
    pub async fn connect_private(&self, endpoint: &Endpoint) -> Result<Connection> {
        let stream = self.open_stream(endpoint).await?;
        let conn = self.spawn(endpoint, stream);
        tracing::info!(%endpoint, conn = conn.id(), "Opened private connection");
        Ok(conn)
    }

    async fn open_stream(&self, endpoint: &Endpoint) -> Result<TcpStream> {
        let connecting = TcpStream::connect((endpoint.host.as_str(), endpoint.port));
        let stream = match tokio::time::timeout(self.connect_timeout, connecting).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::debug!(%endpoint, "Connect failed: {}", e);
                return Err(ErrorCode::NoSuchServer.into());
            }
            Err(_) => {
                tracing::debug!(%endpoint, "Connect timed out");
                return Err(ErrorCode::NoSuchServer.into());
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%endpoint, "Failed to set TCP_NODELAY: {}", e);
        }
        Ok(stream)
    }

    /// Register an already-open stream as the connection to `endpoint`.
    pub fn attach<S>(&self, endpoint: Endpoint, stream: S) -> Result<Connection>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if self.lookup(&endpoint).is_some() {
            return Err(FramewireError::Status(ErrorCode::AlreadyConnected));
        }
        Ok(self.insert(endpoint, stream))
    }

    fn spawn<S>(&self, endpoint: &Endpoint, stream: S) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Connection::spawn(
            stream,
            Role::Client,
            endpoint.to_string(),
            self.options.clone(),
            None,
        )
    }

    fn insert<S>(&self, endpoint: Endpoint, stream: S) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn = self.spawn(&endpoint, stream);
        tracing::info!(%endpoint, conn = conn.id(), "Connected to server");
        self.registry().insert(
            endpoint,
            Entry {
                conn: conn.clone(),
                refs: 1,
            },
        );
        conn
    }

    /// Drop one reference to connection `conn`; the last one closes it.
    ///
    /// Returns `false`, and does nothing, when `conn` is no longer the
    /// registered connection to `endpoint`.
    pub fn release(&self, endpoint: &Endpoint, conn: ConnectionId) -> bool {
        let mut registry = self.registry();
        let Some(entry) = registry.get_mut(endpoint).filter(|e| e.conn.id() == conn) else {
            tracing::debug!(%endpoint, conn, "Release of an unregistered connection ignored");
            return false;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 {
            if let Some(entry) = registry.remove(endpoint) {
                entry.conn.close();
            }
        }
        true
    }

    /// Take sole ownership of connection `conn`.
    ///
    /// Succeeds only when the caller holds the one remaining reference. The
    /// connection then leaves the registry, so later sessions to `endpoint`
    /// get a socket of their own.
    pub fn claim(&self, endpoint: &Endpoint, conn: ConnectionId) -> bool {
        let mut registry = self.registry();
        match registry.get(endpoint) {
            Some(entry) if entry.conn.id() == conn && entry.refs == 1 => {
                registry.remove(endpoint);
                tracing::debug!(%endpoint, conn, "Connection claimed");
                true
            }
            _ => false,
        }
    }

    /// The live connection to `endpoint`, if any.
    pub fn lookup(&self, endpoint: &Endpoint) -> Option<Connection> {
        self.registry()
            .get(endpoint)
            .filter(|entry| entry.conn.is_alive())
            .map(|entry| entry.conn.clone())
    }

    /// Live shared connections.
    pub fn connection_count(&self) -> usize {
        self.registry()
            .values()
            .filter(|entry| entry.conn.is_alive())
            .count()
    }

    /// Close every shared connection.
    pub fn shutdown(&self) {
        for (_, entry) in self.registry().drain() {
            entry.conn.close();
        }
    }
}

impl Default for NetRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NetRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetRuntime")
            .field("connections", &self.registry().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_attach_and_release() {
        let runtime = NetRuntime::new();
        let endpoint = Endpoint::new("memory", 1);
        let (a, _b) = tokio::io::duplex(1024);
        let conn = runtime.attach(endpoint.clone(), a).unwrap();
        assert_eq!(runtime.connection_count(), 1);

        let (c, _d) = tokio::io::duplex(1024);
        let err = runtime.attach(endpoint.clone(), c).unwrap_err();
        assert_eq!(err.code(), ErrorCode::AlreadyConnected);

        assert!(runtime.release(&endpoint, conn.id()));
        assert!(!conn.is_alive());
        assert_eq!(runtime.connection_count(), 0);
        assert!(!runtime.release(&endpoint, conn.id()));
    }

    #[tokio::test]
    async fn test_connect_reuses_live_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let runtime = NetRuntime::new();
        let endpoint = Endpoint::new("127.0.0.1", port);
        let first = runtime.connect(&endpoint).await.unwrap();
        let _server_side = accept.await.unwrap();
        let second = runtime.connect(&endpoint).await.unwrap();
        assert_eq!(first.id(), second.id());

        runtime.release(&endpoint, first.id());
        assert!(first.is_alive());
        runtime.release(&endpoint, first.id());
        assert!(!first.is_alive());
    }

    #[tokio::test]
    async fn test_stale_release_leaves_replacement_alone() {
        let runtime = NetRuntime::new();
        let endpoint = Endpoint::new("memory", 1);
        let (a, _a_peer) = tokio::io::duplex(1024);
        let dead = runtime.attach(endpoint.clone(), a).unwrap();
        dead.close();

        // A dead entry is replaced by the next attach or connect.
        assert!(runtime.reuse(&endpoint).is_none());
        let (b, _b_peer) = tokio::io::duplex(1024);
        let live = runtime.attach(endpoint.clone(), b).unwrap();
        assert_ne!(dead.id(), live.id());

        assert!(!runtime.release(&endpoint, dead.id()));
        assert!(live.is_alive());
        assert_eq!(runtime.connection_count(), 1);
        assert!(runtime.release(&endpoint, live.id()));
        assert!(!live.is_alive());
    }

    #[tokio::test]
    async fn test_claim_needs_sole_reference() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move {
            let first = listener.accept().await.unwrap();
            let second = listener.accept().await.unwrap();
            (first, second)
        });

        let runtime = NetRuntime::new();
        let endpoint = Endpoint::new("127.0.0.1", port);
        let shared = runtime.connect(&endpoint).await.unwrap();
        runtime.connect(&endpoint).await.unwrap();
        assert!(!runtime.claim(&endpoint, shared.id()));

        runtime.release(&endpoint, shared.id());
        assert!(runtime.claim(&endpoint, shared.id()));
        assert!(shared.is_alive());
        assert_eq!(runtime.connection_count(), 0);

        // Claimed connections are never handed out again.
        let fresh = runtime.connect(&endpoint).await.unwrap();
        assert_ne!(fresh.id(), shared.id());
        let _server_sides = accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let runtime = NetRuntime::new();
        let err = runtime
            .connect(&Endpoint::new("127.0.0.1", port))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoSuchServer);
    }
}
