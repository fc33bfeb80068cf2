//! Connection interception applied to every accepted TCP client before it is
//! forwarded upstream.
//!
//! A [`MiddlewareChain`] is assembled once at start-up and then shared
//! read-only (`Arc<MiddlewareChain>`) by every proxy's accept loop, so
//! middleware implementations must tolerate concurrent calls.
//!
//! UDP traffic is never passed through the chain; middleware is defined over
//! stream connections only.

use crate::error::{ProxyError, ProxyResult};
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Byte stream a middleware may hand back in place of the original socket.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// An accepted client connection travelling through the chain.
pub struct Connection {
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    stream: Box<dyn AsyncStream>,
}

impl Connection {
    pub fn new(
        stream: impl AsyncStream + 'static,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
    ) -> Self {
        Self {
            peer_addr,
            local_addr,
            stream: Box::new(stream),
        }
    }

    /// Wrap a freshly accepted TCP socket.
    pub fn from_tcp(stream: TcpStream, peer_addr: SocketAddr) -> std::io::Result<Self> {
        let local_addr = stream.local_addr()?;
        Ok(Self::new(stream, peer_addr, local_addr))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Replace the underlying stream, e.g. with a recording or throttling wrapper.
    pub fn map_stream<S, F>(self, f: F) -> Self
    where
        S: AsyncStream + 'static,
        F: FnOnce(Box<dyn AsyncStream>) -> S,
    {
        Self {
            peer_addr: self.peer_addr,
            local_addr: self.local_addr,
            stream: Box::new(f(self.stream)),
        }
    }

    pub fn into_stream(self) -> Box<dyn AsyncStream> {
        self.stream
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer_addr", &self.peer_addr)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

/// One interception step. Returning an error drops the connection.
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    async fn apply(&self, conn: Connection) -> ProxyResult<Connection>;
}

/// Ordered list of middlewares, immutable once shared.
#[derive(Default, Clone)]
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware (builder style).
    pub fn with(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.middlewares.iter().map(|m| m.name().to_string()).collect()
    }

    /// Run `conn` through every middleware in order, stopping at the first error.
    pub async fn apply(&self, mut conn: Connection) -> ProxyResult<Connection> {
        for middleware in &self.middlewares {
            conn = middleware.apply(conn).await?;
        }
        Ok(conn)
    }
}

/// Logs every accepted connection with a running counter.
#[derive(Debug, Default)]
pub struct ConnectionLogger {
    seen: AtomicU64,
}

impl ConnectionLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen(&self) -> u64 {
        self.seen.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Middleware for ConnectionLogger {
    fn name(&self) -> &str {
        "connection-logger"
    }

    async fn apply(&self, conn: Connection) -> ProxyResult<Connection> {
        let n = self.seen.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            peer = %conn.peer_addr(),
            local = %conn.local_addr(),
            seq = n,
            "connection accepted"
        );
        Ok(conn)
    }
}

/// Rejects connections from a fixed set of peer addresses.
#[derive(Debug, Default)]
pub struct PeerDenyList {
    denied: HashSet<IpAddr>,
}

impl PeerDenyList {
    pub fn new(denied: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            denied: denied.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Middleware for PeerDenyList {
    fn name(&self) -> &str {
        "peer-deny-list"
    }

    async fn apply(&self, conn: Connection) -> ProxyResult<Connection> {
        let ip = conn.peer_addr().ip();
        if self.denied.contains(&ip) {
            debug!(peer = %conn.peer_addr(), "peer denied");
            return Err(ProxyError::MiddlewareRejected {
                middleware: self.name().to_string(),
                reason: format!("peer {ip} is denied"),
            });
        }
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn conn_from(peer: &str) -> (Connection, tokio::io::DuplexStream) {
        let (a, b) = duplex(64);
        (Connection::new(a, addr(peer), addr("127.0.0.1:7")), b)
    }

    struct Recorder {
        tag: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Middleware for Recorder {
        fn name(&self) -> &str {
            self.tag
        }

        async fn apply(&self, conn: Connection) -> ProxyResult<Connection> {
            self.log.lock().unwrap().push(self.tag);
            Ok(conn)
        }
    }

    #[tokio::test]
    async fn chain_runs_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = MiddlewareChain::new()
            .with(Recorder { tag: "first", log: log.clone() })
            .with(Recorder { tag: "second", log: log.clone() });

        let (conn, _peer) = conn_from("10.0.0.1:5000");
        chain.apply(conn).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(chain.names(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn rejection_short_circuits() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = MiddlewareChain::new()
            .with(PeerDenyList::new(["10.0.0.9".parse().unwrap()]))
            .with(Recorder { tag: "after", log: log.clone() });

        let (conn, _peer) = conn_from("10.0.0.9:4000");
        let err = chain.apply(conn).await.unwrap_err();
        assert!(matches!(err, ProxyError::MiddlewareRejected { .. }));
        assert!(log.lock().unwrap().is_empty());

        let (conn, _peer) = conn_from("10.0.0.1:4000");
        assert!(chain.apply(conn).await.is_ok());
        assert_eq!(*log.lock().unwrap(), vec!["after"]);
    }

    #[tokio::test]
    async fn logger_counts() {
        let logger = ConnectionLogger::new();
        for _ in 0..3 {
            let (conn, _peer) = conn_from("10.0.0.1:4000");
            logger.apply(conn).await.unwrap();
        }
        assert_eq!(logger.seen(), 3);
    }

    #[tokio::test]
    async fn map_stream_keeps_addresses() {
        let (conn, mut peer) = conn_from("192.168.1.5:999");
        let conn = conn.map_stream(tokio::io::BufStream::new);
        assert_eq!(conn.peer_addr(), addr("192.168.1.5:999"));

        let mut stream = conn.into_stream();
        peer.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }
}
