//! TCP forwarding strategy.
//!
//! One accept-loop task per running period. Every accepted client gets its
//! own tracked task that runs the middleware chain, dials the bound service
//! with a bounded timeout, and relays bytes in both directions until both
//! sides are done or the proxy is stopped. A failure in any one of those
//! steps drops that client only.

use super::lifecycle::ProxyCore;
use super::{dial_within, Proxy, ProxyOptions};
use crate::error::{ProxyError, ProxyResult};
use crate::middleware::{Connection, MiddlewareChain};
use crate::network::{Network, Status};
use crate::service::Service;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Pause after a failed `accept` (e.g. fd exhaustion) before retrying.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Stream proxy: listener → middleware → upstream dial → duplex relay.
pub struct TcpProxy {
    /// Id, port, bound service, and the current running period.
    core: Arc<ProxyCore>,
    /// Shared chain applied to every accepted client.
    middlewares: Arc<MiddlewareChain>,
}

impl TcpProxy {
    /// Create a stopped TCP proxy.
    ///
    /// # Arguments
    ///
    /// * `port` - Public port the listener binds on `start`.
    /// * `middlewares` - Chain every accepted connection passes through.
    /// * `options` - Bind host and dial timeout.
    pub fn new(port: u16, middlewares: Arc<MiddlewareChain>, options: ProxyOptions) -> Self {
        Self {
            core: Arc::new(ProxyCore::new(Network::Tcp, port, options)),
            middlewares,
        }
    }

    async fn accept_loop(
        listener: TcpListener,
        core: Arc<ProxyCore>,
        middlewares: Arc<MiddlewareChain>,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) {
        let proxy_id = core.id().to_string();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(proxy_id = %proxy_id, "accept loop cancelled");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(proxy_id = %proxy_id, error = %e, "accept failed");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                            continue;
                        }
                    };

                    let Some(service) = core.service() else {
                        debug!(proxy_id = %proxy_id, peer = %peer, "no service bound, dropping client");
                        continue;
                    };

                    tracker.spawn(Self::serve(
                        stream,
                        peer,
                        service,
                        middlewares.clone(),
                        core.options().dial_timeout,
                        cancel.clone(),
                        proxy_id.clone(),
                    ));
                }
            }
        }
        // Listener is dropped here, releasing the port before `stop` returns.
    }

    /// Handle one client for its whole lifetime. Never returns an error:
    /// everything that can go wrong is logged and ends this client only.
    async fn serve(
        stream: TcpStream,
        peer: SocketAddr,
        service: Arc<dyn Service>,
        middlewares: Arc<MiddlewareChain>,
        dial_timeout: Duration,
        cancel: CancellationToken,
        proxy_id: String,
    ) {
        let forward = async {
            let conn = Connection::from_tcp(stream, peer)?;
            let conn = middlewares.apply(conn).await?;
            let upstream = dial(&service.address(), dial_timeout).await?;
            Ok::<_, ProxyError>(relay(conn.into_stream(), upstream).await)
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(proxy_id = %proxy_id, peer = %peer, "relay cancelled");
            }
            result = forward => match result {
                Ok((sent, received)) => {
                    debug!(proxy_id = %proxy_id, peer = %peer, sent, received, "relay finished");
                }
                Err(e @ ProxyError::MiddlewareRejected { .. }) => {
                    info!(proxy_id = %proxy_id, peer = %peer, error = %e, "client dropped by middleware");
                }
                Err(e) => {
                    warn!(proxy_id = %proxy_id, peer = %peer, error = %e, "client dropped");
                }
            }
        }
    }
}

#[async_trait]
impl Proxy for TcpProxy {
    async fn start(&self) -> ProxyResult<()> {
        let (guard, service) = self.core.begin_start().await?;

        let addr = self.core.listen_addr();
        let listener = TcpListener::bind(addr).await.map_err(|source| ProxyError::Listen {
            addr: addr.to_string(),
            source,
        })?;

        let run = self.core.arm(&guard);
        run.tracker.spawn(Self::accept_loop(
            listener,
            self.core.clone(),
            self.middlewares.clone(),
            run.cancel.clone(),
            run.tracker.clone(),
        ));

        info!(
            proxy_id = %self.core.id(),
            addr = %addr,
            upstream = %service.address(),
            "tcp proxy started"
        );
        Ok(())
    }

    async fn stop(&self) -> ProxyResult<()> {
        self.core.shutdown().await
    }

    fn id(&self) -> &str {
        self.core.id()
    }

    fn port(&self) -> u16 {
        self.core.port()
    }

    fn network(&self) -> Network {
        self.core.network()
    }

    fn status(&self) -> Status {
        self.core.status()
    }

    fn service(&self) -> Option<Arc<dyn Service>> {
        self.core.service()
    }

    fn set_port(&self, port: u32) -> ProxyResult<u16> {
        self.core.set_port(port)
    }

    fn set_service(&self, service: Arc<dyn Service>) -> Arc<dyn Service> {
        self.core.set_service(service)
    }
}

/// Connect to `addr`, giving up after `timeout`.
pub async fn dial(addr: &str, timeout: Duration) -> ProxyResult<TcpStream> {
    dial_within(addr, timeout, TcpStream::connect(addr)).await
}

/// Copy bytes both ways until each direction has hit EOF or an error.
///
/// When a direction ends, the write side of its destination is shut down
/// (a TCP half-close), so the peer still sees everything the other direction
/// has yet to deliver. Returns `(client→server, server→client)` byte counts.
pub async fn relay<C, S>(client: C, server: S) -> (u64, u64)
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (server_read, server_write) = tokio::io::split(server);

    tokio::join!(
        pipe(client_read, server_write, "client->server"),
        pipe(server_read, client_write, "server->client"),
    )
}

async fn pipe<R, W>(mut from: R, mut to: W, direction: &'static str) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = match tokio::io::copy(&mut from, &mut to).await {
        Ok(n) => n,
        Err(e) => {
            debug!(direction, error = %e, "relay copy failed");
            0
        }
    };

    if let Err(e) = to.shutdown().await {
        debug!(direction, error = %e, "half-close failed");
    }
    copied
}
