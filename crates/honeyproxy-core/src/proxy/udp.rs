//! UDP forwarding strategy.
//!
//! There is one client-facing socket per running period. The dispatch loop
//! reads each inbound datagram and hands it to its own relay task, which
//! dials a fresh upstream socket, forwards the datagram, waits for a single
//! reply, and sends it back to the originating client.
//!
//! Relay tasks are registered with the period's task tracker, observe the
//! cancellation token, and are bounded by `udp_relay_timeout`, so `stop`
//! drains them exactly as it drains TCP relays. Middleware is not applied to
//! datagrams.

use super::lifecycle::ProxyCore;
use super::{dial_within, Proxy, ProxyOptions};
use crate::error::{ProxyError, ProxyResult};
use crate::network::{Network, Status};
use crate::service::Service;
use async_trait::async_trait;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Datagram proxy with one request/response exchange per inbound datagram.
pub struct UdpProxy {
    /// Id, port, bound service, and the current running period.
    core: Arc<ProxyCore>,
}

impl UdpProxy {
    /// Create a stopped UDP proxy.
    ///
    /// # Arguments
    ///
    /// * `port` - Public port the client-facing socket binds on `start`.
    /// * `options` - Bind host, dial timeout, buffer size and relay lifetime.
    pub fn new(port: u16, options: ProxyOptions) -> Self {
        Self {
            core: Arc::new(ProxyCore::new(Network::Udp, port, options)),
        }
    }

    async fn dispatch_loop(
        socket: Arc<UdpSocket>,
        core: Arc<ProxyCore>,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) {
        let proxy_id = core.id().to_string();
        let options = core.options().clone();
        let mut buf = vec![0u8; options.udp_buffer_size];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(proxy_id = %proxy_id, "dispatch loop cancelled");
                    break;
                }
                received = socket.recv_from(&mut buf) => {
                    let (n, peer) = match received {
                        Ok(pair) => pair,
                        Err(e) => {
                            // ICMP errors from earlier sends surface here on some
                            // platforms; they concern one peer, not the socket.
                            debug!(proxy_id = %proxy_id, error = %e, "recv failed");
                            continue;
                        }
                    };

                    let Some(service) = core.service() else {
                        debug!(proxy_id = %proxy_id, peer = %peer, "no service bound, dropping datagram");
                        continue;
                    };

                    tracker.spawn(Self::relay_datagram(
                        socket.clone(),
                        buf[..n].to_vec(),
                        peer,
                        service,
                        options.clone(),
                        cancel.clone(),
                        proxy_id.clone(),
                    ));
                }
            }
        }
    }

    /// One bounded exchange on behalf of `peer`. Errors end this exchange only.
    async fn relay_datagram(
        client: Arc<UdpSocket>,
        datagram: Vec<u8>,
        peer: SocketAddr,
        service: Arc<dyn Service>,
        options: ProxyOptions,
        cancel: CancellationToken,
        proxy_id: String,
    ) {
        let addr = service.address();
        let bounded = tokio::time::timeout(
            options.udp_relay_timeout,
            exchange(&client, &datagram, peer, &addr, &options),
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(proxy_id = %proxy_id, peer = %peer, "udp relay cancelled");
            }
            result = bounded => match result {
                Ok(Ok(replied)) => {
                    debug!(proxy_id = %proxy_id, peer = %peer, sent = datagram.len(), replied, "udp relay finished");
                }
                Ok(Err(e)) => {
                    warn!(proxy_id = %proxy_id, peer = %peer, upstream = %addr, error = %e, "udp relay failed");
                }
                Err(_) => {
                    debug!(proxy_id = %proxy_id, peer = %peer, upstream = %addr, "udp relay timed out waiting for reply");
                }
            }
        }
    }
}

async fn exchange(
    client: &UdpSocket,
    datagram: &[u8],
    peer: SocketAddr,
    addr: &str,
    options: &ProxyOptions,
) -> ProxyResult<usize> {
    let upstream = dial(addr, options.dial_timeout).await?;
    upstream.send(datagram).await?;

    let mut buf = vec![0u8; options.udp_buffer_size];
    let n = upstream.recv(&mut buf).await?;
    client.send_to(&buf[..n], peer).await?;
    Ok(n)
}

/// Resolve `addr` and return an ephemeral socket connected to it.
pub async fn dial(addr: &str, timeout: Duration) -> ProxyResult<UdpSocket> {
    let connect = async {
        let target = lookup_host(addr).await?.next().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved")
        })?;
        let local: SocketAddr = if target.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(target).await?;
        Ok::<_, std::io::Error>(socket)
    };

    dial_within(addr, timeout, connect).await
}

#[async_trait]
impl Proxy for UdpProxy {
    async fn start(&self) -> ProxyResult<()> {
        let (guard, service) = self.core.begin_start().await?;

        let addr = self.core.listen_addr();
        let socket = UdpSocket::bind(addr).await.map_err(|source| ProxyError::Listen {
            addr: addr.to_string(),
            source,
        })?;

        let run = self.core.arm(&guard);
        run.tracker.spawn(Self::dispatch_loop(
            Arc::new(socket),
            self.core.clone(),
            run.cancel.clone(),
            run.tracker.clone(),
        ));

        info!(
            proxy_id = %self.core.id(),
            addr = %addr,
            upstream = %service.address(),
            "udp proxy started"
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
