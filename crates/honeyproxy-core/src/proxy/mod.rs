//! Proxy engine: listening endpoints that forward attacker traffic to a
//! bound [`Service`].
//!
//! # Submodule Architecture
//!
//! - **[`lifecycle`]**: [`ProxyCore`](lifecycle::ProxyCore), the state every
//!   concrete proxy holds privately: id, port, bound service, and the
//!   cancellation token plus task tracker that make up one running period.
//! - **[`tcp`]**: [`TcpProxy`], with its accept loop, middleware, dial, duplex relay.
//! - **[`udp`]**: [`UdpProxy`], datagram dispatch with one tracked,
//!   time-bounded relay task per inbound datagram.
//! - **[`factory`]**: [`ProxyFactory`] maps a [`Network`] to a strategy.
//! - **[`manager`]**: [`ProxyManager`], the registry of all proxies.
//!
//! # Data Flow
//!
//! ```text
//! client
//!   → listener (owned by the proxy's accept/dispatch task)
//!     → MiddlewareChain::apply      (TCP only)
//!     → dial bound service
//!     → relay task (tracked; cancelled and drained by stop)
//! ```

pub mod factory;
pub mod lifecycle;
pub mod manager;
pub mod tcp;
pub mod udp;

pub use factory::ProxyFactory;
pub use manager::ProxyManager;
pub use tcp::TcpProxy;
pub use udp::UdpProxy;

use crate::error::{ProxyError, ProxyResult};
use crate::network::{Interaction, Network, Status};
use crate::service::Service;
use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

/// Dial timeout used when none is configured.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Receive buffer for UDP datagrams. Larger datagrams are truncated.
pub const DEFAULT_UDP_BUFFER_SIZE: usize = 2048;

/// Upper bound on a single UDP request/response exchange.
pub const DEFAULT_UDP_RELAY_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime settings shared by every proxy a factory builds.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Local address listeners bind to.
    pub bind_host: IpAddr,
    /// Bound on connecting (TCP) or resolving and connecting (UDP) upstream.
    pub dial_timeout: Duration,
    pub udp_buffer_size: usize,
    /// Maximum lifetime of one UDP relay task.
    pub udp_relay_timeout: Duration,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            udp_buffer_size: DEFAULT_UDP_BUFFER_SIZE,
            udp_relay_timeout: DEFAULT_UDP_RELAY_TIMEOUT,
        }
    }
}

/// The contract the management layer drives.
///
/// All methods take `&self`: proxies are shared as `Arc<dyn Proxy>` between
/// the registry and callers, and keep their mutable state behind locks.
/// `start` and `stop` are serialized per proxy.
#[async_trait]
pub trait Proxy: Send + Sync {
    /// Bind the listener and spawn the accept/dispatch task. Returns once the
    /// socket is bound; bind failures are reported here.
    async fn start(&self) -> ProxyResult<()>;

    /// Cancel the running period and wait until every task it spawned has
    /// finished.
    async fn stop(&self) -> ProxyResult<()>;

    fn id(&self) -> &str;
    fn port(&self) -> u16;
    fn network(&self) -> Network;
    fn status(&self) -> Status;
    fn service(&self) -> Option<Arc<dyn Service>>;

    /// Change the listening port. Only allowed while stopped.
    fn set_port(&self, port: u32) -> ProxyResult<u16>;
    fn set_service(&self, service: Arc<dyn Service>) -> Arc<dyn Service>;

    /// Serializable view of the proxy.
    fn info(&self) -> ProxyInfo {
        ProxyInfo {
            id: self.id().to_string(),
            port: self.port(),
            network: self.network(),
            status: self.status(),
            service: self.service().map(|s| ServiceInfo::of(s.as_ref())),
        }
    }
}

/// Snapshot of a proxy for listings and logs.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyInfo {
    pub id: String,
    pub port: u16,
    pub network: Network,
    pub status: Status,
    pub service: Option<ServiceInfo>,
}

/// Snapshot of the service bound to a proxy.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub id: String,
    pub name: String,
    pub address: String,
    pub network: Network,
    pub interaction: Interaction,
    pub locked: bool,
}

impl ServiceInfo {
    pub fn of(service: &dyn Service) -> Self {
        Self {
            id: service.id().to_string(),
            name: service.name(),
            address: service.address(),
            network: service.network(),
            interaction: service.interaction(),
            locked: service.is_locked(),
        }
    }
}

/// Drive an upstream `connect` for `addr`, giving up after `timeout`.
///
/// A failed connect becomes [`ProxyError::Dial`]; one still pending when the
/// timeout fires becomes [`ProxyError::DialTimeout`].
pub(crate) async fn dial_within<T, F>(addr: &str, timeout: Duration, connect: F) -> ProxyResult<T>
where
    F: Future<Output = io::Result<T>>,
{
    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(conn)) => Ok(conn),
        Ok(Err(source)) => Err(ProxyError::Dial {
            addr: addr.to_string(),
            source,
        }),
        Err(_) => Err(ProxyError::DialTimeout(addr.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hung_connect_times_out() {
        let hung = dial_within(
            "203.0.113.1:9",
            Duration::from_millis(20),
            std::future::pending::<io::Result<()>>(),
        )
        .await;
        assert!(matches!(hung, Err(ProxyError::DialTimeout(addr)) if addr == "203.0.113.1:9"));
    }

    #[tokio::test]
    async fn failed_connect_is_a_dial_error() {
        let refused = dial_within("127.0.0.1:1", Duration::from_secs(1), async {
            Err::<(), _>(io::Error::from(io::ErrorKind::ConnectionRefused))
        })
        .await;
        assert!(matches!(refused, Err(ProxyError::Dial { source, .. })
            if source.kind() == io::ErrorKind::ConnectionRefused));
    }

    #[tokio::test]
    async fn completed_connect_passes_through() {
        let value = dial_within("127.0.0.1:1", Duration::from_secs(1), async { Ok(7u8) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }
}
