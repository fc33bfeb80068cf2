//! honeyproxy-core: proxy engine for a low/medium-interaction honeypot.
//!
//! Owns the listening sockets of every exposed decoy port, forwards traffic
//! to the emulator [`Service`](service::Service) bound to each port, and runs
//! accepted TCP clients through a shared [`MiddlewareChain`] first.
//! Includes the service registry and the compiled-in plugin table.

pub mod error;
pub mod middleware;
pub mod network;
pub mod plugins;
pub mod proxy;
pub mod service;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used items at crate root.
pub use error::{ProxyError, ProxyResult};
pub use middleware::{Connection, ConnectionLogger, Middleware, MiddlewareChain, PeerDenyList};
pub use network::{validate_port, Interaction, Network, Status};
pub use plugins::{PluginRegistry, PluginService};
pub use proxy::{Proxy, ProxyFactory, ProxyInfo, ProxyManager, ProxyOptions};
pub use service::{BaseService, Service, ServiceManager};
