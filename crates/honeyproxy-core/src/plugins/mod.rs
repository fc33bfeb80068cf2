//! Compiled-in emulator plugins.
//!
//! A plugin is a [`Service`] that can also run its own emulator. The
//! [`PluginRegistry`] maps a plugin name to a constructor; the server picks
//! entries by name at start-up, runs the emulator on a private port, and
//! fronts it with a proxy on the public one.

pub mod echo;

pub use echo::EchoService;

use crate::error::{ProxyError, ProxyResult};
use crate::network::Network;
use crate::service::Service;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// A service backed by an in-process emulator.
///
/// Plugin services are always locked: they cannot be deleted through the
/// service registry while registered.
///
/// Binding is separate from serving so a caller can learn that the emulator
/// port is unavailable before anything is forwarded to it.
#[async_trait]
pub trait PluginService: Service {
    /// Bind the emulator listener on the service address.
    async fn bind(&self) -> ProxyResult<TcpListener>;

    /// Serve clients accepted on `listener` until `shutdown` fires.
    async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> ProxyResult<()>;

    /// Bind, then serve until `shutdown` fires.
    async fn run(&self, shutdown: CancellationToken) -> ProxyResult<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// View this plugin through the plain [`Service`] contract.
    fn into_service(self: Arc<Self>) -> Arc<dyn Service>;
}

/// Builds a plugin bound to `host:port`.
pub type PluginConstructor = fn(host: &str, port: u16) -> Arc<dyn PluginService>;

/// One entry of the plugin table.
#[derive(Clone)]
pub struct PluginSpec {
    pub name: &'static str,
    pub network: Network,
    /// Public port a proxy for this plugin listens on by default.
    pub default_port: u16,
    pub constructor: PluginConstructor,
}

/// Name → constructor table. Lookups ignore case.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, PluginSpec>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every plugin shipped in this crate.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(PluginSpec {
            name: EchoService::NAME,
            network: Network::Tcp,
            default_port: EchoService::DEFAULT_PORT,
            constructor: echo_plugin,
        });
        registry
    }

    /// Add or replace an entry.
    pub fn register(&mut self, spec: PluginSpec) {
        self.plugins.insert(spec.name.to_ascii_lowercase(), spec);
    }

    pub fn get(&self, name: &str) -> ProxyResult<&PluginSpec> {
        self.plugins
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| ProxyError::UnknownPlugin(name.to_string()))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.plugins.values().map(|spec| spec.name).collect()
    }

    /// Construct the named plugin with its emulator on `host:port`.
    pub fn instantiate(
        &self,
        name: &str,
        host: &str,
        port: u16,
    ) -> ProxyResult<Arc<dyn PluginService>> {
        let spec = self.get(name)?;
        Ok((spec.constructor)(host, port))
    }
}

fn echo_plugin(host: &str, port: u16) -> Arc<dyn PluginService> {
    Arc::new(EchoService::new(host, port))
}
