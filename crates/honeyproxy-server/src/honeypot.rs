//! Wires the registries together and exposes each configured plugin.
//!
//! For every plugin: start its emulator on the private service port,
//! register it as a (locked) service, create a proxy on the public port,
//! bind the two, and start the proxy. Shutdown runs in reverse: drain every
//! proxy, then stop the emulators.

use crate::config::{PluginConfig, ServerConfig};
use anyhow::Context;
use honeyproxy_core::{
    ConnectionLogger, MiddlewareChain, PeerDenyList, PluginRegistry, ProxyInfo, ProxyManager,
    ServiceManager,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

pub struct Honeypot {
    proxies: ProxyManager,
    emulators: TaskTracker,
    shutdown: CancellationToken,
}

impl Honeypot {
    /// Build the registries and expose every plugin in `config`.
    ///
    /// On failure anything already started is torn down before returning.
    pub async fn start(config: &ServerConfig, registry: &PluginRegistry) -> anyhow::Result<Self> {
        let mut chain = MiddlewareChain::new();
        if config.log_connections {
            chain = chain.with(ConnectionLogger::new());
        }
        if !config.deny.is_empty() {
            chain = chain.with(PeerDenyList::new(config.deny.iter().copied()));
        }
        info!(middlewares = ?chain.names(), "middleware chain ready");

        let honeypot = Self {
            proxies: ProxyManager::new(
                Arc::new(ServiceManager::new()),
                Arc::new(chain),
                config.options.clone(),
            ),
            emulators: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        };

        for plugin in &config.plugins {
            if let Err(e) = honeypot.expose(plugin, registry).await {
                honeypot.shutdown().await;
                return Err(e);
            }
        }

        Ok(honeypot)
    }

    async fn expose(&self, plugin: &PluginConfig, registry: &PluginRegistry) -> anyhow::Result<()> {
        let spec = registry.get(&plugin.name)?;
        let emulator = registry.instantiate(&plugin.name, &plugin.service_host, plugin.service_port)?;

        // The emulator port must be ours before a proxy forwards to it.
        let listener = emulator
            .bind()
            .await
            .with_context(|| format!("cannot start emulator for plugin {}", plugin.name))?;

        let runner = emulator.clone();
        let shutdown = self.shutdown.clone();
        let name = plugin.name.clone();
        self.emulators.spawn(async move {
            if let Err(e) = runner.serve(listener, shutdown).await {
                error!(plugin = %name, error = %e, "emulator failed");
            }
        });

        let service = self.proxies.services().add_service(emulator.into_service()).await;
        let proxy = self
            .proxies
            .create_proxy(spec.network, plugin.port.into())
            .await?;
        proxy.set_service(service.clone());
        proxy
            .start()
            .await
            .with_context(|| format!("cannot start proxy for plugin {}", plugin.name))?;

        info!(
            plugin = %plugin.name,
            proxy_id = %proxy.id(),
            port = plugin.port,
            upstream = %service.address(),
            "plugin exposed"
        );
        Ok(())
    }

    pub async fn snapshot(&self) -> Vec<ProxyInfo> {
        self.proxies.snapshot().await
    }

    /// Drain every proxy, then stop the emulators behind them.
    pub async fn shutdown(&self) {
        let stopped = self.proxies.stop_all().await;
        self.shutdown.cancel();
        self.emulators.close();
        self.emulators.wait().await;
        info!(stopped, "honeypot shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use honeyproxy_core::{ProxyOptions, Status};
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn local_config(plugins: Vec<PluginConfig>) -> ServerConfig {
        ServerConfig {
            options: ProxyOptions {
                bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
                ..ProxyOptions::default()
            },
            log_connections: true,
            deny: Vec::new(),
            plugins,
        }
    }

    async fn ping(port: u16) -> Option<Vec<u8>> {
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.ok()?;
        client.write_all(b"PING\n").await.ok()?;
        let mut buf = [0u8; 5];
        timeout(Duration::from_secs(2), client.read_exact(&mut buf))
            .await
            .ok()?
            .ok()?;
        Some(buf.to_vec())
    }

    #[tokio::test]
    async fn exposes_echo_plugin() {
        let registry = PluginRegistry::builtin();
        let port = free_port();
        let config = local_config(vec![PluginConfig {
            name: "echo".to_string(),
            port,
            service_host: "127.0.0.1".to_string(),
            service_port: free_port(),
        }]);

        let honeypot = Honeypot::start(&config, &registry).await.unwrap();
        let snapshot = honeypot.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].status, Status::Running);
        assert!(snapshot[0].service.as_ref().unwrap().locked);

        assert_eq!(ping(port).await.as_deref(), Some(&b"PING\n"[..]));

        timeout(Duration::from_secs(5), honeypot.shutdown()).await.unwrap();
        assert_eq!(honeypot.snapshot().await[0].status, Status::Stopped);
    }

    #[tokio::test]
    async fn failed_start_is_reported() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();

        let registry = PluginRegistry::builtin();
        let config = local_config(vec![PluginConfig {
            name: "echo".to_string(),
            port,
            service_host: "127.0.0.1".to_string(),
            service_port: free_port(),
        }]);

        let result = timeout(Duration::from_secs(5), Honeypot::start(&config, &registry))
            .await
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn occupied_emulator_port_aborts_start() {
        let foreign = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let service_port = foreign.local_addr().unwrap().port();
        let port = free_port();

        let registry = PluginRegistry::builtin();
        let config = local_config(vec![PluginConfig {
            name: "echo".to_string(),
            port,
            service_host: "127.0.0.1".to_string(),
            service_port,
        }]);

        let result = timeout(Duration::from_secs(5), Honeypot::start(&config, &registry))
            .await
            .unwrap();
        let err = result.err().expect("start must fail when the emulator cannot bind");
        assert!(err.to_string().contains("emulator"), "unexpected error: {err:#}");

        // No proxy was left listening in front of the foreign service.
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
        assert!(timeout(Duration::from_millis(200), foreign.accept()).await.is_err());
    }
}
