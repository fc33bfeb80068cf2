//! Maps a network kind to the proxy strategy that serves it.

use super::{Proxy, ProxyOptions, TcpProxy, UdpProxy};
use crate::error::ProxyResult;
use crate::middleware::MiddlewareChain;
use crate::network::{validate_port, Network};
use std::sync::Arc;

/// Builds proxies that share one middleware chain and one set of options.
#[derive(Clone)]
pub struct ProxyFactory {
    middlewares: Arc<MiddlewareChain>,
    options: ProxyOptions,
}

impl ProxyFactory {
    pub fn new(middlewares: Arc<MiddlewareChain>, options: ProxyOptions) -> Self {
        Self {
            middlewares,
            options,
        }
    }

    /// Construct (but do not start or register) a proxy.
    pub fn create(&self, network: Network, port: u32) -> ProxyResult<Arc<dyn Proxy>> {
        let port = validate_port(port)?;
        let proxy: Arc<dyn Proxy> = match network {
            Network::Tcp => Arc::new(TcpProxy::new(
                port,
                self.middlewares.clone(),
                self.options.clone(),
            )),
            Network::Udp => Arc::new(UdpProxy::new(port, self.options.clone())),
        };
        Ok(proxy)
    }

    /// Like [`ProxyFactory::create`], taking the network by name.
    pub fn create_named(&self, network: &str, port: u32) -> ProxyResult<Arc<dyn Proxy>> {
        self.create(network.parse()?, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProxyError;
    use crate::network::Status;

    fn factory() -> ProxyFactory {
        ProxyFactory::new(Arc::new(MiddlewareChain::new()), ProxyOptions::default())
    }

    #[test]
    fn builds_each_strategy() {
        let tcp = factory().create(Network::Tcp, 2222).unwrap();
        assert_eq!(tcp.network(), Network::Tcp);
        assert_eq!(tcp.port(), 2222);
        assert_eq!(tcp.status(), Status::Stopped);

        let udp = factory().create_named("udp", 5353).unwrap();
        assert_eq!(udp.network(), Network::Udp);
        assert_ne!(tcp.id(), udp.id());
    }

    #[test]
    fn rejects_unknown_network_and_bad_port() {
        assert!(matches!(
            factory().create_named("icmp", 80),
            Err(ProxyError::UnsupportedNetwork(_))
        ));
        assert!(matches!(
            factory().create(Network::Tcp, 0),
            Err(ProxyError::InvalidPort(0))
        ));
    }
}
