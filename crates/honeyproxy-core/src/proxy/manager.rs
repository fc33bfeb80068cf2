//! Registry of every proxy in the process.
//!
//! Lookups take a read lock on the registry. Mutations (create, replace,
//! delete) are additionally serialized by a dedicated mutex so that a
//! delete, which may wait for a proxy to drain, never interleaves with
//! another mutation.

use super::{Proxy, ProxyFactory, ProxyInfo, ProxyOptions};
use crate::error::{ProxyError, ProxyResult};
use crate::middleware::MiddlewareChain;
use crate::network::{Network, Status};
use crate::service::ServiceManager;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Owns all proxies and cascades deletions into the service registry.
pub struct ProxyManager {
    proxies: RwLock<Vec<Arc<dyn Proxy>>>,
    mutations: Mutex<()>,
    factory: ProxyFactory,
    services: Arc<ServiceManager>,
}

impl ProxyManager {
    pub fn new(
        services: Arc<ServiceManager>,
        middlewares: Arc<MiddlewareChain>,
        options: ProxyOptions,
    ) -> Self {
        Self {
            proxies: RwLock::new(Vec::new()),
            mutations: Mutex::new(()),
            factory: ProxyFactory::new(middlewares, options),
            services,
        }
    }

    pub fn services(&self) -> &Arc<ServiceManager> {
        &self.services
    }

    /// Build a proxy for `network` on `port` and register it (stopped).
    pub async fn create_proxy(&self, network: Network, port: u32) -> ProxyResult<Arc<dyn Proxy>> {
        let _mutation = self.mutations.lock().await;
        let proxy = self.factory.create(network, port)?;
        self.proxies.write().await.push(proxy.clone());
        info!(proxy_id = %proxy.id(), network = %network, port = proxy.port(), "proxy created");
        Ok(proxy)
    }

    /// All registered proxies.
    pub async fn proxies(&self) -> Vec<Arc<dyn Proxy>> {
        self.proxies.read().await.clone()
    }

    pub async fn get_proxy(&self, id: &str) -> ProxyResult<Arc<dyn Proxy>> {
        self.proxies
            .read()
            .await
            .iter()
            .find(|p| p.id() == id)
            .cloned()
            .ok_or_else(|| ProxyError::ProxyNotFound(id.to_string()))
    }

    /// First proxy listening on `port`, whatever its network.
    pub async fn get_proxy_by_port(&self, port: u16) -> ProxyResult<Arc<dyn Proxy>> {
        self.proxies
            .read()
            .await
            .iter()
            .find(|p| p.port() == port)
            .cloned()
            .ok_or_else(|| ProxyError::ProxyNotFound(format!("port {port}")))
    }

    /// Every proxy currently in `status`. Empty when none match.
    pub async fn get_proxies_by_status(&self, status: Status) -> Vec<Arc<dyn Proxy>> {
        self.proxies
            .read()
            .await
            .iter()
            .filter(|p| p.status() == status)
            .cloned()
            .collect()
    }

    /// Replace the registered proxy that has the same id as `proxy`.
    pub async fn set_proxy(&self, proxy: Arc<dyn Proxy>) -> ProxyResult<Arc<dyn Proxy>> {
        let _mutation = self.mutations.lock().await;
        let mut proxies = self.proxies.write().await;
        let slot = proxies
            .iter_mut()
            .find(|p| p.id() == proxy.id())
            .ok_or_else(|| ProxyError::ProxyNotFound(proxy.id().to_string()))?;
        *slot = proxy.clone();
        Ok(proxy)
    }

    /// Bind a registered service to a registered proxy.
    pub async fn bind_service(
        &self,
        proxy_id: &str,
        service_id: &str,
    ) -> ProxyResult<Arc<dyn Proxy>> {
        let proxy = self.get_proxy(proxy_id).await?;
        let service = self.services.get_service(service_id).await?;
        proxy.set_service(service);
        Ok(proxy)
    }

    /// Remove a proxy, deleting its bound service first.
    ///
    /// A locked service aborts the whole operation and leaves the proxy
    /// untouched. A service that is already gone from the registry is not an
    /// error. The proxy is stopped (tolerating an already-stopped proxy) and
    /// then swap-removed, so the order of the remaining proxies may change.
    pub async fn delete_proxy(&self, id: &str) -> ProxyResult<()> {
        let _mutation = self.mutations.lock().await;
        let proxy = self.get_proxy(id).await?;

        if let Some(service) = proxy.service() {
            match self.services.delete_service(service.id()).await {
                Ok(()) => {}
                Err(ProxyError::ServiceNotFound(_)) => {
                    debug!(proxy_id = %id, service_id = %service.id(), "bound service already removed");
                }
                Err(e) => {
                    warn!(proxy_id = %id, error = %e, "proxy deletion refused");
                    return Err(e);
                }
            }
        }

        match proxy.stop().await {
            Ok(()) | Err(ProxyError::ProxyNotRunning(_)) => {}
            Err(e) => return Err(e),
        }

        let mut proxies = self.proxies.write().await;
        if let Some(index) = proxies.iter().position(|p| p.id() == id) {
            proxies.swap_remove(index);
        }
        info!(proxy_id = %id, "proxy deleted");
        Ok(())
    }

    /// Stop every running proxy. Returns how many were stopped.
    pub async fn stop_all(&self) -> usize {
        let mut stopped = 0;
        for proxy in self.get_proxies_by_status(Status::Running).await {
            match proxy.stop().await {
                Ok(()) => stopped += 1,
                Err(ProxyError::ProxyNotRunning(_)) => {}
                Err(e) => warn!(proxy_id = %proxy.id(), error = %e, "failed to stop proxy"),
            }
        }
        stopped
    }

    /// Serializable view of every proxy.
    pub async fn snapshot(&self) -> Vec<ProxyInfo> {
        self.proxies.read().await.iter().map(|p| p.info()).collect()
    }

    pub async fn count(&self) -> usize {
        self.proxies.read().await.len()
    }
}
