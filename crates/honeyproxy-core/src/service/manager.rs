//! Service registry.
//!
//! Holds every service a proxy may be bound to, indexed by id. Deletion
//! refuses locked services so plugin-backed emulators cannot be removed
//! out from under a running proxy.

use super::base::{BaseService, Service};
use crate::error::{ProxyError, ProxyResult};
use crate::network::{validate_port, Interaction, Network};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Registry of services available for binding.
#[derive(Default)]
pub struct ServiceManager {
    services: RwLock<HashMap<String, Arc<dyn Service>>>,
}

impl ServiceManager {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an existing service (plain or plugin-backed).
    pub async fn add_service(&self, service: Arc<dyn Service>) -> Arc<dyn Service> {
        let id = service.id().to_string();
        info!(service_id = %id, name = %service.name(), address = %service.address(), "service registered");
        self.services.write().await.insert(id, service.clone());
        service
    }

    /// Build a [`BaseService`] and register it.
    pub async fn create_service(
        &self,
        name: &str,
        network: Network,
        host: &str,
        port: u32,
        interaction: Interaction,
    ) -> ProxyResult<Arc<dyn Service>> {
        let port = validate_port(port)?;
        let service: Arc<dyn Service> =
            Arc::new(BaseService::new(name, network, host, port, interaction));
        Ok(self.add_service(service).await)
    }

    /// Look up a service by id.
    pub async fn get_service(&self, id: &str) -> ProxyResult<Arc<dyn Service>> {
        self.services
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ProxyError::ServiceNotFound(id.to_string()))
    }

    /// All registered services, in no particular order.
    pub async fn services(&self) -> Vec<Arc<dyn Service>> {
        self.services.read().await.values().cloned().collect()
    }

    /// Remove a service. Locked services are left in place.
    pub async fn delete_service(&self, id: &str) -> ProxyResult<()> {
        let mut services = self.services.write().await;
        let service = services
            .get(id)
            .ok_or_else(|| ProxyError::ServiceNotFound(id.to_string()))?;

        if service.is_locked() {
            debug!(service_id = %id, "refusing to delete locked service");
            return Err(ProxyError::LockedResource(format!("service {id}")));
        }

        services.remove(id);
        info!(service_id = %id, "service deleted");
        Ok(())
    }

    /// Number of registered services.
    pub async fn count(&self) -> usize {
        self.services.read().await.len()
    }
}
