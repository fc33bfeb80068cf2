//! The service contract and its default field storage.

use crate::error::ProxyResult;
use crate::network::{validate_port, Interaction, Network};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{PoisonError, RwLock};
use uuid::Uuid;

/// A target endpoint that a proxy forwards traffic to.
///
/// Proxies only read a service (to resolve where to dial); creation,
/// mutation, and deletion belong to the [`ServiceManager`](super::ServiceManager).
pub trait Service: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> String;
    fn network(&self) -> Network;
    fn interaction(&self) -> Interaction;
    fn host(&self) -> String;
    fn port(&self) -> u16;
    fn is_locked(&self) -> bool;

    fn set_port(&self, port: u32) -> ProxyResult<u16>;
    fn set_locked(&self, locked: bool) -> ProxyResult<bool>;

    /// `host:port` dial target. IPv6 literals are bracketed.
    fn address(&self) -> String {
        let host = self.host();
        if host.contains(':') && !host.starts_with('[') {
            format!("[{}]:{}", host, self.port())
        } else {
            format!("{}:{}", host, self.port())
        }
    }
}

/// Plain service record. Usable directly, or embedded as a private field
/// by services that need to override part of the contract.
#[derive(Debug)]
pub struct BaseService {
    id: String,
    name: RwLock<String>,
    host: RwLock<String>,
    network: Network,
    interaction: Interaction,
    port: AtomicU16,
    locked: AtomicBool,
}

impl BaseService {
    /// Create an unlocked service with a fresh id.
    pub fn new(
        name: impl Into<String>,
        network: Network,
        host: impl Into<String>,
        port: u16,
        interaction: Interaction,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: RwLock::new(name.into()),
            host: RwLock::new(host.into()),
            network,
            interaction,
            port: AtomicU16::new(port),
            locked: AtomicBool::new(false),
        }
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write().unwrap_or_else(PoisonError::into_inner) = name.into();
    }

    pub fn set_host(&self, host: impl Into<String>) {
        *self.host.write().unwrap_or_else(PoisonError::into_inner) = host.into();
    }
}

impl Service for BaseService {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> String {
        self.name.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn network(&self) -> Network {
        self.network
    }

    fn interaction(&self) -> Interaction {
        self.interaction
    }

    fn host(&self) -> String {
        self.host.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn port(&self) -> u16 {
        self.port.load(Ordering::Acquire)
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    fn set_port(&self, port: u32) -> ProxyResult<u16> {
        let port = validate_port(port)?;
        self.port.store(port, Ordering::Release);
        Ok(port)
    }

    fn set_locked(&self, locked: bool) -> ProxyResult<bool> {
        self.locked.store(locked, Ordering::Release);
        Ok(locked)
    }
}
