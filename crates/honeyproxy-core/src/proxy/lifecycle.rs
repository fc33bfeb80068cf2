//! State shared by every proxy strategy.
//!
//! A proxy alternates between stopped and running periods. Each running
//! period owns a fresh [`CancellationToken`] and [`TaskTracker`]; the token
//! is cancelled exactly once, by `stop`, and the tracker is then closed and
//! awaited so nothing spawned during the period outlives it.

use crate::error::{ProxyError, ProxyResult};
use crate::network::{validate_port, Network, Status};
use crate::service::Service;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};
use uuid::Uuid;

use super::ProxyOptions;

/// Handles for one running period.
#[derive(Clone)]
pub struct RunHandle {
    /// Fired once, by `stop`, to end the period.
    pub cancel: CancellationToken,
    /// Every task spawned during the period; closed and awaited by `stop`.
    pub tracker: TaskTracker,
}

/// Id, port, bound service, and run state of a proxy.
pub struct ProxyCore {
    id: String,
    network: Network,
    port: AtomicU16,
    service: RwLock<Option<Arc<dyn Service>>>,
    run: Mutex<Option<RunHandle>>,
    /// Held across a whole start or stop so transitions never interleave.
    transition: AsyncMutex<()>,
    options: ProxyOptions,
}

impl ProxyCore {
    /// Create a stopped core with a fresh id and no bound service.
    ///
    /// # Arguments
    ///
    /// * `network` - Transport the owning proxy forwards
    /// * `port` - Listening port, already validated
    /// * `options` - Bind host, timeouts and buffer sizes for the proxy
    pub fn new(network: Network, port: u16, options: ProxyOptions) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            network,
            port: AtomicU16::new(port),
            service: RwLock::new(None),
            run: Mutex::new(None),
            transition: AsyncMutex::new(()),
            options,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn port(&self) -> u16 {
        self.port.load(Ordering::Acquire)
    }

    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }

    /// Address the listener binds to.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.options.bind_host, self.port())
    }

    pub fn service(&self) -> Option<Arc<dyn Service>> {
        self.service
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_service(&self, service: Arc<dyn Service>) -> Arc<dyn Service> {
        debug!(proxy_id = %self.id, service_id = %service.id(), "service bound");
        *self.service.write().unwrap_or_else(PoisonError::into_inner) = Some(service.clone());
        service
    }

    /// Change the listening port. Refused while running or while a start
    /// or stop is in progress.
    pub fn set_port(&self, port: u32) -> ProxyResult<u16> {
        let port = validate_port(port)?;
        let Ok(_transition) = self.transition.try_lock() else {
            return Err(ProxyError::ProxyRunning(self.id.clone()));
        };
        if self.status() == Status::Running {
            return Err(ProxyError::ProxyRunning(self.id.clone()));
        }
        self.port.store(port, Ordering::Release);
        Ok(port)
    }

    /// Running iff a token exists for the current period and has not fired.
    pub fn status(&self) -> Status {
        match self.run.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(run) if !run.cancel.is_cancelled() => Status::Running,
            _ => Status::Stopped,
        }
    }

    /// Begin a start transition: serialize against other transitions and
    /// check preconditions. The returned guard must be held until
    /// [`ProxyCore::arm`] has been called or the start has failed.
    pub async fn begin_start(&self) -> ProxyResult<(AsyncMutexGuard<'_, ()>, Arc<dyn Service>)> {
        let guard = self.transition.lock().await;
        if self.status() == Status::Running {
            return Err(ProxyError::ProxyRunning(self.id.clone()));
        }
        let service = self
            .service()
            .ok_or_else(|| ProxyError::ServiceNotBound(self.id.clone()))?;
        Ok((guard, service))
    }

    /// Open a new running period with a fresh token and tracker.
    ///
    /// Only callable with the guard returned by [`ProxyCore::begin_start`],
    /// so a live period is never replaced.
    pub(crate) fn arm(&self, _transition: &AsyncMutexGuard<'_, ()>) -> RunHandle {
        let handle = RunHandle {
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        };
        *self.run.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle.clone());
        handle
    }

    /// End the current running period and wait for its tasks to drain.
    pub async fn shutdown(&self) -> ProxyResult<()> {
        let _guard = self.transition.lock().await;

        let run = match self.run.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(run) if !run.cancel.is_cancelled() => run.clone(),
            _ => return Err(ProxyError::ProxyNotRunning(self.id.clone())),
        };

        run.cancel.cancel();
        run.tracker.close();
        debug!(proxy_id = %self.id, in_flight = run.tracker.len(), "draining proxy tasks");
        run.tracker.wait().await;

        info!(proxy_id = %self.id, port = self.port(), network = %self.network, "proxy stopped");
        Ok(())
    }
}
