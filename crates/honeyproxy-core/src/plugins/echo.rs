//! Line echo emulator: every newline-terminated line a client sends is
//! written straight back.

use super::PluginService;
use crate::error::{ProxyError, ProxyResult};
use crate::network::{Interaction, Network};
use crate::service::{BaseService, Service};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

pub struct EchoService {
    base: BaseService,
}

impl EchoService {
    pub const NAME: &'static str = "echo";
    pub const DEFAULT_PORT: u16 = 7;

    pub fn new(host: &str, port: u16) -> Self {
        Self {
            base: BaseService::new(Self::NAME, Network::Tcp, host, port, Interaction::Low),
        }
    }

    async fn echo_lines(stream: TcpStream, peer: SocketAddr) {
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);
        let mut line = Vec::new();

        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    if let Err(e) = write.write_all(&line).await {
                        debug!(peer = %peer, error = %e, "echo write failed");
                        break;
                    }
                }
                Err(e) => {
                    debug!(peer = %peer, error = %e, "echo read failed");
                    break;
                }
            }
        }
    }
}

impl Service for EchoService {
    fn id(&self) -> &str {
        self.base.id()
    }

    fn name(&self) -> String {
        self.base.name()
    }

    fn network(&self) -> Network {
        self.base.network()
    }

    fn interaction(&self) -> Interaction {
        self.base.interaction()
    }

    fn host(&self) -> String {
        self.base.host()
    }

    fn port(&self) -> u16 {
        self.base.port()
    }

    fn is_locked(&self) -> bool {
        true
    }

    fn set_port(&self, port: u32) -> ProxyResult<u16> {
        self.base.set_port(port)
    }

    fn set_locked(&self, _locked: bool) -> ProxyResult<bool> {
        Err(ProxyError::LockedResource(format!(
            "plugin service {} cannot be unlocked",
            self.base.id()
        )))
    }
}

#[async_trait]
impl PluginService for EchoService {
    async fn bind(&self) -> ProxyResult<TcpListener> {
        let addr = self.address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ProxyError::Listen {
                addr: addr.clone(),
                source,
            })?;
        info!(addr = %addr, "echo emulator listening");
        Ok(listener)
    }

    async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> ProxyResult<()> {
        let addr = self.address();
        let connections = TaskTracker::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let shutdown = shutdown.clone();
                        connections.spawn(async move {
                            tokio::select! {
                                _ = shutdown.cancelled() => {}
                                _ = Self::echo_lines(stream, peer) => {}
                            }
                        });
                    }
                    Err(e) => warn!(addr = %addr, error = %e, "echo accept failed"),
                }
            }
        }

        connections.close();
        connections.wait().await;
        debug!(addr = %addr, "echo emulator stopped");
        Ok(())
    }

    fn into_service(self: Arc<Self>) -> Arc<dyn Service> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::free_tcp_port;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::time::timeout;

    #[tokio::test]
    async fn echoes_lines_until_shutdown() {
        let port = free_tcp_port();
        let echo = Arc::new(EchoService::new("127.0.0.1", port));
        let shutdown = CancellationToken::new();

        let runner = {
            let echo = echo.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { echo.run(shutdown).await })
        };

        let mut client = loop {
            match TcpStream::connect(("127.0.0.1", port)).await {
                Ok(stream) => break stream,
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        };

        client.write_all(b"PING\nPONG\n").await.unwrap();
        let mut buf = [0u8; 10];
        timeout(Duration::from_secs(5), client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"PING\nPONG\n");

        shutdown.cancel();
        timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn bind_reports_occupied_port() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();

        let echo = EchoService::new("127.0.0.1", port);
        assert!(matches!(echo.bind().await, Err(ProxyError::Listen { .. })));
        assert!(matches!(
            echo.run(CancellationToken::new()).await,
            Err(ProxyError::Listen { .. })
        ));
    }
}
