use thiserror::Error;

/// Errors produced by the proxy engine and its registries.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("unsupported network: {0}")]
    UnsupportedNetwork(String),

    #[error("service not bound to proxy {0}")]
    ServiceNotBound(String),

    #[error("cannot listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("dial to {0} timed out")]
    DialTimeout(String),

    #[error("dial to {addr} failed: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("proxy not found: {0}")]
    ProxyNotFound(String),

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("proxy not running: {0}")]
    ProxyNotRunning(String),

    #[error("proxy already running: {0}")]
    ProxyRunning(String),

    #[error("resource is locked: {0}")]
    LockedResource(String),

    #[error("invalid port: {0}")]
    InvalidPort(u32),

    #[error("connection rejected by middleware {middleware}: {reason}")]
    MiddlewareRejected { middleware: String, reason: String },

    #[error("unknown plugin: {0}")]
    UnknownPlugin(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ProxyResult<T> = Result<T, ProxyError>;
