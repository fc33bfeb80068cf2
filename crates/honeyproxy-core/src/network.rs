//! Small value types shared by proxies and services: transport kind,
//! lifecycle status, interaction level, and port validation.

use crate::error::{ProxyError, ProxyResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Transport a proxy listens on. Fixed for the lifetime of a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Udp,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = ProxyError;

    fn from_str(s: &str) -> ProxyResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Network::Tcp),
            "udp" => Ok(Network::Udp),
            other => Err(ProxyError::UnsupportedNetwork(other.to_string())),
        }
    }
}

/// Lifecycle status of a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Running,
    Stopped,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Running => f.write_str("running"),
            Status::Stopped => f.write_str("stopped"),
        }
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s.trim().to_ascii_lowercase().as_str() {
            "running" => Ok(Status::Running),
            "stopped" | "not running" => Ok(Status::Stopped),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

/// How deeply a service emulates the real thing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interaction {
    #[default]
    Low,
    High,
}

impl fmt::Display for Interaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interaction::Low => f.write_str("low"),
            Interaction::High => f.write_str("high"),
        }
    }
}

/// Check that `port` is a usable listening port (1..=65535).
pub fn validate_port(port: u32) -> ProxyResult<u16> {
    match u16::try_from(port) {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(ProxyError::InvalidPort(port)),
    }
}
