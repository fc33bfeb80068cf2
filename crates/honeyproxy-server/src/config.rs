//! Server configuration: TOML file + CLI overrides.

use anyhow::{bail, Context};
use honeyproxy_core::{validate_port, PluginRegistry, ProxyOptions};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Offset from a plugin's public port to its default emulator port.
const SERVICE_PORT_OFFSET: u16 = 10000;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub proxy: ProxySection,
    #[serde(default)]
    pub middleware: MiddlewareSection,
    #[serde(default)]
    pub plugins: Vec<PluginSection>,
}

/// `[proxy]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxySection {
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    #[serde(default = "default_udp_buffer_size")]
    pub udp_buffer_size: usize,
    #[serde(default = "default_udp_relay_timeout_ms")]
    pub udp_relay_timeout_ms: u64,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            dial_timeout_ms: default_dial_timeout_ms(),
            udp_buffer_size: default_udp_buffer_size(),
            udp_relay_timeout_ms: default_udp_relay_timeout_ms(),
        }
    }
}

/// `[middleware]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct MiddlewareSection {
    #[serde(default = "default_true")]
    pub log_connections: bool,
    #[serde(default)]
    pub deny: Vec<String>,
}

impl Default for MiddlewareSection {
    fn default() -> Self {
        Self {
            log_connections: true,
            deny: Vec::new(),
        }
    }
}

/// One `[[plugins]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginSection {
    pub name: String,
    /// Public proxy port. Defaults to the plugin's well-known port.
    pub port: Option<u16>,
    /// Emulator port. Defaults to the public port plus 10000.
    pub service_port: Option<u16>,
    #[serde(default = "default_service_host")]
    pub host: String,
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}
fn default_dial_timeout_ms() -> u64 {
    1000
}
fn default_udp_buffer_size() -> usize {
    2048
}
fn default_udp_relay_timeout_ms() -> u64 {
    5000
}
fn default_service_host() -> String {
    "127.0.0.1".to_string()
}
fn default_true() -> bool {
    true
}

/// A plugin to expose, with every port resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginConfig {
    pub name: String,
    pub port: u16,
    pub service_host: String,
    pub service_port: u16,
}

/// Resolved server configuration (CLI overrides applied, plugins selected).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub options: ProxyOptions,
    pub log_connections: bool,
    pub deny: Vec<IpAddr>,
    pub plugins: Vec<PluginConfig>,
}

impl ServerConfig {
    /// Load config from a TOML file (defaults if missing), then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_bind_host: Option<&str>,
        cli_services: &[String],
        registry: &PluginRegistry,
    ) -> anyhow::Result<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)
                        .with_context(|| format!("cannot read {}", expanded.display()))?;
                    toml::from_str::<ConfigFile>(&content).context("config parse error")?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, cli_bind_host, cli_services, registry)
    }

    /// Merge a parsed file with CLI overrides.
    pub fn resolve(
        file: ConfigFile,
        cli_bind_host: Option<&str>,
        cli_services: &[String],
        registry: &PluginRegistry,
    ) -> anyhow::Result<Self> {
        let bind_host = cli_bind_host.unwrap_or(file.proxy.bind_host.as_str());
        let bind_host: IpAddr = bind_host
            .parse()
            .with_context(|| format!("invalid bind host: {bind_host}"))?;

        let options = ProxyOptions {
            bind_host,
            dial_timeout: Duration::from_millis(file.proxy.dial_timeout_ms),
            udp_buffer_size: file.proxy.udp_buffer_size,
            udp_relay_timeout: Duration::from_millis(file.proxy.udp_relay_timeout_ms),
        };

        let deny = file
            .middleware
            .deny
            .iter()
            .map(|ip| {
                ip.parse::<IpAddr>()
                    .with_context(|| format!("invalid deny entry: {ip}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        // Configured plugins, or every compiled-in plugin with its defaults.
        let sections = if file.plugins.is_empty() {
            registry
                .names()
                .into_iter()
                .map(|name| PluginSection {
                    name: name.to_string(),
                    port: None,
                    service_port: None,
                    host: default_service_host(),
                })
                .collect()
        } else {
            file.plugins
        };

        let wanted: Vec<String> = cli_services.iter().map(|s| s.to_ascii_lowercase()).collect();
        for name in &wanted {
            registry.get(name)?;
        }

        let mut plugins = Vec::new();
        for section in sections {
            if !wanted.is_empty() && !wanted.contains(&section.name.to_ascii_lowercase()) {
                continue;
            }
            let spec = registry.get(&section.name)?;
            let port = section.port.unwrap_or(spec.default_port);
            let service_port = match section.service_port {
                Some(p) => p,
                None => match port.checked_add(SERVICE_PORT_OFFSET) {
                    Some(p) => p,
                    None => bail!(
                        "plugin {}: set service_port explicitly for public port {port}",
                        section.name
                    ),
                },
            };
            validate_port(port.into())?;
            validate_port(service_port.into())?;
            if port == service_port {
                bail!("plugin {}: port and service_port must differ", section.name);
            }

            plugins.push(PluginConfig {
                name: spec.name.to_string(),
                port,
                service_host: section.host,
                service_port,
            });
        }

        Ok(Self {
            options,
            log_connections: file.middleware.log_connections,
            deny,
            plugins,
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> ConfigFile {
        toml::from_str(toml_src).unwrap()
    }

    #[test]
    fn defaults_expose_every_builtin() {
        let registry = PluginRegistry::builtin();
        let cfg = ServerConfig::resolve(ConfigFile::default(), None, &[], &registry).unwrap();

        assert_eq!(cfg.options.bind_host.to_string(), "0.0.0.0");
        assert_eq!(cfg.options.dial_timeout, Duration::from_secs(1));
        assert_eq!(cfg.options.udp_buffer_size, 2048);
        assert!(cfg.log_connections);
        assert_eq!(
            cfg.plugins,
            vec![PluginConfig {
                name: "echo".to_string(),
                port: 7,
                service_host: "127.0.0.1".to_string(),
                service_port: 10007,
            }]
        );
    }

    #[test]
    fn file_values_and_cli_override() {
        let registry = PluginRegistry::builtin();
        let file = parse(
            r#"
            [proxy]
            bind_host = "0.0.0.0"
            dial_timeout_ms = 250

            [middleware]
            log_connections = false
            deny = ["10.1.2.3"]

            [[plugins]]
            name = "Echo"
            port = 7007
            service_port = 17007
            "#,
        );
        let cfg = ServerConfig::resolve(file, Some("127.0.0.1"), &[], &registry).unwrap();

        assert_eq!(cfg.options.bind_host.to_string(), "127.0.0.1");
        assert_eq!(cfg.options.dial_timeout, Duration::from_millis(250));
        assert!(!cfg.log_connections);
        assert_eq!(cfg.deny, vec!["10.1.2.3".parse::<IpAddr>().unwrap()]);
        assert_eq!(cfg.plugins[0].name, "echo");
        assert_eq!(cfg.plugins[0].port, 7007);
        assert_eq!(cfg.plugins[0].service_port, 17007);
    }

    #[test]
    fn unknown_plugin_rejected() {
        let registry = PluginRegistry::builtin();
        let file = parse("[[plugins]]\nname = \"telnet\"\n");
        assert!(ServerConfig::resolve(file, None, &[], &registry).is_err());

        let services = vec!["gopher".to_string()];
        assert!(ServerConfig::resolve(ConfigFile::default(), None, &services, &registry).is_err());
    }

    #[test]
    fn service_filter_and_bad_values() {
        let registry = PluginRegistry::builtin();
        let services = vec!["ECHO".to_string()];
        let cfg = ServerConfig::resolve(ConfigFile::default(), None, &services, &registry).unwrap();
        assert_eq!(cfg.plugins.len(), 1);

        let file = parse("[middleware]\ndeny = [\"not-an-ip\"]\n");
        assert!(ServerConfig::resolve(file, None, &[], &registry).is_err());

        assert!(ServerConfig::resolve(ConfigFile::default(), Some("nowhere"), &[], &registry).is_err());

        let file = parse("[[plugins]]\nname = \"echo\"\nport = 60000\n");
        assert!(ServerConfig::resolve(file, None, &[], &registry).is_err());
    }

    #[test]
    fn missing_file_uses_defaults() {
        let registry = PluginRegistry::builtin();
        let path = Path::new("/nonexistent/honeyproxy/config.toml");
        let cfg = ServerConfig::load(Some(path), None, &[], &registry).unwrap();
        assert_eq!(cfg.plugins.len(), 1);
    }
}
