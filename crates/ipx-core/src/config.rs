use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};

/// Exporter configuration, loaded from YAML and overridden by CLI flags
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExporterConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    #[serde(default = "default_telemetry_path")]
    pub telemetry_path: String,
    /// Chains exported as metrics; empty exports every chain.
    #[serde(default)]
    pub enabled_chains: Vec<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Counted dump of the running firewall.
    #[serde(default)]
    pub live: SourceConfig,
    /// Uncounted managed rule file the live rules are compared against.
    #[serde(default)]
    pub reference: Option<SourceConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceConfig {
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    File {
        path: PathBuf,
    },
}

fn default_listen_address() -> String {
    ":9455".to_string()
}

fn default_telemetry_path() -> String {
    "/metrics".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self::Command {
            program: "iptables-save".to_string(),
            args: vec!["-c".to_string()],
        }
    }
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            telemetry_path: default_telemetry_path(),
            enabled_chains: vec![],
            log_level: default_log_level(),
            live: SourceConfig::default(),
            reference: None,
        }
    }
}

impl ExporterConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse exporter config YAML")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read exporter config from {:?}", path))?;
        Self::from_yaml(&content)
    }

    /// Load the config file if one was given, otherwise fall back to defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Resolve `listen_address`; a bare `:port` binds every interface and
    /// host names are looked up, taking the first address returned
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let addr = &self.listen_address;
        if let Some(port) = addr.strip_prefix(':') {
            let port: u16 = port
                .parse()
                .with_context(|| format!("Invalid listen port in '{}'", addr))?;
            return Ok(SocketAddr::from(([0, 0, 0, 0], port)));
        }
        addr.as_str()
            .to_socket_addrs()
            .with_context(|| format!("Invalid listen address '{}'", addr))?
            .next()
            .with_context(|| format!("Listen address '{}' resolved to nothing", addr))
    }

    pub fn chain_enabled(&self, chain: &str) -> bool {
        self.enabled_chains.is_empty() || self.enabled_chains.iter().any(|c| c == chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ExporterConfig::default();
        assert_eq!(config.listen_address, ":9455");
        assert_eq!(config.telemetry_path, "/metrics");
        assert!(config.reference.is_none());
        assert!(config.chain_enabled("INPUT"));
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = ExporterConfig::from_yaml("{}").unwrap();
        assert_eq!(config.listen_address, ":9455");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.live, SourceConfig::default());
    }

    #[test]
    fn test_full_yaml() {
        let yaml = r#"
listen_address: "127.0.0.1:9100"
telemetry_path: /stats
enabled_chains: [INPUT, OUTPUT]
log_level: debug
live:
  type: file
  path: /tmp/server.iptables-save
reference:
  type: command
  program: cat
  args: [/etc/iptables/rules.v4]
"#;
        let config = ExporterConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.telemetry_path, "/stats");
        assert!(config.chain_enabled("OUTPUT"));
        assert!(!config.chain_enabled("FORWARD"));
        assert_eq!(
            config.live,
            SourceConfig::File {
                path: PathBuf::from("/tmp/server.iptables-save")
            }
        );
        assert_eq!(
            config.reference,
            Some(SourceConfig::Command {
                program: "cat".into(),
                args: vec!["/etc/iptables/rules.v4".into()],
            })
        );
        assert_eq!(
            config.socket_addr().unwrap(),
            "127.0.0.1:9100".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_socket_addr() {
        let mut config = ExporterConfig::default();
        assert_eq!(
            config.socket_addr().unwrap(),
            "0.0.0.0:9455".parse::<SocketAddr>().unwrap()
        );

        config.listen_address = ":99999".into();
        assert!(config.socket_addr().is_err());

        config.listen_address = "localhost".into();
        assert!(config.socket_addr().is_err());

        config.listen_address = "[::1]:9100".into();
        assert_eq!(
            config.socket_addr().unwrap(),
            "[::1]:9100".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_socket_addr_resolves_host_names() {
        let config = ExporterConfig {
            listen_address: "localhost:9455".into(),
            ..ExporterConfig::default()
        };
        let addr = config.socket_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 9455);
    }

    #[test]
    fn test_unknown_source_type_rejected() {
        let yaml = "live:\n  type: socket\n  path: /run/x\n";
        assert!(ExporterConfig::from_yaml(yaml).is_err());
    }
}
