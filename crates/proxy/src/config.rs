//! Configuration ingress.
//!
//! The proxy is configured from a single YAML (or JSON) file: a map of
//! downstream server descriptors plus one optional `proxy` settings block.
//! Unknown fields are ignored so configs written for newer releases still
//! load.

use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Environment override for [`ProxySettings::max_concurrent_connections`].
pub const MAX_CONNECTIONS_ENV: &str = "TOOLSCOPE_MAX_CONCURRENT_CONNECTIONS";

/// Transport descriptor for one downstream server, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Child process speaking MCP over stdin/stdout.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Streamable HTTP endpoint.
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    /// Server-sent events endpoint.
    Sse {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl TransportConfig {
    /// Short label for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::Http { .. } => "http",
            Self::Sse { .. } => "sse",
        }
    }
}

/// A named downstream descriptor. Immutable for the lifetime of its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub name: String,
    pub transport: TransportConfig,
}

/// How identically named tools from different servers are published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Always publish `server<sep>tool` names. The default.
    #[default]
    NamespaceAlways,
    /// Publish `server_tool` names.
    PrefixServer,
    /// Refuse to publish a conflicting tool and record a warning.
    Error,
}

/// Tunables for the proxy core. All fields have working defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxySettings {
    /// Upper bound on concurrent connect attempts during startup.
    pub max_concurrent_connections: usize,
    pub health_check_interval_secs: u64,
    /// Per-call deadline for routed tool calls.
    pub call_timeout_secs: u64,
    /// Deadline for a single discovery `tools/list`.
    pub discovery_timeout_secs: u64,
    pub cache_ttl_secs: u64,
    pub refresh_interval_secs: u64,
    /// Install the periodic refresh timer at startup.
    pub auto_discovery: bool,
    pub namespace_separator: String,
    pub conflict_policy: ConflictPolicy,
    /// Cap on cached tools per server; `None` means unlimited.
    pub max_tools_per_server: Option<usize>,
    /// Collect cache and latency counters in the discovery engine.
    pub enable_metrics: bool,
    /// Check required arguments against the tool schema before forwarding.
    pub validate_params: bool,
    /// Exclude tools whose callable contract drifted from the saved hash.
    pub secure_mode: bool,
    /// Expose administrative and toolset tools together, without modes.
    pub legacy_combined_mode: bool,
    /// Replacement for the namespace separator in exposed names, for peers
    /// that cannot accept it. `None` exposes namespaced names unchanged.
    pub flatten_delimiter: Option<String>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            max_concurrent_connections: 10,
            health_check_interval_secs: 30,
            call_timeout_secs: 60,
            discovery_timeout_secs: 10,
            cache_ttl_secs: 300,
            refresh_interval_secs: 30,
            auto_discovery: true,
            namespace_separator: ".".to_string(),
            conflict_policy: ConflictPolicy::default(),
            max_tools_per_server: None,
            enable_metrics: true,
            validate_params: true,
            secure_mode: true,
            legacy_combined_mode: false,
            flatten_delimiter: None,
        }
    }
}

impl ProxySettings {
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    #[must_use]
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }

    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

/// Top-level configuration file shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    #[serde(default)]
    pub servers: HashMap<String, TransportConfig>,
    #[serde(default)]
    pub proxy: ProxySettings,
}

impl ProxyConfig {
    /// Load a config file, apply environment overrides, and validate.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Config` on unreadable files, parse failures, or
    /// invalid values. The host treats this as fatal (exit code 1).
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::Config(format!("read {}: {e}", path.display())))?;
        let mut config = Self::parse(&raw, path.extension().and_then(|s| s.to_str()))?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn parse(raw: &str, extension: Option<&str>) -> Result<Self> {
        if extension.is_some_and(|e| e.eq_ignore_ascii_case("json")) {
            serde_json::from_str(raw).map_err(|e| ProxyError::Config(format!("parse json: {e}")))
        } else {
            serde_yaml::from_str(raw).map_err(|e| ProxyError::Config(format!("parse yaml: {e}")))
        }
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var(MAX_CONNECTIONS_ENV) {
            self.proxy.max_concurrent_connections = v.parse().map_err(|_| {
                ProxyError::Config(format!("{MAX_CONNECTIONS_ENV} must be a positive integer"))
            })?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.proxy.max_concurrent_connections == 0 {
            return Err(ProxyError::Config(
                "maxConcurrentConnections must be at least 1".to_string(),
            ));
        }
        if self.proxy.namespace_separator.is_empty() {
            return Err(ProxyError::Config(
                "namespaceSeparator must not be empty".to_string(),
            ));
        }
        for (name, transport) in &self.servers {
            if name.is_empty() {
                return Err(ProxyError::Config("server name must not be empty".into()));
            }
            match transport {
                TransportConfig::Stdio { command, .. } if command.is_empty() => {
                    return Err(ProxyError::Config(format!(
                        "server '{name}': stdio command must not be empty"
                    )));
                }
                TransportConfig::Http { url, .. } | TransportConfig::Sse { url, .. }
                    if url.is_empty() =>
                {
                    return Err(ProxyError::Config(format!(
                        "server '{name}': url must not be empty"
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// The downstream map in the form the connection manager ingests.
    #[must_use]
    pub fn server_configs(&self) -> Vec<ServerConfig> {
        let mut out: Vec<ServerConfig> = self
            .servers
            .iter()
            .map(|(name, transport)| ServerConfig {
                name: name.clone(),
                transport: transport.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_yaml_with_defaults() {
        let cfg: ProxyConfig = ProxyConfig::parse(
            r#"
servers:
  github:
    type: stdio
    command: npx
    args: ["-y", "@modelcontextprotocol/server-github"]
"#,
            Some("yaml"),
        )
        .expect("parse");

        assert_eq!(cfg.servers.len(), 1);
        assert_eq!(cfg.proxy.max_concurrent_connections, 10);
        assert_eq!(cfg.proxy.namespace_separator, ".");
        assert!(cfg.proxy.secure_mode);
        assert!(!cfg.proxy.legacy_combined_mode);
    }

    #[test]
    fn parses_all_transport_variants() {
        let cfg: ProxyConfig = ProxyConfig::parse(
            r#"
servers:
  local:
    type: stdio
    command: ./server
  remote:
    type: http
    url: https://example.com/mcp
    headers:
      Authorization: "Bearer token"
  legacy:
    type: sse
    url: https://example.com/sse
"#,
            Some("yaml"),
        )
        .expect("parse");

        assert!(matches!(
            cfg.servers["local"],
            TransportConfig::Stdio { .. }
        ));
        assert!(matches!(cfg.servers["remote"], TransportConfig::Http { .. }));
        assert!(matches!(cfg.servers["legacy"], TransportConfig::Sse { .. }));
    }

    #[test]
    fn parses_json_by_extension() {
        let cfg: ProxyConfig = ProxyConfig::parse(
            r#"{"servers": {"s1": {"type": "stdio", "command": "srv"}}}"#,
            Some("json"),
        )
        .expect("parse");
        assert_eq!(cfg.servers.len(), 1);
    }

    #[test]
    fn ignores_unknown_fields() {
        let cfg: ProxyConfig = ProxyConfig::parse(
            r#"
servers:
  s1:
    type: stdio
    command: srv
    futureOption: true
proxy:
  cacheTtlSecs: 60
  someNewKnob: 9
"#,
            Some("yaml"),
        )
        .expect("parse");
        assert_eq!(cfg.proxy.cache_ttl_secs, 60);
    }

    #[test]
    fn rejects_zero_connection_bound() {
        let mut cfg = ProxyConfig::default();
        cfg.proxy.max_concurrent_connections = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_empty_stdio_command() {
        let cfg: ProxyConfig = ProxyConfig::parse(
            r#"
servers:
  s1:
    type: stdio
    command: ""
"#,
            Some("yaml"),
        )
        .expect("parse");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn server_configs_are_sorted_by_name() {
        let cfg: ProxyConfig = ProxyConfig::parse(
            r#"
servers:
  zeta: { type: stdio, command: z }
  alpha: { type: stdio, command: a }
"#,
            Some("yaml"),
        )
        .expect("parse");

        let names: Vec<_> = cfg.server_configs().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
