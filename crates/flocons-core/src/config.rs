//! Node configuration: JSON file format, defaults, and validation.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 62_116;
pub const DEFAULT_NAMESPACE: &str = "flocons";
pub const DEFAULT_ZOOKEEPER: &str = "127.0.0.1:2181";
pub const DEFAULT_SHARD: &str = "shard-1";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("could not determine hostname: {0}")]
    Hostname(std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeSection {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub external_address: String,
    #[serde(default)]
    pub shard: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageSection {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub max_size: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SyncSection {
    #[serde(default)]
    pub data_timeout: String,
    #[serde(default)]
    pub metadata_timeout: String,
}

/// A fully loaded and validated node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub zookeeper: Vec<String>,
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub sync: SyncSection,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            namespace: String::new(),
            zookeeper: Vec::new(),
            node: NodeSection::default(),
            storage: StorageSection::default(),
            sync: SyncSection::default(),
        }
    }
}

fn hostname_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(([a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9\-]*[a-zA-Z0-9])\.)*([A-Za-z0-9]|[A-Za-z0-9][A-Za-z0-9\-]*[A-Za-z0-9])$",
        )
        .expect("static hostname regex is valid")
    })
}

fn ipv4_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(([0-9]|[1-9][0-9]|1[0-9]{2}|2[0-4][0-9]|25[0-5])\.){3}([0-9]|[1-9][0-9]|1[0-9]{2}|2[0-4][0-9]|25[0-5])$")
            .expect("static ipv4 regex is valid")
    })
}

fn ipv6_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^([0-9a-fA-F]{1,4}:){7,7}[0-9a-fA-F]{1,4}$|^([0-9a-fA-F]{1,4}:){1,7}:$|^::1$|^::$",
        )
        .expect("static ipv6 regex is valid")
    })
}

impl Config {
    /// Load and validate a config from a JSON file on disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&content)
    }

    /// Parse and validate a config from a JSON string.
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_json::from_str(content)?;
        config.sanitize()?;
        Ok(config)
    }

    /// Apply defaults and validate every field, mirroring the original
    /// `sanitizeConfig`.
    fn sanitize(&mut self) -> Result<(), ConfigError> {
        if self.namespace.is_empty() {
            self.namespace = DEFAULT_NAMESPACE.to_string();
        } else if !hostname_regex().is_match(&self.namespace) {
            return Err(ConfigError::Invalid(format!(
                "namespace {} is not valid",
                self.namespace
            )));
        }

        if self.zookeeper.is_empty() {
            self.zookeeper.push(DEFAULT_ZOOKEEPER.to_string());
        } else {
            for address in &self.zookeeper {
                validate_zookeeper_address(address)?;
            }
        }

        let is_node_config = !self.node.name.is_empty()
            || self.node.port != 0
            || !self.node.external_address.is_empty()
            || !self.node.shard.is_empty()
            || !self.storage.path.is_empty();

        if is_node_config {
            if self.storage.path.is_empty() {
                return Err(ConfigError::Invalid(
                    "node config without storage specified".into(),
                ));
            }

            if self.node.port == 0 {
                self.node.port = DEFAULT_PORT;
            }

            if self.node.name.is_empty() {
                let hostname = hostname::get()
                    .map_err(ConfigError::Hostname)?
                    .to_string_lossy()
                    .into_owned();
                tracing::debug!(hostname = %hostname, "no node name specified, using hostname");
                self.node.name = hostname;
            } else if !hostname_regex().is_match(&self.node.name) {
                return Err(ConfigError::Invalid("node name is invalid".into()));
            }

            if self.node.external_address.is_empty() {
                self.node.external_address =
                    format!("http://{}:{}", self.node.name, self.node.port);
            }

            if self.node.shard.is_empty() {
                self.node.shard = DEFAULT_SHARD.to_string();
            }
        }

        Ok(())
    }
}

fn validate_zookeeper_address(address: &str) -> Result<(), ConfigError> {
    let (host, port) = match address.rfind(':') {
        Some(idx) if idx > 0 => {
            let port_str = &address[idx + 1..];
            if port_str.parse::<u16>().is_err() {
                return Err(ConfigError::Invalid(format!(
                    "zookeeper address {address} is not valid"
                )));
            }
            (&address[..idx], true)
        }
        _ => (address, false),
    };
    let _ = port;

    if hostname_regex().is_match(host) || ipv4_regex().is_match(host) || ipv6_regex().is_match(host) {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "zookeeper address {address} is not valid"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_applied_for_empty_config() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config.namespace, DEFAULT_NAMESPACE);
        assert_eq!(config.zookeeper, vec![DEFAULT_ZOOKEEPER.to_string()]);
        assert!(config.node.name.is_empty());
    }

    #[test]
    fn node_config_requires_storage_path() {
        let err = Config::from_json(r#"{"node": {"shard": "shard-2"}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn node_config_fills_in_defaults() {
        let config = Config::from_json(
            r#"{"node": {"name": "node-a"}, "storage": {"path": "/data"}}"#,
        )
        .unwrap();
        assert_eq!(config.node.port, DEFAULT_PORT);
        assert_eq!(config.node.shard, DEFAULT_SHARD);
        assert_eq!(config.node.external_address, "http://node-a:62116");
    }

    #[test]
    fn rejects_invalid_namespace() {
        let err = Config::from_json(r#"{"namespace": "bad namespace!"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn accepts_ipv4_zookeeper_address_with_port() {
        let config = Config::from_json(r#"{"zookeeper": ["10.0.0.5:2181"]}"#).unwrap();
        assert_eq!(config.zookeeper, vec!["10.0.0.5:2181".to_string()]);
    }

    #[test]
    fn rejects_bad_zookeeper_port() {
        let err = Config::from_json(r#"{"zookeeper": ["10.0.0.5:notaport"]}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn explicit_node_name_is_validated() {
        let err = Config::from_json(
            r#"{"node": {"name": "bad name!"}, "storage": {"path": "/data"}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
