use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, error};

use crate::error::{ProxError, Result};

const DEFAULT_INFRA_PORT: u16 = 9100;

/// Static configuration loaded once at startup. Ports, cache sizing and the
/// access log flag cannot be changed without a restart; routes and TLS
/// material are handled by their own watchers.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StaticConfig {
    pub ports: Vec<PortConfig>,
    pub cache: CacheConfig,
    #[serde(rename = "access-log-enabled")]
    pub access_log_enabled: bool,
    #[serde(rename = "infra-port")]
    pub infra_port: u16,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PortConfig {
    pub name: String,
    pub port: u16,
    pub tls: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    #[serde(rename = "cache-max-size-in-mega-byte")]
    pub max_size_in_megabytes: i64,
}

impl StaticConfig {
    /// Load and validate the static configuration file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !has_yaml_extension(path) {
            return Err(ProxError::InvalidFileType);
        }

        let content = tokio::fs::read_to_string(path).await?;
        let mut config: StaticConfig = serde_yaml::from_str(&content)?;
        debug!("parsed static config file {:?}: {:?}", path, config);

        if config.infra_port == 0 {
            config.infra_port = DEFAULT_INFRA_PORT;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if has_duplicates(&self.ports, self.infra_port) {
            return Err(ProxError::DuplicatedPortConfiguration);
        }
        Ok(())
    }
}

/// Listener ports and names must be unique, and no listener may collide with
/// the infra endpoint. Every offender is logged with its count before the
/// configuration is rejected.
fn has_duplicates(ports: &[PortConfig], infra_port: u16) -> bool {
    let mut invalid = false;
    let mut port_counts: HashMap<u16, usize> = HashMap::new();
    let mut name_counts: HashMap<&str, usize> = HashMap::new();

    for p in ports {
        *port_counts.entry(p.port).or_default() += 1;
        *name_counts.entry(p.name.as_str()).or_default() += 1;

        if p.port == infra_port {
            invalid = true;
            error!(
                "static port configuration \"{}\" has the same port as the infra port on {}",
                p.name, infra_port
            );
        }
    }

    for (port, count) in port_counts {
        if count > 1 {
            invalid = true;
            error!("static port configuration has duplicated port address {}, count: {}", port, count);
        }
    }

    for (name, count) in name_counts {
        if count > 1 {
            invalid = true;
            error!("static port configuration has duplicated port name \"{}\", count: {}", name, count);
        }
    }

    invalid
}

/// Config files must carry a `.yaml` or `.yml` extension.
pub(crate) fn has_yaml_extension(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn temp_yaml(content: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn parses_a_full_static_config() {
        let file = temp_yaml(
            r#"
ports:
  - name: http
    port: 8080
    tls: false
  - name: https
    port: 8443
    tls: true
cache:
  enabled: true
  cache-max-size-in-mega-byte: 100
access-log-enabled: true
infra-port: 9200
"#,
        );

        let config = StaticConfig::load(file.path()).await.unwrap();
        assert_eq!(config.ports.len(), 2);
        assert_eq!(config.ports[0].name, "http");
        assert_eq!(config.ports[1].port, 8443);
        assert!(config.ports[1].tls);
        assert!(config.cache.enabled);
        assert_eq!(config.cache.max_size_in_megabytes, 100);
        assert!(config.access_log_enabled);
        assert_eq!(config.infra_port, 9200);
    }

    #[tokio::test]
    async fn defaults_the_infra_port() {
        let file = temp_yaml("ports:\n  - name: http\n    port: 8080\n");
        let config = StaticConfig::load(file.path()).await.unwrap();
        assert_eq!(config.infra_port, 9100);
    }

    #[tokio::test]
    async fn rejects_duplicated_port_addresses() {
        let file = temp_yaml(
            "ports:\n  - name: a\n    port: 8080\n  - name: b\n    port: 8080\n",
        );
        let err = StaticConfig::load(file.path()).await.unwrap_err();
        assert!(matches!(err, ProxError::DuplicatedPortConfiguration));
    }

    #[tokio::test]
    async fn rejects_duplicated_port_names() {
        let file = temp_yaml(
            "ports:\n  - name: a\n    port: 8080\n  - name: a\n    port: 8081\n",
        );
        let err = StaticConfig::load(file.path()).await.unwrap_err();
        assert!(matches!(err, ProxError::DuplicatedPortConfiguration));
    }

    #[tokio::test]
    async fn rejects_a_listener_on_the_infra_port() {
        let file = temp_yaml("ports:\n  - name: a\n    port: 9100\n");
        let err = StaticConfig::load(file.path()).await.unwrap_err();
        assert!(matches!(err, ProxError::DuplicatedPortConfiguration));
    }

    #[tokio::test]
    async fn rejects_non_yaml_files() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(b"{}").unwrap();
        let err = StaticConfig::load(file.path()).await.unwrap_err();
        assert!(matches!(err, ProxError::InvalidFileType));
    }

    #[test]
    fn yaml_extension_check() {
        assert!(has_yaml_extension(Path::new("routes.yaml")));
        assert!(has_yaml_extension(Path::new("routes.yml")));
        assert!(!has_yaml_extension(Path::new("routes.json")));
        assert!(!has_yaml_extension(Path::new("routes")));
    }
}
