use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub listen: ListenConfig,
    pub service_bind: ServiceBindConfig,
    /// Optional HTTP listen address for stats and health (e.g. "0.0.0.0:9090").
    /// Endpoints: GET /metrics (Prometheus), GET /health, GET /stats (JSON).
    pub stats_listen: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    pub url: String,
}

/// Identity forwarded on behalf of clients that supplied no credential of
/// their own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceBindConfig {
    pub binddn: String,
    #[serde(default)]
    pub credentials: String,
}

/// Resolved service identity, shared read-only across sessions.
#[derive(Debug, Clone)]
pub struct ServiceIdentity {
    pub bind_dn: String,
    pub password: String,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        Ok(config)
    }

    pub fn service_identity(&self) -> ServiceIdentity {
        ServiceIdentity {
            bind_dn: self.service_bind.binddn.clone(),
            password: self.service_bind.credentials.clone(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: ListenConfig {
                url: "ldap://127.0.0.1:1389".to_string(),
            },
            service_bind: ServiceBindConfig {
                binddn: "cn=service,dc=example,dc=com".to_string(),
                credentials: String::new(),
            },
            stats_listen: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.listen.url, "ldap://127.0.0.1:1389");
        assert_eq!(config.service_bind.binddn, "cn=service,dc=example,dc=com");
        assert_eq!(config.service_bind.credentials, "");
        assert!(config.stats_listen.is_none());
    }

    #[test]
    fn test_config_from_str() {
        let yaml = r#"
listen:
  url: "ldap://0.0.0.0:389"
service_bind:
  binddn: "cn=svc,dc=example,dc=com"
  credentials: "svc-secret"
stats_listen: "0.0.0.0:9090"
"#;
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.listen.url, "ldap://0.0.0.0:389");
        assert_eq!(config.service_bind.binddn, "cn=svc,dc=example,dc=com");
        assert_eq!(config.service_bind.credentials, "svc-secret");
        assert_eq!(config.stats_listen.as_deref(), Some("0.0.0.0:9090"));
    }

    #[test]
    fn test_config_from_str_minimal() {
        let yaml = r#"
listen:
  url: "ldap://:1389"
service_bind:
  binddn: "cn=svc,dc=example,dc=com"
"#;
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.listen.url, "ldap://:1389");
        // Credentials default to empty.
        assert_eq!(config.service_bind.credentials, "");
        assert!(config.stats_listen.is_none());
    }

    #[test]
    fn test_config_from_file() {
        let yaml = r#"
listen:
  url: "ldap://127.0.0.1:1389"
service_bind:
  binddn: "cn=svc,dc=example,dc=com"
  credentials: "pw"
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file.flush().unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.listen.url, "ldap://127.0.0.1:1389");
        let identity = config.service_identity();
        assert_eq!(identity.bind_dn, "cn=svc,dc=example,dc=com");
        assert_eq!(identity.password, "pw");
    }

    #[test]
    fn test_config_from_str_invalid_yaml() {
        let yaml = "invalid: yaml: content: [";
        assert!(Config::from_str(yaml).is_err());
    }

    #[test]
    fn test_config_from_file_nonexistent() {
        assert!(Config::from_file("/nonexistent/path/config.yaml").is_err());
    }
}
