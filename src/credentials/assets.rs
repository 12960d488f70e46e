//! Bundled read-only assets: broker endpoint file and PEM material

use super::CredentialError;
use crate::config::AssetsSection;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Broker endpoint plus the client id for one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokerConfig {
    pub endpoint: String,
    pub port: u16,
    /// Unique per session so the broker never merges two clients
    pub client_id: String,
}

/// Shape of the bundled endpoint file
#[derive(Debug, Deserialize)]
struct EndpointFile {
    endpoint: String,
    port: i64,
}

/// Directory of assets plus the file names inside it
#[derive(Debug, Clone)]
pub struct AssetBundle {
    section: AssetsSection,
}

impl AssetBundle {
    pub fn from_config(section: &AssetsSection) -> Self {
        Self {
            section: section.clone(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.section.dir
    }

    pub fn names(&self) -> &AssetsSection {
        &self.section
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.section.dir.join(name)
    }

    /// Read one asset in full
    pub fn read(&self, name: &str) -> Result<Vec<u8>, CredentialError> {
        let path = self.path(name);
        debug!(path = %path.display(), "Reading credential asset");
        std::fs::read(&path).map_err(|source| CredentialError::AssetRead { path, source })
    }
}

/// Load the broker endpoint and mint a fresh client id
pub fn load_broker_config(
    assets: &AssetBundle,
    client_id_prefix: &str,
) -> Result<BrokerConfig, CredentialError> {
    let name = &assets.names().broker_config;
    let bytes = assets.read(name)?;
    let file: EndpointFile =
        serde_json::from_slice(&bytes).map_err(|source| CredentialError::BrokerConfigParse {
            path: assets.path(name),
            source,
        })?;

    let endpoint = file.endpoint.trim();
    if endpoint.is_empty() {
        return Err(CredentialError::InvalidBrokerConfig(
            "endpoint must not be empty".to_string(),
        ));
    }
    let port = u16::try_from(file.port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| {
            CredentialError::InvalidBrokerConfig(format!(
                "port {} is outside 1..=65535",
                file.port
            ))
        })?;

    Ok(BrokerConfig {
        endpoint: endpoint.to_string(),
        port,
        client_id: generate_client_id(client_id_prefix),
    })
}

/// `<prefix>_<unix millis>_<8 hex chars>`
pub fn generate_client_id(prefix: &str) -> String {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}_{millis}_{}", &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn bundle_with_endpoint(json: &str) -> (tempfile::TempDir, AssetBundle) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("aws_config.json"), json).unwrap();
        let section = AssetsSection {
            dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let bundle = AssetBundle::from_config(&section);
        (dir, bundle)
    }

    #[test]
    fn test_load_broker_config() {
        let (_dir, bundle) = bundle_with_endpoint(
            r#"{"endpoint": "abc123-ats.iot.ap-northeast-2.amazonaws.com", "port": 8883}"#,
        );
        let config = load_broker_config(&bundle, "AndroidClient").unwrap();
        assert_eq!(
            config.endpoint,
            "abc123-ats.iot.ap-northeast-2.amazonaws.com"
        );
        assert_eq!(config.port, 8883);
        assert!(config.client_id.starts_with("AndroidClient_"));
    }

    #[test]
    fn test_client_ids_are_unique() {
        let (_dir, bundle) = bundle_with_endpoint(r#"{"endpoint": "broker", "port": 8883}"#);
        let first = load_broker_config(&bundle, "p").unwrap();
        let second = load_broker_config(&bundle, "p").unwrap();
        assert_ne!(first.client_id, second.client_id);
    }

    #[test]
    fn test_port_out_of_range() {
        for port in ["0", "70000", "-1"] {
            let (_dir, bundle) =
                bundle_with_endpoint(&format!(r#"{{"endpoint": "broker", "port": {port}}}"#));
            let result = load_broker_config(&bundle, "p");
            assert!(
                matches!(result, Err(CredentialError::InvalidBrokerConfig(_))),
                "port {port} should be rejected"
            );
        }
    }

    #[test]
    fn test_empty_endpoint() {
        let (_dir, bundle) = bundle_with_endpoint(r#"{"endpoint": "  ", "port": 8883}"#);
        assert!(matches!(
            load_broker_config(&bundle, "p"),
            Err(CredentialError::InvalidBrokerConfig(_))
        ));
    }

    #[test]
    fn test_missing_field() {
        let (_dir, bundle) = bundle_with_endpoint(r#"{"endpoint": "broker"}"#);
        assert!(matches!(
            load_broker_config(&bundle, "p"),
            Err(CredentialError::BrokerConfigParse { .. })
        ));
    }

    #[test]
    fn test_missing_file() {
        let section = AssetsSection {
            dir: PathBuf::from("/nonexistent/esp32cam-assets"),
            ..Default::default()
        };
        let bundle = AssetBundle::from_config(&section);
        let result = load_broker_config(&bundle, "p");
        assert!(matches!(result, Err(CredentialError::AssetRead { .. })));
    }
}
