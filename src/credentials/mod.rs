//! Credential provisioning for the broker connection
//!
//! Loads the broker endpoint and X.509 identity from bundled assets and turns
//! them into a mutual TLS client configuration. No network I/O happens here,
//! and every failure is fatal to the connect attempt: there is no fallback to
//! system roots or to an unauthenticated connection.
//!
//! # Usage
//!
//! ```rust,no_run
//! use esp32cam_monitor::config::MonitorConfig;
//! use esp32cam_monitor::credentials::Provisioner;
//!
//! let config = MonitorConfig::default();
//! let provisioner = Provisioner::new(&config.assets, &config.session);
//! let broker = provisioner.load_broker_config()?;
//! let tls = provisioner.build_tls_context()?;
//! println!("{}:{} with {} trust anchor(s)", broker.endpoint, broker.port, tls.trust_anchor_count());
//! # Ok::<(), esp32cam_monitor::credentials::CredentialError>(())
//! ```

pub mod assets;
pub mod key_encoding;
pub mod tls_context;

pub use assets::{generate_client_id, load_broker_config, AssetBundle, BrokerConfig};
pub use key_encoding::{KeyEncoding, NormalizedKey};
pub use tls_context::{build_tls_context, load_identity, TlsContext, TlsIdentity};

use crate::config::{AssetsSection, SessionSection};
use std::path::PathBuf;
use thiserror::Error;

/// Missing or malformed credential material
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Failed to read asset {}: {source}", path.display())]
    AssetRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse broker config {}: {source}", path.display())]
    BrokerConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid broker config: {0}")]
    InvalidBrokerConfig(String),
    #[error("Malformed PEM in {name}: {source}")]
    PemParse {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("No certificate found in {0}")]
    NoCertificate(String),
    #[error("Root certificate rejected: {0}")]
    TrustAnchorRejected(#[source] rumqttc::tokio_rustls::rustls::Error),
    #[error("No private key found in {0}")]
    NoPrivateKey(String),
    #[error("Unsupported private key: {0}")]
    UnsupportedKey(String),
    #[error("Client key rejected by TLS stack: {0}")]
    KeyRejected(#[source] rumqttc::tokio_rustls::rustls::Error),
}

/// Everything needed to open one session
#[derive(Debug, Clone)]
pub struct ProvisionedSession {
    pub broker: BrokerConfig,
    pub tls: TlsContext,
}

/// Credential loader bound to one asset bundle
#[derive(Debug, Clone)]
pub struct Provisioner {
    assets: AssetBundle,
    client_id_prefix: String,
}

impl Provisioner {
    pub fn new(assets: &AssetsSection, session: &SessionSection) -> Self {
        Self {
            assets: AssetBundle::from_config(assets),
            client_id_prefix: session.client_id_prefix.clone(),
        }
    }

    /// Broker endpoint with a fresh client id
    pub fn load_broker_config(&self) -> Result<BrokerConfig, CredentialError> {
        load_broker_config(&self.assets, &self.client_id_prefix)
    }

    pub fn load_identity(&self) -> Result<TlsIdentity, CredentialError> {
        load_identity(&self.assets)
    }

    /// Load the identity and build the TLS context in one step
    pub fn build_tls_context(&self) -> Result<TlsContext, CredentialError> {
        build_tls_context(self.load_identity()?)
    }

    pub fn provision(&self) -> Result<ProvisionedSession, CredentialError> {
        Ok(ProvisionedSession {
            broker: self.load_broker_config()?,
            tls: self.build_tls_context()?,
        })
    }
}
