//! Trust store and key store assembly for mutual TLS

use super::assets::AssetBundle;
use super::key_encoding::{parse_private_key, KeyEncoding};
use super::CredentialError;
use rumqttc::tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rumqttc::tokio_rustls::rustls::{ClientConfig, RootCertStore};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// X.509 identity material, held only in memory and consumed once
pub struct TlsIdentity {
    /// Every certificate found in the root CA file
    pub root_certificates: Vec<CertificateDer<'static>>,
    /// Leaf first
    pub client_chain: Vec<CertificateDer<'static>>,
    pub client_key: PrivateKeyDer<'static>,
    pub key_encoding: KeyEncoding,
    pub key_converted: bool,
}

impl fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("root_certificates", &self.root_certificates.len())
            .field("client_chain", &self.client_chain.len())
            .field("client_key", &"[redacted]")
            .field("key_encoding", &self.key_encoding)
            .field("key_converted", &self.key_converted)
            .finish()
    }
}

/// Client TLS configuration with a summary of what went into it
#[derive(Debug, Clone)]
pub struct TlsContext {
    config: Arc<ClientConfig>,
    trust_anchor_count: usize,
    client_chain_len: usize,
    key_encoding: KeyEncoding,
    key_converted: bool,
}

impl TlsContext {
    /// Number of roots in the trust store; only supplied roots, never system ones
    pub fn trust_anchor_count(&self) -> usize {
        self.trust_anchor_count
    }

    /// Certificates presented for client authentication
    pub fn client_chain_len(&self) -> usize {
        self.client_chain_len
    }

    pub fn key_encoding(&self) -> KeyEncoding {
        self.key_encoding
    }

    pub fn key_converted(&self) -> bool {
        self.key_converted
    }

    /// rustls configuration, optionally offering ALPN protocols
    pub fn client_config(&self, alpn_protocols: &[String]) -> Arc<ClientConfig> {
        if alpn_protocols.is_empty() {
            return self.config.clone();
        }
        let mut config = (*self.config).clone();
        config.alpn_protocols = alpn_protocols
            .iter()
            .map(|p| p.as_bytes().to_vec())
            .collect();
        Arc::new(config)
    }
}

/// Read root CA, client certificate and client key from the asset bundle
pub fn load_identity(assets: &AssetBundle) -> Result<TlsIdentity, CredentialError> {
    let names = assets.names();
    debug!(dir = %assets.dir().display(), "Loading TLS identity");

    let root_certificates = parse_certificates(&names.root_ca, &assets.read(&names.root_ca)?)?;
    let client_chain = parse_certificates(&names.client_cert, &assets.read(&names.client_cert)?)?;
    let normalized = parse_private_key(&names.client_key, &assets.read(&names.client_key)?)?;

    if normalized.converted {
        info!(
            from = %normalized.source_encoding,
            "Converted legacy client key to PKCS#8"
        );
    }

    Ok(TlsIdentity {
        root_certificates,
        client_chain,
        client_key: normalized.key,
        key_encoding: normalized.source_encoding,
        key_converted: normalized.converted,
    })
}

/// Parse every certificate in a PEM file; at least one is required
pub fn parse_certificates(
    name: &str,
    pem: &[u8],
) -> Result<Vec<CertificateDer<'static>>, CredentialError> {
    let mut reader = pem;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| CredentialError::PemParse {
            name: name.to_string(),
            source,
        })?;

    if certs.is_empty() {
        return Err(CredentialError::NoCertificate(name.to_string()));
    }
    Ok(certs)
}

/// Build the mutual TLS client configuration
///
/// The trust store starts empty and holds only the supplied roots, so the
/// broker must chain to them. The key store binds the client chain to the key.
pub fn build_tls_context(identity: TlsIdentity) -> Result<TlsContext, CredentialError> {
    let TlsIdentity {
        root_certificates,
        client_chain,
        client_key,
        key_encoding,
        key_converted,
    } = identity;

    let mut roots = RootCertStore::empty();
    for cert in root_certificates {
        roots
            .add(cert)
            .map_err(CredentialError::TrustAnchorRejected)?;
    }
    let trust_anchor_count = roots.len();
    if trust_anchor_count == 0 {
        warn!("Root CA file produced an empty trust store");
        return Err(CredentialError::NoCertificate("root CA".to_string()));
    }

    let client_chain_len = client_chain.len();
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(client_chain, client_key)
        .map_err(CredentialError::KeyRejected)?;

    Ok(TlsContext {
        config: Arc::new(config),
        trust_anchor_count,
        client_chain_len,
        key_encoding,
        key_converted,
    })
}
