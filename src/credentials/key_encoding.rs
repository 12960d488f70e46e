//! Private key normalisation
//!
//! AWS IoT hands out RSA keys as PKCS#1 (`RSA PRIVATE KEY`), and some device
//! tooling stores the same PKCS#1 body under a `PRIVATE KEY` armor. The PEM
//! label is therefore not trusted: the DER structure decides the encoding, and
//! PKCS#1 bodies are wrapped into PKCS#8 before they reach the TLS stack.

use super::CredentialError;
use rumqttc::tokio_rustls::rustls::pki_types::{
    PrivateKeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer,
};
use rustls_pemfile::Item;
use std::fmt;

const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_SEQUENCE: u8 = 0x30;

/// `INTEGER 0`
const PKCS8_VERSION: &[u8] = &[0x02, 0x01, 0x00];

/// `AlgorithmIdentifier { rsaEncryption (1.2.840.113549.1.1.1), NULL }`
const RSA_ENCRYPTION_ALGORITHM: &[u8] = &[
    0x30, 0x0d, 0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01, 0x05, 0x00,
];

/// Structural encoding of a private key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEncoding {
    /// `PrivateKeyInfo` with an algorithm identifier
    Pkcs8,
    /// Bare `RSAPrivateKey`, no algorithm identifier
    Pkcs1,
    /// Bare `ECPrivateKey`
    Sec1,
}

impl fmt::Display for KeyEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyEncoding::Pkcs8 => write!(f, "PKCS#8"),
            KeyEncoding::Pkcs1 => write!(f, "PKCS#1"),
            KeyEncoding::Sec1 => write!(f, "SEC1"),
        }
    }
}

/// A private key ready for the TLS stack
pub struct NormalizedKey {
    pub key: PrivateKeyDer<'static>,
    /// Encoding found in the source material
    pub source_encoding: KeyEncoding,
    /// True when the key was rewrapped from PKCS#1 to PKCS#8
    pub converted: bool,
}

impl fmt::Debug for NormalizedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NormalizedKey")
            .field("key", &"[redacted]")
            .field("source_encoding", &self.source_encoding)
            .field("converted", &self.converted)
            .finish()
    }
}

/// Parse the first private key in `bytes`, which may be PEM or bare DER
pub fn parse_private_key(name: &str, bytes: &[u8]) -> Result<NormalizedKey, CredentialError> {
    let mut reader = bytes;
    for item in rustls_pemfile::read_all(&mut reader) {
        let item = item.map_err(|source| CredentialError::PemParse {
            name: name.to_string(),
            source,
        })?;
        let der = match &item {
            Item::Pkcs1Key(key) => key.secret_pkcs1_der(),
            Item::Pkcs8Key(key) => key.secret_pkcs8_der(),
            Item::Sec1Key(key) => key.secret_sec1_der(),
            _ => continue,
        };
        return normalize_der(der);
    }

    if bytes.first() == Some(&TAG_SEQUENCE) {
        return normalize_der(bytes);
    }

    Err(CredentialError::NoPrivateKey(name.to_string()))
}

/// Convert a DER private key of any supported encoding into one rustls accepts
pub fn normalize_der(der: &[u8]) -> Result<NormalizedKey, CredentialError> {
    let source_encoding = detect_encoding(der)?;
    let (key, converted) = match source_encoding {
        KeyEncoding::Pkcs8 => (
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(der.to_vec())),
            false,
        ),
        KeyEncoding::Pkcs1 => (PrivateKeyDer::Pkcs8(wrap_pkcs1_in_pkcs8(der)), true),
        KeyEncoding::Sec1 => (
            PrivateKeyDer::Sec1(PrivateSec1KeyDer::from(der.to_vec())),
            false,
        ),
    };
    Ok(NormalizedKey {
        key,
        source_encoding,
        converted,
    })
}

/// Identify a key by the element following its version integer
///
/// PKCS#8 continues with the algorithm `SEQUENCE`, PKCS#1 with the modulus
/// `INTEGER`, SEC1 with the private key `OCTET STRING`.
pub fn detect_encoding(der: &[u8]) -> Result<KeyEncoding, CredentialError> {
    let (tag, body, rest) = read_element(der)?;
    if tag != TAG_SEQUENCE {
        return Err(CredentialError::UnsupportedKey(format!(
            "expected a DER SEQUENCE, found tag 0x{tag:02x}"
        )));
    }
    if !rest.is_empty() {
        return Err(CredentialError::UnsupportedKey(format!(
            "{} trailing bytes after key structure",
            rest.len()
        )));
    }

    let (tag, _version, body) = read_element(body)?;
    if tag != TAG_INTEGER {
        return Err(CredentialError::UnsupportedKey(format!(
            "expected a version INTEGER, found tag 0x{tag:02x}"
        )));
    }

    let (tag, _, _) = read_element(body)?;
    match tag {
        TAG_SEQUENCE => Ok(KeyEncoding::Pkcs8),
        TAG_INTEGER => Ok(KeyEncoding::Pkcs1),
        TAG_OCTET_STRING => Ok(KeyEncoding::Sec1),
        other => Err(CredentialError::UnsupportedKey(format!(
            "unrecognised key structure (tag 0x{other:02x} after version)"
        ))),
    }
}

/// Wrap an `RSAPrivateKey` into a `PrivateKeyInfo` (RFC 5208)
pub fn wrap_pkcs1_in_pkcs8(pkcs1: &[u8]) -> PrivatePkcs8KeyDer<'static> {
    let mut body = Vec::with_capacity(pkcs1.len() + 32);
    body.extend_from_slice(PKCS8_VERSION);
    body.extend_from_slice(RSA_ENCRYPTION_ALGORITHM);
    encode_element(TAG_OCTET_STRING, pkcs1, &mut body);

    let mut out = Vec::with_capacity(body.len() + 4);
    encode_element(TAG_SEQUENCE, &body, &mut out);
    PrivatePkcs8KeyDer::from(out)
}

/// Split one DER TLV off the front of `input`: `(tag, contents, remainder)`
fn read_element(input: &[u8]) -> Result<(u8, &[u8], &[u8]), CredentialError> {
    let truncated = || CredentialError::UnsupportedKey("truncated DER structure".to_string());

    let (&tag, rest) = input.split_first().ok_or_else(truncated)?;
    let (&first, rest) = rest.split_first().ok_or_else(truncated)?;

    let (len, rest) = if first < 0x80 {
        (first as usize, rest)
    } else {
        let count = (first & 0x7f) as usize;
        if count == 0 || count > 4 || rest.len() < count {
            return Err(CredentialError::UnsupportedKey(format!(
                "unsupported DER length encoding 0x{first:02x}"
            )));
        }
        let len = rest[..count]
            .iter()
            .fold(0usize, |acc, &b| (acc << 8) | b as usize);
        (len, &rest[count..])
    };

    if rest.len() < len {
        return Err(truncated());
    }
    Ok((tag, &rest[..len], &rest[len..]))
}

fn encode_element(tag: u8, contents: &[u8], out: &mut Vec<u8>) {
    out.push(tag);
    let len = contents.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|&&b| b == 0).count();
        out.push(0x80 | (bytes.len() - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }
    out.extend_from_slice(contents);
}
