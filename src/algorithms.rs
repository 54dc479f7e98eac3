//! Algorithm suites.
//!
//! A suite is a fixed capability table selected by configuration: which
//! digest, signature, encryption and key-derivation algorithms are used on
//! send, which are accepted on receive, and the key lengths that go with
//! them.

use serde::{Deserialize, Serialize};

use crate::canonical::EXC_C14N;
use crate::error::MessageSecurityError;

/// Digest algorithms used for signature references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
}

impl DigestAlgorithm {
    pub fn uri(&self) -> &'static str {
        match self {
            Self::Sha1 => "http://www.w3.org/2000/09/xmldsig#sha1",
            Self::Sha256 => "http://www.w3.org/2001/04/xmlenc#sha256",
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        [Self::Sha1, Self::Sha256].into_iter().find(|a| a.uri() == uri)
    }
}

/// Symmetric (keyed-hash) signature algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    HmacSha1,
    HmacSha256,
}

impl SignatureAlgorithm {
    pub fn uri(&self) -> &'static str {
        match self {
            Self::HmacSha1 => "http://www.w3.org/2000/09/xmldsig#hmac-sha1",
            Self::HmacSha256 => "http://www.w3.org/2001/04/xmldsig-more#hmac-sha256",
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        [Self::HmacSha1, Self::HmacSha256]
            .into_iter()
            .find(|a| a.uri() == uri)
    }
}

/// Authenticated block encryption algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionAlgorithm {
    Aes128Gcm,
    Aes256Gcm,
}

impl EncryptionAlgorithm {
    pub fn uri(&self) -> &'static str {
        match self {
            Self::Aes128Gcm => "http://www.w3.org/2009/xmlenc11#aes128-gcm",
            Self::Aes256Gcm => "http://www.w3.org/2009/xmlenc11#aes256-gcm",
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        [Self::Aes128Gcm, Self::Aes256Gcm]
            .into_iter()
            .find(|a| a.uri() == uri)
    }

    /// Required key length in bytes.
    pub fn key_len(&self) -> usize {
        match self {
            Self::Aes128Gcm => 16,
            Self::Aes256Gcm => 32,
        }
    }
}

/// P_SHA1 key derivation (WS-SecureConversation).
pub const PSHA1_KEY_DERIVATION: &str = "http://schemas.xmlsoap.org/ws/2005/02/sc/dk/p_sha1";

/// Capability table behind an [`AlgorithmSuite`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlgorithmCapabilities {
    pub digest: DigestAlgorithm,
    pub symmetric_signature: SignatureAlgorithm,
    pub encryption: EncryptionAlgorithm,
    pub key_derivation: &'static str,
    pub canonicalization: &'static str,
    pub symmetric_key_wrap: &'static str,
    /// Derived signing key length in bits
    pub signature_key_derivation_length: usize,
    /// Derived encryption key length in bits
    pub encryption_key_derivation_length: usize,
    pub min_symmetric_key_length: usize,
    pub max_symmetric_key_length: usize,
    pub default_symmetric_key_length: usize,
}

/// Supported algorithm suites (WS-SecurityPolicy names).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AlgorithmSuite {
    #[default]
    Basic256,
    Basic128,
    Basic256Sha256,
    Basic128Sha256,
}

const KW_AES256: &str = "http://www.w3.org/2001/04/xmlenc#kw-aes256";
const KW_AES128: &str = "http://www.w3.org/2001/04/xmlenc#kw-aes128";

impl AlgorithmSuite {
    /// Capability table for this suite.
    pub fn capabilities(&self) -> AlgorithmCapabilities {
        match self {
            Self::Basic256 => AlgorithmCapabilities {
                digest: DigestAlgorithm::Sha1,
                symmetric_signature: SignatureAlgorithm::HmacSha1,
                encryption: EncryptionAlgorithm::Aes256Gcm,
                key_derivation: PSHA1_KEY_DERIVATION,
                canonicalization: EXC_C14N,
                symmetric_key_wrap: KW_AES256,
                signature_key_derivation_length: 192,
                encryption_key_derivation_length: 256,
                min_symmetric_key_length: 256,
                max_symmetric_key_length: 256,
                default_symmetric_key_length: 256,
            },
            Self::Basic128 => AlgorithmCapabilities {
                digest: DigestAlgorithm::Sha1,
                symmetric_signature: SignatureAlgorithm::HmacSha1,
                encryption: EncryptionAlgorithm::Aes128Gcm,
                key_derivation: PSHA1_KEY_DERIVATION,
                canonicalization: EXC_C14N,
                symmetric_key_wrap: KW_AES128,
                signature_key_derivation_length: 128,
                encryption_key_derivation_length: 128,
                min_symmetric_key_length: 128,
                max_symmetric_key_length: 256,
                default_symmetric_key_length: 128,
            },
            Self::Basic256Sha256 => AlgorithmCapabilities {
                digest: DigestAlgorithm::Sha256,
                symmetric_signature: SignatureAlgorithm::HmacSha256,
                encryption: EncryptionAlgorithm::Aes256Gcm,
                key_derivation: PSHA1_KEY_DERIVATION,
                canonicalization: EXC_C14N,
                symmetric_key_wrap: KW_AES256,
                signature_key_derivation_length: 256,
                encryption_key_derivation_length: 256,
                min_symmetric_key_length: 256,
                max_symmetric_key_length: 256,
                default_symmetric_key_length: 256,
            },
            Self::Basic128Sha256 => AlgorithmCapabilities {
                digest: DigestAlgorithm::Sha256,
                symmetric_signature: SignatureAlgorithm::HmacSha256,
                encryption: EncryptionAlgorithm::Aes128Gcm,
                key_derivation: PSHA1_KEY_DERIVATION,
                canonicalization: EXC_C14N,
                symmetric_key_wrap: KW_AES128,
                signature_key_derivation_length: 128,
                encryption_key_derivation_length: 128,
                min_symmetric_key_length: 128,
                max_symmetric_key_length: 256,
                default_symmetric_key_length: 128,
            },
        }
    }

    /// Whether a symmetric key of this many bits may be used with the suite.
    pub fn is_symmetric_key_length_supported(&self, bits: usize) -> bool {
        let caps = self.capabilities();
        bits >= caps.min_symmetric_key_length && bits <= caps.max_symmetric_key_length
    }

    pub fn ensure_digest(&self, uri: &str) -> Result<DigestAlgorithm, MessageSecurityError> {
        match DigestAlgorithm::from_uri(uri) {
            Some(a) if a == self.capabilities().digest => Ok(a),
            _ => Err(MessageSecurityError::UnsupportedAlgorithm(uri.to_string())),
        }
    }

    pub fn ensure_signature(&self, uri: &str) -> Result<SignatureAlgorithm, MessageSecurityError> {
        match SignatureAlgorithm::from_uri(uri) {
            Some(a) if a == self.capabilities().symmetric_signature => Ok(a),
            _ => Err(MessageSecurityError::UnsupportedAlgorithm(uri.to_string())),
        }
    }

    pub fn ensure_encryption(&self, uri: &str) -> Result<EncryptionAlgorithm, MessageSecurityError> {
        match EncryptionAlgorithm::from_uri(uri) {
            Some(a) if a == self.capabilities().encryption => Ok(a),
            _ => Err(MessageSecurityError::UnsupportedAlgorithm(uri.to_string())),
        }
    }

    pub fn ensure_canonicalization(&self, uri: &str) -> Result<(), MessageSecurityError> {
        if uri == self.capabilities().canonicalization {
            Ok(())
        } else {
            Err(MessageSecurityError::UnsupportedAlgorithm(uri.to_string()))
        }
    }

    pub fn ensure_key_derivation(&self, uri: &str) -> Result<(), MessageSecurityError> {
        if uri == self.capabilities().key_derivation {
            Ok(())
        } else {
            Err(MessageSecurityError::UnsupportedAlgorithm(uri.to_string()))
        }
    }
}
