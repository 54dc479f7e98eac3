//! Symmetric cryptography: key derivation, keyed-hash signatures, digests
//! and authenticated encryption.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::algorithms::{DigestAlgorithm, EncryptionAlgorithm, SignatureAlgorithm};
use crate::error::CryptoError;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

/// Length of the AES-GCM initialization vector.
const GCM_IV_LEN: usize = 12;
/// Length of the AES-GCM authentication tag.
const GCM_TAG_LEN: usize = 16;

/// Symmetric key material. Zeroed when dropped.
#[derive(Clone)]
pub struct SymmetricKey {
    bytes: Zeroizing<Vec<u8>>,
}

impl SymmetricKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Zeroizing::new(bytes),
        }
    }

    /// Generate a random key of `len` bytes.
    pub fn generate(len: usize) -> Self {
        Self::new(random_bytes(len))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Key length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Key length in bits.
    pub fn bits(&self) -> usize {
        self.bytes.len() * 8
    }

    /// Derive a key with P_SHA1 using `label || nonce` as the seed.
    pub fn derive(&self, label: &[u8], nonce: &[u8], offset: usize, length: usize) -> Self {
        let mut seed = Vec::with_capacity(label.len() + nonce.len());
        seed.extend_from_slice(label);
        seed.extend_from_slice(nonce);
        Self::new(psha1(self.as_bytes(), &seed, offset, length))
    }

    /// Compute a keyed-hash signature.
    pub fn sign(&self, algorithm: SignatureAlgorithm, data: &[u8]) -> Vec<u8> {
        hmac(algorithm, self.as_bytes(), data)
    }

    /// Verify a keyed-hash signature in constant time.
    pub fn verify(&self, algorithm: SignatureAlgorithm, data: &[u8], signature: &[u8]) -> bool {
        constant_time_eq(&self.sign(algorithm, data), signature)
    }

    /// Encrypt and authenticate; output is `iv || ciphertext || tag`.
    pub fn encrypt(
        &self,
        algorithm: EncryptionAlgorithm,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.check_len(algorithm)?;
        let iv = random_bytes(GCM_IV_LEN);
        let nonce = Nonce::from_slice(&iv);
        let ciphertext = match algorithm {
            EncryptionAlgorithm::Aes128Gcm => <Aes128Gcm as KeyInit>::new_from_slice(self.as_bytes())
                .map_err(|_| CryptoError::InvalidKeyLength(self.len(), "AES-128-GCM"))?
                .encrypt(nonce, plaintext),
            EncryptionAlgorithm::Aes256Gcm => <Aes256Gcm as KeyInit>::new_from_slice(self.as_bytes())
                .map_err(|_| CryptoError::InvalidKeyLength(self.len(), "AES-256-GCM"))?
                .encrypt(nonce, plaintext),
        }
        .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut out = iv;
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt `iv || ciphertext || tag`.
    pub fn decrypt(
        &self,
        algorithm: EncryptionAlgorithm,
        data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.check_len(algorithm)?;
        if data.len() < GCM_IV_LEN + GCM_TAG_LEN {
            return Err(CryptoError::DecryptionFailed);
        }
        let (iv, ciphertext) = data.split_at(GCM_IV_LEN);
        let nonce = Nonce::from_slice(iv);
        match algorithm {
            EncryptionAlgorithm::Aes128Gcm => <Aes128Gcm as KeyInit>::new_from_slice(self.as_bytes())
                .map_err(|_| CryptoError::InvalidKeyLength(self.len(), "AES-128-GCM"))?
                .decrypt(nonce, ciphertext),
            EncryptionAlgorithm::Aes256Gcm => <Aes256Gcm as KeyInit>::new_from_slice(self.as_bytes())
                .map_err(|_| CryptoError::InvalidKeyLength(self.len(), "AES-256-GCM"))?
                .decrypt(nonce, ciphertext),
        }
        .map_err(|_| CryptoError::DecryptionFailed)
    }

    fn check_len(&self, algorithm: EncryptionAlgorithm) -> Result<(), CryptoError> {
        if self.len() != algorithm.key_len() {
            return Err(CryptoError::InvalidKeyLength(self.len(), algorithm.uri()));
        }
        Ok(())
    }
}

impl PartialEq for SymmetricKey {
    fn eq(&self, other: &Self) -> bool {
        constant_time_eq(self.as_bytes(), other.as_bytes())
    }
}

impl Eq for SymmetricKey {}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymmetricKey({} bits)", self.bits())
    }
}

/// P_SHA1 as defined by TLS 1.0 and used by WS-Trust and WS-SecureConversation.
pub fn psha1(secret: &[u8], seed: &[u8], offset: usize, length: usize) -> Vec<u8> {
    let total = offset + length;
    let mut out = Vec::with_capacity(total + 20);
    let mut a = seed.to_vec();
    while out.len() < total {
        a = hmac(SignatureAlgorithm::HmacSha1, secret, &a);
        let mut input = a.clone();
        input.extend_from_slice(seed);
        out.extend(hmac(SignatureAlgorithm::HmacSha1, secret, &input));
    }
    out[offset..total].to_vec()
}

/// Keyed-hash MAC over `data`.
pub fn hmac(algorithm: SignatureAlgorithm, key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so construction cannot fail.
    match algorithm {
        SignatureAlgorithm::HmacSha1 => match <HmacSha1 as Mac>::new_from_slice(key) {
            Ok(mut mac) => {
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            Err(_) => Vec::new(),
        },
        SignatureAlgorithm::HmacSha256 => match <HmacSha256 as Mac>::new_from_slice(key) {
            Ok(mut mac) => {
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            Err(_) => Vec::new(),
        },
    }
}

/// Message digest.
pub fn digest(algorithm: DigestAlgorithm, data: &[u8]) -> Vec<u8> {
    match algorithm {
        DigestAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
        DigestAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
    }
}

/// Password digest of the username token profile: `SHA1(nonce + created + password)`.
pub fn password_digest(nonce: &[u8], created: &str, password: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(nonce);
    hasher.update(created.as_bytes());
    hasher.update(password.as_bytes());
    b64_encode(&hasher.finalize())
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    bool::from(a.ct_eq(b))
}

pub fn b64_encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode base64, ignoring the whitespace XML writers may wrap it with.
pub fn b64_decode(data: &str) -> Result<Vec<u8>, CryptoError> {
    let compact: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| CryptoError::Base64(e.to_string()))
}
