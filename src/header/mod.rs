//! The WS-Security header: writing it on outgoing messages and processing
//! it on incoming ones.
//!
//! Sending and receiving share the element vocabulary in [`wire`] and the
//! layout rules in [`layout`]. Each direction owns its own state machine in
//! [`send`] and [`receive`].

pub mod elements;
pub mod layout;
pub mod receive;
pub mod send;
pub mod wire;

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::tokens::{SecurityToken, SecurityTokenParameters};

pub use elements::{ElementCategory, ElementPayload, HeaderElement, SecurityHeaderElementManager};
pub use layout::{HeaderLayoutValidator, StrictLayout};
pub use receive::{ProcessedMessage, ReceiveSecurityHeader, SecurityMessageProperty};
pub use send::{SecuredMessage, SendSecurityHeader};

/// Whether signing happens before or after encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MessageProtectionOrder {
    /// Sign the plaintext, then encrypt. Signatures may themselves be
    /// encrypted.
    #[default]
    SignBeforeEncrypt,
    /// Encrypt first and sign the ciphertext.
    EncryptBeforeSign,
}

/// Ordering rules applied to security header children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SecurityHeaderLayout {
    #[default]
    Strict,
}

impl SecurityHeaderLayout {
    pub fn validator(&self) -> Arc<dyn HeaderLayoutValidator> {
        match self {
            Self::Strict => Arc::new(StrictLayout),
        }
    }
}

/// Hands out ids that do not collide with any id already in the message.
#[derive(Debug, Default)]
pub struct IdGenerator {
    next: usize,
    taken: HashSet<String>,
}

impl IdGenerator {
    pub fn new(existing: impl IntoIterator<Item = String>) -> Self {
        Self {
            next: 0,
            taken: existing.into_iter().collect(),
        }
    }

    pub fn next_id(&mut self) -> String {
        loop {
            let id = format!("_{}", self.next);
            self.next += 1;
            if self.taken.insert(id.clone()) {
                return id;
            }
        }
    }

    /// Claim a caller-chosen id. Returns false if it is already in use.
    pub fn reserve(&mut self, id: &str) -> bool {
        self.taken.insert(id.to_string())
    }
}

/// Signature values a responder echoes back to the initiator.
///
/// Values are appended as request signatures are verified. The whole set
/// is encrypted if any value was added with encryption requested.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureConfirmations {
    values: Vec<Vec<u8>>,
    encrypted: bool,
}

impl SignatureConfirmations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: Vec<u8>, encrypt: bool) {
        self.values.push(value);
        self.encrypted |= encrypt;
    }

    pub fn values(&self) -> &[Vec<u8>] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }
}

/// How a supporting token takes part in message protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SupportingTokenAttachment {
    /// Written to the header, not signed
    #[default]
    Basic,
    /// Written to the header and covered by the primary signature
    Signed,
    /// Keys a signature over the primary signature
    Endorsing,
    /// Both signed and endorsing
    SignedEndorsing,
}

impl SupportingTokenAttachment {
    pub fn is_signed(&self) -> bool {
        matches!(self, Self::Signed | Self::SignedEndorsing)
    }

    pub fn is_endorsing(&self) -> bool {
        matches!(self, Self::Endorsing | Self::SignedEndorsing)
    }
}

/// A token sent alongside the primary token.
#[derive(Debug, Clone)]
pub struct SupportingToken {
    pub token: Arc<SecurityToken>,
    pub parameters: SecurityTokenParameters,
    pub attachment: SupportingTokenAttachment,
    /// Encrypt the token element in the header
    pub encrypt: bool,
}

impl SupportingToken {
    pub fn new(
        token: Arc<SecurityToken>,
        parameters: SecurityTokenParameters,
        attachment: SupportingTokenAttachment,
    ) -> Self {
        Self {
            token,
            parameters,
            attachment,
            encrypt: false,
        }
    }

    pub fn encrypted(mut self) -> Self {
        self.encrypt = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_generator_skips_existing() {
        let mut ids = IdGenerator::new(vec!["_0".to_string(), "_2".to_string()]);
        assert_eq!(ids.next_id(), "_1");
        assert_eq!(ids.next_id(), "_3");
        assert!(!ids.reserve("_1"));
        assert!(ids.reserve("token-1"));
        assert!(!ids.reserve("token-1"));
    }

    #[test]
    fn test_confirmations_encryption_flag_is_sticky() {
        let mut confirmations = SignatureConfirmations::new();
        confirmations.add(vec![1; 20], false);
        assert!(!confirmations.is_encrypted());
        confirmations.add(vec![2; 20], true);
        confirmations.add(vec![3; 20], false);
        assert!(confirmations.is_encrypted());
        assert_eq!(confirmations.len(), 3);
    }
}
