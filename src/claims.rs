//! Claims extracted from the tokens of a verified message.

use serde::{Deserialize, Serialize};

use crate::algorithms::DigestAlgorithm;
use crate::crypto::{b64_encode, digest};
use crate::tokens::{SecurityToken, TokenKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClaimType {
    /// Authenticated user name
    Name,
    /// Session context the message was protected under
    SessionContext,
    /// Base64 SHA-1 thumbprint of a certificate
    X509Thumbprint,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Claim {
    pub claim_type: ClaimType,
    pub resource: String,
}

impl Claim {
    pub fn new(claim_type: ClaimType, resource: impl Into<String>) -> Self {
        Self {
            claim_type,
            resource: resource.into(),
        }
    }

    /// The claim a token proves, if any.
    pub fn from_token(token: &SecurityToken) -> Option<Self> {
        match token.kind() {
            TokenKind::UserName { username, .. } => Some(Self::new(ClaimType::Name, username.as_str())),
            TokenKind::SecurityContext { context_id, .. } => {
                Some(Self::new(ClaimType::SessionContext, context_id.as_str()))
            }
            TokenKind::X509 { raw_data } => Some(Self::new(
                ClaimType::X509Thumbprint,
                b64_encode(&digest(DigestAlgorithm::Sha1, raw_data)),
            )),
            TokenKind::DerivedKey { .. } | TokenKind::BinarySecret { .. } => None,
        }
    }
}

/// Claims in the order their tokens were processed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimSet {
    claims: Vec<Claim>,
}

impl ClaimSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a claim unless an equal one is present.
    pub fn add(&mut self, claim: Claim) {
        if !self.claims.contains(&claim) {
            self.claims.push(claim);
        }
    }

    pub fn contains(&self, claim: &Claim) -> bool {
        self.claims.contains(claim)
    }

    /// First claim of a type.
    pub fn find(&self, claim_type: ClaimType) -> Option<&Claim> {
        self.claims.iter().find(|c| c.claim_type == claim_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Claim> {
        self.claims.iter()
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}
