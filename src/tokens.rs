//! Security tokens and key identifier clauses.
//!
//! A token is immutable once issued and shared as `Arc<SecurityToken>`
//! between the caches, the resolver and in-flight messages.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{b64_encode, SymmetricKey};

/// A security credential.
#[derive(Debug, Clone)]
pub struct SecurityToken {
    id: String,
    valid_from: DateTime<Utc>,
    valid_to: Option<DateTime<Utc>>,
    kind: TokenKind,
}

/// What a token is and the key material it carries.
#[derive(Clone)]
pub enum TokenKind {
    /// WS-SecureConversation session token
    SecurityContext {
        context_id: String,
        generation: Option<String>,
        key: SymmetricKey,
    },
    /// P_SHA1 key derived from a base token
    DerivedKey {
        base_id: String,
        label: String,
        nonce: Vec<u8>,
        offset: usize,
        length: usize,
        key: SymmetricKey,
    },
    /// Pre-shared symmetric key
    BinarySecret { key: SymmetricKey },
    /// X.509 certificate (raw DER bytes). Carries no symmetric key.
    X509 { raw_data: Vec<u8> },
    /// Username and password
    UserName { username: String, password: String },
}

impl fmt::Debug for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SecurityContext {
                context_id,
                generation,
                key,
            } => f
                .debug_struct("SecurityContext")
                .field("context_id", context_id)
                .field("generation", generation)
                .field("key", key)
                .finish(),
            Self::DerivedKey {
                base_id,
                offset,
                length,
                ..
            } => f
                .debug_struct("DerivedKey")
                .field("base_id", base_id)
                .field("offset", offset)
                .field("length", length)
                .finish_non_exhaustive(),
            Self::BinarySecret { key } => f.debug_struct("BinarySecret").field("key", key).finish(),
            Self::X509 { raw_data } => f
                .debug_struct("X509")
                .field("len", &raw_data.len())
                .finish(),
            Self::UserName { username, .. } => f
                .debug_struct("UserName")
                .field("username", username)
                .finish_non_exhaustive(),
        }
    }
}

impl SecurityToken {
    /// Create a token valid from now with no expiry.
    pub fn new(id: impl Into<String>, kind: TokenKind) -> Self {
        Self {
            id: id.into(),
            valid_from: Utc::now(),
            valid_to: None,
            kind,
        }
    }

    pub fn with_validity(mut self, valid_from: DateTime<Utc>, valid_to: Option<DateTime<Utc>>) -> Self {
        self.valid_from = valid_from;
        self.valid_to = valid_to;
        self
    }

    /// Same token under a different id, e.g. the id it carries in a header.
    pub fn with_id(&self, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..self.clone()
        }
    }

    /// Session token with a fresh context identifier.
    pub fn new_security_context(key: SymmetricKey) -> Self {
        Self::new(
            unique_id(),
            TokenKind::SecurityContext {
                context_id: unique_context_id(),
                generation: None,
                key,
            },
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &TokenKind {
        &self.kind
    }

    pub fn valid_from(&self) -> DateTime<Utc> {
        self.valid_from
    }

    pub fn valid_to(&self) -> Option<DateTime<Utc>> {
        self.valid_to
    }

    /// The symmetric key, for tokens that have one.
    pub fn symmetric_key(&self) -> Option<&SymmetricKey> {
        match &self.kind {
            TokenKind::SecurityContext { key, .. }
            | TokenKind::DerivedKey { key, .. }
            | TokenKind::BinarySecret { key } => Some(key),
            TokenKind::X509 { .. } | TokenKind::UserName { .. } => None,
        }
    }

    /// Context id and generation of a session token.
    pub fn context(&self) -> Option<(&str, Option<&str>)> {
        match &self.kind {
            TokenKind::SecurityContext {
                context_id,
                generation,
                ..
            } => Some((context_id, generation.as_deref())),
            _ => None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_to.is_some_and(|to| to <= now)
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_from <= now && !self.is_expired_at(now)
    }

    pub fn token_type(&self) -> TokenType {
        match &self.kind {
            TokenKind::SecurityContext { .. } => TokenType::SecureConversation,
            TokenKind::DerivedKey { .. } => TokenType::DerivedKey,
            TokenKind::BinarySecret { .. } => TokenType::BinarySecret,
            TokenKind::X509 { .. } => TokenType::X509,
            TokenKind::UserName { .. } => TokenType::UserName,
        }
    }

    /// Structural match against a clause, ignoring any derivation.
    pub fn matches_key_identifier_clause(&self, clause: &KeyIdentifierClause) -> bool {
        match (&clause.reference, &self.kind) {
            (TokenReference::LocalId(id), _) => &self.id == id,
            (
                TokenReference::SecurityContext {
                    context_id,
                    generation,
                },
                TokenKind::SecurityContext {
                    context_id: own_context,
                    generation: own_generation,
                    ..
                },
            ) => context_id == own_context && generation == own_generation,
            (TokenReference::X509RawData(raw), TokenKind::X509 { raw_data }) => raw == raw_data,
            _ => false,
        }
    }

    /// Clause referring to this token.
    pub fn create_key_identifier_clause(&self, style: ReferenceStyle) -> KeyIdentifierClause {
        match (style, &self.kind) {
            (ReferenceStyle::Internal, _) => KeyIdentifierClause::local(&self.id),
            (
                ReferenceStyle::External,
                TokenKind::SecurityContext {
                    context_id,
                    generation,
                    ..
                },
            ) => KeyIdentifierClause::security_context(context_id, generation.clone()),
            (ReferenceStyle::External, TokenKind::X509 { raw_data }) => {
                KeyIdentifierClause::x509(raw_data.clone())
            }
            (ReferenceStyle::External, _) => KeyIdentifierClause::local(&self.id),
        }
    }
}

/// Broad token category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenType {
    SecureConversation,
    DerivedKey,
    BinarySecret,
    X509,
    UserName,
}

/// How a token is referred to from the message that uses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ReferenceStyle {
    /// By the id it carries in this message
    #[default]
    Internal,
    /// By an identifier valid outside the message
    External,
}

/// When a token is written into the security header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TokenInclusion {
    Never,
    Once,
    #[default]
    AlwaysToRecipient,
    AlwaysToInitiator,
    Always,
}

/// Target token of a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenReference {
    /// `#id` reference to a token in the same message
    LocalId(String),
    /// Session token by context id and generation
    SecurityContext {
        context_id: String,
        generation: Option<String>,
    },
    /// Certificate carried by value
    X509RawData(Vec<u8>),
}

/// Implicit key derivation requested by a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Derivation {
    pub nonce: Vec<u8>,
    /// Length in bytes; `None` means the default length
    pub length: Option<usize>,
}

/// A reference used to look up a token or key rather than carry it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyIdentifierClause {
    pub reference: TokenReference,
    pub derivation: Option<Derivation>,
}

impl KeyIdentifierClause {
    pub fn local(id: impl Into<String>) -> Self {
        Self {
            reference: TokenReference::LocalId(id.into()),
            derivation: None,
        }
    }

    pub fn security_context(context_id: impl Into<String>, generation: Option<String>) -> Self {
        Self {
            reference: TokenReference::SecurityContext {
                context_id: context_id.into(),
                generation,
            },
            derivation: None,
        }
    }

    pub fn x509(raw: Vec<u8>) -> Self {
        Self {
            reference: TokenReference::X509RawData(raw),
            derivation: None,
        }
    }

    pub fn with_derivation(mut self, nonce: Vec<u8>, length: Option<usize>) -> Self {
        self.derivation = Some(Derivation { nonce, length });
        self
    }

    /// The clause without its derivation.
    pub fn base(&self) -> Self {
        Self {
            reference: self.reference.clone(),
            derivation: None,
        }
    }

    /// Whether the clause identifies the token without a message-local id.
    pub fn is_external(&self) -> bool {
        !matches!(self.reference, TokenReference::LocalId(_))
    }

    pub fn local_id(&self) -> Option<&str> {
        match &self.reference {
            TokenReference::LocalId(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for KeyIdentifierClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reference {
            TokenReference::LocalId(id) => write!(f, "#{}", id)?,
            TokenReference::SecurityContext {
                context_id,
                generation: Some(g),
            } => write!(f, "context {} generation {}", context_id, g)?,
            TokenReference::SecurityContext { context_id, .. } => write!(f, "context {}", context_id)?,
            TokenReference::X509RawData(raw) => write!(f, "X509 raw data ({} bytes)", raw.len())?,
        }
        if let Some(d) = &self.derivation {
            write!(f, " derived with nonce {}", b64_encode(&d.nonce))?;
        }
        Ok(())
    }
}

/// Requirements on a token as used by one protocol: its type, whether and
/// how it is included and referenced, and whether keys are derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityTokenParameters {
    pub token_type: TokenType,
    pub inclusion: TokenInclusion,
    pub reference_style: ReferenceStyle,
    pub require_derived_keys: bool,
}

impl SecurityTokenParameters {
    pub fn secure_conversation(require_derived_keys: bool) -> Self {
        Self {
            token_type: TokenType::SecureConversation,
            inclusion: TokenInclusion::AlwaysToRecipient,
            reference_style: ReferenceStyle::Internal,
            require_derived_keys,
        }
    }

    pub fn user_name() -> Self {
        Self {
            token_type: TokenType::UserName,
            inclusion: TokenInclusion::AlwaysToRecipient,
            reference_style: ReferenceStyle::Internal,
            require_derived_keys: false,
        }
    }

    pub fn x509() -> Self {
        Self {
            token_type: TokenType::X509,
            inclusion: TokenInclusion::AlwaysToRecipient,
            reference_style: ReferenceStyle::Internal,
            require_derived_keys: false,
        }
    }

    /// Whether a token written by `initiator` (or the responder) goes
    /// into the security header.
    pub fn should_include(&self, initiator: bool) -> bool {
        match self.inclusion {
            TokenInclusion::Never => false,
            TokenInclusion::Once | TokenInclusion::Always => true,
            TokenInclusion::AlwaysToRecipient => initiator,
            TokenInclusion::AlwaysToInitiator => !initiator,
        }
    }

    pub fn matches_token(&self, token: &SecurityToken) -> bool {
        self.token_type == token.token_type()
    }

    /// Clause matching on behalf of a token registered with these parameters.
    pub fn matches_key_identifier_clause(
        &self,
        token: &SecurityToken,
        clause: &KeyIdentifierClause,
        style: ReferenceStyle,
    ) -> bool {
        if !self.matches_token(token) {
            return false;
        }
        match &clause.reference {
            TokenReference::LocalId(_) => {
                style == ReferenceStyle::Internal && token.matches_key_identifier_clause(clause)
            }
            _ => token.matches_key_identifier_clause(clause),
        }
    }

    /// The clause a sender writes to refer to `token`.
    pub fn create_key_identifier_clause(
        &self,
        token: &SecurityToken,
        included: bool,
    ) -> KeyIdentifierClause {
        let style = if included {
            self.reference_style
        } else {
            ReferenceStyle::External
        };
        token.create_key_identifier_clause(style)
    }
}

/// A fresh message-unique id.
pub fn unique_id() -> String {
    format!("uuid-{}", Uuid::new_v4())
}

/// A fresh session context identifier.
pub fn unique_context_id() -> String {
    format!("urn:uuid:{}", Uuid::new_v4())
}

/// Convenience for building a shared session token.
pub fn security_context_token(
    context_id: impl Into<String>,
    key: SymmetricKey,
) -> Arc<SecurityToken> {
    Arc::new(SecurityToken::new(
        unique_id(),
        TokenKind::SecurityContext {
            context_id: context_id.into(),
            generation: None,
            key,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sct(context: &str) -> SecurityToken {
        SecurityToken::new(
            "sct-1",
            TokenKind::SecurityContext {
                context_id: context.to_string(),
                generation: None,
                key: SymmetricKey::new(vec![1; 32]),
            },
        )
    }

    #[test]
    fn test_security_context_clause_matching() {
        let token = sct("urn:ctx:1");
        assert!(token.matches_key_identifier_clause(&KeyIdentifierClause::security_context(
            "urn:ctx:1",
            None
        )));
        assert!(!token.matches_key_identifier_clause(&KeyIdentifierClause::security_context(
            "urn:ctx:1",
            Some("2".to_string())
        )));
        assert!(token.matches_key_identifier_clause(&KeyIdentifierClause::local("sct-1")));
    }

    #[test]
    fn test_x509_clause_matches_raw_bytes() {
        let token = SecurityToken::new("cert", TokenKind::X509 { raw_data: vec![9, 9, 9] });
        assert!(token.matches_key_identifier_clause(&KeyIdentifierClause::x509(vec![9, 9, 9])));
        assert!(!token.matches_key_identifier_clause(&KeyIdentifierClause::x509(vec![9])));
        assert!(token.symmetric_key().is_none());
    }

    #[test]
    fn test_external_clause_for_session_token() {
        let token = sct("urn:ctx:2");
        let clause = token.create_key_identifier_clause(ReferenceStyle::External);
        assert!(clause.is_external());
        assert_eq!(
            clause.reference,
            TokenReference::SecurityContext {
                context_id: "urn:ctx:2".to_string(),
                generation: None
            }
        );
    }

    #[test]
    fn test_parameters_only_match_their_token_type() {
        let token = sct("urn:ctx:3");
        let params = SecurityTokenParameters::user_name();
        assert!(!params.matches_key_identifier_clause(
            &token,
            &KeyIdentifierClause::local("sct-1"),
            ReferenceStyle::Internal
        ));
        let params = SecurityTokenParameters::secure_conversation(true);
        assert!(!params.matches_key_identifier_clause(
            &token,
            &KeyIdentifierClause::local("sct-1"),
            ReferenceStyle::External
        ));
    }

    #[test]
    fn test_inclusion_by_role() {
        let params = SecurityTokenParameters::secure_conversation(true);
        assert!(params.should_include(true));
        assert!(!params.should_include(false));
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let token = sct("urn:ctx:4").with_validity(now - Duration::minutes(1), Some(now));
        assert!(token.is_expired_at(now));
        assert!(token.is_valid_at(now - Duration::seconds(1)));
    }

    #[test]
    fn test_debug_hides_password() {
        let kind = TokenKind::UserName {
            username: "alice".to_string(),
            password: "hunter2".to_string(),
        };
        let out = format!("{:?}", kind);
        assert!(out.contains("alice"));
        assert!(!out.contains("hunter2"));
    }

    #[test]
    fn test_clause_display() {
        let clause = KeyIdentifierClause::local("dk-1").with_derivation(vec![0, 0, 0], Some(24));
        assert_eq!(clause.to_string(), "#dk-1 derived with nonce AAAA");
    }
}
