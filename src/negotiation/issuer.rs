//! Issuing side of the session token exchange.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use crate::algorithms::AlgorithmSuite;
use crate::cache::SecurityContextTokenCache;
use crate::crypto::SymmetricKey;
use crate::error::{ConfigError, Error, MessageSecurityError};
use crate::message::Message;
use crate::serializer::{malformed, SecurityContextTokenData};
use crate::standards::StandardsDriver;
use crate::tokens::{unique_context_id, unique_id, SecurityToken, TokenKind};
use crate::trust::{
    compute_combined_key, KeyEntropyMode, Lifetime, ProofToken, RequestSecurityToken,
    RequestSecurityTokenResponse, TrustDriver, WsTrustDriver,
};

const RST: &str = "RequestSecurityToken";

/// Issuer configuration.
#[derive(Debug, Clone)]
pub struct IssuerSettings {
    pub key_entropy_mode: KeyEntropyMode,
    /// Key size used when the request does not ask for one
    pub key_size_bits: usize,
    /// How long issued tokens are valid
    pub token_lifetime: Duration,
}

impl Default for IssuerSettings {
    fn default() -> Self {
        Self {
            key_entropy_mode: KeyEntropyMode::CombinedEntropy,
            key_size_bits: 256,
            token_lifetime: Duration::from_secs(36_000), // 10 hours
        }
    }
}

/// Answers RequestSecurityToken messages with freshly issued session tokens.
///
/// Every issued token is added to the shared session token cache, so a
/// responder using the same cache can resolve it on later messages.
pub struct SessionTokenIssuer {
    driver: WsTrustDriver,
    suite: AlgorithmSuite,
    settings: IssuerSettings,
    cache: Arc<SecurityContextTokenCache>,
}

impl SessionTokenIssuer {
    pub fn new(
        standards: StandardsDriver,
        suite: AlgorithmSuite,
        settings: IssuerSettings,
        cache: Arc<SecurityContextTokenCache>,
    ) -> Result<Self, ConfigError> {
        check_key_size(suite, settings.key_size_bits).map_err(|reason| ConfigError::InvalidValue {
            name: "key_size_bits",
            reason,
        })?;
        Ok(Self {
            driver: WsTrustDriver::new(standards),
            suite,
            settings,
            cache,
        })
    }

    pub fn cache(&self) -> &Arc<SecurityContextTokenCache> {
        &self.cache
    }

    /// Handle one request and build the reply.
    pub fn issue(&self, request: &Message) -> Result<Message, Error> {
        let expected = self.driver.request_action();
        let action = request.action().unwrap_or_default();
        if action != expected {
            return Err(MessageSecurityError::UnexpectedAction {
                expected,
                actual: action,
            }
            .into());
        }
        let body = request
            .payload()
            .ok_or_else(|| malformed(RST, "message body is empty"))?;
        let rst = self.driver.read_request(body)?;
        let response = self.respond(&rst)?;
        Ok(Message::new(
            request.version(),
            &self.driver.response_action(),
            self.driver.write_response(&response),
        ))
    }

    fn respond(&self, rst: &RequestSecurityToken) -> Result<RequestSecurityTokenResponse, Error> {
        let standards = self.driver.standards();
        if rst.request_type != standards.trust.issue_request_type() {
            return Err(malformed(RST, format!("unsupported request type '{}'", rst.request_type)).into());
        }
        if rst.token_type != standards.secure_conversation.token_type() {
            return Err(malformed(RST, format!("unsupported token type '{}'", rst.token_type)).into());
        }
        let key_size = rst.key_size.unwrap_or(self.settings.key_size_bits);
        check_key_size(self.suite, key_size).map_err(|reason| malformed(RST, reason))?;

        let (key, proof, issuer_entropy) = match self.settings.key_entropy_mode {
            KeyEntropyMode::RequesterEntropy => {
                let entropy = requester_entropy(rst)?;
                if entropy.bits() != key_size {
                    return Err(malformed(RST, "entropy does not match the key size").into());
                }
                (entropy.clone(), None, None)
            }
            KeyEntropyMode::ProviderEntropy => {
                let key = SymmetricKey::generate(key_size / 8);
                (key.clone(), Some(ProofToken::BinarySecret(key)), None)
            }
            KeyEntropyMode::CombinedEntropy => {
                let requester = requester_entropy(rst)?;
                let issuer = SymmetricKey::generate(key_size / 8);
                let key = compute_combined_key(requester.as_bytes(), issuer.as_bytes(), key_size);
                let proof = ProofToken::ComputedKey(standards.trust.psha1_computed_key());
                (key, Some(proof), Some(issuer))
            }
        };

        let now = Utc::now();
        let expires = now
            + chrono::Duration::from_std(self.settings.token_lifetime)
                .unwrap_or_else(|_| chrono::Duration::hours(10));
        let context_id = unique_context_id();
        let token = SecurityToken::new(
            unique_id(),
            TokenKind::SecurityContext {
                context_id: context_id.clone(),
                generation: None,
                key,
            },
        )
        .with_validity(now, Some(expires));
        let data = SecurityContextTokenData {
            id: token.id().to_string(),
            context_id: context_id.clone(),
            generation: None,
        };
        self.cache.add_context(Arc::new(token))?;

        info!(
            context_id = %context_id,
            key_size,
            entropy = ?self.settings.key_entropy_mode,
            "Issued session token"
        );
        debug!(request_context = %rst.context, "Answering token request");
        Ok(RequestSecurityTokenResponse {
            context: rst.context.clone(),
            token_type: Some(standards.secure_conversation.token_type()),
            token: Some(data),
            proof,
            entropy: issuer_entropy,
            key_size: Some(key_size),
            lifetime: Some(Lifetime {
                created: now,
                expires,
            }),
        })
    }
}

fn requester_entropy(rst: &RequestSecurityToken) -> Result<&SymmetricKey, MessageSecurityError> {
    rst.entropy
        .as_ref()
        .ok_or_else(|| malformed(RST, "requester entropy is required"))
}

fn check_key_size(suite: AlgorithmSuite, bits: usize) -> Result<(), String> {
    let caps = suite.capabilities();
    if bits % 8 != 0 || bits < caps.min_symmetric_key_length || bits > caps.max_symmetric_key_length {
        return Err(format!(
            "key size {} is outside {}..={} bits",
            bits, caps.min_symmetric_key_length, caps.max_symmetric_key_length
        ));
    }
    Ok(())
}
