//! Obtaining session tokens.
//!
//! A [`SecurityTokenProvider`] hands the protocol the token that protects
//! outgoing messages. [`SessionTokenProvider`] negotiates one with a remote
//! issuer over WS-Trust; [`StaticTokenProvider`] returns a pre-shared one.
//! [`SessionTokenIssuer`] is the issuing side of the exchange.

pub mod issuer;
pub mod provider;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{Error, MessageSecurityError};
use crate::tokens::SecurityToken;

pub use issuer::{IssuerSettings, SessionTokenIssuer};
pub use provider::{NegotiationSettings, SessionTokenProvider};

/// Where the protocol gets its session token.
#[async_trait]
pub trait SecurityTokenProvider: Send + Sync {
    /// A valid token, negotiating one if needed.
    async fn get_token(&self, timeout: Duration) -> Result<Arc<SecurityToken>, Error>;
}

/// States of a negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Created,
    Opening,
    NegotiatingRequest,
    AwaitingResponse,
    Completed,
    Faulted,
}

/// Provider for a pre-shared session token.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: Arc<SecurityToken>,
}

impl StaticTokenProvider {
    pub fn new(token: Arc<SecurityToken>) -> Self {
        Self { token }
    }
}

#[async_trait]
impl SecurityTokenProvider for StaticTokenProvider {
    async fn get_token(&self, _timeout: Duration) -> Result<Arc<SecurityToken>, Error> {
        if self.token.is_expired_at(Utc::now()) {
            return Err(MessageSecurityError::TokenExpired(self.token.id().to_string()).into());
        }
        Ok(Arc::clone(&self.token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SymmetricKey;
    use crate::tokens::security_context_token;

    #[tokio::test]
    async fn test_static_provider_returns_token() {
        let token = security_context_token("urn:uuid:static", SymmetricKey::generate(32));
        let provider = StaticTokenProvider::new(Arc::clone(&token));
        let got = provider.get_token(Duration::from_secs(1)).await.unwrap();
        assert!(Arc::ptr_eq(&got, &token));
    }

    #[tokio::test]
    async fn test_static_provider_rejects_expired_token() {
        let now = Utc::now();
        let token = security_context_token("urn:uuid:old", SymmetricKey::generate(32));
        let expired = Arc::new(
            token
                .as_ref()
                .clone()
                .with_validity(now - chrono::Duration::hours(2), Some(now - chrono::Duration::hours(1))),
        );
        let provider = StaticTokenProvider::new(expired);
        let err = provider.get_token(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(
            err.as_message_security(),
            Some(MessageSecurityError::TokenExpired(_))
        ));
    }
}
