//! Requesting side of the session token exchange.
//!
//! The provider sends one RequestSecurityToken over the bootstrap binding,
//! checks the response against the request and computes the session key
//! according to the entropy mode. One negotiation runs at a time; callers
//! arriving while it is in flight wait for its result.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::algorithms::AlgorithmSuite;
use crate::channel::{BootstrapBinding, EndpointAddress, RequestChannel};
use crate::crypto::SymmetricKey;
use crate::error::{ConfigError, Error, MessageSecurityError, UsageError};
use crate::message::{Message, SoapVersion};
use crate::negotiation::{NegotiationState, SecurityTokenProvider};
use crate::serializer::malformed;
use crate::standards::StandardsDriver;
use crate::tokens::{unique_id, SecurityToken, TokenKind};
use crate::trust::{
    compute_combined_key, KeyEntropyMode, ProofToken, RequestSecurityToken,
    RequestSecurityTokenResponse, TrustDriver, WsTrustDriver,
};

const RSTR: &str = "RequestSecurityTokenResponse";

/// Negotiation parameters.
#[derive(Debug, Clone)]
pub struct NegotiationSettings {
    pub key_entropy_mode: KeyEntropyMode,
    /// Requested key size; `None` uses the suite default
    pub key_size_bits: Option<usize>,
    pub soap_version: SoapVersion,
    /// Renew the token this long before it expires
    pub renewal_margin: Duration,
}

impl Default for NegotiationSettings {
    fn default() -> Self {
        Self {
            key_entropy_mode: KeyEntropyMode::CombinedEntropy,
            key_size_bits: None,
            soap_version: SoapVersion::Soap12,
            renewal_margin: Duration::from_secs(60),
        }
    }
}

struct ProviderState {
    state: NegotiationState,
    channel: Option<Arc<dyn RequestChannel>>,
    token: Option<Arc<SecurityToken>>,
}

/// Negotiates session tokens with a remote issuer.
pub struct SessionTokenProvider {
    target: EndpointAddress,
    via: Option<EndpointAddress>,
    bootstrap: Option<BootstrapBinding>,
    driver: WsTrustDriver,
    suite: AlgorithmSuite,
    settings: NegotiationSettings,
    state: Mutex<ProviderState>,
    /// Held for the whole exchange
    in_flight: tokio::sync::Mutex<()>,
}

impl SessionTokenProvider {
    pub fn new(
        target: EndpointAddress,
        standards: StandardsDriver,
        suite: AlgorithmSuite,
        settings: NegotiationSettings,
    ) -> Self {
        Self {
            target,
            via: None,
            bootstrap: None,
            driver: WsTrustDriver::new(standards),
            suite,
            settings,
            state: Mutex::new(ProviderState {
                state: NegotiationState::Created,
                channel: None,
                token: None,
            }),
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_bootstrap(mut self, bootstrap: BootstrapBinding) -> Self {
        self.bootstrap = Some(bootstrap);
        self
    }

    pub fn with_via(mut self, via: EndpointAddress) -> Self {
        self.via = Some(via);
        self
    }

    pub fn state(&self) -> NegotiationState {
        self.state.lock().state
    }

    fn key_size_bits(&self) -> usize {
        self.settings
            .key_size_bits
            .unwrap_or(self.suite.capabilities().default_symmetric_key_length)
    }

    fn set_state(&self, state: NegotiationState) {
        self.state.lock().state = state;
    }

    /// Validate the configuration and open the bootstrap channel.
    pub async fn open(&self, timeout: Duration) -> Result<(), Error> {
        {
            let state = self.state.lock();
            if state.state != NegotiationState::Created {
                return Err(UsageError::InvalidState {
                    object: "session token provider",
                    state: format!("{:?}", state.state),
                }
                .into());
            }
        }
        let bootstrap = self.bootstrap.as_ref().ok_or(ConfigError::MissingBootstrapBinding)?;
        let key_size = self.key_size_bits();
        let caps = self.suite.capabilities();
        if key_size % 8 != 0
            || key_size < caps.min_symmetric_key_length
            || key_size > caps.max_symmetric_key_length
        {
            return Err(ConfigError::InvalidValue {
                name: "key_size_bits",
                reason: format!("{} is not allowed by {:?}", key_size, self.suite),
            }
            .into());
        }
        self.set_state(NegotiationState::Opening);

        let created = tokio::time::timeout(
            timeout,
            bootstrap
                .channel_factory
                .create_channel(&self.target, self.via.as_ref(), timeout),
        )
        .await;
        let channel = match created {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => {
                self.set_state(NegotiationState::Faulted);
                return Err(e);
            }
            Err(_) => {
                self.set_state(NegotiationState::Faulted);
                return Err(Error::Timeout(timeout));
            }
        };
        self.state.lock().channel = Some(channel);
        debug!(target = %self.target, "Opened negotiation channel");
        Ok(())
    }

    /// Close the bootstrap channel.
    pub async fn close(&self, timeout: Duration) -> Result<(), Error> {
        let channel = self.state.lock().channel.take();
        if let Some(channel) = channel {
            tokio::time::timeout(timeout, channel.close(timeout))
                .await
                .map_err(|_| Error::Timeout(timeout))??;
        }
        Ok(())
    }

    /// The negotiated token.
    pub fn issued_token(&self) -> Result<Arc<SecurityToken>, UsageError> {
        let state = self.state.lock();
        match (&state.token, state.state) {
            (Some(token), NegotiationState::Completed) => Ok(Arc::clone(token)),
            _ => Err(UsageError::NegotiationNotCompleted),
        }
    }

    fn complete(&self, token: Arc<SecurityToken>) -> Result<(), UsageError> {
        let mut state = self.state.lock();
        if state.state == NegotiationState::Completed {
            return Err(UsageError::NegotiationAlreadyCompleted);
        }
        state.token = Some(token);
        state.state = NegotiationState::Completed;
        Ok(())
    }

    fn usable_token(&self) -> Option<Arc<SecurityToken>> {
        let state = self.state.lock();
        let token = state.token.as_ref()?;
        let margin = chrono::Duration::from_std(self.settings.renewal_margin).unwrap_or_else(|_| chrono::Duration::zero());
        match token.valid_to() {
            Some(valid_to) if valid_to - margin <= Utc::now() => None,
            _ => Some(Arc::clone(token)),
        }
    }

    /// Run one exchange. The caller holds `in_flight`.
    async fn negotiate(&self, timeout: Duration) -> Result<Arc<SecurityToken>, Error> {
        let (channel, restart) = {
            let mut state = self.state.lock();
            let channel = state.channel.clone().ok_or(UsageError::NotOpen("session token provider"))?;
            let restart = state.state == NegotiationState::Completed;
            if restart {
                // Renewal starts a fresh exchange.
                state.token = None;
            }
            state.state = NegotiationState::NegotiatingRequest;
            (channel, restart)
        };
        if restart {
            debug!(target = %self.target, "Renewing session token");
        }

        let key_size = self.key_size_bits();
        let requester_entropy = self
            .settings
            .key_entropy_mode
            .requester_contributes()
            .then(|| SymmetricKey::generate(key_size / 8));
        let standards = self.driver.standards();
        let request = RequestSecurityToken {
            context: unique_id(),
            token_type: standards.secure_conversation.token_type(),
            request_type: standards.trust.issue_request_type(),
            key_size: Some(key_size),
            entropy: requester_entropy.clone(),
        };
        let mut message = Message::new(
            self.settings.soap_version,
            &self.driver.request_action(),
            self.driver.write_request(&request),
        );
        message.set_to(self.target.uri());

        let protocol = self.bootstrap.as_ref().and_then(|b| b.protocol.clone());
        let (message, correlation) = match &protocol {
            Some(protocol) => {
                let (secured, correlation) = protocol.secure_outgoing_message(message, timeout).await?;
                (secured, Some(correlation))
            }
            None => (message, None),
        };

        self.set_state(NegotiationState::AwaitingResponse);
        debug!(target = %self.target, context = %request.context, "Sent token request");
        let reply = tokio::time::timeout(timeout, channel.request(message, timeout))
            .await
            .map_err(|_| Error::Timeout(timeout))??;
        let reply = match &protocol {
            Some(protocol) => protocol.verify_incoming_message(reply, correlation.as_ref())?.message,
            None => reply,
        };

        let token = self.process_response(&request, requester_entropy.as_ref(), &reply)?;
        self.complete(Arc::clone(&token))?;
        info!(
            target = %self.target,
            context_id = token.context().map(|(c, _)| c).unwrap_or(""),
            "Negotiated session token"
        );
        Ok(token)
    }

    fn process_response(
        &self,
        request: &RequestSecurityToken,
        requester_entropy: Option<&SymmetricKey>,
        reply: &Message,
    ) -> Result<Arc<SecurityToken>, MessageSecurityError> {
        let expected = self.driver.response_action();
        let action = reply.action().unwrap_or_default();
        if action != expected {
            return Err(MessageSecurityError::UnexpectedAction {
                expected,
                actual: action,
            });
        }
        let body = reply
            .payload()
            .ok_or_else(|| malformed(RSTR, "message body is empty"))?;
        let mut responses = self.driver.read_responses(body)?;
        let response = match responses.len() {
            0 => return Err(MessageSecurityError::MissingResponse),
            1 => responses.remove(0),
            n => return Err(MessageSecurityError::AmbiguousResponseCollection(n)),
        };
        if response.context != request.context {
            return Err(MessageSecurityError::ContextMismatch {
                expected: request.context.clone(),
                actual: response.context,
            });
        }
        self.build_token(request, requester_entropy, response)
    }

    fn build_token(
        &self,
        request: &RequestSecurityToken,
        requester_entropy: Option<&SymmetricKey>,
        response: RequestSecurityTokenResponse,
    ) -> Result<Arc<SecurityToken>, MessageSecurityError> {
        let data = response
            .token
            .ok_or_else(|| malformed(RSTR, "missing RequestedSecurityToken"))?;
        // The requested size was checked against the suite at open; the
        // issuer may echo it but not change it.
        let key_size = request.key_size.unwrap_or_else(|| self.key_size_bits());
        if let Some(issued) = response.key_size {
            if issued != key_size {
                warn!(expected = key_size, actual = issued, "Issuer changed the key size");
                return Err(malformed(
                    RSTR,
                    format!("KeySize {} does not match the requested {}", issued, key_size),
                ));
            }
        }

        let key = match (self.settings.key_entropy_mode, response.proof) {
            (KeyEntropyMode::RequesterEntropy, None) => requester_entropy
                .cloned()
                .ok_or_else(|| malformed(RSTR, "no requester entropy was sent"))?,
            (KeyEntropyMode::ProviderEntropy, Some(ProofToken::BinarySecret(key))) => key,
            (KeyEntropyMode::CombinedEntropy, Some(ProofToken::ComputedKey(algorithm))) => {
                if algorithm != self.driver.standards().trust.psha1_computed_key() {
                    return Err(MessageSecurityError::UnsupportedAlgorithm(algorithm));
                }
                let requester =
                    requester_entropy.ok_or_else(|| malformed(RSTR, "no requester entropy was sent"))?;
                let issuer = response
                    .entropy
                    .ok_or_else(|| malformed(RSTR, "missing issuer entropy"))?;
                compute_combined_key(requester.as_bytes(), issuer.as_bytes(), key_size)
            }
            (mode, _) => {
                return Err(malformed(
                    RSTR,
                    format!("proof token does not fit entropy mode {:?}", mode),
                ))
            }
        };
        if key.bits() != key_size {
            warn!(expected = key_size, actual = key.bits(), "Issued key has the wrong size");
            return Err(malformed(RSTR, "issued key does not match the key size"));
        }

        let mut token = SecurityToken::new(
            data.id,
            TokenKind::SecurityContext {
                context_id: data.context_id,
                generation: data.generation,
                key,
            },
        );
        if let Some(lifetime) = response.lifetime {
            token = token.with_validity(lifetime.created, Some(lifetime.expires));
        }
        Ok(Arc::new(token))
    }
}

#[async_trait]
impl SecurityTokenProvider for SessionTokenProvider {
    async fn get_token(&self, timeout: Duration) -> Result<Arc<SecurityToken>, Error> {
        if let Some(token) = self.usable_token() {
            return Ok(token);
        }
        let _guard = tokio::time::timeout(timeout, self.in_flight.lock())
            .await
            .map_err(|_| Error::Timeout(timeout))?;
        // Another caller may have finished negotiating while we waited.
        if let Some(token) = self.usable_token() {
            return Ok(token);
        }
        match self.negotiate(timeout).await {
            Ok(token) => Ok(token),
            Err(e) => {
                self.set_state(NegotiationState::Faulted);
                warn!(target = %self.target, error = %e, "Session token negotiation failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SecurityContextTokenCache;
    use crate::channel::RequestChannelFactory;
    use crate::negotiation::{IssuerSettings, SessionTokenIssuer};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers requests with a fixed function of the request.
    struct Loopback<F> {
        respond: F,
        requests: AtomicUsize,
    }

    #[async_trait]
    impl<F> RequestChannel for Loopback<F>
    where
        F: Fn(Message) -> Result<Message, Error> + Send + Sync,
    {
        async fn request(&self, message: Message, _timeout: Duration) -> Result<Message, Error> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            // Go through the wire form like a real transport.
            let message = Message::from_xml(&message.to_xml())?;
            (self.respond)(message)
        }

        async fn close(&self, _timeout: Duration) -> Result<(), Error> {
            Ok(())
        }
    }

    struct Factory(Arc<dyn RequestChannel>);

    #[async_trait]
    impl RequestChannelFactory for Factory {
        async fn create_channel(
            &self,
            _to: &EndpointAddress,
            _via: Option<&EndpointAddress>,
            _timeout: Duration,
        ) -> Result<Arc<dyn RequestChannel>, Error> {
            Ok(Arc::clone(&self.0))
        }
    }

    fn provider_with<F>(mode: KeyEntropyMode, respond: F) -> (SessionTokenProvider, Arc<Loopback<F>>)
    where
        F: Fn(Message) -> Result<Message, Error> + Send + Sync + 'static,
    {
        let channel = Arc::new(Loopback {
            respond,
            requests: AtomicUsize::new(0),
        });
        let settings = NegotiationSettings {
            key_entropy_mode: mode,
            ..Default::default()
        };
        let provider = SessionTokenProvider::new(
            EndpointAddress::new("urn:service"),
            StandardsDriver::default(),
            AlgorithmSuite::Basic256,
            settings,
        )
        .with_bootstrap(BootstrapBinding::new(Arc::new(Factory(channel.clone()))));
        (provider, channel)
    }

    fn issuer(mode: KeyEntropyMode) -> Arc<SessionTokenIssuer> {
        let settings = IssuerSettings {
            key_entropy_mode: mode,
            ..Default::default()
        };
        let cache = Arc::new(SecurityContextTokenCache::new(
            100,
            Duration::from_secs(60),
            Duration::from_secs(3600),
        ));
        Arc::new(
            SessionTokenIssuer::new(StandardsDriver::default(), AlgorithmSuite::Basic256, settings, cache)
                .unwrap(),
        )
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    // --- Exchange ---

    #[tokio::test]
    async fn test_combined_entropy_negotiation() {
        let issuer = issuer(KeyEntropyMode::CombinedEntropy);
        let server = Arc::clone(&issuer);
        let (provider, channel) =
            provider_with(KeyEntropyMode::CombinedEntropy, move |m| server.issue(&m));
        provider.open(TIMEOUT).await.unwrap();

        let token = provider.get_token(TIMEOUT).await.unwrap();
        assert_eq!(provider.state(), NegotiationState::Completed);
        assert_eq!(token.symmetric_key().unwrap().len(), 32);

        let (context_id, _) = token.context().unwrap();
        let issued = issuer.cache().get_context(context_id, None).unwrap();
        assert_eq!(issued.symmetric_key(), token.symmetric_key());

        // Cached until it nears expiry.
        provider.get_token(TIMEOUT).await.unwrap();
        assert_eq!(channel.requests.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&provider.issued_token().unwrap(), &token));
    }

    #[tokio::test]
    async fn test_provider_entropy_negotiation() {
        let issuer = issuer(KeyEntropyMode::ProviderEntropy);
        let (provider, _) =
            provider_with(KeyEntropyMode::ProviderEntropy, move |m| issuer.issue(&m));
        provider.open(TIMEOUT).await.unwrap();
        let token = provider.get_token(TIMEOUT).await.unwrap();
        assert_eq!(token.symmetric_key().unwrap().bits(), 256);
    }

    // --- Rejections ---

    #[tokio::test]
    async fn test_open_requires_bootstrap() {
        let provider = SessionTokenProvider::new(
            EndpointAddress::new("urn:service"),
            StandardsDriver::default(),
            AlgorithmSuite::Basic256,
            NegotiationSettings::default(),
        );
        let err = provider.open(TIMEOUT).await.unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::MissingBootstrapBinding)));
    }

    #[tokio::test]
    async fn test_issued_token_before_negotiation() {
        let (provider, _) = provider_with(KeyEntropyMode::CombinedEntropy, |m| Ok(m));
        assert_eq!(
            provider.issued_token().unwrap_err(),
            UsageError::NegotiationNotCompleted
        );
    }

    #[tokio::test]
    async fn test_context_mismatch_rejected() {
        let issuer = issuer(KeyEntropyMode::CombinedEntropy);
        let (provider, _) = provider_with(KeyEntropyMode::CombinedEntropy, move |m| {
            let xml = issuer.issue(&m)?.to_xml();
            let context = m.payload().and_then(|p| p.attr("Context")).unwrap_or_default().to_string();
            Message::from_xml(&xml.replace(&context, "uuid-forged"))
        });
        provider.open(TIMEOUT).await.unwrap();
        let err = provider.get_token(TIMEOUT).await.unwrap_err();
        assert!(matches!(
            err.as_message_security(),
            Some(MessageSecurityError::ContextMismatch { .. })
        ));
        assert_eq!(provider.state(), NegotiationState::Faulted);
    }

    #[tokio::test]
    async fn test_issuer_cannot_change_key_size() {
        let issuer = issuer(KeyEntropyMode::CombinedEntropy);
        let (provider, _) = provider_with(KeyEntropyMode::CombinedEntropy, move |m| {
            let xml = issuer.issue(&m)?.to_xml();
            assert!(xml.contains("KeySize>256<"));
            Message::from_xml(&xml.replace("KeySize>256<", "KeySize>64<"))
        });
        provider.open(TIMEOUT).await.unwrap();
        let err = provider.get_token(TIMEOUT).await.unwrap_err();
        assert!(matches!(
            err.as_message_security(),
            Some(MessageSecurityError::Malformed { reason, .. }) if reason.contains("KeySize 64")
        ));
        assert_eq!(provider.state(), NegotiationState::Faulted);
    }

    #[tokio::test]
    async fn test_short_issued_key_rejected() {
        let cache = Arc::new(SecurityContextTokenCache::new(
            100,
            Duration::from_secs(60),
            Duration::from_secs(3600),
        ));
        let settings = IssuerSettings {
            key_entropy_mode: KeyEntropyMode::ProviderEntropy,
            ..Default::default()
        };
        let lenient = SessionTokenIssuer::new(StandardsDriver::default(), AlgorithmSuite::Basic128, settings, cache)
            .unwrap();
        let (provider, _) = provider_with(KeyEntropyMode::ProviderEntropy, move |m| {
            // Issue a 128 bit key while still claiming the requested size.
            let request = Message::from_xml(&m.to_xml().replace("KeySize>256<", "KeySize>128<"))?;
            let xml = lenient.issue(&request)?.to_xml();
            Message::from_xml(&xml.replace("KeySize>128<", "KeySize>256<"))
        });
        provider.open(TIMEOUT).await.unwrap();
        let err = provider.get_token(TIMEOUT).await.unwrap_err();
        assert!(matches!(
            err.as_message_security(),
            Some(MessageSecurityError::Malformed { reason, .. })
                if reason == "issued key does not match the key size"
        ));
    }

    #[tokio::test]
    async fn test_empty_response_collection_rejected() {
        let issuer = issuer(KeyEntropyMode::CombinedEntropy);
        let (provider, _) = provider_with(KeyEntropyMode::CombinedEntropy, move |m| {
            let reply = issuer.issue(&m)?;
            let mut collection = reply.payload().cloned().unwrap();
            collection.children.clear();
            Ok(Message::new(reply.version(), &reply.action().unwrap_or_default(), collection))
        });
        provider.open(TIMEOUT).await.unwrap();
        let err = provider.get_token(TIMEOUT).await.unwrap_err();
        assert_eq!(err.as_message_security(), Some(&MessageSecurityError::MissingResponse));
        assert_eq!(provider.state(), NegotiationState::Faulted);
    }

    #[tokio::test]
    async fn test_unexpected_action_rejected() {
        let (provider, _) = provider_with(KeyEntropyMode::CombinedEntropy, |mut m| {
            m.set_action("urn:echo");
            Ok(m)
        });
        provider.open(TIMEOUT).await.unwrap();
        let err = provider.get_token(TIMEOUT).await.unwrap_err();
        assert!(matches!(
            err.as_message_security(),
            Some(MessageSecurityError::UnexpectedAction { .. })
        ));
    }

    #[tokio::test]
    async fn test_request_timeout() {
        struct Silent;

        #[async_trait]
        impl RequestChannel for Silent {
            async fn request(&self, _message: Message, _timeout: Duration) -> Result<Message, Error> {
                std::future::pending().await
            }

            async fn close(&self, _timeout: Duration) -> Result<(), Error> {
                Ok(())
            }
        }

        let provider = SessionTokenProvider::new(
            EndpointAddress::new("urn:service"),
            StandardsDriver::default(),
            AlgorithmSuite::Basic256,
            NegotiationSettings::default(),
        )
        .with_bootstrap(BootstrapBinding::new(Arc::new(Factory(Arc::new(Silent)))));
        provider.open(TIMEOUT).await.unwrap();
        let err = provider.get_token(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }
}
