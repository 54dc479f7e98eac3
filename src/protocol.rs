//! Security protocol factory and per-channel protocol.
//!
//! The factory carries everything shared by the messages of one binding:
//! settings, the nonce cache, the session token cache and the token
//! provider. It is configured, opened once, and then hands out
//! [`SecurityProtocol`] instances whose entry points may be called
//! concurrently.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::algorithms::AlgorithmSuite;
use crate::cache::{InMemoryNonceCache, NonceCache, SecurityContextTokenCache};
use crate::channel::EndpointAddress;
use crate::credentials::CredentialStore;
use crate::error::{ConfigError, Error, MessageSecurityError, UsageError};
use crate::header::{
    MessageProtectionOrder, ProcessedMessage, ReceiveSecurityHeader, SecurityHeaderLayout,
    SecurityMessageProperty, SendSecurityHeader, SignatureConfirmations, SupportingToken,
    SupportingTokenAttachment,
};
use crate::message::Message;
use crate::negotiation::SecurityTokenProvider;
use crate::parts::{MessagePartSpecification, ScopedMessagePartSpecification};
use crate::resolver::{ResolverLimits, TokenLookup};
use crate::xml::DEFAULT_MAX_DEPTH;
use crate::serializer::PasswordType;
use crate::standards::StandardsDriver;
use crate::tokens::{SecurityToken, SecurityTokenParameters};

const FACTORY: &str = "security protocol factory";

/// How messages are protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ProtocolVariant {
    /// Signed and encrypted with keys from a negotiated session token
    #[default]
    SymmetricSessionKey,
    /// The transport protects the message; the header carries a timestamp
    /// and basic supporting tokens only
    TransportSecured,
}

impl ProtocolVariant {
    pub fn supports_replay_detection(&self) -> bool {
        matches!(self, Self::SymmetricSessionKey)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SymmetricSessionKey => "symmetric session key",
            Self::TransportSecured => "transport secured",
        }
    }
}

/// Lifecycle of a protocol factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommunicationState {
    Created,
    Opening,
    Opened,
    Closing,
    Closed,
    Aborted,
}

/// Message protection settings.
#[derive(Debug, Clone)]
pub struct ProtocolSettings {
    pub protection_order: MessageProtectionOrder,
    pub layout: SecurityHeaderLayout,
    pub include_timestamp: bool,
    pub timestamp_validity: Duration,
    pub detect_replays: bool,
    /// `None` is infinite
    pub max_clock_skew: Option<Duration>,
    /// `None` is infinite
    pub replay_window: Option<Duration>,
    pub max_cached_nonces: usize,
    pub require_derived_keys: bool,
    pub require_signature_confirmation: bool,
    pub encrypt_signature: bool,
    pub signature_parts: ScopedMessagePartSpecification,
    pub encryption_parts: ScopedMessagePartSpecification,
    pub limits: ResolverLimits,
    pub max_message_size: usize,
    /// Deepest element nesting accepted in an incoming envelope
    pub max_depth: usize,
    pub password_type: PasswordType,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            protection_order: MessageProtectionOrder::SignBeforeEncrypt,
            layout: SecurityHeaderLayout::Strict,
            include_timestamp: true,
            timestamp_validity: Duration::from_secs(300),
            detect_replays: true,
            max_clock_skew: Some(Duration::from_secs(300)),
            replay_window: Some(Duration::from_secs(300)),
            max_cached_nonces: 900_000,
            require_derived_keys: true,
            require_signature_confirmation: false,
            encrypt_signature: false,
            signature_parts: ScopedMessagePartSpecification::body_for_all_actions(),
            encryption_parts: ScopedMessagePartSpecification::body_for_all_actions(),
            limits: ResolverLimits::default(),
            max_message_size: 1_048_576, // 1MB
            max_depth: DEFAULT_MAX_DEPTH,
            password_type: PasswordType::PasswordDigest,
        }
    }
}

/// Everything a protocol needs, frozen when the factory opens.
struct FactoryShared {
    variant: ProtocolVariant,
    standards: StandardsDriver,
    suite: AlgorithmSuite,
    settings: ProtocolSettings,
    nonce_cache: Option<Arc<dyn NonceCache>>,
    token_cache: Option<Arc<SecurityContextTokenCache>>,
    token_lookup: Option<Arc<dyn TokenLookup>>,
    token_provider: Option<Arc<dyn SecurityTokenProvider>>,
    credential_store: Option<Arc<dyn CredentialStore>>,
    supporting_tokens: Vec<SupportingToken>,
}

impl FactoryShared {
    fn new(variant: ProtocolVariant) -> Self {
        Self {
            variant,
            standards: StandardsDriver::default(),
            suite: AlgorithmSuite::default(),
            settings: ProtocolSettings::default(),
            nonce_cache: None,
            token_cache: None,
            token_lookup: None,
            token_provider: None,
            credential_store: None,
            supporting_tokens: Vec::new(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.settings;
        if s.detect_replays {
            if !self.variant.supports_replay_detection() {
                return Err(ConfigError::ReplayDetectionNotSupported(self.variant.name()));
            }
            if s.max_clock_skew.is_none() {
                return Err(ConfigError::InfiniteWindow("max_clock_skew"));
            }
            if s.replay_window.is_none() {
                return Err(ConfigError::InfiniteWindow("replay_window"));
            }
            if s.max_cached_nonces == 0 && self.nonce_cache.is_none() {
                return Err(ConfigError::InvalidValue {
                    name: "max_cached_nonces",
                    reason: "must be positive when replay detection is enabled".to_string(),
                });
            }
        }
        if s.include_timestamp && s.timestamp_validity.is_zero() {
            return Err(ConfigError::InvalidValue {
                name: "timestamp_validity",
                reason: "must be positive".to_string(),
            });
        }
        if s.max_message_size == 0 {
            return Err(ConfigError::InvalidValue {
                name: "max_message_size",
                reason: "must be positive".to_string(),
            });
        }
        if s.max_depth == 0 {
            return Err(ConfigError::InvalidValue {
                name: "max_depth",
                reason: "must be positive".to_string(),
            });
        }

        let security = self.standards.security;
        if s.require_signature_confirmation && !security.supports_signature_confirmation() {
            return Err(ConfigError::UnsupportedByVersion {
                feature: "signature confirmation",
                version: "WS-Security 1.1",
            });
        }
        let encrypts_headers = !s.encryption_parts.channel_parts().headers.is_empty()
            || s.encryption_parts
                .actions()
                .any(|a| !s.encryption_parts.parts_for(Some(a)).headers.is_empty());
        if encrypts_headers && !security.supports_encrypted_headers() {
            return Err(ConfigError::UnsupportedByVersion {
                feature: "header encryption",
                version: "WS-Security 1.1",
            });
        }
        if s.encrypt_signature && s.protection_order == MessageProtectionOrder::EncryptBeforeSign {
            return Err(ConfigError::InvalidValue {
                name: "encrypt_signature",
                reason: "only applies when signing before encrypting".to_string(),
            });
        }

        match self.variant {
            ProtocolVariant::SymmetricSessionKey => {
                if self.token_provider.is_none()
                    && self.token_lookup.is_none()
                    && self.token_cache.is_none()
                {
                    return Err(ConfigError::MissingTokenProvider);
                }
            }
            ProtocolVariant::TransportSecured => {
                if s.require_signature_confirmation {
                    return Err(ConfigError::InvalidValue {
                        name: "require_signature_confirmation",
                        reason: "the transport secured variant does not sign messages".to_string(),
                    });
                }
                if self
                    .supporting_tokens
                    .iter()
                    .any(|t| t.attachment != SupportingTokenAttachment::Basic || t.encrypt)
                {
                    return Err(ConfigError::InvalidValue {
                        name: "supporting_tokens",
                        reason: "the transport secured variant only carries basic tokens".to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Nonces must outlive the replay window plus skew on both sides.
    fn default_nonce_cache(&self) -> Option<Arc<dyn NonceCache>> {
        let s = &self.settings;
        match (s.detect_replays, s.replay_window, s.max_clock_skew) {
            (true, Some(window), Some(skew)) => Some(Arc::new(InMemoryNonceCache::new(
                window + skew * 2,
                s.max_cached_nonces,
            ))),
            _ => None,
        }
    }
}

/// Builds [`SecurityProtocol`]s for one binding.
pub struct SecurityProtocolFactory {
    pending: Option<FactoryShared>,
    opened: Option<Arc<FactoryShared>>,
    state: CommunicationState,
}

impl SecurityProtocolFactory {
    pub fn new(variant: ProtocolVariant) -> Self {
        Self {
            pending: Some(FactoryShared::new(variant)),
            opened: None,
            state: CommunicationState::Created,
        }
    }

    pub fn state(&self) -> CommunicationState {
        self.state
    }

    fn config_mut(&mut self) -> Result<&mut FactoryShared, UsageError> {
        match (&mut self.pending, self.state) {
            (Some(pending), CommunicationState::Created) => Ok(pending),
            _ => Err(UsageError::ObjectImmutable(FACTORY)),
        }
    }

    fn config(&self) -> Option<&FactoryShared> {
        self.opened.as_deref().or(self.pending.as_ref())
    }

    pub fn variant(&self) -> Option<ProtocolVariant> {
        self.config().map(|c| c.variant)
    }

    pub fn settings(&self) -> Option<&ProtocolSettings> {
        self.config().map(|c| &c.settings)
    }

    pub fn set_settings(&mut self, settings: ProtocolSettings) -> Result<(), UsageError> {
        self.config_mut()?.settings = settings;
        Ok(())
    }

    pub fn set_standards(&mut self, standards: StandardsDriver) -> Result<(), UsageError> {
        self.config_mut()?.standards = standards;
        Ok(())
    }

    pub fn set_algorithm_suite(&mut self, suite: AlgorithmSuite) -> Result<(), UsageError> {
        self.config_mut()?.suite = suite;
        Ok(())
    }

    /// Use this nonce cache instead of the default in-memory one.
    pub fn set_nonce_cache(&mut self, cache: Arc<dyn NonceCache>) -> Result<(), UsageError> {
        self.config_mut()?.nonce_cache = Some(cache);
        Ok(())
    }

    /// Session tokens a responder accepts.
    pub fn set_token_cache(&mut self, cache: Arc<SecurityContextTokenCache>) -> Result<(), UsageError> {
        self.config_mut()?.token_cache = Some(cache);
        Ok(())
    }

    /// Session tokens a responder accepts, from a source other than the cache.
    pub fn set_token_lookup(&mut self, lookup: Arc<dyn TokenLookup>) -> Result<(), UsageError> {
        self.config_mut()?.token_lookup = Some(lookup);
        Ok(())
    }

    /// Where an initiator gets its session token.
    pub fn set_token_provider(
        &mut self,
        provider: Arc<dyn SecurityTokenProvider>,
    ) -> Result<(), UsageError> {
        self.config_mut()?.token_provider = Some(provider);
        Ok(())
    }

    pub fn set_credential_store(&mut self, store: Arc<dyn CredentialStore>) -> Result<(), UsageError> {
        self.config_mut()?.credential_store = Some(store);
        Ok(())
    }

    /// Token sent with every outgoing request.
    pub fn add_supporting_token(&mut self, token: SupportingToken) -> Result<(), UsageError> {
        self.config_mut()?.supporting_tokens.push(token);
        Ok(())
    }

    pub fn token_cache(&self) -> Option<&Arc<SecurityContextTokenCache>> {
        self.config().and_then(|c| c.token_cache.as_ref())
    }

    pub fn nonce_cache(&self) -> Option<&Arc<dyn NonceCache>> {
        self.config().and_then(|c| c.nonce_cache.as_ref())
    }

    /// Validate the configuration and freeze it.
    pub fn open(&mut self) -> Result<(), Error> {
        if self.state != CommunicationState::Created {
            return Err(UsageError::InvalidState {
                object: FACTORY,
                state: format!("{:?}", self.state),
            }
            .into());
        }
        self.state = CommunicationState::Opening;
        let Some(mut config) = self.pending.take() else {
            self.state = CommunicationState::Aborted;
            return Err(UsageError::NotOpen(FACTORY).into());
        };
        if let Err(e) = config.validate() {
            warn!(variant = config.variant.name(), error = %e, "Security protocol factory failed to open");
            self.pending = Some(config);
            self.state = CommunicationState::Aborted;
            return Err(e.into());
        }
        if config.nonce_cache.is_none() {
            config.nonce_cache = config.default_nonce_cache();
        }

        info!(
            variant = config.variant.name(),
            suite = ?config.suite,
            security = config.standards.security.name(),
            detect_replays = config.settings.detect_replays,
            order = ?config.settings.protection_order,
            "Security protocol factory opened"
        );
        self.opened = Some(Arc::new(config));
        self.state = CommunicationState::Opened;
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), UsageError> {
        match self.state {
            CommunicationState::Opened => {
                self.state = CommunicationState::Closing;
                if let Some(cache) = self.token_cache() {
                    debug!(tokens = cache.len(), "Closing with cached session tokens");
                }
                self.state = CommunicationState::Closed;
                info!("Security protocol factory closed");
                Ok(())
            }
            CommunicationState::Closed => Ok(()),
            state => Err(UsageError::InvalidState {
                object: FACTORY,
                state: format!("{:?}", state),
            }),
        }
    }

    pub fn abort(&mut self) {
        self.state = CommunicationState::Aborted;
    }

    /// Protocol for messages to `target`.
    pub fn create_security_protocol(
        &self,
        target: EndpointAddress,
        via: Option<EndpointAddress>,
    ) -> Result<Arc<SecurityProtocol>, Error> {
        if self.state != CommunicationState::Opened {
            return Err(UsageError::NotOpen(FACTORY).into());
        }
        let shared = self
            .opened
            .clone()
            .ok_or_else(|| ConfigError::ProtocolCreationFailed(target.to_string()))?;
        debug!(target = %target, "Created security protocol");
        Ok(Arc::new(SecurityProtocol {
            shared,
            target,
            via,
            messages_secured: AtomicU64::new(0),
            messages_verified: AtomicU64::new(0),
            messages_rejected: AtomicU64::new(0),
        }))
    }
}

impl fmt::Debug for SecurityProtocolFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityProtocolFactory")
            .field("state", &self.state)
            .field("variant", &self.variant())
            .finish_non_exhaustive()
    }
}

/// What an initiator keeps from a request to check the reply against.
#[derive(Debug, Clone)]
pub struct CorrelationState {
    token: Option<Arc<SecurityToken>>,
    signature_values: Vec<Vec<u8>>,
}

impl CorrelationState {
    /// Session token the request was protected with.
    pub fn token(&self) -> Option<&Arc<SecurityToken>> {
        self.token.as_ref()
    }

    /// Request signature values the reply must confirm.
    pub fn signature_values(&self) -> &[Vec<u8>] {
        &self.signature_values
    }
}

/// Message counters of one protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtocolMetrics {
    pub messages_secured: u64,
    pub messages_verified: u64,
    pub messages_rejected: u64,
}

/// Secures and verifies the messages of one channel.
pub struct SecurityProtocol {
    shared: Arc<FactoryShared>,
    target: EndpointAddress,
    via: Option<EndpointAddress>,
    messages_secured: AtomicU64,
    messages_verified: AtomicU64,
    messages_rejected: AtomicU64,
}

impl SecurityProtocol {
    pub fn target(&self) -> &EndpointAddress {
        &self.target
    }

    pub fn via(&self) -> Option<&EndpointAddress> {
        self.via.as_ref()
    }

    pub fn variant(&self) -> ProtocolVariant {
        self.shared.variant
    }

    pub fn metrics(&self) -> ProtocolMetrics {
        ProtocolMetrics {
            messages_secured: self.messages_secured.load(Ordering::Relaxed),
            messages_verified: self.messages_verified.load(Ordering::Relaxed),
            messages_rejected: self.messages_rejected.load(Ordering::Relaxed),
        }
    }

    /// Secure a request. The returned state checks the reply.
    pub async fn secure_outgoing_message(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<(Message, CorrelationState), Error> {
        match self.secure_request(message, timeout).await {
            Ok(secured) => {
                self.messages_secured.fetch_add(1, Ordering::Relaxed);
                Ok(secured)
            }
            Err(e) => Err(self.outgoing_failure(e)),
        }
    }

    /// Secure a reply to a verified request.
    pub fn secure_outgoing_reply(
        &self,
        message: Message,
        request: &SecurityMessageProperty,
    ) -> Result<Message, Error> {
        match self.secure_reply(message, request) {
            Ok(secured) => {
                self.messages_secured.fetch_add(1, Ordering::Relaxed);
                Ok(secured)
            }
            Err(e) => Err(self.outgoing_failure(e)),
        }
    }

    /// Verify an incoming message. Initiators pass the state kept from the
    /// request; responders pass `None`.
    pub fn verify_incoming_message(
        &self,
        message: Message,
        correlation: Option<&CorrelationState>,
    ) -> Result<ProcessedMessage, Error> {
        match self.verify(message, correlation) {
            Ok(processed) => {
                self.messages_verified.fetch_add(1, Ordering::Relaxed);
                Ok(processed)
            }
            Err(e) => Err(self.incoming_failure(e)),
        }
    }

    /// Parse and verify a serialized envelope.
    pub fn verify_incoming_xml(
        &self,
        xml: &str,
        correlation: Option<&CorrelationState>,
    ) -> Result<ProcessedMessage, Error> {
        let max = self.shared.settings.max_message_size;
        if xml.len() > max {
            return Err(self.incoming_failure(
                MessageSecurityError::MessageTooLarge {
                    size: xml.len(),
                    max,
                }
                .into(),
            ));
        }
        let message = match Message::from_xml_with_depth(xml, self.shared.settings.max_depth) {
            Ok(message) => message,
            Err(e) => return Err(self.incoming_failure(e)),
        };
        self.verify_incoming_message(message, correlation)
    }

    fn outgoing_failure(&self, error: Error) -> Error {
        warn!(target = %self.target, error = %error, "Failed to secure outgoing message");
        Error::Outgoing(Box::new(error))
    }

    fn incoming_failure(&self, error: Error) -> Error {
        self.messages_rejected.fetch_add(1, Ordering::Relaxed);
        warn!(
            target = %self.target,
            fault = error.fault_code().as_str(),
            error = %error,
            "Rejected incoming message"
        );
        Error::Incoming(Box::new(error))
    }

    async fn secure_request(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<(Message, CorrelationState), Error> {
        let shared = &self.shared;
        let token = match shared.variant {
            ProtocolVariant::SymmetricSessionKey => {
                let provider = shared
                    .token_provider
                    .as_ref()
                    .ok_or(ConfigError::MissingTokenProvider)?;
                Some(provider.get_token(timeout).await?)
            }
            ProtocolVariant::TransportSecured => None,
        };
        let action = message.action();
        let mut header = self.send_header(true, token.clone(), action.as_deref())?;
        for supporting in &shared.supporting_tokens {
            header.add_supporting_token(supporting.clone())?;
        }
        let secured = header.secure(message)?;
        let signature_values = if shared.settings.require_signature_confirmation {
            secured.signature_values
        } else {
            Vec::new()
        };
        debug!(target = %self.target, action = ?action, "Secured request");
        Ok((
            secured.message,
            CorrelationState {
                token,
                signature_values,
            },
        ))
    }

    fn secure_reply(&self, message: Message, request: &SecurityMessageProperty) -> Result<Message, Error> {
        let shared = &self.shared;
        let token = match shared.variant {
            ProtocolVariant::SymmetricSessionKey => Some(
                request
                    .primary_token
                    .clone()
                    .ok_or(UsageError::MissingCorrelationState)?,
            ),
            ProtocolVariant::TransportSecured => None,
        };
        let action = message.action();
        let mut header = self.send_header(false, token, action.as_deref())?;
        if shared.settings.require_signature_confirmation {
            let mut confirmations = SignatureConfirmations::new();
            for value in &request.signature_values {
                confirmations.add(value.clone(), shared.settings.encrypt_signature);
            }
            header.set_signature_confirmations(confirmations)?;
        }
        let secured = header.secure(message)?;
        debug!(target = %self.target, action = ?action, "Secured reply");
        Ok(secured.message)
    }

    fn send_header(
        &self,
        initiator: bool,
        token: Option<Arc<SecurityToken>>,
        action: Option<&str>,
    ) -> Result<SendSecurityHeader, UsageError> {
        let shared = &self.shared;
        let s = &shared.settings;
        let mut header = SendSecurityHeader::new(shared.standards, shared.suite, initiator);
        header.set_protection_order(s.protection_order)?;
        header.set_timestamp(s.include_timestamp, s.timestamp_validity)?;
        header.set_password_type(s.password_type)?;
        match token {
            Some(token) => {
                header.set_primary_token(
                    token,
                    SecurityTokenParameters::secure_conversation(s.require_derived_keys),
                )?;
                header.set_encrypt_signature(s.encrypt_signature)?;
                header.set_signature_parts(s.signature_parts.parts_for(action))?;
                header.set_encryption_parts(s.encryption_parts.parts_for(action))?;
            }
            None => {
                header.set_signature_parts(MessagePartSpecification::none())?;
                header.set_encryption_parts(MessagePartSpecification::none())?;
            }
        }
        Ok(header)
    }

    fn verify(
        &self,
        message: Message,
        correlation: Option<&CorrelationState>,
    ) -> Result<ProcessedMessage, Error> {
        let shared = &self.shared;
        let s = &shared.settings;
        let mut header = ReceiveSecurityHeader::new(shared.standards, shared.suite);
        header.set_protection_order(s.protection_order)?;
        header.set_layout(s.layout.validator())?;
        header.set_timestamp(s.include_timestamp, s.timestamp_validity, s.max_clock_skew)?;
        header.set_limits(s.limits.clone())?;
        if let (true, Some(cache)) = (s.detect_replays, &shared.nonce_cache) {
            header.set_nonce_cache(Arc::clone(cache))?;
        }
        if let Some(store) = &shared.credential_store {
            header.set_credential_store(Arc::clone(store))?;
        }

        match shared.variant {
            ProtocolVariant::SymmetricSessionKey => {
                header.set_require_derived_keys(s.require_derived_keys)?;
                header.set_signature_parts(s.signature_parts.clone())?;
                header.set_encryption_parts(s.encryption_parts.clone())?;
                match correlation {
                    Some(correlation) => {
                        let token = correlation
                            .token
                            .clone()
                            .ok_or(UsageError::MissingCorrelationState)?;
                        header.set_expected_token(token)?;
                        if s.require_signature_confirmation {
                            header.set_expected_confirmations(correlation.signature_values.clone())?;
                        }
                    }
                    None => {
                        let lookup: Option<Arc<dyn TokenLookup>> = match (&shared.token_lookup, &shared.token_cache) {
                            (Some(lookup), _) => Some(Arc::clone(lookup)),
                            (None, Some(cache)) => Some(Arc::clone(cache) as Arc<dyn TokenLookup>),
                            (None, None) => None,
                        };
                        if let Some(lookup) = lookup {
                            header.set_token_lookup(lookup)?;
                        }
                    }
                }
            }
            ProtocolVariant::TransportSecured => {
                header.set_require_signature(false)?;
                header.set_signature_parts(ScopedMessagePartSpecification::default())?;
                header.set_encryption_parts(ScopedMessagePartSpecification::default())?;
            }
        }
        header.process(message)
    }
}

impl fmt::Debug for SecurityProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityProtocol")
            .field("target", &self.target)
            .field("variant", &self.shared.variant)
            .field("metrics", &self.metrics())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SymmetricKey;
    use crate::error::{FaultCode, XmlError};
    use crate::message::SoapVersion;
    use crate::negotiation::StaticTokenProvider;
    use crate::standards::{SecureConversationVersion, SecurityVersion, TrustVersion};
    use crate::tokens::security_context_token;
    use crate::xml::XmlElement;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn session() -> Arc<SecurityToken> {
        security_context_token("urn:uuid:protocol", SymmetricKey::generate(32))
    }

    fn token_cache(token: &Arc<SecurityToken>) -> Arc<SecurityContextTokenCache> {
        let cache = Arc::new(SecurityContextTokenCache::new(
            10,
            Duration::from_secs(60),
            Duration::from_secs(3600),
        ));
        cache.add_context(Arc::clone(token)).unwrap();
        cache
    }

    fn pair(settings: ProtocolSettings) -> (Arc<SecurityProtocol>, Arc<SecurityProtocol>) {
        let token = session();
        let mut client = SecurityProtocolFactory::new(ProtocolVariant::SymmetricSessionKey);
        client.set_settings(settings.clone()).unwrap();
        client
            .set_token_provider(Arc::new(StaticTokenProvider::new(Arc::clone(&token))))
            .unwrap();
        client.open().unwrap();

        let mut service = SecurityProtocolFactory::new(ProtocolVariant::SymmetricSessionKey);
        service.set_settings(settings).unwrap();
        service.set_token_cache(token_cache(&token)).unwrap();
        service.open().unwrap();

        let target = EndpointAddress::new("urn:service");
        (
            client.create_security_protocol(target.clone(), None).unwrap(),
            service.create_security_protocol(target, None).unwrap(),
        )
    }

    fn request() -> Message {
        Message::new(
            SoapVersion::Soap12,
            "urn:test/Echo",
            XmlElement::new("m", "Echo", "urn:test").with_text("ping"),
        )
    }

    // --- Lifecycle ---

    #[test]
    fn test_setters_rejected_after_open() {
        let mut factory = SecurityProtocolFactory::new(ProtocolVariant::SymmetricSessionKey);
        factory.set_token_cache(token_cache(&session())).unwrap();
        factory.open().unwrap();
        assert_eq!(factory.state(), CommunicationState::Opened);
        assert!(factory.nonce_cache().is_some());
        assert_eq!(
            factory.set_settings(ProtocolSettings::default()),
            Err(UsageError::ObjectImmutable(FACTORY))
        );
        factory.close().unwrap();
        assert_eq!(factory.state(), CommunicationState::Closed);
    }

    #[test]
    fn test_replay_detection_needs_finite_windows() {
        let mut factory = SecurityProtocolFactory::new(ProtocolVariant::SymmetricSessionKey);
        factory.set_token_cache(token_cache(&session())).unwrap();
        factory
            .set_settings(ProtocolSettings {
                max_clock_skew: None,
                ..Default::default()
            })
            .unwrap();
        let err = factory.open().unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::InfiniteWindow("max_clock_skew"))
        ));
        assert_eq!(factory.state(), CommunicationState::Aborted);
    }

    #[test]
    fn test_transport_variant_rejects_replay_detection() {
        let mut factory = SecurityProtocolFactory::new(ProtocolVariant::TransportSecured);
        let err = factory.open().unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::ReplayDetectionNotSupported(_))
        ));
    }

    #[test]
    fn test_missing_token_source() {
        let mut factory = SecurityProtocolFactory::new(ProtocolVariant::SymmetricSessionKey);
        assert!(matches!(
            factory.open().unwrap_err(),
            Error::Config(ConfigError::MissingTokenProvider)
        ));
    }

    #[test]
    fn test_confirmation_needs_wss11() {
        let mut factory = SecurityProtocolFactory::new(ProtocolVariant::SymmetricSessionKey);
        factory.set_token_cache(token_cache(&session())).unwrap();
        factory
            .set_standards(StandardsDriver::new(
                SecurityVersion::WsSecurity10,
                TrustVersion::Feb2005,
                SecureConversationVersion::Feb2005,
            ))
            .unwrap();
        factory
            .set_settings(ProtocolSettings {
                require_signature_confirmation: true,
                ..Default::default()
            })
            .unwrap();
        assert!(matches!(
            factory.open().unwrap_err(),
            Error::Config(ConfigError::UnsupportedByVersion { .. })
        ));
    }

    #[test]
    fn test_create_before_open() {
        let factory = SecurityProtocolFactory::new(ProtocolVariant::SymmetricSessionKey);
        let err = factory
            .create_security_protocol(EndpointAddress::new("urn:x"), None)
            .unwrap_err();
        assert_eq!(err.as_usage(), Some(&UsageError::NotOpen(FACTORY)));
    }

    // --- Messages ---

    #[tokio::test]
    async fn test_request_reply_with_confirmation() {
        let settings = ProtocolSettings {
            require_signature_confirmation: true,
            ..Default::default()
        };
        let (client, service) = pair(settings);

        let (wire, correlation) = client.secure_outgoing_message(request(), TIMEOUT).await.unwrap();
        assert_eq!(correlation.signature_values().len(), 1);
        let received = service.verify_incoming_xml(&wire.to_xml(), None).unwrap();
        assert_eq!(received.message.payload().map(|p| p.text()), Some("ping".to_string()));

        let reply = Message::new(
            SoapVersion::Soap12,
            "urn:test/EchoResponse",
            XmlElement::new("m", "EchoResponse", "urn:test").with_text("pong"),
        );
        let reply = service.secure_outgoing_reply(reply, &received.security).unwrap();
        let verified = client
            .verify_incoming_xml(&reply.to_xml(), Some(&correlation))
            .unwrap();
        assert_eq!(verified.message.payload().map(|p| p.text()), Some("pong".to_string()));
        assert_eq!(client.metrics().messages_verified, 1);
        assert_eq!(service.metrics().messages_secured, 1);
    }

    #[tokio::test]
    async fn test_replayed_request_rejected() {
        let (client, service) = pair(ProtocolSettings::default());
        let (wire, _) = client.secure_outgoing_message(request(), TIMEOUT).await.unwrap();
        let xml = wire.to_xml();
        service.verify_incoming_xml(&xml, None).unwrap();
        let err = service.verify_incoming_xml(&xml, None).unwrap_err();
        assert!(matches!(err, Error::Incoming(_)));
        assert_eq!(
            err.as_message_security(),
            Some(&MessageSecurityError::ReplayDetected)
        );
        assert_eq!(service.metrics().messages_rejected, 1);
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let (client, service) = pair(ProtocolSettings {
            max_message_size: 256,
            ..Default::default()
        });
        let (wire, _) = client.secure_outgoing_message(request(), TIMEOUT).await.unwrap();
        let err = service.verify_incoming_xml(&wire.to_xml(), None).unwrap_err();
        assert!(matches!(
            err.as_message_security(),
            Some(MessageSecurityError::MessageTooLarge { max: 256, .. })
        ));
    }

    #[tokio::test]
    async fn test_deeply_nested_message_rejected() {
        let (client, service) = pair(ProtocolSettings {
            max_depth: 16,
            ..Default::default()
        });
        let deep = format!("{}ping{}", "<m:Wrap xmlns:m=\"urn:test\">".repeat(32), "</m:Wrap>".repeat(32));
        let xml = request().to_xml().replace(">ping<", &format!(">{}<", deep));
        let err = service.verify_incoming_xml(&xml, None).unwrap_err();
        assert_eq!(err.fault_code(), FaultCode::InvalidSecurity);
        assert!(matches!(
            &err,
            Error::Incoming(inner) if matches!(**inner, Error::Xml(XmlError::DepthExceeded(16)))
        ));
        assert_eq!(service.metrics().messages_rejected, 1);

        let (wire, _) = client.secure_outgoing_message(request(), TIMEOUT).await.unwrap();
        service.verify_incoming_xml(&wire.to_xml(), None).unwrap();
    }

    #[tokio::test]
    async fn test_transport_secured_round_trip() {
        let settings = ProtocolSettings {
            detect_replays: false,
            ..Default::default()
        };
        let mut factory = SecurityProtocolFactory::new(ProtocolVariant::TransportSecured);
        factory.set_settings(settings).unwrap();
        factory.open().unwrap();
        let protocol = factory
            .create_security_protocol(EndpointAddress::new("urn:service"), None)
            .unwrap();
        assert!(!protocol.variant().supports_replay_detection());

        let (wire, correlation) = protocol.secure_outgoing_message(request(), TIMEOUT).await.unwrap();
        assert!(correlation.token().is_none());
        let xml = wire.to_xml();
        assert!(xml.contains("Timestamp"));
        assert!(!xml.contains("Signature"));
        let processed = protocol.verify_incoming_xml(&xml, None).unwrap();
        assert!(processed.security.timestamp.is_some());
    }
}
