//! Processing the security header of an incoming message.
//!
//! A header is processed in passes over the element manager: scan and
//! classify every child, resolve tokens in document order, then decrypt
//! and verify in the order the protection order dictates. Requirements
//! (timestamp, replay, signing token, protected parts, confirmations) are
//! checked once all content is in plaintext and every signature holds.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::algorithms::AlgorithmSuite;
use crate::cache::{NonceCache, MIN_NONCE_LENGTH};
use crate::canonical::{canonicalize, EXC_C14N};
use crate::claims::{Claim, ClaimSet};
use crate::credentials::{validate_username_token, CredentialStore};
use crate::crypto::{constant_time_eq, digest};
use crate::error::{Error, MessageSecurityError, UsageError};
use crate::header::elements::{ElementCategory, ElementPayload, SecurityHeaderElementManager};
use crate::header::layout::HeaderLayoutValidator;
use crate::header::wire::{
    encrypted_header_data, read_encrypted_data, read_reference_list, read_signature,
    read_signature_confirmation, EncryptedDataInfo, EncryptedDataType, SignatureData,
};
use crate::header::{MessageProtectionOrder, SecurityHeaderLayout};
use crate::message::Message;
use crate::parts::ScopedMessagePartSpecification;
use crate::resolver::{ResolverLimits, TokenLookup, TokenResolver};
use crate::serializer::{
    malformed, read_derived_key_token, read_security_context_token, read_username_token,
    read_x509_token, DerivedKeyTokenData, SecurityContextTokenData, UsernameTokenData,
};
use crate::standards::{node, StandardsDriver, DSIG_NS, WSSE11_NS, WSSE_NS, WSU_NS, XENC_NS};
use crate::timestamp::SecurityTimestamp;
use crate::tokens::{KeyIdentifierClause, ReferenceStyle, SecurityToken, TokenKind};
use crate::xml::{parse_document, parse_fragment, XmlElement};

const OBJECT: &str = "receive security header";

/// Security state extracted from a verified message.
#[derive(Debug, Clone, Default)]
pub struct SecurityMessageProperty {
    /// Session token the message was protected under
    pub primary_token: Option<Arc<SecurityToken>>,
    pub basic_tokens: Vec<Arc<SecurityToken>>,
    pub signed_tokens: Vec<Arc<SecurityToken>>,
    pub endorsing_tokens: Vec<Arc<SecurityToken>>,
    pub signed_endorsing_tokens: Vec<Arc<SecurityToken>>,
    pub claims: ClaimSet,
    /// Primary then endorsing signature values, for confirmation on the reply
    pub signature_values: Vec<Vec<u8>>,
    pub timestamp: Option<SecurityTimestamp>,
}

/// A verified message with its security header removed.
#[derive(Debug, Clone)]
pub struct ProcessedMessage {
    pub message: Message,
    pub security: SecurityMessageProperty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    Created,
    Scanning,
    ElementsMarked,
    Processed,
    Faulted,
}

struct ReceiveSettings {
    standards: StandardsDriver,
    suite: AlgorithmSuite,
    protection_order: MessageProtectionOrder,
    layout: Arc<dyn HeaderLayoutValidator>,
    include_timestamp: bool,
    timestamp_validity: Duration,
    max_clock_skew: Option<Duration>,
    nonce_cache: Option<Arc<dyn NonceCache>>,
    require_signature: bool,
    require_derived_keys: bool,
    signature_parts: ScopedMessagePartSpecification,
    encryption_parts: ScopedMessagePartSpecification,
    expected_token: Option<Arc<SecurityToken>>,
    token_lookup: Option<Arc<dyn TokenLookup>>,
    credential_store: Option<Arc<dyn CredentialStore>>,
    expected_confirmations: Option<Vec<Vec<u8>>>,
    limits: ResolverLimits,
}

/// Verifies the security header of one incoming message.
///
/// Configure, then call [`ReceiveSecurityHeader::process`] once. Setters
/// fail once processing has started.
pub struct ReceiveSecurityHeader {
    settings: ReceiveSettings,
    state: ReceiveState,
}

impl ReceiveSecurityHeader {
    pub fn new(standards: StandardsDriver, suite: AlgorithmSuite) -> Self {
        Self {
            settings: ReceiveSettings {
                standards,
                suite,
                protection_order: MessageProtectionOrder::default(),
                layout: SecurityHeaderLayout::default().validator(),
                include_timestamp: true,
                timestamp_validity: Duration::from_secs(300),
                max_clock_skew: Some(Duration::from_secs(300)),
                nonce_cache: None,
                require_signature: true,
                require_derived_keys: false,
                signature_parts: ScopedMessagePartSpecification::body_for_all_actions(),
                encryption_parts: ScopedMessagePartSpecification::body_for_all_actions(),
                expected_token: None,
                token_lookup: None,
                credential_store: None,
                expected_confirmations: None,
                limits: ResolverLimits::default(),
            },
            state: ReceiveState::Created,
        }
    }

    pub fn state(&self) -> ReceiveState {
        self.state
    }

    fn settings_mut(&mut self) -> Result<&mut ReceiveSettings, UsageError> {
        if self.state != ReceiveState::Created {
            return Err(UsageError::ObjectImmutable(OBJECT));
        }
        Ok(&mut self.settings)
    }

    pub fn set_protection_order(&mut self, order: MessageProtectionOrder) -> Result<(), UsageError> {
        self.settings_mut()?.protection_order = order;
        Ok(())
    }

    pub fn set_layout(&mut self, layout: Arc<dyn HeaderLayoutValidator>) -> Result<(), UsageError> {
        self.settings_mut()?.layout = layout;
        Ok(())
    }

    /// Timestamp requirements. A `None` skew accepts any timestamp time.
    pub fn set_timestamp(
        &mut self,
        require: bool,
        validity: Duration,
        max_clock_skew: Option<Duration>,
    ) -> Result<(), UsageError> {
        let settings = self.settings_mut()?;
        settings.include_timestamp = require;
        settings.timestamp_validity = validity;
        settings.max_clock_skew = max_clock_skew;
        Ok(())
    }

    /// Enable replay detection against `cache`.
    pub fn set_nonce_cache(&mut self, cache: Arc<dyn NonceCache>) -> Result<(), UsageError> {
        self.settings_mut()?.nonce_cache = Some(cache);
        Ok(())
    }

    pub fn set_require_signature(&mut self, require: bool) -> Result<(), UsageError> {
        self.settings_mut()?.require_signature = require;
        Ok(())
    }

    pub fn set_require_derived_keys(&mut self, require: bool) -> Result<(), UsageError> {
        self.settings_mut()?.require_derived_keys = require;
        Ok(())
    }

    pub fn set_signature_parts(&mut self, parts: ScopedMessagePartSpecification) -> Result<(), UsageError> {
        self.settings_mut()?.signature_parts = parts;
        Ok(())
    }

    pub fn set_encryption_parts(&mut self, parts: ScopedMessagePartSpecification) -> Result<(), UsageError> {
        self.settings_mut()?.encryption_parts = parts;
        Ok(())
    }

    /// Session token the message must be protected under (initiator side).
    pub fn set_expected_token(&mut self, token: Arc<SecurityToken>) -> Result<(), UsageError> {
        self.settings_mut()?.expected_token = Some(token);
        Ok(())
    }

    /// Where session tokens not carried in the message are looked up.
    pub fn set_token_lookup(&mut self, lookup: Arc<dyn TokenLookup>) -> Result<(), UsageError> {
        self.settings_mut()?.token_lookup = Some(lookup);
        Ok(())
    }

    pub fn set_credential_store(&mut self, store: Arc<dyn CredentialStore>) -> Result<(), UsageError> {
        self.settings_mut()?.credential_store = Some(store);
        Ok(())
    }

    /// Signature values the reply must confirm. An empty set expects a
    /// single confirmation without a value.
    pub fn set_expected_confirmations(&mut self, values: Vec<Vec<u8>>) -> Result<(), UsageError> {
        self.settings_mut()?.expected_confirmations = Some(values);
        Ok(())
    }

    pub fn set_limits(&mut self, limits: ResolverLimits) -> Result<(), UsageError> {
        self.settings_mut()?.limits = limits;
        Ok(())
    }

    /// Verify `message` and strip its security header.
    pub fn process(&mut self, message: Message) -> Result<ProcessedMessage, Error> {
        if self.state != ReceiveState::Created {
            return Err(UsageError::InvalidState {
                object: OBJECT,
                state: format!("{:?}", self.state),
            }
            .into());
        }
        self.state = ReceiveState::Scanning;
        let result = self.run(message);
        self.state = match result {
            Ok(_) => ReceiveState::Processed,
            Err(_) => ReceiveState::Faulted,
        };
        result
    }

    fn run(&mut self, message: Message) -> Result<ProcessedMessage, Error> {
        let pass = Pass::scan(&self.settings, message)?;
        self.state = ReceiveState::ElementsMarked;
        pass.process()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct PartState {
    signed: bool,
    encrypted: bool,
}

/// Where a signature reference points.
#[derive(Debug, Clone, Copy)]
enum Target {
    Slot(usize),
    Header(usize),
    Body,
    Nested,
}

struct Verified {
    token: Arc<SecurityToken>,
    value: Vec<u8>,
}

/// State of one processing run.
struct Pass<'a> {
    settings: &'a ReceiveSettings,
    message: Message,
    elements: SecurityHeaderElementManager,
    resolver: TokenResolver,
    headers: Vec<PartState>,
    body: PartState,
    primary: Option<Verified>,
    primary_base: Option<Arc<SecurityToken>>,
    endorsing: Vec<Verified>,
    timestamp: Option<SecurityTimestamp>,
}

fn classify(
    standards: &StandardsDriver,
    element: &XmlElement,
) -> Result<(ElementCategory, ElementPayload), MessageSecurityError> {
    let sc_ns = standards.secure_conversation_namespace();
    let ns = element.namespace.as_deref().unwrap_or("");
    let classified = match (ns, element.local_name.as_str()) {
        (ns, node::SECURITY_CONTEXT_TOKEN) if ns == sc_ns => (
            ElementCategory::Token,
            ElementPayload::SecurityContextToken(read_security_context_token(element, standards)?),
        ),
        (ns, node::DERIVED_KEY_TOKEN) if ns == sc_ns => (
            ElementCategory::Token,
            ElementPayload::DerivedKeyToken(read_derived_key_token(element, standards)?),
        ),
        (WSSE_NS, node::USERNAME_TOKEN) => (
            ElementCategory::Token,
            ElementPayload::UsernameToken(read_username_token(element)?),
        ),
        (WSSE_NS, node::BINARY_SECURITY_TOKEN) => {
            let (id, raw_data) = read_x509_token(element)?;
            (ElementCategory::Token, ElementPayload::X509Token { id, raw_data })
        }
        (WSU_NS, node::TIMESTAMP) => (
            ElementCategory::Timestamp,
            ElementPayload::Timestamp(SecurityTimestamp::from_xml(element)?),
        ),
        (DSIG_NS, node::SIGNATURE) => (
            ElementCategory::Signature,
            ElementPayload::Signature(Box::new(read_signature(element, standards)?)),
        ),
        (XENC_NS, node::ENCRYPTED_DATA) => (
            ElementCategory::EncryptedData,
            ElementPayload::EncryptedData(read_encrypted_data(element, standards)?),
        ),
        (XENC_NS, node::REFERENCE_LIST) => (
            ElementCategory::ReferenceList,
            ElementPayload::ReferenceList(read_reference_list(element)?),
        ),
        (WSSE11_NS, node::SIGNATURE_CONFIRMATION)
            if standards.security.supports_signature_confirmation() =>
        {
            let (_, value) = read_signature_confirmation(element)?;
            (
                ElementCategory::SignatureConfirmation,
                ElementPayload::SignatureConfirmation(value),
            )
        }
        _ => return Err(MessageSecurityError::UnexpectedElement(element.qname())),
    };
    Ok(classified)
}

impl<'a> Pass<'a> {
    fn scan(settings: &'a ReceiveSettings, mut message: Message) -> Result<Self, Error> {
        message.ensure_unique_ids()?;
        let security = message
            .take_security_header()
            .ok_or(MessageSecurityError::MissingSecurityHeader)?;

        let mut elements = SecurityHeaderElementManager::new();
        for child in security.element_children() {
            let (category, payload) = classify(&settings.standards, child)?;
            elements.append(category, child.clone(), payload)?;
        }
        settings.layout.validate(&elements, settings.protection_order)?;

        let mut resolver = TokenResolver::new(settings.limits.clone());
        if let Some(lookup) = &settings.token_lookup {
            resolver = resolver.with_fallback(Arc::clone(lookup));
        }
        if let Some(token) = &settings.expected_token {
            resolver.add(Arc::clone(token), ReferenceStyle::External, None);
        }

        debug!(elements = elements.len(), "Scanned security header");
        let headers = vec![PartState::default(); message.headers().len()];
        Ok(Self {
            settings,
            message,
            elements,
            resolver,
            headers,
            body: PartState::default(),
            primary: None,
            primary_base: None,
            endorsing: Vec::new(),
            timestamp: None,
        })
    }

    fn process(mut self) -> Result<ProcessedMessage, Error> {
        for index in self.elements.indices_of(ElementCategory::Token) {
            self.resolve_token_slot(index)?;
        }

        match self.settings.protection_order {
            MessageProtectionOrder::SignBeforeEncrypt => {
                self.decrypt_all()?;
                self.settings
                    .layout
                    .validate(&self.elements, self.settings.protection_order)?;
                self.verify_signatures()?;
            }
            MessageProtectionOrder::EncryptBeforeSign => {
                self.verify_signatures()?;
                self.decrypt_all()?;
            }
        }
        self.ensure_all_decrypted()?;
        self.ensure_unique_ids()?;

        self.check_timestamp()?;
        self.check_replay()?;
        self.check_primary_token()?;
        self.check_parts()?;
        self.check_confirmations()?;
        Ok(self.finish())
    }

    // --- Tokens ---

    fn resolve_token_slot(&mut self, index: usize) -> Result<(), Error> {
        let Some(slot) = self.elements.get(index) else {
            return Ok(());
        };
        let token = match slot.payload.clone() {
            ElementPayload::SecurityContextToken(data) => self.resolve_session_token(&data)?,
            ElementPayload::DerivedKeyToken(data) => self.resolve_derived_key(&data)?,
            ElementPayload::UsernameToken(data) => self.authenticate(&data)?,
            ElementPayload::X509Token { id, raw_data } => {
                Arc::new(SecurityToken::new(id, TokenKind::X509 { raw_data }))
            }
            _ => return Ok(()),
        };
        self.resolver
            .add(Arc::clone(&token), ReferenceStyle::Internal, None);
        self.elements.set_payload(index, ElementPayload::Token(token))?;
        Ok(())
    }

    fn resolve_session_token(
        &mut self,
        data: &SecurityContextTokenData,
    ) -> Result<Arc<SecurityToken>, Error> {
        let clause = KeyIdentifierClause::security_context(data.context_id.clone(), data.generation.clone());
        let token = self
            .resolver
            .resolve(&clause, true, false)?
            .ok_or_else(|| MessageSecurityError::TokenUnavailable(clause.to_string()))?;
        if token.is_expired_at(Utc::now()) {
            return Err(MessageSecurityError::TokenExpired(data.context_id.clone()).into());
        }
        Ok(Arc::new(token.with_id(data.id.as_str())))
    }

    fn resolve_derived_key(&mut self, data: &DerivedKeyTokenData) -> Result<Arc<SecurityToken>, Error> {
        self.resolver.check_derived_key_range(data.offset, data.length)?;
        self.resolver.record_derived_key()?;
        let base = self
            .resolver
            .resolve(&data.base, false, false)?
            .ok_or_else(|| MessageSecurityError::UnresolvedKey(data.base.to_string()))?;
        if base.is_expired_at(Utc::now()) {
            return Err(MessageSecurityError::TokenExpired(base.id().to_string()).into());
        }
        let key = base
            .symmetric_key()
            .ok_or_else(|| MessageSecurityError::MissingSymmetricKey(base.id().to_string()))?;
        let label = data.label.clone().unwrap_or_else(|| {
            self.settings
                .standards
                .secure_conversation
                .default_derivation_label()
                .to_string()
        });
        let derived = key.derive(label.as_bytes(), &data.nonce, data.offset, data.length);
        Ok(Arc::new(SecurityToken::new(
            data.id.as_str(),
            TokenKind::DerivedKey {
                base_id: base.id().to_string(),
                label,
                nonce: data.nonce.clone(),
                offset: data.offset,
                length: data.length,
                key: derived,
            },
        )))
    }

    fn authenticate(&self, data: &UsernameTokenData) -> Result<Arc<SecurityToken>, Error> {
        let store = self
            .settings
            .credential_store
            .as_deref()
            .ok_or_else(|| MessageSecurityError::AuthenticationFailed(data.username.clone()))?;
        validate_username_token(data, store)?;

        if let (Some(cache), Some(nonce)) = (&self.settings.nonce_cache, &data.nonce) {
            if nonce.len() < MIN_NONCE_LENGTH {
                return Err(malformed("UsernameToken", "nonce is too short").into());
            }
            if !cache.try_add_nonce(nonce)? {
                return Err(MessageSecurityError::ReplayDetected.into());
            }
        }
        Ok(Arc::new(SecurityToken::new(
            data.id.as_str(),
            TokenKind::UserName {
                username: data.username.clone(),
                password: data.password.clone(),
            },
        )))
    }

    /// Session token behind a signing token.
    fn base_of(&self, token: &Arc<SecurityToken>) -> Arc<SecurityToken> {
        match token.kind() {
            TokenKind::DerivedKey { base_id, .. } => self
                .resolver
                .find_by_id(base_id)
                .unwrap_or_else(|| Arc::clone(token)),
            _ => Arc::clone(token),
        }
    }

    // --- Decryption ---

    fn decrypt_all(&mut self) -> Result<(), Error> {
        let mut ids = Vec::new();
        for index in self.elements.indices_of(ElementCategory::ReferenceList) {
            if let Some(ElementPayload::ReferenceList(list)) = self.elements.get(index).map(|s| &s.payload) {
                ids.extend(list.iter().cloned());
            }
        }
        for id in ids {
            self.decrypt_reference(&id)?;
        }
        Ok(())
    }

    fn decrypt_reference(&mut self, id: &str) -> Result<(), Error> {
        if let Some(index) = self.elements.find_by_id(id) {
            return self.decrypt_slot(index, id);
        }
        let header = self.message.headers().iter().position(|h| {
            encrypted_header_data(h).and_then(XmlElement::id) == Some(id)
        });
        if let Some(index) = header {
            return self.decrypt_header(index);
        }
        if self.body_encrypted_data(id).is_some() {
            return self.decrypt_body(id);
        }
        Err(MessageSecurityError::ReferenceNotFound(id.to_string()).into())
    }

    fn decrypt_payload(&mut self, info: &EncryptedDataInfo) -> Result<String, Error> {
        let key = self
            .resolver
            .resolve_key(&info.key_info)?
            .ok_or_else(|| MessageSecurityError::UnresolvedKey(info.key_info.to_string()))?;
        let algorithm = self.settings.suite.ensure_encryption(&info.algorithm)?;
        let plaintext = key.decrypt(algorithm, &info.cipher_value)?;
        String::from_utf8(plaintext)
            .map_err(|_| malformed("EncryptedData", "plaintext is not UTF-8").into())
    }

    fn decrypt_element(&mut self, info: &EncryptedDataInfo) -> Result<XmlElement, Error> {
        if info.data_type != EncryptedDataType::Element {
            return Err(malformed("EncryptedData", format!("'{}' must be of type Element", info.id)).into());
        }
        let plaintext = self.decrypt_payload(info)?;
        Ok(parse_document(&plaintext)?)
    }

    fn decrypt_slot(&mut self, index: usize, id: &str) -> Result<(), Error> {
        let info = match self.elements.get(index).map(|s| &s.payload) {
            Some(ElementPayload::EncryptedData(info)) => info.clone(),
            _ => {
                return Err(MessageSecurityError::LayoutViolation(format!(
                    "'{}' is listed for decryption but is not encrypted data",
                    id
                ))
                .into())
            }
        };
        let element = self.decrypt_element(&info)?;
        let (category, payload) = classify(&self.settings.standards, &element)?;
        match category {
            ElementCategory::EncryptedData | ElementCategory::ReferenceList => {
                return Err(MessageSecurityError::LayoutViolation(format!(
                    "'{}' decrypts to another encryption element",
                    id
                ))
                .into());
            }
            ElementCategory::Signature
                if self.settings.protection_order == MessageProtectionOrder::EncryptBeforeSign =>
            {
                return Err(MessageSecurityError::LayoutViolation(
                    "encrypted signature when encrypting before signing".to_string(),
                )
                .into());
            }
            _ => {}
        }
        self.elements.replace(index, category, element, payload)?;
        if category == ElementCategory::Token {
            self.resolve_token_slot(index)?;
        }
        debug!(id, ?category, "Decrypted security header element");
        Ok(())
    }

    fn decrypt_header(&mut self, index: usize) -> Result<(), Error> {
        let info = {
            let data = self
                .message
                .headers()
                .get(index)
                .and_then(encrypted_header_data)
                .ok_or_else(|| malformed("EncryptedHeader", "missing EncryptedData"))?;
            read_encrypted_data(data, &self.settings.standards)?
        };
        let element = self.decrypt_element(&info)?;
        debug!(header = %element.qname(), "Decrypted header");
        self.message.headers_mut()[index] = element;
        self.headers[index].encrypted = true;
        Ok(())
    }

    fn body_encrypted_data(&self, id: &str) -> Option<&XmlElement> {
        self.message
            .body()
            .element_children()
            .find(|c| c.is(XENC_NS, node::ENCRYPTED_DATA) && c.id() == Some(id))
    }

    fn decrypt_body(&mut self, id: &str) -> Result<(), Error> {
        let info = match self.body_encrypted_data(id) {
            Some(data) => read_encrypted_data(data, &self.settings.standards)?,
            None => return Err(MessageSecurityError::ReferenceNotFound(id.to_string()).into()),
        };
        if info.data_type != EncryptedDataType::Content {
            return Err(malformed("EncryptedData", "body data must be of type Content").into());
        }
        let content = self.decrypt_payload(&info)?;
        self.message.body_mut().children = parse_fragment(&content)?;
        self.body.encrypted = true;
        debug!(id, "Decrypted body");
        Ok(())
    }

    fn ensure_all_decrypted(&self) -> Result<(), MessageSecurityError> {
        match self
            .elements
            .iter()
            .find(|s| s.category == ElementCategory::EncryptedData)
        {
            Some(slot) => Err(MessageSecurityError::LayoutViolation(format!(
                "encrypted element '{}' is not in any reference list",
                slot.current_id.as_deref().unwrap_or("")
            ))),
            None => Ok(()),
        }
    }

    /// Decryption can surface ids that were hidden in ciphertext.
    fn ensure_unique_ids(&self) -> Result<(), MessageSecurityError> {
        let mut ids = self.message.collect_ids();
        for slot in self.elements.iter() {
            let mut found = Vec::new();
            slot.element.collect_ids(&mut found);
            ids.extend(found.into_iter().map(str::to_string));
        }
        let mut seen = HashSet::new();
        for id in ids {
            if !seen.insert(id.clone()) {
                return Err(MessageSecurityError::DuplicateId(id));
            }
        }
        Ok(())
    }

    // --- Signatures ---

    fn verify_signatures(&mut self) -> Result<(), Error> {
        let indices = self.elements.indices_of(ElementCategory::Signature);
        let Some(&primary_index) = indices.first() else {
            if self.settings.require_signature {
                return Err(MessageSecurityError::SignatureMissing.into());
            }
            return Ok(());
        };
        let primary_id = self
            .elements
            .get(primary_index)
            .and_then(|s| s.current_id.clone());

        for index in indices {
            let Some(signature) = self
                .elements
                .get(index)
                .and_then(|s| s.payload.as_signature())
                .cloned()
            else {
                continue;
            };
            let is_primary = index == primary_index;
            if !is_primary
                && !primary_id
                    .as_deref()
                    .is_some_and(|id| signature.references_id(id))
            {
                return Err(MessageSecurityError::LayoutViolation(
                    "endorsing signature does not cover the primary signature".to_string(),
                )
                .into());
            }
            let token = self.verify_signature(&signature, is_primary)?;
            let verified = Verified {
                token,
                value: signature.value.clone(),
            };
            if is_primary {
                self.primary = Some(verified);
            } else {
                self.endorsing.push(verified);
            }
        }
        debug!(signatures = 1 + self.endorsing.len(), "Verified signatures");
        Ok(())
    }

    fn verify_signature(
        &mut self,
        signature: &SignatureData,
        is_primary: bool,
    ) -> Result<Arc<SecurityToken>, Error> {
        let settings = self.settings;
        settings.suite.ensure_canonicalization(&signature.canonicalization)?;
        let algorithm = settings.suite.ensure_signature(&signature.signature_method)?;
        let token = self
            .resolver
            .resolve(&signature.key_info, false, true)?
            .ok_or_else(|| MessageSecurityError::UnresolvedKey(signature.key_info.to_string()))?;
        let key = token
            .symmetric_key()
            .ok_or_else(|| MessageSecurityError::MissingSymmetricKey(token.id().to_string()))?;
        let signed_info = canonicalize(&signature.signed_info)?;
        if !key.verify(algorithm, &signed_info, &signature.value) {
            return Err(MessageSecurityError::SignatureMismatch.into());
        }

        for reference in &signature.references {
            if let Some(transform) = reference.transforms.iter().find(|t| t.as_str() != EXC_C14N) {
                return Err(MessageSecurityError::UnsupportedAlgorithm(transform.clone()).into());
            }
            let digest_algorithm = settings.suite.ensure_digest(&reference.digest_method)?;
            let (target, canonical) = self.locate(&reference.id)?;
            if !constant_time_eq(&digest(digest_algorithm, &canonical), &reference.digest_value) {
                return Err(MessageSecurityError::DigestMismatch(reference.id.clone()).into());
            }
            if is_primary {
                self.mark_signed(target)?;
            }
        }
        Ok(token)
    }

    /// Find a signed element and its canonical bytes.
    fn locate(&self, id: &str) -> Result<(Target, Vec<u8>), Error> {
        if let Some(index) = self.elements.find_by_id(id) {
            if let Some(slot) = self.elements.get(index) {
                if slot.current_id.as_deref() == Some(id) {
                    return Ok((Target::Slot(index), canonicalize(&slot.element)?));
                }
            }
            return Err(MessageSecurityError::ReferenceNotFound(id.to_string()).into());
        }
        for (index, header) in self.message.headers().iter().enumerate() {
            if header.id() == Some(id) {
                return Ok((Target::Header(index), canonicalize(header)?));
            }
        }
        let body = self.message.body();
        if body.id() == Some(id) {
            return Ok((Target::Body, canonicalize(body)?));
        }
        let nested = self
            .message
            .headers()
            .iter()
            .find_map(|h| h.find_by_id(id))
            .or_else(|| body.find_by_id(id));
        match nested {
            Some(element) => Ok((Target::Nested, canonicalize(element)?)),
            None => Err(MessageSecurityError::ReferenceNotFound(id.to_string()).into()),
        }
    }

    fn mark_signed(&mut self, target: Target) -> Result<(), MessageSecurityError> {
        match target {
            Target::Slot(index) => self.elements.mark_signed(index)?,
            Target::Header(index) => {
                if let Some(state) = self.headers.get_mut(index) {
                    state.signed = true;
                }
            }
            Target::Body => self.body.signed = true,
            Target::Nested => {}
        }
        Ok(())
    }

    // --- Requirements ---

    fn check_timestamp(&mut self) -> Result<(), MessageSecurityError> {
        let Some(index) = self.elements.indices_of(ElementCategory::Timestamp).first().copied() else {
            if self.settings.include_timestamp {
                return Err(MessageSecurityError::TimestampMissing);
            }
            return Ok(());
        };
        let Some(slot) = self.elements.get(index) else {
            return Ok(());
        };
        if self.primary.is_some() && !slot.signed {
            return Err(MessageSecurityError::PartNotSigned("Timestamp".to_string()));
        }
        if let ElementPayload::Timestamp(timestamp) = &slot.payload {
            timestamp.validate_freshness(
                Utc::now(),
                self.settings.timestamp_validity,
                self.settings.max_clock_skew,
            )?;
            self.timestamp = Some(timestamp.clone());
        }
        Ok(())
    }

    fn check_replay(&self) -> Result<(), Error> {
        if let (Some(cache), Some(primary)) = (&self.settings.nonce_cache, &self.primary) {
            if !cache.try_add_nonce(&primary.value)? {
                return Err(MessageSecurityError::ReplayDetected.into());
            }
        }
        Ok(())
    }

    fn check_primary_token(&mut self) -> Result<(), MessageSecurityError> {
        let Some(primary) = &self.primary else {
            return Ok(());
        };
        let derived = matches!(primary.token.kind(), TokenKind::DerivedKey { .. });
        if self.settings.require_derived_keys && !derived {
            return Err(MessageSecurityError::UnexpectedSigningToken(
                "signing key is not derived".to_string(),
            ));
        }
        let base = self.base_of(&primary.token);
        let Some((context_id, _)) = base.context() else {
            return Err(MessageSecurityError::UnexpectedSigningToken(format!(
                "'{}' is not a session token",
                base.id()
            )));
        };
        if let Some(expected) = &self.settings.expected_token {
            if expected.context().map(|(c, _)| c) != Some(context_id) {
                return Err(MessageSecurityError::UnexpectedSigningToken(format!(
                    "signed under context '{}'",
                    context_id
                )));
            }
        }
        self.primary_base = Some(base);
        Ok(())
    }

    fn check_parts(&self) -> Result<(), MessageSecurityError> {
        let action = self.message.action();
        let signed = self.settings.signature_parts.parts_for(action.as_deref());
        let encrypted = self.settings.encryption_parts.parts_for(action.as_deref());

        if signed.is_body_included && !self.body.signed {
            return Err(MessageSecurityError::PartNotSigned("Body".to_string()));
        }
        let has_content = self.message.body().element_children().next().is_some();
        if encrypted.is_body_included && has_content && !self.body.encrypted {
            return Err(MessageSecurityError::PartNotEncrypted("Body".to_string()));
        }
        for (index, header) in self.message.headers().iter().enumerate() {
            let ns = header.namespace.as_deref().unwrap_or("");
            let state = self.headers.get(index).copied().unwrap_or_default();
            if signed.includes_header(&header.local_name, ns) && !state.signed {
                return Err(MessageSecurityError::PartNotSigned(header.qname()));
            }
            if encrypted.includes_header(&header.local_name, ns) && !state.encrypted {
                return Err(MessageSecurityError::PartNotEncrypted(header.qname()));
            }
        }
        Ok(())
    }

    fn check_confirmations(&self) -> Result<(), MessageSecurityError> {
        let Some(expected) = &self.settings.expected_confirmations else {
            return Ok(());
        };
        let mut received = Vec::new();
        for index in self.elements.indices_of(ElementCategory::SignatureConfirmation) {
            let Some(slot) = self.elements.get(index) else {
                continue;
            };
            if !slot.signed {
                return Err(MessageSecurityError::PartNotSigned(
                    "SignatureConfirmation".to_string(),
                ));
            }
            if let ElementPayload::SignatureConfirmation(value) = &slot.payload {
                received.push(value.clone());
            }
        }

        let matches = if expected.is_empty() {
            matches!(received.as_slice(), [None])
        } else {
            match received.into_iter().collect::<Option<Vec<_>>>() {
                Some(mut values) => {
                    let mut expected = expected.clone();
                    values.sort();
                    expected.sort();
                    values == expected
                }
                None => false,
            }
        };
        if !matches {
            return Err(MessageSecurityError::SignatureConfirmationMismatch);
        }
        Ok(())
    }

    // --- Output ---

    fn finish(self) -> ProcessedMessage {
        let mut security = SecurityMessageProperty {
            primary_token: self.primary_base.clone(),
            timestamp: self.timestamp.clone(),
            ..Default::default()
        };
        if let Some(primary) = &self.primary {
            security.signature_values.push(primary.value.clone());
        }
        let mut endorsing: Vec<Arc<SecurityToken>> = Vec::new();
        for verified in &self.endorsing {
            security.signature_values.push(verified.value.clone());
            let base = self.base_of(&verified.token);
            if !endorsing.iter().any(|t| t.id() == base.id()) {
                endorsing.push(base);
            }
        }

        let primary_id = self.primary_base.as_ref().map(|t| t.id().to_string());
        for slot in self.elements.iter() {
            let Some(token) = slot.payload.as_token() else {
                continue;
            };
            if matches!(token.kind(), TokenKind::DerivedKey { .. })
                || primary_id.as_deref() == Some(token.id())
            {
                continue;
            }
            let is_endorsing = match endorsing.iter().position(|t| t.id() == token.id()) {
                Some(position) => {
                    endorsing.remove(position);
                    true
                }
                None => false,
            };
            let collection = match (slot.signed, is_endorsing) {
                (false, false) => &mut security.basic_tokens,
                (true, false) => &mut security.signed_tokens,
                (false, true) => &mut security.endorsing_tokens,
                (true, true) => &mut security.signed_endorsing_tokens,
            };
            collection.push(Arc::clone(token));
        }
        security.endorsing_tokens.extend(endorsing);

        let mut claims = ClaimSet::new();
        let tokens = security
            .primary_token
            .iter()
            .chain(&security.signed_tokens)
            .chain(&security.signed_endorsing_tokens)
            .chain(&security.endorsing_tokens)
            .chain(&security.basic_tokens);
        for token in tokens {
            if let Some(claim) = Claim::from_token(token) {
                claims.add(claim);
            }
        }
        security.claims = claims;

        debug!(
            action = ?self.message.action(),
            supporting = security.basic_tokens.len()
                + security.signed_tokens.len()
                + security.endorsing_tokens.len()
                + security.signed_endorsing_tokens.len(),
            "Verified message security"
        );
        ProcessedMessage {
            message: self.message,
            security,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryNonceCache;
    use crate::claims::ClaimType;
    use crate::credentials::InMemoryCredentialStore;
    use crate::crypto::{b64_encode, SymmetricKey};
    use crate::header::send::SendSecurityHeader;
    use crate::header::{SupportingToken, SupportingTokenAttachment};
    use crate::message::SoapVersion;
    use crate::parts::{HeaderName, MessagePartSpecification, WILDCARD_ACTION};
    use crate::tokens::{security_context_token, SecurityTokenParameters};
    use crate::xml::XmlNode;

    struct Known(Vec<Arc<SecurityToken>>);

    impl TokenLookup for Known {
        fn lookup(&self, clause: &KeyIdentifierClause) -> Option<Arc<SecurityToken>> {
            self.0
                .iter()
                .find(|t| t.matches_key_identifier_clause(clause))
                .cloned()
        }
    }

    fn session() -> Arc<SecurityToken> {
        security_context_token("urn:uuid:session", SymmetricKey::generate(32))
    }

    fn message() -> Message {
        Message::new(
            SoapVersion::Soap12,
            "urn:test/Echo",
            XmlElement::new("m", "Echo", "urn:test").with_text("payload"),
        )
    }

    /// Secure `outgoing` under `token` and reparse it from the wire form.
    fn send_with(
        token: &Arc<SecurityToken>,
        outgoing: Message,
        configure: impl FnOnce(&mut SendSecurityHeader),
    ) -> Message {
        let mut header = SendSecurityHeader::new(StandardsDriver::default(), AlgorithmSuite::Basic256, true);
        header
            .set_primary_token(Arc::clone(token), SecurityTokenParameters::secure_conversation(true))
            .unwrap();
        configure(&mut header);
        let secured = header.secure(outgoing).unwrap();
        Message::from_xml(&secured.message.to_xml()).unwrap()
    }

    fn send(token: &Arc<SecurityToken>, order: MessageProtectionOrder, encrypt: bool) -> Message {
        send_with(token, message(), |header| {
            header.set_protection_order(order).unwrap();
            if !encrypt {
                header.set_encryption_parts(MessagePartSpecification::none()).unwrap();
            }
        })
    }

    fn receiver_knowing(tokens: Vec<Arc<SecurityToken>>) -> ReceiveSecurityHeader {
        let mut header = ReceiveSecurityHeader::new(StandardsDriver::default(), AlgorithmSuite::Basic256);
        header.set_token_lookup(Arc::new(Known(tokens))).unwrap();
        header.set_require_derived_keys(true).unwrap();
        header
    }

    fn receiver(token: &Arc<SecurityToken>, order: MessageProtectionOrder, encrypt: bool) -> ReceiveSecurityHeader {
        let mut header = receiver_knowing(vec![Arc::clone(token)]);
        header.set_protection_order(order).unwrap();
        if !encrypt {
            header
                .set_encryption_parts(ScopedMessagePartSpecification::default())
                .unwrap();
        }
        header
    }

    fn body_text(message: &Message) -> String {
        message.payload().map(|p| p.text()).unwrap_or_default()
    }

    // --- Round trips ---

    #[test]
    fn test_sign_before_encrypt_round_trip() {
        let token = session();
        let wire = send(&token, MessageProtectionOrder::SignBeforeEncrypt, true);
        assert!(!wire.to_xml().contains(">payload<"));

        let mut header = receiver(&token, MessageProtectionOrder::SignBeforeEncrypt, true);
        let processed = header.process(wire).unwrap();
        assert_eq!(body_text(&processed.message), "payload");
        assert!(processed.message.security_header().is_none());
        assert_eq!(header.state(), ReceiveState::Processed);

        let security = processed.security;
        assert_eq!(security.signature_values.len(), 1);
        assert_eq!(
            security.primary_token.as_ref().and_then(|t| t.context()).map(|(c, _)| c.to_string()),
            Some("urn:uuid:session".to_string())
        );
        assert!(security.timestamp.is_some());
    }

    #[test]
    fn test_encrypt_before_sign_round_trip() {
        let token = session();
        let wire = send(&token, MessageProtectionOrder::EncryptBeforeSign, true);
        let processed = receiver(&token, MessageProtectionOrder::EncryptBeforeSign, true)
            .process(wire)
            .unwrap();
        assert_eq!(body_text(&processed.message), "payload");
    }

    #[test]
    fn test_sign_only_round_trip() {
        let token = session();
        let wire = send(&token, MessageProtectionOrder::SignBeforeEncrypt, false);
        assert!(wire.to_xml().contains(">payload<"));
        let processed = receiver(&token, MessageProtectionOrder::SignBeforeEncrypt, false)
            .process(wire)
            .unwrap();
        assert_eq!(body_text(&processed.message), "payload");
    }

    // --- Protected header elements ---

    fn route_header() -> XmlElement {
        XmlElement::new("r", "Route", "urn:route").with_text("via-hidden-hop")
    }

    fn route_parts() -> MessagePartSpecification {
        MessagePartSpecification::body().with_header(HeaderName::new("Route", "urn:route"))
    }

    fn requiring_route(token: &Arc<SecurityToken>) -> ReceiveSecurityHeader {
        let mut header = receiver_knowing(vec![Arc::clone(token)]);
        header
            .set_encryption_parts(
                ScopedMessagePartSpecification::builder()
                    .add_parts(WILDCARD_ACTION, route_parts())
                    .freeze(),
            )
            .unwrap();
        header
    }

    #[test]
    fn test_encrypted_signature_round_trip() {
        let token = session();
        let wire = send_with(&token, message(), |header| {
            header.set_encrypt_signature(true).unwrap();
        });
        let xml = wire.to_xml();
        assert!(!xml.contains("SignatureValue"));
        assert!(!xml.contains(">payload<"));

        let processed = receiver_knowing(vec![Arc::clone(&token)]).process(wire).unwrap();
        assert_eq!(body_text(&processed.message), "payload");
        assert_eq!(processed.security.signature_values.len(), 1);
    }

    #[test]
    fn test_encrypted_header_round_trip() {
        let token = session();
        let mut outgoing = message();
        outgoing.add_header(route_header());
        let wire = send_with(&token, outgoing, |header| {
            header.set_encryption_parts(route_parts()).unwrap();
        });
        let xml = wire.to_xml();
        assert!(xml.contains("EncryptedHeader"));
        assert!(!xml.contains("via-hidden-hop"));

        let processed = requiring_route(&token).process(wire).unwrap();
        assert_eq!(
            processed.message.header("urn:route", "Route").map(|h| h.text()),
            Some("via-hidden-hop".to_string())
        );
        assert_eq!(body_text(&processed.message), "payload");
    }

    #[test]
    fn test_plain_header_rejected_when_encryption_required() {
        let token = session();
        let mut outgoing = message();
        outgoing.add_header(route_header());
        let wire = send_with(&token, outgoing, |_| {});
        let err = requiring_route(&token).process(wire).unwrap_err();
        assert_eq!(
            err.as_message_security(),
            Some(&MessageSecurityError::PartNotEncrypted("r:Route".to_string()))
        );
    }

    // --- Supporting tokens ---

    fn endorsing(token: &Arc<SecurityToken>) -> SupportingToken {
        SupportingToken::new(
            Arc::clone(token),
            SecurityTokenParameters::secure_conversation(true),
            SupportingTokenAttachment::Endorsing,
        )
    }

    /// Replace the value of the last signature in the header.
    fn with_forged_endorsement(wire: &Message) -> Message {
        let mut security = wire.security_header().cloned().unwrap();
        let signature = security
            .children
            .iter_mut()
            .filter_map(|n| match n {
                XmlNode::Element(e) if e.is(DSIG_NS, node::SIGNATURE) => Some(e),
                _ => None,
            })
            .last()
            .unwrap();
        let value = signature
            .children
            .iter_mut()
            .find_map(|n| match n {
                XmlNode::Element(e) if e.is(DSIG_NS, node::SIGNATURE_VALUE) => Some(e),
                _ => None,
            })
            .unwrap();
        value.children = vec![XmlNode::Text(b64_encode(&[0; 20]))];
        let mut forged = wire.clone();
        forged.set_security_header(security);
        forged
    }

    #[test]
    fn test_endorsing_token_round_trip() {
        let token = session();
        let endorser = security_context_token("urn:uuid:endorser", SymmetricKey::generate(32));
        let wire = send_with(&token, message(), |header| {
            header.add_supporting_token(endorsing(&endorser)).unwrap();
        });

        let processed = receiver_knowing(vec![Arc::clone(&token), Arc::clone(&endorser)])
            .process(wire)
            .unwrap();
        let security = processed.security;
        assert_eq!(security.signature_values.len(), 2);
        assert_eq!(security.endorsing_tokens.len(), 1);
        assert_eq!(
            security.endorsing_tokens[0].context().map(|(c, _)| c.to_string()),
            Some("urn:uuid:endorser".to_string())
        );
        assert!(security.signed_tokens.is_empty());
    }

    #[test]
    fn test_forged_endorsing_signature_rejected() {
        let token = session();
        let endorser = security_context_token("urn:uuid:endorser", SymmetricKey::generate(32));
        let wire = send_with(&token, message(), |header| {
            header.add_supporting_token(endorsing(&endorser)).unwrap();
        });

        let mut header = receiver_knowing(vec![Arc::clone(&token), Arc::clone(&endorser)]);
        let err = header.process(with_forged_endorsement(&wire)).unwrap_err();
        assert_eq!(
            err.as_message_security(),
            Some(&MessageSecurityError::SignatureMismatch)
        );
        assert_eq!(header.state(), ReceiveState::Faulted);
    }

    #[test]
    fn test_signed_encrypted_username_round_trip() {
        let token = session();
        let user = Arc::new(SecurityToken::new(
            "user-1",
            TokenKind::UserName {
                username: "alice".to_string(),
                password: "wonderland".to_string(),
            },
        ));
        let wire = send_with(&token, message(), |header| {
            header
                .add_supporting_token(
                    SupportingToken::new(
                        user,
                        SecurityTokenParameters::user_name(),
                        SupportingTokenAttachment::Signed,
                    )
                    .encrypted(),
                )
                .unwrap();
        });
        assert!(!wire.to_xml().contains("alice"));

        let store = InMemoryCredentialStore::new();
        store.add_user("alice", "wonderland");
        let mut header = receiver_knowing(vec![Arc::clone(&token)]);
        header.set_credential_store(Arc::new(store)).unwrap();
        let processed = header.process(wire).unwrap();
        let security = processed.security;
        assert_eq!(security.signed_tokens.len(), 1);
        assert!(security.basic_tokens.is_empty());
        assert!(security.claims.contains(&Claim::new(ClaimType::Name, "alice")));
    }

    // --- Rejections ---

    #[test]
    fn test_tampered_body_rejected() {
        let token = session();
        let wire = send(&token, MessageProtectionOrder::SignBeforeEncrypt, false);
        let tampered = Message::from_xml(&wire.to_xml().replace(">payload<", ">forged<")).unwrap();
        let err = receiver(&token, MessageProtectionOrder::SignBeforeEncrypt, false)
            .process(tampered)
            .unwrap_err();
        assert!(matches!(
            err.as_message_security(),
            Some(MessageSecurityError::DigestMismatch(_))
        ));
    }

    #[test]
    fn test_unencrypted_body_rejected_when_encryption_required() {
        let token = session();
        let wire = send(&token, MessageProtectionOrder::SignBeforeEncrypt, false);
        let err = receiver(&token, MessageProtectionOrder::SignBeforeEncrypt, true)
            .process(wire)
            .unwrap_err();
        assert_eq!(
            err.as_message_security(),
            Some(&MessageSecurityError::PartNotEncrypted("Body".to_string()))
        );
    }

    fn with_offset(wire: &Message, offset: &str) -> Message {
        let xml = wire.to_xml();
        assert!(xml.contains("Offset>0<"));
        Message::from_xml(&xml.replace("Offset>0<", &format!("Offset>{}<", offset))).unwrap()
    }

    #[test]
    fn test_derived_key_offset_bounded() {
        let token = session();
        let wire = with_offset(&send(&token, MessageProtectionOrder::SignBeforeEncrypt, true), "20000000");
        let err = receiver(&token, MessageProtectionOrder::SignBeforeEncrypt, true)
            .process(wire)
            .unwrap_err();
        assert!(matches!(
            err.as_message_security(),
            Some(MessageSecurityError::DerivedKeyTooLong { requested, max: 64 }) if *requested > 20_000_000
        ));
    }

    #[test]
    fn test_derived_key_offset_overflow_rejected() {
        let token = session();
        let wire = with_offset(
            &send(&token, MessageProtectionOrder::SignBeforeEncrypt, true),
            "18446744073709551615",
        );
        let err = receiver(&token, MessageProtectionOrder::SignBeforeEncrypt, true)
            .process(wire)
            .unwrap_err();
        assert!(matches!(
            err.as_message_security(),
            Some(MessageSecurityError::Malformed { element: "DerivedKeyToken", .. })
        ));
    }

    #[test]
    fn test_missing_security_header() {
        let token = session();
        let err = receiver(&token, MessageProtectionOrder::SignBeforeEncrypt, true)
            .process(message())
            .unwrap_err();
        assert_eq!(
            err.as_message_security(),
            Some(&MessageSecurityError::MissingSecurityHeader)
        );
    }

    #[test]
    fn test_unknown_session_rejected() {
        let wire = send(&session(), MessageProtectionOrder::SignBeforeEncrypt, true);
        let err = receiver(&session(), MessageProtectionOrder::SignBeforeEncrypt, true)
            .process(wire)
            .unwrap_err();
        assert!(matches!(
            err.as_message_security(),
            Some(MessageSecurityError::TokenUnavailable(_))
        ));
    }

    #[test]
    fn test_unknown_header_child_rejected() {
        let mut wire = message();
        wire.set_security_header(
            XmlElement::new("o", node::SECURITY, WSSE_NS).with_child(XmlElement::new("x", "Custom", "urn:x")),
        );
        let err = receiver(&session(), MessageProtectionOrder::SignBeforeEncrypt, true)
            .process(wire)
            .unwrap_err();
        assert_eq!(
            err.as_message_security(),
            Some(&MessageSecurityError::UnexpectedElement("x:Custom".to_string()))
        );
    }

    #[test]
    fn test_replay_detected() {
        let token = session();
        let wire = send(&token, MessageProtectionOrder::SignBeforeEncrypt, true);
        let cache: Arc<dyn NonceCache> = Arc::new(InMemoryNonceCache::new(Duration::from_secs(600), 100));

        let mut first = receiver(&token, MessageProtectionOrder::SignBeforeEncrypt, true);
        first.set_nonce_cache(Arc::clone(&cache)).unwrap();
        first.process(wire.clone()).unwrap();

        let mut second = receiver(&token, MessageProtectionOrder::SignBeforeEncrypt, true);
        second.set_nonce_cache(cache).unwrap();
        let err = second.process(wire).unwrap_err();
        assert_eq!(
            err.as_message_security(),
            Some(&MessageSecurityError::ReplayDetected)
        );
        assert_eq!(second.state(), ReceiveState::Faulted);
    }

    #[test]
    fn test_header_processes_once() {
        let token = session();
        let mut header = receiver(&token, MessageProtectionOrder::SignBeforeEncrypt, true);
        header
            .process(send(&token, MessageProtectionOrder::SignBeforeEncrypt, true))
            .unwrap();
        let err = header
            .process(send(&token, MessageProtectionOrder::SignBeforeEncrypt, true))
            .unwrap_err();
        assert!(matches!(err.as_usage(), Some(UsageError::InvalidState { .. })));
        assert_eq!(
            header.set_require_signature(false),
            Err(UsageError::ObjectImmutable(OBJECT))
        );
    }
}
