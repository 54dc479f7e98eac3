//! Writing the security header of an outgoing message.

use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use tracing::debug;

use crate::algorithms::{AlgorithmCapabilities, AlgorithmSuite};
use crate::canonical::{canonicalize, canonicalize_content, CanonicalFragment};
use crate::crypto::{digest, password_digest, random_bytes, SymmetricKey};
use crate::error::{ConfigError, Error, MessageSecurityError, UsageError};
use crate::header::wire::{
    default_transforms, write_encrypted_data, write_encrypted_header, write_reference_list,
    write_signature, write_signature_confirmation, write_signed_info, EncryptedDataInfo,
    EncryptedDataType, SignatureReference,
};
use crate::header::{
    IdGenerator, MessageProtectionOrder, SignatureConfirmations, SupportingToken,
};
use crate::message::Message;
use crate::parts::MessagePartSpecification;
use crate::serializer::{
    malformed, write_derived_key_token, write_security_context_token, write_username_token,
    write_x509_token, DerivedKeyTokenData, PasswordType, SecurityContextTokenData,
    UsernameTokenData,
};
use crate::standards::{attr, node, prefix, StandardsDriver, WSSE_NS, WSU_NS};
use crate::timestamp::SecurityTimestamp;
use crate::tokens::{KeyIdentifierClause, SecurityToken, SecurityTokenParameters, TokenKind};
use crate::xml::{parse_document, XmlElement, XmlNode};

/// Bytes of nonce mixed into each derived key.
const DERIVATION_NONCE_LENGTH: usize = 16;
/// Bytes of nonce in a username token.
const USERNAME_NONCE_LENGTH: usize = 16;

const OBJECT: &str = "send security header";

/// A message with its security header applied.
#[derive(Debug, Clone)]
pub struct SecuredMessage {
    pub message: Message,
    /// Values of the primary and endorsing signatures, in header order
    pub signature_values: Vec<Vec<u8>>,
}

/// Keys and references for protecting the message with the primary token.
struct PrimaryKeys {
    signing_key: SymmetricKey,
    signing_clause: KeyIdentifierClause,
    encryption_key: SymmetricKey,
    encryption_clause: KeyIdentifierClause,
}

/// A header child waiting to be written.
struct Pending {
    element: XmlElement,
    sign: bool,
    encrypt: bool,
}

impl Pending {
    fn plain(element: XmlElement) -> Self {
        Self {
            element,
            sign: false,
            encrypt: false,
        }
    }
}

struct Endorsement {
    token: Arc<SecurityToken>,
    parameters: SecurityTokenParameters,
    included: bool,
}

/// Builds and applies the security header of one outgoing message.
///
/// Configuration is accepted until [`SendSecurityHeader::secure`] starts;
/// after that every setter fails and the header cannot be applied again.
pub struct SendSecurityHeader {
    standards: StandardsDriver,
    suite: AlgorithmSuite,
    initiator: bool,
    primary: Option<(Arc<SecurityToken>, SecurityTokenParameters)>,
    protection_order: MessageProtectionOrder,
    encrypt_signature: bool,
    include_timestamp: bool,
    timestamp_validity: Duration,
    signature_parts: MessagePartSpecification,
    encryption_parts: MessagePartSpecification,
    supporting_tokens: Vec<SupportingToken>,
    confirmations: Option<SignatureConfirmations>,
    password_type: PasswordType,
    started: bool,
    synthesized_ids: Vec<String>,
}

impl SendSecurityHeader {
    pub fn new(standards: StandardsDriver, suite: AlgorithmSuite, initiator: bool) -> Self {
        Self {
            standards,
            suite,
            initiator,
            primary: None,
            protection_order: MessageProtectionOrder::default(),
            encrypt_signature: false,
            include_timestamp: true,
            timestamp_validity: Duration::from_secs(300),
            signature_parts: MessagePartSpecification::body(),
            encryption_parts: MessagePartSpecification::body(),
            supporting_tokens: Vec::new(),
            confirmations: None,
            password_type: PasswordType::default(),
            started: false,
            synthesized_ids: Vec::new(),
        }
    }

    fn ensure_mutable(&self) -> Result<(), UsageError> {
        if self.started {
            return Err(UsageError::ObjectImmutable(OBJECT));
        }
        Ok(())
    }

    /// Token whose key signs and encrypts the message.
    pub fn set_primary_token(
        &mut self,
        token: Arc<SecurityToken>,
        parameters: SecurityTokenParameters,
    ) -> Result<(), UsageError> {
        self.ensure_mutable()?;
        self.primary = Some((token, parameters));
        Ok(())
    }

    pub fn set_protection_order(&mut self, order: MessageProtectionOrder) -> Result<(), UsageError> {
        self.ensure_mutable()?;
        self.protection_order = order;
        Ok(())
    }

    pub fn set_encrypt_signature(&mut self, encrypt: bool) -> Result<(), UsageError> {
        self.ensure_mutable()?;
        self.encrypt_signature = encrypt;
        Ok(())
    }

    pub fn set_timestamp(&mut self, include: bool, validity: Duration) -> Result<(), UsageError> {
        self.ensure_mutable()?;
        self.include_timestamp = include;
        self.timestamp_validity = validity;
        Ok(())
    }

    pub fn set_signature_parts(&mut self, parts: MessagePartSpecification) -> Result<(), UsageError> {
        self.ensure_mutable()?;
        self.signature_parts = parts;
        Ok(())
    }

    pub fn set_encryption_parts(&mut self, parts: MessagePartSpecification) -> Result<(), UsageError> {
        self.ensure_mutable()?;
        self.encryption_parts = parts;
        Ok(())
    }

    pub fn add_supporting_token(&mut self, token: SupportingToken) -> Result<(), UsageError> {
        self.ensure_mutable()?;
        self.supporting_tokens.push(token);
        Ok(())
    }

    pub fn set_signature_confirmations(
        &mut self,
        confirmations: SignatureConfirmations,
    ) -> Result<(), UsageError> {
        self.ensure_mutable()?;
        if !self.standards.security.supports_signature_confirmation() {
            return Err(UsageError::InvalidArgument {
                name: "confirmations",
                reason: format!(
                    "signature confirmation is not available in {}",
                    self.standards.security.name()
                ),
            });
        }
        self.confirmations = Some(confirmations);
        Ok(())
    }

    pub fn set_password_type(&mut self, password_type: PasswordType) -> Result<(), UsageError> {
        self.ensure_mutable()?;
        self.password_type = password_type;
        Ok(())
    }

    /// Ids added to the body and headers because they had none.
    pub fn synthesized_ids(&self) -> &[String] {
        &self.synthesized_ids
    }

    /// Apply security to `message`.
    pub fn secure(&mut self, mut message: Message) -> Result<SecuredMessage, Error> {
        if self.started || message.security_header().is_some() {
            return Err(UsageError::SecurityAlreadyApplied.into());
        }
        self.started = true;

        let caps = self.suite.capabilities();
        let mut ids = IdGenerator::new(message.collect_ids());
        let mut pending = Vec::new();

        let keys = match self.primary.clone() {
            Some((token, parameters)) => {
                Some(self.write_primary_token(&token, &parameters, &caps, &mut ids, &mut pending)?)
            }
            None => None,
        };
        let signing = keys.is_some();
        let endorsements = self.write_supporting_tokens(&mut ids, &mut pending)?;

        if self.include_timestamp {
            let timestamp = SecurityTimestamp::issue(ids.next_id(), self.timestamp_validity)?;
            pending.push(Pending {
                element: timestamp.to_xml(),
                sign: signing,
                encrypt: false,
            });
        }
        if let Some(confirmations) = &self.confirmations {
            let encrypt = confirmations.is_encrypted();
            let values: Vec<Option<&[u8]>> = if confirmations.is_empty() {
                vec![None]
            } else {
                confirmations.values().iter().map(|v| Some(v.as_slice())).collect()
            };
            for value in values {
                pending.push(Pending {
                    element: write_signature_confirmation(&ids.next_id(), value),
                    sign: signing,
                    encrypt,
                });
            }
        }

        let sign_headers = header_indices(&message, &self.signature_parts);
        let encrypt_headers = header_indices(&message, &self.encryption_parts);
        if !encrypt_headers.is_empty() && !self.standards.security.supports_encrypted_headers() {
            return Err(ConfigError::UnsupportedByVersion {
                feature: "header encryption",
                version: "WS-Security 1.1",
            }
            .into());
        }
        let sign_body = self.signature_parts.is_body_included;
        let encrypt_body =
            self.encryption_parts.is_body_included && !message.body().children.is_empty();

        let mut signature_values = Vec::new();
        let mut data_ids = Vec::new();
        let mut primary_signature = None;
        let mut endorsing_signatures = Vec::new();

        match &keys {
            Some(keys) => {
                if self.protection_order == MessageProtectionOrder::EncryptBeforeSign {
                    self.encrypt_parts(
                        &mut message,
                        &mut pending,
                        &encrypt_headers,
                        encrypt_body,
                        keys,
                        &caps,
                        &mut ids,
                        &mut data_ids,
                    )?;
                }

                let references =
                    self.collect_references(&mut message, &pending, &sign_headers, sign_body, &caps, &mut ids)?;
                if !references.is_empty() {
                    let id = ids.next_id();
                    let (primary, value) = self.compute_signature(
                        &references,
                        &keys.signing_key,
                        &keys.signing_clause,
                        &id,
                        &caps,
                    )?;
                    signature_values.push(value);
                    for endorsement in &endorsements {
                        let (signature, value) =
                            self.endorse(endorsement, &id, &primary, &caps, &mut ids)?;
                        signature_values.push(value);
                        endorsing_signatures.push(signature);
                    }
                    primary_signature = Some(primary);
                } else if !endorsements.is_empty() {
                    return Err(UsageError::InvalidArgument {
                        name: "supporting_tokens",
                        reason: "endorsing tokens require a primary signature".to_string(),
                    }
                    .into());
                }

                if self.protection_order == MessageProtectionOrder::SignBeforeEncrypt {
                    self.encrypt_parts(
                        &mut message,
                        &mut pending,
                        &encrypt_headers,
                        encrypt_body,
                        keys,
                        &caps,
                        &mut ids,
                        &mut data_ids,
                    )?;
                    if self.encrypt_signature {
                        if let Some(primary) = primary_signature.take() {
                            let (id, encrypted) = self.encrypt_element(&primary, keys, &caps, &mut ids)?;
                            data_ids.push(id);
                            primary_signature = Some(encrypted);
                        }
                    }
                }
            }
            None => {
                let wants_protection = pending.iter().any(|p| p.sign || p.encrypt)
                    || sign_body
                    || encrypt_body
                    || !sign_headers.is_empty()
                    || !encrypt_headers.is_empty()
                    || !endorsements.is_empty();
                if wants_protection {
                    return Err(MessageSecurityError::TokenUnavailable(
                        "no primary token to protect the message with".to_string(),
                    )
                    .into());
                }
            }
        }

        let mut security = XmlElement::new(prefix::WSSE, node::SECURITY, WSSE_NS).with_ns_attr(
            prefix::SOAP,
            attr::MUST_UNDERSTAND,
            message.version().namespace(),
            "1",
        );
        for slot in pending {
            security.push_child(slot.element);
        }
        let reference_list = (!data_ids.is_empty()).then(|| write_reference_list(&data_ids));
        if self.protection_order == MessageProtectionOrder::SignBeforeEncrypt {
            if let Some(list) = reference_list.clone() {
                security.push_child(list);
            }
        }
        if let Some(primary) = primary_signature {
            security.push_child(primary);
        }
        for signature in endorsing_signatures {
            security.push_child(signature);
        }
        if self.protection_order == MessageProtectionOrder::EncryptBeforeSign {
            if let Some(list) = reference_list {
                security.push_child(list);
            }
        }
        message.set_security_header(security);

        debug!(
            signatures = signature_values.len(),
            encrypted = data_ids.len(),
            order = ?self.protection_order,
            "Applied message security"
        );
        Ok(SecuredMessage {
            message,
            signature_values,
        })
    }

    fn derivation_label(&self) -> &'static str {
        self.standards.secure_conversation.default_derivation_label()
    }

    fn write_primary_token(
        &self,
        token: &SecurityToken,
        parameters: &SecurityTokenParameters,
        caps: &AlgorithmCapabilities,
        ids: &mut IdGenerator,
        pending: &mut Vec<Pending>,
    ) -> Result<PrimaryKeys, Error> {
        let key = token
            .symmetric_key()
            .ok_or_else(|| MessageSecurityError::MissingSymmetricKey(token.id().to_string()))?;
        let included = parameters.should_include(self.initiator);
        if included {
            if !ids.reserve(token.id()) {
                return Err(MessageSecurityError::DuplicateId(token.id().to_string()).into());
            }
            pending.push(Pending::plain(self.token_element(token)?));
        }
        let base = parameters.create_key_identifier_clause(token, included);
        if !parameters.require_derived_keys {
            return Ok(PrimaryKeys {
                signing_key: key.clone(),
                signing_clause: base.clone(),
                encryption_key: key.clone(),
                encryption_clause: base,
            });
        }

        let (signing_key, signing_clause) = self.write_derived_key(
            key,
            &base,
            caps.signature_key_derivation_length / 8,
            ids,
            pending,
        );
        let (encryption_key, encryption_clause) = self.write_derived_key(
            key,
            &base,
            caps.encryption_key_derivation_length / 8,
            ids,
            pending,
        );
        Ok(PrimaryKeys {
            signing_key,
            signing_clause,
            encryption_key,
            encryption_clause,
        })
    }

    fn write_derived_key(
        &self,
        key: &SymmetricKey,
        base: &KeyIdentifierClause,
        length: usize,
        ids: &mut IdGenerator,
        pending: &mut Vec<Pending>,
    ) -> (SymmetricKey, KeyIdentifierClause) {
        let nonce = random_bytes(DERIVATION_NONCE_LENGTH);
        let derived = key.derive(self.derivation_label().as_bytes(), &nonce, 0, length);
        let id = ids.next_id();
        let data = DerivedKeyTokenData {
            id: id.clone(),
            base: base.clone(),
            offset: 0,
            length,
            label: None,
            nonce,
        };
        pending.push(Pending::plain(write_derived_key_token(&data, &self.standards)));
        (derived, KeyIdentifierClause::local(id))
    }

    fn write_supporting_tokens(
        &self,
        ids: &mut IdGenerator,
        pending: &mut Vec<Pending>,
    ) -> Result<Vec<Endorsement>, Error> {
        let mut endorsements = Vec::new();
        for supporting in &self.supporting_tokens {
            let endorsing = supporting.attachment.is_endorsing();
            let included = !endorsing || supporting.parameters.should_include(self.initiator);
            if included {
                let id = supporting.token.id();
                if !ids.reserve(id) {
                    return Err(MessageSecurityError::DuplicateId(id.to_string()).into());
                }
                pending.push(Pending {
                    element: self.token_element(&supporting.token)?,
                    sign: supporting.attachment.is_signed(),
                    encrypt: supporting.encrypt,
                });
            }
            if endorsing {
                endorsements.push(Endorsement {
                    token: Arc::clone(&supporting.token),
                    parameters: supporting.parameters,
                    included,
                });
            }
        }
        Ok(endorsements)
    }

    fn token_element(&self, token: &SecurityToken) -> Result<XmlElement, Error> {
        match token.kind() {
            TokenKind::SecurityContext {
                context_id,
                generation,
                ..
            } => Ok(write_security_context_token(
                &SecurityContextTokenData {
                    id: token.id().to_string(),
                    context_id: context_id.clone(),
                    generation: generation.clone(),
                },
                &self.standards,
            )),
            TokenKind::UserName { username, password } => {
                let nonce = random_bytes(USERNAME_NONCE_LENGTH);
                let created = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
                let password = match self.password_type {
                    PasswordType::PasswordText => password.clone(),
                    PasswordType::PasswordDigest => password_digest(&nonce, &created, password),
                };
                Ok(write_username_token(&UsernameTokenData {
                    id: token.id().to_string(),
                    username: username.clone(),
                    password,
                    password_type: self.password_type,
                    nonce: Some(nonce),
                    created: Some(created),
                }))
            }
            TokenKind::X509 { raw_data } => Ok(write_x509_token(token.id(), raw_data)),
            TokenKind::DerivedKey { .. } | TokenKind::BinarySecret { .. } => {
                Err(UsageError::InvalidArgument {
                    name: "token",
                    reason: format!(
                        "{:?} tokens cannot be written to a security header",
                        token.token_type()
                    ),
                }
                .into())
            }
        }
    }

    fn collect_references(
        &mut self,
        message: &mut Message,
        pending: &[Pending],
        sign_headers: &[usize],
        sign_body: bool,
        caps: &AlgorithmCapabilities,
        ids: &mut IdGenerator,
    ) -> Result<Vec<SignatureReference>, Error> {
        let mut references = Vec::new();
        for slot in pending.iter().filter(|p| p.sign) {
            let id = slot
                .element
                .id()
                .ok_or_else(|| malformed("Security", format!("{} has no id", slot.element.qname())))?
                .to_string();
            references.push(reference_to(&slot.element, id, caps)?.0);
        }
        for &index in sign_headers {
            if let Some(header) = message.headers_mut().get_mut(index) {
                let id = ensure_id(header, ids, &mut self.synthesized_ids);
                references.push(splice_reference(header, id, caps)?);
            }
        }
        if sign_body {
            let body = message.body_mut();
            let id = ensure_id(body, ids, &mut self.synthesized_ids);
            references.push(splice_reference(body, id, caps)?);
        }
        Ok(references)
    }

    fn compute_signature(
        &self,
        references: &[SignatureReference],
        key: &SymmetricKey,
        clause: &KeyIdentifierClause,
        id: &str,
        caps: &AlgorithmCapabilities,
    ) -> Result<(XmlElement, Vec<u8>), Error> {
        let signed_info = write_signed_info(caps, references);
        let value = key.sign(caps.symmetric_signature, &canonicalize(&signed_info)?);
        let signature = write_signature(id, signed_info, &value, clause, &self.standards);
        Ok((signature, value))
    }

    fn endorse(
        &self,
        endorsement: &Endorsement,
        primary_id: &str,
        primary: &XmlElement,
        caps: &AlgorithmCapabilities,
        ids: &mut IdGenerator,
    ) -> Result<(XmlElement, Vec<u8>), Error> {
        let token = &endorsement.token;
        let key = token
            .symmetric_key()
            .ok_or_else(|| MessageSecurityError::MissingSymmetricKey(token.id().to_string()))?;
        let mut clause = endorsement
            .parameters
            .create_key_identifier_clause(token, endorsement.included);
        let key = if endorsement.parameters.require_derived_keys {
            let nonce = random_bytes(DERIVATION_NONCE_LENGTH);
            let length = caps.signature_key_derivation_length / 8;
            let derived = key.derive(self.derivation_label().as_bytes(), &nonce, 0, length);
            clause = clause.with_derivation(nonce, Some(length));
            derived
        } else {
            key.clone()
        };
        let (reference, _) = reference_to(primary, primary_id.to_string(), caps)?;
        self.compute_signature(&[reference], &key, &clause, &ids.next_id(), caps)
    }

    #[allow(clippy::too_many_arguments)]
    fn encrypt_parts(
        &self,
        message: &mut Message,
        pending: &mut [Pending],
        encrypt_headers: &[usize],
        encrypt_body: bool,
        keys: &PrimaryKeys,
        caps: &AlgorithmCapabilities,
        ids: &mut IdGenerator,
        data_ids: &mut Vec<String>,
    ) -> Result<(), Error> {
        for slot in pending.iter_mut().filter(|p| p.encrypt) {
            let (id, encrypted) = self.encrypt_element(&slot.element, keys, caps, ids)?;
            slot.element = encrypted;
            data_ids.push(id);
        }

        let soap_ns = message.version().namespace();
        for &index in encrypt_headers {
            let Some(header) = message.headers().get(index) else {
                continue;
            };
            let must_understand = header
                .ns_attr(soap_ns, attr::MUST_UNDERSTAND)
                .map(str::to_string);
            let (id, encrypted) = self.encrypt_element(header, keys, caps, ids)?;
            let wrapper = write_encrypted_header(
                &ids.next_id(),
                encrypted,
                must_understand.as_deref().map(|v| (soap_ns, v)),
            );
            message.headers_mut()[index] = wrapper;
            data_ids.push(id);
        }

        if encrypt_body {
            let content = canonicalize_content(&message.body().children)?;
            let info = EncryptedDataInfo {
                id: ids.next_id(),
                data_type: EncryptedDataType::Content,
                algorithm: caps.encryption.uri().to_string(),
                key_info: keys.encryption_clause.clone(),
                cipher_value: keys.encryption_key.encrypt(caps.encryption, content.as_bytes())?,
            };
            message.body_mut().children =
                vec![XmlNode::Element(write_encrypted_data(&info, &self.standards))];
            data_ids.push(info.id);
        }
        Ok(())
    }

    fn encrypt_element(
        &self,
        element: &XmlElement,
        keys: &PrimaryKeys,
        caps: &AlgorithmCapabilities,
        ids: &mut IdGenerator,
    ) -> Result<(String, XmlElement), Error> {
        let plaintext = canonicalize(element)?;
        let info = EncryptedDataInfo {
            id: ids.next_id(),
            data_type: EncryptedDataType::Element,
            algorithm: caps.encryption.uri().to_string(),
            key_info: keys.encryption_clause.clone(),
            cipher_value: keys.encryption_key.encrypt(caps.encryption, &plaintext)?,
        };
        Ok((info.id.clone(), write_encrypted_data(&info, &self.standards)))
    }
}

fn header_indices(message: &Message, parts: &MessagePartSpecification) -> Vec<usize> {
    message
        .headers()
        .iter()
        .enumerate()
        .filter(|(_, h)| parts.includes_header(&h.local_name, h.namespace.as_deref().unwrap_or("")))
        .map(|(i, _)| i)
        .collect()
}

fn ensure_id(element: &mut XmlElement, ids: &mut IdGenerator, synthesized: &mut Vec<String>) -> String {
    if let Some(id) = element.id() {
        return id.to_string();
    }
    let id = ids.next_id();
    element.set_ns_attr(prefix::WSU, attr::ID, WSU_NS, id.as_str());
    synthesized.push(id.clone());
    id
}

fn reference_to(
    element: &XmlElement,
    id: String,
    caps: &AlgorithmCapabilities,
) -> Result<(SignatureReference, CanonicalFragment), Error> {
    let fragment = CanonicalFragment::capture(element)?;
    let reference = SignatureReference {
        id,
        transforms: default_transforms(),
        digest_method: caps.digest.uri().to_string(),
        digest_value: digest(caps.digest, fragment.as_bytes()),
    };
    Ok((reference, fragment))
}

/// Digest an element and replace it with the reparsed canonical form that
/// was digested, so later serialization cannot drift from what was signed.
fn splice_reference(
    element: &mut XmlElement,
    id: String,
    caps: &AlgorithmCapabilities,
) -> Result<SignatureReference, Error> {
    let (reference, fragment) = reference_to(element, id, caps)?;
    *element = parse_document(fragment.as_str())?;
    Ok(reference)
}
