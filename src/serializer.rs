//! Wire forms of tokens and token references.

use crate::crypto::{b64_decode, b64_encode};
use crate::error::MessageSecurityError;
use crate::standards::{
    attr, node, prefix, StandardsDriver, BASE64_ENCODING_TYPE, DSIG_NS, PASSWORD_DIGEST_TYPE,
    PASSWORD_TEXT_TYPE, WSSE_NS, WSU_NS, X509V3_VALUE_TYPE,
};
use crate::tokens::{KeyIdentifierClause, TokenReference};
use crate::xml::XmlElement;

pub(crate) fn malformed(element: &'static str, reason: impl Into<String>) -> MessageSecurityError {
    MessageSecurityError::Malformed {
        element,
        reason: reason.into(),
    }
}

fn decode(element: &'static str, text: &str) -> Result<Vec<u8>, MessageSecurityError> {
    b64_decode(text).map_err(|e| malformed(element, e.to_string()))
}

fn parse_usize(element: &'static str, text: &str) -> Result<usize, MessageSecurityError> {
    text.trim()
        .parse()
        .map_err(|_| malformed(element, format!("'{}' is not a valid length", text)))
}

/// Add a `wsu:Id` attribute.
pub fn with_wsu_id(element: XmlElement, id: &str) -> XmlElement {
    element.with_ns_attr(prefix::WSU, attr::ID, WSU_NS, id)
}

// --- Security token reference ---

/// Write a `wsse:SecurityTokenReference`.
pub fn write_reference(clause: &KeyIdentifierClause, standards: &StandardsDriver) -> XmlElement {
    let sc_ns = standards.secure_conversation_namespace();
    let mut str_element = XmlElement::new(prefix::WSSE, node::SECURITY_TOKEN_REFERENCE, WSSE_NS);
    match &clause.reference {
        TokenReference::LocalId(id) => {
            str_element.push_child(
                XmlElement::new(prefix::WSSE, node::REFERENCE, WSSE_NS)
                    .with_attr(attr::URI, format!("#{}", id)),
            );
        }
        TokenReference::SecurityContext {
            context_id,
            generation,
        } => {
            let mut reference = XmlElement::new(prefix::WSSE, node::REFERENCE, WSSE_NS)
                .with_attr(attr::URI, context_id.as_str())
                .with_attr(attr::VALUE_TYPE, standards.secure_conversation.token_type());
            if let Some(generation) = generation {
                reference.set_ns_attr(prefix::WSC, attr::INSTANCE, sc_ns, generation.as_str());
            }
            str_element.push_child(reference);
        }
        TokenReference::X509RawData(raw) => {
            str_element.push_child(
                XmlElement::new(prefix::DSIG, node::X509_DATA, DSIG_NS).with_child(
                    XmlElement::new(prefix::DSIG, node::X509_CERTIFICATE, DSIG_NS)
                        .with_text(b64_encode(raw)),
                ),
            );
        }
    }
    if let Some(derivation) = &clause.derivation {
        str_element.set_ns_attr(prefix::WSC, attr::NONCE, sc_ns, b64_encode(&derivation.nonce));
        if let Some(length) = derivation.length {
            str_element.set_ns_attr(prefix::WSC, attr::LENGTH, sc_ns, length.to_string());
        }
    }
    str_element
}

/// Read a `wsse:SecurityTokenReference`.
pub fn read_reference(
    element: &XmlElement,
    standards: &StandardsDriver,
) -> Result<KeyIdentifierClause, MessageSecurityError> {
    const NAME: &str = "SecurityTokenReference";
    if !element.is(WSSE_NS, node::SECURITY_TOKEN_REFERENCE) {
        return Err(malformed(NAME, format!("unexpected element {}", element.qname())));
    }
    let sc_ns = standards.secure_conversation_namespace();

    let mut clause = if let Some(reference) = element.child(WSSE_NS, node::REFERENCE) {
        let uri = reference
            .attr(attr::URI)
            .ok_or_else(|| malformed(NAME, "Reference has no URI"))?;
        match uri.strip_prefix('#') {
            Some(id) if !id.is_empty() => KeyIdentifierClause::local(id),
            Some(_) => return Err(malformed(NAME, "empty local reference")),
            None => {
                let value_type = reference.attr(attr::VALUE_TYPE);
                if value_type != Some(standards.secure_conversation.token_type().as_str()) {
                    return Err(malformed(
                        NAME,
                        format!("unsupported reference value type {:?}", value_type),
                    ));
                }
                let generation = reference.ns_attr(sc_ns, attr::INSTANCE).map(str::to_string);
                KeyIdentifierClause::security_context(uri, generation)
            }
        }
    } else if let Some(data) = element.child(DSIG_NS, node::X509_DATA) {
        let cert = data
            .child_text(DSIG_NS, node::X509_CERTIFICATE)
            .ok_or_else(|| malformed(NAME, "X509Data has no certificate"))?;
        KeyIdentifierClause::x509(decode(NAME, &cert)?)
    } else {
        return Err(malformed(NAME, "no supported reference form"));
    };

    if let Some(nonce) = element.ns_attr(sc_ns, attr::NONCE) {
        let length = element
            .ns_attr(sc_ns, attr::LENGTH)
            .map(|l| parse_usize(NAME, l))
            .transpose()?;
        clause = clause.with_derivation(decode(NAME, nonce)?, length);
    }
    Ok(clause)
}

/// Write `ds:KeyInfo` holding a token reference.
pub fn write_key_info(clause: &KeyIdentifierClause, standards: &StandardsDriver) -> XmlElement {
    XmlElement::new(prefix::DSIG, node::KEY_INFO, DSIG_NS).with_child(write_reference(clause, standards))
}

/// Read the token reference inside `ds:KeyInfo`.
pub fn read_key_info(
    element: &XmlElement,
    standards: &StandardsDriver,
) -> Result<KeyIdentifierClause, MessageSecurityError> {
    let reference = element
        .child(WSSE_NS, node::SECURITY_TOKEN_REFERENCE)
        .ok_or_else(|| malformed("KeyInfo", "no SecurityTokenReference"))?;
    read_reference(reference, standards)
}

// --- Security context token ---

/// Wire form of a security context token. Carries no key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityContextTokenData {
    pub id: String,
    pub context_id: String,
    pub generation: Option<String>,
}

pub fn write_security_context_token(
    data: &SecurityContextTokenData,
    standards: &StandardsDriver,
) -> XmlElement {
    let ns = standards.secure_conversation_namespace();
    let mut element = with_wsu_id(
        XmlElement::new(prefix::WSC, node::SECURITY_CONTEXT_TOKEN, ns),
        &data.id,
    )
    .with_child(XmlElement::new(prefix::WSC, node::IDENTIFIER, ns).with_text(data.context_id.as_str()));
    if let Some(generation) = &data.generation {
        element.push_child(XmlElement::new(prefix::WSC, node::INSTANCE, ns).with_text(generation.as_str()));
    }
    element
}

pub fn read_security_context_token(
    element: &XmlElement,
    standards: &StandardsDriver,
) -> Result<SecurityContextTokenData, MessageSecurityError> {
    const NAME: &str = "SecurityContextToken";
    let ns = standards.secure_conversation_namespace();
    let id = element
        .id()
        .ok_or_else(|| malformed(NAME, "missing Id"))?
        .to_string();
    let context_id = element
        .child_text(ns, node::IDENTIFIER)
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| malformed(NAME, "missing Identifier"))?;
    let generation = element
        .child_text(ns, node::INSTANCE)
        .map(|t| t.trim().to_string());
    Ok(SecurityContextTokenData {
        id,
        context_id,
        generation,
    })
}

// --- Derived key token ---

/// Wire form of an explicit derived key token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedKeyTokenData {
    pub id: String,
    pub base: KeyIdentifierClause,
    pub offset: usize,
    pub length: usize,
    pub label: Option<String>,
    pub nonce: Vec<u8>,
}

pub fn write_derived_key_token(data: &DerivedKeyTokenData, standards: &StandardsDriver) -> XmlElement {
    let ns = standards.secure_conversation_namespace();
    let mut element = with_wsu_id(XmlElement::new(prefix::WSC, node::DERIVED_KEY_TOKEN, ns), &data.id)
        .with_child(write_reference(&data.base, standards))
        .with_child(XmlElement::new(prefix::WSC, node::OFFSET, ns).with_text(data.offset.to_string()))
        .with_child(XmlElement::new(prefix::WSC, node::LENGTH, ns).with_text(data.length.to_string()));
    if let Some(label) = &data.label {
        element.push_child(XmlElement::new(prefix::WSC, node::LABEL, ns).with_text(label.as_str()));
    }
    element.push_child(XmlElement::new(prefix::WSC, node::NONCE, ns).with_text(b64_encode(&data.nonce)));
    element
}

pub fn read_derived_key_token(
    element: &XmlElement,
    standards: &StandardsDriver,
) -> Result<DerivedKeyTokenData, MessageSecurityError> {
    const NAME: &str = "DerivedKeyToken";
    let ns = standards.secure_conversation_namespace();
    if let Some(algorithm) = element.attr(attr::ALGORITHM) {
        if algorithm != crate::algorithms::PSHA1_KEY_DERIVATION {
            return Err(MessageSecurityError::UnsupportedAlgorithm(algorithm.to_string()));
        }
    }
    let id = element
        .id()
        .ok_or_else(|| malformed(NAME, "missing Id"))?
        .to_string();
    let base = element
        .child(WSSE_NS, node::SECURITY_TOKEN_REFERENCE)
        .ok_or_else(|| malformed(NAME, "missing SecurityTokenReference"))
        .and_then(|r| read_reference(r, standards))?;
    let offset = element
        .child_text(ns, node::OFFSET)
        .map(|t| parse_usize(NAME, &t))
        .transpose()?
        .unwrap_or(0);
    let length = element
        .child_text(ns, node::LENGTH)
        .ok_or_else(|| malformed(NAME, "missing Length"))
        .and_then(|t| parse_usize(NAME, &t))?;
    if offset.checked_add(length).is_none() {
        return Err(malformed(NAME, "Offset plus Length overflows"));
    }
    let label = element.child_text(ns, node::LABEL);
    let nonce = element
        .child_text(ns, node::NONCE)
        .ok_or_else(|| malformed(NAME, "missing Nonce"))
        .and_then(|t| decode(NAME, &t))?;
    Ok(DerivedKeyTokenData {
        id,
        base,
        offset,
        length,
        label,
        nonce,
    })
}

// --- Username token ---

/// How a username token carries its password.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
pub enum PasswordType {
    /// Plain text password (only safe under encryption)
    #[serde(rename = "PasswordText")]
    PasswordText,
    /// `Base64(SHA1(nonce + created + password))`
    #[default]
    #[serde(rename = "PasswordDigest")]
    PasswordDigest,
}

impl PasswordType {
    pub fn uri(&self) -> &'static str {
        match self {
            Self::PasswordText => PASSWORD_TEXT_TYPE,
            Self::PasswordDigest => PASSWORD_DIGEST_TYPE,
        }
    }
}

/// Wire form of a username token.
#[derive(Clone, PartialEq, Eq)]
pub struct UsernameTokenData {
    pub id: String,
    pub username: String,
    pub password: String,
    pub password_type: PasswordType,
    pub nonce: Option<Vec<u8>>,
    pub created: Option<String>,
}

impl std::fmt::Debug for UsernameTokenData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsernameTokenData")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("password_type", &self.password_type)
            .finish_non_exhaustive()
    }
}

pub fn write_username_token(data: &UsernameTokenData) -> XmlElement {
    let mut element = with_wsu_id(XmlElement::new(prefix::WSSE, node::USERNAME_TOKEN, WSSE_NS), &data.id)
        .with_child(XmlElement::new(prefix::WSSE, node::USERNAME, WSSE_NS).with_text(data.username.as_str()))
        .with_child(
            XmlElement::new(prefix::WSSE, node::PASSWORD, WSSE_NS)
                .with_attr(attr::TYPE, data.password_type.uri())
                .with_text(data.password.as_str()),
        );
    if let Some(nonce) = &data.nonce {
        element.push_child(
            XmlElement::new(prefix::WSSE, node::NONCE, WSSE_NS)
                .with_attr(attr::ENCODING_TYPE, BASE64_ENCODING_TYPE)
                .with_text(b64_encode(nonce)),
        );
    }
    if let Some(created) = &data.created {
        element.push_child(XmlElement::new(prefix::WSU, node::CREATED, WSU_NS).with_text(created.as_str()));
    }
    element
}

pub fn read_username_token(element: &XmlElement) -> Result<UsernameTokenData, MessageSecurityError> {
    const NAME: &str = "UsernameToken";
    let id = element
        .id()
        .ok_or_else(|| malformed(NAME, "missing Id"))?
        .to_string();
    let username = element
        .child_text(WSSE_NS, node::USERNAME)
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .ok_or_else(|| malformed(NAME, "missing Username"))?;
    let password_element = element
        .child(WSSE_NS, node::PASSWORD)
        .ok_or_else(|| malformed(NAME, "missing Password"))?;
    let password_type = match password_element.attr(attr::TYPE) {
        None => PasswordType::PasswordText,
        Some(t) if t == PASSWORD_TEXT_TYPE => PasswordType::PasswordText,
        Some(t) if t == PASSWORD_DIGEST_TYPE => PasswordType::PasswordDigest,
        Some(t) => return Err(malformed(NAME, format!("unsupported password type {}", t))),
    };
    let nonce = element
        .child_text(WSSE_NS, node::NONCE)
        .map(|n| decode(NAME, &n))
        .transpose()?;
    let created = element
        .child_text(WSU_NS, node::CREATED)
        .map(|c| c.trim().to_string());
    Ok(UsernameTokenData {
        id,
        username,
        password: password_element.text(),
        password_type,
        nonce,
        created,
    })
}

// --- Binary security token ---

pub fn write_x509_token(id: &str, raw_data: &[u8]) -> XmlElement {
    with_wsu_id(
        XmlElement::new(prefix::WSSE, node::BINARY_SECURITY_TOKEN, WSSE_NS),
        id,
    )
    .with_attr(attr::VALUE_TYPE, X509V3_VALUE_TYPE)
    .with_attr(attr::ENCODING_TYPE, BASE64_ENCODING_TYPE)
    .with_text(b64_encode(raw_data))
}

/// Read an X.509 binary security token into (id, raw certificate).
pub fn read_x509_token(element: &XmlElement) -> Result<(String, Vec<u8>), MessageSecurityError> {
    const NAME: &str = "BinarySecurityToken";
    let id = element
        .id()
        .ok_or_else(|| malformed(NAME, "missing Id"))?
        .to_string();
    if element.attr(attr::VALUE_TYPE) != Some(X509V3_VALUE_TYPE) {
        return Err(malformed(NAME, "only X509v3 binary tokens are supported"));
    }
    if let Some(encoding) = element.attr(attr::ENCODING_TYPE) {
        if encoding != BASE64_ENCODING_TYPE {
            return Err(malformed(NAME, format!("unsupported encoding {}", encoding)));
        }
    }
    Ok((id, decode(NAME, &element.text())?))
}
