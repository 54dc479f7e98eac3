//! Namespace URIs, element names and per-version standards selection.
//!
//! The protocol core never hard-codes a WS-* version. It asks a
//! [`StandardsDriver`] for the names it needs, and the driver is built once
//! from configuration and passed down explicitly.

use serde::{Deserialize, Serialize};

/// SOAP namespace URIs.
pub const SOAP_11_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const SOAP_12_NS: &str = "http://www.w3.org/2003/05/soap-envelope";

/// WS-Addressing 1.0.
pub const WSA_NS: &str = "http://www.w3.org/2005/08/addressing";

/// WS-Security 1.0 extension and utility namespaces.
pub const WSSE_NS: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd";
pub const WSU_NS: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd";
/// WS-Security 1.1 extension namespace.
pub const WSSE11_NS: &str = "http://docs.oasis-open.org/wss/oasis-wss-wssecurity-secext-1.1.xsd";

/// XML-DSig and XML-Enc.
pub const DSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const XENC_NS: &str = "http://www.w3.org/2001/04/xmlenc#";

/// Token profile value types.
pub const X509V3_VALUE_TYPE: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-x509-token-profile-1.0#X509v3";
pub const BASE64_ENCODING_TYPE: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-soap-message-security-1.0#Base64Binary";
pub const PASSWORD_TEXT_TYPE: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordText";
pub const PASSWORD_DIGEST_TYPE: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordDigest";

/// XML-Enc EncryptedData types.
pub const ENC_TYPE_CONTENT: &str = "http://www.w3.org/2001/04/xmlenc#Content";
pub const ENC_TYPE_ELEMENT: &str = "http://www.w3.org/2001/04/xmlenc#Element";

/// Preferred prefixes used when writing.
pub mod prefix {
    pub const SOAP: &str = "s";
    pub const WSA: &str = "a";
    pub const WSSE: &str = "o";
    pub const WSU: &str = "u";
    pub const WSSE11: &str = "k";
    pub const DSIG: &str = "ds";
    pub const XENC: &str = "e";
    pub const WSC: &str = "c";
    pub const TRUST: &str = "t";
}

/// Element local names.
pub mod node {
    pub const ENVELOPE: &str = "Envelope";
    pub const HEADER: &str = "Header";
    pub const BODY: &str = "Body";
    pub const ACTION: &str = "Action";
    pub const TO: &str = "To";

    pub const SECURITY: &str = "Security";
    pub const TIMESTAMP: &str = "Timestamp";
    pub const CREATED: &str = "Created";
    pub const EXPIRES: &str = "Expires";
    pub const SECURITY_TOKEN_REFERENCE: &str = "SecurityTokenReference";
    pub const REFERENCE: &str = "Reference";
    pub const KEY_IDENTIFIER: &str = "KeyIdentifier";
    pub const USERNAME_TOKEN: &str = "UsernameToken";
    pub const USERNAME: &str = "Username";
    pub const PASSWORD: &str = "Password";
    pub const NONCE: &str = "Nonce";
    pub const BINARY_SECURITY_TOKEN: &str = "BinarySecurityToken";
    pub const SIGNATURE_CONFIRMATION: &str = "SignatureConfirmation";
    pub const ENCRYPTED_HEADER: &str = "EncryptedHeader";

    pub const SIGNATURE: &str = "Signature";
    pub const SIGNED_INFO: &str = "SignedInfo";
    pub const CANONICALIZATION_METHOD: &str = "CanonicalizationMethod";
    pub const SIGNATURE_METHOD: &str = "SignatureMethod";
    pub const SIGNATURE_VALUE: &str = "SignatureValue";
    pub const TRANSFORMS: &str = "Transforms";
    pub const TRANSFORM: &str = "Transform";
    pub const DIGEST_METHOD: &str = "DigestMethod";
    pub const DIGEST_VALUE: &str = "DigestValue";
    pub const KEY_INFO: &str = "KeyInfo";
    pub const X509_DATA: &str = "X509Data";
    pub const X509_CERTIFICATE: &str = "X509Certificate";

    pub const ENCRYPTED_DATA: &str = "EncryptedData";
    pub const ENCRYPTION_METHOD: &str = "EncryptionMethod";
    pub const CIPHER_DATA: &str = "CipherData";
    pub const CIPHER_VALUE: &str = "CipherValue";
    pub const REFERENCE_LIST: &str = "ReferenceList";
    pub const DATA_REFERENCE: &str = "DataReference";

    pub const SECURITY_CONTEXT_TOKEN: &str = "SecurityContextToken";
    pub const IDENTIFIER: &str = "Identifier";
    pub const INSTANCE: &str = "Instance";
    pub const DERIVED_KEY_TOKEN: &str = "DerivedKeyToken";
    pub const OFFSET: &str = "Offset";
    pub const LENGTH: &str = "Length";
    pub const LABEL: &str = "Label";
}

/// Attribute local names.
pub mod attr {
    pub const ID: &str = "Id";
    pub const URI: &str = "URI";
    pub const VALUE_TYPE: &str = "ValueType";
    pub const ENCODING_TYPE: &str = "EncodingType";
    pub const TYPE: &str = "Type";
    pub const ALGORITHM: &str = "Algorithm";
    pub const VALUE: &str = "Value";
    pub const MUST_UNDERSTAND: &str = "mustUnderstand";
    pub const NONCE: &str = "Nonce";
    pub const LENGTH: &str = "Length";
    pub const INSTANCE: &str = "Instance";
    pub const CONTEXT: &str = "Context";
}

/// WS-Security message security version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SecurityVersion {
    /// OASIS WSS 1.0 (January 2004)
    #[serde(rename = "1.0")]
    WsSecurity10,
    /// OASIS WSS 1.1 (adds SignatureConfirmation and EncryptedHeader)
    #[default]
    #[serde(rename = "1.1")]
    WsSecurity11,
}

impl SecurityVersion {
    pub fn supports_signature_confirmation(&self) -> bool {
        matches!(self, Self::WsSecurity11)
    }

    pub fn supports_encrypted_headers(&self) -> bool {
        matches!(self, Self::WsSecurity11)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::WsSecurity10 => "WS-Security 1.0",
            Self::WsSecurity11 => "WS-Security 1.1",
        }
    }
}

/// WS-Trust version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TrustVersion {
    /// WS-Trust February 2005
    Feb2005,
    /// WS-Trust 1.3 (December 2005 draft, OASIS namespace)
    #[default]
    Dec2005,
}

impl TrustVersion {
    pub fn namespace(&self) -> &'static str {
        match self {
            Self::Feb2005 => "http://schemas.xmlsoap.org/ws/2005/02/trust",
            Self::Dec2005 => "http://docs.oasis-open.org/ws-sx/ws-trust/200512",
        }
    }

    pub fn issue_request_type(&self) -> String {
        format!("{}/Issue", self.namespace())
    }

    pub fn nonce_binary_secret_type(&self) -> String {
        format!("{}/Nonce", self.namespace())
    }

    pub fn psha1_computed_key(&self) -> String {
        format!("{}/CK/PSHA1", self.namespace())
    }

    /// Whether the issuer wraps its final response in a collection.
    pub fn uses_response_collection(&self) -> bool {
        matches!(self, Self::Dec2005)
    }
}

/// WS-SecureConversation version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SecureConversationVersion {
    /// WS-SecureConversation February 2005
    Feb2005,
    /// WS-SecureConversation 1.3 (December 2005 draft, OASIS namespace)
    #[default]
    Dec2005,
}

impl SecureConversationVersion {
    pub fn namespace(&self) -> &'static str {
        match self {
            Self::Feb2005 => "http://schemas.xmlsoap.org/ws/2005/02/sc",
            Self::Dec2005 => "http://docs.oasis-open.org/ws-sx/ws-secureconversation/200512",
        }
    }

    /// Token type URI of a security context token.
    pub fn token_type(&self) -> String {
        format!("{}/sct", self.namespace())
    }

    /// Default label mixed into P_SHA1 derivation.
    pub fn default_derivation_label(&self) -> &'static str {
        "WS-SecureConversationWS-SecureConversation"
    }

    pub fn derived_key_token_type(&self) -> String {
        format!("{}/dk", self.namespace())
    }
}

/// Explicit bundle of the standards in force for one protocol factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StandardsDriver {
    pub security: SecurityVersion,
    pub trust: TrustVersion,
    pub secure_conversation: SecureConversationVersion,
}

impl StandardsDriver {
    pub fn new(
        security: SecurityVersion,
        trust: TrustVersion,
        secure_conversation: SecureConversationVersion,
    ) -> Self {
        Self {
            security,
            trust,
            secure_conversation,
        }
    }

    /// Action URI of a session token request.
    pub fn request_action(&self) -> String {
        format!("{}/RST/SCT", self.trust.namespace())
    }

    /// Action URI of a session token response.
    pub fn response_action(&self) -> String {
        match self.trust {
            TrustVersion::Feb2005 => format!("{}/RSTR/SCT", self.trust.namespace()),
            TrustVersion::Dec2005 => format!("{}/RSTRC/IssueFinal", self.trust.namespace()),
        }
    }

    /// Namespace of the security context and derived key tokens.
    pub fn secure_conversation_namespace(&self) -> &'static str {
        self.secure_conversation.namespace()
    }

    /// Whether a security header child with this namespace is recognized.
    pub fn is_known_security_namespace(&self, ns: &str) -> bool {
        ns == WSSE_NS
            || ns == WSU_NS
            || ns == DSIG_NS
            || ns == XENC_NS
            || ns == self.secure_conversation.namespace()
            || (self.security.supports_signature_confirmation() && ns == WSSE11_NS)
    }
}
