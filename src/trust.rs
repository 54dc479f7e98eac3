//! WS-Trust request and response messages for session token issuance.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{b64_decode, b64_encode, psha1, SymmetricKey};
use crate::error::MessageSecurityError;
use crate::serializer::{
    malformed, read_security_context_token, write_security_context_token, SecurityContextTokenData,
};
use crate::standards::{node as wsnode, prefix, StandardsDriver, TrustVersion, WSU_NS};
use crate::xml::XmlElement;

mod node {
    pub const RST: &str = "RequestSecurityToken";
    pub const RSTR: &str = "RequestSecurityTokenResponse";
    pub const RSTRC: &str = "RequestSecurityTokenResponseCollection";
    pub const TOKEN_TYPE: &str = "TokenType";
    pub const REQUEST_TYPE: &str = "RequestType";
    pub const KEY_SIZE: &str = "KeySize";
    pub const ENTROPY: &str = "Entropy";
    pub const BINARY_SECRET: &str = "BinarySecret";
    pub const COMPUTED_KEY: &str = "ComputedKey";
    pub const REQUESTED_SECURITY_TOKEN: &str = "RequestedSecurityToken";
    pub const REQUESTED_PROOF_TOKEN: &str = "RequestedProofToken";
    pub const LIFETIME: &str = "Lifetime";
}

/// Who contributes key material to the issued session key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum KeyEntropyMode {
    /// The requester's entropy is the key
    RequesterEntropy,
    /// The issuer's entropy is the key
    ProviderEntropy,
    /// P_SHA1 over both
    #[default]
    CombinedEntropy,
}

impl KeyEntropyMode {
    pub fn requester_contributes(&self) -> bool {
        matches!(self, Self::RequesterEntropy | Self::CombinedEntropy)
    }

    pub fn issuer_contributes(&self) -> bool {
        matches!(self, Self::ProviderEntropy | Self::CombinedEntropy)
    }
}

/// Combined key: `P_SHA1(requester entropy, issuer entropy)`.
pub fn compute_combined_key(requester: &[u8], issuer: &[u8], key_size_bits: usize) -> SymmetricKey {
    SymmetricKey::new(psha1(requester, issuer, 0, key_size_bits / 8))
}

/// A RequestSecurityToken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSecurityToken {
    pub context: String,
    pub token_type: String,
    pub request_type: String,
    pub key_size: Option<usize>,
    pub entropy: Option<SymmetricKey>,
}

/// Proof of possession carried by a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProofToken {
    /// The key itself
    BinarySecret(SymmetricKey),
    /// The key is computed from both entropies with this algorithm
    ComputedKey(String),
}

/// Validity period of an issued token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifetime {
    pub created: DateTime<Utc>,
    pub expires: DateTime<Utc>,
}

/// A RequestSecurityTokenResponse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSecurityTokenResponse {
    pub context: String,
    pub token_type: Option<String>,
    pub token: Option<SecurityContextTokenData>,
    pub proof: Option<ProofToken>,
    pub entropy: Option<SymmetricKey>,
    pub key_size: Option<usize>,
    pub lifetime: Option<Lifetime>,
}

/// Version-specific reading and writing of WS-Trust messages.
pub trait TrustDriver: Send + Sync {
    fn standards(&self) -> &StandardsDriver;

    fn namespace(&self) -> &'static str {
        self.standards().trust.namespace()
    }

    fn request_action(&self) -> String {
        self.standards().request_action()
    }

    fn response_action(&self) -> String {
        self.standards().response_action()
    }

    fn write_request(&self, request: &RequestSecurityToken) -> XmlElement;

    fn read_request(&self, element: &XmlElement) -> Result<RequestSecurityToken, MessageSecurityError>;

    /// Body of the final response.
    fn write_response(&self, response: &RequestSecurityTokenResponse) -> XmlElement;

    /// Every response in a final response body.
    fn read_responses(
        &self,
        element: &XmlElement,
    ) -> Result<Vec<RequestSecurityTokenResponse>, MessageSecurityError>;
}

/// [`TrustDriver`] for WS-Trust February 2005 and 1.3.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTrustDriver {
    standards: StandardsDriver,
}

fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(element: &'static str, text: &str) -> Result<DateTime<Utc>, MessageSecurityError> {
    DateTime::parse_from_rfc3339(text.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| malformed(element, e.to_string()))
}

impl WsTrustDriver {
    pub fn new(standards: StandardsDriver) -> Self {
        Self { standards }
    }

    fn element(&self, local_name: &str) -> XmlElement {
        XmlElement::new(prefix::TRUST, local_name, self.namespace())
    }

    fn check_namespace(&self, element: &XmlElement) -> Result<(), MessageSecurityError> {
        match element.namespace.as_deref() {
            Some(ns) if ns == self.namespace() => Ok(()),
            other => Err(MessageSecurityError::UnsupportedVersion(format!(
                "trust namespace {}",
                other.unwrap_or("(none)")
            ))),
        }
    }

    fn write_entropy(&self, entropy: &SymmetricKey) -> XmlElement {
        self.element(node::ENTROPY).with_child(
            self.element(node::BINARY_SECRET)
                .with_attr("Type", self.standards.trust.nonce_binary_secret_type())
                .with_text(b64_encode(entropy.as_bytes())),
        )
    }

    fn read_binary_secret(
        &self,
        parent: &XmlElement,
        name: &'static str,
    ) -> Result<Option<SymmetricKey>, MessageSecurityError> {
        match parent.child(self.namespace(), node::BINARY_SECRET) {
            Some(secret) => b64_decode(&secret.text())
                .map(|bytes| Some(SymmetricKey::new(bytes)))
                .map_err(|e| malformed(name, e.to_string())),
            None => Ok(None),
        }
    }

    fn read_entropy(&self, parent: &XmlElement) -> Result<Option<SymmetricKey>, MessageSecurityError> {
        match parent.child(self.namespace(), node::ENTROPY) {
            Some(entropy) => self.read_binary_secret(entropy, "Entropy"),
            None => Ok(None),
        }
    }

    fn read_key_size(&self, parent: &XmlElement) -> Result<Option<usize>, MessageSecurityError> {
        parent
            .child_text(self.namespace(), node::KEY_SIZE)
            .map(|text| {
                text.trim()
                    .parse()
                    .map_err(|_| malformed("KeySize", format!("'{}' is not a number", text.trim())))
            })
            .transpose()
    }

    fn read_context(element: &XmlElement, name: &'static str) -> Result<String, MessageSecurityError> {
        element
            .attr("Context")
            .map(str::to_string)
            .ok_or_else(|| malformed(name, "missing Context"))
    }

    fn write_single_response(&self, response: &RequestSecurityTokenResponse) -> XmlElement {
        let mut rstr = self.element(node::RSTR).with_attr("Context", response.context.as_str());
        if let Some(token_type) = &response.token_type {
            rstr.push_child(self.element(node::TOKEN_TYPE).with_text(token_type.as_str()));
        }
        if let Some(token) = &response.token {
            rstr.push_child(
                self.element(node::REQUESTED_SECURITY_TOKEN)
                    .with_child(write_security_context_token(token, &self.standards)),
            );
        }
        match &response.proof {
            Some(ProofToken::BinarySecret(key)) => rstr.push_child(
                self.element(node::REQUESTED_PROOF_TOKEN).with_child(
                    self.element(node::BINARY_SECRET).with_text(b64_encode(key.as_bytes())),
                ),
            ),
            Some(ProofToken::ComputedKey(algorithm)) => rstr.push_child(
                self.element(node::REQUESTED_PROOF_TOKEN)
                    .with_child(self.element(node::COMPUTED_KEY).with_text(algorithm.as_str())),
            ),
            None => {}
        }
        if let Some(entropy) = &response.entropy {
            rstr.push_child(self.write_entropy(entropy));
        }
        if let Some(lifetime) = &response.lifetime {
            rstr.push_child(
                self.element(node::LIFETIME)
                    .with_child(
                        XmlElement::new(prefix::WSU, wsnode::CREATED, WSU_NS)
                            .with_text(format_time(&lifetime.created)),
                    )
                    .with_child(
                        XmlElement::new(prefix::WSU, wsnode::EXPIRES, WSU_NS)
                            .with_text(format_time(&lifetime.expires)),
                    ),
            );
        }
        if let Some(key_size) = response.key_size {
            rstr.push_child(self.element(node::KEY_SIZE).with_text(key_size.to_string()));
        }
        rstr
    }

    fn read_single_response(
        &self,
        element: &XmlElement,
    ) -> Result<RequestSecurityTokenResponse, MessageSecurityError> {
        const NAME: &str = "RequestSecurityTokenResponse";
        self.check_namespace(element)?;
        if element.local_name != node::RSTR {
            return Err(MessageSecurityError::UnexpectedElement(element.qname()));
        }
        let ns = self.namespace();
        let token = element
            .child(ns, node::REQUESTED_SECURITY_TOKEN)
            .map(|requested| {
                requested
                    .element_children()
                    .next()
                    .ok_or_else(|| malformed(NAME, "empty RequestedSecurityToken"))
                    .and_then(|t| read_security_context_token(t, &self.standards))
            })
            .transpose()?;
        let proof = match element.child(ns, node::REQUESTED_PROOF_TOKEN) {
            Some(proof) => {
                if let Some(computed) = proof.child_text(ns, node::COMPUTED_KEY) {
                    Some(ProofToken::ComputedKey(computed.trim().to_string()))
                } else {
                    let secret = self
                        .read_binary_secret(proof, NAME)?
                        .ok_or_else(|| malformed(NAME, "unsupported proof token"))?;
                    Some(ProofToken::BinarySecret(secret))
                }
            }
            None => None,
        };
        let lifetime = match element.child(ns, node::LIFETIME) {
            Some(lifetime) => {
                let created = lifetime
                    .child_text(WSU_NS, wsnode::CREATED)
                    .ok_or_else(|| malformed("Lifetime", "missing Created"))?;
                let expires = lifetime
                    .child_text(WSU_NS, wsnode::EXPIRES)
                    .ok_or_else(|| malformed("Lifetime", "missing Expires"))?;
                Some(Lifetime {
                    created: parse_time("Lifetime", &created)?,
                    expires: parse_time("Lifetime", &expires)?,
                })
            }
            None => None,
        };
        Ok(RequestSecurityTokenResponse {
            context: Self::read_context(element, NAME)?,
            token_type: element.child_text(ns, node::TOKEN_TYPE).map(|t| t.trim().to_string()),
            token,
            proof,
            entropy: self.read_entropy(element)?,
            key_size: self.read_key_size(element)?,
            lifetime,
        })
    }
}

impl TrustDriver for WsTrustDriver {
    fn standards(&self) -> &StandardsDriver {
        &self.standards
    }

    fn write_request(&self, request: &RequestSecurityToken) -> XmlElement {
        let mut rst = self
            .element(node::RST)
            .with_attr("Context", request.context.as_str())
            .with_child(self.element(node::TOKEN_TYPE).with_text(request.token_type.as_str()))
            .with_child(self.element(node::REQUEST_TYPE).with_text(request.request_type.as_str()));
        if let Some(entropy) = &request.entropy {
            rst.push_child(self.write_entropy(entropy));
        }
        if let Some(key_size) = request.key_size {
            rst.push_child(self.element(node::KEY_SIZE).with_text(key_size.to_string()));
        }
        rst
    }

    fn read_request(&self, element: &XmlElement) -> Result<RequestSecurityToken, MessageSecurityError> {
        const NAME: &str = "RequestSecurityToken";
        self.check_namespace(element)?;
        if element.local_name != node::RST {
            return Err(MessageSecurityError::UnexpectedElement(element.qname()));
        }
        let ns = self.namespace();
        Ok(RequestSecurityToken {
            context: Self::read_context(element, NAME)?,
            token_type: element
                .child_text(ns, node::TOKEN_TYPE)
                .map(|t| t.trim().to_string())
                .ok_or_else(|| malformed(NAME, "missing TokenType"))?,
            request_type: element
                .child_text(ns, node::REQUEST_TYPE)
                .map(|t| t.trim().to_string())
                .ok_or_else(|| malformed(NAME, "missing RequestType"))?,
            key_size: self.read_key_size(element)?,
            entropy: self.read_entropy(element)?,
        })
    }

    fn write_response(&self, response: &RequestSecurityTokenResponse) -> XmlElement {
        let rstr = self.write_single_response(response);
        match self.standards.trust {
            TrustVersion::Dec2005 => self.element(node::RSTRC).with_child(rstr),
            TrustVersion::Feb2005 => rstr,
        }
    }

    fn read_responses(
        &self,
        element: &XmlElement,
    ) -> Result<Vec<RequestSecurityTokenResponse>, MessageSecurityError> {
        self.check_namespace(element)?;
        let expected = if self.standards.trust.uses_response_collection() {
            node::RSTRC
        } else {
            node::RSTR
        };
        if element.local_name != expected {
            return Err(MessageSecurityError::UnexpectedElement(element.qname()));
        }
        if expected == node::RSTR {
            return Ok(vec![self.read_single_response(element)?]);
        }
        element
            .element_children()
            .map(|rstr| self.read_single_response(rstr))
            .collect()
    }
}
