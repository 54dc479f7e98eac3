//! SOAP message model.

use serde::{Deserialize, Serialize};

use crate::error::{Error, MessageSecurityError, SoapFaultVersion, XmlError};
use crate::serializer::malformed;
use crate::standards::{attr, node, prefix, SOAP_11_NS, SOAP_12_NS, WSA_NS, WSSE_NS};
use crate::xml::{parse_document_with_depth, XmlElement, XmlNode, DEFAULT_MAX_DEPTH};

/// SOAP envelope version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SoapVersion {
    #[serde(rename = "1.1")]
    Soap11,
    #[default]
    #[serde(rename = "1.2")]
    Soap12,
}

impl SoapVersion {
    pub fn namespace(&self) -> &'static str {
        match self {
            Self::Soap11 => SOAP_11_NS,
            Self::Soap12 => SOAP_12_NS,
        }
    }

    pub fn from_namespace(ns: &str) -> Option<Self> {
        match ns {
            SOAP_11_NS => Some(Self::Soap11),
            SOAP_12_NS => Some(Self::Soap12),
            _ => None,
        }
    }

    pub fn fault_version(&self) -> SoapFaultVersion {
        match self {
            Self::Soap11 => SoapFaultVersion::Soap11,
            Self::Soap12 => SoapFaultVersion::Soap12,
        }
    }
}

/// A SOAP message: addressing and application headers, an optional
/// security header and the body.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    version: SoapVersion,
    headers: Vec<XmlElement>,
    security: Option<XmlElement>,
    body: XmlElement,
}

impl Message {
    /// Message with an `Action` header and one payload element.
    pub fn new(version: SoapVersion, action: &str, payload: XmlElement) -> Self {
        let body = XmlElement::new(prefix::SOAP, node::BODY, version.namespace()).with_child(payload);
        let mut message = Self {
            version,
            headers: Vec::new(),
            security: None,
            body,
        };
        message.set_action(action);
        message
    }

    /// Parse a SOAP envelope.
    pub fn from_xml(xml: &str) -> Result<Self, Error> {
        Self::from_xml_with_depth(xml, DEFAULT_MAX_DEPTH)
    }

    /// Parse a SOAP envelope whose elements nest at most `max_depth` levels.
    pub fn from_xml_with_depth(xml: &str, max_depth: usize) -> Result<Self, Error> {
        let envelope = parse_document_with_depth(xml, max_depth)?;
        let version = envelope
            .namespace
            .as_deref()
            .filter(|_| envelope.local_name == node::ENVELOPE)
            .and_then(SoapVersion::from_namespace)
            .ok_or_else(|| {
                XmlError::InvalidEnvelope(format!("root element is {}", envelope.qname()))
            })?;
        let ns = version.namespace();

        let mut headers = Vec::new();
        let mut security = None;
        let mut body = None;
        for child in envelope.children {
            let XmlNode::Element(child) = child else {
                continue;
            };
            if child.is(ns, node::HEADER) {
                if body.is_some() {
                    return Err(XmlError::InvalidEnvelope("Header after Body".to_string()).into());
                }
                for header in child.children {
                    let XmlNode::Element(header) = header else {
                        continue;
                    };
                    if header.is(WSSE_NS, node::SECURITY) {
                        if security.is_some() {
                            return Err(malformed("Security", "more than one security header").into());
                        }
                        security = Some(header);
                    } else {
                        headers.push(header);
                    }
                }
            } else if child.is(ns, node::BODY) {
                if body.is_some() {
                    return Err(XmlError::InvalidEnvelope("more than one Body".to_string()).into());
                }
                body = Some(child);
            } else {
                return Err(
                    XmlError::InvalidEnvelope(format!("unexpected element {}", child.qname())).into(),
                );
            }
        }
        let body = body.ok_or_else(|| XmlError::InvalidEnvelope("missing Body".to_string()))?;
        Ok(Self {
            version,
            headers,
            security,
            body,
        })
    }

    /// Serialize the envelope.
    pub fn to_xml(&self) -> String {
        let ns = self.version.namespace();
        let mut header = XmlElement::new(prefix::SOAP, node::HEADER, ns);
        for h in &self.headers {
            header.push_child(h.clone());
        }
        if let Some(security) = &self.security {
            header.push_child(security.clone());
        }
        let mut envelope = XmlElement::new(prefix::SOAP, node::ENVELOPE, ns);
        if !header.children.is_empty() {
            envelope.push_child(header);
        }
        envelope.push_child(self.body.clone());
        envelope.to_xml()
    }

    pub fn version(&self) -> SoapVersion {
        self.version
    }

    // --- Addressing ---

    pub fn action(&self) -> Option<String> {
        self.header(WSA_NS, node::ACTION).map(|h| h.text().trim().to_string())
    }

    pub fn set_action(&mut self, action: &str) {
        let element = XmlElement::new(prefix::WSA, node::ACTION, WSA_NS)
            .with_ns_attr(prefix::SOAP, attr::MUST_UNDERSTAND, self.version.namespace(), "1")
            .with_text(action);
        self.replace_header(element);
    }

    pub fn to(&self) -> Option<String> {
        self.header(WSA_NS, node::TO).map(|h| h.text().trim().to_string())
    }

    pub fn set_to(&mut self, to: &str) {
        let element = XmlElement::new(prefix::WSA, node::TO, WSA_NS)
            .with_ns_attr(prefix::SOAP, attr::MUST_UNDERSTAND, self.version.namespace(), "1")
            .with_text(to);
        self.replace_header(element);
    }

    // --- Headers ---

    pub fn headers(&self) -> &[XmlElement] {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Vec<XmlElement> {
        &mut self.headers
    }

    pub fn header(&self, namespace: &str, local_name: &str) -> Option<&XmlElement> {
        self.headers.iter().find(|h| h.is(namespace, local_name))
    }

    pub fn add_header(&mut self, header: XmlElement) {
        self.headers.push(header);
    }

    fn replace_header(&mut self, header: XmlElement) {
        let (ns, name) = (
            header.namespace.clone().unwrap_or_default(),
            header.local_name.clone(),
        );
        match self.headers.iter_mut().find(|h| h.is(&ns, &name)) {
            Some(existing) => *existing = header,
            None => self.headers.push(header),
        }
    }

    pub fn security_header(&self) -> Option<&XmlElement> {
        self.security.as_ref()
    }

    pub fn set_security_header(&mut self, security: XmlElement) {
        self.security = Some(security);
    }

    pub fn take_security_header(&mut self) -> Option<XmlElement> {
        self.security.take()
    }

    // --- Body ---

    pub fn body(&self) -> &XmlElement {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut XmlElement {
        &mut self.body
    }

    /// First element inside the body.
    pub fn payload(&self) -> Option<&XmlElement> {
        self.body.element_children().next()
    }

    /// Every id in the message: headers, security header and body.
    pub fn collect_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for header in &self.headers {
            header.collect_ids(&mut ids);
        }
        if let Some(security) = &self.security {
            security.collect_ids(&mut ids);
        }
        self.body.collect_ids(&mut ids);
        ids.into_iter().map(str::to_string).collect()
    }

    /// Fail on the first id used by more than one element.
    pub fn ensure_unique_ids(&self) -> Result<(), MessageSecurityError> {
        let mut seen = std::collections::HashSet::new();
        for id in self.collect_ids() {
            if !seen.insert(id.clone()) {
                return Err(MessageSecurityError::DuplicateId(id));
            }
        }
        Ok(())
    }
}
