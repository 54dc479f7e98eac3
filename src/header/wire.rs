//! Wire forms of signatures, encrypted data and the other header elements
//! that are not tokens.

use crate::algorithms::AlgorithmCapabilities;
use crate::canonical::EXC_C14N;
use crate::crypto::{b64_decode, b64_encode};
use crate::error::MessageSecurityError;
use crate::serializer::{malformed, read_key_info, with_wsu_id, write_key_info};
use crate::standards::{
    attr, node, prefix, StandardsDriver, DSIG_NS, ENC_TYPE_CONTENT, ENC_TYPE_ELEMENT, WSSE11_NS,
    XENC_NS,
};
use crate::tokens::KeyIdentifierClause;
use crate::xml::XmlElement;

fn decode(element: &'static str, text: &str) -> Result<Vec<u8>, MessageSecurityError> {
    b64_decode(text.trim()).map_err(|e| malformed(element, e.to_string()))
}

fn local_uri(element: &'static str, uri: Option<&str>) -> Result<String, MessageSecurityError> {
    match uri.and_then(|u| u.strip_prefix('#')) {
        Some(id) if !id.is_empty() => Ok(id.to_string()),
        _ => Err(malformed(element, format!("expected a local reference, got {:?}", uri))),
    }
}

// --- Signature ---

/// One `ds:Reference` of a signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureReference {
    /// Id of the referenced element, without the leading `#`
    pub id: String,
    pub transforms: Vec<String>,
    pub digest_method: String,
    pub digest_value: Vec<u8>,
}

/// A parsed `ds:Signature`.
#[derive(Debug, Clone)]
pub struct SignatureData {
    pub id: Option<String>,
    /// `SignedInfo` exactly as received; the signature value covers its
    /// canonical form
    pub signed_info: XmlElement,
    pub canonicalization: String,
    pub signature_method: String,
    pub references: Vec<SignatureReference>,
    pub value: Vec<u8>,
    pub key_info: KeyIdentifierClause,
}

impl SignatureData {
    pub fn references_id(&self, id: &str) -> bool {
        self.references.iter().any(|r| r.id == id)
    }
}

pub fn write_signed_info(caps: &AlgorithmCapabilities, references: &[SignatureReference]) -> XmlElement {
    let mut signed_info = XmlElement::new(prefix::DSIG, node::SIGNED_INFO, DSIG_NS)
        .with_child(
            XmlElement::new(prefix::DSIG, node::CANONICALIZATION_METHOD, DSIG_NS)
                .with_attr(attr::ALGORITHM, caps.canonicalization),
        )
        .with_child(
            XmlElement::new(prefix::DSIG, node::SIGNATURE_METHOD, DSIG_NS)
                .with_attr(attr::ALGORITHM, caps.symmetric_signature.uri()),
        );
    for reference in references {
        let mut transforms = XmlElement::new(prefix::DSIG, node::TRANSFORMS, DSIG_NS);
        for transform in &reference.transforms {
            transforms.push_child(
                XmlElement::new(prefix::DSIG, node::TRANSFORM, DSIG_NS)
                    .with_attr(attr::ALGORITHM, transform.as_str()),
            );
        }
        signed_info.push_child(
            XmlElement::new(prefix::DSIG, node::REFERENCE, DSIG_NS)
                .with_attr(attr::URI, format!("#{}", reference.id))
                .with_child(transforms)
                .with_child(
                    XmlElement::new(prefix::DSIG, node::DIGEST_METHOD, DSIG_NS)
                        .with_attr(attr::ALGORITHM, reference.digest_method.as_str()),
                )
                .with_child(
                    XmlElement::new(prefix::DSIG, node::DIGEST_VALUE, DSIG_NS)
                        .with_text(b64_encode(&reference.digest_value)),
                ),
        );
    }
    signed_info
}

pub fn write_signature(
    id: &str,
    signed_info: XmlElement,
    value: &[u8],
    key_info: &KeyIdentifierClause,
    standards: &StandardsDriver,
) -> XmlElement {
    XmlElement::new(prefix::DSIG, node::SIGNATURE, DSIG_NS)
        .with_attr(attr::ID, id)
        .with_child(signed_info)
        .with_child(
            XmlElement::new(prefix::DSIG, node::SIGNATURE_VALUE, DSIG_NS).with_text(b64_encode(value)),
        )
        .with_child(write_key_info(key_info, standards))
}

pub fn read_signature(
    element: &XmlElement,
    standards: &StandardsDriver,
) -> Result<SignatureData, MessageSecurityError> {
    const NAME: &str = "Signature";
    let signed_info = element
        .child(DSIG_NS, node::SIGNED_INFO)
        .ok_or_else(|| malformed(NAME, "missing SignedInfo"))?;
    let canonicalization = signed_info
        .child(DSIG_NS, node::CANONICALIZATION_METHOD)
        .and_then(|c| c.attr(attr::ALGORITHM))
        .ok_or_else(|| malformed(NAME, "missing CanonicalizationMethod"))?
        .to_string();
    let signature_method = signed_info
        .child(DSIG_NS, node::SIGNATURE_METHOD)
        .and_then(|m| m.attr(attr::ALGORITHM))
        .ok_or_else(|| malformed(NAME, "missing SignatureMethod"))?
        .to_string();

    let mut references = Vec::new();
    for reference in signed_info
        .element_children()
        .filter(|c| c.is(DSIG_NS, node::REFERENCE))
    {
        let id = local_uri(NAME, reference.attr(attr::URI))?;
        let transforms = reference
            .child(DSIG_NS, node::TRANSFORMS)
            .map(|t| {
                t.element_children()
                    .filter(|c| c.is(DSIG_NS, node::TRANSFORM))
                    .filter_map(|c| c.attr(attr::ALGORITHM).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let digest_method = reference
            .child(DSIG_NS, node::DIGEST_METHOD)
            .and_then(|d| d.attr(attr::ALGORITHM))
            .ok_or_else(|| malformed(NAME, "Reference has no DigestMethod"))?
            .to_string();
        let digest_value = reference
            .child_text(DSIG_NS, node::DIGEST_VALUE)
            .ok_or_else(|| malformed(NAME, "Reference has no DigestValue"))
            .and_then(|v| decode(NAME, &v))?;
        references.push(SignatureReference {
            id,
            transforms,
            digest_method,
            digest_value,
        });
    }
    if references.is_empty() {
        return Err(malformed(NAME, "SignedInfo has no references"));
    }

    let value = element
        .child_text(DSIG_NS, node::SIGNATURE_VALUE)
        .ok_or_else(|| malformed(NAME, "missing SignatureValue"))
        .and_then(|v| decode(NAME, &v))?;
    let key_info = element
        .child(DSIG_NS, node::KEY_INFO)
        .ok_or_else(|| malformed(NAME, "missing KeyInfo"))
        .and_then(|k| read_key_info(k, standards))?;

    Ok(SignatureData {
        id: element.id().map(str::to_string),
        signed_info: signed_info.clone(),
        canonicalization,
        signature_method,
        references,
        value,
        key_info,
    })
}

/// Transforms applied to every reference written by this crate.
pub fn default_transforms() -> Vec<String> {
    vec![EXC_C14N.to_string()]
}

// --- Encrypted data ---

/// Whether encrypted data replaces an element or only its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptedDataType {
    Content,
    Element,
}

impl EncryptedDataType {
    pub fn uri(&self) -> &'static str {
        match self {
            Self::Content => ENC_TYPE_CONTENT,
            Self::Element => ENC_TYPE_ELEMENT,
        }
    }
}

/// A parsed `xenc:EncryptedData`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedDataInfo {
    pub id: String,
    pub data_type: EncryptedDataType,
    pub algorithm: String,
    pub key_info: KeyIdentifierClause,
    pub cipher_value: Vec<u8>,
}

pub fn write_encrypted_data(info: &EncryptedDataInfo, standards: &StandardsDriver) -> XmlElement {
    XmlElement::new(prefix::XENC, node::ENCRYPTED_DATA, XENC_NS)
        .with_attr(attr::ID, info.id.as_str())
        .with_attr(attr::TYPE, info.data_type.uri())
        .with_child(
            XmlElement::new(prefix::XENC, node::ENCRYPTION_METHOD, XENC_NS)
                .with_attr(attr::ALGORITHM, info.algorithm.as_str()),
        )
        .with_child(write_key_info(&info.key_info, standards))
        .with_child(
            XmlElement::new(prefix::XENC, node::CIPHER_DATA, XENC_NS).with_child(
                XmlElement::new(prefix::XENC, node::CIPHER_VALUE, XENC_NS)
                    .with_text(b64_encode(&info.cipher_value)),
            ),
        )
}

pub fn read_encrypted_data(
    element: &XmlElement,
    standards: &StandardsDriver,
) -> Result<EncryptedDataInfo, MessageSecurityError> {
    const NAME: &str = "EncryptedData";
    if !element.is(XENC_NS, node::ENCRYPTED_DATA) {
        return Err(malformed(NAME, format!("unexpected element {}", element.qname())));
    }
    let id = element
        .id()
        .ok_or_else(|| malformed(NAME, "missing Id"))?
        .to_string();
    let data_type = match element.attr(attr::TYPE) {
        Some(ENC_TYPE_CONTENT) => EncryptedDataType::Content,
        Some(ENC_TYPE_ELEMENT) => EncryptedDataType::Element,
        other => return Err(malformed(NAME, format!("unsupported Type {:?}", other))),
    };
    let algorithm = element
        .child(XENC_NS, node::ENCRYPTION_METHOD)
        .and_then(|m| m.attr(attr::ALGORITHM))
        .ok_or_else(|| malformed(NAME, "missing EncryptionMethod"))?
        .to_string();
    let key_info = element
        .child(DSIG_NS, node::KEY_INFO)
        .ok_or_else(|| malformed(NAME, "missing KeyInfo"))
        .and_then(|k| read_key_info(k, standards))?;
    let cipher_value = element
        .child(XENC_NS, node::CIPHER_DATA)
        .and_then(|c| c.child_text(XENC_NS, node::CIPHER_VALUE))
        .ok_or_else(|| malformed(NAME, "missing CipherValue"))
        .and_then(|v| decode(NAME, &v))?;
    Ok(EncryptedDataInfo {
        id,
        data_type,
        algorithm,
        key_info,
        cipher_value,
    })
}

/// Wrap encrypted data in a WSS 1.1 `EncryptedHeader`, carrying over the
/// original header's `mustUnderstand` attribute.
pub fn write_encrypted_header(
    id: &str,
    encrypted_data: XmlElement,
    must_understand: Option<(&str, &str)>,
) -> XmlElement {
    let mut header = with_wsu_id(
        XmlElement::new(prefix::WSSE11, node::ENCRYPTED_HEADER, WSSE11_NS),
        id,
    );
    if let Some((soap_ns, value)) = must_understand {
        header.set_ns_attr(prefix::SOAP, attr::MUST_UNDERSTAND, soap_ns, value);
    }
    header.with_child(encrypted_data)
}

/// The `EncryptedData` inside an `EncryptedHeader`.
pub fn encrypted_header_data(element: &XmlElement) -> Option<&XmlElement> {
    if !element.is(WSSE11_NS, node::ENCRYPTED_HEADER) {
        return None;
    }
    element.child(XENC_NS, node::ENCRYPTED_DATA)
}

// --- Reference list ---

pub fn write_reference_list(ids: &[String]) -> XmlElement {
    let mut list = XmlElement::new(prefix::XENC, node::REFERENCE_LIST, XENC_NS);
    for id in ids {
        list.push_child(
            XmlElement::new(prefix::XENC, node::DATA_REFERENCE, XENC_NS)
                .with_attr(attr::URI, format!("#{}", id)),
        );
    }
    list
}

pub fn read_reference_list(element: &XmlElement) -> Result<Vec<String>, MessageSecurityError> {
    const NAME: &str = "ReferenceList";
    let ids = element
        .element_children()
        .filter(|c| c.is(XENC_NS, node::DATA_REFERENCE))
        .map(|c| local_uri(NAME, c.attr(attr::URI)))
        .collect::<Result<Vec<_>, _>>()?;
    if ids.is_empty() {
        return Err(malformed(NAME, "no DataReference"));
    }
    Ok(ids)
}

// --- Signature confirmation ---

pub fn write_signature_confirmation(id: &str, value: Option<&[u8]>) -> XmlElement {
    let element = with_wsu_id(
        XmlElement::new(prefix::WSSE11, node::SIGNATURE_CONFIRMATION, WSSE11_NS),
        id,
    );
    match value {
        Some(value) => element.with_attr(attr::VALUE, b64_encode(value)),
        None => element,
    }
}

/// Read a signature confirmation into (id, confirmed value).
pub fn read_signature_confirmation(
    element: &XmlElement,
) -> Result<(String, Option<Vec<u8>>), MessageSecurityError> {
    const NAME: &str = "SignatureConfirmation";
    let id = element
        .id()
        .ok_or_else(|| malformed(NAME, "missing Id"))?
        .to_string();
    let value = element
        .attr(attr::VALUE)
        .map(|v| decode(NAME, v))
        .transpose()?;
    Ok((id, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::AlgorithmSuite;
    use crate::xml::parse_document;

    fn reparse(element: &XmlElement) -> XmlElement {
        parse_document(&element.to_xml()).unwrap()
    }

    #[test]
    fn test_signature_round_trip() {
        let standards = StandardsDriver::default();
        let caps = AlgorithmSuite::Basic256.capabilities();
        let references = vec![SignatureReference {
            id: "_1".to_string(),
            transforms: default_transforms(),
            digest_method: caps.digest.uri().to_string(),
            digest_value: vec![7; 20],
        }];
        let signed_info = write_signed_info(&caps, &references);
        let element = write_signature(
            "sig",
            signed_info,
            &[9; 20],
            &KeyIdentifierClause::local("dk"),
            &standards,
        );
        let data = read_signature(&reparse(&element), &standards).unwrap();
        assert_eq!(data.id.as_deref(), Some("sig"));
        assert_eq!(data.references, references);
        assert_eq!(data.value, vec![9; 20]);
        assert_eq!(data.signature_method, caps.symmetric_signature.uri());
        assert_eq!(data.key_info, KeyIdentifierClause::local("dk"));
        assert!(data.references_id("_1"));
    }

    #[test]
    fn test_signature_without_references_rejected() {
        let standards = StandardsDriver::default();
        let caps = AlgorithmSuite::Basic256.capabilities();
        let element = write_signature(
            "sig",
            write_signed_info(&caps, &[]),
            &[1; 20],
            &KeyIdentifierClause::local("dk"),
            &standards,
        );
        let err = read_signature(&reparse(&element), &standards).unwrap_err();
        assert!(matches!(err, MessageSecurityError::Malformed { .. }));
    }

    #[test]
    fn test_encrypted_data_round_trip() {
        let standards = StandardsDriver::default();
        let info = EncryptedDataInfo {
            id: "_5".to_string(),
            data_type: EncryptedDataType::Content,
            algorithm: "urn:alg".to_string(),
            key_info: KeyIdentifierClause::security_context("urn:uuid:c", None),
            cipher_value: vec![1, 2, 3],
        };
        let back = read_encrypted_data(&reparse(&write_encrypted_data(&info, &standards)), &standards)
            .unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn test_encrypted_header_keeps_must_understand() {
        let data = XmlElement::new(prefix::XENC, node::ENCRYPTED_DATA, XENC_NS).with_attr(attr::ID, "ed");
        let header = reparse(&write_encrypted_header(
            "eh",
            data,
            Some((crate::standards::SOAP_12_NS, "1")),
        ));
        assert_eq!(header.id(), Some("eh"));
        assert_eq!(
            header.ns_attr(crate::standards::SOAP_12_NS, attr::MUST_UNDERSTAND),
            Some("1")
        );
        assert_eq!(encrypted_header_data(&header).and_then(|d| d.id()), Some("ed"));
    }

    #[test]
    fn test_reference_list() {
        let ids = vec!["a".to_string(), "b".to_string()];
        assert_eq!(read_reference_list(&reparse(&write_reference_list(&ids))).unwrap(), ids);
        let empty = XmlElement::new(prefix::XENC, node::REFERENCE_LIST, XENC_NS);
        assert!(read_reference_list(&empty).is_err());
    }

    #[test]
    fn test_signature_confirmation_without_value() {
        let (id, value) =
            read_signature_confirmation(&reparse(&write_signature_confirmation("sc", None))).unwrap();
        assert_eq!(id, "sc");
        assert!(value.is_none());
        let (_, value) =
            read_signature_confirmation(&reparse(&write_signature_confirmation("sc", Some(&[4; 20]))))
                .unwrap();
        assert_eq!(value, Some(vec![4; 20]));
    }
}
