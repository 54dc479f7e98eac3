//! Ordering rules for security header children.

use crate::error::MessageSecurityError;
use crate::header::elements::{ElementCategory, ElementPayload, SecurityHeaderElementManager};
use crate::header::MessageProtectionOrder;
use crate::tokens::KeyIdentifierClause;

/// Checks the order of the children of a security header.
pub trait HeaderLayoutValidator: Send + Sync {
    fn validate(
        &self,
        elements: &SecurityHeaderElementManager,
        order: MessageProtectionOrder,
    ) -> Result<(), MessageSecurityError>;
}

/// Strict layout.
///
/// Tokens precede the elements that use them, signed header elements
/// precede the signature, confirmations precede the primary signature,
/// and the reference list sits before the primary signature when signing
/// first and after it when encrypting first. At most one timestamp.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrictLayout;

fn violation(reason: impl Into<String>) -> MessageSecurityError {
    MessageSecurityError::LayoutViolation(reason.into())
}

impl StrictLayout {
    fn check_token_before_use(
        elements: &SecurityHeaderElementManager,
        user: usize,
        clause: &KeyIdentifierClause,
    ) -> Result<(), MessageSecurityError> {
        let Some(id) = clause.local_id() else {
            return Ok(());
        };
        match elements.find_by_id(id) {
            Some(token) if token >= user => Err(violation(format!(
                "token '{}' appears after the element that uses it",
                id
            ))),
            Some(token) => match elements.get(token).map(|s| s.category) {
                Some(ElementCategory::Token) | Some(ElementCategory::EncryptedData) => Ok(()),
                _ => Err(violation(format!("'{}' is not a token", id))),
            },
            None => Ok(()),
        }
    }
}

impl HeaderLayoutValidator for StrictLayout {
    fn validate(
        &self,
        elements: &SecurityHeaderElementManager,
        order: MessageProtectionOrder,
    ) -> Result<(), MessageSecurityError> {
        if elements.indices_of(ElementCategory::Timestamp).len() > 1 {
            return Err(violation("more than one timestamp"));
        }

        for (index, slot) in elements.iter().enumerate() {
            match &slot.payload {
                ElementPayload::DerivedKeyToken(data) => {
                    Self::check_token_before_use(elements, index, &data.base)?;
                }
                ElementPayload::EncryptedData(info) => {
                    Self::check_token_before_use(elements, index, &info.key_info)?;
                }
                ElementPayload::Signature(signature) => {
                    Self::check_token_before_use(elements, index, &signature.key_info)?;
                    for reference in &signature.references {
                        if let Some(target) = elements.find_by_id(&reference.id) {
                            if target >= index {
                                return Err(violation(format!(
                                    "signed element '{}' appears after its signature",
                                    reference.id
                                )));
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        let Some(primary) = elements.indices_of(ElementCategory::Signature).first().copied() else {
            return Ok(());
        };
        if elements
            .indices_of(ElementCategory::SignatureConfirmation)
            .iter()
            .any(|&i| i > primary)
        {
            return Err(violation("signature confirmation after the primary signature"));
        }
        for list in elements.indices_of(ElementCategory::ReferenceList) {
            match order {
                MessageProtectionOrder::SignBeforeEncrypt if list > primary => {
                    return Err(violation(
                        "reference list must precede the signature when signing before encrypting",
                    ));
                }
                MessageProtectionOrder::EncryptBeforeSign if list < primary => {
                    return Err(violation(
                        "reference list must follow the signature when encrypting before signing",
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::wire::{SignatureData, SignatureReference};
    use crate::serializer::{with_wsu_id, DerivedKeyTokenData};
    use crate::standards::WSU_NS;
    use crate::timestamp::SecurityTimestamp;
    use crate::xml::XmlElement;

    fn el(id: &str) -> XmlElement {
        with_wsu_id(XmlElement::new("x", "E", "urn:x"), id)
    }

    fn timestamp(id: &str) -> ElementPayload {
        ElementPayload::Timestamp(SecurityTimestamp::issue(id, std::time::Duration::from_secs(60)).unwrap())
    }

    fn signature(key: &str, refs: &[&str]) -> ElementPayload {
        ElementPayload::Signature(Box::new(SignatureData {
            id: Some("sig".to_string()),
            signed_info: XmlElement::new("ds", "SignedInfo", WSU_NS),
            canonicalization: String::new(),
            signature_method: String::new(),
            references: refs
                .iter()
                .map(|r| SignatureReference {
                    id: r.to_string(),
                    transforms: Vec::new(),
                    digest_method: String::new(),
                    digest_value: Vec::new(),
                })
                .collect(),
            value: vec![1; 20],
            key_info: KeyIdentifierClause::local(key),
        }))
    }

    fn dkt(id: &str, base: &str) -> ElementPayload {
        ElementPayload::DerivedKeyToken(DerivedKeyTokenData {
            id: id.to_string(),
            base: KeyIdentifierClause::local(base),
            offset: 0,
            length: 24,
            label: None,
            nonce: vec![0; 16],
        })
    }

    fn token(id: &str) -> ElementPayload {
        ElementPayload::X509Token {
            id: id.to_string(),
            raw_data: vec![0x30],
        }
    }

    fn list() -> ElementPayload {
        ElementPayload::ReferenceList(vec!["body".to_string()])
    }

    #[test]
    fn test_well_formed_header_accepted() {
        let mut m = SecurityHeaderElementManager::new();
        m.append(ElementCategory::Token, el("sct"), token("sct")).unwrap();
        m.append(ElementCategory::Token, el("dk"), dkt("dk", "sct")).unwrap();
        m.append(ElementCategory::Timestamp, el("ts"), timestamp("ts")).unwrap();
        m.append(ElementCategory::ReferenceList, el("rl"), list()).unwrap();
        m.append(ElementCategory::Signature, el("sig"), signature("dk", &["ts", "body"]))
            .unwrap();
        assert!(StrictLayout
            .validate(&m, MessageProtectionOrder::SignBeforeEncrypt)
            .is_ok());
        assert!(StrictLayout
            .validate(&m, MessageProtectionOrder::EncryptBeforeSign)
            .is_err());
    }

    #[test]
    fn test_token_after_user_rejected() {
        let mut m = SecurityHeaderElementManager::new();
        m.append(ElementCategory::Token, el("dk"), dkt("dk", "sct")).unwrap();
        m.append(ElementCategory::Token, el("sct"), token("sct")).unwrap();
        let err = StrictLayout
            .validate(&m, MessageProtectionOrder::SignBeforeEncrypt)
            .unwrap_err();
        assert!(matches!(err, MessageSecurityError::LayoutViolation(_)));
    }

    #[test]
    fn test_signed_element_after_signature_rejected() {
        let mut m = SecurityHeaderElementManager::new();
        m.append(ElementCategory::Signature, el("sig"), signature("ext", &["ts"]))
            .unwrap();
        m.append(ElementCategory::Timestamp, el("ts"), timestamp("ts")).unwrap();
        assert!(StrictLayout
            .validate(&m, MessageProtectionOrder::SignBeforeEncrypt)
            .is_err());
    }

    #[test]
    fn test_two_timestamps_rejected() {
        let mut m = SecurityHeaderElementManager::new();
        m.append(ElementCategory::Timestamp, el("t1"), timestamp("t1")).unwrap();
        m.append(ElementCategory::Timestamp, el("t2"), timestamp("t2")).unwrap();
        assert!(StrictLayout
            .validate(&m, MessageProtectionOrder::SignBeforeEncrypt)
            .is_err());
    }

    #[test]
    fn test_confirmation_after_signature_rejected() {
        let mut m = SecurityHeaderElementManager::new();
        m.append(ElementCategory::Signature, el("sig"), signature("ext", &["body"]))
            .unwrap();
        m.append(
            ElementCategory::SignatureConfirmation,
            el("sc"),
            ElementPayload::SignatureConfirmation(None),
        )
        .unwrap();
        assert!(StrictLayout
            .validate(&m, MessageProtectionOrder::SignBeforeEncrypt)
            .is_err());
    }
}
