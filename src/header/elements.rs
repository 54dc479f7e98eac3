//! Element manager: the ordered children of a security header being
//! processed, with what is known about each.
//!
//! Slots are addressed by index. Decrypting an element replaces the slot in
//! place, so its position in the header and its original id survive.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::MessageSecurityError;
use crate::header::wire::{EncryptedDataInfo, SignatureData};
use crate::serializer::{DerivedKeyTokenData, SecurityContextTokenData, UsernameTokenData};
use crate::timestamp::SecurityTimestamp;
use crate::tokens::SecurityToken;
use crate::xml::XmlElement;

/// What a header child is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementCategory {
    Token,
    Timestamp,
    Signature,
    EncryptedData,
    ReferenceList,
    SignatureConfirmation,
}

/// Parsed content of a slot.
#[derive(Debug, Clone)]
pub enum ElementPayload {
    SecurityContextToken(SecurityContextTokenData),
    DerivedKeyToken(DerivedKeyTokenData),
    UsernameToken(UsernameTokenData),
    X509Token { id: String, raw_data: Vec<u8> },
    /// A token element after resolution
    Token(Arc<SecurityToken>),
    Timestamp(SecurityTimestamp),
    Signature(Box<SignatureData>),
    EncryptedData(EncryptedDataInfo),
    ReferenceList(Vec<String>),
    SignatureConfirmation(Option<Vec<u8>>),
}

impl ElementPayload {
    pub fn as_token(&self) -> Option<&Arc<SecurityToken>> {
        match self {
            Self::Token(token) => Some(token),
            _ => None,
        }
    }

    pub fn as_signature(&self) -> Option<&SignatureData> {
        match self {
            Self::Signature(signature) => Some(signature),
            _ => None,
        }
    }
}

/// One security header child.
#[derive(Debug, Clone)]
pub struct HeaderElement {
    pub category: ElementCategory,
    pub element: XmlElement,
    pub payload: ElementPayload,
    /// Id the element carried when first seen
    pub original_id: Option<String>,
    /// Id of the element now in the slot
    pub current_id: Option<String>,
    /// Covered by the primary signature
    pub signed: bool,
    /// Arrived encrypted
    pub encrypted: bool,
}

impl HeaderElement {
    pub fn has_id(&self, id: &str) -> bool {
        self.current_id.as_deref() == Some(id) || self.original_id.as_deref() == Some(id)
    }
}

/// Arena of security header children in document order.
#[derive(Debug, Default)]
pub struct SecurityHeaderElementManager {
    slots: Vec<HeaderElement>,
    ids: HashMap<String, usize>,
}

impl SecurityHeaderElementManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an element. Fails if its id is already taken by another slot.
    pub fn append(
        &mut self,
        category: ElementCategory,
        element: XmlElement,
        payload: ElementPayload,
    ) -> Result<usize, MessageSecurityError> {
        let index = self.slots.len();
        let id = element.id().map(str::to_string);
        if let Some(id) = &id {
            self.claim_id(id, index)?;
        }
        self.slots.push(HeaderElement {
            category,
            element,
            payload,
            original_id: id.clone(),
            current_id: id,
            signed: false,
            encrypted: false,
        });
        Ok(index)
    }

    /// Replace a slot with the element decrypted from it.
    pub fn replace(
        &mut self,
        index: usize,
        category: ElementCategory,
        element: XmlElement,
        payload: ElementPayload,
    ) -> Result<(), MessageSecurityError> {
        let id = element.id().map(str::to_string);
        if let Some(id) = &id {
            self.claim_id(id, index)?;
        }
        let slot = self.slot_mut(index)?;
        slot.category = category;
        slot.element = element;
        slot.payload = payload;
        slot.current_id = id;
        slot.encrypted = true;
        Ok(())
    }

    pub fn set_payload(&mut self, index: usize, payload: ElementPayload) -> Result<(), MessageSecurityError> {
        self.slot_mut(index)?.payload = payload;
        Ok(())
    }

    pub fn mark_signed(&mut self, index: usize) -> Result<(), MessageSecurityError> {
        self.slot_mut(index)?.signed = true;
        Ok(())
    }

    pub fn get(&self, index: usize) -> Option<&HeaderElement> {
        self.slots.get(index)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeaderElement> {
        self.slots.iter()
    }

    /// Slot holding the element with this id, current or original.
    pub fn find_by_id(&self, id: &str) -> Option<usize> {
        self.ids.get(id).copied()
    }

    pub fn indices_of(&self, category: ElementCategory) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.category == category)
            .map(|(i, _)| i)
            .collect()
    }

    fn claim_id(&mut self, id: &str, index: usize) -> Result<(), MessageSecurityError> {
        match self.ids.get(id) {
            Some(&existing) if existing != index => {
                Err(MessageSecurityError::DuplicateId(id.to_string()))
            }
            _ => {
                self.ids.insert(id.to_string(), index);
                Ok(())
            }
        }
    }

    fn slot_mut(&mut self, index: usize) -> Result<&mut HeaderElement, MessageSecurityError> {
        let len = self.slots.len();
        self.slots.get_mut(index).ok_or_else(|| {
            MessageSecurityError::LayoutViolation(format!(
                "header element {} out of range ({} elements)",
                index, len
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::standards::{attr, WSU_NS};

    fn element(id: &str) -> XmlElement {
        XmlElement::new("u", "Timestamp", WSU_NS).with_ns_attr("u", attr::ID, WSU_NS, id)
    }

    fn list() -> ElementPayload {
        ElementPayload::ReferenceList(vec!["x".to_string()])
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut manager = SecurityHeaderElementManager::new();
        manager
            .append(ElementCategory::ReferenceList, element("a"), list())
            .unwrap();
        let err = manager
            .append(ElementCategory::ReferenceList, element("a"), list())
            .unwrap_err();
        assert_eq!(err, MessageSecurityError::DuplicateId("a".to_string()));
    }

    #[test]
    fn test_replace_keeps_position_and_original_id() {
        let mut manager = SecurityHeaderElementManager::new();
        manager
            .append(ElementCategory::ReferenceList, element("first"), list())
            .unwrap();
        let index = manager
            .append(ElementCategory::EncryptedData, element("ed"), list())
            .unwrap();
        manager
            .replace(index, ElementCategory::Signature, element("sig"), list())
            .unwrap();

        let slot = manager.get(index).unwrap();
        assert_eq!(slot.category, ElementCategory::Signature);
        assert!(slot.encrypted);
        assert!(slot.has_id("ed") && slot.has_id("sig"));
        assert_eq!(manager.find_by_id("sig"), Some(index));
        assert_eq!(manager.find_by_id("ed"), Some(index));
        assert_eq!(manager.indices_of(ElementCategory::Signature), vec![index]);
    }

    #[test]
    fn test_replacement_cannot_reuse_another_slots_id() {
        let mut manager = SecurityHeaderElementManager::new();
        manager
            .append(ElementCategory::ReferenceList, element("first"), list())
            .unwrap();
        let index = manager
            .append(ElementCategory::EncryptedData, element("ed"), list())
            .unwrap();
        let err = manager
            .replace(index, ElementCategory::Token, element("first"), list())
            .unwrap_err();
        assert_eq!(err, MessageSecurityError::DuplicateId("first".to_string()));
    }
}
