//! Which message parts must be signed or encrypted.
//!
//! Specifications are assembled with builders and frozen into immutable
//! values before a protocol factory opens. A frozen value has no mutators.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Action key that applies to every action.
pub const WILDCARD_ACTION: &str = "*";

/// A header identified by local name and namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HeaderName {
    pub name: String,
    pub namespace: String,
}

impl HeaderName {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

/// Parts of one message: the body and a set of headers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagePartSpecification {
    pub is_body_included: bool,
    pub headers: Vec<HeaderName>,
}

impl MessagePartSpecification {
    pub fn body() -> Self {
        Self {
            is_body_included: true,
            headers: Vec::new(),
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, header: HeaderName) -> Self {
        if !self.headers.contains(&header) {
            self.headers.push(header);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        !self.is_body_included && self.headers.is_empty()
    }

    pub fn includes_header(&self, name: &str, namespace: &str) -> bool {
        self.headers
            .iter()
            .any(|h| h.name == name && h.namespace == namespace)
    }

    /// Parts in either specification.
    pub fn union(&self, other: &Self) -> Self {
        let mut merged = self.clone();
        merged.is_body_included |= other.is_body_included;
        for header in &other.headers {
            if !merged.headers.contains(header) {
                merged.headers.push(header.clone());
            }
        }
        merged
    }
}

/// Builder for [`ScopedMessagePartSpecification`].
#[derive(Debug, Clone, Default)]
pub struct ScopedMessagePartsBuilder {
    channel_parts: MessagePartSpecification,
    action_parts: BTreeMap<String, MessagePartSpecification>,
}

impl ScopedMessagePartsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add parts for an action, or for every action with [`WILDCARD_ACTION`].
    pub fn add_parts(mut self, action: &str, parts: MessagePartSpecification) -> Self {
        if action == WILDCARD_ACTION {
            self.channel_parts = self.channel_parts.union(&parts);
        } else {
            let entry = self.action_parts.entry(action.to_string()).or_default();
            *entry = entry.union(&parts);
        }
        self
    }

    /// Merge another specification, e.g. one from a second operation.
    pub fn union_with(mut self, other: &ScopedMessagePartSpecification) -> Self {
        self.channel_parts = self.channel_parts.union(&other.inner.channel_parts);
        for (action, parts) in &other.inner.action_parts {
            let entry = self.action_parts.entry(action.clone()).or_default();
            *entry = entry.union(parts);
        }
        self
    }

    pub fn freeze(self) -> ScopedMessagePartSpecification {
        ScopedMessagePartSpecification {
            inner: Arc::new(ScopedParts {
                channel_parts: self.channel_parts,
                action_parts: self.action_parts,
            }),
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct ScopedParts {
    channel_parts: MessagePartSpecification,
    action_parts: BTreeMap<String, MessagePartSpecification>,
}

/// Immutable per-action part requirements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopedMessagePartSpecification {
    inner: Arc<ScopedParts>,
}

impl ScopedMessagePartSpecification {
    pub fn builder() -> ScopedMessagePartsBuilder {
        ScopedMessagePartsBuilder::new()
    }

    /// Body only, for every action.
    pub fn body_for_all_actions() -> Self {
        Self::builder()
            .add_parts(WILDCARD_ACTION, MessagePartSpecification::body())
            .freeze()
    }

    pub fn channel_parts(&self) -> &MessagePartSpecification {
        &self.inner.channel_parts
    }

    pub fn actions(&self) -> impl Iterator<Item = &str> {
        self.inner.action_parts.keys().map(String::as_str)
    }

    /// Channel parts plus those registered for `action`.
    pub fn parts_for(&self, action: Option<&str>) -> MessagePartSpecification {
        match action.and_then(|a| self.inner.action_parts.get(a)) {
            Some(parts) => self.inner.channel_parts.union(parts),
            None => self.inner.channel_parts.clone(),
        }
    }

    /// Thaw into a builder that starts from these parts.
    pub fn to_builder(&self) -> ScopedMessagePartsBuilder {
        ScopedMessagePartsBuilder::new().union_with(self)
    }
}
