//! Username credential validation.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use crate::crypto::{constant_time_eq, password_digest};
use crate::error::MessageSecurityError;
use crate::serializer::{PasswordType, UsernameTokenData};

/// Source of the passwords username tokens are checked against.
pub trait CredentialStore: Send + Sync {
    /// Password on record for `username`.
    fn password(&self, username: &str) -> Option<String>;

    /// Password forms accepted on the wire.
    fn allowed_password_types(&self) -> &[PasswordType] {
        &[PasswordType::PasswordText, PasswordType::PasswordDigest]
    }
}

/// [`CredentialStore`] backed by a map.
pub struct InMemoryCredentialStore {
    users: RwLock<HashMap<String, String>>,
    allowed: Vec<PasswordType>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            allowed: vec![PasswordType::PasswordText, PasswordType::PasswordDigest],
        }
    }

    /// Only accept these password forms.
    pub fn with_allowed_password_types(mut self, allowed: Vec<PasswordType>) -> Self {
        self.allowed = allowed;
        self
    }

    pub fn add_user(&self, username: impl Into<String>, password: impl Into<String>) {
        self.users.write().insert(username.into(), password.into());
    }

    pub fn remove_user(&self, username: &str) -> bool {
        self.users.write().remove(username).is_some()
    }
}

impl Default for InMemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn password(&self, username: &str) -> Option<String> {
        self.users.read().get(username).cloned()
    }

    fn allowed_password_types(&self) -> &[PasswordType] {
        &self.allowed
    }
}

/// Check a received username token against the store.
///
/// Digests are recomputed from the token's nonce and creation time. Every
/// failure reports the same error so a sender cannot tell an unknown user
/// from a wrong password.
pub fn validate_username_token(
    token: &UsernameTokenData,
    store: &dyn CredentialStore,
) -> Result<(), MessageSecurityError> {
    let failed = || MessageSecurityError::AuthenticationFailed(token.username.clone());

    if !store.allowed_password_types().contains(&token.password_type) {
        debug!(username = %token.username, password_type = ?token.password_type, "Password type not allowed");
        return Err(failed());
    }
    let expected = store.password(&token.username).ok_or_else(failed)?;

    let matches = match token.password_type {
        PasswordType::PasswordText => constant_time_eq(token.password.as_bytes(), expected.as_bytes()),
        PasswordType::PasswordDigest => {
            let (Some(nonce), Some(created)) = (&token.nonce, &token.created) else {
                return Err(failed());
            };
            let digest = password_digest(nonce, created, &expected);
            constant_time_eq(token.password.as_bytes(), digest.as_bytes())
        }
    };
    if !matches {
        return Err(failed());
    }
    Ok(())
}
