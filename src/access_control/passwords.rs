//! Password validation for the in-memory access-control service.

use std::collections::HashMap;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::config::UserEntry;

/// Decides whether a password login succeeds.
pub trait PasswordValidator: Send + Sync {
    fn validate(&self, entity: &str, password: &[u8], domain: &str) -> bool;
}

/// Fixed table of entity passwords.
#[derive(Default)]
pub struct StaticPasswords {
    entries: HashMap<String, (Zeroizing<Vec<u8>>, Option<String>)>,
}

impl StaticPasswords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: &[UserEntry]) -> Self {
        let mut passwords = Self::new();
        for entry in entries {
            passwords.insert(&entry.entity, entry.password.as_bytes(), entry.domain.clone());
        }
        passwords
    }

    /// Add or replace an entry. `domain: None` accepts any domain.
    pub fn insert(&mut self, entity: &str, password: &[u8], domain: Option<String>) {
        self.entries
            .insert(entity.to_string(), (Zeroizing::new(password.to_vec()), domain));
    }
}

impl PasswordValidator for StaticPasswords {
    fn validate(&self, entity: &str, password: &[u8], domain: &str) -> bool {
        let Some((expected, required_domain)) = self.entries.get(entity) else {
            return false;
        };
        if required_domain.as_deref().is_some_and(|d| d != domain) {
            return false;
        }
        expected.as_slice().ct_eq(password).into()
    }
}
