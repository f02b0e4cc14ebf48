//! Whitelist and blacklist membership.

use parking_lot::RwLock;
use std::collections::HashSet;

/// Membership of an identifier in the access lists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Classification {
    pub whitelisted: bool,
    pub blacklisted: bool,
}

/// Whitelist and blacklist of caller identifiers.
///
/// All operations are idempotent. The blacklist wins when an identifier is
/// present in both lists.
#[derive(Debug, Default)]
pub struct AccessList {
    whitelist: RwLock<HashSet<String>>,
    blacklist: RwLock<HashSet<String>>,
}

impl AccessList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_to_whitelist(&self, id: &str) {
        self.whitelist.write().insert(id.to_string());
    }

    pub fn remove_from_whitelist(&self, id: &str) {
        self.whitelist.write().remove(id);
    }

    pub fn add_to_blacklist(&self, id: &str) {
        self.blacklist.write().insert(id.to_string());
    }

    pub fn remove_from_blacklist(&self, id: &str) {
        self.blacklist.write().remove(id);
    }

    /// Look up an identifier in both lists.
    pub fn classify(&self, id: &str) -> Classification {
        Classification {
            whitelisted: self.whitelist.read().contains(id),
            blacklisted: self.blacklist.read().contains(id),
        }
    }

    /// Sorted snapshot of the whitelist.
    pub fn whitelist(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.whitelist.read().iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Sorted snapshot of the blacklist.
    pub fn blacklist(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.blacklist.read().iter().cloned().collect();
        ids.sort();
        ids
    }
}
