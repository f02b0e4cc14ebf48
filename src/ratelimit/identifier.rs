//! Caller identity and counter key generation.

use serde::{Deserialize, Serialize};

/// The caller a quota is tracked against.
///
/// A request with a user id gets its own quota even when it shares an IP
/// with other users.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    /// Remote address of the caller
    pub ip: String,
    /// Authenticated user, if any
    pub user_id: Option<String>,
}

impl Identifier {
    /// Create an identifier from an IP and an optional user id.
    pub fn new(ip: &str, user_id: Option<&str>) -> Self {
        Self {
            ip: ip.to_string(),
            user_id: user_id.map(str::to_string),
        }
    }

    /// Convert the identifier to its string form, `ip` or `ip:user`.
    ///
    /// Used for display, events and statistics only. The form is ambiguous
    /// for IPv6 addresses, so counters key on the structured value.
    pub fn to_string_key(&self) -> String {
        match &self.user_id {
            Some(user) => format!("{}:{}", self.ip, user),
            None => self.ip.clone(),
        }
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

/// A key that uniquely identifies one piece of counting state.
///
/// Burst sub-limits are tracked separately from the rule's primary counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// Name of the rule this counter belongs to
    pub rule: String,
    /// Caller the counter is tracked against
    pub identifier: Identifier,
    /// Whether this is the burst sub-limit counter
    pub burst: bool,
}

impl CounterKey {
    /// Key for a rule's primary counter.
    pub fn primary(rule: &str, identifier: &Identifier) -> Self {
        Self {
            rule: rule.to_string(),
            identifier: identifier.clone(),
            burst: false,
        }
    }

    /// Key for a rule's burst counter.
    pub fn burst(rule: &str, identifier: &Identifier) -> Self {
        Self {
            rule: rule.to_string(),
            identifier: identifier.clone(),
            burst: true,
        }
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.burst {
            write!(f, "{}|{}|burst", self.rule, self.identifier)
        } else {
            write!(f, "{}|{}", self.rule, self.identifier)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_ip_only() {
        let id = Identifier::new("10.0.0.1", None);
        assert_eq!(id.to_string_key(), "10.0.0.1");
    }

    #[test]
    fn test_identifier_with_user() {
        let id = Identifier::new("10.0.0.1", Some("alice"));
        assert_eq!(id.to_string(), "10.0.0.1:alice");
        assert_ne!(id, Identifier::new("10.0.0.1", Some("bob")));
    }

    #[test]
    fn test_counter_key_burst_distinct() {
        let id = Identifier::new("10.0.0.1", None);
        let primary = CounterKey::primary("login", &id);
        let burst = CounterKey::burst("login", &id);

        assert_ne!(primary, burst);
        assert_eq!(primary.to_string(), "login|10.0.0.1");
        assert_eq!(burst.to_string(), "login|10.0.0.1|burst");
    }

    #[test]
    fn test_counter_key_ipv6_user_not_ambiguous() {
        let user = Identifier::new("2001:db8::1", Some("2"));
        let anonymous = Identifier::new("2001:db8::1:2", None);
        assert_eq!(user.to_string_key(), anonymous.to_string_key());

        assert_ne!(
            CounterKey::primary("r", &user),
            CounterKey::primary("r", &anonymous)
        );
    }
}
