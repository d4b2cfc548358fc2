//! Authentication and address authorization
//!
//! Authorization is a pure function of the operation, the address, the
//! principal and the configured role grants ([`check`]). The broker wraps
//! privileged session operations (queue creation and deletion, consumer
//! creation, sends) in a [`SecurityGuard`] that evaluates it.
//!
//! Address patterns come in three forms:
//!
//! - `orders.eu` matches that address only
//! - `orders.#` matches `orders` and every address below `orders.`
//! - `#` matches every address
//!
//! When several grant patterns match an address only the most specific one
//! is consulted: literal beats prefix, a longer prefix beats a shorter one,
//! and `#` comes last.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{RoleGrant, SecurityConfig};
use crate::{CorvidError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    Send,
    Consume,
    Browse,
    CreateDurableQueue,
    DeleteDurableQueue,
    CreateTempQueue,
    DeleteTempQueue,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AddressPattern {
    Literal(String),
    Prefix(String),
    Any,
}

impl AddressPattern {
    pub fn parse(pattern: &str) -> Self {
        if pattern == "#" {
            AddressPattern::Any
        } else if let Some(prefix) = pattern.strip_suffix(".#") {
            AddressPattern::Prefix(prefix.to_string())
        } else {
            AddressPattern::Literal(pattern.to_string())
        }
    }

    pub fn matches(&self, address: &str) -> bool {
        match self {
            AddressPattern::Literal(name) => name == address,
            AddressPattern::Prefix(prefix) => {
                address == prefix
                    || (address.len() > prefix.len()
                        && address.starts_with(prefix.as_str())
                        && address.as_bytes()[prefix.len()] == b'.')
            }
            AddressPattern::Any => true,
        }
    }

    /// Higher is more specific
    fn specificity(&self) -> (u8, usize) {
        match self {
            AddressPattern::Literal(name) => (2, name.len()),
            AddressPattern::Prefix(prefix) => (1, prefix.len()),
            AddressPattern::Any => (0, 0),
        }
    }
}

/// The most specific of `patterns` matching `address`
pub fn best_match<'a, I, S>(patterns: I, address: &str) -> Option<&'a S>
where
    I: IntoIterator<Item = &'a S>,
    S: AsRef<str> + ?Sized + 'a,
{
    patterns
        .into_iter()
        .map(|p| (p, AddressPattern::parse(p.as_ref())))
        .filter(|(_, parsed)| parsed.matches(address))
        .max_by_key(|(_, parsed)| parsed.specificity())
        .map(|(p, _)| p)
}

/// An authenticated user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub username: String,
    pub roles: HashSet<String>,
}

impl Principal {
    pub fn anonymous() -> Self {
        Self {
            username: String::new(),
            roles: HashSet::new(),
        }
    }

    pub fn new(username: &str, roles: &[&str]) -> Self {
        Self {
            username: username.to_string(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }
}

/// Whether `principal` may perform `check_type` on `address` under `grants`
pub fn check(
    check_type: CheckType,
    address: &str,
    principal: &Principal,
    grants: &[RoleGrant],
) -> bool {
    let Some(pattern) = best_match(grants.iter().map(|g| g.pattern.as_str()), address) else {
        return false;
    };
    grants
        .iter()
        .filter(|g| g.pattern == pattern)
        .any(|g| principal.roles.contains(&g.role) && g.permissions.contains(&check_type))
}

pub trait SecurityManager: Send + Sync {
    fn authenticate(&self, username: Option<&str>, password: Option<&str>) -> Result<Principal>;

    fn authorize(&self, principal: &Principal, check_type: CheckType, address: &str) -> bool;
}

/// Users and grants held in memory, loaded from [`SecurityConfig`]
#[derive(Debug, Default)]
pub struct InMemorySecurityManager {
    users: HashMap<String, (String, HashSet<String>)>,
    grants: Vec<RoleGrant>,
}

impl InMemorySecurityManager {
    pub fn from_config(config: &SecurityConfig) -> Self {
        let users = config
            .users
            .iter()
            .map(|u| {
                (
                    u.username.clone(),
                    (u.password.clone(), u.roles.iter().cloned().collect()),
                )
            })
            .collect();
        Self {
            users,
            grants: config.grants.clone(),
        }
    }

    pub fn add_user(&mut self, username: &str, password: &str, roles: &[&str]) {
        self.users.insert(
            username.to_string(),
            (
                password.to_string(),
                roles.iter().map(|r| r.to_string()).collect(),
            ),
        );
    }

    pub fn add_grant(&mut self, grant: RoleGrant) {
        self.grants.push(grant);
    }
}

impl SecurityManager for InMemorySecurityManager {
    fn authenticate(&self, username: Option<&str>, password: Option<&str>) -> Result<Principal> {
        let username = username.ok_or_else(|| {
            CorvidError::Security("anonymous connections are not allowed".to_string())
        })?;
        match self.users.get(username) {
            Some((expected, roles)) if Some(expected.as_str()) == password => Ok(Principal {
                username: username.to_string(),
                roles: roles.clone(),
            }),
            _ => {
                warn!(username, "Authentication failed");
                Err(CorvidError::Security(format!(
                    "unable to validate user {username}"
                )))
            }
        }
    }

    fn authorize(&self, principal: &Principal, check_type: CheckType, address: &str) -> bool {
        check(check_type, address, principal, &self.grants)
    }
}

/// Gate around privileged operations
#[derive(Clone)]
pub struct SecurityGuard {
    enabled: bool,
    manager: Arc<dyn SecurityManager>,
}

impl std::fmt::Debug for SecurityGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityGuard")
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl SecurityGuard {
    pub fn new(enabled: bool, manager: Arc<dyn SecurityManager>) -> Self {
        Self { enabled, manager }
    }

    pub fn from_config(config: &SecurityConfig) -> Self {
        Self::new(
            config.enabled,
            Arc::new(InMemorySecurityManager::from_config(config)),
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn authenticate(&self, username: Option<&str>, password: Option<&str>) -> Result<Principal> {
        if !self.enabled {
            return Ok(username.map_or_else(Principal::anonymous, |u| Principal::new(u, &[])));
        }
        self.manager.authenticate(username, password)
    }

    /// Run `operation` only if `principal` holds `check_type` on `address`
    pub fn guard<T>(
        &self,
        principal: &Principal,
        check_type: CheckType,
        address: &str,
        operation: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        self.check(principal, check_type, address)?;
        operation()
    }

    pub fn check(&self, principal: &Principal, check_type: CheckType, address: &str) -> Result<()> {
        if !self.enabled || self.manager.authorize(principal, check_type, address) {
            return Ok(());
        }
        debug!(
            user = %principal.username,
            ?check_type,
            address,
            "Authorization denied"
        );
        Err(CorvidError::Security(format!(
            "user {} does not have permission {:?} on address {}",
            principal.username, check_type, address
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserConfig;

    fn grant(pattern: &str, role: &str, permissions: &[CheckType]) -> RoleGrant {
        RoleGrant {
            pattern: pattern.to_string(),
            role: role.to_string(),
            permissions: permissions.to_vec(),
        }
    }

    #[test]
    fn test_pattern_matching() {
        assert!(AddressPattern::parse("orders").matches("orders"));
        assert!(!AddressPattern::parse("orders").matches("orders.eu"));
        assert!(AddressPattern::parse("orders.#").matches("orders.eu"));
        assert!(AddressPattern::parse("orders.#").matches("orders"));
        assert!(!AddressPattern::parse("orders.#").matches("ordersx"));
        assert!(AddressPattern::parse("#").matches("anything"));
    }

    #[test]
    fn test_best_match_prefers_specific() {
        let patterns = vec!["#".to_string(), "a.#".to_string(), "a.b.#".to_string(), "a.b.c".to_string()];
        assert_eq!(best_match(&patterns, "a.b.c").map(String::as_str), Some("a.b.c"));
        assert_eq!(best_match(&patterns, "a.b.d").map(String::as_str), Some("a.b.#"));
        assert_eq!(best_match(&patterns, "a.x").map(String::as_str), Some("a.#"));
        assert_eq!(best_match(&patterns, "z").map(String::as_str), Some("#"));
        assert_eq!(best_match(&Vec::<String>::new(), "z"), None);
    }

    #[test]
    fn test_check_uses_most_specific_grants_only() {
        let grants = vec![
            grant("#", "user", &[CheckType::Send, CheckType::Consume]),
            grant("payroll.#", "hr", &[CheckType::Consume]),
        ];
        let user = Principal::new("bob", &["user"]);
        let hr = Principal::new("alice", &["hr"]);

        assert!(check(CheckType::Send, "orders", &user, &grants));
        assert!(!check(CheckType::Consume, "payroll.jan", &user, &grants));
        assert!(check(CheckType::Consume, "payroll.jan", &hr, &grants));
        assert!(!check(CheckType::Send, "payroll.jan", &hr, &grants));
        assert!(!check(CheckType::Send, "orders", &Principal::anonymous(), &grants));
    }

    #[test]
    fn test_authentication() {
        let config = SecurityConfig {
            enabled: true,
            users: vec![UserConfig {
                username: "guest".into(),
                password: "secret".into(),
                roles: vec!["user".into()],
            }],
            grants: vec![grant("#", "user", &[CheckType::Send])],
        };
        let guard = SecurityGuard::from_config(&config);

        let principal = guard.authenticate(Some("guest"), Some("secret")).unwrap();
        assert!(principal.roles.contains("user"));
        assert!(guard.authenticate(Some("guest"), Some("wrong")).is_err());
        assert!(guard.authenticate(None, None).is_err());

        assert!(guard.check(&principal, CheckType::Send, "orders").is_ok());
        let denied = guard.guard(&principal, CheckType::Consume, "orders", || Ok(()));
        assert!(matches!(denied, Err(CorvidError::Security(_))));
    }

    #[test]
    fn test_disabled_guard_allows_everything() {
        let guard = SecurityGuard::from_config(&SecurityConfig::default());
        let principal = guard.authenticate(None, None).unwrap();
        let mut ran = false;
        guard
            .guard(&principal, CheckType::CreateDurableQueue, "x", || {
                ran = true;
                Ok(())
            })
            .unwrap();
        assert!(ran);
    }
}
