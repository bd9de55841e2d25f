//! Access control for virtual hosts, exchanges and queues.
//!
//! Rules are evaluated per principal. An explicit `Deny` always wins over an
//! `Allow`; with no matching rule the outcome depends on `allow_everyone`.
//!
//! Rule files are JSON arrays of [`AclRule`]:
//!
//! ```json
//! [{ "principal": { "kind": "User", "name": "alice" },
//!    "resource": "Queue", "name": "orders.*",
//!    "operation": "Consume", "permission": "Allow" }]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum AclError {
    #[error("Failed to read ACL file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed ACL file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Kinds of broker objects that rules can name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    VirtualHost,
    Exchange,
    Queue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// Open a connection to a virtual host
    Access,
    Create,
    Delete,
    Bind,
    Unbind,
    Publish,
    Consume,
    Purge,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrincipalKind {
    User,
    Anonymous,
    /// The broker itself, e.g. during recovery.
    System,
}

/// An authenticated identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    pub kind: PrincipalKind,
    pub name: String,
}

impl Principal {
    pub fn user(name: &str) -> Self {
        Self {
            kind: PrincipalKind::User,
            name: name.to_string(),
        }
    }

    pub fn anonymous() -> Self {
        Self {
            kind: PrincipalKind::Anonymous,
            name: "anonymous".to_string(),
        }
    }

    pub fn system() -> Self {
        Self {
            kind: PrincipalKind::System,
            name: "broker".to_string(),
        }
    }

    pub fn is_system(&self) -> bool {
        self.kind == PrincipalKind::System
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            PrincipalKind::User => write!(f, "user:{}", self.name),
            PrincipalKind::Anonymous => f.write_str("anonymous"),
            PrincipalKind::System => f.write_str("system"),
        }
    }
}

/// One allow or deny rule.
///
/// `name` is an exact object name, a prefix ending in `*`, or `*` alone for
/// every object of the type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclRule {
    pub principal: Principal,
    pub resource: ResourceType,
    pub name: String,
    pub operation: Operation,
    pub permission: Permission,
    /// Remote host restriction; absent means any host.
    #[serde(default)]
    pub host: Option<String>,
}

impl AclRule {
    pub fn allow(principal: Principal, resource: ResourceType, name: &str, operation: Operation) -> Self {
        Self {
            principal,
            resource,
            name: name.to_string(),
            operation,
            permission: Permission::Allow,
            host: None,
        }
    }

    pub fn deny(principal: Principal, resource: ResourceType, name: &str, operation: Operation) -> Self {
        Self {
            permission: Permission::Deny,
            ..Self::allow(principal, resource, name, operation)
        }
    }

    pub fn from_host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    fn matches_name(&self, name: &str) -> bool {
        match self.name.strip_suffix('*') {
            Some(prefix) => name.starts_with(prefix),
            None => self.name == name,
        }
    }

    fn applies_to(
        &self,
        resource: ResourceType,
        name: &str,
        operation: Operation,
        host: Option<&str>,
    ) -> bool {
        self.resource == resource
            && (self.operation == Operation::All || self.operation == operation)
            && self.matches_name(name)
            && match (&self.host, host) {
                (None, _) => true,
                (Some(required), Some(actual)) => required == actual,
                (Some(_), None) => false,
            }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationResult {
    Allowed,
    Denied,
    /// No rule matched and the default policy does not allow
    NoMatch,
}

impl AuthorizationResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Holds the rule set and answers authorization questions
#[derive(Debug)]
pub struct AclManager {
    rules: HashMap<Principal, Vec<AclRule>>,
    allow_everyone: bool,
    super_users: HashSet<Principal>,
}

impl Default for AclManager {
    fn default() -> Self {
        Self::new(true)
    }
}

impl AclManager {
    pub fn new(allow_everyone: bool) -> Self {
        Self {
            rules: HashMap::new(),
            allow_everyone,
            super_users: HashSet::new(),
        }
    }

    /// Super users bypass every rule.
    pub fn add_super_user(&mut self, principal: Principal) {
        info!(principal = %principal, "Adding super user");
        self.super_users.insert(principal);
    }

    pub fn add_rule(&mut self, rule: AclRule) {
        debug!(?rule, "Adding ACL rule");
        self.rules
            .entry(rule.principal.clone())
            .or_default()
            .push(rule);
    }

    pub fn rule_count(&self) -> usize {
        self.rules.values().map(Vec::len).sum()
    }

    pub fn authorize(
        &self,
        principal: &Principal,
        resource: ResourceType,
        name: &str,
        operation: Operation,
        host: Option<&str>,
    ) -> AuthorizationResult {
        if principal.is_system() || self.super_users.contains(principal) {
            return AuthorizationResult::Allowed;
        }

        let mut decision = None;
        for rule in self
            .rules
            .get(principal)
            .into_iter()
            .flatten()
            .filter(|rule| rule.applies_to(resource, name, operation, host))
        {
            match rule.permission {
                Permission::Deny => {
                    warn!(
                        principal = %principal,
                        ?resource,
                        name,
                        ?operation,
                        "Denied by ACL rule"
                    );
                    return AuthorizationResult::Denied;
                }
                Permission::Allow => decision = Some(AuthorizationResult::Allowed),
            }
        }

        decision.unwrap_or(if self.allow_everyone {
            AuthorizationResult::Allowed
        } else {
            debug!(principal = %principal, ?resource, name, ?operation, "No ACL rule matched");
            AuthorizationResult::NoMatch
        })
    }

    /// Appends the rules found in a JSON rule file.
    pub fn load_from_file(&mut self, path: impl AsRef<Path>) -> Result<(), AclError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let rules: Vec<AclRule> = serde_json::from_str(&content)?;
        let loaded = rules.len();
        for rule in rules {
            self.add_rule(rule);
        }
        info!(
            path = %path.as_ref().display(),
            rules = loaded,
            "Loaded ACL rules"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_name_patterns() {
        let alice = Principal::user("alice");
        let literal = AclRule::allow(alice.clone(), ResourceType::Queue, "orders", Operation::Consume);
        assert!(literal.applies_to(ResourceType::Queue, "orders", Operation::Consume, None));
        assert!(!literal.applies_to(ResourceType::Queue, "orders-dlq", Operation::Consume, None));
        assert!(!literal.applies_to(ResourceType::Exchange, "orders", Operation::Consume, None));

        let prefixed = AclRule::allow(alice.clone(), ResourceType::Queue, "logs.*", Operation::All);
        assert!(prefixed.applies_to(ResourceType::Queue, "logs.app1", Operation::Purge, None));
        assert!(!prefixed.applies_to(ResourceType::Queue, "metrics.app1", Operation::Purge, None));

        let any = AclRule::allow(alice, ResourceType::Exchange, "*", Operation::Publish);
        assert!(any.applies_to(ResourceType::Exchange, "amq.topic", Operation::Publish, None));
    }

    #[test]
    fn test_no_match_follows_default_policy() {
        let mut strict = AclManager::new(false);
        strict.add_rule(AclRule::allow(
            Principal::user("alice"),
            ResourceType::VirtualHost,
            "test",
            Operation::Access,
        ));
        let alice = Principal::user("alice");

        assert!(strict
            .authorize(&alice, ResourceType::VirtualHost, "test", Operation::Access, None)
            .is_allowed());
        assert_eq!(
            strict.authorize(&alice, ResourceType::VirtualHost, "prod", Operation::Access, None),
            AuthorizationResult::NoMatch
        );

        let open = AclManager::new(true);
        assert!(open
            .authorize(&alice, ResourceType::Queue, "q", Operation::Delete, None)
            .is_allowed());
    }

    #[test]
    fn test_super_user_and_system() {
        let mut acl = AclManager::new(false);
        let admin = Principal::user("admin");
        acl.add_super_user(admin.clone());

        assert!(acl
            .authorize(&admin, ResourceType::Queue, "q", Operation::Delete, None)
            .is_allowed());
        assert!(acl
            .authorize(&Principal::system(), ResourceType::Queue, "q", Operation::Delete, None)
            .is_allowed());
    }

    #[test]
    fn test_deny_wins() {
        let mut acl = AclManager::new(true);
        let bob = Principal::user("bob");
        acl.add_rule(AclRule::allow(bob.clone(), ResourceType::VirtualHost, "*", Operation::All));
        acl.add_rule(AclRule::deny(bob.clone(), ResourceType::VirtualHost, "secure", Operation::Access));

        assert_eq!(
            acl.authorize(&bob, ResourceType::VirtualHost, "secure", Operation::Access, None),
            AuthorizationResult::Denied
        );
        assert!(acl
            .authorize(&bob, ResourceType::VirtualHost, "other", Operation::Access, None)
            .is_allowed());
    }

    #[test]
    fn test_host_restriction() {
        let mut acl = AclManager::new(false);
        let carol = Principal::user("carol");
        acl.add_rule(
            AclRule::allow(carol.clone(), ResourceType::VirtualHost, "default", Operation::Access)
                .from_host("10.0.0.5"),
        );

        assert!(acl
            .authorize(&carol, ResourceType::VirtualHost, "default", Operation::Access, Some("10.0.0.5"))
            .is_allowed());
        assert!(!acl
            .authorize(&carol, ResourceType::VirtualHost, "default", Operation::Access, Some("10.0.0.6"))
            .is_allowed());
        assert!(!acl
            .authorize(&carol, ResourceType::VirtualHost, "default", Operation::Access, None)
            .is_allowed());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"[{{"principal": {{"kind": "User", "name": "dave"}},
                 "resource": "Queue", "name": "work.*",
                 "operation": "Consume", "permission": "Allow"}}]"#
        )
        .unwrap();

        let mut acl = AclManager::new(false);
        acl.load_from_file(file.path()).unwrap();
        assert_eq!(acl.rule_count(), 1);
        assert!(acl
            .authorize(&Principal::user("dave"), ResourceType::Queue, "work.1", Operation::Consume, None)
            .is_allowed());

        let mut broken = tempfile::NamedTempFile::new().unwrap();
        write!(broken, "not json").unwrap();
        assert!(matches!(
            acl.load_from_file(broken.path()),
            Err(AclError::Parse(_))
        ));
    }
}
