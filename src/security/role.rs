use crate::security::key::{KeyExpression, KeyName};
use crate::security::password::Password;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Read,
    Write,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Read => write!(f, "READ"),
            Action::Write => write!(f, "WRITE"),
        }
    }
}

/// Permission to perform one action on every key an expression matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub action: Action,
    pub keys: KeyExpression,
}

impl Grant {
    pub fn new(action: Action, keys: KeyExpression) -> Self {
        Self { action, keys }
    }

    pub fn matches(&self, key: &KeyName) -> bool {
        self.keys.matches(key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleName(pub String);

impl RoleName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserName(pub String);

impl UserName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A named, ordered list of grants. Anything not granted is denied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Role {
    name: RoleName,
    grants: Vec<Grant>,
}

impl Role {
    pub fn new(name: RoleName, grants: Vec<Grant>) -> Self {
        Self { name, grants }
    }

    pub fn name(&self) -> &RoleName {
        &self.name
    }

    pub fn grants(&self) -> &[Grant] {
        &self.grants
    }

    pub fn allows(&self, action: Action, key: &KeyName) -> bool {
        self.grants
            .iter()
            .any(|grant| grant.action == action && grant.matches(key))
    }
}

#[derive(Debug, Clone)]
pub struct User {
    name: UserName,
    password: Password,
    roles: BTreeMap<RoleName, Arc<Role>>,
}

impl User {
    pub fn new(name: UserName, password: Password, roles: BTreeMap<RoleName, Arc<Role>>) -> Self {
        Self {
            name,
            password,
            roles,
        }
    }

    pub fn name(&self) -> &UserName {
        &self.name
    }

    pub fn password(&self) -> &Password {
        &self.password
    }

    pub fn roles(&self) -> &BTreeMap<RoleName, Arc<Role>> {
        &self.roles
    }

    pub fn allows(&self, action: Action, key: &KeyName) -> bool {
        self.roles.values().any(|role| role.allows(action, key))
    }
}
