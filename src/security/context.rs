use crate::error::LeafError;
use crate::security::password::Password;
use crate::security::role::{Role, RoleName, User, UserName};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Roles and users known to the server.
///
/// Built once at startup and never mutated afterwards, so it is shared as
/// `Arc<SecurityContext>` and read without locking.
#[derive(Debug, Default)]
pub struct SecurityContext {
    roles: BTreeMap<RoleName, Arc<Role>>,
    users: BTreeMap<UserName, Arc<User>>,
}

impl SecurityContext {
    pub fn builder() -> SecurityContextBuilder {
        SecurityContextBuilder::default()
    }

    pub fn roles(&self) -> &BTreeMap<RoleName, Arc<Role>> {
        &self.roles
    }

    pub fn users(&self) -> &BTreeMap<UserName, Arc<User>> {
        &self.users
    }

    pub fn user(&self, name: &str) -> Option<Arc<User>> {
        self.users.get(&UserName::new(name)).cloned()
    }

    /// Resolves a user by name and checks the supplied plaintext credential.
    pub fn authenticate(&self, name: &str, plaintext: &str) -> Result<Arc<User>, LeafError> {
        let failed = || LeafError::AuthenticationFailed {
            user: name.to_string(),
        };
        let user = self.user(name).ok_or_else(failed)?;
        match user.password().check(plaintext) {
            Ok(true) => Ok(user),
            Ok(false) => Err(failed()),
            Err(err) => {
                warn!(user = %name, error = %err, "stored credential could not be checked");
                Err(failed())
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct SecurityContextBuilder {
    roles: BTreeMap<RoleName, Arc<Role>>,
    users: BTreeMap<UserName, Arc<User>>,
}

impl SecurityContextBuilder {
    pub fn add_role(&mut self, role: Role) -> Result<&mut Self, LeafError> {
        if self.roles.contains_key(role.name()) {
            return Err(LeafError::config(format!(
                "duplicate role '{}'",
                role.name()
            )));
        }
        self.roles.insert(role.name().clone(), Arc::new(role));
        Ok(self)
    }

    /// Registers a user whose roles must already have been added.
    ///
    /// Every problem with the arguments is reported at once; the user is not
    /// registered if there is any.
    pub fn add_user(
        &mut self,
        name: UserName,
        password: Password,
        role_names: &[RoleName],
    ) -> Result<&mut Self, LeafError> {
        let mut errors = Vec::new();
        let mut user_roles = BTreeMap::new();
        for role_name in role_names {
            if user_roles.contains_key(role_name) {
                errors.push(format!("duplicate user role '{role_name}'"));
                continue;
            }
            match self.roles.get(role_name) {
                Some(role) => {
                    user_roles.insert(role_name.clone(), Arc::clone(role));
                }
                None => errors.push(format!("nonexistent role '{role_name}'")),
            }
        }
        if self.users.contains_key(&name) {
            errors.push(format!("duplicate user '{name}'"));
        }
        if !errors.is_empty() {
            return Err(LeafError::ConfigValidation { errors });
        }
        let user = User::new(name.clone(), password, user_roles);
        self.users.insert(name, Arc::new(user));
        Ok(self)
    }

    pub fn build(self) -> SecurityContext {
        SecurityContext {
            roles: self.roles,
            users: self.users,
        }
    }
}
