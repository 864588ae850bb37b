use crate::error::LeafError;
use crate::security::{
    Action, Grant, KeyExpression, Password, PasswordAlgorithm, Role, RoleName, SecurityContext,
    UserName,
};
use crate::storage::DatabaseKind;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Storage engine tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageConfig {
    /// Attempts an optimistic transaction gets before its last conflict is
    /// reported to the caller.
    pub max_rud_attempts: usize,
    pub sqlite_busy_timeout_ms: u64,
    /// Make every commit durable before acknowledging it.
    pub fsync_commits: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_rud_attempts: 10,
            sqlite_busy_timeout_ms: 5_000,
            fsync_commits: true,
        }
    }
}

impl StorageConfig {
    /// Skips fsync; for tests and throwaway stores.
    pub fn development() -> Self {
        Self {
            fsync_commits: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FaultInjection {
    pub database_crash_probability: f64,
}

impl FaultInjection {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn with_probability(probability: f64) -> Result<Self, LeafError> {
        let fault = Self {
            database_crash_probability: probability,
        };
        fault.validate()?;
        Ok(fault)
    }

    pub fn validate(&self) -> Result<(), LeafError> {
        let p = self.database_crash_probability;
        if !(0.0..1.0).contains(&p) {
            return Err(LeafError::config(format!(
                "databaseCrashProbability {p} must be in [0, 1)"
            )));
        }
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.database_crash_probability > 0.0
    }

    /// Fails with [`LeafError::InjectedFault`] with the configured probability.
    pub fn inject(&self) -> Result<(), LeafError> {
        if !self.is_enabled() {
            return Ok(());
        }
        if rand::thread_rng().r#gen::<f64>() < self.database_crash_probability {
            return Err(LeafError::InjectedFault);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GrantConfig {
    pub action: Action,
    pub keys: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoleConfig {
    pub name: String,
    #[serde(default)]
    pub grants: Vec<GrantConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HashedPasswordConfig {
    pub algorithm: String,
    pub salt: String,
    pub hash: String,
}

impl HashedPasswordConfig {
    pub fn to_password(&self) -> Result<Password, LeafError> {
        Password::new(
            PasswordAlgorithm::parse(&self.algorithm)?,
            self.salt.clone(),
            self.hash.clone(),
        )
    }
}

impl From<&Password> for HashedPasswordConfig {
    fn from(password: &Password) -> Self {
        Self {
            algorithm: password.algorithm().identifier(),
            salt: password.salt().to_string(),
            hash: password.hash().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserConfig {
    pub name: String,
    pub password: HashedPasswordConfig,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Server configuration file.
///
/// Unknown top-level fields are ignored so files written for other server
/// front ends (listen addresses, telemetry) still load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(rename = "%schema", default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub database_file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_kind: Option<String>,
    pub roles: Vec<RoleConfig>,
    pub users: Vec<UserConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault_injection: Option<FaultInjection>,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, LeafError> {
        let bytes = std::fs::read(path).map_err(|e| {
            LeafError::config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&bytes)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, LeafError> {
        let config: Self = serde_json::from_slice(bytes)
            .map_err(|e| LeafError::config(format!("unparseable configuration: {e}")))?;
        config.fault_injection().validate()?;
        config.database_kind()?;
        Ok(config)
    }

    pub fn database_kind(&self) -> Result<DatabaseKind, LeafError> {
        match &self.database_kind {
            Some(kind) => kind.parse(),
            None => Ok(DatabaseKind::default()),
        }
    }

    pub fn fault_injection(&self) -> FaultInjection {
        self.fault_injection.unwrap_or_default()
    }

    /// Builds the security context, reporting every invalid role, grant and
    /// user in the file rather than stopping at the first.
    pub fn to_security_context(&self) -> Result<SecurityContext, LeafError> {
        let mut builder = SecurityContext::builder();
        let mut errors = Vec::new();

        for role in &self.roles {
            let mut grants = Vec::with_capacity(role.grants.len());
            let mut valid = true;
            for grant in &role.grants {
                match KeyExpression::create(&grant.keys) {
                    Ok(keys) => grants.push(Grant::new(grant.action, keys)),
                    Err(e) => {
                        errors.push(format!("role '{}': {e}", role.name));
                        valid = false;
                    }
                }
            }
            if !valid {
                continue;
            }
            if let Err(e) = builder.add_role(Role::new(RoleName::new(&role.name), grants)) {
                errors.extend(flatten(e));
            }
        }

        for user in &self.users {
            let password = match user.password.to_password() {
                Ok(password) => password,
                Err(e) => {
                    errors.push(format!("user '{}': {e}", user.name));
                    continue;
                }
            };
            let roles: Vec<RoleName> = user.roles.iter().map(RoleName::new).collect();
            if let Err(e) = builder.add_user(UserName::new(&user.name), password, &roles) {
                errors.extend(
                    flatten(e)
                        .into_iter()
                        .map(|message| format!("user '{}': {message}", user.name)),
                );
            }
        }

        if !errors.is_empty() {
            return Err(LeafError::ConfigValidation { errors });
        }
        Ok(builder.build())
    }
}

fn flatten(err: LeafError) -> Vec<String> {
    match err {
        LeafError::ConfigValidation { errors } => errors,
        LeafError::Config { message } => vec![message],
        other => vec![other.to_string()],
    }
}
