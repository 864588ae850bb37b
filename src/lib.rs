pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod security;
pub mod storage;

pub use crate::config::{FaultInjection, ServerConfig, StorageConfig};
pub use crate::coordinator::AccessController;
pub use crate::error::{ErrorCode, LeafError};
pub use crate::metrics::{Metrics, MetricsSnapshot};
pub use crate::protocol::{Message, Response, ResponseBody, RudRequest, RudResult};
pub use crate::security::{KeyExpression, KeyName, SecurityContext, User};
pub use crate::storage::{Database, DatabaseKind, Rud, open_database};

use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// One authenticated operation as it arrives at the server boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// A JSON-encoded RUD message.
    Rud(Vec<u8>),
    Read(String),
    Update(String, String),
    Delete(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseSize {
    pub data_bytes: u64,
    pub keys: u64,
}

/// A running store: security context, storage engine and coordinator opened
/// from one [`ServerConfig`].
pub struct LeafInstance {
    config: ServerConfig,
    security: Arc<SecurityContext>,
    controller: AccessController,
    metrics: Arc<Metrics>,
}

impl LeafInstance {
    pub fn open_file(path: &Path) -> Result<Self, LeafError> {
        Self::open(ServerConfig::load(path)?)
    }

    /// Validates the security configuration before touching storage, so a
    /// bad file never creates or migrates a database.
    pub fn open(config: ServerConfig) -> Result<Self, LeafError> {
        let security = Arc::new(config.to_security_context()?);
        let kind = config.database_kind()?;
        let database = open_database(kind, &config.database_file, &config.storage)?;
        let metrics = Arc::new(Metrics::new());
        let faults = config.fault_injection();
        if faults.is_enabled() {
            warn!(
                probability = faults.database_crash_probability,
                "database fault injection is enabled"
            );
        }
        let controller = AccessController::new(database, faults, Arc::clone(&metrics));
        info!(
            kind = %kind,
            file = %config.database_file.display(),
            users = security.users().len(),
            roles = security.roles().len(),
            "leafkv instance opened"
        );
        Ok(Self {
            config,
            security,
            controller,
            metrics,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn security(&self) -> &Arc<SecurityContext> {
        &self.security
    }

    pub fn controller(&self) -> &AccessController {
        &self.controller
    }

    pub fn authenticate(&self, user: &str, password: &str) -> Result<Arc<User>, LeafError> {
        self.security.authenticate(user, password).inspect_err(|_| {
            self.metrics.record_authentication_failure();
            warn!(user = %user, "authentication failed");
        })
    }

    /// Authenticates and executes `request`, mapping every failure to a
    /// response with the matching status and error code.
    pub async fn handle(&self, user: &str, password: &str, request: Request) -> Response {
        let user = match self.authenticate(user, password) {
            Ok(user) => user,
            Err(err) => return Response::error(&err),
        };
        let outcome = match request {
            Request::Rud(payload) => self.controller.rud_message(&user, &payload).await,
            Request::Read(key) => self.controller.read(&user, &key).await,
            Request::Update(key, value) => self.controller.update(&user, &key, value).await,
            Request::Delete(key) => self.controller.delete(&user, &key).await,
        };
        outcome.unwrap_or_else(|err| Response::error(&err))
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn database_size(&self) -> Result<DatabaseSize, LeafError> {
        let database = self.controller.database();
        Ok(DatabaseSize {
            data_bytes: database.data_size_approximate()?,
            keys: database.key_count_approximate()?,
        })
    }

    pub fn close(&self) -> Result<(), LeafError> {
        self.controller.database().close()?;
        info!(file = %self.config.database_file.display(), "leafkv instance closed");
        Ok(())
    }
}
