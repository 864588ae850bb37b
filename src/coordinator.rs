use crate::config::FaultInjection;
use crate::error::LeafError;
use crate::metrics::Metrics;
use crate::protocol::{Message, Response, RudRequest, RudResult};
use crate::security::{Action, KeyName, User};
use crate::storage::{Database, Rud};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

/// Admits transactions to the storage engine on behalf of users.
///
/// Every key in a request is validated and authorized before anything is
/// submitted. Problems are collected across the whole request and returned
/// together; a single bad or denied key vetoes the entire request.
#[derive(Clone)]
pub struct AccessController {
    database: Arc<dyn Database>,
    faults: FaultInjection,
    metrics: Arc<Metrics>,
}

/// Validates and authorizes every key in `request`.
///
/// Keys listed for reading or updating need [`Action::Read`]; keys listed for
/// deletion need [`Action::Write`]. Returns every problem found, or the
/// normalized transaction if there were none.
pub fn check_keys_permitted(user: &User, request: &RudRequest) -> Result<Rud, Vec<LeafError>> {
    let mut errors = Vec::new();
    let mut rud = Rud::default();

    for raw in &request.read {
        if let Some(key) = permitted(user, Action::Read, raw, &mut errors) {
            rud.read.insert(key);
        }
    }
    // Wire order; a later spelling of the same key replaces an earlier one.
    for (raw, value) in &request.update {
        if let Some(key) = permitted(user, Action::Read, raw, &mut errors) {
            rud.update.insert(key, value.clone());
        }
    }
    for raw in &request.delete {
        if let Some(key) = permitted(user, Action::Write, raw, &mut errors) {
            rud.delete.insert(key);
        }
    }

    if errors.is_empty() { Ok(rud) } else { Err(errors) }
}

fn permitted(
    user: &User,
    action: Action,
    raw: &str,
    errors: &mut Vec<LeafError>,
) -> Option<KeyName> {
    match authorize(user, action, raw) {
        Ok(key) => Some(key),
        Err(err) => {
            errors.push(err);
            None
        }
    }
}

fn authorize(user: &User, action: Action, raw: &str) -> Result<KeyName, LeafError> {
    let key = KeyName::create(raw)?;
    if !user.allows(action, &key) {
        return Err(LeafError::PermissionDenied {
            action: action.to_string(),
            key: key.to_string(),
        });
    }
    Ok(key)
}

impl AccessController {
    pub fn new(database: Arc<dyn Database>, faults: FaultInjection, metrics: Arc<Metrics>) -> Self {
        Self {
            database,
            faults,
            metrics,
        }
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.database
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Decodes a wire payload that must be a RUD request and executes it.
    pub async fn rud_message(&self, user: &User, payload: &[u8]) -> Result<Response, LeafError> {
        let request = match Message::parse(payload) {
            Ok(Message::Rud(request)) => request,
            Ok(other) => {
                debug!(user = %user.name(), kind = other.kind(), "rejected non-RUD message");
                return Ok(self.reject(vec![LeafError::UnexpectedMessage { expected: "RUD" }]));
            }
            Err(err) => return Ok(self.reject(vec![err])),
        };
        self.rud(user, request).await
    }

    /// Executes one read-update-delete request on behalf of `user`.
    ///
    /// Validation and authorization failures produce a 400 response listing
    /// every problem; storage failures are returned as errors.
    pub async fn rud(&self, user: &User, request: RudRequest) -> Result<Response, LeafError> {
        let rud = match check_keys_permitted(user, &request) {
            Ok(rud) => rud,
            Err(errors) => {
                debug!(user = %user.name(), errors = errors.len(), "vetoed transaction");
                return Ok(self.reject(errors));
            }
        };

        let started = Instant::now();
        let rud = Arc::new(rud);
        let submitted = Arc::clone(&rud);
        let values = self
            .run_storage(user, move |db| db.read_update_delete(&submitted))
            .await?;
        let took = started.elapsed();

        for key in &rud.read {
            info!(user = %user.name(), key = %key, "read");
        }
        for key in rud.update.keys() {
            info!(user = %user.name(), key = %key, "update");
        }
        for key in &rud.delete {
            info!(user = %user.name(), key = %key, "delete");
        }
        self.metrics
            .record_transaction(rud.read.len(), rud.update.len(), rud.delete.len(), took);

        let values: BTreeMap<String, String> = values
            .into_iter()
            .map(|(key, value)| (String::from(key), value))
            .collect();
        Ok(Response::message(200, Message::Result(RudResult { values })))
    }

    /// Single-key read; a missing key is a 404.
    pub async fn read(&self, user: &User, raw_key: &str) -> Result<Response, LeafError> {
        let key = match authorize(user, Action::Read, raw_key) {
            Ok(key) => key,
            Err(err) => return Ok(self.reject_one(&err)),
        };
        let started = Instant::now();
        let lookup = key.clone();
        let value = self.run_storage(user, move |db| db.get(&lookup)).await?;
        self.metrics.record_transaction(1, 0, 0, started.elapsed());
        info!(user = %user.name(), key = %key, "read");
        match value {
            Some(value) => Ok(Response::text(value)),
            None => Ok(Response::error(&LeafError::NotFound {
                key: key.to_string(),
            })),
        }
    }

    pub async fn update(
        &self,
        user: &User,
        raw_key: &str,
        value: String,
    ) -> Result<Response, LeafError> {
        let key = match authorize(user, Action::Write, raw_key) {
            Ok(key) => key,
            Err(err) => return Ok(self.reject_one(&err)),
        };
        let started = Instant::now();
        let rud = Rud::updating(key.clone(), value);
        self.run_storage(user, move |db| db.read_update_delete(&rud))
            .await?;
        self.metrics.record_transaction(0, 1, 0, started.elapsed());
        info!(user = %user.name(), key = %key, "update");
        Ok(Response::empty())
    }

    pub async fn delete(&self, user: &User, raw_key: &str) -> Result<Response, LeafError> {
        let key = match authorize(user, Action::Write, raw_key) {
            Ok(key) => key,
            Err(err) => return Ok(self.reject_one(&err)),
        };
        let started = Instant::now();
        let rud = Rud::deleting(key.clone());
        self.run_storage(user, move |db| db.read_update_delete(&rud))
            .await?;
        self.metrics.record_transaction(0, 0, 1, started.elapsed());
        info!(user = %user.name(), key = %key, "delete");
        Ok(Response::empty())
    }

    fn reject(&self, errors: Vec<LeafError>) -> Response {
        self.metrics.record_rejection();
        Response::message(400, Message::errors(&errors))
    }

    fn reject_one(&self, err: &LeafError) -> Response {
        self.metrics.record_rejection();
        Response::error(err)
    }

    /// Runs fault injection and then `op` on the blocking pool. Failures are
    /// logged and counted here and otherwise passed through untouched.
    async fn run_storage<T, F>(&self, user: &User, op: F) -> Result<T, LeafError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Database) -> Result<T, LeafError> + Send + 'static,
    {
        let database = Arc::clone(&self.database);
        let faults = self.faults;
        let outcome = tokio::task::spawn_blocking(move || {
            faults.inject()?;
            op(database.as_ref())
        })
        .await
        .map_err(|e| LeafError::Storage(format!("storage task failed: {e}")))
        .and_then(|result| result);

        if let Err(err) = &outcome {
            error!(user = %user.name(), error = %err, "database operation failed");
            self.metrics.record_storage_error();
        }
        outcome
    }
}
