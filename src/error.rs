use thiserror::Error;

/// Stable machine-readable error codes carried in wire error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadKeyName,
    OperationNotPermitted,
    BadMessage,
    UnexpectedMessage,
    NotFound,
    AuthenticationFailed,
    InvalidConfig,
    UnexpectedException,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::BadKeyName => "bad-key-name",
            ErrorCode::OperationNotPermitted => "operation-not-permitted",
            ErrorCode::BadMessage => "bad-message",
            ErrorCode::UnexpectedMessage => "unexpected-message",
            ErrorCode::NotFound => "not-found",
            ErrorCode::AuthenticationFailed => "authentication-failed",
            ErrorCode::InvalidConfig => "invalid-config",
            ErrorCode::UnexpectedException => "unexpected-exception",
        }
    }

    /// HTTP-equivalent status for responses carrying this code.
    pub fn status(self) -> u16 {
        match self {
            ErrorCode::BadKeyName
            | ErrorCode::OperationNotPermitted
            | ErrorCode::BadMessage
            | ErrorCode::UnexpectedMessage => 400,
            ErrorCode::AuthenticationFailed => 401,
            ErrorCode::NotFound => 404,
            ErrorCode::InvalidConfig | ErrorCode::UnexpectedException => 500,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum LeafError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid key '{value}': {reason}")]
    InvalidKey { value: String, reason: String },
    #[error("operation {action} not permitted on key '{key}'")]
    PermissionDenied { action: String, key: String },
    #[error("unparseable message: {0}")]
    BadMessage(String),
    #[error("unexpected message: expected a {expected} message")]
    UnexpectedMessage { expected: &'static str },
    #[error("key '{key}' not found")]
    NotFound { key: String },
    #[error("storage conflict: {0}")]
    StorageConflict(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("database is closed")]
    Closed,
    #[error("injected database fault")]
    InjectedFault,
    #[error("invalid config: {message}")]
    Config { message: String },
    #[error("invalid config: {}", errors.join("; "))]
    ConfigValidation { errors: Vec<String> },
    #[error("authentication failed for user '{user}'")]
    AuthenticationFailed { user: String },
    #[error("password error: {0}")]
    Password(String),
}

impl From<serde_json::Error> for LeafError {
    fn from(value: serde_json::Error) -> Self {
        LeafError::BadMessage(value.to_string())
    }
}

impl LeafError {
    pub fn config(message: impl Into<String>) -> Self {
        LeafError::Config {
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            LeafError::InvalidKey { .. } => ErrorCode::BadKeyName,
            LeafError::PermissionDenied { .. } => ErrorCode::OperationNotPermitted,
            LeafError::BadMessage(_) => ErrorCode::BadMessage,
            LeafError::UnexpectedMessage { .. } => ErrorCode::UnexpectedMessage,
            LeafError::NotFound { .. } => ErrorCode::NotFound,
            LeafError::AuthenticationFailed { .. } => ErrorCode::AuthenticationFailed,
            LeafError::Config { .. } | LeafError::ConfigValidation { .. } => {
                ErrorCode::InvalidConfig
            }
            // Injected faults share the storage failure path.
            LeafError::Io(_)
            | LeafError::Sqlite(_)
            | LeafError::StorageConflict(_)
            | LeafError::Storage(_)
            | LeafError::Encode(_)
            | LeafError::Decode(_)
            | LeafError::Closed
            | LeafError::InjectedFault
            | LeafError::Password(_) => ErrorCode::UnexpectedException,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    pub fn status(&self) -> u16 {
        self.code().status()
    }

    /// Only write conflicts are worth retrying; every other failure is fatal
    /// for the request that hit it.
    pub fn is_retriable(&self) -> bool {
        matches!(self, LeafError::StorageConflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorCode, LeafError};

    #[test]
    fn error_code_strings_are_stable() {
        assert_eq!(ErrorCode::BadKeyName.as_str(), "bad-key-name");
        assert_eq!(
            ErrorCode::OperationNotPermitted.as_str(),
            "operation-not-permitted"
        );
        assert_eq!(ErrorCode::UnexpectedMessage.as_str(), "unexpected-message");
        assert_eq!(ErrorCode::NotFound.as_str(), "not-found");
        assert_eq!(
            ErrorCode::UnexpectedException.as_str(),
            "unexpected-exception"
        );
    }

    #[test]
    fn storage_failures_surface_as_unexpected_exception() {
        let injected = LeafError::InjectedFault;
        let conflict = LeafError::StorageConflict("key '/a'".into());
        assert_eq!(injected.code(), ErrorCode::UnexpectedException);
        assert_eq!(conflict.code(), injected.code());
        assert_eq!(conflict.status(), 500);
        assert!(conflict.is_retriable());
        assert!(!injected.is_retriable());
    }

    #[test]
    fn validation_errors_are_client_errors() {
        let err = LeafError::InvalidKey {
            value: "x".into(),
            reason: "must start with '/'".into(),
        };
        assert_eq!(err.status(), 400);
        assert_eq!(err.code_str(), "bad-key-name");
        let err = LeafError::NotFound { key: "/a".into() };
        assert_eq!(err.status(), 404);
    }

    #[test]
    fn config_validation_lists_every_problem() {
        let err = LeafError::ConfigValidation {
            errors: vec!["nonexistent role 'x'".into(), "duplicate user 'u'".into()],
        };
        let text = err.to_string();
        assert!(text.contains("nonexistent role 'x'"));
        assert!(text.contains("duplicate user 'u'"));
    }
}
