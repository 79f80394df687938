use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Precondition or remote-state failure before any artifact exists.
    #[error("backup creation failed for {remote_path} (incident {incident_id}): {message}")]
    Creation {
        message: String,
        remote_path: String,
        incident_id: String,
    },

    #[error("artifact {artifact_id} failed validation: {message}")]
    Validation {
        artifact_id: String,
        message: String,
    },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("storage error: {0}")]
    Storage(String),

    /// Checksum or size mismatch found during a rollback pre-check.
    #[error("artifact {artifact_id} is corrupted: {message}")]
    Corruption {
        artifact_id: String,
        message: String,
    },

    #[error("backup of {required} bytes exceeds the configured limit of {limit} bytes")]
    InsufficientStorage { required: u64, limit: u64 },

    #[error("rollback failed: {0}")]
    RollbackExecution(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::Other(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn creation(
        message: impl Into<String>,
        remote_path: impl Into<String>,
        incident_id: impl Into<String>,
    ) -> Self {
        Self::Creation {
            message: message.into(),
            remote_path: remote_path.into(),
            incident_id: incident_id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("json: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
