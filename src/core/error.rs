use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Registry file unreadable. Recovered inside the store, never returned to callers.
    #[error("instance registry is corrupt: {0}")]
    ConfigCorrupt(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("network failure: {0}")]
    NetworkFailure(String),

    #[error("{0}")]
    ProviderFailure(String),

    #[error("could not start process {executable}: {reason}")]
    ProcessSpawnFailure { executable: String, reason: String },

    #[error("instance '{0}' does not exist")]
    InstanceNotFound(String),

    #[error("instance '{0}' already exists")]
    InstanceExists(String),

    #[error("invalid instance name '{0}'")]
    InvalidName(String),

    #[error("instance '{0}' is being installed or launched")]
    InstanceBusy(String),

    #[error("launch of '{instance}' failed: {source}")]
    Launch {
        instance: String,
        #[source]
        source: Box<CoreError>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub(crate) fn launch(instance: &str, source: CoreError) -> Self {
        match source {
            already @ CoreError::Launch { .. } => already,
            other => CoreError::Launch {
                instance: instance.to_string(),
                source: Box::new(other),
            },
        }
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(error: reqwest::Error) -> Self {
        CoreError::NetworkFailure(error.to_string())
    }
}

impl From<zip::result::ZipError> for CoreError {
    fn from(error: zip::result::ZipError) -> Self {
        CoreError::CorruptArchive(error.to_string())
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(error: anyhow::Error) -> Self {
        CoreError::ProviderFailure(format!("{error:#}"))
    }
}

impl From<tokio::task::JoinError> for CoreError {
    fn from(error: tokio::task::JoinError) -> Self {
        CoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, error))
    }
}
