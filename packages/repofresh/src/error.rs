use thiserror::Error;

/// Errors surfaced by the repository engine.
///
/// The first four variants are the domain errors the event dispatcher is
/// expected to branch on; everything else is infrastructure failure that
/// propagates out of the transaction scope unchanged.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or unusable configuration. Raised before any side effect.
    #[error("configuration error: {0}")]
    Config(String),

    /// The package filename cannot be parsed, or disagrees with the
    /// metadata found inside the package.
    #[error("invalid package: {0}")]
    InvalidPackage(String),

    /// `add` targeted a package that is already indexed.
    #[error("package already exists: {0}")]
    PackageAlreadyExists(String),

    /// The requested object-store key does not exist.
    #[error("package not found: {0}")]
    PackageNotFound(String),

    /// An external tool exited with a non-zero status.
    #[error("command {command:?} exited with status {status}: {stderr}")]
    Command {
        command: Vec<String>,
        status: i32,
        stderr: String,
    },

    /// A produced signature did not verify against its input.
    #[error("signature verification failed for {0}")]
    Verification(String),

    /// GPG produced output the session could not use.
    #[error("gpg error: {0}")]
    Gpg(String),

    /// Existing repository metadata could not be read or written.
    #[error("metadata error: {0}")]
    Metadata(String),

    /// Object store or CDN failure.
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    pub(crate) fn invalid_package(message: impl Into<String>) -> Self {
        Error::InvalidPackage(message.into())
    }

    pub(crate) fn metadata(err: impl std::fmt::Display) -> Self {
        Error::Metadata(err.to_string())
    }

    pub(crate) fn storage(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Storage(err.into())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Metadata(err.to_string())
    }
}

impl From<rpm::Error> for Error {
    fn from(err: rpm::Error) -> Self {
        Error::InvalidPackage(err.to_string())
    }
}
