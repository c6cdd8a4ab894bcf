//! Error types for rfs-core
//!
//! Backends classify transport failures once, close to the HTTP call site,
//! into the variants below. Everything above that boundary only inspects the
//! sentinel kinds, so wrapped errors must stay transparent to those checks
//! (see [`Error::root`]).

use std::time::Duration;

use thiserror::Error;

/// Result type alias for rfs-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for storage backend operations
#[derive(Debug, Error)]
pub enum Error {
    #[error("directory not found")]
    DirNotFound,

    #[error("object not found")]
    ObjectNotFound,

    #[error("can't copy object - incompatible remotes")]
    CantCopy,

    #[error("can't move object - incompatible remotes")]
    CantMove,

    #[error("can't move directory - incompatible remotes")]
    CantDirMove,

    #[error("can't copy directory - destination already exists")]
    DirExists,

    #[error("can't purge directory")]
    CantPurge,

    #[error("is not a regular file")]
    NotAFile,

    #[error("is a file not a directory")]
    IsFile,

    #[error("hash type not supported")]
    HashUnsupported,

    #[error("max transfer limit reached")]
    MaxTransferLimitReached,

    #[error("transfer cancelled")]
    Cancelled,

    #[error("{0}")]
    Http(HttpError),

    #[error("Network error: {0}")]
    Network(String),

    #[error("I/O error: {0}")]
    Io(std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("{0}")]
    General(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

/// A non-2xx response from a remote API, decoded by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpError {
    /// HTTP status code
    pub status: u16,
    /// Provider-specific error code, e.g. `item_name_in_use`
    pub code: Option<String>,
    /// Human readable message
    pub message: String,
    /// The provider signalled that the access token has expired
    pub auth_expired: bool,
    /// Server supplied `Retry-After` delay
    pub retry_after: Option<Duration>,
}

impl HttpError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            code: None,
            message: message.into(),
            auth_expired: false,
            retry_after: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "HTTP {} ({}): {}", self.status, code, self.message),
            None => write!(f, "HTTP {}: {}", self.status, self.message),
        }
    }
}

impl Error {
    /// Wrap this error with a short description of what was being attempted
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through any context wrapping
    pub fn root(&self) -> &Error {
        let mut err = self;
        while let Error::Context { source, .. } = err {
            err = source;
        }
        err
    }

    /// Fatal errors abort the whole run and are never retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.root(),
            Error::MaxTransferLimitReached | Error::Cancelled
        )
    }

    /// True for the "missing" family of errors, including HTTP 404
    pub fn is_not_found(&self) -> bool {
        match self.root() {
            Error::DirNotFound | Error::ObjectNotFound => true,
            Error::Http(http) => http.status == 404,
            _ => false,
        }
    }

    /// True if the root error is `DirNotFound`
    pub fn is_dir_not_found(&self) -> bool {
        matches!(self.root(), Error::DirNotFound)
    }

    /// True if the root error is `ObjectNotFound`
    pub fn is_object_not_found(&self) -> bool {
        matches!(self.root(), Error::ObjectNotFound)
    }

    /// HTTP details, if this error came from a remote API response
    pub fn http(&self) -> Option<&HttpError> {
        match self.root() {
            Error::Http(http) => Some(http),
            _ => None,
        }
    }
}

impl From<HttpError> for Error {
    fn from(err: HttpError) -> Self {
        Error::Http(err)
    }
}

// Readers report failures as io::Error. When the payload is one of ours
// (for instance the accounting cutoff) hand back the original variant.
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        if err.get_ref().is_some_and(|inner| inner.is::<Error>()) {
            if let Some(inner) = err.into_inner() {
                return match inner.downcast::<Error>() {
                    Ok(ours) => *ours,
                    Err(other) => Error::Io(std::io::Error::other(other)),
                };
            }
            return Error::General("empty I/O error".to_string());
        }
        Error::Io(err)
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(io) => io,
            other => std::io::Error::other(other),
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

/// Extension trait for attaching context to results
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }
}
