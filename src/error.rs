//! Error handling for songprep.
//!
//! Every fallible operation returns [`Result`], whose [`struct@Error`]
//! pairs an [`ErrorKind`] with the underlying error. The kinds follow the gRPC
//! status codes, so callers can tell a cancelled preparation from a protocol
//! failure without inspecting messages.
//!
//! # Mapping of preparation failures
//!
//! * Cancellation → [`ErrorKind::Cancelled`]
//! * Unexpected HTTP status → [`ErrorKind::FailedPrecondition`]
//! * Too many redirects → [`ErrorKind::ResourceExhausted`]
//! * Transcoder exited unsuccessfully → [`ErrorKind::Internal`]
//! * Temporary file vanished before promotion → [`ErrorKind::DataLoss`]
//!
//! # Example
//!
//! ```rust
//! use songprep::error::{Error, ErrorKind, Result};
//!
//! fn check(len: usize) -> Result<()> {
//!     if len == 0 {
//!         return Err(Error::invalid_argument("song id must not be empty"));
//!     }
//!     Ok(())
//! }
//! ```

#![allow(clippy::enum_glob_use)]

use std::fmt;
use thiserror::Error;

/// A failure with its category.
#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,

    /// What went wrong, as reported by the failing layer.
    pub error: Box<dyn std::error::Error + Send + Sync>,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure categories, numbered like the gRPC status codes.
#[expect(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum ErrorKind {
    /// The operation was cancelled, typically by the caller.
    #[error("cancelled")]
    Cancelled = 1,

    #[error("unknown failure")]
    Unknown = 2,

    #[error("invalid argument")]
    InvalidArgument = 3,

    #[error("deadline exceeded")]
    DeadlineExceeded = 4,

    #[error("not found")]
    NotFound = 5,

    #[error("already exists")]
    AlreadyExists = 6,

    #[error("permission denied")]
    PermissionDenied = 7,

    #[error("limit exceeded")]
    ResourceExhausted = 8,

    #[error("unexpected response")]
    FailedPrecondition = 9,

    #[error("aborted")]
    Aborted = 10,

    #[error("out of range")]
    OutOfRange = 11,

    #[error("internal failure")]
    Internal = 13,

    #[error("unavailable")]
    Unavailable = 14,

    #[error("data loss")]
    DataLoss = 15,

    #[error("unauthenticated")]
    Unauthenticated = 16,
}

/// Generates a constructor for each error kind.
macro_rules! constructors {
    ($($(#[$meta:meta])* $name:ident => $kind:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            pub fn $name<E>(error: E) -> Self
            where
                E: Into<Box<dyn std::error::Error + Send + Sync>>,
            {
                Self::new(ErrorKind::$kind, error)
            }
        )*
    };
}

impl Error {
    /// ```rust
    /// # use songprep::error::{Error, ErrorKind};
    /// let err = Error::new(ErrorKind::NotFound, "song not in catalog");
    /// assert_eq!(err.to_string(), "not found: song not in catalog");
    /// ```
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind,
            error: error.into(),
        }
    }

    constructors! {
        /// Use when the work was interrupted by a conflicting condition,
        /// like the transcoder no longer accepting input.
        aborted => Aborted,
        already_exists => AlreadyExists,
        /// Use when the caller cancelled the operation.
        cancelled => Cancelled,
        /// Use when data was lost in a way that cannot be recovered.
        data_loss => DataLoss,
        deadline_exceeded => DeadlineExceeded,
        /// Use when the remote end answered in a way the protocol does not
        /// allow, like an unexpected status code.
        failed_precondition => FailedPrecondition,
        internal => Internal,
        invalid_argument => InvalidArgument,
        not_found => NotFound,
        out_of_range => OutOfRange,
        permission_denied => PermissionDenied,
        resource_exhausted => ResourceExhausted,
        unauthenticated => Unauthenticated,
        unavailable => Unavailable,
        unknown => Unknown,
    }

    /// Whether this error reports a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }

    /// Creates an error of the same kind carrying the same message.
    ///
    /// The boxed source is not `Clone`, so the copy holds its rendered
    /// message instead. Used to deliver one terminal error to several
    /// listeners.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        Self::new(self.kind, self.error.to_string())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        let kind = match err.kind() {
            NotFound => ErrorKind::NotFound,
            PermissionDenied => ErrorKind::PermissionDenied,
            AddrInUse | AlreadyExists => ErrorKind::AlreadyExists,
            AddrNotAvailable | ConnectionRefused | NotConnected => ErrorKind::Unavailable,
            BrokenPipe | ConnectionReset | ConnectionAborted => ErrorKind::Aborted,
            Interrupted | WouldBlock => ErrorKind::Cancelled,
            UnexpectedEof => ErrorKind::DataLoss,
            TimedOut => ErrorKind::DeadlineExceeded,
            InvalidInput | InvalidData => ErrorKind::InvalidArgument,
            WriteZero => ErrorKind::ResourceExhausted,
            _ => ErrorKind::Unknown,
        };
        Self::new(kind, err)
    }
}

/// The stream fetcher does not go through this conversion for transport
/// errors: it retries those itself.
impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_builder() {
            ErrorKind::Internal
        } else if err.is_connect() {
            ErrorKind::Unavailable
        } else if err.is_timeout() {
            ErrorKind::DeadlineExceeded
        } else if err.is_redirect() {
            ErrorKind::ResourceExhausted
        } else if err.is_status() {
            ErrorKind::FailedPrecondition
        } else if err.is_body() {
            ErrorKind::DataLoss
        } else if err.is_decode() {
            ErrorKind::FailedPrecondition
        } else {
            ErrorKind::Unknown
        };
        Self::new(kind, err)
    }
}

/// Malformed gateway responses are protocol violations, not bad input.
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        let kind = if err.is_io() {
            ErrorKind::Unavailable
        } else {
            ErrorKind::FailedPrecondition
        };
        Self::new(kind, err)
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::invalid_argument(err)
    }
}

impl From<reqwest::header::InvalidHeaderValue> for Error {
    fn from(err: reqwest::header::InvalidHeaderValue) -> Self {
        Self::invalid_argument(err)
    }
}

/// A `Location` that is not visible ASCII.
impl From<reqwest::header::ToStrError> for Error {
    fn from(err: reqwest::header::ToStrError) -> Self {
        Self::failed_precondition(err)
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::invalid_argument(err)
    }
}
