//! Error types for package graph operations.

use keel_pm::{FetchError, WorkspaceError};

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while resolving, loading, finalizing or sealing
/// packages.
///
/// Errors are `Clone` so that a memoized load failure can be handed to every
/// caller that waited on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Bad configuration; the operator is expected to fix it
    #[error("{}{}", located(.location), .message)]
    BadInput {
        location: Option<String>,
        message: String,
    },

    /// The workspace is not in a state that allows the operation
    #[error("{}{}\n\n  {}", located(.location), .message, .hint)]
    Usage {
        location: Option<String>,
        message: String,
        hint: String,
    },

    /// An invariant was violated
    #[error("{}internal error: {}", located(.location), .message)]
    Internal {
        location: Option<String>,
        message: String,
    },

    /// An external process or network request failed
    #[error("{}{}{}", located(.location), .message, hinted(.hint))]
    Invocation {
        location: Option<String>,
        message: String,
        hint: Option<String>,
    },

    /// Packages depend on each other
    #[error("import cycle detected: {}", .path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    /// The surrounding work was abandoned
    #[error("cancelled")]
    Cancelled,

    /// The caller's deadline passed
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Independent failures found by a single validation pass
    #[error("{}", joined(.0))]
    Multiple(Vec<Error>),
}

/// Discriminant of [`Error`], convenient for matching in callers and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadInput,
    Usage,
    Internal,
    Invocation,
    CycleDetected,
    Cancelled,
    DeadlineExceeded,
    Multiple,
}

fn located(location: &Option<String>) -> String {
    match location {
        Some(loc) => format!("{}: ", loc),
        None => String::new(),
    }
}

fn hinted(hint: &Option<String>) -> String {
    match hint {
        Some(hint) => format!("\n\n  {}", hint),
        None => String::new(),
    }
}

fn joined(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

impl Error {
    pub fn bad_input(message: impl Into<String>) -> Self {
        Error::BadInput {
            location: None,
            message: message.into(),
        }
    }

    pub fn usage(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Error::Usage {
            location: None,
            message: message.into(),
            hint: hint.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            location: None,
            message: message.into(),
        }
    }

    pub fn invocation(message: impl Into<String>) -> Self {
        Error::Invocation {
            location: None,
            message: message.into(),
            hint: None,
        }
    }

    /// Attach a location (package name or module path). An existing
    /// location is kept. Each of several errors gets the location.
    pub fn at(mut self, loc: impl std::fmt::Display) -> Self {
        match &mut self {
            Error::Multiple(errors) => {
                let loc = loc.to_string();
                *errors = std::mem::take(errors).into_iter().map(|e| e.at(&loc)).collect();
            }
            Error::BadInput { location, .. }
            | Error::Usage { location, .. }
            | Error::Internal { location, .. }
            | Error::Invocation { location, .. } => {
                if location.is_none() {
                    *location = Some(loc.to_string());
                }
            }
            _ => {}
        }
        self
    }

    /// Attach a remediation hint to an invocation error.
    pub fn with_hint(mut self, text: impl Into<String>) -> Self {
        if let Error::Invocation { hint, .. } = &mut self {
            *hint = Some(text.into());
        }
        self
    }

    /// Collapse accumulated errors: nothing is `Ok`, a single error is
    /// returned as is, several become [`Error::Multiple`].
    pub fn from_errors(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Multiple(errors)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BadInput { .. } => ErrorKind::BadInput,
            Error::Usage { .. } => ErrorKind::Usage,
            Error::Internal { .. } => ErrorKind::Internal,
            Error::Invocation { .. } => ErrorKind::Invocation,
            Error::CycleDetected { .. } => ErrorKind::CycleDetected,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            Error::Multiple(_) => ErrorKind::Multiple,
        }
    }

    /// True for errors caused by the caller abandoning the work rather
    /// than by the work itself.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::DeadlineExceeded)
    }

    /// Flattened list of the errors this error stands for.
    pub fn errors(&self) -> Vec<&Error> {
        match self {
            Error::Multiple(errors) => errors.iter().flat_map(|e| e.errors()).collect(),
            other => vec![other],
        }
    }
}

impl From<FetchError> for Error {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Cancelled => Error::Cancelled,
            FetchError::UnknownModule(_) => Error::internal(err.to_string()),
            err if err.is_user_error() => Error::bad_input(err.to_string()),
            err => {
                let hint = fetch_hint(&err);
                Error::invocation(err.to_string()).with_hint(hint)
            }
        }
    }
}

fn fetch_hint(err: &FetchError) -> &'static str {
    match err {
        FetchError::HttpError(_) | FetchError::HttpStatus { .. } => {
            "check your network connection and that the module's host is reachable"
        }
        FetchError::Invocation { .. } => "check that git is installed and that you can access the repository",
        FetchError::IoError(_) | FetchError::Cache(_) => {
            "check that the module cache (KEEL_CACHE_DIR) is writable, or run `keelpm clear-cache`"
        }
        _ => "run `keelpm download` to retry fetching pinned modules",
    }
}

impl From<WorkspaceError> for Error {
    fn from(err: WorkspaceError) -> Self {
        match &err {
            WorkspaceError::UnsupportedApi { module, .. } => Error::Usage {
                location: Some(module.clone()),
                message: err.to_string(),
                hint: "update keel to a build implementing the required API version".to_string(),
            },
            WorkspaceError::Io { path, .. } => Error::bad_input(err.to_string()).at(path.display()),
            WorkspaceError::SerializeError(_) => Error::internal(err.to_string()),
            WorkspaceError::ParseError(_) | WorkspaceError::ValidationError(_) => {
                Error::bad_input(err.to_string())
            }
        }
    }
}
