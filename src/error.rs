use std::fmt;

/// Error raised by a pipeline stage, a route handler, or an interceptor.
///
/// The variants follow the server's error taxonomy:
///
/// - HTTP-category errors ([`ProcessError::Http`], [`ProcessError::NotFound`],
///   [`ProcessError::Rejected`], [`ProcessError::CsrfMismatch`]) carry an
///   authoritative status/message pairing that the exception stage always
///   writes to the response.
/// - [`ProcessError::Io`] and [`ProcessError::Internal`] are runtime errors
///   surfaced with their original cause attached.
/// - [`ProcessError::Custom`] lets application code participate in
///   kind-keyed handler dispatch with its own kind name.
///
/// Client-input errors (malformed headers, bad query strings) never surface
/// here: the parsing stages degrade them to absent/default values instead.
#[derive(Debug)]
pub enum ProcessError {
    /// An HTTP error with an explicit status code and message.
    Http { status: u16, message: String },
    /// No route matched the request.
    NotFound { method: String, path: String },
    /// An interceptor or middleware refused consent.
    Rejected { reason: String },
    /// CSRF verification failed (missing, expired, or mismatched token).
    CsrfMismatch,
    /// An I/O failure while serving the request.
    Io(std::io::Error),
    /// Any other failure from handler/business logic.
    Internal(anyhow::Error),
    /// An application-defined error participating in kind-keyed dispatch.
    Custom { kind: String, message: String },
}

impl ProcessError {
    /// Shorthand for an HTTP-category error.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        ProcessError::Http {
            status,
            message: message.into(),
        }
    }

    /// Stable kind name used by the exception stage for handler lookup.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            ProcessError::Http { .. } => "http",
            ProcessError::NotFound { .. } => "not_found",
            ProcessError::Rejected { .. } => "rejected",
            ProcessError::CsrfMismatch => "csrf_mismatch",
            ProcessError::Io(_) => "io",
            ProcessError::Internal(_) => "internal",
            ProcessError::Custom { kind, .. } => kind,
        }
    }

    /// The authoritative status/message pairing for HTTP-category errors.
    ///
    /// Returns `None` for runtime/internal errors; those fall back to the
    /// exception stage's generic 500 pairing.
    #[must_use]
    pub fn http_status(&self) -> Option<(u16, String)> {
        match self {
            ProcessError::Http { status, message } => Some((*status, message.clone())),
            ProcessError::NotFound { .. } => Some((404, "Not Found".to_string())),
            ProcessError::Rejected { reason } => Some((403, reason.clone())),
            ProcessError::CsrfMismatch => Some((403, "Forbidden".to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessError::Http { status, message } => write!(f, "HTTP {status}: {message}"),
            ProcessError::NotFound { method, path } => {
                write!(f, "no route matched {method} {path}")
            }
            ProcessError::Rejected { reason } => write!(f, "request rejected: {reason}"),
            ProcessError::CsrfMismatch => write!(f, "CSRF token verification failed"),
            ProcessError::Io(e) => write!(f, "I/O error: {e}"),
            ProcessError::Internal(e) => write!(f, "internal error: {e}"),
            ProcessError::Custom { kind, message } => write!(f, "{kind}: {message}"),
        }
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProcessError::Io(e) => Some(e),
            ProcessError::Internal(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ProcessError {
    fn from(e: std::io::Error) -> Self {
        ProcessError::Io(e)
    }
}

impl From<anyhow::Error> for ProcessError {
    fn from(e: anyhow::Error) -> Self {
        ProcessError::Internal(e)
    }
}
