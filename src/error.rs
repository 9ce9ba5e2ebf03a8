use crate::schema::DocumentStatus;

/// Coarse classification callers branch on. Storage and persistence failures
/// only ever surface as their kind, never their internal detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Permission,
    NotFound,
    Conflict,
    Storage,
    Persistence,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{field}: {message}")]
    Validation { field: String, message: String },
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("document is {0}")]
    DocumentClosed(DocumentStatus),
    #[error("storage failure")]
    Storage(String),
    #[error("integrity check failed")]
    Integrity(String),
    #[error("persistence failure")]
    Persistence(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn validation<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation { .. } => ErrorKind::Validation,
            Error::Permission(_) => ErrorKind::Permission,
            Error::NotFound => ErrorKind::NotFound,
            Error::Conflict(_) | Error::DocumentClosed(_) => ErrorKind::Conflict,
            Error::Storage(_) | Error::Integrity(_) => ErrorKind::Storage,
            Error::Persistence(_) => ErrorKind::Persistence,
        }
    }

    /// Integrity failures share the storage kind but indicate tampering, so a
    /// retry can never help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::Persistence(_))
    }

    /// Internal detail for logs; empty for caller-facing variants.
    pub fn detail(&self) -> &str {
        match self {
            Error::Storage(d) | Error::Integrity(d) | Error::Persistence(d) => d,
            _ => "",
        }
    }
}

impl From<diesel::result::Error> for Error {
    fn from(err: diesel::result::Error) -> Self {
        match err {
            diesel::result::Error::NotFound => Error::NotFound,
            diesel::result::Error::DatabaseError(diesel::result::DatabaseErrorKind::UniqueViolation, info) => {
                Error::Conflict(match info.constraint_name() {
                    Some(c) => format!("duplicate value violates {}", c),
                    None => info.message().to_string(),
                })
            }
            diesel::result::Error::DatabaseError(diesel::result::DatabaseErrorKind::ForeignKeyViolation, info) => {
                Error::Conflict(match info.constraint_name() {
                    Some(c) => format!("reference violates {}", c),
                    None => info.message().to_string(),
                })
            }
            err => {
                warn!("DB error: {}", err);
                Error::Persistence(err.to_string())
            }
        }
    }
}

impl From<r2d2::Error> for Error {
    fn from(err: r2d2::Error) -> Self {
        warn!("Unable to get DB pool connection: {}", err);
        Error::Persistence(err.to_string())
    }
}

impl From<crate::pdf::PdfError> for Error {
    fn from(err: crate::pdf::PdfError) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
