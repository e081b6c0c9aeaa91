//! Error types for the dashboard service
//!
//! Each layer owns its error enum; handlers fold them into [`AppError`],
//! which decides the HTTP status and the plain-text body.
//! - Recoverable: missing source, missing sheet (fallback chain), missing file
//! - Fatal for the request: configuration, fetch and parse failures

use std::path::PathBuf;
use thiserror::Error;

/// Failures of the spreadsheet and file ingestion adapters
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Fetch failed{}: {message}", .status.map(|s| format!(" with status {s}")).unwrap_or_default())]
    FetchFailed { status: Option<u16>, message: String },

    #[error("File not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to parse {path}: {message}")]
    ParseFailed { path: PathBuf, message: String },

    #[error("Sheet '{requested}' not found (available: {})", .available.join(", "))]
    SheetNotFound {
        requested: String,
        available: Vec<String>,
    },

    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid filename: {0}")]
    InvalidFilename(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IngestError {
    /// Returns true when the caller may retry with a fallback sheet name
    pub fn is_sheet_not_found(&self) -> bool {
        matches!(self, IngestError::SheetNotFound { .. })
    }
}

/// Structural problems that stop normalization of a whole sheet
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("Schema mismatch: missing column(s) {}", .missing.join(", "))]
    SchemaMismatch { missing: Vec<String> },

    #[error("Sheet has no header row")]
    EmptySheet,
}

/// Failures of the JSON-backed descriptor and user stores
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt store {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Account and session failures
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Username already exists")]
    UserExists,

    #[error("User not found")]
    UserNotFound,

    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("{0}")]
    InvalidInput(String),

    #[error("Password hashing failed: {0}")]
    Hash(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Top-level error returned by HTTP handlers
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Not authenticated")]
    Unauthorized,

    #[error("Access to another user's data is not allowed")]
    Forbidden,

    #[error("No data source configured for '{0}'")]
    NoSource(String),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Request timed out after {0} seconds")]
    Timeout(u64),
}

#[cfg(feature = "web")]
impl AppError {
    /// HTTP status conventionally associated with the error
    pub fn status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;

        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::NoSource(_) => StatusCode::NOT_FOUND,
            AppError::Ingest(e) => match e {
                IngestError::Configuration(_) | IngestError::Io(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
                IngestError::FetchFailed { .. } => StatusCode::BAD_GATEWAY,
                IngestError::NotFound(_) | IngestError::SheetNotFound { .. } => {
                    StatusCode::NOT_FOUND
                }
                IngestError::ParseFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                IngestError::UnsupportedFormat(_) | IngestError::InvalidFilename(_) => {
                    StatusCode::BAD_REQUEST
                }
            },
            AppError::Normalize(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Auth(e) => match e {
                AuthError::UserExists | AuthError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                AuthError::UserNotFound => StatusCode::NOT_FOUND,
                AuthError::InvalidCredentials => StatusCode::UNAUTHORIZED,
                AuthError::Hash(_) | AuthError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

#[cfg(feature = "web")]
impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("{self}");
        } else {
            log::warn!("{self}");
        }
        (status, self.to_string()).into_response()
    }
}
