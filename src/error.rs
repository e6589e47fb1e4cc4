//! Error types for spreadsheet processing.

use serde::Serialize;
use thiserror::Error;

/// Broad error classes reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Bad configuration or missing required mapping.
    Validation,
    /// File rejected by the validator, the rate limiter, or a masked pipeline failure.
    Security,
    /// Structural problems with the workbook, sheet or header.
    Format,
}

/// Errors that can occur while processing one file.
#[derive(Debug, Error)]
pub enum ProcessingError {
    /// File failed size, extension or MIME checks.
    #[error("File validation failed: {}", .errors.join("; "))]
    Validation { errors: Vec<String> },

    #[error("Rate limit exceeded. Please wait before processing more files.")]
    RateLimited,

    /// Reading the file's bytes failed.
    #[error("failed to read file: {0}")]
    Read(#[from] std::io::Error),

    /// Bytes are not a recognizable workbook or CSV.
    #[error("failed to parse spreadsheet: {message}")]
    Parse { message: String },

    #[error("Invalid sheet selection")]
    InvalidSheetSelection,

    #[error("Named sheet not found")]
    NamedSheetNotFound,

    #[error("Header row is out of bounds")]
    HeaderOutOfBounds,

    #[error("Header data not available")]
    HeaderUnavailable,

    /// Generic failure shown instead of internal detail.
    #[error("File processing failed. Please check the file format and try again.")]
    Failed,
}

impl ProcessingError {
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation { .. } | Self::RateLimited | Self::Read(_) | Self::Failed => {
                ErrorCategory::Security
            }
            Self::Parse { .. }
            | Self::InvalidSheetSelection
            | Self::NamedSheetNotFound
            | Self::HeaderOutOfBounds
            | Self::HeaderUnavailable => ErrorCategory::Format,
        }
    }

    /// Whether this error may be shown to callers even when detail is suppressed.
    pub fn is_user_facing(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::RateLimited)
    }
}
