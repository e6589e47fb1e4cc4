//! Pre-parse file checks: size, extension and MIME type.
//!
//! Pure and synchronous. Never fails; problems are reported in the result.

use serde::Serialize;

use crate::config::SecurityConfig;
use crate::file::FileHandle;

/// Files above this size get a warning, not an error.
pub const LARGE_FILE_WARNING_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub file_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Lowercase extension including the dot, or empty when the name has none.
    pub extension: String,
}

/// Validate a file handle against the security config.
pub fn validate(file: &dyn FileHandle, config: &SecurityConfig) -> FileValidationResult {
    validate_parts(file.name(), file.size(), file.mime_type(), config)
}

/// Validate raw file attributes.
pub fn validate_parts(
    name: &str,
    size: u64,
    mime_type: Option<&str>,
    config: &SecurityConfig,
) -> FileValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if size > config.max_file_size {
        errors.push(format!(
            "File size ({}) exceeds maximum allowed size ({})",
            format_size(size),
            format_size(config.max_file_size)
        ));
    } else if size > LARGE_FILE_WARNING_BYTES {
        warnings.push(format!(
            "Large file ({}) may take longer to process",
            format_size(size)
        ));
    }

    let extension = file_extension(name);
    let extension_allowed = config
        .allowed_extensions
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(&extension));
    if !extension_allowed {
        errors.push(format!(
            "File type '{}' is not allowed. Allowed types: {}",
            if extension.is_empty() { "(none)" } else { extension.as_str() },
            config.allowed_extensions.join(", ")
        ));
    }

    let mime_type = mime_type.filter(|m| !m.is_empty());
    if let Some(mime) = mime_type {
        let mime_allowed = config
            .allowed_mime_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(mime));
        if !mime_allowed {
            errors.push(format!("MIME type '{}' is not allowed", mime));
        }
    }

    FileValidationResult {
        is_valid: errors.is_empty(),
        errors,
        warnings,
        file_size: size,
        mime_type: mime_type.map(str::to_string),
        extension,
    }
}

/// Lowercased suffix after the last `.`, with the dot.
pub fn file_extension(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((_, ext)) => format!(".{}", ext.to_lowercase()),
        None => String::new(),
    }
}

fn format_size(bytes: u64) -> String {
    format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
}
