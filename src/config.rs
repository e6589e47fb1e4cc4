//! Processing configuration.
//!
//! Every field is optional on the wire and falls back to the defaults below.
//! Configs are usually loaded from `configs/default.json` and overridden per request.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Default maximum upload size: 50 MiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

/// Default chunk granularity for chunked reads: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Per-file layout, security and performance settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpreadsheetConfig {
    /// 1-indexed row holding column names.
    pub header_row: usize,
    /// Synthesize `A, B, C, ...` column names instead of reading a header row.
    pub omit_header: bool,
    /// 1-indexed first data row. Defaults to the row after the header.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_start_row: Option<usize>,
    pub sheet: SheetSelector,
    /// Maximum number of rows materialized per file.
    pub preview_row_count: usize,
    pub security: SecurityConfig,
    pub performance: PerformanceConfig,
}

impl Default for SpreadsheetConfig {
    fn default() -> Self {
        Self {
            header_row: 1,
            omit_header: false,
            data_start_row: None,
            sheet: SheetSelector::default(),
            preview_row_count: 5,
            security: SecurityConfig::default(),
            performance: PerformanceConfig::default(),
        }
    }
}

impl SpreadsheetConfig {
    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {:?}", path))?;

        let config: SpreadsheetConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config: {:?}", path))?;

        info!("Loaded spreadsheet config from {:?}", path);
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise use the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            info!("No config at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }
}

/// Sheet selection by zero-based index or by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SheetSelector {
    Index(usize),
    Name(String),
}

impl Default for SheetSelector {
    fn default() -> Self {
        Self::Index(0)
    }
}

impl SheetSelector {
    /// Parse a query-parameter value: digits select by index, anything else by name.
    pub fn parse(s: &str) -> Self {
        match s.parse::<usize>() {
            Ok(idx) => Self::Index(idx),
            Err(_) => Self::Name(s.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecurityConfig {
    /// Hard upper bound on file size, in bytes.
    pub max_file_size: u64,
    /// Lowercase extensions including the leading dot.
    pub allowed_extensions: Vec<String>,
    pub allowed_mime_types: Vec<String>,
    /// Strip markup and script content from string cells.
    pub sanitize_data: bool,
    pub max_files_per_window: u32,
    /// Rate-limit window length in milliseconds.
    pub rate_limit_window: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            allowed_extensions: [".xlsx", ".xls", ".csv"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            allowed_mime_types: [
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
                "application/vnd.ms-excel",
                "text/csv",
                "application/csv",
                "text/plain",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            sanitize_data: true,
            max_files_per_window: 10,
            rate_limit_window: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PerformanceConfig {
    pub enable_chunked_reading: bool,
    /// Chunk size in bytes. Zero disables chunking.
    pub chunk_size: u64,
    /// Fixed pause before reading, in milliseconds.
    pub processing_throttle: u64,
    pub enable_metrics: bool,
    pub max_concurrent_files: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            enable_chunked_reading: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
            processing_throttle: 100,
            enable_metrics: false,
            max_concurrent_files: 3,
        }
    }
}

impl PerformanceConfig {
    pub fn processing_throttle(&self) -> Duration {
        Duration::from_millis(self.processing_throttle)
    }

    /// Concurrency cap for batches, never below one.
    pub fn concurrency_limit(&self) -> usize {
        self.max_concurrent_files.max(1)
    }
}

/// How much error detail `SpreadsheetService::process` exposes to callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorDetail {
    /// Internal failures collapse into one generic message.
    #[default]
    Generic,
    /// Underlying errors propagate unmodified. Meant for diagnostics and tests.
    Verbose,
}

impl FromStr for ErrorDetail {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "generic" => Ok(Self::Generic),
            "verbose" => Ok(Self::Verbose),
            other => bail!("Unknown error detail mode '{}' (expected generic or verbose)", other),
        }
    }
}
