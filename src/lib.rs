//! Spreadsheet ingestion and column-mapping engine.
//!
//! Parses uploaded CSV/Excel files into header + row previews under
//! configurable layout and security rules, and tracks the user's mapping
//! of source columns onto a fixed set of target fields.

pub mod config;
pub mod error;
pub mod file;
pub mod mapper;
pub mod rate_limit;
pub mod reader;
pub mod sanitize;
pub mod schema;
pub mod service;
pub mod sheet_extractor;
pub mod sheet_parser;
pub mod validator;

pub use config::{ErrorDetail, SheetSelector, SpreadsheetConfig};
pub use error::{ErrorCategory, ProcessingError};
pub use file::{DiskFile, FileHandle, MemoryFile};
pub use mapper::{MapperState, SpreadsheetMapper};
pub use schema::{FinishedMapping, MappedField, MappingOption, SpreadsheetData};
pub use service::SpreadsheetService;
