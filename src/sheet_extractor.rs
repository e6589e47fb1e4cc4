//! Sheet selection and header/data row splitting.

use std::collections::HashSet;

use serde_json::Value;
use tracing::debug;

use crate::config::{SheetSelector, SpreadsheetConfig};
use crate::error::ProcessingError;
use crate::sheet_parser::{Workbook, WorkbookParser, Worksheet};

/// Column names beyond this are dropped to bound memory.
pub const MAX_COLUMNS: usize = 100;

/// Placeholder name for blank header cells.
const EMPTY_HEADER: &str = "__EMPTY";

/// Header and data rows of the selected sheet.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedSheet {
    pub sheet_name: String,
    pub columns: Vec<String>,
    /// Data rows only; the header row is never included.
    pub rows: Vec<Vec<Value>>,
}

/// Parse `data`, pick the configured sheet, and split it into header and rows.
pub fn extract(
    parser: &dyn WorkbookParser,
    file_name: &str,
    data: &[u8],
    config: &SpreadsheetConfig,
) -> Result<ExtractedSheet, ProcessingError> {
    let workbook = parser.parse(file_name, data)?;
    let sheet = resolve_sheet(&workbook, &config.sheet)?;
    debug!(
        "Selected sheet '{}' ({} raw rows) from '{}'",
        sheet.name,
        sheet.rows.len(),
        file_name
    );

    let (columns, rows) = split_rows(&sheet.rows, config)?;
    Ok(ExtractedSheet {
        sheet_name: sheet.name.clone(),
        columns,
        rows,
    })
}

/// Find the sheet by zero-based index or by exact name.
pub fn resolve_sheet<'a>(
    workbook: &'a Workbook,
    selector: &SheetSelector,
) -> Result<&'a Worksheet, ProcessingError> {
    match selector {
        SheetSelector::Index(idx) => workbook
            .sheets
            .get(*idx)
            .ok_or(ProcessingError::InvalidSheetSelection),
        SheetSelector::Name(name) => workbook
            .sheets
            .iter()
            .find(|s| &s.name == name)
            .ok_or_else(|| {
                debug!(
                    "No sheet named '{}', available: {:?}",
                    name,
                    workbook.sheet_names()
                );
                ProcessingError::NamedSheetNotFound
            }),
    }
}

/// Split a row matrix into column names and data rows per the layout config.
///
/// An empty matrix is rejected in both header modes, and so is a header row
/// with no non-blank cell.
pub fn split_rows(
    matrix: &[Vec<Value>],
    config: &SpreadsheetConfig,
) -> Result<(Vec<String>, Vec<Vec<Value>>), ProcessingError> {
    if matrix.is_empty() {
        return Err(ProcessingError::HeaderUnavailable);
    }

    if config.omit_header {
        let width = matrix[0].len().min(MAX_COLUMNS);
        let columns = (0..width).map(column_letter).collect();
        let start = config
            .data_start_row
            .map(|r| r.saturating_sub(1))
            .unwrap_or(0);
        let rows = matrix.iter().skip(start).cloned().collect();
        return Ok((columns, rows));
    }

    if config.header_row == 0 || config.header_row > matrix.len() {
        return Err(ProcessingError::HeaderOutOfBounds);
    }
    let header_idx = config.header_row - 1;
    if matrix[header_idx].iter().all(is_blank) {
        return Err(ProcessingError::HeaderUnavailable);
    }

    let names = matrix[header_idx]
        .iter()
        .take(MAX_COLUMNS)
        .map(header_cell_to_name)
        .collect();
    let columns = dedupe_columns(names);

    let start = config
        .data_start_row
        .map(|r| r.saturating_sub(1))
        .unwrap_or(header_idx + 1);
    let rows = matrix
        .iter()
        .enumerate()
        .skip(start)
        .filter(|(idx, _)| *idx != header_idx)
        .map(|(_, row)| row.clone())
        .collect();

    Ok((columns, rows))
}

/// Spreadsheet-style column letters: 0 → A, 25 → Z, 26 → AA.
pub fn column_letter(idx: usize) -> String {
    let mut letters = Vec::new();
    let mut n = idx + 1;
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push((b'A' + rem as u8) as char);
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect()
}

fn is_blank(cell: &Value) -> bool {
    match cell {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn header_cell_to_name(cell: &Value) -> String {
    let name = match cell {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    };
    if name.is_empty() {
        EMPTY_HEADER.to_string()
    } else {
        name
    }
}

/// Make names unique by suffixing repeats with `_1`, `_2`, ...
fn dedupe_columns(names: Vec<String>) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut result = Vec::with_capacity(names.len());

    for name in names {
        let mut candidate = name.clone();
        let mut n = 1;
        while seen.contains(&candidate) {
            candidate = format!("{}_{}", name, n);
            n += 1;
        }
        seen.insert(candidate.clone());
        result.push(candidate);
    }

    result
}
