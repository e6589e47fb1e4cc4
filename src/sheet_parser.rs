//! Workbook parsing for CSV and Excel-family files (.xlsx/.xlsm/.xlsb/.xls/.ods).
//!
//! The [`WorkbookParser`] trait is the seam to the parsing library; the
//! default [`CalamineParser`] uses calamine for workbooks and the csv crate for CSV.
//!
//! Rows are anchored at A1: a sheet whose used range starts lower keeps its
//! leading blank rows, so `headerRow` counts rows the way the user sees them.

use std::io::Cursor;

use calamine::{open_workbook_auto_from_rs, Data, Range, Reader};
use chrono::{NaiveDate, NaiveTime, TimeDelta};
use serde_json::{Number, Value};
use tracing::{debug, warn};

use crate::error::ProcessingError;

/// One worksheet as a row-major matrix of raw cell values.
#[derive(Debug, Clone, PartialEq)]
pub struct Worksheet {
    pub name: String,
    pub rows: Vec<Vec<Value>>,
}

/// All sheets of a parsed file, in workbook order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Workbook {
    pub sheets: Vec<Worksheet>,
}

impl Workbook {
    pub fn sheet_names(&self) -> Vec<&str> {
        self.sheets.iter().map(|s| s.name.as_str()).collect()
    }
}

/// Turns raw bytes into named sheets of rows.
pub trait WorkbookParser: Send + Sync {
    fn parse(&self, file_name: &str, data: &[u8]) -> Result<Workbook, ProcessingError>;
}

/// Default parser: csv crate for `.csv`, calamine format sniffing for everything else.
#[derive(Debug, Default, Clone, Copy)]
pub struct CalamineParser;

impl WorkbookParser for CalamineParser {
    fn parse(&self, file_name: &str, data: &[u8]) -> Result<Workbook, ProcessingError> {
        let ext = file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            "csv" => parse_csv(file_name, data),
            _ => parse_workbook(data),
        }
    }
}

/// Parse a CSV file into a single sheet. No header handling happens here.
fn parse_csv(file_name: &str, data: &[u8]) -> Result<Workbook, ProcessingError> {
    let data = data.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(data);

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .has_headers(false)
        .from_reader(data);

    let mut rows = Vec::new();
    for result in reader.records() {
        let record =
            result.map_err(|e| ProcessingError::parse(format!("invalid CSV record: {}", e)))?;
        rows.push(record.iter().map(csv_field_to_value).collect());
    }

    let name = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(file_name);
    let name = match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    }
    .to_string();

    debug!("Parsed CSV '{}' into {} rows", name, rows.len());
    Ok(Workbook {
        sheets: vec![Worksheet { name, rows }],
    })
}

/// Parse any calamine-supported workbook. Every worksheet is kept so indices stay stable.
fn parse_workbook(data: &[u8]) -> Result<Workbook, ProcessingError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(data))
        .map_err(|e| ProcessingError::parse(format!("unrecognized workbook: {}", e)))?;

    let sheet_names: Vec<String> = workbook.sheet_names().to_vec();
    let mut sheets = Vec::with_capacity(sheet_names.len());

    for name in sheet_names {
        let rows = match workbook.worksheet_range(&name) {
            Ok(range) => range_to_rows(&range),
            Err(e) => {
                warn!("Sheet '{}' could not be read, treating as empty: {}", name, e);
                Vec::new()
            }
        };
        sheets.push(Worksheet { name, rows });
    }

    if sheets.is_empty() {
        return Err(ProcessingError::parse("workbook has no sheets"));
    }

    debug!("Parsed workbook with {} sheet(s)", sheets.len());
    Ok(Workbook { sheets })
}

/// Convert a calamine Range into rows anchored at A1.
///
/// calamine trims leading empty rows and columns; they are padded back so
/// 1-indexed row settings refer to the sheet as the user sees it.
fn range_to_rows(range: &Range<Data>) -> Vec<Vec<Value>> {
    let Some((start_row, start_col)) = range.start() else {
        return Vec::new();
    };

    let mut rows: Vec<Vec<Value>> = (0..start_row).map(|_| Vec::new()).collect();
    for row in range.rows() {
        let mut values = Vec::with_capacity(start_col as usize + row.len());
        values.extend((0..start_col).map(|_| Value::String(String::new())));
        values.extend(row.iter().map(cell_to_value));
        rows.push(values);
    }
    rows
}

/// Convert a calamine cell, keeping numbers and booleans typed.
fn cell_to_value(cell: &Data) -> Value {
    match cell {
        Data::Empty => Value::String(String::new()),
        Data::String(s) => Value::String(s.clone()),
        Data::Int(i) => Value::Number((*i).into()),
        Data::Float(f) => float_to_value(*f),
        Data::Bool(b) => Value::Bool(*b),
        Data::DateTime(dt) => Value::String(excel_serial_to_string(dt.as_f64())),
        Data::DateTimeIso(s) => Value::String(s.clone()),
        Data::DurationIso(s) => Value::String(s.clone()),
        Data::Error(e) => Value::String(format!("#ERR:{:?}", e)),
    }
}

fn float_to_value(f: f64) -> Value {
    // Whole numbers become integers so 25.0 reads back as 25
    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        return Value::Number((f as i64).into());
    }
    match Number::from_f64(f) {
        Some(n) => Value::Number(n),
        None => Value::String(f.to_string()),
    }
}

/// Type a CSV field the way spreadsheet readers do: integers, floats and
/// TRUE/FALSE become typed values, everything else stays a string.
fn csv_field_to_value(field: &str) -> Value {
    if field.is_empty() {
        return Value::String(String::new());
    }
    if let Ok(i) = field.parse::<i64>() {
        return Value::Number(i.into());
    }
    if field.bytes().any(|b| b.is_ascii_digit()) {
        if let Ok(f) = field.parse::<f64>() {
            if let Some(n) = Number::from_f64(f) {
                return Value::Number(n);
            }
        }
    }
    if field.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if field.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    Value::String(field.to_string())
}

/// Render an Excel serial date as `YYYY-MM-DD`, adding ` HH:MM:SS` when the
/// serial carries a time of day.
///
/// Serials count days from 1899-12-30, except that Excel also counts a
/// 1900-02-29 that never existed, so serials below 60 are one day short.
fn excel_serial_to_string(serial: f64) -> String {
    let whole_days = serial.floor();
    let mut days = whole_days as i64;
    if days < 60 {
        days += 1;
    }
    let secs = ((serial - whole_days) * 86_400.0).round() as i64;

    let datetime = NaiveDate::from_ymd_opt(1899, 12, 30)
        .and_then(|epoch| epoch.and_hms_opt(0, 0, 0))
        .zip(TimeDelta::try_days(days))
        .and_then(|(epoch, offset)| epoch.checked_add_signed(offset))
        .zip(TimeDelta::try_seconds(secs))
        .and_then(|(date, time)| date.checked_add_signed(time));

    match datetime {
        Some(dt) if dt.time() == NaiveTime::MIN => dt.format("%Y-%m-%d").to_string(),
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => serial.to_string(),
    }
}
