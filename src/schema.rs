//! Data model shared by the processing pipeline and the mapping state machine.
//!
//! Field names serialize in camelCase to match the JSON contract consumed by UI clients.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One projected row: column name → cell value, in column order.
pub type Row = serde_json::Map<String, Value>;

/// A target field the user can map source columns onto.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingOption {
    pub label: String,
    /// Stable identifier, unique within a mapping session.
    pub value: String,
    #[serde(default)]
    pub required: bool,
}

impl MappingOption {
    pub fn new(label: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            value: value.into(),
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Which file a mapping applies to.
///
/// Serialized as an optional `fileName`; absent means the mapping applies to any file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum MappingScope {
    #[default]
    AnyFile,
    File(String),
}

impl MappingScope {
    pub fn file(name: impl Into<String>) -> Self {
        Self::File(name.into())
    }

    pub fn is_any(&self) -> bool {
        matches!(self, Self::AnyFile)
    }

    /// Two scopes match unless both name a file and the names differ.
    pub fn matches(&self, other: &MappingScope) -> bool {
        match (self, other) {
            (Self::File(a), Self::File(b)) => a == b,
            _ => true,
        }
    }

    /// Whether a mapping with this scope applies to `file_name`.
    pub fn applies_to(&self, file_name: &str) -> bool {
        match self {
            Self::AnyFile => true,
            Self::File(name) => name == file_name,
        }
    }
}

impl From<Option<String>> for MappingScope {
    fn from(value: Option<String>) -> Self {
        match value {
            Some(name) => Self::File(name),
            None => Self::AnyFile,
        }
    }
}

impl From<MappingScope> for Option<String> {
    fn from(scope: MappingScope) -> Self {
        match scope {
            MappingScope::AnyFile => None,
            MappingScope::File(name) => Some(name),
        }
    }
}

/// A user-chosen association between a source column and a target field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedField {
    /// Source column name.
    pub field: String,
    /// Target `MappingOption::value`.
    pub value: String,
    #[serde(default)]
    pub saved: bool,
    #[serde(
        rename = "fileName",
        default,
        skip_serializing_if = "MappingScope::is_any"
    )]
    pub scope: MappingScope,
}

impl MappedField {
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
            saved: false,
            scope: MappingScope::AnyFile,
        }
    }

    pub fn for_file(mut self, file_name: impl Into<String>) -> Self {
        self.scope = MappingScope::file(file_name);
        self
    }

    pub fn saved(mut self) -> Self {
        self.saved = true;
        self
    }

    /// Same target value, and compatible file scope.
    pub fn matches(&self, value: &str, scope: &MappingScope) -> bool {
        self.value == value && self.scope.matches(scope)
    }
}

/// Parsed result for one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpreadsheetData {
    pub name: String,
    /// Distinct column names, in sheet order.
    pub columns: Vec<String>,
    pub data: Vec<Row>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<PerformanceMetrics>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    /// Bytes.
    pub file_size: u64,
    /// Milliseconds.
    pub processing_time: f64,
    pub row_count: usize,
    /// Estimated bytes held by the projected rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<u64>,
}

/// Aggregate of all metrics recorded in a mapping session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSummary {
    pub total_files: usize,
    pub total_file_size: u64,
    pub total_processing_time: f64,
    pub total_rows: usize,
    pub average_file_size: f64,
    pub average_processing_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_memory_usage: Option<u64>,
}

impl PerformanceSummary {
    /// Returns `None` when nothing has been recorded.
    pub fn from_metrics(metrics: &[PerformanceMetrics]) -> Option<Self> {
        if metrics.is_empty() {
            return None;
        }

        let total_files = metrics.len();
        let total_file_size: u64 = metrics.iter().map(|m| m.file_size).sum();
        let total_processing_time: f64 = metrics.iter().map(|m| m.processing_time).sum();
        let total_rows: usize = metrics.iter().map(|m| m.row_count).sum();
        let memory: Vec<u64> = metrics.iter().filter_map(|m| m.memory_usage).collect();

        Some(Self {
            total_files,
            total_file_size,
            total_processing_time,
            total_rows,
            average_file_size: total_file_size as f64 / total_files as f64,
            average_processing_time: total_processing_time / total_files as f64,
            total_memory_usage: if memory.is_empty() {
                None
            } else {
                Some(memory.iter().sum())
            },
        })
    }
}

/// Lifecycle of one file in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

impl FileStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// Per-file record, keyed by its position in the submitted batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileProcessingState {
    pub id: usize,
    pub file_name: String,
    pub file_size: u64,
    pub status: FileStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<SpreadsheetData>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingErrorKind {
    Validation,
    Security,
    Performance,
    Accessibility,
}

/// A problem attached to one target option (or, for file failures, to the file).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MappingError {
    pub option: MappingOption,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: MappingErrorKind,
}

/// A `{field, value}` pair handed to the finish callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldMapping {
    pub field: String,
    pub value: String,
}

/// Payload of the finish callback: the file's data plus its mappings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinishedMapping {
    #[serde(flatten)]
    pub data: SpreadsheetData,
    pub map: Vec<FieldMapping>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scope_matching() {
        let any = MappingScope::AnyFile;
        let a = MappingScope::file("a.csv");
        let b = MappingScope::file("b.csv");
        assert!(any.matches(&a));
        assert!(a.matches(&any));
        assert!(a.matches(&a.clone()));
        assert!(!a.matches(&b));
        assert!(a.applies_to("a.csv"));
        assert!(!a.applies_to("b.csv"));
        assert!(any.applies_to("b.csv"));
    }

    #[test]
    fn test_mapped_field_serializes_file_name() {
        let single = MappedField::new("Name", "name");
        assert_eq!(
            serde_json::to_value(&single).unwrap(),
            json!({"field": "Name", "value": "name", "saved": false})
        );

        let scoped = MappedField::new("Name", "name").for_file("a.csv").saved();
        assert_eq!(
            serde_json::to_value(&scoped).unwrap(),
            json!({"field": "Name", "value": "name", "saved": true, "fileName": "a.csv"})
        );

        let parsed: MappedField =
            serde_json::from_value(json!({"field": "E", "value": "email", "fileName": "x.xlsx"}))
                .unwrap();
        assert_eq!(parsed.scope, MappingScope::file("x.xlsx"));
        assert!(!parsed.saved);
    }

    #[test]
    fn test_summary_empty_is_none() {
        assert!(PerformanceSummary::from_metrics(&[]).is_none());
    }

    #[test]
    fn test_summary_aggregates() {
        let metrics = vec![
            PerformanceMetrics {
                file_size: 100,
                processing_time: 10.0,
                row_count: 3,
                memory_usage: Some(40),
            },
            PerformanceMetrics {
                file_size: 300,
                processing_time: 30.0,
                row_count: 5,
                memory_usage: None,
            },
        ];
        let summary = PerformanceSummary::from_metrics(&metrics).unwrap();
        assert_eq!(summary.total_files, 2);
        assert_eq!(summary.total_file_size, 400);
        assert_eq!(summary.total_rows, 8);
        assert!((summary.average_file_size - 200.0).abs() < f64::EPSILON);
        assert!((summary.average_processing_time - 20.0).abs() < f64::EPSILON);
        assert_eq!(summary.total_memory_usage, Some(40));
    }

    #[test]
    fn test_finished_mapping_flattens_data() {
        let finished = FinishedMapping {
            data: SpreadsheetData {
                name: "people.csv".to_string(),
                columns: vec!["Name".to_string()],
                data: Vec::new(),
                metrics: None,
            },
            map: vec![FieldMapping {
                field: "Name".to_string(),
                value: "name".to_string(),
            }],
        };
        let value = serde_json::to_value(&finished).unwrap();
        assert_eq!(value["name"], "people.csv");
        assert_eq!(value["map"][0], json!({"field": "Name", "value": "name"}));
    }
}
