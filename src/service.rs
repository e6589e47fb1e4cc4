//! Per-file processing pipeline.
//!
//! validate → rate-limit → throttle → read → extract → project → metrics.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::config::{ErrorDetail, SpreadsheetConfig};
use crate::error::ProcessingError;
use crate::file::FileHandle;
use crate::rate_limit::{RateLimiter, DEFAULT_CLIENT_ID};
use crate::reader;
use crate::sanitize;
use crate::schema::{PerformanceMetrics, SpreadsheetData};
use crate::sheet_extractor::{self, ExtractedSheet};
use crate::sheet_parser::{CalamineParser, WorkbookParser};
use crate::validator;

/// Processing orchestrator. Cheap to share behind an `Arc`.
pub struct SpreadsheetService {
    rate_limiter: Arc<RateLimiter>,
    parser: Arc<dyn WorkbookParser>,
    error_detail: ErrorDetail,
}

impl SpreadsheetService {
    /// Service with an in-memory rate-limit table and the calamine parser.
    pub fn new(error_detail: ErrorDetail) -> Self {
        Self {
            rate_limiter: Arc::new(RateLimiter::default()),
            parser: Arc::new(CalamineParser),
            error_detail,
        }
    }

    pub fn with_rate_limiter(mut self, rate_limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    pub fn with_parser(mut self, parser: Arc<dyn WorkbookParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Process one file into its preview data.
    ///
    /// User-facing errors (see [`ProcessingError::is_user_facing`]) are always
    /// returned as-is. Other failures are collapsed into
    /// [`ProcessingError::Failed`] unless the service was built with
    /// [`ErrorDetail::Verbose`].
    pub async fn process(
        &self,
        file: &dyn FileHandle,
        config: &SpreadsheetConfig,
        client_id: Option<&str>,
    ) -> Result<SpreadsheetData, ProcessingError> {
        let started = Instant::now();
        let client_id = client_id.unwrap_or(DEFAULT_CLIENT_ID);
        info!(
            "Processing file: {} ({} bytes) for client '{}'",
            file.name(),
            file.size(),
            client_id
        );

        match self.admit_and_run(file, config, client_id, started).await {
            Ok(data) => {
                info!(
                    "Processed {}: {} columns, {} preview rows in {:.1}ms",
                    data.name,
                    data.columns.len(),
                    data.data.len(),
                    started.elapsed().as_secs_f64() * 1000.0
                );
                Ok(data)
            }
            Err(e) if self.error_detail == ErrorDetail::Verbose || e.is_user_facing() => Err(e),
            Err(e) => {
                error!("Processing {} failed: {}", file.name(), e);
                Err(ProcessingError::Failed)
            }
        }
    }

    async fn admit_and_run(
        &self,
        file: &dyn FileHandle,
        config: &SpreadsheetConfig,
        client_id: &str,
        started: Instant,
    ) -> Result<SpreadsheetData, ProcessingError> {
        let validation = validator::validate(file, &config.security);
        for warning in &validation.warnings {
            warn!("{}: {}", file.name(), warning);
        }
        if !validation.is_valid {
            warn!("Rejected {}: {}", file.name(), validation.errors.join("; "));
            return Err(ProcessingError::Validation {
                errors: validation.errors,
            });
        }

        if !self.rate_limiter.allow(client_id, &config.security) {
            return Err(ProcessingError::RateLimited);
        }

        self.run_pipeline(file, config, started).await
    }

    async fn run_pipeline(
        &self,
        file: &dyn FileHandle,
        config: &SpreadsheetConfig,
        started: Instant,
    ) -> Result<SpreadsheetData, ProcessingError> {
        let throttle = config.performance.processing_throttle();
        if !throttle.is_zero() {
            tokio::time::sleep(throttle).await;
        }

        let bytes = reader::read(file, &config.performance).await?;
        debug!("Read {} bytes from {}", bytes.len(), file.name());

        let extracted = self.extract(file.name(), bytes, config).await?;
        let data = sanitize::project(
            &extracted.rows,
            &extracted.columns,
            config.preview_row_count,
            config.security.sanitize_data,
        );

        let metrics = config.performance.enable_metrics.then(|| PerformanceMetrics {
            file_size: file.size(),
            processing_time: started.elapsed().as_secs_f64() * 1000.0,
            row_count: extracted.rows.len(),
            memory_usage: Some(sanitize::estimate_memory(&data)),
        });

        Ok(SpreadsheetData {
            name: file.name().to_string(),
            columns: extracted.columns,
            data,
            metrics,
        })
    }

    /// Parsing is CPU-bound, so it runs on the blocking pool.
    async fn extract(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
        config: &SpreadsheetConfig,
    ) -> Result<ExtractedSheet, ProcessingError> {
        let parser = Arc::clone(&self.parser);
        let file_name = file_name.to_string();
        let config = config.clone();

        tokio::task::spawn_blocking(move || {
            sheet_extractor::extract(parser.as_ref(), &file_name, &bytes, &config)
        })
        .await
        .map_err(|e| ProcessingError::parse(format!("parser task failed: {}", e)))?
    }
}

impl Default for SpreadsheetService {
    fn default() -> Self {
        Self::new(ErrorDetail::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PerformanceConfig, SecurityConfig, SheetSelector};
    use crate::file::MemoryFile;
    use serde_json::json;

    fn fast_config() -> SpreadsheetConfig {
        SpreadsheetConfig {
            performance: PerformanceConfig {
                processing_throttle: 0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn people_csv() -> MemoryFile {
        MemoryFile::new("people.csv", b"Name,Age,Email\nJohn,25,john@x.com\nBob\n".to_vec())
            .with_mime_type("text/csv")
    }

    #[tokio::test]
    async fn test_csv_round_trip() {
        let service = SpreadsheetService::new(ErrorDetail::Verbose);
        let data = service
            .process(&people_csv(), &fast_config(), Some("c1"))
            .await
            .unwrap();

        assert_eq!(data.name, "people.csv");
        assert_eq!(data.columns, vec!["Name", "Age", "Email"]);
        assert_eq!(
            serde_json::to_value(&data.data).unwrap(),
            json!([
                {"Name": "John", "Age": 25, "Email": "john@x.com"},
                {"Name": "Bob", "Age": "", "Email": ""}
            ])
        );
        assert!(data.metrics.is_none());
    }

    #[tokio::test]
    async fn test_metrics_attached_when_enabled() {
        let service = SpreadsheetService::new(ErrorDetail::Verbose);
        let mut config = fast_config();
        config.performance.enable_metrics = true;
        config.preview_row_count = 1;

        let data = service.process(&people_csv(), &config, None).await.unwrap();
        let metrics = data.metrics.unwrap();
        assert_eq!(metrics.file_size, people_csv().size());
        assert_eq!(metrics.row_count, 2);
        assert!(metrics.processing_time >= 0.0);
        assert!(metrics.memory_usage.unwrap() > 0);
        assert_eq!(data.data.len(), 1);
    }

    #[tokio::test]
    async fn test_validation_failure_is_reported() {
        let service = SpreadsheetService::default();
        let mut config = fast_config();
        config.security = SecurityConfig {
            max_file_size: 4,
            ..Default::default()
        };

        let err = service.process(&people_csv(), &config, None).await.unwrap_err();
        assert!(matches!(err, ProcessingError::Validation { .. }));
        assert!(err.to_string().contains("exceeds maximum allowed size"));
    }

    #[tokio::test]
    async fn test_rate_limit_denies_extra_submission() {
        let service = SpreadsheetService::default();
        let mut config = fast_config();
        config.security.max_files_per_window = 2;

        for _ in 0..2 {
            service.process(&people_csv(), &config, Some("burst")).await.unwrap();
        }
        let err = service
            .process(&people_csv(), &config, Some("burst"))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Rate limit exceeded"));

        // Another client is unaffected
        service.process(&people_csv(), &config, Some("calm")).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_files_do_not_consume_rate_limit() {
        let service = SpreadsheetService::default();
        let mut config = fast_config();
        config.security.max_files_per_window = 1;

        let bad = MemoryFile::new("evil.exe", b"MZ".to_vec());
        assert!(service.process(&bad, &config, Some("c")).await.is_err());
        service.process(&people_csv(), &config, Some("c")).await.unwrap();
    }

    #[tokio::test]
    async fn test_generic_mode_masks_internal_errors() {
        let broken = MemoryFile::new("broken.xlsx", b"not a workbook".to_vec());

        let generic = SpreadsheetService::new(ErrorDetail::Generic);
        let err = generic.process(&broken, &fast_config(), None).await.unwrap_err();
        assert!(matches!(err, ProcessingError::Failed));
        assert!(err.to_string().starts_with("File processing failed"));

        let verbose = SpreadsheetService::new(ErrorDetail::Verbose);
        let err = verbose.process(&broken, &fast_config(), None).await.unwrap_err();
        assert!(matches!(err, ProcessingError::Parse { .. }));
    }

    #[tokio::test]
    async fn test_generic_mode_keeps_rejections_visible() {
        let service = SpreadsheetService::new(ErrorDetail::Generic);
        let mut config = fast_config();
        config.security.max_files_per_window = 1;

        let bad = MemoryFile::new("evil.exe", b"MZ".to_vec());
        let err = service.process(&bad, &config, Some("g")).await.unwrap_err();
        assert!(matches!(err, ProcessingError::Validation { .. }));

        service.process(&people_csv(), &config, Some("g")).await.unwrap();
        let err = service.process(&people_csv(), &config, Some("g")).await.unwrap_err();
        assert!(matches!(err, ProcessingError::RateLimited));
    }

    #[tokio::test]
    async fn test_sheet_errors_surface_in_verbose_mode() {
        let service = SpreadsheetService::new(ErrorDetail::Verbose);
        let mut config = fast_config();
        config.sheet = SheetSelector::Index(5);

        let err = service.process(&people_csv(), &config, None).await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid sheet selection");

        config.sheet = SheetSelector::Name("Nope".to_string());
        let err = service.process(&people_csv(), &config, None).await.unwrap_err();
        assert_eq!(err.to_string(), "Named sheet not found");
    }

    #[tokio::test]
    async fn test_sanitize_strips_script_from_cells() {
        let service = SpreadsheetService::default();
        let file = MemoryFile::new(
            "xss.csv",
            b"Name,Note\nEve,Hi <script>alert(1)</script>there\n".to_vec(),
        );
        let data = service.process(&file, &fast_config(), None).await.unwrap();
        assert_eq!(data.data[0]["Note"], json!("Hi there"));
    }

    #[tokio::test]
    async fn test_chunked_read_produces_same_result() {
        let service = SpreadsheetService::default();
        let mut config = fast_config();
        config.performance.chunk_size = 7;

        let data = service.process(&people_csv(), &config, None).await.unwrap();
        assert_eq!(data.columns, vec!["Name", "Age", "Email"]);
        assert_eq!(data.data[0]["Email"], json!("john@x.com"));
    }
}
