//! Column-mapping state machine for one mapping session.
//!
//! Holds the user's column → field mappings across one or more files, runs
//! batches through [`SpreadsheetService`] with a concurrency cap, validates
//! required fields and hands the finished mapping to the caller's callback.
//! Observers get a fresh [`MapperState`] snapshot after every mutation via
//! [`SpreadsheetMapper::subscribe`].

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::config::SpreadsheetConfig;
use crate::error::ProcessingError;
use crate::file::FileHandle;
use crate::schema::{
    FieldMapping, FileProcessingState, FileStatus, FinishedMapping, MappedField, MappingError,
    MappingErrorKind, MappingOption, MappingScope, PerformanceMetrics, PerformanceSummary,
    SpreadsheetData,
};
use crate::service::SpreadsheetService;

pub type FinishCallback = Box<dyn Fn(FinishedMapping) + Send + Sync>;
pub type AnnounceCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Everything a UI needs to render the session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MapperState {
    pub map: Vec<MappedField>,
    pub errors: Vec<MappingError>,
    pub processed_files: Vec<SpreadsheetData>,
    pub file_states: Vec<FileProcessingState>,
    pub is_processing: bool,
    pub metrics: Vec<PerformanceMetrics>,
}

/// State plus the channel snapshots are published on.
struct Shared {
    state: Mutex<MapperState>,
    updates: watch::Sender<MapperState>,
}

impl Shared {
    fn new() -> Self {
        let (updates, _) = watch::channel(MapperState::default());
        Self {
            state: Mutex::new(MapperState::default()),
            updates,
        }
    }

    /// Mutate under the lock, then publish the new snapshot.
    fn update<R>(&self, f: impl FnOnce(&mut MapperState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let result = f(&mut state);
        self.updates.send_replace(state.clone());
        result
    }

    fn read<R>(&self, f: impl FnOnce(&MapperState) -> R) -> R {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }
}

pub struct SpreadsheetMapper {
    options: Vec<MappingOption>,
    config: Arc<SpreadsheetConfig>,
    client_id: Option<String>,
    service: Arc<SpreadsheetService>,
    shared: Arc<Shared>,
    on_finish: FinishCallback,
    on_announce: Option<AnnounceCallback>,
}

impl SpreadsheetMapper {
    pub fn new(
        service: Arc<SpreadsheetService>,
        options: Vec<MappingOption>,
        on_finish: impl Fn(FinishedMapping) + Send + Sync + 'static,
    ) -> Self {
        Self {
            options,
            config: Arc::new(SpreadsheetConfig::default()),
            client_id: None,
            service,
            shared: Arc::new(Shared::new()),
            on_finish: Box::new(on_finish),
            on_announce: None,
        }
    }

    pub fn with_config(mut self, config: SpreadsheetConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_announcer(mut self, on_announce: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_announce = Some(Box::new(on_announce));
        self
    }

    /// Current state snapshot.
    pub fn state(&self) -> MapperState {
        self.shared.read(MapperState::clone)
    }

    /// Receive a snapshot after every state change.
    pub fn subscribe(&self) -> watch::Receiver<MapperState> {
        self.shared.updates.subscribe()
    }

    /// Forward a status message to the announcer, if any.
    pub fn announce(&self, message: &str) {
        debug!("announce: {}", message);
        if let Some(on_announce) = &self.on_announce {
            on_announce(message);
        }
    }

    /// Insert a mapping, replacing the entry with the same value and a compatible file scope.
    pub fn update_or_create(&self, record: MappedField) {
        self.shared.update(|state| {
            match state
                .map
                .iter()
                .position(|m| m.matches(&record.value, &record.scope))
            {
                Some(idx) => state.map[idx] = record,
                None => state.map.push(record),
            }
        });
    }

    /// Toggle `saved` on the matching mapping. Returns false when nothing matched.
    pub fn save(&self, value: &str, file_name: Option<&str>) -> bool {
        let scope = MappingScope::from(file_name.map(str::to_string));
        self.shared.update(|state| {
            match state.map.iter_mut().find(|m| m.matches(value, &scope)) {
                Some(mapping) => {
                    mapping.saved = !mapping.saved;
                    true
                }
                None => false,
            }
        })
    }

    /// Process a batch of files with at most `maxConcurrentFiles` in flight.
    ///
    /// Per-batch results are reset first; mappings are kept. A failing file
    /// is recorded as an error and never stops its siblings. Dropping the
    /// returned future aborts the files still in flight. An empty batch only
    /// clears the previous batch's results.
    pub async fn handle_files(&self, files: Vec<Arc<dyn FileHandle>>) {
        let limit = self.config.performance.concurrency_limit();

        self.shared.update(|state| {
            state.processed_files.clear();
            state.errors.clear();
            state.metrics.clear();
            state.file_states = files
                .iter()
                .enumerate()
                .map(|(id, file)| FileProcessingState {
                    id,
                    file_name: file.name().to_string(),
                    file_size: file.size(),
                    status: FileStatus::Pending,
                    error: None,
                    data: None,
                })
                .collect();
            state.is_processing = !files.is_empty();
        });

        if files.is_empty() {
            debug!("Empty batch, nothing to process");
            return;
        }

        info!(
            "Starting batch of {} file(s), concurrency limit {}",
            files.len(),
            limit
        );
        self.announce(&format!("Processing {} file(s)", files.len()));

        let semaphore = Arc::new(Semaphore::new(limit));
        let mut tasks = JoinSet::new();

        for (id, file) in files.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let shared = Arc::clone(&self.shared);
            let service = Arc::clone(&self.service);
            let config = Arc::clone(&self.config);
            let client_id = self.client_id.clone();

            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                shared.update(|state| set_status(state, id, FileStatus::Processing));

                let result = service
                    .process(file.as_ref(), &config, client_id.as_deref())
                    .await;
                shared.update(|state| record_result(state, id, file.name(), result));
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("File task did not complete: {}", e);
            }
        }

        let (completed, failed) = self.shared.update(|state| {
            for file_state in state.file_states.iter_mut() {
                if !file_state.status.is_terminal() {
                    file_state.status = FileStatus::Error;
                    file_state.error = Some("Processing did not complete".to_string());
                }
            }
            state.is_processing = false;

            let completed = state
                .file_states
                .iter()
                .filter(|f| f.status == FileStatus::Completed)
                .count();
            (completed, state.file_states.len() - completed)
        });

        info!("Batch finished: {} completed, {} failed", completed, failed);
        self.announce(&format!(
            "Finished processing: {} succeeded, {} failed",
            completed, failed
        ));
    }

    /// Validate and finish the session's first processed file.
    pub fn finish(&self) -> Option<FinishedMapping> {
        let first = self.shared.read(|state| state.processed_files.first().cloned());
        match first {
            Some(data) => self.handle_file_finish(&data),
            None => {
                self.announce("No spreadsheet data to finish");
                None
            }
        }
    }

    /// Check required options against saved mappings for `file_data` and,
    /// when all are satisfied, call `on_finish` with the file's mappings.
    ///
    /// When any mapping names a file, only mappings applying to
    /// `file_data.name` count. Returns the payload handed to `on_finish`, or
    /// `None` when required fields are still missing.
    pub fn handle_file_finish(&self, file_data: &SpreadsheetData) -> Option<FinishedMapping> {
        let options = &self.options;
        let outcome = self.shared.update(|state| {
            let per_file = state.map.iter().any(|m| !m.scope.is_any());
            let applies = |m: &MappedField| !per_file || m.scope.applies_to(&file_data.name);

            state.errors = options
                .iter()
                .filter(|option| option.required)
                .filter(|option| {
                    !state
                        .map
                        .iter()
                        .any(|m| m.value == option.value && m.saved && applies(m))
                })
                .map(|option| MappingError {
                    option: option.clone(),
                    message: format!("{} is required", option.label),
                    kind: MappingErrorKind::Validation,
                })
                .collect();

            if !state.errors.is_empty() {
                return Err(state.errors.len());
            }

            Ok(state
                .map
                .iter()
                .filter(|m| applies(m))
                .map(|m| FieldMapping {
                    field: m.field.clone(),
                    value: m.value.clone(),
                })
                .collect::<Vec<_>>())
        });

        match outcome {
            Ok(map) => {
                info!("Mapping finished for {} ({} fields)", file_data.name, map.len());
                let finished = FinishedMapping {
                    data: file_data.clone(),
                    map,
                };
                (self.on_finish)(finished.clone());
                self.announce(&format!("Mapping complete for {}", file_data.name));
                Some(finished)
            }
            Err(missing) => {
                debug!(
                    "Cannot finish {}: {} required field(s) unmapped",
                    file_data.name, missing
                );
                self.announce(&format!(
                    "{} required field(s) still need a saved mapping",
                    missing
                ));
                None
            }
        }
    }

    /// Back to the initial state.
    pub fn reset(&self) {
        self.shared.update(|state| *state = MapperState::default());
    }

    /// Totals and averages over recorded metrics, or `None` when there are none.
    pub fn performance_summary(&self) -> Option<PerformanceSummary> {
        self.shared
            .read(|state| PerformanceSummary::from_metrics(&state.metrics))
    }
}

fn set_status(state: &mut MapperState, id: usize, status: FileStatus) {
    if let Some(file_state) = state.file_states.get_mut(id) {
        file_state.status = status;
    }
}

fn record_result(
    state: &mut MapperState,
    id: usize,
    file_name: &str,
    result: Result<SpreadsheetData, ProcessingError>,
) {
    let Some(file_state) = state.file_states.get_mut(id) else {
        return;
    };

    match result {
        Ok(data) => {
            file_state.status = FileStatus::Completed;
            file_state.data = Some(data.clone());
            if let Some(metrics) = &data.metrics {
                state.metrics.push(metrics.clone());
            }
            state.processed_files.push(data);
        }
        Err(e) => {
            let message = e.to_string();
            file_state.status = FileStatus::Error;
            file_state.error = Some(message.clone());
            state.errors.push(MappingError {
                option: MappingOption::new(file_name, file_name),
                message: format!("{}: {}", file_name, message),
                kind: MappingErrorKind::Security,
            });
        }
    }
}
