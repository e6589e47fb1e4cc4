//! sheetmap - spreadsheet ingestion and column-mapping server.

use anyhow::Context;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use sheetmap::config::{ErrorDetail, SheetSelector, SpreadsheetConfig};
use sheetmap::error::{ErrorCategory, ProcessingError};
use sheetmap::file::{FileHandle, MemoryFile};
use sheetmap::mapper::{MapperState, SpreadsheetMapper};
use sheetmap::schema::{FinishedMapping, MappedField, MappingOption, PerformanceSummary};
use sheetmap::service::SpreadsheetService;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// A mapping session and when a request last touched it.
#[derive(Clone)]
struct Session {
    mapper: Arc<SpreadsheetMapper>,
    last_seen: Arc<Mutex<Instant>>,
}

impl Session {
    fn new(mapper: SpreadsheetMapper) -> Self {
        Self {
            mapper: Arc::new(mapper),
            last_seen: Arc::new(Mutex::new(Instant::now())),
        }
    }

    fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        let last_seen = *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner);
        now.saturating_duration_since(last_seen)
    }
}

type SessionMap = Arc<RwLock<HashMap<String, Session>>>;

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    service: Arc<SpreadsheetService>,
    config: Arc<SpreadsheetConfig>,
    sessions: SessionMap,
}

type ApiError = (StatusCode, Json<serde_json::Value>);

/// Server settings read from the environment.
struct Settings {
    bind_addr: String,
    config_path: String,
    error_detail: ErrorDetail,
    max_upload_bytes: usize,
    session_ttl: Duration,
}

impl Settings {
    fn from_env() -> anyhow::Result<Self> {
        let error_detail = match std::env::var("ERROR_DETAIL") {
            Ok(value) => value
                .parse::<ErrorDetail>()
                .with_context(|| format!("Invalid ERROR_DETAIL '{}'", value))?,
            Err(_) => ErrorDetail::Generic,
        };
        let max_upload_bytes = match std::env::var("MAX_UPLOAD_BYTES") {
            Ok(value) => value
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid MAX_UPLOAD_BYTES '{}': {}", value, e))?,
            Err(_) => 100 * 1024 * 1024,
        };
        let session_ttl_secs: u64 = match std::env::var("SESSION_TTL_SECS") {
            Ok(value) => value
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid SESSION_TTL_SECS '{}': {}", value, e))?,
            Err(_) => 60 * 60,
        };

        Ok(Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            config_path: std::env::var("SPREADSHEET_CONFIG")
                .unwrap_or_else(|_| "configs/default.json".to_string()),
            error_detail,
            max_upload_bytes,
            session_ttl: Duration::from_secs(session_ttl_secs),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "sheetmap=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env()?;
    let config = SpreadsheetConfig::load_or_default(std::path::Path::new(&settings.config_path))?;
    info!("Error detail mode: {:?}", settings.error_detail);

    let state = AppState {
        service: Arc::new(SpreadsheetService::new(settings.error_detail)),
        config: Arc::new(config),
        sessions: Arc::new(RwLock::new(HashMap::new())),
    };
    tokio::spawn(expire_idle_sessions(
        Arc::clone(&state.sessions),
        settings.session_ttl,
    ));

    // Build router
    let app = Router::new()
        .route("/health", get(health))
        .route("/config", get(get_config))
        .route("/process", post(process_file))
        .route("/sessions", post(create_session))
        .route("/sessions/:id", get(get_session).delete(delete_session))
        .route("/sessions/:id/files", post(upload_files))
        .route("/sessions/:id/mappings", put(update_mapping))
        .route("/sessions/:id/mappings/:value/save", post(save_mapping))
        .route("/sessions/:id/finish", post(finish_session))
        .route("/sessions/:id/reset", post(reset_session))
        .route("/sessions/:id/summary", get(session_summary))
        .layer(DefaultBodyLimit::max(settings.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    // Run server
    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    info!("Server listening on http://{}", settings.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

/// Default processing config.
async fn get_config(State(state): State<AppState>) -> Json<SpreadsheetConfig> {
    Json((*state.config).clone())
}

/// Layout overrides accepted on `/process`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProcessQuery {
    sheet: Option<String>,
    header_row: Option<usize>,
    omit_header: Option<bool>,
    data_start_row: Option<usize>,
    preview_row_count: Option<usize>,
}

impl ProcessQuery {
    fn apply(&self, base: &SpreadsheetConfig) -> SpreadsheetConfig {
        let mut config = base.clone();
        if let Some(ref sheet) = self.sheet {
            config.sheet = SheetSelector::parse(sheet);
        }
        if let Some(header_row) = self.header_row {
            config.header_row = header_row;
        }
        if let Some(omit_header) = self.omit_header {
            config.omit_header = omit_header;
        }
        if self.data_start_row.is_some() {
            config.data_start_row = self.data_start_row;
        }
        if let Some(preview_row_count) = self.preview_row_count {
            config.preview_row_count = preview_row_count;
        }
        config
    }
}

/// Upload one spreadsheet and get its preview.
async fn process_file(
    State(state): State<AppState>,
    Query(query): Query<ProcessQuery>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<sheetmap::SpreadsheetData>, ApiError> {
    let client_id = headers
        .get("x-client-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let file = read_uploads(multipart)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| bad_request("No file uploaded"))?;

    let config = query.apply(&state.config);
    let data = state
        .service
        .process(&file, &config, client_id.as_deref())
        .await
        .map_err(processing_error)?;

    Ok(Json(data))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSession {
    options: Vec<MappingOption>,
    #[serde(default)]
    config: Option<SpreadsheetConfig>,
    #[serde(default)]
    client_id: Option<String>,
}

/// Start a mapping session.
async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSession>,
) -> Json<serde_json::Value> {
    let id = uuid::Uuid::new_v4().simple().to_string();

    let finish_id = id.clone();
    let announce_id = id.clone();
    let mut mapper = SpreadsheetMapper::new(
        Arc::clone(&state.service),
        body.options,
        move |result: FinishedMapping| {
            info!(
                "[session {}] finished {} with {} mapped field(s)",
                finish_id,
                result.data.name,
                result.map.len()
            );
        },
    )
    .with_config(body.config.unwrap_or_else(|| (*state.config).clone()))
    .with_announcer(move |message| info!("[session {}] {}", announce_id, message));

    if let Some(client_id) = body.client_id {
        mapper = mapper.with_client_id(client_id);
    }

    let session = Session::new(mapper);
    state
        .sessions
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(id.clone(), session);

    info!("Created mapping session {}", id);
    Json(json!({ "id": id }))
}

/// Current session state.
async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MapperState>, ApiError> {
    let session = find_session(&state, &id)?;
    Ok(Json(session.mapper.state()))
}

/// Upload a batch of files into a session.
async fn upload_files(
    State(state): State<AppState>,
    Path(id): Path<String>,
    multipart: Multipart,
) -> Result<Json<MapperState>, ApiError> {
    let session = find_session(&state, &id)?;
    let files: Vec<Arc<dyn FileHandle>> = read_uploads(multipart)
        .await?
        .into_iter()
        .map(|f| Arc::new(f) as Arc<dyn FileHandle>)
        .collect();

    if files.is_empty() {
        return Err(bad_request("No file uploaded"));
    }

    session.mapper.handle_files(files).await;
    Ok(Json(session.mapper.state()))
}

/// Create or replace one mapping.
async fn update_mapping(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(record): Json<MappedField>,
) -> Result<Json<MapperState>, ApiError> {
    let session = find_session(&state, &id)?;
    session.mapper.update_or_create(record);
    Ok(Json(session.mapper.state()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileQuery {
    file_name: Option<String>,
}

/// Toggle the saved flag on one mapping.
async fn save_mapping(
    State(state): State<AppState>,
    Path((id, value)): Path<(String, String)>,
    Query(query): Query<FileQuery>,
) -> Result<Json<MapperState>, ApiError> {
    let session = find_session(&state, &id)?;
    if !session.mapper.save(&value, query.file_name.as_deref()) {
        return Err(not_found(&format!("No mapping for '{}'", value)));
    }
    Ok(Json(session.mapper.state()))
}

/// Validate required fields and finish a file's mapping.
async fn finish_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<FileQuery>,
) -> Result<Json<FinishedMapping>, ApiError> {
    let session = find_session(&state, &id)?;

    let finished = match query.file_name {
        Some(ref name) => {
            let data = session
                .mapper
                .state()
                .processed_files
                .into_iter()
                .find(|f| &f.name == name)
                .ok_or_else(|| not_found(&format!("No processed file named '{}'", name)))?;
            session.mapper.handle_file_finish(&data)
        }
        None => session.mapper.finish(),
    };

    finished.map(Json).ok_or_else(|| {
        let errors = session.mapper.state().errors;
        (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({
                "error": "Mapping is incomplete",
                "category": ErrorCategory::Validation,
                "errors": errors,
            })),
        )
    })
}

/// Clear all session state.
async fn reset_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MapperState>, ApiError> {
    let session = find_session(&state, &id)?;
    session.mapper.reset();
    Ok(Json(session.mapper.state()))
}

/// Aggregated performance metrics for the session.
async fn session_summary(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Option<PerformanceSummary>>, ApiError> {
    let session = find_session(&state, &id)?;
    Ok(Json(session.mapper.performance_summary()))
}

/// Drop a session.
async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .sessions
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&id)
        .map(|_| StatusCode::NO_CONTENT)
        .ok_or_else(|| not_found("Unknown session"))
}

// ============================================================================
// Helper functions
// ============================================================================

fn find_session(state: &AppState, id: &str) -> Result<Session, ApiError> {
    let session = state
        .sessions
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(id)
        .cloned()
        .ok_or_else(|| not_found("Unknown session"))?;
    session.touch();
    Ok(session)
}

/// Periodically drop sessions nobody has touched for `ttl`.
async fn expire_idle_sessions(sessions: SessionMap, ttl: Duration) {
    let period = ttl.clamp(Duration::from_secs(1), Duration::from_secs(60));
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let removed = sweep_idle_sessions(&sessions, ttl, Instant::now());
        if removed > 0 {
            info!("Expired {} idle session(s)", removed);
        }
    }
}

fn sweep_idle_sessions(
    sessions: &RwLock<HashMap<String, Session>>,
    ttl: Duration,
    now: Instant,
) -> usize {
    let mut sessions = sessions.write().unwrap_or_else(PoisonError::into_inner);
    let before = sessions.len();
    sessions.retain(|_, session| session.idle_for(now) <= ttl);
    before - sessions.len()
}

/// Collect every multipart field that carries a file name.
async fn read_uploads(mut multipart: Multipart) -> Result<Vec<MemoryFile>, ApiError> {
    let mut files = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(&format!("Multipart error: {}", e)))?
    {
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        let mime_type = field.content_type().unwrap_or_default().to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| bad_request(&format!("Failed to read file: {}", e)))?;

        info!("Received file: {} ({} bytes)", filename, bytes.len());
        files.push(MemoryFile::new(filename, bytes.to_vec()).with_mime_type(mime_type));
    }

    Ok(files)
}

fn processing_error(e: ProcessingError) -> ApiError {
    let status = match e {
        ProcessingError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    };
    warn!("Processing request failed: {}", e);
    (
        status,
        Json(json!({ "error": e.to_string(), "category": e.category() })),
    )
}

fn bad_request(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

fn not_found(message: &str) -> ApiError {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message })))
}
