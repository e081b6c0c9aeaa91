use axum::{
    Extension, Json, Router,
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

use crate::config::{Config, DEFAULT_SHEET};
use crate::error::{AppError, IngestError};
use crate::loader;
use crate::login::{self, CurrentUser, SessionStore, UserStore};
use crate::normalizer::{self, DashboardRecord, RecordKind};
use crate::raw::RawSheet;
use crate::sheets::SheetsClient;
use crate::source::{
    DataSourceDescriptor, DescriptorStore, JsonDescriptorStore, SourceChange, SourceEvent,
    SourceEvents, SourceKind, resolve,
};

/// MIME types accepted for upload, with the extension used to store them
const ALLOWED_UPLOADS: &[(&str, &str)] = &[
    (
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "xlsx",
    ),
    ("application/vnd.ms-excel", "xls"),
    ("text/csv", "csv"),
];

const MAX_EVENT_WAIT_SECS: u64 = 60;

/// Shared state handed to every handler
pub struct AppState {
    pub config: Config,
    pub sources: Arc<dyn DescriptorStore>,
    pub sheets: SheetsClient,
    pub users: UserStore,
    pub sessions: SessionStore,
    pub events: SourceEvents,
}

impl AppState {
    /// Open the JSON stores under `config.data_dir` and create the uploads dir
    pub fn from_config(config: Config) -> Result<Self, AppError> {
        fs::create_dir_all(&config.uploads_dir).map_err(IngestError::from)?;
        let sources = JsonDescriptorStore::open(config.sources_file())?;
        let users = UserStore::open(config.users_file())?;
        Ok(Self::with_store(config, Arc::new(sources), users))
    }

    /// Build state around an existing descriptor store
    pub fn with_store(config: Config, sources: Arc<dyn DescriptorStore>, users: UserStore) -> Self {
        Self {
            sheets: SheetsClient::new(config.sheets_base_url.clone(), config.sheets_api_key.clone()),
            sessions: SessionStore::new(config.session_duration),
            events: SourceEvents::default(),
            sources,
            users,
            config,
        }
    }
}

/// Build the application router
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/profile", get(login::get_profile).post(login::update_profile))
        .route("/profile/password", post(login::handle_change_password))
        .route("/upload", post(upload_file))
        .route("/delete-file", post(delete_file))
        .route("/source", get(get_source).delete(remove_source))
        .route("/source/spreadsheet", post(link_spreadsheet))
        .route("/sheets", get(list_sheets))
        .route("/data", get(read_data))
        .route("/dashboard", get(dashboard))
        .route("/events/next", get(next_event))
        .layer(middleware::from_fn_with_state(state.clone(), login::require_auth));

    Router::new()
        .route("/signup", post(login::handle_signup))
        .route("/login", post(login::handle_login))
        .route("/logout", post(login::handle_logout))
        .nest("/api", api)
        .nest_service("/static", ServeDir::new("static"))
        .layer(DefaultBodyLimit::max(state.config.max_upload_bytes))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the web server and serve until shutdown
pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let bind = config.bind.clone();
    let state = Arc::new(AppState::from_config(config)?);
    if state.config.sheets_api_key.is_none() {
        log::warn!("GOOGLE_SHEETS_API_KEY is not set; spreadsheet sources will fail");
    }

    let app = router(state);
    let listener = TcpListener::bind(&bind).await?;
    log::info!("Listening on http://{bind}");
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Deserialize)]
pub struct OwnerQuery {
    pub owner: String,
}

#[derive(Deserialize)]
pub struct SheetQuery {
    pub owner: String,
    #[serde(default)]
    pub sheet: Option<String>,
}

#[derive(Deserialize)]
pub struct DashboardQuery {
    pub owner: String,
    #[serde(default)]
    pub sheet: Option<String>,
    pub kind: String,
    /// Report a sheet without the designated columns as 422 instead of no records
    #[serde(default)]
    pub strict: bool,
}

#[derive(Deserialize)]
pub struct EventQuery {
    pub owner: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Deserialize)]
pub struct DeleteFileRequest {
    pub owner: String,
    pub filename: String,
}

#[derive(Deserialize)]
pub struct LinkSpreadsheetRequest {
    pub owner: String,
    pub spreadsheet_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Serialize)]
pub struct UploadResponse {
    pub filename: String,
    pub source: DataSourceDescriptor,
}

#[derive(Serialize)]
pub struct DeleteResponse {
    pub filename: String,
    pub deleted: bool,
}

#[derive(Serialize)]
pub struct DataResponse {
    pub data: RawSheet,
    pub row_count: usize,
    pub sheet: String,
    pub source: DataSourceDescriptor,
}

#[derive(Serialize)]
pub struct DashboardResponse {
    pub kind: RecordKind,
    pub sheet: String,
    pub records: Vec<DashboardRecord>,
    pub source: DataSourceDescriptor,
}

#[derive(Serialize)]
pub struct SheetsResponse {
    pub sheets: Vec<String>,
    pub source: DataSourceDescriptor,
}

/// Extension for an uploaded file of type `mime`, if the type is allowed
pub fn upload_extension(mime: &str) -> Option<&'static str> {
    let essence = mime.split(';').next().unwrap_or("").trim().to_lowercase();
    ALLOWED_UPLOADS
        .iter()
        .find(|(allowed, _)| *allowed == essence)
        .map(|(_, ext)| *ext)
}

/// Stored name of an upload: `{owner}_{timestamp_ms}.{ext}`
pub fn upload_filename(owner: &str, extension: &str) -> String {
    format!("{}_{}.{}", owner, Utc::now().timestamp_millis(), extension)
}

/// True when `filename` was produced by [`upload_filename`] for `owner`
pub fn is_owned_upload(owner: &str, filename: &str) -> bool {
    filename
        .strip_prefix(owner)
        .and_then(|rest| rest.strip_prefix('_'))
        .and_then(|rest| rest.split_once('.'))
        .is_some_and(|(stamp, ext)| {
            !stamp.is_empty() && stamp.chars().all(|c| c.is_ascii_digit()) && !ext.is_empty()
        })
}

/// Remove an upload, treating an already missing file as success
///
/// Returns whether a file was actually deleted.
fn remove_upload(uploads_dir: &Path, filename: &str) -> Result<bool, AppError> {
    let path = loader::upload_path(uploads_dir, filename)?;
    match fs::remove_file(&path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(IngestError::Io(e).into()),
    }
}

/// Store `descriptor` as the owner's source, deleting any upload it orphans
fn replace_source(state: &AppState, descriptor: DataSourceDescriptor) -> Result<(), AppError> {
    let previous = state.sources.upsert(descriptor.clone())?;
    if let Some(orphan) = previous.as_ref().and_then(|p| p.orphaned_by(Some(&descriptor))) {
        match remove_upload(&state.config.uploads_dir, orphan) {
            Ok(_) => log::info!("removed superseded upload {orphan}"),
            Err(e) => log::warn!("could not remove superseded upload {orphan}: {e}"),
        }
    }
    state.events.publish(SourceEvent {
        owner_id: descriptor.owner_id.clone(),
        change: SourceChange::Replaced,
        descriptor,
    });
    Ok(())
}

/// Handle a spreadsheet upload
///
/// Expects multipart fields `owner` and `file`. The MIME type is checked
/// before anything is written to disk.
pub async fn upload_file(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), AppError> {
    let mut owner = None;
    let mut upload: Option<(String, String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("Invalid multipart body: {e}")))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "owner" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(e.to_string()))?;
                owner = Some(text.trim().to_string());
            }
            "file" => {
                let original = field.file_name().unwrap_or("upload").to_string();
                let mime = field.content_type().unwrap_or("").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::BadRequest(e.to_string()))?;
                upload = Some((original, mime, bytes.to_vec()));
            }
            _ => {}
        }
    }

    let owner = owner
        .filter(|o| !o.is_empty())
        .ok_or_else(|| AppError::BadRequest("Missing owner".to_string()))?;
    user.require_owner(&owner)?;
    let (original, mime, bytes) =
        upload.ok_or_else(|| AppError::BadRequest("No file data received".to_string()))?;

    let extension = upload_extension(&mime)
        .ok_or_else(|| AppError::BadRequest(format!("Unsupported file type '{mime}'")))?;
    if bytes.is_empty() {
        return Err(AppError::BadRequest("Uploaded file is empty".to_string()));
    }

    let filename = upload_filename(&owner, extension);
    let path = loader::upload_path(&state.config.uploads_dir, &filename)?;
    fs::create_dir_all(&state.config.uploads_dir).map_err(IngestError::from)?;
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(IngestError::from)?;
    log::info!("stored upload {filename} ({} bytes) for {owner}", bytes.len());

    let descriptor = DataSourceDescriptor::new(&owner, SourceKind::File, &filename, original);
    if let Err(e) = replace_source(&state, descriptor.clone()) {
        if let Err(cleanup) = remove_upload(&state.config.uploads_dir, &filename) {
            log::warn!("could not remove unregistered upload {filename}: {cleanup}");
        }
        return Err(e);
    }

    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            filename,
            source: descriptor,
        }),
    ))
}

/// Delete an uploaded file; a file that is already gone is not an error
pub async fn delete_file(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Json(request): Json<DeleteFileRequest>,
) -> Result<Json<DeleteResponse>, AppError> {
    user.require_owner(&request.owner)?;
    if !is_owned_upload(&request.owner, &request.filename) {
        return Err(AppError::BadRequest(format!(
            "'{}' is not an upload of {}",
            request.filename, request.owner
        )));
    }

    let deleted = remove_upload(&state.config.uploads_dir, &request.filename)?;
    log::info!("delete {} -> removed={deleted}", request.filename);
    Ok(Json(DeleteResponse {
        filename: request.filename,
        deleted,
    }))
}

fn require_source(state: &AppState, owner: &str) -> Result<DataSourceDescriptor, AppError> {
    resolve(state.sources.as_ref(), owner)?.ok_or_else(|| AppError::NoSource(owner.to_string()))
}

/// Current data source of the owner
pub async fn get_source(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Query(query): Query<OwnerQuery>,
) -> Result<Json<DataSourceDescriptor>, AppError> {
    user.require_owner(&query.owner)?;
    Ok(Json(require_source(&state, &query.owner)?))
}

/// Drop the owner's data source together with its uploaded file
pub async fn remove_source(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Query(query): Query<OwnerQuery>,
) -> Result<Response, AppError> {
    user.require_owner(&query.owner)?;
    let Some(removed) = state.sources.remove(&query.owner)? else {
        return Err(AppError::NoSource(query.owner));
    };
    if let Some(orphan) = removed.orphaned_by(None) {
        if let Err(e) = remove_upload(&state.config.uploads_dir, orphan) {
            log::warn!("could not remove upload {orphan}: {e}");
        }
    }
    state.events.publish(SourceEvent {
        owner_id: removed.owner_id.clone(),
        change: SourceChange::Removed,
        descriptor: removed,
    });
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// Make a Google Sheets document the owner's data source
pub async fn link_spreadsheet(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Json(request): Json<LinkSpreadsheetRequest>,
) -> Result<Json<DataSourceDescriptor>, AppError> {
    user.require_owner(&request.owner)?;
    let spreadsheet_id = request.spreadsheet_id.trim();
    let valid_id = !spreadsheet_id.is_empty()
        && spreadsheet_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid_id {
        return Err(AppError::BadRequest("Invalid spreadsheet id".to_string()));
    }

    let display_name = request
        .display_name
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| spreadsheet_id.to_string());
    let descriptor = DataSourceDescriptor::new(
        &request.owner,
        SourceKind::Spreadsheet,
        spreadsheet_id,
        display_name,
    );
    replace_source(&state, descriptor.clone())?;
    Ok(Json(descriptor))
}

/// Sheets available in the owner's uploaded file
pub async fn list_sheets(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Query(query): Query<OwnerQuery>,
) -> Result<Json<SheetsResponse>, AppError> {
    user.require_owner(&query.owner)?;
    let source = require_source(&state, &query.owner)?;
    let sheets = match source.kind {
        SourceKind::File => {
            let uploads_dir = state.config.uploads_dir.clone();
            let locator = source.locator.clone();
            run_blocking(move || loader::list_sheets(&uploads_dir, &locator)).await?
        }
        SourceKind::Spreadsheet => {
            return Err(AppError::BadRequest(
                "Sheet listing is only available for uploaded files".to_string(),
            ));
        }
    };
    Ok(Json(SheetsResponse { sheets, source }))
}

async fn run_blocking<T, F>(job: F) -> Result<T, AppError>
where
    F: FnOnce() -> Result<T, IngestError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|e| IngestError::Io(std::io::Error::other(e.to_string())))?
        .map_err(AppError::from)
}

/// Read `sheet_name` from whichever adapter matches the descriptor
async fn ingest(
    state: &AppState,
    source: &DataSourceDescriptor,
    sheet_name: &str,
) -> Result<(String, RawSheet), AppError> {
    match source.kind {
        SourceKind::File => {
            let uploads_dir = state.config.uploads_dir.clone();
            let locator = source.locator.clone();
            let requested = sheet_name.to_string();
            run_blocking(move || loader::read_uploaded_sheet(&uploads_dir, &locator, &requested))
                .await
        }
        SourceKind::Spreadsheet => {
            match fetch_with_budget(state, &source.locator, sheet_name).await {
                Err(AppError::Ingest(e)) if e.is_sheet_not_found() && sheet_name != DEFAULT_SHEET => {
                    log::warn!("{e}; retrying with '{DEFAULT_SHEET}'");
                    let sheet = fetch_with_budget(state, &source.locator, DEFAULT_SHEET).await?;
                    Ok((DEFAULT_SHEET.to_string(), sheet))
                }
                other => other.map(|sheet| (sheet_name.to_string(), sheet)),
            }
        }
    }
}

async fn fetch_with_budget(
    state: &AppState,
    spreadsheet_id: &str,
    sheet_name: &str,
) -> Result<RawSheet, AppError> {
    let fetch = state.sheets.fetch_sheet(spreadsheet_id, sheet_name);
    match state.config.fetch_timeout {
        Some(budget) => tokio::time::timeout(budget, fetch)
            .await
            .map_err(|_| AppError::Timeout(budget.as_secs()))?
            .map_err(AppError::from),
        None => fetch.await.map_err(AppError::from),
    }
}

/// Raw rows of the requested sheet plus source metadata
pub async fn read_data(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Query(query): Query<SheetQuery>,
) -> Result<Json<DataResponse>, AppError> {
    user.require_owner(&query.owner)?;
    let source = require_source(&state, &query.owner)?;
    let requested = query.sheet.as_deref().unwrap_or(DEFAULT_SHEET);
    let (sheet, data) = ingest(&state, &source, requested).await?;

    log::info!("{} rows from {} for {}", data.row_count(), source.locator, query.owner);
    Ok(Json(DataResponse {
        row_count: data.row_count(),
        data,
        sheet,
        source,
    }))
}

/// Normalized dashboard records of the requested kind
///
/// With `strict=true` a sheet lacking the designated columns is an error
/// (422) rather than an empty record list.
pub async fn dashboard(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Query(query): Query<DashboardQuery>,
) -> Result<Json<DashboardResponse>, AppError> {
    user.require_owner(&query.owner)?;
    let kind: RecordKind = query.kind.parse().map_err(AppError::BadRequest)?;
    let source = require_source(&state, &query.owner)?;
    let requested = query.sheet.as_deref().unwrap_or(DEFAULT_SHEET);
    let (sheet, data) = ingest(&state, &source, requested).await?;

    let records = if query.strict {
        normalizer::try_normalize(&data, kind)?
    } else {
        normalizer::normalize(&data, kind)
    };
    Ok(Json(DashboardResponse {
        kind,
        sheet,
        records,
        source,
    }))
}

/// Wait for the next data source change of the owner
///
/// Answers 204 when nothing changed within the timeout.
pub async fn next_event(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Query(query): Query<EventQuery>,
) -> Result<Response, AppError> {
    user.require_owner(&query.owner)?;
    let wait = Duration::from_secs(
        query
            .timeout_secs
            .unwrap_or(MAX_EVENT_WAIT_SECS)
            .min(MAX_EVENT_WAIT_SECS),
    );
    let mut events = state.events.subscribe();

    let next = async {
        loop {
            match events.recv().await {
                Ok(event) if event.owner_id == query.owner => return Some(event),
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    };

    match tokio::time::timeout(wait, next).await {
        Ok(Some(event)) => Ok(Json(event).into_response()),
        Ok(None) | Err(_) => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}
