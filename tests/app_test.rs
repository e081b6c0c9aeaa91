use axum::{
    Json, Router,
    body::{Body, to_bytes},
    extract::Path as UrlPath,
    http::{Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use dashboard::StoreError;
use dashboard::app::{AppState, router};
use dashboard::config::Config;
use dashboard::login::UserStore;
use dashboard::source::{DataSourceDescriptor, DescriptorStore, MemoryDescriptorStore};
use rust_xlsxwriter::Workbook;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tower::ServiceExt;

const BOUNDARY: &str = "dashboard-test-boundary";
const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

const REVENUE_CSV: &str = "TARGET,KPI,SEGMEN,Q1,Q2,Q3,Q4,FY\n\
                           revenue,revenue sold,SMES,10,20,30,40,100\n";

struct Harness {
    app: Router,
    state: Arc<AppState>,
    cookie: String,
    _dir: TempDir,
}

/// Descriptor store that refuses every write
struct ReadOnlyStore;

impl DescriptorStore for ReadOnlyStore {
    fn latest(&self, _owner_id: &str) -> Result<Option<DataSourceDescriptor>, StoreError> {
        Ok(None)
    }

    fn upsert(
        &self,
        _descriptor: DataSourceDescriptor,
    ) -> Result<Option<DataSourceDescriptor>, StoreError> {
        Err(StoreError::Poisoned)
    }

    fn remove(&self, _owner_id: &str) -> Result<Option<DataSourceDescriptor>, StoreError> {
        Err(StoreError::Poisoned)
    }
}

fn harness_with(configure: impl FnOnce(&mut Config)) -> Harness {
    harness_on(Arc::new(MemoryDescriptorStore::new()), configure)
}

fn harness_on(
    sources: Arc<dyn DescriptorStore>,
    configure: impl FnOnce(&mut Config),
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config {
        data_dir: dir.path().join("data"),
        uploads_dir: dir.path().join("uploads"),
        ..Config::default()
    };
    configure(&mut config);
    std::fs::create_dir_all(&config.uploads_dir).unwrap();

    let users = UserStore::open(config.users_file()).unwrap();
    let state = Arc::new(AppState::with_store(config, sources, users));
    let session = state.sessions.create("ana").unwrap();

    Harness {
        app: router(state.clone()),
        state,
        cookie: format!("session={session}"),
        _dir: dir,
    }
}

fn harness() -> Harness {
    harness_with(|_| {})
}

impl Harness {
    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        let request = Request::get(uri)
            .header(header::COOKIE, &self.cookie)
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    async fn post_json(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::post(uri)
            .header(header::COOKIE, &self.cookie)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(request).await
    }

    async fn upload(&self, owner: &str, filename: &str, mime: &str, contents: &str) -> (StatusCode, Value) {
        self.upload_bytes(owner, filename, mime, contents.as_bytes()).await
    }

    async fn upload_bytes(&self, owner: &str, filename: &str, mime: &str, contents: &[u8]) -> (StatusCode, Value) {
        let mut body = format!(
            "--{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"owner\"\r\n\r\n\
             {owner}\r\n\
             --{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
             Content-Type: {mime}\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(contents);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        let request = Request::post("/api/upload")
            .header(header::COOKIE, &self.cookie)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap();
        self.send(request).await
    }

    fn stored_uploads(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.state.config.uploads_dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

#[tokio::test]
async fn requests_without_session_are_unauthorized() {
    let h = harness();
    let request = Request::get("/api/data?owner=ana").body(Body::empty()).unwrap();
    let response = h.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn other_owners_data_is_forbidden() {
    let h = harness();
    let (status, _) = h.get("/api/data?owner=budi").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn reading_without_a_source_is_not_found() {
    let h = harness();
    let (status, _) = h.get("/api/data?owner=ana").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn disallowed_mime_type_writes_nothing() {
    let h = harness();
    let (status, _) = h.upload("ana", "report.pdf", "application/pdf", "%PDF-1.7").await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(h.stored_uploads().is_empty());
    let (status, _) = h.get("/api/source?owner=ana").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn uploaded_csv_is_served_back() {
    let h = harness();
    let (status, body) = h.upload("ana", "data.csv", "text/csv", "a,b\n1,2\n3,4").await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["source"]["kind"], "file");
    assert_eq!(body["source"]["display_name"], "data.csv");

    let (status, body) = h.get("/api/data?owner=ana").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["row_count"], 3);
    assert_eq!(body["data"], json!([["a", "b"], ["1", "2"], ["3", "4"]]));
}

#[tokio::test]
async fn replacing_an_upload_removes_the_old_file() {
    let h = harness();
    let (_, first) = h.upload("ana", "old.csv", "text/csv", "a\n1").await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let (_, second) = h.upload("ana", "new.csv", "text/csv", "b\n2").await;

    let second_name = second["filename"].as_str().unwrap().to_string();
    assert_ne!(first["filename"], second["filename"]);
    assert_eq!(h.stored_uploads(), [second_name.clone()]);

    let (_, source) = h.get("/api/source?owner=ana").await;
    assert_eq!(source["locator"], second_name);
}

#[tokio::test]
async fn deleting_a_missing_upload_succeeds() {
    let h = harness();
    let (status, body) = h
        .post_json(
            "/api/delete-file",
            json!({"owner": "ana", "filename": "ana_1700000000000.csv"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], false);

    let (status, _) = h
        .post_json(
            "/api/delete-file",
            json!({"owner": "ana", "filename": "../users.json"}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn removing_the_source_deletes_its_upload() {
    let h = harness();
    h.upload("ana", "data.csv", "text/csv", "a\n1").await;
    assert_eq!(h.stored_uploads().len(), 1);

    let request = Request::delete("/api/source?owner=ana")
        .header(header::COOKIE, &h.cookie)
        .body(Body::empty())
        .unwrap();
    let (status, _) = h.send(request).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(h.stored_uploads().is_empty());
}

#[tokio::test]
async fn dashboard_returns_normalized_records() {
    let h = harness();
    h.upload("ana", "revenue.csv", "text/csv", REVENUE_CSV).await;

    let (status, body) = h.get("/api/dashboard?owner=ana&kind=revenue").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["kind"], "revenue");

    let records = body["records"].as_array().unwrap();
    assert_eq!(records.len(), 5);
    assert_eq!(records[0]["category"], "Rev Smes");
    assert_eq!(records[4]["period"], "FY");
    assert_eq!(records[4]["rawValue"], "100");

    let (status, _) = h.get("/api/dashboard?owner=ana&kind=pie").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

async fn spawn_sheets_api() -> String {
    async fn values(UrlPath((_id, range)): UrlPath<(String, String)>) -> Response {
        if range == "DataAutoGSlide" {
            Json(json!({"values": [["TARGET", "KPI"], ["revenue", "revenue sold"]]})).into_response()
        } else {
            let body = json!({"error": {"code": 400, "message": format!("Unable to parse range: {range}")}});
            (StatusCode::BAD_REQUEST, Json(body)).into_response()
        }
    }

    let api = Router::new().route("/v4/spreadsheets/:id/values/:range", get(values));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, api).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn spreadsheet_source_falls_back_to_default_sheet() {
    let base = spawn_sheets_api().await;
    let h = harness_with(|config| {
        config.sheets_base_url = base;
        config.sheets_api_key = Some("test-key".to_string());
    });

    let (status, body) = h
        .post_json(
            "/api/source/spreadsheet",
            json!({"owner": "ana", "spreadsheet_id": "1AbC-d_9"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["kind"], "spreadsheet");

    let (status, body) = h.get("/api/data?owner=ana&sheet=Sheet1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sheet"], "DataAutoGSlide");
    assert_eq!(body["row_count"], 2);
}

#[tokio::test]
async fn spreadsheet_without_api_key_is_a_server_error() {
    let h = harness();
    h.post_json(
        "/api/source/spreadsheet",
        json!({"owner": "ana", "spreadsheet_id": "1AbC"}),
    )
    .await;

    let (status, _) = h.get("/api/data?owner=ana").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn source_changes_reach_waiting_listeners() {
    let h = harness();
    let request = Request::get("/api/events/next?owner=ana&timeout_secs=5")
        .header(header::COOKIE, &h.cookie)
        .body(Body::empty())
        .unwrap();
    let waiting = tokio::spawn(h.app.clone().oneshot(request));

    tokio::time::sleep(Duration::from_millis(100)).await;
    h.upload("ana", "data.csv", "text/csv", "a\n1").await;

    let response = waiting.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let event: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(event["owner_id"], "ana");
    assert_eq!(event["change"], "replaced");
}

#[tokio::test]
async fn quiet_event_wait_ends_with_no_content() {
    let h = harness();
    let (status, _) = h.get("/api/events/next?owner=ana&timeout_secs=0").await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn sheet_listing_is_for_uploads_only() {
    let h = harness();
    h.upload("ana", "data.csv", "text/csv", "a\n1").await;
    let (status, body) = h.get("/api/sheets?owner=ana").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sheets"].as_array().map(Vec::len), Some(1));

    h.post_json(
        "/api/source/spreadsheet",
        json!({"owner": "ana", "spreadsheet_id": "1AbC"}),
    )
    .await;
    let (status, _) = h.get("/api/sheets?owner=ana").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

fn single_sheet_workbook(name: &str) -> Vec<u8> {
    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name(name).unwrap();
    worksheet.write_string(0, 0, "only").unwrap();
    workbook.save_to_buffer().unwrap()
}

#[tokio::test]
async fn workbook_fallback_reports_the_sheet_read() {
    let h = harness();
    let (status, _) = h
        .upload_bytes("ana", "report.xlsx", XLSX_MIME, &single_sheet_workbook("Sheet1"))
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = h.get("/api/data?owner=ana&sheet=Missing").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sheet"], "Sheet1");
    assert_eq!(body["data"], json!([["only"]]));

    let (_, body) = h.get("/api/dashboard?owner=ana&sheet=Missing&kind=revenue").await;
    assert_eq!(body["sheet"], "Sheet1");
}

#[tokio::test]
async fn failed_registration_leaves_no_upload_behind() {
    let h = harness_on(Arc::new(ReadOnlyStore), |_| {});
    let (status, _) = h.upload("ana", "data.csv", "text/csv", "a\n1").await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(h.stored_uploads().is_empty());
}

#[tokio::test]
async fn strict_dashboard_rejects_sheets_without_designated_columns() {
    let h = harness();
    h.upload("ana", "data.csv", "text/csv", "a,b\n1,2").await;

    let (status, body) = h.get("/api/dashboard?owner=ana&kind=revenue").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["records"], json!([]));

    let (status, _) = h.get("/api/dashboard?owner=ana&kind=revenue&strict=true").await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn deleting_a_name_outside_the_upload_pattern_is_rejected() {
    let h = harness();
    let (status, _) = h
        .post_json(
            "/api/delete-file",
            json!({"owner": "ana", "filename": "budi_1700000000000.csv"}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = h
        .post_json("/api/delete-file", json!({"owner": "ana", "filename": "notes.csv"}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
