//! Google Sheets values API client
//!
//! Reads a named range with an API key and returns it as a [`RawSheet`].
//! A single attempt is made; failures are returned to the caller as-is.

use serde::Deserialize;

use crate::error::IngestError;
use crate::raw::RawSheet;

/// Envelope returned by `GET /v4/spreadsheets/{id}/values/{range}`
#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

/// Error body returned by Google APIs
#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

/// Client for the spreadsheet values endpoint
#[derive(Debug, Clone)]
pub struct SheetsClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl SheetsClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// URL of the values request for `sheet_name` in `spreadsheet_id`
    fn values_url(&self, spreadsheet_id: &str, sheet_name: &str) -> String {
        format!(
            "{}/v4/spreadsheets/{}/values/{}",
            self.base_url,
            urlencoding::encode(spreadsheet_id),
            urlencoding::encode(sheet_name)
        )
    }

    /// Fetch every populated cell of `sheet_name`
    ///
    /// # Errors
    /// * `Configuration` when no API key is configured
    /// * `SheetNotFound` when the document has no sheet of that name
    /// * `FetchFailed` for transport errors and any other non-success status
    pub async fn fetch_sheet(
        &self,
        spreadsheet_id: &str,
        sheet_name: &str,
    ) -> Result<RawSheet, IngestError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            IngestError::Configuration("GOOGLE_SHEETS_API_KEY is not set".to_string())
        })?;

        let url = self.values_url(spreadsheet_id, sheet_name);
        log::info!("fetching sheet '{sheet_name}' of {spreadsheet_id}");

        let response = self
            .http
            .get(&url)
            .query(&[("key", api_key)])
            .send()
            .await
            .map_err(|e| IngestError::FetchFailed {
                status: e.status().map(|s| s.as_u16()),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorEnvelope>(&body)
                .map(|envelope| envelope.error.message)
                .unwrap_or(body);

            if status == reqwest::StatusCode::BAD_REQUEST && is_missing_range(&message) {
                return Err(IngestError::SheetNotFound {
                    requested: sheet_name.to_string(),
                    available: Vec::new(),
                });
            }
            return Err(IngestError::FetchFailed {
                status: Some(status.as_u16()),
                message,
            });
        }

        let envelope: ValueRange = response.json().await.map_err(|e| IngestError::FetchFailed {
            status: Some(status.as_u16()),
            message: format!("invalid response body: {e}"),
        })?;

        let rows = envelope
            .values
            .into_iter()
            .map(|row| row.into_iter().map(value_to_cell).collect())
            .collect();
        Ok(RawSheet::new(rows))
    }
}

/// The API reports an unknown sheet as a range it cannot parse
fn is_missing_range(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("unable to parse range") || lower.contains("not found")
}

fn value_to_cell(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}
