use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Sheet used when the requested one is missing from a document.
pub const DEFAULT_SHEET: &str = "DataAutoGSlide";

const DEFAULT_BIND: &str = "127.0.0.1:3000";
const DEFAULT_DATA_DIR: &str = "database";
const DEFAULT_UPLOADS_DIR: &str = "uploads";
const DEFAULT_SHEETS_BASE_URL: &str = "https://sheets.googleapis.com";
const DEFAULT_SESSION_HOURS: u64 = 24;
const DEFAULT_MAX_UPLOAD_MB: usize = 20;

/// Runtime configuration for the dashboard service
///
/// Every field has a default so the server starts with no environment at all;
/// only the Google Sheets API key is needed for spreadsheet-backed sources.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP listener binds to
    pub bind: String,

    /// Directory holding `users.json` and `sources.json`
    pub data_dir: PathBuf,

    /// Directory uploaded spreadsheets are written to
    pub uploads_dir: PathBuf,

    /// Google Sheets API key (absent means spreadsheet sources cannot be read)
    pub sheets_api_key: Option<String>,

    /// Base URL of the Sheets values API
    pub sheets_base_url: String,

    /// Lifetime of a login session
    pub session_duration: Duration,

    /// Largest accepted multipart body
    pub max_upload_bytes: usize,

    /// Optional budget for a single remote sheet fetch
    pub fetch_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            uploads_dir: PathBuf::from(DEFAULT_UPLOADS_DIR),
            sheets_api_key: None,
            sheets_base_url: DEFAULT_SHEETS_BASE_URL.to_string(),
            session_duration: Duration::from_secs(DEFAULT_SESSION_HOURS * 60 * 60),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_MB * 1024 * 1024,
            fetch_timeout: None,
        }
    }
}

impl Config {
    /// Build a configuration from `DASHBOARD_*` and `GOOGLE_SHEETS_*` variables
    ///
    /// Unparsable numeric values fall back to their defaults with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`Config::from_env`] but reading from an arbitrary lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let session_hours = parse_or(non_empty("DASHBOARD_SESSION_HOURS"), DEFAULT_SESSION_HOURS);
        let max_upload_mb = parse_or(non_empty("DASHBOARD_MAX_UPLOAD_MB"), DEFAULT_MAX_UPLOAD_MB);
        let fetch_timeout = non_empty("DASHBOARD_FETCH_TIMEOUT_SECS")
            .and_then(|v| match v.trim().parse::<u64>() {
                Ok(secs) => Some(Duration::from_secs(secs)),
                Err(_) => {
                    log::warn!("ignoring DASHBOARD_FETCH_TIMEOUT_SECS={v:?}");
                    None
                }
            });

        Self {
            bind: non_empty("DASHBOARD_BIND").unwrap_or(defaults.bind),
            data_dir: non_empty("DASHBOARD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            uploads_dir: non_empty("DASHBOARD_UPLOADS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.uploads_dir),
            sheets_api_key: non_empty("GOOGLE_SHEETS_API_KEY"),
            sheets_base_url: non_empty("GOOGLE_SHEETS_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.sheets_base_url),
            session_duration: Duration::from_secs(session_hours * 60 * 60),
            max_upload_bytes: max_upload_mb * 1024 * 1024,
            fetch_timeout,
        }
    }

    /// Path of the user account file
    pub fn users_file(&self) -> PathBuf {
        self.data_dir.join("users.json")
    }

    /// Path of the data source descriptor file
    pub fn sources_file(&self) -> PathBuf {
        self.data_dir.join("sources.json")
    }
}

fn parse_or<T: std::str::FromStr + Copy + std::fmt::Debug>(value: Option<String>, default: T) -> T {
    match value {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            log::warn!("ignoring unparsable setting {raw:?}, using {default:?}");
            default
        }),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_apply_without_environment() {
        let config = Config::from_lookup(|_| None);
        assert_eq!(config.bind, "127.0.0.1:3000");
        assert_eq!(config.uploads_dir, PathBuf::from("uploads"));
        assert!(config.sheets_api_key.is_none());
        assert!(config.fetch_timeout.is_none());
        assert_eq!(config.session_duration, Duration::from_secs(24 * 3600));
    }

    #[test]
    fn overrides_are_read_and_bad_numbers_fall_back() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("GOOGLE_SHEETS_API_KEY", "abc"),
            ("GOOGLE_SHEETS_BASE_URL", "http://localhost:9000/"),
            ("DASHBOARD_SESSION_HOURS", "two"),
            ("DASHBOARD_MAX_UPLOAD_MB", "5"),
            ("DASHBOARD_FETCH_TIMEOUT_SECS", "30"),
            ("DASHBOARD_BIND", "   "),
        ]);
        let config = Config::from_lookup(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.sheets_api_key.as_deref(), Some("abc"));
        assert_eq!(config.sheets_base_url, "http://localhost:9000");
        assert_eq!(config.session_duration, Duration::from_secs(24 * 3600));
        assert_eq!(config.max_upload_bytes, 5 * 1024 * 1024);
        assert_eq!(config.fetch_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.bind, "127.0.0.1:3000");
    }
}
