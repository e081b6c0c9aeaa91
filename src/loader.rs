use calamine::{Data, Reader, open_workbook_auto};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::config::DEFAULT_SHEET;
use crate::error::IngestError;
use crate::raw::RawSheet;

/// Extensions opened as multi-sheet workbook containers
const WORKBOOK_EXTENSIONS: &[&str] = &["xlsx", "xlsm", "xlsb", "xls", "ods"];

/// Shape of an uploaded file, decided from its extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    /// Comma separated text, one sheet
    Delimited,

    /// Spreadsheet container with named sheets
    Workbook,
}

impl FileFormat {
    /// Detect the format of `filename` from its extension
    ///
    /// # Examples
    /// ```
    /// use dashboard::loader::FileFormat;
    ///
    /// assert_eq!(FileFormat::detect("ana_1.CSV").unwrap(), FileFormat::Delimited);
    /// assert_eq!(FileFormat::detect("ana_1.xlsx").unwrap(), FileFormat::Workbook);
    /// assert!(FileFormat::detect("ana_1.pdf").is_err());
    /// ```
    pub fn detect(filename: impl AsRef<Path>) -> Result<Self, IngestError> {
        let path = filename.as_ref();
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_lowercase());

        match extension.as_deref() {
            Some("csv") => Ok(FileFormat::Delimited),
            Some(ext) if WORKBOOK_EXTENSIONS.contains(&ext) => Ok(FileFormat::Workbook),
            Some(ext) => Err(IngestError::UnsupportedFormat(ext.to_string())),
            None => Err(IngestError::UnsupportedFormat(format!(
                "{} has no extension",
                path.display()
            ))),
        }
    }
}

/// Resolve `filename` inside `uploads_dir`, refusing anything but a bare name
pub fn upload_path(uploads_dir: &Path, filename: &str) -> Result<PathBuf, IngestError> {
    let bare = Path::new(filename)
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name == filename);

    if filename.is_empty() || !bare || filename.starts_with('.') {
        return Err(IngestError::InvalidFilename(filename.to_string()));
    }
    Ok(uploads_dir.join(filename))
}

/// Read `sheet_name` from an uploaded file
///
/// Returns the name of the sheet actually read together with its rows.
/// Delimited files have a single sheet that answers to any name, so
/// `sheet_name` is echoed back for them. Workbooks fall back to
/// [`DEFAULT_SHEET`] and then to their first sheet when `sheet_name` is absent.
///
/// # Errors
/// * `NotFound` - the file is not in `uploads_dir`
/// * `ParseFailed` - the container cannot be opened or the sheet read
/// * `SheetNotFound` - the workbook has no sheet at all
/// * `UnsupportedFormat` / `InvalidFilename` - the name is not acceptable
///
/// # Examples
/// ```no_run
/// use dashboard::loader::read_uploaded_sheet;
/// use std::path::Path;
///
/// match read_uploaded_sheet(Path::new("uploads"), "ana_1700000000000.xlsx", "Sheet1") {
///     Ok((name, sheet)) => println!("{name}: {} rows", sheet.row_count()),
///     Err(e) => eprintln!("Error loading upload: {}", e),
/// }
/// ```
pub fn read_uploaded_sheet(
    uploads_dir: &Path,
    filename: &str,
    sheet_name: &str,
) -> Result<(String, RawSheet), IngestError> {
    let path = upload_path(uploads_dir, filename)?;
    let format = FileFormat::detect(&path)?;
    if !path.is_file() {
        return Err(IngestError::NotFound(path));
    }

    log::info!("reading {:?} upload {}", format, path.display());
    match format {
        FileFormat::Delimited => Ok((sheet_name.to_string(), from_csv(&path)?)),
        FileFormat::Workbook => from_workbook(&path, sheet_name),
    }
}

/// Names of the sheets in an uploaded file (a CSV has a single unnamed sheet)
pub fn list_sheets(uploads_dir: &Path, filename: &str) -> Result<Vec<String>, IngestError> {
    let path = upload_path(uploads_dir, filename)?;
    match FileFormat::detect(&path)? {
        FileFormat::Delimited if path.is_file() => Ok(vec![String::new()]),
        _ if !path.is_file() => Err(IngestError::NotFound(path)),
        _ => {
            let workbook = open_workbook_auto(&path).map_err(|e| IngestError::ParseFailed {
                path: path.clone(),
                message: e.to_string(),
            })?;
            Ok(workbook.sheet_names())
        }
    }
}

/// Load a delimited text file
///
/// The split is deliberately naive: lines on `\n`, cells on `,`, with one
/// pair of surrounding double quotes stripped from each cell. Quoted commas
/// and escaped quotes are not supported.
pub fn from_csv(path: &Path) -> Result<RawSheet, IngestError> {
    let bytes = fs::read(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => IngestError::NotFound(path.to_path_buf()),
        _ => IngestError::Io(e),
    })?;
    Ok(parse_csv(&String::from_utf8_lossy(&bytes)))
}

/// Split delimited text into rows, skipping blank lines
pub fn parse_csv(text: &str) -> RawSheet {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let rows = text
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.split(',').map(strip_quotes).collect())
        .collect();
    RawSheet::new(rows)
}

fn strip_quotes(cell: &str) -> String {
    let trimmed = cell.trim();
    trimmed
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(trimmed)
        .to_string()
}

/// Pick the sheet to read from `available`
///
/// Order: exact `requested`, then [`DEFAULT_SHEET`], then the first sheet.
///
/// # Examples
/// ```
/// use dashboard::loader::select_sheet;
///
/// let names = vec!["Sheet1".to_string(), "DataAutoGSlide".to_string()];
/// assert_eq!(select_sheet(&names, "Missing"), Some("DataAutoGSlide"));
/// assert_eq!(select_sheet(&names[..1], "Missing"), Some("Sheet1"));
/// ```
pub fn select_sheet<'a>(available: &'a [String], requested: &str) -> Option<&'a str> {
    available
        .iter()
        .find(|name| name.as_str() == requested)
        .or_else(|| available.iter().find(|name| name.as_str() == DEFAULT_SHEET))
        .or_else(|| available.first())
        .map(String::as_str)
}

/// Load one sheet of a workbook container, returning the selected sheet name
pub fn from_workbook(path: &Path, sheet_name: &str) -> Result<(String, RawSheet), IngestError> {
    let parse_failed = |message: String| IngestError::ParseFailed {
        path: path.to_path_buf(),
        message,
    };

    let mut workbook = open_workbook_auto(path).map_err(|e| parse_failed(e.to_string()))?;
    let available = workbook.sheet_names();

    let selected = select_sheet(&available, sheet_name)
        .ok_or_else(|| IngestError::SheetNotFound {
            requested: sheet_name.to_string(),
            available: available.clone(),
        })?
        .to_string();
    if selected != sheet_name {
        log::warn!(
            "sheet '{sheet_name}' not in {}, using '{selected}'",
            path.display()
        );
    }

    let range = workbook
        .worksheet_range(&selected)
        .map_err(|e| parse_failed(format!("sheet '{selected}': {e}")))?;

    let rows = range
        .rows()
        .map(|row| row.iter().map(cell_to_string).collect())
        .collect();
    Ok((selected, RawSheet::new(rows)))
}

/// Render a workbook cell the way it would be exported to text
fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => f.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::Error(e) => e.to_string(),
        Data::DateTime(dt) => dt.as_f64().to_string(),
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
    }
}
