//! Reshape header-tagged sheet rows into typed dashboard records
//!
//! A dashboard sheet carries three designated columns: a section tag
//! (`TARGET`), a metric label (`KPI`) and a clean value (`SEGMEN`). Rows are
//! routed by keywords in the section tag to a record family, then by keywords
//! in the label to a metric. Quarterly figures sit at fixed offsets to the
//! right of the clean-value column (see [`quarter_cells`]).
//!
//! Malformed cells never fail a run: spreadsheet error tokens and
//! unparsable numbers are replaced by zero. Only a missing designated column
//! stops normalization, and [`normalize`] turns even that into an empty
//! result.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::NormalizeError;
use crate::raw::{RawSheet, cell_at};

/// Header of the section-tag column
pub const SECTION_COLUMN: &str = "TARGET";
/// Header of the metric label column
pub const LABEL_COLUMN: &str = "KPI";
/// Header of the clean-value (segment) column
pub const VALUE_COLUMN: &str = "SEGMEN";
/// Optional header carrying the region of a row
pub const REGION_COLUMN: &str = "REGION";

/// Period name of the annual aggregate record
pub const ANNUAL_PERIOD: &str = "FY";
const QUARTER_PERIODS: [&str; 4] = ["Q1", "Q2", "Q3", "Q4"];

/// Markers of broken spreadsheet formulas
const ERROR_TOKENS: &[&str] = &[
    "#REF!", "#N/A", "#DIV/0!", "#VALUE!", "#NAME?", "#NUM!", "#NULL!", "#ERROR!",
];

lazy_static! {
    static ref NON_NUMERIC: Regex = Regex::new(r"[^0-9.,]").unwrap();
    static ref CURRENCY: Regex = Regex::new(r"(?i)\b(rp|idr)").unwrap();
}

/// True when `value` is (or contains) a spreadsheet error token
pub fn is_error_token(value: &str) -> bool {
    let upper = value.trim().to_uppercase();
    ERROR_TOKENS.iter().any(|token| upper.contains(token))
}

/// Parse a decorated display number, returning 0 for anything unparsable
///
/// Currency markers, percent signs, whitespace and the `,-` suffix are
/// ignored. Both `1.234.567,5` and `1,234,567.5` groupings are understood; a
/// leading minus or surrounding parentheses make the result negative.
///
/// A single dot followed by exactly three digits is ambiguous. It is read as
/// thousands grouping only when a currency marker (`Rp`, `IDR`) is present,
/// so `"Rp 150.000"` is 150000 while a bare `"150.000"` is 150. Rupiah cells
/// should carry the marker or use two separators.
///
/// # Examples
/// ```
/// use dashboard::normalizer::coerce;
///
/// assert_eq!(coerce("Rp 1.234.567,-"), 1_234_567.0);
/// assert_eq!(coerce("12.5%"), 12.5);
/// assert_eq!(coerce("#REF!"), 0.0);
/// assert_eq!(coerce(""), 0.0);
/// ```
pub fn coerce(value: &str) -> f64 {
    let trimmed = value.trim();
    if trimmed.is_empty() || is_error_token(trimmed) {
        return 0.0;
    }

    let negative = trimmed
        .chars()
        .find(|c| c.is_ascii_digit() || *c == '-' || *c == '(')
        .is_some_and(|c| c == '-' || c == '(');
    let has_currency = CURRENCY.is_match(trimmed);

    let stripped = NON_NUMERIC.replace_all(trimmed, "");
    let body = stripped.trim_matches(|c| c == '.' || c == ',');
    if body.is_empty() {
        return 0.0;
    }

    let magnitude = normalize_separators(body, has_currency)
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .unwrap_or(0.0);

    if negative { -magnitude } else { magnitude }
}

/// Rewrite digit grouping so that `.` is the only (decimal) separator
fn normalize_separators(body: &str, has_currency: bool) -> String {
    let dots = body.matches('.').count();
    let commas = body.matches(',').count();
    let digits_after = |sep: char| body.rsplit(sep).next().map_or(0, str::len);

    match (dots, commas) {
        (0, 0) => body.to_string(),
        (_, 0) if dots > 1 || (has_currency && digits_after('.') == 3) => body.replace('.', ""),
        (_, 0) => body.to_string(),
        (0, _) if commas > 1 || digits_after(',') == 3 => body.replace(',', ""),
        (0, _) => body.replace(',', "."),
        _ => {
            let last_dot = body.rfind('.').unwrap_or(0);
            let last_comma = body.rfind(',').unwrap_or(0);
            if last_comma > last_dot {
                body.replace('.', "").replace(',', ".")
            } else {
                body.replace(',', "")
            }
        }
    }
}

/// Display value of a cell with error tokens and blanks replaced by `"0"`
pub fn clean_value(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() || is_error_token(trimmed) {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Percentage display value, `"0%"` for error tokens and blanks
pub fn clean_percent(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() || is_error_token(trimmed) {
        "0%".to_string()
    } else if trimmed.ends_with('%') {
        trimmed.to_string()
    } else {
        format!("{trimmed}%")
    }
}

fn format_percent(value: f64) -> String {
    let rounded = (value * 10.0).round() / 10.0;
    format!("{rounded}%")
}

/// "DIGITAL BUSINESS" -> "Digital Business"
fn title_case(value: &str) -> String {
    value
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// Group of rows sharing a section tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    Revenue,
    DigitalProduct,
    OperationalKpi,
}

impl Family {
    /// Family a section tag belongs to, if any
    pub fn from_section(tag: &str) -> Option<Self> {
        let tag = tag.to_lowercase();
        if tag.contains("revenue") {
            Some(Family::Revenue)
        } else if tag.contains("digital") {
            Some(Family::DigitalProduct)
        } else if tag.contains("operational") || tag.split_whitespace().any(|w| w == "ops") {
            Some(Family::OperationalKpi)
        } else {
            None
        }
    }

    /// Unit of the family's absolute figures
    pub fn unit(self) -> &'static str {
        match self {
            Family::Revenue => "Rp",
            Family::DigitalProduct => "Unit",
            Family::OperationalKpi => "Score",
        }
    }

    fn title(self) -> &'static str {
        match self {
            Family::Revenue => "Revenue",
            Family::DigitalProduct => "Digital",
            Family::OperationalKpi => "Operational",
        }
    }
}

/// Figure a row carries, chosen from its label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Realization,
    Target,
    Achievement,
    Growth,
}

impl Metric {
    /// Metric named by a label, checking the most specific keywords first
    ///
    /// Achievement is matched on word starts only, so "Reach" or "Coach" are
    /// not achievement labels.
    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.to_lowercase();
        let achievement = label
            .split_whitespace()
            .map(|word| word.trim_start_matches(|c: char| !c.is_alphanumeric()))
            .any(|word| word.starts_with("ach"));
        if achievement {
            Some(Metric::Achievement)
        } else if label.contains("growth") || label.contains("yoy") {
            Some(Metric::Growth)
        } else if label.contains("target") {
            Some(Metric::Target)
        } else if ["sold", "real", "revenue"].iter().any(|k| label.contains(k)) {
            Some(Metric::Realization)
        } else {
            None
        }
    }

    fn prefix(self) -> &'static str {
        match self {
            Metric::Realization => "Rev",
            Metric::Target => "Target",
            Metric::Achievement => "Ach",
            Metric::Growth => "Growth",
        }
    }

    fn is_percent(self) -> bool {
        matches!(self, Metric::Achievement | Metric::Growth)
    }
}

/// What a caller wants out of a sheet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Revenue,
    DigitalProduct,
    OperationalKpi,
    Performance,
    TargetAchievement,
}

impl RecordKind {
    fn family(self) -> Option<Family> {
        match self {
            RecordKind::Revenue => Some(Family::Revenue),
            RecordKind::DigitalProduct => Some(Family::DigitalProduct),
            RecordKind::OperationalKpi => Some(Family::OperationalKpi),
            RecordKind::Performance | RecordKind::TargetAchievement => None,
        }
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "revenue" => Ok(RecordKind::Revenue),
            "digital" | "digital_product" => Ok(RecordKind::DigitalProduct),
            "operational" | "operational_kpi" | "kpi" => Ok(RecordKind::OperationalKpi),
            "performance" => Ok(RecordKind::Performance),
            "target" | "target_achievement" => Ok(RecordKind::TargetAchievement),
            other => Err(format!("unknown record kind '{other}'")),
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordKind::Revenue => "revenue",
            RecordKind::DigitalProduct => "digital_product",
            RecordKind::OperationalKpi => "operational_kpi",
            RecordKind::Performance => "performance",
            RecordKind::TargetAchievement => "target_achievement",
        };
        f.write_str(name)
    }
}

/// One charted figure for one period
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevenueData {
    pub period: String,
    pub category: String,
    pub region: String,
    pub unit: String,
    pub raw_value: String,
    pub cumulative_value: String,
    pub achievement_pct: String,
    pub growth_pct: String,
}

impl RevenueData {
    pub fn value(&self) -> f64 {
        coerce(&self.raw_value)
    }

    pub fn cumulative(&self) -> f64 {
        coerce(&self.cumulative_value)
    }
}

/// Results of one named individual
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSummary {
    pub name: String,
    pub target: String,
    pub realization: String,
    pub achievement_pct: String,
}

/// Annual target against realization for one family and segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetAchievement {
    pub category: String,
    pub target: String,
    pub realization: String,
    pub achievement_pct: String,
}

/// Any record the normalizer produces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DashboardRecord {
    Revenue(RevenueData),
    Performance(PerformanceSummary),
    Target(TargetAchievement),
}

/// Indices of the designated columns in a header row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Columns {
    pub section: usize,
    pub label: usize,
    pub value: usize,
    pub region: Option<usize>,
}

impl Columns {
    /// Find the designated columns by (case-insensitive) header name
    pub fn locate(header: &[String]) -> Result<Self, NormalizeError> {
        let find = |name: &str| {
            header
                .iter()
                .position(|h| h.trim().eq_ignore_ascii_case(name))
        };

        let section = find(SECTION_COLUMN);
        let label = find(LABEL_COLUMN);
        let value = find(VALUE_COLUMN);

        match (section, label, value) {
            (Some(section), Some(label), Some(value)) => Ok(Self {
                section,
                label,
                value,
                region: find(REGION_COLUMN),
            }),
            _ => {
                let missing = [
                    (SECTION_COLUMN, section),
                    (LABEL_COLUMN, label),
                    (VALUE_COLUMN, value),
                ]
                .iter()
                .filter(|(_, idx)| idx.is_none())
                .map(|(name, _)| name.to_string())
                .collect();
                Err(NormalizeError::SchemaMismatch { missing })
            }
        }
    }

    fn of(sheet: &RawSheet) -> Result<Self, NormalizeError> {
        let header = sheet.header().ok_or(NormalizeError::EmptySheet)?;
        Self::locate(header)
    }
}

/// Quarterly breakdown and annual total of a row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuarterCells {
    pub quarters: [String; 4],
    pub annual: String,
}

/// Read the quarterly layout of a dashboard row
///
/// The dashboard sheets do not name their quarter columns consistently, so
/// these are read by position: Q1..Q4 are the four cells right of the
/// clean-value column and the annual total is the fifth. This is the only
/// place positional columns are used.
pub fn quarter_cells(row: &[String], value_col: usize) -> QuarterCells {
    QuarterCells {
        quarters: [1, 2, 3, 4].map(|offset| cell_at(row, value_col + offset).trim().to_string()),
        annual: cell_at(row, value_col + 5).trim().to_string(),
    }
}

/// A data row that belongs to a known family and metric
struct TaggedRow<'a> {
    family: Family,
    metric: Metric,
    segment: &'a str,
    region: &'a str,
    cells: QuarterCells,
}

fn tagged_rows<'a>(sheet: &'a RawSheet, columns: Columns) -> impl Iterator<Item = TaggedRow<'a>> + 'a {
    sheet.data_rows().iter().filter_map(move |row| {
        let family = Family::from_section(cell_at(row, columns.section))?;
        let label = cell_at(row, columns.label);
        let Some(metric) = Metric::from_label(label) else {
            log::debug!("skipping {family:?} row with unrecognised label '{label}'");
            return None;
        };
        Some(TaggedRow {
            family,
            metric,
            segment: cell_at(row, columns.value).trim(),
            region: columns.region.map_or("", |idx| cell_at(row, idx).trim()),
            cells: quarter_cells(row, columns.value),
        })
    })
}

/// Emit Q1..Q4 and the annual record of one row
fn period_records(row: &TaggedRow<'_>) -> Vec<RevenueData> {
    let category = format!("{} {}", row.metric.prefix(), title_case(row.segment))
        .trim()
        .to_string();
    let render = |value: &str| {
        if row.metric.is_percent() {
            clean_percent(value)
        } else {
            clean_value(value)
        }
    };
    let unit = if row.metric.is_percent() { "%" } else { row.family.unit() };
    let cumulative = render(row.cells.annual.as_str());

    QUARTER_PERIODS
        .iter()
        .zip(row.cells.quarters.iter())
        .chain(std::iter::once((&ANNUAL_PERIOD, &row.cells.annual)))
        .map(|(period, value)| RevenueData {
            period: period.to_string(),
            category: category.clone(),
            region: row.region.to_string(),
            unit: unit.to_string(),
            raw_value: render(value.as_str()),
            cumulative_value: cumulative.clone(),
            achievement_pct: if row.metric == Metric::Achievement {
                clean_percent(value)
            } else {
                "0%".to_string()
            },
            growth_pct: if row.metric == Metric::Growth {
                clean_percent(value)
            } else {
                "0%".to_string()
            },
        })
        .collect()
}

/// Period records of every row in `family`
pub fn family_records(sheet: &RawSheet, family: Family) -> Result<Vec<RevenueData>, NormalizeError> {
    let columns = Columns::of(sheet)?;
    Ok(tagged_rows(sheet, columns)
        .filter(|row| row.family == family)
        .flat_map(|row| period_records(&row))
        .collect())
}

/// Normalize a sheet, surfacing structural problems
pub fn try_normalize(
    sheet: &RawSheet,
    kind: RecordKind,
) -> Result<Vec<DashboardRecord>, NormalizeError> {
    if let Some(family) = kind.family() {
        return Ok(family_records(sheet, family)?
            .into_iter()
            .map(DashboardRecord::Revenue)
            .collect());
    }
    match kind {
        RecordKind::Performance => Ok(performance_summaries(sheet)?
            .into_iter()
            .map(DashboardRecord::Performance)
            .collect()),
        _ => Ok(target_achievements(sheet)?
            .into_iter()
            .map(DashboardRecord::Target)
            .collect()),
    }
}

/// Normalize a sheet into dashboard records
///
/// Never fails: a sheet without the designated columns yields no records so
/// the dashboard shows "no data" instead of an error.
pub fn normalize(sheet: &RawSheet, kind: RecordKind) -> Vec<DashboardRecord> {
    match try_normalize(sheet, kind) {
        Ok(records) => records,
        Err(e) => {
            log::warn!("cannot normalize {kind} records: {e}");
            Vec::new()
        }
    }
}

/// Label -> clean value pairs sharing one section tag
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LabeledRecord {
    pub section: String,
    pub values: BTreeMap<String, String>,
}

impl LabeledRecord {
    /// Value of the first label naming `metric`
    pub fn metric(&self, metric: Metric) -> Option<&str> {
        self.values
            .iter()
            .find(|(label, _)| Metric::from_label(label) == Some(metric))
            .map(|(_, value)| value.as_str())
    }
}

/// Group rows by section tag, then by label
///
/// Groups keep the order in which their section first appears; a repeated
/// label within a section keeps its last value.
pub fn label_records(sheet: &RawSheet) -> Result<Vec<LabeledRecord>, NormalizeError> {
    let columns = Columns::of(sheet)?;
    let mut records: Vec<LabeledRecord> = Vec::new();

    for row in sheet.data_rows() {
        let section = cell_at(row, columns.section).trim();
        let label = cell_at(row, columns.label).trim();
        if section.is_empty() || label.is_empty() {
            continue;
        }
        let value = clean_value(cell_at(row, columns.value));

        match records.iter_mut().find(|r| r.section == section) {
            Some(record) => {
                record.values.insert(label.to_string(), value);
            }
            None => records.push(LabeledRecord {
                section: section.to_string(),
                values: BTreeMap::from([(label.to_string(), value)]),
            }),
        }
    }
    Ok(records)
}

/// Realization over target as a percentage, `0%` when there is no target
fn achievement(target: &str, realization: &str) -> String {
    let target = coerce(target);
    if target == 0.0 {
        return "0%".to_string();
    }
    format_percent(coerce(realization) / target * 100.0)
}

/// One summary per named individual
///
/// Every section tag that is not a record family is taken to be a person.
pub fn performance_summaries(sheet: &RawSheet) -> Result<Vec<PerformanceSummary>, NormalizeError> {
    Ok(label_records(sheet)?
        .into_iter()
        .filter(|record| Family::from_section(&record.section).is_none())
        .map(|record| {
            let target = clean_value(record.metric(Metric::Target).unwrap_or(""));
            let realization = clean_value(record.metric(Metric::Realization).unwrap_or(""));
            let achievement_pct = match record.metric(Metric::Achievement) {
                Some(explicit) => clean_percent(explicit),
                None => achievement(&target, &realization),
            };
            PerformanceSummary {
                name: record.section,
                target,
                realization,
                achievement_pct,
            }
        })
        .collect())
}

/// Annual target vs realization per family and segment
pub fn target_achievements(sheet: &RawSheet) -> Result<Vec<TargetAchievement>, NormalizeError> {
    let columns = Columns::of(sheet)?;

    #[derive(Default)]
    struct Totals {
        target: Option<String>,
        realization: Option<String>,
        achievement: Option<String>,
    }
    let mut groups: Vec<(String, Totals)> = Vec::new();

    for row in tagged_rows(sheet, columns) {
        let category = format!("{} {}", row.family.title(), title_case(row.segment))
            .trim()
            .to_string();
        let index = match groups.iter().position(|(c, _)| *c == category) {
            Some(index) => index,
            None => {
                groups.push((category, Totals::default()));
                groups.len() - 1
            }
        };
        let totals = &mut groups[index].1;
        let annual = row.cells.annual.clone();
        match row.metric {
            Metric::Target => totals.target = Some(annual),
            Metric::Realization => totals.realization = Some(annual),
            Metric::Achievement => totals.achievement = Some(annual),
            Metric::Growth => {}
        }
    }

    Ok(groups
        .into_iter()
        .map(|(category, totals)| {
            let target = clean_value(totals.target.as_deref().unwrap_or(""));
            let realization = clean_value(totals.realization.as_deref().unwrap_or(""));
            let achievement_pct = match totals.achievement {
                Some(explicit) => clean_percent(&explicit),
                None => achievement(&target, &realization),
            };
            TargetAchievement {
                category,
                target,
                realization,
                achievement_pct,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> Vec<&'static str> {
        vec!["TARGET", "KPI", "SEGMEN", "Q1", "Q2", "Q3", "Q4", "FY"]
    }

    #[test]
    fn coerce_strips_decoration() {
        assert_eq!(coerce("Rp 1.234.567,-"), 1_234_567.0);
        assert_eq!(coerce("Rp1.500"), 1_500.0);
        assert_eq!(coerce("12.5%"), 12.5);
        assert_eq!(coerce("12,5%"), 12.5);
        assert_eq!(coerce("1,234,567.89"), 1_234_567.89);
        assert_eq!(coerce("1.234.567,89"), 1_234_567.89);
        assert_eq!(coerce("-3.5%"), -3.5);
        assert_eq!(coerce("(1.000.000)"), -1_000_000.0);
        assert_eq!(coerce("100"), 100.0);
    }

    #[test]
    fn three_digit_groups_need_a_currency_marker() {
        assert_eq!(coerce("Rp 150.000"), 150_000.0);
        assert_eq!(coerce("IDR 150,000"), 150_000.0);
        assert_eq!(coerce("150.000"), 150.0);
        assert_eq!(coerce("150.000.000"), 150_000_000.0);
    }

    #[test]
    fn coerce_defaults_to_zero() {
        assert_eq!(coerce("#REF!"), 0.0);
        assert_eq!(coerce("#DIV/0!"), 0.0);
        assert_eq!(coerce(""), 0.0);
        assert_eq!(coerce("   "), 0.0);
        assert_eq!(coerce("n/a"), 0.0);
        assert_eq!(coerce("Rp -"), 0.0);
    }

    #[test]
    fn error_tokens_become_zero_defaults() {
        assert_eq!(clean_value("#REF!"), "0");
        assert_eq!(clean_value(" 42 "), "42");
        assert_eq!(clean_percent("#N/A"), "0%");
        assert_eq!(clean_percent("85"), "85%");
        assert_eq!(clean_percent("85%"), "85%");
    }

    #[test]
    fn title_case_words() {
        assert_eq!(title_case("SMES"), "Smes");
        assert_eq!(title_case("digital  BUSINESS"), "Digital Business");
    }

    #[test]
    fn families_and_metrics_follow_keywords() {
        assert_eq!(Family::from_section("Revenue"), Some(Family::Revenue));
        assert_eq!(Family::from_section("DIGITAL PRODUCT"), Some(Family::DigitalProduct));
        assert_eq!(Family::from_section("ops kpi"), Some(Family::OperationalKpi));
        assert_eq!(Family::from_section("Budi Santoso"), None);

        assert_eq!(Metric::from_label("revenue sold"), Some(Metric::Realization));
        assert_eq!(Metric::from_label("Target Revenue"), Some(Metric::Target));
        assert_eq!(Metric::from_label("Ach Target"), Some(Metric::Achievement));
        assert_eq!(Metric::from_label("Growth YoY"), Some(Metric::Growth));
        assert_eq!(Metric::from_label("notes"), None);
        assert_eq!(Metric::from_label("Reach"), None);
        assert_eq!(Metric::from_label("Coach revenue"), Some(Metric::Realization));
        assert_eq!(Metric::from_label("%Ach"), Some(Metric::Achievement));
        assert_eq!(Metric::from_label("achievement q1"), Some(Metric::Achievement));
    }

    #[test]
    fn missing_columns_report_schema_mismatch() {
        let sheet = RawSheet::from(vec![vec!["TARGET", "Label"], vec!["revenue", "x"]]);
        let err = try_normalize(&sheet, RecordKind::Revenue).unwrap_err();
        assert_eq!(
            err,
            NormalizeError::SchemaMismatch {
                missing: vec!["KPI".to_string(), "SEGMEN".to_string()]
            }
        );
        assert!(normalize(&sheet, RecordKind::Revenue).is_empty());
        assert!(normalize(&RawSheet::default(), RecordKind::Performance).is_empty());
    }

    #[test]
    fn quarter_cells_read_by_offset() {
        let row: Vec<String> = ["revenue", "revenue sold", "SMES", "10", "20"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let cells = quarter_cells(&row, 2);
        assert_eq!(cells.quarters, ["10", "20", "", ""].map(String::from));
        assert_eq!(cells.annual, "");
    }

    #[test]
    fn achievement_rows_fill_achievement_pct() {
        let sheet = RawSheet::from(vec![
            header(),
            vec!["revenue", "ach revenue", "SMES", "90%", "#REF!", "110", "", "100%"],
        ]);
        let records = family_records(&sheet, Family::Revenue).unwrap();
        assert_eq!(records.len(), 5);
        assert!(records.iter().all(|r| r.category == "Ach Smes" && r.unit == "%"));
        assert_eq!(records[0].achievement_pct, "90%");
        assert_eq!(records[1].achievement_pct, "0%");
        assert_eq!(records[2].achievement_pct, "110%");
        assert_eq!(records[3].raw_value, "0%");
        assert_eq!(records[4].cumulative_value, "100%");
        assert!(records.iter().all(|r| r.growth_pct == "0%"));
    }

    #[test]
    fn region_column_is_optional() {
        let sheet = RawSheet::from(vec![
            vec!["REGION", "TARGET", "KPI", "SEGMEN", "Q1", "Q2", "Q3", "Q4", "FY"],
            vec!["Jatim", "digital", "sold", "Indibiz", "1", "2", "3", "4", "10"],
        ]);
        let records = family_records(&sheet, Family::DigitalProduct).unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[0].region, "Jatim");
        assert_eq!(records[0].unit, "Unit");
        assert_eq!(records[0].category, "Rev Indibiz");
    }

    #[test]
    fn label_records_group_by_section() {
        let sheet = RawSheet::from(vec![
            header(),
            vec!["Ana", "target", "200"],
            vec!["Ana", "realisasi", "150"],
            vec!["Budi", "target", "#REF!"],
            vec!["", "target", "1"],
        ]);
        let records = label_records(&sheet).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].section, "Ana");
        assert_eq!(records[0].values["realisasi"], "150");
        assert_eq!(records[1].values["target"], "0");
    }

    #[test]
    fn performance_summaries_compute_missing_achievement() {
        let sheet = RawSheet::from(vec![
            header(),
            vec!["Ana", "target", "Rp 200"],
            vec!["Ana", "realisasi", "Rp 150"],
            vec!["Budi", "target", "100"],
            vec!["Budi", "ach", "95"],
            vec!["revenue", "revenue sold", "SMES", "1", "2", "3", "4", "10"],
        ]);
        let summaries = performance_summaries(&sheet).unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].name, "Ana");
        assert_eq!(summaries[0].achievement_pct, "75%");
        assert_eq!(summaries[1].name, "Budi");
        assert_eq!(summaries[1].realization, "0");
        assert_eq!(summaries[1].achievement_pct, "95%");
    }

    #[test]
    fn target_achievement_per_segment() {
        let sheet = RawSheet::from(vec![
            header(),
            vec!["revenue", "target", "SMES", "", "", "", "", "200"],
            vec!["revenue", "revenue sold", "SMES", "", "", "", "", "50"],
            vec!["revenue", "target", "GOV", "", "", "", "", "0"],
        ]);
        let rows = target_achievements(&sheet).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].category, "Revenue Smes");
        assert_eq!(rows[0].achievement_pct, "25%");
        assert_eq!(rows[1].category, "Revenue Gov");
        assert_eq!(rows[1].realization, "0");
        assert_eq!(rows[1].achievement_pct, "0%");
    }

    #[test]
    fn record_kind_parses_query_values() {
        assert_eq!("revenue".parse::<RecordKind>(), Ok(RecordKind::Revenue));
        assert_eq!("target-achievement".parse::<RecordKind>(), Ok(RecordKind::TargetAchievement));
        assert!("pie".parse::<RecordKind>().is_err());
        assert_eq!(RecordKind::OperationalKpi.to_string(), "operational_kpi");
    }
}
