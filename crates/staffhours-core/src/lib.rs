//! Core domain model and error taxonomy for the staff hours report.

use std::fmt;
use std::sync::OnceLock;

use chrono::{Months, NaiveDate};
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "staffhours-core";

/// Months of service history credited to a client who enrolls during the period.
pub const NEW_ENROLLMENT_LOOKBACK_MONTHS: u32 = 3;

/// Sheet names used by the source workbooks and the report workbook.
pub mod sheet {
    pub const ENTRY_DATA: &str = "Entry Data";
    pub const SERVICE_DATA: &str = "Service Data";
    pub const STANDARD_CHART: &str = "Reporting Use";
    pub const EHA_CHART: &str = "EHA & EHA2 Reporting";

    pub const SUMMARY: &str = "Summary";
    pub const PROCESSED_DATA: &str = "Processed Data";
    pub const RAW_SERVICES: &str = "Raw Services";
    pub const RAW_ENTRIES: &str = "Raw Entries";
    pub const EHA_SERVICES_CHART: &str = "EHA Services Chart";
    pub const SERVICES_CHART: &str = "Services Chart";
}

pub type ClientId = String;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("reporting period start {start} must be before its end {end}")]
    InvalidPeriod { start: NaiveDate, end: NaiveDate },
    #[error("invalid {field} date '{value}' (expected YYYY-MM-DD)")]
    InvalidDate { field: &'static str, value: String },
    #[error("{0} is not set")]
    MissingSetting(&'static str),
    #[error("invalid value '{value}' for {name}")]
    InvalidSetting { name: &'static str, value: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DataShapeError {
    #[error("table '{table}' is missing required column '{column}'")]
    MissingColumn { table: String, column: String },
    #[error("table '{table}' row {row} has {found} cells, header has {expected}")]
    RaggedRow {
        table: String,
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("table '{table}' row {row} column '{column}': cannot read '{value}' as {expected}")]
    InvalidCell {
        table: String,
        row: usize,
        column: String,
        value: String,
        expected: &'static str,
    },
    #[error("client '{client_id}' has {rows} entry rows; at most one is allowed")]
    DuplicateEntry { client_id: ClientId, rows: usize },
    #[error("table '{table}' lists service code '{service_code}' twice with different time values ({first} vs {second})")]
    ConflictingRate {
        table: String,
        service_code: String,
        first: String,
        second: String,
    },
    #[error("hours for {group} exceed the representable range")]
    HoursOverflow { group: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StaffHoursError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    DataShape(#[from] DataShapeError),
}

/// Client admission row from the "Entry Data" sheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub client_id: ClientId,
    pub entry_date: Option<NaiveDate>,
}

/// Service row from the "Service Data" sheet, staff user still in display form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub client_id: ClientId,
    pub service_date: Option<NaiveDate>,
    pub staff_user_raw: Option<String>,
    pub service_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCodeRate {
    pub service_code: String,
    pub time_value: Option<Decimal>,
}

/// Which service chart prices the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateChartKind {
    Standard,
    Eha,
}

impl RateChartKind {
    pub fn from_eha_flag(eha: bool) -> Self {
        if eha {
            Self::Eha
        } else {
            Self::Standard
        }
    }

    pub fn source_sheet(self) -> &'static str {
        match self {
            Self::Standard => sheet::STANDARD_CHART,
            Self::Eha => sheet::EHA_CHART,
        }
    }

    pub fn slug(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Eha => "eha",
        }
    }
}

impl fmt::Display for RateChartKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// Reporting window. Construction guarantees `start < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReportingPeriod {
    start: NaiveDate,
    end: NaiveDate,
}

impl ReportingPeriod {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, ConfigurationError> {
        if start >= end {
            return Err(ConfigurationError::InvalidPeriod { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn parse(start: &str, end: &str) -> Result<Self, ConfigurationError> {
        let start = parse_iso_date("period start", start)?;
        let end = parse_iso_date("period end", end)?;
        Self::new(start, end)
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date < self.end
    }
}

impl fmt::Display for ReportingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

fn parse_iso_date(field: &'static str, value: &str) -> Result<NaiveDate, ConfigurationError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|_| {
        ConfigurationError::InvalidDate {
            field,
            value: value.to_string(),
        }
    })
}

/// Filter branch that admitted a service record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InclusionRule {
    /// Client entered before the period; only services on or after its start count.
    AlreadyEnrolled,
    /// Client entered during or after the period start; prior services are credited.
    NewlyEnrolled,
}

impl InclusionRule {
    pub fn label(self) -> &'static str {
        match self {
            Self::AlreadyEnrolled => "already enrolled",
            Self::NewlyEnrolled => "newly enrolled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilteredRecord {
    pub client_id: ClientId,
    pub service_date: NaiveDate,
    pub staff_user: Option<String>,
    pub service_code: String,
    pub rule: InclusionRule,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RatedRecord {
    #[serde(flatten)]
    pub record: FilteredRecord,
    pub time_value: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SummaryRow {
    pub staff_user: String,
    pub total_hours: Decimal,
}

fn staff_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\(\d*\)").expect("static staff id pattern compiles"))
}

/// Strips every parenthesized digit group from a staff display name.
///
/// Whitespace around the removed group is kept, so `"Jane Doe (1234)"`
/// becomes `"Jane Doe "`.
pub fn normalize_staff_user(raw: &str) -> String {
    staff_id_pattern().replace_all(raw, "").into_owned()
}

/// `date` minus `months` calendar months, clamped to the end of the target month.
pub fn months_before(date: NaiveDate, months: u32) -> Option<NaiveDate> {
    date.checked_sub_months(Months::new(months))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn staff_id_suffix_is_stripped_keeping_trailing_space() {
        assert_eq!(normalize_staff_user("Jane Doe (1234)"), "Jane Doe ");
        assert_eq!(normalize_staff_user("John Roe(2)"), "John Roe");
    }

    #[test]
    fn every_parenthesized_digit_group_is_removed() {
        assert_eq!(normalize_staff_user("(12) Ann (34) Lee ()"), " Ann  Lee ");
    }

    #[test]
    fn names_without_digit_groups_pass_through() {
        assert_eq!(normalize_staff_user("Mary Major"), "Mary Major");
        assert_eq!(normalize_staff_user("Team (North)"), "Team (North)");
    }

    #[test]
    fn period_requires_start_before_end() {
        let err = ReportingPeriod::new(d("2018-05-01"), d("2018-05-01")).unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::InvalidPeriod {
                start: d("2018-05-01"),
                end: d("2018-05-01"),
            }
        );
        assert!(ReportingPeriod::new(d("2018-06-01"), d("2018-05-01")).is_err());
        assert!(ReportingPeriod::new(d("2018-04-01"), d("2018-05-01")).is_ok());
    }

    #[test]
    fn period_parse_rejects_malformed_dates() {
        let err = ReportingPeriod::parse("04/01/2018", "2018-05-01").unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidDate { field: "period start", .. }));
    }

    #[test]
    fn period_contains_is_half_open() {
        let period = ReportingPeriod::parse("2018-04-01", "2018-05-01").unwrap();
        assert!(period.contains(d("2018-04-01")));
        assert!(period.contains(d("2018-04-30")));
        assert!(!period.contains(d("2018-05-01")));
        assert_eq!(period.to_string(), "[2018-04-01, 2018-05-01)");
    }

    #[test]
    fn month_lookback_clamps_to_month_end() {
        assert_eq!(months_before(d("2018-04-10"), 3), Some(d("2018-01-10")));
        assert_eq!(months_before(d("2018-05-31"), 3), Some(d("2018-02-28")));
        assert_eq!(months_before(d("2020-05-31"), 3), Some(d("2020-02-29")));
    }

    #[test]
    fn chart_kind_follows_eha_flag() {
        assert_eq!(RateChartKind::from_eha_flag(true), RateChartKind::Eha);
        assert_eq!(RateChartKind::from_eha_flag(false).source_sheet(), sheet::STANDARD_CHART);
    }
}
