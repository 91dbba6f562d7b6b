//! Sheet loaders: CSV exports of the activity report and service chart into typed tables.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use staffhours_core::{sheet, DataShapeError, Entry, ServiceCodeRate, ServiceRecord};
use tracing::info;

pub const CRATE_NAME: &str = "staffhours-adapters";

const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%m/%d/%Y"];
const DATETIME_FORMATS: [&str; 7] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %I:%M %p",
];

/// One sheet as header names plus string cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTable {
    name: String,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn new(name: impl Into<String>, headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self {
            name: name.into(),
            headers,
            rows,
        }
    }

    pub fn from_csv_reader<R: Read>(name: &str, reader: R) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);

        let headers = csv_reader
            .headers()
            .with_context(|| format!("reading header row of sheet '{name}'"))?
            .iter()
            .enumerate()
            .map(|(i, h)| {
                let h = if i == 0 { h.trim_start_matches('\u{feff}') } else { h };
                h.trim().to_string()
            })
            .collect::<Vec<_>>();

        let mut rows = Vec::new();
        for (index, record) in csv_reader.records().enumerate() {
            let record = record
                .with_context(|| format!("reading row {} of sheet '{name}'", index + 2))?;
            rows.push(record.iter().map(str::to_string).collect());
        }

        Ok(Self::new(name, headers, rows))
    }

    pub fn from_csv_str(name: &str, text: &str) -> Result<Self> {
        Self::from_csv_reader(name, text.as_bytes())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, column: &str) -> Result<usize, DataShapeError> {
        self.headers
            .iter()
            .position(|h| h == column)
            .ok_or_else(|| DataShapeError::MissingColumn {
                table: self.name.clone(),
                column: column.to_string(),
            })
    }

    /// Rows with their spreadsheet line number (header is line 1).
    fn checked_rows(
        &self,
    ) -> impl Iterator<Item = Result<(usize, &[String]), DataShapeError>> + '_ {
        let expected = self.headers.len();
        self.rows.iter().enumerate().map(move |(index, row)| {
            let line = index + 2;
            if row.len() != expected {
                return Err(DataShapeError::RaggedRow {
                    table: self.name.clone(),
                    row: line,
                    expected,
                    found: row.len(),
                });
            }
            Ok((line, row.as_slice()))
        })
    }
}

/// A place sheets can be read from by name.
pub trait SheetSource {
    fn describe(&self) -> String;
    fn read_sheet(&self, sheet_name: &str) -> Result<RawTable>;
}

/// Directory holding one `<sheet name>.csv` file per exported sheet.
#[derive(Debug, Clone)]
pub struct CsvSheetDirectory {
    dir: PathBuf,
}

impl CsvSheetDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn sheet_path(&self, sheet_name: &str) -> PathBuf {
        self.dir.join(format!("{sheet_name}.csv"))
    }
}

impl SheetSource for CsvSheetDirectory {
    fn describe(&self) -> String {
        self.dir.display().to_string()
    }

    fn read_sheet(&self, sheet_name: &str) -> Result<RawTable> {
        let path = self.sheet_path(sheet_name);
        let file = fs::File::open(&path)
            .with_context(|| format!("opening sheet export {}", path.display()))?;
        RawTable::from_csv_reader(sheet_name, file)
            .with_context(|| format!("parsing {}", path.display()))
    }
}

/// Sheets held in memory, keyed by sheet name.
#[derive(Debug, Clone, Default)]
pub struct InMemorySheets {
    sheets: HashMap<String, RawTable>,
}

impl InMemorySheets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_csv(mut self, sheet_name: &str, text: &str) -> Result<Self> {
        let table = RawTable::from_csv_str(sheet_name, text)?;
        self.sheets.insert(sheet_name.to_string(), table);
        Ok(self)
    }
}

impl SheetSource for InMemorySheets {
    fn describe(&self) -> String {
        "in-memory sheets".to_string()
    }

    fn read_sheet(&self, sheet_name: &str) -> Result<RawTable> {
        self.sheets
            .get(sheet_name)
            .cloned()
            .with_context(|| format!("sheet '{sheet_name}' not present"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryColumns {
    pub client_id: String,
    pub entry_date: String,
}

impl Default for EntryColumns {
    fn default() -> Self {
        Self {
            client_id: "Client Uid".to_string(),
            entry_date: "Entry Exit Entry Date".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceColumns {
    pub client_id: String,
    pub service_date: String,
    pub staff_user: String,
    pub service_code: String,
}

impl Default for ServiceColumns {
    fn default() -> Self {
        Self {
            client_id: "Client Uid".to_string(),
            service_date: "Service Provide Start Date".to_string(),
            staff_user: "Service User Creating".to_string(),
            service_code: "Provider Specific Code".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChartColumns {
    pub service_code: String,
    pub time_value: String,
}

impl Default for ChartColumns {
    fn default() -> Self {
        Self {
            service_code: "Service Provider Specific Code".to_string(),
            time_value: "Time Value".to_string(),
        }
    }
}

/// Column names read from each sheet. Missing keys keep the export defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnLayout {
    pub entries: EntryColumns,
    pub services: ServiceColumns,
    pub charts: ChartColumns,
}

impl ColumnLayout {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing column layout")
    }

    pub fn from_yaml_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Entry and service tables from the staff activity report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportSheets {
    pub entries: Vec<Entry>,
    pub services: Vec<ServiceRecord>,
}

impl ReportSheets {
    pub fn from_tables(
        entries: &RawTable,
        services: &RawTable,
        layout: &ColumnLayout,
    ) -> Result<Self, DataShapeError> {
        Ok(Self {
            entries: parse_entries(entries, &layout.entries)?,
            services: parse_services(services, &layout.services)?,
        })
    }
}

/// Standard and EHA service charts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChartSheets {
    pub standard: Vec<ServiceCodeRate>,
    pub eha: Vec<ServiceCodeRate>,
}

impl ChartSheets {
    pub fn from_tables(
        standard: &RawTable,
        eha: &RawTable,
        layout: &ColumnLayout,
    ) -> Result<Self, DataShapeError> {
        Ok(Self {
            standard: parse_rate_chart(standard, &layout.charts)?,
            eha: parse_rate_chart(eha, &layout.charts)?,
        })
    }
}

pub fn load_report_sheets(source: &dyn SheetSource, layout: &ColumnLayout) -> Result<ReportSheets> {
    let entries = source.read_sheet(sheet::ENTRY_DATA)?;
    let services = source.read_sheet(sheet::SERVICE_DATA)?;
    let sheets = ReportSheets::from_tables(&entries, &services, layout)?;
    info!(
        source = %source.describe(),
        entries = sheets.entries.len(),
        services = sheets.services.len(),
        "loaded activity report"
    );
    Ok(sheets)
}

pub fn load_chart_sheets(source: &dyn SheetSource, layout: &ColumnLayout) -> Result<ChartSheets> {
    let standard = source.read_sheet(sheet::STANDARD_CHART)?;
    let eha = source.read_sheet(sheet::EHA_CHART)?;
    let charts = ChartSheets::from_tables(&standard, &eha, layout)?;
    info!(
        source = %source.describe(),
        standard_codes = charts.standard.len(),
        eha_codes = charts.eha.len(),
        "loaded service charts"
    );
    Ok(charts)
}

pub fn parse_entries(table: &RawTable, columns: &EntryColumns) -> Result<Vec<Entry>, DataShapeError> {
    let client_col = table.column(&columns.client_id)?;
    let date_col = table.column(&columns.entry_date)?;

    let mut entries = Vec::with_capacity(table.len());
    for row in table.checked_rows() {
        let (line, cells) = row?;
        entries.push(Entry {
            client_id: cells[client_col].trim().to_string(),
            entry_date: date_cell(table, line, &columns.entry_date, &cells[date_col])?,
        });
    }
    Ok(entries)
}

pub fn parse_services(
    table: &RawTable,
    columns: &ServiceColumns,
) -> Result<Vec<ServiceRecord>, DataShapeError> {
    let client_col = table.column(&columns.client_id)?;
    let date_col = table.column(&columns.service_date)?;
    let user_col = table.column(&columns.staff_user)?;
    let code_col = table.column(&columns.service_code)?;

    let mut services = Vec::with_capacity(table.len());
    for row in table.checked_rows() {
        let (line, cells) = row?;
        let staff_user = &cells[user_col];
        services.push(ServiceRecord {
            client_id: cells[client_col].trim().to_string(),
            service_date: date_cell(table, line, &columns.service_date, &cells[date_col])?,
            staff_user_raw: (!staff_user.trim().is_empty()).then(|| staff_user.clone()),
            service_code: cells[code_col].trim().to_string(),
        });
    }
    Ok(services)
}

pub fn parse_rate_chart(
    table: &RawTable,
    columns: &ChartColumns,
) -> Result<Vec<ServiceCodeRate>, DataShapeError> {
    let code_col = table.column(&columns.service_code)?;
    let value_col = table.column(&columns.time_value)?;

    let mut rates = Vec::with_capacity(table.len());
    for row in table.checked_rows() {
        let (line, cells) = row?;
        let service_code = cells[code_col].trim();
        if service_code.is_empty() {
            continue;
        }
        rates.push(ServiceCodeRate {
            service_code: service_code.to_string(),
            time_value: decimal_cell(table, line, &columns.time_value, &cells[value_col])?,
        });
    }
    Ok(rates)
}

/// Parses a spreadsheet date cell; any time-of-day part is discarded.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
                .map(|dt| dt.date())
        })
}

fn date_cell(
    table: &RawTable,
    line: usize,
    column: &str,
    value: &str,
) -> Result<Option<NaiveDate>, DataShapeError> {
    if value.trim().is_empty() {
        return Ok(None);
    }
    parse_date(value)
        .map(Some)
        .ok_or_else(|| invalid_cell(table, line, column, value, "a date"))
}

fn decimal_cell(
    table: &RawTable,
    line: usize,
    column: &str,
    value: &str,
) -> Result<Option<Decimal>, DataShapeError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    Decimal::from_str(trimmed)
        .map(Some)
        .map_err(|_| invalid_cell(table, line, column, value, "a number"))
}

fn invalid_cell(
    table: &RawTable,
    line: usize,
    column: &str,
    value: &str,
    expected: &'static str,
) -> DataShapeError {
    DataShapeError::InvalidCell {
        table: table.name().to_string(),
        row: line,
        column: column.to_string(),
        value: value.to_string(),
        expected,
    }
}
