//! Report bundle: workbook, parquet snapshots, manifest, run metadata and brief.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, NaiveDate, Utc};
use parquet::arrow::ArrowWriter;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_xlsxwriter::{Format, FormatAlign, FormatBorder, Workbook, Worksheet};
use serde::{Deserialize, Serialize};
use staffhours_core::{sheet, RateChartKind, ServiceCodeRate};
use staffhours_storage::ArtifactStore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{DuplicateEntryPolicy, ReportDatasets, ReportOptions, RunStats};

pub const WORKBOOK_FILE: &str = "staff_hours.xlsx";
pub const MANIFEST_FILE: &str = "snapshots/manifest.json";
pub const RUN_RECORD_FILE: &str = "run.json";
pub const BRIEF_FILE: &str = "brief.md";

const CLIENT_UID: &str = "Client Uid";
const ENTRY_DATE: &str = "Entry Exit Entry Date";
const SERVICE_DATE: &str = "Service Provide Start Date";
const STAFF_USER: &str = "Service User Creating";
const SERVICE_CODE: &str = "Provider Specific Code";
const CHART_CODE: &str = "Service Provider Specific Code";
const TIME_VALUE: &str = "Time Value";
const INCLUSION_RULE: &str = "Inclusion Rule";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub chart: RateChartKind,
    pub duplicate_entries: DuplicateEntryPolicy,
    pub bound_rule_a_by_period_end: bool,
    pub total_hours: Decimal,
    pub stats: RunStats,
}

impl RunRecord {
    pub fn new(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        options: &ReportOptions,
        datasets: &ReportDatasets,
    ) -> Self {
        Self {
            run_id,
            started_at,
            finished_at,
            period_start: datasets.period.start(),
            period_end: datasets.period.end(),
            chart: datasets.chart,
            duplicate_entries: options.duplicate_entries,
            bound_rule_a_by_period_end: options.bound_rule_a_by_period_end,
            total_hours: datasets.total_hours(),
            stats: datasets.stats,
        }
    }

    /// `<start>_<end>_<chart>_<first 8 hex digits of the run id>`
    pub fn bundle_name(&self) -> String {
        let run_id = self.run_id.simple().to_string();
        format!(
            "{}_{}_{}_{}",
            self.period_start,
            self.period_end,
            self.chart.slug(),
            &run_id[..8]
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Renders a run into a report directory under the output root.
#[derive(Debug, Clone)]
pub struct ReportWriter {
    store: ArtifactStore,
}

impl ReportWriter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            store: ArtifactStore::new(output_dir),
        }
    }

    pub fn output_dir(&self) -> &Path {
        self.store.root()
    }

    /// Every artifact is rendered in memory first, so a rendering error never
    /// touches the output root. Writing goes through a staged bundle that is
    /// removed unless the final rename succeeds.
    pub fn write(&self, record: &RunRecord, datasets: &ReportDatasets) -> Result<PathBuf> {
        let workbook = render_workbook(datasets).context("rendering report workbook")?;
        let snapshots = render_snapshots(datasets)?;
        let run_json = serde_json::to_vec_pretty(record).context("serializing run record")?;
        let brief = render_brief(record, datasets);

        let mut bundle = self.store.begin_bundle(&record.bundle_name())?;
        bundle.write_file(WORKBOOK_FILE, &workbook)?;

        let mut files = Vec::with_capacity(snapshots.len());
        for (name, bytes) in &snapshots {
            let stored = bundle.write_file(format!("snapshots/{name}.parquet"), bytes)?;
            files.push(SnapshotManifestFile {
                name: name.to_string(),
                path: stored.relative_path.display().to_string(),
                sha256: stored.content_hash,
                bytes: stored.byte_size as u64,
            });
        }
        let manifest = SnapshotManifest {
            schema_version: 1,
            files,
        };
        let manifest_bytes =
            serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
        bundle.write_file(MANIFEST_FILE, &manifest_bytes)?;
        bundle.write_file(RUN_RECORD_FILE, &run_json)?;
        bundle.write_file(BRIEF_FILE, brief.as_bytes())?;

        let dir = bundle.commit()?;
        info!(bundle = %dir.display(), snapshots = snapshots.len(), "report bundle committed");
        Ok(dir)
    }
}

struct WorkbookFormats {
    header: Format,
    text: Format,
    date: Format,
    hours: Format,
}

impl WorkbookFormats {
    fn new() -> Self {
        let header = Format::new()
            .set_bold()
            .set_align(FormatAlign::Center)
            .set_background_color(0x4472C4)
            .set_font_color(0xFFFFFF)
            .set_border(FormatBorder::Thin);
        let text = Format::new().set_border(FormatBorder::Thin);
        let date = Format::new()
            .set_num_format("yyyy-mm-dd")
            .set_border(FormatBorder::Thin);
        let hours = Format::new()
            .set_num_format("#,##0.00")
            .set_border(FormatBorder::Thin);
        Self {
            header,
            text,
            date,
            hours,
        }
    }
}

fn hours(value: Decimal) -> f64 {
    value.to_f64().unwrap_or_default()
}

/// One workbook cell; `Blank` leaves the cell unwritten.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Cell<'a> {
    Text(&'a str),
    Date(&'a NaiveDate),
    Hours(Decimal),
    Blank,
}

impl<'a> Cell<'a> {
    fn text(value: Option<&'a str>) -> Self {
        value.map_or(Cell::Blank, Cell::Text)
    }

    fn date(value: Option<&'a NaiveDate>) -> Self {
        value.map_or(Cell::Blank, Cell::Date)
    }

    fn hours(value: Option<Decimal>) -> Self {
        value.map_or(Cell::Blank, Cell::Hours)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct SheetPlan<'a> {
    name: &'static str,
    headers: &'static [&'static str],
    rows: Vec<Vec<Cell<'a>>>,
}

/// Sheets of the report workbook, in workbook order.
fn workbook_plan(datasets: &ReportDatasets) -> Vec<SheetPlan<'_>> {
    let summary = datasets
        .summary
        .iter()
        .map(|row| vec![Cell::Text(&row.staff_user), Cell::Hours(row.total_hours)])
        .collect();
    let processed = datasets
        .processed
        .iter()
        .map(|rated| {
            let record = &rated.record;
            vec![
                Cell::Text(&record.client_id),
                Cell::Date(&record.service_date),
                Cell::text(record.staff_user.as_deref()),
                Cell::Text(&record.service_code),
                Cell::Text(record.rule.label()),
                Cell::hours(rated.time_value),
            ]
        })
        .collect();
    let services = datasets
        .raw_services()
        .iter()
        .map(|service| {
            vec![
                Cell::Text(&service.client_id),
                Cell::date(service.service_date.as_ref()),
                Cell::text(service.staff_user_raw.as_deref()),
                Cell::Text(&service.service_code),
            ]
        })
        .collect();
    let entries = datasets
        .raw_entries()
        .iter()
        .map(|entry| {
            vec![
                Cell::Text(&entry.client_id),
                Cell::date(entry.entry_date.as_ref()),
            ]
        })
        .collect();

    vec![
        SheetPlan {
            name: sheet::SUMMARY,
            headers: &[STAFF_USER, TIME_VALUE],
            rows: summary,
        },
        SheetPlan {
            name: sheet::PROCESSED_DATA,
            headers: &[
                CLIENT_UID,
                SERVICE_DATE,
                STAFF_USER,
                SERVICE_CODE,
                INCLUSION_RULE,
                TIME_VALUE,
            ],
            rows: processed,
        },
        SheetPlan {
            name: sheet::RAW_SERVICES,
            headers: &[CLIENT_UID, SERVICE_DATE, STAFF_USER, SERVICE_CODE],
            rows: services,
        },
        SheetPlan {
            name: sheet::RAW_ENTRIES,
            headers: &[CLIENT_UID, ENTRY_DATE],
            rows: entries,
        },
        chart_plan(sheet::EHA_SERVICES_CHART, datasets.eha_chart()),
        chart_plan(sheet::SERVICES_CHART, datasets.standard_chart()),
    ]
}

fn chart_plan<'a>(name: &'static str, rows: &'a [ServiceCodeRate]) -> SheetPlan<'a> {
    SheetPlan {
        name,
        headers: &[CHART_CODE, TIME_VALUE],
        rows: rows
            .iter()
            .map(|rate| vec![Cell::Text(&rate.service_code), Cell::hours(rate.time_value)])
            .collect(),
    }
}

fn write_sheet(workbook: &mut Workbook, plan: &SheetPlan<'_>, formats: &WorkbookFormats) -> Result<()> {
    let sheet: &mut Worksheet = workbook.add_worksheet();
    sheet.set_name(plan.name)?;
    for (col, header) in plan.headers.iter().enumerate() {
        sheet.write_with_format(0, col as u16, *header, &formats.header)?;
        sheet.set_column_width(col as u16, 24)?;
    }
    sheet.set_freeze_panes(1, 0)?;

    for (i, cells) in plan.rows.iter().enumerate() {
        let row = i as u32 + 1;
        for (col, cell) in cells.iter().enumerate() {
            let col = col as u16;
            match *cell {
                Cell::Text(value) => {
                    sheet.write_with_format(row, col, value, &formats.text)?;
                }
                Cell::Date(value) => {
                    sheet.write_with_format(row, col, value, &formats.date)?;
                }
                Cell::Hours(value) => {
                    sheet.write_with_format(row, col, hours(value), &formats.hours)?;
                }
                Cell::Blank => {}
            }
        }
    }
    Ok(())
}

fn render_workbook(datasets: &ReportDatasets) -> Result<Vec<u8>> {
    let formats = WorkbookFormats::new();
    let mut workbook = Workbook::new();
    for plan in workbook_plan(datasets) {
        write_sheet(&mut workbook, &plan, &formats)?;
    }
    let bytes = workbook.save_to_buffer()?;
    debug!(bytes = bytes.len(), "workbook rendered");
    Ok(bytes)
}

fn render_snapshots(datasets: &ReportDatasets) -> Result<Vec<(&'static str, Vec<u8>)>> {
    Ok(vec![
        ("summary", parquet_bytes(summary_batch(datasets)?, "summary")?),
        ("processed_data", parquet_bytes(processed_batch(datasets)?, "processed_data")?),
        ("raw_services", parquet_bytes(raw_services_batch(datasets)?, "raw_services")?),
        ("raw_entries", parquet_bytes(raw_entries_batch(datasets)?, "raw_entries")?),
        (
            "eha_services_chart",
            parquet_bytes(chart_batch(datasets.eha_chart())?, "eha_services_chart")?,
        ),
        (
            "services_chart",
            parquet_bytes(chart_batch(datasets.standard_chart())?, "services_chart")?,
        ),
    ])
}

fn parquet_bytes(batch: RecordBatch, name: &str) -> Result<Vec<u8>> {
    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), None)
        .with_context(|| format!("opening parquet writer for {name}"))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {name}"))?;
    writer
        .into_inner()
        .with_context(|| format!("closing parquet writer for {name}"))
}

fn date_strings<'a>(dates: impl Iterator<Item = Option<&'a NaiveDate>>) -> StringArray {
    StringArray::from(dates.map(|d| d.map(|d| d.to_string())).collect::<Vec<_>>())
}

fn hour_values(values: impl Iterator<Item = Option<Decimal>>) -> Float64Array {
    Float64Array::from(values.map(|v| v.map(hours)).collect::<Vec<_>>())
}

fn summary_batch(datasets: &ReportDatasets) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("staff_user", DataType::Utf8, false),
        ArrowField::new("total_hours", DataType::Float64, false),
    ]));
    let users = StringArray::from(
        datasets
            .summary
            .iter()
            .map(|row| row.staff_user.as_str())
            .collect::<Vec<_>>(),
    );
    let totals = Float64Array::from(
        datasets
            .summary
            .iter()
            .map(|row| hours(row.total_hours))
            .collect::<Vec<_>>(),
    );
    let columns: Vec<ArrayRef> = vec![Arc::new(users), Arc::new(totals)];
    RecordBatch::try_new(schema, columns).context("building summary record batch")
}

fn processed_batch(datasets: &ReportDatasets) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("client_id", DataType::Utf8, false),
        ArrowField::new("service_date", DataType::Utf8, false),
        ArrowField::new("staff_user", DataType::Utf8, true),
        ArrowField::new("service_code", DataType::Utf8, false),
        ArrowField::new("inclusion_rule", DataType::Utf8, false),
        ArrowField::new("time_value", DataType::Float64, true),
    ]));
    let records = &datasets.processed;
    let client_ids = StringArray::from(
        records
            .iter()
            .map(|r| r.record.client_id.as_str())
            .collect::<Vec<_>>(),
    );
    let service_dates = date_strings(records.iter().map(|r| Some(&r.record.service_date)));
    let staff_users = StringArray::from(
        records
            .iter()
            .map(|r| r.record.staff_user.as_deref())
            .collect::<Vec<_>>(),
    );
    let codes = StringArray::from(
        records
            .iter()
            .map(|r| r.record.service_code.as_str())
            .collect::<Vec<_>>(),
    );
    let rules = StringArray::from(
        records
            .iter()
            .map(|r| r.record.rule.label())
            .collect::<Vec<_>>(),
    );
    let time_values = hour_values(records.iter().map(|r| r.time_value));

    let columns: Vec<ArrayRef> = vec![
        Arc::new(client_ids),
        Arc::new(service_dates),
        Arc::new(staff_users),
        Arc::new(codes),
        Arc::new(rules),
        Arc::new(time_values),
    ];
    RecordBatch::try_new(schema, columns).context("building processed data record batch")
}

fn raw_services_batch(datasets: &ReportDatasets) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("client_id", DataType::Utf8, false),
        ArrowField::new("service_date", DataType::Utf8, true),
        ArrowField::new("staff_user", DataType::Utf8, true),
        ArrowField::new("service_code", DataType::Utf8, false),
    ]));
    let services = datasets.raw_services();
    let client_ids = StringArray::from(
        services
            .iter()
            .map(|s| s.client_id.as_str())
            .collect::<Vec<_>>(),
    );
    let service_dates = date_strings(services.iter().map(|s| s.service_date.as_ref()));
    let staff_users = StringArray::from(
        services
            .iter()
            .map(|s| s.staff_user_raw.as_deref())
            .collect::<Vec<_>>(),
    );
    let codes = StringArray::from(
        services
            .iter()
            .map(|s| s.service_code.as_str())
            .collect::<Vec<_>>(),
    );
    let columns: Vec<ArrayRef> = vec![
        Arc::new(client_ids),
        Arc::new(service_dates),
        Arc::new(staff_users),
        Arc::new(codes),
    ];
    RecordBatch::try_new(schema, columns).context("building raw services record batch")
}

fn raw_entries_batch(datasets: &ReportDatasets) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("client_id", DataType::Utf8, false),
        ArrowField::new("entry_date", DataType::Utf8, true),
    ]));
    let entries = datasets.raw_entries();
    let client_ids = StringArray::from(
        entries
            .iter()
            .map(|e| e.client_id.as_str())
            .collect::<Vec<_>>(),
    );
    let entry_dates = date_strings(entries.iter().map(|e| e.entry_date.as_ref()));
    let columns: Vec<ArrayRef> = vec![Arc::new(client_ids), Arc::new(entry_dates)];
    RecordBatch::try_new(schema, columns).context("building raw entries record batch")
}

fn chart_batch(rows: &[ServiceCodeRate]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("service_code", DataType::Utf8, false),
        ArrowField::new("time_value", DataType::Float64, true),
    ]));
    let codes = StringArray::from(
        rows.iter()
            .map(|r| r.service_code.as_str())
            .collect::<Vec<_>>(),
    );
    let time_values = hour_values(rows.iter().map(|r| r.time_value));
    let columns: Vec<ArrayRef> = vec![Arc::new(codes), Arc::new(time_values)];
    RecordBatch::try_new(schema, columns).context("building service chart record batch")
}

fn render_brief(record: &RunRecord, datasets: &ReportDatasets) -> String {
    let stats = &record.stats;
    let mut lines = vec![
        "# Staff Hours Report".to_string(),
        String::new(),
        format!("- run id: `{}`", record.run_id),
        format!(
            "- period: {} to {} (end exclusive)",
            record.period_start, record.period_end
        ),
        format!(
            "- service chart: {} (`{}`)",
            record.chart,
            record.chart.source_sheet()
        ),
        format!("- duplicate entries: {}", record.duplicate_entries),
        format!(
            "- services counted: {} of {}",
            stats.filter.admitted(),
            stats.services
        ),
        format!("- total hours: {}", record.total_hours.normalize()),
        String::new(),
        "## Hours by Staff".to_string(),
        String::new(),
        "| Staff | Hours |".to_string(),
        "| --- | ---: |".to_string(),
    ];
    for row in &datasets.summary {
        lines.push(format!(
            "| `{}` | {} |",
            row.staff_user,
            row.total_hours.normalize()
        ));
    }

    lines.push(String::new());
    lines.push("## Filter".to_string());
    lines.push(String::new());
    lines.push(format!("- already enrolled: {}", stats.filter.already_enrolled));
    lines.push(format!("- newly enrolled: {}", stats.filter.newly_enrolled));
    lines.push(format!("- outside window: {}", stats.filter.outside_window));
    lines.push(format!("- client without entry: {}", stats.filter.unknown_client));
    lines.push(format!(
        "- missing entry date: {}",
        stats.filter.missing_entry_date
    ));
    lines.push(format!(
        "- missing service date: {}",
        stats.filter.missing_service_date
    ));
    lines.push(format!(
        "- service codes without time value match: {}",
        stats.join.unmatched
    ));
    if stats.filter.beyond_period_end > 0 {
        lines.push(format!(
            "- counted services dated on or after the period end: {}",
            stats.filter.beyond_period_end
        ));
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Markdown listing of the most recent report directories, newest first.
pub fn report_history_markdown(output_dir: &Path, runs: usize) -> Result<String> {
    let store = ArtifactStore::new(output_dir);
    let mut records = Vec::new();
    for dir in store.list_bundles()? {
        let run_path = dir.join(RUN_RECORD_FILE);
        if !run_path.exists() {
            warn!(dir = %dir.display(), "skipping directory without run record");
            continue;
        }
        let text = std::fs::read_to_string(&run_path)
            .with_context(|| format!("reading {}", run_path.display()))?;
        let record: RunRecord = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", run_path.display()))?;
        records.push((record, dir));
    }
    records.sort_by(|a, b| b.0.finished_at.cmp(&a.0.finished_at));

    let mut lines = vec!["# Staff Hours Report History".to_string(), String::new()];
    for (record, dir) in records.into_iter().take(runs) {
        lines.push(format!("## Run `{}`", record.run_id));
        lines.push(format!(
            "- period: {} to {}",
            record.period_start, record.period_end
        ));
        lines.push(format!("- chart: {}", record.chart));
        lines.push(format!("- finished: {}", record.finished_at.to_rfc3339()));
        lines.push(format!("- staff users: {}", record.stats.staff_users));
        lines.push(format!("- total hours: {}", record.total_hours.normalize()));
        lines.push(format!("- workbook: `{}`", dir.join(WORKBOOK_FILE).display()));
        let manifest = dir.join(MANIFEST_FILE);
        if manifest.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
