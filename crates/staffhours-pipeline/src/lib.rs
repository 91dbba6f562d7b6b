//! Staff hours pipeline: period filter, chart join, pivot, and report runs.

pub mod export;
pub mod filter;
pub mod pivot;
pub mod rates;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use staffhours_adapters::{
    load_chart_sheets, load_report_sheets, ColumnLayout, CsvSheetDirectory, ReportSheets,
};
use staffhours_core::{
    ConfigurationError, Entry, RateChartKind, RatedRecord, ReportingPeriod, ServiceCodeRate,
    ServiceRecord, StaffHoursError, SummaryRow,
};
use tracing::{info, info_span};
use uuid::Uuid;

pub use export::{report_history_markdown, ReportWriter, RunRecord, SnapshotManifest};
pub use filter::{DuplicateEntryPolicy, EntryIndex, FilterOutcome, FilterStats, PeriodFilter};
pub use pivot::{grand_total, summarize};
pub use rates::{attach_time_values, JoinStats, RateCharts, RateTable};

pub const CRATE_NAME: &str = "staffhours-pipeline";

/// Settings fixed for the lifetime of a [`StaffHoursReport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportOptions {
    pub chart: RateChartKind,
    pub duplicate_entries: DuplicateEntryPolicy,
    pub bound_rule_a_by_period_end: bool,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            chart: RateChartKind::Standard,
            duplicate_entries: DuplicateEntryPolicy::Reject,
            bound_rule_a_by_period_end: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReportConfig {
    pub report_dir: PathBuf,
    pub chart_dir: PathBuf,
    pub output_dir: PathBuf,
    pub layout_path: Option<PathBuf>,
    pub period_start: Option<String>,
    pub period_end: Option<String>,
    pub options: ReportOptions,
}

impl ReportConfig {
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset keys take defaults; set but unreadable keys are errors.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigurationError> {
        let flag = |key: &'static str| {
            lookup(key)
                .map(|value| parse_flag(key, &value))
                .transpose()
                .map(Option::unwrap_or_default)
        };
        let duplicate_entries = lookup("STAFFHOURS_DUPLICATE_ENTRIES")
            .map(|value| value.parse::<DuplicateEntryPolicy>())
            .transpose()?
            .unwrap_or_default();
        Ok(Self {
            report_dir: lookup("STAFFHOURS_REPORT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./report")),
            chart_dir: lookup("STAFFHOURS_CHART_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./chart")),
            output_dir: lookup("STAFFHOURS_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./reports")),
            layout_path: lookup("STAFFHOURS_LAYOUT").map(PathBuf::from),
            period_start: lookup("STAFFHOURS_PERIOD_START"),
            period_end: lookup("STAFFHOURS_PERIOD_END"),
            options: ReportOptions {
                chart: RateChartKind::from_eha_flag(flag("STAFFHOURS_EHA")?),
                duplicate_entries,
                bound_rule_a_by_period_end: flag("STAFFHOURS_BOUND_RULE_A")?,
            },
        })
    }

    pub fn period(&self) -> Result<ReportingPeriod, ConfigurationError> {
        let start = self
            .period_start
            .as_deref()
            .ok_or(ConfigurationError::MissingSetting("reporting period start"))?;
        let end = self
            .period_end
            .as_deref()
            .ok_or(ConfigurationError::MissingSetting("reporting period end"))?;
        ReportingPeriod::parse(start, end)
    }

    pub fn layout(&self) -> Result<ColumnLayout> {
        match &self.layout_path {
            Some(path) => ColumnLayout::from_yaml_path(path),
            None => Ok(ColumnLayout::default()),
        }
    }
}

/// Accepts `1`/`0`/`true`/`false` in any case.
pub fn parse_flag(name: &'static str, value: &str) -> Result<bool, ConfigurationError> {
    let value = value.trim();
    if value == "1" || value.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if value == "0" || value.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err(ConfigurationError::InvalidSetting {
            name,
            value: value.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub entries: usize,
    pub services: usize,
    pub filter: FilterStats,
    pub join: JoinStats,
    pub staff_users: usize,
}

/// Everything a run hands to the report writer. Inputs are shared, not copied.
#[derive(Debug, Clone)]
pub struct ReportDatasets {
    pub period: ReportingPeriod,
    pub chart: RateChartKind,
    pub summary: Vec<SummaryRow>,
    pub processed: Vec<RatedRecord>,
    pub stats: RunStats,
    total_hours: Decimal,
    sheets: Arc<ReportSheets>,
    charts: Arc<RateCharts>,
}

impl ReportDatasets {
    pub fn raw_entries(&self) -> &[Entry] {
        &self.sheets.entries
    }

    pub fn raw_services(&self) -> &[ServiceRecord] {
        &self.sheets.services
    }

    pub fn standard_chart(&self) -> &[ServiceCodeRate] {
        self.charts.standard().rows()
    }

    pub fn eha_chart(&self) -> &[ServiceCodeRate] {
        self.charts.eha().rows()
    }

    pub fn total_hours(&self) -> Decimal {
        self.total_hours
    }
}

/// One activity report priced against one service chart.
#[derive(Debug, Clone)]
pub struct StaffHoursReport {
    options: ReportOptions,
    charts: Arc<RateCharts>,
    sheets: Arc<ReportSheets>,
    entries: EntryIndex,
}

impl StaffHoursReport {
    pub fn new(
        charts: Arc<RateCharts>,
        sheets: ReportSheets,
        options: ReportOptions,
    ) -> Result<Self, StaffHoursError> {
        let entries = EntryIndex::build(&sheets.entries, options.duplicate_entries)?;
        Ok(Self {
            options,
            charts,
            sheets: Arc::new(sheets),
            entries,
        })
    }

    pub fn options(&self) -> ReportOptions {
        self.options
    }

    pub fn run(&self, period: ReportingPeriod) -> Result<ReportDatasets, StaffHoursError> {
        let filter = PeriodFilter::new(period)
            .bounded_by_period_end(self.options.bound_rule_a_by_period_end);
        let FilterOutcome { records, stats: filter_stats } =
            filter.apply(&self.entries, &self.sheets.services);

        let table = self.charts.table(self.options.chart);
        let (processed, join_stats) = attach_time_values(records, table);
        let summary = summarize(&processed)?;
        let total_hours = grand_total(&summary)?;

        let stats = RunStats {
            entries: self.sheets.entries.len(),
            services: self.sheets.services.len(),
            filter: filter_stats,
            join: join_stats,
            staff_users: summary.len(),
        };
        info!(
            period = %period,
            chart = %self.options.chart,
            counted = processed.len(),
            staff_users = summary.len(),
            "staff hours computed"
        );

        Ok(ReportDatasets {
            period,
            chart: self.options.chart,
            summary,
            processed,
            stats,
            total_hours,
            sheets: Arc::clone(&self.sheets),
            charts: Arc::clone(&self.charts),
        })
    }

    pub fn run_for_dates(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<ReportDatasets, StaffHoursError> {
        let period = ReportingPeriod::new(start, end)?;
        self.run(period)
    }
}

pub fn load_charts(config: &ReportConfig, layout: &ColumnLayout) -> Result<Arc<RateCharts>> {
    let sheets = load_chart_sheets(&CsvSheetDirectory::new(&config.chart_dir), layout)?;
    let charts = RateCharts::from_sheets(sheets)
        .with_context(|| format!("indexing service charts from {}", config.chart_dir.display()))?;
    Ok(Arc::new(charts))
}

pub fn build_report(config: &ReportConfig) -> Result<StaffHoursReport> {
    let layout = config.layout()?;
    let charts = load_charts(config, &layout)?;
    let sheets = load_report_sheets(&CsvSheetDirectory::new(&config.report_dir), &layout)?;
    let report = StaffHoursReport::new(charts, sheets, config.options)?;
    Ok(report)
}

/// Computes the report without writing anything.
pub fn preview_report(config: &ReportConfig) -> Result<ReportDatasets> {
    let period = config.period()?;
    let report = build_report(config)?;
    Ok(report.run(period)?)
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub record: RunRecord,
    pub bundle_dir: PathBuf,
}

pub fn run_report(config: &ReportConfig) -> Result<RunOutcome> {
    let started_at = Utc::now();
    let run_id = Uuid::new_v4();
    let span = info_span!("staff_hours_run", %run_id);
    let _guard = span.enter();

    let period = config.period()?;
    let report = build_report(config)?;
    let datasets = report.run(period)?;
    let finished_at = Utc::now();

    let record = RunRecord::new(run_id, started_at, finished_at, &config.options, &datasets);
    let bundle_dir = ReportWriter::new(&config.output_dir).write(&record, &datasets)?;
    info!(bundle = %bundle_dir.display(), total_hours = %record.total_hours, "report written");
    Ok(RunOutcome { record, bundle_dir })
}

pub fn run_report_from_env() -> Result<RunOutcome> {
    run_report(&ReportConfig::from_env()?)
}
