//! Period filter: decides which service records count toward a reporting period.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use staffhours_core::{
    months_before, normalize_staff_user, ClientId, ConfigurationError, DataShapeError, Entry,
    FilteredRecord, InclusionRule, ReportingPeriod, ServiceRecord, NEW_ENROLLMENT_LOOKBACK_MONTHS,
};
use tracing::{debug, warn};

/// What to do when a client has more than one entry row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicateEntryPolicy {
    #[default]
    Reject,
    KeepEarliest,
    KeepLatest,
}

impl DuplicateEntryPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reject => "reject",
            Self::KeepEarliest => "keep-earliest",
            Self::KeepLatest => "keep-latest",
        }
    }
}

impl fmt::Display for DuplicateEntryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DuplicateEntryPolicy {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "keep-earliest" | "earliest" => Ok(Self::KeepEarliest),
            "keep-latest" | "latest" => Ok(Self::KeepLatest),
            _ => Err(ConfigurationError::InvalidSetting {
                name: "duplicate entry policy",
                value: s.to_string(),
            }),
        }
    }
}

/// client_id -> entry_date, at most one date per client.
#[derive(Debug, Clone, Default)]
pub struct EntryIndex {
    dates: HashMap<ClientId, Option<NaiveDate>>,
}

impl EntryIndex {
    pub fn build(entries: &[Entry], policy: DuplicateEntryPolicy) -> Result<Self, DataShapeError> {
        let mut grouped: HashMap<&str, Vec<Option<NaiveDate>>> = HashMap::new();
        for entry in entries.iter().filter(|e| !e.client_id.is_empty()) {
            grouped
                .entry(entry.client_id.as_str())
                .or_default()
                .push(entry.entry_date);
        }

        let mut dates = HashMap::with_capacity(grouped.len());
        // Walk input order so the reported duplicate is the first one in the sheet.
        for entry in entries {
            let Some(rows) = grouped.remove(entry.client_id.as_str()) else {
                continue;
            };
            let date = if rows.len() == 1 {
                rows[0]
            } else {
                match policy {
                    DuplicateEntryPolicy::Reject => {
                        return Err(DataShapeError::DuplicateEntry {
                            client_id: entry.client_id.clone(),
                            rows: rows.len(),
                        });
                    }
                    DuplicateEntryPolicy::KeepEarliest => {
                        warn!(client_id = %entry.client_id, rows = rows.len(), "duplicate entry rows, keeping earliest date");
                        rows.iter().flatten().min().copied()
                    }
                    DuplicateEntryPolicy::KeepLatest => {
                        warn!(client_id = %entry.client_id, rows = rows.len(), "duplicate entry rows, keeping latest date");
                        rows.iter().flatten().max().copied()
                    }
                }
            };
            dates.insert(entry.client_id.clone(), date);
        }

        Ok(Self { dates })
    }

    pub fn entry_date(&self, client_id: &str) -> Option<NaiveDate> {
        self.dates.get(client_id).copied().flatten()
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.dates.contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterStats {
    pub considered: usize,
    pub already_enrolled: usize,
    pub newly_enrolled: usize,
    pub outside_window: usize,
    pub unknown_client: usize,
    pub missing_entry_date: usize,
    pub missing_service_date: usize,
    /// Already-enrolled admissions dated on or after the period end.
    pub beyond_period_end: usize,
}

impl FilterStats {
    pub fn admitted(&self) -> usize {
        self.already_enrolled + self.newly_enrolled
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterOutcome {
    pub records: Vec<FilteredRecord>,
    pub stats: FilterStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodFilter {
    period: ReportingPeriod,
    bound_rule_a_by_period_end: bool,
}

impl PeriodFilter {
    pub fn new(period: ReportingPeriod) -> Self {
        Self {
            period,
            bound_rule_a_by_period_end: false,
        }
    }

    /// Also require already-enrolled services to fall before the period end.
    pub fn bounded_by_period_end(mut self, bounded: bool) -> Self {
        self.bound_rule_a_by_period_end = bounded;
        self
    }

    pub fn period(&self) -> ReportingPeriod {
        self.period
    }

    /// The two entry-date conditions partition all dates, so at most one rule applies.
    pub fn classify(&self, entry_date: NaiveDate, service_date: NaiveDate) -> Option<InclusionRule> {
        let start = self.period.start();
        if entry_date < start {
            let after_start = service_date >= start;
            let before_end = !self.bound_rule_a_by_period_end || service_date < self.period.end();
            (after_start && before_end).then_some(InclusionRule::AlreadyEnrolled)
        } else {
            let lookback_floor = months_before(entry_date, NEW_ENROLLMENT_LOOKBACK_MONTHS)
                .unwrap_or(NaiveDate::MIN);
            (service_date >= lookback_floor).then_some(InclusionRule::NewlyEnrolled)
        }
    }

    /// Single pass over services in input order, consulting the entry index per row.
    pub fn apply(&self, index: &EntryIndex, services: &[ServiceRecord]) -> FilterOutcome {
        let mut stats = FilterStats::default();
        let mut records = Vec::new();

        for service in services {
            stats.considered += 1;
            let Some(service_date) = service.service_date else {
                stats.missing_service_date += 1;
                continue;
            };
            let Some(entry_date) = index.entry_date(&service.client_id) else {
                if index.contains(&service.client_id) {
                    stats.missing_entry_date += 1;
                } else {
                    stats.unknown_client += 1;
                }
                continue;
            };
            let Some(rule) = self.classify(entry_date, service_date) else {
                stats.outside_window += 1;
                continue;
            };

            match rule {
                InclusionRule::AlreadyEnrolled => {
                    stats.already_enrolled += 1;
                    if service_date >= self.period.end() {
                        stats.beyond_period_end += 1;
                    }
                }
                InclusionRule::NewlyEnrolled => stats.newly_enrolled += 1,
            }

            records.push(FilteredRecord {
                client_id: service.client_id.clone(),
                service_date,
                staff_user: service.staff_user_raw.as_deref().map(normalize_staff_user),
                service_code: service.service_code.clone(),
                rule,
            });
        }

        debug!(
            considered = stats.considered,
            admitted = stats.admitted(),
            outside_window = stats.outside_window,
            unknown_client = stats.unknown_client,
            missing_entry_date = stats.missing_entry_date,
            missing_service_date = stats.missing_service_date,
            "period filter applied"
        );
        if stats.beyond_period_end > 0 {
            warn!(
                count = stats.beyond_period_end,
                period_end = %self.period.end(),
                "already-enrolled services dated after the period end were counted; enable the period-end bound to exclude them"
            );
        }

        FilterOutcome { records, stats }
    }
}
