//! Service chart lookup and the left join that prices filtered records.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use staffhours_adapters::ChartSheets;
use staffhours_core::{DataShapeError, FilteredRecord, RateChartKind, RatedRecord, ServiceCodeRate};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RateTable {
    kind: RateChartKind,
    by_code: HashMap<String, Option<Decimal>>,
    rows: Vec<ServiceCodeRate>,
}

impl RateTable {
    /// Rejects a code listed twice with different time values; exact repeats collapse.
    pub fn new(kind: RateChartKind, rows: Vec<ServiceCodeRate>) -> Result<Self, DataShapeError> {
        let mut by_code: HashMap<String, Option<Decimal>> = HashMap::with_capacity(rows.len());
        for rate in &rows {
            match by_code.get(&rate.service_code) {
                Some(existing) if *existing != rate.time_value => {
                    return Err(DataShapeError::ConflictingRate {
                        table: kind.source_sheet().to_string(),
                        service_code: rate.service_code.clone(),
                        first: describe_time_value(*existing),
                        second: describe_time_value(rate.time_value),
                    });
                }
                Some(_) => {
                    debug!(chart = %kind, service_code = %rate.service_code, "collapsing repeated chart row");
                }
                None => {
                    by_code.insert(rate.service_code.clone(), rate.time_value);
                }
            }
        }
        Ok(Self { kind, by_code, rows })
    }

    pub fn kind(&self) -> RateChartKind {
        self.kind
    }

    pub fn rows(&self) -> &[ServiceCodeRate] {
        &self.rows
    }

    pub fn contains(&self, service_code: &str) -> bool {
        self.by_code.contains_key(service_code)
    }

    pub fn time_value(&self, service_code: &str) -> Option<Decimal> {
        self.by_code.get(service_code).copied().flatten()
    }
}

fn describe_time_value(value: Option<Decimal>) -> String {
    value.map_or_else(|| "blank".to_string(), |v| v.normalize().to_string())
}

/// Both service charts, loaded once and shareable across runs.
#[derive(Debug, Clone)]
pub struct RateCharts {
    standard: RateTable,
    eha: RateTable,
}

impl RateCharts {
    pub fn new(
        standard: Vec<ServiceCodeRate>,
        eha: Vec<ServiceCodeRate>,
    ) -> Result<Self, DataShapeError> {
        Ok(Self {
            standard: RateTable::new(RateChartKind::Standard, standard)?,
            eha: RateTable::new(RateChartKind::Eha, eha)?,
        })
    }

    pub fn from_sheets(sheets: ChartSheets) -> Result<Self, DataShapeError> {
        Self::new(sheets.standard, sheets.eha)
    }

    pub fn table(&self, kind: RateChartKind) -> &RateTable {
        match kind {
            RateChartKind::Standard => &self.standard,
            RateChartKind::Eha => &self.eha,
        }
    }

    pub fn standard(&self) -> &RateTable {
        &self.standard
    }

    pub fn eha(&self) -> &RateTable {
        &self.eha
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinStats {
    pub matched: usize,
    pub unmatched: usize,
}

/// Left join on service code: every record comes out exactly once.
pub fn attach_time_values(
    records: Vec<FilteredRecord>,
    table: &RateTable,
) -> (Vec<RatedRecord>, JoinStats) {
    let mut stats = JoinStats::default();
    let rated = records
        .into_iter()
        .map(|record| {
            if table.contains(&record.service_code) {
                stats.matched += 1;
            } else {
                stats.unmatched += 1;
            }
            let time_value = table.time_value(&record.service_code);
            RatedRecord { record, time_value }
        })
        .collect::<Vec<_>>();
    debug!(chart = %table.kind(), matched = stats.matched, unmatched = stats.unmatched, "attached time values");
    (rated, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use staffhours_core::InclusionRule;

    fn rate(code: &str, value: Option<Decimal>) -> ServiceCodeRate {
        ServiceCodeRate {
            service_code: code.to_string(),
            time_value: value,
        }
    }

    fn record(code: &str) -> FilteredRecord {
        FilteredRecord {
            client_id: "C1".into(),
            service_date: NaiveDate::from_ymd_opt(2018, 4, 15).unwrap(),
            staff_user: Some("Jane Doe ".into()),
            service_code: code.into(),
            rule: InclusionRule::AlreadyEnrolled,
        }
    }

    #[test]
    fn unmatched_codes_keep_their_row_with_no_time_value() {
        let table = RateTable::new(RateChartKind::Standard, vec![rate("X1", Some(dec!(2.5)))]).unwrap();
        let (rated, stats) = attach_time_values(vec![record("X1"), record("ZZ"), record("X1")], &table);
        assert_eq!(rated.len(), 3);
        assert_eq!(rated[0].time_value, Some(dec!(2.5)));
        assert_eq!(rated[1].time_value, None);
        assert_eq!(rated[1].record.service_code, "ZZ");
        assert_eq!(stats, JoinStats { matched: 2, unmatched: 1 });
    }

    #[test]
    fn chart_selection_picks_among_loaded_tables() {
        let charts = RateCharts::new(
            vec![rate("X1", Some(dec!(1.0)))],
            vec![rate("X1", Some(dec!(0.5)))],
        )
        .unwrap();
        assert_eq!(charts.table(RateChartKind::Standard).time_value("X1"), Some(dec!(1.0)));
        assert_eq!(charts.table(RateChartKind::Eha).time_value("X1"), Some(dec!(0.5)));
        assert_eq!(charts.eha().kind(), RateChartKind::Eha);
    }

    #[test]
    fn conflicting_chart_rows_are_rejected() {
        let err = RateTable::new(
            RateChartKind::Eha,
            vec![rate("X1", Some(dec!(1.50))), rate("X1", Some(dec!(2)))],
        )
        .unwrap_err();
        assert_eq!(
            err,
            DataShapeError::ConflictingRate {
                table: "EHA & EHA2 Reporting".into(),
                service_code: "X1".into(),
                first: "1.5".into(),
                second: "2".into(),
            }
        );
    }

    #[test]
    fn repeated_identical_chart_rows_collapse() {
        let table = RateTable::new(
            RateChartKind::Standard,
            vec![rate("X1", Some(dec!(1.0))), rate("X1", Some(dec!(1.00))), rate("X2", None)],
        )
        .unwrap();
        let (rated, _) = attach_time_values(vec![record("X1")], &table);
        assert_eq!(rated.len(), 1);
        assert!(table.contains("X2"));
        assert_eq!(table.time_value("X2"), None);
        assert_eq!(table.rows().len(), 3);
    }
}
