//! Hours per staff user.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use staffhours_core::{DataShapeError, RatedRecord, SummaryRow};

/// Groups by cleaned staff user and sums present time values.
///
/// Rows come out ordered by staff user. A user whose records all lack a time
/// value still gets a row with a total of zero; records without a staff user
/// are left out.
pub fn summarize(records: &[RatedRecord]) -> Result<Vec<SummaryRow>, DataShapeError> {
    let mut totals: BTreeMap<&str, Decimal> = BTreeMap::new();
    for rated in records {
        let Some(staff_user) = rated.record.staff_user.as_deref() else {
            continue;
        };
        let total = totals.entry(staff_user).or_insert(Decimal::ZERO);
        if let Some(value) = rated.time_value {
            *total = total
                .checked_add(value)
                .ok_or_else(|| DataShapeError::HoursOverflow {
                    group: format!("staff user '{staff_user}'"),
                })?;
        }
    }

    Ok(totals
        .into_iter()
        .map(|(staff_user, total_hours)| SummaryRow {
            staff_user: staff_user.to_string(),
            total_hours,
        })
        .collect())
}

pub fn grand_total(summary: &[SummaryRow]) -> Result<Decimal, DataShapeError> {
    summary.iter().try_fold(Decimal::ZERO, |acc, row| {
        acc.checked_add(row.total_hours)
            .ok_or_else(|| DataShapeError::HoursOverflow {
                group: "the grand total".to_string(),
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use staffhours_core::{FilteredRecord, InclusionRule};

    fn rated(user: Option<&str>, value: Option<Decimal>) -> RatedRecord {
        RatedRecord {
            record: FilteredRecord {
                client_id: "C1".into(),
                service_date: NaiveDate::from_ymd_opt(2018, 4, 2).unwrap(),
                staff_user: user.map(str::to_string),
                service_code: "X1".into(),
                rule: InclusionRule::AlreadyEnrolled,
            },
            time_value: value,
        }
    }

    #[test]
    fn sums_present_values_per_user_in_name_order() {
        let records = vec![
            rated(Some("Zed "), Some(dec!(0.25))),
            rated(Some("Amy "), Some(dec!(1.5))),
            rated(Some("Zed "), None),
            rated(Some("Amy "), Some(dec!(2.25))),
        ];
        let summary = summarize(&records).unwrap();
        assert_eq!(
            summary,
            vec![
                SummaryRow { staff_user: "Amy ".into(), total_hours: dec!(3.75) },
                SummaryRow { staff_user: "Zed ".into(), total_hours: dec!(0.25) },
            ]
        );
        assert_eq!(grand_total(&summary).unwrap(), dec!(4.00));
    }

    #[test]
    fn users_with_only_missing_values_total_zero() {
        let summary = summarize(&[rated(Some("Bo "), None), rated(Some("Bo "), None)]).unwrap();
        assert_eq!(summary, vec![SummaryRow { staff_user: "Bo ".into(), total_hours: Decimal::ZERO }]);
    }

    #[test]
    fn records_without_staff_user_are_left_out() {
        let summary =
            summarize(&[rated(None, Some(dec!(5))), rated(Some("Cy "), Some(dec!(1)))]).unwrap();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].staff_user, "Cy ");
    }

    #[test]
    fn no_records_no_rows() {
        assert!(summarize(&[]).unwrap().is_empty());
        assert_eq!(grand_total(&[]).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn overflowing_user_total_is_an_error() {
        let err = summarize(&[
            rated(Some("Cy "), Some(Decimal::MAX)),
            rated(Some("Cy "), Some(Decimal::MAX)),
        ])
        .unwrap_err();
        assert_eq!(
            err,
            DataShapeError::HoursOverflow {
                group: "staff user 'Cy '".into(),
            }
        );
    }

    #[test]
    fn overflowing_grand_total_is_an_error() {
        let summary = vec![
            SummaryRow { staff_user: "Amy ".into(), total_hours: Decimal::MAX },
            SummaryRow { staff_user: "Zed ".into(), total_hours: Decimal::MAX },
        ];
        assert!(matches!(
            grand_total(&summary),
            Err(DataShapeError::HoursOverflow { .. })
        ));
    }
}
