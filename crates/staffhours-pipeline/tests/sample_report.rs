use std::fs;
use std::path::{Path, PathBuf};

use rust_decimal_macros::dec;
use staffhours_core::{ConfigurationError, DataShapeError, RateChartKind, SummaryRow};
use staffhours_pipeline::{
    preview_report, report_history_markdown, run_report, DuplicateEntryPolicy, ReportConfig,
    ReportOptions, RunRecord, SnapshotManifest,
};
use staffhours_storage::ArtifactStore;

fn fixtures() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/sample")
}

fn config(output_dir: &Path) -> ReportConfig {
    ReportConfig {
        report_dir: fixtures().join("report"),
        chart_dir: fixtures().join("chart"),
        output_dir: output_dir.to_path_buf(),
        layout_path: None,
        period_start: Some("2018-04-01".into()),
        period_end: Some("2018-05-01".into()),
        options: ReportOptions::default(),
    }
}

fn row(staff_user: &str, total_hours: rust_decimal::Decimal) -> SummaryRow {
    SummaryRow {
        staff_user: staff_user.into(),
        total_hours,
    }
}

#[test]
fn standard_chart_run_writes_a_complete_bundle() {
    let out = tempfile::tempdir().unwrap();
    let outcome = run_report(&config(out.path())).unwrap();

    let record = &outcome.record;
    assert_eq!(record.chart, RateChartKind::Standard);
    assert_eq!(record.total_hours, dec!(4.5));
    assert_eq!(record.stats.services, 9);
    assert_eq!(record.stats.filter.already_enrolled, 3);
    assert_eq!(record.stats.filter.newly_enrolled, 2);
    assert_eq!(record.stats.filter.outside_window, 2);
    assert_eq!(record.stats.filter.unknown_client, 1);
    assert_eq!(record.stats.filter.missing_entry_date, 1);
    assert_eq!(record.stats.join.unmatched, 1);
    assert_eq!(record.stats.staff_users, 3);

    let dir = &outcome.bundle_dir;
    assert!(dir
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("2018-04-01_2018-05-01_standard_"));
    for file in ["staff_hours.xlsx", "run.json", "brief.md", "snapshots/manifest.json"] {
        assert!(dir.join(file).exists(), "missing {file}");
    }

    let manifest: SnapshotManifest =
        serde_json::from_str(&fs::read_to_string(dir.join("snapshots/manifest.json")).unwrap())
            .unwrap();
    assert_eq!(manifest.files.len(), 6);
    for file in &manifest.files {
        let bytes = fs::read(dir.join(&file.path)).unwrap();
        assert_eq!(file.sha256, ArtifactStore::sha256_hex(&bytes));
        assert_eq!(file.bytes, bytes.len() as u64);
    }

    let stored: RunRecord =
        serde_json::from_str(&fs::read_to_string(dir.join("run.json")).unwrap()).unwrap();
    assert_eq!(&stored, record);

    let brief = fs::read_to_string(dir.join("brief.md")).unwrap();
    assert!(brief.contains("| `Ann Lee ` | 0 |"));
    assert!(brief.contains("| `Jane Doe ` | 2.5 |"));
    assert!(brief.contains("| `John Roe ` | 2 |"));
}

#[test]
fn preview_matches_the_expected_summary_and_writes_nothing() {
    let out = tempfile::tempdir().unwrap();
    let datasets = preview_report(&config(out.path())).unwrap();
    assert_eq!(
        datasets.summary,
        vec![
            row("Ann Lee ", dec!(0)),
            row("Jane Doe ", dec!(2.5)),
            row("John Roe ", dec!(2.0)),
        ]
    );
    // Admitted record without a staff user stays in the processed data.
    assert_eq!(datasets.processed.len(), 5);
    assert!(datasets.processed.iter().any(|r| r.record.staff_user.is_none()));
    // Raw entries keep the row that has no client id.
    assert_eq!(datasets.raw_entries().len(), 5);
    assert_eq!(datasets.stats.entries, 5);
    assert_eq!(fs::read_dir(out.path()).unwrap().count(), 0);
}

#[test]
fn eha_chart_prices_the_same_records() {
    let out = tempfile::tempdir().unwrap();
    let mut config = config(out.path());
    config.options.chart = RateChartKind::Eha;
    let datasets = preview_report(&config).unwrap();
    assert_eq!(
        datasets.summary,
        vec![
            row("Ann Lee ", dec!(0)),
            row("Jane Doe ", dec!(0.5)),
            row("John Roe ", dec!(0.5)),
        ]
    );
    assert_eq!(datasets.total_hours(), dec!(1.0));
}

#[test]
fn bounding_rule_a_changes_nothing_inside_the_period() {
    let out = tempfile::tempdir().unwrap();
    let mut config = config(out.path());
    config.options.bound_rule_a_by_period_end = true;
    config.options.duplicate_entries = DuplicateEntryPolicy::KeepLatest;
    let datasets = preview_report(&config).unwrap();
    assert_eq!(datasets.total_hours(), dec!(4.5));
    assert_eq!(datasets.stats.filter.beyond_period_end, 0);
}

#[test]
fn invalid_period_is_a_configuration_error() {
    let out = tempfile::tempdir().unwrap();
    let mut config = config(out.path());
    config.period_start = Some("2018-05-01".into());
    let err = run_report(&config).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ConfigurationError>(),
        Some(ConfigurationError::InvalidPeriod { .. })
    ));
    assert!(ArtifactStore::new(out.path()).list_bundles().unwrap().is_empty());
}

#[test]
fn malformed_input_leaves_no_report_directory() {
    let inputs = tempfile::tempdir().unwrap();
    let report_dir = inputs.path().join("report");
    fs::create_dir_all(&report_dir).unwrap();
    fs::copy(
        fixtures().join("report/Entry Data.csv"),
        report_dir.join("Entry Data.csv"),
    )
    .unwrap();
    fs::write(
        report_dir.join("Service Data.csv"),
        "Client Uid,Service Provide Start Date,Service User Creating,Provider Specific Code\n\
         C1,2018-04-15,Jane Doe (1),X1\n\
         C1,not a date,Jane Doe (1),X1\n",
    )
    .unwrap();

    let out = tempfile::tempdir().unwrap();
    let mut config = config(out.path());
    config.report_dir = report_dir;
    let err = run_report(&config).unwrap_err();
    let shape = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<DataShapeError>())
        .cloned();
    assert!(matches!(shape, Some(DataShapeError::InvalidCell { row: 3, .. })));
    assert_eq!(fs::read_dir(out.path()).unwrap().count(), 0);
}

#[test]
fn history_lists_runs_newest_first() {
    let out = tempfile::tempdir().unwrap();
    let first = run_report(&config(out.path())).unwrap();
    let mut eha = config(out.path());
    eha.options.chart = RateChartKind::Eha;
    let second = run_report(&eha).unwrap();

    let history = report_history_markdown(out.path(), 5).unwrap();
    let first_at = history.find(&first.record.run_id.to_string()).unwrap();
    let second_at = history.find(&second.record.run_id.to_string()).unwrap();
    assert!(second_at < first_at);
    assert!(history.contains("- chart: eha"));
}
