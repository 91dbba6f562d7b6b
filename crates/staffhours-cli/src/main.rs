use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand};
use staffhours_core::RateChartKind;
use staffhours_pipeline::{
    preview_report, report_history_markdown, run_report, DuplicateEntryPolicy, ReportConfig,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "staffhours")]
#[command(about = "Staff hours report from activity and service chart exports")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Compute the report and write a report directory.
    Run(InputArgs),
    /// Compute the report and print hours per staff user; writes nothing.
    Preview(InputArgs),
    /// List previous runs as Markdown.
    History {
        #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
        runs: u64,
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

/// Flags left unset fall back to the STAFFHOURS_* environment.
#[derive(Debug, Args)]
struct InputArgs {
    /// Directory holding "Entry Data.csv" and "Service Data.csv".
    #[arg(long)]
    report: Option<PathBuf>,
    /// Directory holding "Reporting Use.csv" and "EHA & EHA2 Reporting.csv".
    #[arg(long)]
    chart: Option<PathBuf>,
    /// Inclusive period start (YYYY-MM-DD).
    #[arg(long)]
    start: Option<String>,
    /// Exclusive period end (YYYY-MM-DD).
    #[arg(long)]
    end: Option<String>,
    /// Price services with the EHA chart (`--eha false` overrides the environment).
    #[arg(long, num_args = 0..=1, default_missing_value = "true", action = ArgAction::Set)]
    eha: Option<bool>,
    #[arg(long)]
    output: Option<PathBuf>,
    /// YAML file overriding input column names.
    #[arg(long)]
    layout: Option<PathBuf>,
    #[arg(long)]
    duplicate_entries: Option<DuplicateEntryPolicy>,
    /// Drop already-enrolled services dated on or after the period end.
    #[arg(long, num_args = 0..=1, default_missing_value = "true", action = ArgAction::Set)]
    bound_rule_a: Option<bool>,
}

impl InputArgs {
    fn apply_to(self, mut config: ReportConfig) -> ReportConfig {
        if let Some(report) = self.report {
            config.report_dir = report;
        }
        if let Some(chart) = self.chart {
            config.chart_dir = chart;
        }
        if let Some(output) = self.output {
            config.output_dir = output;
        }
        if self.layout.is_some() {
            config.layout_path = self.layout;
        }
        if self.start.is_some() {
            config.period_start = self.start;
        }
        if self.end.is_some() {
            config.period_end = self.end;
        }
        if let Some(eha) = self.eha {
            config.options.chart = RateChartKind::from_eha_flag(eha);
        }
        if let Some(policy) = self.duplicate_entries {
            config.options.duplicate_entries = policy;
        }
        if let Some(bound) = self.bound_rule_a {
            config.options.bound_rule_a_by_period_end = bound;
        }
        config
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    debug!(?cli, "parsed command line");

    match cli.command {
        Commands::Run(args) => {
            let outcome = run_report(&args.apply_to(ReportConfig::from_env()?))?;
            println!(
                "report complete: run_id={} period={}..{} chart={} staff={} hours={} dir={}",
                outcome.record.run_id,
                outcome.record.period_start,
                outcome.record.period_end,
                outcome.record.chart,
                outcome.record.stats.staff_users,
                outcome.record.total_hours.normalize(),
                outcome.bundle_dir.display()
            );
        }
        Commands::Preview(args) => {
            let datasets = preview_report(&args.apply_to(ReportConfig::from_env()?))?;
            println!("period {} chart {}", datasets.period, datasets.chart);
            let width = datasets
                .summary
                .iter()
                .map(|row| row.staff_user.chars().count())
                .max()
                .unwrap_or(0)
                .max("Staff".len());
            println!("{:<width$}  Hours", "Staff");
            for row in &datasets.summary {
                println!("{:<width$}  {}", row.staff_user, row.total_hours.normalize());
            }
            println!("{:<width$}  {}", "Total", datasets.total_hours().normalize());
        }
        Commands::History { runs, output } => {
            let output = match output {
                Some(output) => output,
                None => ReportConfig::from_env()?.output_dir,
            };
            println!("{}", report_history_markdown(&output, runs as usize)?);
        }
    }

    Ok(())
}
