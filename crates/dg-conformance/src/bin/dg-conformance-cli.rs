#![forbid(unsafe_code)]

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use dg_conformance::{
    PopulationSource, ScenarioConfig, ScenarioReport, run_scenario_with_outcome,
    write_scenario_report,
};
use dg_io::write_aggregate_csv;
use dg_runtime::RuntimeMode;
use dg_simulate::PopulationSynth;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Strict,
    Hardened,
}

impl From<ModeArg> for RuntimeMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Strict => Self::Strict,
            ModeArg::Hardened => Self::Hardened,
        }
    }
}

/// Run baseline, insert, update and delete stages against a trip population
/// and check the incremental aggregate against a full recompute.
#[derive(Parser, Debug)]
#[command(name = "dg-conformance-cli", about = "Incremental group-by conformance run")]
struct Args {
    /// Scenario file (.yaml, .yml or .json). Flags below override it.
    #[arg(long, env = "DG_SCENARIO")]
    config: Option<PathBuf>,

    /// Rows in the synthetic population.
    #[arg(long)]
    rows: Option<usize>,

    #[arg(long)]
    inserts: Option<usize>,

    #[arg(long)]
    updates: Option<usize>,

    #[arg(long)]
    deletes: Option<usize>,

    #[arg(long, env = "DG_SEED")]
    seed: Option<u64>,

    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    #[arg(long)]
    tolerance: Option<f64>,

    /// Worker partitions for full aggregation.
    #[arg(long)]
    partitions: Option<usize>,

    /// Trip CSV to load instead of generating a population.
    #[arg(long)]
    trips: Option<PathBuf>,

    /// Zone lookup CSV joined onto `--trips`.
    #[arg(long, requires = "trips")]
    zones: Option<PathBuf>,

    /// Write the JSON scenario report here.
    #[arg(long)]
    report: Option<PathBuf>,

    /// Write the final incremental aggregate as CSV here.
    #[arg(long)]
    aggregate_csv: Option<PathBuf>,

    /// Exit non-zero when validation fails.
    #[arg(long)]
    require_green: bool,
}

impl Args {
    fn scenario(&self) -> Result<ScenarioConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => ScenarioConfig::from_path(path)?,
            None => ScenarioConfig::default(),
        };

        if let Some(trips) = &self.trips {
            config.population = PopulationSource::Csv {
                trips: trips.clone(),
                zones: self.zones.clone(),
                clean: true,
            };
        } else if let Some(rows) = self.rows {
            match &mut config.population {
                PopulationSource::Synthetic(synth) => synth.rows = rows,
                PopulationSource::Csv { .. } => {
                    config.population =
                        PopulationSource::Synthetic(PopulationSynth::new(rows, config.seed));
                }
            }
        }

        if let Some(inserts) = self.inserts {
            config.inserts = inserts;
        }
        if let Some(updates) = self.updates {
            config.updates = updates;
        }
        if let Some(deletes) = self.deletes {
            config.deletes = deletes;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(mode) = self.mode {
            config.mode = mode.into();
        }
        if let Some(tolerance) = self.tolerance {
            config.tolerance = tolerance;
        }
        if let Some(partitions) = self.partitions {
            config.partitions = partitions;
        }
        Ok(config)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let config = args.scenario()?;
    let (report, outcome) = run_scenario_with_outcome(&config)?;

    print_summary(&report);

    if let Some(path) = &args.report {
        write_scenario_report(path, &report)?;
        println!("wrote report={}", path.display());
    }
    if let Some(path) = &args.aggregate_csv {
        write_aggregate_csv(path, &outcome.state)?;
        println!("wrote aggregate_csv={}", path.display());
    }

    if !report.is_green() {
        for drift in report.validation.mismatched_keys.iter().take(10) {
            eprintln!(
                "mismatch key={} category={:?} level={:?} count={}/{} sum={}/{}",
                drift.key,
                drift.category,
                drift.level,
                drift.incremental.count,
                drift.truth.count,
                drift.incremental.sum,
                drift.truth.sum
            );
        }
        if args.require_green {
            return Err(format!(
                "scenario {} is not green: {} mismatched keys",
                report.name,
                report.validation.mismatched_keys.len()
            )
            .into());
        }
    }

    Ok(())
}

fn print_summary(report: &ScenarioReport) {
    println!("scenario={}", report.name);
    println!("mode={}", report.mode.as_str());
    println!("seed={}", report.seed);
    println!("initial_rows={}", report.initial_rows);
    println!("final_rows={}", report.final_rows);
    println!("groups={}", report.groups);
    for stage in &report.stages {
        println!(
            "stage={} rows={} groups_touched={} skipped={} elapsed_us={}",
            stage.stage, stage.rows, stage.groups_touched, stage.skipped_rows, stage.elapsed_us
        );
    }
    println!("full_recompute_us={}", report.full_recompute_us);
    println!("incremental_us={}", report.incremental_us);
    println!("speedup={:.2}", report.speedup);
    println!("max_count_diff={}", report.validation.max_count_diff);
    println!("max_sum_diff={:e}", report.validation.max_sum_diff);
    println!("mismatched_keys={}", report.validation.mismatched_keys.len());
    println!("skipped_rows={}", report.skipped_rows);
    println!("state_digest={}", report.state_digest);
    println!("passed={}", report.validation.passed);
}
