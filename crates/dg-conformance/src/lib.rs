#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use dg_frame::Population;
use dg_groupby::{
    AggregateEntry, AggregateState, GroupByError, GroupByExecutionOptions, aggregate_population,
};
use dg_incremental::{
    IncrementalError, IncrementalOutcome, IncrementalPlan, StageReport, run_incremental,
};
use dg_io::{read_trips_csv, read_zone_lookup_csv};
use dg_join::{JoinType, join_zones};
use dg_runtime::{
    AuditLedger, DecisionAction, IssueKind, RuntimeMode, RuntimePolicy, now_unix_ms,
};
use dg_simulate::{PopulationSynth, SimulateError, SimulationOptions};
use dg_types::GroupKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

/// Largest accepted `|sum_inc - sum_truth|` per key.
pub const DEFAULT_SUM_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Error)]
pub enum ConformanceError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Input(#[from] dg_io::IoError),
    #[error(transparent)]
    GroupBy(#[from] GroupByError),
    #[error(transparent)]
    Incremental(#[from] IncrementalError),
    #[error(transparent)]
    Simulate(#[from] SimulateError),
    #[error("unsupported config format for {0} (expected .yaml, .yml or .json)")]
    UnsupportedConfigFormat(PathBuf),
}

/// How far a mismatched key is from the recomputed truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftLevel {
    /// Counts disagree: a record was lost, duplicated or filed under the
    /// wrong key.
    Critical,
    /// Counts agree but the sum is outside tolerance.
    NonCritical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonCategory {
    Count,
    Sum,
    /// The key exists on one side only and the other side is not zero.
    Presence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyDrift {
    pub key: GroupKey,
    pub incremental: AggregateEntry,
    pub truth: AggregateEntry,
    pub count_diff: u64,
    pub sum_diff: f64,
    pub category: ComparisonCategory,
    pub level: DriftLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationOptions {
    pub tolerance: f64,
    /// Policy the truth is recomputed under. Must match the policy the
    /// incremental run used.
    pub mode: RuntimeMode,
    pub exec: GroupByExecutionOptions,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_SUM_TOLERANCE,
            mode: RuntimeMode::Strict,
            exec: GroupByExecutionOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub compared_keys: usize,
    pub max_count_diff: u64,
    pub max_sum_diff: f64,
    pub mismatched_keys: Vec<KeyDrift>,
    /// Zero entries kept by the incremental state for keys the truth no
    /// longer has. Expected after deletes; not a mismatch.
    pub vanished_keys: usize,
    pub tolerance: f64,
    pub passed: bool,
}

impl ValidationReport {
    #[must_use]
    pub fn is_green(&self) -> bool {
        self.passed
    }

    #[must_use]
    pub fn count_by_level(&self, level: DriftLevel) -> usize {
        self.mismatched_keys
            .iter()
            .filter(|drift| drift.level == level)
            .count()
    }
}

/// Full outer comparison of two states on group key; a missing side reads as
/// a zero entry. A mismatch is reported, never returned as an error.
#[must_use]
pub fn compare_states(
    incremental: &AggregateState,
    truth: &AggregateState,
    options: &ValidationOptions,
) -> ValidationReport {
    let keys = incremental.keys().chain(truth.keys()).collect::<BTreeSet<_>>();

    let mut max_count_diff = 0_u64;
    let mut max_sum_diff = 0.0_f64;
    let mut mismatched_keys = Vec::new();
    let mut vanished_keys = 0;

    for key in &keys {
        let inc = incremental.get(key);
        let tru = truth.get(key);
        let inc_entry = inc.copied().unwrap_or(AggregateEntry::ZERO);
        let tru_entry = tru.copied().unwrap_or(AggregateEntry::ZERO);

        let count_diff = inc_entry.count.abs_diff(tru_entry.count);
        let sum_diff = (inc_entry.sum - tru_entry.sum).abs();
        max_count_diff = max_count_diff.max(count_diff);
        if sum_diff.is_nan() || sum_diff > max_sum_diff {
            max_sum_diff = sum_diff;
        }

        let sum_ok = sum_diff < options.tolerance;
        if count_diff == 0 && sum_ok {
            if inc.is_some() && tru.is_none() {
                vanished_keys += 1;
            }
            continue;
        }

        let one_sided = inc.is_none() || tru.is_none();
        let (category, level) = match (count_diff, one_sided) {
            (0, _) => (ComparisonCategory::Sum, DriftLevel::NonCritical),
            (_, true) => (ComparisonCategory::Presence, DriftLevel::Critical),
            (_, false) => (ComparisonCategory::Count, DriftLevel::Critical),
        };
        mismatched_keys.push(KeyDrift {
            key: (*key).clone(),
            incremental: inc_entry,
            truth: tru_entry,
            count_diff,
            sum_diff,
            category,
            level,
        });
    }

    let passed = max_count_diff == 0 && max_sum_diff < options.tolerance;
    ValidationReport {
        compared_keys: keys.len(),
        max_count_diff,
        max_sum_diff,
        mismatched_keys,
        vanished_keys,
        tolerance: options.tolerance,
        passed,
    }
}

/// Recompute the aggregate of `final_population` from scratch (strict
/// policy) and compare it with `incremental`.
pub fn validate(
    incremental: &AggregateState,
    final_population: &Population,
) -> Result<ValidationReport, ConformanceError> {
    let mut ledger = AuditLedger::new();
    validate_with_options(
        incremental,
        final_population,
        &ValidationOptions::default(),
        &mut ledger,
    )
}

pub fn validate_with_options(
    incremental: &AggregateState,
    final_population: &Population,
    options: &ValidationOptions,
    ledger: &mut AuditLedger,
) -> Result<ValidationReport, ConformanceError> {
    let policy = RuntimePolicy::for_mode(options.mode);
    let truth = aggregate_population(final_population, &policy, ledger, options.exec)?;
    let report = compare_states(incremental, &truth, options);
    record_drift(&report, &policy, ledger);
    Ok(report)
}

fn record_drift(report: &ValidationReport, policy: &RuntimePolicy, ledger: &mut AuditLedger) {
    for drift in &report.mismatched_keys {
        policy.note_numeric_drift(
            drift.key.to_string(),
            format!(
                "{:?}: count {} vs {}, sum {} vs {}",
                drift.category,
                drift.incremental.count,
                drift.truth.count,
                drift.incremental.sum,
                drift.truth.sum
            ),
            ledger,
        );
    }
    if !report.passed {
        warn!(
            mismatched = report.mismatched_keys.len(),
            max_count_diff = report.max_count_diff,
            max_sum_diff = report.max_sum_diff,
            "incremental state drifted from full recompute"
        );
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PopulationSource {
    Synthetic(PopulationSynth),
    Csv {
        trips: PathBuf,
        /// Joined onto the trips when set; otherwise the trips file must
        /// already carry `Borough` and `Zone` columns.
        #[serde(default)]
        zones: Option<PathBuf>,
        /// Keep only rows with positive distance and amount.
        #[serde(default = "default_true")]
        clean: bool,
    },
}

fn default_true() -> bool {
    true
}

impl Default for PopulationSource {
    fn default() -> Self {
        Self::Synthetic(PopulationSynth::default())
    }
}

impl PopulationSource {
    pub fn load(&self) -> Result<Population, ConformanceError> {
        match self {
            Self::Synthetic(synth) => Ok(synth.generate()?),
            Self::Csv {
                trips,
                zones,
                clean,
            } => {
                let mut records = read_trips_csv(trips)?;
                if *clean {
                    records.retain(|record| record.is_clean());
                }
                if let Some(zones) = zones {
                    let lookup = read_zone_lookup_csv(zones)?;
                    let joined = join_zones(records, &lookup, JoinType::Left);
                    info!(
                        matched = joined.matched,
                        unmatched = joined.unmatched,
                        "joined pickup zones"
                    );
                    records = joined.records;
                }
                Ok(Population::from_records(records))
            }
        }
    }
}

/// One end-to-end run: where the data comes from, how much to change and
/// under which policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    pub name: String,
    pub population: PopulationSource,
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
    pub seed: u64,
    pub mode: RuntimeMode,
    pub tolerance: f64,
    pub partitions: usize,
    pub simulation: SimulationOptions,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            name: "default".to_owned(),
            population: PopulationSource::default(),
            inserts: 5_000,
            updates: 5_000,
            deletes: 5_000,
            seed: 42,
            mode: RuntimeMode::Strict,
            tolerance: DEFAULT_SUM_TOLERANCE,
            partitions: 1,
            simulation: SimulationOptions::default(),
        }
    }
}

impl ScenarioConfig {
    /// Load from `.yaml`/`.yml` or `.json`; omitted fields take defaults.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConformanceError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml" | "yml") => Ok(serde_yaml::from_str(&text)?),
            Some("json") => Ok(serde_json::from_str(&text)?),
            _ => Err(ConformanceError::UnsupportedConfigFormat(path.to_path_buf())),
        }
    }

    #[must_use]
    pub fn exec_options(&self) -> GroupByExecutionOptions {
        GroupByExecutionOptions {
            partitions: self.partitions.max(1),
            ..GroupByExecutionOptions::default()
        }
    }

    #[must_use]
    pub fn plan(&self) -> IncrementalPlan {
        IncrementalPlan {
            inserts: self.inserts,
            updates: self.updates,
            deletes: self.deletes,
            seed: self.seed,
            simulation: self.simulation.clone(),
            exec: self.exec_options(),
        }
    }

    #[must_use]
    pub fn policy(&self) -> RuntimePolicy {
        RuntimePolicy::for_mode(self.mode)
    }

    #[must_use]
    pub fn validation_options(&self) -> ValidationOptions {
        ValidationOptions {
            tolerance: self.tolerance,
            mode: self.mode,
            exec: self.exec_options(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub name: String,
    pub ts_unix_ms: u64,
    pub mode: RuntimeMode,
    pub seed: u64,
    pub initial_rows: usize,
    pub final_rows: usize,
    pub groups: usize,
    pub stages: Vec<StageReport>,
    pub baseline_us: u64,
    /// From-scratch aggregation of the final population.
    pub full_recompute_us: u64,
    /// Insert, update and delete stages together.
    pub incremental_us: u64,
    pub speedup: f64,
    pub skipped_rows: usize,
    pub audit_records: usize,
    pub validation: ValidationReport,
    /// SHA-256 of the final incremental state; stable for a fixed config.
    pub state_digest: String,
}

impl ScenarioReport {
    #[must_use]
    pub fn is_green(&self) -> bool {
        self.validation.passed
    }
}

pub fn run_scenario(config: &ScenarioConfig) -> Result<ScenarioReport, ConformanceError> {
    run_scenario_with_outcome(config).map(|(report, _)| report)
}

/// Like [`run_scenario`], also handing back the incremental outcome (final
/// state, population and audit ledger).
pub fn run_scenario_with_outcome(
    config: &ScenarioConfig,
) -> Result<(ScenarioReport, IncrementalOutcome), ConformanceError> {
    let population = config.population.load()?;
    let initial_rows = population.len();
    info!(
        scenario = config.name.as_str(),
        rows = initial_rows,
        mode = config.mode.as_str(),
        "population loaded"
    );

    let policy = config.policy();
    let mut outcome = run_incremental(population, &config.plan(), &policy)?;

    let mut truth_ledger = AuditLedger::new();
    let started = Instant::now();
    let truth = aggregate_population(
        &outcome.final_population,
        &policy,
        &mut truth_ledger,
        config.exec_options(),
    )?;
    let full_recompute_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);

    let validation = compare_states(&outcome.state, &truth, &config.validation_options());
    record_drift(&validation, &policy, &mut outcome.ledger);

    let incremental_us = outcome.incremental_elapsed_us();
    let speedup = full_recompute_us as f64 / incremental_us.max(1) as f64;
    info!(
        full_recompute_us,
        incremental_us,
        speedup,
        passed = validation.passed,
        "scenario complete"
    );

    let report = ScenarioReport {
        name: config.name.clone(),
        ts_unix_ms: now_unix_ms().unwrap_or_default(),
        mode: config.mode,
        seed: config.seed,
        initial_rows,
        final_rows: outcome.final_population.len(),
        groups: outcome.state.len(),
        stages: outcome.reports.clone(),
        baseline_us: outcome.baseline_elapsed_us(),
        full_recompute_us,
        incremental_us,
        speedup,
        skipped_rows: outcome
            .ledger
            .count(IssueKind::IncompleteRecord, DecisionAction::Skip),
        audit_records: outcome.ledger.len(),
        validation,
        state_digest: stable_json_digest(&outcome.state),
    };
    Ok((report, outcome))
}

pub fn write_scenario_report(
    path: impl AsRef<Path>,
    report: &ScenarioReport,
) -> Result<(), ConformanceError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(report)?)?;
    Ok(())
}

fn stable_json_digest<T: Serialize>(value: &T) -> String {
    let payload = serde_json::to_vec(value).unwrap_or_default();
    format!("{:x}", Sha256::digest(&payload))
}
