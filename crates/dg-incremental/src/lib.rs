#![forbid(unsafe_code)]

use std::fmt;
use std::time::Instant;

use dg_frame::{ChangeKind, ChangeSet, FrameError, Population};
use dg_groupby::{
    AggregateState, Delta, GroupByError, GroupByExecutionOptions, aggregate_population,
};
use dg_runtime::{AuditLedger, DecisionAction, IssueKind, RuntimePolicy, deterministic_seed};
use dg_simulate::{ChangeSimulator, SimulateError, SimulationOptions, UpdateSample};
use dg_types::{RecordId, TripRecord};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, info_span, warn};

/// Orchestrator position: the last stage that completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Baseline,
    Insert,
    Update,
    Delete,
    Complete,
    Aborted,
}

impl Stage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Complete => "complete",
            Self::Aborted => "aborted",
        }
    }

    /// The only stage allowed to run after `self`.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Baseline => Some(Self::Insert),
            Self::Insert => Some(Self::Update),
            Self::Update => Some(Self::Delete),
            Self::Delete => Some(Self::Complete),
            Self::Complete | Self::Aborted => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum IncrementalError {
    #[error("stage `{requested}` cannot run after `{current}`")]
    StageOrder { current: Stage, requested: Stage },
    #[error("expected a `{expected}` change set, got `{found}`")]
    UnexpectedChangeKind {
        expected: ChangeKind,
        found: ChangeKind,
    },
    #[error("update pre-image and post-image cover different records")]
    MismatchedUpdateImages,
    #[error("update pre-image for record {0} does not match the current population")]
    StalePreImage(RecordId),
    #[error(transparent)]
    GroupBy(#[from] GroupByError),
    #[error(transparent)]
    Simulate(#[from] SimulateError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncrementalPlan {
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
    pub seed: u64,
    pub simulation: SimulationOptions,
    pub exec: GroupByExecutionOptions,
}

impl Default for IncrementalPlan {
    fn default() -> Self {
        Self {
            inserts: 5_000,
            updates: 5_000,
            deletes: 5_000,
            seed: 42,
            simulation: SimulationOptions::default(),
            exec: GroupByExecutionOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: Stage,
    /// Records in the stage's change sets (an update counts each record once).
    pub rows: usize,
    /// Keys merged into the running state, summed over the stage's deltas.
    pub groups_touched: usize,
    pub skipped_rows: usize,
    pub elapsed_us: u64,
}

/// Structural edits in the order they were applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeJournal {
    pub inserted: Vec<(RecordId, TripRecord)>,
    pub updated: Vec<(RecordId, TripRecord)>,
    pub deleted: Vec<RecordId>,
}

/// Replay `journal` onto `initial`: append inserts under their recorded ids,
/// replace updated rows, then drop deleted ids.
pub fn reconstruct_final_population(
    initial: &Population,
    journal: &ChangeJournal,
) -> Result<Population, FrameError> {
    let mut population = initial.clone();
    for (id, record) in &journal.inserted {
        population.insert_with_id(*id, record.clone())?;
    }
    population.replace(&journal.updated)?;
    population.drop_ids(&journal.deleted)?;
    Ok(population)
}

#[derive(Debug, Clone, PartialEq)]
pub struct IncrementalOutcome {
    pub state: AggregateState,
    pub final_population: Population,
    pub journal: ChangeJournal,
    pub reports: Vec<StageReport>,
    pub ledger: AuditLedger,
    pub policy: RuntimePolicy,
}

impl IncrementalOutcome {
    #[must_use]
    pub fn baseline_elapsed_us(&self) -> u64 {
        self.reports
            .iter()
            .filter(|report| report.stage == Stage::Baseline)
            .map(|report| report.elapsed_us)
            .sum()
    }

    /// Time spent in the insert, update and delete stages.
    #[must_use]
    pub fn incremental_elapsed_us(&self) -> u64 {
        self.reports
            .iter()
            .filter(|report| report.stage != Stage::Baseline)
            .map(|report| report.elapsed_us)
            .sum()
    }
}

struct StageCounts {
    rows: usize,
    groups_touched: usize,
}

/// Four-stage incremental maintenance of one aggregate.
///
/// Stages run strictly in order: baseline (on construction), insert, update,
/// delete, then [`IncrementalEngine::finish`]. Each stage computes every delta
/// before it edits the population or the running state, so a failing stage
/// leaves both as they were and moves the engine to [`Stage::Aborted`].
#[derive(Debug, Clone)]
pub struct IncrementalEngine {
    policy: RuntimePolicy,
    exec: GroupByExecutionOptions,
    initial: Population,
    population: Population,
    state: AggregateState,
    journal: ChangeJournal,
    stage: Stage,
    reports: Vec<StageReport>,
    ledger: AuditLedger,
}

impl IncrementalEngine {
    pub fn baseline(population: Population, policy: RuntimePolicy) -> Result<Self, IncrementalError> {
        Self::baseline_with_options(population, policy, GroupByExecutionOptions::default())
    }

    pub fn baseline_with_options(
        population: Population,
        policy: RuntimePolicy,
        exec: GroupByExecutionOptions,
    ) -> Result<Self, IncrementalError> {
        let span = info_span!("stage", stage = Stage::Baseline.as_str());
        let _entered = span.enter();

        let mut ledger = AuditLedger::new();
        let started = Instant::now();
        let state = aggregate_population(&population, &policy, &mut ledger, exec)?;
        let report = StageReport {
            stage: Stage::Baseline,
            rows: population.len(),
            groups_touched: state.len(),
            skipped_rows: skipped_records(&ledger),
            elapsed_us: elapsed_us(started),
        };
        info!(
            rows = report.rows,
            groups = report.groups_touched,
            skipped = report.skipped_rows,
            elapsed_us = report.elapsed_us,
            mode = policy.mode.as_str(),
            "baseline aggregated"
        );

        Ok(Self {
            policy,
            exec,
            initial: population.clone(),
            population,
            state,
            journal: ChangeJournal::default(),
            stage: Stage::Baseline,
            reports: vec![report],
            ledger,
        })
    }

    #[must_use]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    #[must_use]
    pub fn state(&self) -> &AggregateState {
        &self.state
    }

    #[must_use]
    pub fn population(&self) -> &Population {
        &self.population
    }

    #[must_use]
    pub fn initial_population(&self) -> &Population {
        &self.initial
    }

    #[must_use]
    pub fn journal(&self) -> &ChangeJournal {
        &self.journal
    }

    #[must_use]
    pub fn reports(&self) -> &[StageReport] {
        &self.reports
    }

    #[must_use]
    pub fn ledger(&self) -> &AuditLedger {
        &self.ledger
    }

    /// Insert stage over caller-supplied records.
    pub fn apply_insert(&mut self, records: Vec<TripRecord>) -> Result<StageReport, IncrementalError> {
        self.run_stage(Stage::Insert, |engine| engine.insert_records(records))
    }

    /// Update stage over caller-supplied images. The pre-image must match the
    /// engine's current population row for row, or the stage aborts with
    /// [`IncrementalError::StalePreImage`].
    pub fn apply_update(&mut self, sample: UpdateSample) -> Result<StageReport, IncrementalError> {
        self.run_stage(Stage::Update, |engine| engine.update_records(&sample))
    }

    pub fn apply_delete(&mut self, ids: &[RecordId]) -> Result<StageReport, IncrementalError> {
        self.run_stage(Stage::Delete, |engine| engine.delete_records(ids))
    }

    pub fn run_insert(
        &mut self,
        simulator: &mut ChangeSimulator,
        n: usize,
    ) -> Result<StageReport, IncrementalError> {
        self.run_stage(Stage::Insert, |engine| {
            let records = simulator.simulate_insert(&engine.population, n)?;
            engine.insert_records(records)
        })
    }

    pub fn run_update(
        &mut self,
        simulator: &mut ChangeSimulator,
        n: usize,
    ) -> Result<StageReport, IncrementalError> {
        self.run_stage(Stage::Update, |engine| {
            let sample = simulator.simulate_update(&engine.population, n)?;
            engine.update_records(&sample)
        })
    }

    /// Deletes are sampled from the population as it stands after the update
    /// stage, so updated and inserted records are eligible.
    pub fn run_delete(
        &mut self,
        simulator: &mut ChangeSimulator,
        n: usize,
    ) -> Result<StageReport, IncrementalError> {
        self.run_stage(Stage::Delete, |engine| {
            let removed = simulator.simulate_delete(&engine.population, n)?;
            engine.delete_records(&removed.ids())
        })
    }

    /// Close the run and rebuild the final population from the initial one
    /// by replaying the journal.
    pub fn finish(self) -> Result<IncrementalOutcome, IncrementalError> {
        if self.stage.next() != Some(Stage::Complete) {
            return Err(IncrementalError::StageOrder {
                current: self.stage,
                requested: Stage::Complete,
            });
        }
        let final_population = reconstruct_final_population(&self.initial, &self.journal)?;
        info!(
            groups = self.state.len(),
            final_rows = final_population.len(),
            audit_records = self.ledger.len(),
            "incremental run complete"
        );
        Ok(IncrementalOutcome {
            state: self.state,
            final_population,
            journal: self.journal,
            reports: self.reports,
            ledger: self.ledger,
            policy: self.policy,
        })
    }

    fn run_stage(
        &mut self,
        stage: Stage,
        op: impl FnOnce(&mut Self) -> Result<StageCounts, IncrementalError>,
    ) -> Result<StageReport, IncrementalError> {
        if self.stage.next() != Some(stage) {
            return Err(IncrementalError::StageOrder {
                current: self.stage,
                requested: stage,
            });
        }

        let span = info_span!("stage", stage = stage.as_str());
        let _entered = span.enter();
        let skipped_before = skipped_records(&self.ledger);
        let started = Instant::now();

        match op(self) {
            Ok(counts) => {
                let report = StageReport {
                    stage,
                    rows: counts.rows,
                    groups_touched: counts.groups_touched,
                    skipped_rows: skipped_records(&self.ledger) - skipped_before,
                    elapsed_us: elapsed_us(started),
                };
                info!(
                    rows = report.rows,
                    groups_touched = report.groups_touched,
                    skipped = report.skipped_rows,
                    elapsed_us = report.elapsed_us,
                    population = self.population.len(),
                    "stage applied"
                );
                self.stage = stage;
                self.reports.push(report.clone());
                Ok(report)
            }
            Err(err) => {
                warn!(error = %err, "stage aborted");
                self.stage = Stage::Aborted;
                Err(err)
            }
        }
    }

    fn delta(&mut self, change_set: &ChangeSet) -> Result<Delta, IncrementalError> {
        let delta = Delta::from_change_set_with_options(
            change_set,
            &self.policy,
            &mut self.ledger,
            self.exec,
        )?;
        debug!(
            kind = change_set.kind().as_str(),
            rows = delta.rows(),
            groups = delta.state().len(),
            "delta aggregated"
        );
        Ok(delta)
    }

    fn insert_records(&mut self, records: Vec<TripRecord>) -> Result<StageCounts, IncrementalError> {
        let first = self.population.next_id().0;
        let rows = (first..)
            .zip(records)
            .map(|(id, record)| (RecordId(id), record))
            .collect();
        let change_set = ChangeSet::new(ChangeKind::Insert, rows);
        let delta = self.delta(&change_set)?;

        self.population.append(change_set.records().cloned());
        let groups_touched = delta.apply_to(&mut self.state);
        let rows = change_set.len();
        self.journal.inserted.extend(change_set.into_rows());
        Ok(StageCounts {
            rows,
            groups_touched,
        })
    }

    fn update_records(&mut self, sample: &UpdateSample) -> Result<StageCounts, IncrementalError> {
        expect_kind(&sample.pre_image, ChangeKind::UpdateOld)?;
        expect_kind(&sample.post_image, ChangeKind::UpdateNew)?;
        if sample.pre_image.ids() != sample.post_image.ids() {
            return Err(IncrementalError::MismatchedUpdateImages);
        }

        let current =
            ChangeSet::capture(ChangeKind::UpdateOld, &self.population, &sample.pre_image.ids())?;
        if let Some((id, _)) = sample
            .pre_image
            .rows()
            .iter()
            .zip(current.rows())
            .find(|(claimed, held)| claimed != held)
            .map(|(claimed, _)| claimed)
        {
            return Err(IncrementalError::StalePreImage(*id));
        }

        let retract = self.delta(&current)?;
        let add = self.delta(&sample.post_image)?;

        self.population.replace(sample.post_image.rows())?;
        let groups_touched = retract.apply_to(&mut self.state) + add.apply_to(&mut self.state);
        self.journal
            .updated
            .extend(sample.post_image.rows().iter().cloned());
        Ok(StageCounts {
            rows: sample.post_image.len(),
            groups_touched,
        })
    }

    fn delete_records(&mut self, ids: &[RecordId]) -> Result<StageCounts, IncrementalError> {
        let removed = ChangeSet::capture(ChangeKind::Delete, &self.population, ids)?;
        let delta = self.delta(&removed)?;

        self.population.drop_ids(ids)?;
        let groups_touched = delta.apply_to(&mut self.state);
        self.journal.deleted.extend_from_slice(ids);
        Ok(StageCounts {
            rows: removed.len(),
            groups_touched,
        })
    }
}

fn expect_kind(change_set: &ChangeSet, expected: ChangeKind) -> Result<(), IncrementalError> {
    if change_set.kind() == expected {
        Ok(())
    } else {
        Err(IncrementalError::UnexpectedChangeKind {
            expected,
            found: change_set.kind(),
        })
    }
}

fn skipped_records(ledger: &AuditLedger) -> usize {
    ledger.count(IssueKind::IncompleteRecord, DecisionAction::Skip)
}

fn elapsed_us(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX)
}

/// Baseline, then simulated inserts, updates and deletes, then the journal
/// replay. Each stage draws from its own simulator seeded from `plan.seed`
/// and the stage name, so changing one stage's count leaves the others'
/// samples reproducible.
pub fn run_incremental(
    population: Population,
    plan: &IncrementalPlan,
    policy: &RuntimePolicy,
) -> Result<IncrementalOutcome, IncrementalError> {
    let simulator_for = |stage: Stage| {
        ChangeSimulator::with_options(
            deterministic_seed(plan.seed, stage.as_str()),
            plan.simulation.clone(),
        )
    };
    let mut engine = IncrementalEngine::baseline_with_options(population, policy.clone(), plan.exec)?;
    engine.run_insert(&mut simulator_for(Stage::Insert)?, plan.inserts)?;
    engine.run_update(&mut simulator_for(Stage::Update)?, plan.updates)?;
    engine.run_delete(&mut simulator_for(Stage::Delete)?, plan.deletes)?;
    engine.finish()
}
