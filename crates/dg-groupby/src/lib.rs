#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::mem::size_of;

use bumpalo::{Bump, collections::Vec as BumpVec};
use dg_frame::{ChangeKind, ChangeSet, Population};
use dg_runtime::{AuditLedger, DecisionAction, RuntimePolicy};
use dg_types::{GroupKey, GroupKeyRef, RecordError, Sign, TripRecord, derive_contribution};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GroupByError {
    #[error("row {position}: {source}")]
    Record {
        position: usize,
        source: RecordError,
    },
}

/// Running `count`/`sum` for one group. Both may go negative while a batch
/// of retractions is only partially applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateEntry {
    pub count: i64,
    pub sum: f64,
}

impl AggregateEntry {
    pub const ZERO: Self = Self { count: 0, sum: 0.0 };

    #[must_use]
    pub fn new(count: i64, sum: f64) -> Self {
        Self { count, sum }
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.count == 0 && self.sum == 0.0
    }

    fn observe(&mut self, amount: f64) {
        self.count += 1;
        self.sum += amount;
    }

    pub fn merge_signed(&mut self, other: &Self, sign: Sign) {
        self.count += sign.as_i64() * other.count;
        self.sum += sign.as_f64() * other.sum;
    }
}

/// Flat row of an aggregate table, named after the columns of the trip
/// revenue report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRow {
    pub borough: String,
    pub zone: String,
    pub pickup_hour: u32,
    pub trip_count: i64,
    pub total_revenue: f64,
}

/// Grouped aggregate keyed by [`GroupKey`], iterated in key order.
///
/// Entries are never pruned implicitly: a group emptied by deletes stays
/// addressable with a zero entry so a later insert can repopulate it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(into = "Vec<AggregateRow>", from = "Vec<AggregateRow>")]
pub struct AggregateState {
    entries: BTreeMap<GroupKey, AggregateEntry>,
}

impl AggregateState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn get(&self, key: &GroupKey) -> Option<&AggregateEntry> {
        self.entries.get(key)
    }

    /// Entry for `key`, or a zero entry when the key was never seen.
    #[must_use]
    pub fn entry_or_zero(&self, key: &GroupKey) -> AggregateEntry {
        self.entries.get(key).copied().unwrap_or(AggregateEntry::ZERO)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&GroupKey, &AggregateEntry)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &GroupKey> {
        self.entries.keys()
    }

    #[must_use]
    pub fn total_count(&self) -> i64 {
        self.entries.values().map(|entry| entry.count).sum()
    }

    #[must_use]
    pub fn total_sum(&self) -> f64 {
        self.entries.values().map(|entry| entry.sum).sum()
    }

    /// Groups whose count has dropped to zero but are still held.
    #[must_use]
    pub fn zero_count_groups(&self) -> usize {
        self.entries.values().filter(|entry| entry.count == 0).count()
    }

    /// Merge `delta` into `self` with the given sign, in place.
    ///
    /// Keys new to `self` start from zero; keys absent from `delta` are left
    /// alone. Returns the number of keys touched. Callers holding on to the
    /// previous value must clone first (or use [`apply_delta`]).
    pub fn apply(&mut self, delta: &AggregateState, sign: Sign) -> usize {
        for (key, contribution) in &delta.entries {
            match self.entries.get_mut(key) {
                Some(entry) => entry.merge_signed(contribution, sign),
                None => {
                    let mut entry = AggregateEntry::ZERO;
                    entry.merge_signed(contribution, sign);
                    self.entries.insert(key.clone(), entry);
                }
            }
        }
        delta.entries.len()
    }

    /// Apply every delta with its own sign, in order.
    pub fn apply_all<'a>(&mut self, deltas: impl IntoIterator<Item = &'a Delta>) -> usize {
        deltas.into_iter().map(|delta| delta.apply_to(self)).sum()
    }

    #[must_use]
    pub fn to_rows(&self) -> Vec<AggregateRow> {
        self.entries
            .iter()
            .map(|(key, entry)| AggregateRow {
                borough: key.borough.clone(),
                zone: key.zone.clone(),
                pickup_hour: key.pickup_hour,
                trip_count: entry.count,
                total_revenue: entry.sum,
            })
            .collect()
    }
}

impl FromIterator<(GroupKey, AggregateEntry)> for AggregateState {
    fn from_iter<T: IntoIterator<Item = (GroupKey, AggregateEntry)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl From<AggregateState> for Vec<AggregateRow> {
    fn from(state: AggregateState) -> Self {
        state.to_rows()
    }
}

impl From<Vec<AggregateRow>> for AggregateState {
    fn from(rows: Vec<AggregateRow>) -> Self {
        let mut entries = BTreeMap::new();
        for row in rows {
            let key = GroupKey::new(row.borough, row.zone, row.pickup_hour);
            entries
                .entry(key)
                .or_insert(AggregateEntry::ZERO)
                .merge_signed(&AggregateEntry::new(row.trip_count, row.total_revenue), Sign::Add);
        }
        Self { entries }
    }
}

/// Signed merge returning a new state; `state` is left untouched.
#[must_use]
pub fn apply_delta(state: &AggregateState, delta: &AggregateState, sign: Sign) -> AggregateState {
    let mut next = state.clone();
    next.apply(delta, sign);
    next
}

/// Partial aggregate of one change set together with the sign it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct Delta {
    kind: ChangeKind,
    rows: usize,
    state: AggregateState,
}

impl Delta {
    /// Aggregate the change set's snapshots. Keys come from the snapshots
    /// themselves, so an update-old set is keyed by its pre-update values.
    pub fn from_change_set(
        change_set: &ChangeSet,
        policy: &RuntimePolicy,
        ledger: &mut AuditLedger,
    ) -> Result<Self, GroupByError> {
        Self::from_change_set_with_options(
            change_set,
            policy,
            ledger,
            GroupByExecutionOptions::default(),
        )
    }

    pub fn from_change_set_with_options(
        change_set: &ChangeSet,
        policy: &RuntimePolicy,
        ledger: &mut AuditLedger,
        exec_options: GroupByExecutionOptions,
    ) -> Result<Self, GroupByError> {
        let state =
            aggregate_with_options(change_set.records(), policy, ledger, exec_options)?;
        Ok(Self {
            kind: change_set.kind(),
            rows: change_set.len(),
            state,
        })
    }

    #[must_use]
    pub fn kind(&self) -> ChangeKind {
        self.kind
    }

    #[must_use]
    pub fn sign(&self) -> Sign {
        self.kind.sign()
    }

    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[must_use]
    pub fn state(&self) -> &AggregateState {
        &self.state
    }

    pub fn apply_to(&self, target: &mut AggregateState) -> usize {
        target.apply(&self.state, self.sign())
    }
}

pub const DEFAULT_ARENA_BUDGET_BYTES: usize = 256 * 1024 * 1024;

/// Below this many rows per partition the partitioned path is not worth the
/// thread hand-off and the sequential paths are used instead.
const MIN_ROWS_PER_PARTITION: usize = 1_024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupByExecutionOptions {
    pub use_arena: bool,
    pub arena_budget_bytes: usize,
    /// Values above 1 split the input across the rayon pool. Partial sums are
    /// combined per key, so results match the sequential paths within
    /// floating tolerance rather than bit for bit.
    pub partitions: usize,
}

impl Default for GroupByExecutionOptions {
    fn default() -> Self {
        Self {
            use_arena: true,
            arena_budget_bytes: DEFAULT_ARENA_BUDGET_BYTES,
            partitions: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AggregationStrategy {
    GlobalAllocator,
    Arena,
    Partitioned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AggregationTrace {
    strategy: AggregationStrategy,
    input_rows: usize,
    skipped_rows: usize,
    estimated_bytes: usize,
}

/// Group `records` by derived key and compute `count` and `sum(total_amount)`
/// per group. Fails on the first record whose key or amount is missing.
pub fn aggregate<'a>(
    records: impl IntoIterator<Item = &'a TripRecord>,
) -> Result<AggregateState, GroupByError> {
    let mut ledger = AuditLedger::new();
    aggregate_with_policy(records, &RuntimePolicy::strict(), &mut ledger)
}

pub fn aggregate_with_policy<'a>(
    records: impl IntoIterator<Item = &'a TripRecord>,
    policy: &RuntimePolicy,
    ledger: &mut AuditLedger,
) -> Result<AggregateState, GroupByError> {
    aggregate_with_options(records, policy, ledger, GroupByExecutionOptions::default())
}

pub fn aggregate_with_options<'a>(
    records: impl IntoIterator<Item = &'a TripRecord>,
    policy: &RuntimePolicy,
    ledger: &mut AuditLedger,
    exec_options: GroupByExecutionOptions,
) -> Result<AggregateState, GroupByError> {
    let (state, _trace) = aggregate_with_trace(records, policy, ledger, exec_options)?;
    Ok(state)
}

/// Full recompute over every record currently in `population`.
pub fn aggregate_population(
    population: &Population,
    policy: &RuntimePolicy,
    ledger: &mut AuditLedger,
    exec_options: GroupByExecutionOptions,
) -> Result<AggregateState, GroupByError> {
    aggregate_with_options(population.records(), policy, ledger, exec_options)
}

fn aggregate_with_trace<'a>(
    records: impl IntoIterator<Item = &'a TripRecord>,
    policy: &RuntimePolicy,
    ledger: &mut AuditLedger,
    exec_options: GroupByExecutionOptions,
) -> Result<(AggregateState, AggregationTrace), GroupByError> {
    let rows = records.into_iter().collect::<Vec<_>>();
    let input_rows = rows.len();
    let estimated_bytes = estimate_aggregate_intermediate_bytes(input_rows);
    let partitions = exec_options.partitions.max(1);

    let strategy = if partitions > 1
        && input_rows >= partitions.saturating_mul(MIN_ROWS_PER_PARTITION)
    {
        AggregationStrategy::Partitioned
    } else if exec_options.use_arena && estimated_bytes <= exec_options.arena_budget_bytes {
        AggregationStrategy::Arena
    } else {
        AggregationStrategy::GlobalAllocator
    };

    let (groups, skipped_rows) = match strategy {
        AggregationStrategy::GlobalAllocator => {
            aggregate_with_global_allocator(&rows, policy, ledger)?
        }
        AggregationStrategy::Arena => aggregate_with_arena(&rows, policy, ledger)?,
        AggregationStrategy::Partitioned => {
            aggregate_partitioned(&rows, partitions, policy, ledger)?
        }
    };

    Ok((
        emit_state(groups),
        AggregationTrace {
            strategy,
            input_rows,
            skipped_rows,
            estimated_bytes,
        },
    ))
}

/// Contribution buffer (borrowed key + amount) plus the row pointer itself.
fn estimate_aggregate_intermediate_bytes(input_rows: usize) -> usize {
    input_rows.saturating_mul(
        size_of::<(GroupKeyRef<'static>, f64)>().saturating_add(size_of::<&TripRecord>()),
    )
}

type Groups<'a> = HashMap<GroupKeyRef<'a>, AggregateEntry>;

/// Route a row whose key or amount is missing through the runtime policy.
fn admit_incomplete(
    position: usize,
    source: RecordError,
    policy: &RuntimePolicy,
    ledger: &mut AuditLedger,
) -> Result<(), GroupByError> {
    match policy.decide_incomplete_record(format!("row {position}"), source.to_string(), ledger) {
        DecisionAction::Skip => Ok(()),
        DecisionAction::Allow | DecisionAction::Reject => {
            Err(GroupByError::Record { position, source })
        }
    }
}

fn accumulate<'a>(contributions: impl IntoIterator<Item = (GroupKeyRef<'a>, f64)>) -> Groups<'a> {
    let mut groups = Groups::new();
    for (key, amount) in contributions {
        groups
            .entry(key)
            .or_insert(AggregateEntry::ZERO)
            .observe(amount);
    }
    groups
}

// Every key is derived before anything is accumulated, so a rejected row
// never leaves a half-built state behind.
fn aggregate_with_global_allocator<'a>(
    rows: &[&'a TripRecord],
    policy: &RuntimePolicy,
    ledger: &mut AuditLedger,
) -> Result<(Groups<'a>, usize), GroupByError> {
    let mut contributions = Vec::with_capacity(rows.len());
    let mut skipped = 0;
    for (position, &record) in rows.iter().enumerate() {
        match derive_contribution(record) {
            Ok(contribution) => contributions.push(contribution),
            Err(source) => {
                admit_incomplete(position, source, policy, ledger)?;
                skipped += 1;
            }
        }
    }
    Ok((accumulate(contributions), skipped))
}

fn aggregate_with_arena<'a>(
    rows: &[&'a TripRecord],
    policy: &RuntimePolicy,
    ledger: &mut AuditLedger,
) -> Result<(Groups<'a>, usize), GroupByError> {
    let arena = Bump::new();
    let mut contributions = BumpVec::with_capacity_in(rows.len(), &arena);
    let mut skipped = 0;
    for (position, &record) in rows.iter().enumerate() {
        match derive_contribution(record) {
            Ok(contribution) => contributions.push(contribution),
            Err(source) => {
                admit_incomplete(position, source, policy, ledger)?;
                skipped += 1;
            }
        }
    }
    Ok((accumulate(contributions.iter().copied()), skipped))
}

#[derive(Default)]
struct PartialAggregate<'a> {
    groups: Groups<'a>,
    incomplete: Vec<(usize, RecordError)>,
}

impl PartialAggregate<'_> {
    fn merge(mut self, other: Self) -> Self {
        for (key, entry) in other.groups {
            self.groups
                .entry(key)
                .or_insert(AggregateEntry::ZERO)
                .merge_signed(&entry, Sign::Add);
        }
        self.incomplete.extend(other.incomplete);
        self
    }
}

fn aggregate_partitioned<'a>(
    rows: &[&'a TripRecord],
    partitions: usize,
    policy: &RuntimePolicy,
    ledger: &mut AuditLedger,
) -> Result<(Groups<'a>, usize), GroupByError> {
    let chunk_len = rows.len().div_ceil(partitions).max(1);
    let PartialAggregate {
        groups,
        mut incomplete,
    } = rows
        .par_chunks(chunk_len)
        .enumerate()
        .map(|(chunk_idx, chunk)| {
            let mut partial = PartialAggregate::default();
            for (offset, &record) in chunk.iter().enumerate() {
                match derive_contribution(record) {
                    Ok((key, amount)) => partial
                        .groups
                        .entry(key)
                        .or_insert(AggregateEntry::ZERO)
                        .observe(amount),
                    Err(source) => partial
                        .incomplete
                        .push((chunk_idx * chunk_len + offset, source)),
                }
            }
            partial
        })
        .reduce(PartialAggregate::default, PartialAggregate::merge);

    // Decisions are taken in row order so the ledger reads the same as a
    // sequential run.
    incomplete.sort_by_key(|(position, _)| *position);
    let skipped = incomplete.len();
    for (position, source) in incomplete {
        admit_incomplete(position, source, policy, ledger)?;
    }
    Ok((groups, skipped))
}

fn emit_state(groups: Groups<'_>) -> AggregateState {
    groups
        .into_iter()
        .map(|(key, entry)| (key.to_owned_key(), entry))
        .collect()
}
