#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use dg_types::{RecordId, Sign, TripRecord};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("record id {0} is not present in the population")]
    UnknownRecordId(RecordId),
    #[error("record id {0} appears more than once in the selector")]
    DuplicateRecordId(RecordId),
    #[error("record id {0} is already present in the population")]
    RecordIdTaken(RecordId),
}

/// Record collection with an explicit id space.
///
/// Ids are assigned monotonically and never reused, so a snapshot taken by id
/// before an edit still names the same logical record after it. Iteration is
/// in ascending id order, which keeps sampling and summation reproducible.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Population {
    rows: BTreeMap<RecordId, TripRecord>,
    next_id: u64,
}

impl Population {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns ids `0..n` in input order.
    #[must_use]
    pub fn from_records(records: impl IntoIterator<Item = TripRecord>) -> Self {
        let mut population = Self::new();
        population.append(records);
        population
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: RecordId) -> bool {
        self.rows.contains_key(&id)
    }

    #[must_use]
    pub fn get(&self, id: RecordId) -> Option<&TripRecord> {
        self.rows.get(&id)
    }

    /// Id the next appended record will receive.
    #[must_use]
    pub fn next_id(&self) -> RecordId {
        RecordId(self.next_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (RecordId, &TripRecord)> {
        self.rows.iter().map(|(id, record)| (*id, record))
    }

    pub fn records(&self) -> impl Iterator<Item = &TripRecord> {
        self.rows.values()
    }

    #[must_use]
    pub fn ids(&self) -> Vec<RecordId> {
        self.rows.keys().copied().collect()
    }

    /// Immutable snapshots of the selected rows, in selector order.
    pub fn loc(&self, ids: &[RecordId]) -> Result<Vec<(RecordId, TripRecord)>, FrameError> {
        ensure_distinct(ids)?;
        ids.iter()
            .map(|id| {
                self.rows
                    .get(id)
                    .map(|record| (*id, record.clone()))
                    .ok_or(FrameError::UnknownRecordId(*id))
            })
            .collect()
    }

    /// Append records under fresh ids and return the ids in input order.
    pub fn append(&mut self, records: impl IntoIterator<Item = TripRecord>) -> Vec<RecordId> {
        records
            .into_iter()
            .map(|record| {
                let id = RecordId(self.next_id);
                self.next_id += 1;
                self.rows.insert(id, record);
                id
            })
            .collect()
    }

    /// Insert under a caller-chosen id (used when replaying a journal).
    pub fn insert_with_id(&mut self, id: RecordId, record: TripRecord) -> Result<(), FrameError> {
        if self.rows.contains_key(&id) {
            return Err(FrameError::RecordIdTaken(id));
        }
        self.rows.insert(id, record);
        self.next_id = self.next_id.max(id.0.saturating_add(1));
        Ok(())
    }

    /// Replace existing rows by id. All ids are checked before any row changes.
    pub fn replace(&mut self, rows: &[(RecordId, TripRecord)]) -> Result<(), FrameError> {
        let ids = rows.iter().map(|(id, _)| *id).collect::<Vec<_>>();
        self.ensure_present(&ids)?;
        for (id, record) in rows {
            self.rows.insert(*id, record.clone());
        }
        Ok(())
    }

    /// Remove rows by id and hand back what was removed, in selector order.
    /// All ids are checked before any row is removed.
    pub fn drop_ids(&mut self, ids: &[RecordId]) -> Result<Vec<(RecordId, TripRecord)>, FrameError> {
        self.ensure_present(ids)?;
        Ok(ids
            .iter()
            .filter_map(|id| self.rows.remove(id).map(|record| (*id, record)))
            .collect())
    }

    /// Drop rows failing [`TripRecord::is_clean`]; returns how many were removed.
    pub fn retain_clean(&mut self) -> usize {
        let before = self.rows.len();
        self.rows.retain(|_, record| record.is_clean());
        before - self.rows.len()
    }

    fn ensure_present(&self, ids: &[RecordId]) -> Result<(), FrameError> {
        ensure_distinct(ids)?;
        match ids.iter().find(|id| !self.rows.contains_key(*id)) {
            Some(missing) => Err(FrameError::UnknownRecordId(*missing)),
            None => Ok(()),
        }
    }
}

impl FromIterator<TripRecord> for Population {
    fn from_iter<T: IntoIterator<Item = TripRecord>>(iter: T) -> Self {
        Self::from_records(iter)
    }
}

fn ensure_distinct(ids: &[RecordId]) -> Result<(), FrameError> {
    let mut seen = BTreeSet::new();
    for id in ids {
        if !seen.insert(*id) {
            return Err(FrameError::DuplicateRecordId(*id));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    UpdateOld,
    UpdateNew,
    Delete,
}

impl ChangeKind {
    #[must_use]
    pub fn sign(self) -> Sign {
        match self {
            Self::Insert | Self::UpdateNew => Sign::Add,
            Self::UpdateOld | Self::Delete => Sign::Retract,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::UpdateOld => "update_old",
            Self::UpdateNew => "update_new",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot rows tagged with the operation that produced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    kind: ChangeKind,
    rows: Vec<(RecordId, TripRecord)>,
}

impl ChangeSet {
    #[must_use]
    pub fn new(kind: ChangeKind, rows: Vec<(RecordId, TripRecord)>) -> Self {
        Self { kind, rows }
    }

    /// Snapshot `ids` from `population` as they are right now.
    pub fn capture(
        kind: ChangeKind,
        population: &Population,
        ids: &[RecordId],
    ) -> Result<Self, FrameError> {
        Ok(Self::new(kind, population.loc(ids)?))
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
    pub fn rows(&self) -> &[(RecordId, TripRecord)] {
        &self.rows
    }

    #[must_use]
    pub fn ids(&self) -> Vec<RecordId> {
        self.rows.iter().map(|(id, _)| *id).collect()
    }

    pub fn records(&self) -> impl Iterator<Item = &TripRecord> {
        self.rows.iter().map(|(_, record)| record)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn into_rows(self) -> Vec<(RecordId, TripRecord)> {
        self.rows
    }
}
