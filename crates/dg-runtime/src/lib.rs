#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeMode {
    #[default]
    Strict,
    Hardened,
}

impl RuntimeMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Hardened => "hardened",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Allow,
    Reject,
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    IncompleteRecord,
    NumericDrift,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditIssue {
    pub kind: IssueKind,
    pub subject: String,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub ts_unix_ms: u64,
    pub mode: RuntimeMode,
    pub action: DecisionAction,
    pub issue: AuditIssue,
}

impl AuditRecord {
    #[must_use]
    pub fn render_plain(&self) -> String {
        format!(
            "[{}::{:?}] {:?} {} ({})",
            self.issue.subject,
            self.action,
            self.issue.kind,
            self.issue.detail,
            self.mode.as_str()
        )
    }
}

/// Append-only record of every policy decision taken during a run.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLedger {
    records: Vec<AuditRecord>,
}

impl AuditLedger {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    pub fn push(&mut self, record: AuditRecord) {
        self.records.push(record);
    }

    #[must_use]
    pub fn records(&self) -> &[AuditRecord] {
        &self.records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn count(&self, kind: IssueKind, action: DecisionAction) -> usize {
        self.records
            .iter()
            .filter(|r| r.issue.kind == kind && r.action == action)
            .count()
    }

    pub fn extend(&mut self, other: AuditLedger) {
        self.records.extend(other.records);
    }
}

/// How the engine treats records it cannot group.
///
/// Strict fails the whole aggregation on the first incomplete record.
/// Hardened drops incomplete records (the dropna behaviour of a dataframe
/// groupby) and writes one audit record per dropped row. Both the incremental
/// and the full-recompute path must run under the same policy for their
/// results to be comparable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePolicy {
    pub mode: RuntimeMode,
    pub skip_incomplete_records: bool,
}

impl RuntimePolicy {
    #[must_use]
    pub fn strict() -> Self {
        Self {
            mode: RuntimeMode::Strict,
            skip_incomplete_records: false,
        }
    }

    #[must_use]
    pub fn hardened() -> Self {
        Self {
            mode: RuntimeMode::Hardened,
            skip_incomplete_records: true,
        }
    }

    #[must_use]
    pub fn for_mode(mode: RuntimeMode) -> Self {
        match mode {
            RuntimeMode::Strict => Self::strict(),
            RuntimeMode::Hardened => Self::hardened(),
        }
    }

    pub fn decide_incomplete_record(
        &self,
        subject: impl Into<String>,
        detail: impl Into<String>,
        ledger: &mut AuditLedger,
    ) -> DecisionAction {
        let action = if self.skip_incomplete_records {
            DecisionAction::Skip
        } else {
            DecisionAction::Reject
        };
        self.record(IssueKind::IncompleteRecord, subject, detail, action, ledger);
        action
    }

    /// Numeric drift is reported, never fatal.
    pub fn note_numeric_drift(
        &self,
        subject: impl Into<String>,
        detail: impl Into<String>,
        ledger: &mut AuditLedger,
    ) -> DecisionAction {
        self.record(
            IssueKind::NumericDrift,
            subject,
            detail,
            DecisionAction::Allow,
            ledger,
        );
        DecisionAction::Allow
    }

    fn record(
        &self,
        kind: IssueKind,
        subject: impl Into<String>,
        detail: impl Into<String>,
        action: DecisionAction,
        ledger: &mut AuditLedger,
    ) {
        ledger.push(AuditRecord {
            ts_unix_ms: now_unix_ms().unwrap_or_default(),
            mode: self.mode,
            action,
            issue: AuditIssue {
                kind,
                subject: subject.into(),
                detail: detail.into(),
            },
        });
    }
}

impl Default for RuntimePolicy {
    fn default() -> Self {
        Self::strict()
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("system clock is before UNIX_EPOCH")]
    ClockSkew,
}

pub fn now_unix_ms() -> Result<u64, RuntimeError> {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| RuntimeError::ClockSkew)?
        .as_millis();
    Ok(ms as u64)
}

/// FNV-1a over `label`, folded with `base`. Gives each stage of a run its own
/// reproducible seed from one user-facing seed.
#[must_use]
pub fn deterministic_seed(base: u64, label: &str) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325_u64 ^ base;
    for byte in label.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
