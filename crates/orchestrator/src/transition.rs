//! Transition phases and the record kept of each transition.

use chrono::{DateTime, Utc};
use serde::Serialize;

use framebridge_device_model::OutputKey;

/// Phase of the output transition state machine.
///
/// `Idle -> Validating -> StagedApply -> (Committed | RollingBack) -> Idle`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionPhase {
    Idle,
    Validating,
    StagedApply,
    Committed,
    RollingBack,
}

impl TransitionPhase {
    /// Whether `next` may follow `self`.
    pub fn can_advance_to(self, next: TransitionPhase) -> bool {
        use TransitionPhase::*;
        matches!(
            (self, next),
            (Idle, Validating)
                | (Validating, StagedApply)
                | (Validating, Idle)
                | (StagedApply, Committed)
                | (StagedApply, RollingBack)
                | (Committed, Idle)
                | (RollingBack, Idle)
        )
    }
}

/// How a transition settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionOutcome {
    /// The new configuration is live.
    Committed,
    /// Validation failed; nothing was touched.
    Rejected,
    /// Staged apply failed and the last-known-good output is live.
    RolledBack,
    /// Staged apply failed with nothing to roll back to.
    Failed,
    /// Staged apply and rollback both failed; the session is in error.
    RollbackFailed,
}

impl TransitionOutcome {
    pub fn is_committed(self) -> bool {
        self == Self::Committed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseRecord {
    pub phase: TransitionPhase,
    pub at: DateTime<Utc>,
}

/// Record of one transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionReport {
    pub id: u64,
    pub requested: OutputKey,
    pub phases: Vec<PhaseRecord>,
    pub outcome: Option<TransitionOutcome>,
    /// Error that failed validation or the staged apply.
    pub error: Option<String>,
    /// Error that failed the rollback.
    pub rollback_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TransitionReport {
    pub(crate) fn new(id: u64, requested: OutputKey) -> Self {
        let now = Utc::now();
        Self {
            id,
            requested,
            phases: vec![PhaseRecord {
                phase: TransitionPhase::Idle,
                at: now,
            }],
            outcome: None,
            error: None,
            rollback_error: None,
            started_at: now,
            finished_at: None,
        }
    }

    pub fn phase(&self) -> TransitionPhase {
        self.phases
            .last()
            .map(|record| record.phase)
            .unwrap_or(TransitionPhase::Idle)
    }

    pub(crate) fn advance(&mut self, next: TransitionPhase) {
        debug_assert!(
            self.phase().can_advance_to(next),
            "illegal transition {:?} -> {next:?}",
            self.phase()
        );
        tracing::debug!(transition = self.id, from = ?self.phase(), to = ?next, "Transition phase");
        self.phases.push(PhaseRecord {
            phase: next,
            at: Utc::now(),
        });
    }

    pub(crate) fn finish(&mut self, outcome: TransitionOutcome) {
        if self.phase() != TransitionPhase::Idle {
            self.advance(TransitionPhase::Idle);
        }
        self.outcome = Some(outcome);
        self.finished_at = Some(Utc::now());
    }

    /// Phases visited, in order.
    pub fn path(&self) -> Vec<TransitionPhase> {
        self.phases.iter().map(|record| record.phase).collect()
    }

    pub fn is_committed(&self) -> bool {
        self.outcome.map(TransitionOutcome::is_committed).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TransitionPhase::*;

    #[test]
    fn only_documented_edges_are_legal() {
        assert!(Idle.can_advance_to(Validating));
        assert!(StagedApply.can_advance_to(RollingBack));
        assert!(!Idle.can_advance_to(Committed));
        assert!(!Validating.can_advance_to(Committed));
        assert!(!Committed.can_advance_to(RollingBack));
    }

    #[test]
    fn committed_path() {
        let mut report = TransitionReport::new(1, OutputKey::Display);
        report.advance(Validating);
        report.advance(StagedApply);
        report.advance(Committed);
        report.finish(TransitionOutcome::Committed);
        assert_eq!(report.path(), vec![Idle, Validating, StagedApply, Committed, Idle]);
        assert!(report.is_committed());
        assert!(report.finished_at.is_some());
    }

    #[test]
    fn rejected_path_skips_staging() {
        let mut report = TransitionReport::new(2, OutputKey::Video);
        report.advance(Validating);
        report.finish(TransitionOutcome::Rejected);
        assert_eq!(report.path(), vec![Idle, Validating, Idle]);
        assert!(!report.is_committed());
    }
}
