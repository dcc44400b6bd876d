use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::ImplementationPlan;

// ---------------------------------------------------------------------------
// WorkflowPhase
// ---------------------------------------------------------------------------

/// Phases of a single run, in strict forward order. `Completed` and
/// `Failed` are terminal; `Failed` is reachable from any non-terminal
/// phase, everything else only from its predecessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    Initializing,
    Cloning,
    BranchCreating,
    PlanGenerating,
    Implementing,
    Validating,
    Committing,
    Pushing,
    Completed,
    Failed,
}

impl WorkflowPhase {
    /// The single forward successor, or `None` for terminal phases.
    pub fn next(&self) -> Option<WorkflowPhase> {
        use WorkflowPhase::*;
        match self {
            Initializing => Some(Cloning),
            Cloning => Some(BranchCreating),
            BranchCreating => Some(PlanGenerating),
            PlanGenerating => Some(Implementing),
            Implementing => Some(Validating),
            Validating => Some(Committing),
            Committing => Some(Pushing),
            Pushing => Some(Completed),
            Completed | Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowPhase::Completed | WorkflowPhase::Failed)
    }

    /// Whether a transition to `target` is legal: the strict forward
    /// successor, or `Failed` from any non-terminal phase.
    pub fn can_advance_to(&self, target: WorkflowPhase) -> bool {
        if *self == target {
            return false;
        }
        if target == WorkflowPhase::Failed {
            return !self.is_terminal();
        }
        self.next() == Some(target)
    }
}

impl fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            WorkflowPhase::Initializing => "Initializing",
            WorkflowPhase::Cloning => "Cloning",
            WorkflowPhase::BranchCreating => "BranchCreating",
            WorkflowPhase::PlanGenerating => "PlanGenerating",
            WorkflowPhase::Implementing => "Implementing",
            WorkflowPhase::Validating => "Validating",
            WorkflowPhase::Committing => "Committing",
            WorkflowPhase::Pushing => "Pushing",
            WorkflowPhase::Completed => "Completed",
            WorkflowPhase::Failed => "Failed",
        };
        f.write_str(label)
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// An illegal phase transition was attempted. Phase order is strictly
    /// forward; only `Failed` may be entered out of order.
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: WorkflowPhase,
        to: WorkflowPhase,
    },
}

// ---------------------------------------------------------------------------
// WorkflowRunState
// ---------------------------------------------------------------------------

/// Durable snapshot of a run, persisted at every phase boundary.
///
/// Exclusively owned and mutated by the workflow runner, never
/// mid-tool-execution, so a crash loses at most work inside the current
/// phase. The recorded artifacts (`feature_branch`, `plan`,
/// `commit_hash`) double as completion markers consulted on resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRunState {
    pub run_id: Uuid,
    pub phase: WorkflowPhase,
    pub workdir: PathBuf,
    pub feature_branch: Option<String>,
    pub plan: Option<ImplementationPlan>,
    pub commit_hash: Option<String>,
    pub iteration_count: u32,
    pub llm_call_count: u32,
    /// True once the agent loop signalled completion (as opposed to
    /// exhausting its iteration budget).
    pub loop_complete: bool,
    pub started_at: DateTime<Utc>,
    pub last_checkpoint_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

impl WorkflowRunState {
    pub fn new(run_id: Uuid, workdir: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            phase: WorkflowPhase::Initializing,
            workdir,
            feature_branch: None,
            plan: None,
            commit_hash: None,
            iteration_count: 0,
            llm_call_count: 0,
            loop_complete: false,
            started_at: now,
            last_checkpoint_at: now,
            error_message: None,
        }
    }

    /// Advance to the next phase, validating the transition and stamping
    /// the checkpoint time.
    pub fn advance(&mut self, to: WorkflowPhase) -> Result<(), StateError> {
        if !self.phase.can_advance_to(to) {
            return Err(StateError::InvalidTransition {
                from: self.phase,
                to,
            });
        }
        tracing::debug!(run_id = %self.run_id, from = %self.phase, to = %to, "phase transition");
        self.phase = to;
        self.last_checkpoint_at = Utc::now();
        Ok(())
    }

    /// Force the terminal `Failed` phase, recording the error.
    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(run_id = %self.run_id, from = %self.phase, error = %message, "run failed");
        self.error_message = Some(message);
        if !self.phase.is_terminal() {
            self.phase = WorkflowPhase::Failed;
        }
        self.last_checkpoint_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
