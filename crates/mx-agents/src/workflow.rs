//! The workflow runner: drives a task through the phase ladder with a
//! checkpoint at every boundary.
//!
//! Side effects are guarded by artifact markers (an existing clone, a
//! recorded branch name, a recorded plan or commit hash), so a resumed
//! run skips work that already happened instead of repeating it. The
//! runner always produces a [`RunReport`], success or not.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use mx_core::checkpoint::{CheckpointError, CheckpointStore};
use mx_core::config::AgentSettings;
use mx_core::git::{self, GitBackend, GitError};
use mx_core::ledger::ActivityLedger;
use mx_core::state::{StateError, WorkflowPhase, WorkflowRunState};
use mx_core::types::{
    branch_name_for, ActivityKind, ActivityRecord, AgentTask, NotificationType, RunReport,
    RunRequest, ToolInvocation, ToolKind, ValidationResult,
};
use mx_harness::provider::LlmProvider;
use mx_harness::retry::{retry_with_backoff, RetryPolicy};
use mx_harness::safety::SafetyError;
use mx_harness::toolset::ToolExecutor;

use crate::agent_loop::{AgentLoop, LoopError, LoopStatus};
use crate::notify::{LogSink, NotificationSink, Notifier, Recorder};
use crate::planner::{PlanGenerator, PlanningError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Planning(#[from] PlanningError),
    #[error(transparent)]
    Loop(#[from] LoopError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Safety(#[from] SafetyError),
    #[error("no plan recorded before implementation")]
    MissingPlan,
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    #[error("run exceeded its wall-clock budget")]
    TimedOut,
    #[error("run cancelled")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// WorkflowRunner
// ---------------------------------------------------------------------------

pub struct WorkflowRunner {
    settings: AgentSettings,
    provider: Arc<dyn LlmProvider>,
    git: Arc<dyn GitBackend>,
    checkpoints: CheckpointStore,
    sink: Arc<dyn NotificationSink>,
    ledger: Option<Arc<ActivityLedger>>,
    workdir_base: PathBuf,
    cancel: Arc<AtomicBool>,
    git_backoff: RetryPolicy,
}

impl WorkflowRunner {
    pub fn new(
        settings: AgentSettings,
        provider: Arc<dyn LlmProvider>,
        git: Arc<dyn GitBackend>,
        checkpoints: CheckpointStore,
        workdir_base: impl Into<PathBuf>,
    ) -> Self {
        Self {
            settings,
            provider,
            git,
            checkpoints,
            sink: Arc::new(LogSink),
            ledger: None,
            workdir_base: workdir_base.into(),
            cancel: Arc::new(AtomicBool::new(false)),
            git_backoff: RetryPolicy::default(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<ActivityLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Shared flag a supervisor can set to request cancellation. Honored
    /// at phase boundaries and iteration tops, never mid-side-effect.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Execute (or resume) the run for `request`. Never returns an error:
    /// failures are folded into the report.
    pub async fn run(&self, request: RunRequest) -> RunReport {
        let started = std::time::Instant::now();
        let task = &request.task;
        // Runs are keyed by task id so a restarted worker finds the
        // checkpoint of the run it is taking over.
        let run_id = task.id;
        let notifier = Notifier::new(self.sink.clone(), self.settings.subject_prefix.clone(), run_id);
        let recorder = match &self.ledger {
            Some(ledger) => Recorder::new(ledger.clone()),
            None => Recorder::disabled(),
        };

        let mut state = self.load_or_create_state(run_id);
        let mut validation = None;

        let outcome = self
            .drive(&request, &mut state, &notifier, &recorder, &mut validation)
            .await;

        let success = match outcome {
            Ok(()) => state.phase == WorkflowPhase::Completed,
            Err(e) => {
                state.fail(e.to_string());
                if let Err(save_err) = self.checkpoints.save(&state) {
                    warn!(run_id = %run_id, error = %save_err, "failed to persist failure state");
                }
                recorder.record(ActivityRecord::new(task.id, ActivityKind::Error, e.to_string()));
                notifier
                    .publish(task, NotificationType::WorkflowFailed, e.to_string(), json!(null))
                    .await;
                // Best-effort: the checkpoint stays for the post-mortem,
                // the working copy does not.
                if state.workdir.exists() {
                    if let Err(cleanup_err) = std::fs::remove_dir_all(&state.workdir) {
                        warn!(
                            workdir = %state.workdir.display(),
                            error = %cleanup_err,
                            "failed to clean workdir"
                        );
                    }
                }
                false
            }
        };

        if success {
            notifier
                .publish(
                    task,
                    NotificationType::WorkflowCompleted,
                    format!("completed after {} iterations", state.iteration_count),
                    json!({
                        "branch": state.feature_branch,
                        "commit": state.commit_hash,
                    }),
                )
                .await;
            // The run is over; nothing left to resume.
            if let Err(e) = self.checkpoints.delete(&run_id) {
                warn!(run_id = %run_id, error = %e, "failed to delete checkpoint");
            }
            if let Err(e) = std::fs::remove_dir_all(&state.workdir) {
                warn!(workdir = %state.workdir.display(), error = %e, "failed to clean workdir");
            }
        }

        RunReport {
            success,
            workflow_id: run_id,
            company_id: task.company_id.clone(),
            project_id: task.project_id.clone(),
            task_id: task.id,
            branch_name: state.feature_branch.clone(),
            commit_hash: state.commit_hash.clone(),
            plan: state.plan.clone(),
            steps_completed: state.iteration_count,
            validation,
            error_message: state.error_message.clone(),
            execution_time_secs: started.elapsed().as_secs_f64(),
            llm_call_count: state.llm_call_count,
        }
    }

    fn load_or_create_state(&self, run_id: Uuid) -> WorkflowRunState {
        match self.checkpoints.load(&run_id) {
            Ok(Some(state)) if !state.phase.is_terminal() => {
                info!(run_id = %run_id, phase = %state.phase, "resuming from checkpoint");
                state
            }
            Ok(_) => WorkflowRunState::new(run_id, self.workdir_base.join(run_id.to_string())),
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "unreadable checkpoint, starting fresh");
                WorkflowRunState::new(run_id, self.workdir_base.join(run_id.to_string()))
            }
        }
    }

    async fn drive(
        &self,
        request: &RunRequest,
        state: &mut WorkflowRunState,
        notifier: &Notifier,
        recorder: &Recorder,
        validation: &mut Option<ValidationResult>,
    ) -> Result<(), WorkflowError> {
        let task = &request.task;
        let deadline = state.started_at
            + chrono::Duration::from_std(self.settings.run_timeout())
                .unwrap_or_else(|_| chrono::Duration::hours(24));

        loop {
            if self.cancel.load(Ordering::SeqCst) {
                return Err(WorkflowError::Cancelled);
            }
            if Utc::now() >= deadline {
                return Err(WorkflowError::TimedOut);
            }

            match state.phase {
                WorkflowPhase::Initializing => {
                    notifier
                        .publish(
                            task,
                            NotificationType::WorkflowStarted,
                            format!("starting work on: {}", task.title),
                            json!({ "run_id": state.run_id }),
                        )
                        .await;
                    recorder.record(ActivityRecord::new(
                        task.id,
                        ActivityKind::Progress,
                        "workflow started",
                    ));
                    state.advance(WorkflowPhase::Cloning)?;
                    self.checkpoints.save(state)?;
                }

                WorkflowPhase::Cloning => {
                    if !state.workdir.join(".git").exists() {
                        retry_with_backoff(self.git_backoff, GitError::is_retryable, || {
                            self.git.clone_repo(&request.repository, &state.workdir)
                        })
                        .await?;
                    }
                    notifier
                        .publish(
                            task,
                            NotificationType::RepoCloned,
                            "repository cloned",
                            json!({ "base_branch": request.repository.base_branch }),
                        )
                        .await;
                    state.advance(WorkflowPhase::BranchCreating)?;
                    self.checkpoints.save(state)?;
                }

                WorkflowPhase::BranchCreating => {
                    if state.feature_branch.is_none() {
                        let name = branch_name_for(task, Utc::now().date_naive());
                        self.git.create_branch(&state.workdir, &name).await?;
                        state.feature_branch = Some(name);
                    }
                    notifier
                        .publish(
                            task,
                            NotificationType::BranchCreated,
                            "feature branch created",
                            json!({ "branch": state.feature_branch }),
                        )
                        .await;
                    state.advance(WorkflowPhase::PlanGenerating)?;
                    self.checkpoints.save(state)?;
                }

                WorkflowPhase::PlanGenerating => {
                    if state.plan.is_none() {
                        let planner = PlanGenerator::new(self.provider.clone(), &self.settings);
                        let outcome = planner.generate(task).await?;
                        state.llm_call_count += outcome.llm_calls;
                        state.plan = Some(outcome.plan);
                    }
                    let steps = state.plan.as_ref().map(|p| p.steps.len()).unwrap_or(0);
                    notifier
                        .publish(
                            task,
                            NotificationType::PlanCreated,
                            format!("plan with {steps} steps"),
                            json!({ "steps": steps }),
                        )
                        .await;
                    state.advance(WorkflowPhase::Implementing)?;
                    self.checkpoints.save(state)?;
                }

                WorkflowPhase::Implementing => {
                    let plan = state.plan.clone().ok_or(WorkflowError::MissingPlan)?;
                    notifier
                        .publish(
                            task,
                            NotificationType::ImplementationStarted,
                            "implementation started",
                            json!(null),
                        )
                        .await;
                    let agent =
                        AgentLoop::new(self.provider.clone(), &state.workdir, &self.settings)?;
                    let outcome = agent
                        .run(task, &plan, &self.cancel, notifier, recorder)
                        .await?;
                    state.iteration_count = outcome.iterations;
                    state.llm_call_count += outcome.llm_calls;
                    state.loop_complete = outcome.status == LoopStatus::Completed;
                    state.advance(WorkflowPhase::Validating)?;
                    self.checkpoints.save(state)?;
                }

                WorkflowPhase::Validating => {
                    notifier
                        .publish(
                            task,
                            NotificationType::ValidationStarted,
                            "validating changes",
                            json!(null),
                        )
                        .await;
                    let result = self.validate(state).await;
                    notifier
                        .publish(
                            task,
                            NotificationType::ValidationCompleted,
                            if result.success {
                                "validation passed"
                            } else {
                                "validation failed"
                            },
                            json!({ "success": result.success, "issues": result.issues }),
                        )
                        .await;
                    let failed = !result.success;
                    let summary = result.issues.join("; ");
                    *validation = Some(result);
                    if failed {
                        return Err(WorkflowError::ValidationFailed(summary));
                    }
                    state.advance(WorkflowPhase::Committing)?;
                    self.checkpoints.save(state)?;
                }

                WorkflowPhase::Committing => {
                    if state.commit_hash.is_none() {
                        let message = commit_message(task, state);
                        match self.git.commit_all(&state.workdir, &message).await? {
                            Some(hash) => {
                                state.commit_hash = Some(hash.clone());
                                notifier
                                    .publish(
                                        task,
                                        NotificationType::ChangesCommitted,
                                        "changes committed",
                                        json!({ "commit": hash }),
                                    )
                                    .await;
                            }
                            None => {
                                // Tolerated: resume paths can land here with
                                // an already-clean tree.
                                warn!(run_id = %state.run_id, "nothing to commit");
                            }
                        }
                    }
                    state.advance(WorkflowPhase::Pushing)?;
                    self.checkpoints.save(state)?;
                }

                WorkflowPhase::Pushing => {
                    let branch = state.feature_branch.clone();
                    if let (Some(branch), Some(_)) = (branch, &state.commit_hash) {
                        retry_with_backoff(self.git_backoff, GitError::is_retryable, || {
                            self.git
                                .push_branch(&state.workdir, &request.repository, &branch)
                        })
                        .await?;
                        notifier
                            .publish(
                                task,
                                NotificationType::ChangesPushed,
                                "changes pushed",
                                json!({ "branch": branch }),
                            )
                            .await;
                    }
                    state.advance(WorkflowPhase::Completed)?;
                    self.checkpoints.save(state)?;
                }

                WorkflowPhase::Completed | WorkflowPhase::Failed => return Ok(()),
            }
        }
    }

    /// Inspect what the loop produced: working-tree changes via the git
    /// read helpers, plus a test-suite probe when the project has a
    /// recognizable toolchain.
    async fn validate(&self, state: &WorkflowRunState) -> ValidationResult {
        let mut issues = Vec::new();
        let mut suggestions = Vec::new();
        let mut tests_passed = 0;
        let mut tests_failed = 0;

        let changed = match git::status_entries(&state.workdir) {
            Ok(entries) => entries,
            Err(e) => {
                issues.push(format!("cannot inspect working tree: {e}"));
                Vec::new()
            }
        };
        if changed.is_empty() && issues.is_empty() {
            // A clean tree is not a failure; the commit phase will simply
            // find nothing to commit.
            suggestions.push("implementation left the working tree unchanged".to_string());
        }
        if let Ok(stat) = git::diff_stat(&state.workdir) {
            info!(
                files_changed = stat.files_changed,
                insertions = stat.insertions,
                deletions = stat.deletions,
                "working-tree diff"
            );
        }
        if !state.loop_complete {
            suggestions.push(
                "iteration budget exhausted before the model declared completion".to_string(),
            );
        }

        if let Some(command) = detect_test_command(&state.workdir) {
            let executor = ToolExecutor::new(&state.workdir, &self.settings);
            let invocation =
                ToolInvocation::new(ToolKind::RunShellCommand, json!({ "command": command }));
            let result = executor.execute(&invocation).await;
            if result.success {
                tests_passed = 1;
            } else {
                tests_failed = 1;
                issues.push(format!("test suite failed: {}", tail(&result.output, 500)));
            }
        }

        ValidationResult {
            success: issues.is_empty(),
            issues,
            suggestions,
            tests_passed,
            tests_failed,
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn commit_message(task: &AgentTask, state: &WorkflowRunState) -> String {
    let mut message = format!("feat: {}", task.title);
    if let Some(plan) = &state.plan {
        message.push_str("\n\n");
        message.push_str(&plan.goal);
    }
    message.push_str(&format!("\n\nTask-Id: {}", task.id));
    message
}

/// Probe command for the project's test suite, by toolchain marker.
fn detect_test_command(workdir: &Path) -> Option<&'static str> {
    if workdir.join("Cargo.toml").exists() {
        Some("cargo test --quiet")
    } else if workdir.join("package.json").exists() {
        Some("npm test --silent")
    } else if workdir.join("pyproject.toml").exists() || workdir.join("setup.py").exists() {
        Some("python -m pytest -q")
    } else {
        None
    }
}

fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let cut = text.len() - max;
    // Don't split a UTF-8 sequence.
    let mut start = cut;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
