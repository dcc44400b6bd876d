//! The bounded tool-calling loop that turns a plan into code changes.
//!
//! Every provider round-trip is one iteration, blocked tool calls
//! included. The loop ends when the model emits the completion
//! sentinel, the iteration budget runs out (that is an `Incomplete`
//! outcome, not a failure), cancellation is requested, or the model
//! produces too many consecutive useless responses.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use mx_core::config::AgentSettings;
use mx_core::types::{
    ActivityKind, ActivityRecord, AgentTask, ImplementationPlan, NotificationType, ToolErrorKind,
    ToolInvocation, ToolKind, ToolResult,
};
use mx_harness::provider::{LlmProvider, Message, ProviderError, ToolCall};
use mx_harness::retry::{retry_with_backoff, RetryPolicy};
use mx_harness::safety::{SafetyError, SafetyGate};
use mx_harness::toolset::{tool_specs, ToolExecutor};

use crate::notify::{Notifier, Recorder};
use crate::transcript::Transcript;

/// The model signals it is done by including this token in a text reply.
pub const COMPLETION_SENTINEL: &str = "IMPLEMENTATION_COMPLETE";

// ---------------------------------------------------------------------------
// Outcome + errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    /// The model declared completion.
    Completed,
    /// The iteration budget ran out first. Validation decides whether
    /// the partial work stands.
    Incomplete,
}

#[derive(Debug, Clone, Copy)]
pub struct LoopOutcome {
    pub status: LoopStatus,
    pub iterations: u32,
    pub llm_calls: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// Consecutive responses with neither a tool call nor the sentinel.
    #[error("model produced {count} consecutive unusable responses")]
    MalformedStreak { count: u32 },
    #[error("run cancelled")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// AgentLoop
// ---------------------------------------------------------------------------

pub struct AgentLoop {
    provider: Arc<dyn LlmProvider>,
    gate: SafetyGate,
    executor: ToolExecutor,
    max_iterations: u32,
    max_malformed: u32,
    budget_chars: usize,
    instructions: Option<String>,
    backoff: RetryPolicy,
}

impl AgentLoop {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        workdir: &Path,
        settings: &AgentSettings,
    ) -> Result<Self, SafetyError> {
        Ok(Self {
            provider,
            gate: SafetyGate::new(workdir, settings)?,
            executor: ToolExecutor::new(workdir, settings),
            max_iterations: settings.max_iterations,
            max_malformed: settings.max_malformed_responses,
            budget_chars: settings.transcript_budget_chars,
            instructions: settings.instructions.clone(),
            backoff: RetryPolicy::default(),
        })
    }

    /// Drive the implementation loop to one of its exits. Cancellation
    /// is only honored at the top of an iteration, never mid-tool.
    pub async fn run(
        &self,
        task: &AgentTask,
        plan: &ImplementationPlan,
        cancel: &AtomicBool,
        notifier: &Notifier,
        recorder: &Recorder,
    ) -> Result<LoopOutcome, LoopError> {
        let mut transcript = Transcript::new(
            vec![
                Message::system(implementation_system_prompt(self.instructions.as_deref())),
                Message::user(implementation_request(task, plan)),
            ],
            self.budget_chars,
        );

        let mut iterations = 0u32;
        let mut llm_calls = 0u32;
        let mut malformed_streak = 0u32;

        while iterations < self.max_iterations {
            if cancel.load(Ordering::SeqCst) {
                return Err(LoopError::Cancelled);
            }
            iterations += 1;

            let response = retry_with_backoff(self.backoff, ProviderError::is_retryable, || {
                self.provider.chat(transcript.messages(), Some(tool_specs()))
            })
            .await?;
            llm_calls += 1;

            if let Some(content) = &response.content {
                if content.contains(COMPLETION_SENTINEL) {
                    info!(iterations, "model declared implementation complete");
                    recorder.record(ActivityRecord::new(
                        task.id,
                        ActivityKind::Progress,
                        "implementation complete",
                    ));
                    return Ok(LoopOutcome {
                        status: LoopStatus::Completed,
                        iterations,
                        llm_calls,
                    });
                }
            }

            if response.tool_calls.is_empty() {
                malformed_streak += 1;
                warn!(iterations, malformed_streak, "response had no tool calls");
                if malformed_streak >= self.max_malformed {
                    return Err(LoopError::MalformedStreak {
                        count: malformed_streak,
                    });
                }
                transcript.push(Message::assistant(response.content.unwrap_or_default()));
                transcript.push(Message::user(format!(
                    "Continue implementing using the available tools. When every \
                     change is made, reply with {COMPLETION_SENTINEL}."
                )));
                continue;
            }
            malformed_streak = 0;

            transcript.push(assistant_turn(&response.content, &response.tool_calls));
            for call in &response.tool_calls {
                let result = self.dispatch(task, iterations, call, notifier, recorder).await;
                transcript.push(Message::tool_result(
                    call.id.clone(),
                    call.name.clone(),
                    render_result(&result),
                ));
            }
        }

        info!(
            iterations,
            "iteration budget exhausted, handing partial work to validation"
        );
        Ok(LoopOutcome {
            status: LoopStatus::Incomplete,
            iterations,
            llm_calls,
        })
    }

    /// Gate, execute, and record one tool call. Rejections and failures
    /// come back as results for the transcript, never as errors.
    async fn dispatch(
        &self,
        task: &AgentTask,
        iteration: u32,
        call: &ToolCall,
        notifier: &Notifier,
        recorder: &Recorder,
    ) -> ToolResult {
        let Some(kind) = ToolKind::from_name(&call.name) else {
            warn!(tool = %call.name, "model requested unknown tool");
            return ToolResult::error(
                ToolErrorKind::InvalidArguments,
                format!("unknown tool: {}", call.name),
            );
        };
        let invocation = ToolInvocation::new(kind, call.arguments.clone());

        // Step events announce work that actually ran; rejected calls
        // only show up in the activity ledger.
        let result = match self.gate.check(&invocation) {
            Ok(()) => {
                notifier
                    .publish(
                        task,
                        NotificationType::ImplementationStep,
                        format!("iteration {iteration}: {}", call.name),
                        json!({ "iteration": iteration, "tool": call.name }),
                    )
                    .await;
                self.executor.execute(&invocation).await
            }
            Err(rejection) => {
                warn!(tool = %call.name, reason = %rejection, "tool call blocked");
                ToolResult::blocked(format!(
                    "Tool call blocked by safety policy: {rejection}. \
                     Choose a different approach."
                ))
            }
        };

        recorder.record(
            ActivityRecord::new(task.id, ActivityKind::FunctionCall, call.name.clone())
                .with_details(json!({
                    "iteration": iteration,
                    "arguments": call.arguments,
                    "success": result.success,
                    "error_kind": result.error_kind,
                })),
        );
        result
    }
}

// ---------------------------------------------------------------------------
// Prompt + rendering helpers
// ---------------------------------------------------------------------------

fn implementation_system_prompt(instructions: Option<&str>) -> String {
    let mut prompt = format!(
        "You are an autonomous software engineer working inside a cloned \
         repository. Use the provided tools to inspect and modify the code. \
         Work through the plan step by step. When every change is in place, \
         reply with the single token {COMPLETION_SENTINEL} and nothing else."
    );
    if let Some(extra) = instructions {
        prompt.push_str("\n\nAdditional instructions:\n");
        prompt.push_str(extra);
    }
    prompt
}

fn implementation_request(task: &AgentTask, plan: &ImplementationPlan) -> String {
    let mut body = format!(
        "Task: {}\n\n{}\n\nPlan goal: {}\nSteps:\n",
        task.title, task.description, plan.goal
    );
    for (i, step) in plan.steps.iter().enumerate() {
        body.push_str(&format!("{}. {step}\n", i + 1));
    }
    if !plan.validation_criteria.is_empty() {
        body.push_str("\nValidation criteria:\n");
        for criterion in &plan.validation_criteria {
            body.push_str("- ");
            body.push_str(criterion);
            body.push('\n');
        }
    }
    body
}

/// The assistant turn as replayed to the model: its text, if any, plus a
/// compact rendering of the calls it made.
fn assistant_turn(content: &Option<String>, calls: &[ToolCall]) -> Message {
    let mut turn = content.clone().unwrap_or_default();
    for call in calls {
        if !turn.is_empty() {
            turn.push('\n');
        }
        turn.push_str(&format!("[tool_call {}] {}({})", call.id, call.name, call.arguments));
    }
    Message::assistant(turn)
}

fn render_result(result: &ToolResult) -> String {
    if result.success {
        result.output.clone()
    } else {
        format!("error[{:?}]: {}", result.error_kind, result.output)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{ChannelSink, LogSink};
    use mx_harness::provider::{ChatResponse, ScriptedProvider};
    use uuid::Uuid;

    fn task() -> AgentTask {
        AgentTask::new("acme", "proj-1", "Add greeting", "Print a greeting")
    }

    fn plan() -> ImplementationPlan {
        ImplementationPlan {
            goal: "print a greeting".into(),
            steps: vec!["write main.rs".into()],
            files_to_create: vec!["main.rs".into()],
            files_to_modify: vec![],
            estimated_steps: 1,
            validation_criteria: vec![],
        }
    }

    fn notifier() -> Notifier {
        Notifier::new(Arc::new(LogSink), "muskox.workflows", Uuid::new_v4())
    }

    fn agent_loop(
        dir: &Path,
        settings: &AgentSettings,
        script: Vec<ChatResponse>,
    ) -> (AgentLoop, Arc<ScriptedProvider>) {
        let provider = Arc::new(ScriptedProvider::replaying(script));
        let agent = AgentLoop::new(provider.clone(), dir, settings).unwrap();
        (agent, provider)
    }

    #[tokio::test]
    async fn sentinel_ends_the_loop_as_completed() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _) = agent_loop(
            dir.path(),
            &AgentSettings::default(),
            vec![
                ChatResponse::tool_call(
                    "write_file",
                    json!({ "file_path": "main.rs", "content": "fn main() {}" }),
                ),
                ChatResponse::text(format!("All done. {COMPLETION_SENTINEL}")),
            ],
        );

        let outcome = agent
            .run(&task(), &plan(), &AtomicBool::new(false), &notifier(), &Recorder::disabled())
            .await
            .unwrap();

        assert_eq!(outcome.status, LoopStatus::Completed);
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.llm_calls, 2);
        let written = std::fs::read_to_string(dir.path().join("main.rs")).unwrap();
        assert_eq!(written, "fn main() {}");
    }

    #[tokio::test]
    async fn blocked_call_is_fed_back_and_counts_an_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, provider) = agent_loop(
            dir.path(),
            &AgentSettings::default(),
            vec![
                ChatResponse::tool_call("run_shell_command", json!({ "command": "rm -rf /" })),
                ChatResponse::text(COMPLETION_SENTINEL),
            ],
        );

        let outcome = agent
            .run(&task(), &plan(), &AtomicBool::new(false), &notifier(), &Recorder::disabled())
            .await
            .unwrap();

        assert_eq!(outcome.status, LoopStatus::Completed);
        assert_eq!(outcome.iterations, 2);

        // The second call's transcript carries the rejection feedback.
        let transcripts = provider.recorded_transcripts();
        let feedback = transcripts[1]
            .iter()
            .find(|m| m.tool_call_id.is_some())
            .unwrap();
        assert!(feedback.content.contains("Blocked"));
        assert!(feedback.content.contains("safety policy"));
    }

    #[tokio::test]
    async fn only_executed_calls_emit_step_events() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = flume::unbounded();
        let notifier = Notifier::new(
            Arc::new(ChannelSink::new(tx)),
            "muskox.workflows",
            Uuid::new_v4(),
        );
        let (agent, _) = agent_loop(
            dir.path(),
            &AgentSettings::default(),
            vec![
                ChatResponse::tool_call("run_shell_command", json!({ "command": "rm -rf /" })),
                ChatResponse::tool_call("list_directory", json!({})),
                ChatResponse::text(COMPLETION_SENTINEL),
            ],
        );

        agent
            .run(&task(), &plan(), &AtomicBool::new(false), &notifier, &Recorder::disabled())
            .await
            .unwrap();

        let steps: Vec<_> = rx
            .drain()
            .filter(|(_, e)| e.notification_type == NotificationType::ImplementationStep)
            .collect();
        // The blocked shell call produced none; the directory listing did.
        assert_eq!(steps.len(), 1);
        assert!(steps[0].1.message.contains("list_directory"));
    }

    #[tokio::test]
    async fn budget_exhaustion_is_incomplete_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = AgentSettings::default();
        settings.max_iterations = 2;
        let (agent, _) = agent_loop(
            dir.path(),
            &settings,
            vec![
                ChatResponse::tool_call("list_directory", json!({})),
                ChatResponse::tool_call("list_directory", json!({})),
            ],
        );

        let outcome = agent
            .run(&task(), &plan(), &AtomicBool::new(false), &notifier(), &Recorder::disabled())
            .await
            .unwrap();

        assert_eq!(outcome.status, LoopStatus::Incomplete);
        assert_eq!(outcome.iterations, 2);
    }

    #[tokio::test]
    async fn malformed_streak_fails_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = AgentSettings::default();
        settings.max_malformed_responses = 2;
        let (agent, _) = agent_loop(
            dir.path(),
            &settings,
            vec![
                ChatResponse::text("let me think about this"),
                ChatResponse::text("still thinking"),
            ],
        );

        let err = agent
            .run(&task(), &plan(), &AtomicBool::new(false), &notifier(), &Recorder::disabled())
            .await
            .unwrap_err();
        assert!(matches!(err, LoopError::MalformedStreak { count: 2 }));
    }

    #[tokio::test]
    async fn useful_response_resets_the_malformed_streak() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = AgentSettings::default();
        settings.max_malformed_responses = 2;
        let (agent, _) = agent_loop(
            dir.path(),
            &settings,
            vec![
                ChatResponse::text("thinking"),
                ChatResponse::tool_call("list_directory", json!({})),
                ChatResponse::text("thinking again"),
                ChatResponse::text(COMPLETION_SENTINEL),
            ],
        );

        let outcome = agent
            .run(&task(), &plan(), &AtomicBool::new(false), &notifier(), &Recorder::disabled())
            .await
            .unwrap();
        assert_eq!(outcome.status, LoopStatus::Completed);
        assert_eq!(outcome.iterations, 4);
    }

    #[tokio::test]
    async fn cancellation_is_honored_before_any_call() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, provider) = agent_loop(
            dir.path(),
            &AgentSettings::default(),
            vec![ChatResponse::text(COMPLETION_SENTINEL)],
        );

        let err = agent
            .run(&task(), &plan(), &AtomicBool::new(true), &notifier(), &Recorder::disabled())
            .await
            .unwrap_err();
        assert!(matches!(err, LoopError::Cancelled));
        assert_eq!(provider.calls_made(), 0);
    }

    #[tokio::test]
    async fn unknown_tool_is_invalid_arguments_feedback() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, provider) = agent_loop(
            dir.path(),
            &AgentSettings::default(),
            vec![
                ChatResponse::tool_call("launch_missiles", json!({})),
                ChatResponse::text(COMPLETION_SENTINEL),
            ],
        );

        let outcome = agent
            .run(&task(), &plan(), &AtomicBool::new(false), &notifier(), &Recorder::disabled())
            .await
            .unwrap();
        assert_eq!(outcome.status, LoopStatus::Completed);

        let transcripts = provider.recorded_transcripts();
        let feedback = transcripts[1]
            .iter()
            .find(|m| m.tool_call_id.is_some())
            .unwrap();
        assert!(feedback.content.contains("unknown tool"));
    }

    #[tokio::test]
    async fn custom_instructions_reach_the_system_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = AgentSettings::default();
        settings.instructions = Some("Always write tests first.".into());
        let (agent, provider) = agent_loop(
            dir.path(),
            &settings,
            vec![ChatResponse::text(COMPLETION_SENTINEL)],
        );

        agent
            .run(&task(), &plan(), &AtomicBool::new(false), &notifier(), &Recorder::disabled())
            .await
            .unwrap();

        let transcripts = provider.recorded_transcripts();
        assert!(transcripts[0][0].content.contains("Always write tests first."));
    }

    #[tokio::test]
    async fn function_calls_land_in_the_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(mx_core::ledger::ActivityLedger::in_memory().unwrap());
        let recorder = Recorder::new(ledger.clone());
        let (agent, _) = agent_loop(
            dir.path(),
            &AgentSettings::default(),
            vec![
                ChatResponse::tool_call("list_directory", json!({})),
                ChatResponse::text(COMPLETION_SENTINEL),
            ],
        );
        let t = task();

        agent
            .run(&t, &plan(), &AtomicBool::new(false), &notifier(), &recorder)
            .await
            .unwrap();

        let rows = ledger.for_task(&t.id).unwrap();
        assert!(rows
            .iter()
            .any(|r| r.kind == ActivityKind::FunctionCall && r.message == "list_directory"));
    }
}
