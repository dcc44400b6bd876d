//! One-shot plan generation with corrective retries.
//!
//! The planner makes a single chat call asking for a JSON plan. When the
//! model wraps the JSON in prose or returns something that fails schema
//! validation, the malformed output and the validation error are fed
//! back as a corrective turn, up to a configured retry budget.

use std::sync::Arc;

use tracing::{info, warn};

use mx_core::config::AgentSettings;
use mx_core::types::{AgentTask, ImplementationPlan};
use mx_harness::provider::{LlmProvider, Message, ProviderError};
use mx_harness::retry::{retry_with_backoff, RetryPolicy};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PlanningError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// Every attempt produced unusable output. Carries the last reason.
    #[error("no valid plan after {attempts} attempts: {last_error}")]
    Invalid { attempts: u32, last_error: String },
}

// ---------------------------------------------------------------------------
// PlanGenerator
// ---------------------------------------------------------------------------

/// A validated plan plus the provider calls it took to get one.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub plan: ImplementationPlan,
    pub llm_calls: u32,
}

pub struct PlanGenerator {
    provider: Arc<dyn LlmProvider>,
    retries: u32,
    instructions: Option<String>,
    backoff: RetryPolicy,
}

impl PlanGenerator {
    pub fn new(provider: Arc<dyn LlmProvider>, settings: &AgentSettings) -> Self {
        Self {
            provider,
            retries: settings.plan_retries,
            instructions: settings.instructions.clone(),
            backoff: RetryPolicy::default(),
        }
    }

    /// Produce a validated plan for `task`.
    pub async fn generate(&self, task: &AgentTask) -> Result<PlanOutcome, PlanningError> {
        let mut system = PLAN_SYSTEM_PROMPT.to_string();
        if let Some(extra) = &self.instructions {
            system.push_str("\n\nAdditional instructions:\n");
            system.push_str(extra);
        }
        let mut messages = vec![Message::system(system), plan_request(task)];
        let attempts = self.retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let response = retry_with_backoff(
                self.backoff,
                ProviderError::is_retryable,
                || self.provider.chat(messages.clone(), None),
            )
            .await?;
            let text = response.content.unwrap_or_default();

            match parse_plan(&text) {
                Ok(plan) => {
                    info!(
                        attempt,
                        steps = plan.steps.len(),
                        goal = %plan.goal,
                        "plan generated"
                    );
                    return Ok(PlanOutcome {
                        plan,
                        llm_calls: attempt,
                    });
                }
                Err(reason) => {
                    warn!(attempt, reason = %reason, "discarding unusable plan output");
                    last_error = reason.clone();
                    messages.push(Message::assistant(text));
                    messages.push(Message::user(format!(
                        "Your previous response was not a usable plan: {reason}. \
                         Respond again with ONLY the JSON object, no surrounding text."
                    )));
                }
            }
        }

        Err(PlanningError::Invalid {
            attempts,
            last_error,
        })
    }
}

const PLAN_SYSTEM_PROMPT: &str = "\
You are a senior software engineer planning the implementation of a coding task.
Respond with a single JSON object and nothing else, using exactly these fields:
{
  \"goal\": \"one-sentence restatement of the task\",
  \"steps\": [\"ordered implementation steps\"],
  \"files_to_create\": [\"paths\"],
  \"files_to_modify\": [\"paths\"],
  \"estimated_steps\": <number of steps>,
  \"validation_criteria\": [\"how to verify the work\"]
}";

fn plan_request(task: &AgentTask) -> Message {
    let mut body = format!("Task: {}\n\n{}", task.title, task.description);
    if !task.requirements.is_empty() {
        body.push_str("\n\nRequirements:\n");
        for req in &task.requirements {
            body.push_str("- ");
            body.push_str(req);
            body.push('\n');
        }
    }
    Message::user(body)
}

/// Parse and validate a plan from model output, tolerating surrounding
/// prose and markdown fences.
fn parse_plan(text: &str) -> Result<ImplementationPlan, String> {
    let json = extract_json_object(text).ok_or_else(|| "no JSON object found".to_string())?;
    let plan: ImplementationPlan =
        serde_json::from_str(json).map_err(|e| format!("invalid plan JSON: {e}"))?;
    plan.validate()?;
    Ok(plan)
}

/// The first balanced `{...}` region of `text`, respecting JSON string
/// literals so braces inside strings don't confuse the scan.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use mx_harness::provider::{ChatResponse, ScriptedProvider};

    fn task() -> AgentTask {
        AgentTask::new("acme", "proj-1", "Add login", "Add a login endpoint")
    }

    fn valid_plan_json() -> &'static str {
        r#"{
            "goal": "Add a login endpoint",
            "steps": ["add handler", "add route", "add tests"],
            "files_to_create": ["src/login.rs"],
            "files_to_modify": ["src/routes.rs"],
            "estimated_steps": 3,
            "validation_criteria": ["cargo test passes"]
        }"#
    }

    fn generator(provider: ScriptedProvider) -> PlanGenerator {
        PlanGenerator::new(Arc::new(provider), &AgentSettings::default())
    }

    #[tokio::test]
    async fn clean_json_parses_first_try() {
        let gen = generator(ScriptedProvider::replaying(vec![ChatResponse::text(
            valid_plan_json(),
        )]));
        let outcome = gen.generate(&task()).await.unwrap();
        assert_eq!(outcome.plan.steps.len(), 3);
        assert_eq!(outcome.plan.estimated_steps, 3);
        assert_eq!(outcome.llm_calls, 1);
    }

    #[tokio::test]
    async fn json_wrapped_in_prose_is_extracted() {
        let wrapped = format!(
            "Sure! Here is the plan:\n```json\n{}\n```\nLet me know.",
            valid_plan_json()
        );
        let gen = generator(ScriptedProvider::replaying(vec![ChatResponse::text(wrapped)]));
        let outcome = gen.generate(&task()).await.unwrap();
        assert_eq!(outcome.plan.goal, "Add a login endpoint");
    }

    #[tokio::test]
    async fn malformed_output_triggers_corrective_retry() {
        let provider = ScriptedProvider::replaying(vec![
            ChatResponse::text("I think we should start by reading the code."),
            ChatResponse::text(valid_plan_json()),
        ]);
        let provider = Arc::new(provider);
        let gen = PlanGenerator::new(provider.clone(), &AgentSettings::default());

        let outcome = gen.generate(&task()).await.unwrap();
        assert_eq!(outcome.plan.steps.len(), 3);
        assert_eq!(outcome.llm_calls, 2);
        assert_eq!(provider.calls_made(), 2);

        // The second call carries the corrective feedback.
        let transcripts = provider.recorded_transcripts();
        let second = &transcripts[1];
        assert!(second.last().unwrap().content.contains("ONLY the JSON object"));
    }

    #[tokio::test]
    async fn gives_up_after_retry_budget() {
        let provider = ScriptedProvider::replaying(vec![
            ChatResponse::text("not json"),
            ChatResponse::text("{\"goal\": \"x\", \"steps\": [], \"estimated_steps\": 0}"),
            ChatResponse::text("still not json"),
        ]);
        let provider = Arc::new(provider);
        let gen = PlanGenerator::new(provider.clone(), &AgentSettings::default());

        let err = gen.generate(&task()).await.unwrap_err();
        assert!(matches!(err, PlanningError::Invalid { attempts: 3, .. }));
        assert_eq!(provider.calls_made(), 3);
    }

    #[tokio::test]
    async fn provider_errors_propagate() {
        let gen = generator(ScriptedProvider::new(vec![Err(ProviderError::Api(
            "boom".into(),
        ))]));
        let err = gen.generate(&task()).await.unwrap_err();
        assert!(matches!(err, PlanningError::Provider(_)));
    }

    #[test]
    fn json_extraction_respects_string_literals() {
        let text = r#"prefix {"a": "brace } inside", "b": {"c": 1}} suffix"#;
        let json = extract_json_object(text).unwrap();
        let value: serde_json::Value = serde_json::from_str(json).unwrap();
        assert_eq!(value["b"]["c"], 1);
    }

    #[test]
    fn extraction_fails_without_object() {
        assert!(extract_json_object("no braces here").is_none());
        assert!(extract_json_object("unbalanced {").is_none());
    }
}
