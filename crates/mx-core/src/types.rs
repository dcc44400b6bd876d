use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// AgentTask
// ---------------------------------------------------------------------------

/// The task a run works on. Immutable once the run starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: Uuid,
    pub project_id: String,
    pub company_id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
}

impl AgentTask {
    pub fn new(
        company_id: impl Into<String>,
        project_id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id: project_id.into(),
            company_id: company_id.into(),
            title: title.into(),
            description: description.into(),
            requirements: Vec::new(),
            tags: Vec::new(),
            context: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Repository target + credentials
// ---------------------------------------------------------------------------

/// Git credentials — a closed tagged union, consumed by the git capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "credential_type", rename_all = "snake_case")]
pub enum GitCredentials {
    UsernamePassword {
        username: String,
        password: String,
    },
    KeyCert {
        private_key: String,
        key_password: Option<String>,
    },
    AccessToken {
        token: String,
    },
}

/// The repository a run clones from and pushes back to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryTarget {
    pub remote_url: String,
    pub base_branch: String,
    pub credentials: GitCredentials,
}

// ---------------------------------------------------------------------------
// ImplementationPlan
// ---------------------------------------------------------------------------

/// Structured plan produced by the one-shot planning call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImplementationPlan {
    pub goal: String,
    pub steps: Vec<String>,
    #[serde(default)]
    pub files_to_create: Vec<String>,
    #[serde(default)]
    pub files_to_modify: Vec<String>,
    pub estimated_steps: usize,
    #[serde(default)]
    pub validation_criteria: Vec<String>,
}

impl ImplementationPlan {
    /// Schema-level validation applied to model output.
    ///
    /// The plan must have at least one step, and `estimated_steps` must be
    /// consistent with the step list (the model occasionally reports a
    /// count wildly off from the steps it wrote).
    pub fn validate(&self) -> Result<(), String> {
        if self.steps.is_empty() {
            return Err("plan has no steps".into());
        }
        if self.steps.iter().any(|s| s.trim().is_empty()) {
            return Err("plan contains an empty step".into());
        }
        if self.estimated_steps == 0 || self.estimated_steps > self.steps.len() * 2 {
            return Err(format!(
                "estimated_steps {} inconsistent with {} steps",
                self.estimated_steps,
                self.steps.len()
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tool invocation / result
// ---------------------------------------------------------------------------

/// Closed set of tools the model may call. New tools add a variant and a
/// handler in the executor dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    RunShellCommand,
    ReadFile,
    WriteFile,
    ListDirectory,
}

impl ToolKind {
    /// Wire name as it appears in tool schemas and model tool calls.
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolKind::RunShellCommand => "run_shell_command",
            ToolKind::ReadFile => "read_file",
            ToolKind::WriteFile => "write_file",
            ToolKind::ListDirectory => "list_directory",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "run_shell_command" => Some(ToolKind::RunShellCommand),
            "read_file" => Some(ToolKind::ReadFile),
            "write_file" => Some(ToolKind::WriteFile),
            "list_directory" => Some(ToolKind::ListDirectory),
            _ => None,
        }
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single function-call request emitted by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool: ToolKind,
    pub arguments: serde_json::Value,
    pub requested_at: DateTime<Utc>,
}

impl ToolInvocation {
    pub fn new(tool: ToolKind, arguments: serde_json::Value) -> Self {
        Self {
            tool,
            arguments,
            requested_at: Utc::now(),
        }
    }

    /// Fetch a required string argument.
    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.arguments.get(key).and_then(|v| v.as_str())
    }
}

/// Why a tool execution did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    /// Rejected by the safety gate before dispatch.
    Blocked,
    /// Executed but failed (non-zero exit, I/O error, ...).
    Failed,
    Timeout,
    NotFound,
    TooLarge,
    InvalidArguments,
}

/// Outcome of one tool invocation, fed back into the transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
    pub error_kind: Option<ToolErrorKind>,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error_kind: None,
        }
    }

    pub fn error(kind: ToolErrorKind, output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            error_kind: Some(kind),
        }
    }

    /// Synthetic result for a gate rejection — never executed.
    pub fn blocked(reason: impl Into<String>) -> Self {
        Self::error(ToolErrorKind::Blocked, reason)
    }
}

// ---------------------------------------------------------------------------
// ValidationResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub success: bool,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    pub tests_passed: u32,
    pub tests_failed: u32,
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    WorkflowStarted,
    RepoCloned,
    BranchCreated,
    PlanCreated,
    ImplementationStarted,
    ImplementationStep,
    ValidationStarted,
    ValidationCompleted,
    ChangesCommitted,
    ChangesPushed,
    WorkflowCompleted,
    WorkflowFailed,
}

impl NotificationType {
    /// Wire label used as the last segment of the publish subject.
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::WorkflowStarted => "workflow_started",
            NotificationType::RepoCloned => "repo_cloned",
            NotificationType::BranchCreated => "branch_created",
            NotificationType::PlanCreated => "plan_created",
            NotificationType::ImplementationStarted => "implementation_started",
            NotificationType::ImplementationStep => "implementation_step",
            NotificationType::ValidationStarted => "validation_started",
            NotificationType::ValidationCompleted => "validation_completed",
            NotificationType::ChangesCommitted => "changes_committed",
            NotificationType::ChangesPushed => "changes_pushed",
            NotificationType::WorkflowCompleted => "workflow_completed",
            NotificationType::WorkflowFailed => "workflow_failed",
        }
    }
}

/// Fire-and-forget event published to the notification sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub workflow_id: Uuid,
    pub company_id: String,
    pub project_id: String,
    pub task_id: Uuid,
    pub notification_type: NotificationType,
    pub message: String,
    #[serde(default)]
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Activity ledger rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Progress,
    FunctionCall,
    McpCall,
    Error,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Progress => "progress",
            ActivityKind::FunctionCall => "function_call",
            ActivityKind::McpCall => "mcp_call",
            ActivityKind::Error => "error",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "progress" => Some(ActivityKind::Progress),
            "function_call" => Some(ActivityKind::FunctionCall),
            "mcp_call" => Some(ActivityKind::McpCall),
            "error" => Some(ActivityKind::Error),
            _ => None,
        }
    }
}

/// Append-only audit row. Never consulted by control flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub task_id: Uuid,
    pub kind: ActivityKind,
    pub message: String,
    #[serde(default)]
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl ActivityRecord {
    pub fn new(task_id: Uuid, kind: ActivityKind, message: impl Into<String>) -> Self {
        Self {
            task_id,
            kind,
            message: message.into(),
            details: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

// ---------------------------------------------------------------------------
// Run request / report
// ---------------------------------------------------------------------------

/// Input to a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub task: AgentTask,
    pub repository: RepositoryTarget,
}

/// The result surface of a run. Always returned, success or not, so the
/// caller can inspect partial artifacts on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub success: bool,
    pub workflow_id: Uuid,
    pub company_id: String,
    pub project_id: String,
    pub task_id: Uuid,
    pub branch_name: Option<String>,
    pub commit_hash: Option<String>,
    pub plan: Option<ImplementationPlan>,
    pub steps_completed: u32,
    pub validation: Option<ValidationResult>,
    pub error_message: Option<String>,
    pub execution_time_secs: f64,
    pub llm_call_count: u32,
}

// ---------------------------------------------------------------------------
// Branch naming
// ---------------------------------------------------------------------------

/// Deterministic feature-branch name from the task id, title, and date.
///
/// `feat/<yyyymmdd>-<title-slug>-<task-id-prefix>`, capped at 100 chars.
/// Generated exactly once per run and recorded in the checkpoint so a
/// resumed run reuses the same name.
pub fn branch_name_for(task: &AgentTask, date: NaiveDate) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for c in task.title.to_lowercase().chars().take(50) {
        if c.is_alphanumeric() {
            slug.push(c);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_matches('-');
    let slug = if slug.is_empty() { "task" } else { slug };

    let short_id = &task.id.simple().to_string()[..8];
    let mut name = format!("feat/{}-{}-{}", date.format("%Y%m%d"), slug, short_id);
    if name.len() > 100 {
        let mut cut = 100;
        while !name.is_char_boundary(cut) {
            cut -= 1;
        }
        name.truncate(cut);
        name = name.trim_end_matches('-').to_string();
    }
    name
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn task(title: &str) -> AgentTask {
        AgentTask::new("acme", "proj-1", title, "desc")
    }

    #[test]
    fn credentials_tagged_serialization() {
        let creds = GitCredentials::AccessToken {
            token: "tok".into(),
        };
        let json = serde_json::to_value(&creds).unwrap();
        assert_eq!(json["credential_type"], "access_token");

        let back: GitCredentials =
            serde_json::from_str(r#"{"credential_type":"username_password","username":"u","password":"p"}"#)
                .unwrap();
        assert!(matches!(back, GitCredentials::UsernamePassword { .. }));
    }

    #[test]
    fn plan_validation_rejects_empty_steps() {
        let plan = ImplementationPlan {
            goal: "g".into(),
            steps: vec![],
            files_to_create: vec![],
            files_to_modify: vec![],
            estimated_steps: 1,
            validation_criteria: vec![],
        };
        assert!(plan.validate().is_err());
    }

    #[test]
    fn plan_validation_rejects_inconsistent_estimate() {
        let plan = ImplementationPlan {
            goal: "g".into(),
            steps: vec!["a".into(), "b".into()],
            files_to_create: vec![],
            files_to_modify: vec![],
            estimated_steps: 40,
            validation_criteria: vec![],
        };
        assert!(plan.validate().is_err());

        let ok = ImplementationPlan {
            estimated_steps: 2,
            ..plan
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn tool_kind_wire_names_roundtrip() {
        for kind in [
            ToolKind::RunShellCommand,
            ToolKind::ReadFile,
            ToolKind::WriteFile,
            ToolKind::ListDirectory,
        ] {
            assert_eq!(ToolKind::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(ToolKind::from_name("delete_everything"), None);
    }

    #[test]
    fn tool_result_constructors() {
        let ok = ToolResult::ok("done");
        assert!(ok.success);
        assert!(ok.error_kind.is_none());

        let blocked = ToolResult::blocked("matched pattern");
        assert!(!blocked.success);
        assert_eq!(blocked.error_kind, Some(ToolErrorKind::Blocked));
    }

    #[test]
    fn branch_name_is_deterministic_and_slugged() {
        let t = task("Add OAuth2 login (with refresh tokens)!");
        let date = NaiveDate::from_ymd_opt(2026, 8, 23).unwrap();
        let a = branch_name_for(&t, date);
        let b = branch_name_for(&t, date);
        assert_eq!(a, b);
        assert!(a.starts_with("feat/20260823-add-oauth2-login-with-refresh-tokens"));
        assert!(a.len() <= 100);
        assert!(!a.contains(' '));
        assert!(!a.contains('('));
    }

    #[test]
    fn branch_name_handles_symbol_only_title() {
        let t = task("!!! ???");
        let date = NaiveDate::from_ymd_opt(2026, 1, 2).unwrap();
        let name = branch_name_for(&t, date);
        assert!(name.starts_with("feat/20260102-task-"));
    }

    #[test]
    fn notification_type_wire_labels() {
        assert_eq!(NotificationType::WorkflowFailed.as_str(), "workflow_failed");
        let json = serde_json::to_value(NotificationType::ImplementationStep).unwrap();
        assert_eq!(json, "implementation_step");
    }
}
