//! The agent's tool surface: JSON schemas advertised to the model and
//! the executor that runs approved invocations inside the workdir.
//!
//! The executor assumes the safety gate already approved the invocation;
//! it still fails closed on its own (timeouts, missing files, size
//! ceilings) but performs no policy checks.

use std::path::PathBuf;
use std::process::Stdio;

use serde_json::json;
use tokio::process::Command;
use tracing::{debug, warn};

use mx_core::config::AgentSettings;
use mx_core::types::{ToolErrorKind, ToolInvocation, ToolKind, ToolResult};

use crate::provider::ToolSpec;

// ---------------------------------------------------------------------------
// Tool schemas
// ---------------------------------------------------------------------------

/// The four tools advertised on every implementation-loop call.
pub fn tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: ToolKind::RunShellCommand.as_str().to_string(),
            description: "Run a shell command inside the repository working directory. \
                          Returns exit code, stdout and stderr."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "The shell command to execute"
                    },
                    "timeout": {
                        "type": "integer",
                        "description": "Optional timeout in seconds"
                    }
                },
                "required": ["command"]
            }),
        },
        ToolSpec {
            name: ToolKind::ReadFile.as_str().to_string(),
            description: "Read a file relative to the repository root and return its \
                          contents as text."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "file_path": {
                        "type": "string",
                        "description": "Path of the file, relative to the repository root"
                    }
                },
                "required": ["file_path"]
            }),
        },
        ToolSpec {
            name: ToolKind::WriteFile.as_str().to_string(),
            description: "Write text content to a file relative to the repository root, \
                          creating parent directories as needed."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "file_path": {
                        "type": "string",
                        "description": "Path of the file, relative to the repository root"
                    },
                    "content": {
                        "type": "string",
                        "description": "Full new contents of the file"
                    }
                },
                "required": ["file_path", "content"]
            }),
        },
        ToolSpec {
            name: ToolKind::ListDirectory.as_str().to_string(),
            description: "List the entries of a directory relative to the repository \
                          root. Defaults to the root itself."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "dir_path": {
                        "type": "string",
                        "description": "Directory to list, relative to the repository root"
                    }
                }
            }),
        },
    ]
}

// ---------------------------------------------------------------------------
// ToolExecutor
// ---------------------------------------------------------------------------

/// Runs approved invocations rooted at the run's working directory.
///
/// Execution failures come back as unsuccessful [`ToolResult`]s, never
/// as `Err`: a failing command is feedback for the model, not a
/// workflow fault.
pub struct ToolExecutor {
    root: PathBuf,
    tool_timeout: std::time::Duration,
    max_read_bytes: u64,
}

impl ToolExecutor {
    pub fn new(root: impl Into<PathBuf>, settings: &AgentSettings) -> Self {
        Self {
            root: root.into(),
            tool_timeout: settings.tool_timeout(),
            max_read_bytes: settings.max_read_bytes,
        }
    }

    pub async fn execute(&self, invocation: &ToolInvocation) -> ToolResult {
        debug!(tool = invocation.tool.as_str(), "executing tool");
        match invocation.tool {
            ToolKind::RunShellCommand => self.run_shell(invocation).await,
            ToolKind::ReadFile => self.read_file(invocation).await,
            ToolKind::WriteFile => self.write_file(invocation).await,
            ToolKind::ListDirectory => self.list_directory(invocation).await,
        }
    }

    // -- run_shell_command --

    async fn run_shell(&self, invocation: &ToolInvocation) -> ToolResult {
        let Some(command) = invocation.str_arg("command") else {
            return ToolResult::error(
                ToolErrorKind::InvalidArguments,
                "missing required argument: command",
            );
        };
        let timeout = invocation
            .arguments
            .get("timeout")
            .and_then(|v| v.as_u64())
            .map(std::time::Duration::from_secs)
            .unwrap_or(self.tool_timeout);

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return ToolResult::error(
                    ToolErrorKind::Failed,
                    format!("failed to spawn command: {e}"),
                );
            }
            Err(_) => {
                warn!(command, timeout_secs = timeout.as_secs(), "command timed out");
                return ToolResult::error(
                    ToolErrorKind::Timeout,
                    format!("command timed out after {}s", timeout.as_secs()),
                );
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let rendered = render_command_output(
            exit_code,
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
        );

        if output.status.success() {
            ToolResult::ok(rendered)
        } else {
            ToolResult::error(ToolErrorKind::Failed, rendered)
        }
    }

    // -- read_file --

    async fn read_file(&self, invocation: &ToolInvocation) -> ToolResult {
        let Some(rel) = invocation.str_arg("file_path") else {
            return ToolResult::error(
                ToolErrorKind::InvalidArguments,
                "missing required argument: file_path",
            );
        };
        let path = self.root.join(rel);

        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.len() > self.max_read_bytes => {
                return ToolResult::error(
                    ToolErrorKind::TooLarge,
                    format!(
                        "file too large: {} bytes (max {})",
                        meta.len(),
                        self.max_read_bytes
                    ),
                );
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return ToolResult::error(ToolErrorKind::NotFound, format!("file not found: {rel}"));
            }
            Err(e) => {
                return ToolResult::error(ToolErrorKind::Failed, format!("cannot stat {rel}: {e}"));
            }
        }

        match tokio::fs::read_to_string(&path).await {
            Ok(content) => ToolResult::ok(content),
            Err(e) => ToolResult::error(ToolErrorKind::Failed, format!("cannot read {rel}: {e}")),
        }
    }

    // -- write_file --

    async fn write_file(&self, invocation: &ToolInvocation) -> ToolResult {
        let Some(rel) = invocation.str_arg("file_path") else {
            return ToolResult::error(
                ToolErrorKind::InvalidArguments,
                "missing required argument: file_path",
            );
        };
        let Some(content) = invocation.str_arg("content") else {
            return ToolResult::error(
                ToolErrorKind::InvalidArguments,
                "missing required argument: content",
            );
        };
        let path = self.root.join(rel);

        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ToolResult::error(
                    ToolErrorKind::Failed,
                    format!("cannot create parent directories for {rel}: {e}"),
                );
            }
        }

        match tokio::fs::write(&path, content).await {
            Ok(()) => ToolResult::ok(format!("wrote {} bytes to {rel}", content.len())),
            Err(e) => ToolResult::error(ToolErrorKind::Failed, format!("cannot write {rel}: {e}")),
        }
    }

    // -- list_directory --

    async fn list_directory(&self, invocation: &ToolInvocation) -> ToolResult {
        let rel = invocation.str_arg("dir_path").unwrap_or(".");
        let path = self.root.join(rel);

        let mut read_dir = match tokio::fs::read_dir(&path).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return ToolResult::error(
                    ToolErrorKind::NotFound,
                    format!("directory not found: {rel}"),
                );
            }
            Err(e) => {
                return ToolResult::error(ToolErrorKind::Failed, format!("cannot list {rel}: {e}"));
            }
        };

        let mut entries = Vec::new();
        loop {
            match read_dir.next_entry().await {
                Ok(Some(entry)) => {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if name == ".git" {
                        continue;
                    }
                    let is_dir = entry
                        .file_type()
                        .await
                        .map(|t| t.is_dir())
                        .unwrap_or(false);
                    entries.push(if is_dir { format!("{name}/") } else { name });
                }
                Ok(None) => break,
                Err(e) => {
                    return ToolResult::error(
                        ToolErrorKind::Failed,
                        format!("cannot list {rel}: {e}"),
                    );
                }
            }
        }
        entries.sort();
        ToolResult::ok(entries.join("\n"))
    }
}

/// Shared rendering so the model always sees the same result shape.
fn render_command_output(exit_code: i32, stdout: &str, stderr: &str) -> String {
    let mut out = format!("exit code: {exit_code}");
    if !stdout.trim().is_empty() {
        out.push_str("\nstdout:\n");
        out.push_str(stdout.trim_end());
    }
    if !stderr.trim().is_empty() {
        out.push_str("\nstderr:\n");
        out.push_str(stderr.trim_end());
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
