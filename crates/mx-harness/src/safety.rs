//! Pre-dispatch validation of tool invocations.
//!
//! The gate is a stateless predicate evaluated before every tool
//! dispatch. Rejections are data: the loop feeds them back to the model
//! as `Blocked` tool results so it can self-correct. Nothing here ever
//! escalates to the workflow.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use regex::{Regex, RegexBuilder};
use tracing::warn;

use mx_core::config::AgentSettings;
use mx_core::types::{ToolInvocation, ToolKind};

// ---------------------------------------------------------------------------
// Rejection
// ---------------------------------------------------------------------------

/// Why an invocation was refused. Carries the matched denylist pattern
/// when the refusal came from the command check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub reason: String,
    pub matched_pattern: Option<String>,
}

impl Rejection {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            matched_pattern: None,
        }
    }

    fn pattern(reason: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            matched_pattern: Some(pattern.into()),
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.matched_pattern {
            Some(p) => write!(f, "{} (pattern: {})", self.reason, p),
            None => f.write_str(&self.reason),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors (construction only)
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SafetyError {
    #[error("invalid denylist pattern `{pattern}`: {source}")]
    BadPattern {
        pattern: String,
        source: regex::Error,
    },
    #[error("working directory root does not resolve: {0}")]
    BadRoot(std::io::Error),
}

// ---------------------------------------------------------------------------
// SafetyGate
// ---------------------------------------------------------------------------

/// Stateless validator applied to every proposed tool call.
pub struct SafetyGate {
    root: PathBuf,
    denylist: Vec<(String, Regex)>,
    max_read_bytes: u64,
}

impl SafetyGate {
    /// Build a gate rooted at the run's working directory.
    ///
    /// The root is canonicalized once here; all path containment checks
    /// compare against the resolved root so symlinked workdirs behave.
    pub fn new(root: &Path, settings: &AgentSettings) -> Result<Self, SafetyError> {
        let root = root.canonicalize().map_err(SafetyError::BadRoot)?;
        let mut denylist = Vec::with_capacity(settings.denylist.len());
        for pattern in &settings.denylist {
            let re = RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|source| SafetyError::BadPattern {
                    pattern: pattern.clone(),
                    source,
                })?;
            denylist.push((pattern.clone(), re));
        }
        Ok(Self {
            root,
            denylist,
            max_read_bytes: settings.max_read_bytes,
        })
    }

    /// Validate one invocation. `Ok(())` means the executor may run it.
    pub fn check(&self, invocation: &ToolInvocation) -> Result<(), Rejection> {
        match invocation.tool {
            ToolKind::RunShellCommand => self.check_shell(invocation),
            ToolKind::ReadFile => self.check_read(invocation),
            ToolKind::WriteFile => self.check_write(invocation),
            ToolKind::ListDirectory => self.check_list(invocation),
        }
    }

    // -- per-tool checks --

    fn check_shell(&self, invocation: &ToolInvocation) -> Result<(), Rejection> {
        let command = invocation
            .str_arg("command")
            .ok_or_else(|| Rejection::new("missing required argument: command"))?;

        for (pattern, re) in &self.denylist {
            if re.is_match(command) {
                warn!(pattern = pattern.as_str(), "blocked destructive shell command");
                return Err(Rejection::pattern(
                    "command matches destructive pattern",
                    pattern,
                ));
            }
        }
        Ok(())
    }

    fn check_read(&self, invocation: &ToolInvocation) -> Result<(), Rejection> {
        let rel = invocation
            .str_arg("file_path")
            .ok_or_else(|| Rejection::new("missing required argument: file_path"))?;
        let resolved = self.resolve_within_root(rel)?;

        if let Ok(meta) = std::fs::metadata(&resolved) {
            if meta.len() > self.max_read_bytes {
                return Err(Rejection::new(format!(
                    "file too large: {} bytes (max {})",
                    meta.len(),
                    self.max_read_bytes
                )));
            }
        }
        Ok(())
    }

    fn check_write(&self, invocation: &ToolInvocation) -> Result<(), Rejection> {
        let rel = invocation
            .str_arg("file_path")
            .ok_or_else(|| Rejection::new("missing required argument: file_path"))?;
        self.resolve_within_root(rel)?;

        // JSON strings are UTF-8 by construction; anything else (number,
        // array, base64 blob object) is refused here.
        match invocation.arguments.get("content") {
            Some(serde_json::Value::String(_)) => Ok(()),
            Some(_) => Err(Rejection::new("content must be a UTF-8 string")),
            None => Err(Rejection::new("missing required argument: content")),
        }
    }

    fn check_list(&self, invocation: &ToolInvocation) -> Result<(), Rejection> {
        let rel = invocation.str_arg("dir_path").unwrap_or(".");
        self.resolve_within_root(rel)?;
        Ok(())
    }

    // -- path containment --

    /// Resolve `rel` against the root, following symlinks through the
    /// deepest existing ancestor, and refuse anything that lands outside
    /// the root.
    fn resolve_within_root(&self, rel: &str) -> Result<PathBuf, Rejection> {
        let rel_path = Path::new(rel);
        if rel_path.is_absolute() {
            return Err(Rejection::new(format!("absolute paths are not allowed: {rel}")));
        }

        let joined = self.root.join(rel_path);

        // Split into the existing prefix (canonicalizable, resolves
        // symlinks and `..`) and the not-yet-existing suffix.
        let mut existing = joined.clone();
        let mut suffix: Vec<OsString> = Vec::new();
        while !existing.exists() {
            match (existing.file_name(), existing.parent()) {
                (Some(name), Some(parent)) => {
                    suffix.push(name.to_os_string());
                    existing = parent.to_path_buf();
                }
                _ => break,
            }
        }

        let canon = existing
            .canonicalize()
            .map_err(|e| Rejection::new(format!("cannot resolve path {rel}: {e}")))?;

        let mut resolved = canon;
        for part in suffix.iter().rev() {
            if part == ".." || part == "." {
                return Err(Rejection::new(format!(
                    "path escapes the working directory: {rel}"
                )));
            }
            resolved.push(part);
        }

        if !resolved.starts_with(&self.root) {
            warn!(path = rel, "blocked path outside working directory");
            return Err(Rejection::new(format!(
                "path escapes the working directory: {rel}"
            )));
        }
        Ok(resolved)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
