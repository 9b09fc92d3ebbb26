//! Boundary to the remote sandbox service.
//!
//! Everything behind these traits is opaque to the core: a vendor SDK, the
//! [`crate::local::LocalRuntime`], or the in-memory doubles in [`crate::testing`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeErrorKind {
    NotFound,
    /// The addressed PTY or command process no longer exists on the sandbox.
    ProcessNotFound,
    Unauthorized,
    Timeout,
    Other,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub message: String,
}

impl RuntimeError {
    pub fn new(kind: RuntimeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::Other, message)
    }

    pub fn process_not_found(pid: u32) -> Self {
        Self::new(
            RuntimeErrorKind::ProcessNotFound,
            format!("process with pid {pid} not found"),
        )
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Decides whether a PTY call failed because the remote process is gone.
///
/// A structured [`RuntimeErrorKind::ProcessNotFound`] is authoritative. SDKs that
/// only surface strings are matched on their message, which is a heuristic and
/// may need adjusting when the vendor wording changes.
pub fn is_process_gone(error: &RuntimeError) -> bool {
    if error.kind == RuntimeErrorKind::ProcessNotFound {
        return true;
    }
    let message = error.message.to_ascii_lowercase();
    (message.contains("process") || message.contains("pid")) && message.contains("not found")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxInfo {
    pub sandbox_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl SandboxInfo {
    pub fn new(sandbox_id: impl Into<String>) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            template_id: None,
            name: None,
            metadata: HashMap::new(),
            started_at: None,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.sandbox_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryInfo {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
}

impl EntryInfo {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Result of a non-interactive command. A non-zero exit code is not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl TerminalSize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl fmt::Display for TerminalSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// A freshly created remote pseudo-terminal.
///
/// `output` yields raw bytes until the remote process exits or the channel is
/// dropped by the runtime.
#[derive(Debug)]
pub struct PtyProcess {
    pub pid: u32,
    pub output: mpsc::Receiver<Vec<u8>>,
}

/// Capability bound to one connected sandbox.
#[async_trait]
pub trait SandboxHandle: Send + Sync {
    fn sandbox_id(&self) -> &str;

    async fn list(&self, path: &str) -> RuntimeResult<Vec<EntryInfo>>;
    async fn read(&self, path: &str) -> RuntimeResult<Vec<u8>>;
    async fn write(&self, path: &str, content: &[u8]) -> RuntimeResult<()>;
    async fn remove(&self, path: &str) -> RuntimeResult<()>;
    async fn make_dir(&self, path: &str) -> RuntimeResult<()>;
    async fn rename(&self, from: &str, to: &str) -> RuntimeResult<()>;
    async fn run(&self, command: &str) -> RuntimeResult<CommandOutput>;

    async fn create_pty(&self, size: TerminalSize) -> RuntimeResult<PtyProcess>;
    async fn send_pty_input(&self, pid: u32, data: &[u8]) -> RuntimeResult<()>;
    async fn resize_pty(&self, pid: u32, size: TerminalSize) -> RuntimeResult<()>;
    async fn kill_pty(&self, pid: u32) -> RuntimeResult<()>;
}

/// Discovery and session establishment against the sandbox service.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    async fn list(&self, api_key: &str) -> RuntimeResult<Vec<SandboxInfo>>;
    async fn connect(&self, sandbox_id: &str, api_key: &str)
        -> RuntimeResult<Arc<dyn SandboxHandle>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_kind_wins_over_message() {
        let err = RuntimeError::new(RuntimeErrorKind::ProcessNotFound, "gone");
        assert!(is_process_gone(&err));
    }

    #[test]
    fn message_heuristic_matches_sdk_wording() {
        let err = RuntimeError::other("[not_found] process with pid 12 not found");
        assert!(is_process_gone(&err));
        let err = RuntimeError::other("PID 7 NOT FOUND");
        assert!(is_process_gone(&err));
    }

    #[test]
    fn unrelated_not_found_is_not_process_death() {
        assert!(!is_process_gone(&RuntimeError::other("file not found")));
        assert!(!is_process_gone(&RuntimeError::new(
            RuntimeErrorKind::NotFound,
            "sandbox missing"
        )));
        assert!(!is_process_gone(&RuntimeError::other("process busy")));
    }

    #[test]
    fn sandbox_info_serializes_camel_case() {
        let mut info = SandboxInfo::new("sbx-1");
        info.template_id = Some("base".to_string());
        let value = serde_json::to_value(&info).expect("serialize");
        assert_eq!(value["sandboxId"], "sbx-1");
        assert_eq!(value["templateId"], "base");
        assert!(value.get("metadata").is_none());
        assert_eq!(info.display_name(), "sbx-1");
    }
}
