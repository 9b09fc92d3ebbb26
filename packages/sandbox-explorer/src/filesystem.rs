use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::debug;

use sandbox_explorer_error::SandboxError;

use crate::explorer::SandboxExplorer;
use crate::paths::{self, shell_quote};
use crate::runtime::{CommandOutput, EntryInfo, RuntimeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    File,
    Directory,
    Symlink,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStat {
    #[serde(rename = "type")]
    pub kind: FileKind,
    pub size: u64,
    /// Seconds since the unix epoch.
    pub mtime: u64,
}

impl FileStat {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn modified(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(self.mtime)
    }
}

/// File operations routed to a connected sandbox.
///
/// Operations that add, remove or move entries invalidate the explorer's file
/// index for the touched paths once the remote call has succeeded.
#[derive(Clone, Copy)]
pub struct SandboxFiles<'a> {
    explorer: &'a SandboxExplorer,
}

impl<'a> SandboxFiles<'a> {
    pub(crate) fn new(explorer: &'a SandboxExplorer) -> Self {
        Self { explorer }
    }

    /// Directory entries, directories first and then by name.
    pub async fn list(
        &self,
        sandbox_id: &str,
        path: &str,
    ) -> Result<Vec<EntryInfo>, SandboxError> {
        let handle = self.explorer.handle(sandbox_id)?;
        let mut entries = handle
            .list(path)
            .await
            .map_err(|err| remote_error(sandbox_id, "list", err))?;
        entries.sort_by(|a, b| b.is_dir().cmp(&a.is_dir()).then_with(|| a.name.cmp(&b.name)));
        debug!(sandbox_id, path, count = entries.len(), "listed directory");
        Ok(entries)
    }

    pub async fn read(&self, sandbox_id: &str, path: &str) -> Result<Vec<u8>, SandboxError> {
        let handle = self.explorer.handle(sandbox_id)?;
        handle
            .read(path)
            .await
            .map_err(|err| remote_error(sandbox_id, "read", err))
    }

    pub async fn read_to_string(
        &self,
        sandbox_id: &str,
        path: &str,
    ) -> Result<String, SandboxError> {
        let bytes = self.read(sandbox_id, path).await?;
        String::from_utf8(bytes).map_err(|_| SandboxError::InvalidRequest {
            message: format!("{path} is not valid utf-8"),
        })
    }

    /// Writes `content`; `create` marks a write that may add a new file, which is
    /// the only kind of write that changes the file index.
    pub async fn write(
        &self,
        sandbox_id: &str,
        path: &str,
        content: &[u8],
        create: bool,
    ) -> Result<(), SandboxError> {
        let handle = self.explorer.handle(sandbox_id)?;
        handle
            .write(path, content)
            .await
            .map_err(|err| remote_error(sandbox_id, "write", err))?;
        if create {
            self.explorer.invalidate_index(sandbox_id, Some(path));
        }
        debug!(sandbox_id, path, bytes = content.len(), create, "wrote file");
        Ok(())
    }

    /// Creates an empty file named `name` inside `directory`.
    pub async fn create_file(
        &self,
        sandbox_id: &str,
        directory: &str,
        name: &str,
    ) -> Result<String, SandboxError> {
        let path = paths::child(directory, name)?;
        self.write(sandbox_id, &path, &[], true).await?;
        Ok(path)
    }

    pub async fn delete(&self, sandbox_id: &str, path: &str) -> Result<(), SandboxError> {
        let handle = self.explorer.handle(sandbox_id)?;
        handle
            .remove(path)
            .await
            .map_err(|err| remote_error(sandbox_id, "delete", err))?;
        self.explorer.invalidate_index(sandbox_id, Some(path));
        debug!(sandbox_id, path, "deleted entry");
        Ok(())
    }

    pub async fn make_dir(&self, sandbox_id: &str, path: &str) -> Result<(), SandboxError> {
        let handle = self.explorer.handle(sandbox_id)?;
        handle
            .make_dir(path)
            .await
            .map_err(|err| remote_error(sandbox_id, "mkdir", err))?;
        self.explorer.invalidate_index(sandbox_id, Some(path));
        debug!(sandbox_id, path, "created directory");
        Ok(())
    }

    pub async fn rename(&self, sandbox_id: &str, from: &str, to: &str) -> Result<(), SandboxError> {
        let handle = self.explorer.handle(sandbox_id)?;
        handle
            .rename(from, to)
            .await
            .map_err(|err| remote_error(sandbox_id, "rename", err))?;
        self.explorer.invalidate_index(sandbox_id, Some(from));
        self.explorer.invalidate_index(sandbox_id, Some(to));
        debug!(sandbox_id, from, to, "renamed entry");
        Ok(())
    }

    /// Renames `path` within its directory and returns the new path.
    pub async fn rename_in_place(
        &self,
        sandbox_id: &str,
        path: &str,
        new_name: &str,
    ) -> Result<String, SandboxError> {
        let target = paths::sibling(path, new_name)?;
        if target != paths::normalize(path) {
            self.rename(sandbox_id, path, &target).await?;
        }
        Ok(target)
    }

    pub async fn stat(&self, sandbox_id: &str, path: &str) -> Result<FileStat, SandboxError> {
        let output = self.run_command(sandbox_id, &stat_command(path)).await?;
        parse_stat_output(&output.stdout).ok_or_else(|| {
            let detail = if output.stderr.trim().is_empty() {
                format!("unexpected stat output for {path}: {:?}", output.stdout.trim())
            } else {
                output.stderr.trim().to_string()
            };
            SandboxError::RemoteOperation {
                sandbox_id: sandbox_id.to_string(),
                operation: "stat".to_string(),
                message: detail,
            }
        })
    }

    pub async fn run_command(
        &self,
        sandbox_id: &str,
        command: &str,
    ) -> Result<CommandOutput, SandboxError> {
        let handle = self.explorer.handle(sandbox_id)?;
        let output = handle
            .run(command)
            .await
            .map_err(|err| remote_error(sandbox_id, "command", err))?;
        debug!(sandbox_id, exit_code = output.exit_code, "ran command");
        Ok(output)
    }
}

pub(crate) fn remote_error(sandbox_id: &str, operation: &str, err: RuntimeError) -> SandboxError {
    SandboxError::RemoteOperation {
        sandbox_id: sandbox_id.to_string(),
        operation: operation.to_string(),
        message: err.message,
    }
}

/// GNU `stat` first, BSD `stat` when the GNU flags are rejected.
pub fn stat_command(path: &str) -> String {
    let quoted = shell_quote(path);
    format!("stat -c '%F %s %Y' {quoted} 2>/dev/null || stat -f '%HT %z %m' {quoted}")
}

/// Parses `<type...> <size> <mtime>`.
///
/// GNU prints multi-word types ("regular file", "regular empty file") and BSD
/// prints capitalized ones ("Regular File", "Directory"), so size and mtime are
/// taken from the end of the line and everything before them is the type.
pub fn parse_stat_output(stdout: &str) -> Option<FileStat> {
    let line = stdout.lines().map(str::trim).find(|line| !line.is_empty())?;
    let fields = line.split_whitespace().collect::<Vec<_>>();
    if fields.len() < 3 {
        return None;
    }
    let mtime = fields[fields.len() - 1].parse::<u64>().ok()?;
    let size = fields[fields.len() - 2].parse::<u64>().ok()?;
    let kind = fields[..fields.len() - 2].join(" ").to_lowercase();
    let kind = if kind.contains("directory") {
        FileKind::Directory
    } else if kind.contains("symbolic link") {
        FileKind::Symlink
    } else if kind.contains("regular") || kind == "file" {
        FileKind::File
    } else {
        FileKind::Other
    };
    Some(FileStat { kind, size, mtime })
}
