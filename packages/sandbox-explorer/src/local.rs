//! The host machine exposed as a single sandbox named `local`.

use std::collections::HashMap;
use std::env;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtyPair, PtySize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::lock;
use crate::paths;
use crate::runtime::{
    CommandOutput, EntryInfo, EntryKind, PtyProcess, RuntimeError, RuntimeErrorKind,
    RuntimeResult, SandboxHandle, SandboxInfo, SandboxRuntime, TerminalSize,
};

pub const LOCAL_SANDBOX_ID: &str = "local";
const DEFAULT_SHELL: &str = "/bin/sh";

pub struct LocalRuntime {
    sandbox: Arc<LocalSandbox>,
}

impl LocalRuntime {
    /// Shells start in `working_dir` and run `$SHELL` (or `/bin/sh`).
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        let shell = env::var("SHELL")
            .ok()
            .filter(|shell| !shell.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SHELL.to_string());
        Self::with_shell(working_dir, shell)
    }

    /// PTYs whose process has not exited or been killed yet.
    pub fn open_ptys(&self) -> usize {
        lock(&self.sandbox.ptys).len()
    }

    pub fn with_shell(working_dir: impl Into<PathBuf>, shell: impl Into<String>) -> Self {
        Self {
            sandbox: Arc::new(LocalSandbox {
                working_dir: working_dir.into(),
                shell: shell.into(),
                ptys: Arc::new(Mutex::new(HashMap::new())),
            }),
        }
    }
}

#[async_trait]
impl SandboxRuntime for LocalRuntime {
    async fn list(&self, _api_key: &str) -> RuntimeResult<Vec<SandboxInfo>> {
        let mut info = SandboxInfo::new(LOCAL_SANDBOX_ID);
        info.name = Some("Local machine".to_string());
        info.metadata.insert(
            "workingDir".to_string(),
            self.sandbox.working_dir.display().to_string(),
        );
        Ok(vec![info])
    }

    async fn connect(
        &self,
        sandbox_id: &str,
        _api_key: &str,
    ) -> RuntimeResult<Arc<dyn SandboxHandle>> {
        if sandbox_id != LOCAL_SANDBOX_ID {
            return Err(RuntimeError::new(
                RuntimeErrorKind::NotFound,
                format!("sandbox {sandbox_id} not found"),
            ));
        }
        Ok(self.sandbox.clone())
    }
}

struct LocalPty {
    input: mpsc::Sender<Vec<u8>>,
    master: Box<dyn MasterPty + Send>,
    exited: Arc<AtomicBool>,
}

pub struct LocalSandbox {
    working_dir: PathBuf,
    shell: String,
    ptys: Arc<Mutex<HashMap<u32, LocalPty>>>,
}

impl LocalSandbox {
    fn live_input(&self, pid: u32) -> RuntimeResult<mpsc::Sender<Vec<u8>>> {
        let ptys = lock(&self.ptys);
        match ptys.get(&pid) {
            Some(pty) if !pty.exited.load(Ordering::SeqCst) => Ok(pty.input.clone()),
            _ => Err(RuntimeError::process_not_found(pid)),
        }
    }
}

fn io_error(path: &str, err: io::Error) -> RuntimeError {
    let kind = match err.kind() {
        io::ErrorKind::NotFound => RuntimeErrorKind::NotFound,
        io::ErrorKind::PermissionDenied => RuntimeErrorKind::Unauthorized,
        _ => RuntimeErrorKind::Other,
    };
    RuntimeError::new(kind, format!("{path}: {err}"))
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

#[async_trait]
impl SandboxHandle for LocalSandbox {
    fn sandbox_id(&self) -> &str {
        LOCAL_SANDBOX_ID
    }

    async fn list(&self, path: &str) -> RuntimeResult<Vec<EntryInfo>> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(path)
            .await
            .map_err(|err| io_error(path, err))?;
        while let Some(entry) = dir.next_entry().await.map_err(|err| io_error(path, err))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let kind = match entry.file_type().await {
                Ok(file_type) if file_type.is_dir() => EntryKind::Directory,
                _ => EntryKind::File,
            };
            entries.push(EntryInfo {
                path: paths::join(path, &name),
                name,
                kind,
            });
        }
        Ok(entries)
    }

    async fn read(&self, path: &str) -> RuntimeResult<Vec<u8>> {
        tokio::fs::read(path).await.map_err(|err| io_error(path, err))
    }

    async fn write(&self, path: &str, content: &[u8]) -> RuntimeResult<()> {
        if let Some(parent) = Path::new(path).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| io_error(path, err))?;
        }
        tokio::fs::write(path, content)
            .await
            .map_err(|err| io_error(path, err))
    }

    async fn remove(&self, path: &str) -> RuntimeResult<()> {
        let metadata = tokio::fs::symlink_metadata(path)
            .await
            .map_err(|err| io_error(path, err))?;
        let result = if metadata.is_dir() {
            tokio::fs::remove_dir_all(path).await
        } else {
            tokio::fs::remove_file(path).await
        };
        result.map_err(|err| io_error(path, err))
    }

    async fn make_dir(&self, path: &str) -> RuntimeResult<()> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|err| io_error(path, err))
    }

    async fn rename(&self, from: &str, to: &str) -> RuntimeResult<()> {
        tokio::fs::rename(from, to)
            .await
            .map_err(|err| io_error(from, err))
    }

    async fn run(&self, command: &str) -> RuntimeResult<CommandOutput> {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.working_dir)
            .output()
            .await
            .map_err(|err| RuntimeError::other(format!("failed to run command: {err}")))?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn create_pty(&self, size: TerminalSize) -> RuntimeResult<PtyProcess> {
        let PtyPair { master, slave } = native_pty_system()
            .openpty(pty_size(size))
            .map_err(|err| RuntimeError::other(format!("failed to open PTY: {err}")))?;

        let mut cmd = CommandBuilder::new(&self.shell);
        cmd.cwd(&self.working_dir);
        cmd.env("TERM", "xterm-256color");
        let mut child = slave
            .spawn_command(cmd)
            .map_err(|err| RuntimeError::other(format!("failed to spawn PTY command: {err}")))?;
        drop(slave);
        let pid = child
            .process_id()
            .ok_or_else(|| RuntimeError::other("PTY process has no pid"))?;

        let mut reader = master
            .try_clone_reader()
            .map_err(|err| RuntimeError::other(format!("failed to clone PTY reader: {err}")))?;
        let mut writer = master
            .take_writer()
            .map_err(|err| RuntimeError::other(format!("failed to take PTY writer: {err}")))?;

        let (output_tx, output_rx) = mpsc::channel(256);
        tokio::task::spawn_blocking(move || {
            let mut buffer = [0u8; 8192];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) | Err(_) => break,
                    Ok(count) => {
                        if output_tx.blocking_send(buffer[..count].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::task::spawn_blocking(move || {
            while let Some(payload) = input_rx.blocking_recv() {
                if writer.write_all(&payload).is_err() || writer.flush().is_err() {
                    break;
                }
            }
        });

        let exited = Arc::new(AtomicBool::new(false));
        lock(&self.ptys).insert(
            pid,
            LocalPty {
                input: input_tx,
                master,
                exited: exited.clone(),
            },
        );

        let ptys = self.ptys.clone();
        tokio::task::spawn_blocking(move || {
            let status = child.wait();
            exited.store(true, Ordering::SeqCst);
            let mut ptys = lock(&ptys);
            // The pid may already belong to a newer PTY.
            if ptys
                .get(&pid)
                .is_some_and(|pty| Arc::ptr_eq(&pty.exited, &exited))
            {
                ptys.remove(&pid);
            }
            drop(ptys);
            debug!(pid, status = ?status.ok(), "local pty exited");
        });
        Ok(PtyProcess {
            pid,
            output: output_rx,
        })
    }

    async fn send_pty_input(&self, pid: u32, data: &[u8]) -> RuntimeResult<()> {
        let input = self.live_input(pid)?;
        input
            .send(data.to_vec())
            .await
            .map_err(|_| RuntimeError::process_not_found(pid))
    }

    async fn resize_pty(&self, pid: u32, size: TerminalSize) -> RuntimeResult<()> {
        let ptys = lock(&self.ptys);
        match ptys.get(&pid) {
            Some(pty) if !pty.exited.load(Ordering::SeqCst) => pty
                .master
                .resize(pty_size(size))
                .map_err(|err| RuntimeError::other(format!("failed to resize PTY: {err}"))),
            _ => Err(RuntimeError::process_not_found(pid)),
        }
    }

    async fn kill_pty(&self, pid: u32) -> RuntimeResult<()> {
        let pty = lock(&self.ptys).remove(&pid);
        match pty {
            Some(pty) if !pty.exited.load(Ordering::SeqCst) => {
                terminate_process(pid);
                Ok(())
            }
            _ => Err(RuntimeError::process_not_found(pid)),
        }
    }
}

#[cfg(unix)]
fn terminate_process(pid: u32) {
    let Ok(pid) = i32::try_from(pid) else {
        return;
    };
    if pid <= 0 {
        return;
    }
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate_process(_pid: u32) {}
