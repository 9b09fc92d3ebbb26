use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sandbox_explorer_error::SandboxError;

use crate::filesystem::remote_error;
use crate::lock;
use crate::registry::SessionRegistry;
use crate::runtime::{is_process_gone, PtyProcess, RuntimeResult, SandboxHandle, TerminalSize};

const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const GREEN: &str = "\x1b[32m";
const RESET: &str = "\x1b[0m";

/// The host's pseudo-terminal: raw text out, and a way to end the terminal.
pub trait TerminalSurface: Send + Sync {
    fn write(&self, text: &str);
    fn close(&self, exit_code: i32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    Opening,
    Running,
    Reconnecting,
    Closed,
}

/// What happened to a chunk of keyboard input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputOutcome {
    Delivered,
    /// The PTY had died; it was recreated and the input sent to the new one.
    Resent,
    /// A reconnect was already in flight, or the terminal is not running.
    Dropped,
}

struct ActivePty {
    handle: Arc<dyn SandboxHandle>,
    pid: u32,
    forwarder: JoinHandle<()>,
}

impl Drop for ActivePty {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

struct TerminalInner {
    id: u64,
    sandbox_id: String,
    registry: Arc<Mutex<SessionRegistry>>,
    surface: Arc<dyn TerminalSurface>,
    state: Mutex<TerminalState>,
    size: Mutex<TerminalSize>,
    pty: Mutex<Option<ActivePty>>,
    reconnecting: AtomicBool,
}

/// Clears the reconnect flag however the reconnect ends.
struct ReconnectClaim<'a>(&'a AtomicBool);

impl Drop for ReconnectClaim<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// An interactive shell on one sandbox, bridged to a [`TerminalSurface`].
///
/// When the remote process disappears the next input (or resize) recreates the
/// PTY with the last known size. Only one reconnect runs at a time and input
/// that arrives meanwhile is dropped.
#[derive(Clone)]
pub struct TerminalSession {
    inner: Arc<TerminalInner>,
}

impl TerminalSession {
    pub(crate) fn new(
        id: u64,
        sandbox_id: &str,
        registry: Arc<Mutex<SessionRegistry>>,
        surface: Arc<dyn TerminalSurface>,
    ) -> Self {
        Self {
            inner: Arc::new(TerminalInner {
                id,
                sandbox_id: sandbox_id.to_string(),
                registry,
                surface,
                state: Mutex::new(TerminalState::Opening),
                size: Mutex::new(TerminalSize::default()),
                pty: Mutex::new(None),
                reconnecting: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn sandbox_id(&self) -> &str {
        &self.inner.sandbox_id
    }

    pub fn state(&self) -> TerminalState {
        *lock(&self.inner.state)
    }

    pub fn dimensions(&self) -> TerminalSize {
        *lock(&self.inner.size)
    }

    /// Pid of the PTY currently attached, if any.
    pub fn pid(&self) -> Option<u32> {
        lock(&self.inner.pty).as_ref().map(|active| active.pid)
    }

    pub async fn open(&self, size: TerminalSize) -> Result<(), SandboxError> {
        if self.state() != TerminalState::Opening {
            return Err(SandboxError::invalid("terminal was already opened"));
        }
        *lock(&self.inner.size) = size;

        let Some(handle) = self.connected_handle() else {
            self.fail(&format!("Sandbox {} is not connected", self.inner.sandbox_id));
            return Err(SandboxError::not_connected(&self.inner.sandbox_id));
        };
        match self.start_pty(handle, size).await {
            Ok(pid) => {
                self.set_state(TerminalState::Running);
                info!(sandbox_id = %self.inner.sandbox_id, pid, %size, "terminal opened");
                Ok(())
            }
            Err(err) => {
                self.fail(&format!("Failed to start terminal: {err}"));
                Err(remote_error(&self.inner.sandbox_id, "pty", err))
            }
        }
    }

    pub async fn handle_input(&self, data: &str) -> Result<InputOutcome, SandboxError> {
        if self.inner.reconnecting.load(Ordering::SeqCst) {
            debug!(sandbox_id = %self.inner.sandbox_id, "dropping input during reconnect");
            return Ok(InputOutcome::Dropped);
        }
        let Some((handle, pid)) = self.current() else {
            return Ok(InputOutcome::Dropped);
        };
        match handle.send_pty_input(pid, data.as_bytes()).await {
            Ok(()) => Ok(InputOutcome::Delivered),
            Err(err) if is_process_gone(&err) => {
                let Some(_claim) = self.try_claim_reconnect() else {
                    debug!(sandbox_id = %self.inner.sandbox_id, "reconnect already running");
                    return Ok(InputOutcome::Dropped);
                };
                let (handle, pid) = self.reconnect(pid).await?;
                handle
                    .send_pty_input(pid, data.as_bytes())
                    .await
                    .map_err(|err| remote_error(&self.inner.sandbox_id, "pty input", err))?;
                Ok(InputOutcome::Resent)
            }
            Err(err) => Err(remote_error(&self.inner.sandbox_id, "pty input", err)),
        }
    }

    /// Records the new size and resizes the PTY. Resize failures other than a
    /// dead process are ignored.
    pub async fn set_dimensions(&self, size: TerminalSize) -> Result<(), SandboxError> {
        *lock(&self.inner.size) = size;
        let Some((handle, pid)) = self.current() else {
            return Ok(());
        };
        match handle.resize_pty(pid, size).await {
            Ok(()) => Ok(()),
            Err(err) if is_process_gone(&err) => {
                if let Some(_claim) = self.try_claim_reconnect() {
                    let (handle, pid) = self.reconnect(pid).await?;
                    if let Err(err) = handle.resize_pty(pid, self.dimensions()).await {
                        let sandbox_id = &self.inner.sandbox_id;
                        debug!(%sandbox_id, pid, error = %err, "resize failed");
                    }
                }
                Ok(())
            }
            Err(err) => {
                debug!(sandbox_id = %self.inner.sandbox_id, pid, error = %err, "resize failed");
                Ok(())
            }
        }
    }

    /// Kills the remote process, ignoring failures.
    pub async fn close(&self) {
        self.set_state(TerminalState::Closed);
        let active = lock(&self.inner.pty).take();
        if let Some(active) = active {
            if let Err(err) = active.handle.kill_pty(active.pid).await {
                let sandbox_id = &self.inner.sandbox_id;
                debug!(%sandbox_id, pid = active.pid, error = %err, "kill failed");
            }
        }
    }

    /// Closes the session and tells the surface the terminal is gone.
    pub(crate) async fn shutdown(&self) {
        let was_open = self.state() != TerminalState::Closed;
        self.close().await;
        if was_open {
            self.inner.surface.close(0);
        }
    }

    fn current(&self) -> Option<(Arc<dyn SandboxHandle>, u32)> {
        lock(&self.inner.pty)
            .as_ref()
            .map(|active| (active.handle.clone(), active.pid))
    }

    fn connected_handle(&self) -> Option<Arc<dyn SandboxHandle>> {
        lock(&self.inner.registry).get(&self.inner.sandbox_id)
    }

    fn set_state(&self, state: TerminalState) {
        *lock(&self.inner.state) = state;
    }

    fn try_claim_reconnect(&self) -> Option<ReconnectClaim<'_>> {
        self.inner
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| ReconnectClaim(&self.inner.reconnecting))
    }

    fn fail(&self, message: &str) {
        self.inner.surface.write(&format!("\r\n{RED}{message}{RESET}\r\n"));
        self.inner.surface.close(1);
        self.set_state(TerminalState::Closed);
    }

    async fn start_pty(
        &self,
        handle: Arc<dyn SandboxHandle>,
        size: TerminalSize,
    ) -> RuntimeResult<u32> {
        let PtyProcess { pid, output } = handle.create_pty(size).await?;
        let forwarder = tokio::spawn(forward_output(output, self.inner.surface.clone()));
        *lock(&self.inner.pty) = Some(ActivePty {
            handle,
            pid,
            forwarder,
        });
        Ok(pid)
    }

    /// Replaces the dead PTY `dead_pid`. The caller holds the reconnect claim.
    ///
    /// A caller whose failed call raced an earlier reconnect finds a different PTY
    /// already attached and gets that one back instead.
    async fn reconnect(
        &self,
        dead_pid: u32,
    ) -> Result<(Arc<dyn SandboxHandle>, u32), SandboxError> {
        let sandbox_id = self.inner.sandbox_id.clone();
        if let Some((handle, pid)) = self.current() {
            if pid != dead_pid {
                debug!(%sandbox_id, dead_pid, pid, "pty already replaced");
                return Ok((handle, pid));
            }
        }
        warn!(%sandbox_id, pid = dead_pid, "terminal process not found, reconnecting");
        self.set_state(TerminalState::Reconnecting);
        self.inner.surface.write(&format!(
            "\r\n{YELLOW}Terminal process ended, reconnecting...{RESET}\r\n"
        ));
        drop(lock(&self.inner.pty).take());

        let Some(handle) = self.connected_handle() else {
            self.fail(&format!("Sandbox {sandbox_id} is no longer connected"));
            return Err(SandboxError::not_connected(&sandbox_id));
        };
        let size = self.dimensions();
        match self.start_pty(handle.clone(), size).await {
            Ok(pid) => {
                if self.state() == TerminalState::Closed {
                    drop(lock(&self.inner.pty).take());
                    let _ = handle.kill_pty(pid).await;
                    return Err(SandboxError::invalid("terminal was closed while reconnecting"));
                }
                self.set_state(TerminalState::Running);
                self.inner
                    .surface
                    .write(&format!("{GREEN}Reconnected to sandbox {sandbox_id}{RESET}\r\n"));
                info!(%sandbox_id, pid, "terminal reconnected");
                Ok((handle, pid))
            }
            Err(err) => {
                self.fail(&format!("Failed to reconnect terminal: {err}"));
                Err(remote_error(&sandbox_id, "pty", err))
            }
        }
    }
}

async fn forward_output(mut output: mpsc::Receiver<Vec<u8>>, surface: Arc<dyn TerminalSurface>) {
    let mut pending = Vec::new();
    while let Some(chunk) = output.recv().await {
        pending.extend_from_slice(&chunk);
        let text = decode_available(&mut pending);
        if !text.is_empty() {
            surface.write(&text);
        }
    }
    if !pending.is_empty() {
        surface.write(&String::from_utf8_lossy(&pending));
    }
}

/// Decodes `pending`, holding back a trailing partial UTF-8 sequence for the
/// next chunk.
fn decode_available(pending: &mut Vec<u8>) -> String {
    let keep = match std::str::from_utf8(pending) {
        Err(err) if err.error_len().is_none() => pending.len() - err.valid_up_to(),
        _ => 0,
    };
    let tail = pending.split_off(pending.len() - keep);
    let text = String::from_utf8_lossy(pending).into_owned();
    *pending = tail;
    text
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::{MockSandbox, RecordingSurface};

    fn session(sandbox: &Arc<MockSandbox>) -> (TerminalSession, Arc<RecordingSurface>) {
        let mut registry = SessionRegistry::new();
        registry.insert(sandbox.sandbox_id(), sandbox.clone());
        let surface = RecordingSurface::new();
        let terminal = TerminalSession::new(
            1,
            sandbox.sandbox_id(),
            Arc::new(Mutex::new(registry)),
            surface.clone(),
        );
        (terminal, surface)
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn split_utf8_sequences_are_carried_over() {
        let mut pending = "héllo".as_bytes()[..2].to_vec();
        assert_eq!(decode_available(&mut pending), "h");
        assert_eq!(pending, vec![0xc3]);
        pending.extend_from_slice(&"héllo".as_bytes()[2..]);
        assert_eq!(decode_available(&mut pending), "éllo");
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn output_is_forwarded_to_the_surface() {
        let sandbox = MockSandbox::new("sbx-1");
        let (terminal, surface) = session(&sandbox);
        terminal.open(TerminalSize::new(100, 30)).await.expect("open");

        let pid = terminal.pid().expect("pty");
        assert_eq!(sandbox.pty_size(pid), Some(TerminalSize::new(100, 30)));
        assert!(sandbox.emit_pty_output(pid, b"user@sbx:~$ ").await);
        eventually(|| surface.output().contains("user@sbx:~$ ")).await;
        assert_eq!(terminal.state(), TerminalState::Running);
    }

    #[tokio::test]
    async fn unrelated_resize_errors_are_ignored() {
        let sandbox = MockSandbox::new("sbx-1");
        let (terminal, _surface) = session(&sandbox);
        terminal.open(TerminalSize::default()).await.expect("open");

        sandbox.fail(
            "resize_pty",
            crate::runtime::RuntimeError::other("resize unsupported"),
        );
        terminal
            .set_dimensions(TerminalSize::new(120, 40))
            .await
            .expect("ignored");
        assert_eq!(terminal.dimensions(), TerminalSize::new(120, 40));
        assert_eq!(sandbox.pty_count(), 1);
    }

    #[tokio::test]
    async fn resize_of_dead_pty_reconnects_with_new_size() {
        let sandbox = MockSandbox::new("sbx-1");
        let (terminal, surface) = session(&sandbox);
        terminal.open(TerminalSize::default()).await.expect("open");
        let old = terminal.pid().expect("pty");
        sandbox.kill_process(old);

        terminal
            .set_dimensions(TerminalSize::new(132, 43))
            .await
            .expect("reconnect");

        let new = terminal.pid().expect("new pty");
        assert_ne!(old, new);
        assert_eq!(sandbox.pty_size(new), Some(TerminalSize::new(132, 43)));
        assert!(surface.output().contains("reconnecting"));
        assert_eq!(terminal.state(), TerminalState::Running);
    }

    #[tokio::test]
    async fn reconnect_after_disconnect_closes_the_terminal() {
        let sandbox = MockSandbox::new("sbx-1");
        let mut registry = SessionRegistry::new();
        registry.insert("sbx-1", sandbox.clone());
        let registry = Arc::new(Mutex::new(registry));
        let surface = RecordingSurface::new();
        let terminal = TerminalSession::new(1, "sbx-1", registry.clone(), surface.clone());
        terminal.open(TerminalSize::default()).await.expect("open");

        sandbox.kill_process(terminal.pid().expect("pty"));
        lock(&registry).remove("sbx-1");

        let err = terminal.handle_input("ls\r").await.expect_err("disconnected");
        assert!(matches!(err, SandboxError::NotConnected { .. }));
        assert_eq!(terminal.state(), TerminalState::Closed);
        assert_eq!(surface.exit_code(), Some(1));
        let output = surface.output();
        assert!(output.contains("reconnecting"));
        assert!(output.contains("Sandbox sbx-1 is no longer connected"));
        assert_eq!(sandbox.pty_count(), 1);
    }

    #[tokio::test]
    async fn close_swallows_kill_failures() {
        let sandbox = MockSandbox::new("sbx-1");
        let (terminal, _surface) = session(&sandbox);
        terminal.open(TerminalSize::default()).await.expect("open");
        sandbox.kill_process(terminal.pid().expect("pty"));

        terminal.close().await;
        assert_eq!(terminal.state(), TerminalState::Closed);
        assert!(terminal.pid().is_none());
        assert_eq!(
            terminal.handle_input("ls\r").await.expect("closed"),
            InputOutcome::Dropped
        );
    }
}
