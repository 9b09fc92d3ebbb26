//! In-memory doubles for the runtime boundary and the terminal surface.
//!
//! Always compiled so integration tests and downstream hosts can drive the
//! explorer without a sandbox service.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use crate::lock;
use crate::paths;
use crate::runtime::{
    CommandOutput, EntryInfo, EntryKind, PtyProcess, RuntimeError, RuntimeErrorKind,
    RuntimeResult, SandboxHandle, SandboxInfo, SandboxRuntime, TerminalSize,
};
use crate::terminal::TerminalSurface;

#[derive(Debug, Clone)]
enum Node {
    File(Vec<u8>),
    Directory,
}

#[derive(Debug)]
struct MockPty {
    output: Option<mpsc::Sender<Vec<u8>>>,
    size: TerminalSize,
    inputs: Vec<Vec<u8>>,
}

impl MockPty {
    fn alive(&self) -> bool {
        self.output.is_some()
    }
}

/// A sandbox whose filesystem, commands and PTYs live in memory.
///
/// Commands are answered by the most recent [`MockSandbox::respond_to`] rule
/// whose fragment the command contains; unmatched commands exit with status 1
/// and no output.
#[derive(Debug)]
pub struct MockSandbox {
    id: String,
    nodes: Mutex<BTreeMap<String, Node>>,
    rules: Mutex<Vec<(String, CommandOutput)>>,
    commands: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, RuntimeError>>,
    ptys: Mutex<BTreeMap<u32, MockPty>>,
    next_pid: AtomicU32,
    pty_gate: Mutex<Option<Arc<Notify>>>,
    input_gate: Mutex<Option<Arc<Notify>>>,
    held_inputs: AtomicUsize,
}

impl MockSandbox {
    pub fn new(id: &str) -> Arc<Self> {
        let mut nodes = BTreeMap::new();
        nodes.insert(paths::ROOT.to_string(), Node::Directory);
        Arc::new(Self {
            id: id.to_string(),
            nodes: Mutex::new(nodes),
            rules: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            ptys: Mutex::new(BTreeMap::new()),
            next_pid: AtomicU32::new(100),
            pty_gate: Mutex::new(None),
            input_gate: Mutex::new(None),
            held_inputs: AtomicUsize::new(0),
        })
    }

    /// Adds a file, creating missing parent directories.
    pub fn add_file(&self, path: &str, content: impl Into<Vec<u8>>) {
        let mut nodes = lock(&self.nodes);
        insert_parents(&mut nodes, path);
        nodes.insert(paths::normalize(path), Node::File(content.into()));
    }

    pub fn add_dir(&self, path: &str) {
        let mut nodes = lock(&self.nodes);
        insert_parents(&mut nodes, path);
        nodes.insert(paths::normalize(path), Node::Directory);
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match lock(&self.nodes).get(&paths::normalize(path)) {
            Some(Node::File(content)) => Some(content.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        lock(&self.nodes).contains_key(&paths::normalize(path))
    }

    pub fn respond_to(&self, fragment: &str, output: CommandOutput) {
        lock(&self.rules).push((fragment.to_string(), output));
    }

    /// Every command run so far, in order.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }

    /// Makes every later call of `operation` (`list`, `read`, `write`, `remove`,
    /// `make_dir`, `rename`, `run`, `create_pty`, `resize_pty`, `kill_pty`) fail.
    pub fn fail(&self, operation: &str, error: RuntimeError) {
        lock(&self.failures).insert(operation.to_string(), error);
    }

    pub fn recover(&self, operation: &str) {
        lock(&self.failures).remove(operation);
    }

    /// Blocks PTY creation until the returned notify is signalled.
    pub fn hold_pty_creation(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *lock(&self.pty_gate) = Some(gate.clone());
        gate
    }

    pub fn release_pty_creation(&self) {
        if let Some(gate) = lock(&self.pty_gate).take() {
            gate.notify_one();
        }
    }

    /// Makes the next PTY input wait until the returned notify is signalled. The
    /// liveness check runs after the wait.
    pub fn hold_next_pty_input(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *lock(&self.input_gate) = Some(gate.clone());
        gate
    }

    /// PTY inputs currently waiting on [`MockSandbox::hold_next_pty_input`].
    pub fn held_pty_inputs(&self) -> usize {
        self.held_inputs.load(Ordering::SeqCst)
    }

    /// Pids of every PTY ever created, oldest first.
    pub fn pty_pids(&self) -> Vec<u32> {
        lock(&self.ptys).keys().copied().collect()
    }

    pub fn pty_count(&self) -> usize {
        lock(&self.ptys).len()
    }

    pub fn live_pty_pids(&self) -> Vec<u32> {
        lock(&self.ptys)
            .iter()
            .filter(|(_, pty)| pty.alive())
            .map(|(pid, _)| *pid)
            .collect()
    }

    pub fn pty_inputs(&self, pid: u32) -> Vec<Vec<u8>> {
        lock(&self.ptys)
            .get(&pid)
            .map(|pty| pty.inputs.clone())
            .unwrap_or_default()
    }

    pub fn pty_size(&self, pid: u32) -> Option<TerminalSize> {
        lock(&self.ptys).get(&pid).map(|pty| pty.size)
    }

    /// Simulates the remote process exiting: the output stream ends and later
    /// calls for `pid` fail with "process not found".
    pub fn kill_process(&self, pid: u32) {
        if let Some(pty) = lock(&self.ptys).get_mut(&pid) {
            pty.output = None;
        }
    }

    pub async fn emit_pty_output(&self, pid: u32, bytes: &[u8]) -> bool {
        let sender = lock(&self.ptys)
            .get(&pid)
            .and_then(|pty| pty.output.clone());
        match sender {
            Some(sender) => sender.send(bytes.to_vec()).await.is_ok(),
            None => false,
        }
    }

    fn check(&self, operation: &str) -> RuntimeResult<()> {
        match lock(&self.failures).get(operation) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn with_live_pty<T>(&self, pid: u32, f: impl FnOnce(&mut MockPty) -> T) -> RuntimeResult<T> {
        let mut ptys = lock(&self.ptys);
        match ptys.get_mut(&pid) {
            Some(pty) if pty.alive() => Ok(f(pty)),
            _ => Err(RuntimeError::process_not_found(pid)),
        }
    }
}

fn insert_parents(nodes: &mut BTreeMap<String, Node>, path: &str) {
    let mut parent = paths::parent(path);
    while let Some(directory) = parent {
        parent = paths::parent(&directory);
        nodes.entry(directory).or_insert(Node::Directory);
    }
}

fn not_found(path: &str) -> RuntimeError {
    RuntimeError::new(RuntimeErrorKind::NotFound, format!("path {path} not found"))
}

fn is_within(candidate: &str, path: &str) -> bool {
    candidate == path
        || (path == paths::ROOT && candidate != paths::ROOT)
        || candidate.starts_with(&format!("{path}/"))
}

#[async_trait]
impl SandboxHandle for MockSandbox {
    fn sandbox_id(&self) -> &str {
        &self.id
    }

    async fn list(&self, path: &str) -> RuntimeResult<Vec<EntryInfo>> {
        self.check("list")?;
        let path = paths::normalize(path);
        let nodes = lock(&self.nodes);
        match nodes.get(&path) {
            Some(Node::Directory) => {}
            Some(Node::File(_)) => {
                return Err(RuntimeError::other(format!("{path} is not a directory")))
            }
            None => return Err(not_found(&path)),
        }
        Ok(nodes
            .iter()
            .filter(|(candidate, _)| {
                candidate.as_str() != paths::ROOT
                    && paths::parent(candidate).as_deref() == Some(path.as_str())
            })
            .map(|(candidate, node)| EntryInfo {
                name: paths::file_name(candidate).to_string(),
                path: candidate.clone(),
                kind: match node {
                    Node::File(_) => EntryKind::File,
                    Node::Directory => EntryKind::Directory,
                },
            })
            .collect())
    }

    async fn read(&self, path: &str) -> RuntimeResult<Vec<u8>> {
        self.check("read")?;
        self.file(path).ok_or_else(|| not_found(path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> RuntimeResult<()> {
        self.check("write")?;
        self.add_file(path, content.to_vec());
        Ok(())
    }

    async fn remove(&self, path: &str) -> RuntimeResult<()> {
        self.check("remove")?;
        let path = paths::normalize(path);
        let mut nodes = lock(&self.nodes);
        if !nodes.contains_key(&path) {
            return Err(not_found(&path));
        }
        nodes.retain(|candidate, _| !is_within(candidate, &path) || candidate == paths::ROOT);
        Ok(())
    }

    async fn make_dir(&self, path: &str) -> RuntimeResult<()> {
        self.check("make_dir")?;
        self.add_dir(path);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> RuntimeResult<()> {
        self.check("rename")?;
        let from = paths::normalize(from);
        let to = paths::normalize(to);
        let mut nodes = lock(&self.nodes);
        if !nodes.contains_key(&from) {
            return Err(not_found(&from));
        }
        let moved = nodes
            .keys()
            .filter(|candidate| is_within(candidate, &from))
            .cloned()
            .collect::<Vec<_>>();
        for old in moved {
            if let Some(node) = nodes.remove(&old) {
                let new = format!("{to}{}", &old[from.len()..]);
                nodes.insert(new, node);
            }
        }
        insert_parents(&mut nodes, &to);
        Ok(())
    }

    async fn run(&self, command: &str) -> RuntimeResult<CommandOutput> {
        lock(&self.commands).push(command.to_string());
        self.check("run")?;
        let rules = lock(&self.rules);
        Ok(rules
            .iter()
            .rev()
            .find(|(fragment, _)| command.contains(fragment.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or(CommandOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 1,
            }))
    }

    async fn create_pty(&self, size: TerminalSize) -> RuntimeResult<PtyProcess> {
        let gate = lock(&self.pty_gate).clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.check("create_pty")?;
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        lock(&self.ptys).insert(
            pid,
            MockPty {
                output: Some(tx),
                size,
                inputs: Vec::new(),
            },
        );
        Ok(PtyProcess { pid, output: rx })
    }

    async fn send_pty_input(&self, pid: u32, data: &[u8]) -> RuntimeResult<()> {
        let gate = lock(&self.input_gate).take();
        if let Some(gate) = gate {
            self.held_inputs.fetch_add(1, Ordering::SeqCst);
            gate.notified().await;
            self.held_inputs.fetch_sub(1, Ordering::SeqCst);
        }
        self.with_live_pty(pid, |pty| pty.inputs.push(data.to_vec()))
    }

    async fn resize_pty(&self, pid: u32, size: TerminalSize) -> RuntimeResult<()> {
        self.check("resize_pty")?;
        self.with_live_pty(pid, |pty| pty.size = size)
    }

    async fn kill_pty(&self, pid: u32) -> RuntimeResult<()> {
        self.check("kill_pty")?;
        self.with_live_pty(pid, |pty| pty.output = None)
    }
}

/// A sandbox service holding a fixed set of [`MockSandbox`]es.
#[derive(Debug, Default)]
pub struct MockRuntime {
    sandboxes: Mutex<BTreeMap<String, (SandboxInfo, Arc<MockSandbox>)>>,
    connect_failures: Mutex<HashMap<String, RuntimeError>>,
    connects: AtomicUsize,
    api_keys: Mutex<Vec<String>>,
    connect_gate: Mutex<Option<Arc<Notify>>>,
}

impl MockRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, sandbox: Arc<MockSandbox>) -> Arc<MockSandbox> {
        let info = SandboxInfo::new(sandbox.sandbox_id());
        self.add_with_info(info, sandbox)
    }

    pub fn add_with_info(&self, info: SandboxInfo, sandbox: Arc<MockSandbox>) -> Arc<MockSandbox> {
        lock(&self.sandboxes).insert(info.sandbox_id.clone(), (info, sandbox.clone()));
        sandbox
    }

    pub fn sandbox(&self, sandbox_id: &str) -> Option<Arc<MockSandbox>> {
        lock(&self.sandboxes)
            .get(sandbox_id)
            .map(|(_, sandbox)| sandbox.clone())
    }

    /// Blocks every connect until [`MockRuntime::release_connects`].
    pub fn hold_connects(&self) {
        *lock(&self.connect_gate) = Some(Arc::new(Notify::new()));
    }

    pub fn release_connects(&self) {
        if let Some(gate) = lock(&self.connect_gate).take() {
            gate.notify_waiters();
        }
    }

    pub fn fail_connect(&self, sandbox_id: &str, error: RuntimeError) {
        lock(&self.connect_failures).insert(sandbox_id.to_string(), error);
    }

    /// Successful and failed connect attempts alike.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn api_keys_seen(&self) -> Vec<String> {
        lock(&self.api_keys).clone()
    }
}

#[async_trait]
impl SandboxRuntime for MockRuntime {
    async fn list(&self, api_key: &str) -> RuntimeResult<Vec<SandboxInfo>> {
        lock(&self.api_keys).push(api_key.to_string());
        Ok(lock(&self.sandboxes)
            .values()
            .map(|(info, _)| info.clone())
            .collect())
    }

    async fn connect(
        &self,
        sandbox_id: &str,
        api_key: &str,
    ) -> RuntimeResult<Arc<dyn SandboxHandle>> {
        let gate = lock(&self.connect_gate).clone();
        let notified = gate.as_ref().map(|gate| gate.notified());
        self.connects.fetch_add(1, Ordering::SeqCst);
        lock(&self.api_keys).push(api_key.to_string());
        if let Some(notified) = notified {
            notified.await;
        }
        if let Some(error) = lock(&self.connect_failures).get(sandbox_id) {
            return Err(error.clone());
        }
        match lock(&self.sandboxes).get(sandbox_id) {
            Some((_, sandbox)) => Ok(sandbox.clone() as Arc<dyn SandboxHandle>),
            None => Err(RuntimeError::new(
                RuntimeErrorKind::NotFound,
                format!("sandbox {sandbox_id} not found"),
            )),
        }
    }
}

/// Captures what a terminal session shows to the user.
#[derive(Debug, Default)]
pub struct RecordingSurface {
    output: Mutex<String>,
    exit_code: Mutex<Option<i32>>,
}

impl RecordingSurface {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn output(&self) -> String {
        lock(&self.output).clone()
    }

    pub fn exit_code(&self) -> Option<i32> {
        *lock(&self.exit_code)
    }
}

impl TerminalSurface for RecordingSurface {
    fn write(&self, text: &str) {
        lock(&self.output).push_str(text);
    }

    fn close(&self, exit_code: i32) {
        *lock(&self.exit_code) = Some(exit_code);
    }
}
