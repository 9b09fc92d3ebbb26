use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use sandbox_explorer_error::SandboxError;

use crate::config::ExplorerConfig;
use crate::credentials::CredentialResolver;
use crate::filesystem::{remote_error, SandboxFiles};
use crate::index_cache::{FileIndexCache, IndexSnapshot};
use crate::lock;
use crate::paths;
use crate::registry::{RootPathStore, SessionRegistry};
use crate::runtime::{SandboxHandle, SandboxInfo, SandboxRuntime, TerminalSize};
use crate::scan::{IndexScanner, ScanCancellation, ScanOutcome, ScanProgress};
use crate::terminal::{TerminalSession, TerminalState, TerminalSurface};
use crate::uri::SandboxUri;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    /// Connected, but no root path has been chosen yet.
    Configuring,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSummary {
    #[serde(flatten)]
    pub info: SandboxInfo,
    pub state: ConnectionState,
}

#[derive(Debug, Clone)]
pub enum FileIndex {
    Ready {
        snapshot: IndexSnapshot,
        from_cache: bool,
    },
    Cancelled,
}

/// Owns every piece of per-sandbox state: live handles, root paths, the file
/// index cache and open terminals. Hosts build one and share it behind an `Arc`.
pub struct SandboxExplorer {
    runtime: Arc<dyn SandboxRuntime>,
    credentials: CredentialResolver,
    config: ExplorerConfig,
    registry: Arc<Mutex<SessionRegistry>>,
    roots: Mutex<RootPathStore>,
    index: Mutex<FileIndexCache>,
    terminals: Mutex<HashMap<String, Vec<TerminalSession>>>,
    connecting: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    next_terminal_id: AtomicU64,
}

impl SandboxExplorer {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, config: ExplorerConfig) -> Self {
        Self {
            runtime,
            credentials: CredentialResolver::new(config.api_key.clone()),
            index: Mutex::new(FileIndexCache::new(config.index_cache_ttl())),
            config,
            registry: Arc::new(Mutex::new(SessionRegistry::new())),
            roots: Mutex::new(RootPathStore::new()),
            terminals: Mutex::new(HashMap::new()),
            connecting: Mutex::new(HashMap::new()),
            next_terminal_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &ExplorerConfig {
        &self.config
    }

    pub fn credentials(&self) -> &CredentialResolver {
        &self.credentials
    }

    pub fn files(&self) -> SandboxFiles<'_> {
        SandboxFiles::new(self)
    }

    /// Connects unless already connected; the existing handle is reused then.
    /// Concurrent calls for one id share a single remote connect.
    pub async fn connect(&self, sandbox_id: &str) -> Result<Arc<dyn SandboxHandle>, SandboxError> {
        if let Some(handle) = lock(&self.registry).get(sandbox_id) {
            debug!(sandbox_id, "already connected");
            return Ok(handle);
        }
        let gate = lock(&self.connecting)
            .entry(sandbox_id.to_string())
            .or_default()
            .clone();
        let _connecting = gate.lock().await;
        if let Some(handle) = lock(&self.registry).get(sandbox_id) {
            debug!(sandbox_id, "connected while waiting");
            return Ok(handle);
        }
        let api_key = self.credentials.api_key().ok_or(SandboxError::AuthRequired)?;
        let handle = self
            .runtime
            .connect(sandbox_id, &api_key)
            .await
            .map_err(|err| {
                warn!(sandbox_id, error = %err, "connect failed");
                SandboxError::ConnectionFailed {
                    sandbox_id: sandbox_id.to_string(),
                    message: err.message,
                }
            })?;
        let handle = lock(&self.registry).insert(sandbox_id, handle);
        info!(sandbox_id, "connected to sandbox");
        Ok(handle)
    }

    /// Disconnects one sandbox, or all of them when `sandbox_id` is `None`.
    /// Returns the ids that were connected.
    pub async fn disconnect(&self, sandbox_id: Option<&str>) -> Vec<String> {
        let ids = match sandbox_id {
            Some(id) if self.is_connected_to(id) => vec![id.to_string()],
            Some(_) => Vec::new(),
            None => self.connected_ids(),
        };

        for id in &ids {
            let terminals = lock(&self.terminals).remove(id).unwrap_or_default();
            for terminal in terminals {
                terminal.shutdown().await;
            }
        }

        match sandbox_id {
            Some(id) => {
                lock(&self.connecting).remove(id);
                lock(&self.registry).remove(id);
                lock(&self.roots).remove(id);
                lock(&self.index).invalidate(id, None);
            }
            None => {
                lock(&self.connecting).clear();
                lock(&self.registry).clear();
                lock(&self.roots).clear();
                lock(&self.index).clear();
            }
        }
        for id in &ids {
            info!(sandbox_id = %id, "disconnected from sandbox");
        }
        ids
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.registry).is_connected()
    }

    pub fn is_connected_to(&self, sandbox_id: &str) -> bool {
        lock(&self.registry).is_connected_to(sandbox_id)
    }

    pub fn connected_ids(&self) -> Vec<String> {
        lock(&self.registry).connected_ids()
    }

    /// See [`SessionRegistry::resolve`].
    pub fn resolve_handle(&self, sandbox_id: Option<&str>) -> Option<Arc<dyn SandboxHandle>> {
        lock(&self.registry).resolve(sandbox_id)
    }

    pub fn connection_state(&self, sandbox_id: &str) -> ConnectionState {
        if !self.is_connected_to(sandbox_id) {
            ConnectionState::Disconnected
        } else if lock(&self.roots).contains(sandbox_id) {
            ConnectionState::Connected
        } else {
            ConnectionState::Configuring
        }
    }

    /// Lists the account's sandboxes, optionally filtered by a case-insensitive
    /// match on id, name or template.
    pub async fn list_sandboxes(
        &self,
        filter: Option<&str>,
    ) -> Result<Vec<SandboxSummary>, SandboxError> {
        let api_key = self.credentials.api_key().ok_or(SandboxError::AuthRequired)?;
        let sandboxes = self
            .runtime
            .list(&api_key)
            .await
            .map_err(|err| SandboxError::ConnectionFailed {
                sandbox_id: String::new(),
                message: err.message,
            })?;
        let filter = filter
            .map(|filter| filter.trim().to_lowercase())
            .filter(|filter| !filter.is_empty());
        Ok(sandboxes
            .into_iter()
            .filter(|info| match &filter {
                Some(filter) => [
                    Some(info.sandbox_id.as_str()),
                    info.name.as_deref(),
                    info.template_id.as_deref(),
                ]
                .into_iter()
                .flatten()
                .any(|field| field.to_lowercase().contains(filter.as_str())),
                None => true,
            })
            .map(|info| SandboxSummary {
                state: self.connection_state(&info.sandbox_id),
                info,
            })
            .collect())
    }

    pub fn set_root_path(&self, sandbox_id: &str, path: &str) -> Result<String, SandboxError> {
        if !self.is_connected_to(sandbox_id) {
            return Err(SandboxError::not_connected(sandbox_id));
        }
        let root = paths::normalize_root(path)?;
        lock(&self.roots).set(sandbox_id, root.clone());
        debug!(sandbox_id, root = %root, "root path set");
        Ok(root)
    }

    pub fn root_path(&self, sandbox_id: &str) -> String {
        lock(&self.roots).get(sandbox_id)
    }

    /// Absolute paths are kept; relative ones are taken from the root path.
    pub fn resolve_path(&self, sandbox_id: &str, path: &str) -> String {
        if path.starts_with('/') {
            paths::normalize(path)
        } else {
            paths::join(&self.root_path(sandbox_id), path)
        }
    }

    pub fn sandbox_uri(&self, sandbox_id: &str, path: &str) -> SandboxUri {
        SandboxUri::new(&self.config.uri_scheme, sandbox_id, path)
    }

    pub fn parse_uri(&self, input: &str) -> Result<SandboxUri, SandboxError> {
        SandboxUri::parse(input, &self.config.uri_scheme)
    }

    /// Drops cached listings for `path` and its ancestors, or the whole sandbox.
    pub fn invalidate_index(&self, sandbox_id: &str, path: Option<&str>) -> usize {
        let removed = lock(&self.index).invalidate(sandbox_id, path);
        if removed > 0 {
            debug!(sandbox_id, path = ?path, removed, "file index invalidated");
        }
        removed
    }

    pub fn clear_index(&self) {
        lock(&self.index).clear();
    }

    pub fn cached_index(&self, sandbox_id: &str, path: &str) -> Option<IndexSnapshot> {
        lock(&self.index).get(sandbox_id, path)
    }

    /// Recursive file listing under `root` (the sandbox's root path when `None`).
    ///
    /// A fresh cached listing is reused unless `refresh` is set. Completed scans
    /// that found at least one file are cached; cancelled scans never are.
    pub async fn file_index(
        &self,
        sandbox_id: &str,
        root: Option<&str>,
        refresh: bool,
        cancel: &ScanCancellation,
        progress: &mut (dyn FnMut(ScanProgress) + Send),
    ) -> Result<FileIndex, SandboxError> {
        let handle = self.handle(sandbox_id)?;
        let root = match root {
            Some(root) => self.resolve_path(sandbox_id, root),
            None => self.root_path(sandbox_id),
        };

        if !refresh {
            if let Some(snapshot) = self.cached_index(sandbox_id, &root) {
                debug!(sandbox_id, root = %root, files = snapshot.len(), "file index cache hit");
                return Ok(FileIndex::Ready {
                    snapshot,
                    from_cache: true,
                });
            }
        }

        let outcome = IndexScanner::new(handle.as_ref(), &root, &self.config.search_ignore_patterns)
            .scan(cancel, progress)
            .await
            .map_err(|err| remote_error(sandbox_id, "scan", err))?;
        let (files, via_vcs) = match outcome {
            ScanOutcome::Completed { files, via_vcs } => (files, via_vcs),
            ScanOutcome::Cancelled => {
                info!(sandbox_id, root = %root, "file indexing cancelled");
                return Ok(FileIndex::Cancelled);
            }
        };

        let snapshot = if files.is_empty() {
            IndexSnapshot {
                files: Arc::new(files),
                created_at: Instant::now(),
                via_vcs,
            }
        } else {
            let mut index = lock(&self.index);
            index.set(sandbox_id, &root, files, via_vcs);
            match index.get(sandbox_id, &root) {
                Some(snapshot) => snapshot,
                None => return Err(SandboxError::invalid("file index expired immediately")),
            }
        };
        Ok(FileIndex::Ready {
            snapshot,
            from_cache: false,
        })
    }

    /// Opens a terminal on `sandbox_id`, or on the only connected sandbox.
    pub async fn open_terminal(
        &self,
        sandbox_id: Option<&str>,
        surface: Arc<dyn TerminalSurface>,
        size: TerminalSize,
    ) -> Result<TerminalSession, SandboxError> {
        let sandbox_id = match sandbox_id {
            Some(id) => id.to_string(),
            None => {
                let ids = self.connected_ids();
                match ids.as_slice() {
                    [only] => only.clone(),
                    [] => return Err(SandboxError::invalid("not connected to any sandbox")),
                    _ => {
                        return Err(SandboxError::invalid(
                            "several sandboxes are connected; choose one",
                        ))
                    }
                }
            }
        };

        let id = self.next_terminal_id.fetch_add(1, Ordering::SeqCst);
        let terminal = TerminalSession::new(id, &sandbox_id, self.registry.clone(), surface);
        terminal.open(size).await?;

        let mut terminals = lock(&self.terminals);
        let tracked = terminals.entry(sandbox_id).or_default();
        tracked.retain(|existing| existing.state() != TerminalState::Closed);
        tracked.push(terminal.clone());
        Ok(terminal)
    }

    /// Open terminals of one sandbox.
    pub fn terminals(&self, sandbox_id: &str) -> Vec<TerminalSession> {
        lock(&self.terminals)
            .get(sandbox_id)
            .map(|terminals| {
                terminals
                    .iter()
                    .filter(|terminal| terminal.state() != TerminalState::Closed)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn handle(&self, sandbox_id: &str) -> Result<Arc<dyn SandboxHandle>, SandboxError> {
        lock(&self.registry)
            .get(sandbox_id)
            .ok_or_else(|| SandboxError::not_connected(sandbox_id))
    }
}
