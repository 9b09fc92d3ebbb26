//! Session and file-index management for remote compute sandboxes.
//!
//! [`SandboxExplorer`] tracks connected sandboxes, routes file operations to
//! them through [`SandboxFiles`], caches recursive file listings, and keeps
//! interactive terminals alive across remote process restarts.

use std::sync::{Mutex, MutexGuard};

pub mod config;
pub mod credentials;
pub mod explorer;
pub mod filesystem;
pub mod index_cache;
pub mod local;
pub mod logging;
pub mod paths;
pub mod registry;
pub mod runtime;
pub mod scan;
pub mod terminal;
pub mod testing;
pub mod uri;

pub use sandbox_explorer_error::{ErrorReport, ErrorType, SandboxError};

pub use config::ExplorerConfig;
pub use credentials::{CredentialResolver, KeySource, API_KEY_ENV};
pub use explorer::{ConnectionState, FileIndex, SandboxExplorer, SandboxSummary};
pub use filesystem::{FileKind, FileStat, SandboxFiles};
pub use index_cache::{FileIndexCache, IndexSnapshot, IndexedFile, INDEX_TTL};
pub use local::{LocalRuntime, LOCAL_SANDBOX_ID};
pub use logging::{init_logging, try_init_logging};
pub use runtime::{
    is_process_gone, CommandOutput, EntryInfo, EntryKind, PtyProcess, RuntimeError,
    RuntimeErrorKind, RuntimeResult, SandboxHandle, SandboxInfo, SandboxRuntime, TerminalSize,
};
pub use scan::{ScanCancellation, ScanOutcome, ScanPhase, ScanProgress};
pub use terminal::{InputOutcome, TerminalSession, TerminalState, TerminalSurface};
pub use uri::SandboxUri;

/// Locks `mutex`, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}
