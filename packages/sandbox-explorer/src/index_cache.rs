use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::paths;

pub const INDEX_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedFile {
    pub path: String,
    pub name: String,
}

impl IndexedFile {
    pub fn from_path(path: impl Into<String>) -> Self {
        let path = path.into();
        let name = paths::file_name(&path).to_string();
        Self { path, name }
    }

    /// Substring match, or a `*`/`?` glob when the query contains either, against
    /// the file name and then the full path.
    pub fn matches(&self, query: &str, case_sensitive: bool) -> bool {
        let query = query.trim();
        if query.is_empty() {
            return true;
        }
        matches_query(&self.name, query, case_sensitive)
            || matches_query(&self.path, query, case_sensitive)
    }
}

/// A cached listing as handed out to callers.
#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    pub files: Arc<Vec<IndexedFile>>,
    pub created_at: Instant,
    pub via_vcs: bool,
}

impl IndexSnapshot {
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct IndexKey {
    sandbox_id: String,
    path: String,
}

impl IndexKey {
    fn new(sandbox_id: &str, path: &str) -> Self {
        Self {
            sandbox_id: sandbox_id.to_string(),
            path: paths::normalize(path),
        }
    }
}

/// Recursive file listings per (sandbox, directory), expiring after a TTL.
///
/// Invalidating a path drops the entry for that path and for each of its
/// ancestors. Descendant entries are left alone since only one entry per exact
/// directory is ever written.
#[derive(Debug)]
pub struct FileIndexCache {
    entries: HashMap<IndexKey, IndexSnapshot>,
    ttl: Duration,
}

impl Default for FileIndexCache {
    fn default() -> Self {
        Self::new(INDEX_TTL)
    }
}

impl FileIndexCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    pub fn get(&mut self, sandbox_id: &str, path: &str) -> Option<IndexSnapshot> {
        self.get_at(sandbox_id, path, Instant::now())
    }

    pub fn get_at(
        &mut self,
        sandbox_id: &str,
        path: &str,
        now: Instant,
    ) -> Option<IndexSnapshot> {
        let key = IndexKey::new(sandbox_id, path);
        let entry = self.entries.get(&key)?;
        if now.saturating_duration_since(entry.created_at) >= self.ttl {
            self.entries.remove(&key);
            return None;
        }
        Some(entry.clone())
    }

    pub fn set(&mut self, sandbox_id: &str, path: &str, files: Vec<IndexedFile>, via_vcs: bool) {
        self.set_at(sandbox_id, path, files, via_vcs, Instant::now());
    }

    pub fn set_at(
        &mut self,
        sandbox_id: &str,
        path: &str,
        files: Vec<IndexedFile>,
        via_vcs: bool,
        now: Instant,
    ) {
        self.entries.insert(
            IndexKey::new(sandbox_id, path),
            IndexSnapshot {
                files: Arc::new(files),
                created_at: now,
                via_vcs,
            },
        );
    }

    /// Drops `path` and its ancestors for `sandbox_id`, or every entry of the
    /// sandbox when `path` is `None`. Returns how many entries were removed.
    pub fn invalidate(&mut self, sandbox_id: &str, path: Option<&str>) -> usize {
        let before = self.entries.len();
        match path {
            Some(path) => {
                for ancestor in paths::ancestors(path) {
                    self.entries.remove(&IndexKey {
                        sandbox_id: sandbox_id.to_string(),
                        path: ancestor,
                    });
                }
            }
            None => self.entries.retain(|key, _| key.sandbox_id != sandbox_id),
        }
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn contains(&self, sandbox_id: &str, path: &str) -> bool {
        self.entries.contains_key(&IndexKey::new(sandbox_id, path))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn matches_query(candidate: &str, query: &str, case_sensitive: bool) -> bool {
    let candidate = normalize_query(candidate, case_sensitive);
    let query = normalize_query(query, case_sensitive);
    if query.contains('*') || query.contains('?') {
        return glob_match(&query, &candidate);
    }
    candidate.contains(&query)
}

fn normalize_query(value: &str, case_sensitive: bool) -> String {
    if case_sensitive {
        value.to_string()
    } else {
        value.to_lowercase()
    }
}

/// `*` matches any run of characters and `?` exactly one. Backtracks only to the
/// most recent `*`, so the cost stays linear in the pattern times the text.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern = pattern.chars().collect::<Vec<_>>();
    let text = text.chars().collect::<Vec<_>>();
    let (mut p, mut t) = (0, 0);
    let mut star = None;
    let mut mark = 0;
    while t < text.len() {
        match pattern.get(p) {
            Some(&'*') => {
                star = Some(p);
                mark = t;
                p += 1;
            }
            Some(&ch) if ch == '?' || ch == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match star {
                Some(star) => {
                    p = star + 1;
                    mark += 1;
                    t = mark;
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&ch| ch == '*')
}
