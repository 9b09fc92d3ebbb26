use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::index_cache::IndexedFile;
use crate::paths::{self, shell_quote};
use crate::runtime::{RuntimeError, RuntimeResult, SandboxHandle};

/// Progress is reported once per this many files, and again for the last one.
pub const PROGRESS_INTERVAL: usize = 100;

/// Cooperative cancellation shared between a scan and whoever started it.
#[derive(Debug, Clone, Default)]
pub struct ScanCancellation(Arc<AtomicBool>);

impl ScanCancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    DetectingRepository,
    Counting,
    Listing,
    Indexing,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanProgress {
    pub phase: ScanPhase,
    pub processed: usize,
    /// Known only when the counting pass succeeded with a non-zero result.
    pub total: Option<usize>,
    pub via_vcs: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Completed {
        files: Vec<IndexedFile>,
        via_vcs: bool,
    },
    Cancelled,
}

/// Recursive file enumeration under a root directory of one sandbox.
///
/// Inside a git working tree only tracked files are listed; elsewhere a `find`
/// walk runs that prunes the configured name patterns.
pub struct IndexScanner<'a> {
    handle: &'a dyn SandboxHandle,
    root: String,
    ignore_patterns: &'a [String],
}

impl<'a> IndexScanner<'a> {
    pub fn new(handle: &'a dyn SandboxHandle, root: &str, ignore_patterns: &'a [String]) -> Self {
        Self {
            handle,
            root: paths::normalize(root),
            ignore_patterns,
        }
    }

    pub async fn scan(
        &self,
        cancel: &ScanCancellation,
        progress: &mut (dyn FnMut(ScanProgress) + Send),
    ) -> RuntimeResult<ScanOutcome> {
        let mut report =
            |phase: ScanPhase, processed: usize, total: Option<usize>, via_vcs: bool| {
                progress(ScanProgress {
                    phase,
                    processed,
                    total,
                    via_vcs,
                })
            };

        report(ScanPhase::DetectingRepository, 0, None, false);
        let via_vcs = self.inside_repository().await;
        if cancel.is_cancelled() {
            return Ok(ScanOutcome::Cancelled);
        }

        report(ScanPhase::Counting, 0, None, via_vcs);
        let total = self.count(via_vcs).await;
        if cancel.is_cancelled() {
            return Ok(ScanOutcome::Cancelled);
        }

        report(ScanPhase::Listing, 0, total, via_vcs);
        let output = self.handle.run(&self.list_command(via_vcs)).await?;
        if cancel.is_cancelled() {
            return Ok(ScanOutcome::Cancelled);
        }

        let lines = output
            .stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .collect::<Vec<_>>();
        if !output.success() {
            if lines.is_empty() {
                return Err(listing_failed(output.exit_code, &output.stderr));
            }
            warn!(
                root = %self.root,
                exit_code = output.exit_code,
                stderr = %output.stderr.trim(),
                "file listing incomplete"
            );
        }

        let mut files = Vec::with_capacity(lines.len());
        for (index, line) in lines.iter().enumerate() {
            if cancel.is_cancelled() {
                return Ok(ScanOutcome::Cancelled);
            }
            let path = if via_vcs && !line.starts_with('/') {
                paths::join(&self.root, line)
            } else {
                line.to_string()
            };
            files.push(IndexedFile::from_path(path));
            if index % PROGRESS_INTERVAL == 0 || index + 1 == lines.len() {
                report(ScanPhase::Indexing, index + 1, total, via_vcs);
            }
        }

        report(ScanPhase::Completed, files.len(), total, via_vcs);
        debug!(
            sandbox_id = self.handle.sandbox_id(),
            root = %self.root,
            via_vcs,
            files = files.len(),
            "scanned files"
        );
        Ok(ScanOutcome::Completed { files, via_vcs })
    }

    async fn inside_repository(&self) -> bool {
        match self.handle.run(&self.repository_check_command()).await {
            Ok(output) => output.success() && output.stdout.trim() == "true",
            Err(err) => {
                debug!(root = %self.root, error = %err, "repository check failed");
                false
            }
        }
    }

    async fn count(&self, via_vcs: bool) -> Option<usize> {
        let command = format!("{} | wc -l", self.list_command(via_vcs));
        match self.handle.run(&command).await {
            Ok(output) if output.success() => output
                .stdout
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|total| *total > 0),
            Ok(_) => None,
            Err(err) => {
                warn!(root = %self.root, error = %err, "counting files failed");
                None
            }
        }
    }

    pub fn repository_check_command(&self) -> String {
        format!(
            "cd {} && git rev-parse --is-inside-work-tree 2>/dev/null",
            shell_quote(&self.root)
        )
    }

    pub fn list_command(&self, via_vcs: bool) -> String {
        if via_vcs {
            return format!("cd {} && git ls-files", shell_quote(&self.root));
        }
        let prunes = self
            .ignore_patterns
            .iter()
            .map(|pattern| format!("-name {} -prune", shell_quote(pattern)))
            .collect::<Vec<_>>();
        if prunes.is_empty() {
            format!("find {} -type f -print", shell_quote(&self.root))
        } else {
            format!(
                "find {} \\( {} \\) -o -type f -print",
                shell_quote(&self.root),
                prunes.join(" -o ")
            )
        }
    }
}

/// A listing that produced no paths and a non-zero exit.
fn listing_failed(exit_code: i32, stderr: &str) -> RuntimeError {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        RuntimeError::other(format!("listing files exited with status {exit_code}"))
    } else {
        RuntimeError::other(stderr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::CommandOutput;
    use crate::testing::MockSandbox;

    fn ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    #[test]
    fn find_command_prunes_patterns() {
        let sandbox = MockSandbox::new("sbx-1");
        let patterns = vec!["node_modules".to_string(), ".git".to_string()];
        let scanner = IndexScanner::new(sandbox.as_ref(), "/home/user/", &patterns);
        insta::assert_snapshot!(
            scanner.list_command(false),
            @r"find '/home/user' \( -name 'node_modules' -prune -o -name '.git' -prune \) -o -type f -print"
        );
        insta::assert_snapshot!(
            scanner.list_command(true),
            @"cd '/home/user' && git ls-files"
        );

        let scanner = IndexScanner::new(sandbox.as_ref(), "/srv", &[]);
        assert_eq!(scanner.list_command(false), "find '/srv' -type f -print");
    }

    #[tokio::test]
    async fn git_paths_are_made_absolute() {
        let sandbox = MockSandbox::new("sbx-1");
        sandbox.respond_to("rev-parse", ok("true\n"));
        sandbox.respond_to("git ls-files", ok("a.txt\nsub/b.txt\n"));
        sandbox.respond_to("| wc -l", ok("2\n"));

        let scanner = IndexScanner::new(sandbox.as_ref(), "/home/user", &[]);
        let mut reports = Vec::new();
        let outcome = scanner
            .scan(&ScanCancellation::new(), &mut |report| reports.push(report))
            .await
            .expect("scan");

        let ScanOutcome::Completed { files, via_vcs } = outcome else {
            panic!("scan was cancelled");
        };
        assert!(via_vcs);
        let paths = files.iter().map(|file| file.path.as_str()).collect::<Vec<_>>();
        assert_eq!(paths, vec!["/home/user/a.txt", "/home/user/sub/b.txt"]);
        let last = reports.last().expect("final report");
        assert_eq!(last.phase, ScanPhase::Completed);
        assert_eq!(last.total, Some(2));
    }

    #[tokio::test]
    async fn failed_repository_check_falls_back_to_find() {
        let sandbox = MockSandbox::new("sbx-1");
        sandbox.respond_to("find '/data'", ok("/data/x.csv\n/data/y.csv\n"));

        let patterns = vec!["node_modules".to_string()];
        let scanner = IndexScanner::new(sandbox.as_ref(), "/data", &patterns);
        let outcome = scanner
            .scan(&ScanCancellation::new(), &mut |_| {})
            .await
            .expect("scan");

        assert_eq!(
            outcome,
            ScanOutcome::Completed {
                files: vec![
                    IndexedFile::from_path("/data/x.csv"),
                    IndexedFile::from_path("/data/y.csv"),
                ],
                via_vcs: false,
            }
        );
    }

    #[tokio::test]
    async fn progress_is_batched() {
        let sandbox = MockSandbox::new("sbx-1");
        let listing = (0..250).map(|i| format!("/big/f{i}\n")).collect::<String>();
        sandbox.respond_to("find '/big'", ok(&listing));

        let scanner = IndexScanner::new(sandbox.as_ref(), "/big", &[]);
        let mut indexing = Vec::new();
        scanner
            .scan(&ScanCancellation::new(), &mut |report| {
                if report.phase == ScanPhase::Indexing {
                    indexing.push(report.processed);
                }
            })
            .await
            .expect("scan");

        assert_eq!(indexing, vec![1, 101, 201, 250]);
    }

    #[tokio::test]
    async fn cancellation_is_distinct_from_empty() {
        let sandbox = MockSandbox::new("sbx-1");
        sandbox.respond_to("find '/big'", ok("/big/a\n"));
        let scanner = IndexScanner::new(sandbox.as_ref(), "/big", &[]);

        let cancel = ScanCancellation::new();
        let outcome = scanner
            .scan(&cancel, &mut |report| {
                if report.phase == ScanPhase::Counting {
                    cancel.cancel();
                }
            })
            .await
            .expect("scan");
        assert_eq!(outcome, ScanOutcome::Cancelled);

        sandbox.respond_to("find '/nothing'", ok(""));
        let empty = IndexScanner::new(sandbox.as_ref(), "/nothing", &[])
            .scan(&ScanCancellation::new(), &mut |_| {})
            .await
            .expect("scan");
        assert_eq!(
            empty,
            ScanOutcome::Completed {
                files: Vec::new(),
                via_vcs: false
            }
        );
    }

    #[tokio::test]
    async fn partial_listings_survive_a_non_zero_exit() {
        let sandbox = MockSandbox::new("sbx-1");
        sandbox.respond_to(
            "find '/'",
            CommandOutput {
                stdout: "/etc/hosts\n/home/user/a.txt\n".to_string(),
                stderr: "find: '/root': Permission denied\n".to_string(),
                exit_code: 1,
            },
        );

        let outcome = IndexScanner::new(sandbox.as_ref(), "/", &[])
            .scan(&ScanCancellation::new(), &mut |_| {})
            .await
            .expect("partial listing");
        let ScanOutcome::Completed { files, .. } = outcome else {
            panic!("scan was cancelled");
        };
        assert_eq!(
            files,
            vec![
                IndexedFile::from_path("/etc/hosts"),
                IndexedFile::from_path("/home/user/a.txt"),
            ]
        );
    }

    #[tokio::test]
    async fn failed_listing_without_output_is_an_error() {
        let sandbox = MockSandbox::new("sbx-1");
        sandbox.respond_to(
            "find '/root'",
            CommandOutput {
                stdout: String::new(),
                stderr: "find: '/root': Permission denied\n".to_string(),
                exit_code: 1,
            },
        );

        let err = IndexScanner::new(sandbox.as_ref(), "/root", &[])
            .scan(&ScanCancellation::new(), &mut |_| {})
            .await
            .expect_err("listing failed");
        assert_eq!(err.message, "find: '/root': Permission denied");
    }
}
