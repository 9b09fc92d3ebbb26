#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use sandbox_explorer::testing::{MockRuntime, MockSandbox};
use sandbox_explorer::{CommandOutput, ExplorerConfig, SandboxExplorer};

pub const API_KEY: &str = "e2b_test_key";

pub struct TestExplorer {
    pub explorer: Arc<SandboxExplorer>,
    pub runtime: Arc<MockRuntime>,
}

impl TestExplorer {
    /// An explorer over mock sandboxes with the given ids, none connected yet.
    pub fn new(ids: &[&str]) -> Self {
        sandbox_explorer::try_init_logging();
        let runtime = MockRuntime::new();
        for id in ids {
            runtime.add(MockSandbox::new(id));
        }
        let config = ExplorerConfig {
            api_key: Some(API_KEY.to_string()),
            ..ExplorerConfig::default()
        };
        let explorer = Arc::new(SandboxExplorer::new(runtime.clone(), config));
        Self { explorer, runtime }
    }

    /// Same as [`TestExplorer::new`] with every sandbox connected.
    pub async fn connected(ids: &[&str]) -> Self {
        let test = Self::new(ids);
        for id in ids {
            test.explorer.connect(id).await.expect("connect mock sandbox");
        }
        test
    }

    pub fn sandbox(&self, id: &str) -> Arc<MockSandbox> {
        self.runtime.sandbox(id).expect("mock sandbox registered")
    }
}

pub fn stdout(text: &str) -> CommandOutput {
    CommandOutput {
        stdout: text.to_string(),
        stderr: String::new(),
        exit_code: 0,
    }
}

pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
