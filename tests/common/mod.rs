//! Shared test doubles: a scripted agent invoker and a worktree provider
//! backed by a temp directory. No test here spawns a real process.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use drover::engine::{BackoffStrategy, RetryPolicy, StepEngine, WorkflowExecutor};
use drover::error::IsolationError;
use drover::exec::{AgentInvoker, InvocationResult};
use drover::progress::ProgressStore;
use drover::workflow::WorkflowDefinition;
use drover::worktree::{directory_name, IsolationProvider, Worktree};

pub fn ok(stdout: &str) -> InvocationResult {
    InvocationResult {
        success: true,
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: Some(0),
    }
}

pub fn fail(stderr: &str) -> InvocationResult {
    InvocationResult {
        success: false,
        stdout: String::new(),
        stderr: stderr.to_string(),
        exit_code: Some(1),
    }
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub text: String,
    pub working_dir: PathBuf,
}

struct Script {
    results: VecDeque<InvocationResult>,
    delay: Option<Duration>,
}

/// Scripted stand-in for the agent CLI. Scripts are matched by substring of
/// the rendered prompt or command, first match wins; unmatched invocations
/// succeed with a stock result. A script's last result repeats once its
/// queue runs dry.
#[derive(Default)]
pub struct ScriptedInvoker {
    scripts: Mutex<Vec<(String, Script)>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, key: &str, results: Vec<InvocationResult>) {
        assert!(
            !results.is_empty(),
            "script '{key}' needs at least one result"
        );
        self.scripts.lock().unwrap().push((
            key.to_string(),
            Script {
                results: results.into(),
                delay: None,
            },
        ));
    }

    /// Like `script`, but each matching invocation takes `delay` to finish.
    pub fn script_slow(&self, key: &str, delay: Duration, results: Vec<InvocationResult>) {
        assert!(
            !results.is_empty(),
            "script '{key}' needs at least one result"
        );
        self.scripts.lock().unwrap().push((
            key.to_string(),
            Script {
                results: results.into(),
                delay: Some(delay),
            },
        ));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_containing(&self, key: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.text.contains(key))
            .count()
    }

    async fn invoke(&self, text: &str, working_dir: &Path) -> InvocationResult {
        self.calls.lock().unwrap().push(RecordedCall {
            text: text.to_string(),
            working_dir: working_dir.to_path_buf(),
        });

        let (result, delay) = {
            let mut scripts = self.scripts.lock().unwrap();
            match scripts
                .iter_mut()
                .find(|(key, _)| text.contains(key.as_str()))
            {
                Some((_, script)) => {
                    let result = if script.results.len() > 1 {
                        script.results.pop_front().unwrap()
                    } else {
                        script.results.front().cloned().unwrap()
                    };
                    (result, script.delay)
                }
                None => (ok("done"), None),
            }
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result
    }
}

#[async_trait]
impl AgentInvoker for ScriptedInvoker {
    async fn run_prompt(
        &self,
        prompt: &str,
        _model: Option<&str>,
        working_dir: &Path,
        _env: &HashMap<String, String>,
    ) -> anyhow::Result<InvocationResult> {
        Ok(self.invoke(prompt, working_dir).await)
    }

    async fn run_command(
        &self,
        command: &str,
        working_dir: &Path,
        _env: &HashMap<String, String>,
    ) -> anyhow::Result<InvocationResult> {
        Ok(self.invoke(command, working_dir).await)
    }
}

/// Worktree provider that hands out directories under a temp root instead
/// of touching git. Counts acquires and releases so tests can assert the
/// two always balance.
pub struct StubIsolation {
    root: TempDir,
    created: AtomicUsize,
    removed: AtomicUsize,
    fail_creates: AtomicBool,
}

impl StubIsolation {
    pub fn new() -> Self {
        Self {
            root: TempDir::new().unwrap(),
            created: AtomicUsize::new(0),
            removed: AtomicUsize::new(0),
            fail_creates: AtomicBool::new(false),
        }
    }

    /// Make every subsequent `create` fail.
    pub fn fail_creates(&self) {
        self.fail_creates.store(true, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn removed(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IsolationProvider for StubIsolation {
    async fn create(&self, branch: &str, base: Option<&str>) -> Result<Worktree, IsolationError> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(IsolationError::Create {
                branch: branch.to_string(),
                message: "scripted isolation failure".to_string(),
            });
        }
        let path = self.root.path().join(directory_name(branch));
        std::fs::create_dir_all(&path).map_err(|e| IsolationError::Create {
            branch: branch.to_string(),
            message: e.to_string(),
        })?;
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Worktree {
            path,
            branch: branch.to_string(),
            base_branch: base.unwrap_or("HEAD").to_string(),
        })
    }

    async fn remove(&self, worktree: &Worktree) -> Result<(), IsolationError> {
        match std::fs::remove_dir_all(&worktree.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(IsolationError::Remove {
                    path: worktree.path.display().to_string(),
                    message: e.to_string(),
                })
            }
        }
        self.removed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn prune_orphaned(&self) -> Result<usize, IsolationError> {
        Ok(0)
    }
}

/// A wired executor with scripted collaborators and its own state dir.
pub struct Harness {
    pub executor: WorkflowExecutor,
    pub invoker: Arc<ScriptedInvoker>,
    pub isolation: Arc<StubIsolation>,
    pub state_dir: TempDir,
}

pub fn harness() -> Harness {
    let invoker = Arc::new(ScriptedInvoker::new());
    let isolation = Arc::new(StubIsolation::new());
    let engine = StepEngine::new(
        invoker.clone() as Arc<dyn AgentInvoker>,
        isolation.clone() as Arc<dyn IsolationProvider>,
    )
    .with_default_retry(fast_retry(3));

    let state_dir = TempDir::new().unwrap();
    let store = ProgressStore::new(&state_dir.path().join("state"));
    let executor =
        WorkflowExecutor::new(Arc::new(engine), store).with_log_dir(state_dir.path().join("logs"));

    Harness {
        executor,
        invoker,
        isolation,
        state_dir,
    }
}

/// Retry policy with millisecond delays so retry tests stay fast.
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        backoff: BackoffStrategy::Fixed,
        initial_delay: Duration::from_millis(2),
        max_delay: Duration::from_millis(10),
        retry_on: Vec::new(),
    }
}

pub fn workflow(yaml: &str) -> WorkflowDefinition {
    serde_yaml::from_str(yaml).expect("test workflow should parse")
}

pub fn no_overrides() -> HashMap<String, String> {
    HashMap::new()
}
