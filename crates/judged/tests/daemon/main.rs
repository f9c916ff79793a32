//! Task loop tests
//!
//! Drive the real daemon, stages, artifact cache and filesystem object store
//! against an in-memory broker and a scripted sandbox, so no isolate binary or
//! root privileges are needed.
//!
//! The scripted sandbox interprets commands itself:
//! - `fakecc <src> -o <bin>` copies the source to the binary, or fails if the
//!   source contains `syntax error`.
//! - any other command runs a "program" file (`./main` or the last argument)
//!   whose first line is an instruction: `echo` (print the rest of the file),
//!   `cat` (copy stdin), `loop`, `oom`, `crash`, `vanish` (the sandbox itself
//!   fails), `panic` (the sandbox call panics) or `breakbox` (succeeds, but the
//!   following teardown fails).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use judged::{
    ArtifactCache, Bucket, Config, Daemon, FsObjectStore, MemoryBroker, ObjectStore,
    ResultMessage, RunRequest, Runner, Sandbox, SandboxError, SandboxResult, SandboxStatus,
    SlotId,
};
use serde_json::{Value, json};
use tempfile::TempDir;

mod scenarios;
mod settlement;

const TEST_CONFIG: &str = r#"
[languages.fake]
name = "Fake compiled"
source_name = "main.fake"
binary_name = "main"
compile = ["fakecc", "{src_path}", "-o", "{binary_path}"]
execute = ["./{binary_path}"]

[languages.fake.constraints]
time_ms = 1000
memory_kb = 65536
total_storage_kb = 1024
max_processes = 1

[languages.fake.compile_constraints]
time_ms = 5000
memory_kb = 262144
total_storage_kb = 65536
max_processes = 8

[languages.script]
name = "Fake interpreted"
source_name = "main.script"
execute = ["fakerun", "{src_path}"]
"#;

#[derive(Debug, Default)]
struct SandboxState {
    in_use: HashSet<SlotId>,
    peak_in_use: usize,
    double_init: usize,
    broken: HashSet<SlotId>,
    runs: Vec<RunRequest>,
    teardowns: Vec<SlotId>,
}

/// Sandbox that simulates compilers and programs on the host filesystem
#[derive(Debug)]
pub struct ScriptedSandbox {
    root: PathBuf,
    run_delay: Duration,
    fail_inits: AtomicUsize,
    state: Mutex<SandboxState>,
}

impl ScriptedSandbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            run_delay: Duration::ZERO,
            fail_inits: AtomicUsize::new(0),
            state: Mutex::new(SandboxState::default()),
        }
    }

    pub fn with_run_delay(mut self, delay: Duration) -> Self {
        self.run_delay = delay;
        self
    }

    /// Make the next `count` initializations fail
    pub fn fail_next_inits(&self, count: usize) {
        self.fail_inits.store(count, Ordering::SeqCst);
    }

    fn box_path(&self, slot: SlotId) -> PathBuf {
        self.root.join(format!("slot-{slot}")).join("box")
    }

    pub fn peak_in_use(&self) -> usize {
        self.state.lock().unwrap().peak_in_use
    }

    pub fn double_inits(&self) -> usize {
        self.state.lock().unwrap().double_init
    }

    pub fn in_use(&self) -> usize {
        self.state.lock().unwrap().in_use.len()
    }

    pub fn runs(&self) -> Vec<RunRequest> {
        self.state.lock().unwrap().runs.clone()
    }

    pub fn teardowns(&self) -> Vec<SlotId> {
        self.state.lock().unwrap().teardowns.clone()
    }

    fn simulate(&self, slot: SlotId, root: &Path, request: &RunRequest) -> Result<SandboxResult, SandboxError> {
        let write = |name: &Option<String>, content: &[u8]| {
            if let Some(name) = name {
                std::fs::write(root.join(name), content).unwrap();
            }
        };
        let mut result = SandboxResult::with_status(SandboxStatus::Succeeded);
        result.time_ms = 5;
        result.wall_time_ms = 8;
        result.memory_kb = 1024;
        result.exit_code = Some(0);

        let command = &request.command;
        if command[0] == "fakecc" {
            let source = std::fs::read_to_string(root.join(&command[1])).unwrap();
            if source.contains("syntax error") {
                write(&request.stderr, format!("{}:1: error: expected ';'\n", command[1]).as_bytes());
                result.status = SandboxStatus::RuntimeError;
                result.exit_code = Some(1);
            } else {
                std::fs::copy(root.join(&command[1]), root.join(&command[3])).unwrap();
            }
            return Ok(result);
        }

        let program_name = if command[0].starts_with("./") {
            command[0].trim_start_matches("./").to_string()
        } else {
            command[command.len() - 1].clone()
        };
        let program = std::fs::read_to_string(root.join(program_name)).unwrap();
        let (instruction, body) = program.split_once('\n').unwrap_or((program.as_str(), ""));

        match instruction.trim() {
            "echo" => write(&request.stdout, body.as_bytes()),
            "cat" => {
                let input = std::fs::read(root.join(request.stdin.as_ref().unwrap())).unwrap();
                write(&request.stdout, &input);
            }
            "loop" => {
                result.status = SandboxStatus::TimeLimitExceeded;
                result.time_ms = request.constraints.time_ms;
                result.wall_time_ms = request.constraints.time_ms;
                result.exit_code = None;
                result.signal = Some(9);
            }
            "oom" => {
                result.status = SandboxStatus::MemoryLimitExceeded;
                result.memory_kb = request.constraints.memory_kb;
                result.exit_code = None;
                result.signal = Some(9);
            }
            "crash" => {
                result.status = SandboxStatus::RuntimeError;
                result.exit_code = Some(3);
            }
            "vanish" => {
                return Err(SandboxError::RunFailed {
                    slot,
                    message: "meta file missing".to_string(),
                });
            }
            "panic" => panic!("scripted sandbox panic in slot {slot}"),
            "breakbox" => {
                self.state.lock().unwrap().broken.insert(slot);
                write(&request.stdout, body.as_bytes());
            }
            other => panic!("unknown scripted instruction {other:?}"),
        }
        Ok(result)
    }
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    async fn initialize(&self, slot: SlotId) -> Result<PathBuf, SandboxError> {
        let failures = self.fail_inits.load(Ordering::SeqCst);
        if failures > 0 {
            self.fail_inits.store(failures - 1, Ordering::SeqCst);
            return Err(SandboxError::InitFailed {
                slot,
                message: "injected failure".to_string(),
            });
        }

        {
            let mut state = self.state.lock().unwrap();
            if !state.in_use.insert(slot) {
                state.double_init += 1;
            }
            state.peak_in_use = state.peak_in_use.max(state.in_use.len());
        }

        let path = self.box_path(slot);
        let _ = tokio::fs::remove_dir_all(&path).await;
        tokio::fs::create_dir_all(&path).await?;
        Ok(path)
    }

    async fn run(&self, slot: SlotId, request: RunRequest) -> Result<SandboxResult, SandboxError> {
        if !self.run_delay.is_zero() {
            tokio::time::sleep(self.run_delay).await;
        }
        self.state.lock().unwrap().runs.push(request.clone());
        self.simulate(slot, &self.box_path(slot), &request)
    }

    async fn teardown(&self, slot: SlotId) -> Result<(), SandboxError> {
        let broken = {
            let mut state = self.state.lock().unwrap();
            state.teardowns.push(slot);
            state.in_use.remove(&slot);
            state.broken.remove(&slot)
        };

        match tokio::fs::remove_dir_all(self.box_path(slot)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if broken {
            return Err(SandboxError::TeardownFailed {
                slot,
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

/// A daemon wired to scripted collaborators in a temporary directory
pub struct Harness {
    _dir: TempDir,
    scratch: PathBuf,
    pub sandbox: Arc<ScriptedSandbox>,
    pub store: Arc<FsObjectStore>,
    pub cache: Arc<ArtifactCache>,
    pub broker: Arc<MemoryBroker>,
    pub daemon: Daemon,
}

impl Harness {
    pub async fn new(slots: u32) -> Self {
        Self::with_sandbox(slots, |sandbox| sandbox).await
    }

    pub async fn with_sandbox(
        slots: u32,
        customize: impl FnOnce(ScriptedSandbox) -> ScriptedSandbox,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(Config::parse_toml(TEST_CONFIG).unwrap());

        let sandbox = Arc::new(customize(ScriptedSandbox::new(dir.path().join("boxes"))));
        let store = Arc::new(FsObjectStore::new(dir.path().join("store")));
        let cache = Arc::new(
            ArtifactCache::open(dir.path().join("cache"), 1024 * 1024, 0, store.clone())
                .await
                .unwrap(),
        );
        let broker = Arc::new(MemoryBroker::new(config.broker.max_deliveries));

        let runner = Runner::new(config, sandbox.clone(), store.clone(), cache.clone());
        let daemon = Daemon::new(runner, broker.clone(), slots);

        let scratch = dir.path().join("scratch");
        std::fs::create_dir_all(&scratch).unwrap();

        Self {
            _dir: dir,
            scratch,
            sandbox,
            store,
            cache,
            broker,
            daemon,
        }
    }

    async fn put(&self, bucket: Bucket, id: &str, content: &[u8]) -> String {
        let source = self.scratch.join("upload");
        tokio::fs::write(&source, content).await.unwrap();
        self.store.put(bucket, id, &source).await.unwrap().version_id
    }

    /// Store a testcase file; returns its version id
    pub async fn put_testcase(&self, id: &str, content: &[u8]) -> String {
        self.put(Bucket::Testcases, id, content).await
    }

    pub async fn put_binary(&self, id: &str, content: &[u8]) {
        self.put(Bucket::Binaries, id, content).await;
    }

    pub async fn binary(&self, id: &str) -> Option<Vec<u8>> {
        let dest = self.scratch.join(format!("download-{id}"));
        self.store
            .fetch(Bucket::Binaries, id, &dest, None)
            .await
            .ok()?;
        Some(tokio::fs::read(&dest).await.unwrap())
    }

    pub fn push(&self, task: Value) {
        self.broker.push(task.to_string());
    }

    /// Process everything queued, then shut down
    pub async fn run_to_completion(&self) {
        self.broker.close();
        tokio::time::timeout(
            Duration::from_secs(10),
            self.daemon.run(std::future::pending()),
        )
        .await
        .expect("daemon did not drain the queue")
        .unwrap();
    }

    pub fn results(&self) -> Vec<ResultMessage> {
        self.broker
            .published()
            .iter()
            .map(|payload| serde_json::from_slice(payload).unwrap())
            .collect()
    }

    /// Testcase ids `<name>.in`/`<name>.out` with the given content
    pub async fn testcase(&self, name: &str, input: &[u8], output: &[u8]) -> Value {
        let input_version = self.put_testcase(&format!("{name}.in"), input).await;
        self.put_testcase(&format!("{name}.out"), output).await;
        json!({
            "input": {"objectId": format!("{name}.in"), "versionId": input_version},
            "output": {"objectId": format!("{name}.out")}
        })
    }
}

pub fn compile_task(submission_id: &str, language: &str, source: &str) -> Value {
    json!({
        "type": "Compile",
        "submissionId": submission_id,
        "language": language,
        "sourceCode": source
    })
}

pub fn grade_task(submission_id: &str, index: u32, language: &str, testcase: Value) -> Value {
    json!({
        "type": "Grade",
        "submissionId": submission_id,
        "testcaseIndex": index,
        "language": language,
        "constraints": {"timeMs": 2000, "memoryKB": 65536, "totalStorageKB": 1024, "maxProcesses": 1},
        "binaryRef": {"objectId": submission_id},
        "testcaseRef": testcase
    })
}
