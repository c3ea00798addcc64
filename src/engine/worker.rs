//! Engine backed by one long-lived synthesizer process.
//!
//! [`SynthesisEngine::warm_up`] starts the worker and returns once it reports
//! the model loaded, so a missing or broken model fails startup.  Requests are
//! then exchanged as JSON lines:
//!
//! ```text
//! worker → {"ready": true}
//! engine → {"text": .., "speaker_wav": .., "language": .., "speed": .., "out_path": ..}
//! worker → {"ok": true}  |  {"ok": false, "error": ".."}
//! ```
//!
//! Non-JSON lines on stdout are ignored; stderr is forwarded to the log and
//! its tail is kept for error messages.  A worker that dies, times out, or is
//! abandoned by a cancelled request is killed; the next request starts a new
//! one.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{output_tail, SynthesisEngine, SynthesisJob, DEFAULT_MODEL, DEFAULT_PROGRAM, XTTS_RUNNER};
use crate::error::EngineError;

/// Bundled runner in worker mode; `{model}` is the only placeholder.
pub const DEFAULT_WORKER_ARGS: &[&str] = &["-c", XTTS_RUNNER, "--model", "{model}", "--serve"];

/// Lines of worker stderr kept for error messages.
const STDERR_TAIL_LINES: usize = 40;

#[derive(Serialize)]
struct JobMessage<'a> {
    text: &'a str,
    speaker_wav: &'a Path,
    language: &'a str,
    speed: f32,
    out_path: &'a Path,
}

#[derive(Debug, Default, Deserialize)]
struct Reply {
    #[serde(default)]
    ready: bool,
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

type StderrTail = Arc<StdMutex<VecDeque<String>>>;

struct Worker {
    // Held for `kill_on_drop`.
    _child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr_tail: StderrTail,
    stderr_task: JoinHandle<()>,
}

impl Worker {
    async fn next_reply(&mut self) -> Result<Reply, EngineError> {
        loop {
            match self.stdout.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Reply>(line) {
                        Ok(reply) => return Ok(reply),
                        Err(_) => debug!(target: "voxclone::engine", "worker stdout: {line}"),
                    }
                }
                Ok(None) => return Err(self.died("exited").await),
                Err(e) => return Err(self.died(&format!("stdout unreadable ({e})")).await),
            }
        }
    }

    async fn wait_ready(&mut self) -> Result<(), EngineError> {
        loop {
            let reply = self.next_reply().await?;
            if let Some(error) = reply.error {
                return Err(EngineError::new(error));
            }
            if reply.ready {
                return Ok(());
            }
        }
    }

    async fn exchange(&mut self, message: &str) -> Result<Reply, EngineError> {
        let sent = async {
            self.stdin.write_all(message.as_bytes()).await?;
            self.stdin.write_all(b"\n").await?;
            self.stdin.flush().await
        }
        .await;
        if let Err(e) = sent {
            return Err(self.died(&format!("stopped reading jobs ({e})")).await);
        }
        self.next_reply().await
    }

    async fn died(&mut self, what: &str) -> EngineError {
        // Let the forwarder drain what the process wrote before exiting.
        let _ = tokio::time::timeout(Duration::from_secs(1), &mut self.stderr_task).await;
        let tail = match self.stderr_tail.lock() {
            Ok(lines) => lines.iter().cloned().collect::<Vec<_>>().join("\n"),
            Err(_) => String::new(),
        };
        if tail.trim().is_empty() {
            EngineError::new(format!("synthesis worker {}", what))
        } else {
            EngineError::new(format!("synthesis worker {}: {}", what, output_tail(&tail)))
        }
    }
}

pub struct WorkerEngine {
    program: PathBuf,
    model: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    load_timeout: Option<Duration>,
    timeout: Option<Duration>,
    worker: Mutex<Option<Worker>>,
}

impl Default for WorkerEngine {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRAM, DEFAULT_MODEL)
    }
}

impl WorkerEngine {
    pub fn new(program: impl Into<PathBuf>, model: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            model: model.into(),
            args: DEFAULT_WORKER_ARGS.iter().map(|a| a.to_string()).collect(),
            // Coqui refuses to load XTTS non-interactively without this.
            env: vec![("COQUI_TOS_AGREED".to_string(), "1".to_string())],
            load_timeout: None,
            timeout: None,
            worker: Mutex::new(None),
        }
    }

    /// Replace the launch arguments; `{model}` is substituted.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Abort a synthesis call that runs longer than `timeout`; the worker is
    /// restarted for the next call.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Give up on a worker that has not reported ready within `timeout`.
    pub fn with_load_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.load_timeout = timeout;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn launch_args(&self) -> Vec<OsString> {
        self.args.iter().map(|a| a.replace("{model}", &self.model).into()).collect()
    }

    async fn start(&self) -> Result<Worker, EngineError> {
        info!(program = %self.program.display(), model = %self.model, "starting synthesis worker");
        let mut child = Command::new(&self.program)
            .args(self.launch_args())
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                EngineError::new(format!("cannot start {}: {}", self.program.display(), e))
            })?;

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(i), Some(o), Some(e)) => (i, o, e),
            _ => return Err(EngineError::new("synthesis worker pipes unavailable")),
        };

        let stderr_tail = StderrTail::default();
        let sink = stderr_tail.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "voxclone::engine", "{line}");
                if let Ok(mut tail) = sink.lock() {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
        });

        let mut worker = Worker {
            _child: child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            stderr_tail,
            stderr_task,
        };
        match self.load_timeout {
            Some(limit) => tokio::time::timeout(limit, worker.wait_ready())
                .await
                .map_err(|_| {
                    EngineError::new(format!(
                        "model load timed out after {}s",
                        limit.as_secs_f32()
                    ))
                })??,
            None => worker.wait_ready().await?,
        }
        info!(model = %self.model, "synthesis worker ready");
        Ok(worker)
    }
}

#[async_trait]
impl SynthesisEngine for WorkerEngine {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn warm_up(&self) -> Result<(), EngineError> {
        let mut slot = self.worker.lock().await;
        if slot.is_none() {
            *slot = Some(self.start().await?);
        }
        Ok(())
    }

    async fn synthesize(&self, job: &SynthesisJob<'_>, output: &Path) -> Result<(), EngineError> {
        let mut slot = self.worker.lock().await;
        // Out of the slot while in use: any early exit drops (kills) it.
        let mut worker = match slot.take() {
            Some(worker) => worker,
            None => self.start().await?,
        };

        let message = serde_json::to_string(&JobMessage {
            text: job.text,
            speaker_wav: job.speaker_wav,
            language: job.language,
            speed: job.speed,
            out_path: output,
        })
        .map_err(|e| EngineError::new(format!("cannot encode synthesis job: {e}")))?;

        let reply = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, worker.exchange(&message))
                .await
                .map_err(|_| {
                    warn!(model = %self.model, "synthesis timed out, restarting worker");
                    EngineError::new(format!("synthesis timed out after {}s", limit.as_secs_f32()))
                })??,
            None => worker.exchange(&message).await?,
        };
        *slot = Some(worker);

        if reply.ok {
            Ok(())
        } else {
            Err(EngineError::new(
                reply.error.unwrap_or_else(|| "synthesis worker reported failure".to_string()),
            ))
        }
    }
}
