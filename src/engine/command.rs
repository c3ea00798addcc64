//! Engine that starts one synthesizer process per request.
//!
//! Arguments come from a template; each template argument may contain the
//! placeholders
//!
//! | Placeholder     | Replaced by                         |
//! |-----------------|-------------------------------------|
//! | `{text}`        | text to speak                       |
//! | `{speaker_wav}` | reference voice sample path         |
//! | `{language}`    | language code                       |
//! | `{speed}`       | speed multiplier                    |
//! | `{out_path}`    | file the program must write         |
//! | `{model}`       | configured model name               |
//!
//! Substitution happens after the template is split into arguments, so the
//! text never goes through a shell.  The default template runs the bundled
//! [`XTTS_RUNNER`] once per call, which reloads the model every time; the
//! server uses [`super::WorkerEngine`] unless a custom template is configured.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::{output_tail, SynthesisEngine, SynthesisJob, DEFAULT_MODEL, DEFAULT_PROGRAM, XTTS_RUNNER};
use crate::error::EngineError;

/// One-shot invocation of the bundled runner.
pub const DEFAULT_ARGS: &[&str] = &[
    "-c", XTTS_RUNNER,
    "--model", "{model}",
    "--text", "{text}",
    "--speaker-wav", "{speaker_wav}",
    "--language", "{language}",
    "--speed", "{speed}",
    "--out-path", "{out_path}",
];

/// Split an argument template given as a single string (e.g. from an
/// environment variable) on whitespace.
pub fn parse_args_template(template: &str) -> Vec<String> {
    template.split_whitespace().map(str::to_string).collect()
}

#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: PathBuf,
    model: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    timeout: Option<Duration>,
}

impl Default for CommandEngine {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRAM, DEFAULT_MODEL)
    }
}

impl CommandEngine {
    pub fn new(program: impl Into<PathBuf>, model: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            model: model.into(),
            args: DEFAULT_ARGS.iter().map(|a| a.to_string()).collect(),
            // Coqui refuses to load XTTS non-interactively without this.
            env: vec![("COQUI_TOS_AGREED".to_string(), "1".to_string())],
            timeout: None,
        }
    }

    /// Replace the argument template.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Abort a synthesis call that runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Expand the template for one call.
    pub fn render_args(&self, job: &SynthesisJob<'_>, output: &Path) -> Vec<OsString> {
        let speaker = job.speaker_wav.to_string_lossy();
        let out = output.to_string_lossy();
        let speed = job.speed.to_string();
        self.args
            .iter()
            .map(|arg| {
                // `{text}` last: the text itself may contain placeholder-like braces.
                arg.replace("{speaker_wav}", &speaker)
                    .replace("{language}", job.language)
                    .replace("{speed}", &speed)
                    .replace("{out_path}", &out)
                    .replace("{model}", &self.model)
                    .replace("{text}", job.text)
                    .into()
            })
            .collect()
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, mut cmd: Command, what: &str) -> Result<(), EngineError> {
        let child = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                EngineError::new(format!("cannot start {}: {}", self.program.display(), e))
            })?;

        // Dropping `wait` (timeout or caller cancellation) kills the child.
        let wait = child.wait_with_output();
        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                EngineError::new(format!("{} timed out after {}s", what, limit.as_secs_f32()))
            })?,
            None => wait.await,
        }
        .map_err(|e| EngineError::new(format!("{} failed: {}", what, e)))?;

        if output.status.success() {
            return Ok(());
        }
        let detail = if output.stderr.iter().any(|b| !b.is_ascii_whitespace()) {
            output_tail(&String::from_utf8_lossy(&output.stderr))
        } else {
            output_tail(&String::from_utf8_lossy(&output.stdout))
        };
        Err(EngineError::new(format!(
            "{} exited with {}: {}",
            self.program.display(),
            output.status,
            detail
        )))
    }
}

#[async_trait]
impl SynthesisEngine for CommandEngine {
    fn model_id(&self) -> &str {
        &self.model
    }

    /// Checks the program starts; the model itself is loaded per call.
    async fn warm_up(&self) -> Result<(), EngineError> {
        info!(program = %self.program.display(), model = %self.model, "probing synthesis engine");
        let mut cmd = self.command();
        cmd.arg("--help");
        self.run(cmd, "engine probe").await
    }

    async fn synthesize(&self, job: &SynthesisJob<'_>, output: &Path) -> Result<(), EngineError> {
        let mut cmd = self.command();
        cmd.args(self.render_args(job, output));
        debug!(
            program = %self.program.display(),
            speaker = %job.speaker_wav.display(),
            language = job.language,
            speed = job.speed,
            "running synthesis command"
        );
        self.run(cmd, "synthesis").await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn job<'a>(text: &'a str, speaker: &'a Path) -> SynthesisJob<'a> {
        SynthesisJob { text, speaker_wav: speaker, language: "es", speed: 1.25 }
    }

    #[test]
    fn test_default_template_runs_bundled_runner() {
        let engine = CommandEngine::default();
        let speaker = Path::new("/v/ana.wav");
        let args = engine.render_args(&job("hola", speaker), Path::new("/tmp/out.wav"));
        let args: Vec<String> = args.into_iter().map(|a| a.into_string().unwrap()).collect();
        assert_eq!(args[..2], ["-c", XTTS_RUNNER]);
        assert_eq!(
            args[2..],
            [
                "--model", DEFAULT_MODEL,
                "--text", "hola",
                "--speaker-wav", "/v/ana.wav",
                "--language", "es",
                "--speed", "1.25",
                "--out-path", "/tmp/out.wav",
            ]
        );
        assert_eq!(engine.program(), Path::new(DEFAULT_PROGRAM));
        assert_eq!(engine.model_id(), DEFAULT_MODEL);
    }

    #[test]
    fn test_default_template_carries_speed() {
        let engine = CommandEngine::default();
        let speaker = Path::new("a.wav");
        let mut fast = job("hi", speaker);
        fast.speed = 1.7;
        let args = engine.render_args(&fast, Path::new("o.wav"));
        let speed = args.iter().position(|a| a == "--speed").unwrap();
        assert_eq!(args[speed + 1], "1.7");
    }

    #[test]
    fn test_placeholders_inside_arguments() {
        let engine = CommandEngine::new("synth", "m")
            .with_args(parse_args_template("--speed={speed} --lang {language} {text}"));
        let speaker = Path::new("s.wav");
        let args = engine.render_args(&job("say {out_path}", speaker), Path::new("o.wav"));
        let args: Vec<String> = args.into_iter().map(|a| a.into_string().unwrap()).collect();
        assert_eq!(args, vec!["--speed=1.25", "--lang", "es", "say {out_path}"]);
    }

    #[tokio::test]
    async fn test_missing_program_fails() {
        let engine = CommandEngine::new("/nonexistent/voxclone-engine", "m");
        let err = engine.warm_up().await.unwrap_err();
        assert!(err.message.contains("cannot start"), "{}", err.message);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_engine_writes_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.wav");
        let engine = CommandEngine::new("sh", "shell").with_args(vec![
            "-c".into(),
            "printf '%s|%s' \"$1\" \"$2\" > \"$3\"".into(),
            "sh".into(),
            "{text}".into(),
            "{language}".into(),
            "{out_path}".into(),
        ]);
        let speaker = dir.path().join("ana.wav");
        engine.synthesize(&job("hello; rm -rf /", &speaker), &out).await.unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "hello; rm -rf /|es");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_engine_reports_stderr() {
        let engine = CommandEngine::new("sh", "shell").with_args(vec![
            "-c".into(),
            "echo 'Language xx is not supported' >&2; exit 3".into(),
        ]);
        let speaker = Path::new("ana.wav");
        let err = engine
            .synthesize(&job("hi", speaker), Path::new("unused.wav"))
            .await
            .unwrap_err();
        assert!(err.message.contains("Language xx is not supported"), "{}", err.message);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_aborts() {
        let engine = CommandEngine::new("sh", "shell")
            .with_args(vec!["-c".into(), "sleep 5".into()])
            .with_timeout(Some(Duration::from_millis(100)));
        let speaker = Path::new("ana.wav");
        let err = engine
            .synthesize(&job("hi", speaker), Path::new("unused.wav"))
            .await
            .unwrap_err();
        assert!(err.message.contains("timed out"), "{}", err.message);
    }
}
