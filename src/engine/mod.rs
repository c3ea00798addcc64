//! Speech-synthesis engine interface.
//!
//! The engine is an external collaborator: given text, a reference voice
//! sample, a language code and a speed multiplier it writes speech audio to a
//! target path.  The service never looks inside it; failures come back as an
//! opaque [`EngineError`].
//!
//! One engine instance is built at process start and shared behind an
//! `Arc<dyn SynthesisEngine>` for the lifetime of the process.
//!
//! Two implementations ship:
//! - [`WorkerEngine`] (default): one long-lived synthesizer process that
//!   loads the model in [`SynthesisEngine::warm_up`] and serves every request.
//! - [`CommandEngine`]: one process per request from an argument template,
//!   for synthesizers that only have a command-line interface.
//!
//! Both default to the bundled [`XTTS_RUNNER`] script on `python3`.

use std::path::Path;

use async_trait::async_trait;

use crate::error::EngineError;

pub mod command;
pub mod worker;

pub use command::CommandEngine;
pub use worker::WorkerEngine;

/// Interpreter the bundled runner is started with.
pub const DEFAULT_PROGRAM: &str = "python3";
pub const DEFAULT_MODEL: &str = "tts_models/multilingual/multi-dataset/xtts_v2";

/// Python runner around Coqui's `TTS.api`, passed to the interpreter with `-c`.
///
/// Without `--serve` it synthesizes one job from its flags; with `--serve` it
/// keeps the model loaded and answers JSON-lines jobs on stdin.
pub const XTTS_RUNNER: &str = include_str!("xtts_runner.py");

/// Characters of child output kept in error messages.
const ERROR_TAIL_CHARS: usize = 800;

/// Trimmed end of a child's output, for error messages.
pub(crate) fn output_tail(text: &str) -> String {
    let text = text.trim();
    let count = text.chars().count();
    if count <= ERROR_TAIL_CHARS {
        return text.to_string();
    }
    let tail: String = text.chars().skip(count - ERROR_TAIL_CHARS).collect();
    format!("…{}", tail)
}

/// Inputs for a single synthesis call.
#[derive(Debug, Clone, Copy)]
pub struct SynthesisJob<'a> {
    pub text: &'a str,
    /// Reference sample the engine clones the voice from.
    pub speaker_wav: &'a Path,
    pub language: &'a str,
    pub speed: f32,
}

#[async_trait]
pub trait SynthesisEngine: Send + Sync {
    /// Identifier reported by the health endpoint.
    fn model_id(&self) -> &str;

    /// Bring the engine up (load weights, probe the binary, ...).
    ///
    /// Called once before the server starts accepting requests.
    async fn warm_up(&self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Synthesize `job` and write the audio to `output`.
    ///
    /// Dropping the returned future must abort the work where the engine
    /// allows it.
    async fn synthesize(&self, job: &SynthesisJob<'_>, output: &Path) -> Result<(), EngineError>;
}
