//! Synthesis request handling.
//!
//! Turns a `(text, voice, language, speed)` request into WAV bytes:
//! validate → resolve the voice → take an engine permit → synthesize into a
//! scoped temporary file → read it back → delete it.  The temporary file is
//! removed on every exit path, including when the calling future is dropped.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tempfile::TempPath;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::engine::{SynthesisEngine, SynthesisJob};
use crate::error::{Result, VoiceError};
use crate::registry::VoiceRegistry;

/// Content type of every synthesis result.
pub const AUDIO_CONTENT_TYPE: &str = "audio/wav";

pub const DEFAULT_LANGUAGE: &str = "en";
pub const DEFAULT_SPEED: f32 = 1.0;

fn default_language() -> String {
    DEFAULT_LANGUAGE.to_string()
}

fn default_speed() -> f32 {
    DEFAULT_SPEED
}

/// A request to speak `text` in the voice registered as `voice`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_speed")]
    pub speed: f32,
}

impl SynthesisRequest {
    pub fn new(text: impl Into<String>, voice: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            voice: voice.into(),
            language: default_language(),
            speed: DEFAULT_SPEED,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.text.trim().is_empty() {
            return Err(VoiceError::InvalidInput("text must not be empty".to_string()));
        }
        if self.language.trim().is_empty() {
            return Err(VoiceError::InvalidInput("language must not be empty".to_string()));
        }
        if !self.speed.is_finite() || self.speed <= 0.0 {
            return Err(VoiceError::InvalidInput(format!(
                "speed must be a positive number, got {}",
                self.speed
            )));
        }
        Ok(())
    }
}

/// Audio produced for one request.
#[derive(Debug, Clone)]
pub struct SynthesisResult {
    pub audio: Vec<u8>,
    pub content_type: &'static str,
    /// Suggested download name, `<voice>.wav`.
    pub filename: String,
}

/// Shared handle to the registry and the engine.
///
/// Built once at startup and shared by every request.
pub struct SynthesisService {
    registry: VoiceRegistry,
    engine: Arc<dyn SynthesisEngine>,
    permits: Semaphore,
    temp_dir: Option<PathBuf>,
}

impl SynthesisService {
    /// `max_concurrent` bounds how many engine calls run at once (minimum 1).
    pub fn new(
        registry: VoiceRegistry,
        engine: Arc<dyn SynthesisEngine>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            registry,
            engine,
            permits: Semaphore::new(max_concurrent.max(1)),
            temp_dir: None,
        }
    }

    /// Put temporary engine output in `dir` instead of the system temp dir.
    pub fn with_temp_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.temp_dir = dir;
        self
    }

    pub fn registry(&self) -> &VoiceRegistry {
        &self.registry
    }

    pub fn engine(&self) -> &dyn SynthesisEngine {
        self.engine.as_ref()
    }

    /// Run a registry operation on the blocking pool; every registry call
    /// scans the voices directory.
    pub async fn with_registry<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&VoiceRegistry) -> T + Send + 'static,
        T: Send + 'static,
    {
        let registry = self.registry.clone();
        tokio::task::spawn_blocking(move || op(&registry))
            .await
            .map_err(|e| VoiceError::io("registry task failed", std::io::Error::other(e)))
    }

    pub async fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesisResult> {
        request.validate()?;
        let voice = request.voice.clone();
        let speaker_wav = self.with_registry(move |r| r.resolve(&voice)).await??;

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| VoiceError::SynthesisFailed("synthesis engine is shut down".to_string()))?;

        info!(
            voice = %request.voice,
            language = %request.language,
            chars = request.text.chars().count(),
            "generating speech"
        );

        let output = self.temp_output()?;
        let job = SynthesisJob {
            text: &request.text,
            speaker_wav: &speaker_wav,
            language: &request.language,
            speed: request.speed,
        };
        let outcome = self.run_engine(&job, &output).await;

        let path = output.to_path_buf();
        if let Err(e) = output.close() {
            warn!(path = %path.display(), "cannot remove temporary output: {e}");
        }

        match outcome {
            Ok(audio) => {
                info!(voice = %request.voice, bytes = audio.len(), "generated audio");
                Ok(SynthesisResult {
                    audio,
                    content_type: AUDIO_CONTENT_TYPE,
                    filename: format!("{}.wav", request.voice),
                })
            }
            Err(e) => {
                error!(voice = %request.voice, "error generating speech: {e}");
                Err(e)
            }
        }
    }

    fn temp_output(&self) -> Result<TempPath> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("voxclone-").suffix(".wav");
        let file = match &self.temp_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(|e| VoiceError::SynthesisFailed(format!("cannot create temporary output: {e}")))?;
        Ok(file.into_temp_path())
    }

    async fn run_engine(&self, job: &SynthesisJob<'_>, output: &Path) -> Result<Vec<u8>> {
        self.engine.synthesize(job, output).await?;
        let audio = tokio::fs::read(output).await.map_err(|e| {
            VoiceError::SynthesisFailed(format!("cannot read engine output: {e}"))
        })?;
        if audio.is_empty() {
            return Err(VoiceError::SynthesisFailed("engine produced no audio".to_string()));
        }
        Ok(audio)
    }
}
