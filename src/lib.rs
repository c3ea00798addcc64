//! # voxclone
//!
//! Self-hosted voice-cloning text-to-speech service.
//!
//! A directory of short reference recordings, one per named voice, is served
//! over HTTP next to a voice-cloning synthesis engine (Coqui XTTS-v2 by
//! default).  Clients upload or delete voices and ask for speech in any
//! registered voice.
//!
//! ## Quick start
//!
//! ```no_run
//! use voxclone::{ServerConfig, SynthesisRequest};
//!
//! # async fn run() -> Result<(), voxclone::VoiceError> {
//! let config = ServerConfig::default();
//! let service = config.build_service(config.build_engine())?;
//!
//! service.registry().register("ana", "ana.wav", &std::fs::read("ana.wav").unwrap())?;
//! let result = service.synthesize(&SynthesisRequest::new("Hello there!", "ana")).await?;
//! std::fs::write(&result.filename, &result.audio).unwrap();
//! # Ok(())
//! # }
//! ```
//!
//! ## Pieces
//! 1. **Registry** ([`registry`]) — `<voices_dir>/<name>.wav`, re-read on every call.
//! 2. **Engine** ([`engine`]) — opaque synthesizer behind [`SynthesisEngine`].
//! 3. **Service** ([`service`]) — validate, resolve, synthesize into a scoped
//!    temp file, return the bytes.
//! 4. **HTTP** (`http`, `server` feature) — axum router.
//! 5. **Sample preparation** ([`convert`]) — mono 22 050 Hz WAV references.

pub mod config;
pub mod convert;
pub mod engine;
pub mod error;
pub mod registry;
pub mod service;

#[cfg(feature = "server")]
pub mod http;

// ─── Re-exports for convenience ─────────────────────────────────────────────

pub use config::ServerConfig;
pub use engine::{CommandEngine, SynthesisEngine, SynthesisJob, WorkerEngine};
pub use error::{EngineError, VoiceError};
pub use registry::VoiceRegistry;
pub use service::{SynthesisRequest, SynthesisResult, SynthesisService};
