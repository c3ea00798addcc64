//! Error taxonomy shared by the registry, the synthesis service and the
//! HTTP layer.

use std::io;
use std::path::Path;

use thiserror::Error;

/// Failure of a registry or synthesis operation.
#[derive(Debug, Error)]
pub enum VoiceError {
    /// Malformed request: unsupported audio suffix, bad name, missing field.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The named voice has no sample in the registry.
    #[error("Voice '{name}' not found. Available voices: {available:?}")]
    NotFound { name: String, available: Vec<String> },

    /// The synthesis engine failed; the message is passed through as-is.
    #[error("synthesis failed: {0}")]
    SynthesisFailed(String),

    /// Filesystem failure while touching the voices directory.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// The engine could not be brought up; the process must not become ready.
    #[error("startup failure: {0}")]
    StartupFailure(String),
}

impl VoiceError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io { context: context.into(), source }
    }

    pub(crate) fn io_at(action: &str, path: &Path, source: io::Error) -> Self {
        Self::io(format!("{} {}", action, path.display()), source)
    }

    /// Short machine-checkable tag for the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound { .. } => "not_found",
            Self::SynthesisFailed(_) => "synthesis_failed",
            Self::Io { .. } => "io",
            Self::StartupFailure(_) => "startup_failure",
        }
    }
}

/// Opaque failure reported by a synthesis engine.
///
/// The engine's internal failure modes are not modelled; the message is
/// forwarded to the caller verbatim.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct EngineError {
    pub message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl From<EngineError> for VoiceError {
    fn from(e: EngineError) -> Self {
        VoiceError::SynthesisFailed(e.message)
    }
}

pub type Result<T, E = VoiceError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message_lists_voices() {
        let e = VoiceError::NotFound {
            name: "bob".into(),
            available: vec!["ana".into(), "tony".into()],
        };
        let msg = e.to_string();
        assert!(msg.contains("'bob'"));
        assert!(msg.contains("\"ana\""));
        assert_eq!(e.kind(), "not_found");
    }

    #[test]
    fn test_engine_error_becomes_synthesis_failed() {
        let e: VoiceError = EngineError::new("unsupported language 'xx'").into();
        match e {
            VoiceError::SynthesisFailed(m) => assert_eq!(m, "unsupported language 'xx'"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
