//! Resolved server configuration.
//!
//! The binary fills this from command-line flags and `VOXCLONE_*`
//! environment variables; embedders can build it directly.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::{CommandEngine, SynthesisEngine, WorkerEngine, DEFAULT_MODEL, DEFAULT_PROGRAM};
use crate::error::{Result, VoiceError};
use crate::registry::VoiceRegistry;
use crate::service::SynthesisService;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_VOICES_DIR: &str = "./voices";
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Directory holding one `<name>.wav` per voice.
    pub voices_dir: PathBuf,
    /// Synthesizer executable.
    pub engine_program: PathBuf,
    pub model: String,
    /// Per-request argument template. `None` runs the bundled runner as one
    /// persistent worker that loads the model once.
    pub engine_args: Option<Vec<String>>,
    pub engine_timeout: Option<Duration>,
    pub max_concurrent_synthesis: usize,
    /// Where engine output is staged; `None` is the system temp dir.
    pub temp_dir: Option<PathBuf>,
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            voices_dir: PathBuf::from(DEFAULT_VOICES_DIR),
            engine_program: PathBuf::from(DEFAULT_PROGRAM),
            model: DEFAULT_MODEL.to_string(),
            engine_args: None,
            engine_timeout: None,
            max_concurrent_synthesis: 1,
            temp_dir: None,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let invalid = |detail: String| {
            VoiceError::StartupFailure(format!(
                "invalid bind address {}:{}: {}",
                self.host, self.port, detail
            ))
        };
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| invalid(e.to_string()))?
            .next()
            .ok_or_else(|| invalid("no address".to_string()))
    }

    pub fn build_engine(&self) -> Arc<dyn SynthesisEngine> {
        match &self.engine_args {
            Some(args) => Arc::new(
                CommandEngine::new(&self.engine_program, &self.model)
                    .with_args(args.clone())
                    .with_timeout(self.engine_timeout),
            ),
            None => Arc::new(
                WorkerEngine::new(&self.engine_program, &self.model)
                    .with_timeout(self.engine_timeout),
            ),
        }
    }

    /// Open the registry and wire it to `engine`.
    pub fn build_service(&self, engine: Arc<dyn SynthesisEngine>) -> Result<SynthesisService> {
        let registry = VoiceRegistry::open(&self.voices_dir)?;
        Ok(SynthesisService::new(registry, engine, self.max_concurrent_synthesis)
            .with_temp_dir(self.temp_dir.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.bind_addr().unwrap().to_string(), "0.0.0.0:8000");
        assert_eq!(cfg.build_engine().model_id(), DEFAULT_MODEL);
        assert_eq!(cfg.max_concurrent_synthesis, 1);
        assert_eq!(cfg.voices_dir, PathBuf::from("./voices"));
    }

    #[test]
    fn test_bad_host_is_startup_failure() {
        let cfg = ServerConfig { host: "not a host".into(), ..Default::default() };
        assert!(matches!(cfg.bind_addr(), Err(VoiceError::StartupFailure(_))));
    }

    #[test]
    fn test_build_service_creates_voices_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ServerConfig { voices_dir: dir.path().join("voices"), ..Default::default() };
        let service = cfg.build_service(cfg.build_engine()).unwrap();
        assert!(service.registry().dir().is_dir());
        assert_eq!(service.engine().model_id(), DEFAULT_MODEL);
    }
}
