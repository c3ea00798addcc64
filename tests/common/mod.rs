#![allow(dead_code)]

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use voxclone::{EngineError, SynthesisEngine, SynthesisJob, SynthesisService, VoiceRegistry};

pub const FAKE_MODEL: &str = "fake_xtts";

/// A short mono 16-bit WAV, as a real engine or a user upload would produce.
pub fn wav_bytes(seconds: f32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 24_000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut w = hound::WavWriter::new(&mut cursor, spec).unwrap();
        let frames = (24_000.0 * seconds) as usize;
        for i in 0..frames {
            let v = (i as f32 * 220.0 * std::f32::consts::TAU / 24_000.0).sin() * 0.3;
            w.write_sample((v * i16::MAX as f32) as i16).unwrap();
        }
        w.finalize().unwrap();
    }
    cursor.into_inner()
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    /// Write a valid WAV.
    Speak,
    /// Write a partial file, then fail.
    Fail,
    /// Write a partial file, then never finish.
    Hang,
    /// Succeed without writing anything.
    Silent,
}

/// Engine stand-in that records every call.
pub struct FakeEngine {
    behaviour: Behaviour,
    calls: AtomicUsize,
    pub jobs: Mutex<Vec<(String, PathBuf, String, f32)>>,
}

impl FakeEngine {
    pub fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self { behaviour, calls: AtomicUsize::new(0), jobs: Mutex::new(Vec::new()) })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SynthesisEngine for FakeEngine {
    fn model_id(&self) -> &str {
        FAKE_MODEL
    }

    async fn synthesize(&self, job: &SynthesisJob<'_>, output: &Path) -> Result<(), EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.jobs.lock().unwrap().push((
            job.text.to_string(),
            job.speaker_wav.to_path_buf(),
            job.language.to_string(),
            job.speed,
        ));
        match self.behaviour {
            Behaviour::Speak => {
                fs::write(output, wav_bytes(0.2)).map_err(|e| EngineError::new(e.to_string()))
            }
            Behaviour::Fail => {
                fs::write(output, b"RIFF").unwrap();
                Err(EngineError::new("Language xx is not supported"))
            }
            Behaviour::Hang => {
                fs::write(output, b"RIFF").unwrap();
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
            Behaviour::Silent => Ok(()),
        }
    }
}

/// Registry + service over fresh temp directories.
pub struct Fixture {
    pub root: TempDir,
    pub scratch: PathBuf,
    pub service: Arc<SynthesisService>,
}

impl Fixture {
    pub fn new(engine: Arc<dyn SynthesisEngine>) -> Self {
        let root = tempfile::tempdir().unwrap();
        let scratch = root.path().join("scratch");
        fs::create_dir(&scratch).unwrap();
        let registry = VoiceRegistry::open(root.path().join("voices")).unwrap();
        let service = SynthesisService::new(registry, engine, 1).with_temp_dir(Some(scratch.clone()));
        Self { root, scratch, service: Arc::new(service) }
    }

    pub fn registry(&self) -> &VoiceRegistry {
        self.service.registry()
    }

    /// Files left behind in the temp output directory.
    pub fn leftovers(&self) -> Vec<PathBuf> {
        fs::read_dir(&self.scratch).unwrap().map(|e| e.unwrap().path()).collect()
    }
}
