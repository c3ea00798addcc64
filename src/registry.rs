//! Directory-backed voice registry.
//!
//! A voice is a name mapped to one audio sample stored at
//! `<dir>/<name>.wav`.  There is no index: every call re-reads the
//! directory, so whatever is on disk (uploads, hand-copied files, output of
//! [`crate::convert`]) is what the service sees.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::error::{Result, VoiceError};

/// Suffix of the sample used for synthesis.
pub const CANONICAL_EXTENSION: &str = "wav";

/// Suffixes accepted for upload and surfaced by [`VoiceRegistry::list`].
pub const ACCEPTED_EXTENSIONS: &[&str] = &["wav", "mp3", "m4a"];

const MAX_NAME_CHARS: usize = 128;

/// A single directory entry name: no separators, no leading dot.
static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\p{L}\p{N}_\-][\p{L}\p{N}_\-. ]*$").unwrap());

/// Where a registered sample was written and how large it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSample {
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// `true` when `filename` ends in one of [`ACCEPTED_EXTENSIONS`] (any case).
pub fn is_accepted_audio(filename: &str) -> bool {
    extension_of(Path::new(filename))
        .map(|ext| ACCEPTED_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// `true` when `name` can be used as a voice name.
pub fn is_valid_name(name: &str) -> bool {
    name.chars().count() <= MAX_NAME_CHARS && NAME_RE.is_match(name)
}

/// `true` when `name` could be a voice already on disk: a single directory
/// entry stem, as [`VoiceRegistry::list`] reports them. Looser than
/// [`is_valid_name`] so hand-copied samples stay reachable.
fn is_lookup_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\', '\0'])
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// One audio file found in the voices directory.
struct Entry {
    stem: String,
    extension: String,
    path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct VoiceRegistry {
    dir: PathBuf,
}

impl VoiceRegistry {
    /// Open the registry rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| VoiceError::io_at("cannot create", &dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The fixed location a voice named `name` is stored at.
    pub fn canonical_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name, CANONICAL_EXTENSION))
    }

    fn entries(&self) -> Vec<Entry> {
        let read = match fs::read_dir(&self.dir) {
            Ok(read) => read,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Err(e) = fs::create_dir_all(&self.dir) {
                    warn!(dir = %self.dir.display(), "cannot recreate voices directory: {e}");
                }
                return Vec::new();
            }
            Err(e) => {
                warn!(dir = %self.dir.display(), "cannot read voices directory: {e}");
                return Vec::new();
            }
        };

        read.filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| {
                let path = entry.path();
                let extension = extension_of(&path)?;
                if !ACCEPTED_EXTENSIONS.contains(&extension.as_str()) {
                    return None;
                }
                let stem = path.file_stem()?.to_str()?.to_string();
                if stem.starts_with('.') {
                    return None;
                }
                Some(Entry { stem, extension, path })
            })
            .collect()
    }

    /// Registered voice names, sorted and de-duplicated.
    pub fn list(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .map(|e| e.stem)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Store `content` as the sample for `name`, replacing any previous one.
    ///
    /// `filename` is the caller's declared file name; only its suffix is
    /// checked, the bytes are not decoded.
    pub fn register(&self, name: &str, filename: &str, content: &[u8]) -> Result<StoredSample> {
        if !is_valid_name(name) {
            return Err(VoiceError::InvalidInput(format!("invalid voice name {:?}", name)));
        }
        if !is_accepted_audio(filename) {
            return Err(VoiceError::InvalidInput(
                "Audio must be WAV, MP3, or M4A format".to_string(),
            ));
        }

        fs::create_dir_all(&self.dir)
            .map_err(|e| VoiceError::io_at("cannot create", &self.dir, e))?;

        // Write beside the target and rename, so readers never see a partial sample.
        let mut tmp = tempfile::Builder::new()
            .prefix(".upload-")
            .suffix(".part")
            .tempfile_in(&self.dir)
            .map_err(|e| VoiceError::io_at("cannot stage upload in", &self.dir, e))?;
        tmp.write_all(content)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| VoiceError::io("cannot write voice sample", e))?;

        let path = self.canonical_path(name);
        tmp.persist(&path)
            .map_err(|e| VoiceError::io_at("cannot store", &path, e.error))?;

        debug!(voice = name, bytes = content.len(), path = %path.display(), "voice registered");
        Ok(StoredSample { path, size_bytes: content.len() as u64 })
    }

    /// Location of the synthesis sample for `name`.
    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        if is_lookup_name(name) {
            let canonical = self.canonical_path(name);
            if canonical.is_file() {
                return Ok(canonical);
            }
            // Pre-seeded samples may carry an upper-case suffix.
            if let Some(entry) = self
                .entries()
                .into_iter()
                .find(|e| e.stem == name && e.extension == CANONICAL_EXTENSION)
            {
                return Ok(entry.path);
            }
        }
        Err(self.not_found(name))
    }

    /// Remove every sample stored for `name`.
    pub fn unregister(&self, name: &str) -> Result<()> {
        if !is_lookup_name(name) {
            return Err(self.not_found(name));
        }
        let matching: Vec<Entry> = self.entries().into_iter().filter(|e| e.stem == name).collect();
        if matching.is_empty() {
            return Err(self.not_found(name));
        }
        for entry in matching {
            match fs::remove_file(&entry.path) {
                Ok(()) => debug!(voice = name, path = %entry.path.display(), "sample removed"),
                // Lost a race with another delete: the outcome is the same.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(VoiceError::io_at("cannot remove", &entry.path, e)),
            }
        }
        Ok(())
    }

    fn not_found(&self, name: &str) -> VoiceError {
        VoiceError::NotFound { name: name.to_string(), available: self.list() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, VoiceRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let reg = VoiceRegistry::open(dir.path().join("voices")).unwrap();
        (dir, reg)
    }

    #[test]
    fn test_accepted_suffixes() {
        assert!(is_accepted_audio("a.wav"));
        assert!(is_accepted_audio("A.MP3"));
        assert!(is_accepted_audio("clip.take2.m4a"));
        assert!(!is_accepted_audio("sample.txt"));
        assert!(!is_accepted_audio("wav"));
        assert!(!is_accepted_audio(""));
    }

    #[test]
    fn test_name_validation() {
        assert!(is_valid_name("ana"));
        assert!(is_valid_name("Old Man-2_v1.0"));
        assert!(is_valid_name("josé"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name(".hidden"));
        assert!(!is_valid_name(".."));
        assert!(!is_valid_name("../etc"));
        assert!(!is_valid_name("a/b"));
        assert!(!is_valid_name("a\\b"));
        assert!(!is_valid_name(&"x".repeat(129)));
    }

    #[test]
    fn test_open_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("voices");
        let reg = VoiceRegistry::open(&path).unwrap();
        assert!(path.is_dir());
        assert!(reg.list().is_empty());
    }

    #[test]
    fn test_register_then_list() {
        let (_d, reg) = registry();
        let stored = reg.register("ana", "ana.wav", b"RIFFdata").unwrap();
        assert_eq!(stored.size_bytes, 8);
        assert_eq!(stored.path, reg.canonical_path("ana"));
        assert_eq!(reg.list(), vec!["ana"]);
    }

    #[test]
    fn test_register_overwrites() {
        let (_d, reg) = registry();
        reg.register("ana", "first.wav", b"one").unwrap();
        reg.register("ana", "second.mp3", b"second").unwrap();
        assert_eq!(fs::read(reg.canonical_path("ana")).unwrap(), b"second");
        assert_eq!(reg.list(), vec!["ana"]);
    }

    #[test]
    fn test_register_rejects_unknown_suffix() {
        let (_d, reg) = registry();
        let err = reg.register("ana", "sample.txt", b"hello").unwrap_err();
        assert!(matches!(err, VoiceError::InvalidInput(_)));
        assert!(reg.list().is_empty());
    }

    #[test]
    fn test_register_rejects_bad_name() {
        let (_d, reg) = registry();
        let err = reg.register("../escape", "a.wav", b"x").unwrap_err();
        assert!(matches!(err, VoiceError::InvalidInput(_)));
        assert!(reg.list().is_empty());
    }

    #[test]
    fn test_no_staging_files_left_behind() {
        let (_d, reg) = registry();
        reg.register("ana", "ana.wav", b"abc").unwrap();
        let names: Vec<_> = fs::read_dir(reg.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["ana.wav"]);
    }

    #[test]
    fn test_list_dedups_and_sorts_across_formats() {
        let (_d, reg) = registry();
        fs::write(reg.dir().join("tony.WAV"), b"x").unwrap();
        fs::write(reg.dir().join("tony.mp3"), b"x").unwrap();
        fs::write(reg.dir().join("andrew.m4a"), b"x").unwrap();
        fs::write(reg.dir().join("notes.txt"), b"x").unwrap();
        fs::create_dir(reg.dir().join("folder.wav")).unwrap();
        assert_eq!(reg.list(), vec!["andrew", "tony"]);
    }

    #[test]
    fn test_list_recreates_missing_directory() {
        let (_d, reg) = registry();
        fs::remove_dir_all(reg.dir()).unwrap();
        assert!(reg.list().is_empty());
        assert!(reg.dir().is_dir());
    }

    #[test]
    fn test_resolve_missing_enumerates_available() {
        let (_d, reg) = registry();
        reg.register("ana", "ana.wav", b"x").unwrap();
        match reg.resolve("bob").unwrap_err() {
            VoiceError::NotFound { name, available } => {
                assert_eq!(name, "bob");
                assert_eq!(available, vec!["ana"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_resolve_requires_canonical_format() {
        let (_d, reg) = registry();
        fs::write(reg.dir().join("andrew.mp3"), b"x").unwrap();
        assert!(matches!(reg.resolve("andrew"), Err(VoiceError::NotFound { .. })));

        fs::write(reg.dir().join("katey.WAV"), b"x").unwrap();
        assert!(reg.resolve("katey").is_ok());
    }

    #[test]
    fn test_resolve_invalid_name_is_not_found() {
        let (_d, reg) = registry();
        assert!(matches!(reg.resolve("../ana"), Err(VoiceError::NotFound { .. })));
    }

    #[test]
    fn test_hand_copied_sample_is_reachable() {
        let (_d, reg) = registry();
        fs::write(reg.dir().join("Rachel (old).wav"), b"x").unwrap();
        assert_eq!(reg.list(), vec!["Rachel (old)"]);
        assert_eq!(reg.resolve("Rachel (old)").unwrap(), reg.dir().join("Rachel (old).wav"));
        reg.unregister("Rachel (old)").unwrap();
        assert!(reg.list().is_empty());
        assert!(!is_valid_name("Rachel (old)"));
    }

    #[test]
    fn test_lookup_names_stay_inside_directory() {
        assert!(is_lookup_name("Rachel (old)"));
        assert!(!is_lookup_name(""));
        assert!(!is_lookup_name("."));
        assert!(!is_lookup_name(".."));
        assert!(!is_lookup_name("../ana"));
        assert!(!is_lookup_name("a\\b"));
    }

    #[test]
    fn test_unregister() {
        let (_d, reg) = registry();
        reg.register("ana", "ana.wav", b"x").unwrap();
        fs::write(reg.dir().join("ana.mp3"), b"x").unwrap();
        reg.unregister("ana").unwrap();
        assert!(reg.list().is_empty());
        assert!(matches!(reg.unregister("ana"), Err(VoiceError::NotFound { .. })));
    }
}
