use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Local;
use infer::MatcherType;
use log::debug;
use uuid::Uuid;
use walkdir::WalkDir;

pub const ALLOWED_EXTENSIONS: [&str; 3] = ["m4a", "mp3", "wav"];

fn extension(filename: &str) -> Option<String> {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
}

pub fn allowed_file(filename: &str) -> bool {
    extension(filename).is_some_and(|ext| ALLOWED_EXTENSIONS.contains(&ext.as_str()))
}

/// Reduces a client-supplied name to a safe single path component.
pub fn secure_filename(filename: &str) -> String {
    let ascii: String = filename
        .chars()
        .filter(char::is_ascii)
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();
    let joined = ascii.split_whitespace().collect::<Vec<_>>().join("_");
    let kept: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(*c, '_' | '.' | '-'))
        .collect();
    let trimmed = kept.trim_matches(|c| c == '.' || c == '_');
    if trimmed.is_empty() {
        "upload".to_string()
    } else {
        trimmed.to_string()
    }
}

/// `false` only when the content is positively identified as
/// something other than audio or video; unknown content gets the benefit of
/// the doubt and is left to the decoder.
pub fn is_probably_audio(path: &Path) -> io::Result<bool> {
    Ok(match infer::get_from_path(path)? {
        Some(kind) => matches!(kind.matcher_type(), MatcherType::Audio | MatcherType::Video),
        None => true,
    })
}

/// Upload storage organised in one folder per day.
#[derive(Debug, Clone)]
pub struct UploadStore {
    root: PathBuf,
}

impl UploadStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fresh path `<root>/<YYYY-MM-DD>/<8 hex>__<sanitised name>`.
    pub fn unique_save_path(&self, filename: &str) -> io::Result<PathBuf> {
        let folder = self.root.join(Local::now().format("%Y-%m-%d").to_string());
        fs::create_dir_all(&folder)?;

        let mut safe = secure_filename(filename);
        if !allowed_file(&safe) {
            if let Some(ext) = extension(filename) {
                safe = format!("{safe}.{ext}");
            }
        }

        let uid = Uuid::new_v4().simple().to_string();
        Ok(folder.join(format!("{}__{}", &uid[..8], safe)))
    }

    /// Removes stored files last modified more than `age` ago. Failures are
    /// ignored; returns the number of files removed.
    pub fn cleanup_older_than(&self, age: Duration) -> usize {
        let Some(cutoff) = SystemTime::now().checked_sub(age) else {
            return 0;
        };

        let mut removed = 0;
        for entry in WalkDir::new(&self.root).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let stale = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .is_some_and(|modified| modified < cutoff);
            if stale && fs::remove_file(entry.path()).is_ok() {
                debug!("Removed stale upload {}", entry.path().display());
                removed += 1;
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_check_is_case_insensitive() {
        assert!(allowed_file("clip.WAV"));
        assert!(allowed_file("a.b.m4a"));
        assert!(!allowed_file("clip.flac"));
        assert!(!allowed_file("wav"));
    }

    #[test]
    fn filenames_are_sanitised() {
        assert_eq!(secure_filename("My cool movie.mov"), "My_cool_movie.mov");
        assert_eq!(secure_filename("../../../etc/passwd"), "etc_passwd");
        assert_eq!(secure_filename("i contain cool \u{fc}ml\u{e4}uts.wav"), "i_contain_cool_mluts.wav");
        assert_eq!(secure_filename("__.."), "upload");
        assert_eq!(secure_filename("voice<1>.mp3"), "voice1.mp3");
    }

    #[test]
    fn save_paths_are_unique_and_dated() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path().join("uploads")).unwrap();
        let a = store.unique_save_path("clip.wav").unwrap();
        let b = store.unique_save_path("clip.wav").unwrap();
        assert_ne!(a, b);

        let name = a.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(name.len(), 8 + 2 + "clip.wav".len());
        assert!(name.ends_with("__clip.wav"));
        assert_eq!(a.parent().unwrap().parent().unwrap(), store.root());
    }

    #[test]
    fn sanitising_never_drops_the_extension() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path()).unwrap();
        let path = store.unique_save_path("\u{e9}.wav").unwrap();
        assert!(path.to_string_lossy().ends_with("__wav.wav"));
    }

    #[test]
    fn cleanup_removes_only_stale_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path()).unwrap();
        let path = store.unique_save_path("clip.wav").unwrap();
        fs::write(&path, b"data").unwrap();

        assert_eq!(store.cleanup_older_than(Duration::from_secs(3600)), 0);
        assert!(path.exists());

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(store.cleanup_older_than(Duration::from_millis(1)), 1);
        assert!(!path.exists());
    }

    #[test]
    fn content_sniffing_rejects_images() {
        let dir = tempfile::tempdir().unwrap();
        let png = dir.path().join("fake.wav");
        fs::write(&png, [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0]).unwrap();
        assert!(!is_probably_audio(&png).unwrap());

        let unknown = dir.path().join("unknown.wav");
        fs::write(&unknown, b"hello").unwrap();
        assert!(is_probably_audio(&unknown).unwrap());
    }
}
