use crate::config::FuzzOptions;
use crate::input::{is_ascii_unit, unit_hash, Unit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Units larger than this are not echoed to the console.
const MAX_UNIT_SIZE_TO_PRINT: usize = 256;

/// Writes artifacts, output-corpus files and the progress log.
///
/// Filesystem failures here are logged and swallowed: a full disk must not
/// take down a fuzzing session that is still producing results, and the
/// fatal paths that call into this writer are about to exit anyway.
#[derive(Clone, Debug)]
pub struct ArtifactWriter {
    save_artifacts: bool,
    artifact_prefix: String,
    exact_artifact_path: Option<PathBuf>,
    output_corpus: Option<PathBuf>,
    only_ascii: bool,
    log_path: PathBuf,
}

impl ArtifactWriter {
    pub fn from_options(options: &FuzzOptions) -> Self {
        if let Some(dir) = &options.output_corpus {
            if let Err(e) = fs::create_dir_all(dir) {
                log::warn!("failed to create output corpus dir {dir:?}: {e}");
            }
        }
        Self {
            save_artifacts: options.save_artifacts,
            artifact_prefix: options.artifact_prefix.clone(),
            exact_artifact_path: options.exact_artifact_path.clone(),
            output_corpus: options.output_corpus.clone(),
            only_ascii: options.only_ascii,
            log_path: options.log_path.clone(),
        }
    }

    /// A writer that persists nothing. Used by tests and dry runs.
    pub fn disabled() -> Self {
        Self {
            save_artifacts: false,
            artifact_prefix: String::new(),
            exact_artifact_path: None,
            output_corpus: None,
            only_ascii: false,
            log_path: PathBuf::from("./log"),
        }
    }

    pub fn output_corpus(&self) -> Option<&Path> {
        self.output_corpus.as_deref()
    }

    /// Writes `<artifact_prefix><kind><sha1>`, or the exact artifact path
    /// when one is configured. Returns the path written.
    pub fn write_with_prefix(&self, data: &[u8], kind: &str) -> Option<PathBuf> {
        if !self.save_artifacts {
            return None;
        }
        let path = match &self.exact_artifact_path {
            Some(exact) => exact.clone(),
            None => PathBuf::from(format!(
                "{}{}{}",
                self.artifact_prefix,
                kind,
                unit_hash(data)
            )),
        };
        if let Err(e) = fs::write(&path, data) {
            log::warn!("failed to write artifact {path:?}: {e}");
            return None;
        }
        println!(
            "artifact_prefix='{}'; Test unit written to {}",
            self.artifact_prefix,
            path.display()
        );
        if data.len() <= MAX_UNIT_SIZE_TO_PRINT {
            println!("Base64: {}", BASE64.encode(data));
        }
        Some(path)
    }

    /// Persists an interesting unit into the output corpus, named by its
    /// hex SHA-1.
    pub fn write_to_output_corpus(&self, data: &[u8]) -> Option<PathBuf> {
        debug_assert!(!self.only_ascii || is_ascii_unit(data));
        let dir = self.output_corpus.as_ref()?;
        let path = dir.join(unit_hash(data));
        if let Err(e) = fs::write(&path, data) {
            log::warn!("failed to write corpus file {path:?}: {e}");
            return None;
        }
        log::debug!("written to {path:?}");
        Some(path)
    }

    /// Appends one TSV progress line: runs, duplicates, diffs, valid cases.
    pub fn append_progress_log(
        &self,
        runs: u64,
        duplicates: usize,
        diffs: usize,
        valid_cases: usize,
    ) {
        let result = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .and_then(|mut file| {
                writeln!(file, "{runs}\t{duplicates}\t{diffs}\t{valid_cases}")
            });
        if let Err(e) = result {
            log::warn!("failed to append progress log {:?}: {e}", self.log_path);
        }
    }
}

/// Reads units from a flat corpus directory, newest-epoch filtering.
///
/// Only regular files with a modification time strictly newer than `epoch`
/// are returned; `epoch` is advanced to the newest time seen. Units longer
/// than `max_size` are truncated. Hidden files are skipped. I/O problems
/// degrade to an empty batch.
pub fn read_corpus_dir(dir: &Path, max_size: usize, epoch: &mut Option<SystemTime>) -> Vec<Unit> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::debug!("cannot read corpus dir {dir:?}: {e}");
            return Vec::new();
        }
    };
    let mut units = Vec::new();
    let mut newest = *epoch;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.'))
        {
            continue;
        }
        let mtime = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        if let Some(epoch) = *epoch {
            if mtime <= epoch {
                continue;
            }
        }
        if newest.is_none() || Some(mtime) > newest {
            newest = Some(mtime);
        }
        match fs::read(&path) {
            Ok(mut unit) => {
                unit.truncate(max_size);
                units.push(unit);
            }
            Err(e) => log::warn!("failed to read corpus file {path:?}: {e}"),
        }
    }
    *epoch = newest;
    units
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn writer_with(dir: &Path, save_artifacts: bool) -> ArtifactWriter {
        ArtifactWriter {
            save_artifacts,
            artifact_prefix: format!("{}/", dir.display()),
            exact_artifact_path: None,
            output_corpus: Some(dir.join("corpus")),
            only_ascii: false,
            log_path: dir.join("log"),
        }
    }

    #[test]
    fn artifact_is_named_by_kind_and_hash() {
        let dir = tempdir().unwrap();
        let writer = writer_with(dir.path(), true);
        let path = writer.write_with_prefix(b"boom", "crash-").unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(name, format!("crash-{}", unit_hash(b"boom")));
        assert_eq!(fs::read(&path).unwrap(), b"boom");
    }

    #[test]
    fn exact_artifact_path_wins() {
        let dir = tempdir().unwrap();
        let exact = dir.path().join("the-one-artifact");
        let mut writer = writer_with(dir.path(), true);
        writer.exact_artifact_path = Some(exact.clone());
        let path = writer.write_with_prefix(b"unit", "timeout-").unwrap();
        assert_eq!(path, exact);
        assert!(exact.exists());
    }

    #[test]
    fn disabled_writer_persists_nothing() {
        let writer = ArtifactWriter::disabled();
        assert!(writer.write_with_prefix(b"unit", "crash-").is_none());
        assert!(writer.write_to_output_corpus(b"unit").is_none());
    }

    #[test]
    fn output_corpus_files_are_content_addressed() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("corpus")).unwrap();
        let writer = writer_with(dir.path(), true);
        let path = writer.write_to_output_corpus(b"seed").unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            unit_hash(b"seed")
        );
    }

    #[test]
    fn progress_log_accumulates_tsv_lines() {
        let dir = tempdir().unwrap();
        let writer = writer_with(dir.path(), true);
        writer.append_progress_log(20, 1, 0, 2);
        writer.append_progress_log(40, 3, 1, 2);
        let content = fs::read_to_string(dir.path().join("log")).unwrap();
        assert_eq!(content, "20\t1\t0\t2\n40\t3\t1\t2\n");
    }

    #[test]
    fn read_corpus_dir_truncates_and_tracks_epoch() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a"), vec![0u8; 100]).unwrap();
        fs::write(dir.path().join(".hidden"), b"skip me").unwrap();
        fs::create_dir(dir.path().join("subdir")).unwrap();

        let mut epoch = None;
        let units = read_corpus_dir(dir.path(), 10, &mut epoch);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].len(), 10);
        assert!(epoch.is_some());

        // Nothing new since the recorded epoch.
        let units = read_corpus_dir(dir.path(), 10, &mut epoch);
        assert!(units.is_empty());

        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(dir.path().join("b"), b"fresh").unwrap();
        let units = read_corpus_dir(dir.path(), 10, &mut epoch);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0], b"fresh");
    }

    #[test]
    fn read_corpus_dir_handles_missing_dir() {
        let mut epoch = None;
        let units = read_corpus_dir(Path::new("/nonexistent/parallax-corpus"), 8, &mut epoch);
        assert!(units.is_empty());
        assert!(epoch.is_none());
    }
}
