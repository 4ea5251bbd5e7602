//! Completion log persistence.
//!
//! The completion log is the only restart mechanism: one fingerprint per
//! line, appended and fsynced as each stage finishes, read back in full at
//! startup. Whole-state serialization is deliberately absent; at tens of
//! thousands of stages it stalled the server for minutes per snapshot,
//! while an append costs one line of text.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::models::Fingerprint;

/// Directory under the working directory that holds everything needed to
/// resume or inspect a run.
pub const BACKUP_DIR: &str = "pydpiper-backups";

/// Completion log file name inside [`BACKUP_DIR`].
pub const FINISHED_STAGES_FILE: &str = "finished-stages";

/// File the server writes its listening URI to, for executors and the
/// status command.
pub const URI_FILE: &str = "uri";

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("could not open completion log {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
    #[error("could not read completion log: {0}")]
    Read(std::io::Error),
    #[error("could not append to completion log: {0}")]
    Append(std::io::Error),
}

/// Path of the backup directory for a working directory.
pub fn backup_dir(work_dir: &Path) -> PathBuf {
    work_dir.join(BACKUP_DIR)
}

/// Path of the server URI file for a working directory.
pub fn uri_file(work_dir: &Path) -> PathBuf {
    backup_dir(work_dir).join(URI_FILE)
}

/// Append-only, fsynced record of finished-stage fingerprints.
pub struct CompletionLog {
    file: File,
    path: PathBuf,
}

impl CompletionLog {
    /// Open (creating if needed) the completion log under `work_dir`.
    ///
    /// A partial last line, left by a crash mid-append, is truncated away
    /// so later appends start on a clean line boundary.
    pub fn open(work_dir: &Path) -> Result<Self, BackupError> {
        let dir = backup_dir(work_dir);
        std::fs::create_dir_all(&dir).map_err(|source| BackupError::Open {
            path: dir.display().to_string(),
            source,
        })?;
        let path = dir.join(FINISHED_STAGES_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|source| BackupError::Open {
                path: path.display().to_string(),
                source,
            })?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(BackupError::Read)?;
        if !contents.is_empty() && !contents.ends_with('\n') {
            let keep = contents.rfind('\n').map(|i| i + 1).unwrap_or(0);
            tracing::warn!(
                path = %path.display(),
                dropped = contents.len() - keep,
                "discarding partial last line of completion log"
            );
            file.set_len(keep as u64).map_err(BackupError::Read)?;
            file.seek(SeekFrom::End(0)).map_err(BackupError::Read)?;
        }

        Ok(Self { file, path })
    }

    /// Read the full set of finished fingerprints.
    ///
    /// Lines that do not parse as fingerprints are skipped with a warning;
    /// a corrupted line costs one re-executed stage, which is cheaper than
    /// refusing to resume at all.
    pub fn load(&mut self) -> Result<HashSet<Fingerprint>, BackupError> {
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(BackupError::Read)?;
        let mut contents = String::new();
        self.file
            .read_to_string(&mut contents)
            .map_err(BackupError::Read)?;
        self.file
            .seek(SeekFrom::End(0))
            .map_err(BackupError::Read)?;

        let mut set = HashSet::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match Fingerprint::from_hex(line) {
                Some(fp) => {
                    set.insert(fp);
                }
                None => {
                    tracing::warn!(path = %self.path.display(), line, "skipping malformed completion log line");
                }
            }
        }
        Ok(set)
    }

    /// Append one fingerprint and make it durable before returning.
    ///
    /// Callers rely on the write-ahead rule: a stage's dependents may only
    /// become runnable after this returns Ok.
    pub fn append(&mut self, fingerprint: &Fingerprint) -> Result<(), BackupError> {
        writeln!(self.file, "{}", fingerprint).map_err(BackupError::Append)?;
        self.file.flush().map_err(BackupError::Append)?;
        self.file.sync_data().map_err(BackupError::Append)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StageTemplate;

    fn fp(n: u32) -> Fingerprint {
        StageTemplate::new("t", vec!["echo".to_string(), n.to_string()]).fingerprint()
    }

    #[test]
    fn append_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = CompletionLog::open(dir.path()).unwrap();
        log.append(&fp(1)).unwrap();
        log.append(&fp(2)).unwrap();

        let set = log.load().unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains(&fp(1)));
        assert!(set.contains(&fp(2)));
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut log = CompletionLog::open(dir.path()).unwrap();
            log.append(&fp(1)).unwrap();
        }
        let mut log = CompletionLog::open(dir.path()).unwrap();
        let set = log.load().unwrap();
        assert!(set.contains(&fp(1)));

        // Appends after reopen extend the same file.
        log.append(&fp(2)).unwrap();
        assert_eq!(log.load().unwrap().len(), 2);
    }

    #[test]
    fn partial_last_line_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut log = CompletionLog::open(dir.path()).unwrap();
            log.append(&fp(1)).unwrap();
        }
        // Simulate a crash mid-append.
        let path = backup_dir(dir.path()).join(FINISHED_STAGES_FILE);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "deadbeef").unwrap();
        drop(file);

        let mut log = CompletionLog::open(dir.path()).unwrap();
        let set = log.load().unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.contains(&fp(1)));

        // The truncated file accepts clean appends.
        log.append(&fp(2)).unwrap();
        assert_eq!(log.load().unwrap().len(), 2);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = backup_dir(dir.path()).join(FINISHED_STAGES_FILE);
        std::fs::create_dir_all(backup_dir(dir.path())).unwrap();
        std::fs::write(&path, format!("not-a-fingerprint\n{}\n", fp(3))).unwrap();

        let mut log = CompletionLog::open(dir.path()).unwrap();
        let set = log.load().unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.contains(&fp(3)));
    }
}
