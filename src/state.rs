/// Pending-resume state file: a single JSON record that survives restarts.
///
/// Writes go to a temp file in the same directory and are renamed into
/// place, so readers never see a partial record. A missing or corrupt file
/// reads as idle.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// The persisted resume record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingResume {
    pub is_waiting: bool,
    pub original_command: Vec<String>,
    pub reset_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub max_retries: u32,
}

impl PendingResume {
    /// No resume armed.
    pub fn idle() -> Self {
        Self {
            is_waiting: false,
            original_command: Vec::new(),
            reset_time: None,
            retry_count: 0,
            max_retries: 0,
        }
    }

    /// The armed resume instant, if this record is waiting.
    pub fn resume_at(&self) -> Option<DateTime<Utc>> {
        if self.is_waiting {
            self.reset_time
        } else {
            None
        }
    }

    fn is_consistent(&self) -> bool {
        self.is_waiting == self.reset_time.is_some()
    }
}

/// Reads and writes the pending-resume record.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Atomically persist a waiting record for `command`.
    pub fn save(
        &self,
        command: &[String],
        resume_at: DateTime<Utc>,
        retry_count: u32,
        max_retries: u32,
    ) -> Result<(), StateError> {
        let record = PendingResume {
            is_waiting: true,
            original_command: command.to_vec(),
            reset_time: Some(resume_at),
            retry_count,
            max_retries,
        };
        self.write(&record)?;
        tracing::info!(
            path = %self.path.display(),
            reset_time = %resume_at,
            retry_count,
            "pending resume saved"
        );
        Ok(())
    }

    fn write(&self, record: &PendingResume) -> Result<(), StateError> {
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| StateError::Serialize { source: e })?;

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StateError::Write {
            path: dir.to_path_buf(),
            source: e,
        })?;
        tmp.write_all(json.as_bytes())
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| StateError::Write {
                path: tmp.path().to_path_buf(),
                source: e,
            })?;
        tmp.persist(&self.path).map_err(|e| StateError::Rename {
            to: self.path.clone(),
            source: e.error,
        })?;
        Ok(())
    }

    /// Read the record; anything unreadable is treated as idle.
    pub fn load(&self) -> PendingResume {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return PendingResume::idle(),
            Err(e) => {
                tracing::error!(
                    error = %e,
                    path = %self.path.display(),
                    "failed to read state file, treating as idle"
                );
                return PendingResume::idle();
            }
        };

        match serde_json::from_str::<PendingResume>(&contents) {
            Ok(record) if record.is_consistent() => record,
            Ok(record) => {
                tracing::warn!(
                    is_waiting = record.is_waiting,
                    reset_time = ?record.reset_time,
                    "inconsistent state record, treating as idle"
                );
                PendingResume::idle()
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    path = %self.path.display(),
                    "corrupt state file, treating as idle"
                );
                PendingResume::idle()
            }
        }
    }

    /// Remove the record. Clearing an idle store is a no-op.
    pub fn clear(&self) -> Result<(), StateError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::info!(path = %self.path.display(), "pending resume cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::Remove {
                path: self.path.clone(),
                source: e,
            }),
        }
    }

    /// `clear`, logging instead of failing.
    pub fn clear_logged(&self) {
        if let Err(e) = self.clear() {
            tracing::error!(error = %e, "failed to clear state file");
        }
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Errors from state file operations.
#[derive(Debug)]
pub enum StateError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        to: PathBuf,
        source: std::io::Error,
    },
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateError::Serialize { source } => write!(f, "failed to serialize state: {source}"),
            StateError::Write { path, source } => {
                write!(
                    f,
                    "failed to write temp state file in {}: {source}",
                    path.display()
                )
            }
            StateError::Rename { to, source } => {
                write!(f, "failed to move state file into {}: {source}", to.display())
            }
            StateError::Remove { path, source } => {
                write!(f, "failed to remove state file {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for StateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StateError::Serialize { source } => Some(source),
            StateError::Write { source, .. } => Some(source),
            StateError::Rename { source, .. } => Some(source),
            StateError::Remove { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn cmd(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let reset = Utc.with_ymd_and_hms(2026, 3, 10, 17, 30, 0).unwrap();

        store
            .save(&cmd(&["-p", "fix the tests"]), reset, 1, 3)
            .unwrap();

        let record = store.load();
        assert!(record.is_waiting);
        assert_eq!(record.original_command, cmd(&["-p", "fix the tests"]));
        assert_eq!(record.reset_time, Some(reset));
        assert_eq!(record.resume_at(), Some(reset));
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.max_retries, 3);
    }

    #[test]
    fn test_file_format_field_names() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::new(path.clone());
        let reset = Utc.with_ymd_and_hms(2026, 3, 10, 17, 30, 0).unwrap();
        store.save(&cmd(&["hello"]), reset, 0, 3).unwrap();

        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["isWaiting"], true);
        assert_eq!(parsed["originalCommand"][0], "hello");
        assert_eq!(parsed["resetTime"], "2026-03-10T17:30:00Z");
        assert_eq!(parsed["retryCount"], 0);
        assert_eq!(parsed["maxRetries"], 3);
    }

    #[test]
    fn test_reads_record_written_elsewhere() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(
            &path,
            r#"{
  "isWaiting": true,
  "originalCommand": ["--resume"],
  "resetTime": "2026-03-10T09:30:00.000Z",
  "retryCount": 0,
  "maxRetries": 3
}"#,
        )
        .unwrap();

        let record = StateStore::new(path).load();
        assert!(record.is_waiting);
        assert_eq!(
            record.reset_time,
            Some(Utc.with_ymd_and_hms(2026, 3, 10, 9, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_load_missing_is_idle() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("missing.json"));
        assert_eq!(store.load(), PendingResume::idle());
    }

    #[test]
    fn test_load_corrupt_is_idle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{\"isWaiting\": tr").unwrap();
        assert_eq!(StateStore::new(path).load(), PendingResume::idle());
    }

    #[test]
    fn test_load_inconsistent_is_idle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(
            &path,
            r#"{"isWaiting": true, "originalCommand": ["x"], "resetTime": null}"#,
        )
        .unwrap();
        assert_eq!(StateStore::new(path).load(), PendingResume::idle());
    }

    #[test]
    fn test_clear_removes_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::new(path.clone());
        store.save(&cmd(&["x"]), Utc::now(), 0, 3).unwrap();
        assert!(path.exists());

        store.clear().unwrap();
        assert!(!path.exists());
        assert!(!store.load().is_waiting);
    }

    #[test]
    fn test_clear_idle_is_noop() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        store.clear().unwrap();
        store.clear().unwrap();
        assert_eq!(store.load(), PendingResume::idle());
    }

    #[test]
    fn test_save_overwrites_single_slot() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let first = Utc.with_ymd_and_hms(2026, 3, 10, 10, 0, 0).unwrap();
        let second = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        store.save(&cmd(&["a"]), first, 0, 3).unwrap();
        store.save(&cmd(&["b"]), second, 1, 3).unwrap();

        let record = store.load();
        assert_eq!(record.original_command, cmd(&["b"]));
        assert_eq!(record.reset_time, Some(second));

        // Only the state file remains; the temp file was renamed over it.
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_save_to_nonexistent_dir_fails() {
        let store = StateStore::new(PathBuf::from("/nonexistent/dir/state.json"));
        let err = store.save(&cmd(&["x"]), Utc::now(), 0, 3).unwrap_err();
        assert!(matches!(err, StateError::Write { .. }));
        assert!(err.to_string().contains("failed to write temp state file"));
    }
}
