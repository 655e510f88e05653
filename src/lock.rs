/// Singleton lock: at most one supervising wrapper per working directory.
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Held for the lifetime of a supervising run; released on drop.
///
/// The lock file itself is left in place. Deleting it would let a second
/// process lock a fresh inode while a third still holds the old one.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
}

impl InstanceLock {
    /// Take the exclusive lock, failing immediately if another wrapper holds it.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| LockError::Open {
                path: path.to_path_buf(),
                source: e,
            })?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == fs2::lock_contended_error().kind() {
                return Err(LockError::Held {
                    path: path.to_path_buf(),
                });
            }
            return Err(LockError::Open {
                path: path.to_path_buf(),
                source: e,
            });
        }

        tracing::debug!(path = %path.display(), "instance lock acquired");
        Ok(Self { file })
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[derive(Debug)]
pub enum LockError {
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    Held {
        path: PathBuf,
    },
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Open { path, source } => {
                write!(f, "failed to open lock file {}: {source}", path.display())
            }
            LockError::Held { path } => write!(
                f,
                "another wrapper is already running here (lock held on {})",
                path.display()
            ),
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LockError::Open { source, .. } => Some(source),
            LockError::Held { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_second_acquire_is_refused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wrapper.lock");

        let _held = InstanceLock::acquire(&path).unwrap();
        let err = InstanceLock::acquire(&path).unwrap_err();
        assert!(matches!(err, LockError::Held { .. }));
        assert!(err.to_string().contains("already running"));
    }

    #[test]
    fn test_released_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wrapper.lock");

        {
            let _held = InstanceLock::acquire(&path).unwrap();
            assert!(path.exists());
        }
        let _again = InstanceLock::acquire(&path).unwrap();
    }

    #[test]
    fn test_missing_dir_is_open_error() {
        let err = InstanceLock::acquire(Path::new("/nonexistent/dir/wrapper.lock")).unwrap_err();
        assert!(matches!(err, LockError::Open { .. }));
    }
}
