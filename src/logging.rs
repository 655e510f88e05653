/// Log sink setup: structured `tracing` output to a size-bounded log file.
///
/// The wrapped tool owns the terminal, so logs go to a file and never
/// interleave with mirrored output. Falls back to stderr if the file cannot
/// be opened.
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// Rename `path` to `<path>.1` once it grows past `max_bytes`.
///
/// Keeps one previous generation; an older `.1` is replaced.
pub fn rotate_if_oversized(path: &Path, max_bytes: u64) -> std::io::Result<bool> {
    let len = match std::fs::metadata(path) {
        Ok(m) => m.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if len <= max_bytes {
        return Ok(false);
    }
    std::fs::rename(path, rotated_path(path))?;
    Ok(true)
}

fn rotated_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".1");
    PathBuf::from(name)
}

/// Install the global subscriber. `RUST_LOG` overrides the default level.
pub fn init(log_file: &Path, max_bytes: u64, verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let rotate_error = rotate_if_oversized(log_file, max_bytes).err();
    let opened = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file);

    let (writer, open_error) = match opened {
        Ok(file) => (BoxMakeWriter::new(Mutex::new(file)), None),
        Err(e) => (BoxMakeWriter::new(std::io::stderr), Some(e)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    if let Some(e) = rotate_error {
        tracing::warn!(error = %e, path = %log_file.display(), "failed to rotate log file");
    }
    if let Some(e) = open_error {
        tracing::warn!(
            error = %e,
            path = %log_file.display(),
            "failed to open log file, logging to stderr"
        );
    }
}
