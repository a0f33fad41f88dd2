//! Tracing subscriber setup.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "toolbridge=info,warn";
const LOG_FILE_NAME: &str = "toolbridge.log";
const KEPT_ROTATIONS: u32 = 3;

/// Where log lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    /// Standard error. Stdout stays free for stdio serving.
    Stderr,
    /// A log file, rotated on startup.
    File(PathBuf),
}

impl LogTarget {
    /// `toolbridge.log` in the platform data directory.
    pub fn default_file() -> Self {
        LogTarget::File(data_dir().join(LOG_FILE_NAME))
    }
}

/// Platform data directory for toolbridge, falling back to `~/.toolbridge`.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("toolbridge");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolbridge")
}

/// Install the global subscriber. Filter comes from `RUST_LOG`.
pub fn init_tracing(target: LogTarget, json: bool) -> io::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match &target {
        LogTarget::Stderr => install(filter, json, io::stderr, true),
        LogTarget::File(path) => {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            rotate_log_file(path, KEPT_ROTATIONS);
            let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
            install(filter, json, SyncedLog::open(file), false);
        }
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        target = ?target,
        pid = std::process::id(),
        "toolbridge starting"
    );
    Ok(())
}

fn install<W>(filter: EnvFilter, json: bool, writer: W, ansi: bool)
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(true);
    // A second init (tests, embedding) keeps the existing subscriber.
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.with_ansi(ansi).try_init()
    };
}

/// `base` with a `.n` generation suffix: `toolbridge.log.2`.
fn rotated(base: &Path, generation: u32) -> PathBuf {
    let mut name = OsString::from(base.as_os_str());
    name.push(format!(".{generation}"));
    PathBuf::from(name)
}

/// Age each kept log by one generation. The oldest falls off the end and
/// `base` becomes generation 1. Missing generations are skipped.
fn rotate_log_file(base: &Path, keep: u32) {
    if keep == 0 {
        return;
    }
    if let Err(e) = fs::remove_file(rotated(base, keep)) {
        if e.kind() != io::ErrorKind::NotFound {
            eprintln!("toolbridge: cannot drop oldest log: {e}");
        }
    }

    for generation in (1..keep).rev() {
        let older = rotated(base, generation);
        if older.exists() {
            let _ = fs::rename(&older, rotated(base, generation + 1));
        }
    }
    if base.exists() {
        let _ = fs::rename(base, rotated(base, 1));
    }
}

/// Shared append handle; every record hits the file before `write` returns.
#[derive(Clone)]
struct SyncedLog(Arc<Mutex<File>>);

impl SyncedLog {
    fn open(file: File) -> Self {
        SyncedLog(Arc::new(Mutex::new(file)))
    }
}

impl Write for SyncedLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut file = self
            .0
            .lock()
            .map_err(|_| io::Error::other("log file mutex poisoned"))?;
        file.write_all(buf)?;
        file.flush()?;
        Ok(buf.len())
    }

    // Writes are already durable.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for SyncedLog {
    type Writer = SyncedLog;

    fn make_writer(&'a self) -> SyncedLog {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_keeps_three() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join(LOG_FILE_NAME);

        for generation in 0..5 {
            fs::write(&log, format!("gen {generation}")).unwrap();
            rotate_log_file(&log, KEPT_ROTATIONS);
        }

        assert!(!log.exists());
        let read = |n| fs::read_to_string(rotated(&log, n)).unwrap();
        assert_eq!(read(1), "gen 4");
        assert_eq!(read(2), "gen 3");
        assert_eq!(read(3), "gen 2");
        assert!(!rotated(&log, 4).exists());
    }

    #[test]
    fn test_rotation_skips_missing_generations() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join(LOG_FILE_NAME);
        fs::write(rotated(&log, 2), "old").unwrap();
        fs::write(&log, "current").unwrap();

        rotate_log_file(&log, KEPT_ROTATIONS);

        assert_eq!(fs::read_to_string(rotated(&log, 1)).unwrap(), "current");
        assert!(!rotated(&log, 2).exists());
        assert_eq!(fs::read_to_string(rotated(&log, 3)).unwrap(), "old");
    }

    #[test]
    fn test_rotated_name() {
        let name = rotated(Path::new("/var/log/toolbridge.log"), 2);
        assert_eq!(name, PathBuf::from("/var/log/toolbridge.log.2"));
    }

    #[test]
    fn test_synced_log_writes_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");

        let mut writer = SyncedLog::open(File::create(&path).unwrap()).make_writer();
        writer.write_all(b"line one\n").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "line one\n");
    }
}
