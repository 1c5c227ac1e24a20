use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

pub const LOG_FILE: &str = "testpulse.log";

/// Handle to the session log. Keep it alive for as long as logging is wanted.
#[derive(Debug, Clone)]
pub struct LogGuard {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl LogGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flush(&self) {
        use std::io::Write;
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
    }
}

pub fn default_log_path() -> Result<PathBuf> {
    let cache = dirs::cache_dir().context("Could not determine a cache directory")?;
    Ok(cache.join("testpulse").join(LOG_FILE))
}

fn default_level(debug: bool) -> &'static str {
    if debug {
        "debug"
    } else {
        "info"
    }
}

fn open_log_file(path: &Path) -> Result<File> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file: {}", path.display()))
}

/// Install the global subscriber writing to `path`. The terminal belongs to
/// the dashboard, so nothing is written to stdout or stderr.
pub fn init_at(path: &Path, debug: bool) -> Result<LogGuard> {
    let file = Arc::new(Mutex::new(open_log_file(path)?));
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level(debug)));

    let writer = Arc::clone(&file);
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(false)
        .with_writer(move || LockedFile(Arc::clone(&writer)))
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("A global logger is already installed")?;

    let debug_enabled = debug;
    tracing::info!(path = %path.display(), debug = debug_enabled, "logging initialised");
    Ok(LogGuard {
        path: path.to_path_buf(),
        file,
    })
}

pub fn init(debug: bool) -> Result<LogGuard> {
    init_at(&default_log_path()?, debug)
}

struct LockedFile(Arc<Mutex<File>>);

impl std::io::Write for LockedFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.0.lock() {
            Ok(mut file) => file.write(buf),
            Err(poisoned) => poisoned.into_inner().write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.0.lock() {
            Ok(mut file) => file.flush(),
            Err(poisoned) => poisoned.into_inner().flush(),
        }
    }
}
