//! File watcher for automatic test re-running
//!
//! Watches the project tree for source changes and reports them, debounced,
//! as [`WatchSignal`]s. The receiver decides what to rerun.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use glob::Pattern;
use notify::event::{CreateKind, ModifyKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::WatchError;

pub const DEFAULT_DEDUP: Duration = Duration::from_millis(100);
pub const DEFAULT_QUIET: Duration = Duration::from_millis(300);
const DEFAULT_PATTERNS: &[&str] = &["*.go"];
const DEFAULT_SKIP_DIRS: &[&str] = &["vendor", "node_modules"];

/// What the watcher reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchSignal {
    /// Paths whose quiet period elapsed together.
    Changed(Vec<PathBuf>),
    /// The watch loop stopped on an error.
    Stopped(String),
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// File name patterns that count as source files.
    pub patterns: Vec<Pattern>,
    /// Directory names never descended into, besides hidden ones.
    pub skip_dirs: Vec<String>,
    pub dedup: Duration,
    pub quiet: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            patterns: DEFAULT_PATTERNS
                .iter()
                .filter_map(|p| Pattern::new(p).ok())
                .collect(),
            skip_dirs: DEFAULT_SKIP_DIRS.iter().map(|s| s.to_string()).collect(),
            dedup: DEFAULT_DEDUP,
            quiet: DEFAULT_QUIET,
        }
    }
}

impl WatchConfig {
    fn skips_dir(&self, name: &str) -> bool {
        name.starts_with('.') || self.skip_dirs.iter().any(|d| d == name)
    }

    /// Whether a changed path should trigger a rerun.
    pub fn is_watched(&self, root: &Path, path: &Path) -> bool {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if !self.patterns.iter().any(|p| p.matches(file_name)) {
            return false;
        }
        let relative = path.strip_prefix(root).unwrap_or(path);
        let in_skipped_dir = relative
            .parent()
            .map(|dir| {
                dir.components()
                    .filter_map(|c| c.as_os_str().to_str())
                    .any(|name| self.skips_dir(name))
            })
            .unwrap_or(false);
        !in_skipped_dir
    }

    /// Every directory under `root` that should be watched, root included.
    pub fn collect_dirs(&self, root: &Path) -> Result<Vec<PathBuf>, WatchError> {
        let mut dirs = vec![root.to_path_buf()];
        let mut stack = vec![root.to_path_buf()];

        while let Some(dir) = stack.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(source) if dir == root => {
                    return Err(WatchError::Io { path: dir, source });
                }
                Err(err) => {
                    warn!(path = %dir.display(), error = %err, "skipping unreadable directory");
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                let skip = entry
                    .file_name()
                    .to_str()
                    .map(|name| self.skips_dir(name))
                    .unwrap_or(true);
                if !skip {
                    dirs.push(path.clone());
                    stack.push(path);
                }
            }
        }

        dirs.sort();
        Ok(dirs)
    }
}

/// Per-path duplicate suppression and quiet-period timers.
#[derive(Debug)]
pub struct Debouncer {
    dedup: Duration,
    quiet: Duration,
    last_seen: HashMap<PathBuf, Instant>,
    deadlines: HashMap<PathBuf, Instant>,
}

impl Debouncer {
    pub fn new(dedup: Duration, quiet: Duration) -> Self {
        Self {
            dedup,
            quiet,
            last_seen: HashMap::new(),
            deadlines: HashMap::new(),
        }
    }

    /// Record an event for `path`. Returns false if it was a duplicate.
    pub fn offer(&mut self, path: PathBuf, now: Instant) -> bool {
        let dedup = self.dedup;
        self.last_seen
            .retain(|_, seen| now.saturating_duration_since(*seen) < dedup);
        if self.last_seen.contains_key(&path) {
            return false;
        }
        self.last_seen.insert(path.clone(), now);
        self.deadlines.insert(path, now + self.quiet);
        true
    }

    /// Earliest pending quiet-period deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return every path whose quiet period has elapsed.
    pub fn take_due(&mut self, now: Instant) -> Vec<PathBuf> {
        let mut due: Vec<PathBuf> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &due {
            self.deadlines.remove(path);
        }
        due.sort();
        due
    }

    pub fn is_idle(&self) -> bool {
        self.deadlines.is_empty()
    }
}

/// Running watch loop.
pub struct WatchHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WatchHandle {
    /// Stop the loop and wait for it to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            debug!(error = %err, "watch task ended abnormally");
        }
    }
}

/// Test watcher for automatic re-running
pub struct FileWatcher {
    root: PathBuf,
    config: WatchConfig,
}

impl FileWatcher {
    pub fn new(root: &Path, config: WatchConfig) -> Self {
        Self {
            root: root.to_path_buf(),
            config,
        }
    }

    /// Start watching. Signals are converted into `M` and sent to `tx`.
    pub fn start<M>(
        self,
        tx: mpsc::UnboundedSender<M>,
        cancel: CancellationToken,
    ) -> Result<WatchHandle, WatchError>
    where
        M: From<WatchSignal> + Send + 'static,
    {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = raw_tx.send(res);
        })?;

        let dirs = self.config.collect_dirs(&self.root)?;
        for dir in &dirs {
            if let Err(err) = watcher.watch(dir, RecursiveMode::NonRecursive) {
                warn!(path = %dir.display(), error = %err, "failed to watch directory");
            }
        }
        info!(root = %self.root.display(), directories = dirs.len(), "file watcher started");

        let cancel = cancel.child_token();
        let task = tokio::spawn(self.run(watcher, raw_rx, tx, cancel.clone()));
        Ok(WatchHandle { cancel, task })
    }

    async fn run<M>(
        self,
        mut watcher: RecommendedWatcher,
        mut raw_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
        tx: mpsc::UnboundedSender<M>,
        cancel: CancellationToken,
    ) where
        M: From<WatchSignal> + Send + 'static,
    {
        let mut debouncer = Debouncer::new(self.config.dedup, self.config.quiet);

        loop {
            let deadline = debouncer.next_deadline();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                raw = raw_rx.recv() => match raw {
                    Some(Ok(event)) => self.handle(event, &mut debouncer, &mut watcher),
                    Some(Err(err)) => {
                        error!(error = %err, "file watcher error");
                        let _ = tx.send(WatchSignal::Stopped(err.to_string()).into());
                        break;
                    }
                    None => break,
                },
                _ = wait_until(deadline) => {
                    let paths = debouncer.take_due(Instant::now());
                    if paths.is_empty() {
                        continue;
                    }
                    debug!(count = paths.len(), "debounced file change");
                    if tx.send(WatchSignal::Changed(paths).into()).is_err() {
                        break;
                    }
                }
            }
        }

        info!("file watcher stopped");
    }

    fn handle(&self, event: Event, debouncer: &mut Debouncer, watcher: &mut RecommendedWatcher) {
        match event.kind {
            EventKind::Create(CreateKind::Folder) => {
                for path in &event.paths {
                    self.watch_new_dir(path, watcher);
                }
                return;
            }
            EventKind::Create(_) => {}
            EventKind::Modify(ModifyKind::Metadata(_)) => return,
            EventKind::Modify(_) => {}
            _ => return,
        }

        let now = Instant::now();
        for path in event.paths {
            if path.is_dir() {
                self.watch_new_dir(&path, watcher);
                continue;
            }
            if !self.config.is_watched(&self.root, &path) {
                continue;
            }
            if debouncer.offer(path.clone(), now) {
                debug!(path = %path.display(), "file changed");
            }
        }
    }

    fn watch_new_dir(&self, path: &Path, watcher: &mut RecommendedWatcher) {
        let skipped = path
            .strip_prefix(&self.root)
            .unwrap_or(path)
            .components()
            .filter_map(|c| c.as_os_str().to_str())
            .any(|name| self.config.skips_dir(name));
        if skipped {
            return;
        }
        match self.config.collect_dirs(path) {
            Ok(dirs) => {
                for dir in dirs {
                    if let Err(err) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
                        warn!(path = %dir.display(), error = %err, "failed to watch directory");
                    }
                }
            }
            Err(err) => warn!(error = %err, "failed to watch new directory"),
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_duplicates_within_window_are_dropped() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(DEFAULT_DEDUP, DEFAULT_QUIET);
        let path = PathBuf::from("/m/a.go");

        assert!(debouncer.offer(path.clone(), start));
        assert!(!debouncer.offer(path.clone(), start + ms(50)));
        assert_eq!(debouncer.next_deadline(), Some(start + ms(300)));

        assert!(debouncer.offer(path.clone(), start + ms(150)));
        assert_eq!(debouncer.next_deadline(), Some(start + ms(450)));
    }

    #[test]
    fn test_quiet_timer_fires_once() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(DEFAULT_DEDUP, DEFAULT_QUIET);
        let path = PathBuf::from("/m/a.go");

        debouncer.offer(path.clone(), start);
        debouncer.offer(path.clone(), start + ms(200));
        assert!(debouncer.take_due(start + ms(400)).is_empty());
        assert_eq!(debouncer.take_due(start + ms(500)), vec![path]);
        assert!(debouncer.take_due(start + ms(900)).is_empty());
        assert!(debouncer.is_idle());
    }

    #[test]
    fn test_paths_debounce_independently() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(DEFAULT_DEDUP, DEFAULT_QUIET);
        let a = PathBuf::from("/m/a.go");
        let b = PathBuf::from("/m/b.go");

        debouncer.offer(a.clone(), start);
        debouncer.offer(b.clone(), start + ms(10));
        assert!(debouncer.offer(a.clone(), start + ms(200)));

        assert_eq!(debouncer.take_due(start + ms(320)), vec![b]);
        assert_eq!(debouncer.take_due(start + ms(500)), vec![a]);
    }

    #[test]
    fn test_is_watched_filters_paths() {
        let config = WatchConfig::default();
        let root = Path::new("/proj");

        assert!(config.is_watched(root, Path::new("/proj/pkg/calc.go")));
        assert!(config.is_watched(root, Path::new("/proj/pkg/calc_test.go")));
        assert!(!config.is_watched(root, Path::new("/proj/pkg/README.md")));
        assert!(!config.is_watched(root, Path::new("/proj/vendor/x/y.go")));
        assert!(!config.is_watched(root, Path::new("/proj/.git/hooks/a.go")));
        assert!(!config.is_watched(root, Path::new("/proj/web/node_modules/z.go")));
    }

    #[test]
    fn test_collect_dirs_skips_hidden_and_vendor() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        for sub in ["pkg/inner", ".git/objects", "vendor/lib", "cmd"] {
            fs::create_dir_all(root.join(sub)).unwrap();
        }

        let dirs = WatchConfig::default().collect_dirs(root).unwrap();
        let relative: Vec<_> = dirs
            .iter()
            .map(|d| d.strip_prefix(root).unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(relative, vec!["", "cmd", "pkg", "pkg/inner"]);
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let dir = tempdir().unwrap();
        let result = WatchConfig::default().collect_dirs(&dir.path().join("absent"));
        assert!(matches!(result, Err(WatchError::Io { .. })));
    }

    #[tokio::test]
    async fn test_write_triggers_one_signal() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::create_dir_all(root.join("pkg")).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel::<WatchSignal>();
        let handle = FileWatcher::new(&root, WatchConfig::default())
            .start(tx, CancellationToken::new())
            .unwrap();

        let file = root.join("pkg").join("calc.go");
        fs::write(&file, "package pkg\n").unwrap();
        fs::write(root.join("pkg").join("notes.txt"), "ignored").unwrap();

        let signal = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no change reported")
            .unwrap();
        match signal {
            WatchSignal::Changed(paths) => assert_eq!(paths, vec![file]),
            other => panic!("unexpected signal {other:?}"),
        }

        assert!(tokio::time::timeout(ms(600), rx.recv()).await.is_err());
        handle.stop().await;
    }
}
