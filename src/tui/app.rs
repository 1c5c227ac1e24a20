//! Dashboard state machine
//!
//! All state the screen shows lives in [`App`]. Background work reports back
//! through [`Message`]s, handled one at a time by [`App::update`], which
//! answers with [`Effect`]s for the runtime to carry out. Nothing else writes
//! to the forest, the selection or the run flags.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crossterm::event::KeyEvent;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{key_command, Command};
use crate::discovery::Package;
use crate::editor::find_location;
use crate::event::{Action, TestEvent};
use crate::failures::{build_run_regex, FailureStore};
use crate::test_model::{ResultForest, Row, RowFilter, RunSummary};
use crate::test_runner::{RunFlags, RunRequest};
use crate::watcher::WatchSignal;

pub const LOG_CAPACITY: usize = 400;
pub const TOAST_TTL: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Discovering,
    Idle,
    Running,
    /// Discovery failed; the next key press ends the session.
    Fatal(String),
}

/// Focus area in the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Focus {
    #[default]
    Tree,
    Log,
}

/// Input to the state machine.
#[derive(Debug)]
pub enum Message {
    Key(KeyEvent),
    Discovered(Result<Vec<Package>, String>),
    Test(TestEvent),
    RunFinished {
        run_id: Uuid,
        summary: RunSummary,
        cancelled: bool,
    },
    Watch(WatchSignal),
    EditorClosed(Result<(), String>),
    Error(String),
    Tick,
}

impl From<WatchSignal> for Message {
    fn from(signal: WatchSignal) -> Self {
        Message::Watch(signal)
    }
}

/// Work the runtime performs on behalf of the app.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Discover,
    StartRun { run_id: Uuid, request: RunRequest },
    CancelRun,
    StartWatch,
    StopWatch,
    OpenEditor { file: PathBuf, line: u32 },
    Quit,
}

#[derive(Debug, Clone)]
pub struct Toast {
    pub text: String,
    pub expires_at: Instant,
}

/// Which package of the batch is reporting right now.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    pub current: Option<String>,
    pub finished: usize,
    pub total: usize,
}

impl Progress {
    /// One-based position of the package currently reporting.
    pub fn index(&self) -> usize {
        (self.finished + 1).min(self.total.max(1))
    }
}

/// TUI application state
pub struct App {
    pub work_dir: PathBuf,
    pub phase: Phase,
    pub watching: bool,
    pub forest: ResultForest,
    /// Import path to package directory, from discovery.
    pub package_dirs: BTreeMap<String, PathBuf>,
    pub cursor: usize,
    /// Selected rows as (package, test path); empty path is the package row.
    pub selected: BTreeSet<(String, String)>,
    pub filter: RowFilter,
    pub filter_input: bool,
    pub focus: Focus,
    pub flags: RunFlags,
    /// Live counts for the active or last run.
    pub counters: RunSummary,
    pub progress: Progress,
    pub started_at: Option<Instant>,
    pub last_duration: Option<Duration>,
    pub toasts: VecDeque<Toast>,
    pub log: VecDeque<String>,
    /// Lines scrolled up from the bottom of the log.
    pub log_scroll: usize,
    pub last_request: Option<RunRequest>,
    active_run: Option<Uuid>,
    failures: FailureStore,
    watch_on_start: bool,
    quit: bool,
}

impl App {
    pub fn new(
        work_dir: &Path,
        flags: RunFlags,
        failures: FailureStore,
        watch_on_start: bool,
    ) -> Self {
        Self {
            work_dir: work_dir.to_path_buf(),
            phase: Phase::Discovering,
            watching: false,
            forest: ResultForest::new(),
            package_dirs: BTreeMap::new(),
            cursor: 0,
            selected: BTreeSet::new(),
            filter: RowFilter::default(),
            filter_input: false,
            focus: Focus::Tree,
            flags,
            counters: RunSummary::default(),
            progress: Progress::default(),
            started_at: None,
            last_duration: None,
            toasts: VecDeque::new(),
            log: VecDeque::with_capacity(LOG_CAPACITY),
            log_scroll: 0,
            last_request: None,
            active_run: None,
            failures,
            watch_on_start,
            quit: false,
        }
    }

    /// Effects to run once the loop is up.
    pub fn start(&mut self) -> Vec<Effect> {
        self.phase = Phase::Discovering;
        let mut effects = vec![Effect::Discover];
        if self.watch_on_start {
            self.watching = true;
            effects.push(Effect::StartWatch);
        }
        effects
    }

    pub fn should_quit(&self) -> bool {
        self.quit
    }

    /// Error to report on exit, if discovery failed.
    pub fn exit_error(&self) -> Option<&str> {
        match &self.phase {
            Phase::Fatal(message) => Some(message),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.phase == Phase::Running
    }

    pub fn update(&mut self, message: Message, now: Instant) -> Vec<Effect> {
        if let (Phase::Fatal(_), Message::Key(_)) = (&self.phase, &message) {
            self.quit = true;
            return vec![Effect::Quit];
        }

        match message {
            Message::Key(key) => match key_command(key, self.filter_input) {
                Some(command) => self.command(command, now),
                None => Vec::new(),
            },
            Message::Discovered(result) => {
                self.discovered(result);
                Vec::new()
            }
            Message::Test(event) => {
                self.test_event(event);
                Vec::new()
            }
            Message::RunFinished {
                run_id,
                summary,
                cancelled,
            } => {
                self.run_finished(run_id, summary, cancelled, now);
                Vec::new()
            }
            Message::Watch(signal) => self.watch_signal(signal, now),
            Message::EditorClosed(Ok(())) => Vec::new(),
            Message::EditorClosed(Err(err)) => {
                self.toast(format!("Editor failed: {err}"), now);
                Vec::new()
            }
            Message::Error(message) => {
                self.log_line(format!("! {message}"));
                self.toast(message, now);
                Vec::new()
            }
            Message::Tick => {
                self.toasts.retain(|toast| toast.expires_at > now);
                Vec::new()
            }
        }
    }

    fn command(&mut self, command: Command, now: Instant) -> Vec<Effect> {
        match command {
            Command::Quit => {
                self.quit = true;
                return vec![Effect::Quit];
            }
            Command::Up => self.cursor = self.cursor.saturating_sub(1),
            Command::Down => {
                self.cursor += 1;
                self.clamp_cursor();
            }
            Command::First => self.cursor = 0,
            Command::Last => self.cursor = self.rows().len().saturating_sub(1),
            Command::ToggleSelect => self.toggle_select(),
            Command::RunSelection => return self.run_selection(now),
            Command::RunAll => {
                let request = self.all_request();
                return self.start_run(request, now);
            }
            Command::RunFailed => return self.run_failed(now),
            Command::RepeatLast => return self.repeat_last(now),
            Command::Rediscover => {
                if self.phase == Phase::Idle {
                    self.phase = Phase::Discovering;
                    return vec![Effect::Discover];
                }
            }
            Command::StartFilter => self.filter_input = true,
            Command::FilterPush(c) => {
                self.filter.text.push(c);
                self.clamp_cursor();
            }
            Command::FilterPop => {
                self.filter.text.pop();
                self.clamp_cursor();
            }
            Command::EndFilter => self.filter_input = false,
            Command::Escape => return self.escape(),
            Command::ToggleFailOnly => {
                self.filter.failed_only = !self.filter.failed_only;
                self.clamp_cursor();
            }
            Command::ToggleWatch => {
                self.watching = !self.watching;
                self.toast(format!("watch: {}", on_off(self.watching)), now);
                return vec![if self.watching {
                    Effect::StartWatch
                } else {
                    Effect::StopWatch
                }];
            }
            Command::ToggleCover => {
                self.flags.cover = !self.flags.cover;
                self.toast(format!("cover: {}", on_off(self.flags.cover)), now);
            }
            Command::ToggleRace => {
                self.flags.race = !self.flags.race;
                self.toast(format!("race: {}", on_off(self.flags.race)), now);
            }
            Command::ToggleShort => {
                self.flags.short = !self.flags.short;
                self.toast(format!("short: {}", on_off(self.flags.short)), now);
            }
            Command::OpenEditor => return self.open_editor(now),
            Command::SwitchFocus => {
                self.focus = match self.focus {
                    Focus::Tree => Focus::Log,
                    Focus::Log => Focus::Tree,
                }
            }
            Command::ScrollUp => {
                self.log_scroll = (self.log_scroll + 10).min(self.log.len().saturating_sub(1))
            }
            Command::ScrollDown => self.log_scroll = self.log_scroll.saturating_sub(10),
        }
        Vec::new()
    }

    fn escape(&mut self) -> Vec<Effect> {
        if self.filter_input || !self.filter.text.is_empty() {
            self.filter.text.clear();
            self.filter_input = false;
            self.clamp_cursor();
            Vec::new()
        } else if self.is_running() {
            vec![Effect::CancelRun]
        } else {
            self.selected.clear();
            Vec::new()
        }
    }

    /// Rows currently visible under the filter.
    pub fn rows(&self) -> Vec<Row> {
        self.forest.rows(&self.filter)
    }

    pub fn current_row(&self) -> Option<Row> {
        self.rows().into_iter().nth(self.cursor)
    }

    fn clamp_cursor(&mut self) {
        let len = self.rows().len();
        self.cursor = self.cursor.min(len.saturating_sub(1));
    }

    fn toggle_select(&mut self) {
        let Some(row) = self.current_row() else {
            return;
        };
        let key = (row.package, row.path);
        if !self.selected.remove(&key) {
            self.selected.insert(key);
        }
    }

    /// Output lines of the node under the cursor.
    pub fn selected_output(&self) -> Vec<&str> {
        self.current_row()
            .and_then(|row| self.forest.find(&row.package, &row.path))
            .map(|node| node.output.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn toast(&mut self, text: impl Into<String>, now: Instant) {
        self.toasts.push_back(Toast {
            text: text.into(),
            expires_at: now + TOAST_TTL,
        });
    }

    fn log_line(&mut self, line: String) {
        self.log.push_back(line);
        while self.log.len() > LOG_CAPACITY {
            self.log.pop_front();
        }
    }

    fn discovered(&mut self, result: Result<Vec<Package>, String>) {
        match result {
            Ok(packages) => {
                for package in &packages {
                    self.forest.seed(&package.import_path, &package.tests);
                    self.package_dirs
                        .insert(package.import_path.clone(), package.dir.clone());
                }
                self.log_line(format!("discovered {} packages", packages.len()));
                self.phase = Phase::Idle;
                self.clamp_cursor();
            }
            Err(message) => {
                warn!(error = %message, "discovery failed");
                self.phase = Phase::Fatal(message);
            }
        }
    }

    fn all_request(&self) -> RunRequest {
        RunRequest::new(self.package_dirs.keys().cloned(), self.flags.clone())
    }

    fn run_selection(&mut self, now: Instant) -> Vec<Effect> {
        let targets: Vec<(String, String)> = if self.selected.is_empty() {
            self.current_row()
                .map(|row| vec![(row.package, row.path)])
                .unwrap_or_default()
        } else {
            self.selected.iter().cloned().collect()
        };
        if targets.is_empty() {
            self.toast("Nothing selected", now);
            return Vec::new();
        }
        let request = selection_request(&targets, self.flags.clone());
        self.start_run(request, now)
    }

    fn run_failed(&mut self, now: Instant) -> Vec<Effect> {
        if self.is_running() {
            self.toast("A run is already in progress", now);
            return Vec::new();
        }
        match self.failures.retry_request(self.flags.clone()) {
            Some(request) => self.start_run(request, now),
            None => {
                self.toast("No failed tests", now);
                Vec::new()
            }
        }
    }

    fn repeat_last(&mut self, now: Instant) -> Vec<Effect> {
        match self.last_request.clone() {
            Some(mut request) => {
                request.flags = self.flags.clone();
                self.start_run(request, now)
            }
            None => {
                self.toast("Nothing to repeat", now);
                Vec::new()
            }
        }
    }

    /// Begin a run unless one is active. A new run resets the targeted
    /// packages and forgets the previous failures.
    fn start_run(&mut self, request: RunRequest, now: Instant) -> Vec<Effect> {
        match self.phase {
            Phase::Idle => {}
            Phase::Running => {
                self.toast("A run is already in progress", now);
                return Vec::new();
            }
            Phase::Discovering | Phase::Fatal(_) => return Vec::new(),
        }

        let run_id = Uuid::new_v4();
        self.forest.reset_packages(&request.packages);
        self.failures.begin_run();
        self.counters = RunSummary::default();
        self.progress = Progress {
            current: None,
            finished: 0,
            total: if request.packages.is_empty() {
                self.forest.packages().count()
            } else {
                request.packages.len()
            },
        };
        self.started_at = Some(now);
        self.active_run = Some(run_id);
        self.phase = Phase::Running;
        self.last_request = Some(request.clone());
        self.log_line(format!("▶ {}", request.describe()));
        info!(%run_id, target = %request.describe(), "run requested");

        vec![Effect::StartRun { run_id, request }]
    }

    fn test_event(&mut self, event: TestEvent) {
        if !self.is_running() {
            debug!(package = %event.package, "event outside a run dropped");
            return;
        }

        self.forest.apply(&event);
        self.counters.record(&event);
        self.failures.record(&event);

        if !event.package.is_empty() {
            self.progress.current = Some(event.package.clone());
        }
        if !event.is_test_event() && event.action.is_terminal() {
            self.progress.finished += 1;
        }

        match event.action {
            Action::Run if event.is_test_event() => {
                self.log_line(format!("=== {} · {}", event.package, event.test));
            }
            Action::Output | Action::BuildOutput => {
                if let Some(output) = event.output {
                    self.log_line(output.trim_end_matches('\n').to_string());
                }
            }
            _ => {}
        }
    }

    fn run_finished(&mut self, run_id: Uuid, summary: RunSummary, cancelled: bool, now: Instant) {
        if self.active_run != Some(run_id) {
            debug!(%run_id, "finish for an unknown run ignored");
            return;
        }
        self.active_run = None;
        self.phase = Phase::Idle;
        self.last_duration = self.started_at.map(|start| now.saturating_duration_since(start));

        if let Err(err) = self.failures.persist() {
            warn!(error = %err, "failed to save failure set");
            self.log_line(format!("! could not save failures: {err}"));
        }

        let text = if cancelled {
            "Run cancelled".to_string()
        } else if summary.failed > 0 {
            format!("✗ {} failed, {} passed", summary.failed, summary.passed)
        } else {
            format!("✓ {} passed", summary.passed)
        };
        info!(%run_id, total = summary.total, failed = summary.failed, cancelled, "run finished");
        self.log_line(text.clone());
        self.toast(text, now);
    }

    fn watch_signal(&mut self, signal: WatchSignal, now: Instant) -> Vec<Effect> {
        match signal {
            WatchSignal::Changed(paths) => {
                if !self.watching {
                    return Vec::new();
                }
                if self.phase != Phase::Idle {
                    debug!(changed = paths.len(), "change ignored while busy");
                    return Vec::new();
                }
                let scoped = self
                    .current_row()
                    .map(|row| row.package)
                    .filter(|package| self.owns_all(package, &paths));
                let request = match scoped {
                    Some(package) => RunRequest::new([package], self.flags.clone()),
                    None => self.all_request(),
                };
                self.start_run(request, now)
            }
            WatchSignal::Stopped(reason) => {
                self.watching = false;
                self.log_line(format!("! watch stopped: {reason}"));
                self.toast("Watch stopped", now);
                Vec::new()
            }
        }
    }

    /// Whether every path is a file of `package`'s directory.
    fn owns_all(&self, package: &str, paths: &[PathBuf]) -> bool {
        let Some(dir) = self.package_dirs.get(package) else {
            return false;
        };
        !paths.is_empty() && paths.iter().all(|path| path.parent() == Some(dir.as_path()))
    }

    fn open_editor(&mut self, now: Instant) -> Vec<Effect> {
        let Some(row) = self.current_row() else {
            return Vec::new();
        };
        let location = self.forest.find(&row.package, &row.path).and_then(|node| {
            std::iter::once(node)
                .chain(node.descendants())
                .flat_map(|n| n.output.iter())
                .find_map(|line| find_location(line))
        });
        match location {
            Some(location) => {
                let package_dir = self.package_dirs.get(&row.package).map(PathBuf::as_path);
                let file = location.resolve(package_dir, &self.work_dir);
                vec![Effect::OpenEditor {
                    file,
                    line: location.line,
                }]
            }
            None => {
                self.toast("No file reference in output", now);
                Vec::new()
            }
        }
    }
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}

/// Request for the selected rows. Package rows run whole packages; when only
/// tests are selected the run is narrowed to their top-level names.
pub fn selection_request(targets: &[(String, String)], flags: RunFlags) -> RunRequest {
    let request = RunRequest::new(targets.iter().map(|(package, _)| package.clone()), flags);
    if targets.iter().any(|(_, path)| path.is_empty()) {
        return request;
    }
    let names: BTreeSet<&str> = targets
        .iter()
        .filter_map(|(_, path)| path.split('/').next())
        .collect();
    request.with_regex(build_run_regex(names))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_model::TestStatus;
    use crossterm::event::{KeyCode, KeyModifiers};

    fn package(name: &str, tests: &[&str]) -> Package {
        Package {
            import_path: format!("example.com/m/{name}"),
            dir: PathBuf::from(format!("/m/{name}")),
            name: name.to_string(),
            tests: tests.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn ready_app() -> App {
        let mut app = App::new(
            Path::new("/m"),
            RunFlags::default(),
            FailureStore::new(None),
            false,
        );
        app.start();
        app.update(
            Message::Discovered(Ok(vec![
                package("a", &["TestA", "TestA2"]),
                package("b", &["TestB"]),
            ])),
            Instant::now(),
        );
        app
    }

    fn press(app: &mut App, code: KeyCode) -> Vec<Effect> {
        app.update(Message::Key(KeyEvent::new(code, KeyModifiers::NONE)), Instant::now())
    }

    fn event(action: Action, package: &str, test: &str) -> TestEvent {
        TestEvent {
            time: None,
            action,
            package: package.to_string(),
            import_path: None,
            test: test.to_string(),
            elapsed: None,
            output: None,
        }
    }

    fn started_run(effects: &[Effect]) -> (Uuid, RunRequest) {
        match effects {
            [Effect::StartRun { run_id, request }] => (*run_id, request.clone()),
            other => panic!("expected one run, got {other:?}"),
        }
    }

    #[test]
    fn test_start_discovers_and_watches() {
        let mut app = App::new(Path::new("/m"), RunFlags::default(), FailureStore::new(None), true);
        assert_eq!(app.start(), vec![Effect::Discover, Effect::StartWatch]);
        assert!(app.watching);
        assert_eq!(app.phase, Phase::Discovering);
    }

    #[test]
    fn test_discovery_seeds_rows() {
        let app = ready_app();
        let rows = app.rows();
        assert_eq!(rows.len(), 5);
        assert!(rows[0].is_package());
        assert_eq!(rows[1].name, "TestA");
        assert_eq!(app.phase, Phase::Idle);
    }

    #[test]
    fn test_watch_change_under_selected_package_runs_it_once() {
        let mut app = ready_app();
        app.watching = true;

        let effects = app.update(
            Message::Watch(WatchSignal::Changed(vec![PathBuf::from("/m/a/a.go")])),
            Instant::now(),
        );
        let (_, request) = started_run(&effects);
        assert_eq!(request.packages, BTreeSet::from(["example.com/m/a".to_string()]));
        assert!(request.run_regex.is_none());

        let effects = app.update(
            Message::Watch(WatchSignal::Changed(vec![PathBuf::from("/m/a/a.go")])),
            Instant::now(),
        );
        assert!(effects.is_empty());
    }

    #[test]
    fn test_watch_change_elsewhere_runs_everything() {
        let mut app = ready_app();
        app.watching = true;

        let effects = app.update(
            Message::Watch(WatchSignal::Changed(vec![PathBuf::from("/m/b/b.go")])),
            Instant::now(),
        );
        let (_, request) = started_run(&effects);
        assert_eq!(request.packages.len(), 2);
    }

    #[test]
    fn test_watch_change_ignored_when_not_watching() {
        let mut app = ready_app();
        let effects = app.update(
            Message::Watch(WatchSignal::Changed(vec![PathBuf::from("/m/a/a.go")])),
            Instant::now(),
        );
        assert!(effects.is_empty());
    }

    #[test]
    fn test_overlapping_run_is_rejected() {
        let mut app = ready_app();
        started_run(&press(&mut app, KeyCode::Char('a')));
        assert!(press(&mut app, KeyCode::Char('a')).is_empty());
        assert!(press(&mut app, KeyCode::Enter).is_empty());
        assert!(app.toasts.iter().any(|t| t.text.contains("already")));
    }

    #[test]
    fn test_selection_of_tests_builds_regex() {
        let targets = vec![
            ("example.com/m/a".to_string(), "TestA/sub".to_string()),
            ("example.com/m/b".to_string(), "TestB".to_string()),
        ];
        let request = selection_request(&targets, RunFlags::default());
        assert_eq!(request.run_regex.as_deref(), Some("^(TestA|TestB)$"));
        assert_eq!(request.packages.len(), 2);

        let with_package = vec![
            ("example.com/m/a".to_string(), String::new()),
            ("example.com/m/b".to_string(), "TestB".to_string()),
        ];
        assert!(selection_request(&with_package, RunFlags::default()).run_regex.is_none());
    }

    #[test]
    fn test_enter_runs_row_under_cursor() {
        let mut app = ready_app();
        press(&mut app, KeyCode::Down);
        let (_, request) = started_run(&press(&mut app, KeyCode::Enter));
        assert_eq!(request.run_regex.as_deref(), Some("^(TestA)$"));
        assert_eq!(request.single_package(), Some("example.com/m/a"));
    }

    #[test]
    fn test_events_drive_tree_counters_and_log() {
        let mut app = ready_app();
        let (run_id, _) = started_run(&press(&mut app, KeyCode::Char('a')));

        app.update(Message::Test(event(Action::Run, "example.com/m/a", "TestA")), Instant::now());
        let mut output = event(Action::Output, "example.com/m/a", "TestA");
        output.output = Some("    a_test.go:9: boom\n".to_string());
        app.update(Message::Test(output), Instant::now());
        let mut fail = event(Action::Fail, "example.com/m/a", "TestA");
        fail.elapsed = Some(0.02);
        app.update(Message::Test(fail), Instant::now());
        app.update(Message::Test(event(Action::Fail, "example.com/m/a", "")), Instant::now());

        let node = app.forest.find("example.com/m/a", "TestA").unwrap();
        assert_eq!(node.status, TestStatus::Failed);
        assert_eq!(app.counters.failed, 1);
        assert_eq!(app.progress.finished, 1);
        assert!(app.log.iter().any(|l| l == "=== example.com/m/a · TestA"));
        assert!(app.log.iter().any(|l| l == "    a_test.go:9: boom"));

        app.update(
            Message::RunFinished {
                run_id,
                summary: app.counters,
                cancelled: false,
            },
            Instant::now(),
        );
        assert_eq!(app.phase, Phase::Idle);
        assert!(app.last_duration.is_some());

        let (_, retry) = started_run(&press(&mut app, KeyCode::Char('R')));
        assert_eq!(retry.run_regex.as_deref(), Some("^(TestA)$"));
    }

    #[test]
    fn test_unknown_run_finish_is_ignored() {
        let mut app = ready_app();
        started_run(&press(&mut app, KeyCode::Char('a')));
        app.update(
            Message::RunFinished {
                run_id: Uuid::new_v4(),
                summary: RunSummary::default(),
                cancelled: false,
            },
            Instant::now(),
        );
        assert!(app.is_running());
    }

    #[test]
    fn test_new_run_resets_targeted_packages() {
        let mut app = ready_app();
        let (run_id, _) = started_run(&press(&mut app, KeyCode::Char('a')));
        app.update(Message::Test(event(Action::Pass, "example.com/m/b", "TestB")), Instant::now());
        app.update(
            Message::RunFinished {
                run_id,
                summary: app.counters,
                cancelled: false,
            },
            Instant::now(),
        );

        started_run(&press(&mut app, KeyCode::Char('.')));
        let node = app.forest.find("example.com/m/b", "TestB").unwrap();
        assert_eq!(node.status, TestStatus::Pending);
        assert_eq!(app.counters, RunSummary::default());
    }

    #[test]
    fn test_run_failed_without_failures() {
        let mut app = ready_app();
        assert!(press(&mut app, KeyCode::Char('R')).is_empty());
        assert_eq!(app.toasts.back().unwrap().text, "No failed tests");
    }

    #[test]
    fn test_escape_cancels_running_batch() {
        let mut app = ready_app();
        started_run(&press(&mut app, KeyCode::Char('a')));
        assert_eq!(press(&mut app, KeyCode::Esc), vec![Effect::CancelRun]);
    }

    #[test]
    fn test_filter_and_fail_only() {
        let mut app = ready_app();
        press(&mut app, KeyCode::Char('/'));
        press(&mut app, KeyCode::Char('b'));
        assert!(app.filter_input);
        press(&mut app, KeyCode::Enter);
        assert_eq!(app.filter.text, "b");
        let rows = app.rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].package, "example.com/m/b");

        press(&mut app, KeyCode::Backspace);
        press(&mut app, KeyCode::Char('f'));
        assert!(app.filter.failed_only);
        assert!(app.rows().is_empty());
        assert_eq!(app.cursor, 0);
    }

    #[test]
    fn test_toggles_change_flags_for_next_run() {
        let mut app = ready_app();
        press(&mut app, KeyCode::Char('x'));
        press(&mut app, KeyCode::Char('s'));
        let (_, request) = started_run(&press(&mut app, KeyCode::Char('a')));
        assert!(request.flags.race);
        assert!(request.flags.short);
        assert!(!request.flags.cover);
    }

    #[test]
    fn test_toasts_expire_on_tick() {
        let mut app = ready_app();
        let now = Instant::now();
        app.toast("hello", now);
        app.update(Message::Tick, now + Duration::from_millis(1000));
        assert_eq!(app.toasts.len(), 1);
        app.update(Message::Tick, now + Duration::from_millis(1600));
        assert!(app.toasts.is_empty());
    }

    #[test]
    fn test_log_is_bounded() {
        let mut app = ready_app();
        started_run(&press(&mut app, KeyCode::Char('a')));
        for i in 0..(LOG_CAPACITY + 50) {
            let mut line = event(Action::Output, "example.com/m/a", "TestA");
            line.output = Some(format!("line {i}\n"));
            app.update(Message::Test(line), Instant::now());
        }
        assert_eq!(app.log.len(), LOG_CAPACITY);
        assert_eq!(app.log.back().unwrap(), &format!("line {}", LOG_CAPACITY + 49));
    }

    #[test]
    fn test_open_editor_from_output() {
        let mut app = ready_app();
        started_run(&press(&mut app, KeyCode::Char('a')));
        let mut output = event(Action::Output, "example.com/m/a", "TestA");
        output.output = Some("    a_test.go:12: want 3\n".to_string());
        app.update(Message::Test(output), Instant::now());

        // cursor on the package row; the reference is found in a child
        let effects = press(&mut app, KeyCode::Char('o'));
        assert_eq!(
            effects,
            vec![Effect::OpenEditor {
                file: PathBuf::from("/m/a_test.go"),
                line: 12
            }]
        );
    }

    #[test]
    fn test_discovery_failure_quits_with_error() {
        let mut app = App::new(
            Path::new("/m"),
            RunFlags::default(),
            FailureStore::new(None),
            false,
        );
        app.start();
        app.update(Message::Discovered(Err("go: not found".to_string())), Instant::now());
        assert_eq!(app.exit_error(), Some("go: not found"));
        assert!(press(&mut app, KeyCode::Char('a')).contains(&Effect::Quit));
        assert!(app.should_quit());
    }

    #[test]
    fn test_watch_stopped_clears_flag() {
        let mut app = ready_app();
        assert_eq!(press(&mut app, KeyCode::Char('w')), vec![Effect::StartWatch]);
        app.update(Message::from(WatchSignal::Stopped("gone".to_string())), Instant::now());
        assert!(!app.watching);
    }
}
