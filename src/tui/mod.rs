//! Terminal User Interface module
//!
//! Provides:
//! - Live test tree fed by the event bus
//! - Package runs scheduled in the background
//! - Watch mode and editor jumps
//!
//! The [`App`] state machine runs on this task only. Everything else (key
//! input, bus handlers, runs, discovery, the file watcher) talks to it by
//! sending [`Message`]s into one inbox.

mod app;
mod events;
mod ui;
mod widgets;

pub use app::*;
pub use events::*;
pub use ui::*;
pub use widgets::*;

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossterm::{
    event::{Event, EventStream, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use futures::StreamExt;
use ratatui::prelude::*;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{BusEvent, EventBus, Topic, DEFAULT_CAPACITY};
use crate::config::Settings;
use crate::discovery;
use crate::event::Action;
use crate::failures::FailureStore;
use crate::scheduler::Scheduler;
use crate::test_runner::{RunRequest, TestRunner};
use crate::watcher::{FileWatcher, WatchHandle, WatchSignal};

const TICK_RATE: Duration = Duration::from_millis(250);
/// Messages handled before the screen is redrawn.
const MAX_BATCH: usize = 256;
const RUN_EVENT_BUFFER: usize = 256;

type Term = Terminal<CrosstermBackend<io::Stdout>>;

/// Run the dashboard until the user quits.
pub async fn run_tui(settings: Settings) -> Result<()> {
    let mut terminal = setup_terminal()?;
    let result = run_app(&mut terminal, settings).await;
    restore_terminal(&mut terminal)?;
    result
}

fn setup_terminal() -> Result<Term> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    Ok(Terminal::new(backend)?)
}

fn restore_terminal(terminal: &mut Term) -> Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

struct ActiveRun {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Carries out effects and owns every background task.
struct Runtime {
    settings: Settings,
    inbox: mpsc::UnboundedSender<Message>,
    bus: EventBus,
    runner: Arc<TestRunner>,
    scheduler: Arc<Scheduler>,
    root: CancellationToken,
    run: Option<ActiveRun>,
    watch: Option<WatchHandle>,
}

impl Runtime {
    fn new(settings: Settings, inbox: mpsc::UnboundedSender<Message>) -> Self {
        let bus = EventBus::new(DEFAULT_CAPACITY);
        subscribe_inbox(&bus, &inbox);

        let runner = Arc::new(TestRunner::new(settings.tool.clone(), &settings.work_dir));
        let scheduler = Arc::new(Scheduler::new(settings.max_workers));
        Self {
            settings,
            inbox,
            bus,
            runner,
            scheduler,
            root: CancellationToken::new(),
            run: None,
            watch: None,
        }
    }

    async fn execute(
        &mut self,
        effect: Effect,
        terminal: &mut Term,
        keys: &mut Option<EventStream>,
    ) -> Result<()> {
        match effect {
            Effect::Discover => self.discover(),
            Effect::StartRun { run_id, request } => self.start_run(run_id, request),
            Effect::CancelRun => {
                if let Some(run) = &self.run {
                    info!("cancelling run");
                    run.cancel.cancel();
                }
            }
            Effect::StartWatch => self.start_watch(),
            Effect::StopWatch => {
                if let Some(handle) = self.watch.take() {
                    handle.stop().await;
                    info!("file watcher stopped");
                }
            }
            Effect::OpenEditor { file, line } => {
                // Dropping the key stream keeps it from stealing the editor's input.
                keys.take();
                restore_terminal(terminal)?;
                let mut command =
                    tokio::process::Command::from(self.settings.editor.command(&file, line));
                let result = match command.status().await {
                    Ok(status) if status.success() => Ok(()),
                    Ok(status) => Err(format!("editor exited with {status}")),
                    Err(err) => Err(err.to_string()),
                };
                enable_raw_mode()?;
                execute!(terminal.backend_mut(), EnterAlternateScreen)?;
                terminal.clear()?;
                *keys = Some(EventStream::new());
                let _ = self.inbox.send(Message::EditorClosed(result));
            }
            Effect::Quit => self.root.cancel(),
        }
        Ok(())
    }

    fn discover(&self) {
        let tool = self.settings.tool.clone();
        let dir = self.settings.work_dir.clone();
        let patterns = self.settings.packages.clone();
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let result = discovery::discover(&tool, &dir, &patterns)
                .await
                .map_err(|err| err.to_string());
            let _ = inbox.send(Message::Discovered(result));
        });
    }

    fn start_watch(&mut self) {
        if self.watch.is_some() {
            return;
        }
        let watcher = FileWatcher::new(&self.settings.work_dir, self.settings.watch.clone());
        match watcher.start(self.inbox.clone(), self.root.clone()) {
            Ok(handle) => self.watch = Some(handle),
            Err(err) => {
                warn!(error = %err, "failed to start file watcher");
                let _ = self
                    .inbox
                    .send(Message::from(WatchSignal::Stopped(err.to_string())));
            }
        }
    }

    /// Spawn the pipeline for one run. Its events reach the app through the
    /// bus, so the finish notice always lands after the last test event.
    fn start_run(&mut self, run_id: Uuid, request: RunRequest) {
        let cancel = self.root.child_token();
        let root = self.root.clone();
        let bus = self.bus.clone();
        let runner = self.runner.clone();
        let scheduler = self.scheduler.clone();
        let run_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            let started = BusEvent::RunStarted {
                run_id,
                request: request.clone(),
            };
            if let Err(err) = bus.publish(started, &cancel).await {
                debug!(error = %err, "run start not published");
            }

            let (sink, events) = mpsc::channel(RUN_EVENT_BUFFER);
            let forward = tokio::spawn(forward_events(bus.clone(), events, cancel.clone()));
            let report = scheduler.run_packages(runner, &request, sink, cancel).await;
            if let Err(err) = forward.await {
                error!(error = %err, "event forwarder panicked");
            }

            for package in &report.errored {
                let message = format!("{package}: test run failed");
                if let Err(err) = bus.publish(BusEvent::Error { message }, &root).await {
                    debug!(error = %err, "error not published");
                }
            }
            let finished = BusEvent::RunFinished {
                run_id,
                summary: report.summary,
                cancelled: report.cancelled,
            };
            if let Err(err) = bus.publish(finished, &root).await {
                debug!(error = %err, "run finish not published");
            }
        });

        if let Some(previous) = self.run.replace(ActiveRun {
            cancel: run_cancel,
            task,
        }) {
            if !previous.task.is_finished() {
                warn!("previous run still active");
            }
        }
    }

    async fn shutdown(mut self) {
        self.root.cancel();
        if let Some(run) = self.run.take() {
            let grace = crate::scheduler::CANCEL_GRACE + Duration::from_secs(1);
            if tokio::time::timeout(grace, run.task).await.is_err() {
                warn!("run did not stop in time");
            }
        }
        if let Some(handle) = self.watch.take() {
            handle.stop().await;
        }
        self.bus.shutdown().await;
        info!("session closed");
    }
}

/// Route bus traffic into the app inbox.
fn subscribe_inbox(bus: &EventBus, inbox: &mpsc::UnboundedSender<Message>) {
    let tx = inbox.clone();
    bus.subscribe(Topic::TestEvent, move |event| {
        if let BusEvent::TestEvent(event) = event {
            let _ = tx.send(Message::Test(event.clone()));
        }
    });

    let tx = inbox.clone();
    bus.subscribe(Topic::RunFinished, move |event| {
        if let BusEvent::RunFinished {
            run_id,
            summary,
            cancelled,
        } = event
        {
            let _ = tx.send(Message::RunFinished {
                run_id: *run_id,
                summary: *summary,
                cancelled: *cancelled,
            });
        }
    });

    let tx = inbox.clone();
    bus.subscribe(Topic::Error, move |event| {
        if let BusEvent::Error { message } = event {
            let _ = tx.send(Message::Error(message.clone()));
        }
    });

    bus.subscribe(Topic::RunStarted, |event| {
        if let BusEvent::RunStarted { run_id, request } = event {
            info!(%run_id, target = %request.describe(), "run started");
        }
    });
    bus.subscribe(Topic::TestFailed, |event| {
        if let BusEvent::TestFailed { package, test } = event {
            info!(package = %package, test = %test, "test failed");
        }
    });
}

/// Publish each decoded event, plus a failure notice for failing tests.
async fn forward_events(
    bus: EventBus,
    mut events: mpsc::Receiver<crate::event::TestEvent>,
    cancel: CancellationToken,
) {
    while let Some(event) = events.recv().await {
        let failed = (event.action == Action::Fail && event.is_test_event())
            .then(|| BusEvent::TestFailed {
                package: event.package.clone(),
                test: event.test.clone(),
            });
        if bus.publish(BusEvent::TestEvent(event), &cancel).await.is_err() {
            break;
        }
        if let Some(failed) = failed {
            if bus.publish(failed, &cancel).await.is_err() {
                break;
            }
        }
    }
}

async fn next_key(keys: &mut Option<EventStream>) -> Option<io::Result<Event>> {
    match keys {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn run_app(terminal: &mut Term, settings: Settings) -> Result<()> {
    let (inbox, mut messages) = mpsc::unbounded_channel();
    let failures = FailureStore::at_default_location();
    let mut app = App::new(
        &settings.work_dir,
        settings.flags.clone(),
        failures,
        settings.watch_on_start,
    );
    let mut runtime = Runtime::new(settings, inbox);
    let mut keys = Some(EventStream::new());
    let mut ticker = tokio::time::interval(TICK_RATE);

    let mut pending = app.start();
    let outcome = async {
        loop {
            for effect in pending.drain(..) {
                runtime.execute(effect, terminal, &mut keys).await?;
            }
            if app.should_quit() {
                break;
            }
            terminal.draw(|f| ui::draw(f, &app, Instant::now()))?;

            let message = tokio::select! {
                Some(message) = messages.recv() => message,
                Some(event) = next_key(&mut keys) => {
                    match event.context("Failed to read terminal input")? {
                        Event::Key(key) if key.kind != KeyEventKind::Release => Message::Key(key),
                        _ => continue,
                    }
                }
                _ = ticker.tick() => Message::Tick,
            };

            pending = app.update(message, Instant::now());
            let mut handled = 1;
            while handled < MAX_BATCH && pending.is_empty() {
                match messages.try_recv() {
                    Ok(message) => pending = app.update(message, Instant::now()),
                    Err(_) => break,
                }
                handled += 1;
            }
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    runtime.shutdown().await;
    outcome?;
    match app.exit_error() {
        Some(message) => anyhow::bail!("test discovery failed: {message}"),
        None => Ok(()),
    }
}
