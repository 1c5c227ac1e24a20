//! testpulse - Go test dashboard
//!
//! A library for running Go tests and following them live:
//! - Package discovery via `go list -json` and `go test -list`
//! - Streaming decoder for `go test -json` output
//! - Bounded parallel package runs with cancellation
//! - Topic-based event bus feeding the result tree
//! - Last-failed retry and debounced watch mode
//! - Terminal UI with tree, output and log panes

pub mod bus;
pub mod config;
pub mod decoder;
pub mod discovery;
pub mod editor;
pub mod error;
pub mod event;
pub mod failures;
pub mod logging;
pub mod scheduler;
pub mod test_model;
pub mod test_runner;
pub mod tui;
pub mod watcher;

pub use bus::{BusEvent, EventBus, Topic};
pub use decoder::Decoder;
pub use discovery::{discover, Package};
pub use event::{Action, TestEvent};
pub use failures::{FailureSet, FailureStore};
pub use scheduler::{BatchReport, Scheduler};
pub use test_model::{ResultForest, ResultNode, RunSummary, TestStatus};
pub use test_runner::{RunFlags, RunRequest, TestRunner, Tool};
pub use watcher::{FileWatcher, WatchSignal};
