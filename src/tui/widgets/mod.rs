//! Custom TUI widgets

mod log_viewer;

pub use log_viewer::*;
