//! Test event protocol
//!
//! One JSON object per line, as emitted by `go test -json`:
//!
//! ```text
//! {"Time":"2024-05-01T10:00:00Z","Action":"run","Package":"example.com/m/pkg","Test":"TestX"}
//! {"Time":"2024-05-01T10:00:00Z","Action":"output","Package":"example.com/m/pkg","Test":"TestX","Output":"hello\n"}
//! {"Time":"2024-05-01T10:00:00Z","Action":"pass","Package":"example.com/m/pkg","Test":"TestX","Elapsed":0.01}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle tag of a [`TestEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Test started running
    Run,
    /// Test paused (waiting on `t.Parallel`)
    Pause,
    /// Test continued
    Cont,
    Pass,
    Fail,
    Skip,
    /// Benchmark printed output
    Bench,
    /// Test or package printed output
    Output,
    /// Test binary started
    Start,
    /// Compiler output for a package whose build is in progress
    #[serde(rename = "build-output")]
    BuildOutput,
    #[serde(rename = "build-fail")]
    BuildFail,
    /// Any action this decoder does not know, such as `attr`.
    #[serde(other)]
    Other,
}

impl Action {
    /// Whether this action ends a test or package.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Action::Pass | Action::Fail | Action::Skip)
    }
}

/// One decoded line of the event protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestEvent {
    #[serde(rename = "Time", default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(rename = "Action")]
    pub action: Action,
    #[serde(rename = "Package", default)]
    pub package: String,
    /// Set on build events instead of `Package`.
    #[serde(rename = "ImportPath", default, skip_serializing_if = "Option::is_none")]
    pub import_path: Option<String>,
    /// Slash-delimited for subtests, empty for package-level events.
    #[serde(rename = "Test", default, skip_serializing_if = "String::is_empty")]
    pub test: String,
    /// Seconds; only present on terminal actions.
    #[serde(rename = "Elapsed", default, skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<f64>,
    #[serde(rename = "Output", default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl TestEvent {
    /// Build a synthetic `output` event carrying a raw line.
    pub fn raw_output(package: Option<&str>, line: impl Into<String>) -> Self {
        Self {
            time: None,
            action: Action::Output,
            package: package.unwrap_or_default().to_string(),
            import_path: None,
            test: String::new(),
            elapsed: None,
            output: Some(line.into()),
        }
    }

    /// Fill an empty package from the build import path.
    ///
    /// Test variants carry a suffix (`example.com/m/calc [example.com/m/calc.test]`)
    /// that is dropped.
    pub fn normalized(mut self) -> Self {
        if self.package.is_empty() {
            if let Some(path) = self.import_path.as_deref() {
                let package = path.split(" [").next().unwrap_or(path).trim();
                self.package = package.to_string();
            }
        }
        self
    }

    /// Whether the event addresses a test rather than the package itself.
    pub fn is_test_event(&self) -> bool {
        !self.test.is_empty()
    }

    /// Slash-separated path segments of the test name.
    pub fn test_path(&self) -> impl Iterator<Item = &str> {
        self.test.split('/').filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_full_event() {
        let line = r#"{"Time":"2024-05-01T10:00:00.5+02:00","Action":"pass","Package":"example.com/m/calc","Test":"TestAdd/neg","Elapsed":0.25}"#;
        let event: TestEvent = serde_json::from_str(line).unwrap();

        assert_eq!(event.action, Action::Pass);
        assert_eq!(event.package, "example.com/m/calc");
        assert_eq!(event.test, "TestAdd/neg");
        assert_eq!(event.elapsed, Some(0.25));
        assert!(event.time.is_some());
        assert_eq!(event.test_path().collect::<Vec<_>>(), vec!["TestAdd", "neg"]);
    }

    #[test]
    fn test_decode_package_output() {
        let line = r#"{"Action":"output","Package":"example.com/m","Output":"ok  \texample.com/m\t0.01s\n"}"#;
        let event: TestEvent = serde_json::from_str(line).unwrap();

        assert_eq!(event.action, Action::Output);
        assert!(!event.is_test_event());
        assert!(event.output.unwrap().starts_with("ok"));
    }

    #[test]
    fn test_unknown_action_still_decodes() {
        let line = r#"{"Action":"attr","Package":"p","Test":"TestA","Key":"k","Value":"v"}"#;
        let event: TestEvent = serde_json::from_str(line).unwrap();

        assert_eq!(event.action, Action::Other);
        assert_eq!(event.package, "p");
        assert_eq!(event.test, "TestA");
    }

    #[test]
    fn test_build_output_takes_package_from_import_path() {
        let line = r#"{"ImportPath":"example.com/m/calc [example.com/m/calc.test]","Action":"build-output","Output":"calc_test.go:9:2: undefined: Foo\n"}"#;
        let event = serde_json::from_str::<TestEvent>(line).unwrap().normalized();

        assert_eq!(event.action, Action::BuildOutput);
        assert_eq!(event.package, "example.com/m/calc");
        assert_eq!(event.output.as_deref(), Some("calc_test.go:9:2: undefined: Foo\n"));

        let line = r#"{"ImportPath":"example.com/m/calc","Action":"build-fail"}"#;
        let event = serde_json::from_str::<TestEvent>(line).unwrap().normalized();
        assert_eq!(event.action, Action::BuildFail);
        assert_eq!(event.package, "example.com/m/calc");
    }

    #[test]
    fn test_terminal_actions() {
        assert!(Action::Pass.is_terminal());
        assert!(Action::Fail.is_terminal());
        assert!(Action::Skip.is_terminal());
        assert!(!Action::Run.is_terminal());
        assert!(!Action::Output.is_terminal());
    }
}
