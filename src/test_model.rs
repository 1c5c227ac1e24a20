//! Test model definitions
//!
//! The result forest: one tree per package, built incrementally from decoded
//! events. Nodes own their children; a node refers to its parent only by
//! path, so the tree has no cycles.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use crate::event::{Action, TestEvent};

/// Output lines kept per node.
pub const MAX_OUTPUT_LINES: usize = 1000;

/// Status of a test or package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TestStatus {
    /// Not run yet in the current run
    #[default]
    Pending,
    Running,
    Passed,
    Failed,
    Skipped,
}

impl TestStatus {
    pub fn symbol(&self) -> &'static str {
        match self {
            TestStatus::Pending => "○",
            TestStatus::Running => "●",
            TestStatus::Passed => "✓",
            TestStatus::Failed => "✗",
            TestStatus::Skipped => "⊘",
        }
    }

    pub fn color(&self) -> ratatui::style::Color {
        use ratatui::style::Color;
        match self {
            TestStatus::Pending => Color::Gray,
            TestStatus::Running => Color::Yellow,
            TestStatus::Passed => Color::Green,
            TestStatus::Failed => Color::Red,
            TestStatus::Skipped => Color::DarkGray,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TestStatus::Passed | TestStatus::Failed | TestStatus::Skipped
        )
    }

    fn rank(&self) -> u8 {
        match self {
            TestStatus::Pending => 0,
            TestStatus::Running => 1,
            _ => 2,
        }
    }

    /// Status changes only move forward within one run.
    pub fn can_become(&self, next: TestStatus) -> bool {
        next.rank() > self.rank()
    }

    fn terminal_for(action: Action) -> Option<TestStatus> {
        match action {
            Action::Pass => Some(TestStatus::Passed),
            Action::Fail => Some(TestStatus::Failed),
            Action::Skip => Some(TestStatus::Skipped),
            _ => None,
        }
    }
}

/// A package root, a top-level test, or a subtest.
#[derive(Debug, Clone)]
pub struct ResultNode {
    pub name: String,
    /// Slash-joined path below the package; empty for the package root.
    pub full_path: String,
    /// Path of the parent node. Empty string is the package root;
    /// `None` only on the root itself.
    pub parent: Option<String>,
    pub status: TestStatus,
    pub duration: Option<Duration>,
    pub output: VecDeque<String>,
    pub children: BTreeMap<String, ResultNode>,
}

impl ResultNode {
    pub fn root(package: &str) -> Self {
        Self::new(package, String::new(), None)
    }

    fn new(name: &str, full_path: String, parent: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            full_path,
            parent,
            status: TestStatus::Pending,
            duration: None,
            output: VecDeque::new(),
            children: BTreeMap::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Walk down `segments`, creating any node that does not exist yet.
    pub fn walk<'a, I>(&mut self, segments: I) -> &mut ResultNode
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut node = self;
        for segment in segments {
            let path = if node.full_path.is_empty() {
                segment.to_string()
            } else {
                format!("{}/{}", node.full_path, segment)
            };
            let parent = node.full_path.clone();
            node = node
                .children
                .entry(segment.to_string())
                .or_insert_with(|| ResultNode::new(segment, path, Some(parent)));
        }
        node
    }

    /// Look up a descendant by slash-separated path.
    pub fn find(&self, path: &str) -> Option<&ResultNode> {
        let mut node = self;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            node = node.children.get(segment)?;
        }
        Some(node)
    }

    /// Move to `next` if that is a forward transition.
    pub fn advance(&mut self, next: TestStatus) -> bool {
        if self.status.can_become(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    /// Add output line, dropping one trailing newline.
    pub fn push_output(&mut self, line: &str) {
        let line = line.strip_suffix('\n').unwrap_or(line);
        self.output.push_back(line.to_string());
        while self.output.len() > MAX_OUTPUT_LINES {
            self.output.pop_front();
        }
    }

    /// Reset this node and its subtree to pending state.
    pub fn reset(&mut self) {
        self.status = TestStatus::Pending;
        self.duration = None;
        self.output.clear();
        for child in self.children.values_mut() {
            child.reset();
        }
    }

    /// Visit every node below this one, depth first in name order.
    pub fn descendants(&self) -> Vec<&ResultNode> {
        let mut out = Vec::new();
        self.collect_descendants(&mut out);
        out
    }

    fn collect_descendants<'a>(&'a self, out: &mut Vec<&'a ResultNode>) {
        for child in self.children.values() {
            out.push(child);
            child.collect_descendants(out);
        }
    }

    pub fn has_failure(&self) -> bool {
        self.status == TestStatus::Failed || self.children.values().any(|c| c.has_failure())
    }
}

/// Elapsed seconds to a duration; only positive values count.
pub fn elapsed_duration(elapsed: Option<f64>) -> Option<Duration> {
    elapsed
        .filter(|e| e.is_finite() && *e > 0.0)
        .map(|e| Duration::from_micros((e * 1_000_000.0).round() as u64))
}

/// One row of the flattened view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub package: String,
    /// Empty for the package row.
    pub path: String,
    pub name: String,
    pub depth: usize,
    pub status: TestStatus,
    pub duration: Option<Duration>,
}

impl Row {
    pub fn is_package(&self) -> bool {
        self.path.is_empty()
    }

    /// First segment of the test path.
    pub fn top_level_test(&self) -> Option<&str> {
        self.path.split('/').next().filter(|s| !s.is_empty())
    }
}

/// Filter applied when flattening.
#[derive(Debug, Clone, Default)]
pub struct RowFilter {
    /// Case-insensitive substring over package and test path.
    pub text: String,
    pub failed_only: bool,
}

impl RowFilter {
    fn text_matches(&self, haystack: &str) -> bool {
        self.text.is_empty() || haystack.to_lowercase().contains(&self.text.to_lowercase())
    }
}

/// Result trees for every package, keyed by import path.
#[derive(Debug, Clone, Default)]
pub struct ResultForest {
    packages: BTreeMap<String, ResultNode>,
}

impl ResultForest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn packages(&self) -> impl Iterator<Item = &ResultNode> {
        self.packages.values()
    }

    pub fn package(&self, package: &str) -> Option<&ResultNode> {
        self.packages.get(package)
    }

    /// Find a node by package and test path.
    pub fn find(&self, package: &str, path: &str) -> Option<&ResultNode> {
        self.packages.get(package)?.find(path)
    }

    pub fn parent_of(&self, package: &str, node: &ResultNode) -> Option<&ResultNode> {
        let parent = node.parent.as_deref()?;
        self.find(package, parent)
    }

    /// Add pending nodes for discovered tests.
    pub fn seed(&mut self, package: &str, tests: &[String]) {
        let root = self
            .packages
            .entry(package.to_string())
            .or_insert_with(|| ResultNode::root(package));
        for test in tests {
            root.walk(test.split('/').filter(|s| !s.is_empty()));
        }
    }

    /// Reset the given packages to pending; an empty set resets all of them.
    pub fn reset_packages(&mut self, packages: &BTreeSet<String>) {
        for (name, root) in self.packages.iter_mut() {
            if packages.is_empty() || packages.contains(name) {
                root.reset();
            }
        }
    }

    /// Fold one event into the forest.
    pub fn apply(&mut self, event: &TestEvent) {
        if event.package.is_empty() || matches!(event.action, Action::BuildFail | Action::Other) {
            return;
        }

        let root = self
            .packages
            .entry(event.package.clone())
            .or_insert_with(|| ResultNode::root(&event.package));
        let node = if event.is_test_event() {
            root.walk(event.test_path())
        } else {
            root
        };

        match event.action {
            Action::Run | Action::Start | Action::Cont => {
                node.advance(TestStatus::Running);
            }
            Action::Pass | Action::Fail | Action::Skip => {
                let next = TestStatus::terminal_for(event.action).unwrap_or_default();
                if node.advance(next) {
                    if let Some(duration) = elapsed_duration(event.elapsed) {
                        node.duration = Some(duration);
                    }
                }
            }
            Action::Output | Action::Bench | Action::BuildOutput => {
                if let Some(ref output) = event.output {
                    node.push_output(output);
                }
            }
            Action::Pause | Action::BuildFail | Action::Other => {}
        }
    }

    /// Flatten into display rows: each package, then its tests depth first.
    pub fn rows(&self, filter: &RowFilter) -> Vec<Row> {
        let mut rows = Vec::new();
        for (package, root) in &self.packages {
            let package_matches = filter.text_matches(package);
            collect_rows(package, root, 0, package_matches, filter, &mut rows);
        }
        rows
    }
}

fn collect_rows(
    package: &str,
    node: &ResultNode,
    depth: usize,
    text_matched: bool,
    filter: &RowFilter,
    out: &mut Vec<Row>,
) -> bool {
    let text_ok = text_matched || filter.text_matches(&node.full_path);
    let mut below = Vec::new();
    let mut any_child = false;
    for child in node.children.values() {
        any_child |= collect_rows(package, child, depth + 1, text_ok, filter, &mut below);
    }

    let self_ok = if node.is_root() {
        text_ok && (!filter.failed_only || node.has_failure())
    } else {
        text_ok && (!filter.failed_only || node.status == TestStatus::Failed)
    };

    let keep = self_ok || any_child;
    if keep {
        out.push(Row {
            package: package.to_string(),
            path: node.full_path.clone(),
            name: node.name.clone(),
            depth,
            status: node.status,
            duration: node.duration,
        });
        out.append(&mut below);
    }
    keep
}

/// Aggregate counts for a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration: Duration,
}

impl RunSummary {
    /// Count one event. Test-level terminal actions bump the counters;
    /// a package-level terminal action adds its elapsed time.
    pub fn record(&mut self, event: &TestEvent) {
        let Some(status) = TestStatus::terminal_for(event.action) else {
            return;
        };
        if !event.is_test_event() {
            if let Some(d) = elapsed_duration(event.elapsed) {
                self.duration += d;
            }
            return;
        }
        self.total += 1;
        match status {
            TestStatus::Passed => self.passed += 1,
            TestStatus::Failed => self.failed += 1,
            TestStatus::Skipped => self.skipped += 1,
            _ => {}
        }
    }

    pub fn merge(&mut self, other: &RunSummary) {
        self.total += other.total;
        self.passed += other.passed;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.duration += other.duration;
    }

    /// Recompute from the tree.
    pub fn from_forest(forest: &ResultForest) -> Self {
        let mut summary = Self::default();
        for root in forest.packages() {
            if let Some(d) = root.duration {
                summary.duration += d;
            }
            for node in root.descendants() {
                if !node.status.is_terminal() {
                    continue;
                }
                summary.total += 1;
                match node.status {
                    TestStatus::Passed => summary.passed += 1,
                    TestStatus::Failed => summary.failed += 1,
                    TestStatus::Skipped => summary.skipped += 1,
                    _ => {}
                }
            }
        }
        summary
    }

    pub fn pass_rate(&self) -> f64 {
        let completed = self.passed + self.failed;
        if completed == 0 {
            0.0
        } else {
            (self.passed as f64) / (completed as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(action: Action, package: &str, test: &str) -> TestEvent {
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

    fn output(package: &str, test: &str, text: &str) -> TestEvent {
        TestEvent {
            output: Some(text.to_string()),
            ..ev(Action::Output, package, test)
        }
    }

    fn finished(action: Action, package: &str, test: &str, elapsed: f64) -> TestEvent {
        TestEvent {
            elapsed: Some(elapsed),
            ..ev(action, package, test)
        }
    }

    #[test]
    fn test_single_test_lifecycle() {
        let mut forest = ResultForest::new();
        forest.apply(&ev(Action::Run, "pkgA", "TestX"));
        forest.apply(&output("pkgA", "TestX", "hello\n"));
        forest.apply(&finished(Action::Pass, "pkgA", "TestX", 0.01));

        let node = forest.find("pkgA", "TestX").unwrap();
        assert_eq!(node.status, TestStatus::Passed);
        assert_eq!(node.duration, Some(Duration::from_millis(10)));
        assert_eq!(node.output, VecDeque::from(vec!["hello".to_string()]));
    }

    fn permutations(items: Vec<TestEvent>) -> Vec<Vec<TestEvent>> {
        if items.len() <= 1 {
            return vec![items];
        }
        let mut out = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.clone();
            let head = rest.remove(i);
            for mut tail in permutations(rest) {
                tail.insert(0, head.clone());
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn test_nested_path_any_arrival_order() {
        let events = vec![
            ev(Action::Run, "p", "A"),
            ev(Action::Run, "p", "A/B"),
            ev(Action::Run, "p", "A/B/C"),
            finished(Action::Pass, "p", "A/B/C", 0.1),
            finished(Action::Pass, "p", "A/B", 0.2),
            finished(Action::Pass, "p", "A", 0.3),
        ];

        for order in permutations(events) {
            let mut forest = ResultForest::new();
            for event in &order {
                forest.apply(event);
            }

            let root = forest.package("p").unwrap();
            assert_eq!(root.descendants().len(), 3);

            let c = forest.find("p", "A/B/C").unwrap();
            let b = forest.parent_of("p", c).unwrap();
            let a = forest.parent_of("p", b).unwrap();
            assert_eq!(b.full_path, "A/B");
            assert_eq!(a.full_path, "A");
            assert!(forest.parent_of("p", a).unwrap().is_root());
            assert!([a, b, c].iter().all(|n| n.status == TestStatus::Passed));
        }
    }

    #[test]
    fn test_status_never_moves_backward() {
        let mut forest = ResultForest::new();
        forest.apply(&finished(Action::Fail, "p", "TestA", 0.5));
        forest.apply(&ev(Action::Run, "p", "TestA"));
        forest.apply(&finished(Action::Pass, "p", "TestA", 0.1));

        let node = forest.find("p", "TestA").unwrap();
        assert_eq!(node.status, TestStatus::Failed);
        assert_eq!(node.duration, Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_zero_elapsed_leaves_duration_unset() {
        let mut forest = ResultForest::new();
        forest.apply(&finished(Action::Pass, "p", "TestA", 0.0));
        assert_eq!(forest.find("p", "TestA").unwrap().duration, None);
    }

    #[test]
    fn test_package_output_goes_to_root() {
        let mut forest = ResultForest::new();
        forest.apply(&output("p", "", "ok  \tp\t0.01s\n"));
        forest.apply(&output("", "", "orphan line"));

        let root = forest.package("p").unwrap();
        assert_eq!(root.output.len(), 1);
        assert!(root.children.is_empty());
        assert!(forest.package("").is_none());
    }

    #[test]
    fn test_output_is_bounded() {
        let mut node = ResultNode::root("p");
        for i in 0..(MAX_OUTPUT_LINES + 5) {
            node.push_output(&format!("line {i}\n"));
        }
        assert_eq!(node.output.len(), MAX_OUTPUT_LINES);
        assert_eq!(node.output.front().map(String::as_str), Some("line 5"));
    }

    #[test]
    fn test_seed_and_reset() {
        let mut forest = ResultForest::new();
        forest.seed("a", &["TestOne".to_string(), "TestTwo".to_string()]);
        forest.seed("b", &["TestThree".to_string()]);
        forest.apply(&finished(Action::Fail, "a", "TestOne", 0.1));
        forest.apply(&finished(Action::Pass, "b", "TestThree", 0.1));

        forest.reset_packages(&BTreeSet::from(["a".to_string()]));
        assert_eq!(forest.find("a", "TestOne").unwrap().status, TestStatus::Pending);
        assert_eq!(forest.find("b", "TestThree").unwrap().status, TestStatus::Passed);

        forest.reset_packages(&BTreeSet::new());
        assert_eq!(forest.find("b", "TestThree").unwrap().status, TestStatus::Pending);
        assert_eq!(forest.package("a").unwrap().children.len(), 2);
    }

    #[test]
    fn test_build_output_lands_on_package_root() {
        let mut forest = ResultForest::new();
        forest.seed("a", &["TestOne".to_string()]);
        forest.apply(&output("a", "", "a_test.go:9:2: undefined: Foo\n"));
        forest.apply(&TestEvent {
            action: Action::BuildOutput,
            ..output("a", "", "a_test.go:12:1: missing return\n")
        });
        forest.apply(&ev(Action::BuildFail, "a", ""));
        forest.apply(&ev(Action::Other, "a", "TestOne"));
        forest.apply(&ev(Action::Other, "c", "TestNew"));

        let root = forest.package("a").unwrap();
        assert_eq!(root.output.len(), 2);
        assert_eq!(root.status, TestStatus::Pending);
        assert_eq!(forest.find("a", "TestOne").unwrap().status, TestStatus::Pending);
        assert!(forest.package("c").is_none());
    }

    #[test]
    fn test_rows_with_filters() {
        let mut forest = ResultForest::new();
        forest.seed("example.com/m/alpha", &["TestOne".to_string(), "TestTwo".to_string()]);
        forest.seed("example.com/m/beta", &["TestThree".to_string()]);
        forest.apply(&finished(Action::Fail, "example.com/m/alpha", "TestTwo/case", 0.1));

        let all = forest.rows(&RowFilter::default());
        assert_eq!(all.len(), 6);
        assert!(all[0].is_package());
        assert_eq!(all[3].path, "TestTwo/case");
        assert_eq!(all[3].depth, 2);
        assert_eq!(all[3].top_level_test(), Some("TestTwo"));

        let failed = forest.rows(&RowFilter {
            failed_only: true,
            ..Default::default()
        });
        let paths: Vec<_> = failed.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["", "TestTwo", "TestTwo/case"]);

        let text = forest.rows(&RowFilter {
            text: "THREE".to_string(),
            ..Default::default()
        });
        assert_eq!(text.len(), 2);
        assert_eq!(text[1].name, "TestThree");

        let by_package = forest.rows(&RowFilter {
            text: "beta".to_string(),
            ..Default::default()
        });
        assert_eq!(by_package.len(), 2);
    }

    #[test]
    fn test_summary_from_events_matches_tree() {
        let events = vec![
            finished(Action::Pass, "a", "TestOne", 0.1),
            finished(Action::Fail, "a", "TestTwo", 0.2),
            finished(Action::Skip, "b", "TestThree", 0.0),
            finished(Action::Fail, "a", "", 0.4),
            finished(Action::Pass, "b", "", 0.1),
        ];

        let mut forest = ResultForest::new();
        let mut recorded = RunSummary::default();
        for event in &events {
            forest.apply(event);
            recorded.record(event);
        }

        let derived = RunSummary::from_forest(&forest);
        assert_eq!(recorded, derived);
        assert_eq!(derived.total, 3);
        assert_eq!(derived.failed, 1);
        assert_eq!(derived.duration, Duration::from_millis(500));

        let mut merged = RunSummary::default();
        merged.merge(&recorded);
        merged.merge(&recorded);
        assert_eq!(merged.total, 6);
        assert!((recorded.pass_rate() - 50.0).abs() < f64::EPSILON);
    }
}
