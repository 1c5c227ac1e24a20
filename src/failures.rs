//! Failure set store
//!
//! Remembers which tests failed in the most recent run so they can be rerun
//! on their own. The set is persisted as JSON in the per-user cache
//! directory:
//!
//! ```json
//! {"items": {"example.com/m/pkg": {"TestX": {}}}}
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info, warn};

use crate::error::PersistError;
use crate::event::{Action, TestEvent};
use crate::test_runner::{RunFlags, RunRequest};

const CACHE_DIR: &str = "testpulse";
const FILE_NAME: &str = "last_failed.json";

/// Empty object standing in for set membership.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Member {}

type Items = BTreeMap<String, BTreeMap<String, Member>>;

fn null_as_empty<'de, D>(deserializer: D) -> Result<Items, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Items>::deserialize(deserializer)?.unwrap_or_default())
}

/// Package to failed test names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSet {
    #[serde(default, deserialize_with = "null_as_empty")]
    items: Items,
}

impl FailureSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, package: &str, test: &str) {
        self.items
            .entry(package.to_string())
            .or_default()
            .insert(test.to_string(), Member {});
    }

    /// Record a `fail` event for a test.
    ///
    /// Subtests are recorded under their top-level test: the tool splits
    /// `-run` patterns on '/', so only top-level names are usable in the
    /// retry regex. A failing subtest always fails its parent anyway.
    pub fn record_event(&mut self, event: &TestEvent) -> bool {
        if event.action != Action::Fail || event.package.is_empty() {
            return false;
        }
        match event.test_path().next() {
            Some(top) => {
                self.record(&event.package, top);
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.values().all(|names| names.is_empty())
    }

    /// Number of (package, test) pairs.
    pub fn len(&self) -> usize {
        self.items.values().map(BTreeMap::len).sum()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn packages(&self) -> BTreeSet<String> {
        self.items
            .iter()
            .filter(|(_, names)| !names.is_empty())
            .map(|(pkg, _)| pkg.clone())
            .collect()
    }

    pub fn names_in(&self, package: &str) -> Vec<&str> {
        self.items
            .get(package)
            .map(|names| names.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// All failed names across packages, deduplicated.
    pub fn names(&self) -> BTreeSet<&str> {
        self.items
            .values()
            .flat_map(|names| names.keys().map(String::as_str))
            .collect()
    }

    /// Request that reruns exactly the failed tests.
    ///
    /// One regex covers every package, so a name that failed in one package
    /// also selects a same-named test in another listed package.
    pub fn retry_request(&self, flags: RunFlags) -> Option<RunRequest> {
        let regex = build_run_regex(self.names())?;
        Some(RunRequest::new(self.packages(), flags).with_regex(Some(regex)))
    }

    /// Overwrite `path` with this set.
    pub fn save_to(&self, path: &Path) -> Result<(), PersistError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| PersistError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| PersistError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, json).map_err(|source| PersistError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load from `path`; a missing file is an empty set.
    pub fn load_from(path: &Path) -> Result<Self, PersistError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(PersistError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&content).map_err(|source| PersistError::Json {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Anchored alternation of escaped literal names, `None` if empty.
pub fn build_run_regex<'a, I>(names: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let escaped: Vec<String> = names.into_iter().map(regex::escape).collect();
    if escaped.is_empty() {
        None
    } else {
        Some(format!("^({})$", escaped.join("|")))
    }
}

/// Location of the persisted set.
pub fn default_path() -> Result<PathBuf, PersistError> {
    dirs::cache_dir()
        .map(|dir| dir.join(CACHE_DIR).join(FILE_NAME))
        .ok_or(PersistError::NoCacheDir)
}

/// In-memory failure set backed by a file.
#[derive(Debug, Default)]
pub struct FailureStore {
    current: FailureSet,
    path: Option<PathBuf>,
}

impl FailureStore {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            current: FailureSet::new(),
            path,
        }
    }

    /// Store at the per-user cache location, in memory only if there is none.
    pub fn at_default_location() -> Self {
        let path = match default_path() {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(error = %err, "failure set will not be persisted");
                None
            }
        };
        Self::new(path)
    }

    pub fn current(&self) -> &FailureSet {
        &self.current
    }

    /// Forget the previous run's failures.
    pub fn begin_run(&mut self) {
        self.current.clear();
    }

    pub fn record(&mut self, event: &TestEvent) -> bool {
        self.current.record_event(event)
    }

    /// Write the current set, replacing the previous file.
    pub fn persist(&self) -> Result<(), PersistError> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        self.current.save_to(path)?;
        debug!(path = %path.display(), failures = self.current.len(), "saved failure set");
        Ok(())
    }

    /// Retry request for the last failures, loading the file if nothing
    /// failed in this session yet.
    pub fn retry_request(&mut self, flags: RunFlags) -> Option<RunRequest> {
        if self.current.is_empty() {
            if let Some(ref path) = self.path {
                match FailureSet::load_from(path) {
                    Ok(set) => {
                        info!(path = %path.display(), failures = set.len(), "loaded failure set");
                        self.current = set;
                    }
                    Err(err) => warn!(error = %err, "ignoring unreadable failure set"),
                }
            }
        }
        self.current.retry_request(flags)
    }
}
