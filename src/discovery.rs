//! Test discovery module
//!
//! Finds packages that contain tests with `go list -json`, then asks the
//! tool for each package's top-level test names with `go test -list`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use futures::stream::{self, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::DiscoveryError;
use crate::test_runner::{Tool, ALL_PACKAGES};

/// Concurrent `go test -list` invocations.
const LIST_CONCURRENCY: usize = 4;

/// A package with at least one test file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub import_path: String,
    pub dir: PathBuf,
    pub name: String,
    /// Top-level test, example and fuzz names.
    pub tests: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GoListEntry {
    import_path: String,
    #[serde(default)]
    dir: PathBuf,
    #[serde(default)]
    name: String,
    #[serde(default)]
    test_go_files: Vec<String>,
    #[serde(default)]
    x_test_go_files: Vec<String>,
}

impl GoListEntry {
    fn has_tests(&self) -> bool {
        !self.test_go_files.is_empty() || !self.x_test_go_files.is_empty()
    }
}

/// Parse the concatenated JSON objects printed by `go list -json`.
pub fn parse_package_list(output: &str) -> Result<Vec<Package>, DiscoveryError> {
    let mut packages = Vec::new();
    for entry in serde_json::Deserializer::from_str(output).into_iter::<GoListEntry>() {
        let entry = entry?;
        if !entry.has_tests() {
            debug!(package = %entry.import_path, "package has no test files");
            continue;
        }
        packages.push(Package {
            import_path: entry.import_path,
            dir: entry.dir,
            name: entry.name,
            tests: Vec::new(),
        });
    }
    Ok(packages)
}

fn is_test_name(line: &str) -> bool {
    ["Test", "Example", "Fuzz"].iter().any(|prefix| {
        line.strip_prefix(prefix)
            .map(|rest| {
                !rest.is_empty() && rest.chars().all(|c| c.is_alphanumeric() || c == '_')
            })
            .unwrap_or(false)
    })
}

/// Parse the output of `go test -list .`
///
/// Output format:
/// ```text
/// TestAdd
/// ExampleAdd
/// ok  	example.com/m/calc	0.002s
/// ```
pub fn parse_test_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| is_test_name(line))
        .map(str::to_string)
        .collect()
}

async fn run_tool(tool: &Tool, dir: &Path, args: &[&str]) -> Result<String, DiscoveryError> {
    let output = tool
        .command(dir)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|source| DiscoveryError::Spawn {
            program: tool.program.clone(),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(DiscoveryError::Failed { stderr });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// List packages with tests matching `patterns` (default: the whole module).
pub async fn list_packages(
    tool: &Tool,
    dir: &Path,
    patterns: &[String],
) -> Result<Vec<Package>, DiscoveryError> {
    let mut args = vec!["list", "-json"];
    if patterns.is_empty() {
        args.push(ALL_PACKAGES);
    } else {
        args.extend(patterns.iter().map(String::as_str));
    }

    let output = run_tool(tool, dir, &args).await?;
    parse_package_list(&output)
}

/// Top-level test names of one package. Failures yield an empty list.
pub async fn list_tests(tool: &Tool, dir: &Path, import_path: &str) -> Vec<String> {
    match run_tool(tool, dir, &["test", "-list", ".", import_path]).await {
        Ok(output) => parse_test_list(&output),
        Err(err) => {
            warn!(package = import_path, error = %err, "failed to list tests");
            Vec::new()
        }
    }
}

/// Discover all test packages and their tests.
pub async fn discover(
    tool: &Tool,
    dir: &Path,
    patterns: &[String],
) -> Result<Vec<Package>, DiscoveryError> {
    let packages = list_packages(tool, dir, patterns).await?;

    let packages: Vec<Package> = stream::iter(packages)
        .map(|mut package| async move {
            package.tests = list_tests(tool, dir, &package.import_path).await;
            package
        })
        .buffered(LIST_CONCURRENCY)
        .collect()
        .await;

    let tests: usize = packages.iter().map(|p| p.tests.len()).sum();
    info!(packages = packages.len(), tests, "discovered tests");
    Ok(packages)
}
