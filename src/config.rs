use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::editor::Editor;
use crate::scheduler::default_workers;
use crate::test_runner::{RunFlags, Tool};
use crate::watcher::WatchConfig;

pub const CONFIG_FILE: &str = "testpulse.toml";
pub const DEFAULT_TIMEOUT: &str = "2m";

/// Optional project file, `testpulse.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub tool: ToolSection,
    pub watch: WatchSection,
    pub run: RunSection,
    pub editor: EditorSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolSection {
    /// Test tool binary (default: go)
    pub program: Option<String>,
    /// Arguments placed before the generated ones
    pub args: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchSection {
    pub patterns: Vec<String>,
    pub skip_dirs: Vec<String>,
    pub dedup_ms: Option<u64>,
    pub quiet_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunSection {
    pub max_workers: Option<usize>,
    pub timeout: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EditorSection {
    pub command: Option<String>,
    /// Template with `{file}` and `{line}` placeholders
    pub args: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Load `explicit` if given, else `testpulse.toml` in `dir` if present.
    pub fn discover(dir: &Path, explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => {
                let path = dir.join(CONFIG_FILE);
                if path.is_file() {
                    Self::load(&path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }
}

/// Values given on the command line. Unset fields fall back to the file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub watch: bool,
    pub cover: bool,
    pub cover_profile: Option<PathBuf>,
    pub race: bool,
    pub short: bool,
    pub timeout: Option<String>,
    pub tags: Vec<String>,
    pub editor: Option<String>,
    pub editor_args: Option<String>,
    pub parallel: Option<usize>,
    pub test_parallel: Option<usize>,
    pub debug: bool,
    pub packages: Vec<String>,
}

/// Fully resolved settings for a session.
#[derive(Debug, Clone)]
pub struct Settings {
    pub work_dir: PathBuf,
    pub tool: Tool,
    pub packages: Vec<String>,
    pub flags: RunFlags,
    pub max_workers: usize,
    pub watch: WatchConfig,
    pub watch_on_start: bool,
    pub editor: Editor,
    pub debug: bool,
}

impl Settings {
    /// Merge built-in defaults, the project file and the command line, in
    /// increasing priority. `env_editor` is the value of `$EDITOR`.
    pub fn resolve(
        work_dir: &Path,
        file: FileConfig,
        cli: Overrides,
        env_editor: Option<String>,
    ) -> Result<Self> {
        let timeout = cli
            .timeout
            .or(file.run.timeout)
            .unwrap_or_else(|| DEFAULT_TIMEOUT.to_string());
        let timeout = parse_go_duration(&timeout)
            .with_context(|| format!("Invalid timeout: {timeout}"))?;

        let tool = Tool::new(file.tool.program.unwrap_or_else(|| Tool::default().program))
            .with_leading_args(file.tool.args);

        let mut watch = WatchConfig::default();
        if !file.watch.patterns.is_empty() {
            watch.patterns = file
                .watch
                .patterns
                .iter()
                .map(|p| {
                    glob::Pattern::new(p).with_context(|| format!("Invalid watch pattern: {p}"))
                })
                .collect::<Result<_>>()?;
        }
        if !file.watch.skip_dirs.is_empty() {
            watch.skip_dirs = file.watch.skip_dirs;
        }
        if let Some(ms) = file.watch.dedup_ms {
            watch.dedup = Duration::from_millis(ms);
        }
        if let Some(ms) = file.watch.quiet_ms {
            watch.quiet = Duration::from_millis(ms);
        }

        let editor = Editor::resolve(
            cli.editor.or(file.editor.command),
            cli.editor_args.or(file.editor.args),
            env_editor,
        );

        let max_workers = cli
            .parallel
            .or(file.run.max_workers)
            .filter(|n| *n > 0)
            .unwrap_or_else(default_workers);

        Ok(Self {
            work_dir: work_dir.to_path_buf(),
            tool,
            packages: cli.packages,
            flags: RunFlags {
                race: cli.race,
                cover: cli.cover || cli.cover_profile.is_some(),
                cover_profile: cli.cover_profile,
                short: cli.short,
                timeout: Some(timeout),
                tags: cli.tags,
                parallel: cli.test_parallel,
            },
            max_workers,
            watch,
            watch_on_start: cli.watch,
            editor,
            debug: cli.debug,
        })
    }
}

/// Parse a Go-style duration such as `90s`, `2m`, `1h30m` or `1.5s`.
pub fn parse_go_duration(input: &str) -> Result<Duration> {
    let input = input.trim();
    if input == "0" {
        return Ok(Duration::ZERO);
    }
    if input.is_empty() {
        anyhow::bail!("empty duration");
    }

    let mut total = 0f64;
    let mut rest = input;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            anyhow::bail!("expected a number in {input:?}");
        }
        let value: f64 = rest[..number_len]
            .parse()
            .with_context(|| format!("bad number in {input:?}"))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "" => anyhow::bail!("missing unit in {input:?}"),
            unit => anyhow::bail!("unknown unit {unit:?} in {input:?}"),
        };
        rest = &rest[unit_len..];
        total += value * nanos_per_unit;
    }

    Ok(Duration::from_nanos(total.round() as u64))
}
