//! Test runner module
//!
//! Builds one `go test -json` invocation, starts it, and streams both of its
//! output pipes through the decoder while the process is still running.
//! Standard output carries the event protocol; standard error is forwarded
//! as plain `output` events. Both land on the same channel in arrival order.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::decoder::{DecodeStats, Decoder};
use crate::error::RunError;
use crate::event::TestEvent;

/// Pattern used when no package is named.
pub const ALL_PACKAGES: &str = "./...";

/// Tool flags that apply to every package of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunFlags {
    pub race: bool,
    pub cover: bool,
    pub cover_profile: Option<PathBuf>,
    pub short: bool,
    pub timeout: Option<Duration>,
    pub tags: Vec<String>,
    /// Value for the tool's own `-parallel` flag.
    pub parallel: Option<usize>,
}

/// One immutable request to run tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunRequest {
    /// Empty means the whole module.
    pub packages: BTreeSet<String>,
    pub run_regex: Option<String>,
    pub flags: RunFlags,
}

impl RunRequest {
    pub fn new<I, S>(packages: I, flags: RunFlags) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            packages: packages.into_iter().map(Into::into).collect(),
            run_regex: None,
            flags,
        }
    }

    pub fn with_regex(mut self, regex: Option<String>) -> Self {
        self.run_regex = regex.filter(|r| !r.is_empty());
        self
    }

    /// Same filter and flags, scoped to one package.
    pub fn for_package(&self, package: &str) -> Self {
        Self {
            packages: BTreeSet::from([package.to_string()]),
            run_regex: self.run_regex.clone(),
            flags: self.flags.clone(),
        }
    }

    /// The package a run is attributed to when it targets exactly one.
    pub fn single_package(&self) -> Option<&str> {
        if self.packages.len() == 1 {
            self.packages.iter().next().map(String::as_str)
        } else {
            None
        }
    }

    /// Short human description for status lines.
    pub fn describe(&self) -> String {
        let target = match self.packages.len() {
            0 => ALL_PACKAGES.to_string(),
            1 => self.packages.iter().next().cloned().unwrap_or_default(),
            n => format!("{n} packages"),
        };
        match &self.run_regex {
            Some(regex) => format!("{target} -run {regex}"),
            None => target,
        }
    }
}

/// Render a duration the way the Go tool parses it.
pub fn go_duration(d: Duration) -> String {
    let nanos = d.subsec_nanos();
    if nanos == 0 {
        format!("{}s", d.as_secs())
    } else if nanos % 1_000_000 == 0 {
        format!("{}ms", d.as_millis())
    } else if nanos % 1_000 == 0 {
        format!("{}us", d.as_micros())
    } else {
        format!("{}ns", d.as_nanos())
    }
}

/// Build the argument list for one invocation.
///
/// Order is fixed: base flags, `-run`, `-race`, `-cover`, `-short`,
/// `-timeout`, `-tags`, `-parallel`, then the target packages.
pub fn build_args(request: &RunRequest) -> Vec<String> {
    let mut args = vec!["test".to_string(), "-json".to_string()];
    let flags = &request.flags;

    if let Some(ref regex) = request.run_regex {
        args.push("-run".to_string());
        args.push(regex.clone());
    }

    if flags.race {
        args.push("-race".to_string());
    }

    if flags.cover {
        args.push("-cover".to_string());
        if let Some(ref profile) = flags.cover_profile {
            args.push(format!("-coverprofile={}", profile.display()));
        }
    }

    if flags.short {
        args.push("-short".to_string());
    }

    if let Some(timeout) = flags.timeout {
        args.push("-timeout".to_string());
        args.push(go_duration(timeout));
    }

    if !flags.tags.is_empty() {
        args.push("-tags".to_string());
        args.push(flags.tags.join(","));
    }

    if let Some(parallel) = flags.parallel.filter(|p| *p > 0) {
        args.push(format!("-parallel={parallel}"));
    }

    if request.packages.is_empty() {
        args.push(ALL_PACKAGES.to_string());
    } else {
        args.extend(request.packages.iter().cloned());
    }

    args
}

/// How a process run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The process exited on its own. A non-zero code from failing tests
    /// lands here rather than in [`RunError`].
    Completed {
        exit_code: Option<i32>,
        stats: DecodeStats,
    },
    /// Cancelled before the process finished; it was killed.
    Cancelled,
}

impl RunOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RunOutcome::Cancelled)
    }
}

/// The external tool binary plus any arguments that precede the generated
/// ones (for wrapper scripts).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tool {
    pub program: String,
    pub leading_args: Vec<String>,
}

impl Tool {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    pub fn with_leading_args(mut self, args: Vec<String>) -> Self {
        self.leading_args = args;
        self
    }

    /// Command with the leading arguments applied, run in `dir`.
    pub fn command(&self, dir: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.leading_args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }
}

impl Default for Tool {
    fn default() -> Self {
        Self::new("go")
    }
}

/// Runs the external test tool
#[derive(Debug, Clone)]
pub struct TestRunner {
    tool: Tool,
    work_dir: PathBuf,
}

impl TestRunner {
    pub fn new(tool: Tool, work_dir: &Path) -> Self {
        Self {
            tool,
            work_dir: work_dir.to_path_buf(),
        }
    }

    pub fn tool(&self) -> &Tool {
        &self.tool
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Run one invocation, sending decoded events to `events`.
    pub async fn run(
        &self,
        request: &RunRequest,
        events: mpsc::Sender<TestEvent>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, RunError> {
        let args = build_args(request);
        info!(program = %self.tool.program, args = %args.join(" "), "running tests");

        let mut child = self
            .tool
            .command(&self.work_dir)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| RunError::Spawn {
                program: self.tool.program.clone(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or(RunError::Pipe { stream: "stdout" })?;
        let stderr = child.stderr.take().ok_or(RunError::Pipe { stream: "stderr" })?;

        let package = request.single_package().map(str::to_string);
        supervise(&mut child, stdout, stderr, package, events, cancel).await
    }
}

/// Stream both outputs of a started process, then wait for it to exit.
///
/// The process is killed when `cancel` fires or either stream fails.
async fn supervise<O, E>(
    child: &mut Child,
    stdout: O,
    stderr: E,
    package: Option<String>,
    events: mpsc::Sender<TestEvent>,
    cancel: CancellationToken,
) -> Result<RunOutcome, RunError>
where
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
{
    let streams = cancel.child_token();
    let mut out_task = tokio::spawn(Decoder::stdout().with_package(package.clone()).decode(
        stdout,
        events.clone(),
        streams.clone(),
    ));
    let mut err_task = tokio::spawn(Decoder::stderr().with_package(package).decode(
        stderr,
        events,
        streams.clone(),
    ));

    let decoded = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        res = async {
            tokio::try_join!(
                join_decoder(&mut out_task, "stdout"),
                join_decoder(&mut err_task, "stderr"),
            )
        } => Some(res),
    };

    let stats = match decoded {
        None => {
            debug!("test run cancelled while streaming");
            stop(child, &streams, [out_task, err_task]).await;
            return Ok(RunOutcome::Cancelled);
        }
        Some(Err(err)) => {
            warn!(error = %err, "test output stream failed");
            stop(child, &streams, [out_task, err_task]).await;
            return Err(err);
        }
        Some(Ok((out, err))) => DecodeStats {
            decoded: out.decoded + err.decoded,
            synthetic: out.synthetic + err.synthetic,
        },
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            stop(child, &streams, [out_task, err_task]).await;
            Ok(RunOutcome::Cancelled)
        }
        status = child.wait() => {
            let status = status.map_err(RunError::Wait)?;
            debug!(exit_code = ?status.code(), "test process exited");
            Ok(RunOutcome::Completed {
                exit_code: status.code(),
                stats,
            })
        }
    }
}

async fn join_decoder(
    handle: &mut JoinHandle<Result<DecodeStats, RunError>>,
    stream: &'static str,
) -> Result<DecodeStats, RunError> {
    match handle.await {
        Ok(result) => result,
        Err(err) => Err(RunError::Stream {
            stream,
            source: io::Error::new(io::ErrorKind::Other, err),
        }),
    }
}

/// Kill the process and stop both readers.
async fn stop(
    child: &mut Child,
    streams: &CancellationToken,
    readers: [JoinHandle<Result<DecodeStats, RunError>>; 2],
) {
    streams.cancel();
    if let Err(err) = child.kill().await {
        warn!(error = %err, "failed to kill test process");
    }
    for reader in readers {
        reader.abort();
    }
}
